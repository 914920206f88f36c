//! Continuous reconciliation of stored revisions against upstream tips.
//!
//! Active requests are re-sampled in a rolling loop; when a branch moves
//! the stored revision is refreshed, the owner is notified, and the
//! affected verification / conflict checks are re-enqueued.

use std::time::Duration;

use anyhow::anyhow;
use askama::Template;
use db::models::{
    push::Push,
    request::{Request, RequestChanges},
};
use tracing::{error, info};

use super::{
    engine::{Engine, Task},
    notify::BranchMovedEmail,
};

/// Placeholder tip for a branch that has vanished upstream.
pub const ZERO_SHA: &str = "0000000000000000000000000000000000000000";

pub struct BranchPoller {
    engine: Engine,
    cycle_delay: Duration,
    per_request_delay: Duration,
}

impl BranchPoller {
    pub fn new(engine: Engine) -> Self {
        Self {
            engine,
            cycle_delay: Duration::from_secs(1),
            // Try not to hammer the upstream server.
            per_request_delay: Duration::from_millis(40),
        }
    }

    pub async fn run(self) {
        info!("starting branch tip reconciliation poller");
        loop {
            tokio::time::sleep(self.cycle_delay).await;
            let requests = match Request::find_active(self.engine.pool()).await {
                Ok(requests) => requests,
                Err(err) => {
                    error!("failed to enumerate active requests: {err}");
                    continue;
                }
            };
            for req in requests {
                tokio::time::sleep(self.per_request_delay).await;
                if let Err(err) = self.reconcile(&req).await {
                    error!("reconciliation error for request {}: {err:#}", req.id);
                }
            }
        }
    }

    /// One reconciliation step for one request: sample the tip and, when
    /// it moved, refresh the store, notify, and re-trigger checks.
    pub async fn reconcile(&self, req: &Request) -> anyhow::Result<()> {
        let sha = self
            .engine
            .sample_branch_tip(req, false)
            .await
            .unwrap_or_else(|| ZERO_SHA.to_string());

        if self.engine.excluded_from_verification(req) {
            return Ok(());
        }
        if req.branch.is_empty() || req.revision.is_empty() || sha == req.revision {
            return Ok(());
        }

        info!(
            "updating request {} ({}) sha from {} to {}",
            req.id, req.title, req.revision, sha
        );
        let changes = RequestChanges {
            revision: Some(sha.clone()),
            ..Default::default()
        };
        Request::update(self.engine.pool(), req.id, changes)
            .await
            .ok_or_else(|| {
                anyhow!(
                    "failed to update request {} sha from {} to {}",
                    req.id,
                    req.revision,
                    sha
                )
            })?;

        self.notify_branch_moved(req, &sha).await?;

        let base_url = self.engine.settings().base_url();
        self.engine.enqueue(Task::verify(req.id, base_url.as_str()));

        if req.state.is_pickme() {
            if req.tags.contains("no-conflicts") || req.tags.contains("conflict-master") {
                // Only this branch needs re-checking; anything it newly
                // breaks becomes a conflict-pickme and is caught normally.
                self.engine
                    .enqueue(Task::test_one(req.id, base_url.as_str(), true));
            } else if req.tags.contains("conflict-pickme") {
                // The move might resolve conflicts between this branch and
                // others, so every conflicting member gets re-checked.
                if let Some(push_id) = Push::for_request(self.engine.pool(), req.id).await? {
                    self.engine
                        .enqueue(Task::test_conflicting(push_id, base_url.as_str()));
                }
            }
        }
        Ok(())
    }

    async fn notify_branch_moved(&self, req: &Request, new_sha: &str) -> anyhow::Result<()> {
        let body = BranchMovedEmail {
            user: &req.user,
            title: &req.title,
            repo: &req.repo,
            branch: &req.branch,
            old_revision: &req.revision,
            new_revision: new_sha,
        }
        .render()?;
        let subject = format!("[push] {} - {}", req.user, req.title);
        self.engine
            .notifier()
            .enqueue_user_email(&[req.user.clone()], &body, &subject)
            .await;
        Ok(())
    }
}
