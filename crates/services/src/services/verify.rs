//! Branch verification: confirm a request's branch exists upstream,
//! record its tip, and guard against duplicate submissions of the same
//! revision.

use askama::Template;
use db::models::request::{Request, RequestChanges, RequestState};
use thiserror::Error;
use tracing::error;

use super::{
    engine::Engine,
    git_cli::{GitCliError, RunOpts},
    notify::{
        BranchMissingEmail, UpstreamErrorEmail, VerifyFailureEmail, VerifySuccessEmail,
        review_text,
    },
};

#[derive(Debug, Error)]
pub enum VerifyError {
    #[error(transparent)]
    Store(#[from] sqlx::Error),
    #[error(transparent)]
    Template(#[from] askama::Error),
}

impl Engine {
    /// Some tags modify the workflow and exclude the request from
    /// repository verification entirely.
    pub fn excluded_from_verification(&self, req: &Request) -> bool {
        req.tags
            .overlaps(&self.settings().git.exclude_from_verification)
    }

    pub async fn verify_branch(&self, request_id: i64, base_url: &str) -> Result<(), VerifyError> {
        let pool = self.pool();
        let Some(req) = Request::find_by_id(pool, request_id).await? else {
            // Nothing more can be said without the row.
            error!("git queue worker received a job for non-existent request id {request_id}");
            return Ok(());
        };

        if self.excluded_from_verification(&req) {
            return Ok(());
        }

        if req.branch.is_empty() {
            let msg =
                format!("git queue worker received a job for request with no branch (id {request_id})");
            return self.verify_branch_failure(&req, &msg, base_url).await;
        }

        let Some(sha) = self.sample_branch_tip(&req, true).await else {
            let msg = format!(
                "git queue worker could not get the revision from request branch (id {request_id})"
            );
            return self.verify_branch_failure(&req, &msg, base_url).await;
        };

        if let Some(duplicate) = Request::find_by_revision(pool, &sha).await?
            && duplicate.id != req.id
            && duplicate.state != RequestState::Discarded
        {
            let msg = format!(
                "git queue worker found another request with the same revision sha (ids {} and {})",
                duplicate.id, req.id
            );
            return self.verify_branch_failure(&req, &msg, base_url).await;
        }

        let mut tags = req.tags.clone();
        tags.add("git-ok");
        tags.remove("git-error");
        let changes = RequestChanges {
            tags: Some(tags),
            revision: Some(sha),
            conflicts: None,
        };
        if let Some(updated) = Request::update(pool, req.id, changes).await {
            self.verify_branch_successful(&updated, base_url).await?;
        }
        Ok(())
    }

    async fn verify_branch_successful(
        &self,
        req: &Request,
        base_url: &str,
    ) -> Result<(), VerifyError> {
        let body = VerifySuccessEmail {
            user: &req.user,
            title: &req.title,
            repo: &req.repo,
            branch: &req.branch,
            id: req.id,
            revision: &req.revision,
            review: review_text(req.reviewid),
            base_url,
            reviewboard: &self.settings().reviewboard.servername,
        }
        .render()?;
        let subject = format!("[push] {} - {}", req.user, req.title);
        self.notifier()
            .enqueue_user_email(&[req.user.clone()], &body, &subject)
            .await;

        let id = req.id.to_string();
        let hooks = self.webhooks();
        hooks.associate("pushrequest", &id, "ref", &req.branch).await;
        hooks
            .associate("pushrequest", &id, "commit", &req.revision)
            .await;
        if let Some(reviewid) = req.reviewid {
            hooks
                .associate("pushrequest", &id, "review", &reviewid.to_string())
                .await;
        }
        Ok(())
    }

    async fn verify_branch_failure(
        &self,
        req: &Request,
        failure_msg: &str,
        base_url: &str,
    ) -> Result<(), VerifyError> {
        error!("{failure_msg}");
        let mut tags = req.tags.clone();
        tags.add("git-error");
        tags.remove("git-ok");
        let changes = RequestChanges {
            tags: Some(tags),
            ..Default::default()
        };
        Request::update(self.pool(), req.id, changes).await;

        let body = VerifyFailureEmail {
            user: &req.user,
            title: &req.title,
            repo: &req.repo,
            branch: &req.branch,
            id: req.id,
            revision: &req.revision,
            review: review_text(req.reviewid),
            failure_msg,
            base_url,
            reviewboard: &self.settings().reviewboard.servername,
        }
        .render()?;
        let subject = format!("[push] {} - {}", req.user, req.title);
        self.notifier()
            .enqueue_user_email(&[req.user.clone()], &body, &subject)
            .await;
        Ok(())
    }

    /// Resolve the tip of the request's branch with `ls-remote`. `None`
    /// means the branch could not be resolved; with `alert` set the
    /// request's user is mailed the reason. The poller suppresses the
    /// alert since it samples continuously.
    pub async fn sample_branch_tip(&self, req: &Request, alert: bool) -> Option<String> {
        let url = self.settings().git.repository_url(&req.repo);
        let listing = match self
            .git()
            .run(
                ["ls-remote", "-h", url.as_str(), req.branch.as_str()],
                &RunOpts::default(),
            )
            .await
        {
            Ok(out) => out.stdout,
            Err(err) => {
                let stderr = match &err {
                    GitCliError::CommandFailed { stderr, .. } => stderr.clone(),
                    other => other.to_string(),
                };
                if alert {
                    self.send_upstream_error(req, &stderr).await;
                }
                return None;
            }
        };

        if let Some(sha) = parse_ls_remote(&listing, &req.branch) {
            return Some(sha);
        }
        if alert {
            self.send_branch_missing(req).await;
        }
        None
    }

    async fn send_upstream_error(&self, req: &Request, stderr: &str) {
        let body = UpstreamErrorEmail {
            user: &req.user,
            title: &req.title,
            repo: &req.repo,
            branch: &req.branch,
            stderr,
        }
        .render();
        match body {
            Ok(body) => {
                let subject = format!("[push error] {} - {}", req.user, req.title);
                self.notifier()
                    .enqueue_user_email(&[req.user.clone()], &body, &subject)
                    .await;
            }
            Err(err) => error!("failed to render upstream error mail: {err}"),
        }
    }

    async fn send_branch_missing(&self, req: &Request) {
        let body = BranchMissingEmail {
            user: &req.user,
            title: &req.title,
            repo: &req.repo,
            branch: &req.branch,
        }
        .render();
        match body {
            Ok(body) => {
                let subject = format!("[push error] {} - {}", req.user, req.title);
                self.notifier()
                    .enqueue_user_email(&[req.user.clone()], &body, &subject)
                    .await;
            }
            Err(err) => error!("failed to render branch missing mail: {err}"),
        }
    }
}

/// Pick the SHA for `refs/heads/{branch}` out of `ls-remote` output
/// (whitespace-separated `sha ref` pairs).
fn parse_ls_remote(listing: &str, branch: &str) -> Option<String> {
    let want = format!("refs/heads/{branch}");
    let mut tokens = listing.split_whitespace();
    while let (Some(sha), Some(refname)) = (tokens.next(), tokens.next()) {
        if refname == want {
            return Some(sha.to_string());
        }
    }
    None
}
