//! Trial-merge conflict detection.
//!
//! A selected request ("pickme") is tested on a throwaway branch cut from
//! the mainline tip: first the request itself is merged (a failure means
//! it conflicts with mainline), then, with that merge still applied,
//! every other tested member of the same release is merged in turn inside
//! an inner rollback scope. All merges are trials; the working copy is
//! restored on every exit path.

use askama::Template;
use db::models::{
    push::Push,
    request::{Request, RequestChanges, RequestState},
};
use thiserror::Error;
use tracing::{error, warn};

use super::{
    engine::{Engine, Task},
    git_cli::{GitCliError, RunOpts},
    notify::{ConflictEmail, MasterConflictHtml, PeerConflictHtml, review_text},
    scopes::{with_temporary_branch, with_trial_merge},
    submodule::{SubmoduleError, validate_changed_submodules},
    workspace::{PrepareOpts, WorkingCopy},
};

#[derive(Debug, Error)]
pub enum ConflictError {
    #[error(transparent)]
    Git(#[from] GitCliError),
    #[error(transparent)]
    Submodule(#[from] SubmoduleError),
    #[error(transparent)]
    Store(#[from] sqlx::Error),
    #[error("failed to update request {0} in the store")]
    StoreUpdateFailed(i64),
    #[error(transparent)]
    Template(#[from] askama::Error),
}

/// A trial-merge failure reified as conflict evidence: the captured
/// output streams when the merge itself failed, or the submodule
/// validation message standing in for both.
fn conflict_capture(err: &ConflictError) -> Option<(String, String)> {
    match err {
        ConflictError::Git(GitCliError::CommandFailed { stdout, stderr, .. })
        | ConflictError::Submodule(SubmoduleError::Git(GitCliError::CommandFailed {
            stdout,
            stderr,
            ..
        })) => Some((stdout.clone(), stderr.clone())),
        ConflictError::Submodule(sub) => {
            let text = sub.to_string();
            Some((text.clone(), text))
        }
        _ => None,
    }
}

impl Engine {
    /// Test a request for conflicts against mainline and against the other
    /// members of its release.
    pub async fn test_conflicts(
        &self,
        worker_id: usize,
        request_id: i64,
        base_url: &str,
        requeue: bool,
    ) -> Result<(), ConflictError> {
        let pool = self.pool();
        let Some(req) = Request::find_by_id(pool, request_id).await? else {
            error!("conflict check requested for invalid request id {request_id}");
            return Ok(());
        };
        if !req.state.is_pickme() {
            return Ok(());
        }
        let Some(push_id) = Push::for_request(pool, request_id).await? else {
            error!(
                "request {} ({}) doesn't seem to be part of a push",
                request_id, req.title
            );
            return Ok(());
        };

        // Bring mainline up to date before cutting the test branch.
        let wc = self.working_copy(worker_id);
        let git = &self.settings().git;
        wc.prepare(
            &git.main_repository,
            &git.main_branch,
            PrepareOpts {
                fetch: true,
                checkout: true,
            },
        )
        .await?;

        let target_branch = format!("pickme_test_{push_id}_{request_id}");

        let Some(sha) = self.sample_branch_tip(&req, true).await else {
            return Ok(());
        };
        // Already merged upstream; nothing to test.
        if self.sha_exists_in_master(&wc, &sha).await? {
            return Ok(());
        }

        let req = self.clear_conflict_details(&req).await?;

        let conflicted = self
            .run_conflict_trials(&wc, &req, &target_branch, base_url, requeue)
            .await?;

        match conflicted {
            Some(updated) => self.notify_conflict(&updated, base_url).await?,
            None => self.mark_no_conflicts(request_id).await?,
        }
        Ok(())
    }

    /// Strip every conflict-related tag and blank the conflict details.
    async fn clear_conflict_details(&self, req: &Request) -> Result<Request, ConflictError> {
        let mut tags = req.tags.clone();
        tags.remove("conflict-master");
        tags.remove("conflict-pickme");
        tags.remove("no-conflicts");
        let changes = RequestChanges {
            tags: Some(tags),
            conflicts: Some(String::new()),
            revision: None,
        };
        Request::update(self.pool(), req.id, changes)
            .await
            .ok_or(ConflictError::StoreUpdateFailed(req.id))
    }

    /// The mainline trial, and on success the peer trials in the same
    /// merged state. `Some(updated)` means a conflict was recorded.
    async fn run_conflict_trials(
        &self,
        wc: &WorkingCopy,
        req: &Request,
        target_branch: &str,
        base_url: &str,
        requeue: bool,
    ) -> Result<Option<Request>, ConflictError> {
        wc.prepare(
            &req.repo,
            &req.branch,
            PrepareOpts {
                fetch: true,
                checkout: false,
            },
        )
        .await?;

        with_temporary_branch(wc, target_branch, async {
            with_trial_merge(wc, target_branch, async {
                if let Err(err) = self.merge_pickme(wc, req).await {
                    let Some((stdout, stderr)) = conflict_capture(&err) else {
                        return Err(err);
                    };
                    let updated = self.record_master_conflict(req, &stdout, &stderr).await?;
                    return Ok(Some(updated));
                }
                self.test_conflict_pickmes(wc, req, target_branch, base_url, requeue)
                    .await
            })
            .await
        })
        .await
    }

    async fn record_master_conflict(
        &self,
        req: &Request,
        stdout: &str,
        stderr: &str,
    ) -> Result<Request, ConflictError> {
        let mut tags = req.tags.clone();
        tags.add("conflict-master");
        tags.remove("no-conflicts");
        let conflicts = MasterConflictHtml {
            mainline: &self.settings().git.main_branch,
            stdout,
            stderr,
        }
        .render()?;
        let changes = RequestChanges {
            tags: Some(tags),
            conflicts: Some(conflicts),
            revision: None,
        };
        Request::update(self.pool(), req.id, changes)
            .await
            .ok_or(ConflictError::StoreUpdateFailed(req.id))
    }

    /// Trial-merge every other tested member of the release on top of the
    /// already-merged candidate.
    async fn test_conflict_pickmes(
        &self,
        wc: &WorkingCopy,
        req: &Request,
        target_branch: &str,
        base_url: &str,
        requeue: bool,
    ) -> Result<Option<Request>, ConflictError> {
        let pool = self.pool();
        let Some(push_id) = Push::for_request(pool, req.id).await? else {
            warn!(
                "couldn't test pickme {} - couldn't find corresponding push",
                req.id
            );
            return Ok(None);
        };
        let peer_ids: Vec<i64> = Push::request_ids(pool, push_id)
            .await?
            .into_iter()
            .filter(|id| *id != req.id)
            .collect();

        let mut conflict_pickmes: Vec<(i64, String, String)> = Vec::new();

        for peer_id in peer_ids {
            let Some(peer) = Request::find_by_id(pool, peer_id).await? else {
                error!("tried to test for conflicts against invalid request id {peer_id}");
                continue;
            };
            if !peer.state.is_pickme() {
                continue;
            }

            wc.prepare(
                &peer.repo,
                &peer.branch,
                PrepareOpts {
                    fetch: true,
                    checkout: false,
                },
            )
            .await?;

            // Peers already in mainline would only produce
            // nothing-to-commit noise.
            let Some(peer_sha) = self.sample_branch_tip(&peer, true).await else {
                continue;
            };
            if self.sha_exists_in_master(wc, &peer_sha).await? {
                continue;
            }

            // An untested peer may conflict with mainline itself, which
            // would read as a pickme conflict here. It gets tested against
            // us on its own turn.
            if !peer.tags.text_contains("conflict") {
                continue;
            }
            // Peers that break mainline conflict with everything by
            // construction.
            if peer.tags.contains("conflict-master") {
                continue;
            }

            let trial = with_trial_merge(wc, target_branch, async {
                self.merge_pickme(wc, &peer).await
            })
            .await;

            if let Err(err) = trial {
                let Some((stdout, stderr)) = conflict_capture(&err) else {
                    return Err(err);
                };
                if req.state == RequestState::Added && peer.state == RequestState::Pickme {
                    // The candidate was taken into the release earlier; the
                    // peer reports this conflict when its own check runs.
                    continue;
                }
                conflict_pickmes.push((peer_id, stdout, stderr));
                // Requeue the peer so it also picks up the conflict, with
                // requeueing disabled so two requests can't requeue each
                // other forever.
                if requeue && peer.state != RequestState::Added {
                    self.enqueue(Task::test_one(peer_id, base_url, false));
                }
            }
        }

        if conflict_pickmes.is_empty() {
            return Ok(None);
        }

        let mut formatted_conflicts = String::new();
        for (peer_id, stdout, stderr) in &conflict_pickmes {
            let peer_title = match Request::find_by_id(pool, *peer_id).await? {
                Some(peer) => peer.title,
                None => String::new(),
            };
            formatted_conflicts.push_str(
                &PeerConflictHtml {
                    peer_id: *peer_id,
                    peer_title: &peer_title,
                    stdout,
                    stderr,
                }
                .render()?,
            );
        }

        let mut tags = req.tags.clone();
        tags.add("conflict-pickme");
        tags.remove("no-conflicts");
        let changes = RequestChanges {
            tags: Some(tags),
            conflicts: Some(formatted_conflicts),
            revision: None,
        };
        let updated = Request::update(pool, req.id, changes)
            .await
            .ok_or(ConflictError::StoreUpdateFailed(req.id))?;
        Ok(Some(updated))
    }

    /// Mark a cleanly merging request, unless a concurrent check already
    /// recorded a conflict on it.
    async fn mark_no_conflicts(&self, request_id: i64) -> Result<(), ConflictError> {
        let Some(current) = Request::find_by_id(self.pool(), request_id).await? else {
            return Ok(());
        };
        if current.tags.text_contains("conflict") {
            return Ok(());
        }
        let mut tags = current.tags.clone();
        tags.add("no-conflicts");
        let changes = RequestChanges {
            tags: Some(tags),
            ..Default::default()
        };
        Request::update(self.pool(), request_id, changes)
            .await
            .ok_or(ConflictError::StoreUpdateFailed(request_id))?;
        Ok(())
    }

    /// Merge the request's branch onto the current branch: fetch it, pull
    /// with a forced merge commit, commit bypassing hooks, then validate
    /// any submodules the merge touched.
    pub(crate) async fn merge_pickme(
        &self,
        wc: &WorkingCopy,
        req: &Request,
    ) -> Result<(), ConflictError> {
        wc.prepare(
            &req.repo,
            &req.branch,
            PrepareOpts {
                fetch: true,
                checkout: false,
            },
        )
        .await?;

        let remote = wc.remote_for(&req.repo);
        let run_opts = RunOpts::in_dir(wc.path());
        wc.git()
            .run(
                [
                    "pull",
                    "--no-ff",
                    "--no-commit",
                    "--no-rebase",
                    remote.as_str(),
                    req.branch.as_str(),
                ],
                &run_opts,
            )
            .await?;

        let summary = format!(
            "{}\n\n(Merged from {}/{})",
            req.title, req.repo, req.branch
        );
        wc.git()
            .run(["commit", "-m", summary.as_str(), "--no-verify"], &run_opts)
            .await?;

        validate_changed_submodules(wc).await?;
        Ok(())
    }

    /// Check whether a commit is reachable from the mainline tip, going
    /// through the shared positive cache.
    pub async fn sha_exists_in_master(
        &self,
        wc: &WorkingCopy,
        sha: &str,
    ) -> Result<bool, ConflictError> {
        if self.master_shas().contains(sha) {
            return Ok(true);
        }
        let merge_base = match wc.merge_base(&wc.mainline_ref(), sha).await {
            Ok(merge_base) => merge_base,
            // An entirely unknown hash makes git fail with "not a valid
            // commit name".
            Err(GitCliError::CommandFailed { .. }) => return Ok(false),
            Err(err) => return Err(err.into()),
        };
        if merge_base == sha {
            self.master_shas().insert(sha);
            Ok(true)
        } else {
            Ok(false)
        }
    }

    /// Re-enqueue conflict checks for the members of a release, optionally
    /// only those currently marked as conflicting with a peer.
    pub async fn requeue_pickmes_for_push(
        &self,
        push_id: i64,
        base_url: &str,
        conflicting_only: bool,
    ) -> Result<(), ConflictError> {
        for request_id in Push::request_ids(self.pool(), push_id).await? {
            let Some(req) = Request::find_by_id(self.pool(), request_id).await? else {
                continue;
            };
            if conflicting_only && !req.tags.contains("conflict-pickme") {
                continue;
            }
            self.enqueue(Task::test_one(req.id, base_url, false));
        }
        Ok(())
    }

    async fn notify_conflict(&self, req: &Request, base_url: &str) -> Result<(), ConflictError> {
        let conflicts_with = if req.tags.contains("conflict-master") {
            self.settings().git.main_branch.as_str()
        } else {
            "another pickme"
        };
        let body = ConflictEmail {
            user: &req.user,
            title: &req.title,
            repo: &req.repo,
            branch: &req.branch,
            id: req.id,
            revision: &req.revision,
            review: review_text(req.reviewid),
            conflicts_with,
            conflicts: req.conflicts.replace('\n', "<br/>"),
            base_url,
            reviewboard: &self.settings().reviewboard.servername,
        }
        .render()?;
        let subject = format!("[push conflict] {} - {}", req.user, req.title);
        let recipients = [req.user.clone()];
        self.notifier()
            .enqueue_user_email(&recipients, &body, &subject)
            .await;

        let chat = format!(
            "pushgate has detected that your pickme for {} contains conflicts with {}\n{}/request?id={}",
            req.branch, conflicts_with, base_url, req.id
        );
        self.notifier().enqueue_user_chat(&recipients, &chat).await;
        Ok(())
    }
}
