//! Scoped working-copy mutations with guaranteed rollback.
//!
//! Each scope takes the body as a future, runs it, and always runs its
//! cleanup afterwards, whether the body succeeded or failed. A body error
//! propagates unchanged; a cleanup error is logged and only surfaces when
//! the body itself succeeded. Rust has no async destructors, and §5-style
//! mid-task cancellation is not part of the worker model, so an explicit
//! wrapper is the whole story.

use std::{fmt::Display, future::Future};

use tracing::{debug, error};

use super::{git_cli::GitCliError, workspace::WorkingCopy};

/// Run `body` on a temporary branch cut from the mainline tip.
///
/// Entry best-effort deletes any leftover branch of the same name, then
/// creates `branch` from `origin/{mainline}` and checks it out. Exit
/// returns the working copy to the mainline branch and force-deletes the
/// temporary branch.
pub async fn with_temporary_branch<T, E, Fut>(
    wc: &WorkingCopy,
    branch: &str,
    body: Fut,
) -> Result<T, E>
where
    Fut: Future<Output = Result<T, E>>,
    E: From<GitCliError> + Display,
{
    if let Err(err) = wc.delete_branch(branch).await {
        debug!("no leftover branch {branch} to delete: {err}");
    }
    wc.create_branch_from(branch, &wc.mainline_ref())
        .await
        .map_err(E::from)?;

    let result = body.await;
    let cleanup = teardown_branch(wc, branch).await.map_err(E::from);
    join_scope_results(result, cleanup)
}

async fn teardown_branch(wc: &WorkingCopy, branch: &str) -> Result<(), GitCliError> {
    // Move off the branch so it can be deleted.
    wc.checkout(wc.main_branch()).await?;
    wc.delete_branch(branch).await?;
    Ok(())
}

/// Run `body` with the working copy rolled back to the commit `branch`
/// pointed at on entry, however the body exits. The rollback hard-resets
/// and re-synchronizes submodules.
pub async fn with_trial_merge<T, E, Fut>(wc: &WorkingCopy, branch: &str, body: Fut) -> Result<T, E>
where
    Fut: Future<Output = Result<T, E>>,
    E: From<GitCliError> + Display,
{
    let starting_ref = wc.rev_parse(branch).await.map_err(E::from)?;

    let result = body.await;
    let cleanup = wc.reset_to(&starting_ref).await.map_err(E::from);
    join_scope_results(result, cleanup)
}

fn join_scope_results<T, E: Display>(body: Result<T, E>, cleanup: Result<(), E>) -> Result<T, E> {
    match (body, cleanup) {
        (Ok(value), Ok(())) => Ok(value),
        (Ok(_), Err(cleanup_err)) => Err(cleanup_err),
        (Err(body_err), Ok(())) => Err(body_err),
        (Err(body_err), Err(cleanup_err)) => {
            error!("scope cleanup failed after body error: {cleanup_err}");
            Err(body_err)
        }
    }
}
