//! Submodule sanity checks run after a trial merge.
//!
//! A merged branch may move submodule pointers; before a request is
//! declared mergeable each changed submodule must exist upstream, be
//! pushed, and advance the previously recorded commit as a fast-forward.

use std::collections::HashMap;

use thiserror::Error;
use tracing::{info, warn};

use super::{
    git_cli::{GitCliError, RunOpts},
    workspace::WorkingCopy,
};

#[derive(Debug, Error)]
pub enum SubmoduleError {
    #[error("submodule error: {name} has not been pushed to its mainline")]
    NotPushed { name: String },
    #[error("submodule error: {name} is not a fast forward of {old_sha}")]
    NotFastForward { name: String, old_sha: String },
    #[error(transparent)]
    Git(#[from] GitCliError),
}

/// Check every submodule the current checkout changed.
///
/// `git submodule status` lines starting with `-` or `+` mark a submodule
/// whose checked-out commit differs from the superproject's record. For
/// each of those: update it with `--init`, fetch its remote, and verify it
/// against the SHA recorded before any mutation.
pub async fn validate_changed_submodules(wc: &WorkingCopy) -> Result<(), SubmoduleError> {
    let opts = RunOpts::in_dir(wc.path());
    let status = wc.git().run(["submodule", "status"], &opts).await?;
    let status = status.stdout.trim().to_string();
    if status.is_empty() {
        // No submodules at all.
        return Ok(());
    }

    let mut changed: Vec<String> = Vec::new();
    for line in status.lines() {
        match parse_status_line(line) {
            Some(('-', path)) | Some(('+', path)) => changed.push(path.to_string()),
            Some(_) => {}
            None => warn!("failed to unpack submodule status line: {line}"),
        }
    }
    if changed.is_empty() {
        return Ok(());
    }
    info!("submodules touched in this branch: {}", changed.join(" "));

    // Capture the currently checked-out SHAs before update/fetch move them.
    let old_shas = recorded_shas(wc).await?;

    wc.git()
        .run(["submodule", "--quiet", "sync"], &opts)
        .await?;

    for name in &changed {
        wc.git()
            .run(["submodule", "update", "--init", name.as_str()], &opts)
            .await?;
        let detached = RunOpts::in_dir(wc.path()).with_git_dir(format!("{name}/.git"));
        wc.git().run(["fetch"], &detached).await?;
    }

    for name in &changed {
        check_submodule(wc, name, old_shas.get(name.as_str()).map(String::as_str)).await?;
    }
    Ok(())
}

async fn check_submodule(
    wc: &WorkingCopy,
    name: &str,
    old_sha: Option<&str>,
) -> Result<(), SubmoduleError> {
    if !has_mainline_branch(wc, name).await? {
        // Nothing to compare against; skip the remaining checks.
        return Ok(());
    }
    if !head_is_pushed(wc, name).await? {
        return Err(SubmoduleError::NotPushed {
            name: name.to_string(),
        });
    }
    if let Some(old_sha) = old_sha
        && !is_fast_forward(wc, name, old_sha).await?
    {
        return Err(SubmoduleError::NotFastForward {
            name: name.to_string(),
            old_sha: old_sha.to_string(),
        });
    }
    Ok(())
}

async fn has_mainline_branch(wc: &WorkingCopy, name: &str) -> Result<bool, GitCliError> {
    let opts = RunOpts::in_dir(wc.path().join(name));
    let out = wc.git().run(["branch", "-r"], &opts).await?;
    Ok(out.stdout.contains(&format!("origin/{}", wc.main_branch())))
}

async fn head_is_pushed(wc: &WorkingCopy, name: &str) -> Result<bool, GitCliError> {
    let opts = RunOpts::in_dir(wc.path().join(name));
    let head = wc.git().run(["rev-parse", "HEAD"], &opts).await?;
    let out = wc
        .git()
        .run(["branch", "-r", "--contains", head.stdout.trim()], &opts)
        .await?;
    Ok(!out.stdout.trim().is_empty())
}

async fn is_fast_forward(
    wc: &WorkingCopy,
    name: &str,
    old_sha: &str,
) -> Result<bool, GitCliError> {
    let opts = RunOpts::in_dir(wc.path().join(name));
    let new_sha = wc.git().run(["rev-parse", "HEAD"], &opts).await?;
    let range = format!("{}..{}", new_sha.stdout.trim(), old_sha);
    let out = wc
        .git()
        .run(["rev-list", "-n1", range.as_str()], &opts)
        .await?;
    Ok(out.stdout.trim().is_empty())
}

/// `path` to short-SHA of every initialized submodule, as currently
/// checked out.
async fn recorded_shas(wc: &WorkingCopy) -> Result<HashMap<String, String>, GitCliError> {
    let out = wc
        .git()
        .run(
            [
                "submodule",
                "foreach",
                "--quiet",
                r#"printf '%s\t%s\n' "$path" "$(git rev-parse HEAD | cut -c-7)""#,
            ],
            &RunOpts::in_dir(wc.path()),
        )
        .await?;
    Ok(parse_recorded_shas(&out.stdout))
}

fn parse_recorded_shas(output: &str) -> HashMap<String, String> {
    let mut shas = HashMap::new();
    for line in output.lines() {
        if let Some((path, sha)) = line.split_once('\t') {
            shas.insert(path.to_string(), sha.trim().to_string());
        }
    }
    shas
}

/// Split a `git submodule status` line into its state marker and path.
/// Lines look like ` <sha> <path> (<describe>)`, with `-`, `+` or `U` in
/// column one for out-of-sync states.
fn parse_status_line(line: &str) -> Option<(char, &str)> {
    let marker = line.chars().next()?;
    let mut fields = line[1..].split_whitespace();
    let _sha = fields.next()?;
    let path = fields.next()?;
    Some((marker, path))
}
