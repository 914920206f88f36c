//! Thin adaptor over the `git` command-line tool.
//!
//! Every repository interaction in the engine goes through the CLI rather
//! than a bound library: trial merges and checkouts rely on the CLI's
//! working-tree safety semantics, and the submodule surface
//! (`status`/`sync`/`update`/`foreach`) has no complete library equivalent.
//! Invocations capture both output streams in full; a non-zero exit is
//! reported as [`GitCliError::CommandFailed`] carrying everything a caller
//! needs to render or match on. No retries, no timeouts.

use std::{path::PathBuf, process::Stdio};

use thiserror::Error;
use tokio::process::Command;
use tracing::error;
use utils::shell::resolve_executable_path;

/// Exit codes git returns from `remote add` when the remote already
/// exists: 128 from older versions that simply die(), 3 since the remote
/// subcommands grew dedicated exit codes.
pub const EXIT_REMOTE_EXISTS: &[i32] = &[3, 128];

#[derive(Debug, Error)]
pub enum GitCliError {
    #[error("git executable not found on PATH")]
    NotAvailable,
    #[error("failed to spawn git: {0}")]
    Spawn(#[from] std::io::Error),
    #[error("git {} exited with code {code}: {stderr}", args.join(" "))]
    CommandFailed {
        code: i32,
        stdout: String,
        stderr: String,
        args: Vec<String>,
    },
}

impl GitCliError {
    pub fn exit_code(&self) -> Option<i32> {
        match self {
            GitCliError::CommandFailed { code, .. } => Some(*code),
            _ => None,
        }
    }

    /// The captured output streams of a failed invocation.
    pub fn captured(&self) -> Option<(&str, &str)> {
        match self {
            GitCliError::CommandFailed { stdout, stderr, .. } => Some((stdout, stderr)),
            _ => None,
        }
    }
}

/// Captured result of a successful invocation.
#[derive(Debug, Clone)]
pub struct GitOutput {
    pub code: i32,
    pub stdout: String,
    pub stderr: String,
}

/// Invocation options: the working directory, and for detached submodule
/// operations an override of the repository metadata directory.
#[derive(Debug, Clone, Default)]
pub struct RunOpts {
    pub cwd: Option<PathBuf>,
    pub git_dir: Option<PathBuf>,
}

impl RunOpts {
    pub fn in_dir(dir: impl Into<PathBuf>) -> Self {
        Self {
            cwd: Some(dir.into()),
            git_dir: None,
        }
    }

    pub fn with_git_dir(mut self, git_dir: impl Into<PathBuf>) -> Self {
        self.git_dir = Some(git_dir.into());
        self
    }
}

#[derive(Debug, Clone, Default)]
pub struct GitCli {
    debug: bool,
}

impl GitCli {
    pub fn new(debug: bool) -> Self {
        Self { debug }
    }

    /// Run `git <args...>`, waiting for exit and capturing both streams.
    pub async fn run<I, S>(&self, args: I, opts: &RunOpts) -> Result<GitOutput, GitCliError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let git = resolve_executable_path("git").ok_or(GitCliError::NotAvailable)?;
        let args: Vec<String> = args.into_iter().map(Into::into).collect();

        let mut cmd = Command::new(git);
        if let Some(git_dir) = &opts.git_dir {
            cmd.arg(format!("--git-dir={}", git_dir.display()));
        }
        cmd.args(&args);
        if let Some(cwd) = &opts.cwd {
            cmd.current_dir(cwd);
        }
        cmd.stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        let out = cmd.output().await?;
        let stdout = String::from_utf8_lossy(&out.stdout).to_string();
        let stderr = String::from_utf8_lossy(&out.stderr).to_string();
        let code = out.status.code().unwrap_or(-1);

        if self.debug {
            error!(?args, %stdout, %stderr, "git invocation");
        }

        if !out.status.success() {
            return Err(GitCliError::CommandFailed {
                code,
                stdout,
                stderr,
                args,
            });
        }
        Ok(GitOutput {
            code,
            stdout,
            stderr,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn version_succeeds_and_captures_stdout() {
        let git = GitCli::new(false);
        let out = git.run(["--version"], &RunOpts::default()).await.unwrap();
        assert_eq!(out.code, 0);
        assert!(out.stdout.starts_with("git version"));
    }

    #[tokio::test]
    async fn failure_carries_code_args_and_streams() {
        let git = GitCli::new(false);
        let dir = tempfile::TempDir::new().unwrap();
        let err = git
            .run(["rev-parse", "HEAD"], &RunOpts::in_dir(dir.path()))
            .await
            .unwrap_err();
        match err {
            GitCliError::CommandFailed {
                code, args, stderr, ..
            } => {
                assert_ne!(code, 0);
                assert_eq!(args, vec!["rev-parse", "HEAD"]);
                assert!(!stderr.is_empty());
            }
            other => panic!("expected CommandFailed, got {other:?}"),
        }
    }
}
