use std::path::{Path, PathBuf};

use tracing::info;

use super::{
    config::GitSettings,
    git_cli::{EXIT_REMOTE_EXISTS, GitCli, GitCliError, RunOpts},
};

/// What [`WorkingCopy::prepare`] should do beyond ensuring the clone exists.
#[derive(Debug, Clone, Copy)]
pub struct PrepareOpts {
    pub fetch: bool,
    pub checkout: bool,
}

/// A worker-owned on-disk clone of the main repository.
///
/// All repositories are materialized inside this single clone: the main
/// repository is `origin`, every other repo is registered as an extra
/// remote named after it. The copy is created lazily on first use and
/// never deleted by the engine. Exactly one worker owns it; nothing here
/// synchronizes concurrent access because the per-worker paths are
/// disjoint by construction.
pub struct WorkingCopy {
    git: GitCli,
    settings: GitSettings,
    worker_id: usize,
    path: PathBuf,
}

impl WorkingCopy {
    pub fn new(git: GitCli, settings: GitSettings, worker_id: usize) -> Self {
        let path = settings.working_copy_path(worker_id);
        Self {
            git,
            settings,
            worker_id,
            path,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn git(&self) -> &GitCli {
        &self.git
    }

    pub fn worker_id(&self) -> usize {
        self.worker_id
    }

    pub fn main_branch(&self) -> &str {
        &self.settings.main_branch
    }

    /// The remote tracking ref of the integration branch.
    pub fn mainline_ref(&self) -> String {
        self.settings.mainline_ref()
    }

    fn run_opts(&self) -> RunOpts {
        RunOpts::in_dir(&self.path)
    }

    /// Resolve the remote name a logical repository maps to. The main
    /// repository and the logical name `mainline` alias to `origin`.
    pub fn remote_for(&self, repo: &str) -> String {
        if repo == self.settings.main_repository || repo == "mainline" {
            "origin".to_string()
        } else {
            repo.to_string()
        }
    }

    /// Make the working copy ready for `repo`/`branch`: clone the main
    /// repository if missing, optionally fetch the branch (registering the
    /// repo as a remote on first use), optionally reset-clean and check
    /// the branch out with submodules synchronized.
    pub async fn prepare(
        &self,
        repo: &str,
        branch: &str,
        opts: PrepareOpts,
    ) -> Result<(), GitCliError> {
        let remote = self.remote_for(repo);
        self.clone_if_missing().await?;
        if opts.fetch {
            self.register_and_fetch(&remote, branch).await?;
        }
        if opts.checkout {
            self.checkout_clean(&remote, branch).await?;
        }
        Ok(())
    }

    async fn clone_if_missing(&self) -> Result<(), GitCliError> {
        if self.path.is_dir() {
            return Ok(());
        }
        let mut args = vec![
            "clone".to_string(),
            self.settings
                .repository_url(&self.settings.main_repository),
        ];
        if self.settings.use_local_mirror && self.settings.local_mirror.is_dir() {
            args.push("--reference".to_string());
            args.push(self.settings.local_mirror.display().to_string());
        }
        args.push(self.path.display().to_string());

        // Will take time on a large repository.
        info!(
            worker_id = self.worker_id,
            path = %self.path.display(),
            "cloning main repository"
        );
        self.git.run(args, &RunOpts::default()).await?;
        Ok(())
    }

    async fn register_and_fetch(&self, remote: &str, branch: &str) -> Result<(), GitCliError> {
        let url = self.settings.repository_url(remote);
        match self
            .git
            .run(["remote", "add", remote, url.as_str()], &self.run_opts())
            .await
        {
            Ok(_) => {}
            Err(err)
                if err
                    .exit_code()
                    .is_some_and(|code| EXIT_REMOTE_EXISTS.contains(&code)) => {}
            Err(err) => return Err(err),
        }

        // The explicit refspec lets updates of the same ref advance the
        // local tracking ref even on non-fast-forward moves.
        let refspec = format!("+refs/heads/{branch}:refs/remotes/{remote}/{branch}");
        self.git
            .run(
                ["fetch", "--prune", remote, refspec.as_str()],
                &self.run_opts(),
            )
            .await?;
        Ok(())
    }

    async fn checkout_clean(&self, remote: &str, branch: &str) -> Result<(), GitCliError> {
        self.git
            .run(["reset", "--hard", "HEAD"], &self.run_opts())
            .await?;
        self.git.run(["clean", "-fdfx"], &self.run_opts()).await?;
        let full_branch = format!("{remote}/{branch}");
        self.git
            .run(["checkout", full_branch.as_str()], &self.run_opts())
            .await?;
        self.git
            .run(["submodule", "--quiet", "sync"], &self.run_opts())
            .await?;
        self.git
            .run(["submodule", "--quiet", "update", "--init"], &self.run_opts())
            .await?;
        Ok(())
    }

    pub async fn rev_parse(&self, rev: &str) -> Result<String, GitCliError> {
        let out = self.git.run(["rev-parse", rev], &self.run_opts()).await?;
        Ok(out.stdout.trim().to_string())
    }

    pub async fn checkout(&self, rev: &str) -> Result<(), GitCliError> {
        self.git.run(["checkout", rev], &self.run_opts()).await?;
        Ok(())
    }

    pub async fn create_branch_from(&self, name: &str, start: &str) -> Result<(), GitCliError> {
        self.git
            .run(["checkout", start, "-b", name], &self.run_opts())
            .await?;
        Ok(())
    }

    pub async fn delete_branch(&self, name: &str) -> Result<(), GitCliError> {
        self.git
            .run(["branch", "-D", name], &self.run_opts())
            .await?;
        Ok(())
    }

    /// Hard-reset to `rev` and bring submodules back in line with it.
    pub async fn reset_to(&self, rev: &str) -> Result<(), GitCliError> {
        self.git
            .run(["reset", "--hard", rev], &self.run_opts())
            .await?;
        self.git
            .run(["submodule", "--quiet", "sync"], &self.run_opts())
            .await?;
        self.git
            .run(["submodule", "--quiet", "update"], &self.run_opts())
            .await?;
        Ok(())
    }

    pub async fn merge_base(&self, a: &str, b: &str) -> Result<String, GitCliError> {
        let out = self.git.run(["merge-base", a, b], &self.run_opts()).await?;
        Ok(out.stdout.trim().to_string())
    }
}
