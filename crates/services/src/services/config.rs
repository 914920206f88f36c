use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::info;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

/// Engine settings, loaded from a JSON file with namespaced sections.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub git: GitSettings,
    pub main_app: AppSettings,
    pub reviewboard: ReviewboardSettings,
    pub web_hooks: WebhookSettings,
    pub database: DatabaseSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GitSettings {
    /// Logical name of the integration repository. Working copies are
    /// clones of this repo; every other repo becomes a remote on them.
    pub main_repository: String,
    /// Name of the integration branch inside the main repository.
    pub main_branch: String,
    /// Directory under which per-worker working copies are created.
    pub local_repo_path: PathBuf,
    pub local_mirror: PathBuf,
    pub use_local_mirror: bool,
    pub scheme: String,
    pub servername: String,
    pub port: Option<u16>,
    pub auth: Option<String>,
    /// Server-side directory holding developer repositories.
    pub dev_repositories_dir: String,
    #[serde(rename = "conflict-threads")]
    pub conflict_threads: usize,
    /// Requests carrying any of these tags skip branch verification.
    pub exclude_from_verification: Vec<String>,
}

impl Default for GitSettings {
    fn default() -> Self {
        Self {
            main_repository: "main".to_string(),
            main_branch: "master".to_string(),
            local_repo_path: PathBuf::from("/var/lib/pushgate/repos"),
            local_mirror: PathBuf::from("/var/lib/pushgate/mirror"),
            use_local_mirror: false,
            scheme: "git".to_string(),
            servername: "localhost".to_string(),
            port: None,
            auth: None,
            dev_repositories_dir: "dev".to_string(),
            conflict_threads: 1,
            exclude_from_verification: vec!["fake-branch".to_string()],
        }
    }
}

impl GitSettings {
    /// Remote URL for a logical repository name:
    /// `{scheme}://[{auth}@]{servername}[:{port}]/{name}`, where the main
    /// repository (or the literal `origin`) maps to its own name and any
    /// other repo lives under the developer repositories directory.
    pub fn repository_url(&self, repo: &str) -> String {
        let mut netloc = self.servername.clone();
        if let Some(auth) = &self.auth {
            netloc = format!("{auth}@{netloc}");
        }
        if let Some(port) = self.port {
            netloc = format!("{netloc}:{port}");
        }
        if repo == self.main_repository || repo == "origin" {
            format!("{}://{}/{}", self.scheme, netloc, self.main_repository)
        } else {
            format!(
                "{}://{}/{}/{}",
                self.scheme, netloc, self.dev_repositories_dir, repo
            )
        }
    }

    /// On-disk path of a worker's working copy:
    /// `{local_repo_path}/{main_repository}.{worker_id}`.
    pub fn working_copy_path(&self, worker_id: usize) -> PathBuf {
        self.local_repo_path
            .join(format!("{}.{}", self.main_repository, worker_id))
    }

    /// The remote tracking ref of the integration branch (`origin/master`).
    pub fn mainline_ref(&self) -> String {
        format!("origin/{}", self.main_branch)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AppSettings {
    /// Log every git invocation (args and both output streams).
    pub debug: bool,
    pub servername: String,
    pub port: u16,
}

impl Default for AppSettings {
    fn default() -> Self {
        Self {
            debug: false,
            servername: "localhost".to_string(),
            port: 8080,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReviewboardSettings {
    pub servername: String,
}

impl Default for ReviewboardSettings {
    fn default() -> Self {
        Self {
            servername: "localhost".to_string(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct WebhookSettings {
    pub post_url: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseSettings {
    pub path: PathBuf,
}

impl Default for DatabaseSettings {
    fn default() -> Self {
        Self {
            path: PathBuf::from("pushgate.sqlite"),
        }
    }
}

impl Settings {
    pub fn load(path: &Path) -> Result<Settings, ConfigError> {
        let raw = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&raw)?)
    }

    /// Load settings, falling back to defaults when no file is present.
    pub fn load_or_default(path: &Path) -> Settings {
        match Settings::load(path) {
            Ok(settings) => settings,
            Err(err) => {
                info!(
                    "no usable settings at {} ({err}), using defaults",
                    path.display()
                );
                Settings::default()
            }
        }
    }

    /// External base URL used in notification links when a task did not
    /// carry one (poller-originated work).
    pub fn base_url(&self) -> String {
        format!("https://{}:{}", self.main_app.servername, self.main_app.port)
    }
}
