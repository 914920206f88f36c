//! Shared fixtures: throwaway upstream repositories served over file://,
//! an in-memory request store, and a recording notifier.

#![allow(dead_code)]

use std::{
    path::{Path, PathBuf},
    process::Command,
    sync::{Arc, Mutex, Once},
};

use async_trait::async_trait;
use db::DBService;
use services::services::{
    config::Settings,
    engine::Engine,
    notify::{ChatMessage, EmailMessage, Notifier},
};
use sqlx::SqlitePool;
use tempfile::TempDir;

/// Point every git subprocess at a private global config: a committer
/// identity, `master` as the default branch, and file-protocol submodule
/// clones enabled.
pub fn setup_git_env() {
    static ONCE: Once = Once::new();
    ONCE.call_once(|| {
        let config_path = std::env::temp_dir().join("pushgate-test-gitconfig");
        std::fs::write(
            &config_path,
            "[user]\n\
             \tname = Test User\n\
             \temail = test@example.com\n\
             [init]\n\
             \tdefaultBranch = master\n\
             [protocol \"file\"]\n\
             \tallow = always\n",
        )
        .unwrap();
        unsafe {
            std::env::set_var("GIT_CONFIG_GLOBAL", &config_path);
            std::env::set_var("GIT_CONFIG_NOSYSTEM", "1");
        }
    });
}

pub fn run_git(dir: &Path, args: &[&str]) {
    let out = Command::new("git")
        .args(args)
        .current_dir(dir)
        .output()
        .unwrap();
    assert!(
        out.status.success(),
        "git {args:?} failed in {}:\n{}\n{}",
        dir.display(),
        String::from_utf8_lossy(&out.stdout),
        String::from_utf8_lossy(&out.stderr),
    );
}

pub fn git_stdout(dir: &Path, args: &[&str]) -> String {
    let out = Command::new("git")
        .args(args)
        .current_dir(dir)
        .output()
        .unwrap();
    assert!(out.status.success(), "git {args:?} failed");
    String::from_utf8_lossy(&out.stdout).trim().to_string()
}

pub fn rev_parse(dir: &Path, rev: &str) -> String {
    git_stdout(dir, &["rev-parse", rev])
}

pub fn write_file(base: &Path, rel: &str, content: &str) {
    let path = base.join(rel);
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).unwrap();
    }
    std::fs::write(path, content).unwrap();
}

pub fn commit_file(repo: &Path, rel: &str, content: &str, message: &str) {
    write_file(repo, rel, content);
    run_git(repo, &["add", "-A"]);
    run_git(repo, &["commit", "-m", message]);
}

/// Create the upstream main repository with an initial commit on master.
pub fn init_upstream(tmp: &TempDir) -> PathBuf {
    let upstream = tmp.path().join("upstream");
    std::fs::create_dir_all(&upstream).unwrap();
    run_git(&upstream, &["init", "-b", "master"]);
    write_file(&upstream, "app.txt", "one\n");
    write_file(&upstream, "shared.txt", "base\n");
    run_git(&upstream, &["add", "-A"]);
    run_git(&upstream, &["commit", "-m", "initial"]);
    upstream
}

/// Settings pointed at a local upstream via file:// URLs. The logical main
/// repository name is the upstream's absolute path without its leading
/// slash, so `file:///{name}` resolves back to it.
pub fn test_settings(tmp: &TempDir, upstream: &Path) -> Settings {
    let mut settings = Settings::default();
    settings.git.main_repository = upstream
        .to_string_lossy()
        .trim_start_matches('/')
        .to_string();
    settings.git.main_branch = "master".to_string();
    settings.git.scheme = "file".to_string();
    settings.git.servername = String::new();
    settings.git.auth = None;
    settings.git.port = None;
    settings.git.use_local_mirror = false;
    settings.git.local_repo_path = tmp.path().join("copies");
    settings.git.conflict_threads = 1;
    settings.main_app.servername = "push.test".to_string();
    settings.main_app.port = 443;
    settings
}

#[derive(Default)]
pub struct RecordingNotifier {
    pub mails: Mutex<Vec<EmailMessage>>,
    pub chats: Mutex<Vec<ChatMessage>>,
}

impl RecordingNotifier {
    pub fn mail_subjects(&self) -> Vec<String> {
        self.mails
            .lock()
            .unwrap()
            .iter()
            .map(|m| m.subject.clone())
            .collect()
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn enqueue_user_email(&self, recipients: &[String], body_html: &str, subject: &str) {
        self.mails.lock().unwrap().push(EmailMessage {
            recipients: recipients.to_vec(),
            subject: subject.to_string(),
            body_html: body_html.to_string(),
        });
    }

    async fn enqueue_user_chat(&self, recipients: &[String], body: &str) {
        self.chats.lock().unwrap().push(ChatMessage {
            recipients: recipients.to_vec(),
            body: body.to_string(),
        });
    }
}

pub struct TestContext {
    pub tmp: TempDir,
    pub upstream: PathBuf,
    pub settings: Arc<Settings>,
    pub engine: Engine,
    pub notifier: Arc<RecordingNotifier>,
}

impl TestContext {
    pub fn pool(&self) -> &SqlitePool {
        self.engine.pool()
    }

    pub fn main_repo(&self) -> &str {
        &self.settings.git.main_repository
    }

    pub fn base_url(&self) -> String {
        self.settings.base_url()
    }
}

/// An engine wired to a fresh upstream, an in-memory store, and a
/// recording notifier.
pub async fn engine_fixture() -> TestContext {
    engine_fixture_with(|_| {}).await
}

pub async fn engine_fixture_with(customize: impl FnOnce(&mut Settings)) -> TestContext {
    setup_git_env();
    let tmp = TempDir::new().unwrap();
    let upstream = init_upstream(&tmp);
    let mut settings = test_settings(&tmp, &upstream);
    customize(&mut settings);
    let settings = Arc::new(settings);
    let db = DBService::new_in_memory().await.unwrap();
    let notifier = Arc::new(RecordingNotifier::default());
    let engine = Engine::new(settings.clone(), db, notifier.clone());
    TestContext {
        tmp,
        upstream,
        settings,
        engine,
        notifier,
    }
}

pub async fn seed_request(
    pool: &SqlitePool,
    id: i64,
    state: &str,
    repo: &str,
    branch: &str,
    tags: &str,
) {
    sqlx::query(
        "INSERT INTO push_requests (id, user, state, repo, branch, revision, tags, title, reviewid) \
         VALUES (?, ?, ?, ?, ?, '', ?, ?, NULL)",
    )
    .bind(id)
    .bind(format!("user{id}"))
    .bind(state)
    .bind(repo)
    .bind(branch)
    .bind(tags)
    .bind(format!("title{id}"))
    .execute(pool)
    .await
    .unwrap();
}

pub async fn set_request_revision(pool: &SqlitePool, id: i64, revision: &str) {
    sqlx::query("UPDATE push_requests SET revision = ? WHERE id = ?")
        .bind(revision)
        .bind(id)
        .execute(pool)
        .await
        .unwrap();
}

pub async fn set_request_reviewid(pool: &SqlitePool, id: i64, reviewid: i64) {
    sqlx::query("UPDATE push_requests SET reviewid = ? WHERE id = ?")
        .bind(reviewid)
        .bind(id)
        .execute(pool)
        .await
        .unwrap();
}

pub async fn seed_membership(pool: &SqlitePool, push_id: i64, request_id: i64) {
    sqlx::query("INSERT INTO push_pushcontents (push, request) VALUES (?, ?)")
        .bind(push_id)
        .bind(request_id)
        .execute(pool)
        .await
        .unwrap();
}
