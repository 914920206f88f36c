//! Submodule validation against real nested repositories.

mod common;

use std::path::{Path, PathBuf};

use common::*;
use services::services::{
    git_cli::GitCli,
    submodule::{SubmoduleError, validate_changed_submodules},
    workspace::{PrepareOpts, WorkingCopy},
};
use tempfile::TempDir;

struct SubmoduleFixture {
    tmp: TempDir,
    upstream: PathBuf,
    /// Submodule commits, oldest first: c0, c1 (recorded on master), c2.
    shas: [String; 3],
}

/// Upstream layout: `libs/dep` submodule recorded at c1 on master, a
/// `feat/subup` branch moving it forward to c2, and a `feat/subdown`
/// branch moving it backwards to c0.
fn submodule_fixture() -> SubmoduleFixture {
    setup_git_env();
    let tmp = TempDir::new().unwrap();

    let sub = tmp.path().join("sub");
    std::fs::create_dir_all(&sub).unwrap();
    run_git(&sub, &["init", "-b", "master"]);
    commit_file(&sub, "lib.txt", "v0\n", "c0");
    let c0 = rev_parse(&sub, "HEAD");
    commit_file(&sub, "lib.txt", "v1\n", "c1");
    let c1 = rev_parse(&sub, "HEAD");

    let upstream = init_upstream(&tmp);
    let sub_url = format!("file://{}", sub.display());
    run_git(&upstream, &["submodule", "add", sub_url.as_str(), "libs/dep"]);
    run_git(&upstream, &["commit", "-m", "add libs/dep"]);

    // New upstream work in the submodule, not yet recorded by master.
    commit_file(&sub, "lib.txt", "v2\n", "c2");
    let c2 = rev_parse(&sub, "HEAD");

    let dep = upstream.join("libs/dep");
    point_submodule_at(&upstream, &dep, "feat/subup", &c2);
    point_submodule_at(&upstream, &dep, "feat/subdown", &c0);

    SubmoduleFixture {
        tmp,
        upstream,
        shas: [c0, c1, c2],
    }
}

fn point_submodule_at(upstream: &Path, dep: &Path, branch: &str, sha: &str) {
    run_git(upstream, &["checkout", "-b", branch, "master"]);
    run_git(dep, &["fetch", "origin"]);
    run_git(dep, &["checkout", sha]);
    run_git(upstream, &["add", "libs/dep"]);
    run_git(upstream, &["commit", "-m", branch]);
    run_git(upstream, &["checkout", "master"]);
    run_git(upstream, &["submodule", "update"]);
}

async fn prepared_copy(fixture: &SubmoduleFixture) -> WorkingCopy {
    let settings = test_settings(&fixture.tmp, &fixture.upstream);
    let wc = WorkingCopy::new(GitCli::new(false), settings.git.clone(), 0);
    wc.prepare(
        &settings.git.main_repository,
        "master",
        PrepareOpts {
            fetch: true,
            checkout: true,
        },
    )
    .await
    .unwrap();
    wc
}

#[tokio::test]
async fn fast_forward_submodule_update_passes() {
    let fixture = submodule_fixture();
    let wc = prepared_copy(&fixture).await;

    // Simulate a merged branch that advances the submodule pointer; the
    // submodule directory still holds the old checkout.
    run_git(wc.path(), &["fetch", "origin", "feat/subup"]);
    run_git(wc.path(), &["checkout", "-b", "trial", "origin/master"]);
    run_git(wc.path(), &["merge", "--no-ff", "origin/feat/subup"]);

    validate_changed_submodules(&wc).await.unwrap();

    // The validator brought the submodule up to the merged pointer.
    assert_eq!(rev_parse(&wc.path().join("libs/dep"), "HEAD"), fixture.shas[2]);
}

#[tokio::test]
async fn backwards_submodule_move_is_rejected() {
    let fixture = submodule_fixture();
    let wc = prepared_copy(&fixture).await;

    run_git(wc.path(), &["fetch", "origin", "feat/subdown"]);
    run_git(wc.path(), &["checkout", "-b", "trial", "origin/master"]);
    run_git(wc.path(), &["merge", "--no-ff", "origin/feat/subdown"]);

    let err = validate_changed_submodules(&wc).await.unwrap_err();
    match err {
        SubmoduleError::NotFastForward { name, old_sha } => {
            assert_eq!(name, "libs/dep");
            // The recorded SHA is the short form of the pre-merge checkout.
            assert!(fixture.shas[1].starts_with(&old_sha));
        }
        other => panic!("expected NotFastForward, got {other:?}"),
    }
}
