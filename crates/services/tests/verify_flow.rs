//! Branch verification scenarios, including webhook emission against a
//! loopback listener.

mod common;

use std::collections::HashMap;

use axum::{Form, Router, routing::post};
use common::*;
use db::models::request::Request;
use tokio::sync::mpsc;

async fn spawn_hook_listener() -> (String, mpsc::UnboundedReceiver<HashMap<String, String>>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let app = Router::new().route(
        "/hook",
        post(move |Form(form): Form<HashMap<String, String>>| {
            let tx = tx.clone();
            async move {
                tx.send(form).ok();
                "ok"
            }
        }),
    );
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let url = format!("http://{}/hook", listener.local_addr().unwrap());
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    (url, rx)
}

#[tokio::test]
async fn verify_success_records_tip_and_emits_webhooks() {
    let (hook_url, mut hooks) = spawn_hook_listener().await;
    let ctx = engine_fixture_with(|settings| {
        settings.web_hooks.post_url = Some(hook_url.clone());
    })
    .await;
    run_git(&ctx.upstream, &["checkout", "-b", "feat/x", "master"]);
    commit_file(&ctx.upstream, "app.txt", "feature\n", "feature work");
    run_git(&ctx.upstream, &["checkout", "master"]);
    let tip = rev_parse(&ctx.upstream, "feat/x");

    let main_repo = ctx.main_repo().to_string();
    seed_request(ctx.pool(), 1, "requested", &main_repo, "feat/x", "").await;
    set_request_reviewid(ctx.pool(), 1, 42).await;

    ctx.engine.verify_branch(1, &ctx.base_url()).await.unwrap();

    let req = Request::find_by_id(ctx.pool(), 1).await.unwrap().unwrap();
    assert_eq!(req.revision, tip);
    assert!(req.tags.contains("git-ok"));
    assert!(!req.tags.contains("git-error"));

    assert_eq!(ctx.notifier.mail_subjects(), vec!["[push] user1 - title1"]);
    let mail = ctx.notifier.mails.lock().unwrap()[0].clone();
    assert_eq!(mail.recipients, vec!["user1"]);
    assert!(mail.body_html.contains(&tip));

    // Three association hooks: branch, commit, review.
    let ref_hook = hooks.recv().await.unwrap();
    assert_eq!(ref_hook["reason"], "pushmanager");
    assert_eq!(ref_hook["left_type"], "pushrequest");
    assert_eq!(ref_hook["left_token"], "1");
    assert_eq!(ref_hook["right_type"], "ref");
    assert_eq!(ref_hook["right_token"], "feat/x");

    let commit_hook = hooks.recv().await.unwrap();
    assert_eq!(commit_hook["right_type"], "commit");
    assert_eq!(commit_hook["right_token"], tip);

    let review_hook = hooks.recv().await.unwrap();
    assert_eq!(review_hook["right_type"], "review");
    assert_eq!(review_hook["right_token"], "42");
}

#[tokio::test]
async fn verify_duplicate_revision_fails_the_request() {
    let ctx = engine_fixture().await;
    run_git(&ctx.upstream, &["checkout", "-b", "feat/x", "master"]);
    commit_file(&ctx.upstream, "app.txt", "feature\n", "feature work");
    run_git(&ctx.upstream, &["checkout", "master"]);
    let tip = rev_parse(&ctx.upstream, "feat/x");

    let main_repo = ctx.main_repo().to_string();
    seed_request(ctx.pool(), 1, "requested", &main_repo, "feat/x", "").await;
    seed_request(ctx.pool(), 2, "pickme", &main_repo, "feat/x", "").await;
    set_request_revision(ctx.pool(), 2, &tip).await;

    ctx.engine.verify_branch(1, &ctx.base_url()).await.unwrap();

    let req = Request::find_by_id(ctx.pool(), 1).await.unwrap().unwrap();
    assert!(req.tags.contains("git-error"));
    assert!(!req.tags.contains("git-ok"));
    assert!(req.revision.is_empty());
    assert_eq!(ctx.notifier.mail_subjects(), vec!["[push] user1 - title1"]);
}

#[tokio::test]
async fn discarded_duplicate_does_not_block_verification() {
    let ctx = engine_fixture().await;
    run_git(&ctx.upstream, &["checkout", "-b", "feat/x", "master"]);
    commit_file(&ctx.upstream, "app.txt", "feature\n", "feature work");
    run_git(&ctx.upstream, &["checkout", "master"]);
    let tip = rev_parse(&ctx.upstream, "feat/x");

    let main_repo = ctx.main_repo().to_string();
    seed_request(ctx.pool(), 1, "requested", &main_repo, "feat/x", "").await;
    seed_request(ctx.pool(), 2, "discarded", &main_repo, "feat/x", "").await;
    set_request_revision(ctx.pool(), 2, &tip).await;

    ctx.engine.verify_branch(1, &ctx.base_url()).await.unwrap();

    let req = Request::find_by_id(ctx.pool(), 1).await.unwrap().unwrap();
    assert!(req.tags.contains("git-ok"));
    assert_eq!(req.revision, tip);
}

#[tokio::test]
async fn missing_branch_sends_both_failure_mails() {
    let ctx = engine_fixture().await;
    let main_repo = ctx.main_repo().to_string();
    seed_request(ctx.pool(), 1, "requested", &main_repo, "feat/ghost", "").await;

    ctx.engine.verify_branch(1, &ctx.base_url()).await.unwrap();

    let req = Request::find_by_id(ctx.pool(), 1).await.unwrap().unwrap();
    assert!(req.tags.contains("git-error"));
    // One mail from the tip sampler naming the branch, one generic
    // verification failure.
    assert_eq!(
        ctx.notifier.mail_subjects(),
        vec!["[push error] user1 - title1", "[push] user1 - title1"]
    );
}

#[tokio::test]
async fn empty_branch_fails_without_touching_git() {
    let ctx = engine_fixture().await;
    let main_repo = ctx.main_repo().to_string();
    seed_request(ctx.pool(), 1, "requested", &main_repo, "", "").await;

    ctx.engine.verify_branch(1, &ctx.base_url()).await.unwrap();

    let req = Request::find_by_id(ctx.pool(), 1).await.unwrap().unwrap();
    assert!(req.tags.contains("git-error"));
    assert_eq!(ctx.notifier.mail_subjects(), vec!["[push] user1 - title1"]);
}

#[tokio::test]
async fn excluded_tags_skip_verification() {
    let ctx = engine_fixture().await;
    let main_repo = ctx.main_repo().to_string();
    seed_request(ctx.pool(), 1, "requested", &main_repo, "feat/x", "fake-branch").await;

    ctx.engine.verify_branch(1, &ctx.base_url()).await.unwrap();

    let req = Request::find_by_id(ctx.pool(), 1).await.unwrap().unwrap();
    assert!(!req.tags.contains("git-ok"));
    assert!(!req.tags.contains("git-error"));
    assert!(ctx.notifier.mails.lock().unwrap().is_empty());
}

#[tokio::test]
async fn reverify_clears_previous_error_tag() {
    let ctx = engine_fixture().await;
    run_git(&ctx.upstream, &["checkout", "-b", "feat/x", "master"]);
    commit_file(&ctx.upstream, "app.txt", "feature\n", "feature work");
    run_git(&ctx.upstream, &["checkout", "master"]);

    let main_repo = ctx.main_repo().to_string();
    seed_request(ctx.pool(), 1, "requested", &main_repo, "feat/x", "git-error").await;

    ctx.engine.verify_branch(1, &ctx.base_url()).await.unwrap();

    let req = Request::find_by_id(ctx.pool(), 1).await.unwrap().unwrap();
    assert!(req.tags.contains("git-ok"));
    assert!(!req.tags.contains("git-error"));
}
