//! Listener lifecycle over real ephemeral-port HTTPS listeners

mod common;

use keystone_service::prelude::*;

async fn started_app(dir: &tempfile::TempDir) -> Application {
    let mut app = ServiceBuilder::new()
        .with_config(common::test_config(dir))
        .build()
        .await
        .unwrap();
    app.start().await.unwrap();
    app
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn start_reaches_ready_and_allocates_ephemeral_ports() {
    let dir = tempfile::TempDir::new().unwrap();
    let mut app = started_app(&dir).await;

    assert_eq!(app.lifecycle().state(), LifecycleState::Ready);
    let public = app.public_port().unwrap();
    let admin = app.admin_port().unwrap();
    assert_ne!(public, 0);
    assert_ne!(admin, 0);
    assert_ne!(public, admin);

    app.shutdown().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn readyz_reports_ready_and_livez_stays_up() {
    let dir = tempfile::TempDir::new().unwrap();
    let mut app = started_app(&dir).await;
    let admin = app.admin_port().unwrap();
    let client = common::client();

    let ready = client
        .get(format!("https://127.0.0.1:{admin}/readyz"))
        .send()
        .await
        .unwrap();
    assert_eq!(ready.status(), 200);
    let body: serde_json::Value = ready.json().await.unwrap();
    assert_eq!(body["ready"], true);
    assert_eq!(body["dependencies"]["barrier"]["healthy"], true);
    assert_eq!(body["dependencies"]["database"]["healthy"], true);

    let live = client
        .get(format!("https://127.0.0.1:{admin}/livez"))
        .send()
        .await
        .unwrap();
    assert_eq!(live.status(), 200);

    app.shutdown().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn admin_shutdown_endpoint_drains_the_process() {
    let dir = tempfile::TempDir::new().unwrap();
    let mut app = started_app(&dir).await;
    let admin = app.admin_port().unwrap();
    let client = common::client();

    let response = client
        .post(format!("https://127.0.0.1:{admin}/shutdown"))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 202);

    // The serve loop notices the drain request and runs to STOPPED.
    app.run_until_shutdown().await.unwrap();
    assert_eq!(app.lifecycle().state(), LifecycleState::Stopped);

    // The listeners are gone.
    assert!(client
        .get(format!("https://127.0.0.1:{admin}/livez"))
        .send()
        .await
        .is_err());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn shutdown_is_idempotent() {
    let dir = tempfile::TempDir::new().unwrap();
    let mut app = started_app(&dir).await;

    app.shutdown().await.unwrap();
    assert_eq!(app.lifecycle().state(), LifecycleState::Stopped);
    app.shutdown().await.unwrap();
    app.shutdown().await.unwrap();
    assert_eq!(app.lifecycle().state(), LifecycleState::Stopped);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn shutdown_cancels_background_workers() {
    let dir = tempfile::TempDir::new().unwrap();
    let mut app = started_app(&dir).await;
    let token = app.lifecycle().cancellation_token().clone();
    assert!(!token.is_cancelled());

    app.shutdown().await.unwrap();
    assert!(token.is_cancelled());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn barrier_state_survives_restart_with_same_shares() {
    let dir = tempfile::TempDir::new().unwrap();

    // First process: encrypt through the started application's barrier.
    let ciphertext = {
        let mut app = started_app(&dir).await;
        let ciphertext = app
            .state()
            .unwrap()
            .barrier()
            .encrypt(b"hello")
            .await
            .unwrap();
        app.shutdown().await.unwrap();
        ciphertext
    };

    // Second process over the same database file and share files.
    let mut app = started_app(&dir).await;
    let plaintext = app
        .state()
        .unwrap()
        .barrier()
        .decrypt(&ciphertext)
        .await
        .unwrap();
    assert_eq!(plaintext, b"hello");
    app.shutdown().await.unwrap();
}
