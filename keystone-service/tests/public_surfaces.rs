//! Public-listener behavior: surface disjointness, CSRF, bearer auth, and
//! rate limiting, over real HTTPS listeners with ephemeral ports.

mod common;

use axum::routing::{get, post};
use keystone_service::prelude::*;

async fn echo() -> &'static str {
    "echo"
}

async fn app_with_echo_routes(config: Config) -> Application {
    let mut app = ServiceBuilder::new()
        .with_config(config)
        .with_public_routes(|mut routes| {
            routes.browser = routes.browser.route("/echo", post(echo)).route("/echo", get(echo));
            routes.service = routes
                .service
                .route("/echo", post(echo))
                .route("/noop", get(echo));
            routes
        })
        .build()
        .await
        .unwrap();
    app.start().await.unwrap();
    app
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn unmatched_prefixes_return_404() {
    let dir = tempfile::TempDir::new().unwrap();
    let mut app = app_with_echo_routes(common::test_config(&dir)).await;
    let port = app.public_port().unwrap();
    let client = common::client();

    let response = client
        .get(format!("https://127.0.0.1:{port}/neither/api/v1/echo"))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 404);

    // Routes registered on one surface do not exist on the other: /noop
    // lives only on the service surface.
    let response = client
        .get(format!("https://127.0.0.1:{port}/browser/api/v1/noop"))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 404);

    let response = client
        .get(format!("https://127.0.0.1:{port}/service/api/v1/not-registered"))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 404);

    app.shutdown().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn browser_surface_enforces_csrf_then_session() {
    let dir = tempfile::TempDir::new().unwrap();
    let mut app = app_with_echo_routes(common::test_config(&dir)).await;
    let port = app.public_port().unwrap();
    let client = common::client();
    let base = format!("https://127.0.0.1:{port}");

    let (_tenant, token, csrf) = common::register_and_login(&client, port).await;

    // Non-GET without a CSRF header: rejected before anything else.
    let response = client
        .post(format!("{base}/browser/api/v1/echo"))
        .bearer_auth(&token)
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 403);

    // CSRF header but no session: unauthenticated.
    let response = client
        .post(format!("{base}/browser/api/v1/echo"))
        .header("x-csrf-token", &csrf)
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 401);

    // CSRF bound to a different session: forbidden.
    let response = client
        .post(format!("{base}/browser/api/v1/echo"))
        .bearer_auth(&token)
        .header("x-csrf-token", "bm90LXRoZS1yaWdodC1tYWM")
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 403);

    // Valid session + matching CSRF token: accepted.
    let response = client
        .post(format!("{base}/browser/api/v1/echo"))
        .bearer_auth(&token)
        .header("x-csrf-token", &csrf)
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);

    // Safe methods skip CSRF but still need the session.
    let response = client
        .get(format!("{base}/browser/api/v1/echo"))
        .bearer_auth(&token)
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);

    app.shutdown().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn service_surface_requires_bearer_session() {
    let dir = tempfile::TempDir::new().unwrap();
    let mut app = app_with_echo_routes(common::test_config(&dir)).await;
    let port = app.public_port().unwrap();
    let client = common::client();
    let base = format!("https://127.0.0.1:{port}");

    let response = client
        .post(format!("{base}/service/api/v1/echo"))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 401);

    let (_tenant, token, _csrf) = common::register_and_login(&client, port).await;
    let response = client
        .post(format!("{base}/service/api/v1/echo"))
        .bearer_auth(&token)
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);

    // No CSRF requirement on the service surface.
    let body = response.text().await.unwrap();
    assert_eq!(body, "echo");

    app.shutdown().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn ip_allowlist_rejects_unlisted_addresses() {
    let dir = tempfile::TempDir::new().unwrap();
    let mut config = common::test_config(&dir);
    config.ip_allowlist.entries = vec!["203.0.113.0/24".to_string()];
    let mut app = app_with_echo_routes(config).await;
    let port = app.public_port().unwrap();
    let client = common::client();

    // Loopback is not in the allow-list.
    let response = client
        .get(format!("https://127.0.0.1:{port}/service/api/v1/noop"))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 403);

    app.shutdown().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn sustained_overload_is_rate_limited() {
    let dir = tempfile::TempDir::new().unwrap();
    let mut config = common::test_config(&dir);
    config.ratelimit.requests_per_second = 10;
    config.ratelimit.burst = 10;
    let mut app = app_with_echo_routes(config).await;
    let port = app.public_port().unwrap();
    let client = common::client();
    let base = format!("https://127.0.0.1:{port}");

    let (_tenant, token, _csrf) = common::register_and_login(&client, port).await;

    let mut ok = 0usize;
    let mut limited = 0usize;
    for _ in 0..100 {
        let status = client
            .get(format!("{base}/service/api/v1/noop"))
            .bearer_auth(&token)
            .send()
            .await
            .unwrap()
            .status();
        match status.as_u16() {
            200 => ok += 1,
            429 => limited += 1,
            other => panic!("unexpected status {other}"),
        }
    }

    // The bucket admits the burst plus whatever refills while the loop
    // runs; the bulk of the overload is rejected.
    assert!(ok >= 10, "admitted {ok}");
    assert!(ok <= 40, "admitted {ok}");
    assert_eq!(ok + limited, 100);

    app.shutdown().await.unwrap();
}
