mod common;

use axum_test::TestServer;
use relay_api::gateway::session::RelaySession;

#[tokio::test]
async fn health_reports_ok_and_online_count() {
    let (app, state, _store, _pushes) = common::test_app();
    let server = TestServer::new(app).unwrap();

    let resp = server.get("/health").await;
    resp.assert_status_ok();
    let body: serde_json::Value = resp.json();
    assert_eq!(body["status"], "ok");
    assert_eq!(body["online"], 0);

    let session = RelaySession::new();
    state.relay.user_online(&session, "alice");

    let body: serde_json::Value = server.get("/health").await.json();
    assert_eq!(body["online"], 1);
}
