//! Backend proxy behavior against a stub HTTP backend: delegated
//! authentication, access verdicts, and the processed/forbidden flows.

mod common;

use axum::extract::Json;
use axum::routing::post;
use axum::Router;
use serde_json::{json, Value};
use synclog::server::{Server, ServerEvent, ServerOptions};
use synclog::shared::{Action, ProtocolErrorKind, PROCESSED_TYPE, UNDO_TYPE};

/// Answer commands the way a backend would: auth verdicts by credential,
/// action verdicts by type prefix.
async fn stub_backend(Json(body): Json<Value>) -> String {
    let mut answers: Vec<Value> = Vec::new();
    for command in body["commands"].as_array().unwrap() {
        match command[0].as_str().unwrap() {
            "auth" => {
                let auth_id = command[3].as_str().unwrap();
                if command[2] == json!("good") {
                    answers.push(json!(["authenticated", auth_id]));
                } else {
                    answers.push(json!(["denied", auth_id]));
                }
            }
            "action" => {
                let id = command[2]["id"].as_str().unwrap();
                match command[1]["type"].as_str().unwrap() {
                    "backend/ok" => {
                        answers.push(json!(["approved", id]));
                        answers.push(json!(["processed", id]));
                    }
                    "backend/forbidden" => answers.push(json!(["forbidden", id])),
                    "backend/broken" => answers.push(json!(["error", "stacktrace"])),
                    _ => answers.push(json!(["unknownAction", id])),
                }
            }
            _ => {}
        }
    }
    serde_json::to_string(&answers).unwrap()
}

async fn spawn_stub() -> String {
    let app = Router::new().route("/", post(stub_backend));
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    format!("http://{addr}/")
}

async fn proxy_server() -> Server {
    let backend = spawn_stub().await;
    Server::new(ServerOptions {
        backend: Some(backend),
        control_secret: Some("secret".into()),
        ..common::test_options()
    })
    .unwrap()
}

#[tokio::test]
async fn test_backend_authenticates_clients() {
    let server = proxy_server().await;

    let good = common::connect(&server, "10:uuid");
    good.handshake_with(Some(json!("good")));
    good.peer.wait_accepted().await;

    let bad = common::connect(&server, "11:uuid");
    bad.handshake_with(Some(json!("bad")));
    assert_eq!(
        bad.peer.wait_rejected().await,
        ProtocolErrorKind::WrongCredentials
    );
}

#[tokio::test]
async fn test_backend_approves_and_processes() {
    let server = proxy_server().await;
    let mut recorder = common::EventRecorder::new(&server);

    let client = common::connect(&server, "10:uuid");
    client.handshake_with(Some(json!("good")));
    client.peer.wait_accepted().await;

    client.send_action(Action::new("backend/ok"), "1 10:uuid 0");

    recorder
        .wait_for(|event| matches!(event, ServerEvent::Processed { id, .. } if id == "1 10:uuid 0"))
        .await;
    let received = client.peer.wait_for_actions(1).await;
    assert_eq!(received[0].0.type_name, PROCESSED_TYPE);
    assert_eq!(received[0].0.id_field(), Some("1 10:uuid 0"));
}

#[tokio::test]
async fn test_backend_forbidden_is_denied() {
    let server = proxy_server().await;
    let mut recorder = common::EventRecorder::new(&server);

    let client = common::connect(&server, "10:uuid");
    client.handshake_with(Some(json!("good")));
    client.peer.wait_accepted().await;

    client.send_action(Action::new("backend/forbidden"), "1 10:uuid 0");

    recorder
        .wait_for(|event| matches!(event, ServerEvent::Denied { id } if id == "1 10:uuid 0"))
        .await;
    let received = client.peer.wait_for_actions(1).await;
    assert_eq!(received[0].0.type_name, UNDO_TYPE);
    assert_eq!(received[0].0.reason(), Some("denied"));
}

#[tokio::test]
async fn test_backend_unknown_action_is_undone() {
    let server = proxy_server().await;
    let mut recorder = common::EventRecorder::new(&server);

    let client = common::connect(&server, "10:uuid");
    client.handshake_with(Some(json!("good")));
    client.peer.wait_accepted().await;

    client.send_action(Action::new("nobody/knows"), "1 10:uuid 0");

    recorder
        .wait_for(|event| matches!(event, ServerEvent::UnknownType { id, .. } if id == "1 10:uuid 0"))
        .await;
    let received = client.peer.wait_for_actions(1).await;
    assert_eq!(received[0].0.reason(), Some("unknownType"));
}

#[tokio::test]
async fn test_backend_error_surfaces_as_error() {
    let server = proxy_server().await;
    let mut recorder = common::EventRecorder::new(&server);

    let client = common::connect(&server, "10:uuid");
    client.handshake_with(Some(json!("good")));
    client.peer.wait_accepted().await;

    client.send_action(Action::new("backend/broken"), "1 10:uuid 0");

    recorder
        .wait_for(|event| matches!(event, ServerEvent::Error { id: Some(id), message } if id == "1 10:uuid 0" && message.contains("stacktrace")))
        .await;
    let received = client.peer.wait_for_actions(1).await;
    assert_eq!(received[0].0.reason(), Some("error"));
}

#[test]
fn test_missing_control_secret_is_fatal() {
    let error = Server::new(ServerOptions {
        backend: Some("http://127.0.0.1:4000/".into()),
        ..common::test_options()
    })
    .unwrap_err();
    assert_eq!(error.kind(), "LOGUX_NO_CONTROL_SECRET");
}
