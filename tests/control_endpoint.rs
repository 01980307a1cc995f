//! Control endpoint behavior over real HTTP: the open status route and the
//! mask- and secret-gated command route.

mod common;

use serde_json::json;
use synclog::server::{Server, ServerEvent, ServerOptions};
use synclog::shared::ActionStatus;

fn listening_options() -> ServerOptions {
    ServerOptions {
        port: 0,
        control_port: 0,
        control_secret: Some("secret".into()),
        ..common::test_options()
    }
}

async fn listening_server(options: ServerOptions) -> (Server, std::net::SocketAddr) {
    let server = Server::new(options).unwrap();
    server.auth(|_request| async move { Ok(true) });
    let info = server.listen().await.unwrap();
    (server, info.control)
}

#[tokio::test]
async fn test_status_is_open() {
    let (server, control) = listening_server(listening_options()).await;

    let body = reqwest::get(format!("http://{control}/status"))
        .await
        .unwrap()
        .text()
        .await
        .unwrap();
    assert_eq!(body, "OK");

    server.destroy().await;
}

#[tokio::test]
async fn test_wrong_secret_is_refused_without_detail() {
    let (server, control) = listening_server(listening_options()).await;
    let mut recorder = common::EventRecorder::new(&server);

    let response = reqwest::Client::new()
        .post(format!("http://{control}/"))
        .json(&json!({ "version": 4, "secret": "wrong", "commands": [] }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status().as_u16(), 403);
    assert!(response.text().await.unwrap().is_empty());

    recorder
        .wait_for(|event| matches!(event, ServerEvent::WrongControlSecret { .. }))
        .await;

    server.destroy().await;
}

#[tokio::test]
async fn test_out_of_mask_address_is_refused() {
    let options = ServerOptions {
        control_mask: "10.0.0.0/8".into(),
        ..listening_options()
    };
    let (server, control) = listening_server(options).await;
    let mut recorder = common::EventRecorder::new(&server);

    let response = reqwest::Client::new()
        .post(format!("http://{control}/"))
        .json(&json!({ "version": 4, "secret": "secret", "commands": [] }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status().as_u16(), 403);

    recorder
        .wait_for(|event| matches!(event, ServerEvent::WrongControlIp { .. }))
        .await;

    server.destroy().await;
}

#[tokio::test]
async fn test_backend_action_command_enters_the_log() {
    let (server, control) = listening_server(listening_options()).await;

    let response = reqwest::Client::new()
        .post(format!("http://{control}/"))
        .json(&json!({
            "version": 4,
            "secret": "secret",
            "commands": [
                ["action", { "type": "news/add", "text": "hi" }, { "id": "1 10:uuid 0", "time": 1 }],
            ],
        }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status().as_u16(), 200);

    common::wait_until(|| !server.log().entries().is_empty()).await;
    let (action, meta) = &server.log().entries()[0];
    assert_eq!(action.type_name, "news/add");
    // No local processor knows the type, so the pipeline must not touch it.
    assert_eq!(meta.status, Some(ActionStatus::Processed));
    assert_eq!(meta.extra["backend"], "127.0.0.1");

    server.destroy().await;
}

#[tokio::test]
async fn test_malformed_command_is_rejected() {
    let (server, control) = listening_server(listening_options()).await;

    let response = reqwest::Client::new()
        .post(format!("http://{control}/"))
        .json(&json!({
            "version": 4,
            "secret": "secret",
            "commands": [["action", 42]],
        }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status().as_u16(), 400);

    server.destroy().await;
}
