// HTTP transport tests against a mock node

#![cfg(feature = "http")]

use docrouter_core::{BatchSlot, Endpoint, EndpointId, OperationSpec, Role};
use docrouter_transport::{HttpTransport, HttpTransportConfig, RouterTransport, TransportError};
use serde_json::json;

fn endpoint(url: &str) -> Endpoint {
    Endpoint {
        id: EndpointId::new("node-a"),
        url: url.to_string(),
        role: Role::Primary,
        position: 0,
    }
}

fn transport() -> HttpTransport {
    HttpTransport::new(HttpTransportConfig {
        timeout_ms: 2000,
        ..Default::default()
    })
    .unwrap()
}

#[tokio::test]
async fn test_single_get_returns_json_body() {
    let mut server = mockito::Server::new_async().await;
    let mock = server
        .mock("GET", "/databases/shop/docs")
        .match_query(mockito::Matcher::UrlEncoded(
            "id".to_string(),
            "users/1".to_string(),
        ))
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(r#"{"name":"Ayende"}"#)
        .create_async()
        .await;

    let value = transport()
        .send(
            &endpoint(&server.url()),
            "shop",
            &OperationSpec::get("/docs").with_query("id=users/1"),
        )
        .await
        .unwrap();

    assert_eq!(value, json!({"name": "Ayende"}));
    mock.assert_async().await;
}

#[tokio::test]
async fn test_put_sends_json_body() {
    let mut server = mockito::Server::new_async().await;
    let mock = server
        .mock("PUT", "/databases/shop/docs/users/1")
        .match_body(mockito::Matcher::Json(json!({"name": "Oren"})))
        .with_status(201)
        .with_body(r#"{"etag":5}"#)
        .create_async()
        .await;

    let value = transport()
        .send(
            &endpoint(&server.url()),
            "shop",
            &OperationSpec::put("/docs/users/1", json!({"name": "Oren"})),
        )
        .await
        .unwrap();

    assert_eq!(value["etag"], 5);
    mock.assert_async().await;
}

#[tokio::test]
async fn test_conflict_is_application_error() {
    let mut server = mockito::Server::new_async().await;
    let _mock = server
        .mock("PUT", "/databases/shop/docs/users/1")
        .with_status(409)
        .with_body("etag mismatch")
        .create_async()
        .await;

    let err = transport()
        .send(
            &endpoint(&server.url()),
            "shop",
            &OperationSpec::put("/docs/users/1", json!({})),
        )
        .await
        .unwrap_err();

    assert!(!err.is_connectivity());
    match err {
        TransportError::Application(app) => {
            assert_eq!(app.status, 409);
            assert!(app.message.contains("etag mismatch"));
        }
        other => panic!("unexpected error: {:?}", other),
    }
}

#[tokio::test]
async fn test_service_unavailable_is_connectivity() {
    let mut server = mockito::Server::new_async().await;
    let _mock = server
        .mock("GET", "/databases/shop/stats")
        .with_status(503)
        .create_async()
        .await;

    let err = transport()
        .send(&endpoint(&server.url()), "shop", &OperationSpec::get("/stats"))
        .await
        .unwrap_err();

    assert!(err.is_connectivity());
}

#[tokio::test]
async fn test_refused_connection_is_connectivity() {
    let err = transport()
        .send(
            &endpoint("http://127.0.0.1:1"),
            "shop",
            &OperationSpec::get("/stats"),
        )
        .await
        .unwrap_err();

    assert!(err.is_connectivity(), "got {:?}", err);
}

#[tokio::test]
async fn test_batch_round_trip() {
    let mut server = mockito::Server::new_async().await;
    let slots = vec![
        BatchSlot::ok(json!({"id": "users/1"})),
        BatchSlot::error(404, "users/2 not found"),
    ];
    let mock = server
        .mock("POST", "/databases/shop/multi_get")
        .match_header("content-type", "application/json")
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(serde_json::to_string(&slots).unwrap())
        .create_async()
        .await;

    let result = transport()
        .send_batch(
            &endpoint(&server.url()),
            "shop",
            &[OperationSpec::get("/docs/users/1"), OperationSpec::get("/docs/users/2")],
        )
        .await
        .unwrap();

    assert_eq!(result, slots);
    mock.assert_async().await;
}

#[tokio::test]
async fn test_batch_cardinality_mismatch_is_codec_error() {
    let mut server = mockito::Server::new_async().await;
    let _mock = server
        .mock("POST", "/databases/shop/multi_get")
        .with_status(200)
        .with_body(serde_json::to_string(&vec![BatchSlot::ok(json!(1))]).unwrap())
        .create_async()
        .await;

    let err = transport()
        .send_batch(
            &endpoint(&server.url()),
            "shop",
            &[OperationSpec::get("/a"), OperationSpec::get("/b")],
        )
        .await
        .unwrap_err();

    assert!(matches!(err, TransportError::Codec(_)));
}

#[tokio::test]
async fn test_fetch_topology() {
    let mut server = mockito::Server::new_async().await;
    let _mock = server
        .mock("GET", "/databases/shop/topology")
        .with_status(200)
        .with_body(
            json!({
                "version": 4,
                "endpoints": [
                    {"id": "a", "url": "http://a:8080", "role": "primary"},
                    {"id": "b", "url": "http://b:8080", "role": "secondary"}
                ]
            })
            .to_string(),
        )
        .create_async()
        .await;

    let descriptor = transport()
        .fetch_topology(&server.url(), "shop")
        .await
        .unwrap();

    assert_eq!(descriptor.version, 4);
    assert_eq!(descriptor.endpoints.len(), 2);
    assert_eq!(descriptor.endpoints[1].role, Role::Secondary);
}
