use offsync_core::{ApiErrorClass, BackendError, CollectionClient, Match};
use serde_json::json;
use wiremock::matchers::{body_json, header, method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

#[tokio::test]
async fn ping_sends_api_key_headers() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/rest/v1/"))
        .and(header("apikey", "test-key"))
        .and(header("authorization", "Bearer test-key"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({})))
        .expect(1)
        .mount(&server)
        .await;

    let client = CollectionClient::new(&server.uri(), "test-key").unwrap();
    client.ping().await.unwrap();
}

#[tokio::test]
async fn insert_posts_record_to_collection() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/rest/v1/document_regions"))
        .and(header("prefer", "return=minimal"))
        .and(body_json(json!({"id": "r1", "label": "Title"})))
        .respond_with(ResponseTemplate::new(201))
        .expect(1)
        .mount(&server)
        .await;

    let client = CollectionClient::new(&server.uri(), "test-key").unwrap();
    client
        .insert("document_regions", &json!({"id": "r1", "label": "Title"}))
        .await
        .unwrap();
}

#[tokio::test]
async fn update_patches_by_match() {
    let server = MockServer::start().await;

    Mock::given(method("PATCH"))
        .and(path("/rest/v1/document_regions"))
        .and(query_param("id", "eq.r1"))
        .and(body_json(json!({"label": "Renamed"})))
        .respond_with(ResponseTemplate::new(204))
        .expect(1)
        .mount(&server)
        .await;

    let client = CollectionClient::new(&server.uri(), "test-key").unwrap();
    client
        .update(
            "document_regions",
            &Match::eq("id", "r1"),
            &json!({"label": "Renamed"}),
        )
        .await
        .unwrap();
}

#[tokio::test]
async fn delete_by_match_uses_delete() {
    let server = MockServer::start().await;

    Mock::given(method("DELETE"))
        .and(path("/rest/v1/folders"))
        .and(query_param("id", "eq.f9"))
        .respond_with(ResponseTemplate::new(204))
        .expect(1)
        .mount(&server)
        .await;

    let client = CollectionClient::new(&server.uri(), "test-key").unwrap();
    client
        .delete("folders", &Match::eq("id", "f9"))
        .await
        .unwrap();
}

#[tokio::test]
async fn update_and_delete_refuse_empty_match() {
    let client = CollectionClient::new("http://127.0.0.1:9", "test-key").unwrap();
    assert!(matches!(
        client.update("folders", &Match::new(), &json!({})).await,
        Err(BackendError::EmptyMatch("update"))
    ));
    assert!(matches!(
        client.delete("folders", &Match::new()).await,
        Err(BackendError::EmptyMatch("delete"))
    ));
}

#[tokio::test]
async fn fetch_stamp_selects_id_and_updated_at() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/rest/v1/documents"))
        .and(query_param("id", "eq.d1"))
        .and(query_param("select", "id,updated_at"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([
            {"id": "d1", "updated_at": "2024-01-01T00:00:00Z"}
        ])))
        .mount(&server)
        .await;

    Mock::given(method("GET"))
        .and(path("/rest/v1/documents"))
        .and(query_param("id", "eq.gone"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([])))
        .mount(&server)
        .await;

    let client = CollectionClient::new(&server.uri(), "test-key").unwrap();
    let stamp = client.fetch_stamp("documents", "d1").await.unwrap().unwrap();
    assert_eq!(stamp.id, json!("d1"));
    assert_eq!(stamp.updated_at.as_deref(), Some("2024-01-01T00:00:00Z"));

    assert!(client.fetch_stamp("documents", "gone").await.unwrap().is_none());
}

#[tokio::test]
async fn fetch_record_returns_first_row() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/rest/v1/worksheets"))
        .and(query_param("id", "eq.w1"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([
            {"id": "w1", "title": "Fractions"}
        ])))
        .mount(&server)
        .await;

    let client = CollectionClient::new(&server.uri(), "test-key").unwrap();
    let record = client.fetch_record("worksheets", "w1").await.unwrap();
    assert_eq!(record, Some(json!({"id": "w1", "title": "Fractions"})));
}

#[tokio::test]
async fn api_errors_carry_status_and_retry_after() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/rest/v1/documents"))
        .respond_with(
            ResponseTemplate::new(429)
                .insert_header("retry-after", "7")
                .set_body_string("slow down"),
        )
        .mount(&server)
        .await;

    let client = CollectionClient::new(&server.uri(), "test-key").unwrap();
    let err = client
        .insert("documents", &json!({"id": "d1"}))
        .await
        .unwrap_err();

    assert_eq!(err.classification(), Some(ApiErrorClass::RateLimit));
    assert!(err.is_rate_limited());
    assert!(err.is_retryable());
    assert_eq!(err.retry_after_secs(), Some(7));
    assert!(!err.is_connectivity());
}

#[tokio::test]
async fn unreachable_backend_is_a_connectivity_error() {
    let client = CollectionClient::new("http://127.0.0.1:9", "test-key").unwrap();
    let err = client.ping().await.unwrap_err();
    assert!(err.is_connectivity());
    assert!(err.is_retryable());
}

#[tokio::test]
async fn timeouts_are_failed_attempts_not_connectivity_loss() {
    let server = MockServer::start().await;

    Mock::given(method("DELETE"))
        .and(path("/rest/v1/documents"))
        .respond_with(ResponseTemplate::new(204).set_delay(std::time::Duration::from_millis(400)))
        .mount(&server)
        .await;

    let client = CollectionClient::with_timeout(
        &server.uri(),
        "test-key",
        std::time::Duration::from_millis(100),
    )
    .unwrap();
    let err = client
        .delete("documents", &Match::eq("id", "d1"))
        .await
        .unwrap_err();

    assert!(!err.is_connectivity());
    assert!(err.is_retryable());
    assert!(!err.is_rate_limited());
}
