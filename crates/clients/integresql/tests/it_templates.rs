//! Integration tests for the template API client

use std::time::Duration;

use integresql_client::{
    Client, CreateTemplate, CreateTemplateError, FinalizeTemplateError, GetTestDatabaseError,
    InvalidHashError,
};
use mockito::{Matcher, Server};
use url::Url;

const HASH: &str = "06877cbd06877cbd06877cbd06877cbd";

const TEMPLATE_BODY: &str = r#"{
    "database": {
        "templateHash": "06877cbd06877cbd06877cbd06877cbd",
        "config": {
            "host": "integresql-db",
            "port": 5432,
            "username": "dbuser",
            "password": "dbpass",
            "database": "integresql_template_06877cbd"
        }
    }
}"#;

const TEST_DATABASE_BODY: &str = r#"{
    "id": 7,
    "database": {
        "templateHash": "06877cbd06877cbd06877cbd06877cbd",
        "config": {
            "host": "integresql-db",
            "port": 5432,
            "username": "dbuser",
            "password": "dbpass",
            "database": "integresql_test_06877cbd_007"
        }
    }
}"#;

fn client(server: &Server) -> Client {
    let base_url = Url::parse(&server.url()).expect("valid server url");
    Client::new(base_url, Duration::from_secs(5)).expect("Failed to build client")
}

#[tokio::test]
async fn create_returns_template_connection_info() {
    //* Given
    let mut server = Server::new_async().await;
    let mock = server
        .mock("POST", "/api/v1/templates")
        .match_body(Matcher::Json(serde_json::json!({ "hash": HASH })))
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(TEMPLATE_BODY)
        .expect(1)
        .create_async()
        .await;

    //* When
    let created = client(&server)
        .templates()
        .create(HASH)
        .await
        .expect("Failed to create template");

    //* Then
    mock.assert_async().await;
    let CreateTemplate::Created(template) = created else {
        panic!("expected a created template, got {created:?}");
    };
    assert_eq!(template.database.template_hash, HASH);
    assert_eq!(template.database.config.database, "integresql_template_06877cbd");
}

#[tokio::test]
async fn create_maps_locked_to_a_non_error() {
    //* Given
    let mut server = Server::new_async().await;
    let mock = server
        .mock("POST", "/api/v1/templates")
        .with_status(423)
        .expect(1)
        .create_async()
        .await;

    //* When
    let created = client(&server).templates().create(HASH).await;

    //* Then
    mock.assert_async().await;
    assert_eq!(created.expect("locked is not an error"), CreateTemplate::Locked);
}

#[tokio::test]
async fn create_rejects_an_empty_body() {
    //* Given
    let mut server = Server::new_async().await;
    let _mock = server
        .mock("POST", "/api/v1/templates")
        .with_status(200)
        .create_async()
        .await;

    //* When
    let err = client(&server)
        .templates()
        .create(HASH)
        .await
        .expect_err("empty body must fail");

    //* Then
    assert!(
        matches!(err, CreateTemplateError::UnexpectedResponse { status: 200, ref message } if message.contains("empty")),
        "{err:?}"
    );
}

#[tokio::test]
async fn create_reports_malformed_body_with_its_content() {
    //* Given
    let mut server = Server::new_async().await;
    let _mock = server
        .mock("POST", "/api/v1/templates")
        .with_status(200)
        .with_body(r#"{"unexpected": true}"#)
        .create_async()
        .await;

    //* When
    let err = client(&server)
        .templates()
        .create(HASH)
        .await
        .expect_err("malformed body must fail");

    //* Then
    assert!(
        matches!(err, CreateTemplateError::UnexpectedResponse { ref message, .. } if message.contains(r#"{"unexpected": true}"#)),
        "{err:?}"
    );
}

#[tokio::test]
async fn create_reports_unexpected_status() {
    //* Given
    let mut server = Server::new_async().await;
    let _mock = server
        .mock("POST", "/api/v1/templates")
        .with_status(503)
        .with_body("service unavailable")
        .create_async()
        .await;

    //* When
    let err = client(&server)
        .templates()
        .create(HASH)
        .await
        .expect_err("503 must fail");

    //* Then
    assert!(matches!(
        err,
        CreateTemplateError::UnexpectedResponse { status: 503, ref message } if message == "service unavailable"
    ));
}

#[tokio::test]
async fn invalid_hash_is_rejected_without_a_request() {
    //* Given
    let mut server = Server::new_async().await;
    let mock = server
        .mock("POST", "/api/v1/templates")
        .expect(0)
        .create_async()
        .await;

    //* When
    let err = client(&server)
        .templates()
        .create("too-short")
        .await
        .expect_err("short hash must fail");

    //* Then
    mock.assert_async().await;
    assert!(matches!(err, CreateTemplateError::InvalidHash(_)));
}

#[tokio::test]
async fn non_hex_hash_is_rejected_without_a_request() {
    //* Given
    let mut server = Server::new_async().await;
    let mock = server
        .mock("GET", Matcher::Any)
        .expect(0)
        .create_async()
        .await;

    //* When
    let err = client(&server)
        .templates()
        .get_test_database("../../../../admin/secrets0000000")
        .await
        .expect_err("non-hex hash must fail");

    //* Then
    mock.assert_async().await;
    assert!(matches!(
        err,
        GetTestDatabaseError::InvalidHash(InvalidHashError::InvalidCharacter { index: 0, .. })
    ));
}

#[tokio::test]
async fn finalize_requires_a_success_status() {
    //* Given
    let mut server = Server::new_async().await;
    let ok = server
        .mock("PUT", format!("/api/v1/templates/{HASH}").as_str())
        .with_status(204)
        .expect(1)
        .create_async()
        .await;

    //* When
    let result = client(&server).templates().finalize(HASH).await;

    //* Then
    ok.assert_async().await;
    result.expect("204 finalizes the template");

    //* Given
    ok.remove_async().await;
    let _failing = server
        .mock("PUT", format!("/api/v1/templates/{HASH}").as_str())
        .with_status(404)
        .with_body("template not found")
        .create_async()
        .await;

    //* When
    let err = client(&server)
        .templates()
        .finalize(HASH)
        .await
        .expect_err("404 must fail");

    //* Then
    assert!(matches!(
        err,
        FinalizeTemplateError::UnexpectedResponse { status: 404, .. }
    ));
}

#[tokio::test]
async fn discard_tolerates_missing_templates() {
    //* Given
    let mut server = Server::new_async().await;
    let mock = server
        .mock("DELETE", format!("/api/v1/templates/{HASH}").as_str())
        .with_status(404)
        .expect(1)
        .create_async()
        .await;

    //* When
    let result = client(&server).templates().discard(HASH).await;

    //* Then
    mock.assert_async().await;
    result.expect("missing template counts as discarded");
}

#[tokio::test]
async fn get_test_database_returns_descriptor() {
    //* Given
    let mut server = Server::new_async().await;
    let mock = server
        .mock("GET", format!("/api/v1/templates/{HASH}/tests").as_str())
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(TEST_DATABASE_BODY)
        .expect(1)
        .create_async()
        .await;

    //* When
    let db = client(&server)
        .templates()
        .get_test_database(HASH)
        .await
        .expect("Failed to get test database");

    //* Then
    mock.assert_async().await;
    let db = db.expect("template exists");
    assert_eq!(db.id, 7);
    assert_eq!(db.database.config.database, "integresql_test_06877cbd_007");
    assert_eq!(db.database.config.host, "integresql-db");
}

#[tokio::test]
async fn get_test_database_maps_not_found_to_none() {
    //* Given
    let mut server = Server::new_async().await;
    let _mock = server
        .mock("GET", format!("/api/v1/templates/{HASH}/tests").as_str())
        .with_status(404)
        .create_async()
        .await;

    //* When
    let db = client(&server).templates().get_test_database(HASH).await;

    //* Then
    assert_eq!(db.expect("404 is not an error"), None);
}

#[tokio::test]
async fn get_test_database_reports_network_errors() {
    //* Given
    // Nothing listens on the discard port
    let base_url = Url::parse("http://127.0.0.1:9").expect("valid url");
    let client = Client::new(base_url, Duration::from_secs(1)).expect("Failed to build client");

    //* When
    let err = client
        .templates()
        .get_test_database(HASH)
        .await
        .expect_err("connection must fail");

    //* Then
    assert!(
        matches!(err, GetTestDatabaseError::Network { ref url, .. } if url.ends_with("/api/v1/templates/06877cbd06877cbd06877cbd06877cbd/tests"))
    );
}

#[tokio::test]
async fn release_test_database_deletes_by_id() {
    //* Given
    let mut server = Server::new_async().await;
    let mock = server
        .mock("DELETE", format!("/api/v1/templates/{HASH}/tests/7").as_str())
        .with_status(204)
        .expect(1)
        .create_async()
        .await;

    //* When
    let result = client(&server)
        .templates()
        .release_test_database(HASH, 7)
        .await;

    //* Then
    mock.assert_async().await;
    result.expect("Failed to release test database");
}
