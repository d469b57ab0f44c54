//! API integration tests against a running server

use reqwest::Client;
use serde_json::{json, Value};

const BASE_URL: &str = "http://localhost:8080/api/v1";

/// Acquire `quantity` units of a uniquely named type and return its id
async fn create_equipment(client: &Client, quantity: u32) -> String {
    let response = client
        .post(format!("{}/equipment", BASE_URL))
        .json(&json!({
            "name": format!("Test Ball {}", uuid::Uuid::new_v4()),
            "brand": "Mikasa",
            "acquired_at": "2024-06-01T08:00:00Z",
            "quantity": quantity
        }))
        .send()
        .await
        .expect("Failed to send request");

    assert_eq!(response.status(), 201);
    let body: Value = response.json().await.expect("Failed to parse response");
    body["equipment_type"]["id"]
        .as_str()
        .expect("No equipment type id in response")
        .to_string()
}

#[tokio::test]
#[ignore] // Run with: cargo test -- --ignored
async fn test_health_check() {
    let client = Client::new();

    let response = client
        .get(format!("{}/health", BASE_URL))
        .send()
        .await
        .expect("Failed to send request");

    assert!(response.status().is_success());

    let body: Value = response.json().await.expect("Failed to parse response");
    assert_eq!(body["status"], "healthy");
}

#[tokio::test]
#[ignore]
async fn test_readiness() {
    let client = Client::new();

    let response = client
        .get(format!("{}/ready", BASE_URL))
        .send()
        .await
        .expect("Failed to send request");

    assert!(response.status().is_success());
    let body: Value = response.json().await.expect("Failed to parse response");
    assert_eq!(body["status"], "ready");
}

#[tokio::test]
#[ignore]
async fn test_new_equipment_is_available() {
    let client = Client::new();
    let type_id = create_equipment(&client, 3).await;

    let response = client
        .get(format!("{}/equipment/{}/availability", BASE_URL, type_id))
        .send()
        .await
        .expect("Failed to send request");

    assert!(response.status().is_success());
    let body: Value = response.json().await.expect("Failed to parse response");
    assert_eq!(body["total"], 3);
    assert_eq!(body["available"], 3);
    assert_eq!(body["reserved"], 0);
    assert_eq!(body["borrowed"], 0);
}

#[tokio::test]
#[ignore]
async fn test_create_equipment_rejects_zero_quantity() {
    let client = Client::new();

    let response = client
        .post(format!("{}/equipment", BASE_URL))
        .json(&json!({
            "name": "Volleyball",
            "acquired_at": "2024-06-01T08:00:00Z",
            "quantity": 0
        }))
        .send()
        .await
        .expect("Failed to send request");

    assert_eq!(response.status(), 400);
    let body: Value = response.json().await.expect("Failed to parse response");
    assert_eq!(body["error"], "BadValue");
}

#[tokio::test]
#[ignore]
async fn test_equipment_type_not_found() {
    let client = Client::new();

    let response = client
        .get(format!("{}/equipment/{}", BASE_URL, uuid::Uuid::new_v4()))
        .send()
        .await
        .expect("Failed to send request");

    assert_eq!(response.status(), 404);
}

#[tokio::test]
#[ignore]
async fn test_borrow_request_over_stock_is_a_conflict() {
    let client = Client::new();
    let type_id = create_equipment(&client, 1).await;

    let response = client
        .post(format!("{}/borrow-requests", BASE_URL))
        .json(&json!({
            "requested_by": uuid::Uuid::new_v4(),
            "location": "Gym",
            "purpose": "Practice",
            "expected_return_at": "2030-01-01T17:00:00Z",
            "equipments": [{ "equipment_type_id": type_id, "quantity": 2 }]
        }))
        .send()
        .await
        .expect("Failed to send request");

    assert_eq!(response.status(), 409);
    let body: Value = response.json().await.expect("Failed to parse response");
    assert_eq!(body["error"], "InsufficientQuantity");
}

#[tokio::test]
#[ignore]
async fn test_receive_with_wrong_code_is_forbidden() {
    let client = Client::new();

    let response = client
        .post(format!("{}/borrow-requests/{}/receive", BASE_URL, uuid::Uuid::new_v4()))
        .json(&json!({ "code": "000000" }))
        .send()
        .await
        .expect("Failed to send request");

    assert!(response.status() == 403 || response.status() == 404);
}

#[tokio::test]
#[ignore]
async fn test_openapi_document_lists_pipelines() {
    let client = Client::new();

    let response = client
        .get("http://localhost:8080/api-docs/openapi.json")
        .send()
        .await
        .expect("Failed to send request");

    assert!(response.status().is_success());
    let body: Value = response.json().await.expect("Failed to parse response");
    assert!(body["paths"]["/borrow-requests/{id}/receive"].is_object());
    assert!(body["paths"]["/return-requests/{id}/confirm"].is_object());
}
