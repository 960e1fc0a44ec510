//! Wire format tests for the record protocol.
//!
//! These pin the JSON shapes shared by the server and `HttpRemote`; they do
//! not need a database.

use axum::http::StatusCode;
use custody_engine::{remote::classify, PullResponse, Record, RemoteError};
use serde_json::json;

fn tool(status: &str, at: u64) -> Record {
    Record::new(
        "tools",
        "42",
        json!({ "status": status }).as_object().cloned().unwrap(),
        at,
    )
}

#[test]
fn record_uses_camel_case_fields() {
    let value = serde_json::to_value(tool("available", 1_706_745_600_000)).unwrap();

    assert_eq!(
        value,
        json!({
            "table": "tools",
            "id": "42",
            "fields": {"status": "available"},
            "updatedAt": 1_706_745_600_000u64,
            "deleted": false
        })
    );
}

#[test]
fn record_defaults_missing_fields_and_flag() {
    let record: Record =
        serde_json::from_value(json!({"table": "kits", "id": "k1", "updatedAt": 5})).unwrap();

    assert!(record.fields.is_empty());
    assert!(!record.deleted);
}

#[test]
fn change_feed_carries_server_time() {
    let response = PullResponse {
        records: vec![tool("checked_out", 10), Record::tombstone("tools", "7", 11)],
        server_time: 12,
    };
    let value = serde_json::to_value(&response).unwrap();

    assert_eq!(value["serverTime"], 12);
    assert_eq!(value["records"][1]["deleted"], true);

    let parsed: PullResponse = serde_json::from_value(value).unwrap();
    assert_eq!(parsed, response);
}

#[test]
fn stale_write_body_round_trips_to_the_client() {
    let current = tool("retired", 9_000);
    let body = json!({
        "error": "Stale write",
        "details": "stored version of tools/42 is at 9000",
        "current": current,
    })
    .to_string();

    assert_eq!(
        classify(StatusCode::CONFLICT, &body),
        RemoteError::Conflict {
            current: Box::new(current)
        }
    );
}

#[test]
fn client_retries_what_the_server_cannot_do_now() {
    for status in [
        StatusCode::INTERNAL_SERVER_ERROR,
        StatusCode::SERVICE_UNAVAILABLE,
        StatusCode::UNAUTHORIZED,
    ] {
        let body = json!({"error": "Internal server error"}).to_string();
        assert!(classify(status, &body).is_transient(), "{status}");
    }

    let body = json!({"error": "Invalid record", "details": "missing required field: status"})
        .to_string();
    assert_eq!(
        classify(StatusCode::UNPROCESSABLE_ENTITY, &body),
        RemoteError::Rejected {
            status: 422,
            message: "missing required field: status".to_string()
        }
    );
}
