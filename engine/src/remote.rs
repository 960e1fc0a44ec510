//! Remote backend client.
//!
//! The orchestrator talks to the backend through [`RemoteBackend`], so tests
//! can swap in an in-memory backend. [`HttpRemote`] speaks the JSON protocol
//! of the reference server:
//!
//! | Call | Request |
//! |---|---|
//! | probe | `GET /health` |
//! | create | `POST /tables/{table}` |
//! | update | `PUT /tables/{table}/{id}` |
//! | delete | `DELETE /tables/{table}/{id}?updatedAt={ts}` |
//! | pull | `GET /changes?since={ts}` |

use crate::{error::RemoteError, Operation, QueueEntry, Record, Timestamp};
use async_trait::async_trait;
use reqwest::StatusCode;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::time::Duration;

/// Records changed on the backend since a cursor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PullResponse {
    pub records: Vec<Record>,
    /// Backend clock when the change query started; the next cursor
    pub server_time: Timestamp,
}

/// The remote system of record.
#[async_trait]
pub trait RemoteBackend: Send + Sync {
    /// Apply one queued mutation. Returns the record as stored remotely.
    async fn apply(&self, entry: &QueueEntry) -> Result<Record, RemoteError>;

    /// Fetch records changed after `since`, or everything when `None`.
    async fn pull(&self, since: Option<Timestamp>) -> Result<PullResponse, RemoteError>;

    /// Cheap reachability check.
    async fn probe(&self) -> Result<(), RemoteError>;
}

/// HTTP implementation of [`RemoteBackend`].
#[derive(Clone)]
pub struct HttpRemote {
    base_url: String,
    token: Option<String>,
    probe_timeout: Duration,
    client: reqwest::Client,
}

impl std::fmt::Debug for HttpRemote {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpRemote")
            .field("base_url", &self.base_url)
            .field("token", &self.token.as_ref().map(|_| "[REDACTED]"))
            .field("probe_timeout", &self.probe_timeout)
            .finish()
    }
}

impl HttpRemote {
    pub fn new(
        base_url: impl Into<String>,
        token: Option<String>,
        probe_timeout: Duration,
    ) -> Result<Self, RemoteError> {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(transport)?;

        Ok(Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            token,
            probe_timeout,
            client,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    fn authorize(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }

    async fn send<T: DeserializeOwned>(
        &self,
        request: reqwest::RequestBuilder,
    ) -> Result<T, RemoteError> {
        let response = self
            .authorize(request)
            .header("Accept", "application/json")
            .send()
            .await
            .map_err(transport)?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(classify(status, &body));
        }

        response.json::<T>().await.map_err(transport)
    }
}

#[async_trait]
impl RemoteBackend for HttpRemote {
    async fn apply(&self, entry: &QueueEntry) -> Result<Record, RemoteError> {
        let table = &entry.table;
        let id = &entry.record_id;
        let request = match entry.operation {
            Operation::Create => self
                .client
                .post(self.url(&format!("/tables/{table}")))
                .json(&entry.payload),
            Operation::Update => self
                .client
                .put(self.url(&format!("/tables/{table}/{id}")))
                .json(&entry.payload),
            Operation::Delete => self
                .client
                .delete(self.url(&format!("/tables/{table}/{id}")))
                .query(&[("updatedAt", entry.payload.updated_at)]),
        };

        tracing::debug!(
            sequence = entry.sequence,
            key = %entry.key(),
            operation = %entry.operation,
            "applying mutation remotely"
        );
        self.send(request).await
    }

    async fn pull(&self, since: Option<Timestamp>) -> Result<PullResponse, RemoteError> {
        let mut request = self.client.get(self.url("/changes"));
        if let Some(since) = since {
            request = request.query(&[("since", since)]);
        }
        self.send(request).await
    }

    async fn probe(&self) -> Result<(), RemoteError> {
        let request = self
            .client
            .get(self.url("/health"))
            .timeout(self.probe_timeout);
        let response = self
            .authorize(request)
            .send()
            .await
            .map_err(transport)?;

        if response.status().is_success() {
            Ok(())
        } else {
            Err(RemoteError::Network(format!(
                "health check returned HTTP {}",
                response.status().as_u16()
            )))
        }
    }
}

/// Stand-in backend for an engine with no remote configured. Every call
/// fails as a network error, so mutations simply stay queued.
#[derive(Debug, Clone, Copy, Default)]
pub struct Disconnected;

#[async_trait]
impl RemoteBackend for Disconnected {
    async fn apply(&self, _entry: &QueueEntry) -> Result<Record, RemoteError> {
        Err(not_configured())
    }

    async fn pull(&self, _since: Option<Timestamp>) -> Result<PullResponse, RemoteError> {
        Err(not_configured())
    }

    async fn probe(&self) -> Result<(), RemoteError> {
        Err(not_configured())
    }
}

fn not_configured() -> RemoteError {
    RemoteError::Network("no remote backend configured".to_string())
}

fn transport(err: reqwest::Error) -> RemoteError {
    RemoteError::Network(err.to_string())
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    error: Option<String>,
    details: Option<String>,
    current: Option<Record>,
}

/// Map a non-success response to a [`RemoteError`].
///
/// Server faults, throttling and auth failures are transient: the request is
/// retried once the condition clears instead of burning the entry's
/// rejection budget.
pub fn classify(status: StatusCode, body: &str) -> RemoteError {
    let parsed = serde_json::from_str::<ErrorBody>(body).ok();
    let message = parsed
        .as_ref()
        .and_then(|b| b.details.clone().or_else(|| b.error.clone()))
        .unwrap_or_else(|| {
            let trimmed = body.trim();
            if trimmed.is_empty() {
                format!("HTTP {}", status.as_u16())
            } else {
                trimmed.to_string()
            }
        });

    match status {
        StatusCode::CONFLICT => match parsed.and_then(|b| b.current) {
            Some(current) => RemoteError::Conflict {
                current: Box::new(current),
            },
            None => RemoteError::Rejected {
                status: status.as_u16(),
                message,
            },
        },
        StatusCode::NOT_FOUND => RemoteError::NotFound,
        StatusCode::TOO_MANY_REQUESTS
        | StatusCode::UNAUTHORIZED
        | StatusCode::FORBIDDEN
        | StatusCode::REQUEST_TIMEOUT => {
            RemoteError::Network(format!("{message} ({})", status.as_u16()))
        }
        s if s.is_client_error() => RemoteError::Rejected {
            status: s.as_u16(),
            message,
        },
        s => RemoteError::Network(format!("{message} ({})", s.as_u16())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn conflict_carries_current_record() {
        let body = json!({
            "error": "stale write",
            "current": { "table": "tools", "id": "42", "fields": {"status": "lost"}, "updatedAt": 99 }
        })
        .to_string();

        match classify(StatusCode::CONFLICT, &body) {
            RemoteError::Conflict { current } => {
                assert_eq!(current.id, "42");
                assert_eq!(current.updated_at, 99);
            }
            other => panic!("expected conflict, got {other:?}"),
        }
    }

    #[test]
    fn conflict_without_record_is_a_rejection() {
        assert!(matches!(
            classify(StatusCode::CONFLICT, r#"{"error":"duplicate"}"#),
            RemoteError::Rejected { status: 409, .. }
        ));
    }

    #[test]
    fn validation_failures_are_rejections() {
        let err = classify(
            StatusCode::UNPROCESSABLE_ENTITY,
            r#"{"error":"Invalid request","details":"quantity must be positive"}"#,
        );
        assert_eq!(
            err,
            RemoteError::Rejected {
                status: 422,
                message: "quantity must be positive".to_string()
            }
        );
        assert!(!err.is_transient());
    }

    #[test]
    fn server_faults_and_throttling_are_transient() {
        for status in [
            StatusCode::INTERNAL_SERVER_ERROR,
            StatusCode::BAD_GATEWAY,
            StatusCode::SERVICE_UNAVAILABLE,
            StatusCode::TOO_MANY_REQUESTS,
            StatusCode::UNAUTHORIZED,
            StatusCode::FORBIDDEN,
        ] {
            assert!(classify(status, "").is_transient(), "{status}");
        }
    }

    #[test]
    fn not_found_is_reported_as_such() {
        assert_eq!(classify(StatusCode::NOT_FOUND, ""), RemoteError::NotFound);
    }

    #[test]
    fn plain_text_bodies_become_messages() {
        assert_eq!(
            classify(StatusCode::BAD_REQUEST, "  bad table name \n"),
            RemoteError::Rejected {
                status: 400,
                message: "bad table name".to_string()
            }
        );
        assert_eq!(
            classify(StatusCode::BAD_REQUEST, ""),
            RemoteError::Rejected {
                status: 400,
                message: "HTTP 400".to_string()
            }
        );
    }

    #[test]
    fn base_url_trailing_slash_is_trimmed() {
        let remote =
            HttpRemote::new("http://localhost:3000/", None, Duration::from_secs(1)).unwrap();
        assert_eq!(remote.url("/health"), "http://localhost:3000/health");
    }

    #[test]
    fn debug_redacts_token() {
        let remote = HttpRemote::new(
            "http://localhost:3000",
            Some("secret-token".to_string()),
            Duration::from_secs(1),
        )
        .unwrap();
        let debug = format!("{remote:?}");
        assert!(!debug.contains("secret-token"));
        assert!(debug.contains("REDACTED"));
    }
}
