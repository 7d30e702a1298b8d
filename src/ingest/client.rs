//! Ingest service client
//!
//! Uploads one segment per request as multipart form data and classifies the
//! response. Retry policy belongs to the caller.

use crate::config::IngestSettings;
use crate::recorder::buffer::Segment;
use crate::recorder::state::{Credential, SourceKind};
use async_trait::async_trait;
use reqwest::multipart::{Form, Part};
use reqwest::StatusCode;
use serde::Deserialize;
use serde_json::Value;
use std::time::Duration;

/// Identity of the recording a segment belongs to
#[derive(Debug, Clone)]
pub struct SessionMeta {
    pub session_id: String,
    pub source_kind: SourceKind,
    pub credential: Credential,
}

/// Result of one upload attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UploadOutcome {
    /// Stored; carries the service's capture id when it sent one
    Accepted(Option<String>),
    /// Explicitly refused (4xx)
    Rejected(String),
    /// Network error or server-side failure
    TransientFailure(String),
}

impl UploadOutcome {
    pub fn is_accepted(&self) -> bool {
        matches!(self, UploadOutcome::Accepted(_))
    }
}

/// Anything that can deliver a segment
#[async_trait]
pub trait SegmentUploader: Send + Sync {
    async fn upload(&self, segment: Segment, meta: &SessionMeta) -> UploadOutcome;
}

#[derive(Debug, Deserialize)]
struct AcceptedBody {
    #[serde(rename = "captureId")]
    capture_id: Option<Value>,
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    message: Option<Value>,
}

/// HTTP client for the ingest endpoint
#[derive(Debug, Clone)]
pub struct IngestClient {
    http: reqwest::Client,
    url: String,
}

impl IngestClient {
    pub fn new(settings: &IngestSettings) -> Result<Self, reqwest::Error> {
        let mut builder = reqwest::Client::builder().user_agent(concat!(
            env!("CARGO_PKG_NAME"),
            "/",
            env!("CARGO_PKG_VERSION")
        ));
        if let Some(secs) = settings.request_timeout_secs {
            builder = builder.timeout(Duration::from_secs(secs));
        }

        Ok(Self {
            http: builder.build()?,
            url: settings.upload_url(),
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    fn form(segment: Segment, meta: &SessionMeta) -> Result<Form, reqwest::Error> {
        let file_name = segment_file_name(&segment, meta.source_kind);
        // codec parameters are not valid in a part content type
        let essence = segment
            .mime_type
            .split(';')
            .next()
            .unwrap_or("video/webm")
            .trim()
            .to_string();

        let video = Part::stream(segment.payload)
            .file_name(file_name)
            .mime_str(&essence)?;

        Ok(Form::new()
            .part("video", video)
            .text("olympiadId", meta.session_id.clone())
            .text("captureType", meta.source_kind.as_str()))
    }
}

#[async_trait]
impl SegmentUploader for IngestClient {
    async fn upload(&self, segment: Segment, meta: &SessionMeta) -> UploadOutcome {
        let size = segment.payload.len();
        let is_final = segment.is_final;

        let form = match Self::form(segment, meta) {
            Ok(form) => form,
            Err(e) => return UploadOutcome::Rejected(format!("Invalid segment: {}", e)),
        };

        let response = match self
            .http
            .post(&self.url)
            .bearer_auth(meta.credential.expose())
            .multipart(form)
            .send()
            .await
        {
            Ok(response) => response,
            Err(e) => {
                tracing::warn!("Upload of {} bytes failed in transport: {}", size, e);
                return UploadOutcome::TransientFailure(e.to_string());
            }
        };

        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        let outcome = classify(status, &body);

        match &outcome {
            UploadOutcome::Accepted(capture_id) => tracing::debug!(
                "Uploaded {} segment ({} bytes), capture id {:?}",
                if is_final { "final" } else { "chunk" },
                size,
                capture_id
            ),
            UploadOutcome::Rejected(reason) => {
                tracing::warn!("Ingest service rejected segment ({}): {}", status, reason)
            }
            UploadOutcome::TransientFailure(cause) => {
                tracing::warn!("Ingest service failed ({}): {}", status, cause)
            }
        }
        outcome
    }
}

/// `<kind>-<chunk|final>-<unix millis>.<ext>`
pub fn segment_file_name(segment: &Segment, kind: SourceKind) -> String {
    format!(
        "{}-{}-{}.{}",
        kind.as_str(),
        if segment.is_final { "final" } else { "chunk" },
        segment.created_at.timestamp_millis(),
        segment.extension()
    )
}

/// Map an HTTP response onto an upload outcome
pub fn classify(status: StatusCode, body: &str) -> UploadOutcome {
    if status.is_success() {
        let capture_id = serde_json::from_str::<AcceptedBody>(body)
            .ok()
            .and_then(|b| b.capture_id)
            .and_then(|id| match id {
                Value::String(s) => Some(s),
                Value::Number(n) => Some(n.to_string()),
                _ => None,
            });
        return UploadOutcome::Accepted(capture_id);
    }

    let reason = error_message(body).unwrap_or_else(|| status.to_string());
    if status.is_client_error() {
        UploadOutcome::Rejected(reason)
    } else {
        UploadOutcome::TransientFailure(reason)
    }
}

fn error_message(body: &str) -> Option<String> {
    let message = serde_json::from_str::<ErrorBody>(body).ok()?.message?;
    match message {
        Value::String(s) => Some(s),
        Value::Array(items) => Some(
            items
                .iter()
                .map(|item| match item {
                    Value::String(s) => s.clone(),
                    other => other.to_string(),
                })
                .collect::<Vec<_>>()
                .join("; "),
        ),
        Value::Null => None,
        other => Some(other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use chrono::{TimeZone, Utc};
    use serde_json::json;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn segment(is_final: bool) -> Segment {
        Segment {
            payload: Bytes::from_static(b"webm-bytes"),
            mime_type: "video/webm;codecs=vp9,opus".to_string(),
            is_final,
            created_at: Utc.timestamp_millis_opt(1_700_000_000_000).unwrap(),
        }
    }

    fn meta() -> SessionMeta {
        SessionMeta {
            session_id: "olymp-9".to_string(),
            source_kind: SourceKind::Screen,
            credential: Credential::new("tok"),
        }
    }

    fn client_for(server: &MockServer) -> IngestClient {
        IngestClient::new(&IngestSettings {
            base_url: server.uri(),
            ..Default::default()
        })
        .unwrap()
    }

    #[test]
    fn test_file_name_encodes_kind_and_finality() {
        assert_eq!(
            segment_file_name(&segment(false), SourceKind::Screen),
            "screen-chunk-1700000000000.webm"
        );
        assert_eq!(
            segment_file_name(&segment(true), SourceKind::Camera),
            "camera-final-1700000000000.webm"
        );
    }

    #[test]
    fn test_classify() {
        assert_eq!(
            classify(StatusCode::CREATED, r#"{"captureId": 17}"#),
            UploadOutcome::Accepted(Some("17".to_string()))
        );
        assert_eq!(classify(StatusCode::OK, "not json"), UploadOutcome::Accepted(None));
        assert_eq!(
            classify(StatusCode::FORBIDDEN, r#"{"message": "olympiad closed"}"#),
            UploadOutcome::Rejected("olympiad closed".to_string())
        );
        assert_eq!(
            classify(StatusCode::BAD_REQUEST, r#"{"message": ["video required", "bad type"]}"#),
            UploadOutcome::Rejected("video required; bad type".to_string())
        );
        assert!(matches!(
            classify(StatusCode::BAD_GATEWAY, ""),
            UploadOutcome::TransientFailure(_)
        ));
    }

    #[tokio::test]
    async fn test_upload_accepted() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/olympiads/camera-capture"))
            .and(header("authorization", "Bearer tok"))
            .respond_with(ResponseTemplate::new(201).set_body_json(json!({ "captureId": "cap-1" })))
            .expect(1)
            .mount(&server)
            .await;

        let outcome = client_for(&server).upload(segment(false), &meta()).await;
        assert_eq!(outcome, UploadOutcome::Accepted(Some("cap-1".to_string())));

        let requests = server.received_requests().await.unwrap();
        let body = String::from_utf8_lossy(&requests[0].body);
        assert!(body.contains("name=\"video\"; filename=\"screen-chunk-1700000000000.webm\""));
        assert!(body.contains("Content-Type: video/webm"));
        assert!(body.contains("webm-bytes"));
        assert!(body.contains("name=\"olympiadId\""));
        assert!(body.contains("olymp-9"));
        assert!(body.contains("name=\"captureType\""));
    }

    #[tokio::test]
    async fn test_upload_rejected_with_message() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(
                ResponseTemplate::new(401).set_body_json(json!({ "message": "token expired" })),
            )
            .mount(&server)
            .await;

        let outcome = client_for(&server).upload(segment(true), &meta()).await;
        assert_eq!(outcome, UploadOutcome::Rejected("token expired".to_string()));
    }

    #[tokio::test]
    async fn test_upload_server_error_is_transient() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let outcome = client_for(&server).upload(segment(false), &meta()).await;
        assert!(matches!(outcome, UploadOutcome::TransientFailure(_)));
    }

    #[tokio::test]
    async fn test_upload_connection_refused_is_transient() {
        let server = MockServer::start().await;
        let client = client_for(&server);
        drop(server);

        let outcome = client.upload(segment(false), &meta()).await;
        assert!(matches!(outcome, UploadOutcome::TransientFailure(_)));
    }
}
