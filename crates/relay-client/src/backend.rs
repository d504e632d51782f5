//! [`SyncBackend`] over the server's REST API.

use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tracing::{debug, instrument};
use url::Url;

use relay_core::errors::SyncError;
use relay_core::events::{decode_message_record, decode_session_info, parse_status};
use relay_core::ids::SessionId;
use relay_core::model::{MessageRecord, SessionInfo, SessionStatus};
use relay_settings::ClientSettings;
use relay_sync::SyncBackend;

use crate::errors::ClientError;
use crate::host::{normalize_host_url, probe_health};

const MAX_ERROR_BODY: usize = 512;

pub struct HttpBackend {
    client: reqwest::Client,
    base: Url,
    request_timeout: Duration,
    probe_timeout: Duration,
}

impl HttpBackend {
    pub fn new(settings: &ClientSettings) -> Result<Self, ClientError> {
        let origin = normalize_host_url(&settings.server_url)?;
        let base = Url::parse(&origin).map_err(|e| ClientError::InvalidUrl(e.to_string()))?;
        let request_timeout = Duration::from_millis(settings.request_timeout_ms);
        let client = reqwest::Client::builder()
            .timeout(request_timeout)
            .user_agent(concat!("relay/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self {
            client,
            base,
            request_timeout,
            probe_timeout: Duration::from_millis(settings.probe_timeout_ms),
        })
    }

    pub fn base_url(&self) -> &str {
        self.base.as_str().trim_end_matches('/')
    }

    fn endpoint(&self, segments: &[&str]) -> Result<Url, ClientError> {
        let mut url = self.base.clone();
        url.path_segments_mut()
            .map_err(|()| ClientError::InvalidUrl(self.base.to_string()))?
            .clear()
            .extend(segments);
        Ok(url)
    }

    async fn get_json(&self, url: Url) -> Result<Value, ClientError> {
        debug!(url = %url, "GET");
        let resp = self.client.get(url).send().await.map_err(|e| self.classify(e))?;
        let status = resp.status();
        if !status.is_success() {
            let mut body = resp.text().await.unwrap_or_default();
            if body.len() > MAX_ERROR_BODY {
                let mut cut = MAX_ERROR_BODY;
                while !body.is_char_boundary(cut) {
                    cut -= 1;
                }
                body.truncate(cut);
            }
            return Err(ClientError::Status {
                status: status.as_u16(),
                body,
            });
        }
        resp.json::<Value>().await.map_err(|e| self.classify(e))
    }

    fn classify(&self, e: reqwest::Error) -> ClientError {
        if e.is_timeout() {
            ClientError::Timeout(self.request_timeout)
        } else {
            ClientError::Http(e)
        }
    }
}

fn expect_array(value: Value, what: &str) -> Result<Vec<Value>, ClientError> {
    match value {
        Value::Array(items) => Ok(items),
        other => Err(ClientError::Decode(format!(
            "{what}: expected array, got {}",
            kind_of(&other)
        ))),
    }
}

fn kind_of(v: &Value) -> &'static str {
    match v {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// Status map is `{ sessionID: status }`; entries that do not parse are skipped.
fn decode_status_map(value: Value) -> Result<Vec<(SessionId, SessionStatus)>, ClientError> {
    let Value::Object(map) = value else {
        return Err(ClientError::Decode(format!(
            "status map: expected object, got {}",
            kind_of(&value)
        )));
    };
    let mut statuses: Vec<_> = map
        .into_iter()
        .filter_map(|(id, raw)| parse_status(&raw).map(|s| (SessionId::from_raw(id), s)))
        .collect();
    statuses.sort_by(|a, b| a.0.cmp(&b.0));
    Ok(statuses)
}

#[async_trait]
impl SyncBackend for HttpBackend {
    #[instrument(skip(self), fields(session_id = %session))]
    async fn fetch_messages(
        &self,
        session: &SessionId,
        limit: usize,
    ) -> Result<Vec<MessageRecord>, SyncError> {
        let mut url = self.endpoint(&["session", session.as_str(), "message"])?;
        url.query_pairs_mut().append_pair("limit", &limit.to_string());
        let items = expect_array(self.get_json(url).await?, "messages")?;
        let total = items.len();
        let records: Vec<MessageRecord> = items.iter().filter_map(decode_message_record).collect();
        if records.len() < total {
            debug!(skipped = total - records.len(), "history entries without ids skipped");
        }
        Ok(records)
    }

    async fn fetch_sessions(&self) -> Result<Vec<SessionInfo>, SyncError> {
        let url = self.endpoint(&["session"])?;
        let items = expect_array(self.get_json(url).await?, "sessions")?;
        Ok(items.iter().filter_map(decode_session_info).collect())
    }

    async fn fetch_session(&self, session: &SessionId) -> Result<SessionInfo, SyncError> {
        let url = self.endpoint(&["session", session.as_str()])?;
        let raw = self.get_json(url).await?;
        decode_session_info(&raw)
            .ok_or_else(|| SyncError::Decode(format!("session {session}: missing id")))
    }

    async fn fetch_statuses(&self) -> Result<Vec<(SessionId, SessionStatus)>, SyncError> {
        let url = self.endpoint(&["session", "status"])?;
        Ok(decode_status_map(self.get_json(url).await?)?)
    }

    async fn probe(&self) -> bool {
        match probe_health(&self.client, self.base_url(), self.probe_timeout).await {
            Ok(result) => result.is_ok(),
            Err(_) => false,
        }
    }

    async fn refresh_capability(
        &self,
        capability: &str,
        directory: Option<&str>,
    ) -> Result<(), SyncError> {
        let segment = match capability {
            "tools" => "mcp",
            "lsp" => "lsp",
            other => {
                debug!(capability = other, "no refresh endpoint for capability");
                return Ok(());
            }
        };
        let mut url = self.endpoint(&[segment])?;
        if let Some(dir) = directory {
            url.query_pairs_mut().append_pair("directory", dir);
        }
        self.get_json(url).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn backend_for(server: &MockServer) -> HttpBackend {
        HttpBackend::new(&ClientSettings {
            server_url: server.uri(),
            probe_timeout_ms: 500,
            request_timeout_ms: 500,
        })
        .unwrap()
    }

    #[test]
    fn rejects_bad_server_url() {
        let settings = ClientSettings {
            server_url: "ws://127.0.0.1:4096".into(),
            ..ClientSettings::default()
        };
        assert!(matches!(
            HttpBackend::new(&settings),
            Err(ClientError::InvalidUrl(_))
        ));
    }

    #[test]
    fn endpoints_escape_segments() {
        let backend = HttpBackend::new(&ClientSettings::default()).unwrap();
        let url = backend.endpoint(&["session", "ses 1/x", "message"]).unwrap();
        assert_eq!(url.as_str(), "http://127.0.0.1:4096/session/ses%201%2Fx/message");
        assert_eq!(backend.base_url(), "http://127.0.0.1:4096");
    }

    #[tokio::test]
    async fn fetches_bounded_history() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/session/ses_1/message"))
            .and(query_param("limit", "50"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([
                {
                    "info": {"id": "msg_1", "sessionID": "ses_1", "role": "user", "agent": "build"},
                    "parts": [{"id": "prt_1", "type": "text", "text": "hi"}]
                },
                {
                    "info": {"id": "msg_2", "sessionID": "ses_1", "role": "assistant", "finish": "stop"},
                    "parts": []
                },
                {"parts": []}
            ])))
            .expect(1)
            .mount(&server)
            .await;

        let records = backend_for(&server)
            .fetch_messages(&SessionId::from_raw("ses_1"), 50)
            .await
            .unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].parts[0].text.as_deref(), Some("hi"));
        assert!(records[1].info.has_stop());
    }

    #[tokio::test]
    async fn missing_session_is_a_fetch_error() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/session/ses_9"))
            .respond_with(ResponseTemplate::new(404).set_body_string("not found"))
            .mount(&server)
            .await;

        let err = backend_for(&server)
            .fetch_session(&SessionId::from_raw("ses_9"))
            .await
            .unwrap_err();
        match err {
            SyncError::Fetch { status, body } => {
                assert_eq!(status, 404);
                assert_eq!(body, "not found");
            }
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[tokio::test]
    async fn unauthorized_is_classified() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/session"))
            .respond_with(ResponseTemplate::new(401))
            .mount(&server)
            .await;
        let err = backend_for(&server).fetch_sessions().await.unwrap_err();
        assert!(matches!(err, SyncError::Unauthorized(_)));
    }

    #[tokio::test]
    async fn decodes_session_list() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/session"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([
                {"id": "ses_1", "title": "First", "directory": "/work", "time": {"created": 1, "updated": 2}},
                {"title": "no id"},
                {"id": "ses_2", "parentID": "ses_1", "time": {"compacting": 9}}
            ])))
            .mount(&server)
            .await;

        let sessions = backend_for(&server).fetch_sessions().await.unwrap();
        assert_eq!(sessions.len(), 2);
        assert_eq!(sessions[0].directory.as_deref(), Some("/work"));
        assert_eq!(sessions[0].updated, Some(2));
        assert_eq!(sessions[1].parent_id.as_ref().map(|p| p.as_str()), Some("ses_1"));
        assert_eq!(sessions[1].compacting, Some(9));
    }

    #[tokio::test]
    async fn non_array_history_is_a_decode_error() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/session"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"sessions": []})))
            .mount(&server)
            .await;
        let err = backend_for(&server).fetch_sessions().await.unwrap_err();
        assert!(matches!(err, SyncError::Decode(_)));
    }

    #[tokio::test]
    async fn decodes_status_map() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/session/status"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "ses_b": {"type": "retry", "attempt": 2, "message": "rate limited"},
                "ses_a": {"type": "busy"},
                "ses_c": {"type": "mystery"}
            })))
            .mount(&server)
            .await;

        let statuses = backend_for(&server).fetch_statuses().await.unwrap();
        let ids: Vec<&str> = statuses.iter().map(|(id, _)| id.as_str()).collect();
        assert_eq!(ids, vec!["ses_a", "ses_b"]);
        assert_eq!(statuses[1].1.attempt, Some(2));
    }

    #[tokio::test]
    async fn slow_response_times_out() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/session/status"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(json!({}))
                    .set_delay(Duration::from_secs(3)),
            )
            .mount(&server)
            .await;
        let err = backend_for(&server).fetch_statuses().await.unwrap_err();
        assert!(matches!(err, SyncError::Timeout(_)));
    }

    #[tokio::test]
    async fn refreshes_tools_with_directory() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/mcp"))
            .and(query_param("directory", "/work/app"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({})))
            .expect(1)
            .mount(&server)
            .await;

        let backend = backend_for(&server);
        backend
            .refresh_capability("tools", Some("/work/app"))
            .await
            .unwrap();
        backend.refresh_capability("unknown", None).await.unwrap();
    }

    #[tokio::test]
    async fn probe_reports_health() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/health"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&server)
            .await;
        assert!(backend_for(&server).probe().await);

        let down = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/health"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&down)
            .await;
        assert!(!backend_for(&down).probe().await);
    }
}
