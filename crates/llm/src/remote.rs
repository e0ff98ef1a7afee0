use reqwest::{RequestBuilder, Response, StatusCode};
use serde::Deserialize;
use serde::de::DeserializeOwned;
use snafu::{ResultExt, ensure};

use super::provider::{
    BackendConfig, BackendError, BackendResult, BoxFuture, BuildHttpClientSnafu,
    ConversationBackend, CreateKinOutcome, CreateKinRequest, DecodePayloadSnafu, GeneratedImage,
    ImageRequest, Kin, KinNotFoundSnafu, LinkRepoRequest, PostMessageRequest, RemoteMessage,
    SpeechRequest, StatusSnafu, null_as_default,
};

pub const REMOTE_BACKEND_ID: &str = "remote";

#[derive(Debug, Deserialize)]
struct MessagesEnvelope {
    #[serde(default, deserialize_with = "null_as_default")]
    messages: Vec<RemoteMessage>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum KinsEnvelope {
    Wrapped { kins: Vec<Kin> },
    Bare(Vec<Kin>),
}

#[derive(Debug, Deserialize)]
struct ExistingKinEnvelope {
    existing_kin: Kin,
}

#[derive(Debug, Deserialize)]
struct ImageEnvelope {
    data: GeneratedImage,
}

/// HTTP client for the blueprint/kin conversational API.
pub struct KinApiClient {
    config: BackendConfig,
    http: reqwest::Client,
}

impl KinApiClient {
    pub fn new(config: BackendConfig) -> BackendResult<Self> {
        let http = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .build()
            .context(BuildHttpClientSnafu {
                stage: "remote-client-new",
            })?;

        Ok(Self { config, http })
    }

    pub fn config(&self) -> &BackendConfig {
        &self.config
    }

    fn kins_url(&self) -> String {
        format!(
            "{}/blueprints/{}/kins",
            self.config.base_url, self.config.blueprint_id
        )
    }

    fn kin_url(&self, kin_id: &str, suffix: &str) -> String {
        if suffix.is_empty() {
            format!("{}/{kin_id}", self.kins_url())
        } else {
            format!("{}/{kin_id}/{suffix}", self.kins_url())
        }
    }

    fn authorized(&self, builder: RequestBuilder) -> RequestBuilder {
        if self.config.api_key.is_empty() {
            builder
        } else {
            builder.bearer_auth(&self.config.api_key)
        }
    }

    fn transport_error(&self, stage: &'static str, url: &str, source: reqwest::Error) -> BackendError {
        if source.is_timeout() {
            BackendError::RequestTimedOut {
                stage,
                url: url.to_string(),
                timeout_secs: self.config.request_timeout.as_secs(),
            }
        } else {
            BackendError::Transport {
                stage,
                url: url.to_string(),
                source,
            }
        }
    }

    async fn dispatch(
        &self,
        stage: &'static str,
        url: &str,
        builder: RequestBuilder,
    ) -> BackendResult<Response> {
        tracing::debug!(stage, url, "sending remote API request");
        self.authorized(builder)
            .send()
            .await
            .map_err(|source| self.transport_error(stage, url, source))
    }

    async fn read_text(
        &self,
        stage: &'static str,
        url: &str,
        response: Response,
    ) -> BackendResult<String> {
        response
            .text()
            .await
            .map_err(|source| self.transport_error(stage, url, source))
    }

    async fn expect_success(
        &self,
        stage: &'static str,
        url: &str,
        response: Response,
    ) -> BackendResult<Response> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let body = self.read_text(stage, url, response).await.unwrap_or_default();
        tracing::warn!(stage, url, status = status.as_u16(), "remote API returned an error status");
        StatusSnafu {
            stage,
            status: status.as_u16(),
            body,
        }
        .fail()
    }

    async fn read_json<T: DeserializeOwned>(
        &self,
        stage: &'static str,
        url: &str,
        response: Response,
    ) -> BackendResult<T> {
        let body = self.read_text(stage, url, response).await?;
        serde_json::from_str(&body).context(DecodePayloadSnafu { stage })
    }
}

impl ConversationBackend for KinApiClient {
    fn id(&self) -> &str {
        &self.config.backend_id
    }

    fn name(&self) -> &str {
        "Kin API"
    }

    fn list_kins<'a>(&'a self) -> BoxFuture<'a, BackendResult<Vec<Kin>>> {
        Box::pin(async move {
            let stage = "list-kins";
            let url = self.kins_url();
            let response = self.dispatch(stage, &url, self.http.get(&url)).await?;
            let response = self.expect_success(stage, &url, response).await?;
            let kins = match self.read_json::<KinsEnvelope>(stage, &url, response).await? {
                KinsEnvelope::Wrapped { kins } | KinsEnvelope::Bare(kins) => kins,
            };
            Ok(kins)
        })
    }

    fn get_kin<'a>(&'a self, kin_id: &'a str) -> BoxFuture<'a, BackendResult<Kin>> {
        Box::pin(async move {
            let stage = "get-kin";
            let url = self.kin_url(kin_id, "");
            let response = self.dispatch(stage, &url, self.http.get(&url)).await?;
            ensure!(
                response.status() != StatusCode::NOT_FOUND,
                KinNotFoundSnafu {
                    stage,
                    kin_id: kin_id.to_string(),
                }
            );
            let response = self.expect_success(stage, &url, response).await?;
            self.read_json(stage, &url, response).await
        })
    }

    fn create_kin<'a>(
        &'a self,
        request: CreateKinRequest,
    ) -> BoxFuture<'a, BackendResult<CreateKinOutcome>> {
        Box::pin(async move {
            let stage = "create-kin";
            let url = self.kins_url();
            let response = self
                .dispatch(stage, &url, self.http.post(&url).json(&request))
                .await?;

            if response.status() == StatusCode::CONFLICT {
                let envelope: ExistingKinEnvelope = self.read_json(stage, &url, response).await?;
                tracing::info!(kin_id = %envelope.existing_kin.id, "kin already exists");
                return Ok(CreateKinOutcome::AlreadyExists(envelope.existing_kin));
            }

            let response = self.expect_success(stage, &url, response).await?;
            let kin: Kin = self.read_json(stage, &url, response).await?;
            Ok(CreateKinOutcome::Created(kin))
        })
    }

    fn fetch_messages<'a>(
        &'a self,
        kin_id: &'a str,
        limit: usize,
    ) -> BoxFuture<'a, BackendResult<Vec<RemoteMessage>>> {
        Box::pin(async move {
            let stage = "fetch-messages";
            let url = self.kin_url(kin_id, "messages");
            let builder = self.http.get(&url).query(&[("limit", limit)]);
            let response = self.dispatch(stage, &url, builder).await?;
            let response = self.expect_success(stage, &url, response).await?;
            let envelope: MessagesEnvelope = self.read_json(stage, &url, response).await?;
            Ok(envelope.messages)
        })
    }

    fn post_message<'a>(
        &'a self,
        kin_id: &'a str,
        request: PostMessageRequest,
    ) -> BoxFuture<'a, BackendResult<RemoteMessage>> {
        Box::pin(async move {
            let stage = "post-message";
            let url = self.kin_url(kin_id, "messages");
            let response = self
                .dispatch(stage, &url, self.http.post(&url).json(&request))
                .await?;
            let response = self.expect_success(stage, &url, response).await?;
            self.read_json(stage, &url, response).await
        })
    }

    fn generate_image<'a>(
        &'a self,
        kin_id: &'a str,
        request: ImageRequest,
    ) -> BoxFuture<'a, BackendResult<GeneratedImage>> {
        Box::pin(async move {
            let stage = "generate-image";
            let url = self.kin_url(kin_id, "images");
            let response = self
                .dispatch(stage, &url, self.http.post(&url).json(&request))
                .await?;
            let response = self.expect_success(stage, &url, response).await?;
            let envelope: ImageEnvelope = self.read_json(stage, &url, response).await?;
            Ok(envelope.data)
        })
    }

    fn synthesize_speech<'a>(
        &'a self,
        kin_id: &'a str,
        request: SpeechRequest,
    ) -> BoxFuture<'a, BackendResult<Vec<u8>>> {
        Box::pin(async move {
            let stage = "synthesize-speech";
            let url = self.kin_url(kin_id, "tts");
            let response = self
                .dispatch(stage, &url, self.http.post(&url).json(&request))
                .await?;
            let response = self.expect_success(stage, &url, response).await?;
            let audio = response
                .bytes()
                .await
                .map_err(|source| self.transport_error(stage, &url, source))?;
            Ok(audio.to_vec())
        })
    }

    fn link_repo<'a>(
        &'a self,
        kin_id: &'a str,
        request: LinkRepoRequest,
    ) -> BoxFuture<'a, BackendResult<serde_json::Value>> {
        Box::pin(async move {
            let stage = "link-repo";
            let url = self.kin_url(kin_id, "link-repo");
            let response = self
                .dispatch(stage, &url, self.http.post(&url).json(&request))
                .await?;
            let response = self.expect_success(stage, &url, response).await?;
            let body = self.read_text(stage, &url, response).await?;
            Ok(parse_loose_json(body))
        })
    }
}

/// Some endpoints answer with plain text; wrap it so callers always see JSON.
fn parse_loose_json(body: String) -> serde_json::Value {
    match serde_json::from_str(&body) {
        Ok(value) => value,
        Err(_) => serde_json::json!({ "text": body }),
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::{TcpListener, TcpStream};
    use tokio::task::JoinHandle;

    use crate::provider::Role;

    use super::*;

    /// Answers a single request with a canned response and returns the raw request text.
    async fn serve_once(
        status_line: &'static str,
        body: &'static str,
    ) -> (String, JoinHandle<String>) {
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .unwrap_or_else(|error| panic!("listener should bind: {error}"));
        let addr = listener
            .local_addr()
            .unwrap_or_else(|error| panic!("listener should have an address: {error}"));

        let server = tokio::spawn(async move {
            let (mut socket, _) = listener
                .accept()
                .await
                .unwrap_or_else(|error| panic!("client should connect: {error}"));
            let request = read_request(&mut socket).await;
            let response = format!(
                "HTTP/1.1 {status_line}\r\ncontent-type: application/json\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{body}",
                body.len()
            );
            socket
                .write_all(response.as_bytes())
                .await
                .unwrap_or_else(|error| panic!("response should be written: {error}"));
            let _ = socket.shutdown().await;
            request
        });

        (format!("http://{addr}/v2"), server)
    }

    async fn read_request(socket: &mut TcpStream) -> String {
        let mut buffer = Vec::new();
        let mut chunk = [0_u8; 1024];
        loop {
            let read = socket
                .read(&mut chunk)
                .await
                .unwrap_or_else(|error| panic!("request should be readable: {error}"));
            if read == 0 {
                break;
            }
            buffer.extend_from_slice(&chunk[..read]);

            let text = String::from_utf8_lossy(&buffer);
            if let Some(end) = text.find("\r\n\r\n") {
                let length = text[..end]
                    .lines()
                    .filter_map(|line| line.split_once(':'))
                    .find(|(name, _)| name.eq_ignore_ascii_case("content-length"))
                    .and_then(|(_, value)| value.trim().parse::<usize>().ok())
                    .unwrap_or(0);
                if buffer.len() >= end + 4 + length {
                    break;
                }
            }
        }
        String::from_utf8_lossy(&buffer).into_owned()
    }

    fn local_client(base_url: &str) -> KinApiClient {
        let config = BackendConfig::new(REMOTE_BACKEND_ID, base_url, "bp").with_api_key("sk-test");
        let http = reqwest::Client::builder()
            .no_proxy()
            .timeout(Duration::from_secs(5))
            .build()
            .unwrap_or_else(|error| panic!("http client should build: {error}"));
        KinApiClient { config, http }
    }

    async fn captured(server: JoinHandle<String>) -> String {
        server
            .await
            .unwrap_or_else(|error| panic!("server task should finish: {error}"))
    }

    fn client() -> KinApiClient {
        let config = BackendConfig::new(REMOTE_BACKEND_ID, "https://api.example.test/v2/", "bp")
            .with_request_timeout(Duration::from_secs(5));
        KinApiClient::new(config).unwrap_or_else(|error| panic!("client should build: {error}"))
    }

    #[test]
    fn urls_are_built_under_the_blueprint() {
        let client = client();
        assert_eq!(
            client.kins_url(),
            "https://api.example.test/v2/blueprints/bp/kins"
        );
        assert_eq!(
            client.kin_url("gpt-4o", "messages"),
            "https://api.example.test/v2/blueprints/bp/kins/gpt-4o/messages"
        );
        assert_eq!(
            client.kin_url("gpt-4o", ""),
            "https://api.example.test/v2/blueprints/bp/kins/gpt-4o"
        );
    }

    #[test]
    fn kin_listing_accepts_wrapped_and_bare_shapes() {
        let wrapped: KinsEnvelope = serde_json::from_str(r#"{"kins":[{"id":"a","name":"A"}]}"#)
            .unwrap_or_else(|error| panic!("wrapped listing should parse: {error}"));
        let bare: KinsEnvelope = serde_json::from_str(r#"[{"id":"b"}]"#)
            .unwrap_or_else(|error| panic!("bare listing should parse: {error}"));

        assert!(matches!(wrapped, KinsEnvelope::Wrapped { kins } if kins[0].name == "A"));
        assert!(matches!(bare, KinsEnvelope::Bare(kins) if kins[0].id == "b"));
    }

    #[test]
    fn plain_text_bodies_are_wrapped() {
        assert_eq!(
            parse_loose_json("linked".to_string()),
            serde_json::json!({ "text": "linked" })
        );
        assert_eq!(
            parse_loose_json(r#"{"ok":true}"#.to_string()),
            serde_json::json!({ "ok": true })
        );
    }

    #[test]
    fn null_message_lists_decode_as_empty() {
        let envelope: MessagesEnvelope = serde_json::from_str(r#"{"messages":null}"#)
            .unwrap_or_else(|error| panic!("envelope should parse: {error}"));
        assert!(envelope.messages.is_empty());
    }

    #[tokio::test]
    async fn conflict_on_create_returns_the_existing_kin() {
        let (base_url, server) = serve_once(
            "409 Conflict",
            r#"{"error":"exists","existing_kin":{"id":"gpt-4o","name":"GPT-4o"}}"#,
        )
        .await;
        let client = local_client(&base_url);

        let outcome = client
            .create_kin(CreateKinRequest::named("gpt-4o"))
            .await
            .unwrap_or_else(|error| panic!("conflict should not be an error: {error}"));
        let request = captured(server).await;

        assert!(request.starts_with("POST /v2/blueprints/bp/kins HTTP/1.1"));
        assert!(request.to_ascii_lowercase().contains("authorization: bearer sk-test"));
        assert!(request.contains(r#""name":"gpt-4o""#));
        assert_eq!(
            outcome,
            CreateKinOutcome::AlreadyExists(Kin {
                id: "gpt-4o".to_string(),
                name: "GPT-4o".to_string(),
            })
        );
    }

    #[tokio::test]
    async fn history_requests_carry_the_limit() {
        let (base_url, server) = serve_once(
            "200 OK",
            r#"{"messages":[{"id":"m1","content":"hi","role":"user"},{"id":"m2","content":null,"role":"system"}]}"#,
        )
        .await;
        let client = local_client(&base_url);

        let messages = client
            .fetch_messages("claude", 10)
            .await
            .unwrap_or_else(|error| panic!("history should load: {error}"));
        let request = captured(server).await;

        assert!(request.starts_with("GET /v2/blueprints/bp/kins/claude/messages?limit=10 HTTP/1.1"));
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].role, Role::User);
        assert_eq!(messages[1].role, Role::Assistant);
        assert_eq!(messages[1].content, "");
    }

    #[tokio::test]
    async fn error_statuses_keep_the_response_body() {
        let (base_url, server) = serve_once("500 Internal Server Error", "upstream down").await;
        let client = local_client(&base_url);

        let error = match client
            .post_message("claude", PostMessageRequest::new("hello", "claude"))
            .await
        {
            Ok(reply) => panic!("a 500 should fail, got {reply:?}"),
            Err(error) => error,
        };
        let request = captured(server).await;

        assert!(request.starts_with("POST /v2/blueprints/bp/kins/claude/messages HTTP/1.1"));
        assert!(matches!(
            &error,
            BackendError::Status { status: 500, body, .. } if body == "upstream down"
        ));
        assert_eq!(
            error.to_string(),
            "API request failed with status 500: upstream down"
        );
    }
}
