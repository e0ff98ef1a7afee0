use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use serde::{Deserialize, Deserializer, Serialize};
use snafu::Snafu;

pub const DEFAULT_MODE: &str = "creative";
pub const DEFAULT_HISTORY_LENGTH: u32 = 25;
pub const DEFAULT_IMAGE_ASPECT_RATIO: &str = "ASPECT_1_1";
pub const DEFAULT_IMAGE_MODEL: &str = "V_2";
pub const DEFAULT_MAGIC_PROMPT_OPTION: &str = "AUTO";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackendConfig {
    pub backend_id: String,
    pub base_url: String,
    pub blueprint_id: String,
    pub api_key: String,
    pub request_timeout: Duration,
}

impl BackendConfig {
    pub fn new(
        backend_id: impl Into<String>,
        base_url: impl Into<String>,
        blueprint_id: impl Into<String>,
    ) -> Self {
        Self {
            backend_id: backend_id.into().trim().to_string(),
            base_url: base_url.into().trim().trim_end_matches('/').to_string(),
            blueprint_id: blueprint_id.into().trim().to_string(),
            api_key: String::new(),
            request_timeout: Duration::from_secs(60),
        }
    }

    pub fn with_api_key(mut self, api_key: impl Into<String>) -> Self {
        self.api_key = api_key.into().trim().to_string();
        self
    }

    pub fn with_request_timeout(mut self, request_timeout: Duration) -> Self {
        self.request_timeout = request_timeout;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

/// Anything other than `user` (including `system`, tool roles and `null`)
/// is shown as an assistant message.
impl<'de> Deserialize<'de> for Role {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let role = Option::<String>::deserialize(deserializer)?;
        Ok(match role.as_deref() {
            Some("user") => Self::User,
            _ => Self::Assistant,
        })
    }
}

/// Reads `null` the same as a missing field.
pub(crate) fn null_as_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Option::<T>::deserialize(deserializer).map(Option::unwrap_or_default)
}

/// Message as exchanged with a conversation backend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteMessage {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default, deserialize_with = "null_as_default")]
    pub content: String,
    #[serde(default = "default_role")]
    pub role: Role,
    #[serde(default)]
    pub timestamp: Option<String>,
    #[serde(
        default,
        deserialize_with = "null_as_default",
        skip_serializing_if = "Vec::is_empty"
    )]
    pub images: Vec<String>,
}

fn default_role() -> Role {
    Role::Assistant
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Kin {
    pub id: String,
    #[serde(default)]
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CreateKinRequest {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
}

impl CreateKinRequest {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            id: None,
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CreateKinOutcome {
    Created(Kin),
    AlreadyExists(Kin),
}

impl CreateKinOutcome {
    pub fn kin(&self) -> &Kin {
        match self {
            Self::Created(kin) | Self::AlreadyExists(kin) => kin,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PostMessageRequest {
    pub content: String,
    pub model: String,
    pub mode: String,
    pub history_length: u32,
    #[serde(rename = "addSystem", skip_serializing_if = "Option::is_none")]
    pub add_system: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub images: Vec<String>,
}

impl PostMessageRequest {
    pub fn new(content: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            model: model.into(),
            mode: DEFAULT_MODE.to_string(),
            history_length: DEFAULT_HISTORY_LENGTH,
            add_system: None,
            images: Vec::new(),
        }
    }

    pub fn with_system(mut self, system: impl Into<String>) -> Self {
        let system = system.into();
        if !system.trim().is_empty() {
            self.add_system = Some(system);
        }
        self
    }

    pub fn with_images(mut self, images: Vec<String>) -> Self {
        self.images = images;
        self
    }

    pub fn with_mode(mut self, mode: impl Into<String>) -> Self {
        self.mode = mode.into();
        self
    }

    pub fn with_history_length(mut self, history_length: u32) -> Self {
        self.history_length = history_length;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ImageRequest {
    pub prompt: String,
    pub aspect_ratio: String,
    pub model: String,
    pub magic_prompt_option: String,
}

impl ImageRequest {
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            aspect_ratio: DEFAULT_IMAGE_ASPECT_RATIO.to_string(),
            model: DEFAULT_IMAGE_MODEL.to_string(),
            magic_prompt_option: DEFAULT_MAGIC_PROMPT_OPTION.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct GeneratedImage {
    pub url: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SpeechRequest {
    pub text: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub voice_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
}

impl SpeechRequest {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            voice_id: None,
            model: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LinkRepoRequest {
    pub github_url: String,
    pub use_local_git: bool,
}

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;
pub type BackendResult<T> = Result<T, BackendError>;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum BackendError {
    #[snafu(display("backend '{backend_id}' is not supported"))]
    UnsupportedBackend {
        stage: &'static str,
        backend_id: String,
    },
    #[snafu(display("missing API key for backend '{backend_id}'"))]
    MissingApiKey {
        stage: &'static str,
        backend_id: String,
    },
    #[snafu(display("backend '{backend_id}' does not support {operation}"))]
    UnsupportedOperation {
        stage: &'static str,
        backend_id: String,
        operation: &'static str,
    },
    #[snafu(display("failed to build HTTP client on `{stage}`: {source}"))]
    BuildHttpClient {
        stage: &'static str,
        source: reqwest::Error,
    },
    #[snafu(display("request to {url} failed on `{stage}`: {source}"))]
    Transport {
        stage: &'static str,
        url: String,
        source: reqwest::Error,
    },
    #[snafu(display("request to {url} timed out after {timeout_secs}s"))]
    RequestTimedOut {
        stage: &'static str,
        url: String,
        timeout_secs: u64,
    },
    #[snafu(display("API request failed with status {status}: {body}"))]
    Status {
        stage: &'static str,
        status: u16,
        body: String,
    },
    #[snafu(display("failed to decode response payload on `{stage}`: {source}"))]
    DecodePayload {
        stage: &'static str,
        source: serde_json::Error,
    },
    #[snafu(display("kin '{kin_id}' was not found"))]
    KinNotFound {
        stage: &'static str,
        kin_id: String,
    },
    #[snafu(display("request for model '{model_id}' has no messages"))]
    EmptyMessageSet {
        stage: &'static str,
        model_id: String,
    },
    #[snafu(display("http client failed on `{stage}`, {source}"))]
    HttpClient {
        stage: &'static str,
        source: rig::http_client::Error,
    },
    #[snafu(display("completions failed on `{stage}`, {source}"))]
    CompletionsFailed {
        stage: &'static str,
        source: rig::completion::CompletionError,
    },
}

impl BackendError {
    /// HTTP status carried by the failure, if the server answered at all.
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::Status { status, .. } => Some(*status),
            Self::KinNotFound { .. } => Some(404),
            _ => None,
        }
    }

    pub fn is_rate_limited(&self) -> bool {
        matches!(self.status(), Some(429 | 503))
    }
}

/// Remote conversational API surface used by the chat board and provisioning.
pub trait ConversationBackend: Send + Sync {
    fn id(&self) -> &str;
    fn name(&self) -> &str;
    fn list_kins<'a>(&'a self) -> BoxFuture<'a, BackendResult<Vec<Kin>>>;
    fn get_kin<'a>(&'a self, kin_id: &'a str) -> BoxFuture<'a, BackendResult<Kin>>;
    fn create_kin<'a>(
        &'a self,
        request: CreateKinRequest,
    ) -> BoxFuture<'a, BackendResult<CreateKinOutcome>>;
    fn fetch_messages<'a>(
        &'a self,
        kin_id: &'a str,
        limit: usize,
    ) -> BoxFuture<'a, BackendResult<Vec<RemoteMessage>>>;
    fn post_message<'a>(
        &'a self,
        kin_id: &'a str,
        request: PostMessageRequest,
    ) -> BoxFuture<'a, BackendResult<RemoteMessage>>;
    fn generate_image<'a>(
        &'a self,
        kin_id: &'a str,
        request: ImageRequest,
    ) -> BoxFuture<'a, BackendResult<GeneratedImage>>;
    fn synthesize_speech<'a>(
        &'a self,
        kin_id: &'a str,
        request: SpeechRequest,
    ) -> BoxFuture<'a, BackendResult<Vec<u8>>>;
    fn link_repo<'a>(
        &'a self,
        kin_id: &'a str,
        request: LinkRepoRequest,
    ) -> BoxFuture<'a, BackendResult<serde_json::Value>>;
}
