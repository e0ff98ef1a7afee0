use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use futures::StreamExt;
use rig::completion::{CompletionModel, Message as RigMessage};
use rig::prelude::CompletionClient;
use rig::providers::openai;
use rig::streaming::StreamedAssistantContent;
use snafu::{ResultExt, ensure};
use tokio::sync::RwLock;

use super::provider::{
    BackendConfig, BackendResult, BoxFuture, CompletionsFailedSnafu, ConversationBackend,
    CreateKinOutcome, CreateKinRequest, EmptyMessageSetSnafu, GeneratedImage, HttpClientSnafu,
    ImageRequest, Kin, KinNotFoundSnafu, LinkRepoRequest, MissingApiKeySnafu, PostMessageRequest,
    RemoteMessage, Role, SpeechRequest, UnsupportedOperationSnafu,
};

pub const RIG_OPENAI_BACKEND_ID: &str = "openai";

/// Talks to an OpenAI-compatible endpoint directly, keeping each kin's history in memory.
pub struct RigDirectBackend {
    config: BackendConfig,
    histories: RwLock<HashMap<String, Vec<RemoteMessage>>>,
    next_message_id: AtomicU64,
}

impl RigDirectBackend {
    pub fn new(config: BackendConfig) -> BackendResult<Self> {
        ensure!(
            !config.api_key.is_empty(),
            MissingApiKeySnafu {
                stage: "rig-backend-new",
                backend_id: config.backend_id.clone(),
            }
        );

        Ok(Self {
            config,
            histories: RwLock::new(HashMap::new()),
            next_message_id: AtomicU64::new(1),
        })
    }

    fn build_client(config: &BackendConfig) -> BackendResult<openai::Client> {
        let mut builder = openai::Client::builder().api_key(config.api_key.as_str());
        if !config.base_url.is_empty() {
            builder = builder.base_url(config.base_url.as_str());
        }
        builder.build().context(HttpClientSnafu {
            stage: "build-client",
        })
    }

    fn to_rig_message(message: &RemoteMessage) -> RigMessage {
        match message.role {
            Role::User => RigMessage::user(message.content.clone()),
            Role::Assistant => RigMessage::assistant(message.content.clone()),
        }
    }

    fn assign_id(&self, kin_id: &str) -> String {
        let sequence = self.next_message_id.fetch_add(1, Ordering::Relaxed);
        format!("{kin_id}_{sequence}")
    }

    fn stamp(&self, kin_id: &str, role: Role, content: String, images: Vec<String>) -> RemoteMessage {
        RemoteMessage {
            id: Some(self.assign_id(kin_id)),
            content,
            role,
            timestamp: Some(chrono::Utc::now().to_rfc3339()),
            images,
        }
    }

    /// Streams one completion and folds its text deltas into a single reply.
    async fn complete(
        config: &BackendConfig,
        model_id: &str,
        preamble: Option<&str>,
        turns: &[RemoteMessage],
    ) -> BackendResult<String> {
        let client = Self::build_client(config)?;
        let model = client.completion_model(model_id.to_string());

        let mut messages = turns.iter().map(Self::to_rig_message).collect::<Vec<_>>();
        let Some(prompt) = messages.pop() else {
            tracing::error!(model_id, "no turns left to use as the completion prompt");
            return EmptyMessageSetSnafu {
                stage: "complete-pop-prompt",
                model_id: model_id.to_string(),
            }
            .fail();
        };

        let mut builder = model.completion_request(prompt).messages(messages);
        if let Some(preamble) = preamble
            && !preamble.trim().is_empty()
        {
            builder = builder.preamble(preamble.to_string());
        }

        let mut stream = builder.stream().await.context(CompletionsFailedSnafu {
            stage: "open-stream",
        })?;

        let mut reply = String::new();
        while let Some(item) = stream.next().await {
            let item = item.context(CompletionsFailedSnafu {
                stage: "stream-chunk",
            })?;
            // Reasoning and tool traffic never reaches the chat pane.
            if let StreamedAssistantContent::Text(text) = item {
                reply.push_str(&text.text);
            }
        }

        Ok(reply)
    }
}

impl ConversationBackend for RigDirectBackend {
    fn id(&self) -> &str {
        &self.config.backend_id
    }

    fn name(&self) -> &str {
        "Rig OpenAI"
    }

    fn list_kins<'a>(&'a self) -> BoxFuture<'a, BackendResult<Vec<Kin>>> {
        Box::pin(async move {
            let histories = self.histories.read().await;
            let mut kins = histories
                .keys()
                .map(|id| Kin {
                    id: id.clone(),
                    name: id.clone(),
                })
                .collect::<Vec<_>>();
            kins.sort_by(|left, right| left.id.cmp(&right.id));
            Ok(kins)
        })
    }

    fn get_kin<'a>(&'a self, kin_id: &'a str) -> BoxFuture<'a, BackendResult<Kin>> {
        Box::pin(async move {
            let histories = self.histories.read().await;
            ensure!(
                histories.contains_key(kin_id),
                KinNotFoundSnafu {
                    stage: "rig-get-kin",
                    kin_id: kin_id.to_string(),
                }
            );
            Ok(Kin {
                id: kin_id.to_string(),
                name: kin_id.to_string(),
            })
        })
    }

    fn create_kin<'a>(
        &'a self,
        request: CreateKinRequest,
    ) -> BoxFuture<'a, BackendResult<CreateKinOutcome>> {
        Box::pin(async move {
            let kin_id = request.id.clone().unwrap_or_else(|| request.name.clone());
            let kin = Kin {
                id: kin_id.clone(),
                name: request.name,
            };

            let mut histories = self.histories.write().await;
            if histories.contains_key(&kin_id) {
                return Ok(CreateKinOutcome::AlreadyExists(kin));
            }
            histories.insert(kin_id, Vec::new());
            Ok(CreateKinOutcome::Created(kin))
        })
    }

    fn fetch_messages<'a>(
        &'a self,
        kin_id: &'a str,
        limit: usize,
    ) -> BoxFuture<'a, BackendResult<Vec<RemoteMessage>>> {
        Box::pin(async move {
            let histories = self.histories.read().await;
            let history = histories.get(kin_id).map(Vec::as_slice).unwrap_or_default();
            let skip = history.len().saturating_sub(limit);
            Ok(history[skip..].to_vec())
        })
    }

    fn post_message<'a>(
        &'a self,
        kin_id: &'a str,
        request: PostMessageRequest,
    ) -> BoxFuture<'a, BackendResult<RemoteMessage>> {
        Box::pin(async move {
            if !request.images.is_empty() {
                tracing::warn!(
                    kin_id,
                    image_count = request.images.len(),
                    "direct backend ignores image attachments"
                );
            }

            let user_turn = self.stamp(kin_id, Role::User, request.content.clone(), request.images);
            let turns = {
                let mut histories = self.histories.write().await;
                let history = histories.entry(kin_id.to_string()).or_default();
                history.push(user_turn);
                let window = (request.history_length as usize).max(1);
                let skip = history.len().saturating_sub(window);
                history[skip..].to_vec()
            };

            // The kin id doubles as the provider model name on this backend.
            let reply = Self::complete(
                &self.config,
                &request.model,
                request.add_system.as_deref(),
                &turns,
            )
            .await?;

            let assistant_turn = self.stamp(kin_id, Role::Assistant, reply, Vec::new());
            let mut histories = self.histories.write().await;
            histories
                .entry(kin_id.to_string())
                .or_default()
                .push(assistant_turn.clone());
            Ok(assistant_turn)
        })
    }

    fn generate_image<'a>(
        &'a self,
        _kin_id: &'a str,
        _request: ImageRequest,
    ) -> BoxFuture<'a, BackendResult<GeneratedImage>> {
        Box::pin(async move {
            UnsupportedOperationSnafu {
                stage: "rig-generate-image",
                backend_id: self.config.backend_id.clone(),
                operation: "image generation",
            }
            .fail()
        })
    }

    fn synthesize_speech<'a>(
        &'a self,
        _kin_id: &'a str,
        _request: SpeechRequest,
    ) -> BoxFuture<'a, BackendResult<Vec<u8>>> {
        Box::pin(async move {
            UnsupportedOperationSnafu {
                stage: "rig-synthesize-speech",
                backend_id: self.config.backend_id.clone(),
                operation: "speech synthesis",
            }
            .fail()
        })
    }

    fn link_repo<'a>(
        &'a self,
        _kin_id: &'a str,
        _request: LinkRepoRequest,
    ) -> BoxFuture<'a, BackendResult<serde_json::Value>> {
        Box::pin(async move {
            UnsupportedOperationSnafu {
                stage: "rig-link-repo",
                backend_id: self.config.backend_id.clone(),
                operation: "repository linking",
            }
            .fail()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn backend() -> RigDirectBackend {
        let config = BackendConfig::new(RIG_OPENAI_BACKEND_ID, "", "local").with_api_key("sk-test");
        RigDirectBackend::new(config).unwrap_or_else(|error| panic!("backend should build: {error}"))
    }

    #[test]
    fn missing_api_key_is_rejected() {
        let config = BackendConfig::new(RIG_OPENAI_BACKEND_ID, "", "local");
        assert!(matches!(
            RigDirectBackend::new(config),
            Err(crate::BackendError::MissingApiKey { .. })
        ));
    }

    #[tokio::test]
    async fn created_kins_are_listed_and_idempotent() {
        let backend = backend();
        let first = backend
            .create_kin(CreateKinRequest::named("gpt-4o"))
            .await
            .unwrap_or_else(|error| panic!("create should succeed: {error}"));
        let second = backend
            .create_kin(CreateKinRequest::named("gpt-4o"))
            .await
            .unwrap_or_else(|error| panic!("create should succeed: {error}"));

        assert!(matches!(first, CreateKinOutcome::Created(_)));
        assert!(matches!(second, CreateKinOutcome::AlreadyExists(_)));

        let kins = backend.list_kins().await.unwrap_or_default();
        assert_eq!(kins.len(), 1);
        assert!(backend.get_kin("missing").await.is_err());
    }

    #[tokio::test]
    async fn image_generation_is_unsupported() {
        let backend = backend();
        let result = backend.generate_image("gpt-4o", ImageRequest::new("a cat")).await;
        assert!(matches!(
            result,
            Err(crate::BackendError::UnsupportedOperation { .. })
        ));
    }
}
