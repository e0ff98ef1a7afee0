use std::sync::Arc;

mod model;
mod provider;
pub mod provisioning;
mod remote;
mod rig_adapter;

pub use model::{Model, ModelCatalog, ModelCatalogSource, default_models};
pub use provider::{
    BackendConfig, BackendError, BackendResult, BoxFuture, ConversationBackend, CreateKinOutcome,
    CreateKinRequest, DEFAULT_HISTORY_LENGTH, DEFAULT_MODE, GeneratedImage, ImageRequest, Kin,
    LinkRepoRequest, PostMessageRequest, RemoteMessage, Role, SpeechRequest,
};
pub use remote::{KinApiClient, REMOTE_BACKEND_ID};
pub use rig_adapter::{RIG_OPENAI_BACKEND_ID, RigDirectBackend};

pub fn create_backend(mut config: BackendConfig) -> BackendResult<Arc<dyn ConversationBackend>> {
    if config.backend_id.trim().is_empty() {
        config.backend_id = REMOTE_BACKEND_ID.to_string();
    }

    match config.backend_id.as_str() {
        "remote" | "kin" | "kinos" => {
            config.backend_id = REMOTE_BACKEND_ID.to_string();
            Ok(Arc::new(KinApiClient::new(config)?))
        }
        "openai" | "rig-openai" => {
            config.backend_id = RIG_OPENAI_BACKEND_ID.to_string();
            Ok(Arc::new(RigDirectBackend::new(config)?))
        }
        _ => Err(BackendError::UnsupportedBackend {
            stage: "create-backend",
            backend_id: config.backend_id,
        }),
    }
}

/// Lists the kins of the configured blueprint as selectable models, or
/// `fallback` with a warning when the listing fails.
pub async fn fetch_catalog(backend: &dyn ConversationBackend, fallback: &[Model]) -> ModelCatalog {
    match backend.list_kins().await {
        Ok(kins) => {
            let models = kins
                .into_iter()
                .map(|kin| {
                    let name = if kin.name.trim().is_empty() {
                        kin.id.clone()
                    } else {
                        kin.name
                    };
                    Model::new(kin.id, name)
                })
                .collect::<Vec<_>>();
            ModelCatalog::from_remote_api(models)
        }
        Err(error) => {
            let error_message = error.to_string();
            tracing::warn!(
                backend = backend.id(),
                fallback_model_count = fallback.len(),
                error = %error_message,
                "kin listing failed; serving configured models"
            );
            ModelCatalog::from_static_fallback(fallback.to_vec(), error_message)
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[test]
    fn unknown_backend_ids_are_rejected() {
        let config = BackendConfig::new("carrier-pigeon", "https://example.test", "bp");
        assert!(matches!(
            create_backend(config),
            Err(BackendError::UnsupportedBackend { .. })
        ));
    }

    #[test]
    fn blank_backend_id_defaults_to_remote() {
        let config = BackendConfig::new("", "https://example.test", "bp");
        let backend =
            create_backend(config).unwrap_or_else(|error| panic!("backend should build: {error}"));
        assert_eq!(backend.id(), REMOTE_BACKEND_ID);
    }

    #[tokio::test]
    async fn catalog_falls_back_to_the_configured_models() {
        let config = BackendConfig::new(REMOTE_BACKEND_ID, "http://127.0.0.1:1", "bp")
            .with_request_timeout(Duration::from_secs(2));
        let backend =
            KinApiClient::new(config).unwrap_or_else(|error| panic!("backend: {error}"));
        let fallback = vec![Model::from_id("configured")];

        let catalog = fetch_catalog(&backend, &fallback).await;
        assert_eq!(catalog.source, ModelCatalogSource::StaticFallback);
        assert_eq!(catalog.models, fallback);
        assert!(catalog.warning.is_some());
    }

    #[tokio::test]
    async fn catalog_lists_kins_from_the_backend() {
        let config = BackendConfig::new(RIG_OPENAI_BACKEND_ID, "", "bp").with_api_key("sk-test");
        let backend =
            RigDirectBackend::new(config).unwrap_or_else(|error| panic!("backend: {error}"));
        let _ = backend
            .create_kin(CreateKinRequest::named("gpt-4o"))
            .await;

        let catalog = fetch_catalog(&backend, &default_models()).await;
        assert_eq!(catalog.source, ModelCatalogSource::RemoteApi);
        assert_eq!(catalog.models, vec![Model::new("gpt-4o", "gpt-4o")]);
        assert!(catalog.warning.is_none());
    }
}
