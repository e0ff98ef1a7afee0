//! One-time administrative setup against the kin API: creating kins and linking
//! them to source repositories. None of this runs inside the chat loop.

use std::time::Duration;

use super::provider::{
    BackendError, BackendResult, ConversationBackend, CreateKinOutcome, CreateKinRequest,
    LinkRepoRequest,
};

pub const DEFAULT_REPO_URL_TEMPLATE: &str =
    "https://github.com/Universal-Basic-Compute/persistenceprotocol_{model}.git";
pub const DEFAULT_LINK_PAUSE: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_secs(1),
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `retry` (zero based): base, 2x base, 4x base...
    pub fn delay_for(&self, retry: u32) -> Duration {
        self.base_delay.saturating_mul(2u32.saturating_pow(retry))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkStatus {
    Linked { github_url: String },
    Failed { error: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KinLinkOutcome {
    pub kin_id: String,
    pub attempts: u32,
    pub status: LinkStatus,
}

impl KinLinkOutcome {
    pub fn is_linked(&self) -> bool {
        matches!(self.status, LinkStatus::Linked { .. })
    }
}

pub fn repo_url_for(template: &str, kin_id: &str) -> String {
    template.replace("{model}", kin_id)
}

/// Creates a kin named after the model id; an existing kin counts as success.
pub async fn ensure_kin(
    backend: &dyn ConversationBackend,
    kin_id: &str,
) -> BackendResult<CreateKinOutcome> {
    tracing::info!(kin_id, "creating kin");
    let outcome = backend
        .create_kin(CreateKinRequest::named(kin_id).with_id(kin_id))
        .await?;

    match &outcome {
        CreateKinOutcome::Created(kin) => tracing::info!(kin_id = %kin.id, "kin created"),
        CreateKinOutcome::AlreadyExists(kin) => {
            tracing::info!(kin_id = %kin.id, "kin already exists")
        }
    }
    Ok(outcome)
}

/// Creates kins one after another, collecting every outcome.
pub async fn ensure_kins(
    backend: &dyn ConversationBackend,
    kin_ids: &[String],
) -> Vec<(String, BackendResult<CreateKinOutcome>)> {
    let mut outcomes = Vec::with_capacity(kin_ids.len());
    for kin_id in kin_ids {
        let outcome = ensure_kin(backend, kin_id).await;
        if let Err(error) = &outcome {
            tracing::error!(kin_id = %kin_id, error = %error, "failed to create kin");
        }
        outcomes.push((kin_id.clone(), outcome));
    }
    outcomes
}

async fn attempt_link(
    backend: &dyn ConversationBackend,
    kin_id: &str,
    github_url: &str,
) -> BackendResult<serde_json::Value> {
    if let Err(error) = backend.get_kin(kin_id).await {
        tracing::info!(kin_id, error = %error, "kin not reachable, creating it before linking");
        ensure_kin(backend, kin_id).await?;
    }

    backend
        .link_repo(
            kin_id,
            LinkRepoRequest {
                github_url: github_url.to_string(),
                use_local_git: true,
            },
        )
        .await
}

/// Links one kin to its repository, retrying with exponential backoff.
pub async fn link_kin_to_repo(
    backend: &dyn ConversationBackend,
    kin_id: &str,
    github_url: &str,
    policy: RetryPolicy,
) -> KinLinkOutcome {
    let mut retry = 0;
    loop {
        tracing::info!(kin_id, github_url, attempt = retry + 1, "linking kin to repository");
        match attempt_link(backend, kin_id, github_url).await {
            Ok(response) => {
                tracing::info!(kin_id, %response, "kin linked");
                return KinLinkOutcome {
                    kin_id: kin_id.to_string(),
                    attempts: retry + 1,
                    status: LinkStatus::Linked {
                        github_url: github_url.to_string(),
                    },
                };
            }
            Err(error) if retry < policy.max_retries => {
                let delay = policy.delay_for(retry);
                log_retry(kin_id, &error, delay);
                tokio::time::sleep(delay).await;
                retry += 1;
            }
            Err(error) => {
                tracing::error!(kin_id, error = %error, "giving up on linking kin");
                return KinLinkOutcome {
                    kin_id: kin_id.to_string(),
                    attempts: retry + 1,
                    status: LinkStatus::Failed {
                        error: error.to_string(),
                    },
                };
            }
        }
    }
}

fn log_retry(kin_id: &str, error: &BackendError, delay: Duration) {
    if error.is_rate_limited() {
        tracing::warn!(kin_id, delay_ms = delay.as_millis() as u64, "rate limited or unavailable, retrying");
    } else {
        tracing::warn!(kin_id, error = %error, delay_ms = delay.as_millis() as u64, "link attempt failed, retrying");
    }
}

/// Links every kin in order, pausing between kins to stay under rate limits.
pub async fn link_all(
    backend: &dyn ConversationBackend,
    kin_ids: &[String],
    url_template: &str,
    policy: RetryPolicy,
    pause: Duration,
) -> Vec<KinLinkOutcome> {
    let mut outcomes = Vec::with_capacity(kin_ids.len());
    for (index, kin_id) in kin_ids.iter().enumerate() {
        let github_url = repo_url_for(url_template, kin_id);
        outcomes.push(link_kin_to_repo(backend, kin_id, &github_url, policy).await);

        if index + 1 < kin_ids.len() {
            tokio::time::sleep(pause).await;
        }
    }
    outcomes
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicU32, Ordering};

    use super::*;
    use crate::provider::{
        BoxFuture, GeneratedImage, ImageRequest, Kin, PostMessageRequest, RemoteMessage,
        SpeechRequest,
    };

    /// Fails `link_repo` a fixed number of times, then succeeds.
    struct FlakyLinker {
        failures_left: AtomicU32,
        link_calls: AtomicU32,
        known_kin: bool,
        created: Mutex<Vec<String>>,
    }

    impl FlakyLinker {
        fn new(failures: u32, known_kin: bool) -> Self {
            Self {
                failures_left: AtomicU32::new(failures),
                link_calls: AtomicU32::new(0),
                known_kin,
                created: Mutex::new(Vec::new()),
            }
        }
    }

    fn unsupported<T>() -> BackendResult<T> {
        Err(BackendError::UnsupportedOperation {
            stage: "test",
            backend_id: "flaky".to_string(),
            operation: "test",
        })
    }

    impl ConversationBackend for FlakyLinker {
        fn id(&self) -> &str {
            "flaky"
        }

        fn name(&self) -> &str {
            "Flaky"
        }

        fn list_kins<'a>(&'a self) -> BoxFuture<'a, BackendResult<Vec<Kin>>> {
            Box::pin(async move { Ok(Vec::new()) })
        }

        fn get_kin<'a>(&'a self, kin_id: &'a str) -> BoxFuture<'a, BackendResult<Kin>> {
            Box::pin(async move {
                if self.known_kin {
                    Ok(Kin {
                        id: kin_id.to_string(),
                        name: kin_id.to_string(),
                    })
                } else {
                    Err(BackendError::KinNotFound {
                        stage: "test",
                        kin_id: kin_id.to_string(),
                    })
                }
            })
        }

        fn create_kin<'a>(
            &'a self,
            request: CreateKinRequest,
        ) -> BoxFuture<'a, BackendResult<CreateKinOutcome>> {
            Box::pin(async move {
                if let Ok(mut created) = self.created.lock() {
                    created.push(request.name.clone());
                }
                Ok(CreateKinOutcome::Created(Kin {
                    id: request.id.unwrap_or_default(),
                    name: request.name,
                }))
            })
        }

        fn fetch_messages<'a>(
            &'a self,
            _kin_id: &'a str,
            _limit: usize,
        ) -> BoxFuture<'a, BackendResult<Vec<RemoteMessage>>> {
            Box::pin(async move { unsupported() })
        }

        fn post_message<'a>(
            &'a self,
            _kin_id: &'a str,
            _request: PostMessageRequest,
        ) -> BoxFuture<'a, BackendResult<RemoteMessage>> {
            Box::pin(async move { unsupported() })
        }

        fn generate_image<'a>(
            &'a self,
            _kin_id: &'a str,
            _request: ImageRequest,
        ) -> BoxFuture<'a, BackendResult<GeneratedImage>> {
            Box::pin(async move { unsupported() })
        }

        fn synthesize_speech<'a>(
            &'a self,
            _kin_id: &'a str,
            _request: SpeechRequest,
        ) -> BoxFuture<'a, BackendResult<Vec<u8>>> {
            Box::pin(async move { unsupported() })
        }

        fn link_repo<'a>(
            &'a self,
            _kin_id: &'a str,
            _request: LinkRepoRequest,
        ) -> BoxFuture<'a, BackendResult<serde_json::Value>> {
            Box::pin(async move {
                self.link_calls.fetch_add(1, Ordering::SeqCst);
                let remaining = self.failures_left.load(Ordering::SeqCst);
                if remaining > 0 {
                    self.failures_left.store(remaining - 1, Ordering::SeqCst);
                    return Err(BackendError::Status {
                        stage: "test",
                        status: 429,
                        body: "slow down".to_string(),
                    });
                }
                Ok(serde_json::json!({ "status": "linked" }))
            })
        }
    }

    #[test]
    fn backoff_doubles_from_the_base_delay() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.delay_for(0), Duration::from_secs(1));
        assert_eq!(policy.delay_for(1), Duration::from_secs(2));
        assert_eq!(policy.delay_for(2), Duration::from_secs(4));
    }

    #[test]
    fn repo_url_template_substitutes_the_model() {
        assert_eq!(
            repo_url_for(DEFAULT_REPO_URL_TEMPLATE, "gpt-4o"),
            "https://github.com/Universal-Basic-Compute/persistenceprotocol_gpt-4o.git"
        );
    }

    #[tokio::test(start_paused = true)]
    async fn transient_failures_are_retried_until_linked() {
        let backend = FlakyLinker::new(2, true);
        let outcome =
            link_kin_to_repo(&backend, "gpt-4o", "https://example.test/repo.git", RetryPolicy::default())
                .await;

        assert!(outcome.is_linked());
        assert_eq!(outcome.attempts, 3);
        assert_eq!(backend.link_calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn retries_stop_after_the_policy_limit() {
        let backend = FlakyLinker::new(10, true);
        let outcome =
            link_kin_to_repo(&backend, "gpt-4o", "https://example.test/repo.git", RetryPolicy::default())
                .await;

        assert!(!outcome.is_linked());
        assert_eq!(outcome.attempts, 4);
        assert_eq!(backend.link_calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn unknown_kins_are_created_before_linking() {
        let backend = FlakyLinker::new(0, false);
        let outcomes = link_all(
            &backend,
            &["o4-mini".to_string(), "gpt-4o".to_string()],
            DEFAULT_REPO_URL_TEMPLATE,
            RetryPolicy::default(),
            DEFAULT_LINK_PAUSE,
        )
        .await;

        assert!(outcomes.iter().all(KinLinkOutcome::is_linked));
        let created = backend
            .created
            .lock()
            .map(|created| created.clone())
            .unwrap_or_default();
        assert_eq!(created, vec!["o4-mini".to_string(), "gpt-4o".to_string()]);
    }
}
