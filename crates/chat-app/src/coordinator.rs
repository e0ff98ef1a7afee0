use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use futures::future::join_all;
use polychat_llm::{
    ConversationBackend, DEFAULT_HISTORY_LENGTH, DEFAULT_MODE, ImageRequest, Model,
    PostMessageRequest, SpeechRequest,
};
use snafu::{OptionExt, ResultExt, ensure};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::chat::{
    BoardEvent, ChatBoard, Message, MessageId, RequestOutcome, RequestTicket,
};
use crate::error::{
    BackendSnafu, ChatError, ChatResult, EmptyMessageSnafu, NoModelsSelectedSnafu,
    RequestRejectedSnafu, TimedOutSnafu, UnknownMessageSnafu, UnknownModelSnafu,
};
use crate::settings::{
    DEFAULT_HISTORY_LIMIT, DEFAULT_REQUEST_TIMEOUT_SECS, DEFAULT_SYSTEM_PROMPT,
    DEFAULT_WELCOME_GREETING,
};

/// Per-request parameters shared by every pane.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatOptions {
    pub system_prompt: String,
    pub mode: String,
    pub history_length: u32,
    pub history_limit: usize,
    pub request_timeout: Duration,
    pub forward_replies: bool,
    pub welcome_greeting: String,
}

impl Default for ChatOptions {
    fn default() -> Self {
        Self {
            system_prompt: DEFAULT_SYSTEM_PROMPT.to_string(),
            mode: DEFAULT_MODE.to_string(),
            history_length: DEFAULT_HISTORY_LENGTH,
            history_limit: DEFAULT_HISTORY_LIMIT,
            request_timeout: Duration::from_secs(DEFAULT_REQUEST_TIMEOUT_SECS),
            forward_replies: false,
            welcome_greeting: DEFAULT_WELCOME_GREETING.to_string(),
        }
    }
}

/// Result of one model's request within a send.
#[derive(Debug)]
pub struct DispatchOutcome {
    pub ticket: RequestTicket,
    pub outcome: RequestOutcome,
    /// Present when the reply is being forwarded to the other selected models.
    pub forwarding: Option<JoinHandle<ForwardSummary>>,
}

#[derive(Debug)]
pub struct SendReport {
    pub user_message_id: MessageId,
    pub dispatches: Vec<DispatchOutcome>,
}

impl SendReport {
    pub fn replied(&self) -> usize {
        self.dispatches
            .iter()
            .filter(|dispatch| matches!(dispatch.outcome, RequestOutcome::Replied(_)))
            .count()
    }

    pub fn failed(&self) -> usize {
        self.dispatches.len() - self.replied()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForwardSummary {
    pub from_model_id: String,
    pub delivered: usize,
    pub attempted: usize,
}

/// Drives the board: loads histories, fans sends out to the backend and
/// applies each response to its pane in completion order.
#[derive(Clone)]
pub struct ChatCoordinator {
    board: Arc<Mutex<ChatBoard>>,
    backend: Arc<dyn ConversationBackend>,
    options: Arc<ChatOptions>,
    events: Option<mpsc::UnboundedSender<BoardEvent>>,
}

impl ChatCoordinator {
    pub fn new(
        models: Vec<Model>,
        backend: Arc<dyn ConversationBackend>,
        options: ChatOptions,
    ) -> Self {
        Self {
            board: Arc::new(Mutex::new(ChatBoard::new(models))),
            backend,
            options: Arc::new(options),
            events: None,
        }
    }

    /// Returns a receiver for board changes made by background requests.
    pub fn subscribe(&mut self) -> mpsc::UnboundedReceiver<BoardEvent> {
        let (sender, receiver) = mpsc::unbounded_channel();
        self.events = Some(sender);
        receiver
    }

    pub fn options(&self) -> &ChatOptions {
        &self.options
    }

    pub fn backend(&self) -> &Arc<dyn ConversationBackend> {
        &self.backend
    }

    /// Runs `apply` with exclusive access to the board.
    pub fn with_board<T>(&self, apply: impl FnOnce(&mut ChatBoard) -> T) -> T {
        let mut board = self.board.lock().unwrap_or_else(PoisonError::into_inner);
        apply(&mut board)
    }

    pub fn snapshot(&self) -> ChatBoard {
        self.with_board(|board| board.clone())
    }

    fn emit(&self, event: BoardEvent) {
        if let Some(events) = &self.events {
            let _ = events.send(event);
        }
    }

    /// Fetches every model's history in parallel. Panes whose history cannot
    /// be fetched get a welcome message instead.
    pub async fn load_histories(&self) {
        let models = self.with_board(|board| {
            let models = board.models().to_vec();
            for model in &models {
                if let Some(chat) = board.chat_mut(&model.id) {
                    chat.set_history_loading(true);
                }
            }
            models
        });

        join_all(models.iter().map(|model| self.load_history(model))).await;
    }

    async fn load_history(&self, model: &Model) {
        let fetched = tokio::time::timeout(
            self.options.request_timeout,
            self.backend
                .fetch_messages(&model.id, self.options.history_limit),
        )
        .await;

        let (history, used_fallback) = match fetched {
            Ok(Ok(remote)) => (
                remote
                    .into_iter()
                    .map(|message| Message::from_history(message, model))
                    .collect::<Vec<_>>(),
                false,
            ),
            Ok(Err(error)) => {
                tracing::warn!(model_id = %model.id, error = %error, "failed to fetch history");
                (
                    vec![Message::welcome(model, &self.options.welcome_greeting)],
                    true,
                )
            }
            Err(_) => {
                tracing::warn!(
                    model_id = %model.id,
                    timeout_secs = self.options.request_timeout.as_secs(),
                    "history request timed out"
                );
                (
                    vec![Message::welcome(model, &self.options.welcome_greeting)],
                    true,
                )
            }
        };

        let message_count = history.len();
        self.with_board(|board| {
            if let Some(chat) = board.chat_mut(&model.id) {
                chat.replace_history(history);
                chat.set_history_loading(false);
            }
        });
        self.emit(BoardEvent::HistoryLoaded {
            model_id: model.id.clone(),
            message_count,
            used_fallback,
        });
    }

    /// Sends the draft and pending images of a single pane to its model.
    pub async fn send_from_pane(&self, model_id: &str) -> ChatResult<SendReport> {
        let (model, ticket, user_message, content, images) =
            self.with_board(|board| -> ChatResult<_> {
                let model = board.model(model_id).cloned().context(UnknownModelSnafu {
                    stage: "send-from-pane",
                    model_id: model_id.to_string(),
                })?;
                let chat = board.chat_mut(model_id).context(UnknownModelSnafu {
                    stage: "send-from-pane",
                    model_id: model_id.to_string(),
                })?;
                ensure!(
                    !chat.draft().trim().is_empty() || !chat.pending_images().is_empty(),
                    EmptyMessageSnafu {
                        stage: "send-from-pane"
                    }
                );

                let (content, images) = chat.take_composer();
                let user_message = Message::user(
                    MessageId::generate("user", Some(model_id)),
                    content.clone(),
                    images.clone(),
                );
                let ticket = stage_request(board, &model, &user_message)?;
                Ok((model, ticket, user_message, content, images))
            })?;

        self.emit(BoardEvent::RequestStarted {
            ticket: ticket.clone(),
            user_message_id: user_message.id.clone(),
        });

        let dispatch = self.dispatch(model, ticket, content, images).await;
        Ok(SendReport {
            user_message_id: user_message.id,
            dispatches: vec![dispatch],
        })
    }

    /// Sends the global composer's draft to every selected model at once.
    ///
    /// Every pane receives the same user message. The composer keeps its
    /// draft when nothing is selected.
    pub async fn send_global(&self) -> ChatResult<SendReport> {
        let (staged, user_message, content, images) = self.with_board(|board| -> ChatResult<_> {
            ensure!(
                board.composer().has_content(),
                EmptyMessageSnafu {
                    stage: "send-global"
                }
            );
            let selected = board.selected_models();
            ensure!(
                !selected.is_empty(),
                NoModelsSelectedSnafu {
                    stage: "send-global"
                }
            );

            let composer = board.composer_mut();
            let content = std::mem::take(&mut composer.draft).trim().to_string();
            let images = std::mem::take(&mut composer.images);
            composer.loading = true;

            let user_message = Message::user(
                MessageId::generate("global_user", None),
                content.clone(),
                images.clone(),
            );

            let mut staged = Vec::with_capacity(selected.len());
            for model in selected {
                if let Some(chat) = board.chat_mut(&model.id) {
                    chat.hide_input();
                }
                let ticket = stage_request(board, &model, &user_message)?;
                staged.push((model, ticket));
            }
            Ok((staged, user_message, content, images))
        })?;

        for (_, ticket) in &staged {
            self.emit(BoardEvent::RequestStarted {
                ticket: ticket.clone(),
                user_message_id: user_message.id.clone(),
            });
        }

        tracing::info!(
            user_message_id = %user_message.id,
            targets = staged.len(),
            "fanning out global message"
        );

        let dispatches = join_all(staged.into_iter().map(|(model, ticket)| {
            self.dispatch(model, ticket, content.clone(), images.clone())
        }))
        .await;

        self.with_board(|board| board.composer_mut().loading = false);

        Ok(SendReport {
            user_message_id: user_message.id,
            dispatches,
        })
    }

    async fn dispatch(
        &self,
        model: Model,
        ticket: RequestTicket,
        content: String,
        images: Vec<String>,
    ) -> DispatchOutcome {
        let request = self
            .base_request(content, &model.id)
            .with_images(images);
        let started = std::time::Instant::now();
        let result = self.post_with_timeout(&model.id, request).await;

        match result {
            Ok(remote) => {
                let reply = Message::reply(remote, &model);
                let reply_id = reply.id.clone();
                let reply_content = reply.content.clone();
                tracing::info!(
                    model_id = %model.id,
                    sequence = ticket.sequence,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "received reply"
                );

                self.settle(&ticket, |board| {
                    board
                        .chat_mut(&ticket.model_id)
                        .map(|chat| chat.resolve(&ticket, reply))
                });
                self.emit(BoardEvent::RequestSettled {
                    ticket: ticket.clone(),
                    outcome: RequestOutcome::Replied(reply_id.clone()),
                });

                let forwarding = self
                    .options
                    .forward_replies
                    .then(|| self.forward_reply(&model, reply_content));

                DispatchOutcome {
                    ticket,
                    outcome: RequestOutcome::Replied(reply_id),
                    forwarding,
                }
            }
            Err(error) => {
                tracing::warn!(
                    model_id = %model.id,
                    sequence = ticket.sequence,
                    error = %error,
                    "request failed"
                );
                let reason = error.to_string();
                let failure = Message::failure(&model, &reason);

                self.settle(&ticket, |board| {
                    board
                        .chat_mut(&ticket.model_id)
                        .map(|chat| chat.fail(&ticket, failure))
                });
                self.emit(BoardEvent::RequestSettled {
                    ticket: ticket.clone(),
                    outcome: RequestOutcome::Failed(reason.clone()),
                });

                DispatchOutcome {
                    ticket,
                    outcome: RequestOutcome::Failed(reason),
                    forwarding: None,
                }
            }
        }
    }

    fn settle(
        &self,
        ticket: &RequestTicket,
        apply: impl FnOnce(&mut ChatBoard) -> Option<Result<(), crate::chat::RequestRejection>>,
    ) {
        match self.with_board(apply) {
            Some(Ok(())) => {}
            Some(Err(rejection)) => {
                tracing::warn!(?rejection, "ignoring request transition");
            }
            None => {
                tracing::warn!(model_id = %ticket.model_id, "pane disappeared before the reply");
            }
        }
    }

    fn base_request(&self, content: impl Into<String>, model_id: &str) -> PostMessageRequest {
        PostMessageRequest::new(content, model_id)
            .with_system(self.options.system_prompt.clone())
            .with_mode(self.options.mode.clone())
            .with_history_length(self.options.history_length)
    }

    async fn post_with_timeout(
        &self,
        model_id: &str,
        request: PostMessageRequest,
    ) -> ChatResult<polychat_llm::RemoteMessage> {
        tokio::time::timeout(
            self.options.request_timeout,
            self.backend.post_message(model_id, request),
        )
        .await
        .map_err(|_| ChatError::TimedOut {
            stage: "post-message",
            model_id: model_id.to_string(),
            timeout_secs: self.options.request_timeout.as_secs(),
        })?
        .context(BackendSnafu {
            stage: "post-message",
        })
    }

    /// Posts a successful reply to every other selected model in the
    /// background. Failures are logged and never reach the board.
    pub fn forward_reply(&self, from: &Model, content: String) -> JoinHandle<ForwardSummary> {
        let targets = self.with_board(|board| {
            board
                .selected_models()
                .into_iter()
                .filter(|model| model.id != from.id)
                .collect::<Vec<_>>()
        });
        let note = format!("Message from {}: {}", from.name, content);
        let requests = targets
            .iter()
            .map(|target| (target.id.clone(), self.base_request(note.clone(), &target.id)))
            .collect::<Vec<_>>();
        let coordinator = self.clone();
        let from_model_id = from.id.clone();

        tokio::spawn(async move {
            let attempted = requests.len();
            let results = join_all(
                requests
                    .into_iter()
                    .map(|(target_id, request)| {
                        let coordinator = coordinator.clone();
                        async move {
                            let result = coordinator.post_with_timeout(&target_id, request).await;
                            if let Err(error) = &result {
                                tracing::debug!(target_id = %target_id, error = %error, "forward failed");
                            }
                            result.is_ok()
                        }
                    }),
            )
            .await;
            let delivered = results.into_iter().filter(|delivered| *delivered).count();

            tracing::info!(
                from_model_id = %from_model_id,
                delivered,
                attempted,
                "forwarded reply to other models"
            );
            ForwardSummary {
                from_model_id,
                delivered,
                attempted,
            }
        })
    }

    /// Generates an image from a message's text and attaches it to the message.
    pub async fn generate_image(&self, model_id: &str, message_id: &MessageId) -> ChatResult<String> {
        let prompt = self.message_content(model_id, message_id, "generate-image")?;
        self.with_board(|board| board.set_generating_image(Some(message_id.clone())));

        let result = tokio::time::timeout(
            self.options.request_timeout,
            self.backend
                .generate_image(model_id, ImageRequest::new(prompt)),
        )
        .await;
        let generated = match result {
            Ok(generated) => generated.context(BackendSnafu {
                stage: "generate-image",
            }),
            Err(_) => TimedOutSnafu {
                stage: "generate-image",
                model_id: model_id.to_string(),
                timeout_secs: self.options.request_timeout.as_secs(),
            }
            .fail(),
        };

        let attached = self.with_board(|board| {
            if board.generating_image() == Some(message_id) {
                board.set_generating_image(None);
            }
            match &generated {
                Ok(image) => board
                    .chat_mut(model_id)
                    .is_some_and(|chat| chat.attach_image_url(message_id, image.url.clone())),
                Err(_) => false,
            }
        });

        let image = generated.inspect_err(|error| {
            tracing::warn!(model_id, message_id = %message_id, error = %error, "image generation failed");
        })?;
        ensure!(
            attached,
            UnknownMessageSnafu {
                stage: "attach-generated-image",
                model_id: model_id.to_string(),
                message_id: message_id.clone(),
            }
        );
        self.emit(BoardEvent::ImageAttached {
            model_id: model_id.to_string(),
            message_id: message_id.clone(),
            url: image.url.clone(),
        });
        Ok(image.url)
    }

    /// Synthesizes a message's text to audio bytes.
    ///
    /// The message stays marked as playing until [`Self::finish_playback`].
    pub async fn synthesize_speech(
        &self,
        model_id: &str,
        message_id: &MessageId,
    ) -> ChatResult<Vec<u8>> {
        let text = self.message_content(model_id, message_id, "synthesize-speech")?;
        self.with_board(|board| board.set_playing_audio(Some(message_id.clone())));

        let result = self
            .backend
            .synthesize_speech(model_id, SpeechRequest::new(text))
            .await
            .context(BackendSnafu {
                stage: "synthesize-speech",
            });
        if let Err(error) = &result {
            tracing::warn!(model_id, message_id = %message_id, error = %error, "speech synthesis failed");
            self.finish_playback(message_id);
        }
        result
    }

    pub fn finish_playback(&self, message_id: &MessageId) {
        self.with_board(|board| {
            if board.playing_audio() == Some(message_id) {
                board.set_playing_audio(None);
            }
        });
    }

    fn message_content(
        &self,
        model_id: &str,
        message_id: &MessageId,
        stage: &'static str,
    ) -> ChatResult<String> {
        self.with_board(|board| {
            let chat = board.chat(model_id).context(UnknownModelSnafu {
                stage,
                model_id: model_id.to_string(),
            })?;
            chat.find(message_id)
                .map(|message| message.content.clone())
                .context(UnknownMessageSnafu {
                    stage,
                    model_id: model_id.to_string(),
                    message_id: message_id.clone(),
                })
        })
    }
}

/// Appends the optimistic user message and a placeholder to the model's pane.
fn stage_request(
    board: &mut ChatBoard,
    model: &Model,
    user_message: &Message,
) -> ChatResult<RequestTicket> {
    let ticket = board.issue_ticket(&model.id);
    let chat = board.chat_mut(&model.id).context(UnknownModelSnafu {
        stage: "stage-request",
        model_id: model.id.clone(),
    })?;
    chat.push(user_message.clone());
    chat.begin_request(Message::thinking(ticket.clone(), model))
        .map_err(|rejection| {
            RequestRejectedSnafu {
                stage: "stage-request",
                rejection,
            }
            .build()
        })?;
    Ok(ticket)
}
