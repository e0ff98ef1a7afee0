use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use polychat_chat::attachments::load_image_attachments;
use polychat_chat::chat::{BoardEvent, ChatBoard, MessageId, RequestOutcome};
use polychat_chat::settings::{ChatSettings, SettingsStore};
use polychat_chat::{ChatCoordinator, ChatError};
use polychat_llm::provisioning::{LinkStatus, RetryPolicy, ensure_kins, link_all};
use polychat_llm::{
    BackendError, ConversationBackend, CreateKinOutcome, create_backend, fetch_catalog,
};
use snafu::{ResultExt, Snafu};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;

use crate::cli::{Cli, Command, ProvisionCommand};
use crate::commands::{self, ComposerTarget, HELP, ReplCommand};
use crate::render::{Style, render_board, render_message, render_models, render_pane};

#[derive(Debug, Snafu)]
pub enum AppError {
    #[snafu(display("failed to create the conversation backend on `{stage}`: {source}"))]
    CreateBackend {
        stage: &'static str,
        source: BackendError,
    },
    #[snafu(display("failed to read input on `{stage}`: {source}"))]
    ReadInput {
        stage: &'static str,
        source: std::io::Error,
    },
    #[snafu(display("{failed} of {total} kin(s) failed on `{stage}`"))]
    ProvisioningFailed {
        stage: &'static str,
        failed: usize,
        total: usize,
    },
}

/// Loads settings, applies command line overrides and runs the chosen command.
pub async fn run(cli: Cli) -> Result<(), AppError> {
    let store = Arc::new(match &cli.config {
        Some(path) => SettingsStore::new(path.clone()),
        None => SettingsStore::load(),
    });
    let mut settings = (*store.settings()).clone();
    if let Some(base_url) = &cli.base_url {
        settings.base_url = base_url.clone();
        settings = settings.normalized();
    }

    let backend = create_backend(settings.to_backend_config()).context(CreateBackendSnafu {
        stage: "create-backend",
    })?;
    tracing::info!(
        backend_id = backend.id(),
        base_url = %settings.base_url,
        blueprint_id = %settings.blueprint_id,
        "backend ready"
    );

    match cli.command() {
        Command::Chat {
            forward,
            no_history,
        } => {
            if forward {
                settings.forward_replies = true;
            }
            let (app, events) = ChatApp::new(&settings, backend, store, !cli.no_color);
            app.run(events, !no_history).await
        }
        Command::Kins => {
            list_kins(&settings, backend.as_ref()).await;
            Ok(())
        }
        Command::Provision { action } => provision(&settings, backend.as_ref(), action).await,
    }
}

async fn list_kins(settings: &ChatSettings, backend: &dyn ConversationBackend) {
    let catalog = fetch_catalog(backend, &settings.models).await;
    if let Some(warning) = &catalog.warning {
        println!("warning: {warning}");
    }
    println!(
        "{} kin(s) for blueprint {} ({:?})",
        catalog.models.len(),
        settings.blueprint_id,
        catalog.source
    );
    for model in &catalog.models {
        println!("  {}  {}", model.id, model.name);
    }
}

async fn provision(
    settings: &ChatSettings,
    backend: &dyn ConversationBackend,
    action: ProvisionCommand,
) -> Result<(), AppError> {
    let kin_ids_or_default = |kins: Vec<String>| {
        if kins.is_empty() {
            settings.model_ids()
        } else {
            kins
        }
    };

    match action {
        ProvisionCommand::CreateKins { kins } => {
            let kin_ids = kin_ids_or_default(kins);
            let outcomes = ensure_kins(backend, &kin_ids).await;
            let mut failed = 0;
            for (kin_id, outcome) in &outcomes {
                match outcome {
                    Ok(CreateKinOutcome::Created(_)) => println!("{kin_id}: created"),
                    Ok(CreateKinOutcome::AlreadyExists(_)) => println!("{kin_id}: already exists"),
                    Err(error) => {
                        failed += 1;
                        println!("{kin_id}: failed: {error}");
                    }
                }
            }
            finish_provisioning("create-kins", failed, outcomes.len())
        }
        ProvisionCommand::LinkRepo {
            kins,
            template,
            pause_secs,
        } => {
            let kin_ids = kin_ids_or_default(kins);
            let template = template.unwrap_or_else(|| settings.repo_url_template.clone());
            let outcomes = link_all(
                backend,
                &kin_ids,
                &template,
                RetryPolicy::default(),
                Duration::from_secs(pause_secs),
            )
            .await;

            for outcome in &outcomes {
                match &outcome.status {
                    LinkStatus::Linked { github_url } => println!(
                        "{}: linked to {github_url} after {} attempt(s)",
                        outcome.kin_id, outcome.attempts
                    ),
                    LinkStatus::Failed { error } => println!(
                        "{}: failed after {} attempt(s): {error}",
                        outcome.kin_id, outcome.attempts
                    ),
                }
            }
            let failed = outcomes.iter().filter(|outcome| !outcome.is_linked()).count();
            finish_provisioning("link-repo", failed, outcomes.len())
        }
    }
}

fn finish_provisioning(stage: &'static str, failed: usize, total: usize) -> Result<(), AppError> {
    if failed == 0 {
        println!("done: {total} kin(s)");
        Ok(())
    } else {
        ProvisioningFailedSnafu {
            stage,
            failed,
            total,
        }
        .fail()
    }
}

/// Interactive front-end: reads commands from stdin and prints the board.
pub struct ChatApp {
    coordinator: ChatCoordinator,
    store: Arc<SettingsStore>,
    color: bool,
}

impl ChatApp {
    pub fn new(
        settings: &ChatSettings,
        backend: Arc<dyn ConversationBackend>,
        store: Arc<SettingsStore>,
        color: bool,
    ) -> (Self, mpsc::UnboundedReceiver<BoardEvent>) {
        let mut coordinator = ChatCoordinator::new(
            settings.models.clone(),
            backend,
            settings.to_chat_options(),
        );
        let events = coordinator.subscribe();
        coordinator.with_board(|board| board.set_dark_mode(settings.dark_mode));

        (
            Self {
                coordinator,
                store,
                color,
            },
            events,
        )
    }

    pub fn coordinator(&self) -> &ChatCoordinator {
        &self.coordinator
    }

    fn style(&self, board: &ChatBoard) -> Style {
        Style::for_board(board, self.color)
    }

    pub async fn run(
        self,
        events: mpsc::UnboundedReceiver<BoardEvent>,
        load_history: bool,
    ) -> Result<(), AppError> {
        let printer = tokio::spawn(print_events(self.coordinator.clone(), events, self.color));
        if load_history {
            let coordinator = self.coordinator.clone();
            tokio::spawn(async move { coordinator.load_histories().await });
        }

        let selected = self
            .coordinator
            .with_board(|board| board.selected_models().len());
        println!("polychat: {selected} model(s) selected, /help for commands");

        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        while let Some(line) = lines.next_line().await.context(ReadInputSnafu {
            stage: "read-repl-line",
        })? {
            match commands::parse(&line) {
                Ok(ReplCommand::Quit) => break,
                Ok(command) => self.handle(command).await,
                Err(error) => println!("{error}"),
            }
        }

        printer.abort();
        Ok(())
    }

    /// Applies one command. Sends and remote actions run in the background.
    pub async fn handle(&self, command: ReplCommand) {
        match command {
            ReplCommand::Empty | ReplCommand::Quit => {}
            ReplCommand::Help => println!("{HELP}"),
            ReplCommand::Board => {
                let rendered = self
                    .coordinator
                    .with_board(|board| render_board(board, self.style(board)));
                println!("{rendered}");
            }
            ReplCommand::Models => {
                let rendered = self
                    .coordinator
                    .with_board(|board| render_models(board, self.style(board)));
                print!("{rendered}");
            }
            ReplCommand::Show { model } => {
                let rendered = self.coordinator.with_board(|board| {
                    let model_id = resolve_model(board, &model)?;
                    let model = board.model(&model_id)?;
                    let chat = board.chat(&model_id)?;
                    Some(render_pane(model, chat, self.style(board)))
                });
                match rendered {
                    Some(rendered) => print!("{rendered}"),
                    None => println!("unknown model `{model}`"),
                }
            }
            ReplCommand::Toggle { model } => {
                let toggled = self.coordinator.with_board(|board| {
                    let model_id = resolve_model(board, &model)?;
                    board.toggle_model(&model_id).map(|selected| (model_id, selected))
                });
                match toggled {
                    Some((model_id, true)) => println!("{model_id} selected"),
                    Some((model_id, false)) => println!("{model_id} deselected"),
                    None => println!("unknown model `{model}`"),
                }
            }
            ReplCommand::SendGlobal { text } => self.send_global(text),
            ReplCommand::SendTo { model, text } => self.send_to(&model, text),
            ReplCommand::Attach { target, paths } => self.attach(target, paths).await,
            ReplCommand::Detach { target, index } => self.detach(target, index),
            ReplCommand::ToggleInput { model } => self.with_pane(&model, |board, model_id| {
                board.chat_mut(model_id).map(|chat| {
                    if chat.toggle_input() {
                        format!("{model_id}: input shown")
                    } else {
                        format!("{model_id}: input hidden")
                    }
                })
            }),
            ReplCommand::ToggleMenu { model } => self.with_pane(&model, |board, model_id| {
                board.chat_mut(model_id).map(|chat| {
                    if chat.toggle_menu() {
                        format!("{model_id}: menu open")
                    } else {
                        format!("{model_id}: menu closed")
                    }
                })
            }),
            ReplCommand::Fullscreen { model } => self.with_pane(&model, |board, model_id| {
                Some(match board.toggle_fullscreen(model_id) {
                    Some(focused) => format!("fullscreen: {focused}"),
                    None => "fullscreen off".to_string(),
                })
            }),
            ReplCommand::SideMenu => {
                let open = self.coordinator.with_board(ChatBoard::toggle_side_menu);
                println!("side menu {}", if open { "open" } else { "closed" });
            }
            ReplCommand::Collapse => {
                let collapsed = self
                    .coordinator
                    .with_board(|board| board.composer_mut().toggle_collapsed());
                println!(
                    "composer {}",
                    if collapsed { "collapsed" } else { "expanded" }
                );
            }
            ReplCommand::Dark => self.toggle_dark_mode(),
            ReplCommand::Image { model, message_id } => self.generate_image(&model, message_id),
            ReplCommand::Speak { model, message_id } => self.speak(&model, message_id),
        }
    }

    fn with_pane(
        &self,
        model: &str,
        apply: impl FnOnce(&mut ChatBoard, &str) -> Option<String>,
    ) {
        let outcome = self.coordinator.with_board(|board| {
            let model_id = resolve_model(board, model)?;
            apply(board, &model_id)
        });
        match outcome {
            Some(outcome) => println!("{outcome}"),
            None => println!("unknown model `{model}`"),
        }
    }

    fn send_global(&self, text: String) {
        self.coordinator
            .with_board(|board| board.composer_mut().draft = text);
        let coordinator = self.coordinator.clone();
        tokio::spawn(async move {
            match coordinator.send_global().await {
                Ok(report) => tracing::info!(
                    user_message_id = %report.user_message_id,
                    replied = report.replied(),
                    failed = report.failed(),
                    "global send settled"
                ),
                Err(error) => report_send_error(&error),
            }
        });
    }

    fn send_to(&self, model: &str, text: String) {
        let model_id = self.coordinator.with_board(|board| {
            let model_id = resolve_model(board, model)?;
            if let Some(chat) = board.chat_mut(&model_id) {
                chat.set_draft(text);
            }
            Some(model_id)
        });
        let Some(model_id) = model_id else {
            println!("unknown model `{model}`");
            return;
        };

        let coordinator = self.coordinator.clone();
        tokio::spawn(async move {
            if let Err(error) = coordinator.send_from_pane(&model_id).await {
                report_send_error(&error);
            }
        });
    }

    async fn attach(&self, target: ComposerTarget, paths: Vec<PathBuf>) {
        let (images, rejected) = load_image_attachments(&paths).await;
        for error in &rejected {
            println!("skipped: {error}");
        }
        if images.is_empty() {
            return;
        }

        let count = images.len();
        let attached = self.coordinator.with_board(|board| match &target {
            ComposerTarget::Global => {
                board.composer_mut().images.extend(images);
                Some("all selected".to_string())
            }
            ComposerTarget::Pane(model) => {
                let model_id = resolve_model(board, model)?;
                board.chat_mut(&model_id)?.attach_images(images);
                Some(model_id)
            }
        });
        match attached {
            Some(target) => println!("attached {count} image(s) to {target}"),
            None => println!("unknown pane, nothing attached"),
        }
    }

    fn detach(&self, target: ComposerTarget, index: usize) {
        let removed = self.coordinator.with_board(|board| match &target {
            ComposerTarget::Global => board.composer_mut().remove_image(index),
            ComposerTarget::Pane(model) => {
                let model_id = resolve_model(board, model)?;
                board.chat_mut(&model_id)?.remove_image(index)
            }
        });
        match removed {
            Some(_) => println!("removed image {index}"),
            None => println!("no image at {index}"),
        }
    }

    fn toggle_dark_mode(&self) {
        let dark_mode = self.coordinator.with_board(ChatBoard::toggle_dark_mode);
        println!("dark mode {}", if dark_mode { "on" } else { "off" });

        if let Err(error) = self.store.modify(|settings| settings.dark_mode = dark_mode) {
            tracing::warn!(error = %error, "failed to save dark mode");
        }
    }

    fn generate_image(&self, model: &str, message_id: String) {
        let Some(model_id) = self
            .coordinator
            .with_board(|board| resolve_model(board, model))
        else {
            println!("unknown model `{model}`");
            return;
        };

        let coordinator = self.coordinator.clone();
        tokio::spawn(async move {
            let message_id = MessageId::new(message_id);
            println!("generating an image for {message_id}...");
            if let Err(error) = coordinator.generate_image(&model_id, &message_id).await {
                println!("image generation failed: {error}");
            }
        });
    }

    fn speak(&self, model: &str, message_id: String) {
        let Some(model_id) = self
            .coordinator
            .with_board(|board| resolve_model(board, model))
        else {
            println!("unknown model `{model}`");
            return;
        };

        let coordinator = self.coordinator.clone();
        tokio::spawn(async move {
            let message_id = MessageId::new(message_id);
            match coordinator.synthesize_speech(&model_id, &message_id).await {
                Ok(audio) => {
                    let path = speech_file_path(&std::env::temp_dir(), &message_id);
                    match tokio::fs::write(&path, &audio).await {
                        Ok(()) => println!("audio saved to {}", path.display()),
                        Err(error) => println!("failed to save audio: {error}"),
                    }
                    coordinator.finish_playback(&message_id);
                }
                Err(error) => println!("speech synthesis failed: {error}"),
            }
        });
    }
}

fn report_send_error(error: &ChatError) {
    tracing::debug!(error = ?error, "send rejected");
    println!("not sent: {error}");
}

/// Audio file for a message inside `dir`. Characters outside `[A-Za-z0-9_-]`
/// become `_` so the id cannot name another directory.
pub fn speech_file_path(dir: &Path, message_id: &MessageId) -> PathBuf {
    let stem = message_id
        .as_str()
        .chars()
        .map(|ch| {
            if ch.is_ascii_alphanumeric() || ch == '-' || ch == '_' {
                ch
            } else {
                '_'
            }
        })
        .collect::<String>();
    dir.join(format!("polychat-{stem}.mp3"))
}

/// Matches a model by id first, then by id or name ignoring case.
pub fn resolve_model(board: &ChatBoard, raw: &str) -> Option<String> {
    if let Some(model) = board.model(raw) {
        return Some(model.id.clone());
    }
    board
        .models()
        .iter()
        .find(|model| model.id.eq_ignore_ascii_case(raw) || model.name.eq_ignore_ascii_case(raw))
        .map(|model| model.id.clone())
}

async fn print_events(
    coordinator: ChatCoordinator,
    mut events: mpsc::UnboundedReceiver<BoardEvent>,
    color: bool,
) {
    while let Some(event) = events.recv().await {
        let line = coordinator.with_board(|board| describe_event(board, &event, color));
        if let Some(line) = line {
            println!("{line}");
        }
    }
}

fn describe_event(board: &ChatBoard, event: &BoardEvent, color: bool) -> Option<String> {
    let style = Style::for_board(board, color);
    let model_name = board
        .model(event.model_id())
        .map(|model| model.name.clone())
        .unwrap_or_else(|| event.model_id().to_string());

    match event {
        BoardEvent::HistoryLoaded {
            message_count,
            used_fallback: false,
            ..
        } => Some(format!("{model_name}: loaded {message_count} message(s)")),
        BoardEvent::HistoryLoaded {
            used_fallback: true,
            ..
        } => Some(format!("{model_name}: history unavailable, showing a welcome")),
        BoardEvent::RequestStarted { .. } => Some(format!("{model_name} is thinking...")),
        BoardEvent::RequestSettled {
            ticket,
            outcome: RequestOutcome::Replied(message_id),
        } => board
            .chat(&ticket.model_id)
            .and_then(|chat| chat.find(message_id))
            .map(|message| render_message(message, style)),
        BoardEvent::RequestSettled {
            outcome: RequestOutcome::Failed(reason),
            ..
        } => Some(format!("{model_name}: Failed to get a response: {reason}")),
        BoardEvent::ImageAttached {
            message_id, url, ..
        } => Some(format!("{model_name}: image for {message_id}: {url}")),
    }
}
