use std::collections::{HashMap, VecDeque};

use polychat_llm::Model;

use super::message::{Message, MessageId, MessageStatus, RequestTicket};

/// Lifecycle of one request: awaiting a response, then settled exactly once.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RequestState {
    Awaiting,
    Resolved,
    Failed(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RequestTransition {
    Resolve,
    Fail(String),
}

/// Rejection reason for illegal request transitions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RequestRejection {
    UnknownModel { model_id: String },
    UnknownTicket { ticket: RequestTicket },
    AlreadySettled { ticket: RequestTicket },
}

impl RequestState {
    pub fn is_awaiting(&self) -> bool {
        matches!(self, Self::Awaiting)
    }

    pub fn apply(
        &self,
        ticket: &RequestTicket,
        transition: RequestTransition,
    ) -> Result<Self, RequestRejection> {
        match (self, transition) {
            (Self::Awaiting, RequestTransition::Resolve) => Ok(Self::Resolved),
            (Self::Awaiting, RequestTransition::Fail(message)) => Ok(Self::Failed(message)),
            (Self::Resolved | Self::Failed(_), _) => Err(RequestRejection::AlreadySettled {
                ticket: ticket.clone(),
            }),
        }
    }
}

/// Settled tickets remembered per pane so late or duplicate settlements
/// are still reported as such.
pub const SETTLED_TICKET_MEMORY: usize = 64;

/// One model's pane.
#[derive(Debug, Clone, Default)]
pub struct ChatState {
    messages: Vec<Message>,
    draft: String,
    pending_images: Vec<String>,
    menu_open: bool,
    input_shown: bool,
    history_loading: bool,
    requests: HashMap<u64, RequestState>,
    settled: VecDeque<u64>,
}

impl ChatState {
    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn draft(&self) -> &str {
        &self.draft
    }

    pub fn set_draft(&mut self, draft: impl Into<String>) {
        self.draft = draft.into();
    }

    pub fn pending_images(&self) -> &[String] {
        &self.pending_images
    }

    pub fn attach_images(&mut self, images: impl IntoIterator<Item = String>) {
        self.pending_images.extend(images);
    }

    pub fn remove_image(&mut self, index: usize) -> Option<String> {
        (index < self.pending_images.len()).then(|| self.pending_images.remove(index))
    }

    /// Takes the trimmed draft and the pending images, leaving both empty.
    pub fn take_composer(&mut self) -> (String, Vec<String>) {
        let draft = std::mem::take(&mut self.draft);
        (draft.trim().to_string(), std::mem::take(&mut self.pending_images))
    }

    pub fn menu_open(&self) -> bool {
        self.menu_open
    }

    pub fn toggle_menu(&mut self) -> bool {
        self.menu_open = !self.menu_open;
        self.menu_open
    }

    pub fn input_shown(&self) -> bool {
        self.input_shown
    }

    /// Toggling the input always closes the pane menu.
    pub fn toggle_input(&mut self) -> bool {
        self.input_shown = !self.input_shown;
        self.menu_open = false;
        self.input_shown
    }

    pub fn hide_input(&mut self) {
        self.input_shown = false;
    }

    pub fn is_loading(&self) -> bool {
        self.history_loading || self.requests.values().any(RequestState::is_awaiting)
    }

    pub fn in_flight(&self) -> usize {
        self.requests.values().filter(|state| state.is_awaiting()).count()
    }

    pub fn placeholder_count(&self) -> usize {
        self.messages
            .iter()
            .filter(|message| message.is_placeholder())
            .count()
    }

    pub fn set_history_loading(&mut self, loading: bool) {
        self.history_loading = loading;
    }

    /// Replaces the visible history while keeping placeholders of requests
    /// that are still awaiting a response.
    pub fn replace_history(&mut self, history: Vec<Message>) {
        let placeholders = self
            .messages
            .drain(..)
            .filter(Message::is_placeholder)
            .collect::<Vec<_>>();
        self.messages = history;
        self.messages.extend(placeholders);
    }

    pub fn push(&mut self, message: Message) {
        self.messages.push(message);
    }

    pub fn find(&self, message_id: &MessageId) -> Option<&Message> {
        self.messages.iter().find(|message| &message.id == message_id)
    }

    /// Registers a request and appends its placeholder.
    pub fn begin_request(&mut self, placeholder: Message) -> Result<(), RequestRejection> {
        let ticket = match &placeholder.status {
            MessageStatus::Thinking(ticket) => Some(ticket.clone()),
            MessageStatus::Final | MessageStatus::Failed => None,
        };
        let Some(ticket) = ticket else {
            self.messages.push(placeholder);
            return Ok(());
        };
        if self.requests.contains_key(&ticket.sequence) || self.settled.contains(&ticket.sequence)
        {
            return Err(RequestRejection::AlreadySettled { ticket });
        }

        self.requests.insert(ticket.sequence, RequestState::Awaiting);
        self.messages.push(placeholder);
        Ok(())
    }

    fn settle(
        &mut self,
        ticket: &RequestTicket,
        transition: RequestTransition,
    ) -> Result<(), RequestRejection> {
        let Some(state) = self.requests.get(&ticket.sequence) else {
            if self.settled.contains(&ticket.sequence) {
                return Err(RequestRejection::AlreadySettled {
                    ticket: ticket.clone(),
                });
            }
            return Err(RequestRejection::UnknownTicket {
                ticket: ticket.clone(),
            });
        };
        state.apply(ticket, transition)?;

        // Only awaiting requests stay in the map.
        self.requests.remove(&ticket.sequence);
        if self.settled.len() == SETTLED_TICKET_MEMORY {
            self.settled.pop_front();
        }
        self.settled.push_back(ticket.sequence);
        Ok(())
    }

    pub fn tracked_requests(&self) -> usize {
        self.requests.len() + self.settled.len()
    }

    /// Swaps the request's placeholder for the reply in place.
    pub fn resolve(
        &mut self,
        ticket: &RequestTicket,
        reply: Message,
    ) -> Result<(), RequestRejection> {
        self.settle(ticket, RequestTransition::Resolve)?;

        match self
            .messages
            .iter_mut()
            .find(|message| message.is_placeholder_for(ticket))
        {
            Some(slot) => *slot = reply,
            None => self.messages.push(reply),
        }
        Ok(())
    }

    /// Drops the request's placeholder and appends the error message.
    pub fn fail(
        &mut self,
        ticket: &RequestTicket,
        error_message: Message,
    ) -> Result<(), RequestRejection> {
        self.settle(
            ticket,
            RequestTransition::Fail(error_message.content.clone()),
        )?;

        self.messages
            .retain(|message| !message.is_placeholder_for(ticket));
        self.messages.push(error_message);
        Ok(())
    }

    pub fn attach_image_url(&mut self, message_id: &MessageId, url: impl Into<String>) -> bool {
        match self
            .messages
            .iter_mut()
            .find(|message| &message.id == message_id)
        {
            Some(message) => {
                message.image_url = Some(url.into());
                true
            }
            None => false,
        }
    }
}

/// Draft shared by every selected pane.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GlobalComposer {
    pub draft: String,
    pub images: Vec<String>,
    pub collapsed: bool,
    pub loading: bool,
}

impl GlobalComposer {
    pub fn remove_image(&mut self, index: usize) -> Option<String> {
        (index < self.images.len()).then(|| self.images.remove(index))
    }

    pub fn toggle_collapsed(&mut self) -> bool {
        self.collapsed = !self.collapsed;
        self.collapsed
    }

    pub fn has_content(&self) -> bool {
        !self.draft.trim().is_empty() || !self.images.is_empty()
    }
}

/// Everything the front-end renders: the model catalog, one pane per model,
/// and the global composer.
#[derive(Debug, Clone, Default)]
pub struct ChatBoard {
    models: Vec<Model>,
    chats: HashMap<String, ChatState>,
    composer: GlobalComposer,
    side_menu_open: bool,
    dark_mode: bool,
    fullscreen: Option<String>,
    generating_image: Option<MessageId>,
    playing_audio: Option<MessageId>,
    next_sequence: u64,
}

impl ChatBoard {
    /// Creates an empty pane for every known model.
    pub fn new(models: Vec<Model>) -> Self {
        let chats = models
            .iter()
            .map(|model| (model.id.clone(), ChatState::default()))
            .collect();

        Self {
            models,
            chats,
            next_sequence: 1,
            ..Self::default()
        }
    }

    pub fn models(&self) -> &[Model] {
        &self.models
    }

    pub fn model(&self, model_id: &str) -> Option<&Model> {
        self.models.iter().find(|model| model.id == model_id)
    }

    pub fn selected_models(&self) -> Vec<Model> {
        self.models
            .iter()
            .filter(|model| model.selected)
            .cloned()
            .collect()
    }

    /// Flips a model's selection and returns the new flag.
    pub fn toggle_model(&mut self, model_id: &str) -> Option<bool> {
        let model = self.models.iter_mut().find(|model| model.id == model_id)?;
        model.selected = !model.selected;
        Some(model.selected)
    }

    pub fn chat(&self, model_id: &str) -> Option<&ChatState> {
        self.chats.get(model_id)
    }

    pub fn chat_mut(&mut self, model_id: &str) -> Option<&mut ChatState> {
        self.chats.get_mut(model_id)
    }

    pub fn composer(&self) -> &GlobalComposer {
        &self.composer
    }

    pub fn composer_mut(&mut self) -> &mut GlobalComposer {
        &mut self.composer
    }

    pub fn side_menu_open(&self) -> bool {
        self.side_menu_open
    }

    pub fn toggle_side_menu(&mut self) -> bool {
        self.side_menu_open = !self.side_menu_open;
        self.side_menu_open
    }

    pub fn dark_mode(&self) -> bool {
        self.dark_mode
    }

    pub fn set_dark_mode(&mut self, dark_mode: bool) {
        self.dark_mode = dark_mode;
    }

    pub fn toggle_dark_mode(&mut self) -> bool {
        self.dark_mode = !self.dark_mode;
        self.dark_mode
    }

    pub fn fullscreen(&self) -> Option<&str> {
        self.fullscreen.as_deref()
    }

    /// Enters fullscreen for a pane, or leaves it when that pane is already fullscreen.
    pub fn toggle_fullscreen(&mut self, model_id: &str) -> Option<&str> {
        if self.fullscreen.as_deref() == Some(model_id) {
            self.fullscreen = None;
        } else if self.chats.contains_key(model_id) {
            self.fullscreen = Some(model_id.to_string());
        }
        self.fullscreen.as_deref()
    }

    pub fn generating_image(&self) -> Option<&MessageId> {
        self.generating_image.as_ref()
    }

    pub fn set_generating_image(&mut self, message_id: Option<MessageId>) {
        self.generating_image = message_id;
    }

    pub fn playing_audio(&self) -> Option<&MessageId> {
        self.playing_audio.as_ref()
    }

    pub fn set_playing_audio(&mut self, message_id: Option<MessageId>) {
        self.playing_audio = message_id;
    }

    pub fn issue_ticket(&mut self, model_id: &str) -> RequestTicket {
        let sequence = self.next_sequence;
        self.next_sequence += 1;
        RequestTicket::new(model_id, sequence)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chat::message::Role;

    fn model() -> Model {
        Model::new("gpt-4o", "GPT-4o")
    }

    fn pending(board: &mut ChatBoard) -> RequestTicket {
        let ticket = board.issue_ticket("gpt-4o");
        let placeholder = Message::thinking(ticket.clone(), &model());
        let begun = board
            .chat_mut("gpt-4o")
            .map(|chat| chat.begin_request(placeholder));
        assert_eq!(begun, Some(Ok(())));
        ticket
    }

    #[test]
    fn resolve_replaces_exactly_one_placeholder_in_place() {
        let mut board = ChatBoard::new(vec![model()]);
        let first = pending(&mut board);
        let second = pending(&mut board);

        let reply = Message::user(MessageId::new("reply"), "done", Vec::new());
        let chat = board.chat_mut("gpt-4o").unwrap_or_else(|| panic!("pane exists"));
        assert_eq!(chat.resolve(&first, reply), Ok(()));

        assert_eq!(chat.placeholder_count(), 1);
        assert_eq!(chat.messages()[0].id, MessageId::new("reply"));
        assert!(chat.messages()[1].is_placeholder_for(&second));
        assert!(chat.is_loading());
    }

    #[test]
    fn failure_removes_placeholder_and_appends_one_error() {
        let mut board = ChatBoard::new(vec![model()]);
        let ticket = pending(&mut board);

        let chat = board.chat_mut("gpt-4o").unwrap_or_else(|| panic!("pane exists"));
        let error = Message::failure(&model(), "status 500");
        assert_eq!(chat.fail(&ticket, error), Ok(()));

        assert_eq!(chat.placeholder_count(), 0);
        assert_eq!(chat.messages().len(), 1);
        assert_eq!(chat.messages()[0].status, MessageStatus::Failed);
        assert_eq!(chat.messages()[0].role, Role::Assistant);
        assert!(!chat.is_loading());
    }

    #[test]
    fn settling_twice_is_rejected() {
        let mut board = ChatBoard::new(vec![model()]);
        let ticket = pending(&mut board);

        let chat = board.chat_mut("gpt-4o").unwrap_or_else(|| panic!("pane exists"));
        let reply = Message::user(MessageId::new("reply"), "done", Vec::new());
        assert_eq!(chat.resolve(&ticket, reply.clone()), Ok(()));
        assert_eq!(
            chat.resolve(&ticket, reply),
            Err(RequestRejection::AlreadySettled {
                ticket: ticket.clone()
            })
        );
        assert_eq!(
            chat.fail(&ticket, Message::failure(&model(), "late")),
            Err(RequestRejection::AlreadySettled { ticket })
        );
        assert_eq!(chat.messages().len(), 1);
    }

    #[test]
    fn request_bookkeeping_stays_bounded() {
        let mut board = ChatBoard::new(vec![model()]);
        let first = pending(&mut board);
        {
            let chat = board.chat_mut("gpt-4o").unwrap_or_else(|| panic!("pane exists"));
            let reply = Message::user(MessageId::new("first"), "done", Vec::new());
            assert_eq!(chat.resolve(&first, reply), Ok(()));
        }

        for round in 0..SETTLED_TICKET_MEMORY * 3 {
            let ticket = pending(&mut board);
            let chat = board.chat_mut("gpt-4o").unwrap_or_else(|| panic!("pane exists"));
            let reply = Message::user(MessageId::new(format!("r{round}")), "ok", Vec::new());
            assert_eq!(chat.resolve(&ticket, reply), Ok(()));
            assert!(chat.tracked_requests() <= SETTLED_TICKET_MEMORY);
        }

        let chat = board.chat_mut("gpt-4o").unwrap_or_else(|| panic!("pane exists"));
        assert!(!chat.is_loading());
        assert_eq!(chat.in_flight(), 0);
        assert_eq!(
            chat.fail(&first, Message::failure(&model(), "late")),
            Err(RequestRejection::UnknownTicket { ticket: first })
        );
    }

    #[test]
    fn unknown_tickets_are_rejected() {
        let mut board = ChatBoard::new(vec![model()]);
        let chat = board.chat_mut("gpt-4o").unwrap_or_else(|| panic!("pane exists"));
        let ticket = RequestTicket::new("gpt-4o", 99);
        assert_eq!(
            chat.fail(&ticket, Message::failure(&model(), "late")),
            Err(RequestRejection::UnknownTicket { ticket })
        );
        assert!(chat.messages().is_empty());
    }

    #[test]
    fn history_replacement_keeps_outstanding_placeholders() {
        let mut board = ChatBoard::new(vec![model()]);
        let ticket = pending(&mut board);

        let chat = board.chat_mut("gpt-4o").unwrap_or_else(|| panic!("pane exists"));
        chat.replace_history(vec![Message::welcome(&model(), "Hello.")]);

        assert_eq!(chat.messages().len(), 2);
        assert!(chat.messages()[1].is_placeholder_for(&ticket));
    }

    #[test]
    fn toggling_input_closes_the_menu() {
        let mut chat = ChatState::default();
        assert!(chat.toggle_menu());
        assert!(chat.toggle_input());
        assert!(!chat.menu_open());
    }

    #[test]
    fn composer_take_trims_and_clears() {
        let mut chat = ChatState::default();
        chat.set_draft("  hello  ");
        chat.attach_images(["data:image/png;base64,AA".to_string()]);
        assert_eq!(chat.remove_image(3), None);

        let (draft, images) = chat.take_composer();
        assert_eq!(draft, "hello");
        assert_eq!(images.len(), 1);
        assert!(chat.draft().is_empty());
        assert!(chat.pending_images().is_empty());
    }

    #[test]
    fn fullscreen_toggles_per_pane() {
        let mut board = ChatBoard::new(vec![model(), Model::new("o4-mini", "o4-mini")]);
        assert_eq!(board.toggle_fullscreen("gpt-4o"), Some("gpt-4o"));
        assert_eq!(board.toggle_fullscreen("o4-mini"), Some("o4-mini"));
        assert_eq!(board.toggle_fullscreen("o4-mini"), None);
        assert_eq!(board.toggle_fullscreen("unknown"), None);
    }

    #[test]
    fn toggling_models_changes_the_selection() {
        let mut board = ChatBoard::new(vec![model(), Model::new("o4-mini", "o4-mini")]);
        assert_eq!(board.toggle_model("gpt-4o"), Some(false));
        assert_eq!(board.selected_models().len(), 1);
        assert_eq!(board.toggle_model("missing"), None);
    }
}
