use super::message::{MessageId, RequestTicket};

/// How a request settled.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RequestOutcome {
    Replied(MessageId),
    Failed(String),
}

/// Emitted by the coordinator whenever the board changes outside of a direct
/// user action, so the front-end can redraw the affected pane.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BoardEvent {
    HistoryLoaded {
        model_id: String,
        message_count: usize,
        used_fallback: bool,
    },
    RequestStarted {
        ticket: RequestTicket,
        user_message_id: MessageId,
    },
    RequestSettled {
        ticket: RequestTicket,
        outcome: RequestOutcome,
    },
    ImageAttached {
        model_id: String,
        message_id: MessageId,
        url: String,
    },
}

impl BoardEvent {
    /// Pane the event belongs to.
    pub fn model_id(&self) -> &str {
        match self {
            Self::HistoryLoaded { model_id, .. } | Self::ImageAttached { model_id, .. } => model_id,
            Self::RequestStarted { ticket, .. } | Self::RequestSettled { ticket, .. } => {
                &ticket.model_id
            }
        }
    }
}
