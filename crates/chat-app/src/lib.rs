#![deny(unsafe_code)]

/// Multi-model chat board: one pane per model plus a shared composer.
///
/// The crate holds the board state and the coordinator that talks to the
/// conversation backend. Front-ends render the board and forward user actions.
pub mod attachments;
/// Chat domain contracts shared with front-ends.
pub mod chat;
pub mod coordinator;
pub mod error;
/// Settings persistence.
pub mod settings;

pub use coordinator::{ChatCoordinator, ChatOptions, DispatchOutcome, ForwardSummary, SendReport};
pub use error::{AttachmentError, ChatError, ChatResult};
