/// Event contracts between the coordinator and the front-end.
pub mod events;
/// Domain entities for messages and request identity.
pub mod message;
/// Per-model panes and the board that holds them.
pub mod state;

pub use events::{BoardEvent, RequestOutcome};
pub use message::{Message, MessageId, MessageStatus, RequestTicket, Role, SourceModel};
pub use state::{
    ChatBoard, ChatState, GlobalComposer, RequestRejection, RequestState, RequestTransition,
};
