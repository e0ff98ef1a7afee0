use std::path::PathBuf;

use polychat_llm::BackendError;
use snafu::Snafu;

use crate::chat::{MessageId, RequestRejection};

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum ChatError {
    #[snafu(display("nothing to send: the message has no text and no images"))]
    EmptyMessage { stage: &'static str },
    #[snafu(display("please select at least one model"))]
    NoModelsSelected { stage: &'static str },
    #[snafu(display("model '{model_id}' is not on the board"))]
    UnknownModel {
        stage: &'static str,
        model_id: String,
    },
    #[snafu(display("message '{message_id}' was not found in the '{model_id}' pane"))]
    UnknownMessage {
        stage: &'static str,
        model_id: String,
        message_id: MessageId,
    },
    #[snafu(display("request transition rejected on `{stage}`: {rejection:?}"))]
    RequestRejected {
        stage: &'static str,
        rejection: RequestRejection,
    },
    #[snafu(display("{source}"))]
    Backend {
        stage: &'static str,
        source: BackendError,
    },
    #[snafu(display("request to '{model_id}' timed out after {timeout_secs}s"))]
    TimedOut {
        stage: &'static str,
        model_id: String,
        timeout_secs: u64,
    },
}

pub type ChatResult<T> = Result<T, ChatError>;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum AttachmentError {
    #[snafu(display("failed to read attachment {path:?}: {source}"))]
    ReadAttachment {
        stage: &'static str,
        path: PathBuf,
        source: std::io::Error,
    },
    #[snafu(display("{path:?} is not an image (detected {mime})"))]
    NotAnImage {
        stage: &'static str,
        path: PathBuf,
        mime: String,
    },
}

pub type AttachmentResult<T> = Result<T, AttachmentError>;
