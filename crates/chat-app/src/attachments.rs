use std::path::{Path, PathBuf};

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use snafu::{ResultExt, ensure};

use crate::error::{AttachmentError, AttachmentResult, NotAnImageSnafu, ReadAttachmentSnafu};

/// Formats raw bytes as an inline `data:` URL.
pub fn encode_data_url(mime: &str, bytes: &[u8]) -> String {
    format!("data:{mime};base64,{}", STANDARD.encode(bytes))
}

/// Returns the image MIME type for `path`, or an error for anything else.
pub fn image_mime_for(path: &Path) -> AttachmentResult<String> {
    let mime = mime_guess::from_path(path).first_or_octet_stream();
    ensure!(
        mime.type_() == mime_guess::mime::IMAGE,
        NotAnImageSnafu {
            stage: "check-attachment-mime",
            path: path.to_path_buf(),
            mime: mime.essence_str().to_string(),
        }
    );
    Ok(mime.essence_str().to_string())
}

pub async fn load_image_attachment(path: &Path) -> AttachmentResult<String> {
    let mime = image_mime_for(path)?;
    let bytes = tokio::fs::read(path).await.context(ReadAttachmentSnafu {
        stage: "read-attachment",
        path: path.to_path_buf(),
    })?;
    Ok(encode_data_url(&mime, &bytes))
}

/// Loads every readable image; invalid files are skipped and returned separately.
pub async fn load_image_attachments(
    paths: &[PathBuf],
) -> (Vec<String>, Vec<AttachmentError>) {
    let mut images = Vec::with_capacity(paths.len());
    let mut rejected = Vec::new();

    for path in paths {
        match load_image_attachment(path).await {
            Ok(image) => images.push(image),
            Err(error) => {
                tracing::warn!(path = ?path, error = %error, "skipping attachment");
                rejected.push(error);
            }
        }
    }

    (images, rejected)
}
