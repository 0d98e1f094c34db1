//! Multimodal input: validate attachments and shape them into content
//! blocks.
//!
//! The supported media types are a closed set (four image formats plus
//! PDF). An attachment carries exactly one of inline base64 `data` or a
//! `url`; base64 payloads are size-bounded before anything reaches the
//! provider, with the decoded size computed from the encoded length as
//! `ceil(len * 3 / 4)`. URL attachments skip the size check since the
//! provider fetches and bounds those itself.
//!
//! In the assembled user message the attachment blocks come first and the
//! text block last.

use serde::Deserialize;

use crate::types::{ContentBlock, DocumentBlock, ImageBlock, MediaSource, MessageContent};
use crate::{Error, Result};

/// Supported image media types.
pub const SUPPORTED_IMAGE_TYPES: &[&str] =
    &["image/jpeg", "image/png", "image/gif", "image/webp"];

/// Supported document media types.
pub const SUPPORTED_DOCUMENT_TYPES: &[&str] = &["application/pdf"];

/// Maximum decoded image size in bytes (20 MiB).
pub const MAX_IMAGE_SIZE: usize = 20 * 1024 * 1024;

/// Maximum decoded document size in bytes (32 MiB).
pub const MAX_DOCUMENT_SIZE: usize = 32 * 1024 * 1024;

/// A user attachment as received from the transport layer.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct Attachment {
    /// MIME type, e.g. `image/png` or `application/pdf`.
    pub media_type: String,

    /// Base64-encoded payload. Mutually exclusive with `url`.
    #[serde(default)]
    pub data: Option<String>,

    /// Remote payload location. Mutually exclusive with `data`.
    #[serde(default)]
    pub url: Option<String>,
}

impl Attachment {
    /// Creates an inline base64 attachment.
    pub fn from_base64(media_type: impl Into<String>, data: impl Into<String>) -> Self {
        Self {
            media_type: media_type.into(),
            data: Some(data.into()),
            url: None,
        }
    }

    /// Creates a URL attachment.
    pub fn from_url(media_type: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            media_type: media_type.into(),
            data: None,
            url: Some(url.into()),
        }
    }
}

fn is_image(media_type: &str) -> bool {
    SUPPORTED_IMAGE_TYPES.contains(&media_type)
}

fn is_document(media_type: &str) -> bool {
    SUPPORTED_DOCUMENT_TYPES.contains(&media_type)
}

/// Decoded size of a base64 payload, from the encoded length alone.
fn estimate_decoded_size(base64_len: usize) -> usize {
    (base64_len * 3).div_ceil(4)
}

/// Validates media type, source exclusivity and size bounds.
///
/// # Errors
///
/// Every violation is an [`Error::InvalidInput`], user-visible and
/// non-fatal.
pub fn validate_attachment(attachment: &Attachment) -> Result<()> {
    if !is_image(&attachment.media_type) && !is_document(&attachment.media_type) {
        return Err(Error::invalid_input(format!(
            "unsupported media type '{}'; supported: {}, {}",
            attachment.media_type,
            SUPPORTED_IMAGE_TYPES.join(", "),
            SUPPORTED_DOCUMENT_TYPES.join(", "),
        )));
    }

    match (&attachment.data, &attachment.url) {
        (None, None) => {
            return Err(Error::invalid_input(
                "attachment must provide either data or url",
            ));
        }
        (Some(_), Some(_)) => {
            return Err(Error::invalid_input(
                "attachment must provide data or url, not both",
            ));
        }
        _ => {}
    }

    if let Some(data) = &attachment.data {
        let decoded = estimate_decoded_size(data.len());
        let limit = if is_image(&attachment.media_type) {
            MAX_IMAGE_SIZE
        } else {
            MAX_DOCUMENT_SIZE
        };
        if decoded > limit {
            return Err(Error::invalid_input(format!(
                "attachment too large: {:.1} MiB exceeds the {} MiB limit",
                decoded as f64 / (1024.0 * 1024.0),
                limit / (1024 * 1024),
            )));
        }
    }

    Ok(())
}

/// Converts a validated attachment into its content block.
fn attachment_to_block(attachment: &Attachment) -> ContentBlock {
    let source = match (&attachment.data, &attachment.url) {
        (Some(data), _) => MediaSource::Base64 {
            media_type: attachment.media_type.clone(),
            data: data.clone(),
        },
        (None, Some(url)) => MediaSource::Url { url: url.clone() },
        // validate_attachment rejects (None, None) before this runs.
        (None, None) => unreachable!("attachment without data or url"),
    };

    if is_image(&attachment.media_type) {
        ContentBlock::Image(ImageBlock { source })
    } else {
        ContentBlock::Document(DocumentBlock { source })
    }
}

/// Builds the user-message content from text plus attachments.
///
/// Without attachments the content stays a plain string. With
/// attachments, each is validated and converted, attachments ordered
/// before the trailing text block.
pub fn build_content(text: &str, attachments: &[Attachment]) -> Result<MessageContent> {
    if attachments.is_empty() {
        return Ok(MessageContent::Text(text.to_string()));
    }

    let mut blocks = Vec::with_capacity(attachments.len() + 1);
    for attachment in attachments {
        validate_attachment(attachment)?;
        blocks.push(attachment_to_block(attachment));
    }
    blocks.push(ContentBlock::text(text));

    Ok(MessageContent::Blocks(blocks))
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Base64 length whose estimated decoded size is exactly `target`.
    fn base64_len_for(target: usize) -> usize {
        // Largest L with ceil(3L/4) == target.
        let mut len = target * 4 / 3;
        while estimate_decoded_size(len + 1) <= target {
            len += 1;
        }
        len
    }

    #[test]
    fn test_unsupported_type_rejected() {
        let attachment = Attachment::from_base64("image/tiff", "aGk=");
        assert!(matches!(
            validate_attachment(&attachment),
            Err(Error::InvalidInput(_))
        ));

        let attachment = Attachment::from_base64("text/plain", "aGk=");
        assert!(validate_attachment(&attachment).is_err());
    }

    #[test]
    fn test_data_url_exclusivity() {
        let neither = Attachment {
            media_type: "image/png".into(),
            data: None,
            url: None,
        };
        assert!(validate_attachment(&neither).is_err());

        let both = Attachment {
            media_type: "image/png".into(),
            data: Some("aGk=".into()),
            url: Some("https://example.com/x.png".into()),
        };
        assert!(validate_attachment(&both).is_err());
    }

    #[test]
    fn test_image_size_boundary() {
        let at_limit = "A".repeat(base64_len_for(MAX_IMAGE_SIZE));
        assert_eq!(estimate_decoded_size(at_limit.len()), MAX_IMAGE_SIZE);
        assert!(validate_attachment(&Attachment::from_base64("image/png", at_limit.clone())).is_ok());

        let over = "A".repeat(at_limit.len() + 1);
        assert!(estimate_decoded_size(over.len()) > MAX_IMAGE_SIZE);
        assert!(validate_attachment(&Attachment::from_base64("image/png", over)).is_err());
    }

    #[test]
    fn test_document_size_boundary() {
        let at_limit = "A".repeat(base64_len_for(MAX_DOCUMENT_SIZE));
        assert!(
            validate_attachment(&Attachment::from_base64("application/pdf", at_limit.clone()))
                .is_ok()
        );
        let over = "A".repeat(at_limit.len() + 1);
        assert!(validate_attachment(&Attachment::from_base64("application/pdf", over)).is_err());
    }

    #[test]
    fn test_url_attachments_skip_size_check() {
        let attachment = Attachment::from_url("image/jpeg", "https://example.com/huge.jpg");
        assert!(validate_attachment(&attachment).is_ok());
    }

    #[test]
    fn test_build_content_plain_text_without_attachments() {
        let content = build_content("hello", &[]).unwrap();
        assert_eq!(content, MessageContent::Text("hello".into()));
    }

    #[test]
    fn test_build_content_orders_attachments_before_text() {
        let attachments = vec![
            Attachment::from_base64("image/png", "aGk="),
            Attachment::from_url("application/pdf", "https://example.com/doc.pdf"),
        ];
        let content = build_content("describe these", &attachments).unwrap();

        let blocks = content.blocks();
        assert_eq!(blocks.len(), 3);
        assert!(matches!(blocks[0], ContentBlock::Image(_)));
        assert!(matches!(blocks[1], ContentBlock::Document(_)));
        assert_eq!(blocks[2].as_text().unwrap(), "describe these");
    }

    #[test]
    fn test_build_content_propagates_validation_failure() {
        let attachments = vec![Attachment::from_base64("video/mp4", "aGk=")];
        assert!(build_content("nope", &attachments).is_err());
    }
}
