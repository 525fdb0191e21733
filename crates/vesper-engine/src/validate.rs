use vesper_types::error::ValidationError;
use vesper_types::models::AttachmentRef;

/// Maximum message length in code points, after trimming.
pub const MAX_TEXT_CODE_POINTS: usize = 10_000;
/// Maximum attachments per message.
pub const MAX_ATTACHMENTS: usize = 10;
/// Per-attachment byte ceiling (25 MiB).
pub const MAX_ATTACHMENT_BYTES: u64 = 25 * 1024 * 1024;

/// Stateless admission checks on message content. Purely synchronous,
/// no I/O; runs before any permission or storage work.
pub fn validate(text: &str, attachments: &[AttachmentRef]) -> Result<(), ValidationError> {
    let trimmed = text.trim();

    if trimmed.is_empty() && attachments.is_empty() {
        return Err(ValidationError::EmptyPayload);
    }

    let count = trimmed.chars().count();
    if count > MAX_TEXT_CODE_POINTS {
        return Err(ValidationError::TextTooLong {
            max: MAX_TEXT_CODE_POINTS,
            got: count,
        });
    }

    if trimmed
        .chars()
        .any(|c| c.is_control() && c != '\n' && c != '\r' && c != '\t')
    {
        return Err(ValidationError::DisallowedControlChars);
    }

    if attachments.len() > MAX_ATTACHMENTS {
        return Err(ValidationError::TooManyAttachments {
            max: MAX_ATTACHMENTS,
            got: attachments.len(),
        });
    }

    for (index, att) in attachments.iter().enumerate() {
        if att.byte_len > MAX_ATTACHMENT_BYTES {
            return Err(ValidationError::AttachmentTooLarge {
                index,
                max: MAX_ATTACHMENT_BYTES,
                got: att.byte_len,
            });
        }
    }

    Ok(())
}
