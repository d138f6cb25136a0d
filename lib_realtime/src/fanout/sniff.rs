//! Attachment content-type detection by magic bytes.

use crate::error::ValidationError;

/// Content types accepted for attachments.
pub const ALLOWED_CONTENT_TYPES: &[&str] = &["image/png", "image/jpeg", "image/gif", "image/webp"];

/// Best guess at the content type of `bytes`.
pub fn detect_content_type(bytes: &[u8]) -> &'static str {
    if bytes.len() < 4 {
        return "application/octet-stream";
    }

    match &bytes[..4] {
        [0x89, b'P', b'N', b'G'] => "image/png",
        [0xFF, 0xD8, 0xFF, _] => "image/jpeg",
        [b'G', b'I', b'F', b'8'] => "image/gif",
        [b'R', b'I', b'F', b'F'] if bytes.len() >= 12 && &bytes[8..12] == b"WEBP" => "image/webp",
        [b'%', b'P', b'D', b'F'] => "application/pdf",
        [0x50, 0x4B, 0x03, 0x04] => "application/zip",
        [0x1F, 0x8B, _, _] => "application/gzip",
        [0x7F, b'E', b'L', b'F'] => "application/x-executable",
        [b'M', b'Z', _, _] => "application/x-dosexec",
        _ => "application/octet-stream",
    }
}

/// Sniffs `bytes` and rejects anything outside the allow-list.
pub fn allowed_content_type(bytes: &[u8]) -> Result<&'static str, ValidationError> {
    let detected = detect_content_type(bytes);
    if ALLOWED_CONTENT_TYPES.contains(&detected) {
        Ok(detected)
    } else {
        Err(ValidationError::UnsupportedContentType(detected.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PNG: &[u8] = &[0x89, b'P', b'N', b'G', 0x0D, 0x0A, 0x1A, 0x0A, 0, 0];

    #[test]
    fn images_are_allowed() {
        assert_eq!(allowed_content_type(PNG), Ok("image/png"));
        assert_eq!(allowed_content_type(&[0xFF, 0xD8, 0xFF, 0xE0, 1]), Ok("image/jpeg"));
        assert_eq!(allowed_content_type(b"GIF89a"), Ok("image/gif"));
        assert_eq!(allowed_content_type(b"RIFF\0\0\0\0WEBPVP8 "), Ok("image/webp"));
    }

    #[test]
    fn everything_else_is_rejected() {
        assert_eq!(
            allowed_content_type(b"%PDF-1.7"),
            Err(ValidationError::UnsupportedContentType("application/pdf".into()))
        );
        assert!(allowed_content_type(b"RIFF\0\0\0\0WAVE").is_err());
        assert!(allowed_content_type(b"hi").is_err());
        assert!(allowed_content_type(b"").is_err());
    }
}
