use serde::Serialize;

/// File types accepted as proof of payment, identified by content.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ReceiptKind {
    Jpeg,
    Png,
    Webp,
    Pdf,
}

impl ReceiptKind {
    pub fn content_type(&self) -> &'static str {
        match self {
            ReceiptKind::Jpeg => "image/jpeg",
            ReceiptKind::Png => "image/png",
            ReceiptKind::Webp => "image/webp",
            ReceiptKind::Pdf => "application/pdf",
        }
    }

    fn matches_extension(&self, extension: &str) -> bool {
        match self {
            ReceiptKind::Jpeg => matches!(extension, "jpg" | "jpeg"),
            ReceiptKind::Png => extension == "png",
            ReceiptKind::Webp => extension == "webp",
            ReceiptKind::Pdf => extension == "pdf",
        }
    }
}

/// Identify a file by its leading magic bytes.
pub fn sniff(bytes: &[u8]) -> Option<ReceiptKind> {
    if bytes.starts_with(&[0xFF, 0xD8, 0xFF]) {
        return Some(ReceiptKind::Jpeg);
    }
    if bytes.starts_with(&[0x89, b'P', b'N', b'G', 0x0D, 0x0A, 0x1A, 0x0A]) {
        return Some(ReceiptKind::Png);
    }
    if bytes.starts_with(b"%PDF-") {
        return Some(ReceiptKind::Pdf);
    }
    if bytes.len() >= 12 && &bytes[0..4] == b"RIFF" && &bytes[8..12] == b"WEBP" {
        return Some(ReceiptKind::Webp);
    }
    None
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ReceiptError {
    #[error("No receipt file was provided")]
    Missing,

    #[error("Receipt is {size} bytes, the limit is {max}")]
    TooLarge { size: usize, max: usize },

    #[error("File type .{0} is not accepted")]
    ExtensionNotAllowed(String),

    #[error("File content does not match its .{extension} extension")]
    ContentMismatch { extension: String },
}

/// Upload rules for payment receipts.
#[derive(Debug, Clone)]
pub struct ReceiptPolicy {
    pub allowed_extensions: Vec<String>,
    pub max_bytes: usize,
}

impl Default for ReceiptPolicy {
    fn default() -> Self {
        Self {
            allowed_extensions: ["jpg", "jpeg", "png", "webp", "pdf"].iter().map(|s| s.to_string()).collect(),
            max_bytes: 5 * 1024 * 1024,
        }
    }
}

impl ReceiptPolicy {
    /// Extension whitelist first, then the content must agree with the extension.
    pub fn validate(&self, file_name: &str, bytes: &[u8]) -> Result<ReceiptKind, ReceiptError> {
        if bytes.is_empty() {
            return Err(ReceiptError::Missing);
        }
        if bytes.len() > self.max_bytes {
            return Err(ReceiptError::TooLarge {
                size: bytes.len(),
                max: self.max_bytes,
            });
        }

        let extension = file_name
            .rsplit_once('.')
            .map(|(_, ext)| ext.to_ascii_lowercase())
            .unwrap_or_default();
        if extension.is_empty() || !self.allowed_extensions.iter().any(|e| e.eq_ignore_ascii_case(&extension)) {
            return Err(ReceiptError::ExtensionNotAllowed(extension));
        }

        match sniff(bytes) {
            Some(kind) if kind.matches_extension(&extension) => Ok(kind),
            _ => Err(ReceiptError::ContentMismatch { extension }),
        }
    }
}
