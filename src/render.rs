//! Extension-driven rendering mode for documents.

use std::path::Path;

/// How a document body is delivered to the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContentKind {
    /// `.txt`: raw bytes as `text/plain`.
    PlainText,
    /// `.md`: rendered to HTML inside the page layout.
    Markdown,
    /// Any other extension (or none). Served like plain text.
    Other,
}

impl ContentKind {
    /// Classify a document by the extension of its name (case-sensitive,
    /// matching how names are stored).
    pub fn from_name(name: &str) -> Self {
        match Path::new(name).extension().and_then(|e| e.to_str()) {
            Some("txt") => ContentKind::PlainText,
            Some("md") => ContentKind::Markdown,
            _ => ContentKind::Other,
        }
    }

    pub fn is_markdown(self) -> bool {
        self == ContentKind::Markdown
    }

    /// `Content-Type` for the raw passthrough kinds.
    pub fn passthrough_content_type(self) -> &'static str {
        "text/plain"
    }
}
