//! Embedded static web assets.
//!
//! Compiled into the binary via `include_str!` so the server is fully
//! self-contained; no asset files need to be distributed next to it.

/// Stylesheet shared by every page.
///
/// Loaded from `src/assets/cms.css` at compile time.
pub const CSS: &str = include_str!("assets/cms.css");
