//! HTML building blocks.
//!
//! Converts markdown text to HTML using comrak with GFM extensions and wraps
//! page bodies in the shared layout shell (title, stylesheet, flash messages).

use comrak::{markdown_to_html, Options};

// ---------------------------------------------------------------------------
// Markdown
// ---------------------------------------------------------------------------

/// comrak settings for every rendered document: GFM extensions on, raw HTML
/// suppressed (comrak leaves `<!-- raw HTML omitted -->` in its place).
fn markdown_options() -> Options<'static> {
    let mut opts = Options::default();
    let ext = &mut opts.extension;
    ext.table = true;
    ext.tasklist = true;
    ext.strikethrough = true;
    ext.autolink = true;
    opts.render.unsafe_ = false;
    opts
}

/// Render a markdown document to an HTML fragment.
pub fn render_markdown(input: &str) -> String {
    markdown_to_html(input, &markdown_options())
}

// ---------------------------------------------------------------------------
// Escaping
// ---------------------------------------------------------------------------

/// Escape text for use in element content or a quoted attribute.
pub fn html_escape(s: &str) -> String {
    s.chars().fold(String::with_capacity(s.len()), |mut out, c| {
        match entity(c) {
            Some(e) => out.push_str(e),
            None => out.push(c),
        }
        out
    })
}

fn entity(c: char) -> Option<&'static str> {
    Some(match c {
        '<' => "&lt;",
        '>' => "&gt;",
        '&' => "&amp;",
        '"' => "&quot;",
        '\'' => "&#39;",
        _ => return None,
    })
}

/// Percent-encode a document name for use as a single URL path segment.
///
/// Unreserved characters (RFC 3986 §2.3) pass through; every other byte is
/// written as `%XX`.
pub fn encode_segment(segment: &str) -> String {
    let mut out = String::with_capacity(segment.len());
    for b in segment.bytes() {
        match b {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'.' | b'_' | b'~' => {
                out.push(b as char)
            }
            _ => out.push_str(&format!("%{b:02X}")),
        }
    }
    out
}

// ---------------------------------------------------------------------------
// Page shell
// ---------------------------------------------------------------------------

/// Everything the shared layout needs besides the page body.
#[derive(Debug, Default)]
pub struct Shell<'a> {
    pub title: &'a str,
    pub success: Option<&'a str>,
    pub error: Option<&'a str>,
}

/// Wrap `body_html` in the full HTML document.
///
/// `body_html` must already be safe HTML; the title and flash messages are
/// escaped here.
pub fn build_page_shell(body_html: &str, shell: &Shell) -> String {
    let title = html_escape(shell.title);
    let mut flashes = String::new();
    if let Some(msg) = shell.error {
        flashes.push_str(&format!(
            "<div class=\"flash error\"><p>{}</p></div>\n",
            html_escape(msg)
        ));
    }
    if let Some(msg) = shell.success {
        flashes.push_str(&format!(
            "<div class=\"flash success\"><p>{}</p></div>\n",
            html_escape(msg)
        ));
    }

    format!(
        "<!DOCTYPE html>\n\
<html lang=\"en\">\n\
<head>\n\
<meta charset=\"utf-8\">\n\
<meta name=\"viewport\" content=\"width=device-width, initial-scale=1\">\n\
<title>{title} · CMS</title>\n\
<link rel=\"stylesheet\" href=\"/assets/cms.css\">\n\
</head>\n\
<body>\n\
{flashes}\
<main class=\"content\">\n\
{body_html}\
</main>\n\
</body>\n\
</html>\n"
    )
}
