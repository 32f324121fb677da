//! Page bodies for each screen of the app.
//!
//! Every page takes a [`PageContext`] so the layout can show the signed-in
//! user and consume pending flash messages.

use crate::html::{build_page_shell, encode_segment, html_escape, Shell};
use crate::session::Session;

/// Per-render model shared by all pages.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct PageContext {
    pub user: Option<String>,
    pub success: Option<String>,
    pub error: Option<String>,
}

impl PageContext {
    /// Snapshot the current user and take (clear) any flash messages.
    pub fn from_session(session: &Session) -> Self {
        Self {
            user: session.user(),
            success: session.take_success(),
            error: session.take_error(),
        }
    }

    fn shell<'a>(&'a self, title: &'a str) -> Shell<'a> {
        Shell {
            title,
            success: self.success.as_deref(),
            error: self.error.as_deref(),
        }
    }
}

pub fn index_page(ctx: &PageContext, documents: &[String]) -> String {
    let mut body = String::from("<ul class=\"documents\">\n");
    for name in documents {
        let href = encode_segment(name);
        let label = html_escape(name);
        body.push_str(&format!(
            "<li>\n\
<a href=\"/{href}\">{label}</a>\n\
<a class=\"edit\" href=\"/{href}/edit\">Edit</a>\n\
<form class=\"inline delete\" action=\"/delete\" method=\"post\">\n\
<input type=\"hidden\" name=\"delete_data\" value=\"{label}\">\n\
<button type=\"submit\">Delete</button>\n\
</form>\n\
</li>\n"
        ));
    }
    body.push_str("</ul>\n<p><a href=\"/new\">New Document</a></p>\n");

    match &ctx.user {
        Some(user) => body.push_str(&format!(
            "<form class=\"signout\" action=\"/users/signout\" method=\"post\">\n\
<p>Signed in as {}.</p>\n\
<button type=\"submit\">Sign Out</button>\n\
</form>\n",
            html_escape(user)
        )),
        None => body.push_str("<p class=\"signin\"><a href=\"/users/signin\">Sign In</a></p>\n"),
    }

    build_page_shell(&body, &ctx.shell("Documents"))
}

/// Sign-in form; `username` pre-fills the field after a failed attempt.
pub fn signin_page(ctx: &PageContext, username: &str) -> String {
    let body = format!(
        "<form class=\"signin\" action=\"/users/signin\" method=\"post\">\n\
<div>\n\
<label for=\"username\">Username:</label>\n\
<input id=\"username\" name=\"username\" value=\"{}\">\n\
</div>\n\
<div>\n\
<label for=\"password\">Password:</label>\n\
<input id=\"password\" name=\"password\" type=\"password\">\n\
</div>\n\
<button type=\"submit\">Sign In</button>\n\
</form>\n",
        html_escape(username)
    );
    build_page_shell(&body, &ctx.shell("Sign In"))
}

pub fn new_document_page(ctx: &PageContext, requested: &str) -> String {
    let body = format!(
        "<form class=\"new\" action=\"/new\" method=\"post\">\n\
<label for=\"new_data\">Add a new document:</label>\n\
<input id=\"new_data\" name=\"new_data\" value=\"{}\">\n\
<button type=\"submit\">Create</button>\n\
</form>\n",
        html_escape(requested)
    );
    build_page_shell(&body, &ctx.shell("New Document"))
}

pub fn edit_page(ctx: &PageContext, name: &str, content: &str) -> String {
    let body = format!(
        "<form class=\"edit\" action=\"/{href}/edit\" method=\"post\">\n\
<label for=\"edit_file\">Edit content of {label}:</label>\n\
<textarea id=\"edit_file\" name=\"edit_file\" rows=\"20\" cols=\"80\">\n{content}</textarea>\n\
<button type=\"submit\">Save Changes</button>\n\
<button type=\"submit\" name=\"cancel\" value=\"1\">Cancel</button>\n\
</form>\n",
        href = encode_segment(name),
        label = html_escape(name),
        content = html_escape(content),
    );
    build_page_shell(&body, &ctx.shell(name))
}

/// Rendered markdown document; `body_html` comes from the markdown renderer.
pub fn document_page(ctx: &PageContext, name: &str, body_html: &str) -> String {
    let body = format!(
        "<article class=\"document\">\n{body_html}</article>\n\
<p><a href=\"/\">Back to documents</a></p>\n"
    );
    build_page_shell(&body, &ctx.shell(name))
}
