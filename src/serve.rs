use std::io;
use std::net::TcpListener;
use std::path::PathBuf;
use std::sync::Arc;

use axum::{
    extract::{Path, Request, State},
    http::{header, HeaderMap, HeaderValue, StatusCode},
    middleware::{self, Next},
    response::{Html, IntoResponse, Response},
    routing::{get, post},
    Form, Router,
};
use serde::Deserialize;
use tokio::signal;
use tower_http::{
    compression::CompressionLayer, set_header::SetResponseHeaderLayer, trace::TraceLayer,
};

use crate::auth::Credentials;
use crate::error::CmsError;
use crate::html;
use crate::render::ContentKind;
use crate::session::{self, Session, SessionStore};
use crate::store::{self, Document, DocumentStore, StoreError};
use crate::views::{self, PageContext};
use crate::web_assets;

/// Maximum number of consecutive ports to try before giving up.
const MAX_PORT_ATTEMPTS: u16 = 100;

/// Server configuration resolved from the command line.
#[derive(Debug, Clone)]
pub struct ServeConfig {
    pub bind: String,
    pub port: u16,
    /// Directory whose immediate files are the documents.
    pub data_dir: PathBuf,
    /// YAML file mapping usernames to password digests.
    pub credentials: PathBuf,
}

/// Shared application state passed to all request handlers via `Arc<AppState>`.
pub struct AppState {
    pub store: DocumentStore,
    pub credentials: Credentials,
    pub sessions: SessionStore,
}

impl AppState {
    pub fn new(config: &ServeConfig) -> Self {
        Self {
            store: DocumentStore::new(&config.data_dir),
            credentials: Credentials::new(&config.credentials),
            sessions: SessionStore::new(),
        }
    }
}

/// Bind `bind_addr`, walking upward from `start_port` while ports are taken.
///
/// Gives up after [`MAX_PORT_ATTEMPTS`] occupied ports, or on the first error
/// other than `AddrInUse`.
pub fn bind_with_retry(bind_addr: &str, start_port: u16) -> io::Result<(TcpListener, u16)> {
    for offset in 0..MAX_PORT_ATTEMPTS {
        let Some(port) = start_port.checked_add(offset) else {
            break;
        };
        match TcpListener::bind((bind_addr, port)) {
            Ok(listener) => {
                tracing::debug!(port, "bound");
                return Ok((listener, port));
            }
            Err(e) if e.kind() == io::ErrorKind::AddrInUse => {
                tracing::debug!(port, "port taken");
            }
            Err(e) => {
                return Err(io::Error::new(
                    e.kind(),
                    format!("cannot bind {bind_addr}:{port}: {e}"),
                ));
            }
        }
    }
    Err(io::Error::new(
        io::ErrorKind::AddrInUse,
        format!("no free port among {MAX_PORT_ATTEMPTS} tried from {start_port}"),
    ))
}

// ---------------------------------------------------------------------------
// Response helpers
// ---------------------------------------------------------------------------

/// `302 Found` pointing at `location`.
fn redirect(location: &'static str) -> Response {
    (StatusCode::FOUND, [(header::LOCATION, location)]).into_response()
}

async fn not_found() -> Response {
    (
        StatusCode::NOT_FOUND,
        [(header::CONTENT_TYPE, "text/plain; charset=utf-8")],
        "Not Found",
    )
        .into_response()
}

/// Flash "`name` does not exist" and send the client back to the index.
fn missing_document(session: &Session, name: &str) -> Response {
    tracing::info!(%name, "document not found");
    session.set_error(format!("{name} does not exist"));
    redirect("/")
}

fn last_modified(doc: &Document) -> HeaderMap {
    let mut headers = HeaderMap::new();
    if let Some(modified) = doc.modified {
        if let Ok(value) = HeaderValue::from_str(&httpdate::fmt_http_date(modified)) {
            headers.insert(header::LAST_MODIFIED, value);
        }
    }
    headers
}

// ---------------------------------------------------------------------------
// Auth gate
// ---------------------------------------------------------------------------

/// Route middleware: let signed-in users through, bounce everyone else to the
/// index with an error flash. The wrapped handler never runs for guests.
async fn redirect_guests(session: Session, req: Request, next: Next) -> Response {
    if session.user().is_some() {
        return next.run(req).await;
    }
    tracing::info!(path = %req.uri().path(), "guest blocked from protected route");
    session.set_error("You must be signed in to do that");
    redirect("/")
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

async fn index(
    State(state): State<Arc<AppState>>,
    session: Session,
) -> Result<Html<String>, CmsError> {
    let documents = state.store.list().await?;
    let ctx = PageContext::from_session(&session);
    Ok(Html(views::index_page(&ctx, &documents)))
}

async fn stylesheet() -> Response {
    (
        [(header::CONTENT_TYPE, "text/css; charset=utf-8")],
        web_assets::CSS,
    )
        .into_response()
}

async fn signin_form(session: Session) -> Html<String> {
    Html(views::signin_page(&PageContext::from_session(&session), ""))
}

#[derive(Debug, Deserialize)]
struct SigninForm {
    #[serde(default)]
    username: String,
    #[serde(default)]
    password: String,
}

async fn signin(
    State(state): State<Arc<AppState>>,
    session: Session,
    Form(form): Form<SigninForm>,
) -> Result<Response, CmsError> {
    if state
        .credentials
        .verify(&form.username, &form.password)
        .await?
    {
        tracing::info!(user = %form.username, "signed in");
        session.set_success(format!("Welcome {}", form.username));
        session.sign_in(form.username);
        return Ok(redirect("/"));
    }

    tracing::info!(user = %form.username, "rejected sign-in");
    session.set_error("Invalid Credentials.");
    let page = views::signin_page(&PageContext::from_session(&session), &form.username);
    Ok((StatusCode::UNPROCESSABLE_ENTITY, Html(page)).into_response())
}

async fn signout(session: Session) -> Response {
    if let Some(user) = session.user() {
        tracing::info!(%user, "signed out");
    }
    session.sign_out();
    session.set_success("You have been signed out.");
    redirect("/")
}

async fn new_form(session: Session) -> Html<String> {
    Html(views::new_document_page(&PageContext::from_session(&session), ""))
}

#[derive(Debug, Deserialize)]
struct NewDocumentForm {
    #[serde(default)]
    new_data: String,
}

async fn create_document(
    State(state): State<Arc<AppState>>,
    session: Session,
    Form(form): Form<NewDocumentForm>,
) -> Result<Response, CmsError> {
    let requested = form.new_data.trim();
    if requested.is_empty() {
        session.set_error("A name is required");
        let page = views::new_document_page(&PageContext::from_session(&session), "");
        return Ok(Html(page).into_response());
    }

    let name = store::with_default_extension(requested);
    let rejection = match state.store.create(&name).await {
        Ok(()) => {
            tracing::info!(%name, "document created");
            session.set_success(format!("{name} was created!"));
            return Ok(redirect("/"));
        }
        Err(StoreError::InvalidName(_)) => format!("{name} is not a valid document name"),
        Err(StoreError::AlreadyExists(_)) => format!("{name} already exists"),
        Err(e) => return Err(e.into()),
    };

    tracing::info!(%name, reason = %rejection, "document not created");
    session.set_error(rejection);
    let page = views::new_document_page(&PageContext::from_session(&session), requested);
    Ok((StatusCode::UNPROCESSABLE_ENTITY, Html(page)).into_response())
}

/// `GET /{name}`: plain text passthrough or rendered markdown, by extension.
async fn show_document(
    State(state): State<Arc<AppState>>,
    session: Session,
    Path(name): Path<String>,
) -> Result<Response, CmsError> {
    let Some(doc) = state.store.load(&name).await? else {
        return Ok(missing_document(&session, &name));
    };

    let kind = ContentKind::from_name(&doc.name);
    tracing::debug!(%name, ?kind, size = doc.content.len(), "serving document");
    let headers = last_modified(&doc);

    if kind.is_markdown() {
        let source = String::from_utf8_lossy(&doc.content);
        let body_html = html::render_markdown(&source);
        let page = views::document_page(&PageContext::from_session(&session), &doc.name, &body_html);
        return Ok((headers, Html(page)).into_response());
    }

    Ok((
        headers,
        [(header::CONTENT_TYPE, kind.passthrough_content_type())],
        doc.content,
    )
        .into_response())
}

async fn edit_form(
    State(state): State<Arc<AppState>>,
    session: Session,
    Path(name): Path<String>,
) -> Result<Response, CmsError> {
    let Some(doc) = state.store.load(&name).await? else {
        return Ok(missing_document(&session, &name));
    };
    let content = String::from_utf8_lossy(&doc.content);
    let page = views::edit_page(&PageContext::from_session(&session), &doc.name, &content);
    Ok(Html(page).into_response())
}

#[derive(Debug, Deserialize)]
struct EditForm {
    edit_file: Option<String>,
    cancel: Option<String>,
}

async fn update_document(
    State(state): State<Arc<AppState>>,
    session: Session,
    Path(name): Path<String>,
    Form(form): Form<EditForm>,
) -> Result<Response, CmsError> {
    if !state.store.exists(&name).await? {
        return Ok(missing_document(&session, &name));
    }

    if let Some(content) = form.edit_file {
        state.store.write(&name, content.into_bytes()).await?;
        tracing::info!(%name, "document written");
    }
    if form.cancel.is_none() {
        session.set_success(format!("{name} has been edited."));
    }
    Ok(redirect("/"))
}

#[derive(Debug, Deserialize)]
struct DeleteForm {
    #[serde(default)]
    delete_data: String,
}

async fn delete_document(
    State(state): State<Arc<AppState>>,
    session: Session,
    Form(form): Form<DeleteForm>,
) -> Result<Response, CmsError> {
    let name = form.delete_data;
    if !state.store.delete(&name).await? {
        return Ok(missing_document(&session, &name));
    }
    tracing::info!(%name, "document deleted");
    session.set_success(format!("{name} has been deleted."));
    Ok(redirect("/"))
}

// ---------------------------------------------------------------------------
// Router
// ---------------------------------------------------------------------------

/// Assemble the full application: routes, auth gate, session handling and the
/// shared response layers.
pub fn router(state: Arc<AppState>) -> Router {
    let protected = Router::new()
        .route("/new", get(new_form).post(create_document))
        .route("/{name}/edit", get(edit_form).post(update_document))
        .route("/delete", post(delete_document))
        .route_layer(middleware::from_fn(redirect_guests));

    Router::new()
        .route("/", get(index))
        .route("/assets/cms.css", get(stylesheet))
        .route("/users/signin", get(signin_form).post(signin))
        .route("/users/signout", post(signout))
        .route("/{name}", get(show_document))
        .merge(protected)
        .fallback(not_found)
        .method_not_allowed_fallback(not_found)
        .layer(middleware::from_fn_with_state(
            state.sessions.clone(),
            session::session_layer,
        ))
        .layer(TraceLayer::new_for_http())
        .layer(CompressionLayer::new())
        .layer(SetResponseHeaderLayer::if_not_present(
            header::X_CONTENT_TYPE_OPTIONS,
            HeaderValue::from_static("nosniff"),
        ))
        .with_state(state)
}

// ---------------------------------------------------------------------------
// Server entry point
// ---------------------------------------------------------------------------

/// Start the HTTP server.
///
/// Creates the data directory if needed, binds to `config.bind` starting at
/// `config.port` (moving to the next port while one is taken), and shuts down
/// cleanly when SIGINT (Ctrl+C) is received.
pub async fn run_serve(config: ServeConfig) -> io::Result<()> {
    let state = Arc::new(AppState::new(&config));
    state
        .store
        .ensure_root()
        .await
        .map_err(|e| io::Error::new(io::ErrorKind::Other, e))?;

    if tokio::fs::metadata(state.credentials.path()).await.is_err() {
        tracing::warn!(
            path = %state.credentials.path().display(),
            "credentials file not found; sign-in will fail until it exists"
        );
    }

    let (std_listener, bound_port) = bind_with_retry(&config.bind, config.port)
        .inspect_err(|e| tracing::error!(error = %e, "bind failed"))?;

    std_listener.set_nonblocking(true)?;
    let listener = tokio::net::TcpListener::from_std(std_listener)?;

    tracing::info!(
        data_dir = %state.store.root().display(),
        "listening on http://{}:{}",
        config.bind,
        bound_port
    );

    axum::serve(listener, router(state))
        .with_graceful_shutdown(async {
            if let Err(e) = signal::ctrl_c().await {
                tracing::error!(error = %e, "failed to install SIGINT handler");
                std::future::pending::<()>().await;
            }
            tracing::info!("shutdown complete");
        })
        .await
        .map_err(|e| io::Error::new(io::ErrorKind::Other, e))?;

    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
