use std::fs;
use std::io::Read;
use std::net::TcpListener;
use std::path::PathBuf;
use std::process::{Child, Command, Stdio};
use std::thread;
use std::time::Duration;

use reqwest::blocking::Client;
use reqwest::header::HeaderMap;
use reqwest::redirect::Policy;
use tempfile::TempDir;

const STARTUP_TIMEOUT: Duration = Duration::from_secs(6);
const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

const HISTORY: &str = "1993 - Yukihiro Matsumoto dreams up Ruby.\n\
1995 - Ruby 0.95 released.\n\
1996 - Ruby 1.0 released.\n\
1998 - Ruby 1.2 released.\n\
1999 - Ruby 1.4 released.\n\
2000 - Ruby 1.6 released.\n\
2003 - Ruby 1.8 released.\n\
2007 - Ruby 1.9 released.\n\
2013 - Ruby 2.0 released.\n\
2013 - Ruby 2.1 released.\n\
2014 - Ruby 2.2 released.\n\
2015 - Ruby 2.3 released.";

const ABOUT: &str = "# Contribute\n\n\
Want to show some love? Help out by contributing!\n\n\
## Found a bug?\n\n\
Log it in our [issue tracker](https://example.com/issues) or send a note.\n";

struct Fixture {
    _tmp: TempDir,
    data_dir: PathBuf,
    credentials: PathBuf,
}

impl Fixture {
    fn new() -> Self {
        let tmp = tempfile::tempdir().expect("create tempdir");
        let data_dir = tmp.path().join("data");
        fs::create_dir_all(&data_dir).expect("create data dir");
        fs::write(data_dir.join("about.md"), ABOUT).expect("write about.md");
        fs::write(data_dir.join("history.txt"), HISTORY).expect("write history.txt");

        let digest = hash_password("secret");
        let credentials = tmp.path().join("users.yml");
        fs::write(&credentials, format!("admin: \"{digest}\"\n")).expect("write credentials");

        Self {
            _tmp: tmp,
            data_dir,
            credentials,
        }
    }

    fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = fs::read_dir(&self.data_dir)
            .expect("read data dir")
            .map(|e| e.expect("dir entry").file_name().to_string_lossy().into_owned())
            .collect();
        names.sort();
        names
    }
}

struct ResponseSnapshot {
    status: u16,
    headers: HeaderMap,
    body: Vec<u8>,
}

impl ResponseSnapshot {
    fn body_text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }

    fn header(&self, name: &str) -> Option<String> {
        self.headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .map(|v| v.to_owned())
    }

    fn context(&self) -> String {
        let mut hdrs = String::new();
        for (k, v) in &self.headers {
            let value = v.to_str().unwrap_or("<non-utf8>");
            hdrs.push_str(&format!("{}: {}\n", k.as_str(), value));
        }
        format!(
            "status={}\nheaders:\n{}\nbody:\n{}",
            self.status,
            hdrs,
            self.body_text()
        )
    }
}

struct ServerHandle {
    child: Option<Child>,
    base_url: String,
}

impl ServerHandle {
    fn new(scenario: &str, fixture: &Fixture) -> Self {
        let port = free_port();
        eprintln!("[TEST] scenario={} port={}", scenario, port);

        let mut child = Command::new(bin_path())
            .arg("serve")
            .arg("--bind")
            .arg("127.0.0.1")
            .arg("--port")
            .arg(port.to_string())
            .arg("--data-dir")
            .arg(&fixture.data_dir)
            .arg("--credentials")
            .arg(&fixture.credentials)
            .env("RUST_LOG", "warn")
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .expect("spawn cms serve");

        let base_url = format!("http://127.0.0.1:{port}");
        wait_for_server_ready(&mut child, &base_url);

        Self {
            child: Some(child),
            base_url,
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }
}

impl Drop for ServerHandle {
    fn drop(&mut self) {
        let Some(child) = self.child.as_mut() else {
            return;
        };
        if child.try_wait().ok().flatten().is_none() {
            let _ = child.kill();
        }
        let _ = child.wait();
    }
}

fn bin_path() -> String {
    std::env::var("CARGO_BIN_EXE_cms").expect("CARGO_BIN_EXE_cms is set by cargo test")
}

fn hash_password(password: &str) -> String {
    let output = Command::new(bin_path())
        .arg("hash-password")
        .arg(password)
        .output()
        .expect("run cms hash-password");
    assert!(output.status.success(), "hash-password failed: {:?}", output);
    String::from_utf8(output.stdout)
        .expect("digest is utf-8")
        .trim()
        .to_owned()
}

/// Browser-like client: keeps cookies, never follows redirects on its own.
fn client() -> Client {
    Client::builder()
        .timeout(REQUEST_TIMEOUT)
        .cookie_store(true)
        .redirect(Policy::none())
        .build()
        .expect("build reqwest client")
}

fn snapshot(resp: reqwest::blocking::Response) -> ResponseSnapshot {
    let status = resp.status().as_u16();
    let headers = resp.headers().clone();
    let body = resp.bytes().expect("read body").to_vec();
    ResponseSnapshot {
        status,
        headers,
        body,
    }
}

fn get(client: &Client, url: &str) -> ResponseSnapshot {
    let resp = client
        .get(url)
        .send()
        .unwrap_or_else(|e| panic!("GET {} failed: {e}", url));
    snapshot(resp)
}

fn post(client: &Client, url: &str, form: &[(&str, &str)]) -> ResponseSnapshot {
    let resp = client
        .post(url)
        .form(form)
        .send()
        .unwrap_or_else(|e| panic!("POST {} failed: {e}", url));
    snapshot(resp)
}

fn sign_in(client: &Client, server: &ServerHandle) {
    let resp = post(
        client,
        &server.url("/users/signin"),
        &[("username", "admin"), ("password", "secret")],
    );
    assert_status(&resp, 302);
}

fn free_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").expect("bind free port");
    listener.local_addr().expect("local addr").port()
}

fn wait_for_server_ready(child: &mut Child, base_url: &str) {
    let ready_client = Client::builder()
        .timeout(Duration::from_millis(300))
        .build()
        .expect("build readiness client");

    let start = std::time::Instant::now();
    loop {
        if let Some(status) = child.try_wait().expect("try_wait server") {
            let mut stdout = String::new();
            let mut stderr = String::new();
            if let Some(mut out) = child.stdout.take() {
                let _ = out.read_to_string(&mut stdout);
            }
            if let Some(mut err) = child.stderr.take() {
                let _ = err.read_to_string(&mut stderr);
            }
            panic!(
                "server exited early status={}\nstdout:\n{}\nstderr:\n{}",
                status, stdout, stderr
            );
        }

        if ready_client
            .get(format!("{}/assets/cms.css", base_url))
            .send()
            .is_ok()
        {
            return;
        }

        if start.elapsed() > STARTUP_TIMEOUT {
            panic!("server did not become ready within {:?}", STARTUP_TIMEOUT);
        }

        thread::sleep(Duration::from_millis(50));
    }
}

fn assert_status(resp: &ResponseSnapshot, expected: u16) {
    assert_eq!(
        resp.status,
        expected,
        "unexpected HTTP status\n{}",
        resp.context()
    );
}

fn assert_body_contains(resp: &ResponseSnapshot, needle: &str) {
    assert!(
        resp.body_text().contains(needle),
        "body does not contain '{}'\n{}",
        needle,
        resp.context()
    );
}

fn assert_redirects_home(resp: &ResponseSnapshot) {
    assert_status(resp, 302);
    assert_eq!(
        resp.header("location").as_deref(),
        Some("/"),
        "unexpected redirect target\n{}",
        resp.context()
    );
}

// ---------------------------------------------------------------------------
// Browsing
// ---------------------------------------------------------------------------

#[test]
fn test_index_lists_documents() {
    let fixture = Fixture::new();
    let server = ServerHandle::new("test_index_lists_documents", &fixture);

    let resp = get(&client(), &server.url("/"));
    assert_status(&resp, 200);
    assert_eq!(resp.header("content-type").as_deref(), Some("text/html; charset=utf-8"));
    assert_body_contains(&resp, "<a href=\"/about.md\">about.md</a>");
    assert_body_contains(&resp, "<a href=\"/history.txt\">history.txt</a>");
    assert_body_contains(&resp, "Sign In");
}

#[test]
fn test_txt_document_served_verbatim() {
    let fixture = Fixture::new();
    let server = ServerHandle::new("test_txt_document_served_verbatim", &fixture);

    let resp = get(&client(), &server.url("/history.txt"));
    assert_status(&resp, 200);
    assert_eq!(resp.header("content-type").as_deref(), Some("text/plain"));
    assert_eq!(resp.body, HISTORY.as_bytes(), "{}", resp.context());
}

#[test]
fn test_md_document_rendered() {
    let fixture = Fixture::new();
    let server = ServerHandle::new("test_md_document_rendered", &fixture);

    let resp = get(&client(), &server.url("/about.md"));
    assert_status(&resp, 200);
    assert_eq!(resp.header("content-type").as_deref(), Some("text/html; charset=utf-8"));
    assert_body_contains(&resp, "<h1>Contribute</h1>");
    assert_body_contains(&resp, "<h2>Found a bug?</h2>");
    assert_body_contains(&resp, "<a href=\"https://example.com/issues\">issue tracker</a>");
}

#[test]
fn test_missing_document_flashes_and_redirects() {
    let fixture = Fixture::new();
    let server = ServerHandle::new("test_missing_document_flashes_and_redirects", &fixture);
    let client = client();

    let resp = get(&client, &server.url("/missing-name"));
    assert_redirects_home(&resp);

    let index = get(&client, &server.url("/"));
    assert_body_contains(&index, "missing-name does not exist");

    // Flash is one-shot.
    let again = get(&client, &server.url("/"));
    assert!(!again.body_text().contains("missing-name does not exist"));
}

#[test]
fn test_unmatched_route_is_404() {
    let fixture = Fixture::new();
    let server = ServerHandle::new("test_unmatched_route_is_404", &fixture);
    let client = client();

    assert_status(&post(&client, &server.url("/"), &[]), 404);
    assert_status(&get(&client, &server.url("/a/b/c")), 404);
    assert_status(&get(&client, &server.url("/users/signout")), 404);
}

#[test]
fn test_nosniff_header() {
    let fixture = Fixture::new();
    let server = ServerHandle::new("test_nosniff_header", &fixture);

    for path in ["/", "/history.txt", "/about.md", "/users/signin"] {
        let resp = get(&client(), &server.url(path));
        assert_eq!(
            resp.header("x-content-type-options").as_deref(),
            Some("nosniff"),
            "{}",
            resp.context()
        );
    }
}

// ---------------------------------------------------------------------------
// Sign-in / sign-out
// ---------------------------------------------------------------------------

#[test]
fn test_signin_form() {
    let fixture = Fixture::new();
    let server = ServerHandle::new("test_signin_form", &fixture);

    let resp = get(&client(), &server.url("/users/signin"));
    assert_status(&resp, 200);
    assert_body_contains(&resp, "<form class=\"signin\" action=\"/users/signin\"");
}

#[test]
fn test_signin_success() {
    let fixture = Fixture::new();
    let server = ServerHandle::new("test_signin_success", &fixture);
    let client = client();

    sign_in(&client, &server);

    let index = get(&client, &server.url("/"));
    assert_status(&index, 200);
    assert_body_contains(&index, "Welcome admin");
    assert_body_contains(&index, "<p>Signed in as admin.</p>");
}

#[test]
fn test_signin_wrong_password_and_unknown_user_look_the_same() {
    let fixture = Fixture::new();
    let server = ServerHandle::new("test_signin_failures", &fixture);
    let client = client();

    let wrong_password = post(
        &client,
        &server.url("/users/signin"),
        &[("username", "admin"), ("password", "nope")],
    );
    let unknown_user = post(
        &client,
        &server.url("/users/signin"),
        &[("username", "wrong"), ("password", "secret")],
    );

    for resp in [&wrong_password, &unknown_user] {
        assert_status(resp, 422);
        assert_body_contains(resp, "Invalid Credentials.");
        assert_body_contains(resp, "<form class=\"signin\"");
    }

    // Still a guest.
    let index = get(&client, &server.url("/"));
    assert!(!index.body_text().contains("Signed in as"));
}

#[test]
fn test_signout() {
    let fixture = Fixture::new();
    let server = ServerHandle::new("test_signout", &fixture);
    let client = client();

    sign_in(&client, &server);
    let resp = post(&client, &server.url("/users/signout"), &[]);
    assert_redirects_home(&resp);

    let index = get(&client, &server.url("/"));
    assert_body_contains(&index, "You have been signed out.");
    assert!(!index.body_text().contains("Signed in as"));
}

// ---------------------------------------------------------------------------
// Auth gate
// ---------------------------------------------------------------------------

#[test]
fn test_guest_is_redirected_from_every_mutating_route() {
    let fixture = Fixture::new();
    let server = ServerHandle::new("test_guest_redirects", &fixture);
    let client = client();
    let before = fixture.names();

    let attempts: [(&str, &str, &[(&str, &str)]); 5] = [
        ("GET", "/new", &[]),
        ("POST", "/new", &[("new_data", "abc")]),
        ("GET", "/history.txt/edit", &[]),
        ("POST", "/history.txt/edit", &[("edit_file", "pwned")]),
        ("POST", "/delete", &[("delete_data", "about.md")]),
    ];

    for (method, path, form) in attempts {
        let resp = match method {
            "GET" => get(&client, &server.url(path)),
            _ => post(&client, &server.url(path), form),
        };
        assert_redirects_home(&resp);

        let index = get(&client, &server.url("/"));
        assert_body_contains(&index, "You must be signed in to do that");
    }

    assert_eq!(fixture.names(), before);
    assert_eq!(
        fs::read_to_string(fixture.data_dir.join("history.txt")).unwrap(),
        HISTORY
    );
}

// ---------------------------------------------------------------------------
// Document CRUD
// ---------------------------------------------------------------------------

#[test]
fn test_new_document_form() {
    let fixture = Fixture::new();
    let server = ServerHandle::new("test_new_document_form", &fixture);
    let client = client();

    sign_in(&client, &server);
    let resp = get(&client, &server.url("/new"));
    assert_status(&resp, 200);
    assert_body_contains(&resp, "<input");
}

#[test]
fn test_create_document_appends_txt() {
    let fixture = Fixture::new();
    let server = ServerHandle::new("test_create_document_appends_txt", &fixture);
    let client = client();

    sign_in(&client, &server);
    let resp = post(&client, &server.url("/new"), &[("new_data", "abc")]);
    assert_redirects_home(&resp);
    assert!(fixture.data_dir.join("abc.txt").exists());
    assert_eq!(fs::read(fixture.data_dir.join("abc.txt")).unwrap(), b"");

    let index = get(&client, &server.url("/"));
    assert_body_contains(&index, "abc.txt was created!");
    assert_body_contains(&index, "<a href=\"/abc.txt\">abc.txt</a>");
}

#[test]
fn test_create_document_requires_name() {
    let fixture = Fixture::new();
    let server = ServerHandle::new("test_create_document_requires_name", &fixture);
    let client = client();

    sign_in(&client, &server);
    let before = fixture.names();
    let resp = post(&client, &server.url("/new"), &[("new_data", "")]);
    assert_status(&resp, 200);
    assert_body_contains(&resp, "A name is required");
    assert_eq!(fixture.names(), before);
}

#[test]
fn test_create_document_rejects_traversal() {
    let fixture = Fixture::new();
    let server = ServerHandle::new("test_create_document_rejects_traversal", &fixture);
    let client = client();

    sign_in(&client, &server);
    let resp = post(&client, &server.url("/new"), &[("new_data", "../escape.txt")]);
    assert_status(&resp, 422);
    assert_body_contains(&resp, "is not a valid document name");
    assert!(!fixture.data_dir.parent().unwrap().join("escape.txt").exists());
}

#[test]
fn test_edit_form_prefilled() {
    let fixture = Fixture::new();
    let server = ServerHandle::new("test_edit_form_prefilled", &fixture);
    let client = client();

    sign_in(&client, &server);
    let resp = get(&client, &server.url("/history.txt/edit"));
    assert_status(&resp, 200);
    assert_body_contains(&resp, "<textarea id=\"edit_file\"");
    assert_body_contains(&resp, "1993 - Yukihiro Matsumoto dreams up Ruby.");
}

#[test]
fn test_edit_document() {
    let fixture = Fixture::new();
    let server = ServerHandle::new("test_edit_document", &fixture);
    let client = client();

    sign_in(&client, &server);
    let resp = post(&client, &server.url("/history.txt/edit"), &[("edit_file", "hello")]);
    assert_redirects_home(&resp);

    let index = get(&client, &server.url("/"));
    assert_body_contains(&index, "history.txt has been edited.");

    let doc = get(&client, &server.url("/history.txt"));
    assert_status(&doc, 200);
    assert_eq!(doc.body_text(), "hello");
}

#[test]
fn test_edit_cancel_has_no_flash() {
    let fixture = Fixture::new();
    let server = ServerHandle::new("test_edit_cancel_has_no_flash", &fixture);
    let client = client();

    sign_in(&client, &server);
    // Consume the welcome flash.
    get(&client, &server.url("/"));

    let resp = post(
        &client,
        &server.url("/history.txt/edit"),
        &[("edit_file", HISTORY), ("cancel", "1")],
    );
    assert_redirects_home(&resp);

    let index = get(&client, &server.url("/"));
    assert!(!index.body_text().contains("has been edited."));
    assert_eq!(
        fs::read_to_string(fixture.data_dir.join("history.txt")).unwrap(),
        HISTORY
    );
}

#[test]
fn test_delete_document() {
    let fixture = Fixture::new();
    let server = ServerHandle::new("test_delete_document", &fixture);
    let client = client();

    sign_in(&client, &server);
    let resp = post(&client, &server.url("/delete"), &[("delete_data", "about.md")]);
    assert_redirects_home(&resp);
    assert_eq!(fixture.names(), vec!["history.txt".to_owned()]);

    let index = get(&client, &server.url("/"));
    assert_body_contains(&index, "about.md has been deleted.");
    assert!(!index.body_text().contains("href=\"/about.md\""));
}

#[test]
fn test_delete_missing_document() {
    let fixture = Fixture::new();
    let server = ServerHandle::new("test_delete_missing_document", &fixture);
    let client = client();

    sign_in(&client, &server);
    let resp = post(&client, &server.url("/delete"), &[("delete_data", "nope.md")]);
    assert_redirects_home(&resp);

    let index = get(&client, &server.url("/"));
    assert_body_contains(&index, "nope.md does not exist");
}

#[test]
fn test_path_traversal_in_url_rejected() {
    let fixture = Fixture::new();
    let server = ServerHandle::new("test_path_traversal_in_url_rejected", &fixture);

    let resp = get(&client(), &server.url("/..%2Fusers.yml"));
    assert_status(&resp, 400);
    assert!(!resp.body_text().contains("argon2"));
}

#[test]
fn test_hash_password_output_is_phc() {
    let digest = hash_password("secret");
    assert!(digest.starts_with("$argon2id$"), "unexpected digest {digest}");
}
