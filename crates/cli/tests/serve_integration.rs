//! Integration tests for the `timebank serve` HTTP API.
//!
//! Each test starts the server as a child process on a unique port,
//! makes HTTP requests, and verifies the responses.

use std::io::Read;
use std::net::TcpStream;
use std::path::{Path, PathBuf};
use std::process::{Child, Command};
use std::sync::atomic::{AtomicU16, Ordering};
use std::time::Duration;

/// Atomic port counter to avoid port conflicts between parallel tests.
/// Base port is derived from process ID so parallel test binaries don't
/// collide on the same port range.
static NEXT_PORT: AtomicU16 = AtomicU16::new(0);
static PORT_INIT: std::sync::Once = std::sync::Once::new();

fn next_port() -> u16 {
    PORT_INIT.call_once(|| {
        let base = 20000 + (std::process::id() as u16 % 20000);
        NEXT_PORT.store(base, Ordering::SeqCst);
    });
    NEXT_PORT.fetch_add(1, Ordering::SeqCst)
}

fn fixture(name: &str) -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR"))
        .join("tests")
        .join("fixtures")
        .join(name)
}

/// A running server, killed when dropped.
struct Server {
    child: Child,
    port: u16,
}

impl Drop for Server {
    fn drop(&mut self) {
        self.child.kill().ok();
        self.child.wait().ok();
    }
}

/// Helper: start `timebank serve` with the given config and environment.
fn start_server(config: &Path, env: &[(&str, &str)]) -> Server {
    let port = next_port();
    let mut cmd = Command::new(env!("CARGO_BIN_EXE_timebank"));
    cmd.arg("serve")
        .arg("--config")
        .arg(config)
        .arg("--port")
        .arg(port.to_string());
    cmd.env_remove("TIMEBANK_API_KEY");
    cmd.env_remove("TIMEBANK_RATE_LIMIT");
    cmd.env("TIMEBANK_RATE_LIMIT", "1000");
    for (key, value) in env {
        cmd.env(key, value);
    }
    // Redirect stdout/stderr to avoid blocking
    cmd.stdout(std::process::Stdio::piped());
    cmd.stderr(std::process::Stdio::piped());

    let child = cmd.spawn().expect("failed to start timebank serve");
    // Wait for server to be ready by polling the port
    for _ in 0..50 {
        if TcpStream::connect(format!("127.0.0.1:{}", port)).is_ok() {
            break;
        }
        std::thread::sleep(Duration::from_millis(100));
    }
    Server { child, port }
}

fn default_server() -> Server {
    start_server(&fixture("timebank.toml"), &[])
}

/// Helper: make an HTTP request and return (status, response_headers, body).
fn http(
    port: u16,
    method: &str,
    path: &str,
    headers: &[(&str, &str)],
    body: Option<&str>,
) -> (u16, String, String) {
    let mut stream = TcpStream::connect(format!("127.0.0.1:{}", port)).expect("failed to connect");
    stream
        .set_read_timeout(Some(Duration::from_secs(10)))
        .unwrap();

    let mut header_lines = String::new();
    for (name, value) in headers {
        header_lines.push_str(&format!("{}: {}\r\n", name, value));
    }
    let body = body.unwrap_or("");
    if !body.is_empty() {
        header_lines.push_str("Content-Type: application/json\r\n");
    }

    let request = format!(
        "{} {} HTTP/1.1\r\nHost: localhost:{}\r\n{}Content-Length: {}\r\nConnection: close\r\n\r\n{}",
        method,
        path,
        port,
        header_lines,
        body.len(),
        body
    );
    std::io::Write::write_all(&mut stream, request.as_bytes()).expect("failed to write");

    let mut response = String::new();
    let _ = stream.read_to_string(&mut response);

    parse_http_response_full(&response)
}

/// Helper: request as a member and parse the JSON body.
fn call(
    server: &Server,
    method: &str,
    path: &str,
    user: &str,
    body: Option<&str>,
) -> (u16, serde_json::Value) {
    let (status, _, body) = http(server.port, method, path, &[("X-User-Id", user)], body);
    let json = serde_json::from_str(&body).unwrap_or(serde_json::Value::Null);
    (status, json)
}

/// Parse an HTTP response into (status_code, headers_string, body).
fn parse_http_response_full(response: &str) -> (u16, String, String) {
    let parts: Vec<&str> = response.splitn(2, "\r\n\r\n").collect();
    let headers = parts.first().unwrap_or(&"").to_string();
    let body = parts.get(1).unwrap_or(&"").to_string();

    let status_line = headers.lines().next().unwrap_or("");
    let status = status_line
        .split_whitespace()
        .nth(1)
        .and_then(|s| s.parse::<u16>().ok())
        .unwrap_or(0);

    // Handle chunked transfer encoding
    let body = if headers.to_lowercase().contains("transfer-encoding: chunked") {
        decode_chunked(&body)
    } else {
        body
    };

    (status, headers, body)
}

/// Decode chunked transfer encoding.
fn decode_chunked(data: &str) -> String {
    let mut result = String::new();
    let mut remaining = data;

    while let Some(line_end) = remaining.find("\r\n") {
        let size = match usize::from_str_radix(remaining[..line_end].trim(), 16) {
            Ok(s) => s,
            Err(_) => break,
        };
        if size == 0 {
            break;
        }
        let chunk_start = line_end + 2;
        let chunk_end = chunk_start + size;
        if chunk_end > remaining.len() {
            result.push_str(&remaining[chunk_start..]);
            break;
        }
        result.push_str(&remaining[chunk_start..chunk_end]);
        remaining = if chunk_end + 2 <= remaining.len() {
            &remaining[chunk_end + 2..]
        } else {
            ""
        };
    }

    result
}

/// Alice expresses interest in Bob's bike repair and Bob accepts.
fn accepted_handshake(server: &Server) -> String {
    let (status, handshake) = call(
        server,
        "POST",
        "/handshakes",
        "alice",
        Some(r#"{"service_id":"svc-bike"}"#),
    );
    assert_eq!(status, 201, "{handshake}");
    let id = handshake["id"].as_str().expect("handshake id").to_string();
    let (status, accepted) = call(server, "POST", &format!("/handshakes/{id}/accept"), "bob", None);
    assert_eq!(status, 200, "{accepted}");
    assert_eq!(accepted["status"], "accepted");
    id
}

// ──────────────────────────────────────────────
// Health and identity
// ──────────────────────────────────────────────

#[test]
fn health_returns_200_with_version() {
    let server = default_server();
    let (status, _, body) = http(server.port, "GET", "/health", &[], None);
    assert_eq!(status, 200);
    let json: serde_json::Value = serde_json::from_str(&body).expect("valid JSON");
    assert_eq!(json["status"], "ok");
    assert!(json.get("version").is_some());
}

#[test]
fn missing_or_unknown_identity_is_401() {
    let server = default_server();
    let (status, _, body) = http(server.port, "GET", "/me", &[], None);
    assert_eq!(status, 401);
    let json: serde_json::Value = serde_json::from_str(&body).expect("valid JSON");
    assert_eq!(json["code"], "UNAUTHENTICATED");

    let (status, json) = call(&server, "GET", "/me", "mallory", None);
    assert_eq!(status, 401);
    assert_eq!(json["code"], "UNAUTHENTICATED");
}

#[test]
fn me_returns_the_seeded_account() {
    let server = default_server();
    let (status, json) = call(&server, "GET", "/me", "alice", None);
    assert_eq!(status, 200);
    assert_eq!(json["user_id"], "alice");
    assert_eq!(json["balance"], "3");
    assert_eq!(json["karma"], 0);
}

#[test]
fn not_found_returns_404() {
    let server = default_server();
    let (status, json) = call(&server, "GET", "/nonexistent", "alice", None);
    assert_eq!(status, 404);
    assert_eq!(json["code"], "NOT_FOUND");
}

// ──────────────────────────────────────────────
// Handshake lifecycle
// ──────────────────────────────────────────────

#[test]
fn completed_handshake_settles_balances() {
    let server = default_server();
    let id = accepted_handshake(&server);

    let confirm = format!("/handshakes/{id}/confirm");
    let (status, json) = call(&server, "POST", &confirm, "alice", None);
    assert_eq!(status, 200);
    assert_eq!(json["status"], "receiver_confirmed");
    let (status, json) = call(&server, "POST", &confirm, "bob", Some(r#"{"hours":"2"}"#));
    assert_eq!(status, 200);
    assert_eq!(json["status"], "completed");

    // Confirming again is a no-op.
    let (status, json) = call(&server, "POST", &confirm, "alice", None);
    assert_eq!(status, 200);
    assert_eq!(json["status"], "completed");

    let (_, alice) = call(&server, "GET", "/me", "alice", None);
    assert_eq!(alice["balance"], "1");
    assert_eq!(alice["reserved"], "0");
    let (_, bob) = call(&server, "GET", "/me", "bob", None);
    assert_eq!(bob["balance"], "2");

    let (status, json) = call(
        &server,
        "GET",
        &format!("/handshakes/{id}/transitions"),
        "alice",
        None,
    );
    assert_eq!(status, 200);
    assert_eq!(json["transitions"].as_array().map(Vec::len), Some(4));
}

#[test]
fn error_codes_map_to_http_statuses() {
    let server = default_server();
    let id = accepted_handshake(&server);

    let (status, json) = call(
        &server,
        "POST",
        "/handshakes",
        "alice",
        Some(r#"{"service_id":"svc-bike"}"#),
    );
    assert_eq!(status, 400);
    assert_eq!(json["code"], "ALREADY_EXISTS");
    assert!(json["error"].is_string());

    let (status, json) = call(&server, "GET", &format!("/handshakes/{id}"), "carol", None);
    assert_eq!(status, 403);
    assert_eq!(json["code"], "FORBIDDEN");

    let (status, json) = call(&server, "GET", "/handshakes/missing", "alice", None);
    assert_eq!(status, 404);
    assert_eq!(json["code"], "NOT_FOUND");

    let (status, json) = call(
        &server,
        "POST",
        "/handshakes",
        "carol",
        Some(r#"{"service_id":"svc-bike"}"#),
    );
    assert_eq!(status, 400);
    assert_eq!(json["code"], "INSUFFICIENT_BALANCE");

    let (status, json) = call(&server, "POST", "/handshakes", "alice", Some("{nope"));
    assert_eq!(status, 400);
    assert_eq!(json["code"], "INVALID_INPUT");

    let (status, json) = call(
        &server,
        "POST",
        &format!("/handshakes/{id}/cancel"),
        "alice",
        None,
    );
    assert_eq!(status, 400);
    assert_eq!(json["code"], "INVALID_STATE");
}

#[test]
fn list_handshakes_is_scoped_to_the_caller() {
    let server = default_server();
    accepted_handshake(&server);

    let (status, json) = call(&server, "GET", "/handshakes", "alice", None);
    assert_eq!(status, 200);
    assert_eq!(json["handshakes"].as_array().map(Vec::len), Some(1));

    let (_, json) = call(&server, "GET", "/handshakes", "carol", None);
    assert_eq!(json["handshakes"].as_array().map(Vec::len), Some(0));

    let (_, json) = call(&server, "GET", "/handshakes?status=pending", "admin", None);
    assert_eq!(json["handshakes"].as_array().map(Vec::len), Some(0));

    let (status, json) = call(&server, "GET", "/handshakes?status=bogus", "alice", None);
    assert_eq!(status, 400);
    assert_eq!(json["code"], "INVALID_INPUT");
}

#[test]
fn feedback_after_completion() {
    let server = default_server();
    let id = accepted_handshake(&server);
    let feedback = format!("/handshakes/{id}/feedback");

    let (status, json) = call(&server, "POST", &feedback, "alice", Some(r#"{"helpful":true}"#));
    assert_eq!(status, 400);
    assert_eq!(json["code"], "INVALID_STATE");

    let confirm = format!("/handshakes/{id}/confirm");
    call(&server, "POST", &confirm, "alice", None);
    call(&server, "POST", &confirm, "bob", None);

    let (status, json) = call(
        &server,
        "POST",
        &feedback,
        "alice",
        Some(r#"{"punctual":true,"helpful":true,"comment":"great"}"#),
    );
    assert_eq!(status, 201, "{json}");
    assert_eq!(json["rated_id"], "bob");

    let (_, bob) = call(&server, "GET", "/me", "bob", None);
    assert_eq!(bob["karma"], 2);
    assert_eq!(bob["punctual_count"], 1);

    let (status, json) = call(&server, "GET", &feedback, "bob", None);
    assert_eq!(status, 200);
    assert_eq!(json["feedback"].as_array().map(Vec::len), Some(1));
}

// ──────────────────────────────────────────────
// Disputes and admin
// ──────────────────────────────────────────────

#[test]
fn receiver_no_show_resolution_pays_provider() {
    let server = default_server();
    let id = accepted_handshake(&server);

    let (status, report) = call(
        &server,
        "POST",
        &format!("/handshakes/{id}/report-no-show"),
        "bob",
        Some(r#"{"reason":"nobody home"}"#),
    );
    assert_eq!(status, 201, "{report}");
    let report_id = report["id"].as_str().expect("report id").to_string();

    let (status, json) = call(&server, "GET", "/admin/reports?status=pending", "admin", None);
    assert_eq!(status, 200);
    assert_eq!(json["reports"].as_array().map(Vec::len), Some(1));

    let resolve = format!("/admin/reports/{report_id}/resolve");
    let body = r#"{"action":"confirm_no_show","notes":"checked"}"#;
    let (status, json) = call(&server, "POST", &resolve, "bob", Some(body));
    assert_eq!(status, 403);
    assert_eq!(json["code"], "FORBIDDEN");

    let (status, json) = call(&server, "POST", &resolve, "admin", Some(body));
    assert_eq!(status, 200, "{json}");
    assert_eq!(json["status"], "resolved");

    let (status, json) = call(&server, "POST", &resolve, "admin", Some(body));
    assert_eq!(status, 400);
    assert_eq!(json["code"], "INVALID_STATE");

    let (_, handshake) = call(&server, "GET", &format!("/handshakes/{id}"), "bob", None);
    assert_eq!(handshake["status"], "completed");
    let (_, alice) = call(&server, "GET", "/me", "alice", None);
    assert_eq!(alice["karma"], -5);
    let (_, bob) = call(&server, "GET", "/me", "bob", None);
    assert_eq!(bob["balance"], "2");
}

#[test]
fn admin_moderation_endpoints() {
    let server = default_server();

    let (status, json) = call(
        &server,
        "POST",
        "/admin/users/bob/karma",
        "admin",
        Some(r#"{"delta":3}"#),
    );
    assert_eq!(status, 200);
    assert_eq!(json["user_id"], "bob");
    assert_eq!(json["new_karma"], 3);

    let (status, json) = call(
        &server,
        "POST",
        "/admin/users/bob/balance",
        "admin",
        Some(r#"{"delta":"1.5"}"#),
    );
    assert_eq!(status, 200);
    assert_eq!(json["new_balance"], "1.5");

    let (status, _) = call(
        &server,
        "POST",
        "/admin/users/carol/warn",
        "admin",
        Some(r#"{"message":"keep it civil"}"#),
    );
    assert_eq!(status, 201);

    let (status, json) = call(&server, "POST", "/admin/users/carol/ban", "admin", None);
    assert_eq!(status, 200);
    assert_eq!(json["is_active"], false);
    let (status, json) = call(&server, "GET", "/handshakes", "carol", None);
    assert_eq!(status, 403);
    assert_eq!(json["code"], "FORBIDDEN");
    let (status, _) = call(&server, "POST", "/admin/users/carol/unban", "admin", None);
    assert_eq!(status, 200);
    let (status, _) = call(&server, "GET", "/handshakes", "carol", None);
    assert_eq!(status, 200);

    let (status, json) = call(
        &server,
        "POST",
        "/admin/users/bob/karma",
        "alice",
        Some(r#"{"delta":100}"#),
    );
    assert_eq!(status, 403);
    assert_eq!(json["code"], "FORBIDDEN");

    let (status, json) = call(&server, "GET", "/admin/audit?subject=carol", "admin", None);
    assert_eq!(status, 200);
    assert_eq!(json["audit"].as_array().map(Vec::len), Some(3));
}

#[test]
fn admin_opens_accounts() {
    let server = default_server();
    let body = r#"{"user_id":"dave","balance":"4"}"#;
    let (status, json) = call(&server, "POST", "/admin/accounts", "admin", Some(body));
    assert_eq!(status, 201);
    assert_eq!(json["role"], "member");

    let (status, json) = call(&server, "GET", "/me", "dave", None);
    assert_eq!(status, 200);
    assert_eq!(json["balance"], "4");

    let (status, json) = call(&server, "POST", "/admin/accounts", "admin", Some(body));
    assert_eq!(status, 400);
    assert_eq!(json["code"], "ALREADY_EXISTS");
}

// ──────────────────────────────────────────────
// Security and persistence
// ──────────────────────────────────────────────

#[test]
fn api_key_guards_everything_but_health() {
    let server = start_server(&fixture("timebank.toml"), &[("TIMEBANK_API_KEY", "s3cret")]);

    let (status, _, _) = http(server.port, "GET", "/health", &[], None);
    assert_eq!(status, 200);

    let (status, _, _) = http(server.port, "GET", "/me", &[("X-User-Id", "alice")], None);
    assert_eq!(status, 401);

    let (status, _, _) = http(
        server.port,
        "GET",
        "/me",
        &[("X-User-Id", "alice"), ("X-API-Key", "wrong")],
        None,
    );
    assert_eq!(status, 403);

    let (status, _, _) = http(
        server.port,
        "GET",
        "/me",
        &[("X-User-Id", "alice"), ("Authorization", "Bearer s3cret")],
        None,
    );
    assert_eq!(status, 200);
}

#[test]
fn rate_limit_returns_429() {
    let server = start_server(&fixture("timebank.toml"), &[("TIMEBANK_RATE_LIMIT", "2")]);
    for _ in 0..2 {
        let (status, _, _) = http(server.port, "GET", "/health", &[], None);
        assert_eq!(status, 200);
    }
    let (status, _, body) = http(server.port, "GET", "/health", &[], None);
    assert_eq!(status, 429);
    let json: serde_json::Value = serde_json::from_str(&body).expect("valid JSON");
    assert_eq!(json["code"], "RATE_LIMITED");
    assert!(json["retry_after"].is_u64());
}

#[test]
fn state_file_survives_restart() {
    let dir = tempfile::tempdir().unwrap();
    let state = dir.path().join("state.json");
    let fixture_config = std::fs::read_to_string(fixture("timebank.toml")).unwrap();
    let config = fixture_config.replacen(
        "[server]\n",
        &format!("[server]\nstate_file = {:?}\n", state.display().to_string()),
        1,
    );
    let config_path = dir.path().join("timebank.toml");
    std::fs::write(&config_path, config).unwrap();

    let id = {
        let server = start_server(&config_path, &[]);
        accepted_handshake(&server)
    };
    assert!(state.exists());

    let server = start_server(&config_path, &[]);
    let (status, json) = call(&server, "GET", &format!("/handshakes/{id}"), "alice", None);
    assert_eq!(status, 200);
    assert_eq!(json["status"], "accepted");
    let (_, alice) = call(&server, "GET", "/me", "alice", None);
    assert_eq!(alice["reserved"], "2");
}
