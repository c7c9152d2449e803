//! End-to-end tests driving a live reactor over real sockets.
use nocturne::{MemoryStore, Server, ServerConfig, ServerHandle, TriggerMode, UserStore};
use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};
use std::path::Path;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

fn free_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap().port()
}

fn write_site(root: &Path) {
    std::fs::write(root.join("index.html"), b"<h1>home</h1>").unwrap();
    std::fs::write(root.join("style.css"), b"em { color: blue }").unwrap();
    std::fs::write(root.join("welcome.html"), b"welcome!").unwrap();
    std::fs::write(root.join("error.html"), b"bad credentials").unwrap();
}

fn start_server(
    root: &Path,
    timeout_ms: u64,
    store: Option<Arc<dyn UserStore>>,
) -> (u16, ServerHandle, JoinHandle<()>) {
    let port = free_port();
    let cfg = ServerConfig {
        port,
        trigger_mode: TriggerMode::EdgeAll,
        timeout_ms,
        workers: 2,
        src_dir: root.to_path_buf(),
        log_enabled: false,
        ..Default::default()
    };

    let mut server = Server::new(cfg).unwrap();
    if let Some(store) = store {
        server = server.with_store(store);
    }
    let handle = server.handle();
    let join = thread::spawn(move || {
        server.run().unwrap();
    });
    (port, handle, join)
}

fn connect(port: u16) -> TcpStream {
    let stream = TcpStream::connect(("127.0.0.1", port)).unwrap();
    stream
        .set_read_timeout(Some(Duration::from_secs(5)))
        .unwrap();
    stream
}

/// Read one response: headers through CRLFCRLF, then Content-length bytes.
fn read_response(stream: &mut TcpStream) -> (String, Vec<u8>) {
    let mut raw = Vec::new();
    let mut chunk = [0u8; 4096];
    let head_end = loop {
        let n = stream.read(&mut chunk).unwrap();
        assert!(n > 0, "connection closed before headers completed");
        raw.extend_from_slice(&chunk[..n]);
        if let Some(pos) = raw.windows(4).position(|w| w == b"\r\n\r\n") {
            break pos + 4;
        }
    };

    let head = String::from_utf8_lossy(&raw[..head_end]).into_owned();
    let content_length: usize = head
        .split("\r\n")
        .find_map(|line| {
            let (name, value) = line.split_once(':')?;
            name.eq_ignore_ascii_case("content-length")
                .then(|| value.trim().parse().unwrap())
        })
        .expect("response carries Content-length");

    let mut body = raw[head_end..].to_vec();
    while body.len() < content_length {
        let n = stream.read(&mut chunk).unwrap();
        assert!(n > 0, "connection closed mid-body");
        body.extend_from_slice(&chunk[..n]);
    }
    (head, body)
}

#[test]
fn test_get_serves_index() {
    let root = tempfile::tempdir().unwrap();
    write_site(root.path());
    let (port, handle, join) = start_server(root.path(), 60_000, None);

    let mut stream = connect(port);
    stream.write_all(b"GET / HTTP/1.1\r\nHost: localhost\r\n\r\n").unwrap();

    let (head, body) = read_response(&mut stream);
    assert!(head.starts_with("HTTP/1.1 200 OK\r\n"));
    assert!(head.contains("Content-type: text/html\r\n"));
    assert!(head.contains("Connection: close\r\n"));
    assert_eq!(body, b"<h1>home</h1>");

    // Without keep-alive the server closes after the response.
    let mut rest = Vec::new();
    stream.read_to_end(&mut rest).unwrap();
    assert!(rest.is_empty());

    handle.stop();
    join.join().unwrap();
}

#[test]
fn test_missing_file_gets_canned_404() {
    let root = tempfile::tempdir().unwrap();
    write_site(root.path());
    let (port, handle, join) = start_server(root.path(), 60_000, None);

    let mut stream = connect(port);
    stream
        .write_all(b"GET /missing HTTP/1.1\r\nHost: localhost\r\n\r\n")
        .unwrap();

    let (head, body) = read_response(&mut stream);
    assert!(head.starts_with("HTTP/1.1 404 Not Found\r\n"));
    let body = String::from_utf8_lossy(&body);
    assert!(body.contains("File NotFound"));

    handle.stop();
    join.join().unwrap();
}

#[test]
fn test_css_content_type() {
    let root = tempfile::tempdir().unwrap();
    write_site(root.path());
    let (port, handle, join) = start_server(root.path(), 60_000, None);

    let mut stream = connect(port);
    stream
        .write_all(b"GET /style.css HTTP/1.1\r\nHost: localhost\r\n\r\n")
        .unwrap();

    let (head, body) = read_response(&mut stream);
    assert!(head.contains("Content-type: text/css\r\n"));
    assert_eq!(body, b"em { color: blue }");

    handle.stop();
    join.join().unwrap();
}

#[test]
fn test_keep_alive_serves_two_requests() {
    let root = tempfile::tempdir().unwrap();
    write_site(root.path());
    let (port, handle, join) = start_server(root.path(), 60_000, None);

    let mut stream = connect(port);
    stream
        .write_all(b"GET / HTTP/1.1\r\nConnection: keep-alive\r\n\r\n")
        .unwrap();
    let (head, body) = read_response(&mut stream);
    assert!(head.contains("Connection: keep-alive\r\n"));
    assert!(head.contains("keep-alive: max=6, timeout=120\r\n"));
    assert_eq!(body, b"<h1>home</h1>");

    // Same socket, second request.
    stream
        .write_all(b"GET /style.css HTTP/1.1\r\nConnection: keep-alive\r\n\r\n")
        .unwrap();
    let (head, body) = read_response(&mut stream);
    assert!(head.starts_with("HTTP/1.1 200 OK\r\n"));
    assert_eq!(body, b"em { color: blue }");

    handle.stop();
    join.join().unwrap();
}

#[test]
fn test_post_login_routes_by_credentials() {
    let root = tempfile::tempdir().unwrap();
    write_site(root.path());
    let store: Arc<dyn UserStore> = Arc::new(MemoryStore::new().with_user("ann", "pw1"));
    let (port, handle, join) = start_server(root.path(), 60_000, Some(store));

    let good = b"username=ann&password=pw1";
    let mut stream = connect(port);
    stream
        .write_all(
            format!(
                "POST /login HTTP/1.1\r\nContent-Type: application/x-www-form-urlencoded\r\nContent-Length: {}\r\n\r\n",
                good.len()
            )
            .as_bytes(),
        )
        .unwrap();
    stream.write_all(good).unwrap();
    let (_, body) = read_response(&mut stream);
    assert_eq!(body, b"welcome!");

    let bad = b"username=ann&password=nope";
    let mut stream = connect(port);
    stream
        .write_all(
            format!(
                "POST /login HTTP/1.1\r\nContent-Type: application/x-www-form-urlencoded\r\nContent-Length: {}\r\n\r\n",
                bad.len()
            )
            .as_bytes(),
        )
        .unwrap();
    stream.write_all(bad).unwrap();
    let (_, body) = read_response(&mut stream);
    assert_eq!(body, b"bad credentials");

    handle.stop();
    join.join().unwrap();
}

#[test]
fn test_malformed_request_line_gets_400() {
    let root = tempfile::tempdir().unwrap();
    write_site(root.path());
    let (port, handle, join) = start_server(root.path(), 60_000, None);

    let mut stream = connect(port);
    stream.write_all(b"THIS IS NOT HTTP AT ALL??\r\n\r\n").unwrap();

    let (head, _) = read_response(&mut stream);
    assert!(head.starts_with("HTTP/1.1 400 Bad Request\r\n"));

    handle.stop();
    join.join().unwrap();
}

#[test]
fn test_idle_connection_is_evicted() {
    let root = tempfile::tempdir().unwrap();
    write_site(root.path());
    let (port, handle, join) = start_server(root.path(), 200, None);

    let mut stream = connect(port);
    // Send nothing; the idle timer should close the socket.
    let mut buf = [0u8; 16];
    let n = stream.read(&mut buf).unwrap();
    assert_eq!(n, 0, "expected EOF from idle eviction");

    handle.stop();
    join.join().unwrap();
}
