// src/conn.rs
//
// Per-socket aggregate: read buffer, write buffer, parser and response
// builder, plus the pending-write bookkeeping. A connection is driven
// externally by reactor-dispatched tasks; one-shot readiness guarantees a
// single task touches it at a time.
use crate::auth::UserStore;
use crate::buffer::Buffer;
use crate::request::{ParseResult, RequestParser};
use crate::response::ResponseBuilder;
use crate::syscalls;
use std::io;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, warn};

// Below this many pending bytes a level-triggered writer yields back to
// the reactor instead of looping on the socket.
const FLUSH_THRESHOLD: usize = 10240;

pub struct Connection {
    fd: i32,
    peer: SocketAddr,
    read_buf: Buffer,
    write_buf: Buffer,
    parser: RequestParser,
    response: ResponseBuilder,
    // Bytes of the mapped-file segment already flushed to the socket.
    file_written: usize,
    keep_alive: bool,
    src_dir: Arc<PathBuf>,
    store: Option<Arc<dyn UserStore>>,
}

impl Connection {
    pub fn new(
        fd: i32,
        peer: SocketAddr,
        src_dir: Arc<PathBuf>,
        store: Option<Arc<dyn UserStore>>,
    ) -> Self {
        Connection {
            fd,
            peer,
            read_buf: Buffer::new(),
            write_buf: Buffer::new(),
            parser: RequestParser::new(),
            response: ResponseBuilder::new(),
            file_written: 0,
            keep_alive: false,
            src_dir,
            store,
        }
    }

    pub fn fd(&self) -> i32 {
        self.fd
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    pub fn is_keep_alive(&self) -> bool {
        self.keep_alive
    }

    /// Total bytes still pending across both write segments.
    pub fn to_write_bytes(&self) -> usize {
        let file_rest = self
            .response
            .file()
            .map(|f| f.len() - self.file_written)
            .unwrap_or(0);
        self.write_buf.readable() + file_rest
    }

    /// Pull bytes off the socket. Under edge triggering the loop drains
    /// until WouldBlock, since the event will not repeat. A zero-byte read
    /// is the peer closing and surfaces as UnexpectedEof.
    pub fn read(&mut self, edge_triggered: bool) -> io::Result<usize> {
        let mut total = 0;
        loop {
            match self.read_buf.read_from_fd(self.fd) {
                Ok(0) => {
                    return Err(io::Error::new(io::ErrorKind::UnexpectedEof, "peer closed"));
                }
                Ok(n) => {
                    total += n;
                    if !edge_triggered {
                        break;
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) => return Err(e),
            }
        }
        Ok(total)
    }

    /// Feed buffered bytes through the parser and, once a request is
    /// assembled (or rejected), build the response. Returns true when a
    /// response is pending and the socket should be re-armed for write;
    /// false means more input is needed first.
    pub fn process(&mut self) -> bool {
        if self.read_buf.readable() == 0 {
            return false;
        }

        match self.parser.parse(&mut self.read_buf) {
            Ok(ParseResult::Incomplete) => false,
            Ok(ParseResult::Complete) => {
                let path = self.route();
                self.keep_alive = self.parser.is_keep_alive();
                self.response
                    .init(&self.src_dir, &path, self.keep_alive, 200);
                self.finish_request();
                true
            }
            Err(e) => {
                debug!(fd = self.fd, error = ?e, "request rejected");
                self.keep_alive = false;
                let path = self.parser.path().to_string();
                self.response.init(&self.src_dir, &path, false, 400);
                self.finish_request();
                true
            }
        }
    }

    fn finish_request(&mut self) {
        self.response.build(&mut self.write_buf);
        self.file_written = 0;
        // The parser restarts at RequestLine for the next request on this
        // socket; leftover buffered bytes stay readable.
        self.parser.init();
    }

    /// Map POSTs against the two auth routes through the user store; the
    /// outcome decides which page gets served.
    fn route(&self) -> String {
        let path = self.parser.path();
        if self.parser.method() == "POST" && (path == "/login.html" || path == "/register.html") {
            if let Some(store) = &self.store {
                let is_login = path == "/login.html";
                let user = self.parser.post("username").unwrap_or("");
                let password = self.parser.post("password").unwrap_or("");
                return match store.verify(user, password, is_login) {
                    Ok(true) => "/welcome.html".to_string(),
                    Ok(false) => "/error.html".to_string(),
                    Err(e) => {
                        warn!(fd = self.fd, error = %e, "user store failed");
                        "/error.html".to_string()
                    }
                };
            }
        }
        path.to_string()
    }

    /// Flush the pending segments with gather writes: header bytes first,
    /// then the mapped file. Partial writes advance whichever segments were
    /// consumed. Loops while edge-triggered or while more than the flush
    /// threshold remains; WouldBlock leaves the remainder for the next
    /// write-readiness event.
    pub fn write(&mut self, edge_triggered: bool) -> io::Result<()> {
        loop {
            let head_len = self.write_buf.readable();
            let n = {
                let head = self.write_buf.peek();
                let file_rest: &[u8] = self
                    .response
                    .file()
                    .map(|f| &f[self.file_written..])
                    .unwrap_or(&[]);

                if head.is_empty() && file_rest.is_empty() {
                    return Ok(());
                }

                match syscalls::write_vectored(self.fd, &[head, file_rest]) {
                    Ok(n) => n,
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(()),
                    Err(e) => return Err(e),
                }
            };

            if n > head_len {
                self.file_written += n - head_len;
                if head_len > 0 {
                    self.write_buf.retrieve_all();
                }
            } else {
                self.write_buf.retrieve(n);
            }

            let remaining = self.to_write_bytes();
            if remaining == 0 {
                return Ok(());
            }
            if !(edge_triggered || remaining > FLUSH_THRESHOLD) {
                return Ok(());
            }
        }
    }

    /// A keep-alive response has been fully flushed: release the file
    /// mapping and make the connection ready for its next request.
    pub fn reset_for_next(&mut self) {
        self.response.unmap();
        self.file_written = 0;
        self.write_buf.retrieve_all();
    }

    #[cfg(test)]
    pub fn read_buf_mut(&mut self) -> &mut Buffer {
        &mut self.read_buf
    }

    #[cfg(test)]
    pub fn write_head(&self) -> &[u8] {
        self.write_buf.peek()
    }

    #[cfg(test)]
    pub fn file_body(&self) -> Option<&[u8]> {
        self.response.file()
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        if self.fd >= 0 {
            syscalls::close_fd(self.fd);
            self.fd = -1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::MemoryStore;
    use std::fs;
    use std::net::{IpAddr, Ipv4Addr};

    fn test_conn(src_dir: &std::path::Path, store: Option<Arc<dyn UserStore>>) -> Connection {
        let peer = SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 40000);
        Connection::new(-1, peer, Arc::new(src_dir.to_path_buf()), store)
    }

    #[test]
    fn test_process_serves_static_file() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("index.html"), b"<p>home</p>").unwrap();

        let mut conn = test_conn(dir.path(), None);
        conn.read_buf_mut()
            .append(b"GET / HTTP/1.1\r\nConnection: keep-alive\r\n\r\n");

        assert!(conn.process());
        assert!(conn.is_keep_alive());
        let head = String::from_utf8_lossy(conn.write_head()).into_owned();
        assert!(head.starts_with("HTTP/1.1 200 OK\r\n"));
        assert_eq!(conn.file_body().unwrap(), b"<p>home</p>");
        assert_eq!(conn.to_write_bytes(), head.len() + 11);
    }

    #[test]
    fn test_process_incomplete_waits_for_more() {
        let dir = tempfile::tempdir().unwrap();
        let mut conn = test_conn(dir.path(), None);

        conn.read_buf_mut().append(b"GET / HTTP/1.1\r\nHos");
        assert!(!conn.process());

        conn.read_buf_mut().append(b"t: x\r\n\r\n");
        assert!(conn.process());
    }

    #[test]
    fn test_process_malformed_is_400() {
        let dir = tempfile::tempdir().unwrap();
        let mut conn = test_conn(dir.path(), None);
        conn.read_buf_mut().append(b"NOT A REQUEST LINE AT ALL\r\n\r\n");

        assert!(conn.process());
        assert!(!conn.is_keep_alive());
        let head = String::from_utf8_lossy(conn.write_head()).into_owned();
        assert!(head.starts_with("HTTP/1.1 400 Bad Request\r\n"));
    }

    #[test]
    fn test_login_routes_through_store() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("welcome.html"), b"hi").unwrap();
        fs::write(dir.path().join("error.html"), b"no").unwrap();
        let store: Arc<dyn UserStore> = Arc::new(MemoryStore::new().with_user("ann", "pw1"));

        let mut conn = test_conn(dir.path(), Some(Arc::clone(&store)));
        conn.read_buf_mut().append(
            b"POST /login HTTP/1.1\r\nContent-Type: application/x-www-form-urlencoded\r\nContent-Length: 25\r\n\r\nusername=ann&password=pw1",
        );
        assert!(conn.process());
        assert_eq!(conn.file_body().unwrap(), b"hi");

        let mut conn = test_conn(dir.path(), Some(store));
        conn.read_buf_mut().append(
            b"POST /login HTTP/1.1\r\nContent-Type: application/x-www-form-urlencoded\r\nContent-Length: 24\r\n\r\nusername=ann&password=no",
        );
        assert!(conn.process());
        assert_eq!(conn.file_body().unwrap(), b"no");
    }

    #[test]
    fn test_keep_alive_reset_releases_mapping() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("index.html"), b"x").unwrap();

        let mut conn = test_conn(dir.path(), None);
        conn.read_buf_mut()
            .append(b"GET / HTTP/1.1\r\nConnection: keep-alive\r\n\r\n");
        assert!(conn.process());
        assert!(conn.file_body().is_some());

        conn.reset_for_next();
        assert!(conn.file_body().is_none());
        assert_eq!(conn.to_write_bytes(), 0);

        // Second request on the same connection parses from a clean slate.
        conn.read_buf_mut().append(b"GET / HTTP/1.0\r\n\r\n");
        assert!(conn.process());
        assert!(!conn.is_keep_alive());
    }
}
