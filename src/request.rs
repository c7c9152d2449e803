// src/request.rs
//
// Line-oriented HTTP/1.x request parser driven directly off a connection's
// read buffer. One CRLF-delimited line is consumed per step; phases only
// move forward until init() rewinds for the next request on the socket.
use crate::buffer::Buffer;
use std::collections::HashMap;
use tracing::debug;

// Extension-less routes served as "<route>.html".
const DEFAULT_HTML: [&str; 6] = [
    "/index",
    "/register",
    "/login",
    "/welcome",
    "/video",
    "/picture",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    RequestLine,
    Headers,
    Body,
    Finish,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParseError {
    InvalidRequestLine,
    InvalidContentLength,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParseResult {
    /// A full request is assembled and accessors are valid.
    Complete,
    /// More bytes are needed; unterminated input stays buffered.
    Incomplete,
}

pub struct RequestParser {
    phase: Phase,
    method: String,
    path: String,
    version: String,
    headers: HashMap<String, String>,
    body: Vec<u8>,
    body_remaining: usize,
    post: HashMap<String, String>,
}

fn find_crlf(buf: &[u8]) -> Option<usize> {
    buf.windows(2).position(|w| w == b"\r\n")
}

fn hex_val(b: u8) -> Option<u8> {
    match b {
        b'0'..=b'9' => Some(b - b'0'),
        b'a'..=b'f' => Some(b - b'a' + 10),
        b'A'..=b'F' => Some(b - b'A' + 10),
        _ => None,
    }
}

/// Decode one application/x-www-form-urlencoded token: '+' is space,
/// "%XX" is the byte 0xXX. Malformed escapes pass through untouched.
fn url_decode(raw: &str) -> String {
    let bytes = raw.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'+' => {
                out.push(b' ');
                i += 1;
            }
            b'%' if i + 2 < bytes.len() => match (hex_val(bytes[i + 1]), hex_val(bytes[i + 2])) {
                (Some(hi), Some(lo)) => {
                    out.push(hi * 16 + lo);
                    i += 3;
                }
                _ => {
                    out.push(b'%');
                    i += 1;
                }
            },
            b => {
                out.push(b);
                i += 1;
            }
        }
    }
    String::from_utf8_lossy(&out).into_owned()
}

impl RequestParser {
    pub fn new() -> Self {
        RequestParser {
            phase: Phase::RequestLine,
            method: String::new(),
            path: String::new(),
            version: String::new(),
            headers: HashMap::new(),
            body: Vec::new(),
            body_remaining: 0,
            post: HashMap::new(),
        }
    }

    /// Rewind for the next request on the same connection.
    pub fn init(&mut self) {
        self.phase = Phase::RequestLine;
        self.method.clear();
        self.path.clear();
        self.version.clear();
        self.headers.clear();
        self.body.clear();
        self.body_remaining = 0;
        self.post.clear();
    }

    /// Consume buffered bytes line by line, advancing the phase machine.
    /// Bytes are retrieved past each CRLF as lines complete; a partial
    /// line (or a partially buffered body) is left for the next read.
    pub fn parse(&mut self, buf: &mut Buffer) -> Result<ParseResult, ParseError> {
        loop {
            match self.phase {
                Phase::Finish => {
                    debug!(method = %self.method, path = %self.path, version = %self.version, "request parsed");
                    return Ok(ParseResult::Complete);
                }
                Phase::Body => {
                    let take = self.body_remaining.min(buf.readable());
                    self.body.extend_from_slice(&buf.peek()[..take]);
                    buf.retrieve(take);
                    self.body_remaining -= take;
                    if self.body_remaining > 0 {
                        return Ok(ParseResult::Incomplete);
                    }
                    self.parse_post();
                    self.phase = Phase::Finish;
                }
                Phase::RequestLine | Phase::Headers => {
                    let Some(end) = find_crlf(buf.peek()) else {
                        return Ok(ParseResult::Incomplete);
                    };
                    let line = String::from_utf8_lossy(&buf.peek()[..end]).into_owned();
                    buf.retrieve(end + 2);

                    if self.phase == Phase::RequestLine {
                        self.parse_request_line(&line)?;
                        self.normalize_path();
                        self.phase = Phase::Headers;
                    } else {
                        self.parse_header(&line)?;
                    }
                }
            }
        }
    }

    /// METHOD SP PATH SP HTTP/VERSION
    fn parse_request_line(&mut self, line: &str) -> Result<(), ParseError> {
        let mut parts = line.split(' ');
        let (method, path, proto) = match (parts.next(), parts.next(), parts.next(), parts.next()) {
            (Some(m), Some(p), Some(v), None) if !m.is_empty() && !p.is_empty() => (m, p, v),
            _ => return Err(ParseError::InvalidRequestLine),
        };
        let version = proto
            .strip_prefix("HTTP/")
            .ok_or(ParseError::InvalidRequestLine)?;

        self.method = method.to_string();
        self.path = path.to_string();
        self.version = version.to_string();
        Ok(())
    }

    fn normalize_path(&mut self) {
        if self.path == "/" {
            self.path = "/index.html".to_string();
        } else if DEFAULT_HTML.contains(&self.path.as_str()) {
            self.path.push_str(".html");
        }
    }

    /// KEY: VALUE accumulates into the header map. A line that does not
    /// match is the header/body separator: with a declared body length we
    /// move to Body, otherwise the request is finished.
    fn parse_header(&mut self, line: &str) -> Result<(), ParseError> {
        match line.split_once(':') {
            Some((key, value)) if !key.is_empty() => {
                self.headers
                    .insert(key.to_string(), value.strip_prefix(' ').unwrap_or(value).to_string());
                Ok(())
            }
            _ => {
                self.body_remaining = self.declared_body_len()?;
                self.body.reserve(self.body_remaining);
                self.phase = if self.body_remaining > 0 {
                    Phase::Body
                } else {
                    Phase::Finish
                };
                Ok(())
            }
        }
    }

    fn declared_body_len(&self) -> Result<usize, ParseError> {
        match self.header("Content-Length") {
            Some(raw) => raw
                .trim()
                .parse::<usize>()
                .map_err(|_| ParseError::InvalidContentLength),
            None => Ok(0),
        }
    }

    /// POST bodies in urlencoded form decode into the post-parameter map.
    fn parse_post(&mut self) {
        if self.method != "POST" {
            return;
        }
        if self
            .header("Content-Type")
            .is_none_or(|ct| !ct.eq_ignore_ascii_case("application/x-www-form-urlencoded"))
        {
            return;
        }

        let body = String::from_utf8_lossy(&self.body).into_owned();
        for pair in body.split('&') {
            if pair.is_empty() {
                continue;
            }
            let (key, value) = pair.split_once('=').unwrap_or((pair, ""));
            self.post.insert(url_decode(key), url_decode(value));
        }
    }

    pub fn is_keep_alive(&self) -> bool {
        self.version == "1.1"
            && self
                .header("Connection")
                .is_some_and(|v| v.eq_ignore_ascii_case("keep-alive"))
    }

    pub fn method(&self) -> &str {
        &self.method
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn version(&self) -> &str {
        &self.version
    }

    pub fn body(&self) -> &[u8] {
        &self.body
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn post(&self, key: &str) -> Option<&str> {
        self.post.get(key).map(String::as_str)
    }
}

impl Default for RequestParser {
    fn default() -> Self {
        Self::new()
    }
}
