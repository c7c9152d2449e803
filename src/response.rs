// src/response.rs
//
// Turns a parsed request plus a filesystem lookup into status line, headers
// and body bytes. File bodies are served from a read-only memory mapping
// referenced by the connection's write descriptors; everything else is
// appended straight into the write buffer.
use crate::buffer::Buffer;
use crate::syscalls::MappedFile;
use std::os::unix::fs::PermissionsExt;
use std::path::{Component, Path, PathBuf};
use std::time::SystemTime;
use tracing::{debug, warn};

fn status_text(code: u16) -> Option<&'static str> {
    match code {
        200 => Some("OK"),
        400 => Some("Bad Request"),
        403 => Some("Forbidden"),
        404 => Some("Not Found"),
        _ => None,
    }
}

fn error_page(code: u16) -> Option<&'static str> {
    match code {
        400 => Some("/400.html"),
        403 => Some("/403.html"),
        404 => Some("/404.html"),
        _ => None,
    }
}

fn content_type(path: &str) -> &'static str {
    let Some(dot) = path.rfind('.') else {
        return "text/plain";
    };
    match &path[dot..] {
        ".html" => "text/html",
        ".xml" => "text/xml",
        ".xhtml" => "application/xhtml+xml",
        ".txt" => "text/plain",
        ".rtf" => "application/rtf",
        ".pdf" => "application/pdf",
        ".word" => "application/msword",
        ".png" => "image/png",
        ".gif" => "image/gif",
        ".jpg" | ".jpeg" => "image/jpeg",
        ".au" => "audio/basic",
        ".mpeg" | ".mpg" => "video/mpeg",
        ".avi" => "video/x-msvideo",
        ".gz" => "application/x-gzip",
        ".tar" => "application/x-tar",
        ".css" => "text/css",
        ".js" => "text/javascript",
        _ => "text/plain",
    }
}

pub struct ResponseBuilder {
    code: u16,
    keep_alive: bool,
    path: String,
    src_dir: PathBuf,
    file: Option<MappedFile>,
}

impl ResponseBuilder {
    pub fn new() -> Self {
        ResponseBuilder {
            code: 0,
            keep_alive: false,
            path: String::new(),
            src_dir: PathBuf::new(),
            file: None,
        }
    }

    /// Start a new response cycle. Any mapping from the previous cycle is
    /// released before new state is taken on.
    pub fn init(&mut self, src_dir: &Path, path: &str, keep_alive: bool, code: u16) {
        self.unmap();
        self.src_dir = src_dir.to_path_buf();
        self.path = path.to_string();
        self.keep_alive = keep_alive;
        self.code = code;
    }

    pub fn code(&self) -> u16 {
        self.code
    }

    /// The mapped file body, when this cycle produced one.
    pub fn file(&self) -> Option<&[u8]> {
        self.file.as_ref().map(|m| m.as_slice())
    }

    /// Release the file mapping. Must happen before the builder is reused;
    /// also called from init and on drop via MappedFile.
    pub fn unmap(&mut self) {
        self.file = None;
    }

    /// Resolve the request path under the source directory. Paths that try
    /// to climb out with ".." are refused outright.
    fn resolved(&self) -> Option<PathBuf> {
        let rel = self.path.trim_start_matches('/');
        if Path::new(rel)
            .components()
            .any(|c| matches!(c, Component::ParentDir))
        {
            warn!(path = %self.path, "rejected path traversal");
            return None;
        }
        Some(self.src_dir.join(rel))
    }

    /// Assemble the full response head into `buf` and map the body file.
    pub fn build(&mut self, buf: &mut Buffer) {
        if self.code == 200 {
            self.code = match self.resolved().map(std::fs::metadata) {
                None | Some(Err(_)) => 404,
                Some(Ok(meta)) if meta.is_dir() => 404,
                Some(Ok(meta)) if meta.permissions().mode() & 0o004 == 0 => 403,
                Some(Ok(_)) => 200,
            };
        }

        // Error codes are served from their canned pages, re-resolved for
        // their own content below.
        if let Some(page) = error_page(self.code) {
            self.path = page.to_string();
        }

        self.add_status_line(buf);
        self.add_headers(buf);
        self.add_content(buf);
    }

    fn add_status_line(&mut self, buf: &mut Buffer) {
        // Codes outside the known set degrade to 400.
        if status_text(self.code).is_none() {
            self.code = 400;
        }
        let status = status_text(self.code).unwrap_or("Bad Request");
        buf.append(format!("HTTP/1.1 {} {}\r\n", self.code, status).as_bytes());
    }

    fn add_headers(&mut self, buf: &mut Buffer) {
        buf.append(b"Connection: ");
        if self.keep_alive {
            buf.append(b"keep-alive\r\n");
            buf.append(b"keep-alive: max=6, timeout=120\r\n");
        } else {
            buf.append(b"close\r\n");
        }
        buf.append(format!("Content-type: {}\r\n", content_type(&self.path)).as_bytes());
        buf.append(format!("Date: {}\r\n", httpdate::fmt_http_date(SystemTime::now())).as_bytes());
    }

    /// Map the resolved file and emit its Content-length, or fall back to
    /// a synthesized inline error body when the file cannot be served.
    fn add_content(&mut self, buf: &mut Buffer) {
        let Some(full) = self.resolved() else {
            self.error_content(buf, "File NotFound");
            return;
        };

        let len = match std::fs::metadata(&full) {
            Ok(meta) if !meta.is_dir() => meta.len() as usize,
            _ => {
                self.error_content(buf, "File NotFound");
                return;
            }
        };

        if len == 0 {
            buf.append(b"Content-length: 0\r\n\r\n");
            return;
        }

        match MappedFile::open(&full, len) {
            Ok(map) => {
                debug!(path = %full.display(), len, "serving mapped file");
                buf.append(format!("Content-length: {}\r\n\r\n", len).as_bytes());
                self.file = Some(map);
            }
            Err(e) => {
                warn!(path = %full.display(), error = %e, "file map failed");
                self.error_content(buf, "File NotFound");
            }
        }
    }

    fn error_content(&self, buf: &mut Buffer, message: &str) {
        let status = status_text(self.code).unwrap_or("Bad Request");
        let body = format!(
            "<html><title>Error</title><body bgcolor=\"ffffff\">{} : {}\n<p>{}</p><hr><em>NocturneServer</em></body></html>",
            self.code, status, message
        );
        buf.append(format!("Content-length: {}\r\n\r\n", body.len()).as_bytes());
        buf.append(body.as_bytes());
    }
}

impl Default for ResponseBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::io::Write;

    fn build_for(dir: &Path, path: &str, keep_alive: bool, code: u16) -> (ResponseBuilder, String, Option<Vec<u8>>) {
        let mut builder = ResponseBuilder::new();
        let mut buf = Buffer::new();
        builder.init(dir, path, keep_alive, code);
        builder.build(&mut buf);
        let head = String::from_utf8_lossy(buf.peek()).into_owned();
        let file = builder.file().map(|f| f.to_vec());
        (builder, head, file)
    }

    #[test]
    fn test_missing_file_yields_canned_404() {
        let dir = tempfile::tempdir().unwrap();
        let (builder, head, file) = build_for(dir.path(), "/missing.html", false, 200);

        assert_eq!(builder.code(), 404);
        assert!(head.starts_with("HTTP/1.1 404 Not Found\r\n"));
        assert!(head.contains("File NotFound"));
        assert!(file.is_none());
    }

    #[test]
    fn test_css_content_type_and_mapped_body() {
        let dir = tempfile::tempdir().unwrap();
        let mut f = fs::File::create(dir.path().join("style.css")).unwrap();
        f.write_all(b"body { color: red }").unwrap();

        let (builder, head, file) = build_for(dir.path(), "/style.css", true, 200);
        assert_eq!(builder.code(), 200);
        assert!(head.contains("Content-type: text/css\r\n"));
        assert!(head.contains("Content-length: 19\r\n"));
        assert!(head.contains("Connection: keep-alive\r\n"));
        assert!(head.contains("keep-alive: max=6, timeout=120\r\n"));
        assert_eq!(file.unwrap(), b"body { color: red }");
    }

    #[test]
    fn test_unknown_suffix_is_text_plain() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("notes"), b"plain").unwrap();

        let (_, head, _) = build_for(dir.path(), "/notes", false, 200);
        assert!(head.contains("Content-type: text/plain\r\n"));
        assert!(head.contains("Connection: close\r\n"));
    }

    #[test]
    fn test_unreadable_file_is_403() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("private.html");
        fs::write(&path, b"secret").unwrap();
        fs::set_permissions(&path, fs::Permissions::from_mode(0o600)).unwrap();

        let (builder, head, _) = build_for(dir.path(), "/private.html", false, 200);
        assert_eq!(builder.code(), 403);
        assert!(head.starts_with("HTTP/1.1 403 Forbidden\r\n"));
    }

    #[test]
    fn test_directory_is_404() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir(dir.path().join("sub")).unwrap();

        let (builder, _, _) = build_for(dir.path(), "/sub", false, 200);
        assert_eq!(builder.code(), 404);
    }

    #[test]
    fn test_parent_dir_traversal_refused() {
        let outer = tempfile::tempdir().unwrap();
        fs::write(outer.path().join("secret.txt"), b"top").unwrap();
        let inner = outer.path().join("www");
        fs::create_dir(&inner).unwrap();

        let (builder, _, file) = build_for(&inner, "/../secret.txt", false, 200);
        assert_eq!(builder.code(), 404);
        assert!(file.is_none());
    }

    #[test]
    fn test_canned_error_page_used_when_present() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("404.html"), b"<h1>gone</h1>").unwrap();

        let (builder, head, file) = build_for(dir.path(), "/nope.html", false, 200);
        assert_eq!(builder.code(), 404);
        assert!(head.contains("Content-type: text/html\r\n"));
        assert_eq!(file.unwrap(), b"<h1>gone</h1>");
    }

    #[test]
    fn test_bad_request_keeps_400() {
        let dir = tempfile::tempdir().unwrap();
        let (builder, head, _) = build_for(dir.path(), "", false, 400);
        assert_eq!(builder.code(), 400);
        assert!(head.starts_with("HTTP/1.1 400 Bad Request\r\n"));
    }

    #[test]
    fn test_mapping_released_on_reinit() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("a.txt"), b"aa").unwrap();

        let mut builder = ResponseBuilder::new();
        let mut buf = Buffer::new();
        builder.init(dir.path(), "/a.txt", true, 200);
        builder.build(&mut buf);
        assert!(builder.file().is_some());

        builder.init(dir.path(), "/a.txt", true, 200);
        assert!(builder.file().is_none());
    }
}
