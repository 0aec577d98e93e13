// src/response.rs
use std::fs::File;
use std::os::unix::fs::MetadataExt;
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};

use tracing::debug;

use crate::buffer::Buffer;
use crate::syscalls::MmapFile;

fn status_reason(code: u16) -> Option<&'static str> {
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

/// Suffix → MIME type. The trailing spaces on `.css`/`.js` are kept
/// bit-compatible with the historical table.
fn mime_for(path: &str) -> &'static str {
    let Some(idx) = path.rfind('.') else {
        return "text/plain";
    };
    match &path[idx..] {
        ".html" => "text/html",
        ".xml" => "text/xml",
        ".xhtml" => "application/xhtml+xml",
        ".txt" => "text/plain",
        ".rtf" => "application/rtf",
        ".pdf" => "application/pdf",
        ".word" => "application/nsword",
        ".png" => "image/png",
        ".gif" => "image/gif",
        ".jpg" | ".jpeg" => "image/jpeg",
        ".au" => "audio/basic",
        ".mpeg" | ".mpg" => "video/mpeg",
        ".avi" => "video/x-msvideo",
        ".gz" => "application/x-gzip",
        ".tar" => "application/x-tar",
        ".css" => "text/css ",
        ".js" => "text/javascript ",
        _ => "text/plain",
    }
}

/// Builds one HTTP/1.1 response: headers into the connection's write
/// buffer, the file body as a private read-only mapping for the vectored
/// write's second slot. The mapping is owned here and released on re-init
/// or drop.
pub struct Response {
    code: Option<u16>,
    keep_alive: bool,
    path: String,
    src_dir: PathBuf,
    file: Option<MmapFile>,
    file_len: usize,
}

impl Response {
    pub fn new() -> Self {
        Self {
            code: None,
            keep_alive: false,
            path: String::new(),
            src_dir: PathBuf::new(),
            file: None,
            file_len: 0,
        }
    }

    pub fn init(&mut self, src_dir: &Path, path: String, keep_alive: bool, code: Option<u16>) {
        self.unmap();
        self.code = code;
        self.keep_alive = keep_alive;
        self.path = path;
        self.src_dir = src_dir.to_path_buf();
        self.file_len = 0;
    }

    /// Classify the target, then emit status line, headers, and body
    /// material into `buf`.
    pub fn make_response(&mut self, buf: &mut Buffer) {
        // A pre-chosen error status (400) skips target classification; the
        // error-page substitution below picks its file instead.
        match self.code {
            None | Some(200) => match std::fs::metadata(self.full_path()) {
                Err(_) => self.code = Some(404),
                Ok(md) => {
                    if md.is_dir() {
                        self.code = Some(404);
                    } else if md.mode() & libc::S_IROTH as u32 == 0 {
                        self.code = Some(403);
                    } else {
                        self.code = Some(200);
                        self.file_len = md.len() as usize;
                    }
                }
            },
            Some(_) => {}
        }
        self.substitute_error_page();
        self.add_state_line(buf);
        self.add_header(buf);
        self.add_content(buf);
    }

    pub fn code(&self) -> u16 {
        self.code.unwrap_or(0)
    }

    pub fn keep_alive(&self) -> bool {
        self.keep_alive
    }

    pub fn file(&self) -> Option<&MmapFile> {
        self.file.as_ref()
    }

    pub fn file_len(&self) -> usize {
        self.file.as_ref().map(MmapFile::len).unwrap_or(0)
    }

    pub fn unmap(&mut self) {
        self.file = None;
    }

    /// Inline HTML error body, used when the target cannot be served.
    pub fn error_content(&self, buf: &mut Buffer, message: &str) {
        let code = self.code.unwrap_or(400);
        let status = status_reason(code).unwrap_or("Bad Request");
        let body = format!(
            "<html><title>Error</title><body bgcolor=\"ffffff\">\
             {} : {}\n<p>{}</p><hr><em>minuet</em></body></html>",
            code, status, message
        );
        buf.append_str(&format!("Content-length: {}\r\n\r\n", body.len()));
        buf.append_str(&body);
    }

    fn full_path(&self) -> PathBuf {
        self.src_dir.join(self.path.trim_start_matches('/'))
    }

    fn substitute_error_page(&mut self) {
        if let Some(page) = self.code.and_then(error_page) {
            self.path = page.to_string();
            self.file_len = std::fs::metadata(self.full_path())
                .map(|md| md.len() as usize)
                .unwrap_or(0);
        }
    }

    fn add_state_line(&mut self, buf: &mut Buffer) {
        let code = self.code.unwrap_or(400);
        let (code, status) = match status_reason(code) {
            Some(status) => (code, status),
            // Unknown codes are coerced to the 400 entry.
            None => (400, "Bad Request"),
        };
        self.code = Some(code);
        buf.append_str(&format!("HTTP/1.1 {} {}\r\n", code, status));
    }

    fn add_header(&mut self, buf: &mut Buffer) {
        buf.append_str("Connection: ");
        if self.keep_alive {
            buf.append_str("keep-alive\r\n");
            buf.append_str("keep-alive: max=6, timeout=120\r\n");
        } else {
            buf.append_str("close\r\n");
        }
        buf.append_str(&format!("Content-type: {}\r\n", mime_for(&self.path)));
    }

    fn add_content(&mut self, buf: &mut Buffer) {
        let full = self.full_path();
        let file = match File::open(&full) {
            Ok(f) => f,
            Err(_) => {
                self.error_content(buf, "File NotFound!");
                return;
            }
        };
        debug!(path = %full.display(), "serving file");
        match MmapFile::map(file.as_raw_fd(), self.file_len) {
            Ok(map) => {
                buf.append_str(&format!("Content-length: {}\r\n\r\n", map.len()));
                self.file = Some(map);
            }
            Err(_) => self.error_content(buf, "File NotFound!"),
        }
        // `file` drops here: the descriptor closes, the mapping stays valid.
    }
}

impl Default for Response {
    fn default() -> Self {
        Self::new()
    }
}
