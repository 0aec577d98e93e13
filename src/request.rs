// src/request.rs
use std::collections::HashMap;

use tracing::debug;

use crate::buffer::Buffer;
use crate::db::{self, SqlPool};

/// Pages that may be addressed without their `.html` suffix.
const DEFAULT_PAGES: [&str; 6] = [
    "/index",
    "/register",
    "/login",
    "/welcome",
    "/video",
    "/picture",
];

/// Returns `Some(is_login)` for the two credential-handling paths.
fn auth_tag(path: &str) -> Option<bool> {
    match path {
        "/register.html" => Some(false),
        "/login.html" => Some(true),
        _ => None,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ParseState {
    RequestLine,
    Headers,
    Body,
    Finish,
}

#[derive(Debug, PartialEq, Eq)]
pub enum ParseError {
    BadRequestLine,
}

impl std::fmt::Display for ParseError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ParseError::BadRequestLine => write!(f, "malformed request line"),
        }
    }
}

/// Line-oriented HTTP/1.1 request parser.
///
/// Feed it the connection's read buffer repeatedly; it consumes complete
/// CRLF-terminated lines and leaves partial ones in place for the next
/// read. Parse state survives across calls until `init`.
pub struct Request {
    state: ParseState,
    method: String,
    path: String,
    version: String,
    body: String,
    headers: HashMap<String, String>,
    post: HashMap<String, String>,
}

impl Request {
    pub fn new() -> Self {
        Self {
            state: ParseState::RequestLine,
            method: String::new(),
            path: String::new(),
            version: String::new(),
            body: String::new(),
            headers: HashMap::new(),
            post: HashMap::new(),
        }
    }

    /// Reset for the next request on a kept-alive connection.
    pub fn init(&mut self) {
        self.state = ParseState::RequestLine;
        self.method.clear();
        self.path.clear();
        self.version.clear();
        self.body.clear();
        self.headers.clear();
        self.post.clear();
    }

    /// Drive the state machine over the buffer's readable bytes.
    ///
    /// `Ok(true)` means a complete request was parsed, `Ok(false)` that more
    /// bytes are needed (nothing consumed past the last complete line). A
    /// malformed request line is the only hard error.
    pub fn parse(&mut self, buf: &mut Buffer) -> Result<bool, ParseError> {
        while buf.readable_bytes() > 0 && self.state != ParseState::Finish {
            if self.state == ParseState::Body {
                let raw = buf.peek().to_vec();
                buf.retrieve(raw.len());
                self.parse_body(&raw);
                continue;
            }

            let Some(line_end) = find_crlf(buf.peek()) else {
                break;
            };
            let line = buf.peek()[..line_end].to_vec();

            match self.state {
                ParseState::RequestLine => {
                    self.parse_request_line(&line)?;
                    self.parse_path();
                }
                ParseState::Headers => {
                    if !self.parse_header(&line) {
                        // Blank (or junk) line: body follows for POST, a GET
                        // request is complete here.
                        self.state = if self.method == "POST" {
                            ParseState::Body
                        } else {
                            ParseState::Finish
                        };
                    }
                    if buf.readable_bytes() <= 2 {
                        self.state = ParseState::Finish;
                    }
                }
                _ => {}
            }
            buf.retrieve_until(line_end + 2);
        }
        debug!(method = %self.method, path = %self.path, version = %self.version, "parsed");
        Ok(self.state == ParseState::Finish)
    }

    /// Rewrite the two designated auth paths according to the credential
    /// check: `/welcome.html` on success, `/error.html` on failure. Only
    /// URL-encoded form POSTs are considered.
    pub fn resolve_auth(&mut self, sql: Option<&SqlPool>) {
        if self.method != "POST" {
            return;
        }
        if self.header("Content-Type") != Some("application/x-www-form-urlencoded") {
            return;
        }
        let Some(is_login) = auth_tag(&self.path) else {
            return;
        };
        let user = self.get_post("username").unwrap_or("").to_owned();
        let pwd = self.get_post("password").unwrap_or("").to_owned();
        let verified = db::user_verify(sql, &user, &pwd, is_login);
        self.path = if verified {
            "/welcome.html".to_string()
        } else {
            "/error.html".to_string()
        };
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

    pub fn body(&self) -> &str {
        &self.body
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).map(String::as_str)
    }

    pub fn get_post(&self, key: &str) -> Option<&str> {
        self.post.get(key).map(String::as_str)
    }

    pub fn is_keep_alive(&self) -> bool {
        self.header("Connection") == Some("keep-alive") && self.version == "1.1"
    }

    fn parse_request_line(&mut self, line: &[u8]) -> Result<(), ParseError> {
        let line = std::str::from_utf8(line).map_err(|_| ParseError::BadRequestLine)?;
        let (method, rest) = line.split_once(' ').ok_or(ParseError::BadRequestLine)?;
        let (target, proto) = rest.split_once(' ').ok_or(ParseError::BadRequestLine)?;
        let version = proto
            .strip_prefix("HTTP/")
            .ok_or(ParseError::BadRequestLine)?;
        if version.contains(' ') {
            return Err(ParseError::BadRequestLine);
        }
        self.method = method.to_string();
        self.path = target.to_string();
        self.version = version.to_string();
        self.state = ParseState::Headers;
        Ok(())
    }

    fn parse_path(&mut self) {
        if self.path == "/" {
            self.path = "/index.html".to_string();
        } else if DEFAULT_PAGES.contains(&self.path.as_str()) {
            self.path.push_str(".html");
        }
    }

    /// Returns false when the line is not a `Name: value` header.
    fn parse_header(&mut self, line: &[u8]) -> bool {
        let line = String::from_utf8_lossy(line);
        match line.split_once(':') {
            Some((name, rest)) => {
                let value = rest.strip_prefix(' ').unwrap_or(rest);
                self.headers.insert(name.to_string(), value.to_string());
                true
            }
            None => false,
        }
    }

    fn parse_body(&mut self, raw: &[u8]) {
        self.body = String::from_utf8_lossy(raw).into_owned();
        self.parse_form();
        self.state = ParseState::Finish;
        debug!(len = raw.len(), "body");
    }

    fn parse_form(&mut self) {
        if self.method != "POST"
            || self.header("Content-Type") != Some("application/x-www-form-urlencoded")
        {
            return;
        }
        let bytes = self.body.clone().into_bytes();
        let mut key = Vec::new();
        let mut val = Vec::new();
        let mut in_key = true;
        let mut i = 0;
        while i < bytes.len() {
            match bytes[i] {
                b'=' if in_key => in_key = false,
                b'&' => {
                    self.store_pair(&key, &val);
                    key.clear();
                    val.clear();
                    in_key = true;
                }
                b'+' => push_to(&mut key, &mut val, in_key, b' '),
                b'%' if i + 2 < bytes.len() => {
                    let byte = conv_hex(bytes[i + 1]) * 16 + conv_hex(bytes[i + 2]);
                    push_to(&mut key, &mut val, in_key, byte);
                    i += 2;
                }
                b => push_to(&mut key, &mut val, in_key, b),
            }
            i += 1;
        }
        // Trailing pair without an '&' terminator.
        if !in_key && !val.is_empty() {
            self.store_pair(&key, &val);
        }
    }

    /// First value wins for duplicate keys.
    fn store_pair(&mut self, key: &[u8], val: &[u8]) {
        if key.is_empty() {
            return;
        }
        let key = String::from_utf8_lossy(key).into_owned();
        if !self.post.contains_key(&key) {
            let val = String::from_utf8_lossy(val).into_owned();
            debug!(key = %key, "form field");
            self.post.insert(key, val);
        }
    }
}

impl Default for Request {
    fn default() -> Self {
        Self::new()
    }
}

fn push_to(key: &mut Vec<u8>, val: &mut Vec<u8>, in_key: bool, b: u8) {
    if in_key {
        key.push(b);
    } else {
        val.push(b);
    }
}

fn conv_hex(c: u8) -> u8 {
    match c {
        b'A'..=b'F' => c - b'A' + 10,
        b'a'..=b'f' => c - b'a' + 10,
        b'0'..=b'9' => c - b'0',
        _ => c,
    }
}

fn find_crlf(hay: &[u8]) -> Option<usize> {
    hay.windows(2).position(|w| w == b"\r\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn buf_of(data: &[u8]) -> Buffer {
        let mut buf = Buffer::new();
        buf.append(data);
        buf
    }

    #[test]
    fn parses_complete_get() {
        let mut buf = buf_of(b"GET /video HTTP/1.1\r\nHost: x\r\nConnection: keep-alive\r\n\r\n");
        let mut req = Request::new();
        assert_eq!(req.parse(&mut buf), Ok(true));
        assert_eq!(req.method(), "GET");
        assert_eq!(req.path(), "/video.html");
        assert_eq!(req.version(), "1.1");
        assert_eq!(req.header("Host"), Some("x"));
        assert!(req.is_keep_alive());
        assert_eq!(buf.readable_bytes(), 0);
    }

    #[test]
    fn rewrites_root_to_index() {
        let mut buf = buf_of(b"GET / HTTP/1.1\r\nHost: x\r\n\r\n");
        let mut req = Request::new();
        assert_eq!(req.parse(&mut buf), Ok(true));
        assert_eq!(req.path(), "/index.html");
        assert!(!req.is_keep_alive());
    }

    #[test]
    fn resumes_after_partial_read() {
        let mut buf = buf_of(b"GET / HT");
        let mut req = Request::new();
        assert_eq!(req.parse(&mut buf), Ok(false));
        buf.append(b"TP/1.1\r\nHos");
        assert_eq!(req.parse(&mut buf), Ok(false));
        buf.append(b"t: here\r\n\r\n");
        assert_eq!(req.parse(&mut buf), Ok(true));
        assert_eq!(req.header("Host"), Some("here"));
        assert_eq!(req.path(), "/index.html");
    }

    #[test]
    fn rejects_malformed_request_line() {
        let mut buf = buf_of(b"BOGUS\r\n\r\n");
        let mut req = Request::new();
        assert_eq!(req.parse(&mut buf), Err(ParseError::BadRequestLine));

        let mut buf = buf_of(b"GET /x FTP/1.1\r\n\r\n");
        let mut req = Request::new();
        assert_eq!(req.parse(&mut buf), Err(ParseError::BadRequestLine));
    }

    #[test]
    fn decodes_form_body() {
        let mut buf = buf_of(
            b"POST /login.html HTTP/1.1\r\nHost: x\r\n\
              Content-Type: application/x-www-form-urlencoded\r\n\r\n\
              username=alice&password=pw%201+really",
        );
        let mut req = Request::new();
        assert_eq!(req.parse(&mut buf), Ok(true));
        assert_eq!(req.get_post("username"), Some("alice"));
        assert_eq!(req.get_post("password"), Some("pw 1 really"));
    }

    #[test]
    fn duplicate_form_keys_keep_first_value() {
        let mut buf = buf_of(
            b"POST /login.html HTTP/1.1\r\n\
              Content-Type: application/x-www-form-urlencoded\r\n\r\n\
              k=first&k=second&tail=t",
        );
        let mut req = Request::new();
        assert_eq!(req.parse(&mut buf), Ok(true));
        assert_eq!(req.get_post("k"), Some("first"));
        assert_eq!(req.get_post("tail"), Some("t"));
    }

    #[test]
    fn auth_failure_rewrites_to_error_page() {
        let mut buf = buf_of(
            b"POST /login.html HTTP/1.1\r\n\
              Content-Type: application/x-www-form-urlencoded\r\n\r\n\
              username=alice&password=pw",
        );
        let mut req = Request::new();
        assert_eq!(req.parse(&mut buf), Ok(true));
        req.resolve_auth(None);
        assert_eq!(req.path(), "/error.html");
    }

    #[test]
    fn non_auth_paths_untouched_by_resolve() {
        let mut buf = buf_of(b"GET /picture HTTP/1.1\r\nHost: x\r\n\r\n");
        let mut req = Request::new();
        assert_eq!(req.parse(&mut buf), Ok(true));
        req.resolve_auth(None);
        assert_eq!(req.path(), "/picture.html");
    }

    #[test]
    fn init_clears_previous_request() {
        let mut buf = buf_of(b"GET / HTTP/1.1\r\nHost: x\r\n\r\n");
        let mut req = Request::new();
        assert_eq!(req.parse(&mut buf), Ok(true));
        req.init();
        assert_eq!(req.method(), "");
        assert_eq!(req.path(), "");
        assert_eq!(req.header("Host"), None);
    }
}
