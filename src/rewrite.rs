//! Streaming scanner for the broker-to-local byte stream.
//!
//! The bytes a worker receives from the broker are raw HTTP requests. This
//! module walks that stream incrementally - tolerating arbitrary splits
//! across reads, the way [`feed`](RequestScanner::feed) is handed whatever
//! the socket produced - and does three things:
//!
//! - rewrites the first `Host:` header of **each** request (case-insensitive
//!   match) to a configured hostname, so keep-alive connections rewrite once
//!   per request, not once per connection;
//! - reports each request line (`method`, `path`) for observability;
//! - tracks message framing (`Content-Length` or chunked) so it knows where
//!   one request ends and the next begins.
//!
//! At most one header line is buffered at a time; body bytes pass straight
//! through. A stream the scanner cannot frame (bad content length, bad chunk
//! size, oversized header line) degrades to verbatim pass-through.

/// A request line observed on the stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestLine {
    /// HTTP method, e.g. `GET`.
    pub method: String,
    /// Request target, e.g. `/index.html`.
    pub path: String,
}

/// Longest header line the scanner will buffer before giving up on framing.
const MAX_LINE_LEN: usize = 8192;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ScanState {
    /// Expecting a request line (or stray CRLF between requests).
    RequestLine,
    /// Inside the header block.
    Headers,
    /// Passing through a fixed-length body; bytes remaining.
    BodyFixed(u64),
    /// Expecting a chunk-size line.
    ChunkSize,
    /// Passing through chunk data; bytes remaining.
    ChunkData(u64),
    /// Expecting the CRLF that terminates a chunk.
    ChunkEnd,
    /// Inside the trailer block after the zero chunk.
    Trailers,
    /// Framing lost; pass everything through untouched.
    Passthrough,
}

/// Incremental request scanner with optional `Host:` rewriting.
#[derive(Debug)]
pub struct RequestScanner {
    rewrite_host: Option<String>,
    state: ScanState,
    line: Vec<u8>,
    host_rewritten: bool,
    content_length: Option<u64>,
    chunked: bool,
}

impl RequestScanner {
    /// Create a scanner. When `rewrite_host` is `None` the stream passes
    /// through byte-exact and only request lines are reported.
    pub fn new(rewrite_host: Option<String>) -> Self {
        Self {
            rewrite_host,
            state: ScanState::RequestLine,
            line: Vec::new(),
            host_rewritten: false,
            content_length: None,
            chunked: false,
        }
    }

    /// Reset to the start-of-request state. Called when the worker opens a
    /// fresh connection to the local service.
    pub fn reset(&mut self) {
        self.state = ScanState::RequestLine;
        self.line.clear();
        self.host_rewritten = false;
        self.content_length = None;
        self.chunked = false;
    }

    /// Feed a read chunk; returns the (possibly rewritten) bytes to forward
    /// and any request lines observed in this chunk.
    pub fn feed(&mut self, input: &[u8]) -> (Vec<u8>, Vec<RequestLine>) {
        let mut out = Vec::with_capacity(input.len());
        let mut requests = Vec::new();
        let mut pos = 0;

        while pos < input.len() {
            match self.state {
                ScanState::Passthrough => {
                    out.extend_from_slice(&input[pos..]);
                    break;
                }
                ScanState::BodyFixed(remaining) => {
                    let take = remaining.min((input.len() - pos) as u64) as usize;
                    out.extend_from_slice(&input[pos..pos + take]);
                    pos += take;
                    let left = remaining - take as u64;
                    if left == 0 {
                        self.finish_request();
                    } else {
                        self.state = ScanState::BodyFixed(left);
                    }
                }
                ScanState::ChunkData(remaining) => {
                    let take = remaining.min((input.len() - pos) as u64) as usize;
                    out.extend_from_slice(&input[pos..pos + take]);
                    pos += take;
                    let left = remaining - take as u64;
                    if left == 0 {
                        self.state = ScanState::ChunkEnd;
                    } else {
                        self.state = ScanState::ChunkData(left);
                    }
                }
                _ => {
                    // Line-buffered states.
                    let Some(nl) = input[pos..].iter().position(|b| *b == b'\n') else {
                        self.line.extend_from_slice(&input[pos..]);
                        if self.line.len() > MAX_LINE_LEN {
                            out.append(&mut self.line);
                            self.state = ScanState::Passthrough;
                        }
                        break;
                    };
                    self.line.extend_from_slice(&input[pos..=pos + nl]);
                    pos += nl + 1;
                    if self.line.len() > MAX_LINE_LEN {
                        out.append(&mut self.line);
                        self.state = ScanState::Passthrough;
                        continue;
                    }
                    let line = std::mem::take(&mut self.line);
                    self.handle_line(&line, &mut out, &mut requests);
                }
            }
        }

        (out, requests)
    }

    /// Handle one complete line according to the current state.
    fn handle_line(&mut self, line: &[u8], out: &mut Vec<u8>, requests: &mut Vec<RequestLine>) {
        match self.state {
            ScanState::RequestLine => {
                out.extend_from_slice(line);
                if is_blank_line(line) {
                    // Stray CRLF between pipelined requests.
                    return;
                }
                if let Some(request) = parse_request_line(line) {
                    requests.push(request);
                }
                self.host_rewritten = false;
                self.content_length = None;
                self.chunked = false;
                self.state = ScanState::Headers;
            }
            ScanState::Headers => {
                if is_blank_line(line) {
                    out.extend_from_slice(line);
                    self.enter_body();
                    return;
                }
                self.handle_header_line(line, out);
            }
            ScanState::ChunkSize => {
                out.extend_from_slice(line);
                match parse_chunk_size(line) {
                    Some(0) => self.state = ScanState::Trailers,
                    Some(size) => self.state = ScanState::ChunkData(size),
                    None => self.state = ScanState::Passthrough,
                }
            }
            ScanState::ChunkEnd => {
                out.extend_from_slice(line);
                self.state = ScanState::ChunkSize;
            }
            ScanState::Trailers => {
                out.extend_from_slice(line);
                if is_blank_line(line) {
                    self.finish_request();
                }
            }
            // Raw states never reach handle_line.
            ScanState::BodyFixed(_) | ScanState::ChunkData(_) | ScanState::Passthrough => {
                out.extend_from_slice(line);
            }
        }
    }

    /// Rewrite or pass a header line; record framing headers.
    fn handle_header_line(&mut self, line: &[u8], out: &mut Vec<u8>) {
        if let Some((name, value)) = split_header(line) {
            if name.eq_ignore_ascii_case("content-length") {
                match value.trim().parse::<u64>() {
                    Ok(n) => self.content_length = Some(n),
                    Err(_) => {
                        out.extend_from_slice(line);
                        self.state = ScanState::Passthrough;
                        return;
                    }
                }
            } else if name.eq_ignore_ascii_case("transfer-encoding")
                && value.to_ascii_lowercase().contains("chunked")
            {
                self.chunked = true;
            } else if name.eq_ignore_ascii_case("host") && !self.host_rewritten {
                if let Some(host) = &self.rewrite_host {
                    out.extend_from_slice(format!("Host: {host}\r\n").as_bytes());
                    self.host_rewritten = true;
                    return;
                }
            }
        }
        out.extend_from_slice(line);
    }

    /// Headers complete: pick the body framing.
    fn enter_body(&mut self) {
        if self.chunked {
            self.state = ScanState::ChunkSize;
        } else {
            match self.content_length {
                Some(0) | None => self.finish_request(),
                Some(n) => self.state = ScanState::BodyFixed(n),
            }
        }
    }

    /// Request complete: back to expecting a request line.
    fn finish_request(&mut self) {
        self.state = ScanState::RequestLine;
        self.host_rewritten = false;
        self.content_length = None;
        self.chunked = false;
    }
}

/// True for a line that is only a line terminator.
fn is_blank_line(line: &[u8]) -> bool {
    line == b"\r\n" || line == b"\n"
}

/// Split a header line into name and value at the first colon.
fn split_header(line: &[u8]) -> Option<(&str, &str)> {
    let text = std::str::from_utf8(line).ok()?;
    let (name, value) = text.split_once(':')?;
    Some((name, value))
}

/// Parse a chunk-size line (hex digits, optional `;extension`).
fn parse_chunk_size(line: &[u8]) -> Option<u64> {
    let text = std::str::from_utf8(line).ok()?.trim();
    let size = text.split(';').next()?.trim();
    u64::from_str_radix(size, 16).ok()
}

/// Best-effort request-line parse: a word of `[A-Za-z0-9_]`, whitespace,
/// then a non-empty target.
pub fn parse_request_line(line: &[u8]) -> Option<RequestLine> {
    let text = std::str::from_utf8(line).ok()?;
    let mut parts = text.split_whitespace();
    let method = parts.next()?;
    let path = parts.next()?;
    if method.is_empty()
        || !method
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_')
    {
        return None;
    }
    Some(RequestLine {
        method: method.to_string(),
        path: path.to_string(),
    })
}
