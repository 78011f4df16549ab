//! On-disk request/response dumper for manual inspection.
//!
//! Strictly observational: workers copy the bytes they forward into an
//! unbounded channel and move on; a single dumper task assembles complete
//! HTTP messages (header terminator plus `Content-Length` or chunked end)
//! and writes one YAML file per message:
//!
//! ```text
//! <clientId>.<snowflake>.req.yaml
//! <clientId>.<snowflake>.res.yaml
//! <clientId>.<snowflake>.req.<ext>     sidecar for binary bodies
//! ```
//!
//! Dumper I/O failures are logged at debug level and never influence
//! tunneling.

use std::collections::HashMap;
use std::fs;
use std::path::PathBuf;

use log::{debug, info};
use serde::Serialize;
use tokio::sync::mpsc;

use crate::events::WorkerId;

/// Which side of the pipe a chunk came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) enum Direction {
    /// Broker to local service.
    Request,
    /// Local service to broker.
    Response,
}

impl Direction {
    fn tag(self) -> &'static str {
        match self {
            Direction::Request => "req",
            Direction::Response => "res",
        }
    }
}

/// One observed read, tagged with its worker and direction.
#[derive(Debug)]
pub(crate) struct DumpChunk {
    /// Worker the bytes crossed.
    pub conn: WorkerId,
    /// Direction of travel.
    pub direction: Direction,
    /// The forwarded bytes.
    pub bytes: Vec<u8>,
}

/// Cheap handle workers use to feed the dumper.
#[derive(Debug, Clone)]
pub(crate) struct DumpHandle {
    tx: mpsc::UnboundedSender<DumpChunk>,
}

impl DumpHandle {
    /// Observe one forwarded chunk. Never blocks, never fails the caller.
    pub fn observe(&self, conn: WorkerId, direction: Direction, bytes: &[u8]) {
        let _ = self.tx.send(DumpChunk {
            conn,
            direction,
            bytes: bytes.to_vec(),
        });
    }
}

/// Spawn the dumper task writing into `dir` for tunnel `client_id`.
pub(crate) fn spawn(dir: PathBuf, client_id: String) -> DumpHandle {
    let (tx, rx) = mpsc::unbounded_channel();
    tokio::spawn(run(dir, client_id, rx));
    DumpHandle { tx }
}

async fn run(dir: PathBuf, client_id: String, mut rx: mpsc::UnboundedReceiver<DumpChunk>) {
    if let Err(e) = fs::create_dir_all(&dir) {
        debug!("[Dump] Cannot create {}: {e}; dumping disabled", dir.display());
        return;
    }
    info!("[Dump] Writing traffic dumps to {}", dir.display());

    let mut writer = DumpWriter::new(dir, client_id);
    let mut assemblers: HashMap<(WorkerId, Direction), MessageAssembler> = HashMap::new();

    while let Some(chunk) = rx.recv().await {
        let assembler = assemblers
            .entry((chunk.conn, chunk.direction))
            .or_insert_with(MessageAssembler::new);
        for message in assembler.feed(&chunk.bytes) {
            writer.write(chunk.direction, &message);
        }
    }
}

/// A fully assembled HTTP message.
#[derive(Debug)]
struct AssembledMessage {
    /// Request or status line, without the line terminator.
    head: String,
    /// Raw header lines, without terminators.
    headers: Vec<String>,
    /// Body bytes (possibly empty).
    body: Vec<u8>,
    /// `Content-Type` value, when one was present.
    content_type: Option<String>,
}

/// YAML shape of a dump file.
#[derive(Debug, Serialize)]
struct DumpRecord<'a> {
    at: String,
    head: &'a str,
    headers: &'a [String],
    #[serde(skip_serializing_if = "Option::is_none")]
    body: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    body_file: Option<String>,
}

/// Writes assembled messages to disk with snowflake-style names.
#[derive(Debug)]
struct DumpWriter {
    dir: PathBuf,
    client_id: String,
    seq: u16,
}

impl DumpWriter {
    fn new(dir: PathBuf, client_id: String) -> Self {
        Self {
            dir,
            client_id,
            seq: 0,
        }
    }

    /// Time-ordered unique id: milliseconds shifted left, low bits a
    /// per-process sequence.
    fn snowflake(&mut self) -> u64 {
        let ms = chrono::Utc::now().timestamp_millis().max(0) as u64;
        self.seq = self.seq.wrapping_add(1);
        (ms << 12) | u64::from(self.seq & 0x0fff)
    }

    fn write(&mut self, direction: Direction, message: &AssembledMessage) {
        let id = self.snowflake();
        let stem = format!("{}.{id}.{}", self.client_id, direction.tag());

        let (body, body_file) = if message.body.is_empty() {
            (None, None)
        } else if let Some(text) = text_body(message) {
            (Some(text), None)
        } else {
            let ext = sidecar_extension(message.content_type.as_deref());
            let name = format!("{stem}.{ext}");
            if let Err(e) = fs::write(self.dir.join(&name), &message.body) {
                debug!("[Dump] Cannot write sidecar {name}: {e}");
            }
            (None, Some(name))
        };

        let record = DumpRecord {
            at: chrono::Utc::now().to_rfc3339(),
            head: &message.head,
            headers: &message.headers,
            body,
            body_file,
        };

        match serde_yml::to_string(&record) {
            Ok(yaml) => {
                let path = self.dir.join(format!("{stem}.yaml"));
                if let Err(e) = fs::write(&path, yaml) {
                    debug!("[Dump] Cannot write {}: {e}", path.display());
                }
            }
            Err(e) => debug!("[Dump] Cannot serialize dump record: {e}"),
        }
    }
}

/// UTF-8 body text when the content type says the payload is textual.
fn text_body(message: &AssembledMessage) -> Option<&str> {
    let content_type = message.content_type.as_deref().unwrap_or("");
    let lowered = content_type.to_ascii_lowercase();
    let textual = lowered.starts_with("text/")
        || ["json", "xml", "html", "javascript", "x-www-form-urlencoded"]
            .iter()
            .any(|t| lowered.contains(t))
        || content_type.is_empty();
    if !textual {
        return None;
    }
    std::str::from_utf8(&message.body).ok()
}

/// Sidecar extension dictated by the content type.
fn sidecar_extension(content_type: Option<&str>) -> &'static str {
    let subtype = content_type
        .unwrap_or("")
        .split(';')
        .next()
        .unwrap_or("")
        .rsplit('/')
        .next()
        .unwrap_or("")
        .to_ascii_lowercase();
    match subtype.as_str() {
        "png" => "png",
        "jpeg" | "jpg" => "jpg",
        "gif" => "gif",
        "webp" => "webp",
        "pdf" => "pdf",
        "zip" => "zip",
        "gzip" => "gz",
        _ => "bin",
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AssembleState {
    Head,
    Headers,
    BodyFixed(u64),
    ChunkSize,
    ChunkData(u64),
    ChunkEnd,
    Trailers,
}

/// Incremental assembler of complete HTTP messages from a byte stream.
///
/// Messages it cannot frame (no `Content-Length`, not chunked) are treated
/// as complete at the header terminator; a stream that desyncs is dropped
/// silently - the dumper must never take tunneling down with it.
#[derive(Debug)]
struct MessageAssembler {
    state: AssembleState,
    line: Vec<u8>,
    head: String,
    headers: Vec<String>,
    body: Vec<u8>,
    content_type: Option<String>,
    content_length: Option<u64>,
    chunked: bool,
}

impl MessageAssembler {
    fn new() -> Self {
        Self {
            state: AssembleState::Head,
            line: Vec::new(),
            head: String::new(),
            headers: Vec::new(),
            body: Vec::new(),
            content_type: None,
            content_length: None,
            chunked: false,
        }
    }

    /// Feed bytes; returns any messages completed by this chunk.
    fn feed(&mut self, input: &[u8]) -> Vec<AssembledMessage> {
        let mut done = Vec::new();
        let mut pos = 0;

        while pos < input.len() {
            match self.state {
                AssembleState::BodyFixed(remaining) | AssembleState::ChunkData(remaining) => {
                    let take = remaining.min((input.len() - pos) as u64) as usize;
                    self.body.extend_from_slice(&input[pos..pos + take]);
                    pos += take;
                    let left = remaining - take as u64;
                    match self.state {
                        AssembleState::BodyFixed(_) => {
                            if left == 0 {
                                done.push(self.take_message());
                            } else {
                                self.state = AssembleState::BodyFixed(left);
                            }
                        }
                        _ => {
                            if left == 0 {
                                self.state = AssembleState::ChunkEnd;
                            } else {
                                self.state = AssembleState::ChunkData(left);
                            }
                        }
                    }
                }
                _ => {
                    let Some(nl) = input[pos..].iter().position(|b| *b == b'\n') else {
                        self.line.extend_from_slice(&input[pos..]);
                        break;
                    };
                    self.line.extend_from_slice(&input[pos..=pos + nl]);
                    pos += nl + 1;
                    let line = std::mem::take(&mut self.line);
                    if let Some(message) = self.handle_line(&line) {
                        done.push(message);
                    }
                }
            }
        }

        done
    }

    fn handle_line(&mut self, line: &[u8]) -> Option<AssembledMessage> {
        let text = String::from_utf8_lossy(line);
        let trimmed = text.trim_end_matches(['\r', '\n']);

        match self.state {
            AssembleState::Head => {
                if trimmed.is_empty() {
                    return None;
                }
                self.head = trimmed.to_string();
                self.state = AssembleState::Headers;
                None
            }
            AssembleState::Headers => {
                if trimmed.is_empty() {
                    if self.chunked {
                        self.state = AssembleState::ChunkSize;
                        return None;
                    }
                    return match self.content_length {
                        Some(n) if n > 0 => {
                            self.state = AssembleState::BodyFixed(n);
                            None
                        }
                        _ => Some(self.take_message()),
                    };
                }
                if let Some((name, value)) = trimmed.split_once(':') {
                    let value = value.trim();
                    if name.eq_ignore_ascii_case("content-type") {
                        self.content_type = Some(value.to_string());
                    } else if name.eq_ignore_ascii_case("content-length") {
                        self.content_length = value.parse().ok();
                    } else if name.eq_ignore_ascii_case("transfer-encoding")
                        && value.to_ascii_lowercase().contains("chunked")
                    {
                        self.chunked = true;
                    }
                }
                self.headers.push(trimmed.to_string());
                None
            }
            AssembleState::ChunkSize => {
                let size = trimmed
                    .split(';')
                    .next()
                    .and_then(|s| u64::from_str_radix(s.trim(), 16).ok());
                match size {
                    Some(0) => self.state = AssembleState::Trailers,
                    Some(n) => self.state = AssembleState::ChunkData(n),
                    None => *self = Self::new(),
                }
                None
            }
            AssembleState::ChunkEnd => {
                self.state = AssembleState::ChunkSize;
                None
            }
            AssembleState::Trailers => {
                if trimmed.is_empty() {
                    return Some(self.take_message());
                }
                None
            }
            AssembleState::BodyFixed(_) | AssembleState::ChunkData(_) => None,
        }
    }

    fn take_message(&mut self) -> AssembledMessage {
        let message = AssembledMessage {
            head: std::mem::take(&mut self.head),
            headers: std::mem::take(&mut self.headers),
            body: std::mem::take(&mut self.body),
            content_type: self.content_type.take(),
        };
        self.content_length = None;
        self.chunked = false;
        self.state = AssembleState::Head;
        message
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_headers_only_message_completes() {
        let mut assembler = MessageAssembler::new();
        let messages = assembler.feed(b"GET /x HTTP/1.1\r\nHost: localhost\r\n\r\n");
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].head, "GET /x HTTP/1.1");
        assert_eq!(messages[0].headers, vec!["Host: localhost".to_string()]);
        assert!(messages[0].body.is_empty());
    }

    #[test]
    fn test_fixed_body_split_across_feeds() {
        let mut assembler = MessageAssembler::new();
        assert!(assembler
            .feed(b"HTTP/1.1 200 OK\r\nContent-Length: 5\r\n\r\nhel")
            .is_empty());
        let messages = assembler.feed(b"lo");
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].body, b"hello");
    }

    #[test]
    fn test_chunked_body_assembled() {
        let mut assembler = MessageAssembler::new();
        let messages = assembler.feed(
            b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n4\r\nwiki\r\n3\r\nped\r\n0\r\n\r\n",
        );
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].body, b"wikiped");
    }

    #[test]
    fn test_content_type_captured() {
        let mut assembler = MessageAssembler::new();
        let messages =
            assembler.feed(b"HTTP/1.1 200 OK\r\nContent-Type: image/png\r\nContent-Length: 1\r\n\r\nx");
        assert_eq!(messages[0].content_type.as_deref(), Some("image/png"));
    }

    #[test]
    fn test_sidecar_extension_from_content_type() {
        assert_eq!(sidecar_extension(Some("image/png")), "png");
        assert_eq!(sidecar_extension(Some("image/jpeg; charset=binary")), "jpg");
        assert_eq!(sidecar_extension(Some("application/octet-stream")), "bin");
        assert_eq!(sidecar_extension(None), "bin");
    }

    #[test]
    fn test_binary_body_goes_to_sidecar() {
        let message = AssembledMessage {
            head: "HTTP/1.1 200 OK".to_string(),
            headers: vec![],
            body: vec![0xff, 0xfe, 0x00],
            content_type: Some("image/png".to_string()),
        };
        assert!(text_body(&message).is_none());
    }

    #[test]
    fn test_dump_files_written() {
        let dir = tempfile::tempdir().unwrap();
        let mut writer = DumpWriter::new(dir.path().to_path_buf(), "abc".to_string());
        let message = AssembledMessage {
            head: "GET / HTTP/1.1".to_string(),
            headers: vec!["Host: localhost".to_string()],
            body: b"{}".to_vec(),
            content_type: Some("application/json".to_string()),
        };
        writer.write(Direction::Request, &message);

        let names: Vec<String> = fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names.len(), 1);
        assert!(names[0].starts_with("abc."));
        assert!(names[0].ends_with(".req.yaml"));
    }
}
