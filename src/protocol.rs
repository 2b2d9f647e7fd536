use std::fmt;
use std::io::{self, Read, Write};
use std::io::ErrorKind::{ConnectionReset, Interrupted, InvalidInput};

use crate::error::{ClientError, Result};

/// Marks the end of every logical message on both channels.
/// Payloads containing it cannot be framed; nothing escapes it.
pub const END_OF_MESSAGE: &str = "||";

pub const RECV_CHUNK_SIZE: usize = 1024;
/// The ack is a bare verb or a short error line, read in one go.
pub const ACK_BUFF_SIZE: usize = 1024;

pub const VERB_LIST: &str = "-l";
pub const VERB_GET: &str = "-g";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    List,
    Get { filename: String },
}

impl Command {
    pub fn verb(&self) -> &'static str {
        match self {
            Command::List => VERB_LIST,
            Command::Get { .. } => VERB_GET,
        }
    }

    /// Parses an unframed command line as the server receives it.
    pub fn parse(text: &str) -> Option<Command> {
        let mut words = text.split_whitespace();
        match (words.next(), words.next(), words.next()) {
            (Some(VERB_LIST), None, None) => Some(Command::List),
            (Some(VERB_GET), Some(name), None) => Some(Command::Get { filename: name.to_string() }),
            _ => None,
        }
    }

    /// True when `response` is the ack for this command rather than an error.
    pub fn is_acked_by(&self, response: &str) -> bool {
        strip_delimiter(response).split_whitespace().next() == Some(self.verb())
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Command::List => f.write_str(VERB_LIST),
            Command::Get { filename } => write!(f, "{} {}", VERB_GET, filename),
        }
    }
}

/// Where the server should dial back for the data connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EndpointAddress {
    host: String,
    port: u16,
}

impl EndpointAddress {
    pub fn new(host: impl Into<String>, port: u16) -> Result<EndpointAddress> {
        if port == 0 {
            return Err(ClientError::Argument(
                "callback port must be between 1 and 65535".to_string(),
            ));
        }
        Ok(EndpointAddress { host: host.into(), port })
    }

    /// Parses an unframed `<host> <port>` callback line.
    pub fn parse(text: &str) -> Option<EndpointAddress> {
        let mut words = text.split_whitespace();
        let host = words.next()?;
        let port = words.next()?.parse::<u16>().ok()?;
        if words.next().is_some() {
            return None;
        }
        EndpointAddress::new(host, port).ok()
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }
}

impl fmt::Display for EndpointAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.host, self.port)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransferResult {
    Listing { text: String },
    FileContents { filename: String, bytes: String },
}

/// Text messages that travel delimiter-framed over a socket.
pub trait TcpShovable: fmt::Display {
    fn shove<W: Write>(&self, stream: &mut W) -> io::Result<usize> {
        let buf = encode(self.to_string().as_bytes());
        stream.write_all(&buf)?;
        stream.flush()?;
        Ok(buf.len())
    }
}

impl TcpShovable for Command {}
impl TcpShovable for EndpointAddress {}

pub fn encode(payload: &[u8]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(payload.len() + END_OF_MESSAGE.len());
    buf.extend_from_slice(payload);
    buf.extend_from_slice(END_OF_MESSAGE.as_bytes());
    buf
}

/// Reads `stream` in `chunk_size` pieces until the delimiter shows up or the
/// peer closes, then returns the text with the trailing delimiter trimmed.
/// A close without a delimiter still counts as a complete message.
pub fn decode<R: Read>(stream: &mut R, chunk_size: usize) -> io::Result<String> {
    if chunk_size == 0 {
        return Err(io::Error::new(InvalidInput, "chunk size must be positive"));
    }
    let delim = END_OF_MESSAGE.as_bytes();
    let mut message: Vec<u8> = Vec::new();
    let mut chunk = vec![0u8; chunk_size];
    loop {
        let n = match stream.read(&mut chunk) {
            Ok(n) => n,
            Err(e) if e.kind() == Interrupted => continue,
            Err(e) if e.kind() == ConnectionReset => {
                tracing::warn!("connection reset by peer, treating as end of message");
                0
            }
            Err(e) => return Err(e),
        };
        if n == 0 {
            tracing::debug!(bytes = message.len(), "peer closed before delimiter");
            break;
        }
        // a delimiter split across reads begins inside the previous tail
        let scan_from = message.len().saturating_sub(delim.len() - 1);
        message.extend_from_slice(&chunk[..n]);
        if contains(&message[scan_from..], delim) {
            break;
        }
    }
    let text = String::from_utf8_lossy(&message);
    Ok(strip_delimiter(&text).to_string())
}

pub fn strip_delimiter(text: &str) -> &str {
    text.trim_end_matches('|')
}

fn contains(haystack: &[u8], needle: &[u8]) -> bool {
    haystack.windows(needle.len()).any(|w| w == needle)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;

    /// Hands out one scripted piece per read call.
    struct Scripted {
        pieces: VecDeque<Vec<u8>>,
        reads: usize,
    }

    impl Scripted {
        fn new(pieces: &[&str]) -> Scripted {
            Scripted {
                pieces: pieces.iter().map(|p| p.as_bytes().to_vec()).collect(),
                reads: 0,
            }
        }
    }

    impl Read for Scripted {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            self.reads += 1;
            match self.pieces.pop_front() {
                Some(piece) => {
                    buf[..piece.len()].copy_from_slice(&piece);
                    Ok(piece.len())
                }
                None => Ok(0),
            }
        }
    }

    #[test]
    fn decode_strips_delimiter() {
        let mut stream: &[u8] = b"hello world||";
        assert_eq!(decode(&mut stream, RECV_CHUNK_SIZE).unwrap(), "hello world");
    }

    #[test]
    fn decode_finds_delimiter_split_across_reads() {
        let mut stream = Scripted::new(&["a.txt\nb.txt|", "|", "never read"]);
        assert_eq!(decode(&mut stream, 64).unwrap(), "a.txt\nb.txt");
        assert_eq!(stream.reads, 2);
    }

    #[test]
    fn decode_treats_close_as_end_of_message() {
        let mut stream = Scripted::new(&["partial ", "payload"]);
        assert_eq!(decode(&mut stream, 64).unwrap(), "partial payload");
    }

    #[test]
    fn decode_works_with_single_byte_chunks() {
        let framed = encode(b"line one\nline two\n");
        let mut stream: &[u8] = &framed;
        assert_eq!(decode(&mut stream, 1).unwrap(), "line one\nline two\n");
    }

    #[test]
    fn decode_rejects_zero_chunk_size() {
        let mut stream: &[u8] = b"x||";
        assert_eq!(decode(&mut stream, 0).unwrap_err().kind(), InvalidInput);
    }

    #[test]
    fn framing_round_trips() {
        for payload in ["", "plain", "with spaces and\nnewlines\n", "pipe | alone", "ünïcödé"] {
            let framed = encode(payload.as_bytes());
            let mut stream: &[u8] = &framed;
            assert_eq!(decode(&mut stream, 3).unwrap(), payload);
        }
    }

    #[test]
    fn command_wire_text() {
        assert_eq!(Command::List.to_string(), "-l");
        let get = Command::Get { filename: "report.txt".into() };
        assert_eq!(get.to_string(), "-g report.txt");

        let mut sent = Vec::new();
        get.shove(&mut sent).unwrap();
        assert_eq!(sent, b"-g report.txt||");
    }

    #[test]
    fn command_parse() {
        assert_eq!(Command::parse("-l"), Some(Command::List));
        assert_eq!(
            Command::parse("-g notes.txt"),
            Some(Command::Get { filename: "notes.txt".into() })
        );
        assert_eq!(Command::parse("-g"), None);
        assert_eq!(Command::parse("-l extra"), None);
        assert_eq!(Command::parse("-x"), None);
    }

    #[test]
    fn ack_compares_verb_only() {
        let get = Command::Get { filename: "missing.txt".into() };
        assert!(get.is_acked_by("-g"));
        assert!(!get.is_acked_by("-l"));
        assert!(!get.is_acked_by("File not found||"));
        assert!(!get.is_acked_by(""));
        assert!(Command::List.is_acked_by("-l"));
    }

    #[test]
    fn endpoint_address() {
        let addr = EndpointAddress::new("client.example.com", 5000).unwrap();
        assert_eq!(addr.to_string(), "client.example.com 5000");
        assert_eq!(EndpointAddress::parse("client.example.com 5000"), Some(addr));
        assert!(EndpointAddress::new("host", 0).is_err());
        assert_eq!(EndpointAddress::parse("host 70000"), None);
        assert_eq!(EndpointAddress::parse("host"), None);
    }
}
