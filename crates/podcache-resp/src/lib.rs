// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! RESP command framing for PodCache.
//!
//! Clients send commands as RESP arrays of bulk strings:
//!
//! ```text
//! *<n>\r\n  $<len>\r\n<bytes>\r\n  ...repeated n times
//! ```
//!
//! [`parse_command`] consumes exactly one such frame from the front of a
//! receive buffer and distinguishes three outcomes the connection loop cares
//! about: a complete command (with the number of bytes consumed), incomplete
//! input (read more, keep the buffer), and malformed input (discard the
//! buffer). Replies travel the other way through the fixed formatter set in
//! [`reply`].
#![forbid(unsafe_code)]
#![deny(missing_docs, rust_2018_idioms, unused_must_use)]
#![deny(
    clippy::all,
    clippy::pedantic,
    clippy::nursery,
    clippy::cargo,
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::panic,
    clippy::todo,
    clippy::unimplemented,
    clippy::dbg_macro,
    clippy::print_stdout,
    clippy::print_stderr
)]
#![allow(
    clippy::must_use_candidate,
    clippy::return_self_not_must_use,
    clippy::unreadable_literal,
    clippy::missing_const_for_fn,
    clippy::suboptimal_flops,
    clippy::redundant_pub_crate,
    clippy::many_single_char_names,
    clippy::module_name_repetitions,
    clippy::use_self
)]

/// Maximum number of elements in one command array.
pub const MAX_ARGS: usize = 100;
/// Maximum length of one bulk string (1 MiB).
pub const MAX_BULK_LEN: usize = 1024 * 1024;

/// A frame that can never be completed by reading more bytes.
///
/// The connection loop responds by discarding everything it has buffered;
/// per-frame resynchronization is not attempted.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("[RESP_MALFORMED] {0}")]
pub struct WireError(&'static str);

/// One parsed client command: a name and its argument vector.
///
/// Any element of the array may be a RESP null bulk string (`$-1`); nulls are
/// legal framing but carry no bytes, so they surface as absent arguments.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Command {
    /// The first array element. `None` if the client sent a null there.
    pub name: Option<Vec<u8>>,
    /// The remaining elements, in order.
    pub args: Vec<Option<Vec<u8>>>,
}

impl Command {
    /// Decode the command name, case-insensitively. A null or unrecognized
    /// name is [`CommandKind::Unknown`].
    pub fn kind(&self) -> CommandKind {
        self.name
            .as_deref()
            .map_or(CommandKind::Unknown, CommandKind::decode)
    }

    /// The `index`-th argument, if present and non-null.
    pub fn arg(&self, index: usize) -> Option<&[u8]> {
        self.args.get(index).and_then(|a| a.as_deref())
    }

    /// Number of arguments (null elements included).
    pub fn arg_count(&self) -> usize {
        self.args.len()
    }
}

/// The recognized command set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandKind {
    /// Liveness probe; replies `+PONG`.
    Ping,
    /// Close the connection after a `+BYE`.
    Quit,
    /// Store a value.
    Set,
    /// Fetch a value.
    Get,
    /// Remove a value.
    Del,
    /// Alias of `Del`.
    Unlink,
    /// Client-library handshake stub; always `+OK`.
    Client,
    /// Increment an integer value.
    Incr,
    /// Anything else.
    Unknown,
}

impl CommandKind {
    /// Case-insensitive lookup over the recognized command names.
    pub fn decode(name: &[u8]) -> Self {
        const TABLE: &[(&[u8], CommandKind)] = &[
            (b"PING", CommandKind::Ping),
            (b"QUIT", CommandKind::Quit),
            (b"SET", CommandKind::Set),
            (b"GET", CommandKind::Get),
            (b"DEL", CommandKind::Del),
            (b"UNLINK", CommandKind::Unlink),
            (b"CLIENT", CommandKind::Client),
            (b"INCR", CommandKind::Incr),
        ];
        for (candidate, kind) in TABLE {
            if name.eq_ignore_ascii_case(candidate) {
                return *kind;
            }
        }
        CommandKind::Unknown
    }
}

/// One bulk-string element: real bytes or the RESP null.
enum Bulk {
    Value(Vec<u8>),
    Null,
}

struct Cursor<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    fn read_byte(&mut self) -> Option<u8> {
        let byte = self.data.get(self.pos).copied();
        if byte.is_some() {
            self.pos += 1;
        }
        byte
    }

    /// Read a decimal integer terminated by `\r\n`. `Ok(None)` means the
    /// terminator has not arrived yet.
    fn read_integer(&mut self) -> Result<Option<i32>, WireError> {
        let Some(rel) = self.data[self.pos..].windows(2).position(|w| w == b"\r\n") else {
            return Ok(None);
        };
        let digits = &self.data[self.pos..self.pos + rel];
        let value = parse_i32(digits).ok_or(WireError("bad integer field"))?;
        self.pos += rel + 2;
        Ok(Some(value))
    }

    /// Read one bulk string (`$<len>\r\n<bytes>\r\n`). `Ok(None)` means the
    /// element is not fully buffered yet.
    fn read_bulk(&mut self) -> Result<Option<Bulk>, WireError> {
        match self.read_byte() {
            None => return Ok(None),
            Some(b'$') => {}
            Some(_) => return Err(WireError("expected bulk string")),
        }
        let Some(len) = self.read_integer()? else {
            return Ok(None);
        };
        if len == -1 {
            return Ok(Some(Bulk::Null));
        }
        let len = usize::try_from(len).map_err(|_| WireError("negative bulk length"))?;
        if len > MAX_BULK_LEN {
            return Err(WireError("bulk string too long"));
        }
        if self.data.len() - self.pos < len + 2 {
            return Ok(None);
        }
        let bytes = self.data[self.pos..self.pos + len].to_vec();
        if &self.data[self.pos + len..self.pos + len + 2] != b"\r\n" {
            return Err(WireError("bulk string not CRLF-terminated"));
        }
        self.pos += len + 2;
        Ok(Some(Bulk::Value(bytes)))
    }
}

/// Strict `i32` parse: optional `-`, ASCII digits only, no surrounding junk.
fn parse_i32(bytes: &[u8]) -> Option<i32> {
    if bytes.is_empty() || bytes.len() > 20 {
        return None;
    }
    let (negative, digits) = match bytes.first() {
        Some(b'-') => (true, &bytes[1..]),
        _ => (false, bytes),
    };
    if digits.is_empty() {
        return None;
    }
    let mut magnitude: i64 = 0;
    for &b in digits {
        if !b.is_ascii_digit() {
            return None;
        }
        magnitude = magnitude.checked_mul(10)?.checked_add(i64::from(b - b'0'))?;
        if magnitude > i64::from(i32::MAX) + 1 {
            return None;
        }
    }
    let value = if negative { -magnitude } else { magnitude };
    i32::try_from(value).ok()
}

/// Parse one command frame from the front of `buf`.
///
/// Returns `Ok(Some((command, consumed)))` for a complete frame, `Ok(None)`
/// when more bytes are needed, and `Err` when the buffered bytes can never
/// frame a valid command.
///
/// # Errors
///
/// Returns [`WireError`] on malformed framing: a missing `*` header, an
/// element count outside `[1, MAX_ARGS]`, a bulk length outside
/// `[-1, MAX_BULK_LEN]`, a non-integer length field, or a bulk string whose
/// payload is not terminated by `\r\n`.
pub fn parse_command(buf: &[u8]) -> Result<Option<(Command, usize)>, WireError> {
    // Shortest possible frame prefix is four bytes (`*1\r\n`).
    if buf.len() < 4 {
        return Ok(None);
    }
    let mut cur = Cursor::new(buf);
    match cur.read_byte() {
        Some(b'*') => {}
        _ => return Err(WireError("expected array header")),
    }
    let Some(count) = cur.read_integer()? else {
        return Ok(None);
    };
    let count = usize::try_from(count).map_err(|_| WireError("element count out of range"))?;
    if count == 0 || count > MAX_ARGS {
        return Err(WireError("element count out of range"));
    }

    let mut elements = Vec::with_capacity(count);
    for _ in 0..count {
        let Some(bulk) = cur.read_bulk()? else {
            return Ok(None);
        };
        elements.push(match bulk {
            Bulk::Value(bytes) => Some(bytes),
            Bulk::Null => None,
        });
    }

    let mut elements = elements.into_iter();
    let name = elements.next().flatten();
    let args = elements.collect();
    Ok(Some((Command { name, args }, cur.pos)))
}

/// Reply formatters: the four RESP reply shapes the server produces.
pub mod reply {
    /// Simple string: `+<text>\r\n`.
    pub fn simple(text: &str) -> Vec<u8> {
        format!("+{text}\r\n").into_bytes()
    }

    /// Error: `-ERR <text>\r\n`.
    pub fn error(text: &str) -> Vec<u8> {
        format!("-ERR {text}\r\n").into_bytes()
    }

    /// Integer: `:<decimal>\r\n`.
    pub fn integer(value: i64) -> Vec<u8> {
        format!(":{value}\r\n").into_bytes()
    }

    /// Bulk string (`$<len>\r\n<bytes>\r\n`), or the null bulk `$-1\r\n`.
    pub fn bulk(value: Option<&[u8]>) -> Vec<u8> {
        match value {
            None => b"$-1\r\n".to_vec(),
            Some(bytes) => {
                let mut out = Vec::with_capacity(bytes.len() + 16);
                out.extend_from_slice(format!("${}\r\n", bytes.len()).as_bytes());
                out.extend_from_slice(bytes);
                out.extend_from_slice(b"\r\n");
                out
            }
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn frame(parts: &[&[u8]]) -> Vec<u8> {
        let mut out = format!("*{}\r\n", parts.len()).into_bytes();
        for part in parts {
            out.extend_from_slice(format!("${}\r\n", part.len()).as_bytes());
            out.extend_from_slice(part);
            out.extend_from_slice(b"\r\n");
        }
        out
    }

    #[test]
    fn parses_ping() {
        let buf = frame(&[b"PING"]);
        let (cmd, consumed) = parse_command(&buf).unwrap().unwrap();
        assert_eq!(consumed, buf.len());
        assert_eq!(cmd.kind(), CommandKind::Ping);
        assert_eq!(cmd.arg_count(), 0);
    }

    #[test]
    fn parses_set_with_binary_value() {
        let value = [0u8, 1, 2, 255, 13, 10, 0];
        let buf = frame(&[b"SET", b"mykey", &value]);
        let (cmd, consumed) = parse_command(&buf).unwrap().unwrap();
        assert_eq!(consumed, buf.len());
        assert_eq!(cmd.kind(), CommandKind::Set);
        assert_eq!(cmd.arg(0), Some(&b"mykey"[..]));
        assert_eq!(cmd.arg(1), Some(&value[..]));
    }

    #[test]
    fn round_trip_preserves_name_and_args() {
        let buf = frame(&[b"SET", b"k", b"v", b"extra"]);
        let (cmd, consumed) = parse_command(&buf).unwrap().unwrap();
        assert_eq!(consumed, buf.len());
        assert_eq!(cmd.name.as_deref(), Some(&b"SET"[..]));
        let args: Vec<_> = (0..cmd.arg_count()).map(|i| cmd.arg(i).unwrap()).collect();
        assert_eq!(args, vec![&b"k"[..], &b"v"[..], &b"extra"[..]]);
    }

    #[test]
    fn command_names_are_case_insensitive() {
        for name in [&b"get"[..], b"Get", b"GET", b"gEt"] {
            let buf = frame(&[name, b"k"]);
            let (cmd, _) = parse_command(&buf).unwrap().unwrap();
            assert_eq!(cmd.kind(), CommandKind::Get);
        }
        let (cmd, _) = parse_command(&frame(&[b"FLUSHALL"])).unwrap().unwrap();
        assert_eq!(cmd.kind(), CommandKind::Unknown);
    }

    #[test]
    fn incomplete_frames_request_more_bytes() {
        let buf = frame(&[b"SET", b"mykey", b"myvalue"]);
        for cut in 0..buf.len() {
            assert_eq!(
                parse_command(&buf[..cut]).unwrap(),
                None,
                "prefix of {cut} bytes should be incomplete"
            );
        }
    }

    #[test]
    fn consumes_one_frame_and_leaves_the_rest() {
        let mut buf = frame(&[b"PING"]);
        let second = frame(&[b"GET", b"k"]);
        buf.extend_from_slice(&second);
        let (cmd, consumed) = parse_command(&buf).unwrap().unwrap();
        assert_eq!(cmd.kind(), CommandKind::Ping);
        assert_eq!(&buf[consumed..], &second[..]);
    }

    #[test]
    fn null_elements_are_absent_arguments() {
        let buf = b"*2\r\n$3\r\nGET\r\n$-1\r\n";
        let (cmd, consumed) = parse_command(buf).unwrap().unwrap();
        assert_eq!(consumed, buf.len());
        assert_eq!(cmd.kind(), CommandKind::Get);
        assert_eq!(cmd.arg_count(), 1);
        assert_eq!(cmd.arg(0), None);
    }

    #[test]
    fn null_command_name_is_unknown() {
        let buf = b"*1\r\n$-1\r\n";
        let (cmd, _) = parse_command(buf).unwrap().unwrap();
        assert_eq!(cmd.kind(), CommandKind::Unknown);
    }

    #[test]
    fn rejects_missing_array_header() {
        assert!(parse_command(b"PING\r\n").is_err());
    }

    #[test]
    fn rejects_element_count_out_of_range() {
        assert!(parse_command(b"*0\r\n").is_err());
        assert!(parse_command(b"*-3\r\n").is_err());
        assert!(parse_command(b"*101\r\n").is_err());
    }

    #[test]
    fn rejects_bad_length_fields() {
        assert!(parse_command(b"*1\r\n$abc\r\n").is_err());
        assert!(parse_command(b"*1\r\n$-2\r\n").is_err());
        assert!(parse_command(b"*1\r\n$1048577\r\n").is_err());
        // Exceeds i32 entirely.
        assert!(parse_command(b"*1\r\n$99999999999\r\n").is_err());
    }

    #[test]
    fn rejects_unterminated_bulk_payload() {
        assert!(parse_command(b"*1\r\n$4\r\nPINGXX").is_err());
    }

    #[test]
    fn bulk_payload_may_contain_crlf() {
        let value = b"line1\r\nline2";
        let buf = frame(&[b"SET", b"k", value]);
        let (cmd, consumed) = parse_command(&buf).unwrap().unwrap();
        assert_eq!(consumed, buf.len());
        assert_eq!(cmd.arg(1), Some(&value[..]));
    }

    #[test]
    fn formats_replies() {
        assert_eq!(reply::simple("PONG"), b"+PONG\r\n");
        assert_eq!(reply::error("unknown command"), b"-ERR unknown command\r\n");
        assert_eq!(reply::integer(42), b":42\r\n");
        assert_eq!(reply::integer(-1), b":-1\r\n");
        assert_eq!(reply::bulk(Some(b"myvalue")), b"$7\r\nmyvalue\r\n");
        assert_eq!(reply::bulk(Some(b"")), b"$0\r\n\r\n");
        assert_eq!(reply::bulk(None), b"$-1\r\n");
    }
}
