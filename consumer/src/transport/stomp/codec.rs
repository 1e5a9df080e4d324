//! STOMP 1.2 wire codec
//!
//! ```text
//! COMMAND EOL
//! *(header EOL)
//! EOL
//! *OCTET NUL
//! *(EOL)
//! ```
//!
//! Bodies are delimited by `content-length` when present, otherwise by the
//! first NUL. Bare EOLs between frames (heart-beats) are skipped.

use super::frame::{Command, Frame};
use crate::error::TransportError;
use bytes::{Buf, BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

/// Upper bound of a single frame, headers included
pub const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

#[derive(Debug, Default)]
pub struct StompCodec;

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|w| w == needle)
}

/// End of the header block: index of the blank line and its length
fn header_block_end(buf: &[u8]) -> Option<(usize, usize)> {
    let mut start = 0;
    while let Some(pos) = buf[start..].iter().position(|&b| b == b'\n') {
        let line_end = start + pos;
        let next = line_end + 1;
        match buf.get(next) {
            Some(b'\n') => return Some((next, 1)),
            Some(b'\r') if buf.get(next + 1) == Some(&b'\n') => return Some((next, 2)),
            Some(_) => start = next,
            None => return None,
        }
    }
    None
}

fn unescape(value: &str) -> Result<String, TransportError> {
    let mut out = String::with_capacity(value.len());
    let mut chars = value.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('n') => out.push('\n'),
            Some('r') => out.push('\r'),
            Some('c') => out.push(':'),
            Some('\\') => out.push('\\'),
            other => {
                return Err(TransportError::Protocol(format!(
                    "invalid header escape '\\{}'",
                    other.map(String::from).unwrap_or_default()
                )));
            }
        }
    }
    Ok(out)
}

fn escape(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            ':' => out.push_str("\\c"),
            c => out.push(c),
        }
    }
    out
}

fn parse_head(head: &[u8]) -> Result<(Command, Vec<(String, String)>), TransportError> {
    let text = String::from_utf8_lossy(head);
    let mut lines = text.split('\n').map(|l| l.strip_suffix('\r').unwrap_or(l));

    let command: Command = lines
        .next()
        .ok_or_else(|| TransportError::Protocol("missing command".to_string()))?
        .parse()?;

    let mut headers = Vec::new();
    for line in lines.filter(|l| !l.is_empty()) {
        let (name, value) = line
            .split_once(':')
            .ok_or_else(|| TransportError::Protocol(format!("malformed header '{line}'")))?;
        if command.escapes_headers() {
            headers.push((unescape(name)?, unescape(value)?));
        } else {
            headers.push((name.to_string(), value.to_string()));
        }
    }
    Ok((command, headers))
}

impl Decoder for StompCodec {
    type Item = Frame;
    type Error = TransportError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Frame>, TransportError> {
        // heart-beats and trailing EOLs
        let skip = src
            .iter()
            .take_while(|&&b| b == b'\n' || b == b'\r')
            .count();
        src.advance(skip);
        if src.is_empty() {
            return Ok(None);
        }

        let Some((blank, blank_len)) = header_block_end(src) else {
            if src.len() > MAX_FRAME_LEN {
                return Err(TransportError::Protocol("frame headers too large".to_string()));
            }
            return Ok(None);
        };

        let (command, headers) = parse_head(&src[..blank])?;
        let body_start = blank + blank_len;

        let content_length = headers
            .iter()
            .find(|(k, _)| k == "content-length")
            .map(|(_, v)| {
                v.trim().parse::<usize>().map_err(|e| {
                    TransportError::Protocol(format!("invalid content-length '{v}': {e}"))
                })
            })
            .transpose()?;

        let body_len = match content_length {
            Some(len) => {
                if body_start + len + 1 > MAX_FRAME_LEN {
                    return Err(TransportError::Protocol(format!(
                        "frame of {len} bytes exceeds limit"
                    )));
                }
                if src.len() < body_start + len + 1 {
                    src.reserve(body_start + len + 1 - src.len());
                    return Ok(None);
                }
                if src[body_start + len] != 0 {
                    return Err(TransportError::Protocol(
                        "frame body not terminated by NUL".to_string(),
                    ));
                }
                len
            }
            None => match find(&src[body_start..], b"\0") {
                Some(len) => len,
                None if src.len() > MAX_FRAME_LEN => {
                    return Err(TransportError::Protocol("frame too large".to_string()));
                }
                None => return Ok(None),
            },
        };

        let mut frame_bytes = src.split_to(body_start + body_len + 1);
        frame_bytes.advance(body_start);
        frame_bytes.truncate(body_len);

        Ok(Some(Frame {
            command,
            headers,
            body: frame_bytes.freeze(),
        }))
    }
}

impl Encoder<Frame> for StompCodec {
    type Error = TransportError;

    fn encode(&mut self, frame: Frame, dst: &mut BytesMut) -> Result<(), TransportError> {
        let escaped = frame.command.escapes_headers();

        dst.put_slice(frame.command.as_str().as_bytes());
        dst.put_u8(b'\n');
        for (name, value) in &frame.headers {
            if escaped {
                dst.put_slice(escape(name).as_bytes());
                dst.put_u8(b':');
                dst.put_slice(escape(value).as_bytes());
            } else {
                dst.put_slice(name.as_bytes());
                dst.put_u8(b':');
                dst.put_slice(value.as_bytes());
            }
            dst.put_u8(b'\n');
        }
        if !frame.body.is_empty() && frame.headers.iter().all(|(k, _)| k != "content-length") {
            dst.put_slice(format!("content-length:{}\n", frame.body.len()).as_bytes());
        }
        dst.put_u8(b'\n');
        dst.put_slice(&frame.body);
        dst.put_u8(0);
        Ok(())
    }
}
