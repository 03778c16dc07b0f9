//! Append-only log wire codec (spec §4.2.1): length-prefixed arrays of bulk
//! strings, the same framing the line protocol uses for commands, so a
//! shrunk or replayed log is just a concatenation of command frames.
//!
//! `*N\r\n` followed by N bulk strings `$len\r\nbytes\r\n`. Zero bytes
//! between commands are tolerated and skipped during load.

use std::io::{self, Read};

/// Encode a command's argument list as one AOL frame.
pub fn encode_frame(args: &[String]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(32 + args.iter().map(|a| a.len() + 16).sum::<usize>());
    buf.extend_from_slice(format!("*{}\r\n", args.len()).as_bytes());
    for arg in args {
        buf.extend_from_slice(format!("${}\r\n", arg.len()).as_bytes());
        buf.extend_from_slice(arg.as_bytes());
        buf.extend_from_slice(b"\r\n");
    }
    buf
}

#[derive(Debug)]
pub enum DecodeError {
    /// Not enough bytes yet to decode a full frame starting at this offset;
    /// the caller should stop and, on EOF, truncate to this offset.
    Incomplete,
    /// The bytes at this offset don't look like a frame at all.
    Malformed,
}

/// Decode one frame from `buf` starting at offset 0. Returns the argument
/// list and the number of bytes consumed, or a `DecodeError`.
pub fn decode_frame(buf: &[u8]) -> Result<(Vec<String>, usize), DecodeError> {
    let mut pos = 0usize;
    // tolerate stray NUL padding between frames (spec §4.2.1)
    while buf.get(pos) == Some(&0u8) {
        pos += 1;
    }
    if pos >= buf.len() {
        return Err(DecodeError::Incomplete);
    }
    if buf[pos] != b'*' {
        return Err(DecodeError::Malformed);
    }
    let start = pos;
    pos += 1;
    let (count, consumed) = read_line_number(&buf[pos..])?;
    pos += consumed;
    let mut args = Vec::with_capacity(count);
    for _ in 0..count {
        if buf.get(pos) != Some(&b'$') {
            return Err(DecodeError::Malformed);
        }
        pos += 1;
        let (len, consumed) = read_line_number(&buf[pos..])?;
        pos += consumed;
        if pos + len + 2 > buf.len() {
            return Err(DecodeError::Incomplete);
        }
        let bytes = &buf[pos..pos + len];
        let s = String::from_utf8(bytes.to_vec()).map_err(|_| DecodeError::Malformed)?;
        pos += len;
        if &buf[pos..pos + 2] != b"\r\n" {
            return Err(DecodeError::Malformed);
        }
        pos += 2;
        args.push(s);
    }
    Ok((args, pos - start))
}

fn read_line_number(buf: &[u8]) -> Result<(usize, usize), DecodeError> {
    let nl = buf.iter().position(|&b| b == b'\n').ok_or(DecodeError::Incomplete)?;
    if nl == 0 || buf[nl - 1] != b'\r' {
        return Err(DecodeError::Malformed);
    }
    let digits = std::str::from_utf8(&buf[..nl - 1]).map_err(|_| DecodeError::Malformed)?;
    let n: usize = digits.parse().map_err(|_| DecodeError::Malformed)?;
    Ok((n, nl + 1))
}

/// Decode every complete frame in `buf`. Returns the frames and the offset
/// of the first incomplete/malformed tail, which the caller truncates to
/// (spec §4.2.2 "truncate the file to the last complete command boundary").
pub fn decode_all(buf: &[u8]) -> (Vec<Vec<String>>, usize) {
    let mut frames = Vec::new();
    let mut offset = 0usize;
    loop {
        match decode_frame(&buf[offset..]) {
            Ok((args, consumed)) => {
                frames.push(args);
                offset += consumed;
            }
            Err(_) => break,
        }
    }
    (frames, offset)
}

/// Read a file fully into memory; used by both load-on-startup and the
/// follower resync's local-truncation scan.
pub fn read_all(mut r: impl Read) -> io::Result<Vec<u8>> {
    let mut buf = Vec::new();
    r.read_to_end(&mut buf)?;
    Ok(buf)
}

/// Walk backwards from `from` looking for the nearest `*` byte that begins a
/// frame decoding cleanly through to `from` — the follower resync's
/// "round to the nearest command boundary" step (spec §4.2.6).
pub fn nearest_command_boundary(buf: &[u8], from: usize) -> usize {
    let mut pos = from.min(buf.len());
    while pos > 0 {
        pos -= 1;
        if buf[pos] == b'*'
            && let Ok((_, consumed)) = decode_frame(&buf[pos..])
            && pos + consumed <= from
        {
            return pos;
        }
    }
    0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_a_frame() {
        let args = vec!["SET".to_string(), "fleet".to_string(), "t1".to_string()];
        let encoded = encode_frame(&args);
        let (decoded, consumed) = decode_frame(&encoded).unwrap();
        assert_eq!(decoded, args);
        assert_eq!(consumed, encoded.len());
    }

    #[test]
    fn truncates_on_partial_trailing_frame() {
        let args = vec!["PING".to_string()];
        let mut buf = encode_frame(&args);
        buf.extend_from_slice(b"*2\r\n$4\r\nPING"); // truncated second frame
        let (frames, offset) = decode_all(&buf);
        assert_eq!(frames.len(), 1);
        assert_eq!(offset, encode_frame(&args).len());
    }

    #[test]
    fn skips_stray_nul_padding() {
        let args = vec!["PING".to_string()];
        let mut buf = vec![0u8, 0u8];
        buf.extend_from_slice(&encode_frame(&args));
        let (frames, _) = decode_all(&buf);
        assert_eq!(frames, vec![args]);
    }
}
