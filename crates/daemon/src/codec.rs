// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Wire codec for the line-oriented status protocol.
//!
//! One logical message is terminated by the sender's half-close, or framed by
//! a `size:N` header, or carried inside a `compress:<algo> N` frame. Container
//! messages (`combo`, `extcombo`, `combodata`) hold several sub-messages in
//! one buffer; the codec slices them out and the dispatcher re-enters itself
//! per sub-message.

use std::io::Read;

/// Hard ceiling on any single message, framed or not.
pub const DEFAULT_MAX_MSG_SIZE: usize = 10 * 1024 * 1024;

#[derive(Debug, PartialEq, Eq, thiserror::Error)]
pub enum CodecError {
    #[error("message size {declared} exceeds ceiling {ceiling}")]
    Oversize { declared: usize, ceiling: usize },
    #[error("bad frame: {0}")]
    BadFrame(String),
    #[error("inflate failed: {0}")]
    Inflate(String),
}

/// How the start of a buffer says the rest of the message is framed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Framing {
    /// No framing header; the message ends at half-close.
    Plain,
    /// `size:N\n` — exactly `body` bytes follow the header.
    Sized { header_len: usize, body: usize },
    /// `compress:<algo> N\n` — compressed payload inflating to `inflated` bytes.
    Compressed { header_len: usize, algo: String, inflated: usize },
}

impl Framing {
    /// Detect a framing header at the start of `buf`. Returns `None` while the
    /// header line is still incomplete.
    pub fn detect(buf: &[u8]) -> Option<Result<Framing, CodecError>> {
        if buf.starts_with(b"size:") {
            let eol = buf.iter().position(|&b| b == b'\n')?;
            let line = String::from_utf8_lossy(&buf[5..eol]);
            return Some(match line.trim().parse::<usize>() {
                Ok(n) => Ok(Framing::Sized { header_len: eol + 1, body: n }),
                Err(_) => Err(CodecError::BadFrame(format!("bad size header {line:?}"))),
            });
        }
        if buf.starts_with(b"compress:") {
            let eol = buf.iter().position(|&b| b == b'\n')?;
            let line = String::from_utf8_lossy(&buf[9..eol]).trim().to_owned();
            let mut it = line.split_ascii_whitespace();
            let algo = it.next().unwrap_or_default().to_owned();
            let size = it.next().and_then(|t| t.parse::<usize>().ok());
            return Some(match size {
                Some(n) if !algo.is_empty() => {
                    Ok(Framing::Compressed { header_len: eol + 1, algo, inflated: n })
                }
                _ => Err(CodecError::BadFrame(format!("bad compress header {line:?}"))),
            });
        }
        // A header can only be pending if the buffer is still a prefix of one.
        if b"size:".starts_with(buf) || b"compress:".starts_with(buf) {
            return None;
        }
        Some(Ok(Framing::Plain))
    }
}

/// Inflate a `compress:` payload, validating the declared size against the
/// ceiling before touching the data and against the actual output after.
pub fn inflate(algo: &str, data: &[u8], declared: usize, ceiling: usize) -> Result<Vec<u8>, CodecError> {
    if declared > ceiling {
        return Err(CodecError::Oversize { declared, ceiling });
    }
    let mut out = Vec::with_capacity(declared.min(ceiling));
    let n = match algo {
        "zlib" => flate2::read::ZlibDecoder::new(data)
            .take(ceiling as u64 + 1)
            .read_to_end(&mut out)
            .map_err(|e| CodecError::Inflate(e.to_string()))?,
        "gzip" => flate2::read::GzDecoder::new(data)
            .take(ceiling as u64 + 1)
            .read_to_end(&mut out)
            .map_err(|e| CodecError::Inflate(e.to_string()))?,
        other => return Err(CodecError::BadFrame(format!("unknown compression {other:?}"))),
    };
    if n != declared {
        return Err(CodecError::Inflate(format!("expected {declared} bytes, got {n}")));
    }
    Ok(out)
}

// -- Newline encoding ---------------------------------------------------------

/// Encode a multi-line string into a single pipe-safe field.
pub fn nlencode(msg: &str) -> String {
    let mut out = String::with_capacity(msg.len());
    for ch in msg.chars() {
        match ch {
            '|' => out.push_str("\\p"),
            '\\' => out.push_str("\\\\"),
            '\t' => out.push_str("\\t"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            c => out.push(c),
        }
    }
    out
}

/// Inverse of [`nlencode`].
pub fn nldecode(msg: &str) -> String {
    let mut out = String::with_capacity(msg.len());
    let mut it = msg.chars();
    while let Some(ch) = it.next() {
        if ch != '\\' {
            out.push(ch);
            continue;
        }
        match it.next() {
            Some('p') => out.push('|'),
            Some('\\') => out.push('\\'),
            Some('t') => out.push('\t'),
            Some('n') => out.push('\n'),
            Some('r') => out.push('\r'),
            Some(c) => {
                out.push('\\');
                out.push(c);
            }
            None => out.push('\\'),
        }
    }
    out
}

// -- Small parsing helpers ----------------------------------------------------

/// Parse a duration token into minutes. A plain number is minutes; `h`, `d`
/// and `w` suffixes scale to hours, days and weeks ( `m` is accepted too).
pub fn duration_minutes(tok: &str) -> Option<i64> {
    let tok = tok.trim();
    if tok.is_empty() {
        return None;
    }
    let (num, mult) = match tok.as_bytes()[tok.len() - 1] {
        b'm' => (&tok[..tok.len() - 1], 1),
        b'h' => (&tok[..tok.len() - 1], 60),
        b'd' => (&tok[..tok.len() - 1], 24 * 60),
        b'w' => (&tok[..tok.len() - 1], 7 * 24 * 60),
        _ => (tok, 1),
    };
    num.parse::<i64>().ok().map(|n| n * mult)
}

/// First line of a message, without the newline.
pub fn first_line(msg: &str) -> &str {
    msg.split('\n').next().unwrap_or("")
}

/// Split the verb token into its base verb and optional `+suffix`
/// (`status+10` → `("status", Some("10"))`).
pub fn split_verb(token: &str) -> (&str, Option<&str>) {
    match token.split_once('+') {
        Some((v, suffix)) => (v, Some(suffix)),
        None => (token, None),
    }
}

/// A parsed `host.test` logical address. Dots inside hostnames travel as
/// commas on the wire; the codec reverses that here.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Address {
    pub host: String,
    pub test: String,
}

/// Parse an address token. The test name follows the last dot; everything
/// before it is the hostname with commas restored to dots.
pub fn parse_address(token: &str) -> Option<Address> {
    let (host, test) = token.rsplit_once('.')?;
    if host.is_empty() || test.is_empty() {
        return None;
    }
    Some(Address { host: host.replace(',', "."), test: test.to_owned() })
}

/// Extract the bracketed test-flags marker from a status first line. The
/// flags sit in an HTML comment right after the color token and are kept
/// verbatim.
pub fn extract_test_flags(line1: &str) -> Option<&str> {
    let start = line1.find("<!-- [flags:")? + "<!-- [flags:".len();
    let end = line1[start..].find(']')?;
    Some(&line1[start..start + end])
}

// -- Container messages -------------------------------------------------------

/// Split a `combo`/`combodata` container into sub-messages. Sub-messages are
/// separated by a blank line followed by the contained keyword.
pub fn split_combo<'a>(body: &'a str, keyword: &str) -> Vec<&'a str> {
    let sep = format!("\n\n{keyword}");
    let mut parts = Vec::new();
    let mut rest = body;
    loop {
        match rest.find(&sep) {
            Some(pos) => {
                parts.push(&rest[..pos + 1]); // keep the terminating newline
                rest = &rest[pos + 2..];
            }
            None => {
                if !rest.is_empty() {
                    parts.push(rest);
                }
                return parts;
            }
        }
    }
}

/// Slice an `extcombo` container into its sub-messages. The first line names
/// a start offset and a sequence of end offsets, all absolute within `buf`;
/// each consecutive pair is one sub-message. Slices are returned unmodified.
pub fn split_extcombo(buf: &[u8]) -> Result<Vec<&[u8]>, CodecError> {
    let eol = buf
        .iter()
        .position(|&b| b == b'\n')
        .ok_or_else(|| CodecError::BadFrame("extcombo without offset line".into()))?;
    let line = String::from_utf8_lossy(&buf[..eol]);
    let mut toks = line.split_ascii_whitespace();
    let _verb = toks.next();
    let mut start: usize = toks
        .next()
        .and_then(|t| t.parse().ok())
        .ok_or_else(|| CodecError::BadFrame("extcombo missing start offset".into()))?;
    if start == 0 || start >= buf.len() {
        return Err(CodecError::BadFrame(format!("invalid extcombo start offset {start}")));
    }
    let mut parts = Vec::new();
    for tok in toks {
        let end: usize = tok
            .parse()
            .map_err(|_| CodecError::BadFrame(format!("bad extcombo offset {tok:?}")))?;
        if end <= start || end > buf.len() {
            return Err(CodecError::BadFrame(format!("invalid extcombo end offset {end}")));
        }
        parts.push(&buf[start..end]);
        start = end;
    }
    Ok(parts)
}

#[cfg(test)]
#[path = "codec_tests.rs"]
mod tests;
