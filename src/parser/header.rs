//! RFC 5322 header parsing: folding, encoded-words (RFC 2047) and the
//! envelope summary extracted when a message is closed.

use std::borrow::Cow;

use tracing::warn;

use crate::model::address::EmailAddress;

/// Header fields copied into the mailbox index.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct HeaderSummary {
    /// Normalized sender, or the raw header text when it does not parse.
    pub from: String,
    /// One entry per address in `To:`, or the raw text as a single entry.
    pub to: Vec<String>,
    /// Decoded subject.
    pub subject: String,
}

/// Build a [`HeaderSummary`] from the start of a raw message.
///
/// Only the header block is examined; the body is ignored.
pub fn summarize_headers(raw_message: &[u8]) -> HeaderSummary {
    let header_end = find_header_end(raw_message).unwrap_or(raw_message.len());
    let text = header_text(&raw_message[..header_end]);
    let fields = Fields::parse(&text);

    let from = fields
        .get("from")
        .map(|raw| {
            EmailAddress::try_parse(&decode_encoded_words(raw))
                .map(|addr| addr.display())
                .unwrap_or_else(|| raw.to_string())
        })
        .unwrap_or_default();

    let to = fields
        .get("to")
        .map(|raw| match EmailAddress::try_parse_list(&decode_encoded_words(raw)) {
            Some(list) => list.iter().map(EmailAddress::display).collect(),
            None => vec![raw.to_string()],
        })
        .unwrap_or_default();

    let subject = fields
        .get("subject")
        .map(decode_encoded_words)
        .unwrap_or_default();

    HeaderSummary { from, to, subject }
}

/// Find the byte offset where headers end (position of the first blank line).
pub fn find_header_end(data: &[u8]) -> Option<usize> {
    (0..data.len().saturating_sub(1))
        .find(|&i| data[i..].starts_with(b"\n\n") || data[i..].starts_with(b"\r\n\r\n"))
}

/// Header bytes as text: UTF-8 when valid, Windows-1252 otherwise.
fn header_text(bytes: &[u8]) -> Cow<'_, str> {
    let bytes = bytes.strip_prefix(b"\xEF\xBB\xBF").unwrap_or(bytes);
    encoding_rs::UTF_8
        .decode_without_bom_handling_and_without_replacement(bytes)
        .unwrap_or_else(|| encoding_rs::WINDOWS_1252.decode_without_bom_handling(bytes).0)
}

/// Unfolded header fields in message order.
struct Fields<'a>(Vec<(&'a str, String)>);

impl<'a> Fields<'a> {
    fn parse(block: &'a str) -> Self {
        let mut fields: Vec<(&'a str, String)> = Vec::new();
        for line in block.lines() {
            if line.starts_with([' ', '\t']) {
                if let Some((_, value)) = fields.last_mut() {
                    value.push(' ');
                    value.push_str(line.trim());
                }
            } else if let Some((name, value)) = line.split_once(':') {
                fields.push((name.trim(), value.trim().to_string()));
            }
        }
        Self(fields)
    }

    /// First value of `name`, compared case-insensitively.
    fn get(&self, name: &str) -> Option<&str> {
        self.0
            .iter()
            .find(|(field, _)| field.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }
}

/// Decode RFC 2047 encoded-words in a header value.
///
/// Whitespace separating two adjacent encoded-words is dropped. Anything
/// that does not decode is kept verbatim.
pub fn decode_encoded_words(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let mut rest = input;
    let mut after_word = false;

    while let Some(pos) = rest.find("=?") {
        let (literal, marker) = rest.split_at(pos);
        let word = &marker[2..];
        match decode_word(word) {
            Some((text, len)) => {
                if !(after_word && literal.trim().is_empty()) {
                    out.push_str(literal);
                }
                out.push_str(&text);
                rest = &word[len..];
                after_word = true;
            }
            None => {
                out.push_str(literal);
                out.push_str("=?");
                rest = word;
                after_word = false;
            }
        }
    }

    out.push_str(rest);
    out
}

/// Decode `charset?B|Q?payload?=` (the part after `=?`), returning the text
/// and the number of bytes consumed.
fn decode_word(word: &str) -> Option<(String, usize)> {
    let mut parts = word.splitn(3, '?');
    let charset = parts.next()?;
    let encoding = parts.next()?;
    let tail = parts.next()?;
    let payload = &tail[..tail.find("?=")?];

    let bytes = match encoding {
        "B" | "b" => decode_base64(payload)?,
        "Q" | "q" => decode_q(payload),
        _ => return None,
    };
    let consumed = charset.len() + encoding.len() + payload.len() + 4;
    Some((decode_charset(charset, &bytes), consumed))
}

/// Base64 payload of an encoded-word. `None` on any invalid symbol.
fn decode_base64(payload: &str) -> Option<Vec<u8>> {
    fn sextet(c: u8) -> Option<u32> {
        let v = match c {
            b'A'..=b'Z' => c - b'A',
            b'a'..=b'z' => c - b'a' + 26,
            b'0'..=b'9' => c - b'0' + 52,
            b'+' => 62,
            b'/' => 63,
            _ => return None,
        };
        Some(u32::from(v))
    }

    let symbols: Vec<u8> = payload
        .bytes()
        .filter(|&b| b != b'=' && !b.is_ascii_whitespace())
        .collect();
    let mut out = Vec::with_capacity(symbols.len() / 4 * 3 + 2);
    for group in symbols.chunks(4) {
        if group.len() == 1 {
            return None;
        }
        let mut bits = 0u32;
        for (i, &c) in group.iter().enumerate() {
            bits |= sextet(c)? << (18 - 6 * i);
        }
        out.extend_from_slice(&bits.to_be_bytes()[1..group.len()]);
    }
    Some(out)
}

/// Q payload of an encoded-word: `_` is a space and `=XX` a hex byte.
fn decode_q(payload: &str) -> Vec<u8> {
    let mut out = Vec::with_capacity(payload.len());
    let mut rest = payload.as_bytes();
    while let Some((&first, tail)) = rest.split_first() {
        match (first, hex_pair(tail)) {
            (b'=', Some(byte)) => {
                out.push(byte);
                rest = &tail[2..];
                continue;
            }
            (b'_', _) => out.push(b' '),
            (other, _) => out.push(other),
        }
        rest = tail;
    }
    out
}

fn hex_pair(bytes: &[u8]) -> Option<u8> {
    let pair = bytes.get(..2)?;
    if !pair.iter().all(u8::is_ascii_hexdigit) {
        return None;
    }
    u8::from_str_radix(std::str::from_utf8(pair).ok()?, 16).ok()
}

/// Decode bytes in a MIME charset, falling back to lossy UTF-8 for unknown
/// labels. An RFC 2231 language suffix (`utf-8*en`) is ignored.
fn decode_charset(charset: &str, bytes: &[u8]) -> String {
    let label = charset.split('*').next().unwrap_or(charset);
    match encoding_rs::Encoding::for_label(label.as_bytes()) {
        Some(encoding) => encoding.decode_without_bom_handling(bytes).0.into_owned(),
        None => {
            warn!(charset, "Unknown charset, decoding as UTF-8");
            String::from_utf8_lossy(bytes).into_owned()
        }
    }
}
