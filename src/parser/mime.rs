//! MIME message parsing: body extraction and HTML-to-text conversion.
//!
//! Bodies are decoded only when a reader asks for them, never at delivery.

use mail_parser::{MessageParser, MimeHeaders};

use crate::model::message::MessageBody;
use crate::parser::header::find_header_end;

/// Parse a complete raw message (headers + body) and extract its content.
///
/// Uses `mail-parser` internally; messages it rejects still yield their raw
/// headers and everything after the first blank line as text.
pub fn parse_message_body(raw_message: &[u8]) -> MessageBody {
    let raw_headers = extract_raw_headers(raw_message);

    match MessageParser::default().parse(raw_message) {
        Some(msg) => {
            let text = msg
                .body_text(0)
                .map(|s| s.into_owned())
                .or_else(|| msg.body_html(0).map(|html| html_to_text(&html)));
            let html = msg.body_html(0).map(|s| s.into_owned());
            let attachments = msg
                .attachments()
                .enumerate()
                .map(|(idx, part)| {
                    part.attachment_name()
                        .map(String::from)
                        .unwrap_or_else(|| format!("attachment_{idx}"))
                })
                .collect();

            MessageBody {
                text,
                html,
                raw_headers,
                attachments,
            }
        }
        None => MessageBody {
            text: Some(extract_body_fallback(raw_message)),
            html: None,
            raw_headers,
            attachments: Vec::new(),
        },
    }
}

/// Everything before the first blank line, lossily decoded.
fn extract_raw_headers(data: &[u8]) -> String {
    let end = find_header_end(data).unwrap_or(data.len());
    String::from_utf8_lossy(&data[..end]).into_owned()
}

/// Everything after the first blank line, for messages `mail-parser` rejects.
fn extract_body_fallback(data: &[u8]) -> String {
    let Some(end) = find_header_end(data) else {
        return String::new();
    };
    let body = &data[end..];
    let body = body
        .strip_prefix(b"\r\n\r\n")
        .or_else(|| body.strip_prefix(b"\n\n"))
        .unwrap_or(body);
    String::from_utf8_lossy(body).into_owned()
}

/// Elements whose content never reaches the text rendering.
const HIDDEN_TAGS: [&str; 2] = ["script", "style"];

/// Elements that end a line when closed (`br` on any occurrence).
const BLOCK_TAGS: [&str; 11] = ["br", "p", "div", "tr", "li", "h1", "h2", "h3", "h4", "h5", "h6"];

/// Convert HTML to plain text for terminal display.
///
/// Single pass over the markup: hidden elements are skipped, block ends
/// become line breaks and every other tag is dropped. Common entities are
/// decoded afterwards. Not a sanitizer.
pub fn html_to_text(html: &str) -> String {
    let mut text = String::with_capacity(html.len());
    let mut hidden: Option<&str> = None;
    let mut rest = html;

    while let Some(open) = rest.find('<') {
        if hidden.is_none() {
            text.push_str(&rest[..open]);
        }
        let Some(len) = rest[open..].find('>') else {
            rest = "";
            break;
        };
        let tag = &rest[open + 1..open + len];
        rest = &rest[open + len + 1..];

        let (closing, tag) = match tag.strip_prefix('/') {
            Some(tag) => (true, tag),
            None => (false, tag),
        };
        let name = tag
            .split(|c: char| c.is_whitespace() || c == '/')
            .next()
            .unwrap_or_default()
            .to_ascii_lowercase();

        match hidden {
            Some(element) => {
                if closing && name == element {
                    hidden = None;
                }
            }
            None if !closing => {
                hidden = HIDDEN_TAGS.iter().copied().find(|t| *t == name);
                if name == "br" {
                    text.push('\n');
                }
            }
            None => {
                if BLOCK_TAGS.contains(&name.as_str()) {
                    text.push('\n');
                }
            }
        }
    }
    if hidden.is_none() {
        text.push_str(rest);
    }

    decode_entities(&text)
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .collect::<Vec<_>>()
        .join("\n")
}

fn decode_entities(text: &str) -> String {
    // `&amp;` last so `&amp;lt;` stays `&lt;`.
    const ENTITIES: [(&str, &str); 6] = [
        ("&lt;", "<"),
        ("&gt;", ">"),
        ("&quot;", "\""),
        ("&#39;", "'"),
        ("&nbsp;", " "),
        ("&amp;", "&"),
    ];
    ENTITIES
        .iter()
        .fold(text.to_string(), |acc, (entity, plain)| acc.replace(entity, plain))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_plain_body() {
        let raw = b"From: a@b.com\r\nSubject: Hi\r\n\r\nHello there\r\n";
        let body = parse_message_body(raw);
        assert!(body.text.unwrap().contains("Hello there"));
        assert!(body.html.is_none());
        assert!(body.raw_headers.contains("Subject: Hi"));
        assert!(!body.raw_headers.contains("Hello there"));
    }

    #[test]
    fn test_parse_html_only_body_yields_text() {
        let raw = b"From: a@b.com\r\nContent-Type: text/html\r\n\r\n<p>Hello <b>world</b></p>\r\n";
        let body = parse_message_body(raw);
        assert!(body.html.unwrap().contains("<b>world</b>"));
    }

    #[test]
    fn test_html_to_text_entities() {
        assert_eq!(html_to_text("Tom &amp; Jerry &lt;3&gt;"), "Tom & Jerry <3>");
    }

    #[test]
    fn test_html_to_text_removes_scripts() {
        assert_eq!(
            html_to_text("Before<script>alert('xss')</script>After"),
            "BeforeAfter"
        );
    }

    #[test]
    fn test_html_to_text_paragraphs() {
        let text = html_to_text("<p>Hello <b>world</b></p><p>Second</p>");
        assert_eq!(text, "Hello world\nSecond");
    }
}
