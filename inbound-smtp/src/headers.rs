//! Header and preview extraction from the captured header window.
//!
//! Only the window is ever parsed. A body larger than the window is stored
//! intact but its preview is cut at the window boundary.

use std::collections::BTreeMap;

use inbound_common::ContentId;
use mailparse::{MailAddr, MailHeaderMap, ParsedMail};

use crate::error::SessionError;

/// Longest preview kept per message
pub const PREVIEW_LIMIT: usize = 10 * 1024;

/// Structural headers and preview bodies of a message
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ParsedHeaders {
    pub from: String,
    /// Addresses from the `To` header, display names dropped
    pub to: Vec<String>,
    pub subject: String,
    pub message_id: String,
    /// First value of every header, keyed by the header name as sent
    pub headers: BTreeMap<String, String>,
    pub text_body: String,
    pub html_body: String,
}

impl ParsedHeaders {
    /// Parse `window`, synthesising `<id@domain>` when there is no Message-ID
    pub fn parse(window: &[u8], domain: &str) -> Result<Self, SessionError> {
        let (headers, _) = mailparse::parse_headers(window)
            .map_err(|err| SessionError::Malformed(err.to_string()))?;

        let first = |name: &str| headers.get_first_value(name).unwrap_or_default();

        let message_id = match first("Message-ID").trim() {
            "" => format!("<{}@{domain}>", ContentId::generate()),
            id => id.to_string(),
        };

        let to: Vec<String> = headers
            .get_first_header("To")
            .and_then(|header| mailparse::addrparse_header(header).ok())
            .map(|list| {
                list.iter()
                    .flat_map(|addr| match addr {
                        MailAddr::Single(single) => vec![single.addr.clone()],
                        MailAddr::Group(group) => {
                            group.addrs.iter().map(|single| single.addr.clone()).collect()
                        }
                    })
                    .collect()
            })
            .unwrap_or_default();

        let mut map = BTreeMap::new();
        for header in &headers {
            map.entry(header.get_key())
                .or_insert_with(|| header.get_value());
        }

        let (text_body, html_body) = mailparse::parse_mail(window)
            .ok()
            .and_then(|mail| preview(&mail))
            .map_or_else(Default::default, |(mime, body)| {
                if mime == "text/html" {
                    (String::new(), body)
                } else {
                    (body, String::new())
                }
            });

        Ok(Self {
            from: first("From"),
            to,
            subject: first("Subject"),
            message_id,
            headers: map,
            text_body,
            html_body,
        })
    }
}

/// The first `text/plain` or `text/html` leaf part, depth first
fn preview(part: &ParsedMail<'_>) -> Option<(String, String)> {
    if part.subparts.is_empty() {
        let mime = part.ctype.mimetype.to_ascii_lowercase();
        if mime != "text/plain" && mime != "text/html" {
            return None;
        }

        let body = part.get_body().ok()?;
        return Some((mime, truncate(body, PREVIEW_LIMIT)));
    }

    part.subparts.iter().find_map(preview)
}

fn truncate(mut text: String, limit: usize) -> String {
    if text.len() > limit {
        let mut end = limit;
        while !text.is_char_boundary(end) {
            end -= 1;
        }
        text.truncate(end);
    }
    text
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn structural_headers() {
        let message = b"From: Alice <alice@example.org>\r\n\
To: Bob <bob@mymail.com>, carol@mymail.com\r\n\
Subject: Quarterly numbers\r\n\
Message-ID: <q3@example.org>\r\n\
\r\n\
See attached.\r\n";

        let parsed = ParsedHeaders::parse(message, "mymail.com").unwrap();

        assert_eq!(parsed.from, "Alice <alice@example.org>");
        assert_eq!(parsed.to, vec!["bob@mymail.com", "carol@mymail.com"]);
        assert_eq!(parsed.subject, "Quarterly numbers");
        assert_eq!(parsed.message_id, "<q3@example.org>");
        assert!(parsed.text_body.starts_with("See attached."));
        assert_eq!(parsed.html_body, "");
        assert_eq!(parsed.headers.get("Subject").unwrap(), "Quarterly numbers");
    }

    #[test]
    fn missing_message_id_is_synthesised() {
        let parsed = ParsedHeaders::parse(b"Subject: hi\r\n\r\nbody", "mymail.com").unwrap();

        assert!(parsed.message_id.starts_with('<'));
        assert!(parsed.message_id.ends_with("@mymail.com>"));
        assert!(parsed.to.is_empty());
    }

    #[test]
    fn first_text_part_of_a_multipart_message() {
        let message = b"Subject: alt\r\n\
Content-Type: multipart/mixed; boundary=\"outer\"\r\n\
\r\n\
--outer\r\n\
Content-Type: image/png\r\n\
\r\n\
PNGDATA\r\n\
--outer\r\n\
Content-Type: text/html; charset=utf-8\r\n\
\r\n\
<p>Hello</p>\r\n\
--outer\r\n\
Content-Type: text/plain\r\n\
\r\n\
Hello\r\n\
--outer--\r\n";

        let parsed = ParsedHeaders::parse(message, "mymail.com").unwrap();

        assert_eq!(parsed.text_body, "");
        assert!(parsed.html_body.starts_with("<p>Hello</p>"));
    }

    #[test]
    fn preview_is_bounded() {
        let mut message = b"Subject: long\r\n\r\n".to_vec();
        message.extend(std::iter::repeat_n(b'x', PREVIEW_LIMIT * 2));

        let parsed = ParsedHeaders::parse(&message, "mymail.com").unwrap();

        assert_eq!(parsed.text_body.len(), PREVIEW_LIMIT);
    }

    #[test]
    fn truncation_respects_char_boundaries() {
        let text = "é".repeat(10);

        assert_eq!(truncate(text, 5), "éé");
    }
}
