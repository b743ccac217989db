//! In-flight email representation built from a raw RFC 822 message.

use chrono::{DateTime, Utc};
use mail_parser::{HeaderValue, Message, MessageParser, PartType};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Namespace for message-ids synthesized from the raw source.
const FALLBACK_ID_NAMESPACE: Uuid = Uuid::from_u128(0x6ba7b811_9dad_11d1_80b4_00c04fd430c8);

/// Header hints used for auto-reply detection.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AutoReplyHeaders {
    pub auto_submitted: Option<String>,
    pub precedence: Option<String>,
    pub auto_response_suppress: Option<String>,
}

/// An email fetched from a department mailbox, before ticket creation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmailMessage {
    pub uid: u32,
    /// `Message-ID` header, or a deterministic id derived from the raw source.
    pub message_id: String,
    pub subject: String,
    /// Sender as `Name <address>` or bare address.
    pub from: String,
    pub to: Vec<String>,
    pub date: Option<DateTime<Utc>>,
    pub text_body: Option<String>,
    pub html_body: Option<String>,
    #[serde(default)]
    pub headers: AutoReplyHeaders,
}

impl EmailMessage {
    /// Parse a raw message. Returns `None` if the bytes are not a message at all.
    pub fn from_raw(uid: u32, raw: &[u8]) -> Option<Self> {
        let parsed = MessageParser::default().parse(raw)?;

        let message_id = parsed
            .message_id()
            .map(|id| id.trim().to_string())
            .filter(|id| !id.is_empty())
            .unwrap_or_else(|| fallback_message_id(raw));

        let from = parsed
            .from()
            .and_then(|addr| addr.first())
            .map(format_address)
            .unwrap_or_default();

        let to = parsed
            .to()
            .map(address_list)
            .unwrap_or_default();

        let date = parsed
            .date()
            .and_then(|d| DateTime::from_timestamp(d.to_timestamp(), 0));

        let text_body = parsed.text_bodies().find_map(|part| match &part.body {
            PartType::Text(text) => Some(text.to_string()),
            _ => None,
        });
        let html_body = parsed.html_bodies().find_map(|part| match &part.body {
            PartType::Html(html) => Some(html.to_string()),
            _ => None,
        });

        Some(Self {
            uid,
            message_id,
            subject: parsed.subject().unwrap_or_default().trim().to_string(),
            from,
            to,
            date,
            text_body,
            html_body,
            headers: AutoReplyHeaders {
                auto_submitted: header_text(&parsed, "Auto-Submitted"),
                precedence: header_text(&parsed, "Precedence"),
                auto_response_suppress: header_text(&parsed, "X-Auto-Response-Suppress"),
            },
        })
    }
}

/// Stable id for messages lacking a `Message-ID`, so dedup holds across ticks.
fn fallback_message_id(raw: &[u8]) -> String {
    format!("{}@helpdesk.local", Uuid::new_v5(&FALLBACK_ID_NAMESPACE, raw))
}

fn format_address(addr: &mail_parser::Addr) -> String {
    let address = addr.address().unwrap_or_default();
    match addr.name().map(str::trim).filter(|n| !n.is_empty()) {
        Some(name) => format!("\"{name}\" <{address}>"),
        None => address.to_string(),
    }
}

fn address_list(addr: &mail_parser::Address) -> Vec<String> {
    match addr {
        mail_parser::Address::List(addrs) => addrs.iter().map(format_address).collect(),
        mail_parser::Address::Group(groups) => groups
            .iter()
            .flat_map(|g| g.addresses.iter().map(format_address))
            .collect(),
    }
}

fn header_text(message: &Message, name: &str) -> Option<String> {
    let header = message
        .headers()
        .iter()
        .find(|h| h.name().eq_ignore_ascii_case(name))?;
    let text = match header.value() {
        HeaderValue::Text(text) => text.to_string(),
        HeaderValue::TextList(list) => list.join(", "),
        _ => return None,
    };
    let text = text.trim();
    (!text.is_empty()).then(|| text.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    const SIMPLE: &[u8] = b"From: \"Jane Doe\" <jane@example.com>\r\n\
To: support@acme.test\r\n\
Subject: Printer on fire\r\n\
Message-ID: <abc123@example.com>\r\n\
Date: Tue, 14 Oct 2025 09:30:00 +0000\r\n\
Content-Type: text/plain; charset=utf-8\r\n\
\r\n\
The printer on floor 3 is on fire again.\r\n";

    #[test]
    fn parses_headers_and_body() {
        let msg = EmailMessage::from_raw(7, SIMPLE).unwrap();
        assert_eq!(msg.uid, 7);
        assert_eq!(msg.message_id, "abc123@example.com");
        assert_eq!(msg.subject, "Printer on fire");
        assert_eq!(msg.from, "\"Jane Doe\" <jane@example.com>");
        assert_eq!(msg.to, vec!["support@acme.test".to_string()]);
        assert!(msg.text_body.unwrap().contains("floor 3"));
        assert!(msg.date.is_some());
        assert_eq!(msg.headers, AutoReplyHeaders::default());
    }

    #[test]
    fn missing_message_id_is_deterministic() {
        let raw = b"From: bob@example.com\r\nSubject: hi\r\n\r\nhello there\r\n";
        let a = EmailMessage::from_raw(1, raw).unwrap();
        let b = EmailMessage::from_raw(2, raw).unwrap();
        assert_eq!(a.message_id, b.message_id);
        assert!(a.message_id.ends_with("@helpdesk.local"));

        let other = EmailMessage::from_raw(1, b"From: bob@example.com\r\nSubject: hi\r\n\r\nbye\r\n")
            .unwrap();
        assert_ne!(a.message_id, other.message_id);
    }

    #[test]
    fn captures_auto_reply_headers() {
        let raw = b"From: robot@example.com\r\n\
Subject: Out of office\r\n\
Auto-Submitted: auto-replied\r\n\
Precedence: bulk\r\n\
\r\n\
I am away.\r\n";
        let msg = EmailMessage::from_raw(3, raw).unwrap();
        assert_eq!(msg.headers.auto_submitted.as_deref(), Some("auto-replied"));
        assert_eq!(msg.headers.precedence.as_deref(), Some("bulk"));
        assert_eq!(msg.from, "robot@example.com");
    }
}
