//! Plain-text helpers for email bodies and subjects.

use std::sync::LazyLock;

use regex::Regex;

/// Maximum description length in characters.
pub const MAX_DESCRIPTION_CHARS: usize = 5000;

const TRUNCATION_MARKER: &str = "\n\n[content truncated]";

static REPLY_PREFIX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)^\s*((re|fw|fwd|enc|encaminhado|resposta)\s*:\s*)+").unwrap()
});
static BRACKET_TAG: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\[[^\]]*\]").unwrap());
static BREAK_TAG: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(?i)<br\s*/?>").unwrap());
static PARAGRAPH_END: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(?i)</p\s*>").unwrap());
static DIV_END: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(?i)</div\s*>").unwrap());
static INVISIBLE_BLOCK: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?is)<(style|script|head)\b.*?</(style|script|head)\s*>").unwrap());
static ANY_TAG: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"<[^>]*>").unwrap());
static BLANK_RUN: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\n[ \t]*(\n[ \t]*)+\n").unwrap());
static DISCLAIMER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)((this|este) e-?mail.*confiden|^confidential)").unwrap()
});

/// Header lines that mail clients sometimes paste into bodies.
const HEADER_PREFIXES: &[&str] = &[
    "From:",
    "To:",
    "Subject:",
    "Date:",
    "Message-ID:",
    "Content-Type:",
    "Content-Transfer-Encoding:",
    "MIME-Version:",
    "Received:",
    "Return-Path:",
    "Delivered-To:",
    "X-",
];

const DEVICE_SIGNATURES: &[&str] = &[
    "Sent from my ",
    "Enviado do meu ",
    "Get Outlook for ",
];

/// Strip reply/forward prefixes and `[tags]`, and normalize whitespace.
pub fn clean_subject(subject: &str) -> String {
    let without_prefix = REPLY_PREFIX.replace(subject, "");
    let without_tags = BRACKET_TAG.replace_all(&without_prefix, "");
    without_tags.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Convert simple HTML to text, keeping line structure.
pub fn html_to_text(html: &str) -> String {
    let text = INVISIBLE_BLOCK.replace_all(html, "");
    let text = BREAK_TAG.replace_all(&text, "\n");
    let text = PARAGRAPH_END.replace_all(&text, "\n\n");
    let text = DIV_END.replace_all(&text, "\n");
    let text = ANY_TAG.replace_all(&text, "");
    decode_entities(&text)
}

fn decode_entities(text: &str) -> String {
    text.replace("&nbsp;", " ")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&#39;", "'")
        .replace("&apos;", "'")
        .replace("&amp;", "&")
}

/// Remove pasted headers, device signatures, the `-- ` signature block and
/// confidentiality disclaimers, then collapse blank runs.
pub fn clean_body(body: &str) -> String {
    let normalized = body.replace("\r\n", "\n");
    let mut kept = Vec::new();

    for line in normalized.lines() {
        let trimmed = line.trim_end();
        if trimmed == "--" {
            break;
        }
        let start = trimmed.trim_start();
        if HEADER_PREFIXES.iter().any(|p| trimmed.starts_with(p))
            || DEVICE_SIGNATURES.iter().any(|p| start.starts_with(p))
            || DISCLAIMER.is_match(start)
        {
            continue;
        }
        kept.push(trimmed);
    }

    let joined = kept.join("\n");
    BLANK_RUN.replace_all(&joined, "\n\n").trim().to_string()
}

/// Cut `text` to at most [`MAX_DESCRIPTION_CHARS`] characters plus a marker.
pub fn truncate_description(text: String) -> String {
    match text.char_indices().nth(MAX_DESCRIPTION_CHARS) {
        Some((cut, _)) => format!("{}{TRUNCATION_MARKER}", &text[..cut]),
        None => text,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn subject_prefixes_and_tags_are_removed() {
        assert_eq!(clean_subject("Re: Fwd: [Ticket #12]  VPN   down"), "VPN down");
        assert_eq!(clean_subject("RE:RE: printer"), "printer");
        assert_eq!(clean_subject("Encaminhado: Nota fiscal"), "Nota fiscal");
        assert_eq!(clean_subject("Regarding invoices"), "Regarding invoices");
    }

    #[test]
    fn html_keeps_paragraphs() {
        let html = "<html><head><style>p{color:red}</style></head>\
                    <body><p>Hello&nbsp;team</p><div>Line&amp;two</div>a<br/>b</body></html>";
        let text = html_to_text(html);
        assert!(text.contains("Hello team\n\n"));
        assert!(text.contains("Line&two\n"));
        assert!(text.contains("a\nb"));
        assert!(!text.contains("color"));
    }

    #[test]
    fn body_cleanup_drops_noise() {
        let body = "Subject: pasted\r\nThe VPN drops every hour.\r\n\r\n\r\n\r\n\
                    Please advise.\r\nSent from my iPhone\r\n\
                    This email is confidential and intended only for you.\r\n\
                    -- \r\nJohn Smith\r\nACME Corp";
        assert_eq!(clean_body(body), "The VPN drops every hour.\n\nPlease advise.");
    }

    #[test]
    fn truncation_counts_characters() {
        let short = "ação".repeat(10);
        assert_eq!(truncate_description(short.clone()), short);

        let long = "é".repeat(MAX_DESCRIPTION_CHARS + 10);
        let cut = truncate_description(long);
        assert!(cut.ends_with("[content truncated]"));
        assert_eq!(
            cut.chars().count(),
            MAX_DESCRIPTION_CHARS + TRUNCATION_MARKER.chars().count()
        );
    }
}
