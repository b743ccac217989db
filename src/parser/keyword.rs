//! Keyword-driven email parser.
//!
//! Classifies mail with fixed English/Portuguese keyword lists:
//! - priority: urgent → high → low, otherwise medium
//! - category: first matching category wins
//! - tags: every matching technology tag
//! - auto-reply: RFC 3834 headers, or out-of-office phrasing
//! - spam: two indicators, or one decisive pattern

use regex::Regex;

use super::text::{clean_body, clean_subject, html_to_text, truncate_description};
use super::{EmailParser, ParsedEmail, SkipReason};
use crate::mailbox::EmailMessage;
use crate::model::Priority;

/// Shortest description that can become a ticket, in characters.
const MIN_DESCRIPTION_CHARS: usize = 10;

const URGENT: &[&str] = &[
    "urgent", "urgente", "emergency", "emergência", "critical", "crítico", "asap", "imediato",
    "grave", "serious", "down", "parado", "offline",
];
const HIGH: &[&str] = &[
    "important", "importante", "high", "alta", "priority", "prioridade", "problem", "problema",
    "issue", "error", "erro", "failure", "falha",
];
const LOW: &[&str] = &[
    "low", "baixa", "minor", "pequeno", "simple", "simples", "question", "dúvida", "pergunta",
    "info", "informação",
];

const CATEGORIES: &[(&str, &[&str])] = &[
    (
        "Technical Support",
        &[
            "error", "erro", "bug", "problem", "problema", "issue", "failure", "falha",
            "not working", "não funciona", "broken", "crash", "travou",
        ],
    ),
    (
        "Request",
        &[
            "request", "solicito", "need", "preciso", "would like", "gostaria", "could",
            "poderia", "please", "por favor",
        ],
    ),
    (
        "Question",
        &[
            "question", "dúvida", "how", "como", "where", "onde", "when", "quando", "why",
            "por que", "what", "o que", "help", "ajuda",
        ],
    ),
    (
        "Complaint",
        &[
            "complaint", "reclamação", "unsatisfied", "insatisfeito", "terrible", "péssimo",
            "horrible", "horrível", "bad", "ruim",
        ],
    ),
    (
        "Praise",
        &[
            "praise", "elogio", "congratulations", "parabéns", "excellent", "excelente", "great",
            "ótimo", "perfect", "perfeito", "thank you", "obrigado",
        ],
    ),
];

const TAGS: &[(&str, &[&str])] = &[
    ("windows", &["windows", "win10", "win11"]),
    ("mac", &["mac", "macos", "apple"]),
    ("linux", &["linux", "ubuntu", "debian"]),
    ("mobile", &["mobile", "android", "ios", "celular"]),
    ("email", &["email", "e-mail", "outlook", "gmail", "thunderbird"]),
    ("internet", &["internet", "wifi", "wi-fi", "conexão", "rede", "network"]),
    ("printer", &["printer", "impressora", "imprimir", "print"]),
    ("software", &["software", "programa", "aplicativo", "app"]),
];

/// Phrases that mark an auto-reply anywhere in the message.
const AUTO_REPLY_PHRASES: &[&str] = &[
    "auto-reply", "autoreply", "automatic reply", "out of office", "fora do escritório",
    "resposta automática", "do not reply", "não responder",
];
/// Weaker hints, only trusted in the subject or sender address.
const AUTO_REPLY_HINTS: &[&str] = &["vacation", "férias", "ausente", "away", "noreply", "no-reply"];

const SPAM_INDICATORS: &[&str] = &[
    "viagra", "casino", "lottery", "winner", "congratulations", "click here", "free money",
    "urgent business", "nigerian prince", "inheritance", "million dollars", "act now",
    "limited time",
];

const GENERIC_SUBJECTS: &[&str] = &[
    "", "test", "teste", "hello", "hi", "oi", "olá", "no subject", "sem assunto",
];

const DEFAULT_SUBJECT: &str = "No subject";

/// Case-insensitive whole-word alternation over `words`.
fn keyword_regex(words: &[&str]) -> Regex {
    let alternation = words
        .iter()
        .map(|w| regex::escape(w))
        .collect::<Vec<_>>()
        .join("|");
    Regex::new(&format!(r"(?i)\b(?:{alternation})\b")).unwrap()
}

fn named_rules(rules: &[(&str, &[&str])]) -> Vec<(String, Regex)> {
    rules
        .iter()
        .map(|(name, words)| (name.to_string(), keyword_regex(words)))
        .collect()
}

/// Default [`EmailParser`].
pub struct KeywordParser {
    urgent: Regex,
    high: Regex,
    low: Regex,
    categories: Vec<(String, Regex)>,
    tags: Vec<(String, Regex)>,
    auto_reply_phrases: Regex,
    auto_reply_hints: Regex,
    spam_indicators: Vec<Regex>,
    spam_patterns: Vec<Regex>,
    money: Regex,
}

impl Default for KeywordParser {
    fn default() -> Self {
        Self::new()
    }
}

impl KeywordParser {
    pub fn new() -> Self {
        Self {
            urgent: keyword_regex(URGENT),
            high: keyword_regex(HIGH),
            low: keyword_regex(LOW),
            categories: named_rules(CATEGORIES),
            tags: named_rules(TAGS),
            auto_reply_phrases: keyword_regex(AUTO_REPLY_PHRASES),
            auto_reply_hints: keyword_regex(AUTO_REPLY_HINTS),
            spam_indicators: SPAM_INDICATORS
                .iter()
                .map(|w| keyword_regex(&[*w]))
                .collect(),
            spam_patterns: vec![
                Regex::new(r"(?i)\bclick here\b").unwrap(),
                Regex::new(r"(?i)\bact now\b").unwrap(),
                Regex::new(r"(?i)\blimited time\b").unwrap(),
                Regex::new(r"(?i)\bfree\b.{0,40}\bmoney\b").unwrap(),
            ],
            money: Regex::new(r"\$\d+[,.]\d+").unwrap(),
        }
    }

    fn description(email: &EmailMessage) -> String {
        let raw = match (&email.text_body, &email.html_body) {
            (Some(text), _) if !text.trim().is_empty() => text.clone(),
            (_, Some(html)) => html_to_text(html),
            _ => String::new(),
        };
        truncate_description(clean_body(&raw))
    }

    fn priority(&self, content: &str) -> Priority {
        if self.urgent.is_match(content) {
            Priority::Urgent
        } else if self.high.is_match(content) {
            Priority::High
        } else if self.low.is_match(content) {
            Priority::Low
        } else {
            Priority::Medium
        }
    }

    fn category(&self, content: &str) -> Option<String> {
        self.categories
            .iter()
            .find(|(_, re)| re.is_match(content))
            .map(|(name, _)| name.clone())
    }

    fn tags(&self, content: &str) -> Vec<String> {
        self.tags
            .iter()
            .filter(|(_, re)| re.is_match(content))
            .map(|(name, _)| name.clone())
            .collect()
    }

    fn is_auto_reply(&self, email: &EmailMessage, content: &str) -> bool {
        let headers = &email.headers;
        let auto_submitted = headers
            .auto_submitted
            .as_deref()
            .is_some_and(|v| !v.eq_ignore_ascii_case("no"));
        let bulk = headers.precedence.as_deref().is_some_and(|v| {
            matches!(v.to_ascii_lowercase().as_str(), "bulk" | "junk" | "auto_reply")
        });
        if auto_submitted || bulk || headers.auto_response_suppress.is_some() {
            return true;
        }

        self.auto_reply_phrases.is_match(content)
            || self.auto_reply_hints.is_match(&email.subject)
            || self.auto_reply_hints.is_match(&email.from)
    }

    fn is_spam(&self, content: &str) -> bool {
        let mut score = self
            .spam_indicators
            .iter()
            .filter(|re| re.is_match(content))
            .count();
        if self.money.is_match(content) {
            score += 1;
        }
        score >= 2 || self.spam_patterns.iter().any(|re| re.is_match(content))
    }
}

impl EmailParser for KeywordParser {
    fn parse(&self, email: &EmailMessage) -> ParsedEmail {
        let subject = clean_subject(&email.subject);
        let subject = if subject.is_empty() {
            DEFAULT_SUBJECT.to_string()
        } else {
            subject
        };
        let description = Self::description(email);
        let content = format!("{subject}\n{description}");

        ParsedEmail {
            priority: self.priority(&content),
            category: self.category(&content),
            tags: self.tags(&content),
            is_auto_reply: self.is_auto_reply(email, &content),
            is_spam: self.is_spam(&content),
            subject,
            description,
        }
    }

    fn should_create_ticket(&self, parsed: &ParsedEmail) -> Result<(), SkipReason> {
        if parsed.is_auto_reply {
            return Err(SkipReason::AutoReply);
        }
        if parsed.is_spam {
            return Err(SkipReason::Spam);
        }
        let subject = parsed.subject.trim().to_lowercase();
        if GENERIC_SUBJECTS.contains(&subject.as_str()) {
            return Err(SkipReason::GenericSubject);
        }
        if parsed.description.chars().count() < MIN_DESCRIPTION_CHARS {
            return Err(SkipReason::TooShort);
        }
        Ok(())
    }
}
