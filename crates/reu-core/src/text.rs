//! Text cleanup shared by extractors and the normalization pipeline.

use once_cell::sync::Lazy;
use regex::Regex;

use crate::fields::CATCH_ALL;

static READ_MORE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?i)(?:\.{2,}|…)\s*(?:read|show|see)\s+more\b[ \t»>.…]*|[\[(]\s*(?:read|show)\s+more\s*[\])]|\b(?:read|show)\s+more\s*(?:»|>>|\.{3}|…)|\s*\bread\s+more\s*$",
    )
    .expect("valid read-more regex")
});
static PARAGRAPH_BREAK: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\n\s*\n").expect("valid paragraph regex"));
static URL: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)\b(?:https?://|www\.)\S+").expect("valid url regex"));
static EMAIL: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\b[a-z0-9._%+\-]+@[a-z0-9\-]+(?:\.[a-z0-9\-]+)+\b").expect("valid email regex")
});
static PHONE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?:\+?1[\s.\-]?)?\(?\b\d{3}\)?[\s.\-]?\d{3}[\s.\-]\d{4}\b").expect("valid phone regex")
});
static MONEY: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?i)\$\s*\d|\b(?:usd|us\$)\s*\d|\d[\d,]*(?:\.\d+)?\s*(?:k\b|usd\b|dollars?\b)|\d[\d,]*\s*(?:/|per)\s*(?:week|wk|month|mo|hour|hr|summer|program)\b",
    )
    .expect("valid money regex")
});

/// Strip "read more" boilerplate and collapse whitespace; paragraphs stay separated by a blank line.
pub fn clean_description(text: &str) -> String {
    let text = text.replace("\r\n", "\n").replace('\r', "\n");
    let text = READ_MORE.replace_all(&text, " ");
    PARAGRAPH_BREAK
        .split(&text)
        .map(collapse_whitespace)
        .filter(|p| !p.is_empty())
        .collect::<Vec<_>>()
        .join("\n\n")
}

pub fn collapse_whitespace(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Remove URLs, email addresses and phone numbers from scraped prose.
pub fn strip_contact_details(text: &str) -> String {
    let text = URL.replace_all(text, "");
    let text = EMAIL.replace_all(&text, "");
    PHONE.replace_all(&text, "").into_owned()
}

pub fn is_monetary(text: &str) -> bool {
    MONEY.is_match(text)
}

/// Keep a stipend only when it carries a recognizable amount.
pub fn clean_stipend(raw: Option<&str>) -> String {
    match raw.map(collapse_whitespace) {
        Some(s) if is_monetary(&s) => s,
        _ => String::new(),
    }
}

/// Titles that hold marketing copy or nothing at all instead of a program name.
pub fn is_placeholder_title(title: &str) -> bool {
    let lower = collapse_whitespace(title).to_lowercase();
    lower.is_empty()
        || lower.contains("100%")
        || lower.contains("in person")
        || lower.contains("in-person")
        || matches!(lower.as_str(), "n/a" | "na" | "tbd" | "untitled" | "program" | "reu")
}

/// Synthesize a readable title from a field label and institution.
pub fn derive_title(field: Option<&str>, institution: &str) -> String {
    let field = field
        .map(str::trim)
        .filter(|f| !f.is_empty() && *f != CATCH_ALL);
    let institution = institution.trim();
    match (field, institution.is_empty()) {
        (Some(field), false) => format!("{field} Research at {institution}"),
        (None, false) => format!("Undergraduate Research at {institution}"),
        (Some(field), true) => format!("{field} Research Program"),
        (None, true) => "Undergraduate Research Program".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn description_drops_read_more_and_keeps_paragraphs() {
        let raw = "Study   coral reefs\nin Hawaii...read more\n\n\n  Housing   provided. [Read More]";
        assert_eq!(
            clean_description(raw),
            "Study coral reefs in Hawaii\n\nHousing provided."
        );
        assert_eq!(clean_description("Great program. Read more"), "Great program.");
    }

    #[test]
    fn contact_details_are_removed() {
        let raw = "Email reu@tufts.edu or call (617) 555-1234, see https://tufts.edu/reu now";
        let cleaned = collapse_whitespace(&strip_contact_details(raw));
        assert_eq!(cleaned, "Email or call , see now");
    }

    #[test]
    fn stipend_requires_an_amount() {
        assert_eq!(clean_stipend(Some("$6,000 for the summer")), "$6,000 for the summer");
        assert_eq!(clean_stipend(Some("600 per week")), "600 per week");
        assert_eq!(clean_stipend(Some("Paid")), "");
        assert_eq!(clean_stipend(Some("Yes - see website")), "");
        assert_eq!(clean_stipend(None), "");
    }

    #[test]
    fn placeholder_titles_are_detected() {
        assert!(is_placeholder_title("This is a 100% online REU"));
        assert!(is_placeholder_title("50% in person REU"));
        assert!(is_placeholder_title("  "));
        assert!(!is_placeholder_title("Ocean Sciences REU at URI"));
    }

    #[test]
    fn derived_titles_degrade_gracefully() {
        assert_eq!(derive_title(Some("Biology"), "Tufts"), "Biology Research at Tufts");
        assert_eq!(derive_title(Some("N/A"), "Tufts"), "Undergraduate Research at Tufts");
        assert_eq!(derive_title(Some("Physics"), ""), "Physics Research Program");
        assert_eq!(derive_title(None, " "), "Undergraduate Research Program");
    }
}
