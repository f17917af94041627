//! Deadline parsing across slash dates, textual months, ISO strings and sentinel text.

use chrono::{Datelike, NaiveDate, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::{Deadline, DeadlineRaw, SourceTag, PATHWAYS_DEADLINE_NOTICE};

const MONTHS: [&str; 12] = [
    "january", "february", "march", "april", "may", "june", "july", "august", "september",
    "october", "november", "december",
];

const SENTINELS: &[&str] = &[
    "unknown", "tbd", "tba", "n/a", "na", "none", "varies", "rolling", "-", "--", "?",
];

static SLASH_DATE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\b(\d{1,2})[/.\-](\d{1,2})[/.\-](\d{2,4})\b").expect("valid slash date regex")
});
static TEXTUAL_DATE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\b([a-z]{3,9})\.?\s+(\d{1,2})(?:st|nd|rd|th)?,?\s+(\d{4})\b")
        .expect("valid textual date regex")
});
static ISO_DATE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\b(\d{4})-(\d{2})-(\d{2})").expect("valid iso date regex"));
static MONTH_WORD: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\b(?:jan|feb|mar|apr|may|jun|jul|aug|sep|oct|nov|dec)[a-z]*\.?")
        .expect("valid month word regex")
});
static NUMBER_GROUP: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)\b(\d{1,4})(?:st|nd|rd|th)?\b").expect("valid number regex"));

/// Knobs for deadline validation and the no-year fallback.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeadlinePolicy {
    pub default_year: i32,
    pub min_year: i32,
    pub max_years_ahead: i32,
}

impl Default for DeadlinePolicy {
    fn default() -> Self {
        Self {
            default_year: 2025,
            min_year: 2000,
            max_years_ahead: 5,
        }
    }
}

impl DeadlinePolicy {
    /// Normalize a raw deadline as of `today`.
    pub fn parse(&self, raw: Option<&DeadlineRaw>, source: SourceTag, today: NaiveDate) -> Deadline {
        if source == SourceTag::PathwaysToScience {
            return Deadline::Notice(PATHWAYS_DEADLINE_NOTICE.to_string());
        }

        let parsed = match raw {
            None => None,
            Some(DeadlineRaw::Date(date)) => Some(*date),
            Some(DeadlineRaw::Text(text)) => self.parse_text(text),
        };

        match parsed {
            Some(date) if self.in_range(date, today) => Deadline::Date(date),
            _ => Deadline::Unknown,
        }
    }

    pub fn in_range(&self, date: NaiveDate, today: NaiveDate) -> bool {
        (self.min_year..=today.year() + self.max_years_ahead).contains(&date.year())
    }

    fn parse_text(&self, text: &str) -> Option<NaiveDate> {
        let text = text.trim();
        if text.is_empty() || SENTINELS.contains(&text.to_ascii_lowercase().as_str()) {
            return None;
        }
        parse_slash(text)
            .or_else(|| parse_textual(text))
            .or_else(|| parse_iso(text))
            .or_else(|| self.parse_loose(text))
    }

    /// Month word anywhere plus nearby day/year digit groups.
    fn parse_loose(&self, text: &str) -> Option<NaiveDate> {
        let month = MONTH_WORD
            .find_iter(text)
            .find_map(|m| month_from_word(m.as_str()))?;

        let mut day = None;
        let mut year = None;
        for caps in NUMBER_GROUP.captures_iter(text) {
            let digits = &caps[1];
            let Ok(value) = digits.parse::<u32>() else {
                continue;
            };
            if digits.len() == 4 {
                year.get_or_insert(value as i32);
            } else if digits.len() <= 2 && (1..=31).contains(&value) {
                day.get_or_insert(value);
            }
        }

        let day = day?;
        NaiveDate::from_ymd_opt(year.unwrap_or(self.default_year), month, day)
    }
}

/// Normalize with the default policy as of the current UTC date.
pub fn parse_deadline(raw: Option<&DeadlineRaw>, source: SourceTag) -> Deadline {
    parse_deadline_on(raw, source, Utc::now().date_naive())
}

pub fn parse_deadline_on(raw: Option<&DeadlineRaw>, source: SourceTag, today: NaiveDate) -> Deadline {
    DeadlinePolicy::default().parse(raw, source, today)
}

fn parse_slash(text: &str) -> Option<NaiveDate> {
    SLASH_DATE.captures_iter(text).find_map(|caps| {
        let first: u32 = caps[1].parse().ok()?;
        let second: u32 = caps[2].parse().ok()?;
        let year = expand_year(&caps[3])?;
        NaiveDate::from_ymd_opt(year, first, second)
            .or_else(|| NaiveDate::from_ymd_opt(year, second, first))
    })
}

fn parse_textual(text: &str) -> Option<NaiveDate> {
    TEXTUAL_DATE.captures_iter(text).find_map(|caps| {
        let month = month_from_word(&caps[1])?;
        let day: u32 = caps[2].parse().ok()?;
        let year: i32 = caps[3].parse().ok()?;
        NaiveDate::from_ymd_opt(year, month, day)
    })
}

fn parse_iso(text: &str) -> Option<NaiveDate> {
    let caps = ISO_DATE.captures(text)?;
    NaiveDate::from_ymd_opt(caps[1].parse().ok()?, caps[2].parse().ok()?, caps[3].parse().ok()?)
}

fn expand_year(digits: &str) -> Option<i32> {
    let value: i32 = digits.parse().ok()?;
    match digits.len() {
        2 => Some(2000 + value),
        4 => Some(value),
        _ => None,
    }
}

/// Month number for a full, abbreviated or truncated month name ("Febr", "Sept.").
fn month_from_word(word: &str) -> Option<u32> {
    let word = word.trim().trim_end_matches('.').to_ascii_lowercase();
    if word.len() < 3 {
        return None;
    }
    MONTHS
        .iter()
        .position(|m| m.starts_with(&word))
        .map(|idx| idx as u32 + 1)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn today() -> NaiveDate {
        NaiveDate::from_ymd_opt(2026, 10, 17).unwrap()
    }

    fn parse_text(s: &str) -> Deadline {
        parse_deadline_on(Some(&DeadlineRaw::Text(s.to_string())), SourceTag::GoogleSheets, today())
    }

    fn ymd(y: i32, m: u32, d: u32) -> Deadline {
        Deadline::Date(NaiveDate::from_ymd_opt(y, m, d).unwrap())
    }

    #[test]
    fn textual_month_day_year() {
        assert_eq!(parse_text("March 1, 2024"), ymd(2024, 3, 1));
        assert_eq!(parse_text("Febr 14th 2026"), ymd(2026, 2, 14));
        assert_eq!(parse_text("Deadline: Sept. 3 2025"), ymd(2025, 9, 3));
    }

    #[test]
    fn slash_and_dotted_dates() {
        assert_eq!(parse_text("02/15/2025"), ymd(2025, 2, 15));
        assert_eq!(parse_text("2-1-26"), ymd(2026, 2, 1));
        assert_eq!(parse_text("25.02.2025"), ymd(2025, 2, 25));
    }

    #[test]
    fn iso_dates_and_timestamps() {
        assert_eq!(parse_text("2025-01-31"), ymd(2025, 1, 31));
        assert_eq!(parse_text("2025-01-31T23:59:00Z"), ymd(2025, 1, 31));
    }

    #[test]
    fn loose_text_uses_default_year_when_missing() {
        assert_eq!(parse_text("Applications due 15 March"), ymd(2025, 3, 15));
        assert_eq!(parse_text("1st of February, 2026 (priority)"), ymd(2026, 2, 1));
    }

    #[test]
    fn unparseable_and_sentinel_text_is_unknown() {
        assert_eq!(parse_text("not a date"), Deadline::Unknown);
        assert_eq!(parse_text("Rolling"), Deadline::Unknown);
        assert_eq!(parse_text("TBD"), Deadline::Unknown);
        assert_eq!(parse_text("March 2026"), Deadline::Unknown);
        assert_eq!(parse_text("   "), Deadline::Unknown);
        assert_eq!(parse_deadline_on(None, SourceTag::Nsf, today()), Deadline::Unknown);
    }

    #[test]
    fn out_of_range_years_are_unknown() {
        assert_eq!(parse_text("March 1, 1999"), Deadline::Unknown);
        assert_eq!(parse_text("March 1, 2032"), Deadline::Unknown);
        assert_eq!(parse_text("March 1, 2031"), ymd(2031, 3, 1));
        let old = DeadlineRaw::Date(NaiveDate::from_ymd_opt(1990, 1, 1).unwrap());
        assert_eq!(parse_deadline_on(Some(&old), SourceTag::Manual, today()), Deadline::Unknown);
    }

    #[test]
    fn pathways_deadlines_are_always_a_notice() {
        let raw = DeadlineRaw::Text("February 1, 2026".into());
        assert_eq!(
            parse_deadline_on(Some(&raw), SourceTag::PathwaysToScience, today()),
            Deadline::Notice(PATHWAYS_DEADLINE_NOTICE.to_string())
        );
    }

    #[test]
    fn result_is_never_out_of_range() {
        let inputs = [
            "13/45/2024", "00/00/00", "Dec 32, 2025", "31/12/99", "May 5 3024", "0-0-0000",
            "Jan", "2024-13-01", "11/31/2025", "Mayor 12, 2025",
        ];
        for input in inputs {
            match parse_text(input) {
                Deadline::Unknown => {}
                Deadline::Date(d) => {
                    assert!((2000..=2031).contains(&d.year()), "{input} -> {d}");
                }
                other => panic!("{input} produced {other:?}"),
            }
        }
    }
}
