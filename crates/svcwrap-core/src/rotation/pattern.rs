//! Date patterns in the `yyyy-MM-dd HH:mm:ss.fff` style used by service
//! descriptors, and roll schedules derived from them.

use crate::error::WrapperError;
use chrono::{Datelike, Duration as ChronoDuration, NaiveDate, NaiveDateTime, Timelike};
use std::fmt::Write;

#[derive(Debug, Clone, PartialEq, Eq)]
enum Token {
    Literal(String),
    Year(usize),
    Month(usize),
    Day(usize),
    Hour24(usize),
    Hour12(usize),
    Minute(usize),
    Second(usize),
    Fraction(usize),
    AmPm(usize),
}

/// A parsed date pattern, rendered against naive local timestamps
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DatePattern {
    source: String,
    tokens: Vec<Token>,
}

impl DatePattern {
    pub fn parse(pattern: &str) -> Self {
        let chars: Vec<char> = pattern.chars().collect();
        let mut tokens = Vec::new();
        let mut literal = String::new();
        let mut i = 0;

        while i < chars.len() {
            let c = chars[i];
            match c {
                '\'' | '"' => {
                    i += 1;
                    while i < chars.len() && chars[i] != c {
                        literal.push(chars[i]);
                        i += 1;
                    }
                    i += 1;
                }
                '\\' => {
                    if let Some(next) = chars.get(i + 1) {
                        literal.push(*next);
                    }
                    i += 2;
                }
                'y' | 'M' | 'd' | 'H' | 'h' | 'm' | 's' | 'f' | 'F' | 't' => {
                    let run = chars[i..].iter().take_while(|x| **x == c).count();
                    if !literal.is_empty() {
                        tokens.push(Token::Literal(std::mem::take(&mut literal)));
                    }
                    tokens.push(match c {
                        'y' => Token::Year(run),
                        'M' => Token::Month(run),
                        'd' => Token::Day(run),
                        'H' => Token::Hour24(run),
                        'h' => Token::Hour12(run),
                        'm' => Token::Minute(run),
                        's' => Token::Second(run),
                        't' => Token::AmPm(run),
                        _ => Token::Fraction(run.min(9)),
                    });
                    i += run;
                }
                other => {
                    literal.push(other);
                    i += 1;
                }
            }
        }
        if !literal.is_empty() {
            tokens.push(Token::Literal(literal));
        }

        Self {
            source: pattern.to_string(),
            tokens,
        }
    }

    pub fn as_str(&self) -> &str {
        &self.source
    }

    pub fn format(&self, at: &NaiveDateTime) -> String {
        let mut out = String::new();
        for token in &self.tokens {
            // Writing into a String cannot fail
            let _ = match token {
                Token::Literal(text) => write!(out, "{text}"),
                Token::Year(1) => write!(out, "{}", at.year() % 100),
                Token::Year(2) => write!(out, "{:02}", at.year() % 100),
                Token::Year(n) => write!(out, "{:0width$}", at.year(), width = *n),
                Token::Month(1) => write!(out, "{}", at.month()),
                Token::Month(2) => write!(out, "{:02}", at.month()),
                Token::Month(3) => write!(out, "{}", at.format("%b")),
                Token::Month(_) => write!(out, "{}", at.format("%B")),
                Token::Day(1) => write!(out, "{}", at.day()),
                Token::Day(2) => write!(out, "{:02}", at.day()),
                Token::Day(3) => write!(out, "{}", at.format("%a")),
                Token::Day(_) => write!(out, "{}", at.format("%A")),
                Token::Hour24(1) => write!(out, "{}", at.hour()),
                Token::Hour24(_) => write!(out, "{:02}", at.hour()),
                Token::Hour12(1) => write!(out, "{}", at.hour12().1),
                Token::Hour12(_) => write!(out, "{:02}", at.hour12().1),
                Token::Minute(1) => write!(out, "{}", at.minute()),
                Token::Minute(_) => write!(out, "{:02}", at.minute()),
                Token::Second(1) => write!(out, "{}", at.second()),
                Token::Second(_) => write!(out, "{:02}", at.second()),
                Token::Fraction(n) => {
                    let nanos = format!("{:09}", at.nanosecond() % 1_000_000_000);
                    write!(out, "{}", &nanos[..*n])
                }
                Token::AmPm(1) => write!(out, "{}", if at.hour12().0 { "P" } else { "A" }),
                Token::AmPm(_) => write!(out, "{}", if at.hour12().0 { "PM" } else { "AM" }),
            };
        }
        out
    }
}

/// The smallest calendar unit a pattern distinguishes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeriodicityUnit {
    Millisecond,
    Second,
    Minute,
    Hour,
    Day,
}

impl PeriodicityUnit {
    const CANDIDATES: [PeriodicityUnit; 5] = [
        PeriodicityUnit::Millisecond,
        PeriodicityUnit::Second,
        PeriodicityUnit::Minute,
        PeriodicityUnit::Hour,
        PeriodicityUnit::Day,
    ];

    pub fn step(&self) -> ChronoDuration {
        match self {
            PeriodicityUnit::Millisecond => ChronoDuration::milliseconds(1),
            PeriodicityUnit::Second => ChronoDuration::seconds(1),
            PeriodicityUnit::Minute => ChronoDuration::minutes(1),
            PeriodicityUnit::Hour => ChronoDuration::hours(1),
            PeriodicityUnit::Day => ChronoDuration::days(1),
        }
    }

    /// Drop every field finer than this unit
    pub fn truncate(&self, at: NaiveDateTime) -> NaiveDateTime {
        let date = at.date();
        let (h, m, s, ms) = match self {
            PeriodicityUnit::Millisecond => {
                (at.hour(), at.minute(), at.second(), at.nanosecond() / 1_000_000)
            }
            PeriodicityUnit::Second => (at.hour(), at.minute(), at.second(), 0),
            PeriodicityUnit::Minute => (at.hour(), at.minute(), 0, 0),
            PeriodicityUnit::Hour => (at.hour(), 0, 0, 0),
            PeriodicityUnit::Day => (0, 0, 0, 0),
        };
        date.and_hms_milli_opt(h, m, s, ms.min(999)).unwrap_or(at)
    }
}

/// Find the unit whose one-step advance first changes the formatted pattern
pub fn detect_periodicity(pattern: &str) -> Result<PeriodicityUnit, WrapperError> {
    let parsed = DatePattern::parse(pattern);
    let reference = NaiveDate::from_ymd_opt(1970, 1, 1)
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .ok_or_else(|| WrapperError::configuration("invalid reference instant"))?;
    let formatted = parsed.format(&reference);

    PeriodicityUnit::CANDIDATES
        .into_iter()
        .find(|unit| parsed.format(&(reference + unit.step())) != formatted)
        .ok_or_else(|| {
            WrapperError::configuration(format!(
                "cannot detect a rotation period for pattern {pattern:?}"
            ))
        })
}

/// Tracks when the next time-based roll is due
#[derive(Debug, Clone)]
pub struct RollSchedule {
    unit: PeriodicityUnit,
    period: u32,
    next: NaiveDateTime,
}

impl RollSchedule {
    pub fn new(unit: PeriodicityUnit, period: u32, now: NaiveDateTime) -> Self {
        let mut schedule = Self {
            unit,
            period: period.max(1),
            next: now,
        };
        schedule.next = schedule.next_roll(now);
        schedule
    }

    pub fn unit(&self) -> PeriodicityUnit {
        self.unit
    }

    /// The roll instant following `now`
    pub fn next_roll(&self, now: NaiveDateTime) -> NaiveDateTime {
        self.unit.truncate(now) + self.unit.step() * self.period as i32
    }

    pub fn next(&self) -> NaiveDateTime {
        self.next
    }

    pub fn is_due(&self, now: NaiveDateTime) -> bool {
        now >= self.next
    }

    pub fn advance(&mut self, now: NaiveDateTime) {
        self.next = self.next_roll(now);
    }
}
