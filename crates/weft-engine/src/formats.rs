/*
 * formats.rs
 * Copyright (c) 2025 Posit, PBC
 */

//! Formatters and the per-execution format caches.
//!
//! Formatter construction is relatively expensive (format strings are
//! parsed, custom factories may be consulted), so the environment caches
//! constructed formatters and invalidates exactly the entries a setting
//! change can affect. Formatters advertise which settings they depend on
//! via [`NumberFormatter::is_locale_bound`] and the date/time
//! equivalents; entries that do not depend on the changed setting
//! survive the change with their identity intact.
//!
//! The date/time cache is a 16-slot array indexed by the value axes:
//! subtype (4) × zoneless (2) × SQL-sourced (2). A parallel array of
//! maps caches formatters for explicit format strings per axis
//! combination.

use std::collections::HashMap;
use std::sync::Arc;

use crate::error::TemplateError;
use crate::value::{DateTimeKind, DateTimeValue};

/// Formats numbers under one (format string, locale) combination.
pub trait NumberFormatter {
    fn format(&self, value: f64) -> Result<String, TemplateError>;

    /// Whether a locale change invalidates this formatter.
    fn is_locale_bound(&self) -> bool;
}

/// Formats date/time values under one (format string, subtype, locale,
/// time zone) combination.
pub trait DateTimeFormatter {
    fn format(&self, value: &DateTimeValue) -> Result<String, TemplateError>;

    fn is_locale_bound(&self) -> bool;

    /// Whether a time zone change invalidates this formatter. Formatters
    /// for zoneless values never convert and are not zone bound.
    fn is_time_zone_bound(&self) -> bool;
}

/// Creates number formatters for `@name`-style custom format strings.
pub trait NumberFormatFactory: Send + Sync {
    fn create(
        &self,
        params: &str,
        locale: &str,
    ) -> Result<Arc<dyn NumberFormatter>, TemplateError>;
}

/// Creates date/time formatters for `@name`-style custom format strings.
pub trait DateTimeFormatFactory: Send + Sync {
    fn create(
        &self,
        params: &str,
        kind: DateTimeKind,
        locale: &str,
        zone_offset_minutes: i32,
    ) -> Result<Arc<dyn DateTimeFormatter>, TemplateError>;
}

/// The standard number formats.
#[derive(Debug)]
pub(crate) struct StandardNumberFormat {
    style: NumberStyle,
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum NumberStyle {
    /// The `"number"` default: shortest natural rendering.
    Plain,
    /// `"computer"`: locale-independent, for machine consumption.
    Computer,
    /// `"0.00"`-style pattern with a fixed number of fraction digits.
    Fixed(usize),
}

impl StandardNumberFormat {
    /// Parses a standard number format string. `_locale` selects
    /// locale-specific separators in locale-bound styles.
    pub(crate) fn parse(format: &str, _locale: &str) -> Result<Self, TemplateError> {
        let style = match format {
            "number" => NumberStyle::Plain,
            "computer" | "c" => NumberStyle::Computer,
            pattern => {
                let valid = !pattern.is_empty()
                    && pattern.chars().all(|c| matches!(c, '0' | '#' | '.' | ','));
                if !valid {
                    return Err(TemplateError::InvalidFormatString {
                        format: pattern.to_string(),
                        detail: "expected \"number\", \"computer\", \"@name\", or a \
                                 0/#/./, pattern"
                            .to_string(),
                    });
                }
                let decimals = pattern
                    .split_once('.')
                    .map(|(_, frac)| frac.chars().filter(|c| *c == '0').count())
                    .unwrap_or(0);
                NumberStyle::Fixed(decimals)
            }
        };
        Ok(Self { style })
    }
}

impl NumberFormatter for StandardNumberFormat {
    fn format(&self, value: f64) -> Result<String, TemplateError> {
        let text = match self.style {
            NumberStyle::Plain | NumberStyle::Computer => {
                if value.fract() == 0.0 && value.abs() < 1e15 {
                    format!("{}", value as i64)
                } else {
                    format!("{}", value)
                }
            }
            NumberStyle::Fixed(decimals) => format!("{:.*}", decimals, value),
        };
        Ok(text)
    }

    fn is_locale_bound(&self) -> bool {
        self.style != NumberStyle::Computer
    }
}

/// Two-word boolean format, parsed from `"truewords,falsewords"`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BooleanFormat {
    true_text: String,
    false_text: String,
}

impl BooleanFormat {
    pub(crate) fn parse(format: &str) -> Result<Self, TemplateError> {
        match format.split_once(',') {
            Some((t, f)) if !t.is_empty() && !f.is_empty() && !f.contains(',') => Ok(Self {
                true_text: t.to_string(),
                false_text: f.to_string(),
            }),
            _ => Err(TemplateError::InvalidFormatString {
                format: format.to_string(),
                detail: "expected exactly two comma-separated non-empty words".to_string(),
            }),
        }
    }

    pub fn format(&self, value: bool) -> &str {
        if value { &self.true_text } else { &self.false_text }
    }
}

/// The standard date/time formats (ISO-style rendering; the named
/// styles vary the amount of detail).
#[derive(Debug)]
pub(crate) struct StandardDateTimeFormat {
    style: DateTimeStyle,
    kind: DateTimeKind,
    zoneless: bool,
    zone_offset_minutes: i32,
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum DateTimeStyle {
    /// Locale-independent ISO rendering.
    Iso,
    /// Locale-bound styles of increasing verbosity.
    Short,
    Medium,
    Long,
}

impl StandardDateTimeFormat {
    pub(crate) fn parse(
        format: &str,
        kind: DateTimeKind,
        zoneless: bool,
        zone_offset_minutes: i32,
        _locale: &str,
    ) -> Result<Self, TemplateError> {
        let style = match format {
            "iso" => DateTimeStyle::Iso,
            "short" => DateTimeStyle::Short,
            "medium" => DateTimeStyle::Medium,
            "long" => DateTimeStyle::Long,
            other => {
                return Err(TemplateError::InvalidFormatString {
                    format: other.to_string(),
                    detail: "expected \"iso\", \"short\", \"medium\", \"long\", or \"@name\""
                        .to_string(),
                });
            }
        };
        Ok(Self {
            style,
            kind,
            zoneless,
            zone_offset_minutes,
        })
    }
}

impl DateTimeFormatter for StandardDateTimeFormat {
    fn format(&self, value: &DateTimeValue) -> Result<String, TemplateError> {
        let kind = if self.kind == DateTimeKind::Unknown {
            value.kind
        } else {
            self.kind
        };
        if kind == DateTimeKind::Unknown {
            return Err(TemplateError::FormatFailure {
                format: format!("{:?}", self.style).to_lowercase(),
                detail: "the date-time subtype (date, time, or date-time) of the value is \
                         unknown; use an explicit subtype conversion"
                    .to_string(),
            });
        }
        let offset = if self.zoneless { 0 } else { self.zone_offset_minutes };
        let (y, mo, d, h, mi, s) = split_epoch_millis(value.epoch_millis, offset);
        let date_part = match self.style {
            DateTimeStyle::Short => format!("{:02}/{:02}/{:02}", mo, d, y % 100),
            _ => format!("{:04}-{:02}-{:02}", y, mo, d),
        };
        let time_part = match self.style {
            DateTimeStyle::Short => format!("{:02}:{:02}", h, mi),
            _ => format!("{:02}:{:02}:{:02}", h, mi, s),
        };
        let mut text = match kind {
            DateTimeKind::Date => date_part,
            DateTimeKind::Time => time_part,
            DateTimeKind::DateTime | DateTimeKind::Unknown => {
                format!("{} {}", date_part, time_part)
            }
        };
        if self.style == DateTimeStyle::Long && kind != DateTimeKind::Date && !self.zoneless {
            text.push_str(&format_zone_offset(self.zone_offset_minutes));
        }
        Ok(text)
    }

    fn is_locale_bound(&self) -> bool {
        self.style != DateTimeStyle::Iso
    }

    fn is_time_zone_bound(&self) -> bool {
        !self.zoneless
    }
}

/// Locale-aware string comparison. Ordering is Unicode code point
/// order; the locale determines cache identity and invalidation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Collator {
    locale: String,
}

impl Collator {
    pub(crate) fn new(locale: impl Into<String>) -> Self {
        Self {
            locale: locale.into(),
        }
    }

    pub fn locale(&self) -> &str {
        &self.locale
    }

    pub fn compare(&self, a: &str, b: &str) -> std::cmp::Ordering {
        a.cmp(b)
    }
}

pub(crate) const DATE_CACHE_ZONELESS_OFFSET: usize = 4;
pub(crate) const DATE_CACHE_SQL_OFFSET: usize = 8;
pub(crate) const DATE_CACHE_LEN: usize = 16;

pub(crate) fn date_cache_index(kind: DateTimeKind, zoneless: bool, sql: bool) -> usize {
    kind.index()
        + if zoneless { DATE_CACHE_ZONELESS_OFFSET } else { 0 }
        + if sql { DATE_CACHE_SQL_OFFSET } else { 0 }
}

/// Per-execution formatter caches. All entries are cleared when an
/// execution starts and when it ends; setting mutations clear exactly
/// the dependent entries.
pub(crate) struct FormatCaches {
    pub(crate) number_format: Option<Arc<dyn NumberFormatter>>,
    pub(crate) number_formats_by_string: HashMap<String, Arc<dyn NumberFormatter>>,
    pub(crate) boolean_format: Option<Arc<BooleanFormat>>,
    pub(crate) date_formats: [Option<Arc<dyn DateTimeFormatter>>; DATE_CACHE_LEN],
    pub(crate) date_formats_by_string:
        [Option<HashMap<String, Arc<dyn DateTimeFormatter>>>; DATE_CACHE_LEN],
    pub(crate) collator: Option<Arc<Collator>>,
    /// Outer `None`: not resolved yet. Inner `None`: resolved to "no
    /// charset configured".
    pub(crate) url_escaping_charset: Option<Option<String>>,
}

impl Default for FormatCaches {
    fn default() -> Self {
        Self {
            number_format: None,
            number_formats_by_string: HashMap::new(),
            boolean_format: None,
            date_formats: std::array::from_fn(|_| None),
            date_formats_by_string: std::array::from_fn(|_| None),
            collator: None,
            url_escaping_charset: None,
        }
    }
}

impl FormatCaches {
    pub(crate) fn clear_all(&mut self) {
        *self = Self::default();
    }

    /// A locale change drops locale-bound formatters and the collator;
    /// locale-independent entries keep their identity.
    pub(crate) fn on_locale_changed(&mut self) {
        if self
            .number_format
            .as_ref()
            .is_some_and(|f| f.is_locale_bound())
        {
            self.number_format = None;
        }
        self.number_formats_by_string
            .retain(|_, f| !f.is_locale_bound());
        for slot in self.date_formats.iter_mut() {
            if slot.as_ref().is_some_and(|f| f.is_locale_bound()) {
                *slot = None;
            }
        }
        for map in self.date_formats_by_string.iter_mut().flatten() {
            map.retain(|_, f| !f.is_locale_bound());
        }
        self.collator = None;
    }

    /// A normal time zone change only affects non-SQL date/time
    /// entries, and only those that are zone bound.
    pub(crate) fn on_time_zone_changed(&mut self) {
        self.clear_zone_bound_date_formats(0..DATE_CACHE_SQL_OFFSET);
    }

    /// An SQL time zone change only affects SQL-sourced entries.
    pub(crate) fn on_sql_time_zone_changed(&mut self) {
        self.clear_zone_bound_date_formats(DATE_CACHE_SQL_OFFSET..DATE_CACHE_LEN);
    }

    fn clear_zone_bound_date_formats(&mut self, range: std::ops::Range<usize>) {
        for index in range {
            if self.date_formats[index]
                .as_ref()
                .is_some_and(|f| f.is_time_zone_bound())
            {
                self.date_formats[index] = None;
            }
            if let Some(map) = self.date_formats_by_string[index].as_mut() {
                map.retain(|_, f| !f.is_time_zone_bound());
            }
        }
    }

    pub(crate) fn on_number_format_changed(&mut self) {
        self.number_format = None;
    }

    pub(crate) fn on_boolean_format_changed(&mut self) {
        self.boolean_format = None;
    }

    /// A default-format change for one subtype drops that subtype's
    /// slots across all four axis combinations.
    pub(crate) fn on_date_format_changed(&mut self, kind: DateTimeKind) {
        for block in 0..4 {
            let index = block * 4 + kind.index();
            self.date_formats[index] = None;
        }
    }

    pub(crate) fn on_url_escaping_charset_changed(&mut self) {
        self.url_escaping_charset = None;
    }
}

impl std::fmt::Debug for FormatCaches {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FormatCaches")
            .field("number_format", &self.number_format.is_some())
            .field("collator", &self.collator.is_some())
            .finish()
    }
}

/// Parses a fixed-offset time zone name: `UTC`, `GMT`, `Z`, or
/// `UTC±HH[:MM]` (and the `GMT`/bare `±HH[:MM]` spellings).
pub(crate) fn parse_zone_offset(tz: &str) -> Result<i32, TemplateError> {
    let rest = tz
        .strip_prefix("UTC")
        .or_else(|| tz.strip_prefix("GMT"))
        .unwrap_or(tz);
    if rest.is_empty() || rest == "Z" {
        return Ok(0);
    }
    let (sign, digits) = match rest.split_at(1) {
        ("+", d) => (1, d),
        ("-", d) => (-1, d),
        _ => {
            return Err(TemplateError::InvalidFormatString {
                format: tz.to_string(),
                detail: "unrecognized time zone; expected UTC, GMT, Z, or a ±HH[:MM] offset"
                    .to_string(),
            });
        }
    };
    let (hours, minutes) = match digits.split_once(':') {
        Some((h, m)) => (h, m),
        None => (digits, "0"),
    };
    let parsed = hours
        .parse::<i32>()
        .and_then(|h| minutes.parse::<i32>().map(|m| h * 60 + m));
    match parsed {
        Ok(total) if total <= 18 * 60 => Ok(sign * total),
        _ => Err(TemplateError::InvalidFormatString {
            format: tz.to_string(),
            detail: "invalid time zone offset".to_string(),
        }),
    }
}

fn format_zone_offset(minutes: i32) -> String {
    if minutes == 0 {
        " UTC".to_string()
    } else {
        let sign = if minutes < 0 { '-' } else { '+' };
        let abs = minutes.abs();
        format!(" UTC{}{:02}:{:02}", sign, abs / 60, abs % 60)
    }
}

/// Epoch milliseconds → civil date/time fields at a fixed offset.
fn split_epoch_millis(ms: i64, offset_minutes: i32) -> (i64, u32, u32, u32, u32, u32) {
    let shifted = ms + i64::from(offset_minutes) * 60_000;
    let days = shifted.div_euclid(86_400_000);
    let in_day = shifted.rem_euclid(86_400_000) / 1000;
    let (y, mo, d) = civil_from_days(days);
    let h = (in_day / 3600) as u32;
    let mi = (in_day % 3600 / 60) as u32;
    let s = (in_day % 60) as u32;
    (y, mo, d, h, mi, s)
}

/// Days since 1970-01-01 → proleptic Gregorian (year, month, day).
fn civil_from_days(z: i64) -> (i64, u32, u32) {
    let z = z + 719_468;
    let era = z.div_euclid(146_097);
    let doe = z.rem_euclid(146_097);
    let yoe = (doe - doe / 1460 + doe / 36_524 - doe / 146_096) / 365;
    let y = yoe + era * 400;
    let doy = doe - (365 * yoe + yoe / 4 - yoe / 100);
    let mp = (5 * doy + 2) / 153;
    let d = (doy - (153 * mp + 2) / 5 + 1) as u32;
    let m = if mp < 10 { mp + 3 } else { mp - 9 } as u32;
    (if m <= 2 { y + 1 } else { y }, m, d)
}
