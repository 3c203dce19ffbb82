//! Time parsing with timezone fallback, and the `<group> <format> <op> <bound>`
//! date-condition language used to filter object keys.

use crate::error::ConfigError;
use anyhow::{anyhow, Result};
use chrono::format::{Fixed, Item, StrftimeItems};
use chrono::{DateTime, Duration, FixedOffset, NaiveDate, NaiveDateTime, NaiveTime, TimeDelta, TimeZone, Utc};
use chrono_tz::Tz;
use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

pub const MAX_DATE_CONDITIONS: usize = 20;

/// Directives that make a format carry its own offset; the configured zone is then ignored.
const ZONE_DIRECTIVES: [&str; 4] = ["%z", "%:z", "%::z", "%#z"];

/// Zone-carrying layouts tried when no explicit format is configured.
const ZONED_FALLBACKS: [&str; 3] = [
    "%d/%b/%Y:%H:%M:%S %z",
    "%Y-%m-%d %H:%M:%S %z",
    "%Y-%m-%d %H:%M:%S%.f %z",
];

/// Naive layouts tried when no explicit format is configured.
const NAIVE_FALLBACKS: [&str; 6] = [
    "%Y-%m-%dT%H:%M:%S%.f",
    "%Y-%m-%d %H:%M:%S%.f",
    "%Y/%m/%d %H:%M:%S",
    "%d/%b/%Y:%H:%M:%S",
    "%b %e %H:%M:%S %Y",
    "%Y-%m-%dT%H:%M",
];

/// Timezone applied to times that do not carry their own offset.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Zone {
    Named(Tz),
    Fixed(FixedOffset),
}

impl Default for Zone {
    fn default() -> Self {
        Zone::Named(Tz::UTC)
    }
}

impl Zone {
    /// Interpret a wall-clock time in this zone. Times that fall into a DST gap are
    /// shifted forward by an hour, ambiguous ones resolve to the earlier instant.
    pub fn localize(&self, naive: NaiveDateTime) -> Option<DateTime<Utc>> {
        match self {
            Zone::Named(tz) => tz
                .from_local_datetime(&naive)
                .earliest()
                .or_else(|| tz.from_local_datetime(&(naive + Duration::hours(1))).earliest())
                .map(|dt| dt.with_timezone(&Utc)),
            Zone::Fixed(off) => off
                .from_local_datetime(&naive)
                .single()
                .map(|dt| dt.with_timezone(&Utc)),
        }
    }
}

impl FromStr for Zone {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.eq_ignore_ascii_case("utc") || s == "Z" {
            return Ok(Zone::Named(Tz::UTC));
        }
        if let Some(off) = parse_fixed_offset(s) {
            return Ok(Zone::Fixed(off));
        }
        s.parse::<Tz>()
            .map(Zone::Named)
            .map_err(|_| ConfigError::UnknownTimezone(s.to_string()))
    }
}

impl fmt::Display for Zone {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Zone::Named(tz) => write!(f, "{}", tz.name()),
            Zone::Fixed(off) => write!(f, "{off}"),
        }
    }
}

/// `+09:00`, `-0530`, `+09`.
fn parse_fixed_offset(s: &str) -> Option<FixedOffset> {
    let sign = match s.as_bytes().first()? {
        b'+' => 1,
        b'-' => -1,
        _ => return None,
    };
    let digits: String = s[1..].chars().filter(|c| *c != ':').collect();
    if !digits.chars().all(|c| c.is_ascii_digit()) {
        return None;
    }
    let (h, m) = match digits.len() {
        2 => (digits.parse::<i32>().ok()?, 0),
        4 => (digits[..2].parse::<i32>().ok()?, digits[2..].parse::<i32>().ok()?),
        _ => return None,
    };
    if h > 23 || m > 59 {
        return None;
    }
    FixedOffset::east_opt(sign * (h * 3600 + m * 60))
}

/// True when `format` parses as a strftime string.
pub fn is_valid_format(format: &str) -> bool {
    !StrftimeItems::new(format).any(|item| matches!(item, Item::Error))
}

/// `%Z` names a zone but chrono cannot resolve a name to an offset while parsing.
pub fn has_zone_name(format: &str) -> bool {
    StrftimeItems::new(format).any(|item| matches!(item, Item::Fixed(Fixed::TimezoneName)))
}

fn check_format(format: &str) -> Result<(), ConfigError> {
    if !is_valid_format(format) {
        return Err(ConfigError::InvalidTimeFormat(format.to_string()));
    }
    if has_zone_name(format) {
        return Err(ConfigError::ZoneNameInFormat(format.to_string()));
    }
    Ok(())
}

fn has_zone_directive(format: &str) -> bool {
    ZONE_DIRECTIVES.iter().any(|d| format.contains(d))
}

fn has_any(format: &str, directives: &[&str]) -> bool {
    directives.iter().any(|d| format.contains(d))
}

/// Parse a naive time, tolerating formats that stop at the month or year.
fn parse_naive(text: &str, format: &str) -> Result<NaiveDateTime> {
    if let Ok(dt) = NaiveDateTime::parse_from_str(text, format) {
        return Ok(dt);
    }
    if let Ok(d) = NaiveDate::parse_from_str(text, format) {
        return Ok(d.and_time(NaiveTime::MIN));
    }
    if !has_any(format, &["%d", "%e", "%j", "%F", "%D", "%x"]) {
        let (fmt, txt) = if has_any(format, &["%m", "%b", "%B", "%h"]) {
            (format!("{format}|%d"), format!("{text}|01"))
        } else {
            (format!("{format}|%m|%d"), format!("{text}|01|01"))
        };
        if let Ok(d) = NaiveDate::parse_from_str(&txt, &fmt) {
            return Ok(d.and_time(NaiveTime::MIN));
        }
    }
    Err(anyhow!("'{text}' does not match time format '{format}'"))
}

/// Parse `text` into a UTC instant.
///
/// An offset present in the text (RFC 3339 input, or a format with `%z`) wins; otherwise the
/// wall-clock time is interpreted in `zone`. Formats with `%Z` are refused when configured.
pub fn parse_time(text: &str, format: Option<&str>, zone: &Zone) -> Result<DateTime<Utc>> {
    let text = text.trim();
    let naive = match format {
        Some(fmt) if has_zone_directive(fmt) => {
            return Ok(DateTime::parse_from_str(text, fmt)?.with_timezone(&Utc));
        }
        Some(fmt) => parse_naive(text, fmt)?,
        None => {
            if let Ok(dt) = DateTime::parse_from_rfc3339(text) {
                return Ok(dt.with_timezone(&Utc));
            }
            if let Ok(dt) = DateTime::parse_from_rfc2822(text) {
                return Ok(dt.with_timezone(&Utc));
            }
            if let Some(dt) = ZONED_FALLBACKS
                .iter()
                .find_map(|f| DateTime::parse_from_str(text, f).ok())
            {
                return Ok(dt.with_timezone(&Utc));
            }
            NAIVE_FALLBACKS
                .iter()
                .find_map(|f| NaiveDateTime::parse_from_str(text, f).ok())
                .or_else(|| {
                    NaiveDate::parse_from_str(text, "%Y-%m-%d")
                        .ok()
                        .map(|d| d.and_time(NaiveTime::MIN))
                })
                .ok_or_else(|| anyhow!("unrecognised time '{text}'"))?
        }
    };
    zone.localize(naive)
        .ok_or_else(|| anyhow!("'{text}' does not exist in timezone {zone}"))
}

// ----------------------------- Conditions ------------------------------------

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Comparison {
    Gt,
    Lt,
    Ge,
    Le,
    Eq,
    Ne,
}

impl Comparison {
    #[inline]
    pub fn holds(self, ord: Ordering) -> bool {
        match self {
            Comparison::Gt => ord == Ordering::Greater,
            Comparison::Lt => ord == Ordering::Less,
            Comparison::Ge => ord != Ordering::Less,
            Comparison::Le => ord != Ordering::Greater,
            Comparison::Eq => ord == Ordering::Equal,
            Comparison::Ne => ord != Ordering::Equal,
        }
    }
}

impl FromStr for Comparison {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            ">" => Comparison::Gt,
            "<" => Comparison::Lt,
            ">=" => Comparison::Ge,
            "<=" => Comparison::Le,
            "==" => Comparison::Eq,
            "!=" => Comparison::Ne,
            other => return Err(ConfigError::InvalidOperator(other.to_string())),
        })
    }
}

/// Right-hand side of a condition.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Bound {
    /// Signed seconds relative to the poll time.
    Relative(i64),
    Absolute(DateTime<Utc>),
}

impl Bound {
    /// The instant this bound stands for at `now`; `None` when a relative bound leaves the
    /// representable range.
    pub fn resolve(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        match *self {
            Bound::Relative(secs) => now.checked_add_signed(TimeDelta::try_seconds(secs)?),
            Bound::Absolute(t) => Some(t),
        }
    }

    fn parse(s: &str, zone: &Zone) -> Result<Self> {
        let bytes = s.as_bytes();
        if bytes.len() > 1
            && matches!(bytes[0], b'+' | b'-')
            && bytes[1..].iter().all(u8::is_ascii_digit)
        {
            return Ok(Bound::Relative(s.parse::<i64>()?));
        }
        if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
            return Ok(Bound::Absolute(dt.with_timezone(&Utc)));
        }
        let naive = NaiveDateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S")
            .or_else(|_| NaiveDate::parse_from_str(s, "%Y-%m-%d").map(|d| d.and_time(NaiveTime::MIN)))
            .map_err(|_| anyhow!("'{s}' is neither [+-]seconds nor ISO-8601"))?;
        zone.localize(naive)
            .map(Bound::Absolute)
            .ok_or_else(|| anyhow!("'{s}' does not exist in timezone {zone}"))
    }
}

/// One `<group> <format> <op> <bound>` rule, e.g. `date %Y%m%d >= -86400`.
#[derive(Clone, Debug)]
pub struct DateCondition {
    pub group: String,
    pub format: Option<String>,
    pub op: Comparison,
    pub bound: Bound,
}

impl DateCondition {
    /// `index` is 1-based and only used for error messages.
    pub fn parse(index: usize, raw: &str, zone: &Zone) -> Result<Self, ConfigError> {
        let err = |reason: String| ConfigError::DateCondition { index, reason };

        let raw = raw.trim();
        let (group, rest) = raw
            .split_once(' ')
            .ok_or_else(|| err(format!("expected '<group> <format> <op> <bound>', got '{raw}'")))?;
        let mut parts = rest.trim().rsplitn(3, ' ');
        let bound_str = parts.next().unwrap_or_default();
        let op_str = parts
            .next()
            .ok_or_else(|| err(format!("missing comparison operator in '{raw}'")))?;
        let format = parts.next().map(str::trim).filter(|f| !f.is_empty()).map(str::to_string);

        if let Some(f) = &format {
            check_format(f).map_err(|e| err(e.to_string()))?;
        }
        let op = op_str.parse::<Comparison>()?;
        let bound = Bound::parse(bound_str, zone).map_err(|e| err(e.to_string()))?;

        Ok(Self { group: group.to_string(), format, op, bound })
    }

    /// Evaluate against the value captured for `group`.
    ///
    /// An absent value passes: the condition only constrains keys that carry the group.
    pub fn evaluate(&self, value: Option<&str>, now: DateTime<Utc>, zone: &Zone) -> Result<bool> {
        let Some(text) = value else { return Ok(true) };
        let left = parse_time(text, self.format.as_deref(), zone)?;
        let right = self
            .bound
            .resolve(now)
            .ok_or_else(|| anyhow!("bound {:?} is out of range at {now}", self.bound))?;
        Ok(self.op.holds(left.cmp(&right)))
    }
}

/// `timestamp` option: `<group> [<format>]`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TimestampSpec {
    pub group: String,
    pub format: Option<String>,
}

impl FromStr for TimestampSpec {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let (group, format) = match s.split_once(' ') {
            Some((g, f)) => (g, Some(f.trim()).filter(|f| !f.is_empty())),
            None => (s, None),
        };
        if group.is_empty() {
            return Err(ConfigError::Missing("timestamp group name"));
        }
        if let Some(f) = format {
            check_format(f)?;
        }
        Ok(Self { group: group.to_string(), format: format.map(str::to_string) })
    }
}
