// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Five-field cron rules evaluated in a schedule's timezone.
//!
//! Each field is expanded into an explicit value set, then handed to the
//! `cron` crate as a six-field expression with a fixed `0` seconds field.
//! Day-of-week accepts `0-7` (both `0` and `7` are Sunday) and `SUN-SAT`.
//! When both day fields are restricted a date matching either one fires,
//! as in classic cron.

use std::collections::BTreeSet;
use std::iter::Peekable;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use serde::Serialize;

use crate::error::{Error, Result};

/// Upper bound of occurrences counted by one projection.
pub const OCCURRENCE_SCAN_CAP: u64 = 100_000;

const MONTH_NAMES: &[&str] = &[
    "JAN", "FEB", "MAR", "APR", "MAY", "JUN", "JUL", "AUG", "SEP", "OCT", "NOV", "DEC",
];
const DAY_NAMES: &[&str] = &["SUN", "MON", "TUE", "WED", "THU", "FRI", "SAT"];

struct FieldSpec {
    name: &'static str,
    min: u32,
    max: u32,
    names: &'static [&'static str],
    /// Value of the first entry in `names`.
    names_base: u32,
}

const FIELDS: [FieldSpec; 5] = [
    FieldSpec { name: "minute", min: 0, max: 59, names: &[], names_base: 0 },
    FieldSpec { name: "hour", min: 0, max: 23, names: &[], names_base: 0 },
    FieldSpec { name: "day-of-month", min: 1, max: 31, names: &[], names_base: 1 },
    FieldSpec { name: "month", min: 1, max: 12, names: MONTH_NAMES, names_base: 1 },
    FieldSpec { name: "day-of-week", min: 0, max: 7, names: DAY_NAMES, names_base: 0 },
];

const DOM: usize = 2;
const DOW: usize = 4;

#[derive(Debug, Clone)]
struct Field {
    values: BTreeSet<u32>,
    wildcard: bool,
}

/// Projected run times of one schedule within a window.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Occurrences {
    pub times: Vec<DateTime<Utc>>,
    pub total_runs: u64,
    pub truncated: bool,
}

/// A parsed cron rule bound to a timezone.
#[derive(Debug, Clone)]
pub struct CronRule {
    expression: String,
    fields: Vec<Field>,
    /// Two schedules (day-of-month only, day-of-week only) when both day
    /// fields are restricted.
    schedules: Vec<cron::Schedule>,
    tz: Tz,
}

/// Parse an IANA timezone name. Empty means UTC.
pub fn parse_timezone(timezone: &str) -> Result<Tz> {
    let timezone = timezone.trim();
    if timezone.is_empty() {
        return Ok(Tz::UTC);
    }
    Tz::from_str(timezone).map_err(|_| Error::InvalidTimezone(timezone.to_string()))
}

/// Check a cron expression without binding a timezone.
pub fn validate_cron(expression: &str) -> Result<()> {
    CronRule::parse(expression, "UTC").map(|_| ())
}

impl CronRule {
    pub fn parse(expression: &str, timezone: &str) -> Result<Self> {
        let parts: Vec<&str> = expression.split_whitespace().collect();
        if parts.len() != 5 {
            return Err(Error::InvalidCron(format!(
                "'{}': expected 5 fields (minute hour day-of-month month day-of-week), got {}",
                expression.trim(),
                parts.len()
            )));
        }
        let fields = parts
            .iter()
            .zip(FIELDS.iter())
            .map(|(raw, spec)| parse_field(raw, spec))
            .collect::<std::result::Result<Vec<_>, String>>()
            .map_err(|msg| Error::InvalidCron(format!("'{}': {}", expression.trim(), msg)))?;
        let tz = parse_timezone(timezone)?;

        let variants: &[Option<usize>] = if !fields[DOM].wildcard && !fields[DOW].wildcard {
            &[Some(DOW), Some(DOM)]
        } else {
            &[None]
        };
        let schedules = variants
            .iter()
            .map(|relax| {
                cron::Schedule::from_str(&to_six_field(&fields, *relax)).map_err(|e| {
                    Error::InvalidCron(format!("'{}': {}", expression.trim(), e))
                })
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            expression: parts.join(" "),
            fields,
            schedules,
            tz,
        })
    }

    pub fn expression(&self) -> &str {
        &self.expression
    }

    pub fn timezone(&self) -> Tz {
        self.tz
    }

    /// First fire strictly after `after`.
    pub fn next_after(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        self.fires_after(after).next()
    }

    /// Ascending fires strictly after `after`, merged across schedules.
    fn fires_after(&self, after: DateTime<Utc>) -> Fires<'_> {
        let from = after.with_timezone(&self.tz);
        Fires {
            streams: self
                .schedules
                .iter()
                .map(|s| s.after(&from).peekable())
                .collect(),
            last: None,
        }
    }

    /// Fires in `[start, end]`, keeping at most `max` concrete times.
    pub fn occurrences(&self, start: DateTime<Utc>, end: DateTime<Utc>, max: usize) -> Occurrences {
        let mut times = Vec::new();
        let mut total_runs = 0u64;
        // `after` is exclusive, so step back one second to include `start`.
        for fire in self.fires_after(start - chrono::Duration::seconds(1)) {
            if fire > end || total_runs >= OCCURRENCE_SCAN_CAP {
                break;
            }
            total_runs += 1;
            if times.len() < max {
                times.push(fire);
            }
        }
        Occurrences {
            truncated: total_runs > times.len() as u64,
            times,
            total_runs,
        }
    }

    /// False for rules naming a single fixed date and time.
    pub fn is_recurring(&self) -> bool {
        let single = |i: usize| !self.fields[i].wildcard && self.fields[i].values.len() == 1;
        !(single(0) && single(1) && single(2) && single(3))
    }

    /// Approximate fires per day: step and list fields multiply, fixed fields count one.
    pub fn estimated_runs_per_day(&self) -> f64 {
        let count = |i: usize| self.fields[i].values.len() as f64;
        let mut runs = count(0) * count(1);
        let by_dom = (!self.fields[DOM].wildcard).then(|| count(DOM) / 30.44);
        let by_dow = (!self.fields[DOW].wildcard).then(|| count(DOW) / 7.0);
        runs *= match (by_dom, by_dow) {
            (Some(a), Some(b)) => a + b - a * b,
            (Some(a), None) | (None, Some(a)) => a,
            (None, None) => 1.0,
        };
        if !self.fields[3].wildcard {
            runs *= count(3) / 12.0;
        }
        (runs * 100.0).round() / 100.0
    }
}

struct Fires<'a> {
    streams: Vec<Peekable<cron::ScheduleIterator<'a, Tz>>>,
    last: Option<DateTime<Utc>>,
}

impl Iterator for Fires<'_> {
    type Item = DateTime<Utc>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let (idx, _) = self
                .streams
                .iter_mut()
                .enumerate()
                .filter_map(|(i, s)| s.peek().map(|t| (i, t.with_timezone(&Utc))))
                .min_by_key(|(_, t)| *t)?;
            let fire = self.streams[idx].next()?.with_timezone(&Utc);
            // Dates matching both day fields appear in both streams.
            if self.last.is_some_and(|last| fire <= last) {
                continue;
            }
            self.last = Some(fire);
            return Some(fire);
        }
    }
}

fn parse_field(raw: &str, spec: &FieldSpec) -> std::result::Result<Field, String> {
    let mut values = BTreeSet::new();
    for part in raw.split(',') {
        if part.is_empty() {
            return Err(format!("empty list entry in {} field", spec.name));
        }
        let (range, step) = match part.split_once('/') {
            Some((range, step)) => {
                let step: u32 = step
                    .parse()
                    .map_err(|_| format!("invalid step '{}' in {} field", step, spec.name))?;
                if step == 0 {
                    return Err(format!("step must be positive in {} field", spec.name));
                }
                (range, Some(step))
            }
            None => (part, None),
        };
        let (lo, hi) = if range == "*" {
            (spec.min, spec.max)
        } else if let Some((a, b)) = range.split_once('-') {
            let (a, b) = (parse_value(a, spec)?, parse_value(b, spec)?);
            if a > b {
                return Err(format!("range {}-{} is reversed in {} field", a, b, spec.name));
            }
            (a, b)
        } else {
            let v = parse_value(range, spec)?;
            // `a/N` runs from a to the field maximum.
            (v, if step.is_some() { spec.max } else { v })
        };
        let step = step.unwrap_or(1) as usize;
        values.extend((lo..=hi).step_by(step));
    }
    if spec.name == "day-of-week" && values.remove(&7) {
        values.insert(0);
    }
    Ok(Field {
        wildcard: raw == "*",
        values,
    })
}

fn parse_value(raw: &str, spec: &FieldSpec) -> std::result::Result<u32, String> {
    let upper = raw.to_ascii_uppercase();
    if let Some(pos) = spec.names.iter().position(|n| *n == upper) {
        return Ok(spec.names_base + pos as u32);
    }
    let v: u32 = raw
        .parse()
        .map_err(|_| format!("invalid value '{}' in {} field", raw, spec.name))?;
    if v < spec.min || v > spec.max {
        return Err(format!(
            "value {} out of range {}-{} in {} field",
            v, spec.min, spec.max, spec.name
        ));
    }
    Ok(v)
}

/// Render as a six-field expression; `relax` renders that field as `*`.
fn to_six_field(fields: &[Field], relax: Option<usize>) -> String {
    let mut out = vec!["0".to_string()];
    for (i, field) in fields.iter().enumerate() {
        if field.wildcard || relax == Some(i) {
            out.push("*".to_string());
        } else if i == DOW {
            let names: Vec<&str> = field
                .values
                .iter()
                .map(|v| DAY_NAMES[*v as usize % 7])
                .collect();
            out.push(names.join(","));
        } else {
            let list: Vec<String> = field.values.iter().map(u32::to_string).collect();
            out.push(list.join(","));
        }
    }
    out.join(" ")
}
