use std::cmp::{max, min};

use chrono::{NaiveDate, NaiveTime, TimeZone};

use crate::clock;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RangeFilter {
    pub from: Option<i64>,
    pub to: Option<i64>, // exclusive
}

impl RangeFilter {
    pub fn has_range(&self) -> bool {
        self.from.is_some() || self.to.is_some()
    }

    pub fn contains(&self, ms: i64) -> bool {
        self.from.map_or(true, |from| ms >= from) && self.to.map_or(true, |to| ms < to)
    }

    pub fn merge(&mut self, other: RangeFilter) {
        if let Some(from) = other.from {
            self.from = Some(match self.from {
                Some(existing) => max(existing, from),
                None => from,
            });
        }
        if let Some(to) = other.to {
            self.to = Some(match self.to {
                Some(existing) => min(existing, to),
                None => to,
            });
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct SearchQuery {
    pub terms: Vec<String>,
    pub title_terms: Vec<String>,
    pub tags: Vec<String>,
    pub created: RangeFilter,
    pub updated: RangeFilter,
    pub regex_pattern: Option<String>,
}

impl SearchQuery {
    pub fn has_terms(&self) -> bool {
        !self.terms.is_empty() || !self.title_terms.is_empty()
    }

    pub fn has_filters(&self) -> bool {
        !self.tags.is_empty() || self.created.has_range() || self.updated.has_range()
    }

    pub fn is_empty(&self) -> bool {
        !self.has_terms() && !self.has_filters() && self.regex_pattern.is_none()
    }

    pub fn highlight_terms(&self) -> Vec<String> {
        let mut terms = self.terms.clone();
        terms.extend(self.title_terms.iter().cloned());
        terms
    }
}

/// Parses `tag:x title:y created:2026-01-01..2026-02-01 free terms`. Date
/// ranges are local calendar days in `tz`; the upper bound is exclusive.
pub fn parse_query<Tz: TimeZone>(tz: &Tz, input: &str) -> SearchQuery {
    let mut query = SearchQuery::default();
    for raw in input.split_whitespace() {
        if let Some(tag) = raw.strip_prefix("tag:") {
            if let Some(value) = sanitize_term(tag) {
                query.tags.push(value.to_lowercase());
            }
            continue;
        }
        if let Some(term) = raw.strip_prefix("title:") {
            if let Some(value) = sanitize_term(term) {
                query.title_terms.push(value);
            }
            continue;
        }
        if let Some(range) = raw.strip_prefix("created:") {
            query.created.merge(parse_date_range(tz, range));
            continue;
        }
        if let Some(range) = raw.strip_prefix("updated:") {
            query.updated.merge(parse_date_range(tz, range));
            continue;
        }
        if let Some(value) = sanitize_term(raw) {
            query.terms.push(value);
        }
    }
    query
}

pub fn regex_pattern_from_input(input: &str) -> Option<String> {
    let parts: Vec<&str> = input
        .split_whitespace()
        .filter(|raw| {
            !(raw.starts_with("tag:")
                || raw.starts_with("title:")
                || raw.starts_with("created:")
                || raw.starts_with("updated:"))
        })
        .collect();
    if parts.is_empty() {
        None
    } else {
        Some(parts.join(" "))
    }
}

fn sanitize_term(raw: &str) -> Option<String> {
    let term: String = raw
        .chars()
        .filter(|ch| ch.is_alphanumeric() || matches!(ch, '-' | '_' | '.' | '/'))
        .collect();
    if term.is_empty() {
        None
    } else {
        Some(term)
    }
}

fn parse_date_range<Tz: TimeZone>(tz: &Tz, spec: &str) -> RangeFilter {
    let mut range = RangeFilter::default();
    let parts: Vec<&str> = spec.split("..").collect();
    match parts.as_slice() {
        [single] => {
            if let Some((from, to)) = parse_single_date(tz, single) {
                range.from = Some(from);
                range.to = Some(to);
            }
        }
        [from, to] => {
            if let Some((start, _)) = parse_single_date(tz, from) {
                range.from = Some(start);
            }
            if let Some((_, end)) = parse_single_date(tz, to) {
                range.to = Some(end);
            }
        }
        _ => {}
    }
    range
}

fn parse_single_date<Tz: TimeZone>(tz: &Tz, input: &str) -> Option<(i64, i64)> {
    let date = NaiveDate::parse_from_str(input, "%Y-%m-%d").ok()?;
    let from = clock::from_local(tz, date.and_time(NaiveTime::MIN));
    Some((from, clock::next_day_start(tz, from)))
}
