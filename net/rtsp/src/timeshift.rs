// Copyright (C) 2025 streamrelay developers
//
// This Source Code Form is subject to the terms of the Mozilla Public License, v2.0.
// If a copy of the MPL was not distributed with this file, You can obtain one at
// <https://mozilla.org/MPL/2.0/>.
//
// SPDX-License-Identifier: MPL-2.0

//! Catchup (timeshift) range translation.
//!
//! Players hand us wall-clock ranges in whatever format their firmware
//! grew up with; the RTSP server upstream expects them normalized. Four
//! families are understood:
//!
//! * 14-digit `yyyyMMddHHmmss` (no timezone info)
//! * the same with a trailing `GMT` (explicit UTC)
//! * a unix timestamp of up to 10 digits (explicit UTC)
//! * ISO-8601, with a `Z`/`±HH:MM` suffix or without one
//!
//! Formats without timezone info are interpreted in the client's zone,
//! derived from a `TZ/UTC±H` marker in the User-Agent, defaulting to UTC.
//! A configured seek offset shifts both endpoints. The output stays in the
//! input's syntactic family, and an untranslated endpoint is passed through
//! byte for byte, unparseable ranges verbatim.

use chrono::{
    DateTime, FixedOffset, NaiveDateTime, Offset, SecondsFormat, TimeZone, Utc,
};

/// Range parameter names recognized on a request, in priority order: the
/// built-in ones first, then the operator-configured name.
pub fn seek_param_names(configured: Option<&str>) -> Vec<&str> {
    let mut names = vec!["playseek", "tvdr"];
    if let Some(name) = configured {
        if !names.contains(&name) {
            names.push(name);
        }
    }
    names
}

/// Client-derived translation inputs.
#[derive(Debug, Clone, Copy, Default)]
pub struct TimeshiftContext {
    /// Hours east of UTC the client lives in (from the User-Agent marker).
    pub tz_offset_hours: i32,
    /// Operator-configured correction, applied to both endpoints.
    pub seek_offset_secs: i64,
}

/// Extract the `TZ/UTC±H` marker from a User-Agent header value.
pub fn tz_offset_from_user_agent(user_agent: &str) -> Option<i32> {
    let idx = user_agent.find("TZ/UTC")?;
    let rest = &user_agent[idx + "TZ/UTC".len()..];
    let mut chars = rest.chars();
    let sign = match chars.next() {
        Some('+') => 1,
        Some('-') => -1,
        _ => return Some(0),
    };
    let digits: String = chars.take_while(|c| c.is_ascii_digit()).collect();
    if digits.is_empty() {
        return Some(0);
    }
    let hours: i32 = digits.parse().ok()?;
    (hours <= 14).then_some(sign * hours)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Family {
    Compact,
    CompactGmt,
    Unix,
    IsoZ,
    IsoOffset(FixedOffset),
    IsoNaive,
}

#[derive(Debug, Clone, Copy)]
struct Endpoint {
    family: Family,
    utc: DateTime<Utc>,
}

impl Endpoint {
    /// `true` if the input format carries its own timezone information, in
    /// which case the client zone never applies.
    fn has_explicit_tz(&self) -> bool {
        !matches!(self.family, Family::Compact | Family::IsoNaive)
    }
}

const COMPACT_FMT: &str = "%Y%m%d%H%M%S";
const ISO_NAIVE_FMT: &str = "%Y-%m-%dT%H:%M:%S";

fn parse_endpoint(s: &str, client_tz: FixedOffset) -> Option<Endpoint> {
    if s.len() == 14 && s.bytes().all(|b| b.is_ascii_digit()) {
        let naive = NaiveDateTime::parse_from_str(s, COMPACT_FMT).ok()?;
        let local = client_tz.from_local_datetime(&naive).single()?;
        return Some(Endpoint {
            family: Family::Compact,
            utc: local.with_timezone(&Utc),
        });
    }

    if let Some(digits) = s.strip_suffix("GMT") {
        if digits.len() == 14 && digits.bytes().all(|b| b.is_ascii_digit()) {
            let naive = NaiveDateTime::parse_from_str(digits, COMPACT_FMT).ok()?;
            return Some(Endpoint {
                family: Family::CompactGmt,
                utc: Utc.from_utc_datetime(&naive),
            });
        }
        return None;
    }

    if !s.is_empty() && s.len() <= 10 && s.bytes().all(|b| b.is_ascii_digit()) {
        let secs: i64 = s.parse().ok()?;
        return Some(Endpoint {
            family: Family::Unix,
            utc: DateTime::from_timestamp(secs, 0)?,
        });
    }

    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        let family = if s.ends_with('Z') || s.ends_with('z') {
            Family::IsoZ
        } else {
            Family::IsoOffset(dt.offset().fix())
        };
        return Some(Endpoint {
            family,
            utc: dt.with_timezone(&Utc),
        });
    }

    if let Ok(naive) = NaiveDateTime::parse_from_str(s, ISO_NAIVE_FMT) {
        let local = client_tz.from_local_datetime(&naive).single()?;
        return Some(Endpoint {
            family: Family::IsoNaive,
            utc: local.with_timezone(&Utc),
        });
    }

    None
}

fn emit(endpoint: &Endpoint, shifted: DateTime<Utc>) -> String {
    match endpoint.family {
        Family::Compact => shifted.format(COMPACT_FMT).to_string(),
        Family::CompactGmt => format!("{}GMT", shifted.format(COMPACT_FMT)),
        Family::Unix => shifted.timestamp().to_string(),
        Family::IsoZ => shifted.to_rfc3339_opts(SecondsFormat::Secs, true),
        Family::IsoOffset(offset) => shifted
            .with_timezone(&offset)
            .to_rfc3339_opts(SecondsFormat::Secs, false),
        Family::IsoNaive => shifted.format(ISO_NAIVE_FMT).to_string(),
    }
}

fn translate_endpoint(raw: &str, ctx: &TimeshiftContext, client_tz: FixedOffset) -> Option<String> {
    if raw.is_empty() {
        return Some(String::new());
    }
    let endpoint = parse_endpoint(raw, client_tz)?;

    // Nothing to change: hand the original bytes back so the round trip is
    // exact whatever formatting quirks the input had.
    let conversion_applies = !endpoint.has_explicit_tz() && ctx.tz_offset_hours != 0;
    if ctx.seek_offset_secs == 0 && !conversion_applies {
        return Some(raw.to_string());
    }

    let shifted = endpoint.utc + chrono::Duration::seconds(ctx.seek_offset_secs);
    Some(emit(&endpoint, shifted))
}

/// Split a range on the `-` separating two endpoints. ISO-8601 endpoints
/// contain `-` themselves, so every split position is tried until both
/// sides parse; a sole endpoint is an open range.
fn split_range(raw: &str, client_tz: FixedOffset) -> Option<(String, String)> {
    if let Some(start) = raw.strip_suffix('-') {
        if parse_endpoint(start, client_tz).is_some() {
            return Some((start.to_string(), String::new()));
        }
    }
    for (idx, _) in raw.match_indices('-') {
        if idx == 0 {
            continue;
        }
        let (start, end) = (&raw[..idx], &raw[idx + 1..]);
        if parse_endpoint(start, client_tz).is_some()
            && (end.is_empty() || parse_endpoint(end, client_tz).is_some())
        {
            return Some((start.to_string(), end.to_string()));
        }
    }
    // A single value is an open range starting there.
    parse_endpoint(raw, client_tz).map(|_| (raw.to_string(), String::new()))
}

/// Translate a raw range parameter value. Unsupported input is passed
/// through verbatim; supported input is re-emitted in its own format with
/// timezone conversion and the seek offset applied.
pub fn translate_range(raw: &str, ctx: &TimeshiftContext) -> String {
    let client_tz = match FixedOffset::east_opt(ctx.tz_offset_hours * 3600) {
        Some(tz) => tz,
        None => Utc.fix(),
    };

    let Some((start, end)) = split_range(raw, client_tz) else {
        return raw.to_string();
    };

    let translated_start = translate_endpoint(&start, ctx, client_tz);
    let translated_end = translate_endpoint(&end, ctx, client_tz);
    match (translated_start, translated_end) {
        (Some(s), Some(e)) => format!("{s}-{e}"),
        _ => raw.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx(tz: i32, offset: i64) -> TimeshiftContext {
        TimeshiftContext {
            tz_offset_hours: tz,
            seek_offset_secs: offset,
        }
    }

    #[test]
    fn user_agent_marker() {
        assert_eq!(tz_offset_from_user_agent("Player/1.0 TZ/UTC+8"), Some(8));
        assert_eq!(tz_offset_from_user_agent("Player TZ/UTC-5 x"), Some(-5));
        assert_eq!(tz_offset_from_user_agent("Player TZ/UTC"), Some(0));
        assert_eq!(tz_offset_from_user_agent("Player/1.0"), None);
        assert_eq!(tz_offset_from_user_agent("TZ/UTC+99"), None);
    }

    #[test]
    fn compact_converted_to_utc() {
        // noon in UTC+8 is 04:00 UTC
        assert_eq!(
            translate_range("20240101120000-20240101130000", &ctx(8, 0)),
            "20240101040000-20240101050000"
        );
    }

    #[test]
    fn compact_without_client_tz_is_untouched() {
        let raw = "20240101120000-20240101130000";
        assert_eq!(translate_range(raw, &ctx(0, 0)), raw);
    }

    #[test]
    fn gmt_suffix_never_converted() {
        let raw = "20240101120000GMT-20240101130000GMT";
        assert_eq!(translate_range(raw, &ctx(8, 0)), raw);
    }

    #[test]
    fn unix_timestamp_never_converted() {
        assert_eq!(translate_range("1704110400-", &ctx(8, 0)), "1704110400-");
    }

    #[test]
    fn seek_offset_applies_to_both_endpoints() {
        assert_eq!(
            translate_range("1704110400-1704114000", &ctx(8, -60)),
            "1704110340-1704113940"
        );
        assert_eq!(
            translate_range("20240101120000GMT-", &ctx(0, 3600)),
            "20240101130000GMT-"
        );
    }

    #[test]
    fn iso_with_suffix_keeps_family() {
        let raw = "2024-01-01T12:00:00Z-2024-01-01T13:00:00Z";
        assert_eq!(translate_range(raw, &ctx(8, 0)), raw);
        assert_eq!(
            translate_range("2024-01-01T12:00:00Z-", &ctx(0, 60)),
            "2024-01-01T12:01:00Z-"
        );
        assert_eq!(
            translate_range("2024-01-01T12:00:00+08:00-", &ctx(0, 60)),
            "2024-01-01T12:01:00+08:00-"
        );
    }

    #[test]
    fn iso_naive_uses_client_zone() {
        assert_eq!(
            translate_range("2024-01-01T12:00:00-", &ctx(8, 0)),
            "2024-01-01T04:00:00-"
        );
    }

    #[test]
    fn single_value_becomes_open_range() {
        assert_eq!(translate_range("1704110400", &ctx(0, 0)), "1704110400-");
        assert_eq!(
            translate_range("20240101120000", &ctx(8, 0)),
            "20240101040000-"
        );
    }

    #[test]
    fn unparseable_passes_through() {
        assert_eq!(translate_range("now-end", &ctx(8, 60)), "now-end");
        assert_eq!(translate_range("", &ctx(8, 60)), "");
        assert_eq!(translate_range("2024010112000", &ctx(8, 0)), "2024010112000");
    }

    #[test]
    fn roundtrip_is_bytewise_without_changes() {
        for raw in [
            "20240101120000-20240101130000",
            "20240101120000GMT-",
            "1704110400-1704114000",
            "2024-01-01T12:00:00Z-2024-01-01T13:00:00Z",
            "2024-01-01T12:00:00+05:30-",
            "2024-01-01T12:00:00-",
        ] {
            assert_eq!(translate_range(raw, &ctx(0, 0)), raw, "{raw}");
        }
    }

    #[test]
    fn param_priority() {
        assert_eq!(seek_param_names(None), vec!["playseek", "tvdr"]);
        assert_eq!(
            seek_param_names(Some("seek")),
            vec!["playseek", "tvdr", "seek"]
        );
        assert_eq!(seek_param_names(Some("tvdr")), vec!["playseek", "tvdr"]);
    }
}
