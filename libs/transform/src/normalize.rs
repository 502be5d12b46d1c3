//! Нормализация отдельных полей. Все функции чистые и не зависят друг
//! от друга; `None` означает «неприменимо к этому значению».

use std::net::{Ipv4Addr, Ipv6Addr};

use chrono::{DateTime, SecondsFormat, Utc};
use serde_json::Value;

// ═══════════════════════════════════════════════════════════════
//  IP
// ═══════════════════════════════════════════════════════════════

/// Каноническая полная запись IPv4/IPv6 адреса.
///
/// - IPv4: четыре октета, каждый дополнен нулями до трёх цифр
///   (`192.168.1.1` → `192.168.001.001`).
/// - IPv6: восемь групп по четыре hex-цифры в нижнем регистре,
///   без сжатия `::` (`2001:db8::1` → `2001:0db8:0000:0000:0000:0000:0000:0001`).
///
/// Октеты IPv4 с ведущими нулями читаются как десятичные, поэтому
/// повторная нормализация канонической формы возвращает её же.
pub fn normalize_ip(raw: &str) -> Option<String> {
    if raw.contains(':') {
        let addr: Ipv6Addr = raw.parse().ok()?;
        Some(explode_v6(&addr))
    } else {
        parse_dotted_quad(raw).map(|addr| explode_v4(&addr))
    }
}

/// Dotted-quad с 1–3 десятичными цифрами в каждом октете.
fn parse_dotted_quad(raw: &str) -> Option<Ipv4Addr> {
    let mut octets = [0u8; 4];
    let mut parts = raw.split('.');
    for slot in octets.iter_mut() {
        let part = parts.next()?;
        if part.is_empty() || part.len() > 3 || !part.bytes().all(|b| b.is_ascii_digit()) {
            return None;
        }
        *slot = part.parse().ok()?;
    }
    if parts.next().is_some() {
        return None;
    }
    Some(Ipv4Addr::from(octets))
}

fn explode_v4(addr: &Ipv4Addr) -> String {
    let [a, b, c, d] = addr.octets();
    format!("{a:03}.{b:03}.{c:03}.{d:03}")
}

fn explode_v6(addr: &Ipv6Addr) -> String {
    addr.segments().map(|group| format!("{group:04x}")).join(":")
}

// ═══════════════════════════════════════════════════════════════
//  Locale
// ═══════════════════════════════════════════════════════════════

/// Locale в верхнем регистре. Определена для любой строки, включая пустую.
pub fn normalize_locale(raw: &str) -> String {
    raw.to_uppercase()
}

// ═══════════════════════════════════════════════════════════════
//  Timestamp
// ═══════════════════════════════════════════════════════════════

/// Epoch-секунды (JSON число или числовая строка) → RFC 3339 в UTC.
///
/// Дробная часть входа сохраняется: до 3 значащих цифр дают миллисекунды,
/// до 6 дают микросекунды, больше дают наносекунды. Целые секунды
/// выводятся без дробной части.
pub fn normalize_timestamp(epoch: &Value) -> Option<String> {
    match epoch {
        Value::Number(n) => epoch_seconds_to_iso8601(&n.to_string()),
        Value::String(s) => epoch_seconds_to_iso8601(s.trim()),
        _ => None,
    }
}

/// Текстовое представление epoch-секунд → RFC 3339 (`...Z`).
pub fn epoch_seconds_to_iso8601(text: &str) -> Option<String> {
    let (instant, digits) = parse_epoch_seconds(text)?;
    let format = match digits {
        0 => SecondsFormat::Secs,
        1..=3 => SecondsFormat::Millis,
        4..=6 => SecondsFormat::Micros,
        _ => SecondsFormat::Nanos,
    };
    Some(instant.to_rfc3339_opts(format, true))
}

/// Возвращает момент времени и число значащих дробных цифр (0..=9).
fn parse_epoch_seconds(text: &str) -> Option<(DateTime<Utc>, usize)> {
    if text.contains(['e', 'E']) {
        return parse_epoch_float(text);
    }

    let (negative, unsigned) = match text.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, text.strip_prefix('+').unwrap_or(text)),
    };
    let (whole, fraction) = unsigned.split_once('.').unwrap_or((unsigned, ""));
    if whole.is_empty() && fraction.is_empty() {
        return None;
    }
    if !whole.bytes().all(|b| b.is_ascii_digit()) || !fraction.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }

    let mut secs: i64 = if whole.is_empty() { 0 } else { whole.parse().ok()? };
    // Digits past nanosecond resolution are truncated.
    let mut nanos = fraction
        .bytes()
        .chain(std::iter::repeat(b'0'))
        .take(9)
        .fold(0u32, |acc, b| acc * 10 + u32::from(b - b'0'));
    let digits = fraction.trim_end_matches('0').len().min(9);

    if negative {
        secs = secs.checked_neg()?;
        if nanos > 0 {
            secs = secs.checked_sub(1)?;
            nanos = 1_000_000_000 - nanos;
        }
    }

    DateTime::from_timestamp(secs, nanos).map(|dt| (dt, digits))
}

/// Экспоненциальная запись (`1.7e9`) разбирается через f64.
fn parse_epoch_float(text: &str) -> Option<(DateTime<Utc>, usize)> {
    let value: f64 = text.parse().ok()?;
    if !value.is_finite() {
        return None;
    }
    let floor = value.floor();
    if floor < i64::MIN as f64 || floor > i64::MAX as f64 {
        return None;
    }
    let mut secs = floor as i64;
    let mut nanos = ((value - floor) * 1e9).round() as u32;
    if nanos >= 1_000_000_000 {
        secs = secs.checked_add(1)?;
        nanos = 0;
    }
    let digits = if nanos == 0 {
        0
    } else if nanos % 1_000_000 == 0 {
        3
    } else if nanos % 1_000 == 0 {
        6
    } else {
        9
    };
    DateTime::from_timestamp(secs, nanos).map(|dt| (dt, digits))
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use serde_json::json;

    #[test]
    fn ipv4_is_zero_padded() {
        assert_eq!(normalize_ip("192.168.1.1").as_deref(), Some("192.168.001.001"));
        assert_eq!(normalize_ip("10.0.0.1").as_deref(), Some("010.000.000.001"));
        assert_eq!(normalize_ip("255.255.255.255").as_deref(), Some("255.255.255.255"));
    }

    #[test]
    fn ipv6_is_fully_expanded() {
        assert_eq!(
            normalize_ip("2001:db8::1").as_deref(),
            Some("2001:0db8:0000:0000:0000:0000:0000:0001")
        );
        assert_eq!(
            normalize_ip("::").as_deref(),
            Some("0000:0000:0000:0000:0000:0000:0000:0000")
        );
        assert_eq!(
            normalize_ip("FE80::ABCD").as_deref(),
            Some("fe80:0000:0000:0000:0000:0000:0000:abcd")
        );
        assert_eq!(
            normalize_ip("::ffff:192.168.1.1").as_deref(),
            Some("0000:0000:0000:0000:0000:ffff:c0a8:0101")
        );
    }

    #[test]
    fn invalid_addresses_are_not_applicable() {
        for raw in [
            "", "not-an-ip", "256.1.1.1", "1.2.3", "1.2.3.4.5", "1..2.3", "1.2.3.0004",
            " 1.2.3.4", "1.2.3.4 ", "-1.2.3.4", "2001:db8::g", "1:2:3:4:5:6:7:8:9", "fe80::1%eth0",
        ] {
            assert_eq!(normalize_ip(raw), None, "{raw:?} should be rejected");
        }
    }

    #[test]
    fn locale_is_upper_cased() {
        assert_eq!(normalize_locale("en-us"), "EN-US");
        assert_eq!(normalize_locale(""), "");
        assert_eq!(normalize_locale("de_DE"), "DE_DE");
        assert_eq!(normalize_locale("straße"), "STRASSE");
        assert_eq!(normalize_locale(&normalize_locale("straße")), "STRASSE");
    }

    #[test]
    fn integer_epoch_has_no_fraction() {
        assert_eq!(
            normalize_timestamp(&json!(1700000000)).as_deref(),
            Some("2023-11-14T22:13:20Z")
        );
        assert_eq!(normalize_timestamp(&json!(0)).as_deref(), Some("1970-01-01T00:00:00Z"));
        assert_eq!(normalize_timestamp(&json!(1700000000.0)).as_deref(), Some("2023-11-14T22:13:20Z"));
    }

    #[test]
    fn fractional_epoch_keeps_sub_second_precision() {
        assert_eq!(
            normalize_timestamp(&json!(1700000000.5)).as_deref(),
            Some("2023-11-14T22:13:20.500Z")
        );
        assert_eq!(
            normalize_timestamp(&json!(1700000000.123456)).as_deref(),
            Some("2023-11-14T22:13:20.123456Z")
        );
        assert_eq!(
            epoch_seconds_to_iso8601("1700000000.123456789123").as_deref(),
            Some("2023-11-14T22:13:20.123456789Z")
        );
    }

    #[test]
    fn negative_epoch_rounds_towards_the_past() {
        assert_eq!(epoch_seconds_to_iso8601("-1").as_deref(), Some("1969-12-31T23:59:59Z"));
        assert_eq!(epoch_seconds_to_iso8601("-0.25").as_deref(), Some("1969-12-31T23:59:59.750Z"));
    }

    #[test]
    fn numeric_strings_and_exponents_are_accepted() {
        assert_eq!(
            normalize_timestamp(&json!("1700000000")).as_deref(),
            Some("2023-11-14T22:13:20Z")
        );
        assert_eq!(epoch_seconds_to_iso8601("1.7e9").as_deref(), Some("2023-11-14T22:13:20Z"));
    }

    #[test]
    fn non_numeric_timestamps_are_not_applicable() {
        assert_eq!(normalize_timestamp(&json!("yesterday")), None);
        assert_eq!(normalize_timestamp(&json!(true)), None);
        assert_eq!(normalize_timestamp(&json!(null)), None);
        assert_eq!(normalize_timestamp(&json!({"s": 1})), None);
        assert_eq!(epoch_seconds_to_iso8601(""), None);
        assert_eq!(epoch_seconds_to_iso8601("."), None);
        assert_eq!(epoch_seconds_to_iso8601("1e400"), None);
        assert_eq!(epoch_seconds_to_iso8601("99999999999999999999"), None);
    }

    proptest! {
        #[test]
        fn ipv4_canonical_form_is_idempotent(octets in any::<[u8; 4]>()) {
            let addr = Ipv4Addr::from(octets);
            let once = normalize_ip(&addr.to_string());
            prop_assert!(once.is_some());
            let once = once.unwrap_or_default();
            prop_assert_eq!(normalize_ip(&once), Some(once.clone()));
        }

        #[test]
        fn ipv6_canonical_form_is_idempotent(groups in any::<[u16; 8]>()) {
            let addr = Ipv6Addr::from(groups);
            let once = normalize_ip(&addr.to_string());
            prop_assert!(once.is_some());
            let once = once.unwrap_or_default();
            prop_assert_eq!(once.len(), 39);
            prop_assert_eq!(normalize_ip(&once), Some(once.clone()));
        }

        #[test]
        fn locale_normalization_is_idempotent(raw in any::<String>()) {
            let once = normalize_locale(&raw);
            prop_assert_eq!(normalize_locale(&once), once);
        }

        #[test]
        fn whole_seconds_round_trip(secs in 0i64..4_102_444_800) {
            let text = normalize_timestamp(&json!(secs));
            prop_assert!(text.is_some());
            let parsed = DateTime::parse_from_rfc3339(&text.unwrap_or_default());
            prop_assert!(parsed.is_ok());
            prop_assert_eq!(parsed.map(|dt| dt.timestamp()).unwrap_or_default(), secs);
        }
    }
}
