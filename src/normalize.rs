//! Canonical forms for join identifiers
//!
//! Upstream services and CSV exports disagree about leading zeros (Connecticut
//! county `09001` arrives as `9001`, New England ZIPs lose their first digit),
//! so a lookup tries several variants of one identifier in a fixed order.

use regex::Regex;
use serde_json::Value;
use std::sync::OnceLock;

use crate::types::GeographyLevel;

fn county_words() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?i)\b(COUNTY|PARISH|BOROUGH)\b").expect("static regex"))
}

fn is_digits(s: &str) -> bool {
    !s.is_empty() && s.bytes().all(|b| b.is_ascii_digit())
}

/// Left-pad a numeric identifier with zeros to `width`
pub fn zero_pad(s: &str, width: usize) -> String {
    format!("{:0>width$}", s, width = width)
}

/// Ordered lookup variants of a boundary identifier: as-is, padded to 5, zeros stripped
pub fn id_variants(raw: &str, level: GeographyLevel) -> Vec<String> {
    let mut base = raw.trim();

    // ZCTA layers sometimes publish state FIPS + ZIP as one 7-digit code
    if level == GeographyLevel::Zip && base.len() == 7 && is_digits(base) {
        base = &base[2..];
    }

    let mut variants = vec![base.to_string()];
    if is_digits(base) {
        variants.push(zero_pad(base, 5));
        let stripped = base.trim_start_matches('0');
        if !stripped.is_empty() {
            variants.push(stripped.to_string());
        }
    }

    let mut seen = Vec::with_capacity(variants.len());
    for v in variants {
        if !seen.contains(&v) {
            seen.push(v);
        }
    }
    seen
}

/// Uppercase, drop COUNTY/PARISH/BOROUGH as whole words, collapse whitespace
pub fn clean_county_name(raw: &str) -> String {
    let upper = raw.to_uppercase();
    let stripped = county_words().replace_all(&upper, " ");
    stripped.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Both keys a county name is stored under: bare and with a " COUNTY" suffix
pub fn county_name_keys(raw: &str) -> [String; 2] {
    let clean = clean_county_name(raw);
    let suffixed = format!("{} COUNTY", clean);
    [clean, suffixed]
}

/// Clean a CSV ZIP value: drop a spreadsheet ".0", reduce ZIP+4, pad 3-4 digits to 5
pub fn normalize_zip(raw: &str) -> String {
    let mut zip = raw.trim();
    if let Some(stripped) = zip.strip_suffix(".0") {
        zip = stripped;
    }
    if let Some((head, tail)) = zip.split_once('-') {
        if head.len() == 5 && tail.len() == 4 && is_digits(head) && is_digits(tail) {
            zip = head;
        }
    }
    if is_digits(zip) && (3..5).contains(&zip.len()) {
        return zero_pad(zip, 5);
    }
    zip.to_string()
}

/// Key under which CSV rows naming the same area are grouped
///
/// `9001` and `09001` are one county and `33701-1234` is ZIP `33701`, so
/// numeric keys lose their leading zeros after ZIP cleaning. County names group
/// by their cleaned form.
pub fn grouping_key(raw: &str, level: GeographyLevel) -> String {
    let key = match level {
        GeographyLevel::Zip => normalize_zip(raw),
        _ => raw.trim().to_string(),
    };
    if is_digits(&key) {
        let stripped = key.trim_start_matches('0');
        return if stripped.is_empty() { "0".to_string() } else { stripped.to_string() };
    }
    if level == GeographyLevel::County {
        return clean_county_name(&key);
    }
    key
}

/// Numeric value of a CSV cell; blanks, text and non-finite values are None
pub fn parse_number(raw: &str) -> Option<f64> {
    let v: f64 = raw.trim().parse().ok()?;
    v.is_finite().then_some(v)
}

/// Render a number without a trailing ".0" when it is integral
pub fn format_number(v: f64) -> String {
    if v.fract() == 0.0 && v.abs() < 1e15 {
        format!("{}", v as i64)
    } else {
        v.to_string()
    }
}

/// String form of a feature property usable as an identifier, if it is present
pub fn property_key(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => {
            let s = s.trim();
            (!s.is_empty()).then(|| s.to_string())
        }
        Value::Number(n) => match n.as_i64() {
            Some(i) => Some(i.to_string()),
            None => n.as_f64().map(format_number),
        },
        _ => None,
    }
}
