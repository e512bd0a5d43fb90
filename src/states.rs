//! Static US state tables: FIPS codes, USPS abbreviations, names and ZIP prefix ranges

use crate::types::GeographyLevel;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UsState {
    pub fips: &'static str,
    pub abbr: &'static str,
    pub name: &'static str,
    /// Inclusive ranges over the first three digits of a ZIP code
    pub zip_prefixes: &'static [(u16, u16)],
}

impl UsState {
    pub fn owns_zip_prefix(&self, prefix: u16) -> bool {
        self.zip_prefixes
            .iter()
            .any(|(lo, hi)| *lo <= prefix && prefix <= *hi)
    }
}

macro_rules! state {
    ($fips:expr, $abbr:expr, $name:expr, [$(($lo:expr, $hi:expr)),* $(,)?]) => {
        UsState {
            fips: $fips,
            abbr: $abbr,
            name: $name,
            zip_prefixes: &[$(($lo, $hi)),*],
        }
    };
}

pub const STATES: &[UsState] = &[
    state!("01", "AL", "Alabama", [(350, 369)]),
    state!("02", "AK", "Alaska", [(995, 999)]),
    state!("04", "AZ", "Arizona", [(850, 865)]),
    state!("05", "AR", "Arkansas", [(716, 729)]),
    state!("06", "CA", "California", [(900, 961)]),
    state!("08", "CO", "Colorado", [(800, 816)]),
    state!("09", "CT", "Connecticut", [(60, 69)]),
    state!("10", "DE", "Delaware", [(197, 199)]),
    state!("11", "DC", "District of Columbia", [(200, 200), (202, 205), (569, 569)]),
    state!("12", "FL", "Florida", [(320, 349)]),
    state!("13", "GA", "Georgia", [(300, 319), (398, 399)]),
    state!("15", "HI", "Hawaii", [(967, 968)]),
    state!("16", "ID", "Idaho", [(832, 838)]),
    state!("17", "IL", "Illinois", [(600, 629)]),
    state!("18", "IN", "Indiana", [(460, 479)]),
    state!("19", "IA", "Iowa", [(500, 528)]),
    state!("20", "KS", "Kansas", [(660, 679)]),
    state!("21", "KY", "Kentucky", [(400, 427)]),
    state!("22", "LA", "Louisiana", [(700, 714)]),
    state!("23", "ME", "Maine", [(39, 49)]),
    state!("24", "MD", "Maryland", [(206, 219)]),
    state!("25", "MA", "Massachusetts", [(10, 27), (55, 55)]),
    state!("26", "MI", "Michigan", [(480, 499)]),
    state!("27", "MN", "Minnesota", [(550, 567)]),
    state!("28", "MS", "Mississippi", [(386, 397)]),
    state!("29", "MO", "Missouri", [(630, 658)]),
    state!("30", "MT", "Montana", [(590, 599)]),
    state!("31", "NE", "Nebraska", [(680, 693)]),
    state!("32", "NV", "Nevada", [(889, 898)]),
    state!("33", "NH", "New Hampshire", [(30, 38)]),
    state!("34", "NJ", "New Jersey", [(70, 89)]),
    state!("35", "NM", "New Mexico", [(870, 884)]),
    state!("36", "NY", "New York", [(5, 5), (100, 149)]),
    state!("37", "NC", "North Carolina", [(270, 289)]),
    state!("38", "ND", "North Dakota", [(580, 588)]),
    state!("39", "OH", "Ohio", [(430, 459)]),
    state!("40", "OK", "Oklahoma", [(730, 749)]),
    state!("41", "OR", "Oregon", [(970, 979)]),
    state!("42", "PA", "Pennsylvania", [(150, 196)]),
    state!("44", "RI", "Rhode Island", [(28, 29)]),
    state!("45", "SC", "South Carolina", [(290, 299)]),
    state!("46", "SD", "South Dakota", [(570, 577)]),
    state!("47", "TN", "Tennessee", [(370, 385)]),
    state!("48", "TX", "Texas", [(750, 799), (885, 885)]),
    state!("49", "UT", "Utah", [(840, 847)]),
    state!("50", "VT", "Vermont", [(50, 54), (56, 59)]),
    state!("51", "VA", "Virginia", [(201, 201), (220, 246)]),
    state!("53", "WA", "Washington", [(980, 994)]),
    state!("54", "WV", "West Virginia", [(247, 268)]),
    state!("55", "WI", "Wisconsin", [(530, 549)]),
    state!("56", "WY", "Wyoming", [(820, 831)]),
    state!("72", "PR", "Puerto Rico", [(6, 7), (9, 9)]),
];

/// State+level pairs whose feature count exceeds a single query page
const BATCH_FETCH: &[(GeographyLevel, &[&str])] = &[
    (GeographyLevel::Zip, &["CA", "TX", "NY", "FL", "PA", "IL", "OH"]),
    (
        GeographyLevel::Tract,
        &["CA", "TX", "NY", "FL", "PA", "IL", "OH", "GA", "NC", "MI"],
    ),
    (GeographyLevel::Place, &["CA", "TX"]),
];

pub fn by_abbr(abbr: &str) -> Option<&'static UsState> {
    let abbr = abbr.trim();
    STATES.iter().find(|s| s.abbr.eq_ignore_ascii_case(abbr))
}

pub fn by_fips(fips: &str) -> Option<&'static UsState> {
    let fips = fips.trim();
    let padded = if fips.len() == 1 {
        format!("0{}", fips)
    } else {
        fips.to_string()
    };
    STATES.iter().find(|s| s.fips == padded)
}

pub fn by_name(name: &str) -> Option<&'static UsState> {
    let name = name.trim();
    STATES.iter().find(|s| s.name.eq_ignore_ascii_case(name))
}

/// Resolve a user-supplied state given as abbreviation, name or FIPS code
pub fn resolve(input: &str) -> Option<&'static UsState> {
    let input = input.trim();
    if input.is_empty() {
        return None;
    }
    if input.chars().all(|c| c.is_ascii_digit()) {
        return by_fips(input);
    }
    by_abbr(input).or_else(|| by_name(input))
}

/// State owning a 3-digit ZIP prefix
pub fn by_zip_prefix(prefix: u16) -> Option<&'static UsState> {
    STATES.iter().find(|s| s.owns_zip_prefix(prefix))
}

/// State owning a (5-digit, zero-padded) ZIP code
pub fn by_zip(zip: &str) -> Option<&'static UsState> {
    let prefix: u16 = zip.get(..3)?.parse().ok()?;
    by_zip_prefix(prefix)
}

pub fn needs_batch_fetch(level: GeographyLevel, state: &UsState) -> bool {
    BATCH_FETCH
        .iter()
        .any(|(l, abbrs)| *l == level && abbrs.contains(&state.abbr))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve_accepts_all_forms() {
        assert_eq!(resolve("fl").map(|s| s.fips), Some("12"));
        assert_eq!(resolve("Florida").map(|s| s.abbr), Some("FL"));
        assert_eq!(resolve("12").map(|s| s.abbr), Some("FL"));
        assert_eq!(resolve("9").map(|s| s.abbr), Some("CT"));
        assert!(resolve("").is_none());
        assert!(resolve("ZZ").is_none());
    }

    #[test]
    fn test_georgia_owns_disjoint_ranges() {
        let ga = by_abbr("GA").unwrap();
        assert!(ga.owns_zip_prefix(300));
        assert!(ga.owns_zip_prefix(319));
        assert!(ga.owns_zip_prefix(398));
        assert!(!ga.owns_zip_prefix(320));
    }

    #[test]
    fn test_zip_lookup() {
        assert_eq!(by_zip("33701").map(|s| s.abbr), Some("FL"));
        assert_eq!(by_zip("02134").map(|s| s.abbr), Some("MA"));
        assert_eq!(by_zip("00901").map(|s| s.abbr), Some("PR"));
        assert_eq!(by_zip("12"), None);
    }

    #[test]
    fn test_zip_ranges_do_not_overlap() {
        for prefix in 0..1000u16 {
            let owners = STATES.iter().filter(|s| s.owns_zip_prefix(prefix)).count();
            assert!(owners <= 1, "prefix {:03} has {} owners", prefix, owners);
        }
    }

    #[test]
    fn test_batch_allow_list() {
        let ca = by_abbr("CA").unwrap();
        let vt = by_abbr("VT").unwrap();
        assert!(needs_batch_fetch(GeographyLevel::Tract, ca));
        assert!(!needs_batch_fetch(GeographyLevel::County, ca));
        assert!(!needs_batch_fetch(GeographyLevel::Tract, vt));
    }
}
