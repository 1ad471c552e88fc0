//! Ambient services a function implementation may ask for: the clock,
//! randomness, locale and timezone.
//!
//! Each service sits behind a narrow trait so an implementation never
//! depends on a concrete source; tests swap in fixed clocks and seeded
//! generators through the `ServiceRegistry`.

use std::fmt::Write as _;
use std::str::FromStr;
use std::sync::{Mutex, PoisonError};

use chrono::{DateTime, FixedOffset, Offset, Utc};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rust_decimal::Decimal;

// ---------------------------------------------------------------------------
// Clock
// ---------------------------------------------------------------------------

pub trait ClockService: Send + Sync {
    fn utc_now(&self) -> DateTime<Utc>;
}

/// Reads the system clock.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl ClockService for SystemClock {
    fn utc_now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Always reports the same instant.
#[derive(Debug, Clone, Copy)]
pub struct FixedClock(pub DateTime<Utc>);

impl ClockService for FixedClock {
    fn utc_now(&self) -> DateTime<Utc> {
        self.0
    }
}

// ---------------------------------------------------------------------------
// Random
// ---------------------------------------------------------------------------

/// Number of fractional digits drawn for a random decimal.
pub const DECIMAL_DIGITS: usize = 28;

pub trait RandomService: Send + Sync {
    /// Uniform sample in `[0, 1)`.
    fn next_f64(&self) -> f64;

    /// Uniform decimal in `[0, 1)`, built digit by digit from `next_f64`.
    fn next_decimal(&self) -> Decimal {
        decimal_from_samples(|| self.next_f64())
    }
}

/// Build `0.d1d2...d28` with each digit `floor(sample() * 10)` and parse it
/// with the invariant (dot) format.
///
/// If the text does not parse, a single cast sample is used instead. That
/// fallback loses precision relative to the digit path; it is kept so a
/// misbehaving sampler still yields a number.
pub fn decimal_from_samples(mut sample: impl FnMut() -> f64) -> Decimal {
    let mut text = String::with_capacity(2 + DECIMAL_DIGITS);
    text.push_str("0.");
    for _ in 0..DECIMAL_DIGITS {
        let digit = (sample() * 10.0).floor() as i64;
        let _ = write!(text, "{digit}");
    }

    let mut value = match Decimal::from_str(&text) {
        Ok(d) => d,
        Err(_) => Decimal::try_from(sample()).unwrap_or(Decimal::ZERO),
    };
    if value >= Decimal::ONE {
        value -= value.trunc();
    }
    value
}

/// Default generator: one `StdRng` behind one lock shared by every caller.
///
/// Correct under any number of concurrent evaluations, but every sample
/// contends on the same mutex. Callers that need throughput should register
/// their own `RandomService`.
#[derive(Debug)]
pub struct DefaultRandom {
    rng: Mutex<StdRng>,
}

impl DefaultRandom {
    pub fn new() -> Self {
        Self {
            rng: Mutex::new(StdRng::from_entropy()),
        }
    }

    /// Deterministic sequence for tests and `--seed`.
    pub fn seeded(seed: u64) -> Self {
        Self {
            rng: Mutex::new(StdRng::seed_from_u64(seed)),
        }
    }
}

impl Default for DefaultRandom {
    fn default() -> Self {
        Self::new()
    }
}

impl RandomService for DefaultRandom {
    fn next_f64(&self) -> f64 {
        // A panic while holding the lock cannot leave the RNG half-updated.
        let mut rng = self.rng.lock().unwrap_or_else(PoisonError::into_inner);
        rng.gen::<f64>()
    }
}

// ---------------------------------------------------------------------------
// Locale and timezone
// ---------------------------------------------------------------------------

/// Culture used when text has to be read as a number.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Locale {
    pub name: String,
}

/// Languages whose decimal separator is a comma.
const COMMA_DECIMAL_LANGUAGES: &[&str] = &[
    "cs", "da", "de", "es", "fi", "fr", "it", "nb", "nl", "pl", "pt", "ru", "sv", "tr",
];

impl Locale {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }

    pub fn decimal_separator(&self) -> char {
        let lang = self
            .name
            .split(['-', '_'])
            .next()
            .unwrap_or_default()
            .to_ascii_lowercase();
        if COMMA_DECIMAL_LANGUAGES.contains(&lang.as_str()) {
            ','
        } else {
            '.'
        }
    }

    /// Parse number text written in this locale.
    ///
    /// Group separators are accepted only between well-formed groups of
    /// three digits. Non-finite results (`NaN`, `inf`) are rejected.
    pub fn parse_f64(&self, text: &str) -> Option<f64> {
        let text = text.trim();
        let decimal = self.decimal_separator();
        let groups: &[char] = if decimal == ',' {
            &['.', ' ', '\u{a0}']
        } else {
            &[',']
        };
        let (int_part, frac) = match text.split_once(decimal) {
            Some((i, f)) => (i, Some(f)),
            None => (text, None),
        };
        if frac.is_some_and(|f| f.contains(groups)) {
            return None;
        }
        let mut normalized = ungroup(int_part, groups)?;
        if let Some(f) = frac {
            normalized.push('.');
            normalized.push_str(f);
        }
        normalized.parse::<f64>().ok().filter(|n| n.is_finite())
    }
}

/// Strip group separators from the integer part of a number.
fn ungroup(int_part: &str, groups: &[char]) -> Option<String> {
    if !int_part.contains(groups) {
        return Some(int_part.to_string());
    }
    let body = int_part.strip_prefix(['+', '-']).unwrap_or(int_part);
    let sign = &int_part[..int_part.len() - body.len()];
    let all_digits = |s: &str| s.bytes().all(|b| b.is_ascii_digit());

    let mut parts = body.split(groups);
    let lead = parts.next()?;
    if !(1..=3).contains(&lead.len()) || !all_digits(lead) {
        return None;
    }
    let mut out = format!("{sign}{lead}");
    for group in parts {
        if group.len() != 3 || !all_digits(group) {
            return None;
        }
        out.push_str(group);
    }
    Some(out)
}

impl Default for Locale {
    fn default() -> Self {
        Self::new("en-US")
    }
}

/// Timezone used to present instants to the user.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeZoneInfo(FixedOffset);

impl TimeZoneInfo {
    pub fn utc() -> Self {
        Self(Utc.fix())
    }

    pub fn from_offset(offset: FixedOffset) -> Self {
        Self(offset)
    }

    pub fn offset(&self) -> FixedOffset {
        self.0
    }

    /// Parse `Z`, `UTC`, `+HH:MM`, `-HH:MM` or `+HHMM`.
    pub fn parse(text: &str) -> Option<Self> {
        let text = text.trim();
        if text.eq_ignore_ascii_case("z") || text.eq_ignore_ascii_case("utc") {
            return Some(Self::utc());
        }
        let (sign, rest) = match text.as_bytes().first()? {
            b'+' => (1, &text[1..]),
            b'-' => (-1, &text[1..]),
            _ => return None,
        };
        let digits: String = rest.chars().filter(|c| *c != ':').collect();
        if digits.len() != 4 || !digits.chars().all(|c| c.is_ascii_digit()) {
            return None;
        }
        let hours: i32 = digits[..2].parse().ok()?;
        let minutes: i32 = digits[2..].parse().ok()?;
        if minutes >= 60 {
            return None;
        }
        FixedOffset::east_opt(sign * (hours * 3600 + minutes * 60)).map(Self)
    }
}

impl Default for TimeZoneInfo {
    fn default() -> Self {
        Self::utc()
    }
}

impl std::fmt::Display for TimeZoneInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn next_f64_stays_in_unit_interval() {
        let rng = DefaultRandom::new();
        for _ in 0..10_000 {
            let x = rng.next_f64();
            assert!((0.0..1.0).contains(&x), "out of range: {x}");
        }
    }

    #[test]
    fn next_decimal_stays_below_one() {
        let rng = DefaultRandom::seeded(7);
        for _ in 0..2_000 {
            let d = rng.next_decimal();
            assert!(d >= Decimal::ZERO && d < Decimal::ONE, "out of range: {d}");
        }
    }

    #[test]
    fn next_decimal_has_full_precision() {
        let rng = DefaultRandom::seeded(11);
        let d = rng.next_decimal();
        assert_eq!(d.scale(), DECIMAL_DIGITS as u32);
    }

    #[test]
    fn largest_digits_stay_below_one() {
        let d = decimal_from_samples(|| 0.999_999);
        assert!(d < Decimal::ONE);
        assert_eq!(d.to_string(), format!("0.{}", "9".repeat(DECIMAL_DIGITS)));
    }

    #[test]
    fn unparsable_digits_fall_back_to_cast_sample() {
        // Negative samples produce "0.-5-5..." which does not parse.
        let d = decimal_from_samples(|| -0.5);
        assert_eq!(d, Decimal::try_from(-0.5).unwrap());
    }

    #[test]
    fn seeded_generators_repeat() {
        let a = DefaultRandom::seeded(42);
        let b = DefaultRandom::seeded(42);
        for _ in 0..16 {
            assert_eq!(a.next_f64(), b.next_f64());
        }
    }

    #[test]
    fn shared_generator_under_concurrent_callers() {
        let rng = Arc::new(DefaultRandom::new());
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let rng = Arc::clone(&rng);
                std::thread::spawn(move || {
                    (0..500).all(|_| {
                        let x = rng.next_f64();
                        let d = rng.next_decimal();
                        (0.0..1.0).contains(&x) && d >= Decimal::ZERO && d < Decimal::ONE
                    })
                })
            })
            .collect();
        for h in handles {
            assert!(h.join().unwrap());
        }
    }

    #[test]
    fn fixed_clock_is_fixed() {
        let at = DateTime::parse_from_rfc3339("2024-02-29T12:00:00Z")
            .unwrap()
            .with_timezone(&Utc);
        let clock = FixedClock(at);
        assert_eq!(clock.utc_now(), at);
        assert_eq!(clock.utc_now(), clock.utc_now());
    }

    #[test]
    fn timezone_parsing() {
        assert_eq!(TimeZoneInfo::parse("Z"), Some(TimeZoneInfo::utc()));
        assert_eq!(
            TimeZoneInfo::parse("+05:30").map(|t| t.offset().local_minus_utc()),
            Some(5 * 3600 + 30 * 60)
        );
        assert_eq!(
            TimeZoneInfo::parse("-0800").map(|t| t.offset().local_minus_utc()),
            Some(-8 * 3600)
        );
        assert_eq!(TimeZoneInfo::parse("05:00"), None);
        assert_eq!(TimeZoneInfo::parse("+5"), None);
        assert_eq!(TimeZoneInfo::parse("+01:75"), None);
    }

    #[test]
    fn locale_number_parsing() {
        assert_eq!(Locale::default().parse_f64("1,234.5"), Some(1234.5));
        assert_eq!(Locale::new("de-DE").parse_f64("1.234,5"), Some(1234.5));
        assert_eq!(Locale::new("fr_FR").decimal_separator(), ',');
        assert_eq!(Locale::default().parse_f64("abc"), None);
    }

    #[test]
    fn locale_parsing_rejects_non_finite_and_misgrouped_text() {
        let en = Locale::default();
        let rejected = [
            "NaN",
            "inf",
            "-infinity",
            "1e400",
            "1,2,3",
            "12,34",
            ",123",
            "1,234.5,0",
        ];
        for text in rejected {
            assert_eq!(en.parse_f64(text), None, "{text}");
        }
        assert_eq!(en.parse_f64("-1,234,567"), Some(-1_234_567.0));
        assert_eq!(en.parse_f64("1e3"), Some(1000.0));

        let de = Locale::new("de-DE");
        assert_eq!(de.parse_f64("1.2.3"), None);
        assert_eq!(de.parse_f64("1 234,5"), Some(1234.5));
        assert_eq!(de.parse_f64("0,5"), Some(0.5));
    }
}
