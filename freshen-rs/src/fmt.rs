//! Provides formatting and parsing helpers for durations.
//!
//! Durations show up in two places: in the config (e.g. `min_prefetch_lead: 5m`) and in log
//! messages or metrics (e.g. how long a refresh took).
use std::fmt::Write;
use std::time::Duration;

/// Formats a short duration like the execution time of a refresh.
///
/// This determines the ideal unit (ranging from microseconds to seconds) to provide a concise
/// representation.
///
/// # Examples
///
/// ```
/// # use std::time::Duration;
/// # use freshen::fmt::format_short_duration;
/// assert_eq!(format_short_duration(Duration::from_micros(100)), "100 us");
/// assert_eq!(format_short_duration(Duration::from_micros(8_192)), "8.19 ms");
/// assert_eq!(format_short_duration(Duration::from_micros(32_768)), "32.8 ms");
/// assert_eq!(format_short_duration(Duration::from_micros(128_123)), "128 ms");
/// assert_eq!(format_short_duration(Duration::from_micros(1_128_123)), "1.13 s");
/// assert_eq!(format_short_duration(Duration::from_micros(101_000_000)), "101 s");
/// ```
pub fn format_short_duration(duration: Duration) -> String {
    let micros = duration.as_micros();
    let mut result = String::new();

    let _ = if micros < 1_000 {
        write!(result, "{} us", micros)
    } else if micros < 10_000 {
        write!(result, "{:.2} ms", micros as f64 / 1_000.)
    } else if micros < 100_000 {
        write!(result, "{:.1} ms", micros as f64 / 1_000.)
    } else if micros < 1_000_000 {
        write!(result, "{} ms", micros / 1_000)
    } else if micros < 10_000_000 {
        write!(result, "{:.2} s", micros as f64 / 1_000_000.)
    } else if micros < 100_000_000 {
        write!(result, "{:.1} s", micros as f64 / 1_000_000.)
    } else {
        write!(result, "{} s", micros / 1_000_000)
    };

    result
}

/// Parses a duration from a string like "15m" or "200 ms".
///
/// Supported suffixes are "ms", "s", "m", "h" and "d" (case insensitive). A plain number is
/// treated as milliseconds.
///
/// # Examples
///
/// ```
/// # use std::time::Duration;
/// # use freshen::fmt::parse_duration;
/// assert_eq!(parse_duration("100").unwrap(), Duration::from_millis(100));
/// assert_eq!(parse_duration("100 ms").unwrap(), Duration::from_millis(100));
/// assert_eq!(parse_duration("12s").unwrap(), Duration::from_secs(12));
/// assert_eq!(parse_duration("3 M").unwrap(), Duration::from_secs(3 * 60));
/// assert_eq!(parse_duration("2h").unwrap(), Duration::from_secs(2 * 60 * 60));
/// assert_eq!(parse_duration("5 d").unwrap(), Duration::from_secs(5 * 24 * 60 * 60));
///
/// // An invalid suffix results in an error...
/// assert!(parse_duration("3 Y").is_err());
///
/// // Neither decimal nor negative numbers are supported...
/// assert!(parse_duration("1.2s").is_err());
/// assert!(parse_duration("-1m").is_err());
/// ```
pub fn parse_duration(str: impl AsRef<str>) -> anyhow::Result<Duration> {
    lazy_static::lazy_static! {
        static ref NUMBER_AND_SUFFIX: regex::Regex =
            regex::Regex::new(r"^ *(\d+) *((ms|s|m|h|d|MS|S|M|H|D)?) *$").unwrap();
    }

    let captures = NUMBER_AND_SUFFIX.captures(str.as_ref()).ok_or_else(|| {
        anyhow::anyhow!(
            "Cannot parse '{}' into a duration. \
             Expected a positive number and optionally 'ms', 's', 'm', 'h' or 'd' as suffix.",
            str.as_ref()
        )
    })?;

    let number = captures[1].parse::<u64>()?;
    let seconds = match captures[2].to_ascii_lowercase().as_str() {
        "s" => 1,
        "m" => 60,
        "h" => 60 * 60,
        "d" => 24 * 60 * 60,
        _ => return Ok(Duration::from_millis(number)),
    };

    Ok(Duration::from_secs(number * seconds))
}

/// Formats a duration into a string like "5d 3h 17m 2s 12ms".
///
/// Units which are zero are skipped. A zero duration is reported as "0ms".
///
/// # Examples
///
/// ```
/// # use std::time::Duration;
/// # use freshen::fmt::format_duration;
/// assert_eq!(format_duration(Duration::ZERO), "0ms");
/// assert_eq!(format_duration(Duration::from_millis(13)), "13ms");
/// assert_eq!(format_duration(Duration::from_millis(62_013)), "1m 2s 13ms");
/// assert_eq!(format_duration(Duration::from_secs(60 * 61)), "1h 1m");
/// assert_eq!(format_duration(Duration::from_secs(24 * 60 * 60 + 60 * 60 + 59)), "1d 1h 59s");
/// ```
pub fn format_duration(duration: Duration) -> String {
    const UNITS: [(u128, &str); 5] = [
        (24 * 60 * 60 * 1000, "d"),
        (60 * 60 * 1000, "h"),
        (60 * 1000, "m"),
        (1000, "s"),
        (1, "ms"),
    ];

    let mut remainder = duration.as_millis();
    if remainder == 0 {
        return "0ms".to_owned();
    }

    let mut result = String::new();
    for (millis_per_unit, suffix) in UNITS {
        let amount = remainder / millis_per_unit;
        if amount > 0 {
            if !result.is_empty() {
                result.push(' ');
            }
            let _ = write!(result, "{}{}", amount, suffix);
            remainder %= millis_per_unit;
        }
    }

    result
}
