//! Flux standard duration rendering and parsing: `30s`, `2.5m`, `1.5h`,
//! `3d`.

use anyhow::{Result, bail};

/// Render seconds in the largest unit that keeps the value below the next
/// threshold, with up to four significant digits.
pub fn format_duration(secs: f64) -> String {
    if secs < 60.0 {
        format!("{}s", sig4(secs))
    } else if secs < 3600.0 {
        format!("{}m", sig4(secs / 60.0))
    } else if secs < 86400.0 {
        format!("{}h", sig4(secs / 3600.0))
    } else {
        format!("{}d", sig4(secs / 86400.0))
    }
}

/// Parse a duration: a bare number of seconds, or a number suffixed with
/// ms/s/m/h/d.
pub fn parse_duration(s: &str) -> Result<f64> {
    let s = s.trim();
    let (num, scale) = if let Some(v) = s.strip_suffix("ms") {
        (v, 0.001)
    } else if let Some(v) = s.strip_suffix('s') {
        (v, 1.0)
    } else if let Some(v) = s.strip_suffix('m') {
        (v, 60.0)
    } else if let Some(v) = s.strip_suffix('h') {
        (v, 3600.0)
    } else if let Some(v) = s.strip_suffix('d') {
        (v, 86400.0)
    } else {
        (s, 1.0)
    };
    let value: f64 = match num.trim().parse() {
        Ok(v) => v,
        Err(_) => bail!("invalid duration {:?}", s),
    };
    if value < 0.0 || !value.is_finite() {
        bail!("invalid duration {:?}", s);
    }
    Ok(value * scale)
}

/// Up to four significant digits, trailing zeros trimmed.
fn sig4(value: f64) -> String {
    let digits_before = if value < 1.0 {
        1
    } else {
        (value.abs().log10().floor() as usize) + 1
    };
    let precision = 4usize.saturating_sub(digits_before);
    let mut s = format!("{:.*}", precision, value);
    if s.contains('.') {
        while s.ends_with('0') {
            s.pop();
        }
        if s.ends_with('.') {
            s.pop();
        }
    }
    s
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn formats_by_magnitude() {
        assert_eq!(format_duration(0.0), "0s");
        assert_eq!(format_duration(1.5), "1.5s");
        assert_eq!(format_duration(59.9), "59.9s");
        assert_eq!(format_duration(90.0), "1.5m");
        assert_eq!(format_duration(5400.0), "1.5h");
        assert_eq!(format_duration(172800.0), "2d");
    }

    #[test]
    fn trims_noise_digits() {
        assert_eq!(format_duration(30.0), "30s");
        assert_eq!(format_duration(0.25), "0.25s");
    }

    #[test]
    fn parses_suffixes() {
        assert_eq!(parse_duration("0.5").unwrap(), 0.5);
        assert_eq!(parse_duration("500ms").unwrap(), 0.5);
        assert_eq!(parse_duration("2s").unwrap(), 2.0);
        assert_eq!(parse_duration("2m").unwrap(), 120.0);
        assert_eq!(parse_duration("1h").unwrap(), 3600.0);
        assert!(parse_duration("abc").is_err());
        assert!(parse_duration("-1").is_err());
    }
}
