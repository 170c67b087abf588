//! SI-prefix helpers shared by log messages and instrument parsers.

use std::fmt::Write as _;

const PREFIXES: [(i32, char); 16] = [
    (-24, 'y'),
    (-21, 'z'),
    (-18, 'a'),
    (-15, 'f'),
    (-12, 'p'),
    (-9, 'n'),
    (-6, 'u'),
    (-3, 'm'),
    (3, 'k'),
    (6, 'M'),
    (9, 'G'),
    (12, 'T'),
    (15, 'P'),
    (18, 'E'),
    (21, 'Z'),
    (24, 'Y'),
];

/// Power of ten associated with an SI prefix character.
pub fn prefix_power(prefix: char) -> Option<i32> {
    PREFIXES
        .iter()
        .find(|(_, c)| *c == prefix)
        .map(|(p, _)| *p)
        .or(if prefix == 'µ' { Some(-6) } else { None })
}

fn split_engineering(value: f64) -> (f64, i32) {
    if value == 0.0 || !value.is_finite() {
        return (value, 0);
    }
    let mut exp = (value.abs().log10() / 3.0).floor() as i32 * 3;
    let mut mantissa = value / 10f64.powi(exp);
    if mantissa.abs() >= 1000.0 {
        exp += 3;
        mantissa /= 1000.0;
    } else if mantissa.abs() < 1.0 {
        exp -= 3;
        mantissa *= 1000.0;
    }
    if !(-24..=24).contains(&exp) {
        let clamped = exp.clamp(-24, 24);
        return (value / 10f64.powi(clamped), clamped);
    }
    (mantissa, exp)
}

fn format_with(value: f64, precision: usize, sep: &str) -> String {
    let (mantissa, exp) = split_engineering(value);
    let mut out = String::new();
    let _ = write!(out, "{mantissa:.precision$}");
    match PREFIXES.iter().find(|(p, _)| *p == exp) {
        Some((_, c)) => {
            out.push_str(sep);
            out.push(*c);
        }
        None => out.push_str(sep),
    }
    out
}

/// Engineering notation with an SI prefix, e.g. `1.50 m` for `1.5e-3`.
///
/// The result is meant to be followed directly by a unit (`"{}Hz"`).
pub fn si_format(value: f64, precision: usize) -> String {
    format_with(value, precision, " ")
}

/// Compact upper-case form used in instrument commands.
///
/// Follows the LeCroy convention in which `M` means milli, so mega is sent
/// as `MA` and micro as `U`.
pub fn si_command(value: f64, precision: usize) -> String {
    let (mantissa, exp) = split_engineering(value);
    let suffix = match exp {
        6 => "MA".to_string(),
        0 => String::new(),
        _ => PREFIXES
            .iter()
            .find(|(p, _)| *p == exp)
            .map(|(_, c)| c.to_ascii_uppercase().to_string())
            .unwrap_or_default(),
    };
    format!("{mantissa:.precision$}{suffix}")
}

/// Scale `value` by the prefix held in the first character of `suffix`,
/// unless the whole suffix is one of `units`.
///
/// Prefixes are matched case-sensitively first and then with swapped case,
/// since instruments often answer in upper case only.
pub fn apply_suffix(value: f64, suffix: &str, units: &[&str]) -> Option<f64> {
    if suffix.is_empty() || units.contains(&suffix) {
        return Some(value);
    }
    let first = suffix.chars().next()?;
    let power = prefix_power(first).or_else(|| {
        let swapped = if first.is_uppercase() {
            first.to_ascii_lowercase()
        } else {
            first.to_ascii_uppercase()
        };
        prefix_power(swapped)
    })?;
    Some(value * 10f64.powi(power))
}

/// Inclusive bounds check.
pub fn is_within(value: f64, bounds: (f64, f64)) -> bool {
    value >= bounds.0 && value <= bounds.1
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn formats_with_engineering_prefix() {
        assert_eq!(si_format(1.5e-3, 2), "1.50 m");
        assert_eq!(si_format(25e6, 1), "25.0 M");
        assert_eq!(si_format(3.0, 0), "3 ");
        assert_eq!(si_format(0.0, 1), "0.0 ");
    }

    #[test]
    fn command_form_uses_instrument_convention() {
        assert_eq!(si_command(5e-4, 2), "500.00U");
        assert_eq!(si_command(2e-3, 1), "2.0M");
        assert_eq!(si_command(1e6, 0), "1MA");
        assert_eq!(si_command(2.5, 1), "2.5");
    }

    #[test]
    fn suffixes_scale_values() {
        assert_eq!(apply_suffix(5.0, "S", &["S", "V"]), Some(5.0));
        assert!((apply_suffix(2.0, "mV", &["V"]).unwrap() - 2e-3).abs() < 1e-15);
        assert_eq!(apply_suffix(3.0, "K", &["V"]), Some(3e3));
        assert!((apply_suffix(1.0, "uS", &["S"]).unwrap() - 1e-6).abs() < 1e-18);
        assert_eq!(apply_suffix(1.0, "Q", &["V"]), None);
    }

    #[test]
    fn bounds_are_inclusive() {
        assert!(is_within(0.0, (0.0, 1.0)));
        assert!(is_within(1.0, (0.0, 1.0)));
        assert!(!is_within(1.01, (0.0, 1.0)));
    }
}
