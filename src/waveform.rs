//! Envelope synthesis for arbitrary-waveform uploads.
//!
//! Envelopes are sampled on evenly spaced time grids and span `[0, 1]`;
//! [`normalize`] maps them to an instrument's native range.

use anyhow::{anyhow, bail, Result};

/// Shape of the transitions of a smoothed pulse.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub enum RampKind {
    /// Logistic function, clipped at `dy` from each asymptote.
    Sigmoid { dy: f64 },
    /// Half a period of a sine wave.
    #[default]
    Sine,
    /// Quarter period of a sine wave, starting from `sin(pi/4)`.
    HalfSine,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RampDirection {
    Up,
    Down,
}

/// Sigmoidal ramp-up of duration `tramp` centred on `t0`.
///
/// `dy` is the distance from the asymptotes at which the ramp is considered
/// complete; the result is rescaled so that it spans `[0, 1]` over `tramp`.
pub fn sigmoid_ramp(t: &[f64], tramp: f64, t0: f64, dy: f64) -> Result<Vec<f64>> {
    if dy <= 0.0 || dy >= 1.0 {
        bail!("dy must be between 0 and 1 (got {dy})");
    }
    let k = 2.0 * ((1.0 - dy) / dy).ln() / tramp;
    Ok(t.iter()
        .map(|&ti| {
            let y = 1.0 / (1.0 + (-k * (ti - t0)).exp());
            (y - dy) / (1.0 - 2.0 * dy)
        })
        .collect())
}

/// Sinusoidal ramp-up of duration `tramp` centred on `t0`.
pub fn sine_ramp(t: &[f64], tramp: f64, t0: f64) -> Vec<f64> {
    t.iter()
        .map(|&ti| ((2.0 * std::f64::consts::PI * (ti - t0) / (2.0 * tramp)).sin() + 1.0) / 2.0)
        .collect()
}

pub fn halfsine_ramp(t: &[f64], tramp: f64, t0: f64) -> Vec<f64> {
    use std::f64::consts::PI;
    t.iter()
        .map(|&ti| (2.0 * PI * (ti - t0) / (4.0 * tramp) + PI / 4.0).sin())
        .collect()
}

/// `n` points of a 0 to 1 transition lasting `tramp` and centred on `t0`.
///
/// Returns the time and amplitude vectors.
pub fn smooth_ramp(
    n: usize,
    tramp: f64,
    t0: f64,
    kind: RampKind,
    direction: RampDirection,
) -> Result<(Vec<f64>, Vec<f64>)> {
    let t: Vec<f64> = linspace(0.0, tramp, n)
        .into_iter()
        .map(|ti| ti + t0 - tramp / 2.0)
        .collect();
    let mut y = match kind {
        RampKind::Sigmoid { dy } => sigmoid_ramp(&t, tramp, t0, dy)?,
        RampKind::Sine => sine_ramp(&t, tramp, t0),
        RampKind::HalfSine => halfsine_ramp(&t, tramp, t0),
    };
    if direction == RampDirection::Down {
        y.reverse();
    }
    Ok((t, y))
}

/// Smoothed rectangular pulse: ramp-up, plateau of `thigh`, ramp-down and
/// baseline of `tlow`, resampled to exactly `n` points.
pub fn smoothed_pulse_envelope(
    n: usize,
    tramp: f64,
    thigh: f64,
    tlow: f64,
    kind: RampKind,
) -> Result<(Vec<f64>, Vec<f64>)> {
    if n < 2 {
        bail!("envelope needs at least 2 points (got {n})");
    }
    if tramp <= 0.0 {
        bail!("ramp time must be strictly positive (got {tramp})");
    }
    let toffset = tramp + thigh;
    let ttot = 2.0 * tramp + thigh + tlow;
    let nramp = ((n as f64 * tramp / ttot).round() as usize + 1).max(2);

    let (tr, yr) = smooth_ramp(nramp, tramp, tramp / 2.0, kind, RampDirection::Up)?;
    let (mut tf, mut yf) = smooth_ramp(nramp, tramp, toffset + tramp / 2.0, kind, RampDirection::Down)?;

    let dt = tr[1] - tr[0];
    let last_rise = tr[tr.len() - 1];
    let th = arange(last_rise + dt, toffset - dt / 2.0, dt);
    if th.is_empty() {
        tf.remove(0);
        yf.remove(0);
    }
    let last_fall = tf.last().copied().unwrap_or(last_rise);
    let tl = arange(last_fall + dt, ttot + dt / 2.0, dt);

    let mut t = tr;
    let mut y = yr;
    y.extend(std::iter::repeat(1.0).take(th.len()));
    t.extend(th);
    t.extend(tf);
    y.extend(yf);
    y.extend(std::iter::repeat(0.0).take(tl.len()));
    t.extend(tl);

    let tnew = linspace(t[0], t[t.len() - 1], n);
    let ynew = interp(&tnew, &t, &y);
    Ok((tnew, ynew))
}

/// Smoothed pulse described by its repetition frequency (Hz), duty cycle
/// (%) and ramp time (s). Times of the returned vector are in ms.
pub fn duty_cycle_pulse_envelope(
    n: usize,
    prf: f64,
    duty_cycle: f64,
    tramp: f64,
    kind: RampKind,
) -> Result<(Vec<f64>, Vec<f64>)> {
    let dc = duty_cycle / 100.0;
    let tramp = tramp * 1e3;
    let pri = 1e3 / prf;
    let ton = dc * pri;
    let toff = pri - ton;
    let thigh = ton - tramp;
    let tlow = toff - tramp;
    if thigh < 0.0 {
        return Err(anyhow!(
            "ON duration ({ton:.2} ms) is too short for the specified ramp time ({tramp:.2} ms)"
        ));
    }
    if tlow < 0.0 {
        return Err(anyhow!(
            "OFF duration ({toff:.2} ms) is too short for the specified ramp time ({tramp:.2} ms)"
        ));
    }
    let tenv = thigh + tlow + 2.0 * tramp;
    if tenv > pri * (1.0 + 1e-9) {
        return Err(anyhow!(
            "ramped pulse duration ({tenv:.2} ms) exceeds pulse repetition interval ({pri:.2} ms)"
        ));
    }
    smoothed_pulse_envelope(n, tramp, thigh, tlow, kind)
}

/// Linear map of `y` onto `[lb, ub]`.
pub fn normalize(y: &[f64], lb: f64, ub: f64) -> Result<Vec<f64>> {
    let (min, max) = y
        .iter()
        .fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), &v| (lo.min(v), hi.max(v)));
    let ptp = max - min;
    if !ptp.is_finite() || ptp == 0.0 {
        bail!("cannot normalize a constant or empty signal");
    }
    Ok(y.iter().map(|&v| (v - min) / ptp * (ub - lb) + lb).collect())
}

pub fn linspace(start: f64, stop: f64, n: usize) -> Vec<f64> {
    match n {
        0 => Vec::new(),
        1 => vec![start],
        _ => {
            let step = (stop - start) / (n - 1) as f64;
            (0..n).map(|i| start + i as f64 * step).collect()
        }
    }
}

fn arange(start: f64, stop: f64, step: f64) -> Vec<f64> {
    if step <= 0.0 || stop <= start {
        return Vec::new();
    }
    let n = ((stop - start) / step).ceil() as usize;
    (0..n).map(|i| start + i as f64 * step).collect()
}

/// Piecewise-linear interpolation of `(xp, fp)` at `x`; `xp` must be
/// increasing. Values outside the range are clamped to the end points.
pub fn interp(x: &[f64], xp: &[f64], fp: &[f64]) -> Vec<f64> {
    let last = xp.len().saturating_sub(1);
    x.iter()
        .map(|&xi| {
            if xp.is_empty() {
                return f64::NAN;
            }
            if xi <= xp[0] {
                return fp[0];
            }
            if xi >= xp[last] {
                return fp[last];
            }
            let j = xp.partition_point(|&v| v <= xi);
            let (x0, x1) = (xp[j - 1], xp[j]);
            let (f0, f1) = (fp[j - 1], fp[j]);
            if x1 == x0 {
                f0
            } else {
                f0 + (f1 - f0) * (xi - x0) / (x1 - x0)
            }
        })
        .collect()
}

/// Resample `y` to `n` evenly spaced points over its index range.
pub fn resample(y: &[f64], n: usize) -> Vec<f64> {
    let xp: Vec<f64> = (0..y.len()).map(|i| i as f64).collect();
    let x = linspace(0.0, y.len().saturating_sub(1) as f64, n);
    interp(&x, &xp, y)
}
