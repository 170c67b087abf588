//! Oscilloscopes.

use anyhow::Result;
use async_trait::async_trait;
use tracing::warn;

use crate::generator::TTL_PAMP;
use crate::si::si_format;

pub mod bk_2555;
pub mod rigol_ds1054z;

pub use bk_2555::Bk2555;
pub use rigol_ds1054z::RigolDs1054z;

/// Sampled trace of a single channel.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Waveform {
    /// Time (s), zero at the trigger.
    pub time: Vec<f64>,
    /// Signal (V).
    pub volts: Vec<f64>,
}

impl Waveform {
    pub fn len(&self) -> usize {
        self.volts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.volts.is_empty()
    }

    /// Build the time vector as `i * dt + t0`.
    pub fn from_samples(volts: Vec<f64>, dt: f64, t0: f64) -> Self {
        let time = (0..volts.len()).map(|i| i as f64 * dt + t0).collect();
        Self { time, volts }
    }
}

/// Valid s/div settings: each of `bases` times every decade from 1 ns to 10 s.
pub fn timebase_ladder(bases: &[f64]) -> Vec<f64> {
    (-9..=1)
        .flat_map(|exp| bases.iter().map(move |b| b * 10f64.powi(exp)))
        .collect()
}

/// Ladder entry closest to `value` in log distance.
pub fn closest_timebase(ladder: &[f64], value: f64) -> f64 {
    let target = value.ln();
    ladder
        .iter()
        .copied()
        .min_by(|a, b| {
            (a.ln() - target)
                .abs()
                .total_cmp(&(b.ln() - target).abs())
        })
        .unwrap_or(value)
}

/// Restrict a trigger delay to the displayed window `±half_range`.
pub fn clamp_trigger_delay(value: f64, half_range: f64) -> f64 {
    if value.abs() > half_range {
        warn!(
            "target temporal delay ({}s) outside of current display temporal bounds (+/- {}s) -> restricting",
            si_format(value, 2),
            si_format(half_range, 2)
        );
        return value.signum() * half_range;
    }
    value
}

/// Restrict a vertical scale to the instrument maximum.
pub fn clamp_vertical_scale(value: f64, max_vdiv: f64) -> f64 {
    if value > max_vdiv {
        warn!(
            "target vertical scale ({value} V/div) above instrument limit ({max_vdiv} V/div) -> restricting"
        );
        return max_vdiv;
    }
    value
}

/// Operations shared by every oscilloscope.
///
/// Mode arguments are passed as instrument mnemonics and validated by each
/// model against its own option set.
#[async_trait]
pub trait Oscilloscope: Send {
    fn channels(&self) -> &'static [u8];

    /// Number of horizontal divisions on screen.
    fn nhdivs(&self) -> u32;

    async fn idn(&mut self) -> Result<String>;

    async fn show_trace(&mut self, ich: u8) -> Result<()>;

    async fn hide_trace(&mut self, ich: u8) -> Result<()>;

    async fn is_trace(&mut self, ich: u8) -> Result<bool>;

    /// Show `ichs` and hide every other visible trace.
    async fn restrict_traces(&mut self, ichs: &[u8]) -> Result<()> {
        for &ich in ichs {
            self.show_trace(ich).await?;
        }
        for &ich in self.channels() {
            if !ichs.contains(&ich) && self.is_trace(ich).await? {
                self.hide_trace(ich).await?;
            }
        }
        Ok(())
    }

    async fn auto_setup(&mut self) -> Result<()>;

    /// s/div, snapped to the closest valid value.
    async fn set_temporal_scale(&mut self, value: f64) -> Result<()>;

    async fn temporal_scale(&mut self) -> Result<f64>;

    /// Displayed time window (s).
    async fn temporal_range(&mut self) -> Result<f64> {
        Ok(self.temporal_scale().await? * f64::from(self.nhdivs()))
    }

    /// V/div.
    async fn set_vertical_scale(&mut self, ich: u8, value: f64) -> Result<()>;

    async fn vertical_scale(&mut self, ich: u8) -> Result<f64>;

    async fn set_vertical_offset(&mut self, ich: u8, value: f64) -> Result<()>;

    async fn vertical_offset(&mut self, ich: u8) -> Result<f64>;

    async fn enable_bandwidth_filter(&mut self, ich: u8) -> Result<()>;

    async fn disable_bandwidth_filter(&mut self, ich: u8) -> Result<()>;

    async fn is_bandwidth_filter_enabled(&mut self, ich: u8) -> Result<bool>;

    async fn channel_attenuation(&mut self, ich: u8) -> Result<f64>;

    async fn set_channel_attenuation(&mut self, ich: u8, value: f64) -> Result<()>;

    async fn coupling_mode(&mut self, ich: u8) -> Result<String>;

    async fn set_coupling_mode(&mut self, ich: u8, mode: &str) -> Result<()>;

    async fn trigger_mode(&mut self) -> Result<String>;

    async fn set_trigger_mode(&mut self, mode: &str) -> Result<()>;

    /// Index of the channel the trigger listens to.
    async fn trigger_source(&mut self) -> Result<u8>;

    async fn set_trigger_source(&mut self, ich: u8) -> Result<()>;

    async fn trigger_level(&mut self, ich: u8) -> Result<f64>;

    async fn set_trigger_level(&mut self, ich: u8, value: f64) -> Result<()>;

    async fn trigger_delay(&mut self) -> Result<f64>;

    /// Trigger delay (s), restricted to the displayed window.
    async fn set_trigger_delay(&mut self, value: f64) -> Result<()>;

    /// Trigger delay as a multiple of the temporal scale.
    async fn set_relative_trigger_delay(&mut self, value: f64) -> Result<()> {
        let tdiv = self.temporal_scale().await?;
        self.set_trigger_delay(value * tdiv).await
    }

    /// Force a single acquisition.
    async fn force_trigger(&mut self) -> Result<()>;

    async fn arm_acquisition(&mut self) -> Result<()>;

    async fn stop_acquisition(&mut self) -> Result<()>;

    /// Samples per second.
    async fn sample_rate(&mut self) -> Result<f64>;

    async fn waveform_data(&mut self, ich: u8) -> Result<Waveform>;

    /// Set the signal channel scale and, when a trigger channel is given,
    /// scale it and set its level to `trig_detect` (TTL/2 by default).
    async fn set_multichannel_vscale(
        &mut self,
        vscale: f64,
        ich_signal: u8,
        ich_trigger: Option<u8>,
        trig_detect: Option<f64>,
    ) -> Result<()> {
        let trig_detect = trig_detect.unwrap_or(TTL_PAMP / 2.0);
        self.set_vertical_scale(ich_signal, vscale).await?;
        if let Some(ich) = ich_trigger {
            self.set_vertical_scale(ich, trig_detect).await?;
            self.set_trigger_level(ich, trig_detect).await?;
        }
        self.set_trigger_source(ich_trigger.unwrap_or(ich_signal))
            .await
    }

    /// Release the link.
    async fn disconnect(&mut self) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ladders_span_nanoseconds_to_seconds() {
        let rigol = timebase_ladder(&[1.0, 2.0, 5.0]);
        assert_eq!(rigol.len(), 33);
        assert!((rigol[0] - 1e-9).abs() < 1e-21);
        assert!((rigol[32] - 50.0).abs() < 1e-9);
        let bk = timebase_ladder(&[1.0, 2.5, 5.0]);
        assert!((bk[1] - 2.5e-9).abs() < 1e-21);
    }

    #[test]
    fn closest_timebase_uses_log_distance() {
        let ladder = timebase_ladder(&[1.0, 2.0, 5.0]);
        assert!((closest_timebase(&ladder, 3e-4) - 2e-4).abs() < 1e-12);
        assert!((closest_timebase(&ladder, 3.3e-4) - 5e-4).abs() < 1e-12);
        assert!((closest_timebase(&ladder, 1e-3) - 1e-3).abs() < 1e-12);
    }

    #[test]
    fn trigger_delay_is_clamped() {
        assert_eq!(clamp_trigger_delay(1e-3, 6e-3), 1e-3);
        assert_eq!(clamp_trigger_delay(-1e-2, 6e-3), -6e-3);
        assert_eq!(clamp_vertical_scale(20.0, 10.0), 10.0);
    }

    #[test]
    fn waveform_time_vector() {
        let wf = Waveform::from_samples(vec![0.0; 3], 1e-3, -1e-3);
        assert_eq!(wf.len(), 3);
        assert!((wf.time[2] - 1e-3).abs() < 1e-15);
    }
}
