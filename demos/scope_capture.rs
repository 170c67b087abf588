use anyhow::Result;
use lab_instruments::{factory, logging, Settings};

/// Arm a single acquisition on channel 1 and print summary statistics.
#[tokio::main]
async fn main() -> Result<()> {
    let settings = Settings::load()?;
    logging::init(&settings.log_level)?;

    let key = std::env::args().nth(1);
    let mut scope = factory::grab_oscilloscope(&settings, key.as_deref()).await?;
    println!("IDN: {}", scope.idn().await?);

    scope.restrict_traces(&[1]).await?;
    scope.set_temporal_scale(100e-6).await?;
    scope.set_multichannel_vscale(0.1, 1, None, None).await?;
    scope.force_trigger().await?;

    let wf = scope.waveform_data(1).await?;
    if wf.is_empty() {
        println!("empty waveform");
        return Ok(());
    }
    let vmin = wf.volts.iter().copied().fold(f64::INFINITY, f64::min);
    let vmax = wf.volts.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    println!(
        "{} samples over {:.3e} s, {:.3} V to {:.3} V (sample rate {:.3e} Sa/s)",
        wf.len(),
        wf.time.last().copied().unwrap_or(0.0) - wf.time[0],
        vmin,
        vmax,
        scope.sample_rate().await?
    );
    Ok(())
}
