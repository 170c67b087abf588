use std::time::Duration;

use anyhow::Result;
use lab_instruments::generator::{GateType, RigolDg1022z, SineBurstTrain, TriggerSource};
use lab_instruments::resource::ResourceManager;
use lab_instruments::{logging, Settings};

/// 500 kHz, 200 mVpp bursts at 100 Hz PRF with 50% duty cycle for 200 ms,
/// gated by channel 1 and output on channel 2.
#[tokio::main]
async fn main() -> Result<()> {
    let settings = Settings::load()?;
    logging::init(&settings.log_level)?;

    let rm = ResourceManager::from_settings(&settings.visa)?;
    let mut fg = RigolDg1022z::connect(&rm).await?;
    println!("IDN: {}", fg.idn().await?);

    let train = SineBurstTrain {
        fdrive: 500e3,
        vpp: 0.2,
        tstim: 200e-3,
        prf: 100.0,
        duty_cycle: 50.0,
        period: None,
        trigger_source: TriggerSource::Manual,
    };
    fg.set_gated_sine_burst(&train, 0.0, 1, 2, GateType::Trigger).await?;
    fg.display_for("burst armed", Duration::from_secs(2)).await?;

    println!("firing one train...");
    fg.trigger_channel(1).await?;
    tokio::time::sleep(Duration::from_millis(500)).await;

    fg.disable_output().await?;
    fg.check_error().await?;
    Ok(())
}
