use anyhow::Result;
use lab_instruments::manipulator::{pos_str, SutterMp285a};
use lab_instruments::{logging, Settings};

/// Trace a 100 um square in the XY plane and return to the start.
#[tokio::main]
async fn main() -> Result<()> {
    let settings = Settings::load()?;
    logging::init(&settings.log_level)?;

    let mut stage = SutterMp285a::connect(&settings.sutter).await?;
    let start = stage.position().await?;
    println!("start: {}", pos_str(&start));

    stage.set_velocity(500).await?;
    for delta in [[100.0, 0.0, 0.0], [0.0, 100.0, 0.0], [-100.0, 0.0, 0.0], [0.0, -100.0, 0.0]] {
        stage.translate(delta).await?;
        println!("at {}", pos_str(&stage.position().await?));
    }

    stage.set_position(start).await?;
    stage.disconnect().await?;
    Ok(())
}
