use std::time::Duration;

use anyhow::Result;
use lab_instruments::resource::{identify, Resource};
use lab_instruments::{logging, Settings};
use tokio::time::timeout;

#[tokio::main]
async fn main() -> Result<()> {
    let settings = Settings::load()?;
    logging::init(&settings.log_level)?;

    let to = settings.visa.timeout();
    for name in &settings.visa.resources {
        let res: Resource = match name.parse() {
            Ok(res) => res,
            Err(e) => {
                println!("{name}: {e}");
                continue;
            }
        };
        if !res.is_openable() {
            println!("{res}: skipped (interface not supported)");
            continue;
        }
        let mut link = match timeout(Duration::from_secs(5), res.open(to)).await {
            Ok(Ok(link)) => link,
            Ok(Err(e)) => {
                println!("{res}: {e:#}");
                continue;
            }
            Err(_) => {
                println!("{res}: connection timed out (5 s), check power and network");
                continue;
            }
        };
        match timeout(to, identify(link.as_mut())).await {
            Ok(Ok(idn)) => println!("{res}: {idn}"),
            Ok(Err(e)) => println!("{res}: {e:#}"),
            Err(_) => println!("{res}: no reply to *IDN?"),
        }
        link.close().await?;
    }
    Ok(())
}
