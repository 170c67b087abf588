//! Micro-manipulators.

use anyhow::Result;
use async_trait::async_trait;

pub mod sutter_mp285a;

pub use sutter_mp285a::{Flags, Flags2, Resolution, SutterMp285a, SutterStatus};

/// Three-axis stage positioned in micrometers.
#[async_trait]
pub trait Manipulator: Send {
    /// Current (X, Y, Z) position (um).
    async fn position(&mut self) -> Result<[f64; 3]>;

    async fn set_position(&mut self, pos: [f64; 3]) -> Result<()>;

    /// Move by `delta` (um) from the current position.
    async fn translate(&mut self, delta: [f64; 3]) -> Result<()> {
        let pos = self.position().await?;
        self.set_position([pos[0] + delta[0], pos[1] + delta[1], pos[2] + delta[2]])
            .await
    }

    async fn move_to_origin(&mut self) -> Result<()> {
        self.set_position([0.0; 3]).await
    }

    /// Travel speed (um/s).
    fn velocity(&self) -> u16;

    async fn set_velocity(&mut self, v: u16) -> Result<()>;

    async fn disconnect(&mut self) -> Result<()>;
}

/// `[x, y, z] um` with two decimals.
pub fn pos_str(pos: &[f64; 3]) -> String {
    let coords: Vec<String> = pos.iter().map(|x| format!("{x:.2}")).collect();
    format!("[{}] um", coords.join(", "))
}
