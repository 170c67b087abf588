//! Byte-level links to SCPI instruments.
//!
//! A [`Transport`] moves raw bytes; message framing (newline terminators,
//! IEEE 488.2 blocks) is handled by [`crate::visa::VisaInstrument`].

use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;

mod socket;
mod vxi11;

#[cfg(test)]
pub(crate) mod mock;

pub use socket::SocketTransport;
pub use vxi11::Vxi11Transport;

/// Largest chunk requested from the instrument in a single read.
pub const CHUNK_SIZE: u32 = 64 * 1024;

#[async_trait]
pub trait Transport: Send {
    /// Send `data` as one message.
    async fn write(&mut self, data: &[u8]) -> Result<()>;

    /// Read whatever the instrument has ready, at most [`CHUNK_SIZE`] bytes.
    ///
    /// An empty vector is never returned; a silent instrument times out.
    async fn read(&mut self) -> Result<Vec<u8>>;

    /// I/O timeout applied to every read and write.
    fn timeout(&self) -> Duration;

    fn set_timeout(&mut self, timeout: Duration);

    async fn close(&mut self) -> Result<()>;

    /// Human-readable description of the link, e.g. the resource name.
    fn describe(&self) -> String;
}
