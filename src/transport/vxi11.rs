use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use tokio::time::timeout;
use tokio_vxi11::DeviceClient;
use tracing::debug;

use super::{Transport, CHUNK_SIZE};

/// VXI-11 link (`TCPIP::host::inst0::INSTR` resources).
pub struct Vxi11Transport {
    inner: DeviceClient,
    host: String,
    device: String,
    timeout: Duration,
}

impl Vxi11Transport {
    pub async fn connect(host: &str, device: &str, io_timeout: Duration) -> Result<Self> {
        debug!("VXI-11 connect -> {host} ({device})");
        let inner = timeout(
            io_timeout,
            DeviceClient::connect_with_timeout(host, device, io_timeout),
        )
        .await
        .with_context(|| format!("timed out connecting to {host}"))?
        .with_context(|| format!("failed to connect to {host} ({device})"))?;
        Ok(Self {
            inner,
            host: host.to_string(),
            device: device.to_string(),
            timeout: io_timeout,
        })
    }
}

#[async_trait]
impl Transport for Vxi11Transport {
    async fn write(&mut self, data: &[u8]) -> Result<()> {
        timeout(self.timeout, self.inner.write(data))
            .await
            .context("VXI-11 write timed out")??;
        Ok(())
    }

    async fn read(&mut self) -> Result<Vec<u8>> {
        let data = timeout(self.timeout, self.inner.read(CHUNK_SIZE))
            .await
            .context("VXI-11 read timed out")??;
        Ok(data)
    }

    fn timeout(&self) -> Duration {
        self.timeout
    }

    fn set_timeout(&mut self, timeout: Duration) {
        self.timeout = timeout;
    }

    async fn close(&mut self) -> Result<()> {
        self.inner.close().await?;
        Ok(())
    }

    fn describe(&self) -> String {
        format!("TCPIP::{}::{}::INSTR", self.host, self.device)
    }
}
