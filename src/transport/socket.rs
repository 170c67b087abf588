use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::debug;

use super::{Transport, CHUNK_SIZE};

/// Raw SCPI over TCP (`TCPIP::host::5555::SOCKET` resources).
pub struct SocketTransport {
    stream: TcpStream,
    host: String,
    port: u16,
    timeout: Duration,
}

impl SocketTransport {
    pub async fn connect(host: &str, port: u16, io_timeout: Duration) -> Result<Self> {
        debug!("socket connect -> {host}:{port}");
        let stream = timeout(io_timeout, TcpStream::connect((host, port)))
            .await
            .with_context(|| format!("timed out connecting to {host}:{port}"))?
            .with_context(|| format!("failed to connect to {host}:{port}"))?;
        stream.set_nodelay(true)?;
        Ok(Self {
            stream,
            host: host.to_string(),
            port,
            timeout: io_timeout,
        })
    }
}

#[async_trait]
impl Transport for SocketTransport {
    async fn write(&mut self, data: &[u8]) -> Result<()> {
        timeout(self.timeout, self.stream.write_all(data))
            .await
            .context("socket write timed out")??;
        Ok(())
    }

    async fn read(&mut self) -> Result<Vec<u8>> {
        let mut buf = vec![0u8; CHUNK_SIZE as usize];
        let n = timeout(self.timeout, self.stream.read(&mut buf))
            .await
            .context("socket read timed out")??;
        if n == 0 {
            return Err(anyhow!("{}:{} closed the connection", self.host, self.port));
        }
        buf.truncate(n);
        Ok(buf)
    }

    fn timeout(&self) -> Duration {
        self.timeout
    }

    fn set_timeout(&mut self, timeout: Duration) {
        self.timeout = timeout;
    }

    async fn close(&mut self) -> Result<()> {
        self.stream.shutdown().await?;
        Ok(())
    }

    fn describe(&self) -> String {
        format!("TCPIP::{}::{}::SOCKET", self.host, self.port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn exchanges_bytes_with_a_listener() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let server = tokio::spawn(async move {
            let (mut sock, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 6];
            sock.read_exact(&mut buf).await.unwrap();
            assert_eq!(&buf, b"*IDN?\n");
            sock.write_all(b"RIGOL,DG1022Z,DG1ZA1,00.01\n").await.unwrap();
        });

        let mut link = SocketTransport::connect("127.0.0.1", port, Duration::from_secs(2))
            .await
            .unwrap();
        link.write(b"*IDN?\n").await.unwrap();
        let mut reply = Vec::new();
        while !reply.ends_with(b"\n") {
            reply.extend(link.read().await.unwrap());
        }
        assert_eq!(reply, b"RIGOL,DG1022Z,DG1ZA1,00.01\n");
        assert_eq!(link.describe(), format!("TCPIP::127.0.0.1::{port}::SOCKET"));
        server.await.unwrap();
    }
}
