//! VISA resource names and the configured resource list.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use anyhow::Result;
use regex::Regex;
use tracing::{debug, info};

use crate::config::VisaSettings;
use crate::error::VisaError;
use crate::transport::{SocketTransport, Transport, Vxi11Transport};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resource {
    /// `TCPIP[board]::host[::device]::INSTR`
    Vxi11 {
        board: u16,
        host: String,
        device: String,
    },
    /// `TCPIP[board]::host::port::SOCKET`
    Socket { board: u16, host: String, port: u16 },
    /// `USB[board]::vendor::product::serial[::interface]::INSTR`
    Usb {
        board: u16,
        vendor: String,
        product: String,
        serial: String,
    },
    /// `ASRL<port>::INSTR`
    Serial { port: String },
}

fn split_board(head: &str, keyword: &str) -> Option<Result<u16, VisaError>> {
    let board = split_prefix(head, keyword)?;
    if board.is_empty() {
        return Some(Ok(0));
    }
    Some(
        board
            .parse()
            .map_err(|_| VisaError::InvalidResource(head.to_string())),
    )
}

fn split_prefix<'a>(head: &'a str, keyword: &str) -> Option<&'a str> {
    if head.get(..keyword.len())?.eq_ignore_ascii_case(keyword) {
        head.get(keyword.len()..)
    } else {
        None
    }
}

impl FromStr for Resource {
    type Err = VisaError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || VisaError::InvalidResource(s.to_string());
        let parts: Vec<&str> = s.trim().split("::").collect();
        let (head, rest) = parts.split_first().ok_or_else(invalid)?;
        let class = rest.last().map(|c| c.to_ascii_uppercase());

        if let Some(board) = split_board(head, "TCPIP") {
            let board = board?;
            return match (rest, class.as_deref()) {
                ([host, _], Some("INSTR")) => Ok(Resource::Vxi11 {
                    board,
                    host: host.to_string(),
                    device: "inst0".to_string(),
                }),
                ([host, device, _], Some("INSTR")) => Ok(Resource::Vxi11 {
                    board,
                    host: host.to_string(),
                    device: device.to_string(),
                }),
                ([host, port, _], Some("SOCKET")) => Ok(Resource::Socket {
                    board,
                    host: host.to_string(),
                    port: port.parse().map_err(|_| invalid())?,
                }),
                _ => Err(invalid()),
            };
        }
        if let Some(board) = split_board(head, "USB") {
            let board = board?;
            return match (rest, class.as_deref()) {
                ([vendor, product, serial, _], Some("INSTR"))
                | ([vendor, product, serial, _, _], Some("INSTR")) => Ok(Resource::Usb {
                    board,
                    vendor: vendor.to_string(),
                    product: product.to_string(),
                    serial: serial.to_string(),
                }),
                _ => Err(invalid()),
            };
        }
        if let Some(port) = split_prefix(head, "ASRL").filter(|p| !p.is_empty()) {
            return match class.as_deref() {
                Some("INSTR") if rest.len() == 1 => Ok(Resource::Serial {
                    port: port.to_string(),
                }),
                _ => Err(invalid()),
            };
        }
        Err(invalid())
    }
}

impl fmt::Display for Resource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Resource::Vxi11 {
                board,
                host,
                device,
            } => write!(f, "TCPIP{board}::{host}::{device}::INSTR"),
            Resource::Socket { board, host, port } => {
                write!(f, "TCPIP{board}::{host}::{port}::SOCKET")
            }
            Resource::Usb {
                board,
                vendor,
                product,
                serial,
            } => write!(f, "USB{board}::{vendor}::{product}::{serial}::INSTR"),
            Resource::Serial { port } => write!(f, "ASRL{port}::INSTR"),
        }
    }
}

impl Resource {
    /// Whether this crate can open the resource over a network transport.
    pub fn is_openable(&self) -> bool {
        matches!(self, Resource::Vxi11 { .. } | Resource::Socket { .. })
    }

    pub async fn open(&self, timeout: Duration) -> Result<Box<dyn Transport>> {
        match self {
            Resource::Vxi11 { host, device, .. } => {
                Ok(Box::new(Vxi11Transport::connect(host, device, timeout).await?))
            }
            Resource::Socket { host, port, .. } => {
                Ok(Box::new(SocketTransport::connect(host, *port, timeout).await?))
            }
            Resource::Usb { .. } => Err(VisaError::UnsupportedInterface("USB".into()).into()),
            Resource::Serial { .. } => {
                Err(VisaError::UnsupportedInterface("ASRL".into()).into())
            }
        }
    }
}

/// The set of resources an application may talk to.
#[derive(Debug, Clone)]
pub struct ResourceManager {
    resources: Vec<Resource>,
    timeout: Duration,
}

impl ResourceManager {
    pub fn new(resources: Vec<Resource>, timeout: Duration) -> Self {
        Self { resources, timeout }
    }

    pub fn from_settings(settings: &VisaSettings) -> Result<Self> {
        let resources = settings
            .resources
            .iter()
            .map(|r| r.parse::<Resource>())
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self::new(resources, settings.timeout()))
    }

    pub fn list_resources(&self) -> &[Resource] {
        &self.resources
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Open the first resource whose name or `*IDN?` reply matches `id`.
    ///
    /// Names of openable resources are checked first so that ids embedded
    /// in names match without an `*IDN?` exchange. A name match that fails
    /// to open falls through to the `*IDN?` scan.
    pub async fn find(&self, id: &Regex) -> Result<(Resource, Box<dyn Transport>)> {
        if self.resources.is_empty() {
            return Err(VisaError::NoInstrument.into());
        }
        let by_name = self
            .resources
            .iter()
            .filter(|r| r.is_openable() && id.is_match(&r.to_string()));
        for res in by_name {
            match res.open(self.timeout).await {
                Ok(link) => {
                    debug!("{res} matches {id} by name");
                    return Ok((res.clone(), link));
                }
                Err(e) => debug!("{res} matches {id} by name but failed to open: {e:#}"),
            }
        }
        for res in self.resources.iter().filter(|r| r.is_openable()) {
            let mut link = match res.open(self.timeout).await {
                Ok(link) => link,
                Err(e) => {
                    debug!("skipping {res}: {e:#}");
                    continue;
                }
            };
            match identify(link.as_mut()).await {
                Ok(idn) if id.is_match(&idn) => {
                    info!("{res} identified as {idn}");
                    return Ok((res.clone(), link));
                }
                Ok(idn) => debug!("{res} is {idn}, not {id}"),
                Err(e) => debug!("{res} did not identify: {e:#}"),
            }
            let _ = link.close().await;
        }
        Err(VisaError::NotDetected(id.as_str().to_string()).into())
    }
}

/// Query `*IDN?` without resetting the instrument.
pub async fn identify(link: &mut dyn Transport) -> Result<String> {
    link.write(b"*IDN?\n").await?;
    let mut reply = Vec::new();
    while !reply.ends_with(b"\n") {
        reply.extend(link.read().await?);
    }
    Ok(String::from_utf8_lossy(&reply).trim().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_lan_resources() {
        let r: Resource = "TCPIP0::192.168.0.232::inst0::INSTR".parse().unwrap();
        assert_eq!(
            r,
            Resource::Vxi11 {
                board: 0,
                host: "192.168.0.232".into(),
                device: "inst0".into()
            }
        );
        let r: Resource = "TCPIP::scope.lan::INSTR".parse().unwrap();
        assert!(matches!(r, Resource::Vxi11 { ref device, .. } if device == "inst0"));
        let r: Resource = "tcpip1::10.0.0.5::5555::socket".parse().unwrap();
        assert_eq!(
            r,
            Resource::Socket {
                board: 1,
                host: "10.0.0.5".into(),
                port: 5555
            }
        );
    }

    #[test]
    fn parses_usb_and_serial_resources() {
        let r: Resource = "USB0::0x1AB1::0x0642::DG1ZA2012604407::INSTR".parse().unwrap();
        assert!(matches!(r, Resource::Usb { ref serial, .. } if serial == "DG1ZA2012604407"));
        assert!(!r.is_openable());
        let r: Resource = "ASRL/dev/ttyUSB0::INSTR".parse().unwrap();
        assert_eq!(
            r,
            Resource::Serial {
                port: "/dev/ttyUSB0".into()
            }
        );
    }

    #[test]
    fn rejects_malformed_names() {
        for bad in ["", "GPIB0::12::INSTR", "TCPIP0::host::notaport::SOCKET", "USB::1::INSTR"] {
            assert!(bad.parse::<Resource>().is_err(), "{bad}");
        }
    }

    #[test]
    fn display_round_trips() {
        let name = "TCPIP0::10.0.0.5::5555::SOCKET";
        assert_eq!(name.parse::<Resource>().unwrap().to_string(), name);
    }

    #[tokio::test]
    async fn find_requires_resources() {
        let rm = ResourceManager::new(vec![], Duration::from_millis(10));
        let err = rm.find(&Regex::new("DG1ZA").unwrap()).await.err().unwrap();
        assert_eq!(err.downcast_ref::<VisaError>(), Some(&VisaError::NoInstrument));
    }

    #[tokio::test]
    async fn find_skips_unopenable_resources() {
        let rm = ResourceManager::new(
            vec!["ASRL3::INSTR".parse().unwrap()],
            Duration::from_millis(10),
        );
        let err = rm.find(&Regex::new("DS1ZA").unwrap()).await.err().unwrap();
        assert!(matches!(
            err.downcast_ref::<VisaError>(),
            Some(VisaError::NotDetected(_))
        ));
    }

    #[tokio::test]
    async fn find_matches_by_idn_over_socket() {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            let (mut sock, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 6];
            sock.read_exact(&mut buf).await.unwrap();
            sock.write_all(b"RIGOL TECHNOLOGIES,DS1054Z,DS1ZA1234,00.04\n")
                .await
                .unwrap();
        });
        let rm = ResourceManager::new(
            vec![format!("TCPIP0::127.0.0.1::{port}::SOCKET").parse().unwrap()],
            Duration::from_secs(2),
        );
        let (res, _link) = rm.find(&Regex::new(r"DS1ZA\d+").unwrap()).await.unwrap();
        assert!(matches!(res, Resource::Socket { .. }));
    }

    #[tokio::test]
    async fn unopenable_name_match_does_not_hide_idn_match() {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            let (mut sock, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 6];
            sock.read_exact(&mut buf).await.unwrap();
            assert_eq!(&buf, b"*IDN?\n");
            sock.write_all(b"Rigol Technologies,DG1022Z,DG1ZA2222,00.01.14\n")
                .await
                .unwrap();
        });
        let rm = ResourceManager::new(
            vec![
                "USB0::0x1AB1::0x0642::DG1ZA1111::INSTR".parse().unwrap(),
                format!("TCPIP0::127.0.0.1::{port}::SOCKET").parse().unwrap(),
            ],
            Duration::from_secs(2),
        );
        let (res, _link) = rm.find(&Regex::new(r"DG1ZA\d+").unwrap()).await.unwrap();
        assert_eq!(res.to_string(), format!("TCPIP0::127.0.0.1::{port}::SOCKET"));
    }
}
