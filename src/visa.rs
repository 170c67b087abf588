//! Generic SCPI instrument core shared by every VISA-style driver.

use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use futures::future::BoxFuture;
use regex::Regex;
use tracing::{debug, info};

use crate::error::VisaError;
use crate::resource::ResourceManager;
use crate::si::apply_suffix;
use crate::transport::Transport;

/// Static description of an instrument model.
#[derive(Debug, Clone, Copy)]
pub struct ModelInfo {
    /// Driver name used in log banners.
    pub name: &'static str,
    /// Regex matched against resource names and `*IDN?` replies.
    pub id_pattern: &'static str,
    /// Prepended to every non-common command.
    pub prefix: &'static str,
    /// Reply of the error query when the queue is empty.
    pub no_error: &'static str,
    /// I/O timeout to apply after connection, when the default is too short.
    pub timeout: Option<Duration>,
}

/// A connected SCPI instrument.
pub struct VisaInstrument {
    link: Box<dyn Transport>,
    model: ModelInfo,
}

impl VisaInstrument {
    /// Locate the model among the configured resources and connect to it.
    pub async fn open(rm: &ResourceManager, model: ModelInfo) -> Result<Self> {
        let id = Regex::new(model.id_pattern)
            .with_context(|| format!("invalid id pattern for {}", model.name))?;
        let (resource, link) = rm.find(&id).await.map_err(|e| {
            e.context(format!(
                "{} instrument ID {:?} not detected. Check the connection or update the resource list",
                model.name, model.id_pattern
            ))
        })?;
        debug!("opened {resource} for {}", model.name);
        Self::from_transport(link, model).await
    }

    /// Wrap an already open link: reset, clear the error queue, apply the
    /// model timeout and log a banner.
    pub async fn from_transport(link: Box<dyn Transport>, model: ModelInfo) -> Result<Self> {
        let mut inst = Self { link, model };
        inst.reset().await?;
        inst.clear().await?;
        if let Some(timeout) = model.timeout {
            inst.set_timeout(timeout);
        }
        let idn = inst.idn().await?;
        info!("{:-^80}", format!(" {}: {} ", model.name, idn));
        Ok(inst)
    }

    pub fn model(&self) -> &ModelInfo {
        &self.model
    }

    pub fn timeout(&self) -> Duration {
        self.link.timeout()
    }

    pub fn set_timeout(&mut self, timeout: Duration) {
        self.link.set_timeout(timeout);
    }

    pub fn describe(&self) -> String {
        self.link.describe()
    }

    pub async fn close(&mut self) -> Result<()> {
        info!("releasing {} resource", self.model.name);
        self.link.close().await
    }

    /// Apply the model prefix, leaving IEEE 488.2 common commands untouched.
    pub fn process_text(&self, text: &str) -> String {
        if text.starts_with('*') {
            text.to_string()
        } else {
            format!("{}{}", self.model.prefix, text)
        }
    }

    pub async fn write(&mut self, text: &str) -> Result<()> {
        let command = self.process_text(text);
        debug!("SCPI write  -> {command}");
        self.link
            .write(format!("{command}\n").as_bytes())
            .await
            .with_context(|| format!("failed to send {command:?}"))
    }

    /// Send `header` immediately followed by `values` as an IEEE 488.2
    /// definite-length block of little-endian u16.
    pub async fn write_u16_block(&mut self, header: &str, values: &[u16]) -> Result<()> {
        let command = self.process_text(header);
        debug!("SCPI write  -> {command} <{} values>", values.len());
        let payload: Vec<u8> = values.iter().flat_map(|v| v.to_le_bytes()).collect();
        let mut message = command.clone().into_bytes();
        message.extend(encode_ieee_block(&payload));
        message.push(b'\n');
        self.link
            .write(&message)
            .await
            .with_context(|| format!("failed to send {command:?}"))
    }

    /// Read one newline-terminated message.
    pub async fn read_raw(&mut self) -> Result<Vec<u8>> {
        let mut message = Vec::new();
        while !message.ends_with(b"\n") {
            message.extend(self.link.read().await?);
        }
        Ok(message)
    }

    pub async fn query(&mut self, text: &str) -> Result<String> {
        self.write(text).await?;
        let raw = self.read_raw().await?;
        let out = String::from_utf8_lossy(&raw)
            .trim_matches(char::from(0))
            .trim()
            .to_string();
        debug!("SCPI result <- {out}");
        if out.is_empty() {
            return Err(anyhow!("empty response from device for command {text:?}"));
        }
        Ok(out)
    }

    pub async fn query_f64(&mut self, text: &str) -> Result<f64> {
        let out = self.query(text).await?;
        parse_f64(&out)
    }

    pub async fn query_i64(&mut self, text: &str) -> Result<i64> {
        let out = self.query(text).await?;
        // Some firmwares answer integer queries in float notation.
        out.parse::<i64>()
            .or_else(|_| parse_f64(&out).map(|v| v.round() as i64))
            .map_err(|_| anyhow!("failed to parse integer from {out:?}"))
    }

    pub async fn query_bool(&mut self, text: &str) -> Result<bool> {
        let out = self.query(text).await?;
        Ok(parse_on_off(&out))
    }

    /// Query a binary block and return its payload.
    ///
    /// Reading stops once the block and its message terminator are in.
    pub async fn query_block(&mut self, text: &str) -> Result<Vec<u8>> {
        self.write(text).await?;
        let mut data = Vec::new();
        loop {
            data.extend(self.link.read().await?);
            if let Some(end) = block_extent(&data)? {
                if data.len() > end {
                    break;
                }
            }
        }
        let payload = decode_ieee_block(&data)?;
        debug!("SCPI result <- <{} bytes>", payload.len());
        Ok(payload.to_vec())
    }

    // --------------------- common commands ---------------------

    pub async fn idn(&mut self) -> Result<String> {
        self.query("*IDN?").await
    }

    /// Manufacturer and model, e.g. `RIGOL TECHNOLOGIES DG1022Z`.
    pub async fn name(&mut self) -> Result<String> {
        let idn = self.idn().await?;
        let mut parts = idn.split(',');
        match (parts.next(), parts.next()) {
            (Some(manufacturer), Some(model)) => Ok(format!("{manufacturer} {model}")),
            _ => Err(VisaError::Response {
                command: "*IDN?".into(),
                response: idn,
            }
            .into()),
        }
    }

    pub async fn reset(&mut self) -> Result<()> {
        self.write("*RST").await
    }

    pub async fn clear(&mut self) -> Result<()> {
        self.write("*CLS").await
    }

    pub async fn wait(&mut self) -> Result<()> {
        self.write("*WAI").await
    }

    pub async fn trigger(&mut self) -> Result<()> {
        self.write("*TRG").await
    }

    pub async fn is_operation_complete(&mut self) -> Result<bool> {
        Ok(self.query_i64("*OPC?").await? == 1)
    }

    /// Query the error queue with `command` and fail unless it is empty.
    pub async fn check_error(&mut self, command: &str) -> Result<()> {
        let out = self.query(command).await?;
        if out != self.model.no_error {
            return Err(VisaError::Instrument(out).into());
        }
        Ok(())
    }
}

/// Run `first`, wait `interval`, then run `second`.
pub async fn chain<T, F1, F2>(target: &mut T, first: F1, second: F2, interval: Duration) -> Result<()>
where
    T: Send,
    F1: for<'a> FnOnce(&'a mut T) -> BoxFuture<'a, Result<()>>,
    F2: for<'a> FnOnce(&'a mut T) -> BoxFuture<'a, Result<()>>,
{
    if interval.is_zero() {
        return Err(VisaError::OutOfRange("interval must be strictly positive".into()).into());
    }
    first(target).await?;
    tokio::time::sleep(interval).await;
    second(target).await
}

pub fn check_channel(ich: u8, channels: &[u8]) -> Result<(), VisaError> {
    if channels.contains(&ich) {
        Ok(())
    } else {
        Err(VisaError::InvalidChannel(ich, channels.to_vec()))
    }
}

pub fn check_option<T: PartialEq + std::fmt::Debug>(
    value: &T,
    options: &[T],
    what: &str,
) -> Result<(), VisaError> {
    if options.contains(value) {
        Ok(())
    } else {
        Err(VisaError::InvalidOption {
            what: what.to_string(),
            value: format!("{value:?}"),
            options: options.iter().map(|o| format!("{o:?}")).collect(),
        })
    }
}

pub fn parse_f64(input: &str) -> Result<f64> {
    input
        .trim()
        .parse::<f64>()
        .map_err(|e| anyhow!("failed to parse float from {input:?}: {e}"))
}

pub fn parse_on_off(value: &str) -> bool {
    value.trim().eq_ignore_ascii_case("ON") || value.trim() == "1"
}

/// Extract a float from `out` with a regex whose first group is the value
/// and optional second group its unit suffix.
pub fn extract_float(out: &str, re: &Regex, key: &str, units: &[&str]) -> Result<f64, VisaError> {
    let fail = || VisaError::Response {
        command: key.to_string(),
        response: out.to_string(),
    };
    let caps = re.captures(out).ok_or_else(fail)?;
    let value: f64 = caps
        .get(1)
        .ok_or_else(fail)?
        .as_str()
        .parse()
        .map_err(|_| fail())?;
    let suffix = caps.get(2).map(|m| m.as_str()).unwrap_or("");
    apply_suffix(value, suffix, units).ok_or_else(fail)
}

/// Extract an integer from the first group of `re`.
pub fn extract_int(out: &str, re: &Regex, key: &str) -> Result<i64, VisaError> {
    re.captures(out)
        .and_then(|c| c.get(1))
        .and_then(|m| m.as_str().parse().ok())
        .ok_or_else(|| VisaError::Response {
            command: key.to_string(),
            response: out.to_string(),
        })
}

/// Offset of the end of a (possibly partial) IEEE block, once the header
/// is complete.
fn block_extent(data: &[u8]) -> Result<Option<usize>> {
    let Some(start) = data.iter().position(|&b| b == b'#') else {
        if data.ends_with(b"\n") {
            return Err(anyhow!(
                "expected binary block, got {:?}",
                String::from_utf8_lossy(data)
            ));
        }
        return Ok(None);
    };
    let Some(&ndigits) = data.get(start + 1) else {
        return Ok(None);
    };
    if !ndigits.is_ascii_digit() {
        return Err(anyhow!("malformed binary block header"));
    }
    let ndigits = (ndigits - b'0') as usize;
    if ndigits == 0 {
        // Indefinite-length block, terminated by newline.
        return Ok(data.ends_with(b"\n").then(|| data.len() - 1));
    }
    let header_end = start + 2 + ndigits;
    let Some(digits) = data.get(start + 2..header_end) else {
        return Ok(None);
    };
    let len: usize = std::str::from_utf8(digits)?
        .parse()
        .context("malformed binary block length")?;
    Ok(Some(header_end + len))
}

/// Payload of an IEEE 488.2 block (`#<n><len><data>` or `#0<data>\n`).
///
/// Anything before the `#` (e.g. an echoed header) is ignored.
pub fn decode_ieee_block(data: &[u8]) -> Result<&[u8], VisaError> {
    let malformed = |why: &str| VisaError::Response {
        command: "binary block".into(),
        response: why.to_string(),
    };
    let start = data
        .iter()
        .position(|&b| b == b'#')
        .ok_or_else(|| malformed("missing '#'"))?;
    let ndigits = *data.get(start + 1).ok_or_else(|| malformed("truncated header"))?;
    if !ndigits.is_ascii_digit() {
        return Err(malformed("non-digit header"));
    }
    let ndigits = (ndigits - b'0') as usize;
    if ndigits == 0 {
        let body = &data[start + 2..];
        return Ok(body.strip_suffix(b"\n").unwrap_or(body));
    }
    let header_end = start + 2 + ndigits;
    let len: usize = data
        .get(start + 2..header_end)
        .and_then(|d| std::str::from_utf8(d).ok())
        .and_then(|d| d.parse().ok())
        .ok_or_else(|| malformed("bad length field"))?;
    data.get(header_end..header_end + len)
        .ok_or_else(|| malformed("truncated payload"))
}

pub fn encode_ieee_block(payload: &[u8]) -> Vec<u8> {
    let len = payload.len().to_string();
    let mut out = format!("#{}{}", len.len(), len).into_bytes();
    out.extend_from_slice(payload);
    out
}
