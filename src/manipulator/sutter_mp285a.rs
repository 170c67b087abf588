//! Sutter Instrument MP-285A motorized micro-manipulator controller.
//!
//! Binary serial protocol at 9600 baud, 8N1. Every command ends with a
//! carriage return and "set" commands are acknowledged by a lone CR.

use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use async_trait::async_trait;
use regex::Regex;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio_serial::{DataBits, Parity, SerialPortBuilderExt, SerialPortType, SerialStream, StopBits};
use tracing::{debug, info, warn};

use super::{pos_str, Manipulator};
use crate::config::SutterSettings;
use crate::error::SutterError;
use crate::si::is_within;

pub const NAME: &str = "SutterMP285A";
pub const INTERCOMMAND_DELAY: Duration = Duration::from_millis(2);
pub const CR: u8 = b'\r';
/// Encoded XYZ position length (bytes).
pub const XYZ_LEN: usize = 12;
/// Coordinate bounds (um).
pub const XYZ_BOUNDS: (f64, f64) = (-12500.0, 12500.0);
/// Summed absolute deviation tolerated on arrival (um).
pub const XYZ_TOL: f64 = 0.5;
/// Fraction of the timeout a move may take after a speed-up.
pub const TREL_MAX: f64 = 0.7;
/// Move duration, relative to the estimate, above which a warning is logged.
pub const TREL_WARN: f64 = 1.8;
pub const LOW_RES_SPEED_BOUNDS: (u16, u16) = (0, 3000);
pub const HIGH_RES_SPEED_BOUNDS: (u16, u16) = (0, 1310);
pub const STATUS_LEN: usize = 32;
const BIT15: u16 = 1 << 15;

/// Motion resolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    Low,
    High,
}

impl Resolution {
    pub fn speed_bounds(self) -> (u16, u16) {
        match self {
            Resolution::Low => LOW_RES_SPEED_BOUNDS,
            Resolution::High => HIGH_RES_SPEED_BOUNDS,
        }
    }
}

impl std::fmt::Display for Resolution {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Resolution::Low => write!(f, "low-resolution"),
            Resolution::High => write!(f, "high-resolution"),
        }
    }
}

/// Program flags (`FLAGS` byte).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Flags {
    /// Currently loaded setup number.
    pub setup: u8,
    pub roe_dir: bool,
    /// Display origin.
    pub rel_abs: bool,
    /// Manual mode.
    pub mode: bool,
    /// Setup condition.
    pub store: bool,
}

impl From<u8> for Flags {
    fn from(b: u8) -> Self {
        Self {
            setup: b & 0x0F,
            roe_dir: b & (1 << 4) != 0,
            rel_abs: b & (1 << 5) != 0,
            mode: b & (1 << 6) != 0,
            store: b & (1 << 7) != 0,
        }
    }
}

/// Program flags (`FLAGS_2` byte).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Flags2 {
    pub loop_mode: bool,
    pub learn_mode: bool,
    /// Movement resolution.
    pub step_mode: bool,
    /// Joystick side button enabled.
    pub sw2_mode: bool,
    /// FSR/joystick enabled.
    pub sw1_mode: bool,
    /// ROE switch enabled.
    pub sw3_mode: bool,
    pub sw4_mode: bool,
    pub reverse_it: bool,
}

impl From<u8> for Flags2 {
    fn from(b: u8) -> Self {
        let bit = |i: u8| b & (1 << i) != 0;
        Self {
            loop_mode: bit(0),
            learn_mode: bit(1),
            step_mode: bit(2),
            sw2_mode: bit(3),
            sw1_mode: bit(4),
            sw3_mode: bit(5),
            sw4_mode: bit(6),
            reverse_it: bit(7),
        }
    }
}

/// Decoded 32-byte status block.
#[derive(Debug, Clone, PartialEq)]
pub struct SutterStatus {
    pub flags: Flags,
    pub udirx: u8,
    pub udiry: u8,
    pub udirz: u8,
    /// u-steps per ROE click.
    pub roe_vari: u16,
    pub uoffset: u16,
    pub urange: u16,
    /// u-steps per pulse.
    pub pulse: u16,
    /// Adjusted pulse speed (u-steps/s).
    pub uspeed: u16,
    pub indevice: u8,
    pub flags2: Flags2,
    pub jumpspd: u16,
    pub highspd: u16,
    pub dead: u16,
    pub watch_dog: u16,
    /// um per u-step.
    pub step_div: f64,
    /// u-steps per um.
    pub usteps_per_um: f64,
    /// Remote travel speed (um/s).
    pub speed: u16,
    pub resolution: Resolution,
    pub version: f64,
}

impl SutterStatus {
    pub fn decode(block: &[u8]) -> Result<Self, SutterError> {
        if block.len() != STATUS_LEN {
            return Err(SutterError::Malformed(format!(
                "expected {STATUS_LEN}-bytes long status, got {} bytes",
                block.len()
            )));
        }
        let u16_at = |i: usize| u16::from_le_bytes([block[i], block[i + 1]]);
        let step_mul = u16_at(26);
        if step_mul == 0 {
            return Err(SutterError::Malformed("null step multiplier".into()));
        }
        let xspeed = u16_at(28);
        Ok(Self {
            flags: Flags::from(block[0]),
            udirx: block[1],
            udiry: block[2],
            udirz: block[3],
            roe_vari: u16_at(4),
            uoffset: u16_at(6),
            urange: u16_at(8),
            pulse: u16_at(10),
            uspeed: u16_at(12),
            indevice: block[14],
            flags2: Flags2::from(block[15]),
            jumpspd: u16_at(16),
            highspd: u16_at(18),
            dead: u16_at(20),
            watch_dog: u16_at(22),
            step_div: f64::from(u16_at(24)) / 10000.0,
            usteps_per_um: 10000.0 / f64::from(step_mul),
            speed: xspeed & !BIT15,
            resolution: if xspeed & BIT15 != 0 {
                Resolution::High
            } else {
                Resolution::Low
            },
            version: f64::from(u16_at(30)) / 100.0,
        })
    }
}

impl std::fmt::Display for SutterStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "status data:")?;
        writeln!(f, "  - flags: {:?}", self.flags)?;
        writeln!(f, "  - flags2: {:?}", self.flags2)?;
        writeln!(f, "  - u-steps/um: {}", self.usteps_per_um)?;
        writeln!(f, "  - step div: {}", self.step_div)?;
        writeln!(f, "  - speed: {} um/s ({})", self.speed, self.resolution)?;
        write!(f, "  - version: {}", self.version)
    }
}

/// `m` command moving to `pos` (um).
pub fn encode_position(pos: &[f64; 3], usteps_per_um: f64) -> Vec<u8> {
    let mut out = vec![b'm'];
    for x in pos {
        out.extend(((x * usteps_per_um) as i32).to_le_bytes());
    }
    out
}

/// Position (um) from the 12 bytes of a `c` reply.
pub fn decode_position(data: &[u8], usteps_per_um: f64) -> Result<[f64; 3], SutterError> {
    if data.len() != XYZ_LEN {
        return Err(SutterError::Malformed(format!(
            "expected {XYZ_LEN}-bytes long position, got {} bytes",
            data.len()
        )));
    }
    let mut pos = [0.0; 3];
    for (p, chunk) in pos.iter_mut().zip(data.chunks_exact(4)) {
        let usteps = i32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
        *p = f64::from(usteps) / usteps_per_um;
    }
    Ok(pos)
}

/// `V` command setting speed (um/s) and resolution.
pub fn encode_velocity(v: u16, res: Resolution) -> Vec<u8> {
    let word = match res {
        Resolution::Low => v & !BIT15,
        Resolution::High => v | BIT15,
    };
    let mut out = vec![b'V'];
    out.extend(word.to_le_bytes());
    out
}

fn printable(cmd: &[u8]) -> String {
    match cmd.first() {
        Some(&c) if cmd.len() == 1 => char::from(c).to_string(),
        Some(&c) => format!("{}<{} bytes>", char::from(c), cmd.len() - 1),
        None => String::new(),
    }
}

/// Serial port of the controller: `settings.port` if set, otherwise the
/// first USB port whose serial number matches `settings.usb_id`.
pub fn find_port(settings: &SutterSettings) -> Result<String> {
    if let Some(port) = &settings.port {
        return Ok(port.clone());
    }
    let id = Regex::new(&settings.usb_id).context("invalid Sutter USB id pattern")?;
    let ports = tokio_serial::available_ports().context("failed to list serial ports")?;
    ports
        .into_iter()
        .find(|p| match &p.port_type {
            SerialPortType::UsbPort(usb) => usb
                .serial_number
                .as_deref()
                .is_some_and(|sn| id.is_match(sn)),
            _ => false,
        })
        .map(|p| p.port_name)
        .ok_or_else(|| SutterError::PortNotFound(settings.usb_id.clone()).into())
}

pub struct SutterMp285a<S = SerialStream> {
    port: S,
    name: String,
    timeout: Duration,
    status: SutterStatus,
}

impl SutterMp285a<SerialStream> {
    /// Open the controller's serial port and initialize it.
    pub async fn connect(settings: &SutterSettings) -> Result<Self> {
        let port_name = find_port(settings)?;
        let stream = tokio_serial::new(&port_name, settings.baud_rate)
            .data_bits(DataBits::Eight)
            .parity(Parity::None)
            .stop_bits(StopBits::One)
            .open_native_async()
            .map_err(|e| {
                anyhow::Error::new(SutterError::PortNotFound(port_name.clone()))
                    .context(format!("no connection to {NAME} could be established: {e}"))
            })?;
        Self::with_port(stream, &port_name, settings.timeout()).await
    }
}

impl<S> SutterMp285a<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    /// Initialize a controller reachable through `port`: absolute mode,
    /// high resolution at maximal speed.
    pub async fn with_port(port: S, name: &str, timeout: Duration) -> Result<Self> {
        let mut me = Self {
            port,
            name: name.to_string(),
            timeout,
            // Placeholder until the first status read below.
            status: SutterStatus::decode(&default_status_block())?,
        };
        info!("{:-^80}", format!(" {NAME}({name}) "));
        me.set_absolute_mode().await?;
        me.update_status().await?;
        me.set_resolution(Resolution::High).await?;
        me.set_velocity(HIGH_RES_SPEED_BOUNDS.1).await?;
        Ok(me)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn set_timeout(&mut self, timeout: Duration) {
        self.timeout = timeout;
    }

    pub fn status(&self) -> &SutterStatus {
        &self.status
    }

    pub fn usteps_per_um(&self) -> f64 {
        self.status.usteps_per_um
    }

    async fn write(&mut self, cmd: &[u8]) -> Result<()> {
        debug!("WRITE: {}", printable(cmd));
        let mut message = cmd.to_vec();
        message.push(CR);
        self.port
            .write_all(&message)
            .await
            .with_context(|| format!("failed to send {:?}", printable(cmd)))?;
        self.port.flush().await?;
        tokio::time::sleep(INTERCOMMAND_DELAY).await;
        Ok(())
    }

    async fn read_exact(&mut self, n: usize) -> Result<Vec<u8>> {
        let mut buf = vec![0u8; n];
        tokio::time::timeout(self.timeout, self.port.read_exact(&mut buf))
            .await
            .map_err(|_| SutterError::Timeout(n))?
            .context("serial read failed")?;
        Ok(buf)
    }

    /// Read an `n`-byte payload followed by CR.
    async fn read_terminated(&mut self, n: usize) -> Result<Vec<u8>> {
        let mut data = self.read_exact(n + 1).await?;
        if data.pop() != Some(CR) {
            return Err(SutterError::Malformed(format!(
                "{n}-bytes long reply not terminated by CR"
            ))
            .into());
        }
        Ok(data)
    }

    /// Send a "set" command and wait for its acknowledgement.
    async fn write_and_check(&mut self, cmd: &[u8]) -> Result<()> {
        let start = Instant::now();
        self.write(cmd).await?;
        let out = self.read_exact(1).await.map_err(|e| {
            e.context(format!(
                "command {} did not complete before timeout ({:?})",
                printable(cmd),
                self.timeout
            ))
        })?;
        if out != [CR] {
            return Err(SutterError::NotAcknowledged {
                command: printable(cmd),
                received: out,
            }
            .into());
        }
        debug!("completed in {:.2} s", start.elapsed().as_secs_f64());
        Ok(())
    }

    pub async fn get_status(&mut self) -> Result<SutterStatus> {
        self.write(b"s").await?;
        let block = self.read_terminated(STATUS_LEN).await?;
        let status = SutterStatus::decode(&block)?;
        debug!("{status}");
        Ok(status)
    }

    pub async fn update_status(&mut self) -> Result<()> {
        self.status = self.get_status().await?;
        Ok(())
    }

    pub async fn position(&mut self) -> Result<[f64; 3]> {
        self.write(b"c").await?;
        let data = self.read_terminated(XYZ_LEN).await?;
        let pos = decode_position(&data, self.usteps_per_um())?;
        debug!("stage position: {}", pos_str(&pos));
        Ok(pos)
    }

    fn check_coordinates(pos: &[f64; 3]) -> Result<(), SutterError> {
        for (axis, v) in ["X", "Y", "Z"].iter().zip(pos) {
            if !is_within(*v, XYZ_BOUNDS) {
                return Err(SutterError::OutOfRange(format!(
                    "target {axis} coordinate {v:.3} um is out of bounds {XYZ_BOUNDS:?}"
                )));
            }
        }
        Ok(())
    }

    /// Move the three axes to `pos` (um).
    ///
    /// When the current speed would not cover the distance within the
    /// timeout, speed is raised for the move and restored afterwards.
    pub async fn set_position(&mut self, pos: [f64; 3]) -> Result<()> {
        Self::check_coordinates(&pos)?;
        let current = self.position().await?;
        let delta = [pos[0] - current[0], pos[1] - current[1], pos[2] - current[2]];
        let dtot = delta.iter().map(|d| d * d).sum::<f64>().sqrt();
        if dtot == 0.0 {
            warn!("already at position!");
            return Ok(());
        }
        let v = self.velocity();
        let tmove_est = dtot / f64::from(v);
        let timeout = self.timeout.as_secs_f64();
        let mut vreq = None;
        if tmove_est > timeout {
            let required = (dtot / (TREL_MAX * timeout)).round() as u16;
            warn!(
                "increasing velocity temporarily to {required} um/s to cover {dtot:.2} um within {:.0} % of {timeout} s timeout",
                TREL_MAX * 1e2
            );
            self.set_velocity(required).await?;
            vreq = Some(required);
        }
        info!("moving to position: {} (delta = {})", pos_str(&pos), pos_str(&delta));
        let cmd = encode_position(&pos, self.usteps_per_um());
        let start = Instant::now();
        self.write_and_check(&cmd).await?;
        let tmove = start.elapsed().as_secs_f64();
        let reached = self.position().await?;
        let error: f64 = pos.iter().zip(&reached).map(|(a, b)| (a - b).abs()).sum();
        if error > XYZ_TOL {
            return Err(SutterError::TargetMissed {
                target: pos,
                actual: reached,
            }
            .into());
        }
        if tmove > (TREL_WARN * tmove_est).max(50e-3) {
            warn!(
                "{} move took {:.3} ms ({:.2} times expected time)",
                pos_str(&delta),
                tmove * 1e3,
                tmove / tmove_est
            );
        }
        if vreq.is_some() {
            warn!("resetting velocity to {v} um/s");
            self.set_velocity(v).await?;
        }
        Ok(())
    }

    pub async fn translate(&mut self, delta: [f64; 3]) -> Result<()> {
        let pos = self.position().await?;
        self.set_position([pos[0] + delta[0], pos[1] + delta[1], pos[2] + delta[2]])
            .await
    }

    pub async fn move_to_origin(&mut self) -> Result<()> {
        self.set_position([0.0; 3]).await?;
        info!("moved to origin!");
        Ok(())
    }

    /// Last known travel speed (um/s).
    pub fn velocity(&self) -> u16 {
        self.status.speed
    }

    pub fn resolution(&self) -> Resolution {
        self.status.resolution
    }

    async fn send_velocity(&mut self, v: u16, res: Resolution) -> Result<()> {
        self.write_and_check(&encode_velocity(v, res)).await?;
        self.update_status().await
    }

    pub async fn set_velocity(&mut self, v: u16) -> Result<()> {
        let res = self.resolution();
        let bounds = res.speed_bounds();
        if v < bounds.0 || v > bounds.1 {
            return Err(SutterError::OutOfRange(format!(
                "velocity value ({v} um/s) is out of {res} bounds ({bounds:?} um/s)"
            ))
            .into());
        }
        info!("setting velocity to {v} um/s");
        self.send_velocity(v, res).await?;
        let vout = self.velocity();
        if vout != v {
            return Err(SutterError::Malformed(format!(
                "could not set motion speed to {v} um/s (value = {vout} um/s)"
            ))
            .into());
        }
        Ok(())
    }

    pub async fn set_resolution(&mut self, res: Resolution) -> Result<()> {
        info!("setting motion mode to {res}");
        self.send_velocity(self.velocity(), res).await?;
        let out = self.resolution();
        if out != res {
            return Err(SutterError::Malformed(format!(
                "could not set motion mode to {res} (value = {out})"
            ))
            .into());
        }
        Ok(())
    }

    /// Refresh the XYZ readout of the front panel.
    pub async fn refresh_panel(&mut self) -> Result<()> {
        self.write_and_check(b"n").await
    }

    /// Make the current position the origin.
    pub async fn set_origin(&mut self) -> Result<()> {
        self.write_and_check(b"o").await?;
        info!("origin reset!");
        Ok(())
    }

    /// The controller does not acknowledge resets.
    pub async fn reset(&mut self) -> Result<()> {
        self.write(b"r").await
    }

    pub async fn set_absolute_mode(&mut self) -> Result<()> {
        info!("setting absolute movement mode");
        self.write_and_check(b"a").await
    }

    pub async fn set_relative_mode(&mut self) -> Result<()> {
        info!("setting relative movement mode");
        self.write_and_check(b"b").await
    }

    pub async fn disconnect(&mut self) -> Result<()> {
        info!("disconnecting from {NAME}({})", self.name);
        self.port.shutdown().await?;
        Ok(())
    }
}

/// Zeroed status with a unit step multiplier.
fn default_status_block() -> [u8; STATUS_LEN] {
    let mut block = [0u8; STATUS_LEN];
    block[26..28].copy_from_slice(&10000u16.to_le_bytes());
    block
}

#[async_trait]
impl<S> Manipulator for SutterMp285a<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    async fn position(&mut self) -> Result<[f64; 3]> {
        SutterMp285a::position(self).await
    }

    async fn set_position(&mut self, pos: [f64; 3]) -> Result<()> {
        SutterMp285a::set_position(self, pos).await
    }

    async fn translate(&mut self, delta: [f64; 3]) -> Result<()> {
        SutterMp285a::translate(self, delta).await
    }

    async fn move_to_origin(&mut self) -> Result<()> {
        SutterMp285a::move_to_origin(self).await
    }

    fn velocity(&self) -> u16 {
        SutterMp285a::velocity(self)
    }

    async fn set_velocity(&mut self, v: u16) -> Result<()> {
        SutterMp285a::set_velocity(self, v).await
    }

    async fn disconnect(&mut self) -> Result<()> {
        SutterMp285a::disconnect(self).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};
    use tokio::io::{DuplexStream, ReadHalf, WriteHalf};

    /// u-steps per um of the simulated controller (STEP_MUL = 400).
    const USTEPS: f64 = 25.0;

    #[derive(Debug, Default)]
    struct Controller {
        pos: [i32; 3],
        xspeed: u16,
        commands: Vec<u8>,
        /// Positions are reached with this offset (u-steps).
        drift: i32,
    }

    impl Controller {
        fn status_block(&self) -> Vec<u8> {
            let mut block = vec![0u8; STATUS_LEN];
            block[0] = 0b0010_0011;
            block[15] = 0b0000_0101;
            block[24..26].copy_from_slice(&400u16.to_le_bytes());
            block[26..28].copy_from_slice(&400u16.to_le_bytes());
            block[28..30].copy_from_slice(&self.xspeed.to_le_bytes());
            block[30..32].copy_from_slice(&312u16.to_le_bytes());
            block
        }
    }

    async fn expect_cr(rx: &mut ReadHalf<DuplexStream>) {
        assert_eq!(rx.read_u8().await.unwrap(), CR);
    }

    /// Answer protocol commands until the driver side is dropped.
    async fn serve(
        mut rx: ReadHalf<DuplexStream>,
        mut tx: WriteHalf<DuplexStream>,
        state: Arc<Mutex<Controller>>,
    ) {
        while let Ok(cmd) = rx.read_u8().await {
            state.lock().unwrap().commands.push(cmd);
            let reply = match cmd {
                b'a' | b'b' | b'n' | b'o' => {
                    expect_cr(&mut rx).await;
                    vec![CR]
                }
                b'r' => {
                    expect_cr(&mut rx).await;
                    vec![]
                }
                b's' => {
                    expect_cr(&mut rx).await;
                    let mut out = state.lock().unwrap().status_block();
                    out.push(CR);
                    out
                }
                b'c' => {
                    expect_cr(&mut rx).await;
                    let pos = state.lock().unwrap().pos;
                    let mut out: Vec<u8> = pos.iter().flat_map(|p| p.to_le_bytes()).collect();
                    out.push(CR);
                    out
                }
                b'm' => {
                    let mut buf = [0u8; XYZ_LEN];
                    rx.read_exact(&mut buf).await.unwrap();
                    expect_cr(&mut rx).await;
                    let mut s = state.lock().unwrap();
                    for (i, chunk) in buf.chunks_exact(4).enumerate() {
                        s.pos[i] = i32::from_le_bytes(chunk.try_into().unwrap()) + s.drift;
                    }
                    vec![CR]
                }
                b'V' => {
                    let word = rx.read_u16_le().await.unwrap();
                    expect_cr(&mut rx).await;
                    state.lock().unwrap().xspeed = word;
                    vec![CR]
                }
                other => panic!("unexpected command byte {other:#x}"),
            };
            if tx.write_all(&reply).await.is_err() {
                break;
            }
        }
    }

    async fn connected(timeout: Duration) -> (SutterMp285a<DuplexStream>, Arc<Mutex<Controller>>) {
        let (driver_end, controller_end) = tokio::io::duplex(1024);
        let state = Arc::new(Mutex::new(Controller {
            xspeed: 2000,
            ..Default::default()
        }));
        let (rx, tx) = tokio::io::split(controller_end);
        tokio::spawn(serve(rx, tx, state.clone()));
        let sutter = SutterMp285a::with_port(driver_end, "duplex", timeout)
            .await
            .unwrap();
        (sutter, state)
    }

    #[test]
    fn status_block_is_decoded() {
        let ctrl = Controller {
            xspeed: 1310 | BIT15,
            ..Default::default()
        };
        let status = SutterStatus::decode(&ctrl.status_block()).unwrap();
        assert_eq!(status.flags.setup, 3);
        assert!(status.flags.rel_abs);
        assert!(!status.flags.store);
        assert!(status.flags2.loop_mode && status.flags2.step_mode);
        assert!(!status.flags2.learn_mode);
        assert_eq!(status.usteps_per_um, USTEPS);
        assert_eq!(status.step_div, 0.04);
        assert_eq!(status.speed, 1310);
        assert_eq!(status.resolution, Resolution::High);
        assert_eq!(status.version, 3.12);
        assert!(SutterStatus::decode(&[0u8; 31]).is_err());
    }

    #[test]
    fn position_and_velocity_words() {
        let cmd = encode_position(&[1.0, -2.0, 0.5], USTEPS);
        assert_eq!(cmd[0], b'm');
        assert_eq!(&cmd[1..5], &25i32.to_le_bytes());
        assert_eq!(&cmd[5..9], &(-50i32).to_le_bytes());
        // u-steps are truncated
        assert_eq!(decode_position(&cmd[1..], USTEPS).unwrap(), [1.0, -2.0, 0.48]);
        assert!(decode_position(&cmd[1..12], USTEPS).is_err());

        assert_eq!(encode_velocity(1000, Resolution::High), vec![b'V', 0xE8, 0x83]);
        assert_eq!(encode_velocity(1000, Resolution::Low), vec![b'V', 0xE8, 0x03]);
    }

    #[tokio::test]
    async fn connect_sets_absolute_high_resolution_max_speed() {
        let (sutter, state) = connected(Duration::from_secs(2)).await;
        assert_eq!(sutter.resolution(), Resolution::High);
        assert_eq!(sutter.velocity(), HIGH_RES_SPEED_BOUNDS.1);
        assert_eq!(state.lock().unwrap().commands, b"asVsVs".to_vec());
    }

    #[tokio::test]
    async fn moves_and_translates() {
        let (mut sutter, state) = connected(Duration::from_secs(2)).await;
        sutter.set_position([100.0, -40.0, 8.0]).await.unwrap();
        assert_eq!(state.lock().unwrap().pos, [2500, -1000, 200]);
        sutter.translate([-100.0, 40.0, 0.0]).await.unwrap();
        assert_eq!(sutter.position().await.unwrap(), [0.0, 0.0, 8.0]);
        sutter.move_to_origin().await.unwrap();
        assert_eq!(state.lock().unwrap().pos, [0, 0, 0]);
    }

    #[tokio::test]
    async fn move_to_current_position_is_a_no_op() {
        let (mut sutter, state) = connected(Duration::from_secs(2)).await;
        let before = state.lock().unwrap().commands.len();
        sutter.move_to_origin().await.unwrap();
        assert_eq!(&state.lock().unwrap().commands[before..], b"c");
    }

    #[tokio::test]
    async fn out_of_bounds_targets_are_refused() {
        let (mut sutter, _state) = connected(Duration::from_secs(2)).await;
        let err = sutter.set_position([0.0, 13000.0, 0.0]).await.unwrap_err();
        assert!(matches!(
            err.downcast_ref::<SutterError>(),
            Some(SutterError::OutOfRange(_))
        ));
    }

    #[tokio::test]
    async fn missed_target_is_reported() {
        let (mut sutter, state) = connected(Duration::from_secs(2)).await;
        state.lock().unwrap().drift = 25;
        let err = sutter.set_position([10.0, 0.0, 0.0]).await.unwrap_err();
        assert!(matches!(
            err.downcast_ref::<SutterError>(),
            Some(SutterError::TargetMissed { .. })
        ));
    }

    #[tokio::test]
    async fn long_moves_raise_speed_temporarily() {
        let (mut sutter, state) = connected(Duration::from_millis(500)).await;
        sutter.set_resolution(Resolution::Low).await.unwrap();
        sutter.set_velocity(1000).await.unwrap();
        let before = state.lock().unwrap().commands.len();
        sutter.set_position([1000.0, 0.0, 0.0]).await.unwrap();
        // 1000 um within 0.7 * 0.5 s needs 2857 um/s
        let speed_ups: Vec<u8> = state.lock().unwrap().commands[before..]
            .iter()
            .copied()
            .filter(|&c| c == b'V')
            .collect();
        assert_eq!(speed_ups.len(), 2);
        assert_eq!(state.lock().unwrap().xspeed, 1000);
        assert_eq!(sutter.velocity(), 1000);
        assert_eq!(sutter.position().await.unwrap(), [1000.0, 0.0, 0.0]);
    }

    #[tokio::test]
    async fn velocity_is_bounded_by_resolution() {
        let (mut sutter, _state) = connected(Duration::from_secs(2)).await;
        assert!(sutter.set_velocity(2000).await.is_err());
        sutter.set_resolution(Resolution::Low).await.unwrap();
        sutter.set_velocity(2000).await.unwrap();
        assert_eq!(sutter.velocity(), 2000);
        assert_eq!(sutter.resolution(), Resolution::Low);
    }

    #[tokio::test]
    async fn unacknowledged_commands_time_out() {
        let (driver_end, _controller_end) = tokio::io::duplex(64);
        let err = SutterMp285a::with_port(driver_end, "mute", Duration::from_millis(50))
            .await
            .err()
            .unwrap();
        assert!(matches!(
            err.downcast_ref::<SutterError>(),
            Some(SutterError::Timeout(1))
        ));
    }
}
