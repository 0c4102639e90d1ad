//! Serial pulse generator used for external triggering.
//!
//! Protocol Overview:
//! - Format: SCPI-style ASCII commands terminated by `\r\n`
//! - Every command is answered with exactly one line, which is discarded
//! - Channel 1 drives the camera trigger, channel 2 the calibration LED
//!
//! Commands sent while no link is open are logged as warnings and otherwise
//! ignored, so calibration sequences can run against a simulated camera.

use crate::config::PulseGeneratorSettings;
use crate::error::PeripheralError;
use log::{debug, info, warn};
use std::io;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::time::timeout;

#[cfg(feature = "tokio_serial")]
use tokio_serial::SerialPortBuilderExt;

/// Byte stream a pulse generator can be driven over.
pub trait PulseLink: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> PulseLink for T {}

/// Rate configured right after connecting.
pub const DEFAULT_RATE_HZ: u32 = 10;

const INIT_SEQUENCE: &[&str] = &[
    ":SPUL:TRIG:MOD DIS",
    ":SPUL:MOD NORM",
    ":PULS1:OUTP:AMPL 4.0",
    ":PULS1:WIDT 2e-7",
    ":PULS2:OUTP:AMPL 3.0",
    ":PULS2:WIDT 2e-5",
    ":PULS3:STAT OFF",
    ":PULS4:STAT OFF",
];

const PEDESTAL_SEQUENCE: &[&str] = &[
    "*IDN?",
    ":SPUL:TRIG:MOD DIS",
    ":SPUL:MOD NORM",
    ":PULS1:OUTP:AMPL 4.0",
    ":PULS1:WIDT 2e-7",
    ":PULS1:DEL 0",
    ":PULS1:STAT ON",
    ":PULS2:STAT OFF",
    ":PULS3:STAT OFF",
    ":PULS4:STAT OFF",
];

const TRANSFER_FUNCTION_SEQUENCE: &[&str] = &[":PULS1:DEL 0", ":PULS1:STAT ON", ":PULS2:STAT OFF"];

/// Pulse generator driver.
pub struct PulseGenerator {
    link: Option<BufReader<Box<dyn PulseLink>>>,
    timeout: Duration,
    active: bool,
    rate: Option<u32>,
}

impl PulseGenerator {
    /// Unconnected driver with a per-command reply timeout.
    pub fn new(timeout: Duration) -> Self {
        Self {
            link: None,
            timeout,
            active: false,
            rate: None,
        }
    }

    /// Unconnected driver configured from settings.
    pub fn from_settings(settings: &PulseGeneratorSettings) -> Self {
        Self::new(settings.timeout)
    }

    /// Whether a serial link is open.
    pub fn is_connected(&self) -> bool {
        self.link.is_some()
    }

    /// Whether output was last switched on.
    pub fn is_active(&self) -> bool {
        self.active
    }

    /// Last requested rate in hertz.
    pub fn rate(&self) -> Option<u32> {
        self.rate
    }

    /// Open the serial port and run the initialisation sequence.
    #[cfg(feature = "tokio_serial")]
    pub async fn connect(&mut self, port: &str, baud_rate: u32) -> Result<(), PeripheralError> {
        info!("Connecting to pulse generator on {} at {} baud", port, baud_rate);
        let stream = tokio_serial::new(port, baud_rate)
            .data_bits(tokio_serial::DataBits::Eight)
            .parity(tokio_serial::Parity::None)
            .stop_bits(tokio_serial::StopBits::One)
            .flow_control(tokio_serial::FlowControl::None)
            .open_native_async()
            .map_err(|e| PeripheralError::Connection {
                port: port.to_string(),
                baud_rate,
                reason: e.to_string(),
            })?;
        self.attach(stream).await
    }

    /// Serial support is compiled out.
    #[cfg(not(feature = "tokio_serial"))]
    pub async fn connect(&mut self, _port: &str, _baud_rate: u32) -> Result<(), PeripheralError> {
        Err(PeripheralError::FeatureNotEnabled("tokio_serial".to_string()))
    }

    /// Adopt an open link and run the initialisation sequence.
    pub async fn attach<L: PulseLink + 'static>(&mut self, link: L) -> Result<(), PeripheralError> {
        let link: Box<dyn PulseLink> = Box::new(link);
        self.link = Some(BufReader::new(link));
        if let Err(e) = self.initialise().await {
            self.link = None;
            return Err(e);
        }
        info!("Pulse generator ready");
        Ok(())
    }

    async fn initialise(&mut self) -> Result<(), PeripheralError> {
        for command in INIT_SEQUENCE {
            self.send(command).await?;
        }
        self.set_rate(DEFAULT_RATE_HZ).await?;
        self.deactivate().await
    }

    /// Switch pulse output on.
    pub async fn activate(&mut self) -> Result<(), PeripheralError> {
        info!("Activating pulse generator");
        self.send_if_connected(":SPUL:STAT ON").await?;
        self.active = true;
        Ok(())
    }

    /// Switch pulse output off.
    pub async fn deactivate(&mut self) -> Result<(), PeripheralError> {
        info!("Deactivating pulse generator");
        self.send_if_connected(":SPUL:STAT OFF").await?;
        self.active = false;
        Ok(())
    }

    /// Set the pulse period from a rate in hertz.
    pub async fn set_rate(&mut self, hz: u32) -> Result<(), PeripheralError> {
        if hz == 0 {
            warn!("Ignoring pulse generator rate of 0 Hz");
            return Ok(());
        }
        info!("Setting pulse generator rate to {} Hz", hz);
        let period = 1.0 / f64::from(hz);
        self.send_if_connected(&format!(":SPUL:PER {:.6}", period)).await?;
        self.rate = Some(hz);
        Ok(())
    }

    /// Channel configuration for pedestal runs.
    pub async fn setup_pedestal(&mut self) -> Result<(), PeripheralError> {
        info!("Setting up pulse generator for pedestal");
        self.send_sequence(PEDESTAL_SEQUENCE).await
    }

    /// Channel configuration for transfer function runs.
    pub async fn setup_transfer_function(&mut self) -> Result<(), PeripheralError> {
        info!("Setting up pulse generator for transfer function");
        self.send_sequence(TRANSFER_FUNCTION_SEQUENCE).await
    }

    async fn send_sequence(&mut self, commands: &[&str]) -> Result<(), PeripheralError> {
        if !self.is_connected() {
            warn!("Pulse generator is not connected");
            return Ok(());
        }
        for command in commands {
            self.send(command).await?;
        }
        Ok(())
    }

    async fn send_if_connected(&mut self, command: &str) -> Result<(), PeripheralError> {
        if self.is_connected() {
            self.send(command).await
        } else {
            warn!("Pulse generator is not connected, '{}' not sent", command);
            Ok(())
        }
    }

    async fn send(&mut self, command: &str) -> Result<(), PeripheralError> {
        let link = self.link.as_mut().ok_or_else(|| {
            PeripheralError::Io(io::Error::new(io::ErrorKind::NotConnected, "no serial link"))
        })?;

        link.write_all(format!("{}\r\n", command).as_bytes()).await?;
        link.flush().await?;

        let mut reply = String::new();
        match timeout(self.timeout, link.read_line(&mut reply)).await {
            Err(_) => Err(PeripheralError::Timeout {
                command: command.to_string(),
                after: self.timeout,
            }),
            Ok(Err(e)) => Err(e.into()),
            Ok(Ok(0)) => Err(PeripheralError::Io(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "pulse generator closed the link",
            ))),
            Ok(Ok(_)) => {
                debug!("{} -> {}", command, reply.trim_end());
                Ok(())
            }
        }
    }
}
