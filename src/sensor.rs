//! Serial interface to the VPF-730 sensor
//!
//! The sensor speaks 1200 baud 8N1 by default. The port is opened for each
//! read and closed again when the read completes, so a flaky USB adapter
//! never wedges the daemon between cadence points.

use crate::measurement::Measurement;
use anyhow::{Context, Result};
use serialport::{DataBits, Parity, StopBits};
use std::io::{self, BufRead, BufReader, Write};
use std::time::Duration;

/// Serial connection parameters for a VPF-730 sensor
#[derive(Debug, Clone)]
pub struct Vpf730 {
    /// Serial port the sensor is connected to, e.g. /dev/ttyS0
    pub port: String,
    /// Baud rate, 1200 from the factory
    pub baud_rate: u32,
    /// Read timeout; an expired timeout yields no measurement
    pub timeout: Duration,
}

impl Vpf730 {
    pub fn new(port: impl Into<String>) -> Vpf730 {
        Vpf730 {
            port: port.into(),
            baud_rate: 1200,
            timeout: Duration::from_secs(3),
        }
    }

    /// Read one measurement from the sensor.
    ///
    /// In polled mode (`OSAM0` on the sensor) a `D?` command is written
    /// first; in unpolled mode the next spontaneously transmitted frame is
    /// read. A read timeout returns `Ok(None)`; a frame that violates the
    /// grammar is an error.
    pub fn measure(&self, polled_mode: bool) -> Result<Option<Measurement>> {
        let mut port = serialport::new(&self.port, self.baud_rate)
            .data_bits(DataBits::Eight)
            .parity(Parity::None)
            .stop_bits(StopBits::One)
            .timeout(self.timeout)
            .open()
            .with_context(|| format!("failed to open serial port {}", self.port))?;

        if polled_mode {
            port.write_all(b"D?\r\n")
                .context("failed to send poll command")?;
        }

        let mut reader = BufReader::new(port);
        let mut frame = Vec::new();
        match reader.read_until(b'\n', &mut frame) {
            Ok(_) => {}
            // nothing transmitted within the timeout
            Err(err) if err.kind() == io::ErrorKind::TimedOut => {}
            Err(err) => return Err(err).context("failed to read from sensor"),
        }

        if frame.is_empty() {
            tracing::debug!(port = %self.port, "sensor read returned no data");
            return Ok(None);
        }
        let measurement = Measurement::from_frame(&frame)?;
        Ok(Some(measurement))
    }
}
