//! Host serial port transport

use super::{LineSettings, Parity, Transport};
use serialport::{ClearBuffer, DataBits, FlowControl, SerialPort, StopBits};
use std::io::{self, Read, Write};
use std::path::Path;
use std::time::{Duration, Instant};

/// Serial transport backed by the `serialport` crate.
///
/// Constructing it does no I/O; the device is only touched by `open`.
pub struct SerialTransport {
    path: String,
    settings: LineSettings,
    timeout: Duration,
    port: Option<Box<dyn SerialPort>>,
}

impl SerialTransport {
    /// # Arguments
    /// * `path` - Serial port path (e.g., "/dev/ttyAMA0" or "COM3")
    pub fn new(path: impl Into<String>) -> Self {
        SerialTransport {
            path: path.into(),
            settings: LineSettings::MHZ19B,
            timeout: crate::DEFAULT_TIMEOUT,
            port: None,
        }
    }

    /// Wrap a port that is already open
    #[cfg(test)]
    fn with_port(path: &str, port: Box<dyn SerialPort>) -> Self {
        let mut transport = SerialTransport::new(path);
        transport.port = Some(port);
        transport
    }

    fn port(&mut self) -> io::Result<&mut Box<dyn SerialPort>> {
        self.port
            .as_mut()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotConnected, "serial port is not open"))
    }
}

fn data_bits(bits: u8) -> io::Result<DataBits> {
    match bits {
        5 => Ok(DataBits::Five),
        6 => Ok(DataBits::Six),
        7 => Ok(DataBits::Seven),
        8 => Ok(DataBits::Eight),
        _ => Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("unsupported data bits: {}", bits),
        )),
    }
}

fn stop_bits(bits: u8) -> io::Result<StopBits> {
    match bits {
        1 => Ok(StopBits::One),
        2 => Ok(StopBits::Two),
        _ => Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("unsupported stop bits: {}", bits),
        )),
    }
}

fn parity(parity: Parity) -> serialport::Parity {
    match parity {
        Parity::None => serialport::Parity::None,
        Parity::Odd => serialport::Parity::Odd,
        Parity::Even => serialport::Parity::Even,
    }
}

impl Transport for SerialTransport {
    fn open(&mut self) -> io::Result<()> {
        if self.port.is_some() {
            return Ok(());
        }
        let port = serialport::new(&self.path, self.settings.baud_rate)
            .data_bits(data_bits(self.settings.data_bits)?)
            .stop_bits(stop_bits(self.settings.stop_bits)?)
            .parity(parity(self.settings.parity))
            .flow_control(FlowControl::None)
            .timeout(self.timeout)
            .open()?;
        self.port = Some(port);
        Ok(())
    }

    fn close(&mut self) -> io::Result<()> {
        // The descriptor is released when the boxed port drops
        self.port.take();
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.port.is_some()
    }

    fn configure(&mut self, settings: &LineSettings) -> io::Result<()> {
        let port = self.port()?;
        port.set_baud_rate(settings.baud_rate)?;
        port.set_data_bits(data_bits(settings.data_bits)?)?;
        port.set_stop_bits(stop_bits(settings.stop_bits)?)?;
        port.set_parity(parity(settings.parity))?;
        port.set_flow_control(FlowControl::None)?;
        self.settings = *settings;
        Ok(())
    }

    fn set_timeout(&mut self, timeout: Duration) -> io::Result<()> {
        self.timeout = timeout;
        if let Some(port) = self.port.as_mut() {
            port.set_timeout(timeout)?;
        }
        Ok(())
    }

    fn clear_input(&mut self) -> io::Result<()> {
        self.port()?.clear(ClearBuffer::Input)?;
        Ok(())
    }

    fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        let port = self.port()?;
        port.write_all(data)?;
        port.flush()?;
        Ok(data.len())
    }

    fn read(&mut self, buffer: &mut [u8], timeout: Duration) -> io::Result<usize> {
        let configured = self.timeout;
        let port = self.port()?;

        // Each pass waits only for what is left of the overall timeout
        let deadline = Instant::now() + timeout;
        let mut filled = 0;
        let result = loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if filled == buffer.len() || remaining.is_zero() {
                break Ok(filled);
            }
            if let Err(e) = port.set_timeout(remaining) {
                break Err(e.into());
            }
            match port.read(&mut buffer[filled..]) {
                Ok(0) => break Ok(filled),
                Ok(n) => filled += n,
                Err(e) if e.kind() == io::ErrorKind::TimedOut => break Ok(filled),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => break Err(e),
            }
        };

        port.set_timeout(configured)?;
        result
    }

    fn system_port_name(&self) -> String {
        Path::new(&self.path)
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| self.path.clone())
    }
}
