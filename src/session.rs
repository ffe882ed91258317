use crate::error::{Error, Result};
use crate::frame::{self, Command, Frame, Hex, Response, FRAME_LEN};
use crate::transport::{LineSettings, Transport};
use std::io;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

/// The concentration query is retried this many times while probing
const PROBE_ATTEMPTS: usize = 3;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn nanos(timeout: Duration) -> u64 {
    timeout.as_nanos().min(u128::from(u64::MAX)) as u64
}

/// A sensor attached to one port.
///
/// Sessions are handed out by a [`Registry`](crate::Registry), one per port
/// identifier, and shared as `Arc<Session<T>>`. `open` and `close` are
/// idempotent: the first `open` opens the transport, the first `close` after
/// it closes the transport, every other call is a no-op.
///
/// Each command is a blocking write-then-read exchange. Exchanges are
/// serialised on the transport, but interleaving commands from several callers
/// is still the callers' business: one logical user should issue commands at a
/// time.
pub struct Session<T> {
    port: String,
    transport: Mutex<T>,
    transport_open: AtomicBool,
    timeout_ns: AtomicU64,
    use_count: AtomicUsize,
    lifecycle: Mutex<()>,
}

impl<T: Transport> Session<T> {
    pub(crate) fn new(port: impl Into<String>, transport: T, timeout: Duration) -> Self {
        Session {
            port: port.into(),
            transport: Mutex::new(transport),
            transport_open: AtomicBool::new(false),
            timeout_ns: AtomicU64::new(nanos(timeout)),
            use_count: AtomicUsize::new(0),
            lifecycle: Mutex::new(()),
        }
    }

    /// Identifier the session was acquired with
    pub fn port_name(&self) -> &str {
        &self.port
    }

    pub fn system_port_name(&self) -> String {
        lock(&self.transport).system_port_name()
    }

    /// Read timeout applied to every response
    pub fn timeout(&self) -> Duration {
        Duration::from_nanos(self.timeout_ns.load(Ordering::SeqCst))
    }

    pub(crate) fn set_timeout(&self, timeout: Duration) {
        self.timeout_ns.store(nanos(timeout), Ordering::SeqCst);
    }

    /// 1 while the session is logically open, 0 otherwise
    pub fn use_count(&self) -> usize {
        self.use_count.load(Ordering::SeqCst)
    }

    /// State of the underlying transport as of its last open, close or
    /// exchange. Does not wait for an exchange in progress.
    pub fn is_open(&self) -> bool {
        self.transport_open.load(Ordering::SeqCst)
    }

    fn track_open(&self, transport: &T) {
        self.transport_open
            .store(transport.is_open(), Ordering::SeqCst);
    }

    pub fn open(&self) -> Result<()> {
        let _guard = lock(&self.lifecycle);
        log::debug!(
            "[{}] before - use count: {} timeout: {:?}",
            self.port,
            self.use_count(),
            self.timeout()
        );

        let result = if self
            .use_count
            .compare_exchange(0, 1, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
        {
            self.open_transport().map_err(|e| {
                self.use_count.store(0, Ordering::SeqCst);
                e
            })
        } else {
            Ok(())
        };

        log::debug!(
            "[{}] after - use count: {} timeout: {:?}",
            self.port,
            self.use_count(),
            self.timeout()
        );
        result
    }

    fn open_transport(&self) -> Result<()> {
        log::info!("[{}] opening serial port...", self.port);
        let mut transport = lock(&self.transport);

        transport.open().map_err(|source| self.open_failed(source))?;

        let configured = transport
            .configure(&LineSettings::MHZ19B)
            .and_then(|()| transport.set_timeout(self.timeout()));
        if let Err(source) = configured {
            // Leave the transport closed so the next open starts from scratch
            let _ = transport.close();
            self.track_open(&transport);
            return Err(self.open_failed(source));
        }
        self.track_open(&transport);

        log::info!("[{}] opened serial port.", self.port);
        Ok(())
    }

    fn open_failed(&self, source: io::Error) -> Error {
        log::warn!("[{}] failed to open serial port: {}", self.port, source);
        Error::OpenFailed {
            port: self.port.clone(),
            source,
        }
    }

    pub fn close(&self) -> Result<()> {
        let _guard = lock(&self.lifecycle);
        log::debug!(
            "[{}] before - use count: {} timeout: {:?}",
            self.port,
            self.use_count(),
            self.timeout()
        );

        let result = if self
            .use_count
            .compare_exchange(1, 0, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
        {
            self.close_transport()
        } else {
            Ok(())
        };

        log::debug!(
            "[{}] after - use count: {} timeout: {:?}",
            self.port,
            self.use_count(),
            self.timeout()
        );
        result
    }

    fn close_transport(&self) -> Result<()> {
        let mut transport = lock(&self.transport);
        if !transport.is_open() {
            self.track_open(&transport);
            log::info!("[{}] already closed.", self.port);
            return Ok(());
        }

        log::info!("[{}] closing serial port...", self.port);
        let closed = transport.close();
        self.track_open(&transport);
        closed.map_err(|source| {
            log::warn!("[{}] failed to close serial port: {}", self.port, source);
            Error::CloseFailed {
                port: self.port.clone(),
                source,
            }
        })?;
        log::info!("[{}] closed serial port.", self.port);
        Ok(())
    }

    fn read_failed(&self, source: io::Error) -> Error {
        log::warn!("[{}] failed to read: {}", self.port, source);
        Error::ReadFailed {
            port: self.port.clone(),
            source,
        }
    }

    fn write_failed(&self, source: io::Error) -> Error {
        log::warn!("[{}] failed to write: {}", self.port, source);
        Error::WriteFailed {
            port: self.port.clone(),
            source,
        }
    }

    /// Drop stale inbound bytes, then write `command`
    fn transmit(&self, transport: &mut T, command: Command) -> Result<()> {
        let frame: Frame = command.frame();
        transport
            .clear_input()
            .map_err(|source| self.read_failed(source))?;

        log::trace!("[{}] write: {}", self.port, Hex(frame.as_ref()));
        match transport.write(frame.as_ref()) {
            Ok(n) if n == FRAME_LEN => Ok(()),
            Ok(n) => Err(self.write_failed(io::Error::new(
                io::ErrorKind::WriteZero,
                format!("wrote {} of {} bytes", n, FRAME_LEN),
            ))),
            Err(source) => Err(self.write_failed(source)),
        }
    }

    fn receive(&self, transport: &mut T) -> Result<Response> {
        let timeout = self.timeout();
        let mut buffer = [0u8; FRAME_LEN];

        let received = match transport.read(&mut buffer, timeout) {
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::TimedOut => 0,
            Err(source) => return Err(self.read_failed(source)),
        };
        log::trace!("[{}]  read: {}", self.port, Hex(&buffer[..received]));

        if received < FRAME_LEN {
            log::warn!(
                "[{}] read timed out after {:?} ({} of {} bytes)",
                self.port,
                timeout,
                received,
                FRAME_LEN
            );
            return Err(Error::ReadTimeout {
                port: self.port.clone(),
                timeout,
                received,
                expected: FRAME_LEN,
            });
        }
        Ok(Response::new(buffer))
    }

    fn send(&self, command: Command) -> Result<()> {
        let mut transport = lock(&self.transport);
        let result = self.transmit(&mut transport, command);
        self.track_open(&transport);
        result
    }

    fn query(&self, command: Command) -> Result<Response> {
        let mut transport = lock(&self.transport);
        let result = self
            .transmit(&mut transport, command)
            .and_then(|()| self.receive(&mut transport));
        self.track_open(&transport);
        result
    }

    /// Warn about, but accept, a response that fails validation
    fn checked(&self, command: Command, response: Response) -> Response {
        if !response.is_valid_reply_to(&command) {
            log::warn!(
                "[{}] unverified response to {:#04x}: {}",
                self.port,
                command.opcode(),
                Hex(response.as_bytes())
            );
        }
        response
    }

    /// Check that a sensor answers on this port.
    ///
    /// MH-Z19B may print a bootloader prompt after power up, so malformed or
    /// missing answers are retried before giving up with `Ok(false)`.
    pub fn probe(&self) -> Result<bool> {
        let command = Command::ReadConcentration;
        for attempt in 1..=PROBE_ATTEMPTS {
            match self.query(command) {
                Ok(response) if response.is_valid_reply_to(&command) => return Ok(true),
                Ok(response) => log::debug!(
                    "[{}] probe {}: ignoring {}",
                    self.port,
                    attempt,
                    Hex(response.as_bytes())
                ),
                Err(e) if e.is_timeout() => {
                    log::debug!("[{}] probe {}: no answer", self.port, attempt)
                }
                Err(e) => return Err(e),
            }
        }
        Ok(false)
    }

    /// Read the CO2 gas concentration in ppm
    pub fn get_gas_concentration(&self) -> Result<u16> {
        let command = Command::ReadConcentration;
        let response = self.query(command)?;
        Ok(self.checked(command, response).concentration())
    }

    /// Perform zero point calibration
    ///
    /// The zero point is 400ppm, make sure the sensor has been working under
    /// 400ppm for over 20 minutes.
    pub fn set_calibrate_zero_point(&self) -> Result<()> {
        self.send(Command::CalibrateZeroPoint)?;
        log::info!("[{}] set the calibration zero point to 400 ppm.", self.port);
        Ok(())
    }

    /// Perform span point calibration
    ///
    /// Do zero calibration first. Span values below 1000ppm are raised to
    /// 1000ppm.
    pub fn set_calibrate_span_point(&self, ppm: u16) -> Result<()> {
        let point = frame::clamp_span_point(ppm);
        if point != ppm {
            log::info!(
                "[{}] since span needs at least {} ppm, set it to {} ppm.",
                self.port,
                frame::CALIBRATE_SPAN_POINT_MIN,
                point
            );
        }
        self.send(Command::CalibrateSpanPoint(point))?;
        log::info!("[{}] set the calibration span point to {} ppm.", self.port, point);
        Ok(())
    }

    /// Enable or disable Automatic Baseline Correction (ABC)
    pub fn set_auto_calibration(&self, enabled: bool) -> Result<()> {
        self.send(Command::AutoCalibration(enabled))?;
        log::info!(
            "[{}] set auto calibration to {}.",
            self.port,
            if enabled { "ON" } else { "OFF" }
        );
        Ok(())
    }

    pub fn set_detection_range(&self, ppm: u16) -> Result<()> {
        self.send(Command::DetectionRange(ppm))?;
        log::info!("[{}] set the detection range to {} ppm.", self.port, ppm);
        Ok(())
    }

    pub fn set_detection_range_2000(&self) -> Result<()> {
        self.set_detection_range(2000)
    }

    pub fn set_detection_range_5000(&self) -> Result<()> {
        self.set_detection_range(5000)
    }

    #[cfg(feature = "experimental")]
    #[cfg_attr(docsrs, doc(cfg(feature = "experimental")))]
    /// Get the sensor detection range
    pub fn get_detection_range(&self) -> Result<u32> {
        let command = Command::GetDetectionRange;
        let response = self.checked(command, self.query(command)?);
        let data = response.data();
        Ok(u32::from_be_bytes([data[0], data[1], data[2], data[3]]))
    }

    #[cfg(feature = "experimental")]
    #[cfg_attr(docsrs, doc(cfg(feature = "experimental")))]
    /// Perform sensor reset
    ///
    /// This command resets sensor MCU
    pub fn reset(&self) -> Result<()> {
        self.send(Command::Reset)?;
        log::info!("[{}] reset the sensor.", self.port);
        Ok(())
    }

    #[cfg(feature = "experimental")]
    #[cfg_attr(docsrs, doc(cfg(feature = "experimental")))]
    /// Get CO2 concentration bounds used for the analog output
    pub fn get_analog_bounds(&self) -> Result<(u16, u16)> {
        let command = Command::GetAnalogBounds;
        let response = self.checked(command, self.query(command)?);
        let data = response.data();
        let high = frame::join_u16(data[0], data[1]);
        let low = frame::join_u16(data[2], data[3]);
        Ok((high, low))
    }

    #[cfg(feature = "experimental")]
    #[cfg_attr(docsrs, doc(cfg(feature = "experimental")))]
    /// Get firmware version string
    pub fn get_firmware_version(&self) -> Result<[u8; 4]> {
        let command = Command::GetFirmwareVersion;
        let response = self.checked(command, self.query(command)?);
        let data = response.data();
        Ok([data[0], data[1], data[2], data[3]])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::mock::MockTransport;
    use std::sync::Arc;
    use std::thread;

    const PORT: &str = "/dev/ttyMOCK0";

    fn session() -> (Session<MockTransport>, MockTransport) {
        let mock = MockTransport::new("ttyMOCK0");
        let session = Session::new(PORT, mock.clone(), Duration::from_millis(100));
        (session, mock)
    }

    /// A well-formed sensor reply to `opcode`
    fn reply(opcode: u8, data: [u8; 6]) -> Vec<u8> {
        let mut bytes = vec![0xff, opcode];
        bytes.extend_from_slice(&data);
        bytes.push(frame::checksum(&bytes));
        bytes
    }

    #[test]
    fn open_is_idempotent() {
        let (session, mock) = session();
        session.open().unwrap();
        session.open().unwrap();

        let state = mock.state();
        assert_eq!(state.opens, 1);
        assert_eq!(state.settings, Some(LineSettings::MHZ19B));
        assert_eq!(state.timeout, Some(Duration::from_millis(100)));
        drop(state);
        assert_eq!(session.use_count(), 1);
        assert!(session.is_open());
    }

    #[test]
    fn close_is_idempotent() {
        let (session, mock) = session();
        session.close().unwrap();
        assert_eq!(mock.state().closes, 0);

        session.open().unwrap();
        session.close().unwrap();
        session.close().unwrap();
        assert_eq!(mock.state().closes, 1);
        assert_eq!(session.use_count(), 0);
        assert!(!session.is_open());
    }

    #[test]
    fn failed_open_can_be_retried() {
        let (session, mock) = session();
        mock.state().fail_open = true;

        let err = session.open().unwrap_err();
        assert!(matches!(err, Error::OpenFailed { .. }));
        assert_eq!(session.use_count(), 0);

        mock.state().fail_open = false;
        session.open().unwrap();
        assert_eq!(mock.state().opens, 2);
        assert_eq!(session.use_count(), 1);
    }

    #[test]
    fn failed_close_still_closes_logically() {
        let (session, mock) = session();
        session.open().unwrap();
        mock.state().fail_close = true;

        let err = session.close().unwrap_err();
        assert!(matches!(err, Error::CloseFailed { .. }));
        assert_eq!(session.use_count(), 0);

        session.close().unwrap();
        assert_eq!(mock.state().closes, 1);
    }

    #[test]
    fn close_of_already_closed_transport_is_not_an_error() {
        let (session, mock) = session();
        session.open().unwrap();
        mock.state().open = false;

        session.close().unwrap();
        assert_eq!(mock.state().closes, 0);
        assert_eq!(session.use_count(), 0);
    }

    #[test]
    fn concurrent_open_opens_transport_once() {
        let (session, mock) = session();
        let session = Arc::new(session);

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let session = Arc::clone(&session);
                thread::spawn(move || session.open())
            })
            .collect();
        for handle in handles {
            handle.join().unwrap().unwrap();
        }

        assert_eq!(mock.state().opens, 1);
        assert_eq!(session.use_count(), 1);
    }

    #[test]
    fn concurrent_close_closes_transport_once() {
        let (session, mock) = session();
        session.open().unwrap();
        let session = Arc::new(session);

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let session = Arc::clone(&session);
                thread::spawn(move || session.close())
            })
            .collect();
        for handle in handles {
            handle.join().unwrap().unwrap();
        }

        assert_eq!(mock.state().closes, 1);
        assert_eq!(session.use_count(), 0);
        assert!(!session.is_open());
    }

    #[test]
    fn is_open_does_not_wait_for_an_exchange() {
        let (session, _) = session();
        session.open().unwrap();

        let _exchange = lock(&session.transport);
        assert!(session.is_open());
        assert_eq!(session.use_count(), 1);
    }

    #[test]
    fn sub_millisecond_timeout_is_kept() {
        let (session, mock) = session();
        session.set_timeout(Duration::from_micros(500));
        assert_eq!(session.timeout(), Duration::from_micros(500));

        let _ = session.get_gas_concentration();
        assert_eq!(mock.state().read_timeouts, vec![Duration::from_micros(500)]);
    }

    #[test]
    fn reads_gas_concentration() {
        let (session, mock) = session();
        session.open().unwrap();
        mock.queue_reply(&reply(0x86, [0x03, 0x20, 0x47, 0, 0, 0]));

        assert_eq!(session.get_gas_concentration().unwrap(), 800);
        assert_eq!(
            mock.written(),
            vec![vec![0xff, 0x01, 0x86, 0, 0, 0, 0, 0, 0x79]]
        );
    }

    #[test]
    fn bad_response_checksum_still_returns_value() {
        let (session, mock) = session();
        mock.queue_reply(&[0xff, 0x86, 0x03, 0x20, 0, 0, 0, 0, 0x00]);
        assert_eq!(session.get_gas_concentration().unwrap(), 800);
    }

    #[test]
    fn stale_bytes_are_discarded_before_write() {
        let (session, mock) = session();
        mock.inject_pending(&reply(0x86, [0x05, 0xdc, 0, 0, 0, 0]));
        mock.queue_reply(&reply(0x86, [0x03, 0x20, 0, 0, 0, 0]));

        assert_eq!(session.get_gas_concentration().unwrap(), 800);
        assert!(mock.state().pending.is_empty());
    }

    #[test]
    fn missing_response_times_out() {
        let (session, mock) = session();
        let err = session.get_gas_concentration().unwrap_err();
        assert!(matches!(
            err,
            Error::ReadTimeout {
                received: 0,
                expected: 9,
                ..
            }
        ));

        mock.queue_reply(&[0xff, 0x86, 0x03, 0x20]);
        let err = session.get_gas_concentration().unwrap_err();
        assert!(matches!(err, Error::ReadTimeout { received: 4, .. }));
    }

    #[test]
    fn transport_failures_are_distinct() {
        let (session, mock) = session();
        mock.state().fail_write = true;
        assert!(matches!(
            session.get_gas_concentration().unwrap_err(),
            Error::WriteFailed { .. }
        ));
        assert!(matches!(
            session.set_calibrate_zero_point().unwrap_err(),
            Error::WriteFailed { .. }
        ));

        mock.state().fail_write = false;
        mock.state().fail_read = true;
        assert!(matches!(
            session.get_gas_concentration().unwrap_err(),
            Error::ReadFailed { .. }
        ));
    }

    #[test]
    fn reads_use_current_timeout() {
        let (session, mock) = session();
        session.set_timeout(Duration::from_millis(250));
        let _ = session.get_gas_concentration();
        assert_eq!(mock.state().read_timeouts, vec![Duration::from_millis(250)]);
    }

    #[test]
    fn span_point_below_minimum_is_clamped() {
        let (session, mock) = session();
        let minimum = Command::CalibrateSpanPoint(1000).frame().as_bytes().to_vec();
        for ppm in (0..1000).step_by(37).chain([999]) {
            session.set_calibrate_span_point(ppm).unwrap();
            assert_eq!(mock.written().last(), Some(&minimum));
        }

        session.set_calibrate_span_point(1000).unwrap();
        assert_eq!(mock.written().last(), Some(&minimum));
        session.set_calibrate_span_point(2000).unwrap();
        assert_eq!(
            mock.written().last().map(|f| f[3..5].to_vec()),
            Some(vec![0x07, 0xd0])
        );
    }

    #[test]
    fn configuration_commands_write_expected_frames() {
        let (session, mock) = session();
        session.set_calibrate_zero_point().unwrap();
        session.set_auto_calibration(true).unwrap();
        session.set_auto_calibration(false).unwrap();
        session.set_detection_range_2000().unwrap();
        session.set_detection_range_5000().unwrap();

        assert_eq!(
            mock.written(),
            vec![
                vec![0xff, 0x01, 0x87, 0, 0, 0, 0, 0, 0x78],
                vec![0xff, 0x01, 0x79, 0xa0, 0, 0, 0, 0, 0xe6],
                vec![0xff, 0x01, 0x79, 0, 0, 0, 0, 0, 0x86],
                vec![0xff, 0x01, 0x99, 0x07, 0xd0, 0, 0, 0, 0x8f],
                vec![0xff, 0x01, 0x99, 0x13, 0x88, 0, 0, 0, 0xcb],
            ]
        );
        assert!(mock.state().read_timeouts.is_empty());
    }

    #[test]
    fn probe_skips_bootloader_noise() {
        let (session, mock) = session();
        mock.queue_reply(b"bootload>");
        mock.queue_reply(&[]);
        mock.queue_reply(&reply(0x86, [0x01, 0x90, 0, 0, 0, 0]));
        assert!(session.probe().unwrap());
        assert_eq!(mock.written().len(), 3);
    }

    #[test]
    fn probe_gives_up_after_three_attempts() {
        let (session, mock) = session();
        assert!(!session.probe().unwrap());
        assert_eq!(mock.written().len(), 3);

        mock.state().fail_write = true;
        assert!(session.probe().is_err());
    }

    #[test]
    fn port_names() {
        let (session, _) = session();
        assert_eq!(session.port_name(), PORT);
        assert_eq!(session.system_port_name(), "ttyMOCK0");
    }

    #[cfg(feature = "experimental")]
    #[test]
    fn experimental_queries() {
        let (session, mock) = session();
        mock.queue_reply(&reply(0x9b, [0, 0, 0x13, 0x88, 0, 0]));
        assert_eq!(session.get_detection_range().unwrap(), 5000);

        mock.queue_reply(&reply(0xa5, [0x13, 0x88, 0x01, 0x90, 0, 0]));
        assert_eq!(session.get_analog_bounds().unwrap(), (5000, 400));

        mock.queue_reply(&reply(0xa0, *b"0430\0\0"));
        assert_eq!(&session.get_firmware_version().unwrap(), b"0430");

        session.reset().unwrap();
        assert_eq!(mock.written().last().map(|f| f[2]), Some(0x8d));
    }
}
