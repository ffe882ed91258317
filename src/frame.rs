//! Command and response frames of the MH-Z19B UART protocol.
//!
//! Every request is 9 bytes: start byte `0xFF`, sensor address `0x01`, opcode,
//! five parameter bytes and a trailing checksum. Responses have the same
//! length; byte 1 echoes the opcode.

use core::fmt;

/// Length of every request and response frame
pub const FRAME_LEN: usize = 9;

/// Frame start byte
pub const START: u8 = 0xff;

/// Sensor address, fixed for this sensor family
pub const ADDRESS: u8 = 0x01;

/// Smallest span point the sensor accepts, in ppm
pub const CALIBRATE_SPAN_POINT_MIN: u16 = 1000;

const READ_CONCENTRATION: u8 = 0x86;
const CALIBRATE_ZERO_POINT: u8 = 0x87;
const CALIBRATE_SPAN_POINT: u8 = 0x88;
const AUTO_CALIBRATION: u8 = 0x79;
const DETECTION_RANGE: u8 = 0x99;
#[cfg(feature = "experimental")]
const GET_DETECTION_RANGE: u8 = 0x9b;
#[cfg(feature = "experimental")]
const RESET: u8 = 0x8d;
#[cfg(feature = "experimental")]
const ANALOG_BOUNDS: u8 = 0xa5;
#[cfg(feature = "experimental")]
const FIRMWARE_VERSION: u8 = 0xa0;

const AUTO_CALIBRATION_ON: u8 = 0xa0;

const CMD_GAS_CONCENTRATION: Frame =
    Frame([START, ADDRESS, READ_CONCENTRATION, 0x00, 0x00, 0x00, 0x00, 0x00, 0x79]);
const CMD_CALIBRATE_ZERO_POINT: Frame =
    Frame([START, ADDRESS, CALIBRATE_ZERO_POINT, 0x00, 0x00, 0x00, 0x00, 0x00, 0x78]);

/// Checksum of a frame: two's-complement negation of the sum of bytes 1..=7.
///
/// `frame` must hold at least 8 bytes; a trailing checksum byte, if present, is
/// ignored.
pub fn checksum(frame: &[u8]) -> u8 {
    let sum = frame[1..8].iter().fold(0u32, |sum, b| sum + u32::from(*b));
    (!((sum & 0xff) as u8)).wrapping_add(1)
}

/// Split a 16-bit quantity into its (high, low) wire bytes
pub fn split_u16(value: u16) -> (u8, u8) {
    ((value >> 8) as u8, (value & 0xff) as u8)
}

/// Join two wire bytes back into a 16-bit quantity
pub fn join_u16(high: u8, low: u8) -> u16 {
    (u16::from(high) << 8) | u16::from(low)
}

/// Raise a span point below the sensor minimum up to that minimum
pub fn clamp_span_point(ppm: u16) -> u16 {
    ppm.max(CALIBRATE_SPAN_POINT_MIN)
}

/// A complete 9-byte request, checksum included
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Frame([u8; FRAME_LEN]);

impl Frame {
    /// Append the checksum to an 8-byte base command
    pub fn with_checksum(base: [u8; FRAME_LEN - 1]) -> Self {
        let mut buffer = [0u8; FRAME_LEN];
        buffer[..FRAME_LEN - 1].copy_from_slice(&base);
        buffer[FRAME_LEN - 1] = checksum(&base);
        Frame(buffer)
    }

    pub fn opcode(&self) -> u8 {
        self.0[2]
    }

    pub fn as_bytes(&self) -> &[u8; FRAME_LEN] {
        &self.0
    }
}

impl AsRef<[u8]> for Frame {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

/// Commands understood by the sensor
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Command {
    /// Read CO2 concentration
    ReadConcentration,
    /// Zero point calibration (400 ppm)
    CalibrateZeroPoint,
    /// Span point calibration at the given ppm, sent as is
    CalibrateSpanPoint(u16),
    /// Automatic Baseline Correction on/off
    AutoCalibration(bool),
    /// Detection range in ppm
    DetectionRange(u16),
    #[cfg(feature = "experimental")]
    GetDetectionRange,
    #[cfg(feature = "experimental")]
    Reset,
    #[cfg(feature = "experimental")]
    GetAnalogBounds,
    #[cfg(feature = "experimental")]
    GetFirmwareVersion,
}

impl Command {
    pub fn opcode(&self) -> u8 {
        match self {
            Command::ReadConcentration => READ_CONCENTRATION,
            Command::CalibrateZeroPoint => CALIBRATE_ZERO_POINT,
            Command::CalibrateSpanPoint(_) => CALIBRATE_SPAN_POINT,
            Command::AutoCalibration(_) => AUTO_CALIBRATION,
            Command::DetectionRange(_) => DETECTION_RANGE,
            #[cfg(feature = "experimental")]
            Command::GetDetectionRange => GET_DETECTION_RANGE,
            #[cfg(feature = "experimental")]
            Command::Reset => RESET,
            #[cfg(feature = "experimental")]
            Command::GetAnalogBounds => ANALOG_BOUNDS,
            #[cfg(feature = "experimental")]
            Command::GetFirmwareVersion => FIRMWARE_VERSION,
        }
    }

    /// Bytes 3..8 of the request
    fn payload(&self) -> [u8; 5] {
        match *self {
            Command::CalibrateSpanPoint(ppm) | Command::DetectionRange(ppm) => {
                let (high, low) = split_u16(ppm);
                [high, low, 0, 0, 0]
            }
            Command::AutoCalibration(true) => [AUTO_CALIBRATION_ON, 0, 0, 0, 0],
            _ => [0; 5],
        }
    }

    /// Build a fresh request frame for this command
    pub fn frame(&self) -> Frame {
        match self {
            Command::ReadConcentration => CMD_GAS_CONCENTRATION,
            Command::CalibrateZeroPoint => CMD_CALIBRATE_ZERO_POINT,
            _ => {
                let mut base = [0u8; FRAME_LEN - 1];
                base[0] = START;
                base[1] = ADDRESS;
                base[2] = self.opcode();
                base[3..].copy_from_slice(&self.payload());
                Frame::with_checksum(base)
            }
        }
    }
}

/// A 9-byte response read back from the sensor
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Response([u8; FRAME_LEN]);

impl Response {
    pub fn new(bytes: [u8; FRAME_LEN]) -> Self {
        Response(bytes)
    }

    /// Opcode echoed by the sensor
    pub fn opcode(&self) -> u8 {
        self.0[1]
    }

    /// Gas concentration in ppm, bytes 2 and 3 big-endian
    pub fn concentration(&self) -> u16 {
        join_u16(self.0[2], self.0[3])
    }

    /// Bytes 2..8, the command-specific data
    pub fn data(&self) -> &[u8] {
        &self.0[2..FRAME_LEN - 1]
    }

    pub fn checksum_ok(&self) -> bool {
        checksum(&self.0) == self.0[FRAME_LEN - 1]
    }

    /// Start byte, echoed opcode and checksum all match `command`
    pub fn is_valid_reply_to(&self, command: &Command) -> bool {
        self.0[0] == START && self.opcode() == command.opcode() && self.checksum_ok()
    }

    pub fn as_bytes(&self) -> &[u8; FRAME_LEN] {
        &self.0
    }
}

/// Space-separated lowercase hex, used for frame dumps in trace logs
pub(crate) struct Hex<'a>(pub &'a [u8]);

impl fmt::Display for Hex<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, b) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str(" ")?;
            }
            write!(f, "{:02x}", b)?;
        }
        Ok(())
    }
}
