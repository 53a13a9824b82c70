//! Serial protocol codec for the MH-Z19 family of NDIR CO2 sensors
//!
//! The sensor speaks a fixed 9-byte request/response protocol over a UART
//! (9600 baud, 8 data bits, no parity, 1 stop bit). This module keeps the
//! framing logic as pure functions over byte slices and a single
//! request/response exchange over any `Read + Write` transport, so the codec
//! can be exercised without hardware.

use crate::config::SensorSection;
use std::io::{self, Read, Write};
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

/// Length of every command and response frame
pub const FRAME_LEN: usize = 9;

/// Frame start byte
pub const START_BYTE: u8 = 0xFF;

/// "Read CO2 concentration" command byte, echoed in byte 1 of the response
pub const READ_CO2_OPCODE: u8 = 0x86;

/// Command frame requesting the current CO2 concentration
pub const READ_CO2_COMMAND: [u8; FRAME_LEN] =
    [START_BYTE, 0x01, READ_CO2_OPCODE, 0x00, 0x00, 0x00, 0x00, 0x00, 0x79];

/// Serial protocol errors
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("Truncated response: expected {FRAME_LEN} bytes, received {received}")]
    Truncated { received: usize },
    #[error("Bad framing: start byte {start:#04x}, command byte {command:#04x}")]
    BadFraming { start: u8, command: u8 },
    #[error("Serial I/O failed: {message}")]
    Io { message: String },
}

impl From<io::Error> for ProtocolError {
    fn from(e: io::Error) -> Self {
        ProtocolError::Io {
            message: e.to_string(),
        }
    }
}

/// Compute the frame checksum: two's complement of the sum of bytes 1..=7
pub fn frame_checksum(frame: &[u8]) -> u8 {
    let sum = frame
        .iter()
        .skip(1)
        .take(FRAME_LEN - 2)
        .fold(0u8, |acc, b| acc.wrapping_add(*b));
    0xFFu8.wrapping_sub(sum).wrapping_add(1)
}

/// Decode a read-CO2 response frame into a concentration in ppm (pure function)
///
/// The trailing checksum byte is not enforced; a mismatch is only logged.
pub fn decode_response(frame: &[u8]) -> Result<u16, ProtocolError> {
    if frame.len() < FRAME_LEN {
        return Err(ProtocolError::Truncated {
            received: frame.len(),
        });
    }

    if frame[0] != START_BYTE || frame[1] != READ_CO2_OPCODE {
        return Err(ProtocolError::BadFraming {
            start: frame[0],
            command: frame[1],
        });
    }

    let expected = frame_checksum(frame);
    if frame[FRAME_LEN - 1] != expected {
        debug!(
            expected = expected,
            received = frame[FRAME_LEN - 1],
            "CO2 response checksum mismatch (not enforced)"
        );
    }

    Ok(u16::from_be_bytes([frame[2], frame[3]]))
}

/// Perform one read-CO2 exchange over `transport`
///
/// Writes the command frame once and reads until a full frame arrived, the
/// transport reports end of stream, or its read timeout elapses. There is no
/// retry here; callers decide whether a failed cycle is worth repeating.
pub fn read_co2<T>(transport: &mut T) -> Result<u16, ProtocolError>
where
    T: Read + Write + ?Sized,
{
    transport.write_all(&READ_CO2_COMMAND)?;
    transport.flush()?;

    let mut response = [0u8; FRAME_LEN];
    let mut filled = 0;
    while filled < FRAME_LEN {
        match transport.read(&mut response[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e)
                if matches!(
                    e.kind(),
                    io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock
                ) =>
            {
                break
            }
            Err(e) => return Err(e.into()),
        }
    }

    decode_response(&response[..filled])
}

/// CO2 sensor bound to a byte-stream transport
pub struct Co2Sensor<T> {
    transport: T,
}

impl<T> Co2Sensor<T>
where
    T: Read + Write,
{
    pub fn new(transport: T) -> Self {
        Self { transport }
    }

    /// Read the current concentration in ppm
    pub fn read(&mut self) -> Result<u16, ProtocolError> {
        read_co2(&mut self.transport)
    }

    /// Access the underlying transport (used by tests to inspect written bytes)
    pub fn transport(&self) -> &T {
        &self.transport
    }
}

/// Open the configured serial device with the sensor's fixed line settings
pub fn open_serial(
    config: &SensorSection,
) -> Result<Box<dyn serialport::SerialPort>, serialport::Error> {
    serialport::new(&config.serial_port, config.baud_rate)
        .data_bits(serialport::DataBits::Eight)
        .parity(serialport::Parity::None)
        .stop_bits(serialport::StopBits::One)
        .flow_control(serialport::FlowControl::None)
        .timeout(Duration::from_millis(config.read_timeout_ms))
        .open()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::mocks::LoopbackSerial;

    fn frame(high: u8, low: u8) -> Vec<u8> {
        let mut f = vec![START_BYTE, READ_CO2_OPCODE, high, low, 0x00, 0x00, 0x00, 0x00, 0x00];
        f[8] = frame_checksum(&f);
        f
    }

    #[test]
    fn test_command_frame_checksum_matches_trailing_byte() {
        assert_eq!(frame_checksum(&READ_CO2_COMMAND), 0x79);
    }

    #[test]
    fn test_decode_800_ppm() {
        assert_eq!(decode_response(&frame(0x03, 0x20)), Ok(800));
    }

    #[test]
    fn test_decode_ignores_checksum() {
        let mut f = frame(0x01, 0x90);
        f[8] = f[8].wrapping_add(1);
        assert_eq!(decode_response(&f), Ok(400));
    }

    #[test]
    fn test_decode_rejects_wrong_start_byte() {
        let mut f = frame(0x03, 0x20);
        f[0] = 0xFE;
        assert_eq!(
            decode_response(&f),
            Err(ProtocolError::BadFraming {
                start: 0xFE,
                command: READ_CO2_OPCODE
            })
        );
    }

    #[test]
    fn test_decode_rejects_wrong_command_byte() {
        let mut f = frame(0x03, 0x20);
        f[1] = 0x85;
        assert!(matches!(
            decode_response(&f),
            Err(ProtocolError::BadFraming { command: 0x85, .. })
        ));
    }

    #[test]
    fn test_decode_short_frame_is_truncated() {
        assert_eq!(
            decode_response(&[0xFF, 0x86, 0x03]),
            Err(ProtocolError::Truncated { received: 3 })
        );
        assert_eq!(
            decode_response(&[]),
            Err(ProtocolError::Truncated { received: 0 })
        );
    }

    #[test]
    fn test_read_co2_writes_command_once() {
        let mut serial = LoopbackSerial::responding(frame(0x03, 0x84));

        let ppm = read_co2(&mut serial).unwrap();

        assert_eq!(ppm, 900);
        assert_eq!(serial.written(), READ_CO2_COMMAND.to_vec());
    }

    #[test]
    fn test_read_co2_assembles_chunked_response() {
        let mut serial = LoopbackSerial::responding(frame(0x02, 0x58)).with_chunk_size(2);

        assert_eq!(read_co2(&mut serial), Ok(600));
    }

    #[test]
    fn test_read_co2_timeout_is_truncated() {
        let mut serial = LoopbackSerial::responding(vec![0xFF, 0x86, 0x01, 0x02]).timing_out();

        assert_eq!(
            read_co2(&mut serial),
            Err(ProtocolError::Truncated { received: 4 })
        );
    }

    #[test]
    fn test_read_co2_silent_sensor_is_truncated() {
        let mut serial = LoopbackSerial::responding(Vec::new());

        assert_eq!(
            read_co2(&mut serial),
            Err(ProtocolError::Truncated { received: 0 })
        );
    }

    #[test]
    fn test_co2_sensor_wraps_transport() {
        let mut sensor = Co2Sensor::new(LoopbackSerial::responding(frame(0x00, 0x00)));
        assert_eq!(sensor.read(), Ok(0));
        assert_eq!(sensor.transport().written().len(), FRAME_LEN);
    }
}
