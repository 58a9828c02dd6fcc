/// Aranet4 GATT command and notification frames
use log::debug;
use std::fmt;
use thiserror::Error;
use time::{Duration, OffsetDateTime};

use crate::models::{Quality, Sample};

// Aranet4 protocol constants
const CMD_READ_HISTORY: u8 = 0x82; // Opcode requesting a streamed history read
const HISTORY_RANGE_START: u16 = 0x0001; // First stored sample (1-based)
const HISTORY_RANGE_END: u16 = 0xffff; // Everything the device has
const CHUNK_HEADER_LEN: usize = 4; // channel, start (u16), count
const CURRENT_READING_LEN: usize = 13; // Minimum length of the "read current" record

const TEMPERATURE_SCALE: f64 = 20.0; // Raw units per °C on the wire
const PRESSURE_SCALE: f64 = 10.0; // Raw units per hPa on the wire

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ProtocolError {
    #[error("short buffer decoding {what}: expected {expected} bytes, got {got}")]
    ShortBuffer {
        what: &'static str,
        expected: usize,
        got: usize,
    },

    #[error("channel mismatch: expected 0x{expected:02x}, got 0x{got:02x}")]
    ChannelMismatch { expected: u8, got: u8 },

    #[error("invalid {field}: {value}")]
    InvalidField { field: &'static str, value: u32 },
}

/// A physical quantity the device records history for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Channel {
    Temperature,
    Humidity,
    Pressure,
    Co2,
}

impl Channel {
    /// Read order used by history reconstruction
    pub const ALL: [Channel; 4] = [
        Channel::Temperature,
        Channel::Humidity,
        Channel::Pressure,
        Channel::Co2,
    ];

    pub fn id(self) -> u8 {
        match self {
            Channel::Temperature => 1,
            Channel::Humidity => 2,
            Channel::Pressure => 3,
            Channel::Co2 => 4,
        }
    }

    pub fn from_id(id: u8) -> Option<Self> {
        Channel::ALL.into_iter().find(|c| c.id() == id)
    }

    /// Byte width of one history value on this channel
    pub fn width(self) -> usize {
        match self {
            Channel::Humidity => 1,
            _ => 2,
        }
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Channel::Temperature => "temperature",
            Channel::Humidity => "humidity",
            Channel::Pressure => "pressure",
            Channel::Co2 => "CO2",
        };
        f.write_str(s)
    }
}

/// One decoded history value
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Reading {
    Temperature(f64),
    Humidity(u8),
    Pressure(f64),
    Co2(u16),
}

/// One notification frame of a streamed history read
///
/// `values[i]` belongs to 0-based index `start + i`. `None` marks a value
/// the device flagged as missing.
#[derive(Debug, Clone, PartialEq)]
pub struct HistoryChunk {
    pub channel: Channel,
    pub start: usize,
    pub values: Vec<Option<Reading>>,
}

impl HistoryChunk {
    /// A zero-count chunk terminates the stream for its channel
    pub fn is_end(&self) -> bool {
        self.values.is_empty()
    }
}

/// Build the 8-byte "read history" command for one channel
pub fn encode_history_command(channel: Channel) -> [u8; 8] {
    let mut cmd = [0u8; 8];
    cmd[0] = CMD_READ_HISTORY;
    cmd[1] = channel.id();
    cmd[4..6].copy_from_slice(&HISTORY_RANGE_START.to_le_bytes());
    cmd[6..8].copy_from_slice(&HISTORY_RANGE_END.to_le_bytes());
    cmd
}

/// Decode one history notification, checking it belongs to `expected`
///
/// Frame layout:
/// - Byte 0: channel id
/// - Bytes 1-2: 1-based index of the first value (u16 LE)
/// - Byte 3: number of values (0 ends the stream)
/// - Bytes 4..: the values, `Channel::width` bytes each
pub fn decode_history_chunk(frame: &[u8], expected: Channel) -> Result<HistoryChunk, ProtocolError> {
    if frame.len() < CHUNK_HEADER_LEN {
        return Err(ProtocolError::ShortBuffer {
            what: "history chunk header",
            expected: CHUNK_HEADER_LEN,
            got: frame.len(),
        });
    }

    if frame[0] != expected.id() {
        return Err(ProtocolError::ChannelMismatch {
            expected: expected.id(),
            got: frame[0],
        });
    }

    let count = frame[3] as usize;
    if count == 0 {
        debug!("End of {} history stream", expected);
        return Ok(HistoryChunk {
            channel: expected,
            start: 0,
            values: Vec::new(),
        });
    }

    let start = u16::from_le_bytes([frame[1], frame[2]]);
    if start == 0 {
        return Err(ProtocolError::InvalidField {
            field: "chunk start index",
            value: 0,
        });
    }

    let width = expected.width();
    let payload = &frame[CHUNK_HEADER_LEN..];
    if payload.len() < count * width {
        return Err(ProtocolError::ShortBuffer {
            what: "history chunk payload",
            expected: CHUNK_HEADER_LEN + count * width,
            got: frame.len(),
        });
    }

    let values = payload
        .chunks_exact(width)
        .take(count)
        .map(|raw| decode_value(expected, raw))
        .collect();

    Ok(HistoryChunk {
        channel: expected,
        start: start as usize - 1,
        values,
    })
}

/// Decode one value; the most significant bit flags "no data"
fn decode_value(channel: Channel, raw: &[u8]) -> Option<Reading> {
    if channel == Channel::Humidity {
        let v = raw[0];
        return (v & 0x80 == 0).then_some(Reading::Humidity(v));
    }

    let v = u16::from_le_bytes([raw[0], raw[1]]);
    if v & 0x8000 != 0 {
        return None;
    }
    Some(match channel {
        Channel::Temperature => Reading::Temperature(v as f64 / TEMPERATURE_SCALE),
        Channel::Pressure => Reading::Pressure(v as f64 / PRESSURE_SCALE),
        _ => Reading::Co2(v),
    })
}

/// A decoded "read current" record
#[derive(Debug, Clone, PartialEq)]
pub struct CurrentReading {
    pub sample: Sample,
    /// Quality as classified by the device itself
    pub reported_quality: Quality,
    /// Time elapsed since the device took the sample
    pub ago: Duration,
}

/// Decode the single-shot "read current" record
///
/// Record layout:
/// - Bytes 0-1: CO2 (u16, ppm)
/// - Bytes 2-3: Temperature (u16, 0.05°C resolution)
/// - Bytes 4-5: Pressure (u16, 0.1 hPa resolution)
/// - Byte 6: Humidity (%)
/// - Byte 7: Battery (%)
/// - Byte 8: Quality code (1 good, 2 average, 3 bad)
/// - Bytes 9-10: Refresh interval (u16, seconds)
/// - Bytes 11-12: Seconds since the sample was taken (u16)
///
/// Newer firmware may append fields; trailing bytes are ignored.
pub fn decode_current(raw: &[u8], now: OffsetDateTime) -> Result<CurrentReading, ProtocolError> {
    if raw.len() < CURRENT_READING_LEN {
        return Err(ProtocolError::ShortBuffer {
            what: "current reading",
            expected: CURRENT_READING_LEN,
            got: raw.len(),
        });
    }

    let u16_at = |i: usize| u16::from_le_bytes([raw[i], raw[i + 1]]);

    let code = raw[8];
    let reported_quality = Quality::from_code(code).ok_or(ProtocolError::InvalidField {
        field: "quality code",
        value: code as u32,
    })?;

    let interval = Duration::seconds(u16_at(9) as i64);
    let ago = Duration::seconds(u16_at(11) as i64);

    let sample = Sample {
        time: now - ago,
        co2: u16_at(0),
        temperature: u16_at(2) as f64 / TEMPERATURE_SCALE,
        pressure: u16_at(4) as f64 / PRESSURE_SCALE,
        humidity: raw[6],
        battery: raw[7] as i16,
        interval,
    };

    if sample.quality() != reported_quality {
        debug!(
            "Device reports {} quality for {} ppm, using {}",
            reported_quality,
            sample.co2,
            sample.quality()
        );
    }

    Ok(CurrentReading {
        sample,
        reported_quality,
        ago,
    })
}

/// Decode a little-endian u16 scalar characteristic
pub fn decode_u16(raw: &[u8], what: &'static str) -> Result<u16, ProtocolError> {
    match raw {
        [lo, hi, ..] => Ok(u16::from_le_bytes([*lo, *hi])),
        _ => Err(ProtocolError::ShortBuffer {
            what,
            expected: 2,
            got: raw.len(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::datetime;

    #[test]
    fn history_command_layout() {
        assert_eq!(
            encode_history_command(Channel::Temperature),
            [0x82, 0x01, 0x00, 0x00, 0x01, 0x00, 0xff, 0xff]
        );
        assert_eq!(
            encode_history_command(Channel::Co2),
            [0x82, 0x04, 0x00, 0x00, 0x01, 0x00, 0xff, 0xff]
        );
    }

    #[test]
    fn channel_ids() {
        for c in Channel::ALL {
            assert_eq!(Channel::from_id(c.id()), Some(c));
        }
        assert_eq!(Channel::from_id(0), None);
        assert_eq!(Channel::from_id(5), None);
    }

    #[test]
    fn decodes_co2_chunk() {
        // start=3 (1-based), two values: 450, 1200
        let frame = [0x04, 0x03, 0x00, 0x02, 0xc2, 0x01, 0xb0, 0x04];
        let chunk = decode_history_chunk(&frame, Channel::Co2).unwrap();
        assert_eq!(chunk.start, 2);
        assert_eq!(
            chunk.values,
            vec![Some(Reading::Co2(450)), Some(Reading::Co2(1200))]
        );
        assert!(!chunk.is_end());
    }

    #[test]
    fn decodes_scaled_channels() {
        // 430 / 20 = 21.5°C
        let frame = [0x01, 0x01, 0x00, 0x01, 0xae, 0x01];
        let chunk = decode_history_chunk(&frame, Channel::Temperature).unwrap();
        assert_eq!(chunk.values, vec![Some(Reading::Temperature(21.5))]);

        // 10123 / 10 = 1012.3 hPa
        let frame = [0x03, 0x01, 0x00, 0x01, 0x8b, 0x27];
        let chunk = decode_history_chunk(&frame, Channel::Pressure).unwrap();
        assert_eq!(chunk.values, vec![Some(Reading::Pressure(1012.3))]);

        let frame = [0x02, 0x01, 0x00, 0x03, 40, 41, 42];
        let chunk = decode_history_chunk(&frame, Channel::Humidity).unwrap();
        assert_eq!(
            chunk.values,
            vec![
                Some(Reading::Humidity(40)),
                Some(Reading::Humidity(41)),
                Some(Reading::Humidity(42))
            ]
        );
    }

    #[test]
    fn zero_count_ends_stream() {
        let frame = [0x02, 0x00, 0x00, 0x00];
        let chunk = decode_history_chunk(&frame, Channel::Humidity).unwrap();
        assert!(chunk.is_end());
    }

    #[test]
    fn channel_mismatch_is_rejected() {
        let frame = [0x04, 0x01, 0x00, 0x01, 0xc2, 0x01];
        let err = decode_history_chunk(&frame, Channel::Temperature).unwrap_err();
        assert_eq!(
            err,
            ProtocolError::ChannelMismatch {
                expected: 1,
                got: 4
            }
        );
    }

    #[test]
    fn short_frames_are_rejected() {
        let err = decode_history_chunk(&[0x04, 0x01], Channel::Co2).unwrap_err();
        assert!(matches!(err, ProtocolError::ShortBuffer { got: 2, .. }));

        // claims two values, carries one
        let frame = [0x04, 0x01, 0x00, 0x02, 0xc2, 0x01];
        let err = decode_history_chunk(&frame, Channel::Co2).unwrap_err();
        assert!(matches!(err, ProtocolError::ShortBuffer { expected: 8, .. }));
    }

    #[test]
    fn zero_start_index_is_malformed() {
        let frame = [0x04, 0x00, 0x00, 0x01, 0xc2, 0x01];
        let err = decode_history_chunk(&frame, Channel::Co2).unwrap_err();
        assert!(matches!(err, ProtocolError::InvalidField { .. }));
    }

    #[test]
    fn no_data_sentinel_is_tolerated() {
        let frame = [0x04, 0x01, 0x00, 0x02, 0x00, 0x80, 0xc2, 0x01];
        let chunk = decode_history_chunk(&frame, Channel::Co2).unwrap();
        assert_eq!(chunk.values, vec![None, Some(Reading::Co2(450))]);

        let frame = [0x02, 0x01, 0x00, 0x01, 0xff];
        let chunk = decode_history_chunk(&frame, Channel::Humidity).unwrap();
        assert_eq!(chunk.values, vec![None]);
    }

    #[test]
    fn decodes_current_reading() {
        let now = datetime!(2024-05-01 12:00:00 UTC);
        let raw = [
            0x20, 0x03, // co2 = 800
            0xae, 0x01, // t = 430 / 20 = 21.5
            0x8b, 0x27, // p = 10123 / 10 = 1012.3
            45,   // h
            87,   // battery
            1,    // quality code
            0x2c, 0x01, // interval = 300s
            0x1e, 0x00, // ago = 30s
        ];
        let cur = decode_current(&raw, now).unwrap();
        assert_eq!(cur.sample.co2, 800);
        assert_eq!(cur.sample.temperature, 21.5);
        assert_eq!(cur.sample.pressure, 1012.3);
        assert_eq!(cur.sample.humidity, 45);
        assert_eq!(cur.sample.battery, 87);
        assert_eq!(cur.sample.interval, Duration::minutes(5));
        assert_eq!(cur.sample.time, datetime!(2024-05-01 11:59:30 UTC));
        assert_eq!(cur.reported_quality, Quality::Good);
        assert_eq!(cur.ago, Duration::seconds(30));
    }

    #[test]
    fn current_reading_rejects_bad_input() {
        let now = datetime!(2024-05-01 12:00:00 UTC);
        let err = decode_current(&[0u8; 12], now).unwrap_err();
        assert!(matches!(err, ProtocolError::ShortBuffer { expected: 13, got: 12, .. }));

        let mut raw = [0u8; 13];
        raw[8] = 9;
        let err = decode_current(&raw, now).unwrap_err();
        assert_eq!(
            err,
            ProtocolError::InvalidField {
                field: "quality code",
                value: 9
            }
        );
    }

    #[test]
    fn scalar_u16() {
        assert_eq!(decode_u16(&[0x2c, 0x01], "interval").unwrap(), 300);
        assert!(decode_u16(&[0x2c], "interval").is_err());
    }
}
