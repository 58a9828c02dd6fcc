/// Fixed-width binary form of one stored sample
///
/// This is the on-disk contract shared by every store backend:
/// - Bytes 0-7: Time (u64, Unix seconds)
/// - Byte 8: Humidity (%)
/// - Bytes 9-10: Pressure (u16, hPa × 10)
/// - Bytes 11-12: Temperature (16-bit, °C × 100)
/// - Bytes 13-14: CO2 (u16, ppm)
/// - Byte 15: Battery (%)
/// - Byte 16: Interval (minutes)
///
/// All multi-byte fields are little-endian. Quality is not part of the
/// record; it is recomputed from CO2 whenever a sample is read back.
use thiserror::Error;
use time::{Duration, OffsetDateTime};

use crate::models::Sample;

pub const RECORD_LEN: usize = 17;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum RecordError {
    #[error("short buffer: expected 17 bytes, got {0}")]
    ShortBuffer(usize),

    #[error("timestamp {0} is outside the storable range")]
    InvalidTime(i128),
}

pub fn encode(sample: &Sample) -> Result<[u8; RECORD_LEN], RecordError> {
    let unix = sample.time.unix_timestamp();
    if unix < 0 {
        return Err(RecordError::InvalidTime(unix as i128));
    }

    // Sub-zero temperatures wrap to two's complement so they survive a round trip
    let temperature = (sample.temperature * 100.0).round() as i16 as u16;
    let pressure = (sample.pressure * 10.0).round() as u16;
    let minutes = sample.interval.whole_minutes().clamp(0, u8::MAX as i64) as u8;

    let mut p = [0u8; RECORD_LEN];
    p[0..8].copy_from_slice(&(unix as u64).to_le_bytes());
    p[8] = sample.humidity;
    p[9..11].copy_from_slice(&pressure.to_le_bytes());
    p[11..13].copy_from_slice(&temperature.to_le_bytes());
    p[13..15].copy_from_slice(&sample.co2.to_le_bytes());
    p[15] = sample.battery as u8;
    p[16] = minutes;
    Ok(p)
}

pub fn decode(p: &[u8]) -> Result<Sample, RecordError> {
    if p.len() != RECORD_LEN {
        return Err(RecordError::ShortBuffer(p.len()));
    }

    let u16_at = |i: usize| u16::from_le_bytes([p[i], p[i + 1]]);

    let mut unix = [0u8; 8];
    unix.copy_from_slice(&p[0..8]);
    let unix = u64::from_le_bytes(unix);
    let time = i64::try_from(unix)
        .ok()
        .and_then(|secs| OffsetDateTime::from_unix_timestamp(secs).ok())
        .ok_or(RecordError::InvalidTime(unix as i128))?;

    Ok(Sample {
        time,
        humidity: p[8],
        pressure: u16_at(9) as f64 / 10.0,
        temperature: u16_at(11) as i16 as f64 / 100.0,
        co2: u16_at(13),
        battery: p[15] as i16,
        interval: Duration::minutes(p[16] as i64),
    })
}
