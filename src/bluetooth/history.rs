/// History reconstruction from per-channel notification streams
///
/// The device keeps one ring buffer per physical quantity and streams each
/// of them independently, with no absolute timestamps. We pull the four
/// channels one after the other into a shared array and then derive each
/// slot's time from the number of stored samples, the refresh interval and
/// the age of the most recent sample.
use futures_util::StreamExt;
use log::{debug, warn};
use std::time::Duration as StdDuration;
use time::{Duration, OffsetDateTime};

use crate::bluetooth::link::{Attribute, LinkError, LinkSession, Notifications};
use crate::bluetooth::protocol::{
    decode_history_chunk, encode_history_command, Channel, HistoryChunk, ProtocolError, Reading,
};
use crate::error::{Error, Result};
use crate::models::{Sample, BATTERY_UNKNOWN};

/// Device-reported parameters a reconstruction starts from
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct HistoryInfo {
    /// Number of samples stored on the device
    pub count: usize,
    /// Age of the most recent sample
    pub ago: Duration,
    /// Refresh interval
    pub delta: Duration,
}

/// Timestamp of the oldest stored sample
pub fn earliest(now: OffsetDateTime, info: &HistoryInfo) -> OffsetDateTime {
    let span = info.delta * (info.count.saturating_sub(1) as i32);
    now - info.ago - span
}

/// One slot of the merged history, filled channel by channel
#[derive(Debug, Clone, Copy, Default)]
struct Slot {
    co2: u16,
    temperature: f64,
    pressure: f64,
    humidity: u8,
}

impl Slot {
    fn apply(&mut self, reading: Reading) {
        match reading {
            Reading::Temperature(v) => self.temperature = v,
            Reading::Humidity(v) => self.humidity = v,
            Reading::Pressure(v) => self.pressure = v,
            Reading::Co2(v) => self.co2 = v,
        }
    }
}

/// Merge target for the four channel streams
#[derive(Debug)]
pub struct HistoryBuffer {
    slots: Vec<Slot>,
}

impl HistoryBuffer {
    pub fn new(count: usize) -> Self {
        HistoryBuffer {
            slots: vec![Slot::default(); count],
        }
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Copy a chunk into the buffer, dropping values past the end
    ///
    /// The device may record a new sample while we are reading, so chunks
    /// can legitimately reach beyond the count we asked for up front.
    /// Returns the number of values written.
    pub fn apply(&mut self, chunk: &HistoryChunk) -> usize {
        let end = chunk.start.saturating_add(chunk.values.len()).min(self.slots.len());
        if chunk.start >= end {
            return 0;
        }

        let mut written = 0;
        for (i, value) in (chunk.start..end).zip(&chunk.values) {
            match value {
                Some(reading) => {
                    self.slots[i].apply(*reading);
                    written += 1;
                }
                None => warn!("No data for {} at index {}", chunk.channel, i),
            }
        }
        written
    }

    /// Turn the merged slots into timestamped samples
    pub fn finish(self, now: OffsetDateTime, info: &HistoryInfo) -> Vec<Sample> {
        let beg = earliest(now, info);
        self.slots
            .into_iter()
            .enumerate()
            .map(|(i, slot)| Sample {
                time: beg + info.delta * (i as i32),
                co2: slot.co2,
                temperature: slot.temperature,
                pressure: slot.pressure,
                humidity: slot.humidity,
                battery: BATTERY_UNKNOWN,
                interval: info.delta,
            })
            .collect()
    }
}

/// Stream one channel's history into `buf`
///
/// Bounded by `timeout`; on expiry the caller must discard `buf`.
pub async fn read_channel<S: LinkSession>(
    session: &mut S,
    channel: Channel,
    buf: &mut HistoryBuffer,
    timeout: StdDuration,
) -> Result<()> {
    session
        .write(Attribute::Command, &encode_history_command(channel))
        .await?;

    let mut notifications = session.subscribe(Attribute::History).await?;

    let drained = tokio::time::timeout(timeout, drain(&mut notifications, channel, buf)).await;

    drop(notifications);
    if let Err(e) = session.unsubscribe(Attribute::History).await {
        warn!("Failed to unsubscribe from {}: {}", Attribute::History, e);
    }

    match drained {
        Ok(result) => result,
        Err(_) => Err(Error::ReconstructionTimeout { channel, timeout }),
    }
}

/// Consume chunks until the end-of-stream marker
async fn drain(
    notifications: &mut Notifications,
    channel: Channel,
    buf: &mut HistoryBuffer,
) -> Result<()> {
    let mut chunks = 0usize;
    while let Some(frame) = notifications.next().await {
        let chunk = decode_history_chunk(&frame, channel)?;
        if chunk.is_end() {
            debug!("Read {} {} chunks", chunks, channel);
            return Ok(());
        }
        let written = buf.apply(&chunk);
        debug!(
            "{} chunk at {}: {} values, {} kept",
            channel,
            chunk.start,
            chunk.values.len(),
            written
        );
        chunks += 1;
    }
    Err(LinkError::NotificationsClosed(Attribute::History).into())
}

/// Read all four channels and assemble `info.count` timestamped samples
///
/// Channels are read strictly one after the other so notifications from
/// different channels never interleave. Any failure discards everything.
pub async fn reconstruct<S: LinkSession>(
    session: &mut S,
    info: &HistoryInfo,
    now: OffsetDateTime,
    channel_timeout: StdDuration,
) -> Result<Vec<Sample>> {
    if info.count > 0 && info.delta <= Duration::ZERO {
        return Err(ProtocolError::InvalidField {
            field: "refresh interval",
            value: 0,
        }
        .into());
    }

    let mut buf = HistoryBuffer::new(info.count);
    for channel in Channel::ALL {
        read_channel(session, channel, &mut buf, channel_timeout).await?;
    }
    Ok(buf.finish(now, info))
}
