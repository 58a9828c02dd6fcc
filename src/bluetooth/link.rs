/// Link session abstraction consumed by the device layer
use async_trait::async_trait;
use bluer::Uuid;
use futures_util::stream::BoxStream;
use std::collections::HashSet;
use std::fmt;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum LinkError {
    #[error("could not connect to device {address}: {reason}")]
    Connect { address: String, reason: String },

    #[error("timed out after {0:?}")]
    Timeout(Duration),

    #[error("attribute {0} not found on device")]
    AttributeNotFound(Attribute),

    #[error("notification stream for {0} closed before end of data")]
    NotificationsClosed(Attribute),

    #[error("{op} {attribute} failed: {reason}")]
    Io {
        op: &'static str,
        attribute: Attribute,
        reason: String,
    },

    #[error("adapter error: {0}")]
    Adapter(String),
}

/// GATT characteristics the device layer knows how to use
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Attribute {
    /// Write-only command input
    Command,
    /// Notifications carrying streamed history chunks
    History,
    /// Current measurement record
    CurrentReadings,
    /// Refresh interval in seconds
    Interval,
    /// Seconds since the last measurement
    SinceUpdate,
    /// Number of stored history samples
    TotalReadings,
    DeviceName,
    FirmwareRevision,
}

impl Attribute {
    pub const ALL: [Attribute; 8] = [
        Attribute::Command,
        Attribute::History,
        Attribute::CurrentReadings,
        Attribute::Interval,
        Attribute::SinceUpdate,
        Attribute::TotalReadings,
        Attribute::DeviceName,
        Attribute::FirmwareRevision,
    ];

    pub fn uuid(self) -> Uuid {
        match self {
            Attribute::Command => Uuid::from_u128(0xf0cd1402_95da_4f4b_9ac8_aa55d312af0c),
            Attribute::History => Uuid::from_u128(0xf0cd2003_95da_4f4b_9ac8_aa55d312af0c),
            Attribute::CurrentReadings => Uuid::from_u128(0xf0cd3001_95da_4f4b_9ac8_aa55d312af0c),
            Attribute::Interval => Uuid::from_u128(0xf0cd2002_95da_4f4b_9ac8_aa55d312af0c),
            Attribute::SinceUpdate => Uuid::from_u128(0xf0cd2004_95da_4f4b_9ac8_aa55d312af0c),
            Attribute::TotalReadings => Uuid::from_u128(0xf0cd2001_95da_4f4b_9ac8_aa55d312af0c),
            Attribute::DeviceName => Uuid::from_u128(0x00002a00_0000_1000_8000_00805f9b34fb),
            Attribute::FirmwareRevision => Uuid::from_u128(0x00002a28_0000_1000_8000_00805f9b34fb),
        }
    }

    pub fn from_uuid(uuid: Uuid) -> Option<Self> {
        Attribute::ALL.into_iter().find(|a| a.uuid() == uuid)
    }
}

impl fmt::Display for Attribute {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Attribute::Command => "command",
            Attribute::History => "history",
            Attribute::CurrentReadings => "current-readings",
            Attribute::Interval => "interval",
            Attribute::SinceUpdate => "since-update",
            Attribute::TotalReadings => "total-readings",
            Attribute::DeviceName => "device-name",
            Attribute::FirmwareRevision => "firmware-revision",
        };
        f.write_str(s)
    }
}

/// Notification payloads delivered after a subscription
pub type Notifications = BoxStream<'static, Vec<u8>>;

/// Opens sessions to devices by address
#[async_trait]
pub trait Link: Send + Sync {
    type Session: LinkSession;

    async fn connect(&self, address: &str, timeout: Duration) -> Result<Self::Session, LinkError>;
}

/// One connected device; at most one exchange is in flight at a time
#[async_trait]
pub trait LinkSession: Send {
    /// Find the attributes this device exposes
    async fn discover(&mut self) -> Result<HashSet<Attribute>, LinkError>;

    async fn read(&mut self, attribute: Attribute) -> Result<Vec<u8>, LinkError>;

    async fn write(&mut self, attribute: Attribute, value: &[u8]) -> Result<(), LinkError>;

    /// Start notifications; they end when the stream is dropped or on unsubscribe
    async fn subscribe(&mut self, attribute: Attribute) -> Result<Notifications, LinkError>;

    async fn unsubscribe(&mut self, attribute: Attribute) -> Result<(), LinkError>;

    async fn disconnect(&mut self) -> Result<(), LinkError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn attribute_uuids_round_trip() {
        for a in Attribute::ALL {
            assert_eq!(Attribute::from_uuid(a.uuid()), Some(a));
        }
        assert_eq!(
            Attribute::Command.uuid().to_string(),
            "f0cd1402-95da-4f4b-9ac8-aa55d312af0c"
        );
        assert_eq!(Attribute::from_uuid(Uuid::nil()), None);
    }
}
