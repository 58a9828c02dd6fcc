pub mod connection;
pub mod embedded;
pub mod postgres;
pub mod record;

pub use embedded::EmbeddedStore;
pub use postgres::PostgresStore;
pub use record::{RecordError, RECORD_LEN};

use async_trait::async_trait;
use std::collections::BTreeMap;
use thiserror::Error;
use time::OffsetDateTime;

use crate::models::{sort_by_time, Sample};

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("no such device {0:?}")]
    NoSuchDevice(String),

    #[error("duplicate device {0:?}")]
    DuplicateDevice(String),

    #[error("no data for device {0:?}")]
    NoData(String),

    #[error("corrupt record #{index} for device {device:?}: {source}")]
    CorruptRecord {
        device: String,
        index: usize,
        source: RecordError,
    },

    #[error("could not encode sample for device {device:?}: {source}")]
    Encode { device: String, source: RecordError },

    #[error("embedded store error: {0}")]
    Embedded(#[from] redb::Error),

    #[error("postgres error: {0}")]
    Postgres(#[from] tokio_postgres::Error),

    #[error("postgres connection error: {0}")]
    Connection(String),
}

/// Per-device time-series storage
///
/// Every backend keeps samples of one device strictly ordered by time, with
/// no two samples inside the tolerance window of each other.
#[async_trait]
pub trait Store: Send + Sync {
    /// Append the samples of `batch` that are newer than the last stored one
    ///
    /// The batch is sorted first, so unsorted or overlapping batches are
    /// fine. Returns the number of samples written.
    async fn put_data(&self, id: &str, batch: Vec<Sample>) -> Result<usize, StoreError>;

    /// Samples with `beg <= time < end`, ascending
    ///
    /// A `None` bound, or one at the Unix epoch, is unconstrained.
    async fn data(
        &self,
        id: &str,
        beg: Option<OffsetDateTime>,
        end: Option<OffsetDateTime>,
    ) -> Result<Samples, StoreError>;

    /// Most recent sample, or `StoreError::NoData` for an empty device
    async fn last(&self, id: &str) -> Result<Sample, StoreError>;

    async fn add_device(&self, id: &str) -> Result<(), StoreError>;

    /// Known device ids, ascending
    async fn devices(&self) -> Result<Vec<String>, StoreError>;

    async fn close(self) -> Result<(), StoreError>
    where
        Self: Sized;
}

/// Lazily decoded result of a range query
///
/// Stops after the first corrupt record. Run the query again to restart.
#[derive(Debug)]
pub struct Samples {
    device: String,
    rows: std::vec::IntoIter<Vec<u8>>,
    index: usize,
    failed: bool,
}

impl Samples {
    pub(crate) fn new(device: &str, rows: Vec<Vec<u8>>) -> Self {
        Samples {
            device: device.to_string(),
            rows: rows.into_iter(),
            index: 0,
            failed: false,
        }
    }
}

impl Iterator for Samples {
    type Item = Result<Sample, StoreError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed {
            return None;
        }
        let raw = self.rows.next()?;
        let index = self.index;
        self.index += 1;
        match record::decode(&raw) {
            Ok(sample) => Some(Ok(sample)),
            Err(source) => {
                self.failed = true;
                Some(Err(StoreError::CorruptRecord {
                    device: self.device.clone(),
                    index,
                    source,
                }))
            }
        }
    }
}

/// Last stored sample per device, `None` while a device has no data
#[derive(Debug, Default)]
pub struct LastSamples {
    devices: BTreeMap<String, Option<Sample>>,
}

impl LastSamples {
    pub fn contains(&self, id: &str) -> bool {
        self.devices.contains_key(id)
    }

    pub fn add(&mut self, id: &str) -> Result<(), StoreError> {
        if self.contains(id) {
            return Err(StoreError::DuplicateDevice(id.to_string()));
        }
        self.devices.insert(id.to_string(), None);
        Ok(())
    }

    pub fn get(&self, id: &str) -> Result<Option<&Sample>, StoreError> {
        self.devices
            .get(id)
            .map(Option::as_ref)
            .ok_or_else(|| StoreError::NoSuchDevice(id.to_string()))
    }

    pub fn last(&self, id: &str) -> Result<Sample, StoreError> {
        self.get(id)?
            .cloned()
            .ok_or_else(|| StoreError::NoData(id.to_string()))
    }

    pub fn set(&mut self, id: &str, sample: Option<Sample>) {
        self.devices.insert(id.to_string(), sample);
    }

    pub fn ids(&self) -> Vec<String> {
        self.devices.keys().cloned().collect()
    }
}

/// Select the samples of `batch` that can be appended after `last`
///
/// Samples are taken in time order and each one must lie strictly after the
/// previously accepted one, outside the tolerance window.
pub fn fresh_samples(last: Option<&Sample>, mut batch: Vec<Sample>) -> Vec<Sample> {
    sort_by_time(&mut batch);

    let mut fresh: Vec<Sample> = Vec::with_capacity(batch.len());
    let mut last = last.cloned();
    for v in batch {
        let newer = last.as_ref().map_or(true, |l| l.is_before(&v));
        if newer {
            last = Some(v.clone());
            fresh.push(v);
        }
    }
    fresh
}
