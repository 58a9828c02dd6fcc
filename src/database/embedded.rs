/// Embedded key-value store backed by redb
///
/// Layout: one `device-ids` table listing known devices, and one table per
/// device mapping Unix seconds to the 17-byte sample record.
use async_trait::async_trait;
use log::{debug, info};
use redb::{Database, ReadableTable, TableDefinition};
use std::ops::Bound;
use std::path::Path;
use time::OffsetDateTime;
use tokio::sync::RwLock;

use crate::database::{fresh_samples, record, LastSamples, Samples, Store, StoreError};
use crate::models::Sample;
use crate::utils::{bound, ceil_unix_seconds};

const DEVICE_IDS: TableDefinition<&str, u64> = TableDefinition::new("device-ids");

type DataTable<'a> = TableDefinition<'a, u64, &'static [u8]>;

fn data_table_name(id: &str) -> String {
    format!("aranet4/{}", id)
}

trait ResultExt<T> {
    fn store(self) -> Result<T, StoreError>;
}

impl<T, E: Into<redb::Error>> ResultExt<T> for Result<T, E> {
    fn store(self) -> Result<T, StoreError> {
        self.map_err(|e| StoreError::Embedded(e.into()))
    }
}

pub struct EmbeddedStore {
    db: Database,
    last: RwLock<LastSamples>,
}

impl EmbeddedStore {
    /// Open or create the database file at `path`
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref();
        let db = Database::create(path).store()?;

        let txn = db.begin_write().store()?;
        txn.open_table(DEVICE_IDS).store()?;
        txn.commit().store()?;

        let mut cache = LastSamples::default();
        let txn = db.begin_read().store()?;
        let ids = txn.open_table(DEVICE_IDS).store()?;
        for entry in ids.iter().store()? {
            let (key, _) = entry.store()?;
            let id = key.value().to_string();

            let name = data_table_name(&id);
            let table = txn.open_table(DataTable::new(&name)).store()?;
            let last = match table.last().store()? {
                Some((_, raw)) => Some(record::decode(raw.value()).map_err(|source| {
                    StoreError::CorruptRecord {
                        device: id.clone(),
                        index: 0,
                        source,
                    }
                })?),
                None => None,
            };
            cache.add(&id)?;
            cache.set(&id, last);
        }

        info!(
            "Opened embedded store {} with {} devices",
            path.display(),
            cache.ids().len()
        );
        Ok(EmbeddedStore {
            db,
            last: RwLock::new(cache),
        })
    }
}

#[async_trait]
impl Store for EmbeddedStore {
    async fn put_data(&self, id: &str, batch: Vec<Sample>) -> Result<usize, StoreError> {
        let mut cache = self.last.write().await;
        let fresh = fresh_samples(cache.get(id)?, batch);
        if fresh.is_empty() {
            debug!("No new samples for device {}", id);
            return Ok(0);
        }

        let txn = self.db.begin_write().store()?;
        {
            let name = data_table_name(id);
            let mut table = txn.open_table(DataTable::new(&name)).store()?;
            for v in &fresh {
                let raw = record::encode(v).map_err(|source| StoreError::Encode {
                    device: id.to_string(),
                    source,
                })?;
                table
                    .insert(v.time.unix_timestamp() as u64, &raw[..])
                    .store()?;
            }
        }
        txn.commit().store()?;

        info!("Wrote {} new samples for device {}", fresh.len(), id);
        let count = fresh.len();
        cache.set(id, fresh.into_iter().last());
        Ok(count)
    }

    async fn data(
        &self,
        id: &str,
        beg: Option<OffsetDateTime>,
        end: Option<OffsetDateTime>,
    ) -> Result<Samples, StoreError> {
        let cache = self.last.read().await;
        if !cache.contains(id) {
            return Err(StoreError::NoSuchDevice(id.to_string()));
        }

        // Keys are whole seconds, so both bounds round up
        let lo = match bound(beg) {
            Some(t) => Bound::Included(ceil_unix_seconds(t).max(0) as u64),
            None => Bound::Unbounded,
        };
        let hi = match bound(end) {
            Some(t) => Bound::Excluded(ceil_unix_seconds(t).max(0) as u64),
            None => Bound::Unbounded,
        };
        if let (Bound::Included(lo), Bound::Excluded(hi)) = (lo, hi) {
            if lo >= hi {
                return Ok(Samples::new(id, Vec::new()));
            }
        }

        let txn = self.db.begin_read().store()?;
        let name = data_table_name(id);
        let table = txn.open_table(DataTable::new(&name)).store()?;
        let mut rows = Vec::new();
        for entry in table.range((lo, hi)).store()? {
            let (_, raw) = entry.store()?;
            rows.push(raw.value().to_vec());
        }
        Ok(Samples::new(id, rows))
    }

    async fn last(&self, id: &str) -> Result<Sample, StoreError> {
        self.last.read().await.last(id)
    }

    async fn add_device(&self, id: &str) -> Result<(), StoreError> {
        let mut cache = self.last.write().await;
        if cache.contains(id) {
            return Err(StoreError::DuplicateDevice(id.to_string()));
        }

        let txn = self.db.begin_write().store()?;
        {
            let mut ids = txn.open_table(DEVICE_IDS).store()?;
            let added = OffsetDateTime::now_utc().unix_timestamp().max(0) as u64;
            ids.insert(id, added).store()?;

            let name = data_table_name(id);
            txn.open_table(DataTable::new(&name)).store()?;
        }
        txn.commit().store()?;

        cache.add(id)?;
        info!("Added device {}", id);
        Ok(())
    }

    async fn devices(&self) -> Result<Vec<String>, StoreError> {
        Ok(self.last.read().await.ids())
    }

    async fn close(self) -> Result<(), StoreError> {
        drop(self.db);
        debug!("Closed embedded store");
        Ok(())
    }
}
