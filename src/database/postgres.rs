/// PostgreSQL store backed by tokio-postgres
///
/// Samples are kept as the 17-byte record in `aranet4_samples`, keyed by
/// device and time. Connection and TLS handling live in `connection`.
use async_trait::async_trait;
use log::{debug, info};
use time::OffsetDateTime;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio_postgres::types::ToSql;
use tokio_postgres::Client;

use crate::database::connection::connect;
use crate::database::{fresh_samples, record, LastSamples, Samples, Store, StoreError};
use crate::models::Sample;
use crate::utils::bound;

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS aranet4_devices (
    id TEXT PRIMARY KEY
);
CREATE TABLE IF NOT EXISTS aranet4_samples (
    device TEXT NOT NULL REFERENCES aranet4_devices(id),
    time TIMESTAMPTZ NOT NULL,
    record BYTEA NOT NULL,
    PRIMARY KEY (device, time)
);
";

/// Range query over one device, with optional `time >= $n` and `time < $m`
fn range_query(has_beg: bool, has_end: bool) -> String {
    let mut query = String::from("SELECT record FROM aranet4_samples WHERE device = $1");
    let mut n = 1;
    if has_beg {
        n += 1;
        query.push_str(&format!(" AND time >= ${}", n));
    }
    if has_end {
        n += 1;
        query.push_str(&format!(" AND time < ${}", n));
    }
    query.push_str(" ORDER BY time ASC");
    query
}

struct Inner {
    client: Client,
    last: LastSamples,
}

pub struct PostgresStore {
    inner: RwLock<Inner>,
    connection: JoinHandle<()>,
}

impl PostgresStore {
    /// Connect, create the schema if needed and load each device's last sample
    pub async fn connect(database_url: &str, attempts: usize) -> Result<Self, StoreError> {
        let (client, connection) = connect(database_url, attempts).await?;
        client.batch_execute(SCHEMA).await?;

        let mut last = LastSamples::default();
        for row in client
            .query("SELECT id FROM aranet4_devices ORDER BY id", &[])
            .await?
        {
            let id: String = row.try_get(0)?;
            let newest = client
                .query_opt(
                    "SELECT record FROM aranet4_samples WHERE device = $1 ORDER BY time DESC LIMIT 1",
                    &[&id],
                )
                .await?;
            let sample = match newest {
                Some(row) => {
                    let raw: Vec<u8> = row.try_get(0)?;
                    Some(record::decode(&raw).map_err(|source| StoreError::CorruptRecord {
                        device: id.clone(),
                        index: 0,
                        source,
                    })?)
                }
                None => None,
            };
            last.add(&id)?;
            last.set(&id, sample);
        }

        info!("Opened PostgreSQL store with {} devices", last.ids().len());
        Ok(PostgresStore {
            inner: RwLock::new(Inner { client, last }),
            connection,
        })
    }
}

#[async_trait]
impl Store for PostgresStore {
    async fn put_data(&self, id: &str, batch: Vec<Sample>) -> Result<usize, StoreError> {
        let mut inner = self.inner.write().await;
        let fresh = fresh_samples(inner.last.get(id)?, batch);
        if fresh.is_empty() {
            debug!("No new samples for device {}", id);
            return Ok(0);
        }

        let mut records = Vec::with_capacity(fresh.len());
        for v in &fresh {
            let raw = record::encode(v).map_err(|source| StoreError::Encode {
                device: id.to_string(),
                source,
            })?;
            records.push(raw.to_vec());
        }

        let txn = inner.client.transaction().await?;
        let stmt = txn
            .prepare(
                "INSERT INTO aranet4_samples(device, time, record) VALUES ($1, $2, $3)
                 ON CONFLICT (device, time) DO NOTHING",
            )
            .await?;
        let mut written = 0;
        for (v, raw) in fresh.iter().zip(&records) {
            written += txn.execute(&stmt, &[&id, &v.time, raw]).await? as usize;
        }
        txn.commit().await?;

        info!("Wrote {} new samples for device {}", written, id);
        inner.last.set(id, fresh.into_iter().last());
        Ok(written)
    }

    async fn data(
        &self,
        id: &str,
        beg: Option<OffsetDateTime>,
        end: Option<OffsetDateTime>,
    ) -> Result<Samples, StoreError> {
        let inner = self.inner.read().await;
        if !inner.last.contains(id) {
            return Err(StoreError::NoSuchDevice(id.to_string()));
        }

        let beg = bound(beg);
        let end = bound(end);
        let mut params: Vec<&(dyn ToSql + Sync)> = vec![&id];
        if let Some(t) = &beg {
            params.push(t);
        }
        if let Some(t) = &end {
            params.push(t);
        }

        let query = range_query(beg.is_some(), end.is_some());
        let mut rows = Vec::new();
        for row in inner.client.query(query.as_str(), &params).await? {
            rows.push(row.try_get::<_, Vec<u8>>(0)?);
        }
        Ok(Samples::new(id, rows))
    }

    async fn last(&self, id: &str) -> Result<Sample, StoreError> {
        self.inner.read().await.last.last(id)
    }

    async fn add_device(&self, id: &str) -> Result<(), StoreError> {
        let mut inner = self.inner.write().await;
        if inner.last.contains(id) {
            return Err(StoreError::DuplicateDevice(id.to_string()));
        }

        inner
            .client
            .execute("INSERT INTO aranet4_devices(id) VALUES ($1)", &[&id])
            .await?;

        inner.last.add(id)?;
        info!("Added device {}", id);
        Ok(())
    }

    async fn devices(&self) -> Result<Vec<String>, StoreError> {
        Ok(self.inner.read().await.last.ids())
    }

    async fn close(self) -> Result<(), StoreError> {
        let PostgresStore { inner, connection } = self;
        drop(inner);
        connection
            .await
            .map_err(|e| StoreError::Connection(format!("connection task failed: {}", e)))?;
        debug!("Closed PostgreSQL store");
        Ok(())
    }
}
