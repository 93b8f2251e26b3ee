//! Persistent connection history and geolocation cache
//!
//! Everything lives in one SQLite database. Every operation opens its own connection on the
//! blocking thread pool and drops it when done, so no handle outlives a failed cycle.

use std::{
    collections::HashSet,
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{Connection, OptionalExtension, Row, Transaction, named_params};
use serde::Serialize;
use thiserror::Error;
use tracing::debug;

use crate::geo::GeoLocation;

/// How long a connection waits on a locked database before giving up.
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Tables and indices. Column layout is shared with the dashboard, so don't change it.
const SCHEMA: &str = "
    PRAGMA journal_mode = WAL;

    CREATE TABLE IF NOT EXISTS connections (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        client_ip TEXT NOT NULL,
        ssrc INTEGER NOT NULL,
        freq_range TEXT,
        frequency INTEGER,
        center_frequency INTEGER,
        bins INTEGER,
        bin_width INTEGER,
        audio_active INTEGER DEFAULT 0,
        first_seen TEXT NOT NULL,
        last_seen TEXT NOT NULL,
        disconnected_at TEXT,
        geo_city TEXT,
        geo_country TEXT
    );
    CREATE INDEX IF NOT EXISTS idx_conn_active
        ON connections(client_ip, ssrc, disconnected_at);

    CREATE TABLE IF NOT EXISTS geo_cache (
        ip TEXT PRIMARY KEY,
        city TEXT,
        country TEXT,
        looked_up_at TEXT NOT NULL
    );
";

/// Timestamps are stored as RFC 3339 text with a `T` separator and microseconds, so that rows
/// written by ka9q-web's own admin service sort correctly next to ours.
fn timestamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, false)
}

/// Errors from the persistence layer
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("sqlite: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("database task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
    #[error("cannot create database directory: {0}")]
    Io(#[from] std::io::Error),
}

/// Identity of a receiver session: who is connected and which stream they have.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct SessionKey {
    pub client_ip: String,
    pub ssrc: i64,
}

/// Live state of a session as seen in one snapshot.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Observation {
    pub key: SessionKey,
    pub freq_range: String,
    pub frequency: i64,
    pub center_frequency: i64,
    pub bins: u32,
    pub bin_width: u32,
    pub audio_active: bool,
}

/// A row of the `connections` table.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct ConnectionRecord {
    pub id: i64,
    pub client_ip: String,
    pub ssrc: i64,
    pub freq_range: Option<String>,
    pub frequency: Option<i64>,
    pub center_frequency: Option<i64>,
    pub bins: Option<u32>,
    pub bin_width: Option<u32>,
    pub audio_active: bool,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    /// `None` while the session is still active
    pub disconnected_at: Option<DateTime<Utc>>,
    pub geo_city: Option<String>,
    pub geo_country: Option<String>,
}

impl ConnectionRecord {
    /// Read a record out of a `SELECT *` row.
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(ConnectionRecord {
            id: row.get("id")?,
            client_ip: row.get("client_ip")?,
            ssrc: row.get("ssrc")?,
            freq_range: row.get("freq_range")?,
            frequency: row.get("frequency")?,
            center_frequency: row.get("center_frequency")?,
            bins: row.get("bins")?,
            bin_width: row.get("bin_width")?,
            audio_active: row.get::<_, Option<bool>>("audio_active")?.unwrap_or(false),
            first_seen: row.get("first_seen")?,
            last_seen: row.get("last_seen")?,
            disconnected_at: row.get("disconnected_at")?,
            geo_city: row.get("geo_city")?,
            geo_country: row.get("geo_country")?,
        })
    }
}

/// Handle to the database file.
///
/// Cheap to clone. The poller is the only component that writes through it; everything else
/// just reads.
#[derive(Clone, Debug)]
pub struct Store {
    /// Location of the SQLite database
    path: Arc<Path>,
}

impl Store {
    /// Open the database at `path`, creating the file and schema if needed.
    pub async fn open(path: PathBuf) -> Result<Store, StoreError> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }
        let store = Store {
            path: Arc::from(path),
        };
        store
            .run(|conn| {
                conn.execute_batch(SCHEMA)?;
                Ok(())
            })
            .await?;
        debug!(path = %store.path.display(), "Database ready");
        Ok(store)
    }

    /// Path of the database file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Open a fresh connection to the database.
    fn connect(&self) -> Result<Connection, StoreError> {
        let conn = Connection::open(&self.path)?;
        conn.busy_timeout(BUSY_TIMEOUT)?;
        Ok(conn)
    }

    /// Run `f` against a new connection on the blocking thread pool.
    async fn run<T, F>(&self, f: F) -> Result<T, StoreError>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> Result<T, StoreError> + Send + 'static,
    {
        let store = self.clone();
        tokio::task::spawn_blocking(move || {
            let mut conn = store.connect()?;
            f(&mut conn)
        })
        .await?
    }

    /// Run `f` inside a single transaction, committing only if it succeeds.
    ///
    /// Readers see either everything `f` wrote or none of it.
    pub async fn write<T, F>(&self, f: F) -> Result<T, StoreError>
    where
        T: Send + 'static,
        F: FnOnce(&Writer<'_>) -> Result<T, StoreError> + Send + 'static,
    {
        self.run(|conn| {
            let tx = conn.transaction()?;
            let result = f(&Writer { tx: &tx })?;
            tx.commit()?;
            Ok(result)
        })
        .await
    }

    /// Keys of every connection that hasn't been closed.
    pub async fn active_keys(&self) -> Result<HashSet<SessionKey>, StoreError> {
        self.run(|conn| {
            let mut stmt = conn.prepare(
                "SELECT client_ip, ssrc FROM connections WHERE disconnected_at IS NULL",
            )?;
            let keys = stmt
                .query_map([], |row| {
                    Ok(SessionKey {
                        client_ip: row.get(0)?,
                        ssrc: row.get(1)?,
                    })
                })?
                .collect::<Result<_, _>>()?;
            Ok(keys)
        })
        .await
    }

    /// Active connections, newest first.
    pub async fn active_connections(&self) -> Result<Vec<ConnectionRecord>, StoreError> {
        self.run(|conn| {
            let mut stmt = conn.prepare(
                "SELECT * FROM connections WHERE disconnected_at IS NULL
                 ORDER BY first_seen DESC",
            )?;
            let rows = stmt
                .query_map([], ConnectionRecord::from_row)?
                .collect::<Result<_, _>>()?;
            Ok(rows)
        })
        .await
    }

    /// Up to `limit` closed connections, most recently disconnected first.
    pub async fn closed_connections(
        &self,
        limit: u32,
    ) -> Result<Vec<ConnectionRecord>, StoreError> {
        self.run(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT * FROM connections WHERE disconnected_at IS NOT NULL
                 ORDER BY disconnected_at DESC, id DESC LIMIT ?1",
            )?;
            let rows = stmt
                .query_map([limit], ConnectionRecord::from_row)?
                .collect::<Result<_, _>>()?;
            Ok(rows)
        })
        .await
    }

    /// Look up a cached geolocation result.
    ///
    /// The outer `Option` is whether the IP was ever looked up; the cached location itself may be
    /// empty.
    pub async fn cached_location(&self, ip: &str) -> Result<Option<GeoLocation>, StoreError> {
        let ip = ip.to_owned();
        self.run(move |conn| {
            let location = conn
                .query_row(
                    "SELECT city, country FROM geo_cache WHERE ip = ?1",
                    [ip],
                    |row| {
                        Ok(GeoLocation {
                            city: row.get(0)?,
                            country: row.get(1)?,
                        })
                    },
                )
                .optional()?;
            Ok(location)
        })
        .await
    }

    /// Remember the geolocation result for an IP.
    ///
    /// Cache entries are written once. Returns `false` if the IP already had an entry, in which
    /// case the existing one is kept.
    pub async fn cache_location(
        &self,
        ip: &str,
        location: &GeoLocation,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let ip = ip.to_owned();
        let location = location.clone();
        self.run(move |conn| {
            let inserted = conn.execute(
                "INSERT INTO geo_cache (ip, city, country, looked_up_at)
                 VALUES (:ip, :city, :country, :now)
                 ON CONFLICT(ip) DO NOTHING",
                named_params! {
                    ":ip": ip,
                    ":city": location.city,
                    ":country": location.country,
                    ":now": timestamp(now),
                },
            )?;
            Ok(inserted > 0)
        })
        .await
    }
}

/// Write access to the `connections` table within one transaction.
pub struct Writer<'a> {
    /// The open transaction
    tx: &'a Transaction<'a>,
}

impl Writer<'_> {
    /// Ids and keys of every connection that hasn't been closed.
    pub fn active(&self) -> Result<Vec<(i64, SessionKey)>, StoreError> {
        let mut stmt = self.tx.prepare_cached(
            "SELECT id, client_ip, ssrc FROM connections WHERE disconnected_at IS NULL",
        )?;
        let rows = stmt
            .query_map([], |row| {
                Ok((
                    row.get(0)?,
                    SessionKey {
                        client_ip: row.get(1)?,
                        ssrc: row.get(2)?,
                    },
                ))
            })?
            .collect::<Result<_, _>>()?;
        Ok(rows)
    }

    /// Id of the active connection for `key`, if there is one.
    pub fn find_active(&self, key: &SessionKey) -> Result<Option<i64>, StoreError> {
        let mut stmt = self.tx.prepare_cached(
            "SELECT id FROM connections
             WHERE client_ip = ?1 AND ssrc = ?2 AND disconnected_at IS NULL",
        )?;
        let id = stmt
            .query_row((&key.client_ip, key.ssrc), |row| row.get(0))
            .optional()?;
        Ok(id)
    }

    /// Record a newly seen session. Returns the new row id.
    pub fn insert(
        &self,
        observation: &Observation,
        location: &GeoLocation,
        now: DateTime<Utc>,
    ) -> Result<i64, StoreError> {
        let mut stmt = self.tx.prepare_cached(
            "INSERT INTO connections (
                client_ip, ssrc, freq_range, frequency, center_frequency, bins, bin_width,
                audio_active, first_seen, last_seen, geo_city, geo_country
             ) VALUES (
                :client_ip, :ssrc, :freq_range, :frequency, :center_frequency, :bins, :bin_width,
                :audio_active, :now, :now, :geo_city, :geo_country
             )",
        )?;
        stmt.execute(named_params! {
            ":client_ip": observation.key.client_ip,
            ":ssrc": observation.key.ssrc,
            ":freq_range": observation.freq_range,
            ":frequency": observation.frequency,
            ":center_frequency": observation.center_frequency,
            ":bins": observation.bins,
            ":bin_width": observation.bin_width,
            ":audio_active": observation.audio_active,
            ":now": timestamp(now),
            ":geo_city": location.city,
            ":geo_country": location.country,
        })?;
        Ok(self.tx.last_insert_rowid())
    }

    /// Refresh the live fields of an active connection.
    pub fn refresh(
        &self,
        id: i64,
        observation: &Observation,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let mut stmt = self.tx.prepare_cached(
            "UPDATE connections SET
                last_seen = :now,
                frequency = :frequency,
                center_frequency = :center_frequency,
                freq_range = :freq_range,
                bins = :bins,
                bin_width = :bin_width,
                audio_active = :audio_active
             WHERE id = :id",
        )?;
        stmt.execute(named_params! {
            ":now": timestamp(now),
            ":frequency": observation.frequency,
            ":center_frequency": observation.center_frequency,
            ":freq_range": observation.freq_range,
            ":bins": observation.bins,
            ":bin_width": observation.bin_width,
            ":audio_active": observation.audio_active,
            ":id": id,
        })?;
        Ok(())
    }

    /// Mark a connection as disconnected.
    pub fn close(&self, id: i64, now: DateTime<Utc>) -> Result<(), StoreError> {
        let mut stmt = self.tx.prepare_cached(
            "UPDATE connections SET disconnected_at = ?1
             WHERE id = ?2 AND disconnected_at IS NULL",
        )?;
        stmt.execute((timestamp(now), id))?;
        Ok(())
    }

    /// Delete all closed connections except the `keep` most recently disconnected ones.
    ///
    /// Returns how many rows were deleted.
    pub fn prune_closed(&self, keep: u32) -> Result<usize, StoreError> {
        let deleted = self.tx.execute(
            "DELETE FROM connections WHERE disconnected_at IS NOT NULL AND id NOT IN (
                SELECT id FROM connections WHERE disconnected_at IS NOT NULL
                ORDER BY disconnected_at DESC, id DESC LIMIT ?1
             )",
            [keep],
        )?;
        Ok(deleted)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use chrono::{DateTime, Duration, Utc};
    use pretty_assertions::assert_eq;
    use tempfile::TempDir;

    use super::{Observation, SessionKey, Store};
    use crate::geo::GeoLocation;

    /// Make a timestamp `secs` seconds after a fixed epoch
    pub(crate) fn t(secs: i64) -> DateTime<Utc> {
        DateTime::from_timestamp(1_760_000_000, 0).unwrap() + Duration::seconds(secs)
    }

    /// Open a fresh store in a temporary directory. Keep the directory alive for the test.
    pub(crate) async fn temp_store() -> (TempDir, Store) {
        let dir = TempDir::new().unwrap();
        let store = Store::open(dir.path().join("nested/watch.db")).await.unwrap();
        (dir, store)
    }

    /// An observation with plausible tuning fields
    fn observation(ip: &str, ssrc: i64) -> Observation {
        Observation {
            key: SessionKey {
                client_ip: ip.to_owned(),
                ssrc,
            },
            freq_range: "40m".to_owned(),
            frequency: 7_074_000,
            center_frequency: 7_100_000,
            bins: 1620,
            bin_width: 100,
            audio_active: false,
        }
    }

    #[tokio::test]
    async fn test_open_is_idempotent() {
        let (dir, store) = temp_store().await;
        store
            .write(|w| w.insert(&observation("192.0.2.1", 1), &GeoLocation::default(), t(0)))
            .await
            .unwrap();

        let reopened = Store::open(store.path().to_owned()).await.unwrap();
        assert_eq!(reopened.active_connections().await.unwrap().len(), 1);
        drop(dir);
    }

    #[tokio::test]
    async fn test_geo_cache_is_write_once() {
        let (_dir, store) = temp_store().await;
        assert_eq!(store.cached_location("198.51.100.4").await.unwrap(), None);

        let empty = GeoLocation::default();
        assert!(store.cache_location("198.51.100.4", &empty, t(0)).await.unwrap());
        let paris = GeoLocation {
            city: Some("Paris".to_owned()),
            country: Some("FR".to_owned()),
        };
        assert!(!store.cache_location("198.51.100.4", &paris, t(1)).await.unwrap());

        assert_eq!(
            store.cached_location("198.51.100.4").await.unwrap(),
            Some(empty)
        );
    }

    #[tokio::test]
    async fn test_failed_write_is_rolled_back() {
        let (_dir, store) = temp_store().await;
        let result = store
            .write(|w| {
                w.insert(&observation("192.0.2.1", 1), &GeoLocation::default(), t(0))?;
                Err::<(), _>(rusqlite::Error::InvalidQuery.into())
            })
            .await;
        assert!(result.is_err());
        assert!(store.active_connections().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_queries_and_pruning() {
        let (_dir, store) = temp_store().await;
        store
            .write(|w| {
                for ssrc in 0..5 {
                    let id = w.insert(
                        &observation("192.0.2.1", ssrc),
                        &GeoLocation::default(),
                        t(ssrc),
                    )?;
                    if ssrc < 3 {
                        w.close(id, t(100 + ssrc))?;
                    }
                }
                Ok(())
            })
            .await
            .unwrap();

        let active = store.active_connections().await.unwrap();
        assert_eq!(active.iter().map(|c| c.ssrc).collect::<Vec<_>>(), vec![4, 3]);
        let keys = store.active_keys().await.unwrap();
        assert_eq!(keys.len(), 2);
        assert!(keys.contains(&SessionKey {
            client_ip: "192.0.2.1".to_owned(),
            ssrc: 4,
        }));

        let closed = store.closed_connections(10).await.unwrap();
        assert_eq!(closed.iter().map(|c| c.ssrc).collect::<Vec<_>>(), vec![2, 1, 0]);
        assert_eq!(closed[0].disconnected_at, Some(t(102)));
        assert_eq!(store.closed_connections(1).await.unwrap().len(), 1);

        let deleted = store.write(|w| w.prune_closed(2)).await.unwrap();
        assert_eq!(deleted, 1);
        let closed = store.closed_connections(10).await.unwrap();
        assert_eq!(closed.iter().map(|c| c.ssrc).collect::<Vec<_>>(), vec![2, 1]);
        assert_eq!(store.active_connections().await.unwrap().len(), 2);

        assert_eq!(store.write(|w| w.prune_closed(0)).await.unwrap(), 2);
        assert!(store.closed_connections(10).await.unwrap().is_empty());
        assert_eq!(store.active_connections().await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_rows_from_admin_service_sort_by_time() {
        let (_dir, store) = temp_store().await;
        store
            .write(|w| {
                // Written by ka9q-web's admin service: `T` separator, no fractional seconds
                w.tx.execute(
                    "INSERT INTO connections (client_ip, ssrc, first_seen, last_seen, disconnected_at)
                     VALUES ('192.0.2.50', 9, ?1, ?1, ?1)",
                    [t(0).to_rfc3339()],
                )?;
                let id = w.insert(&observation("192.0.2.51", 10), &GeoLocation::default(), t(30))?;
                w.close(id, t(60))?;
                Ok(())
            })
            .await
            .unwrap();

        let closed = store.closed_connections(10).await.unwrap();
        assert_eq!(
            closed.iter().map(|c| c.disconnected_at).collect::<Vec<_>>(),
            vec![Some(t(60)), Some(t(0))]
        );

        assert_eq!(store.write(|w| w.prune_closed(1)).await.unwrap(), 1);
        let closed = store.closed_connections(10).await.unwrap();
        assert_eq!(closed.len(), 1);
        assert_eq!(closed[0].client_ip, "192.0.2.51");
    }
}
