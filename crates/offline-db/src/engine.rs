use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use sqlx::migrate::MigrateDatabase;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous};
use sqlx::{Row, Sqlite, SqlitePool};
use std::str::FromStr;
use std::time::Duration;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::DbError;
use crate::retry::retry_on_sqlite_busy;

/// Tracks one in-flight database operation so [`DbEngine::destroy`] can wait
/// for all outstanding work to settle before closing the pool.
struct InFlightGuard<'a> {
    count: &'a AtomicUsize,
    notify: &'a Notify,
}

impl<'a> InFlightGuard<'a> {
    fn new(count: &'a AtomicUsize, notify: &'a Notify) -> Self {
        count.fetch_add(1, Ordering::SeqCst);
        Self { count, notify }
    }
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        if self.count.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.notify.notify_waiters();
        }
    }
}

/// A transactional local key-value store, scoped to a fixed set of named
/// stores declared at [`DbEngine::init`] time.
///
/// Each store is a SQLite table `(id INTEGER PRIMARY KEY, value BLOB NOT
/// NULL)`. Store names are validated as SQL identifiers at `init` time since
/// table names cannot be bound as query parameters.
pub struct DbEngine {
    pool: SqlitePool,
    /// store name -> key path, as declared by the caller's schema. The key
    /// path itself is opaque to this engine: callers are expected to supply
    /// the numeric key explicitly (see [`DbEngine::insert`]) rather than have
    /// it extracted from the value, since values here are opaque blobs.
    schema: HashMap<String, String>,
    next_id: Mutex<HashMap<String, u64>>,
    retry_count: u32,
    token: CancellationToken,
    in_flight: AtomicUsize,
    settle: Notify,
}

fn is_valid_store_name(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    !name.is_empty() && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

impl DbEngine {
    /// Open (creating if missing) the database at `database_url`, ensure a
    /// table exists for every store in `schema`, and compute each store's
    /// `nextId` as `max(existing key) + 1` (default `1`).
    ///
    /// `retry_count` bounds retries-on-busy for every subsequent operation.
    pub async fn init(
        database_url: &str,
        schema: HashMap<String, String>,
        retry_count: u32,
    ) -> Result<Self, DbError> {
        for name in schema.keys() {
            if !is_valid_store_name(name) {
                return Err(DbError::InvalidStoreName(name.clone()));
            }
        }

        if !Sqlite::database_exists(database_url).await.unwrap_or(false) {
            Sqlite::create_database(database_url).await?;
        }

        let connect_options = SqliteConnectOptions::from_str(database_url)?
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .busy_timeout(Duration::from_millis(5000))
            .foreign_keys(true)
            .create_if_missing(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(10)
            .acquire_timeout(Duration::from_secs(30))
            .connect_with(connect_options)
            .await?;

        for name in schema.keys() {
            sqlx::query(&format!(
                "CREATE TABLE IF NOT EXISTS \"{name}\" (id INTEGER PRIMARY KEY, value BLOB NOT NULL)"
            ))
            .execute(&pool)
            .await?;
        }

        let mut next_id = HashMap::with_capacity(schema.len());
        for name in schema.keys() {
            let row = sqlx::query(&format!("SELECT MAX(id) AS max_id FROM \"{name}\""))
                .fetch_one(&pool)
                .await?;
            let max_id: Option<i64> = row.try_get("max_id")?;
            next_id.insert(name.clone(), max_id.map(|m| (m + 1) as u64).unwrap_or(1));
        }

        info!(stores = schema.len(), "DbEngine initialized");

        Ok(Self {
            pool,
            schema,
            next_id: Mutex::new(next_id),
            retry_count,
            token: CancellationToken::new(),
            in_flight: AtomicUsize::new(0),
            settle: Notify::new(),
        })
    }

    fn check_store(&self, store: &str) -> Result<(), DbError> {
        if !self.schema.contains_key(store) {
            return Err(DbError::UnknownStore(store.to_string()));
        }
        Ok(())
    }

    fn check_alive(&self) -> Result<(), DbError> {
        if self.token.is_cancelled() {
            return Err(DbError::OperationAborted);
        }
        Ok(())
    }

    /// Insert `value` at `key` in `store`, inside its own `readwrite`
    /// transaction. Resolves once the transaction commits; rejects with
    /// [`DbError::OperationAborted`] if [`DbEngine::destroy`] is racing this
    /// call.
    pub async fn insert(&self, store: &str, key: u64, value: Vec<u8>) -> Result<(), DbError> {
        self.check_alive()?;
        self.check_store(store)?;
        let _guard = InFlightGuard::new(&self.in_flight, &self.settle);

        retry_on_sqlite_busy("insert", self.retry_count, || {
            let pool = self.pool.clone();
            let value = value.clone();
            let store = store.to_string();
            let token = self.token.clone();
            async move {
                if token.is_cancelled() {
                    return Err(DbError::OperationAborted);
                }
                let mut tx = pool.begin().await?;
                sqlx::query(&format!(
                    "INSERT INTO \"{store}\" (id, value) VALUES (?, ?)"
                ))
                .bind(key as i64)
                .bind(value)
                .execute(&mut *tx)
                .await?;
                tx.commit().await?;
                Ok(())
            }
        })
        .await
    }

    /// Read the value stored at `key` in `store`, or `None` if absent.
    pub async fn get(&self, store: &str, key: u64) -> Result<Option<Vec<u8>>, DbError> {
        self.check_alive()?;
        self.check_store(store)?;
        let _guard = InFlightGuard::new(&self.in_flight, &self.settle);

        let row = sqlx::query(&format!("SELECT value FROM \"{store}\" WHERE id = ?"))
            .bind(key as i64)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|r| r.get::<Vec<u8>, _>("value")))
    }

    /// Delete the record at `key` in `store`, if present.
    pub async fn remove(&self, store: &str, key: u64) -> Result<(), DbError> {
        self.remove_keys(store, &[key]).await
    }

    /// Delete every record in `keys` from `store`.
    pub async fn remove_keys(&self, store: &str, keys: &[u64]) -> Result<(), DbError> {
        self.check_alive()?;
        self.check_store(store)?;
        if keys.is_empty() {
            return Ok(());
        }
        let _guard = InFlightGuard::new(&self.in_flight, &self.settle);

        retry_on_sqlite_busy("remove_keys", self.retry_count, || {
            let pool = self.pool.clone();
            let store = store.to_string();
            let keys = keys.to_vec();
            let token = self.token.clone();
            async move {
                if token.is_cancelled() {
                    return Err(DbError::OperationAborted);
                }
                let mut tx = pool.begin().await?;
                for key in &keys {
                    sqlx::query(&format!("DELETE FROM \"{store}\" WHERE id = ?"))
                        .bind(*key as i64)
                        .execute(&mut *tx)
                        .await?;
                }
                tx.commit().await?;
                Ok(())
            }
        })
        .await
    }

    /// Invoke `cb` once per record in `store`, ordered by key ascending.
    pub async fn for_each(
        &self,
        store: &str,
        mut cb: impl FnMut(u64, Vec<u8>),
    ) -> Result<(), DbError> {
        self.check_alive()?;
        self.check_store(store)?;
        let _guard = InFlightGuard::new(&self.in_flight, &self.settle);

        let rows = sqlx::query(&format!("SELECT id, value FROM \"{store}\" ORDER BY id ASC"))
            .fetch_all(&self.pool)
            .await?;
        for row in rows {
            let id: i64 = row.get("id");
            let value: Vec<u8> = row.get("value");
            cb(id as u64, value);
        }
        Ok(())
    }

    /// Return the next unused integer key for `store`, incrementing the
    /// in-memory counter. Purely in-memory after `init` — never touches the
    /// database.
    pub fn reserve_id(&self, store: &str) -> Result<u64, DbError> {
        self.check_store(store)?;
        let mut next_id = self.next_id.lock().unwrap();
        let entry = next_id.entry(store.to_string()).or_insert(1);
        let id = *entry;
        *entry += 1;
        Ok(id)
    }

    /// Abort every in-flight transaction (new ones started before the abort
    /// is observed will surface [`DbError::OperationAborted`] once they
    /// notice), wait for outstanding operations to settle, then close the
    /// pool.
    pub async fn destroy(&self) {
        self.token.cancel();
        // `notified()` must be created before the count check: it latches
        // any `notify_waiters()` call that happens between that point and
        // the `.await` below, so a guard's `Drop` racing this loop can't
        // drop to zero, call `notify_waiters()`, and leave this parked
        // waiting for a wakeup that already passed.
        loop {
            let notified = self.settle.notified();
            if self.in_flight.load(Ordering::SeqCst) == 0 {
                break;
            }
            notified.await;
        }
        self.pool.close().await;
        debug!("DbEngine destroyed");
    }

    /// Delete the database at `database_url` entirely. Blocks until other
    /// connections to it have closed, matching the static
    /// `deleteDatabase()` semantics.
    pub async fn delete_database(database_url: &str) -> Result<(), DbError> {
        if Sqlite::database_exists(database_url).await.unwrap_or(false) {
            Sqlite::drop_database(database_url).await?;
        } else {
            warn!(url = database_url, "delete_database: database did not exist");
        }
        Ok(())
    }
}
