use crate::config::StoreConfig;
use crate::error::{Result, StoreError};
use crate::objects::{self, NEWEST_FIRST, OBJECTS_TABLE};
use crate::options::{self, StoreOption};
use crate::query::{query_modifiers, Query};
use crate::record::{self, Record};
use rusqlite::Connection;
use std::any::Any;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

/// Shared handle to the underlying SQLite connection.
pub type Conn = Arc<Mutex<Connection>>;

/// Finalizer handed to a transaction body.
pub type CommitFn<'a> = &'a dyn Fn() -> Result<()>;
pub type RollbackFn<'a> = &'a dyn Fn() -> Result<()>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxState {
    Open,
    Committed,
    RolledBack,
}

impl fmt::Display for TxState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TxState::Open => write!(f, "open"),
            TxState::Committed => write!(f, "committed"),
            TxState::RolledBack => write!(f, "rolled back"),
        }
    }
}

/// The record store.
///
/// Clones share the same connection (and transaction, for handles returned
/// by [`Store::begin`]). Use [`Store::new_db`] for an independent handle.
#[derive(Debug, Clone)]
pub struct Store {
    config: StoreConfig,
    conn: Option<Conn>,
    tx: Option<Arc<Mutex<TxState>>>,
}

impl Store {
    /// Create an unconnected store. Call [`Store::connect`] before use.
    pub fn new(config: StoreConfig) -> Self {
        Store {
            config,
            conn: None,
            tx: None,
        }
    }

    /// Create a store and connect with the configured retry policy.
    pub fn open(config: StoreConfig) -> Result<Self> {
        let mut store = Store::new(config);
        let (delay, retries) = (
            store.config.connect_retry_delay(),
            store.config.connect_retries,
        );
        store.connect(delay, retries)?;
        Ok(store)
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    /// Stop logging individual statements.
    pub fn no_logging(&mut self) {
        self.config.log_queries = false;
    }

    // ── Connection Lifecycle ─────────────────────────────────────────

    /// Open the configured database, making up to `retries` attempts
    /// (at least one) with `retry_delay` between them.
    pub fn connect(&mut self, retry_delay: Duration, retries: u32) -> Result<()> {
        let attempts = retries.max(1);
        let mut last_err = String::new();

        for attempt in 1..=attempts {
            match self.open_connection() {
                Ok(conn) => {
                    log::info!("Connected to {}", self.config.connection_string);
                    self.conn = Some(Arc::new(Mutex::new(conn)));
                    self.tx = None;
                    return Ok(());
                }
                Err(e) => {
                    log::warn!(
                        "Connection attempt {attempt}/{attempts} to {} failed: {e}",
                        self.config.connection_string
                    );
                    last_err = e.to_string();
                    if attempt < attempts {
                        std::thread::sleep(retry_delay);
                    }
                }
            }
        }

        Err(StoreError::Connection(format!(
            "failed to connect to {} after {attempts} attempt(s): {last_err}",
            self.config.connection_string
        )))
    }

    fn open_connection(&self) -> Result<Connection> {
        let conn = Connection::open(&self.config.connection_string)
            .map_err(|e| StoreError::Connection(e.to_string()))?;
        conn.busy_timeout(self.config.busy_timeout())?;
        let _mode: String = conn.pragma_update_and_check(
            None,
            "journal_mode",
            self.config.journal_mode.as_str(),
            |row| row.get(0),
        )?;
        // Opening is lazy; probe so a bad path fails here.
        conn.query_row("SELECT 1", [], |row| row.get::<_, i64>(0))
            .map_err(|e| StoreError::Connection(e.to_string()))?;
        Ok(conn)
    }

    pub fn is_connected(&self) -> bool {
        self.conn.is_some()
    }

    pub fn get_conn(&self) -> Option<Conn> {
        self.conn.clone()
    }

    /// Replace the underlying connection. Accepts a boxed
    /// `rusqlite::Connection` or a shared [`Conn`].
    pub fn set_conn(&mut self, conn: Box<dyn Any + Send>) -> Result<()> {
        let conn = match conn.downcast::<Connection>() {
            Ok(conn) => Arc::new(Mutex::new(*conn)),
            Err(other) => match other.downcast::<Conn>() {
                Ok(shared) => *shared,
                Err(_) => {
                    return Err(StoreError::TypeMismatch(
                        "connection type not supported. Requires rusqlite::Connection".into(),
                    ))
                }
            },
        };
        self.conn = Some(conn);
        self.tx = None;
        Ok(())
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>> {
        let conn = self.conn.as_ref().ok_or(StoreError::NotConnected)?;
        conn.lock()
            .map_err(|_| StoreError::Connection("connection lock poisoned".into()))
    }

    fn with_conn<T>(&self, f: impl FnOnce(&Connection) -> Result<T>) -> Result<T> {
        let guard = self.lock()?;
        f(&guard)
    }

    fn log_sql(&self, sql: &str, args: usize) {
        if self.config.log_queries {
            log::debug!("[sql] {sql} ({args} args)");
        }
    }

    // ── Schema ───────────────────────────────────────────────────────

    /// Ensure the objects table and its indexes exist.
    pub fn create_tables(&self) -> Result<()> {
        self.with_conn(|conn| {
            objects::create_tables(conn)?;
            log::info!("Ensured table '{OBJECTS_TABLE}' exists");
            Ok(())
        })
    }

    pub fn has_table(&self, name: &str) -> Result<bool> {
        self.with_conn(|conn| objects::has_table(conn, name))
    }

    /// Delete all rows from the objects table.
    pub fn truncate_tables(&self) -> Result<()> {
        self.with_conn(|conn| {
            let removed = objects::truncate(conn)?;
            log::info!("Truncated '{OBJECTS_TABLE}' ({removed} rows)");
            Ok(())
        })
    }

    pub fn get_valid_object_fields(&self) -> Vec<&'static str> {
        record::valid_fields()
    }

    // ── Option Resolution ────────────────────────────────────────────

    /// Resolve the handle a call runs on and whether it must be finalized
    /// by the callee. See [`options::resolve`].
    pub fn db_tx_from_options(
        &self,
        opts: &[StoreOption],
        fallback: Option<&Store>,
    ) -> (Option<Store>, bool) {
        options::resolve(opts, fallback)
    }

    /// Run `op` on the handle selected by `opts` (this store by default),
    /// finalizing it afterwards when the option asks for it.
    fn run_with_options<T>(
        &self,
        opts: &[StoreOption],
        op: impl FnOnce(&Store) -> Result<T>,
    ) -> Result<T> {
        let (resolved, finish) = self.db_tx_from_options(opts, None);
        let db = resolved.as_ref().unwrap_or(self);
        if finish && db.tx_state() != Some(TxState::Open) {
            return Err(StoreError::TransactionState(
                "finishing option needs a handle with an open transaction".into(),
            ));
        }
        let result = op(db);

        if finish {
            match &result {
                Ok(_) => db.commit()?,
                Err(e) => {
                    log::warn!("Call failed, rolling back: {e}");
                    if let Err(rb) = db.rollback() {
                        log::warn!("Rollback failed: {rb}");
                    }
                }
            }
        }
        result
    }

    // ── Writes ───────────────────────────────────────────────────────

    /// Persist one record, initializing and hashing it first if needed.
    pub fn create(&self, record: &mut Record, opts: &[StoreOption]) -> Result<()> {
        prepare(record);
        let rec = &*record;
        self.run_with_options(opts, |db| {
            db.with_conn(|conn| {
                db.log_sql(&objects::insert_sql(), record::valid_fields().len());
                objects::insert(conn, rec)
            })
        })
    }

    /// Persist several records. Either all of them are stored or none are.
    pub fn create_bulk(&self, records: &mut [Record], opts: &[StoreOption]) -> Result<()> {
        if records.is_empty() {
            return Ok(());
        }
        records.iter_mut().for_each(prepare);
        let records = &*records;

        self.run_with_options(opts, |db| {
            db.with_conn(|conn| {
                // A savepoint nests inside a caller's transaction and acts as
                // one when there is none.
                conn.execute_batch("SAVEPOINT create_bulk")?;
                for rec in records {
                    db.log_sql(&objects::insert_sql(), record::valid_fields().len());
                    if let Err(e) = objects::insert(conn, rec) {
                        log::warn!("Bulk create failed at {}: {e}", rec.id);
                        if let Err(rb) =
                            conn.execute_batch("ROLLBACK TO create_bulk; RELEASE create_bulk")
                        {
                            log::warn!("Bulk create rollback failed: {rb}");
                        }
                        return Err(e);
                    }
                }
                conn.execute_batch("RELEASE create_bulk")?;
                Ok(())
            })
        })
    }

    /// Rewrite the peer hash of a stored record. Nothing else changes.
    pub fn update_peer_hash(
        &self,
        record: &Record,
        peer_hash: &str,
        opts: &[StoreOption],
    ) -> Result<()> {
        if record.id.is_empty() {
            return Err(StoreError::NotFound("record has no id".into()));
        }
        self.run_with_options(opts, |db| {
            db.with_conn(|conn| {
                db.log_sql("UPDATE objects SET peer_hash = ?1 WHERE id = ?2", 2);
                match objects::update_peer_hash(conn, &record.id, peer_hash)? {
                    0 => Err(StoreError::NotFound(format!("object {}", record.id))),
                    _ => Ok(()),
                }
            })
        })
    }

    // ── Reads ────────────────────────────────────────────────────────

    /// Base query for `filter` with its query modifiers applied.
    pub fn filter_query(&self, filter: &Record) -> Query {
        Query::table(OBJECTS_TABLE).scopes(&query_modifiers(filter))
    }

    /// Every record matching `filter`. No match is an empty list.
    pub fn get_all(&self, filter: &Record, opts: &[StoreOption]) -> Result<Vec<Record>> {
        let query = self.filter_query(filter);
        self.run_with_options(opts, |db| db.find(&query))
    }

    /// The most recently created record matching `filter`.
    pub fn get_last(&self, filter: &Record, opts: &[StoreOption]) -> Result<Record> {
        let query = self.filter_query(filter).reorder(NEWEST_FIRST).limit(1);
        self.run_with_options(opts, |db| {
            db.find(&query)?
                .into_iter()
                .next()
                .ok_or_else(|| StoreError::NotFound("no object matches the filter".into()))
        })
    }

    pub fn count(&self, filter: &Record, opts: &[StoreOption]) -> Result<i64> {
        let query = self.filter_query(filter);
        self.run_with_options(opts, |db| {
            db.with_conn(|conn| {
                db.log_sql(&query.to_count_sql(), query.params().len());
                objects::count(conn, &query)
            })
        })
    }

    /// Run an already-built query on this handle.
    pub fn find(&self, query: &Query) -> Result<Vec<Record>> {
        self.with_conn(|conn| {
            self.log_sql(
                &query.to_select_sql(&record::valid_fields()),
                query.params().len(),
            );
            objects::select(conn, query)
        })
    }

    // ── Transactions ─────────────────────────────────────────────────

    /// A fresh store sharing this store's configuration but not its state.
    /// It gets its own connection when this store is connected.
    pub fn new_db(&self) -> Result<Store> {
        let mut db = Store::new(self.config.clone());
        if self.is_connected() {
            db.conn = Some(Arc::new(Mutex::new(self.open_connection()?)));
        }
        Ok(db)
    }

    /// Open a transaction on a new connection and return a handle bound to
    /// it. Dropping the last clone of an unfinished handle rolls it back.
    pub fn begin(&self) -> Result<Store> {
        let conn = self.open_connection()?;
        objects::begin_transaction(&conn)?;
        self.log_sql("BEGIN IMMEDIATE TRANSACTION", 0);
        Ok(Store {
            config: self.config.clone(),
            conn: Some(Arc::new(Mutex::new(conn))),
            tx: Some(Arc::new(Mutex::new(TxState::Open))),
        })
    }

    /// State of the transaction this handle is bound to, if any.
    pub fn tx_state(&self) -> Option<TxState> {
        self.tx
            .as_ref()
            .and_then(|state| state.lock().ok().map(|s| *s))
    }

    pub fn commit(&self) -> Result<()> {
        self.finish(TxState::Committed)
    }

    pub fn rollback(&self) -> Result<()> {
        self.finish(TxState::RolledBack)
    }

    fn finish(&self, target: TxState) -> Result<()> {
        let state = self
            .tx
            .as_ref()
            .ok_or_else(|| StoreError::TransactionState("handle has no transaction".into()))?;
        let mut state = state
            .lock()
            .map_err(|_| StoreError::TransactionState("transaction state poisoned".into()))?;
        if *state != TxState::Open {
            return Err(StoreError::TransactionState(format!(
                "transaction already {}",
                *state
            )));
        }

        self.with_conn(|conn| match target {
            TxState::Committed => objects::commit_transaction(conn),
            _ => objects::rollback_transaction(conn),
        })?;
        log::debug!("Transaction {target}");
        *state = target;
        Ok(())
    }

    /// Run `body` with `tx` plus commit and rollback functions bound to it.
    ///
    /// With `auto_finish`, `tx` is committed when `body` returns `Ok` and
    /// rolled back when it returns `Err`, unless `body` finalized it already.
    /// Without it, finalizing is left to the caller, who still holds `tx`.
    pub fn transact_with_db<F, E>(
        &self,
        tx: &Store,
        auto_finish: bool,
        body: F,
    ) -> std::result::Result<(), E>
    where
        F: FnOnce(&Store, CommitFn<'_>, RollbackFn<'_>) -> std::result::Result<(), E>,
        E: From<StoreError>,
    {
        let commit = || tx.commit();
        let rollback = || tx.rollback();
        let result = body(tx, &commit, &rollback);

        if !auto_finish || tx.tx_state() != Some(TxState::Open) {
            return result;
        }

        match result {
            Ok(()) => {
                tx.commit()?;
                Ok(())
            }
            Err(e) => {
                log::warn!("Transaction body failed, rolling back");
                if let Err(rb) = tx.rollback() {
                    log::warn!("Rollback failed: {rb}");
                }
                Err(e)
            }
        }
    }

    /// Begin a transaction, run `body` in it and return the handle.
    /// See [`Store::transact_with_db`].
    ///
    /// Without `auto_finish` the returned handle may still be open; the
    /// caller commits or rolls it back. Dropping it open rolls it back.
    pub fn transact<F, E>(&self, auto_finish: bool, body: F) -> std::result::Result<Store, E>
    where
        F: FnOnce(&Store, CommitFn<'_>, RollbackFn<'_>) -> std::result::Result<(), E>,
        E: From<StoreError>,
    {
        let tx = self.begin()?;
        self.transact_with_db(&tx, auto_finish, body)?;
        Ok(tx)
    }
}

/// Assign identity and content hash when the caller has not.
fn prepare(record: &mut Record) {
    record.init();
    if record.hash.is_empty() {
        record.compute_hash();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::{Expr, QueryParams};
    use pretty_assertions::assert_eq;
    use rusqlite::types::Value;
    use tempfile::TempDir;

    fn setup_test_store() -> (TempDir, Store) {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("objects.db");
        let mut store = Store::new(StoreConfig::with_connection_string(
            path.to_str().unwrap(),
        ));
        store.no_logging();
        store.connect(Duration::ZERO, 5).unwrap();
        store.create_tables().unwrap();
        (tmp, store)
    }

    fn rand_key() -> String {
        nanoid::nanoid!(5)
    }

    fn keyed(key: &str) -> Record {
        let mut rec = Record {
            key: key.to_string(),
            peer_hash: rand_key(),
            prev_hash: rand_key(),
            ..Default::default()
        };
        rec.init().compute_hash();
        rec
    }

    // ── Connection ──────────────────────────────────────────────

    #[test]
    fn test_connect() {
        let (_tmp, store) = setup_test_store();
        assert!(store.is_connected());
        assert!(store.has_table(OBJECTS_TABLE).unwrap());
    }

    #[test]
    fn test_connect_fails_after_retries() {
        let tmp = TempDir::new().unwrap();
        let bad = tmp.path().join("missing").join("dir").join("x.db");
        let mut store = Store::new(StoreConfig::with_connection_string(bad.to_str().unwrap()));
        let err = store.connect(Duration::ZERO, 2).unwrap_err();
        assert!(err.is_connection());
        assert!(err.to_string().contains("2 attempt(s)"));
        assert!(!store.is_connected());
    }

    #[test]
    fn test_get_conn() {
        let (_tmp, store) = setup_test_store();
        let conn = store.get_conn().unwrap();
        assert!(Arc::ptr_eq(&conn, store.conn.as_ref().unwrap()));
    }

    #[test]
    fn test_set_conn() {
        let (_tmp, mut store) = setup_test_store();
        let existing = store.get_conn().unwrap();
        let fresh = Connection::open(&store.config().connection_string).unwrap();
        store.set_conn(Box::new(fresh)).unwrap();
        let current = store.get_conn().unwrap();
        assert!(!Arc::ptr_eq(&existing, &current));

        store.set_conn(Box::new(existing.clone())).unwrap();
        assert!(Arc::ptr_eq(&existing, &store.get_conn().unwrap()));
    }

    #[test]
    fn test_set_conn_rejects_other_types() {
        let (_tmp, mut store) = setup_test_store();
        let err = store.set_conn(Box::new("invalid_type")).unwrap_err();
        assert!(matches!(err, StoreError::TypeMismatch(_)));
        assert_eq!(
            err.to_string(),
            "connection type not supported. Requires rusqlite::Connection"
        );
    }

    #[test]
    fn test_unconnected_store() {
        let store = Store::new(StoreConfig::default());
        let err = store.count(&Record::default(), &[]).unwrap_err();
        assert!(matches!(err, StoreError::NotConnected));
    }

    #[test]
    fn test_create_tables_twice() {
        let (_tmp, store) = setup_test_store();
        store.create_tables().unwrap();
        assert!(store.has_table("objects").unwrap());
    }

    #[test]
    fn test_valid_object_fields() {
        let (_tmp, store) = setup_test_store();
        let fields = store.get_valid_object_fields();
        assert!(!fields.contains(&"query_params"));
        assert!(fields.contains(&"peer_hash"));
    }

    #[test]
    fn test_db_tx_from_options() {
        let (_tmp, store) = setup_test_store();
        let other = store.new_db().unwrap();
        let opts = vec![StoreOption::use_connection(&other, true)];
        let (db, finish) = store.db_tx_from_options(&opts, None);
        assert!(Arc::ptr_eq(
            &db.unwrap().get_conn().unwrap(),
            &other.get_conn().unwrap()
        ));
        assert!(finish);

        let (db, finish) = store.db_tx_from_options(&[], None);
        assert!(db.is_none());
        assert!(!finish);

        let (db, finish) = store.db_tx_from_options(&[], Some(&other));
        assert!(db.is_some());
        assert!(!finish);
    }

    // ── Create ──────────────────────────────────────────────────

    #[test]
    fn test_create_and_read_back() {
        let (_tmp, store) = setup_test_store();
        let mut rec = Record {
            id: uuid::Uuid::new_v4().to_string(),
            ..Default::default()
        };
        store.create(&mut rec, &[]).unwrap();
        assert!(!rec.hash.is_empty());
        assert!(rec.timestamp > 0);

        let found = store.get_last(&rec, &[]).unwrap();
        assert_eq!(found, rec);
    }

    #[test]
    fn test_create_duplicate_is_constraint_error() {
        let (_tmp, store) = setup_test_store();
        let mut rec = keyed("dup");
        store.create(&mut rec, &[]).unwrap();
        let err = store.create(&mut rec, &[]).unwrap_err();
        assert!(matches!(err, StoreError::Constraint(_)));
    }

    #[test]
    fn test_create_with_external_transaction() {
        let (_tmp, store) = setup_test_store();

        let tx = store.begin().unwrap();
        let mut rec = keyed("ext");
        store
            .create(&mut rec, &[StoreOption::use_connection(&tx, false)])
            .unwrap();
        tx.rollback().unwrap();
        assert_eq!(store.count(&rec, &[]).unwrap(), 0);

        let tx = store.begin().unwrap();
        store
            .create(&mut rec, &[StoreOption::use_connection(&tx, false)])
            .unwrap();
        tx.commit().unwrap();
        assert_eq!(store.count(&rec, &[]).unwrap(), 1);
    }

    #[test]
    fn test_create_with_finishing_option_commits() {
        let (_tmp, store) = setup_test_store();
        let tx = store.begin().unwrap();
        let mut rec = keyed("fin");
        store
            .create(&mut rec, &[StoreOption::use_connection(&tx, true)])
            .unwrap();
        assert_eq!(tx.tx_state(), Some(TxState::Committed));
        assert_eq!(store.count(&rec, &[]).unwrap(), 1);
    }

    #[test]
    fn test_finishing_option_without_transaction_is_rejected() {
        let (_tmp, store) = setup_test_store();
        let plain = store.new_db().unwrap();
        let key = rand_key();
        let by_key = Record::new(key.as_str(), "");

        let mut rec = keyed(&key);
        let err = store
            .create(&mut rec, &[StoreOption::use_connection(&plain, true)])
            .unwrap_err();
        assert!(matches!(err, StoreError::TransactionState(_)));
        assert_eq!(store.count(&by_key, &[]).unwrap(), 0);

        let mut recs = vec![keyed(&key), keyed(&key)];
        let err = store
            .create_bulk(&mut recs, &[StoreOption::use_connection(&plain, true)])
            .unwrap_err();
        assert!(matches!(err, StoreError::TransactionState(_)));
        assert_eq!(store.count(&by_key, &[]).unwrap(), 0);
    }

    #[test]
    fn test_create_bulk() {
        let (_tmp, store) = setup_test_store();
        let mut recs = vec![keyed("bulk"), keyed("bulk")];
        store.create_bulk(&mut recs, &[]).unwrap();

        assert_eq!(store.get_last(&recs[0], &[]).unwrap(), recs[0]);
        assert_eq!(store.get_last(&recs[1], &[]).unwrap(), recs[1]);
    }

    #[test]
    fn test_create_bulk_all_or_nothing() {
        let (_tmp, store) = setup_test_store();
        let key = rand_key();
        let first = keyed(&key);
        let mut recs = vec![first.clone(), keyed(&key), first];

        let err = store.create_bulk(&mut recs, &[]).unwrap_err();
        assert!(matches!(err, StoreError::Constraint(_)));
        assert_eq!(store.count(&Record::new(key.as_str(), ""), &[]).unwrap(), 0);
    }

    #[test]
    fn test_create_bulk_inside_transaction() {
        let (_tmp, store) = setup_test_store();
        let key = rand_key();
        let tx = store.begin().unwrap();
        let mut recs = vec![keyed(&key), keyed(&key)];
        store
            .create_bulk(&mut recs, &[StoreOption::use_connection(&tx, false)])
            .unwrap();
        assert_eq!(store.count(&Record::new(key.as_str(), ""), &[]).unwrap(), 0);
        tx.commit().unwrap();
        assert_eq!(store.count(&Record::new(key.as_str(), ""), &[]).unwrap(), 2);
    }

    // ── Reads ───────────────────────────────────────────────────

    #[test]
    fn test_get_last() {
        let (_tmp, store) = setup_test_store();
        let mut recs: Vec<Record> = ["1", "2", "3"]
            .iter()
            .map(|v| {
                let mut rec = Record {
                    key: "axa".into(),
                    value: v.to_string(),
                    peer_hash: rand_key(),
                    prev_hash: rand_key(),
                    ..Default::default()
                };
                rec.init().compute_hash();
                rec
            })
            .collect();
        store.create_bulk(&mut recs, &[]).unwrap();

        let last = store.get_last(&Record::new("axa", ""), &[]).unwrap();
        assert_eq!(last, recs[2]);
    }

    #[test]
    fn test_get_last_not_found() {
        let (_tmp, store) = setup_test_store();
        let err = store
            .get_last(&Record::new(rand_key().as_str(), ""), &[])
            .unwrap_err();
        assert!(err.is_not_found());
    }

    #[test]
    fn test_get_all_empty_is_not_error() {
        let (_tmp, store) = setup_test_store();
        let all = store
            .get_all(&Record::new(rand_key().as_str(), ""), &[])
            .unwrap();
        assert!(all.is_empty());
    }

    #[test]
    fn test_get_all() {
        let (_tmp, store) = setup_test_store();
        let key = rand_key();
        let mut recs = vec![keyed(&key), keyed(&key), keyed("other")];
        store.create_bulk(&mut recs, &[]).unwrap();

        let all = store.get_all(&Record::new(key.as_str(), ""), &[]).unwrap();
        assert_eq!(all.len(), 2);
    }

    #[test]
    fn test_count() {
        let (_tmp, store) = setup_test_store();
        let key = rand_key();
        let mut recs = vec![keyed(&key), keyed(&key)];
        store.create_bulk(&mut recs, &[]).unwrap();

        assert_eq!(store.count(&Record::new(key.as_str(), ""), &[]).unwrap(), 2);
        assert_eq!(store.count(&Record::new("none", ""), &[]).unwrap(), 0);
    }

    // ── Query modifiers ─────────────────────────────────────────

    #[test]
    fn test_key_starts_with() {
        let (_tmp, store) = setup_test_store();
        let mut recs = vec![
            keyed("special_key_prefix/abc"),
            keyed("other/abc"),
            keyed("Special_key_prefix/upper"),
            keyed("special%key"),
        ];
        store.create_bulk(&mut recs, &[]).unwrap();

        let filter = Record::with_params(QueryParams {
            key_starts_with: Some("special_key_prefix".into()),
            ..Default::default()
        });
        let found = store.get_all(&filter, &[]).unwrap();
        assert_eq!(found, vec![recs[0].clone()]);

        let last = store.get_last(&filter, &[]).unwrap();
        assert_eq!(last, recs[0]);
    }

    #[test]
    fn test_order_by_desc() {
        let (_tmp, store) = setup_test_store();
        // Created out of key order so creation order cannot pass for it.
        let mut recs = vec![keyed("2"), keyed("3"), keyed("1")];
        store.create_bulk(&mut recs, &[]).unwrap();
        let expected = vec![recs[1].clone(), recs[0].clone(), recs[2].clone()];

        let filter = Record::with_params(QueryParams {
            order_by: Some("key desc".into()),
            ..Default::default()
        });
        let modifiers = query_modifiers(&filter);

        let res = store.find(&Query::table(OBJECTS_TABLE).scopes(&modifiers)).unwrap();
        assert_eq!(res, expected);

        // Same scopes on a query already carrying another scope.
        let scoped = Query::table(OBJECTS_TABLE)
            .filter("\"hash\" != ?", vec![Value::Text(String::new())])
            .scopes(&modifiers);
        let res = store.find(&scoped).unwrap();
        assert_eq!(res, expected);
    }

    #[test]
    fn test_expr_overrides_record_fields() {
        let (_tmp, store) = setup_test_store();
        let key = rand_key();
        let mut rec = keyed(&key);
        store.create(&mut rec, &[]).unwrap();

        let mut filter = Record::new("some_key", "");
        filter.query_params.expr = Some(Expr::new("key = ?", vec![Value::Text(key)]));
        let res = store.get_all(&filter, &[]).unwrap();
        assert_eq!(res, vec![rec]);
    }

    #[test]
    fn test_limit() {
        let (_tmp, store) = setup_test_store();
        let mut recs = vec![keyed("1"), keyed("2")];
        store.create_bulk(&mut recs, &[]).unwrap();

        let filter = Record::with_params(QueryParams {
            limit: Some(1),
            order_by: Some("timestamp desc, rowid desc".into()),
            ..Default::default()
        });
        let res = store.get_all(&filter, &[]).unwrap();
        assert_eq!(res, vec![recs[1].clone()]);
    }

    // ── Peer hash ───────────────────────────────────────────────

    #[test]
    fn test_update_peer_hash() {
        let (_tmp, store) = setup_test_store();
        let mut rec = Record {
            id: uuid::Uuid::new_v4().to_string(),
            ..Default::default()
        };
        store.create(&mut rec, &[]).unwrap();
        assert!(rec.peer_hash.is_empty());

        store.update_peer_hash(&rec, "peer_hash_abc", &[]).unwrap();

        let by_id = Record {
            id: rec.id.clone(),
            ..Default::default()
        };
        let found = store.get_last(&by_id, &[]).unwrap();
        assert_eq!(found.peer_hash, "peer_hash_abc");
        assert_eq!(
            Record {
                peer_hash: String::new(),
                ..found
            },
            rec
        );
    }

    #[test]
    fn test_update_peer_hash_missing_record() {
        let (_tmp, store) = setup_test_store();
        let ghost = keyed("ghost");
        let err = store.update_peer_hash(&ghost, "x", &[]).unwrap_err();
        assert!(err.is_not_found());
    }

    // ── Transactions ────────────────────────────────────────────

    #[test]
    fn test_transact_explicit_rollback() {
        let (_tmp, store) = setup_test_store();
        let tx = store.new_db().unwrap().begin().unwrap();
        let mut rec = keyed(&rand_key());

        store
            .transact_with_db(&tx, false, |db, _commit, rollback| -> Result<()> {
                db.create(&mut rec, &[])?;
                rollback()?;
                Ok(())
            })
            .unwrap();

        assert!(store.get_last(&rec, &[]).unwrap_err().is_not_found());
    }

    #[test]
    fn test_transact_explicit_commit() {
        let (_tmp, store) = setup_test_store();
        let tx = store.new_db().unwrap().begin().unwrap();
        let mut rec = keyed(&rand_key());

        store
            .transact_with_db(&tx, false, |db, commit, _rollback| -> Result<()> {
                db.create(&mut rec, &[])?;
                commit()?;
                Ok(())
            })
            .unwrap();

        assert_eq!(store.get_last(&rec, &[]).unwrap(), rec);
    }

    #[test]
    fn test_transact_auto_rollback_on_error() {
        let (_tmp, store) = setup_test_store();
        let tx = store.begin().unwrap();
        let mut rec = keyed(&rand_key());

        let err = store
            .transact_with_db(&tx, true, |db, _commit, _rollback| -> Result<()> {
                db.create(&mut rec, &[])?;
                Err(StoreError::Other("cause a rollback".into()))
            })
            .unwrap_err();

        assert_eq!(err.to_string(), "cause a rollback");
        assert_eq!(tx.tx_state(), Some(TxState::RolledBack));
        assert!(store.get_last(&rec, &[]).unwrap_err().is_not_found());
    }

    #[test]
    fn test_transact_auto_commit() {
        let (_tmp, store) = setup_test_store();
        let tx = store.begin().unwrap();
        let mut rec = keyed(&rand_key());

        store
            .transact_with_db(&tx, true, |db, _commit, _rollback| -> Result<()> {
                db.create(&mut rec, &[])?;
                Ok(())
            })
            .unwrap();

        assert_eq!(store.get_last(&rec, &[]).unwrap(), rec);
    }

    #[test]
    fn test_transact_auto_respects_explicit_rollback() {
        let (_tmp, store) = setup_test_store();
        let mut rec = keyed(&rand_key());

        store
            .transact(true, |db, _commit, rollback| -> Result<()> {
                db.create(&mut rec, &[])?;
                rollback()
            })
            .unwrap();

        assert_eq!(store.count(&rec, &[]).unwrap(), 0);
    }

    #[test]
    fn test_transact_without_finish_leaves_tx_open() {
        let (_tmp, store) = setup_test_store();
        let mut rec = keyed(&rand_key());

        let tx = store
            .transact(false, |db, _commit, _rollback| -> Result<()> {
                db.create(&mut rec, &[])?;
                Ok(())
            })
            .unwrap();

        assert_eq!(tx.tx_state(), Some(TxState::Open));
        assert_eq!(store.count(&rec, &[]).unwrap(), 0);
        tx.commit().unwrap();
        assert_eq!(store.get_last(&rec, &[]).unwrap(), rec);
    }

    #[test]
    fn test_transact_with_db_without_finish_leaves_tx_open() {
        let (_tmp, store) = setup_test_store();
        let tx = store.begin().unwrap();
        let mut rec = keyed(&rand_key());

        store
            .transact_with_db(&tx, false, |db, _commit, _rollback| -> Result<()> {
                db.create(&mut rec, &[])?;
                Ok(())
            })
            .unwrap();

        assert_eq!(tx.tx_state(), Some(TxState::Open));
        assert_eq!(tx.count(&rec, &[]).unwrap(), 1);
        assert_eq!(store.count(&rec, &[]).unwrap(), 0);
        tx.commit().unwrap();
        assert_eq!(store.count(&rec, &[]).unwrap(), 1);
    }

    #[test]
    fn test_transact_auto_keeps_explicit_commit_on_error() {
        let (_tmp, store) = setup_test_store();
        let tx = store.begin().unwrap();
        let mut rec = keyed(&rand_key());

        let err = store
            .transact_with_db(&tx, true, |db, commit, _rollback| -> Result<()> {
                db.create(&mut rec, &[])?;
                commit()?;
                Err(StoreError::Other("failed after commit".into()))
            })
            .unwrap_err();

        assert_eq!(err.to_string(), "failed after commit");
        assert_eq!(tx.tx_state(), Some(TxState::Committed));
        assert_eq!(store.get_last(&rec, &[]).unwrap(), rec);
    }

    #[test]
    fn test_double_finalize_is_error() {
        let (_tmp, store) = setup_test_store();
        let tx = store.begin().unwrap();
        tx.commit().unwrap();
        let err = tx.rollback().unwrap_err();
        assert!(matches!(err, StoreError::TransactionState(_)));
        assert!(err.to_string().contains("committed"));

        let err = store.commit().unwrap_err();
        assert!(matches!(err, StoreError::TransactionState(_)));
    }

    #[test]
    fn test_uncommitted_transaction_invisible() {
        let (_tmp, store) = setup_test_store();
        let tx = store.begin().unwrap();
        let mut rec = keyed(&rand_key());
        tx.create(&mut rec, &[]).unwrap();

        assert_eq!(tx.count(&rec, &[]).unwrap(), 1);
        assert_eq!(store.count(&rec, &[]).unwrap(), 0);
        drop(tx);
        assert_eq!(store.count(&rec, &[]).unwrap(), 0);
    }
}
