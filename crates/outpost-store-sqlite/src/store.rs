// outpost-store-sqlite/src/store.rs
// ============================================================================
// Module: SQLite Outpost Store
// Description: Durable DataStore and BlobStore backed by SQLite WAL.
// Purpose: Persist platform records with transactional writes and leases.
// Dependencies: outpost-core, rusqlite, serde, serde_json, thiserror
// ============================================================================

//! ## Overview
//! This module implements the [`DataStore`] and [`BlobStore`] contracts over
//! a single `SQLite` database. Records are stored as JSON rows; hot mutable
//! fields (lease owner, lease deadline, lease count, the needs-processing
//! flag) live in dedicated columns that are patched into records on read.
//! Every trait call runs inside one transaction, which provides the per-call
//! atomicity the contract requires. Busy and locked conditions surface as
//! retriable transient errors.

// ============================================================================
// SECTION: Imports
// ============================================================================

use std::path::PathBuf;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::MutexGuard;

use rusqlite::Connection;
use rusqlite::ErrorCode;
use rusqlite::OpenFlags;
use rusqlite::OptionalExtension;
use rusqlite::Transaction;
use rusqlite::params;
use serde::Deserialize;
use serde::Serialize;
use serde::de::DeserializeOwned;
use thiserror::Error;

use outpost_core::Approval;
use outpost_core::ApprovalId;
use outpost_core::ApprovalType;
use outpost_core::BlobId;
use outpost_core::BlobReference;
use outpost_core::BlobStore;
use outpost_core::Client;
use outpost_core::ClientCrash;
use outpost_core::ClientId;
use outpost_core::ClientLabel;
use outpost_core::ClientMessage;
use outpost_core::ClientSnapshot;
use outpost_core::DataStore;
use outpost_core::DurationMicros;
use outpost_core::Flow;
use outpost_core::FlowId;
use outpost_core::FlowPersistencePlan;
use outpost_core::FlowProcessingRequest;
use outpost_core::FlowRequest;
use outpost_core::FlowResponse;
use outpost_core::FlowResult;
use outpost_core::FlowStart;
use outpost_core::Grant;
use outpost_core::Hunt;
use outpost_core::HuntAdmission;
use outpost_core::HuntAdmissionDecision;
use outpost_core::HuntCounterDelta;
use outpost_core::HuntId;
use outpost_core::HuntState;
use outpost_core::MessageHandlerRequest;
use outpost_core::MessageId;
use outpost_core::PathInfo;
use outpost_core::RequestId;
use outpost_core::SignedBinaryId;
use outpost_core::SignedBinaryReferences;
use outpost_core::StoreError;
use outpost_core::Timestamp;
use outpost_core::Username;
use outpost_core::runtime::SYNTHETIC_TERMINAL_RESPONSE_ID;

// ============================================================================
// SECTION: Constants
// ============================================================================

/// `SQLite` schema version for the store.
const SCHEMA_VERSION: i64 = 1;
/// Default busy timeout (ms).
const DEFAULT_BUSY_TIMEOUT_MS: u64 = 5_000;

// ============================================================================
// SECTION: Config
// ============================================================================

/// `SQLite` journal mode configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SqliteJournalMode {
    /// WAL journal mode (recommended).
    #[default]
    Wal,
    /// Delete journal mode (legacy).
    Delete,
}

impl SqliteJournalMode {
    /// Returns the `SQLite` pragma value.
    #[must_use]
    pub const fn pragma_value(self) -> &'static str {
        match self {
            Self::Wal => "wal",
            Self::Delete => "delete",
        }
    }
}

/// `SQLite` sync mode configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SqliteSyncMode {
    /// Full synchronous mode (safest).
    #[default]
    Full,
    /// Normal synchronous mode (balanced).
    Normal,
}

impl SqliteSyncMode {
    /// Returns the `SQLite` pragma value.
    #[must_use]
    pub const fn pragma_value(self) -> &'static str {
        match self {
            Self::Full => "full",
            Self::Normal => "normal",
        }
    }
}

/// Configuration for the `SQLite` store.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SqliteStoreConfig {
    /// Path to the database file.
    pub path: PathBuf,
    /// Busy timeout in milliseconds.
    #[serde(default = "default_busy_timeout_ms")]
    pub busy_timeout_ms: u64,
    /// Journal mode.
    #[serde(default)]
    pub journal_mode: SqliteJournalMode,
    /// Sync mode.
    #[serde(default)]
    pub sync_mode: SqliteSyncMode,
}

/// Returns the default busy timeout for `SQLite` connections.
const fn default_busy_timeout_ms() -> u64 {
    DEFAULT_BUSY_TIMEOUT_MS
}

// ============================================================================
// SECTION: Errors
// ============================================================================

/// `SQLite` store open/initialization errors.
#[derive(Debug, Error)]
pub enum SqliteStoreError {
    /// Store I/O error.
    #[error("sqlite store io error: {0}")]
    Io(String),
    /// `SQLite` engine error.
    #[error("sqlite store db error: {0}")]
    Db(String),
    /// Store schema version mismatch.
    #[error("sqlite store version mismatch: {0}")]
    VersionMismatch(String),
}

/// Maps a rusqlite error to the portable store error taxonomy.
fn db_err(error: &rusqlite::Error) -> StoreError {
    if let rusqlite::Error::SqliteFailure(failure, _) = error {
        match failure.code {
            ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked => {
                return StoreError::Transient(error.to_string());
            }
            ErrorCode::ConstraintViolation => {
                return StoreError::DuplicateKey(error.to_string());
            }
            _ => {}
        }
    }
    StoreError::Transient(error.to_string())
}

/// Serializes a record row.
fn to_json<T: Serialize>(value: &T) -> Result<String, StoreError> {
    serde_json::to_string(value).map_err(|err| StoreError::Serialization(err.to_string()))
}

/// Deserializes a record row.
fn from_json<T: DeserializeOwned>(text: &str) -> Result<T, StoreError> {
    serde_json::from_str(text).map_err(|err| StoreError::Serialization(err.to_string()))
}

/// Converts a raw 64-bit id to its signed column form.
const fn col(raw: u64) -> i64 {
    raw.cast_signed()
}

// ============================================================================
// SECTION: Store
// ============================================================================

/// `SQLite`-backed data and blob store.
#[derive(Clone)]
pub struct SqliteOutpostStore {
    /// Shared connection guarded by a mutex.
    connection: Arc<Mutex<Connection>>,
}

impl SqliteOutpostStore {
    /// Opens the store, creating and migrating the schema as needed.
    ///
    /// # Errors
    ///
    /// Returns [`SqliteStoreError`] when the database cannot be opened or
    /// initialized.
    pub fn open(config: &SqliteStoreConfig) -> Result<Self, SqliteStoreError> {
        if let Some(parent) = config.path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent).map_err(|err| SqliteStoreError::Io(err.to_string()))?;
        }
        let connection = Connection::open_with_flags(
            &config.path,
            OpenFlags::SQLITE_OPEN_READ_WRITE | OpenFlags::SQLITE_OPEN_CREATE,
        )
        .map_err(|err| SqliteStoreError::Db(err.to_string()))?;
        connection
            .busy_timeout(std::time::Duration::from_millis(config.busy_timeout_ms))
            .map_err(|err| SqliteStoreError::Db(err.to_string()))?;
        // journal_mode reports the resulting mode as a row; the checked
        // variant consumes it.
        connection
            .pragma_update_and_check(None, "journal_mode", config.journal_mode.pragma_value(), |_| {
                Ok(())
            })
            .map_err(|err| SqliteStoreError::Db(err.to_string()))?;
        connection
            .pragma_update(None, "synchronous", config.sync_mode.pragma_value())
            .map_err(|err| SqliteStoreError::Db(err.to_string()))?;
        initialize_schema(&connection)?;
        Ok(Self { connection: Arc::new(Mutex::new(connection)) })
    }

    /// Opens an in-memory store, mainly for tests.
    ///
    /// # Errors
    ///
    /// Returns [`SqliteStoreError`] when initialization fails.
    pub fn open_in_memory() -> Result<Self, SqliteStoreError> {
        let connection =
            Connection::open_in_memory().map_err(|err| SqliteStoreError::Db(err.to_string()))?;
        initialize_schema(&connection)?;
        Ok(Self { connection: Arc::new(Mutex::new(connection)) })
    }

    /// Locks the connection, surfacing poisoning as a transient error.
    fn lock(&self) -> Result<MutexGuard<'_, Connection>, StoreError> {
        self.connection
            .lock()
            .map_err(|_| StoreError::Transient("sqlite connection mutex poisoned".to_string()))
    }

    /// Runs one closure inside a transaction.
    fn with_tx<T>(
        &self,
        body: impl FnOnce(&Transaction<'_>) -> Result<T, StoreError>,
    ) -> Result<T, StoreError> {
        let mut guard = self.lock()?;
        let tx = guard.transaction().map_err(|err| db_err(&err))?;
        let value = body(&tx)?;
        tx.commit().map_err(|err| db_err(&err))?;
        Ok(value)
    }
}

/// Creates the schema and stamps the version.
fn initialize_schema(connection: &Connection) -> Result<(), SqliteStoreError> {
    connection
        .execute_batch(
            "CREATE TABLE IF NOT EXISTS schema_info (version INTEGER NOT NULL);
             CREATE TABLE IF NOT EXISTS clients (
                 client_id INTEGER PRIMARY KEY,
                 record TEXT NOT NULL
             );
             CREATE TABLE IF NOT EXISTS client_keywords (
                 keyword TEXT NOT NULL,
                 client_id INTEGER NOT NULL,
                 PRIMARY KEY (keyword, client_id)
             );
             CREATE TABLE IF NOT EXISTS client_snapshots (
                 client_id INTEGER NOT NULL,
                 captured_at INTEGER NOT NULL,
                 record TEXT NOT NULL,
                 PRIMARY KEY (client_id, captured_at)
             );
             CREATE TABLE IF NOT EXISTS path_infos (
                 client_id INTEGER NOT NULL,
                 path TEXT NOT NULL,
                 record TEXT NOT NULL,
                 PRIMARY KEY (client_id, path)
             );
             CREATE TABLE IF NOT EXISTS flows (
                 client_id INTEGER NOT NULL,
                 flow_id INTEGER NOT NULL,
                 hunt_id INTEGER,
                 created_at INTEGER NOT NULL,
                 processing_owner TEXT,
                 processing_deadline INTEGER,
                 processing_lease_count INTEGER NOT NULL DEFAULT 0,
                 record TEXT NOT NULL,
                 PRIMARY KEY (client_id, flow_id)
             );
             CREATE INDEX IF NOT EXISTS flows_by_hunt ON flows (hunt_id);
             CREATE TABLE IF NOT EXISTS flow_requests (
                 client_id INTEGER NOT NULL,
                 flow_id INTEGER NOT NULL,
                 request_id INTEGER NOT NULL,
                 needs_processing INTEGER NOT NULL DEFAULT 0,
                 responses_expected INTEGER,
                 record TEXT NOT NULL,
                 PRIMARY KEY (client_id, flow_id, request_id)
             );
             CREATE TABLE IF NOT EXISTS flow_responses (
                 client_id INTEGER NOT NULL,
                 flow_id INTEGER NOT NULL,
                 request_id INTEGER NOT NULL,
                 response_id INTEGER NOT NULL,
                 is_status INTEGER NOT NULL DEFAULT 0,
                 record TEXT NOT NULL,
                 PRIMARY KEY (client_id, flow_id, request_id, response_id)
             );
             CREATE TABLE IF NOT EXISTS flow_results (
                 seq INTEGER PRIMARY KEY AUTOINCREMENT,
                 client_id INTEGER NOT NULL,
                 flow_id INTEGER NOT NULL,
                 hunt_id INTEGER,
                 record TEXT NOT NULL
             );
             CREATE INDEX IF NOT EXISTS results_by_flow ON flow_results (client_id, flow_id);
             CREATE INDEX IF NOT EXISTS results_by_hunt ON flow_results (hunt_id);
             CREATE TABLE IF NOT EXISTS client_messages (
                 client_id INTEGER NOT NULL,
                 message_id INTEGER NOT NULL,
                 flow_id INTEGER NOT NULL,
                 request_id INTEGER NOT NULL,
                 lease_owner TEXT,
                 lease_deadline INTEGER,
                 lease_count INTEGER NOT NULL DEFAULT 0,
                 record TEXT NOT NULL,
                 PRIMARY KEY (client_id, message_id)
             );
             CREATE TABLE IF NOT EXISTS flow_processing (
                 client_id INTEGER NOT NULL,
                 flow_id INTEGER NOT NULL,
                 written_at INTEGER NOT NULL,
                 delivery_time INTEGER,
                 lease_owner TEXT,
                 lease_deadline INTEGER,
                 lease_count INTEGER NOT NULL DEFAULT 0,
                 resignaled INTEGER NOT NULL DEFAULT 0,
                 PRIMARY KEY (client_id, flow_id)
             );
             CREATE TABLE IF NOT EXISTS handler_requests (
                 handler TEXT NOT NULL,
                 request_id INTEGER NOT NULL,
                 lease_deadline INTEGER,
                 record TEXT NOT NULL,
                 PRIMARY KEY (handler, request_id)
             );
             CREATE TABLE IF NOT EXISTS approvals (
                 requestor TEXT NOT NULL,
                 approval_id INTEGER NOT NULL,
                 approval_type TEXT NOT NULL,
                 subject_id TEXT NOT NULL,
                 expiration INTEGER NOT NULL,
                 record TEXT NOT NULL,
                 PRIMARY KEY (requestor, approval_id)
             );
             CREATE TABLE IF NOT EXISTS hunts (
                 hunt_id INTEGER PRIMARY KEY,
                 created_at INTEGER NOT NULL,
                 record TEXT NOT NULL
             );
             CREATE TABLE IF NOT EXISTS signed_binaries (
                 kind TEXT NOT NULL,
                 path TEXT NOT NULL,
                 record TEXT NOT NULL,
                 PRIMARY KEY (kind, path)
             );
             CREATE TABLE IF NOT EXISTS blobs (
                 blob_id BLOB PRIMARY KEY,
                 data BLOB NOT NULL
             );
             CREATE TABLE IF NOT EXISTS blob_references (
                 file_id BLOB PRIMARY KEY,
                 record TEXT NOT NULL
             );",
        )
        .map_err(|err| SqliteStoreError::Db(err.to_string()))?;

    let version: Option<i64> = connection
        .query_row("SELECT version FROM schema_info LIMIT 1", [], |row| row.get(0))
        .optional()
        .map_err(|err| SqliteStoreError::Db(err.to_string()))?;
    match version {
        None => {
            connection
                .execute("INSERT INTO schema_info (version) VALUES (?1)", params![SCHEMA_VERSION])
                .map_err(|err| SqliteStoreError::Db(err.to_string()))?;
        }
        Some(found) if found == SCHEMA_VERSION => {}
        Some(found) => {
            return Err(SqliteStoreError::VersionMismatch(format!(
                "found schema version {found}, expected {SCHEMA_VERSION}"
            )));
        }
    }
    Ok(())
}

// ============================================================================
// SECTION: Transaction Helpers
// ============================================================================

/// Reads a flow row, patching lease columns into the record.
fn tx_read_flow(
    tx: &Transaction<'_>,
    client_id: ClientId,
    flow_id: FlowId,
) -> Result<Flow, StoreError> {
    let row = tx
        .query_row(
            "SELECT record, processing_owner, processing_deadline, processing_lease_count
             FROM flows WHERE client_id = ?1 AND flow_id = ?2",
            params![col(client_id.as_raw()), col(flow_id.as_raw())],
            |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, Option<String>>(1)?,
                    row.get::<_, Option<i64>>(2)?,
                    row.get::<_, i64>(3)?,
                ))
            },
        )
        .optional()
        .map_err(|err| db_err(&err))?;
    let (record, owner, deadline, lease_count) =
        row.ok_or(StoreError::UnknownFlow { client_id, flow_id })?;
    let mut flow: Flow = from_json(&record)?;
    flow.processing_owner = owner;
    flow.processing_deadline = deadline.map(Timestamp::from_micros);
    flow.processing_lease_count = lease_count.cast_unsigned();
    Ok(flow)
}

/// Writes a flow row including lease columns.
fn tx_write_flow(tx: &Transaction<'_>, flow: &Flow, create: bool) -> Result<(), StoreError> {
    let record = to_json(flow)?;
    if create {
        let inserted = tx
            .execute(
                "INSERT OR IGNORE INTO flows
                 (client_id, flow_id, hunt_id, created_at, processing_owner,
                  processing_deadline, processing_lease_count, record)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                params![
                    col(flow.client_id.as_raw()),
                    col(flow.flow_id.as_raw()),
                    flow.parent_hunt_id.map(|hunt_id| col(hunt_id.as_raw())),
                    flow.created_at.as_micros(),
                    flow.processing_owner,
                    flow.processing_deadline.map(Timestamp::as_micros),
                    col(flow.processing_lease_count),
                    record,
                ],
            )
            .map_err(|err| db_err(&err))?;
        if inserted == 0 {
            return Err(StoreError::DuplicateKey(flow.long_id()));
        }
    } else {
        tx.execute(
            "UPDATE flows SET hunt_id = ?3, processing_owner = ?4,
                 processing_deadline = ?5, processing_lease_count = ?6, record = ?7
             WHERE client_id = ?1 AND flow_id = ?2",
            params![
                col(flow.client_id.as_raw()),
                col(flow.flow_id.as_raw()),
                flow.parent_hunt_id.map(|hunt_id| col(hunt_id.as_raw())),
                flow.processing_owner,
                flow.processing_deadline.map(Timestamp::as_micros),
                col(flow.processing_lease_count),
                record,
            ],
        )
        .map_err(|err| db_err(&err))?;
    }
    Ok(())
}

/// Inserts a flow request row.
fn tx_insert_request(tx: &Transaction<'_>, request: &FlowRequest) -> Result<(), StoreError> {
    tx.execute(
        "INSERT OR REPLACE INTO flow_requests
         (client_id, flow_id, request_id, needs_processing, responses_expected, record)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        params![
            col(request.client_id.as_raw()),
            col(request.flow_id.as_raw()),
            col(request.request_id.as_raw()),
            i64::from(request.needs_processing),
            request.responses_expected.map(col),
            to_json(request)?,
        ],
    )
    .map_err(|err| db_err(&err))?;
    Ok(())
}

/// Inserts an outbound client message row.
fn tx_insert_message(tx: &Transaction<'_>, message: &ClientMessage) -> Result<(), StoreError> {
    tx.execute(
        "INSERT OR REPLACE INTO client_messages
         (client_id, message_id, flow_id, request_id, lease_owner, lease_deadline,
          lease_count, record)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
        params![
            col(message.client_id.as_raw()),
            col(message.message_id.as_raw()),
            col(message.flow_id.as_raw()),
            col(message.request_id.as_raw()),
            message.lease_owner,
            message.lease_deadline.map(Timestamp::as_micros),
            col(message.lease_count),
            to_json(message)?,
        ],
    )
    .map_err(|err| db_err(&err))?;
    Ok(())
}

/// Inserts a flow result row.
fn tx_insert_result(tx: &Transaction<'_>, result: &FlowResult) -> Result<(), StoreError> {
    tx.execute(
        "INSERT INTO flow_results (client_id, flow_id, hunt_id, record)
         VALUES (?1, ?2, ?3, ?4)",
        params![
            col(result.client_id.as_raw()),
            col(result.flow_id.as_raw()),
            result.hunt_id.map(|hunt_id| col(hunt_id.as_raw())),
            to_json(result)?,
        ],
    )
    .map_err(|err| db_err(&err))?;
    Ok(())
}

/// Enqueues a processing wake-up, deduplicated by flow key. An immediate
/// wake-up supersedes a delayed one.
fn tx_enqueue_processing(
    tx: &Transaction<'_>,
    request: &FlowProcessingRequest,
) -> Result<(), StoreError> {
    tx.execute(
        "INSERT INTO flow_processing (client_id, flow_id, written_at, delivery_time)
         VALUES (?1, ?2, ?3, ?4)
         ON CONFLICT (client_id, flow_id) DO UPDATE SET
             delivery_time = CASE
                 WHEN excluded.delivery_time IS NULL THEN NULL
                 ELSE flow_processing.delivery_time
             END,
             resignaled = 1",
        params![
            col(request.client_id.as_raw()),
            col(request.flow_id.as_raw()),
            request.written_at.as_micros(),
            request.delivery_time.map(Timestamp::as_micros),
        ],
    )
    .map_err(|err| db_err(&err))?;
    Ok(())
}

/// Inserts a flow with its start outputs; fails on duplicates.
fn tx_insert_flow_start(tx: &Transaction<'_>, start: &FlowStart) -> Result<(), StoreError> {
    tx_write_flow(tx, &start.flow, true)?;
    for request in &start.requests {
        tx_insert_request(tx, request)?;
        if request.needs_processing {
            tx_enqueue_processing(
                tx,
                &FlowProcessingRequest {
                    client_id: request.client_id,
                    flow_id: request.flow_id,
                    written_at: request.created_at,
                    delivery_time: None,
                },
            )?;
        }
    }
    for message in &start.messages {
        tx_insert_message(tx, message)?;
    }
    for result in &start.results {
        tx_insert_result(tx, result)?;
    }
    Ok(())
}

/// Applies response writes with completion bookkeeping.
fn tx_apply_responses(tx: &Transaction<'_>, responses: &[FlowResponse]) -> Result<(), StoreError> {
    for response in responses {
        let client = col(response.client_id.as_raw());
        let flow = col(response.flow_id.as_raw());
        let request = col(response.request_id.as_raw());

        let flow_exists: Option<i64> = tx
            .query_row(
                "SELECT 1 FROM flows WHERE client_id = ?1 AND flow_id = ?2",
                params![client, flow],
                |row| row.get(0),
            )
            .optional()
            .map_err(|err| db_err(&err))?;
        if flow_exists.is_none() {
            continue;
        }
        let request_row: Option<(i64, String)> = tx
            .query_row(
                "SELECT needs_processing, record FROM flow_requests
                 WHERE client_id = ?1 AND flow_id = ?2 AND request_id = ?3",
                params![client, flow, request],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()
            .map_err(|err| db_err(&err))?;
        let Some((needs_processing, _)) = request_row else {
            continue;
        };

        let inserted = tx
            .execute(
                "INSERT OR IGNORE INTO flow_responses
                 (client_id, flow_id, request_id, response_id, is_status, record)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    client,
                    flow,
                    request,
                    col(response.response_id.as_raw()),
                    i64::from(response.body.as_status().is_some()),
                    to_json(response)?,
                ],
            )
            .map_err(|err| db_err(&err))?;
        if inserted == 0 {
            continue;
        }

        if response.body.as_status().is_some() {
            if response.response_id.as_raw() != SYNTHETIC_TERMINAL_RESPONSE_ID {
                tx.execute(
                    "UPDATE flow_requests SET responses_expected = ?4
                     WHERE client_id = ?1 AND flow_id = ?2 AND request_id = ?3",
                    params![client, flow, request, col(response.response_id.as_raw())],
                )
                .map_err(|err| db_err(&err))?;
            }
            tx.execute(
                "DELETE FROM client_messages
                 WHERE client_id = ?1 AND flow_id = ?2 AND request_id = ?3",
                params![client, flow, request],
            )
            .map_err(|err| db_err(&err))?;
        }

        if needs_processing == 0 {
            let count: i64 = tx
                .query_row(
                    "SELECT COUNT(*) FROM flow_responses
                     WHERE client_id = ?1 AND flow_id = ?2 AND request_id = ?3",
                    params![client, flow, request],
                    |row| row.get(0),
                )
                .map_err(|err| db_err(&err))?;
            let status_id: Option<i64> = tx
                .query_row(
                    "SELECT response_id FROM flow_responses
                     WHERE client_id = ?1 AND flow_id = ?2 AND request_id = ?3
                       AND is_status = 1
                     ORDER BY response_id DESC LIMIT 1",
                    params![client, flow, request],
                    |row| row.get(0),
                )
                .optional()
                .map_err(|err| db_err(&err))?;
            let complete = match status_id {
                Some(status_id) if status_id.cast_unsigned() == SYNTHETIC_TERMINAL_RESPONSE_ID => {
                    true
                }
                Some(status_id) => count.cast_unsigned() >= status_id.cast_unsigned(),
                None => false,
            };
            if complete {
                tx.execute(
                    "UPDATE flow_requests SET needs_processing = 1
                     WHERE client_id = ?1 AND flow_id = ?2 AND request_id = ?3",
                    params![client, flow, request],
                )
                .map_err(|err| db_err(&err))?;
                tx_enqueue_processing(
                    tx,
                    &FlowProcessingRequest {
                        client_id: response.client_id,
                        flow_id: response.flow_id,
                        written_at: response.received_at,
                        delivery_time: None,
                    },
                )?;
            }
        }
    }
    Ok(())
}

/// Reads a hunt row.
fn tx_read_hunt(tx: &Transaction<'_>, hunt_id: HuntId) -> Result<Hunt, StoreError> {
    let record: Option<String> = tx
        .query_row(
            "SELECT record FROM hunts WHERE hunt_id = ?1",
            params![col(hunt_id.as_raw())],
            |row| row.get(0),
        )
        .optional()
        .map_err(|err| db_err(&err))?;
    from_json(&record.ok_or(StoreError::UnknownHunt(hunt_id))?)
}

/// Writes a hunt row back.
fn tx_write_hunt(tx: &Transaction<'_>, hunt: &Hunt) -> Result<(), StoreError> {
    tx.execute(
        "UPDATE hunts SET record = ?2 WHERE hunt_id = ?1",
        params![col(hunt.hunt_id.as_raw()), to_json(hunt)?],
    )
    .map_err(|err| db_err(&err))?;
    Ok(())
}

/// Reads a client row.
fn tx_read_client(tx: &Transaction<'_>, client_id: ClientId) -> Result<Client, StoreError> {
    let record: Option<String> = tx
        .query_row(
            "SELECT record FROM clients WHERE client_id = ?1",
            params![col(client_id.as_raw())],
            |row| row.get(0),
        )
        .optional()
        .map_err(|err| db_err(&err))?;
    from_json(&record.ok_or(StoreError::UnknownClient(client_id))?)
}

/// Writes a client row and refreshes its keyword index.
fn tx_write_client(tx: &Transaction<'_>, client: &Client) -> Result<(), StoreError> {
    tx.execute(
        "INSERT OR REPLACE INTO clients (client_id, record) VALUES (?1, ?2)",
        params![col(client.client_id.as_raw()), to_json(client)?],
    )
    .map_err(|err| db_err(&err))?;
    for keyword in client.search_keywords() {
        tx.execute(
            "INSERT OR IGNORE INTO client_keywords (keyword, client_id) VALUES (?1, ?2)",
            params![keyword, col(client.client_id.as_raw())],
        )
        .map_err(|err| db_err(&err))?;
    }
    Ok(())
}

/// Writes a path info row.
fn tx_write_path_info(tx: &Transaction<'_>, path: &PathInfo) -> Result<(), StoreError> {
    tx.execute(
        "INSERT OR REPLACE INTO path_infos (client_id, path, record) VALUES (?1, ?2, ?3)",
        params![col(path.client_id.as_raw()), path.path, to_json(path)?],
    )
    .map_err(|err| db_err(&err))?;
    Ok(())
}

// ============================================================================
// SECTION: DataStore Implementation
// ============================================================================

impl DataStore for SqliteOutpostStore {
    fn write_client(&self, client: &Client) -> Result<(), StoreError> {
        self.with_tx(|tx| tx_write_client(tx, client))
    }

    fn read_client(&self, client_id: ClientId) -> Result<Client, StoreError> {
        self.with_tx(|tx| tx_read_client(tx, client_id))
    }

    fn multi_read_clients(&self, client_ids: &[ClientId]) -> Result<Vec<Client>, StoreError> {
        self.with_tx(|tx| {
            let mut clients = Vec::with_capacity(client_ids.len());
            for client_id in client_ids {
                match tx_read_client(tx, *client_id) {
                    Ok(client) => clients.push(client),
                    Err(StoreError::UnknownClient(_)) => {}
                    Err(err) => return Err(err),
                }
            }
            Ok(clients)
        })
    }

    fn list_clients(&self, offset: u64, count: u64) -> Result<Vec<Client>, StoreError> {
        self.with_tx(|tx| {
            let mut statement = tx
                .prepare("SELECT record FROM clients ORDER BY client_id LIMIT ?1 OFFSET ?2")
                .map_err(|err| db_err(&err))?;
            let rows = statement
                .query_map(params![col(count), col(offset)], |row| row.get::<_, String>(0))
                .map_err(|err| db_err(&err))?;
            let mut clients = Vec::new();
            for row in rows {
                clients.push(from_json(&row.map_err(|err| db_err(&err))?)?);
            }
            Ok(clients)
        })
    }

    fn update_client_ping(
        &self,
        client_id: ClientId,
        last_ping: Timestamp,
        last_clock: Timestamp,
        last_ip: &str,
    ) -> Result<(), StoreError> {
        self.with_tx(|tx| {
            let mut client = tx_read_client(tx, client_id)?;
            client.last_ping = last_ping;
            client.last_clock = last_clock;
            client.last_ip = last_ip.to_string();
            tx_write_client(tx, &client)
        })
    }

    fn update_client_foreman_check(
        &self,
        client_id: ClientId,
        checked_at: Timestamp,
    ) -> Result<(), StoreError> {
        self.with_tx(|tx| {
            let mut client = tx_read_client(tx, client_id)?;
            client.last_foreman_check = checked_at;
            tx_write_client(tx, &client)
        })
    }

    fn write_client_snapshot(&self, snapshot: &ClientSnapshot) -> Result<(), StoreError> {
        self.with_tx(|tx| {
            tx.execute(
                "INSERT OR REPLACE INTO client_snapshots (client_id, captured_at, record)
                 VALUES (?1, ?2, ?3)",
                params![
                    col(snapshot.client.client_id.as_raw()),
                    snapshot.timestamp.as_micros(),
                    to_json(snapshot)?,
                ],
            )
            .map_err(|err| db_err(&err))?;
            Ok(())
        })
    }

    fn read_client_snapshots(
        &self,
        client_id: ClientId,
    ) -> Result<Vec<ClientSnapshot>, StoreError> {
        self.with_tx(|tx| {
            let mut statement = tx
                .prepare(
                    "SELECT record FROM client_snapshots WHERE client_id = ?1
                     ORDER BY captured_at",
                )
                .map_err(|err| db_err(&err))?;
            let rows = statement
                .query_map(params![col(client_id.as_raw())], |row| row.get::<_, String>(0))
                .map_err(|err| db_err(&err))?;
            let mut snapshots = Vec::new();
            for row in rows {
                snapshots.push(from_json(&row.map_err(|err| db_err(&err))?)?);
            }
            Ok(snapshots)
        })
    }

    fn add_client_labels(
        &self,
        client_id: ClientId,
        labels: &[ClientLabel],
    ) -> Result<(), StoreError> {
        self.with_tx(|tx| {
            let mut client = tx_read_client(tx, client_id)?;
            for label in labels {
                if !client.labels.contains(label) {
                    client.labels.push(label.clone());
                }
            }
            tx_write_client(tx, &client)
        })
    }

    fn remove_client_labels(
        &self,
        client_id: ClientId,
        labels: &[ClientLabel],
    ) -> Result<(), StoreError> {
        self.with_tx(|tx| {
            let mut client = tx_read_client(tx, client_id)?;
            client.labels.retain(|label| !labels.contains(label));
            tx_write_client(tx, &client)
        })
    }

    fn read_client_labels(&self, client_id: ClientId) -> Result<Vec<ClientLabel>, StoreError> {
        self.with_tx(|tx| Ok(tx_read_client(tx, client_id)?.labels))
    }

    fn query_client_keywords(&self, keyword: &str) -> Result<Vec<ClientId>, StoreError> {
        self.with_tx(|tx| {
            let mut statement = tx
                .prepare("SELECT client_id FROM client_keywords WHERE keyword = ?1")
                .map_err(|err| db_err(&err))?;
            let rows = statement
                .query_map(params![keyword.to_lowercase()], |row| row.get::<_, i64>(0))
                .map_err(|err| db_err(&err))?;
            let mut clients = Vec::new();
            for row in rows {
                clients.push(ClientId::from_raw(row.map_err(|err| db_err(&err))?.cast_unsigned()));
            }
            Ok(clients)
        })
    }

    fn write_client_crash(&self, crash: &ClientCrash) -> Result<(), StoreError> {
        self.with_tx(|tx| {
            let mut client = tx_read_client(tx, crash.client_id)?;
            client.last_crash = Some(crash.clone());
            tx_write_client(tx, &client)
        })
    }

    fn write_path_infos(&self, paths: &[PathInfo]) -> Result<(), StoreError> {
        self.with_tx(|tx| {
            for path in paths {
                tx_write_path_info(tx, path)?;
            }
            Ok(())
        })
    }

    fn list_path_infos(
        &self,
        client_id: ClientId,
        prefix: &str,
    ) -> Result<Vec<PathInfo>, StoreError> {
        self.with_tx(|tx| {
            let mut statement = tx
                .prepare(
                    "SELECT record FROM path_infos WHERE client_id = ?1 ORDER BY path",
                )
                .map_err(|err| db_err(&err))?;
            let rows = statement
                .query_map(params![col(client_id.as_raw())], |row| row.get::<_, String>(0))
                .map_err(|err| db_err(&err))?;
            let mut paths: Vec<PathInfo> = Vec::new();
            for row in rows {
                let info: PathInfo = from_json(&row.map_err(|err| db_err(&err))?)?;
                if info.path.starts_with(prefix) {
                    paths.push(info);
                }
            }
            if paths.is_empty() {
                return Err(StoreError::AtLeastOneUnknownPath(prefix.to_string()));
            }
            Ok(paths)
        })
    }

    fn create_flow(&self, start: &FlowStart) -> Result<(), StoreError> {
        self.with_tx(|tx| tx_insert_flow_start(tx, start))
    }

    fn read_flow(&self, client_id: ClientId, flow_id: FlowId) -> Result<Flow, StoreError> {
        self.with_tx(|tx| tx_read_flow(tx, client_id, flow_id))
    }

    fn list_flows(
        &self,
        client_id: ClientId,
        offset: u64,
        count: u64,
    ) -> Result<Vec<Flow>, StoreError> {
        self.with_tx(|tx| {
            let mut statement = tx
                .prepare(
                    "SELECT flow_id FROM flows WHERE client_id = ?1
                     ORDER BY created_at DESC LIMIT ?2 OFFSET ?3",
                )
                .map_err(|err| db_err(&err))?;
            let rows = statement
                .query_map(params![col(client_id.as_raw()), col(count), col(offset)], |row| {
                    row.get::<_, i64>(0)
                })
                .map_err(|err| db_err(&err))?;
            let mut flows = Vec::new();
            for row in rows {
                let flow_id = FlowId::from_raw(row.map_err(|err| db_err(&err))?.cast_unsigned());
                flows.push(tx_read_flow(tx, client_id, flow_id)?);
            }
            Ok(flows)
        })
    }

    fn set_flow_pending_termination(
        &self,
        client_id: ClientId,
        flow_id: FlowId,
        reason: &str,
    ) -> Result<(), StoreError> {
        self.with_tx(|tx| {
            let mut flow = tx_read_flow(tx, client_id, flow_id)?;
            flow.pending_termination = Some(reason.to_string());
            tx_write_flow(tx, &flow, false)
        })
    }

    fn lease_flow_for_processing(
        &self,
        client_id: ClientId,
        flow_id: FlowId,
        owner: &str,
        now: Timestamp,
        lease_duration: DurationMicros,
    ) -> Result<Flow, StoreError> {
        self.with_tx(|tx| {
            let mut flow = tx_read_flow(tx, client_id, flow_id)?;
            let free = flow.processing_deadline.is_none_or(|deadline| deadline <= now);
            if !free {
                return Err(StoreError::LeaseConflict(format!(
                    "flow {} leased by {}",
                    flow.long_id(),
                    flow.processing_owner.as_deref().unwrap_or("unknown")
                )));
            }
            flow.processing_owner = Some(owner.to_string());
            flow.processing_deadline = Some(now.saturating_add(lease_duration));
            flow.processing_lease_count = flow.processing_lease_count.saturating_add(1);
            tx_write_flow(tx, &flow, false)?;
            Ok(flow)
        })
    }

    fn release_processed_flow(&self, plan: &FlowPersistencePlan) -> Result<(), StoreError> {
        self.with_tx(|tx| {
            let current = tx_read_flow(tx, plan.flow.client_id, plan.flow.flow_id)?;
            if current.processing_owner.as_deref() != Some(plan.expected_owner.as_str()) {
                return Err(StoreError::LeaseConflict(format!(
                    "flow {} no longer leased by {}",
                    plan.flow.long_id(),
                    plan.expected_owner
                )));
            }
            tx_write_flow(tx, &plan.flow, false)?;
            for request_id in &plan.processed_request_ids {
                tx.execute(
                    "DELETE FROM flow_requests
                     WHERE client_id = ?1 AND flow_id = ?2 AND request_id = ?3",
                    params![
                        col(plan.flow.client_id.as_raw()),
                        col(plan.flow.flow_id.as_raw()),
                        col(request_id.as_raw()),
                    ],
                )
                .map_err(|err| db_err(&err))?;
                tx.execute(
                    "DELETE FROM flow_responses
                     WHERE client_id = ?1 AND flow_id = ?2 AND request_id = ?3",
                    params![
                        col(plan.flow.client_id.as_raw()),
                        col(plan.flow.flow_id.as_raw()),
                        col(request_id.as_raw()),
                    ],
                )
                .map_err(|err| db_err(&err))?;
            }
            for request in &plan.new_requests {
                tx_insert_request(tx, request)?;
                if request.needs_processing {
                    tx_enqueue_processing(
                        tx,
                        &FlowProcessingRequest {
                            client_id: request.client_id,
                            flow_id: request.flow_id,
                            written_at: request.created_at,
                            delivery_time: None,
                        },
                    )?;
                }
            }
            for message in &plan.new_messages {
                tx_insert_message(tx, message)?;
            }
            for result in &plan.new_results {
                tx_insert_result(tx, result)?;
            }
            for start in &plan.child_starts {
                tx_insert_flow_start(tx, start)?;
            }
            tx_apply_responses(tx, &plan.response_writes)?;
            for request in &plan.processing_requests {
                tx_enqueue_processing(tx, request)?;
            }
            for (client_id, knowledge_base) in &plan.knowledge_base_updates {
                if let Ok(mut client) = tx_read_client(tx, *client_id) {
                    client.knowledge_base = knowledge_base.clone();
                    tx_write_client(tx, &client)?;
                }
            }
            for path in &plan.path_info_writes {
                tx_write_path_info(tx, path)?;
            }
            if let Some((hunt_id, delta)) = &plan.hunt_delta {
                let mut hunt = tx_read_hunt(tx, *hunt_id)?;
                apply_hunt_delta(&mut hunt, delta);
                tx_write_hunt(tx, &hunt)?;
            }
            Ok(())
        })
    }

    fn write_flow_requests(
        &self,
        requests: &[FlowRequest],
        messages: &[ClientMessage],
    ) -> Result<(), StoreError> {
        self.with_tx(|tx| {
            for request in requests {
                tx_read_flow(tx, request.client_id, request.flow_id)?;
                tx_insert_request(tx, request)?;
            }
            for message in messages {
                tx_insert_message(tx, message)?;
            }
            Ok(())
        })
    }

    fn write_flow_responses(
        &self,
        responses: &[FlowResponse],
        _now: Timestamp,
    ) -> Result<(), StoreError> {
        self.with_tx(|tx| tx_apply_responses(tx, responses))
    }

    fn read_all_flow_requests_and_responses(
        &self,
        client_id: ClientId,
        flow_id: FlowId,
    ) -> Result<Vec<(FlowRequest, Vec<FlowResponse>)>, StoreError> {
        self.with_tx(|tx| tx_read_requests_and_responses(tx, client_id, flow_id, None))
    }

    fn read_flow_requests_ready_for_processing(
        &self,
        client_id: ClientId,
        flow_id: FlowId,
        cursor: RequestId,
    ) -> Result<Vec<(FlowRequest, Vec<FlowResponse>)>, StoreError> {
        self.with_tx(|tx| tx_read_requests_and_responses(tx, client_id, flow_id, Some(cursor)))
    }

    fn delete_flow_requests(
        &self,
        client_id: ClientId,
        flow_id: FlowId,
        request_ids: &[RequestId],
    ) -> Result<(), StoreError> {
        self.with_tx(|tx| {
            for request_id in request_ids {
                tx.execute(
                    "DELETE FROM flow_requests
                     WHERE client_id = ?1 AND flow_id = ?2 AND request_id = ?3",
                    params![col(client_id.as_raw()), col(flow_id.as_raw()), col(request_id.as_raw())],
                )
                .map_err(|err| db_err(&err))?;
                tx.execute(
                    "DELETE FROM flow_responses
                     WHERE client_id = ?1 AND flow_id = ?2 AND request_id = ?3",
                    params![col(client_id.as_raw()), col(flow_id.as_raw()), col(request_id.as_raw())],
                )
                .map_err(|err| db_err(&err))?;
            }
            Ok(())
        })
    }

    fn count_flow_requests(
        &self,
        client_id: ClientId,
        flow_id: FlowId,
    ) -> Result<u64, StoreError> {
        self.with_tx(|tx| {
            let count: i64 = tx
                .query_row(
                    "SELECT COUNT(*) FROM flow_requests WHERE client_id = ?1 AND flow_id = ?2",
                    params![col(client_id.as_raw()), col(flow_id.as_raw())],
                    |row| row.get(0),
                )
                .map_err(|err| db_err(&err))?;
            Ok(count.cast_unsigned())
        })
    }

    fn read_flow_results(
        &self,
        client_id: ClientId,
        flow_id: FlowId,
        offset: u64,
        count: u64,
    ) -> Result<Vec<FlowResult>, StoreError> {
        self.with_tx(|tx| {
            tx_read_flow(tx, client_id, flow_id)?;
            let mut statement = tx
                .prepare(
                    "SELECT record FROM flow_results
                     WHERE client_id = ?1 AND flow_id = ?2
                     ORDER BY seq LIMIT ?3 OFFSET ?4",
                )
                .map_err(|err| db_err(&err))?;
            let rows = statement
                .query_map(
                    params![col(client_id.as_raw()), col(flow_id.as_raw()), col(count), col(offset)],
                    |row| row.get::<_, String>(0),
                )
                .map_err(|err| db_err(&err))?;
            let mut results = Vec::new();
            for row in rows {
                results.push(from_json(&row.map_err(|err| db_err(&err))?)?);
            }
            Ok(results)
        })
    }

    fn read_hunt_results(
        &self,
        hunt_id: HuntId,
        offset: u64,
        count: u64,
    ) -> Result<Vec<FlowResult>, StoreError> {
        self.with_tx(|tx| {
            let mut statement = tx
                .prepare(
                    "SELECT record FROM flow_results WHERE hunt_id = ?1
                     ORDER BY seq LIMIT ?2 OFFSET ?3",
                )
                .map_err(|err| db_err(&err))?;
            let rows = statement
                .query_map(params![col(hunt_id.as_raw()), col(count), col(offset)], |row| {
                    row.get::<_, String>(0)
                })
                .map_err(|err| db_err(&err))?;
            let mut results = Vec::new();
            for row in rows {
                results.push(from_json(&row.map_err(|err| db_err(&err))?)?);
            }
            Ok(results)
        })
    }

    fn write_client_messages(&self, messages: &[ClientMessage]) -> Result<(), StoreError> {
        self.with_tx(|tx| {
            for message in messages {
                tx_insert_message(tx, message)?;
            }
            Ok(())
        })
    }

    fn lease_client_messages(
        &self,
        client_id: ClientId,
        owner: &str,
        now: Timestamp,
        lease_duration: DurationMicros,
        limit: u64,
    ) -> Result<Vec<ClientMessage>, StoreError> {
        self.with_tx(|tx| {
            let mut statement = tx
                .prepare(
                    "SELECT message_id, record, lease_count FROM client_messages
                     WHERE client_id = ?1
                       AND (lease_deadline IS NULL OR lease_deadline <= ?2)
                     ORDER BY message_id LIMIT ?3",
                )
                .map_err(|err| db_err(&err))?;
            let rows = statement
                .query_map(params![col(client_id.as_raw()), now.as_micros(), col(limit)], |row| {
                    Ok((row.get::<_, i64>(0)?, row.get::<_, String>(1)?, row.get::<_, i64>(2)?))
                })
                .map_err(|err| db_err(&err))?;
            let mut candidates = Vec::new();
            for row in rows {
                candidates.push(row.map_err(|err| db_err(&err))?);
            }
            drop(statement);
            let mut leased = Vec::with_capacity(candidates.len());
            for (message_id, record, lease_count) in candidates {
                let mut message: ClientMessage = from_json(&record)?;
                message.lease_owner = Some(owner.to_string());
                message.lease_deadline = Some(now.saturating_add(lease_duration));
                message.lease_count = lease_count.cast_unsigned().saturating_add(1);
                tx.execute(
                    "UPDATE client_messages
                     SET lease_owner = ?3, lease_deadline = ?4, lease_count = ?5
                     WHERE client_id = ?1 AND message_id = ?2",
                    params![
                        col(client_id.as_raw()),
                        message_id,
                        message.lease_owner,
                        message.lease_deadline.map(Timestamp::as_micros),
                        col(message.lease_count),
                    ],
                )
                .map_err(|err| db_err(&err))?;
                leased.push(message);
            }
            Ok(leased)
        })
    }

    fn delete_client_messages(
        &self,
        client_id: ClientId,
        message_ids: &[MessageId],
    ) -> Result<(), StoreError> {
        self.with_tx(|tx| {
            for message_id in message_ids {
                tx.execute(
                    "DELETE FROM client_messages WHERE client_id = ?1 AND message_id = ?2",
                    params![col(client_id.as_raw()), col(message_id.as_raw())],
                )
                .map_err(|err| db_err(&err))?;
            }
            Ok(())
        })
    }

    fn read_client_messages(&self, client_id: ClientId) -> Result<Vec<ClientMessage>, StoreError> {
        self.with_tx(|tx| {
            let mut statement = tx
                .prepare(
                    "SELECT record, lease_owner, lease_deadline, lease_count
                     FROM client_messages WHERE client_id = ?1 ORDER BY message_id",
                )
                .map_err(|err| db_err(&err))?;
            let rows = statement
                .query_map(params![col(client_id.as_raw())], |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, Option<String>>(1)?,
                        row.get::<_, Option<i64>>(2)?,
                        row.get::<_, i64>(3)?,
                    ))
                })
                .map_err(|err| db_err(&err))?;
            let mut messages = Vec::new();
            for row in rows {
                let (record, lease_owner, lease_deadline, lease_count) =
                    row.map_err(|err| db_err(&err))?;
                let mut message: ClientMessage = from_json(&record)?;
                message.lease_owner = lease_owner;
                message.lease_deadline = lease_deadline.map(Timestamp::from_micros);
                message.lease_count = lease_count.cast_unsigned();
                messages.push(message);
            }
            Ok(messages)
        })
    }

    fn write_flow_processing_requests(
        &self,
        requests: &[FlowProcessingRequest],
    ) -> Result<(), StoreError> {
        self.with_tx(|tx| {
            for request in requests {
                tx_enqueue_processing(tx, request)?;
            }
            Ok(())
        })
    }

    fn lease_flow_processing_requests(
        &self,
        owner: &str,
        now: Timestamp,
        lease_duration: DurationMicros,
        limit: u64,
    ) -> Result<Vec<FlowProcessingRequest>, StoreError> {
        self.with_tx(|tx| {
            let mut statement = tx
                .prepare(
                    "SELECT client_id, flow_id, written_at, delivery_time FROM flow_processing
                     WHERE (delivery_time IS NULL OR delivery_time <= ?1)
                       AND (lease_deadline IS NULL OR lease_deadline <= ?1)
                     ORDER BY written_at LIMIT ?2",
                )
                .map_err(|err| db_err(&err))?;
            let rows = statement
                .query_map(params![now.as_micros(), col(limit)], |row| {
                    Ok((
                        row.get::<_, i64>(0)?,
                        row.get::<_, i64>(1)?,
                        row.get::<_, i64>(2)?,
                        row.get::<_, Option<i64>>(3)?,
                    ))
                })
                .map_err(|err| db_err(&err))?;
            let mut due = Vec::new();
            for row in rows {
                due.push(row.map_err(|err| db_err(&err))?);
            }
            drop(statement);
            let mut leased = Vec::with_capacity(due.len());
            for (client_id, flow_id, written_at, delivery_time) in due {
                tx.execute(
                    "UPDATE flow_processing
                     SET lease_owner = ?3, lease_deadline = ?4,
                         lease_count = lease_count + 1
                     WHERE client_id = ?1 AND flow_id = ?2",
                    params![
                        client_id,
                        flow_id,
                        owner,
                        now.saturating_add(lease_duration).as_micros(),
                    ],
                )
                .map_err(|err| db_err(&err))?;
                leased.push(FlowProcessingRequest {
                    client_id: ClientId::from_raw(client_id.cast_unsigned()),
                    flow_id: FlowId::from_raw(flow_id.cast_unsigned()),
                    written_at: Timestamp::from_micros(written_at),
                    delivery_time: delivery_time.map(Timestamp::from_micros),
                });
            }
            Ok(leased)
        })
    }

    fn ack_flow_processing_request(
        &self,
        client_id: ClientId,
        flow_id: FlowId,
    ) -> Result<(), StoreError> {
        self.with_tx(|tx| {
            // A wake-up signaled again while leased survives the ack; only
            // its lease is cleared.
            let kept = tx
                .execute(
                    "UPDATE flow_processing
                     SET lease_owner = NULL, lease_deadline = NULL, resignaled = 0
                     WHERE client_id = ?1 AND flow_id = ?2 AND resignaled = 1",
                    params![col(client_id.as_raw()), col(flow_id.as_raw())],
                )
                .map_err(|err| db_err(&err))?;
            if kept == 0 {
                tx.execute(
                    "DELETE FROM flow_processing WHERE client_id = ?1 AND flow_id = ?2",
                    params![col(client_id.as_raw()), col(flow_id.as_raw())],
                )
                .map_err(|err| db_err(&err))?;
            }
            Ok(())
        })
    }

    fn write_message_handler_requests(
        &self,
        requests: &[MessageHandlerRequest],
    ) -> Result<(), StoreError> {
        self.with_tx(|tx| {
            for request in requests {
                tx.execute(
                    "INSERT OR REPLACE INTO handler_requests
                     (handler, request_id, lease_deadline, record)
                     VALUES (?1, ?2, NULL, ?3)",
                    params![request.handler_name, col(request.request_id), to_json(request)?],
                )
                .map_err(|err| db_err(&err))?;
            }
            Ok(())
        })
    }

    fn lease_message_handler_requests(
        &self,
        now: Timestamp,
        lease_duration: DurationMicros,
        limit: u64,
    ) -> Result<Vec<MessageHandlerRequest>, StoreError> {
        self.with_tx(|tx| {
            let mut statement = tx
                .prepare(
                    "SELECT handler, request_id, record FROM handler_requests
                     WHERE lease_deadline IS NULL OR lease_deadline <= ?1
                     ORDER BY handler, request_id LIMIT ?2",
                )
                .map_err(|err| db_err(&err))?;
            let rows = statement
                .query_map(params![now.as_micros(), col(limit)], |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, i64>(1)?,
                        row.get::<_, String>(2)?,
                    ))
                })
                .map_err(|err| db_err(&err))?;
            let mut due = Vec::new();
            for row in rows {
                due.push(row.map_err(|err| db_err(&err))?);
            }
            drop(statement);
            let deadline = now.saturating_add(lease_duration);
            let mut leased = Vec::with_capacity(due.len());
            for (handler, request_id, record) in due {
                tx.execute(
                    "UPDATE handler_requests SET lease_deadline = ?3
                     WHERE handler = ?1 AND request_id = ?2",
                    params![handler, request_id, deadline.as_micros()],
                )
                .map_err(|err| db_err(&err))?;
                let mut request: MessageHandlerRequest = from_json(&record)?;
                request.lease_deadline = Some(deadline);
                leased.push(request);
            }
            Ok(leased)
        })
    }

    fn delete_message_handler_requests(&self, keys: &[(String, u64)]) -> Result<(), StoreError> {
        self.with_tx(|tx| {
            for (handler, request_id) in keys {
                tx.execute(
                    "DELETE FROM handler_requests WHERE handler = ?1 AND request_id = ?2",
                    params![handler, col(*request_id)],
                )
                .map_err(|err| db_err(&err))?;
            }
            Ok(())
        })
    }

    fn write_approval(&self, approval: &Approval) -> Result<(), StoreError> {
        self.with_tx(|tx| {
            let inserted = tx
                .execute(
                    "INSERT OR IGNORE INTO approvals
                     (requestor, approval_id, approval_type, subject_id, expiration, record)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                    params![
                        approval.requestor.as_str(),
                        col(approval.approval_id.as_raw()),
                        approval.approval_type.to_string(),
                        approval.subject_id,
                        approval.expiration.as_micros(),
                        to_json(approval)?,
                    ],
                )
                .map_err(|err| db_err(&err))?;
            if inserted == 0 {
                return Err(StoreError::DuplicateKey(approval.approval_id.to_string()));
            }
            Ok(())
        })
    }

    fn read_approval(
        &self,
        requestor: &Username,
        approval_id: ApprovalId,
    ) -> Result<Approval, StoreError> {
        self.with_tx(|tx| {
            let record: Option<String> = tx
                .query_row(
                    "SELECT record FROM approvals WHERE requestor = ?1 AND approval_id = ?2",
                    params![requestor.as_str(), col(approval_id.as_raw())],
                    |row| row.get(0),
                )
                .optional()
                .map_err(|err| db_err(&err))?;
            from_json(&record.ok_or_else(|| StoreError::UnknownApproval(approval_id.to_string()))?)
        })
    }

    fn read_approvals(
        &self,
        requestor: &Username,
        approval_type: ApprovalType,
        subject_id: Option<&str>,
        include_expired: bool,
        now: Timestamp,
    ) -> Result<Vec<Approval>, StoreError> {
        self.with_tx(|tx| {
            let mut statement = tx
                .prepare(
                    "SELECT record FROM approvals
                     WHERE requestor = ?1 AND approval_type = ?2
                       AND (?3 IS NULL OR subject_id = ?3)
                       AND (?4 = 1 OR expiration > ?5)
                     ORDER BY approval_id",
                )
                .map_err(|err| db_err(&err))?;
            let rows = statement
                .query_map(
                    params![
                        requestor.as_str(),
                        approval_type.to_string(),
                        subject_id,
                        i64::from(include_expired),
                        now.as_micros(),
                    ],
                    |row| row.get::<_, String>(0),
                )
                .map_err(|err| db_err(&err))?;
            let mut approvals = Vec::new();
            for row in rows {
                approvals.push(from_json(&row.map_err(|err| db_err(&err))?)?);
            }
            Ok(approvals)
        })
    }

    fn grant_approval(
        &self,
        requestor: &Username,
        approval_id: ApprovalId,
        grant: &Grant,
    ) -> Result<(), StoreError> {
        self.with_tx(|tx| {
            let record: Option<String> = tx
                .query_row(
                    "SELECT record FROM approvals WHERE requestor = ?1 AND approval_id = ?2",
                    params![requestor.as_str(), col(approval_id.as_raw())],
                    |row| row.get(0),
                )
                .optional()
                .map_err(|err| db_err(&err))?;
            let mut approval: Approval = from_json(
                &record.ok_or_else(|| StoreError::UnknownApproval(approval_id.to_string()))?,
            )?;
            approval.grants.push(grant.clone());
            tx.execute(
                "UPDATE approvals SET record = ?3 WHERE requestor = ?1 AND approval_id = ?2",
                params![requestor.as_str(), col(approval_id.as_raw()), to_json(&approval)?],
            )
            .map_err(|err| db_err(&err))?;
            Ok(())
        })
    }

    fn write_hunt(&self, hunt: &Hunt) -> Result<(), StoreError> {
        self.with_tx(|tx| {
            let inserted = tx
                .execute(
                    "INSERT OR IGNORE INTO hunts (hunt_id, created_at, record)
                     VALUES (?1, ?2, ?3)",
                    params![col(hunt.hunt_id.as_raw()), hunt.created_at.as_micros(), to_json(hunt)?],
                )
                .map_err(|err| db_err(&err))?;
            if inserted == 0 {
                return Err(StoreError::DuplicateKey(hunt.hunt_id.to_string()));
            }
            Ok(())
        })
    }

    fn read_hunt(&self, hunt_id: HuntId) -> Result<Hunt, StoreError> {
        self.with_tx(|tx| tx_read_hunt(tx, hunt_id))
    }

    fn list_hunts(&self, offset: u64, count: u64) -> Result<Vec<Hunt>, StoreError> {
        self.with_tx(|tx| {
            let mut statement = tx
                .prepare(
                    "SELECT record FROM hunts ORDER BY created_at DESC LIMIT ?1 OFFSET ?2",
                )
                .map_err(|err| db_err(&err))?;
            let rows = statement
                .query_map(params![col(count), col(offset)], |row| row.get::<_, String>(0))
                .map_err(|err| db_err(&err))?;
            let mut hunts = Vec::new();
            for row in rows {
                hunts.push(from_json(&row.map_err(|err| db_err(&err))?)?);
            }
            Ok(hunts)
        })
    }

    fn set_hunt_state(&self, hunt_id: HuntId, state: HuntState) -> Result<(), StoreError> {
        self.with_tx(|tx| {
            let mut hunt = tx_read_hunt(tx, hunt_id)?;
            hunt.state = state;
            tx_write_hunt(tx, &hunt)
        })
    }

    fn record_hunt_dispatch(
        &self,
        hunt_id: HuntId,
        now: Timestamp,
        throttle_window: DurationMicros,
    ) -> Result<HuntAdmission, StoreError> {
        self.with_tx(|tx| {
            let mut hunt = tx_read_hunt(tx, hunt_id)?;
            if hunt.state != HuntState::Started {
                return Ok(HuntAdmission {
                    decision: HuntAdmissionDecision::NotRunning,
                    hunt,
                });
            }
            if now.since(hunt.throttle_window_start) >= throttle_window {
                hunt.throttle_window_start = now;
                hunt.dispatches_this_window = 0;
            }
            if hunt.client_limit > 0 && hunt.num_clients >= hunt.client_limit {
                tx_write_hunt(tx, &hunt)?;
                return Ok(HuntAdmission {
                    decision: HuntAdmissionDecision::LimitReached,
                    hunt,
                });
            }
            if hunt.client_rate > 0 && hunt.dispatches_this_window >= hunt.client_rate {
                tx_write_hunt(tx, &hunt)?;
                return Ok(HuntAdmission {
                    decision: HuntAdmissionDecision::Throttled,
                    hunt,
                });
            }
            hunt.num_clients = hunt.num_clients.saturating_add(1);
            hunt.dispatches_this_window = hunt.dispatches_this_window.saturating_add(1);
            tx_write_hunt(tx, &hunt)?;
            Ok(HuntAdmission { decision: HuntAdmissionDecision::Admitted, hunt })
        })
    }

    fn update_hunt_counters(
        &self,
        hunt_id: HuntId,
        delta: &HuntCounterDelta,
    ) -> Result<Hunt, StoreError> {
        self.with_tx(|tx| {
            let mut hunt = tx_read_hunt(tx, hunt_id)?;
            apply_hunt_delta(&mut hunt, delta);
            tx_write_hunt(tx, &hunt)?;
            Ok(hunt)
        })
    }

    fn read_hunt_flows(
        &self,
        hunt_id: HuntId,
        offset: u64,
        count: u64,
    ) -> Result<Vec<Flow>, StoreError> {
        self.with_tx(|tx| {
            let mut statement = tx
                .prepare(
                    "SELECT client_id, flow_id FROM flows WHERE hunt_id = ?1
                     ORDER BY client_id LIMIT ?2 OFFSET ?3",
                )
                .map_err(|err| db_err(&err))?;
            let rows = statement
                .query_map(params![col(hunt_id.as_raw()), col(count), col(offset)], |row| {
                    Ok((row.get::<_, i64>(0)?, row.get::<_, i64>(1)?))
                })
                .map_err(|err| db_err(&err))?;
            let mut keys = Vec::new();
            for row in rows {
                keys.push(row.map_err(|err| db_err(&err))?);
            }
            drop(statement);
            let mut flows = Vec::new();
            for (client_id, flow_id) in keys {
                flows.push(tx_read_flow(
                    tx,
                    ClientId::from_raw(client_id.cast_unsigned()),
                    FlowId::from_raw(flow_id.cast_unsigned()),
                )?);
            }
            Ok(flows)
        })
    }

    fn write_signed_binary_references(
        &self,
        references: &SignedBinaryReferences,
    ) -> Result<(), StoreError> {
        self.with_tx(|tx| {
            tx.execute(
                "INSERT OR REPLACE INTO signed_binaries (kind, path, record) VALUES (?1, ?2, ?3)",
                params![
                    references.id.binary_kind.to_string(),
                    references.id.path,
                    to_json(references)?,
                ],
            )
            .map_err(|err| db_err(&err))?;
            Ok(())
        })
    }

    fn read_signed_binary_references(
        &self,
        id: &SignedBinaryId,
    ) -> Result<SignedBinaryReferences, StoreError> {
        self.with_tx(|tx| {
            let record: Option<String> = tx
                .query_row(
                    "SELECT record FROM signed_binaries WHERE kind = ?1 AND path = ?2",
                    params![id.binary_kind.to_string(), id.path],
                    |row| row.get(0),
                )
                .optional()
                .map_err(|err| db_err(&err))?;
            from_json(&record.ok_or_else(|| {
                StoreError::UnknownBinary(format!("{}/{}", id.binary_kind, id.path))
            })?)
        })
    }

    fn read_ids_for_all_signed_binaries(&self) -> Result<Vec<SignedBinaryId>, StoreError> {
        self.with_tx(|tx| {
            let mut statement = tx
                .prepare("SELECT record FROM signed_binaries ORDER BY kind, path")
                .map_err(|err| db_err(&err))?;
            let rows = statement
                .query_map([], |row| row.get::<_, String>(0))
                .map_err(|err| db_err(&err))?;
            let mut ids = Vec::new();
            for row in rows {
                let references: SignedBinaryReferences =
                    from_json(&row.map_err(|err| db_err(&err))?)?;
                ids.push(references.id);
            }
            Ok(ids)
        })
    }
}

/// Reads requests joined with their ordered responses.
fn tx_read_requests_and_responses(
    tx: &Transaction<'_>,
    client_id: ClientId,
    flow_id: FlowId,
    ready_cursor: Option<RequestId>,
) -> Result<Vec<(FlowRequest, Vec<FlowResponse>)>, StoreError> {
    tx_read_flow(tx, client_id, flow_id)?;
    let mut statement = tx
        .prepare(
            "SELECT request_id, needs_processing, responses_expected, record
             FROM flow_requests WHERE client_id = ?1 AND flow_id = ?2
             ORDER BY request_id",
        )
        .map_err(|err| db_err(&err))?;
    let rows = statement
        .query_map(params![col(client_id.as_raw()), col(flow_id.as_raw())], |row| {
            Ok((
                row.get::<_, i64>(0)?,
                row.get::<_, i64>(1)?,
                row.get::<_, Option<i64>>(2)?,
                row.get::<_, String>(3)?,
            ))
        })
        .map_err(|err| db_err(&err))?;
    let mut requests = Vec::new();
    for row in rows {
        requests.push(row.map_err(|err| db_err(&err))?);
    }
    drop(statement);

    let mut out = Vec::new();
    for (request_id, needs_processing, responses_expected, record) in requests {
        let mut request: FlowRequest = from_json(&record)?;
        request.needs_processing = needs_processing != 0;
        request.responses_expected = responses_expected.map(i64::cast_unsigned);
        if let Some(cursor) = ready_cursor
            && (!request.needs_processing || request.request_id < cursor)
        {
            continue;
        }
        let mut statement = tx
            .prepare(
                "SELECT record FROM flow_responses
                 WHERE client_id = ?1 AND flow_id = ?2 AND request_id = ?3
                 ORDER BY response_id",
            )
            .map_err(|err| db_err(&err))?;
        let rows = statement
            .query_map(
                params![col(client_id.as_raw()), col(flow_id.as_raw()), request_id],
                |row| row.get::<_, String>(0),
            )
            .map_err(|err| db_err(&err))?;
        let mut responses = Vec::new();
        for row in rows {
            responses.push(from_json(&row.map_err(|err| db_err(&err))?)?);
        }
        out.push((request, responses));
    }
    Ok(out)
}

/// Applies hunt counter deltas in place.
fn apply_hunt_delta(hunt: &mut Hunt, delta: &HuntCounterDelta) {
    hunt.num_successful = hunt.num_successful.saturating_add(delta.num_successful);
    hunt.num_failed = hunt.num_failed.saturating_add(delta.num_failed);
    hunt.num_crashed = hunt.num_crashed.saturating_add(delta.num_crashed);
    hunt.num_results = hunt.num_results.saturating_add(delta.num_results);
    hunt.total_cpu_seconds += delta.total_cpu_seconds;
    hunt.total_network_bytes = hunt.total_network_bytes.saturating_add(delta.total_network_bytes);
}

// ============================================================================
// SECTION: BlobStore Implementation
// ============================================================================

impl BlobStore for SqliteOutpostStore {
    fn write_blobs(&self, blobs: &[Vec<u8>]) -> Result<Vec<BlobId>, StoreError> {
        self.with_tx(|tx| {
            let mut ids = Vec::with_capacity(blobs.len());
            for blob in blobs {
                let id = BlobId::of(blob);
                tx.execute(
                    "INSERT OR IGNORE INTO blobs (blob_id, data) VALUES (?1, ?2)",
                    params![id.as_bytes().as_slice(), blob],
                )
                .map_err(|err| db_err(&err))?;
                ids.push(id);
            }
            Ok(ids)
        })
    }

    fn read_blobs(&self, blob_ids: &[BlobId]) -> Result<Vec<Vec<u8>>, StoreError> {
        self.with_tx(|tx| {
            let mut blobs = Vec::with_capacity(blob_ids.len());
            for blob_id in blob_ids {
                let data: Option<Vec<u8>> = tx
                    .query_row(
                        "SELECT data FROM blobs WHERE blob_id = ?1",
                        params![blob_id.as_bytes().as_slice()],
                        |row| row.get(0),
                    )
                    .optional()
                    .map_err(|err| db_err(&err))?;
                blobs.push(data.ok_or(StoreError::UnknownBlob(*blob_id))?);
            }
            Ok(blobs)
        })
    }

    fn check_blobs_exist(&self, blob_ids: &[BlobId]) -> Result<Vec<bool>, StoreError> {
        self.with_tx(|tx| {
            let mut exists = Vec::with_capacity(blob_ids.len());
            for blob_id in blob_ids {
                let found: Option<i64> = tx
                    .query_row(
                        "SELECT 1 FROM blobs WHERE blob_id = ?1",
                        params![blob_id.as_bytes().as_slice()],
                        |row| row.get(0),
                    )
                    .optional()
                    .map_err(|err| db_err(&err))?;
                exists.push(found.is_some());
            }
            Ok(exists)
        })
    }

    fn write_blob_references(
        &self,
        file_id: &BlobId,
        references: &[BlobReference],
    ) -> Result<(), StoreError> {
        self.with_tx(|tx| {
            tx.execute(
                "INSERT OR REPLACE INTO blob_references (file_id, record) VALUES (?1, ?2)",
                params![file_id.as_bytes().as_slice(), to_json(&references.to_vec())?],
            )
            .map_err(|err| db_err(&err))?;
            Ok(())
        })
    }

    fn read_blob_references(&self, file_id: &BlobId) -> Result<Vec<BlobReference>, StoreError> {
        self.with_tx(|tx| {
            let record: Option<String> = tx
                .query_row(
                    "SELECT record FROM blob_references WHERE file_id = ?1",
                    params![file_id.as_bytes().as_slice()],
                    |row| row.get(0),
                )
                .optional()
                .map_err(|err| db_err(&err))?;
            from_json(&record.ok_or(StoreError::UnknownBlob(*file_id))?)
        })
    }
}
