use chrono::{DateTime, Utc};
use rusqlite::{ffi, params, Connection, ErrorCode, OptionalExtension, Row};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Mutex;
use thiserror::Error;
use tracy_core::{DomContext, NewRequest, NewTracerEvent, Request, Tracer, TracerEvent};

pub const TRACER_SCHEMA_VERSION: i64 = 1;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("tracer string {tracer_string:?} already stored")]
    DuplicateTracer {
        tracer_string: String,
        #[source]
        source: rusqlite::Error,
    },
    #[error("timestamp parse error: {0}")]
    Timestamp(String),
    #[error("unsupported schema version {found}, max supported {supported}")]
    UnsupportedSchemaVersion { found: i64, supported: i64 },
    #[error("store is closed")]
    Closed,
    #[error("store connection lock poisoned")]
    Poisoned,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConstraintKind {
    Unique,
    ForeignKey,
    NotNull,
    Check,
    Other,
}

impl StorageError {
    /// Classifies engine constraint failures; `None` for every other error.
    pub fn constraint(&self) -> Option<ConstraintKind> {
        match self {
            StorageError::Sqlite(err) => constraint_kind(err),
            StorageError::DuplicateTracer { .. } => Some(ConstraintKind::Unique),
            _ => None,
        }
    }
}

fn constraint_kind(err: &rusqlite::Error) -> Option<ConstraintKind> {
    let rusqlite::Error::SqliteFailure(err, _) = err else {
        return None;
    };
    if err.code != ErrorCode::ConstraintViolation {
        return None;
    }
    let kind = match err.extended_code {
        ffi::SQLITE_CONSTRAINT_UNIQUE | ffi::SQLITE_CONSTRAINT_PRIMARYKEY => ConstraintKind::Unique,
        ffi::SQLITE_CONSTRAINT_FOREIGNKEY => ConstraintKind::ForeignKey,
        ffi::SQLITE_CONSTRAINT_NOTNULL => ConstraintKind::NotNull,
        ffi::SQLITE_CONSTRAINT_CHECK => ConstraintKind::Check,
        _ => ConstraintKind::Other,
    };
    Some(kind)
}

/// Names the tracer string whose insert hit the UNIQUE index.
fn tracer_insert_error(source: rusqlite::Error, tracer_string: &str) -> StorageError {
    if constraint_kind(&source) == Some(ConstraintKind::Unique) {
        StorageError::DuplicateTracer {
            tracer_string: tracer_string.to_string(),
            source,
        }
    } else {
        StorageError::Sqlite(source)
    }
}

/// Persistence seam used by the tracer service. Implementations must make
/// `insert_request` and `insert_event` atomic.
pub trait TracerStore: Send + Sync {
    fn insert_request(&self, request: &NewRequest) -> Result<Request, StorageError>;
    fn request(&self, request_id: i64) -> Result<Option<Request>, StorageError>;
    fn tracer(&self, tracer_id: i64) -> Result<Option<Tracer>, StorageError>;
    fn tracers(&self) -> Result<Vec<Tracer>, StorageError>;
    fn insert_event(
        &self,
        tracer_id: i64,
        event: &NewTracerEvent,
    ) -> Result<TracerEvent, StorageError>;
    /// `None` when the tracer does not exist.
    fn events_for_tracer(&self, tracer_id: i64)
        -> Result<Option<Vec<TracerEvent>>, StorageError>;
}

/// SQLite-backed store holding exactly one connection. Every call takes the
/// connection lock, so writes never overlap.
pub struct TracerDb {
    conn: Mutex<Option<Connection>>,
}

impl TracerDb {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StorageError> {
        let conn = Connection::open(path)?;
        Self::init(conn)
    }

    pub fn open_in_memory() -> Result<Self, StorageError> {
        let conn = Connection::open_in_memory()?;
        Self::init(conn)
    }

    fn init(conn: Connection) -> Result<Self, StorageError> {
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        // in-memory databases answer "memory" here
        let _mode: String = conn.query_row("PRAGMA journal_mode = WAL", [], |row| row.get(0))?;
        migrate(&conn)?;
        Ok(Self {
            conn: Mutex::new(Some(conn)),
        })
    }

    /// Releases the connection. Any later call, including a second close,
    /// fails with [`StorageError::Closed`].
    pub fn close(&self) -> Result<(), StorageError> {
        let mut guard = self.conn.lock().map_err(|_| StorageError::Poisoned)?;
        let conn = guard.take().ok_or(StorageError::Closed)?;
        conn.close().map_err(|(_, err)| StorageError::Sqlite(err))
    }

    pub fn schema_version(&self) -> Result<i64, StorageError> {
        self.with_conn(|conn| schema_version(conn))
    }

    pub fn table_exists(&self, table_name: &str) -> Result<bool, StorageError> {
        self.with_conn(|conn| {
            let exists = conn
                .query_row(
                    "SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = ?1",
                    [table_name],
                    |_| Ok(()),
                )
                .optional()?;
            Ok(exists.is_some())
        })
    }

    fn with_conn<T>(
        &self,
        f: impl FnOnce(&mut Connection) -> Result<T, StorageError>,
    ) -> Result<T, StorageError> {
        let mut guard = self.conn.lock().map_err(|_| StorageError::Poisoned)?;
        let conn = guard.as_mut().ok_or(StorageError::Closed)?;
        f(conn)
    }
}

impl TracerStore for TracerDb {
    fn insert_request(&self, request: &NewRequest) -> Result<Request, StorageError> {
        self.with_conn(|conn| {
            let created_at = Utc::now();
            let tx = conn.transaction()?;
            tx.execute(
                "
                INSERT INTO requests (raw_request, request_url, request_method, created_at)
                VALUES (?1, ?2, ?3, ?4)
                ",
                params![
                    request.raw_request,
                    request.request_url,
                    request.request_method,
                    created_at.to_rfc3339(),
                ],
            )?;
            let request_id = tx.last_insert_rowid();

            let mut tracers = Vec::with_capacity(request.tracers.len());
            for tracer in &request.tracers {
                tx.execute(
                    "INSERT INTO tracers (request_id, tracer_string) VALUES (?1, ?2)",
                    params![request_id, tracer.tracer_string],
                )
                .map_err(|err| tracer_insert_error(err, &tracer.tracer_string))?;
                tracers.push(Tracer {
                    id: tx.last_insert_rowid(),
                    request_id,
                    tracer_string: tracer.tracer_string.clone(),
                    events: Vec::new(),
                });
            }
            tx.commit()?;

            Ok(Request {
                id: request_id,
                raw_request: request.raw_request.clone(),
                request_url: request.request_url.clone(),
                request_method: request.request_method.clone(),
                created_at,
                tracers,
            })
        })
    }

    fn request(&self, request_id: i64) -> Result<Option<Request>, StorageError> {
        self.with_conn(|conn| {
            let request = conn
                .query_row(
                    "
                    SELECT id, raw_request, request_url, request_method, created_at
                    FROM requests
                    WHERE id = ?1
                    ",
                    [request_id],
                    |row| {
                        Ok(Request {
                            id: row.get(0)?,
                            raw_request: row.get(1)?,
                            request_url: row.get(2)?,
                            request_method: row.get(3)?,
                            created_at: timestamp_column(row, 4)?,
                            tracers: Vec::new(),
                        })
                    },
                )
                .optional()?;

            let Some(mut request) = request else {
                return Ok(None);
            };
            let mut stmt = conn.prepare(
                "
                SELECT id, request_id, tracer_string
                FROM tracers
                WHERE request_id = ?1
                ORDER BY id ASC
                ",
            )?;
            let rows = stmt.query_map([request_id], map_tracer)?;
            for tracer in rows {
                let mut tracer = tracer?;
                tracer.events = load_events(conn, Some(tracer.id))?;
                request.tracers.push(tracer);
            }
            Ok(Some(request))
        })
    }

    fn tracer(&self, tracer_id: i64) -> Result<Option<Tracer>, StorageError> {
        self.with_conn(|conn| {
            let tracer = conn
                .query_row(
                    "SELECT id, request_id, tracer_string FROM tracers WHERE id = ?1",
                    [tracer_id],
                    map_tracer,
                )
                .optional()?;
            match tracer {
                Some(mut tracer) => {
                    tracer.events = load_events(conn, Some(tracer_id))?;
                    Ok(Some(tracer))
                }
                None => Ok(None),
            }
        })
    }

    fn tracers(&self) -> Result<Vec<Tracer>, StorageError> {
        self.with_conn(|conn| {
            let mut by_tracer: HashMap<i64, Vec<TracerEvent>> = HashMap::new();
            for event in load_events(conn, None)? {
                by_tracer.entry(event.tracer_id).or_default().push(event);
            }

            let mut stmt = conn.prepare(
                "SELECT id, request_id, tracer_string FROM tracers ORDER BY id ASC",
            )?;
            let rows = stmt.query_map([], map_tracer)?;
            let mut tracers = Vec::new();
            for tracer in rows {
                let mut tracer = tracer?;
                tracer.events = by_tracer.remove(&tracer.id).unwrap_or_default();
                tracers.push(tracer);
            }
            Ok(tracers)
        })
    }

    fn insert_event(
        &self,
        tracer_id: i64,
        event: &NewTracerEvent,
    ) -> Result<TracerEvent, StorageError> {
        self.with_conn(|conn| {
            let created_at = Utc::now();
            let tx = conn.transaction()?;
            tx.execute(
                "
                INSERT INTO tracer_events (tracer_id, event_type, location, data, created_at)
                VALUES (?1, ?2, ?3, ?4, ?5)
                ",
                params![
                    tracer_id,
                    event.event_type,
                    event.location,
                    event.data,
                    created_at.to_rfc3339(),
                ],
            )?;
            let event_id = tx.last_insert_rowid();

            let dom_context = match &event.dom_context {
                Some(context) => {
                    tx.execute(
                        "
                        INSERT INTO dom_contexts (tracer_event_id, node_type, location_type, snippet)
                        VALUES (?1, ?2, ?3, ?4)
                        ",
                        params![
                            event_id,
                            context.node_type,
                            context.location_type,
                            context.snippet,
                        ],
                    )?;
                    Some(DomContext {
                        id: tx.last_insert_rowid(),
                        tracer_event_id: event_id,
                        node_type: context.node_type.clone(),
                        location_type: context.location_type.clone(),
                        snippet: context.snippet.clone(),
                    })
                }
                None => None,
            };
            tx.commit()?;

            Ok(TracerEvent {
                id: event_id,
                tracer_id,
                event_type: event.event_type.clone(),
                location: event.location.clone(),
                data: event.data.clone(),
                created_at,
                dom_context,
            })
        })
    }

    fn events_for_tracer(
        &self,
        tracer_id: i64,
    ) -> Result<Option<Vec<TracerEvent>>, StorageError> {
        self.with_conn(|conn| {
            let exists = conn
                .query_row("SELECT 1 FROM tracers WHERE id = ?1", [tracer_id], |_| {
                    Ok(())
                })
                .optional()?;
            if exists.is_none() {
                return Ok(None);
            }
            load_events(conn, Some(tracer_id)).map(Some)
        })
    }
}

fn schema_version(conn: &Connection) -> Result<i64, StorageError> {
    Ok(conn.query_row("PRAGMA user_version", [], |row| row.get(0))?)
}

fn migrate(conn: &Connection) -> Result<(), StorageError> {
    let current = schema_version(conn)?;
    if current > TRACER_SCHEMA_VERSION {
        return Err(StorageError::UnsupportedSchemaVersion {
            found: current,
            supported: TRACER_SCHEMA_VERSION,
        });
    }

    if current < 1 {
        let sql = include_str!("../migrations/0001_tracer_schema.sql");
        conn.execute_batch(sql)?;
        conn.execute("PRAGMA user_version = 1", []).map(|_| ())?;
    }

    Ok(())
}

/// Events ordered by id, with their DOM context when one was recorded.
/// `tracer_id == None` loads events for every tracer.
fn load_events(
    conn: &Connection,
    tracer_id: Option<i64>,
) -> Result<Vec<TracerEvent>, StorageError> {
    let mut stmt = conn.prepare(
        "
        SELECT e.id, e.tracer_id, e.event_type, e.location, e.data, e.created_at,
               d.id, d.node_type, d.location_type, d.snippet
        FROM tracer_events e
        LEFT JOIN dom_contexts d ON d.tracer_event_id = e.id
        WHERE ?1 IS NULL OR e.tracer_id = ?1
        ORDER BY e.id ASC
        ",
    )?;
    let rows = stmt.query_map([tracer_id], |row| {
        let event_id: i64 = row.get(0)?;
        let dom_context = match row.get::<_, Option<i64>>(6)? {
            Some(id) => Some(DomContext {
                id,
                tracer_event_id: event_id,
                node_type: row.get(7)?,
                location_type: row.get(8)?,
                snippet: row.get(9)?,
            }),
            None => None,
        };
        Ok(TracerEvent {
            id: event_id,
            tracer_id: row.get(1)?,
            event_type: row.get(2)?,
            location: row.get(3)?,
            data: row.get(4)?,
            created_at: timestamp_column(row, 5)?,
            dom_context,
        })
    })?;

    let mut events = Vec::new();
    for event in rows {
        events.push(event?);
    }
    Ok(events)
}

fn map_tracer(row: &Row<'_>) -> rusqlite::Result<Tracer> {
    Ok(Tracer {
        id: row.get(0)?,
        request_id: row.get(1)?,
        tracer_string: row.get(2)?,
        events: Vec::new(),
    })
}

fn timestamp_column(row: &Row<'_>, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let value: String = row.get(idx)?;
    parse_timestamp(&value).map_err(|err| {
        rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(err))
    })
}

fn parse_timestamp(value: &str) -> Result<DateTime<Utc>, StorageError> {
    DateTime::parse_from_rfc3339(value)
        .map(|timestamp| timestamp.with_timezone(&Utc))
        .map_err(|err| StorageError::Timestamp(err.to_string()))
}
