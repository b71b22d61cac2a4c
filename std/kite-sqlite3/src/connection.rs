//!
//! SQLite Connection
//!
//! Wraps a rusqlite `Connection` registered in a `DatabaseRegistry`. The
//! connection is boxed so its address is stable; that address is the
//! connection pointer every statement-cache operation is keyed by.
//!
//! Statements are compiled against the boxed connection with a `'static`
//! borrow and parked in the statement object's meta slot (`StatementSlot`).
//! The box sits behind a mutex shared with every slot compiled on it:
//! stepping, finalizing and dropping a statement all hold that mutex, so a
//! statement object may be released on any thread. The connection remembers
//! every slot it created and finalizes the live ones before the underlying
//! connection closes. Using a statement after it has been finalized
//! (evicted, removed, closed) is an error, not a dangling access.
//!
//! Lock order: registry, then connection, then statement.
//!

use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

use rusqlite::types::{Null, ValueRef};
use rusqlite::{Connection, DatabaseName, OpenFlags, Row, Statement};

use kite_core::{ManagedRef, Value};
use kite_handles::{Handle, NativePtr};

use crate::cache::StatementFinalizer;
use crate::database::DatabaseRegistry;
use crate::error::SqliteError;
use crate::window::{CursorWindow, WindowError};

pub const OPEN_READWRITE: i32 = 0x0000_0000;
pub const OPEN_READONLY: i32 = 0x0000_0001;
pub const CREATE_IF_NECESSARY: i32 = 0x1000_0000;

pub const DEFAULT_BUSY_TIMEOUT: Duration = Duration::from_millis(2500);
pub const DEFAULT_CACHE_SIZE: usize = 25;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectionOptions {
    pub busy_timeout: Duration,
    pub max_cache_size: usize,
}

impl Default for ConnectionOptions {
    fn default() -> Self {
        Self {
            busy_timeout: DEFAULT_BUSY_TIMEOUT,
            max_cache_size: DEFAULT_CACHE_SIZE,
        }
    }
}

/// The open connection, `None` once closed.
type SharedConnection = Arc<Mutex<Option<Box<Connection>>>>;

fn lock_connection(shared: &Mutex<Option<Box<Connection>>>) -> MutexGuard<'_, Option<Box<Connection>>> {
    shared.lock().unwrap_or_else(|e| e.into_inner())
}

/// Native state of one compiled statement.
pub struct StatementSlot {
    sql: String,
    connection: NativePtr,
    owner: SharedConnection,
    statement: Mutex<Option<Statement<'static>>>,
}

// The statement is only stepped, finalized or dropped while `owner` is
// locked, and every slot is finalized before the connection leaves `owner`.
unsafe impl Send for StatementSlot {}
unsafe impl Sync for StatementSlot {}

impl StatementSlot {
    fn lock(&self) -> MutexGuard<'_, Option<Statement<'static>>> {
        self.statement.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn sql(&self) -> &str {
        &self.sql
    }

    pub fn connection(&self) -> NativePtr {
        self.connection
    }

    /// Release the native statement. Returns false if it was already gone.
    pub fn finalize(&self) -> bool {
        let _connection = lock_connection(&self.owner);
        self.release()
    }

    /// Finalize with the connection lock already held.
    fn release(&self) -> bool {
        let statement = self.lock().take();
        let finalized = statement.is_some();
        drop(statement);
        if finalized {
            tracing::trace!(sql = %self.sql, "statement finalized");
        }
        finalized
    }

    pub fn is_finalized(&self) -> bool {
        self.lock().is_none()
    }
}

impl Drop for StatementSlot {
    fn drop(&mut self) {
        let statement = self
            .statement
            .get_mut()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(statement) = statement {
            let _connection = lock_connection(&self.owner);
            drop(statement);
        }
    }
}

/// Finalizer for statement objects compiled by `SqliteConnection`. Objects
/// without a statement slot are left alone.
#[derive(Debug, Default, Clone, Copy)]
pub struct FinalizeStatement;

impl StatementFinalizer for FinalizeStatement {
    fn finalize(&self, connection: NativePtr, statement: &ManagedRef) {
        match statement.meta::<StatementSlot>() {
            Some(slot) => {
                if slot.connection() != connection {
                    tracing::warn!(
                        sql = %slot.sql(),
                        "finalizing statement on behalf of a different connection"
                    );
                }
                slot.finalize();
            }
            None => tracing::trace!(object = statement.id(), "not a statement object"),
        }
    }
}

enum CopyRow {
    Ok,
    Full,
}

pub struct SqliteConnection {
    conn: SharedConnection,
    pointer: NativePtr,
    path: String,
    label: String,
    flags: i32,
    registry: Arc<DatabaseRegistry>,
    data_id: Handle,
    statements: Mutex<Vec<Weak<StatementSlot>>>,
}

impl std::fmt::Debug for SqliteConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteConnection")
            .field("path", &self.path)
            .field("label", &self.label)
            .field("flags", &self.flags)
            .field("data_id", &self.data_id)
            .finish_non_exhaustive()
    }
}

impl SqliteConnection {
    /// Open `path` and register the connection (and its statement cache).
    pub fn open(
        registry: Arc<DatabaseRegistry>,
        path: &str,
        flags: i32,
        label: &str,
        options: ConnectionOptions,
    ) -> Result<Self, SqliteError> {
        let read_only = flags & OPEN_READONLY != 0;
        let mut open_flags = if read_only {
            OpenFlags::SQLITE_OPEN_READ_ONLY
        } else {
            OpenFlags::SQLITE_OPEN_READ_WRITE
        };
        if flags & CREATE_IF_NECESSARY != 0 {
            open_flags |= OpenFlags::SQLITE_OPEN_CREATE;
        }
        open_flags |= OpenFlags::SQLITE_OPEN_URI | OpenFlags::SQLITE_OPEN_FULL_MUTEX;

        let conn = Connection::open_with_flags(path, open_flags)?;
        // SQLite silently falls back to read-only when it cannot write.
        if !read_only && conn.is_readonly(DatabaseName::Main)? {
            return Err(SqliteError::ReadOnly {
                path: path.to_string(),
            });
        }
        conn.busy_timeout(options.busy_timeout)?;
        let conn = Box::new(conn);
        let pointer = NativePtr::from(&*conn as *const Connection as usize);

        let data_id = registry.next_data_id()?;
        registry.create_data_store(data_id, options.max_cache_size as i64)?;
        registry.put_connection_ptr(data_id, pointer)?;
        tracing::debug!(%path, %label, %data_id, "connection opened");

        Ok(Self {
            conn: Arc::new(Mutex::new(Some(conn))),
            pointer,
            path: path.to_string(),
            label: label.to_string(),
            flags,
            registry,
            data_id,
            statements: Mutex::new(Vec::new()),
        })
    }

    /// Open a private in-memory database.
    pub fn open_in_memory(registry: Arc<DatabaseRegistry>, options: ConnectionOptions) -> Result<Self, SqliteError> {
        Self::open(registry, ":memory:", CREATE_IF_NECESSARY, ":memory:", options)
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn flags(&self) -> i32 {
        self.flags
    }

    pub fn data_id(&self) -> Handle {
        self.data_id
    }

    pub fn registry(&self) -> &Arc<DatabaseRegistry> {
        &self.registry
    }

    pub fn is_closed(&self) -> bool {
        lock_connection(&self.conn).is_none()
    }

    pub fn pointer(&self) -> NativePtr {
        if self.is_closed() {
            NativePtr::NULL
        } else {
            self.pointer
        }
    }

    fn track(&self, slot: &Arc<StatementSlot>) {
        let mut statements = self.statements.lock().unwrap_or_else(|e| e.into_inner());
        statements.retain(|weak| weak.strong_count() > 0);
        statements.push(Arc::downgrade(slot));
    }

    /// Return the cached statement for `sql`, or compile and cache it.
    pub fn prepare(&self, sql: &str) -> Result<ManagedRef, SqliteError> {
        if let Some(statement) = self.registry.get_stmt(self.data_id, sql)? {
            tracing::trace!(%sql, "statement cache hit");
            return Ok(statement);
        }

        let object = ManagedRef::new(Value::Str(sql.to_string()));
        {
            let guard = lock_connection(&self.conn);
            let conn = guard.as_deref().ok_or(SqliteError::Closed)?;
            // SAFETY: the connection is boxed and every statement compiled
            // here is finalized before the box leaves `self.conn`.
            let conn: &'static Connection = unsafe { &*(conn as *const Connection) };
            let compiled = conn
                .prepare(sql)
                .map_err(|e| SqliteError::while_compiling(e, sql))?;

            let owner = Arc::clone(&self.conn);
            let pointer = self.pointer;
            let slot = object
                .attach_meta(move || StatementSlot {
                    sql: sql.to_string(),
                    connection: pointer,
                    owner,
                    statement: Mutex::new(Some(compiled)),
                })
                .ok_or(SqliteError::NotAStatement)?;
            self.track(&slot);
        }

        // Caching may evict and finalize another statement, which takes the
        // connection lock again.
        if self.registry.cache_enabled(self.data_id)? {
            self.registry
                .put_stmt(self.data_id, self.pointer, sql, object.clone())?;
        }
        Ok(object)
    }

    /// Run `f` on the compiled statement with the connection locked.
    fn with_statement<R>(
        &self,
        statement: &ManagedRef,
        f: impl FnOnce(&Connection, &mut Statement<'static>) -> Result<R, SqliteError>,
    ) -> Result<R, SqliteError> {
        let guard = lock_connection(&self.conn);
        let conn = guard.as_deref().ok_or(SqliteError::Closed)?;
        let slot = statement
            .meta::<StatementSlot>()
            .filter(|slot| slot.connection() == self.pointer)
            .ok_or(SqliteError::NotAStatement)?;
        let mut stmt = slot.lock();
        let stmt = stmt.as_mut().ok_or_else(|| SqliteError::Finalized {
            sql: slot.sql().to_string(),
        })?;
        f(conn, stmt)
    }

    pub fn bind_null(&self, statement: &ManagedRef, index: usize) -> Result<(), SqliteError> {
        self.with_statement(statement, |_, s| Ok(s.raw_bind_parameter(index, Null)?))
    }

    pub fn bind_long(&self, statement: &ManagedRef, index: usize, value: i64) -> Result<(), SqliteError> {
        self.with_statement(statement, |_, s| Ok(s.raw_bind_parameter(index, value)?))
    }

    pub fn bind_double(&self, statement: &ManagedRef, index: usize, value: f64) -> Result<(), SqliteError> {
        self.with_statement(statement, |_, s| Ok(s.raw_bind_parameter(index, value)?))
    }

    pub fn bind_string(&self, statement: &ManagedRef, index: usize, value: &str) -> Result<(), SqliteError> {
        self.with_statement(statement, |_, s| Ok(s.raw_bind_parameter(index, value)?))
    }

    pub fn bind_blob(&self, statement: &ManagedRef, index: usize, value: &[u8]) -> Result<(), SqliteError> {
        self.with_statement(statement, |_, s| Ok(s.raw_bind_parameter(index, value)?))
    }

    /// Statements are reset after every execution, so this only has to drop
    /// the bound values.
    pub fn reset_and_clear_bindings(&self, statement: &ManagedRef) -> Result<(), SqliteError> {
        self.with_statement(statement, |_, s| {
            s.clear_bindings();
            Ok(())
        })
    }

    pub fn parameter_count(&self, statement: &ManagedRef) -> Result<usize, SqliteError> {
        self.with_statement(statement, |_, s| Ok(s.parameter_count()))
    }

    pub fn column_count(&self, statement: &ManagedRef) -> Result<usize, SqliteError> {
        self.with_statement(statement, |_, s| Ok(s.column_count()))
    }

    pub fn column_names(&self, statement: &ManagedRef) -> Result<Vec<String>, SqliteError> {
        self.with_statement(statement, |_, s| {
            Ok(s.column_names().into_iter().map(str::to_string).collect())
        })
    }

    pub fn is_read_only(&self, statement: &ManagedRef) -> Result<bool, SqliteError> {
        self.with_statement(statement, |_, s| Ok(s.readonly()))
    }

    /// Step the statement to completion, discarding any rows.
    pub fn execute(&self, statement: &ManagedRef) -> Result<(), SqliteError> {
        self.with_statement(statement, |_, s| step_all(s))
    }

    pub fn execute_for_changed_row_count(&self, statement: &ManagedRef) -> Result<i64, SqliteError> {
        self.with_statement(statement, |conn, s| {
            step_all(s)?;
            Ok(conn.changes() as i64)
        })
    }

    /// Row id of the inserted row, or -1 when nothing changed.
    pub fn execute_for_last_inserted_row_id(&self, statement: &ManagedRef) -> Result<i64, SqliteError> {
        self.with_statement(statement, |conn, s| {
            step_all(s)?;
            Ok(if conn.changes() > 0 {
                conn.last_insert_rowid()
            } else {
                -1
            })
        })
    }

    fn first_column<R>(
        &self,
        statement: &ManagedRef,
        read: impl FnOnce(ValueRef<'_>) -> R,
    ) -> Result<Option<R>, SqliteError> {
        self.with_statement(statement, |_, s| {
            let mut rows = s.raw_query();
            match rows.next()? {
                Some(row) => Ok(Some(read(row.get_ref(0)?))),
                None => Ok(None),
            }
        })
    }

    /// First column of the first row as an integer, or -1 without a row.
    pub fn execute_for_long(&self, statement: &ManagedRef) -> Result<i64, SqliteError> {
        let value = self.first_column(statement, |v| match v {
            ValueRef::Integer(i) => i,
            ValueRef::Real(f) => f as i64,
            ValueRef::Text(t) => String::from_utf8_lossy(t).trim().parse().unwrap_or(0),
            ValueRef::Null | ValueRef::Blob(_) => 0,
        })?;
        Ok(value.unwrap_or(-1))
    }

    /// First column of the first row as text; `None` without a row or for NULL.
    pub fn execute_for_string(&self, statement: &ManagedRef) -> Result<Option<String>, SqliteError> {
        let value = self.first_column(statement, |v| match v {
            ValueRef::Integer(i) => Some(i.to_string()),
            ValueRef::Real(f) => Some(f.to_string()),
            ValueRef::Text(t) | ValueRef::Blob(t) => Some(String::from_utf8_lossy(t).into_owned()),
            ValueRef::Null => None,
        })?;
        Ok(value.flatten())
    }

    /// Fill `window` with rows of `statement` starting at `start_pos`.
    ///
    /// If the window fills up before `required_pos` is reached, the window is
    /// restarted at the current row so `required_pos` always ends up inside
    /// it. With `count_all_rows` the remaining rows are stepped through to
    /// count them. Returns `(window_start, total_rows)`; `total_rows` only
    /// covers the rows that were stepped.
    pub fn execute_for_cursor_window(
        &self,
        statement: &ManagedRef,
        window: &mut CursorWindow,
        start_pos: i32,
        required_pos: i32,
        count_all_rows: bool,
    ) -> Result<(i32, i32), SqliteError> {
        window.clear();
        let (start, total) = self.with_statement(statement, |_, s| {
            let num_columns = s.column_count();
            window.set_num_columns(num_columns)?;

            let mut start = start_pos;
            let mut total = 0i32;
            let mut added = 0i32;
            let mut full = false;
            let mut rows = s.raw_query();

            while !full || count_all_rows {
                let Some(row) = rows.next()? else {
                    break;
                };
                total += 1;
                if start >= total || full {
                    continue;
                }

                let mut copied = copy_row(window, row, num_columns, added as usize)?;
                if matches!(copied, CopyRow::Full) && added > 0 && start + added <= required_pos {
                    // Filled before reaching the required row: restart here.
                    window.clear();
                    window.set_num_columns(num_columns)?;
                    start += added;
                    added = 0;
                    copied = copy_row(window, row, num_columns, 0)?;
                }

                match copied {
                    CopyRow::Ok => added += 1,
                    CopyRow::Full => full = true,
                }
            }
            Ok((start, total))
        })?;

        if start > total {
            tracing::warn!(start, total, "cursor window start is past the last row");
        }
        window.set_start_position(start);
        tracing::trace!(start, total, rows = window.num_rows(), "cursor window filled");
        Ok((start, total))
    }

    /// Finalize every live slot. The caller holds the connection lock.
    fn finalize_tracked(&self) -> usize {
        let statements = std::mem::take(&mut *self.statements.lock().unwrap_or_else(|e| e.into_inner()));
        statements
            .iter()
            .filter_map(Weak::upgrade)
            .filter(|slot| slot.release())
            .count()
    }

    fn shutdown(&mut self) -> Result<(), SqliteError> {
        if self.is_closed() {
            return Ok(());
        }
        let evicted = self
            .registry
            .evict_all(self.data_id, self.pointer)
            .unwrap_or_else(|e| {
                tracing::warn!(data_id = %self.data_id, error = %e, "statement cache already gone");
                0
            });

        let conn = {
            let mut guard = lock_connection(&self.conn);
            // Must run before the connection leaves the lock, whatever happened above.
            let stragglers = self.finalize_tracked();
            tracing::debug!(path = %self.path, evicted, stragglers, "connection closing");
            guard.take()
        };
        if let Err(e) = self.registry.remove_data_store(self.data_id) {
            tracing::warn!(data_id = %self.data_id, error = %e, "failed to remove database store");
        }

        match conn {
            Some(conn) => (*conn).close().map_err(|(_, e)| SqliteError::from(e)),
            None => Ok(()),
        }
    }

    /// Finalize every statement (cached or not) and close the connection.
    pub fn close(mut self) -> Result<(), SqliteError> {
        self.shutdown()
    }
}

impl Drop for SqliteConnection {
    fn drop(&mut self) {
        if let Err(e) = self.shutdown() {
            tracing::warn!(path = %self.path, error = %e, "failed to close connection");
        }
    }
}

fn step_all(statement: &mut Statement<'_>) -> Result<(), SqliteError> {
    let mut rows = statement.raw_query();
    while rows.next()?.is_some() {}
    Ok(())
}

fn copy_row(window: &mut CursorWindow, row: &Row<'_>, num_columns: usize, at: usize) -> Result<CopyRow, SqliteError> {
    if let Err(e) = window.alloc_row() {
        return match e {
            WindowError::Full => Ok(CopyRow::Full),
            other => Err(other.into()),
        };
    }

    for column in 0..num_columns {
        let put = match row.get_ref(column)? {
            ValueRef::Null => window.put_null(at, column),
            ValueRef::Integer(v) => window.put_long(at, column, v),
            ValueRef::Real(v) => window.put_double(at, column, v),
            ValueRef::Text(t) => window.put_string(at, column, &String::from_utf8_lossy(t)),
            ValueRef::Blob(b) => window.put_blob(at, column, b),
        };
        match put {
            Ok(()) => {}
            Err(WindowError::Full) => {
                window.free_last_row()?;
                return Ok(CopyRow::Full);
            }
            Err(other) => {
                window.free_last_row()?;
                return Err(other.into());
            }
        }
    }
    Ok(CopyRow::Ok)
}
