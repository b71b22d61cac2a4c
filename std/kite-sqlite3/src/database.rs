///
/// Database Registry
///
/// Two handle tables:
/// - databases: data id -> `DatabaseInfo` (statement cache, connection pointer,
///   transaction and configuration slots)
/// - helpers: helper id -> stable pointer to a host-side helper object
///
/// Data ids come from `next_data_id` and must be installed with
/// `create_data_store` before use. Every statement-cache operation runs under
/// the databases table lock, so `evict_all` finalizes a connection's whole
/// cache without interleaving with other puts.
///

use std::sync::Arc;

use kite_core::{ManagedRef, StablePtr};
use kite_handles::{Handle, HandleError, HandleTable, NativePtr};

use crate::cache::{CacheStats, StatementCache, StatementFinalizer};
use crate::connection::FinalizeStatement;
use crate::error::SqliteError;

pub struct DatabaseInfo {
    cache: StatementCache,
    connection: NativePtr,
    transaction: Option<StablePtr>,
    config: Option<StablePtr>,
}

impl DatabaseInfo {
    fn new(cache: StatementCache) -> Self {
        Self {
            cache,
            connection: NativePtr::NULL,
            transaction: None,
            config: None,
        }
    }
}

pub struct DatabaseRegistry {
    databases: HandleTable<DatabaseInfo>,
    helpers: HandleTable<StablePtr>,
    finalizer: Arc<dyn StatementFinalizer>,
}

impl Default for DatabaseRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl DatabaseRegistry {
    /// Registry whose caches finalize statements compiled by `SqliteConnection`.
    pub fn new() -> Self {
        Self::with_finalizer(Arc::new(FinalizeStatement))
    }

    pub fn with_finalizer(finalizer: Arc<dyn StatementFinalizer>) -> Self {
        Self::with_first_id(finalizer, 1)
    }

    pub fn with_first_id(finalizer: Arc<dyn StatementFinalizer>, first_id: i32) -> Self {
        Self {
            databases: HandleTable::with_first_id("database", first_id),
            helpers: HandleTable::with_first_id("helper info", first_id),
            finalizer,
        }
    }

    fn with_info<R>(
        &self,
        data_id: Handle,
        f: impl FnOnce(&mut DatabaseInfo, &dyn StatementFinalizer) -> R,
    ) -> Result<R, SqliteError> {
        let finalizer = self.finalizer.as_ref();
        self.databases
            .with_mut(data_id, |slot| slot.as_mut().map(|info| f(info, finalizer)))?
            .ok_or_else(|| {
                SqliteError::Handle(HandleError::NotFound {
                    table: self.databases.name(),
                    handle: data_id,
                })
            })
    }

    pub fn next_data_id(&self) -> Result<Handle, SqliteError> {
        Ok(self.databases.reserve()?)
    }

    /// Install the store for a data id from `next_data_id`. A rejected cache
    /// size gives the reservation up, so the id cannot be used afterwards.
    pub fn create_data_store(&self, data_id: Handle, max_cache_size: i64) -> Result<(), SqliteError> {
        let cache = usize::try_from(max_cache_size)
            .map_err(|_| SqliteError::CacheSizeOutOfRange(max_cache_size))
            .and_then(StatementCache::new);
        let cache = match cache {
            Ok(cache) => cache,
            Err(e) => {
                self.databases.release(data_id);
                return Err(e);
            }
        };
        self.databases.install(data_id, DatabaseInfo::new(cache))?;
        tracing::debug!(%data_id, max_cache_size, "database store created");
        Ok(())
    }

    /// Finalize every cached statement and drop the store.
    pub fn remove_data_store(&self, data_id: Handle) -> Result<(), SqliteError> {
        let finalizer = self.finalizer.as_ref();
        self.databases.with_mut(data_id, |slot| {
            if let Some(info) = slot.as_mut() {
                info.cache.evict_all(info.connection, finalizer);
            }
        })?;
        self.databases.remove(data_id)?;
        tracing::debug!(%data_id, "database store removed");
        Ok(())
    }

    pub fn contains(&self, data_id: Handle) -> bool {
        self.databases.contains(data_id)
    }

    /// Data ids handed out by `next_data_id` but not installed yet.
    pub fn reserved_len(&self) -> usize {
        self.databases.reserved_len()
    }

    pub fn len(&self) -> usize {
        self.databases.len()
    }

    pub fn is_empty(&self) -> bool {
        self.databases.is_empty()
    }

    pub fn put_connection_ptr(&self, data_id: Handle, connection: NativePtr) -> Result<(), SqliteError> {
        self.with_info(data_id, |info, _| info.connection = connection)
    }

    pub fn get_connection_ptr(&self, data_id: Handle) -> Result<NativePtr, SqliteError> {
        self.with_info(data_id, |info, _| info.connection)
    }

    pub fn put_stmt(
        &self,
        data_id: Handle,
        connection: NativePtr,
        sql: &str,
        statement: ManagedRef,
    ) -> Result<(), SqliteError> {
        self.with_info(data_id, |info, finalizer| {
            info.cache.put(connection, sql, statement, finalizer)
        })
    }

    pub fn get_stmt(&self, data_id: Handle, sql: &str) -> Result<Option<ManagedRef>, SqliteError> {
        self.with_info(data_id, |info, _| info.cache.get(sql))
    }

    pub fn has_stmt(&self, data_id: Handle, sql: &str) -> Result<bool, SqliteError> {
        self.with_info(data_id, |info, _| info.cache.has(sql))
    }

    pub fn remove(&self, data_id: Handle, connection: NativePtr, sql: &str) -> Result<bool, SqliteError> {
        self.with_info(data_id, |info, finalizer| info.cache.remove(connection, sql, finalizer))
    }

    pub fn evict_all(&self, data_id: Handle, connection: NativePtr) -> Result<usize, SqliteError> {
        self.with_info(data_id, |info, finalizer| info.cache.evict_all(connection, finalizer))
    }

    pub fn cache_enabled(&self, data_id: Handle) -> Result<bool, SqliteError> {
        self.with_info(data_id, |info, _| info.cache.is_enabled())
    }

    pub fn cache_len(&self, data_id: Handle) -> Result<usize, SqliteError> {
        self.with_info(data_id, |info, _| info.cache.len())
    }

    pub fn cache_keys(&self, data_id: Handle) -> Result<Vec<String>, SqliteError> {
        self.with_info(data_id, |info, _| info.cache.keys())
    }

    pub fn stats(&self, data_id: Handle) -> Result<CacheStats, SqliteError> {
        self.with_info(data_id, |info, _| info.cache.stats())
    }

    pub fn put_transaction(&self, data_id: Handle, transaction: ManagedRef) -> Result<(), SqliteError> {
        self.with_info(data_id, |info, _| {
            info.transaction = Some(StablePtr::create(transaction));
        })
    }

    pub fn get_transaction(&self, data_id: Handle) -> Result<Option<ManagedRef>, SqliteError> {
        self.with_info(data_id, |info, _| info.transaction.as_ref().map(StablePtr::peek))
    }

    pub fn remove_transaction(&self, data_id: Handle) -> Result<Option<ManagedRef>, SqliteError> {
        self.with_info(data_id, |info, _| info.transaction.take().map(StablePtr::adopt))
    }

    pub fn put_db_config(&self, data_id: Handle, config: ManagedRef) -> Result<(), SqliteError> {
        self.with_info(data_id, |info, _| {
            info.config = Some(StablePtr::create(config));
        })
    }

    pub fn get_db_config(&self, data_id: Handle) -> Result<Option<ManagedRef>, SqliteError> {
        self.with_info(data_id, |info, _| info.config.as_ref().map(StablePtr::peek))
    }

    pub fn remove_db_config(&self, data_id: Handle) -> Result<Option<ManagedRef>, SqliteError> {
        self.with_info(data_id, |info, _| info.config.take().map(StablePtr::adopt))
    }

    pub fn next_helper_info_id(&self) -> Result<Handle, SqliteError> {
        Ok(self.helpers.reserve()?)
    }

    /// Store a helper object, replacing (and disposing) any earlier one.
    /// `None` clears the id.
    pub fn put_helper_info(&self, helper_id: Handle, helper: Option<ManagedRef>) {
        match helper {
            Some(helper) => self.helpers.upsert(helper_id, Some(StablePtr::create(helper))),
            None => {
                if self.helpers.remove(helper_id).is_err() {
                    tracing::trace!(%helper_id, "no helper info to clear");
                }
            }
        }
    }

    pub fn get_helper_info(&self, helper_id: Handle) -> Option<ManagedRef> {
        self.helpers
            .with(helper_id, |slot| slot.map(StablePtr::peek))
            .ok()
            .flatten()
    }

    /// Finalize every cache and drop every store and helper.
    pub fn clear(&self) {
        for data_id in self.databases.handles() {
            if let Err(e) = self.remove_data_store(data_id) {
                tracing::warn!(%data_id, error = %e, "failed to remove database store");
            }
        }
        self.helpers.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    fn recording_registry() -> (DatabaseRegistry, Arc<Mutex<Vec<String>>>) {
        let log = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&log);
        let finalizer = move |_: NativePtr, stmt: &ManagedRef| {
            sink.lock()
                .unwrap()
                .push(stmt.as_str().unwrap_or_default().to_string());
        };
        (DatabaseRegistry::with_finalizer(Arc::new(finalizer)), log)
    }

    #[test]
    fn test_two_step_store_creation() {
        let (registry, _) = recording_registry();
        let data_id = registry.next_data_id().unwrap();
        assert!(!registry.contains(data_id));
        assert!(registry.get_stmt(data_id, "SELECT 1").is_err());

        registry.create_data_store(data_id, 10).unwrap();
        assert!(registry.contains(data_id));
        assert!(registry.get_stmt(data_id, "SELECT 1").unwrap().is_none());
        assert!(matches!(
            registry.create_data_store(data_id, 10),
            Err(SqliteError::Handle(HandleError::AlreadyInstalled { .. }))
        ));
    }

    #[test]
    fn test_cache_size_validation() {
        let (registry, _) = recording_registry();
        let id = registry.next_data_id().unwrap();
        assert!(matches!(
            registry.create_data_store(id, -1),
            Err(SqliteError::CacheSizeOutOfRange(-1))
        ));
        assert!(matches!(
            registry.create_data_store(id, 100),
            Err(SqliteError::Handle(HandleError::NotReserved { .. }))
        ));

        let id = registry.next_data_id().unwrap();
        assert!(matches!(
            registry.create_data_store(id, 101),
            Err(SqliteError::CacheSizeOutOfRange(101))
        ));
        let id = registry.next_data_id().unwrap();
        registry.create_data_store(id, 100).unwrap();
        assert_eq!(registry.reserved_len(), 0);
    }

    #[test]
    fn test_statements_are_scoped_per_store() {
        let (registry, log) = recording_registry();
        let a = registry.next_data_id().unwrap();
        let b = registry.next_data_id().unwrap();
        registry.create_data_store(a, 2).unwrap();
        registry.create_data_store(b, 2).unwrap();

        let conn = NativePtr::from(0x10);
        registry.put_stmt(a, conn, "Q", ManagedRef::string("a:Q")).unwrap();
        assert!(registry.has_stmt(a, "Q").unwrap());
        assert!(!registry.has_stmt(b, "Q").unwrap());

        registry.remove_data_store(a).unwrap();
        assert_eq!(*log.lock().unwrap(), vec!["a:Q"]);
        assert!(!registry.contains(a));
        assert!(registry.contains(b));
    }

    #[test]
    fn test_transaction_and_config_slots() {
        let (registry, _) = recording_registry();
        let id = registry.next_data_id().unwrap();
        registry.create_data_store(id, 1).unwrap();

        let tx = ManagedRef::string("tx");
        registry.put_transaction(id, tx.clone()).unwrap();
        assert!(registry.get_transaction(id).unwrap().unwrap().ptr_eq(&tx));
        assert!(registry.remove_transaction(id).unwrap().unwrap().ptr_eq(&tx));
        assert!(registry.get_transaction(id).unwrap().is_none());
        assert_eq!(tx.ref_count(), 1);

        registry.put_db_config(id, ManagedRef::int(3)).unwrap();
        assert_eq!(registry.get_db_config(id).unwrap().unwrap().as_int(), Some(3));
        assert_eq!(registry.remove_db_config(id).unwrap().unwrap().as_int(), Some(3));

        registry.put_connection_ptr(id, NativePtr::from(0xbeef)).unwrap();
        assert_eq!(registry.get_connection_ptr(id).unwrap(), NativePtr::from(0xbeef));
    }

    #[test]
    fn test_helper_info() {
        let (registry, _) = recording_registry();
        let id = registry.next_helper_info_id().unwrap();
        let helper = ManagedRef::string("helper");
        registry.put_helper_info(id, Some(helper.clone()));
        assert!(registry.get_helper_info(id).unwrap().ptr_eq(&helper));

        registry.put_helper_info(id, Some(ManagedRef::string("replacement")));
        assert_eq!(helper.ref_count(), 1);
        registry.put_helper_info(id, None);
        assert!(registry.get_helper_info(id).is_none());
        assert!(registry.next_helper_info_id().unwrap() > id);
    }
}
