//! The schema manager
//!
//! Directory usage under the root:
//!
//! ```text
//! schemaManager/
//!   online/
//!     id/
//!       dml/
//!         tid/              => row log of concurrent DML
//!       protobuf/
//!         schema_name       => bytes (staged AIS fragment)
//!       changes/
//!         tid               => bytes (ChangeSet)
//!       generation          => i64   (session's generation, -1 unstaged)
//!   protobuf/
//!     schema_name           => bytes (committed AIS fragment)
//!   generation              => i64
//!   dataVersion             => i64
//!   metaDataVersion         => i64
//!   onlineSession           => i64
//! ```
//!
//! Transactional reasoning: every consumer of `get_ais` reads the
//! generation key to pick the right snapshot; every DDL increments the
//! generation while making its changes; whenever a new snapshot is
//! adopted, the name generator and table-version map are re-derived.
//! Since exactly one change to the generation commits at a time, all
//! generated names and ids are unique.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use strata_kv::{dir, tuple, Database, Directory, Element, Transaction};

use crate::ais::{
    finish_table, validate, Ais, Routine, Table, TableName, SECURITY_SCHEMA, SQLJ_SCHEMA,
    SYS_SCHEMA,
};
use crate::change_set::ChangeSet;
use crate::codec::{selector_for_schema, serialize, AisReader};
use crate::error::{Error, Result};
use crate::generation::{Compatibility, GenerationRegistry, CURRENT_DATA_VERSION, CURRENT_META_VERSION};
use crate::name_generator::{
    data_path, storage_path, DefaultNameGenerator, PathKind, StorageNameGenerator,
};
use crate::online::{
    online_changes_path, online_dir_path, online_dml_path, online_protobuf_path,
    online_root_path, protobuf_path, OnlineCache, GENERATION_KEY, ONLINE_SESSION_KEY,
    SCHEMA_MANAGER_PATH, UNSET_GENERATION,
};
use crate::session::{OnlineSession, Session};

/// Attempts before a conflicted schema transaction is surfaced.
const MAX_TRANSACTION_ATTEMPTS: usize = 32;

/// Schema-manager configuration.
#[derive(Debug, Clone, Default)]
pub struct SchemaConfig {
    /// Authorize wiping the schema-manager directory when the stored
    /// versions do not match the running constants.
    pub clear_incompatible_data: bool,
}

struct CoreState {
    cur_ais: Arc<Ais>,
    name_generator: DefaultNameGenerator,
    /// Unpersisted system-catalog entries, re-overlaid on every load.
    memory_ais: Ais,
}

/// The front door for all schema metadata operations.
pub struct SchemaManager {
    db: Arc<Database>,
    sm_dir: Directory,
    registry: GenerationRegistry,
    state: Arc<Mutex<CoreState>>,
    table_versions: Arc<RwLock<HashMap<i32, u32>>>,
    stopping: AtomicBool,
}

fn unpack_i64(raw: &[u8]) -> Result<i64> {
    let elements = tuple::unpack(raw).map_err(Error::Kv)?;
    elements
        .first()
        .ok_or_else(|| Error::Internal("empty tuple value".to_string()))?
        .as_int()
        .map_err(Error::Kv)
}

fn run_with_retries<T>(
    db: &Database,
    mut f: impl FnMut(&mut Transaction<'_>) -> Result<T>,
) -> Result<T> {
    let mut attempt = 0;
    loop {
        let mut txn = db.begin();
        let outcome = f(&mut txn).and_then(|value| {
            txn.commit().map_err(Error::from)?;
            Ok(value)
        });
        match outcome {
            Ok(value) => return Ok(value),
            Err(err) if err.is_retriable() && attempt + 1 < MAX_TRANSACTION_ATTEMPTS => {
                attempt += 1;
                tracing::debug!(attempt, "schema transaction conflicted, retrying");
            }
            Err(err) => return Err(err),
        }
    }
}

fn load_primary_fragments(
    txn: &mut Transaction<'_>,
    reader: &mut AisReader,
    skip: Option<&HashSet<String>>,
) -> Result<()> {
    let pb_dir = dir::create_or_open(txn, &protobuf_path())?;
    let (start, end) = pb_dir.range();
    for (key, value) in txn.get_range(&start, &end)? {
        let elements = pb_dir.unpack(&key)?;
        let schema = elements
            .last()
            .ok_or_else(|| Error::Internal("fragment key without schema name".to_string()))?
            .as_str()
            .map_err(Error::Kv)?;
        if skip.is_some_and(|s| s.contains(schema)) {
            continue;
        }
        reader.load_fragment(&value)?;
    }
    Ok(())
}

fn load_from_storage(
    txn: &mut Transaction<'_>,
    registry: &GenerationRegistry,
    memory_ais: &Ais,
) -> Result<Arc<Ais>> {
    registry.check_data_versions(txn)?;
    let mut reader = AisReader::new();
    load_primary_fragments(txn, &mut reader, None)?;
    let mut ais = reader.finish(memory_ais)?;
    let generation = registry.transactional_generation(txn)?;
    ais.set_generation(generation)?;
    ais.freeze();
    Ok(Arc::new(ais))
}

/// Just the unpersisted parts of a snapshot: memory tables plus the
/// routines of the built-in routine schemas.
fn memory_only_clone(ais: &Ais) -> Result<Ais> {
    let mut out = Ais::new();
    for schema in ais.schemas() {
        for table in schema.tables.values() {
            if table.memory_table {
                out.add_table(table.clone())?;
            }
        }
        if matches!(
            schema.name.as_str(),
            SYS_SCHEMA | SQLJ_SCHEMA | SECURITY_SCHEMA
        ) {
            for routine in schema.routines.values() {
                out.add_routine(&schema.name, routine.clone())?;
            }
        }
    }
    Ok(out)
}

/// Row-log scan: the hkeys recorded for one table, in key order.
pub struct HkeyScan {
    inner: std::vec::IntoIter<Vec<u8>>,
}

impl Iterator for HkeyScan {
    type Item = Vec<u8>;

    fn next(&mut self) -> Option<Vec<u8>> {
        self.inner.next()
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        self.inner.size_hint()
    }
}

impl ExactSizeIterator for HkeyScan {}

impl SchemaManager {
    /// Start the manager: ensure directories, reconcile stored versions,
    /// load the committed snapshot and derive the in-process caches.
    pub fn start(db: Arc<Database>, config: SchemaConfig) -> Result<Self> {
        let (sm_dir, registry, cur_ais) = run_with_retries(&db, |txn| {
            let mut sm_dir = dir::create_or_open(txn, &[SCHEMA_MANAGER_PATH])?;
            let mut registry = GenerationRegistry::new(&sm_dir);
            match registry.data_compatibility(txn)? {
                Compatibility::Compatible => {}
                Compatibility::Missing => registry.save_initial_state(txn),
                Compatibility::Incompatible {
                    stored_meta,
                    stored_data,
                } => {
                    if !config.clear_incompatible_data {
                        return Err(Error::Incompatible {
                            supported_meta: CURRENT_META_VERSION,
                            supported_data: CURRENT_DATA_VERSION,
                            stored_meta,
                            stored_data,
                        });
                    }
                    tracing::warn!(
                        stored_meta,
                        stored_data,
                        "clearing incompatible schema-manager directory"
                    );
                    dir::remove(txn, &[SCHEMA_MANAGER_PATH])?;
                    sm_dir = dir::create_or_open(txn, &[SCHEMA_MANAGER_PATH])?;
                    registry = GenerationRegistry::new(&sm_dir);
                    registry.save_initial_state(txn);
                }
            }
            let cur_ais = load_from_storage(txn, &registry, &Ais::new())?;
            Ok((sm_dir, registry, cur_ais))
        })?;

        let generation = cur_ais.generation();
        let name_generator = DefaultNameGenerator::from_ais(&cur_ais);
        let manager = Self {
            db,
            sm_dir,
            registry,
            state: Arc::new(Mutex::new(CoreState {
                cur_ais,
                name_generator,
                memory_ais: Ais::new(),
            })),
            table_versions: Arc::new(RwLock::new(HashMap::new())),
            stopping: AtomicBool::new(false),
        };

        run_with_retries(&manager.db, |txn| {
            let mut state = manager.state.lock();
            let installed = state.cur_ais.clone();
            manager.merge_new_ais(txn, &mut state, &installed)
        })?;

        tracing::info!(generation, "schema manager started");
        Ok(manager)
    }

    /// Drop in-process caches. The KV store is never touched here.
    pub fn stop(&self) {
        self.stopping.store(true, Ordering::SeqCst);
        let mut state = self.state.lock();
        state.cur_ais = Arc::new(Ais::sentinel());
        state.name_generator = DefaultNameGenerator::new();
        state.memory_ais = Ais::new();
        self.table_versions.write().clear();
        tracing::info!("schema manager stopped");
    }

    /// Run `f` in a transaction bound to `session`, retrying conflicts
    /// from scratch and detaching the session's snapshot at the end.
    pub fn transact<T>(
        &self,
        session: &mut Session,
        mut f: impl FnMut(&Self, &mut Session, &mut Transaction<'_>) -> Result<T>,
    ) -> Result<T> {
        let entry_online = session.online.clone();
        let mut attempt = 0;
        let result = loop {
            session.detach();
            session.online = entry_online.clone();
            let mut txn = self.db.begin();
            let outcome = f(self, session, &mut txn).and_then(|value| {
                txn.commit().map_err(Error::from)?;
                Ok(value)
            });
            match outcome {
                Ok(value) => break Ok(value),
                Err(err) if err.is_retriable() && attempt + 1 < MAX_TRANSACTION_ATTEMPTS => {
                    attempt += 1;
                    tracing::debug!(attempt, "schema transaction conflicted, retrying");
                }
                Err(err) => break Err(err),
            }
        };
        session.detach();
        result
    }

    /// The snapshot this session's transaction observes. The first call
    /// in a transaction resolves and pins it; later calls return the
    /// same instance.
    pub fn get_ais(&self, session: &mut Session, txn: &mut Transaction<'_>) -> Result<Arc<Ais>> {
        if let Some(ais) = &session.attached_ais {
            return Ok(ais.clone());
        }
        let generation = self.registry.transactional_generation(txn)?;
        let mut local = self.state.lock().cur_ais.clone();
        if generation != local.generation() {
            let mut state = self.state.lock();
            // May have been waiting on the lock while another thread
            // installed the generation we want.
            if generation == state.cur_ais.generation() {
                local = state.cur_ais.clone();
            } else {
                let memory = state.memory_ais.clone();
                local = load_from_storage(txn, &self.registry, &memory)?;
                if local.generation() > state.cur_ais.generation() {
                    state.cur_ais = local.clone();
                    let installed = local.clone();
                    self.merge_new_ais(txn, &mut state, &installed)?;
                }
            }
        }
        session.attached_ais = Some(local.clone());
        Ok(local)
    }

    /// The snapshot the owner of the current online change should see:
    /// the staged one when it exists, the committed one otherwise.
    pub fn get_online_ais(
        &self,
        session: &mut Session,
        txn: &mut Transaction<'_>,
    ) -> Result<Arc<Ais>> {
        let online = session
            .online
            .clone()
            .ok_or_else(|| Error::Internal("session owns no online change".to_string()))?;
        let cache = self.online_cache(txn)?;
        match cache.online_to_ais.get(&online.id) {
            Some(staged) => Ok(staged.clone()),
            None => self.get_ais(session, txn),
        }
    }

    /// Clone-and-mutate DDL: apply `mutator` to an unfrozen copy of the
    /// session's snapshot, validate, persist the fragments of every
    /// schema the mutator reports changed, bump the generation and pin
    /// the new snapshot to the session.
    pub fn apply_ddl(
        &self,
        session: &mut Session,
        txn: &mut Transaction<'_>,
        mutator: impl FnOnce(&mut Ais, &mut StorageNameGenerator<'_, '_>) -> Result<Vec<String>>,
    ) -> Result<Arc<Ais>> {
        let base = self.get_ais(session, txn)?;
        let mut new_ais = base.clone_unfrozen();
        let kind = if session.online.is_some() {
            PathKind::Online
        } else {
            PathKind::Data
        };
        let changed_schemas = {
            let mut state = self.state.lock();
            let mut names = StorageNameGenerator::new(&mut state.name_generator, txn, kind);
            mutator(&mut new_ais, &mut names)?
        };

        for schema in new_ais.schemas_map_mut()?.values_mut() {
            for table in schema.tables.values_mut() {
                finish_table(table);
            }
        }
        validate(&new_ais)?;
        let generation = self.registry.next_generation(txn)?;
        new_ais.set_generation(generation)?;
        new_ais.freeze();
        let new_ais = Arc::new(new_ais);

        let pb_dir = dir::create_or_open(txn, &protobuf_path())?;
        for schema in &changed_schemas {
            store_fragment(txn, &pb_dir, &new_ais, schema)?;
        }
        session.attached_ais = Some(new_ais.clone());
        tracing::debug!(generation, schemas = ?changed_schemas, "applied schema change");
        Ok(new_ais)
    }

    /// Begin an online change for this session: mint an id, create its
    /// directory and mark it unstaged.
    pub fn begin_online(&self, session: &mut Session, txn: &mut Transaction<'_>) -> Result<i64> {
        if session.online.is_some() {
            return Err(Error::Internal(
                "session already owns an online change".to_string(),
            ));
        }
        let key = self.sm_dir.pack_one(ONLINE_SESSION_KEY);
        let online_id = match txn.get(&key)? {
            Some(raw) => unpack_i64(&raw)? + 1,
            None => 1,
        };
        txn.set(&key, &tuple::pack_one(online_id));
        let id_dir = dir::create(txn, &online_dir_path(online_id))?;
        txn.set(
            &id_dir.pack_one(GENERATION_KEY),
            &tuple::pack_one(UNSET_GENERATION),
        );
        session.online = Some(OnlineSession::new(online_id));
        tracing::debug!(online_id, "online change begun");
        Ok(online_id)
    }

    /// Stage `new_ais` for the session's online change: allocate its
    /// generation, write the staged fragments of `schemas`, then bump
    /// the generation once more so no other transaction adopts the
    /// allocated-but-unpublished one as current.
    pub fn stage_online(
        &self,
        session: &mut Session,
        txn: &mut Transaction<'_>,
        mut new_ais: Ais,
        schemas: &[String],
    ) -> Result<Arc<Ais>> {
        let online = session
            .online
            .clone()
            .ok_or_else(|| Error::Internal("session owns no online change".to_string()))?;

        for schema in new_ais.schemas_map_mut()?.values_mut() {
            for table in schema.tables.values_mut() {
                finish_table(table);
            }
        }
        validate(&new_ais)?;
        let generation = self.registry.next_generation(txn)?;
        new_ais.set_generation(generation)?;
        new_ais.freeze();
        let staged = Arc::new(new_ais);
        // Again, so no other transaction sees the one just allocated.
        self.registry.next_generation(txn)?;
        session.bumped_generation = true;

        let id_dir = dir::open(txn, &online_dir_path(online.id))?;
        txn.set(&id_dir.pack_one(GENERATION_KEY), &tuple::pack_one(generation));
        let pb_dir = dir::create_or_open(txn, &online_protobuf_path(online.id))?;
        for schema in schemas {
            store_fragment(txn, &pb_dir, &staged, schema)?;
        }
        session.attached_ais = Some(staged.clone());
        tracing::debug!(online_id = online.id, generation, "online change staged");
        Ok(staged)
    }

    /// Register the change set describing one table's mutation under the
    /// session's online change.
    pub fn add_online_change_set(
        &self,
        session: &mut Session,
        txn: &mut Transaction<'_>,
        change_set: ChangeSet,
    ) -> Result<()> {
        let online_id = {
            let online = session
                .online
                .as_mut()
                .ok_or_else(|| Error::Internal("session owns no online change".to_string()))?;
            online.table_ids.insert(change_set.table_id);
            online.id
        };
        tracing::debug!(online_id, table_id = change_set.table_id, "adding change set");
        // Require existence of the session directory, create the change
        // subdirectory on demand.
        dir::open(txn, &online_dir_path(online_id))?;
        let changes_dir = dir::create_or_open(txn, &online_changes_path(online_id))?;
        txn.set(
            &changes_dir.pack_one(change_set.table_id as i64),
            &change_set.encode()?,
        );
        if !session.bumped_generation {
            self.registry.next_generation(txn)?;
            session.bumped_generation = true;
        }
        Ok(())
    }

    /// Record the hkey of a row written by DML while its table is under
    /// online change. Fails when no online change owns the table.
    pub fn record_online_handled_hkey(
        &self,
        session: &mut Session,
        txn: &mut Transaction<'_>,
        table_id: i32,
        hkey: &[u8],
    ) -> Result<()> {
        self.get_ais(session, txn)?;
        let cache = self.online_cache(txn)?;
        let online_id = cache
            .online_for_table(table_id)
            .ok_or(Error::NoSuchOnlineChange(table_id))?;
        dir::open(txn, &online_dir_path(online_id))?;
        let dml_dir = dir::create_or_open(txn, &online_dml_path(online_id, table_id))?;
        txn.set(&dml_dir.pack_one(Element::Bytes(hkey.to_vec())), &[]);
        Ok(())
    }

    /// The hkeys recorded for `table_id` under the session's own online
    /// change, in lexicographic order, optionally resuming at
    /// `from_hkey` (inclusive).
    pub fn scan_online_handled_hkeys(
        &self,
        session: &mut Session,
        txn: &mut Transaction<'_>,
        table_id: i32,
        from_hkey: Option<&[u8]>,
    ) -> Result<HkeyScan> {
        let online = session
            .online
            .clone()
            .ok_or_else(|| Error::Internal("session owns no online change".to_string()))?;
        tracing::debug!(online_id = online.id, table_id, "scanning handled row log");
        let dml_dir = dir::create_or_open(txn, &online_dml_path(online.id, table_id))?;
        let (mut start, end) = dml_dir.range();
        if let Some(from) = from_hkey {
            start = dml_dir.pack_one(Element::Bytes(from.to_vec()));
        }
        let mut hkeys = Vec::new();
        for (key, _) in txn.get_range(&start, &end)? {
            match dml_dir.unpack(&key)?.first() {
                Some(Element::Bytes(hkey)) => hkeys.push(hkey.clone()),
                _ => return Err(Error::Internal("malformed row-log key".to_string())),
            }
        }
        Ok(HkeyScan {
            inner: hkeys.into_iter(),
        })
    }

    /// Promote the staged fragments to the committed area, bump the
    /// generation and drop the online subtree.
    pub fn finalize_online(&self, session: &mut Session, txn: &mut Transaction<'_>) -> Result<()> {
        let online = session
            .online
            .clone()
            .ok_or_else(|| Error::Internal("session owns no online change".to_string()))?;
        let pb_dir = dir::create_or_open(txn, &protobuf_path())?;
        if dir::exists(txn, &online_protobuf_path(online.id))? {
            let staged_dir = dir::open(txn, &online_protobuf_path(online.id))?;
            let (start, end) = staged_dir.range();
            for (key, value) in txn.get_range(&start, &end)? {
                let elements = staged_dir.unpack(&key)?;
                let schema = elements
                    .last()
                    .ok_or_else(|| {
                        Error::Internal("staged fragment key without schema name".to_string())
                    })?
                    .as_str()
                    .map_err(Error::Kv)?;
                txn.set(&pb_dir.pack_one(schema), &value);
            }
        }
        self.registry.next_generation(txn)?;
        dir::remove(txn, &online_dir_path(online.id))?;
        session.online = None;
        session.detach();
        tracing::info!(online_id = online.id, "online change finalized");
        Ok(())
    }

    /// Drop the online subtree without publishing. Bumps the generation
    /// only when the change had become externally visible.
    pub fn abort_online(&self, session: &mut Session, txn: &mut Transaction<'_>) -> Result<()> {
        let online = session
            .online
            .clone()
            .ok_or_else(|| Error::Internal("session owns no online change".to_string()))?;
        let id_dir = dir::open(txn, &online_dir_path(online.id))?;
        let staged_generation = match txn.get(&id_dir.pack_one(GENERATION_KEY))? {
            Some(raw) => unpack_i64(&raw)?,
            None => {
                return Err(Error::Internal(format!(
                    "online session {} missing generation",
                    online.id
                )))
            }
        };
        let visible = staged_generation != UNSET_GENERATION
            || dir::exists(txn, &online_changes_path(online.id))?;
        if visible {
            self.registry.next_generation(txn)?;
        }
        dir::remove(txn, &online_dir_path(online.id))?;
        session.online = None;
        session.detach();
        tracing::info!(online_id = online.id, "online change aborted");
        Ok(())
    }

    /// Build the read-only view of every in-flight online change.
    pub fn online_cache(&self, txn: &mut Transaction<'_>) -> Result<OnlineCache> {
        let memory = self.state.lock().memory_ais.clone();
        self.build_online_cache(txn, &memory)
    }

    /// Move a table's data directory to its new name, creating the
    /// destination schema directory when needed.
    pub fn rename_table(
        &self,
        _session: &mut Session,
        txn: &mut Transaction<'_>,
        old: &TableName,
        new: &TableName,
    ) -> Result<()> {
        let new_path = data_path(new);
        // Ensure destination schema exists. Can go away if schema
        // lifetime becomes explicit.
        dir::create_or_open(txn, &new_path[..2])?;
        dir::rename(txn, &data_path(old), &new_path)?;
        Ok(())
    }

    /// Remove the table from the snapshot and, in the same transaction,
    /// its data directory.
    pub fn drop_table(
        &self,
        session: &mut Session,
        txn: &mut Transaction<'_>,
        name: &TableName,
    ) -> Result<Arc<Ais>> {
        let base = self.get_ais(session, txn)?;
        let dropped = base
            .table(name)
            .ok_or_else(|| Error::Internal(format!("no such table: {}", name)))?
            .clone();
        let new_ais = self.apply_ddl(session, txn, |ais, _names| {
            ais.remove_table(name)?;
            Ok(vec![name.schema.clone()])
        })?;
        self.on_drop(txn, &dropped)?;
        Ok(new_ais)
    }

    /// Table-lifecycle listener: a dropped table loses its data
    /// directory within the dropping transaction. Other events carry no
    /// storage consequences.
    fn on_drop(&self, txn: &mut Transaction<'_>, table: &Table) -> Result<()> {
        if !table.storage_name.is_empty() {
            dir::remove_if_exists(txn, &storage_path(&table.storage_name))?;
        }
        Ok(())
    }

    /// Every storage path the session's snapshot references.
    pub fn list_storage_paths(
        &self,
        session: &mut Session,
        txn: &mut Transaction<'_>,
    ) -> Result<BTreeSet<String>> {
        Ok(self.get_ais(session, txn)?.storage_names())
    }

    /// Register an unpersisted system-catalog table. The change installs
    /// through an after-commit callback that rebuilds the memory overlay
    /// and forces the next snapshot access to reload.
    pub fn register_memory_table(
        &self,
        session: &mut Session,
        txn: &mut Transaction<'_>,
        table: Table,
    ) -> Result<()> {
        if !table.memory_table || !table.name.is_system() {
            return Err(Error::Internal(
                "memory tables must live in a system schema".to_string(),
            ));
        }
        self.unstored_ais_change(session, txn, |ais, state| {
            let mut table = table;
            if table.table_id == 0 {
                table.table_id = state.name_generator.next_table_id();
            }
            finish_table(&mut table);
            ais.add_table(table)
        })
    }

    /// Deregister a memory table. Skipped silently while stopping, so
    /// shutdown never touches the KV store.
    pub fn deregister_memory_table(
        &self,
        session: &mut Session,
        txn: &mut Transaction<'_>,
        name: &TableName,
    ) -> Result<()> {
        if self.stopping.load(Ordering::SeqCst) {
            tracing::debug!(%name, "skipping memory-table deregistration during shutdown");
            return Ok(());
        }
        self.unstored_ais_change(session, txn, |ais, _state| {
            ais.remove_table(name).map(|_| ())
        })
    }

    /// Register a built-in routine in one of the system schemas.
    pub fn register_system_routine(
        &self,
        session: &mut Session,
        txn: &mut Transaction<'_>,
        schema: &str,
        routine: Routine,
    ) -> Result<()> {
        if !matches!(schema, SYS_SCHEMA | SQLJ_SCHEMA | SECURITY_SCHEMA) {
            return Err(Error::Internal(
                "system routines must live in a system schema".to_string(),
            ));
        }
        self.unstored_ais_change(session, txn, |ais, _state| ais.add_routine(schema, routine))
    }

    /// Deregister a system routine. Skipped silently while stopping.
    pub fn deregister_system_routine(
        &self,
        session: &mut Session,
        txn: &mut Transaction<'_>,
        schema: &str,
        name: &str,
    ) -> Result<()> {
        if self.stopping.load(Ordering::SeqCst) {
            tracing::debug!(schema, name, "skipping routine deregistration during shutdown");
            return Ok(());
        }
        self.unstored_ais_change(session, txn, |ais, _state| {
            ais.remove_routine(schema, name).map(|_| ())
        })
    }

    /// The generation of the oldest snapshot still referenced in this
    /// process.
    pub fn oldest_active_generation(&self) -> i64 {
        self.state.lock().cur_ais.generation()
    }

    /// The committed version of a table, online changes overriding.
    pub fn table_version(&self, table_id: i32) -> Option<u32> {
        self.table_versions.read().get(&table_id).copied()
    }

    fn unstored_ais_change(
        &self,
        session: &mut Session,
        txn: &mut Transaction<'_>,
        mutate: impl FnOnce(&mut Ais, &mut CoreState) -> Result<()>,
    ) -> Result<()> {
        let base = self.get_ais(session, txn)?;
        let mut new_ais = base.clone_unfrozen();
        {
            let mut state = self.state.lock();
            mutate(&mut new_ais, &mut state)?;
        }
        validate(&new_ais)?;
        let generation = self.registry.next_generation(txn)?;
        new_ais.set_generation(generation)?;
        new_ais.freeze();
        let new_ais = Arc::new(new_ais);
        session.attached_ais = Some(new_ais.clone());

        let state_handle = self.state.clone();
        let snapshot = new_ais.clone();
        txn.after_commit(move || {
            let memory = match memory_only_clone(&snapshot) {
                Ok(memory) => memory,
                Err(err) => {
                    tracing::error!(%err, "failed to rebuild memory-table overlay");
                    return;
                }
            };
            let mut state = state_handle.lock();
            state.memory_ais = memory;
            state.cur_ais = Arc::new(Ais::sentinel());
        });
        Ok(())
    }

    fn merge_new_ais(
        &self,
        txn: &mut Transaction<'_>,
        state: &mut CoreState,
        new_ais: &Arc<Ais>,
    ) -> Result<()> {
        let memory = state.memory_ais.clone();
        let cache = self.build_online_cache(txn, &memory)?;
        state.name_generator.merge_ais(new_ais);
        for online_ais in cache.online_to_ais.values() {
            state.name_generator.merge_ais(online_ais);
        }

        // Any number of changes may have occurred on other nodes; the
        // in-memory version map must be re-derived, online tables
        // overriding the committed snapshot.
        let mut versions = self.table_versions.write();
        versions.clear();
        for table in new_ais.tables() {
            versions.insert(table.table_id, table.version);
        }
        for (&table_id, online_id) in &cache.table_to_online {
            if let Some(online_ais) = cache.online_to_ais.get(online_id) {
                if let Some(table) = online_ais.table_by_id(table_id) {
                    versions.insert(table_id, table.version);
                }
            }
        }
        Ok(())
    }

    fn build_online_cache(
        &self,
        txn: &mut Transaction<'_>,
        memory_ais: &Ais,
    ) -> Result<OnlineCache> {
        let mut cache = OnlineCache::default();
        dir::create_or_open(txn, &online_root_path())?;

        for id_str in dir::list(txn, &online_root_path())? {
            let online_id: i64 = id_str
                .parse()
                .map_err(|_| Error::Internal(format!("malformed online id: {}", id_str)))?;
            let id_dir = dir::open(txn, &online_dir_path(online_id))?;
            let generation = match txn.get(&id_dir.pack_one(GENERATION_KEY))? {
                Some(raw) => unpack_i64(&raw)?,
                None => {
                    return Err(Error::Internal(format!(
                        "online session {} missing generation",
                        online_id
                    )))
                }
            };

            if dir::exists(txn, &online_protobuf_path(online_id))? {
                let pb_dir = dir::open(txn, &online_protobuf_path(online_id))?;
                let (start, end) = pb_dir.range();
                let mut staged: Vec<(String, Vec<u8>)> = Vec::new();
                for (key, value) in txn.get_range(&start, &end)? {
                    let schema = pb_dir
                        .unpack(&key)?
                        .last()
                        .ok_or_else(|| {
                            Error::Internal("staged fragment key without schema name".to_string())
                        })?
                        .as_str()
                        .map_err(Error::Kv)?
                        .to_string();
                    if let Some(prev) = cache.schema_to_online.insert(schema.clone(), online_id) {
                        return Err(Error::ConflictingOnlineChange(format!(
                            "schema {} staged by online sessions {} and {}",
                            schema, prev, online_id
                        )));
                    }
                    staged.push((schema, value));
                }
                if generation != UNSET_GENERATION {
                    let mut reader = AisReader::new();
                    let mut skip = HashSet::new();
                    for (schema, bytes) in &staged {
                        reader.load_fragment(bytes)?;
                        skip.insert(schema.clone());
                    }
                    load_primary_fragments(txn, &mut reader, Some(&skip))?;
                    let mut staged_ais = reader.finish(memory_ais)?;
                    staged_ais.set_generation(generation)?;
                    staged_ais.freeze();
                    cache.online_to_ais.insert(online_id, Arc::new(staged_ais));
                } else if !staged.is_empty() {
                    return Err(Error::Internal(format!(
                        "online session {} has staged schemas but no generation",
                        online_id
                    )));
                }
            }

            if dir::exists(txn, &online_changes_path(online_id))? {
                let changes_dir = dir::open(txn, &online_changes_path(online_id))?;
                let (start, end) = changes_dir.range();
                for (_key, value) in txn.get_range(&start, &end)? {
                    let change_set = ChangeSet::decode(&value)?;
                    if let Some(prev) = cache.table_to_online.insert(change_set.table_id, online_id)
                    {
                        return Err(Error::ConflictingOnlineChange(format!(
                            "table {} claimed by online sessions {} and {}",
                            change_set.table_id, prev, online_id
                        )));
                    }
                    cache
                        .online_to_change_sets
                        .entry(online_id)
                        .or_default()
                        .push(change_set);
                }
            }
        }

        Ok(cache)
    }
}

fn store_fragment(
    txn: &mut Transaction<'_>,
    pb_dir: &Directory,
    ais: &Ais,
    schema: &str,
) -> Result<()> {
    let key = pb_dir.pack_one(schema);
    if ais.schema(schema).is_some() {
        let bytes = serialize(ais, &selector_for_schema(schema))?;
        txn.set(&key, &bytes);
    } else {
        txn.clear(&key);
    }
    Ok(())
}
