//! The per-rank client API (spec §4.1, §4.2): `mem_protect`/`mem_unprotect`/
//! `mem_clear`, the `checkpoint*` family, and the `restart*`/`recover_*`
//! family, plus [`Observer`] registration.
//!
//! One [`Client`] is constructed per rank and lives for the process'
//! lifetime; it owns that rank's [`Registry`] and drives its
//! [`PostProcessContext`] through an [`Orchestrator`]. State is tracked with
//! a small machine (spec §3): `Idle -> CheckpointOpen -> Idle` and
//! `Idle -> RestartOpen -> Idle`; every method that isn't `*_begin`/`*_end`
//! requires the matching state or returns `EngineError::WrongState`.

use std::collections::HashMap;
use std::io::Read as _;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::error::{EngineError, EngineResult, ModuleStatus, ResultCode};
use crate::header::{Header, RegionEntry};
use crate::identity::{parse_stem, CheckpointIdentity};
use crate::levels::PostProcessContext;
use crate::orchestrator::Orchestrator;
use crate::registry::{CustomRegion, MemoryRegion, Registry, Scope, Selection};

/// Callback surface for checkpoint/restart completion (spec §4.1
/// `register_observer`).
pub trait Observer: Send + Sync {
    /// Called once a `checkpoint_end` dispatch has finished, successfully
    /// or not.
    fn on_checkpoint(&self, _id: &CheckpointIdentity, _status: &EngineResult<ModuleStatus>) {}
    /// Called once a `recover_mem`/restart cascade has finished.
    fn on_restart(&self, _id: &CheckpointIdentity, _status: &EngineResult<ModuleStatus>) {}
}

#[derive(Debug, Clone)]
enum ClientState {
    Idle,
    CheckpointOpen { name: String, version: u64 },
    RestartOpen { name: String, version: u64 },
}

/// One rank's handle onto the checkpoint/restart engine.
pub struct Client {
    rank: i32,
    registry: Mutex<Registry>,
    state: Mutex<ClientState>,
    observers: Mutex<Vec<Arc<dyn Observer>>>,
    ctx: PostProcessContext,
    orchestrator: Arc<Orchestrator>,
}

impl Client {
    /// Build a client for `ctx.topology.comm`'s rank, driving checkpoints
    /// and restarts through `orchestrator`.
    pub fn new(ctx: PostProcessContext, orchestrator: Arc<Orchestrator>) -> Self {
        let rank = ctx.topology.comm.rank();
        Client {
            rank,
            registry: Mutex::new(Registry::new()),
            state: Mutex::new(ClientState::Idle),
            observers: Mutex::new(Vec::new()),
            ctx,
            orchestrator,
        }
    }

    /// This client's rank.
    pub fn rank(&self) -> i32 {
        self.rank
    }

    /// Register a raw pointer region (spec §4.1 `mem_protect`).
    ///
    /// # Safety
    /// See [`crate::registry::RawRegion::new`]: `ptr` must stay valid for
    /// `elem_size * elem_count` bytes until the matching `mem_unprotect`.
    pub unsafe fn mem_protect(
        &self,
        id: i32,
        ptr: *mut u8,
        elem_size: usize,
        elem_count: usize,
        scope: Scope,
    ) {
        self.registry.lock().protect_raw(id, ptr, elem_size, elem_count, scope);
    }

    /// Register an application-serialized region (spec §4.1
    /// `mem_protect(id, serializer, deserializer, scope)`).
    pub fn mem_protect_custom(&self, id: i32, region: CustomRegion, scope: Scope) {
        self.registry.lock().protect_custom(id, region, scope);
    }

    /// Unregister one region (spec §4.1 `mem_unprotect`).
    pub fn mem_unprotect(&self, id: i32, scope: &Scope) {
        self.registry.lock().unprotect(id, scope);
    }

    /// Unregister every region in a scope (spec §4.1 `mem_clear`).
    pub fn mem_clear(&self, scope: &Scope) {
        self.registry.lock().clear(scope);
    }

    fn require_idle(&self) -> EngineResult<()> {
        match *self.state.lock() {
            ClientState::Idle => Ok(()),
            _ => Err(EngineError::WrongState(
                "operation requires the client to be Idle".into(),
            )),
        }
    }

    fn require_checkpoint_open(&self) -> EngineResult<(String, u64)> {
        match &*self.state.lock() {
            ClientState::CheckpointOpen { name, version } => Ok((name.clone(), *version)),
            _ => Err(EngineError::NestedCheckpoint),
        }
    }

    fn require_restart_open(&self) -> EngineResult<(String, u64)> {
        match &*self.state.lock() {
            ClientState::RestartOpen { name, version } => Ok((name.clone(), *version)),
            _ => Err(EngineError::WrongState(
                "operation requires an open restart (call restart_begin first)".into(),
            )),
        }
    }

    /// The next unused version for `name` at this rank, one past the
    /// highest version currently visible in scratch or persistent storage.
    async fn next_version(&self, name: &str) -> EngineResult<u64> {
        let mut latest = self.ctx.storage.get_versions(name, self.rank).await?.into_iter().max();
        if let Ok(entries) = std::fs::read_dir(self.ctx.scratch.join("l1")) {
            for entry in entries.flatten() {
                if let Some(stem) = entry.file_name().to_str() {
                    if let Ok((n, r, v)) = parse_stem(stem) {
                        if n == name && r == self.rank {
                            latest = Some(latest.map_or(v, |l: u64| l.max(v)));
                        }
                    }
                }
            }
        }
        Ok(latest.map_or(0, |v| v + 1))
    }

    /// Open a checkpoint of `name` (spec §4.1 `checkpoint_begin`,
    /// `Idle -> CheckpointOpen`).
    pub async fn checkpoint_begin(&self, name: &str) -> EngineResult<()> {
        self.require_idle()?;
        let version = self.next_version(name).await?;
        *self.state.lock() = ClientState::CheckpointOpen {
            name: name.to_string(),
            version,
        };
        Ok(())
    }

    /// Serialize the selected regions into the open checkpoint's scratch
    /// file (spec §4.1 `checkpoint_mem`; may be called more than once per
    /// open checkpoint to append additional scopes).
    pub fn checkpoint_mem(&self, scope: Scope, selection: Selection) -> EngineResult<()> {
        let (name, version) = self.require_checkpoint_open()?;
        let id = CheckpointIdentity::new(name, self.rank, version)?;
        let regions = self.registry.lock().resolve(&scope, &selection)?;

        let header = Header {
            entries: regions.iter().map(|(id, r)| RegionEntry { id: *id, size: r.size() }).collect(),
        };

        let tmp_dir = self.ctx.scratch.join("tmp");
        std::fs::create_dir_all(&tmp_dir)?;
        let path = tmp_dir.join(id.stem());
        let mut file = std::fs::File::create(&path)?;
        header.write_to(&mut file)?;
        for (_, region) in &regions {
            region.write_to(&mut file)?;
        }
        Ok(())
    }

    /// Close the open checkpoint and dispatch it through the orchestrator
    /// (spec §4.1 `checkpoint_end`, `CheckpointOpen -> Idle`). `success =
    /// false` abandons the checkpoint (the app detected its own region data
    /// was bad) without running any level.
    pub async fn checkpoint_end(&self, success: bool) -> ResultCode {
        let (name, version) = match self.require_checkpoint_open() {
            Ok(open) => open,
            Err(e) => return ResultCode::from(Err(e)),
        };
        *self.state.lock() = ClientState::Idle;

        let id = match CheckpointIdentity::new(name, self.rank, version) {
            Ok(id) => id,
            Err(e) => return ResultCode::from(Err(e)),
        };
        if !success {
            let _ = std::fs::remove_file(self.ctx.scratch.join("tmp").join(id.stem()));
            return ResultCode::Failure;
        }

        let result = self.orchestrator.checkpoint(&self.ctx, &id).await;
        for observer in self.observers.lock().iter() {
            observer.on_checkpoint(&id, &result);
        }
        ResultCode::from(result.map(|_| ()))
    }

    /// Convenience wrapper around `checkpoint_begin`/`checkpoint_mem`/
    /// `checkpoint_end` for the common one-shot case.
    pub async fn checkpoint(&self, name: &str, scope: Scope, selection: Selection) -> ResultCode {
        if let Err(e) = self.checkpoint_begin(name).await {
            return ResultCode::from(Err(e));
        }
        if let Err(e) = self.checkpoint_mem(scope, selection) {
            *self.state.lock() = ClientState::Idle;
            return ResultCode::from(Err(e));
        }
        self.checkpoint_end(true).await
    }

    /// In `Mode::Sync`, `checkpoint_end` already ran the pipeline inline, so
    /// there is nothing left to wait for. `Mode::Async` dispatch and its
    /// wait semantics are implemented by [`crate::queue::ClientQueue`],
    /// which fronts this client when the engine is configured for
    /// asynchronous dispatch (spec §4.8).
    pub fn checkpoint_wait(&self) -> ResultCode {
        ResultCode::Success
    }

    /// The highest version of `name` this rank believes it could recover,
    /// reduced to the group minimum so every rank restarts from the same
    /// common point (spec §4.1 "group-minimum via `all_reduce_min`"). `0`
    /// means nothing recoverable was found anywhere in the group.
    pub async fn restart_test(&self, name: &str) -> EngineResult<u64> {
        let mut candidates: Vec<u64> = self.ctx.storage.get_versions(name, self.rank).await?;
        if let Ok(entries) = std::fs::read_dir(self.ctx.scratch.join("l1")) {
            for entry in entries.flatten() {
                if let Some(stem) = entry.file_name().to_str() {
                    if let Ok((n, r, v)) = parse_stem(stem) {
                        if n == name && r == self.rank {
                            candidates.push(v);
                        }
                    }
                }
            }
        }
        let local_latest = candidates.into_iter().max().unwrap_or(0);
        self.ctx.topology.comm.all_reduce_min(local_latest).await
    }

    /// Open a restart of `name`/`version` iff any rank in the group needs
    /// one (spec §4.1 "OR-reduce across ranks", `Idle -> RestartOpen`).
    /// Returns whether the group is entering `RestartOpen`; every rank
    /// calls this together, and every rank sees the same answer.
    pub async fn restart_begin(&self, name: &str, version: u64) -> EngineResult<bool> {
        self.require_idle()?;
        let id = CheckpointIdentity::new(name, self.rank, version)?;
        let i_need_restart = !crate::levels::l1::l1_is_valid(&self.ctx, &id)?;
        let group_restarts = self.ctx.topology.comm.all_reduce_or(i_need_restart).await?;
        if group_restarts {
            *self.state.lock() = ClientState::RestartOpen {
                name: name.to_string(),
                version,
            };
        }
        Ok(group_restarts)
    }

    /// Whether an in-progress restart can still materialize, without a
    /// data-independent probe (distinct from `restart_test`, which is
    /// whole-job discovery); `restart_begin` already answers this for the
    /// open restart's own name/version.
    pub fn restart_is_open(&self) -> bool {
        matches!(*self.state.lock(), ClientState::RestartOpen { .. })
    }

    /// Run the restart cascade and read the selected regions back out of
    /// the recovered file (spec §4.1 `recover_mem`). Every rank in the
    /// group must call this once `restart_begin` returns `true`, even a
    /// rank whose own L1 copy is intact — L2/L3 recovery needs every group
    /// member present for their collectives.
    pub async fn recover_mem(&self, scope: Scope, selection: Selection) -> EngineResult<()> {
        let (name, version) = self.require_restart_open()?;
        let id = CheckpointIdentity::new(name, self.rank, version)?;

        let result = self.orchestrator.restart(&self.ctx, &id).await;
        for observer in self.observers.lock().iter() {
            observer.on_restart(&id, &result);
        }
        if result? != ModuleStatus::Success {
            return Err(EngineError::GroupUnrecoverable {
                level: 0,
                reason: format!("no level could recover {}", id.stem()),
            });
        }

        let path = self.ctx.scratch.join("l1").join(id.stem());
        let mut file = std::fs::File::open(&path)?;
        let header = Header::read_from(&mut file)?;
        let file_size = std::fs::metadata(&path)?.len();
        header.validate_file_size(file_size)?;

        let regions = self.registry.lock().resolve(&scope, &selection)?;
        let mut by_id: HashMap<i32, MemoryRegion> = regions.into_iter().collect();
        for entry in &header.entries {
            if let Some(region) = by_id.remove(&entry.id) {
                region.read_from(&mut file, entry.size)?;
            } else {
                std::io::copy(&mut (&mut file).take(entry.size), &mut std::io::sink())?;
            }
        }
        Ok(())
    }

    /// Byte size of one region within the open restart's header, without
    /// materializing any region payload (spec §4.1 `recover_size`).
    pub fn recover_size(&self, region_id: i32) -> EngineResult<u64> {
        let (name, version) = self.require_restart_open()?;
        let id = CheckpointIdentity::new(name, self.rank, version)?;
        let path = self.ctx.scratch.join("l1").join(id.stem());
        let mut file = std::fs::File::open(&path)?;
        let header = Header::read_from(&mut file)?;
        header
            .entries
            .iter()
            .find(|e| e.id == region_id)
            .map(|e| e.size)
            .ok_or(EngineError::UnknownRegion(region_id))
    }

    /// Close the open restart (spec §4.1 `restart_end`, `RestartOpen ->
    /// Idle`).
    pub fn restart_end(&self, success: bool) -> ResultCode {
        let mut state = self.state.lock();
        if !matches!(*state, ClientState::RestartOpen { .. }) {
            return ResultCode::from(Err(EngineError::WrongState(
                "restart_end without a matching restart_begin".into(),
            )));
        }
        *state = ClientState::Idle;
        if success {
            ResultCode::Success
        } else {
            ResultCode::Failure
        }
    }

    /// Register an observer notified on every future checkpoint/restart
    /// completion (spec §4.1 `register_observer`).
    pub fn register_observer(&self, observer: Arc<dyn Observer>) {
        self.observers.lock().push(observer);
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use super::*;
    use crate::comm::LocalCommunicator;
    use crate::config::{EngineConfig, IoMode, Mode};
    use crate::metadata::MetadataStore;
    use crate::storage::posix::PosixStorage;
    use crate::topology::BoundTopology;

    fn client_for(dir: &std::path::Path) -> Client {
        let comm = LocalCommunicator::build_group(1).remove(0);
        let topology = BoundTopology::new(comm, vec!["node0".into()], false).unwrap();
        let meta = Arc::new(MetadataStore::new(&dir.join("meta"), "exec-1"));
        let ctx = PostProcessContext {
            scratch: dir.join("scratch"),
            persistent: dir.join("persistent"),
            meta: meta.clone(),
            topology,
            sector: 0,
            block_size: 1024,
            io_mode: IoMode::Posix,
            storage: Arc::new(PosixStorage::new(dir.join("persistent")).unwrap()),
            chksum_enabled: true,
            max_versions: 2,
            scratch_versions: 2,
        };
        let config = EngineConfig {
            scratch: ctx.scratch.clone(),
            persistent: ctx.persistent.clone(),
            meta: Some(dir.join("meta")),
            mode: Mode::Sync,
            max_parallelism: None,
            chksum: true,
            watchdog_interval: 60,
            max_versions: 2,
            scratch_versions: 2,
            ec_interval: 1,
            transfer_size: 1024,
            block_size: 1024,
            io_mode: IoMode::Posix,
            failure_domain: None,
            axl_type: None,
            daos_pool_uuid: None,
            daos_cont_uuid: None,
        };
        let orchestrator = Arc::new(Orchestrator::new(config, meta));
        Client::new(ctx, orchestrator)
    }

    struct CountingObserver {
        checkpoints: AtomicUsize,
    }

    impl Observer for CountingObserver {
        fn on_checkpoint(&self, _id: &CheckpointIdentity, _status: &EngineResult<ModuleStatus>) {
            self.checkpoints.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[tokio::test]
    async fn checkpoint_then_restart_round_trips_raw_regions() {
        let dir = tempfile::tempdir().unwrap();
        let client = client_for(dir.path());

        let observer = Arc::new(CountingObserver {
            checkpoints: AtomicUsize::new(0),
        });
        client.register_observer(observer.clone());

        let mut a: i32 = 42;
        let mut b: [u8; 4] = *b"rust";
        unsafe {
            client.mem_protect(0, &mut a as *mut i32 as *mut u8, std::mem::size_of::<i32>(), 1, None);
            client.mem_protect(1, b.as_mut_ptr(), 1, 4, None);
        }

        let status = client.checkpoint("sim", None, Selection::All).await;
        assert!(status.is_success());
        assert_eq!(observer.checkpoints.load(Ordering::SeqCst), 1);

        a = 0;
        b = *b"xxxx";

        let latest = client.restart_test("sim").await.unwrap();
        assert_eq!(latest, 0);
        assert!(client.restart_begin("sim", latest).await.unwrap());
        client.recover_mem(None, Selection::All).await.unwrap();
        assert!(client.restart_end(true).is_success());

        assert_eq!(a, 42);
        assert_eq!(&b, b"rust");
    }

    #[tokio::test]
    async fn recover_size_reports_region_length_without_reading_it() {
        let dir = tempfile::tempdir().unwrap();
        let client = client_for(dir.path());
        let mut payload: [u8; 16] = [7; 16];
        unsafe {
            client.mem_protect(0, payload.as_mut_ptr(), 1, 16, None);
        }
        assert!(client.checkpoint("sim", None, Selection::All).await.is_success());

        let latest = client.restart_test("sim").await.unwrap();
        client.restart_begin("sim", latest).await.unwrap();
        assert_eq!(client.recover_size(0).unwrap(), 16);
        client.restart_end(true);
    }

    #[test]
    fn operations_outside_open_checkpoint_fail() {
        let dir = tempfile::tempdir().unwrap();
        let client = client_for(dir.path());
        let err = client.checkpoint_mem(None, Selection::All).unwrap_err();
        assert!(matches!(err, EngineError::NestedCheckpoint));
    }
}
