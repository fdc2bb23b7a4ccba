//! Asynchronous request queue and backend worker pool (spec §4.8, §6
//! `Mode::Async`).
//!
//! Fronts a [`crate::client::Client`] when `EngineConfig::mode` is
//! `Mode::Async`: instead of awaiting the orchestrator inline,
//! `checkpoint_end` would enqueue a [`Command`] here and return
//! immediately, with `checkpoint_wait` blocking on the client's
//! [`ClientQueue`] until the backend worker pool has drained it. The
//! client/server transport spec §1 describes (a Unix domain socket) is the
//! "external collaborator" left out of scope; this module is the
//! in-process dispatcher such a transport would sit in front of.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::{mpsc, Notify, Semaphore};

use crate::error::{fold_status_codes, EngineResult, ModuleStatus, ResultCode};
use crate::identity::CheckpointIdentity;
use crate::levels::PostProcessContext;
use crate::orchestrator::Orchestrator;

/// Which pipeline a queued command dispatches into.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandKind {
    /// Run [`Orchestrator::checkpoint`].
    Checkpoint,
    /// Run [`Orchestrator::restart`].
    Restart,
}

/// One queued unit of work (spec §4.8 `Command`).
#[derive(Debug, Clone)]
pub struct Command {
    /// Assigned by [`ClientQueue::enqueue`] in submission order.
    pub unique_id: u64,
    /// Checkpoint or restart.
    pub kind: CommandKind,
    /// The checkpoint's name.
    pub name: String,
    /// The checkpoint's version.
    pub version: u64,
}

/// Per-client command queue and folded completion status (spec §4.8
/// `ClientQueue`). One command runs at a time per client; distinct clients
/// run concurrently up to [`RequestQueue`]'s `max_parallelism`.
pub struct ClientQueue {
    client_id: i32,
    next_id: AtomicU64,
    pending: Mutex<VecDeque<Command>>,
    in_progress: Mutex<Option<Command>>,
    status: Mutex<i32>,
    notify: Notify,
}

impl ClientQueue {
    fn new(client_id: i32) -> Self {
        ClientQueue {
            client_id,
            next_id: AtomicU64::new(0),
            pending: Mutex::new(VecDeque::new()),
            in_progress: Mutex::new(None),
            status: Mutex::new(ResultCode::Success as i32),
            notify: Notify::new(),
        }
    }

    /// This queue's client id.
    pub fn client_id(&self) -> i32 {
        self.client_id
    }

    fn enqueue(&self, kind: CommandKind, name: String, version: u64) -> u64 {
        let unique_id = self.next_id.fetch_add(1, Ordering::SeqCst);
        self.pending.lock().push_back(Command { unique_id, kind, name, version });
        unique_id
    }

    /// Move the next pending command into `in_progress`, unless one is
    /// already running for this client (spec §4.8 "one in-flight command
    /// per client").
    fn dequeue(&self) -> Option<Command> {
        let mut in_progress = self.in_progress.lock();
        if in_progress.is_some() {
            return None;
        }
        let command = self.pending.lock().pop_front()?;
        *in_progress = Some(command.clone());
        Some(command)
    }

    /// Record a finished command's result, folding it into this client's
    /// running status (spec §3/§8 `ClientQueue::status` monotone fold via
    /// [`fold_status_codes`]), clear `in_progress`, and wake any `wait`ers.
    fn completion(&self, code: i32) {
        *self.in_progress.lock() = None;
        let mut status = self.status.lock();
        *status = fold_status_codes([*status, code]);
        drop(status);
        self.notify.notify_waiters();
    }

    /// Block until every command enqueued for this client so far has
    /// completed, returning the folded status (spec §4.1
    /// `checkpoint_wait`).
    pub async fn wait(&self) -> i32 {
        loop {
            let notified = self.notify.notified();
            if self.pending.lock().is_empty() && self.in_progress.lock().is_none() {
                return *self.status.lock();
            }
            notified.await;
        }
    }
}

/// Owns every client's [`ClientQueue`] and the channel that wakes the
/// backend dispatch loop.
pub struct RequestQueue {
    clients: DashMap<i32, Arc<ClientQueue>>,
    wakeup: mpsc::UnboundedSender<i32>,
    intake: Mutex<Option<mpsc::UnboundedReceiver<i32>>>,
    max_parallelism: usize,
}

impl RequestQueue {
    /// Build an empty request queue bounding concurrent dispatch to
    /// `max_parallelism` tasks (spec §6 `max_parallelism`).
    pub fn new(max_parallelism: usize) -> Self {
        let (wakeup, intake) = mpsc::unbounded_channel();
        RequestQueue {
            clients: DashMap::new(),
            wakeup,
            intake: Mutex::new(Some(intake)),
            max_parallelism: max_parallelism.max(1),
        }
    }

    /// The queue for `client_id`, creating it on first use.
    pub fn queue_for(&self, client_id: i32) -> Arc<ClientQueue> {
        self.clients
            .entry(client_id)
            .or_insert_with(|| Arc::new(ClientQueue::new(client_id)))
            .clone()
    }

    /// Append a command for `client_id` and wake the dispatch loop (spec
    /// §4.8 "dequeue_any" — the loop picks it up the next time it runs).
    pub fn enqueue(&self, client_id: i32, kind: CommandKind, name: String, version: u64) -> u64 {
        let queue = self.queue_for(client_id);
        let unique_id = queue.enqueue(kind, name, version);
        let _ = self.wakeup.send(client_id);
        unique_id
    }

    /// Run the backend dispatch loop until every [`RequestQueue`] handle
    /// has been dropped (spec §4.8 "the backend walks `dequeue_any` in a
    /// loop, dispatching each command to a worker task bounded by
    /// `max_parallelism`"). `ctx_for` builds the per-client
    /// [`PostProcessContext`] on demand — cheap enough to call per command
    /// since its fields are mostly `Arc` clones. Panics if called more
    /// than once on the same queue.
    pub async fn run(
        self: Arc<Self>,
        orchestrator: Arc<Orchestrator>,
        ctx_for: impl Fn(i32) -> PostProcessContext + Send + Sync + 'static,
    ) {
        let mut intake = self.intake.lock().take().expect("RequestQueue::run called more than once");
        let semaphore = Arc::new(Semaphore::new(self.max_parallelism));
        let ctx_for = Arc::new(ctx_for);

        while let Some(client_id) = intake.recv().await {
            let Some(queue) = self.clients.get(&client_id).map(|entry| entry.clone()) else {
                continue;
            };
            let Some(command) = queue.dequeue() else {
                continue;
            };

            let permit = semaphore.clone().acquire_owned().await.expect("semaphore never closes");
            let orchestrator = orchestrator.clone();
            let ctx = ctx_for(client_id);
            let wakeup = self.wakeup.clone();
            tokio::spawn(async move {
                let _permit = permit;
                let code = run_command(&orchestrator, &ctx, client_id, &command).await;
                queue.completion(code);
                // Re-announce in case another command queued up behind
                // this one while it ran.
                let _ = wakeup.send(client_id);
            });
        }
    }
}

async fn run_command(
    orchestrator: &Orchestrator,
    ctx: &PostProcessContext,
    client_id: i32,
    command: &Command,
) -> i32 {
    let result: EngineResult<()> = async {
        let id = CheckpointIdentity::new(command.name.clone(), client_id, command.version)?;
        let status: ModuleStatus = match command.kind {
            CommandKind::Checkpoint => orchestrator.checkpoint(ctx, &id).await?,
            CommandKind::Restart => orchestrator.restart(ctx, &id).await?,
        };
        if status == ModuleStatus::Failure {
            return Err(crate::error::EngineError::GroupUnrecoverable {
                level: 0,
                reason: format!("{:?} of {} failed", command.kind, id.stem()),
            });
        }
        Ok(())
    }
    .await;
    ResultCode::from(result) as i32
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::comm::LocalCommunicator;
    use crate::config::{EngineConfig, IoMode, Mode};
    use crate::metadata::MetadataStore;
    use crate::storage::posix::PosixStorage;
    use crate::topology::BoundTopology;

    fn config_for(dir: &std::path::Path) -> EngineConfig {
        EngineConfig {
            scratch: dir.join("scratch"),
            persistent: dir.join("persistent"),
            meta: Some(dir.join("meta")),
            mode: Mode::Async,
            max_parallelism: Some(2),
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
        }
    }

    #[tokio::test]
    async fn enqueued_checkpoint_completes_and_wait_reports_success() {
        let dir = tempfile::tempdir().unwrap();
        let meta = Arc::new(MetadataStore::new(&dir.path().join("meta"), "exec-1"));
        let orchestrator = Arc::new(Orchestrator::new(config_for(dir.path()), meta.clone()));
        let scratch = dir.path().join("scratch");
        let persistent = dir.path().join("persistent");

        let queue = Arc::new(RequestQueue::new(2));
        let runner = {
            let queue = queue.clone();
            let orchestrator = orchestrator.clone();
            let scratch = scratch.clone();
            let persistent = persistent.clone();
            tokio::spawn(async move {
                queue
                    .run(orchestrator, move |_client_id| {
                        let comm = LocalCommunicator::build_group(1).remove(0);
                        let topology = BoundTopology::new(comm, vec!["node0".into()], false).unwrap();
                        PostProcessContext {
                            scratch: scratch.clone(),
                            persistent: persistent.clone(),
                            meta: meta.clone(),
                            topology,
                            sector: 0,
                            block_size: 1024,
                            io_mode: IoMode::Posix,
                            storage: Arc::new(PosixStorage::new(persistent.clone()).unwrap()),
                            chksum_enabled: true,
                            max_versions: 2,
                            scratch_versions: 2,
                        }
                    })
                    .await;
            })
        };

        std::fs::create_dir_all(scratch.join("tmp")).unwrap();
        std::fs::write(scratch.join("tmp").join("job-0-0.dat"), b"queued-payload").unwrap();

        let client_queue = queue.queue_for(0);
        queue.enqueue(0, CommandKind::Checkpoint, "job".into(), 0);
        let status = client_queue.wait().await;
        assert_eq!(status, ResultCode::Success as i32);

        drop(queue);
        let _ = tokio::time::timeout(std::time::Duration::from_millis(200), runner).await;
    }
}
