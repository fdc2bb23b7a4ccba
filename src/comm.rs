//! The ranked group-communication substrate the engine is built on top of.
//!
//! Spec §1 lists the substrate itself ("a ranked, in-order, reliable
//! point-to-point + collective layer with sub-communicator creation") as an
//! out-of-scope external collaborator, swappable behind a trait the same
//! way transport-level plumbing is usually kept swappable.
//! [`Communicator`] is that seam: production deployments plug in an MPI,
//! UCX, or similar binding; [`LocalCommunicator`] is an in-process,
//! `tokio::sync::mpsc`-backed implementation used by this crate's own
//! tests and suitable for single-node multi-rank simulation.

use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::{mpsc, Mutex as AsyncMutex, Notify};

use crate::error::{EngineError, EngineResult};

/// A ranked, reliable communication substrate with point-to-point and
/// collective operations (spec §1, §4.4/§4.5/§4.7).
#[async_trait]
pub trait Communicator: Send + Sync {
    /// This process's rank within the communicator.
    fn rank(&self) -> i32;
    /// Total number of ranks.
    fn size(&self) -> i32;
    /// Blocking send of `data` to `dest`. FIFO per (source, dest) pair.
    async fn send(&self, dest: i32, data: &[u8]) -> EngineResult<()>;
    /// Blocking receive of exactly `len` bytes from `src`.
    async fn recv(&self, src: i32, len: usize) -> EngineResult<Vec<u8>>;
    /// Gather `data` from every rank into a vector indexed by rank, on
    /// every rank (spec §4.5 "all-gathers are used to stream per-block
    /// shard data").
    async fn all_gather(&self, data: &[u8]) -> EngineResult<Vec<Vec<u8>>>;
    /// Logical OR of `flag` across every rank, visible to every rank
    /// (spec §4.1 "collectively OR-reduces per-rank results", §4.7).
    async fn all_reduce_or(&self, flag: bool) -> EngineResult<bool>;
    /// Minimum of `value` across every rank (spec §4.1 `restart_test`
    /// group-minimum semantics).
    async fn all_reduce_min(&self, value: u64) -> EngineResult<u64>;
    /// Synchronization barrier.
    async fn barrier(&self) -> EngineResult<()>;
}

/// Shared rendezvous point backing [`LocalCommunicator::barrier`] — one
/// instance per group, not per rank. A generation counter plus an arrival
/// count: the last rank to arrive resets the count, bumps the generation,
/// and wakes every other rank still waiting on it.
struct GroupBarrier {
    size: i32,
    state: Mutex<BarrierState>,
    notify: Notify,
}

struct BarrierState {
    arrived: i32,
    generation: u64,
}

impl GroupBarrier {
    fn new(size: i32) -> Self {
        GroupBarrier {
            size,
            state: Mutex::new(BarrierState { arrived: 0, generation: 0 }),
            notify: Notify::new(),
        }
    }

    /// Block until every rank in the group has called `wait` for the
    /// current generation. The `notified()` future is created before the
    /// generation is re-checked and before it is awaited, so a
    /// `notify_waiters()` fired by the last arriver anywhere after that
    /// point — even before this task starts polling — is not lost.
    async fn wait(&self) {
        let mut state = self.state.lock();
        let generation = state.generation;
        state.arrived += 1;
        if state.arrived == self.size {
            state.arrived = 0;
            state.generation = state.generation.wrapping_add(1);
            drop(state);
            self.notify.notify_waiters();
            return;
        }
        drop(state);

        loop {
            let notified = self.notify.notified();
            if self.state.lock().generation != generation {
                return;
            }
            notified.await;
        }
    }
}

struct LocalState {
    rank: i32,
    size: i32,
    /// `senders[dest]` is this rank's outgoing queue to `dest`.
    senders: Vec<mpsc::UnboundedSender<Vec<u8>>>,
    /// `receivers[src]` is this rank's incoming queue from `src`, behind an
    /// async mutex so `recv` can take `&mut` access through `&self`.
    receivers: Vec<AsyncMutex<mpsc::UnboundedReceiver<Vec<u8>>>>,
    /// Shared rendezvous slots for collectives, one per rank, reused
    /// round-by-round under the protection of `barrier`.
    collective: Arc<Mutex<Vec<Option<Vec<u8>>>>>,
    /// Shared across every rank in the group.
    barrier: Arc<GroupBarrier>,
}

/// An in-process `Communicator` built from `tokio::sync::mpsc` links,
/// useful for simulating a multi-rank job within one test process.
pub struct LocalCommunicator {
    state: LocalState,
}

impl LocalCommunicator {
    /// Build `size` communicators wired to each other with unbounded
    /// per-pair channels, indexed by rank.
    pub fn build_group(size: i32) -> Vec<Arc<LocalCommunicator>> {
        assert!(size > 0);
        let size_usize = size as usize;

        let mut senders: Vec<Vec<mpsc::UnboundedSender<Vec<u8>>>> =
            (0..size_usize).map(|_| Vec::with_capacity(size_usize)).collect();
        // rx_slots[j][i] is the receiving half of the i -> j channel,
        // filled in below and handed to rank j.
        let mut rx_slots: Vec<Vec<Option<mpsc::UnboundedReceiver<Vec<u8>>>>> =
            (0..size_usize).map(|_| (0..size_usize).map(|_| None).collect()).collect();

        for i in 0..size_usize {
            for j in 0..size_usize {
                let (tx, rx) = mpsc::unbounded_channel();
                senders[i].push(tx);
                rx_slots[j][i] = Some(rx);
            }
        }

        let collective: Arc<Mutex<Vec<Option<Vec<u8>>>>> =
            Arc::new(Mutex::new(vec![None; size_usize]));
        let barrier = Arc::new(GroupBarrier::new(size));

        rx_slots
            .into_iter()
            .zip(senders)
            .enumerate()
            .map(|(rank, (rx_row, senders_row))| {
                let receivers_row = rx_row
                    .into_iter()
                    .map(|rx| AsyncMutex::new(rx.expect("channel built for every ordered pair")))
                    .collect();
                Arc::new(LocalCommunicator {
                    state: LocalState {
                        rank: rank as i32,
                        size,
                        senders: senders_row,
                        receivers: receivers_row,
                        collective: collective.clone(),
                        barrier: barrier.clone(),
                    },
                })
            })
            .collect()
    }
}

#[async_trait]
impl Communicator for LocalCommunicator {
    fn rank(&self) -> i32 {
        self.state.rank
    }

    fn size(&self) -> i32 {
        self.state.size
    }

    async fn send(&self, dest: i32, data: &[u8]) -> EngineResult<()> {
        self.state.senders[dest as usize]
            .send(data.to_vec())
            .map_err(|e| EngineError::QueueFailure(format!("local send failed: {e}")))
    }

    async fn recv(&self, src: i32, len: usize) -> EngineResult<Vec<u8>> {
        let mut receiver = self.state.receivers[src as usize].lock().await;
        let bytes = receiver
            .recv()
            .await
            .ok_or_else(|| EngineError::QueueFailure(format!("channel from rank {src} closed")))?;
        if bytes.len() != len {
            return Err(EngineError::QueueFailure(format!(
                "expected {len} bytes from rank {src}, got {}",
                bytes.len()
            )));
        }
        Ok(bytes)
    }

    async fn all_gather(&self, data: &[u8]) -> EngineResult<Vec<Vec<u8>>> {
        let size = self.state.size as usize;
        {
            let mut slots = self.state.collective.lock();
            slots[self.state.rank as usize] = Some(data.to_vec());
        }
        // Every rank's write above must be visible before any rank reads,
        // and every rank must finish reading before the slots are reused
        // by the next round — hence a barrier on both sides.
        self.barrier().await?;
        let slots = self.state.collective.lock();
        let result: Vec<Vec<u8>> = (0..size)
            .map(|i| slots[i].clone().unwrap_or_default())
            .collect();
        drop(slots);
        self.barrier().await?;
        Ok(result)
    }

    async fn all_reduce_or(&self, flag: bool) -> EngineResult<bool> {
        let gathered = self.all_gather(&[flag as u8]).await?;
        Ok(gathered.iter().any(|b| b.first() == Some(&1)))
    }

    async fn all_reduce_min(&self, value: u64) -> EngineResult<u64> {
        let gathered = self.all_gather(&value.to_le_bytes()).await?;
        gathered
            .iter()
            .map(|b| {
                if b.len() != 8 {
                    return Err(EngineError::QueueFailure(format!(
                        "all_reduce_min: expected an 8-byte value, got {} bytes",
                        b.len()
                    )));
                }
                let mut arr = [0u8; 8];
                arr.copy_from_slice(b);
                Ok(u64::from_le_bytes(arr))
            })
            .collect::<EngineResult<Vec<u64>>>()
            .map(|values| values.into_iter().min().unwrap_or(value))
    }

    async fn barrier(&self) -> EngineResult<()> {
        self.state.barrier.wait().await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn ring_send_recv() {
        let comms = LocalCommunicator::build_group(3);
        let right = |r: i32| (r + 1) % 3;
        let left = |r: i32| (r - 1 + 3) % 3;

        let mut handles = Vec::new();
        for (rank, comm) in comms.into_iter().enumerate() {
            let rank = rank as i32;
            handles.push(tokio::spawn(async move {
                let payload = vec![rank as u8; 4];
                comm.send(right(rank), &payload).await.unwrap();
                let received = comm.recv(left(rank), 4).await.unwrap();
                assert_eq!(received, vec![left(rank) as u8; 4]);
            }));
        }
        for h in handles {
            h.await.unwrap();
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn all_reduce_min_takes_group_minimum() {
        let comms = LocalCommunicator::build_group(4);
        let mut handles = Vec::new();
        for (rank, comm) in comms.into_iter().enumerate() {
            let value = (10 - rank) as u64;
            handles.push(tokio::spawn(async move {
                comm.all_reduce_min(value).await.unwrap()
            }));
        }
        for h in handles {
            assert_eq!(h.await.unwrap(), 7);
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn all_gather_returns_every_rank_contribution() {
        let comms = LocalCommunicator::build_group(3);
        let mut handles = Vec::new();
        for (rank, comm) in comms.into_iter().enumerate() {
            handles.push(tokio::spawn(async move {
                comm.all_gather(&[rank as u8]).await.unwrap()
            }));
        }
        for h in handles {
            let gathered = h.await.unwrap();
            assert_eq!(gathered, vec![vec![0u8], vec![1u8], vec![2u8]]);
        }
    }
}
