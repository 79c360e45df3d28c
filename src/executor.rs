//! Request execution with deadline enforcement.
//!
//! A request runs on a dedicated worker thread that holds its session
//! entry's lock for the whole turn; requests for the same session
//! serialize on that lock while other sessions proceed. The caller waits
//! on a bounded channel with `recv_timeout`.
//!
//! The [`Ticket`] settles the race between completion and timeout with a
//! single compare-exchange. The worker commits the turn to the cache only
//! after winning the ticket, so a timed-out request never leaves a
//! partially updated session behind: the entry either reflects the full
//! committed turn or is untouched.

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use crossbeam_channel::{bounded, RecvTimeoutError};

use crate::cache::{CacheEntry, ItemId};
use crate::config::RequestParams;
use crate::error::{Result, VlmError};
use crate::model::ModelBinding;
use crate::ranker::RankingModel;

const PENDING: u8 = 0;
const COMPLETED: u8 = 1;
const CANCELLED: u8 = 2;

/// One-shot settle flag shared by a request and its worker.
///
/// Exactly one side wins: the worker settles `COMPLETED` before
/// committing, the timeout path settles `CANCELLED`. The loser defers to
/// the winner.
#[derive(Debug, Clone, Default)]
pub struct Ticket(Arc<AtomicU8>);

impl Ticket {
    pub fn new() -> Self {
        Ticket(Arc::new(AtomicU8::new(PENDING)))
    }

    /// Settle as completed. Returns false if already cancelled.
    pub fn try_complete(&self) -> bool {
        self.0
            .compare_exchange(PENDING, COMPLETED, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    /// Settle as cancelled. Returns false if already completed.
    pub fn try_cancel(&self) -> bool {
        self.0
            .compare_exchange(PENDING, CANCELLED, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst) == CANCELLED
    }
}

/// Everything a worker needs to run one turn.
pub struct RequestJob {
    pub binding: Arc<ModelBinding>,
    pub entry: Arc<Mutex<CacheEntry>>,
    pub ranker: Arc<dyn RankingModel>,
    pub params: RequestParams,
    pub new_items: Vec<ItemId>,
}

/// Run one request with a deadline.
///
/// `timeout_ms == 0` waits indefinitely. On timeout the worker thread may
/// still be draining; its `JoinHandle` is returned so the handle can join
/// it at destroy time instead of blocking the caller here.
pub fn execute(
    job: RequestJob,
    timeout_ms: u64,
) -> (Result<Vec<ItemId>>, Option<JoinHandle<()>>) {
    let (tx, rx) = bounded::<Result<Vec<ItemId>>>(1);
    let ticket = Ticket::new();
    let worker_ticket = ticket.clone();

    let worker = std::thread::spawn(move || {
        // Holding the entry lock for the whole turn is the single-writer
        // guarantee for this session. A lock poisoned by an earlier
        // panicked turn still guards consistent state (entries mutate
        // only through committed turns), so it is reclaimed.
        let mut entry = job
            .entry
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let snapshot = entry.snapshot();

        let outcome = job.ranker.rank(
            &job.binding,
            &snapshot,
            &job.new_items,
            &job.params,
            &worker_ticket,
        );

        // Commit only after winning the settle race; a cancelled turn
        // leaves the entry exactly as the snapshot saw it.
        if !worker_ticket.try_complete() {
            return;
        }
        let result = outcome.map(|ranked| {
            entry.commit_turn(
                &job.new_items,
                &ranked.items,
                ranked.refreshed_pool,
                &job.binding,
            );
            ranked.items
        });
        let _ = tx.send(result);
    });

    let received = if timeout_ms == 0 {
        rx.recv().map_err(|_| RecvTimeoutError::Disconnected)
    } else {
        rx.recv_timeout(Duration::from_millis(timeout_ms))
    };

    match received {
        Ok(result) => {
            join_worker(worker);
            (result, None)
        }
        Err(RecvTimeoutError::Timeout) => {
            if ticket.try_cancel() {
                tracing::warn!(timeout_ms, "request deadline exceeded");
                // Worker may still be mid-rank; the handle joins it later.
                (Err(VlmError::Timeout), Some(worker))
            } else {
                // The worker completed between the timeout firing and the
                // cancel attempt; its result is already in the channel.
                let result = rx
                    .recv()
                    .map_err(|_| VlmError::Internal("worker exited without a result".into()))
                    .and_then(|r| r);
                join_worker(worker);
                (result, None)
            }
        }
        Err(RecvTimeoutError::Disconnected) => {
            join_worker(worker);
            (
                Err(VlmError::Internal("request worker exited abnormally".into())),
                None,
            )
        }
    }
}

fn join_worker(worker: JoinHandle<()>) {
    if worker.join().is_err() {
        tracing::error!("request worker panicked");
    }
}
