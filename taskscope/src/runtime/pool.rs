//! Worker fan-out: one consumer thread per observed target thread.
//!
//! The registry maps thread ids to channel senders and is locked only for
//! lookup and insert, never while records are being handled. Dropping the
//! pool closes every channel; workers drain what is queued, run their
//! consumer's teardown and exit.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::JoinHandle;

use crossbeam_channel::Sender;
use log::warn;
use taskscope_common::RawRecord;

use crate::consumer::ThreadConsumer;
use crate::domain::ThreadId;
use crate::trace::Batch;

use super::Manager;

struct Worker {
    sender: Sender<Vec<RawRecord>>,
    join: JoinHandle<()>,
}

pub struct ConsumerPool {
    manager: Arc<Manager>,
    workers: Mutex<HashMap<ThreadId, Worker>>,
}

impl ConsumerPool {
    #[must_use]
    pub fn new(manager: Arc<Manager>) -> Self {
        Self { manager, workers: Mutex::new(HashMap::new()) }
    }

    /// Hand a batch to its thread's consumer, spawning the worker on
    /// first sight of the thread.
    pub fn deliver(&self, batch: Batch) {
        let sender = {
            let mut workers = self.workers.lock().unwrap_or_else(PoisonError::into_inner);
            workers
                .entry(batch.thread)
                .or_insert_with(|| spawn_worker(Arc::clone(&self.manager), batch.thread))
                .sender
                .clone()
        };
        if sender.send(batch.records).is_err() {
            warn!("consumer for thread {} is gone; dropping batch", batch.thread);
        }
    }

    /// Tear down every consumer: close the channels and wait for the
    /// workers to finish their queues and write their thread rows.
    pub fn shutdown(self) {
        let workers = {
            let mut map = self.workers.lock().unwrap_or_else(PoisonError::into_inner);
            std::mem::take(&mut *map)
        };
        for (thread, worker) in workers {
            drop(worker.sender);
            if worker.join.join().is_err() {
                warn!("consumer for thread {thread} panicked during teardown");
            }
        }
    }
}

fn spawn_worker(manager: Arc<Manager>, thread: ThreadId) -> Worker {
    let (sender, receiver) = crossbeam_channel::unbounded::<Vec<RawRecord>>();

    let join = std::thread::Builder::new()
        .name(format!("consumer-{thread}"))
        .spawn(move || {
            pin_to_current_cpu();
            let mut consumer = ThreadConsumer::new(manager, thread);
            for records in receiver {
                for record in &records {
                    consumer.handle_record(record);
                }
            }
            consumer.finish();
        })
        .unwrap_or_else(|err| {
            // Out of threads this early means the run cannot proceed.
            log::error!("could not spawn consumer for thread {thread}: {err}");
            std::process::exit(1);
        });

    Worker { sender, join }
}

/// Keep the consumer on the core it started on. Best effort; a failure
/// costs locality, not correctness.
#[cfg(target_os = "linux")]
fn pin_to_current_cpu() {
    // SAFETY: cpu_set_t is plain data; the CPU_* helpers only write into
    // the zeroed set we hand them, and sched_setaffinity reads it.
    #[allow(unsafe_code)]
    unsafe {
        let Ok(cpu) = usize::try_from(libc::sched_getcpu()) else {
            return;
        };
        let mut set: libc::cpu_set_t = std::mem::zeroed();
        libc::CPU_ZERO(&mut set);
        libc::CPU_SET(cpu, &mut set);
        if libc::sched_setaffinity(0, std::mem::size_of::<libc::cpu_set_t>(), &set) != 0 {
            log::debug!("could not pin consumer to cpu {cpu}");
        }
    }
}

#[cfg(not(target_os = "linux"))]
fn pin_to_current_cpu() {}
