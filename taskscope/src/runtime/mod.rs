//! Run orchestration: shared state, the consumer pool and the replay
//! drive loop.

pub mod manager;
pub mod pool;

pub use manager::Manager;
pub use pool::ConsumerPool;

use std::io::Read;
use std::sync::Arc;

use crate::domain::TraceError;
use crate::trace::TraceReader;

/// Replay every batch in the trace through per-thread consumers. Returns
/// once all consumers have finished and written their thread rows.
pub fn consume_trace<R: Read>(
    reader: &mut TraceReader<R>,
    manager: &Arc<Manager>,
) -> Result<(), TraceError> {
    let pool = ConsumerPool::new(Arc::clone(manager));
    while let Some(batch) = reader.next_batch()? {
        pool.deliver(batch);
    }
    pool.shutdown();
    Ok(())
}
