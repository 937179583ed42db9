//! The reader capability common to both shard-reader flavors: `alive` and
//! `shutdown`, per the teacher's preference for a small enum over the
//! source's mix-in-based class hierarchy (see DESIGN.md).

use crate::cancellation::CancellationToken;

/// A running background reader task plus the means to stop it.
pub(crate) struct ReaderTask {
    token: CancellationToken,
    handle: tokio::task::JoinHandle<()>,
}

impl ReaderTask {
    pub(crate) fn new(token: CancellationToken, handle: tokio::task::JoinHandle<()>) -> Self {
        ReaderTask { token, handle }
    }

    fn is_alive(&self) -> bool {
        !self.handle.is_finished()
    }

    async fn shutdown(self) {
        self.token.cancel();
        let _ = self.handle.await;
    }
}

/// One live shard reader, owned exclusively by the Consumer Orchestrator's
/// reader registry (spec §5: "no external mutation").
pub enum ShardReader {
    Pull(ReaderTask),
    Push(ReaderTask),
}

impl ShardReader {
    pub fn is_alive(&self) -> bool {
        match self {
            ShardReader::Pull(task) | ShardReader::Push(task) => task.is_alive(),
        }
    }

    pub async fn shutdown(self) {
        match self {
            ShardReader::Pull(task) | ShardReader::Push(task) => task.shutdown().await,
        }
    }
}
