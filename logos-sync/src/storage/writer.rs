//! Background persistence task.
//!
//! The hub enqueues commands and moves on; a single tokio task drains the
//! queue in order and calls the [`Persistence`] backend. Failures are logged
//! and counted, never returned to the hub.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use super::{Persistence, SnapshotMetadata};
use crate::document::Snapshot;
use crate::error::StoreError;
use crate::operation::Operation;
use crate::presence::Cursor;

/// One queued write.
#[derive(Debug)]
pub enum PersistCommand {
    Operation {
        room_id: String,
        op: Operation,
    },
    Snapshot {
        room_id: String,
        snapshot: Snapshot,
        metadata: SnapshotMetadata,
    },
    Cursor {
        room_id: String,
        user_id: String,
        client_id: String,
        cursor: Cursor,
    },
    DeleteRoom {
        room_id: String,
    },
    /// Resolves once every earlier command has been handled
    Flush(oneshot::Sender<()>),
}

#[derive(Debug, Default)]
struct WriterCounters {
    written: AtomicU64,
    failed: AtomicU64,
}

/// Fire-and-forget front end for a [`Persistence`] backend.
pub struct PersistenceWriter {
    tx: mpsc::UnboundedSender<PersistCommand>,
    store: Arc<dyn Persistence>,
    counters: Arc<WriterCounters>,
    task: Option<JoinHandle<()>>,
}

impl PersistenceWriter {
    /// Spawn the writer task on the current tokio runtime.
    pub fn spawn(store: Arc<dyn Persistence>) -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel::<PersistCommand>();
        let counters = Arc::new(WriterCounters::default());

        let task_store = Arc::clone(&store);
        let task_counters = Arc::clone(&counters);
        let task = tokio::spawn(async move {
            while let Some(command) = rx.recv().await {
                let (label, result) = match command {
                    PersistCommand::Operation { room_id, op } => {
                        ("operation", task_store.save_operation(&room_id, &op))
                    }
                    PersistCommand::Snapshot { room_id, snapshot, metadata } => {
                        ("snapshot", task_store.save_snapshot(&room_id, &snapshot, &metadata))
                    }
                    PersistCommand::Cursor { room_id, user_id, client_id, cursor } => (
                        "cursor",
                        task_store.save_cursor_state(&room_id, &user_id, &client_id, cursor),
                    ),
                    PersistCommand::DeleteRoom { room_id } => {
                        ("delete", task_store.delete_room_data(&room_id))
                    }
                    PersistCommand::Flush(done) => {
                        let _ = done.send(());
                        continue;
                    }
                };
                match result {
                    Ok(()) => {
                        task_counters.written.fetch_add(1, Ordering::Relaxed);
                    }
                    Err(e) => {
                        task_counters.failed.fetch_add(1, Ordering::Relaxed);
                        log::error!("Persistence {label} write failed: {e}");
                    }
                }
            }
            log::debug!("Persistence writer stopped");
        });

        Self {
            tx,
            store,
            counters,
            task: Some(task),
        }
    }

    /// Backend for reads (document restore).
    pub fn store(&self) -> &Arc<dyn Persistence> {
        &self.store
    }

    fn enqueue(&self, command: PersistCommand) {
        if self.tx.send(command).is_err() {
            self.counters.failed.fetch_add(1, Ordering::Relaxed);
            log::error!("{}", StoreError::Closed);
        }
    }

    pub fn save_operation(&self, room_id: &str, op: Operation) {
        self.enqueue(PersistCommand::Operation {
            room_id: room_id.to_string(),
            op,
        });
    }

    pub fn save_snapshot(&self, room_id: &str, snapshot: Snapshot, metadata: SnapshotMetadata) {
        self.enqueue(PersistCommand::Snapshot {
            room_id: room_id.to_string(),
            snapshot,
            metadata,
        });
    }

    pub fn save_cursor_state(&self, room_id: &str, user_id: &str, client_id: &str, cursor: Cursor) {
        self.enqueue(PersistCommand::Cursor {
            room_id: room_id.to_string(),
            user_id: user_id.to_string(),
            client_id: client_id.to_string(),
            cursor,
        });
    }

    pub fn delete_room_data(&self, room_id: &str) {
        self.enqueue(PersistCommand::DeleteRoom {
            room_id: room_id.to_string(),
        });
    }

    /// Queue a marker that resolves once every command queued before it has
    /// been handled. Does not wait.
    pub fn barrier(&self) -> Result<oneshot::Receiver<()>, StoreError> {
        let (done_tx, done_rx) = oneshot::channel();
        self.tx
            .send(PersistCommand::Flush(done_tx))
            .map_err(|_| StoreError::Closed)?;
        Ok(done_rx)
    }

    /// Wait until every command queued so far has been handled.
    pub async fn flush(&self) -> Result<(), StoreError> {
        self.barrier()?.await.map_err(|_| StoreError::Closed)
    }

    /// Successful writes so far.
    pub fn written(&self) -> u64 {
        self.counters.written.load(Ordering::Relaxed)
    }

    /// Failed writes so far.
    pub fn failed(&self) -> u64 {
        self.counters.failed.load(Ordering::Relaxed)
    }

    /// Drain remaining commands and stop the task.
    pub async fn shutdown(self) {
        let Self { tx, task, .. } = self;
        drop(tx);
        let Some(task) = task else {
            return;
        };
        if let Err(e) = task.await {
            log::error!("Persistence writer task failed: {e}");
        }
    }
}
