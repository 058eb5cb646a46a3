//! Per-file-handle shim: asynchronous replications are parked here
//! until the filesystem layer flushes or closes the handle

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;

use crate::context::ReplicaContext;
use crate::engine::ReplicationManager;
use crate::error::Error;

/// Accumulates the asynchronous replica contexts of one open file
pub struct FileHandle {
	/// Per-operation transfer timeout; None falls back to the
	/// configured transfer_timeout
	transfer_timeout: Option<Duration>,
	pending_contexts: Mutex<Vec<Arc<ReplicaContext>>>,
}

impl FileHandle {
	pub fn new(transfer_timeout: Option<Duration>) -> Self {
		Self {
			transfer_timeout,
			pending_contexts: Mutex::new(Vec::new()),
		}
	}

	pub(crate) async fn push(&self, ctx: Arc<ReplicaContext>) {
		self.pending_contexts.lock().await.push(ctx);
	}

	/// The contexts currently parked on this handle
	pub async fn pending_contexts(&self) -> Vec<Arc<ReplicaContext>> {
		self.pending_contexts.lock().await.clone()
	}

	/// Wait for every parked replication of this handle and release
	/// the contexts. Returns the worst error of the batch; transfers
	/// that outlive the timeout are expired by the worker.
	pub async fn wait_all(&self, replication: &ReplicationManager) -> Result<(), Error> {
		let contexts = {
			let mut pending = self.pending_contexts.lock().await;
			pending.drain(..).collect::<Vec<_>>()
		};

		let timeout = self.transfer_timeout.or_else(|| replication.core.transfer_timeout());
		replication.wait_contexts(contexts, timeout).await
	}
}
