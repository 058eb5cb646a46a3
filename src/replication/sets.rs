//! Shared queues between an engine's front door and its worker:
//! pending fan-out legs, cancellation requests and expiry requests,
//! each behind its own lock with a raised flag, plus the notifier that
//! wakes the worker.
//!
//! Lock order, should several ever be needed: pending → cancels →
//! expires (in practice they are never nested). The active set is not
//! here: it is owned by the worker task alone, which is what makes
//! context teardown single-owner and race-free.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::{Mutex, Notify};

use crate::context::{ReplicaContext, ReplicaSnapshot};

/// Opaque identifier of one fan-out leg
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HandleId(u64);

/// One leg waiting to be promoted to active by the worker
pub(crate) struct PendingTransfer {
	pub(crate) ctx: Arc<ReplicaContext>,
	pub(crate) request: reqwest::Request,
}

pub(crate) struct TransferSets {
	next_handle: AtomicU64,

	pub(crate) pending: Mutex<HashMap<HandleId, PendingTransfer>>,
	pub(crate) has_pending: AtomicBool,

	pub(crate) cancels: Mutex<Vec<ReplicaSnapshot>>,
	pub(crate) has_cancels: AtomicBool,

	pub(crate) expires: Mutex<Vec<HandleId>>,
	pub(crate) has_expires: AtomicBool,

	/// Wakes the worker whenever one of the flags above is raised
	pub(crate) notify: Notify,
}

impl TransferSets {
	pub(crate) fn new() -> Self {
		Self {
			next_handle: AtomicU64::new(1),
			pending: Mutex::new(HashMap::new()),
			has_pending: AtomicBool::new(false),
			cancels: Mutex::new(Vec::new()),
			has_cancels: AtomicBool::new(false),
			expires: Mutex::new(Vec::new()),
			has_expires: AtomicBool::new(false),
			notify: Notify::new(),
		}
	}

	pub(crate) fn alloc_handle(&self) -> HandleId {
		HandleId(self.next_handle.fetch_add(1, Ordering::Relaxed))
	}

	pub(crate) fn raise_pending(&self) {
		self.has_pending.store(true, Ordering::SeqCst);
		self.notify.notify_one();
	}

	pub(crate) fn raise_cancels(&self) {
		self.has_cancels.store(true, Ordering::SeqCst);
		self.notify.notify_one();
	}

	pub(crate) fn raise_expires(&self) {
		self.has_expires.store(true, Ordering::SeqCst);
		self.notify.notify_one();
	}

	/// Is anything queued for the worker?
	pub(crate) fn anything_queued(&self) -> bool {
		self.has_pending.load(Ordering::SeqCst)
			|| self.has_cancels.load(Ordering::SeqCst)
			|| self.has_expires.load(Ordering::SeqCst)
	}
}
