//! The transfer worker: single consumer of an engine's queues, sole
//! owner of the active set, and the only place where contexts are torn
//! down. One worker runs per engine.
//!
//! Each iteration promotes pending legs to active, applies queued
//! cancellations and expiries by detaching the matching legs, then
//! blocks on the next leg completion or queue notification. A context's
//! processing semaphore is released exactly once, when its last leg
//! leaves the active set.

use std::collections::HashMap;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use futures::future::{abortable, AbortHandle, BoxFuture};
use futures::FutureExt;
use futures_util::stream::{FuturesUnordered, StreamExt};
use opentelemetry::Context;
use tokio::select;
use tokio::sync::watch;

use hangar_util::background::worker::{Worker, WorkerStatus};
use hangar_util::error::Error as CommonError;

use crate::context::ReplicaContext;
use crate::engine::TransferEngine;
use crate::error::TransferError;
use crate::sets::HandleId;

/// Outcome of one leg: the HTTP status or a transport error, or None
/// when the leg was aborted after being detached
type LegResult = (
	HandleId,
	Option<Result<reqwest::StatusCode, reqwest::Error>>,
);

struct ActiveTransfer {
	ctx: Arc<ReplicaContext>,
	abort: AbortHandle,
	started: Instant,
}

pub struct TransferWorker {
	engine: Arc<TransferEngine>,
	active: HashMap<HandleId, ActiveTransfer>,
	transfers: FuturesUnordered<BoxFuture<'static, LegResult>>,
}

impl TransferWorker {
	pub(crate) fn new(engine: Arc<TransferEngine>) -> Self {
		Self {
			engine,
			active: HashMap::new(),
			transfers: FuturesUnordered::new(),
		}
	}

	/// Promote every pending leg to active and start its request
	async fn drain_pending(&mut self) {
		if !self.engine.sets.has_pending.swap(false, Ordering::SeqCst) {
			return;
		}

		let promoted = {
			let mut pending = self.engine.sets.pending.lock().await;
			pending.drain().collect::<Vec<_>>()
		};

		for (handle, leg) in promoted {
			let client = self.engine.client.clone();
			let request = leg.request;
			let (fut, abort) = abortable(async move {
				let response = client.execute(request).await?;
				let status = response.status();
				// drain the response so the connection can be reused
				let _ = response.bytes().await;
				Ok::<_, reqwest::Error>(status)
			});

			self.engine
				.metrics
				.transfers_started
				.add(&Context::current(), 1, &self.engine.metric_attrs);

			self.active.insert(
				handle,
				ActiveTransfer {
					ctx: leg.ctx,
					abort,
					started: Instant::now(),
				},
			);
			self.transfers
				.push(fut.map(move |res| (handle, res.ok())).boxed());
		}
	}

	/// Detach every active leg whose context matches a queued
	/// cancellation snapshot
	async fn drain_cancels(&mut self) {
		if !self.engine.sets.has_cancels.swap(false, Ordering::SeqCst) {
			return;
		}

		let cancels = {
			let mut cancels = self.engine.sets.cancels.lock().await;
			cancels.drain(..).collect::<Vec<_>>()
		};

		for snapshot in cancels {
			let matches = self
				.active
				.iter()
				.filter(|(_, t)| t.ctx.snapshot == snapshot)
				.map(|(handle, _)| *handle)
				.collect::<Vec<_>>();
			for handle in matches {
				debug!(
					"({}) cancelling active transfer of {:X} v{}",
					self.engine.name, snapshot.file_id, snapshot.file_version
				);
				self.detach(handle, TransferError::Cancelled).await;
			}
		}
	}

	/// Detach every leg whose waiter gave up on its deadline
	async fn drain_expires(&mut self) {
		if !self.engine.sets.has_expires.swap(false, Ordering::SeqCst) {
			return;
		}

		let expires = {
			let mut expires = self.engine.sets.expires.lock().await;
			expires.drain(..).collect::<Vec<_>>()
		};

		for handle in expires {
			self.detach(handle, TransferError::Timeout).await;
		}
	}

	/// Remove one leg from the active set, aborting its request. When
	/// it was the context's last leg, the context is finished here.
	async fn detach(&mut self, handle: HandleId, err: TransferError) {
		if let Some(transfer) = self.active.remove(&handle) {
			transfer.abort.abort();
			transfer.ctx.record_error(err).await;
			self.engine
				.metrics
				.transfers_detached
				.add(&Context::current(), 1, &self.engine.metric_attrs);

			if transfer.ctx.detach_handle(handle).await == 0 {
				self.finish(transfer.ctx).await;
			}
		}
	}

	/// A leg completed on its own: classify the response and reap it
	async fn reap(&mut self, handle: HandleId, outcome: Option<Result<reqwest::StatusCode, reqwest::Error>>) {
		let transfer = match self.active.remove(&handle) {
			Some(t) => t,
			// already detached by a cancellation or an expiry
			None => return,
		};

		match outcome {
			Some(Ok(status)) => match classify_status(status) {
				None => {
					self.engine.metrics.transfer_duration.record(
						&Context::current(),
						transfer.started.elapsed().as_secs_f64(),
						&self.engine.metric_attrs,
					);
					self.engine.metrics.bytes_sent.add(
						&Context::current(),
						transfer.ctx.size,
						&self.engine.metric_attrs,
					);
				}
				Some(err) => {
					warn!(
						"({}) replica gateway returned HTTP {} for {:?} of {:X}",
						self.engine.name, status, transfer.ctx.kind, transfer.ctx.snapshot.file_id
					);
					transfer.ctx.record_error(err).await;
					self.engine
						.metrics
						.transfers_failed
						.add(&Context::current(), 1, &self.engine.metric_attrs);
				}
			},
			Some(Err(e)) => {
				warn!(
					"({}) transport error transferring {:?} of {:X}: {}",
					self.engine.name, transfer.ctx.kind, transfer.ctx.snapshot.file_id, e
				);
				transfer.ctx.record_error(TransferError::Transport).await;
				self.engine
					.metrics
					.transfers_failed
					.add(&Context::current(), 1, &self.engine.metric_attrs);
			}
			// aborted legs only surface after detach already reaped them
			None => (),
		}

		if transfer.ctx.detach_handle(handle).await == 0 {
			self.finish(transfer.ctx).await;
		}
	}

	/// All legs of this context are gone: release its waiter, or drop
	/// the last reference if nobody waits
	async fn finish(&mut self, ctx: Arc<ReplicaContext>) {
		debug!(
			"({}) finished {:?} of {:X} v{}",
			self.engine.name, ctx.kind, ctx.snapshot.file_id, ctx.snapshot.file_version
		);
		self.engine
			.metrics
			.transfers_completed
			.add(&Context::current(), 1, &self.engine.metric_attrs);
		ctx.mark_processed();
	}

	/// Abort everything and release every waiter; runs at shutdown.
	/// Pending transfers are abandoned: a process restart would lose
	/// them too, callers re-issue.
	async fn teardown(&mut self) {
		let handles = self.active.keys().copied().collect::<Vec<_>>();
		for handle in handles {
			self.detach(handle, TransferError::Cancelled).await;
		}
		self.transfers.clear();

		let abandoned = {
			let mut pending = self.engine.sets.pending.lock().await;
			pending.drain().collect::<Vec<_>>()
		};
		for (handle, leg) in abandoned {
			leg.ctx.record_error(TransferError::Cancelled).await;
			if leg.ctx.detach_handle(handle).await == 0 {
				leg.ctx.mark_processed();
			}
		}
	}
}

#[async_trait]
impl Worker for TransferWorker {
	fn name(&self) -> String {
		format!("Transfer worker ({})", self.engine.name)
	}

	async fn work(
		&mut self,
		must_exit: &mut watch::Receiver<bool>,
	) -> Result<WorkerStatus, CommonError> {
		if *must_exit.borrow() {
			self.teardown().await;
			return Ok(WorkerStatus::Done);
		}

		self.drain_pending().await;
		self.drain_cancels().await;
		self.drain_expires().await;

		if self.active.is_empty()
			&& self.transfers.is_empty()
			&& !self.engine.sets.anything_queued()
		{
			return Ok(WorkerStatus::Idle);
		}

		select! {
			done = self.transfers.next(), if !self.transfers.is_empty() => {
				if let Some((handle, outcome)) = done {
					self.reap(handle, outcome).await;
				}
			}
			_ = self.engine.sets.notify.notified() => (),
			_ = must_exit.changed() => (),
		}

		Ok(WorkerStatus::Busy)
	}

	async fn wait_for_work(&mut self, must_exit: &watch::Receiver<bool>) -> WorkerStatus {
		if *must_exit.borrow() {
			// let work() run the teardown
			return WorkerStatus::Busy;
		}
		let mut must_exit = must_exit.clone();
		select! {
			_ = self.engine.sets.notify.notified() => (),
			_ = must_exit.changed() => (),
		}
		WorkerStatus::Busy
	}
}

fn classify_status(status: reqwest::StatusCode) -> Option<TransferError> {
	if status.is_success() {
		None
	} else if status == reqwest::StatusCode::NOT_FOUND {
		Some(TransferError::NotFound)
	} else if status == reqwest::StatusCode::FORBIDDEN {
		Some(TransferError::PermissionDenied)
	} else {
		Some(TransferError::RemoteIo(status.as_u16()))
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn test_classify_status() {
		assert_eq!(classify_status(reqwest::StatusCode::OK), None);
		assert_eq!(classify_status(reqwest::StatusCode::NO_CONTENT), None);
		assert_eq!(
			classify_status(reqwest::StatusCode::NOT_FOUND),
			Some(TransferError::NotFound)
		);
		assert_eq!(
			classify_status(reqwest::StatusCode::FORBIDDEN),
			Some(TransferError::PermissionDenied)
		);
		assert_eq!(
			classify_status(reqwest::StatusCode::INTERNAL_SERVER_ERROR),
			Some(TransferError::RemoteIo(500))
		);
	}
}
