//! Engine front door. A [`TransferEngine`] is one transfer machine
//! (queues + multi-connection HTTP client + one worker); the
//! [`ReplicationManager`] owns the two instances a gateway runs —
//! `replication` POSTs artifacts, `garbage_collector` DELETEs them —
//! and exposes the entry points called by the filesystem layer.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use opentelemetry::KeyValue;
use tokio::time::timeout_at;

use hangar_util::background::BackgroundRunner;

use crate::context::{ReplicaContext, ReplicaSnapshot, TransferOp};
use crate::entry::{BlockInfo, FsEntry, GatewayCore};
use crate::error::{Error, TransferError};
use crate::handle::FileHandle;
use crate::metrics::ReplicationMetrics;
use crate::sets::{HandleId, PendingTransfer, TransferSets};
use crate::worker::TransferWorker;

pub(crate) struct TransferEngine {
	pub(crate) name: &'static str,
	pub(crate) op: TransferOp,
	pub(crate) core: Arc<GatewayCore>,
	pub(crate) client: reqwest::Client,
	pub(crate) sets: TransferSets,
	pub(crate) metrics: Arc<ReplicationMetrics>,
	pub(crate) metric_attrs: Vec<KeyValue>,
}

impl TransferEngine {
	fn new(
		name: &'static str,
		op: TransferOp,
		core: Arc<GatewayCore>,
		metrics: Arc<ReplicationMetrics>,
	) -> Result<Arc<Self>, Error> {
		let client = reqwest::Client::builder()
			.connect_timeout(core.connect_timeout())
			.build()?;

		Ok(Arc::new(Self {
			name,
			op,
			core,
			client,
			sets: TransferSets::new(),
			metrics,
			metric_attrs: vec![KeyValue::new("engine", name)],
		}))
	}

	/// Fan one context out to every replica gateway of the volume and
	/// queue the legs for the worker. All legs enter pending under a
	/// single lock acquisition, so the worker sees none or all of them.
	pub(crate) async fn begin(&self, ctx: &Arc<ReplicaContext>) -> Result<(), Error> {
		ctx.claim_processing()?;

		let rgs = match self.core.ms.replica_gateways().await {
			Ok(rgs) => rgs,
			Err(e) => {
				ctx.mark_processed();
				return Err(e);
			}
		};
		if rgs.is_empty() {
			ctx.mark_processed();
			return Err(Error::NoReplicas);
		}

		let legs = match self.build_legs(ctx, &rgs) {
			Ok(legs) => legs,
			Err(e) => {
				ctx.mark_processed();
				return Err(e);
			}
		};

		{
			let mut pending = self.sets.pending.lock().await;
			let handles = legs.iter().map(|(handle, _)| *handle).collect::<Vec<_>>();
			ctx.attach_handles(&handles).await;
			for (handle, request) in legs {
				pending.insert(
					handle,
					PendingTransfer {
						ctx: ctx.clone(),
						request,
					},
				);
			}
		}
		self.sets.raise_pending();

		Ok(())
	}

	fn build_legs(
		&self,
		ctx: &Arc<ReplicaContext>,
		rgs: &[u64],
	) -> Result<Vec<(HandleId, reqwest::Request)>, Error> {
		let mut legs = Vec::with_capacity(rgs.len());
		for rg in rgs {
			let url = self.core.ms.content_url(*rg);
			debug!(
				"({}) transfer {:?} of {:X} v{} to {}",
				self.name, ctx.kind, ctx.snapshot.file_id, ctx.snapshot.file_version, url
			);
			let request = self
				.client
				.request(self.op.method(), url.as_str())
				.multipart(ctx.form()?)
				.build()?;
			legs.push((self.sets.alloc_handle(), request));
		}
		Ok(legs)
	}

	/// Remove every transfer of this exact artifact version. Pending
	/// legs are dropped on the spot; active ones are left for the
	/// worker to reap through the cancel queue.
	pub(crate) async fn cancel_matching(&self, snapshot: &ReplicaSnapshot) {
		let dropped = {
			let mut pending = self.sets.pending.lock().await;
			let matches = pending
				.iter()
				.filter(|(_, leg)| leg.ctx.snapshot == *snapshot)
				.map(|(handle, _)| *handle)
				.collect::<Vec<_>>();
			matches
				.into_iter()
				.filter_map(|handle| pending.remove(&handle).map(|leg| (handle, leg)))
				.collect::<Vec<_>>()
		};

		for (handle, leg) in dropped {
			debug!(
				"({}) cancelling pending {:?} of {:X} v{}",
				self.name, leg.ctx.kind, snapshot.file_id, snapshot.file_version
			);
			leg.ctx.record_error(TransferError::Cancelled).await;
			if leg.ctx.detach_handle(handle).await == 0 {
				leg.ctx.mark_processed();
			}
		}

		{
			let mut cancels = self.sets.cancels.lock().await;
			cancels.push(*snapshot);
		}
		self.sets.raise_cancels();
	}

	/// Wait for a batch of transfers, with an optional deadline shared
	/// by the whole batch. Contexts whose deadline is blown are handed
	/// to the worker for teardown through the expire queue; the waiter
	/// never tears anything down itself. Returns the worst error of
	/// the batch.
	pub(crate) async fn wait_and_free(
		&self,
		contexts: Vec<Arc<ReplicaContext>>,
		timeout: Option<Duration>,
	) -> Result<(), Error> {
		let deadline = timeout.map(|t| tokio::time::Instant::now() + t);
		let mut worst: Option<TransferError> = None;

		for ctx in contexts {
			let finished = match deadline {
				Some(deadline) => timeout_at(deadline, ctx.acquire_processed()).await.is_ok(),
				None => {
					ctx.acquire_processed().await;
					true
				}
			};

			if finished {
				if let Some(err) = ctx.error().await {
					worst = Some(TransferError::worst(worst, err));
				}
			} else {
				let handles = ctx.handles().await;
				{
					let mut expires = self.sets.expires.lock().await;
					expires.extend(handles);
				}
				self.sets.raise_expires();
				worst = Some(TransferError::worst(worst, TransferError::Timeout));
			}
		}

		match worst {
			None => Ok(()),
			Some(err) => Err(Error::Transfer(err)),
		}
	}
}

/// The replication subsystem of a gateway. Created once at gateway
/// start-up and passed by reference to the filesystem layer; tearing
/// down the background runner shuts both engines down.
pub struct ReplicationManager {
	pub core: Arc<GatewayCore>,
	replication: Arc<TransferEngine>,
	garbage_collector: Arc<TransferEngine>,
}

impl ReplicationManager {
	pub fn new(core: Arc<GatewayCore>) -> Result<Arc<Self>, Error> {
		let metrics = Arc::new(ReplicationMetrics::new());
		let replication =
			TransferEngine::new("replication", TransferOp::Post, core.clone(), metrics.clone())?;
		let garbage_collector = TransferEngine::new(
			"garbage_collector",
			TransferOp::Delete,
			core.clone(),
			metrics,
		)?;

		Ok(Arc::new(Self {
			core,
			replication,
			garbage_collector,
		}))
	}

	/// Spawn the two transfer workers
	pub fn spawn_workers(self: &Arc<Self>, bg: &BackgroundRunner) {
		bg.spawn_worker(TransferWorker::new(self.replication.clone()));
		bg.spawn_worker(TransferWorker::new(self.garbage_collector.clone()));
	}

	/// Replicate the manifest of an entry to all replica gateways. The
	/// entry view must come from under the entry's read lock. When
	/// `sync`, waits up to the configured transfer timeout; otherwise
	/// the context is parked on `fh` for a later wait_all, if given.
	pub async fn replicate_manifest(
		&self,
		fent: &FsEntry,
		sync: bool,
		fh: Option<&FileHandle>,
	) -> Result<(), Error> {
		let ctx = ReplicaContext::new_manifest(&self.core, fent, sync).await?;
		self.replication.begin(&ctx).await?;

		if sync {
			self.replication
				.wait_and_free(vec![ctx], self.core.transfer_timeout())
				.await
		} else {
			if let Some(fh) = fh {
				fh.push(ctx).await;
			}
			Ok(())
		}
	}

	/// Replicate a batch of modified blocks. Contexts that fail to
	/// build or to begin are logged and skipped; only successfully
	/// submitted ones are waited on.
	pub async fn replicate_blocks(
		&self,
		fent: &FsEntry,
		modified_blocks: &BTreeMap<u64, BlockInfo>,
		sync: bool,
		fh: Option<&FileHandle>,
	) -> Result<(), Error> {
		let mut contexts = Vec::with_capacity(modified_blocks.len());
		for (block_id, block_info) in modified_blocks.iter() {
			let ctx =
				match ReplicaContext::new_block(&self.core, fent, *block_id, block_info, sync)
					.await
				{
					Ok(ctx) => ctx,
					Err(e) => {
						error!(
							"Could not build replica context for block {} of {:X}: {}",
							block_id, fent.file_id, e
						);
						continue;
					}
				};

			if let Err(e) = self.replication.begin(&ctx).await {
				error!(
					"Could not submit block {} of {:X} for replication: {}",
					block_id, fent.file_id, e
				);
				continue;
			}
			contexts.push(ctx);
		}

		if sync {
			self.replication
				.wait_and_free(contexts, self.core.transfer_timeout())
				.await
		} else {
			if let Some(fh) = fh {
				for ctx in contexts {
					fh.push(ctx).await;
				}
			}
			Ok(())
		}
	}

	/// Delete a replicated manifest version from all replica gateways,
	/// preempting any in-flight replication of that same version.
	/// Fire-and-forget: the worker frees the context once processed.
	pub async fn gc_manifest(&self, snapshot: ReplicaSnapshot) -> Result<(), Error> {
		self.replication.cancel_matching(&snapshot).await;

		let ctx = ReplicaContext::new_gc_manifest(&self.core, snapshot)?;
		self.garbage_collector.begin(&ctx).await
	}

	/// Delete a batch of replicated block versions, preempting their
	/// replication. The base snapshot is rebased on each block.
	pub async fn gc_blocks(
		&self,
		base: ReplicaSnapshot,
		modified_blocks: &BTreeMap<u64, BlockInfo>,
	) -> Result<(), Error> {
		let mut ret = Ok(());
		for (block_id, block_info) in modified_blocks.iter() {
			let snapshot = base.with_block(*block_id, block_info.version);
			self.replication.cancel_matching(&snapshot).await;

			let ctx = ReplicaContext::new_gc_block(&self.core, snapshot)?;
			if let Err(e) = self.garbage_collector.begin(&ctx).await {
				error!(
					"Could not submit block {} of {:X} for garbage collection: {}",
					block_id, base.file_id, e
				);
				ret = Err(e);
			}
		}
		ret
	}

	/// Wait for asynchronously submitted replications, applying the
	/// configured transfer timeout, and release their contexts
	pub async fn wait_and_free(&self, contexts: Vec<Arc<ReplicaContext>>) -> Result<(), Error> {
		self.replication
			.wait_and_free(contexts, self.core.transfer_timeout())
			.await
	}

	/// Same, with an explicit per-operation timeout (file-handle path)
	pub(crate) async fn wait_contexts(
		&self,
		contexts: Vec<Arc<ReplicaContext>>,
		timeout: Option<Duration>,
	) -> Result<(), Error> {
		self.replication.wait_and_free(contexts, timeout).await
	}
}
