//! One logical transfer: an artifact (manifest or block) fanned out to
//! every replica gateway of the volume, with its completion bookkeeping

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use base64::prelude::*;
use bytes::Bytes;
use prost::Message;
use reqwest::multipart;
use tokio::io::AsyncReadExt;
use tokio::sync::{Mutex, Semaphore};

use hangar_util::data::sha256sum;
use hangar_util::error::OkOrMessage;

use hangar_proto::{gc_hash_padding, sign_request, ArtifactType, GatewayRequestInfo};

use crate::entry::{BlockInfo, FsEntry, GatewayCore};
use crate::error::{Error, TransferError};
use crate::sets::HandleId;

/// Identifies one specific version of one artifact. Snapshot equality
/// is the cancellation predicate: garbage collection of an obsolete
/// version must never cancel a transfer of a newer version of the same
/// file that was started after the snapshot was taken.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ReplicaSnapshot {
	pub volume_id: u64,
	pub file_id: u64,
	pub file_version: i64,
	pub block_id: u64,
	pub block_version: i64,
	pub mtime_sec: i64,
	pub mtime_nsec: i32,
	pub writer_id: u64,
	pub owner_id: u64,
}

impl ReplicaSnapshot {
	/// Snapshot of an entry's manifest
	pub fn manifest_of(core: &GatewayCore, fent: &FsEntry) -> Self {
		Self {
			volume_id: fent.volume,
			file_id: fent.file_id,
			file_version: fent.version,
			block_id: 0,
			block_version: 0,
			mtime_sec: fent.mtime_sec,
			mtime_nsec: fent.mtime_nsec,
			writer_id: core.config.gateway_id,
			owner_id: fent.owner,
		}
	}

	/// Snapshot of one block of an entry
	pub fn block_of(core: &GatewayCore, fent: &FsEntry, block_id: u64, block_version: i64) -> Self {
		Self {
			block_id,
			block_version,
			..Self::manifest_of(core, fent)
		}
	}

	/// The same artifact version rebased on another block; gc_blocks
	/// derives per-block snapshots from a base snapshot this way
	pub fn with_block(&self, block_id: u64, block_version: i64) -> Self {
		Self {
			block_id,
			block_version,
			..*self
		}
	}

	fn request_info(
		&self,
		kind: ArtifactType,
		blocking_factor: u64,
		size: u64,
		hash: String,
	) -> GatewayRequestInfo {
		GatewayRequestInfo {
			kind: kind as i32,
			file_id: self.file_id,
			file_version: self.file_version,
			block_id: self.block_id,
			block_version: self.block_version,
			blocking_factor,
			size,
			file_mtime_sec: self.mtime_sec,
			file_mtime_nsec: self.mtime_nsec,
			owner: self.owner_id,
			writer: self.writer_id,
			volume: self.volume_id,
			hash,
			signature: String::new(),
		}
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArtifactKind {
	Manifest,
	Block,
}

/// HTTP method of an engine: replication POSTs, garbage collection
/// DELETEs (method override, the form still rides in the body)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferOp {
	Post,
	Delete,
}

impl TransferOp {
	pub(crate) fn method(self) -> reqwest::Method {
		match self {
			TransferOp::Post => reqwest::Method::POST,
			TransferOp::Delete => reqwest::Method::DELETE,
		}
	}
}

/// Payload of a transfer; garbage-collection requests carry none
pub enum ArtifactPayload {
	Manifest {
		bytes: Bytes,
	},
	/// Block contents, buffered at submission so that every fan-out leg
	/// can stream an independent copy; len is the size found by stat
	Block {
		bytes: Bytes,
		len: u64,
	},
}

/// One logical transfer with its fan-out bookkeeping. Shared between
/// the submitter, the worker, and (for synchronous transfers) a waiter;
/// dropping the last reference frees payload and form data, so a leg
/// still being serviced by the transport keeps the payload alive.
pub struct ReplicaContext {
	pub snapshot: ReplicaSnapshot,
	pub kind: ArtifactKind,
	pub op: TransferOp,

	payload: Option<ArtifactPayload>,
	/// Signed, serialized envelope: the "metadata" part of each form
	metadata: Bytes,
	/// Payload size in bytes (0 for garbage collection)
	pub size: u64,

	pub sync: bool,
	/// Nobody waits on this context: the worker drops the last
	/// reference as soon as all legs are reaped
	pub free_on_processed: bool,

	/// Handles of this context's legs, pending or active
	handles: Mutex<Vec<HandleId>>,
	/// Worst verdict observed across legs
	error: Mutex<Option<TransferError>>,

	/// Binary semaphore: taken for the whole duration of the fan-out,
	/// released exactly once when the last leg has been reaped
	processing: Semaphore,
	processed: AtomicBool,
}

impl ReplicaContext {
	#[allow(clippy::too_many_arguments)]
	fn make(
		snapshot: ReplicaSnapshot,
		kind: ArtifactKind,
		op: TransferOp,
		payload: Option<ArtifactPayload>,
		metadata: Bytes,
		size: u64,
		sync: bool,
		free_on_processed: bool,
	) -> Arc<Self> {
		Arc::new(Self {
			snapshot,
			kind,
			op,
			payload,
			metadata,
			size,
			sync,
			free_on_processed,
			handles: Mutex::new(Vec::new()),
			error: Mutex::new(None),
			processing: Semaphore::new(1),
			processed: AtomicBool::new(false),
		})
	}

	/// Build a manifest replication context. The entry view must have
	/// been captured under the entry's read lock.
	pub async fn new_manifest(
		core: &GatewayCore,
		fent: &FsEntry,
		sync: bool,
	) -> Result<Arc<Self>, Error> {
		let manifest = core.manifests.serialize(fent)?;
		let size = manifest.len() as u64;
		let hash = BASE64_STANDARD.encode(sha256sum(&manifest).as_slice());

		let snapshot = ReplicaSnapshot::manifest_of(core, fent);
		let metadata = sign_envelope(
			core,
			snapshot.request_info(
				ArtifactType::Manifest,
				core.config.block_size as u64,
				size,
				hash,
			),
		)?;

		Ok(Self::make(
			snapshot,
			ArtifactKind::Manifest,
			TransferOp::Post,
			Some(ArtifactPayload::Manifest { bytes: manifest }),
			metadata,
			size,
			sync,
			false,
		))
	}

	/// Build a block replication context: opens the local block file
	/// (staging or canonical storage depending on where the entry is
	/// hosted), stats it for its size, and buffers its contents
	pub async fn new_block(
		core: &GatewayCore,
		fent: &FsEntry,
		block_id: u64,
		block_info: &BlockInfo,
		sync: bool,
	) -> Result<Arc<Self>, Error> {
		let staging = !fent.local;
		let (mut file, len) = core
			.blocks
			.open(fent.file_id, fent.version, block_id, block_info.version, staging)
			.await?;

		let mut data = Vec::with_capacity(len as usize);
		file.read_to_end(&mut data).await?;
		drop(file);

		let hash = BASE64_STANDARD.encode(&block_info.hash);
		let snapshot = ReplicaSnapshot::block_of(core, fent, block_id, block_info.version);
		let metadata = sign_envelope(
			core,
			snapshot.request_info(ArtifactType::Block, core.config.block_size as u64, len, hash),
		)?;

		Ok(Self::make(
			snapshot,
			ArtifactKind::Block,
			TransferOp::Post,
			Some(ArtifactPayload::Block {
				bytes: Bytes::from(data),
				len,
			}),
			metadata,
			len,
			sync,
			false,
		))
	}

	/// Build a manifest delete context for the garbage collector:
	/// fire-and-forget, freed by the worker once processed
	pub fn new_gc_manifest(core: &GatewayCore, snapshot: ReplicaSnapshot) -> Result<Arc<Self>, Error> {
		let metadata = sign_envelope(
			core,
			snapshot.request_info(
				ArtifactType::Manifest,
				core.config.block_size as u64,
				0,
				gc_hash_padding(),
			),
		)?;

		Ok(Self::make(
			snapshot,
			ArtifactKind::Manifest,
			TransferOp::Delete,
			None,
			metadata,
			0,
			false,
			true,
		))
	}

	/// Build a block delete context for the garbage collector
	pub fn new_gc_block(core: &GatewayCore, snapshot: ReplicaSnapshot) -> Result<Arc<Self>, Error> {
		let metadata = sign_envelope(
			core,
			snapshot.request_info(
				ArtifactType::Block,
				core.config.block_size as u64,
				0,
				gc_hash_padding(),
			),
		)?;

		Ok(Self::make(
			snapshot,
			ArtifactKind::Block,
			TransferOp::Delete,
			None,
			metadata,
			0,
			false,
			true,
		))
	}

	/// Assemble the multipart form for one fan-out leg. Forms cannot be
	/// shared between requests, so each leg gets its own; payload bytes
	/// are shared zero-copy between them.
	pub(crate) fn form(&self) -> Result<multipart::Form, Error> {
		let metadata = multipart::Part::bytes(self.metadata.to_vec())
			.mime_str("application/octet-stream")?;
		let mut form = multipart::Form::new().part("metadata", metadata);

		match &self.payload {
			Some(ArtifactPayload::Manifest { bytes }) => {
				let data = multipart::Part::stream_with_length(
					reqwest::Body::from(bytes.clone()),
					bytes.len() as u64,
				)
				.mime_str("application/octet-stream")?;
				form = form.part("data", data);
			}
			Some(ArtifactPayload::Block { bytes, len }) => {
				// the filename marks this part as a file upload
				let data = multipart::Part::stream_with_length(
					reqwest::Body::from(bytes.clone()),
					*len,
				)
				.file_name("block")
				.mime_str("application/octet-stream")?;
				form = form.part("data", data);
			}
			None => (),
		}

		Ok(form)
	}

	/// The signed envelope bytes sent as the "metadata" form part
	pub fn envelope_bytes(&self) -> Bytes {
		self.metadata.clone()
	}

	/// Take the processing semaphore for the duration of the fan-out
	pub(crate) fn claim_processing(&self) -> Result<(), Error> {
		let permit = self
			.processing
			.try_acquire()
			.ok_or_message("Replica context was submitted twice")?;
		permit.forget();
		Ok(())
	}

	/// Record a leg failure; the worst verdict wins
	pub(crate) async fn record_error(&self, err: TransferError) {
		let mut error = self.error.lock().await;
		*error = Some(TransferError::worst(*error, err));
	}

	/// Worst verdict observed so far, None if every reaped leg succeeded
	pub async fn error(&self) -> Option<TransferError> {
		*self.error.lock().await
	}

	/// Register the fan-out legs, all at once, before the worker can
	/// see any of them
	pub(crate) async fn attach_handles(&self, new: &[HandleId]) {
		self.handles.lock().await.extend_from_slice(new);
	}

	/// Remove one reaped leg; returns how many are left
	pub(crate) async fn detach_handle(&self, handle: HandleId) -> usize {
		let mut handles = self.handles.lock().await;
		handles.retain(|h| *h != handle);
		handles.len()
	}

	pub(crate) async fn handles(&self) -> Vec<HandleId> {
		self.handles.lock().await.clone()
	}

	/// Release the processing semaphore. At most once per context: the
	/// first caller wins, later calls are no-ops.
	pub(crate) fn mark_processed(&self) -> bool {
		if self.processed.swap(true, Ordering::SeqCst) {
			return false;
		}
		self.processing.add_permits(1);
		true
	}

	/// Whether all legs have been reaped and the context is finished
	pub fn is_processed(&self) -> bool {
		self.processed.load(Ordering::SeqCst)
	}

	/// Block until the context is finished. Callers that give up early
	/// must hand the context's legs to the expire queue instead of
	/// tearing anything down themselves: teardown belongs to the worker.
	pub(crate) async fn acquire_processed(&self) {
		// the semaphore is never closed
		if let Ok(permit) = self.processing.acquire().await {
			drop(permit);
		}
	}
}

fn sign_envelope(core: &GatewayCore, mut info: GatewayRequestInfo) -> Result<Bytes, Error> {
	sign_request(core.signer.as_ref(), &mut info)?;
	Ok(Bytes::from(info.encode_to_vec()))
}

#[cfg(test)]
mod tests {
	use super::*;

	fn snapshot() -> ReplicaSnapshot {
		ReplicaSnapshot {
			volume_id: 7,
			file_id: 0xAB,
			file_version: 1,
			block_id: 3,
			block_version: 1,
			mtime_sec: 100,
			mtime_nsec: 0,
			writer_id: 5,
			owner_id: 9,
		}
	}

	#[test]
	fn test_snapshot_equality_is_exact() {
		let base = snapshot();
		assert_eq!(base, snapshot());

		// any differing field makes the cancellation predicate miss
		let newer = ReplicaSnapshot {
			file_version: 2,
			..base
		};
		assert_ne!(base, newer);

		let touched = ReplicaSnapshot {
			mtime_nsec: 1,
			..base
		};
		assert_ne!(base, touched);
	}

	#[test]
	fn test_with_block_rebases_only_the_block() {
		let base = snapshot();
		let other = base.with_block(4, 2);
		assert_eq!(other.block_id, 4);
		assert_eq!(other.block_version, 2);
		assert_eq!(other.file_id, base.file_id);
		assert_eq!(other.file_version, base.file_version);
		assert_eq!(other.mtime_sec, base.mtime_sec);
	}

	#[test]
	fn test_request_info_carries_all_snapshot_fields() {
		let info = snapshot().request_info(ArtifactType::Block, 1024, 42, "aGFzaA==".into());
		assert_eq!(info.kind, ArtifactType::Block as i32);
		assert_eq!(info.file_id, 0xAB);
		assert_eq!(info.file_version, 1);
		assert_eq!(info.block_id, 3);
		assert_eq!(info.block_version, 1);
		assert_eq!(info.blocking_factor, 1024);
		assert_eq!(info.size, 42);
		assert_eq!(info.file_mtime_sec, 100);
		assert_eq!(info.file_mtime_nsec, 0);
		assert_eq!(info.owner, 9);
		assert_eq!(info.writer, 5);
		assert_eq!(info.volume, 7);
		assert_eq!(info.hash, "aGFzaA==");
		assert!(info.signature.is_empty());
	}
}
