//! Collaborator interfaces of the replication subsystem. The metadata
//! service directory, manifest serialization and local block storage
//! are implemented elsewhere in the gateway; the engines only consume
//! the traits below, bundled into a [`GatewayCore`].

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::fs;

use hangar_util::config::Config;

use hangar_proto::Signer;

use crate::error::Error;

/// Identifier of a replica gateway within the volume
pub type RgId = u64;

/// Immutable view of a filesystem entry, captured by the filesystem
/// layer under the entry's read lock
#[derive(Debug, Clone)]
pub struct FsEntry {
	pub file_id: u64,
	pub version: i64,
	pub mtime_sec: i64,
	pub mtime_nsec: i32,
	pub owner: u64,
	pub volume: u64,
	/// Whether this gateway hosts the entry canonically; when it does
	/// not, freshly written blocks live in staging storage instead
	pub local: bool,
}

/// What the filesystem layer knows about one modified block
#[derive(Debug, Clone)]
pub struct BlockInfo {
	pub version: i64,
	/// SHA-256 of the block contents, computed at write time
	pub hash: Vec<u8>,
}

/// Directory of the replica gateways of a volume, kept up to date
/// against the metadata service
#[async_trait]
pub trait MsDirectory: Send + Sync {
	/// Identifiers of all replica gateways currently registered
	async fn replica_gateways(&self) -> Result<Vec<RgId>, Error>;

	/// Content endpoint of one replica gateway
	fn content_url(&self, rg: RgId) -> String;
}

/// Serializer for the manifest of a filesystem entry
pub trait ManifestCodec: Send + Sync {
	fn serialize(&self, fent: &FsEntry) -> Result<Bytes, Error>;
}

/// Access to locally stored block files
#[async_trait]
pub trait BlockStore: Send + Sync {
	/// Open a block file for reading and return it together with its
	/// size as found on disk. `staging` selects the staging area used
	/// for entries this gateway does not host canonically.
	async fn open(
		&self,
		file_id: u64,
		file_version: i64,
		block_id: u64,
		block_version: i64,
		staging: bool,
	) -> Result<(fs::File, u64), Error>;
}

/// Everything the replication engines need to know about the gateway
/// they run in
pub struct GatewayCore {
	pub config: Config,
	pub ms: Arc<dyn MsDirectory>,
	pub signer: Arc<dyn Signer>,
	pub manifests: Arc<dyn ManifestCodec>,
	pub blocks: Arc<dyn BlockStore>,
}

impl GatewayCore {
	/// Deadline applied to synchronous waits; None when the configured
	/// transfer_timeout is 0 (wait forever)
	pub fn transfer_timeout(&self) -> Option<Duration> {
		match self.config.transfer_timeout {
			0 => None,
			secs => Some(Duration::from_secs(secs)),
		}
	}

	pub fn connect_timeout(&self) -> Duration {
		Duration::from_secs(self.config.replica_connect_timeout)
	}
}
