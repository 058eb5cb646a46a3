use std::collections::BTreeMap;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use bytes::Bytes;
use hyper::service::{make_service_fn, service_fn};
use hyper::{Body, Request, Response, Server, StatusCode};
use tokio::sync::watch;

use hangar_util::background::BackgroundRunner;
use hangar_util::config::Config;
use hangar_util::data::sha256sum;

use hangar_proto::{verify_request, GatewayRequestInfo, SecretKeySigner};
use prost::Message;

use hangar_replication::entry::{
	BlockInfo, BlockStore, FsEntry, GatewayCore, ManifestCodec, MsDirectory, RgId,
};
use hangar_replication::error::{Error, TransferError};
use hangar_replication::{FileHandle, ReplicaSnapshot, ReplicationManager};

const MANIFEST_BYTES: &[u8] = b"manifest: blocks=[3:v1], version=1";

// ---- stub replica gateway ----

struct RgStats {
	posts: AtomicUsize,
	deletes: AtomicUsize,
}

/// Spawn an HTTP server standing in for one replica gateway. It counts
/// POSTs and DELETEs, swallows the multipart body, optionally stalls,
/// then answers with the given status.
async fn spawn_rg(status: StatusCode, delay: Option<Duration>) -> (String, Arc<RgStats>) {
	let stats = Arc::new(RgStats {
		posts: AtomicUsize::new(0),
		deletes: AtomicUsize::new(0),
	});
	let stats2 = stats.clone();

	let make_svc = make_service_fn(move |_conn| {
		let stats = stats2.clone();
		async move {
			Ok::<_, Infallible>(service_fn(move |req: Request<Body>| {
				let stats = stats.clone();
				async move {
					if *req.method() == hyper::Method::POST {
						stats.posts.fetch_add(1, Ordering::SeqCst);
					} else if *req.method() == hyper::Method::DELETE {
						stats.deletes.fetch_add(1, Ordering::SeqCst);
					}
					let _ = hyper::body::to_bytes(req.into_body()).await;
					if let Some(delay) = delay {
						tokio::time::sleep(delay).await;
					}
					Ok::<_, Infallible>(
						Response::builder().status(status).body(Body::empty()).unwrap(),
					)
				}
			}))
		}
	});

	let server = Server::bind(&SocketAddr::from(([127, 0, 0, 1], 0))).serve(make_svc);
	let url = format!("http://{}/", server.local_addr());
	tokio::spawn(server);
	(url, stats)
}

// ---- collaborator stubs ----

struct StaticDirectory {
	urls: Vec<String>,
}

#[async_trait]
impl MsDirectory for StaticDirectory {
	async fn replica_gateways(&self) -> Result<Vec<RgId>, Error> {
		Ok((0..self.urls.len() as u64).collect())
	}

	fn content_url(&self, rg: RgId) -> String {
		self.urls[rg as usize].clone()
	}
}

struct FixedManifest(Bytes);

impl ManifestCodec for FixedManifest {
	fn serialize(&self, _fent: &FsEntry) -> Result<Bytes, Error> {
		Ok(self.0.clone())
	}
}

struct DirBlockStore {
	root: PathBuf,
}

#[async_trait]
impl BlockStore for DirBlockStore {
	async fn open(
		&self,
		file_id: u64,
		file_version: i64,
		block_id: u64,
		block_version: i64,
		_staging: bool,
	) -> Result<(tokio::fs::File, u64), Error> {
		let path = self
			.root
			.join(format!("{:x}.{}.{}.{}", file_id, file_version, block_id, block_version));
		let file = tokio::fs::File::open(&path).await?;
		let len = file.metadata().await?.len();
		Ok((file, len))
	}
}

// ---- fixture ----

struct TestGateway {
	manager: Arc<ReplicationManager>,
	stop_tx: watch::Sender<bool>,
	runner_handle: tokio::task::JoinHandle<()>,
	block_dir: PathBuf,
	_tmp: mktemp::Temp,
}

async fn gateway(urls: Vec<String>, transfer_timeout: u64) -> TestGateway {
	let tmp = mktemp::Temp::new_dir().unwrap();
	let block_dir = tmp.as_ref().to_path_buf();

	let core = Arc::new(GatewayCore {
		config: Config {
			metadata_dir: block_dir.join("meta"),
			data_dir: block_dir.clone(),
			block_size: 1024,
			ms_url: "http://ms.invalid".into(),
			gateway_id: 5,
			volume_id: 7,
			transfer_timeout,
			replica_connect_timeout: 5,
		},
		ms: Arc::new(StaticDirectory { urls }),
		signer: Arc::new(SecretKeySigner::generate().unwrap()),
		manifests: Arc::new(FixedManifest(Bytes::from_static(MANIFEST_BYTES))),
		blocks: Arc::new(DirBlockStore {
			root: block_dir.clone(),
		}),
	});

	let (stop_tx, stop_rx) = watch::channel(false);
	let (bg, runner_handle) = BackgroundRunner::new(stop_rx);

	let manager = ReplicationManager::new(core).unwrap();
	manager.spawn_workers(&bg);

	TestGateway {
		manager,
		stop_tx,
		runner_handle,
		block_dir,
		_tmp: tmp,
	}
}

fn test_entry() -> FsEntry {
	FsEntry {
		file_id: 0xAB,
		version: 1,
		mtime_sec: 100,
		mtime_nsec: 0,
		owner: 9,
		volume: 7,
		local: true,
	}
}

async fn write_block(
	dir: &Path,
	file_id: u64,
	file_version: i64,
	block_id: u64,
	block_version: i64,
	data: &[u8],
) {
	let path = dir.join(format!("{:x}.{}.{}.{}", file_id, file_version, block_id, block_version));
	tokio::fs::write(&path, data).await.unwrap();
}

async fn wait_until(deadline: Duration, mut cond: impl FnMut() -> bool) -> bool {
	let t0 = Instant::now();
	while t0.elapsed() < deadline {
		if cond() {
			return true;
		}
		tokio::time::sleep(Duration::from_millis(20)).await;
	}
	cond()
}

// ---- scenarios ----

#[tokio::test]
async fn test_replicate_manifest_to_all_gateways() {
	let (rg1, s1) = spawn_rg(StatusCode::OK, None).await;
	let (rg2, s2) = spawn_rg(StatusCode::OK, None).await;
	let gw = gateway(vec![rg1, rg2], 30).await;

	gw.manager
		.replicate_manifest(&test_entry(), true, None)
		.await
		.unwrap();

	assert_eq!(s1.posts.load(Ordering::SeqCst), 1);
	assert_eq!(s2.posts.load(Ordering::SeqCst), 1);

	gw.stop_tx.send(true).ok();
}

#[tokio::test]
async fn test_manifest_envelope_is_signed() {
	let (rg1, _s1) = spawn_rg(StatusCode::OK, None).await;
	let gw = gateway(vec![rg1], 30).await;

	let fh = FileHandle::new(None);
	gw.manager
		.replicate_manifest(&test_entry(), false, Some(&fh))
		.await
		.unwrap();
	let ctx = &fh.pending_contexts().await[0];

	let info = GatewayRequestInfo::decode(ctx.envelope_bytes()).unwrap();
	assert_eq!(info.file_id, 0xAB);
	assert_eq!(info.file_version, 1);
	assert_eq!(info.volume, 7);
	assert_eq!(info.writer, 5);
	assert_eq!(info.owner, 9);
	assert_eq!(info.size, MANIFEST_BYTES.len() as u64);
	assert_eq!(info.blocking_factor, 1024);
	verify_request(gw.manager.core.signer.as_ref(), &info).unwrap();

	fh.wait_all(&gw.manager).await.unwrap();
	gw.stop_tx.send(true).ok();
}

#[tokio::test]
async fn test_resubmission_fans_out_independently() {
	let (rg1, s1) = spawn_rg(StatusCode::OK, None).await;
	let (rg2, s2) = spawn_rg(StatusCode::OK, None).await;
	let gw = gateway(vec![rg1, rg2], 30).await;

	let fent = test_entry();
	gw.manager.replicate_manifest(&fent, true, None).await.unwrap();
	gw.manager.replicate_manifest(&fent, true, None).await.unwrap();

	assert_eq!(s1.posts.load(Ordering::SeqCst), 2);
	assert_eq!(s2.posts.load(Ordering::SeqCst), 2);

	gw.stop_tx.send(true).ok();
}

#[tokio::test]
async fn test_replicate_blocks() {
	let (rg1, s1) = spawn_rg(StatusCode::OK, None).await;
	let (rg2, s2) = spawn_rg(StatusCode::OK, None).await;
	let gw = gateway(vec![rg1, rg2], 30).await;

	let fent = test_entry();
	write_block(&gw.block_dir, fent.file_id, fent.version, 3, 1, b"first block").await;
	write_block(&gw.block_dir, fent.file_id, fent.version, 4, 1, b"second block").await;

	let mut modified = BTreeMap::new();
	modified.insert(
		3u64,
		BlockInfo {
			version: 1,
			hash: sha256sum(b"first block").to_vec(),
		},
	);
	modified.insert(
		4u64,
		BlockInfo {
			version: 1,
			hash: sha256sum(b"second block").to_vec(),
		},
	);

	gw.manager
		.replicate_blocks(&fent, &modified, true, None)
		.await
		.unwrap();

	// each block fans out to both gateways
	assert_eq!(s1.posts.load(Ordering::SeqCst), 2);
	assert_eq!(s2.posts.load(Ordering::SeqCst), 2);

	gw.stop_tx.send(true).ok();
}

#[tokio::test]
async fn test_partial_failure_reports_worst_error() {
	let (rg1, s1) = spawn_rg(StatusCode::OK, None).await;
	let (rg2, s2) = spawn_rg(StatusCode::FORBIDDEN, None).await;
	let gw = gateway(vec![rg1, rg2], 30).await;

	let err = gw
		.manager
		.replicate_manifest(&test_entry(), true, None)
		.await
		.unwrap_err();
	assert!(matches!(
		err,
		Error::Transfer(TransferError::PermissionDenied)
	));

	// both legs ran to completion before the wait returned
	assert_eq!(s1.posts.load(Ordering::SeqCst), 1);
	assert_eq!(s2.posts.load(Ordering::SeqCst), 1);

	gw.stop_tx.send(true).ok();
}

#[tokio::test]
async fn test_no_replica_gateways() {
	let gw = gateway(vec![], 30).await;

	let err = gw
		.manager
		.replicate_manifest(&test_entry(), true, None)
		.await
		.unwrap_err();
	assert!(matches!(err, Error::NoReplicas));

	gw.stop_tx.send(true).ok();
}

#[tokio::test]
async fn test_sync_wait_times_out_and_worker_reaps() {
	let (rg1, _s1) = spawn_rg(StatusCode::OK, None).await;
	let (rg2, _s2) = spawn_rg(StatusCode::OK, Some(Duration::from_secs(10))).await;
	let gw = gateway(vec![rg1, rg2], 30).await;

	let fh = FileHandle::new(Some(Duration::from_secs(1)));
	gw.manager
		.replicate_manifest(&test_entry(), false, Some(&fh))
		.await
		.unwrap();
	let ctxs = fh.pending_contexts().await;
	assert_eq!(ctxs.len(), 1);

	let t0 = Instant::now();
	let err = fh.wait_all(&gw.manager).await.unwrap_err();
	let elapsed = t0.elapsed();

	assert!(matches!(err, Error::Transfer(TransferError::Timeout)));
	assert!(elapsed >= Duration::from_millis(900), "{:?}", elapsed);
	assert!(elapsed <= Duration::from_millis(2000), "{:?}", elapsed);

	// the stalled leg is expired by the worker, not by the waiter
	let ctx = ctxs[0].clone();
	assert!(wait_until(Duration::from_secs(2), move || ctx.is_processed()).await);
	assert_eq!(ctxs[0].error().await, Some(TransferError::Timeout));

	gw.stop_tx.send(true).ok();
}

#[tokio::test]
async fn test_gc_preempts_replication() {
	let (rg1, s1) = spawn_rg(StatusCode::OK, Some(Duration::from_millis(500))).await;
	let (rg2, s2) = spawn_rg(StatusCode::OK, Some(Duration::from_millis(500))).await;
	let gw = gateway(vec![rg1, rg2], 30).await;

	let fh = FileHandle::new(None);
	gw.manager
		.replicate_manifest(&test_entry(), false, Some(&fh))
		.await
		.unwrap();
	let ctxs = fh.pending_contexts().await;
	let snapshot = ctxs[0].snapshot;

	gw.manager.gc_manifest(snapshot).await.unwrap();

	// the delete reaches both gateways
	assert!(
		wait_until(Duration::from_secs(5), || {
			s1.deletes.load(Ordering::SeqCst) == 1 && s2.deletes.load(Ordering::SeqCst) == 1
		})
		.await
	);

	// the replication context was preempted: its waiter is released
	// with a cancellation instead of blocking on the stalled POSTs
	let err = fh.wait_all(&gw.manager).await.unwrap_err();
	assert!(matches!(err, Error::Transfer(TransferError::Cancelled)));
	assert!(ctxs[0].is_processed());

	gw.stop_tx.send(true).ok();
}

#[tokio::test]
async fn test_gc_blocks_sends_deletes() {
	let (rg1, s1) = spawn_rg(StatusCode::OK, None).await;
	let (rg2, s2) = spawn_rg(StatusCode::OK, None).await;
	let gw = gateway(vec![rg1, rg2], 30).await;

	let base = ReplicaSnapshot {
		volume_id: 7,
		file_id: 0xAB,
		file_version: 1,
		block_id: 0,
		block_version: 0,
		mtime_sec: 100,
		mtime_nsec: 0,
		writer_id: 5,
		owner_id: 9,
	};
	let mut modified = BTreeMap::new();
	modified.insert(3u64, BlockInfo { version: 1, hash: vec![] });
	modified.insert(4u64, BlockInfo { version: 2, hash: vec![] });

	gw.manager.gc_blocks(base, &modified).await.unwrap();

	assert!(
		wait_until(Duration::from_secs(5), || {
			s1.deletes.load(Ordering::SeqCst) == 2 && s2.deletes.load(Ordering::SeqCst) == 2
		})
		.await
	);

	gw.stop_tx.send(true).ok();
}

#[tokio::test]
async fn test_shutdown_with_inflight_transfers() {
	let (rg1, _s1) = spawn_rg(StatusCode::OK, Some(Duration::from_secs(30))).await;
	let (rg2, _s2) = spawn_rg(StatusCode::OK, Some(Duration::from_secs(30))).await;
	let gw = gateway(vec![rg1, rg2], 30).await;

	let fh = FileHandle::new(None);
	for _ in 0..10 {
		gw.manager
			.replicate_manifest(&test_entry(), false, Some(&fh))
			.await
			.unwrap();
	}
	let ctxs = fh.pending_contexts().await;
	assert_eq!(ctxs.len(), 10);

	// let the worker promote the legs, then pull the plug
	tokio::time::sleep(Duration::from_millis(200)).await;
	gw.stop_tx.send(true).unwrap();

	let all_processed = {
		let ctxs = ctxs.clone();
		wait_until(Duration::from_secs(1), move || {
			ctxs.iter().all(|ctx| ctx.is_processed())
		})
	};
	assert!(all_processed.await);

	// and the runner itself winds down
	tokio::time::timeout(Duration::from_secs(5), gw.runner_handle)
		.await
		.unwrap()
		.unwrap();
}
