use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use log::{debug, error, info, warn};
use tokio::io::AsyncWriteExt;
use tokio::sync::{watch, Notify, RwLock};
use tokio::time::MissedTickBehavior;

use crate::common::{Fingerprint, RejectedCamera};
use crate::error::{SyncError, SyncResult};
use crate::registry::CameraSource;
use crate::reload::Reloader;
use crate::render::{render, serialize, RenderSettings};



#[derive(Clone, Copy)]
#[derive(Debug, Default, PartialEq)]
#[derive(Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LoopState {
	#[default]
	Idle,
	Reconciling,
}

#[derive(Clone, Copy)]
#[derive(Debug, PartialEq)]
#[derive(Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CycleOutcome {
	/// Rendered configuration matches what is live and already signalled.
	Unchanged,
	/// A new file was written and the media server told to reload.
	Applied,
	/// File was already current; an earlier failed reload signal got through this time.
	ReloadDelivered,
	RegistryFailed,
	RenderFailed,
	WriteFailed,
	ReloadFailed,
}

impl CycleOutcome {
	fn of_error(err: &SyncError) -> CycleOutcome {
		match err {
			SyncError::RegistryUnavailable(_) | SyncError::RegistryMalformedResponse(_) => CycleOutcome::RegistryFailed,
			// `render` turns per-camera errors into `rejected` entries, so only serialization
			// failures reach here from the render stage.
			SyncError::InvalidCameraDefinition { .. } | SyncError::Serialize(_) => CycleOutcome::RenderFailed,
			SyncError::ConfigWriteFailed(_) => CycleOutcome::WriteFailed,
			SyncError::ReloadSignalFailed(_) => CycleOutcome::ReloadFailed,
		}
	}
}

/// What the control API reports. Written by the loop only.
#[derive(Clone)]
#[derive(Debug, Default)]
#[derive(Serialize)]
pub struct ReconcilerStatus {
	pub state: LoopState,
	pub last_outcome: Option<CycleOutcome>,
	pub last_cycle_unix: Option<u64>,
	pub applied_fingerprint: Option<String>,
	pub signaled_fingerprint: Option<String>,
	pub camera_count: usize,
	pub path_count: usize,
	pub rejected_cameras: Vec<RejectedCamera>,
	pub consecutive_registry_failures: u32,
}

pub type SharedStatus = Arc<RwLock<ReconcilerStatus>>;

// Logs registry failures at warn on the 1st, 2nd, 4th, ... and then every 64th, debug otherwise.
#[derive(Default)]
struct FailureLog {
	consecutive: u32,
}

impl FailureLog {
	const CAP: u32 = 64;

	fn record(&mut self, err: &SyncError) {
		self.consecutive = self.consecutive.saturating_add(1);
		if Self::should_warn(self.consecutive) {
			warn!("Keeping current configuration, registry failed {} time(s) in a row: {}", self.consecutive, err);
		} else {
			debug!("Registry still failing ({} in a row): {}", self.consecutive, err);
		}
	}

	fn recovered(&mut self) {
		if self.consecutive > 0 {
			info!("Registry reachable again after {} failed cycle(s)", self.consecutive);
			self.consecutive = 0;
		}
	}

	fn should_warn(n: u32) -> bool {
		if n <= Self::CAP {
			n.is_power_of_two()
		} else {
			n % Self::CAP == 0
		}
	}
}

/// Owns the live configuration file.
///
/// Two fingerprints are tracked separately: `applied` is what is on disk, `signaled` is what the
/// media server was last successfully told to load. A reload that fails is retried on later
/// cycles even though the file itself no longer changes.
pub struct Reconciler {
	source: Box<dyn CameraSource>,
	reloader: Box<dyn Reloader>,
	render_settings: RenderSettings,
	output: PathBuf,
	write_timeout: Duration,
	applied: Option<Fingerprint>,
	signaled: Option<Fingerprint>,
	registry_failures: FailureLog,
	status: SharedStatus,
}

impl Reconciler {
	/// Seeds `applied` from the file already at `output`, if any. `signaled` is seeded too only when
	/// the media server watches the file itself; otherwise a reload that failed before a restart of
	/// this service would never be delivered, so the first cycle signals once.
	pub async fn new(
		source: Box<dyn CameraSource>,
		reloader: Box<dyn Reloader>,
		render_settings: RenderSettings,
		output: PathBuf,
		write_timeout: Duration,
	) -> Reconciler {
		let existing = match tokio::fs::read(&output).await {
			Ok(bytes) => {
				let fingerprint = Fingerprint::of(&bytes);
				info!("Found existing configuration {} at {}", fingerprint, output.display());
				Some(fingerprint)
			},
			Err(err) if err.kind() == io::ErrorKind::NotFound => {
				info!("No configuration at {} yet; will create it", output.display());
				None
			},
			Err(err) => {
				warn!("Could not read existing configuration {}; will overwrite it. Error was {}", output.display(), err);
				None
			},
		};

		let signaled = if reloader.watches_file() { existing.clone() } else { None };

		let status = ReconcilerStatus {
			applied_fingerprint: existing.as_ref().map(|f| f.as_str().to_string()),
			signaled_fingerprint: signaled.as_ref().map(|f| f.as_str().to_string()),
			..Default::default()
		};

		Reconciler {
			source,
			reloader,
			render_settings,
			output,
			write_timeout,
			applied: existing,
			signaled,
			registry_failures: FailureLog::default(),
			status: Arc::new(RwLock::new(status)),
		}
	}

	pub fn status(&self) -> SharedStatus {
		self.status.clone()
	}

	/// Runs one fetch → render → compare → apply pass and records its outcome.
	pub async fn run_cycle(&mut self) -> SyncResult<CycleOutcome> {
		self.status.write().await.state = LoopState::Reconciling;

		let result = self.reconcile().await;
		match &result {
			Ok(outcome) => debug!("Reconciliation cycle finished: {:?}", outcome),
			// Already logged with backoff.
			Err(SyncError::RegistryUnavailable(_)) | Err(SyncError::RegistryMalformedResponse(_)) => {},
			Err(err) => error!("Reconciliation cycle failed: {}", err),
		}

		let mut status = self.status.write().await;
		status.state = LoopState::Idle;
		status.last_outcome = Some(match &result {
			Ok(outcome) => *outcome,
			Err(err) => CycleOutcome::of_error(err),
		});
		status.last_cycle_unix = SystemTime::now().duration_since(UNIX_EPOCH).ok().map(|d| d.as_secs());
		status.applied_fingerprint = self.applied.as_ref().map(|f| f.as_str().to_string());
		status.signaled_fingerprint = self.signaled.as_ref().map(|f| f.as_str().to_string());
		status.consecutive_registry_failures = self.registry_failures.consecutive;
		drop(status);

		result
	}

	/// Cycles on every tick of `period` and on every `trigger` until `shutdown` flips or its
	/// sender goes away. Cycles never overlap; requests arriving during a cycle collapse into one.
	pub async fn run(mut self, period: Duration, trigger: Arc<Notify>, mut shutdown: watch::Receiver<bool>) {
		let mut ticks = tokio::time::interval(period);
		ticks.set_missed_tick_behavior(MissedTickBehavior::Skip);

		loop {
			tokio::select! {
				biased;
				_ = shutdown.changed() => break,
				_ = ticks.tick() => {},
				_ = trigger.notified() => debug!("Manual reconciliation requested"),
			}
			// Errors are logged and recorded in the status; the next tick tries again.
			let _ = self.run_cycle().await;
			if *shutdown.borrow() {
				break;
			}
		}
		info!("Reconciler stopped");
	}

	async fn reconcile(&mut self) -> SyncResult<CycleOutcome> {
		let cameras = match self.source.fetch_cameras().await {
			Ok(cameras) => {
				self.registry_failures.recovered();
				cameras
			},
			Err(err) => {
				self.registry_failures.record(&err);
				return Err(err);
			},
		};

		let config = render(&cameras, &self.render_settings);
		for rejected in &config.rejected {
			warn!("Skipping camera {}: {}", rejected.id, rejected.reason);
		}
		{
			let mut status = self.status.write().await;
			status.camera_count = config.camera_count;
			status.path_count = config.paths.len();
			status.rejected_cameras = config.rejected.clone();
		}

		let document = serialize(&config)?;
		let fingerprint = Fingerprint::of(document.as_bytes());

		let wrote = if self.applied.as_ref() != Some(&fingerprint) {
			self.write_live(document.as_bytes()).await?;
			info!(
				"Applied configuration {} to {} ({} cameras, {} paths)",
				fingerprint, self.output.display(), config.camera_count, config.paths.len()
			);
			self.applied = Some(fingerprint.clone());
			true
		} else {
			false
		};

		if !wrote && self.signaled.as_ref() == Some(&fingerprint) {
			debug!("Configuration {} unchanged", fingerprint);
			return Ok(CycleOutcome::Unchanged);
		}

		if let Err(err) = self.reloader.reload().await {
			warn!("Configuration {} is on disk but the reload signal failed; retrying next cycle", fingerprint);
			return Err(err);
		}
		info!("Media server signalled to load configuration {} via {}", fingerprint, self.reloader.describe());
		self.signaled = Some(fingerprint);

		Ok(if wrote { CycleOutcome::Applied } else { CycleOutcome::ReloadDelivered })
	}

	async fn write_live(&self, bytes: &[u8]) -> SyncResult<()> {
		match tokio::time::timeout(self.write_timeout, replace_file(&self.output, bytes)).await {
			Ok(result) => Ok(result?),
			Err(_) => Err(SyncError::ConfigWriteFailed(io::Error::new(
				io::ErrorKind::TimedOut,
				format!("writing {} took longer than {:?}", self.output.display(), self.write_timeout),
			))),
		}
	}
}

/// Replaces `path` with `bytes` via a temporary file in the same directory and a rename, so a
/// reader sees either the old document or the new one, never a mix.
pub async fn replace_file(path: &Path, bytes: &[u8]) -> io::Result<()> {
	let dir = match path.parent() {
		Some(dir) if !dir.as_os_str().is_empty() => dir,
		_ => Path::new("."),
	};
	let file_name = path.file_name()
		.ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, format!("{} has no file name", path.display())))?;

	tokio::fs::create_dir_all(dir).await?;
	let temp = dir.join(format!(".{}.{:016x}.tmp", file_name.to_string_lossy(), rand::random::<u64>()));

	let result = write_then_rename(&temp, path, bytes).await;
	if result.is_err() {
		let _ = tokio::fs::remove_file(&temp).await;
	}
	result
}

async fn write_then_rename(temp: &Path, path: &Path, bytes: &[u8]) -> io::Result<()> {
	let mut file = tokio::fs::File::create(temp).await?;
	file.write_all(bytes).await?;
	file.flush().await?;
	file.sync_all().await?;
	drop(file);
	tokio::fs::rename(temp, path).await
}



#[cfg(test)]
mod tests {
	use std::collections::VecDeque;
	use std::sync::atomic::{AtomicUsize, Ordering};
	use std::sync::Mutex;

	use super::*;
	use crate::common::{CameraDefinition, CameraList};
	use crate::render::tests::{camera, settings};

	#[derive(Clone, Default)]
	struct ScriptedSource {
		replies: Arc<Mutex<VecDeque<SyncResult<CameraList>>>>,
		fetches: Arc<AtomicUsize>,
		delay: Duration,
	}

	impl ScriptedSource {
		fn push(&self, reply: SyncResult<CameraList>) {
			self.replies.lock().unwrap().push_back(reply);
		}
	}

	#[rocket::async_trait]
	impl CameraSource for ScriptedSource {
		async fn fetch_cameras(&self) -> SyncResult<CameraList> {
			self.fetches.fetch_add(1, Ordering::SeqCst);
			if !self.delay.is_zero() {
				tokio::time::sleep(self.delay).await;
			}
			self.replies.lock().unwrap().pop_front()
				.unwrap_or_else(|| Err(SyncError::RegistryUnavailable("script exhausted".to_string())))
		}
	}

	#[derive(Clone, Default)]
	struct CountingReloader {
		attempts: Arc<AtomicUsize>,
		failures_left: Arc<AtomicUsize>,
		watches: bool,
	}

	#[rocket::async_trait]
	impl Reloader for CountingReloader {
		fn describe(&self) -> String {
			"test".to_string()
		}

		fn watches_file(&self) -> bool {
			self.watches
		}

		async fn reload(&self) -> SyncResult<()> {
			self.attempts.fetch_add(1, Ordering::SeqCst);
			let failing = self.failures_left
				.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
				.is_ok();
			if failing {
				Err(SyncError::ReloadSignalFailed("media server unreachable".to_string()))
			} else {
				Ok(())
			}
		}
	}

	fn scratch_dir() -> PathBuf {
		let dir = std::env::temp_dir().join(format!("camera-sync-test-{:016x}", rand::random::<u64>()));
		std::fs::create_dir_all(&dir).unwrap();
		dir
	}

	fn cameras() -> Vec<CameraDefinition> {
		vec![camera(1, "Front Door Camera", true), camera(2, "Parking Lot", false)]
	}

	fn expected_document(cameras: &[CameraDefinition]) -> String {
		serialize(&render(cameras, &settings())).unwrap()
	}

	async fn reconciler(output: &Path, source: &ScriptedSource, reloader: &CountingReloader) -> Reconciler {
		Reconciler::new(
			Box::new(source.clone()),
			Box::new(reloader.clone()),
			settings(),
			output.to_path_buf(),
			Duration::from_secs(5),
		).await
	}

	#[tokio::test]
	async fn first_cycle_writes_and_signals() {
		let dir = scratch_dir();
		let output = dir.join("mediamtx").join("mediamtx.yml");
		let source = ScriptedSource::default();
		let reloader = CountingReloader::default();
		source.push(Ok(cameras()));

		let mut reconciler = reconciler(&output, &source, &reloader).await;
		assert_eq!(reconciler.run_cycle().await.unwrap(), CycleOutcome::Applied);

		assert_eq!(std::fs::read_to_string(&output).unwrap(), expected_document(&cameras()));
		assert_eq!(reloader.attempts.load(Ordering::SeqCst), 1);
		// Only the live file remains; the temporary was renamed away.
		assert_eq!(std::fs::read_dir(output.parent().unwrap()).unwrap().count(), 1);

		let status = reconciler.status().read().await.clone();
		assert_eq!(status.state, LoopState::Idle);
		assert_eq!(status.camera_count, 2);
		assert_eq!(status.path_count, 4);
		assert_eq!(status.applied_fingerprint, status.signaled_fingerprint);
		std::fs::remove_dir_all(&dir).unwrap();
	}

	#[tokio::test]
	async fn unchanged_cycle_touches_nothing() {
		let dir = scratch_dir();
		let output = dir.join("mediamtx.yml");
		let source = ScriptedSource::default();
		let reloader = CountingReloader::default();
		let mut reordered = cameras();
		reordered.reverse();
		source.push(Ok(cameras()));
		source.push(Ok(reordered));

		let mut reconciler = reconciler(&output, &source, &reloader).await;
		reconciler.run_cycle().await.unwrap();
		let before = std::fs::metadata(&output).unwrap().modified().unwrap();
		let bytes_before = std::fs::read(&output).unwrap();

		assert_eq!(reconciler.run_cycle().await.unwrap(), CycleOutcome::Unchanged);
		assert_eq!(std::fs::metadata(&output).unwrap().modified().unwrap(), before);
		assert_eq!(std::fs::read(&output).unwrap(), bytes_before);
		assert_eq!(reloader.attempts.load(Ordering::SeqCst), 1);
		std::fs::remove_dir_all(&dir).unwrap();
	}

	#[tokio::test]
	async fn registry_outage_leaves_live_file_alone() {
		let dir = scratch_dir();
		let output = dir.join("mediamtx.yml");
		let source = ScriptedSource::default();
		let reloader = CountingReloader::default();
		source.push(Ok(cameras()));
		source.push(Err(SyncError::RegistryUnavailable("timed out".to_string())));
		source.push(Err(SyncError::RegistryMalformedResponse("expected value".to_string())));
		source.push(Err(SyncError::RegistryUnavailable("connection refused".to_string())));
		source.push(Ok(cameras()));

		let mut reconciler = reconciler(&output, &source, &reloader).await;
		reconciler.run_cycle().await.unwrap();
		let live = std::fs::read(&output).unwrap();

		for _ in 0..3 {
			assert!(reconciler.run_cycle().await.is_err());
			assert_eq!(std::fs::read(&output).unwrap(), live);
		}
		let status = reconciler.status().read().await.clone();
		assert_eq!(status.consecutive_registry_failures, 3);
		assert_eq!(status.last_outcome, Some(CycleOutcome::RegistryFailed));

		assert_eq!(reconciler.run_cycle().await.unwrap(), CycleOutcome::Unchanged);
		assert_eq!(reconciler.status().read().await.consecutive_registry_failures, 0);
		assert_eq!(reloader.attempts.load(Ordering::SeqCst), 1);
		std::fs::remove_dir_all(&dir).unwrap();
	}

	#[tokio::test]
	async fn empty_registry_is_applied_but_outage_is_not() {
		let dir = scratch_dir();
		let output = dir.join("mediamtx.yml");
		let source = ScriptedSource::default();
		let reloader = CountingReloader::default();
		source.push(Ok(cameras()));
		source.push(Err(SyncError::RegistryUnavailable("down".to_string())));
		source.push(Ok(Vec::new()));

		let mut reconciler = reconciler(&output, &source, &reloader).await;
		reconciler.run_cycle().await.unwrap();
		assert!(reconciler.run_cycle().await.is_err());
		assert!(std::fs::read_to_string(&output).unwrap().contains("front-door-camera"));

		assert_eq!(reconciler.run_cycle().await.unwrap(), CycleOutcome::Applied);
		assert_eq!(std::fs::read_to_string(&output).unwrap(), expected_document(&[]));
		std::fs::remove_dir_all(&dir).unwrap();
	}

	#[tokio::test]
	async fn failed_reload_is_retried_until_delivered() {
		let dir = scratch_dir();
		let output = dir.join("mediamtx.yml");
		let source = ScriptedSource::default();
		let reloader = CountingReloader::default();
		reloader.failures_left.store(1, Ordering::SeqCst);
		for _ in 0..3 {
			source.push(Ok(cameras()));
		}

		let mut reconciler = reconciler(&output, &source, &reloader).await;
		assert!(matches!(reconciler.run_cycle().await, Err(SyncError::ReloadSignalFailed(_))));
		assert_eq!(std::fs::read_to_string(&output).unwrap(), expected_document(&cameras()));
		{
			let status = reconciler.status().read().await.clone();
			assert_eq!(status.last_outcome, Some(CycleOutcome::ReloadFailed));
			assert!(status.applied_fingerprint.is_some());
			assert_eq!(status.signaled_fingerprint, None);
		}

		assert_eq!(reconciler.run_cycle().await.unwrap(), CycleOutcome::ReloadDelivered);
		assert_eq!(reconciler.run_cycle().await.unwrap(), CycleOutcome::Unchanged);
		assert_eq!(reloader.attempts.load(Ordering::SeqCst), 2);
		std::fs::remove_dir_all(&dir).unwrap();
	}

	#[tokio::test]
	async fn matching_file_on_disk_is_left_alone_at_startup() {
		let dir = scratch_dir();
		let output = dir.join("mediamtx.yml");
		std::fs::write(&output, expected_document(&cameras())).unwrap();
		let before = std::fs::metadata(&output).unwrap().modified().unwrap();
		let source = ScriptedSource::default();
		let reloader = CountingReloader { watches: true, ..Default::default() };
		source.push(Ok(cameras()));

		let mut reconciler = reconciler(&output, &source, &reloader).await;
		assert_eq!(reconciler.run_cycle().await.unwrap(), CycleOutcome::Unchanged);
		assert_eq!(reloader.attempts.load(Ordering::SeqCst), 0);
		assert_eq!(std::fs::metadata(&output).unwrap().modified().unwrap(), before);
		std::fs::remove_dir_all(&dir).unwrap();
	}

	#[tokio::test]
	async fn explicit_reload_is_sent_once_after_restart() {
		// A previous run may have written this file and then failed to signal the server.
		let dir = scratch_dir();
		let output = dir.join("mediamtx.yml");
		std::fs::write(&output, expected_document(&cameras())).unwrap();
		let before = std::fs::metadata(&output).unwrap().modified().unwrap();
		let source = ScriptedSource::default();
		let reloader = CountingReloader::default();
		source.push(Ok(cameras()));
		source.push(Ok(cameras()));

		let mut reconciler = reconciler(&output, &source, &reloader).await;
		{
			let status = reconciler.status().read().await.clone();
			assert!(status.applied_fingerprint.is_some());
			assert_eq!(status.signaled_fingerprint, None);
		}

		assert_eq!(reconciler.run_cycle().await.unwrap(), CycleOutcome::ReloadDelivered);
		assert_eq!(reconciler.run_cycle().await.unwrap(), CycleOutcome::Unchanged);
		assert_eq!(reloader.attempts.load(Ordering::SeqCst), 1);
		assert_eq!(std::fs::metadata(&output).unwrap().modified().unwrap(), before);
		std::fs::remove_dir_all(&dir).unwrap();
	}

	#[tokio::test]
	async fn stale_file_on_disk_is_replaced() {
		let dir = scratch_dir();
		let output = dir.join("mediamtx.yml");
		std::fs::write(&output, "paths: {}\n").unwrap();
		let source = ScriptedSource::default();
		let reloader = CountingReloader::default();
		source.push(Ok(cameras()));

		let mut reconciler = reconciler(&output, &source, &reloader).await;
		assert_eq!(reconciler.run_cycle().await.unwrap(), CycleOutcome::Applied);
		assert_eq!(std::fs::read_to_string(&output).unwrap(), expected_document(&cameras()));
		std::fs::remove_dir_all(&dir).unwrap();
	}

	#[tokio::test]
	async fn write_failure_does_not_signal() {
		let dir = scratch_dir();
		// Parent of the output is a regular file, so neither the directory nor the temp file can be created.
		let blocker = dir.join("not-a-dir");
		std::fs::write(&blocker, "x").unwrap();
		let output = blocker.join("mediamtx.yml");
		let source = ScriptedSource::default();
		let reloader = CountingReloader::default();
		source.push(Ok(cameras()));

		let mut reconciler = reconciler(&output, &source, &reloader).await;
		assert!(matches!(reconciler.run_cycle().await, Err(SyncError::ConfigWriteFailed(_))));
		assert_eq!(reloader.attempts.load(Ordering::SeqCst), 0);
		let status = reconciler.status().read().await.clone();
		assert_eq!(status.last_outcome, Some(CycleOutcome::WriteFailed));
		assert_eq!(status.applied_fingerprint, None);
		std::fs::remove_dir_all(&dir).unwrap();
	}

	#[tokio::test]
	async fn invalid_camera_is_reported_but_batch_applies() {
		let dir = scratch_dir();
		let output = dir.join("mediamtx.yml");
		let source = ScriptedSource::default();
		let reloader = CountingReloader::default();
		let mut batch = cameras();
		let mut broken = camera(3, "Broken", true);
		broken.target_bitrate = 0;
		batch.push(broken);
		source.push(Ok(batch));

		let mut reconciler = reconciler(&output, &source, &reloader).await;
		assert_eq!(reconciler.run_cycle().await.unwrap(), CycleOutcome::Applied);
		assert_eq!(std::fs::read_to_string(&output).unwrap(), expected_document(&cameras()));
		let status = reconciler.status().read().await.clone();
		assert_eq!(status.rejected_cameras.iter().map(|r| r.id).collect::<Vec<_>>(), vec![3]);
		std::fs::remove_dir_all(&dir).unwrap();
	}

	#[tokio::test]
	async fn loop_runs_on_tick_and_trigger_then_stops() {
		let dir = scratch_dir();
		let output = dir.join("mediamtx.yml");
		let source = ScriptedSource::default();
		let reloader = CountingReloader::default();
		source.push(Ok(cameras()));
		source.push(Ok(cameras()));

		let reconciler = reconciler(&output, &source, &reloader).await;
		let status = reconciler.status();
		let trigger = Arc::new(Notify::new());
		let (shutdown_tx, shutdown_rx) = watch::channel(false);
		let handle = tokio::spawn(reconciler.run(Duration::from_secs(3600), trigger.clone(), shutdown_rx));

		// The first tick fires immediately; the trigger asks for exactly one more cycle.
		trigger.notify_one();
		let waited = tokio::time::timeout(Duration::from_secs(10), async {
			while source.fetches.load(Ordering::SeqCst) < 2 || status.read().await.state != LoopState::Idle {
				tokio::time::sleep(Duration::from_millis(10)).await;
			}
		}).await;
		assert!(waited.is_ok());

		shutdown_tx.send(true).unwrap();
		tokio::time::timeout(Duration::from_secs(10), handle).await.unwrap().unwrap();

		assert_eq!(source.fetches.load(Ordering::SeqCst), 2);
		assert_eq!(reloader.attempts.load(Ordering::SeqCst), 1);
		assert_eq!(status.read().await.last_outcome, Some(CycleOutcome::Unchanged));
		std::fs::remove_dir_all(&dir).unwrap();
	}

	async fn wait_for(what: &str, condition: impl Fn() -> bool) {
		let waited = tokio::time::timeout(Duration::from_secs(10), async {
			while !condition() {
				tokio::time::sleep(Duration::from_millis(5)).await;
			}
		}).await;
		assert!(waited.is_ok(), "timed out waiting for {}", what);
	}

	#[tokio::test]
	async fn requests_during_a_cycle_collapse_and_shutdown_finishes_it() {
		let dir = scratch_dir();
		let output = dir.join("mediamtx.yml");
		let source = ScriptedSource { delay: Duration::from_millis(300), ..Default::default() };
		let reloader = CountingReloader::default();
		let mut grown = cameras();
		grown.push(camera(3, "Loading Bay", true));
		source.push(Ok(cameras()));
		source.push(Ok(cameras()));
		source.push(Ok(grown.clone()));

		let reconciler = reconciler(&output, &source, &reloader).await;
		let trigger = Arc::new(Notify::new());
		let (shutdown_tx, shutdown_rx) = watch::channel(false);
		let handle = tokio::spawn(reconciler.run(Duration::from_secs(3600), trigger.clone(), shutdown_rx));

		let fetches = source.fetches.clone();
		wait_for("first fetch", || fetches.load(Ordering::SeqCst) == 1).await;
		for _ in 0..5 {
			trigger.notify_one();
		}
		wait_for("follow-up fetch", || fetches.load(Ordering::SeqCst) == 2).await;
		// Long enough for the follow-up cycle to finish and any extra one to start.
		tokio::time::sleep(Duration::from_millis(800)).await;
		assert_eq!(fetches.load(Ordering::SeqCst), 2);

		trigger.notify_one();
		wait_for("third fetch", || fetches.load(Ordering::SeqCst) == 3).await;
		shutdown_tx.send(true).unwrap();
		tokio::time::timeout(Duration::from_secs(10), handle).await.unwrap().unwrap();

		assert_eq!(fetches.load(Ordering::SeqCst), 3);
		assert_eq!(std::fs::read_to_string(&output).unwrap(), expected_document(&grown));
		assert_eq!(std::fs::read_dir(&dir).unwrap().count(), 1);
		assert_eq!(reloader.attempts.load(Ordering::SeqCst), 2);
		std::fs::remove_dir_all(&dir).unwrap();
	}

	#[test]
	fn render_stage_errors_map_to_render_failed() {
		let invalid = SyncError::InvalidCameraDefinition { id: 1, reason: "bad".to_string() };
		assert_eq!(CycleOutcome::of_error(&invalid), CycleOutcome::RenderFailed);
		let unavailable = SyncError::RegistryUnavailable("down".to_string());
		assert_eq!(CycleOutcome::of_error(&unavailable), CycleOutcome::RegistryFailed);
		let write = SyncError::ConfigWriteFailed(io::Error::new(io::ErrorKind::PermissionDenied, "read-only"));
		assert_eq!(CycleOutcome::of_error(&write), CycleOutcome::WriteFailed);
	}

	#[test]
	fn registry_warnings_back_off() {
		let warned: Vec<u32> = (1..=200).filter(|n| FailureLog::should_warn(*n)).collect();
		assert_eq!(warned, vec![1, 2, 4, 8, 16, 32, 64, 128, 192]);
	}
}
