use std::io;

use crate::common::CameraId;



/// Everything that can go wrong in one reconciliation cycle.
///
/// None of these stop the process; the loop logs them and tries again on the next tick.
#[derive(Debug, thiserror::Error)]
pub enum SyncError {
	#[error("camera registry unavailable: {0}")]
	RegistryUnavailable(String),

	#[error("camera registry returned a malformed response: {0}")]
	RegistryMalformedResponse(String),

	#[error("invalid camera {id}: {reason}")]
	InvalidCameraDefinition { id: CameraId, reason: String },

	#[error("failed to serialize configuration: {0}")]
	Serialize(#[from] serde_yaml::Error),

	#[error("failed to write configuration file: {0}")]
	ConfigWriteFailed(#[from] io::Error),

	#[error("failed to signal media server reload: {0}")]
	ReloadSignalFailed(String),
}

pub type SyncResult<T> = std::result::Result<T, SyncError>;
