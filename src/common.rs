use std::collections::BTreeMap;
use std::fmt;

use sha2::{Digest, Sha256};



pub type CameraId = i64;
pub type CameraList = Vec<CameraDefinition>;
pub type PathMap = BTreeMap<String, StreamPathEntry>;

fn default_brand() -> String { "other".to_string() }
fn default_true() -> bool { true }
fn default_bitrate() -> i64 { 1000 }

#[derive(Clone)]
#[derive(Debug, PartialEq)]
#[derive(Serialize, Deserialize)]
pub struct CameraDefinition {
	pub id: CameraId,
	pub name: String,
	pub rtsp_url: String,
	// Descriptive only; every brand is consumed the same way.
	#[serde(default = "default_brand")]
	pub brand: String,
	#[serde(default = "default_true")]
	pub enabled: bool,
	#[serde(default = "default_true")]
	pub transcoding_enabled: bool,
	// kbps
	#[serde(default = "default_bitrate")]
	pub target_bitrate: i64,
}

#[derive(Clone)]
#[derive(Debug, Default, PartialEq)]
#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamPathEntry {
	#[serde(skip_serializing_if = "Option::is_none")]
	pub source: Option<String>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub rtsp_transport: Option<String>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub source_on_demand: Option<bool>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub source_on_demand_start_timeout: Option<String>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub source_on_demand_close_after: Option<String>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub run_on_demand: Option<String>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub run_on_demand_restart: Option<bool>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub run_on_demand_start_timeout: Option<String>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub run_on_demand_close_after: Option<String>,
}

#[derive(Clone)]
#[derive(Debug, PartialEq)]
#[derive(Serialize)]
pub struct RejectedCamera {
	pub id: CameraId,
	pub reason: String,
}

#[derive(Clone)]
#[derive(Debug, PartialEq)]
pub struct RenderedConfiguration {
	pub global: serde_yaml::Mapping,
	pub paths: PathMap,
	pub camera_count: usize,
	pub rejected: Vec<RejectedCamera>,
}

// Hex SHA-256 of a serialized document.
#[derive(Clone)]
#[derive(Debug, PartialEq, Eq)]
pub struct Fingerprint(String);

impl Fingerprint {
	pub fn of(bytes: &[u8]) -> Fingerprint {
		Fingerprint(hex::encode(Sha256::digest(bytes)))
	}

	pub fn as_str(&self) -> &str {
		&self.0
	}
}

impl fmt::Display for Fingerprint {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		// Short form is plenty for log lines.
		write!(f, "{}", &self.0[..12])
	}
}
