use std::time::Duration;

use log::debug;
use url::Url;

use crate::common::CameraList;
use crate::error::{SyncError, SyncResult};

// A listing of a few thousand cameras is well under this.
pub const MAX_REGISTRY_BODY: usize = 8 * 1024 * 1024;


/// Anything that can hand over the current desired camera set.
#[rocket::async_trait]
pub trait CameraSource: Send + Sync {
	async fn fetch_cameras(&self) -> SyncResult<CameraList>;
}

#[derive(Clone)]
pub struct Credentials {
	pub username: String,
	pub password: Option<String>,
}

/// Reads the camera list from the registry's HTTP listing endpoint.
pub struct RegistryClient {
	http: reqwest::Client,
	endpoint: Url,
	credentials: Option<Credentials>,
	max_body: usize,
}

// The registry also sends `count`, which we don't need.
#[derive(Deserialize)]
struct RegistryResponse {
	#[serde(default)]
	success: Option<bool>,
	#[serde(default)]
	error: Option<String>,
	#[serde(default)]
	cameras: Option<CameraList>,
}

impl RegistryClient {
	pub fn new(endpoint: Url, credentials: Option<Credentials>, timeout: Duration) -> reqwest::Result<RegistryClient> {
		let http = reqwest::Client::builder()
			.timeout(timeout)
			.build()?;
		Ok(RegistryClient { http, endpoint, credentials, max_body: MAX_REGISTRY_BODY })
	}

	pub fn with_max_body(mut self, max_body: usize) -> RegistryClient {
		self.max_body = max_body;
		self
	}

	async fn read_body(&self, mut response: reqwest::Response) -> SyncResult<Vec<u8>> {
		let too_large = || SyncError::RegistryMalformedResponse(format!("response body exceeds {} bytes", self.max_body));
		if response.content_length().map_or(false, |length| length > self.max_body as u64) {
			return Err(too_large());
		}

		let mut body = Vec::new();
		while let Some(chunk) = response.chunk().await
			.map_err(|err| SyncError::RegistryUnavailable(err.to_string()))?
		{
			if body.len() + chunk.len() > self.max_body {
				return Err(too_large());
			}
			body.extend_from_slice(&chunk);
		}
		Ok(body)
	}
}

#[rocket::async_trait]
impl CameraSource for RegistryClient {
	async fn fetch_cameras(&self) -> SyncResult<CameraList> {
		let mut request = self.http.get(self.endpoint.clone());
		if let Some(credentials) = &self.credentials {
			request = request.basic_auth(&credentials.username, credentials.password.as_ref());
		}

		let response = request.send().await
			.map_err(|err| SyncError::RegistryUnavailable(err.to_string()))?;
		let status = response.status();
		if !status.is_success() {
			return Err(SyncError::RegistryUnavailable(format!("{} answered HTTP {}", self.endpoint, status)));
		}
		let body = self.read_body(response).await?;

		let cameras = parse_response(&body)?;
		debug!("Registry listed {} cameras", cameras.len());
		Ok(cameras)
	}
}

pub fn parse_response(body: &[u8]) -> SyncResult<CameraList> {
	let response: RegistryResponse = serde_json::from_slice(body)
		.map_err(|err| SyncError::RegistryMalformedResponse(err.to_string()))?;

	// The registry answers with success=false when its own lookup failed; that's an outage, not bad data.
	if response.success == Some(false) {
		let reason = response.error.unwrap_or_else(|| "registry reported failure".to_string());
		return Err(SyncError::RegistryUnavailable(reason));
	}
	response.cameras
		.ok_or_else(|| SyncError::RegistryMalformedResponse("missing field `cameras`".to_string()))
}
