use std::cmp::Ordering;
use std::collections::HashSet;

use serde_yaml::{Mapping, Value};
use url::Url;

use crate::common::{CameraDefinition, PathMap, RejectedCamera, RenderedConfiguration, StreamPathEntry};
use crate::error::{SyncError, SyncResult};



pub const CATCH_ALL_PATH: &str = "all_others";
const RAW_SUFFIX: &str = "-raw";

#[derive(Clone)]
#[derive(Debug)]
pub struct RenderSettings {
	pub global: Mapping,
	pub internal_host: String,
	pub internal_rtsp_port: u16,
}

impl RenderSettings {
	fn internal_address(&self, path: &str) -> String {
		format!("rtsp://{}:{}/{}", self.internal_host, self.internal_rtsp_port, path)
	}
}

/// Maps a camera batch to a media server configuration.
///
/// Pure: the result depends only on the set of cameras, not on their order. Records that fail
/// validation are left out and listed in `rejected`; the rest of the batch still renders.
pub fn render(cameras: &[CameraDefinition], settings: &RenderSettings) -> RenderedConfiguration {
	let mut ordered: Vec<&CameraDefinition> = cameras.iter().filter(|camera| camera.enabled).collect();
	ordered.sort_by(|a, b| compare_cameras(a, b));

	let mut seen_ids = HashSet::new();
	let mut taken = HashSet::new();
	let mut paths = PathMap::new();
	let mut rejected = Vec::new();
	let mut camera_count = 0;

	for camera in ordered {
		if !seen_ids.insert(camera.id) {
			rejected.push(RejectedCamera { id: camera.id, reason: "duplicate camera id".to_string() });
			continue;
		}
		if let Err(err) = validate(camera) {
			let reason = match err {
				SyncError::InvalidCameraDefinition { reason, .. } => reason,
				other => other.to_string(),
			};
			rejected.push(RejectedCamera { id: camera.id, reason });
			continue;
		}

		let slug = claim_slug(camera, &mut taken);
		if camera.transcoding_enabled {
			let raw_path = format!("{}{}", slug, RAW_SUFFIX);
			let command = transcode_command(
				camera.target_bitrate,
				&settings.internal_address(&raw_path),
				&settings.internal_address("$MTX_PATH"),
			);
			paths.insert(raw_path, source_entry(&camera.rtsp_url));
			paths.insert(slug, transcode_entry(command));
		} else {
			paths.insert(slug, source_entry(&camera.rtsp_url));
		}
		camera_count += 1;
	}

	paths.insert(CATCH_ALL_PATH.to_string(), StreamPathEntry {
		source_on_demand: Some(false),
		..Default::default()
	});

	RenderedConfiguration {
		global: settings.global.clone(),
		paths,
		camera_count,
		rejected,
	}
}

/// Serializes to the YAML document the media server reads. Any `paths` key in the global
/// settings is replaced by the rendered one, which always comes last.
pub fn serialize(config: &RenderedConfiguration) -> SyncResult<String> {
	let mut document: Mapping = config.global.iter()
		.filter(|(key, _)| key.as_str() != Some("paths"))
		.map(|(key, value)| (key.clone(), value.clone()))
		.collect();
	document.insert(Value::String("paths".to_string()), serde_yaml::to_value(&config.paths)?);
	Ok(serde_yaml::to_string(&document)?)
}

pub fn validate(camera: &CameraDefinition) -> SyncResult<()> {
	let invalid = |reason: String| SyncError::InvalidCameraDefinition { id: camera.id, reason };

	if camera.target_bitrate <= 0 {
		return Err(invalid(format!("target bitrate must be positive, got {}", camera.target_bitrate)));
	}
	let url = Url::parse(&camera.rtsp_url)
		.map_err(|err| invalid(format!("unparseable RTSP URL: {}", err)))?;
	if url.scheme() != "rtsp" && url.scheme() != "rtsps" {
		return Err(invalid(format!("source URL scheme must be rtsp or rtsps, got {}", url.scheme())));
	}
	Ok(())
}

// May return an empty string.
pub fn slugify(name: &str) -> String {
	let mut slug = String::with_capacity(name.len());
	let mut pending_hyphen = false;
	for ch in name.chars().flat_map(char::to_lowercase) {
		if ch.is_ascii_alphanumeric() {
			if pending_hyphen && !slug.is_empty() {
				slug.push('-');
			}
			pending_hyphen = false;
			slug.push(ch);
		} else {
			pending_hyphen = true;
		}
	}
	slug
}

// Cameras arrive here sorted by id, so the lowest id keeps the plain slug.
fn claim_slug(camera: &CameraDefinition, taken: &mut HashSet<String>) -> String {
	let base = slugify(&camera.name);
	let suffix = camera.id.unsigned_abs();
	let mut slug = if base.is_empty() {
		format!("camera-{}", suffix)
	} else {
		base
	};

	let conflicts = |slug: &str, taken: &HashSet<String>| {
		taken.contains(slug)
			|| (camera.transcoding_enabled && taken.contains(&format!("{}{}", slug, RAW_SUFFIX)))
	};
	while conflicts(&slug, taken) {
		slug = format!("{}-{}", slug, suffix);
	}

	if camera.transcoding_enabled {
		taken.insert(format!("{}{}", slug, RAW_SUFFIX));
	}
	taken.insert(slug.clone());
	slug
}

fn compare_cameras(a: &CameraDefinition, b: &CameraDefinition) -> Ordering {
	a.id.cmp(&b.id)
		.then_with(|| a.name.cmp(&b.name))
		.then_with(|| a.rtsp_url.cmp(&b.rtsp_url))
		.then_with(|| a.transcoding_enabled.cmp(&b.transcoding_enabled))
		.then_with(|| a.target_bitrate.cmp(&b.target_bitrate))
		.then_with(|| a.brand.cmp(&b.brand))
}

fn source_entry(rtsp_url: &str) -> StreamPathEntry {
	StreamPathEntry {
		source: Some(rtsp_url.to_string()),
		rtsp_transport: Some("tcp".to_string()),
		source_on_demand: Some(true),
		source_on_demand_start_timeout: Some("10s".to_string()),
		source_on_demand_close_after: Some("10s".to_string()),
		..Default::default()
	}
}

fn transcode_entry(command: String) -> StreamPathEntry {
	StreamPathEntry {
		run_on_demand: Some(command),
		run_on_demand_restart: Some(true),
		run_on_demand_start_timeout: Some("15s".to_string()),
		run_on_demand_close_after: Some("10s".to_string()),
		..Default::default()
	}
}

fn transcode_command(bitrate: i64, input: &str, output: &str) -> String {
	[
		"ffmpeg -rtsp_transport tcp".to_string(),
		format!("-i {}", input),
		"-map 0:v:0 -c:v libx264 -preset ultrafast -tune zerolatency".to_string(),
		"-profile:v baseline -level 3.1 -pix_fmt yuv420p".to_string(),
		format!("-b:v {}k -maxrate {}k -bufsize {}k", bitrate, bitrate.saturating_mul(3) / 2, bitrate.saturating_mul(2)),
		"-g 30 -keyint_min 30 -sc_threshold 0 -an -max_muxing_queue_size 1024".to_string(),
		format!("-f rtsp {}", output),
	].join(" ")
}
