use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{anyhow, bail, Context};
use clap::{value_parser, Arg, ArgAction, ArgMatches, Command};
use serde_yaml::Mapping;
use url::Url;

use crate::registry::{Credentials, RegistryClient};
use crate::reload::{ControlApi, FileWatch, Reloader, ShellCommand};
use crate::render::RenderSettings;



// Global media server settings used when no base file is given. `paths` is always generated.
const DEFAULT_GLOBAL_SETTINGS: &str = "\
logLevel: info
logDestinations: [stdout]
api: true
apiAddress: ':9997'
rtspAddress: ':8554'
rtspsAddress: ':8322'
rtmpAddress: ':1935'
rtmpEncryption: 'no'
hlsAddress: ':8888'
hlsAlwaysRemux: false
hlsVariant: lowLatency
hlsSegmentCount: 7
hlsSegmentDuration: 1s
hlsPartDuration: 200ms
webrtcAddress: ':8889'
webrtcAllowOrigins: ['*']
webrtcLocalUDPAddress: ':8189'
webrtcLocalTCPAddress: ':8189'
webrtcIPsFromInterfaces: true
webrtcIPsFromInterfacesList: []
webrtcICEServers2: []
";

#[derive(Clone)]
#[derive(Debug, PartialEq)]
pub enum ReloadMethod {
	Watch,
	Api(Url),
	Command(String),
}

pub struct Settings {
	pub registry_url: Url,
	pub credentials: Option<Credentials>,
	pub registry_timeout: Duration,
	pub poll_interval: Duration,
	pub output: PathBuf,
	pub base_config: Option<PathBuf>,
	pub internal_host: String,
	pub internal_rtsp_port: u16,
	pub reload: ReloadMethod,
	pub reload_timeout: Duration,
	pub write_timeout: Duration,
	pub once: bool,
}

pub fn command() -> Command {
	Command::new("mediamtx-camera-sync")
		.version(env!("CARGO_PKG_VERSION"))
		.about("Keeps a MediaMTX configuration in sync with a camera registry.")
		.arg(
			Arg::new("registry-url")
				.long("registry-url")
				.env("REGISTRY_URL")
				.default_value("http://localhost:8069/api/cctv/cameras")
				.help("Camera listing endpoint of the registry")
		)
		.arg(
			Arg::new("registry-user")
				.long("registry-user")
				.env("REGISTRY_USER")
				.help("Username for HTTP basic auth against the registry")
		)
		.arg(
			Arg::new("registry-password")
				.long("registry-password")
				.env("REGISTRY_PASSWORD")
				.hide_env_values(true)
				.help("Password for HTTP basic auth against the registry")
		)
		.arg(
			Arg::new("registry-timeout")
				.long("registry-timeout")
				.env("REGISTRY_TIMEOUT")
				.value_parser(value_parser!(u64))
				.default_value("5")
				.help("Seconds before a registry request is abandoned")
		)
		.arg(
			Arg::new("poll-interval")
				.long("poll-interval")
				.env("POLL_INTERVAL")
				.value_parser(value_parser!(u64))
				.default_value("30")
				.help("Seconds between reconciliation cycles")
		)
		.arg(
			Arg::new("output")
				.short('o')
				.long("output")
				.env("MEDIAMTX_CONFIG_PATH")
				.value_parser(value_parser!(PathBuf))
				.default_value("/mediamtx/mediamtx.yml")
				.help("Live MediaMTX configuration file to maintain")
		)
		.arg(
			Arg::new("base-config")
				.short('b')
				.long("base-config")
				.env("MEDIAMTX_BASE_CONFIG")
				.value_parser(value_parser!(PathBuf))
				.help("YAML file with global MediaMTX settings; built-in defaults when omitted")
		)
		.arg(
			Arg::new("internal-host")
				.long("internal-host")
				.env("MEDIAMTX_INTERNAL_HOST")
				.default_value("localhost")
				.help("Host the transcoder uses to reach MediaMTX's own RTSP server")
		)
		.arg(
			Arg::new("internal-rtsp-port")
				.long("internal-rtsp-port")
				.env("MEDIAMTX_INTERNAL_RTSP_PORT")
				.value_parser(value_parser!(u16))
				.default_value("8554")
		)
		.arg(
			Arg::new("reload")
				.long("reload")
				.env("MEDIAMTX_RELOAD")
				.value_parser(["watch", "api", "command"])
				.default_value("watch")
				.help("How MediaMTX is told about a new configuration")
		)
		.arg(
			Arg::new("reload-url")
				.long("reload-url")
				.env("MEDIAMTX_RELOAD_URL")
				.help("Control API URL to POST to when --reload=api")
		)
		.arg(
			Arg::new("reload-command")
				.long("reload-command")
				.env("MEDIAMTX_RELOAD_COMMAND")
				.default_value("docker restart mediamtx")
				.help("Command to run when --reload=command")
		)
		.arg(
			Arg::new("reload-timeout")
				.long("reload-timeout")
				.env("MEDIAMTX_RELOAD_TIMEOUT")
				.value_parser(value_parser!(u64))
				.default_value("30")
		)
		.arg(
			Arg::new("write-timeout")
				.long("write-timeout")
				.env("MEDIAMTX_WRITE_TIMEOUT")
				.value_parser(value_parser!(u64))
				.default_value("5")
		)
		.arg(
			Arg::new("once")
				.long("once")
				.action(ArgAction::SetTrue)
				.help("Run a single reconciliation cycle and exit")
		)
}

fn seconds(matches: &ArgMatches, name: &str) -> anyhow::Result<Duration> {
	let secs = *matches.get_one::<u64>(name).ok_or_else(|| anyhow!("--{} is required", name))?;
	if secs == 0 {
		bail!("--{} must be at least one second", name);
	}
	Ok(Duration::from_secs(secs))
}

fn required<'a>(matches: &'a ArgMatches, name: &str) -> anyhow::Result<&'a String> {
	matches.get_one::<String>(name).ok_or_else(|| anyhow!("--{} is required", name))
}

impl Settings {
	pub fn from_matches(matches: &ArgMatches) -> anyhow::Result<Settings> {
		let registry_url = Url::parse(required(matches, "registry-url")?)
			.context("--registry-url is not a valid URL")?;
		if registry_url.scheme() != "http" && registry_url.scheme() != "https" {
			bail!("--registry-url must be an http or https URL");
		}

		let credentials = matches.get_one::<String>("registry-user").map(|username| Credentials {
			username: username.clone(),
			password: matches.get_one::<String>("registry-password").cloned(),
		});

		let reload = match required(matches, "reload")?.as_str() {
			"api" => {
				let url = matches.get_one::<String>("reload-url")
					.ok_or_else(|| anyhow!("--reload=api needs --reload-url"))?;
				ReloadMethod::Api(Url::parse(url).context("--reload-url is not a valid URL")?)
			},
			"command" => {
				let command_line = required(matches, "reload-command")?;
				if command_line.trim().is_empty() {
					bail!("--reload=command needs a non-empty --reload-command");
				}
				ReloadMethod::Command(command_line.clone())
			},
			_ => ReloadMethod::Watch,
		};

		Ok(Settings {
			registry_url,
			credentials,
			registry_timeout: seconds(matches, "registry-timeout")?,
			poll_interval: seconds(matches, "poll-interval")?,
			output: matches.get_one::<PathBuf>("output").cloned()
				.ok_or_else(|| anyhow!("--output is required"))?,
			base_config: matches.get_one::<PathBuf>("base-config").cloned(),
			internal_host: required(matches, "internal-host")?.clone(),
			internal_rtsp_port: *matches.get_one::<u16>("internal-rtsp-port")
				.ok_or_else(|| anyhow!("--internal-rtsp-port is required"))?,
			reload,
			reload_timeout: seconds(matches, "reload-timeout")?,
			write_timeout: seconds(matches, "write-timeout")?,
			once: matches.get_flag("once"),
		})
	}

	pub fn render_settings(&self) -> anyhow::Result<RenderSettings> {
		Ok(RenderSettings {
			global: load_global_settings(self.base_config.as_deref())?,
			internal_host: self.internal_host.clone(),
			internal_rtsp_port: self.internal_rtsp_port,
		})
	}

	pub fn registry_client(&self) -> anyhow::Result<RegistryClient> {
		RegistryClient::new(self.registry_url.clone(), self.credentials.clone(), self.registry_timeout)
			.context("failed to build registry HTTP client")
	}

	pub fn reloader(&self) -> anyhow::Result<Box<dyn Reloader>> {
		Ok(match &self.reload {
			ReloadMethod::Watch => Box::new(FileWatch),
			ReloadMethod::Api(url) => Box::new(
				ControlApi::new(url.clone(), self.reload_timeout).context("failed to build reload HTTP client")?
			),
			ReloadMethod::Command(command_line) => Box::new(
				ShellCommand::parse(command_line, self.reload_timeout)
					.ok_or_else(|| anyhow!("empty reload command"))?
			),
		})
	}
}

/// Global (non-path) settings, from `base` if given.
pub fn load_global_settings(base: Option<&Path>) -> anyhow::Result<Mapping> {
	let (text, origin) = match base {
		Some(path) => (
			std::fs::read_to_string(path).with_context(|| format!("cannot read base config {}", path.display()))?,
			path.display().to_string(),
		),
		None => (DEFAULT_GLOBAL_SETTINGS.to_string(), "built-in defaults".to_string()),
	};
	let value: serde_yaml::Value = serde_yaml::from_str(&text)
		.with_context(|| format!("invalid YAML in {}", origin))?;
	match value {
		serde_yaml::Value::Mapping(mapping) => Ok(mapping),
		serde_yaml::Value::Null => Ok(Mapping::new()),
		_ => bail!("{} must be a YAML mapping", origin),
	}
}
