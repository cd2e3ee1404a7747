use std::time::Duration;

use log::{debug, info};
use tokio::process::Command;
use url::Url;

use crate::error::{SyncError, SyncResult};



/// Tells the media server to pick up a freshly written configuration file.
#[rocket::async_trait]
pub trait Reloader: Send + Sync {
	fn describe(&self) -> String;
	async fn reload(&self) -> SyncResult<()>;

	// True when the server picks up file changes on its own.
	fn watches_file(&self) -> bool {
		false
	}
}

/// The media server watches its configuration file itself; nothing to send.
pub struct FileWatch;

#[rocket::async_trait]
impl Reloader for FileWatch {
	fn describe(&self) -> String {
		"file watch".to_string()
	}

	fn watches_file(&self) -> bool {
		true
	}

	async fn reload(&self) -> SyncResult<()> {
		debug!("Relying on the media server's file watch to reload");
		Ok(())
	}
}

/// POSTs to a control-plane URL on the media server.
pub struct ControlApi {
	http: reqwest::Client,
	url: Url,
}

impl ControlApi {
	pub fn new(url: Url, timeout: Duration) -> reqwest::Result<ControlApi> {
		let http = reqwest::Client::builder()
			.timeout(timeout)
			.build()?;
		Ok(ControlApi { http, url })
	}
}

#[rocket::async_trait]
impl Reloader for ControlApi {
	fn describe(&self) -> String {
		format!("POST {}", self.url)
	}

	async fn reload(&self) -> SyncResult<()> {
		let response = self.http.post(self.url.clone())
			.send()
			.await
			.map_err(|err| SyncError::ReloadSignalFailed(err.to_string()))?;
		if !response.status().is_success() {
			return Err(SyncError::ReloadSignalFailed(format!("control API answered HTTP {}", response.status())));
		}
		info!("Media server accepted reload request");
		Ok(())
	}
}

/// Runs an external command, e.g. restarting the media server's container.
pub struct ShellCommand {
	program: String,
	args: Vec<String>,
	timeout: Duration,
}

impl ShellCommand {
	/// Splits `command_line` on whitespace. Returns `None` for a blank line.
	pub fn parse(command_line: &str, timeout: Duration) -> Option<ShellCommand> {
		let mut words = command_line.split_whitespace().map(str::to_string);
		let program = words.next()?;
		Some(ShellCommand { program, args: words.collect(), timeout })
	}
}

#[rocket::async_trait]
impl Reloader for ShellCommand {
	fn describe(&self) -> String {
		let mut line = self.program.clone();
		for arg in &self.args {
			line.push(' ');
			line.push_str(arg);
		}
		line
	}

	async fn reload(&self) -> SyncResult<()> {
		let mut command = Command::new(&self.program);
		command.args(&self.args).kill_on_drop(true);
		let output = tokio::time::timeout(self.timeout, command.output()).await
			.map_err(|_| SyncError::ReloadSignalFailed(format!("`{}` timed out after {:?}", self.describe(), self.timeout)))?
			.map_err(|err| SyncError::ReloadSignalFailed(format!("could not run `{}`: {}", self.describe(), err)))?;

		if !output.status.success() {
			let stderr = String::from_utf8_lossy(&output.stderr);
			return Err(SyncError::ReloadSignalFailed(format!("`{}` exited with {}: {}", self.describe(), output.status, stderr.trim())));
		}
		info!("Reload command `{}` succeeded", self.describe());
		Ok(())
	}
}
