#[macro_use] extern crate rocket;
#[macro_use] extern crate serde_derive;

use std::sync::Arc;

use anyhow::Context;
use log::{error, info};
use rocket::{Request, Response};
use rocket::fairing::{Fairing, Info, Kind};
use rocket::http::Header;
use tokio::sync::{watch, Notify};

mod common;
mod config;
mod error;
mod reconciler;
mod registry;
mod reload;
mod render;
mod rest_api;

use config::Settings;
use reconciler::Reconciler;



// The camera UI is served from another origin, so the control API has to allow cross-origin calls.
pub struct CORS;

#[rocket::async_trait]
impl Fairing for CORS {
	fn info(&self) -> Info {
		Info {
			name: "Add CORS headers to responses",
			kind: Kind::Response
		}
	}

	async fn on_response<'r>(&self, _request: &'r Request<'_>, response: &mut Response<'r>) {
		response.set_header(Header::new("Access-Control-Allow-Origin", "*"));
		response.set_header(Header::new("Access-Control-Allow-Methods", "POST, GET, OPTIONS"));
		response.set_header(Header::new("Access-Control-Allow-Headers", "*"));
		response.set_header(Header::new("Access-Control-Allow-Credentials", "true"));
	}
}


#[rocket::main]
async fn main() -> anyhow::Result<()> {
	env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

	let matches = config::command().get_matches();
	let settings = Settings::from_matches(&matches)?;

	let reloader = settings.reloader()?;
	info!("Registry:      {}", settings.registry_url);
	info!("Output:        {}", settings.output.display());
	info!("Poll interval: {:?}", settings.poll_interval);
	info!("Reload via:    {}", reloader.describe());

	let mut reconciler = Reconciler::new(
		Box::new(settings.registry_client()?),
		reloader,
		settings.render_settings()?,
		settings.output.clone(),
		settings.write_timeout,
	).await;

	if settings.once {
		return reconciler.run_cycle().await
			.map(|outcome| info!("Single cycle finished: {:?}", outcome))
			.context("reconciliation cycle failed");
	}

	let status = reconciler.status();
	let trigger = Arc::new(Notify::new());
	let (shutdown_tx, shutdown_rx) = watch::channel(false);
	let worker = tokio::spawn(reconciler.run(settings.poll_interval, trigger.clone(), shutdown_rx));

	// Rocket owns Ctrl-C / SIGTERM handling; once it returns, wind the loop down.
	let launched = rocket::build()
		.attach(rest_api::stage(status, trigger))
		.attach(CORS)
		.launch()
		.await;

	let _ = shutdown_tx.send(true);
	if let Err(err) = worker.await {
		error!("Reconciler task ended abnormally; error was {}", err);
	}
	launched?;

	anyhow::Ok(())
}
