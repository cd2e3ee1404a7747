use std::sync::Arc;

use tokio::sync::Notify;

use rocket::http::Status;
use rocket::response::status;
use rocket::serde::json::{json, Json, Value};
use rocket::State;

use log::info;

use crate::reconciler::{ReconcilerStatus, SharedStatus};


#[get("/status")]
async fn get_status(status_state: &State<SharedStatus>) -> Json<ReconcilerStatus> {
	let status = status_state.read().await;
	Json(status.clone())
}

// Several requests before the loop gets to them still produce a single cycle.
#[post("/sync")]
fn request_sync(trigger: &State<Arc<Notify>>) -> status::Custom<Value> {
	trigger.notify_one();
	info!("Reconciliation requested through the control API");
	status::Custom(Status::Accepted, json!({
		"status": "queued"
	}))
}

#[catch(404)]
fn not_found() -> Value {
	json!({
		"status": "error",
		"reason": "Resource was not found."
	})
}



pub fn stage(status: SharedStatus, trigger: Arc<Notify>) -> rocket::fairing::AdHoc {
	rocket::fairing::AdHoc::on_ignite("Control API", move |rocket| async move {
		rocket
			.manage(status)
			.manage(trigger)
			.register("/", catchers![not_found])
			.mount("/v0", routes![get_status, request_sync])
	})
}
