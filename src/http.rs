//! HTTP front end for the command gateway and the event log.
//!
//! `POST /approve {proposalId}` and `POST /deposit {amount}` issue commands and
//! answer with the worker's reply. `GET /events` returns the events recorded by the
//! event consumer running in the same process.

use crate::commands::{CommandError, CommandGateway, CommandKind, Outcome, validate};
use crate::events::{EventLog, EventMessage};

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::{Map, Value, json};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

/// What a process serves: command routes when it runs a gateway, `/events` when it
/// runs the event consumer that fills the log.
#[derive(Clone, Default)]
pub struct AppState {
	pub gateway: Option<CommandGateway>,
	pub events: Option<EventLog>,
}

impl AppState {
	pub fn with_gateway(mut self, gateway: CommandGateway) -> Self {
		self.gateway = Some(gateway);
		self
	}

	pub fn with_events(mut self, events: EventLog) -> Self {
		self.events = Some(events);
		self
	}
}

/// Build the router for the parts present in `state`.
pub fn router(state: AppState) -> Router {
	let mut app = Router::new().route("/health", get(health_handler));
	if let Some(gateway) = state.gateway {
		app = app.merge(
			Router::new()
				.route("/approve", post(approve_handler))
				.route("/deposit", post(deposit_handler))
				.with_state(gateway),
		);
	}
	if let Some(events) = state.events {
		app = app.merge(Router::new().route("/events", get(events_handler)).with_state(events));
	}
	app.layer(TraceLayer::new_for_http())
}

/// Serve until `shutdown` is cancelled, then stop accepting and drain open requests.
pub async fn serve(listener: TcpListener, state: AppState, shutdown: CancellationToken) -> std::io::Result<()> {
	info!("HTTP server listening on {}", listener.local_addr()?);
	axum::serve(listener, router(state))
		.with_graceful_shutdown(async move { shutdown.cancelled().await })
		.await
}

async fn approve_handler(State(gateway): State<CommandGateway>, Json(body): Json<Map<String, Value>>) -> Response {
	issue(&gateway, CommandKind::Approve, body).await
}

async fn deposit_handler(State(gateway): State<CommandGateway>, Json(body): Json<Map<String, Value>>) -> Response {
	issue(&gateway, CommandKind::Deposit, body).await
}

async fn events_handler(State(events): State<EventLog>) -> Json<Vec<EventMessage>> {
	Json(events.snapshot().await)
}

async fn health_handler() -> Json<Value> {
	Json(json!({
		"status": "ok",
		"version": env!("CARGO_PKG_VERSION"),
	}))
}

async fn issue(gateway: &CommandGateway, kind: CommandKind, payload: Map<String, Value>) -> Response {
	if let Err(e) = validate(kind, &payload) {
		return (StatusCode::BAD_REQUEST, Json(json!({ "error": e.to_string() }))).into_response();
	}

	match gateway.call(kind, payload).await {
		Ok(Outcome::Success {
			message,
			transaction_hash,
		}) => Json(json!({
			"response": { "message": message, "transactionHash": transaction_hash }
		}))
		.into_response(),
		Ok(Outcome::Failure { error, details }) => (
			StatusCode::BAD_GATEWAY,
			Json(json!({ "response": { "error": error, "details": details } })),
		)
			.into_response(),
		Err(e) => error_response(e),
	}
}

fn error_response(error: CommandError) -> Response {
	let status = match &error {
		CommandError::Timeout { .. } => StatusCode::GATEWAY_TIMEOUT,
		CommandError::Validation(_) => StatusCode::BAD_REQUEST,
		CommandError::Broker(_) | CommandError::ShuttingDown => StatusCode::SERVICE_UNAVAILABLE,
		_ => StatusCode::INTERNAL_SERVER_ERROR,
	};
	warn!("Command request failed: {}", error);

	let body = match &error {
		CommandError::Timeout { correlation_id, .. } => json!({
			"error": "No response received",
			"correlationId": correlation_id,
		}),
		other => json!({ "error": other.to_string() }),
	};
	(status, Json(body)).into_response()
}
