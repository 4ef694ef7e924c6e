use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use futures::stream::Stream;
use futures::StreamExt;
use serde::Deserialize;
use serde_json::json;
use tokio_stream::wrappers::BroadcastStream;

use crate::error::{Result, SayrError};
use crate::runner::Runner;

/// HTTP front end for one [`Runner`].
#[derive(Clone)]
pub struct RunnerServer {
    runner: Arc<Runner>,
}

impl RunnerServer {
    pub fn new(runner: Arc<Runner>) -> Self {
        Self { runner }
    }

    pub fn router(&self) -> Router {
        Router::new()
            .route("/health", get(|| async { "ok" }))
            .route("/users/:user/sessions/:session", get(get_session))
            .route("/users/:user/sessions/:session/turns", post(run_turn))
            .route("/users/:user/sessions/:session/memory", post(persist_session))
            .route("/users/:user/memory", get(search_memory))
            .route("/events", get(stream_events))
            .with_state(self.clone())
    }

    pub async fn serve(self, addr: SocketAddr) -> Result<()> {
        let app = self.router();
        let listener = tokio::net::TcpListener::bind(addr).await?;
        tracing::info!(%addr, app = self.runner.app_name(), "runner server listening");
        axum::serve(listener, app.into_make_service())
            .await
            .map_err(|err| SayrError::Protocol(format!("server error: {err}")))?;
        Ok(())
    }
}

fn error_response(status: StatusCode, err: &SayrError) -> Response {
    (status, Json(json!({ "error": err.to_string() }))).into_response()
}

#[derive(Deserialize)]
struct TurnRequest {
    message: String,
}

async fn run_turn(
    State(server): State<RunnerServer>,
    Path((user, session)): Path<(String, String)>,
    Json(req): Json<TurnRequest>,
) -> Response {
    match server.runner.run_turn(&user, &session, &req.message).await {
        Ok(report) => Json(json!({ "response": report.response })).into_response(),
        Err(err) => error_response(StatusCode::BAD_GATEWAY, &err),
    }
}

async fn get_session(
    State(server): State<RunnerServer>,
    Path((user, session)): Path<(String, String)>,
) -> Response {
    match server.runner.session(&user, &session).await {
        Ok(Some(found)) => Json(found).into_response(),
        Ok(None) => error_response(
            StatusCode::NOT_FOUND,
            &SayrError::SessionNotFound(session),
        ),
        Err(err) => error_response(StatusCode::INTERNAL_SERVER_ERROR, &err),
    }
}

async fn persist_session(
    State(server): State<RunnerServer>,
    Path((user, session)): Path<(String, String)>,
) -> Response {
    match server.runner.persist_session(&user, &session).await {
        Ok(records) => Json(json!({ "records_added": records })).into_response(),
        Err(err @ SayrError::SessionNotFound(_)) => error_response(StatusCode::NOT_FOUND, &err),
        Err(err) => error_response(StatusCode::INTERNAL_SERVER_ERROR, &err),
    }
}

#[derive(Deserialize)]
struct MemoryQuery {
    #[serde(default)]
    q: String,
}

async fn search_memory(
    State(server): State<RunnerServer>,
    Path(user): Path<String>,
    Query(query): Query<MemoryQuery>,
) -> Response {
    match server.runner.search_memory(&user, &query.q).await {
        Ok(records) => Json(records).into_response(),
        Err(err) => error_response(StatusCode::INTERNAL_SERVER_ERROR, &err),
    }
}

async fn stream_events(
    State(server): State<RunnerServer>,
) -> Sse<impl Stream<Item = std::result::Result<Event, Infallible>>> {
    let rx = server.runner.subscribe();
    let stream = BroadcastStream::new(rx).filter_map(|msg| async move {
        let event = msg.ok()?;
        Event::default().json_data(&event).ok().map(Ok::<Event, Infallible>)
    });
    Sse::new(stream).keep_alive(KeepAlive::default())
}
