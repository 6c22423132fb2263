// Copyright (C) 2026 Podium
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License
// along with this program.  If not, see <https://www.gnu.org/licenses/>.

use std::{net::SocketAddr, sync::Arc};

use anyhow::Context;
use async_trait::async_trait;
use axum::{
    Json, Router,
    extract::{
        Path, Query, State, WebSocketUpgrade,
        ws::{Message as WsMessage, WebSocket},
    },
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use chrono::Utc;
use futures::{SinkExt, StreamExt};
use podium_common::{
    AttachScoreResponse, ClientFrame, RoomRecord, RoomRules, RoomSnapshot, ScoreMap,
    StartRoundResponse,
};
use podium_room::{RoomCommand, RoomRegistry, RosterStore};
use serde::Deserialize;
use tokio::sync::oneshot;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::{info, warn};
use uuid::Uuid;

#[derive(Clone)]
struct AppState {
    registry: RoomRegistry,
}

impl AppState {
    fn from_env() -> Self {
        let roster = Arc::new(HttpRosterStore::from_env());
        let rules = load_rules_config().unwrap_or_default();
        info!(
            turn_seconds = rules.turn_seconds,
            ballot_window_seconds = rules.ballot_window_seconds,
            score_diff_threshold = rules.score_diff_threshold,
            "room rules loaded"
        );
        Self {
            registry: RoomRegistry::new(roster, rules),
        }
    }
}

/// Roster client against the room directory, the collaborator that owns room
/// records and membership changes.
#[derive(Clone)]
struct HttpRosterStore {
    client: reqwest::Client,
    base_url: String,
}

impl HttpRosterStore {
    fn from_env() -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: std::env::var("ROOM_DIRECTORY_BASE_URL")
                .ok()
                .unwrap_or_else(|| "http://room-directory:8070".to_string()),
        }
    }
}

#[async_trait]
impl RosterStore for HttpRosterStore {
    async fn fetch(&self, room_id: &str) -> anyhow::Result<Option<RoomRecord>> {
        let url = format!("{}/v1/rooms/{}", self.base_url, room_id);
        let response = self
            .client
            .get(url)
            .send()
            .await
            .context("failed to fetch room record from directory")?;

        let status = response.status();
        if status == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_else(|_| "".to_string());
            anyhow::bail!("directory returned {} for room {}: {}", status, room_id, body);
        }

        let record = response
            .json::<RoomRecord>()
            .await
            .context("invalid room record payload")?;
        Ok(Some(record))
    }

    async fn remove(&self, room_id: &str) -> anyhow::Result<()> {
        let url = format!("{}/v1/rooms/{}", self.base_url, room_id);
        let response = self
            .client
            .delete(url)
            .send()
            .await
            .context("failed to delete room record from directory")?;

        let status = response.status();
        if !status.is_success() && status != reqwest::StatusCode::NOT_FOUND {
            let body = response.text().await.unwrap_or_else(|_| "".to_string());
            anyhow::bail!("directory returned {} deleting room {}: {}", status, room_id, body);
        }
        Ok(())
    }
}

/// Optional YAML overrides for turn length, ballot window and score gap.
fn load_rules_config() -> Option<RoomRules> {
    let path = std::env::var("RULES_CONFIG_PATH")
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())?;

    let raw = match std::fs::read_to_string(&path) {
        Ok(raw) => raw,
        Err(error) => {
            warn!(path = %path, error = %error, "failed to read rules config file");
            return None;
        }
    };

    match rules_from_yaml(&raw) {
        Ok(rules) => Some(rules),
        Err(error) => {
            warn!(path = %path, error = %error, "failed to parse rules config yaml");
            None
        }
    }
}

fn rules_from_yaml(raw: &str) -> Result<RoomRules, serde_yaml::Error> {
    serde_yaml::from_str::<RoomRules>(raw)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            std::env::var("RUST_LOG")
                .unwrap_or_else(|_| "room_service=debug,podium_room=debug,tower_http=info".to_string()),
        )
        .init();

    let state = AppState::from_env();
    let app = build_router(state);

    let bind_addr = parse_bind_addr("ROOM_SERVICE_BIND", "0.0.0.0:8080")?;
    info!(%bind_addr, "room-service listening");
    let listener = tokio::net::TcpListener::bind(bind_addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}

fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/v1/rooms/{room_id}", get(snapshot_handler))
        .route("/v1/rooms/{room_id}/start", post(start_round_handler))
        .route("/v1/rooms/{room_id}/stream", get(stream_handler))
        .route(
            "/internal/v1/rooms/{room_id}/messages/{message_id}/score",
            post(attach_score_handler),
        )
        .with_state(state)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
}

fn parse_bind_addr(var_name: &str, default: &str) -> anyhow::Result<SocketAddr> {
    let value = std::env::var(var_name)
        .ok()
        .unwrap_or_else(|| default.to_string());
    value.parse().context(format!("invalid {var_name}"))
}

async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({"ok": true, "service": "room-service"}))
}

async fn snapshot_handler(
    State(state): State<AppState>,
    Path(room_id): Path<String>,
) -> Result<Json<RoomSnapshot>, ApiError> {
    let snapshot = state
        .registry
        .snapshot(&room_id)
        .await
        .ok_or_else(|| ApiError::not_found(format!("room {} not active", room_id)))?;
    Ok(Json(snapshot))
}

/// Start entry point. The readiness decision lives with the caller; this
/// only refuses when the directory has no record or the room has no sides.
async fn start_round_handler(
    State(state): State<AppState>,
    Path(room_id): Path<String>,
) -> Result<Json<StartRoundResponse>, ApiError> {
    let handle = state
        .registry
        .ensure_room(&room_id)
        .await
        .map_err(|error| ApiError::bad_gateway(format!("room directory unavailable: {error:#}")))?
        .ok_or_else(|| ApiError::not_found(format!("room {} not found", room_id)))?;

    let (reply_tx, reply_rx) = oneshot::channel();
    handle
        .commands
        .send(RoomCommand::StartRound {
            reply: Some(reply_tx),
        })
        .map_err(|_| ApiError::internal("room is shutting down"))?;
    let response = reply_rx
        .await
        .map_err(|_| ApiError::internal("room task dropped the start request"))?;

    info!(
        room_id = %room_id,
        started = response.started,
        reason = response.reason.as_deref().unwrap_or("none"),
        round = response.round,
        "round start requested"
    );
    Ok(Json(response))
}

#[derive(Debug, Clone, Deserialize)]
struct ScoreUpdateRequest {
    score: ScoreMap,
}

/// Callback for the evaluator pipeline. Scores for rooms or messages that are
/// gone are dropped; the round never waits for them.
async fn attach_score_handler(
    State(state): State<AppState>,
    Path((room_id, message_id)): Path<(String, Uuid)>,
    Json(request): Json<ScoreUpdateRequest>,
) -> Result<Json<AttachScoreResponse>, ApiError> {
    let handle = state
        .registry
        .handle(&room_id)
        .await
        .ok_or_else(|| ApiError::not_found(format!("room {} not active", room_id)))?;

    let (reply_tx, reply_rx) = oneshot::channel();
    handle
        .commands
        .send(RoomCommand::AttachScore {
            message_id,
            score: request.score,
            reply: Some(reply_tx),
        })
        .map_err(|_| ApiError::internal("room is shutting down"))?;
    let response = reply_rx
        .await
        .map_err(|_| ApiError::internal("room task dropped the score update"))?;
    Ok(Json(response))
}

#[derive(Debug, Deserialize)]
struct StreamQuery {
    user_id: String,
}

async fn stream_handler(
    State(state): State<AppState>,
    ws: WebSocketUpgrade,
    Path(room_id): Path<String>,
    Query(query): Query<StreamQuery>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state, room_id, query.user_id))
}

async fn handle_socket(mut socket: WebSocket, state: AppState, room_id: String, user_id: String) {
    let handle = match state.registry.ensure_room(&room_id).await {
        Ok(Some(handle)) => handle,
        Ok(None) => {
            warn!(room_id = %room_id, user_id = %user_id, "stream for unknown room dropped");
            let payload = serde_json::json!({
                "type": "ERROR",
                "room_id": room_id,
                "error": "room not found",
                "at": Utc::now(),
            })
            .to_string();
            let _ = socket.send(WsMessage::Text(payload.into())).await;
            return;
        }
        Err(error) => {
            warn!(room_id = %room_id, error = %error, "room lookup failed for stream");
            return;
        }
    };

    let connected = serde_json::json!({
        "type": "CONNECTED",
        "room_id": room_id,
        "user_id": user_id,
        "connected_at": Utc::now(),
    })
    .to_string();
    if socket.send(WsMessage::Text(connected.into())).await.is_err() {
        return;
    }

    // Subscribe before joining so the join echo is not missed.
    let mut events_rx = handle.events.subscribe();
    let _ = handle.commands.send(RoomCommand::Join {
        user_id: user_id.clone(),
    });

    let (mut ws_tx, mut ws_rx) = socket.split();

    let forward_room_id = room_id.clone();
    let mut forward_task = tokio::spawn(async move {
        loop {
            let event = match events_rx.recv().await {
                Ok(event) => event,
                Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(room_id = %forward_room_id, skipped, "stream fell behind room events");
                    continue;
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            };
            let payload = match serde_json::to_string(&event) {
                Ok(payload) => payload,
                Err(error) => {
                    warn!(room_id = %forward_room_id, error = %error, "failed to encode room event");
                    continue;
                }
            };
            if ws_tx.send(WsMessage::Text(payload.into())).await.is_err() {
                break;
            }
        }
    });

    loop {
        tokio::select! {
            frame = ws_rx.next() => {
                let Some(Ok(frame)) = frame else { break };
                match frame {
                    WsMessage::Text(text) => {
                        let frame = match serde_json::from_str::<ClientFrame>(text.as_str()) {
                            Ok(frame) => frame,
                            Err(error) => {
                                warn!(room_id = %room_id, user_id = %user_id, error = %error, "invalid client frame dropped");
                                continue;
                            }
                        };
                        if !dispatch_frame(&handle, &user_id, frame) {
                            break;
                        }
                    }
                    WsMessage::Close(_) => break,
                    _ => {}
                }
            }
            _ = &mut forward_task => break,
        }
    }

    let _ = handle.commands.send(RoomCommand::Leave {
        user_id: user_id.clone(),
    });
    forward_task.abort();
    info!(room_id = %room_id, user_id = %user_id, "stream closed");
}

/// Maps one client frame onto a room command. Returns false when the client
/// asked to leave.
fn dispatch_frame(handle: &podium_room::RoomHandle, user_id: &str, frame: ClientFrame) -> bool {
    let command = match frame {
        ClientFrame::SendMessage { text } => RoomCommand::SendMessage {
            author_id: user_id.to_string(),
            text,
        },
        ClientFrame::CastVote { choice_id } => RoomCommand::CastVote {
            juror_id: user_id.to_string(),
            choice_id,
        },
        ClientFrame::Typing { is_typing } => RoomCommand::Typing {
            user_id: user_id.to_string(),
            is_typing,
        },
        ClientFrame::Leave => return false,
    };
    let _ = handle.commands.send(command);
    true
}

#[derive(Debug)]
struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn internal(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            message: message.into(),
        }
    }

    fn bad_gateway(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_GATEWAY,
            message: message.into(),
        }
    }

    fn not_found(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::NOT_FOUND,
            message: message.into(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        warn!(status = %self.status, message = %self.message, "request failed");
        (
            self.status,
            Json(serde_json::json!({"error": self.message})),
        )
            .into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use podium_common::{RoundPhase, DEFAULT_BALLOT_WINDOW_SECONDS, DEFAULT_TURN_SECONDS};
    use std::{collections::HashMap, sync::Mutex};

    #[derive(Default)]
    struct InMemoryRosterStore {
        records: Mutex<HashMap<String, RoomRecord>>,
    }

    #[async_trait]
    impl RosterStore for InMemoryRosterStore {
        async fn fetch(&self, room_id: &str) -> anyhow::Result<Option<RoomRecord>> {
            Ok(self.records.lock().unwrap().get(room_id).cloned())
        }

        async fn remove(&self, room_id: &str) -> anyhow::Result<()> {
            self.records.lock().unwrap().remove(room_id);
            Ok(())
        }
    }

    fn record(room_id: &str, participants: &[&str], jurors: &[&str]) -> RoomRecord {
        RoomRecord {
            room_id: room_id.to_string(),
            owner_id: participants.first().copied().unwrap_or("nobody").to_string(),
            participants: participants.iter().map(|id| id.to_string()).collect(),
            jurors: jurors.iter().map(|id| id.to_string()).collect(),
        }
    }

    fn app_state(records: Vec<RoomRecord>) -> AppState {
        let store = InMemoryRosterStore::default();
        for record in records {
            store
                .records
                .lock()
                .unwrap()
                .insert(record.room_id.clone(), record);
        }
        AppState {
            registry: RoomRegistry::new(Arc::new(store), RoomRules::default()),
        }
    }

    fn score(value: i64) -> ScoreMap {
        let mut map = ScoreMap::new();
        map.insert("logic".to_string(), value);
        map
    }

    #[tokio::test]
    async fn start_round_handler_seats_the_owner() {
        let state = app_state(vec![record("room-1", &["alice", "bob"], &[])]);

        let response = start_round_handler(State(state), Path("room-1".to_string()))
            .await
            .unwrap()
            .0;

        assert!(response.started);
        assert_eq!(response.round, 1);
        assert_eq!(response.phase, RoundPhase::InRound);
        assert_eq!(response.holder_id.as_deref(), Some("alice"));
    }

    #[tokio::test]
    async fn start_round_handler_refuses_a_second_start() {
        let state = app_state(vec![record("room-1", &["alice", "bob"], &[])]);

        let first = start_round_handler(State(state.clone()), Path("room-1".to_string()))
            .await
            .unwrap()
            .0;
        assert!(first.started);

        let second = start_round_handler(State(state), Path("room-1".to_string()))
            .await
            .unwrap()
            .0;
        assert!(!second.started);
        assert_eq!(second.reason.as_deref(), Some("ALREADY_IN_ROUND"));
    }

    #[tokio::test]
    async fn start_round_handler_returns_not_found_for_unknown_room() {
        let state = app_state(vec![]);

        let err = start_round_handler(State(state), Path("ghost".to_string()))
            .await
            .unwrap_err();
        assert_eq!(err.status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn snapshot_handler_reports_round_state() {
        let state = app_state(vec![record("room-1", &["alice", "bob"], &["carol"])]);
        let _ = start_round_handler(State(state.clone()), Path("room-1".to_string()))
            .await
            .unwrap();

        let snapshot = snapshot_handler(State(state), Path("room-1".to_string()))
            .await
            .unwrap()
            .0;

        assert_eq!(snapshot.phase, RoundPhase::InRound);
        assert_eq!(snapshot.current_holder_id.as_deref(), Some("alice"));
        let remaining = snapshot.turn_remaining_ms.expect("clock running");
        assert!(remaining <= DEFAULT_TURN_SECONDS * 1_000);
        assert_eq!(snapshot.jurors, vec!["carol"]);
    }

    #[tokio::test]
    async fn snapshot_handler_returns_not_found_before_first_use() {
        let state = app_state(vec![record("room-1", &["alice", "bob"], &[])]);

        let err = snapshot_handler(State(state), Path("room-1".to_string()))
            .await
            .unwrap_err();
        assert_eq!(err.status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn attach_score_handler_applies_evaluator_scores() {
        let state = app_state(vec![record("room-1", &["alice", "bob"], &[])]);
        let _ = start_round_handler(State(state.clone()), Path("room-1".to_string()))
            .await
            .unwrap();

        state
            .registry
            .dispatch("room-1", RoomCommand::SendMessage {
                author_id: "alice".to_string(),
                text: "opening".to_string(),
            })
            .await;
        let snapshot = state.registry.snapshot("room-1").await.unwrap();
        let message_id = snapshot.messages[0].id;

        let response = attach_score_handler(
            State(state.clone()),
            Path(("room-1".to_string(), message_id)),
            Json(ScoreUpdateRequest { score: score(55) }),
        )
        .await
        .unwrap()
        .0;

        assert!(response.applied);
        let snapshot = state.registry.snapshot("room-1").await.unwrap();
        assert_eq!(snapshot.totals["alice"], 55);
    }

    #[tokio::test]
    async fn attach_score_handler_refuses_unknown_message() {
        let state = app_state(vec![record("room-1", &["alice", "bob"], &[])]);
        let _ = start_round_handler(State(state.clone()), Path("room-1".to_string()))
            .await
            .unwrap();

        let response = attach_score_handler(
            State(state),
            Path(("room-1".to_string(), Uuid::new_v4())),
            Json(ScoreUpdateRequest { score: score(10) }),
        )
        .await
        .unwrap()
        .0;

        assert!(!response.applied);
        assert_eq!(response.reason.as_deref(), Some("UNKNOWN_MESSAGE"));
    }

    #[tokio::test]
    async fn attach_score_handler_returns_not_found_for_inactive_room() {
        let state = app_state(vec![record("room-1", &["alice", "bob"], &[])]);

        let err = attach_score_handler(
            State(state),
            Path(("room-1".to_string(), Uuid::new_v4())),
            Json(ScoreUpdateRequest { score: score(10) }),
        )
        .await
        .unwrap_err();
        assert_eq!(err.status, StatusCode::NOT_FOUND);
    }

    #[test]
    fn rules_yaml_overrides_selected_fields() {
        let rules = rules_from_yaml("turn_seconds: 20\nscore_diff_threshold: 250\n").unwrap();
        assert_eq!(rules.turn_seconds, 20);
        assert_eq!(rules.score_diff_threshold, 250);
        assert_eq!(rules.ballot_window_seconds, DEFAULT_BALLOT_WINDOW_SECONDS);
    }

    #[test]
    fn rules_yaml_rejects_garbage() {
        assert!(rules_from_yaml("turn_seconds: [not, a, number]").is_err());
    }

    #[test]
    fn leave_frame_ends_the_stream_without_a_command() {
        let (commands_tx, mut commands_rx) = tokio::sync::mpsc::unbounded_channel();
        let (events_tx, _) = tokio::sync::broadcast::channel(8);
        let handle = podium_room::RoomHandle {
            commands: commands_tx,
            events: events_tx,
        };

        assert!(dispatch_frame(&handle, "alice", ClientFrame::Typing {
            is_typing: true
        }));
        assert!(!dispatch_frame(&handle, "alice", ClientFrame::Leave));

        let queued = commands_rx.try_recv().unwrap();
        assert!(matches!(queued, RoomCommand::Typing { .. }));
        assert!(commands_rx.try_recv().is_err());
    }
}
