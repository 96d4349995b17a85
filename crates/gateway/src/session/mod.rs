//! Session Orchestrator: owns one client WebSocket, tends the STT
//! connection, and triggers the Agent Loop on end-of-turn.

pub mod protocol;
pub mod stt;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use axum::extract::ws::{Message as WsMessage, WebSocket};
use axum::extract::{Query, State, WebSocketUpgrade};
use axum::response::IntoResponse;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;

use crate::runtime::AgentLoop;
use crate::state::AppState;
use protocol::{agent_event_to_frames, ClientFrame};
use stt::SttParams;

type SharedSttSink = Arc<tokio::sync::Mutex<stt::SttSink>>;

/// A session's lifecycle, tracked loosely for logging; cancellation and
/// teardown do not branch on it, they just run unconditionally.
#[allow(dead_code)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SessionState {
    Opening,
    Ready,
    Listening,
    Transcribing,
    AgentRunning,
    Closing,
    Closed,
}

pub async fn agent_handler(
    ws: WebSocketUpgrade,
    Query(params): Query<SttParams>,
    State(state): State<AppState>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| run_session(socket, params, state))
}

async fn run_session(socket: WebSocket, params: SttParams, state: AppState) {
    let session_id = uuid::Uuid::new_v4().to_string();
    let mut session_state = SessionState::Opening;
    tracing::info!(session_id, ?session_state, "session opened");

    let stt_stream = match stt::connect(&state.config.stt, &params).await {
        Ok(s) => s,
        Err(e) => {
            tracing::warn!(session_id, error = %e, "stt connection failed, closing session");
            let _ = send_single(socket, ClientFrame::AgentError { error: e.to_string() }).await;
            return;
        }
    };
    let (stt_sink, stt_source) = stt::split(stt_stream);
    let stt_sink: SharedSttSink = Arc::new(tokio::sync::Mutex::new(stt_sink));

    session_state = SessionState::Ready;
    tracing::debug!(session_id, ?session_state, "stt connected");

    let (client_sink, client_source) = socket.split();
    let (out_tx, out_rx) = mpsc::unbounded_channel::<ClientFrame>();

    let writer_task = tokio::spawn(run_writer(client_sink, out_rx));

    let speaking = Arc::new(AtomicBool::new(false));
    let audio_task = tokio::spawn(run_audio_forward(client_source, stt_sink.clone(), speaking.clone()));

    let consume_result = run_stt_consume(
        session_id.clone(),
        stt_source,
        out_tx.clone(),
        speaking.clone(),
        state.clone(),
    )
    .await;

    session_state = SessionState::Closing;
    tracing::info!(session_id, ?session_state, ?consume_result, "session tearing down");

    teardown(&session_id, &state, audio_task, stt_sink, out_tx, writer_task).await;

    session_state = SessionState::Closed;
    tracing::info!(session_id, ?session_state, "session closed");
}

/// Cancels any running Agent Loop turn, closes the STT connection, and
/// drains the writer task. Every exit path out of `run_session` — client
/// close frame, STT stream error, or the axum listener's graceful shutdown
/// on process exit — reaches this same function, so a new exit path can't
/// accidentally skip cleanup.
async fn teardown(
    session_id: &str,
    state: &AppState,
    audio_task: tokio::task::JoinHandle<()>,
    stt_sink: SharedSttSink,
    out_tx: mpsc::UnboundedSender<ClientFrame>,
    writer_task: tokio::task::JoinHandle<()>,
) {
    state.cancel_map.cancel(session_id);
    state.cancel_map.end(session_id);
    audio_task.abort();
    stt::close(&mut *stt_sink.lock().await).await;
    drop(out_tx);
    let _ = writer_task.await;
}

async fn send_single(socket: WebSocket, frame: ClientFrame) -> Result<(), axum::Error> {
    let (mut sink, _source) = socket.split();
    let text = serde_json::to_string(&frame).unwrap_or_default();
    sink.send(WsMessage::Text(text)).await
}

async fn run_writer(
    mut sink: futures_util::stream::SplitSink<WebSocket, WsMessage>,
    mut rx: mpsc::UnboundedReceiver<ClientFrame>,
) {
    while let Some(frame) = rx.recv().await {
        let text = match serde_json::to_string(&frame) {
            Ok(t) => t,
            Err(e) => {
                tracing::warn!(error = %e, "failed to serialize outgoing frame");
                continue;
            }
        };
        if sink.send(WsMessage::Text(text)).await.is_err() {
            break;
        }
    }
    let _ = sink.close().await;
}

/// Reads binary audio frames from the client and forwards them to the STT
/// sink, unless the session is currently speaking back to the client (an
/// Agent Loop turn in progress), in which case frames are discarded to
/// avoid an echo loop.
async fn run_audio_forward(
    mut source: futures_util::stream::SplitStream<WebSocket>,
    stt_sink: SharedSttSink,
    speaking: Arc<AtomicBool>,
) {
    while let Some(msg) = source.next().await {
        let msg = match msg {
            Ok(m) => m,
            Err(_) => break,
        };
        match msg {
            WsMessage::Binary(frame) => {
                if speaking.load(Ordering::SeqCst) {
                    continue;
                }
                let mut sink = stt_sink.lock().await;
                if stt::forward_audio(&mut sink, frame).await.is_err() {
                    break;
                }
            }
            WsMessage::Close(_) => break,
            _ => {}
        }
    }
}

/// Reads STT frames, passes them through as `flux_event`, and on each
/// `EndOfTurn` with a non-empty transcript starts a fresh Agent Loop
/// invocation, cancelling any invocation already running on this session.
async fn run_stt_consume(
    session_id: String,
    mut source: stt::SttSource,
    out_tx: mpsc::UnboundedSender<ClientFrame>,
    speaking: Arc<AtomicBool>,
    state: AppState,
) -> anyhow::Result<()> {
    let mut partial_transcript = String::new();

    while let Some(msg) = source.next().await {
        let msg = match msg {
            Ok(m) => m,
            Err(e) => {
                tracing::warn!(session_id, error = %e, "stt stream error, ending session");
                break;
            }
        };

        let text = match msg {
            tokio_tungstenite::tungstenite::Message::Text(t) => t,
            tokio_tungstenite::tungstenite::Message::Close(_) => break,
            _ => continue,
        };

        let data: serde_json::Value = serde_json::from_str(&text).unwrap_or(serde_json::Value::Null);
        let _ = out_tx.send(ClientFrame::FluxEvent { data: data.clone() });

        let Some(turn) = stt::parse_turn_info(&text) else { continue };

        if turn.event == "EndOfTurn" {
            if !turn.transcript.trim().is_empty() {
                partial_transcript = turn.transcript.clone();
            }
            if partial_transcript.trim().is_empty() {
                continue;
            }
            let query = std::mem::take(&mut partial_transcript);
            start_agent_turn(&session_id, query, &out_tx, &speaking, &state);
        } else if turn.transcript.len() > state.config.agent.interrupt_threshold_chars {
            // Any sufficiently long in-progress transcript interrupts a
            // running turn so the user can redirect the agent mid-speech.
            state.cancel_map.cancel(&session_id);
            partial_transcript = turn.transcript;
        } else {
            partial_transcript = turn.transcript;
        }
    }

    Ok(())
}

fn start_agent_turn(
    session_id: &str,
    query: String,
    out_tx: &mpsc::UnboundedSender<ClientFrame>,
    speaking: &Arc<AtomicBool>,
    state: &AppState,
) {
    let token = state.cancel_map.begin(session_id);
    let agent_loop = AgentLoop {
        llm: state.llm.clone(),
        task_store: state.task_store.clone(),
        history_store: state.history_store.clone(),
        agent_config: state.config.agent,
        cost_table: state.config.llm.cost_table.clone(),
        model: state.config.llm.model.clone(),
    };

    let out_tx = out_tx.clone();
    let speaking = speaking.clone();
    let session_id = session_id.to_string();
    let cancel_map = state.cancel_map.clone();

    tokio::spawn(async move {
        speaking.store(true, Ordering::SeqCst);
        let _ = out_tx.send(ClientFrame::AgentStart);

        let (tx, mut rx) = mpsc::unbounded_channel();
        let forward = tokio::spawn({
            let out_tx = out_tx.clone();
            async move {
                while let Some(event) = rx.recv().await {
                    for frame in agent_event_to_frames(event) {
                        let _ = out_tx.send(frame);
                    }
                }
            }
        });

        let timeout = std::time::Duration::from_millis(agent_loop.agent_config.turn_timeout_ms);
        let run_result = tokio::time::timeout(timeout, agent_loop.run(query, token, tx)).await;

        let _ = forward.await;

        match run_result {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                let _ = out_tx.send(ClientFrame::AgentError { error: e.to_string() });
            }
            Err(_) => {
                let _ = out_tx.send(ClientFrame::AgentError { error: "agent turn timed out".into() });
            }
        }

        speaking.store(false, Ordering::SeqCst);
        cancel_map.end(&session_id);
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_state_enum_round_trips_through_debug() {
        let s = SessionState::Ready;
        assert_eq!(format!("{s:?}"), "Ready");
    }
}
