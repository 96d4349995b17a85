//! Outbound WebSocket client for the STT provider.

use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

use va_domain::config::SttConfig;
use va_domain::error::{Error, Result};

pub type SttSink = futures_util::stream::SplitSink<WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>, Message>;
pub type SttSource = futures_util::stream::SplitStream<WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>>;

/// Query parameters the client selects STT settings with.
#[derive(Debug, Clone, Deserialize)]
pub struct SttParams {
    pub model: Option<String>,
    pub sample_rate: Option<u32>,
    pub encoding: Option<String>,
    pub end_of_turn_threshold: Option<f64>,
}

/// One STT progress event. `event` is one of `StartOfTurn`, `Update`,
/// `EagerEndOfTurn`, `TurnResumed`, `EndOfTurn`.
#[derive(Debug, Clone, Deserialize)]
pub struct TurnInfo {
    pub event: String,
    #[serde(default)]
    pub transcript: String,
    #[serde(default)]
    pub confidence: f64,
}

fn build_url(cfg: &SttConfig, params: &SttParams) -> String {
    let mut pairs = Vec::new();
    if let Some(model) = &params.model {
        pairs.push(format!("model={model}"));
    }
    if let Some(rate) = params.sample_rate {
        pairs.push(format!("sample_rate={rate}"));
    }
    if let Some(encoding) = &params.encoding {
        pairs.push(format!("encoding={encoding}"));
    }
    if let Some(threshold) = params.end_of_turn_threshold {
        pairs.push(format!("end_of_turn_threshold={threshold}"));
    }

    if pairs.is_empty() {
        cfg.url.clone()
    } else {
        let separator = if cfg.url.contains('?') { '&' } else { '?' };
        format!("{}{}{}", cfg.url, separator, pairs.join("&"))
    }
}

/// Open the STT connection, retrying up to `max_reconnect_attempts` times
/// with `reconnect_gap_ms` between attempts.
pub async fn connect(
    cfg: &SttConfig,
    params: &SttParams,
) -> Result<WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>> {
    let url = build_url(cfg, params);
    let mut last_err = None;

    for attempt in 0..cfg.max_reconnect_attempts {
        if attempt > 0 {
            tokio::time::sleep(std::time::Duration::from_millis(cfg.reconnect_gap_ms)).await;
        }

        let mut request = match url.clone().into_client_request() {
            Ok(r) => r,
            Err(e) => {
                last_err = Some(Error::Other(e.to_string()));
                continue;
            }
        };
        let auth = format!("Bearer {}", cfg.api_key);
        if let Ok(value) = HeaderValue::from_str(&auth) {
            request.headers_mut().insert("Authorization", value);
        }

        match tokio_tungstenite::connect_async(request).await {
            Ok((stream, _)) => return Ok(stream),
            Err(e) => {
                tracing::warn!(attempt, error = %e, "stt connection attempt failed");
                last_err = Some(Error::Http(e.to_string()));
            }
        }
    }

    Err(last_err.unwrap_or_else(|| Error::Other("stt connection failed".into())))
}

/// Split a connected STT stream into its write and read halves.
pub fn split(
    stream: WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>,
) -> (SttSink, SttSource) {
    stream.split()
}

/// Try to parse a `TurnInfo` out of a raw STT text frame. Non-`TurnInfo`
/// frames (acks, pings) fail to parse and are just passed through as
/// `flux_event` without further inspection.
pub fn parse_turn_info(text: &str) -> Option<TurnInfo> {
    serde_json::from_str(text).ok()
}

pub async fn forward_audio(sink: &mut SttSink, frame: Vec<u8>) -> Result<()> {
    sink.send(Message::Binary(frame)).await.map_err(|e| Error::Http(e.to_string()))
}

pub async fn close(sink: &mut SttSink) {
    let _ = sink.close().await;
}
