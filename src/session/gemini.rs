//! Gemini Live API connector.
//!
//! Speaks the `BidiGenerateContent` websocket protocol: a JSON setup
//! message selects the model and voice, then realtime input messages carry
//! base64 PCM upstream while server messages stream agent audio, turn
//! boundaries, and interruptions back. The server may deliver its JSON in
//! binary frames.

use crate::config::AgentConfig;
use crate::error::{Result, VoiceError};
use crate::pcm::EncodedBlob;
use crate::session::{Connector, LiveSession, OutboundFrame, SessionEvent};
use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tracing::{debug, info, warn};
use url::Url;
use uuid::Uuid;

/// Default Gemini Live websocket endpoint.
pub const DEFAULT_ENDPOINT: &str = "wss://generativelanguage.googleapis.com/ws/google.ai.generativelanguage.v1beta.GenerativeService.BidiGenerateContent";

/// Outbound frames buffered while the websocket catches up.
const OUTBOUND_CHANNEL_SIZE: usize = 256;
/// Inbound events buffered ahead of the client loop.
const EVENT_CHANNEL_SIZE: usize = 256;
/// How long to wait for `setupComplete` before declaring the session dead.
const SETUP_TIMEOUT: Duration = Duration::from_secs(15);

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

#[derive(Serialize)]
struct SetupMessage<'a> {
    setup: SetupPayload<'a>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct SetupPayload<'a> {
    model: String,
    generation_config: GenerationConfig<'a>,
    #[serde(skip_serializing_if = "Option::is_none")]
    system_instruction: Option<SystemInstruction<'a>>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerationConfig<'a> {
    response_modalities: Vec<&'static str>,
    speech_config: SpeechConfig<'a>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct SpeechConfig<'a> {
    voice_config: VoiceSelection<'a>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct VoiceSelection<'a> {
    prebuilt_voice_config: PrebuiltVoice<'a>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct PrebuiltVoice<'a> {
    voice_name: &'a str,
}

#[derive(Serialize)]
struct SystemInstruction<'a> {
    parts: Vec<TextPart<'a>>,
}

#[derive(Serialize)]
struct TextPart<'a> {
    text: &'a str,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct RealtimeInputMessage {
    realtime_input: RealtimeInput,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct RealtimeInput {
    media_chunks: Vec<MediaChunk>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct MediaChunk {
    mime_type: String,
    data: String,
}

/// Connector for the Gemini Live API.
#[derive(Debug, Default)]
pub struct GeminiConnector;

impl GeminiConnector {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Connector for GeminiConnector {
    async fn connect(&self, config: &AgentConfig) -> Result<LiveSession> {
        let api_key = resolve_api_key(config)?;
        let url = build_session_url(&config.endpoint, &api_key)?;
        let setup = build_setup_message(config)?;

        let (ws, _response) = connect_async(url.as_str())
            .await
            .map_err(|e| VoiceError::Session(format!("websocket connect failed: {e}")))?;
        debug!("websocket connected to {}", config.endpoint);

        let (mut ws_tx, ws_rx) = ws.split();
        ws_tx
            .send(Message::Text(setup))
            .await
            .map_err(|e| VoiceError::Session(format!("failed to send session setup: {e}")))?;

        let (outbound_tx, outbound_rx) = mpsc::channel(OUTBOUND_CHANNEL_SIZE);
        let (event_tx, event_rx) = mpsc::channel(EVENT_CHANNEL_SIZE);
        let opened = Arc::new(AtomicBool::new(false));

        tokio::spawn(outbound_loop(ws_tx, outbound_rx));
        tokio::spawn(inbound_loop(ws_rx, event_tx.clone(), Arc::clone(&opened)));
        tokio::spawn(setup_watchdog(event_tx, opened));

        let session_id = Uuid::new_v4().to_string();
        info!("live session {session_id} negotiating with model {}", config.model);
        Ok(LiveSession::new(outbound_tx, event_rx, session_id))
    }
}

fn resolve_api_key(config: &AgentConfig) -> Result<String> {
    if let Some(ref key) = config.api_key {
        if !key.is_empty() {
            return Ok(key.clone());
        }
    }
    std::env::var("GEMINI_API_KEY").map_err(|_| {
        VoiceError::Config("no API key: set agent.api_key or the GEMINI_API_KEY variable".into())
    })
}

fn build_session_url(endpoint: &str, api_key: &str) -> Result<Url> {
    let mut url = Url::parse(endpoint)
        .map_err(|e| VoiceError::Config(format!("invalid session endpoint: {e}")))?;
    url.query_pairs_mut().append_pair("key", api_key);
    Ok(url)
}

fn build_setup_message(config: &AgentConfig) -> Result<String> {
    let message = SetupMessage {
        setup: SetupPayload {
            model: format!("models/{}", config.model),
            generation_config: GenerationConfig {
                response_modalities: vec!["AUDIO"],
                speech_config: SpeechConfig {
                    voice_config: VoiceSelection {
                        prebuilt_voice_config: PrebuiltVoice {
                            voice_name: &config.voice,
                        },
                    },
                },
            },
            system_instruction: config.instructions.as_deref().map(|text| {
                SystemInstruction {
                    parts: vec![TextPart { text }],
                }
            }),
        },
    };
    serde_json::to_string(&message)
        .map_err(|e| VoiceError::Session(format!("failed to encode setup message: {e}")))
}

fn build_audio_message(blob: &EncodedBlob) -> Result<String> {
    let message = RealtimeInputMessage {
        realtime_input: RealtimeInput {
            media_chunks: vec![MediaChunk {
                mime_type: blob.format.mime_type(),
                data: STANDARD.encode(&blob.data),
            }],
        },
    };
    serde_json::to_string(&message)
        .map_err(|e| VoiceError::Session(format!("failed to encode audio message: {e}")))
}

/// Parse one server message into session events, in protocol order.
///
/// An interruption in the same message as audio parts precedes them, so
/// stale playback is flushed before new chunks are scheduled.
fn parse_server_events(text: &str) -> Vec<SessionEvent> {
    let value: Value = match serde_json::from_str(text) {
        Ok(v) => v,
        Err(e) => {
            return vec![SessionEvent::Error {
                message: format!("unparseable server message: {e}"),
            }];
        }
    };

    let mut events = Vec::new();

    if value.get("setupComplete").is_some() {
        events.push(SessionEvent::Opened);
    }

    if let Some(content) = value.get("serverContent") {
        if content
            .get("interrupted")
            .and_then(Value::as_bool)
            .unwrap_or(false)
        {
            events.push(SessionEvent::Interrupted);
        }
        if let Some(parts) = content.pointer("/modelTurn/parts").and_then(Value::as_array) {
            for part in parts {
                if let Some(data) = part.pointer("/inlineData/data").and_then(Value::as_str) {
                    events.push(SessionEvent::Chunk {
                        payload: data.to_owned(),
                    });
                }
            }
        }
    }

    if let Some(message) = value.pointer("/error/message").and_then(Value::as_str) {
        events.push(SessionEvent::Error {
            message: message.to_owned(),
        });
    }

    events
}

async fn outbound_loop(mut ws_tx: SplitSink<WsStream, Message>, mut rx: mpsc::Receiver<OutboundFrame>) {
    while let Some(frame) = rx.recv().await {
        match frame {
            OutboundFrame::Audio(blob) => {
                let message = match build_audio_message(&blob) {
                    Ok(m) => m,
                    Err(e) => {
                        warn!("dropping outbound frame: {e}");
                        continue;
                    }
                };
                if let Err(e) = ws_tx.send(Message::Text(message)).await {
                    debug!("outbound send failed: {e}");
                    break;
                }
            }
            OutboundFrame::Close => break,
        }
    }
    let _ = ws_tx.send(Message::Close(None)).await;
    debug!("session outbound loop exited");
}

async fn inbound_loop(
    mut ws_rx: SplitStream<WsStream>,
    events: mpsc::Sender<SessionEvent>,
    opened: Arc<AtomicBool>,
) {
    while let Some(message) = ws_rx.next().await {
        match message {
            Ok(Message::Text(text)) => {
                if !forward_events(&text, &events, &opened).await {
                    return;
                }
            }
            Ok(Message::Binary(data)) => {
                // The server frames its JSON as binary.
                if data.first() == Some(&b'{') {
                    match String::from_utf8(data) {
                        Ok(text) => {
                            if !forward_events(&text, &events, &opened).await {
                                return;
                            }
                        }
                        Err(_) => warn!("discarding non-utf8 binary frame"),
                    }
                } else {
                    warn!("discarding unexpected binary frame ({} bytes)", data.len());
                }
            }
            Ok(Message::Close(frame)) => {
                let (code, reason) = frame
                    .map(|f| (Some(u16::from(f.code)), f.reason.to_string()))
                    .unwrap_or((None, String::new()));
                let _ = events
                    .send(SessionEvent::Closed { code, reason })
                    .await;
                break;
            }
            Ok(_) => {}
            Err(e) => {
                let _ = events
                    .send(SessionEvent::Error {
                        message: format!("websocket error: {e}"),
                    })
                    .await;
                break;
            }
        }
    }
    debug!("session inbound loop exited");
}

/// Forward parsed events; returns `false` once the receiver is gone.
async fn forward_events(
    text: &str,
    events: &mpsc::Sender<SessionEvent>,
    opened: &AtomicBool,
) -> bool {
    for event in parse_server_events(text) {
        if matches!(event, SessionEvent::Opened) {
            opened.store(true, Ordering::SeqCst);
        }
        if events.send(event).await.is_err() {
            return false;
        }
    }
    true
}

async fn setup_watchdog(events: mpsc::Sender<SessionEvent>, opened: Arc<AtomicBool>) {
    tokio::time::sleep(SETUP_TIMEOUT).await;
    if !opened.load(Ordering::SeqCst) {
        warn!("session setup timed out after {SETUP_TIMEOUT:?}");
        let _ = events
            .send(SessionEvent::Error {
                message: "session setup timed out".into(),
            })
            .await;
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

    use super::*;
    use crate::pcm::AudioFormat;

    fn agent_config() -> AgentConfig {
        AgentConfig::default()
    }

    #[test]
    fn setup_message_selects_model_and_voice() {
        let config = agent_config();
        let message = build_setup_message(&config).unwrap();
        let value: Value = serde_json::from_str(&message).unwrap();

        let model = value.pointer("/setup/model").and_then(Value::as_str).unwrap();
        assert!(model.starts_with("models/"));
        assert_eq!(
            value
                .pointer("/setup/generationConfig/responseModalities/0")
                .and_then(Value::as_str),
            Some("AUDIO")
        );
        assert_eq!(
            value
                .pointer("/setup/generationConfig/speechConfig/voiceConfig/prebuiltVoiceConfig/voiceName")
                .and_then(Value::as_str),
            Some(config.voice.as_str())
        );
        assert!(value.pointer("/setup/systemInstruction").is_none());
    }

    #[test]
    fn setup_message_carries_instructions_when_set() {
        let mut config = agent_config();
        config.instructions = Some("Be terse.".into());
        let message = build_setup_message(&config).unwrap();
        let value: Value = serde_json::from_str(&message).unwrap();

        assert_eq!(
            value
                .pointer("/setup/systemInstruction/parts/0/text")
                .and_then(Value::as_str),
            Some("Be terse.")
        );
    }

    #[test]
    fn audio_message_wraps_base64_with_mime() {
        let blob = EncodedBlob {
            data: vec![1, 2, 3, 4],
            format: AudioFormat::pcm16_mono(16_000),
        };
        let message = build_audio_message(&blob).unwrap();
        let value: Value = serde_json::from_str(&message).unwrap();

        assert_eq!(
            value
                .pointer("/realtimeInput/mediaChunks/0/mimeType")
                .and_then(Value::as_str),
            Some("audio/pcm;rate=16000")
        );
        assert_eq!(
            value
                .pointer("/realtimeInput/mediaChunks/0/data")
                .and_then(Value::as_str),
            Some(STANDARD.encode([1u8, 2, 3, 4]).as_str())
        );
    }

    #[test]
    fn setup_complete_opens_the_session() {
        let events = parse_server_events(r#"{"setupComplete":{}}"#);
        assert_eq!(events, vec![SessionEvent::Opened]);
    }

    #[test]
    fn model_turn_parts_become_chunks_in_order() {
        let events = parse_server_events(
            r#"{"serverContent":{"modelTurn":{"parts":[
                {"inlineData":{"mimeType":"audio/pcm;rate=24000","data":"AAAA"}},
                {"inlineData":{"mimeType":"audio/pcm;rate=24000","data":"BBBB"}}
            ]}}}"#,
        );
        assert_eq!(
            events,
            vec![
                SessionEvent::Chunk {
                    payload: "AAAA".into()
                },
                SessionEvent::Chunk {
                    payload: "BBBB".into()
                },
            ]
        );
    }

    #[test]
    fn interruption_precedes_audio_in_the_same_message() {
        let events = parse_server_events(
            r#"{"serverContent":{"interrupted":true,"modelTurn":{"parts":[
                {"inlineData":{"data":"AAAA"}}
            ]}}}"#,
        );
        assert_eq!(events[0], SessionEvent::Interrupted);
        assert!(matches!(events[1], SessionEvent::Chunk { .. }));
    }

    #[test]
    fn turn_complete_alone_yields_nothing() {
        let events = parse_server_events(r#"{"serverContent":{"turnComplete":true}}"#);
        assert!(events.is_empty());
    }

    #[test]
    fn server_error_becomes_an_error_event() {
        let events = parse_server_events(r#"{"error":{"code":400,"message":"bad setup"}}"#);
        assert_eq!(
            events,
            vec![SessionEvent::Error {
                message: "bad setup".into()
            }]
        );
    }

    #[test]
    fn garbage_becomes_a_single_error_event() {
        let events = parse_server_events("not json");
        assert_eq!(events.len(), 1);
        assert!(matches!(events[0], SessionEvent::Error { .. }));
    }

    #[test]
    fn configured_api_key_wins() {
        let mut config = agent_config();
        config.api_key = Some("k-123".into());
        assert_eq!(resolve_api_key(&config).unwrap(), "k-123");
    }

    #[test]
    fn session_url_appends_the_key() {
        let url = build_session_url(DEFAULT_ENDPOINT, "secret").unwrap();
        assert!(url.as_str().ends_with("?key=secret"));
        assert!(url.as_str().starts_with("wss://"));
    }

    #[test]
    fn bad_endpoint_is_a_config_error() {
        assert!(matches!(
            build_session_url("not a url", "k"),
            Err(VoiceError::Config(_))
        ));
    }
}
