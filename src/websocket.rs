//! # Stream Session Controller
//!
//! Owns the lifecycle of one telephony call: accepts the transport's
//! websocket connection, dispatches its framed events into the turn buffer,
//! runs the conversation pipeline when a turn is ready and emits the
//! synthesized audio back on the same stream.
//!
//! ## Transport protocol (JSON-framed over the websocket):
//! 1. `start` - announces the stream SID; the session goes active
//! 2. `media` - base64 companded audio fragments, appended to the turn buffer
//! 3. `stop` - the call ended; residual audio is flushed log-only
//!
//! Outbound: `{"event": "media", "streamSid": ..., "media": {"payload": ...}}`
//!
//! ## Concurrency:
//! Each connection is one actix actor. A ready turn is executed with
//! `ctx.wait`, which suspends the actor's mailbox until the pipeline
//! finishes - event consumption and pipeline execution share one sequential
//! handling path, so a session can never have two turns in flight. Separate
//! calls are separate actors and proceed independently.

use crate::audio::session::{CallSession, CallState};
use crate::error::AppError;
use crate::pipeline::ConversationPipeline;
use crate::state::AppState;

use actix::prelude::*;
use actix_web::{web, HttpRequest, HttpResponse, Result as ActixResult};
use actix_web_actors::ws;
use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;
use base64::Engine as _;
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

/// How often the actor pings the transport.
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);

/// How long a silent transport is tolerated before the session is dropped.
const CLIENT_TIMEOUT: Duration = Duration::from_secs(60);

/// Inbound stream events. The transport sends more event types than the
/// session needs (`connected`, mark acknowledgements, ...) - anything not
/// listed lands on `Unknown` and is ignored.
#[derive(Debug, Deserialize)]
#[serde(tag = "event", rename_all = "lowercase")]
pub enum StreamEvent {
    Start { start: StartMeta },
    Media { media: MediaPayload },
    Stop,
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Deserialize)]
pub struct StartMeta {
    #[serde(rename = "streamSid")]
    pub stream_sid: String,
}

#[derive(Debug, Deserialize)]
pub struct MediaPayload {
    /// Base64-encoded companded audio fragment
    pub payload: String,
}

/// Render one outbound media event for the transport.
fn outbound_media_event(stream_sid: &str, payload: &str) -> String {
    json!({
        "event": "media",
        "streamSid": stream_sid,
        "media": { "payload": payload }
    })
    .to_string()
}

/// Websocket actor handling one call's bidirectional media stream.
pub struct CallWebSocket {
    session: CallSession,
    state: web::Data<AppState>,
    pipeline: Arc<ConversationPipeline>,
    /// Whether this stream made it into the call registry
    registered: bool,
    last_heartbeat: Instant,
}

impl CallWebSocket {
    pub fn new(state: web::Data<AppState>, pipeline: Arc<ConversationPipeline>) -> Self {
        let turn_threshold = state.get_config().audio.turn_threshold_bytes;
        Self {
            session: CallSession::new(turn_threshold),
            state,
            pipeline,
            registered: false,
            last_heartbeat: Instant::now(),
        }
    }

    fn handle_start(&mut self, start: StartMeta, ctx: &mut ws::WebsocketContext<Self>) {
        let stream_sid = start.stream_sid;
        if let Err(err) = self.session.activate(stream_sid.clone()) {
            warn!("[{}] start event refused: {}", stream_sid, err);
            return;
        }

        match self.state.calls.register(&stream_sid) {
            Ok(()) => {
                self.registered = true;
                self.state.increment_active_calls();
                info!("[{}] media stream started", stream_sid);
            }
            Err(err) => {
                warn!("[{}] rejecting call: {}", stream_sid, err);
                ctx.stop();
            }
        }
    }

    fn handle_media(&mut self, media: MediaPayload, ctx: &mut ws::WebsocketContext<Self>) {
        let fragment = match BASE64_STANDARD.decode(&media.payload) {
            Ok(bytes) => bytes,
            Err(err) => {
                warn!(
                    "[{}] dropping undecodable media frame: {}",
                    self.session.stream_sid(),
                    err
                );
                return;
            }
        };

        if let Err(err) = self.session.accept_media(&fragment) {
            debug!("ignoring media frame: {}", err);
            return;
        }

        if let Some(turn) = self.session.next_turn() {
            self.dispatch_turn(turn, ctx);
        }
    }

    /// Run the pipeline for one ready turn and emit its audio when done.
    fn dispatch_turn(&mut self, turn: Vec<u8>, ctx: &mut ws::WebsocketContext<Self>) {
        let pipeline = self.pipeline.clone();
        let stream_sid = self.session.stream_sid().to_string();
        info!(
            "[{}] buffer threshold crossed ({} bytes), processing turn",
            stream_sid,
            turn.len()
        );

        let fut = async move { pipeline.run_turn(&stream_sid, turn).await }
            .into_actor(self)
            .map(|outbound, act, ctx| match outbound {
                Some(payload) => {
                    act.state.record_turn(true);
                    ctx.text(outbound_media_event(act.session.stream_sid(), &payload));
                    debug!(
                        "[{}] outbound media event emitted",
                        act.session.stream_sid()
                    );
                }
                None => act.state.record_turn(false),
            });

        // wait, not spawn: the mailbox stays paused until the turn finishes,
        // preserving the one-turn-in-flight invariant for this session
        ctx.wait(fut);
    }

    fn handle_stop(&mut self, ctx: &mut ws::WebsocketContext<Self>) {
        info!("[{}] media stream stopped", self.session.stream_sid());
        self.session.begin_close();

        // Flush leftover audio as a best-effort final turn; its transcript
        // is only logged since the transport can no longer play audio
        if let Some(residual) = self.session.residual() {
            let pipeline = self.pipeline.clone();
            let stream_sid = self.session.stream_sid().to_string();
            let fut = async move { pipeline.run_final_turn(&stream_sid, residual).await }
                .into_actor(self)
                .map(|_, _, ctx: &mut ws::WebsocketContext<Self>| ctx.stop());
            ctx.wait(fut);
        } else {
            ctx.stop();
        }
    }
}

impl Actor for CallWebSocket {
    type Context = ws::WebsocketContext<Self>;

    fn started(&mut self, ctx: &mut Self::Context) {
        info!("websocket connection established with transport");

        ctx.run_interval(HEARTBEAT_INTERVAL, |act, ctx| {
            if Instant::now().duration_since(act.last_heartbeat) > CLIENT_TIMEOUT {
                warn!(
                    "[{}] transport heartbeat timeout, closing session",
                    act.session.stream_sid()
                );
                ctx.stop();
            } else {
                ctx.ping(b"");
            }
        });
    }

    fn stopped(&mut self, _ctx: &mut Self::Context) {
        // Disconnect without a stop event: the in-flight outbound send (if
        // any) died with the context, but residual audio still gets its
        // best-effort transcription in a detached task.
        if self.session.state() != CallState::Closing {
            self.session.begin_close();
            if let Some(residual) = self.session.residual() {
                let pipeline = self.pipeline.clone();
                let stream_sid = self.session.stream_sid().to_string();
                tokio::spawn(async move { pipeline.run_final_turn(&stream_sid, residual).await });
            }
        }

        if self.registered {
            self.state.calls.deregister(self.session.stream_sid());
            self.state.decrement_active_calls();
            info!("[{}] call session closed", self.session.stream_sid());
        } else {
            info!("websocket connection closed before any stream started");
        }
    }
}

impl StreamHandler<Result<ws::Message, ws::ProtocolError>> for CallWebSocket {
    fn handle(&mut self, msg: Result<ws::Message, ws::ProtocolError>, ctx: &mut Self::Context) {
        match msg {
            Ok(ws::Message::Text(text)) => match serde_json::from_str::<StreamEvent>(&text) {
                Ok(StreamEvent::Start { start }) => self.handle_start(start, ctx),
                Ok(StreamEvent::Media { media }) => self.handle_media(media, ctx),
                Ok(StreamEvent::Stop) => self.handle_stop(ctx),
                Ok(StreamEvent::Unknown) => {
                    debug!("ignoring unrecognized stream event");
                }
                Err(err) => {
                    warn!("undecodable stream event: {}", err);
                }
            },
            Ok(ws::Message::Binary(_)) => {
                // The transport frames all media as base64 text
                warn!("unexpected binary frame on media stream");
            }
            Ok(ws::Message::Ping(data)) => {
                self.last_heartbeat = Instant::now();
                ctx.pong(&data);
            }
            Ok(ws::Message::Pong(_)) => {
                self.last_heartbeat = Instant::now();
            }
            Ok(ws::Message::Close(reason)) => {
                info!(
                    "[{}] websocket closed by transport: {:?}",
                    self.session.stream_sid(),
                    reason
                );
                ctx.stop();
            }
            Ok(ws::Message::Continuation(_)) => {
                warn!("unexpected continuation frame");
            }
            Ok(ws::Message::Nop) => {}
            Err(err) => {
                error!("{}", AppError::Transport(err.to_string()));
                ctx.stop();
            }
        }
    }
}

/// Call-setup webhook.
///
/// The phone network posts here when a call arrives; the markup reply tells
/// the transport to open its bidirectional media stream against our
/// websocket endpoint.
pub async fn incoming_call(state: web::Data<AppState>) -> HttpResponse {
    let config = state.get_config();
    info!(
        "incoming call, connecting stream to {}",
        config.server.public_stream_url
    );

    let body = format!(
        "<?xml version=\"1.0\" encoding=\"UTF-8\"?>\
         <Response><Connect><Stream url=\"{}\" /></Connect></Response>",
        config.server.public_stream_url
    );

    HttpResponse::Ok()
        .content_type("application/xml")
        .body(body)
}

/// Websocket endpoint handler: upgrades the HTTP request and hands the
/// connection to a fresh `CallWebSocket` actor.
pub async fn call_stream(
    req: HttpRequest,
    stream: web::Payload,
    state: web::Data<AppState>,
    pipeline: web::Data<ConversationPipeline>,
) -> ActixResult<HttpResponse> {
    info!(
        "new media stream connection from {:?}",
        req.connection_info().peer_addr()
    );

    let websocket = CallWebSocket::new(state, pipeline.into_inner());
    ws::start(websocket, &req, stream)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_start_event_parses_stream_sid() {
        // Realistic transport frame with fields the session ignores
        let raw = r#"{
            "event": "start",
            "sequenceNumber": "1",
            "start": {
                "accountSid": "AC000",
                "streamSid": "MZ18ad3ab5",
                "mediaFormat": {"encoding": "audio/x-mulaw", "sampleRate": 8000}
            },
            "streamSid": "MZ18ad3ab5"
        }"#;

        match serde_json::from_str::<StreamEvent>(raw).unwrap() {
            StreamEvent::Start { start } => assert_eq!(start.stream_sid, "MZ18ad3ab5"),
            other => panic!("wrong event: {:?}", other),
        }
    }

    #[test]
    fn test_media_event_parses_payload() {
        let raw = r#"{
            "event": "media",
            "media": {"track": "inbound", "chunk": "2", "timestamp": "5", "payload": "AAAA"}
        }"#;

        match serde_json::from_str::<StreamEvent>(raw).unwrap() {
            StreamEvent::Media { media } => assert_eq!(media.payload, "AAAA"),
            other => panic!("wrong event: {:?}", other),
        }
    }

    #[test]
    fn test_stop_and_unknown_events() {
        let stop = r#"{"event": "stop", "stop": {"accountSid": "AC000"}}"#;
        assert!(matches!(
            serde_json::from_str::<StreamEvent>(stop).unwrap(),
            StreamEvent::Stop
        ));

        let connected = r#"{"event": "connected", "protocol": "Call"}"#;
        assert!(matches!(
            serde_json::from_str::<StreamEvent>(connected).unwrap(),
            StreamEvent::Unknown
        ));
    }

    #[test]
    fn test_outbound_media_event_shape() {
        let rendered = outbound_media_event("MZ18ad3ab5", "c29tZSBhdWRpbw==");
        let parsed: serde_json::Value = serde_json::from_str(&rendered).unwrap();
        assert_eq!(parsed["event"], "media");
        assert_eq!(parsed["streamSid"], "MZ18ad3ab5");
        assert_eq!(parsed["media"]["payload"], "c29tZSBhdWRpbw==");
    }
}
