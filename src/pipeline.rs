//! # Conversation Pipeline
//!
//! Runs one buffered audio turn end to end: frame the inbound companded
//! bytes, transcribe, reason (with an optional tool call), synthesize the
//! reply and re-encode it for the media stream.
//!
//! ## Failure semantics:
//! Every stage fails soft. A codec or provider failure ends the turn
//! silently - no partial audio is ever sent - and the call session keeps
//! running. The only stage that degrades instead of going silent is
//! reasoning: if routing, dispatch or narration breaks, the caller hears a
//! fixed apology in their own language rather than dead air.
//!
//! ## Two-pass reasoning:
//! Pass 1 shows the model the tool catalog and asks for either a strict
//! JSON tool call or a plain reply. If the reply parses as a tool call, the
//! tool runs and pass 2 narrates its payload (success or error alike) as
//! one short spoken paragraph. Tool errors are narrated, never raised.
//!
//! Every stage logs and audits under the turn's id so a call can be
//! reconstructed artifact by artifact afterwards.

use crate::audio::codec;
use crate::audit::{AuditEntry, AuditKind, AuditSink};
use crate::config::AppConfig;
use crate::error::AppResult;
use crate::providers::{
    ChatMessage, HttpReasoningProvider, HttpSynthesisProvider, HttpTranscriptionProvider,
    ReasoningProvider, SynthesisProvider, TranscriptResult, TranscriptionProvider,
};
use crate::tools::{
    tool_catalog, HttpLedgerService, HttpPaymentService, ToolCallRequest, ToolExecutor,
};
use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;
use base64::Engine as _;
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

/// Orchestrates one turn at a time for any number of call sessions.
pub struct ConversationPipeline {
    transcription: Arc<dyn TranscriptionProvider>,
    reasoning: Arc<dyn ReasoningProvider>,
    synthesis: Arc<dyn SynthesisProvider>,
    tools: ToolExecutor,
    audit: Arc<dyn AuditSink>,
}

impl ConversationPipeline {
    pub fn new(
        transcription: Arc<dyn TranscriptionProvider>,
        reasoning: Arc<dyn ReasoningProvider>,
        synthesis: Arc<dyn SynthesisProvider>,
        tools: ToolExecutor,
        audit: Arc<dyn AuditSink>,
    ) -> Self {
        Self {
            transcription,
            reasoning,
            synthesis,
            tools,
            audit,
        }
    }

    /// Wire up the real HTTP providers and financial services from config.
    pub fn from_config(config: &AppConfig, audit: Arc<dyn AuditSink>) -> AppResult<Self> {
        let ledger = HttpLedgerService::new(&config.services, config.providers.timeout_ms)?;
        let payment = HttpPaymentService::new(&config.services, config.providers.timeout_ms)?;

        Ok(Self::new(
            Arc::new(HttpTranscriptionProvider::new(&config.providers)?),
            Arc::new(HttpReasoningProvider::new(&config.providers)?),
            Arc::new(HttpSynthesisProvider::new(&config.providers)?),
            ToolExecutor::new(Arc::new(ledger), Arc::new(payment)),
            audit,
        ))
    }

    /// Run one turn. Returns the base64 companded payload for the outbound
    /// media event, or None when the turn ends silently.
    pub async fn run_turn(&self, stream_sid: &str, turn: Vec<u8>) -> Option<String> {
        let turn_id = Uuid::new_v4().to_string();
        info!(
            "[{}] turn {} started with {} buffered bytes",
            stream_sid,
            turn_id,
            turn.len()
        );
        self.audit_event(
            stream_sid,
            &turn_id,
            AuditKind::TurnStarted,
            json!({ "bytes": turn.len() }),
        );

        // 1. Frame the raw companded bytes for the speech service
        let container = match codec::encode_telephony_container(&turn) {
            Ok(container) => container,
            Err(err) => {
                warn!("[{}] turn {} skipped: {}", stream_sid, turn_id, err);
                return None;
            }
        };
        self.audit_audio(stream_sid, &turn_id, "turn_input", "wav", &container);

        // 2. Transcribe; an empty or failed transcript ends the turn silently
        let transcript = match self.transcription.transcribe(container).await {
            Ok(result) => result,
            Err(err) => {
                info!(
                    "[{}] turn {} ended without a transcript: {}",
                    stream_sid, turn_id, err
                );
                return None;
            }
        };
        info!(
            "[{}] turn {} heard ({}): {}",
            stream_sid, turn_id, transcript.language_code, transcript.transcript
        );
        self.audit_event(
            stream_sid,
            &turn_id,
            AuditKind::Transcript,
            json!({
                "transcript": transcript.transcript.clone(),
                "language_code": transcript.language_code.clone(),
            }),
        );

        // 3. Reason (and maybe run a tool); degrades to an apology, never fails
        let response_text = self.respond(stream_sid, &turn_id, &transcript).await;
        info!(
            "[{}] turn {} answering: {}",
            stream_sid, turn_id, response_text
        );
        self.audit_event(
            stream_sid,
            &turn_id,
            AuditKind::ResponseText,
            json!({ "text": response_text.clone() }),
        );

        // 4. Synthesize and reassemble the segments into one container
        let segments = match self
            .synthesis
            .synthesize(&response_text, &transcript.language_code)
            .await
        {
            Ok(segments) => segments,
            Err(err) => {
                warn!(
                    "[{}] turn {} synthesis failed: {}",
                    stream_sid, turn_id, err
                );
                return None;
            }
        };
        let merged = match codec::merge_synthesis_segments(&segments) {
            Ok(merged) => merged,
            Err(err) => {
                warn!(
                    "[{}] turn {} could not reassemble synthesis audio: {}",
                    stream_sid, turn_id, err
                );
                return None;
            }
        };
        self.audit_audio(stream_sid, &turn_id, "tts_output", "wav", &merged);

        // 5. Re-encode for the telephony stream
        let companded = match codec::decode_to_companded(&merged) {
            Ok(companded) => companded,
            Err(err) => {
                warn!(
                    "[{}] turn {} re-encode failed: {}",
                    stream_sid, turn_id, err
                );
                return None;
            }
        };
        self.audit_audio(stream_sid, &turn_id, "outbound_stream", "ulaw", &companded);

        // 6. Base64-frame the payload for the outbound media event
        let payload = BASE64_STANDARD.encode(&companded);
        self.audit_event(
            stream_sid,
            &turn_id,
            AuditKind::OutboundMedia,
            json!({
                "companded_bytes": companded.len(),
                "payload_chars": payload.len(),
            }),
        );
        Some(payload)
    }

    /// Best-effort handling of residual audio at session close: transcribe
    /// and log only. The transport is gone, so nothing is spoken back.
    pub async fn run_final_turn(&self, stream_sid: &str, residual: Vec<u8>) {
        let turn_id = Uuid::new_v4().to_string();
        info!(
            "[{}] transcribing {} residual bytes on close",
            stream_sid,
            residual.len()
        );

        let container = match codec::encode_telephony_container(&residual) {
            Ok(container) => container,
            Err(err) => {
                warn!("[{}] residual audio unusable: {}", stream_sid, err);
                return;
            }
        };

        match self.transcription.transcribe(container).await {
            Ok(result) => {
                info!(
                    "[{}] final transcript ({}): {}",
                    stream_sid, result.language_code, result.transcript
                );
                self.audit_event(
                    stream_sid,
                    &turn_id,
                    AuditKind::FinalTranscript,
                    json!({
                        "transcript": result.transcript,
                        "language_code": result.language_code,
                    }),
                );
            }
            Err(err) => {
                info!("[{}] residual transcription failed: {}", stream_sid, err);
            }
        }
    }

    /// Two-pass reasoning with the apology fallback.
    async fn respond(
        &self,
        stream_sid: &str,
        turn_id: &str,
        transcript: &TranscriptResult,
    ) -> String {
        match self.route_and_narrate(stream_sid, turn_id, transcript).await {
            Ok(text) => text,
            Err(err) => {
                warn!(
                    "[{}] turn {} reasoning degraded to apology: {}",
                    stream_sid, turn_id, err
                );
                apology_for(&transcript.language_code).to_string()
            }
        }
    }

    async fn route_and_narrate(
        &self,
        stream_sid: &str,
        turn_id: &str,
        transcript: &TranscriptResult,
    ) -> AppResult<String> {
        // Pass 1: either a strict tool call or the final conversational answer
        let routing = vec![
            ChatMessage::system(routing_instruction()),
            ChatMessage::user(transcript.transcript.clone()),
        ];
        let first_reply = self.reasoning.complete(routing).await?;

        let Some(request) = ToolCallRequest::parse(&first_reply) else {
            return Ok(first_reply);
        };

        self.audit_event(
            stream_sid,
            turn_id,
            AuditKind::ToolCall,
            json!({
                "tool_name": request.tool_name.clone(),
                "parameters": request.parameters.clone(),
            }),
        );

        // Tool dispatch; failures become payloads the model explains
        let payload = match self.tools.dispatch(&request).await {
            Ok(value) => value,
            Err(tool_error) => {
                warn!(
                    "[{}] turn {} tool '{}' failed: {}",
                    stream_sid, turn_id, request.tool_name, tool_error
                );
                serde_json::to_value(&tool_error)
                    .unwrap_or_else(|_| json!({ "error": tool_error.to_string() }))
            }
        };
        self.audit_event(stream_sid, turn_id, AuditKind::ToolResult, payload.clone());

        // Pass 2: narrate the payload as one short spoken paragraph
        let narration = vec![
            ChatMessage::system(narration_instruction(&transcript.language_code)),
            ChatMessage::user(transcript.transcript.clone()),
            ChatMessage::assistant(first_reply),
            ChatMessage::user(format!(
                "Tool '{}' returned: {}",
                request.tool_name, payload
            )),
        ];
        self.reasoning.complete(narration).await
    }

    fn audit_event(&self, stream_sid: &str, turn_id: &str, kind: AuditKind, detail: Value) {
        if let Err(err) = self
            .audit
            .append(AuditEntry::new(stream_sid, turn_id, kind, detail))
        {
            warn!("audit append failed: {}", err);
        }
    }

    fn audit_audio(&self, stream_sid: &str, turn_id: &str, label: &str, ext: &str, bytes: &[u8]) {
        if let Err(err) = self
            .audit
            .append_audio(stream_sid, turn_id, label, ext, bytes)
        {
            warn!("audit artifact write failed: {}", err);
        }
    }
}

/// System instruction for the routing pass.
fn routing_instruction() -> String {
    format!(
        "You are a helpful and concise assistant speaking on a phone call. \
         You can use these tools:\n{}\n\
         To use a tool, reply with ONLY a JSON object of the form \
         {{\"tool_name\": \"...\", \"parameters\": {{\"key\": \"value\"}}}} and nothing else. \
         Otherwise, answer the caller directly in plain language.",
        tool_catalog()
    )
}

/// System instruction for the narration pass.
fn narration_instruction(language_code: &str) -> String {
    format!(
        "Explain the tool result to the caller in one short, plain paragraph \
         in the language tagged '{}'. This will be read aloud on a phone call: \
         no links, no markdown, no technical jargon. If the result describes \
         an error, apologize briefly and say what the caller can do instead.",
        language_code
    )
}

/// Fixed apology used when reasoning breaks mid-call, keyed on the language
/// the caller was heard speaking.
pub(crate) fn apology_for(language_code: &str) -> &'static str {
    if language_code.starts_with("hi") {
        "माफ़ कीजिए, मुझे जवाब देने में दिक्कत हुई। कृपया दोबारा कोशिश करें।"
    } else {
        "I'm sorry, I had trouble with that. Please try again."
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::MemoryAuditSink;
    use crate::error::AppError;
    use crate::tools::testing::{alice, expense, FixtureLedger, RecordingPayment};
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use std::io::Cursor;
    use std::sync::Mutex;

    struct FakeTranscription {
        result: Option<TranscriptResult>,
    }

    #[async_trait]
    impl TranscriptionProvider for FakeTranscription {
        async fn transcribe(&self, _audio: Vec<u8>) -> AppResult<TranscriptResult> {
            self.result
                .clone()
                .ok_or_else(|| AppError::Provider("transcription unavailable".to_string()))
        }
    }

    /// Replays scripted replies (None = provider failure) and records every
    /// request so tests can inspect both passes.
    #[derive(Default)]
    struct ScriptedReasoning {
        replies: Mutex<VecDeque<Option<String>>>,
        requests: Mutex<Vec<Vec<ChatMessage>>>,
    }

    impl ScriptedReasoning {
        fn with_replies(replies: Vec<Option<&str>>) -> Self {
            Self {
                replies: Mutex::new(
                    replies
                        .into_iter()
                        .map(|r| r.map(str::to_string))
                        .collect(),
                ),
                requests: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl ReasoningProvider for ScriptedReasoning {
        async fn complete(&self, messages: Vec<ChatMessage>) -> AppResult<String> {
            self.requests.lock().unwrap().push(messages);
            match self.replies.lock().unwrap().pop_front() {
                Some(Some(text)) => Ok(text),
                _ => Err(AppError::Provider("scripted reasoning failure".to_string())),
            }
        }
    }

    struct FakeSynthesis {
        fail: bool,
        spoken: Mutex<Vec<String>>,
    }

    impl FakeSynthesis {
        fn working() -> Self {
            Self {
                fail: false,
                spoken: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl SynthesisProvider for FakeSynthesis {
        async fn synthesize(&self, text: &str, _language_code: &str) -> AppResult<Vec<Vec<u8>>> {
            if self.fail {
                return Err(AppError::Provider("synthesis down".to_string()));
            }
            self.spoken.lock().unwrap().push(text.to_string());
            Ok(vec![pcm_segment(80), pcm_segment(40)])
        }
    }

    fn pcm_segment(samples: usize) -> Vec<u8> {
        let header = wav::Header::new(1, 1, 8000, 16);
        let mut out = Cursor::new(Vec::new());
        wav::write(header, &wav::BitDepth::Sixteen(vec![1000i16; samples]), &mut out).unwrap();
        out.into_inner()
    }

    fn transcript(text: &str) -> TranscriptResult {
        TranscriptResult {
            transcript: text.to_string(),
            language_code: "en-IN".to_string(),
        }
    }

    fn executor() -> ToolExecutor {
        ToolExecutor::new(
            Arc::new(FixtureLedger {
                user: alice(),
                expenses: vec![expense(
                    "Dinner",
                    100.0,
                    "2025-06-01",
                    ("Alice Roy", None),
                    ("Bob Lee", Some("bob@example.com")),
                    false,
                )],
            }),
            Arc::new(RecordingPayment::default()),
        )
    }

    fn pipeline(
        transcription: FakeTranscription,
        reasoning: Arc<ScriptedReasoning>,
        synthesis: Arc<FakeSynthesis>,
    ) -> (ConversationPipeline, Arc<MemoryAuditSink>) {
        let audit = Arc::new(MemoryAuditSink::new());
        (
            ConversationPipeline::new(
                Arc::new(transcription),
                reasoning,
                synthesis,
                executor(),
                audit.clone(),
            ),
            audit,
        )
    }

    #[tokio::test]
    async fn test_failed_transcription_ends_turn_silently() {
        let (pipeline, audit) = pipeline(
            FakeTranscription { result: None },
            Arc::new(ScriptedReasoning::with_replies(vec![Some("unused")])),
            Arc::new(FakeSynthesis::working()),
        );

        let outbound = pipeline.run_turn("MZ1", vec![0u8; 24_001]).await;
        assert!(outbound.is_none());
        // No outbound media was ever recorded
        assert!(audit
            .entries()
            .iter()
            .all(|entry| entry.kind != AuditKind::OutboundMedia));
    }

    #[tokio::test]
    async fn test_plain_reply_turn_emits_companded_payload() {
        let reasoning = Arc::new(ScriptedReasoning::with_replies(vec![Some(
            "You have one unsettled expense with Bob.",
        )]));
        let (pipeline, audit) = pipeline(
            FakeTranscription {
                result: Some(transcript("what do I owe")),
            },
            reasoning.clone(),
            Arc::new(FakeSynthesis::working()),
        );

        let payload = pipeline
            .run_turn("MZ1", vec![0u8; 24_001])
            .await
            .expect("turn should produce audio");

        // Two synthesis segments of 80 and 40 frames compand to 120 bytes
        let companded = BASE64_STANDARD.decode(payload).unwrap();
        assert_eq!(companded.len(), 120);

        // Only one reasoning pass for a conversational answer
        assert_eq!(reasoning.requests.lock().unwrap().len(), 1);
        assert!(audit
            .entries()
            .iter()
            .any(|entry| entry.kind == AuditKind::OutboundMedia));

        // Every intermediate artifact was offered to the audit trail
        let labels = audit.audio_labels();
        assert!(labels.contains(&"turn_input.wav".to_string()));
        assert!(labels.contains(&"tts_output.wav".to_string()));
        assert!(labels.contains(&"outbound_stream.ulaw".to_string()));
    }

    #[tokio::test]
    async fn test_tool_call_runs_second_pass_with_payload() {
        let reasoning = Arc::new(ScriptedReasoning::with_replies(vec![
            Some(r#"{"tool_name": "get_current_user", "parameters": {}}"#),
            Some("You are calling as Alice Roy."),
        ]));
        let (pipeline, audit) = pipeline(
            FakeTranscription {
                result: Some(transcript("who am I")),
            },
            reasoning.clone(),
            Arc::new(FakeSynthesis::working()),
        );

        let payload = pipeline.run_turn("MZ1", vec![0u8; 24_001]).await;
        assert!(payload.is_some());

        let requests = reasoning.requests.lock().unwrap();
        assert_eq!(requests.len(), 2);
        // The narration pass sees the ledger payload
        let narration_tail = &requests[1].last().unwrap().content;
        assert!(narration_tail.contains("alice@example.com"));

        let entries = audit.entries();
        assert!(entries.iter().any(|e| e.kind == AuditKind::ToolCall));
        assert!(entries.iter().any(|e| e.kind == AuditKind::ToolResult));
    }

    #[tokio::test]
    async fn test_unknown_tool_is_narrated_not_raised() {
        let reasoning = Arc::new(ScriptedReasoning::with_replies(vec![
            Some(r#"{"tool_name": "send_rocket", "parameters": {}}"#),
            Some("Sorry, that is not something I can do."),
        ]));
        let (pipeline, _audit) = pipeline(
            FakeTranscription {
                result: Some(transcript("launch a rocket")),
            },
            reasoning.clone(),
            Arc::new(FakeSynthesis::working()),
        );

        let payload = pipeline.run_turn("MZ1", vec![0u8; 24_001]).await;
        assert!(payload.is_some());

        // The error payload reached the narration pass instead of crashing
        let requests = reasoning.requests.lock().unwrap();
        assert!(requests[1]
            .last()
            .unwrap()
            .content
            .contains("unknown_tool"));
    }

    #[tokio::test]
    async fn test_reasoning_failure_degrades_to_apology() {
        let synthesis = Arc::new(FakeSynthesis::working());
        let (pipeline, _audit) = pipeline(
            FakeTranscription {
                result: Some(transcript("pay bob")),
            },
            Arc::new(ScriptedReasoning::with_replies(vec![None])),
            synthesis.clone(),
        );

        let payload = pipeline.run_turn("MZ1", vec![0u8; 24_001]).await;
        // The apology is synthesized and still spoken back
        assert!(payload.is_some());
        let spoken = synthesis.spoken.lock().unwrap();
        assert_eq!(spoken.as_slice(), &[apology_for("en-IN").to_string()]);
    }

    #[tokio::test]
    async fn test_synthesis_failure_ends_turn_silently() {
        let (pipeline, _audit) = pipeline(
            FakeTranscription {
                result: Some(transcript("hello")),
            },
            Arc::new(ScriptedReasoning::with_replies(vec![Some("Hi there.")])),
            Arc::new(FakeSynthesis {
                fail: true,
                spoken: Mutex::new(Vec::new()),
            }),
        );

        assert!(pipeline.run_turn("MZ1", vec![0u8; 24_001]).await.is_none());
    }

    #[tokio::test]
    async fn test_final_turn_only_logs_the_transcript() {
        let (pipeline, audit) = pipeline(
            FakeTranscription {
                result: Some(transcript("goodbye then")),
            },
            Arc::new(ScriptedReasoning::default()),
            Arc::new(FakeSynthesis::working()),
        );

        pipeline.run_final_turn("MZ1", vec![0u8; 500]).await;

        let entries = audit.entries();
        assert!(entries.iter().any(|e| e.kind == AuditKind::FinalTranscript));
        assert!(entries.iter().all(|e| e.kind != AuditKind::OutboundMedia));
    }

    #[test]
    fn test_apology_follows_detected_language() {
        assert!(apology_for("hi-IN").contains("माफ़"));
        assert!(apology_for("en-IN").starts_with("I'm sorry"));
        assert!(apology_for("ta-IN").starts_with("I'm sorry"));
    }
}
