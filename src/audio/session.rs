//! # Call Session Management
//!
//! Tracks the lifecycle of one telephony media stream and the process-wide
//! registry of streams that are currently live.
//!
//! ## Session Lifecycle:
//! 1. **AwaitingStart**: websocket connected, waiting for the transport's
//!    start event to learn the stream SID
//! 2. **Active**: media events are flowing and turns can be dispatched
//! 3. **Closing**: stop received or the peer vanished; only the residual
//!    flush may still run
//!
//! A `CallSession` is owned exclusively by its websocket actor - all
//! mutation happens on that actor's sequential handling path, which is what
//! guarantees at most one turn in flight per call. The shared `CallRegistry`
//! only tracks which SIDs are live so limits and health reporting work.

use crate::audio::buffer::TurnBuffer;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::RwLock;

/// Lifecycle state of a call session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallState {
    /// Connected, no start event yet
    AwaitingStart,
    /// Stream SID known, media flowing
    Active,
    /// Tearing down; inbound media is ignored
    Closing,
}

/// One active media stream and its turn framing state.
#[derive(Debug)]
pub struct CallSession {
    stream_sid: String,
    state: CallState,
    buffer: TurnBuffer,
    turns_dispatched: u64,
}

impl CallSession {
    /// Create a session awaiting its start event.
    pub fn new(turn_threshold: usize) -> Self {
        Self {
            stream_sid: String::new(),
            state: CallState::AwaitingStart,
            buffer: TurnBuffer::new(turn_threshold),
            turns_dispatched: 0,
        }
    }

    /// The transport announced the stream: record its SID and go active.
    pub fn activate(&mut self, stream_sid: String) -> Result<(), String> {
        match self.state {
            CallState::AwaitingStart => {
                self.stream_sid = stream_sid;
                self.state = CallState::Active;
                Ok(())
            }
            _ => Err(format!(
                "cannot start stream from state {:?}",
                self.state
            )),
        }
    }

    /// Enter teardown. Safe to call from any state.
    pub fn begin_close(&mut self) {
        self.state = CallState::Closing;
    }

    pub fn state(&self) -> CallState {
        self.state
    }

    /// The SID issued by the transport; empty until activated.
    pub fn stream_sid(&self) -> &str {
        &self.stream_sid
    }

    /// Buffer one inbound media fragment. Only active sessions accept audio.
    pub fn accept_media(&mut self, companded: &[u8]) -> Result<(), String> {
        match self.state {
            CallState::Active => {
                self.buffer.extend(companded);
                Ok(())
            }
            other => Err(format!("media event in state {:?}", other)),
        }
    }

    /// Take the next ready turn, if the buffer threshold has been crossed.
    pub fn next_turn(&mut self) -> Option<Vec<u8>> {
        let turn = self.buffer.take_ready_turn()?;
        self.turns_dispatched += 1;
        Some(turn)
    }

    /// Drain buffered residual audio for the best-effort final turn.
    pub fn residual(&mut self) -> Option<Vec<u8>> {
        self.buffer.drain_residual()
    }

    pub fn buffered_bytes(&self) -> usize {
        self.buffer.len()
    }

    pub fn turns_dispatched(&self) -> u64 {
        self.turns_dispatched
    }
}

/// Metadata the registry keeps per live stream.
#[derive(Debug, Clone)]
struct CallInfo {
    connected_at: DateTime<Utc>,
}

/// Process-wide registry of live call sessions, keyed by stream SID.
///
/// Uses RwLock so health endpoints can read counts while sessions register
/// and deregister. Sessions themselves are not stored here - each one is
/// owned by its websocket actor.
#[derive(Debug)]
pub struct CallRegistry {
    active: RwLock<HashMap<String, CallInfo>>,
    max_concurrent_calls: usize,
}

impl CallRegistry {
    pub fn new(max_concurrent_calls: usize) -> Self {
        Self {
            active: RwLock::new(HashMap::new()),
            max_concurrent_calls,
        }
    }

    /// Register a stream going active.
    ///
    /// Fails when the concurrency limit is reached or the SID is already
    /// registered (the transport should never reuse a live SID).
    pub fn register(&self, stream_sid: &str) -> Result<(), String> {
        let mut active = self.active.write().unwrap();

        if active.len() >= self.max_concurrent_calls {
            return Err(format!(
                "maximum concurrent calls ({}) reached",
                self.max_concurrent_calls
            ));
        }
        if active.contains_key(stream_sid) {
            return Err(format!("stream '{}' is already registered", stream_sid));
        }

        active.insert(
            stream_sid.to_string(),
            CallInfo {
                connected_at: Utc::now(),
            },
        );
        Ok(())
    }

    /// Remove a stream at teardown. Returns whether it was present.
    pub fn deregister(&self, stream_sid: &str) -> bool {
        self.active.write().unwrap().remove(stream_sid).is_some()
    }

    pub fn active_call_count(&self) -> usize {
        self.active.read().unwrap().len()
    }

    pub fn max_concurrent_calls(&self) -> usize {
        self.max_concurrent_calls
    }

    /// SIDs of every live stream, oldest first.
    pub fn active_stream_sids(&self) -> Vec<String> {
        let active = self.active.read().unwrap();
        let mut entries: Vec<(&String, &CallInfo)> = active.iter().collect();
        entries.sort_by_key(|(_, info)| info.connected_at);
        entries.into_iter().map(|(sid, _)| sid.clone()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_lifecycle() {
        let mut session = CallSession::new(100);
        assert_eq!(session.state(), CallState::AwaitingStart);

        // Media before start is refused
        assert!(session.accept_media(&[0u8; 10]).is_err());

        session.activate("MZabc".to_string()).unwrap();
        assert_eq!(session.state(), CallState::Active);
        assert_eq!(session.stream_sid(), "MZabc");

        // Double start is a protocol violation
        assert!(session.activate("MZother".to_string()).is_err());

        session.begin_close();
        assert!(session.accept_media(&[0u8; 10]).is_err());
    }

    #[test]
    fn test_turn_dispatch_counts() {
        let mut session = CallSession::new(10);
        session.activate("MZabc".to_string()).unwrap();

        session.accept_media(&[1u8; 6]).unwrap();
        assert!(session.next_turn().is_none());
        session.accept_media(&[1u8; 6]).unwrap();

        let turn = session.next_turn().expect("turn ready");
        assert_eq!(turn.len(), 12);
        assert_eq!(session.turns_dispatched(), 1);
        assert_eq!(session.buffered_bytes(), 0);
    }

    #[test]
    fn test_residual_flush() {
        let mut session = CallSession::new(1000);
        session.activate("MZabc".to_string()).unwrap();
        session.accept_media(&[5u8; 300]).unwrap();
        session.begin_close();

        let residual = session.residual().expect("residual audio");
        assert_eq!(residual.len(), 300);
        assert!(session.residual().is_none());
    }

    #[test]
    fn test_registry_enforces_limit_and_uniqueness() {
        let registry = CallRegistry::new(2);

        registry.register("MZ1").unwrap();
        registry.register("MZ2").unwrap();
        assert_eq!(registry.active_call_count(), 2);

        // Limit reached
        assert!(registry.register("MZ3").is_err());

        // Duplicate SID refused even below the limit
        assert!(registry.deregister("MZ1"));
        registry.register("MZ2").unwrap_err();

        registry.register("MZ3").unwrap();
        assert_eq!(registry.active_call_count(), 2);
    }

    #[test]
    fn test_registry_deregister_is_idempotent() {
        let registry = CallRegistry::new(4);
        registry.register("MZ1").unwrap();
        assert!(registry.deregister("MZ1"));
        assert!(!registry.deregister("MZ1"));
        assert_eq!(registry.active_call_count(), 0);
    }
}
