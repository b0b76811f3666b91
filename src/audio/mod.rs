//! # Audio Module
//!
//! Everything between the telephony media stream and the speech services:
//! codec adaptation, turn framing and call session lifecycle.
//!
//! ## Key Components:
//! - **Codec Adapter**: µ-law container framing and 16-bit PCM companding
//! - **Turn Buffer**: frames the continuous inbound stream into bounded turns
//! - **Call Session**: per-stream lifecycle plus the live-stream registry
//!
//! ## Audio Format:
//! The transport carries 8-bit µ-law at 8kHz, mono. Speech services consume
//! and produce 16-bit linear PCM WAV containers at the same rate.

// The websocket session controller is in src/websocket.rs at the root level
pub mod buffer; // Turn framing threshold state machine
pub mod codec; // Container framing and G.711 companding
pub mod session; // Call lifecycle and the live-stream registry
