//! Beacon Satellite - Wyoming voice satellite daemon
//!
//! A long-lived edge process bridging a local audio endpoint (microphone
//! capture, speaker playback, optional local wake word detection) to a
//! remote voice-assistant server over the Wyoming protocol.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────┐   ┌──────────────────────────────┐   ┌──────────┐
//! │ mic peer ├──▶│          satellite           │◀──┤  server  │
//! └──────────┘   │  mic pipeline ─ state machine│   └──────────┘
//! ┌──────────┐   │  wake coordinator ─ fan-out  │   ┌──────────┐
//! │ snd peer │◀──┤  snd pipeline ─ timers       ├──▶│event peer│
//! └──────────┘   └──────────────────────────────┘   └──────────┘
//! ```
//!
//! Every collaborator is an independent, reconnecting peer; one state
//! machine actor linearizes the session lifecycle.

pub mod audio;
pub mod config;
pub mod daemon;
pub mod discovery;
pub mod dsp;
pub mod error;
pub mod events;
pub mod hooks;
pub mod mic;
pub mod peer;
pub mod protocol;
pub mod satellite;
pub mod server;
pub mod snd;
pub mod timers;
pub mod vad;
pub mod wake;

pub use config::{Config, SatelliteMode};
pub use daemon::Daemon;
pub use error::{Error, Result};
pub use events::LifecycleEvent;
pub use satellite::{Satellite, SatelliteIo, ServerNotice, SessionState};
