//! Realtime channel for live session updates.
//!
//! This module provides:
//! - A provider seam ([`RealtimeBackend`]) and a WebSocket implementation of it
//! - The per-session transport that narrows frames into typed events
//! - The connection state machine with bounded manual reconnect
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────┐
//! │              RealtimeConnection              │
//! │   (ConnectionStatus + manual reconnect)      │
//! └──────────────────────────────────────────────┘
//!                        │
//!                        ▼
//!               ┌─────────────────┐
//!               │ SessionChannel  │  frames -> SessionEvent / presence
//!               └─────────────────┘
//!                        │
//!                        ▼
//!               ┌─────────────────┐
//!               │ RealtimeBackend │  (RealtimeSocket over WebSocket)
//!               └─────────────────┘
//! ```
//!
//! The channel never writes to the session store. Whoever builds the
//! connection decides what an event does (see [`crate::SessionSync`]).

mod backend;
mod channel;
mod connection;
mod socket;

pub use backend::{
    ChannelFrame, ChannelHandle, JoinOptions, JoinedChannel, RealtimeBackend, TableFilter, TrackStatus,
};
pub use channel::{ChannelHandlers, EventHandler, OpenParams, PresenceHandler, SessionChannel, StatusHandler};
pub use connection::{
    ConnectionState, ConnectionStatus, RealtimeConnection, ReconnectConfig, ReconnectDecision,
    CHANNEL_ERROR_MESSAGE, TIMED_OUT_MESSAGE,
};
pub use socket::{PresenceTracker, RealtimeSocket};
