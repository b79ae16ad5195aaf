//! Connection to a circuit's live timing feed
//!
//! ```text
//!                     ┌────────────── TelemetryConnectionManager ──────────────┐
//! Transport ──frames──► Driver task ──► Envelope::parse ──► merge into KartCache │
//!                     │   keepalive        │                    │               │
//!                     │   reconnect loop   └─ malformed: count  ├─► LapDetector │
//!                     │                                         └─► broadcast   │
//!                     └─────────────────────────────────────────────────────────┘
//! ```
//!
//! State machine:
//!
//! ```text
//! Disconnected ──connect──► Connecting ──ok──► Connected
//!       ▲                       │                  │ error / close
//!       │◄──────fail────────────┘                  ▼
//!       │◄──attempts exhausted── Connecting ◄── Reconnecting(n)
//! ```
//!
//! A manual `disconnect()` returns to `Disconnected` from any state and
//! clears the kart cache, column order and lap counters.

mod envelope;
mod manager;

#[cfg(test)]
mod tests;

pub use envelope::{Envelope, KART_ID_FIELDS};
pub(crate) use manager::Shared;
pub use manager::TelemetryConnectionManager;
