//! # umbrella-sfu: selective forwarding for mesh media
//!
//! A selective forwarding unit routes real-time media without touching the
//! payload: every track published by one participant is fanned out to every
//! other participant. Nodes trunk to each other and to RTSP cameras, so a
//! client connected anywhere in the mesh sees every track published
//! everywhere.
//!
//! The crate is the orchestration core:
//! - a per-participant state machine negotiating two media sessions and
//!   driving renegotiation idempotently,
//! - the node-wide routing table reacting to joins, leaves and track
//!   lifecycle,
//! - the packet-level forwarding path with receiver-side loss detection and
//!   NACK emission,
//! - the time-ordered mailbox and actor loop everything above runs on.
//!
//! The ICE/DTLS/SRTP stack, the camera client library and the discovery
//! resolver are consumed behind seams; see [SessionFactory],
//! [CameraConnector] and [Resolve].

mod camera;
mod controller;
mod error;
mod fanout;
mod participant;
mod resolver;
mod ring;
mod session;
mod signal;
mod status;
mod track;
mod webrtc_session;

pub mod actor;
pub mod coding;

#[cfg(test)]
pub(crate) mod testutil;

pub use camera::*;
pub use controller::*;
pub use error::*;
pub use fanout::nack_pairs;
pub use participant::*;
pub use resolver::*;
pub use ring::*;
pub use session::*;
pub use signal::*;
pub use status::*;
pub use track::*;
pub use webrtc_session::*;
