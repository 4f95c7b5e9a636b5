//! # tether-core
//!
//! Typed request/response and event channel between a privileged controller
//! and sandboxed UI contexts.
//!
//! ## Architecture
//!
//! ```text
//! UI context                                   Controller
//! ──────────                                   ──────────
//! Bridge::invoke ──request(callId)──► Link ──► RequestDispatcher ──► handler task
//!        ▲                                            │
//!        └────────────response(callId)◄───────────────┘
//! Bridge::send   ──request(no id)───► Link ──► listener task
//! Bridge::on     ──subscribe────────► Link ──► EventEmitter interest set
//!        ▲                                            │
//!        └────────────event◄──────── broadcast/unicast┘
//! ```
//!
//! Every envelope is checked against the [`ChannelRegistry`] allow-list. The
//! registry is built once at startup and frozen when handed to the
//! [`Controller`].

#![forbid(unsafe_code)]
#![warn(clippy::all)]

pub mod bridge;
pub mod channel;
pub mod config;
pub mod controller;
pub mod error;
pub mod ipc;

// Convenience re-exports for downstream crates
pub use bridge::{Bridge, Subscription};
pub use channel::{ChannelRegistry, ChannelSpec, Direction, Shape};
pub use config::{BridgeConfig, ControllerConfig};
pub use controller::{Controller, RequestContext};
pub use error::{HandlerError, TetherError};
pub use ipc::envelope::{CallId, ContextId, Envelope, EnvelopeKind, ErrorPayload};
pub use ipc::Link;
