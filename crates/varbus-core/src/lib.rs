//! Core protocol and data model for the varbus variable server.
//!
//! This crate holds everything shared between the daemon and wire-level
//! clients: the typed value model, the variable flag bitmask, the
//! status-code taxonomy, the binary wire framing, and daemon configuration.
//!
//! # Crate Layout
//!
//! - [`value`]: typed values, numeric coercion, and format rendering
//! - [`flags`]: the per-variable flag bitmask
//! - [`status`]: wire-visible status codes
//! - [`wire`]: fixed-header binary framing, request codes, descriptors
//! - [`config`]: TOML daemon configuration
//!
//! The wire protocol is deliberately bespoke: every frame is a fixed
//! 32-byte header optionally followed by a payload whose shape is implied
//! by the request code. See [`wire`] for the layout.

pub mod config;
pub mod flags;
pub mod status;
pub mod value;
pub mod wire;

pub use config::{ConfigError, DaemonConfig};
pub use flags::VarFlags;
pub use status::StatusCode;
pub use value::{VarType, VarValue};
pub use wire::{Frame, FrameCodec, FrameHeader, NotifyKind, RequestCode, WireError};

/// Stable 1-based identity of a variable within a server run.
///
/// Handle 0 is reserved as "invalid"; handles are dense and never reused.
pub type Handle = u32;

/// Reserved invalid handle value.
pub const INVALID_HANDLE: Handle = 0;
