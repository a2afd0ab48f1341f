//! varbus-daemon: the varbus variable server.
//!
//! The daemon is a local-machine publish/subscribe variable store: client
//! processes register typed named values, read and write them, subscribe
//! to changes, and query them by name/flag/tag. Computed, validated, and
//! rendered variables are serviced by delegate clients; the daemon acts as
//! the correlation broker between requester and delegate.
//!
//! # Architecture
//!
//! ```text
//! ┌───────────────┐   ┌───────────────┐
//! │ local (UDS)   │   │ TCP           │     transport bindings
//! │ transport     │   │ transport     │
//! └───────┬───────┘   └───────┬───────┘
//!         │  ServerEvent      │
//!         └─────────┬─────────┘
//!                   ▼
//!          ┌─────────────────┐
//!          │ dispatcher task │  single owner of all shared state
//!          │ (ServerContext) │
//!          └────────┬────────┘
//!   VariableStore · ClientRegistry · TransactionTable
//!   BlockedRequestQueue · LivenessSweeper · metrics
//! ```
//!
//! All shared state is owned by one dispatcher task fed by an `mpsc`
//! channel; exactly one request is handled at any instant, so none of the
//! tables need locking. A request either completes synchronously or parks
//! its reply slot and is completed later by an unrelated event (the
//! delegate's answer), the only suspension point in the system.

pub mod delegate;
pub mod dispatch;
pub mod events;
pub mod metrics;
pub mod registry;
pub mod state;
pub mod store;
pub mod sweeper;
pub mod transport;
