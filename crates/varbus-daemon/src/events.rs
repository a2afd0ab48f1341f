//! Events flowing from the transports into the dispatcher task, and the
//! reply/push types flowing back out.
//!
//! A transport connection task never touches shared state; it decodes
//! frames, forwards them as [`ServerEvent`]s, and writes whatever comes
//! back on its reply channel. Deferred completion works by parking the
//! reply sender server-side and fulfilling it from a later event.

use std::os::fd::OwnedFd;

use bytes::Bytes;
use tokio::sync::{mpsc, oneshot};
use varbus_core::wire::{PushCode, value_bytes};
use varbus_core::{Frame, FrameHeader, Handle, NotifyKind, StatusCode, VarValue};

/// Connection identity, unique per accepted connection for the lifetime
/// of the server.
pub type ConnId = u64;

/// Which transport binding a connection arrived on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportKind {
    /// Unix-domain socket under the runtime directory.
    Local,
    /// TCP on the well-known port.
    Tcp,
}

impl TransportKind {
    /// Short stable name for logs.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Local => "local",
            Self::Tcp => "tcp",
        }
    }
}

/// Kernel-verified peer identity, available on the local transport only.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PeerIdentity {
    /// Peer process id.
    pub pid: u32,
    /// Peer group id.
    pub gid: u32,
}

/// A completed (or rejected) request, ready to be written back.
#[derive(Debug)]
pub struct Response {
    /// Wire status code.
    pub status: StatusCode,
    /// First generic response field.
    pub param1: u32,
    /// Second generic response field.
    pub param2: u32,
    /// Response payload.
    pub payload: Bytes,
    /// Descriptor passed back via `SCM_RIGHTS` (local transport only;
    /// carries the requester's output descriptor to a render delegate).
    pub fd: Option<OwnedFd>,
}

impl Response {
    /// A payload-less response with just a status.
    #[must_use]
    pub const fn status(status: StatusCode) -> Self {
        Self {
            status,
            param1: 0,
            param2: 0,
            payload: Bytes::new(),
            fd: None,
        }
    }

    /// An `Ok` response carrying a payload.
    #[must_use]
    pub const fn payload(payload: Bytes) -> Self {
        Self {
            status: StatusCode::Ok,
            param1: 0,
            param2: 0,
            payload,
            fd: None,
        }
    }

    /// An `Ok` response carrying generic fields.
    #[must_use]
    pub const fn params(param1: u32, param2: u32) -> Self {
        Self {
            status: StatusCode::Ok,
            param1,
            param2,
            payload: Bytes::new(),
            fd: None,
        }
    }

    /// Builds the wire frame for this response, mirroring the request
    /// header. The descriptor (if any) stays with the caller for
    /// ancillary transmission.
    #[must_use]
    pub fn to_frame(&self, request: &FrameHeader) -> Frame {
        let mut frame = Frame::response(request, self.status);
        frame.header.param1 = self.param1;
        frame.header.param2 = self.param2;
        frame.payload = self.payload.clone();
        frame
    }
}

/// Server-to-client push delivered over the client's notify channel.
#[derive(Debug, Clone)]
pub enum PushFrame {
    /// A subscribed variable changed.
    Modified {
        /// Handle of the changed variable.
        handle: Handle,
        /// The freshly stored value.
        value: VarValue,
    },
    /// A delegate is being asked to service a request.
    Signal {
        /// Notification kind being delegated.
        kind: NotifyKind,
        /// Handle of the variable.
        handle: Handle,
        /// Correlation transaction id.
        txn_id: u32,
    },
}

impl PushFrame {
    /// Encodes the push as a wire frame addressed to `client_id`.
    #[must_use]
    pub fn to_frame(&self, client_id: u32) -> Frame {
        match self {
            Self::Modified { handle, value } => {
                let mut header = FrameHeader::request(PushCode::Modified.wire(), client_id, 0);
                header.param1 = *handle;
                Frame::with_payload(header, value_bytes(value))
            }
            Self::Signal {
                kind,
                handle,
                txn_id,
            } => {
                let mut header = FrameHeader::request(PushCode::Signal.wire(), client_id, *txn_id);
                header.param1 = *handle;
                header.param2 = kind.wire();
                Frame::new(header)
            }
        }
    }
}

/// One event on the dispatcher's input channel.
#[derive(Debug)]
pub enum ServerEvent {
    /// A decoded request frame from a connection.
    Request {
        /// Originating connection.
        conn: ConnId,
        /// Transport the connection arrived on.
        transport: TransportKind,
        /// Kernel-verified peer identity (local transport).
        peer: Option<PeerIdentity>,
        /// The request frame.
        frame: Frame,
        /// Descriptor received via `SCM_RIGHTS` alongside the frame.
        fd: Option<OwnedFd>,
        /// Reply slot; parked server-side when the request defers.
        reply: oneshot::Sender<Response>,
    },
    /// A connection asked to become its client's push notification
    /// channel (an `open` with the notify flag, issued out of band).
    NotifyAttach {
        /// Originating connection.
        conn: ConnId,
        /// Kernel-verified peer identity (local transport).
        peer: Option<PeerIdentity>,
        /// The `open` frame.
        frame: Frame,
        /// Sender the dispatcher will push frames into.
        chan: mpsc::Sender<PushFrame>,
        /// Reply slot for the attach acknowledgement.
        reply: oneshot::Sender<Response>,
    },
    /// A connection went away (EOF or I/O error).
    Disconnected {
        /// The closed connection.
        conn: ConnId,
    },
}
