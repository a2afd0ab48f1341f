//! Transport bindings.
//!
//! Two parallel bindings feed the same dispatcher: a Unix-domain-socket
//! transport under the runtime directory (kernel-verified peer identity,
//! `SCM_RIGHTS` descriptor passing) and a TCP transport on the well-known
//! port (claimed identity, no descriptors). A connection task only
//! decodes frames and forwards them; all state lives with the dispatcher.
//!
//! Per-client ordering: a connection reads the next request only after
//! the previous one's reply arrives, so at most one request per client is
//! in flight and completion is strictly ordered. The reply wait is
//! unbounded by design: there is no request timeout anywhere in the
//! server.

pub mod local;
pub mod tcp;

use std::os::fd::OwnedFd;
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::sync::{mpsc, oneshot};
use tracing::debug;
use varbus_core::wire::OPEN_FLAG_NOTIFY_CHANNEL;
use varbus_core::{Frame, RequestCode, WireError};

use crate::events::{ConnId, PeerIdentity, PushFrame, ServerEvent, TransportKind};

/// Depth of a client's push-notification queue.
///
/// A subscriber that stops draining its channel loses its subscription at
/// the next delivery attempt, like a dead one.
pub const PUSH_QUEUE_DEPTH: usize = 64;

static NEXT_CONN_ID: AtomicU64 = AtomicU64::new(1);

fn next_conn_id() -> ConnId {
    NEXT_CONN_ID.fetch_add(1, Ordering::Relaxed)
}

/// Frame-level I/O for one connection.
///
/// `read_frame` resolves to `None` on orderly EOF. Descriptors only move
/// on the local transport; the TCP implementation never yields or sends
/// one.
pub trait ConnIo {
    /// Reads the next frame, plus any descriptor received alongside it.
    async fn read_frame(&mut self) -> Result<Option<(Frame, Option<OwnedFd>)>, WireError>;

    /// Writes a frame, attaching a descriptor when the transport can
    /// carry one.
    async fn write_frame(&mut self, frame: Frame, fd: Option<OwnedFd>) -> Result<(), WireError>;
}

/// Drives one accepted connection until EOF or error, then reports the
/// disconnect to the dispatcher.
pub async fn drive_connection<T: ConnIo>(
    mut io: T,
    transport: TransportKind,
    peer: Option<PeerIdentity>,
    events: mpsc::Sender<ServerEvent>,
) {
    let conn = next_conn_id();
    debug!(conn, transport = transport.name(), "connection accepted");
    if let Err(err) = connection_loop(&mut io, conn, transport, peer, &events).await {
        debug!(conn, error = %err, "connection terminated with error");
    }
    let _ = events.send(ServerEvent::Disconnected { conn }).await;
}

async fn connection_loop<T: ConnIo>(
    io: &mut T,
    conn: ConnId,
    transport: TransportKind,
    peer: Option<PeerIdentity>,
    events: &mpsc::Sender<ServerEvent>,
) -> Result<(), WireError> {
    loop {
        let Some((frame, fd)) = io.read_frame().await? else {
            return Ok(());
        };
        let header = frame.header;

        // An `open` with the notify flag turns this connection into the
        // client's push channel.
        if header.code == RequestCode::Open.wire()
            && header.param1 & OPEN_FLAG_NOTIFY_CHANNEL != 0
        {
            drop(fd);
            let (push_tx, push_rx) = mpsc::channel(PUSH_QUEUE_DEPTH);
            let (reply_tx, reply_rx) = oneshot::channel();
            let event = ServerEvent::NotifyAttach {
                conn,
                peer,
                frame,
                chan: push_tx,
                reply: reply_tx,
            };
            if events.send(event).await.is_err() {
                return Ok(());
            }
            let Ok(resp) = reply_rx.await else {
                return Ok(());
            };
            let accepted = resp.status.is_success();
            let client_id = resp.param1;
            io.write_frame(resp.to_frame(&header), None).await?;
            if accepted {
                return pump_pushes(io, client_id, push_rx).await;
            }
            continue;
        }

        let (reply_tx, reply_rx) = oneshot::channel();
        let event = ServerEvent::Request {
            conn,
            transport,
            peer,
            frame,
            fd,
            reply: reply_tx,
        };
        if events.send(event).await.is_err() {
            return Ok(());
        }
        // A deferred request completes whenever the delegate answers;
        // this wait is unbounded on purpose.
        let Ok(mut resp) = reply_rx.await else {
            return Ok(());
        };
        let fd = resp.fd.take();
        io.write_frame(resp.to_frame(&header), fd).await?;
    }
}

/// Forwards push frames to an attached notify channel.
///
/// Teardown is lazy: a closed peer is noticed at the next write, which
/// fails and ends the task; the dispatcher then clears the registration's
/// channel on the disconnect event.
async fn pump_pushes<T: ConnIo>(
    io: &mut T,
    client_id: u32,
    mut pushes: mpsc::Receiver<PushFrame>,
) -> Result<(), WireError> {
    while let Some(push) = pushes.recv().await {
        io.write_frame(push.to_frame(client_id), None).await?;
    }
    Ok(())
}
