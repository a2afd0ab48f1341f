//! Local transport: Unix-domain socket with descriptor passing.
//!
//! This is the redesign of the original shared-memory-plus-signal
//! transport: an ordinary synchronous request/response over a local
//! socket, preserving its invariants (one in-flight request per client,
//! strictly ordered completion, no timeout). Peer identity comes from
//! `SO_PEERCRED`, never from the client's claim, and frames may carry one
//! `SCM_RIGHTS` descriptor; the render hand-off moves the requester's
//! output descriptor to the delegate this way.

use std::collections::VecDeque;
use std::io::{self, IoSlice, IoSliceMut};
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use bytes::BytesMut;
use nix::sys::socket::{ControlMessage, ControlMessageOwned, MsgFlags, recvmsg, sendmsg};
use tokio::io::Interest;
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::mpsc;
use tracing::{info, warn};
use varbus_core::{Frame, WireError};

use super::{ConnIo, drive_connection};
use crate::events::{PeerIdentity, ServerEvent, TransportKind};

/// Socket file mode: any local user may connect; permission enforcement
/// is the per-variable group-id check.
const SOCKET_MODE: u32 = 0o666;

/// Read chunk size.
const READ_CHUNK: usize = 8192;

/// At most one descriptor accompanies a frame.
const MAX_FDS_PER_FRAME: usize = 1;

/// Listener for the local transport.
pub struct LocalTransport {
    listener: UnixListener,
    path: PathBuf,
}

impl LocalTransport {
    /// Binds the socket, replacing a stale file from a previous run.
    ///
    /// # Errors
    ///
    /// Returns an error when the bind or permission change fails.
    pub fn bind(path: &Path) -> io::Result<Self> {
        match std::fs::remove_file(path) {
            Ok(()) => info!(path = %path.display(), "removed stale socket"),
            Err(err) if err.kind() == io::ErrorKind::NotFound => {}
            Err(err) => return Err(err),
        }
        let listener = UnixListener::bind(path)?;
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(SOCKET_MODE))?;
        info!(path = %path.display(), "local transport listening");
        Ok(Self {
            listener,
            path: path.to_path_buf(),
        })
    }

    /// Path the listener is bound to.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Accept loop: one task per connection.
    pub async fn serve(self, events: mpsc::Sender<ServerEvent>) {
        loop {
            match self.listener.accept().await {
                Ok((stream, _addr)) => {
                    let peer = peer_identity(&stream);
                    if peer.is_none() {
                        warn!("dropping connection without peer credentials");
                        continue;
                    }
                    let events = events.clone();
                    tokio::spawn(async move {
                        drive_connection(LocalIo::new(stream), TransportKind::Local, peer, events)
                            .await;
                    });
                }
                Err(err) => {
                    warn!(error = %err, "local accept failed");
                }
            }
        }
    }
}

/// Kernel-verified identity of the connecting process.
fn peer_identity(stream: &UnixStream) -> Option<PeerIdentity> {
    let cred = stream.peer_cred().ok()?;
    let pid = cred.pid()?;
    #[allow(clippy::cast_sign_loss)]
    Some(PeerIdentity {
        pid: pid as u32,
        gid: cred.gid(),
    })
}

/// Frame I/O over a Unix stream, hand-rolled so ancillary descriptors
/// can ride along with frame bytes.
pub struct LocalIo {
    stream: UnixStream,
    inbuf: BytesMut,
    fds: VecDeque<OwnedFd>,
}

impl LocalIo {
    /// Wraps an accepted stream.
    #[must_use]
    pub fn new(stream: UnixStream) -> Self {
        Self {
            stream,
            inbuf: BytesMut::with_capacity(READ_CHUNK),
            fds: VecDeque::new(),
        }
    }
}

impl ConnIo for LocalIo {
    async fn read_frame(&mut self) -> Result<Option<(Frame, Option<OwnedFd>)>, WireError> {
        loop {
            if let Some(frame) = Frame::parse(&mut self.inbuf)? {
                // At most one request is in flight per connection, so any
                // descriptor received while this frame accumulated
                // belongs to it.
                return Ok(Some((frame, self.fds.pop_front())));
            }
            self.stream.readable().await?;
            let raw = self.stream.as_raw_fd();
            let mut chunk = [0u8; READ_CHUNK];
            match self
                .stream
                .try_io(Interest::READABLE, || recv_with_fds(raw, &mut chunk))
            {
                Ok((0, _)) => {
                    // EOF; a partial frame in the buffer dies with the
                    // connection.
                    return Ok(None);
                }
                Ok((n, fds)) => {
                    self.inbuf.extend_from_slice(&chunk[..n]);
                    self.fds.extend(fds);
                }
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => {}
                Err(err) => return Err(err.into()),
            }
        }
    }

    async fn write_frame(&mut self, frame: Frame, fd: Option<OwnedFd>) -> Result<(), WireError> {
        let mut out = BytesMut::with_capacity(frame.encoded_len());
        frame.encode(&mut out);
        let mut sent = 0;
        // The descriptor rides with the first byte written; ownership
        // stays here and the local copy closes on return.
        let mut pending_fd = fd;
        while sent < out.len() {
            self.stream.writable().await?;
            let raw = self.stream.as_raw_fd();
            let fd_ref = pending_fd.as_ref().map(AsRawFd::as_raw_fd);
            match self
                .stream
                .try_io(Interest::WRITABLE, || send_with_fd(raw, &out[sent..], fd_ref))
            {
                Ok(n) => {
                    sent += n;
                    if n > 0 {
                        pending_fd = None;
                    }
                }
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => {}
                Err(err) => return Err(err.into()),
            }
        }
        Ok(())
    }
}

/// One `recvmsg` with space for ancillary descriptors.
fn recv_with_fds(fd: RawFd, buf: &mut [u8]) -> io::Result<(usize, Vec<OwnedFd>)> {
    let mut cmsg_buf = nix::cmsg_space!([RawFd; MAX_FDS_PER_FRAME]);
    let mut iov = [IoSliceMut::new(buf)];
    let msg = recvmsg::<()>(
        fd,
        &mut iov,
        Some(&mut cmsg_buf),
        MsgFlags::MSG_CMSG_CLOEXEC,
    )
    .map_err(io::Error::from)?;
    let mut fds = Vec::new();
    if let Ok(cmsgs) = msg.cmsgs() {
        for cmsg in cmsgs {
            if let ControlMessageOwned::ScmRights(received) = cmsg {
                for raw in received {
                    // SAFETY: the kernel just delivered this descriptor to
                    // us; it is open and owned by nobody else.
                    fds.push(unsafe { OwnedFd::from_raw_fd(raw) });
                }
            }
        }
    }
    Ok((msg.bytes, fds))
}

/// One `sendmsg`, attaching a descriptor when provided.
fn send_with_fd(fd: RawFd, data: &[u8], send_fd: Option<RawFd>) -> io::Result<usize> {
    let iov = [IoSlice::new(data)];
    match send_fd {
        Some(raw) => {
            let fds = [raw];
            let cmsgs = [ControlMessage::ScmRights(&fds)];
            sendmsg::<()>(fd, &iov, &cmsgs, MsgFlags::empty(), None).map_err(io::Error::from)
        }
        None => sendmsg::<()>(fd, &iov, &[], MsgFlags::empty(), None).map_err(io::Error::from),
    }
}
