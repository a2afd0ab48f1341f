//! TCP transport.
//!
//! The connection-oriented binding on the well-known port. Frames are
//! identical to the local transport's; descriptor passing is impossible
//! here, so the render hand-off is refused for TCP peers and the `open`
//! payload carries the client's claimed identity instead of kernel
//! credentials (local-machine trust model: the listener binds loopback
//! only).

use std::io;
use std::net::Ipv4Addr;
use std::os::fd::OwnedFd;

use futures::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_util::codec::Framed;
use tracing::{debug, info, warn};
use varbus_core::{Frame, FrameCodec, WireError};

use super::{ConnIo, drive_connection};
use crate::events::{ServerEvent, TransportKind};

/// Listener for the TCP transport.
pub struct TcpTransport {
    listener: TcpListener,
}

impl TcpTransport {
    /// Binds the well-known port on loopback.
    ///
    /// # Errors
    ///
    /// Returns an error when the bind fails.
    pub async fn bind(port: u16) -> io::Result<Self> {
        let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, port)).await?;
        info!(port, "tcp transport listening");
        Ok(Self { listener })
    }

    /// The bound address (useful when binding port 0).
    ///
    /// # Errors
    ///
    /// Returns an error when the socket has no local address.
    pub fn local_addr(&self) -> io::Result<std::net::SocketAddr> {
        self.listener.local_addr()
    }

    /// Accept loop: one task per connection.
    pub async fn serve(self, events: mpsc::Sender<ServerEvent>) {
        loop {
            match self.listener.accept().await {
                Ok((stream, addr)) => {
                    debug!(%addr, "tcp connection accepted");
                    let events = events.clone();
                    tokio::spawn(async move {
                        drive_connection(TcpIo::new(stream), TransportKind::Tcp, None, events)
                            .await;
                    });
                }
                Err(err) => {
                    warn!(error = %err, "tcp accept failed");
                }
            }
        }
    }
}

/// Framed I/O over a TCP stream.
pub struct TcpIo {
    framed: Framed<TcpStream, FrameCodec>,
}

impl TcpIo {
    /// Wraps an accepted stream.
    #[must_use]
    pub fn new(stream: TcpStream) -> Self {
        Self {
            framed: Framed::new(stream, FrameCodec),
        }
    }
}

impl ConnIo for TcpIo {
    async fn read_frame(&mut self) -> Result<Option<(Frame, Option<OwnedFd>)>, WireError> {
        match self.framed.next().await {
            None => Ok(None),
            Some(Ok(frame)) => Ok(Some((frame, None))),
            Some(Err(err)) => Err(err),
        }
    }

    async fn write_frame(&mut self, frame: Frame, fd: Option<OwnedFd>) -> Result<(), WireError> {
        // Descriptors cannot cross TCP; the dispatcher never produces one
        // for a TCP peer, and a stray one simply closes here.
        drop(fd);
        self.framed.send(frame).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use varbus_core::wire::RequestCode;
    use varbus_core::FrameHeader;

    #[tokio::test]
    async fn frames_roundtrip_over_tcp() {
        let transport = TcpTransport::bind(0).await.unwrap();
        let addr = transport.listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            let (stream, _) = transport.listener.accept().await.unwrap();
            let mut io = TcpIo::new(stream);
            let (frame, fd) = io.read_frame().await.unwrap().unwrap();
            assert!(fd.is_none());
            io.write_frame(frame, None).await.unwrap();
        });

        let stream = TcpStream::connect(addr).await.unwrap();
        let mut io = TcpIo::new(stream);
        let frame = Frame::with_payload(
            FrameHeader::request(RequestCode::Echo.wire(), 1, 7),
            Bytes::from_static(b"ping"),
        );
        io.write_frame(frame, None).await.unwrap();
        let (echoed, _) = io.read_frame().await.unwrap().unwrap();
        assert_eq!(&echoed.payload[..], b"ping");
        assert_eq!(echoed.header.txn_id, 7);

        server.await.unwrap();
    }
}
