//! UDP encapsulation.
//!
//! Each Ethernet frame travels as one UDP datagram. Hardware addresses are
//! mapped to socket addresses by a route table filled by the application;
//! broadcast frames go to every known route.
//!
//! [`UdpLink::bind`] returns the sending half, which is handed to the
//! [`Nic`], and a [`UdpDriver`] that owns the socket and must be run once
//! the NIC exists.

use crate::core::codec::FrameCodec;
use crate::core::packet::MacAddr;
use crate::error::{constants, MalformedKind, MxError, Result};
use crate::protocol::Nic;
use crate::transport::FrameSink;
use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, RwLock};
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio_util::udp::UdpFramed;
use tracing::{debug, info, instrument, trace, warn};

type RouteTable = Arc<RwLock<HashMap<MacAddr, SocketAddr>>>;

/// Constructor namespace for the UDP link.
pub struct UdpLink;

impl UdpLink {
    /// Bind a socket and split it into a sink and a driver.
    #[instrument]
    pub async fn bind(addr: SocketAddr) -> Result<(UdpSink, UdpDriver)> {
        let socket = UdpSocket::bind(addr).await?;
        let local = socket.local_addr()?;
        info!(target: "mx::transport", address = %local, "UDP link bound");

        let routes: RouteTable = Arc::new(RwLock::new(HashMap::new()));
        let (tx, rx) = mpsc::unbounded_channel();
        Ok((UdpSink { routes, tx }, UdpDriver { socket, rx, local }))
    }
}

/// Sending half: resolves the destination and queues the datagram.
#[derive(Debug, Clone)]
pub struct UdpSink {
    routes: RouteTable,
    tx: mpsc::UnboundedSender<(Bytes, SocketAddr)>,
}

impl UdpSink {
    pub fn add_route(&self, mac: MacAddr, addr: SocketAddr) -> Result<()> {
        self.routes.write()?.insert(mac, addr);
        Ok(())
    }

    pub fn remove_route(&self, mac: MacAddr) -> Result<()> {
        self.routes.write()?.remove(&mac);
        Ok(())
    }

    fn queue(&self, frame: Bytes, addr: SocketAddr) -> Result<()> {
        self.tx
            .send((frame, addr))
            .map_err(|_| MxError::Transport("UDP driver stopped".to_string()))
    }
}

impl FrameSink for UdpSink {
    fn send(&self, frame: Bytes) -> Result<()> {
        if frame.len() < 6 {
            return Err(MxError::MalformedPacket(MalformedKind::Truncated));
        }
        let mut dst = [0u8; 6];
        dst.copy_from_slice(&frame[..6]);
        let dst = MacAddr(dst);

        let targets: Vec<SocketAddr> = {
            let routes = self.routes.read()?;
            if dst.is_broadcast() {
                routes.values().copied().collect()
            } else {
                let addr = routes.get(&dst).copied().ok_or_else(|| {
                    MxError::Transport(format!("{}: {dst}", constants::ERR_UNKNOWN_DESTINATION))
                })?;
                vec![addr]
            }
        };
        for addr in targets {
            self.queue(frame.clone(), addr)?;
        }
        Ok(())
    }
}

/// Owns the socket; pumps outbound datagrams and feeds inbound frames to a NIC.
#[derive(Debug)]
pub struct UdpDriver {
    socket: UdpSocket,
    rx: mpsc::UnboundedReceiver<(Bytes, SocketAddr)>,
    local: SocketAddr,
}

impl UdpDriver {
    pub fn local_addr(&self) -> SocketAddr {
        self.local
    }

    /// Run until `shutdown` fires or every sink is dropped.
    #[instrument(skip_all, fields(address = %self.local))]
    pub async fn run(self, nic: Arc<Nic>, mut shutdown: mpsc::Receiver<()>) -> Result<()> {
        let UdpDriver { socket, mut rx, .. } = self;
        let (mut sink, mut stream) =
            UdpFramed::new(socket, FrameCodec).split::<(Bytes, SocketAddr)>();

        loop {
            tokio::select! {
                _ = shutdown.recv() => {
                    info!(target: "mx::transport", "UDP driver shutting down");
                    break;
                }

                outbound = rx.recv() => match outbound {
                    Some((frame, addr)) => {
                        if let Err(e) = sink.send((frame, addr)).await {
                            nic.metrics().send_error();
                            warn!(target: "mx::transport", peer = %addr, error = %e, "Datagram send failed");
                        }
                    }
                    None => {
                        debug!(target: "mx::transport", "All UDP sinks dropped");
                        break;
                    }
                },

                inbound = stream.next() => match inbound {
                    Some(Ok((frame, from))) => {
                        trace!(target: "mx::transport", peer = %from, "Datagram received");
                        nic.handle_decoded(frame);
                    }
                    Some(Err(MxError::Io(e))) => {
                        warn!(target: "mx::transport", error = %e, "UDP receive failed");
                    }
                    Some(Err(e)) => nic.record_malformed(&e),
                    None => break,
                },
            }
        }
        Ok(())
    }
}
