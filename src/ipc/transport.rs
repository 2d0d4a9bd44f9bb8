//! Frame transports for the control-plane router

use crate::error::{Error, Result};
use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc;
use zeromq::{RouterSocket, Socket, SocketRecv, SocketSend, ZmqMessage};

/// A duplex, multi-part message transport
///
/// Inbound messages carry the sender's connection id as their first frame and
/// outbound messages must start with the id of the connection to reply to.
#[async_trait]
pub trait Transport: Send {
    /// Receive the next multi-part message
    async fn recv(&mut self) -> Result<Vec<Bytes>>;

    /// Send a multi-part message
    async fn send(&mut self, frames: Vec<Bytes>) -> Result<()>;
}

/// ZeroMQ ROUTER socket
pub struct ZmqTransport {
    socket: RouterSocket,
}

impl ZmqTransport {
    /// Bind a ROUTER socket to `address` (e.g. `tcp://127.0.0.1:6974`)
    ///
    /// Returns the transport and the resolved endpoint, which differs from
    /// `address` when binding to port 0.
    pub async fn bind(address: &str) -> Result<(Self, String)> {
        let mut socket = RouterSocket::new();
        let endpoint = socket.bind(address).await?;
        Ok((Self { socket }, endpoint.to_string()))
    }
}

#[async_trait]
impl Transport for ZmqTransport {
    async fn recv(&mut self) -> Result<Vec<Bytes>> {
        let message = self.socket.recv().await?;
        Ok(message.into_vec())
    }

    async fn send(&mut self, frames: Vec<Bytes>) -> Result<()> {
        let mut frames = frames.into_iter();
        let Some(first) = frames.next() else {
            return Err(Error::Transport("cannot send an empty message".into()));
        };
        let mut message = ZmqMessage::from(first);
        for frame in frames {
            message.push_back(frame);
        }
        self.socket.send(message).await?;
        Ok(())
    }
}

/// In-process transport backed by channels
///
/// Used to drive a router without sockets. The paired [`ChannelPeer`] plays the
/// role of every connected worker: it injects inbound messages (sender id first)
/// and observes replies.
pub struct ChannelTransport {
    inbound: mpsc::UnboundedReceiver<Vec<Bytes>>,
    outbound: mpsc::UnboundedSender<Vec<Bytes>>,
}

/// Client side of a [`ChannelTransport`]
pub struct ChannelPeer {
    inbound: mpsc::UnboundedSender<Vec<Bytes>>,
    outbound: mpsc::UnboundedReceiver<Vec<Bytes>>,
}

impl ChannelTransport {
    /// Create a connected transport / peer pair
    pub fn pair() -> (ChannelTransport, ChannelPeer) {
        let (in_tx, in_rx) = mpsc::unbounded_channel();
        let (out_tx, out_rx) = mpsc::unbounded_channel();
        (
            ChannelTransport {
                inbound: in_rx,
                outbound: out_tx,
            },
            ChannelPeer {
                inbound: in_tx,
                outbound: out_rx,
            },
        )
    }
}

#[async_trait]
impl Transport for ChannelTransport {
    async fn recv(&mut self) -> Result<Vec<Bytes>> {
        self.inbound
            .recv()
            .await
            .ok_or_else(|| Error::Transport("channel peer disconnected".into()))
    }

    async fn send(&mut self, frames: Vec<Bytes>) -> Result<()> {
        self.outbound
            .send(frames)
            .map_err(|_| Error::Transport("channel peer disconnected".into()))
    }
}

impl ChannelPeer {
    /// Deliver a raw multi-part message to the router
    pub fn send_raw(&self, frames: Vec<Bytes>) -> bool {
        self.inbound.send(frames).is_ok()
    }

    /// Deliver `[sender][empty][tag][args...]`
    pub fn send(&self, sender: &[u8], tag: &str, args: Vec<Bytes>) -> bool {
        let mut frames = vec![
            Bytes::copy_from_slice(sender),
            Bytes::new(),
            Bytes::copy_from_slice(tag.as_bytes()),
        ];
        frames.extend(args);
        self.send_raw(frames)
    }

    /// Wait for the next reply written by the router
    pub async fn recv(&mut self) -> Option<Vec<Bytes>> {
        self.outbound.recv().await
    }

    /// Take a reply if one is already queued
    pub fn try_recv(&mut self) -> Option<Vec<Bytes>> {
        self.outbound.try_recv().ok()
    }
}
