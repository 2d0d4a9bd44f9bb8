//! Message router
//!
//! A router owns one transport and a dedicated event-loop task. Every inbound
//! message with at least four frames is split into an [`Envelope`] and handed
//! to the [`MessageHandler`] synchronously on that task, so messages from one
//! connection are handled in arrival order. Replies go through a [`Replier`],
//! which may be cloned into spawned tasks to answer later.

use super::protocol::{Envelope, Reply};
use super::transport::{Transport, ZmqTransport};
use crate::error::Result;
use bytes::Bytes;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Longest a single reply may hold up the event loop
const REPLY_SEND_TIMEOUT: Duration = Duration::from_secs(5);

/// Handler invoked for each well-formed inbound message
///
/// Runs on the router's event loop and must not block; long-running work is
/// spawned and answered later through a cloned [`Replier`].
pub trait MessageHandler: Send + Sync + 'static {
    /// Handle one message
    fn handle(&self, envelope: Envelope, replier: &Replier);
}

/// Writes correlated replies back through the router's transport
#[derive(Clone)]
pub struct Replier {
    router: Arc<str>,
    outbound: mpsc::UnboundedSender<Vec<Bytes>>,
}

impl Replier {
    /// Reply to `sender` with `[sender][empty][tag][payload]`
    ///
    /// Returns false if the router has already closed.
    pub fn reply(&self, sender: &Bytes, tag: &str, reply: Reply) -> bool {
        let frames = Envelope::reply(sender, tag, reply.encode());
        if self.outbound.send(frames).is_err() {
            tracing::debug!(router = %self.router, tag, "reply dropped, router closed");
            return false;
        }
        true
    }
}

/// A bound control-plane endpoint
pub struct Router {
    name: Arc<str>,
    endpoint: String,
    cancel: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl Router {
    /// Bind a ZeroMQ ROUTER socket and start its event loop
    pub async fn bind(
        name: &str,
        address: &str,
        handler: Arc<dyn MessageHandler>,
        parent: &CancellationToken,
    ) -> Result<Router> {
        let (transport, endpoint) = ZmqTransport::bind(address).await?;
        tracing::info!(router = name, endpoint = %endpoint, "control-plane endpoint bound");
        Ok(Self::with_transport(name, transport, endpoint, handler, parent))
    }

    /// Start an event loop over an existing transport
    pub fn with_transport<T>(
        name: &str,
        transport: T,
        endpoint: String,
        handler: Arc<dyn MessageHandler>,
        parent: &CancellationToken,
    ) -> Router
    where
        T: Transport + 'static,
    {
        let name: Arc<str> = Arc::from(name);
        let cancel = parent.child_token();
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let replier = Replier {
            router: Arc::clone(&name),
            outbound: outbound_tx,
        };

        let task = tokio::spawn(event_loop(
            Arc::clone(&name),
            transport,
            handler,
            replier,
            outbound_rx,
            cancel.clone(),
            REPLY_SEND_TIMEOUT,
        ));

        Router {
            name,
            endpoint,
            cancel,
            task: Some(task),
        }
    }

    /// Resolved endpoint address
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// Router name used in logs
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Stop the event loop and release the transport
    ///
    /// No handler is invoked after this returns.
    pub async fn close(mut self) {
        self.cancel.cancel();
        if let Some(task) = self.task.take()
            && let Err(e) = task.await
        {
            tracing::warn!(router = %self.name, error = %e, "router task ended abnormally");
        }
        tracing::debug!(router = %self.name, "router closed");
    }
}

impl Drop for Router {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn event_loop<T: Transport>(
    name: Arc<str>,
    mut transport: T,
    handler: Arc<dyn MessageHandler>,
    replier: Replier,
    mut outbound: mpsc::UnboundedReceiver<Vec<Bytes>>,
    cancel: CancellationToken,
    send_timeout: Duration,
) {
    loop {
        tokio::select! {
            biased;

            _ = cancel.cancelled() => break,

            Some(frames) = outbound.recv() => {
                match tokio::time::timeout(send_timeout, transport.send(frames)).await {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => tracing::warn!(router = %name, error = %e, "failed to send reply"),
                    Err(_) => tracing::warn!(router = %name, timeout = ?send_timeout, "reply send timed out, dropping it"),
                }
            }

            received = transport.recv() => match received {
                Ok(frames) => match Envelope::parse(frames) {
                    Ok(envelope) => handler.handle(envelope, &replier),
                    Err(e) => tracing::trace!(router = %name, error = %e, "dropping malformed message"),
                },
                Err(e) => {
                    tracing::error!(router = %name, error = %e, "receive failed, stopping router");
                    break;
                }
            },
        }
    }
}

// unwrap/expect are acceptable in tests for concise failure-on-error assertions
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;
    use crate::ipc::transport::ChannelTransport;
    use async_trait::async_trait;
    use parking_lot::Mutex;

    #[derive(Default)]
    struct Recorder {
        seen: Mutex<Vec<Envelope>>,
    }

    impl MessageHandler for Recorder {
        fn handle(&self, envelope: Envelope, replier: &Replier) {
            replier.reply(&envelope.sender, &envelope.tag, Reply::Ok);
            self.seen.lock().push(envelope);
        }
    }

    fn start(handler: Arc<Recorder>) -> (Router, crate::ipc::transport::ChannelPeer) {
        let (transport, peer) = ChannelTransport::pair();
        let router = Router::with_transport(
            "test",
            transport,
            "inproc://test".into(),
            handler,
            &CancellationToken::new(),
        );
        (router, peer)
    }

    #[tokio::test]
    async fn dispatches_and_replies_with_envelope() {
        let handler = Arc::new(Recorder::default());
        let (router, mut peer) = start(Arc::clone(&handler));

        peer.send(b"w1", "title", vec![Bytes::from_static(b"hello")]);
        let reply = tokio::time::timeout(Duration::from_secs(2), peer.recv())
            .await
            .unwrap()
            .unwrap();

        assert_eq!(reply[0], Bytes::from_static(b"w1"));
        assert!(reply[1].is_empty());
        assert_eq!(reply[2], Bytes::from_static(b"TITLE"));
        assert_eq!(reply[3], Bytes::from_static(b"Ok"));
        assert_eq!(handler.seen.lock()[0].args, vec![Bytes::from_static(b"hello")]);

        router.close().await;
    }

    #[tokio::test]
    async fn short_messages_are_dropped_silently() {
        let handler = Arc::new(Recorder::default());
        let (router, mut peer) = start(Arc::clone(&handler));

        peer.send_raw(vec![Bytes::from_static(b"w1"), Bytes::new(), Bytes::from_static(b"HS")]);
        peer.send(b"w1", "TITLE", vec![Bytes::from_static(b"x")]);

        let reply = tokio::time::timeout(Duration::from_secs(2), peer.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(reply[2], Bytes::from_static(b"TITLE"));
        assert_eq!(handler.seen.lock().len(), 1);

        router.close().await;
    }

    #[tokio::test]
    async fn per_connection_order_is_preserved() {
        let handler = Arc::new(Recorder::default());
        let (router, mut peer) = start(Arc::clone(&handler));

        for i in 0..50u32 {
            peer.send(b"w1", "DL", vec![Bytes::copy_from_slice(&i.to_le_bytes())]);
        }
        for _ in 0..50 {
            tokio::time::timeout(Duration::from_secs(2), peer.recv())
                .await
                .unwrap()
                .unwrap();
        }

        let seen = handler.seen.lock();
        let order: Vec<u32> = seen
            .iter()
            .map(|e| u32::from_le_bytes(e.args[0].as_ref().try_into().unwrap()))
            .collect();
        assert_eq!(order, (0..50).collect::<Vec<_>>());
        drop(seen);

        router.close().await;
    }

    /// Transport whose sends never complete
    struct StalledSends {
        inbound: mpsc::UnboundedReceiver<Vec<Bytes>>,
    }

    #[async_trait]
    impl Transport for StalledSends {
        async fn recv(&mut self) -> Result<Vec<Bytes>> {
            match self.inbound.recv().await {
                Some(frames) => Ok(frames),
                None => std::future::pending().await,
            }
        }

        async fn send(&mut self, _frames: Vec<Bytes>) -> Result<()> {
            std::future::pending().await
        }
    }

    #[tokio::test]
    async fn stalled_reply_does_not_block_receiving() {
        let handler = Arc::new(Recorder::default());
        let (inbound_tx, inbound) = mpsc::unbounded_channel();
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let replier = Replier {
            router: Arc::from("stalled"),
            outbound: outbound_tx,
        };
        let cancel = CancellationToken::new();
        let task = tokio::spawn(event_loop(
            Arc::from("stalled"),
            StalledSends { inbound },
            Arc::clone(&handler) as Arc<dyn MessageHandler>,
            replier,
            outbound_rx,
            cancel.clone(),
            Duration::from_millis(20),
        ));

        let message = |text: &'static str| {
            vec![
                Bytes::from_static(b"w1"),
                Bytes::new(),
                Bytes::from_static(b"TITLE"),
                Bytes::from_static(text.as_bytes()),
            ]
        };
        inbound_tx.send(message("first")).unwrap();
        inbound_tx.send(message("second")).unwrap();

        tokio::time::timeout(Duration::from_secs(2), async {
            while handler.seen.lock().len() < 2 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        cancel.cancel();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn no_callbacks_after_close() {
        let handler = Arc::new(Recorder::default());
        let (router, peer) = start(Arc::clone(&handler));
        router.close().await;

        peer.send(b"w1", "TITLE", vec![Bytes::from_static(b"late")]);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(handler.seen.lock().is_empty());
    }
}
