//! Control-plane message handlers
//!
//! Two handlers exist, one per endpoint. Both accept the handshake; each serves
//! only its own notification or task tags and ignores the rest without replying.

use super::identity::{IdentityTable, Peer};
use super::progress::ProgressRegistry;
use super::protocol::{Envelope, Reply, Request, Tag};
use super::router::{MessageHandler, Replier};
use crate::broker::{NOT_FOUND, TaskBroker};
use crate::download_queue::DownloadQueue;
use std::sync::Arc;

/// Which endpoint a handler serves
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EndpointKind {
    /// Progress, handshake and notification endpoint
    Communication,
    /// Sub-work and downloader-input endpoint
    TaskRequest,
}

impl EndpointKind {
    /// Channel kind a worker must announce in its handshake
    pub fn channel_name(&self) -> &'static str {
        match self {
            EndpointKind::Communication => "Comm",
            EndpointKind::TaskRequest => "Task",
        }
    }

    /// Whether this endpoint serves `tag`
    pub fn accepts(&self, tag: Tag) -> bool {
        match self {
            EndpointKind::Communication => matches!(
                tag,
                Tag::Handshake | Tag::NotifyTotal | Tag::NotifyDownloaded | Tag::NotifyTitle
            ),
            EndpointKind::TaskRequest => matches!(
                tag,
                Tag::Handshake | Tag::FfmpegRequest | Tag::FfmpegResult | Tag::Aria2
            ),
        }
    }

    fn as_str(&self) -> &'static str {
        match self {
            EndpointKind::Communication => "communication",
            EndpointKind::TaskRequest => "task",
        }
    }
}

/// Decode an envelope for `kind`, answering protocol errors with ERROR
///
/// Returns `None` when the message was ignored or already answered.
fn decode(kind: EndpointKind, envelope: &Envelope, peer: &Peer, replier: &Replier) -> Option<Request> {
    match Tag::parse(&envelope.tag) {
        Some(tag) if kind.accepts(tag) => {}
        _ => {
            tracing::debug!(
                endpoint = kind.as_str(),
                peer = %peer,
                tag = %envelope.tag,
                "ignoring tag not served by this endpoint"
            );
            return None;
        }
    }

    match Request::decode(&envelope.tag, &envelope.args) {
        Ok(request) => Some(request),
        Err(e) => {
            tracing::warn!(endpoint = kind.as_str(), peer = %peer, error = %e, "malformed message");
            replier.reply(&envelope.sender, &envelope.tag, Reply::Error);
            None
        }
    }
}

fn handshake(
    kind: EndpointKind,
    identities: &IdentityTable,
    envelope: &Envelope,
    peer: &Peer,
    identifier: String,
    channel: &str,
    replier: &Replier,
) {
    tracing::debug!(peer = %peer, identifier = %identifier, "handshake received");
    if channel.eq_ignore_ascii_case(kind.channel_name()) {
        identities.register(&envelope.sender, identifier);
        replier.reply(&envelope.sender, &envelope.tag, Reply::Ok);
    } else {
        tracing::error!(
            fatal = true,
            peer = %peer,
            channel = %channel,
            expected = kind.channel_name(),
            "unexpected handshake, are the communication and task addresses swapped?"
        );
        replier.reply(&envelope.sender, &envelope.tag, Reply::Error);
    }
}

/// Handler of the Communication endpoint
pub struct CommunicationHandler {
    identities: Arc<IdentityTable>,
    progress: Arc<ProgressRegistry>,
}

impl CommunicationHandler {
    /// Create a handler sharing the run's identity table and progress registry
    pub fn new(identities: Arc<IdentityTable>, progress: Arc<ProgressRegistry>) -> Self {
        Self {
            identities,
            progress,
        }
    }
}

impl MessageHandler for CommunicationHandler {
    fn handle(&self, envelope: Envelope, replier: &Replier) {
        const KIND: EndpointKind = EndpointKind::Communication;
        let peer = self.identities.resolve(&envelope.sender);
        let Some(request) = decode(KIND, &envelope, &peer, replier) else {
            return;
        };

        match request {
            Request::Handshake {
                identifier,
                channel,
            } => handshake(
                KIND,
                &self.identities,
                &envelope,
                &peer,
                identifier,
                &channel,
                replier,
            ),
            Request::NotifyTotal { total } => {
                tracing::debug!(peer = %peer, total, "total job count received");
                if !self
                    .progress
                    .set_total(peer.identifier_or_unregistered(), total)
                {
                    tracing::debug!(peer = %peer, "total for an untracked identifier");
                }
                replier.reply(&envelope.sender, &envelope.tag, Reply::Ok);
            }
            Request::NotifyDownloaded { item_id, result } => {
                tracing::debug!(peer = %peer, item_id, result, "item processed");
                self.progress.advance(peer.identifier_or_unregistered());
                replier.reply(&envelope.sender, &envelope.tag, Reply::Ok);
            }
            Request::NotifyTitle { title } => {
                tracing::debug!(peer = %peer, title = %title, "title updated");
                replier.reply(&envelope.sender, &envelope.tag, Reply::Ok);
            }
            Request::FfmpegRequest { .. } | Request::FfmpegResult { .. } | Request::Aria2 { .. } => {}
        }
    }
}

/// Handler of the Task Request endpoint
pub struct TaskRequestHandler {
    identities: Arc<IdentityTable>,
    broker: Arc<TaskBroker>,
    queue: Arc<DownloadQueue>,
}

impl TaskRequestHandler {
    /// Create a handler forwarding to the run's broker and batching queue
    pub fn new(
        identities: Arc<IdentityTable>,
        broker: Arc<TaskBroker>,
        queue: Arc<DownloadQueue>,
    ) -> Self {
        Self {
            identities,
            broker,
            queue,
        }
    }
}

impl MessageHandler for TaskRequestHandler {
    fn handle(&self, envelope: Envelope, replier: &Replier) {
        const KIND: EndpointKind = EndpointKind::TaskRequest;
        let peer = self.identities.resolve(&envelope.sender);
        let Some(request) = decode(KIND, &envelope, &peer, replier) else {
            return;
        };

        match request {
            Request::Handshake {
                identifier,
                channel,
            } => handshake(
                KIND,
                &self.identities,
                &envelope,
                &peer,
                identifier,
                &channel,
                replier,
            ),
            Request::FfmpegRequest { args } => {
                let task_id = self.broker.request(&peer.to_string(), args);
                replier.reply(&envelope.sender, &envelope.tag, Reply::TaskId(task_id));
            }
            Request::FfmpegResult { task_id } => match self.broker.poll(task_id) {
                Some(completion) => {
                    tracing::debug!(peer = %peer, task_id = %task_id, "exit code requested");
                    let replier = replier.clone();
                    let sender = envelope.sender.clone();
                    let tag = envelope.tag.clone();
                    tokio::spawn(async move {
                        let code = completion.await;
                        replier.reply(&sender, &tag, Reply::ExitCode(code));
                    });
                }
                None => {
                    tracing::warn!(peer = %peer, task_id = %task_id, "exit code of unknown execution requested");
                    replier.reply(&envelope.sender, &envelope.tag, Reply::ExitCode(NOT_FOUND));
                }
            },
            Request::Aria2 {
                destination,
                payload,
            } => {
                let destination = std::path::absolute(&destination)
                    .map(|p| p.display().to_string())
                    .unwrap_or(destination);
                self.queue.add(destination, payload);
                replier.reply(&envelope.sender, &envelope.tag, Reply::Accepted);
            }
            Request::NotifyTotal { .. }
            | Request::NotifyDownloaded { .. }
            | Request::NotifyTitle { .. } => {}
        }
    }
}
