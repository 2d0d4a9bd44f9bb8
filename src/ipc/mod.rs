//! Control plane
//!
//! Workers talk back to the orchestrator over two ZeroMQ ROUTER endpoints:
//! the Communication endpoint (handshake, progress notifications) and the Task
//! Request endpoint (brokered sub-work, downloader input).

pub mod handlers;
pub mod identity;
pub mod progress;
pub mod protocol;
pub mod router;
pub mod transport;

pub use handlers::{CommunicationHandler, EndpointKind, TaskRequestHandler};
pub use identity::{IdentityTable, Peer};
pub use progress::{ItemProgress, ProgressHandle, ProgressRegistry};
pub use protocol::{Envelope, Reply, Request, Tag};
pub use router::{MessageHandler, Replier, Router};
pub use transport::{ChannelPeer, ChannelTransport, Transport, ZmqTransport};
