//! RPC network layer of the Styrene message bus.
//!
//! Moves bus messages between processes over an RPC transport:
//!
//! - **Resolution**: service patterns and literal addresses become
//!   [`ServiceAddress`]es through a cached [`NameMirror`] lookup
//! - **Pooling**: a fixed fan-out of [`ConnectionHandle`]s per connection spec,
//!   swept when idle
//! - **Negotiation**: each handle learns its peer's [`mbus::Version`] once
//! - **Wire codecs**: [`SendV1`] and [`SendV2`], picked per send by the lowest
//!   version among its recipients
//! - **Facade**: [`RpcNetwork`] with attach, start, send and shutdown for the
//!   owning bus
//!
//! The transport and naming service are traits. [`LoopbackNet`] and
//! [`LocalNameServer`] implement them in-process.

pub mod address;
pub mod codec;
pub mod config;
pub mod error;
pub mod handle;
pub mod naming;
pub mod pool;
pub mod resolver;
pub mod transport;

mod executor;
mod inbound;
mod network;
mod pending;
mod send;

pub use address::ServiceAddress;
pub use codec::{CodecRegistry, SendV1, SendV2, WireCodec};
pub use config::{CompressionConfig, CompressionKind, NetworkConfig};
pub use error::NetError;
pub use handle::{ConnectionHandle, VersionState};
pub use inbound::ReplySink;
pub use naming::{LocalNameServer, NameMirror, NameRegister};
pub use network::{NetworkOwner, RpcNetwork};
pub use pool::ConnectionPool;
pub use resolver::ServiceResolver;
pub use send::{Recipient, RecipientToken};
pub use transport::loopback::{LoopbackNet, LoopbackTransport};
pub use transport::{Connection, TransportEndpoint};
