//! Boundary types shared between the message bus and its network layer.
//!
//! The network crate (`mbus_net`) moves [`Message`]s and [`Reply`]s between
//! processes without knowing what they carry. Everything it needs to know
//! about the payload goes through the [`Protocol`] trait:
//!
//! - **[`Version`]**: the protocol version negotiated per connection
//! - **[`ErrorCode`]** / **[`ErrorEntry`]**: failures carried inside replies
//! - **[`Routable`]** / **[`Protocol`]**: opaque payloads and their codecs
//! - **[`Trace`]**: per-message trace notes that travel with the envelope

pub mod error;
pub mod message;
pub mod protocol;
pub mod trace;
pub mod version;

pub use error::{BusError, ErrorCode, ErrorEntry};
pub use message::{Message, Reply};
pub use protocol::{Protocol, Routable};
pub use trace::Trace;
pub use version::Version;
