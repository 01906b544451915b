use std::any::Any;
use std::fmt;

use crate::error::BusError;
use crate::version::Version;

/// An application object the bus can carry, message or reply alike.
///
/// The network layer never looks inside; it asks the [`Protocol`] named by
/// [`Routable::protocol`] to turn it into bytes and back.
pub trait Routable: Any + Send + Sync + fmt::Debug {
    /// Name of the protocol that encodes this routable.
    fn protocol(&self) -> &str;

    fn as_any(&self) -> &dyn Any;
}

/// Encoder/decoder for one family of routables.
pub trait Protocol: Send + Sync {
    fn name(&self) -> &str;

    /// Encodes `routable` for a peer speaking `version`.
    fn encode(&self, version: &Version, routable: &dyn Routable) -> Result<Vec<u8>, BusError>;

    /// Decodes a payload produced by a peer speaking `version`.
    fn decode(&self, version: &Version, payload: &[u8]) -> Result<Box<dyn Routable>, BusError>;

    /// Protocols that need per-session ordering are decoded and delivered on the
    /// network thread instead of the shared executor.
    fn requires_sequencing(&self) -> bool {
        false
    }
}
