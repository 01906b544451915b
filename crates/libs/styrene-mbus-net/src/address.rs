use std::sync::Arc;

use crate::error::NetError;
use crate::handle::ConnectionHandle;

/// A resolved recipient: where to connect and which session to address.
///
/// Created per send and bound to a pooled [`ConnectionHandle`]. Dropping the
/// address (or calling [`ServiceAddress::release_handle`]) hands the handle
/// back to the pool.
#[derive(Debug)]
pub struct ServiceAddress {
    service_name: String,
    session_name: String,
    connection_spec: String,
    handle: Option<Arc<ConnectionHandle>>,
}

impl ServiceAddress {
    /// Builds an address from a published `(name, spec)` pair.
    pub fn new(service_name: &str, connection_spec: &str) -> Result<Self, NetError> {
        let session_name = service_name.rsplit('/').next().unwrap_or_default();
        if service_name.is_empty() || session_name.is_empty() || !is_connection_spec(connection_spec)
        {
            return Err(NetError::InvalidAddress(format!("{service_name} @ {connection_spec}")));
        }
        Ok(Self {
            service_name: service_name.to_owned(),
            session_name: session_name.to_owned(),
            connection_spec: connection_spec.to_owned(),
            handle: None,
        })
    }

    /// Parses a literal wire address, `transport/host:port/session`.
    pub fn parse_literal(literal: &str) -> Result<Self, NetError> {
        let mut parts = literal.splitn(3, '/');
        let (Some(transport), Some(host_port), Some(rest)) = (parts.next(), parts.next(), parts.next())
        else {
            return Err(NetError::InvalidAddress(literal.to_owned()));
        };
        let spec = format!("{transport}/{host_port}");
        if rest.is_empty() {
            return Err(NetError::InvalidAddress(literal.to_owned()));
        }
        Self::new(literal, &spec)
    }

    pub fn service_name(&self) -> &str {
        &self.service_name
    }

    pub fn session_name(&self) -> &str {
        &self.session_name
    }

    pub fn connection_spec(&self) -> &str {
        &self.connection_spec
    }

    pub fn bind(&mut self, handle: Arc<ConnectionHandle>) {
        self.handle = Some(handle);
    }

    pub fn handle(&self) -> Option<&Arc<ConnectionHandle>> {
        self.handle.as_ref()
    }

    pub fn release_handle(&mut self) -> Option<Arc<ConnectionHandle>> {
        self.handle.take()
    }
}

impl Clone for ServiceAddress {
    /// Clones name and spec only; the clone is unbound.
    fn clone(&self) -> Self {
        Self {
            service_name: self.service_name.clone(),
            session_name: self.session_name.clone(),
            connection_spec: self.connection_spec.clone(),
            handle: None,
        }
    }
}

/// True for `transport/host:port` with a non-empty transport and host and a numeric port.
pub fn is_connection_spec(spec: &str) -> bool {
    let Some((transport, host_port)) = spec.split_once('/') else {
        return false;
    };
    let Some((host, port)) = host_port.rsplit_once(':') else {
        return false;
    };
    !transport.is_empty()
        && transport.chars().all(|ch| ch.is_ascii_alphanumeric())
        && !host.is_empty()
        && !host.contains('/')
        && port.parse::<u16>().is_ok()
}

/// True if `pattern` is `transport/host:port/session` rather than a service name.
pub fn is_literal_address(pattern: &str) -> bool {
    let Some((split, _)) = pattern.match_indices('/').nth(1) else {
        return false;
    };
    split + 1 < pattern.len() && is_connection_spec(&pattern[..split])
}
