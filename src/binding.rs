//! Connection bindings: the secret and the timestamp a secure channel shares
//! between both endpoints, and how to find them on a carrier connection.
//!
//! Carriers are often wrapped several times (traffic counters, HTTP/2 or gRPC
//! tunnels). Every wrapper implements [`ResolveBinding`] by delegating to the
//! connection it wraps, so the engines can be set up without knowing the
//! concrete carrier type.
use core::fmt::{Debug, Formatter};
use std::{
    io::{self, Read, Write},
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::SystemTime,
};

use tracing::debug;
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::error::UnresolvedBinding;

/// Which side of the connection an engine serves.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum Role {
    /// The endpoint that opened the connection (outbound, client side).
    Initiator,
    /// The endpoint that accepted the connection (inbound, server side).
    Responder,
}

impl Role {
    /// The role of the other endpoint.
    pub fn peer(self) -> Role {
        match self {
            Role::Initiator => Role::Responder,
            Role::Responder => Role::Initiator,
        }
    }
}

/// The authentication secret negotiated by the secure channel.
#[derive(Clone, Eq, PartialEq, Hash, Zeroize, ZeroizeOnDrop)]
pub struct AuthKey(Vec<u8>);

impl AuthKey {
    /// Get a reference to the key's bytes.
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl AsRef<[u8]> for AuthKey {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl From<Vec<u8>> for AuthKey {
    fn from(value: Vec<u8>) -> Self {
        Self(value)
    }
}

impl From<&[u8]> for AuthKey {
    fn from(value: &[u8]) -> Self {
        Self(value.to_vec())
    }
}

impl<const N: usize> From<[u8; N]> for AuthKey {
    fn from(value: [u8; N]) -> Self {
        Self(value.to_vec())
    }
}

impl Debug for AuthKey {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("AuthKey").field(&"*****").finish()
    }
}

/// The pair both endpoints derive decoys from.
#[derive(Clone, Debug, Eq, PartialEq, Hash)]
pub struct ConnectionBinding {
    auth_key: AuthKey,
    established_time: SystemTime,
}

impl ConnectionBinding {
    /// Creates a binding from the channel's secret and the time the channel
    /// was established.
    pub fn new(auth_key: impl Into<AuthKey>, established_time: SystemTime) -> Self {
        Self {
            auth_key: auth_key.into(),
            established_time,
        }
    }

    /// The negotiated secret.
    pub fn auth_key(&self) -> &AuthKey {
        &self.auth_key
    }

    /// The time the secure channel was established.
    pub fn established_time(&self) -> SystemTime {
        self.established_time
    }
}

/// A connection that can report the binding of the secure channel beneath
/// it.
pub trait ResolveBinding {
    /// Returns the binding the endpoint playing `role` must use.
    fn resolve_binding(&self, role: Role) -> Result<ConnectionBinding, UnresolvedBinding>;
}

impl<T: ResolveBinding + ?Sized> ResolveBinding for &T {
    fn resolve_binding(&self, role: Role) -> Result<ConnectionBinding, UnresolvedBinding> {
        (**self).resolve_binding(role)
    }
}

impl<T: ResolveBinding + ?Sized> ResolveBinding for Box<T> {
    fn resolve_binding(&self, role: Role) -> Result<ConnectionBinding, UnresolvedBinding> {
        (**self).resolve_binding(role)
    }
}

impl<T: ResolveBinding + ?Sized> ResolveBinding for Arc<T> {
    fn resolve_binding(&self, role: Role) -> Result<ConnectionBinding, UnresolvedBinding> {
        (**self).resolve_binding(role)
    }
}

/// Resolves the binding of `conn` for `role`, logging the outcome.
pub fn resolve<C: ResolveBinding + ?Sized>(
    conn: &C,
    role: Role,
) -> Result<ConnectionBinding, UnresolvedBinding> {
    let result = conn.resolve_binding(role);
    match &result {
        Ok(_) => debug!(?role, "resolved connection binding"),
        Err(e) => debug!(?role, error = %e, "connection binding unresolved"),
    }
    result
}

/// The secure channel itself, as seen from one side.
///
/// The server side only binds responders and the client side only binds
/// initiators.
#[derive(Clone, Debug)]
pub struct SecureChannel {
    role: Role,
    binding: ConnectionBinding,
}

impl SecureChannel {
    /// The accepting side of a channel.
    pub fn server(binding: ConnectionBinding) -> Self {
        Self {
            role: Role::Responder,
            binding,
        }
    }

    /// The connecting side of a channel.
    pub fn client(binding: ConnectionBinding) -> Self {
        Self {
            role: Role::Initiator,
            binding,
        }
    }

    /// The role this side of the channel binds.
    pub fn role(&self) -> Role {
        self.role
    }
}

impl ResolveBinding for SecureChannel {
    fn resolve_binding(&self, role: Role) -> Result<ConnectionBinding, UnresolvedBinding> {
        if role != self.role {
            return Err(UnresolvedBinding::RoleMismatch {
                bound: self.role,
                requested: role,
            });
        }
        Ok(self.binding.clone())
    }
}

/// A carrier that is not backed by a secure channel.
#[derive(Copy, Clone, Debug, Default)]
pub struct Unbound;

impl ResolveBinding for Unbound {
    fn resolve_binding(&self, _role: Role) -> Result<ConnectionBinding, UnresolvedBinding> {
        Err(UnresolvedBinding::NoSecureChannel)
    }
}

/// A traffic-counting wrapper around a connection.
///
/// Bytes are counted as they pass through the [`Read`] and [`Write`]
/// implementations, so an engine driven over this wrapper keeps the counters
/// current.
#[derive(Debug)]
pub struct StatConnection<C> {
    inner: C,
    uplink: AtomicU64,
    downlink: AtomicU64,
}

impl<C> StatConnection<C> {
    /// Wraps `inner` with zeroed counters.
    pub fn new(inner: C) -> Self {
        Self {
            inner,
            uplink: AtomicU64::new(0),
            downlink: AtomicU64::new(0),
        }
    }

    /// Bytes sent so far.
    pub fn uplink(&self) -> u64 {
        self.uplink.load(Ordering::Relaxed)
    }

    /// Bytes received so far.
    pub fn downlink(&self) -> u64 {
        self.downlink.load(Ordering::Relaxed)
    }

    /// The wrapped connection.
    pub fn get_ref(&self) -> &C {
        &self.inner
    }

    /// Mutable access to the wrapped connection. Bytes moved through it
    /// directly are not counted.
    pub fn get_mut(&mut self) -> &mut C {
        &mut self.inner
    }
}

impl<C: Read> Read for StatConnection<C> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.inner.read(buf)?;
        self.downlink.fetch_add(n as u64, Ordering::Relaxed);
        Ok(n)
    }
}

impl<C: Write> Write for StatConnection<C> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = self.inner.write(buf)?;
        self.uplink.fetch_add(n as u64, Ordering::Relaxed);
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

impl<C: ResolveBinding> ResolveBinding for StatConnection<C> {
    fn resolve_binding(&self, role: Role) -> Result<ConnectionBinding, UnresolvedBinding> {
        self.inner.resolve_binding(role)
    }
}

/// One stream of an HTTP/2 connection shared with other streams.
#[derive(Debug)]
pub struct Http2Stream<C> {
    conn: Arc<C>,
    stream_id: u32,
}

impl<C> Http2Stream<C> {
    /// A stream with id `stream_id` on the shared connection `conn`.
    pub fn new(conn: Arc<C>, stream_id: u32) -> Self {
        Self { conn, stream_id }
    }

    /// The HTTP/2 stream identifier.
    pub fn stream_id(&self) -> u32 {
        self.stream_id
    }
}

impl<C: ResolveBinding> ResolveBinding for Http2Stream<C> {
    fn resolve_binding(&self, role: Role) -> Result<ConnectionBinding, UnresolvedBinding> {
        self.conn.resolve_binding(role)
    }
}

/// A stream tunneled through an RPC call over a shared transport.
#[derive(Debug)]
pub struct GrpcTunnel<C> {
    transport: Arc<C>,
    service: String,
}

impl<C> GrpcTunnel<C> {
    /// A tunnel for `service` over `transport`.
    pub fn new(transport: Arc<C>, service: impl Into<String>) -> Self {
        Self {
            transport,
            service: service.into(),
        }
    }

    /// The RPC service name.
    pub fn service(&self) -> &str {
        &self.service
    }
}

impl<C: ResolveBinding> ResolveBinding for GrpcTunnel<C> {
    fn resolve_binding(&self, role: Role) -> Result<ConnectionBinding, UnresolvedBinding> {
        self.transport.resolve_binding(role)
    }
}

#[cfg(test)]
mod test {
    use std::time::Duration;

    use super::*;

    fn binding() -> ConnectionBinding {
        ConnectionBinding::new(
            [7u8; 32],
            SystemTime::UNIX_EPOCH + Duration::from_secs(1_700_000_000),
        )
    }

    #[test]
    fn test_secure_channel_binds_its_own_side() {
        let server = SecureChannel::server(binding());
        assert_eq!(server.resolve_binding(Role::Responder), Ok(binding()));
        assert_eq!(
            server.resolve_binding(Role::Initiator),
            Err(UnresolvedBinding::RoleMismatch {
                bound: Role::Responder,
                requested: Role::Initiator
            })
        );
    }

    #[test]
    fn test_wrappers_delegate() {
        let channel = Arc::new(SecureChannel::client(binding()));
        let stat = StatConnection::new(Http2Stream::new(channel.clone(), 3));
        assert_eq!(resolve(&stat, Role::Initiator), Ok(binding()));

        let transport = Arc::new(StatConnection::new(SecureChannel::client(binding())));
        let tunnel = GrpcTunnel::new(transport, "Tun");
        assert_eq!(tunnel.resolve_binding(Role::Initiator), Ok(binding()));

        let boxed: Box<dyn ResolveBinding> = Box::new(tunnel);
        assert_eq!(boxed.resolve_binding(Role::Initiator), Ok(binding()));
    }

    #[test]
    fn test_unbound_carrier() {
        let stat = StatConnection::new(Unbound);
        assert_eq!(
            resolve(&stat, Role::Responder),
            Err(UnresolvedBinding::NoSecureChannel)
        );
    }

    #[test]
    fn test_auth_key_debug_is_redacted() {
        let key = AuthKey::from([0xabu8; 4]);
        assert_eq!(format!("{:?}", key), "AuthKey(\"*****\")");
    }
}
