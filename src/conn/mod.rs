//! HTTP connections and their lifecycle.
//!
//! A [`Connection`] is the handle both clients and servers end up holding
//! once a channel has been promoted to HTTP. The handle is reference
//! counted: cloning acquires a reference, and dropping the last one requests
//! shutdown of the owning channel. The protocol-version-specific state lives
//! behind the handle; HTTP/2-only operations are available on the abstract
//! handle (where they fail with an invalid-state error on an HTTP/1.1
//! connection) and on the [`Http2Connection`] capability (where the version
//! is known statically).

use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use http::Version;
use tracing::{trace, warn};

use crate::channel::{Channel, Slot};

pub(crate) mod factory;
mod http1;
mod http2;

pub use self::http2::{Http2Goaway, Http2Setting, Http2SettingId, Http2Settings};

#[cfg(test)]
pub(crate) use self::http1::StreamEntry;

/// Identifies one request/response exchange on a connection.
pub type StreamId = u32;

/// Largest stream id either peer may use.
pub(crate) const MAX_STREAM_ID: StreamId = (u32::MAX - 1) >> 1;

/// Callback a server connection runs for each incoming request.
pub type IncomingRequestFn = dyn Fn(&Connection) + Send + Sync;

/// Callback delivered once when a connection has finished shutting down.
pub type ConnectionShutdownFn = Box<dyn FnOnce(crate::Result<()>) + Send>;

/// Callback fired once the peer has acknowledged a settings change.
pub type SettingsAppliedFn = Box<dyn FnOnce(crate::Result<()>) + Send>;

/// Callback fired when a ping is acknowledged, with the echoed payload.
pub type PingAckFn = Box<dyn FnOnce(Bytes, crate::Result<()>) + Send>;

/// Rewrites outgoing requests before serialization, the seam the HTTP proxy
/// layer plugs into.
pub trait RequestTransform: Send + Sync {
    /// Rewrites the serialized bytes of one outgoing request.
    fn transform(&self, outgoing: &mut Bytes) -> crate::Result<()>;
}

impl fmt::Debug for dyn RequestTransform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RequestTransform").finish()
    }
}

/// What a server must provide for an accepted connection, from inside the
/// incoming-connection callback.
pub struct ServerConnectionOptions {
    /// Runs for each request the peer starts on this connection.
    pub on_incoming_request: Arc<IncomingRequestFn>,
    /// Runs once when this connection has shut down.
    pub on_shutdown: Option<ConnectionShutdownFn>,
}

impl fmt::Debug for ServerConnectionOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServerConnectionOptions").finish()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Role {
    Client,
    Server,
}

pub(super) enum Proto {
    H1(Arc<http1::Http1Shared>),
    H2(Arc<http2::Http2Shared>),
}

#[derive(Default)]
pub(super) struct ClientData {
    pub(super) proxy_request_transform: Option<Arc<dyn RequestTransform>>,
}

pub(super) struct ServerData {
    /// True only while the incoming-connection callback is running.
    pub(super) accepting: bool,
    pub(super) on_incoming_request: Option<Arc<IncomingRequestFn>>,
    pub(super) on_shutdown: Option<ConnectionShutdownFn>,
}

pub(super) enum RoleData {
    Client(Mutex<ClientData>),
    Server(Mutex<ServerData>),
}

impl RoleData {
    fn new(role: Role) -> RoleData {
        match role {
            Role::Client => RoleData::Client(Mutex::new(ClientData::default())),
            Role::Server => RoleData::Server(Mutex::new(ServerData {
                accepting: false,
                on_incoming_request: None,
                on_shutdown: None,
            })),
        }
    }
}

pub(crate) struct Inner {
    pub(super) version: Version,
    pub(super) role: Role,
    pub(super) channel: Arc<dyn Channel>,
    pub(super) slot: Arc<dyn Slot>,
    pub(super) host_address: Option<Box<str>>,
    pub(super) next_stream_id: AtomicU32,
    pub(super) role_data: RoleData,
    pub(super) proto: Proto,
}

impl Inner {
    pub(super) fn new(
        version: Version,
        role: Role,
        channel: Arc<dyn Channel>,
        slot: Arc<dyn Slot>,
        host_address: Option<&str>,
        proto: Proto,
    ) -> Inner {
        let first_stream_id = match role {
            Role::Client => 1,
            Role::Server => 2,
        };
        Inner {
            version,
            role,
            channel,
            slot,
            host_address: host_address.map(Box::from),
            next_stream_id: AtomicU32::new(first_stream_id),
            role_data: RoleData::new(role),
            proto,
        }
    }

    pub(super) fn proxy_request_transform(&self) -> Option<Arc<dyn RequestTransform>> {
        match self.role_data {
            RoleData::Client(ref data) => data.lock().unwrap().proxy_request_transform.clone(),
            RoleData::Server(_) => None,
        }
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        // The last reference covers the user handle plus any scheduled task;
        // once both are gone the channel has no reason to stay up.
        trace!("last connection reference released, shutting channel down");
        self.channel.shutdown(Ok(()));
    }
}

/// A reference-counted handle to one HTTP connection.
///
/// Cloning acquires a reference; dropping the last clone requests shutdown
/// of the owning channel and releases the hold on it.
#[derive(Clone)]
pub struct Connection {
    pub(super) inner: Arc<Inner>,
}

/// A [`Connection`] whose protocol version is known to be HTTP/2.
#[derive(Clone)]
pub struct Http2Connection {
    inner: Arc<Inner>,
}

// ===== impl Connection =====

impl Connection {
    /// The negotiated protocol version.
    pub fn version(&self) -> Version {
        self.inner.version
    }

    /// Whether this is the server end of the connection.
    pub fn is_server(&self) -> bool {
        self.inner.role == Role::Server
    }

    /// Whether this is the client end of the connection.
    pub fn is_client(&self) -> bool {
        self.inner.role == Role::Client
    }

    /// The channel this connection runs on.
    pub fn channel(&self) -> &Arc<dyn Channel> {
        &self.inner.channel
    }

    /// The host this connection was established to, for client connections.
    pub fn host_address(&self) -> Option<&str> {
        self.inner.host_address.as_deref()
    }

    /// Stops accepting new streams and begins shutting the channel down.
    ///
    /// Idempotent, callable from any thread.
    pub fn close(&self) {
        match self.inner.proto {
            Proto::H1(ref shared) => shared.close(&*self.inner.channel),
            Proto::H2(ref shared) => shared.close(&*self.inner.channel),
        }
    }

    /// Whether the connection is usable. Once false, it never becomes true
    /// again.
    pub fn is_open(&self) -> bool {
        match self.inner.proto {
            Proto::H1(ref shared) => shared.is_open(),
            Proto::H2(ref shared) => shared.is_open(),
        }
    }

    /// Whether new streams may still be created on this connection.
    pub fn new_requests_allowed(&self) -> bool {
        match self.inner.proto {
            Proto::H1(ref shared) => shared.new_requests_allowed(),
            Proto::H2(ref shared) => shared.new_requests_allowed(),
        }
    }

    /// Enlarges the inbound read window by `increment` bytes.
    ///
    /// Only meaningful when the connection was created with manual window
    /// management; otherwise this logs and does nothing. Increments made off
    /// the event loop thread are coalesced into a single update.
    pub fn update_window(&self, increment: usize) {
        match self.inner.proto {
            Proto::H1(ref shared) => shared.update_window(&*self.inner.slot, increment),
            Proto::H2(ref shared) => shared.update_window(&*self.inner.slot, increment),
        }
    }

    /// Reserves the next stream id for this side of the connection.
    ///
    /// Ids start at 1 (client) or 2 (server), advance by 2, and are never
    /// reused. Once the id space is used up every call fails with a
    /// stream-ids-exhausted error.
    pub fn next_stream_id(&self) -> crate::Result<StreamId> {
        let ids = &self.inner.next_stream_id;
        let mut current = ids.load(Ordering::Relaxed);
        loop {
            if current > MAX_STREAM_ID {
                return Err(crate::Error::new_stream_ids_exhausted());
            }
            match ids.compare_exchange_weak(
                current,
                current.wrapping_add(2),
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => return Ok(current),
                Err(observed) => current = observed,
            }
        }
    }

    /// Provides the callbacks a server connection needs to serve requests.
    ///
    /// May be called exactly once, only from inside the server's
    /// incoming-connection callback, and only on a server connection.
    pub fn configure_server(&self, options: ServerConnectionOptions) -> crate::Result<()> {
        let data = match self.inner.role_data {
            RoleData::Server(ref data) => data,
            RoleData::Client(_) => {
                warn!("configure_server called on a client connection");
                return Err(crate::Error::new_invalid_state());
            }
        };
        let mut data = data.lock().unwrap();
        if !data.accepting {
            warn!("configure_server is only valid during the incoming-connection callback");
            return Err(crate::Error::new_invalid_state());
        }
        if data.on_incoming_request.is_some() {
            warn!("configure_server called twice on one connection");
            return Err(crate::Error::new_invalid_state());
        }
        data.on_incoming_request = Some(options.on_incoming_request);
        data.on_shutdown = options.on_shutdown;
        Ok(())
    }

    /// Returns the HTTP/2 capability of this connection.
    ///
    /// Fails with an invalid-state error on an HTTP/1.1 connection, without
    /// dispatching anything.
    pub fn http2(&self) -> crate::Result<Http2Connection> {
        match self.inner.proto {
            Proto::H2(_) => Ok(Http2Connection {
                inner: self.inner.clone(),
            }),
            Proto::H1(_) => {
                warn!(
                    "HTTP/2 operation requested on an {:?} connection",
                    self.inner.version
                );
                Err(crate::Error::new_invalid_state())
            }
        }
    }

    /// Submits a settings change to the peer. HTTP/2 only.
    pub fn change_settings(
        &self,
        settings: &[Http2Setting],
        on_completed: Option<SettingsAppliedFn>,
    ) -> crate::Result<()> {
        self.http2()?.change_settings(settings, on_completed)
    }

    /// Sends a ping to the peer. HTTP/2 only.
    pub fn ping(&self, opaque_data: Option<Bytes>, on_ack: Option<PingAckFn>) -> crate::Result<()> {
        self.http2()?.ping(opaque_data, on_ack)
    }

    /// Tells the peer to stop opening streams. HTTP/2 only.
    pub fn send_goaway(
        &self,
        http2_error_code: u32,
        allow_more_streams: bool,
        debug_data: Option<Bytes>,
    ) -> crate::Result<()> {
        self.http2()?
            .send_goaway(http2_error_code, allow_more_streams, debug_data)
    }

    /// The last goaway this side sent, if any. HTTP/2 only.
    pub fn sent_goaway(&self) -> crate::Result<Option<Http2Goaway>> {
        Ok(self.http2()?.sent_goaway())
    }

    /// The last goaway the peer sent, if any. HTTP/2 only.
    pub fn received_goaway(&self) -> crate::Result<Option<Http2Goaway>> {
        Ok(self.http2()?.received_goaway())
    }

    /// This side's acknowledged settings. HTTP/2 only.
    pub fn local_settings(&self) -> crate::Result<Http2Settings> {
        Ok(self.http2()?.local_settings())
    }

    /// The peer's settings as last received. HTTP/2 only.
    pub fn remote_settings(&self) -> crate::Result<Http2Settings> {
        Ok(self.http2()?.remote_settings())
    }

    // ===== crate-internal plumbing =====

    pub(crate) fn begin_server_accept(&self) {
        if let RoleData::Server(ref data) = self.inner.role_data {
            data.lock().unwrap().accepting = true;
        }
    }

    /// Ends the accepting phase; returns whether `configure_server` ran.
    pub(crate) fn finish_server_accept(&self) -> bool {
        match self.inner.role_data {
            RoleData::Server(ref data) => {
                let mut data = data.lock().unwrap();
                data.accepting = false;
                data.on_incoming_request.is_some()
            }
            RoleData::Client(_) => false,
        }
    }

    pub(crate) fn incoming_request_callback(&self) -> Option<Arc<IncomingRequestFn>> {
        match self.inner.role_data {
            RoleData::Server(ref data) => data.lock().unwrap().on_incoming_request.clone(),
            RoleData::Client(_) => None,
        }
    }

    pub(crate) fn take_server_shutdown_callback(&self) -> Option<ConnectionShutdownFn> {
        match self.inner.role_data {
            RoleData::Server(ref data) => data.lock().unwrap().on_shutdown.take(),
            RoleData::Client(_) => None,
        }
    }

    pub(crate) fn set_proxy_request_transform(&self, transform: Arc<dyn RequestTransform>) {
        if let RoleData::Client(ref data) = self.inner.role_data {
            data.lock().unwrap().proxy_request_transform = Some(transform);
        }
    }

    #[cfg(test)]
    pub(crate) fn set_next_stream_id(&self, value: StreamId) {
        self.inner.next_stream_id.store(value, Ordering::Relaxed);
    }

    #[cfg(test)]
    pub(crate) fn submit_stream(&self, stream: StreamEntry) -> crate::Result<()> {
        match self.inner.proto {
            Proto::H1(ref shared) => shared.submit_stream(&*self.inner.slot, stream),
            Proto::H2(_) => Err(crate::Error::new_invalid_state()),
        }
    }

    #[cfg(test)]
    pub(crate) fn downgrade(&self) -> std::sync::Weak<Inner> {
        Arc::downgrade(&self.inner)
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("version", &self.inner.version)
            .field("role", &self.inner.role)
            .finish()
    }
}

// ===== impl Http2Connection =====

impl Http2Connection {
    fn shared(&self) -> &Arc<http2::Http2Shared> {
        match self.inner.proto {
            Proto::H2(ref shared) => shared,
            Proto::H1(_) => unreachable!("Http2Connection built over HTTP/1.1 state"),
        }
    }

    /// The abstract handle for this connection.
    pub fn connection(&self) -> Connection {
        Connection {
            inner: self.inner.clone(),
        }
    }

    /// Submits a settings change to the peer; `on_completed` fires once the
    /// peer acknowledges it.
    pub fn change_settings(
        &self,
        settings: &[Http2Setting],
        on_completed: Option<SettingsAppliedFn>,
    ) -> crate::Result<()> {
        self.shared()
            .change_settings(&*self.inner.slot, settings, on_completed)
    }

    /// Sends a ping. `opaque_data` must be exactly 8 bytes when present.
    pub fn ping(&self, opaque_data: Option<Bytes>, on_ack: Option<PingAckFn>) -> crate::Result<()> {
        self.shared().ping(&*self.inner.slot, opaque_data, on_ack)
    }

    /// Tells the peer to stop opening streams.
    pub fn send_goaway(
        &self,
        http2_error_code: u32,
        allow_more_streams: bool,
        debug_data: Option<Bytes>,
    ) -> crate::Result<()> {
        self.shared().send_goaway(
            &*self.inner.slot,
            http2_error_code,
            allow_more_streams,
            debug_data,
        )
    }

    /// The last goaway this side sent, if any.
    pub fn sent_goaway(&self) -> Option<Http2Goaway> {
        self.shared().sent_goaway()
    }

    /// The last goaway the peer sent, if any.
    pub fn received_goaway(&self) -> Option<Http2Goaway> {
        self.shared().received_goaway()
    }

    /// This side's acknowledged settings.
    pub fn local_settings(&self) -> Http2Settings {
        self.shared().local_settings()
    }

    /// The peer's settings as last received.
    pub fn remote_settings(&self) -> Http2Settings {
        self.shared().remote_settings()
    }
}

impl fmt::Debug for Http2Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Http2Connection")
            .field("role", &self.inner.role)
            .finish()
    }
}
