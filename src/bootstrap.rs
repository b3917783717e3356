//! The socket bootstrap interface.
//!
//! Bootstraps create listening sockets and outbound socket channels, then
//! hand the resulting channels back through callbacks. Implementations live
//! outside this crate; these traits pin down only the callback contracts the
//! connection layer depends on.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use crate::channel::Channel;

/// A host and port to listen on or connect to.
#[derive(Debug, Clone)]
pub struct Endpoint {
    /// Host name or address.
    pub host: String,
    /// Port number.
    pub port: u16,
}

/// Socket-level knobs passed through to the bootstrap.
#[derive(Debug, Clone)]
pub struct SocketOptions {
    /// How long a connect attempt may take.
    pub connect_timeout: Duration,
    /// Whether TCP keepalive probes are enabled.
    pub keep_alive: bool,
}

impl Default for SocketOptions {
    fn default() -> SocketOptions {
        SocketOptions {
            connect_timeout: Duration::from_secs(3),
            keep_alive: false,
        }
    }
}

/// TLS configuration handed to the bootstrap. Presence of these options is
/// what makes a connection use TLS.
#[derive(Debug, Clone, Default)]
pub struct TlsOptions {
    /// Server name for SNI and certificate verification.
    pub server_name: Option<String>,
    /// ALPN protocols to offer, most preferred first.
    pub alpn_list: Vec<String>,
}

/// Callback invoked for every accepted channel, with the channel on success
/// or the error that ended the accept attempt.
pub type AcceptChannelSetupFn = Box<dyn Fn(crate::Result<Arc<dyn Channel>>) + Send + Sync>;

/// Callback invoked when an accepted channel has shut down.
pub type AcceptChannelShutdownFn =
    Box<dyn Fn(&Arc<dyn Channel>, crate::Result<()>) + Send + Sync>;

/// Callback invoked once the listener and every channel it accepted are gone.
pub type ListenerDestroyFn = Box<dyn FnOnce() + Send>;

/// Everything a bootstrap needs to stand up a listening socket.
pub struct ListenerOptions {
    /// Where to listen.
    pub endpoint: Endpoint,
    /// Socket knobs.
    pub socket_options: SocketOptions,
    /// TLS configuration; `None` for cleartext.
    pub tls_options: Option<TlsOptions>,
    /// Invoked for each accept attempt.
    pub on_accept_channel_setup: AcceptChannelSetupFn,
    /// Invoked when an accepted channel shuts down. The bootstrap invokes it
    /// exactly once per channel previously delivered through setup.
    pub on_accept_channel_shutdown: AcceptChannelShutdownFn,
    /// Invoked last, strictly after every accepted channel's shutdown
    /// callback has run.
    pub on_destroy_complete: ListenerDestroyFn,
}

impl fmt::Debug for ListenerOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ListenerOptions")
            .field("endpoint", &self.endpoint)
            .field("socket_options", &self.socket_options)
            .field("tls_options", &self.tls_options)
            .finish()
    }
}

/// A live listening socket. Dropping the handle does not destroy it;
/// teardown goes through [`Listener::begin_destroy`].
pub trait Listener: Send + Sync {
    /// Starts the asynchronous destroy chain. The listener stops accepting,
    /// and `on_destroy_complete` fires once all children are gone.
    fn begin_destroy(&self);
}

impl fmt::Debug for dyn Listener {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Listener").finish()
    }
}

/// Creates listening sockets.
pub trait ServerBootstrap: Send + Sync {
    /// Creates a listening socket. Accept callbacks may begin firing before
    /// this returns.
    fn new_socket_listener(&self, options: ListenerOptions) -> crate::Result<Box<dyn Listener>>;
}

impl fmt::Debug for dyn ServerBootstrap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServerBootstrap").finish()
    }
}

/// Callback invoked exactly once per channel attempt: with the channel on
/// success, or with the error when no channel could be established.
pub type ChannelSetupFn = Box<dyn FnOnce(crate::Result<Arc<dyn Channel>>) + Send>;

/// Callback invoked once the channel has shut down. Only fires after a
/// successful setup.
pub type ChannelShutdownFn = Box<dyn FnOnce(crate::Result<()>) + Send>;

/// Everything a bootstrap needs to start one outbound channel.
pub struct ChannelOptions {
    /// Host to connect to.
    pub host: String,
    /// Port to connect to.
    pub port: u16,
    /// Socket knobs.
    pub socket_options: SocketOptions,
    /// TLS configuration; `None` for cleartext.
    pub tls_options: Option<TlsOptions>,
    /// Setup callback; fires exactly once.
    pub on_setup: ChannelSetupFn,
    /// Shutdown callback; fires at most once, only after a successful setup.
    pub on_shutdown: ChannelShutdownFn,
}

impl fmt::Debug for ChannelOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChannelOptions")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("socket_options", &self.socket_options)
            .field("tls_options", &self.tls_options)
            .finish()
    }
}

/// Connects outbound socket channels.
pub trait ClientChannelBootstrap: Send + Sync {
    /// Starts connecting one channel. A synchronous error means no callback
    /// will fire; otherwise `on_setup` fires exactly once.
    fn new_socket_channel(&self, options: ChannelOptions) -> crate::Result<()>;
}

impl fmt::Debug for dyn ClientChannelBootstrap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientChannelBootstrap").finish()
    }
}
