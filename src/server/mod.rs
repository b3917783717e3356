//! Server listener lifecycle.
//!
//! A [`Server`] owns one listening socket. Accepted channels are promoted to
//! connections, handed to the incoming-connection callback, and tracked in a
//! channel-to-connection map until their shutdown callback retires them.
//! Releasing the server asks every live child to shut down, destroys the
//! listener, and reports completion through `on_destroy_complete` strictly
//! after the last child is gone.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex};

use tracing::{debug, error, trace};

use crate::bootstrap::{
    Endpoint, Listener, ListenerOptions, ServerBootstrap, SocketOptions, TlsOptions,
};
use crate::channel::Channel;
use crate::conn::factory;
use crate::conn::{Connection, Role};

/// Callback handed each accepted connection, or the error that ended an
/// accept attempt. The callback must call [`Connection::configure_server`]
/// on every connection it receives, before returning.
pub type OnIncomingConnectionFn = Box<dyn Fn(crate::Result<&Connection>) + Send + Sync>;

/// Callback fired once the server and all of its children are gone.
pub type OnDestroyCompleteFn = Box<dyn FnOnce() + Send>;

/// Options for creating a [`Server`].
pub struct ServerOptions {
    /// The socket layer that will own the listening socket.
    pub bootstrap: Arc<dyn ServerBootstrap>,
    /// Where to listen.
    pub endpoint: Endpoint,
    /// Socket knobs.
    pub socket_options: SocketOptions,
    /// TLS configuration; presence selects TLS and enables ALPN-driven
    /// protocol selection on accepted channels.
    pub tls_options: Option<TlsOptions>,
    /// Whether applications manage read windows themselves.
    pub manual_window_management: bool,
    /// Starting read window for accepted connections.
    pub initial_window_size: usize,
    /// Receives every accepted connection.
    pub on_incoming_connection: OnIncomingConnectionFn,
    /// Fires once teardown has fully completed.
    pub on_destroy_complete: Option<OnDestroyCompleteFn>,
}

impl fmt::Debug for ServerOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServerOptions")
            .field("endpoint", &self.endpoint)
            .field("tls", &self.tls_options.is_some())
            .finish()
    }
}

struct Synced {
    is_shutting_down: bool,
    listener: Option<Box<dyn Listener>>,
    /// Every live child, keyed by channel identity.
    connections: HashMap<usize, Connection>,
    on_destroy_complete: Option<OnDestroyCompleteFn>,
}

struct ServerInner {
    is_using_tls: bool,
    manual_window_management: bool,
    initial_window_size: usize,
    on_incoming_connection: OnIncomingConnectionFn,
    synced: Mutex<Synced>,
}

/// A listening HTTP server.
///
/// Dropping the handle releases the server: children are asked to shut
/// down, the listener is destroyed, and `on_destroy_complete` fires once
/// everything is gone.
pub struct Server {
    inner: Arc<ServerInner>,
}

fn channel_key(channel: &Arc<dyn Channel>) -> usize {
    Arc::as_ptr(channel) as *const () as usize
}

// ===== impl Server =====

impl Server {
    /// Creates the server and its listening socket.
    ///
    /// The server lock is held across listener creation on purpose: accept
    /// callbacks may start firing from bootstrap threads immediately, and
    /// the lock keeps them from observing the server before its listener
    /// field is in place.
    pub fn new(options: ServerOptions) -> crate::Result<Server> {
        let ServerOptions {
            bootstrap,
            endpoint,
            socket_options,
            tls_options,
            manual_window_management,
            initial_window_size,
            on_incoming_connection,
            on_destroy_complete,
        } = options;

        if endpoint.host.is_empty() {
            debug!("a server needs an endpoint host");
            return Err(crate::Error::new_invalid_argument());
        }

        let inner = Arc::new(ServerInner {
            is_using_tls: tls_options.is_some(),
            manual_window_management,
            initial_window_size,
            on_incoming_connection,
            synced: Mutex::new(Synced {
                is_shutting_down: false,
                listener: None,
                connections: HashMap::new(),
                on_destroy_complete,
            }),
        });

        let listener_options = ListenerOptions {
            endpoint,
            socket_options,
            tls_options,
            on_accept_channel_setup: Box::new({
                let inner = inner.clone();
                move |result| inner.on_accept_channel_setup(result)
            }),
            on_accept_channel_shutdown: Box::new({
                let inner = inner.clone();
                move |channel, result| inner.on_accept_channel_shutdown(channel, result)
            }),
            on_destroy_complete: Box::new({
                let inner = inner.clone();
                move || inner.on_listener_destroy_complete()
            }),
        };

        let mut synced = inner.synced.lock().unwrap();
        let listener = bootstrap.new_socket_listener(listener_options)?;
        synced.listener = Some(listener);
        drop(synced);

        trace!("server listening");
        Ok(Server { inner })
    }

    /// Releases the server. Equivalent to dropping the handle; teardown
    /// completes asynchronously.
    pub fn release(self) {
        drop(self);
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        self.inner.begin_destroy();
    }
}

impl fmt::Debug for Server {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Server").finish()
    }
}

// ===== impl ServerInner =====

impl ServerInner {
    /// Idempotent: the first call wins, later ones return silently.
    fn begin_destroy(&self) {
        let listener = {
            let mut synced = self.synced.lock().unwrap();
            if synced.is_shutting_down {
                return;
            }
            synced.is_shutting_down = true;
            trace!(
                "shutting down server with {} live connections",
                synced.connections.len()
            );
            for connection in synced.connections.values() {
                connection
                    .channel()
                    .shutdown(Err(crate::Error::new_connection_closed()));
            }
            synced.listener.take()
        };
        if let Some(listener) = listener {
            listener.begin_destroy();
        }
    }

    fn on_accept_channel_setup(&self, result: crate::Result<Arc<dyn Channel>>) {
        let channel = match result {
            Ok(channel) => channel,
            Err(err) => {
                debug!("accept failed: {}", err);
                (self.on_incoming_connection)(Err(err));
                return;
            }
        };

        let built = factory::build(factory::Options {
            channel: &channel,
            role: Role::Server,
            is_using_tls: self.is_using_tls,
            manual_window_management: self.manual_window_management,
            initial_window_size: self.initial_window_size,
            http2_initial_settings: &[],
            host_address: None,
        });
        let connection = match built {
            Ok(connection) => connection,
            Err(err) => {
                let kind = err.clone_kind();
                (self.on_incoming_connection)(Err(err));
                channel.shutdown(Err(kind));
                return;
            }
        };

        // Release may have run between the accept and this callback.
        let inserted = {
            let mut synced = self.synced.lock().unwrap();
            if synced.is_shutting_down {
                false
            } else {
                synced
                    .connections
                    .insert(channel_key(&channel), connection.clone());
                true
            }
        };
        if !inserted {
            debug!("accepted a channel while shutting down, abandoning it");
            channel.shutdown(Err(crate::Error::new_connection_closed()));
            (self.on_incoming_connection)(Err(crate::Error::new_connection_closed()));
            return;
        }

        connection.begin_server_accept();
        (self.on_incoming_connection)(Ok(&connection));
        if !connection.finish_server_accept() {
            error!("on_incoming_connection returned without calling configure_server");
            channel.shutdown(Err(crate::Error::new_reaction_required()));
        }
    }

    fn on_accept_channel_shutdown(&self, channel: &Arc<dyn Channel>, result: crate::Result<()>) {
        let removed = {
            let mut synced = self.synced.lock().unwrap();
            synced.connections.remove(&channel_key(channel))
        };
        // A missing entry is legal: setup failed before insertion.
        if let Some(connection) = removed {
            if let Some(on_shutdown) = connection.take_server_shutdown_callback() {
                on_shutdown(result);
            }
        }
    }

    fn on_listener_destroy_complete(&self) {
        trace!("server listener destroyed");
        let on_destroy_complete = {
            let mut synced = self.synced.lock().unwrap();
            synced.on_destroy_complete.take()
        };
        if let Some(on_destroy_complete) = on_destroy_complete {
            on_destroy_complete();
        }
    }
}
