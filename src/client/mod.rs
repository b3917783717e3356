//! Client connection bootstrapping.
//!
//! [`connect`] starts exactly one outbound connection. The caller learns the
//! outcome through `on_setup`, which fires exactly once; a successful setup
//! is later balanced by at most one `on_shutdown`. There is no pooling and
//! no retrying here, this module only turns a socket-channel attempt into
//! the connection lifecycle callbacks.

use std::fmt;
use std::sync::{Arc, Mutex};

use tracing::{debug, trace};

use crate::bootstrap::{ChannelOptions, ClientChannelBootstrap, Endpoint, SocketOptions, TlsOptions};
use crate::channel::{Channel, MonitoringOptions};
use crate::conn::factory;
use crate::conn::{Connection, Http2Setting, RequestTransform, Role};
use crate::hooks;

/// Callback delivering the outcome of one [`connect`] call.
pub type OnSetupFn = Box<dyn FnOnce(crate::Result<Connection>) + Send>;

/// Callback delivered once the connection from a successful setup has shut
/// down.
pub type OnShutdownFn = Box<dyn FnOnce(crate::Result<()>) + Send>;

/// Routes a connection through an HTTP proxy.
pub struct ProxyOptions {
    /// The proxy to connect to instead of the origin.
    pub endpoint: Endpoint,
    /// Rewrites each outgoing request for proxy consumption.
    pub request_transform: Arc<dyn RequestTransform>,
}

impl fmt::Debug for ProxyOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProxyOptions")
            .field("endpoint", &self.endpoint)
            .finish()
    }
}

/// Options for one outbound connection.
pub struct ClientOptions {
    /// The socket layer that will produce the channel.
    pub bootstrap: Arc<dyn ClientChannelBootstrap>,
    /// Origin host name. Must be non-empty.
    pub host_name: String,
    /// Origin port.
    pub port: u16,
    /// Socket knobs.
    pub socket_options: SocketOptions,
    /// TLS configuration; presence selects TLS and enables ALPN-driven
    /// protocol selection.
    pub tls_options: Option<TlsOptions>,
    /// Whether the application manages the read window itself.
    pub manual_window_management: bool,
    /// Starting size of the read window.
    pub initial_window_size: usize,
    /// Throughput policy; validated when present.
    pub monitoring_options: Option<MonitoringOptions>,
    /// Settings announced at HTTP/2 connection start.
    pub http2_initial_settings: Vec<Http2Setting>,
    /// When present, the connection is made through this proxy.
    pub proxy_options: Option<ProxyOptions>,
    /// Receives the connection, or the reason there is none. Fires exactly
    /// once.
    pub on_setup: OnSetupFn,
    /// Fires at most once, only after a successful setup.
    pub on_shutdown: Option<OnShutdownFn>,
}

impl fmt::Debug for ClientOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientOptions")
            .field("host_name", &self.host_name)
            .field("port", &self.port)
            .field("tls", &self.tls_options.is_some())
            .field("proxy", &self.proxy_options.is_some())
            .finish()
    }
}

/// Where one connect attempt stands with respect to its user callbacks.
enum SetupState {
    /// Setup has not been delivered yet.
    Pending {
        on_setup: OnSetupFn,
        on_shutdown: Option<OnShutdownFn>,
    },
    /// Setup succeeded; a shutdown may still be delivered.
    SetupDelivered { on_shutdown: Option<OnShutdownFn> },
    /// Every callback this attempt will ever fire has fired.
    Done,
}

/// Transient per-attempt record, alive until both callbacks are settled.
struct ClientBootstrap {
    using_tls: bool,
    manual_window_management: bool,
    initial_window_size: usize,
    host_name: Box<str>,
    monitoring_options: Option<MonitoringOptions>,
    http2_initial_settings: Vec<Http2Setting>,
    proxy_request_transform: Option<Arc<dyn RequestTransform>>,
    state: Mutex<SetupState>,
}

/// Starts one outbound HTTP connection.
///
/// Argument validation failures are returned synchronously and fire no
/// callback. Anything that goes wrong after validation, including a
/// synchronous failure to start the socket channel, is delivered through
/// `on_setup` instead.
pub fn connect(options: ClientOptions) -> crate::Result<()> {
    let ClientOptions {
        bootstrap,
        host_name,
        port,
        socket_options,
        tls_options,
        manual_window_management,
        initial_window_size,
        monitoring_options,
        http2_initial_settings,
        proxy_options,
        on_setup,
        on_shutdown,
    } = options;

    if host_name.is_empty() {
        debug!("a client connection needs a host name");
        return Err(crate::Error::new_invalid_argument());
    }
    if let Some(ref monitoring) = monitoring_options {
        if !monitoring.is_valid() {
            debug!("rejecting invalid monitoring options");
            return Err(crate::Error::new_invalid_argument());
        }
    }

    // The proxy-capable path aims the socket at the proxy and rewrites each
    // request through the transform; everything downstream is identical.
    let (target_host, target_port, proxy_request_transform) = match proxy_options {
        Some(proxy) => (
            proxy.endpoint.host,
            proxy.endpoint.port,
            Some(proxy.request_transform),
        ),
        None => (host_name.clone(), port, None),
    };

    let record = Arc::new(ClientBootstrap {
        using_tls: tls_options.is_some(),
        manual_window_management,
        initial_window_size,
        host_name: host_name.into_boxed_str(),
        monitoring_options,
        http2_initial_settings,
        proxy_request_transform,
        state: Mutex::new(SetupState::Pending {
            on_setup,
            on_shutdown,
        }),
    });

    let channel_options = ChannelOptions {
        host: target_host,
        port: target_port,
        socket_options,
        tls_options,
        on_setup: Box::new({
            let record = record.clone();
            move |result| record.on_channel_setup(result)
        }),
        on_shutdown: Box::new({
            let record = record.clone();
            move |result| record.on_channel_shutdown(result)
        }),
    };

    let vtable = hooks::system_vtable();
    if let Err(err) = (vtable.new_socket_channel)(&bootstrap, channel_options) {
        debug!("socket channel failed to start: {}", err);
        record.deliver_setup(Err(err));
    }
    Ok(())
}

// ===== impl ClientBootstrap =====

impl ClientBootstrap {
    /// Channel setup from the socket layer. The contract is strict: a
    /// channel arrives if and only if there is no error.
    fn on_channel_setup(&self, result: crate::Result<Arc<dyn Channel>>) {
        let channel = match result {
            Ok(channel) => channel,
            Err(err) => {
                self.deliver_setup(Err(err));
                return;
            }
        };
        trace!("channel ready, building connection");
        let built = factory::build(factory::Options {
            channel: &channel,
            role: Role::Client,
            is_using_tls: self.using_tls,
            manual_window_management: self.manual_window_management,
            initial_window_size: self.initial_window_size,
            http2_initial_settings: &self.http2_initial_settings,
            host_address: Some(&self.host_name),
        });
        match built {
            Ok(connection) => {
                if let Some(ref monitoring) = self.monitoring_options {
                    if let Err(err) = channel.enable_monitoring(monitoring) {
                        debug!("could not enable connection monitoring: {}", err);
                    }
                }
                if let Some(ref transform) = self.proxy_request_transform {
                    connection.set_proxy_request_transform(transform.clone());
                }
                self.deliver_setup(Ok(connection));
            }
            Err(err) => {
                channel.shutdown(Err(err.clone_kind()));
                self.deliver_setup(Err(err));
            }
        }
    }

    /// Channel shutdown from the socket layer. If setup was never delivered
    /// the channel died mid-handshake and the failure still goes out through
    /// `on_setup`.
    fn on_channel_shutdown(&self, result: crate::Result<()>) {
        enum Deliver {
            Setup(OnSetupFn, crate::Error),
            Shutdown(OnShutdownFn, crate::Result<()>),
            Nothing,
        }
        let deliver = {
            let mut state = self.state.lock().unwrap();
            match std::mem::replace(&mut *state, SetupState::Done) {
                SetupState::Pending { on_setup, .. } => {
                    let err = match result {
                        Err(err) => err,
                        Ok(()) => crate::Error::new_unknown(),
                    };
                    Deliver::Setup(on_setup, err)
                }
                SetupState::SetupDelivered { on_shutdown } => match on_shutdown {
                    Some(on_shutdown) => Deliver::Shutdown(on_shutdown, result),
                    None => Deliver::Nothing,
                },
                SetupState::Done => Deliver::Nothing,
            }
        };
        match deliver {
            Deliver::Setup(on_setup, err) => on_setup(Err(err)),
            Deliver::Shutdown(on_shutdown, result) => on_shutdown(result),
            Deliver::Nothing => {}
        }
    }

    fn deliver_setup(&self, result: crate::Result<Connection>) {
        let on_setup = {
            let mut state = self.state.lock().unwrap();
            match std::mem::replace(&mut *state, SetupState::Done) {
                SetupState::Pending {
                    on_setup,
                    on_shutdown,
                } => {
                    if result.is_ok() {
                        *state = SetupState::SetupDelivered { on_shutdown };
                    }
                    Some(on_setup)
                }
                other => {
                    // Setup already went out; nothing further to deliver.
                    *state = other;
                    None
                }
            }
        };
        if let Some(on_setup) = on_setup {
            on_setup(result);
        }
    }
}
