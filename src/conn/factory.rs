//! Builds protocol-versioned connections and splices them into channels.
//!
//! This is the single place where protocol choice, channel topology, and
//! connection construction meet, for both accepted and outbound channels.

use std::sync::Arc;

use bytes::Bytes;
use http::Version;
use tracing::{debug, warn};

use crate::channel::{Channel, Handler, Slot};
use crate::conn::{http1, http2, Connection, Http2Setting, Inner, Proto, Role};

/// Everything needed to promote one channel to an HTTP connection.
pub(crate) struct Options<'a> {
    pub(crate) channel: &'a Arc<dyn Channel>,
    pub(crate) role: Role,
    pub(crate) is_using_tls: bool,
    pub(crate) manual_window_management: bool,
    pub(crate) initial_window_size: usize,
    pub(crate) http2_initial_settings: &'a [Http2Setting],
    /// Recorded on the connection for client-side handles.
    pub(crate) host_address: Option<&'a str>,
}

/// Maps a negotiated ALPN protocol to an HTTP version.
///
/// The match is exact: `"http/1.1"` and `"h2"` select their versions, an
/// empty string means no negotiation happened and defaults to HTTP/1.1, and
/// anything else falls back to HTTP/1.1 with a warning.
fn version_from_alpn(protocol: &Bytes) -> Version {
    match &protocol[..] {
        b"http/1.1" => Version::HTTP_11,
        b"h2" => Version::HTTP_2,
        b"" => Version::HTTP_11,
        other => {
            warn!(
                "unrecognized ALPN protocol {:?}, defaulting to HTTP/1.1",
                String::from_utf8_lossy(other)
            );
            Version::HTTP_11
        }
    }
}

/// Builds a connection over `options.channel` and installs its handler in a
/// fresh slot at the tail of the slot chain.
///
/// Must run on the channel's event loop thread.
pub(crate) fn build(options: Options<'_>) -> crate::Result<Connection> {
    let channel = options.channel;
    debug_assert!(channel.is_on_event_loop_thread());

    // New tail slot; any failure past this point must remove it again.
    let slot = channel.new_slot()?;

    let version = if options.is_using_tls {
        let mut negotiated = None;
        let found = slot.with_inbound_handler(&mut |handler| {
            negotiated = Some(handler.alpn_protocol());
        });
        match negotiated {
            Some(protocol) => version_from_alpn(&protocol),
            None => {
                debug_assert!(!found);
                warn!("TLS in use but no inbound handler to query for ALPN");
                slot.remove();
                return Err(crate::Error::new_invalid_state()
                    .with("no inbound handler to query for the negotiated protocol"));
            }
        }
    } else {
        Version::HTTP_11
    };
    debug!("creating {:?} {:?} connection", version, options.role);

    let connection = match version {
        Version::HTTP_11 => {
            let shared = Arc::new(http1::Http1Shared::new(
                options.manual_window_management,
                options.initial_window_size,
            ));
            let handler = Box::new(http1::Http1Handler::new(
                shared.clone(),
                options.role,
                channel.max_message_size(),
            ));
            if let Err(err) = slot.set_handler(handler) {
                slot.remove();
                return Err(err);
            }
            let connection = Connection {
                inner: Arc::new(Inner::new(
                    version,
                    options.role,
                    channel.clone(),
                    slot.clone(),
                    options.host_address,
                    Proto::H1(shared),
                )),
            };
            let weak = Arc::downgrade(&connection.inner);
            slot.with_handler(&mut |handler| {
                if let Some(h1) = handler.as_any_mut().downcast_mut::<http1::Http1Handler>() {
                    h1.bind_connection(weak.clone());
                }
            });
            connection
        }
        Version::HTTP_2 => {
            let shared = Arc::new(http2::Http2Shared::new(
                options.manual_window_management,
                options.http2_initial_settings,
            ));
            let handler = Box::new(http2::Http2Handler::new(shared.clone()));
            if let Err(err) = slot.set_handler(handler) {
                slot.remove();
                return Err(err);
            }
            Connection {
                inner: Arc::new(Inner::new(
                    version,
                    options.role,
                    channel.clone(),
                    slot.clone(),
                    options.host_address,
                    Proto::H2(shared),
                )),
            }
        }
        _ => {
            slot.remove();
            return Err(crate::Error::new_unsupported_protocol());
        }
    };

    // Let the implementation finalize its in-channel state.
    slot.with_handler(&mut |handler| handler.on_installed(&*slot));

    Ok(connection)
}
