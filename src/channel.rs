//! The byte-channel interface this library builds connections on.
//!
//! A channel is one bidirectional byte stream with layered processing: an
//! ordered chain of slots, each holding a handler. Read messages flow from
//! the socket toward the application, write messages flow the other way.
//! The socket, TLS, and event loop machinery behind these traits live
//! outside this crate; connections only rely on the contracts below.
//!
//! Threading contract: every channel is bound to exactly one event loop
//! thread. A handler is only ever touched on that thread, either by the
//! channel driving `process_read_message`/`process_write_message`, or by a
//! task submitted through [`Slot::schedule_handler_task`]. That exclusivity
//! is what lets handlers keep mutable per-connection state without locks.

use std::any::Any;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;

/// One message moving through a channel.
#[derive(Debug, Clone)]
pub struct Message {
    /// The payload bytes.
    pub data: Bytes,
}

impl Message {
    /// Wraps payload bytes in a message.
    pub fn new(data: Bytes) -> Message {
        Message { data }
    }
}

/// The direction a message, or a shutdown, travels in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// From the socket toward the application.
    Read,
    /// From the application toward the socket.
    Write,
}

/// Work that runs on the channel's event loop thread with exclusive access
/// to one slot's handler.
pub type HandlerTask = Box<dyn FnOnce(&mut dyn Handler, &dyn Slot) + Send>;

/// Throughput expectations for a connection, enforced by an external
/// statistics handler installed on the channel.
#[derive(Debug, Clone, Copy)]
pub struct MonitoringOptions {
    /// Below this rate the connection is considered unhealthy.
    pub minimum_throughput_bytes_per_second: u64,
    /// How long throughput may stay below the minimum before the connection
    /// is torn down.
    pub allowable_throughput_failure_interval: Duration,
}

impl MonitoringOptions {
    /// Whether these options describe an enforceable policy.
    pub fn is_valid(&self) -> bool {
        self.minimum_throughput_bytes_per_second > 0
            && self.allowable_throughput_failure_interval >= Duration::from_secs(1)
    }
}

/// A participant installed in a channel slot.
///
/// All methods run on the channel's event loop thread.
pub trait Handler: Send + 'static {
    /// Processes a message flowing toward the application.
    fn process_read_message(&mut self, slot: &dyn Slot, message: Message) -> crate::Result<()>;

    /// Processes a message flowing toward the socket.
    fn process_write_message(&mut self, slot: &dyn Slot, message: Message) -> crate::Result<()>;

    /// Runs once after the handler has been bound to its slot.
    fn on_installed(&mut self, _slot: &dyn Slot) {}

    /// Notifies the handler that the channel is shutting down in the given
    /// direction.
    fn on_channel_shutdown(
        &mut self,
        slot: &dyn Slot,
        direction: Direction,
        result: crate::Result<()>,
    );

    /// The ALPN protocol this handler negotiated, empty when none was.
    ///
    /// Only TLS handlers return anything here.
    fn alpn_protocol(&self) -> Bytes {
        Bytes::new()
    }

    /// Downcast support for handler tasks.
    fn as_any_mut(&mut self) -> &mut dyn Any;
}

/// A position in a channel, occupied by a handler.
pub trait Slot: Send + Sync {
    /// The channel this slot belongs to.
    fn channel(&self) -> Arc<dyn Channel>;

    /// Binds a handler to this slot. Fails if one is already bound.
    fn set_handler(&self, handler: Box<dyn Handler>) -> crate::Result<()>;

    /// Removes this slot from the channel, dropping its handler.
    fn remove(&self);

    /// Runs `f` with the handler of the adjacent slot on the inbound side.
    ///
    /// Returns `false` when there is no such slot or it has no handler.
    fn with_inbound_handler(&self, f: &mut dyn FnMut(&dyn Handler)) -> bool;

    /// Runs `f` with this slot's own handler. Must be called on the event
    /// loop thread. Returns `false` when no handler is bound.
    fn with_handler(&self, f: &mut dyn FnMut(&mut dyn Handler)) -> bool;

    /// Sends a message toward the socket.
    fn send_write_message(&self, message: Message) -> crate::Result<()>;

    /// Passes a message on toward the application, past this slot.
    fn forward_read_message(&self, message: Message) -> crate::Result<()>;

    /// Enlarges the inbound receive window by `size` bytes.
    fn increment_read_window(&self, size: usize);

    /// Schedules `task` onto the channel's event loop thread with exclusive
    /// access to this slot's handler.
    fn schedule_handler_task(&self, task: HandlerTask);
}

/// One bidirectional byte stream with layered processing.
pub trait Channel: Send + Sync {
    /// Appends a fresh slot at the application end of the slot chain.
    fn new_slot(&self) -> crate::Result<Arc<dyn Slot>>;

    /// Begins channel shutdown. Idempotent; the first result wins.
    fn shutdown(&self, result: crate::Result<()>);

    /// Largest payload a single message may carry.
    fn max_message_size(&self) -> usize;

    /// Whether the caller is on the channel's event loop thread.
    fn is_on_event_loop_thread(&self) -> bool;

    /// Installs the external statistics handler that enforces `options`.
    fn enable_monitoring(&self, options: &MonitoringOptions) -> crate::Result<()>;
}

impl fmt::Debug for dyn Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Channel").finish()
    }
}

impl fmt::Debug for dyn Slot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Slot").finish()
    }
}
