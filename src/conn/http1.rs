//! HTTP/1.1 connection state.
//!
//! The state is split the way the threading model demands. Everything inside
//! [`Http1Handler`] belongs to the channel's event loop thread and is only
//! reached through the channel or a scheduled handler task. The small block
//! inside [`Http1Shared`] sits behind a mutex and is the only state other
//! threads may touch.

use std::any::Any;
use std::collections::VecDeque;
use std::mem;
use std::sync::{Arc, Mutex, Weak};
use std::time::{Duration, Instant};

use bytes::{Bytes, BytesMut};
use tracing::{debug, error, trace};

use crate::channel::{Channel, Direction, Handler, Message, Slot};
use crate::error::Kind;

use super::{Connection, Inner, Role, StreamId};

/// Callback fired once a stream has fully written and fully read.
pub(crate) type StreamCompleteFn = Box<dyn FnOnce(crate::Result<()>) + Send>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum StreamState {
    Pending,
    Active,
    Done,
    Errored,
}

/// One request/response exchange as the connection tracks it. The request
/// and response objects themselves live outside; this carries only the
/// serialized bytes moving through the channel.
pub(crate) struct StreamEntry {
    pub(crate) id: StreamId,
    pub(crate) state: StreamState,
    pub(crate) outgoing: Bytes,
    pub(crate) outgoing_done: bool,
    pub(crate) incoming: BytesMut,
    pub(crate) incoming_done: bool,
    pub(crate) on_complete: Option<StreamCompleteFn>,
}

impl StreamEntry {
    pub(crate) fn new(
        id: StreamId,
        outgoing: Bytes,
        on_complete: Option<StreamCompleteFn>,
    ) -> StreamEntry {
        StreamEntry {
            id,
            state: StreamState::Pending,
            outgoing,
            outgoing_done: false,
            incoming: BytesMut::new(),
            incoming_done: false,
            on_complete,
        }
    }

    fn fail(&mut self, err: crate::Error) {
        self.state = StreamState::Errored;
        if let Some(on_complete) = self.on_complete.take() {
            on_complete(Err(err));
        }
    }
}

/// Serializes the current outgoing stream into channel messages.
///
/// HTTP wire syntax is produced upstream; this only chops the already
/// serialized bytes to the channel's message size.
struct Encoder {
    max_message_size: usize,
}

impl Encoder {
    fn encode(&mut self, stream: &mut StreamEntry) -> Option<Message> {
        if stream.outgoing.is_empty() {
            return None;
        }
        let len = self.max_message_size.min(stream.outgoing.len());
        Some(Message::new(stream.outgoing.split_to(len)))
    }
}

/// Routes inbound bytes to the stream currently being deserialized.
struct Decoder;

impl Decoder {
    fn decode(&mut self, data: Bytes, stream: &mut StreamEntry) {
        stream.incoming.extend_from_slice(&data);
    }
}

/// Per-channel HTTP/1.1 statistics.
#[derive(Debug, Default)]
pub(crate) struct Http1Stats {
    pub(crate) bytes_read: u64,
    pub(crate) bytes_written: u64,
    pub(crate) streams_completed: u64,
    pub(crate) streams_failed: u64,
    pub(crate) outgoing_stream_duration: Duration,
    pub(crate) incoming_stream_duration: Duration,
}

struct Synced {
    is_open: bool,
    /// Non-empty means reject stream creation with this kind.
    new_stream_error: Option<Kind>,
    /// Single-writer bit for the outgoing-stream task.
    is_outgoing_stream_task_active: bool,
    /// Pending read-window growth; nonzero means the update task is
    /// scheduled.
    window_update_size: usize,
    /// Streams submitted off-thread, not yet seen by the event loop.
    new_client_streams: VecDeque<StreamEntry>,
}

/// The lock-protected half of an HTTP/1.1 connection, shared between the
/// public handle and the channel handler.
pub(crate) struct Http1Shared {
    manual_window_management: bool,
    initial_window_size: usize,
    synced: Mutex<Synced>,
}

// ===== impl Http1Shared =====

impl Http1Shared {
    pub(crate) fn new(manual_window_management: bool, initial_window_size: usize) -> Http1Shared {
        Http1Shared {
            manual_window_management,
            initial_window_size,
            synced: Mutex::new(Synced {
                is_open: true,
                new_stream_error: None,
                is_outgoing_stream_task_active: false,
                window_update_size: 0,
                new_client_streams: VecDeque::new(),
            }),
        }
    }

    pub(crate) fn is_open(&self) -> bool {
        self.synced.lock().unwrap().is_open
    }

    pub(crate) fn new_requests_allowed(&self) -> bool {
        let synced = self.synced.lock().unwrap();
        synced.is_open && synced.new_stream_error.is_none()
    }

    pub(crate) fn close(&self, channel: &dyn Channel) {
        {
            let mut synced = self.synced.lock().unwrap();
            if synced.is_open {
                synced.is_open = false;
                if synced.new_stream_error.is_none() {
                    synced.new_stream_error = Some(Kind::ConnectionClosed);
                }
            }
        }
        channel.shutdown(Ok(()));
    }

    /// Accumulates a window increment and arms the update task on the
    /// zero-to-nonzero edge, so any number of off-thread increments collapse
    /// into one task run.
    pub(crate) fn update_window(&self, slot: &dyn Slot, increment: usize) {
        if !self.manual_window_management {
            debug!("update_window ignored, manual window management is off");
            return;
        }
        if increment == 0 {
            return;
        }
        let schedule = {
            let mut synced = self.synced.lock().unwrap();
            if !synced.is_open {
                return;
            }
            let was_zero = synced.window_update_size == 0;
            synced.window_update_size = synced.window_update_size.saturating_add(increment);
            was_zero
        };
        if schedule {
            slot.schedule_handler_task(Box::new(|handler, slot| {
                if let Some(h1) = handler.as_any_mut().downcast_mut::<Http1Handler>() {
                    h1.run_window_update_task(slot);
                }
            }));
        }
    }

    /// Queues a freshly submitted stream and arms the outgoing-stream task
    /// on the false-to-true edge of its scheduling bit.
    pub(crate) fn submit_stream(&self, slot: &dyn Slot, stream: StreamEntry) -> crate::Result<()> {
        let schedule = {
            let mut synced = self.synced.lock().unwrap();
            if let Some(kind) = synced.new_stream_error {
                return Err(crate::Error::new(kind));
            }
            if !synced.is_open {
                return Err(crate::Error::new_connection_closed());
            }
            synced.new_client_streams.push_back(stream);
            if synced.is_outgoing_stream_task_active {
                false
            } else {
                synced.is_outgoing_stream_task_active = true;
                true
            }
        };
        if schedule {
            slot.schedule_handler_task(Box::new(|handler, slot| {
                if let Some(h1) = handler.as_any_mut().downcast_mut::<Http1Handler>() {
                    h1.run_outgoing_stream_task(slot);
                }
            }));
        }
        Ok(())
    }

    fn mark_closed(&self, kind: Kind) {
        let mut synced = self.synced.lock().unwrap();
        synced.is_open = false;
        if synced.new_stream_error.is_none() {
            synced.new_stream_error = Some(kind);
        }
    }

    fn mark_new_streams_rejected(&self, kind: Kind) {
        let mut synced = self.synced.lock().unwrap();
        if synced.new_stream_error.is_none() {
            synced.new_stream_error = Some(kind);
        }
    }

    fn take_new_streams(&self) -> VecDeque<StreamEntry> {
        mem::take(&mut self.synced.lock().unwrap().new_client_streams)
    }
}

// ===== impl Http1Handler =====

/// The channel handler carrying the event-loop-thread half of an HTTP/1.1
/// connection.
pub(crate) struct Http1Handler {
    conn: Weak<Inner>,
    role: Role,
    shared: Arc<Http1Shared>,
    encoder: Encoder,
    decoder: Decoder,
    /// In-flight streams, oldest first. The cursors below always name
    /// members of this list.
    stream_list: VecDeque<StreamEntry>,
    /// Stream currently being serialized.
    outgoing_stream: Option<StreamId>,
    /// Stream currently being deserialized.
    incoming_stream: Option<StreamId>,
    /// Read messages held for verbatim passthrough after an upgrade.
    midchannel_read_messages: VecDeque<Message>,
    is_reading_stopped: bool,
    is_writing_stopped: bool,
    has_switched_protocols: bool,
    can_create_request_handler_stream: bool,
    stats: Http1Stats,
    outgoing_stream_started_at: Option<Instant>,
    incoming_stream_started_at: Option<Instant>,
}

impl Http1Handler {
    pub(crate) fn new(
        shared: Arc<Http1Shared>,
        role: Role,
        max_message_size: usize,
    ) -> Http1Handler {
        Http1Handler {
            conn: Weak::new(),
            role,
            shared,
            encoder: Encoder { max_message_size },
            decoder: Decoder,
            stream_list: VecDeque::new(),
            outgoing_stream: None,
            incoming_stream: None,
            midchannel_read_messages: VecDeque::new(),
            is_reading_stopped: false,
            is_writing_stopped: false,
            has_switched_protocols: false,
            can_create_request_handler_stream: role == Role::Server,
            stats: Http1Stats::default(),
            outgoing_stream_started_at: None,
            incoming_stream_started_at: None,
        }
    }

    pub(crate) fn bind_connection(&mut self, conn: Weak<Inner>) {
        self.conn = conn;
    }

    /// Marks the protocol switch. Terminal: from here on the connection is a
    /// pass-through for mid-channel messages.
    pub(crate) fn set_switched_protocols(&mut self) {
        if self.has_switched_protocols {
            return;
        }
        trace!("connection switched protocols, HTTP is over on this channel");
        self.has_switched_protocols = true;
        self.can_create_request_handler_stream = false;
        self.shared.mark_new_streams_rejected(Kind::InvalidState);
    }

    /// Marks the response (or request) currently being read as complete and
    /// advances the incoming cursor.
    pub(crate) fn finish_incoming_stream(&mut self) {
        let id = match self.incoming_stream.take() {
            Some(id) => id,
            None => return,
        };
        if let Some(entry) = self.stream_list.iter_mut().find(|s| s.id == id) {
            entry.incoming_done = true;
        }
        if let Some(started) = self.incoming_stream_started_at.take() {
            self.stats.incoming_stream_duration += started.elapsed();
        }
        self.complete_finished_streams();
    }

    #[cfg(test)]
    pub(crate) fn stats(&self) -> &Http1Stats {
        &self.stats
    }

    #[cfg(test)]
    pub(crate) fn stream_ids(&self) -> Vec<StreamId> {
        self.stream_list.iter().map(|s| s.id).collect()
    }

    pub(crate) fn run_outgoing_stream_task(&mut self, slot: &dyn Slot) {
        loop {
            self.admit_new_streams();
            self.pump_outgoing(slot);
            let mut synced = self.shared.synced.lock().unwrap();
            if synced.new_client_streams.is_empty() || self.is_writing_stopped {
                synced.is_outgoing_stream_task_active = false;
                return;
            }
            // More streams arrived while pumping; keep going in this run
            // instead of bouncing through the scheduler.
        }
    }

    pub(crate) fn run_window_update_task(&mut self, slot: &dyn Slot) {
        let total = {
            let mut synced = self.shared.synced.lock().unwrap();
            mem::replace(&mut synced.window_update_size, 0)
        };
        if total > 0 {
            trace!("applying coalesced window update of {}", total);
            slot.increment_read_window(total);
        }
    }

    fn admit_new_streams(&mut self) {
        let admitted = self.shared.take_new_streams();
        if admitted.is_empty() {
            return;
        }
        let transform = self
            .conn
            .upgrade()
            .and_then(|inner| inner.proxy_request_transform());
        for mut entry in admitted {
            if let Some(ref transform) = transform {
                if let Err(err) = transform.transform(&mut entry.outgoing) {
                    debug!("request transform failed: {}", err);
                    self.stats.streams_failed += 1;
                    entry.fail(err);
                    continue;
                }
            }
            self.stream_list.push_back(entry);
        }
    }

    fn pump_outgoing(&mut self, slot: &dyn Slot) {
        while !self.is_writing_stopped {
            let idx = match self.stream_list.iter().position(|s| !s.outgoing_done) {
                Some(idx) => idx,
                None => {
                    self.outgoing_stream = None;
                    return;
                }
            };
            let id = self.stream_list[idx].id;
            if self.outgoing_stream != Some(id) {
                // Pipelining: the cursor advances to the next stream right
                // here, without re-entering the task scheduler.
                self.outgoing_stream = Some(id);
                self.outgoing_stream_started_at = Some(Instant::now());
                self.stream_list[idx].state = StreamState::Active;
            }
            match self.encoder.encode(&mut self.stream_list[idx]) {
                Some(message) => {
                    let len = message.data.len() as u64;
                    if let Err(err) = slot.send_write_message(message) {
                        self.stop_writing_on_error(slot, err);
                        return;
                    }
                    self.stats.bytes_written += len;
                }
                None => {
                    self.stream_list[idx].outgoing_done = true;
                    if let Some(started) = self.outgoing_stream_started_at.take() {
                        self.stats.outgoing_stream_duration += started.elapsed();
                    }
                    self.complete_finished_streams();
                }
            }
        }
    }

    fn complete_finished_streams(&mut self) {
        while let Some(front) = self.stream_list.front() {
            if !(front.outgoing_done && front.incoming_done) {
                return;
            }
            let mut entry = self.stream_list.pop_front().expect("front checked");
            entry.state = StreamState::Done;
            if self.outgoing_stream == Some(entry.id) {
                self.outgoing_stream = None;
            }
            if self.incoming_stream == Some(entry.id) {
                self.incoming_stream = None;
            }
            self.stats.streams_completed += 1;
            if let Some(on_complete) = entry.on_complete.take() {
                on_complete(Ok(()));
            }
        }
    }

    fn begin_incoming_stream(&mut self, slot: &dyn Slot) -> crate::Result<()> {
        match self.role {
            Role::Server => {
                if !self.can_create_request_handler_stream {
                    let err = crate::Error::new_connection_closed();
                    self.stop_reading_on_error(slot, err);
                    return Err(crate::Error::new_connection_closed());
                }
                let inner = match self.conn.upgrade() {
                    Some(inner) => inner,
                    None => {
                        self.is_reading_stopped = true;
                        return Ok(());
                    }
                };
                let connection = Connection { inner };
                let on_incoming_request = match connection.incoming_request_callback() {
                    Some(callback) => callback,
                    None => {
                        error!("request arrived before the connection was configured");
                        let err = crate::Error::new_reaction_required();
                        self.stop_reading_on_error(slot, err);
                        return Err(crate::Error::new_reaction_required());
                    }
                };
                let id = match connection.next_stream_id() {
                    Ok(id) => id,
                    Err(err) => {
                        let reported = err.clone_kind();
                        self.stop_reading_on_error(slot, err);
                        return Err(reported);
                    }
                };
                let mut entry = StreamEntry::new(id, Bytes::new(), None);
                entry.state = StreamState::Active;
                self.stream_list.push_back(entry);
                self.incoming_stream = Some(id);
                self.incoming_stream_started_at = Some(Instant::now());
                on_incoming_request(&connection);
                Ok(())
            }
            Role::Client => {
                // The next response belongs to the oldest stream still
                // waiting to read.
                match self
                    .stream_list
                    .iter()
                    .find(|s| !s.incoming_done)
                    .map(|s| s.id)
                {
                    Some(id) => {
                        self.incoming_stream = Some(id);
                        self.incoming_stream_started_at = Some(Instant::now());
                        Ok(())
                    }
                    None => {
                        debug!("response bytes arrived with no stream to read them");
                        let err = crate::Error::new_invalid_state();
                        self.stop_reading_on_error(slot, err);
                        Err(crate::Error::new_invalid_state())
                    }
                }
            }
        }
    }

    fn drain_midchannel(&mut self, slot: &dyn Slot) -> crate::Result<()> {
        while let Some(message) = self.midchannel_read_messages.pop_front() {
            if let Err(err) = slot.forward_read_message(message.clone()) {
                self.midchannel_read_messages.push_front(message);
                return Err(err);
            }
        }
        Ok(())
    }

    fn stop_reading_on_error(&mut self, slot: &dyn Slot, err: crate::Error) {
        self.is_reading_stopped = true;
        self.can_create_request_handler_stream = false;
        self.shared.mark_closed(err.kind());
        slot.channel().shutdown(Err(err));
    }

    fn stop_writing_on_error(&mut self, slot: &dyn Slot, err: crate::Error) {
        self.is_writing_stopped = true;
        if let Some(id) = self.outgoing_stream {
            if let Some(entry) = self.stream_list.iter_mut().find(|s| s.id == id) {
                self.stats.streams_failed += 1;
                entry.fail(err.clone_kind());
            }
        }
        self.shared.mark_closed(err.kind());
        slot.channel().shutdown(Err(err));
    }

    fn fail_all_streams(&mut self, kind: Kind) {
        let mut abandoned = self.shared.take_new_streams();
        for entry in self.stream_list.drain(..) {
            abandoned.push_back(entry);
        }
        self.outgoing_stream = None;
        self.incoming_stream = None;
        for mut entry in abandoned {
            if entry.state == StreamState::Done || entry.state == StreamState::Errored {
                continue;
            }
            self.stats.streams_failed += 1;
            entry.fail(crate::Error::new(kind));
        }
    }
}

impl Handler for Http1Handler {
    fn process_read_message(&mut self, slot: &dyn Slot, message: Message) -> crate::Result<()> {
        if self.has_switched_protocols {
            self.midchannel_read_messages.push_back(message);
            return self.drain_midchannel(slot);
        }
        if self.is_reading_stopped {
            trace!("dropping {} read bytes, reading is stopped", message.data.len());
            return Ok(());
        }
        self.stats.bytes_read += message.data.len() as u64;
        if self.incoming_stream.is_none() {
            self.begin_incoming_stream(slot)?;
        }
        let id = match self.incoming_stream {
            Some(id) => id,
            None => return Ok(()),
        };
        if let Some(entry) = self.stream_list.iter_mut().find(|s| s.id == id) {
            self.decoder.decode(message.data, entry);
        }
        Ok(())
    }

    fn process_write_message(&mut self, slot: &dyn Slot, message: Message) -> crate::Result<()> {
        if self.has_switched_protocols {
            return slot.send_write_message(message);
        }
        debug!("unexpected write message reached the connection handler");
        Err(crate::Error::new_invalid_state())
    }

    fn on_installed(&mut self, slot: &dyn Slot) {
        if self.initial_window_size() > 0 {
            slot.increment_read_window(self.initial_window_size());
        }
    }

    fn on_channel_shutdown(
        &mut self,
        _slot: &dyn Slot,
        direction: Direction,
        result: crate::Result<()>,
    ) {
        let kind = match result {
            Ok(()) => Kind::ConnectionClosed,
            Err(err) => err.kind(),
        };
        match direction {
            Direction::Read => {
                self.is_reading_stopped = true;
                self.can_create_request_handler_stream = false;
            }
            Direction::Write => {
                self.is_writing_stopped = true;
                self.shared.mark_closed(kind);
                self.fail_all_streams(kind);
            }
        }
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

impl Http1Handler {
    fn initial_window_size(&self) -> usize {
        self.shared.initial_window_size
    }
}
