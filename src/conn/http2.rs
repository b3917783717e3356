//! HTTP/2 connection state.
//!
//! The frame layer lives outside this crate; what belongs to the connection
//! is the operation surface and its bookkeeping: settings snapshots and the
//! acks they wait on, the ping queue, goaway records, and the single
//! cross-thread work task that moves user calls onto the event loop thread.

use std::any::Any;
use std::collections::VecDeque;
use std::mem;
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use tracing::{debug, trace};

use crate::channel::{Channel, Direction, Handler, Message, Slot};
use crate::error::Kind;

use super::{PingAckFn, SettingsAppliedFn, StreamId, MAX_STREAM_ID};

/// Ping frames carry exactly this many opaque bytes.
const PING_PAYLOAD_SIZE: usize = 8;

static ZERO_PING_PAYLOAD: [u8; PING_PAYLOAD_SIZE] = [0; PING_PAYLOAD_SIZE];

/// The RFC 7540 setting identifiers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Http2SettingId {
    /// SETTINGS_HEADER_TABLE_SIZE.
    HeaderTableSize,
    /// SETTINGS_ENABLE_PUSH.
    EnablePush,
    /// SETTINGS_MAX_CONCURRENT_STREAMS.
    MaxConcurrentStreams,
    /// SETTINGS_INITIAL_WINDOW_SIZE.
    InitialWindowSize,
    /// SETTINGS_MAX_FRAME_SIZE.
    MaxFrameSize,
    /// SETTINGS_MAX_HEADER_LIST_SIZE.
    MaxHeaderListSize,
}

/// One setting to announce to the peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Http2Setting {
    /// Which setting.
    pub id: Http2SettingId,
    /// Its new value.
    pub value: u32,
}

/// A full settings snapshot, initialized to the RFC 7540 defaults.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Http2Settings {
    /// Header compression table size.
    pub header_table_size: u32,
    /// Whether server push is allowed.
    pub enable_push: bool,
    /// Peer-enforced concurrency limit.
    pub max_concurrent_streams: u32,
    /// Initial per-stream flow-control window.
    pub initial_window_size: u32,
    /// Largest frame payload accepted.
    pub max_frame_size: u32,
    /// Advisory bound on header list size.
    pub max_header_list_size: u32,
}

impl Default for Http2Settings {
    fn default() -> Http2Settings {
        Http2Settings {
            header_table_size: 4_096,
            enable_push: true,
            max_concurrent_streams: u32::MAX,
            initial_window_size: 65_535,
            max_frame_size: 16_384,
            max_header_list_size: u32::MAX,
        }
    }
}

impl Http2Settings {
    fn apply(&mut self, setting: Http2Setting) {
        match setting.id {
            Http2SettingId::HeaderTableSize => self.header_table_size = setting.value,
            Http2SettingId::EnablePush => self.enable_push = setting.value != 0,
            Http2SettingId::MaxConcurrentStreams => self.max_concurrent_streams = setting.value,
            Http2SettingId::InitialWindowSize => self.initial_window_size = setting.value,
            Http2SettingId::MaxFrameSize => self.max_frame_size = setting.value,
            Http2SettingId::MaxHeaderListSize => self.max_header_list_size = setting.value,
        }
    }
}

/// Validates settings the way the peer would.
pub(crate) fn validate_settings(settings: &[Http2Setting]) -> crate::Result<()> {
    for setting in settings {
        let ok = match setting.id {
            Http2SettingId::EnablePush => setting.value <= 1,
            Http2SettingId::InitialWindowSize => setting.value <= MAX_STREAM_ID,
            Http2SettingId::MaxFrameSize => {
                (16_384..=16_777_215).contains(&setting.value)
            }
            _ => true,
        };
        if !ok {
            debug!("rejecting {:?} value {}", setting.id, setting.value);
            return Err(crate::Error::new_invalid_argument());
        }
    }
    Ok(())
}

/// A goaway frame as tracked by the connection.
#[derive(Debug, Clone)]
pub struct Http2Goaway {
    /// Highest stream id the sender will still process.
    pub last_stream_id: StreamId,
    /// The HTTP/2 error code carried by the frame.
    pub http2_error_code: u32,
    /// Opaque debug payload.
    pub debug_data: Bytes,
}

enum PendingOp {
    Settings {
        settings: Vec<Http2Setting>,
        on_completed: Option<SettingsAppliedFn>,
    },
    Ping {
        opaque_data: Bytes,
        on_ack: Option<PingAckFn>,
    },
    Goaway {
        http2_error_code: u32,
        allow_more_streams: bool,
        debug_data: Bytes,
    },
}

struct Synced {
    is_open: bool,
    new_stream_error: Option<Kind>,
    /// Single-writer bit for the cross-thread work task.
    is_cross_thread_work_scheduled: bool,
    window_update_size: usize,
    pending_ops: VecDeque<PendingOp>,
    local_settings: Http2Settings,
    remote_settings: Http2Settings,
    settings_awaiting_ack: VecDeque<(Vec<Http2Setting>, Option<SettingsAppliedFn>)>,
    pings_awaiting_ack: VecDeque<(Bytes, Option<PingAckFn>)>,
    sent_goaway: Option<Http2Goaway>,
    received_goaway: Option<Http2Goaway>,
    last_remote_stream_id: StreamId,
}

/// The lock-protected HTTP/2 connection state, shared between the public
/// handle and the channel handler.
pub(crate) struct Http2Shared {
    manual_window_management: bool,
    synced: Mutex<Synced>,
}

// ===== impl Http2Shared =====

impl Http2Shared {
    pub(crate) fn new(
        manual_window_management: bool,
        initial_settings: &[Http2Setting],
    ) -> Http2Shared {
        let mut settings_awaiting_ack = VecDeque::new();
        if !initial_settings.is_empty() {
            // The initial settings ride the connection preface; they become
            // local settings once the peer acks them.
            settings_awaiting_ack.push_back((initial_settings.to_vec(), None));
        }
        Http2Shared {
            manual_window_management,
            synced: Mutex::new(Synced {
                is_open: true,
                new_stream_error: None,
                is_cross_thread_work_scheduled: false,
                window_update_size: 0,
                pending_ops: VecDeque::new(),
                local_settings: Http2Settings::default(),
                remote_settings: Http2Settings::default(),
                settings_awaiting_ack,
                pings_awaiting_ack: VecDeque::new(),
                sent_goaway: None,
                received_goaway: None,
                last_remote_stream_id: 0,
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
            synced.window_update_size = synced.window_update_size.saturating_add(increment);
            !mem::replace(&mut synced.is_cross_thread_work_scheduled, true)
        };
        if schedule {
            schedule_cross_thread_work(slot);
        }
    }

    pub(crate) fn change_settings(
        &self,
        slot: &dyn Slot,
        settings: &[Http2Setting],
        on_completed: Option<SettingsAppliedFn>,
    ) -> crate::Result<()> {
        validate_settings(settings)?;
        self.enqueue(
            slot,
            PendingOp::Settings {
                settings: settings.to_vec(),
                on_completed,
            },
        )
    }

    pub(crate) fn ping(
        &self,
        slot: &dyn Slot,
        opaque_data: Option<Bytes>,
        on_ack: Option<PingAckFn>,
    ) -> crate::Result<()> {
        let opaque_data = match opaque_data {
            Some(data) => {
                if data.len() != PING_PAYLOAD_SIZE {
                    debug!("ping payload must be {} bytes", PING_PAYLOAD_SIZE);
                    return Err(crate::Error::new_invalid_argument());
                }
                data
            }
            None => Bytes::from_static(&ZERO_PING_PAYLOAD),
        };
        self.enqueue(
            slot,
            PendingOp::Ping {
                opaque_data,
                on_ack,
            },
        )
    }

    pub(crate) fn send_goaway(
        &self,
        slot: &dyn Slot,
        http2_error_code: u32,
        allow_more_streams: bool,
        debug_data: Option<Bytes>,
    ) -> crate::Result<()> {
        self.enqueue(
            slot,
            PendingOp::Goaway {
                http2_error_code,
                allow_more_streams,
                debug_data: debug_data.unwrap_or_else(Bytes::new),
            },
        )
    }

    pub(crate) fn sent_goaway(&self) -> Option<Http2Goaway> {
        self.synced.lock().unwrap().sent_goaway.clone()
    }

    pub(crate) fn received_goaway(&self) -> Option<Http2Goaway> {
        self.synced.lock().unwrap().received_goaway.clone()
    }

    pub(crate) fn local_settings(&self) -> Http2Settings {
        self.synced.lock().unwrap().local_settings
    }

    pub(crate) fn remote_settings(&self) -> Http2Settings {
        self.synced.lock().unwrap().remote_settings
    }

    fn enqueue(&self, slot: &dyn Slot, op: PendingOp) -> crate::Result<()> {
        let schedule = {
            let mut synced = self.synced.lock().unwrap();
            if !synced.is_open {
                let kind = synced.new_stream_error.unwrap_or(Kind::ConnectionClosed);
                return Err(crate::Error::new(kind));
            }
            synced.pending_ops.push_back(op);
            !mem::replace(&mut synced.is_cross_thread_work_scheduled, true)
        };
        if schedule {
            schedule_cross_thread_work(slot);
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
}

fn schedule_cross_thread_work(slot: &dyn Slot) {
    slot.schedule_handler_task(Box::new(|handler, slot| {
        if let Some(h2) = handler.as_any_mut().downcast_mut::<Http2Handler>() {
            h2.run_cross_thread_work(slot);
        }
    }));
}

// ===== impl Http2Handler =====

/// The channel handler for an HTTP/2 connection. Inbound bytes are consumed
/// by the external frame layer, which reports connection-level events back
/// through the `on_*` seams below.
pub(crate) struct Http2Handler {
    shared: Arc<Http2Shared>,
    bytes_read: u64,
}

impl Http2Handler {
    pub(crate) fn new(shared: Arc<Http2Shared>) -> Http2Handler {
        Http2Handler {
            shared,
            bytes_read: 0,
        }
    }

    pub(crate) fn run_cross_thread_work(&mut self, slot: &dyn Slot) {
        let (ops, window) = {
            let mut synced = self.shared.synced.lock().unwrap();
            synced.is_cross_thread_work_scheduled = false;
            (
                mem::take(&mut synced.pending_ops),
                mem::replace(&mut synced.window_update_size, 0),
            )
        };
        for op in ops {
            match op {
                PendingOp::Settings {
                    settings,
                    on_completed,
                } => {
                    trace!("SETTINGS handed to the frame layer, awaiting ack");
                    let mut synced = self.shared.synced.lock().unwrap();
                    synced.settings_awaiting_ack.push_back((settings, on_completed));
                }
                PendingOp::Ping { opaque_data, on_ack } => {
                    trace!("PING handed to the frame layer, awaiting ack");
                    let mut synced = self.shared.synced.lock().unwrap();
                    synced.pings_awaiting_ack.push_back((opaque_data, on_ack));
                }
                PendingOp::Goaway {
                    http2_error_code,
                    allow_more_streams,
                    debug_data,
                } => {
                    let mut synced = self.shared.synced.lock().unwrap();
                    let mut last_stream_id = if allow_more_streams {
                        MAX_STREAM_ID
                    } else {
                        synced.last_remote_stream_id
                    };
                    if let Some(ref prev) = synced.sent_goaway {
                        // A later goaway may only tighten the bound.
                        last_stream_id = last_stream_id.min(prev.last_stream_id);
                    }
                    debug!(
                        "GOAWAY sent, error_code={} last_stream_id={}",
                        http2_error_code, last_stream_id
                    );
                    synced.sent_goaway = Some(Http2Goaway {
                        last_stream_id,
                        http2_error_code,
                        debug_data,
                    });
                    if !allow_more_streams && synced.new_stream_error.is_none() {
                        synced.new_stream_error = Some(Kind::ConnectionClosed);
                    }
                }
            }
        }
        if window > 0 {
            trace!("applying coalesced window update of {}", window);
            slot.increment_read_window(window);
        }
    }

    /// The frame layer observed a SETTINGS ack from the peer.
    pub(crate) fn on_settings_ack(&mut self) {
        let on_completed = {
            let mut synced = self.shared.synced.lock().unwrap();
            match synced.settings_awaiting_ack.pop_front() {
                Some((settings, on_completed)) => {
                    for setting in &settings {
                        synced.local_settings.apply(*setting);
                    }
                    on_completed
                }
                None => {
                    debug!("SETTINGS ack with nothing awaiting one");
                    None
                }
            }
        };
        if let Some(on_completed) = on_completed {
            on_completed(Ok(()));
        }
    }

    /// The frame layer observed a PING ack carrying `opaque_data`.
    pub(crate) fn on_ping_ack(&mut self, opaque_data: Bytes) {
        let pending = {
            let mut synced = self.shared.synced.lock().unwrap();
            synced.pings_awaiting_ack.pop_front()
        };
        match pending {
            Some((sent, on_ack)) => {
                if sent != opaque_data {
                    debug!("PING ack payload does not match what was sent");
                }
                if let Some(on_ack) = on_ack {
                    on_ack(opaque_data, Ok(()));
                }
            }
            None => debug!("PING ack with nothing awaiting one"),
        }
    }

    /// The frame layer decoded a SETTINGS frame from the peer.
    pub(crate) fn on_remote_settings(&mut self, settings: &[Http2Setting]) {
        let mut synced = self.shared.synced.lock().unwrap();
        for setting in settings {
            synced.remote_settings.apply(*setting);
        }
    }

    /// The frame layer decoded a GOAWAY frame from the peer.
    pub(crate) fn on_goaway_received(&mut self, goaway: Http2Goaway) {
        debug!(
            "GOAWAY received, error_code={} last_stream_id={}",
            goaway.http2_error_code, goaway.last_stream_id
        );
        let mut synced = self.shared.synced.lock().unwrap();
        synced.received_goaway = Some(goaway);
        if synced.new_stream_error.is_none() {
            synced.new_stream_error = Some(Kind::ServerClosed);
        }
    }

    /// The frame layer opened stream `id` on behalf of the peer.
    pub(crate) fn on_remote_stream_opened(&mut self, id: StreamId) {
        let mut synced = self.shared.synced.lock().unwrap();
        if id > synced.last_remote_stream_id {
            synced.last_remote_stream_id = id;
        }
    }

    fn fail_pending(&mut self, kind: Kind) {
        let (ops, settings, pings) = {
            let mut synced = self.shared.synced.lock().unwrap();
            (
                mem::take(&mut synced.pending_ops),
                mem::take(&mut synced.settings_awaiting_ack),
                mem::take(&mut synced.pings_awaiting_ack),
            )
        };
        for op in ops {
            match op {
                PendingOp::Settings { on_completed, .. } => {
                    if let Some(on_completed) = on_completed {
                        on_completed(Err(crate::Error::new(kind)));
                    }
                }
                PendingOp::Ping {
                    opaque_data,
                    on_ack,
                } => {
                    if let Some(on_ack) = on_ack {
                        on_ack(opaque_data, Err(crate::Error::new(kind)));
                    }
                }
                PendingOp::Goaway { .. } => {}
            }
        }
        for (_, on_completed) in settings {
            if let Some(on_completed) = on_completed {
                on_completed(Err(crate::Error::new(kind)));
            }
        }
        for (opaque_data, on_ack) in pings {
            if let Some(on_ack) = on_ack {
                on_ack(opaque_data, Err(crate::Error::new(kind)));
            }
        }
    }
}

impl Handler for Http2Handler {
    fn process_read_message(&mut self, _slot: &dyn Slot, message: Message) -> crate::Result<()> {
        // Frames are decoded by the external frame layer; the connection only
        // accounts for the bytes.
        self.bytes_read += message.data.len() as u64;
        trace!("{} bytes toward the frame layer", message.data.len());
        Ok(())
    }

    fn process_write_message(&mut self, _slot: &dyn Slot, _message: Message) -> crate::Result<()> {
        debug!("unexpected write message reached the connection handler");
        Err(crate::Error::new_invalid_state())
    }

    fn on_installed(&mut self, _slot: &dyn Slot) {
        let synced = self.shared.synced.lock().unwrap();
        if !synced.settings_awaiting_ack.is_empty() {
            trace!("initial SETTINGS handed to the frame layer");
        }
    }

    fn on_channel_shutdown(
        &mut self,
        _slot: &dyn Slot,
        direction: Direction,
        result: crate::Result<()>,
    ) {
        if direction != Direction::Write {
            return;
        }
        let kind = match result {
            Ok(()) => Kind::ConnectionClosed,
            Err(err) => err.kind(),
        };
        self.shared.mark_closed(kind);
        self.fail_pending(kind);
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}
