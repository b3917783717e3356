//! Test doubles for the channel and bootstrap layers.
//!
//! `MockEventLoop` is a real thread draining a job queue, which is enough to
//! honor the threading contract: handler access only happens on that thread,
//! and everything asynchronous (accept delivery, channel shutdown, handler
//! tasks) is a posted job. Tests drive the mocks from the test thread and
//! synchronize with `barrier` or their own channels.

use std::mem;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use std::sync::{Arc, Mutex, Weak};
use std::thread::{self, JoinHandle, ThreadId};

use bytes::Bytes;

use crate::bootstrap::{
    AcceptChannelSetupFn, AcceptChannelShutdownFn, ChannelOptions, ClientChannelBootstrap,
    Listener, ListenerDestroyFn, ListenerOptions, ServerBootstrap,
};
use crate::channel::{
    Channel, Direction, Handler, HandlerTask, Message, MonitoringOptions, Slot,
};

pub(crate) fn clone_result(result: &crate::Result<()>) -> crate::Result<()> {
    match result {
        Ok(()) => Ok(()),
        Err(err) => Err(err.clone_kind()),
    }
}

// ===== MockEventLoop =====

enum Job {
    Run(Box<dyn FnOnce() + Send>),
    Stop,
}

pub(crate) struct MockEventLoop {
    tx: mpsc::Sender<Job>,
    thread_id: ThreadId,
    join: Mutex<Option<JoinHandle<()>>>,
}

impl MockEventLoop {
    pub(crate) fn spawn() -> Arc<MockEventLoop> {
        let (tx, rx) = mpsc::channel::<Job>();
        let (id_tx, id_rx) = mpsc::channel();
        let join = thread::spawn(move || {
            id_tx.send(thread::current().id()).unwrap();
            while let Ok(job) = rx.recv() {
                match job {
                    Job::Run(job) => job(),
                    Job::Stop => break,
                }
            }
        });
        let thread_id = id_rx.recv().unwrap();
        Arc::new(MockEventLoop {
            tx,
            thread_id,
            join: Mutex::new(Some(join)),
        })
    }

    pub(crate) fn post(&self, job: impl FnOnce() + Send + 'static) {
        let _ = self.tx.send(Job::Run(Box::new(job)));
    }

    /// Runs `job` on the loop thread and returns its result.
    pub(crate) fn run_in_loop<R: Send + 'static>(
        &self,
        job: impl FnOnce() -> R + Send + 'static,
    ) -> R {
        let (tx, rx) = mpsc::channel();
        self.post(move || {
            let _ = tx.send(job());
        });
        rx.recv().expect("mock event loop is gone")
    }

    /// Returns once every job queued so far has run.
    pub(crate) fn barrier(&self) {
        self.run_in_loop(|| ());
    }

    /// Stalls the loop until the returned guard is dropped, so a test can
    /// queue work and then act before any of it runs.
    pub(crate) fn pause(&self) -> LoopPause {
        let (tx, rx) = mpsc::channel::<()>();
        self.post(move || {
            let _ = rx.recv();
        });
        LoopPause { _tx: tx }
    }
}

/// Guard holding the mock event loop stalled; dropping it resumes the loop.
pub(crate) struct LoopPause {
    _tx: mpsc::Sender<()>,
}

impl Drop for MockEventLoop {
    fn drop(&mut self) {
        let _ = self.tx.send(Job::Stop);
        // The final reference can die on the loop thread itself, inside a
        // job that dropped the last channel; joining would deadlock there.
        if thread::current().id() != self.thread_id {
            if let Some(join) = self.join.lock().unwrap().take() {
                let _ = join.join();
            }
        }
    }
}

// ===== MockTlsHandler =====

/// Stands in for a TLS handler: carries a negotiated ALPN protocol and
/// otherwise ignores traffic.
struct MockTlsHandler {
    protocol: Bytes,
}

impl Handler for MockTlsHandler {
    fn process_read_message(&mut self, _slot: &dyn Slot, _message: Message) -> crate::Result<()> {
        Ok(())
    }

    fn process_write_message(&mut self, _slot: &dyn Slot, _message: Message) -> crate::Result<()> {
        Ok(())
    }

    fn on_channel_shutdown(
        &mut self,
        _slot: &dyn Slot,
        _direction: Direction,
        _result: crate::Result<()>,
    ) {
    }

    fn alpn_protocol(&self) -> Bytes {
        self.protocol.clone()
    }

    fn as_any_mut(&mut self) -> &mut dyn std::any::Any {
        self
    }
}

// ===== MockSlot =====

pub(crate) struct MockSlot {
    own: Weak<MockSlot>,
    channel: Weak<MockChannel>,
    handler: Mutex<Option<Box<dyn Handler>>>,
    written: Mutex<Vec<Message>>,
    forwarded: Mutex<Vec<Message>>,
    window_increments: Mutex<Vec<usize>>,
}

impl MockSlot {
    fn arc_channel(&self) -> Arc<MockChannel> {
        self.channel.upgrade().expect("mock channel dropped")
    }

    pub(crate) fn written_bytes(&self) -> Vec<u8> {
        let written = self.written.lock().unwrap();
        let mut bytes = Vec::new();
        for message in written.iter() {
            bytes.extend_from_slice(&message.data);
        }
        bytes
    }

    pub(crate) fn written_messages(&self) -> usize {
        self.written.lock().unwrap().len()
    }

    pub(crate) fn forwarded_bytes(&self) -> Vec<u8> {
        let forwarded = self.forwarded.lock().unwrap();
        let mut bytes = Vec::new();
        for message in forwarded.iter() {
            bytes.extend_from_slice(&message.data);
        }
        bytes
    }

    pub(crate) fn window_increments(&self) -> Vec<usize> {
        self.window_increments.lock().unwrap().clone()
    }
}

impl Slot for MockSlot {
    fn channel(&self) -> Arc<dyn Channel> {
        self.arc_channel()
    }

    fn set_handler(&self, handler: Box<dyn Handler>) -> crate::Result<()> {
        let channel = self.arc_channel();
        if channel.fail_next_set_handler.swap(false, Ordering::SeqCst) {
            return Err(crate::Error::new_unknown());
        }
        let mut guard = self.handler.lock().unwrap();
        if guard.is_some() {
            return Err(crate::Error::new_invalid_state());
        }
        *guard = Some(handler);
        Ok(())
    }

    fn remove(&self) {
        if let Some(channel) = self.channel.upgrade() {
            channel.remove_slot(self);
        }
    }

    fn with_inbound_handler(&self, f: &mut dyn FnMut(&dyn Handler)) -> bool {
        let channel = self.arc_channel();
        let inbound = match channel.inbound_of(self) {
            Some(inbound) => inbound,
            None => return false,
        };
        let guard = inbound.handler.lock().unwrap();
        match guard.as_ref() {
            Some(handler) => {
                f(&**handler);
                true
            }
            None => false,
        }
    }

    fn with_handler(&self, f: &mut dyn FnMut(&mut dyn Handler)) -> bool {
        let mut guard = self.handler.lock().unwrap();
        match guard.as_mut() {
            Some(handler) => {
                f(&mut **handler);
                true
            }
            None => false,
        }
    }

    fn send_write_message(&self, message: Message) -> crate::Result<()> {
        let channel = self.arc_channel();
        if channel.fail_writes.load(Ordering::SeqCst) {
            return Err(crate::Error::new_connection_closed());
        }
        self.written.lock().unwrap().push(message);
        Ok(())
    }

    fn forward_read_message(&self, message: Message) -> crate::Result<()> {
        self.forwarded.lock().unwrap().push(message);
        Ok(())
    }

    fn increment_read_window(&self, size: usize) {
        self.window_increments.lock().unwrap().push(size);
    }

    fn schedule_handler_task(&self, task: HandlerTask) {
        let slot = self.own.upgrade().expect("mock slot dropped");
        let event_loop = self.arc_channel().event_loop.clone();
        event_loop.post(move || {
            let mut guard = slot.handler.lock().unwrap();
            if let Some(handler) = guard.as_mut() {
                task(&mut **handler, &*slot);
            }
        });
    }
}

// ===== MockChannel =====

struct ChannelState {
    slots: Vec<Arc<MockSlot>>,
    is_shut_down: bool,
    shutdown_result: Option<crate::Result<()>>,
    shutdown_hooks: Vec<Box<dyn FnOnce(crate::Result<()>) + Send>>,
    monitoring: Option<MonitoringOptions>,
}

pub(crate) struct MockChannel {
    own: Weak<MockChannel>,
    event_loop: Arc<MockEventLoop>,
    max_message_size: usize,
    fail_next_new_slot: AtomicBool,
    fail_next_set_handler: AtomicBool,
    fail_writes: AtomicBool,
    state: Mutex<ChannelState>,
}

impl MockChannel {
    pub(crate) fn slot_count(&self) -> usize {
        self.state.lock().unwrap().slots.len()
    }

    /// The slot holding the connection handler, at the tail of the chain.
    pub(crate) fn tail_slot(&self) -> Arc<MockSlot> {
        self.state
            .lock()
            .unwrap()
            .slots
            .last()
            .expect("no slots in mock channel")
            .clone()
    }

    pub(crate) fn is_shut_down(&self) -> bool {
        self.state.lock().unwrap().is_shut_down
    }

    pub(crate) fn recorded_shutdown(&self) -> Option<crate::Result<()>> {
        self.state
            .lock()
            .unwrap()
            .shutdown_result
            .as_ref()
            .map(clone_result)
    }

    pub(crate) fn monitoring(&self) -> Option<MonitoringOptions> {
        self.state.lock().unwrap().monitoring
    }

    pub(crate) fn fail_next_new_slot(&self) {
        self.fail_next_new_slot.store(true, Ordering::SeqCst);
    }

    pub(crate) fn fail_next_set_handler(&self) {
        self.fail_next_set_handler.store(true, Ordering::SeqCst);
    }

    pub(crate) fn fail_writes(&self) {
        self.fail_writes.store(true, Ordering::SeqCst);
    }

    /// Registers a hook run when the channel shuts down; the bootstrap mocks
    /// use this to deliver their shutdown callbacks in order.
    pub(crate) fn push_shutdown_hook(&self, hook: Box<dyn FnOnce(crate::Result<()>) + Send>) {
        let mut state = self.state.lock().unwrap();
        assert!(!state.is_shut_down, "hook registered after shutdown");
        state.shutdown_hooks.push(hook);
    }

    /// Delivers socket-side bytes to the tail handler, as the channel would.
    pub(crate) fn deliver_read(&self, message: Message) {
        let channel = self.own.upgrade().expect("mock channel dropped");
        self.event_loop.post(move || {
            let slot = channel.tail_slot();
            let mut guard = slot.handler.lock().unwrap();
            if let Some(handler) = guard.as_mut() {
                let _ = handler.process_read_message(&*slot, message);
            }
        });
    }

    fn inbound_of(&self, slot: &MockSlot) -> Option<Arc<MockSlot>> {
        let state = self.state.lock().unwrap();
        let index = state
            .slots
            .iter()
            .position(|s| std::ptr::eq(&**s, slot))?;
        if index == 0 {
            None
        } else {
            Some(state.slots[index - 1].clone())
        }
    }

    fn remove_slot(&self, slot: &MockSlot) {
        let mut state = self.state.lock().unwrap();
        state.slots.retain(|s| !std::ptr::eq(&**s, slot));
    }

    fn run_shutdown(&self, result: crate::Result<()>) {
        let (slots, hooks) = {
            let mut state = self.state.lock().unwrap();
            (state.slots.clone(), mem::take(&mut state.shutdown_hooks))
        };
        for slot in &slots {
            let mut guard = slot.handler.lock().unwrap();
            if let Some(handler) = guard.as_mut() {
                handler.on_channel_shutdown(&**slot, Direction::Read, clone_result(&result));
                handler.on_channel_shutdown(&**slot, Direction::Write, clone_result(&result));
            }
        }
        for hook in hooks {
            hook(clone_result(&result));
        }
    }
}

impl Channel for MockChannel {
    fn new_slot(&self) -> crate::Result<Arc<dyn Slot>> {
        if self.fail_next_new_slot.swap(false, Ordering::SeqCst) {
            return Err(crate::Error::new_unknown());
        }
        let slot = Arc::new_cyclic(|own| MockSlot {
            own: own.clone(),
            channel: self.own.clone(),
            handler: Mutex::new(None),
            written: Mutex::new(Vec::new()),
            forwarded: Mutex::new(Vec::new()),
            window_increments: Mutex::new(Vec::new()),
        });
        self.state.lock().unwrap().slots.push(slot.clone());
        Ok(slot)
    }

    fn shutdown(&self, result: crate::Result<()>) {
        {
            let mut state = self.state.lock().unwrap();
            if state.is_shut_down {
                return;
            }
            state.is_shut_down = true;
            state.shutdown_result = Some(clone_result(&result));
        }
        let channel = self.own.upgrade().expect("mock channel dropped");
        self.event_loop.post(move || channel.run_shutdown(result));
    }

    fn max_message_size(&self) -> usize {
        self.max_message_size
    }

    fn is_on_event_loop_thread(&self) -> bool {
        thread::current().id() == self.event_loop.thread_id
    }

    fn enable_monitoring(&self, options: &MonitoringOptions) -> crate::Result<()> {
        self.state.lock().unwrap().monitoring = Some(*options);
        Ok(())
    }
}

pub(crate) struct MockChannelBuilder<'a> {
    event_loop: &'a Arc<MockEventLoop>,
    tls_protocol: Option<Bytes>,
    max_message_size: usize,
}

impl<'a> MockChannelBuilder<'a> {
    pub(crate) fn new(event_loop: &'a Arc<MockEventLoop>) -> MockChannelBuilder<'a> {
        MockChannelBuilder {
            event_loop,
            tls_protocol: None,
            max_message_size: 16 * 1024,
        }
    }

    /// Installs a TLS stand-in as the first slot, reporting `protocol` from
    /// ALPN.
    pub(crate) fn tls_handler(mut self, protocol: &'static [u8]) -> MockChannelBuilder<'a> {
        self.tls_protocol = Some(Bytes::from_static(protocol));
        self
    }

    pub(crate) fn max_message_size(mut self, size: usize) -> MockChannelBuilder<'a> {
        self.max_message_size = size;
        self
    }

    pub(crate) fn build(self) -> Arc<MockChannel> {
        let channel = Arc::new_cyclic(|own| MockChannel {
            own: own.clone(),
            event_loop: self.event_loop.clone(),
            max_message_size: self.max_message_size,
            fail_next_new_slot: AtomicBool::new(false),
            fail_next_set_handler: AtomicBool::new(false),
            fail_writes: AtomicBool::new(false),
            state: Mutex::new(ChannelState {
                slots: Vec::new(),
                is_shut_down: false,
                shutdown_result: None,
                shutdown_hooks: Vec::new(),
                monitoring: None,
            }),
        });
        if let Some(protocol) = self.tls_protocol {
            let installed = channel.clone();
            self.event_loop.run_in_loop(move || {
                let slot = installed.new_slot().expect("tls slot");
                slot.set_handler(Box::new(MockTlsHandler { protocol }))
                    .expect("tls handler");
            });
        }
        channel
    }
}

// ===== MockServerBootstrap =====

struct ListenerCounters {
    pending_children: usize,
    destroy_requested: bool,
}

pub(crate) struct MockListenerInner {
    own: Weak<MockListenerInner>,
    event_loop: Arc<MockEventLoop>,
    on_accept_setup: AcceptChannelSetupFn,
    on_accept_shutdown: Arc<AcceptChannelShutdownFn>,
    on_destroy: Mutex<Option<ListenerDestroyFn>>,
    counters: Mutex<ListenerCounters>,
}

impl MockListenerInner {
    fn arc_self(&self) -> Arc<MockListenerInner> {
        self.own.upgrade().expect("mock listener dropped")
    }

    /// Hands an accepted channel to the server, from the loop thread.
    pub(crate) fn accept(&self, channel: &Arc<MockChannel>) {
        self.counters.lock().unwrap().pending_children += 1;

        let listener = self.arc_self();
        let shutdown_channel: Arc<dyn Channel> = channel.clone();
        let on_accept_shutdown = self.on_accept_shutdown.clone();
        channel.push_shutdown_hook(Box::new(move |result| {
            (*on_accept_shutdown)(&shutdown_channel, result);
            listener.child_done();
        }));

        let listener = self.arc_self();
        let setup_channel: Arc<dyn Channel> = channel.clone();
        self.event_loop
            .post(move || (listener.on_accept_setup)(Ok(setup_channel)));
    }

    /// Reports a failed accept attempt.
    pub(crate) fn accept_error(&self, err: crate::Error) {
        let listener = self.arc_self();
        self.event_loop
            .post(move || (listener.on_accept_setup)(Err(err)));
    }

    fn begin_destroy(&self) {
        let fire = {
            let mut counters = self.counters.lock().unwrap();
            counters.destroy_requested = true;
            counters.pending_children == 0
        };
        if fire {
            self.fire_destroy();
        }
    }

    fn child_done(&self) {
        let fire = {
            let mut counters = self.counters.lock().unwrap();
            counters.pending_children -= 1;
            counters.destroy_requested && counters.pending_children == 0
        };
        if fire {
            self.fire_destroy();
        }
    }

    fn fire_destroy(&self) {
        let on_destroy = self.on_destroy.lock().unwrap().take();
        if let Some(on_destroy) = on_destroy {
            self.event_loop.post(move || on_destroy());
        }
    }
}

struct MockListenerHandle {
    inner: Arc<MockListenerInner>,
}

impl Listener for MockListenerHandle {
    fn begin_destroy(&self) {
        self.inner.begin_destroy();
    }
}

pub(crate) struct MockServerBootstrap {
    event_loop: Arc<MockEventLoop>,
    fail_next_listener: AtomicBool,
    listeners: Mutex<Vec<Arc<MockListenerInner>>>,
}

impl MockServerBootstrap {
    pub(crate) fn new(event_loop: &Arc<MockEventLoop>) -> Arc<MockServerBootstrap> {
        Arc::new(MockServerBootstrap {
            event_loop: event_loop.clone(),
            fail_next_listener: AtomicBool::new(false),
            listeners: Mutex::new(Vec::new()),
        })
    }

    pub(crate) fn fail_next_listener(&self) {
        self.fail_next_listener.store(true, Ordering::SeqCst);
    }

    pub(crate) fn listener(&self, index: usize) -> Arc<MockListenerInner> {
        self.listeners.lock().unwrap()[index].clone()
    }
}

impl ServerBootstrap for MockServerBootstrap {
    fn new_socket_listener(&self, options: ListenerOptions) -> crate::Result<Box<dyn Listener>> {
        if self.fail_next_listener.swap(false, Ordering::SeqCst) {
            return Err(crate::Error::new_unknown());
        }
        let event_loop = self.event_loop.clone();
        let inner = Arc::new_cyclic(|own| MockListenerInner {
            own: own.clone(),
            event_loop,
            on_accept_setup: options.on_accept_channel_setup,
            on_accept_shutdown: Arc::new(options.on_accept_channel_shutdown),
            on_destroy: Mutex::new(Some(options.on_destroy_complete)),
            counters: Mutex::new(ListenerCounters {
                pending_children: 0,
                destroy_requested: false,
            }),
        });
        self.listeners.lock().unwrap().push(inner.clone());
        Ok(Box::new(MockListenerHandle { inner }))
    }
}

// ===== MockClientBootstrap =====

pub(crate) struct MockClientBootstrap {
    event_loop: Arc<MockEventLoop>,
    fail_with: Mutex<Option<crate::Error>>,
    pending: Mutex<Vec<ChannelOptions>>,
}

impl MockClientBootstrap {
    pub(crate) fn new(event_loop: &Arc<MockEventLoop>) -> Arc<MockClientBootstrap> {
        Arc::new(MockClientBootstrap {
            event_loop: event_loop.clone(),
            fail_with: Mutex::new(None),
            pending: Mutex::new(Vec::new()),
        })
    }

    /// Makes the next connect attempt fail synchronously.
    pub(crate) fn fail_next_connect(&self, err: crate::Error) {
        *self.fail_with.lock().unwrap() = Some(err);
    }

    pub(crate) fn pending_connects(&self) -> usize {
        self.pending.lock().unwrap().len()
    }

    pub(crate) fn pending_host(&self) -> String {
        self.pending.lock().unwrap()[0].host.clone()
    }

    /// Completes the oldest connect attempt with `channel`.
    pub(crate) fn complete(&self, channel: &Arc<MockChannel>) {
        let options = self.pending.lock().unwrap().remove(0);
        let on_setup = options.on_setup;
        let on_shutdown = options.on_shutdown;
        channel.push_shutdown_hook(Box::new(move |result| on_shutdown(result)));
        let setup_channel: Arc<dyn Channel> = channel.clone();
        self.event_loop.post(move || on_setup(Ok(setup_channel)));
    }

    /// Fails the oldest connect attempt before any channel exists.
    pub(crate) fn complete_err(&self, err: crate::Error) {
        let options = self.pending.lock().unwrap().remove(0);
        let on_setup = options.on_setup;
        self.event_loop.post(move || on_setup(Err(err)));
    }
}

impl ClientChannelBootstrap for MockClientBootstrap {
    fn new_socket_channel(&self, options: ChannelOptions) -> crate::Result<()> {
        if let Some(err) = self.fail_with.lock().unwrap().take() {
            return Err(err);
        }
        self.pending.lock().unwrap().push(options);
        Ok(())
    }
}

// ===== helpers =====

/// Promotes a mock channel to a connection, on the loop thread.
pub(crate) fn promote(
    event_loop: &Arc<MockEventLoop>,
    channel: &Arc<MockChannel>,
    role: crate::conn::Role,
    is_using_tls: bool,
    manual_window_management: bool,
) -> crate::Result<crate::conn::Connection> {
    let channel_dyn: Arc<dyn Channel> = channel.clone();
    event_loop.run_in_loop(move || {
        crate::conn::factory::build(crate::conn::factory::Options {
            channel: &channel_dyn,
            role,
            is_using_tls,
            manual_window_management,
            initial_window_size: 65_535,
            http2_initial_settings: &[],
            host_address: None,
        })
    })
}

// ===== vtable swapping =====

static VTABLE_GUARD: Mutex<()> = Mutex::new(());

/// Serializes every test that goes through the system vtable, swapped or
/// not; the table is process-wide.
pub(crate) fn lock_system_vtable() -> std::sync::MutexGuard<'static, ()> {
    VTABLE_GUARD
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Runs `f` with the system vtable swapped to `vtable`, restoring the
/// default afterwards.
pub(crate) fn with_system_vtable<R>(
    vtable: &'static crate::hooks::SystemVtable,
    f: impl FnOnce() -> R,
) -> R {
    let _guard = lock_system_vtable();
    struct Reset;
    impl Drop for Reset {
        fn drop(&mut self) {
            crate::hooks::reset_system_vtable();
        }
    }
    crate::hooks::set_system_vtable(vtable);
    let _reset = Reset;
    f()
}
