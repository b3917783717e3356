//! Process-wide function table for the operations tests need to intercept.
//!
//! The table starts out pointing at the real socket layer. Tests may swap it
//! wholesale; replacement is not ordered against in-flight operations, so it
//! must happen before any concurrent `connect` call.

use std::sync::atomic::{AtomicPtr, Ordering};
use std::sync::Arc;

use crate::bootstrap::{ChannelOptions, ClientChannelBootstrap};

/// The hookable operations. Only `new_socket_channel` is currently hookable.
pub(crate) struct SystemVtable {
    pub(crate) new_socket_channel:
        fn(&Arc<dyn ClientChannelBootstrap>, ChannelOptions) -> crate::Result<()>,
}

fn default_new_socket_channel(
    bootstrap: &Arc<dyn ClientChannelBootstrap>,
    options: ChannelOptions,
) -> crate::Result<()> {
    bootstrap.new_socket_channel(options)
}

pub(crate) static DEFAULT_SYSTEM_VTABLE: SystemVtable = SystemVtable {
    new_socket_channel: default_new_socket_channel,
};

static SYSTEM_VTABLE: AtomicPtr<SystemVtable> =
    AtomicPtr::new(&DEFAULT_SYSTEM_VTABLE as *const SystemVtable as *mut SystemVtable);

pub(crate) fn system_vtable() -> &'static SystemVtable {
    // Only ever stores pointers to vtables with 'static lifetime.
    unsafe { &*SYSTEM_VTABLE.load(Ordering::Acquire) }
}

#[cfg(test)]
pub(crate) fn set_system_vtable(vtable: &'static SystemVtable) {
    SYSTEM_VTABLE.store(
        vtable as *const SystemVtable as *mut SystemVtable,
        Ordering::Release,
    );
}

#[cfg(test)]
pub(crate) fn reset_system_vtable() {
    set_system_vtable(&DEFAULT_SYSTEM_VTABLE);
}
