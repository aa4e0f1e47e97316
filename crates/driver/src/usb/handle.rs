//! Reference-counted device object
//!
//! One [`DeviceObject`] exists per attached device. It owns the bulk-in
//! transfer buffer and the transport (bus object) reference. Owners hold a
//! [`DeviceHandle`]: the registration, every open session and every
//! in-flight completion. Cloning a handle retains, dropping it releases, and
//! the drop that brings the count to zero runs teardown exactly once.

use crate::usb::transfers::UsbTransport;
use protocol::{
    BusAddress, DeviceDescriptors, DeviceState, EndpointDescriptor, NodeId, NodeInfo,
    TransferError,
};
use std::fmt;
use std::ops::Deref;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use tracing::{debug, info, warn};

/// Lock a mutex, recovering the data if a previous holder panicked
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Transfer bookkeeping guarded by [`DeviceObject::state`]
///
/// Held only for short, non-blocking sections: by sessions inspecting the
/// buffer and by completions publishing results.
#[derive(Debug)]
pub(crate) struct TransferState {
    /// Bulk-in buffer, `None` once torn down
    pub(crate) buffer: Option<Vec<u8>>,
    /// Bytes of the last successful bulk-in transfer
    pub(crate) filled: usize,
    /// Bytes of `filled` already handed to readers
    pub(crate) consumed: usize,
    /// A bulk-in transfer is in flight
    pub(crate) ongoing: bool,
    /// Bumped on every bulk-in submission
    pub(crate) generation: u64,
    /// Cancellation of the in-flight bulk-in transfer was requested
    pub(crate) cancelling: bool,
    /// Submitted bulk-out transfers not yet completed
    pub(crate) writes_in_flight: usize,
    pub(crate) lifecycle: DeviceState,
}

impl TransferState {
    pub(crate) fn buffered(&self) -> usize {
        self.filled.saturating_sub(self.consumed)
    }

    pub(crate) fn capacity(&self) -> usize {
        self.buffer.as_ref().map_or(0, Vec::len)
    }
}

/// Shared device object behind every [`DeviceHandle`]
pub struct DeviceObject {
    name: String,
    node: NodeId,
    descriptors: DeviceDescriptors,
    interface_number: u8,
    bulk_in: EndpointDescriptor,
    bulk_out: Option<EndpointDescriptor>,
    transport: Arc<dyn UsbTransport>,
    refcount: AtomicUsize,
    disconnected: AtomicBool,
    torn_down: AtomicBool,
    pub(crate) state: Mutex<TransferState>,
    /// Signalled whenever `state` changes in a way a waiter may care about
    pub(crate) wait: Condvar,
    /// Last transfer error; separate from `state` so completions never
    /// contend with a reader holding the state lock for a copy
    pub(crate) error: Mutex<Option<TransferError>>,
}

/// Everything needed to build a device object at attach time
pub(crate) struct DeviceSpec {
    pub(crate) name: String,
    pub(crate) node: NodeId,
    pub(crate) descriptors: DeviceDescriptors,
    pub(crate) interface_number: u8,
    pub(crate) bulk_in: EndpointDescriptor,
    pub(crate) bulk_out: Option<EndpointDescriptor>,
    pub(crate) buffer: Vec<u8>,
}

impl DeviceObject {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn node(&self) -> NodeId {
        self.node
    }

    pub fn bus_address(&self) -> BusAddress {
        self.descriptors.address
    }

    pub fn descriptors(&self) -> &DeviceDescriptors {
        &self.descriptors
    }

    pub fn interface_number(&self) -> u8 {
        self.interface_number
    }

    pub fn bulk_in(&self) -> &EndpointDescriptor {
        &self.bulk_in
    }

    pub fn bulk_out(&self) -> Option<&EndpointDescriptor> {
        self.bulk_out.as_ref()
    }

    pub fn transport(&self) -> &Arc<dyn UsbTransport> {
        &self.transport
    }

    /// Current number of live owners
    pub fn refcount(&self) -> usize {
        self.refcount.load(Ordering::Acquire)
    }

    pub fn is_disconnected(&self) -> bool {
        self.disconnected.load(Ordering::Acquire)
    }

    pub fn is_torn_down(&self) -> bool {
        self.torn_down.load(Ordering::Acquire)
    }

    pub fn state(&self) -> DeviceState {
        lock(&self.state).lifecycle
    }

    /// Size of the bulk-in transfer buffer (0 after teardown)
    pub fn buffer_size(&self) -> usize {
        lock(&self.state).capacity()
    }

    /// Take the pending transfer error, clearing it
    pub fn take_error(&self) -> Option<TransferError> {
        lock(&self.error).take()
    }

    pub(crate) fn record_error(&self, status: TransferError) {
        *lock(&self.error) = Some(status);
    }

    pub fn info(&self) -> NodeInfo {
        NodeInfo {
            name: self.name.clone(),
            id: self.node,
            address: self.bus_address(),
            vendor_id: self.descriptors.vendor_id,
            product_id: self.descriptors.product_id,
            refcount: self.refcount(),
            state: self.state(),
        }
    }

    pub(crate) fn set_lifecycle(&self, next: DeviceState) {
        let mut state = lock(&self.state);
        debug!("{}: {} -> {}", self.name, state.lifecycle, next);
        state.lifecycle = next;
    }

    /// Mark the device gone and wake every waiter
    ///
    /// Returns false if it was already marked.
    pub(crate) fn mark_disconnected(&self) -> bool {
        let mut state = lock(&self.state);
        if self.disconnected.swap(true, Ordering::AcqRel) {
            return false;
        }
        if state.lifecycle != DeviceState::Destroyed {
            state.lifecycle = DeviceState::Disconnecting;
        }
        drop(state);
        self.wait.notify_all();
        true
    }

    /// Runs once, from the release that reached zero
    fn teardown(&self) {
        let already = self.torn_down.swap(true, Ordering::AcqRel);
        debug_assert!(!already, "teardown ran twice for {}", self.name);
        if already {
            return;
        }

        let mut state = lock(&self.state);
        if state.ongoing || state.writes_in_flight > 0 {
            warn!(
                "{}: tearing down with transfers in flight (in={}, out={})",
                self.name, state.ongoing, state.writes_in_flight
            );
            drop(state);
            self.transport.cancel(self.bulk_in.address);
            if let Some(out) = &self.bulk_out {
                self.transport.cancel(out.address);
            }
            state = lock(&self.state);
        }
        let buffer = state.buffer.take();
        state.filled = 0;
        state.consumed = 0;
        state.lifecycle = DeviceState::Destroyed;
        drop(state);
        drop(buffer);

        self.transport.release();
        self.wait.notify_all();
        info!("{} ({}) destroyed", self.name, self.bus_address());
    }
}

impl fmt::Debug for DeviceObject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceObject")
            .field("name", &self.name)
            .field("node", &self.node)
            .field("address", &self.bus_address())
            .field("refcount", &self.refcount())
            .field("disconnected", &self.is_disconnected())
            .finish_non_exhaustive()
    }
}

/// Counted reference to a [`DeviceObject`]
///
/// `Clone` is `retain()`, `Drop` is `release()`.
pub struct DeviceHandle {
    object: Arc<DeviceObject>,
}

impl DeviceHandle {
    /// Allocate a device object; the returned handle is its first owner
    pub(crate) fn new(spec: DeviceSpec, transport: Arc<dyn UsbTransport>) -> Self {
        let object = DeviceObject {
            name: spec.name,
            node: spec.node,
            descriptors: spec.descriptors,
            interface_number: spec.interface_number,
            bulk_in: spec.bulk_in,
            bulk_out: spec.bulk_out,
            transport,
            refcount: AtomicUsize::new(1),
            disconnected: AtomicBool::new(false),
            torn_down: AtomicBool::new(false),
            state: Mutex::new(TransferState {
                buffer: Some(spec.buffer),
                filled: 0,
                consumed: 0,
                ongoing: false,
                generation: 0,
                cancelling: false,
                writes_in_flight: 0,
                lifecycle: DeviceState::Attached,
            }),
            wait: Condvar::new(),
            error: Mutex::new(None),
        };

        Self {
            object: Arc::new(object),
        }
    }

    /// Take another reference
    pub fn retain(&self) -> DeviceHandle {
        let previous = self.object.refcount.fetch_add(1, Ordering::Relaxed);
        assert!(previous > 0, "retain on released device {}", self.object.name);
        Self {
            object: Arc::clone(&self.object),
        }
    }

    /// Drop this reference, tearing the device down if it was the last
    pub fn release(self) {
        drop(self);
    }

    /// True if both handles refer to the same device object
    pub fn same_device(&self, other: &DeviceHandle) -> bool {
        Arc::ptr_eq(&self.object, &other.object)
    }

    /// Uncounted pointer, for waking waiters without keeping the device alive
    pub(crate) fn object(&self) -> Arc<DeviceObject> {
        Arc::clone(&self.object)
    }
}

impl Clone for DeviceHandle {
    fn clone(&self) -> Self {
        self.retain()
    }
}

impl Drop for DeviceHandle {
    fn drop(&mut self) {
        if self.object.refcount.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.object.teardown();
        }
    }
}

impl Deref for DeviceHandle {
    type Target = DeviceObject;

    fn deref(&self) -> &DeviceObject {
        &self.object
    }
}

impl fmt::Debug for DeviceHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.object.fmt(f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::MockTransport;
    use common::test_utils::create_mock_descriptors;

    fn make_handle(transport: Arc<MockTransport>) -> DeviceHandle {
        let descriptors = create_mock_descriptors(1, 4, 64);
        let iface = descriptors.bulk_interface().unwrap().clone();
        DeviceHandle::new(
            DeviceSpec {
                name: "ardu_device0".to_string(),
                node: NodeId { major: 234, minor: 0 },
                interface_number: iface.number,
                bulk_in: *iface.bulk_in().unwrap(),
                bulk_out: iface.bulk_out().copied(),
                descriptors,
                buffer: vec![0; 64],
            },
            transport,
        )
    }

    #[test]
    fn test_new_handle_starts_with_one_reference() {
        let transport = MockTransport::new();
        let handle = make_handle(transport.clone());

        assert_eq!(handle.refcount(), 1);
        assert_eq!(handle.state(), DeviceState::Attached);
        assert_eq!(handle.buffer_size(), 64);
        assert!(!handle.is_disconnected());
        assert_eq!(transport.release_count(), 0);
    }

    #[test]
    fn test_retain_release_counts() {
        let transport = MockTransport::new();
        let handle = make_handle(transport.clone());

        let second = handle.retain();
        let third = second.clone();
        assert_eq!(handle.refcount(), 3);
        assert!(third.same_device(&handle));

        second.release();
        third.release();
        assert_eq!(handle.refcount(), 1);
        assert_eq!(transport.release_count(), 0);
    }

    #[test]
    fn test_last_release_tears_down_once() {
        let transport = MockTransport::new();
        let handle = make_handle(transport.clone());
        let object = handle.object();
        let other = handle.retain();

        handle.release();
        assert!(!object.is_torn_down());
        assert_eq!(transport.release_count(), 0);

        other.release();
        assert!(object.is_torn_down());
        assert_eq!(object.refcount(), 0);
        assert_eq!(object.state(), DeviceState::Destroyed);
        assert_eq!(object.buffer_size(), 0);
        assert_eq!(transport.release_count(), 1);
    }

    #[test]
    fn test_mark_disconnected_is_one_way() {
        let handle = make_handle(MockTransport::new());
        handle.set_lifecycle(DeviceState::Active);

        assert!(handle.mark_disconnected());
        assert!(!handle.mark_disconnected());
        assert!(handle.is_disconnected());
        assert_eq!(handle.state(), DeviceState::Disconnecting);
    }

    #[test]
    fn test_error_slot_take_clears() {
        let handle = make_handle(MockTransport::new());
        handle.record_error(TransferError::Stall);
        assert_eq!(handle.take_error(), Some(TransferError::Stall));
        assert_eq!(handle.take_error(), None);
    }

    #[test]
    fn test_concurrent_release_tears_down_once() {
        let transport = MockTransport::new();
        let handle = make_handle(transport.clone());
        let object = handle.object();

        let handles: Vec<_> = (0..16).map(|_| handle.retain()).collect();
        handle.release();

        let threads: Vec<_> = handles
            .into_iter()
            .map(|h| std::thread::spawn(move || h.release()))
            .collect();
        for t in threads {
            t.join().unwrap();
        }

        assert_eq!(object.refcount(), 0);
        assert_eq!(transport.release_count(), 1);
    }
}
