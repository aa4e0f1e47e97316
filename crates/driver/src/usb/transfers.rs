//! Bulk transfer engine
//!
//! Submits bulk-in transfers into a device's buffer, waits for their
//! completion, retries transient failures and cancels outstanding transfers.
//! Bulk-out writes are fire-and-forget with a bounded number in flight.
//!
//! The transport delivers results by calling [`Completion::complete`] from
//! whatever context it runs completions in. A completion never blocks: it
//! takes the device's state lock for a copy, possibly resubmits, and wakes
//! waiters. Every in-flight completion owns a [`DeviceHandle`], so the device
//! cannot be torn down while a callback is still running.

use crate::config::TransferSettings;
use crate::usb::handle::{DeviceHandle, DeviceObject, lock};
use protocol::{DriverError, Result, TransferError};
use std::sync::{Arc, Weak};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use tracing::{debug, trace, warn};

/// Host-side bus collaborator for one attached device
///
/// Submission hands ownership of the [`Completion`] to the transport, which
/// must eventually fire it exactly once (dropping it counts as
/// [`TransferError::Cancelled`]). If submission fails synchronously the
/// completion is handed back unfired inside [`Rejected`].
pub trait UsbTransport: Send + Sync {
    /// Queue a bulk-in transfer of up to `length` bytes
    fn submit_bulk_in(
        &self,
        endpoint: u8,
        length: usize,
        completion: Completion,
    ) -> std::result::Result<(), Rejected>;

    /// Queue a bulk-out transfer of `data`
    fn submit_bulk_out(
        &self,
        endpoint: u8,
        data: Vec<u8>,
        completion: Completion,
    ) -> std::result::Result<(), Rejected>;

    /// Ask for every outstanding transfer on `endpoint` to complete as cancelled
    ///
    /// Must not block on completions: they may run on the caller's thread.
    fn cancel(&self, endpoint: u8);

    /// Wake the bus link before a session starts using the device
    fn resume(&self) -> std::result::Result<(), TransferError> {
        Ok(())
    }

    /// Allow the bus link to suspend once a session is done with it
    fn autosuspend(&self) {}

    /// Drop the bus object; called once, from device teardown
    fn release(&self);
}

/// A submission the transport refused, with its unfired completion
pub struct Rejected {
    pub error: TransferError,
    pub completion: Completion,
}

impl Rejected {
    pub fn new(error: TransferError, completion: Completion) -> Self {
        Self { error, completion }
    }
}

#[derive(Debug, Clone, Copy)]
enum Direction {
    In {
        length: usize,
        attempt: u8,
        max_retries: u8,
    },
    Out,
}

/// Completion callback for one submitted transfer
pub struct Completion {
    device: Option<DeviceHandle>,
    direction: Direction,
}

impl Completion {
    fn bulk_in(device: DeviceHandle, length: usize, max_retries: u8) -> Self {
        Self {
            device: Some(device),
            direction: Direction::In {
                length,
                attempt: 0,
                max_retries,
            },
        }
    }

    fn bulk_out(device: DeviceHandle) -> Self {
        Self {
            device: Some(device),
            direction: Direction::Out,
        }
    }

    /// Requested length for bulk-in, 0 for bulk-out
    pub fn length(&self) -> usize {
        match self.direction {
            Direction::In { length, .. } => length,
            Direction::Out => 0,
        }
    }

    pub fn is_bulk_in(&self) -> bool {
        matches!(self.direction, Direction::In { .. })
    }

    /// Deliver the transfer result
    ///
    /// `Ok` carries the bytes actually transferred; for bulk-out the slice
    /// content is ignored.
    pub fn complete(mut self, result: std::result::Result<&[u8], TransferError>) {
        if let Some(device) = self.device.take() {
            match self.direction {
                Direction::In {
                    length,
                    attempt,
                    max_retries,
                } => finish_in(device, length, attempt, max_retries, result),
                Direction::Out => finish_out(device, result.map(<[u8]>::len)),
            }
        }
    }

    /// Take the device reference back without running completion logic
    fn disarm(mut self) -> Option<DeviceHandle> {
        self.device.take()
    }
}

impl Drop for Completion {
    fn drop(&mut self) {
        if let Some(device) = self.device.take() {
            match self.direction {
                Direction::In {
                    length,
                    attempt,
                    max_retries,
                } => finish_in(
                    device,
                    length,
                    attempt,
                    max_retries,
                    Err(TransferError::Cancelled),
                ),
                Direction::Out => finish_out(device, Err(TransferError::Cancelled)),
            }
        }
    }
}

fn finish_in(
    device: DeviceHandle,
    length: usize,
    attempt: u8,
    max_retries: u8,
    result: std::result::Result<&[u8], TransferError>,
) {
    let status = match result {
        Ok(data) => {
            let mut state = lock(&device.state);
            let copied = match state.buffer.as_mut() {
                Some(buffer) => {
                    let n = data.len().min(buffer.len());
                    buffer[..n].copy_from_slice(&data[..n]);
                    n
                }
                None => 0,
            };
            if copied < data.len() {
                warn!("{}: bulk-in returned more than the buffer holds", device.name());
                device.record_error(TransferError::Overflow);
            }
            state.filled = copied;
            state.consumed = 0;
            state.ongoing = false;
            state.cancelling = false;
            drop(state);

            trace!("{}: bulk-in completed with {} bytes", device.name(), data.len());
            device.wait.notify_all();
            return;
        }
        Err(status) => status,
    };

    let cancelling = lock(&device.state).cancelling;
    if status.is_retryable() && attempt < max_retries && !cancelling && !device.is_disconnected() {
        debug!(
            "{}: bulk-in {} (attempt {} of {}), resubmitting",
            device.name(),
            status,
            attempt + 1,
            max_retries + 1
        );
        let endpoint = device.bulk_in().address;
        let object = device.object();
        let retry = Completion {
            device: Some(device),
            direction: Direction::In {
                length,
                attempt: attempt + 1,
                max_retries,
            },
        };
        match object.transport().submit_bulk_in(endpoint, length, retry) {
            Ok(()) => {
                // A cancel that raced with the resubmission would have found
                // nothing to cancel.
                if lock(&object.state).cancelling {
                    object.transport().cancel(endpoint);
                }
                return;
            }
            Err(rejected) => {
                let Some(device) = rejected.completion.disarm() else {
                    return;
                };
                fail_in(device, rejected.error);
                return;
            }
        }
    }

    fail_in(device, status);
}

fn fail_in(device: DeviceHandle, status: TransferError) {
    if status.is_unlink() {
        debug!("{}: bulk-in unlinked ({})", device.name(), status);
    } else {
        warn!("{}: bulk-in failed: {}", device.name(), status);
    }
    device.record_error(status);

    let mut state = lock(&device.state);
    state.filled = 0;
    state.consumed = 0;
    state.ongoing = false;
    drop(state);
    device.wait.notify_all();
}

fn finish_out(device: DeviceHandle, result: std::result::Result<usize, TransferError>) {
    match result {
        Ok(n) => trace!("{}: bulk-out wrote {} bytes", device.name(), n),
        Err(status) => {
            if !status.is_unlink() {
                warn!("{}: bulk-out failed: {}", device.name(), status);
            }
            device.record_error(status);
        }
    }

    let mut state = lock(&device.state);
    state.writes_in_flight = state.writes_in_flight.saturating_sub(1);
    drop(state);
    device.wait.notify_all();
}

/// Translate a recorded transfer status into the error a client sees
pub fn surface_error(device: &DeviceObject, status: TransferError) -> DriverError {
    if status.is_unlink() && device.is_disconnected() {
        DriverError::Disconnected
    } else {
        DriverError::from(status)
    }
}

/// Ticket for a submitted bulk-in transfer
#[must_use = "a submitted transfer should be awaited or cancelled"]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PendingTransfer {
    generation: u64,
    length: usize,
}

impl PendingTransfer {
    /// Bytes requested after clamping to the buffer size
    pub fn length(&self) -> usize {
        self.length
    }
}

/// Wakes a blocked [`TransferEngine::await_completion`]
///
/// The request is consumed by the wait that reports it. Holds the device
/// weakly so an outstanding clone never keeps a torn down device alive.
#[derive(Clone)]
pub struct Interrupter {
    flag: Arc<AtomicBool>,
    device: Weak<DeviceObject>,
}

impl Interrupter {
    pub(crate) fn new(device: &DeviceHandle) -> Self {
        Self {
            flag: Arc::new(AtomicBool::new(false)),
            device: Arc::downgrade(&device.object()),
        }
    }

    pub fn interrupt(&self) {
        self.flag.store(true, Ordering::Release);
        if let Some(device) = self.device.upgrade() {
            let _state = lock(&device.state);
            device.wait.notify_all();
        }
    }

    /// Drop a request made while no wait was in progress
    pub(crate) fn reset(&self) {
        self.flag.store(false, Ordering::Release);
    }

    fn take(&self) -> bool {
        self.flag.swap(false, Ordering::AcqRel)
    }
}

/// Bulk transfer engine shared by every device
#[derive(Debug, Clone)]
pub struct TransferEngine {
    max_retries: u8,
    max_writes_in_flight: usize,
    drain_timeout: Duration,
}

impl TransferEngine {
    pub fn new(settings: &TransferSettings) -> Self {
        Self {
            max_retries: settings.max_retries,
            max_writes_in_flight: settings.writes_in_flight.max(1),
            drain_timeout: settings.drain_timeout(),
        }
    }

    pub fn max_retries(&self) -> u8 {
        self.max_retries
    }

    /// Start a bulk-in transfer of up to `requested` bytes into the device buffer
    ///
    /// The length is clamped to the buffer size. Fails with `AlreadyPending`
    /// while another bulk-in transfer is in flight and with `Disconnected`
    /// once the device is gone.
    pub fn submit(&self, device: &DeviceHandle, requested: usize) -> Result<PendingTransfer> {
        let (generation, length) = {
            let mut state = lock(&device.state);
            if state.ongoing {
                return Err(DriverError::AlreadyPending);
            }
            if device.is_disconnected() {
                return Err(DriverError::Disconnected);
            }
            let capacity = state.capacity();
            if capacity == 0 {
                return Err(DriverError::Disconnected);
            }
            let length = requested.min(capacity).max(1);

            state.ongoing = true;
            state.cancelling = false;
            state.filled = 0;
            state.consumed = 0;
            state.generation = state.generation.wrapping_add(1);
            (state.generation, length)
        };

        let endpoint = device.bulk_in().address;
        let completion = Completion::bulk_in(device.retain(), length, self.max_retries);
        trace!("{}: submitting bulk-in of {} bytes", device.name(), length);

        match device.transport().submit_bulk_in(endpoint, length, completion) {
            Ok(()) => {
                let state = lock(&device.state);
                let cancel = state.cancelling && state.generation == generation;
                drop(state);
                if cancel {
                    device.transport().cancel(endpoint);
                }
                Ok(PendingTransfer { generation, length })
            }
            Err(rejected) => {
                drop(rejected.completion.disarm());
                let mut state = lock(&device.state);
                if state.generation == generation {
                    state.ongoing = false;
                    state.cancelling = false;
                }
                drop(state);
                device.wait.notify_all();
                warn!("{}: bulk-in submission failed: {}", device.name(), rejected.error);
                Err(surface_error(device, rejected.error))
            }
        }
    }

    pub fn is_in_flight(&self, device: &DeviceHandle, pending: &PendingTransfer) -> bool {
        let state = lock(&device.state);
        state.ongoing && state.generation == pending.generation
    }

    /// Block until `pending` completes, the device disconnects, the timeout
    /// elapses or `interrupter` fires
    ///
    /// Returns the number of bytes the transfer placed in the buffer. A
    /// timeout or interruption leaves the transfer in flight.
    pub fn await_completion(
        &self,
        device: &DeviceHandle,
        pending: &PendingTransfer,
        timeout: Option<Duration>,
        interrupter: Option<&Interrupter>,
    ) -> Result<usize> {
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut state = lock(&device.state);

        let filled = loop {
            if !(state.ongoing && state.generation == pending.generation) {
                break state.filled;
            }
            if device.is_disconnected() {
                return Err(DriverError::Disconnected);
            }
            if interrupter.is_some_and(Interrupter::take) {
                return Err(DriverError::Interrupted);
            }
            state = match deadline {
                None => device
                    .wait
                    .wait(state)
                    .unwrap_or_else(std::sync::PoisonError::into_inner),
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return Err(DriverError::TimedOut);
                    }
                    device
                        .wait
                        .wait_timeout(state, deadline - now)
                        .unwrap_or_else(std::sync::PoisonError::into_inner)
                        .0
                }
            };
        };
        drop(state);

        match device.take_error() {
            Some(status) => Err(surface_error(device, status)),
            None => Ok(filled),
        }
    }

    /// Cancel `pending` if it is still in flight and wait for it to settle
    pub fn cancel(&self, device: &DeviceHandle, pending: PendingTransfer) {
        {
            let mut state = lock(&device.state);
            if !(state.ongoing && state.generation == pending.generation) {
                return;
            }
            state.cancelling = true;
        }

        debug!("{}: cancelling bulk-in", device.name());
        device.transport().cancel(device.bulk_in().address);

        let state = device
            .wait
            .wait_while(lock(&device.state), |s| {
                s.ongoing && s.generation == pending.generation
            })
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        drop(state);

        let mut error = lock(&device.error);
        if *error == Some(TransferError::Cancelled) {
            *error = None;
        }
    }

    /// Cancel every outstanding transfer on the device and wait until none
    /// remains in flight
    ///
    /// Bulk-out writes get the drain timeout to finish first. Idempotent.
    pub fn cancel_all(&self, device: &DeviceHandle) {
        if !self.drain_writes(device, Some(self.drain_timeout)) {
            warn!(
                "{}: writes did not drain within {:?}, cancelling",
                device.name(),
                self.drain_timeout
            );
            if let Some(out) = device.bulk_out() {
                device.transport().cancel(out.address);
            }
        }

        let in_flight = {
            let mut state = lock(&device.state);
            if state.ongoing {
                state.cancelling = true;
            }
            state.ongoing
        };
        if in_flight {
            device.transport().cancel(device.bulk_in().address);
        }

        let state = device
            .wait
            .wait_while(lock(&device.state), |s| s.ongoing || s.writes_in_flight > 0)
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        drop(state);
        debug!("{}: no transfers in flight", device.name());
    }

    /// Queue a bulk-out transfer of `data`
    ///
    /// Returns as soon as the transfer is queued. Fails with `Busy` when the
    /// in-flight write limit is reached.
    pub fn submit_write(&self, device: &DeviceHandle, data: &[u8]) -> Result<usize> {
        let Some(endpoint) = device.bulk_out().map(|ep| ep.address) else {
            return Err(DriverError::UnsupportedDevice {
                reason: "device has no bulk-out endpoint".to_string(),
            });
        };

        {
            let mut state = lock(&device.state);
            if device.is_disconnected() {
                return Err(DriverError::Disconnected);
            }
            if state.writes_in_flight >= self.max_writes_in_flight {
                return Err(DriverError::Busy);
            }
            state.writes_in_flight += 1;
        }

        let completion = Completion::bulk_out(device.retain());
        match device
            .transport()
            .submit_bulk_out(endpoint, data.to_vec(), completion)
        {
            Ok(()) => Ok(data.len()),
            Err(rejected) => {
                drop(rejected.completion.disarm());
                let mut state = lock(&device.state);
                state.writes_in_flight = state.writes_in_flight.saturating_sub(1);
                drop(state);
                device.wait.notify_all();
                warn!("{}: bulk-out submission failed: {}", device.name(), rejected.error);
                Err(surface_error(device, rejected.error))
            }
        }
    }

    /// Wait for in-flight writes to complete; false if the timeout elapsed first
    pub fn drain_writes(&self, device: &DeviceHandle, timeout: Option<Duration>) -> bool {
        let state = lock(&device.state);
        match timeout {
            None => {
                let state = device
                    .wait
                    .wait_while(state, |s| s.writes_in_flight > 0)
                    .unwrap_or_else(std::sync::PoisonError::into_inner);
                state.writes_in_flight == 0
            }
            Some(timeout) => {
                let (state, _) = device
                    .wait
                    .wait_timeout_while(state, timeout, |s| s.writes_in_flight > 0)
                    .unwrap_or_else(std::sync::PoisonError::into_inner);
                state.writes_in_flight == 0
            }
        }
    }

    pub fn drain_timeout(&self) -> Duration {
        self.drain_timeout
    }
}

impl Default for TransferEngine {
    fn default() -> Self {
        Self::new(&TransferSettings::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{MockTransport, attach_mock};
    use crate::usb::LifecycleController;
    use crate::config::DriverConfig;

    fn setup() -> (LifecycleController, Arc<MockTransport>, DeviceHandle) {
        let controller = LifecycleController::new(&DriverConfig::default());
        let (transport, node) = attach_mock(&controller, 1, 4, 64);
        let handle = controller.lookup(&node.name).unwrap();
        (controller, transport, handle)
    }

    #[test]
    fn test_submit_clamps_to_buffer() {
        let (controller, transport, handle) = setup();

        let pending = controller.engine().submit(&handle, 4096).unwrap();
        assert_eq!(pending.length(), 64);
        assert_eq!(transport.pending_in_length(), Some(64));

        transport.complete_in(b"abc");
        let n = controller
            .engine()
            .await_completion(&handle, &pending, Some(Duration::from_secs(1)), None)
            .unwrap();
        assert_eq!(n, 3);
    }

    #[test]
    fn test_second_submit_is_already_pending() {
        let (controller, transport, handle) = setup();
        let engine = controller.engine();

        let pending = engine.submit(&handle, 10).unwrap();
        assert_eq!(engine.submit(&handle, 10), Err(DriverError::AlreadyPending));
        assert_eq!(transport.in_submissions(), 1);

        engine.cancel(&handle, pending);
        assert!(engine.submit(&handle, 10).is_ok());
    }

    #[test]
    fn test_completion_holds_a_reference() {
        let (controller, transport, handle) = setup();
        let before = handle.refcount();

        let pending = controller.engine().submit(&handle, 8).unwrap();
        assert_eq!(handle.refcount(), before + 1);

        transport.complete_in(&[1, 2]);
        let _ = controller
            .engine()
            .await_completion(&handle, &pending, None, None);
        assert_eq!(handle.refcount(), before);
    }

    #[test]
    fn test_rejected_submission_rolls_back() {
        let (controller, transport, handle) = setup();
        let before = handle.refcount();
        transport.reject_next_submit(TransferError::NoDevice);

        let err = controller.engine().submit(&handle, 8).unwrap_err();
        assert_eq!(err, DriverError::Disconnected);
        assert_eq!(handle.refcount(), before);
        assert!(controller.engine().submit(&handle, 8).is_ok());
    }

    #[test]
    fn test_timeout_leaves_transfer_in_flight() {
        let (controller, transport, handle) = setup();
        let engine = controller.engine();

        let pending = engine.submit(&handle, 8).unwrap();
        let err = engine
            .await_completion(&handle, &pending, Some(Duration::from_millis(20)), None)
            .unwrap_err();
        assert_eq!(err, DriverError::TimedOut);
        assert!(transport.pending_in_length().is_some());

        transport.complete_in(b"late");
        assert_eq!(
            engine.await_completion(&handle, &pending, Some(Duration::from_secs(1)), None),
            Ok(4)
        );
    }

    #[test]
    fn test_interrupter_wakes_waiter() {
        let (controller, _transport, handle) = setup();
        let engine = controller.engine().clone();
        let interrupter = Interrupter::new(&handle);

        let pending = engine.submit(&handle, 8).unwrap();
        let waiter = {
            let handle = handle.retain();
            let interrupter = interrupter.clone();
            std::thread::spawn(move || {
                engine.await_completion(&handle, &pending, None, Some(&interrupter))
            })
        };

        std::thread::sleep(Duration::from_millis(20));
        interrupter.interrupt();
        assert_eq!(waiter.join().unwrap(), Err(DriverError::Interrupted));
    }

    #[test]
    fn test_cancel_clears_cancelled_status() {
        let (controller, transport, handle) = setup();

        let pending = controller.engine().submit(&handle, 8).unwrap();
        controller.engine().cancel(&handle, pending);

        assert_eq!(transport.cancel_count(), 1);
        assert_eq!(handle.take_error(), None);
        assert!(!lock(&handle.state).ongoing);
    }

    #[test]
    fn test_overflow_is_recorded() {
        let (controller, transport, handle) = setup();

        let pending = controller.engine().submit(&handle, 64).unwrap();
        transport.complete_in(&[0u8; 80]);
        let err = controller
            .engine()
            .await_completion(&handle, &pending, None, None)
            .unwrap_err();
        assert_eq!(err, DriverError::Io(TransferError::Overflow));
    }
}
