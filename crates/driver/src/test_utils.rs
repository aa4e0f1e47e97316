//! Test utilities for the driver
//!
//! [`MockTransport`] stands in for the bus: it records submissions, lets a
//! test complete them from any thread, and can echo bulk-out data back on
//! bulk-in (loopback mode).
//!
//! # Example
//!
//! ```
//! use driver::config::DriverConfig;
//! use driver::test_utils::attach_mock;
//! use driver::usb::LifecycleController;
//!
//! let controller = LifecycleController::new(&DriverConfig::default());
//! let (transport, node) = attach_mock(&controller, 1, 4, 64);
//!
//! let session = controller.open(&node.name).unwrap();
//! let mut buf = [0u8; 16];
//! let reader = std::thread::spawn(move || session.read(&mut buf).map(|n| buf[..n].to_vec()));
//! assert!(transport.wait_for_pending_in(std::time::Duration::from_secs(1)));
//! transport.complete_in(b"hello");
//! assert_eq!(reader.join().unwrap().unwrap(), b"hello");
//! ```

use crate::usb::handle::lock;
use crate::usb::manager::LifecycleController;
use crate::usb::transfers::{Completion, Rejected, UsbTransport};
use common::test_utils::create_mock_descriptors;
use protocol::{ENDPOINT_DIR_IN, NodeInfo, TransferError};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

#[derive(Default)]
struct MockState {
    pending_in: Option<Completion>,
    pending_out: VecDeque<(Vec<u8>, Completion)>,
    /// Outcomes applied to upcoming bulk-in submissions, in order
    scripted_in: VecDeque<Result<Vec<u8>, TransferError>>,
    /// Bytes written while in loopback mode, not yet read back
    loopback: VecDeque<u8>,
    reject_next: Option<TransferError>,
    resume_error: Option<TransferError>,
    written: Vec<Vec<u8>>,
    in_submissions: usize,
    out_submissions: usize,
}

/// Scriptable in-memory transport
pub struct MockTransport {
    state: Mutex<MockState>,
    submitted: Condvar,
    loopback: bool,
    hold_writes: bool,
    cancels: AtomicUsize,
    releases: AtomicUsize,
    autosuspends: AtomicUsize,
    resumes: AtomicUsize,
}

impl MockTransport {
    fn build(loopback: bool, hold_writes: bool) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(MockState::default()),
            submitted: Condvar::new(),
            loopback,
            hold_writes,
            cancels: AtomicUsize::new(0),
            releases: AtomicUsize::new(0),
            autosuspends: AtomicUsize::new(0),
            resumes: AtomicUsize::new(0),
        })
    }

    /// Transfers stay pending until the test completes them; writes complete at once
    pub fn new() -> Arc<Self> {
        Self::build(false, false)
    }

    /// Bulk-out data comes back on bulk-in
    pub fn loopback() -> Arc<Self> {
        Self::build(true, false)
    }

    /// Like [`MockTransport::new`] but bulk-out transfers also stay pending
    pub fn holding_writes() -> Arc<Self> {
        Self::build(false, true)
    }

    /// Queue the outcome of the next bulk-in submission
    pub fn script_in(&self, outcome: Result<&[u8], TransferError>) {
        lock(&self.state)
            .scripted_in
            .push_back(outcome.map(<[u8]>::to_vec));
    }

    /// Fail the next submission synchronously with `error`
    pub fn reject_next_submit(&self, error: TransferError) {
        lock(&self.state).reject_next = Some(error);
    }

    pub fn set_resume_error(&self, error: Option<TransferError>) {
        lock(&self.state).resume_error = error;
    }

    /// Complete the pending bulk-in transfer with `data`
    ///
    /// Returns false if none was pending.
    pub fn complete_in(&self, data: &[u8]) -> bool {
        let completion = lock(&self.state).pending_in.take();
        match completion {
            Some(completion) => {
                completion.complete(Ok(data));
                true
            }
            None => false,
        }
    }

    /// Fail the pending bulk-in transfer with `status`
    pub fn fail_in(&self, status: TransferError) -> bool {
        let completion = lock(&self.state).pending_in.take();
        match completion {
            Some(completion) => {
                completion.complete(Err(status));
                true
            }
            None => false,
        }
    }

    /// Complete every held bulk-out transfer with `result`
    pub fn complete_writes(&self, result: Result<(), TransferError>) -> usize {
        let pending: Vec<_> = lock(&self.state).pending_out.drain(..).collect();
        let count = pending.len();
        for (data, completion) in pending {
            match result {
                Ok(()) => completion.complete(Ok(data.as_slice())),
                Err(status) => completion.complete(Err(status)),
            }
        }
        count
    }

    /// Requested length of the pending bulk-in transfer
    pub fn pending_in_length(&self) -> Option<usize> {
        lock(&self.state).pending_in.as_ref().map(Completion::length)
    }

    pub fn pending_writes(&self) -> usize {
        lock(&self.state).pending_out.len()
    }

    /// Wait until a bulk-in transfer is pending
    pub fn wait_for_pending_in(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut state = lock(&self.state);
        while state.pending_in.is_none() {
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            state = self
                .submitted
                .wait_timeout(state, deadline - now)
                .unwrap_or_else(std::sync::PoisonError::into_inner)
                .0;
        }
        true
    }

    /// Payloads of every bulk-out submission so far
    pub fn written(&self) -> Vec<Vec<u8>> {
        lock(&self.state).written.clone()
    }

    pub fn in_submissions(&self) -> usize {
        lock(&self.state).in_submissions
    }

    pub fn out_submissions(&self) -> usize {
        lock(&self.state).out_submissions
    }

    pub fn cancel_count(&self) -> usize {
        self.cancels.load(Ordering::SeqCst)
    }

    pub fn release_count(&self) -> usize {
        self.releases.load(Ordering::SeqCst)
    }

    pub fn autosuspend_count(&self) -> usize {
        self.autosuspends.load(Ordering::SeqCst)
    }

    pub fn resume_count(&self) -> usize {
        self.resumes.load(Ordering::SeqCst)
    }

    /// Hand loopback bytes to a pending bulk-in transfer, if both exist
    fn pump_loopback(&self) {
        let ready = {
            let mut state = lock(&self.state);
            if state.loopback.is_empty() {
                None
            } else if let Some(completion) = state.pending_in.take() {
                let n = completion.length().min(state.loopback.len());
                let data: Vec<u8> = state.loopback.drain(..n).collect();
                Some((completion, data))
            } else {
                None
            }
        };
        if let Some((completion, data)) = ready {
            completion.complete(Ok(data.as_slice()));
        }
    }
}

impl UsbTransport for MockTransport {
    fn submit_bulk_in(
        &self,
        _endpoint: u8,
        _length: usize,
        completion: Completion,
    ) -> Result<(), Rejected> {
        let scripted = {
            let mut state = lock(&self.state);
            if let Some(error) = state.reject_next.take() {
                return Err(Rejected::new(error, completion));
            }
            state.in_submissions += 1;
            match state.scripted_in.pop_front() {
                Some(outcome) => Some((outcome, completion)),
                None => {
                    state.pending_in = Some(completion);
                    None
                }
            }
        };
        self.submitted.notify_all();

        match scripted {
            Some((Ok(data), completion)) => completion.complete(Ok(data.as_slice())),
            Some((Err(status), completion)) => completion.complete(Err(status)),
            None if self.loopback => self.pump_loopback(),
            None => {}
        }
        Ok(())
    }

    fn submit_bulk_out(
        &self,
        _endpoint: u8,
        data: Vec<u8>,
        completion: Completion,
    ) -> Result<(), Rejected> {
        {
            let mut state = lock(&self.state);
            if let Some(error) = state.reject_next.take() {
                return Err(Rejected::new(error, completion));
            }
            state.out_submissions += 1;
            state.written.push(data.clone());
            if self.hold_writes {
                state.pending_out.push_back((data, completion));
                return Ok(());
            }
            if self.loopback {
                state.loopback.extend(data.iter().copied());
            }
        }

        completion.complete(Ok(data.as_slice()));
        if self.loopback {
            self.pump_loopback();
        }
        Ok(())
    }

    fn cancel(&self, endpoint: u8) {
        self.cancels.fetch_add(1, Ordering::SeqCst);
        let (pending_in, pending_out) = {
            let mut state = lock(&self.state);
            if endpoint & ENDPOINT_DIR_IN != 0 {
                (state.pending_in.take(), Vec::new())
            } else {
                (None, state.pending_out.drain(..).collect::<Vec<_>>())
            }
        };
        if let Some(completion) = pending_in {
            completion.complete(Err(TransferError::Cancelled));
        }
        for (_, completion) in pending_out {
            completion.complete(Err(TransferError::Cancelled));
        }
    }

    fn resume(&self) -> Result<(), TransferError> {
        self.resumes.fetch_add(1, Ordering::SeqCst);
        match lock(&self.state).resume_error {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }

    fn autosuspend(&self) {
        self.autosuspends.fetch_add(1, Ordering::SeqCst);
    }

    fn release(&self) {
        self.releases.fetch_add(1, Ordering::SeqCst);
    }
}

/// Attach a mock Uno at `bus`/`address` and return its transport and node
///
/// # Panics
/// If the controller refuses the device.
pub fn attach_mock(
    controller: &LifecycleController,
    bus: u8,
    address: u8,
    max_packet: u16,
) -> (Arc<MockTransport>, NodeInfo) {
    attach_transport(controller, MockTransport::new(), bus, address, max_packet)
}

/// Attach `transport` as a mock Uno at `bus`/`address`
///
/// # Panics
/// If the controller refuses the device.
pub fn attach_transport(
    controller: &LifecycleController,
    transport: Arc<MockTransport>,
    bus: u8,
    address: u8,
    max_packet: u16,
) -> (Arc<MockTransport>, NodeInfo) {
    let node = controller
        .on_attach(
            transport.clone(),
            create_mock_descriptors(bus, address, max_packet),
        )
        .expect("mock device should attach");
    (transport, node)
}
