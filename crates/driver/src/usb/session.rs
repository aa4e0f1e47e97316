//! Open sessions on a device node
//!
//! A [`FileSession`] is what a client gets back from opening a node: it owns
//! one counted reference to the device and serializes its own reads and
//! writes. Different sessions on the same device share the bulk-in buffer, so
//! a second session reading while the first has a transfer in flight gets
//! `AlreadyPending`.

use crate::usb::handle::{DeviceHandle, lock};
use crate::usb::transfers::{Interrupter, PendingTransfer, TransferEngine, surface_error};
use protocol::{DriverError, NodeInfo, Result};
use std::fmt;
use std::sync::Mutex;
use std::time::Duration;
use tracing::{debug, info};

/// Per-open settings
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct OpenOptions {
    /// Bound on each blocking wait inside `read`; `None` waits indefinitely
    pub read_timeout: Option<Duration>,
    /// Fail with `Busy` instead of waiting for a transfer
    pub nonblocking: bool,
}

impl OpenOptions {
    pub fn read_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.read_timeout = timeout;
        self
    }

    pub fn nonblocking(mut self, nonblocking: bool) -> Self {
        self.nonblocking = nonblocking;
        self
    }
}

/// One open of a device node
pub struct FileSession {
    device: DeviceHandle,
    engine: TransferEngine,
    options: OpenOptions,
    /// Serializes this session's reads and writes; never held across a wait.
    /// Holds the transfer a timed-out or interrupted read left in flight.
    io_lock: Mutex<Option<PendingTransfer>>,
    interrupter: Interrupter,
}

impl FileSession {
    /// Bind a session to an already-retained device reference
    ///
    /// Wakes the bus link; on failure the reference is dropped again.
    pub(crate) fn open(
        device: DeviceHandle,
        engine: TransferEngine,
        options: OpenOptions,
    ) -> Result<Self> {
        if device.is_disconnected() {
            return Err(DriverError::NoSuchDevice {
                node: device.name().to_string(),
            });
        }

        if let Err(status) = device.transport().resume() {
            debug!("{}: resume failed: {}", device.name(), status);
            return Err(DriverError::PowerResumeFailed(status));
        }

        let interrupter = Interrupter::new(&device);
        info!("{}: opened ({} references)", device.name(), device.refcount());
        Ok(Self {
            device,
            engine,
            options,
            io_lock: Mutex::new(None),
            interrupter,
        })
    }

    pub fn name(&self) -> &str {
        self.device.name()
    }

    pub fn options(&self) -> OpenOptions {
        self.options
    }

    pub fn info(&self) -> NodeInfo {
        self.device.info()
    }

    pub fn is_disconnected(&self) -> bool {
        self.device.is_disconnected()
    }

    /// Handle that wakes a read blocked in this session with `Interrupted`
    pub fn interrupter(&self) -> Interrupter {
        self.interrupter.clone()
    }

    /// Read up to `buf.len()` bytes
    ///
    /// Buffered bytes from the last transfer are served first. Otherwise a
    /// bulk-in transfer is submitted and awaited; a zero-length completion
    /// is resubmitted. Returns 0 only for an empty `buf`. After `TimedOut`
    /// or `Interrupted` the transfer stays in flight and the next read picks
    /// it up again.
    pub fn read(&self, buf: &mut [u8]) -> Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }

        let mut io = lock(&self.io_lock);
        self.interrupter.reset();
        if let Some(status) = self.device.take_error() {
            return Err(surface_error(&self.device, status));
        }

        loop {
            {
                let mut state = lock(&self.device.state);
                let available = state.buffered();
                if available > 0 {
                    let n = available.min(buf.len());
                    let start = state.consumed;
                    let Some(buffer) = state.buffer.as_ref() else {
                        return Err(DriverError::Disconnected);
                    };
                    buf[..n].copy_from_slice(&buffer[start..start + n]);
                    state.consumed += n;
                    return Ok(n);
                }
            }

            // Only our own in-flight transfer is picked up again; another
            // session's makes `submit` fail with AlreadyPending
            let own = io
                .take()
                .filter(|pending| self.engine.is_in_flight(&self.device, pending));
            let pending = match own {
                Some(pending) => pending,
                None => self.engine.submit(&self.device, buf.len())?,
            };
            if self.options.nonblocking {
                *io = Some(pending);
                return Err(DriverError::Busy);
            }

            drop(io);
            let result = self.engine.await_completion(
                &self.device,
                &pending,
                self.options.read_timeout,
                Some(&self.interrupter),
            );
            io = lock(&self.io_lock);

            match result {
                Ok(0) => debug!("{}: zero-length bulk-in, resubmitting", self.name()),
                Ok(_) => {}
                Err(err @ (DriverError::TimedOut | DriverError::Interrupted)) => {
                    *io = Some(pending);
                    return Err(err);
                }
                Err(err) => return Err(err),
            }
        }
    }

    /// Queue `buf` as one bulk-out transfer
    ///
    /// Returns once the transfer is queued; a failure surfaces on a later
    /// call.
    pub fn write(&self, buf: &[u8]) -> Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }

        let _io = lock(&self.io_lock);
        if let Some(status) = self.device.take_error() {
            return Err(surface_error(&self.device, status));
        }
        self.engine.submit_write(&self.device, buf)
    }

    /// Wait for queued writes and report any error they left behind
    pub fn flush(&self) -> Result<()> {
        let _io = lock(&self.io_lock);
        if !self
            .engine
            .drain_writes(&self.device, Some(self.engine.drain_timeout()))
        {
            return Err(DriverError::TimedOut);
        }
        match self.device.take_error() {
            Some(status) => Err(surface_error(&self.device, status)),
            None => Ok(()),
        }
    }

    /// End the session, releasing its device reference
    pub fn close(self) {
        drop(self);
    }
}

impl Drop for FileSession {
    fn drop(&mut self) {
        let abandoned = lock(&self.io_lock).take();
        if let Some(pending) = abandoned
            && self.engine.is_in_flight(&self.device, &pending)
        {
            debug!("{}: cancelling read left in flight", self.device.name());
            self.engine.cancel(&self.device, pending);
        }
        if !self.device.is_disconnected() {
            self.device.transport().autosuspend();
        }
        debug!("{}: closed", self.device.name());
    }
}

impl fmt::Debug for FileSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FileSession")
            .field("device", &self.device)
            .field("options", &self.options)
            .finish_non_exhaustive()
    }
}
