//! The interrupt controller: a bounded mailbox carrying I/O completion
//! records from devices to the CPU.
//!
//! Devices post [`IoEvent`]s through a cloneable [`IntcHandle`]; the
//! CPU polls [`InterruptController::take`] at the top of every
//! execution step, so completions become observable only at step
//! boundaries. Posts from one device arrive in FIFO order; ordering
//! between devices is unspecified.

use crossbeam_channel as cbc;

use crate::Word;

use super::device::DeviceId;

/// Interrupt kind for a completed read.
pub const INT_READ_DONE: Word = 0;
/// Interrupt kind for a completed write.
pub const INT_WRITE_DONE: Word = 1;

/// An I/O completion record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoEvent {
    /// A device finished a read; `data` is the word it produced.
    ReadDone {
        /// Id of the posting device.
        dev: DeviceId,
        /// The address the read was issued against.
        addr: Word,
        /// The word the device produced.
        data: Word,
    },
    /// A device finished a write.
    WriteDone {
        /// Id of the posting device.
        dev: DeviceId,
        /// The address the write was issued against.
        addr: Word,
    },
}

/// The consumer side of the mailbox, polled by the CPU.
#[derive(Debug)]
pub struct InterruptController {
    tx: cbc::Sender<IoEvent>,
    rx: cbc::Receiver<IoEvent>,
}

impl InterruptController {
    /// Creates a controller able to hold `depth` pending records.
    ///
    /// A producer posting into a full mailbox blocks until the CPU
    /// drains a record, so device worker threads queue at their own
    /// end rather than losing completions.
    pub fn new(depth: usize) -> InterruptController {
        let (tx, rx) = cbc::bounded(depth.max(1));
        InterruptController { tx, rx }
    }

    /// Creates a new posting handle for a device.
    pub fn handle(&self) -> IntcHandle {
        IntcHandle { tx: self.tx.clone() }
    }

    /// Whether any completion record is pending.
    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }

    /// Removes and returns the oldest pending record, if any.
    pub fn take(&self) -> Option<IoEvent> {
        self.rx.try_recv().ok()
    }
}

/// The producer side of the mailbox, held by devices.
#[derive(Debug, Clone)]
pub struct IntcHandle {
    tx: cbc::Sender<IoEvent>,
}

impl IntcHandle {
    /// Posts a completion record, blocking while the mailbox is full.
    ///
    /// A post after the controller has been dropped is discarded; the
    /// simulation it was destined for no longer exists.
    pub fn post(&self, event: IoEvent) {
        let _ = self.tx.send(event);
    }
}
