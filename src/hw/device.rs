//! The device capability interface and the two bundled leaf drivers.
//!
//! The operating system talks to every device through the [`Device`]
//! trait. Data produced by a device never flows back through the
//! trait: a device finishes a request by posting a completion record
//! into the interrupt controller, which the CPU observes at the next
//! step boundary. A synchronous device posts before returning from
//! `read`/`write`; an asynchronous one hands the request to a worker
//! and posts later.

use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crossbeam_channel as cbc;
use rand::Rng;

use crate::Word;

use super::intc::{IntcHandle, IoEvent};

/// Identifies a registered device; the value user programs push as a
/// system-call argument.
pub type DeviceId = Word;

/// Id a device reports before the OS registers it.
const UNREGISTERED: DeviceId = -999;

/// The capability interface a device driver exposes to the OS.
pub trait Device: Send {
    /// The device's registered id.
    fn id(&self) -> DeviceId;
    /// Assigns the device's id; called once at registration.
    fn set_id(&mut self, id: DeviceId);
    /// Whether several processes may hold the device open at once.
    fn is_sharable(&self) -> bool;
    /// Whether the device can accept a new request right now.
    fn is_available(&self) -> bool;
    /// Whether the device services read requests.
    fn is_readable(&self) -> bool;
    /// Whether the device services write requests.
    fn is_writeable(&self) -> bool;
    /// Begins a read of `addr`. The data word is delivered through the
    /// interrupt controller; the immediate return value is a
    /// placeholder for asynchronous devices.
    fn read(&mut self, addr: Word) -> Word;
    /// Begins a write of `data` to `addr`; completion is signalled
    /// through the interrupt controller.
    fn write(&mut self, addr: Word, data: Word);
}

/// A keyboard: non-sharable, read-only, asynchronous.
///
/// Requests are handed to a worker thread which produces a random
/// digit and posts the completion. While a request is in flight the
/// device reports itself unavailable.
pub struct KeyboardDevice {
    id: Arc<AtomicI32>,
    busy: Arc<AtomicBool>,
    requests: cbc::Sender<Word>,
    #[allow(unused)]
    worker: JoinHandle<()>,
}

impl KeyboardDevice {
    /// Creates the keyboard and spawns its worker thread.
    pub fn new(intc: IntcHandle) -> KeyboardDevice {
        let (requests, rx) = cbc::unbounded::<Word>();
        let id = Arc::new(AtomicI32::new(UNREGISTERED));
        let busy = Arc::new(AtomicBool::new(false));

        let worker_id = Arc::clone(&id);
        let worker_busy = Arc::clone(&busy);
        let worker = thread::spawn(move || {
            let mut rng = rand::thread_rng();
            for addr in rx.iter() {
                let data = rng.gen_range(0..10);
                let dev = worker_id.load(Ordering::Relaxed);
                intc.post(IoEvent::ReadDone { dev, addr, data });
                worker_busy.store(false, Ordering::Release);
            }
        });

        KeyboardDevice { id, busy, requests, worker }
    }
}

impl Device for KeyboardDevice {
    fn id(&self) -> DeviceId {
        self.id.load(Ordering::Relaxed)
    }

    fn set_id(&mut self, id: DeviceId) {
        self.id.store(id, Ordering::Relaxed);
    }

    fn is_sharable(&self) -> bool {
        false
    }

    fn is_available(&self) -> bool {
        !self.busy.load(Ordering::Acquire)
    }

    fn is_readable(&self) -> bool {
        true
    }

    fn is_writeable(&self) -> bool {
        false
    }

    fn read(&mut self, addr: Word) -> Word {
        self.busy.store(true, Ordering::Release);
        let _ = self.requests.send(addr);
        0
    }

    fn write(&mut self, _addr: Word, _data: Word) {}
}

/// A console: sharable, write-only, synchronous.
///
/// Writes print to stdout and the completion record is posted before
/// `write` returns, so the writer unblocks on the very next step.
pub struct ConsoleDevice {
    id: DeviceId,
    intc: IntcHandle,
}

impl ConsoleDevice {
    /// Creates the console.
    pub fn new(intc: IntcHandle) -> ConsoleDevice {
        ConsoleDevice { id: UNREGISTERED, intc }
    }
}

impl Device for ConsoleDevice {
    fn id(&self) -> DeviceId {
        self.id
    }

    fn set_id(&mut self, id: DeviceId) {
        self.id = id;
    }

    fn is_sharable(&self) -> bool {
        true
    }

    fn is_available(&self) -> bool {
        true
    }

    fn is_readable(&self) -> bool {
        false
    }

    fn is_writeable(&self) -> bool {
        true
    }

    fn read(&mut self, _addr: Word) -> Word {
        0
    }

    fn write(&mut self, addr: Word, data: Word) {
        println!("CONSOLE: {data}");
        self.intc.post(IoEvent::WriteDone { dev: self.id, addr });
    }
}
