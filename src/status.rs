use core::cell::Cell;
use embassy_sync::blocking_mutex::{raw::CriticalSectionRawMutex, Mutex};

/// Programmer state as seen by the host through the status query.
///
/// This is a bitmask, not an enumeration: [`Status::BUSY`] and
/// [`Status::ERROR`] are flags that are OR-ed on top of the base state.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct Status(u8);

impl Status {
    /// Waiting for a command.
    pub const READY: Status = Status(0x00);
    /// A command is staged and the worker is processing it.
    pub const RUNNING: Status = Status(0x01);
    /// The worker has finished the last command.
    pub const STOPPED: Status = Status(0x02);
    /// The last command failed checksum validation and was dropped.
    pub const ABORTED: Status = Status(0x04);
    /// Set together with [`Status::STOPPED`] by the worker, cleared by the
    /// first status query that observes it.
    pub const BUSY: Status = Status(0x10);
    /// A program-data command was refused (buffer busy or too large).
    pub const ERROR: Status = Status(0x20);

    /// Raw register value.
    pub const fn bits(self) -> u8 {
        self.0
    }

    /// Builds a status from a raw register value.
    pub const fn from_bits(bits: u8) -> Self {
        Status(bits)
    }

    /// Returns `true` if all bits of `other` are set.
    pub const fn contains(self, other: Status) -> bool {
        self.0 & other.0 == other.0
    }

    /// Union of two statuses.
    pub const fn union(self, other: Status) -> Status {
        Status(self.0 | other.0)
    }

    const fn low_nibble(self) -> Status {
        Status(self.0 & 0x0f)
    }
}

/// Reply sent for the status query, 6 bytes.
pub type StatusReply = [u8; 6];

const REPLY_READY: StatusReply = [0x00, 0x00, 0x00, 0x00, 0x02, 0x00];
const REPLY_BUSY: StatusReply = [0x00, 0x50, 0x00, 0x00, 0x04, 0x00];
const REPLY_DONE: StatusReply = [0x00, 0x00, 0x00, 0x00, 0x05, 0x00];

impl From<Status> for StatusReply {
    fn from(status: Status) -> Self {
        match status {
            Status::READY => REPLY_READY,
            Status::STOPPED => REPLY_DONE,
            // RUNNING, ABORTED, STOPPED|BUSY, ERROR and anything else
            _ => REPLY_BUSY,
        }
    }
}

/// The status register shared between the receiver and the worker.
///
/// All reads and writes go through a single critical-section mutex.
/// The lock is only held for the duration of the closure, never across
/// a USB transfer or a flash operation.
pub struct StatusRegister {
    inner: Mutex<CriticalSectionRawMutex, Cell<Status>>,
}

impl StatusRegister {
    /// New register in [`Status::READY`] state.
    pub const fn new() -> Self {
        Self {
            inner: Mutex::new(Cell::new(Status::READY)),
        }
    }

    /// Current value.
    pub fn get(&self) -> Status {
        self.inner.lock(|s| s.get())
    }

    /// Replace the current value.
    pub fn set(&self, status: Status) {
        self.inner.lock(|s| s.set(status));
    }

    /// OR `flags` into the current value.
    pub fn insert(&self, flags: Status) {
        self.inner.lock(|s| s.set(s.get().union(flags)));
    }

    /// Answer a host status query.
    ///
    /// Observing `STOPPED|BUSY` clears the busy flag, so the host sees
    /// "busy" once and "done" on the next query. This is the handshake
    /// host tools poll between programming chunks.
    pub fn query(&self) -> StatusReply {
        self.inner.lock(|s| {
            let status = s.get();
            if status == Status::STOPPED.union(Status::BUSY) {
                s.set(status.low_nibble());
            }
            status.into()
        })
    }
}

impl Default for StatusRegister {
    fn default() -> Self {
        Self::new()
    }
}
