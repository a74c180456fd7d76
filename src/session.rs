use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use embassy_sync::channel::Channel;
use embassy_sync::signal::Signal;
use heapless::Vec;

use crate::protocol::{Frame, COMMAND_CAPACITY};
use crate::status::{Status, StatusRegister};

/// A fully received program-data command, owned by whoever holds it.
pub struct StagedCommand {
    /// Frame header.
    pub frame: Frame,
    /// Payload, exactly `frame.length()` bytes.
    pub payload: Vec<u8, COMMAND_CAPACITY>,
}

/// State shared between the receiver, the worker and the activity indicator.
///
/// Usually placed in a `static`:
///
/// ```
/// static SESSION: stlink_dfu::Session = stlink_dfu::Session::new();
/// ```
///
/// The mailbox holds at most one staged command. The receiver refuses to
/// stage another one until the worker has taken the previous one and the
/// host has acknowledged its completion through a status query.
pub struct Session {
    pub(crate) status: StatusRegister,
    pub(crate) mailbox: Channel<CriticalSectionRawMutex, StagedCommand, 1>,
    pub(crate) activity: Signal<CriticalSectionRawMutex, ()>,
}

impl Session {
    /// New idle session.
    pub const fn new() -> Self {
        Self {
            status: StatusRegister::new(),
            mailbox: Channel::new(),
            activity: Signal::new(),
        }
    }

    /// Current status register value.
    pub fn status(&self) -> Status {
        self.status.get()
    }

    /// Returns `true` if a staged command waits for the worker.
    pub fn command_pending(&self) -> bool {
        !self.mailbox.is_empty()
    }

    /// Returns `true` if host activity was seen since the indicator last
    /// looked.
    pub fn activity_seen(&self) -> bool {
        self.activity.signaled()
    }
}

impl Default for Session {
    fn default() -> Self {
        Self::new()
    }
}
