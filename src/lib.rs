#![cfg_attr(not(test), no_std)]
#![warn(missing_docs)]
//!
//! Implements the ST-Link/V2 bootloader ("DFU") protocol for a `usb-device` device.
//!
//! ## About
//!
//! ST-Link debug probes ship with a small bootloader that lets host tools
//! (`stlink-tool`, ST's firmware upgrade utility) replace the probe's
//! application firmware over the probe's own bulk endpoints.
//! This library implements the device side of that protocol, so a board
//! that is not an ST-Link can be reprogrammed with the same tools.
//!
//! The library is a protocol implementation only. Code that erases and
//! programs the on-chip flash, reads the unique id or resets the chip is
//! provided by the library user through the [`FlashMemIO`] and [`Board`]
//! traits.
//!
//! ### Structure
//!
//! * [`StlinkClass`] - `usb-device` class, owns the bulk endpoints.
//! * [`Receiver`] - decodes 16-byte command frames, answers queries and
//!   stages program-data payloads. Runs from `usb_dev.poll()`.
//! * [`Worker`] - validates staged commands and erases or programs
//!   flash. Runs in its own task or in the main loop, because flash
//!   operations block for milliseconds.
//! * [`Session`] - state shared by the two: the status register and a
//!   one-slot mailbox.
//!
//! ### Supported operations
//!
//! * Identify, capability probe, chip info, strap pin query
//! * Status query with the busy/done handshake
//! * Set flash address, erase page
//! * Program encrypted payloads
//! * Read calibration block
//! * Exit to application
//!
//! ### Security
//!
//! Protected payloads are encrypted with a key derived from the chip's
//! unique id and two constants that are public. Anybody able to read the
//! unique id can produce a valid payload. See [`keys`].
//!
//! ## Example
//!
//! ```ignore
//! use stlink_dfu::*;
//! use usb_device::prelude::*;
//!
//! static SESSION: Session = Session::new();
//!
//! // MyBoard implements Board + BootMarker, MyFlash implements FlashMemIO,
//! // MyUid implements UidSource.
//! let mut stlink = StlinkClass::new(&usb_bus_alloc, &SESSION, MyBoard::new()).unwrap();
//! let mut usb_dev = UsbDeviceBuilder::new(&usb_bus_alloc, UsbVidPid(0x0483, 0x3748))
//!     .build();
//!
//! let mut worker = Worker::new(&SESSION, MyFlash::new(), MyUid);
//!
//! loop {
//!     // usually from the USB interrupt handler
//!     usb_dev.poll(&mut [&mut stlink]);
//!     worker.poll();
//! }
//! ```
//!
//! With an async executor, spawn `worker.run()` and
//! [`activity::run()`] as tasks instead of polling.
//!

/// Activity LED task.
pub mod activity;
/// Cold start decision and boot marker.
pub mod boot;
/// ST-Link protocol USB class.
pub mod class;
/// Flash controller abstraction and erase/program sequencing.
pub mod flash;
/// Device-bound payload key.
pub mod keys;
/// Frame format and opcodes.
pub mod protocol;
/// Frame decoder.
pub mod receiver;
/// State shared between receiver and worker.
pub mod session;
/// Status register.
pub mod status;
/// Command processor.
pub mod worker;

#[doc(inline)]
pub use crate::boot::{BootDecision, BootMarker};
#[doc(inline)]
pub use crate::class::StlinkClass;
#[doc(inline)]
pub use crate::flash::{FlashError, FlashMemIO};
#[doc(inline)]
pub use crate::receiver::{Board, Receiver};
#[doc(inline)]
pub use crate::session::Session;
#[doc(inline)]
pub use crate::status::Status;
#[doc(inline)]
pub use crate::worker::{UidSource, Worker};
