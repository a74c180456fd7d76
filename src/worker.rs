use log::{debug, info, warn};

use crate::flash::{self, FlashMemIO};
use crate::keys::{decrypt_payload, derive_key, DeviceUid};
use crate::protocol::{checksum, LocationCommand, SEQUENCE_PROTECTED};
use crate::session::{Session, StagedCommand};
use crate::status::Status;

/// Where the next program command writes.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct FlashTarget {
    /// Flash address.
    pub address: u32,
}

/// Source of the hardware unique id, read fresh for every protected command.
///
/// Same hardware read as [`Board::unique_id`](crate::receiver::Board::unique_id).
/// It is a separate trait because the [`Board`](crate::receiver::Board) value
/// is owned by the receiver inside the USB class, while the worker runs in
/// another task or context.
pub trait UidSource {
    /// Read the 12-byte unique id.
    fn unique_id(&self) -> DeviceUid;
}

/// Command processor.
///
/// Takes staged commands from the [`Session`] mailbox one at a time,
/// authenticates them and performs the flash operation they request.
/// Flash operations are blocking and always run to completion.
pub struct Worker<'s, F: FlashMemIO, U: UidSource> {
    session: &'s Session,
    flash: F,
    uid: U,
    target: FlashTarget,
    verify_failures: u32,
}

impl<'s, F: FlashMemIO, U: UidSource> Worker<'s, F, U> {
    /// Creates a worker. The flash target starts at
    /// [`APPLICATION_BASE`](FlashMemIO::APPLICATION_BASE).
    pub fn new(session: &'s Session, flash: F, uid: U) -> Self {
        Self {
            session,
            flash,
            uid,
            target: FlashTarget {
                address: F::APPLICATION_BASE,
            },
            verify_failures: 0,
        }
    }

    /// Current flash target.
    pub fn target(&self) -> FlashTarget {
        self.target
    }

    /// Number of words that failed to program or verify so far.
    ///
    /// These failures are not reported to the host.
    pub fn verify_failures(&self) -> u32 {
        self.verify_failures
    }

    /// Flash controller.
    pub fn flash(&self) -> &F {
        &self.flash
    }

    /// Wait for staged commands and process them, forever.
    pub async fn run(&mut self) -> ! {
        loop {
            let cmd = self.session.mailbox.receive().await;
            self.process(cmd);
        }
    }

    /// Process the staged command if there is one.
    ///
    /// For main-loop firmwares without an executor. Returns `true` if a
    /// command was processed.
    pub fn poll(&mut self) -> bool {
        match self.session.mailbox.try_receive() {
            Ok(cmd) => {
                self.process(cmd);
                true
            }
            Err(_) => false,
        }
    }

    /// Decrypt, validate and execute one command.
    pub fn process(&mut self, mut cmd: StagedCommand) {
        let sequence = cmd.frame.sequence();
        let protected = sequence & SEQUENCE_PROTECTED != 0;

        if protected {
            let key = derive_key(&self.uid.unique_id());
            let done = decrypt_payload(&key, &mut cmd.payload);
            if done != cmd.payload.len() {
                debug!("{} trailing bytes not decrypted", cmd.payload.len() - done);
            }
        }

        let sum = checksum(&cmd.payload);
        if sum != cmd.frame.checksum() {
            warn!(
                "checksum mismatch: got 0x{:04x}, expected 0x{:04x}",
                sum,
                cmd.frame.checksum()
            );
            self.session.status.set(Status::ABORTED);
            return;
        }

        if sequence == 0 && cmd.payload.len() == 5 {
            self.location(&cmd.payload);
        } else if protected {
            self.program(&cmd.payload);
        } else {
            debug!(
                "unprotected command seq {} len {} ignored",
                sequence,
                cmd.payload.len()
            );
        }

        self.session.status.set(Status::STOPPED.union(Status::BUSY));
    }

    fn location(&mut self, payload: &[u8]) {
        let command = match LocationCommand::from_byte(payload[0]) {
            Some(c) => c,
            None => {
                debug!("unknown location command 0x{:02x}", payload[0]);
                return;
            }
        };

        self.target.address = u32::from_le_bytes([payload[1], payload[2], payload[3], payload[4]]);
        info!("target 0x{:08x}", self.target.address);

        if command == LocationCommand::ErasePage {
            if let Err(e) = flash::erase(&mut self.flash, self.target.address) {
                warn!("erase 0x{:08x} failed: {:?}", self.target.address, e);
            }
        }
    }

    fn program(&mut self, payload: &[u8]) {
        debug!("program {} bytes at 0x{:08x}", payload.len(), self.target.address);
        let failed = flash::program(&mut self.flash, self.target.address, payload);
        self.verify_failures = self.verify_failures.saturating_add(failed);
    }
}
