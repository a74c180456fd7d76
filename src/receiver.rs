use heapless::Vec;
use log::{debug, info, warn};

use crate::boot::{BootMarker, EXIT_MARKER};
use crate::keys::DeviceUid;
use crate::protocol::{Frame, Request, COMMAND_CAPACITY, REPLY_CAPACITY};
use crate::session::{Session, StagedCommand};
use crate::status::{Status, StatusReply};

/// Offset of the 2-byte firmware version, at the end of the bootloader region.
pub const VERSION_OFFSET: u32 = 16 * 1024 - 2;

/// Offset of the calibration block in the bootloader region.
pub const CALIBRATION_OFFSET: u32 = 15 * 1024 + 0x30;

/// Time between bus disconnect and reset on exit.
pub const EXIT_SETTLE_MS: u32 = 1500;

const CAPABILITIES: [u8; 2] = [0x00, 0x02];
const CHIP_INFO_HEADER: [u8; 4] = [0x80, 0x00, 0xff, 0xff];
const STRAP_DETECTED: u8 = 0x21;

/// Trait that describes the board the programmer runs on: identity
/// constants, a few hardware reads, and the exit sequence primitives.
pub trait Board: BootMarker {
    /// USB vendor id reported by the identify command.
    const VENDOR_ID: u16 = 0x0483;

    /// USB product id reported by the identify command.
    const PRODUCT_ID: u16 = 0x3748;

    /// Configuration tag reported in the chip info reply.
    ///
    /// Known values: `06 40 05 49` (blank), `4a 06 40 05` (debugger only),
    /// `42 06 40 05` (debugger with mass storage and virtual COM port).
    const CONFIG_TAG: [u8; 4] = [0x42, 0x06, 0x40, 0x05];

    /// Read the 12-byte hardware unique id from system memory.
    fn unique_id(&self) -> DeviceUid;

    /// Read `buf.len()` bytes of the programmer's own flash at `offset`
    /// from the flash base.
    fn read_flash(&self, offset: u32, buf: &mut [u8]);

    /// Levels of the two strap pins `(a, b)`.
    ///
    /// On ST-LINK/V2 boards pin A (PC13) has a 10K pull-down and
    /// pin B (PC14) is floating.
    fn strap_pins(&self) -> (bool, bool);

    /// Detach from the USB bus.
    fn disconnect_bus(&mut self);

    /// Blocking delay.
    fn delay_ms(&mut self, ms: u32);

    /// Full system reset.
    fn system_reset(&mut self) -> !;
}

/// Immediate reply to a host frame.
pub type Reply = Vec<u8, REPLY_CAPACITY>;

/// What the transport must do after a packet was processed.
#[derive(PartialEq, Eq, Debug)]
pub enum Outcome {
    /// Nothing to send.
    None,
    /// Transmit the reply on the IN endpoint.
    Reply(Reply),
    /// The host asked to leave the programmer. Call [`Receiver::exit()`].
    Exit,
}

enum Sink {
    Stage(StagedCommand),
    Discard,
}

enum RxState {
    Frame,
    Payload { sink: Sink, remaining: usize },
}

/// Protocol decoder.
///
/// Fed with OUT-endpoint packets and bus resets. Answers queries
/// immediately and stages program-data payloads for the
/// [`Worker`](crate::worker::Worker).
pub struct Receiver<'s, P: Board> {
    session: &'s Session,
    board: P,
    state: RxState,
}

impl<'s, P: Board> Receiver<'s, P> {
    /// Creates a receiver working on `session`.
    pub fn new(session: &'s Session, board: P) -> Self {
        Self {
            session,
            board,
            state: RxState::Frame,
        }
    }

    /// Board this receiver reads identity and pins from.
    pub fn board(&self) -> &P {
        &self.board
    }

    /// Returns `true` while a program-data payload is being received.
    pub fn receiving_payload(&self) -> bool {
        matches!(self.state, RxState::Payload { .. })
    }

    /// USB bus was reset. Drops any partially received command.
    pub fn on_bus_reset(&mut self) {
        if self.receiving_payload() {
            info!("bus reset, dropping partial command");
        }
        self.state = RxState::Frame;
        self.session.status.set(Status::READY);
    }

    /// OUT endpoint read failed. Aborts a command being received.
    pub fn on_transport_error(&mut self) {
        if self.receiving_payload() {
            self.abort_payload();
        }
    }

    /// Process one OUT-endpoint packet.
    pub fn on_packet(&mut self, data: &[u8]) -> Outcome {
        match self.state {
            RxState::Frame => self.on_frame(Frame::new(data)),
            RxState::Payload { .. } => {
                self.on_payload(data);
                Outcome::None
            }
        }
    }

    /// Leave the programmer: detach, wait, set the exit marker and reset.
    pub fn exit(&mut self) -> ! {
        info!("exit requested");
        self.board.disconnect_bus();
        self.board.delay_ms(EXIT_SETTLE_MS);
        self.board.write(EXIT_MARKER);
        self.board.system_reset()
    }

    fn on_frame(&mut self, frame: Frame) -> Outcome {
        self.session.activity.signal(());

        let request = match frame.request() {
            Some(r) => r,
            None => {
                debug!("ignored frame {:02x?}", frame.bytes());
                return Outcome::None;
            }
        };

        debug!("{:?}", request);

        let mut reply = Reply::new();

        match request {
            Request::Identify => {
                let mut version = [0u8; 2];
                self.board.read_flash(VERSION_OFFSET, &mut version);
                push(&mut reply, &version);
                push(&mut reply, &P::VENDOR_ID.to_le_bytes());
                push(&mut reply, &P::PRODUCT_ID.to_le_bytes());
            }
            Request::Capabilities => {
                push(&mut reply, &CAPABILITIES);
            }
            Request::ChipInfo => {
                push(&mut reply, &CHIP_INFO_HEADER);
                push(&mut reply, &P::CONFIG_TAG);
                push(&mut reply, &self.board.unique_id());
            }
            Request::PinState => {
                let mut pins = [0u8; 16];
                if self.board.strap_pins() == (false, true) {
                    pins[3] = STRAP_DETECTED;
                }
                push(&mut reply, &pins);
            }
            Request::Status => {
                let status: StatusReply = self.session.status.query();
                push(&mut reply, &status);
            }
            Request::Calibration { length } => {
                let mut block = [0u8; REPLY_CAPACITY];
                let block = &mut block[..(length as usize).min(REPLY_CAPACITY)];
                self.board.read_flash(CALIBRATION_OFFSET, block);
                push(&mut reply, block);
            }
            Request::ProgramData { length } => {
                self.begin_payload(frame, length as usize);
                return Outcome::None;
            }
            Request::Exit => return Outcome::Exit,
        }

        Outcome::Reply(reply)
    }

    fn begin_payload(&mut self, frame: Frame, length: usize) {
        let busy = self.session.status.get().contains(Status::BUSY);
        let pending = self.session.command_pending();

        let sink = if !busy && !pending && length <= COMMAND_CAPACITY {
            Sink::Stage(StagedCommand {
                frame,
                payload: Vec::new(),
            })
        } else {
            warn!(
                "refusing {} byte command (busy {}, pending {})",
                length, busy, pending
            );
            self.session.status.insert(Status::ERROR);
            Sink::Discard
        };

        self.state = RxState::Payload {
            sink,
            remaining: length,
        };

        if length == 0 {
            self.finish_payload();
        }
    }

    fn on_payload(&mut self, data: &[u8]) {
        if data.is_empty() {
            self.abort_payload();
            return;
        }

        if let RxState::Payload { sink, remaining } = &mut self.state {
            let n = data.len().min(*remaining);
            if let Sink::Stage(cmd) = sink {
                // capacity checked when the frame was accepted
                if cmd.payload.extend_from_slice(&data[..n]).is_err() {
                    warn!("payload overflow");
                }
            }
            *remaining -= n;
            if *remaining == 0 {
                self.finish_payload();
            }
        }
    }

    fn abort_payload(&mut self) {
        warn!("transport error, command aborted");
        self.state = RxState::Frame;
        self.session.status.set(Status::READY);
    }

    fn finish_payload(&mut self) {
        let state = core::mem::replace(&mut self.state, RxState::Frame);

        let cmd = match state {
            RxState::Payload {
                sink: Sink::Stage(cmd),
                ..
            } => cmd,
            // drained, nothing to hand over
            _ => return,
        };

        self.session.status.set(Status::RUNNING);
        if self.session.mailbox.try_send(cmd).is_err() {
            warn!("mailbox full, command dropped");
            self.session.status.insert(Status::ERROR);
        }
    }
}

fn push(reply: &mut Reply, data: &[u8]) {
    // replies are sized below REPLY_CAPACITY
    reply.extend_from_slice(data).ok();
}
