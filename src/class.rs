use core::fmt::Write;
use heapless::String;
use log::warn;
use usb_device::class_prelude::*;
use usb_device::{LangID, UsbDirection, UsbError};

use crate::keys::DeviceUid;
use crate::receiver::{Board, Outcome, Receiver, Reply};
use crate::session::Session;

const USB_CLASS_VENDOR_SPECIFIC: u8 = 0xFF;
const USB_SUBCLASS_VENDOR_SPECIFIC: u8 = 0xFF;
const USB_PROTOCOL_VENDOR_SPECIFIC: u8 = 0xFF;

/// Endpoint number of the reply (IN) endpoint.
pub const TX_ENDPOINT: u8 = 1;
/// Endpoint number of the command (OUT) endpoint.
pub const RX_ENDPOINT: u8 = 2;
/// Endpoint number of the trace (IN) endpoint. Advertised, never used.
pub const TRACE_ENDPOINT: u8 = 3;

/// Bulk endpoint max packet size.
pub const MAX_PACKET_SIZE: u16 = 64;

const INTERFACE_STRING: &str = "ST Link";

/// USB serial number string for a device, as ST-Link firmwares report it:
/// the unique id as three 32-bit words in upper-case hex.
pub fn serial_number(uid: &DeviceUid) -> String<24> {
    let mut s = String::new();
    for w in uid.chunks_exact(4) {
        let word = u32::from_le_bytes([w[0], w[1], w[2], w[3]]);
        write!(s, "{:08X}", word).ok();
    }
    s
}

/// ST-Link bootloader USB class implementation for usb-device library.
///
/// Owns the bulk endpoints and a [`Receiver`]. Every OUT packet is fed to
/// the receiver from `usb_dev.poll()`; replies are written to the IN
/// endpoint right away. A reply that finds the IN endpoint still busy is
/// kept and sent when the previous transfer completes. Only one reply is
/// kept; a newer one replaces it.
pub struct StlinkClass<'a, 's, B: UsbBus, P: Board> {
    if_num: InterfaceNumber,
    interface_string: StringIndex,
    ep_in: EndpointIn<'a, B>,
    ep_out: EndpointOut<'a, B>,
    ep_trace: EndpointIn<'a, B>,
    receiver: Receiver<'s, P>,
    pending: Option<Reply>,
}

impl<'a, 's, B: UsbBus, P: Board> StlinkClass<'a, 's, B, P> {
    /// Creates a new StlinkClass with the provided UsbBus, session and
    /// board. Endpoint addresses are fixed, host tools expect them.
    pub fn new(
        alloc: &'a UsbBusAllocator<B>,
        session: &'s Session,
        board: P,
    ) -> usb_device::Result<Self> {
        let ep_in = alloc.alloc(
            Some(EndpointAddress::from_parts(TX_ENDPOINT as usize, UsbDirection::In)),
            EndpointType::Bulk,
            MAX_PACKET_SIZE,
            0,
        )?;
        let ep_out = alloc.alloc(
            Some(EndpointAddress::from_parts(RX_ENDPOINT as usize, UsbDirection::Out)),
            EndpointType::Bulk,
            MAX_PACKET_SIZE,
            0,
        )?;
        let ep_trace = alloc.alloc(
            Some(EndpointAddress::from_parts(TRACE_ENDPOINT as usize, UsbDirection::In)),
            EndpointType::Bulk,
            MAX_PACKET_SIZE,
            0,
        )?;

        Ok(Self {
            if_num: alloc.interface(),
            interface_string: alloc.string(),
            ep_in,
            ep_out,
            ep_trace,
            receiver: Receiver::new(session, board),
            pending: None,
        })
    }

    /// Protocol decoder driven by this class.
    pub fn receiver(&self) -> &Receiver<'s, P> {
        &self.receiver
    }

    /// Returns `true` if a reply waits for the IN endpoint.
    pub fn reply_pending(&self) -> bool {
        self.pending.is_some()
    }

    fn read_packet(&mut self) {
        let mut buf = [0u8; MAX_PACKET_SIZE as usize];

        let outcome = match self.ep_out.read(&mut buf) {
            Ok(n) => self.receiver.on_packet(&buf[..n]),
            Err(UsbError::WouldBlock) => return,
            Err(e) => {
                warn!("read failed: {:?}", e);
                self.receiver.on_transport_error();
                return;
            }
        };

        match outcome {
            Outcome::None => {}
            Outcome::Reply(reply) => self.send_reply(reply),
            // may not return
            Outcome::Exit => self.receiver.exit(),
        }
    }

    fn send_reply(&mut self, reply: Reply) {
        match self.ep_in.write(&reply) {
            Ok(_) => {}
            Err(UsbError::WouldBlock) => {
                if self.pending.replace(reply).is_some() {
                    warn!("unsent reply replaced");
                }
            }
            Err(e) => warn!("reply of {} bytes failed: {:?}", reply.len(), e),
        }
    }
}

impl<B: UsbBus, P: Board> UsbClass<B> for StlinkClass<'_, '_, B, P> {
    fn get_configuration_descriptors(
        &self,
        writer: &mut DescriptorWriter,
    ) -> usb_device::Result<()> {
        writer.interface_alt(
            self.if_num,
            0,
            USB_CLASS_VENDOR_SPECIFIC,
            USB_SUBCLASS_VENDOR_SPECIFIC,
            USB_PROTOCOL_VENDOR_SPECIFIC,
            Some(self.interface_string),
        )?;

        writer.endpoint(&self.ep_in)?;
        writer.endpoint(&self.ep_out)?;
        writer.endpoint(&self.ep_trace)?;

        Ok(())
    }

    fn get_string(&self, index: StringIndex, _lang_id: LangID) -> Option<&str> {
        if index == self.interface_string {
            return Some(INTERFACE_STRING);
        }
        None
    }

    fn reset(&mut self) {
        self.pending = None;
        self.receiver.on_bus_reset();
    }

    fn endpoint_in_complete(&mut self, addr: EndpointAddress) {
        if addr == self.ep_in.address() {
            if let Some(reply) = self.pending.take() {
                self.send_reply(reply);
            }
        }
    }

    fn endpoint_out(&mut self, addr: EndpointAddress) {
        if addr == self.ep_out.address() {
            self.read_packet();
        }
    }
}
