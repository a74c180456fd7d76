use std::{
    cell::{Cell, RefCell},
    cmp::min,
    rc::Rc,
};

use usb_device::bus::PollResult;
use usb_device::bus::{UsbBus, UsbBusAllocator};
use usb_device::device::StringDescriptors;
use usb_device::endpoint::{EndpointAddress, EndpointType};
use usb_device::prelude::*;
use usb_device::{LangID, Result, UsbDirection};

use stlink_dfu::class::{serial_number, MAX_PACKET_SIZE, RX_ENDPOINT, TX_ENDPOINT};
use stlink_dfu::{Session, StlinkClass};

use super::helpers::TestBoard;

pub const EP0_SIZE: u8 = 32;

struct EP {
    alloc: bool,
    stall: bool,
    read_len: usize,
    read: [u8; 1024],
    read_ready: bool,
    read_fail: bool,
    write_len: usize,
    write: [u8; 1024],
    write_done: bool,
    setup: bool,
    max_size: usize,
}

impl EP {
    fn new() -> Self {
        EP {
            alloc: false,
            stall: false,
            read_len: 0,
            read: [0; 1024],
            read_ready: false,
            read_fail: false,
            write_len: 0,
            write: [0; 1024],
            write_done: false,
            setup: false,
            max_size: 0,
        }
    }

    fn set_read(&mut self, data: &[u8], setup: bool) {
        self.read_len = data.len();
        self.read[..data.len()].copy_from_slice(data);
        self.setup = setup;
        self.read_ready = true;
    }

    fn get_write(&mut self, data: &mut [u8]) -> usize {
        let res = self.write_len;
        self.write_len = 0;
        data[..res].clone_from_slice(&self.write[..res]);
        self.write_done = true;
        res
    }
}

struct TestBusIO {
    ep_i: [RefCell<EP>; 4],
    ep_o: [RefCell<EP>; 4],
    reset: Cell<bool>,
}

impl TestBusIO {
    fn new() -> Self {
        Self {
            ep_i: core::array::from_fn(|_| RefCell::new(EP::new())),
            ep_o: core::array::from_fn(|_| RefCell::new(EP::new())),
            reset: Cell::new(false),
        }
    }

    fn epidx(&self, ep_addr: EndpointAddress) -> &RefCell<EP> {
        match ep_addr.direction() {
            UsbDirection::In => self.ep_i.get(ep_addr.index()).unwrap(),
            UsbDirection::Out => self.ep_o.get(ep_addr.index()).unwrap(),
        }
    }

    fn get_write(&self, ep_addr: EndpointAddress, data: &mut [u8]) -> usize {
        let mut ep = self.epidx(ep_addr).borrow_mut();
        ep.get_write(data)
    }

    fn set_read(&self, ep_addr: EndpointAddress, data: &[u8], setup: bool) {
        let mut ep = self.epidx(ep_addr).borrow_mut();
        if setup && ep_addr.index() == 0 {
            // setup packet on EP0OUT removes stall condition
            ep.stall = false;
            self.ep_i[0].borrow_mut().stall = false;
        }
        ep.set_read(data, setup)
    }

    fn stalled0(&self) -> bool {
        self.ep_i[0].borrow().stall || self.ep_o[0].borrow().stall
    }
}

pub struct TestBus {
    io: Rc<TestBusIO>,
}

unsafe impl Sync for TestBus {}

impl UsbBus for TestBus {
    fn alloc_ep(
        &mut self,
        _ep_dir: UsbDirection,
        ep_addr: Option<EndpointAddress>,
        _ep_type: EndpointType,
        max_packet_size: u16,
        _interval: u8,
    ) -> Result<EndpointAddress> {
        let ea = ep_addr.expect("ep_addr is required, endpoint allocation is not implemented");
        let mut sep = self.io.epidx(ea).borrow_mut();
        assert!(!sep.alloc);
        sep.alloc = true;
        sep.stall = false;
        sep.max_size = max_packet_size as usize;
        Ok(ea)
    }

    fn enable(&mut self) {}

    fn reset(&self) {}

    fn poll(&self) -> PollResult {
        if self.io.reset.replace(false) {
            return PollResult::Reset;
        }

        let mut ep_out = 0u16;
        let mut ep_in_complete = 0u16;
        let mut ep_setup = 0u16;

        for i in 0..4 {
            let o = self.io.ep_o[i].borrow();
            if o.setup {
                ep_setup |= 1 << i;
            } else if o.read_ready || o.read_fail {
                ep_out |= 1 << i;
            }

            let mut inp = self.io.ep_i[i].borrow_mut();
            if inp.write_done {
                inp.write_done = false;
                ep_in_complete |= 1 << i;
            }
        }

        if ep_out | ep_in_complete | ep_setup != 0 {
            PollResult::Data {
                ep_out,
                ep_in_complete,
                ep_setup,
            }
        } else {
            PollResult::None
        }
    }

    fn read(&self, ep_addr: EndpointAddress, buf: &mut [u8]) -> Result<usize> {
        let mut ep = self.io.epidx(ep_addr).borrow_mut();

        if ep.read_fail {
            ep.read_fail = false;
            return Err(UsbError::InvalidState);
        }

        let len = min(buf.len(), min(ep.read_len, ep.max_size));
        if len == 0 {
            return Err(UsbError::WouldBlock);
        }

        buf[..len].clone_from_slice(&ep.read[..len]);

        ep.read_len -= len;
        ep.read.copy_within(len.., 0);

        if ep.read_len == 0 {
            ep.setup = false;
        }
        ep.read_ready = ep.read_len > 0;

        Ok(len)
    }

    fn write(&self, ep_addr: EndpointAddress, buf: &[u8]) -> Result<usize> {
        let mut ep = self.io.epidx(ep_addr).borrow_mut();

        if buf.len() > ep.max_size {
            return Err(UsbError::BufferOverflow);
        }
        // bulk IN: previous packet not taken by the host yet
        if ep_addr.index() != 0 && ep.write_len > 0 {
            return Err(UsbError::WouldBlock);
        }

        let offset = ep.write_len;
        ep.write[offset..offset + buf.len()].copy_from_slice(buf);
        ep.write_len += buf.len();
        ep.write_done = false;
        Ok(buf.len())
    }

    fn resume(&self) {}

    fn suspend(&self) {}

    fn set_device_address(&self, _addr: u8) {}

    fn is_stalled(&self, ep_addr: EndpointAddress) -> bool {
        self.io.epidx(ep_addr).borrow().stall
    }

    fn set_stalled(&self, ep_addr: EndpointAddress, stalled: bool) {
        self.io.epidx(ep_addr).borrow_mut().stall = stalled;
    }
}

#[derive(Debug, PartialEq, Eq)]
pub enum EPErr {
    Stalled,
}

/// Host side of a running device.
pub struct Usb<'u, 'a, 's> {
    io: &'u TestBusIO,
    dev: &'u mut UsbDevice<'a, TestBus>,
    pub cls: &'u mut StlinkClass<'a, 's, TestBus, TestBoard>,
}

impl Usb<'_, '_, '_> {
    fn poll(&mut self) -> bool {
        self.dev.poll(&mut [&mut *self.cls])
    }

    /// One bulk OUT packet.
    pub fn out(&mut self, packet: &[u8]) {
        assert!(packet.len() <= MAX_PACKET_SIZE as usize);
        let ep = EndpointAddress::from_parts(RX_ENDPOINT as usize, UsbDirection::Out);
        self.io.set_read(ep, packet, false);
        self.poll();
    }

    /// A bulk OUT transfer, split in max-size packets.
    pub fn send(&mut self, data: &[u8]) {
        for packet in data.chunks(MAX_PACKET_SIZE as usize) {
            self.out(packet);
        }
    }

    /// Everything written to the bulk IN endpoint since the last call.
    pub fn take_reply(&mut self) -> Vec<u8> {
        let ep = EndpointAddress::from_parts(TX_ENDPOINT as usize, UsbDirection::In);
        let mut buf = [0u8; 1024];
        let len = self.io.get_write(ep, &mut buf);
        self.poll();
        buf[..len].to_vec()
    }

    /// Send a frame and collect the reply.
    pub fn query(&mut self, frame: &[u8]) -> Vec<u8> {
        self.out(frame);
        self.take_reply()
    }

    pub fn bus_reset(&mut self) {
        self.io.reset.set(true);
        self.poll();
    }

    /// The next bulk OUT read fails.
    pub fn fail_read(&mut self) {
        let ep = EndpointAddress::from_parts(RX_ENDPOINT as usize, UsbDirection::Out);
        self.io.epidx(ep).borrow_mut().read_fail = true;
        self.poll();
    }

    /// Control IN transfer on EP0.
    pub fn control_in(&mut self, setup: &[u8; 8], out: &mut [u8]) -> core::result::Result<usize, EPErr> {
        let out0 = EndpointAddress::from_parts(0, UsbDirection::Out);
        let in0 = EndpointAddress::from_parts(0, UsbDirection::In);

        self.io.set_read(out0, setup, true);
        self.poll();
        if self.io.stalled0() {
            return Err(EPErr::Stalled);
        }

        let mut len = 0;
        loop {
            let one = self.io.get_write(in0, &mut out[len..]);
            self.poll();
            if self.io.stalled0() {
                return Err(EPErr::Stalled);
            }

            len += one;
            if one < EP0_SIZE as usize {
                // short read - last block
                break;
            }
        }

        Ok(len)
    }
}

pub fn with_usb<'s>(session: &'s Session, board: TestBoard, case: impl FnOnce(&mut Usb<'_, '_, 's>)) {
    let serial = serial_number(&board.uid);

    let io = Rc::new(TestBusIO::new());
    let alloc = UsbBusAllocator::new(TestBus { io: io.clone() });

    let mut cls = StlinkClass::new(&alloc, session, board).expect("class");

    let mut dev = UsbDeviceBuilder::new(&alloc, UsbVidPid(0x0483, 0x3748))
        .strings(&[StringDescriptors::new(LangID::EN_US)
            .manufacturer("STMicroelectronics")
            .product("STM32 STLink")
            .serial_number(&serial)])
        .expect("strings")
        .max_packet_size_0(EP0_SIZE)
        .expect("ep0 size")
        .build();

    dev.poll(&mut [&mut cls]);

    let mut usb = Usb {
        io: &io,
        dev: &mut dev,
        cls: &mut cls,
    };

    case(&mut usb);
}
