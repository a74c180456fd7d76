use log::warn;

/// Errors reported by the flash controller.
#[repr(u8)]
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum FlashError {
    /// Page erase failed.
    Erase = 0x04,
    /// Word program operation failed.
    Prog = 0x06,
    /// Programmed word failed read-back verification.
    Verify = 0x07,
}

/// Trait that describes access to the target's on-chip flash controller.
///
/// Implementations do the register-level work. The order in which these
/// functions are called (clock, unlock, erase/program, lock) is decided by
/// the [`Worker`](crate::worker::Worker).
///
/// All functions are blocking and busy-wait on the controller. They are
/// never interrupted or resumed partway.
pub trait FlashMemIO {
    /// Flash target address used until the host sets one.
    ///
    /// Usually, it's the start of the application region.
    const APPLICATION_BASE: u32 = 0x0800_4000;

    /// Enable the oscillator flash programming depends on.
    fn enable_clock(&mut self);

    /// Unlock the flash controller for erase and program operations.
    fn unlock(&mut self);

    /// Disable erase/program functions and lock the controller.
    fn lock(&mut self);

    /// Erase the page at `address`.
    fn erase_page(&mut self, address: u32) -> Result<(), FlashError>;

    /// Program one 32-bit word at `address` and verify it by reading it back.
    ///
    /// Must return [`FlashError::Verify`] if the read-back does not match.
    fn program_word(&mut self, address: u32, word: u32) -> Result<(), FlashError>;
}

/// Erase the page at `address`: clock, unlock, erase, lock.
pub fn erase<F: FlashMemIO>(flash: &mut F, address: u32) -> Result<(), FlashError> {
    flash.enable_clock();
    flash.unlock();
    let res = flash.erase_page(address);
    flash.lock();
    res
}

/// Program `data` as little-endian words starting at `address`.
///
/// Every word is attempted, the controller is locked afterwards whatever
/// the outcome. A trailing partial word is padded with `0xff`.
///
/// Returns the number of words that failed.
pub fn program<F: FlashMemIO>(flash: &mut F, address: u32, data: &[u8]) -> u32 {
    let mut failed = 0;

    flash.unlock();

    let mut offset = 0u32;
    for chunk in data.chunks(4) {
        let mut bytes = [0xffu8; 4];
        bytes[..chunk.len()].copy_from_slice(chunk);
        let word = u32::from_le_bytes(bytes);
        let addr = address.wrapping_add(offset);

        if let Err(e) = flash.program_word(addr, word) {
            warn!("program 0x{:08x} = 0x{:08x} failed: {:?}", addr, word, e);
            failed += 1;
        }
        offset += 4;
    }

    flash.lock();

    failed
}
