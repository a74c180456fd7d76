//! Cold start: jump to the application or stay in the programmer.

use log::info;

/// Value written to the boot marker by the exit command.
pub const EXIT_MARKER: u16 = 0xfeed;

/// Magic word stored in the last 4 bytes of flash by a complete image.
pub const IMAGE_MAGIC: u32 = 0xa500_27d3;

/// A durable register that survives a system reset.
pub trait BootMarker {
    /// Read the marker.
    fn read(&self) -> u16;

    /// Write the marker.
    fn write(&mut self, value: u16);
}

/// What to do after reset.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum BootDecision {
    /// Start the previously flashed application.
    Application,
    /// Stay in the programmer.
    Programmer,
}

/// Offset of the image magic word in flash, for a flash of `flash_kib` KiB.
pub fn image_magic_offset(flash_kib: u16) -> u32 {
    ((flash_kib as u32) << 10).wrapping_sub(4)
}

/// Decide where to boot.
///
/// The programmer is entered when the image is incomplete, or when a
/// software reset happened without the exit marker (an application asking
/// for the programmer). An exit marker is consumed.
pub fn decide<M: BootMarker>(image_magic: u32, software_reset: bool, marker: &mut M) -> BootDecision {
    if image_magic != IMAGE_MAGIC {
        info!("no valid image (magic 0x{:08x})", image_magic);
        return BootDecision::Programmer;
    }

    let exit_requested = marker.read() == EXIT_MARKER;

    if software_reset && !exit_requested {
        info!("software reset, staying in programmer");
        return BootDecision::Programmer;
    }

    if exit_requested {
        marker.write(0);
    }

    BootDecision::Application
}
