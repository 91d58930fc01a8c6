#![cfg_attr(not(test), no_std)]
#![cfg_attr(feature = "strict", deny(warnings))]
extern crate alloc;

pub mod constants;
pub mod devices;
pub mod events;
pub mod init;
pub mod interrupts;
pub mod logging;
pub mod memory;
pub mod processes;
pub mod syscalls;

pub use devices::serial;

/// Parks the CPU between interrupts.
pub fn idle_loop() -> ! {
    loop {
        interrupts::halt();
    }
}

#[cfg(all(target_os = "none", not(test)))]
#[panic_handler]
fn rust_panic(info: &core::panic::PanicInfo) -> ! {
    interrupts::disable();
    serial_println!("Kernel panic: {}", info);
    loop {
        interrupts::halt();
    }
}
