//! Interrupt masking and the trap entry points the core exposes.
//!
//! On a single CPU, masking external interrupts is the only mutual exclusion
//! the kernel needs: every section that mutates the frame bitmap, a page
//! table, the heap block list or the process table runs inside
//! [`without_interrupts`].
//!
//! Off bare metal the flag is emulated so the same code paths run under
//! `cargo test`.

pub mod traps;

#[cfg(all(target_arch = "x86", target_os = "none"))]
mod cpu {
    use core::arch::asm;

    const EFLAGS_IF: u32 = 1 << 9;

    #[inline]
    pub fn enable() {
        unsafe { asm!("sti", options(nomem, nostack)) };
    }

    #[inline]
    pub fn disable() {
        unsafe { asm!("cli", options(nomem, nostack)) };
    }

    #[inline]
    pub fn are_enabled() -> bool {
        let eflags: u32;
        unsafe { asm!("pushfd", "pop {}", out(reg) eflags, options(nomem, preserves_flags)) };
        eflags & EFLAGS_IF != 0
    }

    #[inline]
    pub fn halt() {
        unsafe { asm!("hlt", options(nomem, nostack)) };
    }
}

#[cfg(all(not(all(target_arch = "x86", target_os = "none")), test))]
mod cpu {
    extern crate std;

    use core::cell::Cell;

    // Per test thread, so parallel tests never observe each other's mask.
    std::thread_local! {
        static ENABLED: Cell<bool> = const { Cell::new(true) };
    }

    pub fn enable() {
        ENABLED.with(|flag| flag.set(true));
    }

    pub fn disable() {
        ENABLED.with(|flag| flag.set(false));
    }

    pub fn are_enabled() -> bool {
        ENABLED.with(|flag| flag.get())
    }

    pub fn halt() {
        core::hint::spin_loop();
    }
}

#[cfg(all(not(all(target_arch = "x86", target_os = "none")), not(test)))]
mod cpu {
    use core::sync::atomic::{AtomicBool, Ordering};

    static ENABLED: AtomicBool = AtomicBool::new(true);

    pub fn enable() {
        ENABLED.store(true, Ordering::SeqCst);
    }

    pub fn disable() {
        ENABLED.store(false, Ordering::SeqCst);
    }

    pub fn are_enabled() -> bool {
        ENABLED.load(Ordering::SeqCst)
    }

    pub fn halt() {
        core::hint::spin_loop();
    }
}

/// Enables interrupts on the current CPU.
pub fn enable() {
    cpu::enable();
}

/// Disables interrupts on the current CPU.
pub fn disable() {
    cpu::disable();
}

/// Checks if interrupts are enabled on the current CPU.
pub fn are_enabled() -> bool {
    cpu::are_enabled()
}

/// Executes a closure with interrupts disabled, restoring the previous
/// interrupt state afterwards.
///
/// # Arguments
/// * `f` - The closure to execute
///
/// # Returns
/// Returns the result of the closure
pub fn without_interrupts<F, R>(f: F) -> R
where
    F: FnOnce() -> R,
{
    let initially_enabled = are_enabled();
    if initially_enabled {
        disable();
    }

    let result = f();

    if initially_enabled {
        enable();
    }

    result
}

/// Waits for the next interrupt.
pub fn halt() {
    cpu::halt();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_without_interrupts_masks_and_restores() {
        assert!(are_enabled());
        let inside = without_interrupts(are_enabled);
        assert!(!inside);
        assert!(are_enabled());
    }

    #[test]
    fn test_nested_sections_keep_mask() {
        without_interrupts(|| {
            without_interrupts(|| assert!(!are_enabled()));
            // the inner section must not unmask the outer one
            assert!(!are_enabled());
        });
        assert!(are_enabled());
    }
}
