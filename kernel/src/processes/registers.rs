use core::mem::{offset_of, size_of};

use crate::constants::gdt::KERNEL_DATA_SELECTOR;

/// Register file saved in a PCB while the process is not running.
#[derive(Clone, Copy, Default, PartialEq, Eq)]
pub struct Context {
    pub eax: u32,
    pub ebx: u32,
    pub ecx: u32,
    pub edx: u32,
    pub esi: u32,
    pub edi: u32,
    pub ebp: u32,
    pub esp: u32,
    pub eip: u32,
    pub eflags: u32,
    pub cs: u16,
    pub ss: u16,
    pub ds: u16,
    pub es: u16,
    pub fs: u16,
    pub gs: u16,
    /// Physical address of the page directory.
    pub cr3: u32,
}

/// What the trap stubs leave on the kernel stack, lowest address first:
/// data segments, `pushad`, then the CPU's interrupt frame. `user_esp` and
/// `user_ss` are only pushed on a privilege change.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
#[repr(C)]
pub struct TrapFrame {
    pub gs: u32,
    pub fs: u32,
    pub es: u32,
    pub ds: u32,
    pub edi: u32,
    pub esi: u32,
    pub ebp: u32,
    /// esp at the time of `pushad`; ignored by `popad`.
    pub kernel_esp: u32,
    pub ebx: u32,
    pub edx: u32,
    pub ecx: u32,
    pub eax: u32,
    pub eip: u32,
    pub cs: u32,
    pub eflags: u32,
    pub user_esp: u32,
    pub user_ss: u32,
}

impl TrapFrame {
    /// Frame size when the trap came from ring 3.
    pub const FULL_LEN: usize = size_of::<TrapFrame>();
    /// Frame size when the trap came from ring 0.
    pub const SHORT_LEN: usize = offset_of!(TrapFrame, user_esp);

    pub fn from_user(&self) -> bool {
        self.cs & 3 == 3
    }
}

impl Context {
    /// Rebuilds the interrupted context from a trap frame located at
    /// `frame_addr`.
    ///
    /// A ring 0 trap does not push esp/ss, so the interrupted stack pointer
    /// is the address just past the short frame.
    pub fn capture(frame: &TrapFrame, frame_addr: u32, cr3: u32) -> Self {
        let (esp, ss) = if frame.from_user() {
            (frame.user_esp, frame.user_ss as u16)
        } else {
            (frame_addr + TrapFrame::SHORT_LEN as u32, KERNEL_DATA_SELECTOR)
        };

        Context {
            eax: frame.eax,
            ebx: frame.ebx,
            ecx: frame.ecx,
            edx: frame.edx,
            esi: frame.esi,
            edi: frame.edi,
            ebp: frame.ebp,
            esp,
            eip: frame.eip,
            eflags: frame.eflags,
            cs: frame.cs as u16,
            ss,
            ds: frame.ds as u16,
            es: frame.es as u16,
            fs: frame.fs as u16,
            gs: frame.gs as u16,
            cr3,
        }
    }

    /// The frame `iret` needs to resume this context.
    pub fn to_frame(&self) -> TrapFrame {
        TrapFrame {
            gs: u32::from(self.gs),
            fs: u32::from(self.fs),
            es: u32::from(self.es),
            ds: u32::from(self.ds),
            edi: self.edi,
            esi: self.esi,
            ebp: self.ebp,
            kernel_esp: 0,
            ebx: self.ebx,
            edx: self.edx,
            ecx: self.ecx,
            eax: self.eax,
            eip: self.eip,
            cs: u32::from(self.cs),
            eflags: self.eflags,
            user_esp: self.esp,
            user_ss: u32::from(self.ss),
        }
    }

    pub fn is_user(&self) -> bool {
        self.cs & 3 == 3
    }

    /// Bytes of `to_frame` that `iret` consumes for this context.
    pub fn frame_len(&self) -> usize {
        if self.is_user() {
            TrapFrame::FULL_LEN
        } else {
            TrapFrame::SHORT_LEN
        }
    }
}

impl core::fmt::Debug for Context {
    fn fmt(&self, f: &mut core::fmt::Formatter) -> core::fmt::Result {
        let mut ds = f.debug_struct("Context");

        ds.field("eax", &format_args!("{:#010x}", self.eax))
            .field("ebx", &format_args!("{:#010x}", self.ebx))
            .field("ecx", &format_args!("{:#010x}", self.ecx))
            .field("edx", &format_args!("{:#010x}", self.edx))
            .field("esi", &format_args!("{:#010x}", self.esi))
            .field("edi", &format_args!("{:#010x}", self.edi))
            .field("ebp", &format_args!("{:#010x}", self.ebp))
            .field("esp", &format_args!("{:#010x}", self.esp))
            .field("eip", &format_args!("{:#010x}", self.eip))
            .field("eflags", &format_args!("{:#010x}", self.eflags))
            .field("cs", &format_args!("{:#06x}", self.cs))
            .field("ss", &format_args!("{:#06x}", self.ss))
            .field("ds", &format_args!("{:#06x}", self.ds))
            .field("cr3", &format_args!("{:#010x}", self.cr3));

        ds.finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constants::gdt::{KERNEL_CODE_SELECTOR, USER_CODE_SELECTOR, USER_DATA_SELECTOR};

    fn user_context() -> Context {
        Context {
            eax: 1,
            ebx: 2,
            ecx: 3,
            edx: 4,
            esi: 5,
            edi: 6,
            ebp: 0xBFFF_FF00,
            esp: 0xBFFF_FEF0,
            eip: 0x4000_1234,
            eflags: 0x246,
            cs: USER_CODE_SELECTOR,
            ss: USER_DATA_SELECTOR,
            ds: USER_DATA_SELECTOR,
            es: USER_DATA_SELECTOR,
            fs: USER_DATA_SELECTOR,
            gs: USER_DATA_SELECTOR,
            cr3: 0x0020_0000,
        }
    }

    #[test]
    fn test_frame_layout() {
        assert_eq!(TrapFrame::FULL_LEN, 17 * 4);
        assert_eq!(TrapFrame::SHORT_LEN, 15 * 4);
        assert_eq!(offset_of!(TrapFrame, edi), 16);
        assert_eq!(offset_of!(TrapFrame, eip), 48);
    }

    #[test]
    fn test_user_context_round_trips() {
        let context = user_context();
        let frame = context.to_frame();
        assert!(frame.from_user());
        assert_eq!(context.frame_len(), TrapFrame::FULL_LEN);
        assert_eq!(Context::capture(&frame, 0xdead_0000, context.cr3), context);
    }

    #[test]
    fn test_kernel_context_round_trips_through_its_stack() {
        let context = Context {
            esp: 0x0050_2000,
            cs: KERNEL_CODE_SELECTOR,
            ss: KERNEL_DATA_SELECTOR,
            ds: KERNEL_DATA_SELECTOR,
            es: KERNEL_DATA_SELECTOR,
            fs: KERNEL_DATA_SELECTOR,
            gs: KERNEL_DATA_SELECTOR,
            eflags: 0x202,
            eip: 0x0010_4000,
            ..user_context()
        };
        assert!(!context.is_user());

        // the resume path places the short frame right below esp
        let frame_addr = context.esp - context.frame_len() as u32;
        let frame = context.to_frame();
        assert_eq!(Context::capture(&frame, frame_addr, context.cr3), context);
    }
}
