//! System call entry.

pub mod syscall_handlers;

pub use syscall_handlers::{dispatch, SyscallRequest};
