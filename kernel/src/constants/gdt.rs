//! Segment selectors installed by the GDT wiring.
//!
//! The descriptor table itself is set up outside the core; these indices
//! must match its layout: null, kernel code, kernel data, user code, user
//! data.

pub const KERNEL_CODE_INDEX: u16 = 1;
pub const KERNEL_DATA_INDEX: u16 = 2;
pub const USER_CODE_INDEX: u16 = 3;
pub const USER_DATA_INDEX: u16 = 4;

use x86_64::{structures::gdt::SegmentSelector, PrivilegeLevel};

pub const KERNEL_CODE_SELECTOR: u16 = SegmentSelector::new(KERNEL_CODE_INDEX, PrivilegeLevel::Ring0).0;
pub const KERNEL_DATA_SELECTOR: u16 = SegmentSelector::new(KERNEL_DATA_INDEX, PrivilegeLevel::Ring0).0;
pub const USER_CODE_SELECTOR: u16 = SegmentSelector::new(USER_CODE_INDEX, PrivilegeLevel::Ring3).0;
pub const USER_DATA_SELECTOR: u16 = SegmentSelector::new(USER_DATA_INDEX, PrivilegeLevel::Ring3).0;
