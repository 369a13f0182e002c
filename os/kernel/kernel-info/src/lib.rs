//! # Kernel Memory Configuration and Boot Memory Map
//!
//! This crate is the single source of the constants that shape the virtual
//! memory subsystem, plus the physical memory map handed over at boot.
//!
//! ## Overview
//!
//! ### Memory Layout ([`memory`])
//! * **Address space split**: user half (top-level entries `0..256`) and the
//!   shared kernel half
//! * **Kernel allocator region**: base, size and node capacity of kvmem
//! * **Frame-mount windows**: the reserved page-table slots used to reach
//!   arbitrary physical frames
//! * **Buddy geometry**: zone boundaries, minimum block and maximum order
//!
//! ### Boot Memory Map ([`boot`])
//! * **Regions**: usable RAM, firmware-reserved ranges, the kernel image and
//!   boot modules
//! * **Totals**: the highest usable physical address, used to size the buddy
//!   bitmaps and the frame registry
//!
//! ## Virtual Memory Architecture
//!
//! ```text
//! 0x0000_0000_0000_0000 ┌─────────────────────────────────┐
//!                       │ Page zero (never mapped)        │
//! USER_BASE             ├─────────────────────────────────┤
//!                       │ User entries (heap grows up,    │
//!                       │ mmap placed below USER_MMAP_TOP)│
//! USER_END              ├─────────────────────────────────┤ 0x0000_8000_0000_0000
//!                       │ Non-canonical hole              │
//! KERNEL_HALF_BASE      ├─────────────────────────────────┤ 0xffff_8000_0000_0000
//!                       │ ...                             │
//! KVMEM_BASE            ├─────────────────────────────────┤ 0xffff_9000_0000_0000
//!                       │ Kernel allocator (kvmem)        │
//! MOUNT_WINDOW_BASE     ├─────────────────────────────────┤ 0xffff_ffff_7fe0_0000
//!                       │ Frame-mount windows             │
//! KERNEL_BASE           ├─────────────────────────────────┤ 0xffff_ffff_8000_0000
//!                       │ Kernel text & data              │
//! 0xFFFF_FFFF_FFFF_FFFF └─────────────────────────────────┘
//! ```
//!
//! All constants are validated at compile time; misconfigurations fail the
//! build rather than the boot.

#![cfg_attr(not(any(test, doctest)), no_std)]

pub mod boot;
pub mod memory;
