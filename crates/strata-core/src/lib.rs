//! # strata-core
//!
//! Target acquisition and debug-info bootstrap for Strata.
//!
//! A [`Program`] can be attached to:
//! - an ELF core dump of a userspace process
//! - a Linux kernel vmcore, ELF or kdump-compressed (through a pluggable decoder)
//! - the running kernel, through `/proc/kcore`
//! - a running process, through `/proc/<pid>/mem`
//!
//! Attaching builds an address space of file-backed or callback-backed
//! segments. Debug info is then loaded from the ELF files the target mapped
//! (or from `vmlinux` for kernels) and answers symbol, object and type lookups.
//!
//! ## Example
//!
//! ```no_run
//! use strata_core::Program;
//!
//! # fn main() -> strata_core::Result<()> {
//! let program = Program::from_core_dump("/var/crash/core.1234")?;
//! let mut word = [0u8; 8];
//! program.read_memory(&mut word, 0x7fff_0000_0000, false)?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Unsafe code
//!
//! Telling `/proc/kcore` apart from a copy of it takes an `fstatfs` call on the
//! open descriptor. That one call is the only `unsafe` in the crate.

#![allow(unsafe_code)] // fstatfs on an open descriptor

pub mod config;
pub mod debuginfo;
pub mod error;
pub mod finder;
pub mod memory;
pub mod object;
pub mod platform;
pub mod prelude;
pub mod program;
pub mod target;
pub mod types;
pub mod vmcoreinfo;

pub use config::ProgramConfig;
pub use error::{ErrorKind, Result, StrataError};
pub use memory::{AddressSpace, MemoryRead, MemoryReader};
pub use platform::{Architecture, Platform, PlatformFlags};
pub use program::{Program, ProgramFlags};
pub use target::TargetSource;
pub use vmcoreinfo::VmcoreInfo;
