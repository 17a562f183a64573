//! Common module for library exports

pub use crate::config::ProgramConfig;
pub use crate::error::{ErrorKind, Result, StrataError};
pub use crate::memory::{AddressSpace, MemoryRead, MemoryReader};
pub use crate::object::{FindObjectFlags, Object, ObjectKind, Symbol};
pub use crate::platform::{Architecture, Platform, PlatformFlags};
pub use crate::program::{Program, ProgramFlags};
pub use crate::target::TargetSource;
pub use crate::types::{ElementInfo, MemberInfo, Type, TypeKind};
pub use crate::vmcoreinfo::VmcoreInfo;
