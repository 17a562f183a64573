//! # Error Types
//!
//! Error handling for target acquisition and lookups.
//!
//! We use `thiserror` to generate the `Error` implementations and messages.
//! Callers that only care about the category of a failure (most commonly the
//! soft "some debug info missing" outcome) test [`StrataError::kind`] instead
//! of matching payloads.

use std::io;
use std::path::{Path, PathBuf};

use thiserror::Error;

/// Main error type for Strata operations
///
/// ## Error Categories
///
/// 1. **Argument errors**: InvalidArgument (bad platform, target already set, wrong program)
/// 2. **OS errors**: Os (open/read/stat failures with the path involved)
/// 3. **Format errors**: Format (wrong ELF type, malformed notes, bad VMCOREINFO)
/// 4. **Lookup errors**: Lookup, SymbolNotFound
/// 5. **Memory errors**: Fault (no mapping or short read)
/// 6. **Soft errors**: MissingDebugInfo (the convenience bootstraps discard it)
/// 7. **Resource errors**: OutOfMemory
#[derive(Error, Debug)]
pub enum StrataError
{
    /// Invalid argument passed to a Strata function
    ///
    /// Examples:
    /// - Unknown architecture or unrecognized platform flag bits
    /// - Setting a target on a program that already has one
    /// - Passing an object that belongs to another program
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// An operating system call failed
    ///
    /// Carries the operation that failed and, when one was involved, the path.
    #[error("{op}{}: {source}", path.as_ref().map(|p| format!(" {}", p.display())).unwrap_or_default())]
    Os
    {
        /// Operation that failed (`open`, `read`, `fstatfs`, ...)
        op: &'static str,
        /// Path the operation was applied to
        path: Option<PathBuf>,
        /// Underlying error
        #[source]
        source: io::Error,
    },

    /// Input is not in the expected format
    #[error("{0}")]
    Format(String),

    /// A type, object or member could not be found
    #[error("{0}")]
    Lookup(String),

    /// No symbol contains the queried address
    #[error("could not find symbol containing 0x{address:x}")]
    SymbolNotFound
    {
        /// Queried address
        address: u64,
    },

    /// An operation was applied to a type of the wrong kind
    #[error("{0}")]
    Type(String),

    /// Memory at an address could not be read
    #[error("{message}: 0x{address:x}")]
    Fault
    {
        /// First address that could not be read
        address: u64,
        /// What went wrong
        message: String,
    },

    /// Some debugging information could not be found
    ///
    /// This is a soft failure: everything that could be loaded was loaded.
    #[error("{0}")]
    MissingDebugInfo(String),

    /// A fallible allocation failed
    #[error("out of memory")]
    OutOfMemory,
}

/// Category of a [`StrataError`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind
{
    /// Invalid argument
    InvalidArgument,
    /// Operating system error
    Os,
    /// Format error
    Format,
    /// Lookup error
    Lookup,
    /// Type error
    Type,
    /// Bad memory access
    Fault,
    /// Some debug info missing
    MissingDebugInfo,
    /// Allocation failure
    OutOfMemory,
}

impl StrataError
{
    /// Wraps an I/O error from `op` on `path`.
    pub fn os(op: &'static str, path: impl AsRef<Path>, source: io::Error) -> Self
    {
        StrataError::Os {
            op,
            path: Some(path.as_ref().to_path_buf()),
            source,
        }
    }

    /// Builds a fault error at `address`.
    pub fn fault(address: u64, message: impl Into<String>) -> Self
    {
        StrataError::Fault {
            address,
            message: message.into(),
        }
    }

    /// Category of this error.
    pub fn kind(&self) -> ErrorKind
    {
        match self {
            StrataError::InvalidArgument(_) => ErrorKind::InvalidArgument,
            StrataError::Os { .. } => ErrorKind::Os,
            StrataError::Format(_) => ErrorKind::Format,
            StrataError::Lookup(_) | StrataError::SymbolNotFound { .. } => ErrorKind::Lookup,
            StrataError::Type(_) => ErrorKind::Type,
            StrataError::Fault { .. } => ErrorKind::Fault,
            StrataError::MissingDebugInfo(_) => ErrorKind::MissingDebugInfo,
            StrataError::OutOfMemory => ErrorKind::OutOfMemory,
        }
    }

    /// `errno` of an OS error, if there is one.
    pub fn errno(&self) -> Option<i32>
    {
        match self {
            StrataError::Os { source, .. } => source.raw_os_error(),
            _ => None,
        }
    }

    /// Path of an OS error, if there is one.
    pub fn path(&self) -> Option<&Path>
    {
        match self {
            StrataError::Os { path, .. } => path.as_deref(),
            _ => None,
        }
    }
}

impl From<io::Error> for StrataError
{
    fn from(source: io::Error) -> Self
    {
        StrataError::Os {
            op: "io",
            path: None,
            source,
        }
    }
}

impl From<std::collections::TryReserveError> for StrataError
{
    fn from(_: std::collections::TryReserveError) -> Self
    {
        StrataError::OutOfMemory
    }
}

impl From<object::read::Error> for StrataError
{
    fn from(err: object::read::Error) -> Self
    {
        StrataError::Format(err.to_string())
    }
}

impl From<gimli::Error> for StrataError
{
    fn from(err: gimli::Error) -> Self
    {
        StrataError::Format(format!("DWARF: {err}"))
    }
}

/// Convenience type alias for `Result<T, StrataError>`
///
/// ```rust
/// use strata_core::error::Result;
/// fn foo() -> Result<()>
/// {
///     Ok(())
/// }
/// ```
pub type Result<T> = std::result::Result<T, StrataError>;

#[cfg(test)]
mod tests
{
    use super::*;

    #[test]
    fn test_os_error_keeps_errno_and_path()
    {
        let err = StrataError::os("open", "/nonexistent", io::Error::from_raw_os_error(libc::ENOENT));
        assert_eq!(err.kind(), ErrorKind::Os);
        assert_eq!(err.errno(), Some(libc::ENOENT));
        assert_eq!(err.path(), Some(Path::new("/nonexistent")));
        assert!(err.to_string().starts_with("open /nonexistent: "));
    }

    #[test]
    fn test_symbol_not_found_is_lookup()
    {
        let err = StrataError::SymbolNotFound { address: 0xffff_8000 };
        assert_eq!(err.kind(), ErrorKind::Lookup);
        assert_eq!(err.to_string(), "could not find symbol containing 0xffff8000");
    }

    #[test]
    fn test_try_reserve_maps_to_out_of_memory()
    {
        let mut buf: Vec<u8> = Vec::new();
        let err: StrataError = buf.try_reserve(usize::MAX).unwrap_err().into();
        assert!(matches!(err, StrataError::OutOfMemory));
    }
}
