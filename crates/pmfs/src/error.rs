//! Engine error types

/// Engine result type
pub type Result<T> = core::result::Result<T, PmfsError>;

/// Engine error types
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PmfsError {
    /// Allocator exhausted, or the height-3 limit was reached while
    /// growing a file tree
    NoSpace,
    /// Invariant violation detected during a walk (orphan tree pointer,
    /// log-entry extent mismatch, broken log chain)
    Corrupt,
    /// Inode slot fails the active predicate
    BadInode,
    /// Basic inode not present
    AccessDenied,
    /// Journal transaction unavailable; retryable
    Transient,
    /// Caller error (range overflow, empty name, duplicate entry)
    InvalidArgument,
    /// Entry not found
    NotFound,
    /// Out of DRAM
    NoMemory,
}

impl PmfsError {
    /// Convert to an errno-style error code
    pub fn errno(self) -> i32 {
        match self {
            PmfsError::NoSpace => 28,         // ENOSPC
            PmfsError::Corrupt => 5,          // EIO
            PmfsError::BadInode => 116,       // ESTALE
            PmfsError::AccessDenied => 13,    // EACCES
            PmfsError::Transient => 11,       // EAGAIN
            PmfsError::InvalidArgument => 22, // EINVAL
            PmfsError::NotFound => 2,         // ENOENT
            PmfsError::NoMemory => 12,        // ENOMEM
        }
    }
}

impl core::fmt::Display for PmfsError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let s = match self {
            PmfsError::NoSpace => "no space",
            PmfsError::Corrupt => "corrupt structure",
            PmfsError::BadInode => "stale inode",
            PmfsError::AccessDenied => "inode not present",
            PmfsError::Transient => "transaction unavailable",
            PmfsError::InvalidArgument => "invalid argument",
            PmfsError::NotFound => "not found",
            PmfsError::NoMemory => "out of memory",
        };
        f.write_str(s)
    }
}
