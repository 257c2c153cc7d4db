#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemoryError {
    /// Misaligned address, zero count, or address outside the managed range.
    InvalidArgument,
    /// No free frame run of the requested length, or the boot pool ran dry.
    OutOfMemory,
    /// The directory for a top-level slot does not exist.
    MissingDirectory,
    /// No translation exists for the given virtual address.
    NotMapped,
    /// A table frame did not meet its alignment requirement.
    TableMisaligned,
    /// The address gate could not be confirmed open.
    GateClosed,
}

impl core::fmt::Display for MemoryError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            MemoryError::InvalidArgument => write!(f, "Invalid address or count"),
            MemoryError::OutOfMemory => write!(f, "Out of physical memory"),
            MemoryError::MissingDirectory => write!(f, "Page directory absent"),
            MemoryError::NotMapped => write!(f, "Address not mapped"),
            MemoryError::TableMisaligned => write!(f, "Table frame misaligned"),
            MemoryError::GateClosed => write!(f, "Address gate closed"),
        }
    }
}
