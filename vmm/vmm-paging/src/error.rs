/// Failure kinds of the paging engine.
///
/// `NotMapped` is an expected outcome of lookups; the other variants reject
/// a request before (or without) touching any leaf.
#[derive(Debug, Copy, Clone, PartialEq, Eq, thiserror::Error)]
pub enum Error {
    /// Null, misaligned, non-canonical or zero-length input.
    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),
    /// The page pool ran dry while building intermediate tables.
    #[error("out of memory (page pool exhausted)")]
    AllocationFailure,
    /// The target slot already holds a mapping or a table.
    #[error("address already mapped")]
    AlreadyMapped,
    /// No mapping exists for the address.
    #[error("address not mapped")]
    NotMapped,
    /// Physical address misaligned or beyond the addressable range.
    #[error("invalid physical address")]
    InvalidPhysicalAddress,
}

pub type Result<T> = core::result::Result<T, Error>;
