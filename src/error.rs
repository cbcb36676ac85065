use thiserror::Error;

/// Errors returned by the settings store. `NotFound` and `NoBufs` are the expected outcomes a caller
/// handles during normal operation, the remaining variants are static configuration problems or
/// failures reported by the flash driver.
#[derive(Error, Debug, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[non_exhaustive]
pub enum Error {
    /// The partition offset has to be aligned to the erase size of the flash
    #[error("invalid partition offset")]
    InvalidPartitionOffset,

    /// The partition has to hold two swap areas, each a multiple of the erase size
    #[error("invalid partition size")]
    InvalidPartitionSize,

    /// The flash write granularity has to divide the record word size (8 bytes)
    #[error("unsupported flash write size")]
    UnsupportedWriteSize,

    /// The internal error value is returned from the provided flash driver
    #[error("internal flash error")]
    FlashError,

    /// No visible record exists for the requested key and index.
    #[error("not found")]
    NotFound,

    /// The active swap area is full even after compaction.
    #[error("no space left")]
    NoBufs,

    /// The value can never be stored, not even in an empty swap area.
    #[error("value too long")]
    ValueTooLong,

    /// A change is already being staged.
    #[error("change already in progress")]
    Already,

    /// There is no staged change to commit or abandon.
    #[error("no change in progress")]
    InvalidState,
}
