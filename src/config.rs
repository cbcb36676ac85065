/// Placement and limits of a settings partition.
///
/// The partition is split into two equally sized swap areas. Both halves have to be aligned to the
/// erase size of the flash.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Config {
    pub partition_offset: usize,
    pub partition_size: usize,
    /// The erase counter stops counting once it reaches this value.
    pub max_erase_counter: u32,
}

/// `u32::MAX` is what an erased word reads as, so it is never used as a counter value.
pub const DEFAULT_MAX_ERASE_COUNTER: u32 = u32::MAX - 1;

impl Config {
    pub const fn new(partition_offset: usize, partition_size: usize) -> Self {
        Self {
            partition_offset,
            partition_size,
            max_erase_counter: DEFAULT_MAX_ERASE_COUNTER,
        }
    }

    pub const fn with_max_erase_counter(mut self, max_erase_counter: u32) -> Self {
        if max_erase_counter < DEFAULT_MAX_ERASE_COUNTER {
            self.max_erase_counter = max_erase_counter;
        } else {
            self.max_erase_counter = DEFAULT_MAX_ERASE_COUNTER;
        }
        self
    }

    pub(crate) const fn swap_size(&self) -> usize {
        self.partition_size / 2
    }
}
