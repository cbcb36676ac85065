#![doc = include_str!("../README.md")]
#![cfg_attr(not(target_arch = "x86_64"), no_std)]

mod change;
pub mod config;
pub mod error;
mod internal;
pub mod platform;
mod raw;
mod swap;

pub use config::Config;
pub use raw::{Format, MAX_VALUE_SIZE};

extern crate alloc;

use crate::change::StagedChange;
use crate::error::Error;
use crate::internal::{ActiveArea, Occurrence};
use crate::platform::Platform;
use alloc::vec::Vec;

/// Usage of the active swap area.
#[derive(Debug, Clone, PartialEq)]
pub struct SettingsStatistics {
    /// 0 or 1
    pub active_area: u8,
    pub format: Format,
    pub erase_counter: u32,
    pub used_bytes: u32,
    pub free_bytes: u32,
    pub records: RecordStatistics,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct RecordStatistics {
    /// Records visible through `get`.
    pub valid: u32,
    pub deleted: u32,
    /// Valid records superseded by a later `set` of the same key. Reclaimed by the next swap.
    pub shadowed: u32,
}

/// A log-structured key-value store spread over two swap areas of a NOR flash partition.
///
/// Only one of the areas is live at a time. Records are appended to it; when it runs full, the
/// surviving records are compacted into the other area, which then becomes the live one.
pub struct Settings<T: Platform> {
    pub(crate) hal: T,
    pub(crate) base_address: usize,
    pub(crate) swap_size: u32,
    pub(crate) max_erase_counter: u32,
    pub(crate) faulted: bool,
    /// Writes collected since `begin_change`
    pub(crate) staged: Option<Vec<StagedChange>>,

    // set after calling self.load
    pub(crate) active: ActiveArea,
}

impl<T: Platform> Settings<T> {
    /// Opens the store with the default [`Config`], see [`Settings::with_config`].
    pub fn new(
        partition_offset: usize,
        partition_size: usize,
        hal: T,
    ) -> Result<Settings<T>, Error> {
        Self::with_config(Config::new(partition_offset, partition_size), hal)
    }

    /// Recovers the store from flash:
    /// 1. Find the active swap area, formatting the first one if there is none
    /// 2. Scan its records up to the first free, torn or corrupt one
    /// 3. Compact right away if the free space behind the log is dirty or the area still uses the
    ///    legacy format
    pub fn with_config(config: Config, hal: T) -> Result<Settings<T>, Error> {
        if !config.partition_offset.is_multiple_of(T::ERASE_SIZE) {
            return Err(Error::InvalidPartitionOffset);
        }

        let swap_size = config.swap_size();
        if swap_size == 0 || !swap_size.is_multiple_of(T::ERASE_SIZE) {
            return Err(Error::InvalidPartitionSize);
        }
        if config
            .partition_offset
            .checked_add(config.partition_size)
            .is_none_or(|end| end > u32::MAX as usize)
        {
            return Err(Error::InvalidPartitionSize);
        }

        if T::WRITE_SIZE == 0 || !(Format::CURRENT.word_size() as usize).is_multiple_of(T::WRITE_SIZE)
        {
            return Err(Error::UnsupportedWriteSize);
        }

        let mut settings = Self {
            hal,
            base_address: config.partition_offset,
            swap_size: swap_size as u32,
            max_erase_counter: config.max_erase_counter,
            faulted: false,
            staged: None,
            active: ActiveArea::unloaded(),
        };

        match settings.load() {
            Ok(()) => Ok(settings),
            Err(Error::FlashError) => {
                settings.faulted = true;
                Err(Error::FlashError)
            }
            Err(e) => Err(e),
        }
    }

    /// Copies the `index`-th visible value of `key` into `buf` and returns its full length.
    ///
    /// If `buf` is shorter than the value, only `buf.len()` bytes are copied. Compare the returned
    /// length against the buffer to detect truncation.
    pub fn get(&mut self, key: u16, index: usize, buf: &mut [u8]) -> Result<usize, Error> {
        let result = self.get_value(key, index, Some(buf));
        self.track_fault(result)
    }

    /// Length of the `index`-th visible value of `key` without reading it.
    pub fn get_len(&mut self, key: u16, index: usize) -> Result<usize, Error> {
        let result = self.get_value(key, index, None);
        self.track_fault(result)
    }

    pub fn get_vec(&mut self, key: u16, index: usize) -> Result<Vec<u8>, Error> {
        let mut buf = alloc::vec![0u8; MAX_VALUE_SIZE];
        let len = self.get(key, index, &mut buf)?;
        buf.truncate(len);
        Ok(buf)
    }

    /// Replaces all values of `key` by a single one.
    ///
    /// May compact the store first. Fails with [`Error::NoBufs`] if there is still no room.
    pub fn set(&mut self, key: u16, value: &[u8]) -> Result<(), Error> {
        if self.faulted {
            return Err(Error::FlashError);
        }

        if self.staged.is_some() {
            return self.stage(StagedChange::Set {
                key,
                value: value.to_vec(),
            });
        }

        let result = self.set_value(key, value);
        self.track_fault(result)
    }

    /// Appends another value to `key`, keeping the existing ones.
    ///
    /// May compact the store first. Fails with [`Error::NoBufs`] if there is still no room.
    pub fn add(&mut self, key: u16, value: &[u8]) -> Result<(), Error> {
        if self.faulted {
            return Err(Error::FlashError);
        }

        if self.staged.is_some() {
            return self.stage(StagedChange::Add {
                key,
                value: value.to_vec(),
            });
        }

        let result = self.add_value(key, value);
        self.track_fault(result)
    }

    /// Delete the `index`-th visible value of `key`
    pub fn delete(&mut self, key: u16, index: usize) -> Result<(), Error> {
        if self.faulted {
            return Err(Error::FlashError);
        }

        if self.staged.is_some() {
            let result = self.stage(StagedChange::Delete {
                key,
                occurrence: Occurrence::Nth(index),
            });
            return self.track_fault(result);
        }

        let result = self.delete_key(key, Occurrence::Nth(index));
        self.track_fault(result)
    }

    /// Delete every value of `key`
    pub fn delete_all(&mut self, key: u16) -> Result<(), Error> {
        if self.faulted {
            return Err(Error::FlashError);
        }

        if self.staged.is_some() {
            let result = self.stage(StagedChange::Delete {
                key,
                occurrence: Occurrence::All,
            });
            return self.track_fault(result);
        }

        let result = self.delete_key(key, Occurrence::All);
        self.track_fault(result)
    }

    /// Starts collecting `set`, `add`, `delete` and `delete_all` calls instead of writing them.
    /// Reads keep seeing the committed values until [`Settings::commit_change`].
    pub fn begin_change(&mut self) -> Result<(), Error> {
        if self.staged.is_some() {
            return Err(Error::Already);
        }
        self.staged = Some(Vec::new());
        Ok(())
    }

    /// Writes all staged changes in order. Fails with [`Error::NoBufs`] before writing any of
    /// them if their records do not fit even after compacting. The staged changes are dropped
    /// either way.
    pub fn commit_change(&mut self) -> Result<(), Error> {
        let changes = self.staged.take().ok_or(Error::InvalidState)?;
        if self.faulted {
            return Err(Error::FlashError);
        }

        let result = self.commit_staged(changes);
        self.track_fault(result)
    }

    /// Drops all staged changes.
    pub fn abandon_change(&mut self) -> Result<(), Error> {
        self.staged.take().map(|_| ()).ok_or(Error::InvalidState)
    }

    /// Factory reset: erases the first swap area and starts over with an empty store. The erase
    /// counter carries over.
    pub fn wipe(&mut self) -> Result<(), Error> {
        if self.faulted {
            return Err(Error::FlashError);
        }

        let result = self.wipe_areas();
        self.track_fault(result)
    }

    /// Set once the flash driver reported an error. All writes are refused afterwards, reopen the
    /// store to recover.
    pub fn is_faulted(&self) -> bool {
        self.faulted
    }

    /// Returns detailed statistics about the active swap area
    pub fn statistics(&mut self) -> Result<SettingsStatistics, Error> {
        let result = self.record_statistics();
        let records = self.track_fault(result)?;

        Ok(SettingsStatistics {
            active_area: self.active.index as u8,
            format: self.active.format,
            erase_counter: self.active.erase_counter,
            used_bytes: self.active.used,
            free_bytes: self.swap_size - self.active.used,
            records,
        })
    }

    fn track_fault<R>(&mut self, result: Result<R, Error>) -> Result<R, Error> {
        if let Err(Error::FlashError) = result {
            self.faulted = true;
        }
        result
    }
}
