//! Staged changes.
//!
//! Between `begin_change` and `commit_change` writes are only collected. The commit checks once
//! that all new records fit, compacting at most once for the whole batch, and then applies the
//! writes in the order they were staged. The batch is not atomic against power loss, every
//! single write in it still is.

use crate::Settings;
use crate::error::Error;
use crate::internal::Occurrence;
use crate::platform::Platform;
use crate::raw::{Format, MAX_VALUE_SIZE, RECORD_HEADER_SIZE};
use alloc::vec::Vec;
#[cfg(feature = "defmt")]
use defmt::trace;

#[cfg_attr(feature = "debug-logs", derive(Debug))]
pub(crate) enum StagedChange {
    Set { key: u16, value: Vec<u8> },
    Add { key: u16, value: Vec<u8> },
    Delete { key: u16, occurrence: Occurrence },
}

impl StagedChange {
    /// Bytes the change appends to the log.
    fn appended_size(&self, format: Format) -> u32 {
        match self {
            StagedChange::Set { value, .. } | StagedChange::Add { value, .. } => {
                RECORD_HEADER_SIZE as u32 + format.align(value.len() as u32)
            }
            StagedChange::Delete { .. } => 0,
        }
    }
}

impl<T: Platform> Settings<T> {
    /// Queues a change. Oversized values and deletes of absent keys are refused right away, the
    /// latter judged against what is committed.
    pub(crate) fn stage(&mut self, change: StagedChange) -> Result<(), Error> {
        #[cfg(feature = "debug-logs")]
        println!("change: stage {change:?}");

        match &change {
            StagedChange::Set { value, .. } | StagedChange::Add { value, .. }
                if value.len() > MAX_VALUE_SIZE =>
            {
                return Err(Error::ValueTooLong);
            }
            StagedChange::Delete { key, occurrence } => {
                let index = match occurrence {
                    Occurrence::Nth(index) => *index,
                    Occurrence::All => 0,
                };
                self.find_visible(*key, index)?;
            }
            _ => {}
        }

        match &mut self.staged {
            Some(staged) => {
                staged.push(change);
                Ok(())
            }
            None => Err(Error::InvalidState),
        }
    }

    pub(crate) fn commit_staged(&mut self, changes: Vec<StagedChange>) -> Result<(), Error> {
        #[cfg(feature = "defmt")]
        trace!("commit_staged: {} changes", changes.len());

        let format = Format::CURRENT;
        let appended: u32 = changes.iter().map(|c| c.appended_size(format)).sum();

        if appended > 0
            && (self.active.format != format || self.active.used + appended > self.swap_size)
        {
            self.swap()?;
        }
        if self.active.used + appended > self.swap_size {
            return Err(Error::NoBufs);
        }

        for change in changes {
            match change {
                StagedChange::Set { key, value } => self.set_value(key, &value)?,
                StagedChange::Add { key, value } => self.add_value(key, &value)?,
                StagedChange::Delete { key, occurrence } => {
                    // an earlier change of the batch may have removed it already
                    match self.delete_key(key, occurrence) {
                        Err(Error::NotFound) => {}
                        result => result?,
                    }
                }
            }
        }

        Ok(())
    }
}
