//! Compaction into the inactive swap area.
//!
//! The destination is erased, filled with every record that is still visible, and only then marked
//! active. The source is retired last. If power fails in between, both areas carry an active
//! marker and the first area wins on the next load, which is complete either way.

use crate::Settings;
use crate::error::Error;
use crate::internal::ActiveArea;
use crate::platform::Platform;
use crate::raw::{Format, MAX_RECORD_SIZE, RECORD_HEADER_SIZE, RecordHeader, SwapHeader};
#[cfg(feature = "defmt")]
use defmt::{trace, warn};

impl<T: Platform> Settings<T> {
    pub(crate) fn swap(&mut self) -> Result<(), Error> {
        #[cfg(feature = "defmt")]
        trace!("swap: from area {}", self.active.index);

        #[cfg(feature = "debug-logs")]
        println!("internal: swap: from {:?}", self.active);

        let source = self.active;
        let source_header = self.load_swap_header(source.index)?;
        let destination = source.index.other();
        let format = Format::CURRENT;

        // legacy records may grow when realigned, find out before anything is erased
        if source.format != format && self.compacted_size(format)? > self.swap_size {
            #[cfg(feature = "defmt")]
            warn!("swap: records of area {} do not fit as {}", source.index, format);

            return Err(Error::NoBufs);
        }

        self.erase(destination)?;

        let mut buf = [0u8; MAX_RECORD_SIZE];
        let mut target = format.swap_header_size();
        let mut offset = source.records_start();
        while offset < source.used {
            let header = self.load_record_header(offset)?;
            let next = offset + header.size(source.format);

            if !header.is_valid() || self.is_shadowed(next, header.key)? {
                offset = next;
                continue;
            }

            let payload = self.load_payload(offset, &header, &mut buf)?;
            let length = payload.len();

            let mut copy = RecordHeader::new(format, header.key, header.length, header.is_first());
            copy.set_add_complete();
            copy.seal(format, T::crc32, payload);

            let size = copy.size(format) as usize;
            if target as usize + size > self.swap_size as usize {
                return Err(Error::NoBufs);
            }

            let mut raw = [0xFFu8; MAX_RECORD_SIZE];
            raw[..RECORD_HEADER_SIZE].copy_from_slice(&copy.to_bytes());
            raw[RECORD_HEADER_SIZE..RECORD_HEADER_SIZE + length].copy_from_slice(payload);

            #[cfg(feature = "debug-logs")]
            println!("internal: swap: @{offset:#06x} -> @{target:#06x}: {copy:?}");

            self.write(destination, target, &raw[..size])?;
            target += size as u32;

            offset = next;
        }

        let erase_counter = self.next_erase_counter();
        self.write_swap_header(destination, SwapHeader::active(format, erase_counter))?;

        self.deactivate(source.index, source_header, source.format)?;

        self.active = ActiveArea {
            index: destination,
            format,
            used: target,
            erase_counter,
        };

        #[cfg(feature = "debug-logs")]
        println!("internal: swap: done {:?}", self.active);

        Ok(())
    }

    /// Bytes the surviving records of the active area take up once rewritten in `format`,
    /// swap header included.
    fn compacted_size(&mut self, format: Format) -> Result<u32, Error> {
        let source = self.active;
        let mut size = format.swap_header_size();
        let mut offset = source.records_start();
        while offset < source.used {
            let header = self.load_record_header(offset)?;
            let next = offset + header.size(source.format);
            if header.is_valid() && !self.is_shadowed(next, header.key)? {
                size += header.size(format);
            }
            offset = next;
        }
        Ok(size)
    }
}
