use crate::error::Error;
use crate::platform::{AlignedOps, Platform};
use crate::raw::{
    Format, MAX_RECORD_SIZE, MAX_SWAP_HEADER_SIZE, MAX_VALUE_SIZE, RECORD_FLAGS_OFFSET,
    RECORD_FLAGS_SIZE, RECORD_HEADER_SIZE, RecordHeader, RecordState, SwapHeader,
};
use crate::{RecordStatistics, Settings};
#[cfg(feature = "defmt")]
use defmt::trace;
#[cfg(feature = "defmt")]
use defmt::warn;

/// Free space is checked for stray bits in chunks of this size.
const BLANK_CHECK_CHUNK: usize = 64;

#[derive(Debug, PartialEq, Eq, Copy, Clone)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[repr(u8)]
pub(crate) enum SwapIndex {
    First = 0,
    Second = 1,
}

impl SwapIndex {
    pub(crate) fn other(self) -> SwapIndex {
        match self {
            SwapIndex::First => SwapIndex::Second,
            SwapIndex::Second => SwapIndex::First,
        }
    }
}

/// The live generation: which swap area holds it, its format and how much of it is used.
#[derive(Debug, Clone, Copy)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub(crate) struct ActiveArea {
    pub(crate) index: SwapIndex,
    pub(crate) format: Format,
    /// End of the live log, everything behind it is erased.
    pub(crate) used: u32,
    pub(crate) erase_counter: u32,
}

impl ActiveArea {
    pub(crate) fn unloaded() -> Self {
        Self::empty(SwapIndex::First, Format::CURRENT, 0)
    }

    pub(crate) fn empty(index: SwapIndex, format: Format, erase_counter: u32) -> Self {
        Self {
            index,
            format,
            used: format.swap_header_size(),
            erase_counter,
        }
    }

    pub(crate) fn records_start(&self) -> u32 {
        self.format.swap_header_size()
    }
}

#[derive(Clone, Copy)]
#[cfg_attr(feature = "debug-logs", derive(Debug))]
pub(crate) enum Occurrence {
    Nth(usize),
    All,
}

impl<T: Platform> Settings<T> {
    pub(crate) fn area_address(&self, index: SwapIndex, offset: u32) -> u32 {
        (self.base_address + index as usize * self.swap_size as usize) as u32 + offset
    }

    pub(crate) fn read(
        &mut self,
        index: SwapIndex,
        offset: u32,
        buf: &mut [u8],
    ) -> Result<(), Error> {
        let address = self.area_address(index, offset);
        self.hal.read(address, buf).map_err(|_| Error::FlashError)
    }

    pub(crate) fn write(&mut self, index: SwapIndex, offset: u32, bytes: &[u8]) -> Result<(), Error> {
        #[cfg(feature = "defmt")]
        trace!("write: area {} @{:#06x}: [{}]", index, offset, bytes.len());

        let address = self.area_address(index, offset);
        self.hal.write(address, bytes).map_err(|_| Error::FlashError)
    }

    pub(crate) fn erase(&mut self, index: SwapIndex) -> Result<(), Error> {
        #[cfg(feature = "defmt")]
        trace!("erase: area {}", index);

        #[cfg(feature = "debug-logs")]
        println!("  internal: erase area {index:?}");

        let from = self.area_address(index, 0);
        let to = from + self.swap_size;
        self.hal.erase(from, to).map_err(|_| Error::FlashError)
    }

    pub(crate) fn load_swap_header(&mut self, index: SwapIndex) -> Result<SwapHeader, Error> {
        let mut buf = [0u8; MAX_SWAP_HEADER_SIZE];
        self.read(index, 0, &mut buf)?;
        Ok(SwapHeader::from_bytes(buf))
    }

    /// The erase counter goes first so that a visible marker always comes with a complete counter.
    pub(crate) fn write_swap_header(
        &mut self,
        index: SwapIndex,
        header: SwapHeader,
    ) -> Result<(), Error> {
        #[cfg(feature = "debug-logs")]
        println!("  internal: write swap header {index:?}: {header:?}");

        let raw = header.to_bytes();
        if T::WRITE_SIZE <= 4 {
            self.write(index, 4, &raw[4..])?;
            self.write(index, 0, &raw[..4])
        } else {
            self.write(index, 0, &raw)
        }
    }

    /// Clears the liveness bits of an area's marker, or erases it if its format cannot do that.
    pub(crate) fn deactivate(
        &mut self,
        index: SwapIndex,
        header: SwapHeader,
        format: Format,
    ) -> Result<(), Error> {
        #[cfg(feature = "defmt")]
        trace!("deactivate: area {} ({})", index, format);

        if format.deactivates_in_place() {
            let marker = header.inactive_marker();
            if T::WRITE_SIZE <= 4 {
                self.write(index, 0, &marker)
            } else {
                let mut raw = header.to_bytes();
                raw[..4].copy_from_slice(&marker);
                self.write(index, 0, &raw)
            }
        } else {
            self.erase(index)
        }
    }

    /// Reads a header from the active area.
    pub(crate) fn load_record_header(&mut self, offset: u32) -> Result<RecordHeader, Error> {
        let mut buf = [0u8; RECORD_HEADER_SIZE];
        self.read(self.active.index, offset, &mut buf)?;
        Ok(RecordHeader::from_bytes(buf))
    }

    /// Reads the payload including its padding into `buf` and returns the unpadded part.
    pub(crate) fn load_payload<'a>(
        &mut self,
        offset: u32,
        header: &RecordHeader,
        buf: &'a mut [u8; MAX_RECORD_SIZE],
    ) -> Result<&'a [u8], Error> {
        let padded = header.size(self.active.format) as usize - RECORD_HEADER_SIZE;
        if padded > 0 {
            self.read(
                self.active.index,
                offset + RECORD_HEADER_SIZE as u32,
                &mut buf[..padded],
            )?;
        }
        Ok(&buf[..header.length as usize])
    }

    /// Rewrites only the flags of a record. Bits of neighbouring fields that share the write
    /// window are written with their current value.
    pub(crate) fn write_record_flags(
        &mut self,
        offset: u32,
        header: &RecordHeader,
    ) -> Result<(), Error> {
        let raw = header.to_bytes();
        let start = T::align_write_floor(RECORD_FLAGS_OFFSET);
        let end = T::align_write_ceil(RECORD_FLAGS_OFFSET + RECORD_FLAGS_SIZE);
        self.write(self.active.index, offset + start as u32, &raw[start..end])
    }

    pub(crate) fn load(&mut self) -> Result<(), Error> {
        #[cfg(feature = "defmt")]
        trace!("load");

        #[cfg(feature = "debug-logs")]
        println!("internal: load");

        let first = self.load_swap_header(SwapIndex::First)?;
        let second = self.load_swap_header(SwapIndex::Second)?;

        #[cfg(feature = "debug-logs")]
        println!("internal: load: swap headers {first:?} {second:?}");

        let (index, format, erase_counter) = match (first.active_format(), second.active_format())
        {
            (Some(format), None) => (SwapIndex::First, format, first.erase_counter(format)),
            (Some(format), Some(second_format)) => {
                // interrupted between activating the destination and retiring the source
                #[cfg(feature = "defmt")]
                warn!("load: both swap areas active, retiring the second one");

                self.deactivate(SwapIndex::Second, second, second_format)?;

                // the second area was erased one more time than the first says
                let erase_counter = first
                    .erase_counter(format)
                    .max(second.erase_counter(second_format));
                (SwapIndex::First, format, erase_counter)
            }
            (None, Some(format)) => (SwapIndex::Second, format, second.erase_counter(format)),
            (None, None) => {
                #[cfg(feature = "defmt")]
                warn!("load: no active swap area, formatting");

                self.erase(SwapIndex::First)?;
                self.write_swap_header(SwapIndex::First, SwapHeader::active(Format::CURRENT, 0))?;
                self.active = ActiveArea::empty(SwapIndex::First, Format::CURRENT, 0);
                return Ok(());
            }
        };

        self.active = ActiveArea::empty(index, format, erase_counter);
        self.active.used = self.scan_used()?;

        #[cfg(feature = "debug-logs")]
        println!("internal: load: active {:?}", self.active);

        self.sanitize_free_space()
    }

    /// Walks the log of the active area and returns the offset of the first record that is free,
    /// torn or corrupt. Nothing behind that offset is trusted.
    fn scan_used(&mut self) -> Result<u32, Error> {
        let format = self.active.format;
        let mut offset = self.active.records_start();
        let mut buf = [0u8; MAX_RECORD_SIZE];

        while offset + RECORD_HEADER_SIZE as u32 <= self.swap_size {
            let header = self.load_record_header(offset)?;
            match header.state(format) {
                RecordState::Free => break,
                RecordState::Torn | RecordState::Corrupt => {
                    #[cfg(feature = "defmt")]
                    warn!("scan: {} record @{:#06x}", header.state(format), offset);

                    #[cfg(feature = "debug-logs")]
                    println!("internal: scan: {:?} @{offset:#06x}: {header:?}", header.state(format));

                    break;
                }
                RecordState::Valid | RecordState::Deleted => {}
            }

            let size = header.size(format);
            if offset + size > self.swap_size {
                break;
            }

            let payload = self.load_payload(offset, &header, &mut buf)?;
            if !header.verify(format, T::crc32, payload) {
                #[cfg(feature = "defmt")]
                warn!("scan: checksum mismatch @{:#06x}", offset);

                #[cfg(feature = "debug-logs")]
                println!("internal: scan: checksum mismatch @{offset:#06x}: {header:?}");

                break;
            }

            offset += size;
        }

        Ok(offset)
    }

    /// Compacts if anything behind the log is not blank, so that appends only ever hit erased
    /// flash. Also migrates legacy areas.
    ///
    /// A legacy area whose records do not fit the current format stays active as it is. It is
    /// only read from until a later append retries the migration.
    fn sanitize_free_space(&mut self) -> Result<(), Error> {
        let format = self.active.format;
        let used = self.active.used;

        let dirty = !used.is_multiple_of(format.word_size())
            || !format.has_erase_counter()
            || !self.is_blank(self.active.index, used, self.swap_size)?;

        if dirty {
            #[cfg(feature = "defmt")]
            warn!("sanitize: swap required ({}, used {:#06x})", format, used);

            #[cfg(feature = "debug-logs")]
            println!("internal: sanitize: swap required ({format}, used {used:#06x})");

            match self.swap() {
                Err(Error::NoBufs) if format != Format::CURRENT => {
                    #[cfg(feature = "defmt")]
                    warn!("sanitize: {} area does not fit after migration, keeping it", format);

                    #[cfg(feature = "debug-logs")]
                    println!("internal: sanitize: {format} area does not fit, keeping it");
                }
                result => result?,
            }
        }

        Ok(())
    }

    /// Flags of a legacy area are cleared in place unless the flash cannot address its words,
    /// in which case the area has to be migrated first.
    fn migrate_for_flag_writes(&mut self) -> Result<(), Error> {
        let format = self.active.format;
        if format != Format::CURRENT && T::WRITE_SIZE > format.word_size() as usize {
            self.swap()?;
        }
        Ok(())
    }

    fn is_blank(&mut self, index: SwapIndex, from: u32, to: u32) -> Result<bool, Error> {
        let mut buf = [0u8; BLANK_CHECK_CHUNK];
        let mut offset = from;
        while offset < to {
            let len = BLANK_CHECK_CHUNK.min((to - offset) as usize);
            self.read(index, offset, &mut buf[..len])?;
            if buf[..len].iter().any(|&b| b != 0xFF) {
                return Ok(false);
            }
            offset += len as u32;
        }
        Ok(true)
    }

    /// Offset of the last valid record of `key` that starts a new generation. Valid records of
    /// `key` before it are shadowed.
    fn generation_start(&mut self, key: u16) -> Result<u32, Error> {
        let mut start = self.active.records_start();
        let mut offset = start;
        while offset < self.active.used {
            let header = self.load_record_header(offset)?;
            if header.key == key && header.is_valid() && header.is_first() {
                start = offset;
            }
            offset += header.size(self.active.format);
        }
        Ok(start)
    }

    /// Offset and header of the `index`-th visible record of `key`.
    pub(crate) fn find_visible(
        &mut self,
        key: u16,
        index: usize,
    ) -> Result<(u32, RecordHeader), Error> {
        let mut offset = self.generation_start(key)?;
        let mut seen = 0;
        while offset < self.active.used {
            let header = self.load_record_header(offset)?;
            if header.key == key && header.is_valid() {
                if seen == index {
                    return Ok((offset, header));
                }
                seen += 1;
            }
            offset += header.size(self.active.format);
        }
        Err(Error::NotFound)
    }

    pub(crate) fn get_value(
        &mut self,
        key: u16,
        index: usize,
        buf: Option<&mut [u8]>,
    ) -> Result<usize, Error> {
        #[cfg(feature = "defmt")]
        trace!("get_value: {:#06x}[{}]", key, index);

        #[cfg(feature = "debug-logs")]
        println!("internal: get_value: {key:#06x}[{index}]");

        let (offset, header) = self.find_visible(key, index)?;

        if let Some(buf) = buf {
            let mut raw = [0u8; MAX_RECORD_SIZE];
            let payload = self.load_payload(offset, &header, &mut raw)?;
            let len = payload.len().min(buf.len());
            buf[..len].copy_from_slice(&payload[..len]);
        }

        Ok(header.length as usize)
    }

    pub(crate) fn set_value(&mut self, key: u16, value: &[u8]) -> Result<(), Error> {
        #[cfg(feature = "defmt")]
        trace!("set_value: {:#06x} [{}]", key, value.len());

        #[cfg(feature = "debug-logs")]
        println!("internal: set_value: {key:#06x} [{}]", value.len());

        // Until the older records are deleted, the new one shadows them.
        let new_offset = self.append(key, value, true)?;

        let mut offset = self.active.records_start();
        while offset < new_offset {
            let header = self.load_record_header(offset)?;
            if header.key == key && header.is_valid() {
                self.mark_deleted(offset, header)?;
            }
            offset += header.size(self.active.format);
        }

        Ok(())
    }

    pub(crate) fn add_value(&mut self, key: u16, value: &[u8]) -> Result<(), Error> {
        #[cfg(feature = "defmt")]
        trace!("add_value: {:#06x} [{}]", key, value.len());

        #[cfg(feature = "debug-logs")]
        println!("internal: add_value: {key:#06x} [{}]", value.len());

        let first = match self.find_visible(key, 0) {
            Ok(_) => false,
            Err(Error::NotFound) => true,
            Err(e) => return Err(e),
        };
        self.append(key, value, first).map(|_| ())
    }

    /// Writes a new record behind the log and returns its offset.
    ///
    /// The header and payload go out with only the add-begin flag committed, a second write then
    /// commits add-complete. Until that second write lands, a scan treats the record as torn.
    fn append(&mut self, key: u16, value: &[u8], first: bool) -> Result<u32, Error> {
        if value.len() > MAX_VALUE_SIZE {
            return Err(Error::ValueTooLong);
        }

        let format = Format::CURRENT;
        let mut header = RecordHeader::new(format, key, value.len() as u16, first);
        let size = header.size(format);
        if size + format.swap_header_size() > self.swap_size {
            return Err(Error::ValueTooLong);
        }

        // legacy areas are migrated by the first append
        if self.active.format != format || self.active.used + size > self.swap_size {
            self.swap()?;
        }
        if self.active.used + size > self.swap_size {
            return Err(Error::NoBufs);
        }

        header.seal(format, T::crc32, value);

        let mut raw = [0xFFu8; MAX_RECORD_SIZE];
        raw[..RECORD_HEADER_SIZE].copy_from_slice(&header.to_bytes());
        raw[RECORD_HEADER_SIZE..RECORD_HEADER_SIZE + value.len()].copy_from_slice(value);

        let offset = self.active.used;
        self.write(self.active.index, offset, &raw[..size as usize])?;

        header.set_add_complete();
        self.write_record_flags(offset, &header)?;

        self.active.used += size;

        #[cfg(feature = "debug-logs")]
        println!("internal: append: @{offset:#06x}: {header:?}");

        Ok(offset)
    }

    fn mark_deleted(&mut self, offset: u32, mut header: RecordHeader) -> Result<(), Error> {
        #[cfg(feature = "debug-logs")]
        println!("internal: mark_deleted: @{offset:#06x}: {header:?}");

        header.set_deleted();
        self.write_record_flags(offset, &header)
    }

    pub(crate) fn delete_key(&mut self, key: u16, occurrence: Occurrence) -> Result<(), Error> {
        #[cfg(feature = "defmt")]
        trace!("delete_key: {:#06x}", key);

        #[cfg(feature = "debug-logs")]
        println!("internal: delete_key: {key:#06x} {occurrence:?}");

        self.migrate_for_flag_writes()?;

        // Shadowed records go along with the target so that they cannot resurface once the
        // record shadowing them is gone.
        let (target, retire_before) = match occurrence {
            Occurrence::Nth(index) => {
                let (target, _) = self.find_visible(key, index)?;
                (Some(target), self.generation_start(key)?)
            }
            Occurrence::All => (None, self.active.used),
        };

        let mut deleted = false;
        let mut offset = self.active.records_start();
        while offset < self.active.used {
            let header = self.load_record_header(offset)?;
            if header.key == key
                && header.is_valid()
                && (offset < retire_before || Some(offset) == target)
            {
                self.mark_deleted(offset, header)?;
                deleted = true;
            }
            offset += header.size(self.active.format);
        }

        if deleted { Ok(()) } else { Err(Error::NotFound) }
    }

    pub(crate) fn wipe_areas(&mut self) -> Result<(), Error> {
        #[cfg(feature = "defmt")]
        trace!("wipe_areas");

        #[cfg(feature = "debug-logs")]
        println!("internal: wipe_areas");

        let erase_counter = self.next_erase_counter();

        self.erase(SwapIndex::First)?;
        self.write_swap_header(
            SwapIndex::First,
            SwapHeader::active(Format::CURRENT, erase_counter),
        )?;

        let second = self.load_swap_header(SwapIndex::Second)?;
        if let Some(format) = second.active_format() {
            self.deactivate(SwapIndex::Second, second, format)?;
        }

        self.active = ActiveArea::empty(SwapIndex::First, Format::CURRENT, erase_counter);
        Ok(())
    }

    pub(crate) fn next_erase_counter(&self) -> u32 {
        self.active
            .erase_counter
            .saturating_add(1)
            .min(self.max_erase_counter)
    }

    pub(crate) fn record_statistics(&mut self) -> Result<RecordStatistics, Error> {
        let mut statistics = RecordStatistics::default();
        let mut offset = self.active.records_start();
        while offset < self.active.used {
            let header = self.load_record_header(offset)?;
            let next = offset + header.size(self.active.format);
            if header.is_valid() {
                if self.is_shadowed(next, header.key)? {
                    statistics.shadowed += 1;
                } else {
                    statistics.valid += 1;
                }
            } else {
                statistics.deleted += 1;
            }
            offset = next;
        }
        Ok(statistics)
    }

    /// Whether a valid record starting a new generation of `key` exists at or after `from`.
    pub(crate) fn is_shadowed(&mut self, from: u32, key: u16) -> Result<bool, Error> {
        let mut offset = from;
        while offset < self.active.used {
            let header = self.load_record_header(offset)?;
            if header.key == key && header.is_valid() && header.is_first() {
                return Ok(true);
            }
            offset += header.size(self.active.format);
        }
        Ok(false)
    }
}
