#![allow(dead_code)]

// filename according to https://doc.rust-lang.org/book/ch11-03-test-organization.html
use embedded_storage::nor_flash::{
    ErrorType, NorFlash, NorFlashError, NorFlashErrorKind, ReadNorFlash,
};
use flash_settings::Settings;

pub const FLASH_SECTOR_SIZE: usize = 2048;
pub const WORD_SIZE: usize = 4;
pub const SWAP_HEADER_SIZE: usize = 8;
pub const RECORD_HEADER_SIZE: usize = 8;

pub const LEGACY_MARKER: u32 = 0xbe5c_c5ef;
pub const V1_ACTIVE_MARKER: [u8; 4] = [0xef, 0xc5, 0x5c, 0xee];
pub const V1_INACTIVE_MARKER: [u8; 4] = [0xec, 0xc5, 0x5c, 0xee];

/// `WRITE` is the write granularity, reads always go by `WORD_SIZE`.
#[derive(Default)]
pub struct Flash<const WRITE: usize = WORD_SIZE> {
    pub buf: Vec<u8>,
    pub fail_after_operation: usize,
    /// Number of bytes that still reach the flash before power is cut, in the middle of a write
    /// if need be.
    pub power_budget: usize,
    pub powered_off: bool,
    pub operations: Vec<Operation>,
}

#[derive(Debug, PartialEq, Clone)]
pub enum Operation {
    Read { offset: u32, len: usize },
    Write { offset: u32, len: usize },
    Erase { offset: u32, len: usize },
}

impl Flash {
    /// One swap area per sector.
    pub fn new(sectors: usize) -> Self {
        Self::with_sectors(sectors)
    }

    pub fn new_with_fault(sectors: usize, fail_after_operation: usize) -> Self {
        Self {
            fail_after_operation,
            ..Self::new(sectors)
        }
    }
}

impl<const WRITE: usize> Flash<WRITE> {
    pub fn with_sectors(sectors: usize) -> Self {
        Self {
            buf: vec![0xffu8; FLASH_SECTOR_SIZE * sectors],
            fail_after_operation: usize::MAX,
            power_budget: usize::MAX,
            ..Default::default()
        }
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn disable_faults(&mut self) {
        self.fail_after_operation = usize::MAX;
        self.power_budget = usize::MAX;
        self.powered_off = false;
    }

    pub fn cut_power_after_bytes(&mut self, bytes: usize) {
        self.power_budget = bytes;
    }

    pub fn erases(&self) -> usize {
        self.operations
            .iter()
            .filter(|op| matches!(op, Operation::Erase { .. }))
            .count()
    }

    pub fn writes(&self) -> usize {
        self.operations
            .iter()
            .filter(|op| matches!(op, Operation::Write { .. }))
            .count()
    }

    pub fn area(&self, index: usize) -> &[u8] {
        &self.buf[index * FLASH_SECTOR_SIZE..(index + 1) * FLASH_SECTOR_SIZE]
    }

    pub fn marker(&self, index: usize) -> [u8; 4] {
        self.area(index)[..4].try_into().unwrap()
    }

    pub fn active_areas(&self) -> usize {
        (0..self.buf.len() / FLASH_SECTOR_SIZE)
            .filter(|&index| {
                let marker = u32::from_le_bytes(self.marker(index));
                marker & 0x0FFF_FFFF == 0x0e5c_c5ef
            })
            .count()
    }

    /// Lays out a legacy formatted swap area: 4-byte marker, records aligned to 4 bytes.
    pub fn write_legacy_area(&mut self, index: usize, records: &[LegacyRecord]) {
        let area = index * FLASH_SECTOR_SIZE;
        self.buf[area..area + FLASH_SECTOR_SIZE].fill(0xff);
        self.buf[area..area + 4].copy_from_slice(&LEGACY_MARKER.to_le_bytes());

        let mut offset = area + 4;
        for record in records {
            let mut flags = 0xFFFFu16 & !0b01 & !0b10;
            if record.first {
                flags &= !0b1000;
            }
            if record.deleted {
                flags &= !0b100;
            }
            self.buf[offset..offset + 2].copy_from_slice(&record.key.to_le_bytes());
            self.buf[offset + 2..offset + 4].copy_from_slice(&flags.to_le_bytes());
            self.buf[offset + 4..offset + 6]
                .copy_from_slice(&(record.data.len() as u16).to_le_bytes());
            offset += RECORD_HEADER_SIZE;
            self.buf[offset..offset + record.data.len()].copy_from_slice(record.data);
            offset += record.data.len().div_ceil(4) * 4;
        }
    }

    pub fn dump_operations(&self) {
        println!("Operations:");
        for op in &self.operations {
            println!("  {:?}", op);
        }
    }

    fn fault(&mut self) -> bool {
        if self.powered_off || self.operations.len() >= self.fail_after_operation {
            println!("    flash: FAULT");
            return true;
        }
        false
    }
}

pub struct LegacyRecord {
    pub key: u16,
    pub first: bool,
    pub deleted: bool,
    pub data: &'static [u8],
}

#[derive(Debug)]
pub struct FlashError;

impl NorFlashError for FlashError {
    fn kind(&self) -> NorFlashErrorKind {
        NorFlashErrorKind::Other
    }
}

impl<const WRITE: usize> ErrorType for Flash<WRITE> {
    type Error = FlashError;
}

impl<const WRITE: usize> ReadNorFlash for Flash<WRITE> {
    const READ_SIZE: usize = WORD_SIZE;

    fn read(&mut self, offset: u32, bytes: &mut [u8]) -> Result<(), Self::Error> {
        assert!(offset.is_multiple_of(Self::READ_SIZE as _));

        if self.fault() {
            return Err(FlashError);
        }
        self.operations.push(Operation::Read {
            offset,
            len: bytes.len(),
        });

        let offset = offset as usize;
        bytes.copy_from_slice(&self.buf[offset..offset + bytes.len()]);
        Ok(())
    }

    fn capacity(&self) -> usize {
        self.buf.len()
    }
}

impl<const WRITE: usize> NorFlash for Flash<WRITE> {
    const WRITE_SIZE: usize = WRITE;

    const ERASE_SIZE: usize = FLASH_SECTOR_SIZE;

    fn erase(&mut self, from: u32, to: u32) -> Result<(), Self::Error> {
        assert!(from.is_multiple_of(Self::ERASE_SIZE as _));
        assert!(to.is_multiple_of(Self::ERASE_SIZE as _));

        println!(
            "    flash: erase: {from:04X} - {to:04X} #{:>2}",
            self.operations.len()
        );

        if self.fault() {
            return Err(FlashError);
        }

        self.operations.push(Operation::Erase {
            offset: from,
            len: (to - from) as usize,
        });

        self.buf[from as usize..to as usize].fill(0xff);
        Ok(())
    }

    fn write(&mut self, offset: u32, bytes: &[u8]) -> Result<(), Self::Error> {
        assert!(offset.is_multiple_of(Self::WRITE_SIZE as _));
        assert!(bytes.len().is_multiple_of(Self::WRITE_SIZE as _));
        assert!(!bytes.is_empty());

        println!(
            "    flash: write: 0x{offset:04X}[0x{:04X}] #{:>2}",
            bytes.len(),
            self.operations.len()
        );

        if self.fault() {
            return Err(FlashError);
        }

        self.operations.push(Operation::Write {
            offset,
            len: bytes.len(),
        });

        let reached = bytes.len().min(self.power_budget);
        self.power_budget -= reached;

        let offset = offset as usize;
        for (i, &val) in bytes[..reached].iter().enumerate() {
            // NOR flash can only flip bits from 1 to 0
            assert_eq!(
                self.buf[offset + i] & val,
                val,
                "write would set bits @{:#06x}",
                offset + i
            );
            self.buf[offset + i] &= val;
        }

        if reached < bytes.len() {
            println!("    flash: POWER CUT after {reached} bytes");
            self.powered_off = true;
            return Err(FlashError);
        }
        Ok(())
    }
}

impl<const WRITE: usize> flash_settings::platform::Crc for Flash<WRITE> {
    fn crc32(init: u32, data: &[u8]) -> u32 {
        unsafe { libz_sys::crc32(init as _, data.as_ptr(), data.len() as _) as u32 }
    }
}

pub fn open<const WRITE: usize>(flash: &mut Flash<WRITE>) -> Settings<&mut Flash<WRITE>> {
    let len = flash.len();
    Settings::new(0, len, flash).unwrap()
}

/// Rewrites `key` until the store compacted once.
pub fn force_swap<const WRITE: usize>(settings: &mut Settings<&mut Flash<WRITE>>, key: u16) {
    let before = settings.statistics().unwrap().active_area;
    let filler = [0x5Au8; 200];
    for _ in 0..64 {
        settings.set(key, &filler).unwrap();
        if settings.statistics().unwrap().active_area != before {
            return;
        }
    }
    panic!("store never compacted");
}
