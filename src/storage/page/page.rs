use byteorder::{ByteOrder, LittleEndian};

use crate::common::types::{CheckSum, Lsn, PageNum, TrxId, INVALID_PAGE_NUM, PAGE_SIZE};

/// Serialized page header size in bytes (packed, little-endian)
pub const PAGE_HEADER_SIZE: usize = 28;

/// Bytes available for the opaque data region of a page
pub const PAGE_DATA_SIZE: usize = PAGE_SIZE - PAGE_HEADER_SIZE;

// Page flag bits
pub const PAGE_DIRTY_FLAG: u8 = 0x01;
pub const PAGE_IO_IN_PROGRESS: u8 = 0x02;
pub const PAGE_PINNED: u8 = 0x04;
pub const PAGE_IN_FLUSH_LIST: u8 = 0x08;
pub const PAGE_ENCRYPTED: u8 = 0x10;
pub const PAGE_COMPRESSED: u8 = 0x20;

/// Page type tag stored in the header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PageType {
    Unknown = 0,
    Header = 1,
    Data = 2,
    Index = 3,
    Overflow = 4,
    Free = 5,
}

impl From<u8> for PageType {
    fn from(value: u8) -> Self {
        match value {
            1 => PageType::Header,
            2 => PageType::Data,
            3 => PageType::Index,
            4 => PageType::Overflow,
            5 => PageType::Free,
            _ => PageType::Unknown,
        }
    }
}

/// Page header. On disk this occupies the first [`PAGE_HEADER_SIZE`] bytes of
/// every page, little-endian, no padding.
///
/// `free_space`, `free_space_offset` and `slot_count` belong to the record
/// layout managed by higher layers; the core only zeroes them at init.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageHeader {
    pub page_num: PageNum,
    pub lsn: Lsn,
    pub check_sum: CheckSum,
    pub free_space: u16,
    pub free_space_offset: u16,
    pub slot_count: u16,
    pub page_type: u8,
    pub flags: u8,
    pub last_trx_id: TrxId,
}

impl PageHeader {
    pub fn to_bytes(&self) -> [u8; PAGE_HEADER_SIZE] {
        let mut bytes = [0u8; PAGE_HEADER_SIZE];
        LittleEndian::write_i32(&mut bytes[0..4], self.page_num);
        LittleEndian::write_u64(&mut bytes[4..12], self.lsn);
        LittleEndian::write_u32(&mut bytes[12..16], self.check_sum);
        LittleEndian::write_u16(&mut bytes[16..18], self.free_space);
        LittleEndian::write_u16(&mut bytes[18..20], self.free_space_offset);
        LittleEndian::write_u16(&mut bytes[20..22], self.slot_count);
        bytes[22] = self.page_type;
        bytes[23] = self.flags;
        LittleEndian::write_i32(&mut bytes[24..28], self.last_trx_id);
        bytes
    }

    pub fn from_bytes(bytes: &[u8]) -> Self {
        Self {
            page_num: LittleEndian::read_i32(&bytes[0..4]),
            lsn: LittleEndian::read_u64(&bytes[4..12]),
            check_sum: LittleEndian::read_u32(&bytes[12..16]),
            free_space: LittleEndian::read_u16(&bytes[16..18]),
            free_space_offset: LittleEndian::read_u16(&bytes[18..20]),
            slot_count: LittleEndian::read_u16(&bytes[20..22]),
            page_type: bytes[22],
            flags: bytes[23],
            last_trx_id: LittleEndian::read_i32(&bytes[24..28]),
        }
    }
}

/// A fixed-size page, in memory or on disk.
#[derive(Clone)]
pub struct Page {
    pub header: PageHeader,
    pub data: [u8; PAGE_DATA_SIZE],
}

impl Page {
    pub fn new() -> Self {
        let mut page = Self {
            header: PageHeader {
                page_num: INVALID_PAGE_NUM,
                lsn: 0,
                check_sum: 0,
                free_space: 0,
                free_space_offset: 0,
                slot_count: 0,
                page_type: 0,
                flags: 0,
                last_trx_id: 0,
            },
            data: [0u8; PAGE_DATA_SIZE],
        };
        page.init();
        page
    }

    /// Reset the page to its pristine state: zeroed data, invalid page
    /// number, all of the data region free.
    pub fn init(&mut self) {
        self.header = PageHeader {
            page_num: INVALID_PAGE_NUM,
            lsn: 0,
            check_sum: 0,
            free_space: PAGE_DATA_SIZE as u16,
            free_space_offset: 0,
            slot_count: 0,
            page_type: 0,
            flags: 0,
            last_trx_id: 0,
        };
        self.data.fill(0);
    }

    /// Compute the CRC32 of the data region and store it in the header.
    pub fn calc_checksum(&mut self) {
        self.header.check_sum = crc32(&self.data);
    }

    /// Recompute the data-region checksum and compare with the stored one.
    /// The page is left bitwise unchanged.
    pub fn verify_checksum(&self) -> bool {
        self.header.check_sum == crc32(&self.data)
    }

    /// Serialize header and data into a caller-provided 8 KiB buffer.
    pub fn write_to(&self, buf: &mut [u8; PAGE_SIZE]) {
        buf[..PAGE_HEADER_SIZE].copy_from_slice(&self.header.to_bytes());
        buf[PAGE_HEADER_SIZE..].copy_from_slice(&self.data);
    }

    pub fn to_bytes(&self) -> Box<[u8; PAGE_SIZE]> {
        let mut buf = Box::new([0u8; PAGE_SIZE]);
        self.write_to(&mut buf);
        buf
    }

    pub fn from_bytes(buf: &[u8; PAGE_SIZE]) -> Self {
        let mut page = Self::new();
        page.header = PageHeader::from_bytes(&buf[..PAGE_HEADER_SIZE]);
        page.data.copy_from_slice(&buf[PAGE_HEADER_SIZE..]);
        page
    }
}

impl Default for Page {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Page {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Page").field("header", &self.header).finish()
    }
}

// CRC32 (IEEE, reflected polynomial 0xEDB88320), table built at compile time.
static CRC32_TABLE: [u32; 256] = build_crc32_table();

const fn build_crc32_table() -> [u32; 256] {
    let mut table = [0u32; 256];
    let mut i = 0;
    while i < 256 {
        let mut c = i as u32;
        let mut j = 0;
        while j < 8 {
            c = if c & 1 != 0 { 0xEDB88320 ^ (c >> 1) } else { c >> 1 };
            j += 1;
        }
        table[i] = c;
        i += 1;
    }
    table
}

/// CRC32 over an arbitrary byte slice.
pub fn crc32(data: &[u8]) -> u32 {
    let mut crc = 0xFFFFFFFFu32;
    for &byte in data {
        crc = CRC32_TABLE[((crc ^ byte as u32) & 0xFF) as usize] ^ (crc >> 8);
    }
    !crc
}
