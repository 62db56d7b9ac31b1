/// Page size in bytes (8 KiB)
pub const PAGE_SIZE: usize = 8192;

/// Page number within a buffer pool file
pub type PageNum = i32;

/// Log sequence number
pub type Lsn = u64;

/// Transaction ID type
pub type TrxId = i32;

/// Page checksum type (CRC32 over the page data region)
pub type CheckSum = u32;

/// Buffer pool identifier, unique across all pools of one database
pub type PoolId = i32;

/// Sentinel marking a frame or header slot that holds no page
pub const INVALID_PAGE_NUM: PageNum = -1;

/// Page 0 of every pool file is the file header page
pub const HEADER_PAGE_NUM: PageNum = 0;
