mod page;

pub use page::{
    crc32, Page, PageHeader, PageType, PAGE_DATA_SIZE, PAGE_DIRTY_FLAG, PAGE_HEADER_SIZE,
};
