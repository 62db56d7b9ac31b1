use std::fs::OpenOptions;
use std::os::unix::fs::FileExt;

use anyhow::Result;
use tempfile::TempDir;

use tarndb::storage::clog::ClogConfig;
use tarndb::storage::page::PAGE_HEADER_SIZE;

mod common;
use common::{create_durable_manager, pool_file_path};

const PAGE_SIZE: u64 = 8192;

#[test]
fn test_batched_double_write_flush() -> Result<()> {
    let dir = TempDir::new()?;
    let manager = create_durable_manager(&dir, 32, ClogConfig::default())?;
    let pool = manager.open_file(pool_file_path(&dir, "test.db"))?;

    // 17 dirty data pages plus the dirty header page; the staging cap of
    // 16 forces one automatic flush cycle mid-way
    let mut page_nums = Vec::new();
    for i in 0..17u8 {
        let frame = pool.allocate_page()?;
        frame.page().data[0] = i + 1;
        frame.mark_dirty();
        page_nums.push(frame.page_num());
        pool.unpin_page(&frame)?;
    }

    manager.log_handler().flush()?;
    pool.flush_all_pages()?;
    manager.flush_all()?;

    // A completed cycle leaves nothing staged and a zeroed header
    let dblwr = manager.double_write_buffer();
    assert_eq!(dblwr.staged_pages(), 0);
    assert_eq!(dblwr.header_page_cnt(), 0);

    // Every page reached its destination with a valid checksum
    for &page_num in &page_nums {
        assert!(pool.page_intact_on_disk(page_num)?);
    }
    assert!(pool.page_intact_on_disk(0)?);
    Ok(())
}

#[test]
fn test_recovery_restores_torn_page() -> Result<()> {
    let dir = TempDir::new()?;
    let db_path = pool_file_path(&dir, "test.db");
    let page_num;

    // First run: stage a dirty page in the double-write buffer but crash
    // before the batch flush writes it to its destination.
    {
        let manager = create_durable_manager(&dir, 16, ClogConfig::default())?;
        let pool = manager.open_file(&db_path)?;

        let frame = pool.allocate_page()?;
        page_num = frame.page_num();
        frame.page().data[..9].copy_from_slice(b"committed");
        pool.unpin_page(&frame)?;

        manager.log_handler().flush()?;
        // Stages the page and the header into dblwr.db; the staging cap is
        // not reached, so no destination write happens
        pool.flush_all_pages()?;
        assert!(manager.double_write_buffer().staged_pages() >= 2);
        // Simulated crash: the manager is dropped without flush_all
    }

    // Tear the destination: scribble over the page's on-disk location
    {
        let file = OpenOptions::new().write(true).open(&db_path)?;
        let garbage = vec![0x5A; 1024];
        file.write_all_at(&garbage, page_num as u64 * PAGE_SIZE)?;
        file.sync_data()?;
    }

    // Restart: staged copies are loaded from dblwr.db and recovery copies
    // them over the torn destination
    let manager = create_durable_manager(&dir, 16, ClogConfig::default())?;
    let pool = manager.open_file(&db_path)?;
    manager.recover()?;

    assert!(pool.page_intact_on_disk(page_num)?);
    assert!(pool.page_intact_on_disk(0)?);

    let frame = pool.get_this_page(page_num)?;
    assert_eq!(&frame.page().data[..9], b"committed");
    pool.unpin_page(&frame)?;
    Ok(())
}

#[test]
fn test_wal_redo_rebuilds_allocation_bitmap() -> Result<()> {
    let dir = TempDir::new()?;
    let db_path = pool_file_path(&dir, "test.db");

    // First run: allocate two pages and dispose the first, flushing only
    // the log. The header page image on disk never sees any of it.
    {
        let manager = create_durable_manager(&dir, 16, ClogConfig::default())?;
        let pool = manager.open_file(&db_path)?;

        let first = pool.allocate_page()?;
        let second = pool.allocate_page()?;
        let first_num = first.page_num();
        assert_eq!((first_num, second.page_num()), (1, 2));
        pool.unpin_page(&first)?;
        pool.unpin_page(&second)?;
        pool.dispose_page(first_num)?;

        manager.log_handler().flush()?;
        // Simulated crash: no page flush, no clean shutdown
    }

    let manager = create_durable_manager(&dir, 16, ClogConfig::default())?;
    let pool = manager.open_file(&db_path)?;
    assert_eq!(pool.allocated_pages(), 1); // nothing but the header page

    manager.recover()?;

    // Redo replays ALLOCATE(1), ALLOCATE(2), DEALLOCATE(1)
    assert_eq!(pool.page_count(), 3);
    assert_eq!(pool.allocated_pages(), 2);
    assert_eq!(pool.iter_pages(0).collect::<Vec<_>>(), vec![0, 2]);

    // Replaying a second time changes nothing: entries older than the
    // header's LSN are skipped
    manager.recover()?;
    assert_eq!(pool.allocated_pages(), 2);
    assert_eq!(pool.iter_pages(0).collect::<Vec<_>>(), vec![0, 2]);

    // The restarted log continues the dense LSN sequence
    let frame = pool.allocate_page()?;
    assert_eq!(frame.page_num(), 1);
    assert!(frame.lsn() > 3);
    pool.unpin_page(&frame)?;
    Ok(())
}

#[test]
fn test_clean_shutdown_leaves_empty_double_write_file() -> Result<()> {
    let dir = TempDir::new()?;
    let db_path = pool_file_path(&dir, "test.db");

    {
        let manager = create_durable_manager(&dir, 16, ClogConfig::default())?;
        let pool = manager.open_file(&db_path)?;
        let frame = pool.allocate_page()?;
        pool.unpin_page(&frame)?;
        manager.shutdown()?;
    }

    // The on-disk header must read zero slots after a clean shutdown
    let dblwr_bytes = std::fs::read(dir.path().join("dblwr.db"))?;
    assert!(dblwr_bytes.len() >= 4);
    assert_eq!(i32::from_le_bytes(dblwr_bytes[..4].try_into()?), 0);

    // And a restart finds nothing to recover
    let manager = create_durable_manager(&dir, 16, ClogConfig::default())?;
    let pool = manager.open_file(&db_path)?;
    manager.recover()?;
    assert_eq!(manager.double_write_buffer().staged_pages(), 0);
    assert_eq!(pool.allocated_pages(), 2);
    Ok(())
}

#[test]
fn test_pool_id_read_back_from_file() -> Result<()> {
    let dir = TempDir::new()?;
    let db_path = pool_file_path(&dir, "test.db");
    let original_id;

    {
        let manager = create_durable_manager(&dir, 16, ClogConfig::default())?;
        let pool = manager.open_file(&db_path)?;
        original_id = pool.id();
        manager.shutdown()?;
    }

    // The id is the first field of the header page's data region
    let bytes = std::fs::read(&db_path)?;
    let stored = i32::from_le_bytes(bytes[PAGE_HEADER_SIZE..PAGE_HEADER_SIZE + 4].try_into()?);
    assert_eq!(stored, original_id);

    let manager = create_durable_manager(&dir, 16, ClogConfig::default())?;
    let pool = manager.open_file(&db_path)?;
    assert_eq!(pool.id(), original_id);
    Ok(())
}
