//! Process-wide frame pool shared by every buffer pool.
//!
//! Memory for frames is fixed at init time; when the pool runs dry, callers
//! purge unpinned victims from the LRU end to make room. One mutex guards
//! both the LRU index and the free list, held only for O(1) bookkeeping,
//! except in `purge_frames` where the victim set must stay stable while it
//! is written back.

use std::sync::Arc;

use log::{info, warn};
use parking_lot::Mutex;

use crate::common::error::{DbError, Result};
use crate::common::types::{PageNum, PoolId, INVALID_PAGE_NUM};
use crate::storage::buffer::frame::{Frame, FrameId};
use crate::storage::buffer::lru::LruCache;

struct FrameManagerInner {
    frames: LruCache<FrameId, Arc<Frame>>,
    free_list: Vec<Arc<Frame>>,
    capacity: usize,
}

/// Fixed-capacity manager of in-memory frames, shared by all pools.
pub struct FrameManager {
    inner: Mutex<FrameManagerInner>,
}

impl FrameManager {
    /// Build the frame pool. Capacity is fixed; there is no dynamic growth.
    pub fn new(capacity: usize) -> Result<Self> {
        if capacity == 0 {
            return Err(DbError::NoMemPool);
        }

        let free_list = (0..capacity).map(|_| Arc::new(Frame::new())).collect();
        Ok(Self {
            inner: Mutex::new(FrameManagerInner {
                frames: LruCache::new(),
                free_list,
                capacity,
            }),
        })
    }

    /// Cache lookup. On a hit the frame is pinned and moved to the MRU end;
    /// lookup and LRU touch are atomic under the manager lock.
    pub fn get(&self, buffer_pool_id: PoolId, page_num: PageNum) -> Option<Arc<Frame>> {
        let frame_id = FrameId::new(buffer_pool_id, page_num);
        let mut inner = self.inner.lock();

        let frame = inner.frames.get_refresh(&frame_id)?.clone();
        frame.pin();
        Some(frame)
    }

    /// Take a free frame, assign it the id, pin it and insert at the MRU
    /// end. `None` means the allocator is exhausted and the caller must
    /// purge first.
    pub fn alloc(&self, buffer_pool_id: PoolId, page_num: PageNum) -> Option<Arc<Frame>> {
        let frame_id = FrameId::new(buffer_pool_id, page_num);
        let mut inner = self.inner.lock();

        let frame = inner.free_list.pop()?;
        assert_eq!(
            frame.pin_count(),
            0,
            "free frame is pinned, frame_id={}",
            frame.frame_id()
        );

        frame.set_frame_id(frame_id);
        frame.set_page_num(page_num);
        frame.pin();
        inner.frames.put(frame_id, frame.clone());
        Some(frame)
    }

    /// Return a frame to the allocator. The caller must hold exactly one
    /// pin; anything else implies a bookkeeping bug and aborts.
    pub fn free(&self, frame_id: FrameId, frame: &Arc<Frame>) -> Result<()> {
        let mut inner = self.inner.lock();
        Self::free_internal(&mut inner, frame_id, frame);
        Ok(())
    }

    fn free_internal(inner: &mut FrameManagerInner, frame_id: FrameId, frame: &Arc<Frame>) {
        let cached = inner.frames.peek(&frame_id);
        assert!(
            cached.is_some_and(|c| Arc::ptr_eq(c, frame)) && frame.pin_count() == 1,
            "failed to free frame: frame_id={}, pin_count={}",
            frame_id,
            frame.pin_count()
        );

        inner.frames.remove(&frame_id);
        frame.set_page_num(INVALID_PAGE_NUM);
        frame.unpin();
        frame.reset();
        inner.free_list.push(frame.clone());
    }

    /// Snapshot of all cached frames belonging to one pool, each pinned to
    /// protect the walker. Callers unpin (or free) every returned frame.
    pub fn find_list(&self, buffer_pool_id: PoolId) -> Vec<Arc<Frame>> {
        let inner = self.inner.lock();

        let mut frames = Vec::new();
        for (frame_id, frame) in inner.frames.iter_lru() {
            if frame_id.buffer_pool_id == buffer_pool_id {
                frame.pin();
                frames.push(frame.clone());
            }
        }
        frames
    }

    /// Scan from the LRU end, collect up to `count` purgeable frames, pin
    /// them, and run `purger` on each. Frames whose purger succeeds are
    /// freed; failures are unpinned and skipped. Returns the number freed.
    pub fn purge_frames<F>(&self, count: usize, mut purger: F) -> usize
    where
        F: FnMut(&Arc<Frame>) -> Result<()>,
    {
        let count = count.max(1);
        let mut inner = self.inner.lock();

        let mut candidates = Vec::with_capacity(count);
        for (_, frame) in inner.frames.iter_lru() {
            if frame.can_purge() {
                frame.pin();
                candidates.push(frame.clone());
                if candidates.len() >= count {
                    break;
                }
            }
        }
        info!("purge frames found {} candidates", candidates.len());

        let mut freed = 0;
        for frame in candidates {
            match purger(&frame) {
                Ok(()) => {
                    Self::free_internal(&mut inner, frame.frame_id(), &frame);
                    freed += 1;
                }
                Err(e) => {
                    frame.unpin();
                    warn!(
                        "failed to purge frame, frame_id={}: {}",
                        frame.frame_id(),
                        e
                    );
                }
            }
        }
        info!("purge frames done, freed={}", freed);
        freed
    }

    /// Number of frames currently caching pages
    pub fn frame_num(&self) -> usize {
        self.inner.lock().frames.len()
    }

    /// Configured capacity of the frame pool
    pub fn total_frame_num(&self) -> usize {
        self.inner.lock().capacity
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_zero_capacity_rejected() {
        assert!(matches!(FrameManager::new(0), Err(DbError::NoMemPool)));
    }

    #[test]
    fn test_alloc_get_free_cycle() {
        let manager = FrameManager::new(4).unwrap();

        let frame = manager.alloc(1, 10).unwrap();
        assert_eq!(frame.pin_count(), 1);
        assert_eq!(manager.frame_num(), 1);

        let hit = manager.get(1, 10).unwrap();
        assert!(Arc::ptr_eq(&frame, &hit));
        assert_eq!(hit.pin_count(), 2);
        hit.unpin();

        assert!(manager.get(1, 11).is_none());

        manager.free(frame.frame_id(), &frame).unwrap();
        assert_eq!(manager.frame_num(), 0);
        assert!(manager.get(1, 10).is_none());
    }

    #[test]
    fn test_alloc_exhaustion() {
        let manager = FrameManager::new(2).unwrap();

        let f1 = manager.alloc(1, 1).unwrap();
        let _f2 = manager.alloc(1, 2).unwrap();
        assert!(manager.alloc(1, 3).is_none());
        assert_eq!(manager.total_frame_num(), 2);

        // Freeing makes room again
        manager.free(f1.frame_id(), &f1).unwrap();
        assert!(manager.alloc(1, 3).is_some());
    }

    #[test]
    fn test_purge_skips_pinned_frames() {
        let manager = FrameManager::new(3).unwrap();

        let pinned = manager.alloc(1, 1).unwrap();
        let unpinned = manager.alloc(1, 2).unwrap();
        unpinned.unpin();

        let freed = manager.purge_frames(2, |_| Ok(()));
        assert_eq!(freed, 1);
        assert_eq!(manager.frame_num(), 1);
        assert_eq!(pinned.pin_count(), 1);
    }

    #[test]
    fn test_purge_selects_lru_victim() {
        let manager = FrameManager::new(3).unwrap();

        for page_num in 1..=3 {
            let frame = manager.alloc(1, page_num).unwrap();
            frame.unpin();
        }
        // Touch page 1 so page 2 becomes the LRU entry
        manager.get(1, 1).unwrap().unpin();

        let mut purged = Vec::new();
        manager.purge_frames(1, |frame| {
            purged.push(frame.frame_id().page_num);
            Ok(())
        });
        assert_eq!(purged, vec![2]);
    }

    #[test]
    fn test_purge_failure_keeps_frame() {
        let manager = FrameManager::new(2).unwrap();
        let frame = manager.alloc(1, 1).unwrap();
        frame.unpin();

        let freed = manager.purge_frames(1, |_| Err(DbError::Internal("nope".to_string())));
        assert_eq!(freed, 0);
        assert_eq!(manager.frame_num(), 1);
        assert!(frame.can_purge());
    }

    #[test]
    fn test_find_list_pins_matching_frames() {
        let manager = FrameManager::new(4).unwrap();
        manager.alloc(1, 1).unwrap().unpin();
        manager.alloc(1, 2).unwrap().unpin();
        manager.alloc(2, 1).unwrap().unpin();

        let list = manager.find_list(1);
        assert_eq!(list.len(), 2);
        for frame in &list {
            assert_eq!(frame.buffer_pool_id(), 1);
            assert_eq!(frame.pin_count(), 1);
            frame.unpin();
        }
    }
}
