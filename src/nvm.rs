use std::fs::OpenOptions;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use ahash::AHashMap as HashMap;
use log::{debug, warn};
use memmap2::MmapMut;
use parking_lot::Mutex;

use crate::config::{CACHE_LINE, Config};
use crate::errors::{Result, ZurvanError};

const POOL_MAGIC: u64 = 0x5A56_4E50_4F4F_4C31; // "ZVNPOOL1"

const ROOT_SIZE: u64 = 4096;
const SEG_TABLE_OFF: u64 = ROOT_SIZE;
const SEG_DESC_SIZE: u64 = 64;
pub const SEG_COUNT: usize = 64;
const HEAP_BASE: u64 = SEG_TABLE_OFF + SEG_COUNT as u64 * SEG_DESC_SIZE;

// Root block field offsets.
const ROOT_MAGIC: u64 = 0;
const ROOT_GEN_ID: u64 = 8;
const ROOT_CLEAN: u64 = 16;
const ROOT_LAST_CKPT: u64 = 24;
const ROOT_CLOCK: u64 = 32;
const ROOT_HEAP_TAIL: u64 = 40;

// Segment descriptor field offsets.
const SEG_KIND: u64 = 0;
const SEG_OWNER: u64 = 4;
const SEG_BUF_OFF: u64 = 8;
const SEG_SIZE: u64 = 16;
const SEG_HEAD_CNT: u64 = 24;
const SEG_TAIL_CNT: u64 = 32;

/// Heap object header: size then live flag, both u64, ahead of the payload.
const OBJ_HDR: u64 = 16;

/// Durable log segment kinds recorded in the segment table. The table is
/// the sole discovery mechanism recovery has; it replaces pointer-based
/// segment lists with stable offsets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum SegmentKind {
    Free = 0,
    OpLog = 1,
    CkptLog = 2,
}

impl SegmentKind {
    fn from_u32(raw: u32) -> SegmentKind {
        match raw {
            1 => SegmentKind::OpLog,
            2 => SegmentKind::CkptLog,
            _ => SegmentKind::Free,
        }
    }
}

/// A snapshot of one segment descriptor, used during recovery discovery.
#[derive(Debug, Clone)]
pub struct SegmentInfo {
    pub slot: usize,
    pub kind: SegmentKind,
    pub owner: u32,
    pub buf_off: u64,
    pub size: u64,
    pub head_cnt: u64,
    pub tail_cnt: u64,
}

/// Live allocation accounting, observable by tests to prove reclaimed
/// versions actually return their memory.
#[derive(Debug, Default)]
pub struct AllocStats {
    pub live_objects: AtomicU64,
    pub live_bytes: AtomicU64,
}

impl AllocStats {
    pub fn live_objects(&self) -> u64 {
        self.live_objects.load(Ordering::Relaxed)
    }

    pub fn live_bytes(&self) -> u64 {
        self.live_bytes.load(Ordering::Relaxed)
    }
}

/// The byte-addressable persistent pool backing the whole engine: a root
/// block, a fixed segment table for the durable logs, and a bump-allocated
/// object heap, all inside one file-backed mapping.
///
/// `persist` flushes a byte range and acts as the cacheline-flush + fence
/// pair of real persistent memory; DRAM visibility and durability remain
/// separate concerns for callers.
pub struct NvPool {
    map: Mutex<MmapMut>,
    pool_size: u64,
    stats: Arc<AllocStats>,
    free_lists: Mutex<HashMap<u64, Vec<u64>>>,
    // Serializes heap-tail bumps; the map lock alone cannot make the
    // read-modify-write of the tail atomic.
    heap_lock: Mutex<()>,
}

impl NvPool {
    /// Opens or creates the pool file. Returns the pool and whether the
    /// previous instance failed to shut down cleanly (recovery required).
    pub fn open(config: &Config) -> Result<(Arc<NvPool>, bool)> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&config.pool_path)?;
        file.set_len(config.pool_size as u64)?;
        let map = unsafe { MmapMut::map_mut(&file)? };

        let pool = NvPool {
            map: Mutex::new(map),
            pool_size: config.pool_size as u64,
            stats: Arc::new(AllocStats::default()),
            free_lists: Mutex::new(HashMap::new()),
            heap_lock: Mutex::new(()),
        };

        let magic = pool.get_u64(ROOT_MAGIC);
        let need_recovery = if magic == POOL_MAGIC {
            let dirty = pool.get_u64(ROOT_CLEAN) == 0;
            debug!(
                "pool reopened: gen_id={} dirty={}",
                pool.get_u64(ROOT_GEN_ID),
                dirty
            );
            dirty
        } else {
            if magic != 0 {
                warn!("pool magic mismatch ({magic:#x}); reinitializing");
            }
            pool.format();
            false
        };

        // The pool is in use from here on; a crash before shutdown() must
        // trip recovery on the next open.
        pool.put_u64(ROOT_CLEAN, 0);
        pool.put_u64(ROOT_GEN_ID, pool.get_u64(ROOT_GEN_ID) + 1);
        pool.persist(ROOT_MAGIC, ROOT_SIZE as usize);

        Ok((Arc::new(pool), need_recovery))
    }

    fn format(&self) {
        {
            let mut map = self.map.lock();
            map[..(HEAP_BASE as usize)].fill(0);
        }
        self.put_u64(ROOT_MAGIC, POOL_MAGIC);
        self.put_u64(ROOT_GEN_ID, 0);
        self.put_u64(ROOT_CLEAN, 1);
        self.put_u64(ROOT_LAST_CKPT, 0);
        self.put_u64(ROOT_CLOCK, 0);
        self.put_u64(ROOT_HEAP_TAIL, HEAP_BASE);
        self.persist(0, HEAP_BASE as usize);
        debug!("pool formatted: {} bytes, heap base {HEAP_BASE}", self.pool_size);
    }

    pub fn stats(&self) -> Arc<AllocStats> {
        Arc::clone(&self.stats)
    }

    pub fn gen_id(&self) -> u64 {
        self.get_u64(ROOT_GEN_ID)
    }

    pub fn last_ckpt_clk(&self) -> u64 {
        self.get_u64(ROOT_LAST_CKPT)
    }

    pub fn set_last_ckpt_clk(&self, clk: u64) {
        self.put_u64(ROOT_LAST_CKPT, clk);
        self.persist(ROOT_LAST_CKPT, 8);
    }

    pub fn persisted_clock(&self) -> u64 {
        self.get_u64(ROOT_CLOCK)
    }

    pub fn set_persisted_clock(&self, clk: u64) {
        self.put_u64(ROOT_CLOCK, clk);
        self.persist(ROOT_CLOCK, 8);
    }

    /// Marks the pool cleanly closed. Only `shutdown()` calls this; a drop
    /// without it leaves the dirty flag set and recovery runs on reopen.
    pub fn mark_clean(&self) {
        self.put_u64(ROOT_CLEAN, 1);
        self.persist(ROOT_CLEAN, 8);
    }

    // ---- raw access -----------------------------------------------------

    pub fn get_u64(&self, off: u64) -> u64 {
        let map = self.map.lock();
        let off = off as usize;
        u64::from_le_bytes(map[off..off + 8].try_into().unwrap_or([0; 8]))
    }

    pub fn put_u64(&self, off: u64, value: u64) {
        let mut map = self.map.lock();
        let off = off as usize;
        map[off..off + 8].copy_from_slice(&value.to_le_bytes());
    }

    pub fn get_u32(&self, off: u64) -> u32 {
        let map = self.map.lock();
        let off = off as usize;
        u32::from_le_bytes(map[off..off + 4].try_into().unwrap_or([0; 4]))
    }

    pub fn put_u32(&self, off: u64, value: u32) {
        let mut map = self.map.lock();
        let off = off as usize;
        map[off..off + 4].copy_from_slice(&value.to_le_bytes());
    }

    pub fn read_bytes(&self, off: u64, len: usize) -> Vec<u8> {
        let map = self.map.lock();
        let off = off as usize;
        map[off..off + len].to_vec()
    }

    pub fn write_bytes(&self, off: u64, bytes: &[u8]) {
        let mut map = self.map.lock();
        let off = off as usize;
        map[off..off + bytes.len()].copy_from_slice(bytes);
    }

    /// Flush-and-fence for a byte range. Failures are logged, not fatal:
    /// the data remains DRAM-visible and the msync retries on the next
    /// persist of an overlapping range.
    pub fn persist(&self, off: u64, len: usize) {
        let map = self.map.lock();
        if let Err(e) = map.flush_range(off as usize, len) {
            warn!("pool persist failed at {off}+{len}: {e}");
        }
    }

    // ---- object heap ----------------------------------------------------

    /// Allocates a cacheline-aligned object of `size` payload bytes and
    /// returns the payload offset (the stable object handle). Reuses an
    /// exact-size freed slot when one exists.
    pub fn alloc(&self, size: usize) -> Result<u64> {
        let _bump = self.heap_lock.lock();
        let aligned = align_up(size as u64 + OBJ_HDR, CACHE_LINE as u64);
        let handle = {
            let mut free = self.free_lists.lock();
            free.get_mut(&aligned).and_then(|slots| slots.pop())
        };
        let handle = match handle {
            Some(h) => h,
            None => {
                let tail = self.get_u64(ROOT_HEAP_TAIL);
                if tail + aligned > self.pool_size {
                    return Err(ZurvanError::PoolExhausted);
                }
                self.put_u64(ROOT_HEAP_TAIL, tail + aligned);
                tail + OBJ_HDR
            }
        };
        self.put_u64(handle - OBJ_HDR, size as u64);
        self.put_u64(handle - 8, 1); // live
        self.stats.live_objects.fetch_add(1, Ordering::Relaxed);
        self.stats.live_bytes.fetch_add(size as u64, Ordering::Relaxed);
        Ok(handle)
    }

    /// Returns an object's slot to the free list. Callers must have proven
    /// (via grace periods) that no reader can still reach the handle.
    pub fn free(&self, handle: u64) {
        let size = self.get_u64(handle - OBJ_HDR);
        let aligned = align_up(size + OBJ_HDR, CACHE_LINE as u64);
        self.put_u64(handle - 8, 0);
        self.free_lists
            .lock()
            .entry(aligned)
            .or_default()
            .push(handle);
        self.stats.live_objects.fetch_sub(1, Ordering::Relaxed);
        self.stats.live_bytes.fetch_sub(size, Ordering::Relaxed);
    }

    pub fn object_size(&self, handle: u64) -> usize {
        self.get_u64(handle - OBJ_HDR) as usize
    }

    pub fn object_is_live(&self, handle: u64) -> bool {
        handle >= HEAP_BASE + OBJ_HDR
            && handle < self.pool_size
            && self.get_u64(handle - 8) == 1
    }

    /// Persists an object's header and payload; called when a commit makes
    /// a freshly allocated object reachable.
    pub fn persist_object(&self, handle: u64) {
        let size = self.get_u64(handle - OBJ_HDR) as usize;
        self.persist(handle - OBJ_HDR, size + OBJ_HDR as usize);
        self.persist(ROOT_HEAP_TAIL, 8);
    }

    // ---- segment table --------------------------------------------------

    fn seg_off(slot: usize) -> u64 {
        SEG_TABLE_OFF + slot as u64 * SEG_DESC_SIZE
    }

    /// Claims a free descriptor slot and carves a log buffer for it out of
    /// the heap. The descriptor is persisted before the buffer is used so
    /// recovery always discovers the segment.
    pub fn acquire_segment(&self, kind: SegmentKind, owner: u32, size: u64) -> Result<usize> {
        let _bump = self.heap_lock.lock();
        for slot in 0..SEG_COUNT {
            let off = Self::seg_off(slot);
            if SegmentKind::from_u32(self.get_u32(off + SEG_KIND)) != SegmentKind::Free {
                continue;
            }
            // Reuse a previously released buffer of the same size if the
            // slot still records one.
            let existing_off = self.get_u64(off + SEG_BUF_OFF);
            let existing_size = self.get_u64(off + SEG_SIZE);
            let buf_off = if existing_off != 0 && existing_size == size {
                existing_off
            } else {
                let tail = self.get_u64(ROOT_HEAP_TAIL);
                let aligned = align_up(tail, CACHE_LINE as u64);
                if aligned + size > self.pool_size {
                    return Err(ZurvanError::PoolExhausted);
                }
                self.put_u64(ROOT_HEAP_TAIL, aligned + size);
                aligned
            };
            self.put_u32(off + SEG_OWNER, owner);
            self.put_u64(off + SEG_BUF_OFF, buf_off);
            self.put_u64(off + SEG_SIZE, size);
            self.put_u64(off + SEG_HEAD_CNT, 0);
            self.put_u64(off + SEG_TAIL_CNT, 0);
            self.put_u32(off + SEG_KIND, kind as u32);
            self.persist(off, SEG_DESC_SIZE as usize);
            self.persist(ROOT_HEAP_TAIL, 8);
            debug!("segment {slot} acquired: {kind:?} owner={owner} off={buf_off} size={size}");
            return Ok(slot);
        }
        Err(ZurvanError::PoolExhausted)
    }

    /// Releases a drained segment's slot; the buffer offset stays recorded
    /// for reuse.
    pub fn release_segment(&self, slot: usize) {
        let off = Self::seg_off(slot);
        self.put_u32(off + SEG_KIND, SegmentKind::Free as u32);
        self.put_u64(off + SEG_HEAD_CNT, 0);
        self.put_u64(off + SEG_TAIL_CNT, 0);
        self.persist(off, SEG_DESC_SIZE as usize);
    }

    pub fn segment_info(&self, slot: usize) -> SegmentInfo {
        let off = Self::seg_off(slot);
        SegmentInfo {
            slot,
            kind: SegmentKind::from_u32(self.get_u32(off + SEG_KIND)),
            owner: self.get_u32(off + SEG_OWNER),
            buf_off: self.get_u64(off + SEG_BUF_OFF),
            size: self.get_u64(off + SEG_SIZE),
            head_cnt: self.get_u64(off + SEG_HEAD_CNT),
            tail_cnt: self.get_u64(off + SEG_TAIL_CNT),
        }
    }

    /// All in-use segments, for recovery discovery.
    pub fn live_segments(&self) -> Vec<SegmentInfo> {
        (0..SEG_COUNT)
            .map(|slot| self.segment_info(slot))
            .filter(|info| info.kind != SegmentKind::Free)
            .collect()
    }

    /// Publishes a segment's durable counters. This is the second phase of
    /// the log's crash-consistency protocol; the data range must already be
    /// persisted when this runs.
    pub fn publish_segment_counters(&self, slot: usize, head_cnt: u64, tail_cnt: u64) {
        let off = Self::seg_off(slot);
        self.put_u64(off + SEG_HEAD_CNT, head_cnt);
        self.put_u64(off + SEG_TAIL_CNT, tail_cnt);
        self.persist(off + SEG_HEAD_CNT, 16);
    }
}

pub fn align_up(value: u64, align: u64) -> u64 {
    (value + align - 1) & !(align - 1)
}
