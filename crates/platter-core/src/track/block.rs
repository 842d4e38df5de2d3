//! Block-structured PCM store
//!
//! Audio arrives from the importer pipe in arbitrary byte runs and is laid
//! down into fixed-size blocks, each allocated individually so its address
//! never moves as the track grows. Alongside the PCM every block carries
//! two parallel meter arrays at coarser resolutions.
//!
//! Concurrency works by publication: the ingest pump (holding the track
//! lock) writes PCM and meter bytes first and Release-stores the committed
//! length last; the playback thread Acquire-loads the length and reads
//! anything below it without a lock. Samples below the committed length
//! are never written again until the store is rewound for a new import,
//! which moves the length back to zero before any byte is reused.

use std::alloc::{alloc_zeroed, dealloc, Layout};
use std::cell::UnsafeCell;
use std::ptr::{self, NonNull};
use std::sync::atomic::{AtomicPtr, AtomicU8, AtomicUsize, Ordering};

use super::error::{TrackError, TrackResult};
use super::meter::Meters;
use crate::types::{
    BLOCK_PCM_BYTES, SAMPLE_BYTES, TRACK_BLOCK_SAMPLES, TRACK_CHANNELS, TRACK_OVERVIEW_RES,
    TRACK_PPM_RES,
};

/// Interleaved shorts per block
const BLOCK_SHORTS: usize = TRACK_BLOCK_SAMPLES * TRACK_CHANNELS;
/// PPM bucket count per block
const PPM_BUCKETS: usize = TRACK_BLOCK_SAMPLES / TRACK_PPM_RES;
/// Overview bucket count per block
const OVERVIEW_BUCKETS: usize = TRACK_BLOCK_SAMPLES / TRACK_OVERVIEW_RES;

/// One fixed-capacity unit of PCM plus its parallel meter arrays.
///
/// PCM cells sit in `UnsafeCell` because the pump writes them through a
/// shared reference; the committed-length protocol above keeps writers and
/// readers on disjoint cells. Meter bytes are relaxed atomics instead: the
/// bucket at the commit frontier is rewritten for every sample while a
/// display may be reading it, and last-writer-wins is the intended
/// semantics there.
#[repr(C)]
struct Block {
    pcm: [UnsafeCell<i16>; BLOCK_SHORTS],
    ppm: [AtomicU8; PPM_BUCKETS],
    overview: [AtomicU8; OVERVIEW_BUCKETS],
}

// SAFETY: shared access to the PCM cells is disciplined by the
// committed-length publication described in the module docs.
unsafe impl Sync for Block {}

impl Block {
    fn base(&self) -> *mut i16 {
        UnsafeCell::raw_get(self.pcm.as_ptr())
    }

    /// Read one stereo sample.
    ///
    /// # Safety
    /// `index` must be below the committed length, or the caller must be
    /// the sole writer reading back its own uncommitted cells.
    unsafe fn sample(&self, index: usize) -> (i16, i16) {
        let p = self.base().add(index * TRACK_CHANNELS);
        (ptr::read(p), ptr::read(p.add(1)))
    }
}

fn alloc_block() -> Option<NonNull<Block>> {
    // All-zero is a valid Block: silent PCM, zeroed meters. Going through
    // the allocator directly keeps allocation failure reportable and
    // avoids materialising 128 KiB on the stack.
    let ptr = unsafe { alloc_zeroed(Layout::new::<Block>()) };
    NonNull::new(ptr.cast())
}

unsafe fn free_block(block: NonNull<Block>) {
    dealloc(block.as_ptr().cast(), Layout::new::<Block>());
}

/// Append-only store of heap-allocated blocks with stable addresses.
///
/// The spine is a fixed array of pointers sized at the block limit, so a
/// published block index stays valid for the lifetime of the store. Only
/// the ingest pump appends (under the track lock); readers index it
/// lock-free below the Acquire-loaded committed length.
pub(super) struct BlockStore {
    slots: Box<[AtomicPtr<Block>]>,
    count: AtomicUsize,
    length: AtomicUsize,
}

impl BlockStore {
    pub(super) fn new(max_blocks: usize) -> Self {
        let slots = (0..max_blocks)
            .map(|_| AtomicPtr::new(ptr::null_mut()))
            .collect();
        Self {
            slots,
            count: AtomicUsize::new(0),
            length: AtomicUsize::new(0),
        }
    }

    /// Committed stereo samples, safe to read concurrently with ingest.
    pub(super) fn length(&self) -> usize {
        self.length.load(Ordering::Acquire)
    }

    /// Blocks allocated so far.
    pub(super) fn block_count(&self) -> usize {
        self.count.load(Ordering::Relaxed)
    }

    /// Move the commit frontier back to zero for a fresh import.
    ///
    /// Allocated blocks are kept and logically overwritten; readers that
    /// Acquire the new length never index into stale samples.
    pub(super) fn rewind(&self) {
        self.length.store(0, Ordering::Release);
    }

    fn block(&self, index: usize) -> &Block {
        // SAFETY: callers only pass indices below the allocated count, and
        // allocated slots hold valid blocks until `clear`.
        unsafe { &*self.slots[index].load(Ordering::Relaxed) }
    }

    /// Writable byte window starting at the cursor inside the current
    /// block, allocating the next block when the cursor sits at the end of
    /// the last one. The window never spans a block boundary.
    ///
    /// # Safety
    /// The caller must be the sole writer (track lock held). `bytes` is
    /// the current write cursor; every byte at or past it is unpublished.
    pub(super) unsafe fn writable_region(&self, bytes: usize) -> TrackResult<&mut [u8]> {
        let index = bytes / BLOCK_PCM_BYTES;
        if index == self.block_count() {
            self.grow(index)?;
        }

        let fill = bytes % BLOCK_PCM_BYTES;
        let base = self.block(index).base().cast::<u8>();
        Ok(std::slice::from_raw_parts_mut(
            base.add(fill),
            BLOCK_PCM_BYTES - fill,
        ))
    }

    fn grow(&self, count: usize) -> TrackResult<()> {
        if count == self.slots.len() {
            log::warn!("maximum track length reached ({count} blocks)");
            return Err(TrackError::TrackFull);
        }

        let block = alloc_block().ok_or(TrackError::OutOfMemory)?;
        self.slots[count].store(block.as_ptr(), Ordering::Relaxed);
        self.count.store(count + 1, Ordering::Relaxed);

        log::debug!(
            "allocated track block ({} blocks, {} KiB PCM)",
            count + 1,
            (count + 1) * BLOCK_PCM_BYTES / 1024
        );
        Ok(())
    }

    /// Publish every whole sample below the `bytes` cursor, metering each
    /// newly completed one in order. A trailing partial sample stays
    /// unpublished until its remaining bytes arrive.
    ///
    /// # Safety
    /// The caller must be the sole writer and must already have written
    /// the bytes below the cursor via [`writable_region`].
    ///
    /// [`writable_region`]: Self::writable_region
    pub(super) unsafe fn commit(&self, bytes: usize, meters: &mut Meters) {
        let committed = self.length.load(Ordering::Relaxed);
        let target = bytes / SAMPLE_BYTES;
        if target == committed {
            return;
        }

        // A writable region never spans a block boundary and samples never
        // straddle one, so one commit stays inside one block.
        let block = self.block(committed / TRACK_BLOCK_SAMPLES);
        debug_assert_eq!(
            committed / TRACK_BLOCK_SAMPLES,
            (target - 1) / TRACK_BLOCK_SAMPLES
        );

        for index in committed..target {
            let fill = index % TRACK_BLOCK_SAMPLES;
            let (left, right) = block.sample(fill);
            let (ppm, overview) = meters.update(left, right);
            block.ppm[fill / TRACK_PPM_RES].store(ppm, Ordering::Relaxed);
            block.overview[fill / TRACK_OVERVIEW_RES].store(overview, Ordering::Relaxed);
        }

        self.length.store(target, Ordering::Release);
    }

    /// Copy committed interleaved samples starting at stereo sample
    /// `offset` into `out`, returning how many stereo samples were copied.
    /// Lock-free; clamped to the committed prefix.
    pub(super) fn read(&self, offset: usize, out: &mut [i16]) -> usize {
        let committed = self.length();
        if offset >= committed {
            return 0;
        }

        let n = (out.len() / TRACK_CHANNELS).min(committed - offset);
        let mut copied = 0;
        while copied < n {
            let sample = offset + copied;
            let block = self.block(sample / TRACK_BLOCK_SAMPLES);
            let fill = sample % TRACK_BLOCK_SAMPLES;
            let run = (n - copied).min(TRACK_BLOCK_SAMPLES - fill);
            // SAFETY: the whole run lies below the committed length
            // Acquire-loaded above, so these cells are immutable.
            unsafe {
                ptr::copy_nonoverlapping(
                    block.base().add(fill * TRACK_CHANNELS).cast_const(),
                    out.as_mut_ptr().add(copied * TRACK_CHANNELS),
                    run * TRACK_CHANNELS,
                );
            }
            copied += run;
        }
        n
    }

    /// PPM buckets covering at least one committed sample.
    pub(super) fn ppm_buckets(&self) -> usize {
        self.length().div_ceil(TRACK_PPM_RES)
    }

    /// Overview buckets covering at least one committed sample.
    pub(super) fn overview_buckets(&self) -> usize {
        self.length().div_ceil(TRACK_OVERVIEW_RES)
    }

    /// Fast-meter byte for a committed bucket.
    pub(super) fn ppm(&self, bucket: usize) -> Option<u8> {
        if bucket >= self.ppm_buckets() {
            return None;
        }
        let block = self.block(bucket / PPM_BUCKETS);
        Some(block.ppm[bucket % PPM_BUCKETS].load(Ordering::Relaxed))
    }

    /// Overview byte for a committed bucket.
    pub(super) fn overview(&self, bucket: usize) -> Option<u8> {
        if bucket >= self.overview_buckets() {
            return None;
        }
        let block = self.block(bucket / OVERVIEW_BUCKETS);
        Some(block.overview[bucket % OVERVIEW_BUCKETS].load(Ordering::Relaxed))
    }

    /// Free every block. Exclusive access guarantees no reader still holds
    /// the spine.
    pub(super) fn clear(&mut self) {
        for slot in self.slots.iter() {
            if let Some(block) = NonNull::new(slot.swap(ptr::null_mut(), Ordering::Relaxed)) {
                // SAFETY: the pointer came from `alloc_block` and is
                // removed from the spine before being freed.
                unsafe { free_block(block) };
            }
        }
        self.count.store(0, Ordering::Relaxed);
        self.length.store(0, Ordering::Release);
    }
}

impl Drop for BlockStore {
    fn drop(&mut self) {
        self.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn feed(store: &BlockStore, bytes: &mut usize, meters: &mut Meters, mut data: &[u8]) {
        while !data.is_empty() {
            // SAFETY: tests are single-threaded writers.
            let region = unsafe { store.writable_region(*bytes).unwrap() };
            let n = region.len().min(data.len());
            region[..n].copy_from_slice(&data[..n]);
            *bytes += n;
            unsafe { store.commit(*bytes, meters) };
            data = &data[n..];
        }
    }

    #[test]
    fn partial_sample_stays_uncommitted() {
        let store = BlockStore::new(4);
        let mut bytes = 0;
        let mut meters = Meters::new();

        feed(&store, &mut bytes, &mut meters, &[1, 0, 2, 0, 3]);
        assert_eq!(bytes, 5);
        assert_eq!(store.length(), 1);

        feed(&store, &mut bytes, &mut meters, &[0, 4, 0]);
        assert_eq!(bytes, 8);
        assert_eq!(store.length(), 2);

        let mut out = [0i16; 4];
        assert_eq!(store.read(0, &mut out), 2);
        assert_eq!(out, [1, 2, 3, 4]);
    }

    #[test]
    fn regions_never_span_blocks() {
        let store = BlockStore::new(4);
        let region = unsafe { store.writable_region(0).unwrap() };
        assert_eq!(region.len(), BLOCK_PCM_BYTES);

        let region = unsafe { store.writable_region(BLOCK_PCM_BYTES - 4).unwrap() };
        assert_eq!(region.len(), 4);
        assert_eq!(store.block_count(), 1);

        let region = unsafe { store.writable_region(BLOCK_PCM_BYTES).unwrap() };
        assert_eq!(region.len(), BLOCK_PCM_BYTES);
        assert_eq!(store.block_count(), 2);
    }

    #[test]
    fn block_limit_is_enforced() {
        let store = BlockStore::new(1);
        unsafe { store.writable_region(0).unwrap() };
        let err = unsafe { store.writable_region(BLOCK_PCM_BYTES).unwrap_err() };
        assert!(matches!(err, TrackError::TrackFull));
    }

    #[test]
    fn reads_cross_block_boundaries() {
        let store = BlockStore::new(2);
        let mut bytes = 0;
        let mut meters = Meters::new();

        let samples = TRACK_BLOCK_SAMPLES + 16;
        let pcm: Vec<i16> = (0..samples * TRACK_CHANNELS)
            .map(|i| (i % 251) as i16)
            .collect();
        feed(&store, &mut bytes, &mut meters, bytemuck::cast_slice(&pcm));

        assert_eq!(store.length(), samples);
        assert_eq!(store.block_count(), 2);

        // Read a window straddling the boundary.
        let start = TRACK_BLOCK_SAMPLES - 8;
        let mut out = vec![0i16; 32 * TRACK_CHANNELS];
        assert_eq!(store.read(start, &mut out), 16 + 8);
        let expected = &pcm[start * TRACK_CHANNELS..][..24 * TRACK_CHANNELS];
        assert_eq!(&out[..24 * TRACK_CHANNELS], expected);
    }

    #[test]
    fn rewind_reuses_blocks() {
        let store = BlockStore::new(2);
        let mut bytes = 0;
        let mut meters = Meters::new();

        feed(&store, &mut bytes, &mut meters, &[0x55; 64]);
        assert_eq!(store.length(), 16);
        let allocated = store.block_count();

        store.rewind();
        assert_eq!(store.length(), 0);
        assert_eq!(store.block_count(), allocated);

        let mut bytes = 0;
        let mut meters = Meters::new();
        feed(&store, &mut bytes, &mut meters, &[0u8; 8]);
        assert_eq!(store.length(), 2);

        let mut out = [0x7fi16; 4];
        assert_eq!(store.read(0, &mut out), 2);
        assert_eq!(out, [0, 0, 0, 0]);
    }

    #[test]
    fn clear_frees_everything() {
        let mut store = BlockStore::new(4);
        let mut bytes = 0;
        let mut meters = Meters::new();
        feed(&store, &mut bytes, &mut meters, &[1; 4096]);

        store.clear();
        assert_eq!(store.length(), 0);
        assert_eq!(store.block_count(), 0);
        let mut out = [0i16; 2];
        assert_eq!(store.read(0, &mut out), 0);
    }

    #[test]
    fn chunking_does_not_change_output() {
        // Any byte-granular chopping of a stream must commit the same PCM
        // and the same meter bytes as feeding it in one go.
        let samples = TRACK_BLOCK_SAMPLES + 300;
        let pcm: Vec<i16> = {
            // Small deterministic generator, loud enough to move both meters.
            let mut seed = 0x2545_f491u32;
            (0..samples * TRACK_CHANNELS)
                .map(|_| {
                    seed = seed.wrapping_mul(1_664_525).wrapping_add(1_013_904_223);
                    (seed >> 16) as i16
                })
                .collect()
        };
        let stream: &[u8] = bytemuck::cast_slice(&pcm);

        let whole = BlockStore::new(4);
        let mut bytes = 0;
        let mut meters = Meters::new();
        feed(&whole, &mut bytes, &mut meters, stream);

        let chopped = BlockStore::new(4);
        let mut bytes = 0;
        let mut meters = Meters::new();
        let mut rest = stream;
        let mut step = 1;
        while !rest.is_empty() {
            let n = step.min(rest.len());
            feed(&chopped, &mut bytes, &mut meters, &rest[..n]);
            rest = &rest[n..];
            step = step % 7 + 1; // 1..=7 byte chunks, never sample aligned
        }

        assert_eq!(whole.length(), chopped.length());
        let mut a = vec![0i16; samples * TRACK_CHANNELS];
        let mut b = vec![0i16; samples * TRACK_CHANNELS];
        assert_eq!(whole.read(0, &mut a), samples);
        assert_eq!(chopped.read(0, &mut b), samples);
        assert_eq!(a, b);

        assert_eq!(whole.ppm_buckets(), chopped.ppm_buckets());
        for bucket in 0..whole.ppm_buckets() {
            assert_eq!(whole.ppm(bucket), chopped.ppm(bucket), "ppm bucket {bucket}");
        }
        assert_eq!(whole.overview_buckets(), chopped.overview_buckets());
        for bucket in 0..whole.overview_buckets() {
            assert_eq!(whole.overview(bucket), chopped.overview(bucket));
        }
    }
}
