//! Track ingestion and storage
//!
//! A [`Track`] is one deck's worth of audio, loaded (or loading) from an
//! external importer process:
//! - block store: append-only PCM plus PPM/overview meter data
//! - importer: the decoder child and its non-blocking stdout pipe
//! - ingest pump: drains the pipe into the store whenever the host poll
//!   loop reports the descriptor readable
//!
//! The playback thread reads committed samples and meters without taking
//! the track lock; everything else (counters, the child, the poll-slot
//! reference) is guarded by one mutex per track.

mod block;
mod error;
mod importer;
mod meter;

pub use error::{TrackError, TrackResult};

use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

use arc_swap::ArcSwapOption;

use crate::rig::{PollSlot, Rig};
use crate::types::{
    SAMPLE_BYTES, TRACK_BLOCK_SAMPLES, TRACK_MAX_BLOCKS, TRACK_OVERVIEW_RES, TRACK_PPM_RES,
    TRACK_RATE,
};
use block::BlockStore;
use importer::Importer;
use meter::Meters;

/// Progress of one pump pass over the importer pipe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Progress {
    /// The pipe would block; more data is expected later
    Pending,
    /// The importer closed its end; the stream is complete
    Eof,
}

/// Mutable track state guarded by the track mutex.
struct TrackState {
    artist: Option<String>,
    title: Option<String>,
    /// Samples per second of the stored audio
    rate: u32,
    /// Raw bytes accepted from the pipe, including a trailing partial
    /// sample not yet committed
    bytes: usize,
    meters: Meters,
    /// Present exactly while an import is running
    import: Option<Importer>,
}

/// One deck's audio, streamed in from an external importer.
///
/// A track is shared between the controller, the host poll loop and the
/// playback thread. All methods take `&self` except [`clear`](Self::clear):
/// freeing block memory requires exclusive access, which is also what
/// guarantees no playback reader is left holding the store.
pub struct Track {
    /// Path of the importer executable, fixed at construction
    importer: PathBuf,
    store: BlockStore,
    /// Poll-slot reference, probed by `handle` without the lock
    slot: ArcSwapOption<PollSlot>,
    rig: Option<Arc<dyn Rig>>,
    inner: Mutex<TrackState>,
}

impl Track {
    /// Create an idle track that will decode through `importer_path`.
    pub fn new(importer_path: impl Into<PathBuf>) -> Self {
        Self::with_block_limit(importer_path, None, TRACK_MAX_BLOCKS)
    }

    /// Create an idle track wired to a host wake-up handle.
    pub fn with_rig(importer_path: impl Into<PathBuf>, rig: Arc<dyn Rig>) -> Self {
        Self::with_block_limit(importer_path, Some(rig), TRACK_MAX_BLOCKS)
    }

    fn with_block_limit(
        importer_path: impl Into<PathBuf>,
        rig: Option<Arc<dyn Rig>>,
        max_blocks: usize,
    ) -> Self {
        Self {
            importer: importer_path.into(),
            store: BlockStore::new(max_blocks),
            slot: ArcSwapOption::empty(),
            rig,
            inner: Mutex::new(TrackState {
                artist: None,
                title: None,
                rate: TRACK_RATE,
                bytes: 0,
                meters: Meters::new(),
                import: None,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, TrackState> {
        self.inner.lock().expect("track lock poisoned")
    }

    // --- Lifecycle ---

    /// Begin importing `path`, aborting any import in progress.
    ///
    /// Counters and meters restart from zero; already-allocated blocks are
    /// kept and overwritten by the new stream. On success the rig is
    /// awakened so the poll loop picks up the new descriptor. On failure
    /// the track is left idle.
    pub fn import(&self, path: impl AsRef<Path>) -> TrackResult<()> {
        let path = path.as_ref();
        let mut state = self.lock();

        if let Some(running) = state.import.take() {
            running.abort();
        }

        let importer = Importer::start(&self.importer, path)?;

        state.bytes = 0;
        state.meters.reset();
        state.rate = TRACK_RATE;
        self.store.rewind();
        state.import = Some(importer);
        drop(state);

        if let Some(rig) = &self.rig {
            rig.awaken();
        }
        Ok(())
    }

    /// Arm the host's poll slot with the import pipe descriptor.
    ///
    /// Returns true when a descriptor was registered. The slot is owned by
    /// the host and must stay alive until the next [`handle`](Self::handle)
    /// call; the track only remembers a reference to it.
    pub fn poll_register(&self, slot: &Arc<PollSlot>) -> bool {
        let state = self.lock();
        match &state.import {
            Some(import) => {
                slot.arm(import.fd());
                self.slot.store(Some(Arc::clone(slot)));
                true
            }
            None => {
                self.slot.store(None);
                false
            }
        }
    }

    /// Service the import pipe if the registered slot reports readiness.
    ///
    /// Only the thread that owns poll registration may call this; that
    /// thread is the only writer of the slot reference, which is why the
    /// readiness probe is safe without the track lock. With no slot or no
    /// ready events this returns without locking at all.
    pub fn handle(&self) {
        let slot = self.slot.load();
        let Some(slot) = slot.as_ref() else { return };
        if slot.revents() == 0 {
            return;
        }

        let mut state = self.lock();
        if state.import.is_none() {
            return;
        }

        match self.pump(&mut state) {
            Ok(Progress::Pending) => {}
            Ok(Progress::Eof) => {
                let import = state.import.take().expect("import checked above");
                import.stop();
            }
            Err(err) => {
                log::error!("import of track data failed: {err}");
                let import = state.import.take().expect("import checked above");
                import.stop();
            }
        }
    }

    /// Release everything the track holds: abort any import, free all
    /// blocks, forget the poll slot.
    pub fn clear(&mut self) {
        let state = match self.inner.get_mut() {
            Ok(state) => state,
            Err(poisoned) => poisoned.into_inner(),
        };
        if let Some(import) = state.import.take() {
            import.abort();
        }
        state.bytes = 0;
        state.meters.reset();
        self.store.clear();
        self.slot.store(None);
    }

    /// Drain the pipe until it would block, hits EOF, or fails.
    fn pump(&self, state: &mut TrackState) -> TrackResult<Progress> {
        loop {
            // SAFETY: we hold the track lock, so we are the sole writer,
            // and the cursor only covers unpublished bytes.
            let region = unsafe { self.store.writable_region(state.bytes)? };
            let import = state.import.as_mut().expect("pump without importer");

            match import.read(region) {
                Ok(0) => break,
                Ok(n) => {
                    state.bytes += n;
                    // SAFETY: sole writer as above; the bytes below the
                    // cursor were just written.
                    unsafe { self.store.commit(state.bytes, &mut state.meters) };
                }
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => {
                    return Ok(Progress::Pending);
                }
                Err(err) if err.kind() == io::ErrorKind::Interrupted => {}
                Err(err) => return Err(TrackError::Io(err)),
            }
        }

        let pcm_kb = self.store.block_count() * TRACK_BLOCK_SAMPLES * SAMPLE_BYTES / 1024;
        log::debug!(
            "track data complete: {} samples, {} KiB PCM, {} KiB PPM, {} KiB overview",
            self.store.length(),
            pcm_kb,
            pcm_kb / TRACK_PPM_RES,
            pcm_kb / TRACK_OVERVIEW_RES,
        );
        Ok(Progress::Eof)
    }

    // --- State queries ---

    /// Whether an importer child is currently attached.
    pub fn is_importing(&self) -> bool {
        self.lock().import.is_some()
    }

    /// Raw bytes accepted so far, including a trailing partial sample.
    pub fn bytes(&self) -> usize {
        self.lock().bytes
    }

    /// Sample rate of the stored audio.
    pub fn rate(&self) -> u32 {
        self.lock().rate
    }

    /// Path of the importer executable this track decodes through.
    pub fn importer_path(&self) -> &Path {
        &self.importer
    }

    // --- Metadata ---

    pub fn set_artist(&self, artist: impl Into<String>) {
        self.lock().artist = Some(artist.into());
    }

    pub fn artist(&self) -> Option<String> {
        self.lock().artist.clone()
    }

    pub fn set_title(&self, title: impl Into<String>) {
        self.lock().title = Some(title.into());
    }

    pub fn title(&self) -> Option<String> {
        self.lock().title.clone()
    }

    // --- Lock-free read path (playback thread) ---

    /// Committed stereo samples. Read with Acquire ordering: everything
    /// below this count is immutable and safe to read concurrently.
    pub fn length(&self) -> usize {
        self.store.length()
    }

    /// Copy committed interleaved samples starting at stereo sample
    /// `offset` into `out`; returns the number of stereo samples copied,
    /// clamped to the committed prefix.
    pub fn read(&self, offset: usize, out: &mut [i16]) -> usize {
        self.store.read(offset, out)
    }

    /// Blocks allocated so far.
    pub fn block_count(&self) -> usize {
        self.store.block_count()
    }

    /// Fast-meter buckets covering committed audio.
    pub fn ppm_buckets(&self) -> usize {
        self.store.ppm_buckets()
    }

    /// Fast-meter byte for a committed bucket.
    pub fn ppm(&self, bucket: usize) -> Option<u8> {
        self.store.ppm(bucket)
    }

    /// Overview buckets covering committed audio.
    pub fn overview_buckets(&self) -> usize {
        self.store.overview_buckets()
    }

    /// Overview byte for a committed bucket.
    pub fn overview(&self, bucket: usize) -> Option<u8> {
        self.store.overview(bucket)
    }
}

impl Drop for Track {
    fn drop(&mut self) {
        let state = match self.inner.get_mut() {
            Ok(state) => state,
            Err(poisoned) => poisoned.into_inner(),
        };
        if let Some(import) = state.import.take() {
            import.abort();
        }
    }
}
