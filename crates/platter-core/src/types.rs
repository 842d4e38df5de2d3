//! Canonical constants for the Platter core
//!
//! Everything in the ingest path is sized from these values. The importer
//! contract (raw interleaved stereo signed 16-bit PCM) is fixed, so the
//! constants here are compile-time rather than configuration.

/// Stereo throughout the core
pub const TRACK_CHANNELS: usize = 2;

/// System sample rate; the importer must emit PCM at this rate
pub const TRACK_RATE: u32 = 44_100;

/// Stereo samples per block
pub const TRACK_BLOCK_SAMPLES: usize = 1 << 15;

/// Audio samples per fast-meter (PPM) bucket
pub const TRACK_PPM_RES: usize = 64;

/// Audio samples per overview bucket
pub const TRACK_OVERVIEW_RES: usize = 2048;

/// Upper bound on blocks per track; caps a track at roughly 101 minutes
/// of audio (about 1 GiB of PCM) at [`TRACK_RATE`]
pub const TRACK_MAX_BLOCKS: usize = 8192;

/// Bytes per interleaved stereo 16-bit sample
pub const SAMPLE_BYTES: usize = TRACK_CHANNELS * std::mem::size_of::<i16>();

/// PCM bytes per block
pub const BLOCK_PCM_BYTES: usize = TRACK_BLOCK_SAMPLES * SAMPLE_BYTES;

// Meter buckets must tile a block exactly.
const _: () = assert!(TRACK_BLOCK_SAMPLES % TRACK_PPM_RES == 0);
const _: () = assert!(TRACK_BLOCK_SAMPLES % TRACK_OVERVIEW_RES == 0);
