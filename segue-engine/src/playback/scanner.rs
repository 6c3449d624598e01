//! Track scanning: locating the audible extent of a file.
//!
//! The scanner opens its own reader (never the playback reader, whose
//! read-ahead would jitter if seeked) and measures three offsets:
//!
//! - *first-audible*: first position in the front half where the signal
//!   holds above −60 dBFS for at least 1 ms;
//! - *last-audible*: first position in the tail region where the signal
//!   falls and stays below −45 dBFS for 1.25 s;
//! - *end-of-playout*: first position after last-audible where the signal
//!   stays below −60 dBFS for 4 ms, or the file length if never.
//!
//! It also finds the *full-energy point* seeding the deck's leading
//! duration: the start of the first 1 s window whose RMS reaches 95% of the
//! loudest 1 s window in the front half.

use segue_common::db_to_gain;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::audio::formats::AudioFileReader;
use crate::audio::{FormatRegistry, CHANNELS};
use crate::error::{Error, Result};

const SILENCE_THRESHOLD_DB: f32 = -60.0;
const ENDING_SILENCE_THRESHOLD_DB: f32 = -45.0;

/// Sustain required for the first audible sound.
const FIRST_SOUND_SECONDS: f64 = 1e-3;
/// Sustain required for trailing silence.
const LAST_SOUND_SECONDS: f64 = 1.25;
/// The tail search never looks further back than this from the end.
const TAIL_SCAN_SECONDS: f64 = 30.0;
/// Sustain required for the end-of-playout cut.
const PLAYOUT_SILENCE_SECONDS: f64 = 0.004;

/// Full-energy detection window and hop.
const ENERGY_WINDOW_SECONDS: f64 = 1.0;
const ENERGY_HOP_SECONDS: f64 = 0.1;
const ENERGY_FRACTION: f32 = 0.95;

const SCAN_CHUNK_FRAMES: usize = 8_192;

/// Offsets published by a completed scan, in source frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScanResult {
    pub sample_rate: u32,
    pub total_frames: u64,
    pub first_audible: u64,
    pub last_audible: u64,
    pub end_of_playout: u64,
    /// Start of the first near-peak-RMS window; never before
    /// `first_audible`.
    pub full_energy: u64,
}

impl ScanResult {
    /// Fallback offsets for a file the scanner could not open: the whole
    /// file is treated as audible.
    pub fn fallback(sample_rate: u32, total_frames: u64) -> Self {
        Self {
            sample_rate,
            total_frames,
            first_audible: 0,
            last_audible: total_frames,
            end_of_playout: total_frames,
            full_energy: 0,
        }
    }
}

/// Measures first-audible, last-audible, and end-of-playout offsets.
#[derive(Clone)]
pub struct TrackScanner {
    registry: Arc<FormatRegistry>,
}

impl TrackScanner {
    pub fn new(registry: Arc<FormatRegistry>) -> Self {
        Self { registry }
    }

    /// Full scan. Runs on a background worker; the only hard failure is a
    /// reader that cannot be created.
    pub fn scan(&self, path: &Path) -> Result<ScanResult> {
        let mut reader = self
            .registry
            .open(path)
            .map_err(|e| Error::Scan(format!("{}: {e}", path.display())))?;

        let rate = reader.sample_rate();
        let total = reader.total_frames();
        let mid = total / 2;

        let silence_gain = db_to_gain(SILENCE_THRESHOLD_DB);
        let ending_gain = db_to_gain(ENDING_SILENCE_THRESHOLD_DB);

        let first_audible = search_for_level(
            &mut reader,
            0,
            mid,
            silence_gain,
            f32::MAX,
            seconds_to_run(FIRST_SOUND_SECONDS, rate),
        )?
        .unwrap_or(0);

        let full_energy = find_full_energy(&mut reader, first_audible, mid)?;

        let tail_start = first_audible
            .max(mid)
            .max(total.saturating_sub((TAIL_SCAN_SECONDS * rate as f64) as u64));

        let mut last_audible = total;
        let mut end_of_playout = total;

        if let Some(silence_start) = search_for_level(
            &mut reader,
            tail_start,
            total,
            0.0,
            ending_gain,
            seconds_to_run(LAST_SOUND_SECONDS, rate),
        )? {
            if silence_start > first_audible {
                last_audible = silence_start;
                // "After" is strict: the search begins one frame past the
                // last audible sound.
                end_of_playout = search_for_level(
                    &mut reader,
                    last_audible + 1,
                    total,
                    0.0,
                    silence_gain,
                    seconds_to_run(PLAYOUT_SILENCE_SECONDS, rate),
                )?
                .unwrap_or(total);
            }
        }

        let result = ScanResult {
            sample_rate: rate,
            total_frames: total,
            first_audible,
            last_audible,
            end_of_playout,
            full_energy: full_energy.max(first_audible),
        };

        debug!(
            path = %path.display(),
            first_audible = result.first_audible,
            last_audible = result.last_audible,
            end_of_playout = result.end_of_playout,
            full_energy = result.full_energy,
            "scan complete"
        );

        Ok(result)
    }

    /// Quick first-audible probe used at load time so playback can start at
    /// real sound before the full scan lands. Early-exits at the first hit.
    pub fn find_first_audible(reader: &mut AudioFileReader) -> Result<u64> {
        let rate = reader.sample_rate();
        let mid = reader.total_frames() / 2;
        let found = search_for_level(
            reader,
            0,
            mid,
            db_to_gain(SILENCE_THRESHOLD_DB),
            f32::MAX,
            seconds_to_run(FIRST_SOUND_SECONDS, rate),
        )?;
        Ok(found.unwrap_or(0))
    }
}

fn seconds_to_run(seconds: f64, rate: u32) -> u64 {
    ((seconds * rate as f64) as u64).max(1)
}

/// Find the first frame in `[start, end)` where the per-frame magnitude
/// stays within `[min_gain, max_gain]` for at least `min_run` consecutive
/// frames. Returns the start of the run.
fn search_for_level(
    reader: &mut AudioFileReader,
    start: u64,
    end: u64,
    min_gain: f32,
    max_gain: f32,
    min_run: u64,
) -> Result<Option<u64>> {
    if start >= end {
        return Ok(None);
    }
    reader.seek(start)?;

    let mut chunk = vec![0.0f32; SCAN_CHUNK_FRAMES * CHANNELS];
    let mut pos = start;
    let mut run_start: Option<u64> = None;
    let mut run_len: u64 = 0;

    while pos < end {
        let want = ((end - pos) as usize).min(SCAN_CHUNK_FRAMES);
        let frames = reader.read(&mut chunk[..want * CHANNELS])?;
        if frames == 0 {
            break;
        }

        for (i, frame) in chunk[..frames * CHANNELS].chunks_exact(CHANNELS).enumerate() {
            let magnitude = frame[0].abs().max(frame[1].abs());
            if magnitude >= min_gain && magnitude <= max_gain {
                if run_start.is_none() {
                    run_start = Some(pos + i as u64);
                }
                run_len += 1;
                if run_len >= min_run {
                    return Ok(run_start);
                }
            } else {
                run_start = None;
                run_len = 0;
            }
        }
        pos += frames as u64;
    }

    Ok(None)
}

/// Windowed-RMS sweep of `[first_audible, end)` locating the first window
/// whose RMS reaches [`ENERGY_FRACTION`] of the region's maximum.
fn find_full_energy(reader: &mut AudioFileReader, first_audible: u64, end: u64) -> Result<u64> {
    let rate = reader.sample_rate();
    if first_audible >= end {
        return Ok(first_audible);
    }

    let hop_frames = ((ENERGY_HOP_SECONDS * rate as f64) as usize).max(1);
    let window_hops = (ENERGY_WINDOW_SECONDS / ENERGY_HOP_SECONDS).round() as usize;

    reader.seek(first_audible)?;

    // Mean-square energy per hop bucket across the whole region.
    let mut hop_energy: Vec<f64> = Vec::new();
    let mut chunk = vec![0.0f32; SCAN_CHUNK_FRAMES * CHANNELS];
    let mut pos = first_audible;
    let mut bucket_sum = 0.0f64;
    let mut bucket_frames = 0usize;

    while pos < end {
        let want = ((end - pos) as usize).min(SCAN_CHUNK_FRAMES);
        let frames = reader.read(&mut chunk[..want * CHANNELS])?;
        if frames == 0 {
            break;
        }
        for frame in chunk[..frames * CHANNELS].chunks_exact(CHANNELS) {
            let energy = (frame[0] as f64 * frame[0] as f64
                + frame[1] as f64 * frame[1] as f64)
                / 2.0;
            bucket_sum += energy;
            bucket_frames += 1;
            if bucket_frames == hop_frames {
                hop_energy.push(bucket_sum / hop_frames as f64);
                bucket_sum = 0.0;
                bucket_frames = 0;
            }
        }
        pos += frames as u64;
    }
    if bucket_frames > 0 {
        hop_energy.push(bucket_sum / bucket_frames as f64);
    }

    if hop_energy.len() < window_hops {
        return Ok(first_audible);
    }

    // Rolling 1 s window over the hop buckets.
    let mut window_rms: Vec<f64> = Vec::with_capacity(hop_energy.len() - window_hops + 1);
    let mut rolling: f64 = hop_energy[..window_hops].iter().sum();
    window_rms.push((rolling / window_hops as f64).sqrt());
    for i in window_hops..hop_energy.len() {
        rolling += hop_energy[i] - hop_energy[i - window_hops];
        window_rms.push((rolling / window_hops as f64).sqrt());
    }

    let max_rms = window_rms.iter().cloned().fold(0.0f64, f64::max);
    if max_rms <= 0.0 {
        return Ok(first_audible);
    }

    let threshold = max_rms * ENERGY_FRACTION as f64;
    for (i, rms) in window_rms.iter().enumerate() {
        if *rms >= threshold {
            return Ok(first_audible + (i * hop_frames) as u64);
        }
    }

    warn!("full-energy sweep found no window above threshold");
    Ok(first_audible)
}
