//! Format registry and sample-accurate file reader built on symphonia.
//!
//! The registry probes a file against every registered container/codec and
//! hands back an [`AudioFileReader`]: an incremental decoder with a known
//! sample rate and length, seekable to an exact frame. All output is
//! interleaved stereo f32; mono sources are duplicated and wider layouts
//! take the first two channels.

use crate::error::{Error, Result};
use crate::audio::CHANNELS;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use symphonia::core::audio::{AudioBufferRef, Signal};
use symphonia::core::codecs::{CodecRegistry, Decoder, DecoderOptions, CODEC_TYPE_NULL};
use symphonia::core::formats::{FormatOptions, FormatReader, SeekMode, SeekTo};
use symphonia::core::io::MediaSourceStream;
use symphonia::core::meta::MetadataOptions;
use symphonia::core::probe::{Hint, Probe};
use symphonia::core::units::{Time, TimeBase};
use tracing::{debug, trace, warn};

fn codec_registry() -> &'static CodecRegistry {
    static REGISTRY: OnceLock<CodecRegistry> = OnceLock::new();
    REGISTRY.get_or_init(|| {
        let mut registry = CodecRegistry::new();
        symphonia::default::register_enabled_codecs(&mut registry);
        registry
    })
}

fn format_probe() -> &'static Probe {
    symphonia::default::get_probe()
}

/// Opens file paths and returns sample-accurate decoders.
///
/// Registered once at engine construction; MP3, WAV, AIFF, FLAC, and Ogg
/// Vorbis come from the enabled symphonia features. A file no registered
/// decoder accepts yields [`Error::UnsupportedFormat`].
#[derive(Debug, Default, Clone, Copy)]
pub struct FormatRegistry;

impl FormatRegistry {
    pub fn new() -> Self {
        // Force registry construction up front so the first load does not
        // pay for it.
        let _ = codec_registry();
        Self
    }

    /// Open `path` and return an incremental reader positioned at frame 0.
    pub fn open(&self, path: &Path) -> Result<AudioFileReader> {
        let file = std::fs::File::open(path).map_err(|e| Error::FileRead {
            path: path.to_path_buf(),
            source: e,
        })?;

        let mss = MediaSourceStream::new(Box::new(file), Default::default());

        let mut hint = Hint::new();
        if let Some(ext) = path.extension().and_then(|e| e.to_str()) {
            hint.with_extension(ext);
        }

        let probed = format_probe()
            .format(
                &hint,
                mss,
                &FormatOptions::default(),
                &MetadataOptions::default(),
            )
            .map_err(|_| Error::UnsupportedFormat {
                path: path.to_path_buf(),
            })?;

        let format = probed.format;

        let track = format
            .tracks()
            .iter()
            .find(|t| t.codec_params.codec != CODEC_TYPE_NULL)
            .ok_or_else(|| Error::UnsupportedFormat {
                path: path.to_path_buf(),
            })?;

        let track_id = track.id;
        let codec_params = track.codec_params.clone();

        let sample_rate = codec_params
            .sample_rate
            .ok_or_else(|| Error::Decode(format!("{}: sample rate unknown", path.display())))?;
        let total_frames = codec_params
            .n_frames
            .ok_or_else(|| Error::Decode(format!("{}: stream length unknown", path.display())))?;

        let decoder = codec_registry()
            .make(&codec_params, &DecoderOptions::default())
            .map_err(|e| Error::Decode(format!("{}: {}", path.display(), e)))?;

        debug!(
            path = %path.display(),
            sample_rate,
            total_frames,
            "opened audio file"
        );

        Ok(AudioFileReader {
            path: path.to_path_buf(),
            format,
            decoder,
            track_id,
            time_base: codec_params.time_base,
            sample_rate,
            total_frames,
            next_frame: 0,
            pending: Vec::new(),
            pending_offset: 0,
        })
    }
}

/// Incremental, seekable decoder for one audio file.
pub struct AudioFileReader {
    path: PathBuf,
    format: Box<dyn FormatReader>,
    decoder: Box<dyn Decoder>,
    track_id: u32,
    time_base: Option<TimeBase>,
    sample_rate: u32,
    total_frames: u64,
    /// Absolute source frame returned by the next `read`.
    next_frame: u64,
    /// Decoded interleaved stereo samples not yet handed out.
    pending: Vec<f32>,
    pending_offset: usize,
}

impl std::fmt::Debug for AudioFileReader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AudioFileReader")
            .field("path", &self.path)
            .field("track_id", &self.track_id)
            .field("time_base", &self.time_base)
            .field("sample_rate", &self.sample_rate)
            .field("total_frames", &self.total_frames)
            .field("next_frame", &self.next_frame)
            .field("pending_offset", &self.pending_offset)
            .finish()
    }
}

impl AudioFileReader {
    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn total_frames(&self) -> u64 {
        self.total_frames
    }

    pub fn position(&self) -> u64 {
        self.next_frame
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Decode up to `out.len() / 2` frames into `out` (interleaved stereo).
    ///
    /// Returns the number of frames written; 0 means end of stream. Corrupt
    /// packets are skipped with a log, matching the policy that a bad frame
    /// is better dropped than turned into a hard failure mid-playback.
    pub fn read(&mut self, out: &mut [f32]) -> Result<usize> {
        let want_frames = out.len() / CHANNELS;
        let mut written = 0usize;

        while written < want_frames {
            // Drain any leftovers from the previous packet first.
            let available = (self.pending.len() - self.pending_offset) / CHANNELS;
            if available > 0 {
                let take = available.min(want_frames - written);
                let src = &self.pending[self.pending_offset..self.pending_offset + take * CHANNELS];
                out[written * CHANNELS..(written + take) * CHANNELS].copy_from_slice(src);
                self.pending_offset += take * CHANNELS;
                written += take;
                continue;
            }

            self.pending.clear();
            self.pending_offset = 0;

            let packet = match self.format.next_packet() {
                Ok(packet) => packet,
                Err(symphonia::core::errors::Error::IoError(ref e))
                    if e.kind() == std::io::ErrorKind::UnexpectedEof =>
                {
                    trace!(path = %self.path.display(), "end of stream");
                    break;
                }
                Err(symphonia::core::errors::Error::ResetRequired) => {
                    warn!(path = %self.path.display(), "decoder reset required, treating as end of stream");
                    break;
                }
                Err(e) => {
                    warn!(path = %self.path.display(), error = %e, "packet read error");
                    break;
                }
            };

            if packet.track_id() != self.track_id {
                continue;
            }

            match self.decoder.decode(&packet) {
                Ok(decoded) => append_stereo(&decoded, &mut self.pending),
                Err(symphonia::core::errors::Error::DecodeError(e)) => {
                    warn!(path = %self.path.display(), error = %e, "dropping corrupt packet");
                    continue;
                }
                Err(e) => {
                    warn!(path = %self.path.display(), error = %e, "decode failed");
                    break;
                }
            }
        }

        self.next_frame += written as u64;
        Ok(written)
    }

    /// Seek so the next `read` returns frame `frame`.
    ///
    /// Containers seek to the nearest preceding sync point; the remainder is
    /// decoded and discarded so positioning stays sample-accurate.
    pub fn seek(&mut self, frame: u64) -> Result<()> {
        let frame = frame.min(self.total_frames);
        if frame == self.next_frame {
            return Ok(());
        }

        let seconds = frame as f64 / self.sample_rate as f64;
        let seeked = self.format.seek(
            SeekMode::Accurate,
            SeekTo::Time {
                time: Time::from(seconds),
                track_id: Some(self.track_id),
            },
        );

        self.pending.clear();
        self.pending_offset = 0;

        match seeked {
            Ok(to) => {
                self.decoder.reset();
                self.next_frame = match self.time_base {
                    Some(tb) => {
                        let time = tb.calc_time(to.actual_ts);
                        (time.seconds as f64 * self.sample_rate as f64
                            + time.frac * self.sample_rate as f64)
                            .round() as u64
                    }
                    None => to.actual_ts,
                };
            }
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "container seek failed, rewinding by reopen");
                let registry = FormatRegistry::new();
                *self = registry.open(&self.path)?;
            }
        }

        // Decode-and-skip from the sync point up to the requested frame.
        let mut scratch = vec![0.0f32; 4096 * CHANNELS];
        while self.next_frame < frame {
            let deficit = ((frame - self.next_frame) as usize).min(4096);
            let got = self.read(&mut scratch[..deficit * CHANNELS])?;
            if got == 0 {
                break;
            }
        }

        trace!(path = %self.path.display(), frame, landed = self.next_frame, "seek");
        Ok(())
    }
}

/// Append a decoded buffer as interleaved stereo f32.
fn append_stereo(decoded: &AudioBufferRef, out: &mut Vec<f32>) {
    macro_rules! convert {
        ($buf:expr, $to_f32:expr) => {{
            let buf = $buf;
            let channels = buf.spec().channels.count();
            let frames = buf.frames();
            out.reserve(frames * CHANNELS);
            for i in 0..frames {
                let left = $to_f32(buf.chan(0)[i]);
                let right = if channels > 1 {
                    $to_f32(buf.chan(1)[i])
                } else {
                    left
                };
                out.push(left);
                out.push(right);
            }
        }};
    }

    match decoded {
        AudioBufferRef::F32(buf) => convert!(buf, |s: f32| s),
        AudioBufferRef::F64(buf) => convert!(buf, |s: f64| s as f32),
        AudioBufferRef::S8(buf) => convert!(buf, |s: i8| s as f32 / 128.0),
        AudioBufferRef::S16(buf) => convert!(buf, |s: i16| s as f32 / i16::MAX as f32),
        AudioBufferRef::S24(buf) => {
            convert!(buf, |s: symphonia::core::sample::i24| s.inner() as f32
                / 8_388_608.0)
        }
        AudioBufferRef::S32(buf) => convert!(buf, |s: i32| s as f32 / i32::MAX as f32),
        AudioBufferRef::U8(buf) => convert!(buf, |s: u8| (s as i32 - 128) as f32 / 128.0),
        AudioBufferRef::U16(buf) => {
            convert!(buf, |s: u16| (s as i32 - 32_768) as f32 / 32_768.0)
        }
        AudioBufferRef::U24(buf) => {
            convert!(buf, |s: symphonia::core::sample::u24| (s.inner() as i64
                - 8_388_608) as f32
                / 8_388_608.0)
        }
        AudioBufferRef::U32(buf) => {
            convert!(buf, |s: u32| (s as i64 - 2_147_483_648) as f32
                / 2_147_483_648.0)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_counting_wav(frames: u32) -> (tempfile::TempDir, PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("counting.wav");
        let spec = hound::WavSpec {
            channels: 2,
            sample_rate: 44_100,
            bits_per_sample: 16,
            sample_format: hound::SampleFormat::Int,
        };
        let mut writer = hound::WavWriter::create(&path, spec).unwrap();
        for i in 0..frames {
            // Encode the frame index into the left channel so seeks can be
            // verified sample-accurately.
            let value = (i % 8_192) as i16;
            writer.write_sample(value).unwrap();
            writer.write_sample(-value).unwrap();
        }
        writer.finalize().unwrap();
        (dir, path)
    }

    #[test]
    fn open_reports_rate_and_length() {
        let (_dir, path) = write_counting_wav(44_100);
        let reader = FormatRegistry::new().open(&path).unwrap();
        assert_eq!(reader.sample_rate(), 44_100);
        assert_eq!(reader.total_frames(), 44_100);
        assert_eq!(reader.position(), 0);
    }

    #[test]
    fn open_missing_file_fails() {
        let err = FormatRegistry::new()
            .open(Path::new("/nonexistent/track.flac"))
            .unwrap_err();
        assert!(matches!(err, Error::FileRead { .. }));
    }

    #[test]
    fn open_garbage_is_unsupported() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("garbage.mp3");
        std::fs::write(&path, b"this is not audio at all").unwrap();
        let err = FormatRegistry::new().open(&path).unwrap_err();
        assert!(matches!(err, Error::UnsupportedFormat { .. }));
    }

    #[test]
    fn read_streams_all_frames() {
        let (_dir, path) = write_counting_wav(10_000);
        let mut reader = FormatRegistry::new().open(&path).unwrap();

        let mut block = vec![0.0f32; 1_024 * CHANNELS];
        let mut total = 0usize;
        loop {
            let frames = reader.read(&mut block).unwrap();
            if frames == 0 {
                break;
            }
            total += frames;
        }
        assert_eq!(total, 10_000);
        assert_eq!(reader.position(), 10_000);
    }

    #[test]
    fn seek_is_sample_accurate() {
        let (_dir, path) = write_counting_wav(20_000);
        let mut reader = FormatRegistry::new().open(&path).unwrap();

        reader.seek(5_000).unwrap();
        assert_eq!(reader.position(), 5_000);

        let mut block = vec![0.0f32; CHANNELS];
        reader.read(&mut block).unwrap();
        let expected = 5_000.0f32 / i16::MAX as f32;
        assert!(
            (block[0] - expected).abs() < 1e-4,
            "expected frame 5000 ({}), got {}",
            expected,
            block[0]
        );

        // Seeking backwards works too.
        reader.seek(100).unwrap();
        reader.read(&mut block).unwrap();
        let expected = 100.0f32 / i16::MAX as f32;
        assert!((block[0] - expected).abs() < 1e-4);
    }

    #[test]
    fn mono_is_duplicated_to_stereo() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("mono.wav");
        let spec = hound::WavSpec {
            channels: 1,
            sample_rate: 44_100,
            bits_per_sample: 16,
            sample_format: hound::SampleFormat::Int,
        };
        let mut writer = hound::WavWriter::create(&path, spec).unwrap();
        for _ in 0..1_000 {
            writer.write_sample(1_000i16).unwrap();
        }
        writer.finalize().unwrap();

        let mut reader = FormatRegistry::new().open(&path).unwrap();
        let mut block = vec![0.0f32; 16];
        reader.read(&mut block).unwrap();
        for frame in block.chunks_exact(2) {
            assert_eq!(frame[0], frame[1]);
            assert!(frame[0] > 0.0);
        }
    }
}
