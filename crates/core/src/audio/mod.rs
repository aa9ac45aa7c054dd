use std::{
    fmt,
    path::Path,
    time::{Duration, Instant},
};

use crate::{Result, StageError};

#[cfg(feature = "live")]
mod live;

#[cfg(feature = "live")]
pub use live::LiveSource;

/// Producer of fixed-size blocks of mono 16-bit PCM.
///
/// `read_buffer` blocks until a buffer is available and returns `Ok(None)` at
/// end of stream. Live sources never end on their own.
pub trait AudioSource: Send {
    fn sample_rate(&self) -> u32;

    fn read_buffer(&mut self) -> Result<Option<Vec<i16>>>;
}

/// Reads a decoded file window by window, optionally paced to wall-clock time.
pub struct FileSource {
    samples: Vec<i16>,
    sample_rate: u32,
    buffer_size: usize,
    hop: usize,
    cursor: usize,
    realtime: bool,
    next_release: Option<Instant>,
}

impl FileSource {
    /// Decodes a WAV file, mixes it down to mono and resamples it to
    /// `sample_rate` when the file uses a different rate.
    pub fn open(
        path: impl AsRef<Path>,
        sample_rate: u32,
        buffer_size: usize,
        hop: usize,
        realtime: bool,
    ) -> Result<Self> {
        let path = path.as_ref();
        let mut reader = hound::WavReader::open(path)?;
        let spec = reader.spec();

        let interleaved: Vec<f32> = match spec.sample_format {
            hound::SampleFormat::Float => reader
                .samples::<f32>()
                .collect::<std::result::Result<_, _>>()?,
            hound::SampleFormat::Int => {
                let max = (1i64 << (spec.bits_per_sample.max(1) - 1)) as f32;
                reader
                    .samples::<i32>()
                    .map(|sample| sample.map(|value| value as f32 / max))
                    .collect::<std::result::Result<_, _>>()?
            }
        };

        let channels = usize::from(spec.channels.max(1));
        let mono: Vec<f32> = interleaved
            .chunks(channels)
            .map(|frame| frame.iter().sum::<f32>() / frame.len() as f32)
            .collect();

        let mono = if spec.sample_rate != sample_rate {
            resample_linear(&mono, spec.sample_rate, sample_rate)
        } else {
            mono
        };

        tracing::info!(
            ?path,
            file_rate = spec.sample_rate,
            channels = spec.channels,
            seconds = mono.len() as f32 / sample_rate as f32,
            "decoded audio file"
        );

        let samples = mono.into_iter().map(to_i16).collect();
        Self::from_samples(samples, sample_rate, buffer_size, hop, realtime)
    }

    /// Serves already decoded samples.
    pub fn from_samples(
        samples: Vec<i16>,
        sample_rate: u32,
        buffer_size: usize,
        hop: usize,
        realtime: bool,
    ) -> Result<Self> {
        if sample_rate == 0 {
            return Err(StageError::InvalidInput("sample rate must be positive"));
        }
        if buffer_size == 0 || hop == 0 {
            return Err(StageError::InvalidInput("buffer size and hop must be positive"));
        }

        Ok(Self {
            samples,
            sample_rate,
            buffer_size,
            hop,
            cursor: 0,
            realtime,
            next_release: None,
        })
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn duration(&self) -> Duration {
        Duration::from_secs_f64(self.samples.len() as f64 / f64::from(self.sample_rate))
    }

    fn hop_duration(&self) -> Duration {
        Duration::from_secs_f64(self.hop as f64 / f64::from(self.sample_rate))
    }

    fn pace(&mut self) {
        let now = Instant::now();
        let release = *self.next_release.get_or_insert(now);
        if release > now {
            std::thread::sleep(release - now);
        }
        self.next_release = Some(release + self.hop_duration());
    }
}

impl AudioSource for FileSource {
    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    /// Returns the next window. The final window may be shorter than
    /// `buffer_size`.
    fn read_buffer(&mut self) -> Result<Option<Vec<i16>>> {
        if self.cursor >= self.samples.len() {
            return Ok(None);
        }

        if self.realtime {
            self.pace();
        }

        let end = (self.cursor + self.buffer_size).min(self.samples.len());
        let window = self.samples[self.cursor..end].to_vec();
        self.cursor += self.hop;
        Ok(Some(window))
    }
}

impl fmt::Debug for FileSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FileSource")
            .field("samples", &self.samples.len())
            .field("sample_rate", &self.sample_rate)
            .field("buffer_size", &self.buffer_size)
            .field("hop", &self.hop)
            .field("cursor", &self.cursor)
            .field("realtime", &self.realtime)
            .finish()
    }
}

pub(crate) fn to_i16(sample: f32) -> i16 {
    (sample.clamp(-1.0, 1.0) * 32_767.0).round() as i16
}

fn resample_linear(input: &[f32], from: u32, to: u32) -> Vec<f32> {
    if input.is_empty() || from == 0 || to == 0 {
        return Vec::new();
    }

    let ratio = f64::from(from) / f64::from(to);
    let len = ((input.len() as f64) / ratio).round() as usize;
    (0..len)
        .map(|i| {
            let position = i as f64 * ratio;
            let index = position.floor() as usize;
            let frac = (position - index as f64) as f32;
            let a = input[index.min(input.len() - 1)];
            let b = input[(index + 1).min(input.len() - 1)];
            a + (b - a) * frac
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_wav(path: &Path, spec: hound::WavSpec, frames: &[i16]) {
        let mut writer = hound::WavWriter::create(path, spec).unwrap();
        for &sample in frames {
            writer.write_sample(sample).unwrap();
        }
        writer.finalize().unwrap();
    }

    #[test]
    fn windows_advance_by_hop_and_end_short() {
        let mut source = FileSource::from_samples((0..10).collect(), 100, 4, 4, false).unwrap();

        assert_eq!(source.read_buffer().unwrap(), Some(vec![0, 1, 2, 3]));
        assert_eq!(source.read_buffer().unwrap(), Some(vec![4, 5, 6, 7]));
        assert_eq!(source.read_buffer().unwrap(), Some(vec![8, 9]));
        assert_eq!(source.read_buffer().unwrap(), None);
        assert_eq!(source.read_buffer().unwrap(), None);
    }

    #[test]
    fn overlapping_windows() {
        let mut source = FileSource::from_samples((0..6).collect(), 100, 4, 2, false).unwrap();
        assert_eq!(source.read_buffer().unwrap(), Some(vec![0, 1, 2, 3]));
        assert_eq!(source.read_buffer().unwrap(), Some(vec![2, 3, 4, 5]));
        assert_eq!(source.read_buffer().unwrap(), Some(vec![4, 5]));
        assert_eq!(source.read_buffer().unwrap(), None);
    }

    #[test]
    fn realtime_reads_are_paced() {
        let mut source = FileSource::from_samples(vec![0; 300], 1_000, 100, 100, true).unwrap();
        let started = Instant::now();
        while source.read_buffer().unwrap().is_some() {}
        // Three windows of 100 ms each; the first is released immediately.
        assert!(started.elapsed() >= Duration::from_millis(190));
    }

    #[test]
    fn rejects_zero_hop() {
        assert!(FileSource::from_samples(vec![0; 8], 100, 4, 0, false).is_err());
    }

    #[test]
    fn stereo_files_mix_to_mono() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("stereo.wav");
        let spec = hound::WavSpec {
            channels: 2,
            sample_rate: 8_000,
            bits_per_sample: 16,
            sample_format: hound::SampleFormat::Int,
        };
        write_wav(&path, spec, &[1_000, 3_000, -2_000, 2_000]);

        let mut source = FileSource::open(&path, 8_000, 16, 16, false).unwrap();
        let buffer = source.read_buffer().unwrap().unwrap();
        assert_eq!(buffer.len(), 2);
        assert!((buffer[0] - 2_000).abs() <= 1);
        assert!(buffer[1].abs() <= 1);
    }

    #[test]
    fn resamples_to_the_requested_rate() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("mono.wav");
        let spec = hound::WavSpec {
            channels: 1,
            sample_rate: 22_050,
            bits_per_sample: 16,
            sample_format: hound::SampleFormat::Int,
        };
        write_wav(&path, spec, &vec![500; 22_050]);

        let source = FileSource::open(&path, 44_100, 8_820, 8_820, false).unwrap();
        assert_eq!(source.sample_rate(), 44_100);
        assert_eq!(source.len(), 44_100);
    }

    #[test]
    fn missing_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        assert!(FileSource::open(dir.path().join("nope.wav"), 44_100, 10, 10, false).is_err());
    }
}
