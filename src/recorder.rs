use hound::{SampleFormat, WavSpec, WavWriter};
use std::fs::File;
use std::io::BufWriter;
use std::path::{Path, PathBuf};

/// Writes received audio to a mono 16-bit WAV file.
///
/// Runs on the network path, never from the audio callback.
pub struct WavRecorder {
    writer: WavWriter<BufWriter<File>>,
    path: PathBuf,
    samples_written: u64,
}

impl WavRecorder {
    pub fn create(path: impl AsRef<Path>, sample_rate: u32) -> Result<Self, hound::Error> {
        let spec = WavSpec {
            channels: 1,
            sample_rate,
            bits_per_sample: 16,
            sample_format: SampleFormat::Int,
        };
        let path = path.as_ref().to_path_buf();
        let writer = WavWriter::create(&path, spec)?;
        log::info!("Recorder: Writing audio to {}", path.display());
        Ok(Self {
            writer,
            path,
            samples_written: 0,
        })
    }

    pub fn write(&mut self, samples: &[f32]) -> Result<(), hound::Error> {
        for &sample in samples {
            let sample_i16 = (sample.clamp(-1.0, 1.0) * i16::MAX as f32).round() as i16;
            self.writer.write_sample(sample_i16)?;
        }
        self.samples_written += samples.len() as u64;
        Ok(())
    }

    pub fn samples_written(&self) -> u64 {
        self.samples_written
    }

    pub fn finalize(self) -> Result<(), hound::Error> {
        log::info!(
            "Recorder: Finalizing {} ({} samples)",
            self.path.display(),
            self.samples_written
        );
        self.writer.finalize()
    }
}
