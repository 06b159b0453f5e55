//! Conversion from a device's native format to canonical pipeline audio.
//!
//! Devices negotiate whatever rate and channel count they support; this
//! adapter downmixes to mono, resamples to the canonical rate, and slices the
//! result into fixed capture frames.

use crate::audio::{FRAME_SAMPLES, SAMPLE_RATE};
use anyhow::{Context, Result};
use audioadapter_buffers::direct::SequentialSliceOfVecs;
use rubato::{Fft, FixedSync, Resampler};

/// Input frames fed to the FFT resampler per process call: 100 ms.
fn chunk_frames(input_rate: u32) -> usize {
    (input_rate as usize / 10).max(FRAME_SAMPLES)
}

pub struct CanonicalResampler {
    /// None when the device already runs at the canonical rate.
    resampler: Option<Fft<f32>>,
    channels: usize,
    input_rate: u32,
    chunk: usize,
    /// Downmixed input-rate samples waiting to fill one resampler chunk.
    pending: Vec<f32>,
    /// Canonical-rate samples waiting to fill a capture frame.
    out: Vec<f32>,
}

impl CanonicalResampler {
    pub fn new(input_rate: u32, channels: usize) -> Result<Self> {
        anyhow::ensure!(channels > 0, "device reported zero channels");
        let chunk = chunk_frames(input_rate);
        let resampler = if input_rate == SAMPLE_RATE {
            None
        } else {
            // FixedSync::Input: fixed input size, output length varies per call.
            Some(
                Fft::<f32>::new(
                    input_rate as usize,
                    SAMPLE_RATE as usize,
                    chunk,
                    2,
                    1, // mono, downmix happens before resampling
                    FixedSync::Input,
                )
                .context("creating Fft resampler")?,
            )
        };
        Ok(CanonicalResampler {
            resampler,
            channels,
            input_rate,
            chunk,
            pending: Vec::with_capacity(chunk * 2),
            out: Vec::with_capacity(FRAME_SAMPLES * 4),
        })
    }

    pub fn input_rate(&self) -> u32 {
        self.input_rate
    }

    /// Feed interleaved device samples. Returns zero or more complete
    /// canonical frames of exactly FRAME_SAMPLES mono samples.
    pub fn push_interleaved(&mut self, samples: &[f32]) -> Result<Vec<Vec<f32>>> {
        // Downmix by averaging channels.
        if self.channels == 1 {
            self.pending.extend_from_slice(samples);
        } else {
            let scale = 1.0 / self.channels as f32;
            for frame in samples.chunks_exact(self.channels) {
                self.pending.push(frame.iter().sum::<f32>() * scale);
            }
        }

        match &mut self.resampler {
            None => {
                self.out.append(&mut self.pending);
            }
            Some(resampler) => {
                while self.pending.len() >= self.chunk {
                    let input: Vec<f32> = self.pending.drain(..self.chunk).collect();
                    let input_vecs = vec![input];
                    let input_adapter = SequentialSliceOfVecs::new(&input_vecs, 1, self.chunk)
                        .context("creating input adapter")?;

                    let max_out = self.chunk * SAMPLE_RATE as usize / self.input_rate as usize + 16;
                    let mut output_vecs = vec![vec![0.0f32; max_out]];
                    let mut output_adapter =
                        SequentialSliceOfVecs::new_mut(&mut output_vecs, 1, max_out)
                            .context("creating output adapter")?;

                    let (_, produced) = resampler
                        .process_into_buffer(&input_adapter, &mut output_adapter, None)
                        .context("resampling audio")?;
                    self.out.extend_from_slice(&output_vecs[0][..produced]);
                }
            }
        }

        let mut frames = Vec::new();
        while self.out.len() >= FRAME_SAMPLES {
            frames.push(self.out.drain(..FRAME_SAMPLES).collect());
        }
        Ok(frames)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn passthrough_at_canonical_rate_slices_frames() {
        let mut r = CanonicalResampler::new(SAMPLE_RATE, 1).unwrap();
        let frames = r.push_interleaved(&vec![0.5f32; FRAME_SAMPLES * 2 + 10]).unwrap();
        assert_eq!(frames.len(), 2);
        assert!(frames.iter().all(|f| f.len() == FRAME_SAMPLES));
        // The 10 leftover samples wait for the next push.
        let more = r.push_interleaved(&vec![0.5f32; FRAME_SAMPLES - 10]).unwrap();
        assert_eq!(more.len(), 1);
    }

    #[test]
    fn stereo_downmix_averages_channels() {
        let mut r = CanonicalResampler::new(SAMPLE_RATE, 2).unwrap();
        // L = 1.0, R = 0.0 interleaved -> mono 0.5
        let interleaved: Vec<f32> =
            (0..FRAME_SAMPLES * 2).map(|i| if i % 2 == 0 { 1.0 } else { 0.0 }).collect();
        let frames = r.push_interleaved(&interleaved).unwrap();
        assert_eq!(frames.len(), 1);
        assert!(frames[0].iter().all(|&s| (s - 0.5).abs() < 1e-6));
    }

    #[test]
    fn resampling_produces_expected_sample_count() {
        let mut r = CanonicalResampler::new(16_000, 1).unwrap();
        // Ten seconds of input should yield close to ten seconds of output;
        // FFT startup latency holds back a fraction of a chunk.
        let mut produced = 0usize;
        for _ in 0..100 {
            let frames = r.push_interleaved(&vec![0.1f32; 1600]).unwrap();
            produced += frames.iter().map(|f| f.len()).sum::<usize>();
        }
        let expected = 10 * SAMPLE_RATE as usize;
        assert!(
            produced as i64 >= expected as i64 - 10 * FRAME_SAMPLES as i64,
            "produced {produced}, expected about {expected}"
        );
        assert!(produced <= expected);
    }

    #[test]
    fn rejects_zero_channels() {
        assert!(CanonicalResampler::new(SAMPLE_RATE, 0).is_err());
    }
}
