//! WAV helpers on top of `hound`: encode 16-bit PCM, decode a file into its
//! spec and samples, and merge several files with the same spec into one.

use std::io::Cursor;

use hound::{SampleFormat, WavReader, WavSpec, WavWriter};
use thiserror::Error;

const RIFF_HEADER_LEN: usize = 12;

#[derive(Debug, Error)]
pub enum WavError {
    #[error("WAV codec error: {0}")]
    Codec(#[from] hound::Error),

    #[error("cannot merge WAV files with different formats ({0:?} vs {1:?})")]
    FormatMismatch(WavSpec, WavSpec),

    #[error("no WAV input")]
    Empty,
}

/// Decoded sample data, widened to the largest type of its format.
#[derive(Debug, Clone, PartialEq)]
pub enum Samples {
    Int(Vec<i32>),
    Float(Vec<f32>),
}

impl Samples {
    pub fn len(&self) -> usize {
        match self {
            Samples::Int(s) => s.len(),
            Samples::Float(s) => s.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn append(&mut self, other: Samples) -> bool {
        match (self, other) {
            (Samples::Int(a), Samples::Int(b)) => a.extend(b),
            (Samples::Float(a), Samples::Float(b)) => a.extend(b),
            _ => return false,
        }
        true
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct WavAudio {
    pub spec: WavSpec,
    pub samples: Samples,
}

impl WavAudio {
    pub fn duration_secs(&self) -> f64 {
        let per_second = u64::from(self.spec.sample_rate) * u64::from(self.spec.channels);
        if per_second == 0 {
            return 0.0;
        }
        self.samples.len() as f64 / per_second as f64
    }
}

pub fn pcm16_spec(sample_rate: u32, channels: u16) -> WavSpec {
    WavSpec {
        channels,
        sample_rate,
        bits_per_sample: 16,
        sample_format: SampleFormat::Int,
    }
}

/// Cheap sniff for the RIFF/WAVE magic.
pub fn is_wav(bytes: &[u8]) -> bool {
    bytes.len() >= RIFF_HEADER_LEN && &bytes[0..4] == b"RIFF" && &bytes[8..12] == b"WAVE"
}

/// Encode interleaved 16-bit samples.
pub fn encode_pcm16(samples: &[i16], sample_rate: u32, channels: u16) -> Result<Vec<u8>, WavError> {
    let mut out = Cursor::new(Vec::new());
    {
        let mut writer = WavWriter::new(&mut out, pcm16_spec(sample_rate, channels))?;
        for &s in samples {
            writer.write_sample(s)?;
        }
        writer.finalize()?;
    }
    Ok(out.into_inner())
}

/// Decode a whole file held in memory.
pub fn decode(bytes: &[u8]) -> Result<WavAudio, WavError> {
    let mut reader = WavReader::new(Cursor::new(bytes))?;
    let spec = reader.spec();
    let samples = match spec.sample_format {
        SampleFormat::Int => Samples::Int(reader.samples::<i32>().collect::<Result<_, _>>()?),
        SampleFormat::Float => Samples::Float(reader.samples::<f32>().collect::<Result<_, _>>()?),
    };
    Ok(WavAudio { spec, samples })
}

fn encode(audio: &WavAudio) -> Result<Vec<u8>, WavError> {
    let mut out = Cursor::new(Vec::new());
    {
        let mut writer = WavWriter::new(&mut out, audio.spec)?;
        match &audio.samples {
            Samples::Int(samples) => {
                for &s in samples {
                    writer.write_sample(s)?;
                }
            }
            Samples::Float(samples) => {
                for &s in samples {
                    writer.write_sample(s)?;
                }
            }
        }
        writer.finalize()?;
    }
    Ok(out.into_inner())
}

/// Concatenate the samples of `inputs` into a single WAV.
///
/// Every input must share the first input's spec.
pub fn merge<B: AsRef<[u8]>>(inputs: &[B]) -> Result<Vec<u8>, WavError> {
    let mut merged: Option<WavAudio> = None;
    for input in inputs {
        let audio = decode(input.as_ref())?;
        let Some(acc) = merged.as_mut() else {
            merged = Some(audio);
            continue;
        };
        let spec = audio.spec;
        if acc.spec != spec || !acc.samples.append(audio.samples) {
            return Err(WavError::FormatMismatch(acc.spec, spec));
        }
    }
    let merged = merged.ok_or(WavError::Empty)?;
    encode(&merged)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encoded_file_decodes_back() {
        let bytes = encode_pcm16(&[0, 100, -100, i16::MAX], 22_050, 1).unwrap();
        assert!(is_wav(&bytes));
        let audio = decode(&bytes).unwrap();
        assert_eq!(audio.spec, pcm16_spec(22_050, 1));
        assert_eq!(audio.samples, Samples::Int(vec![0, 100, -100, i32::from(i16::MAX)]));
    }

    #[test]
    fn duration_follows_sample_rate() {
        let bytes = encode_pcm16(&vec![0; 22_050], 22_050, 1).unwrap();
        let audio = decode(&bytes).unwrap();
        assert!((audio.duration_secs() - 1.0).abs() < 1e-9);
    }

    #[test]
    fn rejects_non_wav_input() {
        assert!(decode(b"ID3\x04 mp3 bytes").is_err());
        assert!(!is_wav(b"RIFF"));
    }

    #[test]
    fn hostile_format_chunk_is_an_error_not_a_panic() {
        // fmt chunk claiming 65535 channels of 32-bit audio with a zero
        // block alignment.
        let mut bytes = Vec::new();
        bytes.extend_from_slice(b"RIFF");
        bytes.extend_from_slice(&44u32.to_le_bytes());
        bytes.extend_from_slice(b"WAVE");
        bytes.extend_from_slice(b"fmt ");
        bytes.extend_from_slice(&16u32.to_le_bytes());
        bytes.extend_from_slice(&1u16.to_le_bytes());
        bytes.extend_from_slice(&u16::MAX.to_le_bytes());
        bytes.extend_from_slice(&u32::MAX.to_le_bytes());
        bytes.extend_from_slice(&u32::MAX.to_le_bytes());
        bytes.extend_from_slice(&0u16.to_le_bytes());
        bytes.extend_from_slice(&32u16.to_le_bytes());
        bytes.extend_from_slice(b"data");
        bytes.extend_from_slice(&8u32.to_le_bytes());
        bytes.extend_from_slice(&[0; 8]);

        assert!(is_wav(&bytes));
        assert!(decode(&bytes).is_err());
        assert!(merge(&[bytes.clone(), bytes]).is_err());
    }

    #[test]
    fn merge_concatenates_samples_in_order() {
        let a = encode_pcm16(&[1, 2], 16_000, 1).unwrap();
        let b = encode_pcm16(&[3], 16_000, 1).unwrap();
        let merged = merge(&[a, b]).unwrap();
        let audio = decode(&merged).unwrap();
        assert_eq!(audio.samples, Samples::Int(vec![1, 2, 3]));
        assert_eq!(audio.spec, pcm16_spec(16_000, 1));
    }

    #[test]
    fn merge_rejects_mixed_formats() {
        let a = encode_pcm16(&[1], 16_000, 1).unwrap();
        let b = encode_pcm16(&[1], 22_050, 1).unwrap();
        assert!(matches!(merge(&[a, b]), Err(WavError::FormatMismatch(_, _))));
        assert!(matches!(merge::<Vec<u8>>(&[]), Err(WavError::Empty)));
    }
}
