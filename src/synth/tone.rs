//! Local tone generator standing in for a speech engine.
//!
//! Produces a sine wave whose length follows the text length (50 ms per
//! character, divided by `speed`) and whose pitch is derived from the text,
//! so identical input always yields identical audio.

use std::collections::hash_map::DefaultHasher;
use std::f64::consts::TAU;
use std::hash::{Hash, Hasher};

use crate::output::wav;

use super::backend::{SynthesisBackend, SynthesisError};

pub const TONE_SAMPLE_RATE: u32 = 22_050;
const SECONDS_PER_CHAR: f64 = 0.05;
const BASE_FREQUENCY_HZ: f64 = 440.0;
const FREQUENCY_SPREAD_HZ: u64 = 200;
const AMPLITUDE: f64 = 0.1;

#[derive(Debug, Clone)]
pub struct ToneBackend {
    sample_rate: u32,
}

impl ToneBackend {
    pub fn new() -> Self {
        Self {
            sample_rate: TONE_SAMPLE_RATE,
        }
    }

    fn frequency_for(text: &str) -> f64 {
        let mut hasher = DefaultHasher::new();
        text.hash(&mut hasher);
        BASE_FREQUENCY_HZ + (hasher.finish() % FREQUENCY_SPREAD_HZ) as f64
    }
}

impl Default for ToneBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl SynthesisBackend for ToneBackend {
    fn synthesize(&self, text: &str, _voice: &str, speed: f32) -> Result<Vec<u8>, SynthesisError> {
        if !(speed > 0.0 && speed.is_finite()) {
            return Err(SynthesisError::FatalConfig(format!(
                "speed must be positive, got {speed}"
            )));
        }

        let seconds = text.chars().count() as f64 * SECONDS_PER_CHAR / f64::from(speed);
        let n_samples = (seconds * f64::from(self.sample_rate)).round() as usize;
        let freq = Self::frequency_for(text);
        let rate = f64::from(self.sample_rate);

        let samples: Vec<i16> = (0..n_samples)
            .map(|i| {
                let t = i as f64 / rate;
                (AMPLITUDE * (TAU * freq * t).sin() * f64::from(i16::MAX)) as i16
            })
            .collect();

        wav::encode_pcm16(&samples, self.sample_rate, 1).map_err(|e| {
            log::error!("tone: failed to encode {} samples: {e}", samples.len());
            SynthesisError::FatalConfig(format!("failed to encode audio: {e}"))
        })
    }

    fn name(&self) -> &str {
        "tone"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn duration_follows_text_length_and_speed() {
        let backend = ToneBackend::new();
        let text = "x".repeat(20); // 20 chars → 1 s at speed 1.0
        let normal = backend.synthesize(&text, "v", 1.0).unwrap();
        let fast = backend.synthesize(&text, "v", 2.0).unwrap();

        let normal = wav::decode(&normal).unwrap();
        let fast = wav::decode(&fast).unwrap();
        assert!((normal.duration_secs() - 1.0).abs() < 1e-3);
        assert!((fast.duration_secs() - 0.5).abs() < 1e-3);
    }

    #[test]
    fn output_is_deterministic() {
        let backend = ToneBackend::new();
        let a = backend.synthesize("Hello there.", "v", 1.0).unwrap();
        let b = backend.synthesize("Hello there.", "v", 1.0).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn samples_stay_within_amplitude() {
        let bytes = ToneBackend::new().synthesize("abcdef", "v", 1.0).unwrap();
        let audio = wav::decode(&bytes).unwrap();
        let limit = (AMPLITUDE * f64::from(i16::MAX)).ceil() as i32;
        let wav::Samples::Int(samples) = audio.samples else {
            panic!("expected integer samples");
        };
        assert!(!samples.is_empty());
        assert!(samples.iter().all(|s| s.abs() <= limit));
    }

    #[test]
    fn rejects_non_positive_speed() {
        let err = ToneBackend::new().synthesize("a", "v", 0.0).unwrap_err();
        assert!(matches!(err, SynthesisError::FatalConfig(_)));
    }

    #[test]
    fn frequency_stays_in_band() {
        for text in ["", "a", "The quick brown fox."] {
            let f = ToneBackend::frequency_for(text);
            assert!((440.0..640.0).contains(&f));
        }
    }
}
