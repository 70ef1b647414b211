/*
 * RPG Scribe - Rust Edition
 * Copyright (c) 2024 RPG Scribe Contributors
 *
 * This work is licensed under the Creative Commons Attribution-NonCommercial 4.0 International License.
 * To view a copy of this license, visit http://creativecommons.org/licenses/by-nc/4.0/
 *
 * You are free to share and adapt this work for non-commercial purposes with attribution.
 * Commercial use is prohibited without explicit written permission.
 *
 * For commercial licensing inquiries, please contact the project maintainers.
 */

//! Thin wrapper around `webrtc-vad` with the segmenter's fail-open policy:
//! if the classifier is unavailable for a frame's size or its call errors,
//! treat the frame as speech so silence heuristics never falsely fire.

use webrtc_vad::{SampleRate, Vad, VadMode};

/// 20ms of mono 16-bit samples at 48 kHz, the only frame size the
/// segmenter feeds the VAD.
pub const FRAME_SAMPLES_48K_20MS: usize = 960;

fn mode_for_aggressiveness(aggressiveness: u8) -> VadMode {
    match aggressiveness {
        0 => VadMode::Quality,
        1 => VadMode::LowBitrate,
        2 => VadMode::Aggressive,
        _ => VadMode::VeryAggressive,
    }
}

pub struct VoiceActivityDetector {
    vad: Vad,
}

impl VoiceActivityDetector {
    pub fn new(aggressiveness: u8) -> Self {
        Self {
            vad: Vad::new_with_rate_and_mode(SampleRate::Rate48kHz, mode_for_aggressiveness(aggressiveness)),
        }
    }

    /// Classifies one 20ms frame of mono 16-bit samples. Degrades to
    /// "speech" on a malformed frame (not a multiple of the expected size)
    /// or a classifier error.
    pub fn is_speech(&mut self, frame: &[i16]) -> bool {
        if frame.len() != FRAME_SAMPLES_48K_20MS {
            return true;
        }
        self.vad.is_voice_segment(frame).unwrap_or(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn degrades_to_speech_on_wrong_frame_size() {
        let mut vad = VoiceActivityDetector::new(2);
        let short_frame = vec![0i16; 100];
        assert!(vad.is_speech(&short_frame));
    }
}
