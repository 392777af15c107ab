use anyhow::Result;
use rodio::buffer::SamplesBuffer;
use rodio::{OutputStream, Sink};
use tracing::{debug, warn};

pub const SAMPLE_RATE: u32 = 44100;

const CHIME_SECONDS: f32 = 0.5;
const START_GAIN: f32 = 0.3;
const END_GAIN: f32 = 0.01;

/// Something that can make an audible alert.
pub trait AlertChime: Send + Sync {
    fn play(&self);
}

/// Two-tone chime: 800 Hz, 1000 Hz from 0.1 s, back to 800 Hz from 0.2 s,
/// with gain falling exponentially from 0.3 to 0.01 over 0.5 s.
pub fn synthesize_chime(sample_rate: u32) -> Vec<f32> {
    let total_samples = (CHIME_SECONDS * sample_rate as f32) as usize;
    let mut samples = Vec::with_capacity(total_samples);
    let mut phase = 0.0f32;

    for i in 0..total_samples {
        let t = i as f32 / sample_rate as f32;
        let frequency = if (0.1..0.2).contains(&t) { 1000.0 } else { 800.0 };
        let gain = START_GAIN * (END_GAIN / START_GAIN).powf(t / CHIME_SECONDS);

        samples.push(phase.sin() * gain);
        phase += 2.0 * std::f32::consts::PI * frequency / sample_rate as f32;
        if phase > 2.0 * std::f32::consts::PI {
            phase -= 2.0 * std::f32::consts::PI;
        }
    }

    samples
}

/// Plays the chime on the default output device via rodio.
pub struct RodioChime {
    samples: Vec<f32>,
}

impl RodioChime {
    pub fn new() -> Self {
        Self {
            samples: synthesize_chime(SAMPLE_RATE),
        }
    }

    fn play_blocking(samples: Vec<f32>) -> Result<()> {
        let (_stream, handle) = OutputStream::try_default()?;
        let sink = Sink::try_new(&handle)?;
        sink.append(SamplesBuffer::new(1, SAMPLE_RATE, samples));
        sink.sleep_until_end();
        Ok(())
    }
}

impl Default for RodioChime {
    fn default() -> Self {
        Self::new()
    }
}

impl AlertChime for RodioChime {
    fn play(&self) {
        // The output stream is not Send, so it lives and dies on its own thread
        let samples = self.samples.clone();
        let spawned = std::thread::Builder::new()
            .name("visionwatch-chime".to_string())
            .spawn(move || {
                if let Err(e) = Self::play_blocking(samples) {
                    warn!("Alert sound unavailable: {}", e);
                }
            });
        if let Err(e) = spawned {
            warn!("Failed to spawn chime thread: {}", e);
        }
    }
}

/// Chime used when sound is disabled.
pub struct SilentChime;

impl AlertChime for SilentChime {
    fn play(&self) {
        debug!("🔕 Alert sound disabled");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chime_lasts_half_a_second() {
        let samples = synthesize_chime(8000);
        assert_eq!(samples.len(), 4000);
    }

    #[test]
    fn chime_decays_from_start_gain() {
        let samples = synthesize_chime(8000);
        let head = samples[..400].iter().fold(0.0f32, |m, s| m.max(s.abs()));
        let tail = samples[3600..].iter().fold(0.0f32, |m, s| m.max(s.abs()));

        assert!(head <= START_GAIN + 1e-6);
        assert!(head > 0.2);
        assert!(tail < 0.02);
    }
}
