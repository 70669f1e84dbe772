use bytes::Bytes;

use crate::{
    error::{ComposeError, Result},
    time::us_to_sec,
};

/// Bytes per interleaved signed 16-bit sample.
const BYTES_PER_SAMPLE: usize = 2;

/// Decoded interleaved s16 PCM pulled from one item.
///
/// The buffer is a shared `Bytes` handle: handing the sample to a caller
/// never copies the payload.
#[derive(Clone)]
pub struct AudioSample {
    buffer: Bytes,
    presentation_time_us: i64,
    duration_us: i64,
    sample_rate: u32,
    channels: u32,
}

impl AudioSample {
    pub fn new(
        buffer: Bytes,
        presentation_time_us: i64,
        duration_us: i64,
        sample_rate: u32,
        channels: u32,
    ) -> Result<Self> {
        if sample_rate == 0 || channels == 0 {
            return Err(ComposeError::InvalidSample(format!(
                "sample rate {} / channels {}",
                sample_rate, channels
            )));
        }
        if buffer.is_empty() {
            return Err(ComposeError::InvalidSample("empty buffer".to_string()));
        }
        if buffer.len() % (BYTES_PER_SAMPLE * channels as usize) != 0 {
            return Err(ComposeError::InvalidSample(format!(
                "buffer of {} bytes is not a whole number of {}-channel s16 frames",
                buffer.len(),
                channels
            )));
        }
        if duration_us < 0 {
            return Err(ComposeError::InvalidSample(format!(
                "negative duration {}",
                duration_us
            )));
        }
        Ok(Self {
            buffer,
            presentation_time_us,
            duration_us,
            sample_rate,
            channels,
        })
    }

    /// Duration of `len` bytes of interleaved s16 PCM.
    pub fn pcm_duration_us(len: usize, sample_rate: u32, channels: u32) -> i64 {
        if sample_rate == 0 || channels == 0 {
            return 0;
        }
        let frames = len / (BYTES_PER_SAMPLE * channels as usize);
        (frames as f64 / sample_rate as f64 * 1_000_000.0) as i64
    }

    pub fn buffer(&self) -> &Bytes {
        &self.buffer
    }

    pub fn into_buffer(self) -> Bytes {
        self.buffer
    }

    pub fn presentation_time_us(&self) -> i64 {
        self.presentation_time_us
    }

    pub fn presentation_time(&self) -> f64 {
        us_to_sec(self.presentation_time_us)
    }

    pub fn duration_us(&self) -> i64 {
        self.duration_us
    }

    pub fn duration(&self) -> f64 {
        us_to_sec(self.duration_us)
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn channels(&self) -> u32 {
        self.channels
    }

    pub fn frame_count(&self) -> usize {
        self.buffer.len() / (BYTES_PER_SAMPLE * self.channels as usize)
    }
}

impl std::fmt::Debug for AudioSample {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AudioSample")
            .field("len", &self.buffer.len())
            .field("presentation_time_us", &self.presentation_time_us)
            .field("duration_us", &self.duration_us)
            .field("sample_rate", &self.sample_rate)
            .field("channels", &self.channels)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_duration_from_payload() {
        // 1024 stereo frames at 44.1kHz
        let len = 1024 * 2 * 2;
        assert_eq!(AudioSample::pcm_duration_us(len, 44_100, 2), 23_219);
        let sample = AudioSample::new(Bytes::from(vec![0u8; len]), 0, 23_219, 44_100, 2).unwrap();
        assert_eq!(sample.frame_count(), 1024);
    }

    #[test]
    fn test_rejects_invalid_samples() {
        assert!(AudioSample::new(Bytes::new(), 0, 0, 44_100, 2).is_err());
        assert!(AudioSample::new(Bytes::from(vec![0u8; 4]), 0, 0, 0, 2).is_err());
        assert!(AudioSample::new(Bytes::from(vec![0u8; 6]), 0, 0, 44_100, 2).is_err());
    }

    #[test]
    fn test_buffer_is_shared() {
        let data = Bytes::from(vec![1u8; 8]);
        let sample = AudioSample::new(data.clone(), 0, 0, 8000, 1).unwrap();
        assert_eq!(sample.buffer().as_ptr(), data.as_ptr());
    }
}
