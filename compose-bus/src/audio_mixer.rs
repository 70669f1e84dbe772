use bytes::Bytes;

use crate::audio_sample::AudioSample;

/// Mixes interleaved s16 PCM buffers into one.
///
/// Each input is scaled by `1/n` and the sum saturates at the s16 range. The
/// output has the length of the first buffer; shorter inputs contribute what
/// they have. A single input is returned as is.
pub fn mix_samples(samples: &[AudioSample]) -> Option<Bytes> {
    match samples {
        [] => None,
        [only] => Some(only.buffer().clone()),
        _ => {
            let buffers: Vec<&[u8]> = samples.iter().map(|s| s.buffer().as_ref()).collect();
            Some(Bytes::from(mix_pcm16(&buffers)))
        }
    }
}

pub fn mix_pcm16(buffers: &[&[u8]]) -> Vec<u8> {
    let Some(first) = buffers.first() else {
        return Vec::new();
    };
    let len = first.len() & !1;
    let scale = 1.0 / buffers.len() as f32;
    let mut acc = vec![0f32; len / 2];

    for buffer in buffers {
        for (slot, pair) in acc.iter_mut().zip(buffer.chunks_exact(2)) {
            *slot += i16::from_le_bytes([pair[0], pair[1]]) as f32 * scale;
        }
    }

    let mut mixed = Vec::with_capacity(len);
    for value in acc {
        let s = value.clamp(i16::MIN as f32, i16::MAX as f32) as i16;
        mixed.extend_from_slice(&s.to_le_bytes());
    }
    mixed
}

/// Interleaved s16 silence covering `duration_us`.
pub fn silence(duration_us: i64, sample_rate: u32, channels: u32) -> Bytes {
    let frames = (duration_us.max(0) as u128 * sample_rate as u128 / 1_000_000) as usize;
    Bytes::from(vec![0u8; frames * channels as usize * 2])
}
