//! Rate and channel conversion for devices that cannot run at the live
//! API's rates. Linear interpolation is plenty for speech.

/// Average interleaved frames down to mono into `out`.
pub fn downmix(data: &[f32], channels: usize, out: &mut Vec<f32>) {
    out.clear();
    let channels = channels.max(1);
    out.extend(
        data.chunks_exact(channels)
            .map(|frame| frame.iter().sum::<f32>() / channels as f32),
    );
}

/// Streaming mono resampler. Keeps the tail of each block so consecutive
/// blocks interpolate across the seam.
#[derive(Debug, Clone)]
pub struct LinearResampler {
    from_rate: u32,
    to_rate: u32,
    /// Input frames per output frame.
    step: f64,
    /// Position of the next output sample, relative to `carry[0]`.
    pos: f64,
    carry: Vec<f32>,
}

impl LinearResampler {
    pub fn new(from_rate: u32, to_rate: u32) -> Self {
        let from_rate = from_rate.max(1);
        let to_rate = to_rate.max(1);
        Self {
            from_rate,
            to_rate,
            step: f64::from(from_rate) / f64::from(to_rate),
            pos: 0.0,
            carry: Vec::new(),
        }
    }

    pub fn from_rate(&self) -> u32 {
        self.from_rate
    }

    pub fn to_rate(&self) -> u32 {
        self.to_rate
    }

    /// Resample the next block into `out` (cleared first).
    pub fn process(&mut self, input: &[f32], out: &mut Vec<f32>) {
        out.clear();
        self.carry.extend_from_slice(input);
        let total = self.carry.len();

        let mut pos = self.pos;
        while pos + 1.0 < total as f64 {
            let base = pos as usize;
            let frac = (pos - base as f64) as f32;
            let s0 = self.carry[base];
            let s1 = self.carry[base + 1];
            out.push(s0 + (s1 - s0) * frac);
            pos += self.step;
        }

        let keep_from = (pos as usize).min(total);
        self.carry.drain(..keep_from);
        self.pos = pos - keep_from as f64;
    }
}

/// Turns interleaved device blocks into mono at the capture rate.
#[derive(Debug)]
pub struct MonoConverter {
    channels: usize,
    resampler: Option<LinearResampler>,
    mono: Vec<f32>,
    resampled: Vec<f32>,
}

impl MonoConverter {
    pub fn new(device_rate: u32, channels: u16, target_rate: u32) -> Self {
        Self {
            channels: usize::from(channels.max(1)),
            resampler: (device_rate != target_rate)
                .then(|| LinearResampler::new(device_rate, target_rate)),
            mono: Vec::new(),
            resampled: Vec::new(),
        }
    }

    /// Convert one block. The returned slice is valid until the next call.
    pub fn convert(&mut self, block: &[f32]) -> &[f32] {
        downmix(block, self.channels, &mut self.mono);
        match self.resampler.as_mut() {
            Some(resampler) => {
                resampler.process(&self.mono, &mut self.resampled);
                &self.resampled
            }
            None => &self.mono,
        }
    }
}

/// One-shot resample of interleaved audio. The last frame is held at the
/// end instead of interpolating past it.
pub fn resample_interleaved(
    samples: &[f32],
    channels: usize,
    from_rate: u32,
    to_rate: u32,
) -> Vec<f32> {
    let channels = channels.max(1);
    if from_rate == to_rate || from_rate == 0 || to_rate == 0 {
        return samples.to_vec();
    }
    let frames = samples.len() / channels;
    if frames == 0 {
        return Vec::new();
    }

    let ratio = f64::from(from_rate) / f64::from(to_rate);
    let out_frames = (frames as f64 / ratio).round() as usize;
    let mut out = Vec::with_capacity(out_frames * channels);
    for i in 0..out_frames {
        let src = i as f64 * ratio;
        let base = (src as usize).min(frames - 1);
        let next = (base + 1).min(frames - 1);
        let frac = (src - base as f64).clamp(0.0, 1.0) as f32;
        for ch in 0..channels {
            let s0 = samples[base * channels + ch];
            let s1 = samples[next * channels + ch];
            out.push(s0 + (s1 - s0) * frac);
        }
    }
    out
}
