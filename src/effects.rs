//! Effects that can sit between an instrument and the output node.

use std::f32::consts::TAU;
use std::sync::{Arc, Mutex};

use crate::graph::{lock, Link, MAX_ROUTE_DEPTH};
use crate::synth::db_to_gain;

/// Freeverb comb and allpass delays, in samples at 44.1 kHz.
const COMB_TUNINGS: [usize; 8] = [1116, 1188, 1277, 1356, 1422, 1491, 1557, 1617];
const ALLPASS_TUNINGS: [usize; 4] = [556, 441, 341, 225];
const ALLPASS_FEEDBACK: f32 = 0.5;
const REVERB_DAMPING: f32 = 0.2;
const REVERB_INPUT_GAIN: f32 = 0.15;

struct CombFilter {
    buffer: Vec<f32>,
    pos: usize,
    filter_state: f32,
}

impl CombFilter {
    fn new(size: usize) -> Self {
        Self {
            buffer: vec![0.0; size.max(1)],
            pos: 0,
            filter_state: 0.0,
        }
    }

    fn process(&mut self, input: f32, feedback: f32) -> f32 {
        let output = self.buffer[self.pos];
        self.filter_state = output * (1.0 - REVERB_DAMPING) + self.filter_state * REVERB_DAMPING;
        self.buffer[self.pos] = input + self.filter_state * feedback;
        self.pos = (self.pos + 1) % self.buffer.len();
        output
    }
}

struct AllpassFilter {
    buffer: Vec<f32>,
    pos: usize,
}

impl AllpassFilter {
    fn new(size: usize) -> Self {
        Self {
            buffer: vec![0.0; size.max(1)],
            pos: 0,
        }
    }

    fn process(&mut self, input: f32) -> f32 {
        let delayed = self.buffer[self.pos];
        let output = delayed - input;
        self.buffer[self.pos] = input + delayed * ALLPASS_FEEDBACK;
        self.pos = (self.pos + 1) % self.buffer.len();
        output
    }
}

/// Mono Freeverb-style reverb. `decay` is the time in seconds for the
/// tail to fall by 60 dB.
pub struct Reverb {
    pub decay: f32,
    pub wet: f32,
    sample_rate: f32,
    combs: Vec<CombFilter>,
    feedback: Vec<f32>,
    allpasses: Vec<AllpassFilter>,
}

impl Reverb {
    pub fn new(decay: f32, wet: f32) -> Self {
        Self {
            decay: decay.max(0.001),
            wet: wet.clamp(0.0, 1.0),
            sample_rate: 0.0,
            combs: Vec::new(),
            feedback: Vec::new(),
            allpasses: Vec::new(),
        }
    }

    fn prepare(&mut self, sample_rate: f32) {
        if self.sample_rate == sample_rate {
            return;
        }
        let scale = sample_rate / 44_100.0;
        self.combs = COMB_TUNINGS
            .iter()
            .map(|&t| CombFilter::new((t as f32 * scale) as usize))
            .collect();
        self.feedback = COMB_TUNINGS
            .iter()
            .map(|&t| {
                let delay_seconds = t as f32 / 44_100.0;
                10.0_f32.powf(-3.0 * delay_seconds / self.decay)
            })
            .collect();
        self.allpasses = ALLPASS_TUNINGS
            .iter()
            .map(|&t| AllpassFilter::new((t as f32 * scale) as usize))
            .collect();
        self.sample_rate = sample_rate;
    }

    fn process(&mut self, buffer: &mut [f32], sample_rate: f32) {
        self.prepare(sample_rate);
        for sample in buffer.iter_mut() {
            let input = *sample * REVERB_INPUT_GAIN;
            let mut out = 0.0;
            for (comb, &feedback) in self.combs.iter_mut().zip(self.feedback.iter()) {
                out += comb.process(input, feedback);
            }
            for allpass in &mut self.allpasses {
                out = allpass.process(out);
            }
            *sample = *sample * (1.0 - self.wet) + out * self.wet;
        }
    }
}

/// Echo with feedback.
pub struct FeedbackDelay {
    pub delay_time: f32,
    pub feedback: f32,
    pub wet: f32,
    buffer: Vec<f32>,
    pos: usize,
    sample_rate: f32,
}

impl FeedbackDelay {
    pub fn new(delay_time: f32, feedback: f32, wet: f32) -> Self {
        Self {
            delay_time: delay_time.clamp(0.001, 5.0),
            feedback: feedback.clamp(0.0, 0.99),
            wet: wet.clamp(0.0, 1.0),
            buffer: Vec::new(),
            pos: 0,
            sample_rate: 0.0,
        }
    }

    fn process(&mut self, buffer: &mut [f32], sample_rate: f32) {
        if self.sample_rate != sample_rate {
            let len = ((self.delay_time * sample_rate) as usize).max(1);
            self.buffer = vec![0.0; len];
            self.pos = 0;
            self.sample_rate = sample_rate;
        }
        for sample in buffer.iter_mut() {
            let delayed = self.buffer[self.pos];
            self.buffer[self.pos] = *sample + delayed * self.feedback;
            self.pos = (self.pos + 1) % self.buffer.len();
            *sample = *sample * (1.0 - self.wet) + delayed * self.wet;
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FilterType {
    Lowpass,
    Highpass,
    Bandpass,
}

impl FilterType {
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "lowpass" => Some(FilterType::Lowpass),
            "highpass" => Some(FilterType::Highpass),
            "bandpass" => Some(FilterType::Bandpass),
            _ => None,
        }
    }
}

/// RBJ biquad.
pub struct Filter {
    pub filter_type: FilterType,
    pub frequency: f32,
    pub q: f32,
    coefficients: [f32; 5],
    state: [f32; 4],
    sample_rate: f32,
}

impl Filter {
    pub fn new(filter_type: FilterType, frequency: f32, q: f32) -> Self {
        Self {
            filter_type,
            frequency: frequency.max(1.0),
            q: q.max(0.01),
            coefficients: [0.0; 5],
            state: [0.0; 4],
            sample_rate: 0.0,
        }
    }

    fn update_coefficients(&mut self, sample_rate: f32) {
        let frequency = self.frequency.min(sample_rate * 0.45);
        let w0 = TAU * frequency / sample_rate;
        let alpha = w0.sin() / (2.0 * self.q);
        let cos_w0 = w0.cos();
        let (b0, b1, b2) = match self.filter_type {
            FilterType::Lowpass => ((1.0 - cos_w0) / 2.0, 1.0 - cos_w0, (1.0 - cos_w0) / 2.0),
            FilterType::Highpass => ((1.0 + cos_w0) / 2.0, -(1.0 + cos_w0), (1.0 + cos_w0) / 2.0),
            FilterType::Bandpass => (alpha, 0.0, -alpha),
        };
        let a0 = 1.0 + alpha;
        let a1 = -2.0 * cos_w0;
        let a2 = 1.0 - alpha;
        self.coefficients = [b0 / a0, b1 / a0, b2 / a0, a1 / a0, a2 / a0];
        self.sample_rate = sample_rate;
    }

    fn process(&mut self, buffer: &mut [f32], sample_rate: f32) {
        if self.sample_rate != sample_rate {
            self.update_coefficients(sample_rate);
        }
        let [b0, b1, b2, a1, a2] = self.coefficients;
        let [x1, x2, y1, y2] = &mut self.state;
        for sample in buffer.iter_mut() {
            let x0 = *sample;
            let y0 = b0 * x0 + b1 * *x1 + b2 * *x2 - a1 * *y1 - a2 * *y2;
            *x2 = *x1;
            *x1 = x0;
            *y2 = *y1;
            *y1 = y0;
            *sample = y0;
        }
    }
}

/// Soft-clipping waveshaper; `amount` in 0..=1.
pub struct Distortion {
    pub amount: f32,
    pub wet: f32,
}

impl Distortion {
    pub fn new(amount: f32, wet: f32) -> Self {
        Self {
            amount: amount.clamp(0.0, 1.0),
            wet: wet.clamp(0.0, 1.0),
        }
    }

    fn process(&mut self, buffer: &mut [f32]) {
        let k = 2.0 * self.amount / (1.0 - self.amount).max(0.01);
        for sample in buffer.iter_mut() {
            let x = *sample;
            let shaped = (1.0 + k) * x / (1.0 + k * x.abs());
            *sample = x * (1.0 - self.wet) + shaped * self.wet;
        }
    }
}

pub enum Effect {
    Reverb(Reverb),
    FeedbackDelay(FeedbackDelay),
    Filter(Filter),
    Distortion(Distortion),
    /// Fixed gain stage, in dB.
    Volume(f32),
}

impl Effect {
    pub fn name(&self) -> &'static str {
        match self {
            Effect::Reverb(_) => "Reverb",
            Effect::FeedbackDelay(_) => "FeedbackDelay",
            Effect::Filter(_) => "Filter",
            Effect::Distortion(_) => "Distortion",
            Effect::Volume(_) => "Volume",
        }
    }

    pub fn process(&mut self, buffer: &mut [f32], sample_rate: f32) {
        match self {
            Effect::Reverb(reverb) => reverb.process(buffer, sample_rate),
            Effect::FeedbackDelay(delay) => delay.process(buffer, sample_rate),
            Effect::Filter(filter) => filter.process(buffer, sample_rate),
            Effect::Distortion(distortion) => distortion.process(buffer),
            Effect::Volume(db) => {
                let gain = db_to_gain(*db);
                buffer.iter_mut().for_each(|s| *s *= gain);
            }
        }
    }
}

struct EffectNode {
    effect: Effect,
    route: Option<Link>,
    /// Sum of everything routed here during the current block.
    input: Vec<f32>,
}

/// Shared handle to an effect and the link it feeds.
#[derive(Clone)]
pub struct EffectHandle(Arc<Mutex<EffectNode>>);

impl EffectHandle {
    pub fn new(effect: Effect) -> Self {
        Self(Arc::new(Mutex::new(EffectNode {
            effect,
            route: None,
            input: Vec::new(),
        })))
    }

    pub fn name(&self) -> &'static str {
        lock(&self.0).effect.name()
    }

    pub fn ptr_eq(&self, other: &EffectHandle) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }

    pub fn connect(&self, link: Link) {
        lock(&self.0).route = Some(link);
    }

    pub fn route(&self) -> Option<Link> {
        lock(&self.0).route.clone()
    }

    /// Starts a block of `frames` samples with silent input.
    pub fn clear_input(&self, frames: usize) {
        let mut node = lock(&self.0);
        node.input.clear();
        node.input.resize(frames, 0.0);
    }

    /// Mixes `samples` into this block's input.
    pub fn accumulate(&self, samples: &[f32]) {
        let mut node = lock(&self.0);
        if node.input.len() < samples.len() {
            node.input.resize(samples.len(), 0.0);
        }
        for (input, sample) in node.input.iter_mut().zip(samples) {
            *input += *sample;
        }
    }

    /// Runs the effect once over the block's summed input, writes the
    /// result to `out` and returns the next hop.
    pub fn process_input(&self, out: &mut [f32], sample_rate: f32) -> Option<Link> {
        let mut node = lock(&self.0);
        let EffectNode {
            effect,
            route,
            input,
        } = &mut *node;
        input.resize(out.len(), 0.0);
        effect.process(input, sample_rate);
        out.copy_from_slice(input);
        route.clone()
    }
}

/// Whether following links from `from` ever reaches `target`.
pub fn reaches(from: &Link, target: &EffectHandle) -> bool {
    let mut link = Some(from.clone());
    for _ in 0..MAX_ROUTE_DEPTH {
        match link {
            Some(Link::Effect(effect)) => {
                if effect.ptr_eq(target) {
                    return true;
                }
                link = effect.route();
            }
            _ => return false,
        }
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    const SR: f32 = 44_100.0;

    fn impulse(len: usize) -> Vec<f32> {
        let mut buffer = vec![0.0; len];
        buffer[0] = 1.0;
        buffer
    }

    fn energy(buffer: &[f32]) -> f32 {
        buffer.iter().map(|s| s * s).sum()
    }

    #[test]
    fn test_reverb_produces_a_tail() {
        let mut effect = Effect::Reverb(Reverb::new(2.0, 1.0));
        let mut buffer = impulse(4096);
        effect.process(&mut buffer, SR);
        assert!(energy(&buffer[2000..]) > 0.0);
    }

    #[test]
    fn test_delay_echoes_after_delay_time() {
        let mut effect = Effect::FeedbackDelay(FeedbackDelay::new(0.01, 0.5, 1.0));
        let mut buffer = impulse(1000);
        effect.process(&mut buffer, SR);
        let echo = (0.01 * SR) as usize;
        assert_eq!(buffer[0], 0.0);
        assert!((buffer[echo] - 1.0).abs() < 1e-6);
        assert!((buffer[2 * echo] - 0.5).abs() < 1e-6);
    }

    #[test]
    fn test_lowpass_attenuates_high_frequencies() {
        let mut filter = Effect::Filter(Filter::new(FilterType::Lowpass, 200.0, 0.707));
        let mut buffer: Vec<f32> = (0..4096)
            .map(|i| (TAU * 8000.0 * i as f32 / SR).sin())
            .collect();
        let before = energy(&buffer);
        filter.process(&mut buffer, SR);
        assert!(energy(&buffer) < before * 0.01);
    }

    #[test]
    fn test_distortion_stays_bounded() {
        let mut effect = Effect::Distortion(Distortion::new(0.9, 1.0));
        let mut buffer = vec![-1.0, -0.5, 0.0, 0.5, 1.0];
        effect.process(&mut buffer, SR);
        assert!(buffer.iter().all(|s| s.abs() <= 1.0 + 1e-6));
        assert!(buffer[3] > 0.5);
    }

    #[test]
    fn test_volume_effect() {
        let mut effect = Effect::Volume(-20.0);
        let mut buffer = vec![1.0; 4];
        effect.process(&mut buffer, SR);
        assert!(buffer.iter().all(|s| (s - 0.1).abs() < 1e-6));
    }

    #[test]
    fn test_reaches_follows_links() {
        let a = EffectHandle::new(Effect::Volume(0.0));
        let b = EffectHandle::new(Effect::Volume(0.0));
        a.connect(Link::Effect(b.clone()));
        assert!(reaches(&Link::Effect(a.clone()), &b));
        assert!(!reaches(&Link::Effect(b.clone()), &a));
        assert!(!reaches(&Link::Output, &a));
        assert_eq!(a.name(), "Volume");
    }

    #[test]
    fn test_handle_processes_summed_input() {
        let effect = EffectHandle::new(Effect::Volume(0.0));
        let mut out = vec![0.0; 2];
        effect.clear_input(2);
        effect.accumulate(&[0.25, 0.5]);
        effect.accumulate(&[0.25, 0.5]);
        assert!(effect.process_input(&mut out, SR).is_none());
        assert_eq!(out, vec![0.5, 1.0]);

        effect.connect(Link::Output);
        effect.clear_input(2);
        assert!(matches!(effect.process_input(&mut out, SR), Some(Link::Output)));
        assert_eq!(out, vec![0.0, 0.0]);
    }
}
