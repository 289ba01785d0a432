//! The shared output node and the links that route audio into it.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use crate::effects::EffectHandle;
use crate::synth::{db_to_gain, SynthSet};

/// Samples kept for the scope display.
pub const WAVEFORM_LEN: usize = 1024;

/// Longest effect chain followed from any node.
pub const MAX_ROUTE_DEPTH: usize = 32;

/// Locks a mutex, recovering the data if a previous holder panicked.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Where a node sends its output.
#[derive(Clone)]
pub enum Link {
    Effect(EffectHandle),
    Output,
}

impl std::fmt::Debug for Link {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Link::Effect(effect) => write!(f, "Effect({})", effect.name()),
            Link::Output => write!(f, "Output"),
        }
    }
}

/// The single endpoint every instrument is routed to. It survives synth
/// rebuilds, carries the master volume and holds the active synth set
/// that the audio thread renders.
pub struct OutputNode {
    /// Master volume in dB, stored as `f32` bits.
    volume_db: AtomicU32,
    active: Mutex<SynthSet>,
    waveform: Mutex<Vec<f32>>,
    scratch: Mutex<Vec<f32>>,
    mix: Mutex<Vec<f32>>,
}

impl OutputNode {
    pub fn new(volume_db: f32) -> Self {
        Self {
            volume_db: AtomicU32::new(volume_db.to_bits()),
            active: Mutex::new(SynthSet::default()),
            waveform: Mutex::new(vec![0.0; WAVEFORM_LEN]),
            scratch: Mutex::new(Vec::new()),
            mix: Mutex::new(Vec::new()),
        }
    }

    pub fn set_volume_db(&self, volume_db: f32) {
        self.volume_db.store(volume_db.to_bits(), Ordering::Relaxed);
    }

    pub fn volume_db(&self) -> f32 {
        f32::from_bits(self.volume_db.load(Ordering::Relaxed))
    }

    /// Linear gain for the current volume.
    pub fn gain(&self) -> f32 {
        db_to_gain(self.volume_db())
    }

    /// Makes `set` the active synth set and hands back the previous one.
    pub fn install(&self, set: SynthSet) -> SynthSet {
        std::mem::replace(&mut *lock(&self.active), set)
    }

    pub fn active(&self) -> SynthSet {
        lock(&self.active).clone()
    }

    /// Copy of the most recent output samples.
    pub fn waveform(&self) -> Vec<f32> {
        lock(&self.waveform).clone()
    }

    /// Renders the active set into an interleaved buffer with `channels`
    /// channels.
    pub fn render(&self, data: &mut [f32], channels: usize, sample_rate: f32) {
        let channels = channels.max(1);
        let frames = data.len() / channels;

        let mut mix = lock(&self.mix);
        let mut scratch = lock(&self.scratch);
        mix.clear();
        mix.resize(frames, 0.0);
        scratch.resize(frames, 0.0);
        let scratch = &mut scratch[..frames];

        // every effect runs once per block on the sum of its inputs
        let mut effects: Vec<(EffectHandle, usize)> = Vec::new();
        let active = self.active();
        for synth in active.handles() {
            let Some(link) = synth.render(scratch, sample_rate) else {
                continue;
            };
            for sample in scratch.iter_mut() {
                if !sample.is_finite() {
                    *sample = 0.0;
                }
            }
            register_chain(&link, frames, &mut effects);
            deliver(&link, scratch, &mut mix);
        }

        // a node always sits more hops from the end than anything it feeds
        effects.sort_by(|a, b| b.1.cmp(&a.1));
        for (effect, _) in &effects {
            if let Some(next) = effect.process_input(scratch, sample_rate) {
                deliver(&next, scratch, &mut mix);
            }
        }

        let gain = self.gain();
        for (frame, value) in data.chunks_mut(channels).zip(mix.iter_mut()) {
            let scaled = *value * gain;
            *value = if scaled.is_finite() {
                scaled.clamp(-1.0, 1.0)
            } else {
                0.0
            };
            for sample in frame.iter_mut() {
                *sample = *value;
            }
        }

        let mut waveform = lock(&self.waveform);
        let keep = frames.min(WAVEFORM_LEN);
        waveform.rotate_left(keep);
        let start = WAVEFORM_LEN - keep;
        waveform[start..].copy_from_slice(&mix[frames - keep..frames]);
    }
}

/// Adds every effect on the chain starting at `link` to `effects`, with a
/// cleared input, unless it is already there.
fn register_chain(link: &Link, frames: usize, effects: &mut Vec<(EffectHandle, usize)>) {
    let mut link = Some(link.clone());
    for _ in 0..MAX_ROUTE_DEPTH {
        let Some(Link::Effect(effect)) = link.take() else {
            return;
        };
        if effects.iter().any(|(known, _)| known.ptr_eq(&effect)) {
            return;
        }
        effect.clear_input(frames);
        link = effect.route();
        let depth = hops(&effect);
        effects.push((effect, depth));
    }
}

/// Number of effects from `effect` to the end of its chain.
fn hops(effect: &EffectHandle) -> usize {
    let mut count = 1;
    let mut link = effect.route();
    while let Some(Link::Effect(next)) = link.take() {
        if count >= MAX_ROUTE_DEPTH {
            break;
        }
        count += 1;
        link = next.route();
    }
    count
}

fn deliver(link: &Link, samples: &[f32], mix: &mut [f32]) {
    match link {
        Link::Output => {
            for (m, s) in mix.iter_mut().zip(samples) {
                *m += *s;
            }
        }
        Link::Effect(effect) => effect.accumulate(samples),
    }
}

impl Default for OutputNode {
    fn default() -> Self {
        Self::new(0.0)
    }
}
