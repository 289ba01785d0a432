//! Synthesizer instances produced by synth scripts.
//!
//! An instrument turns attack/release commands into samples. Instances are
//! shared between the UI thread (which triggers notes) and the audio thread
//! (which renders them) through [`SynthHandle`].

use std::f32::consts::TAU;
use std::sync::{Arc, Mutex};

use rand::Rng;
use tracing::debug;

use crate::graph::{lock, Link};
use crate::keymap::Note;

/// Per-voice output scaling so a full chord stays out of the clipper.
const VOICE_GAIN: f32 = 0.25;

/// Longest chain of links followed while rendering one instrument.

/// Something that can be played from the keyboard.
pub trait Instrument: Send {
    fn trigger_attack(&mut self, note: Note);
    fn trigger_release(&mut self, note: Note);
    fn release_all(&mut self);
    /// Adds this instrument's output to `buffer`.
    fn render(&mut self, buffer: &mut [f32], sample_rate: f32);
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Waveform {
    Sine,
    Square,
    Sawtooth,
    Triangle,
    Noise,
}

impl Waveform {
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "sine" => Some(Waveform::Sine),
            "square" => Some(Waveform::Square),
            "sawtooth" | "saw" => Some(Waveform::Sawtooth),
            "triangle" => Some(Waveform::Triangle),
            "noise" => Some(Waveform::Noise),
            _ => None,
        }
    }

    fn sample(self, phase: f32) -> f32 {
        match self {
            Waveform::Sine => (TAU * phase).sin(),
            Waveform::Square => {
                if phase < 0.5 {
                    1.0
                } else {
                    -1.0
                }
            }
            Waveform::Sawtooth => 2.0 * phase - 1.0,
            Waveform::Triangle => 1.0 - 4.0 * (phase - 0.5).abs(),
            Waveform::Noise => rand::thread_rng().gen_range(-1.0..=1.0),
        }
    }
}

/// ADSR times in seconds, sustain as a level.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Envelope {
    pub attack: f32,
    pub decay: f32,
    pub sustain: f32,
    pub release: f32,
}

impl Default for Envelope {
    fn default() -> Self {
        Self {
            attack: 0.005,
            decay: 0.1,
            sustain: 0.3,
            release: 1.0,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq)]
enum EnvStage {
    Idle,
    Attack,
    Decay,
    Sustain,
    Release,
}

/// How a voice turns its frequency into a signal.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum VoiceKind {
    Basic,
    /// Basic voice through a lowpass that opens with the envelope.
    Mono,
    Fm { harmonicity: f32, modulation_index: f32 },
    Am { harmonicity: f32 },
    /// Pitch falls from `octaves` above the note over `pitch_decay` seconds.
    Membrane { pitch_decay: f32, octaves: f32 },
}

impl VoiceKind {
    pub fn name(&self) -> &'static str {
        match self {
            VoiceKind::Basic => "Synth",
            VoiceKind::Mono => "MonoSynth",
            VoiceKind::Fm { .. } => "FMSynth",
            VoiceKind::Am { .. } => "AMSynth",
            VoiceKind::Membrane { .. } => "MembraneSynth",
        }
    }

    /// The default envelope of each voice type.
    pub fn default_envelope(&self) -> Envelope {
        match self {
            VoiceKind::Membrane { .. } => Envelope {
                attack: 0.001,
                decay: 0.4,
                sustain: 0.01,
                release: 1.4,
            },
            VoiceKind::Fm { .. } | VoiceKind::Am { .. } => Envelope {
                attack: 0.01,
                decay: 0.01,
                sustain: 1.0,
                release: 0.5,
            },
            _ => Envelope::default(),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct VoiceParams {
    pub kind: VoiceKind,
    pub waveform: Waveform,
    pub envelope: Envelope,
    /// Detune in cents.
    pub detune: f32,
    /// Instrument level in dB.
    pub volume: f32,
}

impl VoiceParams {
    pub fn new(kind: VoiceKind) -> Self {
        Self {
            envelope: kind.default_envelope(),
            kind,
            waveform: if matches!(kind, VoiceKind::Mono) {
                Waveform::Square
            } else {
                Waveform::Triangle
            },
            detune: 0.0,
            volume: 0.0,
        }
    }
}

struct Voice {
    note: Option<Note>,
    gate: bool,
    frequency: f32,
    phase: f32,
    mod_phase: f32,
    env_level: f32,
    stage: EnvStage,
    filter_state: f32,
    /// Seconds since the last attack.
    elapsed: f32,
    /// Attack order, used to steal the oldest voice.
    started: u64,
}

impl Voice {
    fn new() -> Self {
        Self {
            note: None,
            gate: false,
            frequency: 0.0,
            phase: 0.0,
            mod_phase: 0.0,
            env_level: 0.0,
            stage: EnvStage::Idle,
            filter_state: 0.0,
            elapsed: 0.0,
            started: 0,
        }
    }

    fn is_idle(&self) -> bool {
        self.stage == EnvStage::Idle
    }

    fn attack(&mut self, note: Note, detune: f32, started: u64) {
        self.note = Some(note);
        self.frequency = note.frequency() * (2.0_f32).powf(detune / 1200.0);
        self.gate = true;
        self.stage = EnvStage::Attack;
        self.elapsed = 0.0;
        self.started = started;
        self.phase = 0.0;
        self.mod_phase = 0.0;
        self.filter_state = 0.0;
    }

    fn release(&mut self) {
        if self.gate && self.stage != EnvStage::Idle {
            self.stage = EnvStage::Release;
        }
        self.gate = false;
    }

    fn next_sample(&mut self, params: &VoiceParams, sample_rate: f32) -> f32 {
        self.advance_envelope(&params.envelope, sample_rate);
        if self.is_idle() {
            return 0.0;
        }

        let dt = 1.0 / sample_rate;
        self.elapsed += dt;

        let raw = match params.kind {
            VoiceKind::Basic | VoiceKind::Mono => {
                self.advance_phase(self.frequency, sample_rate);
                params.waveform.sample(self.phase)
            }
            VoiceKind::Fm {
                harmonicity,
                modulation_index,
            } => {
                self.mod_phase = (self.mod_phase + self.frequency * harmonicity * dt).fract();
                let modulator = (TAU * self.mod_phase).sin() * modulation_index / TAU;
                self.advance_phase(self.frequency, sample_rate);
                params.waveform.sample((self.phase + modulator).rem_euclid(1.0))
            }
            VoiceKind::Am { harmonicity } => {
                self.mod_phase = (self.mod_phase + self.frequency * harmonicity * dt).fract();
                let modulator = 0.5 + 0.5 * (TAU * self.mod_phase).sin();
                self.advance_phase(self.frequency, sample_rate);
                params.waveform.sample(self.phase) * modulator
            }
            VoiceKind::Membrane {
                pitch_decay,
                octaves,
            } => {
                let sweep = if pitch_decay <= 0.0 {
                    0.0
                } else {
                    (1.0 - self.elapsed / pitch_decay).max(0.0)
                };
                let frequency = self.frequency * (2.0_f32).powf(octaves * sweep);
                self.advance_phase(frequency, sample_rate);
                params.waveform.sample(self.phase)
            }
        };

        let shaped = if matches!(params.kind, VoiceKind::Mono) {
            // cutoff tracks the envelope between 200 Hz and ~4 kHz
            let cutoff = 200.0 + 3800.0 * self.env_level;
            let alpha = 1.0 - (-TAU * cutoff / sample_rate).exp();
            self.filter_state += alpha * (raw - self.filter_state);
            self.filter_state
        } else {
            raw
        };

        shaped * self.env_level
    }

    fn advance_phase(&mut self, frequency: f32, sample_rate: f32) {
        self.phase += frequency / sample_rate;
        if self.phase >= 1.0 {
            self.phase -= self.phase.floor();
        }
    }

    fn advance_envelope(&mut self, env: &Envelope, sample_rate: f32) {
        let step = |seconds: f32| {
            if seconds <= 0.0 {
                1.0
            } else {
                1.0 / (seconds * sample_rate)
            }
        };

        match self.stage {
            EnvStage::Idle => self.env_level = 0.0,
            EnvStage::Attack => {
                self.env_level += step(env.attack);
                if self.env_level >= 1.0 {
                    self.env_level = 1.0;
                    self.stage = EnvStage::Decay;
                }
            }
            EnvStage::Decay => {
                self.env_level -= step(env.decay) * (1.0 - env.sustain);
                if self.env_level <= env.sustain {
                    self.env_level = env.sustain;
                    self.stage = EnvStage::Sustain;
                }
            }
            EnvStage::Sustain => self.env_level = env.sustain,
            EnvStage::Release => {
                self.env_level -= step(env.release);
                if self.env_level <= 0.0 {
                    self.env_level = 0.0;
                    self.stage = EnvStage::Idle;
                    self.note = None;
                }
            }
        }
    }
}

/// Built-in tone generator: one voice when monophonic, a pool of voices
/// with oldest-first stealing when polyphonic.
pub struct ToneSynth {
    params: VoiceParams,
    voices: Vec<Voice>,
    clock: u64,
}

impl ToneSynth {
    pub fn mono(params: VoiceParams) -> Self {
        Self::with_voices(params, 1)
    }

    pub fn poly(params: VoiceParams, max_polyphony: usize) -> Self {
        Self::with_voices(params, max_polyphony.max(1))
    }

    fn with_voices(params: VoiceParams, count: usize) -> Self {
        Self {
            params,
            voices: (0..count).map(|_| Voice::new()).collect(),
            clock: 0,
        }
    }

    pub fn params(&self) -> &VoiceParams {
        &self.params
    }

    pub fn polyphony(&self) -> usize {
        self.voices.len()
    }

    /// Number of voices currently producing sound.
    #[cfg(test)]
    pub fn active_voices(&self) -> usize {
        self.voices.iter().filter(|v| !v.is_idle()).count()
    }

    fn pick_voice(&mut self, note: Note) -> usize {
        if self.voices.len() == 1 {
            return 0;
        }
        if let Some(i) = self.voices.iter().position(|v| v.gate && v.note == Some(note)) {
            return i;
        }
        if let Some(i) = self.voices.iter().position(Voice::is_idle) {
            return i;
        }
        if let Some(i) = self.voices.iter().position(|v| !v.gate) {
            return i;
        }
        self.voices
            .iter()
            .enumerate()
            .min_by_key(|(_, v)| v.started)
            .map(|(i, _)| i)
            .unwrap_or(0)
    }
}

impl Instrument for ToneSynth {
    fn trigger_attack(&mut self, note: Note) {
        self.clock += 1;
        let index = self.pick_voice(note);
        let detune = self.params.detune;
        self.voices[index].attack(note, detune, self.clock);
    }

    fn trigger_release(&mut self, note: Note) {
        for voice in self.voices.iter_mut().filter(|v| v.note == Some(note)) {
            voice.release();
        }
    }

    fn release_all(&mut self) {
        for voice in &mut self.voices {
            voice.release();
        }
    }

    fn render(&mut self, buffer: &mut [f32], sample_rate: f32) {
        let level = VOICE_GAIN * db_to_gain(self.params.volume);
        for voice in self.voices.iter_mut().filter(|v| !v.is_idle()) {
            for sample in buffer.iter_mut() {
                *sample += voice.next_sample(&self.params, sample_rate) * level;
            }
        }
    }
}

pub fn db_to_gain(db: f32) -> f32 {
    10.0_f32.powf(db / 20.0)
}

struct SynthNode {
    instrument: Box<dyn Instrument>,
    route: Option<Link>,
    disposed: bool,
}

/// Shared handle to one synthesizer instance and where its output goes.
#[derive(Clone)]
pub struct SynthHandle(Arc<Mutex<SynthNode>>);

impl SynthHandle {
    pub fn new(instrument: Box<dyn Instrument>) -> Self {
        Self(Arc::new(Mutex::new(SynthNode {
            instrument,
            route: None,
            disposed: false,
        })))
    }

    pub fn connect(&self, link: Link) {
        lock(&self.0).route = Some(link);
    }

    #[cfg(test)]
    pub fn route(&self) -> Option<Link> {
        lock(&self.0).route.clone()
    }

    pub fn trigger_attack(&self, note: Note) {
        let mut node = lock(&self.0);
        if !node.disposed {
            node.instrument.trigger_attack(note);
        }
    }

    pub fn trigger_release(&self, note: Note) {
        let mut node = lock(&self.0);
        if !node.disposed {
            node.instrument.trigger_release(note);
        }
    }

    pub fn release_all(&self) {
        let mut node = lock(&self.0);
        if !node.disposed {
            node.instrument.release_all();
        }
    }

    /// Silences the instance and detaches it from the graph for good.
    pub fn dispose(&self) {
        let mut node = lock(&self.0);
        node.instrument.release_all();
        node.route = None;
        node.disposed = true;
    }

    pub fn is_disposed(&self) -> bool {
        lock(&self.0).disposed
    }

    /// Renders the dry signal into `buffer`, overwriting it, and returns
    /// where it goes. Disposed or unrouted instances return `None`.
    pub fn render(&self, buffer: &mut [f32], sample_rate: f32) -> Option<Link> {
        buffer.fill(0.0);
        let mut node = lock(&self.0);
        if node.disposed {
            return None;
        }
        node.instrument.render(buffer, sample_rate);
        node.route.clone()
    }
}

impl std::fmt::Debug for SynthHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SynthHandle")
            .field("disposed", &self.is_disposed())
            .finish()
    }
}

/// The ordered set of instances the keyboard currently plays.
#[derive(Clone, Debug, Default)]
pub struct SynthSet(Vec<SynthHandle>);

impl SynthSet {
    pub fn new(handles: Vec<SynthHandle>) -> Self {
        Self(handles)
    }

    #[cfg(test)]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn handles(&self) -> &[SynthHandle] {
        &self.0
    }

    pub fn trigger_attack(&self, note: Note) {
        debug!("Attack {} on {} synths", note, self.0.len());
        for synth in &self.0 {
            synth.trigger_attack(note);
        }
    }

    pub fn trigger_release(&self, note: Note) {
        debug!("Release {} on {} synths", note, self.0.len());
        for synth in &self.0 {
            synth.trigger_release(note);
        }
    }

    pub fn release_all(&self) {
        for synth in &self.0 {
            synth.release_all();
        }
    }

    pub fn dispose(&self) {
        for synth in &self.0 {
            synth.dispose();
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::keymap::PitchClass;

    /// A command received by a [`Recorder`].
    #[derive(Debug, Clone, PartialEq)]
    pub enum Command {
        Attack(String),
        Release(String),
        ReleaseAll,
    }

    /// Instrument that logs every command it receives.
    #[derive(Clone, Default)]
    pub struct Recorder {
        pub log: Arc<Mutex<Vec<Command>>>,
    }

    impl Recorder {
        pub fn commands(&self) -> Vec<Command> {
            self.log.lock().unwrap().clone()
        }

        pub fn clear(&self) {
            self.log.lock().unwrap().clear();
        }

        pub fn handle(&self) -> SynthHandle {
            SynthHandle::new(Box::new(self.clone()))
        }
    }

    impl Instrument for Recorder {
        fn trigger_attack(&mut self, note: Note) {
            self.log.lock().unwrap().push(Command::Attack(note.to_string()));
        }

        fn trigger_release(&mut self, note: Note) {
            self.log.lock().unwrap().push(Command::Release(note.to_string()));
        }

        fn release_all(&mut self) {
            self.log.lock().unwrap().push(Command::ReleaseAll);
        }

        fn render(&mut self, buffer: &mut [f32], _sample_rate: f32) {
            for sample in buffer.iter_mut() {
                *sample += 0.5;
            }
        }
    }

    const SR: f32 = 48_000.0;

    fn c4() -> Note {
        Note::new(PitchClass::C, 4)
    }

    fn peak(synth: &mut ToneSynth, frames: usize) -> f32 {
        let mut buffer = vec![0.0; frames];
        synth.render(&mut buffer, SR);
        buffer.iter().fold(0.0_f32, |acc, s| acc.max(s.abs()))
    }

    #[test]
    fn test_silent_until_attacked() {
        let mut synth = ToneSynth::mono(VoiceParams::new(VoiceKind::Basic));
        assert_eq!(peak(&mut synth, 256), 0.0);
        synth.trigger_attack(c4());
        assert!(peak(&mut synth, 2048) > 0.0);
    }

    #[test]
    fn test_release_fades_to_idle() {
        let mut params = VoiceParams::new(VoiceKind::Basic);
        params.envelope.release = 0.01;
        let mut synth = ToneSynth::mono(params);
        synth.trigger_attack(c4());
        peak(&mut synth, 1024);
        synth.trigger_release(c4());
        peak(&mut synth, 4800);
        assert_eq!(synth.active_voices(), 0);
    }

    #[test]
    fn test_release_of_other_note_keeps_mono_voice() {
        let mut synth = ToneSynth::mono(VoiceParams::new(VoiceKind::Basic));
        synth.trigger_attack(c4());
        synth.trigger_release(Note::new(PitchClass::D, 4));
        peak(&mut synth, 256);
        assert_eq!(synth.active_voices(), 1);
    }

    #[test]
    fn test_poly_voices_and_stealing() {
        let mut synth = ToneSynth::poly(VoiceParams::new(VoiceKind::Basic), 2);
        synth.trigger_attack(Note::new(PitchClass::C, 4));
        synth.trigger_attack(Note::new(PitchClass::E, 4));
        synth.trigger_attack(Note::new(PitchClass::G, 4));
        peak(&mut synth, 64);
        assert_eq!(synth.active_voices(), 2);
        assert_eq!(synth.polyphony(), 2);

        // C was stolen by G, so releasing it leaves both voices sounding
        synth.trigger_release(Note::new(PitchClass::C, 4));
        assert_eq!(synth.voices.iter().filter(|v| v.gate).count(), 2);

        synth.release_all();
        assert!(synth.voices.iter().all(|v| !v.gate));
    }

    #[test]
    fn test_every_voice_kind_produces_sound() {
        let kinds = [
            VoiceKind::Basic,
            VoiceKind::Mono,
            VoiceKind::Fm {
                harmonicity: 3.0,
                modulation_index: 10.0,
            },
            VoiceKind::Am { harmonicity: 3.0 },
            VoiceKind::Membrane {
                pitch_decay: 0.05,
                octaves: 8.0,
            },
        ];
        for kind in kinds {
            let mut synth = ToneSynth::mono(VoiceParams::new(kind));
            synth.trigger_attack(c4());
            let level = peak(&mut synth, 4096);
            assert!(level > 0.0, "{} was silent", kind.name());
            assert!(level <= 1.0, "{} too loud", kind.name());
        }
    }

    #[test]
    fn test_attack_resets_oscillator_state() {
        let params = VoiceParams::new(VoiceKind::Mono);
        let mut voice = Voice::new();
        voice.phase = f32::NAN;
        voice.mod_phase = f32::INFINITY;
        voice.filter_state = f32::NAN;

        voice.attack(c4(), 0.0, 1);
        assert_eq!(voice.phase, 0.0);
        assert_eq!(voice.mod_phase, 0.0);
        assert_eq!(voice.filter_state, 0.0);
        for _ in 0..512 {
            assert!(voice.next_sample(&params, SR).is_finite());
        }
    }

    #[test]
    fn test_disposed_handle_ignores_commands() {
        let recorder = Recorder::default();
        let handle = recorder.handle();
        handle.trigger_attack(c4());
        handle.dispose();
        handle.trigger_attack(c4());
        assert_eq!(
            recorder.commands(),
            vec![Command::Attack("C4".into()), Command::ReleaseAll]
        );
        assert!(handle.is_disposed());
        assert!(handle.route().is_none());
    }

    #[test]
    fn test_render_reports_route() {
        let handle = Recorder::default().handle();
        let mut buffer = vec![1.0; 8];
        assert!(handle.render(&mut buffer, SR).is_none());

        handle.connect(Link::Output);
        assert!(matches!(handle.render(&mut buffer, SR), Some(Link::Output)));
        assert!(buffer.iter().all(|&s| s == 0.5));

        handle.dispose();
        assert!(handle.render(&mut buffer, SR).is_none());
        assert!(buffer.iter().all(|&s| s == 0.0));
    }

    #[test]
    fn test_set_broadcasts_to_every_handle() {
        let a = Recorder::default();
        let b = Recorder::default();
        let set = SynthSet::new(vec![a.handle(), b.handle()]);
        set.trigger_attack(c4());
        set.release_all();
        for r in [&a, &b] {
            assert_eq!(
                r.commands(),
                vec![Command::Attack("C4".into()), Command::ReleaseAll]
            );
        }
    }
}
