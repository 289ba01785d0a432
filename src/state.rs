use std::sync::Arc;

use tokio::runtime::Handle;
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};
use tracing::{debug, info, warn};

use crate::evaluator::{self, EvalError};
use crate::graph::OutputNode;
use crate::keymap::{self, KeySlot, Note, KEY_COUNT};
use crate::settings::{parse_volume, Preferences};
use crate::synth::SynthSet;

/// Which keys are held down, for highlighting. Each pressed key remembers
/// the note it started so the matching note is released even if the
/// octave changed in between.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct InteractionState {
    pressed: [Option<Note>; KEY_COUNT],
}

impl InteractionState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Marks `slot` pressed with `note`. Returns `false` if it already was.
    pub fn press(&mut self, slot: KeySlot, note: Note) -> bool {
        let entry = &mut self.pressed[slot.0];
        if entry.is_some() {
            return false;
        }
        *entry = Some(note);
        true
    }

    /// Marks `slot` released, returning the note it was holding.
    pub fn release(&mut self, slot: KeySlot) -> Option<Note> {
        self.pressed[slot.0].take()
    }

    pub fn is_pressed(&self, slot: KeySlot) -> bool {
        self.pressed[slot.0].is_some()
    }

    #[cfg(test)]
    pub fn pressed_count(&self) -> usize {
        self.pressed.iter().filter(|p| p.is_some()).count()
    }

    pub fn clear(&mut self) {
        self.pressed = [None; KEY_COUNT];
    }
}

type EvalResult = (u64, Result<SynthSet, EvalError>);

/// Application state owned by the root of the UI.
///
/// Holds the persisted preferences, the pressed keys, the shared output
/// node (which also owns the active synth set) and the bookkeeping for
/// script evaluations. Evaluations are numbered; only the result of the
/// latest request is ever installed.
pub struct Keyboard {
    prefs: Preferences,
    keys: InteractionState,
    output: Arc<OutputNode>,
    code_error: Option<String>,
    generation: u64,
    evaluating: bool,
    runtime: Handle,
    results_tx: UnboundedSender<EvalResult>,
    results_rx: UnboundedReceiver<EvalResult>,
}

impl Keyboard {
    /// Builds the state and applies the persisted volume to `output`.
    pub fn new(prefs: Preferences, output: Arc<OutputNode>, runtime: Handle) -> Self {
        output.set_volume_db(parse_volume(&prefs.volume()));
        let (results_tx, results_rx) = unbounded_channel();
        Self {
            prefs,
            keys: InteractionState::new(),
            output,
            code_error: None,
            generation: 0,
            evaluating: false,
            runtime,
            results_tx,
            results_rx,
        }
    }

    pub fn output(&self) -> &Arc<OutputNode> {
        &self.output
    }

    #[cfg(test)]
    pub fn keys(&self) -> &InteractionState {
        &self.keys
    }

    pub fn is_pressed(&self, slot: KeySlot) -> bool {
        self.keys.is_pressed(slot)
    }

    /// The note `slot` plays at the configured octave.
    pub fn note_for(&self, slot: KeySlot) -> Note {
        Note::new(keymap::entry(slot).pitch, self.prefs.octave_number())
    }

    /// Starts the note for `slot` on every active synth, unless the key is
    /// already down.
    pub fn attack(&mut self, slot: KeySlot) {
        let note = self.note_for(slot);
        if self.keys.press(slot, note) {
            debug!("Key {} down: {}", keymap::entry(slot).input, note);
            self.output.active().trigger_attack(note);
        }
    }

    /// Stops the note for `slot` on every active synth. Always sends the
    /// release, even if the key was not down.
    pub fn release(&mut self, slot: KeySlot) {
        let note = self.keys.release(slot).unwrap_or_else(|| self.note_for(slot));
        debug!("Key {} up: {}", keymap::entry(slot).input, note);
        self.output.active().trigger_release(note);
    }

    pub fn release_all(&mut self) {
        info!("Releasing all keys");
        self.keys.clear();
        self.output.active().release_all();
    }

    pub fn octave(&self) -> String {
        self.prefs.octave()
    }

    /// Takes effect on the next attack; held notes keep their pitch.
    pub fn set_octave(&mut self, octave: &str) -> bool {
        self.prefs.set_octave(octave)
    }

    pub fn volume(&self) -> String {
        self.prefs.volume()
    }

    /// Persists the text as typed and applies it to the output node
    /// right away.
    pub fn set_volume(&mut self, volume: &str) {
        self.prefs.set_volume(volume);
        self.output.set_volume_db(parse_volume(volume));
    }

    pub fn use_keyboard(&self) -> bool {
        self.prefs.use_keyboard()
    }

    pub fn set_use_keyboard(&mut self, enabled: bool) {
        info!("Computer keyboard input {}", if enabled { "on" } else { "off" });
        self.prefs.set_use_keyboard(enabled);
    }

    pub fn code(&self) -> String {
        self.prefs.code()
    }

    pub fn set_code(&mut self, code: &str) {
        self.prefs.set_code(code);
    }

    pub fn code_error(&self) -> Option<&str> {
        self.code_error.as_deref()
    }

    pub fn is_evaluating(&self) -> bool {
        self.evaluating
    }

    /// Starts evaluating the current code in the background. Call
    /// [`Keyboard::poll_evaluations`] to pick up the result.
    pub fn request_eval(&mut self) {
        let generation = self.begin_eval();
        let source = self.prefs.code();
        let results = self.results_tx.clone();
        self.runtime.spawn(async move {
            let result = evaluator::evaluate(source).await;
            // the receiver only goes away with the keyboard itself
            let _ = results.send((generation, result));
        });
    }

    /// Installs any finished evaluations.
    pub fn poll_evaluations(&mut self) {
        while let Ok((generation, result)) = self.results_rx.try_recv() {
            self.finish_eval(generation, result);
        }
    }

    /// Evaluates the current code and installs the result before
    /// returning.
    pub async fn eval(&mut self) {
        let generation = self.begin_eval();
        let result = evaluator::evaluate(self.prefs.code()).await;
        self.finish_eval(generation, result);
    }

    fn begin_eval(&mut self) -> u64 {
        self.generation += 1;
        self.evaluating = true;
        info!("Evaluating synth code (request {})", self.generation);
        self.generation
    }

    fn finish_eval(&mut self, generation: u64, result: Result<SynthSet, EvalError>) {
        if generation != self.generation {
            debug!("Dropping result of superseded request {}", generation);
            if let Ok(stale) = result {
                stale.dispose();
            }
            return;
        }
        self.evaluating = false;

        match result {
            Ok(synths) => {
                info!("Installed {} synth(s)", synths.len());
                let previous = self.output.install(synths);
                previous.dispose();
                self.code_error = None;
            }
            Err(e) => {
                // the previous synths stay installed
                warn!("Synth code failed: {}", e);
                self.code_error = Some(e.to_string());
            }
        }
    }
}
