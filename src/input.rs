use tracing::trace;

use crate::keymap::{self, KeySlot};
use crate::state::Keyboard;

/// Input that can press or release a key of the on-screen keyboard.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InputEvent {
    KeyDown(char),
    KeyUp(char),
    PointerDown(KeySlot),
    /// Pointer released, over the given key if any.
    PointerUp(Option<KeySlot>),
}

/// Turns input events into attacks and releases on the [`Keyboard`].
#[derive(Debug, Default)]
pub struct InputHandler {
    mouse_key: Option<KeySlot>,
}

impl InputHandler {
    pub fn new() -> Self {
        Self::default()
    }

    /// The key currently held with the pointer.
    pub fn mouse_key(&self) -> Option<KeySlot> {
        self.mouse_key
    }

    pub fn handle(&mut self, keyboard: &mut Keyboard, event: InputEvent) {
        match event {
            InputEvent::KeyDown(c) => {
                if let Some(entry) = Self::mapped(keyboard, c) {
                    keyboard.attack(entry.slot);
                }
            }
            InputEvent::KeyUp(c) => {
                if let Some(entry) = Self::mapped(keyboard, c) {
                    keyboard.release(entry.slot);
                }
            }
            InputEvent::PointerDown(slot) => {
                self.mouse_key = Some(slot);
                keyboard.attack(slot);
            }
            InputEvent::PointerUp(over) => {
                if let Some(slot) = over {
                    keyboard.release(slot);
                }
                // dragging off the key before letting go must not leave it held
                if let Some(held) = self.mouse_key.take() {
                    if Some(held) != over {
                        keyboard.release(held);
                    }
                }
            }
        }
    }

    fn mapped(keyboard: &Keyboard, c: char) -> Option<&'static keymap::KeyMapEntry> {
        if !keyboard.use_keyboard() {
            return None;
        }
        keymap::lookup(c)
    }
}

/// Character of a physical key, for the keys the keyboard map can use.
pub fn key_char(key: egui::Key) -> Option<char> {
    let c = match key {
        egui::Key::A => 'a',
        egui::Key::S => 's',
        egui::Key::D => 'd',
        egui::Key::F => 'f',
        egui::Key::G => 'g',
        egui::Key::H => 'h',
        egui::Key::J => 'j',
        egui::Key::W => 'w',
        egui::Key::E => 'e',
        egui::Key::T => 't',
        egui::Key::Y => 'y',
        egui::Key::U => 'u',
        _ => return None,
    };
    Some(c)
}

/// Physical key events of this frame, skipping auto-repeats. Nothing is
/// collected while a text field has focus.
pub fn collect_key_events(ctx: &egui::Context) -> Vec<InputEvent> {
    if ctx.wants_keyboard_input() {
        return Vec::new();
    }
    ctx.input(|i| {
        i.events
            .iter()
            .filter_map(|event| match event {
                egui::Event::Key {
                    key,
                    pressed,
                    repeat: false,
                    ..
                } => key_char(*key).map(|c| {
                    trace!("Physical key {:?} pressed={}", key, pressed);
                    if *pressed {
                        InputEvent::KeyDown(c)
                    } else {
                        InputEvent::KeyUp(c)
                    }
                }),
                _ => None,
            })
            .collect()
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::tests::recording_keyboard;
    use crate::synth::tests::Command;

    #[tokio::test]
    async fn test_keys_play_notes() {
        let (mut keyboard, recorder) = recording_keyboard();
        let mut input = InputHandler::new();

        input.handle(&mut keyboard, InputEvent::KeyDown('a'));
        input.handle(&mut keyboard, InputEvent::KeyDown('A'));
        input.handle(&mut keyboard, InputEvent::KeyDown('w'));
        input.handle(&mut keyboard, InputEvent::KeyUp('a'));
        input.handle(&mut keyboard, InputEvent::KeyDown('q'));

        assert_eq!(
            recorder.commands(),
            vec![
                Command::Attack("C4".into()),
                Command::Attack("C#4".into()),
                Command::Release("C4".into()),
            ]
        );
        assert!(keyboard.is_pressed(KeySlot(7)));
    }

    #[tokio::test]
    async fn test_keys_ignored_when_disabled() {
        let (mut keyboard, recorder) = recording_keyboard();
        let mut input = InputHandler::new();
        keyboard.set_use_keyboard(false);

        input.handle(&mut keyboard, InputEvent::KeyDown('a'));
        assert!(!keyboard.is_pressed(KeySlot(0)));
        input.handle(&mut keyboard, InputEvent::KeyUp('a'));
        assert!(recorder.commands().is_empty());

        // the pointer still plays
        input.handle(&mut keyboard, InputEvent::PointerDown(KeySlot(0)));
        assert_eq!(recorder.commands(), vec![Command::Attack("C4".into())]);
        assert!(keyboard.is_pressed(KeySlot(0)));
    }

    #[tokio::test]
    async fn test_pointer_release_over_the_same_key() {
        let (mut keyboard, recorder) = recording_keyboard();
        let mut input = InputHandler::new();

        input.handle(&mut keyboard, InputEvent::PointerDown(KeySlot(2)));
        assert_eq!(input.mouse_key(), Some(KeySlot(2)));
        input.handle(&mut keyboard, InputEvent::PointerUp(Some(KeySlot(2))));

        assert_eq!(
            recorder.commands(),
            vec![Command::Attack("E4".into()), Command::Release("E4".into())]
        );
        assert_eq!(input.mouse_key(), None);
    }

    #[tokio::test]
    async fn test_pointer_release_elsewhere_frees_the_held_key() {
        let (mut keyboard, recorder) = recording_keyboard();
        let mut input = InputHandler::new();

        input.handle(&mut keyboard, InputEvent::PointerDown(KeySlot(0)));
        input.handle(&mut keyboard, InputEvent::PointerUp(Some(KeySlot(1))));
        assert_eq!(
            recorder.commands(),
            vec![
                Command::Attack("C4".into()),
                Command::Release("D4".into()),
                Command::Release("C4".into()),
            ]
        );

        recorder.clear();
        input.handle(&mut keyboard, InputEvent::PointerDown(KeySlot(4)));
        input.handle(&mut keyboard, InputEvent::PointerUp(None));
        assert_eq!(
            recorder.commands(),
            vec![Command::Attack("G4".into()), Command::Release("G4".into())]
        );
        assert_eq!(keyboard.keys().pressed_count(), 0);
    }

    #[tokio::test]
    async fn test_keyboard_and_pointer_share_key_state() {
        let (mut keyboard, recorder) = recording_keyboard();
        let mut input = InputHandler::new();

        input.handle(&mut keyboard, InputEvent::KeyDown('a'));
        input.handle(&mut keyboard, InputEvent::PointerDown(KeySlot(0)));
        assert_eq!(recorder.commands(), vec![Command::Attack("C4".into())]);
    }

    #[test]
    fn test_key_char() {
        assert_eq!(key_char(egui::Key::A), Some('a'));
        assert_eq!(key_char(egui::Key::U), Some('u'));
        assert_eq!(key_char(egui::Key::Q), None);
        assert_eq!(key_char(egui::Key::Enter), None);
        for entry in keymap::KEY_MAP.iter() {
            let matches = [
                egui::Key::A,
                egui::Key::S,
                egui::Key::D,
                egui::Key::F,
                egui::Key::G,
                egui::Key::H,
                egui::Key::J,
                egui::Key::W,
                egui::Key::E,
                egui::Key::T,
                egui::Key::Y,
                egui::Key::U,
            ]
            .into_iter()
            .filter(|k| key_char(*k) == Some(entry.input))
            .count();
            assert_eq!(matches, 1);
        }
    }
}
