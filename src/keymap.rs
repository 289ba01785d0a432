use std::fmt;

/// The twelve pitch classes of a chromatic octave.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PitchClass {
    C,
    CSharp,
    D,
    DSharp,
    E,
    F,
    FSharp,
    G,
    GSharp,
    A,
    ASharp,
    B,
}

impl PitchClass {
    /// Semitone offset from C.
    pub fn semitone(self) -> u8 {
        match self {
            PitchClass::C => 0,
            PitchClass::CSharp => 1,
            PitchClass::D => 2,
            PitchClass::DSharp => 3,
            PitchClass::E => 4,
            PitchClass::F => 5,
            PitchClass::FSharp => 6,
            PitchClass::G => 7,
            PitchClass::GSharp => 8,
            PitchClass::A => 9,
            PitchClass::ASharp => 10,
            PitchClass::B => 11,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            PitchClass::C => "C",
            PitchClass::CSharp => "C#",
            PitchClass::D => "D",
            PitchClass::DSharp => "D#",
            PitchClass::E => "E",
            PitchClass::F => "F",
            PitchClass::FSharp => "F#",
            PitchClass::G => "G",
            PitchClass::GSharp => "G#",
            PitchClass::A => "A",
            PitchClass::ASharp => "A#",
            PitchClass::B => "B",
        }
    }

    pub fn is_sharp(self) -> bool {
        self.name().ends_with('#')
    }
}

/// A pitch class at a concrete octave, e.g. `C#6`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Note {
    pub pitch: PitchClass,
    pub octave: u8,
}

impl Note {
    pub fn new(pitch: PitchClass, octave: u8) -> Self {
        Self { pitch, octave }
    }

    /// MIDI note number, with C4 = 60.
    pub fn midi(self) -> u8 {
        (self.octave + 1) * 12 + self.pitch.semitone()
    }

    /// Frequency in Hz, equal temperament with A4 = 440 Hz.
    pub fn frequency(self) -> f32 {
        440.0 * (2.0_f32).powf((self.midi() as f32 - 69.0) / 12.0)
    }
}

impl fmt::Display for Note {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", self.pitch.name(), self.octave)
    }
}

/// Index of a key's pressed flag in the interaction state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct KeySlot(pub usize);

/// One row of the static key table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeyMapEntry {
    /// Computer keyboard character that plays this key.
    pub input: char,
    pub pitch: PitchClass,
    pub slot: KeySlot,
}

impl KeyMapEntry {
    const fn new(input: char, pitch: PitchClass, slot: usize) -> Self {
        Self {
            input,
            pitch,
            slot: KeySlot(slot),
        }
    }
}

pub const KEY_COUNT: usize = 12;

/// Naturals on the home row, sharps on the row above.
pub const KEY_MAP: [KeyMapEntry; KEY_COUNT] = [
    KeyMapEntry::new('a', PitchClass::C, 0),
    KeyMapEntry::new('s', PitchClass::D, 1),
    KeyMapEntry::new('d', PitchClass::E, 2),
    KeyMapEntry::new('f', PitchClass::F, 3),
    KeyMapEntry::new('g', PitchClass::G, 4),
    KeyMapEntry::new('h', PitchClass::A, 5),
    KeyMapEntry::new('j', PitchClass::B, 6),
    KeyMapEntry::new('w', PitchClass::CSharp, 7),
    KeyMapEntry::new('e', PitchClass::DSharp, 8),
    KeyMapEntry::new('t', PitchClass::FSharp, 9),
    KeyMapEntry::new('y', PitchClass::GSharp, 10),
    KeyMapEntry::new('u', PitchClass::ASharp, 11),
];

/// Looks up the entry played by `input`, ignoring case.
pub fn lookup(input: char) -> Option<&'static KeyMapEntry> {
    let input = input.to_ascii_lowercase();
    KEY_MAP.iter().find(|entry| entry.input == input)
}

pub fn entry(slot: KeySlot) -> &'static KeyMapEntry {
    &KEY_MAP[slot.0]
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_key_map_covers_one_chromatic_octave() {
        let pitches: HashSet<_> = KEY_MAP.iter().map(|e| e.pitch.semitone()).collect();
        assert_eq!(pitches.len(), KEY_COUNT);

        for (i, entry) in KEY_MAP.iter().enumerate() {
            assert_eq!(entry.slot, KeySlot(i));
        }
    }

    #[test]
    fn test_lookup() {
        assert_eq!(lookup('a').map(|e| e.pitch), Some(PitchClass::C));
        assert_eq!(lookup('U').map(|e| e.pitch), Some(PitchClass::ASharp));
        assert_eq!(lookup('t').map(|e| e.pitch), Some(PitchClass::FSharp));
        assert!(lookup('k').is_none());
        assert!(lookup('1').is_none());
    }

    #[test]
    fn test_sharps_are_on_the_upper_row() {
        for entry in KEY_MAP.iter() {
            let upper_row = "wetyu".contains(entry.input);
            assert_eq!(entry.pitch.is_sharp(), upper_row, "{}", entry.input);
        }
    }

    #[test]
    fn test_note_naming_and_frequency() {
        let a4 = Note::new(PitchClass::A, 4);
        assert_eq!(a4.to_string(), "A4");
        assert_eq!(a4.midi(), 69);
        assert!((a4.frequency() - 440.0).abs() < 1e-3);

        let c6 = Note::new(PitchClass::C, 6);
        assert_eq!(c6.to_string(), "C6");
        assert_eq!(c6.midi(), 84);
        assert!((c6.frequency() - 1046.502).abs() < 0.01);

        assert_eq!(Note::new(PitchClass::CSharp, 3).to_string(), "C#3");
    }
}
