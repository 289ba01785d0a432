//! Persistent user preferences.
//!
//! Settings are a flat map of named values stored under a namespace in a
//! JSON document. The whole namespace is loaded once and written back on
//! every change; the rest of the document is carried along untouched. A
//! document that cannot be read is never overwritten.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use tracing::{debug, info, warn};

pub const NAMESPACE: &str = "keyboard-synth";

pub const OCTAVE: &str = "octave";
pub const VOLUME: &str = "volume";
pub const USE_KEYBOARD: &str = "useKeyboard";
pub const CODE: &str = "code";

pub const DEFAULT_OCTAVE: &str = "4";
pub const DEFAULT_VOLUME: &str = "-8";
pub const DEFAULT_USE_KEYBOARD: bool = true;

pub const DEFAULT_CODE: &str = r#"// create_synth receives the audio namespace and the shared output node.
async fn create_synth(tone, volume) {
    let synth = tone.PolySynth(tone.MonoSynth, oscillator: "sine", attack: 0.1)
    let reverb = tone.Reverb(decay: 2)

    tone.connect_series(synth, reverb, volume)

    return synth
}
"#;

/// A single persisted value. Strings and booleans keep their type across
/// a save and reload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SettingValue {
    Flag(bool),
    Text(String),
}

impl SettingValue {
    pub fn as_text(&self) -> Option<&str> {
        match self {
            SettingValue::Text(s) => Some(s),
            SettingValue::Flag(_) => None,
        }
    }

    pub fn as_flag(&self) -> Option<bool> {
        match self {
            SettingValue::Flag(b) => Some(*b),
            SettingValue::Text(_) => None,
        }
    }

    fn same_kind(&self, other: &SettingValue) -> bool {
        std::mem::discriminant(self) == std::mem::discriminant(other)
    }
}

impl From<&str> for SettingValue {
    fn from(value: &str) -> Self {
        SettingValue::Text(value.to_string())
    }
}

impl From<String> for SettingValue {
    fn from(value: String) -> Self {
        SettingValue::Text(value)
    }
}

impl From<bool> for SettingValue {
    fn from(value: bool) -> Self {
        SettingValue::Flag(value)
    }
}

/// Errors raised by a storage backend.
#[derive(Debug)]
pub enum SettingsError {
    Io(std::io::Error),
    Serialization(serde_json::Error),
}

impl std::fmt::Display for SettingsError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Io(e) => write!(f, "settings file error: {}", e),
            Self::Serialization(e) => write!(f, "settings format error: {}", e),
        }
    }
}

impl std::error::Error for SettingsError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(e) => Some(e),
            Self::Serialization(e) => Some(e),
        }
    }
}

impl From<std::io::Error> for SettingsError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err)
    }
}

impl From<serde_json::Error> for SettingsError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err)
    }
}

/// Where the settings document lives.
pub trait Storage: Send {
    /// Returns the stored document, or `None` if nothing was saved yet.
    fn read(&self) -> Result<Option<String>, SettingsError>;
    fn write(&mut self, contents: &str) -> Result<(), SettingsError>;
}

/// A JSON file on disk.
pub struct FileStorage {
    path: PathBuf,
}

impl FileStorage {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// `<config dir>/keyboard-synth/settings.json`, or a file in the
    /// working directory when the platform has no config dir.
    pub fn default_path() -> PathBuf {
        match dirs::config_dir() {
            Some(dir) => dir.join(NAMESPACE).join("settings.json"),
            None => PathBuf::from("keyboard-synth-settings.json"),
        }
    }
}

impl Storage for FileStorage {
    fn read(&self) -> Result<Option<String>, SettingsError> {
        match std::fs::read_to_string(&self.path) {
            Ok(json) => Ok(Some(json)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn write(&mut self, contents: &str) -> Result<(), SettingsError> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&self.path, contents)?;
        Ok(())
    }
}

/// In-memory storage. Clones share the same document, so a second store
/// built from a clone sees what the first one saved.
#[derive(Clone, Default)]
pub struct MemoryStorage {
    document: Arc<Mutex<Option<String>>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    #[cfg(test)]
    pub fn contents(&self) -> Option<String> {
        self.document.lock().ok().and_then(|doc| doc.clone())
    }
}

impl Storage for MemoryStorage {
    fn read(&self) -> Result<Option<String>, SettingsError> {
        Ok(self.document.lock().ok().and_then(|doc| doc.clone()))
    }

    fn write(&mut self, contents: &str) -> Result<(), SettingsError> {
        if let Ok(mut doc) = self.document.lock() {
            *doc = Some(contents.to_string());
        }
        Ok(())
    }
}

/// Namespaced key/value store backed by a [`Storage`].
pub struct SettingsStore {
    storage: Box<dyn Storage>,
    values: BTreeMap<String, SettingValue>,
    /// Top-level entries of the document outside our namespace.
    others: Map<String, Value>,
    /// Cleared when the stored document could not be read.
    writable: bool,
}

impl SettingsStore {
    /// Loads the namespace from `storage`. A missing document yields an
    /// empty store. An unreadable one also starts empty, but is left
    /// alone for the rest of the session.
    pub fn load(storage: Box<dyn Storage>) -> Self {
        let loaded = match storage.read() {
            Ok(Some(json)) => match parse_document(&json) {
                Ok((values, others)) => {
                    info!("Loaded {} settings", values.len());
                    Some((values, others))
                }
                Err(e) => {
                    warn!("Ignoring unreadable settings, changes will not be saved: {}", e);
                    None
                }
            },
            Ok(None) => {
                info!("No saved settings, starting from defaults");
                Some(Default::default())
            }
            Err(e) => {
                warn!("Failed to read settings, changes will not be saved: {}", e);
                None
            }
        };

        let writable = loaded.is_some();
        let (values, others) = loaded.unwrap_or_default();
        Self {
            storage,
            values,
            others,
            writable,
        }
    }

    /// Whether changes are written back to storage.
    pub fn is_writable(&self) -> bool {
        self.writable
    }

    pub fn get(&self, key: &str) -> Option<&SettingValue> {
        self.values.get(key)
    }

    pub fn set(&mut self, key: &str, value: impl Into<SettingValue>) {
        let value = value.into();
        if self.values.get(key) == Some(&value) {
            return;
        }
        debug!("Setting {} = {:?}", key, value);
        self.values.insert(key.to_string(), value);
        self.save();
    }

    /// Returns the stored value for `key`, storing `default` first if the
    /// key is absent or holds a value of a different type.
    pub fn init(&mut self, key: &str, default: impl Into<SettingValue>) -> SettingValue {
        let default = default.into();
        match self.values.get(key) {
            Some(existing) if existing.same_kind(&default) => existing.clone(),
            existing => {
                if existing.is_some() {
                    warn!("Setting {} has the wrong type, resetting to default", key);
                }
                self.values.insert(key.to_string(), default.clone());
                self.save();
                default
            }
        }
    }

    /// Drops every stored value. An explicit reset also overwrites a
    /// document that could not be read.
    pub fn clear(&mut self) {
        self.values.clear();
        self.writable = true;
        self.save();
    }

    fn save(&mut self) {
        if !self.writable {
            debug!("Settings are read-only for this session, not saving");
            return;
        }
        let result = serialize_document(&self.values, &self.others)
            .and_then(|json| self.storage.write(&json));
        if let Err(e) = result {
            warn!("Failed to save settings: {}", e);
        }
    }
}

type Document = (BTreeMap<String, SettingValue>, Map<String, Value>);

/// Splits a settings document into our namespace and everything else.
fn parse_document(json: &str) -> Result<Document, SettingsError> {
    let mut root: Map<String, Value> = serde_json::from_str(json)?;
    let Some(Value::Object(namespace)) = root.remove(NAMESPACE) else {
        return Ok((BTreeMap::new(), root));
    };

    let mut values = BTreeMap::new();
    for (key, value) in namespace {
        match serde_json::from_value::<SettingValue>(value) {
            Ok(value) => {
                values.insert(key, value);
            }
            // null and other shapes are treated as unset
            Err(_) => debug!("Skipping setting {} with unsupported value", key),
        }
    }
    Ok((values, root))
}

fn serialize_document(
    values: &BTreeMap<String, SettingValue>,
    others: &Map<String, Value>,
) -> Result<String, SettingsError> {
    let mut root = others.clone();
    root.insert(NAMESPACE.to_string(), serde_json::to_value(values)?);
    Ok(serde_json::to_string_pretty(&Value::Object(root))?)
}

/// Typed view over the store with the application's defaults applied.
pub struct Preferences {
    store: SettingsStore,
}

impl Preferences {
    pub fn new(mut store: SettingsStore) -> Self {
        store.init(OCTAVE, DEFAULT_OCTAVE);
        store.init(VOLUME, DEFAULT_VOLUME);
        store.init(USE_KEYBOARD, DEFAULT_USE_KEYBOARD);
        store.init(CODE, DEFAULT_CODE);

        if parse_octave(&text(&store, OCTAVE, DEFAULT_OCTAVE)).is_none() {
            warn!("Stored octave is out of range, using {}", DEFAULT_OCTAVE);
            store.set(OCTAVE, DEFAULT_OCTAVE);
        }

        Self { store }
    }

    pub fn octave(&self) -> String {
        text(&self.store, OCTAVE, DEFAULT_OCTAVE)
    }

    /// The octave as a number, always within 1..=7.
    pub fn octave_number(&self) -> u8 {
        parse_octave(&self.octave()).unwrap_or(4)
    }

    /// Stores `octave` if it is one of "1".."7"; returns whether it was
    /// accepted.
    pub fn set_octave(&mut self, octave: &str) -> bool {
        if parse_octave(octave).is_none() {
            warn!("Rejecting octave {:?}", octave);
            return false;
        }
        self.store.set(OCTAVE, octave);
        true
    }

    pub fn volume(&self) -> String {
        text(&self.store, VOLUME, DEFAULT_VOLUME)
    }

    pub fn set_volume(&mut self, volume: &str) {
        self.store.set(VOLUME, volume);
    }

    pub fn use_keyboard(&self) -> bool {
        self.store
            .get(USE_KEYBOARD)
            .and_then(SettingValue::as_flag)
            .unwrap_or(DEFAULT_USE_KEYBOARD)
    }

    pub fn set_use_keyboard(&mut self, enabled: bool) {
        self.store.set(USE_KEYBOARD, enabled);
    }

    pub fn code(&self) -> String {
        text(&self.store, CODE, DEFAULT_CODE)
    }

    pub fn set_code(&mut self, code: &str) {
        self.store.set(CODE, code);
    }

    #[cfg(test)]
    pub fn store(&self) -> &SettingsStore {
        &self.store
    }
}

fn text(store: &SettingsStore, key: &str, default: &str) -> String {
    store
        .get(key)
        .and_then(SettingValue::as_text)
        .unwrap_or(default)
        .to_string()
}

fn parse_octave(octave: &str) -> Option<u8> {
    octave.trim().parse::<u8>().ok().filter(|o| (1..=7).contains(o))
}

/// Decibel value of a volume string. Anything that is not a finite
/// number counts as 0 dB.
pub fn parse_volume(volume: &str) -> f32 {
    volume
        .trim()
        .parse::<f32>()
        .ok()
        .filter(|v| v.is_finite())
        .unwrap_or(0.0)
}
