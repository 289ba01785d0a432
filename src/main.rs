mod audio;
mod effects;
mod evaluator;
mod graph;
mod input;
mod keymap;
mod script;
mod settings;
mod state;
mod synth;
mod ui;

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tokio::runtime::Runtime;
use tracing::{error, info, warn, Level};

use crate::graph::OutputNode;
use crate::settings::{FileStorage, MemoryStorage, Preferences, SettingsStore, Storage};
use crate::state::Keyboard;

#[derive(Parser)]
#[command(name = "keyboard-synth")]
#[command(about = "Playable synthesizer keyboard with scriptable voices", long_about = None)]
struct Cli {
    /// Settings file (default: <config dir>/keyboard-synth/settings.json)
    #[arg(long)]
    settings: Option<PathBuf>,

    /// Discard saved settings and start from the defaults
    #[arg(long)]
    reset: bool,

    /// Keep settings in memory only, leaving the settings file untouched
    #[arg(long, conflicts_with = "settings")]
    ephemeral: bool,

    /// Do not open an audio output device
    #[arg(long)]
    no_audio: bool,

    /// More log output (-v debug, -vv trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Less log output (-q warnings, -qq errors)
    #[arg(short, long, action = clap::ArgAction::Count, conflicts_with = "verbose")]
    quiet: u8,
}

impl Cli {
    fn log_level(&self) -> Level {
        match (self.verbose, self.quiet) {
            (0, 0) => Level::INFO,
            (1, _) => Level::DEBUG,
            (_, 0) => Level::TRACE,
            (_, 1) => Level::WARN,
            _ => Level::ERROR,
        }
    }
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    tracing_subscriber::fmt()
        .with_max_level(cli.log_level())
        .init();

    let storage: Box<dyn Storage> = if cli.ephemeral {
        info!("Settings will not be saved");
        Box::new(MemoryStorage::new())
    } else {
        let path = cli.settings.clone().unwrap_or_else(FileStorage::default_path);
        info!("Using settings file {}", path.display());
        Box::new(FileStorage::new(path))
    };
    let mut store = SettingsStore::load(storage);
    if cli.reset {
        info!("Resetting saved settings");
        store.clear();
    } else if !store.is_writable() {
        warn!("Settings will not be saved this session, run with --reset to replace them");
    }
    let prefs = Preferences::new(store);

    let runtime = Runtime::new()?;
    let output = Arc::new(OutputNode::default());
    let mut keyboard = Keyboard::new(prefs, output.clone(), runtime.handle().clone());

    if cli.no_audio {
        info!("Audio output disabled");
    } else {
        runtime.spawn(audio::run_audio_output(output));
    }

    keyboard.request_eval();
    let result = ui::run_ui(keyboard);

    // the audio thread never returns on its own
    runtime.shutdown_background();

    if let Err(e) = result {
        error!("UI failed: {}", e);
        return Err(e.into());
    }
    Ok(())
}
