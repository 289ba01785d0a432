use eframe::{App, CreationContext};
use egui::{
    Align2, CentralPanel, Color32, ComboBox, Context, FontId, Pos2, Rect, Rounding, ScrollArea,
    Sense, TextEdit, Vec2,
};
use egui_plot::{Line, Plot, PlotBounds, PlotPoints};
use tracing::info;

use crate::graph::WAVEFORM_LEN;
use crate::input::{collect_key_events, InputEvent, InputHandler};
use crate::keymap::{KeySlot, KEY_MAP};
use crate::state::Keyboard;

const WHITE_KEY_WIDTH: f32 = 56.0;
const WHITE_KEY_HEIGHT: f32 = 180.0;
const BLACK_KEY_WIDTH: f32 = WHITE_KEY_WIDTH * 0.6;
const BLACK_KEY_HEIGHT: f32 = WHITE_KEY_HEIGHT * 0.6;
const WHITE_KEYS: usize = 7;

/// Black key centers, in white key widths from the left edge.
const BLACK_KEY_POSITIONS: [f32; 5] = [1.0, 2.0, 4.0, 5.0, 6.0];

/// Screen rectangles of the twelve keys, indexed by slot.
struct PianoLayout {
    keys: Vec<Rect>,
}

impl PianoLayout {
    fn new(origin: Pos2) -> Self {
        let keys = KEY_MAP
            .iter()
            .map(|entry| {
                let slot = entry.slot.0;
                if slot < WHITE_KEYS {
                    Rect::from_min_size(
                        Pos2::new(origin.x + slot as f32 * WHITE_KEY_WIDTH, origin.y),
                        Vec2::new(WHITE_KEY_WIDTH - 1.0, WHITE_KEY_HEIGHT),
                    )
                } else {
                    let center = BLACK_KEY_POSITIONS[slot - WHITE_KEYS] * WHITE_KEY_WIDTH;
                    Rect::from_min_size(
                        Pos2::new(origin.x + center - BLACK_KEY_WIDTH / 2.0, origin.y),
                        Vec2::new(BLACK_KEY_WIDTH, BLACK_KEY_HEIGHT),
                    )
                }
            })
            .collect();
        Self { keys }
    }

    /// The key under `pos`. Black keys sit on top.
    fn hit(&self, pos: Pos2) -> Option<KeySlot> {
        (WHITE_KEYS..self.keys.len())
            .chain(0..WHITE_KEYS)
            .find(|&slot| self.keys[slot].contains(pos))
            .map(KeySlot)
    }
}

/// The synthesizer window.
pub struct KeyboardApp {
    keyboard: Keyboard,
    input: InputHandler,
    /// Text as typed, which may not parse yet.
    volume: String,
    code: String,
}

impl KeyboardApp {
    pub fn new(keyboard: Keyboard) -> Self {
        let volume = keyboard.volume();
        let code = keyboard.code();
        Self {
            keyboard,
            input: InputHandler::new(),
            volume,
            code,
        }
    }

    fn piano(&mut self, ui: &mut egui::Ui) {
        let size = Vec2::new(WHITE_KEYS as f32 * WHITE_KEY_WIDTH, WHITE_KEY_HEIGHT);
        let (rect, response) = ui.allocate_exact_size(size, Sense::click_and_drag());
        let layout = PianoLayout::new(rect.min);

        let (pressed, released, pos) = ui.input(|i| {
            (
                i.pointer.primary_pressed(),
                i.pointer.primary_released(),
                i.pointer.interact_pos(),
            )
        });
        let over = pos.and_then(|pos| layout.hit(pos));
        if pressed {
            if let Some(slot) = over {
                self.input.handle(&mut self.keyboard, InputEvent::PointerDown(slot));
            }
        }
        if released && (over.is_some() || self.input.mouse_key().is_some()) {
            self.input.handle(&mut self.keyboard, InputEvent::PointerUp(over));
        }

        let painter = ui.painter_at(rect);
        let pressed_fill = ui.visuals().selection.bg_fill;
        for entry in KEY_MAP.iter() {
            let key_rect = layout.keys[entry.slot.0];
            let active = self.keyboard.is_pressed(entry.slot);
            let black = entry.pitch.is_sharp();
            let (fill, label_color) = match (active, black) {
                (true, _) => (pressed_fill, Color32::WHITE),
                (false, false) => (Color32::from_rgb(245, 245, 245), Color32::from_rgb(40, 40, 40)),
                (false, true) => (Color32::from_rgb(20, 20, 20), Color32::from_gray(200)),
            };
            painter.rect(key_rect, Rounding::same(3.0), fill, (1.0, Color32::BLACK));
            painter.text(
                Pos2::new(key_rect.center().x, key_rect.max.y - 6.0),
                Align2::CENTER_BOTTOM,
                format!("{}\n{}", entry.pitch.name(), entry.input.to_ascii_uppercase()),
                FontId::monospace(12.0),
                label_color,
            );
        }

        response.on_hover_text("Click a key to play it");
    }

    fn controls(&mut self, ui: &mut egui::Ui) {
        ui.horizontal(|ui| {
            ui.label("Volume (dB)");
            if ui
                .add(TextEdit::singleline(&mut self.volume).desired_width(60.0))
                .changed()
            {
                self.keyboard.set_volume(&self.volume);
            }

            ui.separator();
            ui.label("Octave");
            let mut octave = self.keyboard.octave();
            ComboBox::from_id_salt("octave")
                .selected_text(octave.as_str())
                .show_ui(ui, |ui| {
                    for n in 1..=7 {
                        let value = n.to_string();
                        ui.selectable_value(&mut octave, value.clone(), value);
                    }
                });
            if octave != self.keyboard.octave() {
                self.keyboard.set_octave(&octave);
            }

            ui.separator();
            let mut use_keyboard = self.keyboard.use_keyboard();
            if ui.checkbox(&mut use_keyboard, "Use Keyboard").changed() {
                self.keyboard.set_use_keyboard(use_keyboard);
            }

            if ui.button("Release All").clicked() {
                self.keyboard.release_all();
            }
        });
    }

    fn editor(&mut self, ui: &mut egui::Ui) {
        let edited = ScrollArea::vertical()
            .max_height(260.0)
            .show(ui, |ui| {
                ui.add(
                    TextEdit::multiline(&mut self.code)
                        .code_editor()
                        .desired_rows(12)
                        .desired_width(f32::INFINITY),
                )
                .changed()
            })
            .inner;
        if edited {
            self.keyboard.set_code(&self.code);
        }

        ui.horizontal(|ui| {
            if ui.button("Eval").clicked() {
                self.keyboard.request_eval();
            }
            if self.keyboard.is_evaluating() {
                ui.spinner();
            }
        });
        if let Some(error) = self.keyboard.code_error() {
            ui.colored_label(Color32::RED, error);
        }
    }

    fn scope(&self, ui: &mut egui::Ui) {
        let buffer = self.keyboard.output().waveform();
        let plot = Plot::new("Waveform")
            .view_aspect(4.0)
            .show_axes([false, true]);

        plot.show(ui, |plot_ui| {
            let points: Vec<_> = buffer
                .iter()
                .enumerate()
                .map(|(i, &v)| [i as f64, v as f64])
                .collect();

            plot_ui.set_plot_bounds(PlotBounds::from_min_max(
                [0.0, -1.1],
                [WAVEFORM_LEN as f64, 1.1],
            ));
            plot_ui.line(Line::new(PlotPoints::from(points)));
        });
    }
}

impl App for KeyboardApp {
    fn update(&mut self, ctx: &Context, _: &mut eframe::Frame) {
        for event in collect_key_events(ctx) {
            self.input.handle(&mut self.keyboard, event);
        }
        self.keyboard.poll_evaluations();
        ctx.request_repaint();

        CentralPanel::default().show(ctx, |ui| {
            self.piano(ui);
            ui.add_space(8.0);
            self.controls(ui);
            ui.add_space(8.0);
            self.editor(ui);
            ui.add_space(8.0);
            self.scope(ui);
        });
    }
}

/// Initializes and runs the eframe application.
pub fn run_ui(keyboard: Keyboard) -> Result<(), eframe::Error> {
    info!("Opening window");
    let options = eframe::NativeOptions::default();
    eframe::run_native(
        "Keyboard Synth",
        options,
        Box::new(|_cc: &CreationContext| Ok(Box::new(KeyboardApp::new(keyboard)))),
    )
}
