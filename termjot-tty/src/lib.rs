use std::io::{self, Write};
use std::path::PathBuf;

use crossterm::{
    cursor,
    event::{Event, KeyCode, KeyEvent, KeyModifiers},
    queue,
    terminal::{Clear, ClearType},
};
use termjot_core::model::PropertyKind;
use termjot_core::{BusySurface, Command, ExportFormat};
use tracing::trace;

#[derive(Debug, Clone, PartialEq)]
pub enum UiEvent {
    Command(Command),
    BeginPrompt(Prompt),
    PromptChanged { text: String },
    PromptCancel,
    Quit,
    None,
}

/// What a line typed at the bottom of the screen is for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Prompt {
    Text,
    SaveAs,
    Open,
}

impl Prompt {
    fn label(self) -> &'static str {
        match self {
            Prompt::Text => "text",
            Prompt::SaveAs => "save as",
            Prompt::Open => "open",
        }
    }

    fn command(self, input: String) -> Command {
        match self {
            Prompt::Text => Command::InsertText { text: input },
            Prompt::SaveAs => Command::SaveAs {
                path: PathBuf::from(input.trim()),
            },
            Prompt::Open => Command::Open {
                path: PathBuf::from(input.trim()),
            },
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum InputMode {
    #[default]
    Normal,
    Prompt(Prompt),
}

#[derive(Debug, Default)]
pub struct EventMapper {
    pending_count: Option<usize>,
    pending_digits: String,
    mode: InputMode,
    text_buffer: String,
}

fn plain(modifiers: KeyModifiers) -> bool {
    modifiers.is_empty() || modifiers == KeyModifiers::SHIFT
}

impl EventMapper {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_mode(&mut self, mode: InputMode) {
        if self.mode != mode {
            self.reset_count();
            self.text_buffer.clear();
            self.mode = mode;
        }
    }

    pub fn mode(&self) -> InputMode {
        self.mode
    }

    pub fn map_event(&mut self, event: Event) -> UiEvent {
        match self.mode {
            InputMode::Normal => self.map_event_normal(event),
            InputMode::Prompt(prompt) => self.map_event_prompt(prompt, event),
        }
    }

    fn map_event_normal(&mut self, event: Event) -> UiEvent {
        let Event::Key(KeyEvent {
            code, modifiers, ..
        }) = event
        else {
            return UiEvent::None;
        };
        match (code, modifiers) {
            (KeyCode::Char(c), KeyModifiers::NONE) if c.is_ascii_digit() => {
                if let Some(digit) = c.to_digit(10) {
                    self.push_digit(digit as usize);
                }
                UiEvent::None
            }
            (KeyCode::Char('r'), m) if m.contains(KeyModifiers::CONTROL) => {
                let count = self.take_count();
                UiEvent::Command(Command::Redo { count })
            }
            (KeyCode::Char('s'), m) if m.contains(KeyModifiers::CONTROL) => {
                self.single(Command::Save)
            }
            (KeyCode::Char('j'), KeyModifiers::NONE) | (KeyCode::Down, KeyModifiers::NONE) => {
                let count = self.take_count();
                UiEvent::Command(Command::NextPage { count })
            }
            (KeyCode::Char('k'), KeyModifiers::NONE) | (KeyCode::Up, KeyModifiers::NONE) => {
                let count = self.take_count();
                UiEvent::Command(Command::PrevPage { count })
            }
            (KeyCode::Char('g'), KeyModifiers::NONE) | (KeyCode::Home, _) => {
                self.single(Command::GotoPage { page: 0 })
            }
            (KeyCode::Char('G'), m) if plain(m) => self.single(Command::LastPage),
            (KeyCode::End, _) => self.single(Command::LastPage),
            (KeyCode::Char('u'), KeyModifiers::NONE) => {
                let count = self.take_count();
                UiEvent::Command(Command::Undo { count })
            }
            (KeyCode::Char('o'), KeyModifiers::NONE) => self.single(Command::InsertPage),
            (KeyCode::Char('D'), m) if plain(m) => self.single(Command::DeletePage),
            (KeyCode::Char('s'), KeyModifiers::NONE) => self.single(Command::SampleStroke),
            (KeyCode::Char('x'), KeyModifiers::NONE) => self.single(Command::DeleteLastElement),
            (KeyCode::Char('c'), KeyModifiers::NONE) => self.cycle(PropertyKind::Color),
            (KeyCode::Char('w'), KeyModifiers::NONE) => self.cycle(PropertyKind::Size),
            (KeyCode::Char('f'), KeyModifiers::NONE) => self.cycle(PropertyKind::Fill),
            (KeyCode::Char('l'), KeyModifiers::NONE) => self.cycle(PropertyKind::LineStyle),
            (KeyCode::Char('F'), m) if plain(m) => self.cycle(PropertyKind::Font),
            (KeyCode::Char('y'), KeyModifiers::NONE) => self.single(Command::Copy),
            (KeyCode::Char('X'), m) if plain(m) => self.single(Command::Cut),
            (KeyCode::Char('p'), KeyModifiers::NONE) => self.single(Command::Paste),
            (KeyCode::Char('e'), KeyModifiers::NONE) => self.single(Command::Export {
                format: ExportFormat::Svg,
            }),
            (KeyCode::Char('n'), KeyModifiers::NONE) => self.single(Command::NewDocument),
            (KeyCode::Char('i'), KeyModifiers::NONE) => self.begin_prompt(Prompt::Text),
            (KeyCode::Char('W'), m) if plain(m) => self.begin_prompt(Prompt::SaveAs),
            (KeyCode::Char('O'), m) if plain(m) => self.begin_prompt(Prompt::Open),
            (KeyCode::Char('q'), _) => {
                self.reset_count();
                UiEvent::Quit
            }
            _ => {
                self.reset_count();
                UiEvent::None
            }
        }
    }

    fn cycle(&mut self, kind: PropertyKind) -> UiEvent {
        self.single(Command::CycleProperty { kind })
    }

    fn begin_prompt(&mut self, prompt: Prompt) -> UiEvent {
        self.set_mode(InputMode::Prompt(prompt));
        UiEvent::BeginPrompt(prompt)
    }

    fn map_event_prompt(&mut self, prompt: Prompt, event: Event) -> UiEvent {
        let Event::Key(KeyEvent {
            code, modifiers, ..
        }) = event
        else {
            return UiEvent::None;
        };
        match (code, modifiers) {
            (KeyCode::Esc, _) => {
                self.set_mode(InputMode::Normal);
                UiEvent::PromptCancel
            }
            (KeyCode::Enter, _) => {
                let text = std::mem::take(&mut self.text_buffer);
                self.set_mode(InputMode::Normal);
                if text.trim().is_empty() {
                    UiEvent::PromptCancel
                } else {
                    UiEvent::Command(prompt.command(text))
                }
            }
            (KeyCode::Backspace, _) => {
                self.text_buffer.pop();
                UiEvent::PromptChanged {
                    text: self.text_buffer.clone(),
                }
            }
            (KeyCode::Char(c), m) if plain(m) => {
                self.text_buffer.push(c);
                UiEvent::PromptChanged {
                    text: self.text_buffer.clone(),
                }
            }
            _ => UiEvent::None,
        }
    }

    fn single(&mut self, command: Command) -> UiEvent {
        self.reset_count();
        UiEvent::Command(command)
    }

    fn push_digit(&mut self, digit: usize) {
        let current = self.pending_count.unwrap_or(0);
        let next = current.saturating_mul(10).saturating_add(digit);
        self.pending_count = Some(next);
        if let Some(c) = char::from_digit(digit as u32, 10) {
            self.pending_digits.push(c);
        }
    }

    fn take_count(&mut self) -> usize {
        let count = self
            .pending_count
            .take()
            .filter(|&count| count > 0)
            .unwrap_or(1);
        self.pending_digits.clear();
        count
    }

    fn reset_count(&mut self) {
        self.pending_count = None;
        self.pending_digits.clear();
    }

    pub fn pending_input(&self) -> Option<String> {
        if let InputMode::Prompt(prompt) = self.mode {
            return Some(format!("{}: {}", prompt.label(), self.text_buffer));
        }
        if self.pending_digits.is_empty() {
            None
        } else {
            Some(self.pending_digits.clone())
        }
    }
}

/// Everything the status line shows apart from the busy indicator.
#[derive(Debug, Clone, Default)]
pub struct StatusInfo {
    pub title: String,
    pub page: usize,
    pub page_count: usize,
    pub elements: usize,
    pub undo: String,
    pub pending: Option<String>,
    pub message: Option<String>,
}

const BAR_WIDTH: usize = 20;

/// Bottom-row status display. Doubles as the terminal's busy indicator: while
/// blocked it replaces the usual summary with the reason and a progress bar.
pub struct StatusLine<W: Write> {
    writer: W,
    controls_enabled: bool,
    busy: Option<String>,
    progress: (usize, usize),
    needs_redraw: bool,
}

impl<W: Write> StatusLine<W> {
    pub fn new(writer: W) -> Self {
        Self {
            writer,
            controls_enabled: true,
            busy: None,
            progress: (0, 0),
            needs_redraw: true,
        }
    }

    pub fn writer(&mut self) -> &mut W {
        &mut self.writer
    }

    pub fn controls_enabled(&self) -> bool {
        self.controls_enabled
    }

    /// True once after any busy-state change.
    pub fn take_redraw(&mut self) -> bool {
        std::mem::replace(&mut self.needs_redraw, false)
    }

    pub fn label(&self, info: &StatusInfo) -> String {
        if let Some(reason) = &self.busy {
            let (current, maximum) = self.progress;
            let filled = if maximum == 0 {
                0
            } else {
                current.min(maximum) * BAR_WIDTH / maximum
            };
            let percent = if maximum == 0 { 0 } else { current * 100 / maximum };
            return format!(
                "{reason}... [{}{}] {percent}%",
                "#".repeat(filled),
                " ".repeat(BAR_WIDTH - filled)
            );
        }
        let mut label = format!(
            "{} | page {}/{} | {} elements | {}",
            info.title,
            info.page + 1,
            info.page_count.max(1),
            info.elements,
            info.undo
        );
        if let Some(pending) = &info.pending {
            label.push_str(" | ");
            label.push_str(pending);
        }
        if let Some(message) = &info.message {
            label.push_str(" | ");
            label.push_str(message);
        }
        label
    }

    pub fn draw(&mut self, info: &StatusInfo, row: u16) -> io::Result<()> {
        let label = self.label(info);
        queue!(
            self.writer,
            cursor::MoveTo(0, row),
            Clear(ClearType::CurrentLine)
        )?;
        write_status_line(&mut self.writer, &label)
    }
}

impl<W: Write> BusySurface for StatusLine<W> {
    fn set_controls_enabled(&mut self, enabled: bool) {
        self.controls_enabled = enabled;
    }

    fn show_busy(&mut self, reason: &str) {
        trace!(reason, "busy indicator shown");
        self.busy = Some(reason.to_string());
        self.needs_redraw = true;
    }

    fn set_progress(&mut self, current: usize, maximum: usize) {
        self.progress = (current, maximum);
        self.needs_redraw = true;
    }

    fn hide_busy(&mut self) {
        self.busy = None;
        self.progress = (0, 0);
        self.needs_redraw = true;
    }
}

pub fn write_status_line<W: Write>(writer: &mut W, label: &str) -> io::Result<()> {
    write!(writer, "{}", label)?;
    writer.flush()
}
