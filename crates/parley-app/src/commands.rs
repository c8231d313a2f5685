//! Line commands understood by the terminal front-end.

use std::path::PathBuf;

use parley_core::types::{OperationMode, PipelinePhase};

/// One parsed input line.
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    /// Free text: send it, or cancel when a turn is running.
    Submit(String),
    Cancel,
    NewSession,
    Attach(Vec<PathBuf>),
    /// Zero-based slot index.
    Eject(usize),
    DetachAll,
    Sessions,
    /// Zero-based history slot.
    Load(usize),
    Mode(OperationMode),
    Web(bool),
    Think(bool),
    Copy,
    ClearHistory,
    LoadModel,
    UnloadModel,
    Set { key: String, value: String },
    SaveConfig,
    Help,
    Quit,
    Invalid(String),
}

pub const HELP: &str = "\
Commands:
  <text>             send input (end a line with \\ to continue it)
  <empty line>       cancel the running turn
  /cancel            cancel the running turn
  /new               start a new session
  /attach <paths..>  attach files
  /eject <n>         eject attachment slot n
  /detach-all        remove all attachments
  /sessions          list stored sessions
  /load <n>          restore history slot n
  /mode chat|code|rpg
  /web on|off        toggle web search
  /think on|off      toggle the thinking phase
  /copy              print the last response without markup
  /model             load the configured model
  /unload            unload the model
  /set <key> <value> change a setting
  /save-config       write settings to disk
  /clear-history     delete all stored sessions
  /quit";

/// Parse one complete input (continuations already joined).
pub fn parse(line: &str) -> Command {
    let trimmed = line.trim();
    let Some(rest) = trimmed.strip_prefix('/') else {
        return Command::Submit(line.to_string());
    };

    let mut parts = rest.split_whitespace();
    let name = parts.next().unwrap_or_default();
    let args: Vec<&str> = parts.collect();

    match (name, args.as_slice()) {
        ("cancel", []) => Command::Cancel,
        ("new", []) => Command::NewSession,
        ("attach", paths) if !paths.is_empty() => {
            Command::Attach(paths.iter().map(PathBuf::from).collect())
        }
        ("eject", [n]) => slot(n).map(Command::Eject).unwrap_or_else(|| invalid(trimmed)),
        ("detach-all", []) => Command::DetachAll,
        ("sessions", []) => Command::Sessions,
        ("load", [n]) => slot(n).map(Command::Load).unwrap_or_else(|| invalid(trimmed)),
        ("mode", [m]) => OperationMode::parse(m)
            .map(Command::Mode)
            .unwrap_or_else(|| invalid(trimmed)),
        ("web", [v]) => toggle(v).map(Command::Web).unwrap_or_else(|| invalid(trimmed)),
        ("think", [v]) => toggle(v).map(Command::Think).unwrap_or_else(|| invalid(trimmed)),
        ("copy", []) => Command::Copy,
        ("model", []) => Command::LoadModel,
        ("unload", []) => Command::UnloadModel,
        ("set", [key, value @ ..]) if !value.is_empty() => Command::Set {
            key: key.to_string(),
            value: value.join(" "),
        },
        ("save-config", []) => Command::SaveConfig,
        ("clear-history", []) => Command::ClearHistory,
        ("help", []) => Command::Help,
        ("quit", []) | ("exit", []) => Command::Quit,
        _ => invalid(trimmed),
    }
}

fn invalid(line: &str) -> Command {
    Command::Invalid(line.to_string())
}

/// Slots are shown one-based.
fn slot(value: &str) -> Option<usize> {
    value.parse::<usize>().ok()?.checked_sub(1)
}

fn toggle(value: &str) -> Option<bool> {
    match value.to_lowercase().as_str() {
        "on" | "true" | "yes" | "1" => Some(true),
        "off" | "false" | "no" | "0" => Some(false),
        _ => None,
    }
}

/// Joins lines ending in a backslash into one multi-line input.
#[derive(Debug, Default)]
pub struct InputBuffer {
    pending: Vec<String>,
}

impl InputBuffer {
    /// Feed one raw line. Returns the complete input once the last line has
    /// no trailing backslash.
    pub fn push(&mut self, line: &str) -> Option<String> {
        match line.strip_suffix('\\') {
            Some(head) => {
                self.pending.push(head.to_string());
                None
            }
            None => {
                self.pending.push(line.to_string());
                Some(std::mem::take(&mut self.pending).join("\n"))
            }
        }
    }
}

/// Whether the terminal loop may exit: input has closed and no turn is
/// still running.
pub fn input_drained(input_closed: bool, phase: PipelinePhase) -> bool {
    input_closed && phase.is_idle()
}
