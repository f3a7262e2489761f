//! Key scripts: a compact `op:arg` grammar for unattended guest input.
//!
//! A script document is a JSON list of instruction strings:
//!
//! ```json
//! ["waitFor:login", "text:admin", "keyPress:return", "sleep:500"]
//! ```
//!
//! The whole document is parsed up front; a single malformed instruction
//! rejects the script before anything runs.

pub mod keys;
pub mod runner;

use std::fmt;
use std::path::Path;
use std::str::FromStr;

use thiserror::Error;

pub use keys::{Key, KeyEvent};
pub use runner::{AutomationAbort, KeyScriptRunner, RunOutcome, RunnerState};

use crate::error::VmctlError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KeyScriptInstr {
    KeyDown(Key),
    KeyUp(Key),
    KeyPress(Vec<Key>),
    Text(String),
    Sleep { ms: u64 },
    WaitFor(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ScriptError {
    #[error("'{instr}' is not of the form op:arg")]
    MissingArgument { instr: String },

    #[error("unknown op '{op}'")]
    UnknownOp { op: String },

    #[error("unknown key '{key}'")]
    UnknownKey { key: String },

    #[error("keyPress needs at least one key")]
    EmptyKeyList,

    #[error("invalid sleep duration '{arg}' (expected milliseconds)")]
    InvalidDuration { arg: String },
}

impl FromStr for KeyScriptInstr {
    type Err = ScriptError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (op, arg) = match s.split_once(':') {
            Some((op, arg)) if !op.is_empty() && !arg.is_empty() => (op, arg),
            _ => {
                return Err(ScriptError::MissingArgument {
                    instr: s.to_string(),
                });
            }
        };

        match op {
            "keyDown" => Ok(Self::KeyDown(parse_key(arg)?)),
            "keyUp" => Ok(Self::KeyUp(parse_key(arg)?)),
            "keyPress" => {
                let keys = arg
                    .split(':')
                    .filter(|part| !part.is_empty())
                    .map(parse_key)
                    .collect::<Result<Vec<_>, _>>()?;
                if keys.is_empty() {
                    return Err(ScriptError::EmptyKeyList);
                }
                Ok(Self::KeyPress(keys))
            }
            "text" => Ok(Self::Text(arg.to_string())),
            "sleep" => {
                let ms = arg.parse().map_err(|_| ScriptError::InvalidDuration {
                    arg: arg.to_string(),
                })?;
                Ok(Self::Sleep { ms })
            }
            "waitFor" => Ok(Self::WaitFor(arg.to_string())),
            other => Err(ScriptError::UnknownOp {
                op: other.to_string(),
            }),
        }
    }
}

fn parse_key(name: &str) -> Result<Key, ScriptError> {
    name.parse().map_err(|()| ScriptError::UnknownKey {
        key: name.to_string(),
    })
}

impl KeyScriptInstr {
    /// Expand an input instruction into the exact key events it emits.
    ///
    /// `Sleep` and `WaitFor` emit nothing. For `Text`, the whole string is
    /// mapped before anything is returned, so an unmapped character yields
    /// no events at all.
    pub fn key_events(&self) -> Result<Vec<KeyEvent>, AutomationAbort> {
        match self {
            Self::KeyDown(key) => Ok(vec![KeyEvent::down(*key)]),
            Self::KeyUp(key) => Ok(vec![KeyEvent::up(*key)]),
            Self::KeyPress(keys) => Ok(keys
                .iter()
                .copied()
                .map(KeyEvent::down)
                .chain(keys.iter().rev().copied().map(KeyEvent::up))
                .collect()),
            Self::Text(text) => text_events(text),
            Self::Sleep { .. } | Self::WaitFor(_) => Ok(Vec::new()),
        }
    }
}

fn text_events(text: &str) -> Result<Vec<KeyEvent>, AutomationAbort> {
    let mut events = Vec::with_capacity(text.len() * 2);
    for ch in text.chars() {
        let upper = ch.is_uppercase();
        let mut lower = ch.to_lowercase();
        let key = match (lower.next(), lower.next()) {
            (Some(l), None) => Key::for_char(l),
            _ => None,
        }
        .ok_or(AutomationAbort::UnmappedCharacter { ch })?;

        if upper {
            events.push(KeyEvent::down(Key::Shift));
        }
        events.push(KeyEvent::down(key));
        events.push(KeyEvent::up(key));
        if upper {
            events.push(KeyEvent::up(Key::Shift));
        }
    }
    Ok(events)
}

impl fmt::Display for KeyScriptInstr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::KeyDown(key) => write!(f, "keyDown:{key}"),
            Self::KeyUp(key) => write!(f, "keyUp:{key}"),
            Self::KeyPress(keys) => {
                f.write_str("keyPress")?;
                for key in keys {
                    write!(f, ":{key}")?;
                }
                Ok(())
            }
            Self::Text(text) => write!(f, "text:{text}"),
            Self::Sleep { ms } => write!(f, "sleep:{ms}"),
            Self::WaitFor(text) => write!(f, "waitFor:{text}"),
        }
    }
}

/// Parse a list of instruction strings, reporting the first bad one by index.
pub fn parse_script<S: AsRef<str>>(lines: &[S]) -> Result<Vec<KeyScriptInstr>, (usize, ScriptError)> {
    lines
        .iter()
        .enumerate()
        .map(|(i, line)| line.as_ref().parse().map_err(|e| (i, e)))
        .collect()
}

/// Load and parse a key-script document.
pub fn load_script(path: &Path) -> Result<Vec<KeyScriptInstr>, VmctlError> {
    let contents = std::fs::read_to_string(path).map_err(|source| VmctlError::ScriptLoad {
        path: path.display().to_string(),
        source,
    })?;

    let lines: Vec<String> =
        facet_json::from_str(&contents).map_err(|e| VmctlError::ScriptDocument {
            path: path.display().to_string(),
            message: e.to_string(),
        })?;

    let script = parse_script(&lines).map_err(|(index, source)| VmctlError::ScriptParse {
        path: path.display().to_string(),
        index,
        source,
    })?;

    tracing::debug!(path = %path.display(), instructions = script.len(), "loaded key script");
    Ok(script)
}
