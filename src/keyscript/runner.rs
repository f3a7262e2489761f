//! Cooperative key-script interpreter.
//!
//! One task owns the script and is the only writer of [`RunnerState`];
//! observers read snapshots through a `watch` channel. Cancellation is
//! checked between instructions and before each `waitFor` poll, never in
//! the middle of an emitted key sequence.

use std::time::Duration;

use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::KeyScriptInstr;
use crate::engine::Display;

/// Pause after every emitted key event, one display refresh at 30 Hz.
pub const SETTLE_DELAY: Duration = Duration::from_millis(33);

/// Cadence of capture + recognize cycles while waiting for screen text.
pub const POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Recoverable failure that ends the remaining script but not the VM.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AutomationAbort {
    #[error("no key mapping for character {ch:?}")]
    UnmappedCharacter { ch: char },

    #[error("failed to deliver key event: {message}")]
    Input { message: String },

    #[error("text recognition failed: {message}")]
    Recognition { message: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunOutcome {
    Completed,
    Cancelled { next: usize },
    Aborted { index: usize, reason: AutomationAbort },
}

/// Read-only snapshot of the interpreter.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunnerState {
    /// Instruction currently executing, with its index.
    pub current: Option<(usize, KeyScriptInstr)>,
    /// Diagnostic text: last recognized screen text or abort reason.
    pub info: Option<String>,
    pub cancelled: bool,
    /// Set once, when the interpreter task ends.
    pub outcome: Option<RunOutcome>,
}

impl RunnerState {
    /// One-line status, e.g. `#3: waitFor:login | Welcome`.
    pub fn status_line(&self) -> String {
        let Some((index, instr)) = &self.current else {
            return "-".to_string();
        };
        match &self.info {
            Some(info) => format!("#{index}: {instr} | {info}"),
            None => format!("#{index}: {instr}"),
        }
    }
}

pub struct KeyScriptRunner {
    state: watch::Receiver<RunnerState>,
    cancel: CancellationToken,
    task: JoinHandle<RunOutcome>,
}

impl KeyScriptRunner {
    /// Start interpreting `script` against `display` on a new task.
    pub fn spawn(script: Vec<KeyScriptInstr>, display: Display) -> Self {
        let (state_tx, _) = watch::channel(RunnerState::default());
        Self::spawn_with(script, display, state_tx, CancellationToken::new())
    }

    /// Like [`spawn`](Self::spawn), publishing into a caller-owned state
    /// channel and honouring a caller-owned cancellation token.
    pub fn spawn_with(
        script: Vec<KeyScriptInstr>,
        display: Display,
        state_tx: watch::Sender<RunnerState>,
        cancel: CancellationToken,
    ) -> Self {
        state_tx.send_replace(RunnerState::default());
        let state = state_tx.subscribe();
        let interp = Interpreter {
            display,
            state: state_tx,
            cancel: cancel.clone(),
        };
        let task = tokio::spawn(interp.run(script));
        Self {
            state,
            cancel,
            task,
        }
    }

    pub fn state(&self) -> watch::Receiver<RunnerState> {
        self.state.clone()
    }

    /// Ask the interpreter to stop before its next instruction.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Wait for the interpreter to end.
    pub async fn wait(self) -> RunOutcome {
        match self.task.await {
            Ok(outcome) => outcome,
            Err(e) => RunOutcome::Aborted {
                index: self.state.borrow().current.as_ref().map_or(0, |(i, _)| *i),
                reason: AutomationAbort::Input {
                    message: format!("interpreter task failed: {e}"),
                },
            },
        }
    }
}

struct Interpreter {
    display: Display,
    state: watch::Sender<RunnerState>,
    cancel: CancellationToken,
}

impl Interpreter {
    async fn run(self, script: Vec<KeyScriptInstr>) -> RunOutcome {
        let outcome = self.run_script(script).await;
        match &outcome {
            RunOutcome::Completed => tracing::info!("key script completed"),
            RunOutcome::Cancelled { next } => tracing::info!(next, "key script cancelled"),
            RunOutcome::Aborted { index, reason } => {
                tracing::warn!(index, %reason, "key script aborted")
            }
        }
        let final_outcome = outcome.clone();
        self.state.send_modify(|s| {
            if let RunOutcome::Aborted { reason, .. } = &final_outcome {
                s.info = Some(reason.to_string());
            }
            if matches!(final_outcome, RunOutcome::Completed) {
                s.current = None;
            }
            s.cancelled = matches!(final_outcome, RunOutcome::Cancelled { .. });
            s.outcome = Some(final_outcome);
        });
        outcome
    }

    async fn run_script(&self, script: Vec<KeyScriptInstr>) -> RunOutcome {
        for (index, instr) in script.into_iter().enumerate() {
            if self.cancel.is_cancelled() {
                return RunOutcome::Cancelled { next: index };
            }

            tracing::debug!(index, %instr, "executing instruction");
            self.state.send_modify(|s| {
                s.current = Some((index, instr.clone()));
                s.info = None;
            });

            let result = match &instr {
                KeyScriptInstr::Sleep { ms } => {
                    tokio::time::sleep(Duration::from_millis(*ms)).await;
                    Ok(true)
                }
                KeyScriptInstr::WaitFor(needle) => self.wait_for(needle).await,
                _ => self.emit(&instr).await.map(|()| true),
            };

            match result {
                Ok(true) => {}
                Ok(false) => return RunOutcome::Cancelled { next: index },
                Err(reason) => return RunOutcome::Aborted { index, reason },
            }
        }
        RunOutcome::Completed
    }

    async fn emit(&self, instr: &KeyScriptInstr) -> Result<(), AutomationAbort> {
        for event in instr.key_events()? {
            self.display
                .keyboard
                .send_key(event)
                .await
                .map_err(|e| AutomationAbort::Input {
                    message: e.to_string(),
                })?;
            tokio::time::sleep(SETTLE_DELAY).await;
        }
        Ok(())
    }

    /// Poll until the screen contains `needle`. Returns `Ok(false)` when
    /// cancelled between polls.
    async fn wait_for(&self, needle: &str) -> Result<bool, AutomationAbort> {
        let needle = needle.to_lowercase();
        let recognizer = &self.display.recognizer;
        loop {
            if self.cancel.is_cancelled() {
                return Ok(false);
            }

            let recognized = async {
                let shot = recognizer.capture().await?;
                recognizer.recognize(&shot).await
            }
            .await
            .map_err(|e| AutomationAbort::Recognition {
                message: e.to_string(),
            })?;

            if recognized.to_lowercase().contains(&needle) {
                return Ok(true);
            }

            self.state.send_modify(|s| s.info = Some(recognized));
            tokio::time::sleep(POLL_INTERVAL).await;
        }
    }
}
