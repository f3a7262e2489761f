//! A running VM and everything attached to it.
//!
//! The engine pushes [`MachineEvent`]s; one lifecycle task per instance turns
//! them into a single-fire stop notification, forwards network loss as an
//! orderly stop request, and hands the display to an attached key script.

use std::path::Path;
use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::engine::{DeviceConfig, Engine, Machine, MachineEvent, MachineHandle, StartOptions};
use crate::error::VmctlError;
use crate::keyscript::{self, KeyScriptInstr, KeyScriptRunner, RunnerState};

/// Why an instance stopped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StopReason {
    /// The guest halted cleanly.
    Halted,
    /// The guest stopped with an error.
    Failed(String),
}

impl StopReason {
    pub fn error(&self) -> Option<&str> {
        match self {
            StopReason::Halted => None,
            StopReason::Failed(detail) => Some(detail),
        }
    }
}

/// Observer side of an instance's stop notification.
#[derive(Clone)]
pub struct StopSubscription {
    rx: watch::Receiver<Option<StopReason>>,
}

impl StopSubscription {
    /// Resolve once the instance has stopped.
    pub async fn wait(&mut self) -> StopReason {
        match self.rx.wait_for(Option::is_some).await {
            Ok(reason) => reason.clone().unwrap_or(StopReason::Halted),
            Err(_) => StopReason::Failed("instance dropped before stopping".into()),
        }
    }

    pub fn get(&self) -> Option<StopReason> {
        self.rx.borrow().clone()
    }
}

type PendingScript = Arc<Mutex<Option<Vec<KeyScriptInstr>>>>;

pub struct Instance {
    machine: Arc<dyn Machine>,
    events: Option<mpsc::UnboundedReceiver<MachineEvent>>,
    stop: Arc<watch::Sender<Option<StopReason>>>,
    script: PendingScript,
    script_state: watch::Sender<RunnerState>,
    script_cancel: CancellationToken,
    lifecycle: Option<JoinHandle<()>>,
}

impl Instance {
    pub fn new(handle: MachineHandle) -> Self {
        let (stop, _) = watch::channel(None);
        let (script_state, _) = watch::channel(RunnerState::default());
        Self {
            machine: handle.machine,
            events: Some(handle.events),
            stop: Arc::new(stop),
            script: Arc::new(Mutex::new(None)),
            script_state,
            script_cancel: CancellationToken::new(),
            lifecycle: None,
        }
    }

    /// Create the engine machine for `config` and wrap it.
    pub fn create(engine: &dyn Engine, config: DeviceConfig) -> Result<Self, VmctlError> {
        engine.create_machine(config).map(Self::new)
    }

    /// Parse the key script at `path` and attach it.
    ///
    /// On error nothing is attached and the instance can still be started.
    pub fn load_key_script(&self, path: &Path) -> Result<(), VmctlError> {
        let script = keyscript::load_script(path)?;
        self.attach_script(script);
        Ok(())
    }

    /// Attach a parsed script. It starts when the next display comes up.
    pub fn attach_script(&self, script: Vec<KeyScriptInstr>) {
        tracing::debug!(instructions = script.len(), "key script attached");
        *self.script.lock().unwrap_or_else(PoisonError::into_inner) = Some(script);
    }

    /// Ask the engine to boot. Returns once the request is accepted;
    /// boot progress and termination arrive through [`Instance::stopped`].
    pub async fn start(&mut self, options: StartOptions) -> Result<(), VmctlError> {
        let Some(events) = self.events.take() else {
            return Err(VmctlError::engine(
                "instance was already started",
                "create a new instance for every run",
            ));
        };

        tracing::info!(recovery = options.recovery, "starting VM");
        self.machine.start(options).await?;

        let lifecycle = Lifecycle {
            machine: self.machine.clone(),
            stop: self.stop.clone(),
            script: self.script.clone(),
            script_state: self.script_state.clone(),
            script_cancel: self.script_cancel.clone(),
        };
        self.lifecycle = Some(tokio::spawn(lifecycle.run(events)));
        Ok(())
    }

    /// Request an orderly guest shutdown; the halt fires the stop notification.
    pub async fn request_stop(&self) -> Result<(), VmctlError> {
        tracing::info!("requesting VM stop");
        self.machine.request_stop().await
    }

    pub fn stopped(&self) -> StopSubscription {
        StopSubscription {
            rx: self.stop.subscribe(),
        }
    }

    pub fn stop_reason(&self) -> Option<StopReason> {
        self.stop.borrow().clone()
    }

    /// Snapshots of the attached script's interpreter.
    pub fn script_state(&self) -> watch::Receiver<RunnerState> {
        self.script_state.subscribe()
    }

    /// Stop the attached script before its next instruction.
    pub fn cancel_script(&self) {
        self.script_cancel.cancel();
    }
}

impl Drop for Instance {
    fn drop(&mut self) {
        self.script_cancel.cancel();
        if let Some(task) = &self.lifecycle {
            task.abort();
        }
    }
}

struct Lifecycle {
    machine: Arc<dyn Machine>,
    stop: Arc<watch::Sender<Option<StopReason>>>,
    script: PendingScript,
    script_state: watch::Sender<RunnerState>,
    script_cancel: CancellationToken,
}

impl Lifecycle {
    async fn run(self, mut events: mpsc::UnboundedReceiver<MachineEvent>) {
        let mut runner: Option<KeyScriptRunner> = None;

        let reason = loop {
            let Some(event) = events.recv().await else {
                break StopReason::Failed("engine stopped reporting machine state".into());
            };
            tracing::debug!(event = ?event, "machine event");
            match event {
                MachineEvent::DisplayReady(display) => {
                    let script = self.script.lock().unwrap_or_else(PoisonError::into_inner).take();
                    if let Some(script) = script {
                        tracing::info!(instructions = script.len(), "display ready, running key script");
                        runner = Some(KeyScriptRunner::spawn_with(
                            script,
                            display,
                            self.script_state.clone(),
                            self.script_cancel.clone(),
                        ));
                    }
                }
                MachineEvent::GuestStopped => break StopReason::Halted,
                MachineEvent::GuestFailed(detail) => break StopReason::Failed(detail),
                MachineEvent::NetworkDisconnected => {
                    tracing::warn!("network attachment lost, requesting stop");
                    if let Err(e) = self.machine.request_stop().await {
                        tracing::error!(error = %e, "stop request after network loss failed");
                    }
                }
            }
        };

        if let Some(runner) = runner
            && !runner.is_finished()
        {
            runner.cancel();
        }

        self.fire(reason);
    }

    fn fire(&self, reason: StopReason) {
        let fired = self.stop.send_if_modified(|current| {
            if current.is_some() {
                return false;
            }
            *current = Some(reason.clone());
            true
        });
        if fired {
            match reason.error() {
                None => tracing::info!("VM stopped"),
                Some(detail) => tracing::error!(detail, "VM stopped with error"),
            }
        }
    }
}
