//! Actor that owns the current action tree.
//!
//! The supervisor holds at most one running root at a time, so independently
//! built trees never drive the same instrument concurrently. All state lives
//! in a single tokio task; callers talk to it through a cloneable
//! [`SupervisorHandle`] that sends [`SupervisorCommand`]s and awaits oneshot
//! replies.
//!
//! ```text
//! SupervisorHandle ──mpsc──► Supervisor::run ──► ActionTree
//!        ▲                        │  ▲              │
//!        │                        │  └── mailbox ◄──┘ (device callbacks, timers)
//!        ├── watch<RunStatus> ◄───┤
//!        └── broadcast<ActionEvent> ◄─ every tree event
//! ```

use crate::action::{ActionEvent, ActionId, ActionSnapshot, ActionTree, Envelope};
use crate::action_log::ActionLog;
use crate::config::EngineSettings;
use crate::error::{ActionError, EngineError, EngineResult};
use serde::{Deserialize, Serialize};
use std::ops::ControlFlow;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{info, warn};
use uuid::Uuid;

/// State of the current (or most recent) run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunStatus {
    /// Identifier assigned when the run was accepted.
    pub run_id: Uuid,
    /// Snapshot of the root action.
    pub root: ActionSnapshot,
}

impl RunStatus {
    /// True once the root reached a terminal state.
    pub fn is_finished(&self) -> bool {
        self.root.state.is_terminal()
    }
}

/// Commands that can be sent to the [`Supervisor`]
#[derive(Debug)]
pub enum SupervisorCommand {
    /// Start `root` of `tree` as the current run
    Run {
        tree: Box<ActionTree>,
        root: ActionId,
        response: oneshot::Sender<EngineResult<Uuid>>,
    },
    /// Pause the current root
    Pause { response: oneshot::Sender<bool> },
    /// Resume the current root
    Resume { response: oneshot::Sender<bool> },
    /// Cancel the current root
    Cancel { response: oneshot::Sender<bool> },
    /// Snapshot of the current run
    Status {
        response: oneshot::Sender<Option<RunStatus>>,
    },
    /// Cancel any active run and stop the actor
    Shutdown { response: oneshot::Sender<()> },
}

impl SupervisorCommand {
    /// Helper to create a Run command
    pub fn run(tree: ActionTree, root: ActionId) -> (Self, oneshot::Receiver<EngineResult<Uuid>>) {
        let (tx, rx) = oneshot::channel();
        (
            Self::Run {
                tree: Box::new(tree),
                root,
                response: tx,
            },
            rx,
        )
    }

    /// Helper to create a Pause command
    pub fn pause() -> (Self, oneshot::Receiver<bool>) {
        let (tx, rx) = oneshot::channel();
        (Self::Pause { response: tx }, rx)
    }

    /// Helper to create a Resume command
    pub fn resume() -> (Self, oneshot::Receiver<bool>) {
        let (tx, rx) = oneshot::channel();
        (Self::Resume { response: tx }, rx)
    }

    /// Helper to create a Cancel command
    pub fn cancel() -> (Self, oneshot::Receiver<bool>) {
        let (tx, rx) = oneshot::channel();
        (Self::Cancel { response: tx }, rx)
    }

    /// Helper to create a Status command
    pub fn status() -> (Self, oneshot::Receiver<Option<RunStatus>>) {
        let (tx, rx) = oneshot::channel();
        (Self::Status { response: tx }, rx)
    }

    /// Helper to create a Shutdown command
    pub fn shutdown() -> (Self, oneshot::Receiver<()>) {
        let (tx, rx) = oneshot::channel();
        (Self::Shutdown { response: tx }, rx)
    }
}

struct ActiveRun {
    id: Uuid,
    tree: ActionTree,
    root: ActionId,
    logged: bool,
}

impl ActiveRun {
    fn is_finished(&self) -> bool {
        self.tree.state(self.root).map_or(true, |s| s.is_terminal())
    }

    fn status(&self) -> Option<RunStatus> {
        Some(RunStatus {
            run_id: self.id,
            root: self.tree.snapshot(self.root)?,
        })
    }
}

enum Wake {
    Command(SupervisorCommand),
    Envelope(Envelope),
    Closed,
}

/// Waits for the next message of an unfinished run; never resolves otherwise.
async fn next_envelope(active: &mut Option<ActiveRun>) -> Option<Envelope> {
    let live = active.as_ref().is_some_and(|r| !r.is_finished());
    match active {
        Some(run) if live => run.tree.next_envelope().await,
        _ => std::future::pending().await,
    }
}

/// Actor holding the current run
pub struct Supervisor {
    events: broadcast::Sender<ActionEvent>,
    status_tx: watch::Sender<Option<RunStatus>>,
    log: Arc<dyn ActionLog>,
    active: Option<ActiveRun>,
}

impl Supervisor {
    /// Spawn the actor on the current tokio runtime.
    pub fn spawn(settings: &EngineSettings, log: Arc<dyn ActionLog>) -> SupervisorHandle {
        let (command_tx, command_rx) = mpsc::channel(settings.command_capacity.max(1));
        let (events, _) = broadcast::channel(settings.event_capacity.max(1));
        let (status_tx, status_rx) = watch::channel(None);

        let actor = Self {
            events: events.clone(),
            status_tx,
            log,
            active: None,
        };
        let task = tokio::spawn(actor.run(command_rx));

        SupervisorHandle {
            commands: command_tx,
            status: status_rx,
            events,
            task: Arc::new(parking_lot::Mutex::new(Some(task))),
        }
    }

    /// Event loop: handles commands and the current tree's mailbox until shutdown.
    pub async fn run(mut self, mut command_rx: mpsc::Receiver<SupervisorCommand>) {
        info!("Supervisor started");

        loop {
            let wake = tokio::select! {
                command = command_rx.recv() => match command {
                    Some(command) => Wake::Command(command),
                    None => Wake::Closed,
                },
                Some(envelope) = next_envelope(&mut self.active) => Wake::Envelope(envelope),
            };

            match wake {
                Wake::Command(command) => {
                    if self.handle_command(command).is_break() {
                        break;
                    }
                }
                Wake::Envelope(envelope) => {
                    if let Some(run) = self.active.as_mut() {
                        run.tree.dispatch(envelope);
                        run.tree.process_pending();
                    }
                    self.publish();
                }
                Wake::Closed => {
                    self.shutdown();
                    break;
                }
            }
        }

        info!("Supervisor stopped");
    }

    fn handle_command(&mut self, command: SupervisorCommand) -> ControlFlow<()> {
        match command {
            SupervisorCommand::Run {
                tree,
                root,
                response,
            } => {
                let result = self.start_run(*tree, root);
                let _ = response.send(result);
            }
            SupervisorCommand::Pause { response } => {
                let accepted = self.with_root(|tree, root| tree.pause(root));
                let _ = response.send(accepted);
            }
            SupervisorCommand::Resume { response } => {
                let accepted = self.with_root(|tree, root| tree.resume(root));
                let _ = response.send(accepted);
            }
            SupervisorCommand::Cancel { response } => {
                let accepted = self.with_root(|tree, root| tree.cancel(root));
                let _ = response.send(accepted);
            }
            SupervisorCommand::Status { response } => {
                let _ = response.send(self.active.as_ref().and_then(ActiveRun::status));
            }
            SupervisorCommand::Shutdown { response } => {
                info!("Shutdown command received");
                self.shutdown();
                let _ = response.send(());
                return ControlFlow::Break(());
            }
        }
        ControlFlow::Continue(())
    }

    fn start_run(&mut self, mut tree: ActionTree, root: ActionId) -> EngineResult<Uuid> {
        if let Some(run) = self.active.as_ref().filter(|r| !r.is_finished()) {
            return Err(EngineError::Busy(run.id));
        }
        if tree.state(root).is_none() {
            return Err(ActionError::UnknownAction(root).into());
        }

        tree.attach_event_sender(self.events.clone());
        let id = Uuid::new_v4();
        info!(run = %id, root = %root, "starting run");
        if !tree.start(root) {
            return Err(ActionError::AlreadyStarted(root).into());
        }

        self.active = Some(ActiveRun {
            id,
            tree,
            root,
            logged: false,
        });
        self.publish();
        Ok(id)
    }

    fn with_root(&mut self, f: impl FnOnce(&mut ActionTree, ActionId) -> bool) -> bool {
        let accepted = match self.active.as_mut() {
            Some(run) => f(&mut run.tree, run.root),
            None => false,
        };
        self.publish();
        accepted
    }

    /// Publish the root's status and log it once it has finished.
    fn publish(&mut self) {
        let Some(run) = self.active.as_mut() else {
            return;
        };
        let status = run.status();

        if run.is_finished() && !run.logged {
            run.logged = true;
            if let Some(record) = run.tree.completed_record(run.root) {
                info!(run = %run.id, state = %record.state, "run finished");
                self.log.log_completed_action(&record);
            }
        }
        self.status_tx.send_replace(status);
    }

    fn shutdown(&mut self) {
        if let Some(run) = self.active.as_mut().filter(|r| !r.is_finished()) {
            warn!(run = %run.id, "cancelling active run on shutdown");
            run.tree.cancel(run.root);
        }
        self.publish();
    }
}

/// Cloneable client for a spawned [`Supervisor`]
#[derive(Clone)]
pub struct SupervisorHandle {
    commands: mpsc::Sender<SupervisorCommand>,
    status: watch::Receiver<Option<RunStatus>>,
    events: broadcast::Sender<ActionEvent>,
    task: Arc<parking_lot::Mutex<Option<JoinHandle<()>>>>,
}

impl SupervisorHandle {
    async fn request<T>(
        &self,
        (command, response): (SupervisorCommand, oneshot::Receiver<T>),
    ) -> EngineResult<T> {
        self.commands
            .send(command)
            .await
            .map_err(|_| EngineError::SupervisorGone)?;
        response.await.map_err(|_| EngineError::SupervisorGone)
    }

    /// Start `root` of `tree`. Fails with [`EngineError::Busy`] while another run is active.
    pub async fn run(&self, tree: ActionTree, root: ActionId) -> EngineResult<Uuid> {
        self.request(SupervisorCommand::run(tree, root)).await?
    }

    /// Pause the current root. `Ok(false)` if there is none or it cannot pause.
    pub async fn pause(&self) -> EngineResult<bool> {
        self.request(SupervisorCommand::pause()).await
    }

    /// Resume the current root.
    pub async fn resume(&self) -> EngineResult<bool> {
        self.request(SupervisorCommand::resume()).await
    }

    /// Cancel the current root.
    pub async fn cancel(&self) -> EngineResult<bool> {
        self.request(SupervisorCommand::cancel()).await
    }

    /// Snapshot of the current (or last) run.
    pub async fn status(&self) -> EngineResult<Option<RunStatus>> {
        self.request(SupervisorCommand::status()).await
    }

    /// Every event of every tree run by this supervisor from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<ActionEvent> {
        self.events.subscribe()
    }

    /// Latest run status, updated after every change.
    pub fn watch_status(&self) -> watch::Receiver<Option<RunStatus>> {
        self.status.clone()
    }

    /// Start a run and wait until its root finishes.
    pub async fn run_to_completion(&self, tree: ActionTree, root: ActionId) -> EngineResult<RunStatus> {
        let run_id = self.run(tree, root).await?;
        self.wait_for(run_id).await
    }

    /// Wait until run `run_id` has finished.
    ///
    /// Fails with [`EngineError::UnknownRun`] once the supervisor reports a
    /// different run.
    pub async fn wait_for(&self, run_id: Uuid) -> EngineResult<RunStatus> {
        let mut status = self.watch_status();
        loop {
            let latest = status.borrow_and_update().clone();
            match latest {
                Some(latest) if latest.run_id != run_id => {
                    return Err(EngineError::UnknownRun(run_id));
                }
                Some(latest) if latest.is_finished() => return Ok(latest),
                Some(_) => {}
                None => return Err(EngineError::UnknownRun(run_id)),
            }
            status
                .changed()
                .await
                .map_err(|_| EngineError::SupervisorGone)?;
        }
    }

    /// Cancel any active run, stop the actor and wait for it to exit.
    pub async fn shutdown(&self) -> EngineResult<()> {
        self.request(SupervisorCommand::shutdown()).await?;
        let task = self.task.lock().take();
        if let Some(task) = task {
            let _ = task.await;
        }
        Ok(())
    }
}
