//! Asynchronous driver for a [`ScanSession`].
//!
//! [`ScanController::spawn`] starts an actor task that owns the session, the
//! platform subscription and the timeout. Everything that changes the
//! session (user commands, platform events, the deadline) is funnelled
//! through that one task, so transitions never interleave. Observers get
//! whole [`SessionSnapshot`]s through a `watch` channel.

use crate::filter::FilterCriteria;
use crate::scanner::{PlatformEvent, Scanner};
use crate::session::{ScanSession, SessionSnapshot};
use log::{debug, info, warn};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time;

const COMMAND_CHANNEL_BUFFER_SIZE: usize = 16;

/// Errors returned by [`ScanHandle`] operations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ControlError {
    #[error("scan controller has stopped")]
    Closed,
}

type Reply = oneshot::Sender<SessionSnapshot>;

/// A user operation on the session.
#[derive(Debug)]
enum Operation {
    Start {
        criteria: FilterCriteria,
        timeout: Option<Duration>,
    },
    Stop,
    Reload,
    UpdateCriteria(FilterCriteria),
    Retry,
}

#[derive(Debug)]
enum Command {
    Apply(Operation, Reply),
    Shutdown(oneshot::Sender<()>),
}

/// The actor behind a [`ScanHandle`].
pub struct ScanController {
    scanner: Arc<dyn Scanner>,
    session: ScanSession,
    /// Live platform subscription, only while the session is scanning
    events: Option<mpsc::Receiver<PlatformEvent>>,
    /// Session generation `events` belongs to
    subscribed: Option<u64>,
    state: watch::Sender<SessionSnapshot>,
}

/// The session clock. Reads tokio's clock so paused test time applies.
fn now() -> std::time::Instant {
    time::Instant::now().into_std()
}

async fn next_event(events: &mut Option<mpsc::Receiver<PlatformEvent>>) -> Option<PlatformEvent> {
    match events {
        Some(events) => events.recv().await,
        None => std::future::pending().await,
    }
}

async fn wait_until(deadline: Option<std::time::Instant>) {
    match deadline {
        Some(deadline) => time::sleep_until(time::Instant::from_std(deadline)).await,
        None => std::future::pending().await,
    }
}

impl ScanController {
    /// Spawn the controller on the current runtime.
    pub fn spawn(scanner: Arc<dyn Scanner>) -> ScanHandle {
        let (commands_tx, commands_rx) = mpsc::channel(COMMAND_CHANNEL_BUFFER_SIZE);
        let (state_tx, state_rx) = watch::channel(SessionSnapshot::default());

        let controller = ScanController {
            scanner,
            session: ScanSession::new(),
            events: None,
            subscribed: None,
            state: state_tx,
        };
        let task = tokio::spawn(controller.run(commands_rx));

        ScanHandle {
            commands: commands_tx,
            state: state_rx,
            task,
        }
    }

    async fn run(mut self, mut commands: mpsc::Receiver<Command>) {
        let shutdown = loop {
            let mut reply = None;

            tokio::select! {
                command = commands.recv() => match command {
                    Some(Command::Apply(operation, sender)) => {
                        self.apply(operation);
                        reply = Some(sender);
                    }
                    Some(Command::Shutdown(done)) => break Some(done),
                    None => break None,
                },
                event = next_event(&mut self.events) => self.on_event(event),
                _ = wait_until(self.session.deadline()) => {
                    self.session.time_out();
                }
            }

            self.sync().await;
            if let Some(reply) = reply {
                let _ = reply.send(self.session.snapshot());
            }
        };

        self.session.stop();
        self.events = None;
        self.publish();
        debug!("scan controller stopped");
        if let Some(reply) = shutdown {
            let _ = reply.send(());
        }
    }

    fn apply(&mut self, operation: Operation) {
        let now = now();
        match operation {
            Operation::Start { criteria, timeout } => {
                self.session.start(criteria, timeout, now);
            }
            Operation::Stop => {
                self.session.stop();
            }
            Operation::Reload => {
                self.session.reload(now);
            }
            Operation::UpdateCriteria(criteria) => {
                self.session.update_criteria(criteria);
            }
            Operation::Retry => {
                self.session.retry(now);
            }
        }
    }

    fn on_event(&mut self, event: Option<PlatformEvent>) {
        match event {
            Some(PlatformEvent::Sighting(sighting)) => {
                self.session.ingest(sighting.into(), now());
            }
            Some(PlatformEvent::Failed(cause)) => {
                self.session.fail(cause);
            }
            None => {
                info!("platform scan ended");
                self.events = None;
                self.session.stop();
            }
        }
    }

    /// Bring the platform subscription in line with the session, then
    /// publish the result.
    async fn sync(&mut self) {
        let generation = self.session.generation();
        if self.session.is_scanning() && self.subscribed != Some(generation) {
            // Cancel the previous scan before starting the next one.
            self.events = None;
            match self.scanner.start_scan().await {
                Ok(events) => {
                    self.events = Some(events);
                    self.subscribed = Some(generation);
                }
                Err(err) => {
                    warn!("could not start platform scan: {err}");
                    self.session.fail(err.cause());
                }
            }
        }

        if !self.session.is_scanning() && self.events.take().is_some() {
            debug!("platform scan cancelled");
        }
        self.publish();
    }

    fn publish(&self) {
        let snapshot = self.session.snapshot();
        self.state.send_if_modified(|current| {
            if *current == snapshot {
                return false;
            }
            *current = snapshot;
            true
        });
    }
}

/// Handle to a running [`ScanController`].
///
/// Operations resolve once the controller has applied them, with the
/// resulting snapshot. Dropping the handle stops the controller and any
/// platform scan it runs.
#[derive(Debug)]
pub struct ScanHandle {
    commands: mpsc::Sender<Command>,
    state: watch::Receiver<SessionSnapshot>,
    task: JoinHandle<()>,
}

impl ScanHandle {
    async fn request(&self, operation: Operation) -> Result<SessionSnapshot, ControlError> {
        let (reply, response) = oneshot::channel();
        self.commands
            .send(Command::Apply(operation, reply))
            .await
            .map_err(|_| ControlError::Closed)?;
        response.await.map_err(|_| ControlError::Closed)
    }

    /// Start scanning with `criteria`, stopping after `timeout` if given.
    pub async fn start(
        &self,
        criteria: FilterCriteria,
        timeout: Option<Duration>,
    ) -> Result<SessionSnapshot, ControlError> {
        self.request(Operation::Start { criteria, timeout }).await
    }

    pub async fn stop(&self) -> Result<SessionSnapshot, ControlError> {
        self.request(Operation::Stop).await
    }

    /// Discard everything seen and scan again.
    pub async fn reload(&self) -> Result<SessionSnapshot, ControlError> {
        self.request(Operation::Reload).await
    }

    pub async fn update_criteria(
        &self,
        criteria: FilterCriteria,
    ) -> Result<SessionSnapshot, ControlError> {
        self.request(Operation::UpdateCriteria(criteria)).await
    }

    /// Scan again after an error.
    pub async fn retry(&self) -> Result<SessionSnapshot, ControlError> {
        self.request(Operation::Retry).await
    }

    /// Receiver of every published snapshot.
    pub fn subscribe(&self) -> watch::Receiver<SessionSnapshot> {
        self.state.clone()
    }

    /// The most recently published snapshot.
    pub fn snapshot(&self) -> SessionSnapshot {
        self.state.borrow().clone()
    }

    /// Stop the controller and wait until its platform scan is cancelled.
    pub async fn shutdown(self) {
        let (reply, done) = oneshot::channel();
        if self.commands.send(Command::Shutdown(reply)).await.is_ok() {
            let _ = done.await;
        }
    }
}

impl Drop for ScanHandle {
    fn drop(&mut self) {
        self.task.abort();
    }
}
