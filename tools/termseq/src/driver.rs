//! Single-task owner of one terminal's queue and playback engine.
//!
//! Requests, terminal events and timer deadlines are all handled on the task
//! running [`TerminalDriver::run_until`]; other tasks talk to it through a
//! cloneable [`DriverHandle`].

use crate::errors::SequencerError;
use crate::logging::append_run_log;
use crate::playback::{DirectoryMismatch, PlayStart, PlaybackEngine};
use crate::queue::{CommandQueue, QueueStatus};
use crate::runtime::Clock;
use crate::terminal::{EnvVars, TerminalEvent};
use crate::timer::TimerId;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};

#[derive(Debug)]
pub enum DriverRequest {
    Enqueue {
        command: String,
        display_name: String,
        env_vars: EnvVars,
        reply: oneshot::Sender<u64>,
    },
    StartQueue,
    StopQueue,
    ForceComplete {
        reply: oneshot::Sender<bool>,
    },
    QueueStatus {
        reply: oneshot::Sender<QueueStatus>,
    },
    Play {
        recording_id: String,
        reply: oneshot::Sender<Result<PlayStart, SequencerError>>,
    },
    Jump {
        mismatch: DirectoryMismatch,
        reply: oneshot::Sender<Result<(), SequencerError>>,
    },
    Pause,
    Resume,
    StopPlayback,
    Shutdown,
}

#[derive(Debug, Clone)]
pub struct DriverHandle {
    tx: mpsc::UnboundedSender<DriverRequest>,
}

fn driver_gone() -> SequencerError {
    SequencerError::Process("terminal driver is not running".to_string())
}

impl DriverHandle {
    fn send(&self, request: DriverRequest) -> Result<(), SequencerError> {
        self.tx.send(request).map_err(|_| driver_gone())
    }

    async fn ask<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<T>) -> DriverRequest,
    ) -> Result<T, SequencerError> {
        let (reply, rx) = oneshot::channel();
        self.send(build(reply))?;
        rx.await.map_err(|_| driver_gone())
    }

    pub async fn enqueue(
        &self,
        command: &str,
        display_name: &str,
        env_vars: EnvVars,
    ) -> Result<u64, SequencerError> {
        self.ask(|reply| DriverRequest::Enqueue {
            command: command.to_string(),
            display_name: display_name.to_string(),
            env_vars,
            reply,
        })
        .await
    }

    pub fn start_queue(&self) -> Result<(), SequencerError> {
        self.send(DriverRequest::StartQueue)
    }

    pub fn stop_queue(&self) -> Result<(), SequencerError> {
        self.send(DriverRequest::StopQueue)
    }

    pub async fn force_complete(&self) -> Result<bool, SequencerError> {
        self.ask(|reply| DriverRequest::ForceComplete { reply }).await
    }

    pub async fn queue_status(&self) -> Result<QueueStatus, SequencerError> {
        self.ask(|reply| DriverRequest::QueueStatus { reply }).await
    }

    pub async fn play(&self, recording_id: &str) -> Result<PlayStart, SequencerError> {
        self.ask(|reply| DriverRequest::Play {
            recording_id: recording_id.to_string(),
            reply,
        })
        .await?
    }

    pub async fn jump_to_directory(
        &self,
        mismatch: DirectoryMismatch,
    ) -> Result<(), SequencerError> {
        self.ask(|reply| DriverRequest::Jump { mismatch, reply })
            .await?
    }

    pub fn pause(&self) -> Result<(), SequencerError> {
        self.send(DriverRequest::Pause)
    }

    pub fn resume(&self) -> Result<(), SequencerError> {
        self.send(DriverRequest::Resume)
    }

    pub fn stop_playback(&self) -> Result<(), SequencerError> {
        self.send(DriverRequest::StopPlayback)
    }

    pub fn shutdown(&self) -> Result<(), SequencerError> {
        self.send(DriverRequest::Shutdown)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TimerOwner {
    Queue,
    Playback,
}

pub struct TerminalDriver {
    queue: CommandQueue,
    engine: PlaybackEngine,
    clock: Arc<dyn Clock>,
    events: mpsc::UnboundedReceiver<TerminalEvent>,
    requests: mpsc::UnboundedReceiver<DriverRequest>,
    events_open: bool,
    requests_open: bool,
    shutdown: bool,
}

impl TerminalDriver {
    pub fn new(
        queue: CommandQueue,
        engine: PlaybackEngine,
        clock: Arc<dyn Clock>,
        events: mpsc::UnboundedReceiver<TerminalEvent>,
    ) -> (Self, DriverHandle) {
        let (tx, requests) = mpsc::unbounded_channel();
        (
            Self {
                queue,
                engine,
                clock,
                events,
                requests,
                events_open: true,
                requests_open: true,
                shutdown: false,
            },
            DriverHandle { tx },
        )
    }

    pub fn queue(&self) -> &CommandQueue {
        &self.queue
    }

    pub fn queue_mut(&mut self) -> &mut CommandQueue {
        &mut self.queue
    }

    pub fn engine(&self) -> &PlaybackEngine {
        &self.engine
    }

    pub fn engine_mut(&mut self) -> &mut PlaybackEngine {
        &mut self.engine
    }

    pub fn is_shut_down(&self) -> bool {
        self.shutdown
    }

    /// Serve until shutdown or until every input is closed.
    pub async fn run(&mut self) {
        self.run_until(|_| false).await;
    }

    /// Serve until `done` returns `true`, a shutdown request arrives, or there
    /// is nothing left that could wake the loop.
    pub async fn run_until<F>(&mut self, mut done: F)
    where
        F: FnMut(&TerminalDriver) -> bool,
    {
        append_run_log("debug", "driver.started", json!({}));
        while !self.shutdown && !done(self) {
            self.queue.set_held(self.engine.is_active());
            let deadline = self.nearest_deadline();
            let sleep_for = deadline
                .map(|(_, id)| {
                    id.deadline
                        .duration_since(self.clock.now())
                        .unwrap_or(Duration::ZERO)
                })
                .unwrap_or(Duration::ZERO);

            tokio::select! {
                request = self.requests.recv(), if self.requests_open => match request {
                    Some(request) => self.handle(request),
                    None => self.requests_open = false,
                },
                event = self.events.recv(), if self.events_open => match event {
                    Some(event) => self.route(event),
                    None => {
                        append_run_log("warn", "driver.terminal_closed", json!({}));
                        self.events_open = false;
                    }
                },
                _ = tokio::time::sleep(sleep_for), if deadline.is_some() => {
                    if let Some((owner, id)) = deadline {
                        self.fire(owner, id);
                    }
                },
                else => break,
            }
        }
        append_run_log("debug", "driver.stopped", json!({ "shutdown": self.shutdown }));
    }

    fn nearest_deadline(&self) -> Option<(TimerOwner, TimerId)> {
        let queue = self.queue.next_deadline().map(|id| (TimerOwner::Queue, id));
        let playback = self
            .engine
            .next_deadline()
            .map(|id| (TimerOwner::Playback, id));
        match (queue, playback) {
            (Some(q), Some(p)) => Some(if p.1.deadline < q.1.deadline { p } else { q }),
            (q, p) => q.or(p),
        }
    }

    fn fire(&mut self, owner: TimerOwner, id: TimerId) {
        match owner {
            TimerOwner::Queue => {
                self.queue.on_timer(id);
            }
            TimerOwner::Playback => {
                self.engine.on_timer(id);
            }
        }
    }

    /// Playback may only take the terminal once the queue has nothing in flight.
    fn terminal_busy(&self) -> Option<SequencerError> {
        let current = self.queue.status().current_item?;
        append_run_log(
            "warn",
            "driver.playback_rejected",
            json!({ "item_id": current.id, "command": current.command }),
        );
        Some(SequencerError::Terminal(format!(
            "queued command `{}` is still running",
            current.command
        )))
    }

    fn route(&mut self, event: TerminalEvent) {
        let owner = if self.engine.is_active() {
            self.engine.on_event(event);
            "playback"
        } else {
            self.queue.on_event(event);
            "queue"
        };
        append_run_log(
            "debug",
            "driver.event_routed",
            json!({ "event": event.as_str(), "owner": owner }),
        );
    }

    fn handle(&mut self, request: DriverRequest) {
        match request {
            DriverRequest::Enqueue {
                command,
                display_name,
                env_vars,
                reply,
            } => {
                let id = self.queue.enqueue(&command, &display_name, env_vars);
                let _ = reply.send(id);
            }
            DriverRequest::StartQueue => self.queue.start(),
            DriverRequest::StopQueue => self.queue.stop(),
            DriverRequest::ForceComplete { reply } => {
                let _ = reply.send(self.queue.force_complete_current());
            }
            DriverRequest::QueueStatus { reply } => {
                let _ = reply.send(self.queue.status());
            }
            DriverRequest::Play {
                recording_id,
                reply,
            } => {
                let result = match self.terminal_busy() {
                    Some(err) => Err(err),
                    None => self.engine.play(&recording_id),
                };
                self.queue.set_held(self.engine.is_active());
                let _ = reply.send(result);
            }
            DriverRequest::Jump { mismatch, reply } => {
                let result = match self.terminal_busy() {
                    Some(err) => Err(err),
                    None => self.engine.jump_to_directory(&mismatch),
                };
                self.queue.set_held(self.engine.is_active());
                let _ = reply.send(result);
            }
            DriverRequest::Pause => {
                self.engine.pause();
            }
            DriverRequest::Resume => {
                self.engine.resume();
            }
            DriverRequest::StopPlayback => {
                self.engine.stop();
            }
            DriverRequest::Shutdown => {
                self.engine.stop();
                self.queue.stop();
                self.shutdown = true;
            }
        }
    }
}
