use crate::logging::append_run_log;
use crate::runtime::Clock;
use crate::terminal::{EnvVars, Terminal, TerminalEvent};
use crate::timer::{TimerId, Watchdog};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

pub const DEFAULT_COMMAND_TIMEOUT: Duration = Duration::from_millis(30_000);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueItemStatus {
    Pending,
    Running,
    Completed,
    CompletedTimeout,
    CompletedForced,
    DispatchFailed,
}

impl QueueItemStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::CompletedTimeout => "completed_timeout",
            Self::CompletedForced => "completed_forced",
            Self::DispatchFailed => "dispatch_failed",
        }
    }

    pub fn is_finished(self) -> bool {
        !matches!(self, Self::Pending | Self::Running)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct QueueItem {
    pub id: u64,
    pub command: String,
    pub display_name: String,
    pub env_vars: EnvVars,
    pub status: QueueItemStatus,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct QueueStatus {
    pub is_running: bool,
    /// Pending items plus the running one.
    pub queue_size: usize,
    pub pending_size: usize,
    pub current_item: Option<QueueItem>,
    pub waiting_for_completion: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueueEvent {
    Changed(QueueStatus),
    Finished(QueueItem),
}

/// FIFO of commands for one terminal. Dispatches the head item whenever the
/// queue is running and nothing is in flight; an in-flight item ends by
/// completion, watchdog timeout or a forced skip.
pub struct CommandQueue {
    terminal: Arc<dyn Terminal>,
    clock: Arc<dyn Clock>,
    pending: VecDeque<QueueItem>,
    current: Option<QueueItem>,
    history: Vec<QueueItem>,
    is_running: bool,
    held: bool,
    waiting_for_completion: bool,
    command_timeout: Duration,
    watchdog: Watchdog,
    next_item_id: u64,
    observers: Vec<mpsc::UnboundedSender<QueueEvent>>,
}

impl CommandQueue {
    pub fn new(terminal: Arc<dyn Terminal>, clock: Arc<dyn Clock>) -> Self {
        Self {
            terminal,
            clock,
            pending: VecDeque::new(),
            current: None,
            history: Vec::new(),
            is_running: false,
            held: false,
            waiting_for_completion: false,
            command_timeout: DEFAULT_COMMAND_TIMEOUT,
            watchdog: Watchdog::default(),
            next_item_id: 1,
            observers: Vec::new(),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.command_timeout = timeout;
        self
    }

    /// Watchdog duration for items dispatched from now on. Zero disables it.
    pub fn set_timeout(&mut self, timeout: Duration) {
        self.command_timeout = timeout;
    }

    /// Withhold dispatch while something else owns the terminal. Items keep
    /// queueing; releasing the hold resumes processing.
    pub fn set_held(&mut self, held: bool) {
        if self.held == held {
            return;
        }
        self.held = held;
        append_run_log(
            "debug",
            "queue.hold_changed",
            json!({ "held": held, "pending": self.pending.len() }),
        );
        if !held {
            self.process_next();
        }
    }

    pub fn is_held(&self) -> bool {
        self.held
    }

    pub fn subscribe(&mut self) -> mpsc::UnboundedReceiver<QueueEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.observers.push(tx);
        rx
    }

    pub fn enqueue(&mut self, command: &str, display_name: &str, env_vars: EnvVars) -> u64 {
        let id = self.next_item_id;
        self.next_item_id += 1;
        self.pending.push_back(QueueItem {
            id,
            command: command.to_string(),
            display_name: display_name.to_string(),
            env_vars,
            status: QueueItemStatus::Pending,
        });
        append_run_log(
            "debug",
            "queue.item.enqueued",
            json!({ "item_id": id, "name": display_name, "pending": self.pending.len() }),
        );
        self.notify_changed();

        if self.is_running && self.current.is_none() && !self.waiting_for_completion {
            self.process_next();
        }
        id
    }

    pub fn start(&mut self) {
        self.is_running = true;
        append_run_log("info", "queue.started", json!({ "pending": self.pending.len() }));
        if self.waiting_for_completion && !self.watchdog.is_armed() {
            self.arm_watchdog();
        }
        self.notify_changed();
        if !self.pending.is_empty() && self.current.is_none() && !self.waiting_for_completion {
            self.process_next();
        }
    }

    /// Stop dispatching. A command already handed to the terminal keeps running.
    pub fn stop(&mut self) {
        self.is_running = false;
        self.watchdog.disarm();
        append_run_log("info", "queue.stopped", json!({ "pending": self.pending.len() }));
        self.notify_changed();
    }

    pub fn clear(&mut self) {
        self.pending.clear();
        self.current = None;
        self.history.clear();
        self.is_running = false;
        self.waiting_for_completion = false;
        self.watchdog.disarm();
        append_run_log("info", "queue.cleared", json!({}));
        self.notify_changed();
    }

    pub fn process_next(&mut self) {
        while self.is_running && !self.held && !self.waiting_for_completion {
            let Some(mut item) = self.pending.pop_front() else {
                return;
            };
            item.status = QueueItemStatus::Running;

            match self.terminal.execute(&item.command, &item.env_vars) {
                Ok(()) => {
                    append_run_log(
                        "info",
                        "queue.item.dispatched",
                        json!({
                            "item_id": item.id,
                            "name": item.display_name,
                            "command": item.command,
                        }),
                    );
                    self.current = Some(item);
                    self.waiting_for_completion = true;
                    self.arm_watchdog();
                    self.notify_changed();
                    return;
                }
                Err(err) => {
                    append_run_log(
                        "error",
                        "queue.item.dispatch_failed",
                        json!({
                            "item_id": item.id,
                            "command": item.command,
                            "error": err.to_string(),
                        }),
                    );
                    item.status = QueueItemStatus::DispatchFailed;
                    self.record_finished(item);
                    self.notify_changed();
                }
            }
        }
    }

    /// Feed a terminal event. Returns `true` if it finished the running item.
    pub fn on_event(&mut self, event: TerminalEvent) -> bool {
        match event {
            TerminalEvent::Completed { exit_code } => {
                if let Some(item) = &self.current {
                    append_run_log(
                        "debug",
                        "queue.item.exit_code",
                        json!({ "item_id": item.id, "exit_code": exit_code }),
                    );
                }
                self.complete_current(QueueItemStatus::Completed)
            }
            TerminalEvent::PromptReady => false,
        }
    }

    /// Skip the running item without waiting for the terminal. Returns `false`
    /// and changes nothing when no item is running.
    pub fn force_complete_current(&mut self) -> bool {
        self.complete_current(QueueItemStatus::CompletedForced)
    }

    pub fn next_deadline(&self) -> Option<TimerId> {
        self.watchdog.armed()
    }

    /// Fire the watchdog identified by `id`. Stale ids are ignored.
    pub fn on_timer(&mut self, id: TimerId) -> bool {
        if !self.watchdog.take_if_current(id) {
            return false;
        }
        if let Some(item) = &self.current {
            append_run_log(
                "warn",
                "queue.item.timeout",
                json!({
                    "item_id": item.id,
                    "timeout_ms": self.command_timeout.as_millis() as u64,
                }),
            );
        }
        self.complete_current(QueueItemStatus::CompletedTimeout)
    }

    /// Fire the watchdog if the clock says it is due.
    pub fn tick(&mut self) -> bool {
        match self.watchdog.due(self.clock.now()) {
            Some(id) => self.on_timer(id),
            None => false,
        }
    }

    pub fn edit(&mut self, index: usize, new_command: &str) -> bool {
        let Some(item) = self.pending.get_mut(index) else {
            return false;
        };
        item.command = new_command.to_string();
        self.notify_changed();
        true
    }

    pub fn remove(&mut self, index: usize) -> bool {
        if self.pending.remove(index).is_none() {
            return false;
        }
        self.notify_changed();
        true
    }

    pub fn move_item(&mut self, from_index: usize, to_index: usize) -> bool {
        let len = self.pending.len();
        if from_index >= len || to_index >= len {
            return false;
        }
        if let Some(item) = self.pending.remove(from_index) {
            self.pending.insert(to_index, item);
        }
        self.notify_changed();
        true
    }

    pub fn status(&self) -> QueueStatus {
        QueueStatus {
            is_running: self.is_running,
            queue_size: self.pending.len() + usize::from(self.current.is_some()),
            pending_size: self.pending.len(),
            current_item: self.current.clone(),
            waiting_for_completion: self.waiting_for_completion,
        }
    }

    /// Running item first, then pending items in dispatch order.
    pub fn items(&self) -> Vec<QueueItem> {
        self.current
            .iter()
            .chain(self.pending.iter())
            .cloned()
            .collect()
    }

    /// Items that reached a terminal status, oldest first.
    pub fn history(&self) -> &[QueueItem] {
        &self.history
    }

    pub fn is_idle(&self) -> bool {
        self.current.is_none() && !self.waiting_for_completion
    }

    fn arm_watchdog(&mut self) {
        if self.command_timeout.is_zero() {
            return;
        }
        self.watchdog.arm(self.clock.now(), self.command_timeout);
    }

    fn complete_current(&mut self, status: QueueItemStatus) -> bool {
        if !self.waiting_for_completion {
            return false;
        }
        let Some(mut item) = self.current.take() else {
            return false;
        };
        self.watchdog.disarm();
        self.waiting_for_completion = false;
        item.status = status;
        append_run_log(
            "info",
            "queue.item.finished",
            json!({ "item_id": item.id, "status": status.as_str() }),
        );
        self.record_finished(item);
        self.notify_changed();

        if self.is_running && !self.pending.is_empty() {
            self.process_next();
        }
        true
    }

    fn record_finished(&mut self, item: QueueItem) {
        self.emit(QueueEvent::Finished(item.clone()));
        self.history.push(item);
    }

    fn notify_changed(&mut self) {
        let status = self.status();
        self.emit(QueueEvent::Changed(status));
    }

    fn emit(&mut self, event: QueueEvent) {
        self.observers.retain(|tx| tx.send(event.clone()).is_ok());
    }
}
