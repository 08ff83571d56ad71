use crossbeam_channel::Sender;

use super::task::TaskStatus;

/// Requests delivered to the worker that owns a task's process.
#[derive(Debug)]
pub enum ControlMessage {
    /// Stop the task; the worker answers with the final status.
    Terminate(Sender<TaskStatus>),
}

/// What the pipe readers hand to the collector.
#[derive(Debug, Clone, PartialEq)]
pub enum OutputEvent {
    Line(String),
    ReadError(String),
}
