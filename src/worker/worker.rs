use std::os::unix::process::ExitStatusExt;
use std::process::ExitStatus;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use crossbeam_channel::{never, select, Receiver, Sender};
use log::{debug, error, info, warn};

use crate::manager::registry::Registry;
use crate::models::config::Config;
use crate::models::error::ShellError;
use crate::models::message::{ControlMessage, OutputEvent};
use crate::models::task::{Outcome, TaskId, TaskStatus};
use crate::worker::collector::{Emitter, OutputCollector};
use crate::worker::launcher::{self, describe_exit_code, ProcessHandle};
use crate::worker::terminator::{escalate, reap_detached, Escalation, Stage, Terminator};

/// Shared collaborators every worker needs.
#[derive(Clone)]
pub struct WorkerContext {
    pub registry: Arc<Registry>,
    pub config: Arc<Config>,
    pub terminator: Arc<dyn Terminator>,
}

/// Everything a worker owns for one task.
pub struct Job {
    pub task_id: TaskId,
    pub command: String,
    pub timeout: Duration,
    pub max_errors: u32,
    /// Count silent read windows as errors (streamed runs only).
    pub count_stalls: bool,
    pub control: Receiver<ControlMessage>,
    pub emitter: Emitter,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Finished {
    pub status: TaskStatus,
    pub exit_code: Option<i32>,
    pub reason: Option<String>,
    pub output: Vec<String>,
}

/// Most output events folded into one registry write.
const OUTPUT_BATCH: usize = 256;

enum Verdict {
    Exited(ExitStatus),
    Stopped(Escalation),
    TimedOut(Escalation),
    Errored(Escalation, String),
}

enum Step {
    Output(OutputEvent),
    OutputClosed,
    Control(ControlMessage),
    ControlClosed,
    Idle,
}

/// Run `job` on a dedicated thread.
pub fn spawn_worker_thread(ctx: WorkerContext, job: Job) -> std::io::Result<()> {
    thread::Builder::new()
        .name(format!("task-{}", job.task_id))
        .spawn(move || {
            run_task(&ctx, job);
        })?;
    Ok(())
}

/// Drive one task from spawn to its terminal state on the current thread.
pub fn run_task(ctx: &WorkerContext, job: Job) -> Finished {
    info!("Starting task '{}'.", job.task_id);

    let mut handle = match launcher::spawn(&job.command, ctx.config.working_dir(), job.timeout) {
        Ok(handle) => handle,
        Err(e) => {
            error!("Failed to run command for '{}': {}", job.task_id, e);
            let outcome = Outcome {
                status: TaskStatus::Failed,
                exit_code: None,
                reason: Some(e.to_string()),
            };
            return settle(ctx, &job.task_id, outcome, vec![], vec![], vec![], &job.control);
        }
    };

    if let Err(e) = ctx.registry.mark_running(&job.task_id, handle.pid) {
        error!("Could not record start of '{}': {}", job.task_id, e);
        let escalation = stop(ctx, &mut handle);
        let outcome = Outcome {
            status: TaskStatus::Failed,
            exit_code: escalation.status.and_then(exit_indicator),
            reason: Some(e.to_string()),
        };
        release(handle);
        return settle(ctx, &job.task_id, outcome, vec![], vec![], vec![], &job.control);
    }

    let collector = OutputCollector::attach(&mut handle.child, ctx.config.read_timeout);
    supervise(ctx, job, handle, collector)
}

/// Watch a running task until it exits, times out, is stopped or trips the
/// error watchdog, then record the outcome.
fn supervise(ctx: &WorkerContext, job: Job, mut handle: ProcessHandle, mut collector: OutputCollector) -> Finished {
    let Job {
        task_id,
        timeout,
        max_errors,
        count_stalls,
        control,
        mut emitter,
        ..
    } = job;
    let mut control_rx = control.clone();
    let mut output = Vec::new();
    let mut pending = Vec::new();
    let mut waiters = Vec::new();
    let mut errors: u32 = 0;
    let deadline = handle.deadline();

    let verdict = loop {
        let now = Instant::now();
        if now >= deadline {
            warn!("Task '{}' exceeded its {:?} timeout", task_id, timeout);
            break Verdict::TimedOut(stop(ctx, &mut handle));
        }
        let wait = ctx.config.poll_interval.min(deadline - now);
        let output_rx = collector.receiver();

        let step = select! {
            recv(output_rx) -> event => match event {
                Ok(event) => Step::Output(event),
                Err(_) => Step::OutputClosed,
            },
            recv(control_rx) -> message => match message {
                Ok(message) => Step::Control(message),
                Err(_) => Step::ControlClosed,
            },
            default(wait) => Step::Idle,
        };

        match step {
            Step::Output(first) => {
                collector.note_activity();
                for event in std::iter::once(first).chain(output_rx.try_iter().take(OUTPUT_BATCH)) {
                    match event {
                        OutputEvent::Line(line) => {
                            errors = 0;
                            pending.push(line);
                        }
                        OutputEvent::ReadError(e) => {
                            errors += 1;
                            warn!("Read error on '{}' ({}/{}): {}", task_id, errors, max_errors, e);
                        }
                    }
                }
            }
            Step::OutputClosed => collector.mark_closed(),
            Step::Control(ControlMessage::Terminate(reply)) => {
                info!("Stop requested for task '{}'", task_id);
                waiters.push(reply);
                break Verdict::Stopped(stop(ctx, &mut handle));
            }
            Step::ControlClosed => control_rx = never(),
            Step::Idle => {
                if let Some(e) = collector.check_stall() {
                    if count_stalls {
                        errors += 1;
                        warn!("Task '{}' ({}/{}): {}", task_id, errors, max_errors, e);
                    } else {
                        debug!("Task '{}': {}", task_id, e);
                    }
                }
            }
        }

        flush(ctx, &task_id, &mut pending, &mut output, errors, &mut emitter);

        if errors > max_errors {
            let why = format!("{errors} consecutive read errors (limit {max_errors})");
            error!("Task '{}': {}", task_id, why);
            break Verdict::Errored(stop(ctx, &mut handle), why);
        }

        match handle.child.try_wait() {
            Ok(Some(status)) => break Verdict::Exited(status),
            Ok(None) => {}
            Err(e) => {
                errors += 1;
                warn!("Wait on '{}' failed ({}/{}): {}", task_id, errors, max_errors, e);
            }
        }
    };

    for event in collector.drain(ctx.config.drain_timeout) {
        if let OutputEvent::Line(line) = event {
            pending.push(line);
        }
    }
    flush(ctx, &task_id, &mut pending, &mut output, errors, &mut emitter);

    let outcome = classify(verdict, handle.timeout);
    release(handle);
    // Lines the lock kept back are recorded by `settle`; report them after.
    let unreported = pending.clone();
    let finished = settle(ctx, &task_id, outcome, pending, output, waiters, &control);
    for line in &unreported {
        emitter.line(line);
    }
    finished
}

fn stop(ctx: &WorkerContext, handle: &mut ProcessHandle) -> Escalation {
    let pgid = handle.pgid();
    escalate(
        &mut handle.child,
        pgid,
        ctx.terminator.as_ref(),
        ctx.config.grace_period,
        ctx.config.kill_wait,
    )
}

/// Hand a child that is still unreaped to a reaper thread.
fn release(handle: ProcessHandle) {
    let mut child = handle.child;
    if !matches!(child.try_wait(), Ok(Some(_))) {
        reap_detached(child);
    }
}

/// Write buffered lines through to the registry (and its store), then report
/// them to the progress sink. If the lock is busy the lines stay buffered and
/// unreported until a later turn.
fn flush(
    ctx: &WorkerContext,
    task_id: &str,
    pending: &mut Vec<String>,
    output: &mut Vec<String>,
    errors: u32,
    emitter: &mut Emitter,
) {
    if pending.is_empty() {
        return;
    }
    let batch = pending.clone();
    match ctx.registry.append_output(task_id, pending, errors) {
        Ok(()) => {
            for line in &batch {
                emitter.line(line);
            }
            output.extend(batch);
        }
        Err(e) => warn!("Deferring {} line(s) for '{}': {}", pending.len(), task_id, e),
    }
}

/// Exit code, or the negated signal number for signal deaths.
pub fn exit_indicator(status: ExitStatus) -> Option<i32> {
    status.code().or_else(|| status.signal().map(|signal| -signal))
}

fn classify(verdict: Verdict, timeout: Duration) -> Outcome {
    match verdict {
        Verdict::Exited(status) => match (status.code(), status.signal()) {
            (Some(0), _) => Outcome {
                status: TaskStatus::Completed,
                exit_code: Some(0),
                reason: None,
            },
            (Some(code), _) => Outcome {
                status: TaskStatus::Failed,
                exit_code: Some(code),
                reason: Some(
                    describe_exit_code(code)
                        .map(str::to_string)
                        .unwrap_or_else(|| format!("exited with code {code}")),
                ),
            },
            (None, signal) => {
                let signal = signal.unwrap_or_default();
                Outcome {
                    status: TaskStatus::Terminated,
                    exit_code: Some(-signal),
                    reason: Some(ShellError::SignalTermination(signal).to_string()),
                }
            }
        },
        Verdict::Stopped(escalation) => Outcome {
            status: TaskStatus::Terminated,
            exit_code: escalation.status.and_then(exit_indicator),
            reason: Some(match escalation.stage {
                Stage::Graceful => "terminated on request".to_string(),
                Stage::Forced => "terminated on request (killed after grace period)".to_string(),
            }),
        },
        Verdict::TimedOut(escalation) => Outcome {
            status: TaskStatus::Timeout,
            exit_code: escalation.status.and_then(exit_indicator),
            reason: Some(ShellError::ProcessTimeout(timeout.as_secs()).to_string()),
        },
        Verdict::Errored(escalation, why) => Outcome {
            status: TaskStatus::Failed,
            exit_code: escalation.status.and_then(exit_indicator),
            reason: Some(why),
        },
    }
}

/// Record the outcome, then answer every stop request, including late ones
/// still queued on the control channel.
fn settle(
    ctx: &WorkerContext,
    task_id: &str,
    outcome: Outcome,
    mut pending: Vec<String>,
    mut output: Vec<String>,
    waiters: Vec<Sender<TaskStatus>>,
    control: &Receiver<ControlMessage>,
) -> Finished {
    let fallback = outcome.clone();
    output.extend(pending.iter().cloned());
    let status = match ctx.registry.finish(task_id, outcome, &mut pending) {
        Ok(status) => status,
        Err(e) => {
            error!("Could not record result of '{}': {}", task_id, e);
            fallback.status
        }
    };
    for reply in waiters {
        let _ = reply.send(status);
    }
    for ControlMessage::Terminate(reply) in control.try_iter() {
        let _ = reply.send(status);
    }

    match ctx.registry.get(task_id) {
        Ok(Some(task)) => Finished {
            status: task.status,
            exit_code: task.exit_code,
            reason: task.reason,
            output: task.output_lines,
        },
        _ => Finished {
            status,
            exit_code: fallback.exit_code,
            reason: fallback.reason,
            output,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::task::{ExecMode, Task};
    use crate::worker::collector::Progress;
    use crate::worker::terminator::GroupSignaller;
    use crossbeam_channel::unbounded;
    use std::io;
    use std::sync::Mutex;
    use tempfile::TempDir;

    fn context(dir: &TempDir) -> WorkerContext {
        let mut config = Config::new(dir.path());
        config.grace_period = Duration::from_millis(500);
        config.kill_wait = Duration::from_secs(2);
        config.drain_timeout = Duration::from_millis(500);
        let registry = Arc::new(Registry::new(&config, None));
        WorkerContext {
            registry,
            config: Arc::new(config),
            terminator: Arc::new(GroupSignaller),
        }
    }

    fn job(ctx: &WorkerContext, id: &str, command: &str, timeout: Duration) -> (Job, Sender<ControlMessage>) {
        let (tx, rx) = unbounded();
        let task = Task::new(id.into(), command.into(), timeout.as_secs(), ExecMode::Sync);
        ctx.registry.insert(task, tx.clone()).unwrap();
        let job = Job {
            task_id: id.into(),
            command: command.into(),
            timeout,
            max_errors: 10,
            count_stalls: false,
            control: rx,
            emitter: Emitter::new(id.into(), None, 100),
        };
        (job, tx)
    }

    #[test]
    fn zero_exit_completes_with_output() {
        let dir = TempDir::new().unwrap();
        let ctx = context(&dir);
        let (job, _tx) = job(&ctx, "t", "echo one; echo two >&2", Duration::from_secs(10));
        let done = run_task(&ctx, job);
        assert_eq!(done.status, TaskStatus::Completed);
        assert_eq!(done.exit_code, Some(0));
        let mut lines = done.output.clone();
        lines.sort();
        assert_eq!(lines, vec!["one", "two"]);
        assert_eq!(ctx.registry.get("t").unwrap().unwrap().output_lines.len(), 2);
    }

    #[test]
    fn nonzero_exit_fails_with_code() {
        let dir = TempDir::new().unwrap();
        let ctx = context(&dir);
        let (job, _tx) = job(&ctx, "t", "exit 3", Duration::from_secs(10));
        let done = run_task(&ctx, job);
        assert_eq!(done.status, TaskStatus::Failed);
        assert_eq!(done.exit_code, Some(3));
    }

    #[test]
    fn missing_command_is_annotated() {
        let dir = TempDir::new().unwrap();
        let ctx = context(&dir);
        let (job, _tx) = job(&ctx, "t", "definitely-not-a-command-xyz", Duration::from_secs(10));
        let done = run_task(&ctx, job);
        assert_eq!(done.status, TaskStatus::Failed);
        assert_eq!(done.exit_code, Some(127));
        assert_eq!(done.reason.as_deref(), Some("command not found"));
    }

    #[test]
    fn self_inflicted_signal_is_terminated() {
        let dir = TempDir::new().unwrap();
        let ctx = context(&dir);
        let (job, _tx) = job(&ctx, "t", "kill -KILL $$", Duration::from_secs(10));
        let done = run_task(&ctx, job);
        assert_eq!(done.status, TaskStatus::Terminated);
        assert_eq!(done.exit_code, Some(-9));
    }

    #[test]
    fn timeout_wins_over_completion() {
        let dir = TempDir::new().unwrap();
        let ctx = context(&dir);
        let (job, _tx) = job(&ctx, "t", "sleep 5", Duration::from_secs(1));
        let started = Instant::now();
        let done = run_task(&ctx, job);
        assert_eq!(done.status, TaskStatus::Timeout);
        assert!(started.elapsed() < Duration::from_secs(4));
        assert!(started.elapsed() >= Duration::from_secs(1));
    }

    #[test]
    fn stop_request_is_answered_with_final_status() {
        let dir = TempDir::new().unwrap();
        let ctx = context(&dir);
        let (job, tx) = job(&ctx, "t", "sleep 30", Duration::from_secs(60));
        let (reply_tx, reply_rx) = unbounded();
        let (late_tx, late_rx) = unbounded();
        tx.send(ControlMessage::Terminate(reply_tx)).unwrap();
        tx.send(ControlMessage::Terminate(late_tx)).unwrap();
        let done = run_task(&ctx, job);
        assert_eq!(done.status, TaskStatus::Terminated);
        assert_eq!(reply_rx.recv().unwrap(), TaskStatus::Terminated);
        assert_eq!(late_rx.recv().unwrap(), TaskStatus::Terminated);
    }

    #[test]
    fn silent_stream_is_killed_after_too_many_stalls() {
        let dir = TempDir::new().unwrap();
        let mut ctx = context(&dir);
        let mut config = (*ctx.config).clone();
        config.read_timeout = Duration::from_millis(100);
        ctx.config = Arc::new(config);
        let (mut job, _tx) = job(&ctx, "t", "sleep 30", Duration::from_secs(60));
        job.count_stalls = true;
        job.max_errors = 2;
        let done = run_task(&ctx, job);
        assert_eq!(done.status, TaskStatus::Failed);
        assert!(done.reason.unwrap().contains("consecutive read errors"));
    }

    #[test]
    fn progress_follows_line_order() {
        let dir = TempDir::new().unwrap();
        let ctx = context(&dir);
        let (mut job, _tx) = job(&ctx, "t", "printf 'a\\nb\\nc\\n'", Duration::from_secs(10));
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink_seen = Arc::clone(&seen);
        let sink = move |p: &Progress<'_>| -> io::Result<()> {
            sink_seen.lock().unwrap().push((p.index, p.line.to_string()));
            Ok(())
        };
        job.emitter = Emitter::new("t".into(), Some(Box::new(sink)), 100);
        let done = run_task(&ctx, job);
        assert_eq!(done.status, TaskStatus::Completed);
        let seen = seen.lock().unwrap().clone();
        assert_eq!(seen, vec![(1, "a".to_string()), (2, "b".to_string()), (3, "c".to_string())]);
    }

    #[test]
    fn background_read_errors_past_the_limit_fail_the_task() {
        let dir = TempDir::new().unwrap();
        let ctx = context(&dir);
        let (mut job, _tx) = job(&ctx, "t", "sleep 30", Duration::from_secs(60));
        job.max_errors = ctx.config.max_errors_for(ExecMode::Background);

        let mut handle = launcher::spawn(&job.command, dir.path(), job.timeout).unwrap();
        ctx.registry.mark_running("t", handle.pid).unwrap();
        let (events, rx) = unbounded();
        for n in 0..=job.max_errors {
            events.send(OutputEvent::ReadError(format!("pipe hiccup {n}"))).unwrap();
        }
        let collector = OutputCollector::from_receiver(rx, ctx.config.read_timeout);
        handle.child.stdout.take();
        handle.child.stderr.take();

        let started = Instant::now();
        let done = supervise(&ctx, job, handle, collector);
        assert_eq!(done.status, TaskStatus::Failed);
        assert_eq!(done.exit_code, Some(-libc::SIGTERM));
        assert!(done.reason.unwrap().contains("6 consecutive read errors (limit 5)"));
        assert!(started.elapsed() < Duration::from_secs(5));
        drop(events);
    }

    #[test]
    fn a_line_resets_the_error_run() {
        let dir = TempDir::new().unwrap();
        let ctx = context(&dir);
        let (mut job, _tx) = job(&ctx, "t", "sleep 1", Duration::from_secs(10));
        job.max_errors = 2;

        let mut handle = launcher::spawn(&job.command, dir.path(), job.timeout).unwrap();
        ctx.registry.mark_running("t", handle.pid).unwrap();
        let (events, rx) = unbounded();
        for event in [
            OutputEvent::ReadError("x".into()),
            OutputEvent::ReadError("x".into()),
            OutputEvent::Line("fine".into()),
            OutputEvent::ReadError("x".into()),
            OutputEvent::ReadError("x".into()),
        ] {
            events.send(event).unwrap();
        }
        drop(events);
        let collector = OutputCollector::from_receiver(rx, ctx.config.read_timeout);
        handle.child.stdout.take();
        handle.child.stderr.take();

        let done = supervise(&ctx, job, handle, collector);
        assert_eq!(done.status, TaskStatus::Completed);
        assert_eq!(done.output, vec!["fine"]);
    }
}
