use std::io::{self, BufRead, Write};

use crate::manager::task_manager::{Submission, SubmitOptions, TaskManager, TerminateResult};
use crate::models::error::ShellError;
use crate::models::task::{ExecMode, ExecutionResult, StatusReport};
use crate::worker::collector::{Progress, ProgressSink};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    Run {
        mode: ExecMode,
        timeout: Option<u64>,
        command: String,
    },
    Status(String),
    Output {
        task_id: String,
        max_lines: Option<usize>,
    },
    Terminate(String),
    List,
    Version,
    Exit,
}

/// Split off the first whitespace-delimited word, keeping the rest verbatim.
fn next_word(input: &str) -> (&str, &str) {
    let input = input.trim_start();
    match input.find(char::is_whitespace) {
        Some(at) => (&input[..at], input[at..].trim_start()),
        None => (input, ""),
    }
}

fn task_id(rest: &str) -> Result<String, String> {
    match next_word(rest) {
        ("", _) => Err("Task ID must be specified.".to_string()),
        (id, _) => Ok(id.to_string()),
    }
}

fn parse_run(mut rest: &str) -> Result<Request, String> {
    let mut stream = false;
    let mut background = false;
    let mut timeout = None;
    loop {
        let (word, tail) = next_word(rest);
        match word {
            "--stream" | "-s" => stream = true,
            "--background" | "-b" => background = true,
            "--timeout" | "-t" => {
                let (value, tail) = next_word(tail);
                let secs = value
                    .parse::<u64>()
                    .map_err(|_| format!("Invalid timeout '{}'.", value))?;
                timeout = Some(secs);
                rest = tail;
                continue;
            }
            _ => break,
        }
        rest = tail;
    }
    let command = rest.trim();
    if command.is_empty() {
        return Err("Command to execute must be specified.".to_string());
    }
    let mode = match (stream, background) {
        (true, true) => return Err("Choose one of --stream or --background.".to_string()),
        (true, false) => ExecMode::Stream,
        (false, true) => ExecMode::Background,
        (false, false) => ExecMode::Sync,
    };
    Ok(Request::Run {
        mode,
        timeout,
        command: command.to_string(),
    })
}

/// `Ok(None)` for a blank line.
pub fn parse(line: &str) -> Result<Option<Request>, String> {
    let (command, rest) = next_word(line);
    let request = match command {
        "" => return Ok(None),
        "run" => parse_run(rest)?,
        "status" => Request::Status(task_id(rest)?),
        "output" => {
            let task_id = task_id(rest)?;
            let (_, tail) = next_word(rest);
            let max_lines = match next_word(tail).0 {
                "" => None,
                n => Some(n.parse::<usize>().map_err(|_| format!("Invalid line count '{}'.", n))?),
            };
            Request::Output { task_id, max_lines }
        }
        "terminate" | "stop" | "kill" => Request::Terminate(task_id(rest)?),
        "list" => Request::List,
        "version" => Request::Version,
        "exit" | "quit" => Request::Exit,
        other => return Err(format!("Unknown command: {}. Please try again.", other)),
    };
    Ok(Some(request))
}

fn print_progress(progress: &Progress<'_>) -> io::Result<()> {
    let mut stdout = io::stdout().lock();
    writeln!(stdout, "progress {} {}", progress.correlation_id, progress.message())?;
    stdout.flush()
}

fn write_error<W: Write>(out: &mut W, e: &ShellError) -> io::Result<()> {
    if e.is_recoverable() {
        writeln!(out, "error: {} (try again)", e)
    } else {
        writeln!(out, "error: {}", e)
    }
}

fn write_result<W: Write>(out: &mut W, result: &ExecutionResult) -> io::Result<()> {
    if let Some(warning) = &result.warning {
        writeln!(out, "{}", warning)?;
    }
    for line in &result.output {
        writeln!(out, "{}", line)?;
    }
    let exit = result.exit_code.map_or("-".to_string(), |code| code.to_string());
    write!(out, "task {} {} exit={}", result.task_id, result.status, exit)?;
    if let Some(reason) = &result.reason {
        write!(out, " ({})", reason)?;
    }
    writeln!(out)
}

fn write_report<W: Write>(out: &mut W, report: &StatusReport) -> io::Result<()> {
    let exit = report.exit_code.map_or("-".to_string(), |code| code.to_string());
    let elapsed = report
        .elapsed_secs
        .map_or("-".to_string(), |secs| format!("{:.1}s", secs));
    write!(out, "Task {} status: {} exit={} elapsed={}", report.task_id, report.status, exit, elapsed)?;
    if let Some(start) = report.start_time {
        write!(out, " started={}", start.to_rfc3339())?;
    }
    if let Some(end) = report.end_time {
        write!(out, " ended={}", end.to_rfc3339())?;
    }
    if let Some(reason) = &report.reason {
        write!(out, " ({})", reason)?;
    }
    writeln!(out)
}

/// Execute one request. Returns `false` when the loop should stop.
pub fn handle<W: Write>(manager: &TaskManager, request: Request, out: &mut W) -> io::Result<bool> {
    match request {
        Request::Run { mode, timeout, command } => {
            let options = SubmitOptions {
                timeout: timeout.map(std::time::Duration::from_secs),
                correlation_id: None,
                progress: (mode == ExecMode::Stream).then(|| Box::new(print_progress) as Box<dyn ProgressSink>),
            };
            match manager.submit(&command, mode, options) {
                Ok(Submission::Finished(result)) => write_result(out, &result)?,
                Ok(Submission::Started { task_id, warning }) => {
                    if let Some(warning) = warning {
                        writeln!(out, "{}", warning)?;
                    }
                    writeln!(out, "Started background task with ID: {}", task_id)?;
                    writeln!(out, "Use `status {}` to check the status", task_id)?;
                }
                Err(e) => write_error(out, &e)?,
            }
        }
        Request::Status(task_id) => match manager.status(&task_id) {
            Ok(report) => write_report(out, &report)?,
            Err(e) => write_error(out, &e)?,
        },
        Request::Output { task_id, max_lines } => match manager.output(&task_id, max_lines) {
            Ok(lines) => {
                for line in lines {
                    writeln!(out, "{}", line)?;
                }
            }
            Err(e) => write_error(out, &e)?,
        },
        Request::Terminate(task_id) => match manager.terminate(&task_id) {
            Ok(TerminateResult::Stopped(status)) => writeln!(out, "Task {} {}", task_id, status)?,
            Ok(TerminateResult::AlreadyTerminal(status)) => {
                writeln!(out, "Task {} already {}", task_id, status)?
            }
            Ok(TerminateResult::Requested(status)) => {
                writeln!(out, "Stop requested for task {} (still {})", task_id, status)?
            }
            Err(e) => write_error(out, &e)?,
        },
        Request::List => match manager.list() {
            Ok(tasks) if tasks.is_empty() => writeln!(out, "No tasks")?,
            Ok(tasks) => {
                writeln!(out, "{:<10} {:<11} {:>9} {:>7}  {}", "ID", "Status", "Elapsed", "PID", "Command")?;
                writeln!(out, "{}", "-".repeat(60))?;
                for task in tasks {
                    let elapsed = task
                        .elapsed_secs
                        .map_or("-".to_string(), |secs| format!("{:.1}s", secs));
                    let pid = task.pid.map_or("-".to_string(), |pid| pid.to_string());
                    writeln!(
                        out,
                        "{:<10} {:<11} {:>9} {:>7}  {}",
                        task.task_id, task.status, elapsed, pid, task.command
                    )?;
                }
            }
            Err(e) => write_error(out, &e)?,
        },
        Request::Version => writeln!(
            out,
            "{} {} (sandbox root: {})",
            env!("CARGO_PKG_NAME"),
            env!("CARGO_PKG_VERSION"),
            manager.config().safe_root.display()
        )?,
        Request::Exit => {
            writeln!(out, "Exiting the program...")?;
            return Ok(false);
        }
    }
    Ok(true)
}

/// Read requests line by line until `exit` or end of input.
pub fn serve<R: BufRead, W: Write>(manager: &TaskManager, input: R, out: &mut W) -> io::Result<()> {
    for line in input.lines() {
        let line = line?;
        let keep_going = match parse(&line) {
            Ok(Some(request)) => handle(manager, request, out)?,
            Ok(None) => true,
            Err(message) => {
                writeln!(out, "{}", message)?;
                true
            }
        };
        out.flush()?;
        if !keep_going {
            break;
        }
    }
    Ok(())
}

pub fn run_cli(manager: &TaskManager) -> io::Result<()> {
    println!("Safe shell started. Enter a command or 'exit' to quit.");
    let stdin = io::stdin();
    serve(manager, stdin.lock(), &mut io::stdout())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::config::Config;
    use tempfile::TempDir;

    #[test]
    fn run_flags_are_parsed_and_command_kept_verbatim() {
        let request = parse("run --stream -t 5 echo  'a  b' | wc -c").unwrap().unwrap();
        assert_eq!(
            request,
            Request::Run {
                mode: ExecMode::Stream,
                timeout: Some(5),
                command: "echo  'a  b' | wc -c".to_string(),
            }
        );
        assert_eq!(
            parse("run ls").unwrap().unwrap(),
            Request::Run {
                mode: ExecMode::Sync,
                timeout: None,
                command: "ls".to_string(),
            }
        );
    }

    #[test]
    fn bad_input_is_reported_not_panicked() {
        assert!(parse("run").is_err());
        assert!(parse("run --timeout soon ls").is_err());
        assert!(parse("run -s -b ls").is_err());
        assert!(parse("status").is_err());
        assert!(parse("output abc many").is_err());
        assert!(parse("frobnicate").is_err());
        assert_eq!(parse("   ").unwrap(), None);
    }

    #[test]
    fn output_takes_optional_line_count() {
        assert_eq!(
            parse("output abc 3").unwrap().unwrap(),
            Request::Output {
                task_id: "abc".to_string(),
                max_lines: Some(3),
            }
        );
        assert_eq!(
            parse("output abc").unwrap().unwrap(),
            Request::Output {
                task_id: "abc".to_string(),
                max_lines: None,
            }
        );
    }

    #[test]
    fn session_runs_until_exit() {
        let dir = TempDir::new().unwrap();
        let manager = TaskManager::open(Config::new(dir.path())).unwrap();
        let input = "run echo hello\nstatus missing\nversion\nexit\nrun echo never\n";
        let mut out = Vec::new();
        serve(&manager, input.as_bytes(), &mut out).unwrap();
        let text = String::from_utf8(out).unwrap();

        assert!(text.contains("hello\n"));
        assert!(text.contains("completed exit=0"));
        assert!(text.contains("error: Task 'missing' not found"));
        assert!(text.contains(env!("CARGO_PKG_VERSION")));
        assert!(text.ends_with("Exiting the program...\n"));
        assert!(!text.contains("never"));
    }
}
