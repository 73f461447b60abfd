//! Interactive attach loop.
//!
//! Console lines go to stdout; session notices and errors go to stderr with
//! a `[labterm]` prefix. Input lines are sent to the device unless they
//! start with `:`, which marks a local command. `::` escapes a literal
//! leading colon.

use std::io::Write;

use tokio::io::{AsyncBufRead, AsyncBufReadExt};
use tokio::sync::mpsc::UnboundedReceiver;
use tracing::debug;

use labterm_session::event::{ConsoleEvent, ConsoleEventKind};
use labterm_session::manager::ConsoleManager;
use labterm_session::types::SendOutcome;

use crate::CliError;

pub const HELP: &str = "\
local commands:
  :close           close the session, keep typing to queue commands
  :switch <node>   open a console on another node in the same lab
  :queue           list commands waiting for a session
  :clear           drop every queued command
  :status          show session, link, and polling state
  :probe           check the link now
  :quit            close the session and exit
  ::text           send \":text\" to the device";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MetaCommand {
    Close,
    Switch { node_id: String },
    Queue,
    Clear,
    Status,
    Probe,
    Quit,
    Help,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InputLine {
    Blank,
    Command(String),
    Meta(MetaCommand),
}

/// Classify one line typed at the attach prompt.
pub fn parse_input(line: &str) -> Result<InputLine, CliError> {
    let line = line.trim_end_matches(['\r', '\n']);
    if line.trim().is_empty() {
        return Ok(InputLine::Blank);
    }
    if let Some(escaped) = line.strip_prefix("::") {
        return Ok(InputLine::Command(format!(":{escaped}")));
    }
    let Some(meta) = line.trim_start().strip_prefix(':') else {
        return Ok(InputLine::Command(line.to_string()));
    };

    let mut parts = meta.split_whitespace();
    let name = parts.next().unwrap_or_default();
    let args: Vec<&str> = parts.collect();
    let no_args = |cmd: MetaCommand| {
        if args.is_empty() {
            Ok(InputLine::Meta(cmd))
        } else {
            Err(CliError::Usage(format!(":{name} takes no arguments")))
        }
    };

    match name {
        "close" => no_args(MetaCommand::Close),
        "queue" => no_args(MetaCommand::Queue),
        "clear" => no_args(MetaCommand::Clear),
        "status" => no_args(MetaCommand::Status),
        "probe" => no_args(MetaCommand::Probe),
        "quit" | "q" => no_args(MetaCommand::Quit),
        "help" | "h" => no_args(MetaCommand::Help),
        "switch" => match args.as_slice() {
            [node] => Ok(InputLine::Meta(MetaCommand::Switch {
                node_id: (*node).to_string(),
            })),
            _ => Err(CliError::Usage("usage: :switch <node>".into())),
        },
        other => Err(CliError::Usage(format!(
            "unknown local command :{other} (try :help)"
        ))),
    }
}

/// Where the attach loop writes.
pub struct Output<'a> {
    pub stdout: &'a mut dyn Write,
    pub stderr: &'a mut dyn Write,
}

impl Output<'_> {
    fn notice(&mut self, message: impl std::fmt::Display) -> std::io::Result<()> {
        writeln!(self.stderr, "[labterm] {message}")
    }

    fn event(&mut self, event: &ConsoleEvent) -> std::io::Result<()> {
        match &event.kind {
            ConsoleEventKind::LogAppended { lines } => {
                for line in lines {
                    writeln!(self.stdout, "{line}")?;
                }
                self.stdout.flush()
            }
            // The echo line already shows it.
            ConsoleEventKind::CommandSent { .. } => Ok(()),
            ConsoleEventKind::SessionOpened => {
                let node = event.node_id.as_deref().unwrap_or("-");
                let session = event.session_id.as_deref().unwrap_or("-");
                self.notice(format_args!("session opened on {node} ({session})"))
            }
            kind => self.notice(kind),
        }
    }
}

/// Open a console on `node_id` and relay `input` into it until EOF or
/// `:quit`. The session is closed on the way out.
pub async fn run<R>(
    manager: &ConsoleManager,
    lab_id: &str,
    node_id: &str,
    console_type: Option<&str>,
    input: R,
    events: &mut UnboundedReceiver<ConsoleEvent>,
    out: &mut Output<'_>,
) -> Result<(), CliError>
where
    R: AsyncBufRead + Unpin,
{
    let opened = manager.open(lab_id, node_id, console_type).await;
    drain(events, out)?;
    opened?;

    let mut lines = input.lines();
    loop {
        tokio::select! {
            biased;
            Some(event) = events.recv() => out.event(&event)?,
            line = lines.next_line() => {
                let Some(line) = line? else {
                    debug!("input closed");
                    break;
                };
                if !handle_line(manager, lab_id, console_type, &line, out).await? {
                    break;
                }
            }
        }
    }

    if manager.session().is_some() {
        manager.close("detached").await;
    }
    Ok(drain(events, out)?)
}

/// Returns false once the user asked to leave.
async fn handle_line(
    manager: &ConsoleManager,
    lab_id: &str,
    console_type: Option<&str>,
    line: &str,
    out: &mut Output<'_>,
) -> Result<bool, CliError> {
    let parsed = match parse_input(line) {
        Ok(parsed) => parsed,
        Err(err) => {
            out.notice(err)?;
            return Ok(true);
        }
    };

    match parsed {
        InputLine::Blank => {}
        InputLine::Command(command) => match manager.send(&command).await {
            Ok(SendOutcome::Accepted) | Ok(SendOutcome::Queued { .. }) => {}
            Err(err) => out.notice(format_args!("send failed: {err}"))?,
        },
        InputLine::Meta(MetaCommand::Quit) => return Ok(false),
        InputLine::Meta(MetaCommand::Help) => writeln!(out.stderr, "{HELP}")?,
        InputLine::Meta(MetaCommand::Close) => {
            if manager.close("closed by user").await.is_none() {
                out.notice("no session is open")?;
            }
        }
        InputLine::Meta(MetaCommand::Switch { node_id }) => {
            if let Err(err) = manager.open(lab_id, &node_id, console_type).await {
                out.notice(format_args!("switch to {node_id} failed: {err}"))?;
            }
        }
        InputLine::Meta(MetaCommand::Queue) => {
            let pending = manager.pending_commands();
            if pending.is_empty() {
                out.notice("queue is empty")?;
            }
            for (index, command) in pending.iter().enumerate() {
                out.notice(format_args!("{}. {}", index + 1, command.text))?;
            }
        }
        InputLine::Meta(MetaCommand::Clear) => {
            let dropped = manager.clear_queue();
            out.notice(format_args!("dropped {dropped} queued commands"))?;
        }
        InputLine::Meta(MetaCommand::Status) => status(manager, out)?,
        InputLine::Meta(MetaCommand::Probe) => {
            let reading = manager.probe_now().await;
            out.notice(format_args!("probe: {reading}"))?;
        }
    }
    Ok(true)
}

fn status(manager: &ConsoleManager, out: &mut Output<'_>) -> std::io::Result<()> {
    let node = manager
        .session()
        .map(|session| session.node_id)
        .unwrap_or_else(|| "-".into());
    out.notice(format_args!(
        "state={} node={} queued={}",
        manager.state(),
        node,
        manager.pending_commands().len()
    ))?;
    if let Some(sample) = manager.quality() {
        out.notice(format_args!(
            "link={} latency={}ms",
            sample.tier,
            sample.latency.as_millis()
        ))?;
    }
    if let Some(polling) = manager.polling() {
        out.notice(format_args!(
            "polling active={} paused={} interval={}ms",
            polling.active,
            polling.paused,
            polling.current_interval.as_millis()
        ))?;
    }
    Ok(())
}

fn drain(
    events: &mut UnboundedReceiver<ConsoleEvent>,
    out: &mut Output<'_>,
) -> std::io::Result<()> {
    while let Ok(event) = events.try_recv() {
        out.event(&event)?;
    }
    Ok(())
}
