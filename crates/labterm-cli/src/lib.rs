//! `labterm`: attach to lab device consoles from a terminal.

pub mod attach;
pub mod consoles;
pub mod logging;

use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;

use clap::{ArgAction, Parser, Subcommand};
use tokio::io::AsyncBufRead;
use tracing::debug;

use labterm_session::backend::ConsoleBackend;
use labterm_session::config::{ConfigError, ConsoleConfig};
use labterm_session::error::ConsoleError;
use labterm_session::event::{
    ChannelEventSink, ConsoleEventSink, FanoutEventSink, TracingEventSink,
};
use labterm_session::manager::ConsoleManager;
use labterm_session::rest::RestBackend;

use crate::logging::LogFormat;

#[derive(Debug, thiserror::Error)]
pub enum CliError {
    #[error("{0}")]
    Usage(String),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Console(#[from] ConsoleError),
    #[error("failed to initialize logging: {0}")]
    Logging(String),
    #[error("failed to render output: {0}")]
    Output(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Parser)]
#[command(name = "labterm", version, about = "Interactive lab device consoles")]
pub struct Cli {
    /// Config file (defaults to $LABTERM_CONFIG, then ~/.config/labterm/config.yaml).
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Lab portal API base URL.
    #[arg(long, global = true)]
    pub base_url: Option<String>,

    #[arg(long, global = true, value_enum)]
    pub log_format: Option<LogFormat>,

    /// Raise log verbosity; repeat for more.
    #[arg(short, long, global = true, action = ArgAction::Count)]
    pub verbose: u8,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// List the consoles a node exposes.
    Consoles {
        lab: String,
        node: String,
        #[arg(long)]
        json: bool,
    },
    /// Open a console session and relay stdin to it.
    Attach {
        lab: String,
        node: String,
        /// Console type to request, e.g. serial or vnc.
        #[arg(long = "type")]
        console_type: Option<String>,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
}

/// Apply command-line overrides on top of a loaded config and re-validate.
pub fn apply_cli_overrides(cli: &Cli, mut cfg: ConsoleConfig) -> Result<ConsoleConfig, CliError> {
    if let Some(url) = cli.base_url.as_deref().map(str::trim).filter(|u| !u.is_empty()) {
        cfg.backend.base_url = url.to_string();
    }
    if let Some(format) = cli.log_format {
        cfg.logging.format = match format {
            LogFormat::Console => "console".into(),
            LogFormat::Json => "json".into(),
        };
    }
    cfg.validate()?;
    Ok(cfg)
}

pub fn run_from_env() -> i32 {
    let mut stdout = std::io::stdout();
    let mut stderr = std::io::stderr();

    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(err) => {
            let _ = err.print();
            return err.exit_code();
        }
    };

    let prepared = ConsoleConfig::load(cli.config.as_deref())
        .map_err(CliError::from)
        .and_then(|cfg| apply_cli_overrides(&cli, cfg))
        .and_then(|cfg| {
            let format = cfg.logging.format.parse::<LogFormat>()?;
            let level = logging::effective_level(&cfg.logging.level, cli.verbose);
            logging::init_logging(level, format)?;
            let backend = RestBackend::new(&cfg.backend)?;
            Ok((cfg, backend))
        });
    let (cfg, backend) = match prepared {
        Ok(prepared) => prepared,
        Err(err) => {
            let _ = writeln!(stderr, "error: {err}");
            return 1;
        }
    };

    let runtime = match build_runtime() {
        Ok(runtime) => runtime,
        Err(err) => {
            let _ = writeln!(stderr, "error: {err}");
            return 1;
        }
    };
    runtime.block_on(async {
        let stdin = tokio::io::BufReader::new(tokio::io::stdin());
        execute(cli, cfg, Arc::new(backend), stdin, &mut stdout, &mut stderr).await
    })
}

/// Run the CLI against `backend` with `stdin` as the attach input. Config
/// comes from `--config` or the defaults; the environment is not read.
pub fn run_for_test(
    args: &[&str],
    backend: Arc<dyn ConsoleBackend>,
    stdin: &str,
) -> CommandOutput {
    let mut stdout = Vec::new();
    let mut stderr = Vec::new();
    let exit_code = run_with_backend(args, backend, stdin.as_bytes(), &mut stdout, &mut stderr);
    CommandOutput {
        stdout: String::from_utf8_lossy(&stdout).into_owned(),
        stderr: String::from_utf8_lossy(&stderr).into_owned(),
        exit_code,
    }
}

pub fn run_with_backend(
    args: &[&str],
    backend: Arc<dyn ConsoleBackend>,
    stdin: &[u8],
    stdout: &mut dyn Write,
    stderr: &mut dyn Write,
) -> i32 {
    let argv = std::iter::once("labterm").chain(args.iter().copied());
    let cli = match Cli::try_parse_from(argv) {
        Ok(cli) => cli,
        Err(err) => {
            let _ = write!(stderr, "{}", err.render());
            return err.exit_code();
        }
    };

    let base = match cli.config.as_deref() {
        Some(path) => ConsoleConfig::from_file(path).map_err(CliError::from),
        None => Ok(ConsoleConfig::default()),
    };
    let cfg = match base.and_then(|cfg| apply_cli_overrides(&cli, cfg)) {
        Ok(cfg) => cfg,
        Err(err) => {
            let _ = writeln!(stderr, "error: {err}");
            return 1;
        }
    };

    let runtime = match build_runtime() {
        Ok(runtime) => runtime,
        Err(err) => {
            let _ = writeln!(stderr, "error: {err}");
            return 1;
        }
    };
    runtime.block_on(execute(cli, cfg, backend, stdin, stdout, stderr))
}

fn build_runtime() -> std::io::Result<tokio::runtime::Runtime> {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
}

async fn execute<R>(
    cli: Cli,
    cfg: ConsoleConfig,
    backend: Arc<dyn ConsoleBackend>,
    input: R,
    stdout: &mut dyn Write,
    stderr: &mut dyn Write,
) -> i32
where
    R: AsyncBufRead + Unpin,
{
    let (channel, mut events) = ChannelEventSink::new();
    let sinks: Vec<Arc<dyn ConsoleEventSink>> = vec![Arc::new(TracingEventSink), Arc::new(channel)];
    let manager = ConsoleManager::new(backend, cfg, Arc::new(FanoutEventSink::new(sinks)));

    let result = match &cli.command {
        Command::Consoles { lab, node, json } => match manager.list_consoles(lab, node).await {
            Ok(found) => consoles::render(&found, *json, stdout),
            Err(err) => Err(err.into()),
        },
        Command::Attach {
            lab,
            node,
            console_type,
        } => {
            debug!(lab, node, "attaching");
            let mut out = attach::Output {
                stdout: &mut *stdout,
                stderr: &mut *stderr,
            };
            attach::run(
                &manager,
                lab,
                node,
                console_type.as_deref(),
                input,
                &mut events,
                &mut out,
            )
            .await
        }
    };

    match result {
        Ok(()) => 0,
        Err(err) => {
            let _ = writeln!(stderr, "error: {err}");
            1
        }
    }
}
