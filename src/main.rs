//! shfrp: re-run shell commands when the parameters they use change.
//!
//! This is the entry point of the application. It parses command-line
//! arguments, loads configuration and dispatches to the subcommands: `run`
//! drives the recomputation engine, `set` and `reset` publish updates for
//! running sessions, `params` and `bus` inspect the shared state.

use std::collections::BTreeSet;
use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::builder::styling::{AnsiColor, Effects, Style};
use clap::builder::Styles;
use clap::{Args, Parser, Subcommand};
use tokio::sync::mpsc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};
use uuid::Uuid;

use shfrp::config::{self, Config};
use shfrp::events::{Event, Message, ProcessSignal};
use shfrp::output::Display;
use shfrp::runner::DEFAULT_SHELL;
use shfrp::state::StateDir;
use shfrp::{feed, EchoExecutor, Engine, Executor, ParameterStore, ShellExecutor};

const DELIVERY_CAPACITY: usize = 64;
const EVENT_CAPACITY: usize = 256;

/// Command-line interface definition.
#[derive(Debug, Parser)]
#[command(
    name = "shfrp",
    version,
    about = "Re-run shell commands whenever the parameters they use change",
    styles = help_styles(),
    disable_help_subcommand = true
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
    /// Include debug output (to stderr).
    #[arg(long, global = true)]
    debug: bool,
    /// Directory to store parameters and the event log in.
    #[arg(long, short = 'd', global = true)]
    data_dir: Option<PathBuf>,
    /// Path to shfrp.toml (default: <data dir>/shfrp.toml).
    #[arg(long, global = true)]
    config: Option<PathBuf>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run this shell command whenever something changes. Use {name} for the value of name.
    Run(RunArgs),
    /// Set a parameter's value.
    Set { key: String, value: String },
    /// Cause commands that use this parameter to re-run.
    Reset { parameter: String },
    /// Print parameters.
    Params {
        /// Do not colorize set/unset.
        #[arg(long)]
        no_color: bool,
    },
    /// Listen to messages on the event bus.
    Bus,
}

#[derive(Debug, Clone, Args)]
struct RunArgs {
    /// Echo the command rather than run it.
    #[arg(long)]
    echo: bool,
    /// Kill a running command if an update supersedes it.
    #[arg(long)]
    kill: bool,
    /// Also re-run when this parameter changes.
    #[arg(long, short = 'l')]
    listen: Vec<String>,
    /// Write output to this file (overwritten on every change).
    #[arg(long, short = 'o')]
    output: Option<PathBuf>,
    /// Shell used to run the command.
    #[arg(long)]
    shell: Option<String>,
    /// Command template; words are joined with spaces.
    #[arg(required = true, trailing_var_arg = true, allow_hyphen_values = true)]
    expr: Vec<String>,
}

/// Runtime configuration derived from CLI arguments and the config file.
#[derive(Debug, Clone, PartialEq, Eq)]
struct RunSettings {
    shell: String,
    kill: bool,
    echo: bool,
}

impl RunSettings {
    fn resolve(args: &RunArgs, config: &Config) -> Self {
        let shell = args
            .shell
            .clone()
            .or_else(|| config.shell.clone())
            .unwrap_or_else(|| DEFAULT_SHELL.to_string());
        Self {
            shell,
            kill: args.kill || config.kill.unwrap_or(false),
            echo: args.echo || config.echo.unwrap_or(false),
        }
    }
}

/// Initialize tracing on stderr; stdout belongs to command output.
fn init_tracing(debug: bool, configured: Option<&str>) {
    let directive = std::env::var("RUST_LOG")
        .ok()
        .or_else(|| debug.then(|| "shfrp=debug".to_string()))
        .or_else(|| configured.map(str::to_string))
        .unwrap_or_else(|| "shfrp=warn".to_string());
    tracing_subscriber::registry()
        .with(EnvFilter::new(directive))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let root = match &cli.data_dir {
        Some(dir) => dir.clone(),
        None => StateDir::default_root().context("cannot determine a data directory")?,
    };
    let state = StateDir::new(root);
    let config_path = cli.config.clone().unwrap_or_else(|| state.config_path());
    let config = config::load_optional(&config_path)?;
    init_tracing(cli.debug, config.log.as_deref());
    tracing::debug!(pid = std::process::id(), data_dir = %state.root().display(), "started");
    state.ensure()?;

    match cli.command {
        Commands::Run(args) => run(args, &config, &state).await,
        Commands::Set { key, value } => {
            state.set_parameter(&key, &value)?;
            state.publish(&Message::set(&key, &value))
        }
        Commands::Reset { parameter } => state.publish(&Message::reset(&parameter)),
        Commands::Params { no_color } => print_params(&state, !no_color),
        Commands::Bus => follow_bus(&state).await,
    }
}

async fn run(args: RunArgs, config: &Config, state: &StateDir) -> Result<()> {
    let settings = RunSettings::resolve(&args, config);
    let (event_tx, event_rx) = mpsc::channel(EVENT_CAPACITY);
    // Follow first, then load: an update published in between is seen twice
    // at worst, and setting the same value again is a no-op.
    feed::spawn_feed(state.events_path(), event_tx.clone());
    spawn_signal_listener(event_tx);

    let store = ParameterStore::new();
    for (name, value) in state.load()?.parameters {
        store.set(&name, value);
    }

    if settings.echo {
        watch_loop(EchoExecutor, store, &args, state, event_rx).await
    } else {
        let executor = ShellExecutor::new(settings.shell, settings.kill);
        watch_loop(executor, store, &args, state, event_rx).await
    }
}

async fn watch_loop<E: Executor>(
    executor: E,
    store: ParameterStore,
    args: &RunArgs,
    state: &StateDir,
    mut event_rx: mpsc::Receiver<Event>,
) -> Result<()> {
    let expr = args.expr.join(" ");
    let (mut engine, mut deliveries) = Engine::new(store, executor, DELIVERY_CAPACITY);
    let id = engine
        .watch(&expr, &args.listen)
        .with_context(|| format!("cannot run {:?}", expr))?;

    let client = Uuid::new_v4().to_string();
    let listened = engine.dependencies(id);
    state.add_listener(&client, &listened)?;
    let mut display = Display::new(args.output.clone());

    let result = loop {
        tokio::select! {
            Some(delivery) = deliveries.recv() => {
                if let Err(err) = display.show(&delivery) {
                    break Err(err);
                }
            }
            Some(event) = event_rx.recv() => match event {
                Event::Message(message) => message.apply(engine.store()),
                Event::FeedFailed { error } => {
                    break Err(anyhow::anyhow!("lost the event log: {}", error));
                }
                Event::Shutdown { signal } => {
                    tracing::info!("received {}, stopping", signal.label());
                    break Ok(());
                }
            },
            else => break Ok(()),
        }
    };

    engine.shutdown();
    if let Err(err) = state.remove_listener(&client, &listened) {
        tracing::warn!("failed to unregister listener: {:#}", err);
    }
    result
}

fn print_params(state: &StateDir, color: bool) -> Result<()> {
    let data = state.load()?;
    let names: BTreeSet<&String> = data
        .listened
        .iter()
        .filter(|(_, listeners)| !listeners.is_empty())
        .map(|(name, _)| name)
        .chain(data.parameters.keys())
        .collect();
    for name in names {
        let is_set = data.parameters.contains_key(name);
        println!("{} {}", name, format_flag(is_set, color));
    }
    Ok(())
}

fn format_flag(is_set: bool, color: bool) -> String {
    let (label, code) = if is_set { ("set", "32") } else { ("unset", "31") };
    if color {
        format!("\u{1b}[{}m{}\u{1b}[0m", code, label)
    } else {
        label.to_string()
    }
}

async fn follow_bus(state: &StateDir) -> Result<()> {
    let (event_tx, mut event_rx) = mpsc::channel(EVENT_CAPACITY);
    feed::spawn_feed(state.events_path(), event_tx.clone());
    spawn_signal_listener(event_tx);
    while let Some(event) = event_rx.recv().await {
        match event {
            Event::Message(message) => println!("{}", serde_json::to_string(&message)?),
            Event::FeedFailed { error } => bail!("lost the event log: {}", error),
            Event::Shutdown { .. } => break,
        }
    }
    Ok(())
}

/// Turns the first Ctrl-C or SIGTERM into a graceful shutdown. A second
/// signal while shutting down exits at once.
fn spawn_signal_listener(tx: mpsc::Sender<Event>) {
    tokio::spawn(async move {
        let Some(first) = next_signal().await else {
            return;
        };
        if tx.send(Event::Shutdown { signal: first }).await.is_err() {
            return;
        }
        if let Some(second) = next_signal().await {
            eprintln!("shfrp: {} again, exiting without cleanup", second.label());
            std::process::exit(second.exit_code());
        }
    });
}

async fn next_signal() -> Option<ProcessSignal> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate()).ok()?;
        tokio::select! {
            result = tokio::signal::ctrl_c() => result.ok().map(|_| ProcessSignal::SigInt),
            _ = sigterm.recv() => Some(ProcessSignal::SigTerm),
        }
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c()
            .await
            .ok()
            .map(|_| ProcessSignal::SigInt)
    }
}

fn help_styles() -> Styles {
    Styles::styled()
        .header(
            Style::new()
                .fg_color(Some(AnsiColor::Cyan.into()))
                .effects(Effects::BOLD),
        )
        .usage(
            Style::new()
                .fg_color(Some(AnsiColor::Green.into()))
                .effects(Effects::BOLD),
        )
        .literal(Style::new().fg_color(Some(AnsiColor::Yellow.into())))
        .placeholder(Style::new().fg_color(Some(AnsiColor::Magenta.into())))
}
