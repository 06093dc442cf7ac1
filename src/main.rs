//! persishtent CLI — persistent shell sessions.
//!
//! `persishtent <name>` attaches when the session exists and starts it
//! otherwise; with no arguments it attaches the single live session,
//! starts an auto-named one when none exist, or offers a picker.

use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};
use persishtent::client::{ensure_not_nested, guard, AttachOptions};
use persishtent::{commands, daemon, Config, Registry};

#[derive(Parser)]
#[command(name = "persishtent", version)]
#[command(about = "Persistent shell sessions: detach and reattach at will")]
#[command(args_conflicts_with_subcommands = true)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Session name: attach if it exists, otherwise start it.
    name: Option<String>,
}

#[derive(Subcommand)]
enum Commands {
    /// Start a new session
    #[command(alias = "s")]
    Start {
        /// Start in detached mode (do not attach)
        #[arg(short = 'd', long)]
        detach: bool,
        /// Custom socket path
        #[arg(short = 's', long = "socket")]
        socket: Option<PathBuf>,
        /// Custom log path
        #[arg(short = 'l', long = "log")]
        log: Option<PathBuf>,
        /// Command to run instead of the login shell
        #[arg(short = 'c', long = "command")]
        command: Option<String>,
        /// Attach in read-only mode
        #[arg(long = "read-only")]
        read_only: bool,
        /// Session name (auto-numbered when omitted)
        name: Option<String>,
    },
    /// Attach to a running session
    #[command(alias = "a")]
    Attach {
        /// Do not replay recorded output
        #[arg(short = 'n', long = "no-replay")]
        no_replay: bool,
        /// Replay only the last N lines
        #[arg(short = 't', long = "tail", default_value_t = 0)]
        tail: usize,
        /// Attach in read-only mode
        #[arg(short = 'r', long = "read-only")]
        read_only: bool,
        /// Custom socket path
        #[arg(short = 's', long = "socket")]
        socket: Option<PathBuf>,
        /// Session name (picker when omitted and several are live)
        name: Option<String>,
    },
    /// List active sessions
    #[command(alias = "ls")]
    List,
    /// Send SIGKILL to a session's shell
    #[command(alias = "k")]
    Kill {
        /// Kill all sessions
        #[arg(short = 'a', long)]
        all: bool,
        /// Custom socket path
        #[arg(short = 's', long = "socket")]
        socket: Option<PathBuf>,
        /// Session name
        name: Option<String>,
    },
    /// Rename a session and its artifacts
    #[command(alias = "r")]
    Rename { old: String, new: String },
    /// Remove stale sessions and orphaned files
    Clean,
    /// Print the shell integration snippet (bash|zsh)
    Init { shell: String },
    /// Internal: run a session daemon in the foreground
    #[command(hide = true)]
    Daemon {
        /// Custom socket path
        #[arg(short = 's', long = "socket")]
        socket: Option<PathBuf>,
        /// Custom log path
        #[arg(short = 'l', long = "log")]
        log: Option<PathBuf>,
        /// Command to run instead of the login shell
        #[arg(short = 'c', long = "command")]
        command: Option<String>,
        name: String,
    },
}

/// Log to a file so the raw-mode terminal never sees log lines.
fn init_logging() {
    let log_path = std::env::var("PERSISHTENT_LOG_FILE")
        .map(PathBuf::from)
        .unwrap_or_else(|_| std::env::temp_dir().join("persishtent.log"));

    let builder_env = env_logger::Env::default().default_filter_or("info");
    match std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&log_path)
    {
        Ok(file) => env_logger::Builder::from_env(builder_env)
            .target(env_logger::Target::Pipe(Box::new(file)))
            .format_timestamp_secs()
            .init(),
        Err(_) => env_logger::Builder::from_env(env_logger::Env::default())
            .filter_level(log::LevelFilter::Error)
            .init(),
    }
}

fn main() -> Result<()> {
    init_logging();

    // If we panic while the terminal is raw, put it back before the
    // panic message prints.
    let default_hook = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |panic_info| {
        log::error!("PANIC: {panic_info:?}");
        guard::emit_restore_sequence();
        let _ = crossterm::terminal::disable_raw_mode();
        default_hook(panic_info);
    }));

    let cli = Cli::parse();
    let config = Config::load();
    let registry = Registry::open()?;

    // Prune stale sessions on every invocation, except where the result
    // would be misleading (clean reports its own count) or wasted work
    // (the daemon is about to create fresh artifacts).
    if !matches!(cli.command, Some(Commands::Clean) | Some(Commands::Daemon { .. })) {
        if let Err(e) = registry.clean() {
            log::warn!("stale-session pruning failed: {e}");
        }
    }

    match cli.command {
        None => match cli.name {
            Some(name) => {
                ensure_not_nested()?;
                persishtent::registry::validate_name(&name)?;
                start_or_attach(&registry, &config, &name)?;
            }
            None => {
                ensure_not_nested()?;
                let sessions = registry.list()?;
                match sessions.len() {
                    0 => {
                        let name = registry.next_autoname()?;
                        commands::start_session(
                            &registry, &config, &name, false, None, None, None, false,
                        )?;
                    }
                    1 => {
                        attach_existing(&registry, &config, &sessions[0].name)?;
                    }
                    _ => {
                        if let Some(name) = commands::select_session(&sessions) {
                            attach_existing(&registry, &config, &name)?;
                        }
                    }
                }
            }
        },
        Some(Commands::Start {
            detach,
            socket,
            log,
            command,
            read_only,
            name,
        }) => {
            ensure_not_nested()?;
            let name = match name {
                Some(name) => {
                    persishtent::registry::validate_name(&name)?;
                    name
                }
                None => registry.next_autoname()?,
            };
            commands::start_session(
                &registry, &config, &name, detach, socket, log, command, read_only,
            )?;
        }
        Some(Commands::Attach {
            no_replay,
            tail,
            read_only,
            socket,
            name,
        }) => {
            ensure_not_nested()?;
            let name = match name {
                Some(name) => name,
                None => {
                    let sessions = registry.list()?;
                    match sessions.len() {
                        0 => {
                            println!("No active sessions.");
                            return Ok(());
                        }
                        1 => sessions[0].name.clone(),
                        _ => match commands::select_session(&sessions) {
                            Some(name) => name,
                            None => return Ok(()),
                        },
                    }
                }
            };
            let opts = AttachOptions {
                socket_path: socket,
                replay: !no_replay,
                tail,
                read_only,
            };
            commands::attach_session(&registry, &config, &name, &opts)?;
        }
        Some(Commands::List) => commands::list_sessions(&registry)?,
        Some(Commands::Kill { all, socket, name }) => {
            if all {
                commands::kill_all(&registry)?;
            } else {
                match name {
                    Some(name) => commands::kill_session(&registry, &name, socket),
                    None => println!("Usage: persishtent kill [-a] [-s socket] <name>"),
                }
            }
        }
        Some(Commands::Rename { old, new }) => commands::rename_session(&registry, &old, &new),
        Some(Commands::Clean) => commands::clean_sessions(&registry)?,
        Some(Commands::Init { shell }) => commands::print_init_script(&shell),
        Some(Commands::Daemon {
            socket,
            log,
            command,
            name,
        }) => {
            persishtent::registry::validate_name(&name)?;
            daemon::run(
                &registry,
                &config,
                &name,
                daemon::DaemonOptions {
                    socket_path: socket,
                    log_path: log,
                    command,
                },
            )?;
        }
    }

    Ok(())
}

/// The bare `persishtent <name>` shortcut: attach when the session
/// exists, start it otherwise.
fn start_or_attach(registry: &Registry, config: &Config, name: &str) -> Result<()> {
    if registry.socket_path(name).exists() {
        attach_existing(registry, config, name)
    } else {
        commands::start_session(registry, config, name, false, None, None, None, false)
    }
}

fn attach_existing(registry: &Registry, config: &Config, name: &str) -> Result<()> {
    let opts = AttachOptions {
        socket_path: None,
        replay: true,
        tail: 0,
        read_only: false,
    };
    commands::attach_session(registry, config, name, &opts)
}
