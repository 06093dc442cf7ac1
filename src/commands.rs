//! User-facing command fronts: session startup, attachment banners, the
//! listing/kill/rename/clean surfaces, the selection menu, and the shell
//! integration snippet.
//!
//! These print directly to the terminal; the session core underneath
//! returns typed results and stays silent.

use std::io::{Read, Write};
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Utc;

use crate::client::{self, AttachOptions};
use crate::config::Config;
use crate::daemon::pty::SESSION_ENV;
use crate::error::{ExitReason, SessionError};
use crate::registry::{Registry, SessionRecord};

/// Start a session daemon and, unless detached, attach to it.
///
/// When the session already exists: plain start attaches to it, while
/// `start -d` reports `AlreadyExists`.
pub fn start_session(
    registry: &Registry,
    config: &Config,
    name: &str,
    detach: bool,
    socket_override: Option<PathBuf>,
    log_override: Option<PathBuf>,
    command: Option<String>,
    read_only: bool,
) -> Result<()> {
    let check_path = socket_override
        .clone()
        .unwrap_or_else(|| registry.socket_path(name));

    if check_path.exists() {
        if detach {
            return Err(SessionError::AlreadyExists(name.to_string()).into());
        }
        let opts = AttachOptions {
            socket_path: socket_override,
            replay: true,
            tail: 0,
            read_only,
        };
        return attach_session(registry, config, name, &opts);
    }

    spawn_daemon(name, &socket_override, &log_override, &command)?;

    if detach {
        println!("Session '{name}' started in detached mode.");
        return Ok(());
    }

    // The daemon binds its socket before anything else; give it a moment.
    for _ in 0..10 {
        if check_path.exists() {
            let opts = AttachOptions {
                socket_path: socket_override,
                replay: true,
                tail: 0,
                read_only,
            };
            return attach_session(registry, config, name, &opts);
        }
        std::thread::sleep(Duration::from_millis(100));
    }
    anyhow::bail!("Timed out waiting for session '{name}' to start.")
}

/// Re-exec ourselves as a detached daemon process in its own session.
fn spawn_daemon(
    name: &str,
    socket_override: &Option<PathBuf>,
    log_override: &Option<PathBuf>,
    command: &Option<String>,
) -> Result<()> {
    use std::os::unix::process::CommandExt;

    let exe = std::env::current_exe().context("Failed to locate executable")?;
    let mut cmd = std::process::Command::new(exe);
    cmd.arg("daemon");
    if let Some(socket) = socket_override {
        cmd.arg("-s").arg(socket);
    }
    if let Some(log) = log_override {
        cmd.arg("-l").arg(log);
    }
    if let Some(command) = command {
        cmd.arg("-c").arg(command);
    }
    cmd.arg(name)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null());

    // New session: the daemon must survive this terminal closing.
    unsafe {
        cmd.pre_exec(|| {
            libc::setsid();
            Ok(())
        });
    }

    cmd.spawn()
        .with_context(|| format!("Failed to start daemon for session '{name}'"))?;
    log::info!("spawned daemon for session '{name}'");
    Ok(())
}

/// Attach with the banner and outcome trailer around the raw-mode span.
pub fn attach_session(
    registry: &Registry,
    config: &Config,
    name: &str,
    opts: &AttachOptions,
) -> Result<()> {
    print!("\x1b[H\x1b[2J");
    let key = &config.detach_key;
    if opts.read_only {
        println!("[attaching to session '{name}' (read-only). press {key}, d to detach]");
    } else {
        println!("[attaching to session '{name}'. press {key}, d to detach]");
    }

    match client::attach(registry, config, name, opts) {
        Ok(ExitReason::Detached) => println!("\n[detached]"),
        Ok(ExitReason::Kicked) => println!("\n[detached by another connection]"),
        Ok(ExitReason::Terminated) => println!("\n[terminated]"),
        Err(e) => println!("[error attaching to '{name}': {e}]"),
    }
    Ok(())
}

/// Print the live session table. The session we are inside (if any) is
/// marked with `*`.
pub fn list_sessions(registry: &Registry) -> Result<()> {
    let current = std::env::var(SESSION_ENV).unwrap_or_default();
    let sessions = registry.list()?;
    if sessions.is_empty() {
        println!("No active sessions.");
        return Ok(());
    }
    println!("Active sessions:");
    for session in &sessions {
        let marker = if session.name == current { "* " } else { "  " };
        println!(
            "{marker}{} (pid: {}, cmd: {}, up: {})",
            session.name,
            session.pid,
            session.command,
            format_uptime(session),
        );
    }
    Ok(())
}

fn format_uptime(session: &SessionRecord) -> String {
    let secs = (Utc::now() - session.start_time).num_seconds().max(0);
    let (h, m, s) = (secs / 3600, (secs % 3600) / 60, secs % 60);
    if h > 0 {
        format!("{h}h{m}m{s}s")
    } else if m > 0 {
        format!("{m}m{s}s")
    } else {
        format!("{s}s")
    }
}

/// Kill one session, reporting the outcome.
pub fn kill_session(registry: &Registry, name: &str, socket_override: Option<PathBuf>) {
    match client::kill(registry, name, socket_override) {
        Ok(()) => println!("Session '{name}' killed."),
        Err(e) => println!("Error killing session '{name}': {e}"),
    }
}

/// Kill every live session.
pub fn kill_all(registry: &Registry) -> Result<()> {
    for session in registry.list()? {
        kill_session(registry, &session.name, None);
    }
    Ok(())
}

/// Remove stale artifacts and report how many files went.
pub fn clean_sessions(registry: &Registry) -> Result<()> {
    let removed = registry.clean()?;
    println!("Cleaned up {removed} stale files.");
    Ok(())
}

/// Rename a session and its artifacts.
pub fn rename_session(registry: &Registry, old: &str, new: &str) {
    match registry.rename(old, new) {
        Ok(()) => println!("Session '{old}' renamed to '{new}'."),
        Err(e) => println!("Error renaming session: {e}"),
    }
}

/// Print the prompt hook that titles the terminal `persishtent: <name>`
/// inside a session.
pub fn print_init_script(shell: &str) {
    match shell {
        "bash" => print!(
            r#"
if [ -n "$PERSISHTENT_SESSION" ]; then
    PROMPT_COMMAND='echo -ne "\033]0;persishtent: ${{PERSISHTENT_SESSION}}\007"'
fi
"#
        ),
        "zsh" => print!(
            r#"
if [ -n "$PERSISHTENT_SESSION" ]; then
    precmd() {{
        print -Pn "\e]0;persishtent: ${{PERSISHTENT_SESSION}}\a"
    }}
fi
"#
        ),
        other => println!("# Unsupported shell: {other}"),
    }
}

/// Interactive arrow-key picker over the live sessions. Returns the
/// chosen name, or `None` when cancelled or stdin is not a terminal.
pub fn select_session(sessions: &[SessionRecord]) -> Option<String> {
    if !atty::is(atty::Stream::Stdin) {
        println!("Multiple sessions active. Please specify one:");
        for session in sessions {
            println!(
                "  {} (pid: {}, cmd: {})",
                session.name, session.pid, session.command
            );
        }
        return None;
    }

    if crossterm::terminal::enable_raw_mode().is_err() {
        return None;
    }
    let choice = run_menu(sessions);
    let _ = crossterm::terminal::disable_raw_mode();
    choice
}

fn run_menu(sessions: &[SessionRecord]) -> Option<String> {
    let mut stdout = std::io::stdout();
    let mut stdin = std::io::stdin();
    let mut selected = 0usize;
    let mut first = true;

    let _ = stdout.write_all(b"\x1b[?25l");

    let mut render = |selected: usize, first: &mut bool| {
        let mut out = String::new();
        if !*first {
            out.push_str(&format!("\x1b[{}A", sessions.len() + 1));
        }
        *first = false;
        out.push_str("Select a session (Up/Down/Enter/q):\r\n");
        for (i, session) in sessions.iter().enumerate() {
            let marker = if i == selected { " > " } else { "   " };
            out.push_str(&format!(
                "{marker}{} (pid: {}, cmd: {})\x1b[K\r\n",
                session.name, session.pid, session.command
            ));
        }
        let _ = stdout.write_all(out.as_bytes());
        let _ = stdout.flush();
    };

    render(selected, &mut first);

    let choice = loop {
        let mut buf = [0u8; 3];
        let n = match stdin.read(&mut buf) {
            Ok(0) | Err(_) => break None,
            Ok(n) => n,
        };

        if n == 1 {
            match buf[0] {
                0x03 | 0x04 | b'q' => break None,
                b'\r' | b'\n' => break Some(sessions[selected].name.clone()),
                _ => {}
            }
        } else if n == 3 && buf[0] == 0x1b && buf[1] == b'[' {
            match buf[2] {
                b'A' if selected > 0 => {
                    selected -= 1;
                    render(selected, &mut first);
                }
                b'B' if selected + 1 < sessions.len() => {
                    selected += 1;
                    render(selected, &mut first);
                }
                _ => {}
            }
        }
    };

    let _ = std::io::stdout().write_all(b"\x1b[?25h");
    let _ = std::io::stdout().flush();
    choice
}
