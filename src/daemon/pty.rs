//! PTY allocation and shell spawning for the session daemon.
//!
//! The daemon owns the master side; the child shell runs on the slave.
//! Shell resolution: an explicit command string runs under `bash -c`
//! (or `/bin/sh -c` when bash is unavailable); otherwise the user's
//! `$SHELL`, falling back to `bash` and finally `sh`.

use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use portable_pty::{native_pty_system, Child, CommandBuilder, MasterPty, PtySize, SlavePty};

/// Environment variable marking the child shell as living inside a
/// session. Front-ends refuse to start or attach when it is set in their
/// own environment (the nesting guard).
pub const SESSION_ENV: &str = "PERSISHTENT_SESSION";

/// A running shell on its PTY.
pub struct PtyShell {
    /// Master half, kept for window resizes.
    pub master: Box<dyn MasterPty + Send>,
    /// Input side of the master (keystrokes toward the shell).
    pub writer: Box<dyn Write + Send>,
    /// Output side of the master (shell output toward clients).
    pub reader: Box<dyn Read + Send>,
    /// The shell process.
    pub child: Box<dyn Child + Send + Sync>,
    /// Pid of the shell process, for signal delivery.
    pub child_pid: i32,
    /// Display string recorded in the session info file.
    pub command: String,
}

/// Resolved program, arguments, and display string for the session shell.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShellCommand {
    pub program: String,
    pub args: Vec<String>,
    pub display: String,
}

/// Pick the shell to spawn. Pure so it can be tested without touching
/// the process environment.
pub fn resolve_shell(custom: Option<&str>, shell_env: Option<&str>) -> ShellCommand {
    if let Some(cmd) = custom {
        let interpreter = if find_in_path("bash").is_some() {
            "bash".to_string()
        } else {
            "/bin/sh".to_string()
        };
        return ShellCommand {
            program: interpreter,
            args: vec!["-c".to_string(), cmd.to_string()],
            display: cmd.to_string(),
        };
    }

    let shell = match shell_env {
        Some(shell) if !shell.is_empty() => shell.to_string(),
        _ => {
            if find_in_path("bash").is_some() {
                "bash".to_string()
            } else {
                "sh".to_string()
            }
        }
    };
    ShellCommand {
        program: shell.clone(),
        args: Vec::new(),
        display: shell,
    }
}

/// Search `$PATH` for an executable.
fn find_in_path(program: &str) -> Option<PathBuf> {
    let path = std::env::var_os("PATH")?;
    std::env::split_paths(&path)
        .map(|dir| dir.join(program))
        .find(|candidate| candidate.is_file())
}

/// Spawn the session shell on a fresh PTY.
///
/// The child environment inherits the daemon's, with `TERM` forced to
/// `xterm-256color`, the nesting sentinel set to the session name, the
/// prompt prefixed, and `SSH_AUTH_SOCK` pointed at the stable symlink
/// when an agent socket is known.
pub fn spawn_shell(
    name: &str,
    custom_cmd: Option<&str>,
    prompt_prefix: &str,
    ssh_symlink: Option<&Path>,
    rows: u16,
    cols: u16,
) -> Result<PtyShell> {
    let shell = resolve_shell(custom_cmd, std::env::var("SHELL").ok().as_deref());

    let mut cmd = CommandBuilder::new(&shell.program);
    for arg in &shell.args {
        cmd.arg(arg);
    }
    cmd.env("TERM", "xterm-256color");
    cmd.env(SESSION_ENV, name);

    // Default prompt shape for shells started without PS1 in the
    // environment.
    let ps1 = std::env::var("PS1").unwrap_or_else(|_| "[\\u@\\h \\W]\\$ ".to_string());
    cmd.env("PS1", format!("{prompt_prefix}:{name} {ps1}"));

    if let Some(symlink) = ssh_symlink {
        cmd.env("SSH_AUTH_SOCK", symlink);
    }

    let pty_system = native_pty_system();
    let pair = pty_system
        .openpty(PtySize {
            rows,
            cols,
            pixel_width: 0,
            pixel_height: 0,
        })
        .context("Failed to open PTY")?;

    let child = pair
        .slave
        .spawn_command(cmd)
        .context("Failed to spawn session shell")?;
    let child_pid = child
        .process_id()
        .ok_or_else(|| anyhow!("spawned shell has no pid"))? as i32;

    let writer = pair
        .master
        .take_writer()
        .context("Failed to take PTY writer")?;
    let reader = pair
        .master
        .try_clone_reader()
        .context("Failed to clone PTY reader")?;

    log::info!(
        "Spawned session shell '{}' (pid={child_pid}) for session '{name}'",
        shell.display
    );

    Ok(PtyShell {
        master: pair.master,
        writer,
        reader,
        child,
        child_pid,
        command: shell.display,
    })
}
