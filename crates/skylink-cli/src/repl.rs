//! REPL – Read-Eval-Print Loop for the SkyLink operator shell.
//!
//! Supported slash-commands:
//!   /land                      – send LAND (high priority)
//!   /brake                     – send BRAKE (high priority)
//!   /send <ACTION> [low|high]  – send any action
//!   /reconnect                 – drop and re-establish the broker session
//!   /status                    – connection state and broker details
//!   /logs                      – replay the log buffer
//!   /help                      – show this list
//!   /quit | /exit              – gracefully exit the shell
//!
//! Inbound traffic is drained from the bridge before every prompt, appended
//! to a bounded [`LogBuffer`] and echoed.

use colored::Colorize;
use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use chrono::Local;
use rustyline::DefaultEditor;
use rustyline::error::ReadlineError;
use tokio::runtime::Runtime;

use skylink_middleware::Bridge;
use skylink_types::{Action, BridgeError, Priority};

/// Shown (and logged) when a send is attempted without a session.
pub const NOT_CONNECTED_MSG: &str = "Not connected — cannot send";

const PROMPT: &str = "skylink> ";
const USAGE_SEND: &str = "usage: /send <ACTION> [low|high]";

/// A parsed slash-command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReplCommand {
    Send(Action, Priority),
    Reconnect,
    Status,
    Logs,
    Help,
    Quit,
}

/// Parse one line of operator input.  The error is a message for the
/// operator.
pub fn parse_command(line: &str) -> Result<ReplCommand, String> {
    let mut parts = line.split_whitespace();
    let Some(head) = parts.next() else {
        return Err("empty command".to_string());
    };

    let cmd = match head {
        "/land" => ReplCommand::Send(Action::Land, Priority::High),
        "/brake" => ReplCommand::Send(Action::Brake, Priority::High),
        "/send" => {
            let action = parts
                .next()
                .ok_or(USAGE_SEND)?
                .parse::<Action>()
                .map_err(reason)?;
            let priority = match parts.next() {
                Some(tag) => tag.parse::<Priority>().map_err(reason)?,
                None => Priority::default(),
            };
            ReplCommand::Send(action, priority)
        }
        "/reconnect" => ReplCommand::Reconnect,
        "/status" => ReplCommand::Status,
        "/logs" => ReplCommand::Logs,
        "/help" => ReplCommand::Help,
        "/quit" | "/exit" => ReplCommand::Quit,
        other => return Err(format!("Unknown command: '{other}'")),
    };

    if let Some(extra) = parts.next() {
        return Err(format!("unexpected argument '{extra}'"));
    }
    Ok(cmd)
}

fn reason(err: BridgeError) -> String {
    match err {
        BridgeError::Encode(msg) => msg,
        other => other.to_string(),
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Log buffer
// ─────────────────────────────────────────────────────────────────────────────

/// The most recent `capacity` log lines, oldest first.
#[derive(Debug)]
pub struct LogBuffer {
    lines: VecDeque<String>,
    capacity: usize,
}

impl LogBuffer {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            lines: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    pub fn push(&mut self, line: String) {
        if self.lines.len() == self.capacity {
            self.lines.pop_front();
        }
        self.lines.push_back(line);
    }

    pub fn lines(&self) -> impl Iterator<Item = &str> {
        self.lines.iter().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.lines.len()
    }
}

/// Prefix a locally generated entry with the wall-clock time, in the same
/// shape as [`skylink_types::Event::log_line`].
fn stamp(msg: &str) -> String {
    format!("[{}] {}", Local::now().format("%H:%M:%S"), msg)
}

// ─────────────────────────────────────────────────────────────────────────────
// Session
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Continue,
    Quit,
}

/// Shell state over one bridge.  Async bridge calls are driven to completion
/// on `rt`.
pub struct Session<'a> {
    rt: &'a Runtime,
    bridge: &'a Bridge,
    log: LogBuffer,
}

impl<'a> Session<'a> {
    pub fn new(rt: &'a Runtime, bridge: &'a Bridge, log_lines: usize) -> Self {
        Self {
            rt,
            bridge,
            log: LogBuffer::new(log_lines),
        }
    }

    #[cfg(test)]
    fn log(&self) -> &LogBuffer {
        &self.log
    }

    /// Move everything the bridge received into the log.  Returns the new
    /// lines.
    pub fn pump_events(&mut self) -> Vec<String> {
        let lines: Vec<String> = self
            .bridge
            .drain_events()
            .iter()
            .map(|event| event.log_line())
            .collect();
        for line in &lines {
            self.log.push(line.clone());
        }
        lines
    }

    fn note(&mut self, msg: &str) {
        self.log.push(stamp(msg));
    }

    pub fn execute(&mut self, cmd: ReplCommand) -> Flow {
        match cmd {
            ReplCommand::Send(action, priority) => self.cmd_send(action, priority),
            ReplCommand::Reconnect => self.cmd_reconnect(),
            ReplCommand::Status => self.cmd_status(),
            ReplCommand::Logs => self.cmd_logs(),
            ReplCommand::Help => cmd_help(),
            ReplCommand::Quit => {
                println!("{}", "Goodbye.".green());
                return Flow::Quit;
            }
        }
        Flow::Continue
    }

    fn cmd_send(&mut self, action: Action, priority: Priority) {
        let command = self.bridge.command(action, priority);
        match self.rt.block_on(self.bridge.send_command(command)) {
            Ok(()) => {
                let msg = format!("SENT {action}");
                println!("{} {}", "✓".green().bold(), msg.bold());
                self.note(&msg);
            }
            Err(BridgeError::NotConnected) => {
                println!("{}", NOT_CONNECTED_MSG.yellow());
                self.note(NOT_CONNECTED_MSG);
            }
            Err(e) => {
                let msg = format!("Send failed ({e})");
                println!("{}", msg.red());
                self.note(&msg);
            }
        }
    }

    fn cmd_reconnect(&mut self) {
        println!("{}", "Reconnecting...".yellow());
        self.note("Reconnecting...");
        match self.rt.block_on(self.bridge.reconnect()) {
            Ok(()) => println!("{} {}", "✓".green().bold(), "Connected".green()),
            // The failure itself arrives as a SYSTEM event on the next drain.
            Err(e) => println!("{}: {}", "Reconnect failed".red(), e),
        }
    }

    fn cmd_status(&self) {
        let cfg = self.bridge.config();
        let state = self.bridge.state();
        let shown = if state.is_connected() {
            state.to_string().green()
        } else {
            state.to_string().red()
        };

        println!("{}", "Bridge Status".bold().underline());
        println!("  State     : {shown}");
        println!("  Broker    : {}", cfg.target.addr().bold());
        println!("  Client id : {}", cfg.client_id);
        println!("  Source    : {}", cfg.source);
        println!("  Command   → {}", cfg.topics.command.cyan());
        println!("  Status    ← {}", cfg.topics.status.cyan());
        println!("  Telemetry ← {}", cfg.topics.telemetry.cyan());
    }

    fn cmd_logs(&self) {
        if self.log.len() == 0 {
            println!("{}", "(no log entries yet)".dimmed());
            return;
        }
        for line in self.log.lines() {
            println!("  {line}");
        }
    }
}

fn cmd_help() {
    println!();
    println!("{}", "SkyLink Commands".bold().underline());
    println!("  {}                      – send LAND", "/land".bold().cyan());
    println!("  {}                     – send BRAKE", "/brake".bold().cyan());
    println!("  {}  – send any action", "/send <ACTION> [low|high]".bold().cyan());
    println!(
        "      actions: {}",
        Action::ALL.iter().map(|a| a.as_str()).collect::<Vec<_>>().join(", ")
    );
    println!("  {}                 – reconnect to the broker", "/reconnect".bold().cyan());
    println!("  {}                    – connection status", "/status".bold().cyan());
    println!("  {}                      – show recent log lines", "/logs".bold().cyan());
    println!("  {}               – exit the shell", "/quit  /exit".bold().cyan());
    println!();
}

// ─────────────────────────────────────────────────────────────────────────────
// Loop
// ─────────────────────────────────────────────────────────────────────────────

/// Entry point for the interactive REPL.
///
/// `shutdown` is polled each iteration; when set the REPL exits.  Ctrl-C at
/// the prompt also sets it.
pub fn run(rt: &Runtime, bridge: &Bridge, log_lines: usize, shutdown: Arc<AtomicBool>) {
    let mut editor = match DefaultEditor::new() {
        Ok(editor) => editor,
        Err(e) => {
            eprintln!("{}: {}", "Failed to initialise line editor".red(), e);
            return;
        }
    };
    let mut session = Session::new(rt, bridge, log_lines);

    loop {
        if shutdown.load(Ordering::SeqCst) {
            break;
        }

        for line in session.pump_events() {
            println!("{}", line.dimmed());
        }

        let line = match editor.readline(PROMPT) {
            Ok(line) => line,
            Err(ReadlineError::Interrupted) => {
                println!("{}", "⚠  Ctrl-C received – shutting down …".yellow().bold());
                shutdown.store(true, Ordering::SeqCst);
                break;
            }
            Err(ReadlineError::Eof) => break,
            Err(e) => {
                eprintln!("{}: {}", "Read error".red(), e);
                break;
            }
        };

        let input = line.trim();
        if input.is_empty() {
            continue;
        }
        let _ = editor.add_history_entry(input);

        match parse_command(input) {
            Ok(cmd) => {
                if session.execute(cmd) == Flow::Quit {
                    shutdown.store(true, Ordering::SeqCst);
                    break;
                }
            }
            Err(msg) => println!(
                "{} Type {} for available commands.",
                msg.red(),
                "/help".bold()
            ),
        }
    }
}
