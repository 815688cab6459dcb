//! CLI - reedline-based REPL interface
//!
//! Exposes the scripted process commands against the host's target
//! registry: start a multiplexer, spawn the demultiplexed pair, inspect
//! threads and memory, and drive resume cycles.

use std::borrow::Cow;
use std::sync::Arc;

use anyhow::Result;
use colored::Colorize;
use reedline::{
    Prompt, PromptHistorySearch, PromptHistorySearchStatus, Reedline, Signal,
};

use crate::host::Debugger;
use crate::mux::demux::DemuxProcess;
use crate::mux::{Multiplexer, MuxPhase};
use crate::proxy::ScriptedProcess;
use crate::wiring;

/// Custom prompt for the ProcMux CLI
pub struct ProcMuxPrompt {
    /// Whether a multiplexer is listening on a driving process
    is_listening: bool,
}

impl ProcMuxPrompt {
    pub fn new() -> Self {
        Self {
            is_listening: false,
        }
    }

    pub fn set_listening(&mut self, listening: bool) {
        self.is_listening = listening;
    }
}

impl Default for ProcMuxPrompt {
    fn default() -> Self {
        Self::new()
    }
}

impl Prompt for ProcMuxPrompt {
    fn render_prompt_left(&self) -> Cow<'_, str> {
        let status = if self.is_listening { "mux" } else { "---" };
        Cow::Owned(format!("[{}]", status))
    }

    fn render_prompt_right(&self) -> Cow<'_, str> {
        Cow::Borrowed("")
    }

    fn render_prompt_indicator(&self, _prompt_mode: reedline::PromptEditMode) -> Cow<'_, str> {
        Cow::Borrowed("> ")
    }

    fn render_prompt_multiline_indicator(&self) -> Cow<'_, str> {
        Cow::Borrowed("... ")
    }

    fn render_prompt_history_search_indicator(
        &self,
        history_search: PromptHistorySearch,
    ) -> Cow<'_, str> {
        let prefix = match history_search.status {
            PromptHistorySearchStatus::Passing => "",
            PromptHistorySearchStatus::Failing => "(failed) ",
        };
        Cow::Owned(format!("(search: {}{}) ", prefix, history_search.term))
    }
}

/// Command parsing result
#[derive(Debug)]
enum ParsedCommand {
    /// List targets: targets
    Targets,
    /// Start a multiplexer against the selected target: mux
    StartMux,
    /// Spawn the even/odd demultiplexed pair: demux
    SpawnDemux,
    /// Thread roster, optionally parity-filtered: threads [pid]
    Threads(Option<u64>),
    /// Resume a scripted process: resume [pid]
    Resume(Option<u64>),
    /// Read memory through the multiplexer: read <addr> <len>
    Read(u64, usize),
    /// Write memory through the multiplexer: write <addr> <hexbytes>
    Write(u64, Vec<u8>),
    /// Loaded images of the multiplexer: images
    Images,
    /// Show scripted process states: state
    State,
    /// Help: ? or help
    Help,
    /// Quit: q or exit
    Quit,
    /// Unknown command
    Unknown(String),
}

/// Parse a command string into a structured command
fn parse_command(input: &str) -> ParsedCommand {
    let input = input.trim();
    let parts: Vec<&str> = input.split_whitespace().collect();
    let cmd = parts.first().copied().unwrap_or("");

    match cmd {
        "targets" | "t" => ParsedCommand::Targets,
        "mux" => ParsedCommand::StartMux,
        "demux" => ParsedCommand::SpawnDemux,
        "threads" | "ti" => {
            ParsedCommand::Threads(parts.get(1).and_then(|s| s.parse().ok()))
        }
        "resume" | "c" | "continue" => {
            ParsedCommand::Resume(parts.get(1).and_then(|s| s.parse().ok()))
        }
        "read" | "x" => {
            if let (Some(addr), Some(len)) = (
                parts.get(1).and_then(|s| parse_address(s).ok()),
                parts.get(2).and_then(|s| s.parse().ok()),
            ) {
                return ParsedCommand::Read(addr, len);
            }
            ParsedCommand::Unknown(input.to_string())
        }
        "write" | "w" => {
            if let (Some(addr), Some(bytes)) = (
                parts.get(1).and_then(|s| parse_address(s).ok()),
                parts.get(2).and_then(|s| hex::decode(s).ok()),
            ) {
                return ParsedCommand::Write(addr, bytes);
            }
            ParsedCommand::Unknown(input.to_string())
        }
        "images" => ParsedCommand::Images,
        "state" => ParsedCommand::State,
        "?" | "help" => ParsedCommand::Help,
        "q" | "quit" | "exit" => ParsedCommand::Quit,
        _ => ParsedCommand::Unknown(input.to_string()),
    }
}

/// Parse an address string (supports 0x prefix and decimal)
fn parse_address(s: &str) -> Result<u64, std::num::ParseIntError> {
    let s = s.trim();
    if let Some(hex) = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        u64::from_str_radix(hex, 16)
    } else {
        s.parse()
    }
}

/// Print the help message
fn print_help() {
    println!("{}", "ProcMux CLI Commands".bold().cyan());
    println!("{}", "═".repeat(50).cyan());

    println!("\n{}", "Targets:".bold().yellow());
    println!("  {}          List registered targets", "targets".green());

    println!("\n{}", "Multiplexing:".bold().yellow());
    println!(
        "  {}              Start a multiplexer on the selected target",
        "mux".green()
    );
    println!(
        "  {}            Spawn the even/odd demultiplexed pair",
        "demux".green()
    );
    println!(
        "  {}    Thread roster, filtered by pid parity",
        "threads [pid]".green()
    );
    println!(
        "  {}     Resume the multiplexer or a demuxed pid",
        "resume [pid]".green()
    );

    println!("\n{}", "Memory:".bold().yellow());
    println!("  {}  Read bytes from the driving process", "read <addr> <n>".green());
    println!(
        "  {} Write hex bytes to the driving process",
        "write <addr> <hex>".green()
    );
    println!("  {}           Loaded images of the driving target", "images".green());

    println!("\n{}", "Other:".bold().yellow());
    println!("  {}            Show scripted process states", "state".green());
    println!("  {}                Show this help", "?".green());
    println!("  {}                Quit ProcMux", "q".green());
}

/// REPL state: the host debugger plus whatever scripted processes the
/// session has spun up.
struct CliSession {
    debugger: Debugger,
    mux: Option<Multiplexer>,
    demuxed: Vec<Arc<DemuxProcess>>,
    driving_idx: usize,
}

impl CliSession {
    fn new(debugger: Debugger) -> Self {
        Self {
            debugger,
            mux: None,
            demuxed: Vec::new(),
            driving_idx: 0,
        }
    }

    fn mux(&self) -> Option<&Multiplexer> {
        match &self.mux {
            Some(mux) => Some(mux),
            None => {
                println!("{} No multiplexer running, use 'mux' first", "[!]".red());
                None
            }
        }
    }

    fn execute(&mut self, cmd: ParsedCommand) {
        match cmd {
            ParsedCommand::Targets => {
                for idx in 0..self.debugger.num_targets() {
                    if let Some(target) = self.debugger.target_at_index(idx) {
                        println!(
                            "  #{} {} ({}){}",
                            idx,
                            target.executable(),
                            target.triple(),
                            if target.process().is_some() {
                                " [launched]"
                            } else {
                                ""
                            }
                        );
                    }
                }
            }
            ParsedCommand::StartMux => {
                if self.mux.is_some() {
                    println!("{} Multiplexer already running", "[!]".red());
                    return;
                }
                let Some(selected) = self.debugger.selected_target() else {
                    println!("{} No selected target", "[!]".red());
                    return;
                };
                self.driving_idx = self.debugger.index_of_target(&selected).unwrap_or(0);
                match wiring::start_multiplexer(&self.debugger) {
                    Ok(mux) => {
                        println!(
                            "[*] Multiplexer launched (pid {}), driving target #{}",
                            mux.process_id(),
                            self.driving_idx
                        );
                        self.mux = Some(mux);
                    }
                    Err(err) => println!("{} {}", "[!]".red(), err),
                }
            }
            ParsedCommand::SpawnDemux => {
                let Some(mux) = self.mux().cloned() else { return };
                match wiring::spawn_demultiplexed_pair(&self.debugger, &mux, self.driving_idx) {
                    Ok((even, odd)) => {
                        println!(
                            "[*] Demultiplexed processes: even pid {}, odd pid {}",
                            even.process_id(),
                            odd.process_id()
                        );
                        self.demuxed = vec![even, odd];
                    }
                    Err(err) => println!("{} {}", "[!]".red(), err),
                }
            }
            ParsedCommand::Threads(pid) => {
                let Some(mux) = self.mux() else { return };
                let info = mux.threads_info(pid);
                match serde_json::to_string_pretty(&info) {
                    Ok(rendered) => println!("{}", rendered),
                    Err(err) => println!("{} {}", "[!]".red(), err),
                }
            }
            ParsedCommand::Resume(pid) => {
                let result = match pid {
                    None => match self.mux() {
                        Some(mux) => mux.resume(None),
                        None => return,
                    },
                    Some(pid) => {
                        match self.demuxed.iter().find(|d| d.process_id() == pid) {
                            Some(demux) => demux.resume(true),
                            None => {
                                println!("{} No demuxed process with pid {}", "[!]".red(), pid);
                                return;
                            }
                        }
                    }
                };
                match result {
                    Ok(()) => println!("[*] Resumed"),
                    Err(err) => println!("{} {}", "[!]".red(), err),
                }
            }
            ParsedCommand::Read(addr, len) => {
                let Some(mux) = self.mux() else { return };
                match mux.read_memory_at_address(addr, len) {
                    Ok(data) => {
                        println!(
                            "[*] {} bytes at {:#x} ({:?} endian, {}-byte addresses)",
                            data.bytes.len(),
                            addr,
                            data.byte_order,
                            data.address_byte_size
                        );
                        for chunk in data.bytes.chunks(16) {
                            println!("    {}", hex::encode(chunk));
                        }
                    }
                    Err(err) => println!("{} {}", "[!]".red(), err),
                }
            }
            ParsedCommand::Write(addr, bytes) => {
                let Some(mux) = self.mux() else { return };
                match mux.write_memory_at_address(addr, &bytes) {
                    Ok(written) => println!("[*] Wrote {} bytes at {:#x}", written, addr),
                    Err(err) => println!("{} {}", "[!]".red(), err),
                }
            }
            ParsedCommand::Images => {
                let Some(mux) = self.mux() else { return };
                for image in mux.loaded_images() {
                    println!("  {:#014x} {}", image.load_addr, image.path);
                }
            }
            ParsedCommand::State => match &self.mux {
                Some(mux) => {
                    println!("  multiplexer: {:?}, state {}", mux.phase(), mux.state());
                    for demux in &self.demuxed {
                        println!(
                            "  demux pid {} ({:?}): state {}",
                            demux.process_id(),
                            demux.parity(),
                            demux.state()
                        );
                    }
                }
                None => println!("  no multiplexer"),
            },
            ParsedCommand::Help => print_help(),
            ParsedCommand::Quit => {
                if let Some(mux) = &self.mux {
                    mux.shutdown();
                }
                println!("[*] Shutting down...");
                std::process::exit(0);
            }
            ParsedCommand::Unknown(input) => {
                println!("{} Unknown command: '{}'", "[!]".red(), input);
                println!("    Type '?' for help");
            }
        }
    }
}

/// Run the CLI REPL
pub fn run_cli(debugger: Debugger) -> Result<()> {
    let mut line_editor = Reedline::create();
    let mut prompt = ProcMuxPrompt::new();
    let mut session = CliSession::new(debugger);

    println!(
        "{}",
        "╔══════════════════════════════════════════════════════════════╗".cyan()
    );
    println!(
        "{}",
        "║  ProcMux CLI - Type '?' for help, 'q' to quit                ║".cyan()
    );
    println!(
        "{}",
        "╚══════════════════════════════════════════════════════════════╝".cyan()
    );

    loop {
        let sig = line_editor.read_line(&prompt)?;
        match sig {
            Signal::Success(buffer) => {
                let input = buffer.trim();
                if input.is_empty() {
                    continue;
                }

                let cmd = parse_command(input);
                session.execute(cmd);
                prompt.set_listening(
                    session
                        .mux
                        .as_ref()
                        .map(|m| m.phase() == MuxPhase::Listening)
                        .unwrap_or(false),
                );
            }
            Signal::CtrlD | Signal::CtrlC => {
                println!("\n[*] Interrupted");
                if let Some(mux) = &session.mux {
                    mux.shutdown();
                }
                break;
            }
        }
    }

    Ok(())
}
