//! # OSS IPC Control
//!
//! Operator tool for the kernel objects of one OSS simulation instance:
//! create them the way the launcher does, inspect them, push or pull a
//! message, and tear everything down after a crashed run.

use clap::{Parser, Subcommand};
use oss_common::config::{ConfigError, LogLevel, OssConfig};
use oss_common::consts::MSG_PROJ_ID;
use oss_common::role::ProcessRole;
use oss_shared_memory::{
    Message, MessageQueue, RecvFlags, SharedState, ShmResult, SimContext, StateReport, logger,
};
use std::path::PathBuf;
use std::process;
use tracing::{error, info};

/// OSS IPC control: manage the shared objects of a simulation instance
#[derive(Parser, Debug)]
#[command(name = "oss_ipcctl")]
#[command(author = "RTS007")]
#[command(version)]
#[command(about = "Create, inspect and remove the shared objects of an OSS simulation")]
struct Args {
    /// Path to the instance configuration TOML; defaults apply without it.
    #[arg(long, value_name = "FILE", global = true)]
    config: Option<PathBuf>,

    /// Enable verbose logging (DEBUG level).
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Create every shared object and reset its contents (launcher path).
    Init,
    /// Show clocks, process slots, ledger counters and queue depth.
    Status {
        /// Print the report as JSON.
        #[arg(long)]
        json: bool,
    },
    /// Remove every shared object of the instance.
    Remove,
    /// Send one message on the channel.
    Send {
        /// Message type, must be positive.
        kind: i64,
        /// Integer payload.
        #[arg(allow_negative_numbers = true)]
        payload: i32,
    },
    /// Receive one message from the channel.
    Recv {
        /// Message type to wait for; 0 takes the first message of any type.
        #[arg(long, default_value_t = 0)]
        kind: i64,
        /// Fail instead of waiting when nothing is queued.
        #[arg(long)]
        nowait: bool,
    },
}

fn main() {
    let args = Args::parse();

    let config = match load_config(&args) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Invalid configuration: {e}");
            process::exit(1);
        }
    };
    let ctx = match build_context(&args, &config) {
        Ok(ctx) => ctx,
        Err(e) => {
            eprintln!("Failed to install signal handlers: {e}");
            process::exit(1);
        }
    };
    setup_tracing(&ctx, &config);

    if let Err(e) = run(&args, &config, &ctx) {
        error!("FATAL: {e}");
        process::exit(1);
    }
}

fn load_config(args: &Args) -> Result<OssConfig, ConfigError> {
    OssConfig::load_or_default(args.config.as_deref())
}

/// Coordinator context; only a blocking receive needs the signal handlers.
fn build_context(args: &Args, config: &OssConfig) -> ShmResult<SimContext> {
    let mut level = config.effective_log().level;
    if args.verbose {
        level = level.min(LogLevel::Debug);
    }
    match args.command {
        Command::Recv { nowait: false, .. } => {
            SimContext::with_signal_handlers(ProcessRole::Coordinator, level)
        }
        _ => Ok(SimContext::detached(ProcessRole::Coordinator, level)),
    }
}

/// Setup the role-tagged logger at the context's level.
fn setup_tracing(ctx: &SimContext, config: &OssConfig) {
    logger::init(ctx.role, &ctx.log_config(&config.effective_log()));
}

fn run(
    args: &Args,
    config: &OssConfig,
    ctx: &SimContext,
) -> Result<(), Box<dyn std::error::Error>> {
    let ipc = &config.ipc;
    match &args.command {
        Command::Init => {
            let state = SharedState::initialize(ipc)?;
            info!(
                "Instance '{}' initialized (keys from {})",
                config.shared.service_name,
                ipc.key_path.display()
            );
            state.detach()?;
        }
        Command::Status { json } => {
            let state = SharedState::attach(ipc)?;
            let report = state.report();
            state.detach()?;
            let report = report?;
            if *json {
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else {
                print_report(&report);
            }
        }
        Command::Remove => {
            let removed = SharedState::remove_all(ipc)?;
            println!("Removed {removed} shared objects");
        }
        Command::Send { kind, payload } => {
            let queue = MessageQueue::open(&ipc.msg_key_path, MSG_PROJ_ID)?;
            queue.send(&Message::new(*kind, *payload))?;
        }
        Command::Recv { kind, nowait } => {
            let queue = MessageQueue::open(&ipc.msg_key_path, MSG_PROJ_ID)?;
            let flags = if *nowait {
                RecvFlags::NO_WAIT
            } else {
                RecvFlags::empty()
            };
            let msg = queue.receive::<i32>(*kind, flags, &ctx.shutdown)?;
            println!("{} {}", msg.kind, msg.payload);
        }
    }
    Ok(())
}

fn print_report(report: &StateReport) {
    println!(
        "Simulated clock: {}s {}ns (actual {:.3}s)",
        report.simulated.seconds, report.simulated.nanoseconds, report.actual_seconds
    );
    println!("Pending messages: {}", report.pending_messages);
    println!("Processes ({}):", report.processes.len());
    for (slot, pid) in &report.processes {
        println!("  slot {slot:>2}  pid {pid}");
    }
    println!(
        "Ledger ({}):",
        if report.ledger_consistent {
            "consistent"
        } else {
            "INCONSISTENT"
        }
    );
    for (resource, (total, available)) in report.total.iter().zip(&report.available).enumerate() {
        println!("  R{resource}: {available}/{total} available");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_consistent() {
        Args::command().debug_assert();
    }

    #[test]
    fn global_flags_follow_subcommands() {
        let args =
            Args::try_parse_from(["oss_ipcctl", "status", "--json", "--config", "oss.toml", "-v"])
                .unwrap();
        assert!(args.verbose);
        assert_eq!(args.config, Some(PathBuf::from("oss.toml")));
        assert!(matches!(args.command, Command::Status { json: true }));
    }

    #[test]
    fn send_accepts_negative_payload() {
        let args = Args::try_parse_from(["oss_ipcctl", "send", "3", "-7"]).unwrap();
        assert!(matches!(
            args.command,
            Command::Send {
                kind: 3,
                payload: -7
            }
        ));
    }

    #[test]
    fn verbose_lowers_context_level_without_handlers() {
        let args = Args::try_parse_from(["oss_ipcctl", "status", "-v"]).unwrap();
        let config = OssConfig::default();
        let ctx = build_context(&args, &config).unwrap();
        assert_eq!(ctx.role, ProcessRole::Coordinator);
        assert_eq!(ctx.log_level, config.effective_log().level.min(LogLevel::Debug));
        assert!(!ctx.should_stop());
        assert_eq!(ctx.log_config(&config.effective_log()).level, ctx.log_level);
    }

    #[test]
    fn nowait_recv_uses_detached_context() {
        let args = Args::try_parse_from(["oss_ipcctl", "recv", "--nowait"]).unwrap();
        let ctx = build_context(&args, &OssConfig::default()).unwrap();
        ctx.shutdown.request();
        assert!(ctx.should_stop());
        assert!(!oss_shared_memory::ShutdownFlag::process().is_requested());
    }

    #[test]
    fn recv_defaults_to_any_kind_blocking() {
        let args = Args::try_parse_from(["oss_ipcctl", "recv"]).unwrap();
        assert!(matches!(
            args.command,
            Command::Recv {
                kind: 0,
                nowait: false
            }
        ));
    }
}
