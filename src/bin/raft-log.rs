//! raft-log - inspect and drive a raft log directory by hand.

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tracing::{Level, info};
use tracing_subscriber::FmtSubscriber;

use raft_log::{LoggingStateMachine, RaftLog, RaftLogOptions};

#[derive(Parser, Debug)]
#[command(name = "raft-log")]
#[command(about = "Inspect and drive a persistent raft log")]
struct Args {
    /// Data directory holding raft_log.seg and raft_meta.seg
    #[arg(short, long, conflicts_with = "config")]
    data_dir: Option<PathBuf>,

    /// JSON configuration file (`db_path` or `base_dir` names the data directory)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Log level
    #[arg(long, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print log boundaries and commit/apply progress
    Status,
    /// Append a command at the next index
    Append {
        #[arg(long)]
        term: u64,
        #[arg(long)]
        command: String,
    },
    /// Print entries in [from, to)
    Entries {
        #[arg(long, default_value = "1")]
        from: u64,
        #[arg(long, default_value_t = u64::MAX)]
        to: u64,
    },
    /// Remove every entry after the given index
    Truncate {
        #[arg(long)]
        after: u64,
    },
    /// Advance the commit index
    Commit {
        #[arg(long)]
        index: u64,
    },
    /// Apply committed entries through the logging state machine
    Apply,
}

fn load_options(args: &Args) -> Result<RaftLogOptions, Box<dyn std::error::Error>> {
    if let Some(config) = &args.config {
        return Ok(RaftLogOptions::from_json_file(config)?);
    }
    Ok(match &args.data_dir {
        Some(dir) => RaftLogOptions::with_base_dir(dir),
        None => RaftLogOptions::default(),
    })
}

async fn run(log: &RaftLog, command: Command) -> Result<(), Box<dyn std::error::Error>> {
    match command {
        Command::Status => {
            println!("last_log_index: {}", log.get_last_log_index().await?);
            println!("last_log_term:  {}", log.get_last_log_term().await?);
            println!("commit_index:   {}", log.get_commit_index().await?);
            println!("last_applied:   {}", log.get_last_applied().await?);
        }
        Command::Append { term, command } => {
            let index = log.append_entry(term, command).await?;
            println!("{}", index);
        }
        Command::Entries { from, to } => {
            for entry in log.get_entries(from, to).await? {
                println!(
                    "{}\t{}\t{}\t{}",
                    entry.index,
                    entry.term,
                    if entry.committed { "C" } else { "-" },
                    entry.command
                );
            }
        }
        Command::Truncate { after } => {
            log.remove_entries_after(after).await?;
            println!("last_log_index: {}", log.get_last_log_index().await?);
        }
        Command::Commit { index } => {
            let commit_index = log.set_commit_index(index).await?;
            println!("commit_index: {}", commit_index);
        }
        Command::Apply => {
            let applied = log.apply_entries().await?;
            println!("applied: {}", applied);
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    let level = match args.log_level.as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };
    let subscriber = FmtSubscriber::builder().with_max_level(level).finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let options = load_options(&args)?;
    info!("Data directory: {:?}", options.base_dir);

    let log = RaftLog::open(options, Arc::new(LoggingStateMachine))?;
    let result = run(&log, args.command).await;
    log.close().await?;
    result
}
