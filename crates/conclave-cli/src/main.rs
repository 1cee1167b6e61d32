//! Conclave CLI
//!
//! Dispatches one prompt to a council of external CLI agents and tracks
//! the run on disk. The hidden `worker` subcommand is the other half of
//! the orchestrator: `start` re-execs this binary once per member so
//! each member runs in its own OS process.

#![allow(clippy::print_stdout)]

use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing::info;

use conclave_core::aggregate::aggregate;
use conclave_core::config::{cache_dir, jobs_dir, load_config};
use conclave_core::coordinator::{StartOutcome, StartRequest, start_job};
use conclave_core::job::{JobPaths, clean_job, resolve_job};
use conclave_core::status::MemberState;
use conclave_core::tracing_init::init_tracing;
use conclave_core::wait::{WaitOptions, wait_for_change};
use conclave_core::{cache, control, results, worker};

#[derive(Parser, Debug)]
#[command(name = "conclave")]
#[command(version, about = "Dispatch one prompt to a council of CLI agents", long_about = None)]
struct Cli {
    /// Emit log lines as JSON
    #[arg(long, global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Create a job and launch one worker per member
    Start {
        /// The prompt to dispatch
        prompt: String,

        /// Scenario name (role template); unknown names dispatch the bare prompt
        #[arg(short, long)]
        scenario: Option<String>,

        /// Chairman role (defaults to the host agent environment, then "claude")
        #[arg(long)]
        chairman: Option<String>,

        /// Per-member timeout in seconds (0 disables the deadline)
        #[arg(short, long)]
        timeout: Option<u64>,

        /// Dispatch to the chairman's member too
        #[arg(long)]
        include_chairman: bool,

        /// Skip the cache lookup
        #[arg(long)]
        no_cache: bool,
    },

    /// One-shot aggregate status of a job
    Status {
        /// Job id or path (defaults to the most recent job)
        job: Option<String>,

        /// Print the summary as JSON
        #[arg(long)]
        json: bool,
    },

    /// Block until the job's status changes meaningfully
    Wait {
        /// Job id or path (defaults to the most recent job)
        job: Option<String>,

        /// Cursor token from a previous wait (defaults to the job's persisted one)
        #[arg(long)]
        cursor: Option<String>,

        /// Give up after this many seconds even if nothing changed
        #[arg(long)]
        timeout: Option<u64>,

        /// Poll interval in milliseconds (floored to 250)
        #[arg(long)]
        interval_ms: Option<u64>,

        /// Print the summary as JSON
        #[arg(long)]
        json: bool,
    },

    /// Render per-member results as markdown
    Results {
        /// Job id or path (defaults to the most recent job)
        job: Option<String>,

        /// Also write the markdown to a file
        #[arg(short, long)]
        export: Option<PathBuf>,
    },

    /// Signal every running member of a job
    Stop {
        /// Job id or path (defaults to the most recent job)
        job: Option<String>,
    },

    /// Delete a job's directory subtree
    Clean {
        /// Job id or path (defaults to the most recent job)
        job: Option<String>,
    },

    /// Inspect or manage the result cache
    Cache {
        #[command(subcommand)]
        command: CacheCommand,
    },

    /// Run one member to completion (spawned internally by `start`)
    #[command(hide = true)]
    Worker {
        /// Job directory
        #[arg(long)]
        job: PathBuf,

        /// Member directory name under members/
        #[arg(long)]
        member: String,
    },
}

#[derive(Subcommand, Debug)]
enum CacheCommand {
    /// List cache entries, newest first
    List,
    /// Remove every cache entry
    Clear,
    /// Dump all entries as JSON (to stdout or a file)
    Export {
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing("conclave=info", cli.log_json);

    let config = load_config()?;

    match cli.command {
        Command::Start {
            prompt,
            scenario,
            chairman,
            timeout,
            include_chairman,
            no_cache,
        } => {
            let request = StartRequest {
                prompt,
                scenario,
                chairman,
                timeout_secs: timeout,
                include_chairman,
                no_cache,
            };
            match start_job(&config, &request)? {
                StartOutcome::Cached(entry) => {
                    println!("cache hit: {}", entry.job_path.display());
                    for preview in &entry.preview {
                        println!("  {}: {}", preview.member, first_line(&preview.snippet));
                    }
                }
                StartOutcome::Started(job) => {
                    let meta = job.read_meta()?;
                    println!("{}", meta.id);
                    info!(
                        job = %meta.id,
                        members = meta.members.len(),
                        "job started; follow it with `conclave wait`"
                    );
                }
            }
        }

        Command::Status { job, json } => {
            let job = resolve_job(&jobs_dir(&config), job.as_deref())?;
            let summary = aggregate(&job);
            if json {
                println!("{}", serde_json::to_string_pretty(&summary)?);
            } else {
                print_summary(&job, &summary);
            }
        }

        Command::Wait {
            job,
            cursor,
            timeout,
            interval_ms,
            json,
        } => {
            let job = resolve_job(&jobs_dir(&config), job.as_deref())?;
            let opts = WaitOptions {
                cursor,
                poll_interval: interval_ms.map(Duration::from_millis),
                timeout: timeout.map(Duration::from_secs),
            };
            let (summary, cursor) = wait_for_change(&job, &opts).await?;
            if json {
                let mut value = serde_json::to_value(&summary)?;
                if let Some(obj) = value.as_object_mut() {
                    obj.insert("cursor".to_string(), cursor.encode().into());
                }
                println!("{}", serde_json::to_string_pretty(&value)?);
            } else {
                print_summary(&job, &summary);
                println!("cursor: {}", cursor.encode());
            }
        }

        Command::Results { job, export } => {
            let job = resolve_job(&jobs_dir(&config), job.as_deref())?;
            let (markdown, stats) = results::render(&job)?;
            // A fully finished job becomes reusable through the cache.
            let summary = aggregate(&job);
            if summary.overall == conclave_core::aggregate::OverallState::Done {
                if let Err(e) = cache::store(&config, &job) {
                    tracing::debug!(error = %e, "failed to store cache entry");
                }
            }
            if let Some(path) = export {
                std::fs::write(&path, &markdown)
                    .with_context(|| format!("writing {}", path.display()))?;
                println!("exported to {}", path.display());
            } else {
                println!("{markdown}");
            }
            info!(
                succeeded = stats.members_succeeded,
                total = stats.members_total,
                fallback_retries = stats.fallback_retries,
                "results rendered"
            );
        }

        Command::Stop { job } => {
            let job = resolve_job(&jobs_dir(&config), job.as_deref())?;
            let signalled = control::stop_job(&job)?;
            if signalled.is_empty() {
                println!("no running members");
            } else {
                println!("signalled: {}", signalled.join(", "));
            }
        }

        Command::Clean { job } => {
            let job = resolve_job(&jobs_dir(&config), job.as_deref())?;
            let root = job.root.clone();
            clean_job(&job)?;
            println!("removed {}", root.display());
        }

        Command::Cache { command } => {
            let dir = cache_dir(&config);
            match command {
                CacheCommand::List => {
                    let entries = cache::list(&dir);
                    if entries.is_empty() {
                        println!("cache is empty");
                    }
                    for entry in entries {
                        let short = entry.fingerprint.get(..12).unwrap_or(&entry.fingerprint);
                        println!(
                            "{short}  {}  {}",
                            entry.job_path.display(),
                            first_line(&entry.prompt)
                        );
                    }
                }
                CacheCommand::Clear => {
                    let removed = cache::clear(&dir)?;
                    println!("removed {removed} entries");
                }
                CacheCommand::Export { output } => {
                    let entries = cache::list(&dir);
                    let json = serde_json::to_string_pretty(&entries)?;
                    match output {
                        Some(path) => {
                            std::fs::write(&path, json)
                                .with_context(|| format!("writing {}", path.display()))?;
                            println!("exported {} entries to {}", entries.len(), path.display());
                        }
                        None => println!("{json}"),
                    }
                }
            }
        }

        Command::Worker { job, member } => {
            // Each worker is its own detached process; its terminal status
            // record is the contract, so its own exit code stays 0 even
            // when the member fails.
            let state = worker::run_member(&JobPaths::new(job), &member).await?;
            info!(member, state = %state, "worker process exiting");
        }
    }

    Ok(())
}

fn print_summary(job: &JobPaths, summary: &conclave_core::aggregate::StatusSummary) {
    println!("job:     {}", job.root.display());
    println!("overall: {}", summary.overall);
    let counts: Vec<String> = MemberState::ALL
        .iter()
        .filter_map(|state| {
            let n = summary.count(*state);
            (n > 0).then(|| format!("{state}: {n}"))
        })
        .collect();
    println!("members: {} ({})", summary.total, counts.join(", "));
    for member in &summary.members {
        let role = member
            .role
            .as_deref()
            .map(|r| format!(" [{r}]"))
            .unwrap_or_default();
        println!("  {:12} {}{role}", member.name, member.state);
    }
}

fn first_line(text: &str) -> &str {
    text.lines().next().unwrap_or_default()
}
