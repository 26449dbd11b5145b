#![forbid(unsafe_code)]

mod actor;
mod cmd;
mod output;

use std::env;
use std::path::Path;
use std::process::ExitCode;

use clap::{CommandFactory, Parser, Subcommand};
use filament_core::model::ActorKind;
use filament_core::timing;
use output::{CliError, OutputMode, Reported, render_error};
use tracing::info;
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

use cmd::{Identity, Session};

#[derive(Parser, Debug)]
#[command(
    author,
    version,
    about = "fil: append-only coordination graph with replay and merge queues",
    long_about = None
)]
struct Cli {
    /// Enable verbose logging.
    #[arg(short, long)]
    verbose: bool,

    /// Emit command timing report to stderr.
    #[arg(long, global = true)]
    timing: bool,

    /// Emit JSON output instead of human-readable text.
    #[arg(long, global = true)]
    json: bool,

    /// Acting identity (overrides FILAMENT_ACTOR and the user config).
    #[arg(long, global = true)]
    actor: Option<String>,

    /// Kind of the acting identity: human, agent or system.
    #[arg(long, global = true)]
    actor_kind: Option<ActorKind>,

    #[command(subcommand)]
    command: Commands,
}

impl Cli {
    const fn output_mode(&self) -> OutputMode {
        OutputMode::from_json_flag(self.json)
    }
}

#[derive(Subcommand, Debug)]
enum Commands {
    #[command(
        next_help_heading = "Setup",
        about = "Initialize a filament project",
        after_help = "EXAMPLES:\n    # Create .filament/ in the current directory\n    fil init"
    )]
    Init(cmd::init::InitArgs),

    #[command(
        next_help_heading = "History",
        about = "Write keys to a resource",
        after_help = "EXAMPLES:\n    # Set two keys on the resource `doc`\n    fil write doc title=Draft pages=3\n\n    # Cite an evidence commit\n    fil write doc reviewed=true --evidence scans@0"
    )]
    Write(cmd::write::WriteArgs),

    #[command(
        next_help_heading = "History",
        about = "Show commit history",
        after_help = "EXAMPLES:\n    # Last 20 commits across all filaments\n    fil log -n 20\n\n    # One filament\n    fil log queue:doc"
    )]
    Log(cmd::log::LogArgs),

    #[command(
        next_help_heading = "History",
        about = "Import a file as evidence",
        after_help = "EXAMPLES:\n    # Record a report under the evidence filament `scans`\n    fil evidence report.json --id scans"
    )]
    Evidence(cmd::evidence::EvidenceArgs),

    #[command(
        next_help_heading = "Queue",
        about = "Queue a proposed change",
        after_help = "EXAMPLES:\n    # Propose a change to cells A1 and A2 of `sheet`\n    fil enqueue sheet p-17 --task t-4 --loci A1,A2 --base head --set A1=10"
    )]
    Enqueue(cmd::enqueue::EnqueueArgs),

    #[command(
        next_help_heading = "Queue",
        about = "Show a resource's merge queue",
        after_help = "EXAMPLES:\n    fil queue sheet --json"
    )]
    Queue(cmd::queue::QueueArgs),

    #[command(
        next_help_heading = "Queue",
        about = "Merge the queue head",
        after_help = "EXAMPLES:\n    fil merge sheet p-17"
    )]
    Merge(cmd::merge::MergeArgs),

    #[command(
        next_help_heading = "Queue",
        about = "Pin proposals to the front of a queue (needs authority)",
        after_help = "EXAMPLES:\n    fil reorder sheet p-20 p-17 --reason \"release blocker\" --sig sig:lead"
    )]
    Reorder(cmd::reorder::ReorderArgs),

    #[command(
        next_help_heading = "Queue",
        about = "Cancel a queued proposal (needs authority)",
        after_help = "EXAMPLES:\n    fil cancel sheet p-17 --reason \"superseded\" --sig sig:lead"
    )]
    Cancel(cmd::cancel::CancelArgs),

    #[command(
        next_help_heading = "Conflicts",
        about = "List conflict records",
        after_help = "EXAMPLES:\n    # Unresolved conflicts on one resource\n    fil conflicts --resource sheet --open"
    )]
    Conflicts(cmd::conflicts::ConflictsArgs),

    #[command(
        next_help_heading = "Conflicts",
        about = "Resolve a conflict (needs authority)",
        after_help = "EXAMPLES:\n    fil resolve conflict:sheet:p-17+p-20 --select p-20 --reason \"newer data\" --sig sig:lead\n\n    fil resolve conflict:sheet:p-17+p-20 --fork p-17 --reason \"try both\" --sig sig:lead"
    )]
    Resolve(cmd::resolve::ResolveArgs),

    #[command(
        next_help_heading = "Replay",
        about = "Replay the log and compare with live state",
        after_help = "EXAMPLES:\n    # Every resource, full history\n    fil replay\n\n    # A window of the global order, recording any drift\n    fil replay doc --from 10 --to 40 --record\n\n    # Module replay over two resources\n    fil replay alpha beta --module ingest --packet-prefix pkt."
    )]
    Replay(cmd::replay::ReplayArgs),

    #[command(
        next_help_heading = "Replay",
        about = "Check journal and store integrity",
        after_help = "EXAMPLES:\n    fil verify\n\n    # Drop a torn trailing line first\n    fil verify --repair"
    )]
    Verify(cmd::verify::VerifyArgs),

    #[command(
        about = "Generate shell completions",
        after_help = "EXAMPLES:\n    fil completions zsh > ~/.zfunc/_fil"
    )]
    Completions(cmd::completions::CompletionsArgs),
}

fn init_tracing() {
    let filter = EnvFilter::try_from_env("FILAMENT_LOG").unwrap_or_else(|_| {
        EnvFilter::new(if env::var("DEBUG").is_ok() {
            "filament=debug,info"
        } else {
            "filament=info,warn"
        })
    });

    let format = env::var("FILAMENT_LOG_FORMAT").unwrap_or_else(|_| "compact".to_string());

    let registry = tracing_subscriber::registry().with(filter);

    match format.as_str() {
        "json" => {
            registry
                .with(fmt::layer().json().with_ansi(false).with_writer(std::io::stderr))
                .init();
        }
        _ => {
            registry
                .with(fmt::layer().compact().with_writer(std::io::stderr))
                .init();
        }
    }
}

fn run(cli: Cli, project_root: &Path) -> anyhow::Result<()> {
    let output = cli.output_mode();
    let identity = Identity {
        actor: cli.actor.as_deref(),
        kind: cli.actor_kind,
    };
    let json = cli.json;
    let session = || Session::open(project_root, json);

    match cli.command {
        Commands::Init(args) => {
            timing::timed("cmd.init", || cmd::init::run_init(&args, output, project_root))
        }
        Commands::Completions(args) => timing::timed("cmd.completions", || {
            cmd::completions::run_completions(args.shell, &mut Cli::command())
        }),
        Commands::Write(args) => timing::timed("cmd.write", || {
            cmd::write::run_write(args, &session()?, identity)
        }),
        Commands::Log(args) => timing::timed("cmd.log", || cmd::log::run_log(&args, &session()?)),
        Commands::Evidence(args) => timing::timed("cmd.evidence", || {
            cmd::evidence::run_evidence(&args, &session()?, identity)
        }),
        Commands::Enqueue(args) => timing::timed("cmd.enqueue", || {
            cmd::enqueue::run_enqueue(args, &session()?, identity)
        }),
        Commands::Queue(args) => {
            timing::timed("cmd.queue", || cmd::queue::run_queue(&args, &session()?))
        }
        Commands::Merge(args) => timing::timed("cmd.merge", || {
            cmd::merge::run_merge(&args, &session()?, identity)
        }),
        Commands::Reorder(args) => timing::timed("cmd.reorder", || {
            cmd::reorder::run_reorder(args, &session()?, identity)
        }),
        Commands::Cancel(args) => timing::timed("cmd.cancel", || {
            cmd::cancel::run_cancel(&args, &session()?, identity)
        }),
        Commands::Conflicts(args) => timing::timed("cmd.conflicts", || {
            cmd::conflicts::run_conflicts(&args, &session()?)
        }),
        Commands::Resolve(args) => timing::timed("cmd.resolve", || {
            cmd::resolve::run_resolve(&args, &session()?, identity)
        }),
        Commands::Replay(args) => timing::timed("cmd.replay", || {
            cmd::replay::run_replay(&args, &session()?, identity)
        }),
        Commands::Verify(args) => {
            timing::timed("cmd.verify", || cmd::verify::run_verify(&args, &session()?))
        }
    }
}

fn main() -> ExitCode {
    init_tracing();

    let cli = Cli::parse();
    let timing_enabled = cli.timing || timing::timing_enabled_from_env();
    timing::set_timing_enabled(timing_enabled);
    timing::clear_timings();

    if cli.verbose {
        info!("Verbose mode enabled");
    }

    let output = cli.output_mode();
    let result = env::current_dir()
        .map_err(anyhow::Error::from)
        .and_then(|root| run(cli, &root));

    if timing_enabled {
        let report = timing::collect_report();
        if report.is_empty() {
            eprintln!("timing report: no samples recorded");
        } else {
            eprintln!("timing report:");
            eprintln!("{}", report.display_table());
            if let Ok(json) = serde_json::to_string_pretty(&report) {
                eprintln!("timing report (json):");
                eprintln!("{json}");
            }
        }
    }

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            if err.downcast_ref::<Reported>().is_none() {
                let _ = render_error(output, &CliError::new(format!("{err:#}")));
            }
            ExitCode::FAILURE
        }
    }
}
