mod cmd;
mod output;
mod prompts;

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{ArgAction, Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use conveyor_lib::consts::{CONFIG_FILENAME, ROOT_ENV_VAR};

use crate::cmd::{CmdContext, TriggerCommand};
use crate::output::{OutputFormat, print_error};

/// conveyor - build once, promote by digest
#[derive(Parser)]
#[command(name = "conveyor")]
#[command(author, version, about, long_about = None)]
struct Cli {
  /// Raise log verbosity (-v info, -vv debug, -vvv trace)
  #[arg(short, long, global = true, action = ArgAction::Count)]
  verbose: u8,

  /// Pipeline configuration file
  #[arg(long, global = true, default_value = CONFIG_FILENAME)]
  config: PathBuf,

  /// State directory for plans, locks, records and runs
  #[arg(long, global = true, env = ROOT_ENV_VAR)]
  root: Option<PathBuf>,

  /// Identity recorded on plans, approvals and promotion records
  #[arg(long, global = true, env = "CONVEYOR_ACTOR", default_value = "operator")]
  actor: String,

  /// Output format
  #[arg(short, long, global = true, value_enum, default_value_t = OutputFormat::Text)]
  output: OutputFormat,

  /// Shorthand for `--output json`
  #[arg(long, global = true)]
  json: bool,

  #[command(subcommand)]
  command: Commands,
}

#[derive(Subcommand)]
enum Commands {
  /// Compute a plan for one environment and digest
  Plan {
    environment: String,

    /// Artifact digest (sha256:<hex>)
    #[arg(long)]
    digest: String,

    /// Environment the digest was promoted from
    #[arg(long = "from")]
    promoted_from: Option<String>,
  },

  /// Apply a stored plan
  Apply {
    environment: String,

    /// Plan id or unique prefix
    #[arg(long = "plan")]
    plan_id: String,

    /// Block until the plan is approved instead of failing
    #[arg(long)]
    wait: bool,
  },

  /// Copy an artifact by digest between environment registries
  Promote {
    source: String,
    target: String,

    #[arg(long)]
    digest: String,

    /// Promote even if an earlier environment has not applied the digest
    #[arg(long)]
    skip_chain_check: bool,
  },

  /// Release an environment lock left behind by a dead holder
  ForceUnlock {
    environment: String,

    #[arg(long)]
    lock_id: String,

    /// Skip the confirmation prompt
    #[arg(short, long)]
    force: bool,
  },

  /// Feed a trigger event through the pipeline
  Trigger {
    #[command(subcommand)]
    trigger: TriggerCommand,
  },

  /// Build a source revision into an environment registry
  Build {
    #[arg(long)]
    revision: String,

    /// Source directory (default: the config directory)
    #[arg(long)]
    path: Option<PathBuf>,

    /// Target environment (default: the first in the chain)
    #[arg(long = "env")]
    environment: Option<String>,
  },

  /// Resolve a tag to its digest in an environment registry
  Resolve { environment: String, tag: String },

  /// Approve a pending plan
  Approve {
    /// Plan id or unique prefix
    plan_id: String,

    #[arg(short, long)]
    comment: Option<String>,
  },

  /// Reject a pending plan
  Reject {
    /// Plan id or unique prefix
    plan_id: String,

    #[arg(short, long)]
    comment: Option<String>,
  },

  /// Show deployed digest, lock and pending plan per environment
  Status { environment: Option<String> },

  /// Show the promotion record history of an environment
  History {
    environment: String,

    /// Show only the most recent entries
    #[arg(short = 'n', long)]
    limit: Option<usize>,
  },

  /// List pipeline runs, newest first
  Runs {
    #[arg(short = 'n', long, default_value_t = 20)]
    limit: usize,
  },

  /// Ask an in-flight run to stop, wherever it executes
  Cancel {
    /// Run id or unique prefix
    run_id: String,
  },
}

fn init_tracing(verbose: u8) {
  let default = match verbose {
    0 => "warn",
    1 => "info",
    2 => "debug",
    _ => "trace",
  };
  let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
  tracing_subscriber::fmt()
    .with_env_filter(filter)
    .with_writer(std::io::stderr)
    .without_time()
    .init();
}

fn main() -> ExitCode {
  let cli = Cli::parse();
  init_tracing(cli.verbose);

  let format = if cli.json { OutputFormat::Json } else { cli.output };
  let ctx = CmdContext::new(cli.config, cli.root, cli.actor, format);

  let result = match cli.command {
    Commands::Plan {
      environment,
      digest,
      promoted_from,
    } => cmd::cmd_plan(&ctx, &environment, &digest, promoted_from.as_deref()),
    Commands::Apply {
      environment,
      plan_id,
      wait,
    } => cmd::cmd_apply(&ctx, &environment, &plan_id, wait),
    Commands::Promote {
      source,
      target,
      digest,
      skip_chain_check,
    } => cmd::cmd_promote(&ctx, &source, &target, &digest, skip_chain_check),
    Commands::ForceUnlock {
      environment,
      lock_id,
      force,
    } => cmd::cmd_force_unlock(&ctx, &environment, &lock_id, force),
    Commands::Trigger { trigger } => cmd::cmd_trigger(&ctx, trigger),
    Commands::Build {
      revision,
      path,
      environment,
    } => cmd::cmd_build(&ctx, &revision, path, environment.as_deref()),
    Commands::Resolve { environment, tag } => cmd::cmd_resolve(&ctx, &environment, &tag),
    Commands::Approve { plan_id, comment } => cmd::cmd_approve(&ctx, &plan_id, true, comment),
    Commands::Reject { plan_id, comment } => cmd::cmd_approve(&ctx, &plan_id, false, comment),
    Commands::Status { environment } => cmd::cmd_status(&ctx, environment.as_deref()),
    Commands::History { environment, limit } => cmd::cmd_history(&ctx, &environment, limit),
    Commands::Runs { limit } => cmd::cmd_runs(&ctx, limit),
    Commands::Cancel { run_id } => cmd::cmd_cancel(&ctx, &run_id),
  };

  match result {
    Ok(()) => ExitCode::SUCCESS,
    Err(err) => {
      print_error(&format!("{:#}", err));
      ExitCode::from(cmd::exit_code(&err))
    }
  }
}
