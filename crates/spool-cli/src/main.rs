//! `spool` - drives the demo bank services on an in-process engine.
//!
//! With `--store` the engine journals to a JSON file, so a workflow suspended
//! by one command can be approved by the next.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context as _;
use clap::{Args, Parser, Subcommand};
use spool_core::impls::FileStore;
use spool_core::{
    Engine, EngineBuilder, EngineConfig, InvocationId, InvocationResponse, InvocationTarget,
    ServiceId,
};
use tracing_subscriber::EnvFilter;

mod bank;

use bank::Transfer;

#[derive(Parser)]
#[command(name = "spool")]
#[command(about = "Durable execution demo: accounts, transfers, wires and approvals", long_about = None)]
#[command(version)]
struct Cli {
    /// Engine configuration (TOML)
    #[arg(short, long, env = "SPOOL_CONFIG")]
    config: Option<PathBuf>,

    /// Journal file; without it everything is lost on exit
    #[arg(short, long, env = "SPOOL_STORE")]
    store: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Move money between two accounts
    Transfer {
        #[command(flatten)]
        transfer: TransferArgs,

        /// Retry a failed deposit a day later before refunding
        #[arg(long)]
        retry_tomorrow: bool,
    },

    /// Approval-gated transfer workflow
    #[command(subcommand)]
    Workflow(WorkflowCommand),

    /// Wire payments that can be reversed
    #[command(subcommand)]
    Wire(WireCommand),

    /// Show an account balance
    Balance { account: String },

    /// Cancel an invocation
    Cancel { id: InvocationId },

    /// Wait for an invocation to finish
    Wait {
        id: InvocationId,

        /// Give up after this many seconds
        #[arg(long, default_value_t = 30)]
        timeout: u64,
    },

    /// Show one invocation, or counts and the invocation list
    Status { id: Option<InvocationId> },
}

#[derive(Subcommand)]
enum WorkflowCommand {
    /// Start the workflow for a transfer id
    Run {
        id: String,
        #[command(flatten)]
        transfer: TransferArgs,
    },
    /// Approve (or with --reject, reject) a pending transfer
    Approve {
        id: String,
        #[arg(long)]
        reject: bool,
    },
    /// Amount waiting for approval, -1 if none
    Amount { id: String },
}

#[derive(Subcommand)]
enum WireCommand {
    Make {
        id: String,
        #[command(flatten)]
        transfer: TransferArgs,
    },
    Cancel { id: String },
}

#[derive(Args)]
struct TransferArgs {
    #[arg(long)]
    from: String,
    #[arg(long)]
    to: String,
    #[arg(long)]
    cents: u64,
}

impl From<TransferArgs> for Transfer {
    fn from(args: TransferArgs) -> Self {
        Transfer {
            from: args.from,
            to: args.to,
            cents: args.cents,
        }
    }
}

const WORKFLOW: &str = "transfer_workflow";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let engine = build_engine(&cli).await?;
    let result = run(&engine, cli.command).await;
    engine.shutdown().await;
    result
}

async fn build_engine(cli: &Cli) -> anyhow::Result<Engine> {
    let config = match &cli.config {
        Some(path) => EngineConfig::load(path)
            .with_context(|| format!("loading config from {}", path.display()))?,
        None => EngineConfig::default(),
    };

    let mut builder = EngineBuilder::new().config(config);
    for service in bank::all() {
        builder = builder.service(service)?;
    }
    builder = builder.expect_handlers(bank::EXPECTED_HANDLERS);
    if let Some(path) = &cli.store {
        let store = FileStore::open(path)
            .await
            .with_context(|| format!("opening store {}", path.display()))?;
        builder = builder.store(store);
    }
    Ok(builder.build().await?)
}

async fn run(engine: &Engine, command: Command) -> anyhow::Result<()> {
    match command {
        Command::Transfer {
            transfer,
            retry_tomorrow,
        } => {
            let service = if retry_tomorrow { "txn" } else { "transfer" };
            let target = InvocationTarget::service(service, "transfer");
            report(&engine.invoke(target, &Transfer::from(transfer)).await?);
        }
        Command::Workflow(WorkflowCommand::Run { id, transfer }) => {
            let target = InvocationTarget::keyed(WORKFLOW, "run", &id);
            report(&engine.invoke(target, &Transfer::from(transfer)).await?);
        }
        Command::Workflow(WorkflowCommand::Approve { id, reject }) => {
            let target = InvocationTarget::keyed(WORKFLOW, "approve", &id);
            report(&engine.invoke(target, &!reject).await?);
            // The run resumes in this process; see it through before exiting.
            if let Some(run) = workflow_run(engine, &id).await {
                report(&engine.wait_for(run).await?);
            }
        }
        Command::Workflow(WorkflowCommand::Amount { id }) => {
            let target = InvocationTarget::keyed(WORKFLOW, "checkAmount", &id);
            report(&engine.invoke(target, &()).await?);
        }
        Command::Wire(WireCommand::Make { id, transfer }) => {
            let target = InvocationTarget::keyed("wire", "make", &id);
            report(&engine.invoke(target, &Transfer::from(transfer)).await?);
        }
        Command::Wire(WireCommand::Cancel { id }) => {
            let target = InvocationTarget::keyed("wire", "cancel", &id);
            report(&engine.invoke(target, &()).await?);
        }
        Command::Balance { account } => {
            let balance = engine
                .state_value::<u64>(&ServiceId::new("account", &account), "balance")
                .await?
                .unwrap_or(bank::INITIAL_BALANCE);
            println!("{account}: {balance} cents");
        }
        Command::Cancel { id } => {
            if engine.cancel(id).await? {
                println!("cancellation requested for {id}");
            } else {
                println!("{id} has already finished");
            }
        }
        Command::Wait { id, timeout } => {
            let response = tokio::time::timeout(Duration::from_secs(timeout), engine.wait_for(id))
                .await
                .with_context(|| format!("{id} did not finish within {timeout}s"))??;
            report(&response);
        }
        Command::Status { id: Some(id) } => {
            let view = engine
                .invocation(id)
                .await
                .with_context(|| format!("no invocation {id}"))?;
            println!("{}", serde_json::to_string_pretty(&view)?);
            if view.status.is_terminal() {
                println!("replay: {:?}", engine.verify_replay(id).await?);
            }
        }
        Command::Status { id: None } => {
            let counts = engine.status().await;
            println!("{}", serde_json::to_string_pretty(&counts)?);
            for view in engine.invocations().await {
                println!(
                    "{}  {}  {:?}  attempts={}",
                    view.id, view.target, view.status, view.attempts
                );
            }
        }
    }
    Ok(())
}

async fn workflow_run(engine: &Engine, key: &str) -> Option<InvocationId> {
    engine
        .invocations()
        .await
        .into_iter()
        .find(|v| {
            v.target.service == WORKFLOW
                && v.target.handler == "run"
                && v.target.key.as_deref() == Some(key)
        })
        .map(|v| v.id)
}

fn report(response: &InvocationResponse) {
    match response {
        InvocationResponse::Completed { id, value } => println!("{id} completed: {value}"),
        InvocationResponse::Failed { id, error } => println!("{id} failed: {error}"),
        InvocationResponse::Suspended { id } => println!("{id} suspended"),
    }
}
