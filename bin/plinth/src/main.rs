//! plinth deploys interdependent smart contracts in dependency order, exactly once per network.

mod cli;

use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::Parser;
use comfy_table::{Table, presets::UTF8_FULL};

use cli::{Cli, Command, DeployArgs, OutputFormat};
use plinth_deploy::{
    DeploymentFailure, DeploymentReport, FileStore, Manifest, Orchestrator, PlanError,
    RpcChainReader, RpcSubmitter, StateStore, StoreError, build_plan,
};

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    // Initialize the logger. Logs go to stderr so stdout carries only command output.
    tracing_subscriber::fmt()
        .with_max_level(cli.verbosity)
        .with_writer(std::io::stderr)
        .init();

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            tracing::error!("{err:#}");
            ExitCode::from(exit_code(&err))
        }
    }
}

async fn run(cli: Cli) -> Result<()> {
    let mut manifest = Manifest::load(&cli.config)?;

    match cli.command {
        Command::Deploy(args) => deploy(&mut manifest, args).await,
        Command::Plan => plan(&manifest),
        Command::Status { output } => status(&manifest, output),
        Command::ForgetPending { name } => forget_pending(&manifest, &name),
    }
}

/// Map an error to the process exit code documented for the CLI.
fn exit_code(err: &anyhow::Error) -> u8 {
    if let Some(failure) = err.downcast_ref::<DeploymentFailure>() {
        failure.exit_code()
    } else if let Some(plan_error) = err.downcast_ref::<PlanError>() {
        plan_error.exit_code()
    } else if let Some(store_error) = err.downcast_ref::<StoreError>() {
        store_error.exit_code()
    } else {
        1
    }
}

async fn deploy(manifest: &mut Manifest, args: DeployArgs) -> Result<()> {
    if let Some(depth) = args.confirmation_depth {
        manifest.deploy.confirmation_depth = depth;
    }
    if let Some(timeout_ms) = args.timeout_ms {
        manifest.deploy.confirmation_timeout_ms = timeout_ms;
    }
    manifest.validate()?;

    let plan = build_plan(manifest.contract_specs()?)?;
    let network = &manifest.network;

    let store = FileStore::open(manifest.state_dir())?;
    let submitter = RpcSubmitter::new(network.rpc_url.clone(), network.from)?
        .gas_limit(network.gas_limit);
    let chain = RpcChainReader::new(network.rpc_url.clone())?;

    let orchestrator = Orchestrator::new(submitter, chain, store, &manifest.deploy)
        .with_progress(|event| {
            tracing::info!(
                contract = %event.name,
                status = %event.status,
                tx_hash = ?event.tx_hash,
                address = ?event.address,
                "Progress"
            );
        });

    match orchestrator.deploy(&plan, &network.id).await {
        Ok(report) => print_report(&report, args.output),
        Err(failure) => {
            if !failure.report.contracts.is_empty() {
                print_report(&failure.report, args.output)?;
            }
            Err(failure.into())
        }
    }
}

fn print_report(report: &DeploymentReport, output: OutputFormat) -> Result<()> {
    match output {
        OutputFormat::Json => {
            let json =
                serde_json::to_string_pretty(report).context("Failed to serialize report")?;
            println!("{json}");
        }
        OutputFormat::Table => {
            let mut table = Table::new();
            table.load_preset(UTF8_FULL).set_header(vec![
                "Contract",
                "Address",
                "Transaction",
                "Block",
                "Outcome",
            ]);
            for contract in &report.contracts {
                table.add_row(vec![
                    contract.name.clone(),
                    contract.address.to_string(),
                    or_dash(contract.tx_hash),
                    contract.confirmed_at_block.to_string(),
                    contract.outcome.to_string(),
                ]);
            }
            println!("{table}");
        }
    }
    Ok(())
}

fn plan(manifest: &Manifest) -> Result<()> {
    let plan = build_plan(manifest.contract_specs()?)?;

    let mut table = Table::new();
    table
        .load_preset(UTF8_FULL)
        .set_header(vec!["#", "Contract", "Depends on"]);
    for (index, spec) in plan.iter().enumerate() {
        table.add_row(vec![
            (index + 1).to_string(),
            spec.name.clone(),
            spec.dependencies().collect::<Vec<_>>().join(", "),
        ]);
    }
    println!("{table}");
    Ok(())
}

fn status(manifest: &Manifest, output: OutputFormat) -> Result<()> {
    let store = FileStore::open(manifest.state_dir())?;
    let network = &manifest.network.id;
    let records = store.list(network)?;
    let pending = store.list_pending(network)?;

    match output {
        OutputFormat::Json => {
            let status = serde_json::json!({
                "network": network,
                "records": records,
                "pending": pending,
            });
            let json =
                serde_json::to_string_pretty(&status).context("Failed to serialize status")?;
            println!("{json}");
        }
        OutputFormat::Table => {
            let mut table = Table::new();
            table.load_preset(UTF8_FULL).set_header(vec![
                "Contract",
                "Address",
                "Transaction",
                "Block",
                "Deployed at",
            ]);
            for record in &records {
                table.add_row(vec![
                    record.contract_name.clone(),
                    record.address.to_string(),
                    or_dash(record.tx_hash),
                    record.confirmed_at_block.to_string(),
                    timestamp(record.deployed_at),
                ]);
            }
            println!("{table}");

            if !pending.is_empty() {
                let mut table = Table::new();
                table.load_preset(UTF8_FULL).set_header(vec![
                    "Pending contract",
                    "Nonce",
                    "Expected address",
                    "Transaction",
                    "Submitted at",
                ]);
                for entry in &pending {
                    table.add_row(vec![
                        entry.contract_name.clone(),
                        entry.nonce.to_string(),
                        entry.expected_address.to_string(),
                        or_dash(entry.tx_hash),
                        timestamp(entry.submitted_at),
                    ]);
                }
                println!("{table}");
            }
        }
    }

    tracing::info!(
        network = %network,
        records = records.len(),
        pending = pending.len(),
        "Deployment status"
    );
    Ok(())
}

fn timestamp(secs: i64) -> String {
    chrono::DateTime::from_timestamp(secs, 0)
        .map(|at| at.to_rfc3339())
        .unwrap_or_else(|| secs.to_string())
}

fn or_dash(value: Option<impl ToString>) -> String {
    value.map_or_else(|| "-".to_string(), |value| value.to_string())
}

fn forget_pending(manifest: &Manifest, name: &str) -> Result<()> {
    let store = FileStore::open(manifest.state_dir())?;
    let network = &manifest.network.id;

    let Some(entry) = store.pending(network, name)? else {
        tracing::info!(contract = name, network = %network, "No journaled deployment");
        return Ok(());
    };

    store.clear_pending(network, name)?;
    tracing::warn!(
        contract = name,
        network = %network,
        tx_hash = ?entry.tx_hash,
        nonce = entry.nonce,
        "Forgot journaled deployment; the next deploy submits a new one"
    );
    Ok(())
}
