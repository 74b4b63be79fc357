use std::process::ExitCode;

use clap::{Parser, Subcommand};
use colored::*;

mod client;

use client::{print_deploy_report, print_dynamic, print_static, read_rules, CliError, CrystalClient};

#[derive(Parser)]
#[command(name = "crystal")]
#[command(about = "Crystal - policy driven storage automation", long_about = None)]
struct Cli {
    #[arg(
        long,
        global = true,
        env = "CRYSTAL_ENGINE_URL",
        default_value = "http://127.0.0.1:9000"
    )]
    engine: String,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Deploy rules, one per line, from a file or `-` for stdin
    Deploy {
        source: String,
    },
    /// List deployed policies
    #[command(subcommand)]
    List(ListCommands),
    /// Delete a policy
    #[command(subcommand)]
    Delete(DeleteCommands),
    /// Send one raw metric line (PUTVAL or JSON) to the engine
    PushMetric {
        line: String,
    },
    /// Check that the engine is reachable
    Health,
}

#[derive(Subcommand)]
enum ListCommands {
    Static,
    Dynamic,
}

#[derive(Subcommand)]
enum DeleteCommands {
    /// Delete a static policy given as <target>:<policy id>
    Static { policy: String },
    /// Delete a dynamic policy and stop its monitor
    Dynamic { policy_id: u64 },
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    match run(cli).await {
        Ok(code) => code,
        Err(err) => {
            eprintln!("{} {}", "error:".red().bold(), err);
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> Result<ExitCode, CliError> {
    let client = CrystalClient::new(&cli.engine)?;

    match cli.command {
        Commands::Deploy { source } => {
            let rules = read_rules(&source)?;
            let (status, report) = client.deploy(rules).await?;
            print_deploy_report(status, &report);
            if status != reqwest::StatusCode::CREATED {
                return Ok(ExitCode::FAILURE);
            }
        }
        Commands::List(ListCommands::Static) => print_static(&client.list_static().await?),
        Commands::List(ListCommands::Dynamic) => print_dynamic(&client.list_dynamic().await?),
        Commands::Delete(DeleteCommands::Static { policy }) => {
            client.delete_static(&policy).await?;
            println!("{} {}", "✔ Static policy deleted:".green().bold(), policy);
        }
        Commands::Delete(DeleteCommands::Dynamic { policy_id }) => {
            client.delete_dynamic(policy_id).await?;
            println!("{} {}", "✔ Dynamic policy deleted:".green().bold(), policy_id);
        }
        Commands::PushMetric { line } => {
            let report = client.push_metric(&line).await?;
            let delivered = report.get("delivered").and_then(|v| v.as_u64()).unwrap_or(0);
            println!("{} delivered to {} monitor(s)", "✔ Metric accepted,".green().bold(), delivered);
        }
        Commands::Health => {
            let health = client.health().await?;
            let status = health.get("status").and_then(|v| v.as_str()).unwrap_or("unknown");
            println!("engine at {}: {}", cli.engine, status.green());
        }
    }

    Ok(ExitCode::SUCCESS)
}
