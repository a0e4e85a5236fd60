use std::path::{Path, PathBuf};
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use pool_migrate_api::{InvocationRequest, InvocationResponse, MigrationService, RestoreOptions};
use pool_migrate_core::Config;
use serde_json::Value;
use tracing_subscriber::EnvFilter;

const CLI_CONTRACT_VERSION: &str = "cli.v1";

#[derive(Debug, Parser)]
#[command(name = "pmig")]
#[command(about = "Back up and restore user pools")]
struct Cli {
    #[command(flatten)]
    settings: Settings,
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Args)]
struct Settings {
    #[arg(long, env = "REGION", global = true)]
    region: Option<String>,
    #[arg(long, env = "BACKUP_BUCKET_NAME", global = true)]
    backup_bucket: Option<String>,
    #[arg(long, env = "DYNAMODB_TABLE_NAME", global = true)]
    dynamodb_table: Option<String>,
    #[arg(long, env = "AWS_ENDPOINT_URL", global = true)]
    endpoint_url: Option<String>,
    #[arg(long, env = "RESTORE_TEMPORARY_PASSWORD", hide_env_values = true, global = true)]
    temporary_password: Option<String>,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Snapshot a pool into the backup bucket.
    Backup {
        #[arg(long)]
        user_pool_id: String,
    },
    /// Restore a snapshot into an existing pool.
    Restore {
        #[arg(long)]
        backup_key: String,
        #[arg(long)]
        target_user_pool_id: String,
    },
    /// Run a raw invocation event read from a file, or stdin with `-`.
    Invoke {
        #[arg(long)]
        event: PathBuf,
    },
}

impl Settings {
    fn config(&self) -> Result<Config> {
        let config = Config::from_lookup(|name| match name {
            "REGION" => self.region.clone(),
            "BACKUP_BUCKET_NAME" => self.backup_bucket.clone(),
            "DYNAMODB_TABLE_NAME" => self.dynamodb_table.clone(),
            "AWS_ENDPOINT_URL" => self.endpoint_url.clone(),
            "RESTORE_TEMPORARY_PASSWORD" => self.temporary_password.clone(),
            _ => None,
        })?;
        Ok(config)
    }
}

fn read_event(path: &Path) -> Result<InvocationRequest> {
    let raw = if path.as_os_str() == "-" {
        std::io::read_to_string(std::io::stdin()).context("failed to read event from stdin")?
    } else {
        std::fs::read_to_string(path)
            .with_context(|| format!("failed to read event file {}", path.display()))?
    };
    serde_json::from_str(&raw).context("event is not a valid invocation request")
}

fn with_contract_version(value: Value) -> Value {
    match value {
        Value::Object(mut object) => {
            object.insert(
                "contract_version".to_string(),
                Value::String(CLI_CONTRACT_VERSION.to_string()),
            );
            Value::Object(object)
        }
        other => serde_json::json!({
            "contract_version": CLI_CONTRACT_VERSION,
            "payload": other
        }),
    }
}

fn emit_response(response: &InvocationResponse) -> Result<ExitCode> {
    let body = response.body_json().context("response body is not JSON")?;
    println!("{}", serde_json::to_string_pretty(&with_contract_version(body))?);
    Ok(if response.is_success() { ExitCode::SUCCESS } else { ExitCode::FAILURE })
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let request = match &cli.command {
        Command::Backup { user_pool_id } => InvocationRequest::backup(user_pool_id),
        Command::Restore { backup_key, target_user_pool_id } => {
            InvocationRequest::restore(backup_key, target_user_pool_id)
        }
        Command::Invoke { event } => read_event(event)?,
    };

    let config = cli.settings.config()?;
    let clients = pool_migrate_aws::connect(&config).await;
    let service = MigrationService::with_options(clients, RestoreOptions::from_config(&config));

    let response = service.handle(&request).await;
    tracing::info!("invocation finished with status {}", response.status_code);
    emit_response(&response)
}
