#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![deny(clippy::panic)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]
#![forbid(unsafe_code)]

mod cli;
mod output;

use broker::config::EngineConfig;
use broker::error::{code, Result};
use broker::fleet::CampaignStatus;
use broker::storage::{OperationRepository, OperationStorage, PgOperationStorage};
use broker::types::{
    CampaignId, InstanceId, OperationFilter, OperationId, OperationState, OperationType,
};
use cli::{parse_cli_args, suggest_commands, CliAction, CliCommand, CliError};
use output::{emit_broker_error, emit_error, emit_output, CLI_EXIT_CODE};
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() {
    dotenv::dotenv().ok();
    init_tracing();

    let args: Vec<String> = std::env::args().skip(1).collect();
    let exit_code = match parse_cli_args(&args) {
        Ok(CliAction::ShowHelp | CliAction::Command(CliCommand::Help)) => {
            print!("{}", cli::HELP_TEXT);
            0
        }
        Ok(CliAction::ShowVersion) => {
            println!("broker {}", env!("CARGO_PKG_VERSION"));
            0
        }
        Ok(CliAction::Command(command)) => match run_command(&command).await {
            Ok(payload) => {
                emit_output(command.name(), payload);
                0
            }
            Err(error) => emit_broker_error(&error),
        },
        Err(error) => {
            let suggestions = match &error {
                CliError::UnknownCommand { cmd } => suggest_commands(cmd),
                _ => Vec::new(),
            };
            emit_error(code::CLI_ERROR, &error.to_string(), &suggestions);
            CLI_EXIT_CODE
        }
    };
    std::process::exit(exit_code);
}

fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_writer(std::io::stderr),
        )
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();
}

async fn connect(config: &EngineConfig, url: &str) -> Result<PgOperationStorage> {
    info!("Connecting to {}", broker::config::mask_database_url(url));
    PgOperationStorage::connect(url, config.db_max_connections, config.db_connect_timeout).await
}

async fn open_repository(config: &EngineConfig) -> Result<Arc<dyn OperationStorage>> {
    let driver = connect(config, &config.database_url).await?;
    Ok(Arc::new(
        OperationRepository::new(driver, config.storage_retry)
            .with_max_page_size(config.max_page_size),
    ))
}

async fn run_command(command: &CliCommand) -> Result<Value> {
    let config = EngineConfig::load(None).await?;

    match command {
        CliCommand::Help => Ok(json!({ "message": cli::HELP_TEXT })),
        CliCommand::InitDb { url } => {
            let url = url.as_deref().unwrap_or(&config.database_url);
            let storage = connect(&config, url).await?;
            storage.initialize_schema().await?;
            Ok(json!({
                "message": "Operation schema initialized",
                "database_url": broker::config::mask_database_url(url),
            }))
        }
        CliCommand::Show { operation_id } => {
            let storage = open_repository(&config).await?;
            let operation = storage
                .get_by_id(&OperationId::new(operation_id.clone()))
                .await?;
            Ok(serde_json::to_value(operation)?)
        }
        CliCommand::History { instance_id } => {
            let storage = open_repository(&config).await?;
            let operations = storage
                .list_by_instance_id(&InstanceId::new(instance_id.clone()))
                .await?;
            Ok(json!({ "count": operations.len(), "operations": operations }))
        }
        CliCommand::CampaignStatus {
            campaign_id,
            states,
            page,
            page_size,
        } => {
            let storage = open_repository(&config).await?;
            let status = CampaignStatus::new(storage, config.max_page_size);
            let campaign = CampaignId::new(campaign_id.clone());
            let defaults = OperationFilter::default();
            let filter = OperationFilter::default()
                .with_states(states.iter().copied())
                .with_page(
                    page.unwrap_or(defaults.page),
                    page_size.unwrap_or(defaults.page_size),
                );

            let stats = status.stats(&campaign).await?;
            let listing = status.list(&campaign, filter).await?;
            let stats: serde_json::Map<String, Value> = stats
                .into_iter()
                .map(|(state, count)| (state.to_string(), json!(count)))
                .collect();
            Ok(json!({
                "campaign_id": campaign,
                "stats": stats,
                "operations": listing,
            }))
        }
        CliCommand::Recover { operation_type } => {
            let storage = open_repository(&config).await?;
            let types = operation_type.map_or_else(|| OperationType::ALL.to_vec(), |t| vec![t]);
            let mut queues = serde_json::Map::new();
            for operation_type in types {
                let pending = storage.get_not_finished_by_type(operation_type).await?;
                let ids: Vec<&OperationId> = pending.iter().map(|op| &op.id).collect();
                info!(
                    "{} unfinished {} operations would be re-enqueued with {} workers",
                    ids.len(),
                    operation_type,
                    config.workers.for_type(operation_type)
                );
                queues.insert(operation_type.to_string(), json!(ids));
            }
            Ok(json!({ "unfinished": queues, "states": OperationState::NOT_FINISHED }))
        }
    }
}
