use std::net::SocketAddr;

use anyhow::{Context, Result};
use axum::extract::rejection::JsonRejection;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use clap::Parser;
use pool_migrate_api::{
    InvocationRequest, InvocationResponse, MigrationService, RestoreOptions, API_CONTRACT_VERSION,
};
use pool_migrate_core::Config;
use serde::Serialize;
use tracing_subscriber::EnvFilter;

const SERVICE_CONTRACT_VERSION: &str = "service.v1";

#[derive(Debug, Clone)]
struct ServiceState {
    migrations: MigrationService,
}

#[derive(Debug, Clone, Serialize)]
struct ServiceEnvelope<T>
where
    T: Serialize,
{
    service_contract_version: &'static str,
    api_contract_version: &'static str,
    data: T,
}

#[derive(Debug, Clone, Serialize)]
struct HealthResponse {
    status: &'static str,
}

#[derive(Debug, Parser)]
#[command(name = "pool-migrate-service")]
#[command(about = "HTTP front end for user pool backup and restore")]
struct Args {
    #[arg(long, default_value = "127.0.0.1:4020")]
    bind: SocketAddr,
}

/// The invocation envelope, sent with an HTTP status matching `statusCode`.
struct InvocationReply(InvocationResponse);

impl IntoResponse for InvocationReply {
    fn into_response(self) -> Response {
        let status =
            StatusCode::from_u16(self.0.status_code).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        (status, Json(self.0)).into_response()
    }
}

fn envelope<T>(data: T) -> ServiceEnvelope<T>
where
    T: Serialize,
{
    ServiceEnvelope {
        service_contract_version: SERVICE_CONTRACT_VERSION,
        api_contract_version: API_CONTRACT_VERSION,
        data,
    }
}

fn app(state: ServiceState) -> Router {
    Router::new()
        .route("/v1/health", get(health))
        .route("/v1/invoke", post(invoke))
        .with_state(state)
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();
    let config = Config::from_env().context("invalid service configuration")?;
    let clients = pool_migrate_aws::connect(&config).await;
    let state = ServiceState {
        migrations: MigrationService::with_options(clients, RestoreOptions::from_config(&config)),
    };

    let listener = tokio::net::TcpListener::bind(args.bind).await?;
    tracing::info!("listening on {}", args.bind);
    axum::serve(listener, app(state)).await?;
    Ok(())
}

async fn health() -> Json<ServiceEnvelope<HealthResponse>> {
    Json(envelope(HealthResponse { status: "ok" }))
}

async fn invoke(
    State(state): State<ServiceState>,
    payload: Result<Json<InvocationRequest>, JsonRejection>,
) -> InvocationReply {
    let request = match payload {
        Ok(Json(request)) => request,
        Err(rejection) => {
            tracing::warn!("Rejected invocation body: {}", rejection.body_text());
            return InvocationReply(InvocationResponse::error(
                400,
                &format!("Invalid invocation event: {}", rejection.body_text()),
            ));
        }
    };
    tracing::info!("Received {:?} invocation", request.operation);
    InvocationReply(state.migrations.handle(&request).await)
}
