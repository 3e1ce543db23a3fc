use anyhow::{Context, Result};
use async_graphql_axum::{GraphQLRequest, GraphQLResponse};
use axum::extract::State;
use axum::response::Html;
use axum::routing::get;
use axum::Router;
use std::sync::Arc;
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use crate::api::graphql::{self, MeshguardSchema};
use crate::api::rest::{self, AppState};
use crate::config::Config;
use crate::domain::firewall::FirewallManager;
use crate::domain::mesh::MeshVerifier;
use crate::domain::mesh_service::MeshService;

pub async fn run(config: Config) -> Result<()> {
    // Init tracing
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&config.daemon.log_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .json()
        .init();

    info!(version = env!("CARGO_PKG_VERSION"), "meshguard daemon starting");

    // Both engines share one executor and one inventory snapshot
    let registry = config.registry()?;
    let executor = Arc::new(config.executor());
    let verifier =
        MeshVerifier::with_registry(executor.clone(), config.mesh_settings(), registry.clone())
            .with_probe(config.probe());
    let firewall = FirewallManager::with_registry(
        executor,
        config.rule_selector(),
        config.firewall_timeout(),
        registry,
    );
    let mesh_service = Arc::new(MeshService::new(verifier, firewall));

    info!(nodes = mesh_service.nodes().len(), "inventory loaded");

    let app_state = AppState {
        mesh: mesh_service.clone(),
    };

    // Build GraphQL schema
    let schema = graphql::build_schema(mesh_service.clone());

    // Build GraphQL sub-router with its own state
    let graphql_router = Router::new()
        .route("/graphql", get(graphql_playground).post(graphql_handler))
        .with_state(schema);

    // Build Axum router: REST (with AppState) + GraphQL (with schema state)
    let app = rest::router(app_state)
        .merge(graphql_router)
        .layer(TraceLayer::new_for_http());

    // Bind HTTP listener
    let http_addr = &config.daemon.http_addr;
    let listener = TcpListener::bind(http_addr)
        .await
        .with_context(|| format!("binding to {}", http_addr))?;

    info!(addr = %http_addr, "HTTP server listening");

    // Initial verification runs in the background; the daemon serves immediately
    if config.daemon.verify_on_start {
        let svc = mesh_service.clone();
        tokio::spawn(async move {
            info!("running initial mesh verification");
            let outcome = svc.verify_mesh().await;
            if outcome.success {
                info!("initial mesh verification completed");
            } else {
                warn!(
                    error = outcome.error.as_deref().unwrap_or("unknown"),
                    "initial mesh verification failed"
                );
            }
        });
    }

    // Run HTTP server with graceful shutdown
    axum::serve(listener, app.into_make_service())
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("HTTP server error")?;

    info!("meshguard daemon stopped");
    Ok(())
}

async fn graphql_playground() -> Html<String> {
    Html(
        async_graphql::http::playground_source(
            async_graphql::http::GraphQLPlaygroundConfig::new("/graphql"),
        ),
    )
}

async fn graphql_handler(
    State(schema): State<MeshguardSchema>,
    req: GraphQLRequest,
) -> GraphQLResponse {
    schema.execute(req.into_inner()).await.into()
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => { info!("Received Ctrl+C, shutting down"); },
        _ = terminate => { info!("Received SIGTERM, shutting down"); },
    }
}
