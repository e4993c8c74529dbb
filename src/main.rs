//! `proofread-server`: HTTP front for the proofreading pipeline.

use anyhow::Context;
use proofread_pipeline::server::{self, AppState, ServerSettings};
use proofread_pipeline::{register_builtin_roles, BuiltinDeps, Config, ExecCtx, PipelineExecutor, RoleRegistry};
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = Config::load().context("loading configuration")?;

    let mut ctx = ExecCtx::builder(&config.llm_base_url)
        .max_concurrency(config.llm_max_concurrency)
        .timeout(config.request_timeout());
    match &config.llm_api_key {
        Some(key) => ctx = ctx.openai_with_key(key),
        None => tracing::warn!("no LLM API key configured; LLM roles will likely fail"),
    }
    let ctx = Arc::new(ctx.build().context("building LLM context")?);

    let deps = BuiltinDeps {
        basic_locate: config.basic_locate,
        reviewer_locate: config.reviewer_locate,
        streaming: config.streaming,
        merge: config.merge_config(),
        ..BuiltinDeps::new(ctx, &config.model)
    };
    let mut registry = RoleRegistry::new();
    let added = register_builtin_roles(&mut registry, &deps).context("registering roles")?;
    tracing::info!(roles = added, model = %config.model, "roles registered");

    let state = AppState::new(
        PipelineExecutor::new(Arc::new(registry)),
        ServerSettings::from_config(&config),
    );
    let listener = TcpListener::bind(&config.bind)
        .await
        .with_context(|| format!("binding {}", config.bind))?;
    tracing::info!(addr = %config.bind, "listening");

    server::serve(listener, state, async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to listen for shutdown signal");
            std::future::pending::<()>().await;
        }
        tracing::info!("shutting down");
    })
    .await
    .context("serving")?;
    Ok(())
}
