use std::sync::Arc;
use workspace_exec::config::ServiceConfig;
use workspace_exec::editor::FileEditor;
use workspace_exec::manager::SessionManager;
use workspace_exec::server::{build_router, ServerState};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let config = Arc::new(ServiceConfig::from_env()?);
    tracing::info!(
        workspace_root = %config.workspace_root.display(),
        bind_addr = %config.bind_addr,
        "starting workspace-exec"
    );

    let manager = SessionManager::new(config.clone());
    let editor = Arc::new(FileEditor::new(config.workspace_root.clone()));

    let state = ServerState {
        manager,
        editor,
        config: config.clone(),
    };

    let router = build_router(state);

    let listener = tokio::net::TcpListener::bind(config.bind_addr).await?;
    tracing::info!(addr = %config.bind_addr, "listening");

    axum::serve(listener, router.into_make_service()).await?;

    Ok(())
}
