use export_scheduler::config::ExportConfig;
use export_scheduler::globals;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenv::dotenv().ok();

    let config = ExportConfig::from_env()?;
    export_scheduler::initialize(config).await?;

    let registry = globals::get_job_registry()?;
    let restored = registry.restore_active_jobs().await?;

    let jobs = registry.list_jobs().await?;
    log::info!("{} jobs defined, {} scheduled", jobs.len(), restored);
    for job in &jobs {
        log::debug!("{}", serde_json::to_string(job)?);
    }

    tokio::signal::ctrl_c().await?;
    log::info!("Shutdown requested, cancelling triggers");
    registry.shutdown().await;

    if let Ok(runs) = globals::get_run_history_store()?.list_all().await {
        if let Some(last) = runs.first() {
            log::info!("Last run: {}", serde_json::to_string(last)?);
        }
    }

    Ok(())
}
