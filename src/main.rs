use std::sync::Arc;

use anyhow::Result;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use rtqs::app::App;
use rtqs::config::Config;
use rtqs::database::setup_database;
use rtqs::operations::staged_table;
use rtqs::resources::{MemoryResourceStore, PgResourceStore, ResourceStore};
use rtqs::routes::routes;
use rtqs::schedules::{MemoryScheduleStore, PgScheduleStore, ScheduleStore};

#[tokio::main]
async fn main() -> Result<()> {
  tracing_subscriber::fmt()
    .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
    .init();

  let config = Config::from_env()?;
  let (resources, store): (Arc<dyn ResourceStore>, Arc<dyn ScheduleStore>) = match &config.database_url {
    Some(url) => {
      let pool = setup_database(url).await?;
      (Arc::new(PgResourceStore::new(pool.clone())), Arc::new(PgScheduleStore::new(pool)))
    }
    None => {
      warn!("DATABASE_URL not set; schedules and repositories are kept in memory");
      let repos = MemoryResourceStore::new();
      if let Some(seed) = &config.repositories {
        repos.seed(seed).await;
      }
      (Arc::new(repos), Arc::new(MemoryScheduleStore::new()))
    }
  };

  let app = App::new(&config, staged_table(config.operation_step)?, resources, store);
  let shutdown = CancellationToken::new();

  let scheduler = tokio::spawn({
    let (scheduler, shutdown, every) = (app.scheduler.clone(), shutdown.clone(), config.tick_interval);
    async move { scheduler.run(every, shutdown).await }
  });
  let reaper = tokio::spawn({
    let (reaper, shutdown, every) = (app.reaper.clone(), shutdown.clone(), config.reaper_interval);
    async move { reaper.run(every, shutdown).await }
  });

  tokio::spawn({
    let shutdown = shutdown.clone();
    async move {
      match tokio::signal::ctrl_c().await {
        Ok(()) => {
          info!("Shutdown requested");
          shutdown.cancel();
        }
        Err(e) => warn!("Could not listen for Ctrl-C: {}", e),
      }
    }
  });

  let (addr, server) = warp::serve(routes(app)).try_bind_with_graceful_shutdown(
    ([0, 0, 0, 0], config.server_port),
    shutdown.clone().cancelled_owned(),
  )?;
  info!("Listening on {}", addr);
  server.await;

  shutdown.cancel();
  let _ = tokio::join!(scheduler, reaper);
  info!("Stopped");
  Ok(())
}
