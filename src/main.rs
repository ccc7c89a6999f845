use std::sync::Arc;

use anyhow::Result;
use chrono::Utc;
use logmesh::{
  config::Config,
  coordinator::Observer,
  database::{PgChannel, setup_database},
  messaging::LogChannel,
  routes::routes,
};
use tracing::{info, warn};

#[tokio::main]
async fn main() -> Result<()> {
  tracing_subscriber::fmt::init();
  let config = Config::from_env()?;
  let db_pool = setup_database(&config.database_url).await?;
  let channel = PgChannel::new(db_pool, config.channel_name.clone());
  let observer = Arc::new(Observer::new(channel, config.protocol.clone()));

  tokio::spawn(observe(observer.clone()));

  info!("Serving snapshots of channel {} on port {}", config.channel_name, config.server_port);
  warp::serve(routes(observer))
    .run(([0, 0, 0, 0], config.server_port))
    .await;
  Ok(())
}

async fn observe<C: LogChannel>(observer: Arc<Observer<C>>) {
  let mut ticker = tokio::time::interval(observer.config().poll_interval);
  loop {
    ticker.tick().await;
    if let Err(e) = observer.reconcile(Utc::now()).await {
      warn!("Reconcile failed, keeping previous snapshot: {}", e);
    }
  }
}
