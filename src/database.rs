use sqlx::migrate::Migrator;
use sqlx::{Pool, Postgres};
use tracing::info;

use crate::error::TransportError;
use crate::messaging::LogChannel;

static MIGRATOR: Migrator = sqlx::migrate!();

pub async fn setup_database(database_url: &str) -> Result<Pool<Postgres>, TransportError> {
  let pool = Pool::<Postgres>::connect(database_url).await?;
  MIGRATOR.run(&pool).await?;
  info!("Database migrations complete");
  Ok(pool)
}

/// A named log stored as rows of one append-only table. Several clusters can
/// share a database by using different channel names.
#[derive(Clone)]
pub struct PgChannel {
  pool: Pool<Postgres>,
  channel: String,
}

impl PgChannel {
  pub fn new(pool: Pool<Postgres>, channel: impl Into<String>) -> Self {
    Self { pool, channel: channel.into() }
  }
}

impl LogChannel for PgChannel {
  async fn append(&self, entry: String) -> Result<String, TransportError> {
    let seq: i64 = sqlx::query_scalar("INSERT INTO coordination_log (channel, body) VALUES ($1, $2) RETURNING seq")
      .bind(&self.channel)
      .bind(entry)
      .fetch_one(&self.pool)
      .await?;
    Ok(seq.to_string())
  }

  async fn read_all(&self) -> Result<Vec<String>, TransportError> {
    let rows: Vec<String> = sqlx::query_scalar("SELECT body FROM coordination_log WHERE channel = $1 ORDER BY seq")
      .bind(&self.channel)
      .fetch_all(&self.pool)
      .await?;
    Ok(rows)
  }
}
