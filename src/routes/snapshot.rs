use std::sync::Arc;

use chrono::Utc;
use serde_json::json;
use warp::Filter;
use warp::http::StatusCode;

use super::with_observer;
use crate::aggregator::render_prometheus;
use crate::coordinator::Observer;
use crate::messaging::LogChannel;

pub fn snapshot_route<C: LogChannel>(
  observer: Arc<Observer<C>>,
) -> impl Filter<Extract = impl warp::Reply, Error = warp::Rejection> + Clone {
  warp::path("snapshot")
    .and(warp::path::end())
    .and(warp::get())
    .and(with_observer(observer))
    .and_then(handle_snapshot::<C>)
}

pub fn health_route() -> impl Filter<Extract = impl warp::Reply, Error = warp::Rejection> + Clone {
  warp::path("health").and(warp::path::end()).and(warp::get()).map(|| {
    warp::reply::json(&json!({
      "status": "healthy",
      "timestamp": Utc::now(),
      "version": env!("CARGO_PKG_VERSION"),
    }))
  })
}

pub fn metrics_route<C: LogChannel>(
  observer: Arc<Observer<C>>,
) -> impl Filter<Extract = impl warp::Reply, Error = warp::Rejection> + Clone {
  warp::path("metrics")
    .and(warp::path::end())
    .and(warp::get())
    .and(with_observer(observer))
    .and_then(handle_metrics::<C>)
}

async fn handle_snapshot<C: LogChannel>(observer: Arc<Observer<C>>) -> Result<impl warp::Reply, warp::Rejection> {
  match observer.snapshot() {
    Some(snapshot) => Ok(warp::reply::with_status(warp::reply::json(&*snapshot), StatusCode::OK)),
    None => Ok(warp::reply::with_status(
      warp::reply::json(&json!({"error": "no reconcile cycle has completed yet"})),
      StatusCode::SERVICE_UNAVAILABLE,
    )),
  }
}

async fn handle_metrics<C: LogChannel>(observer: Arc<Observer<C>>) -> Result<impl warp::Reply, warp::Rejection> {
  let (body, status) = match observer.snapshot() {
    Some(snapshot) => (render_prometheus(&snapshot.metrics), StatusCode::OK),
    None => (String::new(), StatusCode::SERVICE_UNAVAILABLE),
  };
  Ok(warp::reply::with_header(
    warp::reply::with_status(body, status),
    "content-type",
    "text/plain; version=0.0.4",
  ))
}
