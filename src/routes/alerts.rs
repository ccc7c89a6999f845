use std::sync::Arc;

use serde_json::json;
use uuid::Uuid;
use warp::Filter;
use warp::http::StatusCode;

use super::with_observer;
use crate::coordinator::Observer;
use crate::messaging::LogChannel;

pub fn dismiss_route<C: LogChannel>(
  observer: Arc<Observer<C>>,
) -> impl Filter<Extract = impl warp::Reply, Error = warp::Rejection> + Clone {
  warp::path!("alerts" / Uuid / "dismiss")
    .and(warp::post())
    .and(with_observer(observer))
    .and_then(handle_dismiss::<C>)
}

async fn handle_dismiss<C: LogChannel>(alert_id: Uuid, observer: Arc<Observer<C>>) -> Result<impl warp::Reply, warp::Rejection> {
  if observer.dismiss_alert(alert_id) {
    Ok(warp::reply::with_status(
      warp::reply::json(&json!({"alert_id": alert_id, "dismissed": true})),
      StatusCode::OK,
    ))
  } else {
    Ok(warp::reply::with_status(
      warp::reply::json(&json!({"error": format!("no alert {alert_id}")})),
      StatusCode::NOT_FOUND,
    ))
  }
}
