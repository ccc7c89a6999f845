use std::convert::Infallible;
use std::sync::Arc;

use warp::Filter;

use crate::coordinator::Observer;
use crate::messaging::LogChannel;

pub mod alerts;
pub mod snapshot;
pub mod sse;

pub fn routes<C: LogChannel>(
  observer: Arc<Observer<C>>,
) -> impl Filter<Extract = impl warp::Reply, Error = warp::Rejection> + Clone {
  snapshot::snapshot_route(observer.clone())
    .or(snapshot::health_route())
    .or(snapshot::metrics_route(observer.clone()))
    .or(sse::sse_route(observer.clone()))
    .or(alerts::dismiss_route(observer))
}

fn with_observer<C: LogChannel>(
  observer: Arc<Observer<C>>,
) -> impl Filter<Extract = (Arc<Observer<C>>,), Error = Infallible> + Clone {
  warp::any().map(move || observer.clone())
}
