use std::sync::Arc;

use tokio_stream::{StreamExt, wrappers::IntervalStream};
use warp::Filter;
use warp::sse::Event;

use super::with_observer;
use crate::coordinator::Observer;
use crate::messaging::LogChannel;

pub fn sse_route<C: LogChannel>(
  observer: Arc<Observer<C>>,
) -> impl Filter<Extract = impl warp::Reply, Error = warp::Rejection> + Clone {
  warp::path("sse")
    .and(warp::path::end())
    .and(warp::get())
    .and(with_observer(observer))
    .and_then(handle_sse::<C>)
}

/// Pushes the latest snapshot once per poll interval. Ticks before the first
/// reconcile cycle send nothing.
async fn handle_sse<C: LogChannel>(observer: Arc<Observer<C>>) -> Result<impl warp::Reply, warp::Rejection> {
  let interval = IntervalStream::new(tokio::time::interval(observer.config().poll_interval));
  let stream = interval.filter_map(move |_| {
    observer
      .snapshot()
      .map(|snapshot| Event::default().event("snapshot").json_data(&*snapshot))
  });

  Ok(warp::sse::reply(warp::sse::keep_alive().stream(stream)))
}
