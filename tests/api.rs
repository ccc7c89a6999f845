use std::sync::Arc;

use chrono::{DateTime, TimeDelta, TimeZone, Utc};
use logmesh::codec::encode;
use logmesh::config::ProtocolConfig;
use logmesh::coordinator::Observer;
use logmesh::messaging::MemoryChannel;
use logmesh::models::{Announcement, InstanceStatus, Message, Payload, Pulse};
use logmesh::routes::routes;
use serde_json::Value;
use tokio_test::assert_ok;
use warp::http::StatusCode;

fn at(secs: i64) -> DateTime<Utc> {
  Utc.timestamp_opt(1_700_000_000, 0).unwrap() + TimeDelta::seconds(secs)
}

fn seeded() -> Arc<Observer<MemoryChannel>> {
  let channel = MemoryChannel::new();
  let announce = Message::new(
    "worker-1",
    at(0),
    Payload::NodeAnnounce(Announcement {
      status: InstanceStatus::Active,
      skills: vec!["rust".into()],
      max_concurrent_tasks: 2,
      started_at: at(0),
    }),
  );
  let pulse = Message::new("worker-1", at(1), Payload::Heartbeat(Pulse::default()));
  channel.push_raw(encode(&announce).unwrap());
  channel.push_raw(encode(&pulse).unwrap());
  Arc::new(Observer::new(channel, ProtocolConfig::default()))
}

fn body_json(body: &[u8]) -> Value {
  serde_json::from_slice(body).unwrap()
}

#[tokio::test]
async fn snapshot_is_unavailable_before_the_first_cycle() {
  let api = routes(seeded());
  let res = warp::test::request().method("GET").path("/snapshot").reply(&api).await;
  assert_eq!(res.status(), StatusCode::SERVICE_UNAVAILABLE);

  let res = warp::test::request().method("GET").path("/metrics").reply(&api).await;
  assert_eq!(res.status(), StatusCode::SERVICE_UNAVAILABLE);
}

#[tokio::test]
async fn snapshot_serves_the_latest_cycle() {
  let observer = seeded();
  assert_ok!(observer.reconcile(at(10)).await);
  let api = routes(observer);

  let res = warp::test::request().method("GET").path("/snapshot").reply(&api).await;
  assert_eq!(res.status(), StatusCode::OK);
  let snapshot = body_json(res.body());
  assert_eq!(snapshot["instances"][0]["id"], "worker-1");
  assert_eq!(snapshot["instances"][0]["is_leader"], true);
  assert_eq!(snapshot["metrics"]["active_instances"], 1);
  assert_eq!(snapshot["metrics"]["leader_id"], "worker-1");
  assert_eq!(snapshot["messages"][1]["kind"], "heartbeat");
  assert!(snapshot["alerts"].as_array().unwrap().is_empty());
}

#[tokio::test]
async fn metrics_are_exposed_as_prometheus_text() {
  let observer = seeded();
  assert_ok!(observer.reconcile(at(10)).await);
  let res = warp::test::request().method("GET").path("/metrics").reply(&routes(observer)).await;
  assert_eq!(res.status(), StatusCode::OK);
  assert_eq!(res.headers()["content-type"], "text/plain; version=0.0.4");
  let text = String::from_utf8(res.body().to_vec()).unwrap();
  assert!(text.contains("logmesh_instances_active 1\n"));
  assert!(text.contains("logmesh_tasks_total 0\n"));
}

#[tokio::test]
async fn health_reports_version() {
  let res = warp::test::request().method("GET").path("/health").reply(&routes(seeded())).await;
  assert_eq!(res.status(), StatusCode::OK);
  let health = body_json(res.body());
  assert_eq!(health["status"], "healthy");
  assert_eq!(health["version"], env!("CARGO_PKG_VERSION"));
}

#[tokio::test]
async fn alerts_can_be_dismissed_over_http() {
  let observer = seeded();
  // ten minutes of silence: overdue heartbeat plus everyone dead
  assert_ok!(observer.reconcile(at(600)).await);
  let snapshot = observer.snapshot().unwrap();
  assert_eq!(snapshot.alerts.len(), 2);
  let target = snapshot.alerts[0].id;
  let api = routes(observer.clone());

  let res = warp::test::request()
    .method("POST")
    .path(&format!("/alerts/{target}/dismiss"))
    .reply(&api)
    .await;
  assert_eq!(res.status(), StatusCode::OK);
  let dismissed = observer.snapshot().unwrap();
  assert!(dismissed.alerts.iter().find(|a| a.id == target).unwrap().dismissed);

  let res = warp::test::request()
    .method("POST")
    .path(&format!("/alerts/{}/dismiss", uuid::Uuid::new_v4()))
    .reply(&api)
    .await;
  assert_eq!(res.status(), StatusCode::NOT_FOUND);
}
