pub mod aggregator;
pub mod alerts;
pub mod arbiter;
pub mod cluster;
pub mod codec;
pub mod config;
pub mod coordinator;
pub mod database;
pub mod error;
pub mod graph;
pub mod leader;
pub mod messaging;
pub mod models;
pub mod routes;
pub mod view;
pub mod worker_processing;
