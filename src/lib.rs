pub mod cloud;
pub mod config;
pub mod cost;
pub mod database;
pub mod engine;
pub mod error;
pub mod events;
pub mod load_balancer;
pub mod messaging;
pub mod models;
pub mod orchestrator;
pub mod routes;
pub mod storage;
pub mod task_queue;
pub mod worker_manager;
