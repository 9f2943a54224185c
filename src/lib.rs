//! HealthTrail - health-check scheduling, state evaluation and tiered history.

pub mod aggregation;
pub mod config;
pub mod db;
pub mod health;
pub mod history;
pub mod notify;
pub mod probe;
pub mod queue;
pub mod scheduler;
pub mod versioning;
pub mod web;
