//! Kafka-lens library exports

pub mod aggregator;
pub mod batch;
pub mod cache;
pub mod config;
pub mod error;
pub mod executor;
pub mod facade;
pub mod health;
pub mod models;
pub mod query;
pub mod routes;
pub mod services;
pub mod state;
pub mod tasks;
