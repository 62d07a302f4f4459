//! Orchestrator for one-shot containerized workloads on Kubernetes.
//!
//! A client submits a job specification (image, environment, resources,
//! optional zipped input); the orchestrator stages the cluster resource
//! graph, runs the workload, archives anything written to the output volume
//! into object storage, and reclaims every provisioned resource, surfacing a
//! single lifecycle status through the HTTP API.

pub mod cluster;
pub mod config;
pub mod db;
pub mod dispatcher;
pub mod error;
pub mod handlers;
pub mod lifecycle;
pub mod models;
pub mod reconciler;
pub mod repository;
pub mod server;
pub mod storage;

pub use config::Config;
pub use error::{Error, Result};
