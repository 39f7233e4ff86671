//! Fleet provisioning orchestrator for bare metal machines.
//!
//! This crate drives machines through a multi-step lifecycle against a
//! MAAS-style provisioning service: locate or enlist, configure power,
//! BIOS metadata, boot order and storage, commission, build VLAN-driven
//! network bonds, deploy, release, delete. The remote operations are
//! asynchronous and polling-based; the value here is the orchestration
//! layer on top of them.
//!
//! # Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use foundry::maas::MaasClient;
//! use foundry::config::WorkflowConfig;
//! use foundry::workflow::WorkflowEngine;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = WorkflowConfig::load(std::path::Path::new("fleet.json"))?;
//!     let client = Arc::new(MaasClient::new(&config.api_url, &config.api_key)?);
//!
//!     let (_shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
//!     let engine = WorkflowEngine::new(client, config, shutdown_rx);
//!     let summary = engine.run().await;
//!     summary.print();
//!     Ok(())
//! }
//! ```

#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod client;
pub mod config;
pub mod maas;
pub mod machine;
pub mod network;
pub mod pipeline;
pub mod poll;
pub mod report;
pub mod retry;
pub mod storage;
pub mod workflow;

pub use client::{ClientError, ProvisionClient};
pub use config::{Action, ActionSet, WorkflowConfig};
pub use machine::{MachineRecord, MachineState};
pub use pipeline::{MachinePipeline, PipelineOutcome};
pub use poll::{PollError, PollSpec};
pub use report::WorkflowSummary;
pub use retry::RetryPolicy;
pub use workflow::WorkflowEngine;
