//! Orchestration of Bayesian neural network posterior-sampling runs.
//!
//! The entry point is [`experiment::Experiment`]: it validates a [`config::RunConfig`], builds
//! the dataset and model, optionally resumes from a checkpoint, runs the selected sampler
//! between scoped sinks, and evaluates the collected samples.

pub mod artifacts;
pub mod checkpoint;
pub mod config;
pub mod data;
pub mod error;
pub mod evaluate;
pub mod experiment;
pub mod hmc;
pub mod model;
pub mod params;
pub mod prior;
pub mod runner;
pub mod schedule;
pub mod sinks;
pub mod stats;
