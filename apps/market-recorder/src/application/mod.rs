//! Application Layer - Pipeline services and port definitions.
//!
//! This layer wires the domain transformations to the outside world
//! through ports, and owns the long-running tasks of the pipeline.

/// Port interfaces for external systems (market data source, storage).
pub mod ports;

/// Pipeline services: collector, queues, writers, supervisor.
pub mod services;
