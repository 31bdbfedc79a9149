//! Infrastructure Layer - Adapters and external integrations.
//!
//! This layer contains the concrete implementations of the port interfaces
//! defined in the application layer, plus the process-level plumbing.

/// Configuration loaded from the environment.
pub mod config;

/// Market data source adapters.
pub mod exchange;

/// Health check HTTP endpoint.
pub mod health;

/// Prometheus metrics instrumentation.
pub mod metrics;

/// Storage backend adapters.
pub mod storage;

/// Logging and OpenTelemetry tracing.
pub mod telemetry;
