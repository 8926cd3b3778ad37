//! Library crate for the timer-rooms client, exposing modules for binaries and integration tests.

/// Runtime configuration.
pub mod config;
/// Token persistence.
pub mod dao;
/// Wire payloads exchanged with the backend.
pub mod dto;
/// Error types shared across the client.
pub mod error;
/// REST client, session reconciliation, checkout polling and room connections.
pub mod services;
/// Static sitemap generation.
pub mod sitemap;
/// Session and room state owned by the client.
pub mod state;
