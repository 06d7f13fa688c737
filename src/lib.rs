//! Résumé Screening API Client
//!
//! This library provides the authenticated HTTP client used by the screening
//! console, with automatic token refresh, and the orchestrator that submits
//! bulk AI-evaluation jobs and tracks them to completion by polling.

pub mod app_state;
pub mod config;
pub mod models;
pub mod services;
