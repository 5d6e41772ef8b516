//! KYC Flow: multi-step onboarding workflow engine.

pub mod config;
pub mod error;
pub mod events;
pub mod routes;
pub mod store;
pub mod workflow;
