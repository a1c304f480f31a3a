//! Mail Triage: email classification, order tracking and reply drafting.

pub mod api;
pub mod batch;
pub mod config;
pub mod currency;
pub mod error;
pub mod llm;
pub mod pipeline;
pub mod resilience;
pub mod store;
