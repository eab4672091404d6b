pub mod adapters;
pub mod configuration;
pub mod core;
pub mod deduplication;
pub mod dispatcher;
pub mod error;
pub mod observability;
pub mod processor;
