pub mod config;
pub mod dispatch;
pub mod engine;
pub mod error;
pub mod feed;
pub mod form_cache;
pub mod health;
pub mod ingest;
pub mod model;
pub mod pipeline;
pub mod store;
