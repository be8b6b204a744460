pub mod app;
pub mod cancel;
pub mod config;
pub mod confirm;
pub mod domain;
pub mod error;
pub mod extract;
pub mod fetch;
pub mod manifest;
pub mod output;
pub mod pool;
pub mod reconcile;
pub mod scratch;
pub mod selection;
pub mod summary;
pub mod throttle;
pub mod tui;
