pub mod auth;
pub mod backend;
pub mod concurrency;
pub mod config;
pub mod parsers;
pub mod proxy;
pub mod router;
pub mod sse;
pub mod store;
pub mod telemetry;
pub mod upstream;
