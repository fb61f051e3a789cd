pub mod config;
pub mod driver;
pub mod function;
pub mod http_objects;
pub mod metrics;
pub mod routes;
pub mod runner;
pub mod scheduler;
pub mod service;
pub mod tracing;
pub mod utils;

#[cfg(test)]
mod integration_test_http_routes;
#[cfg(test)]
mod testing;
