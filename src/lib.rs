pub mod config;
pub mod db;
pub mod guide;
pub mod ingest;
pub mod llm;
pub mod memory;
pub mod models;
pub mod ollama;
pub mod orchestrator;
pub mod references;
pub mod server;
pub mod store;

#[cfg(test)]
mod test_support;

pub use config::AppConfig;
pub use server::run_server;
