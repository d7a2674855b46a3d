pub mod auth;
pub mod chat;
pub mod config;
pub mod db;
pub mod gemini;
pub mod ingest;
pub mod models;
pub mod ollama;
pub mod providers;
pub mod qdrant_store;
pub mod rag;
pub mod retrieval;
pub mod server;

#[cfg(test)]
mod testing;

pub use config::AppConfig;
pub use server::run_server;
