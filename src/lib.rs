pub mod agents;
pub mod auth;
pub mod chunker;
pub mod classifier;
pub mod config;
pub mod conversations;
pub mod embedder;
pub mod employees;
pub mod error;
pub mod extract;
pub mod folders;
pub mod index;
pub mod jobs;
pub mod llm;
pub mod models;
pub mod rag;
pub mod routes;
pub mod s3;
pub mod schema;
pub mod state;
pub mod storage;
pub mod workers;

pub use workers::{default_handlers, JobExecution, JobHandler, Worker};
