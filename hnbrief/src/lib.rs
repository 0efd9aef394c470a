// Library interface for hnbrief modules
// This allows tests and the binary to import modules

pub mod chat;
pub mod conversations;
pub mod crawler;
pub mod digest;
pub mod error;
pub mod ingestion;
pub mod llm;
pub mod mailer;
pub mod scheduler;
pub mod scraping;
pub mod server;
pub mod storage;
