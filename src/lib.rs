pub mod chat;
pub mod config;
pub mod db;
pub mod models;
pub mod openai;
pub mod prompt;
pub mod server;
pub mod tutor;

pub use config::AppConfig;
pub use server::run_server;
