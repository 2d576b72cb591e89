pub mod archive;
pub mod config;
pub mod conversation;
pub mod events;
pub mod http_client;
pub mod imagery;
pub mod llm_client;
pub mod memory;
pub mod persona;
pub mod responder;
pub mod runtime;
pub mod scheduler;
pub mod server;
pub mod shutdown;
