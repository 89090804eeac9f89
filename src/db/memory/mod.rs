//! In-process repositories used when no database is configured.

mod chat_logs;
mod consume_logs;

pub use chat_logs::MemoryChatLogRepo;
pub use consume_logs::MemoryConsumeLogRepo;
