mod chat_logs;
mod consume_logs;

pub use chat_logs::SqliteChatLogRepo;
pub use consume_logs::SqliteConsumeLogRepo;
