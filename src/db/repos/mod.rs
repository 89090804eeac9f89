mod chat_logs;
mod consume_logs;

pub use chat_logs::*;
pub use consume_logs::*;
