pub mod chat_log;
mod consume_log;

pub use chat_log::*;
pub use consume_log::*;
