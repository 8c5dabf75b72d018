pub mod appender;
pub mod record;

pub use appender::{scan_and_repair, LogAppender, WalAppender};
