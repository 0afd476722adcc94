pub mod message;

pub use message::{DeleteScope, HistoryCursor, Message, SenderProfile, Visibility};
