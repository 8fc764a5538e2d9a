pub mod connection;
pub mod identity;
pub mod message;
pub mod protocol;

pub use protocol::{ws_handler, AppState};
