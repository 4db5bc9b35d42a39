//! Dashboard client protocol and the WebSocket session pump.

mod handler;
mod message;

pub use handler::ws_handler;
pub use message::*;
