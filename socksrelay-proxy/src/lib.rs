pub mod handler;
pub mod keepalive;
pub mod server;

pub use handler::{handle_connection, HandlerContext};
