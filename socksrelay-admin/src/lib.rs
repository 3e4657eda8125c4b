pub mod server;

pub use server::StatusServer;
