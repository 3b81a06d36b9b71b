mod connection;
mod protocol;
mod routes;
mod server;
mod state;

pub use protocol::StreamFrame;
pub use server::{router, GatewayServer};
pub use state::AppState;
