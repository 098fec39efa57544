pub mod handlers;
pub mod metrics;
pub mod server;
pub mod tls;

pub use server::{build_router, serve, TlsPaths};
