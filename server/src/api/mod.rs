//! HTTP and gRPC API layer

pub mod routes;
pub mod server;

pub use routes::otlp_collector::{OtlpGrpcServer, OtlpState};
pub use server::ApiServer;
