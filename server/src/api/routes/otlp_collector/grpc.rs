//! gRPC OTLP collector (streaming RPC transport, spans only)

use std::net::SocketAddr;

use anyhow::Result;
use tokio::sync::watch;
use tonic::transport::Server as TonicServer;
use tonic::{Request, Response, Status};

use opentelemetry_proto::tonic::collector::trace::v1::{
    ExportTraceServiceRequest, ExportTraceServiceResponse,
    trace_service_server::{TraceService, TraceServiceServer},
};

use super::{OtlpState, ingest_trace_request};
use crate::core::config::IngestConfig;
use crate::core::constants::{OTLP_BODY_LIMIT, PROJECT_NAME_HEADER};

pub struct OtlpGrpcServer {
    addr: SocketAddr,
    state: OtlpState,
}

impl OtlpGrpcServer {
    pub fn new(config: &IngestConfig, host: &str, state: OtlpState) -> Result<Self> {
        let addr = SocketAddr::new(host.parse()?, config.grpc_port);
        Ok(Self { addr, state })
    }

    pub async fn start(self, mut shutdown_rx: watch::Receiver<bool>) -> Result<()> {
        let addr = self.addr;
        tracing::debug!(%addr, "Starting OTLP gRPC server");

        TonicServer::builder()
            .add_service(
                TraceServiceServer::new(OtlpTraceService { state: self.state })
                    .max_decoding_message_size(OTLP_BODY_LIMIT)
                    .max_encoding_message_size(OTLP_BODY_LIMIT),
            )
            .serve_with_shutdown(addr, async move {
                let _ = shutdown_rx.wait_for(|&v| v).await;
                tracing::debug!("OTLP gRPC server shutting down");
            })
            .await?;

        Ok(())
    }
}

/// Project override carried in gRPC metadata; `None` falls back to
/// per-resource-group attribute resolution
fn metadata_project_override<T>(request: &Request<T>) -> Option<String> {
    request
        .metadata()
        .get(PROJECT_NAME_HEADER)
        .and_then(|v| v.to_str().ok())
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

/// gRPC trace service
struct OtlpTraceService {
    state: OtlpState,
}

#[tonic::async_trait]
impl TraceService for OtlpTraceService {
    async fn export(
        &self,
        request: Request<ExportTraceServiceRequest>,
    ) -> Result<Response<ExportTraceServiceResponse>, Status> {
        let project = metadata_project_override(&request);
        let req = request.into_inner();

        let accepted = ingest_trace_request(&self.state, &req, project);
        tracing::debug!(spans = accepted, "Accepted gRPC trace export");

        Ok(Response::new(ExportTraceServiceResponse {
            partial_success: None,
        }))
    }
}
