//! gRPC client for the remote decision service.

use std::time::Duration;

use async_trait::async_trait;
use tonic::client::Grpc;
use tonic::codec::ProstCodec;
use tonic::codegen::http::uri::PathAndQuery;
use tonic::metadata::MetadataValue;
use tonic::transport::{Channel, Endpoint};
use tracing::{debug, instrument};

use super::proto::{conclusion_from_wire, DecideRequest, DecideResponse, RuleResultMessage};
use crate::decision::{RemoteDecider, RemoteRequest, RemoteResponse, RuleResult};
use crate::error::{ArbiterError, Result};

const DECIDE_PATH: &str = "/arbiter.decide.v1.DecideService/Decide";
const SITE_HEADER: &str = "x-arbiter-site";

/// [`RemoteDecider`] speaking the `DecideService` protocol over a tonic
/// channel.
#[derive(Clone)]
pub struct GrpcRemote {
    client: Grpc<Channel>,
    site: String,
}

impl GrpcRemote {
    /// Create a client that connects on first use. Must be called from
    /// within a Tokio runtime.
    pub fn connect_lazy(url: &str, site: impl Into<String>, timeout: Duration) -> Result<Self> {
        let channel = Endpoint::from_shared(url.to_string())?
            .connect_timeout(timeout)
            .timeout(timeout)
            .connect_lazy();
        Ok(Self::new(channel, site))
    }

    pub fn new(channel: Channel, site: impl Into<String>) -> Self {
        Self {
            client: Grpc::new(channel),
            site: site.into(),
        }
    }
}

impl From<RemoteRequest> for DecideRequest {
    fn from(request: RemoteRequest) -> Self {
        DecideRequest {
            fingerprint: request.fingerprint,
            rules_digest: request.rules_digest,
            requested: request.requested,
            results: request.results.iter().map(RuleResultMessage::from).collect(),
            sdk_version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}

impl TryFrom<DecideResponse> for RemoteResponse {
    type Error = ArbiterError;

    fn try_from(response: DecideResponse) -> Result<Self> {
        let results = response
            .results
            .into_iter()
            .map(RuleResult::try_from)
            .collect::<Result<Vec<_>>>()?;
        Ok(RemoteResponse {
            id: response.id,
            conclusion: conclusion_from_wire(response.conclusion)?,
            results,
            country: Some(response.country).filter(|c| !c.is_empty()),
        })
    }
}

#[async_trait]
impl RemoteDecider for GrpcRemote {
    #[instrument(skip(self, request), fields(results = request.results.len()))]
    async fn decide(&self, request: RemoteRequest) -> Result<RemoteResponse> {
        let mut client = self.client.clone();
        client
            .ready()
            .await
            .map_err(|e| ArbiterError::Remote(format!("service not ready: {}", e)))?;

        let mut grpc_request = tonic::Request::new(DecideRequest::from(request));
        let site = MetadataValue::try_from(self.site.as_str())
            .map_err(|_| ArbiterError::InvalidInput(format!("invalid site key {:?}", self.site)))?;
        grpc_request.metadata_mut().insert(SITE_HEADER, site);

        let codec: ProstCodec<DecideRequest, DecideResponse> = ProstCodec::default();
        let response = client
            .unary(grpc_request, PathAndQuery::from_static(DECIDE_PATH), codec)
            .await?
            .into_inner();

        debug!(id = %response.id, results = response.results.len(), "Decide call completed");
        RemoteResponse::try_from(response)
    }
}
