//! Unix-domain-socket gRPC client for the kubelet PodResources API.
//!
//! kubelet never listens on TCP for this endpoint; the channel is built
//! over a fixed dummy authority with a connector that dials the configured
//! socket path regardless of the URI tonic hands it, the standard pattern
//! for UDS-backed tonic clients.

use super::proto::{ListPodResourcesRequest, ListPodResourcesResponse};
use anyhow::{Context, Result};
use http::Uri;
use std::path::{Path, PathBuf};
use tonic::codec::ProstCodec;
use tonic::transport::{Channel, Endpoint};
use tower::service_fn;

pub struct PodResourcesClient {
    inner: tonic::client::Grpc<Channel>,
}

impl PodResourcesClient {
    /// Connects to the kubelet PodResources socket at `socket_path`. The
    /// connection is established lazily on first RPC, matching kubelet's
    /// own socket lifecycle expectations (it may not exist until the
    /// kubelet has started device plugin registration).
    pub async fn connect(socket_path: impl AsRef<Path>) -> Result<Self> {
        let socket_path: PathBuf = socket_path.as_ref().to_path_buf();
        let channel = Endpoint::try_from("http://[::]:50051")
            .context("building kubelet podresources endpoint")?
            .connect_with_connector(service_fn(move |_: Uri| {
                let socket_path = socket_path.clone();
                async move { tokio::net::UnixStream::connect(socket_path).await }
            }))
            .await
            .context("connecting to kubelet podresources socket")?;

        Ok(Self {
            inner: tonic::client::Grpc::new(channel),
        })
    }

    pub async fn list_pod_resources(&mut self) -> Result<ListPodResourcesResponse> {
        self.inner.ready().await.context("kubelet podresources channel not ready")?;
        let codec = ProstCodec::default();
        let path = http::uri::PathAndQuery::from_static("/v1.PodResourcesLister/ListPodResources");
        let request = tonic::Request::new(ListPodResourcesRequest {});
        let response = self
            .inner
            .unary(request, path, codec)
            .await
            .context("ListPodResources RPC failed")?;
        Ok(response.into_inner())
    }
}
