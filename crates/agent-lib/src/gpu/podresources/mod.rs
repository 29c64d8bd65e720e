//! Kubelet PodResources gRPC client: the k8s GPU binding source.
//!
//! The proto types are hand-rolled (same fallback pattern the build script
//! uses when `protoc` isn't available) since the kubelet API surface this
//! crate needs is small — one unary RPC, three message types.

pub mod client;
pub mod proto;

pub use client::PodResourcesClient;
