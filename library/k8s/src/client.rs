use crate::errors::ApiError;
use async_trait::async_trait;
use error::*;
use futures::stream::StreamExt;
use k8s_openapi::api::core::v1::Pod;
use kube::api::LogParams;
use kube::core::Resource;
use kube::Api;
use kube::ResourceExt;
use std::path::Path;
use tokio::io::BufWriter;
use tokio_util::io::StreamReader;

/// Returns a new Kubernetes client scoped to the given namespace.
///
/// This function panics if there is any error encountered while constructing
/// the required configuration object from the environment. A missing
/// Kubernetes environment is extremely terminal for a controller process —
/// there is no alternative besides crashing.
///
/// Bounded only by `Resource`, not `k8s_openapi::Metadata`, so this admits
/// `kube::CustomResource`-derived types (which never implement `Metadata`,
/// that trait is generated only for k8s-openapi's own built-ins) alongside
/// `Pod`/`Lease`.
pub async fn new_namespaced<K, N>(namespace: N) -> Api<K>
where
    K: Resource,
    <K as Resource>::DynamicType: Default,
    N: AsRef<str>,
{
    Api::namespaced(default_client().await, namespace.as_ref())
}

/// Returns a new Kubernetes client for cluster-scoped resources, or for
/// namespaced resources the caller intends to list/watch across every
/// namespace (the leader-election `Lease`, and the reaper's cluster-wide
/// pod sweep when the controller is not scoped to a single namespace).
pub async fn new_cluster_scoped<K>() -> Api<K>
where
    K: Resource,
    <K as Resource>::DynamicType: Default,
{
    Api::all(default_client().await)
}

async fn default_client() -> kube::Client {
    kube::Client::try_default()
        .await
        .map_err(ApiError::from)
        .expect("could not construct a Kubernetes client from the ambient environment")
}

#[async_trait]
pub trait Logs<T> {
    async fn stream_into<P: AsRef<Path> + Send>(&self, resource: &T, dst: P);
}

#[async_trait]
impl Logs<Pod> for Api<Pod> {
    async fn stream_into<P: AsRef<Path> + Send>(&self, resource: &Pod, dst: P) {
        let lp = &LogParams {
            container: None,
            follow: true,
            limit_bytes: None,
            pretty: false,
            previous: false,
            since_seconds: None,
            tail_lines: None,
            timestamps: false,
        };
        let stream = self
            .log_stream(resource.name().as_str(), lp)
            .await
            .unwrap()
            .map(|err| match err {
                Err(err) => Err(StreamError::from(err)),
                Ok(buf) => Ok(buf),
            });
        let mut src = StreamReader::new(stream);
        let mut dst = BufWriter::new(tokio::fs::File::create(dst).await.unwrap());
        let _ = tokio::io::copy(&mut src, &mut dst).await;
    }
}

#[derive(Error, Debug)]
#[error("this is hard")]
struct StreamError {
    #[from]
    cause: kube::Error,
}

impl Into<std::io::Error> for StreamError {
    fn into(self) -> std::io::Error {
        std::io::Error::new(std::io::ErrorKind::BrokenPipe, self)
    }
}
