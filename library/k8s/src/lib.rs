pub mod client;
pub mod errors;
pub mod pod;
pub mod watcher;

pub use pod::PodExt;

use either::Either;
use errors::ApiError;
use k8s_openapi::api::core::v1::Pod;
use kube::api::{DeleteParams, PropagationPolicy};
use kube::core::response::Status;
use kube::error::ErrorResponse;
use kube::Api;
use result::Result;

/// Deletes the named pod using foreground propagation, the policy the reaper
/// and the per-check runner both rely on so that a delete is never reported
/// as complete while containers are still terminating.
///
/// A 404 from the API server is not an error: the caller's desired end state
/// (no such pod) is already satisfied, so `Either::Right` carries back an
/// empty `Status` rather than forcing every caller to match on 404 itself.
pub async fn delete<I: AsRef<str>>(api: &Api<Pod>, name: I) -> Result<Either<Pod, Status>> {
    Ok(api
        .delete(
            name.as_ref(),
            &DeleteParams {
                dry_run: false,
                grace_period_seconds: None,
                propagation_policy: Some(PropagationPolicy::Foreground),
                preconditions: None,
            },
        )
        .await
        .or_else(|result| match result {
            kube::error::Error::Api(ErrorResponse { code: 404, .. }) => {
                Ok(Either::Right(Status {
                    status: "".to_string(),
                    message: "".to_string(),
                    reason: "".to_string(),
                    details: None,
                    code: 0,
                }))
            }
            err => Err(err),
        })
        .map_err(ApiError::from)?)
}

/// Lists every pod in the given `Api`'s namespace carrying all of `labels`
/// (logical AND across the pairs). Used by the reaper's sweep and by startup
/// adoption of pods left behind by a previous controller process.
pub async fn list_by_labels(
    api: &Api<Pod>,
    labels: &[(&str, &str)],
) -> Result<Vec<Pod>> {
    let selector = labels
        .iter()
        .map(|(k, v)| format!("{}={}", k, v))
        .collect::<Vec<_>>()
        .join(",");
    let lp = kube::api::ListParams::default().labels(&selector);
    Ok(api.list(&lp).await.map_err(ApiError::from)?.items)
}
