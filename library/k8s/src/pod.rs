use k8s_openapi::api::core::v1::{ContainerState, ContainerStateWaiting, Pod, PodStatus};

/// PodExt is an extension trait used to answer common questions about a
/// pod's lifecycle phase. The reaper uses these to decide whether a pod it
/// is considering for deletion is still legitimately running.
pub trait PodExt {
    fn running(&self) -> bool;
    fn crashed(&self) -> bool;
    fn terminated(&self) -> bool;
    fn was_err_image_pull(&self) -> bool;
}

impl PodExt for Pod {
    fn running(&self) -> bool {
        any_container_state(self, |state| state.running.is_some())
    }

    fn terminated(&self) -> bool {
        any_container_state(self, |state| state.terminated.is_some())
    }

    fn was_err_image_pull(&self) -> bool {
        any_container_state(self, |state| is_waiting_reason(state, "ErrImagePull"))
    }

    fn crashed(&self) -> bool {
        any_container_state(self, |state| is_waiting_reason(state, "CrashLoopBackOff"))
    }
}

fn any_container_state<F: Fn(&ContainerState) -> bool>(pod: &Pod, predicate: F) -> bool {
    let default_state = ContainerState::default();
    let default_status = PodStatus::default();
    let default_statuses = vec![];
    pod.status
        .as_ref()
        .unwrap_or(&default_status)
        .container_statuses
        .as_ref()
        .unwrap_or(&default_statuses)
        .iter()
        .any(|status| predicate(status.state.as_ref().unwrap_or(&default_state)))
}

fn is_waiting_reason(state: &ContainerState, reason: &str) -> bool {
    matches!(
        state.waiting.as_ref(),
        Some(ContainerStateWaiting { reason: Some(r), .. }) if r == reason
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::ContainerStatus;

    fn pod_with_state(state: ContainerState) -> Pod {
        let mut pod = Pod::default();
        pod.status = Some(PodStatus {
            container_statuses: Some(vec![ContainerStatus {
                state: Some(state),
                ..Default::default()
            }]),
            ..Default::default()
        });
        pod
    }

    #[test]
    fn no_status_is_not_running() {
        assert!(!Pod::default().running());
    }

    fn running_state() -> ContainerState {
        ContainerState {
            running: Some(k8s_openapi::api::core::v1::ContainerStateRunning::default()),
            ..Default::default()
        }
    }

    #[test]
    fn detects_running() {
        assert!(pod_with_state(running_state()).running());
        assert!(!pod_with_state(running_state()).terminated());
    }

    #[test]
    fn detects_image_pull_error() {
        let state = ContainerState {
            waiting: Some(ContainerStateWaiting {
                reason: Some("ErrImagePull".to_string()),
                message: None,
            }),
            ..Default::default()
        };
        assert!(pod_with_state(state).was_err_image_pull());
    }

    #[test]
    fn detects_crash_loop() {
        let state = ContainerState {
            waiting: Some(ContainerStateWaiting {
                reason: Some("CrashLoopBackOff".to_string()),
                message: None,
            }),
            ..Default::default()
        };
        assert!(pod_with_state(state).crashed());
    }
}
