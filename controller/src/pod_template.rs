//! Materializes a CheckerPod from a HealthCheck's `podSpec`, injecting the
//! controller-identifying labels and the deadline-propagation env vars every
//! checker pod contract relies on.

use crate::crd::{HealthCheck, HealthCheckSpec};
use crate::labels::{ANNOTATION_CHECK_NAME, LABEL_CHECK, LABEL_CONTROLLER, LABEL_NAMESPACE, LABEL_UUID};
use k8s_openapi::api::core::v1::{EnvVar, OwnerReference, Pod};
use kube::ResourceExt;
use std::collections::BTreeMap;

/// Name of the fixed ingest path; the reporting URL handed to checker pods
/// always ends in this path.
pub const INGEST_PATH: &str = "/check";

pub struct PodTemplateParams<'a> {
    pub controller_id: &'a str,
    pub reporting_base_url: &'a str,
    pub run_uuid: &'a str,
    pub deadline_unix: i64,
}

/// Builds the Pod that will be submitted to the API server for one run of
/// `check`. The controller's own labels always win over user-supplied
/// `extraLabels` of the same key, so a run's single-flight identity can never
/// be shadowed by the HealthCheck author.
pub fn materialize(check: &HealthCheck, spec: &HealthCheckSpec, params: &PodTemplateParams) -> Pod {
    let namespace = check.namespace().unwrap_or_default();
    let name = check.name_any();

    let mut pod = Pod {
        metadata: spec.pod_spec.metadata.clone().unwrap_or_default(),
        spec: spec.pod_spec.spec.clone(),
        status: None,
    };

    pod.metadata.namespace = Some(namespace.clone());
    pod.metadata.name = Some(names::rfc1123_subdomain(&name));

    let mut labels: BTreeMap<String, String> = spec.extra_labels.clone();
    labels.insert(LABEL_CONTROLLER.to_string(), params.controller_id.to_string());
    labels.insert(LABEL_CHECK.to_string(), name.clone());
    labels.insert(LABEL_NAMESPACE.to_string(), namespace.clone());
    labels.insert(LABEL_UUID.to_string(), params.run_uuid.to_string());
    pod.metadata.labels = Some(labels);

    let mut annotations: BTreeMap<String, String> = spec.extra_annotations.clone();
    annotations.insert(ANNOTATION_CHECK_NAME.to_string(), name.clone());
    pod.metadata.annotations = Some(annotations);

    pod.metadata.owner_references = Some(vec![OwnerReference {
        api_version: "healthcheck.example.com/v1".to_string(),
        kind: "HealthCheck".to_string(),
        name: name.clone(),
        uid: check.uid().unwrap_or_default(),
        controller: Some(true),
        block_owner_deletion: Some(true),
    }]);

    let env = vec![
        EnvVar {
            name: "KH_REPORTING_URL".to_string(),
            value: Some(format!(
                "{}{}",
                params.reporting_base_url.trim_end_matches('/'),
                INGEST_PATH
            )),
            value_from: None,
        },
        EnvVar {
            name: "KH_RUN_UUID".to_string(),
            value: Some(params.run_uuid.to_string()),
            value_from: None,
        },
        EnvVar {
            name: "KH_CHECK_RUN_DEADLINE".to_string(),
            value: Some(params.deadline_unix.to_string()),
            value_from: None,
        },
    ];

    if let Some(pod_spec) = pod.spec.as_mut() {
        for container in pod_spec.containers.iter_mut() {
            let existing = container.env.get_or_insert_with(Vec::new);
            for var in &env {
                existing.push(var.clone());
            }
        }
    }

    pod
}

/// Builds the label selector that uniquely identifies every pod backing one
/// run.
pub fn run_label_selector(controller_id: &str, namespace: &str, check: &str, uuid: &str) -> String {
    format!(
        "{}={},{}={},{}={},{}={}",
        LABEL_CONTROLLER, controller_id, LABEL_NAMESPACE, namespace, LABEL_CHECK, check, LABEL_UUID, uuid
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::HealthCheckSpec;
    use k8s_openapi::api::core::v1::{Container, PodSpec, PodTemplateSpec};
    use kube::api::ObjectMeta;

    fn sample_check() -> HealthCheck {
        let mut check = HealthCheck::new(
            "demo",
            HealthCheckSpec {
                run_interval_seconds: 60,
                timeout_seconds: 10,
                single_run: false,
                extra_labels: BTreeMap::new(),
                extra_annotations: BTreeMap::new(),
                pod_spec: PodTemplateSpec {
                    metadata: Some(ObjectMeta::default()),
                    spec: Some(PodSpec {
                        containers: vec![Container {
                            name: "checker".to_string(),
                            image: Some("busybox".to_string()),
                            ..Default::default()
                        }],
                        ..Default::default()
                    }),
                },
            },
        );
        check.metadata.namespace = Some("kh".to_string());
        check
    }

    #[test]
    fn injects_all_three_env_vars() {
        let check = sample_check();
        let pod = materialize(
            &check,
            &check.spec,
            &PodTemplateParams {
                controller_id: "ctrl-1",
                reporting_base_url: "http://kuberhealthy.kuberhealthy",
                run_uuid: "abc-123",
                deadline_unix: 1000,
            },
        );
        let env = pod.spec.unwrap().containers[0].env.clone().unwrap();
        let names: Vec<_> = env.iter().map(|e| e.name.as_str()).collect();
        assert!(names.contains(&"KH_REPORTING_URL"));
        assert!(names.contains(&"KH_RUN_UUID"));
        assert!(names.contains(&"KH_CHECK_RUN_DEADLINE"));
    }

    #[test]
    fn reporting_url_ends_in_ingest_path() {
        let check = sample_check();
        let pod = materialize(
            &check,
            &check.spec,
            &PodTemplateParams {
                controller_id: "ctrl-1",
                reporting_base_url: "http://kuberhealthy.kuberhealthy/",
                run_uuid: "abc-123",
                deadline_unix: 1000,
            },
        );
        let env = pod.spec.unwrap().containers[0].env.clone().unwrap();
        let url = env.iter().find(|e| e.name == "KH_REPORTING_URL").unwrap();
        assert!(url.value.as_ref().unwrap().ends_with("/check"));
    }

    #[test]
    fn controller_labels_win_over_extra_labels() {
        let mut check = sample_check();
        check
            .spec
            .extra_labels
            .insert(LABEL_CONTROLLER.to_string(), "someone-else".to_string());
        let pod = materialize(
            &check,
            &check.spec,
            &PodTemplateParams {
                controller_id: "ctrl-1",
                reporting_base_url: "http://x",
                run_uuid: "u",
                deadline_unix: 1,
            },
        );
        assert_eq!(
            pod.metadata.labels.unwrap().get(LABEL_CONTROLLER).unwrap(),
            "ctrl-1"
        );
    }
}
