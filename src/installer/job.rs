//! Download Job assembly
//!
//! One Job per (agent image, node) pair downloads the code modules onto the
//! node-local CSI data directory. The Job name is a pure function of that
//! pair, so concurrent installers and retries converge on the same object
//! instead of creating duplicates.

use std::collections::BTreeMap;
use std::path::Path;

use k8s_openapi::api::batch::v1::Job;
use k8s_openapi::api::core::v1::{Container, HostPathVolumeSource, Volume, VolumeMount};

use crate::crd::DynaKube;
use crate::kubeobjects::builder::{
    build, job_active_deadline_seconds, job_automount_service_account_token, job_container,
    job_node_name, job_pod_annotations, job_pod_labels, job_pull_secrets,
    job_restart_policy_on_failure, job_service_account, job_tolerations,
    job_ttl_seconds_after_finished, job_volumes, with_name, with_namespace,
};
use crate::kubeobjects::hash::hash_bytes;
use crate::settings::JobSettings;
use crate::{
    Result, APP_COMPONENT_CODE_MODULE, APP_MANAGED_BY_LABEL, APP_NAME_LABEL, INJECT_ANNOTATION,
};

/// Prefix of every download Job name
pub const JOB_NAME_PREFIX: &str = "codemodule-download-";

/// Service account the download pod runs under; pre-provisioned by Helm with
/// exactly the host-path permissions the download needs
pub const CSI_PROVISIONER_SERVICE_ACCOUNT: &str = "dynatrace-csi-provisioner";

/// Where the agent image ships its code modules
const SOURCE_DIR: &str = "/opt/dynatrace/oneagent";

/// Volume name of the node-local data directory
const DATA_VOLUME: &str = "data-dir";

/// A failed download attempt is abandoned after this long
const ACTIVE_DEADLINE_SECONDS: i64 = 600;

/// Finished Jobs linger briefly for log inspection, then get collected
const TTL_SECONDS_AFTER_FINISHED: i32 = 10;

/// Content-addressed Job name for one (image, node) pair
pub fn job_name(image_uri: &str, node_name: &str) -> String {
    format!(
        "{JOB_NAME_PREFIX}{}",
        hash_bytes(format!("{image_uri}||{node_name}").as_bytes())
    )
}

/// Assemble the download Job, owned by the DynaKube so it is collected when
/// the CR goes away
#[allow(clippy::too_many_arguments)]
pub fn build_download_job(
    dynakube: &DynaKube,
    namespace: &str,
    image_uri: &str,
    node_name: &str,
    csi_data_dir: &Path,
    target_dir: &Path,
    work_dir: &Path,
    settings: &JobSettings,
) -> Result<Job> {
    use kube::ResourceExt;

    let mut labels = BTreeMap::from([
        (
            APP_NAME_LABEL.to_string(),
            APP_COMPONENT_CODE_MODULE.to_string(),
        ),
        (APP_MANAGED_BY_LABEL.to_string(), dynakube.name_any()),
    ]);
    labels.extend(settings.labels.clone());

    // the download pod must never be injected by our own webhook
    let mut annotations = BTreeMap::from([(INJECT_ANNOTATION.to_string(), "false".to_string())]);
    annotations.extend(settings.annotations.clone());

    let container = Container {
        name: "codemodule-download".to_string(),
        image: Some(image_uri.to_string()),
        image_pull_policy: Some("IfNotPresent".to_string()),
        args: Some(vec![
            format!("--source={SOURCE_DIR}"),
            format!("--target={}", target_dir.display()),
            format!("--work={}", work_dir.display()),
        ]),
        security_context: settings.security_context.clone(),
        resources: settings.resources.clone(),
        volume_mounts: Some(vec![VolumeMount {
            name: DATA_VOLUME.to_string(),
            mount_path: csi_data_dir.display().to_string(),
            ..Default::default()
        }]),
        ..Default::default()
    };

    let data_volume = Volume {
        name: DATA_VOLUME.to_string(),
        host_path: Some(HostPathVolumeSource {
            path: csi_data_dir.display().to_string(),
            type_: Some("Directory".to_string()),
        }),
        ..Default::default()
    };

    build(
        Some(dynakube),
        Job::default(),
        vec![
            with_name(job_name(image_uri, node_name)),
            with_namespace(namespace),
            job_pod_labels(labels),
            job_pod_annotations(annotations),
            job_container(container),
            job_volumes(vec![data_volume]),
            job_node_name(node_name),
            job_service_account(CSI_PROVISIONER_SERVICE_ACCOUNT),
            job_automount_service_account_token(false),
            job_restart_policy_on_failure(),
            job_tolerations(settings.tolerations.clone()),
            job_pull_secrets(dynakube.spec.custom_pull_secret.clone()),
            job_active_deadline_seconds(ACTIVE_DEADLINE_SECONDS),
            job_ttl_seconds_after_finished(TTL_SECONDS_AFTER_FINISHED),
        ],
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::DynaKubeSpec;
    use std::path::PathBuf;

    fn installed_dynakube() -> DynaKube {
        let mut dk = DynaKube::new(
            "dynakube",
            DynaKubeSpec {
                custom_pull_secret: vec!["registry-pull".to_string()],
                ..Default::default()
            },
        );
        dk.metadata.namespace = Some("dynatrace".into());
        dk.metadata.uid = Some("uid-1".into());
        dk
    }

    #[test]
    fn name_is_stable_and_collision_scoped_to_the_pair() {
        let a = job_name("registry.example.com/oneagent:1.2.3", "node-1");
        let b = job_name("registry.example.com/oneagent:1.2.3", "node-1");
        let other_node = job_name("registry.example.com/oneagent:1.2.3", "node-2");
        let other_image = job_name("registry.example.com/oneagent:1.2.4", "node-1");

        assert_eq!(a, b);
        assert_ne!(a, other_node);
        assert_ne!(a, other_image);
        assert!(a.starts_with(JOB_NAME_PREFIX));
        assert!(a.len() <= 63);
    }

    #[test]
    fn job_carries_the_agreed_pod_shape() {
        let settings = JobSettings::from_json(
            r#"{
                "securityContext": {"runAsNonRoot": true},
                "tolerations": [{"key": "node-role.kubernetes.io/master", "operator": "Exists"}],
                "labels": {"custom": "value"}
            }"#,
        );

        let job = build_download_job(
            &installed_dynakube(),
            "dynatrace",
            "registry.example.com/oneagent:1.2.3",
            "node-1",
            &PathBuf::from("/data"),
            &PathBuf::from("/data/codemodules/1.2.3"),
            &PathBuf::from("/data/work/1.2.3"),
            &settings,
        )
        .unwrap();

        let spec = job.spec.as_ref().unwrap();
        assert_eq!(spec.active_deadline_seconds, Some(600));
        assert_eq!(spec.ttl_seconds_after_finished, Some(10));

        let pod_spec = spec.template.spec.as_ref().unwrap();
        assert_eq!(pod_spec.node_name.as_deref(), Some("node-1"));
        assert_eq!(pod_spec.automount_service_account_token, Some(false));
        assert_eq!(
            pod_spec.service_account_name.as_deref(),
            Some(CSI_PROVISIONER_SERVICE_ACCOUNT)
        );
        assert_eq!(pod_spec.restart_policy.as_deref(), Some("OnFailure"));
        assert_eq!(pod_spec.tolerations.as_ref().unwrap().len(), 1);
        assert_eq!(
            pod_spec.image_pull_secrets.as_ref().unwrap()[0].name,
            "registry-pull"
        );

        let container = &pod_spec.containers[0];
        assert_eq!(
            container.args.as_ref().unwrap(),
            &vec![
                "--source=/opt/dynatrace/oneagent".to_string(),
                "--target=/data/codemodules/1.2.3".to_string(),
                "--work=/data/work/1.2.3".to_string(),
            ]
        );
        assert_eq!(
            container.security_context.as_ref().unwrap().run_as_non_root,
            Some(true)
        );

        let volume = &pod_spec.volumes.as_ref().unwrap()[0];
        assert_eq!(volume.host_path.as_ref().unwrap().path, "/data");

        let template_meta = spec.template.metadata.as_ref().unwrap();
        assert_eq!(
            template_meta
                .annotations
                .as_ref()
                .unwrap()
                .get(INJECT_ANNOTATION),
            Some(&"false".to_string())
        );
        let labels = template_meta.labels.as_ref().unwrap();
        assert_eq!(
            labels.get(APP_NAME_LABEL),
            Some(&APP_COMPONENT_CODE_MODULE.to_string())
        );
        assert_eq!(labels.get("custom"), Some(&"value".to_string()));

        let owner = &job.metadata.owner_references.as_ref().unwrap()[0];
        assert_eq!(owner.uid, "uid-1");
    }
}
