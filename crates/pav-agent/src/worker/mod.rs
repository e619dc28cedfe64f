//! The shared worker-pod driver.
//!
//! Both plugins run their phases by submitting a pod rendered from the
//! provisioner's template, waiting for a terminal verdict, and reading
//! the side-channel files the worker left under `/pav`. Pod names are a
//! stable hash of (provisioner uid, phase, handle, retry epoch), so a
//! retried phase adopts the live pod instead of spawning a duplicate.

pub mod keyed;

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use k8s_openapi::api::core::v1::{
    Container, EmptyDirVolumeSource, HostPathVolumeSource, Pod, PodTemplateSpec, Volume,
    VolumeMount,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use kube::api::{AttachParams, DeleteParams, Patch, PatchParams, PostParams};
use kube::Api;
use serde_json::Value;
use sha2::{Digest, Sha256};
use tokio::io::AsyncReadExt;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::provisioner::phase::{Phase, SuccessRule};
use crate::{PHASE_LABEL, PROVISIONER_UID_LABEL, UNRECOVERABLE_ANNOTATION, VOLUME_HANDLE_LABEL};

/// Name of the container appended to controller-side workers so their
/// side-channel files outlive the worker container.
const EXPORT_CONTAINER: &str = "pav-export";
/// Name of the volume every worker gets mounted at `/pav`.
const PAV_VOLUME: &str = "pav";

const POLL_INTERVAL: Duration = Duration::from_secs(1);

/// How the `/pav` side-channel is realized for a worker.
pub enum PavVolumeSource<'a> {
    /// An emptyDir shared with an idle export sidecar; files are read
    /// back with a short-lived exec. Used by the controller plugin.
    EmptyDirWithExport,
    /// A per-volume host directory; files are read straight from the
    /// host filesystem. Used by the node plugin.
    HostDir(&'a Path),
}

pub struct WorkerParams<'a> {
    pub phase: Phase,
    pub provisioner_uid: &'a str,
    /// Volume handle when known, otherwise a stable stand-in such as
    /// the claim UID.
    pub handle: &'a str,
    pub retry_epoch: u64,
    /// The evaluated pod template; must deserialize into a pod
    /// template.
    pub template: &'a Value,
    pub owner: Option<OwnerReference>,
    /// Pins the worker to a node (staging and unstaging).
    pub node_name: Option<&'a str>,
    pub pav_volume: PavVolumeSource<'a>,
}

/// What a worker exported through `/pav`.
#[derive(Debug, Default, Clone)]
pub struct SideChannel {
    pub handle: Option<String>,
    pub capacity: Option<i64>,
    pub error: Option<String>,
    pub ready: bool,
}

/// Terminal outcome of one phase invocation.
#[derive(Debug)]
pub struct Verdict {
    pub succeeded: bool,
    /// Exit code of the first failing worker container, or 0.
    pub exit_code: Option<i32>,
    pub side_channel: SideChannel,
    /// True when a staging worker signalled `/pav/ready` and was left
    /// running.
    pub still_running: bool,
    pub pod_name: String,
}

impl Verdict {
    /// The message surfaced to the end user on failure, preferring the
    /// worker's own `/pav/error` diagnostic.
    pub fn failure_message(&self) -> String {
        match (&self.side_channel.error, self.exit_code) {
            (Some(error), _) => error.trim().to_owned(),
            (None, Some(code)) => format!("worker pod exited with code {}", code),
            (None, None) => "worker pod failed".to_owned(),
        }
    }
}

enum Outcome {
    Terminated { succeeded: bool, exit_code: i32 },
    Ready,
}

/// Submits worker pods into a provisioner's namespace and watches them
/// to a verdict.
#[derive(Clone)]
pub struct WorkerPodDriver {
    client: kube::Client,
    namespace: String,
    export_image: String,
}

impl WorkerPodDriver {
    pub fn new(client: kube::Client, namespace: String, export_image: String) -> Self {
        WorkerPodDriver {
            client,
            namespace,
            export_image,
        }
    }

    /// Deterministic worker pod name; at most one live pod per
    /// (phase, handle) follows from name uniqueness plus get-or-create.
    pub fn pod_name(provisioner_uid: &str, phase: Phase, handle: &str, retry_epoch: u64) -> String {
        let mut hasher = Sha256::new();
        hasher.update(provisioner_uid.as_bytes());
        hasher.update([0]);
        hasher.update(phase.as_str().as_bytes());
        hasher.update([0]);
        hasher.update(handle.as_bytes());
        hasher.update([0]);
        hasher.update(retry_epoch.to_be_bytes());
        let digest = hasher.finalize();
        let mut hex = String::with_capacity(10);
        for byte in digest.iter().take(5) {
            hex.push_str(&format!("{:02x}", byte));
        }
        format!("pav-{}-{}", phase.as_str(), hex)
    }

    /// Runs a phase to its verdict: submit (or adopt), wait, read the
    /// side-channel, clean up. The pod outlives the call only when it is
    /// a staging worker that signalled readiness, or a failed worker of
    /// an unrecoverable phase kept for diagnostics.
    pub async fn run_phase(&self, params: WorkerParams<'_>) -> Result<Verdict> {
        let descriptor = params.phase.descriptor();
        let name = Self::pod_name(
            params.provisioner_uid,
            params.phase,
            params.handle,
            params.retry_epoch,
        );

        let pod = self.build_pod(&params, &name)?;
        self.get_or_create(&name, &pod).await?;

        let outcome = match self.wait_for_outcome(&name, &params, descriptor.timeout).await {
            Ok(outcome) => outcome,
            Err(e) => {
                // Timeouts and wait errors release the worker before
                // reporting; a retained pod would block the retry's
                // adoption semantics.
                self.delete_pod(&name).await;
                return Err(e);
            }
        };

        match outcome {
            Outcome::Ready => {
                let side_channel = self.read_side_channel(&name, &params, true).await;
                Ok(Verdict {
                    succeeded: true,
                    exit_code: None,
                    side_channel,
                    still_running: true,
                    pod_name: name,
                })
            }
            Outcome::Terminated {
                succeeded,
                exit_code,
            } => {
                let side_channel = self.read_side_channel(&name, &params, false).await;
                let verdict = Verdict {
                    succeeded,
                    exit_code: Some(exit_code),
                    side_channel,
                    still_running: false,
                    pod_name: name.clone(),
                };
                if succeeded || !descriptor.retain_failed_pod {
                    self.delete_pod(&name).await;
                } else {
                    self.mark_unrecoverable(&name, &verdict.failure_message())
                        .await;
                }
                Ok(verdict)
            }
        }
    }

    /// Deletes a still-running worker (TERM first, then wait until it
    /// is gone). Used when unpublish finds a live staging pod.
    pub async fn terminate(&self, pod_name: &str, timeout: Duration) -> Result<()> {
        let pods: Api<Pod> = Api::namespaced(self.client.clone(), &self.namespace);
        match pods.delete(pod_name, &DeleteParams::default()).await {
            Ok(_) => (),
            Err(kube::Error::Api(ae)) if ae.code == 404 => return Ok(()),
            Err(e) => return Err(e.into()),
        }
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            match pods.get(pod_name).await {
                Err(kube::Error::Api(ae)) if ae.code == 404 => return Ok(()),
                Err(e) => return Err(e.into()),
                Ok(_) if tokio::time::Instant::now() >= deadline => {
                    return Err(Error::Timeout {
                        phase: Phase::Unstaging,
                        timeout,
                    })
                }
                Ok(_) => tokio::time::sleep(POLL_INTERVAL).await,
            }
        }
    }

    fn build_pod(&self, params: &WorkerParams<'_>, name: &str) -> Result<Pod> {
        let path = format!("volume{}.podTemplate", capitalize(params.phase.as_str()));
        let template: PodTemplateSpec = serde_json::from_value(params.template.clone())
            .map_err(|e| Error::template(&path, format!("not a pod template: {}", e)))?;

        let mut metadata = template.metadata.unwrap_or_default();
        let mut spec = template
            .spec
            .ok_or_else(|| Error::template(&path, "pod template has no spec".to_owned()))?;

        metadata.name = Some(name.to_owned());
        metadata.generate_name = None;
        metadata.namespace = Some(self.namespace.clone());
        if let Some(owner) = &params.owner {
            metadata.owner_references = Some(vec![owner.clone()]);
        }

        let labels = metadata.labels.get_or_insert_with(BTreeMap::new);
        labels.insert(PHASE_LABEL.to_owned(), params.phase.as_str().to_owned());
        labels.insert(
            PROVISIONER_UID_LABEL.to_owned(),
            params.provisioner_uid.to_owned(),
        );
        if !params.handle.is_empty() && params.handle.len() <= 63 {
            labels.insert(VOLUME_HANDLE_LABEL.to_owned(), params.handle.to_owned());
        }

        // Worker pods never restart; the phase verdict is one-shot.
        spec.restart_policy = Some("Never".to_owned());
        if let Some(node) = params.node_name {
            spec.node_name = Some(node.to_owned());
        }

        let volumes = spec.volumes.get_or_insert_with(Vec::new);
        if volumes.iter().any(|v| v.name == PAV_VOLUME) {
            return Err(Error::template(
                &path,
                format!("the volume name '{}' is reserved", PAV_VOLUME),
            ));
        }
        let mut propagation = None;
        match &params.pav_volume {
            PavVolumeSource::EmptyDirWithExport => {
                volumes.push(Volume {
                    name: PAV_VOLUME.to_owned(),
                    empty_dir: Some(EmptyDirVolumeSource::default()),
                    ..Default::default()
                });
                spec.containers.push(Container {
                    name: EXPORT_CONTAINER.to_owned(),
                    image: Some(self.export_image.clone()),
                    command: Some(vec![
                        "sh".to_owned(),
                        "-c".to_owned(),
                        "trap 'exit 0' TERM INT; while true; do sleep 1; done".to_owned(),
                    ]),
                    ..Default::default()
                });
            }
            PavVolumeSource::HostDir(dir) => {
                volumes.push(Volume {
                    name: PAV_VOLUME.to_owned(),
                    host_path: Some(HostPathVolumeSource {
                        path: dir.to_string_lossy().into_owned(),
                        type_: Some("DirectoryOrCreate".to_owned()),
                    }),
                    ..Default::default()
                });
                // Mounts made by the worker inside /pav must reach the
                // host (and the node agent).
                propagation = Some("Bidirectional".to_owned());
            }
        }

        for container in spec.containers.iter_mut() {
            let mounts = container.volume_mounts.get_or_insert_with(Vec::new);
            if mounts.iter().any(|m| m.name == PAV_VOLUME) {
                return Err(Error::template(
                    &path,
                    format!("the volume mount name '{}' is reserved", PAV_VOLUME),
                ));
            }
            mounts.push(VolumeMount {
                name: PAV_VOLUME.to_owned(),
                mount_path: "/pav".to_owned(),
                mount_propagation: propagation.clone(),
                ..Default::default()
            });
        }

        Ok(Pod {
            metadata,
            spec: Some(spec),
            ..Default::default()
        })
    }

    async fn get_or_create(&self, name: &str, pod: &Pod) -> Result<()> {
        let pods: Api<Pod> = Api::namespaced(self.client.clone(), &self.namespace);
        match pods.get(name).await {
            Ok(_) => {
                info!(pod = %name, "adopting existing worker pod");
                return Ok(());
            }
            Err(kube::Error::Api(ae)) if ae.code == 404 => (),
            Err(e) => return Err(e.into()),
        }
        match pods.create(&PostParams::default(), pod).await {
            Ok(_) => {
                debug!(pod = %name, "worker pod submitted");
                Ok(())
            }
            // Lost a race against a concurrent retry; adopt its pod.
            Err(kube::Error::Api(ae)) if ae.code == 409 => {
                info!(pod = %name, "adopting concurrently created worker pod");
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn wait_for_outcome(
        &self,
        name: &str,
        params: &WorkerParams<'_>,
        timeout: Duration,
    ) -> Result<Outcome> {
        let pods: Api<Pod> = Api::namespaced(self.client.clone(), &self.namespace);
        let descriptor = params.phase.descriptor();
        let deadline = tokio::time::Instant::now() + timeout;

        loop {
            let pod = pods.get(name).await?;
            if let Some(outcome) = worker_terminal(&pod) {
                return Ok(outcome);
            }

            if descriptor.success == SuccessRule::PodSucceededOrReady {
                if let PavVolumeSource::HostDir(dir) = &params.pav_volume {
                    if tokio::fs::metadata(dir.join("ready")).await.is_ok() {
                        return Ok(Outcome::Ready);
                    }
                }
            }

            if tokio::time::Instant::now() >= deadline {
                return Err(Error::Timeout {
                    phase: params.phase,
                    timeout,
                });
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }
    }

    async fn read_side_channel(
        &self,
        name: &str,
        params: &WorkerParams<'_>,
        ready: bool,
    ) -> SideChannel {
        let mut side_channel = match &params.pav_volume {
            PavVolumeSource::HostDir(dir) => read_host_side_channel(dir).await,
            PavVolumeSource::EmptyDirWithExport => self.read_exec_side_channel(name).await,
        };
        side_channel.ready |= ready;
        side_channel
    }

    async fn read_exec_side_channel(&self, name: &str) -> SideChannel {
        let mut side_channel = SideChannel::default();
        side_channel.handle = self
            .exec_cat(name, "/pav/handle")
            .await
            .map(|s| s.trim().to_owned())
            .filter(|s| !s.is_empty());
        side_channel.capacity = match self.exec_cat(name, "/pav/capacity").await {
            Some(text) => match text.trim().parse::<i64>() {
                Ok(bytes) => Some(bytes),
                Err(_) => {
                    warn!(pod = %name, content = %text.trim(), "ignoring malformed /pav/capacity");
                    None
                }
            },
            None => None,
        };
        side_channel.error = self
            .exec_cat(name, "/pav/error")
            .await
            .filter(|s| !s.trim().is_empty());
        side_channel
    }

    /// Best-effort read of one side-channel file through the export
    /// sidecar. Any failure (pod gone, container gone, missing file)
    /// reads as absence.
    async fn exec_cat(&self, pod_name: &str, path: &str) -> Option<String> {
        let pods: Api<Pod> = Api::namespaced(self.client.clone(), &self.namespace);
        let attach = AttachParams::default()
            .container(EXPORT_CONTAINER)
            .stdout(true)
            .stderr(false);
        let mut process = match pods.exec(pod_name, vec!["cat", path], &attach).await {
            Ok(process) => process,
            Err(e) => {
                debug!(pod = %pod_name, %path, error = %e, "side-channel exec failed");
                return None;
            }
        };
        let mut content = String::new();
        process.stdout()?.read_to_string(&mut content).await.ok()?;
        let _ = process.await;
        if content.is_empty() {
            None
        } else {
            Some(content)
        }
    }

    async fn delete_pod(&self, name: &str) {
        let pods: Api<Pod> = Api::namespaced(self.client.clone(), &self.namespace);
        let dp = DeleteParams {
            grace_period_seconds: Some(0),
            ..Default::default()
        };
        match pods.delete(name, &dp).await {
            Ok(_) => debug!(pod = %name, "worker pod deleted"),
            Err(kube::Error::Api(ae)) if ae.code == 404 => (),
            Err(e) => warn!(pod = %name, error = %e, "failed to delete worker pod"),
        }
    }

    async fn mark_unrecoverable(&self, name: &str, message: &str) {
        let pods: Api<Pod> = Api::namespaced(self.client.clone(), &self.namespace);
        let patch = serde_json::json!({
            "metadata": { "annotations": { UNRECOVERABLE_ANNOTATION: message } }
        });
        if let Err(e) = pods
            .patch(name, &PatchParams::default(), &Patch::Merge(&patch))
            .await
        {
            warn!(pod = %name, error = %e, "failed to annotate retained worker pod");
        } else {
            info!(pod = %name, "worker pod retained for diagnostics");
        }
    }
}

/// Reads the side-channel files from the per-volume host directory.
async fn read_host_side_channel(dir: &Path) -> SideChannel {
    async fn read(path: PathBuf) -> Option<String> {
        tokio::fs::read_to_string(path).await.ok()
    }

    let mut side_channel = SideChannel::default();
    side_channel.handle = read(dir.join("handle"))
        .await
        .map(|s| s.trim().to_owned())
        .filter(|s| !s.is_empty());
    side_channel.capacity =
        read(dir.join("capacity")).await.and_then(|s| s.trim().parse::<i64>().ok());
    side_channel.error = read(dir.join("error")).await.filter(|s| !s.trim().is_empty());
    side_channel.ready = tokio::fs::metadata(dir.join("ready")).await.is_ok();
    side_channel
}

/// Terminal state of the worker containers, ignoring the export
/// sidecar. `None` while any worker container is still pending or
/// running.
fn worker_terminal(pod: &Pod) -> Option<Outcome> {
    let status = pod.status.as_ref()?;

    match status.phase.as_deref() {
        Some("Succeeded") => {
            return Some(Outcome::Terminated {
                succeeded: true,
                exit_code: 0,
            })
        }
        Some("Failed") => {
            let exit_code = first_failure_code(pod).unwrap_or(-1);
            return Some(Outcome::Terminated {
                succeeded: false,
                exit_code,
            });
        }
        _ => (),
    }

    // With an export sidecar the pod stays Running forever; judge the
    // worker containers individually.
    let statuses = status.container_statuses.as_ref()?;
    let expected = pod
        .spec
        .as_ref()?
        .containers
        .iter()
        .filter(|c| c.name != EXPORT_CONTAINER)
        .count();
    let worker_statuses: Vec<_> = statuses
        .iter()
        .filter(|s| s.name != EXPORT_CONTAINER)
        .collect();
    if worker_statuses.len() < expected {
        return None;
    }

    let mut exit_code = 0;
    for container in worker_statuses {
        match container.state.as_ref().and_then(|s| s.terminated.as_ref()) {
            Some(terminated) => {
                if terminated.exit_code != 0 && exit_code == 0 {
                    exit_code = terminated.exit_code;
                }
            }
            None => return None,
        }
    }
    Some(Outcome::Terminated {
        succeeded: exit_code == 0,
        exit_code,
    })
}

fn first_failure_code(pod: &Pod) -> Option<i32> {
    pod.status
        .as_ref()?
        .container_statuses
        .as_ref()?
        .iter()
        .filter(|s| s.name != EXPORT_CONTAINER)
        .filter_map(|s| s.state.as_ref()?.terminated.as_ref())
        .map(|t| t.exit_code)
        .find(|code| *code != 0)
}

fn capitalize(s: &str) -> String {
    let mut chars = s.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().collect::<String>() + chars.as_str(),
        None => String::new(),
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use serde_json::json;

    #[test]
    fn pod_names_are_stable_across_retries() {
        let a = WorkerPodDriver::pod_name("uid-1", Phase::Creation, "vol-1", 0);
        let b = WorkerPodDriver::pod_name("uid-1", Phase::Creation, "vol-1", 0);
        assert_eq!(a, b);
    }

    #[test]
    fn pod_names_distinguish_phase_handle_and_epoch() {
        let base = WorkerPodDriver::pod_name("uid-1", Phase::Creation, "vol-1", 0);
        assert_ne!(
            base,
            WorkerPodDriver::pod_name("uid-1", Phase::Deletion, "vol-1", 0)
        );
        assert_ne!(
            base,
            WorkerPodDriver::pod_name("uid-1", Phase::Creation, "vol-2", 0)
        );
        assert_ne!(
            base,
            WorkerPodDriver::pod_name("uid-1", Phase::Creation, "vol-1", 1)
        );
        assert_ne!(
            base,
            WorkerPodDriver::pod_name("uid-2", Phase::Creation, "vol-1", 0)
        );
    }

    #[test]
    fn pod_names_are_dns_labels() {
        let name = WorkerPodDriver::pod_name("uid", Phase::Unstaging, "UPPER.case_handle", 7);
        assert!(crate::schema::is_dns_label(&name), "{}", name);
        assert!(name.starts_with("pav-unstaging-"));
        assert!(name.len() <= 63);
    }

    fn driver() -> WorkerPodDriver {
        // Building pods never talks to the API server, so an
        // unconnected config is fine here.
        let config = kube::Config::new("http://localhost:8080".parse().unwrap());
        WorkerPodDriver::new(
            kube::Client::try_from(config).unwrap(),
            "pav-test".to_owned(),
            "busybox:1.34".to_owned(),
        )
    }

    fn template() -> Value {
        json!({
            "metadata": { "labels": { "app": "mine" } },
            "spec": { "containers": [
                { "name": "work", "image": "busybox", "command": ["true"] }
            ]}
        })
    }

    #[tokio::test]
    async fn built_pods_get_identity_and_never_restart() {
        let template = template();
        let params = WorkerParams {
            phase: Phase::Creation,
            provisioner_uid: "uid-1",
            handle: "vol-1",
            retry_epoch: 0,
            template: &template,
            owner: None,
            node_name: None,
            pav_volume: PavVolumeSource::EmptyDirWithExport,
        };
        let pod = driver().build_pod(&params, "pav-creation-0123456789").unwrap();

        assert_eq!(pod.metadata.name.as_deref(), Some("pav-creation-0123456789"));
        assert_eq!(pod.metadata.namespace.as_deref(), Some("pav-test"));
        let labels = pod.metadata.labels.unwrap();
        assert_eq!(labels.get("app").unwrap(), "mine");
        assert_eq!(labels.get(PHASE_LABEL).unwrap(), "creation");
        assert_eq!(labels.get(VOLUME_HANDLE_LABEL).unwrap(), "vol-1");

        let spec = pod.spec.unwrap();
        assert_eq!(spec.restart_policy.as_deref(), Some("Never"));
        // Export sidecar appended, and every container mounts /pav.
        assert_eq!(spec.containers.len(), 2);
        assert_eq!(spec.containers[1].name, EXPORT_CONTAINER);
        for container in &spec.containers {
            let mounts = container.volume_mounts.as_ref().unwrap();
            assert!(mounts.iter().any(|m| m.mount_path == "/pav"));
        }
        assert!(spec.volumes.unwrap().iter().any(|v| v.empty_dir.is_some()));
    }

    #[tokio::test]
    async fn staging_pods_pin_to_the_node_and_mount_the_host_dir() {
        let template = template();
        let dir = PathBuf::from("/var/lib/pav/prov/vol-1");
        let params = WorkerParams {
            phase: Phase::Staging,
            provisioner_uid: "uid-1",
            handle: "vol-1",
            retry_epoch: 0,
            template: &template,
            owner: None,
            node_name: Some("node-a"),
            pav_volume: PavVolumeSource::HostDir(&dir),
        };
        let pod = driver().build_pod(&params, "pav-staging-abc").unwrap();
        let spec = pod.spec.unwrap();

        assert_eq!(spec.node_name.as_deref(), Some("node-a"));
        // No sidecar for host-dir workers.
        assert_eq!(spec.containers.len(), 1);
        let volume = &spec.volumes.unwrap()[0];
        assert_eq!(
            volume.host_path.as_ref().unwrap().path,
            "/var/lib/pav/prov/vol-1"
        );
        let mount = &spec.containers[0].volume_mounts.as_ref().unwrap()[0];
        assert_eq!(mount.mount_path, "/pav");
        assert_eq!(mount.mount_propagation.as_deref(), Some("Bidirectional"));
    }

    #[tokio::test]
    async fn reserved_volume_names_are_rejected() {
        let template = json!({
            "spec": {
                "containers": [{ "name": "w" }],
                "volumes": [{ "name": "pav", "emptyDir": {} }]
            }
        });
        let params = WorkerParams {
            phase: Phase::Validation,
            provisioner_uid: "uid",
            handle: "h",
            retry_epoch: 0,
            template: &template,
            owner: None,
            node_name: None,
            pav_volume: PavVolumeSource::EmptyDirWithExport,
        };
        assert!(matches!(
            driver().build_pod(&params, "n").unwrap_err(),
            Error::Template { .. }
        ));
    }

    #[tokio::test]
    async fn templates_without_a_spec_are_rejected() {
        let template = json!({ "metadata": {} });
        let params = WorkerParams {
            phase: Phase::Validation,
            provisioner_uid: "uid",
            handle: "h",
            retry_epoch: 0,
            template: &template,
            owner: None,
            node_name: None,
            pav_volume: PavVolumeSource::EmptyDirWithExport,
        };
        assert!(driver().build_pod(&params, "n").is_err());
    }

    #[test]
    fn terminal_judgement_ignores_the_export_sidecar() {
        let pod: Pod = serde_json::from_value(json!({
            "metadata": {},
            "spec": { "containers": [{ "name": "work" }, { "name": EXPORT_CONTAINER }] },
            "status": {
                "phase": "Running",
                "containerStatuses": [
                    { "name": "work", "ready": false, "restartCount": 0, "image": "", "imageID": "",
                      "state": { "terminated": { "exitCode": 0 } } },
                    { "name": EXPORT_CONTAINER, "ready": true, "restartCount": 0, "image": "", "imageID": "",
                      "state": { "running": {} } }
                ]
            }
        }))
        .unwrap();
        match worker_terminal(&pod) {
            Some(Outcome::Terminated {
                succeeded: true,
                exit_code: 0,
            }) => (),
            _ => panic!("expected successful outcome"),
        }
    }

    #[test]
    fn nonzero_exit_codes_fail_the_phase() {
        let pod: Pod = serde_json::from_value(json!({
            "metadata": {},
            "spec": { "containers": [{ "name": "work" }, { "name": EXPORT_CONTAINER }] },
            "status": {
                "phase": "Running",
                "containerStatuses": [
                    { "name": "work", "ready": false, "restartCount": 0, "image": "", "imageID": "",
                      "state": { "terminated": { "exitCode": 3 } } },
                    { "name": EXPORT_CONTAINER, "ready": true, "restartCount": 0, "image": "", "imageID": "",
                      "state": { "running": {} } }
                ]
            }
        }))
        .unwrap();
        match worker_terminal(&pod) {
            Some(Outcome::Terminated {
                succeeded: false,
                exit_code: 3,
            }) => (),
            _ => panic!("expected failed outcome"),
        }
    }

    #[test]
    fn running_workers_are_not_terminal() {
        let pod: Pod = serde_json::from_value(json!({
            "metadata": {},
            "spec": { "containers": [{ "name": "work" }] },
            "status": {
                "phase": "Running",
                "containerStatuses": [
                    { "name": "work", "ready": true, "restartCount": 0, "image": "", "imageID": "",
                      "state": { "running": {} } }
                ]
            }
        }))
        .unwrap();
        assert!(worker_terminal(&pod).is_none());
    }
}
