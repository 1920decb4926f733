//! # Preprocess
//!
//! Completes raw kernel events with what can only be found from user space:
//! full executable paths and container identity.

use std::{
    collections::HashMap,
    fs,
    path::PathBuf,
    time::{Duration, Instant},
};

use log::debug;
use once_cell::sync::Lazy;
use regex::Regex;

use super::{CaptureEvent, ContainerInfo, KubeInfo, TaskInfo};
use crate::core::kube::Orchestrator;

static CONTAINER_ID: Lazy<Regex> = Lazy::new(|| Regex::new("[0-9a-f]{64}").unwrap());

/// Minimum time between two refreshes of the pod directory.
const POD_REFRESH_INTERVAL: Duration = Duration::from_secs(30);

/// Cache of container id to orchestration identity.
pub(crate) struct PodDirectory {
    client: Box<dyn Orchestrator>,
    containers: HashMap<String, KubeInfo>,
    refreshed: Option<Instant>,
}

impl PodDirectory {
    pub(crate) fn new(client: Box<dyn Orchestrator>) -> Self {
        Self {
            client,
            containers: HashMap::new(),
            refreshed: None,
        }
    }

    fn refresh(&mut self) {
        if let Some(at) = self.refreshed {
            if at.elapsed() < POD_REFRESH_INTERVAL {
                return;
            }
        }
        self.refreshed = Some(Instant::now());

        if let Some(containers) = self.client.containers().found("containers") {
            self.containers = containers.into_iter().collect();
            debug!("Pod directory holds {} containers", self.containers.len());
        }
    }

    pub(crate) fn lookup(&mut self, id: &str) -> Option<KubeInfo> {
        if !self.containers.contains_key(id) {
            self.refresh();
        }
        self.containers.get(id).cloned()
    }
}

pub(crate) struct Preprocessor {
    proc_root: PathBuf,
    pods: Option<PodDirectory>,
}

impl Preprocessor {
    pub(crate) fn new(pods: Option<PodDirectory>) -> Self {
        Self {
            proc_root: PathBuf::from("/proc"),
            pods,
        }
    }

    #[cfg(test)]
    pub(crate) fn with_proc_root(proc_root: PathBuf, pods: Option<PodDirectory>) -> Self {
        Self { proc_root, pods }
    }

    fn resolve_exe(&self, task: &mut TaskInfo) {
        if task.exe.is_some() || task.pid == 0 {
            return;
        }
        let exe = self.proc_root.join(task.pid.to_string()).join("exe");
        task.exe = fs::read_link(exe)
            .ok()
            .map(|p| p.to_string_lossy().into_owned());
    }

    fn container_id(&self, pid: u32) -> Option<String> {
        let cgroup = fs::read_to_string(self.proc_root.join(pid.to_string()).join("cgroup")).ok()?;
        CONTAINER_ID
            .find(&cgroup)
            .map(|m| m.as_str().to_string())
    }

    /// Fill in what the kernel could not report.
    pub(crate) fn process(&mut self, event: &mut CaptureEvent) {
        self.resolve_exe(&mut event.process);
        self.resolve_exe(&mut event.parent);

        if event.container.is_some() {
            return;
        }
        let id = match self.container_id(event.process.pid) {
            Some(id) => id,
            None => return,
        };

        let kube = self.pods.as_mut().and_then(|pods| pods.lookup(&id));
        event.container = Some(ContainerInfo {
            name: kube.as_ref().map(|k| k.name.clone()),
            id,
            kube,
        });
    }
}

#[cfg(test)]
mod tests {
    use std::{env, os::unix::fs::symlink};

    use super::*;
    use crate::core::{events::testing::event, kube::testing::FakeCluster};

    const ID: &str = "0123456789abcdef0123456789abcdef0123456789abcdef0123456789abcdef";

    fn proc_root(name: &str) -> PathBuf {
        let root = env::temp_dir().join(format!("ebpfdump-proc-{}-{name}", std::process::id()));
        let _ = fs::remove_dir_all(&root);
        fs::create_dir_all(root.join("1234")).unwrap();
        fs::write(
            root.join("1234/cgroup"),
            format!("0::/kubepods/besteffort/pod42/cri-containerd-{ID}.scope\n"),
        )
        .unwrap();
        symlink("/usr/sbin/nginx", root.join("1234/exe")).unwrap();
        root
    }

    #[test]
    fn resolve_paths_and_container() {
        let root = proc_root("full");
        let cluster = FakeCluster {
            containers: vec![(
                ID.to_string(),
                KubeInfo {
                    name: "nginx".to_string(),
                    pod: "web-0".to_string(),
                    namespace: "shop".to_string(),
                },
            )],
            ..Default::default()
        };
        let mut pre =
            Preprocessor::with_proc_root(root.clone(), Some(PodDirectory::new(Box::new(cluster))));

        let mut ev = event("eth0");
        ev.process.exe = None;
        pre.process(&mut ev);

        assert_eq!(ev.process.exe.as_deref(), Some("/usr/sbin/nginx"));
        // No such pid under the fake root.
        assert!(ev.parent.exe.is_none());

        let container = ev.container.unwrap();
        assert_eq!(container.id, ID);
        assert_eq!(container.name.as_deref(), Some("nginx"));
        assert_eq!(container.kube.unwrap().pod, "web-0");

        fs::remove_dir_all(root).unwrap();
    }

    #[test]
    fn container_without_orchestration() {
        let root = proc_root("bare");
        let mut pre = Preprocessor::with_proc_root(root.clone(), None);

        let mut ev = event("eth0");
        pre.process(&mut ev);

        let container = ev.container.unwrap();
        assert_eq!(container.id, ID);
        assert!(container.name.is_none());
        assert!(container.kube.is_none());

        fs::remove_dir_all(root).unwrap();
    }

    #[test]
    fn host_process() {
        let root = proc_root("host");
        let mut pre = Preprocessor::with_proc_root(root.clone(), None);

        let mut ev = event("eth0");
        ev.process.pid = 999;
        pre.process(&mut ev);
        assert!(ev.container.is_none());

        fs::remove_dir_all(root).unwrap();
    }

    #[test]
    fn directory_refresh_is_rate_limited() {
        let mut pods = PodDirectory::new(Box::new(FakeCluster::default()));
        assert!(pods.lookup(ID).is_none());
        let first = pods.refreshed.unwrap();
        assert!(pods.lookup(ID).is_none());
        assert_eq!(pods.refreshed.unwrap(), first);
    }
}
