//! # Kube
//!
//! Typed client over the orchestration command line tool. Every query returns
//! an explicit `Outcome`: callers decide what an empty answer or an
//! unavailable tool means for them.

use std::{
    path::{Path, PathBuf},
    process::Command,
};

use log::debug;
use serde::Deserialize;

use super::events::KubeInfo;

/// Well-known install paths of the orchestration tool, in lookup order.
pub(crate) const KUBECTL_PATHS: [&str; 3] = [
    "/snap/bin/microk8s.kubectl",
    "/usr/bin/kubectl",
    "/usr/local/bin/kubectl",
];

/// Result of a query to an external tool.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) enum Outcome<T> {
    /// The query succeeded and returned something.
    Found(T),
    /// The query succeeded but returned nothing.
    Empty,
    /// The query could not be made or failed.
    Unavailable(String),
}

impl<T> Outcome<T> {
    /// Turn the outcome into an Option, tracing why nothing was found.
    pub(crate) fn found(self, what: &str) -> Option<T> {
        match self {
            Outcome::Found(t) => Some(t),
            Outcome::Empty => {
                debug!("No {what} found");
                None
            }
            Outcome::Unavailable(reason) => {
                debug!("Could not get {what}: {reason}");
                None
            }
        }
    }
}

impl<T> Outcome<Vec<T>> {
    fn from_list(list: Vec<T>) -> Self {
        match list.is_empty() {
            true => Outcome::Empty,
            false => Outcome::Found(list),
        }
    }
}

/// Operations the topology discovery and the event preprocessing need from the
/// orchestration system.
pub(crate) trait Orchestrator {
    fn namespaces(&self) -> Outcome<Vec<String>>;
    fn pods(&self, namespace: &str) -> Outcome<Vec<String>>;
    /// Host-side link index of the primary network interface of a pod.
    fn primary_iflink(&self, namespace: &str, pod: &str) -> Outcome<u32>;
    /// Container ids of all running containers, with their identity.
    fn containers(&self) -> Outcome<Vec<(String, KubeInfo)>>;
}

#[derive(Deserialize)]
struct List<T> {
    #[serde(default = "Vec::new")]
    items: Vec<T>,
}

#[derive(Deserialize)]
struct Metadata {
    name: String,
    #[serde(default)]
    namespace: Option<String>,
}

#[derive(Deserialize)]
struct Named {
    metadata: Metadata,
}

#[derive(Deserialize)]
struct ContainerStatus {
    name: String,
    #[serde(rename = "containerID", default)]
    container_id: Option<String>,
}

#[derive(Deserialize, Default)]
struct PodStatus {
    #[serde(rename = "containerStatuses", default)]
    container_statuses: Vec<ContainerStatus>,
}

#[derive(Deserialize)]
struct Pod {
    metadata: Metadata,
    #[serde(default)]
    status: PodStatus,
}

/// Client invoking the orchestration tool as a subprocess.
#[derive(Clone, Debug)]
pub(crate) struct Kubectl {
    bin: PathBuf,
}

impl Kubectl {
    /// Look for the tool in its well-known install paths.
    pub(crate) fn detect() -> Outcome<Self> {
        Self::detect_in(&KUBECTL_PATHS)
    }

    pub(crate) fn detect_in<P: AsRef<Path>>(paths: &[P]) -> Outcome<Self> {
        match paths.iter().map(AsRef::as_ref).find(|p| p.exists()) {
            Some(bin) => {
                debug!("Using orchestration tool {}", bin.display());
                Outcome::Found(Kubectl {
                    bin: bin.to_path_buf(),
                })
            }
            None => Outcome::Unavailable("no kubectl found".to_string()),
        }
    }

    fn run(&self, args: &[&str]) -> Outcome<String> {
        debug!("Executing {} {}", self.bin.display(), args.join(" "));

        let output = match Command::new(&self.bin).args(args).output() {
            Ok(output) => output,
            Err(e) => return Outcome::Unavailable(e.to_string()),
        };
        if !output.status.success() {
            return Outcome::Unavailable(format!(
                "{} exited with {}",
                self.bin.display(),
                output.status
            ));
        }

        let stdout = String::from_utf8_lossy(&output.stdout).trim().to_string();
        debug!("Read {stdout}");
        match stdout.is_empty() {
            true => Outcome::Empty,
            false => Outcome::Found(stdout),
        }
    }

    fn list<T: for<'de> Deserialize<'de>>(&self, args: &[&str]) -> Outcome<Vec<T>> {
        let out = match self.run(args) {
            Outcome::Found(out) => out,
            Outcome::Empty => return Outcome::Empty,
            Outcome::Unavailable(reason) => return Outcome::Unavailable(reason),
        };
        match serde_json::from_str::<List<T>>(&out) {
            Ok(list) => Outcome::from_list(list.items),
            Err(e) => Outcome::Unavailable(format!("invalid output: {e}")),
        }
    }
}

impl Orchestrator for Kubectl {
    fn namespaces(&self) -> Outcome<Vec<String>> {
        match self.list::<Named>(&["get", "namespace", "-o", "json"]) {
            Outcome::Found(items) => {
                Outcome::Found(items.into_iter().map(|n| n.metadata.name).collect())
            }
            Outcome::Empty => Outcome::Empty,
            Outcome::Unavailable(reason) => Outcome::Unavailable(reason),
        }
    }

    fn pods(&self, namespace: &str) -> Outcome<Vec<String>> {
        let ns = format!("--namespace={namespace}");
        match self.list::<Named>(&["get", "pod", &ns, "-o", "json"]) {
            Outcome::Found(items) => {
                Outcome::Found(items.into_iter().map(|n| n.metadata.name).collect())
            }
            Outcome::Empty => Outcome::Empty,
            Outcome::Unavailable(reason) => Outcome::Unavailable(reason),
        }
    }

    fn primary_iflink(&self, namespace: &str, pod: &str) -> Outcome<u32> {
        let ns = format!("--namespace={namespace}");
        match self.run(&["exec", pod, &ns, "--", "cat", "/sys/class/net/eth0/iflink"]) {
            Outcome::Found(out) => parse_iflink(&out),
            Outcome::Empty => Outcome::Empty,
            Outcome::Unavailable(reason) => Outcome::Unavailable(reason),
        }
    }

    fn containers(&self) -> Outcome<Vec<(String, KubeInfo)>> {
        match self.list::<Pod>(&["get", "pods", "--all-namespaces", "-o", "json"]) {
            Outcome::Found(pods) => Outcome::from_list(pod_containers(pods)),
            Outcome::Empty => Outcome::Empty,
            Outcome::Unavailable(reason) => Outcome::Unavailable(reason),
        }
    }
}

fn parse_iflink(out: &str) -> Outcome<u32> {
    match out.lines().next().map(|l| l.trim().parse::<u32>()) {
        Some(Ok(index)) => Outcome::Found(index),
        Some(Err(e)) => Outcome::Unavailable(format!("invalid link index '{out}': {e}")),
        None => Outcome::Empty,
    }
}

/// Flatten pods into (container id, identity) pairs. Runtime prefixes
/// ("containerd://", "docker://", ...) are stripped from the ids.
fn pod_containers(pods: Vec<Pod>) -> Vec<(String, KubeInfo)> {
    let mut containers = Vec::new();
    for pod in pods {
        let namespace = pod.metadata.namespace.unwrap_or_default();
        for status in pod.status.container_statuses {
            let id = match status.container_id {
                Some(id) => id,
                None => continue,
            };
            let id = match id.split_once("://") {
                Some((_, id)) => id.to_string(),
                None => id,
            };
            containers.push((
                id,
                KubeInfo {
                    name: status.name,
                    pod: pod.metadata.name.clone(),
                    namespace: namespace.clone(),
                },
            ));
        }
    }
    containers
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detect_missing_tool() {
        assert!(matches!(
            Kubectl::detect_in(&["/nonexistent/kubectl"]),
            Outcome::Unavailable(_)
        ));
    }

    #[test]
    fn detect_first_existing() {
        match Kubectl::detect_in(&["/nonexistent/kubectl", "/bin/sh"]) {
            Outcome::Found(k) => assert_eq!(k.bin, PathBuf::from("/bin/sh")),
            _ => panic!("tool not found"),
        }
    }

    #[test]
    fn failing_tool_is_unavailable() {
        let k = Kubectl {
            bin: PathBuf::from("/bin/false"),
        };
        assert!(matches!(k.namespaces(), Outcome::Unavailable(_)));
    }

    #[test]
    fn silent_tool_is_empty() {
        let k = Kubectl {
            bin: PathBuf::from("/bin/true"),
        };
        assert_eq!(k.namespaces(), Outcome::Empty);
        assert_eq!(k.primary_iflink("default", "web"), Outcome::Empty);
    }

    #[test]
    fn parse_namespaces() {
        let json = r#"{"items": [{"metadata": {"name": "default"}}, {"metadata": {"name": "kube-system"}}]}"#;
        let list: List<Named> = serde_json::from_str(json).unwrap();
        let names: Vec<String> = list.items.into_iter().map(|n| n.metadata.name).collect();
        assert_eq!(names, vec!["default", "kube-system"]);

        let list: List<Named> = serde_json::from_str(r#"{"kind": "List"}"#).unwrap();
        assert!(list.items.is_empty());
    }

    #[test]
    fn parse_link_index() {
        assert_eq!(parse_iflink("17\n"), Outcome::Found(17));
        assert_eq!(parse_iflink(""), Outcome::Empty);
        assert!(matches!(parse_iflink("eth0"), Outcome::Unavailable(_)));
    }

    #[test]
    fn flatten_pod_containers() {
        let json = r#"{"items": [
            {"metadata": {"name": "web-0", "namespace": "shop"},
             "status": {"containerStatuses": [
                 {"name": "nginx", "containerID": "containerd://abcd"},
                 {"name": "pending"}
             ]}},
            {"metadata": {"name": "new", "namespace": "shop"}}
        ]}"#;
        let list: List<Pod> = serde_json::from_str(json).unwrap();
        let containers = pod_containers(list.items);

        assert_eq!(containers.len(), 1);
        assert_eq!(containers[0].0, "abcd");
        assert_eq!(
            containers[0].1,
            KubeInfo {
                name: "nginx".to_string(),
                pod: "web-0".to_string(),
                namespace: "shop".to_string(),
            }
        );
    }
}
