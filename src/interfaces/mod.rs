//! # Interfaces
//!
//! Enumerates the interfaces a capture can be started on: the eBPF event
//! source itself, the host side of container network endpoints found by
//! walking the orchestration topology, and the remaining host devices.

use std::{borrow::Cow, fmt, io::Write};

use anyhow::Result;
use log::debug;

use crate::core::kube::Orchestrator;

pub(crate) mod host;

use host::{HostDevices, LinkResolver};

/// Ethernet link-layer type.
pub(crate) const DLT_EN10MB: u32 = 1;

/// Maximum number of interfaces the topology discovery reports.
pub(crate) const MAX_DISCOVERED: usize = 32;

#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) struct InterfaceDescriptor {
    pub(crate) value: Cow<'static, str>,
    pub(crate) display: Cow<'static, str>,
    pub(crate) dlt: u32,
    pub(crate) dlt_name: Cow<'static, str>,
    pub(crate) dlt_description: Cow<'static, str>,
}

/// The eBPF event source, always listed first.
pub(crate) const EBPF_INTERFACE: InterfaceDescriptor = InterfaceDescriptor {
    value: Cow::Borrowed("ebpf"),
    display: Cow::Borrowed("eBPF interface"),
    dlt: DLT_EN10MB,
    dlt_name: Cow::Borrowed("ebpf"),
    dlt_description: Cow::Borrowed("The EN10MB Ethernet2 DLT"),
};

impl InterfaceDescriptor {
    fn dynamic(value: String, display: String) -> Self {
        Self {
            dlt_name: Cow::Owned(value.clone()),
            value: Cow::Owned(value),
            display: Cow::Owned(display),
            dlt: DLT_EN10MB,
            dlt_description: Cow::Borrowed("The EN10MB Ethernet2 DLT"),
        }
    }

    /// Host side of a pod primary interface.
    pub(crate) fn pod(ifname: String, pod: &str, namespace: &str) -> Self {
        Self::dynamic(ifname, format!("Pod {pod}, Namespace {namespace}"))
    }

    /// Host device without a description of its own.
    pub(crate) fn host(name: String) -> Self {
        Self::dynamic(name.clone(), name)
    }

    /// Does a selected interface refer to this one?
    pub(crate) fn is_selected_by(&self, selected: &str) -> bool {
        selected.starts_with(self.value.as_ref())
    }

    pub(crate) fn dlt_line(&self) -> String {
        format!(
            "dlt {{number={}}}{{name={}}}{{display={}}}",
            self.dlt, self.dlt_name, self.dlt_description
        )
    }
}

impl fmt::Display for InterfaceDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "interface {{value={}}}{{display={}}}", self.value, self.display)
    }
}

/// Interface names found by the topology discovery during one listing.
#[derive(Default, Debug)]
struct Discovered(Vec<String>);

impl Discovered {
    fn is_full(&self) -> bool {
        self.0.len() >= MAX_DISCOVERED
    }

    fn contains(&self, name: &str) -> bool {
        self.0.iter().any(|n| n == name)
    }

    fn insert(&mut self, name: String) {
        self.0.push(name);
    }
}

/// Descriptors printed so far, in emission order.
struct Listing<'a> {
    out: &'a mut dyn Write,
    emitted: Vec<InterfaceDescriptor>,
}

impl Listing<'_> {
    fn emit(&mut self, desc: InterfaceDescriptor) -> Result<()> {
        writeln!(self.out, "{desc}")?;
        self.emitted.push(desc);
        Ok(())
    }
}

pub(crate) struct Enumerator<'a> {
    orchestrator: Option<&'a dyn Orchestrator>,
    links: &'a dyn LinkResolver,
    devices: &'a dyn HostDevices,
}

impl<'a> Enumerator<'a> {
    pub(crate) fn new(
        orchestrator: Option<&'a dyn Orchestrator>,
        links: &'a dyn LinkResolver,
        devices: &'a dyn HostDevices,
    ) -> Self {
        Self {
            orchestrator,
            links,
            devices,
        }
    }

    /// Print all interfaces and return them in emission order.
    pub(crate) fn list_interfaces(&self, out: &mut dyn Write) -> Result<Vec<InterfaceDescriptor>> {
        let mut listing = Listing {
            out,
            emitted: Vec::new(),
        };

        listing.emit(EBPF_INTERFACE)?;
        let discovered = self.discover(&mut listing)?;

        for device in self.devices.devices() {
            if device.description.is_some() {
                continue;
            }
            if discovered.contains(&device.name) {
                debug!("Skipping {}, already listed as a pod interface", device.name);
                continue;
            }
            listing.emit(InterfaceDescriptor::host(device.name))?;
        }

        Ok(listing.emitted)
    }

    /// Walk namespaces and pods, listing the host side of each pod primary
    /// interface. Any failure only ends its own branch.
    fn discover(&self, listing: &mut Listing) -> Result<Discovered> {
        let mut discovered = Discovered::default();
        let kube = match self.orchestrator {
            Some(kube) => kube,
            None => return Ok(discovered),
        };
        let namespaces = match kube.namespaces().found("namespaces") {
            Some(ns) => ns,
            None => return Ok(discovered),
        };

        'walk: for ns in namespaces {
            let pods = match kube.pods(&ns).found("pods") {
                Some(pods) => pods,
                None => continue,
            };

            for pod in pods {
                if discovered.is_full() {
                    debug!("Reached {MAX_DISCOVERED} discovered interfaces, stopping");
                    break 'walk;
                }

                let index = match kube.primary_iflink(&ns, &pod).found("primary interface") {
                    Some(index) => index,
                    None => continue,
                };
                let ifname = match self.links.link_name(index).found("link name") {
                    Some(name) => name,
                    None => continue,
                };
                debug!("[ns: {ns}][pod: {pod}][iflink: {index}][ifname: {ifname}]");

                if discovered.contains(&ifname) {
                    continue;
                }
                listing.emit(InterfaceDescriptor::pod(ifname.clone(), &pod, &ns))?;
                discovered.insert(ifname);
            }
        }

        Ok(discovered)
    }
}

/// Print the link-layer type of the selected interface, if it is ours.
pub(crate) fn list_link_types(selected: Option<&str>, out: &mut dyn Write) -> Result<()> {
    if let Some(selected) = selected {
        if EBPF_INTERFACE.is_selected_by(selected) {
            writeln!(out, "{}", EBPF_INTERFACE.dlt_line())?;
        }
    }
    Ok(())
}

/// Print the configuration arguments of the selected interface.
pub(crate) fn describe_config_schema(selected: Option<&str>, out: &mut dyn Write) -> Result<()> {
    if selected.is_some() {
        writeln!(
            out,
            "arg {{number=0}}{{call=--name}}{{display=Interface Name}}{{type=radio}}\
             {{tooltip=The interface name}}"
        )?;
    }
    Ok(())
}
