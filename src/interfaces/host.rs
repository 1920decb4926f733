//! Host-side network devices and links.

use log::debug;

use crate::core::kube::Outcome;

/// A capturable device of the host.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) struct HostDevice {
    pub(crate) name: String,
    pub(crate) description: Option<String>,
}

pub(crate) trait HostDevices {
    /// All capturable devices. A listing failure yields no device.
    fn devices(&self) -> Vec<HostDevice>;
}

pub(crate) trait LinkResolver {
    /// Name of the host link with the given index.
    fn link_name(&self, index: u32) -> Outcome<String>;
}

/// Devices as seen by libpcap.
pub(crate) struct PcapDevices;

impl HostDevices for PcapDevices {
    fn devices(&self) -> Vec<HostDevice> {
        match pcap::Device::list() {
            Ok(devices) => devices
                .into_iter()
                .map(|d| HostDevice {
                    name: d.name,
                    description: d.desc,
                })
                .collect(),
            Err(e) => {
                debug!("Could not list host devices: {e}");
                Vec::new()
            }
        }
    }
}

/// Links of the host network namespace.
pub(crate) struct HostLinks;

impl LinkResolver for HostLinks {
    fn link_name(&self, index: u32) -> Outcome<String> {
        let links = match nix::net::if_::if_nameindex() {
            Ok(links) => links,
            Err(e) => return Outcome::Unavailable(e.to_string()),
        };

        match links.iter().find(|l| l.index() == index) {
            Some(link) => Outcome::Found(link.name().to_string_lossy().into_owned()),
            None => Outcome::Empty,
        }
    }
}
