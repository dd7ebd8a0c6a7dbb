//! Domain template generation.
//!
//! Produces the libvirt domain-definition XML for an agent sandbox VM.
//! Generation is pure and synchronous: no I/O, no suspension points.

use serde::{Deserialize, Serialize};

/// vCPU / memory / disk envelope for a VM.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceProfile {
    pub vcpu: u32,
    pub memory_mib: u32,
    pub disk_gib: u32,
}

impl Default for ResourceProfile {
    fn default() -> Self {
        Self {
            vcpu: 2,
            memory_mib: 2048,
            disk_gib: 20,
        }
    }
}

/// Network isolation policy for a template.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NetworkMode {
    /// Outbound access through NAT plus `agent-network-filter`. Default.
    NatFiltered,
    /// No external network connectivity.
    Isolated,
    /// Host bridge, unfiltered.
    Bridge,
}

impl Default for NetworkMode {
    fn default() -> Self {
        NetworkMode::NatFiltered
    }
}

impl NetworkMode {
    /// Wire value used both in the host network name and in `Template::network_name`.
    pub fn as_str(&self) -> &'static str {
        match self {
            NetworkMode::NatFiltered => "nat-filtered",
            NetworkMode::Isolated => "isolated",
            NetworkMode::Bridge => "bridge",
        }
    }
}

/// Immutable build-time description of a domain.
#[derive(Debug, Clone)]
pub struct Template {
    pub name: String,
    pub resources: ResourceProfile,
    pub mode: NetworkMode,
    pub disk_path: String,
}

impl Template {
    pub fn new(name: impl Into<String>) -> Self {
        let name = name.into();
        let disk_path = default_disk_path(&name);
        Self {
            name,
            resources: ResourceProfile::default(),
            mode: NetworkMode::default(),
            disk_path,
        }
    }

    pub fn with_resources(mut self, resources: ResourceProfile) -> Self {
        self.resources = resources;
        self
    }

    pub fn with_mode(mut self, mode: NetworkMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn with_disk_path(mut self, disk_path: impl Into<String>) -> Self {
        self.disk_path = disk_path.into();
        self
    }

    /// Name of the libvirt network this template attaches to.
    ///
    /// Derived from the mode's wire value so it can never drift from the
    /// host network names in `Self::host_network_name`.
    pub fn network_name(&self) -> String {
        format!("agent-{}", self.mode.as_str())
    }

    /// The well-known host network name this template expects to already exist.
    pub fn host_network_name(&self) -> String {
        self.network_name()
    }

    fn cpu_quota(&self) -> u32 {
        self.resources.vcpu * 100_000
    }

    /// Renders the domain definition document. Pure; no I/O.
    pub fn generate(&self) -> String {
        let filter = match self.mode {
            NetworkMode::Bridge => String::new(),
            _ => "      <filterref filter='agent-network-filter'/>\n".to_string(),
        };

        format!(
            r#"<domain type='kvm'>
  <name>{name}</name>
  <memory unit='MiB'>{memory_mib}</memory>
  <vcpu placement='static'>{vcpu}</vcpu>
  <cputune>
    <shares>1024</shares>
    <period>100000</period>
    <quota>{cpu_quota}</quota>
  </cputune>
  <memtune>
    <hard_limit unit='MiB'>{memory_mib}</hard_limit>
  </memtune>
  <os>
    <type arch='x86_64' machine='q35'>hvm</type>
    <boot dev='hd'/>
  </os>
  <features>
    <acpi/>
    <apic/>
  </features>
  <cpu mode='host-passthrough'/>
  <devices>
    <disk type='file' device='disk'>
      <driver name='qemu' type='qcow2' cache='writeback'/>
      <source file='{disk_path}'/>
      <target dev='vda' bus='virtio'/>
    </disk>
    <interface type='network'>
      <source network='{network_name}'/>
      <model type='virtio'/>
{filter}    </interface>
    <serial type='pty'>
      <target port='0'/>
    </serial>
    <console type='pty'>
      <target type='serial' port='0'/>
    </console>
  </devices>
</domain>
"#,
            name = self.name,
            memory_mib = self.resources.memory_mib,
            vcpu = self.resources.vcpu,
            cpu_quota = self.cpu_quota(),
            disk_path = self.disk_path,
            network_name = self.network_name(),
            filter = filter,
        )
    }
}

fn default_disk_path(name: &str) -> String {
    format!("/var/lib/libvirt/images/{name}.qcow2")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_mode_is_nat_filtered() {
        let xml = Template::new("v").generate();
        assert!(xml.contains("agent-nat-filtered"));
        assert!(!xml.contains("agent-isolated"));
    }

    #[test]
    fn isolated_mode_names_correctly() {
        let t = Template::new("v").with_mode(NetworkMode::Isolated);
        assert_eq!(t.network_name(), "agent-isolated");
        assert!(t.generate().contains("agent-isolated"));
    }

    #[test]
    fn bridge_mode_has_no_filter() {
        let t = Template::new("v").with_mode(NetworkMode::Bridge);
        assert!(!t.generate().contains("filterref"));
    }

    #[test]
    fn cpu_quota_is_one_cpu_per_vcpu() {
        let t = Template::new("v").with_resources(ResourceProfile {
            vcpu: 4,
            ..ResourceProfile::default()
        });
        assert!(t.generate().contains("<quota>400000</quota>"));
    }

    #[test]
    fn default_disk_path_uses_name() {
        let t = Template::new("sandbox-1");
        assert_eq!(t.disk_path, "/var/lib/libvirt/images/sandbox-1.qcow2");
    }
}
