//! Hardware checks over a parsed inventory.

use std::net::Ipv4Addr;

use serde::{Deserialize, Serialize};

use crate::inventory::Inventory;

const GIB: u64 = 1024 * 1024 * 1024;
const GB: u64 = 1_000_000_000;

/// Minimum requirements, differing by role.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidatorCfg {
    pub min_cpu_cores: u32,
    pub min_cpu_cores_master: u32,
    pub min_cpu_cores_worker: u32,
    pub min_ram_gib: u64,
    pub min_ram_gib_master: u64,
    pub min_ram_gib_worker: u64,
    pub min_disk_size_gb: u64,
}

impl Default for ValidatorCfg {
    fn default() -> Self {
        Self {
            min_cpu_cores: 2,
            min_cpu_cores_master: 4,
            min_cpu_cores_worker: 2,
            min_ram_gib: 8,
            min_ram_gib_master: 16,
            min_ram_gib_worker: 8,
            min_disk_size_gb: 120,
        }
    }
}

/// Cluster-side constraints the validator checks hosts against.
#[derive(Debug, Clone, Default)]
pub struct ClusterConstraints {
    /// Declared machine network CIDR, empty when not yet set.
    pub machine_network_cidr: String,
    /// Hostnames already reported by the cluster's other hosts.
    pub other_hostnames: Vec<String>,
}

/// Verdict of one hardware check.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckResult {
    pub check_id: String,
    pub passed: bool,
    pub message: String,
}

impl CheckResult {
    fn new(check_id: &str, passed: bool, message: String) -> Self {
        Self {
            check_id: check_id.to_string(),
            passed,
            message,
        }
    }
}

/// Role the minimums are resolved against.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValidationRole {
    Auto,
    Master,
    Worker,
}

/// Pure hardware validator.
#[derive(Debug, Clone, Default)]
pub struct HardwareValidator {
    cfg: ValidatorCfg,
}

impl HardwareValidator {
    pub fn new(cfg: ValidatorCfg) -> Self {
        Self { cfg }
    }

    /// Run every check and return the verdicts in a stable order.
    ///
    /// The operator-declared role wins the tie-break; `auto` validates
    /// against worker minimums.
    pub fn validate(
        &self,
        inventory: &Inventory,
        constraints: &ClusterConstraints,
        role: ValidationRole,
    ) -> Vec<CheckResult> {
        let (min_cores, min_ram) = match role {
            ValidationRole::Master => (self.cfg.min_cpu_cores_master, self.cfg.min_ram_gib_master),
            ValidationRole::Worker => (self.cfg.min_cpu_cores_worker, self.cfg.min_ram_gib_worker),
            ValidationRole::Auto => (self.cfg.min_cpu_cores_worker, self.cfg.min_ram_gib_worker),
        };
        let min_ram_bytes = min_ram * GIB;
        let min_disk_bytes = self.cfg.min_disk_size_gb * GB;

        let mut results = Vec::new();

        results.push(CheckResult::new(
            "has-min-cpu-cores",
            inventory.cpu.count >= min_cores,
            if inventory.cpu.count >= min_cores {
                format!("Sufficient CPU cores ({})", inventory.cpu.count)
            } else {
                format!(
                    "Require at least {min_cores} CPU cores, found only {}",
                    inventory.cpu.count
                )
            },
        ));

        let ram = inventory.memory.physical_bytes;
        results.push(CheckResult::new(
            "has-min-memory",
            ram >= min_ram_bytes,
            if ram >= min_ram_bytes {
                format!("Sufficient RAM ({ram} bytes)")
            } else {
                format!("Require at least {min_ram} GiB RAM, found only {ram} bytes")
            },
        ));

        let best_disk = inventory.disks.iter().map(|d| d.size_bytes).max();
        let disk_ok = best_disk.is_some_and(|size| size >= min_disk_bytes);
        results.push(CheckResult::new(
            "has-min-valid-disks",
            disk_ok,
            if disk_ok {
                "Sufficient disk capacity".to_string()
            } else {
                format!(
                    "Require a disk of at least {} GB",
                    self.cfg.min_disk_size_gb
                )
            },
        ));

        if !constraints.machine_network_cidr.is_empty() {
            let on_cidr = inventory.interfaces.iter().any(|iface| {
                iface
                    .ipv4_addresses
                    .iter()
                    .any(|addr| cidr_contains(&constraints.machine_network_cidr, addr))
            });
            results.push(CheckResult::new(
                "belongs-to-machine-cidr",
                on_cidr,
                if on_cidr {
                    "Host belongs to the machine network".to_string()
                } else {
                    format!(
                        "No interface on machine network {}",
                        constraints.machine_network_cidr
                    )
                },
            ));
        }

        let hostname_ok = !inventory.hostname.is_empty()
            && !constraints
                .other_hostnames
                .iter()
                .any(|other| other == &inventory.hostname);
        results.push(CheckResult::new(
            "hostname-unique",
            hostname_ok,
            if hostname_ok {
                format!("Hostname {} is unique in cluster", inventory.hostname)
            } else if inventory.hostname.is_empty() {
                "Hostname is missing from the inventory".to_string()
            } else {
                format!("Hostname {} is not unique in cluster", inventory.hostname)
            },
        ));

        results
    }
}

/// Every check passed.
pub fn is_sufficient(results: &[CheckResult]) -> bool {
    results.iter().all(|r| r.passed)
}

/// Messages of the failed checks, for the host's status info.
pub fn failure_messages(results: &[CheckResult]) -> Vec<String> {
    results
        .iter()
        .filter(|r| !r.passed)
        .map(|r| r.message.clone())
        .collect()
}

/// Does `cidr` (e.g. `1.1.0.0/16`) contain `addr` (e.g. `1.1.2.3/24`)?
///
/// The address may carry its own prefix length, which is ignored.
fn cidr_contains(cidr: &str, addr: &str) -> bool {
    let Some((net, prefix)) = cidr.split_once('/') else {
        return false;
    };
    let (Ok(net), Ok(prefix)) = (net.parse::<Ipv4Addr>(), prefix.parse::<u32>()) else {
        return false;
    };
    if prefix > 32 {
        return false;
    }
    let ip = addr.split('/').next().unwrap_or(addr);
    let Ok(ip) = ip.parse::<Ipv4Addr>() else {
        return false;
    };
    let mask: u32 = if prefix == 0 {
        0
    } else {
        u32::MAX << (32 - prefix)
    };
    (u32::from(net) & mask) == (u32::from(ip) & mask)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::inventory::parse_inventory;

    fn worker_inventory() -> Inventory {
        parse_inventory(
            r#"{
                "hostname": "worker-0",
                "cpu": {"count": 2},
                "memory": {"physical_bytes": 8589934592, "usable_bytes": 8589934592},
                "disks": [{"name": "sda", "size_bytes": 128849018880}],
                "interfaces": [{"name": "eth0", "ipv4_addresses": ["1.2.3.4/24"]}]
            }"#,
        )
        .unwrap()
    }

    fn constraints(cidr: &str) -> ClusterConstraints {
        ClusterConstraints {
            machine_network_cidr: cidr.to_string(),
            other_hostnames: Vec::new(),
        }
    }

    #[test]
    fn worker_inventory_passes_worker_checks() {
        let validator = HardwareValidator::default();
        let results = validator.validate(
            &worker_inventory(),
            &constraints("1.2.3.0/24"),
            ValidationRole::Worker,
        );
        assert!(is_sufficient(&results), "failures: {:?}", failure_messages(&results));
    }

    #[test]
    fn worker_inventory_fails_master_checks() {
        let validator = HardwareValidator::default();
        let results = validator.validate(
            &worker_inventory(),
            &constraints("1.2.3.0/24"),
            ValidationRole::Master,
        );
        assert!(!is_sufficient(&results));
        let failed: Vec<_> = results.iter().filter(|r| !r.passed).collect();
        assert!(failed.iter().any(|r| r.check_id == "has-min-cpu-cores"));
        assert!(failed.iter().any(|r| r.check_id == "has-min-memory"));
    }

    #[test]
    fn auto_role_uses_worker_minimums() {
        let validator = HardwareValidator::default();
        let results = validator.validate(
            &worker_inventory(),
            &constraints("1.2.3.0/24"),
            ValidationRole::Auto,
        );
        assert!(is_sufficient(&results));
    }

    #[test]
    fn detects_host_off_machine_network() {
        let validator = HardwareValidator::default();
        let results = validator.validate(
            &worker_inventory(),
            &constraints("10.0.0.0/8"),
            ValidationRole::Worker,
        );
        let cidr_check = results
            .iter()
            .find(|r| r.check_id == "belongs-to-machine-cidr")
            .unwrap();
        assert!(!cidr_check.passed);
    }

    #[test]
    fn duplicate_hostname_fails() {
        let validator = HardwareValidator::default();
        let mut c = constraints("1.2.3.0/24");
        c.other_hostnames.push("worker-0".to_string());
        let results = validator.validate(&worker_inventory(), &c, ValidationRole::Worker);
        let check = results.iter().find(|r| r.check_id == "hostname-unique").unwrap();
        assert!(!check.passed);
    }

    #[test]
    fn no_cidr_check_when_network_undeclared() {
        let validator = HardwareValidator::default();
        let results = validator.validate(
            &worker_inventory(),
            &ClusterConstraints::default(),
            ValidationRole::Worker,
        );
        assert!(!results.iter().any(|r| r.check_id == "belongs-to-machine-cidr"));
    }

    #[test]
    fn cidr_membership() {
        assert!(cidr_contains("1.1.0.0/16", "1.1.2.3/24"));
        assert!(cidr_contains("1.1.0.0/16", "1.1.255.255"));
        assert!(!cidr_contains("1.1.0.0/16", "1.2.0.1/24"));
        assert!(!cidr_contains("bogus", "1.1.0.1"));
        assert!(cidr_contains("0.0.0.0/0", "9.9.9.9"));
    }
}
