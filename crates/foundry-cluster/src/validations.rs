//! Cluster-level readiness validations.
//!
//! Pure checks over the cluster row alone; host sufficiency is aggregated
//! separately by the manager.

use std::net::Ipv4Addr;

use foundry_state::Cluster;

/// Verdict of one cluster-level check.
#[derive(Debug, Clone)]
pub struct ClusterCheck {
    pub check_id: String,
    pub passed: bool,
    pub message: String,
}

impl ClusterCheck {
    fn new(check_id: &str, passed: bool, message: String) -> Self {
        Self {
            check_id: check_id.to_string(),
            passed,
            message,
        }
    }
}

/// Run every cluster-level validation.
pub fn validate_cluster(cluster: &Cluster) -> Vec<ClusterCheck> {
    let mut checks = Vec::new();

    let cidr_ok = parse_cidr(&cluster.machine_network_cidr).is_some();
    checks.push(ClusterCheck::new(
        "machine-cidr-defined",
        cidr_ok,
        if cidr_ok {
            format!("Machine network CIDR is {}", cluster.machine_network_cidr)
        } else {
            "Machine network CIDR is missing or invalid".to_string()
        },
    ));

    checks.push(ClusterCheck::new(
        "pull-secret-set",
        !cluster.pull_secret.is_empty(),
        if cluster.pull_secret.is_empty() {
            "Pull secret is not set".to_string()
        } else {
            "Pull secret is set".to_string()
        },
    ));

    checks.push(ClusterCheck::new(
        "base-dns-domain-defined",
        !cluster.base_dns_domain.is_empty(),
        if cluster.base_dns_domain.is_empty() {
            "Base DNS domain is not set".to_string()
        } else {
            format!("Base DNS domain is {}", cluster.base_dns_domain)
        },
    ));

    // Static VIPs must sit inside the machine network; DHCP-allocated VIPs
    // are the agent's responsibility.
    if !cluster.vip_dhcp_allocation {
        for (check_id, vip) in [
            ("api-vip-valid", &cluster.api_vip),
            ("ingress-vip-valid", &cluster.ingress_vip),
        ] {
            let ok = !vip.is_empty() && vip_in_cidr(vip, &cluster.machine_network_cidr);
            checks.push(ClusterCheck::new(
                check_id,
                ok,
                if ok {
                    format!("{vip} belongs to the machine network")
                } else if vip.is_empty() {
                    "VIP is not set".to_string()
                } else {
                    format!(
                        "{vip} does not belong to machine network {}",
                        cluster.machine_network_cidr
                    )
                },
            ));
        }
    }

    checks
}

/// Every check passed.
pub fn all_passed(checks: &[ClusterCheck]) -> bool {
    checks.iter().all(|c| c.passed)
}

/// Messages of the failing checks.
pub fn failures(checks: &[ClusterCheck]) -> Vec<String> {
    checks
        .iter()
        .filter(|c| !c.passed)
        .map(|c| c.message.clone())
        .collect()
}

fn parse_cidr(cidr: &str) -> Option<(Ipv4Addr, u32)> {
    let (net, prefix) = cidr.split_once('/')?;
    let net = net.parse::<Ipv4Addr>().ok()?;
    let prefix = prefix.parse::<u32>().ok()?;
    (prefix <= 32).then_some((net, prefix))
}

fn vip_in_cidr(vip: &str, cidr: &str) -> bool {
    let Some((net, prefix)) = parse_cidr(cidr) else {
        return false;
    };
    let Ok(ip) = vip.parse::<Ipv4Addr>() else {
        return false;
    };
    let mask: u32 = if prefix == 0 { 0 } else { u32::MAX << (32 - prefix) };
    (u32::from(net) & mask) == (u32::from(ip) & mask)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ready_cluster() -> Cluster {
        let mut cluster = Cluster::new("c1".to_string(), "ready");
        cluster.machine_network_cidr = "1.1.0.0/16".to_string();
        cluster.api_vip = "1.1.0.10".to_string();
        cluster.ingress_vip = "1.1.0.11".to_string();
        cluster.base_dns_domain = "example.com".to_string();
        cluster.pull_secret = "{\"auths\":{}}".to_string();
        cluster
    }

    #[test]
    fn complete_cluster_passes() {
        let checks = validate_cluster(&ready_cluster());
        assert!(all_passed(&checks), "failures: {:?}", failures(&checks));
    }

    #[test]
    fn vip_outside_cidr_fails() {
        let mut cluster = ready_cluster();
        cluster.api_vip = "9.9.9.9".to_string();
        let checks = validate_cluster(&cluster);
        assert!(!all_passed(&checks));
        assert!(failures(&checks)[0].contains("does not belong"));
    }

    #[test]
    fn dhcp_allocation_skips_vip_checks() {
        let mut cluster = ready_cluster();
        cluster.api_vip.clear();
        cluster.ingress_vip.clear();
        cluster.vip_dhcp_allocation = true;
        let checks = validate_cluster(&cluster);
        assert!(all_passed(&checks));
    }

    #[test]
    fn missing_pull_secret_fails() {
        let mut cluster = ready_cluster();
        cluster.pull_secret.clear();
        let checks = validate_cluster(&cluster);
        let check = checks.iter().find(|c| c.check_id == "pull-secret-set").unwrap();
        assert!(!check.passed);
    }
}
