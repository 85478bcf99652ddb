//! Network Policy (C2, spec §4.2): network definitions and the egress firewall script
//! installed inside every API-key-mode container.
//!
//! CIDR/host validation is security-fatal (spec §7, invariant 5/6 test S6): any
//! character that doesn't survive validation must abort *before* any shell
//! interpolation happens, never silently drop the offending rule.

use std::collections::HashMap;
use std::sync::{Arc, OnceLock};

use bollard::models::{Ipam, IpamConfig};
use bollard::network::{CreateNetworkOptions, ListNetworksOptions};
use bollard::Docker;
use ipnetwork::IpNetwork;

use crate::config::NetworkConfig;
use crate::error::{ContainerError, NetworkPolicyError};

/// A GitHub login/host used only as the secrets-proxy host; validated against
/// `\A[A-Za-z0-9.\-]+\z` before being interpolated into the firewall script.
fn validate_host(host: &str) -> Result<(), NetworkPolicyError> {
    let valid = !host.is_empty()
        && host
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '.' || c == '-');
    if valid {
        Ok(())
    } else {
        Err(NetworkPolicyError::InvalidHost(host.to_string()))
    }
}

/// Validate a CIDR via an IP-parsing library (spec §4.2): anything that doesn't parse
/// as a valid network is rejected outright, preventing shell injection through a
/// poisoned CIDR list.
fn validate_cidr(cidr: &str) -> Result<IpNetwork, NetworkPolicyError> {
    cidr.parse::<IpNetwork>()
        .map_err(|_| NetworkPolicyError::InvalidCidr(cidr.to_string()))
}

/// Refresh `github_cidrs` from `https://api.github.com/meta` (keys `hooks`, `git`,
/// `api`, `web`, deduped); on fetch failure, falls back to the static list.
pub async fn refresh_github_cidrs(fallback: &[String]) -> Vec<String> {
    match fetch_github_meta_cidrs().await {
        Ok(cidrs) if !cidrs.is_empty() => cidrs,
        _ => fallback.to_vec(),
    }
}

async fn fetch_github_meta_cidrs() -> anyhow::Result<Vec<String>> {
    #[derive(serde::Deserialize)]
    struct GithubMeta {
        hooks: Vec<String>,
        git: Vec<String>,
        api: Vec<String>,
        web: Vec<String>,
    }

    let meta: GithubMeta = reqwest::get("https://api.github.com/meta")
        .await?
        .json()
        .await?;

    let mut seen = std::collections::HashSet::new();
    let mut out = Vec::new();
    for cidr in meta
        .hooks
        .into_iter()
        .chain(meta.git)
        .chain(meta.api)
        .chain(meta.web)
    {
        if seen.insert(cidr.clone()) {
            out.push(cidr);
        }
    }
    Ok(out)
}

/// Build the egress firewall shell script (spec §4.2). Every host/CIDR is validated
/// *before* interpolation; any invalid value aborts the whole build with an error that
/// names the offending input (test S6).
pub fn build_firewall_script(
    proxy_host: &str,
    proxy_port: u16,
    github_cidrs: &[String],
) -> Result<String, NetworkPolicyError> {
    validate_host(proxy_host)?;
    let mut validated_cidrs = Vec::with_capacity(github_cidrs.len());
    for cidr in github_cidrs {
        validate_cidr(cidr)?;
        validated_cidrs.push(cidr.clone());
    }

    let mut script = String::new();
    script.push_str("#!/bin/sh\nset -e\n");
    script.push_str("iptables -F OUTPUT\n");
    script.push_str("iptables -P OUTPUT DROP\n");
    script.push_str("iptables -A OUTPUT -o lo -j ACCEPT\n");
    script.push_str(
        "iptables -A OUTPUT -m conntrack --ctstate ESTABLISHED,RELATED -j ACCEPT\n",
    );
    script.push_str("iptables -A OUTPUT -p udp --dport 53 -j ACCEPT\n");
    script.push_str("iptables -A OUTPUT -p tcp --dport 53 -j ACCEPT\n");
    script.push_str(&format!(
        "iptables -A OUTPUT -p tcp -d {proxy_host} --dport {proxy_port} -j ACCEPT\n"
    ));
    for cidr in &validated_cidrs {
        script.push_str(&format!("iptables -A OUTPUT -p tcp -d {cidr} --dport 443 -j ACCEPT\n"));
        script.push_str(&format!("iptables -A OUTPUT -p tcp -d {cidr} --dport 22 -j ACCEPT\n"));
    }
    script.push_str("iptables -A OUTPUT -j LOG --log-prefix \"PAID_AGENT_BLOCK: \"\n");
    script.push_str("iptables -A OUTPUT -j DROP\n");
    Ok(script)
}

/// Ensure the named Docker network exists, creating it if absent (spec §4.2: "ensure
/// the restricted agent network exists"). A concurrent create from another worker
/// surfaces as a 409 from the daemon, which is treated as success.
pub async fn ensure_network(
    docker: &Docker,
    name: &str,
    subnet: Option<&str>,
    internal: bool,
) -> Result<(), ContainerError> {
    let mut filters = HashMap::new();
    filters.insert("name".to_string(), vec![name.to_string()]);
    let existing = docker
        .list_networks(Some(ListNetworksOptions { filters }))
        .await
        .map_err(|e| ContainerError::Provision(e.to_string()))?;
    if existing.iter().any(|n| n.name.as_deref() == Some(name)) {
        return Ok(());
    }

    let ipam = Ipam {
        config: subnet.map(|cidr| {
            vec![IpamConfig {
                subnet: Some(cidr.to_string()),
                ..Default::default()
            }]
        }),
        ..Default::default()
    };

    match docker
        .create_network(CreateNetworkOptions {
            name,
            driver: "bridge",
            internal,
            ipam,
            ..Default::default()
        })
        .await
    {
        Ok(_) => Ok(()),
        Err(bollard::errors::Error::DockerResponseServerError { status_code: 409, .. }) => Ok(()),
        Err(e) => Err(ContainerError::Provision(e.to_string())),
    }
}

/// Docker network names/config used throughout C1 (spec §4.2).
#[derive(Debug, Clone)]
pub struct NetworkPolicy {
    pub config: NetworkConfig,
    cidr_cache: Arc<OnceLock<Vec<String>>>,
}

impl NetworkPolicy {
    pub fn new(config: NetworkConfig) -> Self {
        Self {
            config,
            cidr_cache: Arc::new(OnceLock::new()),
        }
    }

    /// Resolves the GitHub CIDR allowlist, fetching once per `NetworkPolicy` instance
    /// from `https://api.github.com/meta` and caching the result; falls back to the
    /// static list on fetch failure. The cache lives on this instance (shared only with
    /// its own clones via the `Arc`), never as process-wide state.
    pub async fn resolved_github_cidrs(&self) -> Vec<String> {
        if let Some(cached) = self.cidr_cache.get() {
            return cached.clone();
        }
        let cidrs = refresh_github_cidrs(&self.config.github_cidrs_fallback).await;
        let _ = self.cidr_cache.set(cidrs.clone());
        cidrs
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_cidr_with_shell_metacharacters() {
        let err = build_firewall_script("proxy.internal", 3000, &["10.0.0.0/8; rm -rf /".to_string()])
            .unwrap_err();
        assert_eq!(
            err.to_string(),
            "invalid CIDR: \"10.0.0.0/8; rm -rf /\""
        );
    }

    #[test]
    fn rejects_host_with_invalid_characters() {
        let err = build_firewall_script("proxy; rm -rf /", 3000, &[]).unwrap_err();
        assert!(matches!(err, NetworkPolicyError::InvalidHost(_)));
    }

    #[test]
    fn accepts_well_formed_inputs() {
        let script = build_firewall_script(
            "secrets-proxy.internal",
            3000,
            &["140.82.112.0/20".to_string()],
        )
        .unwrap();
        assert_eq!(script.matches("iptables -P OUTPUT DROP").count(), 1);
        assert!(script.trim_end().ends_with("-j DROP"));
        assert!(script.contains("140.82.112.0/20"));
    }

    #[test]
    fn script_always_ends_with_drop_after_log() {
        let script = build_firewall_script("proxy", 3000, &[]).unwrap();
        let lines: Vec<&str> = script.trim_end().lines().collect();
        assert!(lines[lines.len() - 2].contains("LOG"));
        assert!(lines[lines.len() - 1].ends_with("-j DROP"));
    }
}
