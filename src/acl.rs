use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use anyhow::Context;
use arc_swap::ArcSwap;
use ipnet::IpNet;
use regex::Regex;

use crate::config::AclConfig;

/// Routing policy consulted for queries that reach the local/remote race.
pub trait AclMatcher: Send + Sync {
    /// `Some(true)`: resolve through the tunnel. `Some(false)`: resolve locally.
    /// `None`: undecided, let the resolved addresses decide.
    fn should_bypass(&self, host: &str) -> Option<bool>;

    /// Whether a locally resolved address may be used without the tunnel.
    fn should_bypass_ipv4(&self, addr: Ipv4Addr) -> bool;

    fn should_bypass_ipv6(&self, addr: Ipv6Addr) -> bool;

    fn should_bypass_ip(&self, addr: IpAddr) -> bool {
        match addr {
            IpAddr::V4(v4) => self.should_bypass_ipv4(v4),
            IpAddr::V6(v6) => self.should_bypass_ipv6(v6),
        }
    }
}

impl<T: AclMatcher> AclMatcher for ArcSwap<T> {
    fn should_bypass(&self, host: &str) -> Option<bool> {
        self.load().should_bypass(host)
    }

    fn should_bypass_ipv4(&self, addr: Ipv4Addr) -> bool {
        self.load().should_bypass_ipv4(addr)
    }

    fn should_bypass_ipv6(&self, addr: Ipv6Addr) -> bool {
        self.load().should_bypass_ipv6(addr)
    }
}

#[derive(Debug, Clone)]
enum DomainRule {
    /// Matches the name itself and every subdomain.
    Suffix(String),
    Regex(Regex),
}

impl DomainRule {
    fn matches(&self, host: &str) -> bool {
        match self {
            DomainRule::Suffix(suffix) => {
                host == suffix
                    || (host.len() > suffix.len()
                        && host.ends_with(suffix.as_str())
                        && host.as_bytes()[host.len() - suffix.len() - 1] == b'.')
            }
            DomainRule::Regex(regex) => regex.is_match(host),
        }
    }
}

/// Rule-list ACL built from the `acl` section of the config file.
#[derive(Debug, Clone, Default)]
pub struct RuleAcl {
    remote: Vec<DomainRule>,
    local: Vec<DomainRule>,
    direct_nets: Vec<IpNet>,
}

impl RuleAcl {
    pub fn from_config(cfg: &AclConfig) -> anyhow::Result<Self> {
        let remote = compile_rules(&cfg.remote_domains, &cfg.remote_regex)?;
        let local = compile_rules(&cfg.local_domains, &cfg.local_regex)?;
        let direct_nets = cfg
            .direct_nets
            .iter()
            .map(|net| {
                net.parse::<IpNet>()
                    .with_context(|| format!("invalid direct net {net}"))
            })
            .collect::<anyhow::Result<Vec<_>>>()?;
        Ok(Self {
            remote,
            local,
            direct_nets,
        })
    }

    pub fn rule_count(&self) -> usize {
        self.remote.len() + self.local.len() + self.direct_nets.len()
    }

    fn contains(&self, addr: IpAddr) -> bool {
        self.direct_nets.iter().any(|net| net.contains(&addr))
    }
}

fn compile_rules(domains: &[String], patterns: &[String]) -> anyhow::Result<Vec<DomainRule>> {
    let mut rules: Vec<DomainRule> = domains
        .iter()
        .map(|d| DomainRule::Suffix(d.trim_end_matches('.').to_ascii_lowercase()))
        .collect();
    for pattern in patterns {
        let regex =
            Regex::new(pattern).with_context(|| format!("invalid domain regex {pattern}"))?;
        rules.push(DomainRule::Regex(regex));
    }
    Ok(rules)
}

impl AclMatcher for RuleAcl {
    fn should_bypass(&self, host: &str) -> Option<bool> {
        if self.remote.iter().any(|r| r.matches(host)) {
            Some(true)
        } else if self.local.iter().any(|r| r.matches(host)) {
            Some(false)
        } else {
            None
        }
    }

    fn should_bypass_ipv4(&self, addr: Ipv4Addr) -> bool {
        self.contains(IpAddr::V4(addr))
    }

    fn should_bypass_ipv6(&self, addr: Ipv6Addr) -> bool {
        self.contains(IpAddr::V6(addr))
    }
}
