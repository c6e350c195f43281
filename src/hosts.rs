use std::collections::HashMap;
use std::net::IpAddr;

use rand::seq::SliceRandom;

/// Static hostname table in `/etc/hosts` format.
#[derive(Debug, Clone, Default)]
pub struct HostsFile {
    entries: HashMap<String, Vec<IpAddr>>,
}

impl HostsFile {
    /// Parses `<ip> <host> [<host> ...]` lines; `#` starts a comment.
    /// Lines whose first field is not an address are skipped.
    pub fn parse(input: &str) -> Self {
        let mut entries: HashMap<String, Vec<IpAddr>> = HashMap::new();
        for line in input.lines() {
            let content = line.split('#').next().unwrap_or_default();
            let mut fields = content.split_whitespace();
            let Some(addr) = fields.next().and_then(|f| f.parse::<IpAddr>().ok()) else {
                continue;
            };
            for host in fields {
                let addrs = entries.entry(host.to_string()).or_default();
                if !addrs.contains(&addr) {
                    addrs.push(addr);
                }
            }
        }
        Self { entries }
    }

    /// All addresses for `host` in random order, or empty. Keys are case-sensitive.
    pub fn resolve(&self, host: &str) -> Vec<IpAddr> {
        let mut addrs = self.entries.get(host).cloned().unwrap_or_default();
        addrs.shuffle(&mut rand::thread_rng());
        addrs
    }

    /// Number of configured hostnames.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
