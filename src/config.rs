use std::fs;
use std::net::{IpAddr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use anyhow::Result;
use serde::Deserialize;
use tracing::info;

use crate::acl::RuleAcl;
use crate::hosts::HostsFile;
use crate::server::DnsServerConfig;

#[derive(Debug, Clone, Deserialize)]
pub struct SocksDnsConfig {
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default)]
    pub settings: Settings,
    /// hosts 文件路径，相对路径以配置文件所在目录为准。
    #[serde(default)]
    pub hosts_file: Option<PathBuf>,
    #[serde(default)]
    pub acl: AclConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    /// 本地 UDP 监听地址。
    #[serde(default = "default_listen")]
    pub listen: String,
    /// 上游 SOCKS5 代理。
    #[serde(default = "default_proxy")]
    pub proxy: String,
    /// 经代理访问的远端 DNS，`host:port`、`[v6]:port` 或裸主机名（端口 53）。
    #[serde(default = "default_remote_dns")]
    pub remote_dns: String,
    /// true 走 SOCKS5 CONNECT（DNS over TCP），false 走 UDP ASSOCIATE。
    #[serde(default = "default_tcp")]
    pub tcp: bool,
    #[serde(default = "default_local_timeout_ms")]
    pub local_timeout_ms: u64,
    #[serde(default = "default_remote_timeout_ms")]
    pub remote_timeout_ms: u64,
    /// 本地应答记录的 TTL（秒）。
    #[serde(default = "default_ttl")]
    pub ttl: u32,
    #[serde(default = "default_packet_size")]
    pub packet_size: usize,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            proxy: default_proxy(),
            remote_dns: default_remote_dns(),
            tcp: default_tcp(),
            local_timeout_ms: default_local_timeout_ms(),
            remote_timeout_ms: default_remote_timeout_ms(),
            ttl: default_ttl(),
            packet_size: default_packet_size(),
        }
    }
}

/// Domain and address rules for the local/remote decision.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct AclConfig {
    /// Suffixes resolved through the tunnel.
    #[serde(default)]
    pub remote_domains: Vec<String>,
    #[serde(default)]
    pub remote_regex: Vec<String>,
    /// Suffixes resolved by the local resolver.
    #[serde(default)]
    pub local_domains: Vec<String>,
    #[serde(default)]
    pub local_regex: Vec<String>,
    /// CIDRs whose locally resolved addresses may be answered directly.
    #[serde(default)]
    pub direct_nets: Vec<String>,
}

impl SocksDnsConfig {
    pub fn to_server_config(&self) -> Result<DnsServerConfig> {
        let s = &self.settings;
        let listen: SocketAddr = s
            .listen
            .parse()
            .with_context(|| format!("invalid listen address: {}", s.listen))?;
        let proxy: SocketAddr = s
            .proxy
            .parse()
            .with_context(|| format!("invalid proxy address: {}", s.proxy))?;
        let remote_dns = split_host_port(&s.remote_dns)?;
        if s.packet_size < 512 {
            anyhow::bail!("packet_size {} is below the 512-byte DNS minimum", s.packet_size);
        }

        Ok(DnsServerConfig {
            listen,
            proxy,
            remote_dns,
            tcp: s.tcp,
            local_timeout: Duration::from_millis(s.local_timeout_ms),
            remote_timeout: Duration::from_millis(s.remote_timeout_ms),
            ttl: s.ttl,
            packet_size: s.packet_size,
        })
    }

    /// Hosts file path resolved against the config file's directory.
    pub fn hosts_path(&self, config_path: &Path) -> Option<PathBuf> {
        let path = self.hosts_file.as_ref()?;
        if path.is_absolute() {
            return Some(path.clone());
        }
        let base = config_path.parent().unwrap_or_else(|| Path::new("."));
        Some(base.join(path))
    }
}

pub fn load_config(path: &Path) -> Result<SocksDnsConfig> {
    let raw = fs::read_to_string(path)
        .with_context(|| format!("read config file: {}", path.display()))?;
    let cfg: SocksDnsConfig = serde_json::from_str(&raw)
        .with_context(|| format!("parse config file: {}", path.display()))?;

    if let Some(version) = cfg.version.as_ref() {
        info!(target = "config", version = %version, "config loaded");
    }

    // 提前校验，避免热加载时才暴露错误。
    cfg.to_server_config()?;
    RuleAcl::from_config(&cfg.acl)?;

    Ok(cfg)
}

pub fn load_hosts(path: &Path) -> Result<HostsFile> {
    let raw = fs::read_to_string(path)
        .with_context(|| format!("read hosts file: {}", path.display()))?;
    Ok(HostsFile::parse(&raw))
}

/// Splits `host:port`, `[v6]:port`, a bare IPv6 literal or a bare host.
/// The port defaults to 53; brackets are stripped from the host.
pub fn split_host_port(value: &str) -> Result<(String, u16)> {
    let value = value.trim();
    if value.is_empty() {
        anyhow::bail!("empty host");
    }
    if let Ok(addr) = value.parse::<SocketAddr>() {
        return Ok((addr.ip().to_string(), addr.port()));
    }
    if let Ok(ip) = value.parse::<IpAddr>() {
        return Ok((ip.to_string(), 53));
    }
    if let Some(rest) = value.strip_prefix('[') {
        let (host, tail) = rest
            .split_once(']')
            .with_context(|| format!("unterminated bracket in {value}"))?;
        let port = match tail.strip_prefix(':') {
            Some(port) => parse_port(port, value)?,
            None if tail.is_empty() => 53,
            None => anyhow::bail!("unexpected trailing text in {value}"),
        };
        return Ok((host.to_string(), port));
    }
    match value.rsplit_once(':') {
        Some((host, port)) => Ok((host.to_string(), parse_port(port, value)?)),
        None => Ok((value.to_string(), 53)),
    }
}

fn parse_port(port: &str, value: &str) -> Result<u16> {
    port.parse::<u16>()
        .with_context(|| format!("invalid port in {value}"))
}


fn default_listen() -> String {
    "127.0.0.1:5450".to_string()
}

fn default_proxy() -> String {
    "127.0.0.1:1080".to_string()
}

fn default_remote_dns() -> String {
    "8.8.8.8:53".to_string()
}

fn default_tcp() -> bool {
    true
}

fn default_local_timeout_ms() -> u64 {
    1000
}

fn default_remote_timeout_ms() -> u64 {
    10_000
}

fn default_ttl() -> u32 {
    120
}

fn default_packet_size() -> usize {
    1500
}
