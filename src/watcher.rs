use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use arc_swap::ArcSwap;
use notify::{Config, RecommendedWatcher, RecursiveMode, Watcher};
use tracing::{debug, error, info, warn};

use crate::acl::RuleAcl;
use crate::config;
use crate::hosts::HostsFile;

const RELOAD_ATTEMPTS: u32 = 3;
const RELOAD_BACKOFF: Duration = Duration::from_millis(50);

/// Watches the config file (and the hosts file, if any) and swaps in rebuilt
/// tables on change.
pub fn spawn(
    config_path: PathBuf,
    hosts_path: Option<PathBuf>,
    hosts: Arc<ArcSwap<HostsFile>>,
    acl: Arc<ArcSwap<RuleAcl>>,
) {
    // 使用阻塞线程持有watcher，避免异步生命周期问题。
    thread::spawn(move || {
        if let Err(err) = run_watcher(&config_path, hosts_path.as_deref(), &hosts, &acl) {
            error!(target = "watcher", error = %err, "config watcher exited with error");
        }
    });
}

fn run_watcher(
    config_path: &Path,
    hosts_path: Option<&Path>,
    hosts: &ArcSwap<HostsFile>,
    acl: &ArcSwap<RuleAcl>,
) -> notify::Result<()> {
    let (tx, rx) = std::sync::mpsc::channel();
    let mut watcher: RecommendedWatcher = Watcher::new(tx, Config::default())?;
    watcher.watch(config_path, RecursiveMode::NonRecursive)?;
    let mut watched_hosts = None;
    rearm_hosts_watch(&mut watcher, &mut watched_hosts, hosts_path.map(Path::to_path_buf));

    info!(target = "watcher", path = %config_path.display(), "config watcher started");

    for res in rx {
        match res {
            Ok(_event) => {
                if let Ok(next) = reload_with_retry(config_path, hosts, acl) {
                    rearm_hosts_watch(&mut watcher, &mut watched_hosts, next);
                }
            }
            Err(err) => {
                warn!(target = "watcher", error = %err, "watcher event error");
            }
        }
    }
    Ok(())
}

/// Moves the hosts watch when a reload points `hosts_file` somewhere else.
fn rearm_hosts_watch<W: Watcher>(
    watcher: &mut W,
    watched: &mut Option<PathBuf>,
    next: Option<PathBuf>,
) {
    if *watched == next {
        return;
    }
    if let Some(old) = watched.take() {
        if let Err(err) = watcher.unwatch(&old) {
            debug!(target = "watcher", path = %old.display(), error = %err, "failed to unwatch hosts file");
        }
    }
    if let Some(path) = next {
        match watcher.watch(&path, RecursiveMode::NonRecursive) {
            Ok(()) => *watched = Some(path),
            Err(err) => {
                warn!(target = "watcher", path = %path.display(), error = %err, "cannot watch hosts file");
            }
        }
    }
}

/// Retries to ride out truncate-then-write races, then keeps the old tables.
///
/// Returns the hosts path of the applied config.
fn reload_with_retry(
    config_path: &Path,
    hosts: &ArcSwap<HostsFile>,
    acl: &ArcSwap<RuleAcl>,
) -> anyhow::Result<Option<PathBuf>> {
    let mut attempt = 1;
    loop {
        match reload(config_path) {
            Ok((new_hosts, new_acl, hosts_path)) => {
                info!(
                    target = "watcher",
                    path = %config_path.display(),
                    hosts = new_hosts.len(),
                    acl_rules = new_acl.rule_count(),
                    "tables reloaded"
                );
                hosts.store(Arc::new(new_hosts));
                acl.store(Arc::new(new_acl));
                return Ok(hosts_path);
            }
            Err(err) if attempt == RELOAD_ATTEMPTS => {
                warn!(target = "watcher", path = %config_path.display(), error = %err, "reload failed, keeping old tables");
                return Err(err);
            }
            Err(_) => {
                attempt += 1;
                thread::sleep(RELOAD_BACKOFF);
            }
        }
    }
}

/// Builds fresh hosts and ACL tables from the config file on disk, along
/// with the hosts path they were read from.
pub fn reload(config_path: &Path) -> anyhow::Result<(HostsFile, RuleAcl, Option<PathBuf>)> {
    let cfg = config::load_config(config_path)?;
    let acl = RuleAcl::from_config(&cfg.acl)?;
    let hosts_path = cfg.hosts_path(config_path);
    let hosts = match hosts_path.as_deref() {
        Some(path) => config::load_hosts(path)?,
        None => HostsFile::default(),
    };
    Ok((hosts, acl, hosts_path))
}
