//! Shared session resources: the port pool, per-case network device names,
//! and the cleanup registry that guarantees release of external resources
//! on every exit path.

use std::collections::BTreeSet;
use std::path::PathBuf;
use std::process::Command;
use std::sync::{Arc, Mutex};

/// Network device names for one case, derived from the case index so no
/// two cases in a session can collide.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetNames {
    pub bridge: String,
    pub tap: String,
}

impl NetNames {
    #[must_use]
    pub fn for_case(index: usize) -> Self {
        Self {
            bridge: format!("gkbr{index}"),
            tap: format!("gktap{index}"),
        }
    }
}

/// Hands out host-side TCP/UDP ports from a configured pool. Two cases
/// never hold the same port concurrently; a lease returns its port to the
/// pool on drop.
#[derive(Debug, Clone)]
pub struct PortAllocator {
    free: Arc<Mutex<BTreeSet<u16>>>,
}

impl PortAllocator {
    #[must_use]
    pub fn new(range: std::ops::RangeInclusive<u16>) -> Self {
        Self {
            free: Arc::new(Mutex::new(range.collect())),
        }
    }

    /// Take the lowest free port, or `None` when the pool is exhausted.
    ///
    /// # Panics
    /// Panics if the pool mutex is poisoned.
    #[must_use]
    pub fn acquire(&self) -> Option<PortLease> {
        #[expect(clippy::expect_used, reason = "lock poisoning is unrecoverable")]
        let mut free = self.free.lock().expect("port pool lock poisoned");
        let port = free.iter().next().copied()?;
        free.remove(&port);
        Some(PortLease {
            port,
            pool: Arc::clone(&self.free),
        })
    }

    /// Number of ports currently free.
    ///
    /// # Panics
    /// Panics if the pool mutex is poisoned.
    #[must_use]
    pub fn available(&self) -> usize {
        #[expect(clippy::expect_used, reason = "lock poisoning is unrecoverable")]
        self.free.lock().expect("port pool lock poisoned").len()
    }
}

/// An exclusive hold on one port, returned to the pool on drop.
#[derive(Debug)]
pub struct PortLease {
    port: u16,
    pool: Arc<Mutex<BTreeSet<u16>>>,
}

impl PortLease {
    #[must_use]
    pub fn port(&self) -> u16 {
        self.port
    }
}

impl Drop for PortLease {
    fn drop(&mut self) {
        if let Ok(mut free) = self.pool.lock() {
            free.insert(self.port);
        }
    }
}

#[derive(Debug, Default)]
struct CleanupState {
    pids: BTreeSet<u32>,
    ifaces: BTreeSet<String>,
    mounts: BTreeSet<PathBuf>,
}

/// Registry of external resources that must not outlive the session:
/// recorded child PIDs, network devices, and mounts. `release_all` is
/// invoked by case cleanup and again at session shutdown; failures are
/// logged as warnings and never alter verdicts.
#[derive(Debug, Default)]
pub struct CleanupRegistry {
    inner: Mutex<CleanupState>,
}

impl CleanupRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_pid(&self, pid: u32) {
        self.with(|s| {
            s.pids.insert(pid);
        });
    }

    pub fn unregister_pid(&self, pid: u32) {
        self.with(|s| {
            s.pids.remove(&pid);
        });
    }

    pub fn register_iface(&self, name: &str) {
        self.with(|s| {
            s.ifaces.insert(name.to_owned());
        });
    }

    pub fn unregister_iface(&self, name: &str) {
        self.with(|s| {
            s.ifaces.remove(name);
        });
    }

    pub fn register_mount(&self, target: PathBuf) {
        self.with(|s| {
            s.mounts.insert(target);
        });
    }

    pub fn unregister_mount(&self, target: &PathBuf) {
        self.with(|s| {
            s.mounts.remove(target);
        });
    }

    /// PIDs currently recorded as alive.
    #[must_use]
    pub fn live_pids(&self) -> Vec<u32> {
        self.with(|s| s.pids.iter().copied().collect())
    }

    /// Recorded network devices.
    #[must_use]
    pub fn live_ifaces(&self) -> Vec<String> {
        self.with(|s| s.ifaces.iter().cloned().collect())
    }

    /// Kill every recorded PID, delete every recorded network device, and
    /// unmount every recorded mount. Best-effort: each failure is logged
    /// and the next resource is still released.
    pub fn release_all(&self) {
        let state = self.with(std::mem::take);

        for pid in state.pids {
            tracing::warn!(pid, "killing leftover subprocess");
            kill_hard(pid);
        }
        for iface in state.ifaces {
            tracing::warn!(iface, "deleting leftover network device");
            let status = Command::new("sudo")
                .args(["-n", "ip", "link", "del", &iface])
                .status();
            if let Err(err) = status {
                tracing::warn!(iface, %err, "network device teardown failed");
            }
        }
        for target in state.mounts {
            tracing::warn!(target = %target.display(), "unmounting leftover filesystem");
            let status = Command::new("sudo").arg("-n").arg("umount").arg(&target).status();
            if let Err(err) = status {
                tracing::warn!(target = %target.display(), %err, "unmount failed");
            }
        }
    }

    fn with<T>(&self, f: impl FnOnce(&mut CleanupState) -> T) -> T {
        #[expect(clippy::expect_used, reason = "lock poisoning is unrecoverable")]
        let mut state = self.inner.lock().expect("cleanup registry lock poisoned");
        f(&mut state)
    }
}

/// SIGKILL a process and its group by recorded PID. Children are spawned
/// as group leaders, so the negative PID reaches everything a script
/// forked.
pub(crate) fn kill_hard(pid: u32) {
    if let Ok(pid) = i32::try_from(pid) {
        unsafe {
            libc::kill(-pid, libc::SIGKILL);
            libc::kill(pid, libc::SIGKILL);
        }
    }
}

/// SIGTERM a process and its group (the polite half of the terminate
/// sequence).
pub(crate) fn kill_soft(pid: u32) {
    if let Ok(pid) = i32::try_from(pid) {
        unsafe {
            libc::kill(-pid, libc::SIGTERM);
            libc::kill(pid, libc::SIGTERM);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn net_names_are_unique_per_index() {
        let a = NetNames::for_case(1);
        let b = NetNames::for_case(2);
        assert_ne!(a.bridge, b.bridge);
        assert_ne!(a.tap, b.tap);
        assert_ne!(a.bridge, a.tap, "bridge and tap must not collide either");
        assert!(a.bridge.len() <= 15, "must fit IFNAMSIZ");
        assert!(NetNames::for_case(99_999).tap.len() <= 15);
    }

    #[test]
    fn port_leases_are_exclusive_and_returned_on_drop() {
        let pool = PortAllocator::new(9000..=9001);
        let a = pool.acquire().expect("first port");
        let b = pool.acquire().expect("second port");
        assert_ne!(a.port(), b.port());
        assert!(pool.acquire().is_none(), "pool of two must be exhausted");
        drop(a);
        let c = pool.acquire().expect("port returned after drop");
        assert_eq!(c.port(), 9000, "lowest port is reused first");
        assert_eq!(pool.available(), 0);
        drop(b);
        drop(c);
        assert_eq!(pool.available(), 2);
    }

    #[test]
    fn registry_tracks_and_clears_resources() {
        let registry = CleanupRegistry::new();
        registry.register_pid(4242);
        registry.register_iface("gkbr1");
        assert_eq!(registry.live_pids(), vec![4242]);
        registry.unregister_pid(4242);
        registry.unregister_iface("gkbr1");
        assert!(registry.live_pids().is_empty());
        assert!(registry.live_ifaces().is_empty());
        // release_all on an empty registry is a no-op.
        registry.release_all();
    }
}
