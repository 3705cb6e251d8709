//! Namespace-crossing execution context.
//!
//! Opens and caches the worker's own mount/network/UTS namespace handles at
//! startup, and offers scoped entry into a target process's namespaces with
//! guaranteed restoration: partial attachment must never be observable
//! outside of a single [`ProbeInstance::run`](crate::probe::ProbeInstance::run)
//! call.

use std::fs::File;
use std::os::fd::{AsFd, OwnedFd};
use std::path::Path;

use nix::sched::{setns, CloneFlags};

use crate::error::NamespaceEnterError;

/// The three namespace kinds this engine ever crosses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NamespaceKind {
    Mnt,
    Net,
    Uts,
}

impl NamespaceKind {
    pub fn as_proc_name(self) -> &'static str {
        match self {
            NamespaceKind::Mnt => "mnt",
            NamespaceKind::Net => "net",
            NamespaceKind::Uts => "uts",
        }
    }

    fn clone_flag(self) -> CloneFlags {
        match self {
            NamespaceKind::Mnt => CloneFlags::CLONE_NEWNS,
            NamespaceKind::Net => CloneFlags::CLONE_NEWNET,
            NamespaceKind::Uts => CloneFlags::CLONE_NEWUTS,
        }
    }
}

fn ns_path(root: &str, pid: i32, kind: NamespaceKind) -> String {
    format!("{root}/proc/{pid}/ns/{}", kind.as_proc_name())
}

fn self_ns_path(root: &str, kind: NamespaceKind) -> String {
    format!("{root}/proc/self/ns/{}", kind.as_proc_name())
}

/// Owns the worker's own mnt/net/uts namespace descriptors, opened once at
/// startup, and the inode of the worker's mount namespace used as identity.
pub struct NamespaceGate {
    root: String,
    mnt: Option<OwnedFd>,
    net: Option<OwnedFd>,
    uts: Option<OwnedFd>,
    mnt_inode: Option<u64>,
}

impl NamespaceGate {
    /// Opens the worker's own namespace handles. `root` is the
    /// `SYSDIG_HOST_ROOT`-style prefix; an empty string means "this mount
    /// namespace".
    pub fn open(root: String) -> Self {
        let mnt = File::open(self_ns_path(&root, NamespaceKind::Mnt)).ok();
        let net = File::open(self_ns_path(&root, NamespaceKind::Net)).ok();
        let uts = File::open(self_ns_path(&root, NamespaceKind::Uts)).ok();

        let mnt_inode = mnt.as_ref().and_then(|f| {
            use std::os::unix::fs::MetadataExt;
            f.metadata().ok().map(|m| m.ino())
        });

        // Container support requires all three, or none: a partial set is
        // treated the same as "no container support" rather than crossing
        // only some namespaces.
        let (mnt, net, uts) = match (mnt, net, uts) {
            (Some(m), Some(n), Some(u)) => (Some(m.into()), Some(n.into()), Some(u.into())),
            _ => (None, None, None),
        };

        Self {
            root,
            mnt,
            net,
            uts,
            mnt_inode,
        }
    }

    /// Whether all three of the worker's own namespace handles could be
    /// opened. When `false`, no probe ever runs with namespace crossing.
    pub fn container_support(&self) -> bool {
        self.mnt.is_some() && self.net.is_some() && self.uts.is_some()
    }

    pub fn root(&self) -> &str {
        &self.root
    }

    /// Stats the target's mount namespace and compares its inode against the
    /// worker's own, to decide whether the target lives in a different
    /// container.
    pub fn is_foreign(&self, pid: i32) -> Result<bool, std::io::Error> {
        let path = ns_path(&self.root, pid, NamespaceKind::Mnt);
        let inode = {
            use std::os::unix::fs::MetadataExt;
            std::fs::metadata(Path::new(&path))?.ino()
        };
        Ok(Some(inode) != self.mnt_inode)
    }

    /// Attaches the current thread to `pid`'s namespaces for every kind in
    /// `needed`, runs `body`, then restores the worker's own net, mnt, uts
    /// namespaces in that order — regardless of how `body` returns.
    ///
    /// The namespace fds opened for the excursion are closed before
    /// restoration begins.
    pub fn enter<F, T>(
        &self,
        pid: i32,
        needed: &[NamespaceKind],
        body: F,
    ) -> Result<T, NamespaceEnterError>
    where
        F: FnOnce() -> T,
    {
        // Declared before `opened` so it restores *after* `opened`'s fds are
        // closed: Rust drops locals in reverse declaration order.
        let _restore = RestoreOnDrop { gate: self };

        let mut opened: Vec<OwnedFd> = Vec::with_capacity(needed.len());
        for &kind in needed {
            let path = ns_path(&self.root, pid, kind);
            let file = File::open(&path).map_err(|source| NamespaceEnterError::Open {
                pid,
                path: path.clone(),
                source,
            })?;
            opened.push(file.into());
        }

        for (kind, fd) in needed.iter().zip(opened.iter()) {
            setns(fd.as_fd(), kind.clone_flag()).map_err(|source| NamespaceEnterError::SetNs {
                pid,
                kind: *kind,
                source,
            })?;
        }

        let result = body();
        drop(opened);
        Ok(result)
    }

    fn restore(&self) {
        // Order matters: net, then mnt, then uts, matching the order the
        // worker's own handles were opened in.
        if let Some(fd) = &self.net {
            let _ = setns(fd.as_fd(), CloneFlags::CLONE_NEWNET);
        }
        if let Some(fd) = &self.mnt {
            let _ = setns(fd.as_fd(), CloneFlags::CLONE_NEWNS);
        }
        if let Some(fd) = &self.uts {
            let _ = setns(fd.as_fd(), CloneFlags::CLONE_NEWUTS);
        }
    }
}

/// Guarantees [`NamespaceGate::restore`] runs on every exit path of
/// [`NamespaceGate::enter`], including early returns via `?`.
struct RestoreOnDrop<'a> {
    gate: &'a NamespaceGate,
}

impl<'a> Drop for RestoreOnDrop<'a> {
    fn drop(&mut self) {
        self.gate.restore();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn container_support_false_without_handles() {
        let gate = NamespaceGate {
            root: String::new(),
            mnt: None,
            net: None,
            uts: None,
            mnt_inode: None,
        };
        assert!(!gate.container_support());
    }

    #[test]
    fn ns_path_includes_root_prefix() {
        assert_eq!(ns_path("/host", 42, NamespaceKind::Net), "/host/proc/42/ns/net");
        assert_eq!(ns_path("", 42, NamespaceKind::Mnt), "/proc/42/ns/mnt");
    }

    #[test]
    fn enter_fails_cleanly_when_ns_file_missing() {
        let gate = NamespaceGate::open(String::new());
        let result = gate.enter(i32::MAX, &[NamespaceKind::Net], || 1u8);
        assert!(result.is_err());
    }
}
