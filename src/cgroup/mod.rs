//! Per-scope cgroup v2 controller: tracks which executables a scope claims
//! and which live processes are currently attached to its slice.
//!
//! Grounded on `new_cgroups/controls_cgroups.go`'s `Controller`/`Manager`
//! pair. The original attaches a PID by shelling out to
//! `/bin/sh -c "echo $pid > $path"`; per the spec's redesign note this
//! becomes a direct `fs::write`, dropping the shell dependency entirely.

use std::collections::HashMap;
use std::fs;
use std::path::PathBuf;
use std::sync::{Arc, Weak};

use parking_lot::Mutex;

use crate::error::{Error, Result};
use crate::scope::ScopeId;

const PROCS_FILE: &str = "cgroup.procs";

/// A live process attached to a scope's slice, with enough information to
/// hand it back to its original cgroup on release.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcRecord {
    pub pid: u32,
    pub original_cgroup: String,
    pub exec_path: String,
}

struct ControllerInner {
    ctl_paths: Vec<String>,
    procs: HashMap<String, Vec<ProcRecord>>,
}

/// One scope's cgroup controller. Holds a non-owning [`Weak`] pointer back
/// to the [`Registry`] so cross-scope arbitration doesn't create a
/// reference cycle (spec §9: "Weak back-references").
pub struct Controller {
    pub scope: ScopeId,
    base_dir: PathBuf,
    registry: Weak<Registry>,
    inner: Mutex<ControllerInner>,
}

impl Controller {
    fn slice_dir(&self) -> PathBuf {
        self.base_dir.join(format!("{}.slice", self.scope.as_str()))
    }

    fn procs_path(&self) -> PathBuf {
        self.slice_dir().join(PROCS_FILE)
    }

    pub fn add_ctl_app_path(&self, path: &str) {
        let mut inner = self.inner.lock();
        if !inner.ctl_paths.iter().any(|p| p == path) {
            inner.ctl_paths.push(path.to_string());
        }
    }

    pub fn del_ctl_app_path(&self, path: &str) {
        self.inner.lock().ctl_paths.retain(|p| p != path);
    }

    pub fn check_ctl_path_sl(&self, path: &str) -> bool {
        self.inner.lock().ctl_paths.iter().any(|p| p == path)
    }

    /// Writes `pid\n` into this scope's `cgroup.procs`, attaching it.
    fn attach(&self, pid: u32, target: &std::path::Path) -> Result<()> {
        fs::write(target, format!("{pid}\n")).map_err(|e| {
            Error::permission(format!("attach pid {pid} to {}: {e}", target.display()))
        })
    }

    /// Attaches `proc` to this scope; idempotent if already recorded.
    pub fn add_ctrl_proc(&self, proc: ProcRecord) -> Result<()> {
        let procs_path = self.procs_path();
        let mut inner = self.inner.lock();
        let bucket = inner.procs.entry(proc.exec_path.clone()).or_default();
        if bucket.contains(&proc) {
            return Ok(());
        }
        self.attach(proc.pid, &procs_path)?;
        bucket.push(proc);
        Ok(())
    }

    /// Attaches a batch of processes claimed from another scope.
    pub fn move_in(&self, path: &str, incoming: Vec<ProcRecord>) -> Result<()> {
        for proc in incoming {
            debug_assert_eq!(proc.exec_path, path);
            self.add_ctrl_proc(proc)?;
        }
        Ok(())
    }

    /// Removes and returns the process records watched under `path`.
    pub fn move_out(&self, path: &str) -> Vec<ProcRecord> {
        self.inner.lock().procs.remove(path).unwrap_or_default()
    }

    /// Drops the bookkeeping record for `pid` under `path` without touching
    /// the rest of that path's bucket. No filesystem write: the kernel
    /// already removes the process from `cgroup.procs` when it exits, this
    /// only stops the scope from counting it as live. Returns `true` if a
    /// record was found and removed.
    pub fn forget_proc(&self, path: &str, pid: u32) -> bool {
        let mut inner = self.inner.lock();
        let Some(bucket) = inner.procs.get_mut(path) else { return false };
        let before = bucket.len();
        bucket.retain(|p| p.pid != pid);
        let removed = bucket.len() != before;
        if bucket.is_empty() {
            inner.procs.remove(path);
        }
        removed
    }

    /// Removes `path` from this scope, moving its processes to the
    /// highest-priority other scope still claiming it, or back to each
    /// process's original cgroup if none does.
    pub fn release_to_manager(&self, path: &str) -> Result<()> {
        self.del_ctl_app_path(path);
        let procs = self.move_out(path);
        if procs.is_empty() {
            return Ok(());
        }
        let registry = self
            .registry
            .upgrade()
            .ok_or_else(|| Error::state("cgroup registry has been dropped"))?;
        match registry.controller_claiming(path, self.scope) {
            Some(other) => other.move_in(path, procs),
            None => {
                for proc in procs {
                    self.attach(proc.pid, std::path::Path::new(&proc.original_cgroup))?;
                }
                Ok(())
            }
        }
    }

    /// Releases every watched path and removes this scope's slice directory.
    pub fn release_all(&self) -> Result<()> {
        let paths: Vec<String> = self.inner.lock().ctl_paths.clone();
        for path in paths {
            self.release_to_manager(&path)?;
        }
        let dir = self.slice_dir();
        match fs::remove_dir_all(&dir) {
            Ok(()) => Ok(()),
            Err(_) if !dir.exists() => Ok(()),
            Err(e) => Err(Error::permission(format!("remove {}: {e}", dir.display()))),
        }
    }
}

/// Owns every scope's [`Controller`] and arbitrates claims between them.
pub struct Registry {
    base_dir: PathBuf,
    controllers: Mutex<HashMap<ScopeId, Arc<Controller>>>,
}

impl Registry {
    pub fn new(base_dir: impl Into<PathBuf>) -> Arc<Self> {
        Arc::new(Registry { base_dir: base_dir.into(), controllers: Mutex::new(HashMap::new()) })
    }

    /// Returns the controller for `scope`, creating it (and its slice
    /// directory) on first use.
    pub fn controller(self: &Arc<Self>, scope: ScopeId) -> Result<Arc<Controller>> {
        let mut controllers = self.controllers.lock();
        if let Some(c) = controllers.get(&scope) {
            return Ok(c.clone());
        }
        let controller = Arc::new(Controller {
            scope,
            base_dir: self.base_dir.clone(),
            registry: Arc::downgrade(self),
            inner: Mutex::new(ControllerInner { ctl_paths: Vec::new(), procs: HashMap::new() }),
        });
        fs::create_dir_all(controller.slice_dir())
            .map_err(|e| Error::permission(format!("create cgroup slice: {e}")))?;
        controllers.insert(scope, controller.clone());
        Ok(controller)
    }

    /// Finds the highest-priority controller other than `exclude` that
    /// currently claims `path`.
    fn controller_claiming(&self, path: &str, exclude: ScopeId) -> Option<Arc<Controller>> {
        let controllers = self.controllers.lock();
        let mut ordered: Vec<&ScopeId> = controllers.keys().filter(|s| **s != exclude).collect();
        ordered.sort();
        ordered
            .into_iter()
            .find(|s| controllers[s].check_ctl_path_sl(path))
            .map(|s| controllers[s].clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_registry() -> (tempfile::TempDir, Arc<Registry>) {
        let dir = tempfile::tempdir().unwrap();
        let registry = Registry::new(dir.path());
        (dir, registry)
    }

    fn procs_content(ctrl: &Controller) -> String {
        fs::read_to_string(ctrl.procs_path()).unwrap_or_default()
    }

    #[test]
    fn add_ctrl_proc_writes_the_pid_and_is_idempotent() {
        let (_dir, registry) = temp_registry();
        let ctrl = registry.controller(ScopeId::Main).unwrap();
        let proc = ProcRecord { pid: 4242, original_cgroup: "/orig".into(), exec_path: "/bin/app".into() };
        ctrl.add_ctrl_proc(proc.clone()).unwrap();
        ctrl.add_ctrl_proc(proc).unwrap();
        assert_eq!(procs_content(&ctrl), "4242\n");
    }

    #[test]
    fn release_to_manager_moves_processes_to_the_highest_priority_claimant() {
        let (_dir, registry) = temp_registry();
        let app = registry.controller(ScopeId::App).unwrap();
        let global = registry.controller(ScopeId::Global).unwrap();
        app.add_ctl_app_path("/bin/app");
        global.add_ctl_app_path("/bin/app");

        let proc = ProcRecord { pid: 7, original_cgroup: "/orig".into(), exec_path: "/bin/app".into() };
        global.add_ctrl_proc(proc).unwrap();

        global.release_to_manager("/bin/app").unwrap();

        assert!(procs_content(&global).is_empty());
        assert_eq!(procs_content(&app), "7\n");
    }

    #[test]
    fn release_to_manager_falls_back_to_origin_when_unclaimed() {
        let (dir, registry) = temp_registry();
        let main = registry.controller(ScopeId::Main).unwrap();
        main.add_ctl_app_path("/bin/app");

        let origin = dir.path().join("origin.procs");
        fs::write(&origin, "").unwrap();
        let proc = ProcRecord {
            pid: 9,
            original_cgroup: origin.to_string_lossy().into_owned(),
            exec_path: "/bin/app".into(),
        };
        main.add_ctrl_proc(proc).unwrap();

        main.release_to_manager("/bin/app").unwrap();

        assert!(procs_content(&main).is_empty());
        assert_eq!(fs::read_to_string(&origin).unwrap(), "9\n");
    }

    #[test]
    fn forget_proc_removes_only_the_matching_pid() {
        let (_dir, registry) = temp_registry();
        let ctrl = registry.controller(ScopeId::Main).unwrap();
        let a = ProcRecord { pid: 1, original_cgroup: "/orig".into(), exec_path: "/bin/app".into() };
        let b = ProcRecord { pid: 2, original_cgroup: "/orig".into(), exec_path: "/bin/app".into() };
        ctrl.add_ctrl_proc(a).unwrap();
        ctrl.add_ctrl_proc(b).unwrap();

        assert!(ctrl.forget_proc("/bin/app", 1));
        assert!(!ctrl.forget_proc("/bin/app", 1));

        let remaining = ctrl.move_out("/bin/app");
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].pid, 2);
    }

    #[test]
    fn forget_proc_is_false_for_an_unknown_path() {
        let (_dir, registry) = temp_registry();
        let ctrl = registry.controller(ScopeId::Main).unwrap();
        assert!(!ctrl.forget_proc("/bin/nope", 1));
    }

    #[test]
    fn release_all_removes_the_slice_directory() {
        let (_dir, registry) = temp_registry();
        let app = registry.controller(ScopeId::App).unwrap();
        let slice_dir = app.slice_dir();
        assert!(slice_dir.exists());
        app.release_all().unwrap();
        assert!(!slice_dir.exists());
    }
}
