//! The process-wide arbitrator: one `Manager` per daemon, owning every
//! registered scope and routing process-fork/exec events to the
//! highest-priority scope that claims them.
//!
//! Grounded on `new_cgroups/controls_cgroups.go`'s `Controller.CheckCtrlPid`
//! (match an event's parent against an already-claimed process to inherit
//! its scope) and `define/define.go`'s priority ordering, generalized into
//! spec §6's "Process-events collaborator" routing rule (§4.10 in
//! SPEC_FULL.md): an event is routed to the highest-priority scope whose
//! `ProxyProgram` contains `exec_path`, or whose existing watched process is
//! the event's parent.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;

use super::{lifecycle::State, ScopeId};
use crate::cgroup::{self, ProcRecord};
use crate::error::{Error, Result};

/// A fork/exec/exit notification from the process-events collaborator
/// (external to this crate — see SPEC_FULL.md §6).
#[derive(Debug, Clone)]
pub struct ProcEvent {
    pub pid: u32,
    pub ppid: u32,
    pub exec_path: String,
    pub cgroup_path: String,
}

struct RegisteredScope {
    t_port: u16,
    proxy_program: Vec<String>,
    state: tokio::sync::Mutex<State>,
}

/// Owns every registered scope; the sole place that mutates process-wide
/// shared state (iptables, the cgroup hierarchy, TPort allocation).
pub struct Manager {
    scopes: Mutex<HashMap<ScopeId, Arc<RegisteredScope>>>,
    /// pid -> (the scope that has already claimed it, its exec path), so a
    /// later event whose `ppid` matches can inherit the same scope, and so
    /// an exit event can release the matching cgroup record.
    claimed: Mutex<HashMap<u32, (ScopeId, String)>>,
    cgroup: Arc<cgroup::Registry>,
}

impl Manager {
    pub fn new(cgroup: Arc<cgroup::Registry>) -> Self {
        Manager { scopes: Mutex::new(HashMap::new()), claimed: Mutex::new(HashMap::new()), cgroup }
    }

    /// Registers `scope` with its configured `t_port` and watched program
    /// list. Rejects a `t_port` already claimed by another scope: loopback
    /// TPROXY ports are exclusive (spec §5).
    pub fn register_scope(&self, scope: ScopeId, t_port: u16, proxy_program: Vec<String>) -> Result<()> {
        let mut scopes = self.scopes.lock();
        if let Some((other, _)) = scopes.iter().find(|(id, s)| **id != scope && s.t_port == t_port) {
            return Err(Error::config(format!(
                "TPort {t_port} is already used by scope {other}"
            )));
        }
        scopes.insert(
            scope,
            Arc::new(RegisteredScope {
                t_port,
                proxy_program,
                state: tokio::sync::Mutex::new(State::Stopped),
            }),
        );
        Ok(())
    }

    pub async fn state_of(&self, scope: ScopeId) -> Option<State> {
        let handle = self.scopes.lock().get(&scope).cloned()?;
        let state = *handle.state.lock().await;
        Some(state)
    }

    pub async fn advance(&self, scope: ScopeId, to: State) -> Result<()> {
        let handle = self
            .scopes
            .lock()
            .get(&scope)
            .cloned()
            .ok_or_else(|| Error::state(format!("scope {scope} is not registered")))?;
        let mut state = handle.state.lock().await;
        *state = state.advance(to)?;
        Ok(())
    }

    /// Routes a process event to the scope that should own it, in priority
    /// order (`Main` before `App` before `Global`), records the claim so a
    /// later child process inherits it via `ppid`, and attaches the process
    /// to that scope's cgroup slice via `AddCtrlProc` (spec §4.10).
    pub fn handle_proc_event(&self, event: &ProcEvent) -> Option<ScopeId> {
        let scopes = self.scopes.lock();
        let mut ordered: Vec<ScopeId> = scopes.keys().copied().collect();
        ordered.sort();

        let claimed_by_program = ordered
            .iter()
            .find(|id| scopes[id].proxy_program.iter().any(|p| p == &event.exec_path))
            .copied();
        drop(scopes);

        let scope = claimed_by_program.or_else(|| {
            self.claimed.lock().get(&event.ppid).map(|(scope, _)| *scope)
        })?;

        let record = ProcRecord {
            pid: event.pid,
            original_cgroup: event.cgroup_path.clone(),
            exec_path: event.exec_path.clone(),
        };
        match self.cgroup.controller(scope).and_then(|ctrl| ctrl.add_ctrl_proc(record)) {
            Ok(()) => {}
            Err(e) => log::warn!("scope {scope}: failed to attach pid {} to cgroup slice: {e}", event.pid),
        }

        self.claimed.lock().insert(event.pid, (scope, event.exec_path.clone()));
        Some(scope)
    }

    /// Forgets a process (exit event) and releases its cgroup bookkeeping.
    /// No filesystem write is needed: the kernel already drops the exited
    /// process from `cgroup.procs` on its own.
    pub fn forget_proc(&self, pid: u32) {
        let Some((scope, exec_path)) = self.claimed.lock().remove(&pid) else { return };
        if let Ok(ctrl) = self.cgroup.controller(scope) {
            ctrl.forget_proc(&exec_path, pid);
        }
    }
}
