//! Synthesizes the `mangle`/`nat` rule plan for one scope: a TPROXY mark
//! chain gated on cgroup membership, plus an optional DNS redirect.
//!
//! Grounded on `proxy/proxyPriv_iptables.go` and the `CompleteRule`/
//! `BaseRule`/`ExtendsRule` model described in the spec's data model: a rule
//! is a match list plus a jump action, and delete-by-spec reconstructs the
//! exact same argv (with `-A`/`-I` swapped for `-D`) so insert and teardown
//! are always exact inverses of one another.

use crate::runner::ProcessRunner;
use crate::scope::ScopeId;

/// A single `-m <module> <flag> <param>` match, e.g. `-m cgroup --path X`.
#[derive(Debug, Clone)]
pub struct ExtendsRule {
    pub module: String,
    pub base: BaseRule,
}

impl ExtendsRule {
    fn to_argv(&self) -> Vec<String> {
        let mut v = vec!["-m".to_string(), self.module.clone()];
        v.extend(self.base.to_argv());
        v
    }
}

/// A single match flag, e.g. `-p tcp` or `--dport 53`, optionally negated.
#[derive(Debug, Clone)]
pub struct BaseRule {
    pub not: bool,
    pub flag: String,
    pub param: Option<String>,
}

impl BaseRule {
    pub fn new(flag: impl Into<String>, param: impl Into<String>) -> Self {
        BaseRule { not: false, flag: flag.into(), param: Some(param.into()) }
    }

    pub fn negated(mut self, not: bool) -> Self {
        self.not = not;
        self
    }

    fn to_argv(&self) -> Vec<String> {
        let dash = if self.flag.chars().count() == 1 { "-" } else { "--" };
        let mut v = Vec::with_capacity(3);
        if self.not {
            v.push("!".to_string());
        }
        v.push(format!("{dash}{}", self.flag));
        if let Some(p) = &self.param {
            v.push(p.clone());
        }
        v
    }
}

/// The `-j ...` terminal of a rule.
#[derive(Debug, Clone)]
pub enum Action {
    /// Jump to a named chain (the per-scope child chain, or a builtin).
    Jump(String),
    Mark(u16),
    Tproxy { on_port: u16 },
    Redirect { to_ports: u16 },
}

impl Action {
    fn to_argv(&self) -> Vec<String> {
        match self {
            Action::Jump(target) => vec!["-j".to_string(), target.clone()],
            Action::Mark(n) => vec![
                "-j".to_string(), "MARK".to_string(),
                "--set-mark".to_string(), n.to_string(),
            ],
            Action::Tproxy { on_port } => vec![
                "-j".to_string(), "TPROXY".to_string(),
                "--on-port".to_string(), on_port.to_string(),
            ],
            Action::Redirect { to_ports } => vec![
                "-j".to_string(), "REDIRECT".to_string(),
                "--to-ports".to_string(), to_ports.to_string(),
            ],
        }
    }
}

/// A complete rule bound to a (table, chain): matches plus a jump action.
#[derive(Debug, Clone)]
pub struct CompleteRule {
    pub table: &'static str,
    pub chain: String,
    pub base: Vec<BaseRule>,
    pub extends: Vec<ExtendsRule>,
    pub action: Action,
}

impl CompleteRule {
    fn match_argv(&self) -> Vec<String> {
        let mut v = Vec::new();
        for b in &self.base {
            v.extend(b.to_argv());
        }
        for e in &self.extends {
            v.extend(e.to_argv());
        }
        v
    }

    /// `iptables -t <table> -I <chain> <index> <matches> <action>`, or an
    /// append (`-A`, no index) when `index` is `None`.
    pub fn insert_argv(&self, index: Option<usize>) -> Vec<String> {
        let mut v = vec!["-t".to_string(), self.table.to_string()];
        match index {
            Some(i) => v.extend(["-I".to_string(), self.chain.clone(), i.to_string()]),
            None => v.extend(["-A".to_string(), self.chain.clone()]),
        }
        v.extend(self.match_argv());
        v.extend(self.action.to_argv());
        v
    }

    /// `iptables -t <table> -D <chain> <matches> <action>` — the exact
    /// inverse of `insert_argv(None)` with `-A` swapped for `-D`.
    pub fn delete_argv(&self) -> Vec<String> {
        let mut v = vec!["-t".to_string(), self.table.to_string(), "-D".to_string(), self.chain.clone()];
        v.extend(self.match_argv());
        v.extend(self.action.to_argv());
        v
    }
}

/// Name of the top-level chain every scope's jump rule is inserted into.
pub const PARENT_CHAIN: &str = "main";

fn slice_name(scope: ScopeId) -> String {
    format!("{}.slice", scope.as_str())
}

fn child_chain_name(scope: ScopeId) -> String {
    scope.as_str().to_string()
}

/// Computes the index at which `scope`'s jump rule should be inserted into
/// the parent chain so first-match order follows scope priority, given the
/// scopes already active (in the order they currently appear in the chain).
pub fn insertion_index(active: &[ScopeId], scope: ScopeId) -> usize {
    active.iter().filter(|s| **s < scope).count()
}

/// The full rule plan for starting one scope: the parent-chain jump, the
/// child chain's mark rule, the PREROUTING TPROXY rule(s), and an optional
/// DNS redirect rule.
pub struct ScopePlan {
    pub parent_jump: CompleteRule,
    pub parent_jump_index: usize,
    pub child_chain: String,
    pub child_mark: CompleteRule,
    pub prerouting_tcp: CompleteRule,
    pub prerouting_udp: Option<CompleteRule>,
    pub dns_redirect: Option<CompleteRule>,
}

/// Builds the rule plan described in spec §4.4. `udp` controls whether a
/// UDP TPROXY rule is installed alongside TCP (see DESIGN.md: this crate
/// auto-installs it whenever the scope configures a `sock5-udp` upstream,
/// generalizing the source's TCP-only builder path).
pub fn plan(
    scope: ScopeId,
    active_before: &[ScopeId],
    t_port: u16,
    dns_port: u16,
    udp: bool,
) -> ScopePlan {
    let slice = slice_name(scope);
    let child = child_chain_name(scope);
    let negate = scope == ScopeId::Global;

    let cgroup_match = ExtendsRule {
        module: "cgroup".to_string(),
        base: BaseRule::new("path", slice.clone()).negated(negate),
    };

    let parent_jump = CompleteRule {
        table: "mangle",
        chain: PARENT_CHAIN.to_string(),
        base: vec![BaseRule::new("p", "tcp")],
        extends: vec![cgroup_match.clone()],
        action: Action::Jump(child.clone()),
    };

    let child_mark = CompleteRule {
        table: "mangle",
        chain: child.clone(),
        base: vec![],
        extends: vec![],
        action: Action::Mark(t_port),
    };

    let mark_match = ExtendsRule {
        module: "mark".to_string(),
        base: BaseRule::new("mark", t_port.to_string()),
    };

    let prerouting_tcp = CompleteRule {
        table: "mangle",
        chain: "PREROUTING".to_string(),
        base: vec![BaseRule::new("p", "tcp")],
        extends: vec![mark_match.clone()],
        action: Action::Tproxy { on_port: t_port },
    };

    let prerouting_udp = udp.then(|| CompleteRule {
        table: "mangle",
        chain: "PREROUTING".to_string(),
        base: vec![BaseRule::new("p", "udp")],
        extends: vec![mark_match],
        action: Action::Tproxy { on_port: t_port },
    });

    let dns_redirect = (dns_port > 0).then(|| CompleteRule {
        table: "nat",
        chain: "OUTPUT".to_string(),
        base: vec![BaseRule::new("p", "udp"), BaseRule::new("dport", "53")],
        extends: vec![cgroup_match],
        action: Action::Redirect { to_ports: dns_port },
    });

    ScopePlan {
        parent_jump_index: insertion_index(active_before, scope),
        parent_jump,
        child_chain: child,
        child_mark,
        prerouting_tcp,
        prerouting_udp,
        dns_redirect,
    }
}

/// Installs the plan via `runner`: creates the child chain, then appends the
/// mark/TPROXY/redirect rules, then inserts the parent jump last so the
/// chain is never briefly live with a jump target that doesn't exist yet.
pub fn apply(runner: &dyn ProcessRunner, plan: &ScopePlan) -> crate::error::Result<()> {
    runner.run("iptables", &["-t".into(), "mangle".into(), "-N".into(), plan.child_chain.clone()])?;
    runner.run("iptables", &plan.child_mark.insert_argv(None))?;
    runner.run("iptables", &plan.prerouting_tcp.insert_argv(None))?;
    if let Some(udp) = &plan.prerouting_udp {
        runner.run("iptables", &udp.insert_argv(None))?;
    }
    if let Some(dns) = &plan.dns_redirect {
        runner.run("iptables", &dns.insert_argv(None))?;
    }
    runner.run("iptables", &plan.parent_jump.insert_argv(Some(plan.parent_jump_index)))?;
    Ok(())
}

/// Reverses `apply` in the opposite order: parent jump first, then the
/// per-scope rules, then the child chain itself (flush then delete).
pub fn teardown(runner: &dyn ProcessRunner, plan: &ScopePlan) -> crate::error::Result<()> {
    runner.run("iptables", &plan.parent_jump.delete_argv())?;
    if let Some(dns) = &plan.dns_redirect {
        runner.run("iptables", &dns.delete_argv())?;
    }
    if let Some(udp) = &plan.prerouting_udp {
        runner.run("iptables", &udp.delete_argv())?;
    }
    runner.run("iptables", &plan.prerouting_tcp.delete_argv())?;
    runner.run("iptables", &plan.child_mark.delete_argv())?;
    runner.run("iptables", &["-t".into(), "mangle".into(), "-F".into(), plan.child_chain.clone()])?;
    runner.run("iptables", &["-t".into(), "mangle".into(), "-X".into(), plan.child_chain.clone()])?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runner::RecordingProcessRunner;

    #[test]
    fn insert_and_delete_argv_are_exact_inverses() {
        let p = plan(ScopeId::App, &[ScopeId::Main], 8900, 8901, true);
        for rule in [
            &p.child_mark,
            &p.prerouting_tcp,
            p.prerouting_udp.as_ref().unwrap(),
            p.dns_redirect.as_ref().unwrap(),
            &p.parent_jump,
        ] {
            let insert = rule.insert_argv(None);
            let mut delete_from_insert = insert.clone();
            delete_from_insert[2] = "-D".to_string();
            assert_eq!(delete_from_insert, rule.delete_argv());
        }
    }

    #[test]
    fn global_scope_negates_the_cgroup_match() {
        let p = plan(ScopeId::Global, &[], 9000, 0, false);
        let argv = p.parent_jump.insert_argv(None);
        assert!(argv.contains(&"!".to_string()));
        assert!(p.dns_redirect.is_none());
    }

    #[test]
    fn priority_orders_the_parent_chain_insertion_index() {
        // Global starts first; when App starts later it must land before
        // Global so it is matched first.
        assert_eq!(insertion_index(&[ScopeId::Global], ScopeId::App), 0);
        // Main always goes to index 0 regardless of what's active.
        assert_eq!(insertion_index(&[ScopeId::App, ScopeId::Global], ScopeId::Main), 0);
        // Global always goes last.
        assert_eq!(insertion_index(&[ScopeId::Main, ScopeId::App], ScopeId::Global), 2);
    }

    #[test]
    fn apply_then_teardown_round_trips_argv_in_reverse_order() {
        let runner = RecordingProcessRunner::new();
        let p = plan(ScopeId::Main, &[], 7000, 0, false);
        apply(&runner, &p).unwrap();
        teardown(&runner, &p).unwrap();
        let calls = runner.calls();
        // apply: create, child_mark, prerouting_tcp, parent_jump (4 calls)
        // teardown: parent_jump, prerouting_tcp, child_mark, flush, destroy (5 calls)
        assert_eq!(calls.len(), 9);
        assert_eq!(calls[3].1, p.parent_jump.insert_argv(Some(p.parent_jump_index)));
        assert_eq!(calls[4].1, p.parent_jump.delete_argv());
    }
}
