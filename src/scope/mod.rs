//! Scope identity and lifecycle.
//!
//! A scope is one of the three fixed proxy domains the daemon arbitrates
//! between: `Main` (the default/global fallback), `App` (per-application
//! whitelist), and `Global` (everything not otherwise claimed). Grounded on
//! `define/define.go`'s `Scope`/`Priority` constants — `Main < App < Global`
//! in ascending priority, so a `Main` rule is always matched first in the
//! shared `iptables` chain and a `Main` cgroup always wins proc arbitration.

mod lifecycle;
mod manager;

pub use lifecycle::State;
pub use manager::{Manager, ProcEvent};

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub enum ScopeId {
    Main,
    App,
    Global,
}

impl ScopeId {
    pub const ALL: [ScopeId; 3] = [ScopeId::Main, ScopeId::App, ScopeId::Global];

    pub fn as_str(self) -> &'static str {
        match self {
            ScopeId::Main => "Main",
            ScopeId::App => "App",
            ScopeId::Global => "Global",
        }
    }
}

impl std::fmt::Display for ScopeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn priority_ordering_matches_main_app_global() {
        assert!(ScopeId::Main < ScopeId::App);
        assert!(ScopeId::App < ScopeId::Global);
    }
}
