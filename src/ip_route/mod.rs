//! Installs the fwmark policy-routing rule a scope's TPROXY listener needs:
//! packets marked with the scope's `TPort` are routed through a table that
//! sends everything back to `lo`, so the kernel can deliver them to a
//! listener bound on loopback. Grounded on `ip_route/Manager.go`'s
//! `Manager`/`Route` naming, adapted from its bespoke route-object API to a
//! direct [`ProcessRunner`] argv builder in the style of the iptables
//! module, since the source file available here stops at construction and
//! does not show the underlying `ip` invocations.

use crate::error::Result;
use crate::runner::ProcessRunner;

/// Builds the install/remove argv pairs for one scope's routing table. The
/// mark value equals the table id equals `TPort`, so a single integer
/// parameterizes both (spec §4.3).
pub struct Route {
    pub t_port: u16,
}

impl Route {
    pub fn new(t_port: u16) -> Self {
        Route { t_port }
    }

    fn table(&self) -> String {
        self.t_port.to_string()
    }

    pub fn install_argv(&self) -> [Vec<String>; 2] {
        let table = self.table();
        [
            vec!["rule".into(), "add".into(), "fwmark".into(), self.t_port.to_string(), "table".into(), table.clone()],
            vec!["route".into(), "add".into(), "local".into(), "0.0.0.0/0".into(), "dev".into(), "lo".into(), "table".into(), table],
        ]
    }

    pub fn remove_argv(&self) -> [Vec<String>; 2] {
        let table = self.table();
        [
            vec!["route".into(), "flush".into(), "table".into(), table.clone()],
            vec!["rule".into(), "del".into(), "fwmark".into(), self.t_port.to_string(), "table".into(), table],
        ]
    }

    pub fn install(&self, runner: &dyn ProcessRunner) -> Result<()> {
        for argv in self.install_argv() {
            runner.run("ip", &argv)?;
        }
        Ok(())
    }

    pub fn remove(&self, runner: &dyn ProcessRunner) -> Result<()> {
        for argv in self.remove_argv() {
            runner.run("ip", &argv)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runner::RecordingProcessRunner;

    #[test]
    fn install_marks_and_routes_to_loopback() {
        let route = Route::new(8900);
        let runner = RecordingProcessRunner::new();
        route.install(&runner).unwrap();
        let calls = runner.calls();
        assert_eq!(calls.len(), 2);
        assert!(calls[0].1.iter().any(|a| a == "fwmark"));
        assert!(calls[1].1.iter().any(|a| a == "lo"));
    }

    #[test]
    fn remove_reverses_install_in_opposite_order() {
        let route = Route::new(9000);
        assert_eq!(route.remove_argv()[1], [
            "rule".to_string(), "del".to_string(), "fwmark".to_string(),
            "9000".to_string(), "table".to_string(), "9000".to_string(),
        ]);
        assert_eq!(route.install_argv()[0][..2], ["rule".to_string(), "add".to_string()]);
        assert_eq!(route.remove_argv()[1][..2], ["rule".to_string(), "del".to_string()]);
    }
}
