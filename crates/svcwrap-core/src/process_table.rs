use crate::process::ProcessId;
use std::collections::HashSet;
use std::sync::Mutex;
use sysinfo::{Pid, ProcessRefreshKind, ProcessStatus, ProcessesToUpdate, System};

/// Read-only view of the OS process table
pub struct ProcessTable {
    system: Mutex<System>,
}

impl Default for ProcessTable {
    fn default() -> Self {
        Self::new()
    }
}

impl ProcessTable {
    pub fn new() -> Self {
        Self {
            system: Mutex::new(System::new()),
        }
    }

    /// All transitive descendants of `root`, deepest first
    pub fn descendants(&self, root: ProcessId) -> Vec<ProcessId> {
        let mut system = self.system.lock().unwrap_or_else(|e| e.into_inner());
        system.refresh_processes_specifics(
            ProcessesToUpdate::All,
            true,
            ProcessRefreshKind::default(),
        );

        let mut result = Vec::new();
        let mut visited = HashSet::from([root]);
        Self::find_children_recursive(&system, root, &mut visited, &mut result);
        result
    }

    /// Whether `pid` exists and is not a zombie
    pub fn is_alive(&self, pid: ProcessId) -> bool {
        let mut system = self.system.lock().unwrap_or_else(|e| e.into_inner());
        let sys_pid = Pid::from_u32(pid);
        system.refresh_processes_specifics(
            ProcessesToUpdate::Some(&[sys_pid]),
            true,
            ProcessRefreshKind::default(),
        );
        system
            .process(sys_pid)
            .is_some_and(|p| !matches!(p.status(), ProcessStatus::Zombie | ProcessStatus::Dead))
    }

    /// Every live process accepted by `filter`
    pub fn live_matching<F>(&self, mut filter: F) -> Vec<ProcessId>
    where
        F: FnMut(ProcessId) -> bool,
    {
        let mut system = self.system.lock().unwrap_or_else(|e| e.into_inner());
        system.refresh_processes_specifics(
            ProcessesToUpdate::All,
            true,
            ProcessRefreshKind::default(),
        );
        system
            .processes()
            .iter()
            .filter(|(_, p)| !matches!(p.status(), ProcessStatus::Zombie | ProcessStatus::Dead))
            .map(|(pid, _)| pid.as_u32())
            .filter(|pid| filter(*pid))
            .collect()
    }

    /// The subset of `pids` still alive
    pub fn alive_among(&self, pids: &[ProcessId]) -> Vec<ProcessId> {
        pids.iter().copied().filter(|pid| self.is_alive(*pid)).collect()
    }

    fn find_children_recursive(
        system: &System,
        parent_pid: ProcessId,
        visited: &mut HashSet<ProcessId>,
        result: &mut Vec<ProcessId>,
    ) {
        for (pid, process) in system.processes() {
            let child_pid = pid.as_u32();
            if process.parent().map(|p| p.as_u32()) != Some(parent_pid) || !visited.insert(child_pid) {
                continue;
            }
            // Grandchildren first, then this child
            Self::find_children_recursive(system, child_pid, visited, result);
            result.push(child_pid);
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::process::SpawnRequest;
    use std::time::Duration;

    #[tokio::test]
    async fn test_descendants_found_through_parent_links() {
        let request = SpawnRequest::new("sh", ["-c", "sleep 5 & sleep 5 & wait"]);
        let mut child = request.command().spawn().unwrap();
        let root = child.id().unwrap();
        tokio::time::sleep(Duration::from_millis(300)).await;

        let table = ProcessTable::new();
        let found = table.descendants(root);
        assert_eq!(found.len(), 2, "found {found:?}");
        assert!(table.is_alive(root));
        assert_eq!(table.alive_among(&found).len(), 2);

        for pid in &found {
            let _ = nix_kill(*pid);
        }
        child.kill().await.unwrap();
        child.wait().await.unwrap();
        assert!(!table.is_alive(root));
    }

    #[tokio::test]
    async fn test_live_matching_skips_reaped_process() {
        let mut child = SpawnRequest::new("sleep", ["5"]).command().spawn().unwrap();
        let pid = child.id().unwrap();

        let table = ProcessTable::new();
        assert_eq!(table.live_matching(|p| p == pid), vec![pid]);

        child.kill().await.unwrap();
        child.wait().await.unwrap();
        assert!(table.live_matching(|p| p == pid).is_empty());
    }

    fn nix_kill(pid: ProcessId) -> std::io::Result<std::process::ExitStatus> {
        std::process::Command::new("kill")
            .arg("-9")
            .arg(pid.to_string())
            .status()
    }
}
