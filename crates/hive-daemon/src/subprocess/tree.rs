//! Process-tree discovery and signalling.
//!
//! Descendants are found by walking parent pids in `/proc/*/stat`. On
//! systems without procfs only the root is known; the process group still
//! reaches children that did not leave it.

use std::collections::{HashMap, HashSet, VecDeque};
use std::path::Path;

use tracing::{debug, warn};

/// Signals used by the supervisor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signal {
    Term,
    Kill,
}

impl Signal {
    const fn raw(self) -> i32 {
        match self {
            Self::Term => libc::SIGTERM,
            Self::Kill => libc::SIGKILL,
        }
    }
}

/// Fields of `/proc/<pid>/stat` the supervisor cares about.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct StatLine {
    state: char,
    ppid: u32,
    pgrp: u32,
}

/// Parse a stat line. `comm` may hold spaces and parentheses, so fields are
/// counted from the last `)`.
fn parse_stat(line: &str) -> Option<StatLine> {
    let rest = &line[line.rfind(')')? + 1..];
    let mut fields = rest.split_whitespace();
    let state = fields.next()?.chars().next()?;
    let ppid = fields.next()?.parse().ok()?;
    let pgrp = fields.next()?.parse().ok()?;
    Some(StatLine { state, ppid, pgrp })
}

fn read_stat(pid: u32) -> Option<StatLine> {
    let line = std::fs::read_to_string(format!("/proc/{pid}/stat")).ok()?;
    parse_stat(&line)
}

/// Stat of every process in `/proc`.
fn all_stats() -> Vec<(u32, StatLine)> {
    let Ok(entries) = std::fs::read_dir("/proc") else {
        return Vec::new();
    };
    entries
        .filter_map(Result::ok)
        .filter_map(|e| e.file_name().to_str()?.parse::<u32>().ok())
        .filter_map(|pid| Some((pid, read_stat(pid)?)))
        .collect()
}

/// Snapshot of `pid -> ppid` for every live process.
fn parent_map() -> HashMap<u32, u32> {
    all_stats()
        .into_iter()
        .map(|(pid, stat)| (pid, stat.ppid))
        .collect()
}

/// Live (non-zombie) members of process group `pgid`.
///
/// Finds processes whose parent already exited and that were reparented,
/// which a parent walk from the group leader misses.
pub fn group_members(pgid: u32) -> Vec<u32> {
    let mut members: Vec<u32> = all_stats()
        .into_iter()
        .filter(|(_, stat)| stat.pgrp == pgid && stat.state != 'Z')
        .map(|(pid, _)| pid)
        .collect();
    members.sort_unstable();
    members
}

/// All transitive descendants of `root`, excluding `root`.
pub fn descendants(root: u32) -> Vec<u32> {
    let parents = parent_map();
    let mut children: HashMap<u32, Vec<u32>> = HashMap::new();
    for (&pid, &ppid) in &parents {
        children.entry(ppid).or_default().push(pid);
    }

    let mut found = Vec::new();
    let mut seen = HashSet::from([root]);
    let mut queue = VecDeque::from([root]);
    while let Some(pid) = queue.pop_front() {
        for &child in children.get(&pid).into_iter().flatten() {
            if seen.insert(child) {
                found.push(child);
                queue.push_back(child);
            }
        }
    }
    found
}

/// `root` followed by its descendants.
pub fn process_tree(root: u32) -> Vec<u32> {
    let mut tree = vec![root];
    tree.extend(descendants(root));
    tree
}

/// Whether a process still runs. Zombies count as dead.
pub fn is_alive(pid: u32) -> bool {
    if Path::new("/proc/self/stat").exists() {
        return read_stat(pid).is_some_and(|s| s.state != 'Z');
    }
    send(pid, None).is_ok()
}

/// Resident set size in KiB, from `/proc/<pid>/statm`.
pub fn rss_kb(pid: u32) -> Option<u64> {
    let statm = std::fs::read_to_string(format!("/proc/{pid}/statm")).ok()?;
    let pages: u64 = statm.split_whitespace().nth(1)?.parse().ok()?;
    Some(pages * page_size() / 1024)
}

fn page_size() -> u64 {
    // SAFETY: sysconf has no preconditions and only reads a constant.
    #[allow(unsafe_code)]
    let size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    u64::try_from(size).unwrap_or(4096)
}

/// Signal one process. A process that is already gone is not an error.
pub fn signal(pid: u32, sig: Signal) {
    if let Err(e) = send(pid, Some(sig))
        && e.raw_os_error() != Some(libc::ESRCH)
    {
        warn!(pid, ?sig, error = %e, "Failed to signal process");
    }
}

/// Signal a whole process group.
pub fn signal_group(pgid: u32, sig: Signal) {
    let Ok(raw) = i32::try_from(pgid) else {
        return;
    };
    // SAFETY: killpg(2) only sends a signal; the group id comes from a child
    // we spawned with process_group(0).
    #[allow(unsafe_code)]
    let ret = unsafe { libc::killpg(raw, sig.raw()) };
    if ret != 0 {
        let err = std::io::Error::last_os_error();
        if err.raw_os_error() != Some(libc::ESRCH) {
            warn!(pgid, ?sig, error = %err, "Failed to signal process group");
        } else {
            debug!(pgid, "Process group already gone");
        }
    }
}

/// `kill(2)`; `None` only checks that the process exists.
fn send(pid: u32, sig: Option<Signal>) -> std::io::Result<()> {
    let raw = i32::try_from(pid)
        .map_err(|_| std::io::Error::new(std::io::ErrorKind::InvalidInput, "pid out of range"))?;
    // SAFETY: kill(2) with a positive pid targets exactly one process and has
    // no memory-safety preconditions.
    #[allow(unsafe_code)]
    let ret = unsafe { libc::kill(raw, sig.map_or(0, Signal::raw)) };
    if ret == 0 {
        Ok(())
    } else {
        Err(std::io::Error::last_os_error())
    }
}

#[cfg(test)]
#[allow(clippy::panic, clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn parse_stat_handles_odd_command_names() {
        let line = "4242 (my (odd) cmd) S 17 4242 4242 0 -1 4194560";
        assert_eq!(
            parse_stat(line),
            Some(StatLine {
                state: 'S',
                ppid: 17,
                pgrp: 4242
            })
        );
        assert_eq!(parse_stat("garbage"), None);
    }

    #[test]
    fn own_process_is_alive() {
        assert!(is_alive(std::process::id()));
        assert!(process_tree(std::process::id()).contains(&std::process::id()));
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn rss_of_self_is_reported() {
        assert!(rss_kb(std::process::id()).unwrap() > 0);
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn spawned_child_is_a_descendant() {
        let mut child = std::process::Command::new("sleep").arg("5").spawn().unwrap();
        let pid = child.id();
        assert!(descendants(std::process::id()).contains(&pid));

        signal(pid, Signal::Kill);
        child.wait().unwrap();
        assert!(!is_alive(pid));
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn group_members_lists_the_group() {
        use std::os::unix::process::CommandExt;

        let mut child = std::process::Command::new("sleep")
            .arg("5")
            .process_group(0)
            .spawn()
            .unwrap();
        let pid = child.id();
        assert_eq!(group_members(pid), vec![pid]);

        signal_group(pid, Signal::Kill);
        child.wait().unwrap();
        assert!(group_members(pid).is_empty());
    }
}
