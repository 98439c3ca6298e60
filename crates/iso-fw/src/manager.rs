use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use regex::Regex;
use tokio::sync::Mutex;
use tracing::{debug, error, warn};

use crate::diff::generate_path_between_rules;
use crate::error::FirewallError;
use crate::exec::CommandExecutor;
use crate::table::{RuleOpts, Table};

/// RESOURCE_PROBLEM in include/xtables.h: the restore binary could not take
/// the table lock.
const XTABLES_RESOURCE_PROBLEM_CODE: i32 = 4;

/// Lock poll interval handed to the restore binary, in microseconds.
const XLOCK_WAIT_INTERVAL: u32 = 200_000;

/// Script lines to print before and after the line a failed restore
/// complains about.
const ERROR_LINES_OF_CONTEXT: usize = 5;

/// Shared apply state: the advisory lock serializing appliers for one
/// operational namespace, and the latched "the wait flag worked" bit.
/// Process-lifetime scoped; managers for backends sharing a kernel lock
/// (iptables and ip6tables) share one of these.
#[derive(Clone, Default)]
pub struct ApplyLock {
    mutex: Arc<Mutex<()>>,
    use_wait_flag: Arc<AtomicBool>,
}

impl ApplyLock {
    pub fn new() -> Self {
        Self::default()
    }
}

#[derive(Debug, Clone)]
pub struct ManagerOpts {
    pub wrap_name: String,
    pub namespace: Option<String>,
    /// Seconds between agent reports; the restore lock waits at most a
    /// third of this so an apply cannot eat a reporting deadline.
    pub report_interval: u64,
    /// Re-diff after every apply and fail loudly on residual commands.
    pub debug_rules: bool,
}

impl Default for ManagerOpts {
    fn default() -> Self {
        Self {
            wrap_name: "isoflat".to_string(),
            namespace: None,
            report_interval: 30,
            debug_rules: false,
        }
    }
}

/// Keeps one backend's declared tables in sync with the kernel: captures
/// the live dump, rebuilds the desired state, diffs per chain, and commits
/// the resulting script as a single restore transaction.
pub struct TableManager<E: CommandExecutor> {
    binary: &'static str,
    pub tables: BTreeMap<String, Table>,
    wrap_name: String,
    namespace: Option<String>,
    executor: Arc<E>,
    lock: ApplyLock,
    report_interval: u64,
    debug_rules: bool,
}

impl<E: CommandExecutor> TableManager<E> {
    pub fn new(binary: &'static str, executor: Arc<E>, lock: ApplyLock, opts: &ManagerOpts) -> Self {
        Self {
            binary,
            tables: BTreeMap::new(),
            wrap_name: opts.wrap_name.chars().take(16).collect(),
            namespace: opts.namespace.clone(),
            executor,
            lock,
            report_interval: opts.report_interval,
            debug_rules: opts.debug_rules,
        }
    }

    /// Register the filter table with its fixed bootstrap wiring: wrapped
    /// built-in chains with their dispatch rules, the shared filter-top
    /// chain at the head of FORWARD and OUTPUT, and a local chain hanging
    /// off it. Unmatched traffic falls through to the built-in policy, so
    /// the wiring itself is fail-open.
    pub fn setup_filter_table(&mut self) -> Result<(), FirewallError> {
        let mut table = Table::new(&self.wrap_name);

        for chain in ["INPUT", "OUTPUT", "FORWARD"] {
            table.add_chain(chain, true);
            table.add_rule(chain, &format!("-j ${}", chain), false, RuleOpts::default())?;
        }

        let filter_top = format!("{}-filter-top", self.wrap_name);
        table.add_chain(&filter_top, false);
        table.add_rule("FORWARD", &format!("-j {}", filter_top), false, RuleOpts::top())?;
        table.add_rule("OUTPUT", &format!("-j {}", filter_top), false, RuleOpts::top())?;

        table.add_chain("local", true);
        table.add_rule(&filter_top, "-j $local", false, RuleOpts::default())?;

        self.tables.insert("filter".to_string(), table);
        Ok(())
    }

    /// The filter table. Creates an empty one if bootstrap never ran.
    pub fn filter(&mut self) -> &mut Table {
        let wrap_name = self.wrap_name.clone();
        self.tables
            .entry("filter".to_string())
            .or_insert_with(|| Table::new(&wrap_name))
    }

    /// Synchronize the kernel with the declared tables. Returns the command
    /// script that was committed (empty when already converged). With
    /// `debug_rules`, a second synchronization must come back empty.
    pub async fn apply(&mut self) -> Result<Vec<String>, FirewallError> {
        let lock = self.lock.clone();
        let _guard = lock.mutex.lock().await;

        let first = self.apply_synchronized().await?;
        if !self.debug_rules {
            return Ok(first);
        }

        let second = self.apply_synchronized().await?;
        if !second.is_empty() {
            let diff = second.join("\n");
            error!("{} rules did not converge. Diff:\n{}", self.binary, diff);
            return Err(FirewallError::NotConverged {
                binary: self.binary.to_string(),
                diff,
            });
        }
        Ok(first)
    }

    /// Compute the command script without committing it.
    pub async fn plan(&mut self) -> Result<Vec<String>, FirewallError> {
        match self.capture_state().await? {
            Some(lines) => Ok(self.build_commands(&lines)),
            None => Ok(Vec::new()),
        }
    }

    /// Raw live dump of the backend state.
    pub async fn dump(&self) -> Result<String, FirewallError> {
        let args = self.namespace_wrap(vec![format!("{}-save", self.binary)]);
        self.executor.execute(&args, None).await
    }

    async fn apply_synchronized(&mut self) -> Result<Vec<String>, FirewallError> {
        let Some(all_lines) = self.capture_state().await? else {
            return Ok(Vec::new());
        };

        let mut commands = self.build_commands(&all_lines);
        if commands.is_empty() {
            return Ok(commands);
        }

        let script = commands.clone();
        // Restore wants a trailing newline.
        commands.push(String::new());

        let restore_args =
            self.namespace_wrap(vec![format!("{}-restore", self.binary), "-n".to_string()]);
        if let Err(err) = self.run_restore(&restore_args, &commands).await {
            let window = failure_window(&err.to_string(), &script);
            error!(
                "Failed to apply the following set of {} rules:\n{}",
                self.binary, window
            );
            return Err(FirewallError::Apply {
                binary: self.binary.to_string(),
                window,
                source: Box::new(err),
            });
        }

        debug!(
            "{} state synchronized, {} commands issued",
            self.binary,
            script.len()
        );
        Ok(script)
    }

    /// Capture the live dump as lines. `None` means the target namespace
    /// vanished underneath us, which is benign: the caller's target no
    /// longer exists and there is nothing left to converge.
    async fn capture_state(&self) -> Result<Option<Vec<String>>, FirewallError> {
        let args = self.namespace_wrap(vec![format!("{}-save", self.binary)]);
        match self.executor.execute(&args, None).await {
            Ok(output) => Ok(Some(output.split('\n').map(str::to_string).collect())),
            Err(err) => {
                if let Some(ns) = &self.namespace {
                    if !self.namespace_exists(ns).await {
                        error!("Namespace {} was deleted during {} operations", ns, self.binary);
                        return Ok(None);
                    }
                }
                Err(err)
            }
        }
    }

    fn build_commands(&mut self, all_lines: &[String]) -> Vec<String> {
        let mut commands = Vec::new();
        let table_names: Vec<String> = self.tables.keys().cloned().collect();
        for name in table_names {
            let Some(table) = self.tables.get_mut(&name) else {
                continue;
            };
            // Isolate the lines of the table we are modifying.
            let (start, end) = find_table(all_lines, &name);
            let old_rules = &all_lines[start..end];
            let new_rules = modify_rules(old_rules, table);
            let changes = generate_path_between_rules(old_rules, &new_rules);
            if !changes.is_empty() {
                commands.push(format!("# Generated by {}", self.wrap_name));
                commands.push(format!("*{}", name));
                commands.extend(changes);
                commands.push("COMMIT".to_string());
                commands.push(format!("# Completed by {}", self.wrap_name));
            }
        }
        commands
    }

    async fn run_restore(&self, args: &[String], commands: &[String]) -> Result<(), FirewallError> {
        let payload = commands.join("\n");

        // Once the wait flag has worked, never run restore without it.
        if self.lock.use_wait_flag.load(Ordering::Relaxed) {
            return self.do_run_restore(args, &payload, true).await;
        }

        match self.do_run_restore(args, &payload, false).await {
            Err(FirewallError::Exec {
                code: Some(XTABLES_RESOURCE_PROBLEM_CODE),
                ..
            }) => {
                self.do_run_restore(args, &payload, true).await?;
                self.lock.use_wait_flag.store(true, Ordering::Relaxed);
                Ok(())
            }
            other => other,
        }
    }

    async fn do_run_restore(
        &self,
        args: &[String],
        payload: &str,
        lock: bool,
    ) -> Result<(), FirewallError> {
        let mut args = args.to_vec();
        if lock {
            args.extend([
                "-w".to_string(),
                self.xlock_wait_time().to_string(),
                "-W".to_string(),
                XLOCK_WAIT_INTERVAL.to_string(),
            ]);
        }
        self.executor.execute(&args, Some(payload)).await.map(|_| ())
    }

    /// Bounded wait for the backend table lock: give the agent some time
    /// left to report back to the server.
    fn xlock_wait_time(&self) -> u64 {
        self.report_interval / 3
    }

    fn namespace_wrap(&self, args: Vec<String>) -> Vec<String> {
        match &self.namespace {
            Some(ns) => {
                let mut wrapped = vec![
                    "ip".to_string(),
                    "netns".to_string(),
                    "exec".to_string(),
                    ns.clone(),
                ];
                wrapped.extend(args);
                wrapped
            }
            None => args,
        }
    }

    async fn namespace_exists(&self, ns: &str) -> bool {
        let args = vec!["ip".to_string(), "netns".to_string(), "list".to_string()];
        match self.executor.execute(&args, None).await {
            Ok(output) => output
                .lines()
                .any(|line| line.split_whitespace().next() == Some(ns)),
            // If even the probe fails, let the original error speak.
            Err(_) => true,
        }
    }
}

/// Locate the `*<table>` .. `COMMIT` segment in a full dump. Returns an
/// empty range when the table is not present.
fn find_table(lines: &[String], table_name: &str) -> (usize, usize) {
    if lines.len() < 3 {
        return (0, 0);
    }
    let marker = format!("*{}", table_name);
    let Some(start) = lines.iter().position(|l| l.trim() == marker) else {
        debug!("Unable to find table {}", table_name);
        return (0, 0);
    };
    match lines[start..].iter().position(|l| l.trim() == "COMMIT") {
        Some(offset) => (start, start + offset + 1),
        None => {
            warn!("Table {} has no COMMIT marker", table_name);
            (0, 0)
        }
    }
}

/// Position immediately after the chain-declaration block, where our own
/// declarations and rules get spliced in.
fn find_rules_index(lines: &[String]) -> usize {
    let mut seen_chains = false;
    let mut rules_index = 0;
    for (index, line) in lines.iter().enumerate() {
        rules_index = index;
        if !seen_chains {
            if line.starts_with(':') {
                seen_chains = true;
            }
        } else if !line.starts_with(':') {
            break;
        }
    }

    if !seen_chains {
        rules_index = 2.min(lines.len());
    }

    rules_index
}

/// Build the desired table state: foreign lines from the live dump, with
/// this owner's chain declarations and rules spliced in after the existing
/// declaration block, duplicates and removal-slated entries weeded out.
fn modify_rules(current_lines: &[String], table: &mut Table) -> Vec<String> {
    let wrap_name = table.wrap_name.clone();
    let rules: HashSet<String> = table.rules.iter().map(ToString::to_string).collect();

    // Lines that don't belong to us form the base. Our own lines are
    // re-inserted below so a changed add-order lands in the right place;
    // that includes unprefixed lines of ours like the filter-top jumps,
    // matched through the rules set.
    let mut new_filter: Vec<String> = current_lines
        .iter()
        .map(|line| line.trim().to_string())
        .filter(|line| !line.contains(&wrap_name) && !rules.contains(line))
        .collect();

    let mut our_chains: Vec<String> = table
        .chains
        .iter()
        .map(|name| format!(":{}-{}", wrap_name, name))
        .collect();

    // Unwrapped chains may already be declared by another owner; only add
    // the ones that aren't there yet.
    for name in &table.unwrapped_chains {
        let decl = format!(":{}", name);
        if !new_filter.iter().any(|line| line.contains(&decl)) {
            our_chains.push(decl);
        }
    }

    let mut top_rules = Vec::new();
    let mut bottom_rules = Vec::new();
    for rule in &table.rules {
        let line = rule.to_string();
        if rule.top {
            top_rules.push(line);
        } else {
            bottom_rules.push(line);
        }
    }

    let mut ours = our_chains;
    ours.extend(top_rules);
    ours.extend(bottom_rules);

    let rules_index = find_rules_index(&new_filter);
    new_filter.splice(rules_index..rules_index, ours);

    // Weed from the bottom up so the first occurrence of a duplicate wins.
    let mut seen: HashSet<String> = HashSet::new();
    new_filter.reverse();
    new_filter.retain(|line| {
        if !seen.insert(line.clone()) {
            let thing = if line.starts_with(':') { "chain" } else { "rule" };
            warn!(
                "Duplicate {} detected, likely a rule-generation bug. Line: {}",
                thing, line
            );
            return false;
        }
        if let Some(decl) = line.strip_prefix(':') {
            let chain = decl.split(' ').next().unwrap_or_default();
            if table.remove_chains.contains(chain) {
                return false;
            }
        } else if table.remove_rules.iter().any(|r| r == line) {
            return false;
        }
        true
    });
    new_filter.reverse();

    // Flush the removal lists, in case an entry was already gone.
    table.remove_chains.clear();
    table.remove_rules.clear();

    new_filter
}

fn failure_window(err: &str, commands: &[String]) -> String {
    let line_no = Regex::new(r"line ([0-9]+)")
        .ok()
        .and_then(|re| re.captures(err))
        .and_then(|caps| caps.get(1))
        .and_then(|m| m.as_str().parse::<usize>().ok());

    let (start, end) = match line_no {
        Some(n) => (
            n.saturating_sub(ERROR_LINES_OF_CONTEXT),
            (n + ERROR_LINES_OF_CONTEXT).min(commands.len()),
        ),
        None => (0, commands.len()),
    };

    commands[start..end]
        .iter()
        .enumerate()
        .map(|(offset, line)| format!("{:7}. {}", start + offset + 1, line))
        .collect::<Vec<_>>()
        .join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exec::testing::FakeExecutor;

    fn lines(raw: &[&str]) -> Vec<String> {
        raw.iter().map(|s| s.to_string()).collect()
    }

    fn manager(executor: Arc<FakeExecutor>, opts: &ManagerOpts) -> TableManager<FakeExecutor> {
        let mut m = TableManager::new("ebtables", executor, ApplyLock::new(), opts);
        m.setup_filter_table().unwrap();
        m
    }

    fn seeded_fake() -> Arc<FakeExecutor> {
        let fake = Arc::new(FakeExecutor::new());
        fake.seed("ebtables", "filter", &["INPUT", "FORWARD", "OUTPUT"]);
        fake
    }

    #[test]
    fn find_table_bounds_include_commit() {
        let dump = lines(&["*nat", "COMMIT", "*filter", ":INPUT ACCEPT", "-A INPUT -j X", "COMMIT", ""]);
        assert_eq!(find_table(&dump, "filter"), (2, 6));
        assert_eq!(find_table(&dump, "nat"), (0, 2));
        assert_eq!(find_table(&dump, "raw"), (0, 0));
    }

    #[test]
    fn rules_index_lands_after_declarations() {
        let segment = lines(&["*filter", ":INPUT ACCEPT", ":FORWARD ACCEPT", "-A INPUT -j X", "COMMIT"]);
        assert_eq!(find_rules_index(&segment), 3);
    }

    #[test]
    fn modify_rules_keeps_foreign_lines() {
        let mut table = Table::new("isoflat");
        table.add_chain("chain", true);
        table
            .add_rule("chain", "-j DROP", true, RuleOpts::default())
            .unwrap();

        let current = lines(&[
            "*filter",
            ":INPUT ACCEPT",
            "-A INPUT -p tcp -j ACCEPT",
            "COMMIT",
        ]);
        let new = modify_rules(&current, &mut table);

        assert_eq!(
            new,
            lines(&[
                "*filter",
                ":INPUT ACCEPT",
                ":isoflat-chain",
                "-A isoflat-chain -j DROP",
                "-A INPUT -p tcp -j ACCEPT",
                "COMMIT",
            ])
        );
    }

    #[test]
    fn modify_rules_weeds_removed_unwrapped_chain() {
        let mut table = Table::new("isoflat");
        table.add_chain("shared-top", false);
        table
            .add_rule("shared-top", "-j ACCEPT", false, RuleOpts::default())
            .unwrap();
        table.remove_chain("shared-top", false);

        let current = lines(&[
            "*filter",
            ":INPUT ACCEPT",
            ":shared-top - [0:0]",
            "-A shared-top -j ACCEPT",
            "COMMIT",
        ]);
        let new = modify_rules(&current, &mut table);

        assert!(!new.iter().any(|l| l.contains("shared-top")));
        assert!(table.remove_chains.is_empty());
        assert!(table.remove_rules.is_empty());
    }

    #[test]
    fn failure_window_centers_on_reported_line() {
        let commands: Vec<String> = (1..=20).map(|i| format!("cmd-{}", i)).collect();
        let window = failure_window("ebtables-restore: line 10 failed", &commands);
        let rendered: Vec<&str> = window.lines().collect();
        assert_eq!(rendered.len(), 10);
        assert!(rendered[0].contains("cmd-6"));
        assert!(rendered[9].contains("cmd-15"));
    }

    #[test]
    fn failure_window_without_line_number_prints_everything() {
        let commands = lines(&["a", "b"]);
        let window = failure_window("something else went wrong", &commands);
        assert_eq!(window.lines().count(), 2);
    }

    #[tokio::test]
    async fn apply_converges_and_is_idempotent() {
        let fake = seeded_fake();
        let mut m = manager(fake.clone(), &ManagerOpts::default());

        let first = m.apply().await.unwrap();
        assert!(!first.is_empty());
        assert!(first.contains(&"*filter".to_string()));
        assert!(fake.has_chain("ebtables", "filter", "isoflat-local"));

        let calls_before = fake.calls.lock().unwrap().len();
        let second = m.apply().await.unwrap();
        assert!(second.is_empty());
        // Converged state means a save and nothing else.
        assert_eq!(fake.calls.lock().unwrap().len(), calls_before + 1);
    }

    #[tokio::test]
    async fn debug_mode_detects_non_convergence() {
        let fake = seeded_fake();
        *fake.inert.lock().unwrap() = true;
        let opts = ManagerOpts {
            debug_rules: true,
            ..ManagerOpts::default()
        };
        let mut m = manager(fake, &opts);

        let err = m.apply().await.unwrap_err();
        assert!(matches!(err, FirewallError::NotConverged { .. }));
    }

    #[tokio::test]
    async fn resource_problem_latches_the_wait_flag() {
        let fake = seeded_fake();
        fake.fail_next_restore(4, "ebtables-restore: unable to take lock");
        let mut m = manager(fake.clone(), &ManagerOpts::default());

        m.apply().await.unwrap();

        let calls = fake.calls.lock().unwrap();
        let restores: Vec<&Vec<String>> = calls
            .iter()
            .filter(|args| args.iter().any(|a| a.ends_with("-restore")))
            .collect();
        assert_eq!(restores.len(), 2);
        assert!(!restores[0].contains(&"-w".to_string()));
        assert!(restores[1].contains(&"-w".to_string()));
        drop(calls);

        // A later apply goes straight to the locked variant.
        let mut table = Table::new("isoflat");
        table.add_chain("extra", true);
        table
            .add_rule("extra", "-j ACCEPT", true, RuleOpts::default())
            .unwrap();
        m.tables.insert("filter".to_string(), table);
        m.apply().await.unwrap();

        let calls = fake.calls.lock().unwrap();
        let last_restore = calls
            .iter()
            .rev()
            .find(|args| args.iter().any(|a| a.ends_with("-restore")))
            .unwrap();
        assert!(last_restore.contains(&"-w".to_string()));
    }

    #[tokio::test]
    async fn restore_failure_carries_a_windowed_script() {
        let fake = seeded_fake();
        fake.fail_next_restore(2, "ebtables-restore: line 3 failed");
        let mut m = manager(fake, &ManagerOpts::default());

        let err = m.apply().await.unwrap_err();
        match err {
            FirewallError::Apply { window, .. } => {
                assert!(window.contains("*filter"));
            }
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[tokio::test]
    async fn vanished_namespace_is_benign() {
        let fake = Arc::new(FakeExecutor::new());
        let opts = ManagerOpts {
            namespace: Some("gone".to_string()),
            ..ManagerOpts::default()
        };
        let mut m = manager(fake, &opts);

        let script = m.apply().await.unwrap();
        assert!(script.is_empty());
    }
}
