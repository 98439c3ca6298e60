use std::collections::BTreeMap;

use similar::{Algorithm, DiffOp, capture_diff_slices};

/// Markers identifying per-network chains. These are diffed after all other
/// chains purely so the command script has a stable, reviewable order; the
/// backend applies the whole script atomically either way.
const NETWORK_CHAIN_MARKERS: [&str; 2] = ["-i-", "-o-"];

fn is_network_chain(name: &str) -> bool {
    NETWORK_CHAIN_MARKERS.iter().any(|m| name.contains(m))
}

/// Generate restore commands transforming `old_rules` into `new_rules`.
///
/// Both inputs are full table dumps (declarations and `-A` lines). The
/// output uses positional insert/delete commands per chain, with new chains
/// declared up front and unreferenced chains torn down at the end.
pub fn generate_path_between_rules(old_rules: &[String], new_rules: &[String]) -> Vec<String> {
    let old_by_chain = rules_by_chain(old_rules);
    let new_by_chain = rules_by_chain(new_rules);

    // All referenced chains must be declared before any rule mentions them.
    let mut statements: Vec<String> = new_by_chain
        .keys()
        .filter(|chain| !old_by_chain.contains_key(*chain))
        .map(|chain| format!(":{} - [0:0]", chain))
        .collect();

    let empty: Vec<String> = Vec::new();
    let mut all_chains: Vec<&String> = old_by_chain.keys().chain(new_by_chain.keys()).collect();
    all_chains.sort();
    all_chains.dedup();
    let (network_chains, other_chains): (Vec<_>, Vec<_>) =
        all_chains.into_iter().partition(|c| is_network_chain(c));

    for chain in other_chains.into_iter().chain(network_chains) {
        let old = old_by_chain.get(chain).unwrap_or(&empty);
        let new = new_by_chain.get(chain).unwrap_or(&empty);
        statements.extend(chain_diff_commands(chain, old, new));
    }

    // Unreferenced chains get the axe.
    for chain in old_by_chain.keys() {
        if !new_by_chain.contains_key(chain) {
            statements.push(format!("-X {}", chain));
        }
    }

    statements
}

/// Group a table dump by chain. Declaration lines create (possibly empty)
/// entries so chains without rules still participate in the diff; they may
/// be jump targets.
fn rules_by_chain(rules: &[String]) -> BTreeMap<String, Vec<String>> {
    let mut by_chain: BTreeMap<String, Vec<String>> = BTreeMap::new();
    for line in rules {
        if let Some(decl) = line.strip_prefix(':') {
            let chain = decl.split(' ').next().unwrap_or_default();
            by_chain.entry(chain.to_string()).or_default();
        } else if let Some(body) = line.strip_prefix("-A ") {
            let chain = body.split(' ').next().unwrap_or_default();
            by_chain
                .entry(chain.to_string())
                .or_default()
                .push(line.clone());
        }
    }
    by_chain
}

/// Diff one chain's rule lines and translate the edit script into
/// positional commands, tracking a running 1-based index into the live
/// chain: deletes leave the index in place (the line is gone), inserts
/// advance it, kept lines advance it silently.
fn chain_diff_commands(chain: &str, old: &[String], new: &[String]) -> Vec<String> {
    let mut statements = Vec::new();
    let mut old_index: usize = 1;

    for op in capture_diff_slices(Algorithm::Myers, old, new) {
        match op {
            DiffOp::Equal { len, .. } => {
                old_index += len;
            }
            DiffOp::Delete { old_len, .. } => {
                for _ in 0..old_len {
                    statements.push(format!("-D {} {}", chain, old_index));
                }
            }
            DiffOp::Insert {
                new_index, new_len, ..
            } => {
                for line in &new[new_index..new_index + new_len] {
                    statements.push(insert_command(chain, old_index, line));
                    old_index += 1;
                }
            }
            DiffOp::Replace {
                old_len,
                new_index,
                new_len,
                ..
            } => {
                for _ in 0..old_len {
                    statements.push(format!("-D {} {}", chain, old_index));
                }
                for line in &new[new_index..new_index + new_len] {
                    statements.push(insert_command(chain, old_index, line));
                    old_index += 1;
                }
            }
        }
    }

    statements
}

fn insert_command(chain: &str, index: usize, line: &str) -> String {
    // Strip the `-A <chain>` prefix; the insert carries the chain and
    // position itself. A line that is nothing but the chain reference
    // inserts an empty rule.
    let body = line.strip_prefix("-A ").unwrap_or(line);
    let rule = match body.split_once(' ') {
        Some((_, rest)) => rest,
        None => "",
    };
    format!("-I {} {} {}", chain, index, rule)
        .trim_end()
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lines(raw: &[&str]) -> Vec<String> {
        raw.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn identical_states_produce_no_commands() {
        let state = lines(&[":chain - [0:0]", "-A chain -j DROP", "-A chain -j ACCEPT"]);
        assert!(generate_path_between_rules(&state, &state).is_empty());
    }

    #[test]
    fn single_added_line_yields_one_insert() {
        let old = lines(&[":chain - [0:0]", "-A chain -j ACCEPT"]);
        let new = lines(&[":chain - [0:0]", "-A chain -j DROP", "-A chain -j ACCEPT"]);
        assert_eq!(
            generate_path_between_rules(&old, &new),
            vec!["-I chain 1 -j DROP".to_string()]
        );
    }

    #[test]
    fn single_removed_line_yields_one_delete() {
        let old = lines(&[":chain - [0:0]", "-A chain -j DROP", "-A chain -j ACCEPT"]);
        let new = lines(&[":chain - [0:0]", "-A chain -j ACCEPT"]);
        assert_eq!(
            generate_path_between_rules(&old, &new),
            vec!["-D chain 1".to_string()]
        );
    }

    #[test]
    fn delete_positions_track_the_shrinking_chain() {
        let old = lines(&["-A chain -a", "-A chain -b", "-A chain -c"]);
        let new = lines(&["-A chain -c"]);
        assert_eq!(
            generate_path_between_rules(&old, &new),
            vec!["-D chain 1".to_string(), "-D chain 1".to_string()]
        );
    }

    #[test]
    fn insert_after_kept_lines_uses_live_position() {
        let old = lines(&["-A chain -a", "-A chain -c"]);
        let new = lines(&["-A chain -a", "-A chain -b", "-A chain -c"]);
        assert_eq!(
            generate_path_between_rules(&old, &new),
            vec!["-I chain 2 -b".to_string()]
        );
    }

    #[test]
    fn new_chain_is_declared_before_rules() {
        let old: Vec<String> = Vec::new();
        let new = lines(&[":fresh - [0:0]", "-A fresh -j DROP"]);
        assert_eq!(
            generate_path_between_rules(&old, &new),
            vec![":fresh - [0:0]".to_string(), "-I fresh 1 -j DROP".to_string()]
        );
    }

    #[test]
    fn vanished_chain_is_torn_down_last() {
        let old = lines(&[":stale - [0:0]", "-A stale -j DROP"]);
        let new: Vec<String> = Vec::new();
        assert_eq!(
            generate_path_between_rules(&old, &new),
            vec!["-D stale 1".to_string(), "-X stale".to_string()]
        );
    }

    #[test]
    fn chain_self_reference_inserts_empty_rule() {
        let old: Vec<String> = Vec::new();
        let new = lines(&["-A chain"]);
        assert_eq!(
            generate_path_between_rules(&old, &new),
            vec![":chain - [0:0]".to_string(), "-I chain 1".to_string()]
        );
    }

    #[test]
    fn network_chains_diff_after_other_chains() {
        let old: Vec<String> = Vec::new();
        let new = lines(&[
            "-A isoflat-i-net1 -j DROP",
            "-A FORWARD -j isoflat-FORWARD",
        ]);
        let commands = generate_path_between_rules(&old, &new);
        let forward = commands
            .iter()
            .position(|c| c.starts_with("-I FORWARD"))
            .unwrap();
        let network = commands
            .iter()
            .position(|c| c.starts_with("-I isoflat-i-net1"))
            .unwrap();
        assert!(forward < network);
    }

    #[test]
    fn replace_emits_delete_then_insert() {
        let old = lines(&["-A chain -a"]);
        let new = lines(&["-A chain -b"]);
        assert_eq!(
            generate_path_between_rules(&old, &new),
            vec!["-D chain 1".to_string(), "-I chain 1 -b".to_string()]
        );
    }
}
