use std::collections::BTreeSet;
use std::fmt;

use tracing::{debug, warn};

use crate::error::FirewallError;

/// Backend chain-name length limits. Wrapped names get the owner prefix
/// prepended, so the bare part has to stay short enough for the combined
/// name to fit.
pub const MAX_CHAIN_LEN_WRAP: usize = 11;
pub const MAX_CHAIN_LEN_NOWRAP: usize = 28;

/// Truncate a chain name to what the backend accepts.
pub fn get_chain_name(name: &str, wrap: bool) -> String {
    let limit = if wrap {
        MAX_CHAIN_LEN_WRAP
    } else {
        MAX_CHAIN_LEN_NOWRAP
    };
    name.chars().take(limit).collect()
}

/// Options controlling how a rule is added to a [`Table`].
#[derive(Debug, Clone, Default)]
pub struct RuleOpts {
    pub top: bool,
    pub tag: Option<String>,
    pub comment: Option<String>,
}

impl RuleOpts {
    pub fn top() -> Self {
        Self {
            top: true,
            ..Self::default()
        }
    }

    pub fn comment(text: &str) -> Self {
        Self {
            comment: Some(text.to_string()),
            ..Self::default()
        }
    }
}

/// One filter rule. `chain` holds the bare (truncated, unprefixed) chain
/// name; the owner prefix is applied when the rule is rendered.
#[derive(Debug, Clone)]
pub struct Rule {
    pub chain: String,
    pub rule: String,
    pub wrap: bool,
    pub top: bool,
    pub wrap_name: String,
    pub tag: Option<String>,
    pub comment: Option<String>,
}

impl PartialEq for Rule {
    fn eq(&self, other: &Self) -> bool {
        self.chain == other.chain
            && self.rule == other.rule
            && self.top == other.top
            && self.wrap == other.wrap
    }
}

impl Eq for Rule {}

impl fmt::Display for Rule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let chain = if self.wrap {
            format!("{}-{}", self.wrap_name, self.chain)
        } else {
            self.chain.clone()
        };
        // An empty rule body would leave a trailing space, which breaks
        // save/restore matching, so strip it here.
        let line = format!("-A {} {}", chain, self.rule);
        write!(f, "{}", comment_rule(line.trim_end(), self.comment.as_deref()))
    }
}

/// Append a comment match in the position the backend's save output uses
/// (just before the jump target), so rendered lines round-trip.
pub fn comment_rule(rule: &str, comment: Option<&str>) -> String {
    let Some(comment) = comment else {
        return rule.to_string();
    };
    let tag = format!("-m comment --comment \"{}\"", comment);
    if rule.starts_with("-j") {
        return format!("{} {}", tag, rule);
    }
    if let Some(pos) = rule.find(" -j ") {
        return format!("{} {} {}", &rule[..pos], tag, &rule[pos + 1..]);
    }
    format!("{} {}", rule, tag)
}

/// A filter table: the declarative model one owner maintains for a backend
/// table, namespaced under `wrap_name` so independent owners can share one
/// kernel table. Removal bookkeeping (`remove_chains`, `remove_rules`) is
/// consumed by the synchronizer to emit explicit teardown for unwrapped
/// entries.
#[derive(Debug, Clone)]
pub struct Table {
    pub rules: Vec<Rule>,
    pub remove_rules: Vec<String>,
    pub chains: BTreeSet<String>,
    pub unwrapped_chains: BTreeSet<String>,
    pub remove_chains: BTreeSet<String>,
    pub wrap_name: String,
}

impl Table {
    pub fn new(wrap_name: &str) -> Self {
        Self {
            rules: Vec::new(),
            remove_rules: Vec::new(),
            chains: BTreeSet::new(),
            unwrapped_chains: BTreeSet::new(),
            remove_chains: BTreeSet::new(),
            wrap_name: wrap_name.chars().take(16).collect(),
        }
    }

    /// Register a chain. Idempotent: re-adding an existing chain is a no-op.
    pub fn add_chain(&mut self, name: &str, wrap: bool) {
        let name = get_chain_name(name, wrap);
        if wrap {
            self.chains.insert(name);
        } else {
            self.unwrapped_chains.insert(name);
        }
    }

    /// Remove a chain. The removal cascades: all rules in the chain go, as
    /// do rules in other chains that jump to it. Unwrapped chains are also
    /// recorded for explicit teardown during the next synchronization,
    /// since nothing else would clean them out of the kernel.
    pub fn remove_chain(&mut self, name: &str, wrap: bool) {
        let name = get_chain_name(name, wrap);
        let chain_set = if wrap {
            &mut self.chains
        } else {
            &mut self.unwrapped_chains
        };

        if !chain_set.remove(&name) {
            debug!("Attempted to remove chain {} which does not exist", name);
            return;
        }

        let jump_snippet = if wrap {
            format!("-j {}-{}", self.wrap_name, name)
        } else {
            self.remove_chains.insert(name.clone());
            let snippet = format!("-j {}", name);
            let doomed: Vec<String> = self
                .rules
                .iter()
                .filter(|r| r.chain == name || r.rule.contains(&snippet))
                .map(ToString::to_string)
                .collect();
            self.remove_rules.extend(doomed);
            snippet
        };

        self.rules
            .retain(|r| r.chain != name && !r.rule.contains(&jump_snippet));
    }

    /// Add a rule, in the same textual form the backend CLI accepts, minus
    /// the leading `-A <chain>`. A `$name` token jumps to one of this
    /// owner's wrapped chains and is rewritten accordingly.
    pub fn add_rule(
        &mut self,
        chain: &str,
        rule: &str,
        wrap: bool,
        opts: RuleOpts,
    ) -> Result<(), FirewallError> {
        let chain = get_chain_name(chain, wrap);
        if wrap && !self.chains.contains(&chain) {
            return Err(FirewallError::UnknownChain(chain));
        }

        let rule = self.wrap_target_chains(rule, wrap);
        self.rules.push(Rule {
            chain,
            rule,
            wrap,
            top: opts.top,
            wrap_name: self.wrap_name.clone(),
            tag: opts.tag,
            comment: opts.comment,
        });
        Ok(())
    }

    fn wrap_target_chains(&self, rule: &str, wrap: bool) -> String {
        if !rule.contains('$') {
            return rule.to_string();
        }
        rule.split(' ')
            .map(|token| match token.strip_prefix('$') {
                Some(target) => {
                    format!("{}-{}", self.wrap_name, get_chain_name(target, wrap))
                }
                None => token.to_string(),
            })
            .collect::<Vec<_>>()
            .join(" ")
    }

    /// Remove a rule previously added with identical arguments. A miss is
    /// logged, not an error: removal races with rule-set refreshes.
    pub fn remove_rule(&mut self, chain: &str, rule: &str, wrap: bool, top: bool) {
        let chain = get_chain_name(chain, wrap);
        let rule = self.wrap_target_chains(rule, wrap);
        let candidate = Rule {
            chain: chain.clone(),
            rule: rule.clone(),
            wrap,
            top,
            wrap_name: self.wrap_name.clone(),
            tag: None,
            comment: None,
        };

        match self.rules.iter().position(|r| *r == candidate) {
            Some(index) => {
                let removed = self.rules.remove(index);
                if !wrap {
                    self.remove_rules.push(removed.to_string());
                }
            }
            None => {
                warn!(
                    "Tried to remove rule that was not there: {:?} {:?} wrap={} top={}",
                    chain, rule, wrap, top
                );
            }
        }
    }

    /// All rules currently registered for one chain.
    pub fn chain_rules(&self, chain: &str, wrap: bool) -> Vec<&Rule> {
        let chain = get_chain_name(chain, wrap);
        self.rules
            .iter()
            .filter(|r| r.chain == chain && r.wrap == wrap)
            .collect()
    }

    /// Remove every rule from a chain, keeping the chain itself.
    pub fn empty_chain(&mut self, chain: &str, wrap: bool) {
        let chain = get_chain_name(chain, wrap);
        self.rules.retain(|r| !(r.chain == chain && r.wrap == wrap));
    }

    /// Remove every rule carrying the given tag.
    pub fn clear_rules_by_tag(&mut self, tag: &str) {
        self.rules.retain(|r| r.tag.as_deref() != Some(tag));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table() -> Table {
        Table::new("isoflat")
    }

    #[test]
    fn chain_names_are_truncated() {
        assert_eq!(get_chain_name("i-physnet-with-long-name", true), "i-physnet-w");
        assert_eq!(get_chain_name("isoflat-filter-top", false), "isoflat-filter-top");
    }

    #[test]
    fn rule_renders_with_wrap_prefix() {
        let mut t = table();
        t.add_chain("chain", true);
        t.add_rule("chain", "-j DROP", true, RuleOpts::default()).unwrap();
        assert_eq!(t.rules[0].to_string(), "-A isoflat-chain -j DROP");
    }

    #[test]
    fn empty_rule_body_has_no_trailing_space() {
        let mut t = table();
        t.add_chain("chain", true);
        t.add_rule("chain", "", true, RuleOpts::default()).unwrap();
        assert_eq!(t.rules[0].to_string(), "-A isoflat-chain");
    }

    #[test]
    fn dollar_targets_are_wrapped() {
        let mut t = table();
        t.add_chain("fallback", true);
        t.add_chain("chain", true);
        t.add_rule("chain", "-j $fallback", true, RuleOpts::default())
            .unwrap();
        assert_eq!(t.rules[0].to_string(), "-A isoflat-chain -j isoflat-fallback");
    }

    #[test]
    fn add_rule_to_unknown_chain_fails() {
        let mut t = table();
        let err = t.add_rule("nope", "-j DROP", true, RuleOpts::default());
        assert!(matches!(err, Err(FirewallError::UnknownChain(_))));
    }

    #[test]
    fn remove_chain_cascades_to_jump_rules() {
        let mut t = table();
        t.add_chain("target", true);
        t.add_chain("other", true);
        t.add_rule("target", "-j DROP", true, RuleOpts::default()).unwrap();
        t.add_rule("other", "-p ipv4 -j $target", true, RuleOpts::default())
            .unwrap();
        t.add_rule("other", "-j ACCEPT", true, RuleOpts::default()).unwrap();

        t.remove_chain("target", true);

        assert!(!t.chains.contains("target"));
        assert_eq!(t.rules.len(), 1);
        assert_eq!(t.rules[0].rule, "-j ACCEPT");
    }

    #[test]
    fn removing_unwrapped_chain_records_teardown() {
        let mut t = table();
        t.add_chain("shared-top", false);
        t.add_rule("shared-top", "-j ACCEPT", false, RuleOpts::default())
            .unwrap();

        t.remove_chain("shared-top", false);

        assert!(t.remove_chains.contains("shared-top"));
        assert_eq!(t.remove_rules, vec!["-A shared-top -j ACCEPT".to_string()]);
        assert!(t.rules.is_empty());
    }

    #[test]
    fn remove_missing_chain_is_a_noop() {
        let mut t = table();
        t.remove_chain("ghost", true);
        assert!(t.rules.is_empty());
    }

    #[test]
    fn remove_rule_requires_exact_match() {
        let mut t = table();
        t.add_chain("chain", true);
        t.add_rule("chain", "-j DROP", true, RuleOpts::default()).unwrap();

        t.remove_rule("chain", "-j ACCEPT", true, false);
        assert_eq!(t.rules.len(), 1);

        t.remove_rule("chain", "-j DROP", true, false);
        assert!(t.rules.is_empty());
    }

    #[test]
    fn clear_rules_by_tag_removes_only_tagged() {
        let mut t = table();
        t.add_chain("chain", true);
        let tagged = RuleOpts {
            tag: Some("net-1".to_string()),
            ..RuleOpts::default()
        };
        t.add_rule("chain", "-j DROP", true, tagged).unwrap();
        t.add_rule("chain", "-j ACCEPT", true, RuleOpts::default()).unwrap();

        t.clear_rules_by_tag("net-1");

        assert_eq!(t.rules.len(), 1);
        assert_eq!(t.rules[0].rule, "-j ACCEPT");
    }

    #[test]
    fn comment_lands_before_jump_target() {
        assert_eq!(
            comment_rule("-A chain -s 10.0.0.0/24 -j DROP", Some("why")),
            "-A chain -s 10.0.0.0/24 -m comment --comment \"why\" -j DROP"
        );
        assert_eq!(comment_rule("-j DROP", Some("why")), "-m comment --comment \"why\" -j DROP");
        assert_eq!(comment_rule("-j DROP", None), "-j DROP");
    }
}
