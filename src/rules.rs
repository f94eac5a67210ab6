use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use anyhow::{bail, ensure, Context, Result};

/// One port forward, parsed from `src:dest`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Rule {
    pub source: u16,
    pub destination: u16,
}

impl FromStr for Rule {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        let (src, dest) = s
            .split_once(':')
            .with_context(|| format!("invalid forward {s:?}, expected src:dest"))?;
        let source: u16 = src
            .parse()
            .with_context(|| format!("invalid source port {src:?}"))?;
        let destination: u16 = dest
            .parse()
            .with_context(|| format!("invalid destination port {dest:?}"))?;
        ensure!(source != 0 && destination != 0, "port 0 is not forwardable");
        ensure!(
            source != destination,
            "cannot forward port {source} to itself"
        );
        Ok(Rule {
            source,
            destination,
        })
    }
}

impl fmt::Display for Rule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.source, self.destination)
    }
}

/// Immutable source-port to destination-port mapping, fixed for the
/// process lifetime.
#[derive(Debug, Clone)]
pub struct RuleSet {
    forwards: BTreeMap<u16, u16>,
}

impl RuleSet {
    /// Builds the mapping, rejecting any rule whose source port was
    /// already claimed by an earlier rule.
    pub fn new(rules: impl IntoIterator<Item = Rule>) -> Result<Self> {
        let mut forwards = BTreeMap::new();
        for rule in rules {
            if forwards.insert(rule.source, rule.destination).is_some() {
                bail!("duplicate source port {}", rule.source);
            }
        }
        Ok(RuleSet { forwards })
    }

    pub fn is_empty(&self) -> bool {
        self.forwards.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = Rule> + '_ {
        self.forwards.iter().map(|(&source, &destination)| Rule {
            source,
            destination,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_src_dest_pair() {
        let rule: Rule = "8080:80".parse().unwrap();
        assert_eq!(
            rule,
            Rule {
                source: 8080,
                destination: 80
            }
        );
    }

    #[test]
    fn rejects_missing_separator() {
        assert!("8080".parse::<Rule>().is_err());
    }

    #[test]
    fn rejects_non_numeric_port() {
        assert!("abc:80".parse::<Rule>().is_err());
        assert!("8080:http".parse::<Rule>().is_err());
    }

    #[test]
    fn rejects_out_of_range_port() {
        assert!("65536:80".parse::<Rule>().is_err());
        assert!("8080:0".parse::<Rule>().is_err());
    }

    #[test]
    fn rejects_forward_to_self() {
        assert!("8080:8080".parse::<Rule>().is_err());
    }

    #[test]
    fn rejects_duplicate_source_port() {
        let rules = ["8080:80", "8080:81"].map(|s| s.parse::<Rule>().unwrap());
        assert!(RuleSet::new(rules).is_err());
    }

    #[test]
    fn iterates_all_rules() {
        let rules = ["2222:22", "8080:80"].map(|s| s.parse::<Rule>().unwrap());
        let set = RuleSet::new(rules).unwrap();
        assert_eq!(set.iter().count(), 2);
        assert!(!set.is_empty());
    }
}
