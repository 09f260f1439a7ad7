//! Queue selectors: which queues a scheduler claims from.
//!
//! Grammar, per group:
//!
//! - `*` (or empty): every queue
//! - `a,b`: only `a` and `b`
//! - `-a,b`: every queue except `a` and `b`
//! - a trailing `:N` sets the group's thread count
//!
//! Groups are separated by `;`, e.g. `mice:1;elephants,giraffes:4;*`.

use std::str::FromStr;

use lockstep_core::ConfigError;

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum QueueSelector {
    #[default]
    All,
    Only(Vec<String>),
    Except(Vec<String>),
}

impl QueueSelector {
    pub fn only<I, S>(queues: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::Only(queues.into_iter().map(Into::into).collect())
    }

    pub fn matches(&self, queue: &str) -> bool {
        match self {
            QueueSelector::All => true,
            QueueSelector::Only(names) => names.iter().any(|n| n == queue),
            QueueSelector::Except(names) => !names.iter().any(|n| n == queue),
        }
    }
}

impl FromStr for QueueSelector {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.is_empty() || s == "*" {
            return Ok(QueueSelector::All);
        }

        let (except, list) = match s.strip_prefix('-') {
            Some(rest) => (true, rest),
            None => (false, s),
        };

        let names: Vec<String> = list.split(',').map(|n| n.trim().to_string()).collect();
        if names.iter().any(|n| n.is_empty() || n == "*" || n.starts_with('-')) {
            return Err(ConfigError::InvalidQueueSelector(s.to_string()));
        }

        Ok(if except {
            QueueSelector::Except(names)
        } else {
            QueueSelector::Only(names)
        })
    }
}

impl std::fmt::Display for QueueSelector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            QueueSelector::All => f.write_str("*"),
            QueueSelector::Only(names) => f.write_str(&names.join(",")),
            QueueSelector::Except(names) => write!(f, "-{}", names.join(",")),
        }
    }
}

/// One scheduler's worth of configuration: a selector plus an optional
/// thread count overriding the pool default.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueGroup {
    pub selector: QueueSelector,
    pub threads: Option<usize>,
}

impl QueueGroup {
    /// Parse a `;`-separated list of groups.
    pub fn parse_many(s: &str) -> Result<Vec<QueueGroup>, ConfigError> {
        if s.trim().is_empty() {
            return Ok(vec![QueueGroup {
                selector: QueueSelector::All,
                threads: None,
            }]);
        }
        s.split(';').map(str::parse).collect()
    }
}

impl FromStr for QueueGroup {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let (selector, threads) = match s.rsplit_once(':') {
            Some((selector, count)) => {
                let threads = count
                    .trim()
                    .parse::<usize>()
                    .ok()
                    .filter(|n| *n > 0)
                    .ok_or_else(|| ConfigError::InvalidQueueSelector(s.to_string()))?;
                (selector, Some(threads))
            }
            None => (s, None),
        };

        Ok(QueueGroup {
            selector: selector.parse()?,
            threads,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_the_three_forms() {
        assert_eq!("*".parse::<QueueSelector>().unwrap(), QueueSelector::All);
        assert_eq!(
            "a, b".parse::<QueueSelector>().unwrap(),
            QueueSelector::only(["a", "b"])
        );
        assert_eq!(
            "-a,b".parse::<QueueSelector>().unwrap(),
            QueueSelector::Except(vec!["a".into(), "b".into()])
        );
    }

    #[test]
    fn rejects_malformed_selectors() {
        for bad in ["a,,b", "-", "a,*", "a,-b"] {
            assert!(
                matches!(bad.parse::<QueueSelector>(), Err(ConfigError::InvalidQueueSelector(_))),
                "{bad} should be rejected"
            );
        }
    }

    #[test]
    fn except_matches_everything_else() {
        let sel: QueueSelector = "-mice".parse().unwrap();
        assert!(!sel.matches("mice"));
        assert!(sel.matches("elephants"));
    }

    #[test]
    fn parses_groups_with_thread_counts() {
        let groups = QueueGroup::parse_many("mice:1;elephants,giraffes:4;*").unwrap();
        assert_eq!(groups.len(), 3);
        assert_eq!(groups[0].threads, Some(1));
        assert_eq!(groups[1].selector, QueueSelector::only(["elephants", "giraffes"]));
        assert_eq!(groups[1].threads, Some(4));
        assert_eq!(groups[2].selector, QueueSelector::All);
        assert_eq!(groups[2].threads, None);
    }

    #[test]
    fn zero_threads_is_an_error() {
        assert!("mice:0".parse::<QueueGroup>().is_err());
        assert!("mice:x".parse::<QueueGroup>().is_err());
    }

    mod properties {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            /// Property: a selector survives a display/parse round trip and
            /// `Only` and `Except` over the same names are complements.
            #[test]
            fn only_and_except_are_complements(
                names in prop::collection::vec("[a-z]{1,8}", 1..5),
                queue in "[a-z]{1,8}",
            ) {
                let only = QueueSelector::Only(names.clone());
                let except = QueueSelector::Except(names);

                prop_assert_eq!(only.to_string().parse::<QueueSelector>().unwrap(), only.clone());
                prop_assert_eq!(except.to_string().parse::<QueueSelector>().unwrap(), except.clone());
                prop_assert_ne!(only.matches(&queue), except.matches(&queue));
            }
        }
    }
}
