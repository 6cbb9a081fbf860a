//! Access Control List (ACL) authorization.
//!
//! ACLs are ordered lists of allow/deny rules whose filters use MQTT
//! wildcards. The first rule whose filter matches the topic decides; a topic
//! no rule matches is allowed.

use crate::subtree::topic_matches_filter;

/// Whether a matching rule grants or refuses access.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Access {
    Allow,
    Deny,
}

/// One ACL rule: an access decision bound to a topic filter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AclRule {
    pub access: Access,
    pub filter: String,
}

impl AclRule {
    pub fn allow(filter: impl Into<String>) -> Self {
        Self {
            access: Access::Allow,
            filter: filter.into(),
        }
    }

    pub fn deny(filter: impl Into<String>) -> Self {
        Self {
            access: Access::Deny,
            filter: filter.into(),
        }
    }

    /// Parse a config rule of the form `allow <filter>` / `deny <filter>`.
    pub fn parse(rule: &str) -> Option<Self> {
        let (verb, filter) = rule.trim().split_once(char::is_whitespace)?;
        let filter = filter.trim();
        if filter.is_empty() {
            return None;
        }
        match verb {
            "allow" => Some(Self::allow(filter)),
            "deny" => Some(Self::deny(filter)),
            _ => None,
        }
    }
}

/// Evaluate an ordered ACL against a concrete topic.
///
/// First match wins; no match is an implicit allow. The empty topic always
/// fails, which is how publishes with an unresolved topic alias get refused.
pub fn authorize_topic(topic: &str, rules: &[AclRule]) -> bool {
    if topic.is_empty() {
        return false;
    }
    for rule in rules {
        if topic_matches_filter(topic, &rule.filter) {
            return rule.access == Access::Allow;
        }
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_match_wins() {
        let rules = vec![
            AclRule::deny("sensors/secret/#"),
            AclRule::allow("sensors/#"),
            AclRule::deny("#"),
        ];

        assert!(!authorize_topic("sensors/secret/key", &rules));
        assert!(authorize_topic("sensors/1/temp", &rules));
        assert!(!authorize_topic("actuators/door", &rules));
    }

    #[test]
    fn test_no_match_is_allow() {
        let rules = vec![AclRule::deny("private/#")];
        assert!(authorize_topic("public/data", &rules));
        assert!(authorize_topic("anything", &[]));
    }

    #[test]
    fn test_empty_topic_always_denied() {
        assert!(!authorize_topic("", &[]));
        assert!(!authorize_topic("", &[AclRule::allow("#")]));
    }

    #[test]
    fn test_parse_rules() {
        assert_eq!(AclRule::parse("allow sensors/#"), Some(AclRule::allow("sensors/#")));
        assert_eq!(AclRule::parse("deny  $SYS/#"), Some(AclRule::deny("$SYS/#")));
        assert_eq!(AclRule::parse("permit x"), None);
        assert_eq!(AclRule::parse("allow"), None);
        assert_eq!(AclRule::parse("deny "), None);
    }
}
