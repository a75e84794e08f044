//! Access control rules attached to resources.
//!
//! A resource carries a list of `(principal, action, allow|deny)` rules and a
//! precedence mode. Only the Allow-then-Deny mode is evaluated; Deny-then-Allow
//! reports `NotImplemented` so callers never receive a guessed answer.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::error::{RepositoryError, Result};

/// Action name used for plain read access.
pub const READ: &str = "read";

/// Action name used for write access.
pub const WRITE: &str = "write";

/// The caller on whose behalf a query or lookup runs.
pub trait SecurityPrincipal: Send + Sync {
    /// Login of the user, `None` for anonymous callers.
    fn login(&self) -> Option<&str>;

    fn has_role(&self, role: &str) -> bool;
}

/// A principal described by a login and a fixed role set.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SimplePrincipal {
    login: Option<String>,
    roles: BTreeSet<String>,
}

impl SimplePrincipal {
    pub fn anonymous() -> Self {
        Self::default()
    }

    pub fn user(login: impl Into<String>) -> Self {
        Self {
            login: Some(login.into()),
            roles: BTreeSet::new(),
        }
    }

    pub fn with_role(mut self, role: impl Into<String>) -> Self {
        self.roles.insert(role.into());
        self
    }
}

impl SecurityPrincipal for SimplePrincipal {
    fn login(&self) -> Option<&str> {
        self.login.as_deref()
    }

    fn has_role(&self, role: &str) -> bool {
        self.roles.contains(role)
    }
}

/// Who a rule applies to.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Principal {
    Everyone,
    User(String),
    Role(String),
}

impl Principal {
    pub fn matches(&self, principal: &dyn SecurityPrincipal) -> bool {
        match self {
            Self::Everyone => true,
            Self::User(login) => principal.login() == Some(login.as_str()),
            Self::Role(role) => principal.has_role(role),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RuleKind {
    Allow,
    Deny,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AccessRule {
    pub principal: Principal,
    pub action: String,
    pub kind: RuleKind,
}

impl AccessRule {
    pub fn allow(principal: Principal, action: impl Into<String>) -> Self {
        Self {
            principal,
            action: action.into(),
            kind: RuleKind::Allow,
        }
    }

    pub fn deny(principal: Principal, action: impl Into<String>) -> Self {
        Self {
            principal,
            action: action.into(),
            kind: RuleKind::Deny,
        }
    }
}

/// Rule evaluation order.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Precedence {
    /// Allow rules are consulted first, matching deny rules then revoke access.
    #[default]
    AllowDeny,
    /// Deny rules first, allow rules may grant access back.
    DenyAllow,
}

impl Precedence {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::AllowDeny => "allow,deny",
            Self::DenyAllow => "deny,allow",
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccessRules {
    pub mode: Precedence,
    pub rules: Vec<AccessRule>,
}

impl AccessRules {
    pub fn new(mode: Precedence) -> Self {
        Self {
            mode,
            rules: Vec::new(),
        }
    }

    pub fn with_rule(mut self, rule: AccessRule) -> Self {
        if !self.rules.contains(&rule) {
            self.rules.push(rule);
        }
        self
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// Decides whether `principal` may perform `action`.
    ///
    /// Allow-then-Deny: without allow rules for the action everyone is
    /// allowed, otherwise only principals matching an allow rule are. A
    /// matching deny rule always revokes access.
    pub fn evaluate(&self, principal: &dyn SecurityPrincipal, action: &str) -> Result<bool> {
        match self.mode {
            Precedence::AllowDeny => {
                let mut has_allow_rules = false;
                let mut allowed = false;
                let mut denied = false;
                for rule in self.rules.iter().filter(|rule| rule.action == action) {
                    let matches = rule.principal.matches(principal);
                    match rule.kind {
                        RuleKind::Allow => {
                            has_allow_rules = true;
                            allowed |= matches;
                        }
                        RuleKind::Deny => denied |= matches,
                    }
                }
                Ok((allowed || !has_allow_rules) && !denied)
            }
            Precedence::DenyAllow => Err(RepositoryError::NotImplemented(format!(
                "access evaluation in {} mode",
                self.mode.as_str()
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ROLE_A: &str = "editor";
    const ROLE_B: &str = "publisher";

    fn principals() -> [SimplePrincipal; 4] {
        [
            SimplePrincipal::user("nobody"),
            SimplePrincipal::user("alice").with_role(ROLE_A),
            SimplePrincipal::user("bob").with_role(ROLE_B),
            SimplePrincipal::user("carol")
                .with_role(ROLE_A)
                .with_role(ROLE_B),
        ]
    }

    fn decisions(rules: &AccessRules) -> Vec<bool> {
        principals()
            .iter()
            .map(|principal| rules.evaluate(principal, READ).expect("evaluate"))
            .collect()
    }

    #[test]
    fn allow_deny_without_rules_allows_everyone() {
        let rules = AccessRules::new(Precedence::AllowDeny);
        assert_eq!(decisions(&rules), vec![true, true, true, true]);
    }

    #[test]
    fn allow_deny_allow_all() {
        let rules = AccessRules::new(Precedence::AllowDeny)
            .with_rule(AccessRule::allow(Principal::Everyone, READ));
        assert_eq!(decisions(&rules), vec![true, true, true, true]);
    }

    #[test]
    fn allow_deny_single_role() {
        let rules = AccessRules::new(Precedence::AllowDeny)
            .with_rule(AccessRule::allow(Principal::Role(ROLE_A.into()), READ));
        assert_eq!(decisions(&rules), vec![false, true, false, true]);
    }

    #[test]
    fn allow_deny_two_roles() {
        let rules = AccessRules::new(Precedence::AllowDeny)
            .with_rule(AccessRule::allow(Principal::Role(ROLE_A.into()), READ))
            .with_rule(AccessRule::allow(Principal::Role(ROLE_B.into()), READ));
        assert_eq!(decisions(&rules), vec![false, true, true, true]);
    }

    #[test]
    fn allow_deny_deny_revokes() {
        let rules = AccessRules::new(Precedence::AllowDeny)
            .with_rule(AccessRule::allow(Principal::Role(ROLE_A.into()), READ))
            .with_rule(AccessRule::deny(Principal::Role(ROLE_B.into()), READ));
        assert_eq!(decisions(&rules), vec![false, true, false, false]);
    }

    #[test]
    fn rules_for_other_actions_are_ignored() {
        let rules = AccessRules::new(Precedence::AllowDeny)
            .with_rule(AccessRule::allow(Principal::Role(ROLE_A.into()), WRITE));
        assert_eq!(decisions(&rules), vec![true, true, true, true]);
    }

    #[test]
    fn user_rule_matches_login() {
        let rules = AccessRules::new(Precedence::AllowDeny)
            .with_rule(AccessRule::allow(Principal::User("bob".into()), READ));
        assert_eq!(decisions(&rules), vec![false, false, true, false]);
        assert!(!rules
            .evaluate(&SimplePrincipal::anonymous(), READ)
            .expect("evaluate"));
    }

    #[test]
    fn deny_allow_is_not_implemented() {
        let rule_sets = [
            AccessRules::new(Precedence::DenyAllow),
            AccessRules::new(Precedence::DenyAllow)
                .with_rule(AccessRule::allow(Principal::Everyone, READ)),
            AccessRules::new(Precedence::DenyAllow)
                .with_rule(AccessRule::allow(Principal::Role(ROLE_A.into()), READ)),
        ];
        for rules in &rule_sets {
            for principal in principals() {
                let result = rules.evaluate(&principal, READ);
                assert!(matches!(result, Err(RepositoryError::NotImplemented(_))));
            }
        }
    }

    #[test]
    fn duplicate_rules_are_collapsed() {
        let rule = AccessRule::allow(Principal::Everyone, READ);
        let rules = AccessRules::default()
            .with_rule(rule.clone())
            .with_rule(rule);
        assert_eq!(rules.rules.len(), 1);
    }
}
