use std::{collections::BTreeSet, fmt, str::FromStr};

use metadata::Action;
use serde::{Deserialize, Serialize};

/// An action a registry client may ask for in a token scope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum RegistryAction {
    /// Download manifests and blobs.
    #[serde(rename = "pull")]
    Pull,
    /// Upload manifests and blobs.
    #[serde(rename = "push")]
    Push,
    /// Delete manifests, tags and blobs.
    #[serde(rename = "delete")]
    Delete,
    /// Everything.
    #[serde(rename = "*")]
    All,
}

impl RegistryAction {
    /// The permission actions required to be granted this registry action.
    pub fn required(&self) -> &'static [Action] {
        match self {
            RegistryAction::Pull => &[Action::Read],
            RegistryAction::Push => &[Action::Write],
            RegistryAction::Delete => &[Action::Delete],
            RegistryAction::All => &[Action::Read, Action::Write, Action::Delete],
        }
    }
}

impl fmt::Display for RegistryAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            RegistryAction::Pull => "pull",
            RegistryAction::Push => "push",
            RegistryAction::Delete => "delete",
            RegistryAction::All => "*",
        })
    }
}

impl FromStr for RegistryAction {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pull" => Ok(RegistryAction::Pull),
            "push" => Ok(RegistryAction::Push),
            "delete" => Ok(RegistryAction::Delete),
            "*" => Ok(RegistryAction::All),
            other => Err(other.to_owned()),
        }
    }
}

/// One grant inside a registry token: a typed, named resource and the actions allowed on it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceActions {
    /// Resource type, usually `repository` (or `registry` for the catalog).
    #[serde(rename = "type")]
    pub kind: String,

    /// Resource name, e.g. `library/alpine`.
    pub name: String,

    /// Allowed actions.
    pub actions: BTreeSet<RegistryAction>,
}

impl ResourceActions {
    /// Whether this grant covers `action` on the resource `kind:name`.
    pub fn allows(&self, kind: &str, name: &str, action: RegistryAction) -> bool {
        self.kind == kind
            && self.name == name
            && (self.actions.contains(&action) || self.actions.contains(&RegistryAction::All))
    }
}

impl fmt::Display for ResourceActions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:", self.kind, self.name)?;
        let mut first = true;
        for action in &self.actions {
            if !first {
                f.write_str(",")?;
            }
            write!(f, "{action}")?;
            first = false;
        }
        Ok(())
    }
}

/// Parse a space-separated list of `type:name:action[,action...]` scopes.
///
/// Scopes which are not exactly three colon-separated parts are skipped, as are
/// unknown actions. The caller decides whether an empty result is an error.
pub fn parse_scopes(scope: &str) -> Vec<ResourceActions> {
    scope
        .split_whitespace()
        .filter_map(|item| {
            let parts: Vec<&str> = item.split(':').collect();
            let [kind, name, actions] = parts.as_slice() else {
                tracing::debug!(scope = item, "Skipping malformed scope");
                return None;
            };
            if kind.is_empty() || name.is_empty() {
                tracing::debug!(scope = item, "Skipping scope with empty segment");
                return None;
            }

            let actions = actions
                .split(',')
                .filter(|action| !action.is_empty())
                .filter_map(|action| match action.parse::<RegistryAction>() {
                    Ok(action) => Some(action),
                    Err(unknown) => {
                        tracing::debug!(scope = item, action = %unknown, "Skipping unknown action");
                        None
                    }
                })
                .collect();

            Some(ResourceActions {
                kind: (*kind).to_owned(),
                name: (*name).to_owned(),
                actions,
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_scope() {
        let scopes = parse_scopes("repository:foo:pull,push");
        assert_eq!(
            scopes,
            vec![ResourceActions {
                kind: "repository".into(),
                name: "foo".into(),
                actions: [RegistryAction::Pull, RegistryAction::Push]
                    .into_iter()
                    .collect(),
            }]
        );
        assert_eq!(scopes[0].to_string(), "repository:foo:pull,push");
    }

    #[test]
    fn malformed_segment_is_skipped() {
        let scopes = parse_scopes("repository:foo repository:library/bar:pull");
        assert_eq!(scopes.len(), 1);
        assert_eq!(scopes[0].name, "library/bar");
    }

    #[test]
    fn only_malformed_is_empty() {
        assert!(parse_scopes("repository:foo").is_empty());
        assert!(parse_scopes("a:b:c:d").is_empty());
        assert!(parse_scopes("").is_empty());
    }

    #[test]
    fn wildcard_and_catalog() {
        let scopes = parse_scopes("registry:catalog:*");
        assert!(scopes[0].allows("registry", "catalog", RegistryAction::Pull));
        assert!(!scopes[0].allows("repository", "catalog", RegistryAction::Pull));
    }

    #[test]
    fn unknown_actions_dropped() {
        let scopes = parse_scopes("repository:foo:pull,frobnicate");
        assert_eq!(
            scopes[0].actions,
            [RegistryAction::Pull].into_iter().collect()
        );
    }

    #[test]
    fn serde_shape() {
        let scopes = parse_scopes("repository:foo:pull");
        let json = serde_json::to_value(&scopes[0]).unwrap();
        assert_eq!(
            json,
            serde_json::json!({"type": "repository", "name": "foo", "actions": ["pull"]})
        );
    }
}
