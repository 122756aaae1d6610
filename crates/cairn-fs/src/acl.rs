use std::fmt;

use serde::{Deserialize, Serialize};

/// Access control attached to a filesystem entry.
///
/// Principal lists are kept sorted and deduplicated, so two ACLs granting the same
/// principals compare equal regardless of the order a backend reported them in.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Acl {
    /// The backend could not determine who may read the entry.
    Indeterminate,
    /// Anyone may read the entry.
    Public,
    Restricted {
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        users: Vec<String>,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        groups: Vec<String>,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        deny_users: Vec<String>,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        deny_groups: Vec<String>,
    },
}

impl Acl {
    pub fn restricted<U, G>(users: U, groups: G) -> Self
    where
        U: IntoIterator,
        U::Item: Into<String>,
        G: IntoIterator,
        G::Item: Into<String>,
    {
        Self::restricted_with_denials(users, groups, Vec::<String>::new(), Vec::<String>::new())
    }

    pub fn restricted_with_denials<U, G, DU, DG>(
        users: U,
        groups: G,
        deny_users: DU,
        deny_groups: DG,
    ) -> Self
    where
        U: IntoIterator,
        U::Item: Into<String>,
        G: IntoIterator,
        G::Item: Into<String>,
        DU: IntoIterator,
        DU::Item: Into<String>,
        DG: IntoIterator,
        DG::Item: Into<String>,
    {
        Self::Restricted {
            users: normalized(users),
            groups: normalized(groups),
            deny_users: normalized(deny_users),
            deny_groups: normalized(deny_groups),
        }
    }

    pub fn is_public(&self) -> bool {
        matches!(self, Self::Public)
    }

    pub fn is_determinate(&self) -> bool {
        !matches!(self, Self::Indeterminate)
    }
}

fn normalized<I>(names: I) -> Vec<String>
where
    I: IntoIterator,
    I::Item: Into<String>,
{
    let mut names: Vec<String> = names.into_iter().map(Into::into).collect();
    names.sort();
    names.dedup();
    names
}

impl fmt::Display for Acl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Indeterminate => write!(f, "indeterminate"),
            Self::Public => write!(f, "public"),
            Self::Restricted {
                users,
                groups,
                deny_users,
                deny_groups,
            } => {
                write!(f, "users={:?} groups={:?}", users, groups)?;
                if !deny_users.is_empty() || !deny_groups.is_empty() {
                    write!(f, " deny_users={:?} deny_groups={:?}", deny_users, deny_groups)?;
                }
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn restricted_is_order_insensitive() {
        let a = Acl::restricted(["bob", "alice", "bob"], ["staff"]);
        let b = Acl::restricted(["alice", "bob"], ["staff"]);
        assert_eq!(a, b);
    }

    #[test]
    fn serialized_shape() {
        let acl = Acl::restricted(["alice"], Vec::<String>::new());
        let json = serde_json::to_string(&acl).unwrap();
        assert_eq!(json, r#"{"type":"restricted","users":["alice"]}"#);

        let public: Acl = serde_json::from_str(r#"{"type":"public"}"#).unwrap();
        assert!(public.is_public());

        let parsed: Acl = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, acl);
    }

    #[test]
    fn indeterminate_is_not_determinate() {
        assert!(!Acl::Indeterminate.is_determinate());
        assert!(Acl::Public.is_determinate());
    }
}
