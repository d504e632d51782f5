use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Shortest suffix still considered time-sortable. Shorter ids are treated
/// as incomparable.
pub const MIN_SORTABLE_SUFFIX_LEN: usize = 12;

macro_rules! branded_id {
    ($name:ident) => {
        #[derive(Clone, Debug, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            pub fn from_raw(s: impl Into<String>) -> Self {
                Self(s.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }

            /// Whether this id is strictly newer than `reference`.
            pub fn is_newer_than(&self, reference: &Self) -> bool {
                is_newer(&self.0, &reference.0)
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl FromStr for $name {
            type Err = std::convert::Infallible;
            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Ok(Self(s.to_owned()))
            }
        }

        impl AsRef<str> for $name {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                Self(s.to_owned())
            }
        }
    };
}

branded_id!(SessionId);
branded_id!(MessageId);
branded_id!(PartId);
branded_id!(RequestId);

/// Strip the `<lowercase-prefix>_` head from a server id and return the
/// time-sortable remainder.
///
/// Returns `None` when the id carries no recognised prefix or the remainder
/// is shorter than [`MIN_SORTABLE_SUFFIX_LEN`].
pub fn sortable_suffix(id: &str) -> Option<&str> {
    let (prefix, rest) = id.split_once('_')?;
    if prefix.is_empty() || !prefix.bytes().all(|b| b.is_ascii_lowercase()) {
        return None;
    }
    (rest.len() >= MIN_SORTABLE_SUFFIX_LEN).then_some(rest)
}

/// Whether `candidate` is strictly newer than `reference`.
///
/// Incomparable pairs (missing suffix, unequal suffix length) count as newer,
/// so unknown id formats are accepted rather than dropped.
pub fn is_newer(candidate: &str, reference: &str) -> bool {
    match (sortable_suffix(candidate), sortable_suffix(reference)) {
        (Some(a), Some(b)) if a.len() == b.len() => a > b,
        _ => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const OLD: &str = "msg_0a1b2c3d4e5fAAAAAAAAAAAAAA";
    const NEW: &str = "msg_0a1b2c3d4e60AAAAAAAAAAAAAA";

    #[test]
    fn suffix_strips_prefix() {
        assert_eq!(sortable_suffix(OLD), Some("0a1b2c3d4e5fAAAAAAAAAAAAAA"));
    }

    #[test]
    fn suffix_rejects_short_remainder() {
        assert_eq!(sortable_suffix("msg_abc"), None);
    }

    #[test]
    fn suffix_rejects_missing_or_odd_prefix() {
        assert_eq!(sortable_suffix("0a1b2c3d4e5fAAAAA"), None);
        assert_eq!(sortable_suffix("MSG_0a1b2c3d4e5fAAAA"), None);
        assert_eq!(sortable_suffix("_0a1b2c3d4e5fAAAA"), None);
    }

    #[test]
    fn newer_compares_suffixes() {
        assert!(is_newer(NEW, OLD));
        assert!(!is_newer(OLD, NEW));
    }

    #[test]
    fn equal_ids_are_not_newer() {
        assert!(!is_newer(OLD, OLD));
    }

    #[test]
    fn incomparable_ids_fail_open() {
        assert!(is_newer("legacy-id", OLD));
        assert!(is_newer(OLD, "legacy-id"));
        assert!(is_newer("msg_0a1b2c3d4e5fAAAA", OLD)); // unequal length
    }

    #[test]
    fn prefix_does_not_participate_in_ordering() {
        assert!(is_newer("prt_0a1b2c3d4e60AAAAAAAAAAAAAA", OLD));
    }

    #[test]
    fn branded_id_delegates_to_is_newer() {
        let old = MessageId::from_raw(OLD);
        let new = MessageId::from_raw(NEW);
        assert!(new.is_newer_than(&old));
        assert!(!old.is_newer_than(&new));
    }

    #[test]
    fn serde_is_transparent() {
        let id = SessionId::from_raw("ses_123");
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, "\"ses_123\"");
    }
}
