//! `define_id!`: prefixed ULID newtypes.

/// Defines a `{prefix}_{ulid}` identifier.
///
/// The type serializes as its display string, and `suffix()` gives the bare
/// lowercase ULID used inside worker names.
#[macro_export]
macro_rules! define_id {
    ($(#[$meta:meta])* $name:ident, $prefix:literal) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
        #[derive(serde::Serialize, serde::Deserialize)]
        #[serde(try_from = "String", into = "String")]
        pub struct $name($crate::Ulid);

        impl $name {
            pub const PREFIX: &'static str = $prefix;

            #[must_use]
            pub fn new() -> Self {
                Self($crate::Ulid::new())
            }

            #[must_use]
            pub const fn from_ulid(ulid: $crate::Ulid) -> Self {
                Self(ulid)
            }

            /// Lowercase ULID text, safe inside DNS labels.
            #[must_use]
            pub fn suffix(&self) -> String {
                self.0.to_string().to_ascii_lowercase()
            }

            pub fn parse(s: &str) -> Result<Self, $crate::IdError> {
                let (prefix, ulid) = match s.split_once('_') {
                    _ if s.is_empty() => return Err($crate::IdError::Empty),
                    Some(parts) => parts,
                    None => return Err($crate::IdError::MissingSeparator),
                };
                if prefix != Self::PREFIX {
                    return Err($crate::IdError::InvalidPrefix {
                        expected: Self::PREFIX,
                        actual: prefix.to_string(),
                    });
                }
                // ULIDs are case-insensitive; `suffix()` hands out lowercase.
                $crate::Ulid::from_string(&ulid.to_ascii_uppercase())
                    .map(Self)
                    .map_err(|e| $crate::IdError::InvalidUlid(e.to_string()))
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}_{}", $prefix, self.0)
            }
        }

        impl std::str::FromStr for $name {
            type Err = $crate::IdError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Self::parse(s)
            }
        }

        impl TryFrom<String> for $name {
            type Error = $crate::IdError;

            fn try_from(s: String) -> Result<Self, Self::Error> {
                Self::parse(&s)
            }
        }

        impl From<$name> for String {
            fn from(id: $name) -> String {
                id.to_string()
            }
        }
    };
}
