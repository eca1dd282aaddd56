//! Typed identifiers.

use crate::define_id;

define_id!(
    /// Identifies one running hatchery process. A fresh value is minted at
    /// startup and sent along with every claim acknowledgement.
    HatcheryId,
    "hat"
);

define_id!(
    /// Identifies one spawned worker. Its ULID is the suffix of the
    /// worker's backend-facing name.
    WorkerId,
    "wkr"
);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_has_prefix() {
        let id = WorkerId::new();
        assert!(id.to_string().starts_with("wkr_"));
    }

    #[test]
    fn test_parse_rejects_wrong_prefix() {
        let id = HatcheryId::new().to_string();
        let err = WorkerId::parse(&id).unwrap_err();
        assert!(err.is_prefix_error());
    }

    #[test]
    fn test_parse_rejects_missing_separator() {
        assert_eq!(WorkerId::parse("wkr"), Err(crate::IdError::MissingSeparator));
        assert_eq!(WorkerId::parse(""), Err(crate::IdError::Empty));
    }

    #[test]
    fn test_suffix_is_lowercase() {
        let id = WorkerId::new();
        let suffix = id.suffix();
        assert_eq!(suffix.len(), 26);
        assert!(suffix.chars().all(|c| c.is_ascii_lowercase() || c.is_ascii_digit()));
    }

    #[test]
    fn test_serde_as_string() {
        let id = HatcheryId::new();
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, format!("\"{id}\""));
        let back: HatcheryId = serde_json::from_str(&json).unwrap();
        assert_eq!(back, id);
    }

    proptest::proptest! {
        #[test]
        fn prop_parse_accepts_any_generated_ulid(ts in 0u64..(1u64 << 48), rand in proptest::prelude::any::<u128>()) {
            let id = WorkerId::from_ulid(crate::Ulid::from_parts(ts, rand));
            proptest::prop_assert_eq!(WorkerId::parse(&id.to_string()), Ok(id));
        }
    }
}
