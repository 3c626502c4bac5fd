//! Typed ID definitions.

use crate::define_id;

define_id!(InstanceBuildId, "ib");
define_id!(AutoscalingGroupBuildId, "asgb");
define_id!(RequestId, "req");

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_instance_build_id_roundtrip() {
        let id = InstanceBuildId::new();
        let parsed: InstanceBuildId = id.to_string().parse().unwrap();
        assert_eq!(id, parsed);
        assert!(id.to_string().starts_with("ib_"));
    }

    #[test]
    fn test_wrong_prefix_rejected() {
        let result: Result<InstanceBuildId, _> = "asgb_01HV4Z2WQXKJNM8GPQY6VBKC3D".parse();
        assert!(result.unwrap_err().is_prefix_error());
    }

    #[test]
    fn test_missing_separator() {
        let result: Result<InstanceBuildId, _> = "ib01HV4Z2WQXKJNM8GPQY6VBKC3D".parse();
        assert_eq!(result.unwrap_err(), crate::IdError::MissingSeparator);
    }

    #[test]
    fn test_empty_and_invalid_ulid() {
        assert_eq!(
            "".parse::<RequestId>().unwrap_err(),
            crate::IdError::Empty
        );
        assert!(matches!(
            "req_nope".parse::<RequestId>().unwrap_err(),
            crate::IdError::InvalidUlid(_)
        ));
    }

    #[test]
    fn test_short_is_lowercase_without_prefix() {
        let id = AutoscalingGroupBuildId::new();
        let short = id.short();
        assert_eq!(short.len(), 26);
        assert_eq!(short, short.to_lowercase());
        assert!(!short.contains('_'));
    }

    #[test]
    fn test_json_is_plain_string() {
        let id = InstanceBuildId::new();
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, format!("\"{id}\""));
        let parsed: InstanceBuildId = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, id);
    }

    proptest! {
        #[test]
        fn prop_any_ulid_roundtrips(hi in any::<u64>(), lo in any::<u64>()) {
            let ulid = crate::Ulid::from((hi, lo));
            let id = InstanceBuildId::from_ulid(ulid);
            let parsed: InstanceBuildId = id.to_string().parse().unwrap();
            prop_assert_eq!(parsed, id);
        }
    }
}
