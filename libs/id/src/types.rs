//! Identifier definitions.

use crate::{define_id, define_key};

define_key!(
    /// A managed game-server instance, as keyed by the control plane.
    InstanceId
);

define_key!(
    /// A worker node hosting instances.
    NodeId
);

// One orchestration run (a full pass over the reboot queue).
define_id!(RunId, "run");

#[cfg(test)]
mod tests {
    use super::*;
    use crate::IdError;
    use proptest::prelude::*;

    #[test]
    fn test_instance_id_parse() {
        let id: InstanceId = "lobby-01".parse().unwrap();
        assert_eq!(id.as_str(), "lobby-01");
        assert_eq!(id.to_string(), "lobby-01");
    }

    #[test]
    fn test_instance_id_empty() {
        let result: Result<InstanceId, _> = "".parse();
        assert_eq!(result.unwrap_err(), IdError::Empty);
    }

    #[test]
    fn test_instance_id_rejects_whitespace() {
        let result = InstanceId::parse("lobby 01");
        assert_eq!(
            result.unwrap_err(),
            IdError::InvalidCharacter { found: ' ' }
        );
    }

    #[test]
    fn test_node_id_too_long() {
        let long = "n".repeat(crate::MAX_KEY_LEN + 1);
        assert!(matches!(
            NodeId::parse(&long),
            Err(IdError::TooLong { .. })
        ));
    }

    #[test]
    fn test_instance_id_json_rejects_invalid() {
        let result: Result<InstanceId, _> = serde_json::from_str("\"bad id\"");
        assert!(result.is_err());
    }

    #[test]
    fn test_run_id_prefix() {
        let id = RunId::new();
        assert!(id.to_string().starts_with("run_"));
        let parsed: RunId = id.to_string().parse().unwrap();
        assert_eq!(parsed, id);
    }

    #[test]
    fn test_run_id_invalid_prefix() {
        let result = RunId::parse("job_01HV4Z2WQXKJNM8GPQY6VBKC3D");
        assert!(matches!(result, Err(IdError::InvalidPrefix { .. })));
    }

    #[test]
    fn test_run_id_missing_separator() {
        assert_eq!(
            RunId::parse("run01HV4Z2WQXKJNM8GPQY6VBKC3D").unwrap_err(),
            IdError::MissingSeparator
        );
    }

    proptest! {
        #[test]
        fn prop_valid_keys_roundtrip(s in "[A-Za-z0-9_.:-]{1,128}") {
            let id = InstanceId::parse(&s).unwrap();
            let json = serde_json::to_string(&id).unwrap();
            let back: InstanceId = serde_json::from_str(&json).unwrap();
            prop_assert_eq!(back.as_str(), s.as_str());
        }
    }
}
