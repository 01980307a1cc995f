//! Property-based tests for identifier parsing, meta serialization and
//! channel patterns.
//!
//! Uses proptest to generate random inputs and verify properties

use proptest::prelude::*;
use synclog::server::ChannelPattern;
use synclog::shared::{Action, Meta, ParsedId};

proptest! {
    #[test]
    fn test_action_id_roundtrip(
        counter in 0i64..1_000_000_000,
        user in "[a-z0-9]{1,8}",
        client in "[a-z0-9]{1,8}",
        node in "[a-z0-9]{1,8}",
        seq in 0u64..1_000,
    ) {
        let id = format!("{counter} {user}:{client}:{node} {seq}");
        let parsed = ParsedId::parse(&id).unwrap();
        prop_assert_eq!(parsed.counter, counter);
        prop_assert_eq!(parsed.seq, seq);
        prop_assert_eq!(parsed.node_id, format!("{user}:{client}:{node}"));
        prop_assert_eq!(parsed.client_id, format!("{user}:{client}"));
        prop_assert_eq!(parsed.user_id, Some(user));
    }

    #[test]
    fn test_two_segment_ids_share_client_and_node(
        counter in 0i64..1_000_000_000,
        user in "[a-z0-9]{1,8}",
        client in "[a-z0-9]{1,8}",
        seq in 0u64..1_000,
    ) {
        let id = format!("{counter} {user}:{client} {seq}");
        let parsed = ParsedId::parse(&id).unwrap();
        prop_assert_eq!(&parsed.client_id, &parsed.node_id);
        prop_assert_eq!(parsed.user_id, Some(user));
    }

    #[test]
    fn test_garbage_never_panics(id in ".*") {
        let _ = ParsedId::parse(&id);
    }

    #[test]
    fn test_action_serialization_roundtrip(
        type_name in "[a-z/]{1,20}",
        text in ".*",
    ) {
        let action = Action::new(type_name).with("text", text);
        let json = serde_json::to_string(&action).unwrap();
        let back: Action = serde_json::from_str(&json).unwrap();
        prop_assert_eq!(action, back);
    }

    #[test]
    fn test_meta_roundtrip_keeps_addressing(
        channel in "[a-z0-9/]{1,16}",
        user in "[a-z0-9]{1,8}",
    ) {
        let mut meta = Meta::with_id("1 10:uuid 0");
        meta.channels = vec![channel];
        meta.users = vec![user];
        let json = serde_json::to_string(&meta).unwrap();
        let back: Meta = serde_json::from_str(&json).unwrap();
        prop_assert_eq!(meta, back);
    }

    #[test]
    fn test_pattern_matches_own_params(
        prefix in "[a-z]{1,8}",
        value in "[a-z0-9]{1,8}",
    ) {
        let pattern = ChannelPattern::parse(&format!("{prefix}/:id")).unwrap();
        let params = pattern.matches(&format!("{prefix}/{value}")).unwrap();
        prop_assert_eq!(params.get("id"), Some(&value));
        prop_assert!(pattern.matches(&prefix).is_none());
    }
}
