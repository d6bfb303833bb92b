// tests/property/dispatch_test.rs

//! Property-based tests for action dispatch
//! Every well-formed frame produces exactly the backbone calls its action names.

use crate::test_helpers::{BackboneCall, SYSTEM_TOPIC, new_session};
use proptest::prelude::*;
use serde_json::json;
use topicbridge::core::ClientReply;

fn topic() -> impl Strategy<Value = String> {
    "[a-z0-9]{1,8}(/[a-z0-9+#]{1,8}){0,3}"
}

proptest! {
    #![proptest_config(ProptestConfig {
        cases: 64,
        ..ProptestConfig::default()
    })]

    #[test]
    fn test_publish_sends_exactly_one_envelope(topic in topic(), data in ".{0,64}") {
        let rt = tokio::runtime::Runtime::new().unwrap();
        rt.block_on(async {
            let (mut session, backbone) = new_session();
            let raw = json!({"action": "publish", "topic": topic, "data": data}).to_string();

            let reply = session.handle_frame(&raw).await.unwrap();

            assert_eq!(reply, None);
            assert_eq!(backbone.calls(), vec![BackboneCall::publish(&topic, &data)]);
        });
    }

    #[test]
    fn test_unrecognized_actions_go_to_system_topic(
        action in "[a-zA-Z_]{1,12}",
        extra in any::<i64>(),
    ) {
        prop_assume!(!matches!(action.as_str(), "init" | "publish" | "subscribe"));
        let rt = tokio::runtime::Runtime::new().unwrap();
        rt.block_on(async {
            let (mut session, backbone) = new_session();
            let raw = json!({"action": action, "extra": extra}).to_string();

            session.handle_frame(&raw).await.unwrap();

            assert_eq!(backbone.calls(), vec![BackboneCall::publish(SYSTEM_TOPIC, &raw)]);
        });
    }

    #[test]
    fn test_private_topic_follows_latest_init(
        topics in prop::collection::vec(topic(), 1..6),
        bodies in prop::collection::vec("[a-z ]{0,16}", 1..6),
    ) {
        let rt = tokio::runtime::Runtime::new().unwrap();
        rt.block_on(async {
            let (mut session, backbone) = new_session();
            let mut expected = Vec::new();

            for (topic, body) in topics.iter().zip(bodies.iter().cycle()) {
                let init = json!({"action": "init", "data": topic}).to_string();
                let reply = session.handle_frame(&init).await.unwrap();
                assert_eq!(reply, Some(ClientReply::InitAck));
                expected.push(BackboneCall::subscribe(topic));

                let frame = json!({"body": body}).to_string();
                session.handle_frame(&frame).await.unwrap();
                expected.push(BackboneCall::publish(topic, &frame));
            }

            assert_eq!(session.private_topic(), topics.last().map(String::as_str));
            assert_eq!(backbone.calls(), expected);
        });
    }
}
