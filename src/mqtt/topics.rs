//! Canonical topic strings for the node namespace.
//!
//! All node traffic lives under `iot/nodes/<nodeId>/...`. These helpers are
//! total functions: a blank node id substitutes [`DEFAULT_NODE_ID`] and the
//! device segment is always lower-cased, so no input can produce an empty
//! path segment or fragment the topic space by letter case.

/// Well-known node id used when the configured one is blank.
pub const DEFAULT_NODE_ID: &str = "esp-remote";

/// Substitutes the default node id for blank input.
pub fn normalize_node(node_id: &str) -> &str {
    let trimmed = node_id.trim();
    if trimmed.is_empty() {
        DEFAULT_NODE_ID
    } else {
        trimmed
    }
}

/// Retained presence topic, payload literal "online"/"offline".
pub fn node_status(node_id: &str) -> String {
    format!("iot/nodes/{}/status", normalize_node(node_id))
}

/// Generic command channel for a node.
pub fn node_command(node_id: &str) -> String {
    format!("iot/nodes/{}/commands", normalize_node(node_id))
}

/// Legacy AC code-set test channel.
pub fn test_ir(node_id: &str) -> String {
    format!("iot/nodes/{}/ir/test", normalize_node(node_id))
}

/// Request channel for IR learning rounds.
pub fn learn_request(node_id: &str) -> String {
    format!("iot/nodes/{}/ir/learn/cmd", normalize_node(node_id))
}

/// Result channel for IR learning rounds.
pub fn learn_result(node_id: &str) -> String {
    format!("iot/nodes/{}/ir/learn", normalize_node(node_id))
}

/// Raw IR code emission channel.
pub fn emit_ir(node_id: &str) -> String {
    format!("iot/nodes/{}/ir/emit", normalize_node(node_id))
}

/// Per-device state channel.
pub fn state_topic(node_id: &str, device: &str) -> String {
    format!(
        "iot/nodes/{}/{}/state",
        normalize_node(node_id),
        device.to_lowercase()
    )
}

/// Per-device command channel.
pub fn cmd_topic(node_id: &str, device: &str) -> String {
    format!(
        "iot/nodes/{}/{}/cmd",
        normalize_node(node_id),
        device.to_lowercase()
    )
}

/// Recovers the node id from a status topic, for presence tracking of any
/// node whose retained status happens to arrive on this session.
pub fn parse_status_node(topic: &str) -> Option<&str> {
    let rest = topic.strip_prefix("iot/nodes/")?;
    let node = rest.strip_suffix("/status")?;
    if node.is_empty() || node.contains('/') {
        None
    } else {
        Some(node)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blank_node_never_produces_empty_segment() {
        for node in ["", " ", "\t"] {
            for topic in [
                node_status(node),
                node_command(node),
                test_ir(node),
                learn_request(node),
                learn_result(node),
                emit_ir(node),
                state_topic(node, "ac"),
                cmd_topic(node, "tv"),
            ] {
                assert!(!topic.contains("//"), "empty segment in {topic}");
                assert!(topic.contains(DEFAULT_NODE_ID));
            }
        }
    }

    #[test]
    fn device_case_does_not_fragment_topics() {
        assert_eq!(state_topic("esp-1", "AC"), state_topic("esp-1", "ac"));
        assert_eq!(cmd_topic("esp-1", "Tv"), cmd_topic("esp-1", "tv"));
        assert_eq!(state_topic("esp-1", "ac"), "iot/nodes/esp-1/ac/state");
    }

    #[test]
    fn status_topics_round_trip() {
        assert_eq!(parse_status_node(&node_status("esp-1")), Some("esp-1"));
        assert_eq!(parse_status_node("iot/nodes/esp-1/status"), Some("esp-1"));
        assert_eq!(parse_status_node("iot/nodes/esp-1/ac/state"), None);
        assert_eq!(parse_status_node("iot/nodes//status"), None);
        assert_eq!(parse_status_node("iot/nodes/a/b/status"), None);
        assert_eq!(parse_status_node("other/esp-1/status"), None);
    }
}
