//! Typed observers over the inbound router.
//!
//! Decoders filter the broadcast stream on the resolver's topic shapes and
//! parse the JSON payloads into the structs from [`crate::model`]. A
//! malformed payload decodes to the type's default (states) or is skipped
//! (learn events) so bad node firmware can never crash the router or stall
//! other subscribers.

use tokio::sync::{broadcast, mpsc};
use tracing::{debug, warn};

use crate::model::{AcState, DeviceType, FanState, IrLearningEvent, StbState, TvState};

use super::router::{InboundRouter, IncomingMessage};
use super::topics;

pub fn decode_ac_state(payload: &str) -> AcState {
    serde_json::from_str(payload).unwrap_or_default()
}

pub fn decode_tv_state(payload: &str) -> TvState {
    serde_json::from_str(payload).unwrap_or_default()
}

pub fn decode_fan_state(payload: &str) -> FanState {
    serde_json::from_str(payload).unwrap_or_default()
}

pub fn decode_stb_state(payload: &str) -> StbState {
    serde_json::from_str(payload).unwrap_or_default()
}

/// Learn results need a key to be usable; anything without one (or with a
/// payload that is not a JSON object) is dropped.
pub fn decode_learn_event(payload: &str) -> Option<IrLearningEvent> {
    let value: serde_json::Value = serde_json::from_str(payload).ok()?;
    let key = value.get("key")?.as_str()?.trim();
    if key.is_empty() {
        return None;
    }
    let device = DeviceType::from_label(value.get("device").and_then(|v| v.as_str()).unwrap_or(""));
    let status = value.get("status").and_then(|v| v.as_str()).unwrap_or("ok");
    let success = status.eq_ignore_ascii_case("ok") || status.eq_ignore_ascii_case("success");
    let non_empty = |field: &str| {
        value
            .get(field)
            .and_then(|v| v.as_str())
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
    };
    Some(IrLearningEvent {
        device,
        key: key.to_string(),
        success,
        protocol: non_empty("protocol"),
        code: non_empty("code"),
        bits: value.get("bits").and_then(|v| v.as_i64()).map(|b| b as i32),
        error: non_empty("error"),
    })
}

/// Mirror of the node's AC state. Must be called from a runtime context.
pub fn observe_ac_state(router: &InboundRouter, node_id: &str) -> mpsc::Receiver<AcState> {
    observe(router, topics::state_topic(node_id, "ac"), |payload| {
        Some(decode_ac_state(payload))
    })
}

pub fn observe_tv_state(router: &InboundRouter, node_id: &str) -> mpsc::Receiver<TvState> {
    observe(router, topics::state_topic(node_id, "tv"), |payload| {
        Some(decode_tv_state(payload))
    })
}

pub fn observe_fan_state(router: &InboundRouter, node_id: &str) -> mpsc::Receiver<FanState> {
    observe(router, topics::state_topic(node_id, "fan"), |payload| {
        Some(decode_fan_state(payload))
    })
}

pub fn observe_stb_state(router: &InboundRouter, node_id: &str) -> mpsc::Receiver<StbState> {
    observe(router, topics::state_topic(node_id, "stb"), |payload| {
        Some(decode_stb_state(payload))
    })
}

/// IR learning results for a node.
pub fn observe_ir_learning(
    router: &InboundRouter,
    node_id: &str,
) -> mpsc::Receiver<IrLearningEvent> {
    observe(router, topics::learn_result(node_id), decode_learn_event)
}

fn observe<T, F>(router: &InboundRouter, topic: String, decode: F) -> mpsc::Receiver<T>
where
    T: Send + 'static,
    F: Fn(&str) -> Option<T> + Send + 'static,
{
    let mut rx = router.subscribe();
    let (tx, out) = mpsc::channel(16);
    tokio::spawn(async move {
        loop {
            match rx.recv().await {
                Ok(IncomingMessage {
                    topic: ref t,
                    ref payload,
                    ..
                }) if *t == topic => {
                    if let Some(decoded) = decode(payload) {
                        if tx.send(decoded).await.is_err() {
                            debug!("observer for {} dropped, stopping", topic);
                            break;
                        }
                    }
                }
                Ok(_) => {}
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    warn!("observer for {} lagged, skipped {} messages", topic, missed);
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    });
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn malformed_state_payload_decodes_to_default() {
        assert_eq!(decode_ac_state("not json"), AcState::default());
        assert_eq!(decode_ac_state(""), AcState::default());
        assert_eq!(decode_tv_state("[1,2,3]"), TvState::default());
    }

    #[test]
    fn partial_state_payload_fills_defaults() {
        let state = decode_ac_state(r#"{"power":true,"temp":19}"#);
        assert!(state.power);
        assert_eq!(state.temp, 19);
        assert_eq!(state.mode, "cool");
        assert_eq!(state.fan, "auto");
    }

    #[test]
    fn learn_event_requires_a_key() {
        assert!(decode_learn_event("garbage").is_none());
        assert!(decode_learn_event(r#"{"device":"tv"}"#).is_none());
        assert!(decode_learn_event(r#"{"key":"  "}"#).is_none());

        let event = decode_learn_event(
            r#"{"device":"tv","key":"power","status":"OK","protocol":"NEC","code":"0x20DF10EF","bits":32}"#,
        )
        .unwrap();
        assert_eq!(event.device, DeviceType::Tv);
        assert_eq!(event.key, "power");
        assert!(event.success);
        assert_eq!(event.protocol.as_deref(), Some("NEC"));
        assert_eq!(event.bits, Some(32));
        assert!(event.error.is_none());
    }

    #[test]
    fn failed_learn_round_is_reported() {
        let event =
            decode_learn_event(r#"{"key":"power","status":"timeout","error":"no signal"}"#).unwrap();
        assert!(!event.success);
        assert_eq!(event.error.as_deref(), Some("no signal"));
    }

    #[tokio::test]
    async fn observers_filter_on_their_topic() {
        let router = InboundRouter::new();
        let mut ac = observe_ac_state(&router, "esp-1");

        router.dispatch(IncomingMessage::new(
            topics::state_topic("esp-1", "tv"),
            r#"{"power":true}"#.to_string(),
            false,
        ));
        router.dispatch(IncomingMessage::new(
            topics::state_topic("esp-1", "ac"),
            r#"{"power":true,"temp":21}"#.to_string(),
            false,
        ));

        let state = ac.recv().await.unwrap();
        assert!(state.power);
        assert_eq!(state.temp, 21);
    }
}
