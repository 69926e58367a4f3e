//! Inbound frame decoding and fan-out.

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};

use serde_json::Value;

use super::subscription::{Control, Delivery, Registry};
use super::types::response::{ServerAction, ServerMessage};
use crate::Result;
use crate::ws::WsError;
use crate::ws::traits::RawFrame;

/// What the connection has to do after a frame was fanned out.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum Routed {
    /// The frame completed the logical connect handshake
    Handshake,
    /// Reserved routes matched by the frame, in registry order, deduplicated
    Controls(Vec<Control>),
}

/// Parse a raw frame into a [`ServerMessage`].
pub(crate) fn decode(frame: &RawFrame) -> Result<ServerMessage> {
    let value: Value = serde_json::from_slice(frame.as_bytes()).map_err(WsError::MessageParse)?;
    if !value.is_object() {
        return Err(WsError::InvalidMessage(format!("expected a JSON object, got {value}")).into());
    }

    serde_json::from_value(value).map_err(|e| WsError::MessageParse(e).into())
}

/// Deliver `message` to every matching record.
///
/// User handlers run here, synchronously and in registration order. A panicking
/// handler is logged and skipped without affecting the remaining handlers.
pub(crate) fn route(registry: &Registry, message: &ServerMessage) -> Routed {
    match message.action {
        Some(ServerAction::Connected) => return Routed::Handshake,
        Some(ServerAction::Init) => {
            deliver_init(registry, message);
            return Routed::Controls(Vec::new());
        }
        Some(ServerAction::Unknown) | None => {}
    }

    let mut controls: Vec<Control> = Vec::new();
    for record in registry.matching(&message.topic) {
        match &record.delivery {
            Delivery::Handler { handler, .. } => {
                isolate(&record.pattern, || handler(&message.data, &message.topic));
            }
            Delivery::Control(control) => {
                if !controls.contains(control) {
                    controls.push(control.clone());
                }
            }
        }
    }

    Routed::Controls(controls)
}

fn deliver_init(registry: &Registry, message: &ServerMessage) {
    let snapshot: &[Value] = match &message.data {
        Value::Array(items) => items,
        Value::Null => &[],
        other => std::slice::from_ref(other),
    };

    for record in registry.matching(&message.topic) {
        if let Delivery::Handler {
            init: Some(init), ..
        } = &record.delivery
        {
            isolate(&record.pattern, || init(snapshot, &message.topic));
        }
    }
}

/// Run a user callback, logging instead of propagating a panic.
pub(crate) fn isolate<F: FnOnce()>(pattern: &str, f: F) {
    if let Err(panic) = panic::catch_unwind(AssertUnwindSafe(f)) {
        #[cfg(feature = "tracing")]
        tracing::error!(
            pattern,
            reason = panic_message(&*panic),
            "Subscription handler panicked"
        );
        #[cfg(not(feature = "tracing"))]
        let _ = (pattern, panic_message(&*panic));
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    if let Some(message) = panic.downcast_ref::<&'static str>() {
        message
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message
    } else {
        "unknown panic"
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use serde_json::json;

    use super::*;
    use crate::error::Kind;
    use crate::socket::subscription::{Handler, InitHandler, SubscriptionRecord};

    fn message(value: &Value) -> ServerMessage {
        decode(&RawFrame::Text(value.to_string())).unwrap()
    }

    fn recorder(log: &Arc<Mutex<Vec<String>>>, name: &'static str) -> Handler {
        let log = Arc::clone(log);
        Arc::new(move |data: &Value, topic: &str| {
            log.lock().unwrap().push(format!("{name}:{topic}:{data}"));
        })
    }

    #[test]
    fn malformed_frames_are_protocol_errors() {
        let error = decode(&RawFrame::Text("{not json".to_owned())).unwrap_err();
        assert_eq!(error.kind(), Kind::Protocol);

        let error = decode(&RawFrame::Text("[1,2]".to_owned())).unwrap_err();
        assert_eq!(error.kind(), Kind::Protocol);
    }

    #[test]
    fn binary_frames_are_decoded_as_text() {
        let frame = RawFrame::Binary(br#"{"topic":"a","data":1}"#.to_vec());
        let message = decode(&frame).unwrap();
        assert_eq!(message.topic, "a");
        assert_eq!(message.data, json!(1));
    }

    #[test]
    fn fans_out_in_registration_order() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut registry = Registry::default();
        registry.insert(SubscriptionRecord::handler("room/+/msg", recorder(&log, "first"), None));
        registry.insert(SubscriptionRecord::handler("room/#", recorder(&log, "wide"), None));
        registry.insert(SubscriptionRecord::handler("room/+/msg", recorder(&log, "second"), None));
        registry.insert(SubscriptionRecord::handler("lobby", recorder(&log, "lobby"), None));

        let routed = route(
            &registry,
            &message(&json!({"topic": "room/1/msg", "data": "hi"})),
        );

        assert_eq!(routed, Routed::Controls(Vec::new()));
        assert_eq!(
            *log.lock().unwrap(),
            vec![
                r#"first:room/1/msg:"hi""#.to_owned(),
                r#"second:room/1/msg:"hi""#.to_owned(),
                r#"wide:room/1/msg:"hi""#.to_owned(),
            ]
        );
    }

    #[test]
    fn panicking_handler_does_not_block_others() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut registry = Registry::default();
        let boom: Handler = Arc::new(|_: &Value, _: &str| panic!("handler failure"));
        registry.insert(SubscriptionRecord::handler("a", boom, None));
        registry.insert(SubscriptionRecord::handler("a", recorder(&log, "after"), None));
        registry.insert(SubscriptionRecord::handler("+", recorder(&log, "other"), None));

        route(&registry, &message(&json!({"topic": "a", "data": 1})));

        assert_eq!(log.lock().unwrap().len(), 2);
    }

    #[test]
    fn init_frames_only_reach_init_handlers() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let snapshots = Arc::new(Mutex::new(Vec::new()));
        let init: InitHandler = {
            let snapshots = Arc::clone(&snapshots);
            Arc::new(move |items: &[Value], topic: &str| {
                snapshots.lock().unwrap().push((topic.to_owned(), items.len()));
            })
        };

        let mut registry = Registry::default();
        registry.insert(SubscriptionRecord::handler(
            "feed/#",
            recorder(&log, "feed"),
            Some(init),
        ));

        route(
            &registry,
            &message(&json!({"topic": "feed/a", "action": "init", "data": [1, 2, 3]})),
        );

        assert!(log.lock().unwrap().is_empty());
        assert_eq!(*snapshots.lock().unwrap(), vec![("feed/a".to_owned(), 3)]);
    }

    #[test]
    fn connected_action_is_a_handshake() {
        let registry = Registry::default();
        assert_eq!(
            route(&registry, &message(&json!({"action": "connected"}))),
            Routed::Handshake
        );
    }

    #[test]
    fn control_routes_are_collected_once() {
        let mut registry = Registry::default();
        let reply = Control::ChannelReply {
            topic: "files".to_owned(),
        };
        registry.insert(SubscriptionRecord::control("files.cre", reply.clone()));
        registry.insert(SubscriptionRecord::control("files.cre", reply.clone()));

        let routed = route(
            &registry,
            &message(&json!({"topic": "files.cre", "data": {"channelId": "c-1"}})),
        );

        assert_eq!(routed, Routed::Controls(vec![reply]));
    }
}
