/// WebRTC signaling bridge — validates offer/answer/candidate/bye payloads
/// and forwards them to a target client or a room.
///
/// The bridge never inspects SDP or ICE contents; descriptions and
/// candidates are opaque values relayed as-is.
use serde_json::{json, Map, Value};

use crate::kernel::Kernel;
use crate::message::Message;
use crate::toolkit::{RoomBroadcast, Toolkit};

pub const INVALID_OFFER: &str = "INVALID_OFFER";
pub const INVALID_ANSWER: &str = "INVALID_ANSWER";
pub const INVALID_CANDIDATE: &str = "INVALID_CANDIDATE";
pub const TARGET_OR_ROOM_REQUIRED: &str = "TARGET_OR_ROOM_REQUIRED";

#[derive(Debug, Clone)]
pub struct SignalOptions {
    /// Prefix for the four channels, e.g. `webrtc` → `webrtc:offer`.
    pub namespace: String,
    /// Join the sender to an offer's room before forwarding.
    pub auto_join_rooms: bool,
}

impl Default for SignalOptions {
    fn default() -> Self {
        Self {
            namespace: "webrtc".into(),
            auto_join_rooms: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Channel {
    Offer,
    Answer,
    Candidate,
    Bye,
}

impl Channel {
    const ALL: [Channel; 4] = [Self::Offer, Self::Answer, Self::Candidate, Self::Bye];

    fn suffix(self) -> &'static str {
        match self {
            Self::Offer => "offer",
            Self::Answer => "answer",
            Self::Candidate => "candidate",
            Self::Bye => "bye",
        }
    }
}

/// Normalized view of a signal payload.
#[derive(Debug, Default, PartialEq)]
struct SignalPayload {
    target: Option<String>,
    room: Option<String>,
    description: Option<Value>,
    candidate: Option<Value>,
    metadata: Option<Value>,
}

fn field(payload: &Value, key: &str) -> Option<Value> {
    payload.get(key).filter(|v| !v.is_null()).cloned()
}

fn normalize(payload: &Value) -> SignalPayload {
    SignalPayload {
        target: payload
            .get("target")
            .and_then(Value::as_str)
            .map(str::to_owned),
        room: payload.get("room").and_then(Value::as_str).map(str::to_owned),
        // `offer` is a legacy alias for `description`.
        description: field(payload, "description").or_else(|| field(payload, "offer")),
        candidate: field(payload, "candidate"),
        metadata: field(payload, "metadata"),
    }
}

fn validate(channel: Channel, payload: &SignalPayload) -> Result<(), &'static str> {
    match channel {
        Channel::Offer if payload.description.is_none() => Err(INVALID_OFFER),
        Channel::Answer if payload.description.is_none() => Err(INVALID_ANSWER),
        Channel::Candidate if payload.candidate.is_none() => Err(INVALID_CANDIDATE),
        _ => Ok(()),
    }
}

fn error_message(namespace: &str, reason: &str) -> Message {
    Message::event(format!("{namespace}:error"), json!({ "reason": reason }))
}

pub struct SignalBridge {
    opts: SignalOptions,
}

impl SignalBridge {
    pub fn new(opts: SignalOptions) -> Self {
        Self { opts }
    }

    /// Register the four signal channels on a kernel.
    pub fn attach(&self, kernel: &Kernel) {
        for channel in Channel::ALL {
            let namespace = self.opts.namespace.clone();
            let auto_join = self.opts.auto_join_rooms;
            let kind = format!("{namespace}:{}", channel.suffix());
            kernel.on(&kind, move |msg, tk| {
                let namespace = namespace.clone();
                async move {
                    handle_signal(channel, &namespace, auto_join, msg, tk).await;
                    Ok(())
                }
            });
        }
    }
}

async fn handle_signal(
    channel: Channel,
    namespace: &str,
    auto_join: bool,
    message: Message,
    tk: Toolkit,
) {
    let payload = normalize(&message.payload);

    if let Err(reason) = validate(channel, &payload) {
        tk.reply(error_message(namespace, reason)).await;
        return;
    }

    if auto_join && channel == Channel::Offer {
        if let Some(room) = &payload.room {
            tk.rooms().join(room).await;
        }
    }

    let mut forwarded = Map::new();
    forwarded.insert("from".into(), json!(tk.client_id()));
    if let Some(room) = &payload.room {
        forwarded.insert("room".into(), json!(room));
    }
    if let Some(target) = &payload.target {
        forwarded.insert("target".into(), json!(target));
    }
    if let Some(description) = payload.description {
        forwarded.insert("description".into(), description);
    }
    if let Some(candidate) = payload.candidate {
        forwarded.insert("candidate".into(), candidate);
    }
    if let Some(metadata) = payload.metadata {
        forwarded.insert("metadata".into(), metadata);
    }
    let envelope = Message::event(
        format!("{namespace}:{}", channel.suffix()),
        Value::Object(forwarded),
    );

    match (&payload.target, &payload.room) {
        (Some(target), _) => {
            tk.send(target, envelope).await;
        }
        (None, Some(room)) => {
            tk.rooms()
                .broadcast(
                    Some(room),
                    envelope,
                    RoomBroadcast {
                        except_self: true,
                        ..Default::default()
                    },
                )
                .await;
        }
        (None, None) => {
            tk.reply(error_message(namespace, TARGET_OR_ROOM_REQUIRED)).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn normalize_reads_all_fields() {
        let payload = json!({
            "target": "abc",
            "room": "lobby",
            "description": {"type": "offer", "sdp": "v=0"},
            "candidate": {"candidate": "c"},
            "metadata": {"name": "x"},
        });
        let p = normalize(&payload);
        assert_eq!(p.target.as_deref(), Some("abc"));
        assert_eq!(p.room.as_deref(), Some("lobby"));
        assert!(p.description.is_some());
        assert!(p.candidate.is_some());
        assert!(p.metadata.is_some());
    }

    #[test]
    fn normalize_accepts_offer_alias() {
        let p = normalize(&json!({ "offer": {"sdp": "v=0"} }));
        assert_eq!(p.description, Some(json!({"sdp": "v=0"})));

        // Explicit description wins over the alias.
        let p = normalize(&json!({ "description": {"sdp": "a"}, "offer": {"sdp": "b"} }));
        assert_eq!(p.description, Some(json!({"sdp": "a"})));
    }

    #[test]
    fn normalize_of_non_object_is_empty() {
        assert_eq!(normalize(&json!("just a string")), SignalPayload::default());
        assert_eq!(normalize(&Value::Null), SignalPayload::default());
    }

    #[test]
    fn offer_and_answer_require_description() {
        let empty = SignalPayload::default();
        assert_eq!(validate(Channel::Offer, &empty), Err(INVALID_OFFER));
        assert_eq!(validate(Channel::Answer, &empty), Err(INVALID_ANSWER));

        let with = SignalPayload {
            description: Some(json!({"sdp": "v=0"})),
            ..Default::default()
        };
        assert_eq!(validate(Channel::Offer, &with), Ok(()));
        assert_eq!(validate(Channel::Answer, &with), Ok(()));
    }

    #[test]
    fn candidate_requires_candidate() {
        let empty = SignalPayload::default();
        assert_eq!(validate(Channel::Candidate, &empty), Err(INVALID_CANDIDATE));
        let with = SignalPayload {
            candidate: Some(json!({"candidate": "c"})),
            ..Default::default()
        };
        assert_eq!(validate(Channel::Candidate, &with), Ok(()));
    }

    #[test]
    fn bye_requires_nothing() {
        assert_eq!(validate(Channel::Bye, &SignalPayload::default()), Ok(()));
    }

    #[test]
    fn error_message_shape() {
        let msg = error_message("webrtc", TARGET_OR_ROOM_REQUIRED);
        assert_eq!(msg.kind, "webrtc:error");
        assert_eq!(msg.payload, json!({ "reason": "TARGET_OR_ROOM_REQUIRED" }));
    }
}
