//! Wire message decoding: a table of type URL → decoder, applied
//! recursively so wrapper messages (authz exec, gov proposals) come out
//! fully structured instead of as raw bytes.

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use log::{debug, error, warn};
use prost::Message;
use rustc_hash::FxHashMap;
use serde_json::{json, Value};

use crate::registry::proto;

/// Decodes one message payload into a JSON structure.
pub type MsgDecoder = fn(&[u8]) -> anyhow::Result<Value>;

/// Nested decode stops here. Legitimate payloads are a few levels deep;
/// anything past this is adversarial or malformed.
const MAX_DECODE_DEPTH: usize = 16;

/// Type URL prefix of the application's own modules. Messages under it must
/// always be registered, so an unknown one is logged as an error.
const APP_PREFIX: &str = "/veridex.";

fn decode_as<T>(bytes: &[u8]) -> anyhow::Result<Value>
where
    T: Message + serde::Serialize + Default,
{
    let msg = T::decode(bytes)?;
    Ok(serde_json::to_value(msg)?)
}

/// Registry of message decoders, keyed by wire type URL.
///
/// Seeded with the built-in chain-module types and the application's own
/// modules; open for extension through [`register`](Self::register), so a
/// chain upgrade that adds a type is one table entry, not a code change.
pub struct MessageRegistry {
    decoders: FxHashMap<String, MsgDecoder>,
}

impl MessageRegistry {
    pub fn new() -> Self {
        let mut registry = Self {
            decoders: FxHashMap::default(),
        };

        // Built-in chain modules.
        registry.register("/cosmos.bank.v1beta1.MsgSend", decode_as::<proto::MsgSend>);
        registry.register("/cosmos.authz.v1beta1.MsgExec", decode_as::<proto::MsgExec>);
        registry.register(
            "/cosmos.gov.v1.MsgSubmitProposal",
            decode_as::<proto::MsgSubmitProposal>,
        );
        registry.register("/cosmos.gov.v1.MsgVote", decode_as::<proto::MsgVote>);
        registry.register(
            "/cosmos.staking.v1beta1.MsgDelegate",
            decode_as::<proto::MsgDelegate>,
        );
        registry.register(
            "/cosmos.distribution.v1beta1.MsgWithdrawDelegatorReward",
            decode_as::<proto::MsgWithdrawDelegatorReward>,
        );
        registry.register(
            "/cosmwasm.wasm.v1.MsgExecuteContract",
            decode_as::<proto::MsgExecuteContract>,
        );
        registry.register(
            "/ibc.core.channel.v1.MsgAcknowledgement",
            decode_as::<proto::MsgAcknowledgement>,
        );

        // Application modules.
        registry.register(
            "/veridex.tr.v1.MsgCreateTrustRegistry",
            decode_as::<proto::MsgCreateTrustRegistry>,
        );
        registry.register(
            "/veridex.tr.v1.MsgUpdateTrustRegistry",
            decode_as::<proto::MsgUpdateTrustRegistry>,
        );
        registry.register(
            "/veridex.tr.v1.MsgArchiveTrustRegistry",
            decode_as::<proto::MsgArchiveTrustRegistry>,
        );
        registry.register(
            "/veridex.cs.v1.MsgCreateCredentialSchema",
            decode_as::<proto::MsgCreateCredentialSchema>,
        );
        registry.register(
            "/veridex.perm.v1.MsgCreatePermission",
            decode_as::<proto::MsgCreatePermission>,
        );
        registry.register(
            "/veridex.perm.v1.MsgRevokePermission",
            decode_as::<proto::MsgRevokePermission>,
        );
        registry.register("/veridex.dd.v1.MsgAddDid", decode_as::<proto::MsgAddDid>);
        registry.register("/veridex.dd.v1.MsgRenewDid", decode_as::<proto::MsgRenewDid>);
        registry.register("/veridex.dd.v1.MsgRemoveDid", decode_as::<proto::MsgRemoveDid>);

        registry
    }

    /// Add or replace a decoder for a type URL.
    pub fn register(&mut self, type_url: &str, decoder: MsgDecoder) {
        self.decoders.insert(type_url.to_string(), decoder);
    }

    pub fn is_registered(&self, type_url: &str) -> bool {
        self.decoders.contains_key(type_url)
    }

    /// Decode one message payload, recursively unpacking nested messages.
    /// Never fails: unknown or malformed payloads degrade to a structure
    /// carrying the original identifier and the raw value.
    pub fn decode(&self, type_url: &str, bytes: &[u8]) -> Value {
        self.decode_at_depth(type_url, bytes, 0)
    }

    fn decode_at_depth(&self, type_url: &str, bytes: &[u8], depth: usize) -> Value {
        if depth >= MAX_DECODE_DEPTH {
            warn!(
                "Message nesting exceeded {} levels at {}, leaving raw",
                MAX_DECODE_DEPTH, type_url
            );
            return raw_fallback(type_url, bytes);
        }

        let decoder = match self.decoders.get(type_url) {
            Some(d) => d,
            None => {
                log_unknown_type(type_url);
                return raw_fallback(type_url, bytes);
            },
        };

        let mut decoded = match decoder(bytes) {
            Ok(v) => v,
            Err(e) => {
                warn!("Failed to decode {}: {:#}, leaving raw", type_url, e);
                return raw_fallback(type_url, bytes);
            },
        };

        if let Some(obj) = decoded.as_object_mut() {
            obj.insert("@type".to_string(), Value::String(type_url.to_string()));
        }

        self.unpack_nested(&mut decoded, depth);
        unpack_known_payloads(type_url, &mut decoded);
        decoded
    }

    /// Walk the decoded structure and replace every `{type_url, value}`
    /// shape with its recursively decoded content.
    fn unpack_nested(&self, value: &mut Value, depth: usize) {
        match value {
            Value::Object(obj) => {
                if let Some((inner_url, inner_bytes)) = as_packed_any(obj) {
                    *value = self.decode_at_depth(&inner_url, &inner_bytes, depth + 1);
                    return;
                }
                for v in obj.values_mut() {
                    self.unpack_nested(v, depth);
                }
            },
            Value::Array(items) => {
                for v in items.iter_mut() {
                    self.unpack_nested(v, depth);
                }
            },
            _ => {},
        }
    }
}

impl Default for MessageRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Does this object look like a serialized `Any`? Exactly the two fields,
/// a slash-prefixed type URL and a base64 value.
fn as_packed_any(obj: &serde_json::Map<String, Value>) -> Option<(String, Vec<u8>)> {
    if obj.len() != 2 {
        return None;
    }
    let type_url = obj.get("type_url")?.as_str()?;
    if !type_url.starts_with('/') {
        return None;
    }
    let value = obj.get("value")?.as_str()?;
    let bytes = STANDARD.decode(value).ok()?;
    Some((type_url.to_string(), bytes))
}

fn raw_fallback(type_url: &str, bytes: &[u8]) -> Value {
    json!({
        "@type": type_url,
        "raw": STANDARD.encode(bytes),
    })
}

fn log_unknown_type(type_url: &str) {
    if type_url.starts_with(APP_PREFIX) {
        // Application types must always be registered.
        error!("Unknown application message type: {}", type_url);
    } else if type_url.starts_with("/cosmos.")
        || type_url.starts_with("/ibc.")
        || type_url.starts_with("/cosmwasm.")
    {
        debug!("Unregistered chain-module message type: {}", type_url);
    } else {
        warn!("Unknown message type: {}", type_url);
    }
}

/// Opportunistic parse of free-form payload fields that well-known wrapper
/// types carry as base64-encoded JSON. Parse failure leaves the field as-is.
fn unpack_known_payloads(type_url: &str, decoded: &mut Value) {
    let field = if type_url.ends_with("MsgExecuteContract") {
        "msg"
    } else if type_url.ends_with("MsgAcknowledgement") {
        "acknowledgement"
    } else {
        return;
    };

    let Some(obj) = decoded.as_object_mut() else {
        return;
    };
    let Some(encoded) = obj.get(field).and_then(Value::as_str) else {
        return;
    };

    let parsed = STANDARD
        .decode(encoded)
        .map_err(anyhow::Error::from)
        .and_then(|bytes| serde_json::from_slice::<Value>(&bytes).map_err(anyhow::Error::from));

    match parsed {
        Ok(inner) => {
            obj.insert(field.to_string(), inner);
        },
        Err(e) => {
            debug!(
                "Payload field {} of {} is not base64 JSON, leaving as-is: {}",
                field, type_url, e
            );
        },
    }
}

/// Best-effort signing address of a decoded message: the first of the
/// conventional sender-ish fields that is present.
pub fn extract_sender(content: &Value) -> String {
    const SENDER_FIELDS: &[&str] = &[
        "creator",
        "from_address",
        "sender",
        "proposer",
        "grantee",
        "delegator_address",
        "voter",
        "signer",
    ];

    let Some(obj) = content.as_object() else {
        return String::new();
    };
    for field in SENDER_FIELDS {
        if let Some(v) = obj.get(*field).and_then(Value::as_str) {
            if !v.is_empty() {
                return v.to_string();
            }
        }
    }
    String::new()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::proto::{Any, Coin, MsgAddDid, MsgExec, MsgSend};

    fn encode<T: Message>(msg: &T) -> Vec<u8> {
        msg.encode_to_vec()
    }

    #[test]
    fn round_trips_msg_send() {
        let registry = MessageRegistry::new();
        let msg = MsgSend {
            from_address: "veridex1abc".into(),
            to_address: "veridex1def".into(),
            amount: vec![Coin {
                denom: "uvdx".into(),
                amount: "1000".into(),
            }],
        };

        let decoded = registry.decode("/cosmos.bank.v1beta1.MsgSend", &encode(&msg));
        assert_eq!(decoded["@type"], "/cosmos.bank.v1beta1.MsgSend");
        assert_eq!(decoded["from_address"], "veridex1abc");
        assert_eq!(decoded["amount"][0]["denom"], "uvdx");
        assert_eq!(decoded["amount"][0]["amount"], "1000");
    }

    #[test]
    fn round_trips_app_message() {
        let registry = MessageRegistry::new();
        let msg = MsgAddDid {
            creator: "veridex1abc".into(),
            did: "did:example:123".into(),
            years: 2,
        };

        let decoded = registry.decode("/veridex.dd.v1.MsgAddDid", &encode(&msg));
        assert_eq!(decoded["did"], "did:example:123");
        assert_eq!(decoded["years"], 2);
        assert_eq!(extract_sender(&decoded), "veridex1abc");
    }

    #[test]
    fn unknown_type_never_fails() {
        let registry = MessageRegistry::new();
        let decoded = registry.decode("/some.other.v9.MsgMystery", b"\x01\x02\x03");
        assert_eq!(decoded["@type"], "/some.other.v9.MsgMystery");
        assert_eq!(decoded["raw"], STANDARD.encode(b"\x01\x02\x03"));
    }

    #[test]
    fn exec_wrapper_decodes_inner_messages_recursively() {
        let registry = MessageRegistry::new();

        let send = MsgSend {
            from_address: "veridex1granter".into(),
            to_address: "veridex1dest".into(),
            amount: vec![],
        };
        let add_did = MsgAddDid {
            creator: "veridex1granter".into(),
            did: "did:example:xyz".into(),
            years: 1,
        };
        let exec = MsgExec {
            grantee: "veridex1grantee".into(),
            msgs: vec![
                Any {
                    type_url: "/cosmos.bank.v1beta1.MsgSend".into(),
                    value: encode(&send),
                },
                Any {
                    type_url: "/veridex.dd.v1.MsgAddDid".into(),
                    value: encode(&add_did),
                },
            ],
        };

        let decoded = registry.decode("/cosmos.authz.v1beta1.MsgExec", &encode(&exec));
        let inner = decoded["msgs"].as_array().unwrap();
        assert_eq!(inner.len(), 2);
        // Fully decoded structures, not raw bytes.
        assert_eq!(inner[0]["@type"], "/cosmos.bank.v1beta1.MsgSend");
        assert_eq!(inner[0]["to_address"], "veridex1dest");
        assert_eq!(inner[1]["@type"], "/veridex.dd.v1.MsgAddDid");
        assert_eq!(inner[1]["did"], "did:example:xyz");
    }

    #[test]
    fn deep_nesting_terminates_at_depth_guard() {
        let registry = MessageRegistry::new();

        // Exec-in-exec, well past the guard.
        let mut inner = MsgExec {
            grantee: "veridex1bottom".into(),
            msgs: vec![],
        };
        for _ in 0..(MAX_DECODE_DEPTH + 4) {
            inner = MsgExec {
                grantee: "veridex1wrap".into(),
                msgs: vec![Any {
                    type_url: "/cosmos.authz.v1beta1.MsgExec".into(),
                    value: encode(&inner),
                }],
            };
        }

        // Must terminate; the innermost levels degrade to raw.
        let decoded = registry.decode("/cosmos.authz.v1beta1.MsgExec", &encode(&inner));
        assert_eq!(decoded["@type"], "/cosmos.authz.v1beta1.MsgExec");

        let mut cursor = &decoded;
        let mut raw_seen = false;
        for _ in 0..(MAX_DECODE_DEPTH + 8) {
            if cursor.get("raw").is_some() {
                raw_seen = true;
                break;
            }
            match cursor.get("msgs").and_then(|m| m.get(0)) {
                Some(next) => cursor = next,
                None => break,
            }
        }
        assert!(raw_seen, "expected a raw fallback at the depth guard");
    }

    #[test]
    fn contract_call_blob_parsed_from_base64_json() {
        let registry = MessageRegistry::new();
        let msg = proto::MsgExecuteContract {
            sender: "veridex1caller".into(),
            contract: "veridex1contract".into(),
            msg: br#"{"transfer":{"recipient":"veridex1dest","amount":"5"}}"#.to_vec(),
            funds: vec![],
        };

        let decoded = registry.decode("/cosmwasm.wasm.v1.MsgExecuteContract", &encode(&msg));
        assert_eq!(decoded["msg"]["transfer"]["recipient"], "veridex1dest");
    }

    #[test]
    fn contract_call_non_json_blob_left_as_is() {
        let registry = MessageRegistry::new();
        let msg = proto::MsgExecuteContract {
            sender: "veridex1caller".into(),
            contract: "veridex1contract".into(),
            msg: vec![0xff, 0xfe, 0x01],
            funds: vec![],
        };

        let decoded = registry.decode("/cosmwasm.wasm.v1.MsgExecuteContract", &encode(&msg));
        // Still the base64 string, untouched.
        assert_eq!(decoded["msg"], STANDARD.encode([0xff, 0xfe, 0x01]));
    }

    #[test]
    fn runtime_registration_extends_the_table() {
        let mut registry = MessageRegistry::new();
        assert!(!registry.is_registered("/veridex.tr.v2.MsgNewThing"));

        fn decode_new_thing(_bytes: &[u8]) -> anyhow::Result<Value> {
            Ok(json!({"ok": true}))
        }
        registry.register("/veridex.tr.v2.MsgNewThing", decode_new_thing);

        let decoded = registry.decode("/veridex.tr.v2.MsgNewThing", b"");
        assert_eq!(decoded["ok"], true);
    }
}
