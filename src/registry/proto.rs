//! Hand-rolled prost definitions for the wire messages the indexer decodes.
//!
//! Only the fields the pipeline persists are declared; unknown fields are
//! skipped by prost during decode, which keeps these definitions stable
//! across chain upgrades that append fields.

use prost::Message;
use serde::Serialize;

/// Serialize bytes fields as base64 so decoded message content stays
/// readable JSON. The registry recursion re-decodes nested payloads from
/// this form.
pub mod base64_bytes {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine as _;
    use serde::Serializer;

    pub fn serialize<S: Serializer>(bytes: &[u8], ser: S) -> Result<S::Ok, S::Error> {
        ser.serialize_str(&STANDARD.encode(bytes))
    }
}

#[derive(Clone, PartialEq, Message, Serialize)]
pub struct Any {
    #[prost(string, tag = "1")]
    pub type_url: String,
    #[prost(bytes = "vec", tag = "2")]
    #[serde(with = "base64_bytes")]
    pub value: Vec<u8>,
}

// ==================== tx envelope ====================

#[derive(Clone, PartialEq, Message)]
pub struct TxRaw {
    #[prost(bytes = "vec", tag = "1")]
    pub body_bytes: Vec<u8>,
    #[prost(bytes = "vec", tag = "2")]
    pub auth_info_bytes: Vec<u8>,
    #[prost(bytes = "vec", repeated, tag = "3")]
    pub signatures: Vec<Vec<u8>>,
}

#[derive(Clone, PartialEq, Message)]
pub struct TxBody {
    #[prost(message, repeated, tag = "1")]
    pub messages: Vec<Any>,
    #[prost(string, tag = "2")]
    pub memo: String,
    #[prost(uint64, tag = "3")]
    pub timeout_height: u64,
}

#[derive(Clone, PartialEq, Message)]
pub struct AuthInfo {
    #[prost(message, optional, tag = "2")]
    pub fee: Option<Fee>,
}

#[derive(Clone, PartialEq, Message, Serialize)]
pub struct Fee {
    #[prost(message, repeated, tag = "1")]
    pub amount: Vec<Coin>,
    #[prost(uint64, tag = "2")]
    pub gas_limit: u64,
    #[prost(string, tag = "3")]
    pub payer: String,
    #[prost(string, tag = "4")]
    pub granter: String,
}

#[derive(Clone, PartialEq, Message, Serialize)]
pub struct Coin {
    #[prost(string, tag = "1")]
    pub denom: String,
    #[prost(string, tag = "2")]
    pub amount: String,
}

// ==================== built-in chain modules ====================

#[derive(Clone, PartialEq, Message, Serialize)]
pub struct MsgSend {
    #[prost(string, tag = "1")]
    pub from_address: String,
    #[prost(string, tag = "2")]
    pub to_address: String,
    #[prost(message, repeated, tag = "3")]
    pub amount: Vec<Coin>,
}

/// authz wrapper: executes nested messages on behalf of a granter.
#[derive(Clone, PartialEq, Message, Serialize)]
pub struct MsgExec {
    #[prost(string, tag = "1")]
    pub grantee: String,
    #[prost(message, repeated, tag = "2")]
    pub msgs: Vec<Any>,
}

/// gov v1 proposal: carries nested messages to execute on passage.
#[derive(Clone, PartialEq, Message, Serialize)]
pub struct MsgSubmitProposal {
    #[prost(message, repeated, tag = "1")]
    pub messages: Vec<Any>,
    #[prost(message, repeated, tag = "2")]
    pub initial_deposit: Vec<Coin>,
    #[prost(string, tag = "3")]
    pub proposer: String,
    #[prost(string, tag = "4")]
    pub metadata: String,
    #[prost(string, tag = "5")]
    pub title: String,
    #[prost(string, tag = "6")]
    pub summary: String,
}

#[derive(Clone, PartialEq, Message, Serialize)]
pub struct MsgVote {
    #[prost(uint64, tag = "1")]
    pub proposal_id: u64,
    #[prost(string, tag = "2")]
    pub voter: String,
    #[prost(int32, tag = "3")]
    pub option: i32,
    #[prost(string, tag = "4")]
    pub metadata: String,
}

#[derive(Clone, PartialEq, Message, Serialize)]
pub struct MsgDelegate {
    #[prost(string, tag = "1")]
    pub delegator_address: String,
    #[prost(string, tag = "2")]
    pub validator_address: String,
    #[prost(message, optional, tag = "3")]
    pub amount: Option<Coin>,
}

#[derive(Clone, PartialEq, Message, Serialize)]
pub struct MsgWithdrawDelegatorReward {
    #[prost(string, tag = "1")]
    pub delegator_address: String,
    #[prost(string, tag = "2")]
    pub validator_address: String,
}

/// CosmWasm contract call; `msg` is a free-form JSON argument blob.
#[derive(Clone, PartialEq, Message, Serialize)]
pub struct MsgExecuteContract {
    #[prost(string, tag = "1")]
    pub sender: String,
    #[prost(string, tag = "2")]
    pub contract: String,
    #[prost(bytes = "vec", tag = "3")]
    #[serde(with = "base64_bytes")]
    pub msg: Vec<u8>,
    #[prost(message, repeated, tag = "5")]
    pub funds: Vec<Coin>,
}

#[derive(Clone, PartialEq, Message, Serialize)]
pub struct Packet {
    #[prost(uint64, tag = "1")]
    pub sequence: u64,
    #[prost(string, tag = "2")]
    pub source_port: String,
    #[prost(string, tag = "3")]
    pub source_channel: String,
    #[prost(string, tag = "4")]
    pub destination_port: String,
    #[prost(string, tag = "5")]
    pub destination_channel: String,
    #[prost(bytes = "vec", tag = "6")]
    #[serde(with = "base64_bytes")]
    pub data: Vec<u8>,
}

/// IBC packet acknowledgement; the `acknowledgement` payload is usually
/// JSON.
#[derive(Clone, PartialEq, Message, Serialize)]
pub struct MsgAcknowledgement {
    #[prost(message, optional, tag = "1")]
    pub packet: Option<Packet>,
    #[prost(bytes = "vec", tag = "2")]
    #[serde(with = "base64_bytes")]
    pub acknowledgement: Vec<u8>,
    #[prost(string, tag = "5")]
    pub signer: String,
}

// ==================== application modules ====================
//
// tr = trust registries, cs = credential schemas, perm = permissions,
// dd = DID directory. These are the app's own modules; the registry logs an
// error if one of their type URLs ever shows up unregistered.

#[derive(Clone, PartialEq, Message, Serialize)]
pub struct MsgCreateTrustRegistry {
    #[prost(string, tag = "1")]
    pub creator: String,
    #[prost(string, tag = "2")]
    pub did: String,
    #[prost(string, tag = "3")]
    pub aka: String,
    #[prost(string, tag = "4")]
    pub language: String,
    #[prost(string, tag = "5")]
    pub doc_url: String,
    #[prost(string, tag = "6")]
    pub doc_digest_sri: String,
}

#[derive(Clone, PartialEq, Message, Serialize)]
pub struct MsgUpdateTrustRegistry {
    #[prost(string, tag = "1")]
    pub creator: String,
    #[prost(uint64, tag = "2")]
    pub id: u64,
    #[prost(string, tag = "3")]
    pub did: String,
    #[prost(string, tag = "4")]
    pub aka: String,
}

#[derive(Clone, PartialEq, Message, Serialize)]
pub struct MsgArchiveTrustRegistry {
    #[prost(string, tag = "1")]
    pub creator: String,
    #[prost(uint64, tag = "2")]
    pub id: u64,
    #[prost(bool, tag = "3")]
    pub archive: bool,
}

#[derive(Clone, PartialEq, Message, Serialize)]
pub struct MsgCreateCredentialSchema {
    #[prost(string, tag = "1")]
    pub creator: String,
    #[prost(uint64, tag = "2")]
    pub tr_id: u64,
    #[prost(string, tag = "3")]
    pub json_schema: String,
    #[prost(uint32, tag = "4")]
    pub issuer_validation_validity_period: u32,
    #[prost(uint32, tag = "5")]
    pub verifier_validation_validity_period: u32,
}

#[derive(Clone, PartialEq, Message, Serialize)]
pub struct MsgCreatePermission {
    #[prost(string, tag = "1")]
    pub creator: String,
    #[prost(uint64, tag = "2")]
    pub schema_id: u64,
    #[prost(string, tag = "3")]
    pub did: String,
    #[prost(int32, tag = "4")]
    pub r#type: i32,
    #[prost(string, tag = "5")]
    pub country: String,
}

#[derive(Clone, PartialEq, Message, Serialize)]
pub struct MsgRevokePermission {
    #[prost(string, tag = "1")]
    pub creator: String,
    #[prost(uint64, tag = "2")]
    pub id: u64,
}

#[derive(Clone, PartialEq, Message, Serialize)]
pub struct MsgAddDid {
    #[prost(string, tag = "1")]
    pub creator: String,
    #[prost(string, tag = "2")]
    pub did: String,
    #[prost(uint32, tag = "3")]
    pub years: u32,
}

#[derive(Clone, PartialEq, Message, Serialize)]
pub struct MsgRenewDid {
    #[prost(string, tag = "1")]
    pub creator: String,
    #[prost(string, tag = "2")]
    pub did: String,
    #[prost(uint32, tag = "3")]
    pub years: u32,
}

#[derive(Clone, PartialEq, Message, Serialize)]
pub struct MsgRemoveDid {
    #[prost(string, tag = "1")]
    pub creator: String,
    #[prost(string, tag = "2")]
    pub did: String,
}
