//! Version-dependent event attribute codec.
//!
//! Nodes below CometBFT 0.35 ship event attribute keys and values
//! base64-encoded; newer nodes ship plain text. The codec is bound once at
//! startup from the detected node version, and every attribute that crosses
//! the pipeline goes through it rather than assuming a fixed encoding.

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use log::debug;

/// First version that stopped base64-encoding event attributes.
const PLAIN_ATTRIBUTES_SINCE: (u64, u64, u64) = (0, 35, 0);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AttributeCodec {
    base64_encoded: bool,
}

impl AttributeCodec {
    /// Bind the codec from the node's reported software version.
    pub fn from_node_version(version: &str) -> Self {
        let detected = parse_version(version);
        Self {
            base64_encoded: detected < PLAIN_ATTRIBUTES_SINCE,
        }
    }

    /// Codec for a node that ships plain-text attributes.
    pub fn plain() -> Self {
        Self {
            base64_encoded: false,
        }
    }

    /// Codec for a node that base64-encodes attributes.
    pub fn base64() -> Self {
        Self {
            base64_encoded: true,
        }
    }

    pub fn decode_attribute(&self, raw: &str) -> String {
        if !self.base64_encoded {
            return raw.to_string();
        }
        match STANDARD.decode(raw) {
            Ok(bytes) => String::from_utf8_lossy(&bytes).into_owned(),
            Err(e) => {
                // Not actually base64; keep the raw text rather than lose it.
                debug!("Attribute not valid base64, keeping raw: {}", e);
                raw.to_string()
            },
        }
    }

    pub fn encode_attribute(&self, plain: &str) -> String {
        if self.base64_encoded {
            STANDARD.encode(plain)
        } else {
            plain.to_string()
        }
    }
}

/// Parse "v0.34.29", "0.38.11-rc1" and the like into a comparable triple.
/// Unparseable segments count as zero.
fn parse_version(version: &str) -> (u64, u64, u64) {
    let trimmed = version.trim_start_matches('v');
    let core = trimmed.split(['-', '+']).next().unwrap_or(trimmed);
    let mut parts = core.split('.').map(|p| p.parse::<u64>().unwrap_or(0));
    (
        parts.next().unwrap_or(0),
        parts.next().unwrap_or(0),
        parts.next().unwrap_or(0),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn old_node_decodes_base64() {
        let codec = AttributeCodec::from_node_version("0.34.29");
        assert_eq!(codec.decode_attribute("YW1vdW50"), "amount");
    }

    #[test]
    fn new_node_passes_through() {
        let codec = AttributeCodec::from_node_version("0.38.11");
        assert_eq!(codec.decode_attribute("amount"), "amount");
    }

    #[test]
    fn threshold_is_inclusive() {
        assert_eq!(
            AttributeCodec::from_node_version("0.35.0"),
            AttributeCodec::plain()
        );
        assert_eq!(
            AttributeCodec::from_node_version("0.34.99"),
            AttributeCodec::base64()
        );
    }

    #[test]
    fn tolerates_version_suffixes() {
        assert_eq!(
            AttributeCodec::from_node_version("v0.38.0-rc3"),
            AttributeCodec::plain()
        );
    }

    #[test]
    fn round_trips_under_base64() {
        let codec = AttributeCodec::base64();
        let encoded = codec.encode_attribute("recipient");
        assert_eq!(codec.decode_attribute(&encoded), "recipient");
    }

    #[test]
    fn invalid_base64_kept_raw() {
        let codec = AttributeCodec::base64();
        assert_eq!(codec.decode_attribute("not base64!!"), "not base64!!");
    }
}
