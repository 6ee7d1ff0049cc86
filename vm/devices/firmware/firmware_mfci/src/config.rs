// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use mfci_specs::mfci::MFCI_DEFAULT_REQUIRED_EKU;
use serde::Deserialize;
use serde::Serialize;

/// Provisioned policy signing configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MfciConfig {
    /// XDR container of DER trust anchor certificates, tried in order.
    #[serde(with = "base64_vec")]
    pub trust_anchors: Vec<u8>,
    /// EKU OIDs the leaf signer must carry.
    pub required_ekus: Vec<String>,
}

impl Default for MfciConfig {
    fn default() -> Self {
        Self {
            trust_anchors: Vec::new(),
            required_ekus: vec![MFCI_DEFAULT_REQUIRED_EKU.into()],
        }
    }
}

impl MfciConfig {
    pub(crate) fn required_ekus(&self) -> Vec<&str> {
        self.required_ekus.iter().map(String::as_str).collect()
    }
}

mod base64_vec {
    use base64::Engine;
    use serde::Deserialize;
    use serde::Deserializer;
    use serde::Serializer;

    #[allow(clippy::ptr_arg)] // required by serde
    pub fn serialize<S: Serializer>(v: &Vec<u8>, ser: S) -> Result<S::Ok, S::Error> {
        ser.serialize_str(&base64::engine::general_purpose::STANDARD.encode(v))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(d)?;
        base64::engine::general_purpose::STANDARD
            .decode(s)
            .map_err(serde::de::Error::custom)
    }
}
