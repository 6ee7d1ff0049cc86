// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! The simulated device's configuration file.

use crate::Error;
use firmware_mfci::platform::device_id::StaticDeviceId;
use firmware_mfci::MfciConfig;
use serde::Deserialize;
use serde::Serialize;
use std::path::Path;

#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ToolConfig {
    /// Trust anchors and required EKUs.
    pub mfci: MfciConfig,
    /// The identity the device reports for targeting.
    pub identity: StaticDeviceId,
}

impl ToolConfig {
    pub fn load(path: &Path) -> Result<Self, Error> {
        let contents = fs_err::read(path).map_err(Error::ConfigFile)?;
        Ok(serde_json::from_slice(&contents)?)
    }

    /// Load `path`, or the default config if it does not exist.
    pub fn load_or_default(path: &Path) -> Result<Self, Error> {
        if path.exists() {
            Self::load(path)
        } else {
            Ok(Self::default())
        }
    }

    pub fn save(&self, path: &Path) -> Result<(), Error> {
        let contents = serde_json::to_vec_pretty(self)?;
        fs_err::write(path, contents).map_err(Error::ConfigFile)
    }
}
