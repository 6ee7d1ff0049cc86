// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! A [`NvramStorage`] backed by a human-readable JSON file.
//!
//! The whole file is rewritten on every modification. Variable data is
//! stored base64 encoded.

use crate::in_memory::InMemoryNvram;
use crate::NextVariable;
use crate::NvramStorage;
use crate::NvramStorageError;
use anyhow::Context;
use mfci_specs::Guid;
use serde::Deserialize;
use serde::Serialize;
use std::path::Path;
use std::path::PathBuf;

#[derive(Serialize, Deserialize)]
struct JsonVariable {
    #[serde(with = "guid_str")]
    vendor: Guid,
    name: String,
    attributes: u32,
    #[serde(with = "base64_vec")]
    data: Vec<u8>,
}

#[derive(Serialize, Deserialize, Default)]
struct JsonNvram {
    variables: Vec<JsonVariable>,
}

/// de/serialize a `Vec<u8>` to/from a base64 encoded string.
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

mod guid_str {
    use mfci_specs::Guid;
    use serde::Deserialize;
    use serde::Deserializer;
    use serde::Serializer;

    pub fn serialize<S: Serializer>(guid: &Guid, ser: S) -> Result<S::Ok, S::Error> {
        ser.collect_str(guid)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Guid, D::Error> {
        let s = String::deserialize(d)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// Variables kept in memory and written through to a JSON file.
#[derive(Debug)]
pub struct JsonFileNvram {
    path: PathBuf,
    nvram: InMemoryNvram,
}

impl JsonFileNvram {
    /// Open the store at `path`. A missing file is an empty store, and is only
    /// created on the first modification.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, NvramStorageError> {
        let path = path.into();
        let mut nvram = InMemoryNvram::new();

        let contents = match fs_err::read(&path) {
            Ok(contents) => Some(contents),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => None,
            Err(e) => return Err(NvramStorageError::Load(e.into())),
        };

        if let Some(contents) = contents {
            let json: JsonNvram = serde_json::from_slice(&contents)
                .map_err(|e| NvramStorageError::Deserialize(e.into()))?;
            for var in json.variables {
                nvram.set_variable(&var.name, var.vendor, var.attributes, var.data)?;
            }
            tracing::debug!(path = %path.display(), "loaded nvram file");
        }

        Ok(Self { path, nvram })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn inner(&self) -> &InMemoryNvram {
        &self.nvram
    }

    fn commit(&self) -> Result<(), NvramStorageError> {
        let json = JsonNvram {
            variables: self
                .nvram
                .iter()
                .map(|v| JsonVariable {
                    vendor: v.vendor,
                    name: v.name.to_owned(),
                    attributes: v.attr,
                    data: v.data.to_vec(),
                })
                .collect(),
        };

        let write = || -> anyhow::Result<()> {
            let contents = serde_json::to_vec_pretty(&json).context("failed to serialize nvram")?;
            fs_err::write(&self.path, contents)?;
            Ok(())
        };
        write().map_err(|e| NvramStorageError::Commit(e.into()))
    }
}

impl NvramStorage for JsonFileNvram {
    fn get_variable(
        &mut self,
        name: &str,
        vendor: Guid,
    ) -> Result<Option<(u32, Vec<u8>)>, NvramStorageError> {
        self.nvram.get_variable(name, vendor)
    }

    fn set_variable(
        &mut self,
        name: &str,
        vendor: Guid,
        attr: u32,
        data: Vec<u8>,
    ) -> Result<(), NvramStorageError> {
        self.nvram.set_variable(name, vendor, attr, data)?;
        self.commit()
    }

    fn remove_variable(&mut self, name: &str, vendor: Guid) -> Result<bool, NvramStorageError> {
        let removed = self.nvram.remove_variable(name, vendor)?;
        if removed {
            self.commit()?;
        }
        Ok(removed)
    }

    fn next_variable(
        &mut self,
        name_vendor: Option<(&str, Guid)>,
    ) -> Result<NextVariable, NvramStorageError> {
        self.nvram.next_variable(name_vendor)
    }
}
