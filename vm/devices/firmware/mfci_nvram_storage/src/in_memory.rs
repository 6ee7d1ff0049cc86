// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Provides an in-memory implementation of [`NvramStorage`] that doesn't
//! persist anywhere.

use crate::NextVariable;
use crate::NvramStorage;
use crate::NvramStorageError;
use mfci_specs::Guid;
use std::collections::BTreeMap;
use std::fmt::Display;

#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
struct VariableKey {
    vendor: Guid,
    name: String,
}

impl Display for VariableKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}-{}", self.vendor, self.name)
    }
}

#[derive(Clone, Debug)]
struct Variable {
    data: Vec<u8>,
    attr: u32,
}

/// An in-memory implementation of [`NvramStorage`].
#[derive(Debug, Default, Clone)]
pub struct InMemoryNvram {
    nvram: BTreeMap<VariableKey, Variable>,
}

pub struct VariableEntry<'a> {
    pub vendor: Guid,
    pub name: &'a str,
    pub data: &'a [u8],
    pub attr: u32,
}

impl InMemoryNvram {
    pub fn new() -> Self {
        Self {
            nvram: Default::default(),
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = VariableEntry<'_>> {
        self.nvram.iter().map(|(k, v)| VariableEntry {
            vendor: k.vendor,
            name: &k.name,
            data: &v.data,
            attr: v.attr,
        })
    }

    /// Keep only the variables for which `f` returns `true`.
    pub fn retain(&mut self, mut f: impl FnMut(&VariableEntry<'_>) -> bool) {
        self.nvram.retain(|k, v| {
            f(&VariableEntry {
                vendor: k.vendor,
                name: &k.name,
                data: &v.data,
                attr: v.attr,
            })
        })
    }

    pub fn clear(&mut self) {
        self.nvram.clear()
    }
}

impl NvramStorage for InMemoryNvram {
    fn get_variable(
        &mut self,
        name: &str,
        vendor: Guid,
    ) -> Result<Option<(u32, Vec<u8>)>, NvramStorageError> {
        Ok(self
            .nvram
            .get(&VariableKey {
                vendor,
                name: name.to_owned(),
            })
            .map(|v| (v.attr, v.data.clone())))
    }

    fn set_variable(
        &mut self,
        name: &str,
        vendor: Guid,
        attr: u32,
        data: Vec<u8>,
    ) -> Result<(), NvramStorageError> {
        let key = VariableKey {
            vendor,
            name: name.to_owned(),
        };
        tracing::trace!(%key, len = data.len(), attr, "set");
        self.nvram.insert(key, Variable { data, attr });
        Ok(())
    }

    fn remove_variable(&mut self, name: &str, vendor: Guid) -> Result<bool, NvramStorageError> {
        Ok(self
            .nvram
            .remove(&VariableKey {
                vendor,
                name: name.to_owned(),
            })
            .is_some())
    }

    fn next_variable(
        &mut self,
        name_vendor: Option<(&str, Guid)>,
    ) -> Result<NextVariable, NvramStorageError> {
        let exists = |(k, v): (&VariableKey, &Variable)| NextVariable::Exists {
            name: k.name.clone(),
            vendor: k.vendor,
            attr: v.attr,
        };

        let Some((name, vendor)) = name_vendor else {
            return Ok(self
                .nvram
                .iter()
                .next()
                .map_or(NextVariable::EndOfList, exists));
        };

        let key = VariableKey {
            vendor,
            name: name.to_owned(),
        };
        let mut range = self.nvram.range(&key..);
        Ok(match range.next() {
            Some((found, _)) if *found == key => range.next().map_or(NextVariable::EndOfList, exists),
            Some(_) => NextVariable::InvalidKey,
            None => NextVariable::EndOfList,
        })
    }
}

/// A collection of test-implementation helpers that operate on a generic
/// implementation of [`NvramStorage`]
pub mod impl_agnostic_tests {
    use crate::NextVariable;
    use crate::NvramStorage;
    use mfci_specs::Guid;

    const VENDOR1: Guid = Guid::from_static_str("c1d1a1b6-0c5e-4a2b-9a8e-4a1bdf1f0a01");
    const VENDOR2: Guid = Guid::from_static_str("c1d1a1b6-0c5e-4a2b-9a8e-4a1bdf1f0a02");

    pub fn test_single_variable(nvram: &mut dyn NvramStorage) {
        let name = "var1";
        let attr = 0x7;
        let data = vec![0x1, 0x2, 0x3, 0x4, 0x5];
        let data1 = vec![0xa, 0xb, 0xc];

        nvram
            .set_variable(name, VENDOR1, attr, data.clone())
            .unwrap();

        let (result_attr, result_data) = nvram.get_variable(name, VENDOR1).unwrap().unwrap();
        assert_eq!(result_attr, attr);
        assert_eq!(result_data, data);

        // same name, different vendor
        assert!(nvram.get_variable(name, VENDOR2).unwrap().is_none());

        let result = nvram.next_variable(Some((name, VENDOR1))).unwrap();
        assert!(matches!(result, NextVariable::EndOfList));

        // set existing variable with new data
        nvram
            .set_variable(name, VENDOR1, attr, data1.clone())
            .unwrap();

        let (result_attr, result_data) = nvram.get_variable(name, VENDOR1).unwrap().unwrap();
        assert_eq!(result_attr, attr);
        assert_eq!(result_data, data1);

        assert!(nvram.remove_variable(name, VENDOR1).unwrap());
        assert!(!nvram.remove_variable(name, VENDOR1).unwrap());

        // try to get removed variable
        let result = nvram.get_variable(name, VENDOR1).unwrap();
        assert!(result.is_none());
        assert!(nvram.is_empty().unwrap());
    }

    pub fn test_next(nvram: &mut dyn NvramStorage) {
        let attr = 0x3;
        let vars = [("var1", VENDOR1), ("var2", VENDOR1), ("var1", VENDOR2)];
        for (name, vendor) in vars {
            nvram.set_variable(name, vendor, attr, vec![1]).unwrap();
        }

        let mut expected = vars
            .iter()
            .map(|(name, vendor)| NextVariable::Exists {
                name: name.to_string(),
                vendor: *vendor,
                attr,
            })
            .collect::<std::collections::BTreeSet<_>>();

        let mut key: Option<(String, Guid)> = None;
        loop {
            let var = nvram
                .next_variable(key.as_ref().map(|(n, v)| (n.as_str(), *v)))
                .unwrap();
            match &var {
                NextVariable::InvalidKey => panic!(),
                NextVariable::EndOfList => break,
                NextVariable::Exists { name, vendor, .. } => key = Some((name.clone(), *vendor)),
            }
            assert!(expected.remove(&var));
        }
        assert!(expected.is_empty());

        // unknown keys are rejected rather than skipped
        let result = nvram.next_variable(Some(("nope", VENDOR1))).unwrap();
        assert_eq!(result, NextVariable::InvalidKey);

        // check to make sure calls to next_variable are idempotent
        let var1 = nvram.next_variable(None).unwrap();
        let var2 = nvram.next_variable(None).unwrap();
        assert_eq!(var1, var2);
    }
}
