// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Mock platform pieces for exercising the policy engine across simulated
//! boots.

use crate::platform::device_id::StaticDeviceId;
use crate::platform::reset::PlatformReset;
use crate::platform::rng::RandomSource;
use crate::platform::rng::RngError;
use crate::service::nvram::VariableServices;
use crate::MfciConfig;
use crate::MfciError;
use crate::MfciManager;
use crate::MfciRuntimeDeps;
use mfci_nvram_storage::in_memory::InMemoryNvram;
use mfci_nvram_storage::NextVariable;
use mfci_nvram_storage::NvramStorage;
use mfci_nvram_storage::NvramStorageError;
use mfci_policy_blob::pkcs7::Pkcs7Verifier;
use mfci_policy_blob::pkcs7::SignatureError;
use mfci_policy_blob::policy::MfciPolicyFields;
use mfci_policy_blob::xdr::encode_xdr;
use mfci_specs::mfci::*;
use mfci_specs::uefi::EfiResetType;
use mfci_specs::uefi::EfiVariableAttributes;
use mfci_specs::Guid;
use std::cell::Cell;
use std::cell::RefCell;
use std::collections::BTreeSet;
use std::rc::Rc;
use std::sync::Once;

pub fn init_tracing() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_test_writer()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("trace")),
            )
            .try_init();
    });
}

/// In-memory storage that can be told to fail writes to chosen variables.
#[derive(Debug, Default, Clone)]
pub struct FaultyNvram {
    pub inner: InMemoryNvram,
    fail_writes: Rc<RefCell<BTreeSet<String>>>,
}

impl FaultyNvram {
    pub fn fail_writes_to(&self, name: &str) {
        self.fail_writes.borrow_mut().insert(name.into());
    }

    pub fn clear_failures(&self) {
        self.fail_writes.borrow_mut().clear();
    }

    /// Write an MFCI variable directly, bypassing variable services.
    pub fn corrupt(&mut self, name: &str, data: Vec<u8>) {
        self.inner
            .set_variable(
                name,
                MFCI_VAR_VENDOR_GUID,
                MFCI_POLICY_VARIABLE_ATTR.into(),
                data,
            )
            .unwrap();
    }

    /// Replace an MFCI variable with one carrying `attr`.
    pub fn store_with_attributes(
        &mut self,
        name: &str,
        attr: EfiVariableAttributes,
        data: Vec<u8>,
    ) {
        self.inner.remove_variable(name, MFCI_VAR_VENDOR_GUID).unwrap();
        self.inner
            .set_variable(name, MFCI_VAR_VENDOR_GUID, attr.into(), data)
            .unwrap();
    }

    pub fn attributes(&mut self, name: &str) -> Option<EfiVariableAttributes> {
        self.inner
            .get_variable(name, MFCI_VAR_VENDOR_GUID)
            .unwrap()
            .map(|(attr, _)| attr.into())
    }

    pub fn read(&mut self, name: &str) -> Option<Vec<u8>> {
        self.inner
            .get_variable(name, MFCI_VAR_VENDOR_GUID)
            .unwrap()
            .map(|(_, data)| data)
    }

    pub fn read_u64(&mut self, name: &str) -> Option<u64> {
        self.read(name)
            .map(|data| u64::from_le_bytes(data.try_into().unwrap()))
    }

    fn check_write(&self, name: &str) -> Result<(), NvramStorageError> {
        if self.fail_writes.borrow().contains(name) {
            return Err(NvramStorageError::Commit("injected failure".into()));
        }
        Ok(())
    }
}

impl NvramStorage for FaultyNvram {
    fn get_variable(
        &mut self,
        name: &str,
        vendor: Guid,
    ) -> Result<Option<(u32, Vec<u8>)>, NvramStorageError> {
        self.inner.get_variable(name, vendor)
    }

    fn set_variable(
        &mut self,
        name: &str,
        vendor: Guid,
        attr: u32,
        data: Vec<u8>,
    ) -> Result<(), NvramStorageError> {
        self.check_write(name)?;
        self.inner.set_variable(name, vendor, attr, data)
    }

    fn remove_variable(&mut self, name: &str, vendor: Guid) -> Result<bool, NvramStorageError> {
        self.check_write(name)?;
        self.inner.remove_variable(name, vendor)
    }

    fn next_variable(
        &mut self,
        name_vendor: Option<(&str, Guid)>,
    ) -> Result<NextVariable, NvramStorageError> {
        self.inner.next_variable(name_vendor)
    }
}

/// Deterministic [`RandomSource`] counting up from `next`.
#[derive(Debug, Default, Clone)]
pub struct TestRng {
    pub next: Rc<Cell<u64>>,
    pub fail: Rc<Cell<bool>>,
    /// Keep returning the same value.
    pub stuck: Rc<Cell<bool>>,
}

impl RandomSource for TestRng {
    fn next_u64(&mut self) -> Result<u64, RngError> {
        if self.fail.get() {
            return Err(RngError("injected failure".into()));
        }
        let value = self.next.get();
        if !self.stuck.get() {
            self.next.set(value.wrapping_add(1));
        }
        Ok(value)
    }
}

/// Records reset requests and returns, as a broken platform would.
#[derive(Debug, Default, Clone)]
pub struct MockReset {
    pub requests: Rc<RefCell<Vec<(EfiResetType, Guid)>>>,
}

impl MockReset {
    pub fn count(&self) -> usize {
        self.requests.borrow().len()
    }
}

impl PlatformReset for MockReset {
    fn reset_system(&mut self, reset_type: EfiResetType, subtype: Guid) {
        self.requests.borrow_mut().push((reset_type, subtype));
    }
}

pub const GOOD_ANCHOR: &[u8] = b"good anchor";
const FAKE_SIGNATURE: &[u8] = b"signed by the good anchor:";

/// Wrap `payload` so that [`FakeVerifier`] accepts it against
/// [`GOOD_ANCHOR`].
pub fn fake_sign(payload: &[u8]) -> Vec<u8> {
    [FAKE_SIGNATURE, payload].concat()
}

#[derive(Debug, Default, Clone, Copy)]
pub struct FakeVerifier;

impl Pkcs7Verifier for FakeVerifier {
    fn verify(
        &self,
        signed: &[u8],
        trust_anchor: &[u8],
        _required_ekus: &[&str],
    ) -> Result<Vec<u8>, SignatureError> {
        if trust_anchor != GOOD_ANCHOR {
            return Err(SignatureError::NoSigner);
        }
        signed
            .strip_prefix(FAKE_SIGNATURE)
            .map(<[u8]>::to_vec)
            .ok_or(SignatureError::NoSigner)
    }
}

pub fn test_identity() -> StaticDeviceId {
    StaticDeviceId::new("Contoso", "Laptop Pro", "SN-0042", "Fleet A", "")
}

pub fn test_policy_fields(nonce: u64, policy: MfciPolicy) -> MfciPolicyFields {
    let identity = test_identity();
    MfciPolicyFields {
        manufacturer: identity.manufacturer.unwrap_or_default(),
        product: identity.product.unwrap_or_default(),
        serial_number: identity.serial_number.unwrap_or_default(),
        oem1: identity.oem1.unwrap_or_default(),
        oem2: identity.oem2.unwrap_or_default(),
        nonce,
        policy,
    }
}

/// A device whose persistent state survives across [`Self::boot`] calls.
pub struct TestDevice {
    pub storage: FaultyNvram,
    pub identity: StaticDeviceId,
    pub rng: TestRng,
    pub reset: MockReset,
    pub config: MfciConfig,
}

impl TestDevice {
    pub fn new() -> Self {
        init_tracing();
        let rng = TestRng::default();
        rng.next.set(0x1000);
        Self {
            storage: FaultyNvram::default(),
            identity: test_identity(),
            rng,
            reset: MockReset::default(),
            config: MfciConfig {
                trust_anchors: encode_xdr([&b"stale anchor"[..], GOOD_ANCHOR]),
                ..Default::default()
            },
        }
    }

    pub fn deps(&self) -> MfciRuntimeDeps {
        MfciRuntimeDeps {
            device_id: Box::new(self.identity.clone()),
            reset: Box::new(self.reset.clone()),
            rng: Box::new(self.rng.clone()),
            verifier: Box::new(FakeVerifier),
        }
    }

    /// Power on, hand the driver to `f`, then power off.
    pub fn boot_with<R>(&mut self, f: impl FnOnce(&mut MfciManager<FaultyNvram>) -> R) -> R {
        let vars = VariableServices::new(std::mem::take(&mut self.storage));
        let mut manager = MfciManager::new(vars, self.deps(), self.config.clone());
        let r = f(&mut manager);
        self.storage = manager.into_variables().into_storage();
        r
    }

    /// Run one boot's policy check.
    pub fn boot(&mut self) -> Result<(), MfciError> {
        self.boot_with(|manager| manager.verify_policy_and_change())
    }

    pub fn read_u64(&mut self, name: &str) -> Option<u64> {
        self.storage.read_u64(name)
    }

    pub fn next_nonce(&mut self) -> u64 {
        self.read_u64(NEXT_MFCI_NONCE_VARIABLE_NAME).unwrap()
    }

    pub fn stage(&mut self, blob: Vec<u8>) {
        self.storage
            .corrupt(NEXT_MFCI_POLICY_BLOB_VARIABLE_NAME, blob);
    }

    /// Stage a correctly signed and targeted policy for the next boot,
    /// returning the blob.
    pub fn stage_policy(&mut self, policy: MfciPolicy) -> Vec<u8> {
        let nonce = self.next_nonce();
        let blob = fake_sign(&test_policy_fields(nonce, policy).to_payload());
        self.stage(blob.clone());
        blob
    }

    /// The persisted (current policy, current nonce, current blob).
    pub fn current(&mut self) -> (Option<u64>, Option<u64>, Option<Vec<u8>>) {
        (
            self.read_u64(CURRENT_MFCI_POLICY_VARIABLE_NAME),
            self.read_u64(CURRENT_MFCI_NONCE_VARIABLE_NAME),
            self.storage.read(CURRENT_MFCI_POLICY_BLOB_VARIABLE_NAME),
        )
    }
}
