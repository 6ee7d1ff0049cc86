// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! MFCI (Manufacturer Firmware Configuration Interface) policy engine.
//!
//! Decides, once per boot, which signed MFCI policy a device is running
//! under. A policy moves a device out of the default customer state into a
//! manufacturer state that enables diagnostic actions (e.g: clearing Secure
//! Boot keys or the TPM). Policies are signed, bound to a single device by
//! its targeting strings, and made single-use by a nonce that the firmware
//! rolls every time one is consumed.
//!
//! # Crate Structure
//!
//! ### `pub mod service`
//!
//! The pieces of the engine: variable services with just enough variable
//! policy support to lock the MFCI variables, the targeting verifier, the
//! variable lifecycle helpers, the change notifier, and the per-boot policy
//! check itself.
//!
//! ### `pub mod platform`
//!
//! Interface traits that must be implemented by the platform hosting the
//! engine: device identity, reset, and random numbers. Signature
//! verification and storage are provided by `mfci_policy_blob` and
//! `mfci_nvram_storage` respectively.
//!
//! The top-level [`MfciManager`] owns all of the above and exposes the boot
//! events the engine hooks.

#![forbid(unsafe_code)]

mod config;
mod error;
pub mod platform;
pub mod service;
#[cfg(test)]
mod test_support;

pub use config::MfciConfig;
pub use error::MfciError;

use mfci_nvram_storage::NvramStorage;
use mfci_policy_blob::pkcs7::Pkcs7Verifier;
use mfci_specs::mfci::MfciPolicy;
use platform::device_id::DeviceIdProvider;
use platform::reset::PlatformReset;
use platform::rng::RandomSource;
use service::notify::CallbackHandle;
use service::notify::NotifyError;
use service::notify::PolicyChangeCallback;
use service::notify::PolicyChangeNotifier;
use service::nvram::VariableServices;

/// Various runtime objects used by the policy engine.
pub struct MfciRuntimeDeps {
    pub device_id: Box<dyn DeviceIdProvider>,
    pub reset: Box<dyn PlatformReset>,
    pub rng: Box<dyn RandomSource>,
    pub verifier: Box<dyn Pkcs7Verifier>,
}

/// Per-boot engine state.
#[derive(Debug, Clone, Copy)]
struct EngineContext {
    /// Unverified policy read early in boot. Customer state if it could not
    /// be read.
    current_policy: MfciPolicy,
    /// Whether every MFCI variable policy was registered.
    var_policy_registered: bool,
}

/// The MFCI policy driver.
pub struct MfciManager<S: NvramStorage> {
    vars: VariableServices<S>,
    deps: MfciRuntimeDeps,
    config: MfciConfig,
    notifier: PolicyChangeNotifier,
    ctx: EngineContext,
}

impl<S: NvramStorage> MfciManager<S> {
    /// Load the installed policy and register the MFCI variable policies.
    pub fn new(mut vars: VariableServices<S>, deps: MfciRuntimeDeps, config: MfciConfig) -> Self {
        let current_policy = match service::variables::retrieve_current_policy(&mut vars) {
            Ok(policy) => policy,
            Err(e) => {
                if !e.is_not_found() {
                    tracing::warn!(
                        error = &e as &dyn std::error::Error,
                        "could not read current MFCI policy, assuming customer state"
                    );
                }
                MfciPolicy::CUSTOMER_STATE
            }
        };
        tracing::info!(%current_policy, "MFCI policy at boot");

        let var_policy_registered =
            service::variables::register_variable_policies(&mut vars).is_ok();

        Self {
            vars,
            deps,
            config,
            notifier: PolicyChangeNotifier::new(),
            ctx: EngineContext {
                current_policy,
                var_policy_registered,
            },
        }
    }

    /// The policy this boot is running under.
    pub fn current_policy(&self) -> MfciPolicy {
        self.ctx.current_policy
    }

    /// Subscribe to policy transitions. Closed once the platform is ready to
    /// boot.
    pub fn register_policy_change_callback(
        &mut self,
        callback: Box<dyn PolicyChangeCallback>,
    ) -> Result<CallbackHandle, NotifyError> {
        self.notifier.register(callback)
    }

    pub fn unregister_policy_change_callback(
        &mut self,
        handle: CallbackHandle,
    ) -> Result<(), NotifyError> {
        self.notifier.unregister(handle)
    }

    pub fn variables(&mut self) -> &mut VariableServices<S> {
        &mut self.vars
    }

    pub fn into_variables(self) -> VariableServices<S> {
        self.vars
    }

    /// Boot event: end of DXE. Runs the policy check.
    ///
    /// Failures are logged and boot continues. If a requested reset returns
    /// the platform is in an unknown state, and this never returns.
    pub fn on_end_of_dxe(&mut self) {
        match self.verify_policy_and_change() {
            Ok(()) => {}
            Err(MfciError::ResetReturned) => halt(),
            Err(e) => tracing::error!(
                error = &e as &dyn std::error::Error,
                status = %e.status(),
                "MFCI policy check failed"
            ),
        }
    }

    /// Boot event: ready to boot. Closes policy change registration.
    pub fn on_ready_to_boot(&mut self) {
        self.notifier.close();
    }
}

fn halt() -> ! {
    tracing::error!("reset did not take effect, halting");
    loop {
        std::hint::spin_loop();
    }
}

#[cfg(test)]
mod tests {
    use crate::service::notify::PolicyCallbackError;
    use crate::service::nvram::VariableServices;
    use crate::test_support::TestDevice;
    use mfci_specs::mfci::*;
    use mfci_specs::uefi::EfiStatus;

    #[test]
    fn current_policy_defaults_to_customer() {
        let mut device = TestDevice::new();
        assert_eq!(
            device.boot_with(|m| m.current_policy()),
            MfciPolicy::CUSTOMER_STATE
        );

        // malformed
        device
            .storage
            .corrupt(CURRENT_MFCI_POLICY_VARIABLE_NAME, vec![1, 2, 3]);
        assert_eq!(
            device.boot_with(|m| m.current_policy()),
            MfciPolicy::CUSTOMER_STATE
        );

        device.storage.corrupt(
            CURRENT_MFCI_POLICY_VARIABLE_NAME,
            7u64.to_le_bytes().to_vec(),
        );
        assert_eq!(device.boot_with(|m| m.current_policy()), MfciPolicy(7));
    }

    #[test]
    fn registration_closes_at_ready_to_boot() {
        let mut device = TestDevice::new();
        device.boot_with(|m| {
            let handle = m
                .register_policy_change_callback(Box::new(
                    |_: MfciPolicy, _: MfciPolicy| -> Result<(), PolicyCallbackError> { Ok(()) },
                ))
                .unwrap();
            m.unregister_policy_change_callback(handle).unwrap();

            m.on_end_of_dxe();
            m.on_ready_to_boot();

            let err = m
                .register_policy_change_callback(Box::new(
                    |_: MfciPolicy, _: MfciPolicy| -> Result<(), PolicyCallbackError> { Ok(()) },
                ))
                .unwrap_err();
            assert_eq!(err.status(), EfiStatus::ACCESS_DENIED);
        });
    }

    #[test]
    fn end_of_dxe_locks_variables() {
        let mut device = TestDevice::new();
        device.boot_with(|m| {
            m.on_end_of_dxe();
            let (_, data) = m
                .variables()
                .read_variable(MFCI_VAR_VENDOR_GUID, MFCI_LOCK_VARIABLE_NAME)
                .unwrap();
            assert_eq!(data, [MFCI_LOCK_VARIABLE_VALUE]);
        });

        // the lock does not survive a reboot
        let mut vars = VariableServices::new(device.storage.clone());
        assert!(vars
            .read_variable(MFCI_VAR_VENDOR_GUID, MFCI_LOCK_VARIABLE_NAME)
            .is_err());
    }
}
