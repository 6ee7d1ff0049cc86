// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! The per-boot policy check.
//!
//! Each boot the engine:
//!
//! 1. provisions the targeting variables if any are missing,
//! 2. makes sure a target nonce has been issued,
//! 3. re-validates the installed policy, reverting to the customer state if
//!    it no longer verifies,
//! 4. looks for a pending policy, and installs it (followed by a reset) if it
//!    is signed, targets this device, and carries the target nonce,
//! 5. locks the MFCI variables for the rest of the boot.
//!
//! Any failure leaves the device in the customer state. If the check could
//! not recover, or the variables could not be locked, while the boot was
//! running under a non-default policy, the platform is reset so that the
//! next boot starts clean.

use crate::service::notify::NotifyError;
use crate::service::targeting::verify_targeting;
use crate::service::targeting_vars::populate_targeting_vars;
use crate::service::targeting_vars::targeting_vars_present;
use crate::service::variables::clean_current_variables;
use crate::service::variables::clean_target_variables;
use crate::service::variables::generate_nonce;
use crate::service::variables::lock_policy_variables;
use crate::service::variables::read_blob_variable;
use crate::service::variables::read_u64_variable;
use crate::service::variables::write_blob_variable;
use crate::service::variables::write_u64_variable;
use crate::MfciError;
use crate::MfciManager;
use mfci_nvram_storage::NvramStorage;
use mfci_policy_blob::validate_blob_with_certificates;
use mfci_specs::mfci::*;
use mfci_specs::uefi::EfiResetType;

/// A pending policy that passed every check.
struct VerifiedTarget {
    /// As signed, actions included.
    policy: MfciPolicy,
    blob: Vec<u8>,
    nonce: u64,
}

impl<S: NvramStorage> MfciManager<S> {
    /// Run the policy check and lock the MFCI variables.
    ///
    /// Returns [`MfciError::ResetReturned`] if a reset was requested and the
    /// platform came back.
    pub fn verify_policy_and_change(&mut self) -> Result<(), MfciError> {
        let result = self.check_policies();
        if let Err(MfciError::ResetReturned) = result {
            return result;
        }
        self.finalize(result)
    }

    fn check_policies(&mut self) -> Result<(), MfciError> {
        if !targeting_vars_present(&mut self.vars) {
            tracing::info!("provisioning MFCI targeting variables");
            populate_targeting_vars(&mut self.vars, self.deps.device_id.as_ref())?;
        }

        let target_nonce = self.ensure_target_nonce();
        self.revalidate_current_policy()?;

        match self.verify_target_policy(target_nonce)? {
            Some(target) => Err(self.commit_transition(target)),
            None => Ok(()),
        }
    }

    /// The nonce a pending policy must carry. Issues one if there is none.
    ///
    /// Returns the invalid nonce if a new one cannot be issued, which no
    /// policy matches.
    fn ensure_target_nonce(&mut self) -> u64 {
        match read_u64_variable(&mut self.vars, NEXT_MFCI_NONCE_VARIABLE_NAME) {
            Ok(MFCI_POLICY_INVALID_NONCE) => {}
            Ok(nonce) => return nonce,
            Err(e) if e.is_not_found() => {}
            Err(e) => tracing::warn!(
                error = &e as &dyn std::error::Error,
                "unusable target nonce, issuing a new one"
            ),
        }

        let nonce = match generate_nonce(self.deps.rng.as_mut()) {
            Ok(nonce) => nonce,
            Err(e) => {
                tracing::error!(
                    error = &e as &dyn std::error::Error,
                    "failed to generate target nonce"
                );
                return MFCI_POLICY_INVALID_NONCE;
            }
        };
        if let Err(e) = write_u64_variable(&mut self.vars, NEXT_MFCI_NONCE_VARIABLE_NAME, nonce) {
            tracing::error!(
                error = &e as &dyn std::error::Error,
                "failed to store target nonce"
            );
            return MFCI_POLICY_INVALID_NONCE;
        }
        tracing::debug!(nonce, "issued target nonce");
        nonce
    }

    fn validate_blob(&self, blob: &[u8]) -> Result<Vec<u8>, MfciError> {
        Ok(validate_blob_with_certificates(
            self.deps.verifier.as_ref(),
            blob,
            &self.config.trust_anchors,
            &self.config.required_ekus(),
        )?)
    }

    /// Check that the installed blob still verifies and still describes the
    /// policy this boot was started under.
    fn revalidate_current_policy(&mut self) -> Result<(), MfciError> {
        let blob = match read_blob_variable(&mut self.vars, CURRENT_MFCI_POLICY_BLOB_VARIABLE_NAME)
        {
            Ok(blob) => blob,
            Err(e) if e.is_not_found() => {
                tracing::debug!("no current policy blob");
                return self.fall_back_current();
            }
            Err(e) => return Err(e),
        };
        let nonce = read_u64_variable(&mut self.vars, CURRENT_MFCI_NONCE_VARIABLE_NAME)?;

        let result = self
            .validate_blob(&blob)
            .and_then(|payload| verify_targeting(&mut self.vars, &payload, nonce));
        match result {
            Ok(policy) if policy.without_actions() == self.ctx.current_policy => {
                tracing::info!(%policy, "current policy verified");
                Ok(())
            }
            Ok(policy) => {
                tracing::warn!(
                    %policy,
                    cached = %self.ctx.current_policy,
                    "current policy blob does not match the installed policy"
                );
                self.fall_back_current()
            }
            Err(e) => {
                tracing::warn!(
                    error = &e as &dyn std::error::Error,
                    status = %e.status(),
                    "current policy failed verification"
                );
                self.fall_back_current()
            }
        }
    }

    fn fall_back_current(&mut self) -> Result<(), MfciError> {
        if !self.ctx.current_policy.is_customer_state() {
            tracing::warn!(
                policy = %self.ctx.current_policy,
                "reverting unverified policy to customer state"
            );
        }
        clean_current_variables(&mut self.vars)
    }

    /// Look for a pending policy. Rejected policies are discarded.
    fn verify_target_policy(
        &mut self,
        target_nonce: u64,
    ) -> Result<Option<VerifiedTarget>, MfciError> {
        let blob = match read_blob_variable(&mut self.vars, NEXT_MFCI_POLICY_BLOB_VARIABLE_NAME) {
            Ok(blob) => blob,
            Err(e) if e.is_not_found() => return Ok(None),
            Err(e) => return Err(e),
        };
        tracing::info!(len = blob.len(), "found pending policy");

        let result = self
            .validate_blob(&blob)
            .and_then(|payload| verify_targeting(&mut self.vars, &payload, target_nonce));
        match result {
            Ok(policy) => Ok(Some(VerifiedTarget {
                policy,
                blob,
                nonce: target_nonce,
            })),
            Err(e) => {
                tracing::warn!(
                    error = &e as &dyn std::error::Error,
                    status = %e.status(),
                    "rejecting pending policy"
                );
                self.fall_back_target()?;
                Ok(None)
            }
        }
    }

    fn fall_back_target(&mut self) -> Result<(), MfciError> {
        let target = clean_target_variables(&mut self.vars, self.deps.rng.as_mut());
        let current = clean_current_variables(&mut self.vars);
        target.and(current)
    }

    /// Install `target` as the current policy and reset.
    fn commit_transition(&mut self, target: VerifiedTarget) -> MfciError {
        let previous = self.ctx.current_policy;
        tracing::info!(policy = %target.policy, %previous, "installing new policy");

        match self.notifier.notify(target.policy, previous) {
            Ok(count) => tracing::debug!(count, "notified policy change callbacks"),
            Err(NotifyError::NotFound) => tracing::debug!("no policy change callbacks"),
            Err(e) => tracing::warn!(
                error = &e as &dyn std::error::Error,
                "failed to notify policy change"
            ),
        }

        // actions are applied by the callbacks on this boot only
        let policy = target.policy.without_actions();
        let installed = if policy.is_customer_state() {
            clean_current_variables(&mut self.vars)
        } else {
            self.install_current(policy, target.blob, target.nonce)
        };
        if let Err(e) = installed {
            tracing::error!(
                error = &e as &dyn std::error::Error,
                "failed to install new policy"
            );
        }

        if let Err(e) = clean_target_variables(&mut self.vars, self.deps.rng.as_mut()) {
            tracing::error!(
                error = &e as &dyn std::error::Error,
                "failed to clean target policy variables"
            );
        }

        self.reset_system()
    }

    fn install_current(
        &mut self,
        policy: MfciPolicy,
        blob: Vec<u8>,
        nonce: u64,
    ) -> Result<(), MfciError> {
        write_blob_variable(&mut self.vars, CURRENT_MFCI_POLICY_BLOB_VARIABLE_NAME, blob)?;
        write_u64_variable(&mut self.vars, CURRENT_MFCI_NONCE_VARIABLE_NAME, nonce)?;
        write_u64_variable(&mut self.vars, CURRENT_MFCI_POLICY_VARIABLE_NAME, policy.0)
    }

    fn reset_system(&mut self) -> MfciError {
        tracing::info!("resetting to apply policy change");
        self.deps
            .reset
            .reset_system(EfiResetType::Cold, MFCI_POLICY_CHANGE_RESET_GUID);
        tracing::error!("platform reset returned");
        MfciError::ResetReturned
    }

    /// Lock the variables, resetting if this boot cannot be trusted.
    fn finalize(&mut self, prior: Result<(), MfciError>) -> Result<(), MfciError> {
        // must happen while the variables are still writable
        if let Err(e) = &prior {
            tracing::error!(
                error = e as &dyn std::error::Error,
                status = %e.status(),
                "policy check failed, reverting to customer state"
            );
            if let Err(e) = clean_current_variables(&mut self.vars) {
                tracing::error!(
                    error = &e as &dyn std::error::Error,
                    "failed to revert to customer state"
                );
            }
        }

        let lock = lock_policy_variables(&mut self.vars, self.ctx.var_policy_registered);
        if let Err(e) = &lock {
            tracing::error!(
                error = e as &dyn std::error::Error,
                "variables could not be locked, reverting to customer state"
            );
            if let Err(e) = clean_current_variables(&mut self.vars) {
                tracing::error!(
                    error = &e as &dyn std::error::Error,
                    "failed to revert to customer state"
                );
            }
        }

        if (prior.is_err() || lock.is_err()) && !self.ctx.current_policy.is_customer_state() {
            return Err(self.reset_system());
        }
        prior.and(lock)
    }
}

#[cfg(test)]
mod tests {
    use crate::service::notify::PolicyCallbackError;
    use crate::service::nvram::VariableError;
    use crate::service::nvram::VariablePolicy;
    use crate::service::nvram::VariableServices;
    use crate::test_support::fake_sign;
    use crate::test_support::test_policy_fields;
    use crate::test_support::TestDevice;
    use crate::MfciError;
    use crate::MfciManager;
    use mfci_nvram_storage::NvramStorage;
    use mfci_specs::mfci::*;
    use mfci_specs::uefi::EfiResetType;
    use mfci_specs::uefi::EfiStatus;
    use mfci_specs::uefi::EfiVariableAttributes;
    use std::cell::RefCell;
    use std::rc::Rc;

    const MANUFACTURING: MfciPolicy = MfciPolicy(0x2);

    type Seen = Rc<RefCell<Vec<(MfciPolicy, MfciPolicy)>>>;

    /// Boot with a callback recording every policy change.
    fn boot_recording(device: &mut TestDevice) -> (Result<(), MfciError>, Seen) {
        let seen = Seen::default();
        let log = seen.clone();
        let result = device.boot_with(|m| {
            m.register_policy_change_callback(Box::new(
                move |new: MfciPolicy, previous: MfciPolicy| -> Result<(), PolicyCallbackError> {
                    log.borrow_mut().push((new, previous));
                    Ok(())
                },
            ))
            .unwrap();
            m.verify_policy_and_change()
        });
        (result, seen)
    }

    fn customer_state() -> (Option<u64>, Option<u64>, Option<Vec<u8>>) {
        (Some(0), Some(MFCI_POLICY_INVALID_NONCE), None)
    }

    /// A device that has installed `policy`, along with the installed blob.
    fn installed(policy: MfciPolicy) -> (TestDevice, Vec<u8>) {
        let mut device = TestDevice::new();
        device.boot().unwrap();
        let blob = device.stage_policy(policy);
        assert!(matches!(device.boot(), Err(MfciError::ResetReturned)));
        assert_eq!(device.reset.count(), 1);
        (device, blob)
    }

    #[test]
    fn fresh_device() {
        let mut device = TestDevice::new();
        device.boot().unwrap();

        for field in TargetingField::ALL {
            assert!(device.storage.read(field.variable_name()).is_some(), "{field}");
        }
        let nonce = device.next_nonce();
        assert_ne!(nonce, MFCI_POLICY_INVALID_NONCE);
        assert_eq!(device.current(), customer_state());
        assert_eq!(device.reset.count(), 0);

        // the issued nonce is kept until a policy consumes it
        device.boot().unwrap();
        assert_eq!(device.next_nonce(), nonce);
        assert_eq!(device.reset.count(), 0);
    }

    #[test]
    fn install_policy() {
        let mut device = TestDevice::new();
        device.boot().unwrap();
        let nonce = device.next_nonce();
        let policy = MfciPolicy(MANUFACTURING.0 | MfciPolicy::STD_ACTION_TPM_CLEAR);
        let blob = device.stage_policy(policy);

        let (result, seen) = boot_recording(&mut device);
        assert!(matches!(result, Err(MfciError::ResetReturned)));
        assert_eq!(
            *device.reset.requests.borrow(),
            [(EfiResetType::Cold, MFCI_POLICY_CHANGE_RESET_GUID)]
        );
        // callbacks see the actions, storage does not
        assert_eq!(*seen.borrow(), [(policy, MfciPolicy::CUSTOMER_STATE)]);
        assert_eq!(
            device.current(),
            (Some(MANUFACTURING.0), Some(nonce), Some(blob.clone()))
        );
        assert_ne!(device.next_nonce(), nonce);
        assert!(device
            .storage
            .read(NEXT_MFCI_POLICY_BLOB_VARIABLE_NAME)
            .is_none());

        // stable from here on
        for _ in 0..2 {
            let (result, seen) = boot_recording(&mut device);
            result.unwrap();
            assert!(seen.borrow().is_empty());
        }
        assert_eq!(device.reset.count(), 1);
        assert_eq!(device.boot_with(|m| m.current_policy()), MANUFACTURING);
        assert_eq!(
            device.current(),
            (Some(MANUFACTURING.0), Some(nonce), Some(blob))
        );
    }

    #[test]
    fn return_to_customer_state() {
        let (mut device, _) = installed(MANUFACTURING);
        device.stage_policy(MfciPolicy::CUSTOMER_STATE);

        let (result, seen) = boot_recording(&mut device);
        assert!(matches!(result, Err(MfciError::ResetReturned)));
        assert_eq!(*seen.borrow(), [(MfciPolicy::CUSTOMER_STATE, MANUFACTURING)]);
        assert_eq!(device.current(), customer_state());
        assert_eq!(device.reset.count(), 2);

        device.boot().unwrap();
        assert_eq!(device.reset.count(), 2);
    }

    #[test]
    fn action_only_policy() {
        let mut device = TestDevice::new();
        device.boot().unwrap();
        let policy = MfciPolicy(MfciPolicy::STD_ACTION_SECURE_BOOT_CLEAR);
        device.stage_policy(policy);

        let (result, seen) = boot_recording(&mut device);
        assert!(matches!(result, Err(MfciError::ResetReturned)));
        assert_eq!(*seen.borrow(), [(policy, MfciPolicy::CUSTOMER_STATE)]);
        assert_eq!(device.current(), customer_state());
        assert_eq!(device.reset.count(), 1);

        // actions fire once
        let (result, seen) = boot_recording(&mut device);
        result.unwrap();
        assert!(seen.borrow().is_empty());
        assert_eq!(device.reset.count(), 1);
    }

    #[test]
    fn tampered_current_blob() {
        let (mut device, _) = installed(MANUFACTURING);
        device
            .storage
            .corrupt(CURRENT_MFCI_POLICY_BLOB_VARIABLE_NAME, b"junk".to_vec());

        // the fallback recovers, so the boot carries on
        device.boot().unwrap();
        assert_eq!(device.reset.count(), 1);
        assert_eq!(device.current(), customer_state());

        device.boot().unwrap();
        assert_eq!(device.reset.count(), 1);
        assert_eq!(
            device.boot_with(|m| m.current_policy()),
            MfciPolicy::CUSTOMER_STATE
        );
    }

    #[test]
    fn edited_current_policy() {
        let (mut device, _) = installed(MANUFACTURING);
        device.storage.corrupt(
            CURRENT_MFCI_POLICY_VARIABLE_NAME,
            0x3u64.to_le_bytes().to_vec(),
        );

        device.boot().unwrap();
        assert_eq!(device.current(), customer_state());
        device.boot().unwrap();
        assert_eq!(device.reset.count(), 1);
    }

    #[test]
    fn stale_nonce_rejected() {
        let mut device = TestDevice::new();
        device.boot().unwrap();
        let nonce = device.next_nonce();
        device.stage(fake_sign(
            &test_policy_fields(nonce + 7, MANUFACTURING).to_payload(),
        ));

        let (result, seen) = boot_recording(&mut device);
        result.unwrap();
        assert!(seen.borrow().is_empty());
        assert_eq!(device.reset.count(), 0);
        assert_ne!(device.next_nonce(), nonce);
        assert!(device
            .storage
            .read(NEXT_MFCI_POLICY_BLOB_VARIABLE_NAME)
            .is_none());
        assert_eq!(device.current(), customer_state());
    }

    #[test]
    fn replayed_policy_rejected() {
        let (mut device, blob) = installed(MANUFACTURING);
        device.stage_policy(MfciPolicy::CUSTOMER_STATE);
        assert!(matches!(device.boot(), Err(MfciError::ResetReturned)));
        assert_eq!(device.reset.count(), 2);

        device.stage(blob);
        let (result, seen) = boot_recording(&mut device);
        result.unwrap();
        assert!(seen.borrow().is_empty());
        assert_eq!(device.reset.count(), 2);
        assert_eq!(device.current(), customer_state());
    }

    #[test]
    fn unsigned_policy_rejected() {
        let mut device = TestDevice::new();
        device.boot().unwrap();
        let nonce = device.next_nonce();
        device.stage(test_policy_fields(nonce, MANUFACTURING).to_payload());

        device.boot().unwrap();
        assert_eq!(device.reset.count(), 0);
        assert_ne!(device.next_nonce(), nonce);
        assert_eq!(device.current(), customer_state());

        // no usable trust anchors
        device.config.trust_anchors.clear();
        device.stage_policy(MANUFACTURING);
        device.boot().unwrap();
        assert_eq!(device.reset.count(), 0);
        assert_eq!(device.current(), customer_state());
    }

    #[test]
    fn targeting_mismatch_rejected() {
        for field in TargetingField::ALL {
            let mut device = TestDevice::new();
            device.boot().unwrap();
            let mut fields = test_policy_fields(device.next_nonce(), MANUFACTURING);
            fields.targeting_mut(field).push('x');
            device.stage(fake_sign(&fields.to_payload()));

            device.boot().unwrap();
            assert_eq!(device.reset.count(), 0, "{field}");
            assert_eq!(device.current(), customer_state(), "{field}");
            assert!(device
                .storage
                .read(NEXT_MFCI_POLICY_BLOB_VARIABLE_NAME)
                .is_none());
        }
    }

    #[test]
    fn interrupted_install_converges() {
        // the blob and nonce landed but the policy did not
        let (mut device, _) = installed(MANUFACTURING);
        device.storage.corrupt(
            CURRENT_MFCI_POLICY_VARIABLE_NAME,
            MfciPolicy::CUSTOMER_STATE.to_le_bytes().to_vec(),
        );

        let mut boots = 0;
        while device.boot().is_err() {
            boots += 1;
            assert!(boots < 3, "did not converge");
        }
        assert_eq!(device.current(), customer_state());
        assert_eq!(device.reset.count(), 1);
    }

    #[test]
    fn mismatched_attributes_converge() {
        let boot_service_only = EfiVariableAttributes::new()
            .with_non_volatile(true)
            .with_bootservice_access(true);
        let mut device = TestDevice::new();
        device.boot().unwrap();
        device.storage.store_with_attributes(
            CURRENT_MFCI_POLICY_VARIABLE_NAME,
            boot_service_only,
            5u64.to_le_bytes().to_vec(),
        );
        device.storage.store_with_attributes(
            NEXT_MFCI_NONCE_VARIABLE_NAME,
            boot_service_only,
            7u64.to_le_bytes().to_vec(),
        );

        device.boot().unwrap();
        assert_eq!(device.current(), customer_state());
        for name in [
            CURRENT_MFCI_POLICY_VARIABLE_NAME,
            CURRENT_MFCI_NONCE_VARIABLE_NAME,
            NEXT_MFCI_NONCE_VARIABLE_NAME,
        ] {
            assert_eq!(
                device.storage.attributes(name),
                Some(MFCI_POLICY_VARIABLE_ATTR),
                "{name}"
            );
        }
        let nonce = device.next_nonce();
        assert_ne!(nonce, 7);
        assert_ne!(nonce, MFCI_POLICY_INVALID_NONCE);

        // and a fresh policy is accepted again
        device.stage_policy(MANUFACTURING);
        assert!(matches!(device.boot(), Err(MfciError::ResetReturned)));
        assert_eq!(
            device.read_u64(CURRENT_MFCI_POLICY_VARIABLE_NAME),
            Some(MANUFACTURING.0)
        );
    }

    #[test]
    fn malformed_current_blob_aborts() {
        let (mut device, blob) = installed(MANUFACTURING);
        let inner = &mut device.storage.inner;
        inner
            .remove_variable(CURRENT_MFCI_POLICY_BLOB_VARIABLE_NAME, MFCI_VAR_VENDOR_GUID)
            .unwrap();
        inner
            .set_variable(
                CURRENT_MFCI_POLICY_BLOB_VARIABLE_NAME,
                MFCI_VAR_VENDOR_GUID,
                EfiVariableAttributes::DEFAULT_ATTRIBUTES_VOLATILE.into(),
                blob,
            )
            .unwrap();

        assert!(matches!(device.boot(), Err(MfciError::ResetReturned)));
        assert_eq!(device.current(), customer_state());
        device.boot().unwrap();
        assert_eq!(device.reset.count(), 2);

        // on a customer device the failure is reported and nothing resets
        let mut device = TestDevice::new();
        device.boot().unwrap();
        device
            .storage
            .inner
            .set_variable(
                CURRENT_MFCI_POLICY_BLOB_VARIABLE_NAME,
                MFCI_VAR_VENDOR_GUID,
                EfiVariableAttributes::DEFAULT_ATTRIBUTES_VOLATILE.into(),
                b"blob".to_vec(),
            )
            .unwrap();
        let err = device.boot().unwrap_err();
        assert!(matches!(err, MfciError::MalformedVariable { .. }));
        assert_eq!(err.status(), EfiStatus::DEVICE_ERROR);
        assert_eq!(device.reset.count(), 0);
        assert_eq!(device.current(), customer_state());
    }

    #[test]
    fn cleanup_failure_aborts() {
        let (mut device, _) = installed(MANUFACTURING);
        device
            .storage
            .corrupt(CURRENT_MFCI_POLICY_BLOB_VARIABLE_NAME, b"junk".to_vec());
        device
            .storage
            .fail_writes_to(CURRENT_MFCI_NONCE_VARIABLE_NAME);

        // the rest of the cleanup still happens, and the boot is not trusted
        assert!(matches!(device.boot(), Err(MfciError::ResetReturned)));
        assert_eq!(device.reset.count(), 2);
        assert_eq!(device.read_u64(CURRENT_MFCI_POLICY_VARIABLE_NAME), Some(0));
        assert!(device
            .storage
            .read(CURRENT_MFCI_POLICY_BLOB_VARIABLE_NAME)
            .is_none());

        device.storage.clear_failures();
        device.boot().unwrap();
        assert_eq!(device.current(), customer_state());
        assert_eq!(device.reset.count(), 2);
    }

    #[test]
    fn torn_current_nonce_converges() {
        let (mut device, _) = installed(MANUFACTURING);
        device.storage.corrupt(
            CURRENT_MFCI_NONCE_VARIABLE_NAME,
            0xdeadu64.to_le_bytes().to_vec(),
        );

        device.boot().unwrap();
        assert_eq!(device.current(), customer_state());
        device.boot().unwrap();
        assert_eq!(device.reset.count(), 1);
    }

    #[test]
    fn variables_locked_after_check() {
        let (mut device, _) = installed(MANUFACTURING);
        device.boot_with(|m| {
            m.verify_policy_and_change().unwrap();
            let vars = m.variables();
            for &name in MFCI_LOCKED_VARIABLE_NAMES {
                let err = vars
                    .set_variable(
                        MFCI_VAR_VENDOR_GUID,
                        name,
                        MFCI_POLICY_VARIABLE_ATTR,
                        vec![0; 8],
                    )
                    .unwrap_err();
                assert!(matches!(err, VariableError::WriteProtected), "{name}");
            }
            assert!(matches!(
                vars.delete_variable(MFCI_VAR_VENDOR_GUID, MFCI_LOCK_VARIABLE_NAME),
                Err(VariableError::WriteProtected)
            ));
            assert!(matches!(
                vars.set_variable(
                    MFCI_VAR_VENDOR_GUID,
                    MFCI_LOCK_VARIABLE_NAME,
                    MFCI_LOCK_VARIABLE_ATTR,
                    vec![0],
                ),
                Err(VariableError::WriteProtected)
            ));

            // the OS may still stage a policy
            vars.set_variable(
                MFCI_VAR_VENDOR_GUID,
                NEXT_MFCI_POLICY_BLOB_VARIABLE_NAME,
                MFCI_POLICY_VARIABLE_ATTR,
                b"pending".to_vec(),
            )
            .unwrap();
        });
    }

    /// Boot with the lock variable write-protected by a foreign policy.
    fn boot_unlockable(device: &mut TestDevice) -> Result<(), MfciError> {
        let mut vars = VariableServices::new(std::mem::take(&mut device.storage));
        vars.register_policy(
            VariablePolicy::new(MFCI_VAR_VENDOR_GUID, MFCI_LOCK_VARIABLE_NAME).lock_on_var_state(
                MFCI_VAR_VENDOR_GUID,
                "Blocker",
                1,
            ),
        )
        .unwrap();
        vars.set_variable(
            MFCI_VAR_VENDOR_GUID,
            "Blocker",
            EfiVariableAttributes::DEFAULT_ATTRIBUTES_VOLATILE,
            vec![1],
        )
        .unwrap();

        let mut manager = MfciManager::new(vars, device.deps(), device.config.clone());
        let result = manager.verify_policy_and_change();
        device.storage = manager.into_variables().into_storage();
        result
    }

    #[test]
    fn lock_failure_resets_policy() {
        let (mut device, _) = installed(MANUFACTURING);

        assert!(matches!(
            boot_unlockable(&mut device),
            Err(MfciError::ResetReturned)
        ));
        assert_eq!(device.reset.count(), 2);
        assert_eq!(device.current(), customer_state());

        // a customer device has nothing to protect
        let err = boot_unlockable(&mut device).unwrap_err();
        assert!(matches!(err, MfciError::LockFailed(_)));
        assert_eq!(err.status(), EfiStatus::SECURITY_VIOLATION);
        assert_eq!(device.reset.count(), 2);
    }

    #[test]
    fn missing_identity_aborts() {
        let mut device = TestDevice::new();
        device.identity.serial_number = None;

        let err = device.boot().unwrap_err();
        assert!(matches!(err, MfciError::DeviceId(_)));
        assert_eq!(err.status(), EfiStatus::UNSUPPORTED);
        assert_eq!(device.reset.count(), 0);
        assert!(device.storage.read(NEXT_MFCI_NONCE_VARIABLE_NAME).is_none());
        assert_eq!(device.current(), customer_state());
    }

    #[test]
    fn rng_failure() {
        let mut device = TestDevice::new();
        device.rng.fail.set(true);
        device.boot().unwrap();
        assert!(device.storage.read(NEXT_MFCI_NONCE_VARIABLE_NAME).is_none());

        // a policy carrying the invalid nonce is discarded
        device.stage(fake_sign(
            &test_policy_fields(MFCI_POLICY_INVALID_NONCE, MANUFACTURING).to_payload(),
        ));
        let err = device.boot().unwrap_err();
        assert!(matches!(err, MfciError::Rng(_)));
        assert_eq!(device.reset.count(), 0);
        assert_eq!(
            device.read_u64(NEXT_MFCI_NONCE_VARIABLE_NAME),
            Some(MFCI_POLICY_INVALID_NONCE)
        );
        assert!(device
            .storage
            .read(NEXT_MFCI_POLICY_BLOB_VARIABLE_NAME)
            .is_none());

        // recovers once randomness is back
        device.rng.fail.set(false);
        device.boot().unwrap();
        assert_ne!(device.next_nonce(), MFCI_POLICY_INVALID_NONCE);
    }
}
