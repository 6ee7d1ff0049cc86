// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Notification of policy transitions to interested boot components.

use mfci_specs::mfci::MfciPolicy;
use mfci_specs::uefi::EfiStatus;
use thiserror::Error;

pub type PolicyCallbackError = Box<dyn std::error::Error + Send + Sync>;

/// A subscriber to policy transitions.
///
/// Invoked with the new policy, including its action bits, before anything
/// is persisted.
pub trait PolicyChangeCallback {
    fn policy_changed(
        &mut self,
        new_policy: MfciPolicy,
        previous_policy: MfciPolicy,
    ) -> Result<(), PolicyCallbackError>;
}

impl<F> PolicyChangeCallback for F
where
    F: FnMut(MfciPolicy, MfciPolicy) -> Result<(), PolicyCallbackError>,
{
    fn policy_changed(
        &mut self,
        new_policy: MfciPolicy,
        previous_policy: MfciPolicy,
    ) -> Result<(), PolicyCallbackError> {
        (self)(new_policy, previous_policy)
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum NotifyError {
    #[error("callback registration is closed")]
    TooLate,
    #[error("no such callback")]
    NotFound,
}

impl NotifyError {
    pub fn status(&self) -> EfiStatus {
        match self {
            NotifyError::TooLate => EfiStatus::ACCESS_DENIED,
            NotifyError::NotFound => EfiStatus::NOT_FOUND,
        }
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct CallbackHandle(u64);

/// Registry of [`PolicyChangeCallback`]s, open until [`Self::close`].
#[derive(Default)]
pub struct PolicyChangeNotifier {
    callbacks: Vec<(CallbackHandle, Box<dyn PolicyChangeCallback>)>,
    next_handle: u64,
    closed: bool,
}

impl PolicyChangeNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(
        &mut self,
        callback: Box<dyn PolicyChangeCallback>,
    ) -> Result<CallbackHandle, NotifyError> {
        if self.closed {
            return Err(NotifyError::TooLate);
        }
        let handle = CallbackHandle(self.next_handle);
        self.next_handle += 1;
        self.callbacks.push((handle, callback));
        Ok(handle)
    }

    pub fn unregister(&mut self, handle: CallbackHandle) -> Result<(), NotifyError> {
        let index = self
            .callbacks
            .iter()
            .position(|(h, _)| *h == handle)
            .ok_or(NotifyError::NotFound)?;
        self.callbacks.remove(index);
        Ok(())
    }

    /// Drop every callback and refuse further registrations.
    pub fn close(&mut self) {
        tracing::debug!(
            count = self.callbacks.len(),
            "closing policy change notifications"
        );
        self.callbacks.clear();
        self.closed = true;
    }

    /// Invoke every callback in registration order, returning how many
    /// were called. A failing callback is logged and skipped.
    pub fn notify(
        &mut self,
        new_policy: MfciPolicy,
        previous_policy: MfciPolicy,
    ) -> Result<usize, NotifyError> {
        if self.callbacks.is_empty() {
            return Err(NotifyError::NotFound);
        }
        for (handle, callback) in &mut self.callbacks {
            if let Err(e) = callback.policy_changed(new_policy, previous_policy) {
                tracing::warn!(
                    ?handle,
                    error = e.as_ref() as &dyn std::error::Error,
                    "policy change callback failed"
                );
            }
        }
        Ok(self.callbacks.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::rc::Rc;

    type Log = Rc<RefCell<Vec<(&'static str, MfciPolicy, MfciPolicy)>>>;

    fn recorder(log: &Log, name: &'static str) -> Box<dyn PolicyChangeCallback> {
        let log = log.clone();
        Box::new(
            move |new: MfciPolicy, previous: MfciPolicy| -> Result<(), PolicyCallbackError> {
                log.borrow_mut().push((name, new, previous));
                Ok(())
            },
        )
    }

    #[test]
    fn registration_order() {
        let log = Log::default();
        let mut notifier = PolicyChangeNotifier::new();
        notifier.register(recorder(&log, "a")).unwrap();
        notifier
            .register(Box::new(
                |_: MfciPolicy, _: MfciPolicy| -> Result<(), PolicyCallbackError> {
                    Err("boom".into())
                },
            ))
            .unwrap();
        notifier.register(recorder(&log, "b")).unwrap();

        let count = notifier
            .notify(MfciPolicy(0x1_0000_0002), MfciPolicy(0))
            .unwrap();
        assert_eq!(count, 3);
        assert_eq!(
            *log.borrow(),
            [
                ("a", MfciPolicy(0x1_0000_0002), MfciPolicy(0)),
                ("b", MfciPolicy(0x1_0000_0002), MfciPolicy(0)),
            ]
        );
    }

    #[test]
    fn unregister() {
        let log = Log::default();
        let mut notifier = PolicyChangeNotifier::new();
        let a = notifier.register(recorder(&log, "a")).unwrap();
        notifier.unregister(a).unwrap();
        assert_eq!(notifier.unregister(a), Err(NotifyError::NotFound));

        let err = notifier.notify(MfciPolicy(1), MfciPolicy(0)).unwrap_err();
        assert_eq!(err, NotifyError::NotFound);
        assert_eq!(err.status(), EfiStatus::NOT_FOUND);
        assert!(log.borrow().is_empty());
    }

    #[test]
    fn closed_registry() {
        let log = Log::default();
        let mut notifier = PolicyChangeNotifier::new();
        notifier.register(recorder(&log, "a")).unwrap();
        notifier.close();

        let err = notifier.register(recorder(&log, "late")).unwrap_err();
        assert_eq!(err, NotifyError::TooLate);
        assert_eq!(err.status(), EfiStatus::ACCESS_DENIED);
        assert_eq!(
            notifier.notify(MfciPolicy(1), MfciPolicy(0)),
            Err(NotifyError::NotFound)
        );
        assert!(log.borrow().is_empty());
    }
}
