use alloc::string::String;

use fm_support::Location;
use snafu::Snafu;

/// Per-item construction strategy for [`GrowPool`](crate::GrowPool) and
/// [`ResMgr`](crate::ResMgr).
///
/// An item goes through three phases. `construct` builds it and cannot fail.
/// `init` runs exactly once on the freshly built item and may fail, in which
/// case the pool hands the item straight to `destruct` and stops growing.
/// `destruct` runs on teardown and is best-effort cleanup only.
pub trait ItemLifecycle<T> {
    fn construct(&mut self) -> T;

    fn init(&mut self, item: &mut T) -> Result<(), InitError> {
        let _ = item;
        Ok(())
    }

    fn destruct(&mut self, item: T) {
        drop(item);
    }
}

/// Builds items with [`Default`] and has no init or teardown work.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct DefaultLifecycle;

impl<T: Default> ItemLifecycle<T> for DefaultLifecycle {
    fn construct(&mut self) -> T {
        T::default()
    }
}

/// An [`ItemLifecycle::init`] failure.
#[derive(Debug, Snafu)]
#[snafu(display("item initialization failed: {reason}"))]
pub struct InitError {
    reason: String,
    #[snafu(implicit)]
    location: Location,
}

impl InitError {
    #[must_use]
    #[track_caller]
    pub fn new(reason: impl Into<String>) -> Self {
        InitSnafu {
            reason: reason.into(),
        }
        .build()
    }

    #[must_use]
    pub fn reason(&self) -> &str {
        &self.reason
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_lifecycle() {
        let mut lifecycle = DefaultLifecycle;
        let mut item: Vec<u8> = lifecycle.construct();
        assert!(item.is_empty());
        ItemLifecycle::<Vec<u8>>::init(&mut lifecycle, &mut item).unwrap();
        lifecycle.destruct(item);
    }

    #[test]
    fn test_init_error() {
        let err = InitError::new("no doorbell");
        assert_eq!(err.reason(), "no doorbell");
        assert_eq!(err.to_string(), "item initialization failed: no doorbell");
        assert!(err.location.file().ends_with("lifecycle.rs"));
    }
}
