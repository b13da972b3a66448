use std::any::Any;
use std::panic::{self, AssertUnwindSafe};

use thiserror::Error;

/// Loads the resource for a key.
///
/// Loaders run on a blocking worker thread and are free to do expensive, blocking work. Returning
/// `Ok(None)` means that there is no resource for the key, which is cached just like a resource
/// (see [`AbsentResults`](crate::config::AbsentResults)).
///
/// This is implemented for all closures of the shape `Fn(&K) -> anyhow::Result<Option<R>>`.
pub trait Loader<K, R>: Send + Sync + 'static {
    fn load(&self, key: &K) -> anyhow::Result<Option<R>>;
}

impl<K, R, F> Loader<K, R> for F
where
    F: Fn(&K) -> anyhow::Result<Option<R>> + Send + Sync + 'static,
{
    fn load(&self, key: &K) -> anyhow::Result<Option<R>> {
        self(key)
    }
}

/// A loader that did not produce a result.
///
/// Failed loads are treated like loads without a resource. They are reported to the failure
/// callback and logged, but never propagated to whoever requested the load.
#[derive(Debug, Error)]
pub enum LoadError {
    /// The loader returned an error.
    #[error("loader failed: {0:#}")]
    Failed(anyhow::Error),
    /// The loader panicked.
    #[error("loader panicked: {0}")]
    Panicked(String),
}

impl LoadError {
    /// A short name for this kind of failure, used as metrics tag.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Failed(_) => "failed",
            Self::Panicked(_) => "panicked",
        }
    }
}

/// Invokes `loader`, turning both errors and panics into a [`LoadError`].
pub(crate) fn load_catching<K: 'static, R: 'static>(
    loader: &dyn Loader<K, R>,
    key: &K,
) -> Result<Option<R>, LoadError> {
    match panic::catch_unwind(AssertUnwindSafe(|| loader.load(key))) {
        Ok(Ok(resource)) => Ok(resource),
        Ok(Err(err)) => Err(LoadError::Failed(err)),
        Err(payload) => Err(LoadError::Panicked(panic_message(payload))),
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    match payload.downcast::<String>() {
        Ok(message) => *message,
        Err(payload) => match payload.downcast_ref::<&'static str>() {
            Some(message) => (*message).to_owned(),
            None => "unknown panic payload".to_owned(),
        },
    }
}
