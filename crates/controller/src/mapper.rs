//! Identity mapping between a source kind and the target kind derived from it.

use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;

use keel_core::{ResourceKey, ResourceSpec};

type MapFn = Arc<dyn Fn(&ResourceKey) -> ResourceKey + Send + Sync>;

/// Forward (source → target) and backward (target → source) key mapping.
///
/// The two directions must be inverse: `backward(forward(k)) == k` for every key of kind `S`.
/// Both are total over keys of their kind; they never consult the store.
pub struct PairedMapper<S, T> {
    forward: MapFn,
    backward: MapFn,
    _kinds: PhantomData<fn() -> (S, T)>,
}

impl<S: ResourceSpec, T: ResourceSpec> PairedMapper<S, T> {
    pub fn new<F, B>(forward: F, backward: B) -> Self
    where
        F: Fn(&ResourceKey) -> ResourceKey + Send + Sync + 'static,
        B: Fn(&ResourceKey) -> ResourceKey + Send + Sync + 'static,
    {
        Self { forward: Arc::new(forward), backward: Arc::new(backward), _kinds: PhantomData }
    }

    /// Target shares namespace and id with its source; only the kind differs.
    pub fn same_id() -> Self {
        Self::new(
            |k| ResourceKey::new(k.namespace.clone(), T::KIND, k.id.clone()),
            |k| ResourceKey::new(k.namespace.clone(), S::KIND, k.id.clone()),
        )
    }

    pub fn forward(&self, source: &ResourceKey) -> ResourceKey { (self.forward)(source) }

    pub fn backward(&self, target: &ResourceKey) -> ResourceKey { (self.backward)(target) }
}

impl<S: ResourceSpec, T: ResourceSpec> Default for PairedMapper<S, T> {
    fn default() -> Self { Self::same_id() }
}

impl<S, T> Clone for PairedMapper<S, T> {
    fn clone(&self) -> Self {
        Self { forward: self.forward.clone(), backward: self.backward.clone(), _kinds: PhantomData }
    }
}

impl<S: ResourceSpec, T: ResourceSpec> fmt::Debug for PairedMapper<S, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PairedMapper").field("source", &S::KIND).field("target", &T::KIND).finish()
    }
}
