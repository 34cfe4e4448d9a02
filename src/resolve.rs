use std::borrow::Cow;

use moka::sync::Cache;
use symbolic_demangle::{Demangle, DemangleOptions};

/// Maps a raw frame identifier to the name shown in the image. Called at
/// render time only; aggregation always keys on the raw identifier.
pub trait NameResolver: Send + Sync {
    fn resolve<'a>(&self, frame: &'a str) -> Cow<'a, str>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct IdentityResolver;

impl NameResolver for IdentityResolver {
    fn resolve<'a>(&self, frame: &'a str) -> Cow<'a, str> {
        Cow::Borrowed(frame)
    }
}

/// Demangles Rust and C++ symbols, caching by mangled name.
pub struct DemanglingResolver {
    cache: Cache<String, String, ahash::RandomState>,
}

impl Default for DemanglingResolver {
    fn default() -> Self {
        Self::new(32 * 1024 * 1024)
    }
}

impl DemanglingResolver {
    /// `capacity` is in bytes of mangled name.
    pub fn new(capacity: u64) -> Self {
        let cache = Cache::builder()
            .weigher(|key: &String, _value: &String| -> u32 {
                key.len().try_into().unwrap_or(u32::MAX)
            })
            .max_capacity(capacity)
            .build_with_hasher(ahash::RandomState::default());
        DemanglingResolver { cache }
    }
}

impl NameResolver for DemanglingResolver {
    fn resolve<'a>(&self, frame: &'a str) -> Cow<'a, str> {
        if let Some(hit) = self.cache.get(frame) {
            return Cow::Owned(hit);
        }
        let name = symbolic_common::Name::from(frame);
        let demangled = name.try_demangle(DemangleOptions::name_only());
        if demangled == frame {
            return Cow::Borrowed(frame);
        }
        let demangled = demangled.into_owned();
        self.cache.insert(frame.to_string(), demangled.clone());
        Cow::Owned(demangled)
    }
}
