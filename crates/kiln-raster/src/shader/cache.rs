use std::fmt;

use hashbrown::HashMap;

use super::compiler::{CompiledVariant, ShaderEntry};

/// Snapshot of a cache's counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct VariantCacheStats {
    pub hits: u64,
    pub misses: u64,
    pub entries: u64,
}

/// Exact-match map from variant key bytes to compiled variants.
///
/// There is no eviction: a variant lives until its owner (shader object,
/// vertex elements or context) is released through the fence.
#[derive(Default)]
pub struct VariantCache {
    entries: HashMap<Box<[u8]>, CompiledVariant>,
    hits: u64,
    misses: u64,
}

impl VariantCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn stats(&self) -> VariantCacheStats {
        VariantCacheStats {
            hits: self.hits,
            misses: self.misses,
            entries: self.entries.len() as u64,
        }
    }

    pub fn get(&self, key: &[u8]) -> Option<&CompiledVariant> {
        self.entries.get(key)
    }

    /// Look `key` up, calling `compile` only on a miss. The flag is `true`
    /// when `compile` ran.
    pub fn get_or_insert_with(
        &mut self,
        key: &[u8],
        compile: impl FnOnce() -> CompiledVariant,
    ) -> (ShaderEntry, bool) {
        if let Some(variant) = self.entries.get(key) {
            self.hits += 1;
            return (variant.entry.clone(), false);
        }

        self.misses += 1;
        let variant = compile();
        let entry = variant.entry.clone();
        self.entries.insert(key.into(), variant);
        (entry, true)
    }

    /// Remove every variant, handing ownership to the caller.
    pub fn drain(&mut self) -> Vec<CompiledVariant> {
        self.entries.drain().map(|(_, variant)| variant).collect()
    }
}

impl fmt::Debug for VariantCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VariantCache")
            .field("entries", &self.entries.len())
            .field("hits", &self.hits)
            .field("misses", &self.misses)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shader::{CompiledModule, Invocation, VariantKind};
    use std::sync::Arc;

    #[derive(Debug)]
    struct NoModule;
    impl CompiledModule for NoModule {}

    fn variant() -> CompiledVariant {
        CompiledVariant {
            entry: ShaderEntry::new(
                VariantKind::Fragment,
                Arc::new(|_inv: &mut Invocation<'_>| {}),
            ),
            module: Box::new(NoModule),
        }
    }

    #[test]
    fn identical_bytes_hit() {
        let mut cache = VariantCache::new();
        let (a, compiled_a) = cache.get_or_insert_with(&[1, 2, 3, 4], variant);
        let (b, compiled_b) = cache.get_or_insert_with(&[1, 2, 3, 4], || {
            panic!("must not compile twice for the same key")
        });
        assert!(compiled_a);
        assert!(!compiled_b);
        assert!(a.same_as(&b));
        assert_eq!(
            cache.stats(),
            VariantCacheStats {
                hits: 1,
                misses: 1,
                entries: 1
            }
        );
    }

    #[test]
    fn single_byte_difference_misses() {
        let mut cache = VariantCache::new();
        let (a, _) = cache.get_or_insert_with(&[1, 2, 3, 4], variant);
        let (b, compiled) = cache.get_or_insert_with(&[1, 2, 3, 5], variant);
        assert!(compiled);
        assert!(!a.same_as(&b));
        assert_eq!(cache.len(), 2);

        assert_eq!(cache.drain().len(), 2);
        assert!(cache.is_empty());
    }
}
