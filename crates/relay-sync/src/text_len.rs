use std::collections::HashMap;
use std::sync::{Arc, Weak};

use relay_core::model::{text_len, PartRecord};

const MAX_ENTRIES: usize = 4_096;

/// Memoized text length per parts collection.
///
/// Keyed by allocation address. Each entry holds a `Weak` to its collection,
/// which keeps the allocation from being reused while the entry exists, so
/// an address hit always refers to the same immutable collection.
#[derive(Default)]
pub struct TextLengthCache {
    entries: HashMap<usize, (Weak<Vec<PartRecord>>, usize)>,
}

impl TextLengthCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn length_of(&mut self, parts: &Arc<Vec<PartRecord>>) -> usize {
        let key = Arc::as_ptr(parts) as usize;
        if let Some((_, len)) = self.entries.get(&key) {
            return *len;
        }
        let len = text_len(parts);
        if self.entries.len() >= MAX_ENTRIES {
            self.entries.retain(|_, (weak, _)| weak.strong_count() > 0);
            if self.entries.len() >= MAX_ENTRIES {
                self.entries.clear();
            }
        }
        self.entries.insert(key, (Arc::downgrade(parts), len));
        len
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use relay_core::ids::PartId;
    use relay_core::model::PartKind;

    fn parts(text: &str) -> Arc<Vec<PartRecord>> {
        Arc::new(vec![PartRecord {
            id: PartId::from_raw("prt_1"),
            kind: PartKind::Text,
            text: Some(text.into()),
            state: None,
            time_end: None,
            synthetic: false,
        }])
    }

    #[test]
    fn memoizes_by_identity() {
        let mut cache = TextLengthCache::new();
        let a = parts("hello");
        assert_eq!(cache.length_of(&a), 5);
        assert_eq!(cache.length_of(&Arc::clone(&a)), 5);
        assert_eq!(cache.len(), 1);

        let b = parts("hello world");
        assert_eq!(cache.length_of(&b), 11);
        assert_eq!(cache.len(), 2);
    }

    #[test]
    fn dropped_collection_is_not_confused_with_new_one() {
        let mut cache = TextLengthCache::new();
        let a = parts("abc");
        cache.length_of(&a);
        drop(a);
        let b = parts("abcdef");
        assert_eq!(cache.length_of(&b), 6);
    }
}
