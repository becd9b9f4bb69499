use std::{
    collections::HashMap,
    fmt,
    hash::{Hash, Hasher},
    ops::Deref,
    sync::{Arc, OnceLock},
};

use parking_lot::RwLock;

/// Whether interned strings live for the whole process or can be reclaimed
/// once nothing outside the table holds them.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum InternPolicy {
    #[default]
    Immortal,
    Reclaim,
}

#[derive(Debug, Clone, Default)]
pub struct InternedStringsCreateInfo {
    pub initial_capacity: usize,
    pub policy: InternPolicy,
}

struct InternedEntry {
    hash: u64,
    value: Arc<str>,
}

/// Handle to a process-unique string. Equality is pointer equality and
/// hashing uses the hash computed once at intern time.
#[derive(Clone)]
pub struct InternedString(Arc<InternedEntry>);

struct InternedStringsImpl {
    mappings: HashMap<Arc<str>, InternedString, ahash::RandomState>,
    policy: InternPolicy,
}

pub struct InternedStrings(RwLock<InternedStringsImpl>);

static INTERNED_STRINGS: OnceLock<InternedStrings> = OnceLock::new();

/// The process-wide table, created on first use.
pub fn interned_strings() -> &'static InternedStrings {
    INTERNED_STRINGS
        .get_or_init(|| InternedStrings::new(&InternedStringsCreateInfo::default()))
}

/// Interns `value` into the process-wide table.
pub fn intern(value: &str) -> InternedString {
    interned_strings().intern(value)
}

pub(crate) fn content_hash(value: &str) -> u64 {
    let mut hasher = ahash::AHasher::default();
    hasher.write(value.as_bytes());
    hasher.finish()
}

impl InternedString {
    pub fn as_str(&self) -> &str {
        &self.0.value
    }

    pub fn as_arc_str(&self) -> &Arc<str> {
        &self.0.value
    }

    pub fn precomputed_hash(&self) -> u64 {
        self.0.hash
    }
}

impl PartialEq for InternedString {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl Eq for InternedString {}

impl Hash for InternedString {
    fn hash<H: Hasher>(&self, state: &mut H) {
        state.write_u64(self.0.hash);
    }
}

impl Deref for InternedString {
    type Target = str;

    fn deref(&self) -> &str {
        self.as_str()
    }
}

impl fmt::Debug for InternedString {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "InternedString({:?})", self.as_str())
    }
}

impl fmt::Display for InternedString {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl InternedStringsImpl {
    fn new(info: &InternedStringsCreateInfo) -> Self {
        Self {
            mappings: HashMap::with_capacity_and_hasher(
                info.initial_capacity,
                ahash::RandomState::new(),
            ),
            policy: info.policy,
        }
    }

    fn get(&self, value: &str) -> Option<InternedString> {
        self.mappings.get(value).cloned()
    }

    fn get_or_add(&mut self, value: &str) -> InternedString {
        // another thread may have won the race between our read and write lock
        if let Some(existing) = self.mappings.get(value) {
            return existing.clone();
        }
        let value: Arc<str> = Arc::from(value);
        let interned = InternedString(Arc::new(InternedEntry {
            hash: content_hash(&value),
            value: value.clone(),
        }));
        self.mappings.insert(value, interned.clone());
        interned
    }

    fn purge(&mut self) -> usize {
        if self.policy != InternPolicy::Reclaim {
            return 0;
        }
        let before = self.mappings.len();
        self.mappings
            .retain(|_, interned| Arc::strong_count(&interned.0) > 1);
        before - self.mappings.len()
    }
}

impl InternedStrings {
    pub fn new(info: &InternedStringsCreateInfo) -> Self {
        Self(RwLock::new(InternedStringsImpl::new(info)))
    }

    /// Returns the unique handle for `value`, creating it on first use.
    /// Exactly one handle is ever created per distinct content, even when
    /// several threads intern the same string concurrently.
    pub fn intern(&self, value: &str) -> InternedString {
        if let Some(existing) = self.0.read().get(value) {
            return existing;
        }
        self.0.write().get_or_add(value)
    }

    /// Looks up `value` without interning it.
    pub fn get(&self, value: &str) -> Option<InternedString> {
        self.0.read().get(value)
    }

    pub fn len(&self) -> usize {
        self.0.read().mappings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drops the strings no longer referenced outside the table. Does
    /// nothing under [`InternPolicy::Immortal`].
    pub fn purge(&self) -> usize {
        let removed = self.0.write().purge();
        if removed > 0 {
            log::debug!("purged {removed} interned strings");
        }
        removed
    }
}

impl Default for InternedStrings {
    fn default() -> Self {
        Self::new(&InternedStringsCreateInfo::default())
    }
}
