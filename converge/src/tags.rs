//! Tag reconciliation: converge a remote key/value tag set to a declared one.

use std::collections::BTreeMap;
use std::collections::btree_map;
use std::fmt;
use std::future::Future;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::classify::ErrorClassifier;
use crate::error::Error;
use crate::observe::{Event, Observer, default_observer};
use crate::retry::Retrier;

/// Key prefixes owned by the provider. Tags under them are never touched.
pub const RESERVED_TAG_PREFIXES: &[&str] = &["aliyun", "acs:", "http://", "https://"];

/// Snapshot of a resource's tags, ordered by key.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TagSet(BTreeMap<String, String>);

impl TagSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) -> Option<String> {
        self.0.insert(key.into(), value.into())
    }

    pub fn remove(&mut self, key: &str) -> Option<String> {
        self.0.remove(key)
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.0.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.0.keys().map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Copy of this set without provider-reserved keys.
    pub fn without_reserved(&self, reserved: &ReservedPrefixes) -> Self {
        self.iter().filter(|(k, _)| !reserved.is_reserved(k)).collect()
    }

    /// The set that results from applying `diff`: removals first, then creations.
    pub fn apply(&self, diff: &TagDiff) -> Self {
        let mut next = self.clone();
        for key in diff.to_remove.keys() {
            next.remove(key);
        }
        for (key, value) in diff.to_create.iter() {
            next.insert(key, value);
        }
        next
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for TagSet {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self(iter.into_iter().map(|(k, v)| (k.into(), v.into())).collect())
    }
}

impl IntoIterator for TagSet {
    type Item = (String, String);
    type IntoIter = btree_map::IntoIter<String, String>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.into_iter()
    }
}

impl fmt::Display for TagSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("{")?;
        for (i, (k, v)) in self.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{k}={v}")?;
        }
        f.write_str("}")
    }
}

/// Case-insensitive deny-list of tag key prefixes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReservedPrefixes(Vec<String>);

impl ReservedPrefixes {
    pub fn new<I, P>(prefixes: I) -> Self
    where
        I: IntoIterator<Item = P>,
        P: AsRef<str>,
    {
        Self(prefixes.into_iter().map(|p| p.as_ref().to_lowercase()).collect())
    }

    pub fn none() -> Self {
        Self(Vec::new())
    }

    pub fn is_reserved(&self, key: &str) -> bool {
        let key = key.to_lowercase();
        self.0.iter().any(|prefix| key.starts_with(prefix.as_str()))
    }
}

impl Default for ReservedPrefixes {
    fn default() -> Self {
        Self::new(RESERVED_TAG_PREFIXES)
    }
}

/// Minimal set of tag operations turning one tag set into another.
///
/// A key appears in both halves only when its value changes: the old pair is
/// removed and the new one created.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TagDiff {
    pub to_create: TagSet,
    /// Pairs to remove, with their current remote values.
    pub to_remove: TagSet,
}

impl TagDiff {
    /// Diff of `remote` against `declared`, with no keys filtered.
    pub fn between(remote: &TagSet, declared: &TagSet) -> Self {
        let to_create = declared
            .iter()
            .filter(|(k, v)| remote.get(k) != Some(*v))
            .collect();
        let to_remove = remote
            .iter()
            .filter(|(k, v)| declared.get(k) != Some(*v))
            .collect();
        Self { to_create, to_remove }
    }

    pub fn is_empty(&self) -> bool {
        self.to_create.is_empty() && self.to_remove.is_empty()
    }

    pub fn removed_keys(&self) -> Vec<String> {
        self.to_remove.keys().map(str::to_string).collect()
    }

    pub fn created_keys(&self) -> Vec<String> {
        self.to_create.keys().map(str::to_string).collect()
    }

    /// The diff that undoes this one.
    pub fn inverse(&self) -> Self {
        Self {
            to_create: self.to_remove.clone(),
            to_remove: self.to_create.clone(),
        }
    }
}

/// Diff `remote` against `declared`, ignoring reserved keys on both sides.
pub fn diff(remote: &TagSet, declared: &TagSet, reserved: &ReservedPrefixes) -> TagDiff {
    TagDiff::between(
        &remote.without_reserved(reserved),
        &declared.without_reserved(reserved),
    )
}

/// Applies tag diffs through the retry executor.
#[derive(Clone)]
pub struct TagReconciler {
    untag: Retrier,
    tag: Retrier,
    reserved: ReservedPrefixes,
    observer: Arc<dyn Observer>,
}

impl fmt::Debug for TagReconciler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TagReconciler")
            .field("untag", &self.untag)
            .field("tag", &self.tag)
            .field("reserved", &self.reserved)
            .finish()
    }
}

impl TagReconciler {
    /// Both tag calls reuse `retrier`'s budget, backoff and cancellation.
    pub fn new(retrier: &Retrier) -> Self {
        Self {
            untag: retrier.for_operation("UnTagResources"),
            tag: retrier.for_operation("TagResources"),
            reserved: ReservedPrefixes::default(),
            observer: default_observer(),
        }
    }

    pub fn with_reserved(mut self, reserved: ReservedPrefixes) -> Self {
        self.reserved = reserved;
        self
    }

    pub fn with_observer(mut self, observer: Arc<dyn Observer>) -> Self {
        self.untag = self.untag.with_observer(Arc::clone(&observer));
        self.tag = self.tag.with_observer(Arc::clone(&observer));
        self.observer = observer;
        self
    }

    pub fn reserved(&self) -> &ReservedPrefixes {
        &self.reserved
    }

    /// Bring the remote tags in line with `declared`.
    ///
    /// Removal always completes before creation starts, so a key whose value
    /// changes is deleted and then re-created. Returns the diff that was
    /// applied; an empty diff makes no remote call.
    pub async fn reconcile<E, C, RF, RFut, CF, CFut>(
        &self,
        remote: &TagSet,
        declared: &TagSet,
        classifier: &C,
        mut apply_remove: RF,
        mut apply_create: CF,
    ) -> Result<TagDiff, Error<E>>
    where
        C: ErrorClassifier<E> + ?Sized,
        E: fmt::Display,
        RF: FnMut(Vec<String>) -> RFut,
        RFut: Future<Output = Result<(), E>>,
        CF: FnMut(TagSet) -> CFut,
        CFut: Future<Output = Result<(), E>>,
    {
        let diff = diff(remote, declared, &self.reserved);
        if diff.is_empty() {
            debug!("Tags already converged");
            return Ok(diff);
        }

        if !diff.to_remove.is_empty() {
            let keys = diff.removed_keys();
            self.untag
                .execute(classifier, || apply_remove(keys.clone()))
                .await?;
            self.observer.observe(&Event::TagsRemoved { keys });
        }

        if !diff.to_create.is_empty() {
            self.tag
                .execute(classifier, || apply_create(diff.to_create.clone()))
                .await?;
            self.observer.observe(&Event::TagsCreated {
                keys: diff.created_keys(),
            });
        }

        Ok(diff)
    }
}
