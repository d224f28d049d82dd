use std::cmp::Ordering;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

/// A query shape paired with its canonical form.
///
/// Equality, ordering and hashing use only the canonical form, so two
/// independently built values that canonicalize identically are the same
/// cache identity. Construct through the canonicalizers in `facet-canon`;
/// [`Canonical::from_parts`] trusts the caller that `form` really is
/// canonical for `value`.
pub struct Canonical<T> {
    value: Arc<T>,
    form: Arc<str>,
}

impl<T> Canonical<T> {
    /// Pair a normalized value with its canonical string form.
    pub fn from_parts(value: T, form: impl Into<Arc<str>>) -> Self {
        Self {
            value: Arc::new(value),
            form: form.into(),
        }
    }

    /// The normalized value.
    pub fn value(&self) -> &T {
        &self.value
    }

    /// The canonical string form.
    pub fn form(&self) -> &str {
        &self.form
    }

    /// Returns `true` if both handles share the same allocation.
    pub fn ptr_eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.value, &other.value)
    }
}

impl<T> Clone for Canonical<T> {
    fn clone(&self) -> Self {
        Self {
            value: Arc::clone(&self.value),
            form: Arc::clone(&self.form),
        }
    }
}

impl<T> PartialEq for Canonical<T> {
    fn eq(&self, other: &Self) -> bool {
        self.form == other.form
    }
}

impl<T> Eq for Canonical<T> {}

impl<T> Hash for Canonical<T> {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.form.hash(state);
    }
}

impl<T> PartialOrd for Canonical<T> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl<T> Ord for Canonical<T> {
    fn cmp(&self, other: &Self) -> Ordering {
        self.form.cmp(&other.form)
    }
}

impl<T> std::ops::Deref for Canonical<T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.value
    }
}

impl<T> fmt::Debug for Canonical<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Canonical({})", self.form)
    }
}

impl<T> fmt::Display for Canonical<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.form)
    }
}
