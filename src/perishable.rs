//! Values paired with the lifetime during which they are relevant.

use crate::Lifetime;

/// A value paired with the lifetime during which it is relevant.
///
/// Equality compares the value by `==` and the lifetime by identity.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Perishable<T> {
    value: T,
    lifetime: Lifetime,
}

impl<T> Perishable<T> {
    /// Pair a value with a lifetime.
    pub fn new(value: T, lifetime: Lifetime) -> Self {
        Self { value, lifetime }
    }

    /// A perishable that never perishes.
    pub fn immortal(value: T) -> Self {
        Self::new(value, Lifetime::immortal())
    }

    /// The carried value.
    pub fn value(&self) -> &T {
        &self.value
    }

    /// The lifetime of the carried value.
    pub fn lifetime(&self) -> &Lifetime {
        &self.lifetime
    }

    /// Splits into the value and its lifetime.
    pub fn into_parts(self) -> (T, Lifetime) {
        (self.value, self.lifetime)
    }

    /// Replaces the value while keeping the very same lifetime.
    pub fn map<U>(self, projection: impl FnOnce(T) -> U) -> Perishable<U> {
        Perishable {
            value: projection(self.value),
            lifetime: self.lifetime,
        }
    }
}
