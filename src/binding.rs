//! Variable identity and value binding.
//!
//! A built artifact never stores values: every variable is bound to a [`Source`] that is
//! read each time the artifact is evaluated. Identity of variables is decided by a
//! [`NameComparison`], which has to be the same for binding, differentiation and lookup of
//! derivative results.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex};

use crate::node::{Quantity, Variable, VariableKind};
use crate::types::Source;

/// How variable names are compared.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum NameComparison {
    /// `v(OUT)` and `v(out)` are the same unknown
    #[default]
    CaseInsensitive,
    CaseSensitive,
}

/// Hashable, normalized identity of a variable under a [`NameComparison`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct VariableKey {
    name: String,
    kind: VariableKind,
    quantity: Quantity,
}

impl NameComparison {
    pub fn key(self, variable: &Variable) -> VariableKey {
        let name = match self {
            NameComparison::CaseInsensitive => variable.name.to_lowercase(),
            NameComparison::CaseSensitive => variable.name.clone(),
        };
        VariableKey {
            name,
            kind: variable.kind,
            quantity: variable.quantity,
        }
    }

    /// Returns true if both variables refer to the same quantity.
    pub fn same(self, a: &Variable, b: &Variable) -> bool {
        if a.kind != b.kind || a.quantity != b.quantity {
            return false;
        }
        match self {
            NameComparison::CaseInsensitive => a.name.to_lowercase() == b.name.to_lowercase(),
            NameComparison::CaseSensitive => a.name == b.name,
        }
    }
}

/// Maps variables to live value sources.
#[derive(Clone)]
pub struct Bindings<D> {
    comparison: NameComparison,
    sources: HashMap<VariableKey, Source<D>>,
}

impl<D> Default for Bindings<D> {
    fn default() -> Self {
        Self::new(NameComparison::default())
    }
}

impl<D> Bindings<D> {
    pub fn new(comparison: NameComparison) -> Self {
        Self {
            comparison,
            sources: HashMap::new(),
        }
    }

    pub fn comparison(&self) -> NameComparison {
        self.comparison
    }

    /// Binds `variable` to `source`, replacing any previous binding.
    pub fn bind(&mut self, variable: &Variable, source: Source<D>) -> &mut Self {
        self.sources.insert(self.comparison.key(variable), source);
        self
    }

    /// Builder-style variant of [`Bindings::bind`].
    pub fn with(mut self, variable: &Variable, source: Source<D>) -> Self {
        self.bind(variable, source);
        self
    }

    pub fn get(&self, variable: &Variable) -> Option<&Source<D>> {
        self.sources.get(&self.comparison.key(variable))
    }

    pub fn contains(&self, variable: &Variable) -> bool {
        self.get(variable).is_some()
    }

    pub fn len(&self) -> usize {
        self.sources.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sources.is_empty()
    }
}

impl<D: Copy + Send + Sync + 'static> Bindings<D> {
    /// Binds `variable` to a fixed value.
    pub fn bind_value(&mut self, variable: &Variable, value: D) -> &mut Self {
        self.bind(variable, Arc::new(move || value))
    }
}

impl<D> fmt::Debug for Bindings<D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut keys: Vec<_> = self.sources.keys().collect();
        keys.sort();
        f.debug_struct("Bindings")
            .field("comparison", &self.comparison)
            .field("variables", &keys)
            .finish()
    }
}

/// A settable value cell that hands out sources reading its current value.
///
/// Hosts update a probe between evaluations; every source created from it sees the change.
#[derive(Debug, Clone)]
pub struct Probe<D>(Arc<Mutex<D>>);

impl<D: Copy + Send + 'static> Probe<D> {
    pub fn new(value: D) -> Self {
        Self(Arc::new(Mutex::new(value)))
    }

    pub fn set(&self, value: D) {
        match self.0.lock() {
            Ok(mut guard) => *guard = value,
            Err(poisoned) => *poisoned.into_inner() = value,
        }
    }

    pub fn get(&self) -> D {
        match self.0.lock() {
            Ok(guard) => *guard,
            Err(poisoned) => *poisoned.into_inner(),
        }
    }

    pub fn source(&self) -> Source<D>
    where
        D: Sync,
    {
        let probe = self.clone();
        Arc::new(move || probe.get())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_case_insensitive_lookup() {
        let mut bindings = Bindings::new(NameComparison::CaseInsensitive);
        bindings.bind_value(&Variable::voltage("OUT"), 2.5);

        let source = bindings.get(&Variable::voltage("out")).unwrap();
        assert_eq!(source(), 2.5);
        assert!(!bindings.contains(&Variable::current("out")));
        assert!(!bindings.contains(&Variable::voltage("out").with_quantity(Quantity::Real)));
    }

    #[test]
    fn test_case_sensitive_lookup() {
        let mut bindings = Bindings::new(NameComparison::CaseSensitive);
        bindings.bind_value(&Variable::parameter("Gain"), 10.0);
        assert!(bindings.contains(&Variable::parameter("Gain")));
        assert!(!bindings.contains(&Variable::parameter("gain")));
    }

    #[test]
    fn test_probe_updates_are_visible() {
        let probe = Probe::new(1.0);
        let bindings = Bindings::default().with(&Variable::voltage("a"), probe.source());
        let source = bindings.get(&Variable::voltage("a")).unwrap();

        assert_eq!(source(), 1.0);
        probe.set(-4.0);
        assert_eq!(source(), -4.0);
    }

    #[test]
    fn test_same() {
        let cmp = NameComparison::CaseInsensitive;
        assert!(cmp.same(&Variable::voltage("A"), &Variable::voltage("a")));
        assert!(!cmp.same(&Variable::voltage("a"), &Variable::parameter("a")));
        assert!(!NameComparison::CaseSensitive.same(&Variable::voltage("A"), &Variable::voltage("a")));
    }
}
