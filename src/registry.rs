use std::collections::HashMap;

use crate::types::TypeKey;

/// How a registered type is reconstructed from the pickle stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StrategyKind {
    /// Plain Python object: constructor args plus named fields from BUILD
    Generic,
    /// Compiled extension type: carries its positional/tuple state as-is
    Extension,
    /// joblib array placeholder: BUILD triggers the out-of-band NPY readout
    NdArray,
}

/// Registry entry for one serialized (module, name) pair.
/// `target` is the canonical type identity recorded on decoded records;
/// alias entries map several serialized pairs onto one target.
#[derive(Debug, Clone, PartialEq)]
pub struct Strategy {
    pub kind: StrategyKind,
    pub target: TypeKey,
}

impl Strategy {
    pub fn generic(module: &str, name: &str) -> Strategy {
        Strategy {
            kind: StrategyKind::Generic,
            target: TypeKey::new(module, name),
        }
    }

    pub fn extension(module: &str, name: &str) -> Strategy {
        Strategy {
            kind: StrategyKind::Extension,
            target: TypeKey::new(module, name),
        }
    }

    pub fn ndarray(module: &str, name: &str) -> Strategy {
        Strategy {
            kind: StrategyKind::NdArray,
            target: TypeKey::new(module, name),
        }
    }
}

/// Maps serialized (module, name) pairs to construction strategies.
///
/// The registry is plain owned data: populate it once, then share it
/// immutably between decode calls. GLOBAL/STACK_GLOBAL resolution fails
/// the decode for any pair that is not registered.
#[derive(Debug, Default)]
pub struct TypeRegistry {
    // module -> name -> strategy; two-level map so lookups stay
    // allocation-free on borrowed &str pairs
    entries: HashMap<String, HashMap<String, Strategy>>,
}

impl TypeRegistry {
    pub fn new() -> TypeRegistry {
        TypeRegistry::default()
    }

    /// Register a strategy for one serialized pair. Re-registering a pair
    /// replaces the previous entry.
    pub fn register(&mut self, module: &str, name: &str, strategy: Strategy) {
        self.entries
            .entry(module.to_string())
            .or_default()
            .insert(name.to_string(), strategy);
    }

    pub fn resolve(&self, module: &str, name: &str) -> Option<&Strategy> {
        self.entries.get(module)?.get(name)
    }

    pub fn contains(&self, module: &str, name: &str) -> bool {
        self.resolve(module, name).is_some()
    }

    /// Number of registered (module, name) pairs.
    pub fn len(&self) -> usize {
        self.entries.values().map(HashMap::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
