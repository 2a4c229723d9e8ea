use std::fmt;

use num_bigint::BigInt;

use crate::npy::NdArray;
use crate::registry::StrategyKind;

/// Serialized type identity: the (module, name) pair a pickle stream
/// names in GLOBAL/STACK_GLOBAL.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TypeKey {
    pub module: String,
    pub name: String,
}

impl TypeKey {
    pub fn new(module: &str, name: &str) -> TypeKey {
        TypeKey {
            module: module.to_string(),
            name: name.to_string(),
        }
    }
}

impl fmt::Display for TypeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.module, self.name)
    }
}

/// A resolved class reference, as pushed by GLOBAL/STACK_GLOBAL.
/// Carries the canonical key (aliases already applied) and the strategy
/// the registry assigned to it.
#[derive(Debug, Clone, PartialEq)]
pub struct ClassRef {
    pub key: TypeKey,
    pub kind: StrategyKind,
}

/// Handle into an [`ObjectGraph`] arena. Two equal handles denote the
/// same object; mutation through one is visible through every copy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ObjectId(pub(crate) u32);

impl ObjectId {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

/// A decoded pickle value. Scalars are stored inline; every composite
/// lives in the arena and is addressed through [`Value::Ref`], which is
/// what gives memo fetches true shared-reference semantics.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    None,
    Bool(bool),
    Int(i64),
    BigInt(BigInt),
    Float(f64),
    String(String),
    /// Python 2 byte strings and protocol 3+ bytes objects
    Bytes(Vec<u8>),
    Class(ClassRef),
    Ref(ObjectId),
}

/// Arena node payloads.
#[derive(Debug, Clone, PartialEq)]
pub enum Node {
    List(Vec<Value>),
    Tuple(Vec<Value>),
    /// Insertion-ordered key/value pairs
    Dict(Vec<(Value, Value)>),
    Set(Vec<Value>),
    FrozenSet(Vec<Value>),
    Object(ObjectNode),
    /// Materialized numpy array (replaces a joblib placeholder record)
    Array(NdArray),
}

/// An opaque typed record: the decoded form of REDUCE/NEWOBJ plus any
/// state BUILD merged in. Model translation reads these; this crate
/// never interprets their contents.
#[derive(Debug, Clone, PartialEq)]
pub struct ObjectNode {
    pub key: TypeKey,
    pub kind: StrategyKind,
    /// Positional constructor arguments
    pub args: Vec<Value>,
    /// Named attributes from dict-shaped BUILD state and NEWOBJ_EX kwargs
    pub fields: Vec<(String, Value)>,
    /// Non-mapping BUILD state (e.g. the tuple state of numpy.dtype)
    pub state: Option<Value>,
}

impl ObjectNode {
    pub fn new(key: TypeKey, kind: StrategyKind, args: Vec<Value>) -> ObjectNode {
        ObjectNode {
            key,
            kind,
            args,
            fields: Vec::new(),
            state: None,
        }
    }

    pub fn field(&self, name: &str) -> Option<&Value> {
        self.fields
            .iter()
            .find(|(field, _)| field == name)
            .map(|(_, value)| value)
    }

    /// Set a named field, replacing an existing binding in place so the
    /// insertion order of first appearance is kept.
    pub fn set_field(&mut self, name: String, value: Value) {
        match self.fields.iter_mut().find(|(field, _)| *field == name) {
            Some((_, slot)) => *slot = value,
            None => self.fields.push((name, value)),
        }
    }
}

/// Append-only arena holding every composite of one decoded stream.
/// Handles stay valid for the life of the graph; [`ObjectGraph::replace`]
/// swaps a node's payload without disturbing them.
#[derive(Debug, Default)]
pub struct ObjectGraph {
    nodes: Vec<Node>,
}

impl ObjectGraph {
    pub fn new() -> ObjectGraph {
        ObjectGraph::default()
    }

    /// Add a node and return its handle. Graphs are bounded to u32
    /// handles; the decoder enforces the limit before calling this.
    pub fn alloc(&mut self, node: Node) -> ObjectId {
        let id = ObjectId(self.nodes.len() as u32);
        self.nodes.push(node);
        id
    }

    pub fn node(&self, id: ObjectId) -> &Node {
        &self.nodes[id.index()]
    }

    pub fn node_mut(&mut self, id: ObjectId) -> &mut Node {
        &mut self.nodes[id.index()]
    }

    /// Swap the payload behind a handle, returning the old node. Every
    /// outstanding reference to the handle sees the new payload.
    pub fn replace(&mut self, id: ObjectId, node: Node) -> Node {
        std::mem::replace(&mut self.nodes[id.index()], node)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}

/// Result of decoding one pickle stream: the root value plus the arena
/// its composites live in.
#[derive(Debug)]
pub struct Unpickled {
    pub graph: ObjectGraph,
    pub root: Value,
}

impl Unpickled {
    /// Dereference a value if it is a handle into this graph.
    pub fn node_of(&self, value: &Value) -> Option<&Node> {
        match value {
            Value::Ref(id) => Some(self.graph.node(*id)),
            _ => None,
        }
    }

    /// The root, dereferenced when it is a composite.
    pub fn root_node(&self) -> Option<&Node> {
        self.node_of(&self.root)
    }
}
