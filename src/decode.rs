use num_bigint::BigInt;
use tracing::debug;

use crate::error::UnpickleError;
use crate::npy;
use crate::opcodes::*;
use crate::registry::{StrategyKind, TypeRegistry};
use crate::types::{ClassRef, Node, ObjectGraph, ObjectId, ObjectNode, Unpickled, Value};

const MAX_MEMO_SIZE: usize = 100_000;
const MAX_BINARY_SIZE: u64 = 256 * 1024 * 1024; // 256 MB
const MAX_GRAPH_NODES: usize = u32::MAX as usize;

/// Decode one pickle stream into an object graph.
///
/// This implements the pickle virtual machine subset that CPython's
/// pickler and joblib emit for model files (protocol 0-5 minus
/// persistent ids and out-of-band buffers). No Python objects are
/// constructed; composites become arena nodes and registered types
/// become opaque typed records.
pub fn decode_pickle(
    data: &[u8],
    registry: &TypeRegistry,
) -> Result<Unpickled, UnpickleError> {
    let mut decoder = Decoder::new(data, registry);
    let root = decoder.run()?;
    Ok(Unpickled {
        graph: decoder.graph,
        root,
    })
}

struct Decoder<'a> {
    data: &'a [u8],
    pos: usize,
    registry: &'a TypeRegistry,
    stack: Vec<Value>,
    /// Stack depths saved by MARK, popped by the batch opcodes
    marks: Vec<usize>,
    memo: Vec<Option<Value>>,
    graph: ObjectGraph,
}

impl<'a> Decoder<'a> {
    fn new(data: &'a [u8], registry: &'a TypeRegistry) -> Self {
        Self {
            data,
            pos: 0,
            registry,
            stack: Vec::with_capacity(16),
            marks: Vec::with_capacity(4),
            memo: Vec::with_capacity(16),
            graph: ObjectGraph::new(),
        }
    }

    fn run(&mut self) -> Result<Value, UnpickleError> {
        loop {
            let op = self.read_u8()?;
            match op {
                STOP => {
                    let root = self.pop_value()?;
                    if !self.marks.is_empty() {
                        return Err(UnpickleError::StackViolation(
                            "unclosed mark at STOP".to_string(),
                        ));
                    }
                    if !self.stack.is_empty() {
                        return Err(UnpickleError::StackViolation(format!(
                            "{} extra values on stack at STOP",
                            self.stack.len()
                        )));
                    }
                    debug!(nodes = self.graph.len(), "Decoded pickle stream");
                    return Ok(root);
                }
                PROTO => {
                    let version = self.read_u8()?;
                    if version > 5 {
                        return Err(UnpickleError::MalformedLiteral(format!(
                            "unsupported pickle protocol {version}"
                        )));
                    }
                }
                FRAME => {
                    // Protocol 4 framing is advisory for an in-memory slice
                    self.read_bytes(8)?;
                }

                // -- None, Bool --
                NONE => self.push(Value::None),
                NEWTRUE => self.push(Value::Bool(true)),
                NEWFALSE => self.push(Value::Bool(false)),

                // -- Integers --
                BININT => {
                    let val = self.read_i32()?;
                    self.push(Value::Int(val as i64));
                }
                BININT1 => {
                    let val = self.read_u8()?;
                    self.push(Value::Int(val as i64));
                }
                BININT2 => {
                    let val = self.read_u16()?;
                    self.push(Value::Int(val as i64));
                }
                INT => {
                    let line = self.read_line()?;
                    let s = utf8(line, "INT")?.trim();
                    // INT can encode booleans too: "00" = False, "01" = True
                    if s == "00" {
                        self.push(Value::Bool(false));
                    } else if s == "01" {
                        self.push(Value::Bool(true));
                    } else {
                        let val: i64 = s.parse().map_err(|e| {
                            UnpickleError::MalformedLiteral(format!("INT parse: {e}"))
                        })?;
                        self.push(Value::Int(val));
                    }
                }
                LONG => {
                    let line = self.read_line()?;
                    let s = utf8(line, "LONG")?.trim().trim_end_matches('L');
                    if s.len() > 10_000 {
                        return Err(UnpickleError::MalformedLiteral(
                            "LONG value too large".to_string(),
                        ));
                    }
                    let val: BigInt = s.parse().map_err(|e| {
                        UnpickleError::MalformedLiteral(format!("LONG parse: {e}"))
                    })?;
                    self.push(int_value(val));
                }
                LONG1 => {
                    let n = self.read_u8()? as usize;
                    let bytes = self.read_bytes(n)?;
                    self.push(int_value(BigInt::from_signed_bytes_le(bytes)));
                }
                LONG4 => {
                    let n = self.read_i32()?;
                    if n < 0 {
                        return Err(UnpickleError::MalformedLiteral(
                            "negative length in LONG4".to_string(),
                        ));
                    }
                    let bytes = self.read_bytes(n as usize)?;
                    self.push(int_value(BigInt::from_signed_bytes_le(bytes)));
                }

                // -- Float --
                BINFLOAT => {
                    let bytes = self.read_bytes(8)?;
                    let val = f64::from_be_bytes(bytes.try_into().unwrap());
                    self.push(Value::Float(val));
                }
                FLOAT => {
                    let line = self.read_line()?;
                    let val: f64 = utf8(line, "FLOAT")?.trim().parse().map_err(|e| {
                        UnpickleError::MalformedLiteral(format!("FLOAT parse: {e}"))
                    })?;
                    self.push(Value::Float(val));
                }

                // -- Strings (Python 2 str / bytes) --
                BINSTRING => {
                    let n = self.read_i32()?;
                    if n < 0 {
                        return Err(UnpickleError::MalformedLiteral(
                            "negative length in BINSTRING".to_string(),
                        ));
                    }
                    let bytes = self.read_bytes(n as usize)?.to_vec();
                    self.push(Value::Bytes(bytes));
                }
                SHORT_BINSTRING => {
                    let n = self.read_u8()? as usize;
                    let bytes = self.read_bytes(n)?.to_vec();
                    self.push(Value::Bytes(bytes));
                }
                STRING => {
                    let line = self.read_line()?;
                    let s = utf8(line, "STRING")?.trim();
                    // STRING values are repr'd: the line must carry a matching
                    // pair of outermost quotes
                    let quoted = s.len() >= 2
                        && ((s.starts_with('\'') && s.ends_with('\''))
                            || (s.starts_with('"') && s.ends_with('"')));
                    if !quoted {
                        return Err(UnpickleError::MalformedLiteral(
                            "STRING line is not quoted".to_string(),
                        ));
                    }
                    self.push(Value::Bytes(s[1..s.len() - 1].as_bytes().to_vec()));
                }

                // -- Unicode strings --
                BINUNICODE => {
                    let n = self.read_u32()? as usize;
                    let bytes = self.read_bytes(n)?;
                    self.push(Value::String(utf8(bytes, "BINUNICODE")?.to_string()));
                }
                SHORT_BINUNICODE => {
                    let n = self.read_u8()? as usize;
                    let bytes = self.read_bytes(n)?;
                    self.push(Value::String(utf8(bytes, "SHORT_BINUNICODE")?.to_string()));
                }
                UNICODE => {
                    let line = self.read_line()?;
                    self.push(Value::String(utf8(line, "UNICODE")?.to_string()));
                }
                BINUNICODE8 => {
                    let n = self.read_u64()?;
                    if n > MAX_BINARY_SIZE {
                        return Err(UnpickleError::MalformedLiteral(
                            "BINUNICODE8 data too large".to_string(),
                        ));
                    }
                    let bytes = self.read_bytes(n as usize)?;
                    self.push(Value::String(utf8(bytes, "BINUNICODE8")?.to_string()));
                }

                // -- Bytes --
                BINBYTES => {
                    let n = self.read_u32()? as usize;
                    let bytes = self.read_bytes(n)?.to_vec();
                    self.push(Value::Bytes(bytes));
                }
                SHORT_BINBYTES => {
                    let n = self.read_u8()? as usize;
                    let bytes = self.read_bytes(n)?.to_vec();
                    self.push(Value::Bytes(bytes));
                }
                BINBYTES8 => {
                    let n = self.read_u64()?;
                    if n > MAX_BINARY_SIZE {
                        return Err(UnpickleError::MalformedLiteral(
                            "BINBYTES8 data too large".to_string(),
                        ));
                    }
                    let bytes = self.read_bytes(n as usize)?.to_vec();
                    self.push(Value::Bytes(bytes));
                }

                // -- Mark --
                MARK => {
                    self.marks.push(self.stack.len());
                }

                // -- Tuple --
                EMPTY_TUPLE => {
                    let val = self.alloc(Node::Tuple(Vec::new()))?;
                    self.push(val);
                }
                TUPLE => {
                    let items = self.pop_mark()?;
                    let val = self.alloc(Node::Tuple(items))?;
                    self.push(val);
                }
                TUPLE1 => {
                    let a = self.pop_value()?;
                    let val = self.alloc(Node::Tuple(vec![a]))?;
                    self.push(val);
                }
                TUPLE2 => {
                    let b = self.pop_value()?;
                    let a = self.pop_value()?;
                    let val = self.alloc(Node::Tuple(vec![a, b]))?;
                    self.push(val);
                }
                TUPLE3 => {
                    let c = self.pop_value()?;
                    let b = self.pop_value()?;
                    let a = self.pop_value()?;
                    let val = self.alloc(Node::Tuple(vec![a, b, c]))?;
                    self.push(val);
                }

                // -- List --
                EMPTY_LIST => {
                    let val = self.alloc(Node::List(Vec::new()))?;
                    self.push(val);
                }
                LIST => {
                    let items = self.pop_mark()?;
                    let val = self.alloc(Node::List(items))?;
                    self.push(val);
                }
                APPEND => {
                    let val = self.pop_value()?;
                    let top = self.peek_value()?.clone();
                    self.list_mut(&top, "APPEND")?.push(val);
                }
                APPENDS => {
                    let items = self.pop_mark()?;
                    let top = self.peek_value()?.clone();
                    self.list_mut(&top, "APPENDS")?.extend(items);
                }

                // -- Dict --
                EMPTY_DICT => {
                    let val = self.alloc(Node::Dict(Vec::new()))?;
                    self.push(val);
                }
                DICT => {
                    let items = self.pop_mark()?;
                    let pairs = items_to_pairs(items)?;
                    let val = self.alloc(Node::Dict(pairs))?;
                    self.push(val);
                }
                SETITEM => {
                    let val = self.pop_value()?;
                    let key = self.pop_value()?;
                    let top = self.peek_value()?.clone();
                    self.dict_mut(&top, "SETITEM")?.push((key, val));
                }
                SETITEMS => {
                    let items = self.pop_mark()?;
                    let pairs = items_to_pairs(items)?;
                    let top = self.peek_value()?.clone();
                    self.dict_mut(&top, "SETITEMS")?.extend(pairs);
                }

                // -- Set/FrozenSet (protocol 4) --
                EMPTY_SET => {
                    let val = self.alloc(Node::Set(Vec::new()))?;
                    self.push(val);
                }
                ADDITEMS => {
                    let items = self.pop_mark()?;
                    let top = self.peek_value()?.clone();
                    self.set_mut(&top, "ADDITEMS")?.extend(items);
                }
                FROZENSET => {
                    let items = self.pop_mark()?;
                    let val = self.alloc(Node::FrozenSet(items))?;
                    self.push(val);
                }

                // -- Class references --
                GLOBAL => {
                    let module = utf8(self.read_line()?, "GLOBAL")?.to_string();
                    let name = utf8(self.read_line()?, "GLOBAL")?.to_string();
                    self.resolve_global(module, name)?;
                }
                STACK_GLOBAL => {
                    let name = self.pop_value()?;
                    let module = self.pop_value()?;
                    match (module, name) {
                        (Value::String(module), Value::String(name)) => {
                            self.resolve_global(module, name)?;
                        }
                        _ => {
                            return Err(UnpickleError::StackViolation(
                                "STACK_GLOBAL operands are not strings".to_string(),
                            ))
                        }
                    }
                }

                // -- Object construction --
                REDUCE => {
                    let args = self.pop_value()?;
                    let callee = self.pop_value()?;
                    let class = expect_class(callee, "REDUCE")?;
                    let items = self.tuple_items(&args, "REDUCE")?;
                    let val = self.construct(class, items)?;
                    self.push(val);
                }
                NEWOBJ => {
                    let args = self.pop_value()?;
                    let callee = self.pop_value()?;
                    let class = expect_class(callee, "NEWOBJ")?;
                    let items = self.tuple_items(&args, "NEWOBJ")?;
                    let val = self.construct(class, items)?;
                    self.push(val);
                }
                NEWOBJ_EX => {
                    let kwargs = self.pop_value()?;
                    let args = self.pop_value()?;
                    let callee = self.pop_value()?;
                    let class = expect_class(callee, "NEWOBJ_EX")?;
                    let items = self.tuple_items(&args, "NEWOBJ_EX")?;
                    let pairs = self.dict_pairs(&kwargs).ok_or_else(|| {
                        UnpickleError::StackViolation(
                            "NEWOBJ_EX kwargs are not a dict".to_string(),
                        )
                    })?;
                    let val = self.construct(class, items)?;
                    if let Value::Ref(id) = val {
                        self.merge_fields(id, pairs, "NEWOBJ_EX")?;
                    }
                    self.push(val);
                }
                BUILD => {
                    let state = self.pop_value()?;
                    let target = self.pop_value()?;
                    let id = match &target {
                        Value::Ref(id) if matches!(self.graph.node(*id), Node::Object(_)) => {
                            *id
                        }
                        _ => {
                            return Err(UnpickleError::StackViolation(
                                "BUILD on a non-object".to_string(),
                            ))
                        }
                    };
                    self.apply_state(id, state)?;
                    // joblib array placeholders are followed by their raw
                    // NPY block; read it out and swap the arena node so
                    // every handle sees the materialized array
                    let is_placeholder = matches!(
                        self.graph.node(id),
                        Node::Object(obj) if obj.kind == StrategyKind::NdArray
                    );
                    if is_placeholder {
                        let array = npy::read_array(self.data, &mut self.pos)?;
                        debug!(
                            dtype = %array.dtype.descr,
                            shape = ?array.shape,
                            "Materialized numpy array"
                        );
                        self.graph.replace(id, Node::Array(array));
                    }
                    self.push(target);
                }

                // -- Memo --
                BINPUT => {
                    let idx = self.read_u8()? as usize;
                    let val = self.peek_value()?.clone();
                    self.memo_put(idx, val)?;
                }
                LONG_BINPUT => {
                    let idx = self.read_u32()? as usize;
                    let val = self.peek_value()?.clone();
                    self.memo_put(idx, val)?;
                }
                MEMOIZE => {
                    let val = self.peek_value()?.clone();
                    let idx = self.memo.len();
                    self.memo_put(idx, val)?;
                }
                BINGET => {
                    let idx = self.read_u8()? as usize;
                    let val = self.memo_get(idx)?;
                    self.push(val);
                }
                LONG_BINGET => {
                    let idx = self.read_u32()? as usize;
                    let val = self.memo_get(idx)?;
                    self.push(val);
                }
                PUT => {
                    let line = self.read_line()?;
                    let idx: usize = utf8(line, "PUT")?.trim().parse().map_err(|e| {
                        UnpickleError::MalformedLiteral(format!("PUT index: {e}"))
                    })?;
                    let val = self.peek_value()?.clone();
                    self.memo_put(idx, val)?;
                }
                GET => {
                    let line = self.read_line()?;
                    let idx: usize = utf8(line, "GET")?.trim().parse().map_err(|e| {
                        UnpickleError::MalformedLiteral(format!("GET index: {e}"))
                    })?;
                    let val = self.memo_get(idx)?;
                    self.push(val);
                }

                // -- Stack manipulation --
                POP => {
                    self.pop_value()?;
                }
                POP_MARK => {
                    self.pop_mark()?;
                }
                DUP => {
                    let val = self.peek_value()?.clone();
                    self.push(val);
                }

                // Persistent-id references, old-style instances, the
                // protocol 2 extension registry and pickle-5 out-of-band
                // buffers: never produced by joblib model dumps
                PERSID | BINPERSID | INST | OBJ | EXT1 | EXT2 | EXT4 | BYTEARRAY8
                | NEXT_BUFFER | READONLY_BUFFER => {
                    return Err(UnpickleError::UnsupportedOpcode(op));
                }
                _ => {
                    return Err(UnpickleError::UnsupportedOpcode(op));
                }
            }
        }
    }

    // -- Reading primitives --

    fn read_u8(&mut self) -> Result<u8, UnpickleError> {
        if self.pos >= self.data.len() {
            return Err(UnpickleError::UnexpectedEof);
        }
        let val = self.data[self.pos];
        self.pos += 1;
        Ok(val)
    }

    fn read_bytes(&mut self, n: usize) -> Result<&'a [u8], UnpickleError> {
        let end = self
            .pos
            .checked_add(n)
            .filter(|&end| end <= self.data.len())
            .ok_or(UnpickleError::UnexpectedEof)?;
        let slice = &self.data[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    fn read_u16(&mut self) -> Result<u16, UnpickleError> {
        let bytes = self.read_bytes(2)?;
        Ok(u16::from_le_bytes(bytes.try_into().unwrap()))
    }

    fn read_i32(&mut self) -> Result<i32, UnpickleError> {
        let bytes = self.read_bytes(4)?;
        Ok(i32::from_le_bytes(bytes.try_into().unwrap()))
    }

    fn read_u32(&mut self) -> Result<u32, UnpickleError> {
        let bytes = self.read_bytes(4)?;
        Ok(u32::from_le_bytes(bytes.try_into().unwrap()))
    }

    fn read_u64(&mut self) -> Result<u64, UnpickleError> {
        let bytes = self.read_bytes(8)?;
        Ok(u64::from_le_bytes(bytes.try_into().unwrap()))
    }

    fn read_line(&mut self) -> Result<&'a [u8], UnpickleError> {
        let start = self.pos;
        while self.pos < self.data.len() {
            if self.data[self.pos] == b'\n' {
                let line = &self.data[start..self.pos];
                self.pos += 1; // skip newline
                return Ok(line);
            }
            self.pos += 1;
        }
        Err(UnpickleError::UnexpectedEof)
    }

    // -- Stack operations --

    #[inline]
    fn push(&mut self, val: Value) {
        self.stack.push(val);
    }

    #[inline]
    fn pop_value(&mut self) -> Result<Value, UnpickleError> {
        self.stack
            .pop()
            .ok_or_else(|| UnpickleError::StackViolation("stack underflow".to_string()))
    }

    #[inline]
    fn peek_value(&self) -> Result<&Value, UnpickleError> {
        self.stack
            .last()
            .ok_or_else(|| UnpickleError::StackViolation("stack underflow".to_string()))
    }

    /// Pop all items above the most recent MARK.
    fn pop_mark(&mut self) -> Result<Vec<Value>, UnpickleError> {
        let depth = self.marks.pop().ok_or_else(|| {
            UnpickleError::StackViolation("no open mark".to_string())
        })?;
        if depth > self.stack.len() {
            return Err(UnpickleError::StackViolation(
                "mark points below the stack".to_string(),
            ));
        }
        Ok(self.stack.split_off(depth))
    }

    // -- Graph operations --

    fn alloc(&mut self, node: Node) -> Result<Value, UnpickleError> {
        if self.graph.len() >= MAX_GRAPH_NODES {
            return Err(UnpickleError::MalformedLiteral(
                "object graph too large".to_string(),
            ));
        }
        Ok(Value::Ref(self.graph.alloc(node)))
    }

    fn list_mut(
        &mut self,
        value: &Value,
        op: &str,
    ) -> Result<&mut Vec<Value>, UnpickleError> {
        let id = ref_id(value, op, "list")?;
        match self.graph.node_mut(id) {
            Node::List(items) => Ok(items),
            _ => Err(UnpickleError::StackViolation(format!("{op} on a non-list"))),
        }
    }

    fn dict_mut(
        &mut self,
        value: &Value,
        op: &str,
    ) -> Result<&mut Vec<(Value, Value)>, UnpickleError> {
        let id = ref_id(value, op, "dict")?;
        match self.graph.node_mut(id) {
            Node::Dict(pairs) => Ok(pairs),
            _ => Err(UnpickleError::StackViolation(format!("{op} on a non-dict"))),
        }
    }

    fn set_mut(
        &mut self,
        value: &Value,
        op: &str,
    ) -> Result<&mut Vec<Value>, UnpickleError> {
        let id = ref_id(value, op, "set")?;
        match self.graph.node_mut(id) {
            Node::Set(items) => Ok(items),
            _ => Err(UnpickleError::StackViolation(format!("{op} on a non-set"))),
        }
    }

    fn tuple_items(&self, value: &Value, op: &str) -> Result<Vec<Value>, UnpickleError> {
        if let Value::Ref(id) = value {
            if let Node::Tuple(items) = self.graph.node(*id) {
                return Ok(items.clone());
            }
        }
        Err(UnpickleError::StackViolation(format!(
            "{op} arguments are not a tuple"
        )))
    }

    fn dict_pairs(&self, value: &Value) -> Option<Vec<(Value, Value)>> {
        if let Value::Ref(id) = value {
            if let Node::Dict(pairs) = self.graph.node(*id) {
                return Some(pairs.clone());
            }
        }
        None
    }

    // -- Type resolution and record construction --

    fn resolve_global(
        &mut self,
        module: String,
        name: String,
    ) -> Result<(), UnpickleError> {
        match self.registry.resolve(&module, &name) {
            Some(strategy) => {
                self.push(Value::Class(ClassRef {
                    key: strategy.target.clone(),
                    kind: strategy.kind,
                }));
                Ok(())
            }
            None => Err(UnpickleError::UnknownType { module, name }),
        }
    }

    fn construct(
        &mut self,
        class: ClassRef,
        args: Vec<Value>,
    ) -> Result<Value, UnpickleError> {
        // set(iterable) / frozenset(iterable): how protocols < 4 pickle sets
        if class.key.module == "builtins"
            && matches!(class.key.name.as_str(), "set" | "frozenset")
        {
            if let [Value::Ref(id)] = args.as_slice() {
                if let Node::List(elems) = self.graph.node(*id) {
                    let elems = elems.clone();
                    let node = if class.key.name == "set" {
                        Node::Set(elems)
                    } else {
                        Node::FrozenSet(elems)
                    };
                    return self.alloc(node);
                }
            }
        }
        self.alloc(Node::Object(ObjectNode::new(class.key, class.kind, args)))
    }

    /// BUILD state application. Mapping states (and the two-element
    /// (state, slotstate) form) merge into named fields; anything else
    /// is kept whole on the record.
    fn apply_state(&mut self, id: ObjectId, state: Value) -> Result<(), UnpickleError> {
        if matches!(state, Value::None) {
            return Ok(());
        }
        if let Some(pairs) = self.dict_pairs(&state) {
            return self.merge_fields(id, pairs, "BUILD");
        }
        let slot_pair = match &state {
            Value::Ref(sid) => match self.graph.node(*sid) {
                Node::Tuple(items) if items.len() == 2 => {
                    Some((items[0].clone(), items[1].clone()))
                }
                _ => None,
            },
            _ => None,
        };
        if let Some((a, b)) = slot_pair {
            let a_pairs = self.dict_pairs(&a);
            let b_pairs = self.dict_pairs(&b);
            let a_ok = matches!(a, Value::None) || a_pairs.is_some();
            let b_ok = matches!(b, Value::None) || b_pairs.is_some();
            if a_ok && b_ok {
                if let Some(pairs) = a_pairs {
                    self.merge_fields(id, pairs, "BUILD")?;
                }
                if let Some(pairs) = b_pairs {
                    self.merge_fields(id, pairs, "BUILD")?;
                }
                return Ok(());
            }
        }
        match self.graph.node_mut(id) {
            Node::Object(obj) => {
                obj.state = Some(state);
                Ok(())
            }
            _ => Err(UnpickleError::StackViolation(
                "BUILD on a non-object".to_string(),
            )),
        }
    }

    fn merge_fields(
        &mut self,
        id: ObjectId,
        pairs: Vec<(Value, Value)>,
        op: &str,
    ) -> Result<(), UnpickleError> {
        for (key, value) in pairs {
            let name = match key {
                Value::String(s) => s,
                // Python 2 pickles attribute names as byte strings
                Value::Bytes(b) => String::from_utf8(b).map_err(|_| {
                    UnpickleError::StackViolation(format!(
                        "{op} state key is not valid UTF-8"
                    ))
                })?,
                _ => {
                    return Err(UnpickleError::StackViolation(format!(
                        "{op} state key is not a string"
                    )))
                }
            };
            match self.graph.node_mut(id) {
                Node::Object(obj) => obj.set_field(name, value),
                _ => {
                    return Err(UnpickleError::StackViolation(format!(
                        "{op} on a non-object"
                    )))
                }
            }
        }
        Ok(())
    }

    // -- Memo operations --

    fn memo_put(&mut self, idx: usize, val: Value) -> Result<(), UnpickleError> {
        if idx >= MAX_MEMO_SIZE {
            return Err(UnpickleError::StackViolation(format!(
                "memo index {idx} exceeds maximum {MAX_MEMO_SIZE}"
            )));
        }
        if idx >= self.memo.len() {
            self.memo.resize(idx + 1, None);
        }
        self.memo[idx] = Some(val);
        Ok(())
    }

    fn memo_get(&self, idx: usize) -> Result<Value, UnpickleError> {
        self.memo
            .get(idx)
            .and_then(|slot| slot.clone())
            .ok_or_else(|| {
                UnpickleError::StackViolation(format!("memo index {idx} not found"))
            })
    }
}

fn utf8<'b>(bytes: &'b [u8], what: &str) -> Result<&'b str, UnpickleError> {
    std::str::from_utf8(bytes)
        .map_err(|_| UnpickleError::MalformedLiteral(format!("invalid UTF-8 in {what}")))
}

/// Longs that fit i64 stay plain integers.
fn int_value(val: BigInt) -> Value {
    match i64::try_from(&val) {
        Ok(v) => Value::Int(v),
        Err(_) => Value::BigInt(val),
    }
}

fn expect_class(value: Value, op: &str) -> Result<ClassRef, UnpickleError> {
    match value {
        Value::Class(class) => Ok(class),
        _ => Err(UnpickleError::StackViolation(format!(
            "{op} callee is not a class"
        ))),
    }
}

fn ref_id(value: &Value, op: &str, expected: &str) -> Result<ObjectId, UnpickleError> {
    match value {
        Value::Ref(id) => Ok(*id),
        _ => Err(UnpickleError::StackViolation(format!(
            "{op} on a non-{expected}"
        ))),
    }
}

/// Convert a flat list [k1, v1, k2, v2, ...] into pairs [(k1, v1), (k2, v2), ...].
fn items_to_pairs(items: Vec<Value>) -> Result<Vec<(Value, Value)>, UnpickleError> {
    if items.len() % 2 != 0 {
        return Err(UnpickleError::StackViolation(
            "odd number of items for dict".to_string(),
        ));
    }
    let mut pairs = Vec::with_capacity(items.len() / 2);
    let mut iter = items.into_iter();
    while let (Some(k), Some(v)) = (iter.next(), iter.next()) {
        pairs.push((k, v));
    }
    Ok(pairs)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::known_types::sklearn_registry;
    use crate::types::TypeKey;

    fn decode(data: &[u8]) -> Result<Unpickled, UnpickleError> {
        decode_pickle(data, &sklearn_registry())
    }

    fn root_node(result: &Unpickled) -> &Node {
        result.root_node().expect("root is not a composite")
    }

    /// Minimal v1 NPY block: f64 little-endian, C order.
    fn npy_f64(shape: &[usize], values: &[f64]) -> Vec<u8> {
        let dims = shape
            .iter()
            .map(|d| d.to_string())
            .collect::<Vec<_>>()
            .join(", ");
        let shape_txt = if shape.len() == 1 {
            format!("({},)", dims)
        } else {
            format!("({})", dims)
        };
        let header = format!(
            "{{'descr': '<f8', 'fortran_order': False, 'shape': {}, }}\n",
            shape_txt
        );
        let mut block = Vec::new();
        block.extend_from_slice(b"\x93NUMPY\x01\x00");
        block.extend_from_slice(&(header.len() as u16).to_le_bytes());
        block.extend_from_slice(header.as_bytes());
        for v in values {
            block.extend_from_slice(&v.to_le_bytes());
        }
        block
    }

    /// Pickle of a NumpyArrayWrapper record followed by its NPY block.
    fn wrapper_stream(module: &str, npy: &[u8], close: bool) -> Vec<u8> {
        let mut data = Vec::new();
        data.extend_from_slice(b"\x80\x02c");
        data.extend_from_slice(module.as_bytes());
        data.extend_from_slice(b"\nNumpyArrayWrapper\n)\x81q\x00}b");
        data.extend_from_slice(npy);
        if close {
            data.push(b'.');
        }
        data
    }

    #[test]
    fn test_decode_none() {
        let result = decode(b"\x80\x02N.").unwrap();
        assert_eq!(result.root, Value::None);
        assert!(result.graph.is_empty());
    }

    #[test]
    fn test_decode_bool() {
        assert_eq!(decode(b"\x80\x02\x88.").unwrap().root, Value::Bool(true));
        assert_eq!(decode(b"\x80\x02\x89.").unwrap().root, Value::Bool(false));
    }

    #[test]
    fn test_decode_int() {
        assert_eq!(decode(b"\x80\x02K\x2a.").unwrap().root, Value::Int(42));
        assert_eq!(
            decode(b"\x80\x02J\xff\xff\xff\xff.").unwrap().root,
            Value::Int(-1)
        );
        assert_eq!(decode(b"I-7\n.").unwrap().root, Value::Int(-7));
        assert_eq!(decode(b"I01\n.").unwrap().root, Value::Bool(true));
    }

    #[test]
    fn test_decode_long() {
        assert_eq!(decode(b"\x80\x02\x8a\x01\x2a.").unwrap().root, Value::Int(42));

        // 2^64 does not fit i64
        let expected = BigInt::from(1u128 << 64);
        assert_eq!(
            decode(b"L18446744073709551616L\n.").unwrap().root,
            Value::BigInt(expected.clone())
        );
        let result = decode(b"\x80\x02\x8a\x09\x00\x00\x00\x00\x00\x00\x00\x00\x01.").unwrap();
        assert_eq!(result.root, Value::BigInt(expected));
    }

    #[test]
    fn test_decode_float() {
        assert_eq!(
            decode(b"\x80\x02G\x3f\xf8\x00\x00\x00\x00\x00\x00.").unwrap().root,
            Value::Float(1.5)
        );
        assert_eq!(decode(b"F-2.5\n.").unwrap().root, Value::Float(-2.5));
    }

    #[test]
    fn test_decode_strings() {
        assert_eq!(
            decode(b"\x80\x02\x8c\x05hello.").unwrap().root,
            Value::String("hello".to_string())
        );
        assert_eq!(
            decode(b"\x80\x02X\x02\x00\x00\x00hi.").unwrap().root,
            Value::String("hi".to_string())
        );
        // repr'd text STRING and counted BINSTRING are Python 2 byte strings
        assert_eq!(
            decode(b"S'abc'\n.").unwrap().root,
            Value::Bytes(b"abc".to_vec())
        );
        assert_eq!(decode(b"S''\n.").unwrap().root, Value::Bytes(vec![]));
        assert_eq!(
            decode(b"\x80\x02U\x03abc.").unwrap().root,
            Value::Bytes(b"abc".to_vec())
        );
    }

    #[test]
    fn test_string_line_must_be_quoted() {
        // a lone quote is not a quoted literal
        let err = decode(b"S'\n.").unwrap_err();
        assert!(matches!(err, UnpickleError::MalformedLiteral(_)));

        let err = decode(b"S\"\n.").unwrap_err();
        assert!(matches!(err, UnpickleError::MalformedLiteral(_)));

        let err = decode(b"Sabc\n.").unwrap_err();
        assert!(matches!(err, UnpickleError::MalformedLiteral(_)));
    }

    #[test]
    fn test_decode_bytes() {
        assert_eq!(
            decode(b"\x80\x03C\x03\x01\x02\x03.").unwrap().root,
            Value::Bytes(vec![1, 2, 3])
        );
    }

    #[test]
    fn test_decode_empty_containers() {
        assert_eq!(root_node(&decode(b"\x80\x02].").unwrap()), &Node::List(vec![]));
        assert_eq!(root_node(&decode(b"\x80\x02}.").unwrap()), &Node::Dict(vec![]));
        assert_eq!(root_node(&decode(b"\x80\x02).").unwrap()), &Node::Tuple(vec![]));
        assert_eq!(root_node(&decode(b"\x80\x04\x8f.").unwrap()), &Node::Set(vec![]));
    }

    #[test]
    fn test_decode_tuples() {
        assert_eq!(
            root_node(&decode(b"\x80\x02K\x01\x85.").unwrap()),
            &Node::Tuple(vec![Value::Int(1)])
        );
        assert_eq!(
            root_node(&decode(b"\x80\x02K\x01K\x02\x86.").unwrap()),
            &Node::Tuple(vec![Value::Int(1), Value::Int(2)])
        );
        assert_eq!(
            root_node(&decode(b"\x80\x02(K\x01K\x02K\x03t.").unwrap()),
            &Node::Tuple(vec![Value::Int(1), Value::Int(2), Value::Int(3)])
        );
    }

    #[test]
    fn test_mark_list_keeps_push_order() {
        let result = decode(b"\x80\x02(K\x01K\x02K\x03l.").unwrap();
        assert_eq!(
            root_node(&result),
            &Node::List(vec![Value::Int(1), Value::Int(2), Value::Int(3)])
        );
    }

    #[test]
    fn test_decode_list_appends() {
        let result = decode(b"\x80\x02](K\x01K\x02e.").unwrap();
        assert_eq!(
            root_node(&result),
            &Node::List(vec![Value::Int(1), Value::Int(2)])
        );
    }

    #[test]
    fn test_decode_dict_with_items() {
        let result = decode(b"\x80\x02}\x8c\x01aK\x01s.").unwrap();
        assert_eq!(
            root_node(&result),
            &Node::Dict(vec![(Value::String("a".to_string()), Value::Int(1))])
        );
    }

    #[test]
    fn test_decode_sets() {
        let result = decode(b"\x80\x04\x8f(K\x01K\x02\x90.").unwrap();
        assert_eq!(
            root_node(&result),
            &Node::Set(vec![Value::Int(1), Value::Int(2)])
        );

        let result = decode(b"\x80\x04(K\x01\x91.").unwrap();
        assert_eq!(root_node(&result), &Node::FrozenSet(vec![Value::Int(1)]));
    }

    #[test]
    fn test_reduce_set_sugar() {
        // Python 2 spelling resolves through the alias row
        let result = decode(b"c__builtin__\nset\n](K\x01K\x02e\x85R.").unwrap();
        assert_eq!(
            root_node(&result),
            &Node::Set(vec![Value::Int(1), Value::Int(2)])
        );
    }

    #[test]
    fn test_memo_fetch_shares_identity() {
        // list memoized at 0, fetched again, appended through one handle
        let result = decode(b"]q\x00h\x00K\x2aa\x86.").unwrap();
        let (a, b) = match root_node(&result) {
            Node::Tuple(items) => match (&items[0], &items[1]) {
                (Value::Ref(a), Value::Ref(b)) => (*a, *b),
                other => panic!("expected two refs, got {other:?}"),
            },
            other => panic!("expected tuple, got {other:?}"),
        };
        assert_eq!(a, b, "memo fetch must alias, not copy");
        assert_eq!(result.graph.node(a), &Node::List(vec![Value::Int(42)]));
    }

    #[test]
    fn test_self_referential_list() {
        let result = decode(b"]q\x00(h\x00e.").unwrap();
        let root_id = match result.root {
            Value::Ref(id) => id,
            ref other => panic!("expected ref root, got {other:?}"),
        };
        match result.graph.node(root_id) {
            Node::List(items) => assert_eq!(items, &vec![Value::Ref(root_id)]),
            other => panic!("expected list, got {other:?}"),
        }
    }

    #[test]
    fn test_unknown_type_carries_exact_pair() {
        let err = decode(b"cfoo\nBar\n.").unwrap_err();
        match err {
            UnpickleError::UnknownType { module, name } => {
                assert_eq!(module, "foo");
                assert_eq!(name, "Bar");
            }
            other => panic!("expected UnknownType, got {other:?}"),
        }
    }

    #[test]
    fn test_estimator_record_fields() {
        let result =
            decode(b"csklearn.naive_bayes\nGaussianNB\n)\x81}\x8c\x06priorsNsb.").unwrap();
        match root_node(&result) {
            Node::Object(obj) => {
                assert_eq!(obj.key, TypeKey::new("sklearn.naive_bayes", "GaussianNB"));
                assert_eq!(obj.kind, StrategyKind::Generic);
                assert!(obj.args.is_empty());
                assert_eq!(obj.field("priors"), Some(&Value::None));
                assert_eq!(obj.state, None);
            }
            other => panic!("expected object, got {other:?}"),
        }
    }

    #[test]
    fn test_python2_bytes_state_keys() {
        let result =
            decode(b"csklearn.naive_bayes\nGaussianNB\n)\x81}U\x06priorsNsb.").unwrap();
        match root_node(&result) {
            Node::Object(obj) => assert_eq!(obj.field("priors"), Some(&Value::None)),
            other => panic!("expected object, got {other:?}"),
        }
    }

    #[test]
    fn test_cv_alias_yields_canonical_record() {
        let base =
            decode(b"csklearn.linear_model.logistic\nLogisticRegression\n)\x81}\x8c\x01CG\x3f\xf0\x00\x00\x00\x00\x00\x00sb.")
                .unwrap();
        let cv =
            decode(b"csklearn.linear_model.logistic\nLogisticRegressionCV\n)\x81}\x8c\x01CG\x3f\xf0\x00\x00\x00\x00\x00\x00sb.")
                .unwrap();
        let key_of = |result: &Unpickled| match result.root_node() {
            Some(Node::Object(obj)) => (obj.key.clone(), obj.fields.clone()),
            other => panic!("expected object, got {other:?}"),
        };
        assert_eq!(key_of(&base), key_of(&cv));
    }

    #[test]
    fn test_slotstate_tuple_merges_both_halves() {
        let result = decode(
            b"csklearn.naive_bayes\nGaussianNB\n)\x81}\x8c\x01aK\x01s}\x8c\x01bK\x02s\x86b.",
        )
        .unwrap();
        match root_node(&result) {
            Node::Object(obj) => {
                assert_eq!(obj.field("a"), Some(&Value::Int(1)));
                assert_eq!(obj.field("b"), Some(&Value::Int(2)));
                assert_eq!(obj.state, None);
            }
            other => panic!("expected object, got {other:?}"),
        }
    }

    #[test]
    fn test_extension_record_keeps_tuple_state() {
        // numpy.dtype: REDUCE args ('f8', 0, 1), BUILD with a tuple state
        let result = decode(b"cnumpy\ndtype\n\x8c\x02f8K\x00K\x01\x87RK\x03\x85b.").unwrap();
        match root_node(&result) {
            Node::Object(obj) => {
                assert_eq!(obj.key, TypeKey::new("numpy", "dtype"));
                assert_eq!(obj.kind, StrategyKind::Extension);
                assert_eq!(obj.args[0], Value::String("f8".to_string()));
                let state = obj.state.as_ref().expect("tuple state kept");
                assert_eq!(
                    result.node_of(state),
                    Some(&Node::Tuple(vec![Value::Int(3)]))
                );
            }
            other => panic!("expected object, got {other:?}"),
        }
    }

    #[test]
    fn test_newobj_ex_kwargs_become_fields() {
        let result = decode(
            b"\x80\x04csklearn.preprocessing.data\nStandardScaler\n)}\x8c\x04copy\x88s\x92.",
        )
        .unwrap();
        match root_node(&result) {
            Node::Object(obj) => {
                assert_eq!(
                    obj.key,
                    TypeKey::new("sklearn.preprocessing.data", "StandardScaler")
                );
                assert_eq!(obj.field("copy"), Some(&Value::Bool(true)));
            }
            other => panic!("expected object, got {other:?}"),
        }
    }

    #[test]
    fn test_array_materializes_at_build() {
        for module in ["joblib.numpy_pickle", "sklearn.externals.joblib.numpy_pickle"] {
            let npy = npy_f64(&[2, 3], &[1.0, 2.0, 3.0, 4.0, 5.0, 6.0]);
            let result = decode(&wrapper_stream(module, &npy, true)).unwrap();
            match root_node(&result) {
                Node::Array(array) => {
                    assert_eq!(array.shape, vec![2, 3]);
                    assert_eq!(
                        array.to_f64_vec().unwrap(),
                        vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0]
                    );
                }
                other => panic!("expected array, got {other:?}"),
            }
        }
    }

    #[test]
    fn test_truncated_array_payload() {
        let mut npy = npy_f64(&[2, 3], &[1.0, 2.0, 3.0, 4.0, 5.0, 6.0]);
        npy.pop(); // one byte short of 48

        // no STOP: the stream ends inside the array block
        let err = decode(&wrapper_stream("joblib.numpy_pickle", &npy, false)).unwrap_err();
        assert!(matches!(err, UnpickleError::CorruptArrayPayload(_)));
    }

    #[test]
    fn test_memo_sees_materialized_array() {
        // BINPUT happens before BUILD; the fetch after BUILD must see the
        // array through the same handle
        let npy = npy_f64(&[1], &[9.0]);
        let mut data = wrapper_stream("joblib.numpy_pickle", &npy, false);
        data.extend_from_slice(b"h\x00\x86.");

        let result = decode(&data).unwrap();
        let (a, b) = match root_node(&result) {
            Node::Tuple(items) => match (&items[0], &items[1]) {
                (Value::Ref(a), Value::Ref(b)) => (*a, *b),
                other => panic!("expected two refs, got {other:?}"),
            },
            other => panic!("expected tuple, got {other:?}"),
        };
        assert_eq!(a, b);
        match result.graph.node(a) {
            Node::Array(array) => assert_eq!(array.to_f64_vec().unwrap(), vec![9.0]),
            other => panic!("expected array, got {other:?}"),
        }
    }

    #[test]
    fn test_stop_requires_single_value() {
        let err = decode(b"K\x01K\x02.").unwrap_err();
        assert!(matches!(err, UnpickleError::StackViolation(_)));

        let err = decode(b"(K\x01.").unwrap_err();
        assert!(matches!(err, UnpickleError::StackViolation(_)));
        assert!(err.to_string().contains("unclosed mark"));

        let err = decode(b".").unwrap_err();
        assert!(matches!(err, UnpickleError::StackViolation(_)));
    }

    #[test]
    fn test_unsupported_opcodes() {
        let err = decode(b"\x80\x02NQ.").unwrap_err();
        assert!(matches!(err, UnpickleError::UnsupportedOpcode(b'Q')));

        let err = decode(b"\x80\x05\x97.").unwrap_err();
        assert!(matches!(err, UnpickleError::UnsupportedOpcode(0x97)));
    }

    #[test]
    fn test_truncated_stream() {
        let err = decode(b"\x80\x02\x8c\x05he").unwrap_err();
        assert!(matches!(err, UnpickleError::UnexpectedEof));
    }

    #[test]
    fn test_append_on_non_list() {
        let err = decode(b"K\x01K\x02a.").unwrap_err();
        assert!(matches!(err, UnpickleError::StackViolation(_)));
    }

    #[test]
    fn test_reduce_args_must_be_tuple() {
        let err = decode(b"cnumpy\ndtype\nK\x01R.").unwrap_err();
        assert!(matches!(err, UnpickleError::StackViolation(_)));
    }

    #[test]
    fn test_build_on_non_object() {
        let err = decode(b"K\x01K\x02b.").unwrap_err();
        assert!(matches!(err, UnpickleError::StackViolation(_)));
    }

    #[test]
    fn test_memo_get_unset_slot() {
        let err = decode(b"h\x05.").unwrap_err();
        assert!(err.to_string().contains("memo index 5"));
    }

    #[test]
    fn test_memo_index_too_large() {
        let mut data = vec![0x80, 0x02, b'N', b'r'];
        data.extend_from_slice(&4_000_000_000u32.to_le_bytes());
        let err = decode(&data).unwrap_err();
        assert!(err.to_string().contains("memo index"));
    }

    #[test]
    fn test_binstring_negative_length() {
        let err = decode(b"\x80\x02T\xff\xff\xff\xff").unwrap_err();
        assert!(err.to_string().contains("negative length"));
    }

    #[test]
    fn test_long_value_too_large() {
        let mut data = vec![0x80, 0x02, b'L'];
        data.extend_from_slice(&vec![b'9'; 20_000]);
        data.push(b'\n');
        data.push(b'.');
        let err = decode(&data).unwrap_err();
        assert!(err.to_string().contains("too large"));
    }

    #[test]
    fn test_binbytes8_too_large() {
        let mut data = vec![0x80, 0x04, 0x8e];
        data.extend_from_slice(&(1u64 << 40).to_le_bytes()); // 1 TB
        let err = decode(&data).unwrap_err();
        assert!(err.to_string().contains("too large"));
    }
}
