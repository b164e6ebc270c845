//! The heap and its tracing collector.
//!
//! Objects live in a slot vector; a [`crate::value::ObjRef`] is an index
//! into it. Collection is stop-the-world mark-and-sweep: the VM gathers
//! roots (operand stacks, frame locals, globals, handler completions,
//! pending exception, module registry, interned strings), the heap
//! traces the object graph from them, and sweep reclaims every slot the
//! trace never reached - including cycles, which is the point of tracing
//! over reference counting.
//!
//! Allocation accounting drives scheduling: every allocation adds its
//! size estimate to `bytes_allocated`; when that crosses `next_gc` the VM
//! runs a cycle at its next safe point, and afterwards `next_gc` grows
//! proportionally to the surviving live set.

pub mod config;
pub mod stats;

pub use config::GcConfig;
pub use stats::GcStats;

use std::time::Instant;

use ember_util::fnv1a_64;
use rustc_hash::FxHashMap;

use crate::value::{Object, ObjRef, StrObject, Value};

/// One heap slot.
#[derive(Debug)]
struct Slot {
    /// Mark bit for the current cycle.
    marked: bool,
    /// Size estimate recorded at allocation time.
    size: usize,
    /// The object, or `None` for a free slot.
    object: Option<Object>,
}

/// The object heap.
#[derive(Debug)]
pub struct Heap {
    /// Object slots; an `ObjRef` indexes here.
    slots: Vec<Slot>,
    /// Free slot indices for reuse.
    free: Vec<u32>,
    /// Interned strings: content to handle.
    interned: FxHashMap<String, ObjRef>,
    /// Running allocation account.
    bytes_allocated: usize,
    /// Next collection trigger.
    next_gc: usize,
    /// Tuning parameters.
    config: GcConfig,
    /// Collection statistics.
    stats: GcStats,
}

impl Heap {
    /// Creates an empty heap with the given configuration.
    pub fn new(config: GcConfig) -> Self {
        let next_gc = config.initial_next_gc;
        Self {
            slots: Vec::new(),
            free: Vec::new(),
            interned: FxHashMap::default(),
            bytes_allocated: 0,
            next_gc,
            config,
            stats: GcStats::default(),
        }
    }

    /// Allocates an object and returns its handle.
    pub fn alloc(&mut self, object: Object) -> ObjRef {
        let size = object.size_estimate();
        self.bytes_allocated += size;
        let slot = Slot {
            marked: false,
            size,
            object: Some(object),
        };
        match self.free.pop() {
            Some(index) => {
                self.slots[index as usize] = slot;
                ObjRef(index)
            }
            None => {
                self.slots.push(slot);
                ObjRef((self.slots.len() - 1) as u32)
            }
        }
    }

    /// Interns a string, returning the canonical handle for its content.
    pub fn intern(&mut self, text: &str) -> ObjRef {
        if let Some(&existing) = self.interned.get(text) {
            return existing;
        }
        let object = Object::Str(StrObject {
            chars: text.to_string(),
            hash: fnv1a_64(text.as_bytes()),
        });
        let handle = self.alloc(object);
        self.interned.insert(text.to_string(), handle);
        handle
    }

    /// Convenience: an interned string as a `Value`.
    pub fn string_value(&mut self, text: &str) -> Value {
        Value::Obj(self.intern(text))
    }

    /// Borrows the object behind a handle.
    ///
    /// # Panics
    ///
    /// Panics if the slot was swept; a live handle reachable by the VM
    /// is always a root, so this indicates a marking bug.
    #[inline]
    pub fn get(&self, r: ObjRef) -> &Object {
        self.slots[r.index()]
            .object
            .as_ref()
            .expect("use of reclaimed object slot")
    }

    /// Mutably borrows the object behind a handle.
    #[inline]
    pub fn get_mut(&mut self, r: ObjRef) -> &mut Object {
        self.slots[r.index()]
            .object
            .as_mut()
            .expect("use of reclaimed object slot")
    }

    /// The string contents behind a handle, if it is a string.
    pub fn as_str(&self, r: ObjRef) -> Option<&str> {
        match self.get(r) {
            Object::Str(s) => Some(&s.chars),
            _ => None,
        }
    }

    /// The string contents of a value, if it is a string object.
    pub fn value_str(&self, value: &Value) -> Option<&str> {
        value.as_obj().and_then(|r| self.as_str(r))
    }

    /// Number of live objects.
    pub fn live_objects(&self) -> usize {
        self.slots.iter().filter(|s| s.object.is_some()).count()
    }

    /// Bytes currently accounted as allocated.
    pub fn bytes_allocated(&self) -> usize {
        self.bytes_allocated
    }

    /// Whether the allocation account crossed the collection trigger.
    pub fn should_collect(&self) -> bool {
        self.config.stress || self.bytes_allocated > self.next_gc
    }

    /// Collection statistics so far.
    pub fn stats(&self) -> &GcStats {
        &self.stats
    }

    // =========================================================================
    // COLLECTION
    // =========================================================================

    /// Starts a cycle: clears all mark bits.
    pub fn begin_cycle(&mut self) {
        for slot in &mut self.slots {
            slot.marked = false;
        }
    }

    /// Marks a value's object (if it has one), pushing newly marked
    /// handles onto the gray worklist.
    pub fn mark_value(&mut self, value: &Value, gray: &mut Vec<ObjRef>) {
        if let Value::Obj(r) = value {
            self.mark_ref(*r, gray);
        }
    }

    /// Marks a handle directly.
    pub fn mark_ref(&mut self, r: ObjRef, gray: &mut Vec<ObjRef>) {
        let slot = &mut self.slots[r.index()];
        if slot.object.is_some() && !slot.marked {
            slot.marked = true;
            gray.push(r);
        }
    }

    /// Marks the interned-string table (it is a root; interned strings
    /// survive every cycle).
    pub fn mark_interned(&mut self, gray: &mut Vec<ObjRef>) {
        let handles: Vec<ObjRef> = self.interned.values().copied().collect();
        for r in handles {
            self.mark_ref(r, gray);
        }
    }

    /// Drains the gray worklist, marking everything reachable.
    pub fn trace(&mut self, gray: &mut Vec<ObjRef>) {
        while let Some(r) = gray.pop() {
            let children = self.children_of(r);
            for child in children {
                self.mark_value(&child, gray);
            }
        }
    }

    /// Reclaims every unmarked slot. Returns (objects, bytes) freed.
    pub fn sweep(&mut self) -> (u64, u64) {
        let start = Instant::now();
        let mut objects_freed = 0u64;
        let mut bytes_freed = 0u64;
        for (index, slot) in self.slots.iter_mut().enumerate() {
            if slot.object.is_some() && !slot.marked {
                slot.object = None;
                bytes_freed += slot.size as u64;
                objects_freed += 1;
                self.free.push(index as u32);
            }
        }
        self.bytes_allocated = self.bytes_allocated.saturating_sub(bytes_freed as usize);

        let grown = (self.bytes_allocated as f64 * self.config.heap_grow_factor) as usize;
        self.next_gc = grown.max(self.config.initial_next_gc);

        let pause = start.elapsed();
        self.stats.record_cycle(objects_freed, bytes_freed, pause);
        if self.config.log {
            log::debug!(
                "[GC] cycle {}: freed {} objects / {} bytes, {} bytes live, next at {}",
                self.stats.collections,
                objects_freed,
                bytes_freed,
                self.bytes_allocated,
                self.next_gc
            );
        }
        (objects_freed, bytes_freed)
    }

    /// Every value an object directly references.
    fn children_of(&self, r: ObjRef) -> Vec<Value> {
        let mut out = Vec::new();
        match self.get(r) {
            Object::Str(_) | Object::Regex(_) => {}
            Object::Array(items) => out.extend(items.iter().cloned()),
            Object::Map(map) => {
                for (key, value) in map.iter() {
                    out.push(key.clone());
                    out.push(value.clone());
                }
            }
            Object::Set(set) => {
                for (_, member) in set.iter_hashed() {
                    out.push(member.clone());
                }
            }
            Object::Class(class) => {
                out.extend(class.methods.values().cloned());
                if let Some(superclass) = class.superclass {
                    out.push(Value::Obj(superclass));
                }
            }
            Object::Instance(instance) => {
                out.push(Value::Obj(instance.class));
                out.extend(instance.fields.values().cloned());
            }
            Object::BoundMethod(bound) => {
                out.push(bound.receiver.clone());
                out.push(bound.method.clone());
                if let Some(class) = bound.defining_class {
                    out.push(Value::Obj(class));
                }
            }
            Object::Exception(exception) => {
                if let Some(cause) = &exception.cause {
                    out.push(cause.clone());
                }
                out.extend(exception.suppressed.iter().cloned());
            }
            Object::Promise(promise) => {
                match &promise.state {
                    crate::value::PromiseState::Pending => {}
                    crate::value::PromiseState::Resolved(v)
                    | crate::value::PromiseState::Rejected(v) => out.push(v.clone()),
                }
                for waiter in &promise.waiters {
                    out.push(Value::Obj(*waiter));
                }
                if let Some(exec) = &promise.resume {
                    exec_values(exec, &mut out);
                }
            }
            Object::Generator(generator) => {
                if let Some(exec) = &generator.exec {
                    exec_values(exec, &mut out);
                }
            }
            Object::Iterator(iterator) => {
                out.push(iterator.target.clone());
                out.extend(iterator.items.iter().cloned());
            }
        }
        out
    }

    // =========================================================================
    // POLYMORPHIC HASH, EQUALITY, DISPLAY
    // =========================================================================

    /// The polymorphic value hash.
    ///
    /// Law: deep-equal values hash equal. Strings hash their content
    /// (FNV-1a, computed at intern time); numbers are bit-mixed with
    /// ±0.0 coalesced and a single reserved NaN hash; arrays, maps, and
    /// sets hash structurally because they compare structurally;
    /// identity-compared objects hash their identity salted by kind.
    pub fn hash_value(&self, value: &Value) -> u64 {
        self.hash_value_depth(value, 16)
    }

    fn hash_value_depth(&self, value: &Value, depth: u32) -> u64 {
        use ember_util::mix_64;
        match value {
            Value::Nil => mix_64(0x4e49_4c00),
            Value::Bool(false) => mix_64(0xfa15_e000),
            Value::Bool(true) => mix_64(0x0007_20e0),
            Value::Number(n) => {
                if n.is_nan() {
                    // Every NaN payload hashes the same.
                    mix_64(0x7ff8_0000_dead_beef)
                } else if *n == 0.0 {
                    // +0.0 and -0.0 hash equal.
                    mix_64(0)
                } else {
                    mix_64(n.to_bits())
                }
            }
            Value::Function(f) => mix_64(arc_addr(f) ^ 0xf00d),
            Value::Native(f) => mix_64(arc_addr(f) ^ 0x0a71),
            Value::Obj(r) => {
                if depth == 0 {
                    return mix_64(r.0 as u64 ^ 0xdeef);
                }
                match self.get(*r) {
                    Object::Str(s) => s.hash,
                    Object::Array(items) => {
                        let mut hash = mix_64(0xa88a_0001);
                        for item in items {
                            hash = mix_64(hash ^ self.hash_value_depth(item, depth - 1));
                        }
                        hash
                    }
                    Object::Map(map) => {
                        // Order-independent combine over entries.
                        let mut hash = 0u64;
                        for (key, value) in map.iter() {
                            let kh = self.hash_value_depth(key, depth - 1);
                            let vh = self.hash_value_depth(value, depth - 1);
                            hash = hash.wrapping_add(mix_64(kh ^ vh.rotate_left(17)));
                        }
                        mix_64(hash ^ 0x3a90_0002)
                    }
                    Object::Set(set) => {
                        let mut hash = 0u64;
                        for (_, member) in set.iter_hashed() {
                            hash = hash.wrapping_add(self.hash_value_depth(member, depth - 1));
                        }
                        mix_64(hash ^ 0x5e70_0003)
                    }
                    other => mix_64((r.0 as u64) ^ tag_salt(other)),
                }
            }
        }
    }

    /// Deep equality: the `==` operator.
    ///
    /// Structural over nil/bool/number/strings/arrays/maps/sets;
    /// identity over classes, instances, exceptions, regexes, promises,
    /// generators, and iterators. Numbers follow IEEE (`NaN != NaN`).
    pub fn deep_equals(&self, a: &Value, b: &Value) -> bool {
        self.deep_equals_depth(a, b, 64)
    }

    fn deep_equals_depth(&self, a: &Value, b: &Value, depth: u32) -> bool {
        match (a, b) {
            (Value::Nil, Value::Nil) => true,
            (Value::Bool(x), Value::Bool(y)) => x == y,
            (Value::Number(x), Value::Number(y)) => x == y,
            (Value::Function(x), Value::Function(y)) => std::sync::Arc::ptr_eq(x, y),
            (Value::Native(x), Value::Native(y)) => std::sync::Arc::ptr_eq(x, y),
            (Value::Obj(x), Value::Obj(y)) => {
                if x == y {
                    return true;
                }
                if depth == 0 {
                    return false;
                }
                match (self.get(*x), self.get(*y)) {
                    (Object::Str(sx), Object::Str(sy)) => {
                        // Interning makes identity cover content, but a
                        // content compare keeps heap-unique strings
                        // correct too.
                        sx.hash == sy.hash && sx.chars == sy.chars
                    }
                    (Object::Array(ix), Object::Array(iy)) => {
                        ix.len() == iy.len()
                            && ix
                                .iter()
                                .zip(iy.iter())
                                .all(|(va, vb)| self.deep_equals_depth(va, vb, depth - 1))
                    }
                    (Object::Map(mx), Object::Map(my)) => {
                        // Probe hashes are stable across maps (both
                        // sides were hashed with this same function at
                        // insertion time).
                        mx.len() == my.len()
                            && mx.iter_hashed().all(|(hash, key, value)| {
                                match my.get(hash, key) {
                                    Some(other) => {
                                        self.deep_equals_depth(value, other, depth - 1)
                                    }
                                    None => false,
                                }
                            })
                    }
                    (Object::Set(sx), Object::Set(sy)) => {
                        sx.len() == sy.len()
                            && sx.iter_hashed().all(|(_, member)| {
                                let mh = self.hash_value(member);
                                sy.contains(mh, member)
                            })
                    }
                    _ => false,
                }
            }
            _ => false,
        }
    }

    /// Renders a value the way `print` shows it.
    pub fn display_value(&self, value: &Value) -> String {
        self.display_depth(value, 8)
    }

    fn display_depth(&self, value: &Value, depth: u32) -> String {
        let Value::Obj(r) = value else {
            return value.to_string();
        };
        if depth == 0 {
            return "...".to_string();
        }
        match self.get(*r) {
            Object::Str(s) => s.chars.clone(),
            Object::Array(items) => {
                let rendered: Vec<String> = items
                    .iter()
                    .map(|item| self.display_depth(item, depth - 1))
                    .collect();
                format!("[{}]", rendered.join(", "))
            }
            Object::Map(map) => {
                let rendered: Vec<String> = map
                    .iter()
                    .map(|(key, value)| {
                        format!(
                            "{}: {}",
                            self.display_depth(key, depth - 1),
                            self.display_depth(value, depth - 1)
                        )
                    })
                    .collect();
                format!("{{{}}}", rendered.join(", "))
            }
            Object::Set(set) => {
                let rendered: Vec<String> = set
                    .iter_hashed()
                    .map(|(_, member)| self.display_depth(member, depth - 1))
                    .collect();
                format!("{{{}}}", rendered.join(", "))
            }
            Object::Class(class) => format!("<class {}>", class.name),
            Object::Instance(instance) => {
                let name = match self.get(instance.class) {
                    Object::Class(class) => class.name.as_str(),
                    _ => "?",
                };
                format!("<instance of {name}>")
            }
            Object::BoundMethod(_) => "<bound method>".to_string(),
            Object::Exception(exception) => {
                format!("{}: {}", exception.type_name, exception.message)
            }
            Object::Regex(regex) => format!("/{}/{}", regex.pattern, regex.flags),
            Object::Promise(promise) => match promise.state {
                crate::value::PromiseState::Pending => "<promise pending>".to_string(),
                crate::value::PromiseState::Resolved(_) => "<promise resolved>".to_string(),
                crate::value::PromiseState::Rejected(_) => "<promise rejected>".to_string(),
            },
            Object::Generator(generator) => {
                format!("<generator {}>", generator.function.name)
            }
            Object::Iterator(_) => "<iterator>".to_string(),
        }
    }
}

/// Values held by a suspended execution.
fn exec_values(exec: &crate::frame::ExecState, out: &mut Vec<Value>) {
    out.extend(exec.stack.iter().cloned());
    for frame in &exec.frames {
        if let Some(class_def) = frame.class_def {
            out.push(Value::Obj(class_def));
        }
    }
    for handler in &exec.handlers {
        match &handler.completion {
            crate::frame::Completion::Normal => {}
            crate::frame::Completion::Throw(v) | crate::frame::Completion::Return(v) => {
                out.push(v.clone());
            }
        }
    }
}

/// Identity salt per object kind, so e.g. a class and an instance in the
/// same slot index across time don't collide systematically.
fn tag_salt(object: &Object) -> u64 {
    (match object {
        Object::Str(_) => 1,
        Object::Array(_) => 2,
        Object::Map(_) => 3,
        Object::Set(_) => 4,
        Object::Class(_) => 5,
        Object::Instance(_) => 6,
        Object::BoundMethod(_) => 7,
        Object::Exception(_) => 8,
        Object::Regex(_) => 9,
        Object::Promise(_) => 10,
        Object::Generator(_) => 11,
        Object::Iterator(_) => 12,
    })
    << 32
}

/// Address of an `Arc`'s contents, for identity hashing.
fn arc_addr<T>(arc: &std::sync::Arc<T>) -> u64 {
    std::sync::Arc::as_ptr(arc) as usize as u64
}
