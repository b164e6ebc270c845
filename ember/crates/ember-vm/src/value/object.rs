//! Heap object payloads.
//!
//! Every variant of [`Object`] occupies one heap slot and is owned by the
//! heap outright - objects reference each other only through [`ObjRef`]
//! handles (or `Value`s containing them), which is what lets the tracing
//! collector reclaim cycles.

use std::sync::Arc;

use ember_compile::Function;
use rustc_hash::FxHashMap;

use crate::exception::ExceptionObject;
use crate::value::{ObjRef, Value, ValueMap, ValueSet};
use crate::vm::ExecState;

/// An interned string.
#[derive(Debug)]
pub struct StrObject {
    /// UTF-8 contents.
    pub chars: String,
    /// FNV-1a content hash, computed once at intern time.
    pub hash: u64,
}

/// A class: name, method table, optional superclass.
#[derive(Debug, Default)]
pub struct ClassObject {
    /// Class name.
    pub name: String,
    /// Methods by name; values are bytecode functions.
    pub methods: FxHashMap<String, Value>,
    /// Superclass link; chains are finite and acyclic.
    pub superclass: Option<ObjRef>,
}

/// An instance: its class and a field map.
#[derive(Debug)]
pub struct InstanceObject {
    /// The instance's class.
    pub class: ObjRef,
    /// Named fields.
    pub fields: FxHashMap<String, Value>,
}

/// A method bound to a receiver.
#[derive(Debug)]
pub struct BoundMethodObject {
    /// The receiver that becomes `this`.
    pub receiver: Value,
    /// The underlying method function.
    pub method: Value,
    /// The class the method was found on (drives `super` in the callee).
    pub defining_class: Option<ObjRef>,
}

/// A compiled regular expression.
#[derive(Debug)]
pub struct RegexObject {
    /// The pattern as written.
    pub pattern: String,
    /// Flag string (`i`, `m`, `s` supported).
    pub flags: String,
    /// The compiled engine handle.
    pub compiled: regex::Regex,
    /// Capture groups from the most recent successful match.
    pub last_groups: Option<Vec<Option<String>>>,
}

/// Promise settlement state.
#[derive(Debug)]
pub enum PromiseState {
    /// Not yet settled.
    Pending,
    /// Settled with a value.
    Resolved(Value),
    /// Settled with a thrown value.
    Rejected(Value),
}

/// A promise: settlement state plus the machinery to wake dependents.
#[derive(Debug)]
pub struct PromiseObject {
    /// Current settlement state.
    pub state: PromiseState,
    /// The suspended async execution whose completion this promise
    /// represents, parked at its `AWAIT` site.
    pub resume: Option<Box<ExecState>>,
    /// Promises of async functions awaiting this one.
    pub waiters: Vec<ObjRef>,
}

impl PromiseObject {
    /// A promise already settled with `value`.
    pub fn resolved(value: Value) -> Self {
        Self {
            state: PromiseState::Resolved(value),
            resume: None,
            waiters: Vec::new(),
        }
    }

    /// A promise settled by a thrown value.
    pub fn rejected(value: Value) -> Self {
        Self {
            state: PromiseState::Rejected(value),
            resume: None,
            waiters: Vec::new(),
        }
    }

    /// An unsettled promise.
    pub fn pending() -> Self {
        Self {
            state: PromiseState::Pending,
            resume: None,
            waiters: Vec::new(),
        }
    }
}

/// Generator lifecycle.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum GeneratorState {
    /// Created, body not entered yet.
    NotStarted,
    /// Parked at a `YIELD`.
    Suspended,
    /// Currently executing (guards against reentrant `next`).
    Running,
    /// Body returned; `next` yields nil from now on.
    Done,
}

/// A generator: its function, lifecycle state, and the suspended
/// execution between `next` calls.
#[derive(Debug)]
pub struct GeneratorObject {
    /// The generator function.
    pub function: Arc<Function>,
    /// Lifecycle state.
    pub state: GeneratorState,
    /// The parked execution; `None` while running or when done.
    pub exec: Option<Box<ExecState>>,
}

/// A cursor over a snapshot of a collection's elements.
#[derive(Debug)]
pub struct IteratorObject {
    /// The collection being iterated.
    pub target: Value,
    /// Elements captured when the iterator was created.
    pub items: Vec<Value>,
    /// Next position.
    pub cursor: usize,
}

/// A heap object.
#[derive(Debug)]
pub enum Object {
    /// Interned string.
    Str(StrObject),
    /// Dynamic array.
    Array(Vec<Value>),
    /// Hash map.
    Map(ValueMap),
    /// Hash set.
    Set(ValueSet),
    /// Class.
    Class(ClassObject),
    /// Class instance.
    Instance(InstanceObject),
    /// Bound method.
    BoundMethod(BoundMethodObject),
    /// Exception.
    Exception(ExceptionObject),
    /// Compiled regex.
    Regex(RegexObject),
    /// Promise.
    Promise(PromiseObject),
    /// Generator.
    Generator(GeneratorObject),
    /// Iterator.
    Iterator(IteratorObject),
}

impl Object {
    /// A coarse size estimate in bytes for allocation accounting.
    ///
    /// The collector only needs a consistent monotone measure to drive
    /// its growth heuristic, not exact footprints.
    pub fn size_estimate(&self) -> usize {
        let base = std::mem::size_of::<Object>();
        base + match self {
            Object::Str(s) => s.chars.len(),
            Object::Array(items) => items.len() * std::mem::size_of::<Value>(),
            Object::Map(map) => map.len() * 3 * std::mem::size_of::<Value>(),
            Object::Set(set) => set.len() * 2 * std::mem::size_of::<Value>(),
            Object::Class(class) => class.methods.len() * 64 + class.name.len(),
            Object::Instance(instance) => instance.fields.len() * 64,
            Object::BoundMethod(_) => 0,
            Object::Exception(exception) => {
                exception.message.len() + exception.stack_frames.len() * 64
            }
            Object::Regex(regex) => regex.pattern.len() * 4,
            Object::Promise(_) => 256,
            Object::Generator(_) => 512,
            Object::Iterator(iterator) => iterator.items.len() * std::mem::size_of::<Value>(),
        }
    }

    /// A short name for error messages.
    pub fn kind_name(&self) -> &'static str {
        match self {
            Object::Str(_) => "string",
            Object::Array(_) => "array",
            Object::Map(_) => "map",
            Object::Set(_) => "set",
            Object::Class(_) => "class",
            Object::Instance(_) => "instance",
            Object::BoundMethod(_) => "bound method",
            Object::Exception(_) => "exception",
            Object::Regex(_) => "regex",
            Object::Promise(_) => "promise",
            Object::Generator(_) => "generator",
            Object::Iterator(_) => "iterator",
        }
    }
}
