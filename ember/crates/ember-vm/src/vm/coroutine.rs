//! Coroutine plumbing: async function calls, generators, and promise
//! settlement.
//!
//! Suspension is a resume record, not a native thread: an async call or
//! generator runs in its own [`ExecState`]; hitting `AWAIT` on a pending
//! promise (or `YIELD`) moves that whole state into the promise or
//! generator object. Resumption pushes it back onto the VM's execution
//! stack, pushes the incoming value at the suspension point, and lets
//! the dispatch loop continue. Rejection resumes with an injected throw
//! instead.

use std::sync::Arc;

use ember_compile::Function;

use crate::exception::ExceptionKind;
use crate::frame::{CallFrame, ExecKind, ExecState, Outcome};
use crate::value::{GeneratorObject, GeneratorState, Object, ObjRef, PromiseObject, PromiseState, Value};
use crate::vm::Vm;

/// Bound on nested sub-executions (async inside async inside ...); each
/// costs one native recursion level in the resolver cascade.
const EXEC_DEPTH_MAX: usize = 64;

impl Vm {
    // =========================================================================
    // ASYNC CALLS
    // =========================================================================

    /// Calls an async function: runs its body in a fresh execution and
    /// pushes a promise for its completion onto the caller's stack.
    pub(crate) fn call_async(&mut self, function: Arc<Function>, argc: u8) -> Result<(), Value> {
        if argc != function.arity {
            return Err(self.make_error(
                ExceptionKind::Type,
                format!(
                    "{} expects {} argument(s), got {argc}",
                    function.name, function.arity
                ),
            ));
        }
        if self.exec_stack.len() >= EXEC_DEPTH_MAX {
            return Err(self.make_error(ExceptionKind::Runtime, "async call depth exceeded"));
        }

        // Move callee and arguments into the sub-execution's stack;
        // they become its frame-0 locals window.
        let exec = self.exec();
        let callee_index = exec.stack.len() - argc as usize - 1;
        let window: Vec<Value> = exec.stack.drain(callee_index..).collect();

        let mut sub = ExecState::new(ExecKind::Async, exec.script_name.clone());
        sub.stack = window;
        sub.frames.push(CallFrame::new(function, 0));

        self.exec_stack.push(sub);
        let outcome = self.execute(1, None);
        let finished = self.exec_stack.pop().expect("async exec vanished");

        let promise = match outcome {
            Outcome::Returned(value) => {
                Value::Obj(self.heap.alloc(Object::Promise(PromiseObject::resolved(value))))
            }
            Outcome::Threw(exception) => {
                Value::Obj(self.heap.alloc(Object::Promise(PromiseObject::rejected(exception))))
            }
            Outcome::AwaitPending(target) => {
                let mut pending = PromiseObject::pending();
                pending.resume = Some(Box::new(finished));
                let promise_ref = self.heap.alloc(Object::Promise(pending));
                self.add_waiter(target, promise_ref);
                Value::Obj(promise_ref)
            }
            Outcome::Halted | Outcome::Yielded(_) => {
                return Err(self.make_error(
                    ExceptionKind::Runtime,
                    "async function ended abnormally",
                ));
            }
        };
        self.pushv(promise)
    }

    /// Registers `waiter` to be woken when `target` settles.
    fn add_waiter(&mut self, target: ObjRef, waiter: ObjRef) {
        if let Object::Promise(promise) = self.heap.get_mut(target) {
            promise.waiters.push(waiter);
        }
    }

    // =========================================================================
    // PROMISE API (embedder surface)
    // =========================================================================

    /// Creates an unsettled promise.
    pub fn promise_pending(&mut self) -> Value {
        Value::Obj(self.heap.alloc(Object::Promise(PromiseObject::pending())))
    }

    /// Creates a promise already resolved with `value`.
    pub fn promise_resolved(&mut self, value: Value) -> Value {
        Value::Obj(self.heap.alloc(Object::Promise(PromiseObject::resolved(value))))
    }

    /// Resolves a pending promise, waking every async execution awaiting
    /// it. Settled promises are left unchanged.
    pub fn resolve_promise(&mut self, promise: &Value, value: Value) {
        let Some(r) = promise.as_obj() else {
            return;
        };
        let waiters = {
            let Object::Promise(object) = self.heap.get_mut(r) else {
                return;
            };
            if !matches!(object.state, PromiseState::Pending) {
                return;
            }
            object.state = PromiseState::Resolved(value.clone());
            std::mem::take(&mut object.waiters)
        };
        // The drained waiters are no longer reachable through this
        // promise; keep them pinned for the whole wake cascade.
        let pinned_at = self.coroutine_roots.len();
        self.coroutine_roots.extend(waiters.iter().copied());
        for waiter in waiters {
            self.wake_waiter(waiter, Ok(value.clone()));
        }
        self.coroutine_roots.truncate(pinned_at);
    }

    /// Rejects a pending promise; awaiting executions resume with the
    /// exception thrown at their await site.
    pub fn reject_promise(&mut self, promise: &Value, exception: Value) {
        let Some(r) = promise.as_obj() else {
            return;
        };
        let waiters = {
            let Object::Promise(object) = self.heap.get_mut(r) else {
                return;
            };
            if !matches!(object.state, PromiseState::Pending) {
                return;
            }
            object.state = PromiseState::Rejected(exception.clone());
            std::mem::take(&mut object.waiters)
        };
        let pinned_at = self.coroutine_roots.len();
        self.coroutine_roots.extend(waiters.iter().copied());
        for waiter in waiters {
            self.wake_waiter(waiter, Err(exception.clone()));
        }
        self.coroutine_roots.truncate(pinned_at);
    }

    /// Reads a promise's settlement state: `Ok(Some)` resolved,
    /// `Err(Some)` rejected, `Ok(None)` pending (or not a promise).
    pub fn promise_result(&self, promise: &Value) -> Result<Option<Value>, Value> {
        let Some(r) = promise.as_obj() else {
            return Ok(None);
        };
        match self.heap.get(r) {
            Object::Promise(object) => match &object.state {
                PromiseState::Pending => Ok(None),
                PromiseState::Resolved(value) => Ok(Some(value.clone())),
                PromiseState::Rejected(exception) => Err(exception.clone()),
            },
            _ => Ok(None),
        }
    }

    /// Resumes one suspended async execution with a settlement.
    fn wake_waiter(&mut self, waiter: ObjRef, settlement: Result<Value, Value>) {
        let Some(exec) = ({
            match self.heap.get_mut(waiter) {
                Object::Promise(object) => object.resume.take(),
                _ => None,
            }
        }) else {
            return;
        };

        // The waiter's resume state is checked out; pin the promise so a
        // collection during the resumed execution can't reclaim it.
        self.coroutine_roots.push(waiter);
        self.exec_stack.push(*exec);
        let outcome = match settlement {
            Ok(value) => {
                // The await site expects its result on the stack.
                self.exec().stack.push(value);
                self.execute(1, None)
            }
            Err(exception) => self.execute(1, Some(exception)),
        };
        let finished = self.exec_stack.pop().expect("async exec vanished");
        self.coroutine_roots.pop();

        match outcome {
            Outcome::Returned(value) => {
                let waiter_value = Value::Obj(waiter);
                self.resolve_promise(&waiter_value, value);
            }
            Outcome::Threw(exception) => {
                let waiter_value = Value::Obj(waiter);
                self.reject_promise(&waiter_value, exception);
            }
            Outcome::AwaitPending(next_target) => {
                if let Object::Promise(object) = self.heap.get_mut(waiter) {
                    object.resume = Some(Box::new(finished));
                }
                self.add_waiter(next_target, waiter);
            }
            Outcome::Halted | Outcome::Yielded(_) => {
                let exception = self.make_error(
                    ExceptionKind::Runtime,
                    "async resumption ended abnormally",
                );
                let waiter_value = Value::Obj(waiter);
                self.reject_promise(&waiter_value, exception);
            }
        }
    }

    // =========================================================================
    // GENERATORS
    // =========================================================================

    /// Calls a generator function: builds the suspended generator object
    /// without executing the body.
    pub(crate) fn call_generator(&mut self, function: Arc<Function>, argc: u8) -> Result<(), Value> {
        if argc != function.arity {
            return Err(self.make_error(
                ExceptionKind::Type,
                format!(
                    "{} expects {} argument(s), got {argc}",
                    function.name, function.arity
                ),
            ));
        }

        let exec = self.exec();
        let callee_index = exec.stack.len() - argc as usize - 1;
        let window: Vec<Value> = exec.stack.drain(callee_index..).collect();

        let mut sub = ExecState::new(ExecKind::Generator, exec.script_name.clone());
        sub.stack = window;
        sub.frames.push(CallFrame::new(function.clone(), 0));

        let generator = Value::Obj(self.heap.alloc(Object::Generator(GeneratorObject {
            function,
            state: GeneratorState::NotStarted,
            exec: Some(Box::new(sub)),
        })));
        self.pushv(generator)
    }

    /// Resumes a generator with `sent`, returning the next yielded value
    /// (nil once done).
    pub(crate) fn generator_next(&mut self, generator: ObjRef, sent: Value) -> Result<Value, Value> {
        let (state, exec) = {
            let Object::Generator(object) = self.heap.get_mut(generator) else {
                return Err(self.make_error(ExceptionKind::Type, "next() on a non-generator"));
            };
            match object.state {
                GeneratorState::Done => return Ok(Value::Nil),
                GeneratorState::Running => {
                    return Err(self.make_error(
                        ExceptionKind::Runtime,
                        "generator is already running",
                    ));
                }
                state => {
                    let exec = object.exec.take();
                    object.state = GeneratorState::Running;
                    (state, exec)
                }
            }
        };
        let Some(exec) = exec else {
            return Err(self.make_error(ExceptionKind::Runtime, "generator has no execution state"));
        };
        if self.exec_stack.len() >= EXEC_DEPTH_MAX {
            if let Object::Generator(object) = self.heap.get_mut(generator) {
                object.exec = Some(exec);
                object.state = state;
            }
            return Err(self.make_error(ExceptionKind::Runtime, "generator nesting too deep"));
        }

        // The generator object is invisible to the collector while its
        // execution state is checked out; pin it for the duration.
        self.coroutine_roots.push(generator);
        self.exec_stack.push(*exec);
        if state == GeneratorState::Suspended {
            // The yield site expects the sent value on the stack.
            self.exec().stack.push(sent);
        }
        let outcome = self.execute(1, None);
        let finished = self.exec_stack.pop().expect("generator exec vanished");
        self.coroutine_roots.pop();

        match outcome {
            Outcome::Yielded(value) => {
                if let Object::Generator(object) = self.heap.get_mut(generator) {
                    object.exec = Some(Box::new(finished));
                    object.state = GeneratorState::Suspended;
                }
                Ok(value)
            }
            Outcome::Returned(value) => {
                if let Object::Generator(object) = self.heap.get_mut(generator) {
                    object.state = GeneratorState::Done;
                }
                Ok(value)
            }
            Outcome::Threw(exception) => {
                if let Object::Generator(object) = self.heap.get_mut(generator) {
                    object.state = GeneratorState::Done;
                }
                Err(exception)
            }
            Outcome::Halted | Outcome::AwaitPending(_) => {
                if let Object::Generator(object) = self.heap.get_mut(generator) {
                    object.state = GeneratorState::Done;
                }
                Err(self.make_error(
                    ExceptionKind::Runtime,
                    "generator ended abnormally",
                ))
            }
        }
    }
}
