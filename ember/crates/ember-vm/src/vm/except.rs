//! Exception unwinding and the return/finally interaction.
//!
//! The handler stack lives per-execution; each entry remembers the call
//! frame it was pushed in, so the unwinder can tell in-frame handlers
//! from outer-frame ones and pop abandoned call frames on the way. A
//! finally block owes its pending completion when it ends: a normal fall
//! through, a re-throw, or a deferred return - and an abrupt exit from
//! the finally itself replaces whatever was pending.

use ember_compile::NO_JUMP;

use crate::frame::{Completion, HandlerState, Outcome};
use crate::value::Value;
use crate::vm::Vm;

impl Vm {
    /// Throws `exception` in the current execution.
    ///
    /// Returns `None` when a handler took control (execution continues)
    /// or `Some(Outcome::Threw)` when the exception left the execution
    /// unhandled.
    pub(crate) fn do_throw(&mut self, exception: Value) -> Option<Outcome> {
        let mut exception = exception;
        loop {
            let exec = self.exec();
            let Some(handler) = exec.handlers.last_mut() else {
                return Some(Outcome::Threw(exception));
            };

            match handler.state {
                HandlerState::Try if handler.catch_ip.is_some() => {
                    let frame_index = handler.frame_index;
                    let catch_ip = handler.catch_ip.expect("checked above");
                    let depth = handler.stack_depth;
                    handler.state = HandlerState::Catch;

                    exec.frames.truncate(frame_index + 1);
                    exec.stack.truncate(depth);
                    exec.stack.push(exception);
                    exec.frames[frame_index].ip = catch_ip;
                    return None;
                }
                HandlerState::Try | HandlerState::Catch => {
                    if handler.finally_ip.is_some() {
                        let frame_index = handler.frame_index;
                        let finally_ip = handler.finally_ip.expect("checked above");
                        let depth = handler.stack_depth;
                        handler.state = HandlerState::Finally;
                        handler.completion = Completion::Throw(exception);

                        exec.frames.truncate(frame_index + 1);
                        exec.stack.truncate(depth);
                        exec.frames[frame_index].ip = finally_ip;
                        return None;
                    }
                    // Catch-only handler already in (or past) its catch
                    // body: discard and keep unwinding.
                    exec.handlers.pop();
                }
                HandlerState::Finally => {
                    // A throw inside a finally replaces the pending
                    // completion; the superseded exception is recorded
                    // as suppressed on the new one.
                    let handler = exec.handlers.pop().expect("checked above");
                    if let Completion::Throw(superseded) = handler.completion {
                        self.record_suppressed(&exception, superseded);
                    }
                }
            }
        }
    }

    /// Performs a `RETURN` of `value`, honoring finally blocks that
    /// belong to the returning frame.
    ///
    /// Returns `Some(Outcome::Returned)` when the return popped the
    /// execution below `floor`.
    pub(crate) fn do_return(&mut self, value: Value, floor: usize) -> Option<Outcome> {
        let exec = self.exec();
        let current_frame = exec.frames.len() - 1;

        // Pending finally blocks in this frame run before the frame
        // actually returns.
        while let Some(handler) = exec.handlers.last_mut() {
            if handler.frame_index != current_frame {
                break;
            }
            if handler.finally_ip.is_some() && handler.state != HandlerState::Finally {
                let finally_ip = handler.finally_ip.expect("checked above");
                let depth = handler.stack_depth;
                handler.state = HandlerState::Finally;
                handler.completion = Completion::Return(value);

                exec.stack.truncate(depth);
                exec.frames[current_frame].ip = finally_ip;
                return None;
            }
            // Stale handler (no finally, or a finally already running
            // whose completion this return supersedes): discard.
            exec.handlers.pop();
        }

        let frame = exec.frames.pop().expect("return without frame");
        exec.stack.truncate(frame.base);
        exec.stack.push(value.clone());
        if exec.frames.len() < floor {
            Some(Outcome::Returned(value))
        } else {
            None
        }
    }

    /// Shared tail of `TRY_END` and `CATCH_END`: either a pop-only
    /// cleanup (operand [`NO_JUMP`]) or a normal completion that funnels
    /// into the finally block / jumps past the handler blocks.
    pub(crate) fn handler_block_end(&mut self, ip: usize, distance: u16) {
        if distance == NO_JUMP {
            self.exec().handlers.pop();
            self.frame_mut().ip = ip + 3;
            return;
        }
        let target = ip + 3 + distance as usize;
        let has_finally = self
            .exec_ref()
            .handlers
            .last()
            .is_some_and(|handler| handler.finally_ip.is_some());
        if has_finally {
            let handler = self
                .exec()
                .handlers
                .last_mut()
                .expect("handler checked above");
            handler.state = HandlerState::Finally;
            handler.completion = Completion::Normal;
        } else {
            self.exec().handlers.pop();
        }
        self.frame_mut().ip = target;
    }

    /// Attaches a superseded exception to the suppressed list of the
    /// one replacing it, when both are exception objects.
    fn record_suppressed(&mut self, winner: &Value, superseded: Value) {
        let Some(r) = winner.as_obj() else {
            return;
        };
        if let crate::value::Object::Exception(exception) = self.heap.get_mut(r) {
            exception.suppressed.push(superseded);
        }
    }
}
