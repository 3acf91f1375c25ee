//! Block unwinding and exception dispatch.
//!
//! `break`, `continue` and `return` leave blocks through [`Vm::unwind`]; a
//! pending finally body intercepts them and records the unwind so
//! `END_FINALLY` can resume it. Raised exceptions go through
//! [`Vm::handle_exception`], which searches the current frame's blocks for a
//! catch or finally handler and otherwise drops the frame and tries the caller.

use super::{
    Step, Vm,
    frame::{BlockKind, OnReturn, Unwind},
};
use crate::{
    exception_private::{ExceptionRaise, RawStackFrame, Raised, RunError, RunResult},
    exception_public::{Error, Exception, StackFrame},
    heap::HeapId,
    io::PrintWriter,
    object::ObjectKind,
    resource::ResourceTracker,
    tracer::VmTracer,
};

impl<T: ResourceTracker, P: PrintWriter, Tr: VmTracer> Vm<'_, T, P, Tr> {
    /// Leaves blocks of the current frame until `reason` is satisfied.
    pub(super) fn unwind(&mut self, reason: Unwind) -> RunResult<Step> {
        loop {
            let Some(block) = self.frame().blocks.last() else {
                return match reason {
                    Unwind::Return(value) => self.return_from_frame(value),
                    Unwind::Break | Unwind::BreakElse | Unwind::Continue(_) => {
                        Err(RunError::internal("break or continue outside of a loop"))
                    }
                };
            };
            let sp = block.sp;
            let ip = self.frame().instr_start;

            match block.kind {
                BlockKind::Exception {
                    in_finally: false,
                    finally,
                    ..
                } if ip < finally => {
                    self.truncate_stack(sp);
                    if let Some(BlockKind::Exception { in_finally, resume, .. }) =
                        self.frame_mut().blocks.last_mut().map(|block| &mut block.kind)
                    {
                        *in_finally = true;
                        *resume = Some(reason);
                    }
                    self.jump(finally);
                    return Ok(Step::Continue);
                }
                BlockKind::Exception { .. } => {
                    // Leaving a finally body early replaces whatever it was going to resume.
                    self.truncate_stack(sp);
                    self.pop_block();
                }
                BlockKind::Loop { head, end, otherwise } => match reason {
                    Unwind::Break => {
                        self.truncate_stack(sp);
                        self.pop_block();
                        self.jump(end);
                        return Ok(Step::Continue);
                    }
                    Unwind::BreakElse => {
                        self.truncate_stack(sp);
                        self.pop_block();
                        self.jump(otherwise.unwrap_or(end));
                        return Ok(Step::Continue);
                    }
                    Unwind::Continue(target) if (head..end).contains(&target) => {
                        self.truncate_stack(sp);
                        self.jump(target);
                        return Ok(Step::Continue);
                    }
                    Unwind::Continue(_) | Unwind::Return(_) => {
                        self.truncate_stack(sp);
                        self.pop_block();
                    }
                },
            }
        }
    }

    fn pop_block(&mut self) {
        if let Some(block) = self.frame_mut().blocks.pop() {
            self.discard_block(block);
        }
    }

    /// Pops the current frame and hands `value` to the caller.
    pub(super) fn return_from_frame(&mut self, value: HeapId) -> RunResult<Step> {
        let on_return = std::mem::replace(&mut self.frame_mut().on_return, OnReturn::Push);
        self.discard_frame();
        let result = match on_return {
            OnReturn::Push => value,
            OnReturn::Construct(instance) => {
                self.release(value);
                instance
            }
        };
        if self.frames.is_empty() {
            Ok(Step::Finished(result))
        } else {
            self.push(result);
            Ok(Step::Continue)
        }
    }

    /// `END_FINALLY`: rethrows a pending exception or resumes a pending unwind.
    pub(super) fn end_finally(&mut self) -> RunResult<Step> {
        let block = self
            .frame_mut()
            .blocks
            .pop()
            .ok_or_else(|| RunError::internal("END_FINALLY with no block"))?;
        let BlockKind::Exception { resume, end_finally, .. } = block.kind else {
            return Err(RunError::internal("END_FINALLY closes a loop block"));
        };
        let ip = self.frame().instr_start;
        if ip != end_finally {
            if let Some(Unwind::Return(value)) = resume {
                self.release(value);
            }
            return Err(RunError::internal(format!(
                "END_FINALLY at {ip} closes a try block that ends at {end_finally}"
            )));
        }
        let depth = self.frame().blocks.len();
        self.tracer.on_exception_pop(depth);

        if self.frame().stack.len() > block.sp {
            let exception = self.pop()?;
            self.truncate_stack(block.sp);
            if let Some(Unwind::Return(value)) = resume {
                self.release(value);
            }
            return Err(ExceptionRaise {
                raised: Raised::Object(exception),
                frames: Vec::new(),
            }
            .into());
        }
        match resume {
            Some(reason) => self.unwind(reason),
            None => Ok(Step::Continue),
        }
    }

    /// Routes a runtime error to the nearest handler.
    ///
    /// Returns `None` when a handler took the exception and execution can go
    /// on, or the error (with its traceback) once no frame is left.
    pub(super) fn handle_exception(&mut self, mut err: RunError) -> Option<RunError> {
        loop {
            if self.frames.is_empty() {
                return Some(err);
            }
            err = match err {
                RunError::Exc(raise) => match self.find_handler() {
                    Some((target, sp)) => {
                        self.truncate_stack(sp);
                        match self.materialize_exception(raise.raised) {
                            Ok(exception) => {
                                self.push(exception);
                                self.jump(target);
                                return None;
                            }
                            Err(err) => err,
                        }
                    }
                    None => RunError::Exc(raise),
                },
                other => other,
            };
            let frame = self.frame();
            err.push_frame(RawStackFrame {
                frame_name: frame.name.clone(),
                line: frame.line(),
            });
            self.discard_frame();
        }
    }

    /// Finds the innermost exception block of the current frame that covers
    /// the faulting instruction, discarding every block it passes.
    ///
    /// Returns the handler offset and the stack depth to restore.
    fn find_handler(&mut self) -> Option<(usize, usize)> {
        loop {
            let frame = self.frames.last_mut()?;
            let ip = frame.instr_start;
            let block = frame.blocks.last_mut()?;
            if let BlockKind::Exception {
                catch,
                finally,
                in_finally,
                ..
            } = &mut block.kind
            {
                let target = if ip < *catch {
                    Some(*catch)
                } else if !*in_finally && ip < *finally {
                    Some(*finally)
                } else {
                    None
                };
                if let Some(target) = target {
                    if target == *finally {
                        *in_finally = true;
                    }
                    return Some((target, block.sp));
                }
            }
            self.pop_block();
        }
    }

    /// Turns a raised exception into an object a catch clause can bind.
    fn materialize_exception(&mut self, raised: Raised) -> RunResult<HeapId> {
        match raised {
            Raised::Object(id) => Ok(id),
            Raised::Simple(exc) => {
                let class = self.builtins.exception_class(exc.exc_type());
                let instance = self.new_instance(class)?;
                if let Some(message) = exc.message() {
                    let message = match self.string(message.to_owned()) {
                        Ok(message) => message,
                        Err(err) => {
                            self.release(instance);
                            return Err(err);
                        }
                    };
                    if let Err(err) = self.set_message(instance, message) {
                        self.release(instance);
                        return Err(err);
                    }
                }
                Ok(instance)
            }
        }
    }

    /// Stores `message` (one reference) in an exception instance.
    pub(super) fn set_message(&mut self, instance: HeapId, message: HeapId) -> RunResult<()> {
        match self.heap.get(instance).attributes.get("message").copied() {
            Some(attrib) => self.replace_attrib_value(attrib, message),
            None => {
                self.release(message);
                Err(RunError::internal("exception instance has no message attribute"))
            }
        }
    }

    /// The `message` of an exception object, when it is a string.
    fn message_of(&self, instance: HeapId) -> Option<String> {
        let attrib = self.find_attribute(instance, "message")?;
        let ObjectKind::Attrib(attr) = &self.heap.get(attrib).kind else {
            return None;
        };
        match &self.heap.get(attr.value).kind {
            ObjectKind::String(s) => Some(s.clone()),
            _ => None,
        }
    }

    /// Converts an error that escaped the main frame into the public error type.
    pub fn into_public_error(&mut self, err: RunError) -> Error {
        match err {
            RunError::Internal(msg) => Error::Internal(msg.into_owned()),
            RunError::Exc(raise) | RunError::Uncatchable(raise) => {
                let ExceptionRaise { raised, frames } = *raise;
                let traceback = frames
                    .into_iter()
                    .map(|frame| StackFrame {
                        frame_name: frame.frame_name,
                        line: frame.line,
                    })
                    .collect();
                let exception = match raised {
                    Raised::Simple(exc) => {
                        Exception::new(exc.exc_type().to_string(), exc.message().map(str::to_owned), traceback)
                    }
                    Raised::Object(id) => {
                        let class_name = self.heap.get(id).name.clone();
                        let message = self.message_of(id);
                        self.release(id);
                        Exception::new(class_name, message, traceback)
                    }
                };
                tracing::debug!(class = exception.class_name(), "uncaught exception");
                Error::Runtime(exception)
            }
        }
    }
}
