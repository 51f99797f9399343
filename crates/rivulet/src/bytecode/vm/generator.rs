//! Generator objects and their resumption.
//!
//! A generator owns its suspended frame. Resuming moves the frame back onto the
//! engine's frame stack; `YIELD_VALUE` moves it back into the generator. Resumption
//! from `FOR_ITER` or from bytecode never recurses on the host stack.

use std::sync::Arc;

use super::{
    VM,
    frame::{BlockKind, Continuation, Frame},
};
use crate::{
    exception::{ExcType, RunError, RunResult},
    heap::{HeapData, HeapId, Trace},
    io::PrintWriter,
    resource::ResourceTracker,
    value::Value,
};

#[derive(Debug)]
pub(crate) struct Generator {
    pub name: Arc<str>,
    pub state: GenState,
    /// Exception being handled by the suspended frame, while it is parked inside an
    /// `except` body.
    pub handled: Option<Value>,
}

#[derive(Debug)]
pub(crate) enum GenState {
    /// Arguments bound, body not started.
    Created(Box<Frame>),
    /// Parked at a `YIELD_VALUE`.
    Suspended(Box<Frame>),
    /// Its frame is on the engine's frame stack.
    Running,
    Finished,
}

impl Generator {
    pub fn new(frame: Frame) -> Self {
        Self {
            name: Arc::from(frame.code.name()),
            state: GenState::Created(Box::new(frame)),
            handled: None,
        }
    }
}

impl Trace for Generator {
    fn mark_children(&self, work_list: &mut Vec<HeapId>) {
        match &self.state {
            GenState::Created(frame) | GenState::Suspended(frame) => frame.mark_children(work_list),
            GenState::Running | GenState::Finished => {}
        }
        self.handled.mark_children(work_list);
    }
}

/// Outcome of asking a generator to run.
pub(crate) enum Resumed {
    /// Its frame is now on top of the frame stack.
    Pushed,
    /// It already finished; nothing was pushed.
    Exhausted,
}

impl<T: ResourceTracker, P: PrintWriter> VM<'_, T, P> {
    /// Moves a generator's frame onto the frame stack, delivering `sent` as the value of
    /// the `yield` it is parked at.
    pub(super) fn resume_generator(
        &mut self,
        gen_id: HeapId,
        sent: Value,
        continuation: Continuation,
        boundary: bool,
    ) -> RunResult<Resumed> {
        let HeapData::Generator(generator) = self.heap.get_mut(gen_id) else {
            return Err(RunError::internal("resume_generator: not a generator"));
        };
        let mut frame = match std::mem::replace(&mut generator.state, GenState::Running) {
            GenState::Created(frame) => {
                if !sent.is_none() {
                    generator.state = GenState::Created(frame);
                    return Err(ExcType::type_error(
                        "can't send non-None value to a just-started generator",
                    ));
                }
                frame
            }
            GenState::Suspended(mut frame) => {
                frame.stack.push(sent);
                // Inside an `except` body the generator sees its own handled exception;
                // leaving that body must restore the resumer's, not the one current
                // when the body was entered.
                if let Some(outer) = frame.blocks.iter_mut().find(|b| b.kind == BlockKind::ExceptHandler) {
                    outer.saved_exc = self.exc_info.take();
                    self.exc_info = generator.handled.take();
                }
                frame
            }
            GenState::Running => {
                return Err(RunError::internal("generator re-entered while already running"));
            }
            GenState::Finished => {
                generator.state = GenState::Finished;
                return Ok(Resumed::Exhausted);
            }
        };
        frame.continuation = continuation;
        frame.boundary = boundary;
        frame.generator = Some(gen_id);
        if let Err(err) = self.push_frame(*frame) {
            self.finish_generator(gen_id);
            return Err(err);
        }
        Ok(Resumed::Pushed)
    }

    /// Runs a generator from native code until it yields (`Some`) or returns (`None`).
    pub(crate) fn generator_send(&mut self, gen_id: HeapId, sent: Value) -> RunResult<Option<Value>> {
        match self.resume_generator(gen_id, sent, Continuation::Next, true)? {
            Resumed::Exhausted => Ok(None),
            Resumed::Pushed => match self.run_nested()? {
                super::FrameOutcome::Yield(value) => Ok(Some(value)),
                super::FrameOutcome::Return(_) => Ok(None),
            },
        }
    }

    /// Parks the running generator frame after `YIELD_VALUE` and hands `value` to
    /// whoever resumed it.
    pub(super) fn suspend_generator(&mut self, value: Value) -> RunResult<Option<super::FrameOutcome>> {
        let frame = self.pop_frame()?;
        let gen_id = frame
            .generator
            .ok_or_else(|| RunError::internal("YIELD_VALUE outside a generator frame"))?;
        let boundary = frame.boundary;
        tracing::trace!(generator = %gen_id, "generator suspended");
        let resumer_exc = frame
            .blocks
            .iter()
            .find(|b| b.kind == BlockKind::ExceptHandler)
            .map(|outer| outer.saved_exc.clone());
        let HeapData::Generator(generator) = self.heap.get_mut(gen_id) else {
            return Err(RunError::internal("suspended frame does not belong to a generator"));
        };
        if let Some(resumer_exc) = resumer_exc {
            generator.handled = std::mem::replace(&mut self.exc_info, resumer_exc);
        }
        generator.state = GenState::Suspended(Box::new(frame));
        if boundary {
            return Ok(Some(super::FrameOutcome::Yield(value)));
        }
        self.frame_mut()?.stack.push(value);
        Ok(None)
    }

    pub(super) fn finish_generator(&mut self, gen_id: HeapId) {
        if let HeapData::Generator(generator) = self.heap.get_mut(gen_id) {
            generator.state = GenState::Finished;
        }
    }
}
