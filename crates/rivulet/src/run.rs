//! Public interface for compiling and running programs.

use std::sync::Arc;

use crate::{
    ast::Module,
    bytecode::{Code, compile, vm::VM},
    exception::{CompileError, Exception, ExceptionRaise, RunError},
    heap::Heap,
    io::PrintWriter,
    object::Object,
    resource::{NoLimitTracker, ResourceTracker},
};
#[cfg(feature = "parser")]
use crate::parse::{ParseError, parse};

/// Everything that can go wrong between source text and a result.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum Error {
    #[cfg(feature = "parser")]
    #[error(transparent)]
    Parse(#[from] ParseError),
    #[error(transparent)]
    Compile(#[from] CompileError),
    /// An exception escaped the program, including resource-limit violations.
    #[error(transparent)]
    Exception(#[from] Exception),
    /// The compiler and engine disagreed about a bytecode contract. Always a bug.
    #[error("internal error: {0}")]
    Internal(String),
}

/// Primary interface for running code: compile once, run many times.
///
/// Each run gets a fresh heap and module namespace, so runs never observe each other.
///
/// # Example
/// ```
/// use rivulet::{CollectStringPrint, Object, Runner};
///
/// let runner = Runner::new("def double(x):\n    return x * 2\nprint('hi')\ndouble(21)\n", "example.py").unwrap();
/// let mut out = CollectStringPrint::new();
/// assert_eq!(runner.run_no_limits(&mut out).unwrap(), Object::Int(42));
/// assert_eq!(out.output(), "hi\n");
/// ```
#[derive(Debug, Clone)]
pub struct Runner {
    code: Arc<Code>,
}

impl Runner {
    /// Parses and compiles `source`.
    #[cfg(feature = "parser")]
    pub fn new(source: &str, filename: &str) -> Result<Self, Error> {
        let module = parse(source, filename)?;
        Self::from_module(&module, filename)
    }

    /// Compiles an already built syntax tree.
    pub fn from_module(module: &Module, filename: &str) -> Result<Self, Error> {
        let code = compile(module, filename)?;
        Ok(Self { code })
    }

    /// The compiled module code.
    #[must_use]
    pub fn code(&self) -> &Arc<Code> {
        &self.code
    }

    /// Runs the module to completion under `tracker`'s limits.
    ///
    /// Returns the value of the module's trailing expression statement, or `Object::None`
    /// when the module does not end with one.
    pub fn run(&self, print: &mut impl PrintWriter, tracker: impl ResourceTracker) -> Result<Object, Error> {
        tracing::debug!(module = self.code.filename(), "run started");
        let mut heap = Heap::new(tracker);
        let mut vm = VM::new(&mut heap, print);
        let result = match vm.run_module(self.code.clone()) {
            Ok(value) => Object::new(&value, &mut vm).map_err(|err| into_error(&mut vm, err)),
            Err(err) => Err(into_error(&mut vm, err)),
        };
        drop(vm);
        tracing::debug!(ok = result.is_ok(), live = heap.live(), "run finished");
        result
    }

    /// Runs with no limits beyond the default recursion depth.
    pub fn run_no_limits(&self, print: &mut impl PrintWriter) -> Result<Object, Error> {
        self.run(print, NoLimitTracker::default())
    }
}

/// Converts an error that escaped the outermost frame into its public form.
fn into_error(vm: &mut VM<'_, impl ResourceTracker, impl PrintWriter>, err: RunError) -> Error {
    match err {
        RunError::Exc(raise) => {
            let converted = vm.materialize(raise).and_then(|exc| vm.to_public_exception(&exc));
            match converted {
                Ok(exc) => Error::Exception(exc),
                Err(err) => into_error(vm, err),
            }
        }
        RunError::UncatchableExc(ExceptionRaise::Simple(simple)) => {
            let type_name = simple.exc_type().to_string();
            let exc = Exception::new(type_name, simple.into_arg(), vm.take_fatal_traceback());
            Error::Exception(exc)
        }
        RunError::UncatchableExc(raise) => into_error(vm, RunError::Exc(raise)),
        RunError::Internal(msg) => Error::Internal(msg.into_owned()),
    }
}
