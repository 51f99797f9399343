#![doc = include_str!("../../../README.md")]
mod args;
pub mod ast;
mod builtins;
pub mod bytecode;
mod exception;
mod heap;
mod io;
mod object;
#[cfg(feature = "parser")]
mod parse;
mod resource;
mod run;
pub mod scope;
mod types;
mod value;

#[cfg(feature = "parser")]
pub use crate::parse::{ParseError, parse};
pub use crate::{
    bytecode::{Code, Opcode, compile, compile_with_scopes},
    exception::{CompileError, ExcType, Exception, StackFrame},
    io::{CollectStringPrint, NoPrint, PrintWriter, StdPrint},
    object::Object,
    resource::{
        DEFAULT_GC_INTERVAL, DEFAULT_MAX_RECURSION_DEPTH, LimitedTracker, NoLimitTracker, ResourceError,
        ResourceLimits, ResourceTracker,
    },
    run::{Error, Runner},
    scope::{ScopeTree, analyze},
};
