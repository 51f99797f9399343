//! Bytecode compiler: lowers the syntax tree to [`Code`] objects.
//!
//! One `Compiler` exists per code unit (module, function, lambda, class body or
//! comprehension). Nested units are compiled by a fresh `Compiler` working on the child
//! scope, and the finished `Code` becomes a constant of the enclosing unit.
//!
//! Name access is driven entirely by the [`ScopeTree`]: the classification of each name
//! picks between the fast-slot, cell, global and dict-based opcode families, which must
//! match how the VM stores each kind of variable.
//!
//! Control flow is lowered to jumps between builder blocks. Loops, `try` and `with`
//! regions push a compile-time block kind so that `break` and `continue` can be
//! validated and lowered; the VM keeps a separate runtime block stack.

use std::sync::Arc;

use super::{
    builder::{BlockId, CodeBuilder},
    code::{Code, CodeFlags, Const},
    op::{CompareKind, Opcode},
};
use crate::{
    ast::{
        BoolOperator, ClassDef, CmpOperator, Comprehension, ComprehensionKind, Expr, ExprLoc, FunctionDef, Keyword,
        Literal, Module, Node, NodeLoc, Operator, Parameters, Target, Try, UnaryOperator, WithItem,
    },
    exception::CompileError,
    scope::{CLASS_CELL, COMPREHENSION_ARG, NameKind, ScopeId, ScopeKind, ScopeTree, analyze, comprehension_name},
};

/// Operand fields of `CallFunction`/`MakeFunction` are one byte each.
const MAX_PACKED_COUNT: usize = 255;

/// Compiles a module, resolving its scopes first.
pub fn compile(module: &Module, filename: &str) -> Result<Arc<Code>, CompileError> {
    let tree = analyze(module)?;
    compile_with_scopes(module, &tree, filename)
}

/// Compiles a module against an already resolved scope tree.
pub fn compile_with_scopes(module: &Module, tree: &ScopeTree, filename: &str) -> Result<Arc<Code>, CompileError> {
    let filename: Arc<str> = Arc::from(filename);
    let mut compiler = Compiler::new(tree, tree.root(), CodeBuilder::new("<module>", filename.clone(), 1), filename);
    compiler.compile_module_body(&module.body)?;
    compiler.finish()
}

/// Compile-time block kinds, innermost last.
#[derive(Debug, Clone, Copy)]
enum CompileBlock {
    Loop { start: BlockId },
    Except,
    /// The protected body of a `try ... finally` or `with`.
    FinallyTry,
    /// The `finally` body itself (or a `with` exit).
    FinallyEnd,
    /// The body of an `except` clause.
    ExceptHandler,
}

/// How a name is being accessed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Access {
    Load,
    Store,
    Delete,
}

struct Compiler<'a> {
    code: CodeBuilder,
    tree: &'a ScopeTree,
    scope: ScopeId,
    /// Index of the next child scope to consume.
    next_child: usize,
    filename: Arc<str>,
    blocks: Vec<CompileBlock>,
    /// Last line passed to the builder.
    line: u32,
}

impl<'a> Compiler<'a> {
    fn new(tree: &'a ScopeTree, scope: ScopeId, mut code: CodeBuilder, filename: Arc<str>) -> Self {
        let info = tree.get(scope);
        for name in info.varnames() {
            code.varname_index(name);
        }
        for name in info.cellvars() {
            code.add_cellvar(name);
        }
        for name in info.freevars() {
            code.add_freevar(name);
        }
        Self {
            code,
            tree,
            scope,
            next_child: 0,
            filename,
            blocks: Vec::new(),
            line: info.line(),
        }
    }

    fn finish(self) -> Result<Arc<Code>, CompileError> {
        Ok(Arc::new(self.code.build()?))
    }

    fn scope_kind(&self) -> ScopeKind {
        self.tree.get(self.scope).kind()
    }

    fn set_line(&mut self, line: u32) {
        if line != self.line {
            self.line = line;
            self.code.set_lineno(line);
        }
    }

    /// Takes the next child scope, checking it is the one the collector created here.
    fn take_child(&mut self, name: &str, line: u32) -> Result<ScopeId, CompileError> {
        let child = self.tree.get(self.scope).children().get(self.next_child).copied();
        self.next_child += 1;
        match child {
            Some(id) if self.tree.get(id).name() == name => Ok(id),
            _ => Err(CompileError::new(
                format!("internal error: scope of '{name}' out of order"),
                line,
            )),
        }
    }

    // ========================================================================
    // Units
    // ========================================================================

    /// The value of a trailing expression statement becomes the module's result.
    fn compile_module_body(&mut self, body: &[NodeLoc]) -> Result<(), CompileError> {
        if let Some((last, rest)) = body.split_last()
            && let Node::Expr(expr) = &last.node
        {
            self.compile_body(rest)?;
            self.set_line(last.line);
            self.compile_expr(expr)?;
        } else {
            self.compile_body(body)?;
            self.load_const(Const::None);
        }
        self.code.emit(Opcode::ReturnValue);
        Ok(())
    }

    /// Creates the compiler for a nested unit, with flags derived from its scope.
    fn child_compiler(&self, child: ScopeId) -> Compiler<'a> {
        let info = self.tree.get(child);
        let mut code = CodeBuilder::new(info.name(), self.filename.clone(), info.line());
        if info.kind().is_function_like() {
            code.set_argcount(info.argcount(), info.kwonlyargcount());
            code.add_flags(CodeFlags::OPTIMIZED | CodeFlags::NEWLOCALS);
            if info.has_varargs() {
                code.add_flags(CodeFlags::VARARGS);
            }
            if info.has_varkeywords() {
                code.add_flags(CodeFlags::VARKEYWORDS);
            }
            if info.is_generator() {
                code.add_flags(CodeFlags::GENERATOR);
            }
        }
        if self.scope_kind().is_function_like() {
            code.add_flags(CodeFlags::NESTED);
        }
        Compiler::new(self.tree, child, code, self.filename.clone())
    }

    fn compile_function_body(&mut self, child: ScopeId, body: &[NodeLoc]) -> Result<Arc<Code>, CompileError> {
        let mut compiler = self.child_compiler(child);
        compiler.compile_body(body)?;
        compiler.load_const(Const::None);
        compiler.code.emit(Opcode::ReturnValue);
        compiler.finish()
    }

    fn compile_lambda_body(&mut self, child: ScopeId, body: &ExprLoc) -> Result<Arc<Code>, CompileError> {
        let mut compiler = self.child_compiler(child);
        compiler.compile_expr(body)?;
        if compiler.tree.get(child).is_generator() {
            compiler.code.emit(Opcode::PopTop);
            compiler.load_const(Const::None);
        }
        compiler.code.emit(Opcode::ReturnValue);
        compiler.finish()
    }

    /// Class bodies run with a fresh locals dict and return it.
    fn compile_class_body(&mut self, child: ScopeId, body: &[NodeLoc]) -> Result<Arc<Code>, CompileError> {
        let mut compiler = self.child_compiler(child);
        let qualname = compiler.tree.get(child).qualname().to_owned();

        compiler.emit_name_op(Opcode::LoadName, "__name__");
        compiler.emit_name_op(Opcode::StoreName, "__module__");
        compiler.load_const(Const::Str(Arc::from(qualname)));
        compiler.emit_name_op(Opcode::StoreName, "__qualname__");
        compiler.compile_body(body)?;

        if compiler.tree.get(child).needs_class_cell() {
            let index = compiler.deref_index(CLASS_CELL, body.last().map_or(0, |n| n.line))?;
            compiler.code.emit_arg(Opcode::LoadClosure, index);
            compiler.emit_name_op(Opcode::StoreName, "__classcell__");
        }
        compiler.code.emit(Opcode::LoadLocals);
        compiler.code.emit(Opcode::ReturnValue);
        compiler.finish()
    }

    /// Pushes a function object for `code` built from the child scope `child`.
    ///
    /// Stack on entry holds `ndefaults` positional defaults followed by `nkwdefaults`
    /// keyword-only (name, value) pairs, already evaluated in this scope.
    fn make_function(
        &mut self,
        child: ScopeId,
        code: Arc<Code>,
        ndefaults: usize,
        nkwdefaults: usize,
        line: u32,
    ) -> Result<(), CompileError> {
        if ndefaults > MAX_PACKED_COUNT || nkwdefaults > MAX_PACKED_COUNT {
            return Err(CompileError::new("too many default values", line));
        }
        let free = code.freevars().to_vec();
        if !free.is_empty() {
            for name in &free {
                let index = self.deref_index(name, line)?;
                self.code.emit_arg(Opcode::LoadClosure, index);
            }
            self.code.emit_arg(Opcode::BuildTuple, free.len() as u32);
        }
        let qualname = self.tree.get(child).qualname().to_owned();
        self.load_const(Const::Code(code));
        self.load_const(Const::Str(Arc::from(qualname)));
        let arg = (ndefaults | (nkwdefaults << 8)) as u32;
        let op = if free.is_empty() {
            Opcode::MakeFunction
        } else {
            Opcode::MakeClosure
        };
        self.code.emit_arg(op, arg);
        Ok(())
    }

    /// Evaluates default values in this scope; returns (positional, keyword-only) counts.
    fn compile_defaults(&mut self, params: &Parameters) -> Result<(usize, usize), CompileError> {
        let mut ndefaults = 0;
        for param in &params.args {
            if let Some(default) = &param.default {
                self.compile_expr(default)?;
                ndefaults += 1;
            }
        }
        let mut nkwdefaults = 0;
        for param in &params.kwonly {
            if let Some(default) = &param.default {
                self.load_const(Const::Str(Arc::from(param.name.as_str())));
                self.compile_expr(default)?;
                nkwdefaults += 1;
            }
        }
        Ok((ndefaults, nkwdefaults))
    }

    fn compile_function_def(&mut self, def: &FunctionDef, line: u32) -> Result<(), CompileError> {
        let (ndefaults, nkwdefaults) = self.compile_defaults(&def.params)?;
        let child = self.take_child(&def.name, line)?;
        let code = self.compile_function_body(child, &def.body)?;
        self.set_line(line);
        self.make_function(child, code, ndefaults, nkwdefaults, line)?;
        self.compile_name(&def.name, Access::Store);
        Ok(())
    }

    fn compile_class_def(&mut self, def: &ClassDef, line: u32) -> Result<(), CompileError> {
        self.code.emit(Opcode::LoadBuildClass);
        let child = self.take_child(&def.name, line)?;
        let code = self.compile_class_body(child, &def.body)?;
        self.set_line(line);
        self.make_function(child, code, 0, 0, line)?;
        self.load_const(Const::Str(Arc::from(def.name.as_str())));
        for base in &def.bases {
            self.compile_expr(base)?;
        }
        self.emit_call(2 + def.bases.len(), 0, line)?;
        self.compile_name(&def.name, Access::Store);
        Ok(())
    }

    // ========================================================================
    // Statements
    // ========================================================================

    fn compile_body(&mut self, body: &[NodeLoc]) -> Result<(), CompileError> {
        body.iter().try_for_each(|stmt| self.compile_stmt(stmt))
    }

    fn compile_stmt(&mut self, stmt: &NodeLoc) -> Result<(), CompileError> {
        let line = stmt.line;
        self.set_line(line);
        match &stmt.node {
            Node::Expr(expr) => {
                self.compile_expr(expr)?;
                self.code.emit(Opcode::PopTop);
            }
            Node::Assign { targets, value } => {
                self.compile_expr(value)?;
                for (i, target) in targets.iter().enumerate() {
                    if i + 1 < targets.len() {
                        self.code.emit(Opcode::DupTop);
                    }
                    self.compile_store(target, line)?;
                }
            }
            Node::AugAssign { target, op, value } => self.compile_aug_assign(target, *op, value, line)?,
            Node::Delete(targets) => {
                for target in targets {
                    self.compile_delete(target)?;
                }
            }
            Node::Return(value) => {
                match value {
                    Some(value) => self.compile_expr(value)?,
                    None => self.load_const(Const::None),
                }
                self.code.emit(Opcode::ReturnValue);
            }
            Node::If { test, body, or_else } => self.compile_if(test, body, or_else)?,
            Node::While { test, body, or_else } => self.compile_while(test, body, or_else)?,
            Node::For {
                target,
                iter,
                body,
                or_else,
            } => self.compile_for(target, iter, body, or_else, line)?,
            Node::Break => {
                if !self.blocks.iter().any(|b| matches!(b, CompileBlock::Loop { .. })) {
                    return Err(CompileError::new("'break' outside loop", line));
                }
                self.code.emit(Opcode::BreakLoop);
            }
            Node::Continue => self.compile_continue(line)?,
            Node::Pass | Node::Global(_) | Node::Nonlocal(_) => {}
            Node::Raise(exc) => match exc {
                Some(exc) => {
                    self.compile_expr(exc)?;
                    self.code.emit_arg(Opcode::RaiseVarargs, 1);
                }
                None => self.code.emit_arg(Opcode::RaiseVarargs, 0),
            },
            Node::Try(try_) => self.compile_try(try_, line)?,
            Node::With { items, body } => self.compile_with(items, body, line)?,
            Node::Assert { test, msg } => {
                let end = self.code.new_block();
                self.compile_expr(test)?;
                self.code.emit_jump(Opcode::PopJumpIfTrue, end);
                self.emit_name_op(Opcode::LoadGlobal, "AssertionError");
                if let Some(msg) = msg {
                    self.compile_expr(msg)?;
                    self.emit_call(1, 0, line)?;
                }
                self.code.emit_arg(Opcode::RaiseVarargs, 1);
                self.code.use_next_block(end);
            }
            Node::FunctionDef(def) => self.compile_function_def(def, line)?,
            Node::ClassDef(def) => self.compile_class_def(def, line)?,
        }
        Ok(())
    }

    fn compile_if(&mut self, test: &ExprLoc, body: &[NodeLoc], or_else: &[NodeLoc]) -> Result<(), CompileError> {
        if let Some(truth) = constant_truth(test) {
            let (live, dead) = if truth { (body, or_else) } else { (or_else, body) };
            self.compile_dead(dead)?;
            return self.compile_body(live);
        }
        let end = self.code.new_block();
        let else_block = if or_else.is_empty() {
            end
        } else {
            self.code.new_block()
        };
        self.compile_expr(test)?;
        self.code.emit_jump(Opcode::PopJumpIfFalse, else_block);
        self.compile_body(body)?;
        if !or_else.is_empty() {
            self.code.emit_jump(Opcode::JumpForward, end);
            self.code.use_next_block(else_block);
            self.compile_body(or_else)?;
        }
        self.code.use_next_block(end);
        Ok(())
    }

    /// Generates code that can never run, outside the block chain.
    fn compile_dead(&mut self, body: &[NodeLoc]) -> Result<(), CompileError> {
        if body.is_empty() {
            return Ok(());
        }
        let saved = self.code.detach();
        let line = self.line;
        let result = self.compile_body(body);
        self.code.reattach(saved);
        self.line = line;
        self.code.set_lineno(line);
        result
    }

    fn compile_while(&mut self, test: &ExprLoc, body: &[NodeLoc], or_else: &[NodeLoc]) -> Result<(), CompileError> {
        let truth = constant_truth(test);
        if truth == Some(false) {
            self.compile_dead(body)?;
            return self.compile_body(or_else);
        }
        let end = self.code.new_block();
        let anchor = self.code.new_block();
        self.code.emit_jump(Opcode::SetupLoop, end);
        let start = self.code.next_block();
        if truth.is_none() {
            self.compile_expr(test)?;
            self.code.emit_jump(Opcode::PopJumpIfFalse, anchor);
        }
        self.blocks.push(CompileBlock::Loop { start });
        self.compile_body(body)?;
        self.blocks.pop();
        self.code.emit_jump(Opcode::JumpAbsolute, start);
        self.code.use_next_block(anchor);
        self.code.emit(Opcode::PopBlock);
        self.compile_body(or_else)?;
        self.code.use_next_block(end);
        Ok(())
    }

    fn compile_for(
        &mut self,
        target: &Target,
        iter: &ExprLoc,
        body: &[NodeLoc],
        or_else: &[NodeLoc],
        line: u32,
    ) -> Result<(), CompileError> {
        let end = self.code.new_block();
        let cleanup = self.code.new_block();
        self.code.emit_jump(Opcode::SetupLoop, end);
        self.compile_expr(iter)?;
        self.code.emit(Opcode::GetIter);
        let start = self.code.next_block();
        self.code.emit_jump(Opcode::ForIter, cleanup);
        self.compile_store(target, line)?;
        self.blocks.push(CompileBlock::Loop { start });
        self.compile_body(body)?;
        self.blocks.pop();
        self.code.emit_jump(Opcode::JumpAbsolute, start);
        self.code.use_next_block(cleanup);
        self.code.emit(Opcode::PopBlock);
        self.compile_body(or_else)?;
        self.code.use_next_block(end);
        Ok(())
    }

    /// A `continue` directly inside the loop body is a plain jump; from inside a `try`,
    /// `with` or handler the runtime blocks in between must be unwound first.
    fn compile_continue(&mut self, line: u32) -> Result<(), CompileError> {
        let Some(innermost) = self.blocks.last().copied() else {
            return Err(CompileError::new("'continue' not properly in loop", line));
        };
        if let CompileBlock::Loop { start } = innermost {
            self.code.emit_jump(Opcode::JumpAbsolute, start);
            return Ok(());
        }
        for block in self.blocks.iter().rev() {
            match *block {
                CompileBlock::Loop { start } => {
                    self.code.emit_jump(Opcode::ContinueLoop, start);
                    return Ok(());
                }
                CompileBlock::FinallyEnd => {
                    return Err(CompileError::new(
                        "'continue' not supported inside 'finally' clause",
                        line,
                    ));
                }
                CompileBlock::Except | CompileBlock::FinallyTry | CompileBlock::ExceptHandler => {}
            }
        }
        Err(CompileError::new("'continue' not properly in loop", line))
    }

    fn compile_try(&mut self, try_: &Try, line: u32) -> Result<(), CompileError> {
        if try_.finally.is_empty() {
            return self.compile_try_except(try_, line);
        }
        let finally = self.code.new_block();
        self.code.emit_jump(Opcode::SetupFinally, finally);
        self.blocks.push(CompileBlock::FinallyTry);
        if try_.handlers.is_empty() {
            self.compile_body(&try_.body)?;
        } else {
            self.compile_try_except(try_, line)?;
        }
        self.code.emit(Opcode::PopBlock);
        self.blocks.pop();
        self.load_const(Const::None);

        self.code.use_next_block(finally);
        self.blocks.push(CompileBlock::FinallyEnd);
        self.compile_body(&try_.finally)?;
        self.code.emit(Opcode::EndFinally);
        self.blocks.pop();
        Ok(())
    }

    /// Layout:
    ///
    /// ```text
    ///     SETUP_EXCEPT handlers
    ///     <body>
    ///     POP_BLOCK
    ///     JUMP_FORWARD orelse
    /// handlers:                      [exc]
    ///     DUP_TOP; <type>; COMPARE_OP exception-match
    ///     POP_JUMP_IF_FALSE next
    ///     <bind or pop exc>; <handler body>; POP_EXCEPT
    ///     JUMP_FORWARD end
    /// next:
    ///     ...
    ///     END_FINALLY                 re-raise when nothing matched
    /// orelse:
    ///     <else body>
    /// end:
    /// ```
    fn compile_try_except(&mut self, try_: &Try, line: u32) -> Result<(), CompileError> {
        let handlers_block = self.code.new_block();
        let orelse = self.code.new_block();
        let end = self.code.new_block();

        self.code.emit_jump(Opcode::SetupExcept, handlers_block);
        self.blocks.push(CompileBlock::Except);
        self.compile_body(&try_.body)?;
        self.blocks.pop();
        self.code.emit(Opcode::PopBlock);
        self.code.emit_jump(Opcode::JumpForward, orelse);

        self.code.use_next_block(handlers_block);
        let mut caught_all = false;
        for (i, handler) in try_.handlers.iter().enumerate() {
            self.set_line(handler.line);
            let next = self.code.new_block();
            match &handler.exc_type {
                Some(exc_type) => {
                    self.code.emit(Opcode::DupTop);
                    self.compile_expr(exc_type)?;
                    self.code.emit_arg(Opcode::CompareOp, CompareKind::ExcMatch as u32);
                    self.code.emit_jump(Opcode::PopJumpIfFalse, next);
                }
                None => {
                    if i + 1 != try_.handlers.len() {
                        return Err(CompileError::new("default 'except:' must be last", handler.line));
                    }
                    caught_all = true;
                }
            }

            self.blocks.push(CompileBlock::ExceptHandler);
            if let Some(name) = &handler.name {
                // The name is cleared even when the handler body exits abruptly.
                let cleanup = self.code.new_block();
                self.compile_name(name, Access::Store);
                self.code.emit_jump(Opcode::SetupFinally, cleanup);
                self.blocks.push(CompileBlock::FinallyTry);
                self.compile_body(&handler.body)?;
                self.blocks.pop();
                self.code.emit(Opcode::PopBlock);
                self.code.emit(Opcode::PopExcept);
                self.load_const(Const::None);

                self.code.use_next_block(cleanup);
                self.blocks.push(CompileBlock::FinallyEnd);
                self.load_const(Const::None);
                self.compile_name(name, Access::Store);
                self.compile_name(name, Access::Delete);
                self.code.emit(Opcode::EndFinally);
                self.blocks.pop();
            } else {
                self.code.emit(Opcode::PopTop);
                self.compile_body(&handler.body)?;
                self.code.emit(Opcode::PopExcept);
            }
            self.blocks.pop();
            self.code.emit_jump(Opcode::JumpForward, end);
            self.code.use_next_block(next);
        }
        if !caught_all {
            self.set_line(line);
            self.code.emit(Opcode::EndFinally);
        }
        self.code.use_next_block(orelse);
        self.compile_body(&try_.or_else)?;
        self.code.use_next_block(end);
        Ok(())
    }

    fn compile_with(&mut self, items: &[WithItem], body: &[NodeLoc], line: u32) -> Result<(), CompileError> {
        let Some((item, rest)) = items.split_first() else {
            return self.compile_body(body);
        };
        let cleanup = self.code.new_block();
        self.compile_expr(&item.context)?;
        self.set_line(line);
        self.code.emit_jump(Opcode::SetupWith, cleanup);
        self.blocks.push(CompileBlock::FinallyTry);
        match &item.target {
            Some(target) => self.compile_store(target, line)?,
            None => self.code.emit(Opcode::PopTop),
        }
        if rest.is_empty() {
            self.compile_body(body)?;
        } else {
            self.compile_with(rest, body, line)?;
        }
        self.code.emit(Opcode::PopBlock);
        self.blocks.pop();
        self.load_const(Const::None);

        self.code.use_next_block(cleanup);
        self.blocks.push(CompileBlock::FinallyEnd);
        self.code.emit(Opcode::WithCleanup);
        self.code.emit(Opcode::EndFinally);
        self.blocks.pop();
        Ok(())
    }

    fn compile_aug_assign(&mut self, target: &Target, op: Operator, value: &ExprLoc, line: u32) -> Result<(), CompileError> {
        let inplace = inplace_opcode(op);
        match target {
            Target::Name(name) => {
                self.compile_name(name, Access::Load);
                self.compile_expr(value)?;
                self.code.emit(inplace);
                self.compile_name(name, Access::Store);
            }
            Target::Attr { object, attr } => {
                self.compile_expr(object)?;
                self.code.emit(Opcode::DupTop);
                self.emit_name_op(Opcode::LoadAttr, attr);
                self.compile_expr(value)?;
                self.code.emit(inplace);
                self.code.emit(Opcode::RotTwo);
                self.emit_name_op(Opcode::StoreAttr, attr);
            }
            Target::Subscript { object, index } => {
                self.compile_expr(object)?;
                self.compile_expr(index)?;
                self.code.emit(Opcode::DupTopTwo);
                self.code.emit(Opcode::BinarySubscr);
                self.compile_expr(value)?;
                self.code.emit(inplace);
                self.code.emit(Opcode::RotThree);
                self.code.emit(Opcode::StoreSubscr);
            }
            Target::Unpack(_) => {
                return Err(CompileError::new("illegal expression for augmented assignment", line));
            }
        }
        Ok(())
    }

    /// Stores TOS into `target`.
    fn compile_store(&mut self, target: &Target, line: u32) -> Result<(), CompileError> {
        match target {
            Target::Name(name) => self.compile_name(name, Access::Store),
            Target::Attr { object, attr } => {
                self.compile_expr(object)?;
                self.emit_name_op(Opcode::StoreAttr, attr);
            }
            Target::Subscript { object, index } => {
                self.compile_expr(object)?;
                self.compile_expr(index)?;
                self.code.emit(Opcode::StoreSubscr);
            }
            Target::Unpack(targets) => {
                self.code.emit_arg(Opcode::UnpackSequence, targets.len() as u32);
                for target in targets {
                    self.compile_store(target, line)?;
                }
            }
        }
        Ok(())
    }

    fn compile_delete(&mut self, target: &Target) -> Result<(), CompileError> {
        match target {
            Target::Name(name) => self.compile_name(name, Access::Delete),
            Target::Attr { object, attr } => {
                self.compile_expr(object)?;
                self.emit_name_op(Opcode::DeleteAttr, attr);
            }
            Target::Subscript { object, index } => {
                self.compile_expr(object)?;
                self.compile_expr(index)?;
                self.code.emit(Opcode::DeleteSubscr);
            }
            Target::Unpack(targets) => {
                for target in targets {
                    self.compile_delete(target)?;
                }
            }
        }
        Ok(())
    }

    // ========================================================================
    // Names
    // ========================================================================

    /// Emits the load/store/delete of `name` from the storage its classification implies.
    fn compile_name(&mut self, name: &str, access: Access) {
        let info = self.tree.get(self.scope);
        let kind = info.name_kind(name);
        let scope_kind = info.kind();

        let (op, arg) = match (scope_kind.is_function_like(), kind) {
            (_, NameKind::GlobalExplicit) | (true, NameKind::GlobalImplicit) => {
                let op = match access {
                    Access::Load => Opcode::LoadGlobal,
                    Access::Store => Opcode::StoreGlobal,
                    Access::Delete => Opcode::DeleteGlobal,
                };
                (op, self.code.name_index(name))
            }
            (true, NameKind::Local) => {
                let op = match access {
                    Access::Load => Opcode::LoadFast,
                    Access::Store => Opcode::StoreFast,
                    Access::Delete => Opcode::DeleteFast,
                };
                (op, self.code.varname_index(name))
            }
            (_, NameKind::Cell | NameKind::Free) if scope_kind != ScopeKind::Module => {
                let op = match access {
                    Access::Load if scope_kind == ScopeKind::Class => Opcode::LoadClassDeref,
                    Access::Load => Opcode::LoadDeref,
                    Access::Store => Opcode::StoreDeref,
                    Access::Delete => Opcode::DeleteDeref,
                };
                // Classification and the cell pools come from the same scope, so the
                // lookup only fails on a resolver bug; fall back to the dict form.
                match self.code.deref_index(name) {
                    Some(index) => (op, index),
                    None => (name_opcode(access), self.code.name_index(name)),
                }
            }
            _ => (name_opcode(access), self.code.name_index(name)),
        };
        self.code.emit_arg(op, arg);
    }

    /// Emits an opcode whose operand indexes the names pool.
    fn emit_name_op(&mut self, op: Opcode, name: &str) {
        let index = self.code.name_index(name);
        self.code.emit_arg(op, index);
    }

    fn deref_index(&self, name: &str, line: u32) -> Result<u32, CompileError> {
        self.code
            .deref_index(name)
            .ok_or_else(|| CompileError::new(format!("internal error: no cell for '{name}'"), line))
    }

    fn load_const(&mut self, value: Const) {
        let index = self.code.const_index(value);
        self.code.emit_arg(Opcode::LoadConst, index);
    }

    fn emit_call(&mut self, npos: usize, nkw: usize, line: u32) -> Result<(), CompileError> {
        if npos > MAX_PACKED_COUNT || nkw > MAX_PACKED_COUNT {
            return Err(CompileError::new("more than 255 arguments", line));
        }
        self.code.emit_arg(Opcode::CallFunction, (npos | (nkw << 8)) as u32);
        Ok(())
    }

    // ========================================================================
    // Expressions
    // ========================================================================

    fn compile_expr(&mut self, expr: &ExprLoc) -> Result<(), CompileError> {
        self.set_line(expr.line);
        match &expr.expr {
            Expr::Literal(literal) => self.load_const(literal_const(literal)),
            Expr::Name(name) => self.compile_name(name, Access::Load),
            Expr::BinOp { left, op, right } => {
                self.compile_expr(left)?;
                self.compile_expr(right)?;
                self.code.emit(binary_opcode(*op));
            }
            Expr::UnaryOp { op, operand } => {
                self.compile_expr(operand)?;
                self.code.emit(match op {
                    UnaryOperator::Not => Opcode::UnaryNot,
                    UnaryOperator::Neg => Opcode::UnaryNegative,
                    UnaryOperator::Pos => Opcode::UnaryPositive,
                    UnaryOperator::Invert => Opcode::UnaryInvert,
                });
            }
            Expr::BoolOp { op, values } => {
                let end = self.code.new_block();
                let jump = match op {
                    BoolOperator::And => Opcode::JumpIfFalseOrPop,
                    BoolOperator::Or => Opcode::JumpIfTrueOrPop,
                };
                if let Some((last, rest)) = values.split_last() {
                    for value in rest {
                        self.compile_expr(value)?;
                        self.code.emit_jump(jump, end);
                    }
                    self.compile_expr(last)?;
                }
                self.code.use_next_block(end);
            }
            Expr::Compare { left, ops } => self.compile_compare(left, ops)?,
            Expr::Call { func, args, keywords } => self.compile_call(expr, func, args, keywords)?,
            Expr::Attribute { object, attr } => {
                self.compile_expr(object)?;
                self.emit_name_op(Opcode::LoadAttr, attr);
            }
            Expr::Subscript { object, index } => {
                self.compile_expr(object)?;
                self.compile_expr(index)?;
                self.code.emit(Opcode::BinarySubscr);
            }
            Expr::IfElse { test, body, orelse } => {
                let else_block = self.code.new_block();
                let end = self.code.new_block();
                self.compile_expr(test)?;
                self.code.emit_jump(Opcode::PopJumpIfFalse, else_block);
                self.compile_expr(body)?;
                self.code.emit_jump(Opcode::JumpForward, end);
                self.code.use_next_block(else_block);
                self.compile_expr(orelse)?;
                self.code.use_next_block(end);
            }
            Expr::Lambda { params, body } => {
                let (ndefaults, nkwdefaults) = self.compile_defaults(params)?;
                let child = self.take_child("<lambda>", expr.line)?;
                let code = self.compile_lambda_body(child, body)?;
                self.make_function(child, code, ndefaults, nkwdefaults, expr.line)?;
            }
            Expr::Tuple(items) => self.compile_sequence(items, Opcode::BuildTuple)?,
            Expr::List(items) => self.compile_sequence(items, Opcode::BuildList)?,
            Expr::Set(items) => self.compile_sequence(items, Opcode::BuildSet)?,
            Expr::Dict(items) => {
                self.code.emit_arg(Opcode::BuildMap, items.len().min(usize::from(u16::MAX)) as u32);
                for (key, value) in items {
                    self.compile_expr(key)?;
                    self.compile_expr(value)?;
                    self.code.emit(Opcode::StoreMap);
                }
            }
            Expr::Yield(value) => {
                match value {
                    Some(value) => self.compile_expr(value)?,
                    None => self.load_const(Const::None),
                }
                self.code.emit(Opcode::YieldValue);
            }
            Expr::Comprehension(comp) => self.compile_comprehension(comp, expr.line)?,
        }
        Ok(())
    }

    fn compile_sequence(&mut self, items: &[ExprLoc], build: Opcode) -> Result<(), CompileError> {
        for item in items {
            self.compile_expr(item)?;
        }
        self.code.emit_arg(build, items.len() as u32);
        Ok(())
    }

    /// `a < b < c` evaluates `b` once and stops at the first false comparison.
    fn compile_compare(&mut self, left: &ExprLoc, ops: &[(CmpOperator, ExprLoc)]) -> Result<(), CompileError> {
        self.compile_expr(left)?;
        let Some(((last_op, last), rest)) = ops.split_last() else {
            return Ok(());
        };
        if rest.is_empty() {
            self.compile_expr(last)?;
            self.code.emit_arg(Opcode::CompareOp, compare_kind(*last_op) as u32);
            return Ok(());
        }
        let cleanup = self.code.new_block();
        let end = self.code.new_block();
        for (op, right) in rest {
            self.compile_expr(right)?;
            self.code.emit(Opcode::DupTop);
            self.code.emit(Opcode::RotThree);
            self.code.emit_arg(Opcode::CompareOp, compare_kind(*op) as u32);
            self.code.emit_jump(Opcode::JumpIfFalseOrPop, cleanup);
        }
        self.compile_expr(last)?;
        self.code.emit_arg(Opcode::CompareOp, compare_kind(*last_op) as u32);
        self.code.emit_jump(Opcode::JumpForward, end);
        self.code.use_next_block(cleanup);
        self.code.emit(Opcode::RotTwo);
        self.code.emit(Opcode::PopTop);
        self.code.use_next_block(end);
        Ok(())
    }

    fn compile_call(
        &mut self,
        call: &ExprLoc,
        func: &ExprLoc,
        args: &[ExprLoc],
        keywords: &[Keyword],
    ) -> Result<(), CompileError> {
        if call.expr.is_zero_arg_super() && self.compile_zero_arg_super(func, call.line)? {
            return Ok(());
        }
        self.compile_expr(func)?;
        for arg in args {
            self.compile_expr(arg)?;
        }
        for keyword in keywords {
            self.load_const(Const::Str(Arc::from(keyword.name.as_str())));
            self.compile_expr(&keyword.value)?;
        }
        self.set_line(call.line);
        self.emit_call(args.len(), keywords.len(), call.line)
    }

    /// `super()` inside a method becomes `super(__class__, <first argument>)`.
    ///
    /// Returns false when the implicit arguments are unavailable, leaving a plain call
    /// that fails at run time.
    fn compile_zero_arg_super(&mut self, func: &ExprLoc, line: u32) -> Result<bool, CompileError> {
        let info = self.tree.get(self.scope);
        let Some(first) = info.params().first().cloned() else {
            return Ok(false);
        };
        if !info.kind().is_function_like() || info.lookup(CLASS_CELL) != Some(NameKind::Free) {
            return Ok(false);
        }
        self.compile_expr(func)?;
        let index = self.deref_index(CLASS_CELL, line)?;
        self.code.emit_arg(Opcode::LoadDeref, index);
        self.compile_name(&first, Access::Load);
        self.emit_call(2, 0, line)?;
        Ok(true)
    }

    /// Comprehensions run as a nested function called with the iterator of the first
    /// `for` clause, which is evaluated here in the enclosing scope.
    fn compile_comprehension(&mut self, comp: &Comprehension, line: u32) -> Result<(), CompileError> {
        let Some(first) = comp.generators.first() else {
            return Err(CompileError::new("comprehension without a for clause", line));
        };
        let child = self.take_child(comprehension_name(comp.kind), line)?;
        let mut compiler = self.child_compiler(child);
        match comp.kind {
            ComprehensionKind::List => compiler.code.emit_arg(Opcode::BuildList, 0),
            ComprehensionKind::Set => compiler.code.emit_arg(Opcode::BuildSet, 0),
            ComprehensionKind::Dict => compiler.code.emit_arg(Opcode::BuildMap, 0),
            ComprehensionKind::Generator => {}
        }
        compiler.compile_comprehension_generator(comp, 0, line)?;
        if comp.kind == ComprehensionKind::Generator {
            compiler.load_const(Const::None);
        }
        compiler.code.emit(Opcode::ReturnValue);
        let code = compiler.finish()?;

        self.set_line(line);
        self.make_function(child, code, 0, 0, line)?;
        self.compile_expr(&first.iter)?;
        self.code.emit(Opcode::GetIter);
        self.emit_call(1, 0, line)
    }

    fn compile_comprehension_generator(
        &mut self,
        comp: &Comprehension,
        index: usize,
        line: u32,
    ) -> Result<(), CompileError> {
        let generator = &comp.generators[index];
        let start = self.code.new_block();
        let anchor = self.code.new_block();

        if index == 0 {
            let slot = self.code.varname_index(COMPREHENSION_ARG);
            self.code.emit_arg(Opcode::LoadFast, slot);
        } else {
            self.compile_expr(&generator.iter)?;
            self.code.emit(Opcode::GetIter);
        }
        self.code.use_next_block(start);
        self.code.emit_jump(Opcode::ForIter, anchor);
        self.compile_store(&generator.target, line)?;
        for cond in &generator.ifs {
            self.compile_expr(cond)?;
            self.code.emit_jump(Opcode::PopJumpIfFalse, start);
        }

        if index + 1 < comp.generators.len() {
            self.compile_comprehension_generator(comp, index + 1, line)?;
        } else {
            // The container sits below one iterator per `for` clause.
            let depth = (comp.generators.len() + 1) as u32;
            match comp.kind {
                ComprehensionKind::List => {
                    self.compile_expr(&comp.element)?;
                    self.code.emit_arg(Opcode::ListAppend, depth);
                }
                ComprehensionKind::Set => {
                    self.compile_expr(&comp.element)?;
                    self.code.emit_arg(Opcode::SetAdd, depth);
                }
                ComprehensionKind::Dict => {
                    self.compile_expr(&comp.element)?;
                    match &comp.value {
                        Some(value) => self.compile_expr(value)?,
                        None => return Err(CompileError::new("dict comprehension without a value", line)),
                    }
                    self.code.emit_arg(Opcode::MapAdd, depth);
                }
                ComprehensionKind::Generator => {
                    self.compile_expr(&comp.element)?;
                    self.code.emit(Opcode::YieldValue);
                    self.code.emit(Opcode::PopTop);
                }
            }
        }
        self.code.emit_jump(Opcode::JumpAbsolute, start);
        self.code.use_next_block(anchor);
        Ok(())
    }
}

/// Truthiness of a literal test, used to drop branches that can never run.
fn constant_truth(test: &ExprLoc) -> Option<bool> {
    match &test.expr {
        Expr::Literal(Literal::None) => Some(false),
        Expr::Literal(Literal::Bool(b)) => Some(*b),
        Expr::Literal(Literal::Int(i)) => Some(*i != 0),
        Expr::Literal(Literal::Str(s)) => Some(!s.is_empty()),
        _ => None,
    }
}

fn literal_const(literal: &Literal) -> Const {
    match literal {
        Literal::None => Const::None,
        Literal::Bool(b) => Const::Bool(*b),
        Literal::Int(i) => Const::Int(*i),
        Literal::Float(f) => Const::Float(*f),
        Literal::Str(s) => Const::Str(Arc::from(s.as_str())),
        Literal::Ellipsis => Const::Ellipsis,
    }
}

fn name_opcode(access: Access) -> Opcode {
    match access {
        Access::Load => Opcode::LoadName,
        Access::Store => Opcode::StoreName,
        Access::Delete => Opcode::DeleteName,
    }
}

fn binary_opcode(op: Operator) -> Opcode {
    match op {
        Operator::Add => Opcode::BinaryAdd,
        Operator::Sub => Opcode::BinarySubtract,
        Operator::Mult => Opcode::BinaryMultiply,
        Operator::Div => Opcode::BinaryTrueDivide,
        Operator::FloorDiv => Opcode::BinaryFloorDivide,
        Operator::Mod => Opcode::BinaryModulo,
        Operator::Pow => Opcode::BinaryPower,
        Operator::LShift => Opcode::BinaryLshift,
        Operator::RShift => Opcode::BinaryRshift,
        Operator::BitOr => Opcode::BinaryOr,
        Operator::BitXor => Opcode::BinaryXor,
        Operator::BitAnd => Opcode::BinaryAnd,
    }
}

fn inplace_opcode(op: Operator) -> Opcode {
    match op {
        Operator::Add => Opcode::InplaceAdd,
        Operator::Sub => Opcode::InplaceSubtract,
        Operator::Mult => Opcode::InplaceMultiply,
        Operator::Div => Opcode::InplaceTrueDivide,
        Operator::FloorDiv => Opcode::InplaceFloorDivide,
        Operator::Mod => Opcode::InplaceModulo,
        Operator::Pow => Opcode::InplacePower,
        Operator::LShift => Opcode::InplaceLshift,
        Operator::RShift => Opcode::InplaceRshift,
        Operator::BitOr => Opcode::InplaceOr,
        Operator::BitXor => Opcode::InplaceXor,
        Operator::BitAnd => Opcode::InplaceAnd,
    }
}

fn compare_kind(op: CmpOperator) -> CompareKind {
    match op {
        CmpOperator::Eq => CompareKind::Eq,
        CmpOperator::NotEq => CompareKind::Ne,
        CmpOperator::Lt => CompareKind::Lt,
        CmpOperator::LtE => CompareKind::Le,
        CmpOperator::Gt => CompareKind::Gt,
        CmpOperator::GtE => CompareKind::Ge,
        CmpOperator::Is => CompareKind::Is,
        CmpOperator::IsNot => CompareKind::IsNot,
        CmpOperator::In => CompareKind::In,
        CmpOperator::NotIn => CompareKind::NotIn,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::Param;

    fn stmt(node: Node) -> NodeLoc {
        NodeLoc::new(1, node)
    }

    fn name(n: &str) -> ExprLoc {
        ExprLoc::new(1, Expr::Name(n.to_owned()))
    }

    fn int(i: i64) -> ExprLoc {
        ExprLoc::new(1, Expr::Literal(Literal::Int(i)))
    }

    fn call(func: &str, args: Vec<ExprLoc>) -> ExprLoc {
        ExprLoc::new(
            1,
            Expr::Call {
                func: Box::new(name(func)),
                args,
                keywords: vec![],
            },
        )
    }

    fn assign(n: &str, value: ExprLoc) -> NodeLoc {
        stmt(Node::Assign {
            targets: vec![Target::Name(n.to_owned())],
            value,
        })
    }

    fn opcodes(code: &Code) -> Vec<Opcode> {
        code.instructions().map(|i| i.unwrap().opcode).collect()
    }

    fn nested<'c>(code: &'c Code, name: &str) -> &'c Code {
        code.consts()
            .iter()
            .find_map(|c| match c {
                Const::Code(code) if code.name() == name => Some(code.as_ref()),
                _ => None,
            })
            .unwrap()
    }

    #[test]
    fn module_names_use_dict_ops() {
        // x = 1; print(x)
        let module = Module::new(vec![assign("x", int(1)), stmt(Node::Expr(call("print", vec![name("x")])))]);
        let code = compile(&module, "<test>").unwrap();
        assert_eq!(
            opcodes(&code),
            vec![
                Opcode::LoadConst,
                Opcode::StoreName,
                Opcode::LoadName,
                Opcode::LoadName,
                Opcode::CallFunction,
                Opcode::ReturnValue,
            ]
        );
    }

    #[test]
    fn closure_uses_cells() {
        let inner = FunctionDef {
            name: "g".to_owned(),
            params: Parameters::default(),
            body: vec![stmt(Node::Return(Some(name("x"))))],
        };
        let outer = FunctionDef {
            name: "f".to_owned(),
            params: Parameters::default(),
            body: vec![
                assign("x", int(1)),
                stmt(Node::FunctionDef(inner)),
                stmt(Node::Return(Some(name("g")))),
            ],
        };
        let module = Module::new(vec![stmt(Node::FunctionDef(outer))]);
        let code = compile(&module, "<test>").unwrap();
        let f = nested(&code, "f");
        assert_eq!(f.cellvars(), ["x"]);
        assert!(opcodes(f).contains(&Opcode::StoreDeref));
        assert!(opcodes(f).contains(&Opcode::MakeClosure));
        let g = nested(f, "g");
        assert_eq!(g.freevars(), ["x"]);
        assert_eq!(opcodes(g), vec![Opcode::LoadDeref, Opcode::ReturnValue, Opcode::LoadConst, Opcode::ReturnValue]);
        assert!(g.flags().contains(CodeFlags::NESTED));
    }

    #[test]
    fn break_outside_loop_is_rejected() {
        let module = Module::new(vec![NodeLoc::new(3, Node::Break)]);
        let err = compile(&module, "<test>").unwrap_err();
        assert_eq!(err.message(), "'break' outside loop");
        assert_eq!(err.line(), 3);
    }

    #[test]
    fn continue_in_finally_is_rejected() {
        let body = vec![stmt(Node::Try(Try {
            body: vec![stmt(Node::Pass)],
            handlers: vec![],
            or_else: vec![],
            finally: vec![stmt(Node::Continue)],
        }))];
        let module = Module::new(vec![stmt(Node::While {
            test: name("x"),
            body,
            or_else: vec![],
        })]);
        let err = compile(&module, "<test>").unwrap_err();
        assert_eq!(err.message(), "'continue' not supported inside 'finally' clause");
    }

    #[test]
    fn continue_inside_try_unwinds() {
        let body = vec![stmt(Node::Try(Try {
            body: vec![stmt(Node::Continue)],
            handlers: vec![],
            or_else: vec![],
            finally: vec![stmt(Node::Pass)],
        }))];
        let module = Module::new(vec![stmt(Node::For {
            target: Target::Name("i".to_owned()),
            iter: name("xs"),
            body,
            or_else: vec![],
        })]);
        let code = compile(&module, "<test>").unwrap();
        assert!(opcodes(&code).contains(&Opcode::ContinueLoop));
    }

    #[test]
    fn constant_false_branch_is_dropped() {
        let module = Module::new(vec![stmt(Node::If {
            test: ExprLoc::new(1, Expr::Literal(Literal::Bool(false))),
            body: vec![stmt(Node::Expr(call("boom", vec![])))],
            or_else: vec![assign("y", int(2))],
        })]);
        let code = compile(&module, "<test>").unwrap();
        assert_eq!(
            opcodes(&code),
            vec![Opcode::LoadConst, Opcode::StoreName, Opcode::LoadConst, Opcode::ReturnValue]
        );
    }

    #[test]
    fn dead_branch_still_consumes_its_scopes() {
        let dead_def = FunctionDef {
            name: "dead".to_owned(),
            params: Parameters::default(),
            body: vec![],
        };
        let live_def = FunctionDef {
            name: "live".to_owned(),
            params: Parameters::default(),
            body: vec![],
        };
        let module = Module::new(vec![
            stmt(Node::If {
                test: ExprLoc::new(1, Expr::Literal(Literal::None)),
                body: vec![stmt(Node::FunctionDef(dead_def))],
                or_else: vec![],
            }),
            stmt(Node::FunctionDef(live_def)),
        ]);
        let code = compile(&module, "<test>").unwrap();
        nested(&code, "live");
    }

    #[test]
    fn function_flags_and_signature() {
        let def = FunctionDef {
            name: "f".to_owned(),
            params: Parameters {
                args: vec![Param::new("a")],
                vararg: Some("rest".to_owned()),
                kwonly: vec![],
                kwarg: Some("kw".to_owned()),
            },
            body: vec![stmt(Node::Expr(ExprLoc::new(1, Expr::Yield(None))))],
        };
        let module = Module::new(vec![stmt(Node::FunctionDef(def))]);
        let code = compile(&module, "<test>").unwrap();
        let f = nested(&code, "f");
        let flags = f.flags();
        assert!(flags.contains(CodeFlags::OPTIMIZED | CodeFlags::NEWLOCALS));
        assert!(flags.contains(CodeFlags::VARARGS | CodeFlags::VARKEYWORDS | CodeFlags::GENERATOR));
        assert!(flags.contains(CodeFlags::NOFREE));
        assert_eq!(f.argcount(), 1);
        assert_eq!(f.varnames(), ["a", "rest", "kw"]);
    }

    #[test]
    fn compiling_twice_is_deterministic() {
        let def = FunctionDef {
            name: "f".to_owned(),
            params: Parameters {
                args: vec![Param::new("n")],
                ..Parameters::default()
            },
            body: vec![stmt(Node::For {
                target: Target::Name("i".to_owned()),
                iter: call("range", vec![name("n")]),
                body: vec![stmt(Node::AugAssign {
                    target: Target::Name("n".to_owned()),
                    op: Operator::Add,
                    value: name("i"),
                })],
                or_else: vec![],
            })],
        };
        let module = Module::new(vec![stmt(Node::FunctionDef(def))]);
        let a = compile(&module, "<test>").unwrap();
        let b = compile(&module, "<test>").unwrap();
        assert_eq!(nested(&a, "f").bytecode(), nested(&b, "f").bytecode());
        assert_eq!(nested(&a, "f").disassemble(), nested(&b, "f").disassemble());
    }

    #[test]
    fn chained_comparison_depth() {
        // 1 < x < 3
        let expr = ExprLoc::new(
            1,
            Expr::Compare {
                left: Box::new(int(1)),
                ops: vec![(CmpOperator::Lt, name("x")), (CmpOperator::Lt, int(3))],
            },
        );
        let module = Module::new(vec![stmt(Node::Expr(expr))]);
        let code = compile(&module, "<test>").unwrap();
        assert_eq!(code.stack_size(), 3);
        assert!(opcodes(&code).contains(&Opcode::RotThree));
    }
}
