//! Scope resolution: decides where every name lives before any code is generated.
//!
//! Two passes over the syntax tree:
//!
//! 1. The collector walks the tree once, creating one [`Scope`] per module, function,
//!    lambda, class body and comprehension, and recording raw binding flags for every
//!    name (used, assigned, parameter, declared `global`/`nonlocal`).
//! 2. The resolver walks the resulting scope tree top-down carrying the set of names bound
//!    by enclosing function scopes, classifies each name, and bubbles free names back up
//!    so that the defining scope promotes them to cells.
//!
//! The compiler consumes child scopes in exactly the order the collector created them,
//! so both walks must visit nested scopes in the same order: default values before the
//! function they belong to, a class body before its bases, a comprehension before the
//! iterable of its first `for` clause.

use ahash::AHashSet;
use indexmap::IndexMap;

use crate::{
    ast::{
        ClassDef, Comprehension, ComprehensionKind, Expr, ExprLoc, FunctionDef, Module, Node, NodeLoc, Parameters,
        Target, Try,
    },
    exception::CompileError,
};

/// Name of the implicit cell that holds the class being defined, captured by methods that
/// call zero-argument `super()`.
pub(crate) const CLASS_CELL: &str = "@__class__";

/// Parameter holding the outer iterator of a comprehension.
pub(crate) const COMPREHENSION_ARG: &str = ".0";

const USE: u8 = 1;
const ASSIGN: u8 = 1 << 1;
const PARAM: u8 = 1 << 2;
const GLOBAL: u8 = 1 << 3;
const NONLOCAL: u8 = 1 << 4;

/// Identifies a scope inside a [`ScopeTree`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ScopeId(usize);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScopeKind {
    Module,
    Function,
    Class,
    Lambda,
    Comprehension,
}

impl ScopeKind {
    /// Function-like scopes get fast locals and can own cells.
    #[must_use]
    pub fn is_function_like(self) -> bool {
        matches!(self, Self::Function | Self::Lambda | Self::Comprehension)
    }
}

/// Where a name lives at run time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NameKind {
    /// A fast slot in function scopes, the locals dict in module and class scopes.
    Local,
    /// A local captured by a nested scope; stored in a cell owned by this scope.
    Cell,
    /// A variable of an enclosing function scope, reached through a cell.
    Free,
    /// Declared `global` in this scope.
    GlobalExplicit,
    /// Never bound in this or any enclosing function scope.
    GlobalImplicit,
}

/// One lexical scope.
#[derive(Debug, Clone)]
pub struct Scope {
    name: String,
    qualname: String,
    kind: ScopeKind,
    line: u32,
    parent: Option<ScopeId>,
    children: Vec<ScopeId>,
    /// Raw binding flags recorded by the collector, in first-seen order.
    flags: IndexMap<String, u8>,
    /// Line of each `nonlocal` declaration, for error reporting.
    nonlocal_lines: IndexMap<String, u32>,
    /// Filled in by the resolver.
    names: IndexMap<String, NameKind>,
    /// Parameter names in slot order: positional, keyword-only, `*args`, `**kwargs`.
    params: Vec<String>,
    argcount: u32,
    kwonlyargcount: u32,
    has_varargs: bool,
    has_varkeywords: bool,
    /// Fast-local names: parameters first, then the remaining locals in first-seen order.
    varnames: Vec<String>,
    cellvars: Vec<String>,
    freevars: Vec<String>,
    is_generator: bool,
    /// The class body owns the `@__class__` cell because some method needs it.
    needs_class_cell: bool,
    return_value_line: Option<u32>,
    yield_line: Option<u32>,
}

impl Scope {
    fn new(name: String, qualname: String, kind: ScopeKind, line: u32, parent: Option<ScopeId>) -> Self {
        Self {
            name,
            qualname,
            kind,
            line,
            parent,
            children: Vec::new(),
            flags: IndexMap::new(),
            nonlocal_lines: IndexMap::new(),
            names: IndexMap::new(),
            params: Vec::new(),
            argcount: 0,
            kwonlyargcount: 0,
            has_varargs: false,
            has_varkeywords: false,
            varnames: Vec::new(),
            cellvars: Vec::new(),
            freevars: Vec::new(),
            is_generator: false,
            needs_class_cell: false,
            return_value_line: None,
            yield_line: None,
        }
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Dotted path used in reprs and tracebacks, e.g. `Outer.method.<locals>.inner`.
    #[must_use]
    pub fn qualname(&self) -> &str {
        &self.qualname
    }

    #[must_use]
    pub fn kind(&self) -> ScopeKind {
        self.kind
    }

    #[must_use]
    pub fn line(&self) -> u32 {
        self.line
    }

    #[must_use]
    pub fn parent(&self) -> Option<ScopeId> {
        self.parent
    }

    #[must_use]
    pub fn children(&self) -> &[ScopeId] {
        &self.children
    }

    /// Classification of `name`, `None` if the scope never mentions it.
    #[must_use]
    pub fn lookup(&self, name: &str) -> Option<NameKind> {
        self.names.get(name).copied()
    }

    /// Classification of `name`, treating unknown names as implicit globals.
    #[must_use]
    pub fn name_kind(&self, name: &str) -> NameKind {
        self.lookup(name).unwrap_or(NameKind::GlobalImplicit)
    }

    /// Every classified name in first-seen order.
    pub fn names(&self) -> impl Iterator<Item = (&str, NameKind)> {
        self.names.iter().map(|(name, kind)| (name.as_str(), *kind))
    }

    #[must_use]
    pub fn params(&self) -> &[String] {
        &self.params
    }

    #[must_use]
    pub fn argcount(&self) -> u32 {
        self.argcount
    }

    #[must_use]
    pub fn kwonlyargcount(&self) -> u32 {
        self.kwonlyargcount
    }

    #[must_use]
    pub fn has_varargs(&self) -> bool {
        self.has_varargs
    }

    #[must_use]
    pub fn has_varkeywords(&self) -> bool {
        self.has_varkeywords
    }

    #[must_use]
    pub fn varnames(&self) -> &[String] {
        &self.varnames
    }

    /// Sorted.
    #[must_use]
    pub fn cellvars(&self) -> &[String] {
        &self.cellvars
    }

    /// Sorted.
    #[must_use]
    pub fn freevars(&self) -> &[String] {
        &self.freevars
    }

    #[must_use]
    pub fn is_generator(&self) -> bool {
        self.is_generator
    }

    #[must_use]
    pub fn needs_class_cell(&self) -> bool {
        self.needs_class_cell
    }

    fn note(&mut self, name: &str, flag: u8) {
        *self.flags.entry(name.to_owned()).or_default() |= flag;
    }

    fn has_flag(&self, name: &str, flag: u8) -> bool {
        self.flags.get(name).is_some_and(|f| f & flag != 0)
    }
}

/// The scopes of one module, rooted at the module scope.
///
/// Immutable once [`analyze`] returns.
#[derive(Debug, Clone)]
pub struct ScopeTree {
    scopes: Vec<Scope>,
}

impl ScopeTree {
    #[must_use]
    pub fn root(&self) -> ScopeId {
        ScopeId(0)
    }

    #[must_use]
    pub fn get(&self, id: ScopeId) -> &Scope {
        &self.scopes[id.0]
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.scopes.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.scopes.is_empty()
    }

    /// Finds the first scope (in creation order) with the given name.
    #[must_use]
    pub fn find(&self, name: &str) -> Option<&Scope> {
        self.scopes.iter().find(|s| s.name == name)
    }
}

/// Builds and resolves the scope tree of `module`.
///
/// Fails with the first scoping error found; no partial tree is returned.
pub fn analyze(module: &Module) -> Result<ScopeTree, CompileError> {
    let mut collector = Collector {
        scopes: vec![Scope::new(
            "<module>".to_owned(),
            "<module>".to_owned(),
            ScopeKind::Module,
            1,
            None,
        )],
        current: ScopeId(0),
    };
    collector.visit_body(&module.body)?;

    let mut tree = ScopeTree {
        scopes: collector.scopes,
    };
    tree.resolve(ScopeId(0), &AHashSet::new())?;
    Ok(tree)
}

// ============================================================================
// Pass 1: collect raw bindings
// ============================================================================

struct Collector {
    scopes: Vec<Scope>,
    current: ScopeId,
}

impl Collector {
    fn scope(&mut self) -> &mut Scope {
        &mut self.scopes[self.current.0]
    }

    fn note(&mut self, name: &str, flag: u8) {
        self.scope().note(name, flag);
    }

    /// Opens a child of the current scope and makes it current; returns the parent.
    fn enter(&mut self, name: &str, kind: ScopeKind, line: u32) -> ScopeId {
        let parent = self.current;
        let parent_scope = &self.scopes[parent.0];
        let qualname = match parent_scope.kind {
            ScopeKind::Module => name.to_owned(),
            ScopeKind::Class => format!("{}.{name}", parent_scope.qualname),
            _ => format!("{}.<locals>.{name}", parent_scope.qualname),
        };
        let id = ScopeId(self.scopes.len());
        self.scopes
            .push(Scope::new(name.to_owned(), qualname, kind, line, Some(parent)));
        self.scopes[parent.0].children.push(id);
        self.current = id;
        parent
    }

    /// Closes the current scope, checking generator constraints.
    fn leave(&mut self, parent: ScopeId) -> Result<(), CompileError> {
        let scope = self.scope();
        if scope.yield_line.is_some() {
            scope.is_generator = true;
            if let Some(line) = scope.return_value_line {
                return Err(CompileError::new("'return' with value in generator", line));
            }
        }
        self.current = parent;
        Ok(())
    }

    fn visit_body(&mut self, body: &[NodeLoc]) -> Result<(), CompileError> {
        body.iter().try_for_each(|stmt| self.visit_stmt(stmt))
    }

    fn visit_stmt(&mut self, stmt: &NodeLoc) -> Result<(), CompileError> {
        let line = stmt.line;
        match &stmt.node {
            Node::Expr(expr) => self.visit_expr(expr)?,
            Node::Assign { targets, value } => {
                self.visit_expr(value)?;
                for target in targets {
                    self.visit_target(target, ASSIGN)?;
                }
            }
            Node::AugAssign { target, value, .. } => {
                self.visit_target(target, USE | ASSIGN)?;
                self.visit_expr(value)?;
            }
            Node::Delete(targets) => {
                for target in targets {
                    self.visit_target(target, ASSIGN)?;
                }
            }
            Node::Return(value) => {
                if !self.scope().kind.is_function_like() {
                    return Err(CompileError::new("'return' outside function", line));
                }
                if let Some(value) = value {
                    self.visit_expr(value)?;
                    let scope = self.scope();
                    scope.return_value_line.get_or_insert(line);
                }
            }
            Node::If { test, body, or_else } | Node::While { test, body, or_else } => {
                self.visit_expr(test)?;
                self.visit_body(body)?;
                self.visit_body(or_else)?;
            }
            Node::For {
                target,
                iter,
                body,
                or_else,
            } => {
                self.visit_expr(iter)?;
                self.visit_target(target, ASSIGN)?;
                self.visit_body(body)?;
                self.visit_body(or_else)?;
            }
            Node::Break | Node::Continue | Node::Pass => {}
            Node::Raise(exc) => {
                if let Some(exc) = exc {
                    self.visit_expr(exc)?;
                }
            }
            Node::Try(try_) => self.visit_try(try_)?,
            Node::With { items, body } => {
                for item in items {
                    self.visit_expr(&item.context)?;
                    if let Some(target) = &item.target {
                        self.visit_target(target, ASSIGN)?;
                    }
                }
                self.visit_body(body)?;
            }
            Node::Assert { test, msg } => {
                self.visit_expr(test)?;
                if let Some(msg) = msg {
                    self.visit_expr(msg)?;
                }
            }
            Node::Global(names) => {
                for name in names {
                    if self.scope().has_flag(name, PARAM) {
                        return Err(CompileError::new(format!("name '{name}' is parameter and global"), line));
                    }
                    if self.scope().has_flag(name, NONLOCAL) {
                        return Err(CompileError::new(format!("name '{name}' is nonlocal and global"), line));
                    }
                    self.note(name, GLOBAL);
                }
            }
            Node::Nonlocal(names) => {
                if self.scope().kind == ScopeKind::Module {
                    return Err(CompileError::new("nonlocal declaration not allowed at module level", line));
                }
                for name in names {
                    if self.scope().has_flag(name, PARAM) {
                        return Err(CompileError::new(
                            format!("name '{name}' is parameter and nonlocal"),
                            line,
                        ));
                    }
                    if self.scope().has_flag(name, GLOBAL) {
                        return Err(CompileError::new(format!("name '{name}' is nonlocal and global"), line));
                    }
                    self.note(name, NONLOCAL);
                    self.scope().nonlocal_lines.entry(name.clone()).or_insert(line);
                }
            }
            Node::FunctionDef(def) => self.visit_function_def(def, line)?,
            Node::ClassDef(def) => self.visit_class_def(def, line)?,
        }
        Ok(())
    }

    fn visit_try(&mut self, try_: &Try) -> Result<(), CompileError> {
        self.visit_body(&try_.body)?;
        for handler in &try_.handlers {
            if let Some(exc_type) = &handler.exc_type {
                self.visit_expr(exc_type)?;
            }
            if let Some(name) = &handler.name {
                self.note(name, ASSIGN);
            }
            self.visit_body(&handler.body)?;
        }
        self.visit_body(&try_.or_else)?;
        self.visit_body(&try_.finally)
    }

    fn visit_function_def(&mut self, def: &FunctionDef, line: u32) -> Result<(), CompileError> {
        for default in def.params.defaults() {
            self.visit_expr(default)?;
        }
        let parent = self.enter(&def.name, ScopeKind::Function, line);
        self.declare_params(&def.params, line)?;
        self.visit_body(&def.body)?;
        self.leave(parent)?;
        self.note(&def.name, ASSIGN);
        Ok(())
    }

    fn visit_class_def(&mut self, def: &ClassDef, line: u32) -> Result<(), CompileError> {
        let parent = self.enter(&def.name, ScopeKind::Class, line);
        self.visit_body(&def.body)?;
        self.leave(parent)?;
        for base in &def.bases {
            self.visit_expr(base)?;
        }
        self.note(&def.name, ASSIGN);
        Ok(())
    }

    fn declare_params(&mut self, params: &Parameters, line: u32) -> Result<(), CompileError> {
        for name in params.names() {
            if self.scope().has_flag(name, PARAM) {
                return Err(CompileError::new(
                    format!("duplicate argument '{name}' in function definition"),
                    line,
                ));
            }
            self.note(name, PARAM);
            self.scope().params.push(name.to_owned());
        }
        let scope = self.scope();
        scope.argcount = params.args.len() as u32;
        scope.kwonlyargcount = params.kwonly.len() as u32;
        scope.has_varargs = params.vararg.is_some();
        scope.has_varkeywords = params.kwarg.is_some();
        Ok(())
    }

    fn visit_target(&mut self, target: &Target, flag: u8) -> Result<(), CompileError> {
        match target {
            Target::Name(name) => self.note(name, flag),
            Target::Attr { object, .. } => self.visit_expr(object)?,
            Target::Subscript { object, index } => {
                self.visit_expr(object)?;
                self.visit_expr(index)?;
            }
            Target::Unpack(targets) => {
                for target in targets {
                    self.visit_target(target, flag)?;
                }
            }
        }
        Ok(())
    }

    fn visit_expr(&mut self, expr: &ExprLoc) -> Result<(), CompileError> {
        match &expr.expr {
            Expr::Literal(_) => {}
            Expr::Name(name) => self.note(name, USE),
            Expr::BinOp { left, right, .. } => {
                self.visit_expr(left)?;
                self.visit_expr(right)?;
            }
            Expr::UnaryOp { operand, .. } => self.visit_expr(operand)?,
            Expr::BoolOp { values, .. } | Expr::Tuple(values) | Expr::List(values) | Expr::Set(values) => {
                for value in values {
                    self.visit_expr(value)?;
                }
            }
            Expr::Compare { left, ops } => {
                self.visit_expr(left)?;
                for (_, right) in ops {
                    self.visit_expr(right)?;
                }
            }
            Expr::Call { func, args, keywords } => {
                if expr.expr.is_zero_arg_super() && self.scope().kind.is_function_like() {
                    self.note(CLASS_CELL, USE);
                }
                self.visit_expr(func)?;
                for arg in args {
                    self.visit_expr(arg)?;
                }
                for keyword in keywords {
                    self.visit_expr(&keyword.value)?;
                }
            }
            Expr::Attribute { object, .. } => self.visit_expr(object)?,
            Expr::Subscript { object, index } => {
                self.visit_expr(object)?;
                self.visit_expr(index)?;
            }
            Expr::IfElse { test, body, orelse } => {
                self.visit_expr(test)?;
                self.visit_expr(body)?;
                self.visit_expr(orelse)?;
            }
            Expr::Lambda { params, body } => {
                for default in params.defaults() {
                    self.visit_expr(default)?;
                }
                let parent = self.enter("<lambda>", ScopeKind::Lambda, expr.line);
                self.declare_params(params, expr.line)?;
                self.visit_expr(body)?;
                self.leave(parent)?;
            }
            Expr::Dict(items) => {
                for (key, value) in items {
                    self.visit_expr(key)?;
                    self.visit_expr(value)?;
                }
            }
            Expr::Yield(value) => {
                match self.scope().kind {
                    ScopeKind::Function | ScopeKind::Lambda => {}
                    ScopeKind::Comprehension => {
                        return Err(CompileError::new("'yield' inside comprehension", expr.line));
                    }
                    ScopeKind::Module | ScopeKind::Class => {
                        return Err(CompileError::new("'yield' outside function", expr.line));
                    }
                }
                self.scope().yield_line.get_or_insert(expr.line);
                if let Some(value) = value {
                    self.visit_expr(value)?;
                }
            }
            Expr::Comprehension(comp) => self.visit_comprehension(comp, expr.line)?,
        }
        Ok(())
    }

    /// The first iterable is evaluated in the enclosing scope and handed to the
    /// comprehension's code as its single argument; everything else runs inside.
    fn visit_comprehension(&mut self, comp: &Comprehension, line: u32) -> Result<(), CompileError> {
        let Some((first, rest)) = comp.generators.split_first() else {
            return Err(CompileError::new("comprehension without a for clause", line));
        };
        let parent = self.enter(comprehension_name(comp.kind), ScopeKind::Comprehension, line);
        self.note(COMPREHENSION_ARG, PARAM);
        let scope = self.scope();
        scope.params.push(COMPREHENSION_ARG.to_owned());
        scope.argcount = 1;
        if comp.kind == ComprehensionKind::Generator {
            scope.yield_line = Some(line);
        }

        self.visit_target(&first.target, ASSIGN)?;
        for cond in &first.ifs {
            self.visit_expr(cond)?;
        }
        for generator in rest {
            self.visit_expr(&generator.iter)?;
            self.visit_target(&generator.target, ASSIGN)?;
            for cond in &generator.ifs {
                self.visit_expr(cond)?;
            }
        }
        self.visit_expr(&comp.element)?;
        if let Some(value) = &comp.value {
            self.visit_expr(value)?;
        }
        self.leave(parent)?;

        self.visit_expr(&first.iter)
    }
}

pub(crate) fn comprehension_name(kind: ComprehensionKind) -> &'static str {
    match kind {
        ComprehensionKind::List => "<listcomp>",
        ComprehensionKind::Set => "<setcomp>",
        ComprehensionKind::Dict => "<dictcomp>",
        ComprehensionKind::Generator => "<genexpr>",
    }
}

// ============================================================================
// Pass 2: classify names
// ============================================================================

impl ScopeTree {
    /// Classifies the names of `id` given the names `bound` by enclosing function scopes.
    ///
    /// Returns the names this scope (or any descendant) needs from its enclosing scopes.
    fn resolve(&mut self, id: ScopeId, bound: &AHashSet<String>) -> Result<AHashSet<String>, CompileError> {
        let scope = &self.scopes[id.0];
        let kind = scope.kind;

        let mut names = IndexMap::with_capacity(scope.flags.len());
        let mut free: AHashSet<String> = AHashSet::new();
        for (name, &flags) in &scope.flags {
            let name_kind = if flags & GLOBAL != 0 {
                NameKind::GlobalExplicit
            } else if flags & NONLOCAL != 0 {
                if !bound.contains(name) {
                    let line = scope.nonlocal_lines.get(name).copied().unwrap_or(scope.line);
                    return Err(CompileError::new(format!("no binding for nonlocal '{name}' found"), line));
                }
                NameKind::Free
            } else if flags & (ASSIGN | PARAM) != 0 {
                NameKind::Local
            } else if bound.contains(name) {
                NameKind::Free
            } else {
                NameKind::GlobalImplicit
            };
            if name_kind == NameKind::Free {
                free.insert(name.clone());
            }
            names.insert(name.clone(), name_kind);
        }

        let child_bound: AHashSet<String> = match kind {
            ScopeKind::Module => bound.clone(),
            ScopeKind::Class => {
                let mut b: AHashSet<String> = bound
                    .iter()
                    .filter(|n| names.get(*n) != Some(&NameKind::GlobalExplicit))
                    .cloned()
                    .collect();
                b.insert(CLASS_CELL.to_owned());
                b
            }
            _ => bound
                .iter()
                .cloned()
                .chain(
                    names
                        .iter()
                        .filter(|(_, k)| **k == NameKind::Local)
                        .map(|(n, _)| n.clone()),
                )
                .filter(|n| names.get(n) != Some(&NameKind::GlobalExplicit))
                .collect(),
        };

        let mut pass_through: AHashSet<String> = AHashSet::new();
        let mut needs_class_cell = false;
        for child in self.scopes[id.0].children.clone() {
            for name in self.resolve(child, &child_bound)? {
                match names.get(&name) {
                    Some(NameKind::Local) if kind.is_function_like() => {
                        names.insert(name, NameKind::Cell);
                    }
                    Some(NameKind::Cell) => {}
                    _ if kind == ScopeKind::Class && name == CLASS_CELL => needs_class_cell = true,
                    _ => {
                        pass_through.insert(name);
                    }
                }
            }
        }

        let scope = &mut self.scopes[id.0];
        if kind.is_function_like() {
            let mut varnames = scope.params.clone();
            varnames.extend(
                names
                    .iter()
                    .filter(|(n, k)| **k == NameKind::Local && !scope.params.contains(*n))
                    .map(|(n, _)| n.clone()),
            );
            scope.varnames = varnames;
        }

        let mut cellvars: Vec<String> = names
            .iter()
            .filter(|(_, k)| **k == NameKind::Cell)
            .map(|(n, _)| n.clone())
            .collect();
        if needs_class_cell {
            cellvars.push(CLASS_CELL.to_owned());
        }
        cellvars.sort();

        free.extend(pass_through);
        let mut freevars: Vec<String> = free.iter().cloned().collect();
        freevars.sort();

        scope.names = names;
        scope.cellvars = cellvars;
        scope.freevars = freevars;
        scope.needs_class_cell = needs_class_cell;
        Ok(free)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::{Keyword, Literal, Param};

    fn line(node: Node) -> NodeLoc {
        NodeLoc::new(1, node)
    }

    fn name(n: &str) -> ExprLoc {
        ExprLoc::new(1, Expr::Name(n.to_owned()))
    }

    fn int(i: i64) -> ExprLoc {
        ExprLoc::new(1, Expr::Literal(Literal::Int(i)))
    }

    fn assign(n: &str, value: ExprLoc) -> NodeLoc {
        line(Node::Assign {
            targets: vec![Target::Name(n.to_owned())],
            value,
        })
    }

    fn def(n: &str, params: &[&str], body: Vec<NodeLoc>) -> NodeLoc {
        line(Node::FunctionDef(FunctionDef {
            name: n.to_owned(),
            params: Parameters {
                args: params.iter().map(|p| Param::new(*p)).collect(),
                ..Parameters::default()
            },
            body,
        }))
    }

    fn ret(value: ExprLoc) -> NodeLoc {
        line(Node::Return(Some(value)))
    }

    #[test]
    fn closure_promotes_cell() {
        // def f():
        //     x = 1
        //     def g(): return x
        //     return g
        let module = Module::new(vec![def(
            "f",
            &[],
            vec![assign("x", int(1)), def("g", &[], vec![ret(name("x"))]), ret(name("g"))],
        )]);
        let tree = analyze(&module).unwrap();
        let f = tree.find("f").unwrap();
        let g = tree.find("g").unwrap();
        assert_eq!(f.lookup("x"), Some(NameKind::Cell));
        assert_eq!(f.lookup("g"), Some(NameKind::Local));
        assert_eq!(f.cellvars(), ["x"]);
        assert_eq!(f.varnames(), ["g"]);
        assert_eq!(g.lookup("x"), Some(NameKind::Free));
        assert_eq!(g.freevars(), ["x"]);
        assert_eq!(g.qualname(), "f.<locals>.g");
    }

    #[test]
    fn module_names_are_not_captured() {
        let module = Module::new(vec![assign("x", int(1)), def("g", &[], vec![ret(name("x"))])]);
        let tree = analyze(&module).unwrap();
        assert_eq!(tree.get(tree.root()).lookup("x"), Some(NameKind::Local));
        assert_eq!(tree.find("g").unwrap().lookup("x"), Some(NameKind::GlobalImplicit));
    }

    #[test]
    fn free_variable_passes_through_intermediate_scope() {
        // def a(): x = 1; def b(): def c(): return x
        let module = Module::new(vec![def(
            "a",
            &[],
            vec![
                assign("x", int(1)),
                def("b", &[], vec![def("c", &[], vec![ret(name("x"))])]),
            ],
        )]);
        let tree = analyze(&module).unwrap();
        assert_eq!(tree.find("a").unwrap().lookup("x"), Some(NameKind::Cell));
        assert_eq!(tree.find("b").unwrap().freevars(), ["x"]);
        assert_eq!(tree.find("b").unwrap().lookup("x"), None);
        assert_eq!(tree.find("c").unwrap().lookup("x"), Some(NameKind::Free));
    }

    #[test]
    fn class_bindings_are_skipped_by_methods() {
        // class C:
        //     y = 1
        //     def m(self): return y
        let module = Module::new(vec![line(Node::ClassDef(ClassDef {
            name: "C".to_owned(),
            bases: vec![],
            body: vec![assign("y", int(1)), def("m", &["self"], vec![ret(name("y"))])],
        }))]);
        let tree = analyze(&module).unwrap();
        let m = tree.find("m").unwrap();
        assert_eq!(m.lookup("y"), Some(NameKind::GlobalImplicit));
        assert_eq!(m.qualname(), "C.m");
    }

    #[test]
    fn zero_arg_super_captures_class_cell() {
        let call_super = ExprLoc::new(
            1,
            Expr::Call {
                func: Box::new(name("super")),
                args: vec![],
                keywords: vec![],
            },
        );
        let module = Module::new(vec![line(Node::ClassDef(ClassDef {
            name: "C".to_owned(),
            bases: vec![],
            body: vec![def("m", &["self"], vec![ret(call_super)])],
        }))]);
        let tree = analyze(&module).unwrap();
        let class = tree.find("C").unwrap();
        assert!(class.needs_class_cell());
        assert_eq!(class.cellvars(), [CLASS_CELL]);
        assert_eq!(tree.find("m").unwrap().lookup(CLASS_CELL), Some(NameKind::Free));
    }

    #[test]
    fn global_declaration_hides_local() {
        let module = Module::new(vec![def(
            "f",
            &[],
            vec![line(Node::Global(vec!["x".to_owned()])), assign("x", int(1))],
        )]);
        let tree = analyze(&module).unwrap();
        let f = tree.find("f").unwrap();
        assert_eq!(f.lookup("x"), Some(NameKind::GlobalExplicit));
        assert!(f.varnames().is_empty());
    }

    #[test]
    fn nonlocal_requires_enclosing_binding() {
        let module = Module::new(vec![def(
            "f",
            &[],
            vec![line(Node::Nonlocal(vec!["x".to_owned()])), assign("x", int(1))],
        )]);
        let err = analyze(&module).unwrap_err();
        assert_eq!(err.message(), "no binding for nonlocal 'x' found");

        let module = Module::new(vec![def(
            "f",
            &[],
            vec![
                assign("x", int(0)),
                def(
                    "g",
                    &[],
                    vec![line(Node::Nonlocal(vec!["x".to_owned()])), assign("x", int(1))],
                ),
            ],
        )]);
        let tree = analyze(&module).unwrap();
        assert_eq!(tree.find("f").unwrap().lookup("x"), Some(NameKind::Cell));
        assert_eq!(tree.find("g").unwrap().lookup("x"), Some(NameKind::Free));
    }

    #[test]
    fn misplaced_return_and_yield() {
        let module = Module::new(vec![ret(int(1))]);
        assert_eq!(analyze(&module).unwrap_err().message(), "'return' outside function");

        let module = Module::new(vec![line(Node::Expr(ExprLoc::new(1, Expr::Yield(None))))]);
        assert_eq!(analyze(&module).unwrap_err().message(), "'yield' outside function");
    }

    #[test]
    fn return_value_in_generator() {
        let module = Module::new(vec![def(
            "g",
            &[],
            vec![
                line(Node::Expr(ExprLoc::new(1, Expr::Yield(Some(Box::new(int(1))))))),
                NodeLoc::new(3, Node::Return(Some(int(2)))),
            ],
        )]);
        let err = analyze(&module).unwrap_err();
        assert_eq!(err.message(), "'return' with value in generator");
        assert_eq!(err.line(), 3);
    }

    #[test]
    fn duplicate_parameter() {
        let module = Module::new(vec![def("f", &["a", "a"], vec![])]);
        assert_eq!(
            analyze(&module).unwrap_err().message(),
            "duplicate argument 'a' in function definition"
        );
    }

    #[test]
    fn varnames_order_params_first() {
        let module = Module::new(vec![line(Node::FunctionDef(FunctionDef {
            name: "f".to_owned(),
            params: Parameters {
                args: vec![Param::new("a")],
                vararg: Some("rest".to_owned()),
                kwonly: vec![Param::new("k")],
                kwarg: Some("kw".to_owned()),
            },
            body: vec![assign("z", int(1))],
        }))]);
        let tree = analyze(&module).unwrap();
        let f = tree.find("f").unwrap();
        assert_eq!(f.varnames(), ["a", "k", "rest", "kw", "z"]);
        assert_eq!(f.argcount(), 1);
        assert_eq!(f.kwonlyargcount(), 1);
        assert!(f.has_varargs() && f.has_varkeywords());
    }

    #[test]
    fn comprehension_iterates_outer_argument() {
        // def f(xs, k): return [x + k for x in xs]
        let comp = Expr::Comprehension(Box::new(Comprehension {
            kind: ComprehensionKind::List,
            element: ExprLoc::new(
                1,
                Expr::BinOp {
                    left: Box::new(name("x")),
                    op: crate::ast::Operator::Add,
                    right: Box::new(name("k")),
                },
            ),
            value: None,
            generators: vec![crate::ast::ComprehensionFor {
                target: Target::Name("x".to_owned()),
                iter: name("xs"),
                ifs: vec![],
            }],
        }));
        let module = Module::new(vec![def("f", &["xs", "k"], vec![ret(ExprLoc::new(1, comp))])]);
        let tree = analyze(&module).unwrap();
        let f = tree.find("f").unwrap();
        assert_eq!(f.lookup("xs"), Some(NameKind::Local));
        assert_eq!(f.lookup("k"), Some(NameKind::Cell));
        let listcomp = tree.find("<listcomp>").unwrap();
        assert_eq!(listcomp.varnames(), [COMPREHENSION_ARG, "x"]);
        assert_eq!(listcomp.lookup("xs"), None);
        assert_eq!(listcomp.lookup("k"), Some(NameKind::Free));
    }

    #[test]
    fn keyword_values_are_uses() {
        let call = ExprLoc::new(
            1,
            Expr::Call {
                func: Box::new(name("f")),
                args: vec![],
                keywords: vec![Keyword {
                    name: "a".to_owned(),
                    value: name("v"),
                }],
            },
        );
        let module = Module::new(vec![line(Node::Expr(call))]);
        let tree = analyze(&module).unwrap();
        let root = tree.get(tree.root());
        assert_eq!(root.lookup("v"), Some(NameKind::GlobalImplicit));
        assert_eq!(root.lookup("a"), None);
    }
}
