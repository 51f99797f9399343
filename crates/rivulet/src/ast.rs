//! Syntax tree consumed by the scope resolver and the code generator.
//!
//! The front end (see `parse`) lowers its own AST into these types. Every statement
//! carries the source line it starts on; expressions carry their own line so that
//! errors raised while analysing a multi-line expression point at the right place.
//!
//! The tree is deliberately smaller than the full Python grammar: anything the
//! compiler cannot lower is rejected by the front end before it gets here.

/// A parsed module: the root of every compilation.
#[derive(Debug, Clone, Default)]
pub struct Module {
    pub body: Vec<NodeLoc>,
}

impl Module {
    #[must_use]
    pub fn new(body: Vec<NodeLoc>) -> Self {
        Self { body }
    }
}

/// A statement together with the line it starts on.
#[derive(Debug, Clone)]
pub struct NodeLoc {
    pub line: u32,
    pub node: Node,
}

impl NodeLoc {
    #[must_use]
    pub fn new(line: u32, node: Node) -> Self {
        Self { line, node }
    }
}

/// A statement.
#[derive(Debug, Clone)]
pub enum Node {
    /// Expression evaluated for its side effects.
    Expr(ExprLoc),
    /// `a = b = value`: every target receives the same value, left to right.
    Assign {
        targets: Vec<Target>,
        value: ExprLoc,
    },
    /// `target op= value`.
    AugAssign {
        target: Target,
        op: Operator,
        value: ExprLoc,
    },
    Delete(Vec<Target>),
    Return(Option<ExprLoc>),
    If {
        test: ExprLoc,
        body: Vec<NodeLoc>,
        or_else: Vec<NodeLoc>,
    },
    While {
        test: ExprLoc,
        body: Vec<NodeLoc>,
        or_else: Vec<NodeLoc>,
    },
    For {
        target: Target,
        iter: ExprLoc,
        body: Vec<NodeLoc>,
        or_else: Vec<NodeLoc>,
    },
    Break,
    Continue,
    Pass,
    /// `raise exc` or a bare `raise` (re-raise the exception being handled).
    Raise(Option<ExprLoc>),
    Try(Try),
    With {
        items: Vec<WithItem>,
        body: Vec<NodeLoc>,
    },
    Assert {
        test: ExprLoc,
        msg: Option<ExprLoc>,
    },
    Global(Vec<String>),
    Nonlocal(Vec<String>),
    FunctionDef(FunctionDef),
    ClassDef(ClassDef),
}

/// `try` statement with any combination of handlers, `else` and `finally`.
#[derive(Debug, Clone)]
pub struct Try {
    pub body: Vec<NodeLoc>,
    pub handlers: Vec<ExceptHandler>,
    pub or_else: Vec<NodeLoc>,
    pub finally: Vec<NodeLoc>,
}

/// One `except [type [as name]]:` clause.
#[derive(Debug, Clone)]
pub struct ExceptHandler {
    pub line: u32,
    /// `None` for a bare `except:`.
    pub exc_type: Option<ExprLoc>,
    pub name: Option<String>,
    pub body: Vec<NodeLoc>,
}

/// One `expr [as target]` item of a `with` statement.
#[derive(Debug, Clone)]
pub struct WithItem {
    pub context: ExprLoc,
    pub target: Option<Target>,
}

#[derive(Debug, Clone)]
pub struct FunctionDef {
    pub name: String,
    pub params: Parameters,
    pub body: Vec<NodeLoc>,
}

#[derive(Debug, Clone)]
pub struct ClassDef {
    pub name: String,
    pub bases: Vec<ExprLoc>,
    pub body: Vec<NodeLoc>,
}

/// A function or lambda signature.
///
/// Parameters are bound in this order: positional-or-keyword, `*args`, keyword-only, `**kwargs`.
#[derive(Debug, Clone, Default)]
pub struct Parameters {
    pub args: Vec<Param>,
    pub vararg: Option<String>,
    pub kwonly: Vec<Param>,
    pub kwarg: Option<String>,
}

impl Parameters {
    /// Iterates over every parameter name in slot order.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.args
            .iter()
            .map(|p| p.name.as_str())
            .chain(self.kwonly.iter().map(|p| p.name.as_str()))
            .chain(self.vararg.as_deref())
            .chain(self.kwarg.as_deref())
    }

    /// Iterates over default expressions: positional defaults first, then keyword-only ones.
    pub fn defaults(&self) -> impl Iterator<Item = &ExprLoc> {
        self.args
            .iter()
            .chain(&self.kwonly)
            .filter_map(|p| p.default.as_ref())
    }
}

#[derive(Debug, Clone)]
pub struct Param {
    pub name: String,
    pub default: Option<ExprLoc>,
}

impl Param {
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            default: None,
        }
    }
}

/// Assignment, deletion and loop targets.
#[derive(Debug, Clone)]
pub enum Target {
    Name(String),
    Attr { object: Box<ExprLoc>, attr: String },
    Subscript { object: Box<ExprLoc>, index: Box<ExprLoc> },
    /// Tuple or list unpacking: `a, (b, c) = ...`.
    Unpack(Vec<Target>),
}

/// An expression with the line it starts on.
#[derive(Debug, Clone)]
pub struct ExprLoc {
    pub line: u32,
    pub expr: Expr,
}

impl ExprLoc {
    #[must_use]
    pub fn new(line: u32, expr: Expr) -> Self {
        Self { line, expr }
    }
}

#[derive(Debug, Clone)]
pub enum Expr {
    Literal(Literal),
    Name(String),
    BinOp {
        left: Box<ExprLoc>,
        op: Operator,
        right: Box<ExprLoc>,
    },
    UnaryOp {
        op: UnaryOperator,
        operand: Box<ExprLoc>,
    },
    /// `a and b and c`: short-circuits left to right.
    BoolOp {
        op: BoolOperator,
        values: Vec<ExprLoc>,
    },
    /// `a < b <= c`: each comparator is evaluated at most once.
    Compare {
        left: Box<ExprLoc>,
        ops: Vec<(CmpOperator, ExprLoc)>,
    },
    Call {
        func: Box<ExprLoc>,
        args: Vec<ExprLoc>,
        keywords: Vec<Keyword>,
    },
    Attribute {
        object: Box<ExprLoc>,
        attr: String,
    },
    Subscript {
        object: Box<ExprLoc>,
        index: Box<ExprLoc>,
    },
    /// `body if test else orelse`.
    IfElse {
        test: Box<ExprLoc>,
        body: Box<ExprLoc>,
        orelse: Box<ExprLoc>,
    },
    Lambda {
        params: Box<Parameters>,
        body: Box<ExprLoc>,
    },
    Tuple(Vec<ExprLoc>),
    List(Vec<ExprLoc>),
    Set(Vec<ExprLoc>),
    Dict(Vec<(ExprLoc, ExprLoc)>),
    Yield(Option<Box<ExprLoc>>),
    Comprehension(Box<Comprehension>),
}

impl Expr {
    /// Whether this expression is a call of the bare name `super` with no arguments.
    #[must_use]
    pub fn is_zero_arg_super(&self) -> bool {
        matches!(
            self,
            Self::Call { func, args, keywords }
                if args.is_empty() && keywords.is_empty() && matches!(&func.expr, Self::Name(n) if n == "super")
        )
    }
}

#[derive(Debug, Clone)]
pub struct Keyword {
    pub name: String,
    pub value: ExprLoc,
}

/// List/set/dict comprehension or generator expression.
#[derive(Debug, Clone)]
pub struct Comprehension {
    pub kind: ComprehensionKind,
    /// The element (or the key, for dict comprehensions).
    pub element: ExprLoc,
    /// The value expression of a dict comprehension.
    pub value: Option<ExprLoc>,
    pub generators: Vec<ComprehensionFor>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ComprehensionKind {
    List,
    Set,
    Dict,
    Generator,
}

/// One `for target in iter if cond...` clause of a comprehension.
#[derive(Debug, Clone)]
pub struct ComprehensionFor {
    pub target: Target,
    pub iter: ExprLoc,
    pub ifs: Vec<ExprLoc>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Literal {
    None,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    Ellipsis,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operator {
    Add,
    Sub,
    Mult,
    Div,
    FloorDiv,
    Mod,
    Pow,
    LShift,
    RShift,
    BitOr,
    BitXor,
    BitAnd,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryOperator {
    Not,
    Neg,
    Pos,
    Invert,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BoolOperator {
    And,
    Or,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CmpOperator {
    Eq,
    NotEq,
    Lt,
    LtE,
    Gt,
    GtE,
    Is,
    IsNot,
    In,
    NotIn,
}
