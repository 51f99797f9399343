//! Front end: source text to the [`ast`](crate::ast) tree via `rustpython-parser`.
//!
//! Lowering is total over the supported subset and fails with a [`ParseError`] naming
//! the first construct the compiler cannot handle, so nothing unsupported reaches the
//! scope resolver.

use std::borrow::Cow;

use num_bigint::BigInt;
use num_traits::ToPrimitive;
use rustpython_parser::ast::{
    Arguments, Boolop, Cmpop, Comprehension as AstComprehension, Constant, Excepthandler, ExcepthandlerKind,
    Expr as AstExpr, ExprKind, Keyword as AstKeyword, Operator as AstOperator, Stmt, StmtKind, Unaryop, Withitem,
};
use rustpython_parser::parser::parse_program;

use crate::ast::{
    BoolOperator, ClassDef, CmpOperator, Comprehension, ComprehensionFor, ComprehensionKind, ExceptHandler, Expr,
    ExprLoc, FunctionDef, Keyword, Literal, Module, Node, NodeLoc, Operator, Param, Parameters, Target, Try,
    UnaryOperator, WithItem,
};

/// Source that failed to parse, or used syntax outside the supported subset.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("SyntaxError: {message} (line {line})")]
pub struct ParseError {
    message: Cow<'static, str>,
    line: u32,
}

impl ParseError {
    fn new(message: impl Into<Cow<'static, str>>, line: u32) -> Self {
        Self {
            message: message.into(),
            line,
        }
    }

    fn unsupported(what: &str, line: u32) -> Self {
        Self::new(format!("{what} is not supported"), line)
    }

    #[must_use]
    pub fn message(&self) -> &str {
        &self.message
    }

    #[must_use]
    pub fn line(&self) -> u32 {
        self.line
    }
}

type ParseResult<T> = Result<T, ParseError>;

/// Parses a module.
///
/// ```
/// let module = rivulet::parse("x = 1\nx + 1\n", "example.py").unwrap();
/// assert_eq!(module.body.len(), 2);
/// ```
pub fn parse(source: &str, filename: &str) -> ParseResult<Module> {
    let program = parse_program(source, filename)
        .map_err(|err| ParseError::new(err.error.to_string(), to_line(err.location.row())))?;
    let body = parse_statements(program)?;
    tracing::debug!(filename, statements = body.len(), "parsed module");
    Ok(Module::new(body))
}

/// Parser rows are 1-based, like our lines.
fn to_line(row: impl TryInto<u32>) -> u32 {
    row.try_into().unwrap_or(u32::MAX)
}

fn parse_statements(statements: Vec<Stmt>) -> ParseResult<Vec<NodeLoc>> {
    statements.into_iter().map(parse_statement).collect()
}

fn parse_statement(statement: Stmt) -> ParseResult<NodeLoc> {
    let line = to_line(statement.location.row());
    let node = match statement.node {
        StmtKind::FunctionDef {
            name,
            args,
            body,
            decorator_list,
            ..
        } => {
            if !decorator_list.is_empty() {
                return Err(ParseError::unsupported("decorators", line));
            }
            Node::FunctionDef(FunctionDef {
                name,
                params: parse_arguments(*args, line)?,
                body: parse_statements(body)?,
            })
        }
        StmtKind::ClassDef {
            name,
            bases,
            keywords,
            body,
            decorator_list,
        } => {
            if !decorator_list.is_empty() {
                return Err(ParseError::unsupported("decorators", line));
            }
            if !keywords.is_empty() {
                return Err(ParseError::unsupported("class keyword arguments", line));
            }
            Node::ClassDef(ClassDef {
                name,
                bases: parse_expressions(bases)?,
                body: parse_statements(body)?,
            })
        }
        StmtKind::Return { value } => Node::Return(value.map(|v| parse_expression(*v)).transpose()?),
        StmtKind::Delete { targets } => Node::Delete(targets.into_iter().map(parse_target).collect::<ParseResult<_>>()?),
        StmtKind::Assign { targets, value, .. } => Node::Assign {
            targets: targets.into_iter().map(parse_target).collect::<ParseResult<_>>()?,
            value: parse_expression(*value)?,
        },
        StmtKind::AugAssign { target, op, value } => Node::AugAssign {
            target: parse_target(*target)?,
            op: convert_op(op, line)?,
            value: parse_expression(*value)?,
        },
        StmtKind::AnnAssign { target, value, .. } => match value {
            Some(value) => Node::Assign {
                targets: vec![parse_target(*target)?],
                value: parse_expression(*value)?,
            },
            None => Node::Pass,
        },
        StmtKind::For {
            target,
            iter,
            body,
            orelse,
            ..
        } => Node::For {
            target: parse_target(*target)?,
            iter: parse_expression(*iter)?,
            body: parse_statements(body)?,
            or_else: parse_statements(orelse)?,
        },
        StmtKind::While { test, body, orelse } => Node::While {
            test: parse_expression(*test)?,
            body: parse_statements(body)?,
            or_else: parse_statements(orelse)?,
        },
        StmtKind::If { test, body, orelse } => Node::If {
            test: parse_expression(*test)?,
            body: parse_statements(body)?,
            or_else: parse_statements(orelse)?,
        },
        StmtKind::With { items, body, .. } => Node::With {
            items: items.into_iter().map(parse_with_item).collect::<ParseResult<_>>()?,
            body: parse_statements(body)?,
        },
        StmtKind::Raise { exc, cause } => {
            if cause.is_some() {
                return Err(ParseError::unsupported("'raise ... from'", line));
            }
            Node::Raise(exc.map(|e| parse_expression(*e)).transpose()?)
        }
        StmtKind::Try {
            body,
            handlers,
            orelse,
            finalbody,
        } => Node::Try(Try {
            body: parse_statements(body)?,
            handlers: handlers.into_iter().map(parse_handler).collect::<ParseResult<_>>()?,
            or_else: parse_statements(orelse)?,
            finally: parse_statements(finalbody)?,
        }),
        StmtKind::Assert { test, msg } => Node::Assert {
            test: parse_expression(*test)?,
            msg: msg.map(|m| parse_expression(*m)).transpose()?,
        },
        StmtKind::Global { names } => Node::Global(names),
        StmtKind::Nonlocal { names } => Node::Nonlocal(names),
        StmtKind::Expr { value } => Node::Expr(parse_expression(*value)?),
        StmtKind::Pass => Node::Pass,
        StmtKind::Break => Node::Break,
        StmtKind::Continue => Node::Continue,
        StmtKind::AsyncFunctionDef { .. } | StmtKind::AsyncFor { .. } | StmtKind::AsyncWith { .. } => {
            return Err(ParseError::unsupported("async", line));
        }
        StmtKind::Import { .. } | StmtKind::ImportFrom { .. } => {
            return Err(ParseError::unsupported("import", line));
        }
        StmtKind::Match { .. } => return Err(ParseError::unsupported("match", line)),
    };
    Ok(NodeLoc::new(line, node))
}

fn parse_handler(handler: Excepthandler) -> ParseResult<ExceptHandler> {
    let line = to_line(handler.location.row());
    let ExcepthandlerKind::ExceptHandler { type_, name, body } = handler.node;
    Ok(ExceptHandler {
        line,
        exc_type: type_.map(|t| parse_expression(*t)).transpose()?,
        name,
        body: parse_statements(body)?,
    })
}

fn parse_with_item(item: Withitem) -> ParseResult<WithItem> {
    Ok(WithItem {
        context: parse_expression(item.context_expr)?,
        target: item.optional_vars.map(|t| parse_target(*t)).transpose()?,
    })
}

/// Lowers a signature. Positional-only parameters bind like ordinary positional ones.
fn parse_arguments(args: Arguments, line: u32) -> ParseResult<Parameters> {
    let positional: Vec<_> = args.posonlyargs.into_iter().chain(args.args).collect();
    // Defaults belong to the last parameters.
    let first_default = positional.len().checked_sub(args.defaults.len()).ok_or_else(|| {
        ParseError::new("more defaults than parameters", line)
    })?;
    let mut defaults = args.defaults.into_iter();
    let mut params = Vec::with_capacity(positional.len());
    for (index, arg) in positional.into_iter().enumerate() {
        let default = if index >= first_default {
            defaults.next().map(parse_expression).transpose()?
        } else {
            None
        };
        params.push(Param {
            name: arg.node.arg,
            default,
        });
    }

    // `kw_defaults` holds only the defaults that exist; they go to the trailing
    // keyword-only parameters.
    let mut kw_defaults = args.kw_defaults.into_iter();
    let skip = args.kwonlyargs.len().saturating_sub(kw_defaults.len());
    let mut kwonly = Vec::with_capacity(args.kwonlyargs.len());
    for (index, arg) in args.kwonlyargs.into_iter().enumerate() {
        let default = if index >= skip {
            kw_defaults.next().map(parse_expression).transpose()?
        } else {
            None
        };
        kwonly.push(Param {
            name: arg.node.arg,
            default,
        });
    }

    Ok(Parameters {
        args: params,
        vararg: args.vararg.map(|arg| arg.node.arg),
        kwonly,
        kwarg: args.kwarg.map(|arg| arg.node.arg),
    })
}

fn parse_target(target: AstExpr) -> ParseResult<Target> {
    let line = to_line(target.location.row());
    match target.node {
        ExprKind::Name { id, .. } => Ok(Target::Name(id)),
        ExprKind::Attribute { value, attr, .. } => Ok(Target::Attr {
            object: Box::new(parse_expression(*value)?),
            attr,
        }),
        ExprKind::Subscript { value, slice, .. } => Ok(Target::Subscript {
            object: Box::new(parse_expression(*value)?),
            index: Box::new(parse_expression(*slice)?),
        }),
        ExprKind::Tuple { elts, .. } | ExprKind::List { elts, .. } => Ok(Target::Unpack(
            elts.into_iter().map(parse_target).collect::<ParseResult<_>>()?,
        )),
        ExprKind::Starred { .. } => Err(ParseError::unsupported("starred assignment", line)),
        _ => Err(ParseError::new("cannot assign to expression", line)),
    }
}

fn parse_expressions(expressions: Vec<AstExpr>) -> ParseResult<Vec<ExprLoc>> {
    expressions.into_iter().map(parse_expression).collect()
}

fn boxed(expression: AstExpr) -> ParseResult<Box<ExprLoc>> {
    parse_expression(expression).map(Box::new)
}

fn parse_expression(expression: AstExpr) -> ParseResult<ExprLoc> {
    let line = to_line(expression.location.row());
    let expr = match expression.node {
        ExprKind::BoolOp { op, values } => Expr::BoolOp {
            op: match op {
                Boolop::And => BoolOperator::And,
                Boolop::Or => BoolOperator::Or,
            },
            values: parse_expressions(values)?,
        },
        ExprKind::BinOp { left, op, right } => Expr::BinOp {
            left: boxed(*left)?,
            op: convert_op(op, line)?,
            right: boxed(*right)?,
        },
        ExprKind::UnaryOp { op, operand } => Expr::UnaryOp {
            op: match op {
                Unaryop::Invert => UnaryOperator::Invert,
                Unaryop::Not => UnaryOperator::Not,
                Unaryop::UAdd => UnaryOperator::Pos,
                Unaryop::USub => UnaryOperator::Neg,
            },
            operand: boxed(*operand)?,
        },
        ExprKind::Lambda { args, body } => Expr::Lambda {
            params: Box::new(parse_arguments(*args, line)?),
            body: boxed(*body)?,
        },
        ExprKind::IfExp { test, body, orelse } => Expr::IfElse {
            test: boxed(*test)?,
            body: boxed(*body)?,
            orelse: boxed(*orelse)?,
        },
        ExprKind::Dict { keys, values } => {
            let mut pairs = Vec::with_capacity(values.len());
            for (key, value) in keys.into_iter().zip(values) {
                let key: Option<AstExpr> = key.into();
                let Some(key) = key else {
                    return Err(ParseError::unsupported("dict unpacking", line));
                };
                pairs.push((parse_expression(key)?, parse_expression(value)?));
            }
            Expr::Dict(pairs)
        }
        ExprKind::Set { elts } => Expr::Set(parse_expressions(elts)?),
        ExprKind::List { elts, .. } => Expr::List(parse_expressions(elts)?),
        ExprKind::Tuple { elts, .. } => Expr::Tuple(parse_expressions(elts)?),
        ExprKind::ListComp { elt, generators } => comprehension(ComprehensionKind::List, *elt, None, generators)?,
        ExprKind::SetComp { elt, generators } => comprehension(ComprehensionKind::Set, *elt, None, generators)?,
        ExprKind::GeneratorExp { elt, generators } => {
            comprehension(ComprehensionKind::Generator, *elt, None, generators)?
        }
        ExprKind::DictComp { key, value, generators } => {
            comprehension(ComprehensionKind::Dict, *key, Some(*value), generators)?
        }
        ExprKind::Yield { value } => Expr::Yield(value.map(|v| boxed(*v)).transpose()?),
        ExprKind::Compare {
            left,
            ops,
            comparators,
        } => Expr::Compare {
            left: boxed(*left)?,
            ops: ops
                .into_iter()
                .map(convert_cmp)
                .zip(comparators)
                .map(|(op, comparator)| Ok((op, parse_expression(comparator)?)))
                .collect::<ParseResult<_>>()?,
        },
        ExprKind::Call { func, args, keywords } => Expr::Call {
            func: boxed(*func)?,
            args: args
                .into_iter()
                .map(|arg| match arg.node {
                    ExprKind::Starred { .. } => Err(ParseError::unsupported("starred arguments", line)),
                    _ => parse_expression(arg),
                })
                .collect::<ParseResult<_>>()?,
            keywords: keywords
                .into_iter()
                .map(|kw| parse_keyword(kw, line))
                .collect::<ParseResult<_>>()?,
        },
        ExprKind::Constant { value, .. } => Expr::Literal(convert_const(value, line)?),
        ExprKind::Attribute { value, attr, .. } => Expr::Attribute {
            object: boxed(*value)?,
            attr,
        },
        ExprKind::Subscript { value, slice, .. } => {
            if matches!(slice.node, ExprKind::Slice { .. }) {
                return Err(ParseError::unsupported("slicing", line));
            }
            Expr::Subscript {
                object: boxed(*value)?,
                index: boxed(*slice)?,
            }
        }
        ExprKind::Name { id, .. } => Expr::Name(id),
        ExprKind::NamedExpr { .. } => return Err(ParseError::unsupported("assignment expressions", line)),
        ExprKind::Await { .. } => return Err(ParseError::unsupported("async", line)),
        ExprKind::YieldFrom { .. } => return Err(ParseError::unsupported("'yield from'", line)),
        ExprKind::FormattedValue { .. } | ExprKind::JoinedStr { .. } => {
            return Err(ParseError::unsupported("f-strings", line));
        }
        ExprKind::Starred { .. } => return Err(ParseError::unsupported("starred expressions", line)),
        ExprKind::Slice { .. } => return Err(ParseError::unsupported("slicing", line)),
    };
    Ok(ExprLoc::new(line, expr))
}

fn comprehension(
    kind: ComprehensionKind,
    element: AstExpr,
    value: Option<AstExpr>,
    generators: Vec<AstComprehension>,
) -> ParseResult<Expr> {
    let generators = generators
        .into_iter()
        .map(|generator| {
            Ok(ComprehensionFor {
                target: parse_target(generator.target)?,
                iter: parse_expression(generator.iter)?,
                ifs: parse_expressions(generator.ifs)?,
            })
        })
        .collect::<ParseResult<_>>()?;
    Ok(Expr::Comprehension(Box::new(Comprehension {
        kind,
        element: parse_expression(element)?,
        value: value.map(parse_expression).transpose()?,
        generators,
    })))
}

fn parse_keyword(keyword: AstKeyword, line: u32) -> ParseResult<Keyword> {
    let Some(name) = keyword.node.arg else {
        return Err(ParseError::unsupported("'**' arguments", line));
    };
    Ok(Keyword {
        name,
        value: parse_expression(keyword.node.value)?,
    })
}

fn convert_op(op: AstOperator, line: u32) -> ParseResult<Operator> {
    Ok(match op {
        AstOperator::Add => Operator::Add,
        AstOperator::Sub => Operator::Sub,
        AstOperator::Mult => Operator::Mult,
        AstOperator::Div => Operator::Div,
        AstOperator::Mod => Operator::Mod,
        AstOperator::Pow => Operator::Pow,
        AstOperator::LShift => Operator::LShift,
        AstOperator::RShift => Operator::RShift,
        AstOperator::BitOr => Operator::BitOr,
        AstOperator::BitXor => Operator::BitXor,
        AstOperator::BitAnd => Operator::BitAnd,
        AstOperator::FloorDiv => Operator::FloorDiv,
        AstOperator::MatMult => return Err(ParseError::unsupported("the '@' operator", line)),
    })
}

fn convert_cmp(op: Cmpop) -> CmpOperator {
    match op {
        Cmpop::Eq => CmpOperator::Eq,
        Cmpop::NotEq => CmpOperator::NotEq,
        Cmpop::Lt => CmpOperator::Lt,
        Cmpop::LtE => CmpOperator::LtE,
        Cmpop::Gt => CmpOperator::Gt,
        Cmpop::GtE => CmpOperator::GtE,
        Cmpop::Is => CmpOperator::Is,
        Cmpop::IsNot => CmpOperator::IsNot,
        Cmpop::In => CmpOperator::In,
        Cmpop::NotIn => CmpOperator::NotIn,
    }
}

fn convert_const(constant: Constant, line: u32) -> ParseResult<Literal> {
    Ok(match constant {
        Constant::None => Literal::None,
        Constant::Bool(b) => Literal::Bool(b),
        Constant::Str(s) => Literal::Str(s),
        Constant::Int(big_int) => Literal::Int(int_literal(&big_int, line)?),
        Constant::Float(f) => Literal::Float(f),
        Constant::Ellipsis => Literal::Ellipsis,
        Constant::Bytes(_) => return Err(ParseError::unsupported("bytes literals", line)),
        Constant::Complex { .. } => return Err(ParseError::unsupported("complex literals", line)),
        Constant::Tuple(_) => return Err(ParseError::unsupported("constant tuples", line)),
    })
}

/// Integers are 64-bit at runtime; wider literals are rejected up front.
fn int_literal(value: &BigInt, line: u32) -> ParseResult<i64> {
    value
        .to_i64()
        .ok_or_else(|| ParseError::new(format!("integer literal {value} is too large"), line))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn first(source: &str) -> Node {
        parse(source, "test.py").unwrap().body.remove(0).node
    }

    #[test]
    fn statements_carry_lines() {
        let module = parse("x = 1\n\nif x:\n    pass\n", "test.py").unwrap();
        let lines: Vec<u32> = module.body.iter().map(|n| n.line).collect();
        assert_eq!(lines, vec![1, 3]);
    }

    #[test]
    fn defaults_align_with_trailing_params() {
        let Node::FunctionDef(def) = first("def f(a, b=1, *rest, c, d=2, **kw):\n    pass\n") else {
            panic!("expected a function");
        };
        let names: Vec<&str> = def.params.names().collect();
        assert_eq!(names, vec!["a", "b", "c", "d", "rest", "kw"]);
        assert!(def.params.args[0].default.is_none());
        assert!(def.params.args[1].default.is_some());
        assert!(def.params.kwonly[0].default.is_none());
        assert!(def.params.kwonly[1].default.is_some());
    }

    #[test]
    fn chained_assignment_keeps_every_target() {
        let Node::Assign { targets, .. } = first("a = b, c = 1, 2\n") else {
            panic!("expected an assignment");
        };
        assert!(matches!(&targets[0], Target::Name(n) if n == "a"));
        assert!(matches!(&targets[1], Target::Unpack(items) if items.len() == 2));
    }

    #[test]
    fn unsupported_syntax_is_rejected_with_its_line() {
        let err = parse("x = 1\nimport os\n", "test.py").unwrap_err();
        assert_eq!(err.line(), 2);
        assert_eq!(err.message(), "import is not supported");
        assert!(parse("f(*args)\n", "test.py").is_err());
        assert!(parse("x[1:2]\n", "test.py").is_err());
        assert!(parse("f'{x}'\n", "test.py").is_err());
        assert!(parse("@d\ndef f():\n    pass\n", "test.py").is_err());
    }

    #[test]
    fn syntax_errors_report_a_line() {
        let err = parse("x = (\n", "test.py").unwrap_err();
        assert!(err.line() >= 1);
    }
}
