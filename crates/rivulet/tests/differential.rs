//! Random integer/boolean expressions, compiled and run, against a direct evaluator.

use proptest::prelude::*;
use rivulet::{Error, NoPrint, Object, Runner};

#[derive(Debug, Clone)]
enum Tree {
    Int(i64),
    Var,
    Neg(Box<Tree>),
    Not(Box<Tree>),
    Bin(BinOp, Box<Tree>, Box<Tree>),
    Cmp(CmpOp, Box<Tree>, Box<Tree>),
    And(Box<Tree>, Box<Tree>),
    Or(Box<Tree>, Box<Tree>),
    IfElse(Box<Tree>, Box<Tree>, Box<Tree>),
}

#[derive(Debug, Clone, Copy)]
enum BinOp {
    Add,
    Sub,
    Mul,
    FloorDiv,
    Mod,
}

#[derive(Debug, Clone, Copy)]
enum CmpOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum Val {
    Int(i64),
    Bool(bool),
}

impl Val {
    fn int(self) -> i64 {
        match self {
            Self::Int(i) => i,
            Self::Bool(b) => i64::from(b),
        }
    }

    fn truthy(self) -> bool {
        self.int() != 0
    }

    fn into_object(self) -> Object {
        match self {
            Self::Int(i) => Object::Int(i),
            Self::Bool(b) => Object::Bool(b),
        }
    }
}

/// Outcome of evaluation: a value, or the name of the exception raised.
type Outcome = Result<Val, &'static str>;

fn floor_div(a: i64, b: i64) -> Outcome {
    if b == 0 {
        return Err("ZeroDivisionError");
    }
    let q = a / b;
    if a % b != 0 && ((a < 0) != (b < 0)) {
        Ok(Val::Int(q - 1))
    } else {
        Ok(Val::Int(q))
    }
}

fn eval(tree: &Tree, x: i64) -> Outcome {
    Ok(match tree {
        Tree::Int(i) => Val::Int(*i),
        Tree::Var => Val::Int(x),
        Tree::Neg(t) => Val::Int(-eval(t, x)?.int()),
        Tree::Not(t) => Val::Bool(!eval(t, x)?.truthy()),
        Tree::Bin(op, l, r) => {
            let (a, b) = (eval(l, x)?.int(), eval(r, x)?.int());
            let checked = match op {
                BinOp::Add => a.checked_add(b),
                BinOp::Sub => a.checked_sub(b),
                BinOp::Mul => a.checked_mul(b),
                BinOp::FloorDiv => return floor_div(a, b),
                BinOp::Mod => {
                    let Val::Int(q) = floor_div(a, b)? else { unreachable!() };
                    Some(a - b * q)
                }
            };
            Val::Int(checked.ok_or("OverflowError")?)
        }
        Tree::Cmp(op, l, r) => {
            let (a, b) = (eval(l, x)?.int(), eval(r, x)?.int());
            Val::Bool(match op {
                CmpOp::Eq => a == b,
                CmpOp::Ne => a != b,
                CmpOp::Lt => a < b,
                CmpOp::Le => a <= b,
                CmpOp::Gt => a > b,
                CmpOp::Ge => a >= b,
            })
        }
        Tree::And(l, r) => {
            let left = eval(l, x)?;
            if left.truthy() { eval(r, x)? } else { left }
        }
        Tree::Or(l, r) => {
            let left = eval(l, x)?;
            if left.truthy() { left } else { eval(r, x)? }
        }
        Tree::IfElse(cond, then, other) => {
            if eval(cond, x)?.truthy() {
                eval(then, x)?
            } else {
                eval(other, x)?
            }
        }
    })
}

fn render(tree: &Tree) -> String {
    match tree {
        Tree::Int(i) => i.to_string(),
        Tree::Var => "x".to_owned(),
        Tree::Neg(t) => format!("(-{})", render(t)),
        Tree::Not(t) => format!("(not {})", render(t)),
        Tree::Bin(op, l, r) => {
            let sym = match op {
                BinOp::Add => "+",
                BinOp::Sub => "-",
                BinOp::Mul => "*",
                BinOp::FloorDiv => "//",
                BinOp::Mod => "%",
            };
            format!("({} {sym} {})", render(l), render(r))
        }
        Tree::Cmp(op, l, r) => {
            let sym = match op {
                CmpOp::Eq => "==",
                CmpOp::Ne => "!=",
                CmpOp::Lt => "<",
                CmpOp::Le => "<=",
                CmpOp::Gt => ">",
                CmpOp::Ge => ">=",
            };
            format!("({} {sym} {})", render(l), render(r))
        }
        Tree::And(l, r) => format!("({} and {})", render(l), render(r)),
        Tree::Or(l, r) => format!("({} or {})", render(l), render(r)),
        Tree::IfElse(c, t, o) => format!("({} if {} else {})", render(t), render(c), render(o)),
    }
}

fn bin_op() -> impl Strategy<Value = BinOp> {
    prop_oneof![
        Just(BinOp::Add),
        Just(BinOp::Sub),
        Just(BinOp::Mul),
        Just(BinOp::FloorDiv),
        Just(BinOp::Mod),
    ]
}

fn cmp_op() -> impl Strategy<Value = CmpOp> {
    prop_oneof![
        Just(CmpOp::Eq),
        Just(CmpOp::Ne),
        Just(CmpOp::Lt),
        Just(CmpOp::Le),
        Just(CmpOp::Gt),
        Just(CmpOp::Ge),
    ]
}

fn tree() -> impl Strategy<Value = Tree> {
    let leaf = prop_oneof![(-9i64..10).prop_map(Tree::Int), Just(Tree::Var)];
    leaf.prop_recursive(4, 32, 3, |inner| {
        prop_oneof![
            inner.clone().prop_map(|t| Tree::Neg(Box::new(t))),
            inner.clone().prop_map(|t| Tree::Not(Box::new(t))),
            (bin_op(), inner.clone(), inner.clone()).prop_map(|(op, l, r)| Tree::Bin(op, Box::new(l), Box::new(r))),
            (cmp_op(), inner.clone(), inner.clone()).prop_map(|(op, l, r)| Tree::Cmp(op, Box::new(l), Box::new(r))),
            (inner.clone(), inner.clone()).prop_map(|(l, r)| Tree::And(Box::new(l), Box::new(r))),
            (inner.clone(), inner.clone()).prop_map(|(l, r)| Tree::Or(Box::new(l), Box::new(r))),
            (inner.clone(), inner.clone(), inner).prop_map(|(c, t, o)| Tree::IfElse(
                Box::new(c),
                Box::new(t),
                Box::new(o)
            )),
        ]
    })
}

proptest! {
    /// The same expression evaluated with module-level names and with function locals.
    #[test]
    fn compiled_matches_direct_evaluation(tree in tree(), x in -5i64..6) {
        let expr = render(&tree);
        let source = format!("def f(x):\n    return {expr}\n\nx = {x}\n({expr}, f(x))\n");
        let runner = Runner::new(&source, "expr.py").unwrap();
        let result = runner.run_no_limits(&mut NoPrint);

        match eval(&tree, x) {
            Ok(value) => {
                let expected = Object::Tuple(vec![value.into_object(), value.into_object()]);
                prop_assert_eq!(result.unwrap(), expected, "{}", source);
            }
            Err(exc_type) => {
                let Err(Error::Exception(exc)) = result else {
                    return Err(TestCaseError::fail(format!("expected {exc_type} from {source}, got {result:?}")));
                };
                prop_assert_eq!(exc.type_name(), exc_type, "{}", source);
            }
        }
    }
}
