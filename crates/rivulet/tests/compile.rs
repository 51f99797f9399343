//! Properties of generated code: determinism, stack accounting and wide operands.

use std::collections::BTreeMap;

use rivulet::{
    CollectStringPrint, Object, Opcode, Runner,
    ast::{Expr, ExprLoc, Literal, Module, Node, NodeLoc, Target},
    bytecode::{Code, Const, JumpKind},
};

const PROGRAM: &str = "
class Counter:
    def __init__(self, start):
        self.n = start

    def bump(self, by=1):
        self.n += by
        return self.n

def walk(items):
    total = 0
    for i, item in enumerate(items):
        try:
            if item is None:
                continue
            total += item * i
        except TypeError:
            break
        finally:
            total -= 1
    else:
        total += 100
    return total

def squares(n):
    for i in range(n):
        yield i * i

with_lambda = lambda a, *rest, key=None, **kw: [x for x in rest if x != key]
c = Counter(3)
(walk([1, None, 2]), list(squares(4)), c.bump(), with_lambda(1, 2, 3, key=2))
";

/// Every code object in `code`, depth first.
fn all_codes(code: &Code) -> Vec<&Code> {
    let mut out = vec![code];
    for constant in code.consts() {
        if let Const::Code(nested) = constant {
            out.extend(all_codes(nested));
        }
    }
    out
}

/// Recomputes the maximum stack depth from the encoded bytecode alone.
fn decoded_max_depth(code: &Code) -> i32 {
    let instructions: BTreeMap<usize, _> = code.instructions().map(|i| i.unwrap()).map(|i| (i.offset, i)).collect();
    let mut entry: BTreeMap<usize, i32> = BTreeMap::new();
    let mut worklist = vec![(0usize, 0i32)];
    let mut max_depth = 0;
    while let Some((offset, depth)) = worklist.pop() {
        if entry.get(&offset).is_some_and(|&seen| seen >= depth) {
            continue;
        }
        entry.insert(offset, depth);
        let inst = instructions[&offset];
        let arg = inst.arg.unwrap_or(0);
        // The engine puts the loop head's depth back on `continue`.
        if let Some(kind) = inst.opcode.jump_kind().filter(|_| inst.opcode != Opcode::ContinueLoop) {
            let target = match kind {
                JumpKind::Relative => inst.next_offset + arg as usize,
                JumpKind::Absolute => arg as usize,
            };
            let jump_depth = depth + inst.opcode.stack_effect(arg, true);
            max_depth = max_depth.max(jump_depth);
            worklist.push((target, jump_depth));
        }
        if inst.opcode.falls_through() {
            let next = depth + inst.opcode.stack_effect(arg, false);
            assert!(next >= 0, "{}: stack underflow at {offset} ({})", code.name(), inst.opcode);
            max_depth = max_depth.max(next);
            if instructions.contains_key(&inst.next_offset) {
                worklist.push((inst.next_offset, next));
            }
        }
    }
    max_depth
}

#[test]
fn compiling_twice_is_deterministic() {
    let a = Runner::new(PROGRAM, "prog.py").unwrap();
    let b = Runner::new(PROGRAM, "prog.py").unwrap();
    let codes_a = all_codes(a.code());
    let codes_b = all_codes(b.code());
    assert_eq!(codes_a.len(), codes_b.len());
    for (x, y) in codes_a.iter().zip(&codes_b) {
        assert_eq!(x.bytecode(), y.bytecode(), "{}", x.name());
        assert_eq!(x.disassemble(), y.disassemble());
    }
}

#[test]
fn declared_stack_size_matches_bytecode() {
    let runner = Runner::new(PROGRAM, "prog.py").unwrap();
    for code in all_codes(runner.code()) {
        assert_eq!(
            decoded_max_depth(code),
            code.stack_size() as i32,
            "stack size of {}\n{}",
            code.name(),
            code.disassemble()
        );
    }
}

#[test]
fn program_result() {
    let runner = Runner::new(PROGRAM, "prog.py").unwrap();
    let mut out = CollectStringPrint::new();
    let result = runner.run_no_limits(&mut out).unwrap();
    // walk: 1*0 - 1, continue still runs finally (-1), 2*2 - 1, then the else clause.
    assert_eq!(
        result,
        Object::Tuple(vec![
            Object::Int(101),
            Object::List(vec![Object::Int(0), Object::Int(1), Object::Int(4), Object::Int(9)]),
            Object::Int(4),
            Object::List(vec![Object::Int(3)]),
        ])
    );
}

#[test]
fn continue_out_of_with_and_handlers_compiles() {
    let source = "
class Quiet:
    def __enter__(self):
        return self

    def __exit__(self, *exc):
        return False

def skip_odd(items):
    kept = []
    for item in items:
        with Quiet():
            if item % 2:
                continue
            try:
                if item == 2:
                    raise KeyError(item)
            except KeyError:
                continue
            kept.append(item)
    return kept

skip_odd(range(7))
";
    let runner = Runner::new(source, "skip.py").unwrap();
    for code in all_codes(runner.code()) {
        assert_eq!(decoded_max_depth(code), code.stack_size() as i32, "stack size of {}", code.name());
    }
    let mut out = CollectStringPrint::new();
    assert_eq!(
        runner.run_no_limits(&mut out).unwrap(),
        Object::List(vec![Object::Int(0), Object::Int(4), Object::Int(6)])
    );
}

fn line(n: usize) -> u32 {
    u32::try_from(n).unwrap() + 1
}

fn int(line: u32, i: i64) -> ExprLoc {
    ExprLoc::new(line, Expr::Literal(Literal::Int(i)))
}

/// `x = 0; x = 1; ...` with `count` distinct constants.
fn many_assignments(count: usize, first_line: usize) -> Vec<NodeLoc> {
    (0..count)
        .map(|i| {
            NodeLoc::new(
                line(first_line + i),
                Node::Assign {
                    targets: vec![Target::Name("x".to_owned())],
                    value: int(line(first_line + i), i as i64),
                },
            )
        })
        .collect()
}

#[test]
fn wide_constant_operands_use_extended_arg() {
    let count = 70_000;
    let mut body = many_assignments(count, 0);
    body.push(NodeLoc::new(
        line(count),
        Node::Expr(ExprLoc::new(line(count), Expr::Name("x".to_owned()))),
    ));
    let runner = Runner::from_module(&Module::new(body), "wide.py").unwrap();

    let code = runner.code();
    assert!(code.bytecode().contains(&(Opcode::ExtendedArg as u8)));
    let widest = code
        .instructions()
        .map(|i| i.unwrap())
        .filter(|i| i.opcode == Opcode::LoadConst)
        .filter_map(|i| i.arg)
        .max()
        .unwrap();
    assert!(widest > 0xFFFF);
    assert_eq!(code.line_for_offset(code.bytecode().len() - 1), line(count));

    let mut out = CollectStringPrint::new();
    assert_eq!(runner.run_no_limits(&mut out).unwrap(), Object::Int(69_999));
}

#[test]
fn wide_jumps_over_a_large_body() {
    // if flag: <70k statements>
    // else: x = -1
    // x
    let count = 70_000;
    let body = many_assignments(count, 2);
    let module = Module::new(vec![
        NodeLoc::new(
            1,
            Node::Assign {
                targets: vec![Target::Name("flag".to_owned())],
                value: ExprLoc::new(1, Expr::Literal(Literal::Bool(false))),
            },
        ),
        NodeLoc::new(
            2,
            Node::If {
                test: ExprLoc::new(2, Expr::Name("flag".to_owned())),
                body,
                or_else: vec![NodeLoc::new(
                    line(count + 2),
                    Node::Assign {
                        targets: vec![Target::Name("x".to_owned())],
                        value: int(line(count + 2), -1),
                    },
                )],
            },
        ),
        NodeLoc::new(
            line(count + 3),
            Node::Expr(ExprLoc::new(line(count + 3), Expr::Name("x".to_owned()))),
        ),
    ]);
    let runner = Runner::from_module(&module, "jumps.py").unwrap();
    let jump = runner
        .code()
        .instructions()
        .map(|i| i.unwrap())
        .find(|i| i.opcode == Opcode::PopJumpIfFalse)
        .unwrap();
    assert!(jump.arg.unwrap() > 0xFFFF);

    let mut out = CollectStringPrint::new();
    assert_eq!(runner.run_no_limits(&mut out).unwrap(), Object::Int(-1));
}

#[test]
fn disassembly_resolves_operands() {
    let runner = Runner::new("x = 1\nprint(x)\n", "dis.py").unwrap();
    let listing = runner.code().disassemble();
    assert!(listing.contains("LOAD_CONST 0 (1)"), "{listing}");
    assert!(listing.contains("STORE_NAME 0 (x)"), "{listing}");
    assert!(listing.contains("LOAD_NAME 1 (print)"), "{listing}");
}
