//! End-to-end behaviour of the core constructs: names, closures, loops, handlers and
//! generators, plus compile-time rejection.

use rivulet::{CollectStringPrint, Error, Object, Opcode, Runner};

/// Routes the crate's `tracing` events to the test output; `RUST_LOG=rivulet=trace` shows frame pushes.
fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn run(code: &str) -> (Result<Object, Error>, String) {
    init_tracing();
    let runner = Runner::new(code, "test.py").unwrap();
    let mut out = CollectStringPrint::new();
    let result = runner.run_no_limits(&mut out);
    (result, out.into_output())
}

fn opcodes(runner: &Runner) -> Vec<Opcode> {
    runner.code().instructions().map(|i| i.unwrap().opcode).collect()
}

#[test]
fn module_assignment_and_print() {
    let runner = Runner::new("x = 1\nprint(x)", "test.py").unwrap();
    let ops = opcodes(&runner);
    assert_eq!(
        &ops[..5],
        &[
            Opcode::LoadConst,
            Opcode::StoreName,
            Opcode::LoadName,
            Opcode::LoadName,
            Opcode::CallFunction,
        ]
    );
    let mut out = CollectStringPrint::new();
    runner.run_no_limits(&mut out).unwrap();
    assert_eq!(out.output(), "1\n");
}

#[test]
fn closure_reads_enclosing_cell() {
    let code = "
def f():
    x = 1
    def g():
        return x
    return g

f()()
";
    let (result, _) = run(code);
    assert_eq!(result.unwrap(), Object::Int(1));

    let tree = rivulet::analyze(&rivulet::parse(code, "test.py").unwrap()).unwrap();
    let f = tree.find("f").unwrap();
    let g = tree.find("g").unwrap();
    assert_eq!(f.name_kind("x"), rivulet::scope::NameKind::Cell);
    assert_eq!(g.name_kind("x"), rivulet::scope::NameKind::Free);
}

#[test]
fn for_loop_exhaustion_is_not_an_exception() {
    let code = "
for i in range(3):
    print(i)
i
";
    let (result, output) = run(code);
    assert_eq!(output, "0\n1\n2\n");
    assert_eq!(result.unwrap(), Object::Int(2));
}

#[test]
fn handler_runs_once_and_unbinds_name() {
    let code = "
try:
    1 / 0
except ZeroDivisionError as e:
    print('caught')
print('after')
try:
    e
    bound = True
except NameError:
    bound = False
bound
";
    let (result, output) = run(code);
    assert_eq!(output, "caught\nafter\n");
    assert_eq!(result.unwrap(), Object::Bool(false));
}

#[test]
fn generator_stays_exhausted() {
    let code = "
def gen():
    yield 1
    yield 2

g = gen()
results = [next(g), next(g)]
for attempt in range(2):
    try:
        next(g)
    except StopIteration:
        results.append('done')
results
";
    let (result, _) = run(code);
    assert_eq!(
        result.unwrap(),
        Object::List(vec![Object::Int(1), Object::Int(2), Object::from("done"), Object::from("done")])
    );
}

#[test]
fn break_outside_loop_never_runs() {
    let err = Runner::new("print('side effect')\nbreak\n", "test.py").unwrap_err();
    let Error::Compile(err) = err else {
        panic!("expected a compile error, got {err:?}");
    };
    assert_eq!(err.message(), "'break' outside loop");
    assert_eq!(err.line(), 2);
}

#[test]
fn uncaught_exception_carries_traceback() {
    let code = "
def inner():
    raise ValueError('boom')

def outer():
    inner()

outer()
";
    let (result, _) = run(code);
    let Err(Error::Exception(exc)) = result else {
        panic!("expected an exception, got {result:?}");
    };
    assert_eq!(exc.summary(), "ValueError('boom')");
    assert_eq!(exc.exc_type(), Some(rivulet::ExcType::ValueError));
    let frames: Vec<(&str, u32)> = exc.traceback().iter().map(|f| (f.name.as_str(), f.line)).collect();
    assert_eq!(frames, vec![("<module>", 8), ("outer", 6), ("inner", 3)]);
}

#[test]
fn runs_are_independent() {
    let runner = Runner::new("counter = [0]\ncounter[0] += 1\ncounter[0]", "test.py").unwrap();
    let mut out = CollectStringPrint::new();
    assert_eq!(runner.run_no_limits(&mut out).unwrap(), Object::Int(1));
    assert_eq!(runner.run_no_limits(&mut out).unwrap(), Object::Int(1));
}

fn traceback_of(code: &str) -> Vec<(String, u32)> {
    let (result, _) = run(code);
    let Err(Error::Exception(exc)) = result else {
        panic!("expected an exception, got {result:?}");
    };
    exc.traceback().iter().map(|f| (f.name.clone(), f.line)).collect()
}

#[test]
fn traceback_points_at_the_raising_line() {
    let unmatched_handler = "
def f(n):
    try:
        1 / n
    except KeyError:
        pass

f(0)
";
    assert_eq!(traceback_of(unmatched_handler), vec![("<module>".to_owned(), 8), ("f".to_owned(), 4)]);

    let through_finally = "
def g(n):
    try:
        1 / n
    finally:
        x = 1
        y = 2

g(0)
";
    assert_eq!(traceback_of(through_finally), vec![("<module>".to_owned(), 9), ("g".to_owned(), 4)]);

    let bare_reraise = "
def h(n):
    try:
        return 1 / n
    except ZeroDivisionError:
        print('seen')
        raise

h(0)
";
    assert_eq!(traceback_of(bare_reraise), vec![("<module>".to_owned(), 9), ("h".to_owned(), 4)]);
}

#[test]
fn generator_keeps_its_handled_exception_to_itself() {
    let code = "
def g():
    try:
        raise KeyError('k')
    except KeyError:
        yield 1
        raise

it = g()
next(it)
try:
    raise
except RuntimeError:
    outside = 'ok'
except KeyError:
    outside = 'leaked'
try:
    next(it)
except KeyError:
    inside = 'kept'
(outside, inside)
";
    let (result, _) = run(code);
    assert_eq!(result.unwrap(), Object::Tuple(vec![Object::from("ok"), Object::from("kept")]));
}

#[test]
fn generator_reentry_is_an_internal_fault() {
    let code = "
def g():
    yield next(it)

it = g()
next(it)
";
    let (result, _) = run(code);
    let Err(Error::Internal(msg)) = result else {
        panic!("expected an internal fault, got {result:?}");
    };
    assert!(msg.contains("already running"), "{msg}");
}

#[test]
fn continue_inside_handler_keeps_the_loop_iterator() {
    let code = "
seen = []
for i in range(3):
    try:
        raise ValueError(i)
    except ValueError:
        continue
    finally:
        seen.append(i)
seen
";
    let (result, _) = run(code);
    assert_eq!(result.unwrap(), Object::List(vec![Object::Int(0), Object::Int(1), Object::Int(2)]));
}
