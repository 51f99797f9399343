/// Tests for resource limits and garbage collection.
///
/// Limits surface as exceptions that `try`/`except` cannot intercept; the collector must
/// reclaim cycles so that long-running loops stay within a memory budget.
use std::time::Duration;

use rivulet::{
    CollectStringPrint, Error, ExcType, LimitedTracker, NoPrint, Object, ResourceLimits, Runner, StackFrame,
};

fn run_with(code: &str, limits: ResourceLimits) -> Result<Object, Error> {
    let runner = Runner::new(code, "test.py").unwrap();
    runner.run(&mut NoPrint, LimitedTracker::new(limits))
}

fn expect_exception(result: Result<Object, Error>, exc_type: ExcType) -> rivulet::Exception {
    match result {
        Err(Error::Exception(exc)) => {
            assert_eq!(exc.exc_type(), Some(exc_type), "unexpected exception: {exc}");
            exc
        }
        other => panic!("expected {exc_type}, got {other:?}"),
    }
}

#[test]
fn allocation_limit_exceeded() {
    let code = r"
result = []
for i in range(50):
    result.append([i])
result
";
    let result = run_with(code, ResourceLimits::new().max_allocations(20));
    let exc = expect_exception(result, ExcType::MemoryError);
    assert!(
        exc.message().unwrap().contains("allocation limit exceeded"),
        "{exc}"
    );
}

#[test]
fn allocation_limit_not_exceeded() {
    let code = r"
result = []
for i in range(5):
    result.append([i])
len(result)
";
    let result = run_with(code, ResourceLimits::new().max_allocations(100));
    assert_eq!(result.unwrap(), Object::Int(5));
}

#[test]
fn limit_errors_cannot_be_caught() {
    let code = r"
caught = False
try:
    data = []
    while True:
        data.append([1])
except MemoryError:
    caught = True
finally:
    print('finally')
caught
";
    let runner = Runner::new(code, "test.py").unwrap();
    let mut out = CollectStringPrint::new();
    let result = runner.run(&mut out, LimitedTracker::new(ResourceLimits::new().max_allocations(200)));
    expect_exception(result, ExcType::MemoryError);
    assert_eq!(out.output(), "", "neither the handler nor the finally body may run");
}

#[test]
fn time_limit_exceeded() {
    let code = r"
x = 0
while True:
    x += 1
";
    let limits = ResourceLimits::new().max_duration(Duration::from_millis(50));
    let exc = expect_exception(run_with(code, limits), ExcType::TimeoutError);
    assert_eq!(
        exc.traceback(),
        [StackFrame {
            name: "<module>".to_owned(),
            line: 4,
        }]
        .as_slice()
    );
}

#[test]
fn recursion_limit_exceeded() {
    let code = r"
def down(n):
    return down(n + 1)

down(0)
";
    let limits = ResourceLimits::new().max_recursion_depth(Some(50));
    let exc = expect_exception(run_with(code, limits), ExcType::RecursionError);
    assert_eq!(exc.message(), Some("maximum recursion depth exceeded"));
    assert_eq!(exc.traceback().len(), 50);
}

#[test]
fn default_recursion_limit_applies_without_limits() {
    let code = r"
def down(n):
    return down(n + 1)

down(0)
";
    let runner = Runner::new(code, "test.py").unwrap();
    let result = runner.run_no_limits(&mut NoPrint);
    expect_exception(result, ExcType::RecursionError);
}

const CYCLES: &str = r"
for i in range(10000):
    a = []
    a.append(a)
'done'
";

#[test]
fn gc_reclaims_cycles() {
    let limits = ResourceLimits::new().max_memory(100_000).gc_interval(100);
    assert_eq!(run_with(CYCLES, limits).unwrap(), Object::from("done"));
}

#[test]
fn cycles_exhaust_memory_without_gc() {
    let limits = ResourceLimits::new().max_memory(100_000).gc_interval(usize::MAX);
    expect_exception(run_with(CYCLES, limits), ExcType::MemoryError);
}

#[test]
fn gc_keeps_reachable_values() {
    let code = r"
keep = {'xs': [1, 2, 3]}
def make(n):
    box = [n]
    def get():
        return box[0]
    return get
getters = [make(i) for i in range(300)]
for i in range(3000):
    junk = [i, [i]]
(keep['xs'], getters[7](), getters[299]())
";
    let limits = ResourceLimits::new().gc_interval(10);
    assert_eq!(
        run_with(code, limits).unwrap(),
        Object::Tuple(vec![
            Object::List(vec![Object::Int(1), Object::Int(2), Object::Int(3)]),
            Object::Int(7),
            Object::Int(299),
        ])
    );
}
