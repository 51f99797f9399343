use criterion::{Bencher, Criterion, black_box, criterion_group, criterion_main};
use rivulet::{NoPrint, Object, Runner};

/// Compiles once, then benchmarks repeated execution.
fn run_rivulet(bench: &mut Bencher, code: &str, expected: i64) {
    let runner = Runner::new(code, "bench.py").unwrap();
    let result = runner.run_no_limits(&mut NoPrint).unwrap();
    assert_eq!(result, Object::Int(expected));

    bench.iter(|| {
        let result = runner.run_no_limits(&mut NoPrint).unwrap();
        black_box(result);
    });
}

/// Benchmarks parsing plus compilation alone.
fn compile_only(bench: &mut Bencher, code: &str) {
    bench.iter(|| {
        let runner = Runner::new(black_box(code), "bench.py").unwrap();
        black_box(runner);
    });
}

const ADD_TWO: &str = "1 + 2";

const LOOP_MOD_13: &str = "
v = 0
for i in range(10000):
    if i % 13 == 0:
        v += 1
v
";

/// Exercises classes, generators, handlers and comprehensions together.
/// Shared with test_cases/bench__kitchen_sink.py
const KITCHEN_SINK: &str = include_str!("../test_cases/bench__kitchen_sink.py");

const FUNC_CALL_KWARGS: &str = "
def add(a, b=2):
    return a + b

add(a=1)
";

const LIST_APPEND_INT: &str = "
a = []
for i in range(100000):
    a.append(i)
sum(a)
";

const FIB_25: &str = "
def fib(n):
    if n <= 1:
        return n
    return fib(n - 1) + fib(n - 2)

fib(25)
";

const CLOSURE_COUNTER: &str = "
def make():
    count = 0
    def inc():
        nonlocal count
        count += 1
        return count
    return inc

inc = make()
for _ in range(10000):
    inc()
inc()
";

const GENERATOR_SUM: &str = "sum(x * 2 for x in range(10000))";

const TRY_EXCEPT_LOOP: &str = "
caught = 0
for i in range(10000):
    try:
        if i % 2 == 0:
            raise ValueError('even')
    except ValueError:
        caught += 1
    finally:
        pass
caught
";

/// List comprehension benchmark - creates 1000 elements.
const LIST_COMP: &str = "len([x * 2 for x in range(1000)])";

/// Dict comprehension benchmark - creates 500 unique keys (i // 2 deduplicates pairs).
const DICT_COMP: &str = "len({i // 2: i * 2 for i in range(1000)})";

fn criterion_benchmark(c: &mut Criterion) {
    c.bench_function("add_two", |b| run_rivulet(b, ADD_TWO, 3));
    c.bench_function("loop_mod_13", |b| run_rivulet(b, LOOP_MOD_13, 770));
    c.bench_function("kitchen_sink", |b| run_rivulet(b, KITCHEN_SINK, 2015));
    c.bench_function("func_call_kwargs", |b| run_rivulet(b, FUNC_CALL_KWARGS, 3));
    c.bench_function("list_append_int", |b| run_rivulet(b, LIST_APPEND_INT, 4_999_950_000));
    c.bench_function("fib", |b| run_rivulet(b, FIB_25, 75_025));
    c.bench_function("closure_counter", |b| run_rivulet(b, CLOSURE_COUNTER, 10_001));
    c.bench_function("generator_sum", |b| run_rivulet(b, GENERATOR_SUM, 99_990_000));
    c.bench_function("try_except_loop", |b| run_rivulet(b, TRY_EXCEPT_LOOP, 5000));
    c.bench_function("list_comp", |b| run_rivulet(b, LIST_COMP, 1000));
    c.bench_function("dict_comp", |b| run_rivulet(b, DICT_COMP, 500));

    c.bench_function("compile_kitchen_sink", |b| compile_only(b, KITCHEN_SINK));
}

criterion_group!(benches, criterion_benchmark);
criterion_main!(benches);
