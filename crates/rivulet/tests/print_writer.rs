use std::borrow::Cow;

use rivulet::{CollectStringPrint, NoPrint, PrintWriter, Runner};

fn printed(code: &str) -> String {
    let runner = Runner::new(code, "test.py").unwrap();
    let mut writer = CollectStringPrint::new();
    runner.run_no_limits(&mut writer).unwrap();
    writer.into_output()
}

#[test]
fn print_single_string() {
    assert_eq!(printed("print('hello')"), "hello\n");
}

#[test]
fn print_multiple_args() {
    assert_eq!(printed("print('hello', 'world')"), "hello world\n");
}

#[test]
fn print_empty() {
    assert_eq!(printed("print()"), "\n");
}

#[test]
fn print_mixed_types() {
    assert_eq!(
        printed("print('count:', 42, True, None, 2.5, [1, 'a'], (1,))"),
        "count: 42 True None 2.5 [1, 'a'] (1,)\n"
    );
}

#[test]
fn print_sep_and_end() {
    assert_eq!(printed("print(1, 2, 3, sep='-', end='!')\nprint('x', end='')"), "1-2-3!x");
}

#[test]
fn print_uses_dunder_str() {
    let code = "
class Point:
    def __init__(self, x, y):
        self.x = x
        self.y = y

    def __str__(self):
        return 'P(' + str(self.x) + ', ' + str(self.y) + ')'

print(Point(1, 2))
";
    assert_eq!(printed(code), "P(1, 2)\n");
}

#[test]
fn print_in_function_and_loop() {
    let code = "
def greet(name):
    print('Hello', name)

for name in ['Alice', 'Bob']:
    greet(name)
";
    assert_eq!(printed(code), "Hello Alice\nHello Bob\n");
}

#[test]
fn writer_reuse_accumulates() {
    let mut writer = CollectStringPrint::new();
    Runner::new("print('first')", "test.py")
        .unwrap()
        .run_no_limits(&mut writer)
        .unwrap();
    Runner::new("print('second')", "test.py")
        .unwrap()
        .run_no_limits(&mut writer)
        .unwrap();
    assert_eq!(writer.output(), "first\nsecond\n");
    assert_eq!(writer.lines().collect::<Vec<_>>(), ["first", "second"]);
}

#[test]
fn no_print_suppresses_output() {
    let code = "
for i in range(100):
    print('this should be suppressed', i)
";
    let runner = Runner::new(code, "test.py").unwrap();
    assert!(runner.run_no_limits(&mut NoPrint).is_ok());
}

/// Records which calls the writer received.
#[derive(Default)]
struct Recording {
    calls: Vec<String>,
}

impl PrintWriter for Recording {
    fn write(&mut self, text: Cow<'_, str>) {
        self.calls.push(format!("write({text})"));
    }

    fn push(&mut self, ch: char) {
        self.calls.push(format!("push({ch:?})"));
    }
}

#[test]
fn separators_arrive_through_push() {
    let runner = Runner::new("print('a', 'b', sep='::')", "test.py").unwrap();
    let mut writer = Recording::default();
    runner.run_no_limits(&mut writer).unwrap();
    assert_eq!(
        writer.calls,
        ["write(a)", "push(':')", "push(':')", "write(b)", "push('\\n')"]
    );
}
