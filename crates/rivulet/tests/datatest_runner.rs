use std::error::Error;
use std::fs;
use std::path::Path;

use rivulet::{CollectStringPrint, Error as RunnerError, Runner};

/// Represents the expected outcome of a test fixture
#[derive(Debug, Clone)]
enum Expectation {
    /// Expect an escaped exception, compared by its `Type('message')` summary
    Raise(String),
    /// Expect compilation (or parsing) to fail with this message
    CompileError(String),
    /// Expect successful execution, check str() of the result
    ReturnStr(String),
    /// Expect successful execution, check repr() of the result
    Return(String),
    /// Expect successful execution, check the printed output (`\n` escapes allowed)
    Output(String),
    /// Expect successful execution without raising an exception (no return value check).
    /// Used for tests that rely on asserts or just verify code runs.
    NoException,
}

/// Parse a fixture file into code and expected outcome.
///
/// The file may have an expectation comment as the LAST line:
/// - `# Raise=ExceptionType('message')` - Exception format
/// - `# CompileError=message` - Parse or compile error, as displayed
/// - `# Return.str=value` - Check str() of the result
/// - `# Return=value` - Check repr() of the result
/// - `# Output=text` - Check everything printed
///
/// If no expectation comment is present, the test just verifies the code runs without exception.
fn parse_fixture(content: &str) -> (String, Expectation) {
    let lines: Vec<&str> = content.lines().collect();
    assert!(!lines.is_empty(), "Empty fixture file");

    if lines[0].starts_with("# Return") || lines[0].starts_with("# Raise") || lines[0].starts_with("# CompileError") {
        panic!("Expectation comment must be on the LAST line, not the first line");
    }

    let last_line = lines[lines.len() - 1];
    let body = &lines[..lines.len() - 1];

    // Check more specific patterns first (Return.str) before general Return
    let (expectation, code_lines) = if let Some(expected) = last_line.strip_prefix("# Return.str=") {
        (Expectation::ReturnStr(expected.to_string()), body)
    } else if let Some(expected) = last_line.strip_prefix("# Return=") {
        (Expectation::Return(expected.to_string()), body)
    } else if let Some(expected) = last_line.strip_prefix("# Raise=") {
        (Expectation::Raise(expected.to_string()), body)
    } else if let Some(expected) = last_line.strip_prefix("# CompileError=") {
        (Expectation::CompileError(expected.to_string()), body)
    } else if let Some(expected) = last_line.strip_prefix("# Output=") {
        (Expectation::Output(expected.replace("\\n", "\n")), body)
    } else {
        (Expectation::NoException, &lines[..])
    };

    (code_lines.join("\n"), expectation)
}

/// Run a test with the given code and expectation
fn run_test(path: &Path, code: &str, expectation: Expectation) {
    let test_name = path.strip_prefix("test_cases/").unwrap_or(path).display().to_string();

    let runner = match Runner::new(code, "test.py") {
        Ok(runner) => runner,
        Err(err) => {
            if let Expectation::CompileError(expected) = expectation {
                assert_eq!(err.to_string(), expected, "[{test_name}] Compile error mismatch");
            } else {
                panic!("[{test_name}] Unexpected compile error: {err}");
            }
            return;
        }
    };

    let mut out = CollectStringPrint::new();
    match runner.run_no_limits(&mut out) {
        Ok(obj) => match expectation {
            Expectation::ReturnStr(expected) => {
                assert_eq!(obj.to_string(), expected, "[{test_name}] str() mismatch");
            }
            Expectation::Return(expected) => {
                assert_eq!(obj.py_repr(), expected, "[{test_name}] py_repr() mismatch");
            }
            Expectation::Output(expected) => {
                assert_eq!(out.output(), expected, "[{test_name}] output mismatch");
            }
            Expectation::NoException => {}
            other => panic!("[{test_name}] Expected {other:?}, but the code returned {}", obj.py_repr()),
        },
        Err(RunnerError::Exception(exc)) => {
            if let Expectation::Raise(expected) = expectation {
                assert_eq!(exc.summary(), expected, "[{test_name}] Exception mismatch");
            } else {
                panic!("[{test_name}] Unexpected exception:\n{exc}");
            }
        }
        Err(err) => panic!("[{test_name}] Unexpected error: {err}"),
    }
}

/// Test function that runs each fixture
fn run_test_cases(path: &Path) -> Result<(), Box<dyn Error>> {
    let content = fs::read_to_string(path)?;
    let (code, expectation) = parse_fixture(&content);
    run_test(path, &code, expectation);
    Ok(())
}

// Generate tests for all fixture files using datatest-stable harness macro
datatest_stable::harness!(run_test_cases, "test_cases", r"^.*\.py$");
