//! Output seam for the `print` builtin.

use std::borrow::Cow;

/// Receives everything a program prints.
///
/// `print(a, b)` produces `write("a")`, `push(' ')`, `write("b")`, `push('\n')`; separators
/// and the terminator always arrive through [`PrintWriter::push`].
pub trait PrintWriter {
    /// Writes the `str()` form of one argument.
    fn write(&mut self, text: Cow<'_, str>);

    /// Writes a separator or line terminator.
    fn push(&mut self, ch: char);
}

impl<P: PrintWriter + ?Sized> PrintWriter for &mut P {
    fn write(&mut self, text: Cow<'_, str>) {
        (**self).write(text);
    }

    fn push(&mut self, ch: char) {
        (**self).push(ch);
    }
}

/// Forwards output to the process's stdout.
#[derive(Debug, Default, Clone, Copy)]
pub struct StdPrint;

impl PrintWriter for StdPrint {
    fn write(&mut self, text: Cow<'_, str>) {
        print!("{text}");
    }

    fn push(&mut self, ch: char) {
        print!("{ch}");
    }
}

/// Buffers output in memory, for tests and embedders that capture it.
#[derive(Debug, Default, Clone)]
pub struct CollectStringPrint(String);

impl CollectStringPrint {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn output(&self) -> &str {
        &self.0
    }

    /// Printed lines without their terminators.
    pub fn lines(&self) -> impl Iterator<Item = &str> {
        self.0.lines()
    }

    #[must_use]
    pub fn into_output(self) -> String {
        self.0
    }
}

impl PrintWriter for CollectStringPrint {
    fn write(&mut self, text: Cow<'_, str>) {
        self.0.push_str(&text);
    }

    fn push(&mut self, ch: char) {
        self.0.push(ch);
    }
}

/// Discards output.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoPrint;

impl PrintWriter for NoPrint {
    fn write(&mut self, _text: Cow<'_, str>) {}

    fn push(&mut self, _ch: char) {}
}
