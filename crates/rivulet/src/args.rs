use std::sync::Arc;

use crate::{
    exception::{ExcType, RunResult},
    heap::{HeapId, Trace},
    value::Value,
};

/// Arguments of a call, as popped by `CALL_FUNCTION`.
///
/// Keyword arguments keep call-site order, which is the order binding reports
/// errors in.
#[derive(Debug, Default)]
pub(crate) struct ArgValues {
    pub positional: Vec<Value>,
    pub kwargs: Vec<(Arc<str>, Value)>,
}

impl ArgValues {
    pub fn new(positional: Vec<Value>, kwargs: Vec<(Arc<str>, Value)>) -> Self {
        Self { positional, kwargs }
    }

    pub fn positional(positional: Vec<Value>) -> Self {
        Self {
            positional,
            kwargs: Vec::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.positional.len()
    }

    /// Prepends a receiver for method calls.
    pub fn with_receiver(mut self, receiver: Value) -> Self {
        self.positional.insert(0, receiver);
        self
    }

    /// Removes a keyword argument by name.
    pub fn take_kwarg(&mut self, name: &str) -> Option<Value> {
        let idx = self.kwargs.iter().position(|(key, _)| &**key == name)?;
        Some(self.kwargs.remove(idx).1)
    }

    /// Fails if any keyword argument is left, naming the first one.
    pub fn check_no_kwargs(&self, name: &str) -> RunResult<()> {
        match self.kwargs.first() {
            None => Ok(()),
            Some((key, _)) if self.kwargs.len() == 1 => Err(ExcType::type_error_unexpected_keyword(name, key)),
            Some(_) => Err(ExcType::type_error_no_kwargs(name)),
        }
    }

    /// Checks that no arguments were passed at all.
    pub fn check_zero_args(&self, name: &str) -> RunResult<()> {
        self.check_no_kwargs(name)?;
        if self.positional.is_empty() {
            Ok(())
        } else {
            Err(ExcType::type_error(format!(
                "{name}() takes no arguments ({} given)",
                self.positional.len()
            )))
        }
    }

    /// Checks that exactly one positional argument was passed, returning it.
    pub fn get_one_arg(self, name: &str) -> RunResult<Value> {
        let [a] = self.exactly::<1>(name)?;
        Ok(a)
    }

    /// Checks that exactly two positional arguments were passed.
    pub fn get_two_args(self, name: &str) -> RunResult<(Value, Value)> {
        let [a, b] = self.exactly::<2>(name)?;
        Ok((a, b))
    }

    /// Checks that one or two positional arguments were passed.
    pub fn get_one_two_args(self, name: &str) -> RunResult<(Value, Option<Value>)> {
        self.check_no_kwargs(name)?;
        let count = self.positional.len();
        let mut iter = self.positional.into_iter();
        match (iter.next(), iter.next(), count) {
            (Some(a), b, 1 | 2) => Ok((a, b)),
            (None, ..) => Err(ExcType::type_error_at_least(name, 1, 0)),
            _ => Err(ExcType::type_error_at_most(name, 2, count)),
        }
    }

    /// Checks that at most `max` positional arguments were passed.
    pub fn get_at_most(self, name: &str, max: usize) -> RunResult<Vec<Value>> {
        self.check_no_kwargs(name)?;
        if self.positional.len() > max {
            return Err(ExcType::type_error_at_most(name, max, self.positional.len()));
        }
        Ok(self.positional)
    }

    fn exactly<const N: usize>(self, name: &str) -> RunResult<[Value; N]> {
        self.check_no_kwargs(name)?;
        let count = self.positional.len();
        self.positional.try_into().map_err(|_| {
            if N == 1 {
                ExcType::type_error(format!("{name}() takes exactly one argument ({count} given)"))
            } else {
                ExcType::type_error(format!("{name} expected {N} arguments, got {count}"))
            }
        })
    }
}

impl Trace for ArgValues {
    fn mark_children(&self, work_list: &mut Vec<HeapId>) {
        self.positional.mark_children(work_list);
        for (_, value) in &self.kwargs {
            value.mark_children(work_list);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn arity_errors_name_the_callable() {
        let args = ArgValues::positional(vec![Value::Int(1), Value::Int(2)]);
        assert!(args.get_one_arg("len").is_err());

        let (a, b) = ArgValues::positional(vec![Value::Int(1)]).get_one_two_args("next").unwrap();
        assert_eq!(a.as_int(), Some(1));
        assert!(b.is_none());
    }

    #[test]
    fn kwargs_are_taken_by_name() {
        let mut args = ArgValues::new(vec![], vec![(Arc::from("sep"), Value::from("-"))]);
        assert!(args.take_kwarg("end").is_none());
        assert!(args.take_kwarg("sep").is_some());
        assert!(args.check_no_kwargs("print").is_ok());
    }
}
