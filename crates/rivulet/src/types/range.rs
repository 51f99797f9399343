use crate::exception::{ExcType, RunResult};

/// `range(start, stop, step)`; `step` is never zero.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Range {
    pub start: i64,
    pub stop: i64,
    pub step: i64,
}

impl Range {
    pub fn new(start: i64, stop: i64, step: i64) -> RunResult<Self> {
        if step == 0 {
            return Err(ExcType::value_error("range() arg 3 must not be zero"));
        }
        Ok(Self { start, stop, step })
    }

    pub fn len(&self) -> usize {
        let (lo, hi, step) = if self.step > 0 {
            (i128::from(self.start), i128::from(self.stop), i128::from(self.step))
        } else {
            (i128::from(self.stop), i128::from(self.start), -i128::from(self.step))
        };
        if lo >= hi {
            0
        } else {
            ((hi - lo - 1) / step + 1) as usize
        }
    }

    /// Item at a non-negative position, `None` past the end.
    pub fn get(&self, index: usize) -> Option<i64> {
        if index >= self.len() {
            return None;
        }
        Some(self.start + self.step * index as i64)
    }

    pub fn contains(&self, value: i64) -> bool {
        let in_bounds = if self.step > 0 {
            self.start <= value && value < self.stop
        } else {
            self.stop < value && value <= self.start
        };
        in_bounds && (i128::from(value) - i128::from(self.start)) % i128::from(self.step) == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lengths() {
        assert_eq!(Range::new(0, 3, 1).unwrap().len(), 3);
        assert_eq!(Range::new(0, 10, 3).unwrap().len(), 4);
        assert_eq!(Range::new(5, 0, -2).unwrap().len(), 3);
        assert_eq!(Range::new(3, 3, 1).unwrap().len(), 0);
        assert_eq!(Range::new(3, 0, 1).unwrap().len(), 0);
    }

    #[test]
    fn zero_step_is_rejected() {
        assert!(Range::new(0, 1, 0).is_err());
    }

    #[test]
    fn membership_respects_step() {
        let r = Range::new(1, 10, 3).unwrap();
        assert!(r.contains(7));
        assert!(!r.contains(8));
        assert!(!r.contains(10));
        assert_eq!(r.get(2), Some(7));
        assert_eq!(r.get(3), None);
    }
}
