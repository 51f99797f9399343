//! Unary, binary and in-place operation helpers for the VM.

use num_integer::Integer;

use super::VM;
use crate::{
    bytecode::Opcode,
    exception::{ExcType, RunError, RunResult, SimpleException},
    heap::{HeapData, HeapId},
    io::PrintWriter,
    resource::ResourceTracker,
    types::{Dict, DictKey, Set},
    value::Value,
};

/// Longest string or sequence a repetition may produce.
const MAX_REPEAT_LEN: usize = 1 << 28;

/// Arithmetic and bitwise operators shared by the binary and in-place opcodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BinOp {
    Add,
    Sub,
    Mul,
    TrueDiv,
    FloorDiv,
    Mod,
    Pow,
    LShift,
    RShift,
    And,
    Or,
    Xor,
}

impl BinOp {
    /// Decodes an opcode into its operator and whether it is the in-place form.
    fn from_opcode(op: Opcode) -> Option<(Self, bool)> {
        let decoded = match op {
            Opcode::BinaryAdd => (Self::Add, false),
            Opcode::BinarySubtract => (Self::Sub, false),
            Opcode::BinaryMultiply => (Self::Mul, false),
            Opcode::BinaryTrueDivide => (Self::TrueDiv, false),
            Opcode::BinaryFloorDivide => (Self::FloorDiv, false),
            Opcode::BinaryModulo => (Self::Mod, false),
            Opcode::BinaryPower => (Self::Pow, false),
            Opcode::BinaryLshift => (Self::LShift, false),
            Opcode::BinaryRshift => (Self::RShift, false),
            Opcode::BinaryAnd => (Self::And, false),
            Opcode::BinaryOr => (Self::Or, false),
            Opcode::BinaryXor => (Self::Xor, false),
            Opcode::InplaceAdd => (Self::Add, true),
            Opcode::InplaceSubtract => (Self::Sub, true),
            Opcode::InplaceMultiply => (Self::Mul, true),
            Opcode::InplaceTrueDivide => (Self::TrueDiv, true),
            Opcode::InplaceFloorDivide => (Self::FloorDiv, true),
            Opcode::InplaceModulo => (Self::Mod, true),
            Opcode::InplacePower => (Self::Pow, true),
            Opcode::InplaceLshift => (Self::LShift, true),
            Opcode::InplaceRshift => (Self::RShift, true),
            Opcode::InplaceAnd => (Self::And, true),
            Opcode::InplaceOr => (Self::Or, true),
            Opcode::InplaceXor => (Self::Xor, true),
            _ => return None,
        };
        Some(decoded)
    }

    fn symbol(self) -> &'static str {
        match self {
            Self::Add => "+",
            Self::Sub => "-",
            Self::Mul => "*",
            Self::TrueDiv => "/",
            Self::FloorDiv => "//",
            Self::Mod => "%",
            Self::Pow => "**",
            Self::LShift => "<<",
            Self::RShift => ">>",
            Self::And => "&",
            Self::Or => "|",
            Self::Xor => "^",
        }
    }

    /// Stem of the dunder names: `add` gives `__add__`, `__radd__` and `__iadd__`.
    fn dunder_stem(self) -> &'static str {
        match self {
            Self::Add => "add",
            Self::Sub => "sub",
            Self::Mul => "mul",
            Self::TrueDiv => "truediv",
            Self::FloorDiv => "floordiv",
            Self::Mod => "mod",
            Self::Pow => "pow",
            Self::LShift => "lshift",
            Self::RShift => "rshift",
            Self::And => "and",
            Self::Or => "or",
            Self::Xor => "xor",
        }
    }
}

impl<T: ResourceTracker, P: PrintWriter> VM<'_, T, P> {
    /// `UNARY_*`
    pub(super) fn unary_op(&mut self, op: Opcode, operand: Value) -> RunResult<Value> {
        let (symbol, dunder) = match op {
            Opcode::UnaryNot => return Ok(Value::Bool(!self.truthy(&operand)?)),
            Opcode::UnaryPositive => ("+", "__pos__"),
            Opcode::UnaryNegative => ("-", "__neg__"),
            Opcode::UnaryInvert => ("~", "__invert__"),
            _ => return Err(RunError::internal("unary_op: not a unary opcode")),
        };
        let result = match (&operand, op) {
            (Value::Int(_) | Value::Bool(_), Opcode::UnaryPositive) => operand.as_int().map(Value::Int),
            (Value::Float(_), Opcode::UnaryPositive) => Some(operand.clone()),
            (Value::Int(_) | Value::Bool(_), Opcode::UnaryNegative) => {
                let n = operand.as_int().unwrap_or_default();
                Some(Value::Int(n.checked_neg().ok_or_else(ExcType::overflow)?))
            }
            (Value::Float(f), Opcode::UnaryNegative) => Some(Value::Float(-f)),
            (Value::Int(_) | Value::Bool(_), _) => operand.as_int().map(|n| Value::Int(!n)),
            _ => None,
        };
        if let Some(result) = result {
            return Ok(result);
        }
        match self.call_dunder(&operand, dunder, Vec::new())? {
            Some(result) => Ok(result),
            None => Err(ExcType::type_error(format!(
                "bad operand type for unary {symbol}: '{}'",
                operand.type_name(self.heap)
            ))),
        }
    }

    /// `BINARY_*` and `INPLACE_*`
    pub(crate) fn binary_opcode(&mut self, op: Opcode, lhs: Value, rhs: Value) -> RunResult<Value> {
        let (bin_op, inplace) =
            BinOp::from_opcode(op).ok_or_else(|| RunError::internal("binary_opcode: not a binary opcode"))?;
        if inplace && let Some(result) = self.inplace_op(bin_op, &lhs, &rhs)? {
            return Ok(result);
        }
        if let Some(result) = self.builtin_binary(bin_op, &lhs, &rhs)? {
            return Ok(result);
        }

        let stem = bin_op.dunder_stem();
        if let Some(result) = self.call_dunder(&lhs, &format!("__{stem}__"), vec![rhs.clone()])? {
            return Ok(result);
        }
        if let Some(result) = self.call_dunder(&rhs, &format!("__r{stem}__"), vec![lhs.clone()])? {
            return Ok(result);
        }
        let symbol = if inplace {
            format!("{}=", bin_op.symbol())
        } else {
            bin_op.symbol().to_owned()
        };
        Err(ExcType::type_error_operands(
            &symbol,
            &lhs.type_name(self.heap),
            &rhs.type_name(self.heap),
        ))
    }

    /// In-place forms that mutate their left operand: `__i*__` methods and list `+=`.
    fn inplace_op(&mut self, op: BinOp, lhs: &Value, rhs: &Value) -> RunResult<Option<Value>> {
        if let Some(result) = self.call_dunder(lhs, &format!("__i{}__", op.dunder_stem()), vec![rhs.clone()])? {
            return Ok(Some(result));
        }
        let Some(id) = lhs.ref_id() else {
            return Ok(None);
        };
        if op == BinOp::Add && matches!(self.heap.get(id), HeapData::List(_)) {
            let extra = self.collect_iterable(rhs.clone())?;
            if let HeapData::List(items) = self.heap.get_mut(id) {
                items.extend(extra);
            }
            return Ok(Some(lhs.clone()));
        }
        Ok(None)
    }

    /// Operators on builtin types; `None` when the operand types have no builtin meaning.
    fn builtin_binary(&mut self, op: BinOp, lhs: &Value, rhs: &Value) -> RunResult<Option<Value>> {
        if let (Some(a), Some(b)) = (lhs.as_int(), rhs.as_int()) {
            if matches!((lhs, rhs), (Value::Bool(_), Value::Bool(_)))
                && let Some(result) = bool_bitwise(op, a != 0, b != 0)
            {
                return Ok(Some(Value::Bool(result)));
            }
            return int_binary(op, a, b).map(Some);
        }
        if let (Some(a), Some(b)) = (lhs.as_float(), rhs.as_float()) {
            return float_binary(op, a, b);
        }
        match (lhs, rhs) {
            (Value::Str(a), Value::Str(b)) if op == BinOp::Add => {
                let mut joined = String::with_capacity(a.len() + b.len());
                joined.push_str(a);
                joined.push_str(b);
                return Ok(Some(Value::from(joined)));
            }
            (Value::Str(s), n) | (n, Value::Str(s)) if op == BinOp::Mul && n.as_int().is_some() => {
                let count = repeat_count(n, s.len())?;
                return Ok(Some(Value::from(s.repeat(count))));
            }
            _ => {}
        }
        let (Some(a), b) = (lhs.ref_id(), rhs) else {
            return match (rhs.ref_id(), lhs.as_int()) {
                (Some(seq), Some(_)) if op == BinOp::Mul => self.repeat_sequence(seq, lhs),
                _ => Ok(None),
            };
        };
        if op == BinOp::Mul && b.as_int().is_some() {
            return self.repeat_sequence(a, b);
        }
        let Some(b) = b.ref_id() else {
            return Ok(None);
        };

        let data = match (self.heap.get(a), self.heap.get(b), op) {
            (HeapData::List(x), HeapData::List(y), BinOp::Add) => HeapData::List(x.iter().chain(y).cloned().collect()),
            (HeapData::Tuple(x), HeapData::Tuple(y), BinOp::Add) => {
                HeapData::Tuple(x.iter().chain(y).cloned().collect())
            }
            (HeapData::Set(x), HeapData::Set(y), BinOp::Or | BinOp::And | BinOp::Sub | BinOp::Xor) => {
                HeapData::Set(set_binary(op, x, y))
            }
            (HeapData::Dict(x), HeapData::Dict(y), BinOp::Or) => {
                let mut merged = Dict::new();
                for (hash, key, value) in x.entries().chain(y.entries()) {
                    merged.insert(hash.clone(), key.clone(), value.clone());
                }
                HeapData::Dict(merged)
            }
            _ => return Ok(None),
        };
        Ok(Some(Value::Ref(self.heap.allocate(data)?)))
    }

    /// `seq * n` for lists and tuples.
    fn repeat_sequence(&mut self, seq: HeapId, count: &Value) -> RunResult<Option<Value>> {
        let data = match self.heap.get(seq) {
            HeapData::List(items) => HeapData::List(repeat_items(items, repeat_count(count, items.len())?)),
            HeapData::Tuple(items) => HeapData::Tuple(repeat_items(items, repeat_count(count, items.len())?)),
            _ => return Ok(None),
        };
        Ok(Some(Value::Ref(self.heap.allocate(data)?)))
    }
}

fn int_binary(op: BinOp, a: i64, b: i64) -> RunResult<Value> {
    let result = match op {
        BinOp::Add => a.checked_add(b),
        BinOp::Sub => a.checked_sub(b),
        BinOp::Mul => a.checked_mul(b),
        BinOp::TrueDiv => {
            if b == 0 {
                return Err(ExcType::zero_division("division by zero"));
            }
            return Ok(Value::Float(a as f64 / b as f64));
        }
        BinOp::FloorDiv => {
            if b == 0 {
                return Err(ExcType::zero_division("integer division or modulo by zero"));
            }
            if a == i64::MIN && b == -1 {
                None
            } else {
                Some(a.div_floor(&b))
            }
        }
        BinOp::Mod => {
            if b == 0 {
                return Err(ExcType::zero_division("integer modulo by zero"));
            }
            if b == -1 { Some(0) } else { Some(a.mod_floor(&b)) }
        }
        BinOp::Pow => {
            if b < 0 {
                if a == 0 {
                    return Err(ExcType::zero_division("0.0 cannot be raised to a negative power"));
                }
                return Ok(Value::Float((a as f64).powf(b as f64)));
            }
            match u32::try_from(b) {
                Ok(exp) => a.checked_pow(exp),
                Err(_) => match a {
                    0 | 1 => Some(a),
                    -1 => Some(if b % 2 == 0 { 1 } else { -1 }),
                    _ => None,
                },
            }
        }
        BinOp::LShift => {
            if b < 0 {
                return Err(ExcType::value_error("negative shift count"));
            }
            if a == 0 {
                Some(0)
            } else if b >= 63 {
                None
            } else {
                let shifted = a << b;
                (shifted >> b == a).then_some(shifted)
            }
        }
        BinOp::RShift => {
            if b < 0 {
                return Err(ExcType::value_error("negative shift count"));
            }
            Some(if b >= 64 { if a < 0 { -1 } else { 0 } } else { a >> b })
        }
        BinOp::And => Some(a & b),
        BinOp::Or => Some(a | b),
        BinOp::Xor => Some(a ^ b),
    };
    result.map(Value::Int).ok_or_else(ExcType::overflow)
}

fn bool_bitwise(op: BinOp, a: bool, b: bool) -> Option<bool> {
    match op {
        BinOp::And => Some(a & b),
        BinOp::Or => Some(a | b),
        BinOp::Xor => Some(a ^ b),
        _ => None,
    }
}

/// Float arithmetic; `None` for the bitwise operators, which floats do not support.
fn float_binary(op: BinOp, a: f64, b: f64) -> RunResult<Option<Value>> {
    let result = match op {
        BinOp::Add => a + b,
        BinOp::Sub => a - b,
        BinOp::Mul => a * b,
        BinOp::TrueDiv => {
            if b == 0.0 {
                return Err(ExcType::zero_division("float division by zero"));
            }
            a / b
        }
        BinOp::FloorDiv => {
            if b == 0.0 {
                return Err(ExcType::zero_division("float floor division by zero"));
            }
            (a / b).floor()
        }
        BinOp::Mod => {
            if b == 0.0 {
                return Err(ExcType::zero_division("float modulo"));
            }
            float_mod(a, b)
        }
        BinOp::Pow => {
            if a == 0.0 && b < 0.0 {
                return Err(ExcType::zero_division("0.0 cannot be raised to a negative power"));
            }
            a.powf(b)
        }
        BinOp::LShift | BinOp::RShift | BinOp::And | BinOp::Or | BinOp::Xor => return Ok(None),
    };
    Ok(Some(Value::Float(result)))
}

/// Float modulo whose result takes the sign of the divisor.
fn float_mod(a: f64, b: f64) -> f64 {
    let r = a % b;
    if r != 0.0 && (r < 0.0) != (b < 0.0) { r + b } else { r }
}

fn set_binary(op: BinOp, x: &Set, y: &Set) -> Set {
    let entries: Vec<(&DictKey, &Value)> = match op {
        BinOp::Or => x.entries().chain(y.entries()).collect(),
        BinOp::And => x.entries().filter(|(hash, _)| y.contains(hash)).collect(),
        BinOp::Sub => x.entries().filter(|(hash, _)| !y.contains(hash)).collect(),
        _ => x
            .entries()
            .filter(|(hash, _)| !y.contains(hash))
            .chain(y.entries().filter(|(hash, _)| !x.contains(hash)))
            .collect(),
    };
    let mut result = Set::new();
    for (hash, value) in entries {
        result.add(hash.clone(), value.clone());
    }
    result
}

/// Validates the repetition count of `seq * n`; negative counts give an empty result.
fn repeat_count(count: &Value, item_len: usize) -> RunResult<usize> {
    let n = usize::try_from(count.as_int().unwrap_or_default()).unwrap_or(0);
    match n.checked_mul(item_len) {
        Some(total) if total <= MAX_REPEAT_LEN => Ok(n),
        _ => Err(SimpleException::new_none(ExcType::MemoryError).into()),
    }
}

fn repeat_items(items: &[Value], count: usize) -> Vec<Value> {
    let mut out = Vec::with_capacity(items.len() * count);
    for _ in 0..count {
        out.extend_from_slice(items);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn floor_division_rounds_down() {
        assert!(matches!(int_binary(BinOp::FloorDiv, -7, 2), Ok(Value::Int(-4))));
        assert!(matches!(int_binary(BinOp::Mod, -7, 2), Ok(Value::Int(1))));
        assert!(matches!(int_binary(BinOp::Mod, 7, -2), Ok(Value::Int(-1))));
        assert!(int_binary(BinOp::FloorDiv, i64::MIN, -1).is_err());
    }

    #[test]
    fn checked_arithmetic_overflows() {
        assert!(int_binary(BinOp::Add, i64::MAX, 1).is_err());
        assert!(int_binary(BinOp::Pow, 2, 64).is_err());
        assert!(matches!(int_binary(BinOp::Pow, 2, 10), Ok(Value::Int(1024))));
        assert!(int_binary(BinOp::LShift, 1, 63).is_err());
        assert!(matches!(int_binary(BinOp::RShift, -5, 100), Ok(Value::Int(-1))));
    }

    #[test]
    fn division_by_zero() {
        assert!(int_binary(BinOp::TrueDiv, 1, 0).is_err());
        assert!(float_binary(BinOp::Mod, 1.0, 0.0).is_err());
        assert!(matches!(int_binary(BinOp::TrueDiv, 7, 2), Ok(Value::Float(f)) if f == 3.5));
    }

    #[test]
    fn float_modulo_takes_divisor_sign() {
        assert_eq!(float_mod(-1.0, 3.0), 2.0);
        assert_eq!(float_mod(1.0, -3.0), -2.0);
        assert_eq!(float_mod(6.0, 3.0), 0.0);
    }
}
