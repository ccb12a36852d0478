//! Binary, unary, and select operators over element types.
//!
//! An operator holds its typed signature and an opaque source fragment that
//! the accelerator compiler inlines into kernel templates. This hosted build
//! maps the known built-in fragments (`+`, `*`, `min`, `max`, `land`, `lor`,
//! `first`, `second`, `== 0`, `!= 0`, `identity`) to native callables and
//! declines everything else with `NotImplemented` at evaluation time;
//! foreign fragments still register and type-check eagerly.
//!
//! A `void` operand carries structure without a value: applying any binary
//! kernel to a `void` and a non-`void` operand passes the non-`void` value
//! through, and `void` with `void` stays `void`.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crate::error::{Error, Result};
use crate::types::{Type, Value};

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub(crate) enum BinaryKernel {
    Plus,
    Times,
    Min,
    Max,
    LAnd,
    LOr,
    First,
    Second,
    Foreign,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub(crate) enum UnaryKernel {
    Identity,
    Foreign,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub(crate) enum SelectKernel {
    EqZero,
    NeZero,
    Foreign,
}

fn parse_binary(source: &str) -> BinaryKernel {
    match source.trim() {
        "+" | "plus" => BinaryKernel::Plus,
        "*" | "times" => BinaryKernel::Times,
        "min" => BinaryKernel::Min,
        "max" => BinaryKernel::Max,
        "land" => BinaryKernel::LAnd,
        "lor" => BinaryKernel::LOr,
        "first" => BinaryKernel::First,
        "second" => BinaryKernel::Second,
        _ => BinaryKernel::Foreign,
    }
}

fn parse_unary(source: &str) -> UnaryKernel {
    match source.trim() {
        "identity" | "id" => UnaryKernel::Identity,
        _ => UnaryKernel::Foreign,
    }
}

fn parse_select(source: &str) -> SelectKernel {
    match source.trim() {
        "== 0" | "==0" | "eqzero" => SelectKernel::EqZero,
        "!= 0" | "!=0" | "nezero" => SelectKernel::NeZero,
        _ => SelectKernel::Foreign,
    }
}

macro_rules! arith_kernel {
    ($name:ident, $int_method:ident, $float_op:tt, $bool_op:tt) => {
        fn $name(x: &Value, y: &Value) -> Option<Value> {
            use Value::*;
            Some(match (x, y) {
                (Bool(a), Bool(b)) => Bool(*a $bool_op *b),
                (Int8(a), Int8(b)) => Int8(a.$int_method(*b)),
                (Int16(a), Int16(b)) => Int16(a.$int_method(*b)),
                (Int32(a), Int32(b)) => Int32(a.$int_method(*b)),
                (Int64(a), Int64(b)) => Int64(a.$int_method(*b)),
                (UInt8(a), UInt8(b)) => UInt8(a.$int_method(*b)),
                (UInt16(a), UInt16(b)) => UInt16(a.$int_method(*b)),
                (UInt32(a), UInt32(b)) => UInt32(a.$int_method(*b)),
                (UInt64(a), UInt64(b)) => UInt64(a.$int_method(*b)),
                (Float32(a), Float32(b)) => Float32(*a $float_op *b),
                (Float64(a), Float64(b)) => Float64(*a $float_op *b),
                _ => return None,
            })
        }
    };
}

macro_rules! ord_kernel {
    ($name:ident, $method:ident) => {
        fn $name(x: &Value, y: &Value) -> Option<Value> {
            use Value::*;
            Some(match (x, y) {
                (Bool(a), Bool(b)) => Bool((*a).$method(*b)),
                (Int8(a), Int8(b)) => Int8((*a).$method(*b)),
                (Int16(a), Int16(b)) => Int16((*a).$method(*b)),
                (Int32(a), Int32(b)) => Int32((*a).$method(*b)),
                (Int64(a), Int64(b)) => Int64((*a).$method(*b)),
                (UInt8(a), UInt8(b)) => UInt8((*a).$method(*b)),
                (UInt16(a), UInt16(b)) => UInt16((*a).$method(*b)),
                (UInt32(a), UInt32(b)) => UInt32((*a).$method(*b)),
                (UInt64(a), UInt64(b)) => UInt64((*a).$method(*b)),
                (Float32(a), Float32(b)) => Float32((*a).$method(*b)),
                (Float64(a), Float64(b)) => Float64((*a).$method(*b)),
                _ => return None,
            })
        }
    };
}

arith_kernel!(apply_plus, wrapping_add, +, |);
arith_kernel!(apply_times, wrapping_mul, *, &);
ord_kernel!(apply_min, min);
ord_kernel!(apply_max, max);

/// Produce `flag` as one/zero in the same kind as `sample`.
fn flag_like(sample: &Value, flag: bool) -> Value {
    use Value::*;
    let v: u8 = if flag { 1 } else { 0 };
    match sample {
        Bool(_) => Bool(flag),
        Int8(_) => Int8(v as i8),
        Int16(_) => Int16(v as i16),
        Int32(_) => Int32(v as i32),
        Int64(_) => Int64(v as i64),
        UInt8(_) => UInt8(v),
        UInt16(_) => UInt16(v as u16),
        UInt32(_) => UInt32(v as u32),
        UInt64(_) => UInt64(v as u64),
        Float32(_) => Float32(v as f32),
        Float64(_) => Float64(v as f64),
        Void => Void,
        User(_) => Void,
    }
}

/// Binary operator `(A, B) → C`.
#[derive(Debug)]
pub struct BinaryOp {
    a: Arc<Type>,
    b: Arc<Type>,
    c: Arc<Type>,
    source: String,
    kernel: BinaryKernel,
}

impl BinaryOp {
    /// Register a binary operator; type compatibility is checked eagerly.
    pub fn make(a: Arc<Type>, b: Arc<Type>, c: Arc<Type>, source: &str) -> Result<Arc<Self>> {
        let kernel = parse_binary(source);
        match kernel {
            BinaryKernel::Plus
            | BinaryKernel::Times
            | BinaryKernel::Min
            | BinaryKernel::Max
            | BinaryKernel::LAnd
            | BinaryKernel::LOr => {
                if a != b || b != c {
                    return Err(Error::type_mismatch(format!(
                        "builtin `{source}` requires a uniform signature, got ({}, {}) -> {}",
                        a.name(),
                        b.name(),
                        c.name()
                    )));
                }
            }
            BinaryKernel::First => {
                if a != c {
                    return Err(Error::type_mismatch(format!(
                        "`first` must return its left operand type, got ({}, {}) -> {}",
                        a.name(),
                        b.name(),
                        c.name()
                    )));
                }
            }
            BinaryKernel::Second => {
                if b != c {
                    return Err(Error::type_mismatch(format!(
                        "`second` must return its right operand type, got ({}, {}) -> {}",
                        a.name(),
                        b.name(),
                        c.name()
                    )));
                }
            }
            BinaryKernel::Foreign => {}
        }
        Ok(Arc::new(Self {
            a,
            b,
            c,
            source: source.to_string(),
            kernel,
        }))
    }

    pub fn arg_a(&self) -> &Arc<Type> {
        &self.a
    }

    pub fn arg_b(&self) -> &Arc<Type> {
        &self.b
    }

    pub fn result(&self) -> &Arc<Type> {
        &self.c
    }

    /// Opaque source fragment.
    pub fn source(&self) -> &str {
        &self.source
    }

    pub(crate) fn kernel(&self) -> BinaryKernel {
        self.kernel
    }

    /// Value a reduction with this operator can never leave once reached,
    /// if one exists. Consulted by the `EarlyExit` descriptor hint.
    pub(crate) fn saturation(&self) -> Option<Value> {
        match self.kernel {
            BinaryKernel::LAnd => Some(flag_like(&Value::zero_of(&self.c), false)),
            BinaryKernel::LOr => Some(flag_like(&Value::zero_of(&self.c), true)),
            _ => None,
        }
    }

    /// Evaluate on the host.
    pub fn apply(&self, x: &Value, y: &Value) -> Result<Value> {
        // Structure-only operands pass the other side through.
        match (x, y) {
            (Value::Void, Value::Void) => return Ok(Value::Void),
            (Value::Void, other) => return Ok(other.clone()),
            (other, Value::Void) => return Ok(other.clone()),
            _ => {}
        }
        let out = match self.kernel {
            BinaryKernel::Plus => apply_plus(x, y),
            BinaryKernel::Times => apply_times(x, y),
            BinaryKernel::Min => apply_min(x, y),
            BinaryKernel::Max => apply_max(x, y),
            BinaryKernel::LAnd => Some(flag_like(x, !x.is_zero() && !y.is_zero())),
            BinaryKernel::LOr => Some(flag_like(x, !x.is_zero() || !y.is_zero())),
            BinaryKernel::First => Some(x.clone()),
            BinaryKernel::Second => Some(y.clone()),
            BinaryKernel::Foreign => {
                return Err(Error::not_implemented(format!(
                    "no host callable for operator source `{}`",
                    self.source
                )))
            }
        };
        out.ok_or_else(|| {
            Error::type_mismatch(format!(
                "operator `{}` applied to mismatched values {:?} and {:?}",
                self.source, x, y
            ))
        })
    }
}

/// Unary operator `A → B`.
#[derive(Debug)]
pub struct UnaryOp {
    a: Arc<Type>,
    b: Arc<Type>,
    source: String,
    kernel: UnaryKernel,
}

impl UnaryOp {
    pub fn make(a: Arc<Type>, b: Arc<Type>, source: &str) -> Result<Arc<Self>> {
        let kernel = parse_unary(source);
        if kernel == UnaryKernel::Identity && a != b {
            return Err(Error::type_mismatch(format!(
                "`identity` requires equal input/output types, got {} -> {}",
                a.name(),
                b.name()
            )));
        }
        Ok(Arc::new(Self {
            a,
            b,
            source: source.to_string(),
            kernel,
        }))
    }

    pub fn arg(&self) -> &Arc<Type> {
        &self.a
    }

    pub fn result(&self) -> &Arc<Type> {
        &self.b
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn apply(&self, x: &Value) -> Result<Value> {
        match self.kernel {
            UnaryKernel::Identity => Ok(x.clone()),
            UnaryKernel::Foreign => Err(Error::not_implemented(format!(
                "no host callable for operator source `{}`",
                self.source
            ))),
        }
    }
}

/// Select operator `A → bool`.
#[derive(Debug)]
pub struct SelectOp {
    a: Arc<Type>,
    source: String,
    kernel: SelectKernel,
}

impl SelectOp {
    pub fn make(a: Arc<Type>, source: &str) -> Result<Arc<Self>> {
        Ok(Arc::new(Self {
            a,
            source: source.to_string(),
            kernel: parse_select(source),
        }))
    }

    pub fn arg(&self) -> &Arc<Type> {
        &self.a
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn apply(&self, x: &Value) -> Result<bool> {
        match self.kernel {
            SelectKernel::EqZero => Ok(x.is_zero()),
            SelectKernel::NeZero => Ok(!x.is_zero()),
            SelectKernel::Foreign => Err(Error::not_implemented(format!(
                "no host callable for operator source `{}`",
                self.source
            ))),
        }
    }
}

/// Standard operators seeded per element type, cached by `(name, type)`.
pub struct OpCatalogue {
    binary: Mutex<HashMap<(String, String), Arc<BinaryOp>>>,
    unary: Mutex<HashMap<(String, String), Arc<UnaryOp>>>,
    select: Mutex<HashMap<(String, String), Arc<SelectOp>>>,
}

impl OpCatalogue {
    pub(crate) fn new() -> Self {
        Self {
            binary: Mutex::new(HashMap::new()),
            unary: Mutex::new(HashMap::new()),
            select: Mutex::new(HashMap::new()),
        }
    }

    /// Standard binary operator over a uniform signature `(T, T) → T`.
    ///
    /// Recognised names: `plus`, `times`, `min`, `max`, `land`, `lor`,
    /// `first`, `second`.
    pub fn binary(&self, name: &str, ty: &Arc<Type>) -> Result<Arc<BinaryOp>> {
        let key = (name.to_string(), ty.name().to_string());
        let mut cache = self.binary.lock().expect("op catalogue mutex poisoned");
        if let Some(op) = cache.get(&key) {
            return Ok(op.clone());
        }
        if parse_binary(name) == BinaryKernel::Foreign {
            return Err(Error::invalid_argument(format!(
                "`{name}` is not a standard binary operator"
            )));
        }
        let op = BinaryOp::make(ty.clone(), ty.clone(), ty.clone(), name)?;
        cache.insert(key, op.clone());
        Ok(op)
    }

    /// Standard unary operator; only `identity` is predefined.
    pub fn unary(&self, name: &str, ty: &Arc<Type>) -> Result<Arc<UnaryOp>> {
        let key = (name.to_string(), ty.name().to_string());
        let mut cache = self.unary.lock().expect("op catalogue mutex poisoned");
        if let Some(op) = cache.get(&key) {
            return Ok(op.clone());
        }
        if parse_unary(name) == UnaryKernel::Foreign {
            return Err(Error::invalid_argument(format!(
                "`{name}` is not a standard unary operator"
            )));
        }
        let op = UnaryOp::make(ty.clone(), ty.clone(), name)?;
        cache.insert(key, op.clone());
        Ok(op)
    }

    /// Standard select operator; `eqzero` and `nezero` are predefined.
    pub fn select(&self, name: &str, ty: &Arc<Type>) -> Result<Arc<SelectOp>> {
        let key = (name.to_string(), ty.name().to_string());
        let mut cache = self.select.lock().expect("op catalogue mutex poisoned");
        if let Some(op) = cache.get(&key) {
            return Ok(op.clone());
        }
        if parse_select(name) == SelectKernel::Foreign {
            return Err(Error::invalid_argument(format!(
                "`{name}` is not a standard select operator"
            )));
        }
        let op = SelectOp::make(ty.clone(), name)?;
        cache.insert(key, op.clone());
        Ok(op)
    }
}

/// The right-biased accumulator synthesised when `AccumResult` is requested
/// without an explicit operator.
pub(crate) fn default_accum(ty: &Arc<Type>) -> Arc<BinaryOp> {
    BinaryOp::make(ty.clone(), ty.clone(), ty.clone(), "second")
        .expect("`second` over a uniform signature always type-checks")
}

/// The duplicate reducer used by bulk ingress when none is supplied.
pub(crate) fn keep_first(ty: &Arc<Type>) -> Arc<BinaryOp> {
    BinaryOp::make(ty.clone(), ty.clone(), ty.clone(), "first")
        .expect("`first` over a uniform signature always type-checks")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::TypeCatalogue;

    fn i32t() -> Arc<Type> {
        TypeCatalogue::new().find_type("i32").unwrap()
    }

    #[test]
    fn plus_and_times_on_i32() {
        let t = i32t();
        let plus = BinaryOp::make(t.clone(), t.clone(), t.clone(), "+").unwrap();
        let times = BinaryOp::make(t.clone(), t.clone(), t.clone(), "*").unwrap();
        assert_eq!(plus.apply(&Value::Int32(2), &Value::Int32(3)).unwrap(), Value::Int32(5));
        assert_eq!(times.apply(&Value::Int32(2), &Value::Int32(3)).unwrap(), Value::Int32(6));
    }

    #[test]
    fn min_max_land_lor() {
        let t = i32t();
        let cat = OpCatalogue::new();
        let min = cat.binary("min", &t).unwrap();
        let max = cat.binary("max", &t).unwrap();
        let land = cat.binary("land", &t).unwrap();
        let lor = cat.binary("lor", &t).unwrap();
        assert_eq!(min.apply(&Value::Int32(2), &Value::Int32(3)).unwrap(), Value::Int32(2));
        assert_eq!(max.apply(&Value::Int32(2), &Value::Int32(3)).unwrap(), Value::Int32(3));
        assert_eq!(land.apply(&Value::Int32(2), &Value::Int32(0)).unwrap(), Value::Int32(0));
        assert_eq!(lor.apply(&Value::Int32(2), &Value::Int32(0)).unwrap(), Value::Int32(1));
    }

    #[test]
    fn first_second_bias() {
        let t = i32t();
        let first = keep_first(&t);
        let second = default_accum(&t);
        assert_eq!(first.apply(&Value::Int32(1), &Value::Int32(9)).unwrap(), Value::Int32(1));
        assert_eq!(second.apply(&Value::Int32(1), &Value::Int32(9)).unwrap(), Value::Int32(9));
    }

    #[test]
    fn void_operand_passes_structure_through() {
        let t = i32t();
        let plus = BinaryOp::make(t.clone(), t.clone(), t.clone(), "+").unwrap();
        assert_eq!(plus.apply(&Value::Void, &Value::Int32(7)).unwrap(), Value::Int32(7));
        assert_eq!(plus.apply(&Value::Int32(7), &Value::Void).unwrap(), Value::Int32(7));
        assert_eq!(plus.apply(&Value::Void, &Value::Void).unwrap(), Value::Void);
    }

    #[test]
    fn foreign_source_registers_but_declines_host_eval() {
        let t = i32t();
        let op = BinaryOp::make(t.clone(), t.clone(), t.clone(), "{ return a ^ b; }").unwrap();
        let err = op.apply(&Value::Int32(1), &Value::Int32(2)).unwrap_err();
        assert_eq!(err.status(), crate::error::Status::NotImplemented);
    }

    #[test]
    fn mismatched_signature_is_rejected_eagerly() {
        let cat = TypeCatalogue::new();
        let a = cat.find_type("i32").unwrap();
        let b = cat.find_type("f64").unwrap();
        let err = BinaryOp::make(a.clone(), b.clone(), a.clone(), "+").unwrap_err();
        assert_eq!(err.status(), crate::error::Status::TypeMismatch);
    }

    #[test]
    fn selects_classify_zero() {
        let t = i32t();
        let eq = SelectOp::make(t.clone(), "== 0").unwrap();
        let ne = SelectOp::make(t.clone(), "!= 0").unwrap();
        assert!(eq.apply(&Value::Int32(0)).unwrap());
        assert!(!eq.apply(&Value::Int32(4)).unwrap());
        assert!(ne.apply(&Value::Int32(4)).unwrap());
    }

    #[test]
    fn identity_unary() {
        let t = i32t();
        let id = UnaryOp::make(t.clone(), t.clone(), "identity").unwrap();
        assert_eq!(id.apply(&Value::Int32(3)).unwrap(), Value::Int32(3));
    }

    #[test]
    fn saturation_values() {
        let t = i32t();
        let cat = OpCatalogue::new();
        assert_eq!(cat.binary("land", &t).unwrap().saturation(), Some(Value::Int32(0)));
        assert_eq!(cat.binary("lor", &t).unwrap().saturation(), Some(Value::Int32(1)));
        assert_eq!(cat.binary("plus", &t).unwrap().saturation(), None);
    }
}
