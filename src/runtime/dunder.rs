//! 연산자 → 메서드 이름 테이블과 일반 디스패치 경로
//!
//! 모든 연산자는 데이터 테이블로 정의됩니다. 디스패치는 단일 프로토콜을
//! 따릅니다: receiver의 타입을 가져오고, MRO에서 메서드 이름을 찾고,
//! 소스 순서대로 인자 목록을 만들어 caller instance 없이 호출합니다.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::runtime::exceptions::{RtResult, raise};
use crate::runtime::value::Value;

// ========== 연산자 테이블 ==========

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryOp {
    Negative = 0,
    Positive = 1,
}

impl UnaryOp {
    pub fn method_name(self) -> &'static str {
        match self {
            UnaryOp::Negative => "__neg__",
            UnaryOp::Positive => "__pos__",
        }
    }

    pub fn code(self) -> i64 {
        self as i64
    }

    pub fn from_code(code: i64) -> Option<Self> {
        match code {
            0 => Some(UnaryOp::Negative),
            1 => Some(UnaryOp::Positive),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    Add = 0,
    Sub = 1,
    Mul = 2,
    FloorDiv = 3,
    TrueDiv = 4,
    Mod = 5,
    GetItem = 6,
}

impl BinaryOp {
    pub fn method_name(self) -> &'static str {
        match self {
            BinaryOp::Add => "__add__",
            BinaryOp::Sub => "__sub__",
            BinaryOp::Mul => "__mul__",
            BinaryOp::FloorDiv => "__floordiv__",
            BinaryOp::TrueDiv => "__truediv__",
            BinaryOp::Mod => "__mod__",
            BinaryOp::GetItem => "__getitem__",
        }
    }

    pub fn symbol(self) -> &'static str {
        match self {
            BinaryOp::Add => "+",
            BinaryOp::Sub => "-",
            BinaryOp::Mul => "*",
            BinaryOp::FloorDiv => "//",
            BinaryOp::TrueDiv => "/",
            BinaryOp::Mod => "%",
            BinaryOp::GetItem => "[]",
        }
    }

    pub fn code(self) -> i64 {
        self as i64
    }

    pub fn from_code(code: i64) -> Option<Self> {
        match code {
            0 => Some(BinaryOp::Add),
            1 => Some(BinaryOp::Sub),
            2 => Some(BinaryOp::Mul),
            3 => Some(BinaryOp::FloorDiv),
            4 => Some(BinaryOp::TrueDiv),
            5 => Some(BinaryOp::Mod),
            6 => Some(BinaryOp::GetItem),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TernaryOp {
    SetItem = 0,
}

impl TernaryOp {
    pub fn method_name(self) -> &'static str {
        match self {
            TernaryOp::SetItem => "__setitem__",
        }
    }
}

/// 비교 연산자. opcode 페이로드로 직렬화되므로 serde가 필요합니다.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CompareOp {
    Lt = 0,
    Le = 1,
    Eq = 2,
    Ne = 3,
    Gt = 4,
    Ge = 5,
}

impl CompareOp {
    pub fn method_name(self) -> &'static str {
        match self {
            CompareOp::Lt => "__lt__",
            CompareOp::Le => "__le__",
            CompareOp::Eq => "__eq__",
            CompareOp::Ne => "__ne__",
            CompareOp::Gt => "__gt__",
            CompareOp::Ge => "__ge__",
        }
    }

    pub fn symbol(self) -> &'static str {
        match self {
            CompareOp::Lt => "<",
            CompareOp::Le => "<=",
            CompareOp::Eq => "==",
            CompareOp::Ne => "!=",
            CompareOp::Gt => ">",
            CompareOp::Ge => ">=",
        }
    }

    pub fn code(self) -> i64 {
        self as i64
    }

    pub fn from_code(code: i64) -> Option<Self> {
        match code {
            0 => Some(CompareOp::Lt),
            1 => Some(CompareOp::Le),
            2 => Some(CompareOp::Eq),
            3 => Some(CompareOp::Ne),
            4 => Some(CompareOp::Gt),
            5 => Some(CompareOp::Ge),
            _ => None,
        }
    }
}

// ========== 디스패치 ==========

/// 공통 디스패치: receiver 타입의 MRO에서 메서드를 찾아 호출
///
/// args[0]이 receiver이고 나머지가 소스 순서의 피연산자입니다.
/// caller instance는 전달하지 않습니다.
fn dispatch(method_name: &str, symbol: &str, args: &[Value]) -> RtResult<Value> {
    let receiver = &args[0];
    let ty = receiver.get_type();
    let method = ty.lookup_mro(method_name).ok_or_else(|| {
        raise(
            "TypeError",
            format!("unsupported operand type for {}: '{}'", symbol, ty.name),
        )
    })?;
    let callable = method.as_callable().ok_or_else(|| {
        raise(
            "TypeError",
            format!("'{}' attribute '{}' is not callable", ty.name, method_name),
        )
    })?;
    callable.call(args, &HashMap::new(), None)
}

pub fn dispatch_unary(op: UnaryOp, operand: Value) -> RtResult<Value> {
    dispatch(op.method_name(), op.method_name(), &[operand])
}

pub fn dispatch_binary(op: BinaryOp, lhs: Value, rhs: Value) -> RtResult<Value> {
    dispatch(op.method_name(), op.symbol(), &[lhs, rhs])
}

pub fn dispatch_ternary(op: TernaryOp, a: Value, b: Value, c: Value) -> RtResult<Value> {
    dispatch(op.method_name(), op.method_name(), &[a, b, c])
}

pub fn dispatch_compare(op: CompareOp, lhs: Value, rhs: Value) -> RtResult<Value> {
    dispatch(op.method_name(), op.symbol(), &[lhs, rhs])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::value::eq_values;

    #[test]
    fn test_binary_dispatch_int() {
        let r = dispatch_binary(BinaryOp::Add, Value::Int(2), Value::Int(3)).unwrap();
        assert_eq!(r, Value::Int(5));
    }

    #[test]
    fn test_binary_dispatch_str_concat() {
        let r = dispatch_binary(BinaryOp::Add, Value::str("ab"), Value::str("cd")).unwrap();
        assert!(eq_values(&r, &Value::str("abcd")));
    }

    #[test]
    fn test_dispatch_missing_method_is_type_error() {
        let r = dispatch_binary(BinaryOp::Sub, Value::str("a"), Value::str("b"));
        assert_eq!(r.unwrap_err().type_name(), "TypeError");
    }

    #[test]
    fn test_compare_dispatch() {
        let r = dispatch_compare(CompareOp::Lt, Value::Int(1), Value::Int(2)).unwrap();
        assert_eq!(r, Value::Bool(true));
        let r = dispatch_compare(CompareOp::Ge, Value::Int(1), Value::Int(2)).unwrap();
        assert_eq!(r, Value::Bool(false));
    }

    #[test]
    fn test_unary_dispatch() {
        let r = dispatch_unary(UnaryOp::Negative, Value::Int(7)).unwrap();
        assert_eq!(r, Value::Int(-7));
    }

    #[test]
    fn test_dispatch_respects_declared_base_precedence() {
        use std::sync::Arc;

        use crate::runtime::types::{TypeFlags, TypeObject, registry};
        use crate::runtime::value::{Arity, Object, ObjectData};

        let reg = registry();
        let left = TypeObject::new("DLeft", vec![reg.object_type.clone()], TypeFlags::empty(), None)
            .unwrap();
        left.define("__add__", Value::native_fn("__add__", Arity::Exact(2), |_| Ok(Value::Int(1))));
        let right =
            TypeObject::new("DRight", vec![reg.object_type.clone()], TypeFlags::empty(), None)
                .unwrap();
        right.define("__add__", Value::native_fn("__add__", Arity::Exact(2), |_| Ok(Value::Int(2))));

        // 베이스 선언 순서가 조회 순서를 결정
        let both =
            TypeObject::new("DBoth", vec![left.clone(), right.clone()], TypeFlags::empty(), None)
                .unwrap();
        let instance =
            Value::Object(Arc::new(Object::new_with_attrs(both, ObjectData::Instance)));

        let r = dispatch_binary(BinaryOp::Add, instance, Value::Int(0)).unwrap();
        assert_eq!(r, Value::Int(1));
    }

    #[test]
    fn test_op_codes_round_trip() {
        for op in [
            BinaryOp::Add,
            BinaryOp::Sub,
            BinaryOp::Mul,
            BinaryOp::FloorDiv,
            BinaryOp::TrueDiv,
            BinaryOp::Mod,
            BinaryOp::GetItem,
        ] {
            assert_eq!(BinaryOp::from_code(op.code()), Some(op));
        }
        assert_eq!(BinaryOp::from_code(99), None);
    }
}
