//! builtin 타입의 native 메서드
//!
//! 디스패치 규약에 따라 receiver는 args[0]으로 들어옵니다.
//! bool은 int의 서브타입이므로 int 메서드는 Bool 피연산자도 받습니다.

use std::collections::HashMap;

use crate::runtime::exceptions::{RtResult, raise};
use crate::runtime::types::TypeRegistry;
use crate::runtime::value::{Arity, DictKey, ObjectData, Value, eq_values};

// ========== 숫자 변환 ==========

/// int 문맥의 피연산자 (bool 포함)
fn as_int(v: &Value) -> Option<i64> {
    match v {
        Value::Int(i) => Some(*i),
        Value::Bool(b) => Some(*b as i64),
        _ => None,
    }
}

fn as_float(v: &Value) -> Option<f64> {
    match v {
        Value::Int(i) => Some(*i as f64),
        Value::Bool(b) => Some(*b as i64 as f64),
        Value::Float(f) => Some(*f),
        _ => None,
    }
}

fn numeric_type_error(op: &str, lhs: &Value, rhs: &Value) -> crate::runtime::exceptions::Raised {
    raise(
        "TypeError",
        format!(
            "unsupported operand type(s) for {}: '{}' and '{}'",
            op,
            lhs.type_name(),
            rhs.type_name()
        ),
    )
}

/// floor division (몫을 음의 무한대 방향으로 내림)
pub fn int_floordiv(a: i64, b: i64) -> RtResult<i64> {
    if b == 0 {
        return Err(raise("ZeroDivisionError", "integer division by zero"));
    }
    let mut q = a / b;
    if (a % b != 0) && ((a < 0) != (b < 0)) {
        q -= 1;
    }
    Ok(q)
}

/// 나머지의 부호가 제수를 따르는 modulo
pub fn int_mod(a: i64, b: i64) -> RtResult<i64> {
    if b == 0 {
        return Err(raise("ZeroDivisionError", "integer modulo by zero"));
    }
    let mut r = a % b;
    if r != 0 && ((r < 0) != (b < 0)) {
        r += b;
    }
    Ok(r)
}

fn float_floordiv(a: f64, b: f64) -> RtResult<f64> {
    if b == 0.0 {
        return Err(raise("ZeroDivisionError", "float floor division by zero"));
    }
    Ok((a / b).floor())
}

fn float_mod(a: f64, b: f64) -> RtResult<f64> {
    if b == 0.0 {
        return Err(raise("ZeroDivisionError", "float modulo by zero"));
    }
    let r = a % b;
    if r != 0.0 && ((r < 0.0) != (b < 0.0)) {
        return Ok(r + b);
    }
    Ok(r)
}

// ========== int 메서드 ==========

macro_rules! int_binop {
    ($name:ident, $op_sym:expr, $int_case:expr, $float_case:expr) => {
        fn $name(args: &[Value]) -> RtResult<Value> {
            let (lhs, rhs) = (&args[0], &args[1]);
            if let (Some(a), Some(b)) = (as_int(lhs), as_int(rhs)) {
                #[allow(clippy::redundant_closure_call)]
                return ($int_case)(a, b);
            }
            // int op float → float로 승격
            if let (Some(a), Some(b)) = (as_float(lhs), as_float(rhs)) {
                #[allow(clippy::redundant_closure_call)]
                return ($float_case)(a, b);
            }
            Err(numeric_type_error($op_sym, lhs, rhs))
        }
    };
}

int_binop!(int_add, "+", |a: i64, b: i64| Ok(Value::Int(a.wrapping_add(b))), |a: f64, b: f64| Ok(Value::Float(a + b)));
int_binop!(int_sub, "-", |a: i64, b: i64| Ok(Value::Int(a.wrapping_sub(b))), |a: f64, b: f64| Ok(Value::Float(a - b)));
int_binop!(int_mul, "*", |a: i64, b: i64| Ok(Value::Int(a.wrapping_mul(b))), |a: f64, b: f64| Ok(Value::Float(a * b)));
int_binop!(int_floordiv_m, "//", |a, b| int_floordiv(a, b).map(Value::Int), |a: f64, b: f64| {
    float_floordiv(a, b).map(Value::Float)
});
int_binop!(int_mod_m, "%", |a, b| int_mod(a, b).map(Value::Int), |a: f64, b: f64| {
    float_mod(a, b).map(Value::Float)
});

/// 진짜 나눗셈은 정수 피연산자에서도 항상 float
fn int_truediv(args: &[Value]) -> RtResult<Value> {
    let (lhs, rhs) = (&args[0], &args[1]);
    if let (Some(a), Some(b)) = (as_float(lhs), as_float(rhs)) {
        if b == 0.0 {
            return Err(raise("ZeroDivisionError", "division by zero"));
        }
        return Ok(Value::Float(a / b));
    }
    Err(numeric_type_error("/", lhs, rhs))
}

fn int_neg(args: &[Value]) -> RtResult<Value> {
    match as_int(&args[0]) {
        Some(a) => Ok(Value::Int(a.wrapping_neg())),
        None => Err(raise(
            "TypeError",
            format!("bad operand type for unary -: '{}'", args[0].type_name()),
        )),
    }
}

fn int_pos(args: &[Value]) -> RtResult<Value> {
    match as_int(&args[0]) {
        Some(a) => Ok(Value::Int(a)),
        None => Err(raise(
            "TypeError",
            format!("bad operand type for unary +: '{}'", args[0].type_name()),
        )),
    }
}

macro_rules! num_compare {
    ($name:ident, $op_sym:expr, $cmp:expr) => {
        fn $name(args: &[Value]) -> RtResult<Value> {
            let (lhs, rhs) = (&args[0], &args[1]);
            if let (Some(a), Some(b)) = (as_float(lhs), as_float(rhs)) {
                #[allow(clippy::redundant_closure_call)]
                return Ok(Value::Bool(($cmp)(a, b)));
            }
            // ==, !=는 타입이 달라도 항상 답이 있음
            match $op_sym {
                "==" => Ok(Value::Bool(eq_values(lhs, rhs))),
                "!=" => Ok(Value::Bool(!eq_values(lhs, rhs))),
                _ => Err(numeric_type_error($op_sym, lhs, rhs)),
            }
        }
    };
}

num_compare!(num_lt, "<", |a: f64, b: f64| a < b);
num_compare!(num_le, "<=", |a: f64, b: f64| a <= b);
num_compare!(num_eq, "==", |a: f64, b: f64| a == b);
num_compare!(num_ne, "!=", |a: f64, b: f64| a != b);
num_compare!(num_gt, ">", |a: f64, b: f64| a > b);
num_compare!(num_ge, ">=", |a: f64, b: f64| a >= b);

// ========== float 메서드 ==========

macro_rules! float_binop {
    ($name:ident, $op_sym:expr, $case:expr) => {
        fn $name(args: &[Value]) -> RtResult<Value> {
            let (lhs, rhs) = (&args[0], &args[1]);
            if let (Some(a), Some(b)) = (as_float(lhs), as_float(rhs)) {
                #[allow(clippy::redundant_closure_call)]
                return ($case)(a, b);
            }
            Err(numeric_type_error($op_sym, lhs, rhs))
        }
    };
}

float_binop!(float_add, "+", |a: f64, b: f64| Ok(Value::Float(a + b)));
float_binop!(float_sub, "-", |a: f64, b: f64| Ok(Value::Float(a - b)));
float_binop!(float_mul, "*", |a: f64, b: f64| Ok(Value::Float(a * b)));
float_binop!(float_floordiv_m, "//", |a, b| float_floordiv(a, b).map(Value::Float));
float_binop!(float_mod_m, "%", |a, b| float_mod(a, b).map(Value::Float));
float_binop!(float_truediv, "/", |a: f64, b: f64| {
    if b == 0.0 {
        Err(raise("ZeroDivisionError", "float division by zero"))
    } else {
        Ok(Value::Float(a / b))
    }
});

fn float_neg(args: &[Value]) -> RtResult<Value> {
    match as_float(&args[0]) {
        Some(a) => Ok(Value::Float(-a)),
        None => Err(raise(
            "TypeError",
            format!("bad operand type for unary -: '{}'", args[0].type_name()),
        )),
    }
}

// ========== str 메서드 ==========

fn str_add(args: &[Value]) -> RtResult<Value> {
    match (args[0].as_str(), args[1].as_str()) {
        (Some(a), Some(b)) => Ok(Value::str(format!("{}{}", a, b))),
        _ => Err(raise(
            "TypeError",
            format!("can only concatenate str to str, not '{}'", args[1].type_name()),
        )),
    }
}

fn str_mul(args: &[Value]) -> RtResult<Value> {
    let s = args[0].as_str().ok_or_else(|| raise("TypeError", "str expected"))?;
    match as_int(&args[1]) {
        Some(n) if n >= 0 => Ok(Value::str(s.repeat(n as usize))),
        Some(_) => Ok(Value::str("")),
        None => Err(raise(
            "TypeError",
            format!("can't multiply str by non-int of type '{}'", args[1].type_name()),
        )),
    }
}

fn str_len(args: &[Value]) -> RtResult<Value> {
    let s = args[0].as_str().ok_or_else(|| raise("TypeError", "str expected"))?;
    Ok(Value::Int(s.chars().count() as i64))
}

fn str_getitem(args: &[Value]) -> RtResult<Value> {
    let s = args[0].as_str().ok_or_else(|| raise("TypeError", "str expected"))?;
    let idx = as_int(&args[1]).ok_or_else(|| {
        raise(
            "TypeError",
            format!("string indices must be integers, not '{}'", args[1].type_name()),
        )
    })?;
    let chars: Vec<char> = s.chars().collect();
    let i = normalize_index(idx, chars.len())
        .ok_or_else(|| raise("IndexError", "string index out of range"))?;
    Ok(Value::str(chars[i].to_string()))
}

macro_rules! str_compare {
    ($name:ident, $cmp:expr) => {
        fn $name(args: &[Value]) -> RtResult<Value> {
            match (args[0].as_str(), args[1].as_str()) {
                #[allow(clippy::redundant_closure_call)]
                (Some(a), Some(b)) => Ok(Value::Bool(($cmp)(a, b))),
                _ => Err(raise(
                    "TypeError",
                    format!(
                        "'{}' not supported between instances of 'str' and '{}'",
                        stringify!($name),
                        args[1].type_name()
                    ),
                )),
            }
        }
    };
}

str_compare!(str_lt, |a: &str, b: &str| a < b);
str_compare!(str_le, |a: &str, b: &str| a <= b);
str_compare!(str_gt, |a: &str, b: &str| a > b);
str_compare!(str_ge, |a: &str, b: &str| a >= b);

fn str_eq(args: &[Value]) -> RtResult<Value> {
    Ok(Value::Bool(eq_values(&args[0], &args[1])))
}

fn str_ne(args: &[Value]) -> RtResult<Value> {
    Ok(Value::Bool(!eq_values(&args[0], &args[1])))
}

// ========== list 메서드 ==========

/// 음수 인덱스 보정
fn normalize_index(idx: i64, len: usize) -> Option<usize> {
    let len = len as i64;
    let i = if idx < 0 { idx + len } else { idx };
    if i >= 0 && i < len { Some(i as usize) } else { None }
}

fn list_items<'a>(v: &'a Value) -> RtResult<&'a std::sync::RwLock<Vec<Value>>> {
    if let Value::Object(obj) = v
        && let ObjectData::List(items) = &obj.data
    {
        return Ok(items);
    }
    Err(raise("TypeError", "list expected"))
}

fn list_getitem(args: &[Value]) -> RtResult<Value> {
    let items = list_items(&args[0])?.read().expect("list poisoned");
    let idx = as_int(&args[1]).ok_or_else(|| {
        raise(
            "TypeError",
            format!("list indices must be integers, not '{}'", args[1].type_name()),
        )
    })?;
    let i = normalize_index(idx, items.len())
        .ok_or_else(|| raise("IndexError", "list index out of range"))?;
    Ok(items[i].clone())
}

fn list_setitem(args: &[Value]) -> RtResult<Value> {
    let mut items = list_items(&args[0])?.write().expect("list poisoned");
    let idx = as_int(&args[1]).ok_or_else(|| {
        raise(
            "TypeError",
            format!("list indices must be integers, not '{}'", args[1].type_name()),
        )
    })?;
    let len = items.len();
    let i = normalize_index(idx, len)
        .ok_or_else(|| raise("IndexError", "list assignment index out of range"))?;
    items[i] = args[2].clone();
    Ok(Value::None)
}

fn list_len(args: &[Value]) -> RtResult<Value> {
    Ok(Value::Int(list_items(&args[0])?.read().expect("list poisoned").len() as i64))
}

fn list_append(args: &[Value]) -> RtResult<Value> {
    list_items(&args[0])?
        .write()
        .expect("list poisoned")
        .push(args[1].clone());
    Ok(Value::None)
}

fn list_eq(args: &[Value]) -> RtResult<Value> {
    Ok(Value::Bool(eq_values(&args[0], &args[1])))
}

fn list_ne(args: &[Value]) -> RtResult<Value> {
    Ok(Value::Bool(!eq_values(&args[0], &args[1])))
}

// ========== set 메서드 ==========

fn set_items<'a>(v: &'a Value) -> RtResult<&'a std::sync::RwLock<Vec<DictKey>>> {
    if let Value::Object(obj) = v
        && let ObjectData::Set(items) = &obj.data
    {
        return Ok(items);
    }
    Err(raise("TypeError", "set expected"))
}

fn set_len(args: &[Value]) -> RtResult<Value> {
    Ok(Value::Int(set_items(&args[0])?.read().expect("set poisoned").len() as i64))
}

fn set_add(args: &[Value]) -> RtResult<Value> {
    let key = DictKey::from_value(&args[1])?;
    let mut items = set_items(&args[0])?.write().expect("set poisoned");
    if !items.contains(&key) {
        items.push(key);
    }
    Ok(Value::None)
}

fn set_contains(args: &[Value]) -> RtResult<Value> {
    let key = DictKey::from_value(&args[1])?;
    let items = set_items(&args[0])?.read().expect("set poisoned");
    Ok(Value::Bool(items.contains(&key)))
}

fn set_eq(args: &[Value]) -> RtResult<Value> {
    Ok(Value::Bool(eq_values(&args[0], &args[1])))
}

// ========== dict 메서드 ==========

fn dict_pairs<'a>(v: &'a Value) -> RtResult<&'a std::sync::RwLock<Vec<(DictKey, Value)>>> {
    if let Value::Object(obj) = v
        && let ObjectData::Dict(pairs) = &obj.data
    {
        return Ok(pairs);
    }
    Err(raise("TypeError", "dict expected"))
}

fn dict_getitem(args: &[Value]) -> RtResult<Value> {
    let key = DictKey::from_value(&args[1])?;
    let pairs = dict_pairs(&args[0])?.read().expect("dict poisoned");
    pairs
        .iter()
        .find(|(k, _)| *k == key)
        .map(|(_, v)| v.clone())
        .ok_or_else(|| raise("KeyError", format!("{}", args[1])))
}

fn dict_setitem(args: &[Value]) -> RtResult<Value> {
    let key = DictKey::from_value(&args[1])?;
    let mut pairs = dict_pairs(&args[0])?.write().expect("dict poisoned");
    if let Some(slot) = pairs.iter_mut().find(|(k, _)| *k == key) {
        slot.1 = args[2].clone();
    } else {
        pairs.push((key, args[2].clone()));
    }
    Ok(Value::None)
}

fn dict_len(args: &[Value]) -> RtResult<Value> {
    Ok(Value::Int(dict_pairs(&args[0])?.read().expect("dict poisoned").len() as i64))
}

// ========== iterator 프로토콜 ==========

/// iterable을 iterator로 변환 (__iter__ 디스패치)
pub fn get_iter(v: &Value) -> RtResult<Value> {
    let ty = v.get_type();
    let method = ty.lookup_mro("__iter__").ok_or_else(|| {
        raise("TypeError", format!("'{}' object is not iterable", ty.name))
    })?;
    let callable = method
        .as_callable()
        .ok_or_else(|| raise("TypeError", "__iter__ is not callable"))?;
    callable.call(&[v.clone()], &HashMap::new(), None)
}

/// 다음 원소. 소진되면 StopIteration.
pub fn iter_next(v: &Value) -> RtResult<Value> {
    let ty = v.get_type();
    let method = ty.lookup_mro("__next__").ok_or_else(|| {
        raise("TypeError", format!("'{}' object is not an iterator", ty.name))
    })?;
    let callable = method
        .as_callable()
        .ok_or_else(|| raise("TypeError", "__next__ is not callable"))?;
    callable.call(&[v.clone()], &HashMap::new(), None)
}

fn list_iter(args: &[Value]) -> RtResult<Value> {
    let items = list_items(&args[0])?.read().expect("list poisoned").clone();
    Ok(Value::iterator(items))
}

fn set_iter(args: &[Value]) -> RtResult<Value> {
    let items = set_items(&args[0])?.read().expect("set poisoned");
    Ok(Value::iterator(items.iter().map(|k| k.to_value()).collect()))
}

fn dict_iter(args: &[Value]) -> RtResult<Value> {
    // dict 순회는 키를 삽입 순서대로 낳음
    let pairs = dict_pairs(&args[0])?.read().expect("dict poisoned");
    Ok(Value::iterator(pairs.iter().map(|(k, _)| k.to_value()).collect()))
}

fn str_iter(args: &[Value]) -> RtResult<Value> {
    let s = args[0].as_str().ok_or_else(|| raise("TypeError", "str expected"))?;
    Ok(Value::iterator(s.chars().map(|c| Value::str(c.to_string())).collect()))
}

fn iterator_iter(args: &[Value]) -> RtResult<Value> {
    Ok(args[0].clone())
}

fn iterator_next(args: &[Value]) -> RtResult<Value> {
    if let Value::Object(obj) = &args[0]
        && let ObjectData::Iter(state) = &obj.data
    {
        let mut state = state.write().expect("iterator poisoned");
        if state.pos < state.items.len() {
            let item = state.items[state.pos].clone();
            state.pos += 1;
            return Ok(item);
        }
        return Err(raise("StopIteration", ""));
    }
    Err(raise("TypeError", "iterator expected"))
}

// ========== 설치 ==========

/// builtin 타입의 메서드 테이블을 채웁니다. registry 초기화에서 한 번 호출.
///
/// 초기화 closure 안에서 돌므로 `registry()`를 다시 잡으면 안 됩니다
/// (`OnceLock::get_or_init` 재진입은 교착): 함수 타입은 reg에서 직접 꺼내
/// `native_fn_in`으로 넘깁니다.
pub fn install(reg: &TypeRegistry) {
    let func_type = &reg.function_type;
    let def = |ty: &crate::runtime::types::TypeRef,
               name: &'static str,
               arity: Arity,
               f: fn(&[Value]) -> RtResult<Value>| {
        ty.define(name, Value::native_fn_in(func_type.clone(), name, arity, f));
    };

    // int (bool은 상속으로 이 테이블을 공유)
    let int = &reg.int_type;
    def(int, "__add__", Arity::Exact(2), int_add);
    def(int, "__sub__", Arity::Exact(2), int_sub);
    def(int, "__mul__", Arity::Exact(2), int_mul);
    def(int, "__floordiv__", Arity::Exact(2), int_floordiv_m);
    def(int, "__truediv__", Arity::Exact(2), int_truediv);
    def(int, "__mod__", Arity::Exact(2), int_mod_m);
    def(int, "__neg__", Arity::Exact(1), int_neg);
    def(int, "__pos__", Arity::Exact(1), int_pos);
    def(int, "__lt__", Arity::Exact(2), num_lt);
    def(int, "__le__", Arity::Exact(2), num_le);
    def(int, "__eq__", Arity::Exact(2), num_eq);
    def(int, "__ne__", Arity::Exact(2), num_ne);
    def(int, "__gt__", Arity::Exact(2), num_gt);
    def(int, "__ge__", Arity::Exact(2), num_ge);

    // float
    let float = &reg.float_type;
    def(float, "__add__", Arity::Exact(2), float_add);
    def(float, "__sub__", Arity::Exact(2), float_sub);
    def(float, "__mul__", Arity::Exact(2), float_mul);
    def(float, "__floordiv__", Arity::Exact(2), float_floordiv_m);
    def(float, "__truediv__", Arity::Exact(2), float_truediv);
    def(float, "__mod__", Arity::Exact(2), float_mod_m);
    def(float, "__neg__", Arity::Exact(1), float_neg);
    def(float, "__lt__", Arity::Exact(2), num_lt);
    def(float, "__le__", Arity::Exact(2), num_le);
    def(float, "__eq__", Arity::Exact(2), num_eq);
    def(float, "__ne__", Arity::Exact(2), num_ne);
    def(float, "__gt__", Arity::Exact(2), num_gt);
    def(float, "__ge__", Arity::Exact(2), num_ge);

    // str
    let str_ty = &reg.str_type;
    def(str_ty, "__add__", Arity::Exact(2), str_add);
    def(str_ty, "__mul__", Arity::Exact(2), str_mul);
    def(str_ty, "__len__", Arity::Exact(1), str_len);
    def(str_ty, "__getitem__", Arity::Exact(2), str_getitem);
    def(str_ty, "__iter__", Arity::Exact(1), str_iter);
    def(str_ty, "__lt__", Arity::Exact(2), str_lt);
    def(str_ty, "__le__", Arity::Exact(2), str_le);
    def(str_ty, "__eq__", Arity::Exact(2), str_eq);
    def(str_ty, "__ne__", Arity::Exact(2), str_ne);
    def(str_ty, "__gt__", Arity::Exact(2), str_gt);
    def(str_ty, "__ge__", Arity::Exact(2), str_ge);

    // list
    let list = &reg.list_type;
    def(list, "__getitem__", Arity::Exact(2), list_getitem);
    def(list, "__setitem__", Arity::Exact(3), list_setitem);
    def(list, "__len__", Arity::Exact(1), list_len);
    def(list, "__eq__", Arity::Exact(2), list_eq);
    def(list, "__ne__", Arity::Exact(2), list_ne);
    def(list, "__iter__", Arity::Exact(1), list_iter);
    def(list, "append", Arity::Exact(2), list_append);

    // set
    let set = &reg.set_type;
    def(set, "__len__", Arity::Exact(1), set_len);
    def(set, "__contains__", Arity::Exact(2), set_contains);
    def(set, "__eq__", Arity::Exact(2), set_eq);
    def(set, "__iter__", Arity::Exact(1), set_iter);
    def(set, "add", Arity::Exact(2), set_add);

    // dict
    let dict = &reg.dict_type;
    def(dict, "__getitem__", Arity::Exact(2), dict_getitem);
    def(dict, "__setitem__", Arity::Exact(3), dict_setitem);
    def(dict, "__len__", Arity::Exact(1), dict_len);
    def(dict, "__iter__", Arity::Exact(1), dict_iter);

    // iterator
    let iter = &reg.iterator_type;
    def(iter, "__iter__", Arity::Exact(1), iterator_iter);
    def(iter, "__next__", Arity::Exact(1), iterator_next);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_floor_division_rounds_toward_negative_infinity() {
        assert_eq!(int_floordiv(7, 2).unwrap(), 3);
        assert_eq!(int_floordiv(-7, 2).unwrap(), -4);
        assert_eq!(int_floordiv(7, -2).unwrap(), -4);
        assert_eq!(int_floordiv(-7, -2).unwrap(), 3);
    }

    #[test]
    fn test_modulo_sign_follows_divisor() {
        assert_eq!(int_mod(7, 3).unwrap(), 1);
        assert_eq!(int_mod(-7, 3).unwrap(), 2);
        assert_eq!(int_mod(7, -3).unwrap(), -2);
        assert_eq!(int_mod(-7, -3).unwrap(), -1);
    }

    #[test]
    fn test_division_by_zero_raises() {
        assert_eq!(int_floordiv(1, 0).unwrap_err().type_name(), "ZeroDivisionError");
        assert_eq!(int_mod(1, 0).unwrap_err().type_name(), "ZeroDivisionError");
        assert_eq!(
            int_truediv(&[Value::Int(1), Value::Int(0)]).unwrap_err().type_name(),
            "ZeroDivisionError"
        );
    }

    #[test]
    fn test_truediv_always_float() {
        assert_eq!(int_truediv(&[Value::Int(7), Value::Int(2)]).unwrap(), Value::Float(3.5));
        assert_eq!(int_truediv(&[Value::Int(6), Value::Int(2)]).unwrap(), Value::Float(3.0));
    }

    #[test]
    fn test_mixed_numeric_promotes_to_float() {
        assert_eq!(int_add(&[Value::Int(1), Value::Float(0.5)]).unwrap(), Value::Float(1.5));
    }

    #[test]
    fn test_bool_participates_as_int() {
        assert_eq!(int_add(&[Value::Bool(true), Value::Int(2)]).unwrap(), Value::Int(3));
        assert_eq!(int_mul(&[Value::Bool(false), Value::Int(5)]).unwrap(), Value::Int(0));
    }

    #[test]
    fn test_negative_list_index() {
        let list = Value::list(vec![Value::Int(10), Value::Int(20), Value::Int(30)]);
        let r = list_getitem(&[list.clone(), Value::Int(-1)]).unwrap();
        assert_eq!(r, Value::Int(30));
        let err = list_getitem(&[list, Value::Int(3)]).unwrap_err();
        assert_eq!(err.type_name(), "IndexError");
    }

    #[test]
    fn test_dict_preserves_insertion_order() {
        let d = Value::dict(vec![]);
        dict_setitem(&[d.clone(), Value::str("b"), Value::Int(1)]).unwrap();
        dict_setitem(&[d.clone(), Value::str("a"), Value::Int(2)]).unwrap();
        dict_setitem(&[d.clone(), Value::str("b"), Value::Int(3)]).unwrap();

        let keys = dict_iter(&[d.clone()]).unwrap();
        assert_eq!(iterator_next(&[keys.clone()]).unwrap(), Value::str("b"));
        assert_eq!(iterator_next(&[keys]).unwrap(), Value::str("a"));
        assert_eq!(dict_getitem(&[d, Value::str("b")]).unwrap(), Value::Int(3));
    }

    #[test]
    fn test_dict_missing_key_raises() {
        let d = Value::dict(vec![]);
        let err = dict_getitem(&[d, Value::str("missing")]).unwrap_err();
        assert_eq!(err.type_name(), "KeyError");
    }

    #[test]
    fn test_iterator_exhaustion_raises_stop_iteration() {
        let it = get_iter(&Value::list(vec![Value::Int(1)])).unwrap();
        assert_eq!(iter_next(&it).unwrap(), Value::Int(1));
        assert_eq!(iter_next(&it).unwrap_err().type_name(), "StopIteration");
    }

    #[test]
    fn test_set_deduplicates() {
        let s = Value::set(vec![]);
        set_add(&[s.clone(), Value::Int(1)]).unwrap();
        set_add(&[s.clone(), Value::Int(1)]).unwrap();
        set_add(&[s.clone(), Value::Int(2)]).unwrap();
        assert_eq!(set_len(&[s.clone()]).unwrap(), Value::Int(2));
        assert_eq!(set_contains(&[s.clone(), Value::Int(1)]).unwrap(), Value::Bool(true));
        assert_eq!(set_contains(&[s, Value::Int(3)]).unwrap(), Value::Bool(false));
    }
}
