//! native 값 ↔ 동적 객체 모델 사이의 타입 브리지
//!
//! 번역된 함수를 native 코드에서 직접 호출하거나, native 값을 동적 세계로
//! 들여올 때의 경계층입니다. 변환 규칙:
//!
//! - native → 동적: 모르는 타입은 Opaque로 감싸서 들여옴. 집합 원소와
//!   맵 키의 hashable 제약 위반만 실패합니다
//! - 동적 → native: 요청된 native 타입으로 좁히기. 안 맞으면 **즉시 실패**
//!
//! 어느 방향이든 값을 조용히 버리거나 절단하지 않습니다.

use std::any::Any;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::runtime::exceptions::{Raised, RtResult, raise};
use crate::runtime::types::{TypeFlags, TypeObject, TypeRef, registry};
use crate::runtime::value::{Callable, DictKey, ObjectData, Value};

// ========== native 타입 서술 ==========

/// 함수 시그니처에 쓰이는 native 타입 서술자
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum NativeType {
    I32,
    I64,
    F32,
    F64,
    Bool,
    Str,
    List(Box<NativeType>),
    Set(Box<NativeType>),
    Map(Box<NativeType>, Box<NativeType>),
    Unit,
    /// 동적 객체를 그대로 주고받음 (변환 없음)
    Dynamic,
}

impl NativeType {
    /// 이 native 타입에 대응하는 동적 타입 객체
    pub fn dynamic_type(&self) -> TypeRef {
        let reg = registry();
        match self {
            NativeType::I32 | NativeType::I64 => reg.int_type.clone(),
            NativeType::F32 | NativeType::F64 => reg.float_type.clone(),
            NativeType::Bool => reg.bool_type.clone(),
            NativeType::Str => reg.str_type.clone(),
            NativeType::List(_) => reg.list_type.clone(),
            NativeType::Set(_) => reg.set_type.clone(),
            NativeType::Map(_, _) => reg.dict_type.clone(),
            NativeType::Unit => reg.none_type.clone(),
            NativeType::Dynamic => reg.object_type.clone(),
        }
    }
}

/// 브리지 경계를 건너는 native 값
#[derive(Clone)]
pub enum NativeValue {
    I32(i32),
    I64(i64),
    F32(f32),
    F64(f64),
    Bool(bool),
    Str(String),
    List(Vec<NativeValue>),
    Set(Vec<NativeValue>),
    Map(Vec<(NativeValue, NativeValue)>),
    Unit,
    Dynamic(Value),
    Opaque(Arc<dyn Any + Send + Sync>),
}

impl std::fmt::Debug for NativeValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NativeValue::I32(i) => write!(f, "I32({})", i),
            NativeValue::I64(i) => write!(f, "I64({})", i),
            NativeValue::F32(x) => write!(f, "F32({})", x),
            NativeValue::F64(x) => write!(f, "F64({})", x),
            NativeValue::Bool(b) => write!(f, "Bool({})", b),
            NativeValue::Str(s) => write!(f, "Str({:?})", s),
            NativeValue::List(items) => f.debug_tuple("List").field(items).finish(),
            NativeValue::Set(items) => f.debug_tuple("Set").field(items).finish(),
            NativeValue::Map(pairs) => f.debug_tuple("Map").field(pairs).finish(),
            NativeValue::Unit => write!(f, "Unit"),
            NativeValue::Dynamic(v) => write!(f, "Dynamic({:?})", v),
            NativeValue::Opaque(_) => write!(f, "Opaque(..)"),
        }
    }
}

// ========== 변환 실패 ==========

#[derive(Debug)]
pub struct ConversionError {
    pub message: String,
}

impl ConversionError {
    fn new(message: impl Into<String>) -> Self {
        Self { message: message.into() }
    }
}

impl From<ConversionError> for Raised {
    fn from(e: ConversionError) -> Raised {
        raise("TypeError", e.message)
    }
}

// ========== native → 동적 ==========

/// hashable 자리(집합 원소, 맵 키)에 쓸 수 있는 키로 좁힘
fn hashable_key(v: &Value, place: &str) -> Result<DictKey, ConversionError> {
    DictKey::from_value(v).map_err(|_| {
        ConversionError::new(format!(
            "unhashable native {}: '{}'",
            place,
            v.type_name()
        ))
    })
}

/// native 값을 동적 객체로
///
/// 집합 원소와 맵 키의 hashable 제약 위반만 실패하고 나머지는 전부
/// 들어옵니다. 위반한 값을 조용히 버리는 일은 없습니다.
pub fn to_dynamic(v: NativeValue) -> Result<Value, ConversionError> {
    Ok(match v {
        NativeValue::I32(i) => Value::Int(i as i64),
        NativeValue::I64(i) => Value::Int(i),
        NativeValue::F32(f) => Value::Float(f as f64),
        NativeValue::F64(f) => Value::Float(f),
        NativeValue::Bool(b) => Value::Bool(b),
        NativeValue::Str(s) => Value::str(s),
        NativeValue::List(items) => {
            let items: Vec<Value> =
                items.into_iter().map(to_dynamic).collect::<Result<_, _>>()?;
            Value::list(items)
        }
        NativeValue::Set(items) => {
            let mut keys: Vec<DictKey> = Vec::with_capacity(items.len());
            for item in items {
                let key = hashable_key(&to_dynamic(item)?, "set element")?;
                if !keys.contains(&key) {
                    keys.push(key);
                }
            }
            Value::set(keys)
        }
        NativeValue::Map(pairs) => {
            let mut out: Vec<(DictKey, Value)> = Vec::with_capacity(pairs.len());
            for (k, v) in pairs {
                let key = hashable_key(&to_dynamic(k)?, "map key")?;
                out.push((key, to_dynamic(v)?));
            }
            Value::dict(out)
        }
        NativeValue::Unit => Value::None,
        NativeValue::Dynamic(v) => v,
        NativeValue::Opaque(any) => Value::opaque(any, registry().object_type.clone()),
    })
}

// ========== 동적 → native ==========

fn narrow_error(want: &NativeType, got: &Value) -> ConversionError {
    ConversionError::new(format!(
        "cannot convert '{}' value to native {:?}",
        got.type_name(),
        want
    ))
}

/// 동적 값을 요청된 native 타입으로 좁힙니다.
///
/// 숫자는 값이 보존될 때만 좁혀지고, 지원하지 않는 조합은
/// 조용히 절단하는 대신 즉시 실패합니다.
pub fn to_native(v: &Value, want: &NativeType) -> Result<NativeValue, ConversionError> {
    match want {
        NativeType::Dynamic => Ok(NativeValue::Dynamic(v.clone())),
        NativeType::I64 => match v {
            Value::Int(i) => Ok(NativeValue::I64(*i)),
            Value::Bool(b) => Ok(NativeValue::I64(*b as i64)),
            _ => Err(narrow_error(want, v)),
        },
        NativeType::I32 => match v {
            Value::Int(i) => i32::try_from(*i)
                .map(NativeValue::I32)
                .map_err(|_| ConversionError::new(format!("integer {} overflows i32", i))),
            Value::Bool(b) => Ok(NativeValue::I32(*b as i32)),
            _ => Err(narrow_error(want, v)),
        },
        NativeType::F64 => match v {
            Value::Float(f) => Ok(NativeValue::F64(*f)),
            Value::Int(i) => Ok(NativeValue::F64(*i as f64)),
            _ => Err(narrow_error(want, v)),
        },
        NativeType::F32 => match v {
            Value::Float(f) => Ok(NativeValue::F32(*f as f32)),
            Value::Int(i) => Ok(NativeValue::F32(*i as f32)),
            _ => Err(narrow_error(want, v)),
        },
        NativeType::Bool => match v {
            Value::Bool(b) => Ok(NativeValue::Bool(*b)),
            _ => Err(narrow_error(want, v)),
        },
        NativeType::Str => match v.as_str() {
            Some(s) => Ok(NativeValue::Str(s.to_string())),
            None => Err(narrow_error(want, v)),
        },
        NativeType::Unit => match v {
            Value::None => Ok(NativeValue::Unit),
            _ => Err(narrow_error(want, v)),
        },
        NativeType::List(elem) => {
            if let Value::Object(obj) = v
                && let ObjectData::List(items) = &obj.data
            {
                let items = items.read().expect("list poisoned");
                let mut out = Vec::with_capacity(items.len());
                for item in items.iter() {
                    out.push(to_native(item, elem)?);
                }
                return Ok(NativeValue::List(out));
            }
            Err(narrow_error(want, v))
        }
        NativeType::Set(elem) => {
            if let Value::Object(obj) = v
                && let ObjectData::Set(items) = &obj.data
            {
                let items = items.read().expect("set poisoned");
                let mut out = Vec::with_capacity(items.len());
                for key in items.iter() {
                    out.push(to_native(&key.to_value(), elem)?);
                }
                return Ok(NativeValue::Set(out));
            }
            Err(narrow_error(want, v))
        }
        NativeType::Map(key_ty, val_ty) => {
            if let Value::Object(obj) = v
                && let ObjectData::Dict(pairs) = &obj.data
            {
                let pairs = pairs.read().expect("dict poisoned");
                let mut out = Vec::with_capacity(pairs.len());
                for (k, val) in pairs.iter() {
                    out.push((to_native(&k.to_value(), key_ty)?, to_native(val, val_ty)?));
                }
                return Ok(NativeValue::Map(out));
            }
            Err(narrow_error(want, v))
        }
    }
}

// ========== native 클래스 → 타입 객체 ==========

/// 동적 세계에 노출할 native 클래스의 서술
pub struct NativeClass {
    pub name: String,

    /// builtin으로 직접 대응되는 동적 타입이 있으면 지정
    pub associated_type: Option<TypeRef>,

    /// 클래스가 호출 가능한 값 하나로 요약될 때 (함수 포인터 등)
    pub callable: Option<Arc<dyn Callable>>,
}

/// native 클래스에 대응하는 타입 객체
///
/// 계층적 조회: builtin 매핑 → 지정된 타입 → callable이면 function →
/// 이름으로 합성된 타입 (interned, 같은 이름은 같은 타입).
pub fn type_for_native_class(class: &NativeClass) -> RtResult<TypeRef> {
    let reg = registry();
    let builtin = match class.name.as_str() {
        "i32" | "i64" | "int" => Some(reg.int_type.clone()),
        "f32" | "f64" | "float" => Some(reg.float_type.clone()),
        "bool" => Some(reg.bool_type.clone()),
        "String" | "str" => Some(reg.str_type.clone()),
        _ => None,
    };
    if let Some(ty) = builtin {
        return Ok(ty);
    }
    if let Some(ty) = &class.associated_type {
        return Ok(ty.clone());
    }
    if class.callable.is_some() {
        return Ok(reg.function_type.clone());
    }

    // 합성된 타입은 intern: 같은 native 클래스는 항상 같은 타입 객체
    {
        let table = reg
            .native_class_types
            .read()
            .expect("native class table poisoned");
        if let Some(ty) = table.get(&class.name) {
            return Ok(ty.clone());
        }
    }
    let mut table = reg
        .native_class_types
        .write()
        .expect("native class table poisoned");
    if let Some(ty) = table.get(&class.name) {
        return Ok(ty.clone());
    }
    let ty = TypeObject::new(
        class.name.clone(),
        vec![reg.object_type.clone()],
        TypeFlags::empty(),
        None,
    )?;
    table.insert(class.name.clone(), ty.clone());
    Ok(ty)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::value::eq_values;

    #[test]
    fn test_primitive_round_trip() {
        let v = to_dynamic(NativeValue::I64(42)).unwrap();
        assert_eq!(v, Value::Int(42));
        assert!(matches!(to_native(&v, &NativeType::I64).unwrap(), NativeValue::I64(42)));

        let v = to_dynamic(NativeValue::Str("hi".into())).unwrap();
        assert!(matches!(to_native(&v, &NativeType::Str).unwrap(), NativeValue::Str(s) if s == "hi"));
    }

    #[test]
    fn test_aggregate_round_trip() {
        let v = to_dynamic(NativeValue::List(vec![
            NativeValue::I64(1),
            NativeValue::I64(2),
        ]))
        .unwrap();
        assert!(eq_values(&v, &Value::list(vec![Value::Int(1), Value::Int(2)])));

        let back = to_native(&v, &NativeType::List(Box::new(NativeType::I64))).unwrap();
        match back {
            NativeValue::List(items) => assert_eq!(items.len(), 2),
            other => panic!("expected list, got {:?}", other),
        }
    }

    #[test]
    fn test_map_round_trip_preserves_order() {
        let v = to_dynamic(NativeValue::Map(vec![
            (NativeValue::Str("b".into()), NativeValue::I64(1)),
            (NativeValue::Str("a".into()), NativeValue::I64(2)),
        ]))
        .unwrap();
        let back = to_native(
            &v,
            &NativeType::Map(Box::new(NativeType::Str), Box::new(NativeType::I64)),
        )
        .unwrap();
        match back {
            NativeValue::Map(pairs) => {
                assert!(matches!(&pairs[0].0, NativeValue::Str(s) if s == "b"));
                assert!(matches!(&pairs[1].0, NativeValue::Str(s) if s == "a"));
            }
            other => panic!("expected map, got {:?}", other),
        }
    }

    #[test]
    fn test_unsupported_narrowing_fails_loudly() {
        let list = Value::list(vec![Value::Int(1)]);
        assert!(to_native(&list, &NativeType::I64).is_err());

        // 원소 타입이 안 맞으면 전체 변환이 실패
        let mixed = Value::list(vec![Value::Int(1), Value::str("x")]);
        assert!(to_native(&mixed, &NativeType::List(Box::new(NativeType::I64))).is_err());
    }

    #[test]
    fn test_unhashable_set_element_rejected() {
        // 버리지 않고 실패해야 함
        let r = to_dynamic(NativeValue::Set(vec![NativeValue::List(vec![
            NativeValue::I64(1),
        ])]));
        assert!(r.is_err());
    }

    #[test]
    fn test_unhashable_map_key_rejected() {
        let r = to_dynamic(NativeValue::Map(vec![(
            NativeValue::List(vec![NativeValue::I64(1)]),
            NativeValue::I64(9),
        )]));
        assert!(r.is_err());
        // 값 쪽은 hashable 제약이 없음
        let ok = to_dynamic(NativeValue::Map(vec![(
            NativeValue::Str("k".into()),
            NativeValue::List(vec![NativeValue::I64(1)]),
        )]));
        assert!(ok.is_ok());
    }

    #[test]
    fn test_i32_overflow_detected() {
        let v = Value::Int(i64::from(i32::MAX) + 1);
        assert!(to_native(&v, &NativeType::I32).is_err());
        assert!(to_native(&v, &NativeType::I64).is_ok());
    }

    #[test]
    fn test_dynamic_passthrough() {
        let list = Value::list(vec![Value::Int(1)]);
        let nv = to_native(&list, &NativeType::Dynamic).unwrap();
        match nv {
            NativeValue::Dynamic(v) => assert!(eq_values(&v, &list)),
            other => panic!("expected dynamic, got {:?}", other),
        }
    }

    #[test]
    fn test_native_class_lookup_is_layered_and_interned() {
        let builtin = NativeClass {
            name: "i64".into(),
            associated_type: None,
            callable: None,
        };
        let ty = type_for_native_class(&builtin).unwrap();
        assert!(Arc::ptr_eq(&ty, &registry().int_type));

        let custom = NativeClass {
            name: "ScoreHolder".into(),
            associated_type: None,
            callable: None,
        };
        let t1 = type_for_native_class(&custom).unwrap();
        let t2 = type_for_native_class(&custom).unwrap();
        assert!(Arc::ptr_eq(&t1, &t2));
        assert_eq!(t1.name, "ScoreHolder");
    }
}
