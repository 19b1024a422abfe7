//! # 설계 원칙
//!
//! 1. **모든 것은 객체다**: 문자열도 Object, 예외도 Object, 타입 자체도 Object
//! 2. **타입 참조 기반**: 각 Object는 `TypeRef`로 자신의 타입 객체를 가리킴
//!    (생성 이후 절대 변경되지 않음)
//! 3. **속성 지연 할당**: 필요한 경우에만 `attributes` 테이블 할당 (메모리 최적화)
//!
//! 번역된 코드는 여러 워커 스레드에서 동시에 실행될 수 있으므로
//! `Rc/RefCell` 대신 `Arc/RwLock`을 사용합니다.

use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, RwLock};

use crate::runtime::exceptions::{Raised, RtResult, raise};
use crate::runtime::types::{TypeConstructor, TypeRef, registry};

/// 통일된 런타임 값
///
/// 정수/실수/불린/None은 unboxed, 나머지는 `Object`로 heap에 존재합니다.
#[derive(Clone)]
pub enum Value {
    Int(i64),
    Float(f64),
    Bool(bool),
    None,
    Object(Arc<Object>),
}

/// heap에 할당되는 동적 객체
pub struct Object {
    /// 이 객체의 타입 (생성 후 불변)
    pub type_ref: TypeRef,

    /// 객체의 실제 데이터
    pub data: ObjectData,

    /// 인스턴스 속성 (__dict__)
    pub attributes: Option<RwLock<HashMap<String, Value>>>,
}

pub enum ObjectData {
    Str(String),

    /// List (mutable)
    List(RwLock<Vec<Value>>),

    /// Set (mutable, hashable 원소만)
    ///
    /// 삽입 순서를 보존하기 위해 Vec 기반으로 구현합니다.
    Set(RwLock<Vec<DictKey>>),

    /// Dict (mutable, 삽입 순서 보존)
    Dict(RwLock<Vec<(DictKey, Value)>>),

    /// Iterator 상태 (스냅샷 + 커서)
    Iter(RwLock<IterState>),

    /// 호출 가능한 값 (native 메서드, 번역된 함수 등)
    Function(Arc<dyn Callable>),

    /// 예외 인스턴스. 예외 종류는 `type_ref`가 결정합니다.
    Exception { args: Vec<Value> },

    /// 핸들러 진입 스택에 올라가는 traceback 자리
    Traceback,

    /// 타입 객체 자신을 값으로 다룰 때 사용
    Type(TypeRef),

    /// 사용자 정의 타입의 일반 인스턴스
    Instance,

    /// 식별성을 보존해야 하는 불투명한 native 값
    Opaque(Arc<dyn Any + Send + Sync>),
}

/// Iterator 상태
pub struct IterState {
    pub items: Vec<Value>,
    pub pos: usize,
}

/// Dict/Set 키 (hashable 타입만)
#[derive(Debug, Clone, Hash, Eq, PartialEq)]
pub enum DictKey {
    Int(i64),
    Bool(bool),
    Str(String),
}

impl DictKey {
    /// Value를 hashable 키로 변환. 불가능하면 TypeError.
    pub fn from_value(v: &Value) -> RtResult<DictKey> {
        match v {
            Value::Int(i) => Ok(DictKey::Int(*i)),
            Value::Bool(b) => Ok(DictKey::Bool(*b)),
            Value::Object(obj) => match &obj.data {
                ObjectData::Str(s) => Ok(DictKey::Str(s.clone())),
                _ => Err(raise(
                    "TypeError",
                    format!("unhashable type: '{}'", obj.type_ref.name),
                )),
            },
            _ => Err(raise(
                "TypeError",
                format!("unhashable type: '{}'", v.get_type().name),
            )),
        }
    }

    pub fn to_value(&self) -> Value {
        match self {
            DictKey::Int(i) => Value::Int(*i),
            DictKey::Bool(b) => Value::Bool(*b),
            DictKey::Str(s) => Value::str(s.clone()),
        }
    }
}

// ========== Callable ==========

/// 통일된 호출 규약
///
/// 위치 인자 목록, 이름 있는 인자 테이블, 그리고 선택적 caller instance
/// (bound method / super 스타일 디스패치용)를 받습니다.
pub trait Callable: Send + Sync {
    fn call(
        &self,
        positional: &[Value],
        named: &HashMap<String, Value>,
        caller_instance: Option<&Value>,
    ) -> RtResult<Value>;

    fn name(&self) -> &str {
        "<callable>"
    }
}

/// 메서드 인자 개수 검증
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Arity {
    /// 정확히 N개의 인자만 허용
    Exact(usize),

    /// min ~ max 개의 인자 허용
    Range(usize, usize),

    /// 가변 인자 (임의 개수)
    Variadic,
}

impl Arity {
    pub fn check(&self, got: usize) -> bool {
        match self {
            Arity::Exact(n) => got == *n,
            Arity::Range(min, max) => got >= *min && got <= *max,
            Arity::Variadic => true,
        }
    }

    pub fn description(&self) -> String {
        match self {
            Arity::Exact(n) => format!("{}", n),
            Arity::Range(min, max) if min == max => format!("{}", min),
            Arity::Range(min, max) => format!("{}-{}", min, max),
            Arity::Variadic => "any".to_string(),
        }
    }
}

pub type NativeFn = fn(&[Value]) -> RtResult<Value>;

/// Rust로 구현된 native 메서드
///
/// receiver는 `args[0]`으로 전달됩니다 (dunder 디스패치의 인자 순서 규약).
pub struct NativeCallable {
    pub name: &'static str,
    pub arity: Arity,
    pub func: NativeFn,
}

impl Callable for NativeCallable {
    fn call(
        &self,
        positional: &[Value],
        named: &HashMap<String, Value>,
        _caller_instance: Option<&Value>,
    ) -> RtResult<Value> {
        if !named.is_empty() {
            return Err(raise(
                "TypeError",
                format!("{}() takes no keyword arguments", self.name),
            ));
        }
        if !self.arity.check(positional.len()) {
            return Err(raise(
                "TypeError",
                format!(
                    "{}() takes {} argument(s) but {} given",
                    self.name,
                    self.arity.description(),
                    positional.len()
                ),
            ));
        }
        (self.func)(positional)
    }

    fn name(&self) -> &str {
        self.name
    }
}

/// receiver가 미리 묶인 메서드
pub struct BoundMethod {
    pub receiver: Value,
    pub func: Arc<dyn Callable>,
}

impl Callable for BoundMethod {
    fn call(
        &self,
        positional: &[Value],
        named: &HashMap<String, Value>,
        caller_instance: Option<&Value>,
    ) -> RtResult<Value> {
        let mut args = Vec::with_capacity(positional.len() + 1);
        args.push(self.receiver.clone());
        args.extend_from_slice(positional);
        self.func.call(&args, named, caller_instance)
    }

    fn name(&self) -> &str {
        self.func.name()
    }
}

// ========== Object ==========

impl Object {
    /// 새 객체 생성 (속성 없이)
    pub fn new(type_ref: TypeRef, data: ObjectData) -> Self {
        Self {
            type_ref,
            data,
            attributes: None,
        }
    }

    /// 속성을 가질 수 있는 객체 생성
    pub fn new_with_attrs(type_ref: TypeRef, data: ObjectData) -> Self {
        Self {
            type_ref,
            data,
            attributes: Some(RwLock::new(HashMap::new())),
        }
    }
}

// ========== Value ==========

impl Value {
    pub fn str(s: impl Into<String>) -> Value {
        Value::Object(Arc::new(Object::new(
            registry().str_type.clone(),
            ObjectData::Str(s.into()),
        )))
    }

    pub fn list(items: Vec<Value>) -> Value {
        Value::Object(Arc::new(Object::new(
            registry().list_type.clone(),
            ObjectData::List(RwLock::new(items)),
        )))
    }

    pub fn set(items: Vec<DictKey>) -> Value {
        Value::Object(Arc::new(Object::new(
            registry().set_type.clone(),
            ObjectData::Set(RwLock::new(items)),
        )))
    }

    pub fn dict(pairs: Vec<(DictKey, Value)>) -> Value {
        Value::Object(Arc::new(Object::new(
            registry().dict_type.clone(),
            ObjectData::Dict(RwLock::new(pairs)),
        )))
    }

    pub fn iterator(items: Vec<Value>) -> Value {
        Value::Object(Arc::new(Object::new(
            registry().iterator_type.clone(),
            ObjectData::Iter(RwLock::new(IterState { items, pos: 0 })),
        )))
    }

    pub fn function(f: Arc<dyn Callable>) -> Value {
        Value::Object(Arc::new(Object::new(
            registry().function_type.clone(),
            ObjectData::Function(f),
        )))
    }

    pub fn native_fn(name: &'static str, arity: Arity, func: NativeFn) -> Value {
        Value::native_fn_in(registry().function_type.clone(), name, arity, func)
    }

    /// 함수 타입을 직접 받는 변형. registry 초기화 중에는 전역 핸들을
    /// 다시 잡으면 `OnceLock`이 재진입으로 멈추므로 설치 코드가 씁니다.
    pub(crate) fn native_fn_in(
        func_type: TypeRef,
        name: &'static str,
        arity: Arity,
        func: NativeFn,
    ) -> Value {
        Value::Object(Arc::new(Object::new(
            func_type,
            ObjectData::Function(Arc::new(NativeCallable { name, arity, func })),
        )))
    }

    pub fn type_object(ty: TypeRef) -> Value {
        Value::Object(Arc::new(Object::new(
            registry().type_type.clone(),
            ObjectData::Type(ty),
        )))
    }

    pub fn traceback() -> Value {
        Value::Object(Arc::new(Object::new(
            registry().traceback_type.clone(),
            ObjectData::Traceback,
        )))
    }

    pub fn opaque(native: Arc<dyn Any + Send + Sync>, ty: TypeRef) -> Value {
        Value::Object(Arc::new(Object::new(ty, ObjectData::Opaque(native))))
    }

    /// 값의 타입 객체 가져오기
    ///
    /// 모든 값에 대해 통일된 방식으로 타입 참조를 반환합니다.
    pub fn get_type(&self) -> TypeRef {
        let reg = registry();
        match self {
            Value::Int(_) => reg.int_type.clone(),
            Value::Float(_) => reg.float_type.clone(),
            Value::Bool(_) => reg.bool_type.clone(),
            Value::None => reg.none_type.clone(),
            Value::Object(obj) => match &obj.data {
                // 타입 객체의 타입은 `type`
                ObjectData::Type(_) => reg.type_type.clone(),
                _ => obj.type_ref.clone(),
            },
        }
    }

    /// 속성 조회. 없으면 None (호출자가 에러 여부를 결정).
    ///
    /// 조회 순서: 인스턴스 dict → 타입의 MRO.
    /// 타입에서 찾은 함수는 receiver가 묶인 bound method로 반환됩니다.
    pub fn get_attr_or_null(&self, name: &str) -> Option<Value> {
        if let Value::Object(obj) = self {
            if let Some(attrs) = &obj.attributes
                && let Some(v) = attrs.read().expect("attribute table poisoned").get(name)
            {
                return Some(v.clone());
            }
            // 타입 객체 자신에 대한 조회는 bind하지 않음
            if let ObjectData::Type(ty) = &obj.data
                && let Some(v) = ty.lookup_mro(name)
            {
                return Some(v);
            }
        }
        let ty = self.get_type();
        let found = ty.lookup_mro(name)?;
        if let Value::Object(o) = &found
            && let ObjectData::Function(f) = &o.data
        {
            return Some(Value::function(Arc::new(BoundMethod {
                receiver: self.clone(),
                func: f.clone(),
            })));
        }
        Some(found)
    }

    /// 속성 저장
    pub fn set_attr(&self, name: &str, value: Value) -> RtResult<()> {
        if let Value::Object(obj) = self {
            if let ObjectData::Type(ty) = &obj.data {
                return ty.set_class_attr(name, value);
            }
            if let Some(attrs) = &obj.attributes {
                attrs
                    .write()
                    .expect("attribute table poisoned")
                    .insert(name.to_string(), value);
                return Ok(());
            }
        }
        Err(raise(
            "TypeError",
            format!("'{}' object has no attribute table", self.get_type().name),
        ))
    }

    /// 속성 삭제
    pub fn del_attr(&self, name: &str) -> RtResult<()> {
        if let Value::Object(obj) = self
            && let Some(attrs) = &obj.attributes
        {
            if attrs
                .write()
                .expect("attribute table poisoned")
                .remove(name)
                .is_some()
            {
                return Ok(());
            }
            return Err(raise(
                "AttributeError",
                format!("'{}' object has no attribute '{}'", self.get_type().name, name),
            ));
        }
        Err(raise(
            "TypeError",
            format!("'{}' object has no attribute table", self.get_type().name),
        ))
    }

    /// 호출 가능한 형태로 변환
    pub fn as_callable(&self) -> Option<Arc<dyn Callable>> {
        if let Value::Object(obj) = self {
            match &obj.data {
                ObjectData::Function(f) => Some(f.clone()),
                ObjectData::Type(ty) => Some(Arc::new(TypeConstructor { ty: ty.clone() })),
                _ => None,
            }
        } else {
            None
        }
    }

    /// 조건 분기용 truthiness
    pub fn is_truthy(&self) -> bool {
        match self {
            Value::Int(i) => *i != 0,
            Value::Float(f) => *f != 0.0,
            Value::Bool(b) => *b,
            Value::None => false,
            Value::Object(obj) => match &obj.data {
                ObjectData::Str(s) => !s.is_empty(),
                ObjectData::List(items) => !items.read().expect("list poisoned").is_empty(),
                ObjectData::Set(items) => !items.read().expect("set poisoned").is_empty(),
                ObjectData::Dict(pairs) => !pairs.read().expect("dict poisoned").is_empty(),
                _ => true,
            },
        }
    }

    /// 예외 인스턴스인지 확인 (BaseException의 서브타입)
    pub fn is_exception_instance(&self) -> bool {
        if let Value::Object(obj) = self
            && matches!(obj.data, ObjectData::Exception { .. })
        {
            return true;
        }
        false
    }

    pub fn as_str(&self) -> Option<&str> {
        if let Value::Object(obj) = self
            && let ObjectData::Str(s) = &obj.data
        {
            return Some(s);
        }
        None
    }

    /// 에러 메시지용 타입 이름
    pub fn type_name(&self) -> String {
        self.get_type().name.clone()
    }
}

/// 값 동등성 비교
///
/// 숫자는 교차 비교, 문자열/리스트는 값 비교, 나머지 객체는 identity 비교.
pub fn eq_values(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Int(x), Value::Int(y)) => x == y,
        (Value::Bool(x), Value::Bool(y)) => x == y,
        (Value::Float(x), Value::Float(y)) => x == y,
        (Value::Int(x), Value::Float(y)) | (Value::Float(y), Value::Int(x)) => *x as f64 == *y,
        (Value::Int(x), Value::Bool(y)) | (Value::Bool(y), Value::Int(x)) => *x == *y as i64,
        (Value::None, Value::None) => true,
        (Value::Object(x), Value::Object(y)) => {
            if Arc::ptr_eq(x, y) {
                return true;
            }
            match (&x.data, &y.data) {
                (ObjectData::Str(s1), ObjectData::Str(s2)) => s1 == s2,
                (ObjectData::List(l1), ObjectData::List(l2)) => {
                    let l1 = l1.read().expect("list poisoned");
                    let l2 = l2.read().expect("list poisoned");
                    l1.len() == l2.len() && l1.iter().zip(l2.iter()).all(|(a, b)| eq_values(a, b))
                }
                (ObjectData::Set(s1), ObjectData::Set(s2)) => {
                    let s1 = s1.read().expect("set poisoned");
                    let s2 = s2.read().expect("set poisoned");
                    s1.len() == s2.len() && s1.iter().all(|k| s2.contains(k))
                }
                (ObjectData::Type(t1), ObjectData::Type(t2)) => Arc::ptr_eq(t1, t2),
                _ => false,
            }
        }
        _ => false,
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        eq_values(self, other)
    }
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Int(i) => write!(f, "Int({})", i),
            Value::Float(x) => write!(f, "Float({})", x),
            Value::Bool(b) => write!(f, "Bool({})", b),
            Value::None => write!(f, "None"),
            Value::Object(obj) => write!(f, "{:?}", obj),
        }
    }
}

impl fmt::Debug for Object {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.data {
            ObjectData::Str(s) => write!(f, "Str({:?})", s),
            ObjectData::List(items) => {
                write!(f, "List({:?})", &*items.read().expect("list poisoned"))
            }
            ObjectData::Set(items) => write!(f, "Set({:?})", &*items.read().expect("set poisoned")),
            ObjectData::Dict(pairs) => {
                write!(f, "Dict({:?})", &*pairs.read().expect("dict poisoned"))
            }
            ObjectData::Iter(_) => write!(f, "Iter(<{}>)", self.type_ref.name),
            ObjectData::Function(c) => write!(f, "Function({})", c.name()),
            ObjectData::Exception { args } => {
                write!(f, "Exception({}, {:?})", self.type_ref.name, args)
            }
            ObjectData::Traceback => write!(f, "Traceback"),
            ObjectData::Type(t) => write!(f, "Type({})", t.name),
            ObjectData::Instance => write!(f, "Instance({})", self.type_ref.name),
            ObjectData::Opaque(_) => write!(f, "Opaque(<{}>)", self.type_ref.name),
        }
    }
}

// Raised를 Debug할 때 쓰임
impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Int(i) => write!(f, "{}", i),
            Value::Float(x) => write!(f, "{}", x),
            Value::Bool(b) => write!(f, "{}", if *b { "True" } else { "False" }),
            Value::None => write!(f, "None"),
            Value::Object(obj) => match &obj.data {
                ObjectData::Str(s) => write!(f, "{}", s),
                ObjectData::Exception { args } => {
                    let msg = args
                        .iter()
                        .map(|a| a.to_string())
                        .collect::<Vec<_>>()
                        .join(", ");
                    write!(f, "{}: {}", obj.type_ref.name, msg)
                }
                ObjectData::Type(t) => write!(f, "<class '{}'>", t.name),
                _ => write!(f, "<{} object>", obj.type_ref.name),
            },
        }
    }
}

// Raised에서 Value로 접근할 때의 편의 변환
impl From<Raised> for Value {
    fn from(r: Raised) -> Value {
        r.into_value()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_value_type_lookup() {
        assert_eq!(Value::Int(1).get_type().name, "int");
        assert_eq!(Value::Bool(true).get_type().name, "bool");
        assert_eq!(Value::str("x").get_type().name, "str");
        assert_eq!(Value::None.get_type().name, "NoneType");
    }

    #[test]
    fn test_lazy_attribute_allocation() {
        let obj = Object::new(registry().str_type.clone(), ObjectData::Str("test".into()));
        assert!(obj.attributes.is_none());

        let v = Value::Object(Arc::new(Object::new_with_attrs(
            registry().object_type.clone(),
            ObjectData::Instance,
        )));
        v.set_attr("name", Value::Int(42)).unwrap();
        assert_eq!(v.get_attr_or_null("name"), Some(Value::Int(42)));
    }

    #[test]
    fn test_set_attr_without_table_fails() {
        let result = Value::Int(1).set_attr("x", Value::Int(2));
        assert!(result.is_err());
    }

    #[test]
    fn test_bound_method_from_type_lookup() {
        // list.append는 타입 테이블에서 찾은 뒤 receiver가 묶여야 함
        let list = Value::list(vec![Value::Int(1)]);
        let append = list.get_attr_or_null("append").expect("append not found");
        let callable = append.as_callable().expect("not callable");
        callable
            .call(&[Value::Int(2)], &HashMap::new(), None)
            .unwrap();
        let expected = Value::list(vec![Value::Int(1), Value::Int(2)]);
        assert!(eq_values(&list, &expected));
    }

    #[test]
    fn test_truthiness() {
        assert!(Value::Int(5).is_truthy());
        assert!(!Value::Int(0).is_truthy());
        assert!(!Value::None.is_truthy());
        assert!(!Value::str("").is_truthy());
        assert!(Value::str("a").is_truthy());
        assert!(!Value::list(vec![]).is_truthy());
    }

    #[test]
    fn test_arity_check() {
        assert!(Arity::Exact(2).check(2));
        assert!(!Arity::Exact(2).check(3));

        assert!(Arity::Range(1, 3).check(2));
        assert!(!Arity::Range(1, 3).check(4));

        assert!(Arity::Variadic.check(0));
        assert!(Arity::Variadic.check(100));
    }

    #[test]
    fn test_dict_key_hashable_subset() {
        assert!(DictKey::from_value(&Value::Int(1)).is_ok());
        assert!(DictKey::from_value(&Value::str("k")).is_ok());
        assert!(DictKey::from_value(&Value::list(vec![])).is_err());
    }
}
