//! 예외 계층과 raise 경로
//!
//! 예외 종류는 코드가 아니라 데이터로 정의합니다: 타입 하나당
//! `(이름, 베이스 목록)` 레코드 하나. 새 예외 추가 = 레코드 추가.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use crate::runtime::types::{TypeFlags, TypeObject, TypeRef, registry};
use crate::runtime::value::{Object, ObjectData, Value};

/// 전파 중인 예외. 페이로드는 항상 예외 인스턴스 Value입니다.
pub struct Raised(Value);

pub type RtResult<T> = Result<T, Raised>;

impl Raised {
    pub fn new(exception: Value) -> Self {
        Raised(exception)
    }

    pub fn value(&self) -> &Value {
        &self.0
    }

    pub fn into_value(self) -> Value {
        self.0
    }

    /// 예외의 타입 이름 (테스트/메시지용)
    pub fn type_name(&self) -> String {
        self.0.get_type().name.clone()
    }

    /// 첫 번째 인자가 문자열이면 그 메시지
    pub fn message(&self) -> Option<String> {
        if let Value::Object(obj) = &self.0
            && let ObjectData::Exception { args } = &obj.data
            && let Some(first) = args.first()
        {
            return Some(first.to_string());
        }
        None
    }
}

impl fmt::Debug for Raised {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Raised({})", self.0)
    }
}

/// 예외 인스턴스 생성
pub fn new_exception(ty: TypeRef, args: Vec<Value>) -> Value {
    Value::Object(Arc::new(Object::new_with_attrs(
        ty,
        ObjectData::Exception { args },
    )))
}

/// 이름으로 예외를 만들어 Raised로 감쌈
pub fn raise(type_name: &str, msg: impl Into<String>) -> Raised {
    let ty = registry().exception(type_name);
    Raised(new_exception(ty, vec![Value::str(msg.into())]))
}

/// 인자 목록을 그대로 담아 raise
pub fn raise_args(type_name: &str, args: Vec<Value>) -> Raised {
    let ty = registry().exception(type_name);
    Raised(new_exception(ty, args))
}

// ========== 계층 정의 ==========

/// (이름, 베이스 이름 목록). 빈 베이스 = object 직계.
const HIERARCHY: &[(&str, &[&str])] = &[
    ("BaseException", &[]),
    ("SystemExit", &["BaseException"]),
    ("KeyboardInterrupt", &["BaseException"]),
    ("Exception", &["BaseException"]),
    ("ArithmeticError", &["Exception"]),
    ("ZeroDivisionError", &["ArithmeticError"]),
    ("OverflowError", &["ArithmeticError"]),
    ("FloatingPointError", &["ArithmeticError"]),
    ("LookupError", &["Exception"]),
    ("IndexError", &["LookupError"]),
    ("KeyError", &["LookupError"]),
    ("TypeError", &["Exception"]),
    ("ValueError", &["Exception"]),
    ("AttributeError", &["Exception"]),
    ("NameError", &["Exception"]),
    ("RuntimeError", &["Exception"]),
    ("NotImplementedError", &["RuntimeError"]),
    ("StopIteration", &["Exception"]),
    ("ReferenceError", &["Exception"]),
];

/// 레코드 테이블에서 예외 타입 계층을 구축
///
/// 레코드는 베이스가 먼저 오도록 정렬되어 있습니다.
pub fn build_hierarchy(object_type: &TypeRef) -> HashMap<String, TypeRef> {
    let mut table: HashMap<String, TypeRef> = HashMap::new();
    for (name, base_names) in HIERARCHY {
        let bases: Vec<TypeRef> = if base_names.is_empty() {
            vec![object_type.clone()]
        } else {
            base_names
                .iter()
                .map(|b| table.get(*b).expect("exception bases declared in order").clone())
                .collect()
        };
        let ty = TypeObject::new(*name, bases, TypeFlags::CALLABLE, None)
            .expect("exception hierarchy is linearizable");
        table.insert((*name).to_string(), ty);
    }
    table
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hierarchy_subtyping() {
        let reg = registry();
        let zde = reg.exception("ZeroDivisionError");
        assert!(zde.is_subtype_of(&reg.exception("ArithmeticError")));
        assert!(zde.is_subtype_of(&reg.exception("Exception")));
        assert!(zde.is_subtype_of(&reg.base_exception_type));
        assert!(!zde.is_subtype_of(&reg.exception("LookupError")));
    }

    #[test]
    fn test_system_exit_is_not_exception() {
        // except Exception이 SystemExit을 잡으면 안 됨
        let reg = registry();
        let se = reg.exception("SystemExit");
        assert!(se.is_subtype_of(&reg.base_exception_type));
        assert!(!se.is_subtype_of(&reg.exception("Exception")));
    }

    #[test]
    fn test_raise_carries_message() {
        let r = raise("ValueError", "bad input");
        assert_eq!(r.type_name(), "ValueError");
        assert_eq!(r.message().as_deref(), Some("bad input"));
    }

    #[test]
    fn test_exception_instance_has_attribute_table() {
        let r = raise("RuntimeError", "oops");
        let exc = r.into_value();
        assert!(exc.is_exception_instance());
        exc.set_attr("note", Value::str("extra")).unwrap();
        assert_eq!(exc.get_attr_or_null("note"), Some(Value::str("extra")));
    }
}
