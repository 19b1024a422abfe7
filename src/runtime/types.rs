//! 타입 객체와 전역 타입 레지스트리
//!
//! 모든 타입은 interned되어 프로세스 전체에서 단일 인스턴스로 존재합니다.
//! 서브타입 검사와 MRO 조회는 포인터 비교만으로 이루어집니다.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, OnceLock, RwLock};

use bitflags::bitflags;

use crate::runtime::exceptions::{self, RtResult, raise};
use crate::runtime::value::{Callable, ObjectData, Value};

pub type TypeRef = Arc<TypeObject>;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct TypeFlags: u8 {
        /// 클래스 속성 변경 금지 (builtin 타입)
        const IMMUTABLE = 1 << 0;
        /// 인스턴스 생성 가능
        const CALLABLE  = 1 << 1;
        /// __iter__ 프로토콜 지원
        const ITERABLE  = 1 << 2;
    }
}

/// interned 타입 객체
pub struct TypeObject {
    pub name: String,

    /// 선언된 직접 베이스 (선언 순서 보존)
    pub bases: Vec<TypeRef>,

    /// 인스턴스 생성자 (없으면 기본 Instance 생성)
    pub constructor: Option<Arc<dyn Callable>>,

    pub flags: TypeFlags,

    /// 클래스 속성/메서드 테이블
    pub attributes: RwLock<HashMap<String, Value>>,

    /// C3 선형화 결과 캐시 (자기 자신이 첫 원소)
    mro: OnceLock<Vec<TypeRef>>,
}

impl TypeObject {
    /// 타입 생성과 동시에 MRO를 계산합니다.
    ///
    /// 베이스 선언이 모순되면 (C3가 선형화 불가) TypeError를 반환합니다.
    pub fn new(
        name: impl Into<String>,
        bases: Vec<TypeRef>,
        flags: TypeFlags,
        constructor: Option<Arc<dyn Callable>>,
    ) -> RtResult<TypeRef> {
        let ty = Arc::new(TypeObject {
            name: name.into(),
            bases,
            constructor,
            flags,
            attributes: RwLock::new(HashMap::new()),
            mro: OnceLock::new(),
        });
        let linearized = c3_linearize(&ty)?;
        ty.mro
            .set(linearized)
            .unwrap_or_else(|_| unreachable!("MRO already set on fresh type"));
        Ok(ty)
    }

    pub fn mro(&self) -> &[TypeRef] {
        self.mro.get().expect("MRO computed at construction")
    }

    /// MRO 순서대로 속성 조회 (first-wins)
    pub fn lookup_mro(&self, name: &str) -> Option<Value> {
        for ty in self.mro() {
            if let Some(v) = ty
                .attributes
                .read()
                .expect("type attribute table poisoned")
                .get(name)
            {
                return Some(v.clone());
            }
        }
        None
    }

    /// self가 other의 서브타입인가 (재귀적, 자기 자신 포함)
    pub fn is_subtype_of(self: &Arc<Self>, other: &TypeRef) -> bool {
        self.mro().iter().any(|t| Arc::ptr_eq(t, other))
    }

    /// 두 타입의 가장 가까운 공통 조상
    ///
    /// self의 MRO를 순서대로 훑으며 other의 MRO에도 있는 첫 타입을 고릅니다.
    /// 항상 성공합니다 (object가 모든 MRO의 마지막 원소).
    pub fn common_ancestor(self: &Arc<Self>, other: &TypeRef) -> TypeRef {
        for ty in self.mro() {
            if other.is_subtype_of(ty) {
                return ty.clone();
            }
        }
        registry().object_type.clone()
    }

    /// 초기화 단계 전용: IMMUTABLE 검사 없이 메서드/속성 등록
    pub(crate) fn define(&self, name: impl Into<String>, value: Value) {
        self.attributes
            .write()
            .expect("type attribute table poisoned")
            .insert(name.into(), value);
    }

    /// 클래스 속성 저장. builtin 타입은 변경을 거부합니다.
    pub fn set_class_attr(&self, name: &str, value: Value) -> RtResult<()> {
        if self.flags.contains(TypeFlags::IMMUTABLE) {
            return Err(raise(
                "TypeError",
                format!("cannot set attributes of built-in type '{}'", self.name),
            ));
        }
        self.define(name, value);
        Ok(())
    }
}

// constructor가 dyn trait라 derive 불가: 이름만 찍음
impl fmt::Debug for TypeObject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TypeObject({})", self.name)
    }
}

/// C3 선형화
///
/// merge(MRO(B1), ..., MRO(Bn), [B1..Bn])의 head 중 어떤 tail에도
/// 나타나지 않는 후보를 반복 선택합니다.
fn c3_linearize(ty: &TypeRef) -> RtResult<Vec<TypeRef>> {
    let mut result = vec![ty.clone()];
    if ty.bases.is_empty() {
        return Ok(result);
    }

    let mut sequences: Vec<Vec<TypeRef>> = ty.bases.iter().map(|b| b.mro().to_vec()).collect();
    sequences.push(ty.bases.clone());

    loop {
        sequences.retain(|s| !s.is_empty());
        if sequences.is_empty() {
            return Ok(result);
        }

        let mut chosen = None;
        for seq in &sequences {
            let head = &seq[0];
            let in_tail = sequences
                .iter()
                .any(|s| s.iter().skip(1).any(|t| Arc::ptr_eq(t, head)));
            if !in_tail {
                chosen = Some(head.clone());
                break;
            }
        }

        let head = chosen.ok_or_else(|| {
            raise(
                "TypeError",
                format!("cannot create a consistent method resolution order for '{}'", ty.name),
            )
        })?;

        result.push(head.clone());
        for seq in sequences.iter_mut() {
            seq.retain(|t| !Arc::ptr_eq(t, &head));
        }
    }
}

// ========== 타입 생성자 호출 ==========

/// 타입 객체를 호출 가능한 값으로 다룰 때의 어댑터
///
/// 예외 타입은 args를 담은 예외 인스턴스를, 생성자가 등록된 타입은
/// 그 생성자의 결과를, 나머지는 빈 인스턴스를 만듭니다.
pub struct TypeConstructor {
    pub ty: TypeRef,
}

impl Callable for TypeConstructor {
    fn call(
        &self,
        positional: &[Value],
        named: &HashMap<String, Value>,
        caller_instance: Option<&Value>,
    ) -> RtResult<Value> {
        let reg = registry();
        if self.ty.is_subtype_of(&reg.base_exception_type) {
            if !named.is_empty() {
                return Err(raise(
                    "TypeError",
                    format!("{}() takes no keyword arguments", self.ty.name),
                ));
            }
            return Ok(exceptions::new_exception(
                self.ty.clone(),
                positional.to_vec(),
            ));
        }
        if let Some(ctor) = &self.ty.constructor {
            return ctor.call(positional, named, caller_instance);
        }
        Ok(Value::Object(Arc::new(
            crate::runtime::value::Object::new_with_attrs(self.ty.clone(), ObjectData::Instance),
        )))
    }

    fn name(&self) -> &str {
        &self.ty.name
    }
}

// ========== 전역 레지스트리 ==========

/// 전역 타입 레지스트리
///
/// builtin 타입, 예외 계층, native 클래스 매핑을 interned 상태로 보관합니다.
/// 초기화 이후에는 읽기 전용 (native_class_types만 RwLock).
pub struct TypeRegistry {
    pub object_type: TypeRef,
    pub type_type: TypeRef,
    pub int_type: TypeRef,
    pub float_type: TypeRef,
    pub bool_type: TypeRef,
    pub str_type: TypeRef,
    pub list_type: TypeRef,
    pub set_type: TypeRef,
    pub dict_type: TypeRef,
    pub iterator_type: TypeRef,
    pub function_type: TypeRef,
    pub none_type: TypeRef,
    pub traceback_type: TypeRef,
    pub base_exception_type: TypeRef,

    /// 이름 → 예외 타입
    pub exception_types: HashMap<String, TypeRef>,

    /// native 클래스 이름 → 합성된 타입 (bridge가 사용)
    pub native_class_types: RwLock<HashMap<String, TypeRef>>,
}

impl TypeRegistry {
    fn bootstrap() -> Self {
        // 초기화 단계의 실패는 프로그래밍 에러이므로 expect로 처리
        let object_type = TypeObject::new("object", vec![], TypeFlags::IMMUTABLE, None)
            .expect("object type bootstrap");
        let mk = |name: &str, bases: Vec<TypeRef>, flags: TypeFlags| {
            TypeObject::new(name, bases, flags, None).expect("builtin type bootstrap")
        };

        let type_type = mk("type", vec![object_type.clone()], TypeFlags::IMMUTABLE);
        let int_type = mk(
            "int",
            vec![object_type.clone()],
            TypeFlags::IMMUTABLE | TypeFlags::CALLABLE,
        );
        // bool은 int의 서브타입 (숫자 문맥에서 int처럼 동작)
        let bool_type = mk("bool", vec![int_type.clone()], TypeFlags::IMMUTABLE);
        let float_type = mk(
            "float",
            vec![object_type.clone()],
            TypeFlags::IMMUTABLE | TypeFlags::CALLABLE,
        );
        let str_type = mk(
            "str",
            vec![object_type.clone()],
            TypeFlags::IMMUTABLE | TypeFlags::ITERABLE,
        );
        let list_type = mk(
            "list",
            vec![object_type.clone()],
            TypeFlags::IMMUTABLE | TypeFlags::ITERABLE,
        );
        let set_type = mk(
            "set",
            vec![object_type.clone()],
            TypeFlags::IMMUTABLE | TypeFlags::ITERABLE,
        );
        let dict_type = mk(
            "dict",
            vec![object_type.clone()],
            TypeFlags::IMMUTABLE | TypeFlags::ITERABLE,
        );
        let iterator_type = mk("iterator", vec![object_type.clone()], TypeFlags::IMMUTABLE);
        let function_type = mk("function", vec![object_type.clone()], TypeFlags::IMMUTABLE);
        let none_type = mk("NoneType", vec![object_type.clone()], TypeFlags::IMMUTABLE);
        let traceback_type = mk("traceback", vec![object_type.clone()], TypeFlags::IMMUTABLE);

        let exception_types = exceptions::build_hierarchy(&object_type);
        let base_exception_type = exception_types
            .get("BaseException")
            .expect("BaseException in hierarchy")
            .clone();

        TypeRegistry {
            object_type,
            type_type,
            int_type,
            float_type,
            bool_type,
            str_type,
            list_type,
            set_type,
            dict_type,
            iterator_type,
            function_type,
            none_type,
            traceback_type,
            base_exception_type,
            exception_types,
            native_class_types: RwLock::new(HashMap::new()),
        }
    }

    /// 이름으로 예외 타입 조회
    pub fn exception(&self, name: &str) -> TypeRef {
        self.exception_types
            .get(name)
            .unwrap_or_else(|| panic!("unknown exception type: {}", name))
            .clone()
    }
}

/// 전역 레지스트리 핸들
///
/// 최초 호출 시 builtin 타입 테이블과 native 메서드가 설치됩니다.
/// 이후에는 동시 읽기에 안전합니다.
pub fn registry() -> &'static TypeRegistry {
    static REGISTRY: OnceLock<TypeRegistry> = OnceLock::new();
    REGISTRY.get_or_init(|| {
        let reg = TypeRegistry::bootstrap();
        crate::runtime::builtins::install(&reg);
        reg
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_types_are_interned() {
        let a = registry().int_type.clone();
        let b = Value::Int(1).get_type();
        assert!(Arc::ptr_eq(&a, &b));
    }

    #[test]
    fn test_registry_initializes_through_value_construction() {
        // 첫 접근이 함수 값 생성 경로로 들어와도 (설치 코드가 지나는 경로와
        // 같음) 초기화가 재진입 없이 끝나고 메서드 테이블이 차 있어야 함
        let v = Value::native_fn("identity", crate::runtime::value::Arity::Exact(1), |a| {
            Ok(a[0].clone())
        });
        assert_eq!(v.get_type().name, "function");
        assert!(registry().int_type.lookup_mro("__add__").is_some());
    }

    #[test]
    fn test_mro_starts_with_self_ends_with_object() {
        let reg = registry();
        let mro = reg.bool_type.mro();
        assert_eq!(mro[0].name, "bool");
        assert_eq!(mro[1].name, "int");
        assert_eq!(mro.last().unwrap().name, "object");
    }

    #[test]
    fn test_c3_diamond_respects_declaration_order() {
        let reg = registry();
        let a = TypeObject::new("A", vec![reg.object_type.clone()], TypeFlags::empty(), None)
            .unwrap();
        let b = TypeObject::new("B", vec![a.clone()], TypeFlags::empty(), None).unwrap();
        let c = TypeObject::new("C", vec![a.clone()], TypeFlags::empty(), None).unwrap();
        let d = TypeObject::new("D", vec![b.clone(), c.clone()], TypeFlags::empty(), None)
            .unwrap();

        let names: Vec<&str> = d.mro().iter().map(|t| t.name.as_str()).collect();
        assert_eq!(names, vec!["D", "B", "C", "A", "object"]);
    }

    #[test]
    fn test_c3_rejects_inconsistent_bases() {
        let reg = registry();
        let a = TypeObject::new("A2", vec![reg.object_type.clone()], TypeFlags::empty(), None)
            .unwrap();
        let b = TypeObject::new("B2", vec![a.clone()], TypeFlags::empty(), None).unwrap();
        // A가 B보다 먼저 오면서 B가 A의 서브타입: 선형화 불가
        let bad = TypeObject::new("C2", vec![a.clone(), b.clone()], TypeFlags::empty(), None);
        assert!(bad.is_err());
    }

    #[test]
    fn test_subtype_check() {
        let reg = registry();
        assert!(reg.bool_type.is_subtype_of(&reg.int_type));
        assert!(reg.bool_type.is_subtype_of(&reg.object_type));
        assert!(!reg.int_type.is_subtype_of(&reg.bool_type));
    }

    #[test]
    fn test_common_ancestor() {
        let reg = registry();
        // bool과 int의 공통 조상은 int
        let t = reg.bool_type.common_ancestor(&reg.int_type);
        assert!(Arc::ptr_eq(&t, &reg.int_type));
        // int와 str의 공통 조상은 object
        let t = reg.int_type.common_ancestor(&reg.str_type);
        assert!(Arc::ptr_eq(&t, &reg.object_type));
        // 예외끼리: IndexError와 KeyError → LookupError
        let t = reg
            .exception("IndexError")
            .common_ancestor(&reg.exception("KeyError"));
        assert_eq!(t.name, "LookupError");
    }

    #[test]
    fn test_immutable_type_rejects_class_attr() {
        let reg = registry();
        let result = reg.int_type.set_class_attr("extra", Value::Int(1));
        assert!(result.is_err());
    }

    #[test]
    fn test_debug_prints_type_name() {
        assert_eq!(format!("{:?}", registry().int_type), "TypeObject(int)");
    }

    #[test]
    fn test_mro_lookup_first_wins() {
        let reg = registry();
        let a = TypeObject::new("MA", vec![reg.object_type.clone()], TypeFlags::empty(), None)
            .unwrap();
        a.define("m", Value::Int(1));
        let b = TypeObject::new("MB", vec![a.clone()], TypeFlags::empty(), None).unwrap();
        b.define("m", Value::Int(2));

        assert_eq!(b.lookup_mro("m"), Some(Value::Int(2)));
        assert_eq!(a.lookup_mro("m"), Some(Value::Int(1)));
        assert_eq!(b.lookup_mro("missing"), None);
    }
}
