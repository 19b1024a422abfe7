//! 동적 객체 모델 런타임
//!
//! 번역된 코드가 정적으로 증명하지 못한 모든 것의 fallback 경로입니다.
//! 값 표현, interned 타입 객체, 예외 계층, 연산자 디스패치가 여기 있습니다.

pub mod builtins;
pub mod dunder;
pub mod exceptions;
pub mod types;
pub mod value;

pub use exceptions::{Raised, RtResult, raise, raise_args};
pub use types::{TypeFlags, TypeObject, TypeRef, TypeRegistry, registry};
pub use value::{Arity, Callable, DictKey, Object, ObjectData, Value};
