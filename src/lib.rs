//! pyseok: 동적 스택 바이트코드의 함수 단위 ahead-of-time 번역기
//!
//! 동적 객체 모델(타입 객체, C3 MRO, 속성 dict) 위에서 도는 바이트코드를
//! 함수 단위로 받아 정적 타입 엔진(Cranelift)의 네이티브 코드로 번역합니다.
//! 추상 해석기가 스택 메타데이터로 증명한 타입은 특수화 경로로, 증명하지
//! 못한 연산은 dunder 디스패치 런타임으로 내립니다.
//!
//! 전체 파이프라인:
//! 1. [`translate::instruction`] — 입력 바이트코드와 예외 영역 테이블
//! 2. [`translate::cfg`] — 기본 블록 그래프
//! 3. [`translate::stack_metadata`] — 명령별 스택 타입 고정점
//! 4. [`translate::lowering`] — Cranelift IR 방출
//! 5. [`translate::runtime`] — 방출된 코드가 호출하는 helper와 Frame
//!
//! native 경계는 [`bridge`]가 담당합니다: 넓히기는 항상 성공, 좁히기는
//! 값이 보존되지 않으면 즉시 실패합니다.

pub mod bridge;
pub mod runtime;
pub mod translate;

pub use bridge::{NativeType, NativeValue};
pub use runtime::{Raised, RtResult, Value};
pub use translate::instruction::{BytecodeBuilder, CompiledFunction};
pub use translate::{TranslatedFunction, TranslationEngine};

/// 함수 바이트코드를 파일로 직렬화
pub fn save_function(func: &CompiledFunction, path: &str) -> std::io::Result<()> {
    let cfg = bincode::config::standard();
    let bytes = bincode::serde::encode_to_vec(func, cfg).expect("serialize function");
    std::fs::write(path, bytes)
}

/// 파일에서 함수 바이트코드를 역직렬화
pub fn load_function(path: &str) -> std::io::Result<CompiledFunction> {
    let bytes = std::fs::read(path)?;
    let cfg = bincode::config::standard();
    let (func, _consumed): (CompiledFunction, usize) =
        bincode::serde::decode_from_slice(&bytes, cfg).expect("deserialize function");
    Ok(func)
}
