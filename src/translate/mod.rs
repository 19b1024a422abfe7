//! 함수 단위 ahead-of-time 번역 파이프라인
//!
//! CompiledFunction → CFG → 스택 메타데이터 → Cranelift IR → 네이티브 코드.
//! 번역 결과는 동적 호출 규약(Callable)과 native 시그니처 양쪽으로
//! 호출할 수 있습니다.

use cranelift::prelude::*;
use cranelift_codegen::settings;
use cranelift_jit::{JITBuilder, JITModule};
use cranelift_module::{Linkage, Module as ClifModule};
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, RwLock};

use crate::bridge::{self, NativeValue};
use crate::runtime::exceptions::{RtResult, raise};
use crate::runtime::value::{Callable, Value};

pub mod cfg;
pub mod instruction;
pub mod lowering;
pub mod regions;
pub mod runtime;
pub mod stack_metadata;

use instruction::{CompiledFunction, Constant, FunctionSignature};
use runtime::Frame;

// ========== 에러 ==========

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TranslateErrorKind {
    /// 합류 지점의 스택 깊이 불일치
    DepthMismatch,
    /// 추상 스택 언더플로
    StackUnderflow,
    InvalidJumpTarget,
    /// 영역 테이블이 모순됨 (부분 겹침 등)
    InconsistentRegions,
    UnreachableHandler,
    InvalidConstant,
    /// Cranelift 쪽 실패
    Codegen,
}

#[derive(Debug)]
pub struct TranslateError {
    pub kind: TranslateErrorKind,
    /// 문제가 된 명령 오프셋 (있으면)
    pub offset: Option<u32>,
    pub message: String,
}

impl TranslateError {
    pub fn at(kind: TranslateErrorKind, offset: u32, message: impl Into<String>) -> Self {
        TranslateError {
            kind,
            offset: Some(offset),
            message: message.into(),
        }
    }
}

/// 오프셋 없는 에러 생성
pub fn err(kind: TranslateErrorKind, message: impl Into<String>) -> TranslateError {
    TranslateError {
        kind,
        offset: None,
        message: message.into(),
    }
}

impl fmt::Display for TranslateError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.offset {
            Some(off) => write!(f, "{:?} at offset {}: {}", self.kind, off, self.message),
            None => write!(f, "{:?}: {}", self.kind, self.message),
        }
    }
}

impl std::error::Error for TranslateError {}

pub type TranslateResult<T> = Result<T, TranslateError>;

// ========== 번역 엔진 ==========

/// 번역된 코드의 진입점 시그니처
///
/// Frame 포인터를 받아 상태 코드를 반환합니다 (0 = 성공, 음수 = 예외).
pub type NativeCode = unsafe extern "C" fn(*mut Frame) -> i64;

/// 함수 단위 번역 엔진
///
/// 번역된 코드의 메모리는 엔진이 소유합니다: TranslatedFunction의
/// 코드 포인터는 엔진이 살아 있는 동안만 유효합니다.
pub struct TranslationEngine {
    module: JITModule,

    /// 함수 컴파일 컨텍스트 (재사용, 함수마다 clear)
    func_ctx: codegen::Context,

    /// 이름 충돌 방지용 일련번호
    next_id: usize,
}

impl TranslationEngine {
    pub fn new() -> TranslateResult<Self> {
        let mut flag_builder = settings::builder();
        flag_builder
            .set("opt_level", "speed")
            .map_err(|e| err(TranslateErrorKind::Codegen, format!("opt_level: {}", e)))?;

        let isa_builder = cranelift_codegen::isa::lookup(target_lexicon::HOST)
            .map_err(|e| err(TranslateErrorKind::Codegen, format!("ISA lookup: {}", e)))?;
        let isa = isa_builder
            .finish(settings::Flags::new(flag_builder))
            .map_err(|e| err(TranslateErrorKind::Codegen, format!("ISA: {}", e)))?;

        let mut builder = JITBuilder::with_isa(isa, cranelift_module::default_libcall_names());

        // 런타임 helper 심볼 등록
        builder.symbol("pyseok_load_const", runtime::pyseok_load_const as *const u8);
        builder.symbol("pyseok_load_local", runtime::pyseok_load_local as *const u8);
        builder.symbol("pyseok_store_local", runtime::pyseok_store_local as *const u8);
        builder.symbol("pyseok_load_global", runtime::pyseok_load_global as *const u8);
        builder.symbol("pyseok_pop", runtime::pyseok_pop as *const u8);
        builder.symbol("pyseok_dup", runtime::pyseok_dup as *const u8);
        builder.symbol("pyseok_swap", runtime::pyseok_swap as *const u8);
        builder.symbol("pyseok_unary_op", runtime::pyseok_unary_op as *const u8);
        builder.symbol("pyseok_binary_op", runtime::pyseok_binary_op as *const u8);
        builder.symbol("pyseok_compare_op", runtime::pyseok_compare_op as *const u8);
        builder.symbol("pyseok_not_op", runtime::pyseok_not_op as *const u8);
        builder.symbol("pyseok_pop_bool", runtime::pyseok_pop_bool as *const u8);
        builder.symbol("pyseok_int_add", runtime::pyseok_int_add as *const u8);
        builder.symbol("pyseok_int_sub", runtime::pyseok_int_sub as *const u8);
        builder.symbol("pyseok_int_mul", runtime::pyseok_int_mul as *const u8);
        builder.symbol("pyseok_int_floordiv", runtime::pyseok_int_floordiv as *const u8);
        builder.symbol("pyseok_int_truediv", runtime::pyseok_int_truediv as *const u8);
        builder.symbol("pyseok_int_mod", runtime::pyseok_int_mod as *const u8);
        builder.symbol("pyseok_int_neg", runtime::pyseok_int_neg as *const u8);
        builder.symbol("pyseok_int_compare", runtime::pyseok_int_compare as *const u8);
        builder.symbol("pyseok_load_index", runtime::pyseok_load_index as *const u8);
        builder.symbol("pyseok_store_index", runtime::pyseok_store_index as *const u8);
        builder.symbol("pyseok_get_iter", runtime::pyseok_get_iter as *const u8);
        builder.symbol("pyseok_for_iter", runtime::pyseok_for_iter as *const u8);
        builder.symbol("pyseok_call_function", runtime::pyseok_call_function as *const u8);
        builder.symbol("pyseok_load_attr", runtime::pyseok_load_attr as *const u8);
        builder.symbol("pyseok_store_attr", runtime::pyseok_store_attr as *const u8);
        builder.symbol("pyseok_build_list", runtime::pyseok_build_list as *const u8);
        builder.symbol("pyseok_build_set", runtime::pyseok_build_set as *const u8);
        builder.symbol("pyseok_build_map", runtime::pyseok_build_map as *const u8);
        builder.symbol(
            "pyseok_exc_state_enter",
            runtime::pyseok_exc_state_enter as *const u8,
        );
        builder.symbol(
            "pyseok_push_finally_sentinels",
            runtime::pyseok_push_finally_sentinels as *const u8,
        );
        builder.symbol("pyseok_end_finally", runtime::pyseok_end_finally as *const u8);
        builder.symbol("pyseok_pop_exc_info", runtime::pyseok_pop_exc_info as *const u8);
        builder.symbol("pyseok_stash_return", runtime::pyseok_stash_return as *const u8);
        builder.symbol("pyseok_stash_jump", runtime::pyseok_stash_jump as *const u8);
        builder.symbol("pyseok_raise", runtime::pyseok_raise as *const u8);

        let module = JITModule::new(builder);

        Ok(Self {
            module,
            func_ctx: codegen::Context::new(),
            next_id: 0,
        })
    }

    /// 함수 하나를 네이티브 코드로 번역
    pub fn translate(&mut self, func: &CompiledFunction) -> TranslateResult<TranslatedFunction> {
        let graph = cfg::build(func)?;
        let analysis = stack_metadata::analyze(func, &graph)?;
        let mut region_map = regions::RegionMap::new(func);

        // 컨텍스트는 재사용하되 함수마다 반드시 초기화
        self.func_ctx.clear();
        self.func_ctx.func.signature = self.entry_signature();

        let mut builder_ctx = FunctionBuilderContext::new();
        let mut builder = FunctionBuilder::new(&mut self.func_ctx.func, &mut builder_ctx);
        lowering::emit_function(
            &mut builder,
            func,
            &graph,
            &analysis,
            &mut region_map,
            &mut self.module,
        )?;

        let symbol = format!("pyseok_fn_{}_{}", self.next_id, func.name);
        self.next_id += 1;
        let clif_id = self
            .module
            .declare_function(&symbol, Linkage::Local, &self.func_ctx.func.signature)
            .map_err(|e| err(TranslateErrorKind::Codegen, format!("declare: {}", e)))?;

        self.module
            .define_function(clif_id, &mut self.func_ctx)
            .map_err(|e| err(TranslateErrorKind::Codegen, format!("define: {}", e)))?;
        self.module
            .finalize_definitions()
            .map_err(|e| err(TranslateErrorKind::Codegen, format!("finalize: {}", e)))?;

        let code_ptr = self.module.get_finalized_function(clif_id);
        let native: NativeCode = unsafe { std::mem::transmute(code_ptr) };

        let consts = func.consts.iter().map(constant_value).collect();
        Ok(TranslatedFunction {
            inner: Arc::new(TranslatedInner {
                name: func.name.clone(),
                native,
                signature: func.signature.clone(),
                consts: Arc::new(consts),
                names: Arc::new(func.names.clone()),
                globals: Arc::new(RwLock::new(HashMap::new())),
                num_locals: func.num_locals,
            }),
        })
    }

    /// 모든 번역된 함수의 공통 진입 시그니처: `i64 f(*mut Frame)`
    fn entry_signature(&self) -> Signature {
        let mut sig = self.module.make_signature();
        let pointer_type = self.module.target_config().pointer_type();
        sig.params.push(AbiParam::new(pointer_type));
        sig.returns.push(AbiParam::new(types::I64));
        sig
    }
}

fn constant_value(c: &Constant) -> Value {
    match c {
        Constant::Int(i) => Value::Int(*i),
        Constant::Float(f) => Value::Float(*f),
        Constant::Bool(b) => Value::Bool(*b),
        Constant::Str(s) => Value::str(s.clone()),
        Constant::None => Value::None,
    }
}

// ========== 번역 결과 ==========

struct TranslatedInner {
    name: String,
    native: NativeCode,
    signature: FunctionSignature,
    consts: Arc<Vec<Value>>,
    names: Arc<Vec<String>>,
    globals: Arc<RwLock<HashMap<String, Value>>>,
    num_locals: u16,
}

/// 번역된 함수 핸들
///
/// 복제는 같은 네이티브 코드를 공유합니다. 코드 포인터는 번역한
/// TranslationEngine보다 오래 살 수 없습니다.
#[derive(Clone)]
pub struct TranslatedFunction {
    inner: Arc<TranslatedInner>,
}

impl TranslatedFunction {
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn signature(&self) -> &FunctionSignature {
        &self.inner.signature
    }

    /// 전역 이름 바인딩 (LoadGlobal이 조회)
    pub fn bind_global(&self, name: impl Into<String>, value: Value) {
        self.inner
            .globals
            .write()
            .expect("globals poisoned")
            .insert(name.into(), value);
    }

    /// 동적 값으로 호출 (위치 인자만, 개수 일치 필수)
    pub fn invoke_dynamic(&self, args: &[Value]) -> RtResult<Value> {
        let inner = &self.inner;
        if args.len() != inner.signature.params.len() {
            return Err(raise(
                "TypeError",
                format!(
                    "{}() takes {} argument(s) but {} given",
                    inner.name,
                    inner.signature.params.len(),
                    args.len()
                ),
            ));
        }
        let mut frame = Frame::new(
            inner.num_locals as usize,
            inner.consts.clone(),
            inner.names.clone(),
            inner.globals.clone(),
        );
        for (slot, arg) in frame.locals.iter_mut().zip(args.iter()) {
            *slot = arg.clone();
        }

        let status = unsafe { (inner.native)(&mut frame as *mut Frame) };
        if status < 0 {
            return Err(frame.take_error());
        }
        Ok(frame.stack.pop().unwrap_or(Value::None))
    }

    /// native 값으로 호출: 인자를 동적 세계로 들여오고 결과를 좁힘
    pub fn invoke_native(&self, args: &[NativeValue]) -> RtResult<NativeValue> {
        let dynamic_args: Vec<Value> = args
            .iter()
            .cloned()
            .map(bridge::to_dynamic)
            .collect::<Result<_, _>>()?;
        let result = self.invoke_dynamic(&dynamic_args)?;
        let narrowed = bridge::to_native(&result, &self.inner.signature.return_type)?;
        Ok(narrowed)
    }
}

impl Callable for TranslatedFunction {
    /// 통일 호출 규약: caller instance → 위치 인자 → 이름 인자 순으로 바인딩
    fn call(
        &self,
        positional: &[Value],
        named: &HashMap<String, Value>,
        caller_instance: Option<&Value>,
    ) -> RtResult<Value> {
        let params = &self.inner.signature.params;
        let mut args: Vec<Value> = Vec::with_capacity(params.len());
        if let Some(ci) = caller_instance {
            args.push(ci.clone());
        }
        args.extend(positional.iter().cloned());

        if args.len() > params.len() {
            return Err(raise(
                "TypeError",
                format!(
                    "{}() takes {} argument(s) but {} given",
                    self.inner.name,
                    params.len(),
                    args.len()
                ),
            ));
        }

        let mut used_named = 0usize;
        for param in params.iter().skip(args.len()) {
            match named.get(&param.name) {
                Some(v) => {
                    args.push(v.clone());
                    used_named += 1;
                }
                None => {
                    return Err(raise(
                        "TypeError",
                        format!(
                            "{}() missing required argument: '{}'",
                            self.inner.name, param.name
                        ),
                    ));
                }
            }
        }
        if used_named != named.len() {
            return Err(raise(
                "TypeError",
                format!("{}() got unexpected keyword argument(s)", self.inner.name),
            ));
        }

        self.invoke_dynamic(&args)
    }

    fn name(&self) -> &str {
        &self.inner.name
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::NativeType;
    use crate::runtime::dunder::CompareOp;
    use crate::translate::instruction::BytecodeBuilder;

    #[test]
    fn test_translate_and_invoke_add() {
        let func = BytecodeBuilder::new("my_add")
            .param("a", NativeType::I64)
            .param("b", NativeType::I64)
            .returns(NativeType::I64)
            .load("a")
            .load("b")
            .add()
            .ret()
            .build();

        let mut engine = TranslationEngine::new().unwrap();
        let translated = engine.translate(&func).unwrap();

        let r = translated
            .invoke_dynamic(&[Value::Int(2), Value::Int(40)])
            .unwrap();
        assert_eq!(r, Value::Int(42));

        // native 경계로도 같은 결과
        let r = translated
            .invoke_native(&[NativeValue::I64(3), NativeValue::I64(4)])
            .unwrap();
        assert!(matches!(r, NativeValue::I64(7)));
    }

    #[test]
    fn test_context_reused_across_translations() {
        let mut engine = TranslationEngine::new().unwrap();
        let f1 = BytecodeBuilder::new("one").const_int(1).ret().build();
        let f2 = BytecodeBuilder::new("two").const_int(2).ret().build();
        let t1 = engine.translate(&f1).unwrap();
        let t2 = engine.translate(&f2).unwrap();
        assert_eq!(t1.invoke_dynamic(&[]).unwrap(), Value::Int(1));
        assert_eq!(t2.invoke_dynamic(&[]).unwrap(), Value::Int(2));
    }

    #[test]
    fn test_invoke_dynamic_arity_error() {
        let func = BytecodeBuilder::new("id")
            .param("x", NativeType::Dynamic)
            .load("x")
            .ret()
            .build();
        let mut engine = TranslationEngine::new().unwrap();
        let t = engine.translate(&func).unwrap();
        let e = t.invoke_dynamic(&[]).unwrap_err();
        assert_eq!(e.type_name(), "TypeError");
    }

    #[test]
    fn test_callable_binds_named_arguments() {
        let func = BytecodeBuilder::new("sub")
            .param("a", NativeType::I64)
            .param("b", NativeType::I64)
            .load("a")
            .load("b")
            .sub()
            .ret()
            .build();
        let mut engine = TranslationEngine::new().unwrap();
        let t = engine.translate(&func).unwrap();

        let mut named = HashMap::new();
        named.insert("b".to_string(), Value::Int(8));
        let r = t.call(&[Value::Int(10)], &named, None).unwrap();
        assert_eq!(r, Value::Int(2));

        // caller instance는 첫 위치 인자로
        let r = t
            .call(&[Value::Int(8)], &HashMap::new(), Some(&Value::Int(10)))
            .unwrap();
        assert_eq!(r, Value::Int(2));
    }

    #[test]
    fn test_raised_exception_crosses_native_boundary() {
        let func = BytecodeBuilder::new("div")
            .param("a", NativeType::I64)
            .param("b", NativeType::I64)
            .load("a")
            .load("b")
            .floordiv()
            .ret()
            .build();
        let mut engine = TranslationEngine::new().unwrap();
        let t = engine.translate(&func).unwrap();

        assert_eq!(
            t.invoke_dynamic(&[Value::Int(7), Value::Int(2)]).unwrap(),
            Value::Int(3)
        );
        let e = t
            .invoke_dynamic(&[Value::Int(1), Value::Int(0)])
            .unwrap_err();
        assert_eq!(e.type_name(), "ZeroDivisionError");
    }

    #[test]
    fn test_conditional_translation() {
        let func = BytecodeBuilder::new("pick")
            .param("a", NativeType::I64)
            .load("a")
            .const_int(5)
            .compare(CompareOp::Lt)
            .if_else(|b| b.const_int(10), |b| b.const_int(-10))
            .ret()
            .build();
        let mut engine = TranslationEngine::new().unwrap();
        let t = engine.translate(&func).unwrap();
        assert_eq!(t.invoke_dynamic(&[Value::Int(3)]).unwrap(), Value::Int(10));
        assert_eq!(t.invoke_dynamic(&[Value::Int(7)]).unwrap(), Value::Int(-10));
    }
}
