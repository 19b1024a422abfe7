//! 번역된 코드가 호출하는 런타임 helper
//!
//! 모든 helper는 `unsafe extern "C" fn(*mut Frame, ...) -> i64` 형태이며
//! 상태 코드를 반환합니다: 0 = 성공, 양수 = 제어 신호, 음수 = 실패.
//! 실패의 payload(예외)는 Frame에 out-of-band로 둡니다.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use crate::runtime::builtins;
use crate::runtime::dunder::{
    BinaryOp, CompareOp, TernaryOp, UnaryOp, dispatch_binary, dispatch_compare,
    dispatch_ternary, dispatch_unary,
};
use crate::runtime::exceptions::{Raised, raise};
use crate::runtime::types::registry;
use crate::runtime::value::{DictKey, Value};
use crate::translate::regions::RETURN_TOKEN;
use crate::translate::stack_metadata::HANDLER_STATE_SLOTS;

/// 성공
pub const STATUS_OK: i64 = 0;
/// 예외 전파 중 (Frame.error에 payload)
pub const STATUS_RAISED: i64 = -1;
/// 번역기 불변식 위반 (스택 언더플로 등)
pub const STATUS_FAULT: i64 = -2;

/// 런타임 스택 상한
pub const MAX_STACK: usize = 64 * 1024;

/// 번역된 함수 한 번 호출의 실행 상태
///
/// 추상 해석기가 증명한 깊이대로 값이 오가는 런타임 스택입니다.
pub struct Frame {
    pub stack: Vec<Value>,
    pub locals: Vec<Value>,
    pub consts: Arc<Vec<Value>>,
    pub names: Arc<Vec<String>>,
    pub globals: Arc<RwLock<HashMap<String, Value>>>,
    /// 전파 중인 예외
    pub error: Option<Raised>,
    /// stash 직후의 보류 분기 토큰 (0 = 없음, 1 = return, 2+ = 점프).
    /// 바로 다음 핸들러 상태 push가 슬롯으로 옮겨 가므로 여기 오래 머물지 않음
    pub pending_token: i64,
    /// stash 직후의 보류 return 값
    pub pending_value: Option<Value>,
}

impl Frame {
    pub fn new(
        num_locals: usize,
        consts: Arc<Vec<Value>>,
        names: Arc<Vec<String>>,
        globals: Arc<RwLock<HashMap<String, Value>>>,
    ) -> Self {
        Frame {
            stack: Vec::with_capacity(16),
            locals: vec![Value::None; num_locals],
            consts,
            names,
            globals,
            error: None,
            pending_token: 0,
            pending_value: None,
        }
    }

    pub fn take_error(&mut self) -> Raised {
        self.error
            .take()
            .unwrap_or_else(|| raise("RuntimeError", "translated code faulted"))
    }

    fn fail(&mut self, e: Raised) -> i64 {
        self.error = Some(e);
        STATUS_RAISED
    }

    fn fault(&mut self, msg: &str) -> i64 {
        self.error = Some(raise("RuntimeError", msg.to_string()));
        STATUS_FAULT
    }

    fn push(&mut self, v: Value) -> i64 {
        if self.stack.len() >= MAX_STACK {
            return self.fault("value stack overflow");
        }
        self.stack.push(v);
        STATUS_OK
    }

    fn pop(&mut self) -> Result<Value, i64> {
        match self.stack.pop() {
            Some(v) => Ok(v),
            None => Err(self.fault("value stack underflow")),
        }
    }
}

macro_rules! frame_pop {
    ($frame:expr) => {
        match $frame.pop() {
            Ok(v) => v,
            Err(status) => return status,
        }
    };
}

macro_rules! frame_try {
    ($frame:expr, $result:expr) => {
        match $result {
            Ok(v) => v,
            Err(e) => return $frame.fail(e),
        }
    };
}

// ========== 스택/상수/로컬 ==========

#[unsafe(no_mangle)]
pub unsafe extern "C" fn pyseok_load_const(frame: *mut Frame, idx: i64) -> i64 {
    let frame = unsafe { &mut *frame };
    match frame.consts.get(idx as usize) {
        Some(v) => {
            let v = v.clone();
            frame.push(v)
        }
        None => frame.fault("constant index out of range"),
    }
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn pyseok_load_local(frame: *mut Frame, idx: i64) -> i64 {
    let frame = unsafe { &mut *frame };
    match frame.locals.get(idx as usize) {
        Some(v) => {
            let v = v.clone();
            frame.push(v)
        }
        None => frame.fault("local index out of range"),
    }
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn pyseok_store_local(frame: *mut Frame, idx: i64) -> i64 {
    let frame = unsafe { &mut *frame };
    let v = frame_pop!(frame);
    match frame.locals.get_mut(idx as usize) {
        Some(slot) => {
            *slot = v;
            STATUS_OK
        }
        None => frame.fault("local index out of range"),
    }
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn pyseok_load_global(frame: *mut Frame, name_idx: i64) -> i64 {
    let frame = unsafe { &mut *frame };
    let Some(name) = frame.names.get(name_idx as usize).cloned() else {
        return frame.fault("name index out of range");
    };
    let found = frame
        .globals
        .read()
        .expect("globals poisoned")
        .get(&name)
        .cloned();
    match found {
        Some(v) => frame.push(v),
        None => frame.fail(raise("NameError", format!("name '{}' is not defined", name))),
    }
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn pyseok_pop(frame: *mut Frame) -> i64 {
    let frame = unsafe { &mut *frame };
    let _ = frame_pop!(frame);
    STATUS_OK
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn pyseok_dup(frame: *mut Frame) -> i64 {
    let frame = unsafe { &mut *frame };
    match frame.stack.last() {
        Some(v) => {
            let v = v.clone();
            frame.push(v)
        }
        None => frame.fault("dup on empty stack"),
    }
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn pyseok_swap(frame: *mut Frame) -> i64 {
    let frame = unsafe { &mut *frame };
    let a = frame_pop!(frame);
    let b = frame_pop!(frame);
    frame.push(a);
    frame.push(b)
}

// ========== 일반 dunder 경로 ==========

#[unsafe(no_mangle)]
pub unsafe extern "C" fn pyseok_unary_op(frame: *mut Frame, op_code: i64) -> i64 {
    let frame = unsafe { &mut *frame };
    let Some(op) = UnaryOp::from_code(op_code) else {
        return frame.fault("bad unary op code");
    };
    let v = frame_pop!(frame);
    let r = frame_try!(frame, dispatch_unary(op, v));
    frame.push(r)
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn pyseok_binary_op(frame: *mut Frame, op_code: i64) -> i64 {
    let frame = unsafe { &mut *frame };
    let Some(op) = BinaryOp::from_code(op_code) else {
        return frame.fault("bad binary op code");
    };
    let rhs = frame_pop!(frame);
    let lhs = frame_pop!(frame);
    let r = frame_try!(frame, dispatch_binary(op, lhs, rhs));
    frame.push(r)
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn pyseok_compare_op(frame: *mut Frame, op_code: i64) -> i64 {
    let frame = unsafe { &mut *frame };
    let Some(op) = CompareOp::from_code(op_code) else {
        return frame.fault("bad compare op code");
    };
    let rhs = frame_pop!(frame);
    let lhs = frame_pop!(frame);
    let r = frame_try!(frame, dispatch_compare(op, lhs, rhs));
    frame.push(r)
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn pyseok_not_op(frame: *mut Frame) -> i64 {
    let frame = unsafe { &mut *frame };
    let v = frame_pop!(frame);
    frame.push(Value::Bool(!v.is_truthy()))
}

/// TOS를 pop하고 truthiness를 0/1로 반환 (조건 분기용)
#[unsafe(no_mangle)]
pub unsafe extern "C" fn pyseok_pop_bool(frame: *mut Frame) -> i64 {
    let frame = unsafe { &mut *frame };
    let v = frame_pop!(frame);
    v.is_truthy() as i64
}

// ========== int 특수화 경로 ==========
//
// 추상 해석기가 두 피연산자 모두 int임을 증명했을 때만 방출됩니다.
// bool은 int의 서브타입이라 여기로도 들어올 수 있습니다.

fn int_operand(v: &Value) -> Option<i64> {
    match v {
        Value::Int(i) => Some(*i),
        Value::Bool(b) => Some(*b as i64),
        _ => None,
    }
}

macro_rules! int_fast_binop {
    ($name:ident, $generic:expr, $fast:expr) => {
        #[unsafe(no_mangle)]
        pub unsafe extern "C" fn $name(frame: *mut Frame) -> i64 {
            let frame = unsafe { &mut *frame };
            let rhs = frame_pop!(frame);
            let lhs = frame_pop!(frame);
            if let (Some(a), Some(b)) = (int_operand(&lhs), int_operand(&rhs)) {
                #[allow(clippy::redundant_closure_call)]
                let r = frame_try!(frame, ($fast)(a, b));
                return frame.push(r);
            }
            // 증명이 빗나간 경우에도 의미는 보존: 일반 경로로 위임
            let r = frame_try!(frame, dispatch_binary($generic, lhs, rhs));
            frame.push(r)
        }
    };
}

int_fast_binop!(pyseok_int_add, BinaryOp::Add, |a: i64, b: i64| Ok(Value::Int(
    a.wrapping_add(b)
)));
int_fast_binop!(pyseok_int_sub, BinaryOp::Sub, |a: i64, b: i64| Ok(Value::Int(
    a.wrapping_sub(b)
)));
int_fast_binop!(pyseok_int_mul, BinaryOp::Mul, |a: i64, b: i64| Ok(Value::Int(
    a.wrapping_mul(b)
)));
int_fast_binop!(pyseok_int_floordiv, BinaryOp::FloorDiv, |a, b| {
    builtins::int_floordiv(a, b).map(Value::Int)
});
int_fast_binop!(pyseok_int_mod, BinaryOp::Mod, |a, b| {
    builtins::int_mod(a, b).map(Value::Int)
});
int_fast_binop!(pyseok_int_truediv, BinaryOp::TrueDiv, |a: i64, b: i64| {
    if b == 0 {
        Err(raise("ZeroDivisionError", "division by zero"))
    } else {
        Ok(Value::Float(a as f64 / b as f64))
    }
});

#[unsafe(no_mangle)]
pub unsafe extern "C" fn pyseok_int_neg(frame: *mut Frame) -> i64 {
    let frame = unsafe { &mut *frame };
    let v = frame_pop!(frame);
    match int_operand(&v) {
        Some(a) => frame.push(Value::Int(a.wrapping_neg())),
        None => {
            let r = frame_try!(frame, dispatch_unary(UnaryOp::Negative, v));
            frame.push(r)
        }
    }
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn pyseok_int_compare(frame: *mut Frame, op_code: i64) -> i64 {
    let frame = unsafe { &mut *frame };
    let Some(op) = CompareOp::from_code(op_code) else {
        return frame.fault("bad compare op code");
    };
    let rhs = frame_pop!(frame);
    let lhs = frame_pop!(frame);
    if let (Some(a), Some(b)) = (int_operand(&lhs), int_operand(&rhs)) {
        let r = match op {
            CompareOp::Lt => a < b,
            CompareOp::Le => a <= b,
            CompareOp::Eq => a == b,
            CompareOp::Ne => a != b,
            CompareOp::Gt => a > b,
            CompareOp::Ge => a >= b,
        };
        return frame.push(Value::Bool(r));
    }
    let r = frame_try!(frame, dispatch_compare(op, lhs, rhs));
    frame.push(r)
}

// ========== 첨자/반복/호출 ==========

#[unsafe(no_mangle)]
pub unsafe extern "C" fn pyseok_load_index(frame: *mut Frame) -> i64 {
    let frame = unsafe { &mut *frame };
    let key = frame_pop!(frame);
    let obj = frame_pop!(frame);
    let r = frame_try!(frame, dispatch_binary(BinaryOp::GetItem, obj, key));
    frame.push(r)
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn pyseok_store_index(frame: *mut Frame) -> i64 {
    let frame = unsafe { &mut *frame };
    let value = frame_pop!(frame);
    let key = frame_pop!(frame);
    let obj = frame_pop!(frame);
    frame_try!(frame, dispatch_ternary(TernaryOp::SetItem, obj, key, value));
    STATUS_OK
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn pyseok_get_iter(frame: *mut Frame) -> i64 {
    let frame = unsafe { &mut *frame };
    let v = frame_pop!(frame);
    let it = frame_try!(frame, builtins::get_iter(&v));
    frame.push(it)
}

/// 다음 원소가 있으면 push 후 1, 소진이면 iterator를 pop 후 0
#[unsafe(no_mangle)]
pub unsafe extern "C" fn pyseok_for_iter(frame: *mut Frame) -> i64 {
    let frame = unsafe { &mut *frame };
    let Some(it) = frame.stack.last().cloned() else {
        return frame.fault("for_iter on empty stack");
    };
    match builtins::iter_next(&it) {
        Ok(item) => {
            let status = frame.push(item);
            if status != STATUS_OK {
                return status;
            }
            1
        }
        Err(e) => {
            if e.type_name() == "StopIteration" {
                let _ = frame_pop!(frame);
                0
            } else {
                frame.fail(e)
            }
        }
    }
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn pyseok_call_function(frame: *mut Frame, argc: i64) -> i64 {
    let frame = unsafe { &mut *frame };
    let argc = argc as usize;
    let mut args = vec![Value::None; argc];
    for i in (0..argc).rev() {
        args[i] = frame_pop!(frame);
    }
    let callee = frame_pop!(frame);
    let Some(callable) = callee.as_callable() else {
        return frame.fail(raise(
            "TypeError",
            format!("'{}' object is not callable", callee.type_name()),
        ));
    };
    let r = frame_try!(frame, callable.call(&args, &HashMap::new(), None));
    frame.push(r)
}

// ========== 속성/컬렉션 ==========

#[unsafe(no_mangle)]
pub unsafe extern "C" fn pyseok_load_attr(frame: *mut Frame, name_idx: i64) -> i64 {
    let frame = unsafe { &mut *frame };
    let Some(name) = frame.names.get(name_idx as usize).cloned() else {
        return frame.fault("name index out of range");
    };
    let obj = frame_pop!(frame);
    match obj.get_attr_or_null(&name) {
        Some(v) => frame.push(v),
        None => frame.fail(raise(
            "AttributeError",
            format!("'{}' object has no attribute '{}'", obj.type_name(), name),
        )),
    }
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn pyseok_store_attr(frame: *mut Frame, name_idx: i64) -> i64 {
    let frame = unsafe { &mut *frame };
    let Some(name) = frame.names.get(name_idx as usize).cloned() else {
        return frame.fault("name index out of range");
    };
    let obj = frame_pop!(frame);
    let value = frame_pop!(frame);
    frame_try!(frame, obj.set_attr(&name, value));
    STATUS_OK
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn pyseok_build_list(frame: *mut Frame, n: i64) -> i64 {
    let frame = unsafe { &mut *frame };
    let n = n as usize;
    let mut items = vec![Value::None; n];
    for i in (0..n).rev() {
        items[i] = frame_pop!(frame);
    }
    frame.push(Value::list(items))
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn pyseok_build_set(frame: *mut Frame, n: i64) -> i64 {
    let frame = unsafe { &mut *frame };
    let n = n as usize;
    let mut raw = vec![Value::None; n];
    for i in (0..n).rev() {
        raw[i] = frame_pop!(frame);
    }
    let mut keys: Vec<DictKey> = Vec::with_capacity(n);
    for v in &raw {
        let key = frame_try!(frame, DictKey::from_value(v));
        if !keys.contains(&key) {
            keys.push(key);
        }
    }
    frame.push(Value::set(keys))
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn pyseok_build_map(frame: *mut Frame, n: i64) -> i64 {
    let frame = unsafe { &mut *frame };
    let n = n as usize;
    let mut pairs: Vec<(DictKey, Value)> = Vec::with_capacity(n);
    let mut raw = vec![(Value::None, Value::None); n];
    for i in (0..n).rev() {
        let value = frame_pop!(frame);
        let key = frame_pop!(frame);
        raw[i] = (key, value);
    }
    for (k, v) in raw {
        let key = frame_try!(frame, DictKey::from_value(&k));
        if let Some(slot) = pairs.iter_mut().find(|(pk, _)| *pk == key) {
            slot.1 = v;
        } else {
            pairs.push((key, v));
        }
    }
    frame.push(Value::dict(pairs))
}

// ========== 예외 영역 ==========

// 보류된 분기는 핸들러 상태의 아래 두 칸에 실려 다닙니다: 맨 아래 칸이
// 보류된 return 값, 그 위가 토큰. 예외 재전파나 except의 PopExcInfo가
// 여섯 칸을 버리면 추월당한 보류 분기도 같이 버려집니다.

/// 보류 상태를 frame에서 꺼내 핸들러 상태의 아래 두 칸 꼴로 반환
fn take_pending(frame: &mut Frame) -> (Value, i64) {
    let token = frame.pending_token;
    frame.pending_token = 0;
    let value = frame.pending_value.take().unwrap_or(Value::None);
    (value, token)
}

/// 핸들러 진입: 전파 중인 예외를 여섯 칸 핸들러 상태로 전개
///
/// 예외는 영역 진입 이후 임의 깊이에서 날 수 있으므로, 먼저 스택을
/// 영역 진입 시점 깊이(base_depth)로 되돌린 뒤 push합니다.
/// push 순서 (아래→위): 보류 return 값(없으면 None), 보류 토큰 int,
/// None, traceback, 예외 인스턴스, 예외 타입 객체.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn pyseok_exc_state_enter(frame: *mut Frame, base_depth: i64) -> i64 {
    let frame = unsafe { &mut *frame };
    let Some(raised) = frame.error.take() else {
        return frame.fault("handler entered without pending exception");
    };
    let base = base_depth as usize;
    if frame.stack.len() < base {
        return frame.fault("stack shallower than region entry depth");
    }
    frame.stack.truncate(base);
    let (pending_value, pending_token) = take_pending(frame);
    let exc = raised.into_value();
    let ty = exc.get_type();
    frame.push(pending_value);
    frame.push(Value::Int(pending_token));
    frame.push(Value::None);
    frame.push(Value::traceback());
    frame.push(exc);
    frame.push(Value::type_object(ty))
}

/// 정상/조기 탈출 경로의 finally 진입: 예외 없음 sentinel 여섯 칸
///
/// stash된 보류 분기가 있으면 아래 두 칸에 싣고 frame에서는 지웁니다.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn pyseok_push_finally_sentinels(frame: *mut Frame) -> i64 {
    let frame = unsafe { &mut *frame };
    let (pending_value, pending_token) = take_pending(frame);
    frame.push(pending_value);
    frame.push(Value::Int(pending_token));
    frame.push(Value::None);
    frame.push(Value::None);
    frame.push(Value::None);
    frame.push(Value::None)
}

/// finalizer 종료: 여섯 칸을 pop하고 다음 행동을 결정
///
/// 반환값: 음수 = 예외 재전파, 0 = 계속, 1 = 보류된 return 재개
/// (return 값이 push됨), 2+ = 보류된 점프 토큰. 예외 경로에서는
/// 아래 두 칸의 보류 분기가 슬롯과 함께 버려집니다 (예외가 우선).
#[unsafe(no_mangle)]
pub unsafe extern "C" fn pyseok_end_finally(frame: *mut Frame) -> i64 {
    let frame = unsafe { &mut *frame };
    let _ty_slot = frame_pop!(frame);
    let exc_slot = frame_pop!(frame);
    let _tb = frame_pop!(frame);
    let _s3 = frame_pop!(frame);
    let token_slot = frame_pop!(frame);
    let value_slot = frame_pop!(frame);

    // 예외 경로로 들어왔다면 재전파
    if exc_slot.is_exception_instance() {
        return frame.fail(Raised::new(exc_slot));
    }

    let Value::Int(token) = token_slot else {
        return frame.fault("corrupt handler state: token slot");
    };
    if token != 0 {
        if token == RETURN_TOKEN {
            let status = frame.push(value_slot);
            if status != STATUS_OK {
                return status;
            }
        }
        return token;
    }
    STATUS_OK
}

/// except 핸들러가 소비를 마친 핸들러 상태 여섯 칸 제거
///
/// 잡힌 예외에 추월당한 보류 분기도 여기서 함께 사라집니다.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn pyseok_pop_exc_info(frame: *mut Frame) -> i64 {
    let frame = unsafe { &mut *frame };
    for _ in 0..HANDLER_STATE_SLOTS {
        let _ = frame_pop!(frame);
    }
    STATUS_OK
}

/// return 값을 보류하고 finalizer로 향함
#[unsafe(no_mangle)]
pub unsafe extern "C" fn pyseok_stash_return(frame: *mut Frame) -> i64 {
    let frame = unsafe { &mut *frame };
    let v = frame_pop!(frame);
    frame.pending_value = Some(v);
    frame.pending_token = RETURN_TOKEN;
    STATUS_OK
}

/// 영역 밖으로의 점프를 보류하고 finalizer로 향함
#[unsafe(no_mangle)]
pub unsafe extern "C" fn pyseok_stash_jump(frame: *mut Frame, token: i64) -> i64 {
    let frame = unsafe { &mut *frame };
    frame.pending_token = token;
    STATUS_OK
}

/// TOS를 raise: 예외 인스턴스 또는 예외 타입
#[unsafe(no_mangle)]
pub unsafe extern "C" fn pyseok_raise(frame: *mut Frame) -> i64 {
    let frame = unsafe { &mut *frame };
    let v = frame_pop!(frame);
    if v.is_exception_instance() {
        return frame.fail(Raised::new(v));
    }
    if let Some(callable) = v.as_callable() {
        // 예외 타입이면 인자 없이 인스턴스화
        let ty_is_exception = {
            use crate::runtime::value::ObjectData;
            if let Value::Object(obj) = &v
                && let ObjectData::Type(ty) = &obj.data
            {
                ty.is_subtype_of(&registry().base_exception_type)
            } else {
                false
            }
        };
        if ty_is_exception {
            let exc = frame_try!(frame, callable.call(&[], &HashMap::new(), None));
            return frame.fail(Raised::new(exc));
        }
    }
    frame.fail(raise(
        "TypeError",
        "exceptions must derive from BaseException",
    ))
}
