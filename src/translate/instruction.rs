//! 스택 기반 바이트코드의 명령 집합과 함수 컨테이너
//!
//! 번역기의 입력 형식입니다. 디스어셈블리는 외부 협력자의 몫이고,
//! 여기서는 이미 디코딩된 명령 목록 + 예외 영역 테이블을 받습니다.

use serde::{Deserialize, Serialize};
use strum::Display;

use crate::bridge::NativeType;
use crate::runtime::dunder::CompareOp;

/// 스택 기반 바이트코드 명령
///
/// 점프 대상은 모두 명령 인덱스(절대 오프셋)입니다.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Display)]
pub enum Opcode {
    // ========== 스택/상수 ==========
    /// 상수 테이블의 값을 push
    LoadConst(u32),
    LoadLocal(u16),
    StoreLocal(u16),
    /// 이름 테이블의 이름으로 전역 조회
    LoadGlobal(u16),
    Pop,
    Dup,
    Swap,

    // ========== 연산자 ==========
    Neg,
    Not,
    Add,
    Sub,
    Mul,
    FloorDiv,
    TrueDiv,
    Mod,
    /// obj[key] 조회 (스택: obj, key → result)
    LoadIndex,
    /// obj[key] = value (스택: obj, key, value →)
    StoreIndex,
    Compare(CompareOp),

    // ========== 제어 흐름 ==========
    Jump(u32),
    JumpIfTrue(u32),
    JumpIfFalse(u32),
    /// TOS를 iterator로 변환
    GetIter,
    /// 다음 원소를 push하거나, 소진 시 iterator를 pop하고 대상으로 점프
    ForIter(u32),
    /// callable 위에 쌓인 argc개의 인자로 호출 (스택: callable, arg1..argN)
    CallFunction(u8),
    Return,
    /// TOS의 예외 (인스턴스 또는 예외 타입) raise
    Raise,

    // ========== 속성/컬렉션 ==========
    LoadAttr(u16),
    /// 스택: value, obj → (obj.attr = value)
    StoreAttr(u16),
    BuildList(u16),
    BuildSet(u16),
    BuildMap(u16),

    // ========== 예외 영역 ==========
    /// 보호 영역 시작, 핸들러 오프셋 지정
    SetupFinally(u32),
    /// 보호 영역의 정상 종료
    PopBlock,
    /// 정상 경로에서 핸들러 상태 6칸을 sentinel로 push
    BeginFinally,
    /// 핸들러 상태 6칸을 pop하고 재전파/보류 분기 재개/계속 중 결정
    EndFinally,
    /// except 핸들러가 소비를 마친 핸들러 상태 6칸을 pop
    PopExcInfo,
}

impl Opcode {
    /// 이 명령 이후로 fall-through가 불가능한가
    pub fn is_terminator(&self) -> bool {
        matches!(
            self,
            Opcode::Jump(_) | Opcode::Return | Opcode::Raise | Opcode::EndFinally
        )
    }

    /// 점프 대상 (조건 분기와 ForIter 포함)
    pub fn jump_target(&self) -> Option<u32> {
        match self {
            Opcode::Jump(t)
            | Opcode::JumpIfTrue(t)
            | Opcode::JumpIfFalse(t)
            | Opcode::ForIter(t)
            | Opcode::SetupFinally(t) => Some(*t),
            _ => None,
        }
    }
}

/// 오프셋과 점프 대상 여부가 붙은 명령
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Instruction {
    pub op: Opcode,
    pub offset: u32,
    pub is_jump_target: bool,
}

/// 상수 테이블 원소
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Constant {
    Int(i64),
    Float(f64),
    Bool(bool),
    Str(String),
    None,
}

// ========== 예외 영역 ==========

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RegionKind {
    Finally,
    Except,
}

/// 보호 구간 [start, end)와 핸들러 오프셋
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExceptionRegion {
    pub start: u32,
    pub end: u32,
    pub handler: u32,
    pub kind: RegionKind,
}

impl ExceptionRegion {
    pub fn contains(&self, offset: u32) -> bool {
        offset >= self.start && offset < self.end
    }

    pub fn extent(&self) -> u32 {
        self.end - self.start
    }
}

// ========== 함수 시그니처 ==========

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Parameter {
    pub name: String,
    pub ty: NativeType,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FunctionSignature {
    pub params: Vec<Parameter>,
    pub return_type: NativeType,
}

impl FunctionSignature {
    pub fn dynamic(param_names: &[&str]) -> Self {
        FunctionSignature {
            params: param_names
                .iter()
                .map(|n| Parameter {
                    name: (*n).to_string(),
                    ty: NativeType::Dynamic,
                })
                .collect(),
            return_type: NativeType::Dynamic,
        }
    }
}

/// 번역기에 들어가는 함수 한 개
///
/// 파라미터는 locals의 앞부분 슬롯을 차지합니다.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompiledFunction {
    pub name: String,
    pub signature: FunctionSignature,
    pub instructions: Vec<Instruction>,
    pub regions: Vec<ExceptionRegion>,
    pub consts: Vec<Constant>,
    /// 전역/속성 조회용 이름 테이블
    pub names: Vec<String>,
    pub num_locals: u16,
}

// ========== 빌더 ==========

/// 해소되지 않은 점프 레이블
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Label(usize);

/// 테스트/임베딩용 바이트코드 빌더
///
/// 레이블로 앞/뒤 점프를 만들고 build()에서 오프셋으로 해소합니다.
pub struct BytecodeBuilder {
    name: String,
    signature: FunctionSignature,
    ops: Vec<Opcode>,
    regions: Vec<ExceptionRegion>,
    consts: Vec<Constant>,
    names: Vec<String>,
    locals: Vec<String>,
    labels: Vec<Option<u32>>,
    /// (명령 인덱스, 레이블) — build()에서 패치
    fixups: Vec<(usize, Label)>,
}

impl BytecodeBuilder {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            signature: FunctionSignature {
                params: vec![],
                return_type: NativeType::Dynamic,
            },
            ops: vec![],
            regions: vec![],
            consts: vec![],
            names: vec![],
            locals: vec![],
            labels: vec![],
            fixups: vec![],
        }
    }

    // ----- 시그니처 -----

    pub fn param(mut self, name: &str, ty: NativeType) -> Self {
        self.signature.params.push(Parameter {
            name: name.to_string(),
            ty,
        });
        self.locals.push(name.to_string());
        self
    }

    pub fn returns(mut self, ty: NativeType) -> Self {
        self.signature.return_type = ty;
        self
    }

    // ----- 테이블 관리 -----

    fn const_index(&mut self, c: Constant) -> u32 {
        if let Some(i) = self.consts.iter().position(|x| *x == c) {
            return i as u32;
        }
        self.consts.push(c);
        (self.consts.len() - 1) as u32
    }

    fn name_index(&mut self, name: &str) -> u16 {
        if let Some(i) = self.names.iter().position(|x| x == name) {
            return i as u16;
        }
        self.names.push(name.to_string());
        (self.names.len() - 1) as u16
    }

    fn local_index(&mut self, name: &str) -> u16 {
        if let Some(i) = self.locals.iter().position(|x| x == name) {
            return i as u16;
        }
        self.locals.push(name.to_string());
        (self.locals.len() - 1) as u16
    }

    fn emit(mut self, op: Opcode) -> Self {
        self.ops.push(op);
        self
    }

    fn here(&self) -> u32 {
        self.ops.len() as u32
    }

    // ----- 상수/로컬/전역 -----

    pub fn const_int(mut self, v: i64) -> Self {
        let idx = self.const_index(Constant::Int(v));
        self.emit(Opcode::LoadConst(idx))
    }

    pub fn const_float(mut self, v: f64) -> Self {
        let idx = self.const_index(Constant::Float(v));
        self.emit(Opcode::LoadConst(idx))
    }

    pub fn const_bool(mut self, v: bool) -> Self {
        let idx = self.const_index(Constant::Bool(v));
        self.emit(Opcode::LoadConst(idx))
    }

    pub fn const_str(mut self, v: &str) -> Self {
        let idx = self.const_index(Constant::Str(v.to_string()));
        self.emit(Opcode::LoadConst(idx))
    }

    pub fn const_none(mut self) -> Self {
        let idx = self.const_index(Constant::None);
        self.emit(Opcode::LoadConst(idx))
    }

    /// 파라미터 또는 이미 저장된 로컬을 push
    pub fn load(mut self, name: &str) -> Self {
        let idx = self.local_index(name);
        self.emit(Opcode::LoadLocal(idx))
    }

    pub fn store(mut self, name: &str) -> Self {
        let idx = self.local_index(name);
        self.emit(Opcode::StoreLocal(idx))
    }

    pub fn load_global(mut self, name: &str) -> Self {
        let idx = self.name_index(name);
        self.emit(Opcode::LoadGlobal(idx))
    }

    // ----- 단순 명령 -----

    pub fn pop(self) -> Self {
        self.emit(Opcode::Pop)
    }

    pub fn dup(self) -> Self {
        self.emit(Opcode::Dup)
    }

    pub fn swap(self) -> Self {
        self.emit(Opcode::Swap)
    }

    pub fn add(self) -> Self {
        self.emit(Opcode::Add)
    }

    pub fn sub(self) -> Self {
        self.emit(Opcode::Sub)
    }

    pub fn mul(self) -> Self {
        self.emit(Opcode::Mul)
    }

    pub fn floordiv(self) -> Self {
        self.emit(Opcode::FloorDiv)
    }

    pub fn truediv(self) -> Self {
        self.emit(Opcode::TrueDiv)
    }

    pub fn modulo(self) -> Self {
        self.emit(Opcode::Mod)
    }

    pub fn neg(self) -> Self {
        self.emit(Opcode::Neg)
    }

    pub fn not(self) -> Self {
        self.emit(Opcode::Not)
    }

    pub fn compare(self, op: CompareOp) -> Self {
        self.emit(Opcode::Compare(op))
    }

    pub fn load_index(self) -> Self {
        self.emit(Opcode::LoadIndex)
    }

    pub fn store_index(self) -> Self {
        self.emit(Opcode::StoreIndex)
    }

    pub fn get_iter(self) -> Self {
        self.emit(Opcode::GetIter)
    }

    pub fn call_function(self, argc: u8) -> Self {
        self.emit(Opcode::CallFunction(argc))
    }

    pub fn load_attr(mut self, name: &str) -> Self {
        let idx = self.name_index(name);
        self.emit(Opcode::LoadAttr(idx))
    }

    pub fn store_attr(mut self, name: &str) -> Self {
        let idx = self.name_index(name);
        self.emit(Opcode::StoreAttr(idx))
    }

    pub fn build_list(self, n: u16) -> Self {
        self.emit(Opcode::BuildList(n))
    }

    pub fn build_set(self, n: u16) -> Self {
        self.emit(Opcode::BuildSet(n))
    }

    pub fn build_map(self, n: u16) -> Self {
        self.emit(Opcode::BuildMap(n))
    }

    pub fn raise(self) -> Self {
        self.emit(Opcode::Raise)
    }

    pub fn ret(self) -> Self {
        self.emit(Opcode::Return)
    }

    // ----- 레이블/분기 -----

    pub fn new_label(&mut self) -> Label {
        self.labels.push(None);
        Label(self.labels.len() - 1)
    }

    pub fn bind(mut self, label: Label) -> Self {
        self.labels[label.0] = Some(self.here());
        self
    }

    fn emit_jump(mut self, make: fn(u32) -> Opcode, label: Label) -> Self {
        self.fixups.push((self.ops.len(), label));
        self.emit(make(u32::MAX))
    }

    pub fn jump(self, label: Label) -> Self {
        self.emit_jump(Opcode::Jump, label)
    }

    pub fn jump_if_true(self, label: Label) -> Self {
        self.emit_jump(Opcode::JumpIfTrue, label)
    }

    pub fn jump_if_false(self, label: Label) -> Self {
        self.emit_jump(Opcode::JumpIfFalse, label)
    }

    pub fn for_iter(self, exhausted: Label) -> Self {
        self.emit_jump(Opcode::ForIter, exhausted)
    }

    /// TOS가 참일 때만 block 실행
    pub fn if_true(mut self, block: impl FnOnce(Self) -> Self) -> Self {
        let end = self.new_label();
        self = self.jump_if_false(end);
        self = block(self);
        self.bind(end)
    }

    /// TOS가 거짓일 때만 block 실행
    pub fn if_false(mut self, block: impl FnOnce(Self) -> Self) -> Self {
        let end = self.new_label();
        self = self.jump_if_true(end);
        self = block(self);
        self.bind(end)
    }

    pub fn if_else(
        mut self,
        then_block: impl FnOnce(Self) -> Self,
        else_block: impl FnOnce(Self) -> Self,
    ) -> Self {
        let else_label = self.new_label();
        let end = self.new_label();
        self = self.jump_if_false(else_label);
        self = then_block(self);
        self = self.jump(end);
        self = self.bind(else_label);
        self = else_block(self);
        self.bind(end)
    }

    // ----- 예외 영역 -----

    /// try { body } finally { finalizer }
    ///
    /// finalizer 코드는 정상 경로(BeginFinally의 sentinel 뒤)와
    /// 예외 경로(핸들러 진입 뒤)가 공유합니다.
    pub fn try_finally(
        mut self,
        body: impl FnOnce(Self) -> Self,
        finalizer: impl FnOnce(Self) -> Self,
    ) -> Self {
        let handler = self.new_label();
        self = self.emit_jump(Opcode::SetupFinally, handler);
        let start = self.here();
        self = body(self);
        let end = self.here();
        self = self.emit(Opcode::PopBlock);
        self = self.emit(Opcode::BeginFinally);
        self = self.bind(handler);
        let handler_at = self.labels[handler.0].expect("handler bound");
        self = finalizer(self);
        self = self.emit(Opcode::EndFinally);
        self.regions.push(ExceptionRegion {
            start,
            end,
            handler: handler_at,
            kind: RegionKind::Finally,
        });
        self
    }

    /// try { body } except { handler } — 핸들러는 예외를 잡아 소비합니다.
    ///
    /// 핸들러 진입 시 스택에는 핸들러 상태 6칸이 올라와 있고,
    /// handler 블록은 PopExcInfo 이후의 코드를 받습니다.
    pub fn try_except(
        mut self,
        body: impl FnOnce(Self) -> Self,
        handler: impl FnOnce(Self) -> Self,
    ) -> Self {
        let handler_label = self.new_label();
        let after = self.new_label();
        self = self.emit_jump(Opcode::SetupFinally, handler_label);
        let start = self.here();
        self = body(self);
        let end = self.here();
        self = self.emit(Opcode::PopBlock);
        self = self.jump(after);
        self = self.bind(handler_label);
        let handler_at = self.labels[handler_label.0].expect("handler bound");
        self = self.emit(Opcode::PopExcInfo);
        self = handler(self);
        self = self.bind(after);
        self.regions.push(ExceptionRegion {
            start,
            end,
            handler: handler_at,
            kind: RegionKind::Except,
        });
        self
    }

    // ----- 최종 조립 -----

    /// 레이블을 해소하고 점프 대상 플래그를 계산합니다.
    pub fn build(self) -> CompiledFunction {
        let mut ops = self.ops;
        for (idx, label) in &self.fixups {
            let target = self.labels[label.0].expect("unbound label");
            ops[*idx] = match &ops[*idx] {
                Opcode::Jump(_) => Opcode::Jump(target),
                Opcode::JumpIfTrue(_) => Opcode::JumpIfTrue(target),
                Opcode::JumpIfFalse(_) => Opcode::JumpIfFalse(target),
                Opcode::ForIter(_) => Opcode::ForIter(target),
                Opcode::SetupFinally(_) => Opcode::SetupFinally(target),
                other => other.clone(),
            };
        }

        let mut targets = vec![false; ops.len() + 1];
        for op in &ops {
            if let Some(t) = op.jump_target()
                && (t as usize) < targets.len()
            {
                targets[t as usize] = true;
            }
        }
        for region in &self.regions {
            if (region.handler as usize) < targets.len() {
                targets[region.handler as usize] = true;
            }
        }

        let instructions = ops
            .into_iter()
            .enumerate()
            .map(|(i, op)| Instruction {
                op,
                offset: i as u32,
                is_jump_target: targets[i],
            })
            .collect();

        CompiledFunction {
            name: self.name,
            signature: self.signature,
            instructions,
            regions: self.regions,
            consts: self.consts,
            names: self.names,
            num_locals: self.locals.len() as u16,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder_resolves_forward_labels() {
        let mut b = BytecodeBuilder::new("f").param("a", NativeType::Dynamic);
        let end = b.new_label();
        let f = b
            .load("a")
            .jump_if_false(end)
            .const_int(1)
            .ret()
            .bind(end)
            .const_int(0)
            .ret()
            .build();

        assert_eq!(f.instructions[1].op, Opcode::JumpIfFalse(4));
        assert!(f.instructions[4].is_jump_target);
        assert!(!f.instructions[2].is_jump_target);
    }

    #[test]
    fn test_builder_dedups_constants_and_names() {
        let f = BytecodeBuilder::new("f")
            .const_int(5)
            .const_int(5)
            .const_int(6)
            .load_global("g")
            .load_global("g")
            .pop()
            .pop()
            .pop()
            .pop()
            .pop()
            .const_none()
            .ret()
            .build();
        assert_eq!(f.consts.len(), 3); // 5, 6, None
        assert_eq!(f.names, vec!["g".to_string()]);
    }

    #[test]
    fn test_if_else_shape() {
        let f = BytecodeBuilder::new("f")
            .param("c", NativeType::Dynamic)
            .load("c")
            .if_else(|b| b.const_int(10), |b| b.const_int(-10))
            .ret()
            .build();
        // load, jump_if_false, const, jump, const, ret
        assert!(matches!(f.instructions[1].op, Opcode::JumpIfFalse(4)));
        assert!(matches!(f.instructions[3].op, Opcode::Jump(5)));
    }

    #[test]
    fn test_try_finally_region_table() {
        let f = BytecodeBuilder::new("f")
            .try_finally(|b| b.const_int(1).store("x"), |b| b.const_int(2).store("y"))
            .const_none()
            .ret()
            .build();

        assert_eq!(f.regions.len(), 1);
        let region = &f.regions[0];
        assert_eq!(region.kind, RegionKind::Finally);
        // SetupFinally 다음부터 PopBlock 전까지가 보호 구간
        assert!(matches!(f.instructions[0].op, Opcode::SetupFinally(_)));
        assert_eq!(region.start, 1);
        assert!(matches!(
            f.instructions[region.end as usize].op,
            Opcode::PopBlock
        ));
        // 핸들러는 BeginFinally 바로 다음
        assert!(matches!(
            f.instructions[(region.handler - 1) as usize].op,
            Opcode::BeginFinally
        ));
        assert!(f.instructions[region.handler as usize].is_jump_target);
    }

    #[test]
    fn test_terminator_classification() {
        assert!(Opcode::Return.is_terminator());
        assert!(Opcode::Jump(0).is_terminator());
        assert!(Opcode::EndFinally.is_terminator());
        assert!(!Opcode::JumpIfFalse(0).is_terminator());
        assert!(!Opcode::ForIter(0).is_terminator());
    }
}
