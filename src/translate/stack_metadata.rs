//! 스택 메타데이터 추상 해석기
//!
//! 각 명령 직전의 스택 깊이와 칸별 타입/출처를 고정점까지 전파합니다.
//! 결과는 코드 방출 단계의 특수화(예: int 전용 경로)를 허가하는 근거가
//! 됩니다. 합류 지점에서 깊이가 다르면 번역 전체가 실패합니다.

use crate::runtime::types::{TypeRef, registry};
use crate::translate::cfg::{BlockId, ControlFlowGraph};
use crate::translate::instruction::{CompiledFunction, Constant, Opcode};
use crate::translate::{TranslateError, TranslateErrorKind, TranslateResult};

/// 스택 한 칸의 추상 상태
#[derive(Debug, Clone)]
pub struct ValueSourceInfo {
    /// 이 칸에 올 수 있는 값들의 공통 타입 (상한)
    pub value_type: TypeRef,
    /// 값을 만든 명령 오프셋. 합성 값(핸들러 상태 등)은 None.
    pub source: Option<u32>,
}

impl ValueSourceInfo {
    fn new(value_type: TypeRef, source: Option<u32>) -> Self {
        Self { value_type, source }
    }

    fn synthetic(value_type: TypeRef) -> Self {
        Self::new(value_type, None)
    }
}

/// 한 지점의 추상 기계 상태
#[derive(Debug, Clone)]
pub struct StackMetadata {
    pub stack: Vec<ValueSourceInfo>,
    pub locals: Vec<ValueSourceInfo>,
}

impl StackMetadata {
    pub fn depth(&self) -> usize {
        self.stack.len()
    }

    /// TOS에서 depth칸 아래의 타입 (0 = TOS)
    pub fn type_below_top(&self, depth: usize) -> Option<&TypeRef> {
        let len = self.stack.len();
        if depth < len {
            Some(&self.stack[len - 1 - depth].value_type)
        } else {
            None
        }
    }

    fn pop(&mut self, offset: u32) -> TranslateResult<ValueSourceInfo> {
        self.stack.pop().ok_or_else(|| {
            TranslateError::at(
                TranslateErrorKind::StackUnderflow,
                offset,
                "pop from empty abstract stack",
            )
        })
    }

    fn pop_n(&mut self, n: usize, offset: u32) -> TranslateResult<()> {
        for _ in 0..n {
            self.pop(offset)?;
        }
        Ok(())
    }

    fn push(&mut self, info: ValueSourceInfo) {
        self.stack.push(info);
    }
}

/// 두 타입의 합류: 가장 가까운 공통 조상
pub fn merge_types(a: &TypeRef, b: &TypeRef) -> TypeRef {
    a.common_ancestor(b)
}

/// 합류 지점 상태 통합. 깊이가 다르면 에러.
///
/// 교환적이고 멱등적입니다. 상태가 실제로 바뀌었는지 함께 반환합니다.
pub fn unify(
    existing: &StackMetadata,
    incoming: &StackMetadata,
    offset: u32,
) -> TranslateResult<(StackMetadata, bool)> {
    if existing.stack.len() != incoming.stack.len() {
        return Err(TranslateError::at(
            TranslateErrorKind::DepthMismatch,
            offset,
            format!(
                "stack depth {} vs {} at merge point",
                existing.stack.len(),
                incoming.stack.len()
            ),
        ));
    }
    let mut changed = false;
    let merge_slot = |a: &ValueSourceInfo, b: &ValueSourceInfo, changed: &mut bool| {
        let ty = merge_types(&a.value_type, &b.value_type);
        let source = if a.source == b.source { a.source } else { None };
        if !std::sync::Arc::ptr_eq(&ty, &a.value_type) || source != a.source {
            *changed = true;
        }
        ValueSourceInfo::new(ty, source)
    };
    let stack = existing
        .stack
        .iter()
        .zip(incoming.stack.iter())
        .map(|(a, b)| merge_slot(a, b, &mut changed))
        .collect();
    let locals = existing
        .locals
        .iter()
        .zip(incoming.locals.iter())
        .map(|(a, b)| merge_slot(a, b, &mut changed))
        .collect();
    Ok((StackMetadata { stack, locals }, changed))
}

/// SetupFinally가 핸들러에 넘기는 여섯 칸 (마지막이 TOS)
///
/// 순서는 레거시 핸들러 상태 규약 그대로: None, int, None,
/// traceback, 예외 인스턴스, 예외 타입 객체.
///
/// 런타임에서는 아래 두 칸이 보류된 분기(값, 토큰)를 실어 나르지만
/// 여섯 칸은 항상 통째로 버려지므로 추상 타입은 규약대로 둡니다.
pub fn handler_state_slots() -> Vec<ValueSourceInfo> {
    let reg = registry();
    vec![
        ValueSourceInfo::synthetic(reg.none_type.clone()),
        ValueSourceInfo::synthetic(reg.int_type.clone()),
        ValueSourceInfo::synthetic(reg.none_type.clone()),
        ValueSourceInfo::synthetic(reg.traceback_type.clone()),
        ValueSourceInfo::synthetic(reg.base_exception_type.clone()),
        ValueSourceInfo::synthetic(reg.type_type.clone()),
    ]
}

/// 핸들러 상태의 칸 수
pub const HANDLER_STATE_SLOTS: usize = 6;

fn constant_type(c: &Constant) -> TypeRef {
    let reg = registry();
    match c {
        Constant::Int(_) => reg.int_type.clone(),
        Constant::Float(_) => reg.float_type.clone(),
        Constant::Bool(_) => reg.bool_type.clone(),
        Constant::Str(_) => reg.str_type.clone(),
        Constant::None => reg.none_type.clone(),
    }
}

fn is_int_like(ty: &TypeRef) -> bool {
    let reg = registry();
    ty.is_subtype_of(&reg.int_type)
}

fn is_numeric(ty: &TypeRef) -> bool {
    let reg = registry();
    ty.is_subtype_of(&reg.int_type) || ty.is_subtype_of(&reg.float_type)
}

fn is_str(ty: &TypeRef) -> bool {
    let reg = registry();
    ty.is_subtype_of(&reg.str_type)
}

/// 이항 산술 결과 타입
fn binary_result(op: &Opcode, lhs: &TypeRef, rhs: &TypeRef) -> TypeRef {
    let reg = registry();
    match op {
        Opcode::TrueDiv if is_numeric(lhs) && is_numeric(rhs) => reg.float_type.clone(),
        Opcode::Add if is_str(lhs) && is_str(rhs) => reg.str_type.clone(),
        Opcode::Add | Opcode::Sub | Opcode::Mul | Opcode::FloorDiv | Opcode::Mod => {
            if is_int_like(lhs) && is_int_like(rhs) {
                reg.int_type.clone()
            } else if is_numeric(lhs) && is_numeric(rhs) {
                reg.float_type.clone()
            } else {
                reg.object_type.clone()
            }
        }
        _ => reg.object_type.clone(),
    }
}

/// 분석 결과: 각 명령 직전의 상태 (도달 불가능하면 None)
pub type Analysis = Vec<Option<StackMetadata>>;

/// 고정점 분석
pub fn analyze(func: &CompiledFunction, cfg: &ControlFlowGraph) -> TranslateResult<Analysis> {
    let reg = registry();

    // 진입 상태: 빈 스택, 파라미터 타입이 앞 슬롯에 깔린 locals
    let mut initial_locals: Vec<ValueSourceInfo> =
        Vec::with_capacity(func.num_locals as usize);
    for param in &func.signature.params {
        initial_locals.push(ValueSourceInfo::synthetic(param.ty.dynamic_type()));
    }
    while initial_locals.len() < func.num_locals as usize {
        initial_locals.push(ValueSourceInfo::synthetic(reg.object_type.clone()));
    }
    let initial = StackMetadata {
        stack: vec![],
        locals: initial_locals,
    };

    let mut entry_states: Vec<Option<StackMetadata>> = vec![None; cfg.blocks.len()];
    entry_states[0] = Some(initial);
    let mut worklist: Vec<BlockId> = vec![0];

    while let Some(bid) = worklist.pop() {
        let block = &cfg.blocks[bid];
        let mut state = entry_states[bid]
            .clone()
            .expect("block on worklist has entry state");

        let mut propagations: Vec<(u32, StackMetadata)> = vec![];
        for offset in block.start..block.end {
            let instr = &func.instructions[offset as usize];
            step(func, &instr.op, offset, &mut state, &mut propagations)?;
        }

        // 블록 끝의 통상 후속 (분기 의존 상태는 step이 propagations로 처리)
        let last = &func.instructions[(block.end - 1) as usize];
        match &last.op {
            Opcode::Jump(t) => propagations.push((*t, state.clone())),
            // step이 양쪽 분기 상태를 이미 쌓음
            Opcode::JumpIfTrue(_) | Opcode::JumpIfFalse(_) | Opcode::ForIter(_) => {}
            Opcode::Return | Opcode::Raise => {}
            // SetupFinally의 핸들러 상태는 step이 합성; 여기서는 fall-through만
            _ => {
                if block.end < func.instructions.len() as u32 {
                    propagations.push((block.end, state.clone()));
                }
            }
        }

        for (target, incoming) in propagations {
            let target_block = cfg.block_at[&target];
            match &entry_states[target_block] {
                None => {
                    entry_states[target_block] = Some(incoming);
                    worklist.push(target_block);
                }
                Some(existing) => {
                    let (merged, changed) = unify(existing, &incoming, target)?;
                    if changed {
                        entry_states[target_block] = Some(merged);
                        worklist.push(target_block);
                    }
                }
            }
        }
    }

    // 최종 패스: 블록 진입 상태에서 각 명령 직전 상태를 전개
    let mut result: Analysis = vec![None; func.instructions.len()];
    for (bid, block) in cfg.blocks.iter().enumerate() {
        let Some(entry) = &entry_states[bid] else {
            continue;
        };
        let mut state = entry.clone();
        let mut sink = vec![];
        for offset in block.start..block.end {
            result[offset as usize] = Some(state.clone());
            let instr = &func.instructions[offset as usize];
            step(func, &instr.op, offset, &mut state, &mut sink)?;
        }
    }
    Ok(result)
}

/// 한 명령의 전이 함수
///
/// 분기 의존 후속 상태(조건 분기, ForIter, SetupFinally의 핸들러 상태)는
/// propagations에 (대상 오프셋, 상태)로 쌓습니다.
fn step(
    func: &CompiledFunction,
    op: &Opcode,
    offset: u32,
    state: &mut StackMetadata,
    propagations: &mut Vec<(u32, StackMetadata)>,
) -> TranslateResult<()> {
    let reg = registry();
    let obj = || ValueSourceInfo::new(reg.object_type.clone(), Some(offset));

    match op {
        Opcode::LoadConst(idx) => {
            let c = func.consts.get(*idx as usize).ok_or_else(|| {
                TranslateError::at(
                    TranslateErrorKind::InvalidConstant,
                    offset,
                    format!("constant index {} out of range", idx),
                )
            })?;
            state.push(ValueSourceInfo::new(constant_type(c), Some(offset)));
        }
        Opcode::LoadLocal(i) => {
            let info = state.locals.get(*i as usize).cloned().ok_or_else(|| {
                TranslateError::at(
                    TranslateErrorKind::StackUnderflow,
                    offset,
                    format!("local index {} out of range", i),
                )
            })?;
            state.push(ValueSourceInfo::new(info.value_type, Some(offset)));
        }
        Opcode::StoreLocal(i) => {
            let v = state.pop(offset)?;
            if let Some(slot) = state.locals.get_mut(*i as usize) {
                *slot = v;
            }
        }
        Opcode::LoadGlobal(_) => state.push(obj()),
        Opcode::Pop => {
            state.pop(offset)?;
        }
        Opcode::Dup => {
            let top = state
                .stack
                .last()
                .cloned()
                .ok_or_else(|| {
                    TranslateError::at(
                        TranslateErrorKind::StackUnderflow,
                        offset,
                        "dup on empty abstract stack",
                    )
                })?;
            state.push(top);
        }
        Opcode::Swap => {
            let a = state.pop(offset)?;
            let b = state.pop(offset)?;
            state.push(a);
            state.push(b);
        }
        Opcode::Neg => {
            let v = state.pop(offset)?;
            let ty = if is_int_like(&v.value_type) {
                reg.int_type.clone()
            } else if is_numeric(&v.value_type) {
                reg.float_type.clone()
            } else {
                reg.object_type.clone()
            };
            state.push(ValueSourceInfo::new(ty, Some(offset)));
        }
        Opcode::Not => {
            state.pop(offset)?;
            state.push(ValueSourceInfo::new(reg.bool_type.clone(), Some(offset)));
        }
        Opcode::Add
        | Opcode::Sub
        | Opcode::Mul
        | Opcode::FloorDiv
        | Opcode::TrueDiv
        | Opcode::Mod => {
            let rhs = state.pop(offset)?;
            let lhs = state.pop(offset)?;
            let ty = binary_result(op, &lhs.value_type, &rhs.value_type);
            state.push(ValueSourceInfo::new(ty, Some(offset)));
        }
        Opcode::LoadIndex => {
            state.pop_n(2, offset)?;
            state.push(obj());
        }
        Opcode::StoreIndex => {
            state.pop_n(3, offset)?;
        }
        Opcode::Compare(_) => {
            state.pop_n(2, offset)?;
            state.push(ValueSourceInfo::new(reg.bool_type.clone(), Some(offset)));
        }
        Opcode::Jump(_) => {}
        Opcode::JumpIfTrue(t) | Opcode::JumpIfFalse(t) => {
            state.pop(offset)?;
            propagations.push((*t, state.clone()));
            propagations.push((offset + 1, state.clone()));
        }
        Opcode::GetIter => {
            state.pop(offset)?;
            state.push(ValueSourceInfo::new(reg.iterator_type.clone(), Some(offset)));
        }
        Opcode::ForIter(t) => {
            // 소진 분기: iterator가 pop된 상태
            let mut exhausted = state.clone();
            exhausted.pop(offset)?;
            propagations.push((*t, exhausted));
            // 생산 분기: 원소가 추가로 올라감
            let mut produced = state.clone();
            produced.push(obj());
            propagations.push((offset + 1, produced));
        }
        Opcode::CallFunction(argc) => {
            state.pop_n(*argc as usize + 1, offset)?;
            state.push(obj());
        }
        Opcode::Return | Opcode::Raise => {
            state.pop(offset)?;
        }
        Opcode::LoadAttr(_) => {
            state.pop(offset)?;
            state.push(obj());
        }
        Opcode::StoreAttr(_) => {
            state.pop_n(2, offset)?;
        }
        Opcode::BuildList(n) => {
            state.pop_n(*n as usize, offset)?;
            state.push(ValueSourceInfo::new(reg.list_type.clone(), Some(offset)));
        }
        Opcode::BuildSet(n) => {
            state.pop_n(*n as usize, offset)?;
            state.push(ValueSourceInfo::new(reg.set_type.clone(), Some(offset)));
        }
        Opcode::BuildMap(n) => {
            state.pop_n(*n as usize * 2, offset)?;
            state.push(ValueSourceInfo::new(reg.dict_type.clone(), Some(offset)));
        }
        Opcode::SetupFinally(h) => {
            // 핸들러 진입 상태 = 현재 상태 + 합성 여섯 칸
            let mut handler_state = state.clone();
            handler_state.stack.extend(handler_state_slots());
            propagations.push((*h, handler_state));
        }
        Opcode::PopBlock => {}
        Opcode::BeginFinally => {
            state.stack.extend(handler_state_slots());
        }
        Opcode::EndFinally | Opcode::PopExcInfo => {
            state.pop_n(HANDLER_STATE_SLOTS, offset)?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::NativeType;
    use crate::runtime::dunder::CompareOp;
    use crate::translate::cfg;
    use crate::translate::instruction::BytecodeBuilder;

    fn analyze_fn(f: &CompiledFunction) -> Analysis {
        let g = cfg::build(f).unwrap();
        analyze(f, &g).unwrap()
    }

    #[test]
    fn test_int_params_prove_int_operands() {
        let f = BytecodeBuilder::new("add")
            .param("a", NativeType::I64)
            .param("b", NativeType::I64)
            .load("a")
            .load("b")
            .add()
            .ret()
            .build();
        let analysis = analyze_fn(&f);
        // Add 직전: 두 칸 모두 int
        let before_add = analysis[2].as_ref().unwrap();
        assert_eq!(before_add.depth(), 2);
        assert!(is_int_like(before_add.type_below_top(0).unwrap()));
        assert!(is_int_like(before_add.type_below_top(1).unwrap()));
        // Return 직전: 결과도 int
        let before_ret = analysis[3].as_ref().unwrap();
        assert!(is_int_like(before_ret.type_below_top(0).unwrap()));
    }

    #[test]
    fn test_merge_int_and_bool_is_int() {
        let reg = registry();
        let merged = merge_types(&reg.bool_type, &reg.int_type);
        assert!(std::sync::Arc::ptr_eq(&merged, &reg.int_type));
        // 교환적
        let merged2 = merge_types(&reg.int_type, &reg.bool_type);
        assert!(std::sync::Arc::ptr_eq(&merged2, &reg.int_type));
    }

    #[test]
    fn test_branch_merge_widens_type() {
        // c ? 1 : "s" → 합류 지점 타입은 object
        let f = BytecodeBuilder::new("f")
            .param("c", NativeType::Bool)
            .load("c")
            .if_else(|b| b.const_int(1), |b| b.const_str("s"))
            .ret()
            .build();
        let analysis = analyze_fn(&f);
        let ret_offset = f.instructions.len() - 1;
        let before_ret = analysis[ret_offset].as_ref().unwrap();
        let reg = registry();
        assert!(std::sync::Arc::ptr_eq(
            before_ret.type_below_top(0).unwrap(),
            &reg.object_type
        ));
    }

    #[test]
    fn test_depth_mismatch_rejected() {
        // 한쪽 분기만 값을 남기고 합류 → 깊이 불일치
        let mut b = BytecodeBuilder::new("bad").param("c", NativeType::Bool);
        let merge = b.new_label();
        let f = b
            .load("c")
            .jump_if_false(merge)
            .const_int(1)
            .bind(merge)
            .const_none()
            .ret()
            .build();
        let g = cfg::build(&f).unwrap();
        let e = analyze(&f, &g).unwrap_err();
        assert_eq!(e.kind, TranslateErrorKind::DepthMismatch);
    }

    #[test]
    fn test_handler_state_is_six_slots_type_on_top() {
        let f = BytecodeBuilder::new("f")
            .try_finally(|b| b.const_int(1).pop(), |b| b)
            .const_none()
            .ret()
            .build();
        let analysis = analyze_fn(&f);
        let handler = f.regions[0].handler as usize;
        let at_handler = analysis[handler].as_ref().unwrap();
        assert_eq!(at_handler.depth(), HANDLER_STATE_SLOTS);

        let reg = registry();
        // TOS부터: 타입 객체, 예외, traceback, None, int, None
        assert!(std::sync::Arc::ptr_eq(
            at_handler.type_below_top(0).unwrap(),
            &reg.type_type
        ));
        assert!(std::sync::Arc::ptr_eq(
            at_handler.type_below_top(1).unwrap(),
            &reg.base_exception_type
        ));
        assert!(std::sync::Arc::ptr_eq(
            at_handler.type_below_top(2).unwrap(),
            &reg.traceback_type
        ));
        assert!(std::sync::Arc::ptr_eq(
            at_handler.type_below_top(3).unwrap(),
            &reg.none_type
        ));
        assert!(std::sync::Arc::ptr_eq(
            at_handler.type_below_top(4).unwrap(),
            &reg.int_type
        ));
        assert!(std::sync::Arc::ptr_eq(
            at_handler.type_below_top(5).unwrap(),
            &reg.none_type
        ));
        // 합성 값이므로 출처 없음
        assert!(at_handler.stack.iter().all(|s| s.source.is_none()));
    }

    #[test]
    fn test_loop_fixpoint_terminates_and_types_stay_int() {
        let mut b = BytecodeBuilder::new("f").param("n", NativeType::I64);
        let top = b.new_label();
        let done = b.new_label();
        let f = b
            .const_int(0)
            .store("i")
            .bind(top)
            .load("i")
            .load("n")
            .compare(CompareOp::Lt)
            .jump_if_false(done)
            .load("i")
            .const_int(1)
            .add()
            .store("i")
            .jump(top)
            .bind(done)
            .load("i")
            .ret()
            .build();
        let analysis = analyze_fn(&f);
        let ret_offset = f.instructions.len() - 1;
        let before_ret = analysis[ret_offset].as_ref().unwrap();
        assert!(is_int_like(before_ret.type_below_top(0).unwrap()));
    }

    #[test]
    fn test_underflow_rejected() {
        use crate::translate::instruction::{Constant, FunctionSignature, Instruction};
        let f = CompiledFunction {
            name: "bad".into(),
            signature: FunctionSignature::dynamic(&[]),
            instructions: vec![
                Instruction { op: Opcode::Pop, offset: 0, is_jump_target: false },
                Instruction { op: Opcode::Return, offset: 1, is_jump_target: false },
            ],
            regions: vec![],
            consts: vec![Constant::None],
            names: vec![],
            num_locals: 0,
        };
        let g = cfg::build(&f).unwrap();
        let e = analyze(&f, &g).unwrap_err();
        assert_eq!(e.kind, TranslateErrorKind::StackUnderflow);
        assert_eq!(e.offset, Some(0));
    }

    #[test]
    fn test_unreachable_code_has_no_state() {
        let mut b = BytecodeBuilder::new("f");
        let end = b.new_label();
        let f = b
            .const_int(1)
            .jump(end)
            .const_int(2)
            .pop()
            .bind(end)
            .ret()
            .build();
        let analysis = analyze_fn(&f);
        assert!(analysis[2].is_none());
        assert!(analysis[3].is_none());
        assert!(analysis[4].is_some());
    }
}
