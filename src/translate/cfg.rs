//! 제어 흐름 그래프
//!
//! 블록은 정수 인덱스 arena로 관리합니다. 점프 대상, 조건 분기,
//! 예외 영역 핸들러를 모두 leader로 보고 선형 명령열을 분할합니다.

use std::collections::HashMap;

use crate::translate::instruction::{CompiledFunction, Opcode};
use crate::translate::{TranslateError, TranslateErrorKind, TranslateResult, err};

pub type BlockId = usize;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EdgeKind {
    FallThrough,
    Branch,
    /// 보호 구간에서 핸들러로의 예외 전파 간선
    ExceptionEntry,
}

#[derive(Debug)]
pub struct BasicBlock {
    /// 첫 명령 오프셋
    pub start: u32,
    /// 마지막 명령 다음 오프셋 (exclusive)
    pub end: u32,
    pub successors: Vec<(BlockId, EdgeKind)>,
    pub reachable: bool,
}

#[derive(Debug)]
pub struct ControlFlowGraph {
    pub blocks: Vec<BasicBlock>,
    /// 시작 오프셋 → 블록
    pub block_at: HashMap<u32, BlockId>,
}

impl ControlFlowGraph {
    pub fn block_containing(&self, offset: u32) -> Option<BlockId> {
        self.blocks
            .iter()
            .position(|b| offset >= b.start && offset < b.end)
    }

    /// 이 오프셋이 블록 시작인가
    pub fn is_block_start(&self, offset: u32) -> bool {
        self.block_at.contains_key(&offset)
    }
}

/// CFG 구축 + 영역 테이블 검증
pub fn build(func: &CompiledFunction) -> TranslateResult<ControlFlowGraph> {
    let len = func.instructions.len() as u32;
    if len == 0 {
        return Err(err(
            TranslateErrorKind::InvalidJumpTarget,
            "function has no instructions",
        ));
    }

    validate_regions(func, len)?;

    // 마지막 명령에서 떨어지는 경로가 있으면 안 됨
    let last = &func.instructions[len as usize - 1];
    if !last.op.is_terminator() {
        return Err(TranslateError::at(
            TranslateErrorKind::InvalidJumpTarget,
            last.offset,
            "function falls off the end",
        ));
    }

    // ========== leader 수집 ==========
    let mut is_leader = vec![false; len as usize];
    is_leader[0] = true;
    for instr in &func.instructions {
        if let Some(t) = instr.op.jump_target() {
            if t >= len {
                return Err(TranslateError::at(
                    TranslateErrorKind::InvalidJumpTarget,
                    instr.offset,
                    format!("jump target {} out of range", t),
                ));
            }
            is_leader[t as usize] = true;
        }
        // 분기/종결 명령 다음은 항상 새 블록
        let splits = instr.op.is_terminator()
            || matches!(
                instr.op,
                Opcode::JumpIfTrue(_) | Opcode::JumpIfFalse(_) | Opcode::ForIter(_)
            );
        if splits && instr.offset + 1 < len {
            is_leader[(instr.offset + 1) as usize] = true;
        }
    }
    for region in &func.regions {
        is_leader[region.handler as usize] = true;
        if region.start < len {
            is_leader[region.start as usize] = true;
        }
        if region.end < len {
            is_leader[region.end as usize] = true;
        }
    }

    // ========== 블록 arena ==========
    let mut blocks: Vec<BasicBlock> = vec![];
    let mut block_at: HashMap<u32, BlockId> = HashMap::new();
    let mut start = 0u32;
    for offset in 1..=len {
        if offset == len || is_leader[offset as usize] {
            block_at.insert(start, blocks.len());
            blocks.push(BasicBlock {
                start,
                end: offset,
                successors: vec![],
                reachable: false,
            });
            start = offset;
        }
    }

    // ========== 간선 ==========
    for id in 0..blocks.len() {
        let last_offset = blocks[id].end - 1;
        let last_op = &func.instructions[last_offset as usize].op;
        let mut succs: Vec<(BlockId, EdgeKind)> = vec![];
        let next = blocks[id].end;

        match last_op {
            Opcode::Jump(t) => succs.push((block_at[t], EdgeKind::Branch)),
            Opcode::JumpIfTrue(t) | Opcode::JumpIfFalse(t) => {
                succs.push((block_at[t], EdgeKind::Branch));
                if next < len {
                    succs.push((block_at[&next], EdgeKind::FallThrough));
                }
            }
            Opcode::ForIter(t) => {
                // fall-through = 원소 생산, branch = 소진
                if next < len {
                    succs.push((block_at[&next], EdgeKind::FallThrough));
                }
                succs.push((block_at[t], EdgeKind::Branch));
            }
            Opcode::Return | Opcode::Raise => {}
            Opcode::EndFinally => {
                // 보류 분기가 없으면 다음 명령으로 계속
                if next < len {
                    succs.push((block_at[&next], EdgeKind::FallThrough));
                }
            }
            _ => {
                if next < len {
                    succs.push((block_at[&next], EdgeKind::FallThrough));
                }
            }
        }

        // 보호 구간 안의 블록은 핸들러로의 예외 간선을 가짐
        for region in &func.regions {
            let bstart = blocks[id].start;
            if region.contains(bstart) {
                let handler_block = block_at[&region.handler];
                if !succs.contains(&(handler_block, EdgeKind::ExceptionEntry)) {
                    succs.push((handler_block, EdgeKind::ExceptionEntry));
                }
            }
        }

        blocks[id].successors = succs;
    }

    // ========== 도달성 ==========
    let mut worklist = vec![0usize];
    while let Some(id) = worklist.pop() {
        if blocks[id].reachable {
            continue;
        }
        blocks[id].reachable = true;
        let succs: Vec<BlockId> = blocks[id].successors.iter().map(|(s, _)| *s).collect();
        for s in succs {
            if !blocks[s].reachable {
                worklist.push(s);
            }
        }
    }

    Ok(ControlFlowGraph { blocks, block_at })
}

/// 영역 테이블 검증: 범위, 핸들러 위치, 중첩 규칙
fn validate_regions(func: &CompiledFunction, len: u32) -> TranslateResult<()> {
    for region in &func.regions {
        if region.start > region.end || region.end > len || region.handler >= len {
            return Err(TranslateError::at(
                TranslateErrorKind::InconsistentRegions,
                region.start,
                format!(
                    "region [{}, {}) handler {} out of range",
                    region.start, region.end, region.handler
                ),
            ));
        }
        // 핸들러가 자기 보호 구간 안에 있으면 예외가 무한히 재진입
        if region.contains(region.handler) {
            return Err(TranslateError::at(
                TranslateErrorKind::UnreachableHandler,
                region.handler,
                "handler lies inside its own protected range",
            ));
        }
    }
    // 영역은 중첩 아니면 서로소여야 함 (부분 겹침 금지, 동일 구간 금지)
    for (i, a) in func.regions.iter().enumerate() {
        for b in func.regions.iter().skip(i + 1) {
            let disjoint = a.end <= b.start || b.end <= a.start;
            let nested = (a.start <= b.start && b.end <= a.end)
                || (b.start <= a.start && a.end <= b.end);
            let identical = a.start == b.start && a.end == b.end;
            if identical || (!disjoint && !nested) {
                return Err(TranslateError::at(
                    TranslateErrorKind::InconsistentRegions,
                    b.start,
                    format!(
                        "regions [{}, {}) and [{}, {}) overlap improperly",
                        a.start, a.end, b.start, b.end
                    ),
                ));
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::NativeType;
    use crate::runtime::dunder::CompareOp;
    use crate::translate::instruction::BytecodeBuilder;

    #[test]
    fn test_straight_line_is_one_block() {
        let f = BytecodeBuilder::new("f")
            .const_int(1)
            .const_int(2)
            .add()
            .ret()
            .build();
        let cfg = build(&f).unwrap();
        assert_eq!(cfg.blocks.len(), 1);
        assert!(cfg.blocks[0].reachable);
    }

    #[test]
    fn test_conditional_splits_blocks() {
        let f = BytecodeBuilder::new("f")
            .param("c", NativeType::Dynamic)
            .load("c")
            .if_else(|b| b.const_int(10), |b| b.const_int(-10))
            .ret()
            .build();
        let cfg = build(&f).unwrap();
        // entry, then, else, join
        assert_eq!(cfg.blocks.len(), 4);
        assert!(cfg.blocks.iter().all(|b| b.reachable));

        let entry = &cfg.blocks[0];
        assert_eq!(entry.successors.len(), 2);
        assert!(entry.successors.iter().any(|(_, k)| *k == EdgeKind::Branch));
        assert!(entry.successors.iter().any(|(_, k)| *k == EdgeKind::FallThrough));
    }

    #[test]
    fn test_unreachable_block_detected() {
        let mut b = BytecodeBuilder::new("f");
        let end = b.new_label();
        let f = b
            .const_int(1)
            .jump(end)
            // 도달 불가능한 코드
            .const_int(2)
            .pop()
            .bind(end)
            .ret()
            .build();
        let cfg = build(&f).unwrap();
        let unreachable: Vec<_> = cfg.blocks.iter().filter(|b| !b.reachable).collect();
        assert_eq!(unreachable.len(), 1);
        assert_eq!(unreachable[0].start, 2);
    }

    #[test]
    fn test_exception_entry_edges() {
        let f = BytecodeBuilder::new("f")
            .try_finally(|b| b.const_int(1).pop(), |b| b)
            .const_none()
            .ret()
            .build();
        let cfg = build(&f).unwrap();
        let region = &f.regions[0];
        let handler_block = cfg.block_at[&region.handler];
        let protected = cfg.block_at[&region.start];
        assert!(
            cfg.blocks[protected]
                .successors
                .contains(&(handler_block, EdgeKind::ExceptionEntry))
        );
        assert!(cfg.blocks[handler_block].reachable);
    }

    #[test]
    fn test_jump_out_of_range_rejected() {
        use crate::translate::instruction::{Constant, FunctionSignature, Instruction};
        let f = CompiledFunction {
            name: "bad".into(),
            signature: FunctionSignature::dynamic(&[]),
            instructions: vec![Instruction {
                op: Opcode::Jump(99),
                offset: 0,
                is_jump_target: false,
            }],
            regions: vec![],
            consts: vec![Constant::None],
            names: vec![],
            num_locals: 0,
        };
        let e = build(&f).unwrap_err();
        assert_eq!(e.kind, TranslateErrorKind::InvalidJumpTarget);
    }

    #[test]
    fn test_falls_off_end_rejected() {
        use crate::translate::instruction::{Constant, FunctionSignature, Instruction};
        let f = CompiledFunction {
            name: "bad".into(),
            signature: FunctionSignature::dynamic(&[]),
            instructions: vec![Instruction {
                op: Opcode::LoadConst(0),
                offset: 0,
                is_jump_target: false,
            }],
            regions: vec![],
            consts: vec![Constant::None],
            names: vec![],
            num_locals: 0,
        };
        assert!(build(&f).is_err());
    }

    #[test]
    fn test_partially_overlapping_regions_rejected() {
        use crate::translate::instruction::{ExceptionRegion, RegionKind};
        let mut f = BytecodeBuilder::new("f")
            .const_int(1)
            .pop()
            .const_int(2)
            .pop()
            .const_none()
            .ret()
            .build();
        f.regions = vec![
            ExceptionRegion { start: 0, end: 3, handler: 4, kind: RegionKind::Finally },
            ExceptionRegion { start: 2, end: 5, handler: 5, kind: RegionKind::Finally },
        ];
        let e = build(&f).unwrap_err();
        assert_eq!(e.kind, TranslateErrorKind::InconsistentRegions);
    }

    #[test]
    fn test_loop_back_edge() {
        // i = 0; while i < 3: i = i + 1
        let mut b = BytecodeBuilder::new("f");
        let top = b.new_label();
        let done = b.new_label();
        let f = b
            .const_int(0)
            .store("i")
            .bind(top)
            .load("i")
            .const_int(3)
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
        let cfg = build(&f).unwrap();
        assert!(cfg.blocks.iter().all(|b| b.reachable));
        // 루프 본문에서 헤더로 돌아가는 branch 간선 존재
        let header = cfg.block_at[&2];
        assert!(
            cfg.blocks
                .iter()
                .any(|b| b.successors.contains(&(header, EdgeKind::Branch)))
        );
    }
}
