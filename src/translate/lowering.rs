//! 바이트코드 → Cranelift IR 방출
//!
//! 모든 값은 런타임 Frame 스택으로 오가고, IR은 helper 호출과 상태 코드
//! 분기만 담습니다. 추상 해석 결과가 int를 증명한 연산은 특수화 helper로,
//! 나머지는 일반 dunder 디스패치 helper로 내립니다.
//!
//! 예외 영역: helper가 음수를 반환하면 가장 안쪽 영역의 pre-handler 블록
//! (핸들러 상태 여섯 칸을 전개)으로 분기하고, 영역이 없으면 상태 코드를
//! 그대로 반환합니다. 영역을 일찍 떠나는 return/점프는 토큰을 보류해 두고
//! finalizer를 거친 뒤 EndFinally의 토큰 분기에서 재개됩니다.

use cranelift::prelude::*;
use cranelift_jit::JITModule;
use cranelift_module::{Linkage, Module as ClifModule};
use std::collections::HashMap;

use crate::runtime::dunder::{BinaryOp, UnaryOp};
use crate::runtime::types::registry;
use crate::translate::cfg::ControlFlowGraph;
use crate::translate::instruction::{CompiledFunction, Opcode};
use crate::translate::regions::RegionMap;
use crate::translate::stack_metadata::{Analysis, HANDLER_STATE_SLOTS};
use crate::translate::{TranslateError, TranslateErrorKind, TranslateResult, err};

struct EmitCtx {
    frame_ptr: Value,
    /// 바이트코드 오프셋 → Cranelift 블록 (도달 가능한 블록만)
    blocks: HashMap<u32, Block>,
    /// 영역별 pre-handler 블록 (예외 상태 전개 후 핸들러로 점프)
    pre_handlers: Vec<Block>,
    /// 나중에 채울 조기 탈출 경유 블록: (블록, 출발 오프셋, 대상)
    pending_gotos: Vec<(Block, u32, u32)>,
}

/// 함수 하나를 IR로 방출
pub fn emit_function(
    builder: &mut FunctionBuilder,
    func: &CompiledFunction,
    cfg: &ControlFlowGraph,
    analysis: &Analysis,
    regions: &mut RegionMap,
    module: &mut JITModule,
) -> TranslateResult<()> {
    let entry_block = builder.create_block();
    builder.switch_to_block(entry_block);
    builder.append_block_params_for_function_params(entry_block);
    let frame_ptr = builder.block_params(entry_block)[0];

    let mut ctx = EmitCtx {
        frame_ptr,
        blocks: HashMap::new(),
        pre_handlers: vec![],
        pending_gotos: vec![],
    };
    for b in &cfg.blocks {
        if b.reachable {
            ctx.blocks.insert(b.start, builder.create_block());
        }
    }
    for _ in &regions.entries {
        ctx.pre_handlers.push(builder.create_block());
    }

    preregister_exit_tokens(func, analysis, regions);

    let block0 = ctx.blocks[&0];
    builder.ins().jump(block0, &[]);

    // 엔트리에서 이미 점프했으므로 첫 블록 전환에 fallthrough 점프 금지
    let mut last_was_terminator = true;

    for instr in &func.instructions {
        let offset = instr.offset;

        if let Some(&blk) = ctx.blocks.get(&offset) {
            if !last_was_terminator {
                builder.ins().jump(blk, &[]);
            }
            builder.switch_to_block(blk);
            last_was_terminator = false;
        }

        // 도달 불가능한 코드는 방출하지 않음
        if analysis[offset as usize].is_none() {
            continue;
        }
        if last_was_terminator {
            continue;
        }

        last_was_terminator =
            emit_instruction(builder, &mut ctx, func, analysis, regions, offset, module)?;
    }

    // 마지막 명령이 블록을 열어 둔 채 끝났으면 성공 반환으로 닫음
    if !last_was_terminator {
        let zero = builder.ins().iconst(types::I64, 0);
        builder.ins().return_(&[zero]);
    }

    fill_pending_gotos(builder, &mut ctx, regions, module)?;
    fill_pre_handlers(builder, &ctx, analysis, regions, module)?;

    builder.seal_all_blocks();
    // finalize()는 builder를 소비하므로 호출하지 않고 drop에 맡김
    Ok(())
}

/// 영역을 떠나는 모든 점프의 토큰을 방출 전에 확정
///
/// EndFinally의 토큰 분기는 핸들러 본문(점프들보다 뒤)에서 방출되지만,
/// 경유 블록은 방출이 끝난 뒤에 채워지므로 토큰을 먼저 모읍니다.
fn preregister_exit_tokens(func: &CompiledFunction, analysis: &Analysis, regions: &mut RegionMap) {
    for instr in &func.instructions {
        if analysis[instr.offset as usize].is_none() {
            continue;
        }
        let target = match instr.op {
            Opcode::Jump(t) | Opcode::JumpIfTrue(t) | Opcode::JumpIfFalse(t)
            | Opcode::ForIter(t) => t,
            _ => continue,
        };
        let mut cur = regions.innermost_finally_at(instr.offset);
        while let Some(r) = cur {
            if regions.entries[r].region.contains(target) {
                break;
            }
            regions.token_for_jump(r, target);
            cur = regions.next_finally_outward(r, Some(target));
        }
    }
}

/// 한 명령 방출. 블록을 종결했으면 true.
fn emit_instruction(
    builder: &mut FunctionBuilder,
    ctx: &mut EmitCtx,
    func: &CompiledFunction,
    analysis: &Analysis,
    regions: &mut RegionMap,
    offset: u32,
    module: &mut JITModule,
) -> TranslateResult<bool> {
    let op = &func.instructions[offset as usize].op;
    let frame = ctx.frame_ptr;

    match op {
        // ===== 스택/상수/로컬 =====
        Opcode::LoadConst(i) => {
            let arg = builder.ins().iconst(types::I64, *i as i64);
            let status = call_helper(builder, "pyseok_load_const", &[frame, arg], module)?;
            check_status(builder, ctx, regions, offset, status);
        }
        Opcode::LoadLocal(i) => {
            let arg = builder.ins().iconst(types::I64, *i as i64);
            let status = call_helper(builder, "pyseok_load_local", &[frame, arg], module)?;
            check_status(builder, ctx, regions, offset, status);
        }
        Opcode::StoreLocal(i) => {
            let arg = builder.ins().iconst(types::I64, *i as i64);
            let status = call_helper(builder, "pyseok_store_local", &[frame, arg], module)?;
            check_status(builder, ctx, regions, offset, status);
        }
        Opcode::LoadGlobal(i) => {
            let arg = builder.ins().iconst(types::I64, *i as i64);
            let status = call_helper(builder, "pyseok_load_global", &[frame, arg], module)?;
            check_status(builder, ctx, regions, offset, status);
        }
        Opcode::Pop => {
            let status = call_helper(builder, "pyseok_pop", &[frame], module)?;
            check_status(builder, ctx, regions, offset, status);
        }
        Opcode::Dup => {
            let status = call_helper(builder, "pyseok_dup", &[frame], module)?;
            check_status(builder, ctx, regions, offset, status);
        }
        Opcode::Swap => {
            let status = call_helper(builder, "pyseok_swap", &[frame], module)?;
            check_status(builder, ctx, regions, offset, status);
        }

        // ===== 연산자 =====
        Opcode::Neg => {
            if operands_are_int(analysis, offset, 1) {
                let status = call_helper(builder, "pyseok_int_neg", &[frame], module)?;
                check_status(builder, ctx, regions, offset, status);
            } else {
                let code = builder
                    .ins()
                    .iconst(types::I64, UnaryOp::Negative.code());
                let status = call_helper(builder, "pyseok_unary_op", &[frame, code], module)?;
                check_status(builder, ctx, regions, offset, status);
            }
        }
        Opcode::Not => {
            let status = call_helper(builder, "pyseok_not_op", &[frame], module)?;
            check_status(builder, ctx, regions, offset, status);
        }
        Opcode::Add | Opcode::Sub | Opcode::Mul | Opcode::FloorDiv | Opcode::TrueDiv
        | Opcode::Mod => {
            let (fast_name, generic_op) = match op {
                Opcode::Add => ("pyseok_int_add", BinaryOp::Add),
                Opcode::Sub => ("pyseok_int_sub", BinaryOp::Sub),
                Opcode::Mul => ("pyseok_int_mul", BinaryOp::Mul),
                Opcode::FloorDiv => ("pyseok_int_floordiv", BinaryOp::FloorDiv),
                Opcode::TrueDiv => ("pyseok_int_truediv", BinaryOp::TrueDiv),
                Opcode::Mod => ("pyseok_int_mod", BinaryOp::Mod),
                _ => unreachable!(),
            };
            if operands_are_int(analysis, offset, 2) {
                let status = call_helper(builder, fast_name, &[frame], module)?;
                check_status(builder, ctx, regions, offset, status);
            } else {
                let code = builder.ins().iconst(types::I64, generic_op.code());
                let status = call_helper(builder, "pyseok_binary_op", &[frame, code], module)?;
                check_status(builder, ctx, regions, offset, status);
            }
        }
        Opcode::Compare(cmp) => {
            let code = builder.ins().iconst(types::I64, cmp.code());
            let name = if operands_are_int(analysis, offset, 2) {
                "pyseok_int_compare"
            } else {
                "pyseok_compare_op"
            };
            let status = call_helper(builder, name, &[frame, code], module)?;
            check_status(builder, ctx, regions, offset, status);
        }
        Opcode::LoadIndex => {
            let status = call_helper(builder, "pyseok_load_index", &[frame], module)?;
            check_status(builder, ctx, regions, offset, status);
        }
        Opcode::StoreIndex => {
            let status = call_helper(builder, "pyseok_store_index", &[frame], module)?;
            check_status(builder, ctx, regions, offset, status);
        }

        // ===== 제어 흐름 =====
        Opcode::Jump(t) => {
            emit_goto(builder, ctx, regions, offset, *t, module)?;
            return Ok(true);
        }
        Opcode::JumpIfTrue(t) | Opcode::JumpIfFalse(t) => {
            let status = call_helper(builder, "pyseok_pop_bool", &[frame], module)?;
            check_status(builder, ctx, regions, offset, status);

            let taken = goto_block(builder, ctx, regions, offset, *t)?;
            let next_offset = offset + 1;
            let (next_block, switched) = match ctx.blocks.get(&next_offset) {
                Some(&b) => (b, false),
                None => (builder.create_block(), true),
            };

            let is_true = builder.ins().icmp_imm(IntCC::Equal, status, 1);
            match op {
                Opcode::JumpIfTrue(_) => {
                    builder.ins().brif(is_true, taken, &[], next_block, &[]);
                }
                _ => {
                    builder.ins().brif(is_true, next_block, &[], taken, &[]);
                }
            }
            if switched {
                builder.switch_to_block(next_block);
                return Ok(false);
            }
            return Ok(true);
        }
        Opcode::GetIter => {
            let status = call_helper(builder, "pyseok_get_iter", &[frame], module)?;
            check_status(builder, ctx, regions, offset, status);
        }
        Opcode::ForIter(t) => {
            let status = call_helper(builder, "pyseok_for_iter", &[frame], module)?;
            check_status(builder, ctx, regions, offset, status);

            let exhausted = goto_block(builder, ctx, regions, offset, *t)?;
            let next_offset = offset + 1;
            let (next_block, switched) = match ctx.blocks.get(&next_offset) {
                Some(&b) => (b, false),
                None => (builder.create_block(), true),
            };

            // 1 = 원소 생산 (fall-through), 0 = 소진 (분기)
            let produced = builder.ins().icmp_imm(IntCC::Equal, status, 1);
            builder.ins().brif(produced, next_block, &[], exhausted, &[]);
            if switched {
                builder.switch_to_block(next_block);
                return Ok(false);
            }
            return Ok(true);
        }
        Opcode::CallFunction(argc) => {
            let arg = builder.ins().iconst(types::I64, *argc as i64);
            let status = call_helper(builder, "pyseok_call_function", &[frame, arg], module)?;
            check_status(builder, ctx, regions, offset, status);
        }
        Opcode::Return => {
            if let Some(r) = regions.innermost_finally_at(offset) {
                // finalizer를 거쳐야 하는 return: 값을 보류하고 핸들러로
                let status = call_helper(builder, "pyseok_stash_return", &[frame], module)?;
                check_status(builder, ctx, regions, offset, status);
                let status =
                    call_helper(builder, "pyseok_push_finally_sentinels", &[frame], module)?;
                check_status(builder, ctx, regions, offset, status);
                let handler = regions.entries[r].region.handler;
                let handler_block = handler_target(ctx, handler)?;
                builder.ins().jump(handler_block, &[]);
            } else {
                let zero = builder.ins().iconst(types::I64, 0);
                builder.ins().return_(&[zero]);
            }
            return Ok(true);
        }
        Opcode::Raise => {
            let status = call_helper(builder, "pyseok_raise", &[frame], module)?;
            // raise는 항상 실패 상태를 반환
            match regions.innermost_at(offset) {
                Some(r) => {
                    let pre = ctx.pre_handlers[r];
                    builder.ins().jump(pre, &[]);
                }
                None => {
                    builder.ins().return_(&[status]);
                }
            }
            return Ok(true);
        }

        // ===== 속성/컬렉션 =====
        Opcode::LoadAttr(i) => {
            let arg = builder.ins().iconst(types::I64, *i as i64);
            let status = call_helper(builder, "pyseok_load_attr", &[frame, arg], module)?;
            check_status(builder, ctx, regions, offset, status);
        }
        Opcode::StoreAttr(i) => {
            let arg = builder.ins().iconst(types::I64, *i as i64);
            let status = call_helper(builder, "pyseok_store_attr", &[frame, arg], module)?;
            check_status(builder, ctx, regions, offset, status);
        }
        Opcode::BuildList(n) => {
            let arg = builder.ins().iconst(types::I64, *n as i64);
            let status = call_helper(builder, "pyseok_build_list", &[frame, arg], module)?;
            check_status(builder, ctx, regions, offset, status);
        }
        Opcode::BuildSet(n) => {
            let arg = builder.ins().iconst(types::I64, *n as i64);
            let status = call_helper(builder, "pyseok_build_set", &[frame, arg], module)?;
            check_status(builder, ctx, regions, offset, status);
        }
        Opcode::BuildMap(n) => {
            let arg = builder.ins().iconst(types::I64, *n as i64);
            let status = call_helper(builder, "pyseok_build_map", &[frame, arg], module)?;
            check_status(builder, ctx, regions, offset, status);
        }

        // ===== 예외 영역 =====
        // 영역 경계는 테이블로만 존재: 방출할 코드 없음
        Opcode::SetupFinally(_) | Opcode::PopBlock => {}
        Opcode::BeginFinally => {
            let status =
                call_helper(builder, "pyseok_push_finally_sentinels", &[frame], module)?;
            check_status(builder, ctx, regions, offset, status);
        }
        Opcode::EndFinally => {
            return emit_end_finally(builder, ctx, regions, offset, module);
        }
        Opcode::PopExcInfo => {
            let status = call_helper(builder, "pyseok_pop_exc_info", &[frame], module)?;
            check_status(builder, ctx, regions, offset, status);
        }
    }
    Ok(false)
}

/// EndFinally의 토큰 분기
///
/// helper 반환값: 음수 = 재전파 (check_status가 바깥 영역으로 보냄),
/// 0 = 계속, 1 = return 재개, 2+ = 보류 점프 재개.
fn emit_end_finally(
    builder: &mut FunctionBuilder,
    ctx: &mut EmitCtx,
    regions: &mut RegionMap,
    offset: u32,
    module: &mut JITModule,
) -> TranslateResult<bool> {
    let frame = ctx.frame_ptr;
    let r = regions.region_of_dispatch(offset).ok_or_else(|| {
        TranslateError::at(
            TranslateErrorKind::InconsistentRegions,
            offset,
            "EndFinally without owning region",
        )
    })?;

    let status = call_helper(builder, "pyseok_end_finally", &[frame], module)?;
    check_status(builder, ctx, regions, offset, status);

    // return 재개
    let ret_block = builder.create_block();
    let chain = builder.create_block();
    let is_ret = builder.ins().icmp_imm(IntCC::Equal, status, 1);
    builder.ins().brif(is_ret, ret_block, &[], chain, &[]);

    builder.switch_to_block(ret_block);
    match regions.next_finally_outward(r, None) {
        Some(outer) => {
            // 바깥 finalizer가 남았음: 값을 다시 보류하고 그쪽으로
            let status = call_helper(builder, "pyseok_stash_return", &[frame], module)?;
            check_status(builder, ctx, regions, offset, status);
            let status = call_helper(builder, "pyseok_push_finally_sentinels", &[frame], module)?;
            check_status(builder, ctx, regions, offset, status);
            let handler_block = handler_target(ctx, regions.entries[outer].region.handler)?;
            builder.ins().jump(handler_block, &[]);
        }
        None => {
            let zero = builder.ins().iconst(types::I64, 0);
            builder.ins().return_(&[zero]);
        }
    }

    // 보류 점프 재개 (토큰 = 인덱스 + 2)
    builder.switch_to_block(chain);
    let exits: Vec<u32> = regions.entries[r].jump_exits.clone();
    for (i, dest) in exits.iter().enumerate() {
        let token = i as i64 + 2;
        let exit_block = builder.create_block();
        let next_chain = builder.create_block();
        let matches_token = builder.ins().icmp_imm(IntCC::Equal, status, token);
        builder.ins().brif(matches_token, exit_block, &[], next_chain, &[]);

        builder.switch_to_block(exit_block);
        match regions.next_finally_outward(r, Some(*dest)) {
            Some(outer) => {
                let outer_token = regions.token_for_jump(outer, *dest);
                let token_val = builder.ins().iconst(types::I64, outer_token);
                call_helper(builder, "pyseok_stash_jump", &[frame, token_val], module)?;
                let status =
                    call_helper(builder, "pyseok_push_finally_sentinels", &[frame], module)?;
                check_status(builder, ctx, regions, offset, status);
                let handler_block = handler_target(ctx, regions.entries[outer].region.handler)?;
                builder.ins().jump(handler_block, &[]);
            }
            None => {
                let dest_block = *ctx.blocks.get(dest).ok_or_else(|| {
                    TranslateError::at(
                        TranslateErrorKind::InvalidJumpTarget,
                        offset,
                        format!("pending jump destination {} has no block", dest),
                    )
                })?;
                builder.ins().jump(dest_block, &[]);
            }
        }
        builder.switch_to_block(next_chain);
    }

    // 토큰 0: 다음 명령으로 계속
    let next_offset = offset + 1;
    match ctx.blocks.get(&next_offset) {
        Some(&b) => {
            builder.ins().jump(b, &[]);
            Ok(true)
        }
        None => {
            let cont = builder.create_block();
            builder.ins().jump(cont, &[]);
            builder.switch_to_block(cont);
            Ok(false)
        }
    }
}

/// 무조건 점프. finally 영역을 벗어나면 토큰을 보류하고 finalizer로 우회.
fn emit_goto(
    builder: &mut FunctionBuilder,
    ctx: &mut EmitCtx,
    regions: &mut RegionMap,
    from: u32,
    dest: u32,
    module: &mut JITModule,
) -> TranslateResult<()> {
    let frame = ctx.frame_ptr;
    if let Some(r) = regions.innermost_finally_at(from)
        && !regions.entries[r].region.contains(dest)
    {
        let token = regions.token_for_jump(r, dest);
        let token_val = builder.ins().iconst(types::I64, token);
        call_helper(builder, "pyseok_stash_jump", &[frame, token_val], module)?;
        let status = call_helper(builder, "pyseok_push_finally_sentinels", &[frame], module)?;
        check_status(builder, ctx, regions, from, status);
        let handler_block = handler_target(ctx, regions.entries[r].region.handler)?;
        builder.ins().jump(handler_block, &[]);
        return Ok(());
    }
    let dest_block = *ctx.blocks.get(&dest).ok_or_else(|| {
        TranslateError::at(
            TranslateErrorKind::InvalidJumpTarget,
            from,
            format!("jump destination {} has no block", dest),
        )
    })?;
    builder.ins().jump(dest_block, &[]);
    Ok(())
}

/// 조건 분기의 대상 블록
///
/// finalizer 우회가 필요하면 경유 블록을 만들어 나중에 채웁니다.
fn goto_block(
    builder: &mut FunctionBuilder,
    ctx: &mut EmitCtx,
    regions: &RegionMap,
    from: u32,
    dest: u32,
) -> TranslateResult<Block> {
    let needs_detour = regions
        .innermost_finally_at(from)
        .is_some_and(|r| !regions.entries[r].region.contains(dest));
    if needs_detour {
        let aux = builder.create_block();
        ctx.pending_gotos.push((aux, from, dest));
        return Ok(aux);
    }
    ctx.blocks.get(&dest).copied().ok_or_else(|| {
        TranslateError::at(
            TranslateErrorKind::InvalidJumpTarget,
            from,
            format!("branch destination {} has no block", dest),
        )
    })
}

/// 조건 분기가 예약해 둔 경유 블록을 채움
fn fill_pending_gotos(
    builder: &mut FunctionBuilder,
    ctx: &mut EmitCtx,
    regions: &mut RegionMap,
    module: &mut JITModule,
) -> TranslateResult<()> {
    let pending = std::mem::take(&mut ctx.pending_gotos);
    for (block, from, dest) in pending {
        builder.switch_to_block(block);
        emit_goto(builder, ctx, regions, from, dest, module)?;
    }
    Ok(())
}

/// 각 영역의 pre-handler 블록을 채움: 예외 상태 전개 후 핸들러로
///
/// 예외는 보호 구간 안 임의 깊이에서 나므로, 전개 helper에 영역 진입
/// 시점의 스택 깊이를 넘겨 잔여 피연산자를 정리하게 합니다.
fn fill_pre_handlers(
    builder: &mut FunctionBuilder,
    ctx: &EmitCtx,
    analysis: &Analysis,
    regions: &RegionMap,
    module: &mut JITModule,
) -> TranslateResult<()> {
    for (r, entry) in regions.entries.iter().enumerate() {
        let pre = ctx.pre_handlers[r];
        builder.switch_to_block(pre);

        let handler_state = analysis
            .get(entry.region.handler as usize)
            .and_then(|s| s.as_ref());
        let (handler_block, base_depth) = match (ctx.blocks.get(&entry.region.handler), handler_state)
        {
            (Some(&b), Some(state)) => {
                let depth = state.depth().saturating_sub(HANDLER_STATE_SLOTS) as i64;
                (b, depth)
            }
            _ => {
                // 핸들러가 도달 불가능하면 이 블록도 참조되지 않음
                let fault = builder
                    .ins()
                    .iconst(types::I64, crate::translate::runtime::STATUS_FAULT);
                builder.ins().return_(&[fault]);
                continue;
            }
        };

        let base = builder.ins().iconst(types::I64, base_depth);
        let status =
            call_helper(builder, "pyseok_exc_state_enter", &[ctx.frame_ptr, base], module)?;
        // 전개 실패는 불변식 위반: 즉시 반환
        let zero = builder.ins().iconst(types::I64, 0);
        let is_err = builder.ins().icmp(IntCC::SignedLessThan, status, zero);
        let bail = builder.create_block();
        let ok = builder.create_block();
        builder.ins().brif(is_err, bail, &[], ok, &[]);
        builder.switch_to_block(bail);
        builder.ins().return_(&[status]);
        builder.switch_to_block(ok);
        builder.ins().jump(handler_block, &[]);
    }
    Ok(())
}

fn handler_target(ctx: &EmitCtx, handler: u32) -> TranslateResult<Block> {
    ctx.blocks.get(&handler).copied().ok_or_else(|| {
        TranslateError::at(
            TranslateErrorKind::UnreachableHandler,
            handler,
            "handler offset has no block",
        )
    })
}

/// 상태 코드가 음수면 가장 안쪽 pre-handler로, 없으면 즉시 반환
fn check_status(
    builder: &mut FunctionBuilder,
    ctx: &EmitCtx,
    regions: &RegionMap,
    offset: u32,
    status: Value,
) {
    let zero = builder.ins().iconst(types::I64, 0);
    let is_err = builder.ins().icmp(IntCC::SignedLessThan, status, zero);
    let err_block = builder.create_block();
    let ok_block = builder.create_block();
    builder.ins().brif(is_err, err_block, &[], ok_block, &[]);

    builder.switch_to_block(err_block);
    match regions.innermost_at(offset) {
        Some(r) => {
            let pre = ctx.pre_handlers[r];
            builder.ins().jump(pre, &[]);
        }
        None => {
            builder.ins().return_(&[status]);
        }
    }
    builder.switch_to_block(ok_block);
}

/// 해당 명령 직전 스택 상단 n칸이 모두 int로 증명되었는가
fn operands_are_int(analysis: &Analysis, offset: u32, n: usize) -> bool {
    let Some(state) = &analysis[offset as usize] else {
        return false;
    };
    let int_type = &registry().int_type;
    (0..n).all(|d| {
        state
            .type_below_top(d)
            .is_some_and(|ty| ty.is_subtype_of(int_type))
    })
}

/// 런타임 helper 호출
fn call_helper(
    builder: &mut FunctionBuilder,
    func_name: &str,
    args: &[Value],
    module: &mut JITModule,
) -> TranslateResult<Value> {
    let sig = helper_signature(func_name, args.len(), module)?;
    let func_id = module
        .declare_function(func_name, Linkage::Import, &sig)
        .map_err(|e| {
            err(
                TranslateErrorKind::Codegen,
                format!("failed to declare helper {}: {}", func_name, e),
            )
        })?;
    let local_func = module.declare_func_in_func(func_id, builder.func);
    let call = builder.ins().call(local_func, args);
    Ok(builder.inst_results(call)[0])
}

/// helper 시그니처: frame 포인터 뒤로 i64 인자들, i64 상태 반환
fn helper_signature(
    func_name: &str,
    arg_count: usize,
    module: &JITModule,
) -> TranslateResult<Signature> {
    if arg_count == 0 {
        return Err(err(
            TranslateErrorKind::Codegen,
            format!("helper {} called without frame pointer", func_name),
        ));
    }
    let call_conv = module.target_config().default_call_conv;
    let ptr_type = module.target_config().pointer_type();
    let mut sig = Signature::new(call_conv);
    sig.params.push(AbiParam::new(ptr_type));
    for _ in 1..arg_count {
        sig.params.push(AbiParam::new(types::I64));
    }
    sig.returns.push(AbiParam::new(types::I64));
    Ok(sig)
}
