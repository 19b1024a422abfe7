//! 예외 영역의 구조 분석
//!
//! 코드 방출 단계가 묻는 질문들에 답합니다:
//! - 이 오프셋에서 에러가 나면 어느 핸들러로 가는가 (가장 안쪽 영역)
//! - 이 EndFinally는 어느 영역의 것인가
//! - 영역을 일찍 떠나는 분기(return, 바깥 점프)에 어떤 토큰을 주는가
//! - 안쪽 finally를 마친 보류 분기를 바깥 영역으로 다시 넘겨야 하는가

use crate::translate::instruction::{CompiledFunction, ExceptionRegion, Opcode, RegionKind};

/// return 보류를 나타내는 토큰. 점프 보류는 2부터.
pub const RETURN_TOKEN: i64 = 1;

/// 정렬된 영역 하나와 부가 정보
#[derive(Debug)]
pub struct RegionEntry {
    pub region: ExceptionRegion,
    /// 이 영역을 진짜 포함하는 가장 안쪽 영역
    pub parent: Option<usize>,
    /// 이 영역의 핸들러를 닫는 EndFinally/PopExcInfo 오프셋
    pub dispatch_at: Option<u32>,
    /// 할당된 조기 탈출 점프 대상 (토큰 = 인덱스 + 2)
    pub jump_exits: Vec<u32>,
}

impl RegionEntry {
    pub fn is_finally(&self) -> bool {
        self.region.kind == RegionKind::Finally
    }
}

/// 한 함수의 영역 집합 (바깥 영역이 앞에 오도록 정렬)
#[derive(Debug)]
pub struct RegionMap {
    pub entries: Vec<RegionEntry>,
}

impl RegionMap {
    pub fn new(func: &CompiledFunction) -> Self {
        // (start 오름차순, 범위 내림차순): 부모가 자식보다 앞
        let mut sorted: Vec<ExceptionRegion> = func.regions.clone();
        sorted.sort_by(|a, b| {
            a.start
                .cmp(&b.start)
                .then(b.extent().cmp(&a.extent()))
        });

        let mut entries: Vec<RegionEntry> = sorted
            .into_iter()
            .map(|region| RegionEntry {
                region,
                parent: None,
                dispatch_at: None,
                jump_exits: vec![],
            })
            .collect();

        // 부모 연결: 보호 구간을 진짜 포함하는 가장 안쪽 영역
        for i in 0..entries.len() {
            let (start, end) = (entries[i].region.start, entries[i].region.end);
            let mut best: Option<usize> = None;
            for (j, other) in entries.iter().enumerate() {
                if i == j {
                    continue;
                }
                let o = &other.region;
                let contains = o.start <= start && end <= o.end && o.extent() > entries[i].region.extent();
                if contains {
                    best = match best {
                        Some(b) if entries[b].region.extent() <= o.extent() => Some(b),
                        _ => Some(j),
                    };
                }
            }
            entries[i].parent = best;
        }

        // EndFinally/PopExcInfo 소유권: 핸들러 오프셋이 큰 영역부터
        // (핸들러 본문 속 중첩 영역이 자기 것을 먼저 가져감)
        let mut claimed = vec![false; func.instructions.len()];
        let mut order: Vec<usize> = (0..entries.len()).collect();
        order.sort_by(|a, b| entries[*b].region.handler.cmp(&entries[*a].region.handler));
        for idx in order {
            let handler = entries[idx].region.handler;
            let want_finally = entries[idx].is_finally();
            for (offset, instr) in func
                .instructions
                .iter()
                .enumerate()
                .skip(handler as usize)
            {
                let matches_kind = match instr.op {
                    Opcode::EndFinally => want_finally,
                    Opcode::PopExcInfo => !want_finally,
                    _ => false,
                };
                if matches_kind && !claimed[offset] {
                    claimed[offset] = true;
                    entries[idx].dispatch_at = Some(offset as u32);
                    break;
                }
            }
        }

        RegionMap { entries }
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// 이 오프셋을 보호하는 가장 안쪽 영역
    ///
    /// 핸들러 본문은 자기 보호 구간 밖이므로 자연히 바깥 영역으로 갑니다.
    pub fn innermost_at(&self, offset: u32) -> Option<usize> {
        let mut best: Option<usize> = None;
        for (i, entry) in self.entries.iter().enumerate() {
            if entry.region.contains(offset) {
                best = match best {
                    Some(b) if self.entries[b].region.extent() <= entry.region.extent() => Some(b),
                    _ => Some(i),
                };
            }
        }
        best
    }

    /// 이 오프셋에서 실행되는 코드가 속한 가장 안쪽 **finally** 영역
    ///
    /// 조기 탈출(return/바깥 점프)이 finalizer를 거쳐야 하는지 판단합니다.
    pub fn innermost_finally_at(&self, offset: u32) -> Option<usize> {
        let mut best: Option<usize> = None;
        for (i, entry) in self.entries.iter().enumerate() {
            if entry.is_finally() && entry.region.contains(offset) {
                best = match best {
                    Some(b) if self.entries[b].region.extent() <= entry.region.extent() => Some(b),
                    _ => Some(i),
                };
            }
        }
        best
    }

    /// 이 EndFinally/PopExcInfo 오프셋을 소유한 영역
    pub fn region_of_dispatch(&self, offset: u32) -> Option<usize> {
        self.entries
            .iter()
            .position(|e| e.dispatch_at == Some(offset))
    }

    /// idx 영역의 finalizer를 마친 뒤에도 여전히 거쳐야 할 바깥 finally 영역
    ///
    /// dest가 그 바깥 영역 밖(또는 return)일 때만 재전달이 필요합니다.
    pub fn next_finally_outward(&self, idx: usize, dest: Option<u32>) -> Option<usize> {
        let mut cur = self.entries[idx].parent;
        while let Some(p) = cur {
            if self.entries[p].is_finally() {
                match dest {
                    // return은 모든 바깥 finally를 거침
                    None => return Some(p),
                    Some(d) => {
                        if !self.entries[p].region.contains(d) {
                            return Some(p);
                        }
                        // 대상이 이 영역 안이면 여기서 전달 종료
                        return None;
                    }
                }
            }
            cur = self.entries[p].parent;
        }
        None
    }

    /// 영역을 떠나는 점프 대상에 토큰 할당 (같은 대상은 같은 토큰)
    pub fn token_for_jump(&mut self, idx: usize, dest: u32) -> i64 {
        let exits = &mut self.entries[idx].jump_exits;
        if let Some(pos) = exits.iter().position(|d| *d == dest) {
            return pos as i64 + 2;
        }
        exits.push(dest);
        exits.len() as i64 + 1
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::translate::instruction::BytecodeBuilder;

    #[test]
    fn test_single_finally_region() {
        let f = BytecodeBuilder::new("f")
            .try_finally(|b| b.const_int(1).pop(), |b| b)
            .const_none()
            .ret()
            .build();
        let map = RegionMap::new(&f);
        assert_eq!(map.entries.len(), 1);
        assert!(map.entries[0].parent.is_none());
        assert!(map.entries[0].is_finally());

        // 보호 구간 안 → 영역 0, 밖 → 없음
        assert_eq!(map.innermost_at(f.regions[0].start), Some(0));
        assert_eq!(map.innermost_at(f.regions[0].handler), None);

        // EndFinally 소유권
        let dispatch = map.entries[0].dispatch_at.unwrap();
        assert!(matches!(f.instructions[dispatch as usize].op, Opcode::EndFinally));
        assert_eq!(map.region_of_dispatch(dispatch), Some(0));
    }

    #[test]
    fn test_nested_finally_parent_links() {
        let f = BytecodeBuilder::new("f")
            .try_finally(
                |b| {
                    b.try_finally(|b| b.const_int(1).pop(), |b| b.const_int(2).pop())
                        .const_int(3)
                        .pop()
                },
                |b| b.const_int(4).pop(),
            )
            .const_none()
            .ret()
            .build();
        let map = RegionMap::new(&f);
        assert_eq!(map.entries.len(), 2);
        // 정렬: 바깥(범위 큰 쪽)이 0번
        assert!(map.entries[0].region.extent() > map.entries[1].region.extent());
        assert_eq!(map.entries[1].parent, Some(0));
        assert!(map.entries[0].parent.is_none());

        // 안쪽 보호 구간의 innermost는 안쪽 영역
        assert_eq!(map.innermost_at(map.entries[1].region.start), Some(1));

        // 각자 자기 EndFinally를 가짐
        let d0 = map.entries[0].dispatch_at.unwrap();
        let d1 = map.entries[1].dispatch_at.unwrap();
        assert_ne!(d0, d1);
        // 안쪽 핸들러가 앞에 있으므로 d1 < d0
        assert!(d1 < d0);
    }

    #[test]
    fn test_except_region_owns_pop_exc_info() {
        let f = BytecodeBuilder::new("f")
            .try_except(|b| b.const_int(1).pop(), |b| b.const_int(2).pop())
            .const_none()
            .ret()
            .build();
        let map = RegionMap::new(&f);
        assert_eq!(map.entries.len(), 1);
        assert!(!map.entries[0].is_finally());
        let dispatch = map.entries[0].dispatch_at.unwrap();
        assert!(matches!(f.instructions[dispatch as usize].op, Opcode::PopExcInfo));
    }

    #[test]
    fn test_jump_tokens_stable_per_destination() {
        let f = BytecodeBuilder::new("f")
            .try_finally(|b| b.const_int(1).pop(), |b| b)
            .const_none()
            .ret()
            .build();
        let mut map = RegionMap::new(&f);
        let t1 = map.token_for_jump(0, 9);
        let t2 = map.token_for_jump(0, 12);
        let t3 = map.token_for_jump(0, 9);
        assert_eq!(t1, 2);
        assert_eq!(t2, 3);
        assert_eq!(t3, t1);
        assert_ne!(t1, RETURN_TOKEN);
    }

    #[test]
    fn test_return_redispatches_through_outer_finally() {
        let f = BytecodeBuilder::new("f")
            .try_finally(
                |b| {
                    b.try_finally(|b| b.const_int(1).pop(), |b| b)
                        .const_int(3)
                        .pop()
                },
                |b| b,
            )
            .const_none()
            .ret()
            .build();
        let map = RegionMap::new(&f);
        // 안쪽 finally를 마친 return 보류는 바깥 finally로 재전달
        assert_eq!(map.next_finally_outward(1, None), Some(0));
        // 바깥 finally를 마치면 더 전달할 곳 없음
        assert_eq!(map.next_finally_outward(0, None), None);
    }

    #[test]
    fn test_jump_within_outer_region_stops_redispatch() {
        let f = BytecodeBuilder::new("f")
            .try_finally(
                |b| {
                    b.try_finally(|b| b.const_int(1).pop(), |b| b)
                        .const_int(3)
                        .pop()
                },
                |b| b,
            )
            .const_none()
            .ret()
            .build();
        let map = RegionMap::new(&f);
        let outer = &map.entries[0].region;
        // 바깥 영역 안의 오프셋으로 가는 점프는 안쪽 finally만 거침
        let inside_outer = outer.end - 1;
        assert_eq!(map.next_finally_outward(1, Some(inside_outer)), None);
        // 함수 끝으로 가는 점프는 바깥 finally도 거침
        let past_outer = f.instructions.len() as u32 - 1;
        assert_eq!(map.next_finally_outward(1, Some(past_outer)), Some(0));
    }
}
