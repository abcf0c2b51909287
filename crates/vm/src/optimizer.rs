//! The peephole optimizer.
//!
//! A single pass over a finished chunk that produces new code, new line
//! info, and fresh inline-cache slots. Jump targets are collected up
//! front; no rewrite may fuse across a byte that is the target of any
//! jump, and every jump offset (including `Try`'s two offsets and the
//! `ForPrep`/`ForLoop` pair) is repatched to the rewritten positions.

use crate::chunk::Chunk;
use crate::heap::Heap;
use crate::op_code::OpCode;
use crate::value::Value;

struct JumpPatch {
    old_offset: usize,
    new_offset: usize,
    sign: i64,
    old_jump: u16,
    /// Operand byte position within the instruction.
    write_offset: usize,
}

fn op_at(chunk: &Chunk, offset: usize) -> Option<OpCode> {
    chunk.code.get(offset).and_then(|&b| OpCode::try_from(b).ok())
}

fn read_short(code: &[u8], offset: usize) -> u16 {
    ((code[offset] as u16) << 8) | code[offset + 1] as u16
}

fn number_constant(chunk: &Chunk, index: u8) -> Option<f64> {
    match chunk.constants.get(index as usize) {
        Some(&Value::Number(n)) => Some(n),
        _ => None,
    }
}

fn fold_binary(op: OpCode, a: f64, b: f64) -> Option<f64> {
    Some(match op {
        OpCode::Add => a + b,
        OpCode::Subtract => a - b,
        OpCode::Multiply => a * b,
        OpCode::Divide => a / b,
        OpCode::Power => a.powf(b),
        OpCode::IntDiv => (a / b).floor(),
        OpCode::Modulo => a % b,
        _ => return None,
    })
}

fn is_safe_single_producer(op: OpCode) -> bool {
    matches!(
        op,
        OpCode::Constant
            | OpCode::Nil
            | OpCode::True
            | OpCode::False
            | OpCode::GetLocal
            | OpCode::GetGlobal
            | OpCode::GetUpvalue
            | OpCode::Dup
    )
}

fn collect_jump_targets(chunk: &Chunk, heap: &Heap) -> Vec<bool> {
    let count = chunk.code.len();
    let mut targets = vec![false; count];
    let mut mark = |offset: i64| {
        if offset >= 0 && (offset as usize) < count {
            targets[offset as usize] = true;
        }
    };
    let mut i = 0;
    while i < count {
        match op_at(chunk, i) {
            Some(op @ (OpCode::Jump | OpCode::JumpIfFalse | OpCode::JumpIfTrue | OpCode::Loop)) => {
                let sign: i64 = if op == OpCode::Loop { -1 } else { 1 };
                let jump = read_short(&chunk.code, i + 1) as i64;
                mark(i as i64 + 3 + sign * jump);
            }
            Some(OpCode::Try) => {
                let ex_jump = read_short(&chunk.code, i + 3) as i64;
                let fin_jump = read_short(&chunk.code, i + 5) as i64;
                if ex_jump != 0 {
                    mark(i as i64 + 7 + ex_jump);
                }
                if fin_jump != 0 {
                    mark(i as i64 + 7 + fin_jump);
                }
            }
            Some(op @ (OpCode::ForPrep | OpCode::ForLoop)) => {
                let jump = read_short(&chunk.code, i + 3) as i64;
                let sign: i64 = if op == OpCode::ForLoop { -1 } else { 1 };
                mark(i as i64 + 5 + sign * jump);
            }
            _ => {}
        }
        i += chunk.instruction_len(i, heap);
    }
    targets
}

/// Rewrites one chunk in place.
pub fn optimize_chunk(chunk: &mut Chunk, heap: &Heap) {
    if chunk.code.is_empty() {
        chunk.rebuild_caches();
        return;
    }

    let old_count = chunk.code.len();
    let targets = collect_jump_targets(chunk, heap);
    let mut old_to_new = vec![usize::MAX; old_count];
    let mut new_code: Vec<u8> = Vec::with_capacity(old_count);
    let mut new_lines: Vec<u32> = Vec::with_capacity(old_count);
    let mut patches: Vec<JumpPatch> = Vec::new();
    let mut folded: Vec<(usize, Value)> = Vec::new();

    let emit = |code: &mut Vec<u8>, lines: &mut Vec<u32>, line: u32, byte: u8| {
        code.push(byte);
        lines.push(line);
    };

    let mut i = 0;
    while i < old_count {
        old_to_new[i] = new_code.len();
        let line = chunk.lines[i];
        let op = op_at(chunk, i);

        // Drop a redundant AdjustStack after a simple expression result:
        // <single-producer> Pop AdjustStack.
        if let Some(op) = op {
            if is_safe_single_producer(op) {
                let len1 = chunk.instruction_len(i, heap);
                let next = i + len1;
                if next < old_count
                    && op_at(chunk, next) == Some(OpCode::Pop)
                    && next + 1 < old_count
                    && op_at(chunk, next + 1) == Some(OpCode::AdjustStack)
                    && !targets[i]
                    && !targets[next]
                    && !targets[next + 1]
                {
                    for j in 0..len1 {
                        emit(&mut new_code, &mut new_lines, line, chunk.code[i + j]);
                    }
                    emit(&mut new_code, &mut new_lines, line, OpCode::Pop as u8);
                    i = next + 3;
                    continue;
                }
            }
        }

        // Right-hand identities: x+0, x-0, x*1, x/1.
        if op == Some(OpCode::Constant) && i + 2 < old_count {
            if let Some(next_op) = op_at(chunk, i + 2) {
                if matches!(
                    next_op,
                    OpCode::Add | OpCode::Subtract | OpCode::Multiply | OpCode::Divide
                ) {
                    if let Some(n) = number_constant(chunk, chunk.code[i + 1]) {
                        let dropable = match next_op {
                            OpCode::Add | OpCode::Subtract => n == 0.0,
                            _ => n == 1.0,
                        };
                        if dropable && !targets[i] && !targets[i + 2] {
                            i += 3;
                            continue;
                        }
                    }
                }
            }
        }

        // GetLocal s, Constant c, Add, SetLocal s  ->  IncLocal s c.
        if op == Some(OpCode::GetLocal)
            && i + 6 < old_count
            && op_at(chunk, i + 2) == Some(OpCode::Constant)
            && op_at(chunk, i + 4) == Some(OpCode::Add)
            && op_at(chunk, i + 5) == Some(OpCode::SetLocal)
            && chunk.code[i + 1] == chunk.code[i + 6]
            && number_constant(chunk, chunk.code[i + 3]).is_some()
            && !targets[i + 2]
            && !targets[i + 4]
            && !targets[i + 5]
        {
            emit(&mut new_code, &mut new_lines, line, OpCode::IncLocal as u8);
            emit(&mut new_code, &mut new_lines, line, chunk.code[i + 1]);
            emit(&mut new_code, &mut new_lines, line, chunk.code[i + 3]);
            i += 7;
            continue;
        }

        // GetLocal s, Constant c, OP, SetLocal s  ->  OP_LocalConst s c.
        if op == Some(OpCode::GetLocal)
            && i + 6 < old_count
            && op_at(chunk, i + 2) == Some(OpCode::Constant)
            && op_at(chunk, i + 5) == Some(OpCode::SetLocal)
            && chunk.code[i + 1] == chunk.code[i + 6]
        {
            let fused = match op_at(chunk, i + 4) {
                Some(OpCode::Subtract) => Some(OpCode::SubLocalConst),
                Some(OpCode::Multiply) => Some(OpCode::MulLocalConst),
                Some(OpCode::Divide) => Some(OpCode::DivLocalConst),
                Some(OpCode::Modulo) => Some(OpCode::ModLocalConst),
                _ => None,
            };
            if let Some(fused) = fused {
                if !targets[i + 2] && !targets[i + 4] && !targets[i + 5] {
                    emit(&mut new_code, &mut new_lines, line, fused as u8);
                    emit(&mut new_code, &mut new_lines, line, chunk.code[i + 1]);
                    emit(&mut new_code, &mut new_lines, line, chunk.code[i + 3]);
                    i += 7;
                    continue;
                }
            }
        }

        // Constant a, Constant b, OP  ->  Constant (a OP b).
        if op == Some(OpCode::Constant)
            && i + 4 < old_count
            && op_at(chunk, i + 2) == Some(OpCode::Constant)
        {
            let folded_value = op_at(chunk, i + 4).and_then(|binary| {
                let a = number_constant(chunk, chunk.code[i + 1])?;
                let b = number_constant(chunk, chunk.code[i + 3])?;
                fold_binary(binary, a, b)
            });
            if let Some(result) = folded_value {
                if !targets[i + 2] && !targets[i + 4] {
                    emit(&mut new_code, &mut new_lines, line, OpCode::Constant as u8);
                    folded.push((new_code.len(), Value::Number(result)));
                    emit(&mut new_code, &mut new_lines, line, 0);
                    i += 5;
                    continue;
                }
            }
        }

        // Constant a, Negate  ->  Constant (-a).
        if op == Some(OpCode::Constant)
            && i + 2 < old_count
            && op_at(chunk, i + 2) == Some(OpCode::Negate)
            && !targets[i + 2]
        {
            if let Some(n) = number_constant(chunk, chunk.code[i + 1]) {
                emit(&mut new_code, &mut new_lines, line, OpCode::Constant as u8);
                folded.push((new_code.len(), Value::Number(-n)));
                emit(&mut new_code, &mut new_lines, line, 0);
                i += 3;
                continue;
            }
        }

        // <value> Constant c OP  ->  OP_CONST c.
        if op == Some(OpCode::Constant) && i + 2 < old_count && !targets[i] && !targets[i + 2] {
            let fused = match op_at(chunk, i + 2) {
                Some(OpCode::Add) => Some(OpCode::AddConst),
                Some(OpCode::Subtract) => Some(OpCode::SubConst),
                Some(OpCode::Multiply) => Some(OpCode::MulConst),
                Some(OpCode::Divide) => Some(OpCode::DivConst),
                Some(OpCode::Modulo) => Some(OpCode::ModConst),
                _ => None,
            };
            if let Some(fused) = fused {
                emit(&mut new_code, &mut new_lines, line, fused as u8);
                emit(&mut new_code, &mut new_lines, line, chunk.code[i + 1]);
                i += 3;
                continue;
            }
        }

        // OP + SetLocal s  ->  OP_SET_LOCAL s.
        if let Some(binary) = op {
            let fused = match binary {
                OpCode::Add => Some(OpCode::AddSetLocal),
                OpCode::Subtract => Some(OpCode::SubSetLocal),
                OpCode::Multiply => Some(OpCode::MulSetLocal),
                OpCode::Divide => Some(OpCode::DivSetLocal),
                OpCode::Modulo => Some(OpCode::ModSetLocal),
                _ => None,
            };
            if let Some(fused) = fused {
                if i + 2 < old_count
                    && op_at(chunk, i + 1) == Some(OpCode::SetLocal)
                    && !targets[i]
                    && !targets[i + 1]
                {
                    emit(&mut new_code, &mut new_lines, line, fused as u8);
                    emit(&mut new_code, &mut new_lines, line, chunk.code[i + 2]);
                    i += 3;
                    continue;
                }
            }
        }

        // Plain copy, remembering jumps for repatching.
        match op {
            Some(op @ (OpCode::Jump | OpCode::JumpIfFalse | OpCode::JumpIfTrue | OpCode::Loop)) => {
                patches.push(JumpPatch {
                    old_offset: i,
                    new_offset: new_code.len(),
                    sign: if op == OpCode::Loop { -1 } else { 1 },
                    old_jump: read_short(&chunk.code, i + 1),
                    write_offset: 1,
                });
            }
            Some(OpCode::Try) => {
                patches.push(JumpPatch {
                    old_offset: i,
                    new_offset: new_code.len(),
                    sign: 1,
                    old_jump: read_short(&chunk.code, i + 3),
                    write_offset: 3,
                });
                patches.push(JumpPatch {
                    old_offset: i,
                    new_offset: new_code.len(),
                    sign: 1,
                    old_jump: read_short(&chunk.code, i + 5),
                    write_offset: 5,
                });
            }
            Some(op @ (OpCode::ForPrep | OpCode::ForLoop)) => {
                patches.push(JumpPatch {
                    old_offset: i,
                    new_offset: new_code.len(),
                    sign: if op == OpCode::ForLoop { -1 } else { 1 },
                    old_jump: read_short(&chunk.code, i + 3),
                    write_offset: 3,
                });
            }
            _ => {}
        }
        let len = chunk.instruction_len(i, heap);
        for j in 0..len {
            emit(&mut new_code, &mut new_lines, line, chunk.code[i + j]);
        }
        i += len;
    }

    // Late constant installation, so pool growth cannot race the scan.
    for (operand_offset, value) in folded {
        match chunk.add_constant(value) {
            Ok(index) => new_code[operand_offset] = index,
            Err(_) => {
                // Pool full: fall back to the unoptimized chunk.
                chunk.rebuild_caches();
                return;
            }
        }
    }

    for patch in &patches {
        let instr_len = chunk.instruction_len(patch.old_offset, heap);
        let old_target =
            patch.old_offset as i64 + instr_len as i64 + patch.sign * patch.old_jump as i64;
        if old_target < 0 || old_target >= old_count as i64 {
            continue;
        }
        let new_target = old_to_new[old_target as usize];
        if new_target == usize::MAX {
            continue;
        }
        // A zero Try offset means "no handler block"; keep it zero.
        if op_at(chunk, patch.old_offset) == Some(OpCode::Try) && patch.old_jump == 0 {
            continue;
        }
        let new_jump =
            patch.sign * (new_target as i64 - (patch.new_offset as i64 + instr_len as i64));
        let operand = patch.new_offset + patch.write_offset;
        new_code[operand] = ((new_jump >> 8) & 0xff) as u8;
        new_code[operand + 1] = (new_jump & 0xff) as u8;
    }

    chunk.code = new_code;
    chunk.lines = new_lines;
    chunk.rebuild_caches();
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chunk_of(ops: &[(OpCode, &[u8])]) -> Chunk {
        let mut chunk = Chunk::new();
        for (op, operands) in ops {
            chunk.write_op(*op, 1);
            for &b in *operands {
                chunk.write(b, 1);
            }
        }
        chunk
    }

    #[test]
    fn folds_constant_addition() {
        let heap = Heap::new();
        let mut chunk = Chunk::new();
        let a = chunk.add_constant(Value::Number(2.0)).unwrap();
        let b = chunk.add_constant(Value::Number(3.0)).unwrap();
        chunk.write_op(OpCode::Constant, 1);
        chunk.write(a, 1);
        chunk.write_op(OpCode::Constant, 1);
        chunk.write(b, 1);
        chunk.write_op(OpCode::Add, 1);
        optimize_chunk(&mut chunk, &heap);
        assert_eq!(chunk.code.len(), 2);
        assert_eq!(chunk.code[0], OpCode::Constant as u8);
        assert_eq!(chunk.constants[chunk.code[1] as usize], Value::Number(5.0));
    }

    #[test]
    fn fuses_local_increment() {
        let heap = Heap::new();
        let mut chunk = Chunk::new();
        let c = chunk.add_constant(Value::Number(1.0)).unwrap();
        chunk.write_op(OpCode::GetLocal, 1);
        chunk.write(2, 1);
        chunk.write_op(OpCode::Constant, 1);
        chunk.write(c, 1);
        chunk.write_op(OpCode::Add, 1);
        chunk.write_op(OpCode::SetLocal, 1);
        chunk.write(2, 1);
        optimize_chunk(&mut chunk, &heap);
        assert_eq!(
            chunk.code,
            vec![OpCode::IncLocal as u8, 2, c]
        );
    }

    #[test]
    fn drops_identity_add_zero() {
        let heap = Heap::new();
        let mut chunk = Chunk::new();
        let zero = chunk.add_constant(Value::Number(0.0)).unwrap();
        chunk.write_op(OpCode::GetLocal, 1);
        chunk.write(1, 1);
        chunk.write_op(OpCode::Constant, 1);
        chunk.write(zero, 1);
        chunk.write_op(OpCode::Add, 1);
        optimize_chunk(&mut chunk, &heap);
        assert_eq!(chunk.code, vec![OpCode::GetLocal as u8, 1]);
    }

    #[test]
    fn fuses_const_rhs() {
        let heap = Heap::new();
        let mut chunk = Chunk::new();
        let c = chunk.add_constant(Value::Number(4.0)).unwrap();
        chunk.write_op(OpCode::GetLocal, 1);
        chunk.write(1, 1);
        chunk.write_op(OpCode::Constant, 1);
        chunk.write(c, 1);
        chunk.write_op(OpCode::Multiply, 1);
        optimize_chunk(&mut chunk, &heap);
        assert_eq!(
            chunk.code,
            vec![OpCode::GetLocal as u8, 1, OpCode::MulConst as u8, c]
        );
    }

    #[test]
    fn does_not_fuse_across_jump_targets() {
        let heap = Heap::new();
        // Jump lands on the Add, so the constant pair must not fold.
        let mut chunk = Chunk::new();
        let a = chunk.add_constant(Value::Number(1.0)).unwrap();
        let b = chunk.add_constant(Value::Number(2.0)).unwrap();
        chunk.write_op(OpCode::Jump, 1);
        chunk.write(0, 1);
        chunk.write(4, 1); // target = 3 + 4 = offset 7 (the Add)
        chunk.write_op(OpCode::Constant, 1);
        chunk.write(a, 1);
        chunk.write_op(OpCode::Constant, 1);
        chunk.write(b, 1);
        chunk.write_op(OpCode::Add, 1);
        optimize_chunk(&mut chunk, &heap);
        assert_eq!(chunk.code.len(), 8);
        assert_eq!(chunk.code[3], OpCode::Constant as u8);
        assert_eq!(chunk.code[7], OpCode::Add as u8);
    }

    #[test]
    fn rebuilds_jump_offsets_after_shrinking() {
        let heap = Heap::new();
        // Jump over a foldable pair to a Pop at the end.
        let mut chunk = Chunk::new();
        let a = chunk.add_constant(Value::Number(1.0)).unwrap();
        let b = chunk.add_constant(Value::Number(2.0)).unwrap();
        chunk.write_op(OpCode::Jump, 1);
        chunk.write(0, 1);
        chunk.write(5, 1); // over Constant,Constant,Add to the Pop
        chunk.write_op(OpCode::Constant, 1);
        chunk.write(a, 1);
        chunk.write_op(OpCode::Constant, 1);
        chunk.write(b, 1);
        chunk.write_op(OpCode::Add, 1);
        chunk.write_op(OpCode::Pop, 1);
        optimize_chunk(&mut chunk, &heap);
        // Fold shrank the middle to two bytes; jump must now skip 2.
        assert_eq!(chunk.code[0], OpCode::Jump as u8);
        let jump = ((chunk.code[1] as usize) << 8) | chunk.code[2] as usize;
        assert_eq!(jump, 2);
        assert_eq!(*chunk.code.last().unwrap(), OpCode::Pop as u8);
    }

    #[test]
    fn empty_chunk_is_untouched() {
        let heap = Heap::new();
        let mut chunk = chunk_of(&[]);
        optimize_chunk(&mut chunk, &heap);
        assert!(chunk.code.is_empty());
    }
}
