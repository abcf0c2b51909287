//! Chunk disassembly, for tests and embedders.

use std::fmt::Write;

use crate::chunk::Chunk;
use crate::heap::Heap;
use crate::op_code::OpCode;
use crate::value::{format_number, Value};

/// Renders a whole chunk.
pub fn disassemble_chunk(chunk: &Chunk, name: &str, heap: &Heap) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "== {name} ==");
    let mut offset = 0;
    while offset < chunk.code.len() {
        offset = disassemble_instruction(chunk, offset, heap, &mut out);
    }
    out
}

fn constant_text(chunk: &Chunk, index: u8, heap: &Heap) -> String {
    match chunk.constants.get(index as usize) {
        Some(Value::Str(id)) => format!("\"{}\"", heap.string(*id).chars),
        Some(Value::Number(n)) => format_number(*n),
        Some(Value::Function(id)) => match heap.function(*id).name {
            Some(name) => format!("<fn {}>", heap.string(name).chars),
            None => "<script>".to_string(),
        },
        Some(Value::Bool(b)) => b.to_string(),
        Some(Value::Nil) => "nil".to_string(),
        Some(other) => format!("{other:?}"),
        None => "???".to_string(),
    }
}

/// Renders one instruction into `out`; returns the next offset.
pub fn disassemble_instruction(
    chunk: &Chunk,
    offset: usize,
    heap: &Heap,
    out: &mut String,
) -> usize {
    let _ = write!(out, "{offset:04} ");
    if offset > 0 && chunk.lines[offset] == chunk.lines[offset - 1] {
        let _ = write!(out, "   | ");
    } else {
        let _ = write!(out, "{:4} ", chunk.lines[offset]);
    }

    let Ok(op) = OpCode::try_from(chunk.code[offset]) else {
        let _ = writeln!(out, "Unknown opcode {}", chunk.code[offset]);
        return offset + 1;
    };

    let name = format!("{op:?}");
    let byte = |at: usize| chunk.code[offset + at];
    let short = |at: usize| ((chunk.code[offset + at] as u16) << 8) | chunk.code[offset + at + 1] as u16;

    use OpCode::*;
    match op {
        Constant | AddConst | SubConst | MulConst | DivConst | ModConst | GetGlobal
        | DefineGlobal | SetGlobal | DeleteGlobal | Import => {
            let index = byte(1);
            let _ = writeln!(out, "{name:<16} {index:4} {}", constant_text(chunk, index, heap));
        }
        GetLocal | SetLocal | GetUpvalue | SetUpvalue | Call | CallNamed | CallExpand | ReturnN
        | AdjustStack | BuildString | Print | AddSetLocal | SubSetLocal | MulSetLocal
        | DivSetLocal | ModSetLocal => {
            let _ = writeln!(out, "{name:<16} {:4}", byte(1));
        }
        IncLocal | SubLocalConst | MulLocalConst | DivLocalConst | ModLocalConst => {
            let _ = writeln!(
                out,
                "{name:<16} {:4} {}",
                byte(1),
                constant_text(chunk, byte(2), heap)
            );
        }
        Unpack => {
            let _ = writeln!(out, "{name:<16} {:4} {:4}", byte(1), byte(2));
        }
        Jump | JumpIfFalse | JumpIfTrue => {
            let target = offset + 3 + short(1) as usize;
            let _ = writeln!(out, "{name:<16} {offset:4} -> {target}");
        }
        Loop => {
            let target = offset + 3 - short(1) as usize;
            let _ = writeln!(out, "{name:<16} {offset:4} -> {target}");
        }
        ForPrep => {
            let target = offset + 5 + short(3) as usize;
            let _ = writeln!(out, "{name:<16} v{} e{} -> {target}", byte(1), byte(2));
        }
        ForLoop => {
            let target = offset + 5 - short(3) as usize;
            let _ = writeln!(out, "{name:<16} v{} e{} -> {target}", byte(1), byte(2));
        }
        Try => {
            let ex = short(3);
            let fin = short(5);
            let _ = writeln!(
                out,
                "{name:<16} depth {} flags {:#04x} ex +{ex} fin +{fin}",
                byte(1),
                byte(2)
            );
        }
        Closure => {
            let index = byte(1);
            let _ = writeln!(out, "{name:<16} {index:4} {}", constant_text(chunk, index, heap));
            let upvalues = match chunk.constants.get(index as usize) {
                Some(&Value::Function(id)) => heap.function(id).upvalue_count,
                _ => 0,
            };
            let mut at = offset + 2;
            for _ in 0..upvalues {
                let is_local = chunk.code[at];
                let slot = chunk.code[at + 1];
                let kind = if is_local == 1 { "local" } else { "upvalue" };
                let _ = writeln!(out, "{:04}    |                     {kind} {slot}", at);
                at += 2;
            }
            return at;
        }
        _ => {
            let _ = writeln!(out, "{name}");
        }
    }
    offset + chunk.instruction_len(offset, heap)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn renders_constants_and_jumps() {
        let mut heap = Heap::new();
        let mut chunk = Chunk::new();
        let s = heap.alloc_str("hello");
        let index = chunk.add_constant(Value::Str(s)).unwrap();
        chunk.write_op(OpCode::Constant, 1);
        chunk.write(index, 1);
        chunk.write_op(OpCode::Jump, 2);
        chunk.write(0, 2);
        chunk.write(1, 2);
        chunk.write_op(OpCode::Pop, 2);
        chunk.write_op(OpCode::Return, 2);
        let text = disassemble_chunk(&chunk, "test", &heap);
        assert!(text.contains("== test =="));
        assert!(text.contains("\"hello\""));
        assert!(text.contains("Jump"));
        assert!(text.contains("-> 6"));
    }
}
