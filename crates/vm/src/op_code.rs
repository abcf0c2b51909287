//! OpCode definitions for the Tael virtual machine.
//!
//! One byte of opcode followed by zero to six bytes of immediate operands.
//! `CLOSURE` is the only variable-length instruction: it trails one
//! `(is_local, index)` byte pair per upvalue of the referenced function.

/// The instruction set, in dispatch order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum OpCode {
    // Constants and stack shuffling.
    Constant = 0,
    Nil,
    True,
    False,
    Pop,
    Dup,

    // Variables.
    GetLocal,
    SetLocal,
    GetUpvalue,
    SetUpvalue,
    CloseUpvalue,
    GetGlobal,
    DefineGlobal,
    SetGlobal,
    DeleteGlobal,

    // Tables.
    NewTable,
    GetTable,
    GetMetaTable,
    SetTable,
    DeleteTable,
    SetMetatable,
    Append,

    // Arithmetic and unary.
    Add,
    Subtract,
    Multiply,
    Divide,
    Modulo,
    Power,
    IntDiv,
    Negate,
    Not,
    Length,

    // Constant-fused arithmetic (peephole output).
    AddConst,
    SubConst,
    MulConst,
    DivConst,
    ModConst,

    // Local superinstructions (peephole output).
    IncLocal,
    SubLocalConst,
    MulLocalConst,
    DivLocalConst,
    ModLocalConst,
    AddSetLocal,
    SubSetLocal,
    MulSetLocal,
    DivSetLocal,
    ModSetLocal,

    // Comparison and membership.
    Equal,
    Greater,
    Less,
    Has,
    In,

    // Control flow.
    Jump,
    JumpIfFalse,
    JumpIfTrue,
    Loop,
    ForPrep,
    ForLoop,

    // Calls and returns.
    Call,
    Call0,
    Call1,
    Call2,
    CallNamed,
    CallExpand,
    Return,
    ReturnN,
    AdjustStack,
    Unpack,
    Closure,
    BuildString,

    // Iteration support.
    IterPrep,
    IterPrepIpairs,
    Range,
    Slice,

    // Exceptions.
    Try,
    EndTry,
    EndFinally,
    Throw,

    // Modules.
    Import,
    ImportStar,

    // Printing and diagnostics.
    Print,
    CollectGarbage,
}

impl OpCode {
    /// Number of fixed operand bytes following the opcode byte.
    ///
    /// `Closure` reports only its constant operand here; its trailing
    /// upvalue pairs depend on the referenced function and are handled by
    /// [`crate::chunk::Chunk::instruction_len`].
    pub fn operand_len(self) -> usize {
        use OpCode::*;
        match self {
            Constant | AddConst | SubConst | MulConst | DivConst | ModConst | GetGlobal
            | DefineGlobal | SetGlobal | DeleteGlobal | GetLocal | SetLocal | AddSetLocal
            | SubSetLocal | MulSetLocal | DivSetLocal | ModSetLocal | GetUpvalue | SetUpvalue
            | ReturnN | AdjustStack | Call | CallNamed | CallExpand | Import | BuildString
            | Print | Closure => 1,
            IncLocal | SubLocalConst | MulLocalConst | DivLocalConst | ModLocalConst | Unpack
            | Jump | JumpIfFalse | JumpIfTrue | Loop => 2,
            ForPrep | ForLoop => 4,
            Try => 6,
            _ => 0,
        }
    }
}

impl TryFrom<u8> for OpCode {
    type Error = u8;

    fn try_from(byte: u8) -> Result<Self, u8> {
        if byte <= OpCode::CollectGarbage as u8 {
            // Contiguous discriminants starting at zero.
            Ok(unsafe { std::mem::transmute::<u8, OpCode>(byte) })
        } else {
            Err(byte)
        }
    }
}

bitflags::bitflags! {
    /// Flag byte carried by the `Try` instruction.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct TryFlags: u8 {
        /// The handler has an except block.
        const HAS_EXCEPT = 0b0000_0001;
        /// The handler has a finally block.
        const HAS_FINALLY = 0b0000_0010;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_through_u8() {
        for byte in 0..=OpCode::CollectGarbage as u8 {
            let op = OpCode::try_from(byte).unwrap();
            assert_eq!(op as u8, byte);
        }
        assert!(OpCode::try_from(0xFF).is_err());
    }

    #[test]
    fn jump_operands_are_two_bytes() {
        assert_eq!(OpCode::Jump.operand_len(), 2);
        assert_eq!(OpCode::Loop.operand_len(), 2);
        assert_eq!(OpCode::Try.operand_len(), 6);
        assert_eq!(OpCode::ForLoop.operand_len(), 4);
        assert_eq!(OpCode::Pop.operand_len(), 0);
    }
}
