//! Error types for the Tael VM crate.
//!
//! This module provides error handling for compilation and execution,
//! plus the coarse status an embedder receives from `interpret`.

use thiserror::Error;

/// VM and compiler errors.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum VmError {
    /// Compile error with source position.
    #[error("[line {line}] Error{location}: {message}")]
    Compile {
        line: u32,
        location: String,
        message: String,
    },

    /// Runtime error raised by an opcode or a native function.
    #[error("{message}")]
    Runtime { message: String },

    /// A script-level exception is pending on the current thread.
    ///
    /// The payload lives in the thread's exception slot, not here, so that
    /// arbitrary language values can be thrown.
    #[error("exception pending")]
    Exception,

    /// Operand stack exhausted.
    #[error("Stack overflow.")]
    StackOverflow,

    /// Call frame stack exhausted.
    #[error("Stack overflow.")]
    FrameOverflow,

    /// Too many nested exception handlers.
    #[error("Too many nested try blocks.")]
    HandlerOverflow,
}

impl VmError {
    /// Creates a runtime error from a message.
    pub fn runtime(message: impl Into<String>) -> Self {
        VmError::Runtime {
            message: message.into(),
        }
    }
}

/// Result type used throughout the VM.
pub type VmResult<T> = Result<T, VmError>;

/// Coarse outcome of driving a source string through the interpreter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InterpretResult {
    /// The program ran to completion.
    Ok,
    /// The source failed to compile; diagnostics went to stderr.
    CompileError,
    /// An exception escaped every handler; a traceback went to stderr.
    RuntimeError,
}

impl InterpretResult {
    /// Conventional process exit code for a script driver.
    pub fn exit_code(self) -> i32 {
        match self {
            InterpretResult::Ok => 0,
            InterpretResult::CompileError => 65,
            InterpretResult::RuntimeError => 70,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exit_codes_follow_sysexits() {
        assert_eq!(InterpretResult::Ok.exit_code(), 0);
        assert_eq!(InterpretResult::CompileError.exit_code(), 65);
        assert_eq!(InterpretResult::RuntimeError.exit_code(), 70);
    }

    #[test]
    fn runtime_error_displays_bare_message() {
        let err = VmError::runtime("Undefined variable 'x'.");
        assert_eq!(err.to_string(), "Undefined variable 'x'.");
    }
}
