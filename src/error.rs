//! Error types for the code generator
//!
//! Lowering a well-formed block is total apart from the few conditions below.
//! Any of them aborts compilation of the whole unit; there is no partial
//! prototype.

/// Result type for code generation
pub type CompileResult<T> = Result<T, CompileError>;

/// Errors that can occur while lowering a block to bytecode
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CompileError {
    /// Labels and gotos have no lowering
    #[error("line {line}: {construct} statements are not supported")]
    UnsupportedConstruct {
        /// Which construct was found (`label` or `goto`)
        construct: &'static str,
        /// Source line of the statement
        line: u32,
    },

    /// A `break` with no enclosing loop
    #[error("line {line}: <break> not inside a loop")]
    BreakOutsideLoop {
        /// Source line of the `break`
        line: u32,
    },

    /// The function needs more live registers than the VM frame allows
    #[error("line {line}: function or expression needs more than {limit} registers")]
    TooManyRegisters {
        /// Configured register limit
        limit: usize,
        /// Line being compiled when the limit was hit
        line: u32,
    },

    /// A closure captures more outer variables than an upvalue index holds
    #[error("line {line}: function captures more than {limit} upvalues")]
    TooManyUpvalues {
        limit: usize,
        line: u32,
    },

    /// A jump offset does not fit in sBx
    #[error("line {line}: control structure too long")]
    JumpTooLong { line: u32 },

    /// A global name was used but no `_ENV` is visible
    #[error("line {line}: global access with no _ENV in scope")]
    MissingEnv { line: u32 },
}

impl CompileError {
    /// Source line the error was raised at
    pub fn line(&self) -> u32 {
        match self {
            CompileError::UnsupportedConstruct { line, .. }
            | CompileError::BreakOutsideLoop { line }
            | CompileError::TooManyRegisters { line, .. }
            | CompileError::TooManyUpvalues { line, .. }
            | CompileError::JumpTooLong { line }
            | CompileError::MissingEnv { line } => *line,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_messages() {
        let err = CompileError::UnsupportedConstruct { construct: "goto", line: 7 };
        assert_eq!(err.to_string(), "line 7: goto statements are not supported");
        assert_eq!(err.line(), 7);

        let err = CompileError::TooManyRegisters { limit: 255, line: 3 };
        assert!(err.to_string().contains("255 registers"));

        let err = CompileError::JumpTooLong { line: 12 };
        assert_eq!(err.to_string(), "line 12: control structure too long");
        assert_eq!(CompileError::MissingEnv { line: 4 }.line(), 4);
    }
}
