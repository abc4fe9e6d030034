//! Lua code generator
//!
//! Lowers a parsed Lua chunk into Lua 5.3 register-machine prototypes.
//! Statement lowering lives in [`stat`], expression lowering in [`expr`],
//! and the per-function state both share in [`func_state`].

pub mod ast;
pub mod config;
pub mod disasm;
pub mod error;
pub mod expr;
pub mod func_state;
pub mod opcode;
pub mod proto;
pub mod stat;

// Re-export commonly used types
pub use config::CompilerConfig;
pub use error::{CompileError, CompileResult};
pub use func_state::FuncState;
pub use opcode::{Instruction, OpCode};
pub use proto::{compile, Constant, Prototype};
