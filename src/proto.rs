//! Function prototypes
//!
//! The frozen output of compiling one function: code, constants, nested
//! prototypes and debug tables, ready for a bytecode serializer.

use crate::ast::Block;
use crate::config::CompilerConfig;
use crate::error::CompileResult;
use crate::func_state::FuncState;
use crate::opcode::Instruction;
use crate::stat;

/// Constant pool entry
#[derive(Debug, Clone, PartialEq)]
pub enum Constant {
    Nil,
    Boolean(bool),
    Integer(i64),
    Float(f64),
    String(String),
}

/// Upvalue descriptor
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Upvalue {
    /// Captured from the enclosing function's registers
    pub in_stack: bool,

    /// Register in the enclosing function, or its upvalue index
    pub index: u8,

    /// Debug name, empty when stripped
    pub name: String,
}

/// Local variable debug entry
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalVar {
    pub name: String,

    /// Register the variable lives in
    pub slot: usize,

    /// First PC where the variable is live
    pub start_pc: usize,

    /// First PC where it is dead
    pub end_pc: usize,
}

/// Compiled function
#[derive(Debug, Clone, PartialEq)]
pub struct Prototype {
    pub source: String,
    pub line_defined: u32,
    pub last_line_defined: u32,
    pub num_params: u8,
    pub is_vararg: bool,

    /// Frame size: the register high-water mark, at least 2
    pub max_stack_size: u8,

    pub code: Vec<Instruction>,
    pub constants: Vec<Constant>,
    pub upvalues: Vec<Upvalue>,
    pub protos: Vec<Prototype>,

    /// Source line per instruction, empty when stripped
    pub line_info: Vec<u32>,

    /// Locals table, empty when stripped
    pub local_vars: Vec<LocalVar>,
}

impl Prototype {
    /// Source line of the instruction at `pc`, 0 when unknown
    pub fn line_at(&self, pc: usize) -> u32 {
        self.line_info.get(pc).copied().unwrap_or(0)
    }
}

impl FuncState {
    /// Freeze this state. The register high-water mark and the locals table
    /// become read-only from here on.
    pub fn into_prototype(self) -> Prototype {
        let strip = self.config.strip_debug;
        let proto = Prototype {
            source: if self.is_main {
                self.config.chunk_name.clone()
            } else {
                String::new()
            },
            line_defined: self.line_defined,
            last_line_defined: self.last_line_defined,
            num_params: self.num_params as u8,
            is_vararg: self.is_vararg,
            max_stack_size: self.regs.max().max(2) as u8,
            code: self.code,
            constants: self.constants,
            upvalues: self
                .upvalues
                .into_iter()
                .map(|u| Upvalue {
                    in_stack: u.in_stack,
                    // a register slot or a parent upvalue index, both capped at 255
                    index: u.index as u8,
                    name: if strip { String::new() } else { u.name },
                })
                .collect(),
            protos: self.protos,
            line_info: if strip { Vec::new() } else { self.line_info },
            local_vars: if strip {
                Vec::new()
            } else {
                self.local_vars
                    .into_iter()
                    .map(|v| LocalVar {
                        name: v.name,
                        slot: v.slot,
                        start_pc: v.start_pc,
                        end_pc: v.end_pc,
                    })
                    .collect()
            },
        };
        log::debug!(
            "finished function <{}:{}> code={} constants={} upvalues={} stack={}",
            proto.source,
            proto.line_defined,
            proto.code.len(),
            proto.constants.len(),
            proto.upvalues.len(),
            proto.max_stack_size
        );
        proto
    }
}

/// Compile a main chunk
///
/// The chunk is a vararg function whose only upvalue is `_ENV`. Any error
/// aborts the whole unit.
pub fn compile(block: &Block, config: &CompilerConfig) -> CompileResult<Prototype> {
    let mut fs = FuncState::main_chunk(config.clone());
    fs.last_line_defined = block.last_line;
    stat::compile_block(&mut fs, block)?;
    fs.exit_scope(fs.pc() + 1)?;
    fs.emit_return(block.last_line, 0, 0);

    let proto = fs.into_prototype();
    if log::log_enabled!(log::Level::Trace) {
        log::trace!("{}", crate::disasm::disassemble(&proto));
    }
    Ok(proto)
}
