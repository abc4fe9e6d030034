//! Function Compile State
//!
//! One [`FuncState`] exists per function being compiled. It owns the register
//! allocator, the lexical scope stack with pending `break` jumps, the local
//! variable table, the constant pool, upvalue descriptors and the instruction
//! buffer. Lowering routines receive it by `&mut` and must leave the register
//! counter where they found it unless they are declaring locals.

use std::collections::HashMap;
use std::ops::Range;

use crate::ast::{BinaryOperator, UnaryOperator};
use crate::config::CompilerConfig;
use crate::error::{CompileError, CompileResult};
use crate::opcode::{Instruction, OpCode};
use crate::proto::{Constant, Prototype};

/// Upvalues one function may capture
pub const MAX_UPVALUES: usize = 255;

/// Register allocator with stack discipline
///
/// Registers are handed out in increasing order and must be given back in
/// reverse order. `max` is the high-water mark that becomes the frame size.
#[derive(Debug, Clone)]
pub struct RegisterAllocator {
    /// Registers currently live
    used: usize,

    /// Most registers ever live at once
    max: usize,

    /// Frame size limit
    limit: usize,
}

impl RegisterAllocator {
    /// Create an allocator with a frame size limit
    pub fn new(limit: usize) -> Self {
        RegisterAllocator { used: 0, max: 0, limit }
    }

    pub fn used(&self) -> usize {
        self.used
    }

    pub fn max(&self) -> usize {
        self.max
    }

    /// Allocate the next free register, `None` when the frame is full
    pub fn allocate(&mut self) -> Option<usize> {
        if self.used >= self.limit {
            return None;
        }
        let reg = self.used;
        self.used += 1;
        self.max = self.max.max(self.used);
        Some(reg)
    }

    /// Reserve `n` contiguous registers, returning the first
    pub fn allocate_run(&mut self, n: usize) -> Option<usize> {
        if self.used + n > self.limit {
            return None;
        }
        let first = self.used;
        self.used += n;
        self.max = self.max.max(self.used);
        Some(first)
    }

    /// Release the most recently allocated register
    pub fn release(&mut self, reg: usize) {
        debug_assert_eq!(reg + 1, self.used, "register {} released out of order", reg);
        self.free(1);
    }

    /// Release the top `n` registers
    pub fn free(&mut self, n: usize) {
        debug_assert!(n <= self.used, "freeing {} of {} live registers", n, self.used);
        self.used = self.used.saturating_sub(n);
    }

    /// Release everything above `mark`
    pub fn free_registers_to(&mut self, mark: usize) {
        debug_assert!(mark <= self.used, "register mark {} above live count {}", mark, self.used);
        self.used = mark;
    }
}

/// A declared local variable
#[derive(Debug, Clone, PartialEq)]
pub struct LocalVarInfo {
    /// Source name; hidden loop state uses names starting with `(`
    pub name: String,

    /// Register holding the variable
    pub slot: usize,

    /// First PC where the register holds the variable
    pub start_pc: usize,

    /// First PC where it no longer does
    pub end_pc: usize,

    /// Referenced as an upvalue by a nested function
    pub captured: bool,

    /// Shadowed declaration of the same name
    prev: Option<usize>,
}

impl LocalVarInfo {
    fn is_hidden(&self) -> bool {
        self.name.starts_with('(')
    }
}

/// Upvalue descriptor of the function being compiled
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpvalueInfo {
    /// Variable name
    pub name: String,

    /// Captured from the enclosing function's registers
    pub in_stack: bool,

    /// Register in the enclosing function, or its upvalue index
    pub index: usize,
}

/// One lexical scope
#[derive(Debug, Clone, Default)]
struct ScopeFrame {
    /// Indexes into `local_vars` declared in this scope
    locals: Vec<usize>,

    /// Pending break jumps; `None` for non-loop scopes
    breaks: Option<Vec<PendingBreak>>,
}

/// A `break` jump waiting for the end of its loop
#[derive(Debug, Clone, Copy)]
struct PendingBreak {
    pc: usize,

    /// Innermost scope the jump still leaves on its way out
    depth: usize,

    /// A operand collected from the blocks left so far, 0 when none
    close_from: usize,
}

/// Combine two JMP close levels, 0 meaning "nothing to close"
fn lowest_close(a: usize, b: usize) -> usize {
    match (a, b) {
        (0, x) | (x, 0) => x,
        (x, y) => x.min(y),
    }
}

/// Per-function compile state
#[derive(Debug)]
pub struct FuncState {
    pub(crate) config: CompilerConfig,

    /// Enclosing function, owned while this one is compiled
    pub(crate) parent: Option<Box<FuncState>>,

    pub(crate) regs: RegisterAllocator,
    scopes: Vec<ScopeFrame>,

    /// Every local ever declared, in declaration order
    pub(crate) local_vars: Vec<LocalVarInfo>,

    /// Visible locals by name
    active: HashMap<String, usize>,

    pub(crate) upvalues: Vec<UpvalueInfo>,
    pub(crate) constants: Vec<Constant>,
    pub(crate) protos: Vec<Prototype>,
    pub(crate) code: Vec<Instruction>,
    pub(crate) line_info: Vec<u32>,

    /// Line of the construct currently being lowered
    pub line: u32,

    pub(crate) is_main: bool,
    pub(crate) num_params: usize,
    pub(crate) is_vararg: bool,
    pub(crate) line_defined: u32,
    pub(crate) last_line_defined: u32,
}

impl Default for FuncState {
    fn default() -> Self {
        FuncState::new(CompilerConfig::default())
    }
}

impl FuncState {
    /// Create a state with no registers in use and a single root scope
    pub fn new(config: CompilerConfig) -> Self {
        let regs = RegisterAllocator::new(config.max_registers);
        FuncState {
            config,
            parent: None,
            regs,
            scopes: vec![ScopeFrame::default()],
            local_vars: Vec::new(),
            active: HashMap::new(),
            upvalues: Vec::new(),
            constants: Vec::new(),
            protos: Vec::new(),
            code: Vec::new(),
            line_info: Vec::new(),
            line: 0,
            is_main: false,
            num_params: 0,
            is_vararg: false,
            line_defined: 0,
            last_line_defined: 0,
        }
    }

    /// Create the state for a main chunk: vararg, with `_ENV` as upvalue 0
    pub fn main_chunk(config: CompilerConfig) -> Self {
        let mut fs = FuncState::new(config);
        fs.is_main = true;
        fs.is_vararg = true;
        fs.upvalues.push(UpvalueInfo { name: "_ENV".to_string(), in_stack: true, index: 0 });
        fs
    }

    pub fn config(&self) -> &CompilerConfig {
        &self.config
    }

    /// Run `f` on a fresh child state linked to this one, then hand the
    /// child back. This state is restored even if `f` fails.
    pub fn nest<R>(
        &mut self,
        f: impl FnOnce(&mut FuncState) -> CompileResult<R>,
    ) -> CompileResult<(FuncState, R)> {
        let mut child = FuncState::new(self.config.clone());
        child.line = self.line;
        child.parent = Some(Box::new(std::mem::take(self)));
        let outcome = f(&mut child);
        if let Some(parent) = child.parent.take() {
            *self = *parent;
        }
        outcome.map(|r| (child, r))
    }

    /* registers */

    pub fn used_regs(&self) -> usize {
        self.regs.used()
    }

    pub fn max_regs(&self) -> usize {
        self.regs.max()
    }

    pub fn alloc_reg(&mut self) -> CompileResult<usize> {
        let line = self.line;
        self.regs.allocate().ok_or(CompileError::TooManyRegisters {
            limit: self.config.max_registers,
            line,
        })
    }

    pub fn alloc_regs(&mut self, n: usize) -> CompileResult<usize> {
        let line = self.line;
        self.regs.allocate_run(n).ok_or(CompileError::TooManyRegisters {
            limit: self.config.max_registers,
            line,
        })
    }

    pub fn free_reg(&mut self) {
        self.regs.free(1);
    }

    pub fn free_regs(&mut self, n: usize) {
        self.regs.free(n);
    }

    pub fn free_registers_to(&mut self, mark: usize) {
        self.regs.free_registers_to(mark);
    }

    /* scopes */

    pub fn scope_depth(&self) -> usize {
        self.scopes.len()
    }

    pub fn enter_scope(&mut self, breakable: bool) {
        self.scopes.push(ScopeFrame {
            locals: Vec::new(),
            breaks: if breakable { Some(Vec::new()) } else { None },
        });
        log::trace!("enter scope depth={} breakable={}", self.scopes.len(), breakable);
    }

    /// Pop the innermost scope. Its locals end at `end_pc`; its pending
    /// breaks are pointed at the next instruction to be emitted.
    ///
    /// Breaks leaving a non-loop block that has captured locals close those
    /// locals too, so the close level travels with each pending break.
    pub fn exit_scope(&mut self, end_pc: usize) -> CompileResult<()> {
        let close_from = self.jmp_arg_a();
        let depth = self.scopes.len().saturating_sub(1);
        let frame = match self.scopes.pop() {
            Some(frame) => frame,
            None => return Ok(()),
        };

        match frame.breaks {
            Some(breaks) => {
                let target = self.pc();
                for brk in breaks {
                    let a = lowest_close(brk.close_from, close_from);
                    let sbx = self.jump_offset(brk.pc, target)?;
                    self.code[brk.pc] = Instruction::asbx(OpCode::Jmp, a as u32, sbx);
                    log::trace!("patched break at pc={} -> {} close={}", brk.pc, target, a);
                }
            }
            None => {
                let enclosing = self.scopes.iter_mut().rev().find_map(|f| f.breaks.as_mut());
                if let Some(breaks) = enclosing {
                    for brk in breaks.iter_mut().filter(|b| b.depth >= depth) {
                        brk.depth = depth.saturating_sub(1);
                        brk.close_from = lowest_close(brk.close_from, close_from);
                    }
                }
            }
        }

        for &idx in frame.locals.iter().rev() {
            let var = &mut self.local_vars[idx];
            var.end_pc = end_pc.max(var.start_pc);
            let (name, prev, slot) = (var.name.clone(), var.prev, var.slot);
            match prev {
                Some(prev) => {
                    self.active.insert(name, prev);
                }
                None => {
                    self.active.remove(&name);
                }
            }
            self.regs.release(slot);
        }
        log::trace!("exit scope depth={} end_pc={}", depth + 1, end_pc);
        Ok(())
    }

    /// Record a `break` jump with the innermost enclosing loop
    pub fn add_break_jump(&mut self, pc: usize, line: u32) -> CompileResult<()> {
        let depth = self.scopes.len().saturating_sub(1);
        for frame in self.scopes.iter_mut().rev() {
            if let Some(breaks) = frame.breaks.as_mut() {
                breaks.push(PendingBreak { pc, depth, close_from: 0 });
                return Ok(());
            }
        }
        Err(CompileError::BreakOutsideLoop { line })
    }

    /// A operand for a JMP leaving the innermost scope: one past the lowest
    /// captured slot, or 0 when nothing there was captured
    pub fn jmp_arg_a(&self) -> usize {
        let frame = match self.scopes.last() {
            Some(frame) => frame,
            None => return 0,
        };
        let vars = frame.locals.iter().map(|&i| &self.local_vars[i]);
        if !vars.clone().any(|v| v.captured) {
            return 0;
        }
        vars.filter(|v| !v.is_hidden())
            .map(|v| v.slot)
            .min()
            .map_or(0, |slot| slot + 1)
    }

    /// Close upvalues of the innermost scope before control leaves it
    pub fn close_upvalues(&mut self, line: u32) {
        let a = self.jmp_arg_a();
        if a > 0 {
            self.emit_jmp(line, a, 0);
        }
    }

    /* locals */

    /// Declare a local in the innermost scope, claiming the next register
    pub fn add_local(&mut self, name: &str, start_pc: usize) -> CompileResult<usize> {
        let slot = self.alloc_reg()?;
        let idx = self.local_vars.len();
        let prev = self.active.insert(name.to_string(), idx);
        self.local_vars.push(LocalVarInfo {
            name: name.to_string(),
            slot,
            start_pc,
            end_pc: start_pc,
            captured: false,
            prev,
        });
        if let Some(frame) = self.scopes.last_mut() {
            frame.locals.push(idx);
        }
        Ok(slot)
    }

    pub fn slot_of_local(&self, name: &str) -> Option<usize> {
        self.active.get(name).map(|&idx| self.local_vars[idx].slot)
    }

    /// Number of locals declared so far; bounds for [`Self::extend_end_pc`]
    pub fn local_count(&self) -> usize {
        self.local_vars.len()
    }

    /// Push the end PC of already closed locals further out
    pub fn extend_end_pc(&mut self, locals: Range<usize>, delta: usize) {
        for var in &mut self.local_vars[locals] {
            var.end_pc += delta;
        }
    }

    pub fn local_vars(&self) -> &[LocalVarInfo] {
        &self.local_vars
    }

    /* upvalues and constants */

    /// Resolve `name` as an upvalue, capturing it from enclosing functions.
    /// `Ok(None)` means no enclosing function declares it.
    pub fn index_of_upvalue(&mut self, name: &str) -> CompileResult<Option<usize>> {
        if let Some(idx) = self.upvalues.iter().position(|u| u.name == name) {
            return Ok(Some(idx));
        }
        let line = self.line;
        let parent = match self.parent.as_deref_mut() {
            Some(parent) => parent,
            None => return Ok(None),
        };

        let (in_stack, index) = match parent.active.get(name).copied() {
            Some(local) => {
                let var = &mut parent.local_vars[local];
                var.captured = true;
                (true, var.slot)
            }
            None => match parent.index_of_upvalue(name)? {
                Some(idx) => (false, idx),
                None => return Ok(None),
            },
        };
        if self.upvalues.len() >= MAX_UPVALUES {
            return Err(CompileError::TooManyUpvalues { limit: MAX_UPVALUES, line });
        }
        self.upvalues.push(UpvalueInfo { name: name.to_string(), in_stack, index });
        Ok(Some(self.upvalues.len() - 1))
    }

    /// Index of `k` in the constant pool, adding it if new
    pub fn index_of_constant(&mut self, k: Constant) -> usize {
        if let Some(idx) = self.constants.iter().position(|c| *c == k) {
            return idx;
        }
        self.constants.push(k);
        self.constants.len() - 1
    }

    /* instructions */

    /// PC the next emitted instruction will occupy
    pub fn pc(&self) -> usize {
        self.code.len()
    }

    pub fn code(&self) -> &[Instruction] {
        &self.code
    }

    /// Append an instruction, returning its PC
    pub fn emit(&mut self, line: u32, inst: Instruction) -> usize {
        self.code.push(inst);
        self.line_info.push(line);
        self.code.len() - 1
    }

    pub fn emit_abc(&mut self, line: u32, op: OpCode, a: usize, b: usize, c: usize) -> usize {
        self.emit(line, Instruction::abc(op, a as u32, b as u32, c as u32))
    }

    pub fn emit_abx(&mut self, line: u32, op: OpCode, a: usize, bx: usize) -> usize {
        self.emit(line, Instruction::abx(op, a as u32, bx as u32))
    }

    pub fn emit_asbx(&mut self, line: u32, op: OpCode, a: usize, sbx: i32) -> usize {
        self.emit(line, Instruction::asbx(op, a as u32, sbx))
    }

    /// sBx for a jump at `from` landing on `target`
    fn jump_offset(&self, from: usize, target: usize) -> CompileResult<i32> {
        let sbx = target as i64 - from as i64 - 1;
        if sbx.abs() > Instruction::MAXARG_SBX as i64 {
            return Err(CompileError::JumpTooLong { line: self.line });
        }
        Ok(sbx as i32)
    }

    /// Set the offset of the jump at `pc` so that it lands on `target`
    pub fn fix_jump(&mut self, pc: usize, target: usize) -> CompileResult<()> {
        let sbx = self.jump_offset(pc, target)?;
        self.code[pc].set_sbx(sbx);
        log::trace!("patched jump at pc={} -> {}", pc, target);
        Ok(())
    }

    /// Offset for an instruction emitted next that must land on `target`
    pub fn offset_to(&self, target: usize) -> CompileResult<i32> {
        self.jump_offset(self.pc(), target)
    }

    pub fn emit_move(&mut self, line: u32, a: usize, b: usize) {
        self.emit_abc(line, OpCode::Move, a, b, 0);
    }

    pub fn emit_load_nil(&mut self, line: u32, a: usize, n: usize) {
        self.emit_abc(line, OpCode::LoadNil, a, n - 1, 0);
    }

    pub fn emit_load_bool(&mut self, line: u32, a: usize, b: usize, c: usize) {
        self.emit_abc(line, OpCode::LoadBool, a, b, c);
    }

    pub fn emit_load_k(&mut self, line: u32, a: usize, k: Constant) {
        let idx = self.index_of_constant(k);
        if idx <= Instruction::MAXARG_BX as usize {
            self.emit_abx(line, OpCode::LoadK, a, idx);
        } else {
            self.emit_abx(line, OpCode::LoadKx, a, 0);
            self.emit(line, Instruction::ax(OpCode::ExtraArg, idx as u32));
        }
    }

    /// `n` of `MULT_RET` loads every vararg
    pub fn emit_vararg(&mut self, line: u32, a: usize, n: i32) {
        self.emit_abc(line, OpCode::VarArg, a, (n + 1) as usize, 0);
    }

    pub fn emit_closure(&mut self, line: u32, a: usize, bx: usize) {
        self.emit_abx(line, OpCode::Closure, a, bx);
    }

    pub fn emit_new_table(&mut self, line: u32, a: usize, n_arr: usize, n_rec: usize) {
        self.emit_abc(line, OpCode::NewTable, a, int2fb(n_arr), int2fb(n_rec));
    }

    pub fn emit_set_list(&mut self, line: u32, a: usize, b: usize, c: usize) {
        self.emit_abc(line, OpCode::SetList, a, b, c);
    }

    pub fn emit_get_table(&mut self, line: u32, a: usize, b: usize, c: usize) {
        self.emit_abc(line, OpCode::GetTable, a, b, c);
    }

    pub fn emit_set_table(&mut self, line: u32, a: usize, b: usize, c: usize) {
        self.emit_abc(line, OpCode::SetTable, a, b, c);
    }

    pub fn emit_get_upval(&mut self, line: u32, a: usize, b: usize) {
        self.emit_abc(line, OpCode::GetUpval, a, b, 0);
    }

    pub fn emit_set_upval(&mut self, line: u32, a: usize, b: usize) {
        self.emit_abc(line, OpCode::SetUpval, a, b, 0);
    }

    pub fn emit_get_tab_up(&mut self, line: u32, a: usize, b: usize, c: usize) {
        self.emit_abc(line, OpCode::GetTabUp, a, b, c);
    }

    pub fn emit_set_tab_up(&mut self, line: u32, a: usize, b: usize, c: usize) {
        self.emit_abc(line, OpCode::SetTabUp, a, b, c);
    }

    /// Arguments and results use `MULT_RET` for "up to the top"
    pub fn emit_call(&mut self, line: u32, a: usize, n_args: i32, n_ret: i32) {
        self.emit_abc(line, OpCode::Call, a, (n_args + 1) as usize, (n_ret + 1) as usize);
    }

    pub fn emit_tail_call(&mut self, line: u32, a: usize, n_args: i32) {
        self.emit_abc(line, OpCode::TailCall, a, (n_args + 1) as usize, 0);
    }

    pub fn emit_return(&mut self, line: u32, a: usize, n: i32) {
        self.emit_abc(line, OpCode::Return, a, (n + 1) as usize, 0);
    }

    pub fn emit_for_prep(&mut self, line: u32, a: usize, sbx: i32) -> usize {
        self.emit_asbx(line, OpCode::ForPrep, a, sbx)
    }

    pub fn emit_for_loop(&mut self, line: u32, a: usize, sbx: i32) -> usize {
        self.emit_asbx(line, OpCode::ForLoop, a, sbx)
    }

    pub fn emit_tfor_call(&mut self, line: u32, a: usize, c: usize) {
        self.emit_abc(line, OpCode::TForCall, a, 0, c);
    }

    pub fn emit_tfor_loop(&mut self, line: u32, a: usize, sbx: i32) -> usize {
        self.emit_asbx(line, OpCode::TForLoop, a, sbx)
    }

    pub fn emit_jmp(&mut self, line: u32, a: usize, sbx: i32) -> usize {
        self.emit_asbx(line, OpCode::Jmp, a, sbx)
    }

    pub fn emit_test(&mut self, line: u32, a: usize, c: usize) {
        self.emit_abc(line, OpCode::Test, a, 0, c);
    }

    pub fn emit_test_set(&mut self, line: u32, a: usize, b: usize, c: usize) {
        self.emit_abc(line, OpCode::TestSet, a, b, c);
    }

    pub fn emit_self(&mut self, line: u32, a: usize, b: usize, c: usize) {
        self.emit_abc(line, OpCode::SelfOp, a, b, c);
    }

    pub fn emit_unary_op(&mut self, line: u32, op: UnaryOperator, a: usize, b: usize) {
        let op = match op {
            UnaryOperator::Minus => OpCode::Unm,
            UnaryOperator::Not => OpCode::Not,
            UnaryOperator::Len => OpCode::Len,
            UnaryOperator::BNot => OpCode::BNot,
        };
        self.emit_abc(line, op, a, b, 0);
    }

    /// Arithmetic and bitwise operators map onto one instruction; comparisons
    /// materialise a boolean with a skip and two LOADBOOLs
    pub fn emit_binary_op(&mut self, line: u32, op: BinaryOperator, a: usize, b: usize, c: usize) {
        let arith = match op {
            BinaryOperator::Add => Some(OpCode::Add),
            BinaryOperator::Sub => Some(OpCode::Sub),
            BinaryOperator::Mul => Some(OpCode::Mul),
            BinaryOperator::Div => Some(OpCode::Div),
            BinaryOperator::IDiv => Some(OpCode::IDiv),
            BinaryOperator::Mod => Some(OpCode::Mod),
            BinaryOperator::Pow => Some(OpCode::Pow),
            BinaryOperator::BAnd => Some(OpCode::BAnd),
            BinaryOperator::BOr => Some(OpCode::BOr),
            BinaryOperator::BXor => Some(OpCode::BXor),
            BinaryOperator::Shl => Some(OpCode::Shl),
            BinaryOperator::Shr => Some(OpCode::Shr),
            _ => None,
        };
        if let Some(code) = arith {
            self.emit_abc(line, code, a, b, c);
            return;
        }

        match op {
            BinaryOperator::Eq => self.emit_abc(line, OpCode::Eq, 1, b, c),
            BinaryOperator::Ne => self.emit_abc(line, OpCode::Eq, 0, b, c),
            BinaryOperator::Lt => self.emit_abc(line, OpCode::Lt, 1, b, c),
            BinaryOperator::Gt => self.emit_abc(line, OpCode::Lt, 1, c, b),
            BinaryOperator::Le => self.emit_abc(line, OpCode::Le, 1, b, c),
            BinaryOperator::Ge => self.emit_abc(line, OpCode::Le, 1, c, b),
            // short-circuit operators are lowered in expr
            _ => return,
        };
        self.emit_jmp(line, 0, 1);
        self.emit_load_bool(line, a, 0, 1);
        self.emit_load_bool(line, a, 1, 0);
    }
}

/// Encode a table size hint as a "floating point byte" (eeeeexxx)
pub fn int2fb(mut x: usize) -> usize {
    if x < 8 {
        return x;
    }
    let mut e = 0;
    while x >= 8 << 4 {
        x = (x + 0xf) >> 4;
        e += 4;
    }
    while x >= 8 << 1 {
        x = (x + 1) >> 1;
        e += 1;
    }
    ((e + 1) << 3) | (x - 8)
}
