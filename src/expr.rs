//! Expression code generation
//!
//! Turns a single expression into instructions that leave its values in
//! registers. Statement lowering only relies on three entry points:
//! [`compile_exp`], [`exp_to_operand`] and [`compile_function_def`].

use crate::ast::{
    BinaryOperator, Expression, FunctionCall, FunctionDef, TableConstructor, TableField,
    UnaryOperator,
};
use crate::error::{CompileError, CompileResult};
use crate::func_state::FuncState;
use crate::opcode::{Instruction, OpCode};
use crate::proto::Constant;
use crate::stat;

/// Result or argument count meaning "all of them"
pub const MULT_RET: i32 = -1;

/// Table fields flushed per SETLIST
const FIELDS_PER_FLUSH: usize = 50;

/// Operand kinds a caller accepts from [`exp_to_operand`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ArgKinds(u8);

impl ArgKinds {
    pub const CONST: ArgKinds = ArgKinds(1);
    pub const REG: ArgKinds = ArgKinds(2);
    pub const UPVAL: ArgKinds = ArgKinds(4);
    /// Register or constant
    pub const RK: ArgKinds = ArgKinds(1 | 2);
    /// Register or upvalue
    pub const RU: ArgKinds = ArgKinds(2 | 4);

    fn contains(self, other: ArgKinds) -> bool {
        self.0 & other.0 != 0
    }
}

/// Where an operand's value can be found
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operand {
    Register(usize),
    /// Constant pool index
    Constant(usize),
    Upvalue(usize),
}

impl Operand {
    /// Encode as an instruction field, constants as RK
    pub fn rk(self) -> usize {
        match self {
            Operand::Register(r) | Operand::Upvalue(r) => r,
            Operand::Constant(k) => Instruction::rk_constant(k) as usize,
        }
    }
}

/// Compile `exp` so that `want` values start at register `a`
///
/// `want` only matters for calls and `...`; `MULT_RET` keeps every value.
pub fn compile_exp(fs: &mut FuncState, exp: &Expression, a: usize, want: i32) -> CompileResult<()> {
    let line = fs.line;
    match exp {
        Expression::Nil => fs.emit_load_nil(line, a, want.max(1) as usize),
        Expression::False => fs.emit_load_bool(line, a, 0, 0),
        Expression::True => fs.emit_load_bool(line, a, 1, 0),
        Expression::Integer(i) => fs.emit_load_k(line, a, Constant::Integer(*i)),
        Expression::Float(f) => fs.emit_load_k(line, a, Constant::Float(*f)),
        Expression::String(s) => fs.emit_load_k(line, a, Constant::String(s.clone())),
        Expression::Vararg => fs.emit_vararg(line, a, want),
        Expression::Parens(inner) => compile_exp(fs, inner, a, 1)?,
        Expression::Name(name) => compile_name(fs, name, a)?,
        Expression::Index { prefix, key } => compile_index(fs, prefix, key, a)?,
        Expression::Call(call) => compile_call(fs, call, a, want)?,
        Expression::Function(def) => compile_function_def(fs, def, a)?,
        Expression::Table(table) => compile_table(fs, table, a)?,
        Expression::Unary { op, operand } => compile_unary(fs, *op, operand, a)?,
        Expression::Binary { op, left, right } => compile_binary(fs, *op, left, right, a)?,
        Expression::Concat(exps) => compile_concat(fs, exps, a)?,
    }
    Ok(())
}

/// Get `exp` as an operand of one of `kinds`, only taking a fresh register
/// when it is not already a usable local, upvalue or small constant
pub fn exp_to_operand(fs: &mut FuncState, exp: &Expression, kinds: ArgKinds) -> CompileResult<Operand> {
    if kinds.contains(ArgKinds::CONST) {
        let k = match exp {
            Expression::Nil => Some(Constant::Nil),
            Expression::False => Some(Constant::Boolean(false)),
            Expression::True => Some(Constant::Boolean(true)),
            Expression::Integer(i) => Some(Constant::Integer(*i)),
            Expression::Float(f) => Some(Constant::Float(*f)),
            Expression::String(s) => Some(Constant::String(s.clone())),
            _ => None,
        };
        if let Some(k) = k {
            let idx = fs.index_of_constant(k);
            if idx <= fs.config().rk_max_constant {
                return Ok(Operand::Constant(idx));
            }
        }
    }

    if let Expression::Name(name) = exp {
        if kinds.contains(ArgKinds::REG) {
            if let Some(r) = fs.slot_of_local(name) {
                return Ok(Operand::Register(r));
            }
        }
        if kinds.contains(ArgKinds::UPVAL) {
            if let Some(idx) = fs.index_of_upvalue(name)? {
                return Ok(Operand::Upvalue(idx));
            }
        }
    }

    let a = fs.alloc_reg()?;
    compile_exp(fs, exp, a, 1)?;
    Ok(Operand::Register(a))
}

/// Compile a nested function into a child prototype and load its closure
/// into register `a`
pub fn compile_function_def(fs: &mut FuncState, def: &FunctionDef, a: usize) -> CompileResult<()> {
    let (child, ()) = fs.nest(|child| {
        child.line = def.line;
        child.line_defined = def.line;
        child.last_line_defined = def.last_line;
        child.num_params = def.params.len();
        child.is_vararg = def.is_vararg;
        for param in &def.params {
            child.add_local(param, 0)?;
        }
        stat::compile_block(child, &def.block)?;
        child.exit_scope(child.pc() + 1)?;
        child.emit_return(def.last_line, 0, 0);
        Ok(())
    })?;

    let bx = fs.protos.len();
    fs.protos.push(child.into_prototype());
    fs.emit_closure(def.last_line, a, bx);
    Ok(())
}

/// Compile a call with its function in register `a`, keeping `want` results
pub fn compile_call(fs: &mut FuncState, call: &FunctionCall, a: usize, want: i32) -> CompileResult<()> {
    let n_args = prepare_call(fs, call, a)?;
    fs.emit_call(call.line, a, n_args, want);
    Ok(())
}

/// Compile `return f(...)`
pub fn compile_tail_call(fs: &mut FuncState, call: &FunctionCall, a: usize) -> CompileResult<()> {
    let n_args = prepare_call(fs, call, a)?;
    fs.emit_tail_call(call.line, a, n_args);
    Ok(())
}

/// Load callee, receiver and arguments from `a` upwards; returns the
/// argument count or `MULT_RET` when the last argument expands
fn prepare_call(fs: &mut FuncState, call: &FunctionCall, a: usize) -> CompileResult<i32> {
    let saved_line = fs.line;
    fs.line = call.line;
    let mut n_args = call.args.len() as i32;
    let mut last_expands = false;

    compile_exp(fs, &call.prefix, a, 1)?;
    if let Some(method) = &call.method {
        fs.alloc_reg()?;
        let key = exp_to_operand(fs, &Expression::String(method.clone()), ArgKinds::RK)?;
        fs.emit_self(call.line, a, a, key.rk());
        if let Operand::Register(_) = key {
            fs.free_reg();
        }
    }

    for (i, arg) in call.args.iter().enumerate() {
        let tmp = fs.alloc_reg()?;
        if i == call.args.len() - 1 && arg.is_multi_value() {
            last_expands = true;
            compile_exp(fs, arg, tmp, MULT_RET)?;
        } else {
            compile_exp(fs, arg, tmp, 1)?;
        }
    }
    fs.free_regs(call.args.len());

    if call.method.is_some() {
        fs.free_reg();
        n_args += 1;
    }
    fs.line = saved_line;
    Ok(if last_expands { MULT_RET } else { n_args })
}

fn compile_name(fs: &mut FuncState, name: &str, a: usize) -> CompileResult<()> {
    let line = fs.line;
    if let Some(r) = fs.slot_of_local(name) {
        fs.emit_move(line, a, r);
    } else if let Some(idx) = fs.index_of_upvalue(name)? {
        fs.emit_get_upval(line, a, idx);
    } else {
        let env = env_operand(fs)?;
        let mark = fs.used_regs();
        let key = exp_to_operand(fs, &Expression::String(name.to_string()), ArgKinds::RK)?;
        fs.free_registers_to(mark);
        match env {
            Operand::Upvalue(up) => fs.emit_get_tab_up(line, a, up, key.rk()),
            other => fs.emit_get_table(line, a, other.rk(), key.rk()),
        }
    }
    Ok(())
}

/// Where globals live: a local `_ENV` register or the `_ENV` upvalue
pub fn env_operand(fs: &mut FuncState) -> CompileResult<Operand> {
    if let Some(r) = fs.slot_of_local("_ENV") {
        return Ok(Operand::Register(r));
    }
    match fs.index_of_upvalue("_ENV")? {
        Some(idx) => Ok(Operand::Upvalue(idx)),
        None => Err(CompileError::MissingEnv { line: fs.line }),
    }
}

fn compile_index(fs: &mut FuncState, prefix: &Expression, key: &Expression, a: usize) -> CompileResult<()> {
    let line = fs.line;
    let mark = fs.used_regs();
    let table = exp_to_operand(fs, prefix, ArgKinds::RU)?;
    let key = exp_to_operand(fs, key, ArgKinds::RK)?;
    fs.free_registers_to(mark);

    match table {
        Operand::Upvalue(up) => fs.emit_get_tab_up(line, a, up, key.rk()),
        other => fs.emit_get_table(line, a, other.rk(), key.rk()),
    }
    Ok(())
}

fn compile_table(fs: &mut FuncState, table: &TableConstructor, a: usize) -> CompileResult<()> {
    let line = fs.line;
    let n_fields = table.fields.len();
    let n_arr = table
        .fields
        .iter()
        .filter(|f| matches!(f, TableField::Positional(_)))
        .count();
    let last_expands = matches!(table.fields.last(), Some(TableField::Positional(e)) if e.is_multi_value());

    fs.emit_new_table(line, a, n_arr, n_fields - n_arr);

    let mut arr_idx = 0;
    for (i, field) in table.fields.iter().enumerate() {
        match field {
            TableField::Positional(value) => {
                arr_idx += 1;
                let tmp = fs.alloc_reg()?;
                let expands = i == n_fields - 1 && last_expands;
                compile_exp(fs, value, tmp, if expands { MULT_RET } else { 1 })?;

                if arr_idx % FIELDS_PER_FLUSH == 0 || arr_idx == n_arr {
                    let n = match arr_idx % FIELDS_PER_FLUSH {
                        0 => FIELDS_PER_FLUSH,
                        n => n,
                    };
                    fs.free_regs(n);
                    let batch = (arr_idx - 1) / FIELDS_PER_FLUSH + 1;
                    fs.emit_set_list(line, a, if expands { 0 } else { n }, batch);
                }
            }
            TableField::Keyed { key, value } => {
                let mark = fs.used_regs();
                let b = exp_to_operand(fs, key, ArgKinds::RK)?;
                let c = exp_to_operand(fs, value, ArgKinds::RK)?;
                fs.free_registers_to(mark);
                fs.emit_set_table(line, a, b.rk(), c.rk());
            }
        }
    }
    Ok(())
}

fn compile_unary(fs: &mut FuncState, op: UnaryOperator, operand: &Expression, a: usize) -> CompileResult<()> {
    let line = fs.line;
    let mark = fs.used_regs();
    let b = exp_to_operand(fs, operand, ArgKinds::REG)?;
    fs.emit_unary_op(line, op, a, b.rk());
    fs.free_registers_to(mark);
    Ok(())
}

fn compile_binary(
    fs: &mut FuncState,
    op: BinaryOperator,
    left: &Expression,
    right: &Expression,
    a: usize,
) -> CompileResult<()> {
    let line = fs.line;
    let mark = fs.used_regs();

    if let BinaryOperator::And | BinaryOperator::Or = op {
        let b = exp_to_operand(fs, left, ArgKinds::REG)?;
        fs.free_registers_to(mark);
        let keep_if = if op == BinaryOperator::And { 0 } else { 1 };
        fs.emit_test_set(line, a, b.rk(), keep_if);
        let skip_right = fs.emit_jmp(line, 0, 0);

        let b = exp_to_operand(fs, right, ArgKinds::REG)?;
        fs.free_registers_to(mark);
        fs.emit_move(line, a, b.rk());
        let end = fs.pc();
        fs.fix_jump(skip_right, end)?;
        return Ok(());
    }

    let b = exp_to_operand(fs, left, ArgKinds::RK)?;
    let c = exp_to_operand(fs, right, ArgKinds::RK)?;
    fs.emit_binary_op(line, op, a, b.rk(), c.rk());
    fs.free_registers_to(mark);
    Ok(())
}

fn compile_concat(fs: &mut FuncState, exps: &[Expression], a: usize) -> CompileResult<()> {
    let line = fs.line;
    let first = fs.used_regs();
    for exp in exps {
        let r = fs.alloc_reg()?;
        compile_exp(fs, exp, r, 1)?;
    }
    let last = fs.used_regs() - 1;
    fs.free_registers_to(first);
    fs.emit_abc(line, OpCode::Concat, a, first, last);
    Ok(())
}
