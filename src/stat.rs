//! Statement code generation
//!
//! One lowering routine per statement kind. Every routine leaves the register
//! allocator where it found it, except local declarations, which keep the
//! registers of the locals they introduce.

use crate::ast::{
    AssignTarget, Block, Expression, ForInStatement, ForNumStatement, FunctionCall, IfStatement,
    Statement,
};
use crate::error::{CompileError, CompileResult};
use crate::expr::{self, ArgKinds, Operand, MULT_RET};
use crate::func_state::FuncState;
use crate::proto::Constant;

const FOR_INDEX: &str = "(for index)";
const FOR_LIMIT: &str = "(for limit)";
const FOR_STEP: &str = "(for step)";
const FOR_GENERATOR: &str = "(for generator)";
const FOR_STATE: &str = "(for state)";
const FOR_CONTROL: &str = "(for control)";

/// Compile the statements of a block followed by its return, if any
pub fn compile_block(fs: &mut FuncState, block: &Block) -> CompileResult<()> {
    for statement in &block.statements {
        compile_statement(fs, statement)?;
    }
    if let Some(exps) = &block.return_exps {
        compile_return(fs, exps, block.last_line)?;
    }
    Ok(())
}

/// Compile a single statement
pub fn compile_statement(fs: &mut FuncState, statement: &Statement) -> CompileResult<()> {
    match statement {
        Statement::Empty => Ok(()),
        Statement::Label { line, .. } => {
            Err(CompileError::UnsupportedConstruct { construct: "label", line: *line })
        }
        Statement::Goto { line, .. } => {
            Err(CompileError::UnsupportedConstruct { construct: "goto", line: *line })
        }
        Statement::Break { line } => compile_break(fs, *line),
        Statement::Do(block) => compile_do(fs, block),
        Statement::FunctionCall(call) => compile_call_statement(fs, call),
        Statement::While { condition, block, line } => compile_while(fs, condition, block, *line),
        Statement::Repeat { block, condition, line } => compile_repeat(fs, block, condition, *line),
        Statement::If(stat) => compile_if(fs, stat),
        Statement::ForNum(stat) => compile_for_num(fs, stat),
        Statement::ForIn(stat) => compile_for_in(fs, stat),
        Statement::LocalVarDecl { names, exps, last_line } => {
            let names: Vec<&str> = names.iter().map(String::as_str).collect();
            let exps: Vec<&Expression> = exps.iter().collect();
            declare_locals(fs, &names, &exps, *last_line)
        }
        Statement::Assign { targets, exps, last_line } => compile_assign(fs, targets, exps, *last_line),
        Statement::LocalFunctionDef { name, function } => {
            fs.line = function.line;
            let r = fs.add_local(name, fs.pc() + 1)?;
            expr::compile_function_def(fs, function, r)
        }
    }
}

fn compile_return(fs: &mut FuncState, exps: &[Expression], line: u32) -> CompileResult<()> {
    fs.line = line;
    match exps {
        [] => {
            fs.emit_return(line, 0, 0);
            return Ok(());
        }
        [Expression::Name(name)] => {
            if let Some(r) = fs.slot_of_local(name) {
                fs.emit_return(line, r, 1);
                return Ok(());
            }
        }
        [Expression::Call(call)] => {
            let r = fs.alloc_reg()?;
            expr::compile_tail_call(fs, call, r)?;
            fs.free_reg();
            fs.emit_return(line, r, MULT_RET);
            return Ok(());
        }
        _ => {}
    }

    let expands = exps.last().map_or(false, Expression::is_multi_value);
    for (i, exp) in exps.iter().enumerate() {
        let r = fs.alloc_reg()?;
        let want = if expands && i == exps.len() - 1 { MULT_RET } else { 1 };
        expr::compile_exp(fs, exp, r, want)?;
    }
    fs.free_regs(exps.len());
    let a = fs.used_regs();
    fs.emit_return(line, a, if expands { MULT_RET } else { exps.len() as i32 });
    Ok(())
}

fn compile_break(fs: &mut FuncState, line: u32) -> CompileResult<()> {
    let pc = fs.emit_jmp(line, 0, 0);
    fs.add_break_jump(pc, line)
}

fn compile_do(fs: &mut FuncState, block: &Block) -> CompileResult<()> {
    fs.enter_scope(false);
    compile_block(fs, block)?;
    fs.close_upvalues(block.last_line);
    fs.exit_scope(fs.pc())?;
    Ok(())
}

fn compile_call_statement(fs: &mut FuncState, call: &FunctionCall) -> CompileResult<()> {
    fs.line = call.line;
    let r = fs.alloc_reg()?;
    expr::compile_call(fs, call, r, 0)?;
    fs.free_reg();
    Ok(())
}

/// Evaluate `cond` into a register, then emit TEST and a jump taken when
/// it is false. Returns the PC of that jump.
fn compile_test_jump(fs: &mut FuncState, cond: &Expression, line: u32) -> CompileResult<usize> {
    fs.line = line;
    let mark = fs.used_regs();
    let a = expr::exp_to_operand(fs, cond, ArgKinds::REG)?;
    fs.free_registers_to(mark);
    fs.emit_test(line, a.rk(), 0);
    Ok(fs.emit_jmp(line, 0, 0))
}

fn compile_while(fs: &mut FuncState, cond: &Expression, block: &Block, line: u32) -> CompileResult<()> {
    let pc_before_cond = fs.pc();
    let jmp_to_end = compile_test_jump(fs, cond, line)?;

    fs.enter_scope(true);
    compile_block(fs, block)?;
    fs.close_upvalues(block.last_line);
    let back = fs.offset_to(pc_before_cond)?;
    fs.emit_jmp(block.last_line, 0, back);
    fs.exit_scope(fs.pc())?;

    let end = fs.pc();
    fs.fix_jump(jmp_to_end, end)?;
    Ok(())
}

fn compile_repeat(fs: &mut FuncState, block: &Block, cond: &Expression, line: u32) -> CompileResult<()> {
    fs.enter_scope(true);
    let pc_before_block = fs.pc();
    compile_block(fs, block)?;

    // the condition still sees the body's locals
    fs.line = line;
    let mark = fs.used_regs();
    let a = expr::exp_to_operand(fs, cond, ArgKinds::REG)?;
    fs.free_registers_to(mark);
    fs.emit_test(line, a.rk(), 0);
    let close_from = fs.jmp_arg_a();
    let back = fs.offset_to(pc_before_block)?;
    fs.emit_jmp(line, close_from, back);

    fs.close_upvalues(line);
    fs.exit_scope(fs.pc())?;
    Ok(())
}

fn compile_if(fs: &mut FuncState, stat: &IfStatement) -> CompileResult<()> {
    let mut jmps_to_end = Vec::with_capacity(stat.branches.len());
    let mut jmp_to_next: Option<usize> = None;

    for (i, branch) in stat.branches.iter().enumerate() {
        if let Some(pc) = jmp_to_next.take() {
            let here = fs.pc();
            fs.fix_jump(pc, here)?;
        }
        let jmp = compile_test_jump(fs, &branch.condition, branch.line)?;

        fs.enter_scope(false);
        compile_block(fs, &branch.block)?;
        fs.close_upvalues(branch.block.last_line);
        fs.exit_scope(fs.pc())?;

        if i < stat.branches.len() - 1 {
            jmps_to_end.push(fs.emit_jmp(branch.block.last_line, 0, 0));
            jmp_to_next = Some(jmp);
        } else {
            jmps_to_end.push(jmp);
        }
    }

    let end = fs.pc();
    for pc in jmps_to_end {
        fs.fix_jump(pc, end)?;
    }
    Ok(())
}

fn compile_for_num(fs: &mut FuncState, stat: &ForNumStatement) -> CompileResult<()> {
    fs.line = stat.line_of_for;
    fs.enter_scope(true);

    let first_hidden = fs.local_count();
    let one = Expression::Integer(1);
    let step = stat.step.as_ref().unwrap_or(&one);
    declare_locals(
        fs,
        &[FOR_INDEX, FOR_LIMIT, FOR_STEP],
        &[&stat.init, &stat.limit, step],
        stat.line_of_for,
    )?;
    fs.add_local(&stat.var_name, fs.pc() + 1)?;

    let a = fs.used_regs() - 4;
    let prep = fs.emit_for_prep(stat.line_of_do, a, 0);
    compile_block(fs, &stat.block)?;
    fs.close_upvalues(stat.block.last_line);
    let lp = fs.emit_for_loop(stat.line_of_for, a, 0);

    fs.fix_jump(prep, lp)?;
    fs.fix_jump(lp, prep + 1)?;

    fs.exit_scope(fs.pc() - 1)?;
    // the control registers stay live through FORLOOP
    fs.extend_end_pc(first_hidden..first_hidden + 3, 1);
    Ok(())
}

fn compile_for_in(fs: &mut FuncState, stat: &ForInStatement) -> CompileResult<()> {
    fs.line = stat.line_of_do;
    fs.enter_scope(true);

    let first_hidden = fs.local_count();
    let exps: Vec<&Expression> = stat.exps.iter().collect();
    declare_locals(fs, &[FOR_GENERATOR, FOR_STATE, FOR_CONTROL], &exps, stat.line_of_do)?;
    for name in &stat.names {
        fs.add_local(name, fs.pc() + 1)?;
    }

    let jmp_to_call = fs.emit_jmp(stat.line_of_do, 0, 0);
    compile_block(fs, &stat.block)?;
    fs.close_upvalues(stat.block.last_line);
    let call_pc = fs.pc();
    fs.fix_jump(jmp_to_call, call_pc)?;

    let generator = fs.local_vars()[first_hidden].slot;
    fs.emit_tfor_call(stat.line_of_do, generator, stat.names.len());
    let back = fs.offset_to(jmp_to_call + 1)?;
    fs.emit_tfor_loop(stat.line_of_do, generator + 2, back);

    fs.exit_scope(fs.pc() - 2)?;
    fs.extend_end_pc(first_hidden..first_hidden + 3, 2);
    Ok(())
}

/// Drop trailing literal `nil`s; the nil-fill covers their targets
fn remove_tail_nils<'a, 'b>(exps: &'b [&'a Expression]) -> &'b [&'a Expression] {
    let mut end = exps.len();
    while end > 0 && matches!(exps[end - 1], Expression::Nil) {
        end -= 1;
    }
    &exps[..end]
}

/// Evaluate `exps` into fresh consecutive registers so that exactly
/// `n_targets` values are available, expanding a trailing call or `...`
/// or filling with nils as needed
///
/// Registers stay allocated; the caller restores its own mark.
fn load_exp_list(fs: &mut FuncState, n_targets: usize, exps: &[&Expression], line: u32) -> CompileResult<()> {
    let exps = remove_tail_nils(exps);
    let n_exps = exps.len();
    let last_expands = exps.last().map_or(false, |e| e.is_multi_value());

    if n_exps >= n_targets {
        for (i, exp) in exps.iter().enumerate() {
            let a = fs.alloc_reg()?;
            // surplus trailing call or `...`: its results would be discarded, so ask for none
            let want = if i >= n_targets && i == n_exps - 1 && last_expands { 0 } else { 1 };
            expr::compile_exp(fs, exp, a, want)?;
        }
        return Ok(());
    }

    for (i, exp) in exps.iter().enumerate() {
        let a = fs.alloc_reg()?;
        if i == n_exps - 1 && last_expands {
            let n = n_targets - n_exps + 1;
            expr::compile_exp(fs, exp, a, n as i32)?;
            fs.alloc_regs(n - 1)?;
        } else {
            expr::compile_exp(fs, exp, a, 1)?;
        }
    }
    if !last_expands {
        let n = n_targets - n_exps;
        let a = fs.alloc_regs(n)?;
        fs.emit_load_nil(line, a, n);
    }
    Ok(())
}

/// Declare `names` as new locals initialised from `exps`
fn declare_locals(fs: &mut FuncState, names: &[&str], exps: &[&Expression], line: u32) -> CompileResult<()> {
    fs.line = line;
    let mark = fs.used_regs();
    load_exp_list(fs, names.len(), exps, line)?;
    fs.free_registers_to(mark);

    let start_pc = fs.pc();
    for name in names {
        fs.add_local(name, start_pc)?;
    }
    Ok(())
}

/// Where a store goes, resolved before any value is evaluated
enum TargetSlot {
    Local(usize),
    Upvalue(usize),
    /// Global name; `key` is a register when its constant index is too
    /// large for an RK operand
    Global { env: Operand, name: String, key: Option<usize> },
    Field { table: usize, key: usize },
}

fn compile_assign(
    fs: &mut FuncState,
    targets: &[AssignTarget],
    exps: &[Expression],
    line: u32,
) -> CompileResult<()> {
    fs.line = line;
    let mark = fs.used_regs();

    let mut slots = Vec::with_capacity(targets.len());
    for target in targets {
        let slot = match target {
            AssignTarget::Index { prefix, key } => {
                let table = fs.alloc_reg()?;
                expr::compile_exp(fs, prefix, table, 1)?;
                let k = fs.alloc_reg()?;
                expr::compile_exp(fs, key, k, 1)?;
                TargetSlot::Field { table, key: k }
            }
            AssignTarget::Name(name) => {
                if let Some(r) = fs.slot_of_local(name) {
                    TargetSlot::Local(r)
                } else if let Some(idx) = fs.index_of_upvalue(name)? {
                    TargetSlot::Upvalue(idx)
                } else {
                    let env = expr::env_operand(fs)?;
                    let idx = fs.index_of_constant(Constant::String(name.clone()));
                    let key = if idx > fs.config().rk_max_constant {
                        let r = fs.alloc_reg()?;
                        fs.emit_load_k(line, r, Constant::String(name.clone()));
                        Some(r)
                    } else {
                        None
                    };
                    TargetSlot::Global { env, name: name.clone(), key }
                }
            }
        };
        slots.push(slot);
    }

    let first_value = fs.used_regs();
    let exps: Vec<&Expression> = exps.iter().collect();
    load_exp_list(fs, targets.len(), &exps, line)?;

    for (i, slot) in slots.iter().enumerate() {
        let value = first_value + i;
        match slot {
            TargetSlot::Local(r) => fs.emit_move(line, *r, value),
            TargetSlot::Upvalue(idx) => fs.emit_set_upval(line, value, *idx),
            TargetSlot::Field { table, key } => fs.emit_set_table(line, *table, *key, value),
            TargetSlot::Global { env, name, key } => {
                let key = match key {
                    Some(r) => *r,
                    None => {
                        let idx = fs.index_of_constant(Constant::String(name.clone()));
                        Operand::Constant(idx).rk()
                    }
                };
                match *env {
                    Operand::Upvalue(up) => fs.emit_set_tab_up(line, up, key, value),
                    other => fs.emit_set_table(line, other.rk(), key, value),
                }
            }
        }
    }

    fs.free_registers_to(mark);
    Ok(())
}
