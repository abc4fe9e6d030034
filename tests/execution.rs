//! Execution tests for generated code
//!
//! Runs compiled chunks on a tiny register machine that understands just
//! enough of the instruction set to check data flow and control flow.

use std::collections::HashMap;

use lua_codegen::ast::{
    AssignTarget, BinaryOperator, Block, Expression, ForNumStatement, IfStatement, Statement,
};
use lua_codegen::{compile, CompilerConfig, Constant, Instruction, OpCode, Prototype};

#[derive(Debug, Clone, PartialEq)]
enum Value {
    Nil,
    Bool(bool),
    Int(i64),
    Str(String),
}

impl Value {
    fn truthy(&self) -> bool {
        !matches!(self, Value::Nil | Value::Bool(false))
    }

    fn int(&self) -> i64 {
        match self {
            Value::Int(n) => *n,
            other => panic!("expected integer, got {:?}", other),
        }
    }
}

impl From<&Constant> for Value {
    fn from(k: &Constant) -> Self {
        match k {
            Constant::Nil => Value::Nil,
            Constant::Boolean(b) => Value::Bool(*b),
            Constant::Integer(n) => Value::Int(*n),
            Constant::String(s) => Value::Str(s.clone()),
            Constant::Float(f) => panic!("float constant {} not supported", f),
        }
    }
}

/// Run `proto` with the given globals, returning what its RETURN yields
fn run(proto: &Prototype, globals: &mut HashMap<String, Value>) -> Vec<Value> {
    let mut regs = vec![Value::Nil; 256];
    let mut pc = 0usize;
    let rk = |regs: &[Value], v: u32| -> Value {
        if Instruction::is_constant(v) {
            Value::from(&proto.constants[(v & !Instruction::BITRK) as usize])
        } else {
            regs[v as usize].clone()
        }
    };
    let key = |v: u32| -> String {
        match rk(&[], v) {
            Value::Str(s) => s,
            other => panic!("global key must be a string constant, got {:?}", other),
        }
    };

    for _ in 0..10_000 {
        let inst = proto.code[pc];
        pc += 1;
        let (a, b, c) = (inst.a() as usize, inst.b(), inst.c());
        match inst.opcode().expect("valid opcode") {
            OpCode::Move => regs[a] = regs[b as usize].clone(),
            OpCode::LoadK => regs[a] = Value::from(&proto.constants[inst.bx() as usize]),
            OpCode::LoadNil => {
                for r in a..=a + b as usize {
                    regs[r] = Value::Nil;
                }
            }
            OpCode::LoadBool => {
                regs[a] = Value::Bool(b != 0);
                if c != 0 {
                    pc += 1;
                }
            }
            OpCode::GetTabUp => regs[a] = globals.get(&key(c)).cloned().unwrap_or(Value::Nil),
            OpCode::SetTabUp => {
                let v = rk(&regs, c);
                globals.insert(key(b), v);
            }
            OpCode::Add => regs[a] = Value::Int(rk(&regs, b).int() + rk(&regs, c).int()),
            OpCode::Sub => regs[a] = Value::Int(rk(&regs, b).int() - rk(&regs, c).int()),
            OpCode::Eq | OpCode::Lt | OpCode::Le => {
                let (l, r) = (rk(&regs, b), rk(&regs, c));
                let holds = match inst.opcode() {
                    Some(OpCode::Eq) => l == r,
                    Some(OpCode::Lt) => l.int() < r.int(),
                    _ => l.int() <= r.int(),
                };
                if holds != (a != 0) {
                    pc += 1;
                }
            }
            OpCode::Jmp => pc = (pc as i64 + inst.sbx() as i64) as usize,
            OpCode::Test => {
                if regs[a].truthy() != (c != 0) {
                    pc += 1;
                }
            }
            OpCode::ForPrep => {
                regs[a] = Value::Int(regs[a].int() - regs[a + 2].int());
                pc = (pc as i64 + inst.sbx() as i64) as usize;
            }
            OpCode::ForLoop => {
                let step = regs[a + 2].int();
                let idx = regs[a].int() + step;
                regs[a] = Value::Int(idx);
                let limit = regs[a + 1].int();
                if (step > 0 && idx <= limit) || (step < 0 && idx >= limit) {
                    pc = (pc as i64 + inst.sbx() as i64) as usize;
                    regs[a + 3] = Value::Int(idx);
                }
            }
            OpCode::Return => {
                assert!(b > 0, "variable returns are not simulated");
                return regs[a..a + b as usize - 1].to_vec();
            }
            other => panic!("{:?} is not simulated", other),
        }
    }
    panic!("step limit reached");
}

fn exec(block: Block) -> Vec<Value> {
    let _ = env_logger::builder().is_test(true).try_init();
    let proto = compile(&block, &CompilerConfig::default()).expect("chunk compiles");
    run(&proto, &mut HashMap::new())
}

fn name(n: &str) -> Expression {
    Expression::name(n)
}

fn int(n: i64) -> Expression {
    Expression::Integer(n)
}

fn bin(op: BinaryOperator, l: Expression, r: Expression) -> Expression {
    Expression::binary(op, l, r)
}

fn local(names: &[&str], exps: Vec<Expression>) -> Statement {
    Statement::LocalVarDecl {
        names: names.iter().map(|n| n.to_string()).collect(),
        exps,
        last_line: 1,
    }
}

fn assign(names: &[&str], exps: Vec<Expression>) -> Statement {
    Statement::Assign {
        targets: names.iter().map(|n| AssignTarget::name(n)).collect(),
        exps,
        last_line: 1,
    }
}

fn incr(var: &str, by: i64) -> Statement {
    assign(&[var], vec![bin(BinaryOperator::Add, name(var), int(by))])
}

fn for_num(var: &str, init: i64, limit: i64, step: Option<i64>, body: Vec<Statement>) -> Statement {
    Statement::ForNum(ForNumStatement {
        var_name: var.to_string(),
        init: int(init),
        limit: int(limit),
        step: step.map(int),
        block: Block::new(body, 1),
        line_of_for: 1,
        line_of_do: 1,
    })
}

fn chunk(statements: Vec<Statement>, returns: Vec<Expression>) -> Block {
    Block::new(statements, 1).with_return(returns)
}

#[test]
fn test_swap_locals() {
    let block = chunk(
        vec![
            local(&["a", "b"], vec![int(1), int(2)]),
            assign(&["a", "b"], vec![name("b"), name("a")]),
        ],
        vec![name("a"), name("b")],
    );
    assert_eq!(exec(block), vec![Value::Int(2), Value::Int(1)]);
}

#[test]
fn test_swap_globals() {
    let block = chunk(
        vec![
            assign(&["g", "h"], vec![int(1), int(2)]),
            assign(&["g", "h"], vec![name("h"), name("g")]),
        ],
        vec![name("g"), name("h")],
    );
    let _ = env_logger::builder().is_test(true).try_init();
    let proto = compile(&block, &CompilerConfig::default()).unwrap();
    let mut globals = HashMap::new();
    assert_eq!(run(&proto, &mut globals), vec![Value::Int(2), Value::Int(1)]);
    assert_eq!(globals["g"], Value::Int(2));
}

#[test]
fn test_while_trip_count() {
    let block = chunk(
        vec![
            local(&["i", "n"], vec![int(0), int(0)]),
            Statement::While {
                condition: bin(BinaryOperator::Lt, name("i"), int(5)),
                block: Block::new(vec![incr("i", 1), incr("n", 2)], 1),
                line: 1,
            },
        ],
        vec![name("n")],
    );
    assert_eq!(exec(block), vec![Value::Int(10)]);
}

#[test]
fn test_while_false_never_runs() {
    let block = chunk(
        vec![
            local(&["n"], vec![int(0)]),
            Statement::While { condition: Expression::False, block: Block::new(vec![incr("n", 1)], 1), line: 1 },
        ],
        vec![name("n")],
    );
    assert_eq!(exec(block), vec![Value::Int(0)]);
}

#[test]
fn test_break_leaves_loop() {
    let stop = IfStatement::new(vec![(
        bin(BinaryOperator::Eq, name("n"), int(3)),
        Block::new(vec![Statement::Break { line: 1 }], 1),
        1,
    )]);
    let block = chunk(
        vec![
            local(&["n"], vec![int(0)]),
            Statement::While {
                condition: Expression::True,
                block: Block::new(vec![incr("n", 1), Statement::If(stop)], 1),
                line: 1,
            },
        ],
        vec![name("n")],
    );
    assert_eq!(exec(block), vec![Value::Int(3)]);
}

#[test]
fn test_break_only_leaves_inner_loop() {
    let stop = IfStatement::new(vec![(
        bin(BinaryOperator::Eq, name("j"), int(2)),
        Block::new(vec![Statement::Break { line: 1 }], 1),
        1,
    )]);
    let inner = for_num("j", 1, 3, None, vec![Statement::If(stop), incr("n", 1)]);
    let block = chunk(
        vec![local(&["n"], vec![int(0)]), for_num("i", 1, 3, None, vec![inner])],
        vec![name("n")],
    );
    assert_eq!(exec(block), vec![Value::Int(3)]);
}

#[test]
fn test_numeric_for_sums() {
    let block = chunk(
        vec![
            local(&["s"], vec![int(0)]),
            for_num("i", 1, 4, None, vec![assign(&["s"], vec![bin(BinaryOperator::Add, name("s"), name("i"))])]),
        ],
        vec![name("s")],
    );
    assert_eq!(exec(block), vec![Value::Int(10)]);
}

#[test]
fn test_numeric_for_negative_step() {
    let block = chunk(
        vec![
            local(&["s"], vec![int(0)]),
            for_num("i", 10, 1, Some(-3), vec![assign(&["s"], vec![bin(BinaryOperator::Add, name("s"), name("i"))])]),
        ],
        vec![name("s")],
    );
    // 10 + 7 + 4 + 1
    assert_eq!(exec(block), vec![Value::Int(22)]);
}

#[test]
fn test_numeric_for_empty_range() {
    let block = chunk(
        vec![local(&["n"], vec![int(0)]), for_num("i", 5, 1, None, vec![incr("n", 1)])],
        vec![name("n")],
    );
    assert_eq!(exec(block), vec![Value::Int(0)]);
}

#[test]
fn test_repeat_condition_sees_body_local() {
    let block = chunk(
        vec![
            local(&["n"], vec![int(0)]),
            Statement::Repeat {
                block: Block::new(
                    vec![
                        local(&["m"], vec![bin(BinaryOperator::Add, name("n"), int(1))]),
                        assign(&["n"], vec![name("m")]),
                    ],
                    1,
                ),
                condition: bin(BinaryOperator::Ge, name("m"), int(3)),
                line: 1,
            },
        ],
        vec![name("n")],
    );
    assert_eq!(exec(block), vec![Value::Int(3)]);
}

#[test]
fn test_repeat_runs_body_once() {
    let block = chunk(
        vec![
            local(&["n"], vec![int(0)]),
            Statement::Repeat { block: Block::new(vec![incr("n", 1)], 1), condition: Expression::True, line: 1 },
        ],
        vec![name("n")],
    );
    assert_eq!(exec(block), vec![Value::Int(1)]);
}

#[test]
fn test_if_chain_picks_first_true_branch() {
    let pick = |a: bool, b: bool| {
        let chain = IfStatement::new(vec![
            (name("a"), Block::new(vec![assign(&["x"], vec![int(1)])], 1), 1),
            (name("b"), Block::new(vec![assign(&["x"], vec![int(2)])], 1), 1),
        ])
        .with_else(Block::new(vec![assign(&["x"], vec![int(3)])], 1), 1);
        let lit = |v: bool| if v { Expression::True } else { Expression::False };
        let block = chunk(
            vec![local(&["a", "b"], vec![lit(a), lit(b)]), local(&["x"], vec![]), Statement::If(chain)],
            vec![name("x")],
        );
        exec(block)
    };
    assert_eq!(pick(true, true), vec![Value::Int(1)]);
    assert_eq!(pick(false, true), vec![Value::Int(2)]);
    assert_eq!(pick(false, false), vec![Value::Int(3)]);
}

#[test]
fn test_if_without_else_falls_through() {
    let chain = IfStatement::new(vec![(name("c"), Block::new(vec![assign(&["x"], vec![int(1)])], 1), 1)]);
    let block = chunk(
        vec![local(&["c", "x"], vec![Expression::False, int(7)]), Statement::If(chain)],
        vec![name("x")],
    );
    assert_eq!(exec(block), vec![Value::Int(7)]);
}

#[test]
fn test_local_fill_values() {
    let block = chunk(vec![local(&["x", "y", "z"], vec![int(1)])], vec![name("x"), name("y"), name("z")]);
    assert_eq!(exec(block), vec![Value::Int(1), Value::Nil, Value::Nil]);
}

#[test]
fn test_shadowed_local_restored_after_block() {
    let block = chunk(
        vec![
            local(&["x"], vec![int(1)]),
            Statement::Do(Block::new(vec![local(&["x"], vec![int(2)]), assign(&["x"], vec![int(3)])], 1)),
        ],
        vec![name("x")],
    );
    assert_eq!(exec(block), vec![Value::Int(1)]);
}
