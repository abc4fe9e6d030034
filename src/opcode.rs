//! Lua 5.3 Instruction Set
//!
//! Opcodes and the 32-bit instruction word layout. The statement lowering code
//! never touches bit fields directly; it goes through the `emit_*` helpers on
//! [`crate::func_state::FuncState`], which build words with the constructors
//! here.

use std::fmt;

/// Lua 5.3 Opcodes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum OpCode {
    Move = 0,      // A B     R(A) := R(B)
    LoadK,         // A Bx    R(A) := Kst(Bx)
    LoadKx,        // A       R(A) := Kst(extra arg)
    LoadBool,      // A B C   R(A) := (Bool)B; if (C) pc++
    LoadNil,       // A B     R(A), R(A+1), ..., R(A+B) := nil
    GetUpval,      // A B     R(A) := UpValue[B]
    GetTabUp,      // A B C   R(A) := UpValue[B][RK(C)]
    GetTable,      // A B C   R(A) := R(B)[RK(C)]
    SetTabUp,      // A B C   UpValue[A][RK(B)] := RK(C)
    SetUpval,      // A B     UpValue[B] := R(A)
    SetTable,      // A B C   R(A)[RK(B)] := RK(C)
    NewTable,      // A B C   R(A) := {} (size = B,C)
    SelfOp,        // A B C   R(A+1) := R(B); R(A) := R(B)[RK(C)]
    Add,
    Sub,
    Mul,
    Mod,
    Pow,
    Div,
    IDiv,
    BAnd,
    BOr,
    BXor,
    Shl,
    Shr,
    Unm,           // A B     R(A) := -R(B)
    BNot,          // A B     R(A) := ~R(B)
    Not,           // A B     R(A) := not R(B)
    Len,           // A B     R(A) := length of R(B)
    Concat,        // A B C   R(A) := R(B).. ... ..R(C)
    Jmp,           // A sBx   pc+=sBx; if (A) close all upvalues >= R(A - 1)
    Eq,            // A B C   if ((RK(B) == RK(C)) ~= A) then pc++
    Lt,            // A B C   if ((RK(B) <  RK(C)) ~= A) then pc++
    Le,            // A B C   if ((RK(B) <= RK(C)) ~= A) then pc++
    Test,          // A C     if not (R(A) <=> C) then pc++
    TestSet,       // A B C   if (R(B) <=> C) then R(A) := R(B) else pc++
    Call,          // A B C   R(A), ... ,R(A+C-2) := R(A)(R(A+1), ... ,R(A+B-1))
    TailCall,      // A B C   return R(A)(R(A+1), ... ,R(A+B-1))
    Return,        // A B     return R(A), ... ,R(A+B-2)
    ForLoop,       // A sBx   R(A)+=R(A+2); if R(A) <?= R(A+1) then { pc+=sBx; R(A+3)=R(A) }
    ForPrep,       // A sBx   R(A)-=R(A+2); pc+=sBx
    TForCall,      // A C     R(A+3), ... ,R(A+2+C) := R(A)(R(A+1), R(A+2))
    TForLoop,      // A sBx   if R(A+1) ~= nil then { R(A)=R(A+1); pc += sBx }
    SetList,       // A B C   R(A)[(C-1)*FPF+i] := R(A+i), 1 <= i <= B
    Closure,       // A Bx    R(A) := closure(KPROTO[Bx])
    VarArg,        // A B     R(A), R(A+1), ..., R(A+B-2) = vararg
    ExtraArg,      // Ax      extra (larger) argument for previous opcode
}

/// Operand layout of an opcode
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpMode {
    ABC,
    ABx,
    AsBx,
    Ax,
}

impl OpCode {
    /// Every opcode, indexed by its numeric value
    pub const ALL: [OpCode; 47] = [
        OpCode::Move, OpCode::LoadK, OpCode::LoadKx, OpCode::LoadBool, OpCode::LoadNil,
        OpCode::GetUpval, OpCode::GetTabUp, OpCode::GetTable, OpCode::SetTabUp, OpCode::SetUpval,
        OpCode::SetTable, OpCode::NewTable, OpCode::SelfOp, OpCode::Add, OpCode::Sub,
        OpCode::Mul, OpCode::Mod, OpCode::Pow, OpCode::Div, OpCode::IDiv,
        OpCode::BAnd, OpCode::BOr, OpCode::BXor, OpCode::Shl, OpCode::Shr,
        OpCode::Unm, OpCode::BNot, OpCode::Not, OpCode::Len, OpCode::Concat,
        OpCode::Jmp, OpCode::Eq, OpCode::Lt, OpCode::Le, OpCode::Test,
        OpCode::TestSet, OpCode::Call, OpCode::TailCall, OpCode::Return, OpCode::ForLoop,
        OpCode::ForPrep, OpCode::TForCall, OpCode::TForLoop, OpCode::SetList, OpCode::Closure,
        OpCode::VarArg, OpCode::ExtraArg,
    ];

    /// Decode a numeric opcode
    pub fn from_u8(op: u8) -> Option<OpCode> {
        Self::ALL.get(op as usize).copied()
    }

    /// Operand layout
    pub fn mode(self) -> OpMode {
        match self {
            OpCode::LoadK | OpCode::LoadKx | OpCode::Closure => OpMode::ABx,
            OpCode::Jmp | OpCode::ForLoop | OpCode::ForPrep | OpCode::TForLoop => OpMode::AsBx,
            OpCode::ExtraArg => OpMode::Ax,
            _ => OpMode::ABC,
        }
    }

    /// Mnemonic as printed by `luac -l`
    pub fn name(self) -> &'static str {
        match self {
            OpCode::Move => "MOVE",
            OpCode::LoadK => "LOADK",
            OpCode::LoadKx => "LOADKX",
            OpCode::LoadBool => "LOADBOOL",
            OpCode::LoadNil => "LOADNIL",
            OpCode::GetUpval => "GETUPVAL",
            OpCode::GetTabUp => "GETTABUP",
            OpCode::GetTable => "GETTABLE",
            OpCode::SetTabUp => "SETTABUP",
            OpCode::SetUpval => "SETUPVAL",
            OpCode::SetTable => "SETTABLE",
            OpCode::NewTable => "NEWTABLE",
            OpCode::SelfOp => "SELF",
            OpCode::Add => "ADD",
            OpCode::Sub => "SUB",
            OpCode::Mul => "MUL",
            OpCode::Mod => "MOD",
            OpCode::Pow => "POW",
            OpCode::Div => "DIV",
            OpCode::IDiv => "IDIV",
            OpCode::BAnd => "BAND",
            OpCode::BOr => "BOR",
            OpCode::BXor => "BXOR",
            OpCode::Shl => "SHL",
            OpCode::Shr => "SHR",
            OpCode::Unm => "UNM",
            OpCode::BNot => "BNOT",
            OpCode::Not => "NOT",
            OpCode::Len => "LEN",
            OpCode::Concat => "CONCAT",
            OpCode::Jmp => "JMP",
            OpCode::Eq => "EQ",
            OpCode::Lt => "LT",
            OpCode::Le => "LE",
            OpCode::Test => "TEST",
            OpCode::TestSet => "TESTSET",
            OpCode::Call => "CALL",
            OpCode::TailCall => "TAILCALL",
            OpCode::Return => "RETURN",
            OpCode::ForLoop => "FORLOOP",
            OpCode::ForPrep => "FORPREP",
            OpCode::TForCall => "TFORCALL",
            OpCode::TForLoop => "TFORLOOP",
            OpCode::SetList => "SETLIST",
            OpCode::Closure => "CLOSURE",
            OpCode::VarArg => "VARARG",
            OpCode::ExtraArg => "EXTRAARG",
        }
    }
}

/// A single 32-bit instruction word
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Instruction(pub u32);

impl Instruction {
    const SIZE_OP: u32 = 6;
    const SIZE_A: u32 = 8;
    const SIZE_B: u32 = 9;
    const SIZE_C: u32 = 9;
    const SIZE_BX: u32 = Self::SIZE_B + Self::SIZE_C;
    const SIZE_AX: u32 = Self::SIZE_A + Self::SIZE_BX;

    const POS_OP: u32 = 0;
    const POS_A: u32 = Self::POS_OP + Self::SIZE_OP;
    const POS_C: u32 = Self::POS_A + Self::SIZE_A;
    const POS_B: u32 = Self::POS_C + Self::SIZE_C;
    const POS_BX: u32 = Self::POS_C;
    const POS_AX: u32 = Self::POS_A;

    pub const MAXARG_A: u32 = (1 << Self::SIZE_A) - 1;
    pub const MAXARG_B: u32 = (1 << Self::SIZE_B) - 1;
    pub const MAXARG_C: u32 = (1 << Self::SIZE_C) - 1;
    pub const MAXARG_BX: u32 = (1 << Self::SIZE_BX) - 1;
    pub const MAXARG_SBX: i32 = (Self::MAXARG_BX >> 1) as i32;
    pub const MAXARG_AX: u32 = (1 << Self::SIZE_AX) - 1;

    /// Bit marking a B/C operand as a constant index
    pub const BITRK: u32 = 1 << (Self::SIZE_B - 1);

    /// Build an ABC instruction
    pub fn abc(op: OpCode, a: u32, b: u32, c: u32) -> Self {
        Instruction(
            (op as u32) << Self::POS_OP
                | (a & Self::MAXARG_A) << Self::POS_A
                | (b & Self::MAXARG_B) << Self::POS_B
                | (c & Self::MAXARG_C) << Self::POS_C,
        )
    }

    /// Build an ABx instruction
    pub fn abx(op: OpCode, a: u32, bx: u32) -> Self {
        Instruction(
            (op as u32) << Self::POS_OP
                | (a & Self::MAXARG_A) << Self::POS_A
                | (bx & Self::MAXARG_BX) << Self::POS_BX,
        )
    }

    /// Build an AsBx instruction
    pub fn asbx(op: OpCode, a: u32, sbx: i32) -> Self {
        Self::abx(op, a, (sbx + Self::MAXARG_SBX) as u32)
    }

    /// Build an Ax instruction
    pub fn ax(op: OpCode, ax: u32) -> Self {
        Instruction((op as u32) << Self::POS_OP | (ax & Self::MAXARG_AX) << Self::POS_AX)
    }

    /// Decoded opcode, `None` for words no encoder here produces
    pub fn opcode(&self) -> Option<OpCode> {
        OpCode::from_u8((self.0 >> Self::POS_OP & ((1 << Self::SIZE_OP) - 1)) as u8)
    }

    pub fn a(&self) -> u32 {
        self.0 >> Self::POS_A & Self::MAXARG_A
    }

    pub fn b(&self) -> u32 {
        self.0 >> Self::POS_B & Self::MAXARG_B
    }

    pub fn c(&self) -> u32 {
        self.0 >> Self::POS_C & Self::MAXARG_C
    }

    pub fn bx(&self) -> u32 {
        self.0 >> Self::POS_BX & Self::MAXARG_BX
    }

    pub fn sbx(&self) -> i32 {
        self.bx() as i32 - Self::MAXARG_SBX
    }

    pub fn ax_arg(&self) -> u32 {
        self.0 >> Self::POS_AX & Self::MAXARG_AX
    }

    /// Overwrite the sBx field, keeping opcode and A
    pub fn set_sbx(&mut self, sbx: i32) {
        let bx = (sbx + Self::MAXARG_SBX) as u32 & Self::MAXARG_BX;
        self.0 = self.0 & !(Self::MAXARG_BX << Self::POS_BX) | bx << Self::POS_BX;
    }

    /// Overwrite the A field
    pub fn set_a(&mut self, a: u32) {
        self.0 = self.0 & !(Self::MAXARG_A << Self::POS_A) | (a & Self::MAXARG_A) << Self::POS_A;
    }

    /// Is an RK operand a constant index?
    pub fn is_constant(rk: u32) -> bool {
        rk & Self::BITRK != 0
    }

    /// Encode a constant index as an RK operand
    pub fn rk_constant(index: usize) -> u32 {
        index as u32 | Self::BITRK
    }
}

impl fmt::Display for Instruction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let op = match self.opcode() {
            Some(op) => op,
            None => return write!(f, "<bad {:#010x}>", self.0),
        };
        let rk = |v: u32| -> i64 {
            if Instruction::is_constant(v) {
                -1 - (v & !Instruction::BITRK) as i64
            } else {
                v as i64
            }
        };
        match op.mode() {
            OpMode::ABC => match op {
                OpCode::Move | OpCode::LoadNil | OpCode::GetUpval | OpCode::SetUpval
                | OpCode::Unm | OpCode::BNot | OpCode::Not | OpCode::Len | OpCode::Return
                | OpCode::VarArg => write!(f, "{:<9} {} {}", op.name(), self.a(), self.b()),
                OpCode::Test | OpCode::TForCall => {
                    write!(f, "{:<9} {} {}", op.name(), self.a(), self.c())
                }
                OpCode::GetTabUp | OpCode::GetTable | OpCode::SelfOp => {
                    write!(f, "{:<9} {} {} {}", op.name(), self.a(), self.b(), rk(self.c()))
                }
                OpCode::SetTabUp | OpCode::SetTable | OpCode::Add | OpCode::Sub | OpCode::Mul
                | OpCode::Mod | OpCode::Pow | OpCode::Div | OpCode::IDiv | OpCode::BAnd
                | OpCode::BOr | OpCode::BXor | OpCode::Shl | OpCode::Shr | OpCode::Eq
                | OpCode::Lt | OpCode::Le => {
                    write!(f, "{:<9} {} {} {}", op.name(), self.a(), rk(self.b()), rk(self.c()))
                }
                _ => write!(f, "{:<9} {} {} {}", op.name(), self.a(), self.b(), self.c()),
            },
            OpMode::ABx => match op {
                OpCode::LoadK => write!(f, "{:<9} {} {}", op.name(), self.a(), -1 - self.bx() as i64),
                OpCode::LoadKx => write!(f, "{:<9} {}", op.name(), self.a()),
                _ => write!(f, "{:<9} {} {}", op.name(), self.a(), self.bx()),
            },
            OpMode::AsBx => write!(f, "{:<9} {} {}", op.name(), self.a(), self.sbx()),
            OpMode::Ax => write!(f, "{:<9} {}", op.name(), -1 - self.ax_arg() as i64),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_instruction_encoding() {
        let inst = Instruction::abc(OpCode::Move, 1, 2, 0);
        assert_eq!(inst.opcode(), Some(OpCode::Move));
        assert_eq!(inst.a(), 1);
        assert_eq!(inst.b(), 2);
        assert_eq!(inst.c(), 0);

        let inst = Instruction::abx(OpCode::LoadK, 5, 100);
        assert_eq!(inst.opcode(), Some(OpCode::LoadK));
        assert_eq!(inst.a(), 5);
        assert_eq!(inst.bx(), 100);

        let inst = Instruction::asbx(OpCode::Jmp, 3, -10);
        assert_eq!(inst.opcode(), Some(OpCode::Jmp));
        assert_eq!(inst.a(), 3);
        assert_eq!(inst.sbx(), -10);

        let inst = Instruction::ax(OpCode::ExtraArg, 300_000);
        assert_eq!(inst.ax_arg(), 300_000);
    }

    #[test]
    fn test_matches_reference_words() {
        // MOVE 1 0, LOADK 0 -1, RETURN 0 1 as produced by luac 5.3
        assert_eq!(Instruction::abc(OpCode::Move, 1, 0, 0).0, 0x0000_0040);
        assert_eq!(Instruction::abx(OpCode::LoadK, 0, 0).0, 0x0000_0001);
        assert_eq!(Instruction::abc(OpCode::Return, 0, 1, 0).0, 0x0080_0026);
    }

    #[test]
    fn test_set_sbx_keeps_other_fields() {
        let mut inst = Instruction::asbx(OpCode::ForPrep, 7, 0);
        inst.set_sbx(-3);
        assert_eq!(inst.opcode(), Some(OpCode::ForPrep));
        assert_eq!(inst.a(), 7);
        assert_eq!(inst.sbx(), -3);

        inst.set_a(2);
        assert_eq!(inst.a(), 2);
        assert_eq!(inst.sbx(), -3);
    }

    #[test]
    fn test_constant_encoding() {
        let rk = Instruction::rk_constant(42);
        assert!(Instruction::is_constant(rk));
        assert_eq!(rk & !Instruction::BITRK, 42);
        assert!(!Instruction::is_constant(42));
    }

    #[test]
    fn test_opcode_table_is_ordered() {
        for (i, op) in OpCode::ALL.iter().enumerate() {
            assert_eq!(*op as usize, i);
        }
        assert_eq!(OpCode::from_u8(47), None);
    }

    #[test]
    fn test_display() {
        let inst = Instruction::abc(OpCode::SetTabUp, 0, Instruction::rk_constant(1), 2);
        assert_eq!(inst.to_string(), "SETTABUP  0 -2 2");
        assert_eq!(Instruction::asbx(OpCode::Jmp, 0, 4).to_string(), "JMP       0 4");
    }
}
