//! Lua Abstract Syntax Tree
//!
//! The tree handed over by the parser. Statement kinds form a closed enum so
//! the dispatcher in [`crate::stat`] is an exhaustive match. Lines are kept
//! where the generated code needs them for its line table.

/// A block of statements with an optional trailing return
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Block {
    /// The statements in source order
    pub statements: Vec<Statement>,

    /// Expressions of the trailing `return`, if any
    pub return_exps: Option<Vec<Expression>>,

    /// Line of the token closing the block
    pub last_line: u32,
}

impl Block {
    /// Create a block without a return statement
    pub fn new(statements: Vec<Statement>, last_line: u32) -> Self {
        Block { statements, return_exps: None, last_line }
    }

    /// Attach a trailing return statement
    pub fn with_return(mut self, exps: Vec<Expression>) -> Self {
        self.return_exps = Some(exps);
        self
    }
}

/// Statement types
#[derive(Debug, Clone, PartialEq)]
pub enum Statement {
    /// `;`
    Empty,

    /// `break`
    Break { line: u32 },

    /// `::name::`
    Label { name: String, line: u32 },

    /// `goto name`
    Goto { name: String, line: u32 },

    /// `do ... end`
    Do(Block),

    /// A call evaluated for its side effects
    FunctionCall(FunctionCall),

    /// `while cond do ... end`
    While {
        /// Loop condition
        condition: Expression,
        /// Loop body
        block: Block,
        /// Line of the condition
        line: u32,
    },

    /// `repeat ... until cond`
    Repeat {
        /// Loop body
        block: Block,
        /// Exit condition, evaluated inside the body's scope
        condition: Expression,
        /// Line of the condition
        line: u32,
    },

    /// `if ... elseif ... else ... end`
    If(IfStatement),

    /// `for v = init, limit, step do ... end`
    ForNum(ForNumStatement),

    /// `for a, b in exps do ... end`
    ForIn(ForInStatement),

    /// `targets = exps`
    Assign {
        /// Names and table fields being assigned
        targets: Vec<AssignTarget>,
        /// Value expressions
        exps: Vec<Expression>,
        /// Line of the last token
        last_line: u32,
    },

    /// `local names = exps`
    LocalVarDecl {
        /// Declared names
        names: Vec<String>,
        /// Initializers, possibly fewer or more than the names
        exps: Vec<Expression>,
        /// Line of the last token
        last_line: u32,
    },

    /// `local function name() ... end`
    LocalFunctionDef {
        /// Name of the new local
        name: String,
        /// Function definition
        function: FunctionDef,
    },
}

/// Left-hand side of an assignment
#[derive(Debug, Clone, PartialEq)]
pub enum AssignTarget {
    /// A local, upvalue or global name
    Name(String),
    /// `prefix[key]` or `prefix.key`
    Index { prefix: Expression, key: Expression },
}

impl AssignTarget {
    /// Shorthand for a name target
    pub fn name(name: &str) -> Self {
        AssignTarget::Name(name.to_string())
    }
}

/// A conditional chain; an `else` is a trailing branch whose condition is `true`
#[derive(Debug, Clone, PartialEq)]
pub struct IfStatement {
    /// Branches in source order
    pub branches: Vec<IfBranch>,
}

/// One `if`/`elseif`/`else` arm
#[derive(Debug, Clone, PartialEq)]
pub struct IfBranch {
    /// Branch condition
    pub condition: Expression,
    /// Branch body
    pub block: Block,
    /// Line of the condition
    pub line: u32,
}

impl IfStatement {
    /// Create a chain from `(condition, block, line)` arms
    pub fn new(branches: Vec<(Expression, Block, u32)>) -> Self {
        IfStatement {
            branches: branches
                .into_iter()
                .map(|(condition, block, line)| IfBranch { condition, block, line })
                .collect(),
        }
    }

    /// Append an `else` arm
    pub fn with_else(mut self, block: Block, line: u32) -> Self {
        self.branches.push(IfBranch { condition: Expression::True, block, line });
        self
    }
}

/// Numeric for loop
#[derive(Debug, Clone, PartialEq)]
pub struct ForNumStatement {
    /// Loop variable name
    pub var_name: String,
    /// Initial value
    pub init: Expression,
    /// Limit value
    pub limit: Expression,
    /// Step value (defaults to 1)
    pub step: Option<Expression>,
    /// Loop body
    pub block: Block,
    /// Line of the `for` keyword
    pub line_of_for: u32,
    /// Line of the `do` keyword
    pub line_of_do: u32,
}

/// Generic (iterator) for loop
#[derive(Debug, Clone, PartialEq)]
pub struct ForInStatement {
    /// Loop variable names
    pub names: Vec<String>,
    /// Iterator expressions (function, state, control)
    pub exps: Vec<Expression>,
    /// Loop body
    pub block: Block,
    /// Line of the `do` keyword
    pub line_of_do: u32,
}

/// Function call (`f(args)` or `obj:method(args)`)
#[derive(Debug, Clone, PartialEq)]
pub struct FunctionCall {
    /// Callee or receiver
    pub prefix: Expression,
    /// Method name for `:` calls
    pub method: Option<String>,
    /// Arguments
    pub args: Vec<Expression>,
    /// Line of the call
    pub line: u32,
}

/// Function definition
#[derive(Debug, Clone, PartialEq)]
pub struct FunctionDef {
    /// Parameter names
    pub params: Vec<String>,
    /// Accepts `...`
    pub is_vararg: bool,
    /// Function body
    pub block: Block,
    /// Line of the `function` keyword
    pub line: u32,
    /// Line of the closing `end`
    pub last_line: u32,
}

/// Expression types
#[derive(Debug, Clone, PartialEq)]
pub enum Expression {
    Nil,
    True,
    False,
    Vararg,
    Integer(i64),
    Float(f64),
    String(String),
    Name(String),
    Parens(Box<Expression>),
    Call(Box<FunctionCall>),
    Function(Box<FunctionDef>),
    Table(TableConstructor),
    /// `prefix[key]` and `prefix.key`
    Index {
        prefix: Box<Expression>,
        key: Box<Expression>,
    },
    Unary {
        op: UnaryOperator,
        operand: Box<Expression>,
    },
    Binary {
        op: BinaryOperator,
        left: Box<Expression>,
        right: Box<Expression>,
    },
    /// `a .. b .. c`, flattened
    Concat(Vec<Expression>),
}

impl Expression {
    /// Shorthand for a name expression
    pub fn name(name: &str) -> Self {
        Expression::Name(name.to_string())
    }

    /// Shorthand for a string literal
    pub fn string(s: &str) -> Self {
        Expression::String(s.to_string())
    }

    /// Shorthand for `prefix[key]`
    pub fn index(prefix: Expression, key: Expression) -> Self {
        Expression::Index { prefix: Box::new(prefix), key: Box::new(key) }
    }

    /// Shorthand for a binary operation
    pub fn binary(op: BinaryOperator, left: Expression, right: Expression) -> Self {
        Expression::Binary { op, left: Box::new(left), right: Box::new(right) }
    }

    /// Shorthand for a plain call expression
    pub fn call(prefix: Expression, args: Vec<Expression>, line: u32) -> Self {
        Expression::Call(Box::new(FunctionCall { prefix, method: None, args, line }))
    }

    /// Calls and `...` can produce any number of values
    pub fn is_multi_value(&self) -> bool {
        matches!(self, Expression::Call(_) | Expression::Vararg)
    }
}

/// Table constructor
#[derive(Debug, Clone, PartialEq, Default)]
pub struct TableConstructor {
    /// Fields in source order
    pub fields: Vec<TableField>,
}

/// Table constructor field
#[derive(Debug, Clone, PartialEq)]
pub enum TableField {
    /// Positional `exp`
    Positional(Expression),
    /// `[key] = value` or `name = value`
    Keyed { key: Expression, value: Expression },
}

/// Unary operators
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryOperator {
    Minus,
    Not,
    Len,
    BNot,
}

/// Binary operators
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOperator {
    Add,
    Sub,
    Mul,
    Div,
    IDiv,
    Mod,
    Pow,
    BAnd,
    BOr,
    BXor,
    Shl,
    Shr,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    And,
    Or,
}
