use std::{collections::HashMap, time::Duration};

use once_cell::sync::Lazy;
use serde::Serialize;
use strum::{Display, EnumIter};
use thiserror::Error;

mod cpu;
mod memory;
mod program;
mod registers;

pub use cpu::{Cpu, HostIO, NullHostIO, RunStatus};
pub use memory::Memory;
pub use program::{Program, Statement};
pub use registers::{Flags, Register, RegisterFile, RegisterRef, RegisterSnapshot, Value, View};

/// Size of the flat memory buffer (1 MiB).
pub const DEFAULT_MEMORY_SIZE: usize = 1024 * 1024;
/// Initial value of `esp`; the stack grows downward from here.
pub const DEFAULT_STACK_POINTER: u32 = 0xFFFF;
/// Maximum number of instruction fetches before a run is aborted.
pub const DEFAULT_INSTRUCTION_BUDGET: usize = 100_000;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ExecutionError {
    #[error("Unknown instruction: {0}")]
    UnknownInstruction(String),
    #[error("Division by zero")]
    DivisionByZero,
    #[error("Maximum instruction count exceeded (infinite loop?)")]
    InstructionBudgetExceeded,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MachineConfig {
    pub memory_size: usize,
    pub initial_stack_pointer: u32,
    pub instruction_budget: usize,
}

impl Default for MachineConfig {
    fn default() -> Self {
        Self {
            memory_size: DEFAULT_MEMORY_SIZE,
            initial_stack_pointer: DEFAULT_STACK_POINTER,
            instruction_budget: DEFAULT_INSTRUCTION_BUDGET,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RunStats {
    pub instruction_count: usize,
    pub elapsed: Duration,
}

#[derive(Debug, Display, PartialEq, Copy, Clone, Hash, Eq, EnumIter)]
#[strum(serialize_all = "lowercase")]
pub enum Opcode {
    // Data movement
    Mov,

    // Arithmetic
    Add,
    Sub,
    Inc,
    Dec,
    Neg,
    Mul,
    Imul,
    Div,

    // Bitwise / logical
    And,
    Or,
    Xor,
    Not,
    Shl,
    Shr,
    Sar,
    Rol,
    Ror,

    // Comparisons
    Cmp,
    Test,

    // Unconditional jump
    Jmp,

    // Signed conditions
    Je,  // ZF=1
    Jne, // ZF=0
    Jg,  // ZF=0 and SF=0
    Jge, // SF=0
    Jl,  // SF=1
    Jle, // SF=1 or ZF=1

    // Unsigned conditions
    Ja,  // CF=0 and ZF=0
    Jae, // CF=0
    Jb,  // CF=1
    Jbe, // CF=1 or ZF=1

    // Sign conditions
    Js,  // SF=1
    Jns, // SF=0

    // Stack and calls
    Push,
    Pop,
    Call,
    Ret,

    // Output and control
    Print,
    Printc,
    Nop,
    Hlt,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperandKind {
    /// Written back through the register views.
    Destination,
    /// Resolved to a value.
    Source,
    /// Looked up in the label map.
    Label,
}

#[derive(Debug, Clone)]
pub struct InstructionPattern {
    pub opcode: Opcode,
    pub operands: &'static [OperandKind],
    pub mnemonic: &'static str,
}

impl InstructionPattern {
    const fn new(opcode: Opcode, operands: &'static [OperandKind], mnemonic: &'static str) -> Self {
        Self {
            opcode,
            operands,
            mnemonic,
        }
    }

    pub fn arity(&self) -> usize {
        self.operands.len()
    }
}

const BINARY: &[OperandKind] = &[OperandKind::Destination, OperandKind::Source];
const UNARY: &[OperandKind] = &[OperandKind::Destination];
const SOURCE: &[OperandKind] = &[OperandKind::Source];
const COMPARE: &[OperandKind] = &[OperandKind::Source, OperandKind::Source];
const TARGET: &[OperandKind] = &[OperandKind::Label];
const NONE: &[OperandKind] = &[];

/// Every accepted (mnemonic, arity) pair, in match order.
pub static PATTERNS: &[InstructionPattern] = &[
    InstructionPattern::new(Opcode::Mov, BINARY, "mov"),
    // Arithmetic
    InstructionPattern::new(Opcode::Add, BINARY, "add"),
    InstructionPattern::new(Opcode::Sub, BINARY, "sub"),
    InstructionPattern::new(Opcode::Inc, UNARY, "inc"),
    InstructionPattern::new(Opcode::Dec, UNARY, "dec"),
    InstructionPattern::new(Opcode::Mul, SOURCE, "mul"),
    InstructionPattern::new(Opcode::Imul, BINARY, "imul"),
    InstructionPattern::new(Opcode::Div, SOURCE, "div"),
    // Logical / Bitwise
    InstructionPattern::new(Opcode::And, BINARY, "and"),
    InstructionPattern::new(Opcode::Or, BINARY, "or"),
    InstructionPattern::new(Opcode::Xor, BINARY, "xor"),
    InstructionPattern::new(Opcode::Not, UNARY, "not"),
    InstructionPattern::new(Opcode::Neg, UNARY, "neg"),
    InstructionPattern::new(Opcode::Shl, BINARY, "shl"),
    InstructionPattern::new(Opcode::Shr, BINARY, "shr"),
    InstructionPattern::new(Opcode::Sar, BINARY, "sar"),
    InstructionPattern::new(Opcode::Rol, BINARY, "rol"),
    InstructionPattern::new(Opcode::Ror, BINARY, "ror"),
    // Comparison and jumps
    InstructionPattern::new(Opcode::Cmp, COMPARE, "cmp"),
    InstructionPattern::new(Opcode::Test, COMPARE, "test"),
    InstructionPattern::new(Opcode::Jmp, TARGET, "jmp"),
    InstructionPattern::new(Opcode::Je, TARGET, "je"),
    InstructionPattern::new(Opcode::Je, TARGET, "jz"),
    InstructionPattern::new(Opcode::Jne, TARGET, "jne"),
    InstructionPattern::new(Opcode::Jne, TARGET, "jnz"),
    InstructionPattern::new(Opcode::Jg, TARGET, "jg"),
    InstructionPattern::new(Opcode::Jg, TARGET, "jnle"),
    InstructionPattern::new(Opcode::Jge, TARGET, "jge"),
    InstructionPattern::new(Opcode::Jge, TARGET, "jnl"),
    InstructionPattern::new(Opcode::Jl, TARGET, "jl"),
    InstructionPattern::new(Opcode::Jl, TARGET, "jnge"),
    InstructionPattern::new(Opcode::Jle, TARGET, "jle"),
    InstructionPattern::new(Opcode::Jle, TARGET, "jng"),
    InstructionPattern::new(Opcode::Ja, TARGET, "ja"),
    InstructionPattern::new(Opcode::Ja, TARGET, "jnbe"),
    InstructionPattern::new(Opcode::Jae, TARGET, "jae"),
    InstructionPattern::new(Opcode::Jae, TARGET, "jnb"),
    InstructionPattern::new(Opcode::Jb, TARGET, "jb"),
    InstructionPattern::new(Opcode::Jb, TARGET, "jnae"),
    InstructionPattern::new(Opcode::Jbe, TARGET, "jbe"),
    InstructionPattern::new(Opcode::Jbe, TARGET, "jna"),
    InstructionPattern::new(Opcode::Js, TARGET, "js"),
    InstructionPattern::new(Opcode::Jns, TARGET, "jns"),
    // Stack and calls
    InstructionPattern::new(Opcode::Push, SOURCE, "push"),
    InstructionPattern::new(Opcode::Pop, UNARY, "pop"),
    InstructionPattern::new(Opcode::Call, TARGET, "call"),
    InstructionPattern::new(Opcode::Ret, NONE, "ret"),
    // Output and control
    InstructionPattern::new(Opcode::Nop, NONE, "nop"),
    InstructionPattern::new(Opcode::Hlt, NONE, "hlt"),
    InstructionPattern::new(Opcode::Hlt, NONE, "halt"),
    InstructionPattern::new(Opcode::Print, SOURCE, "print"),
    InstructionPattern::new(Opcode::Printc, SOURCE, "printc"),
];

static PATTERNS_BY_MNEMONIC: Lazy<HashMap<&'static str, Vec<&'static InstructionPattern>>> =
    Lazy::new(|| {
        let mut map: HashMap<_, Vec<_>> = HashMap::new();
        for pattern in PATTERNS {
            map.entry(pattern.mnemonic).or_default().push(pattern);
        }
        map
    });

/// All patterns sharing a mnemonic, in declaration order.
pub fn patterns_for_mnemonic(mnemonic: &str) -> &'static [&'static InstructionPattern] {
    PATTERNS_BY_MNEMONIC
        .get(mnemonic)
        .map(Vec::as_slice)
        .unwrap_or_default()
}

/// Looks up the pattern for a lowercase mnemonic used with `arity` operands.
/// The first declared match wins.
pub fn get_pattern_by_mnemonic(
    mnemonic: &str,
    arity: usize,
) -> Option<&'static InstructionPattern> {
    patterns_for_mnemonic(mnemonic)
        .iter()
        .find(|pattern| pattern.arity() == arity)
        .copied()
}
