use std::fmt;

use serde::Serialize;
use strum::{Display, EnumIter, IntoEnumIterator};

#[derive(Debug, Display, PartialEq, Eq, Hash, Clone, Copy, EnumIter, Serialize)]
#[strum(serialize_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum Register {
    Eax,
    Ebx,
    Ecx,
    Edx,
    Esi,
    Edi,
    Esp,
    Ebp,
    Eip,
}

/// Which bits of a register cell an operand name refers to.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum View {
    Full,
    Low16,
    Low8,
    High8,
}

impl View {
    const fn mask(self) -> u32 {
        match self {
            View::Full => 0xFFFF_FFFF,
            View::Low16 => 0xFFFF,
            View::Low8 | View::High8 => 0xFF,
        }
    }

    const fn shift(self) -> u32 {
        match self {
            View::High8 => 8,
            View::Full | View::Low16 | View::Low8 => 0,
        }
    }
}

/// A register name as written in source, e.g. `eax`, `ax` or `ah`.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub struct RegisterRef {
    pub register: Register,
    pub view: View,
}

impl RegisterRef {
    /// Parses a lowercase, trimmed register name.
    pub fn parse(name: &str) -> Option<Self> {
        use Register::*;
        use View::*;

        let (register, view) = match name {
            "eax" => (Eax, Full),
            "ebx" => (Ebx, Full),
            "ecx" => (Ecx, Full),
            "edx" => (Edx, Full),
            "esi" => (Esi, Full),
            "edi" => (Edi, Full),
            "esp" => (Esp, Full),
            "ebp" => (Ebp, Full),
            "eip" => (Eip, Full),

            "ax" => (Eax, Low16),
            "bx" => (Ebx, Low16),
            "cx" => (Ecx, Low16),
            "dx" => (Edx, Low16),
            "si" => (Esi, Low16),
            "di" => (Edi, Low16),
            "sp" => (Esp, Low16),
            "bp" => (Ebp, Low16),

            "al" => (Eax, Low8),
            "ah" => (Eax, High8),
            "bl" => (Ebx, Low8),
            "bh" => (Ebx, High8),
            "cl" => (Ecx, Low8),
            "ch" => (Ecx, High8),
            "dl" => (Edx, Low8),
            "dh" => (Edx, High8),

            _ => return None,
        };
        Some(Self { register, view })
    }
}

/// One 32-bit cell per register family. Sub-registers are masked views.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct RegisterFile {
    cells: [u32; 9],
}

impl RegisterFile {
    pub fn get(&self, register: Register) -> u32 {
        self.cells[register as usize]
    }

    pub fn set(&mut self, register: Register, value: u32) {
        self.cells[register as usize] = value;
    }

    /// Reads a view, zero-extended to 32 bits.
    pub fn read(&self, reg: RegisterRef) -> u32 {
        (self.get(reg.register) >> reg.view.shift()) & reg.view.mask()
    }

    /// Writes a view, leaving every bit outside it untouched.
    pub fn write(&mut self, reg: RegisterRef, value: u32) {
        let mask = reg.view.mask() << reg.view.shift();
        let cell = self.get(reg.register);
        let updated = (cell & !mask) | ((value << reg.view.shift()) & mask);
        self.set(reg.register, updated);
    }

    pub fn iter(&self) -> impl Iterator<Item = (Register, u32)> + '_ {
        Register::iter().map(|r| (r, self.get(r)))
    }

    pub fn snapshot(&self) -> RegisterSnapshot {
        RegisterSnapshot {
            eax: self.get(Register::Eax),
            ebx: self.get(Register::Ebx),
            ecx: self.get(Register::Ecx),
            edx: self.get(Register::Edx),
            esi: self.get(Register::Esi),
            edi: self.get(Register::Edi),
            esp: self.get(Register::Esp),
            ebp: self.get(Register::Ebp),
            eip: self.get(Register::Eip),
        }
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RegisterSnapshot {
    pub eax: u32,
    pub ebx: u32,
    pub ecx: u32,
    pub edx: u32,
    pub esi: u32,
    pub edi: u32,
    pub esp: u32,
    pub ebp: u32,
    pub eip: u32,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Flags {
    #[serde(rename = "ZF")]
    pub zero: bool,
    #[serde(rename = "SF")]
    pub sign: bool,
    #[serde(rename = "CF")]
    pub carry: bool,
    #[serde(rename = "OF")]
    pub overflow: bool,
    #[serde(rename = "PF")]
    pub parity: bool,
    #[serde(rename = "AF")]
    pub adjust: bool,
}

impl fmt::Display for Flags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "ZF={} SF={} CF={} OF={} PF={} AF={}",
            self.zero as u8,
            self.sign as u8,
            self.carry as u8,
            self.overflow as u8,
            self.parity as u8,
            self.adjust as u8
        )
    }
}

/// The result of resolving an operand.
///
/// Registers always resolve to their zero-extended contents. Literals keep
/// their sign and are only wrapped to 32 bits when written back, so carry
/// and borrow can be judged on the exact result. A literal without a single
/// valid digit resolves to `NaN`, which poisons arithmetic and reads as zero
/// once coerced to a machine word.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum Value {
    Int(i64),
    NaN,
}

impl Value {
    /// Parses a lowercase literal: `0x` hex, `0b` binary, decimal otherwise.
    /// Only the leading run of valid digits is used, so `12abc` is `12`.
    pub fn parse_literal(token: &str) -> Self {
        if let Some(hex) = token.strip_prefix("0x") {
            parse_digits(hex, 16, false)
        } else if let Some(bin) = token.strip_prefix("0b") {
            parse_digits(bin, 2, true)
        } else {
            parse_digits(token, 10, true)
        }
    }

    /// Coerces to a machine word, wrapping modulo 2^32.
    pub fn to_u32(self) -> u32 {
        match self {
            Value::Int(v) => v as u32,
            Value::NaN => 0,
        }
    }

    pub fn to_i32(self) -> i32 {
        self.to_u32() as i32
    }

    pub fn is_negative(self) -> bool {
        matches!(self, Value::Int(v) if v < 0)
    }

    /// Combines two values, propagating `NaN`.
    pub fn zip_with(self, other: Value, f: impl FnOnce(i64, i64) -> i64) -> Value {
        match (self, other) {
            (Value::Int(a), Value::Int(b)) => Value::Int(f(a, b)),
            _ => Value::NaN,
        }
    }

    pub fn map(self, f: impl FnOnce(i64) -> i64) -> Value {
        match self {
            Value::Int(v) => Value::Int(f(v)),
            Value::NaN => Value::NaN,
        }
    }
}

impl From<u32> for Value {
    fn from(value: u32) -> Self {
        Value::Int(value as i64)
    }
}

impl From<i32> for Value {
    fn from(value: i32) -> Self {
        Value::Int(value as i64)
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Int(v) => write!(f, "{v}"),
            Value::NaN => write!(f, "NaN"),
        }
    }
}

fn parse_digits(text: &str, radix: u32, signed: bool) -> Value {
    let (negative, digits) = match text.as_bytes().first() {
        Some(b'-') if signed => (true, &text[1..]),
        Some(b'+') if signed => (false, &text[1..]),
        _ => (false, text),
    };

    let mut value: Option<i64> = None;
    for digit in digits.chars().map_while(|c| c.to_digit(radix)) {
        let acc = value.unwrap_or(0);
        value = Some(acc.wrapping_mul(radix as i64).wrapping_add(digit as i64));
    }

    match value {
        Some(v) if negative => Value::Int(v.wrapping_neg()),
        Some(v) => Value::Int(v),
        None => Value::NaN,
    }
}
