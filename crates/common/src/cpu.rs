use std::time::{Duration, Instant};

use serde::Serialize;
use tracing::{debug, info, trace, warn};

use crate::{
    get_pattern_by_mnemonic,
    memory::Memory,
    program::{Program, Statement},
    registers::{Flags, Register, RegisterFile, RegisterRef, Value},
    ExecutionError, MachineConfig, Opcode, RunStats,
};

/// Receives program output as `print`/`printc` produce it.
pub trait HostIO: std::fmt::Debug {
    fn write_output(&mut self, text: &str);
}

#[derive(Debug)]
pub struct NullHostIO;

impl HostIO for NullHostIO {
    fn write_output(&mut self, _text: &str) {
        // Default: do nothing, the session keeps its own copy
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Running,
    /// Stopped by `hlt`/`halt`.
    Halted,
    /// Ran past the last instruction.
    Completed,
    Faulted,
}

/// What the dispatcher does with the program counter after an instruction.
enum Flow {
    Next,
    Jump(usize),
    Halt,
}

/// Flag predicate tested by a jump.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Condition {
    Always,

    // Signed
    Equal,
    NotEqual,
    Greater,
    GreaterOrEqual,
    Less,
    LessOrEqual,

    // Unsigned
    Above,
    AboveOrEqual,
    Below,
    BelowOrEqual,

    Sign,
    NotSign,
}

impl Condition {
    fn holds(self, f: &Flags) -> bool {
        match self {
            Condition::Always => true,
            Condition::Equal => f.zero,
            Condition::NotEqual => !f.zero,
            Condition::Greater => !f.zero && !f.sign,
            Condition::GreaterOrEqual => !f.sign,
            Condition::Less => f.sign,
            Condition::LessOrEqual => f.sign || f.zero,
            Condition::Above => !f.carry && !f.zero,
            Condition::AboveOrEqual => !f.carry,
            Condition::Below => f.carry,
            Condition::BelowOrEqual => f.carry || f.zero,
            Condition::Sign => f.sign,
            Condition::NotSign => !f.sign,
        }
    }
}

/// One execution session: every piece of mutable machine state for a run.
#[derive(Debug)]
pub struct Cpu<IO: HostIO> {
    program: Program,
    registers: RegisterFile,
    flags: Flags,
    memory: Memory,
    pc: usize,
    status: RunStatus,
    output: String,
    instruction_count: usize,
    instruction_budget: usize,
    elapsed: Duration,
    pub host_io: IO,
}

impl<IO: HostIO> Cpu<IO> {
    pub fn new(program: Program, config: &MachineConfig, host_io: IO) -> Self {
        let mut registers = RegisterFile::default();
        registers.set(Register::Esp, config.initial_stack_pointer);

        Self {
            program,
            registers,
            flags: Flags::default(),
            memory: Memory::new(config.memory_size),
            pc: 0,
            status: RunStatus::Running,
            output: String::new(),
            instruction_count: 0,
            instruction_budget: config.instruction_budget,
            elapsed: Duration::ZERO,
            host_io,
        }
    }

    pub fn program(&self) -> &Program {
        &self.program
    }

    pub fn registers(&self) -> &RegisterFile {
        &self.registers
    }

    pub fn flags(&self) -> &Flags {
        &self.flags
    }

    pub fn memory(&self) -> &Memory {
        &self.memory
    }

    pub fn pc(&self) -> usize {
        self.pc
    }

    pub fn status(&self) -> RunStatus {
        self.status
    }

    pub fn output(&self) -> &str {
        &self.output
    }

    pub fn instruction_count(&self) -> usize {
        self.instruction_count
    }

    pub fn stats(&self) -> RunStats {
        RunStats {
            instruction_count: self.instruction_count,
            elapsed: self.elapsed,
        }
    }

    /// Runs until the program halts, runs off the end, or faults.
    ///
    /// On a fault the session keeps every mutation made up to that point so
    /// the caller can inspect it.
    pub fn execute(&mut self) -> Result<RunStats, ExecutionError> {
        if self.status != RunStatus::Running {
            return Ok(self.stats());
        }

        let start = Instant::now();
        let result = self.run();
        self.elapsed += start.elapsed();

        match result {
            Ok(()) => {
                info!(
                    status = ?self.status,
                    instructions = self.instruction_count,
                    "run finished"
                );
                Ok(self.stats())
            }
            Err(err) => {
                self.status = RunStatus::Faulted;
                warn!(
                    pc = self.pc,
                    instructions = self.instruction_count,
                    "run faulted: {err}"
                );
                Err(err)
            }
        }
    }

    fn run(&mut self) -> Result<(), ExecutionError> {
        while self.status == RunStatus::Running {
            if self.pc >= self.program.len() {
                self.status = RunStatus::Completed;
                break;
            }

            self.instruction_count += 1;
            if self.instruction_count > self.instruction_budget {
                return Err(ExecutionError::InstructionBudgetExceeded);
            }

            match self.step()? {
                Flow::Next => self.pc += 1,
                Flow::Jump(target) => self.pc = target,
                Flow::Halt => self.status = RunStatus::Halted,
            }
        }
        Ok(())
    }

    fn step(&mut self) -> Result<Flow, ExecutionError> {
        let line = &self.program.instructions[self.pc];
        trace!(pc = self.pc, instruction = %line, "execute");

        let Some(Statement { mnemonic, operands }) = Statement::parse(line) else {
            return Ok(Flow::Next);
        };
        let pattern = get_pattern_by_mnemonic(&mnemonic, operands.len())
            .ok_or(ExecutionError::UnknownInstruction(mnemonic))?;
        let ops = operands.as_slice();

        let flow = match pattern.opcode {
            Opcode::Mov => {
                let value = self.resolve(&ops[1]);
                self.assign(&ops[0], value);
                Flow::Next
            }
            Opcode::Add => {
                let result = self.resolve(&ops[0]).zip_with(self.resolve(&ops[1]), i64::wrapping_add);
                self.assign(&ops[0], result);
                self.update_flags(result, true);
                self.flags.carry = matches!(result, Value::Int(v) if !(-0x8000_0000..=0xFFFF_FFFF).contains(&v));
                Flow::Next
            }
            Opcode::Sub => {
                let result = self.resolve(&ops[0]).zip_with(self.resolve(&ops[1]), i64::wrapping_sub);
                self.assign(&ops[0], result);
                self.update_flags(result, true);
                self.flags.carry = result.is_negative();
                Flow::Next
            }
            Opcode::Inc => {
                let result = self.resolve(&ops[0]).map(|v| v.wrapping_add(1));
                self.assign(&ops[0], result);
                self.update_flags(result, true);
                Flow::Next
            }
            Opcode::Dec => {
                let result = self.resolve(&ops[0]).map(|v| v.wrapping_sub(1));
                self.assign(&ops[0], result);
                self.update_flags(result, true);
                Flow::Next
            }
            Opcode::Neg => {
                let result = self.resolve(&ops[0]).map(i64::wrapping_neg);
                self.assign(&ops[0], result);
                self.update_flags(result, true);
                Flow::Next
            }
            Opcode::Mul => {
                let a = self.registers.get(Register::Eax) as u64;
                let product = a * self.resolve(&ops[0]).to_u32() as u64;
                self.registers.set(Register::Eax, product as u32);
                self.registers.set(Register::Edx, (product >> 32) as u32);
                Flow::Next
            }
            Opcode::Imul => {
                let result = self.resolve(&ops[0]).zip_with(self.resolve(&ops[1]), i64::wrapping_mul);
                self.assign(&ops[0], result);
                Flow::Next
            }
            Opcode::Div => {
                let dividend = self.registers.get(Register::Eax);
                let (quotient, remainder) = match self.resolve(&ops[0]) {
                    Value::Int(v) => match v as u32 {
                        0 => return Err(ExecutionError::DivisionByZero),
                        divisor => (dividend / divisor, dividend % divisor),
                    },
                    // a NaN divisor poisons both results
                    Value::NaN => (0, 0),
                };
                self.registers.set(Register::Eax, quotient);
                self.registers.set(Register::Edx, remainder);
                Flow::Next
            }
            Opcode::And => self.logic(ops, true, |a, b| a & b),
            Opcode::Or => self.logic(ops, true, |a, b| a | b),
            Opcode::Xor => self.logic(ops, true, |a, b| a ^ b),
            Opcode::Test => self.logic(ops, false, |a, b| a & b),
            Opcode::Not => {
                let result = !self.resolve(&ops[0]).to_i32();
                self.assign(&ops[0], result.into());
                Flow::Next
            }
            Opcode::Shl => {
                let count = self.resolve(&ops[1]).to_u32();
                let result = self.resolve(&ops[0]).to_i32().wrapping_shl(count);
                self.assign(&ops[0], result.into());
                self.update_flags(result.into(), true);
                Flow::Next
            }
            Opcode::Shr => {
                let count = self.resolve(&ops[1]).to_u32();
                let result = self.resolve(&ops[0]).to_u32().wrapping_shr(count);
                self.assign(&ops[0], result.into());
                self.update_flags(result.into(), true);
                Flow::Next
            }
            Opcode::Sar => {
                let count = self.resolve(&ops[1]).to_u32();
                let result = self.resolve(&ops[0]).to_i32().wrapping_shr(count);
                self.assign(&ops[0], result.into());
                self.update_flags(result.into(), true);
                Flow::Next
            }
            Opcode::Rol => {
                let count = self.resolve(&ops[1]).to_u32() % 32;
                let result = self.resolve(&ops[0]).to_u32().rotate_left(count);
                self.assign(&ops[0], result.into());
                Flow::Next
            }
            Opcode::Ror => {
                let count = self.resolve(&ops[1]).to_u32() % 32;
                let result = self.resolve(&ops[0]).to_u32().rotate_right(count);
                self.assign(&ops[0], result.into());
                Flow::Next
            }
            Opcode::Cmp => {
                let result = self.resolve(&ops[0]).zip_with(self.resolve(&ops[1]), i64::wrapping_sub);
                self.update_flags(result, true);
                self.flags.carry = result.is_negative();
                Flow::Next
            }
            Opcode::Jmp => self.jump(Condition::Always, &ops[0]),
            Opcode::Je => self.jump(Condition::Equal, &ops[0]),
            Opcode::Jne => self.jump(Condition::NotEqual, &ops[0]),
            Opcode::Jg => self.jump(Condition::Greater, &ops[0]),
            Opcode::Jge => self.jump(Condition::GreaterOrEqual, &ops[0]),
            Opcode::Jl => self.jump(Condition::Less, &ops[0]),
            Opcode::Jle => self.jump(Condition::LessOrEqual, &ops[0]),
            Opcode::Ja => self.jump(Condition::Above, &ops[0]),
            Opcode::Jae => self.jump(Condition::AboveOrEqual, &ops[0]),
            Opcode::Jb => self.jump(Condition::Below, &ops[0]),
            Opcode::Jbe => self.jump(Condition::BelowOrEqual, &ops[0]),
            Opcode::Js => self.jump(Condition::Sign, &ops[0]),
            Opcode::Jns => self.jump(Condition::NotSign, &ops[0]),
            Opcode::Push => {
                let value = self.resolve(&ops[0]).to_u32();
                self.push_stack(value);
                Flow::Next
            }
            Opcode::Pop => {
                let value = self.pop_stack();
                self.assign(&ops[0], value.into());
                Flow::Next
            }
            Opcode::Call => {
                let return_address = self.pc + 1;
                self.push_stack(return_address as u32);
                match self.program.label(&ops[0]) {
                    Some(target) => {
                        debug!(target, return_address, "call");
                        Flow::Jump(target)
                    }
                    None => {
                        debug!(label = %ops[0], "unresolved call target, falling through");
                        Flow::Next
                    }
                }
            }
            Opcode::Ret => {
                let return_address = self.pop_stack();
                debug!(return_address, "ret");
                Flow::Jump(return_address as usize)
            }
            Opcode::Print => {
                let text = self.resolve(&ops[0]).to_string();
                self.emit(&text);
                Flow::Next
            }
            Opcode::Printc => {
                let code = self.resolve(&ops[0]).to_u32() as u16;
                let ch = char::from_u32(code as u32).unwrap_or(char::REPLACEMENT_CHARACTER);
                self.emit(ch.encode_utf8(&mut [0; 4]));
                Flow::Next
            }
            Opcode::Nop => Flow::Next,
            Opcode::Hlt => Flow::Halt,
        };

        Ok(flow)
    }

    /// Resolves a register name or numeric literal.
    pub fn resolve(&self, token: &str) -> Value {
        let token = token.trim().to_lowercase();
        match RegisterRef::parse(&token) {
            Some(reg) => self.registers.read(reg).into(),
            None => Value::parse_literal(&token),
        }
    }

    /// Writes `value` through a register view, wrapped to the view's width.
    /// `NaN` is stored as zero and non-register operands are ignored.
    pub fn assign(&mut self, token: &str, value: Value) {
        let name = token.trim().to_lowercase();
        match RegisterRef::parse(&name) {
            Some(reg) => self.registers.write(reg, value.to_u32()),
            None => debug!(operand = %token, "write to non-register operand ignored"),
        }
    }

    /// ZF and SF from the 32-bit result; PF from its low byte on the
    /// arithmetic path only.
    fn update_flags(&mut self, result: Value, arithmetic: bool) {
        let result = result.to_i32();
        self.flags.zero = result == 0;
        self.flags.sign = result < 0;

        if arithmetic {
            self.flags.parity = (result as u8).count_ones() % 2 == 0;
        }
    }

    /// `and`, `or`, `xor` and `test`: ZF/SF from the result, CF and OF
    /// cleared, PF untouched.
    fn logic(&mut self, ops: &[String], write_back: bool, f: impl FnOnce(i32, i32) -> i32) -> Flow {
        let result = f(self.resolve(&ops[0]).to_i32(), self.resolve(&ops[1]).to_i32());
        if write_back {
            self.assign(&ops[0], result.into());
        }
        self.update_flags(result.into(), false);
        self.flags.carry = false;
        self.flags.overflow = false;
        Flow::Next
    }

    /// Transfers to `label` when `condition` holds and the label resolves.
    fn jump(&self, condition: Condition, label: &str) -> Flow {
        let taken = condition.holds(&self.flags);
        match self.program.label(label) {
            Some(target) if taken => {
                debug!(?condition, target, "jump taken");
                Flow::Jump(target)
            }
            Some(_) => Flow::Next,
            None => {
                debug!(?condition, label, "unresolved label, falling through");
                Flow::Next
            }
        }
    }

    fn push_stack(&mut self, value: u32) {
        let sp = self.registers.get(Register::Esp).wrapping_sub(4);
        self.registers.set(Register::Esp, sp);
        self.memory.write_u32(sp, value);
    }

    fn pop_stack(&mut self) -> u32 {
        let sp = self.registers.get(Register::Esp);
        let value = self.memory.read_u32(sp);
        self.registers.set(Register::Esp, sp.wrapping_add(4));
        value
    }

    fn emit(&mut self, text: &str) {
        self.output.push_str(text);
        self.host_io.write_output(text);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn machine(source: &str) -> Cpu<NullHostIO> {
        Cpu::new(Program::load(source), &MachineConfig::default(), NullHostIO)
    }

    fn run_program(source: &str) -> Cpu<NullHostIO> {
        let mut cpu = machine(source);
        cpu.execute().unwrap();
        cpu
    }

    fn reg(cpu: &Cpu<NullHostIO>, register: Register) -> u32 {
        cpu.registers().get(register)
    }

    #[test]
    fn test_mov_and_halt() {
        let cpu = run_program("mov eax, 42\nhlt\nmov eax, 1");
        assert_eq!(reg(&cpu, Register::Eax), 42);
        assert_eq!(cpu.status(), RunStatus::Halted);
        assert_eq!(cpu.instruction_count(), 2);
        assert_eq!(cpu.pc(), 1);
    }

    #[test]
    fn test_completes_past_last_instruction() {
        let cpu = run_program("nop\nnop");
        assert_eq!(cpu.status(), RunStatus::Completed);
        assert_eq!(cpu.instruction_count(), 2);
    }

    #[test]
    fn test_empty_program() {
        let cpu = run_program("; nothing here\n\n");
        assert_eq!(cpu.status(), RunStatus::Completed);
        assert_eq!(cpu.instruction_count(), 0);
    }

    #[test]
    fn test_initial_state() {
        let cpu = machine("");
        assert_eq!(reg(&cpu, Register::Esp), 0xFFFF);
        assert_eq!(cpu.memory().len(), 1024 * 1024);
        assert_eq!(*cpu.flags(), Flags::default());
    }

    #[test]
    fn test_add_wraps_and_sets_carry() {
        let cpu = run_program("mov eax, 0xFFFFFFFF\nadd eax, 2");
        assert_eq!(reg(&cpu, Register::Eax), 1);
        assert!(cpu.flags().carry);
        assert!(!cpu.flags().zero);
        assert!(!cpu.flags().parity);
    }

    #[test]
    fn test_add_to_zero() {
        let cpu = run_program("mov eax, 0xFFFFFFFF\nadd eax, 1");
        assert_eq!(reg(&cpu, Register::Eax), 0);
        assert!(cpu.flags().zero);
        assert!(cpu.flags().carry);
        assert!(cpu.flags().parity);
    }

    #[test]
    fn test_add_sign_flag() {
        let cpu = run_program("mov eax, 0x7FFFFFFF\nadd eax, 1");
        assert_eq!(reg(&cpu, Register::Eax), 0x8000_0000);
        assert!(cpu.flags().sign);
        assert!(!cpu.flags().carry);
    }

    #[test]
    fn test_sub_borrow() {
        let cpu = run_program("mov eax, 3\nsub eax, 5");
        assert_eq!(reg(&cpu, Register::Eax), 0xFFFF_FFFE);
        assert!(cpu.flags().carry);
        assert!(cpu.flags().sign);
        assert!(!cpu.flags().zero);
    }

    #[test]
    fn test_sub_matches_wrapping_sub() {
        for (a, b) in [(0u32, 1u32), (100, 99), (0x8000_0000, 1), (7, 0xFFFF_FFFF)] {
            let cpu = run_program(&format!("mov eax, {a}\nmov ebx, {b}\nsub eax, ebx"));
            assert_eq!(reg(&cpu, Register::Eax), a.wrapping_sub(b));
            assert_eq!(cpu.flags().carry, a < b);
        }
    }

    #[test]
    fn test_inc_dec_leave_carry() {
        let cpu = run_program("mov eax, 1\nsub eax, 2\ninc eax\ninc eax");
        assert_eq!(reg(&cpu, Register::Eax), 1);
        assert!(cpu.flags().carry);

        let cpu = run_program("mov ecx, 1\ndec ecx");
        assert!(cpu.flags().zero);
        assert!(cpu.flags().parity);
    }

    #[test]
    fn test_neg() {
        let cpu = run_program("mov ebx, 5\nneg ebx");
        assert_eq!(reg(&cpu, Register::Ebx), (-5i32) as u32);
        assert!(cpu.flags().sign);
        assert!(!cpu.flags().carry);
    }

    #[test]
    fn test_parity_uses_low_byte_only() {
        // 0x0300: low byte 0 has zero set bits
        let cpu = run_program("mov eax, 0x2FF\nadd eax, 1");
        assert!(cpu.flags().parity);
        // 0x07: three set bits
        let cpu = run_program("mov eax, 6\nadd eax, 1");
        assert!(!cpu.flags().parity);
    }

    #[test]
    fn test_mul_splits_product() {
        let cpu = run_program("mov eax, 0x10000\nmov ebx, 0x30000\nmul ebx");
        assert_eq!(reg(&cpu, Register::Eax), 0);
        assert_eq!(reg(&cpu, Register::Edx), 3);

        let cpu = run_program("mov eax, 6\nmul 7");
        assert_eq!(reg(&cpu, Register::Eax), 42);
        assert_eq!(reg(&cpu, Register::Edx), 0);
    }

    #[test]
    fn test_mul_negative_literal_is_unsigned() {
        let cpu = run_program("mov eax, 2\nmul -1");
        assert_eq!(reg(&cpu, Register::Eax), 0xFFFF_FFFE);
        assert_eq!(reg(&cpu, Register::Edx), 1);

        let cpu = run_program("mov eax, 5\nmov edx, 9\nmul bogus");
        assert_eq!(reg(&cpu, Register::Eax), 0);
        assert_eq!(reg(&cpu, Register::Edx), 0);
    }

    #[test]
    fn test_mul_leaves_flags() {
        let cpu = run_program("mov eax, 0\ncmp eax, 0\nmov eax, 3\nmul 3");
        assert!(cpu.flags().zero);
    }

    #[test]
    fn test_imul_truncates() {
        let cpu = run_program("mov eax, 0x10000\nimul eax, 0x10001");
        assert_eq!(reg(&cpu, Register::Eax), 0x10000);

        let cpu = run_program("mov al, 20\nimul al, 20");
        assert_eq!(reg(&cpu, Register::Eax), 400 & 0xFF);
    }

    #[test]
    fn test_div() {
        let cpu = run_program("mov eax, 47\nmov ecx, 5\ndiv ecx");
        assert_eq!(reg(&cpu, Register::Eax), 9);
        assert_eq!(reg(&cpu, Register::Edx), 2);
    }

    #[test]
    fn test_div_is_unsigned() {
        let cpu = run_program("mov eax, -1\ndiv 2");
        assert_eq!(reg(&cpu, Register::Eax), 0x7FFF_FFFF);
        assert_eq!(reg(&cpu, Register::Edx), 1);
    }

    #[test]
    fn test_division_by_zero_keeps_registers() {
        let mut cpu = machine("mov eax, 10\nmov edx, 3\nmov ebx, 0\ndiv ebx\nmov eax, 1");
        assert_eq!(cpu.execute(), Err(ExecutionError::DivisionByZero));
        assert_eq!(reg(&cpu, Register::Eax), 10);
        assert_eq!(reg(&cpu, Register::Edx), 3);
        assert_eq!(cpu.status(), RunStatus::Faulted);
        assert_eq!(cpu.pc(), 3);
        assert_eq!(cpu.instruction_count(), 4);
    }

    #[test]
    fn test_div_by_nan_zeroes_results() {
        let cpu = run_program("mov eax, 10\nmov edx, 3\ndiv bogus");
        assert_eq!(cpu.status(), RunStatus::Completed);
        assert_eq!(reg(&cpu, Register::Eax), 0);
        assert_eq!(reg(&cpu, Register::Edx), 0);
    }

    #[test]
    fn test_condition_table() {
        let flags = |zero, sign, carry| Flags {
            zero,
            sign,
            carry,
            ..Default::default()
        };
        let clear = flags(false, false, false);
        let equal = flags(true, false, false);
        let below = flags(false, true, true);

        assert!(Condition::Always.holds(&clear));
        assert!(Condition::Greater.holds(&clear));
        assert!(!Condition::Greater.holds(&equal));
        assert!(Condition::LessOrEqual.holds(&equal));
        assert!(Condition::Above.holds(&clear));
        assert!(!Condition::Above.holds(&below));
        assert!(Condition::BelowOrEqual.holds(&below));
        assert!(Condition::Sign.holds(&below));
        assert!(!Condition::NotSign.holds(&below));
    }

    #[test]
    fn test_logic_clears_carry_and_keeps_parity() {
        let cpu = run_program("mov eax, 0\nsub eax, 1\nand eax, 0x0F");
        assert_eq!(reg(&cpu, Register::Eax), 0x0F);
        assert!(!cpu.flags().carry);
        assert!(!cpu.flags().overflow);
        // PF still reflects the `sub` result 0xFFFFFFFF
        assert!(cpu.flags().parity);
    }

    #[test]
    fn test_or_xor() {
        let cpu = run_program("mov eax, 0x0F\nor eax, 0xF0");
        assert_eq!(reg(&cpu, Register::Eax), 0xFF);

        let cpu = run_program("mov eax, 0xFF\nxor eax, eax");
        assert_eq!(reg(&cpu, Register::Eax), 0);
        assert!(cpu.flags().zero);
    }

    #[test]
    fn test_test_discards_result() {
        let cpu = run_program("mov eax, 0x80000000\ntest eax, eax");
        assert_eq!(reg(&cpu, Register::Eax), 0x8000_0000);
        assert!(cpu.flags().sign);
        assert!(!cpu.flags().zero);
    }

    #[test]
    fn test_not_leaves_flags() {
        let cpu = run_program("mov eax, 0\nnot eax");
        assert_eq!(reg(&cpu, Register::Eax), 0xFFFF_FFFF);
        assert!(!cpu.flags().sign);
    }

    #[test]
    fn test_shifts() {
        let cpu = run_program("mov eax, 1\nshl eax, 31");
        assert_eq!(reg(&cpu, Register::Eax), 0x8000_0000);
        assert!(cpu.flags().sign);

        let cpu = run_program("mov eax, 0x80000000\nshr eax, 4");
        assert_eq!(reg(&cpu, Register::Eax), 0x0800_0000);

        let cpu = run_program("mov eax, 0x80000000\nsar eax, 4");
        assert_eq!(reg(&cpu, Register::Eax), 0xF800_0000);

        let cpu = run_program("mov eax, 3\nshl eax, 33");
        assert_eq!(reg(&cpu, Register::Eax), 6);
    }

    #[test]
    fn test_rotates() {
        let cpu = run_program("mov eax, 0x80000001\nrol eax, 4");
        assert_eq!(reg(&cpu, Register::Eax), 0x0000_0018);

        let cpu = run_program("mov eax, 0x80000001\nror eax, 36");
        assert_eq!(reg(&cpu, Register::Eax), 0x1800_0000);

        let cpu = run_program("mov eax, 0x12345678\nrol eax, 0");
        assert_eq!(reg(&cpu, Register::Eax), 0x1234_5678);
    }

    #[test]
    fn test_cmp_does_not_write() {
        let cpu = run_program("mov eax, 5\ncmp eax, 5");
        assert_eq!(reg(&cpu, Register::Eax), 5);
        assert!(cpu.flags().zero);
        assert!(!cpu.flags().carry);

        let cpu = run_program("mov eax, 4\ncmp eax, 5");
        assert!(cpu.flags().carry);
        assert!(cpu.flags().sign);
    }

    #[test]
    fn test_sub_register_aliasing() {
        let cpu = run_program("mov eax, 0x12345678\nmov al, 0xFF");
        assert_eq!(reg(&cpu, Register::Eax), 0x1234_56FF);

        let cpu = run_program("mov eax, 0xAABBCCDD\nmov ebx, al\nmov ecx, ah\nmov edx, ax");
        assert_eq!(reg(&cpu, Register::Ebx), 0xDD);
        assert_eq!(reg(&cpu, Register::Ecx), 0xCC);
        assert_eq!(reg(&cpu, Register::Edx), 0xCCDD);
    }

    #[test]
    fn test_operands_are_case_insensitive() {
        let cpu = run_program("MOV EAX, 0XFF\nAdd Eax, 1");
        assert_eq!(reg(&cpu, Register::Eax), 0x100);
    }

    #[test]
    fn test_malformed_literal_is_nan() {
        let cpu = run_program("mov eax, 7\nmov eax, bogus\nprint bogus");
        assert_eq!(reg(&cpu, Register::Eax), 0);
        assert_eq!(cpu.output(), "NaN");

        let cpu = run_program("mov eax, 1\nadd eax, nothing");
        assert_eq!(reg(&cpu, Register::Eax), 0);
        assert!(cpu.flags().zero);
        assert!(!cpu.flags().carry);
    }

    #[test]
    fn test_write_to_literal_is_ignored() {
        let cpu = run_program("mov 5, 6\nprint 5");
        assert_eq!(cpu.output(), "5");
    }

    #[test]
    fn test_push_pop_round_trip() {
        let cpu = run_program("mov eax, 0xDEADBEEF\npush eax\npop ebx");
        assert_eq!(reg(&cpu, Register::Ebx), 0xDEAD_BEEF);
        assert_eq!(reg(&cpu, Register::Esp), 0xFFFF);
    }

    #[test]
    fn test_push_layout() {
        let cpu = run_program("push 0x11223344");
        assert_eq!(reg(&cpu, Register::Esp), 0xFFFB);
        assert_eq!(
            cpu.memory().window(0xFFFB..0xFFFF),
            &[0x44, 0x33, 0x22, 0x11]
        );
    }

    #[test]
    fn test_stack_is_lifo() {
        let cpu = run_program(
            "mov eax, 10\nmov ebx, 20\nmov ecx, 30\n\
             push eax\npush ebx\npush ecx\n\
             pop edx\npop esi\npop edi\n\
             print edx\nprintc 32\nprint esi\nprintc 32\nprint edi",
        );
        assert_eq!(cpu.output(), "30 20 10");
    }

    #[test]
    fn test_pop_into_sub_register() {
        let cpu = run_program("mov ebx, 0xFFFFFFFF\npush 0x1234\npop bl");
        assert_eq!(reg(&cpu, Register::Ebx), 0xFFFF_FF34);
    }

    #[test]
    fn test_forward_label() {
        let cpu = run_program("jmp skip\nmov eax, 1\nskip:\nmov ebx, 2");
        assert_eq!(reg(&cpu, Register::Eax), 0);
        assert_eq!(reg(&cpu, Register::Ebx), 2);
    }

    #[test]
    fn test_unresolved_jump_falls_through() {
        let cpu = run_program("jmp nowhere\nmov eax, 1");
        assert_eq!(reg(&cpu, Register::Eax), 1);
        assert_eq!(cpu.status(), RunStatus::Completed);
    }

    #[test]
    fn test_label_lookup_ignores_case() {
        let cpu = run_program("jmp Target\nmov eax, 1\ntarget:\nmov ebx, 1");
        assert_eq!(reg(&cpu, Register::Eax), 0);
    }

    #[test]
    fn test_conditional_jumps() {
        // (setup, mnemonic, taken)
        let cases = [
            ("mov eax, 1\ncmp eax, 1", "je", true),
            ("mov eax, 1\ncmp eax, 1", "jz", true),
            ("mov eax, 1\ncmp eax, 2", "jne", true),
            ("mov eax, 1\ncmp eax, 1", "jnz", false),
            ("mov eax, 2\ncmp eax, 1", "jg", true),
            ("mov eax, 1\ncmp eax, 1", "jnle", false),
            ("mov eax, 1\ncmp eax, 1", "jge", true),
            ("mov eax, 1\ncmp eax, 2", "jnl", false),
            ("mov eax, 1\ncmp eax, 2", "jl", true),
            ("mov eax, 2\ncmp eax, 1", "jnge", false),
            ("mov eax, 1\ncmp eax, 1", "jle", true),
            ("mov eax, 2\ncmp eax, 1", "jng", false),
            ("mov eax, 2\ncmp eax, 1", "ja", true),
            ("mov eax, 1\ncmp eax, 1", "jnbe", false),
            ("mov eax, 1\ncmp eax, 1", "jae", true),
            ("mov eax, 1\ncmp eax, 2", "jnb", false),
            ("mov eax, 1\ncmp eax, 2", "jb", true),
            ("mov eax, 2\ncmp eax, 1", "jnae", false),
            ("mov eax, 1\ncmp eax, 1", "jbe", true),
            ("mov eax, 2\ncmp eax, 1", "jna", false),
            ("mov eax, 1\ncmp eax, 2", "js", true),
            ("mov eax, 1\ncmp eax, 2", "jns", false),
        ];

        for (setup, mnemonic, taken) in cases {
            let cpu = run_program(&format!(
                "{setup}\n{mnemonic} target\nmov ecx, 1\ntarget:\nnop"
            ));
            assert_eq!(
                reg(&cpu, Register::Ecx) == 0,
                taken,
                "{mnemonic} after `{setup}`"
            );
        }
    }

    #[test]
    fn test_cmp_and_jump_reproduce_wrapping_add() {
        for (a, b) in [(1u32, 2u32), (0xFFFF_FFFF, 1), (0x8000_0000, 0x8000_0000)] {
            let expected = a.wrapping_add(b);
            let cpu = run_program(&format!(
                "mov eax, {a}\nadd eax, {b}\ncmp eax, {expected}\nje same\nprint 0\nhlt\nsame:\nprint 1"
            ));
            assert_eq!(cpu.output(), "1");
        }
    }

    #[test]
    fn test_budget_exceeded_on_exact_attempt() {
        let mut cpu = machine("loop:\njmp loop");
        assert_eq!(
            cpu.execute(),
            Err(ExecutionError::InstructionBudgetExceeded)
        );
        assert_eq!(cpu.instruction_count(), 100_001);
        assert_eq!(cpu.status(), RunStatus::Faulted);
    }

    #[test]
    fn test_budget_allows_exactly_the_limit() {
        let config = MachineConfig {
            instruction_budget: 3,
            ..Default::default()
        };
        let mut cpu = Cpu::new(Program::load("nop\nnop\nnop"), &config, NullHostIO);
        assert!(cpu.execute().is_ok());

        let mut cpu = Cpu::new(Program::load("nop\nnop\nnop\nnop"), &config, NullHostIO);
        assert_eq!(
            cpu.execute(),
            Err(ExecutionError::InstructionBudgetExceeded)
        );
        assert_eq!(cpu.pc(), 3);
    }

    #[test]
    fn test_unknown_instruction() {
        let mut cpu = machine("mov eax, 1\nfrobnicate eax");
        assert_eq!(
            cpu.execute(),
            Err(ExecutionError::UnknownInstruction("frobnicate".to_string()))
        );
        assert_eq!(reg(&cpu, Register::Eax), 1);
    }

    #[test]
    fn test_wrong_arity_is_unknown() {
        let mut cpu = machine("add eax");
        assert_eq!(
            cpu.execute(),
            Err(ExecutionError::UnknownInstruction("add".to_string()))
        );

        let mut cpu = machine("ret eax");
        assert!(cpu.execute().is_err());
    }

    #[test]
    fn test_execute_after_fault_is_a_no_op() {
        let mut cpu = machine("div 0");
        assert!(cpu.execute().is_err());
        let stats = cpu.execute().unwrap();
        assert_eq!(stats.instruction_count, 1);
    }

    #[test]
    fn test_sum_one_to_hundred() {
        let cpu = run_program(
            "; Sum numbers from 1 to 100
mov ecx, 100     ; Counter
mov eax, 0       ; Sum

sum_loop:
add eax, ecx
dec ecx
cmp ecx, 0
jg sum_loop

print eax        ; Print result (5050)
hlt",
        );
        assert_eq!(cpu.output(), "5050");
        assert_eq!(reg(&cpu, Register::Ecx), 0);
        assert_eq!(cpu.status(), RunStatus::Halted);
    }

    #[test]
    fn test_factorial() {
        let cpu = run_program(
            "; Calculate factorial of 6
mov eax, 6       ; Number to calculate
mov ebx, 1       ; Result

factorial_loop:
imul ebx, eax    ; result *= n
dec eax          ; n--
cmp eax, 1
jg factorial_loop

print ebx        ; Print result (720)
hlt",
        );
        assert_eq!(cpu.output(), "720");
    }

    #[test]
    fn test_fibonacci() {
        let cpu = run_program(
            "mov ecx, 10
mov eax, 0
mov ebx, 1

loop_start:
print eax
mov al, 10
printc al
mov edx, eax
add eax, ebx
mov ebx, edx
dec ecx
cmp ecx, 0
jg loop_start
hlt",
        );
        // `mov al, 10` clobbers the low byte of the running value
        assert_eq!(cpu.output().lines().count(), 10);
        assert!(cpu.output().starts_with("0\n"));
    }

    #[test]
    fn test_hello_world() {
        let source: String = "Hi!\n"
            .bytes()
            .map(|b| format!("mov al, {b}\nprintc al\n"))
            .collect();
        let cpu = run_program(&source);
        assert_eq!(cpu.output(), "Hi!\n");
    }

    #[test]
    fn test_call_ret() {
        let cpu = run_program(
            "mov eax, 5
call square
print eax
hlt

square:
imul eax, eax
ret",
        );
        assert_eq!(cpu.output(), "25");
        assert_eq!(reg(&cpu, Register::Esp), 0xFFFF);
        assert_eq!(cpu.status(), RunStatus::Halted);
    }

    #[test]
    fn test_call_pushes_next_index() {
        let mut cpu = machine("nop\ncall target\nhlt\ntarget:\nhlt");
        cpu.execute().unwrap();
        assert_eq!(reg(&cpu, Register::Esp), 0xFFFB);
        assert_eq!(cpu.memory().read_u32(0xFFFB), 2);
        assert_eq!(cpu.pc(), 3);
    }

    #[test]
    fn test_unresolved_call_still_pushes() {
        let cpu = run_program("call missing\nmov eax, 1");
        assert_eq!(reg(&cpu, Register::Eax), 1);
        assert_eq!(reg(&cpu, Register::Esp), 0xFFFB);
        assert_eq!(cpu.memory().read_u32(0xFFFB), 1);
    }

    #[test]
    fn test_ret_past_end_completes() {
        let cpu = run_program("push 99\nret\nmov eax, 1");
        assert_eq!(reg(&cpu, Register::Eax), 0);
        assert_eq!(cpu.status(), RunStatus::Completed);
        assert_eq!(cpu.pc(), 99);
    }

    #[test]
    fn test_printc_wraps_to_utf16() {
        let cpu = run_program("printc 0x10041\nprintc 0xD800");
        assert_eq!(cpu.output(), "A\u{FFFD}");
    }

    #[test]
    fn test_print_literal_keeps_sign() {
        let cpu = run_program("print -12\nmov eax, -12\nprint eax");
        assert_eq!(cpu.output(), "-124294967284");
    }

    #[derive(Debug, Default)]
    struct RecordingHost(Vec<String>);

    impl HostIO for RecordingHost {
        fn write_output(&mut self, text: &str) {
            self.0.push(text.to_string());
        }
    }

    #[test]
    fn test_host_receives_output() {
        let mut cpu = Cpu::new(
            Program::load("print 12\nprintc 33"),
            &MachineConfig::default(),
            RecordingHost::default(),
        );
        cpu.execute().unwrap();
        assert_eq!(cpu.host_io.0, vec!["12", "!"]);
        assert_eq!(cpu.output(), "12!");
    }
}
