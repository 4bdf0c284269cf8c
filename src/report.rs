use std::{fmt, ops::Range};

use serde::Serialize;
use x86sim_common::{
    Cpu, ExecutionError, Flags, HostIO, RegisterRef, RegisterSnapshot, RunStats, RunStatus,
};

/// Bytes shown in the stack dump: the top of the default stack.
pub const STACK_WINDOW: Range<usize> = 0xFFE0..0x10000;

const WORD_ALIASES: [&str; 8] = ["ax", "bx", "cx", "dx", "si", "di", "sp", "bp"];
const BYTE_ALIASES: [&str; 8] = ["al", "ah", "bl", "bh", "cl", "ch", "dl", "dh"];

/// Everything `--json` prints about a finished run.
#[derive(Debug, Serialize)]
pub struct MachineSnapshot<'a> {
    pub status: RunStatus,
    pub error: Option<String>,
    pub output: &'a str,
    pub registers: RegisterSnapshot,
    pub flags: Flags,
    pub instruction_count: usize,
    pub elapsed_ms: f64,
    pub stack: &'a [u8],
}

impl<'a> MachineSnapshot<'a> {
    pub fn capture<IO: HostIO>(cpu: &'a Cpu<IO>, error: Option<&ExecutionError>) -> Self {
        let stats = cpu.stats();
        Self {
            status: cpu.status(),
            error: error.map(ToString::to_string),
            output: cpu.output(),
            registers: cpu.registers().snapshot(),
            flags: *cpu.flags(),
            instruction_count: stats.instruction_count,
            elapsed_ms: stats.elapsed.as_secs_f64() * 1000.0,
            stack: cpu.memory().window(STACK_WINDOW),
        }
    }
}

pub fn render_stats(status: RunStatus, stats: &RunStats) -> String {
    format!(
        "Status: {status:?}\nInstructions executed: {}\nElapsed: {:.3}ms",
        stats.instruction_count,
        stats.elapsed.as_secs_f64() * 1000.0
    )
}

/// Register, alias, flag and stack dump.
pub fn render_state<IO: HostIO>(cpu: &Cpu<IO>) -> String {
    StateDump(cpu).to_string()
}

struct StateDump<'a, IO: HostIO>(&'a Cpu<IO>);

impl<IO: HostIO> fmt::Display for StateDump<'_, IO> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let cpu = self.0;
        let registers = cpu.registers();

        writeln!(f)?;
        writeln!(f, "========== CPU STATE ===========")?;
        writeln!(f)?;

        for (register, value) in registers.iter() {
            writeln!(f, "{register}: 0x{value:08x} ({})", value as i32)?;
        }
        writeln!(f)?;

        let aliases = |names: &[&str], width: usize| {
            names
                .iter()
                .filter_map(|name| RegisterRef::parse(name).map(|reg| (name, registers.read(reg))))
                .map(|(name, value)| format!("{name}: 0x{value:0width$x}"))
                .collect::<Vec<_>>()
                .join("  ")
        };
        writeln!(f, "{}", aliases(&WORD_ALIASES, 4))?;
        writeln!(f, "{}", aliases(&BYTE_ALIASES, 2))?;
        writeln!(f)?;

        writeln!(f, "{}", cpu.flags())?;
        writeln!(f)?;

        writeln!(
            f,
            "Stack (0x{:x}..0x{:x}):",
            STACK_WINDOW.start, STACK_WINDOW.end
        )?;
        let stack = cpu.memory().window(STACK_WINDOW);
        for (row, bytes) in stack.chunks(16).enumerate() {
            let hex = bytes
                .iter()
                .map(|b| format!("{b:02x}"))
                .collect::<Vec<_>>()
                .join(" ");
            writeln!(f, "{:08x}  {hex}", STACK_WINDOW.start + row * 16)?;
        }

        Ok(())
    }
}
