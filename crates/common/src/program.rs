use std::path::Path;

use indexmap::IndexMap;
use serde::Serialize;

/// A loaded program: instruction lines with comments, blanks and label
/// declarations removed, plus the label table.
#[derive(Debug, Serialize, Default, Clone, PartialEq, Eq)]
pub struct Program {
    pub instructions: Vec<String>,
    /// Lowercase label name -> index of the instruction that follows it.
    pub labels: IndexMap<String, usize>,
}

impl Program {
    /// Splits source text into instructions and collects every label before
    /// anything runs, so forward references resolve. Instruction syntax is
    /// not checked here.
    pub fn load(source: &str) -> Self {
        let mut program = Program::default();

        for line in source.lines() {
            let line = strip_comment(line).trim();
            if line.is_empty() {
                continue;
            }

            if let Some(label) = line.strip_suffix(':') {
                // a later declaration replaces an earlier one
                program
                    .labels
                    .insert(label.trim().to_lowercase(), program.instructions.len());
            } else {
                program.instructions.push(line.to_string());
            }
        }

        program
    }

    pub fn load_file<P: AsRef<Path>>(p: P) -> std::io::Result<Self> {
        let source = std::fs::read_to_string(p.as_ref())?;
        Ok(Self::load(&source))
    }

    /// Case-insensitive label lookup.
    pub fn label(&self, name: &str) -> Option<usize> {
        self.labels.get(&name.trim().to_lowercase()).copied()
    }

    pub fn len(&self) -> usize {
        self.instructions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.instructions.is_empty()
    }
}

/// One tokenized instruction line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Statement {
    /// Lowercased opcode.
    pub mnemonic: String,
    /// Trimmed, non-empty operand tokens in source case.
    pub operands: Vec<String>,
}

impl Statement {
    /// Splits `opcode a, b` into its parts. Returns `None` for a line that
    /// holds nothing but whitespace or a comment.
    pub fn parse(line: &str) -> Option<Self> {
        let line = strip_comment(line).trim();
        let mut parts = line.split_whitespace();
        let mnemonic = parts.next()?.to_lowercase();

        let rest = parts.collect::<Vec<_>>().join(" ");
        let operands = rest
            .split(',')
            .map(str::trim)
            .filter(|operand| !operand.is_empty())
            .map(str::to_string)
            .collect();

        Some(Self { mnemonic, operands })
    }
}

fn strip_comment(line: &str) -> &str {
    match line.split_once(';') {
        Some((code, _)) => code,
        None => line,
    }
}
