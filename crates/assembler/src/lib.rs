use thiserror::Error;
use x86sim_common::{
    get_pattern_by_mnemonic, patterns_for_mnemonic, OperandKind, Program, Statement,
};

mod listing;

pub use listing::render_listing;

/// A problem found by [`check`]. None of these stop a program from running:
/// the engine faults on the first two only when it reaches them, and falls
/// through unresolved labels.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Diagnostic {
    #[error("Unknown instruction: {0}")]
    UnknownInstruction(String),
    #[error("Wrong number of operands for {mnemonic}: expected {expected}, got {got}")]
    WrongOperandCount {
        mnemonic: String,
        expected: usize,
        got: usize,
    },
    #[error("Undefined label: {0}")]
    UndefinedLabel(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Finding {
    /// Index of the offending instruction.
    pub index: usize,
    pub line: String,
    pub diagnostic: Diagnostic,
}

/// Validates every instruction of a loaded program against the pattern table
/// and the label map.
pub fn check(program: &Program) -> Vec<Finding> {
    let mut findings = Vec::new();

    for (index, line) in program.instructions.iter().enumerate() {
        let Some(statement) = Statement::parse(line) else {
            continue;
        };

        let mut report = |diagnostic| {
            findings.push(Finding {
                index,
                line: line.clone(),
                diagnostic,
            })
        };

        match check_statement(program, &statement) {
            Ok(undefined) => undefined
                .into_iter()
                .for_each(|label| report(Diagnostic::UndefinedLabel(label))),
            Err(diagnostic) => report(diagnostic),
        }
    }

    findings
}

/// Returns the label operands that do not resolve, or the reason the
/// statement matches no pattern.
fn check_statement(program: &Program, statement: &Statement) -> Result<Vec<String>, Diagnostic> {
    let Statement { mnemonic, operands } = statement;

    let candidates = patterns_for_mnemonic(mnemonic);
    let Some(first) = candidates.first() else {
        return Err(Diagnostic::UnknownInstruction(mnemonic.clone()));
    };

    let pattern = get_pattern_by_mnemonic(mnemonic, operands.len()).ok_or_else(|| {
        Diagnostic::WrongOperandCount {
            mnemonic: mnemonic.clone(),
            expected: first.arity(),
            got: operands.len(),
        }
    })?;

    Ok(operands
        .iter()
        .zip(pattern.operands)
        .filter(|(_, kind)| **kind == OperandKind::Label)
        .filter(|(operand, _)| program.label(operand).is_none())
        .map(|(operand, _)| operand.clone())
        .collect())
}
