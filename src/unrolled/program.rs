//! VmProgram - one neuron's bytecode chunk
//!
//! A chunk is a pair of streams: opcodes in `commands`, operands (register
//! indices) in `indices`. The emitter appends with the chainable `op`/`arg`
//! primitives; the VM walks both streams with a single cursor each.

use super::opcode::Opcode;
use crate::RegisterIndex;

/// An ordered (commands, indices) pair under construction
#[derive(Debug, Clone, Default)]
pub struct VmProgram {
    pub commands: Vec<u8>,
    pub indices: Vec<RegisterIndex>,
}

impl VmProgram {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append an opcode
    pub fn op(&mut self, opcode: Opcode) -> &mut Self {
        self.commands.push(opcode.as_u8());
        self
    }

    /// Append an operand for the most recent opcode
    pub fn arg(&mut self, index: RegisterIndex) -> &mut Self {
        self.indices.push(index);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.commands.is_empty() && self.indices.is_empty()
    }

    /// Append another chunk wholesale
    pub fn extend_from(&mut self, other: &VmProgram) {
        self.commands.extend_from_slice(&other.commands);
        self.indices.extend_from_slice(&other.indices);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fluent_append_order() {
        let mut program = VmProgram::new();
        program.op(Opcode::APS).arg(3).arg(1).arg(3).arg(0);
        program.op(Opcode::ZERO).arg(2);

        assert_eq!(program.commands, vec![Opcode::APS.as_u8(), Opcode::ZERO.as_u8()]);
        assert_eq!(program.indices, vec![3, 1, 3, 0, 2]);
    }

    #[test]
    fn test_arity_accounting() {
        let mut program = VmProgram::new();
        program.op(Opcode::AAPP).arg(0).arg(1).arg(2).arg(3);
        program.op(Opcode::A).arg(4).arg(5);

        let total: usize = program
            .commands
            .iter()
            .map(|&c| Opcode(c).arity())
            .sum();
        assert_eq!(total, program.indices.len());
    }
}
