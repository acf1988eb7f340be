//! vm_process - the stack-free bytecode interpreter
//!
//! One pass over a (commands, indices) pair against the flat register file.
//! This is the hot path of every inference and training step: a dense match
//! on the opcode byte, two cursors, no allocation, no locks. The VM trusts
//! its bytecode — operand validation happened when the chunk was emitted or
//! deserialized, never here.

use super::opcode::Opcode;
use crate::{RegisterIndex, Value};

/// Gradient magnitude bound enforced by the `CLIP` opcode
const CLIP_THRESHOLD: Value = 1.0;

/// Execute one kernel until its `END` opcode.
pub fn vm_process(commands: &[u8], indices: &[RegisterIndex], registers: &mut [Value]) {
    let mut c = 0usize;
    let mut i = 0usize;

    macro_rules! x {
        ($offset:expr) => {
            registers[indices[i + $offset] as usize]
        };
    }

    loop {
        let command = Opcode(commands[c]);
        c += 1;

        match command {
            Opcode::ZERO => x!(0) = 0.0,
            Opcode::CLIP => x!(0) = x!(0).clamp(-CLIP_THRESHOLD, CLIP_THRESHOLD),
            Opcode::ACTIVATION => x!(0) = crate::activation(x!(1)),
            Opcode::DERIVATIVE => x!(0) = crate::derivative(x!(1)),
            Opcode::AAP => x!(0) += x!(1) * x!(2),
            Opcode::AAPP => x!(0) += x!(1) * x!(2) * x!(3),
            Opcode::A => x!(0) = x!(1),
            Opcode::AS => x!(0) = x!(1) + x!(2),
            Opcode::AD => x!(0) = x!(1) - x!(2),
            Opcode::AP => x!(0) = x!(1) * x!(2),
            Opcode::APP => x!(0) = x!(1) * x!(2) * x!(3),
            Opcode::APS => x!(0) = x!(1) * x!(2) + x!(3),
            Opcode::APSP => x!(0) = x!(1) * x!(2) + x!(3) * x!(4),
            Opcode::APPS => x!(0) = x!(1) * x!(2) * x!(3) + x!(4),
            Opcode::APPSP => x!(0) = x!(1) * x!(2) * x!(3) + x!(4) * x!(5),
            Opcode::APPSPP => x!(0) = x!(1) * x!(2) * x!(3) + x!(4) * x!(5) * x!(6),
            Opcode::END => break,
            _ => break,
        }

        i += command.arity();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::unrolled::VmProgram;

    fn run(program: &VmProgram, registers: &mut [Value]) {
        let mut commands = program.commands.clone();
        commands.push(Opcode::END.as_u8());
        vm_process(&commands, &program.indices, registers);
    }

    #[test]
    fn test_assignment_family() {
        let mut registers = [0.0, 2.0, 3.0, 5.0];
        let mut program = VmProgram::new();
        program.op(Opcode::A).arg(0).arg(1); // x0 = 2
        program.op(Opcode::AS).arg(3).arg(1).arg(2); // x3 = 5
        program.op(Opcode::AD).arg(2).arg(3).arg(1); // x2 = 3
        run(&program, &mut registers);
        assert_eq!(registers, [2.0, 2.0, 3.0, 5.0]);
    }

    #[test]
    fn test_fused_products() {
        let mut registers = [0.0, 2.0, 3.0, 4.0, 5.0, 6.0, 7.0];
        let mut program = VmProgram::new();
        program
            .op(Opcode::APPSPP)
            .arg(0)
            .arg(1)
            .arg(2)
            .arg(3)
            .arg(4)
            .arg(5)
            .arg(6);
        run(&program, &mut registers);
        // 2*3*4 + 5*6*7
        assert_eq!(registers[0], 234.0);
    }

    #[test]
    fn test_in_place_read_then_write() {
        // APS with the destination also on the right must read the old value
        let mut registers = [2.0, 3.0, 10.0];
        let mut program = VmProgram::new();
        program.op(Opcode::APS).arg(0).arg(1).arg(0).arg(2); // x0 = 3*2 + 10
        run(&program, &mut registers);
        assert_eq!(registers[0], 16.0);
    }

    #[test]
    fn test_clip_bounds() {
        let mut registers = [7.5, -3.25, 0.5];
        let mut program = VmProgram::new();
        program.op(Opcode::CLIP).arg(0);
        program.op(Opcode::CLIP).arg(1);
        program.op(Opcode::CLIP).arg(2);
        run(&program, &mut registers);
        assert_eq!(registers, [1.0, -1.0, 0.5]);
    }

    #[test]
    fn test_activation_and_derivative() {
        let mut registers = [0.0, 0.0, 0.0];
        let mut program = VmProgram::new();
        program.op(Opcode::ACTIVATION).arg(1).arg(0); // sigmoid(0) = 0.5
        program.op(Opcode::DERIVATIVE).arg(2).arg(1); // 0.5 * 0.5 = 0.25
        run(&program, &mut registers);
        assert_eq!(registers[1], 0.5);
        assert_eq!(registers[2], 0.25);
    }

    #[test]
    fn test_accumulators() {
        let mut registers = [1.0, 2.0, 3.0, 4.0];
        let mut program = VmProgram::new();
        program.op(Opcode::AAP).arg(0).arg(1).arg(2); // 1 + 6 = 7
        program.op(Opcode::AAPP).arg(0).arg(1).arg(2).arg(3); // 7 + 24 = 31
        program.op(Opcode::ZERO).arg(1);
        run(&program, &mut registers);
        assert_eq!(registers[0], 31.0);
        assert_eq!(registers[1], 0.0);
    }

    #[test]
    fn test_empty_kernel_stops_at_end() {
        let mut registers = [1.0];
        vm_process(&[Opcode::END.as_u8()], &[], &mut registers);
        assert_eq!(registers[0], 1.0);
    }
}
