//! Versioned instruction tables.
//!
//! A token program is a sequence of 3-byte instructions `[opcode, a, b]`
//! stored after the access selector byte, so the first instruction starts at
//! offset [`PROGRAM_START`]. Operands that address memory are reduced modulo
//! the memory length, which makes every byte sequence a valid program.
//!
//! The opcode table is pluggable: the interpreter only depends on
//! [`InstructionTable`], and [`instruction_set`] resolves a configured
//! version to a table.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::GenomeError;

/// Offset of the first instruction (byte 0 is the access selector).
pub const PROGRAM_START: usize = 1;

/// Width of one encoded instruction in bytes.
pub const INSTRUCTION_WIDTH: usize = 3;

/// A decoded token instruction. Operands are raw bytes; the interpreter
/// resolves them against memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Instruction {
    /// Do nothing.
    NoOp,
    /// `mem[dst] = mem[src]`.
    Copy {
        /// Destination address.
        dst: u8,
        /// Source address.
        src: u8,
    },
    /// `mem[dst] = mem[dst] + mem[src]` (wrapping).
    Add {
        /// Destination address.
        dst: u8,
        /// Source address.
        src: u8,
    },
    /// `mem[dst] = mem[dst] - mem[src]` (wrapping).
    Sub {
        /// Destination address.
        dst: u8,
        /// Source address.
        src: u8,
    },
    /// `mem[dst] = mem[dst] ^ mem[src]`.
    Xor {
        /// Destination address.
        dst: u8,
        /// Source address.
        src: u8,
    },
    /// `mem[dst] = value`.
    Set {
        /// Destination address.
        dst: u8,
        /// Literal value.
        value: u8,
    },
    /// Jump to instruction slot `target` when `mem[cond] == 0`.
    JumpIfZero {
        /// Address of the tested byte.
        cond: u8,
        /// Instruction slot to continue at.
        target: u8,
    },
    /// Move `mem[amount] * unit` energy from the token to its cell.
    GiveToCell {
        /// Address of the amount byte.
        amount: u8,
    },
    /// Move `mem[amount] * unit` energy from the cell to the token.
    TakeFromCell {
        /// Address of the amount byte.
        amount: u8,
    },
    /// Move `mem[amount] * unit` energy from the cell to the selected bonded cell.
    ShareWithBond {
        /// Address of the amount byte.
        amount: u8,
    },
    /// Request a new bond from the cell to its nearest bondable neighbour.
    Bond,
    /// Request removal of the bond to the selected cell.
    Unbond,
    /// Request a copy of this token on the selected cell.
    DuplicateToken,
    /// Request a new cell bonded to this one, placed in direction
    /// `direction / 256` of a full turn.
    ConstructCell {
        /// Encoded placement angle.
        direction: u8,
    },
    /// `mem[dst] = min(token energy, 255)`.
    ReadEnergy {
        /// Destination address.
        dst: u8,
    },
    /// Stop executing for this step.
    Halt,
    /// `mem[dst] = min(number of free particles near the cell, 255)`.
    SenseParticles {
        /// Destination address.
        dst: u8,
    },
}

/// A versioned mapping between opcode bytes and instructions.
pub trait InstructionTable: Send + Sync + core::fmt::Debug {
    /// Version number of this table.
    fn version(&self) -> u32;

    /// Decode one instruction. Every opcode byte must decode to something.
    fn decode(&self, opcode: u8, a: u8, b: u8) -> Instruction;

    /// Encode an instruction into its 3-byte form.
    fn encode(&self, instruction: Instruction) -> [u8; INSTRUCTION_WIDTH];
}

/// The first instruction table: 17 opcodes, opcode byte taken modulo 17.
#[derive(Debug, Clone, Copy, Default)]
pub struct InstructionSetV1;

impl InstructionSetV1 {
    /// Number of distinct opcodes.
    pub const OPCODE_COUNT: u8 = 17;
}

impl InstructionTable for InstructionSetV1 {
    fn version(&self) -> u32 {
        1
    }

    fn decode(&self, opcode: u8, a: u8, b: u8) -> Instruction {
        match opcode % Self::OPCODE_COUNT {
            1 => Instruction::Copy { dst: a, src: b },
            2 => Instruction::Add { dst: a, src: b },
            3 => Instruction::Sub { dst: a, src: b },
            4 => Instruction::Xor { dst: a, src: b },
            5 => Instruction::Set { dst: a, value: b },
            6 => Instruction::JumpIfZero { cond: a, target: b },
            7 => Instruction::GiveToCell { amount: a },
            8 => Instruction::TakeFromCell { amount: a },
            9 => Instruction::ShareWithBond { amount: a },
            10 => Instruction::Bond,
            11 => Instruction::Unbond,
            12 => Instruction::DuplicateToken,
            13 => Instruction::ConstructCell { direction: a },
            14 => Instruction::ReadEnergy { dst: a },
            15 => Instruction::Halt,
            16 => Instruction::SenseParticles { dst: a },
            _ => Instruction::NoOp,
        }
    }

    fn encode(&self, instruction: Instruction) -> [u8; INSTRUCTION_WIDTH] {
        match instruction {
            Instruction::NoOp => [0, 0, 0],
            Instruction::Copy { dst, src } => [1, dst, src],
            Instruction::Add { dst, src } => [2, dst, src],
            Instruction::Sub { dst, src } => [3, dst, src],
            Instruction::Xor { dst, src } => [4, dst, src],
            Instruction::Set { dst, value } => [5, dst, value],
            Instruction::JumpIfZero { cond, target } => [6, cond, target],
            Instruction::GiveToCell { amount } => [7, amount, 0],
            Instruction::TakeFromCell { amount } => [8, amount, 0],
            Instruction::ShareWithBond { amount } => [9, amount, 0],
            Instruction::Bond => [10, 0, 0],
            Instruction::Unbond => [11, 0, 0],
            Instruction::DuplicateToken => [12, 0, 0],
            Instruction::ConstructCell { direction } => [13, direction, 0],
            Instruction::ReadEnergy { dst } => [14, dst, 0],
            Instruction::Halt => [15, 0, 0],
            Instruction::SenseParticles { dst } => [16, dst, 0],
        }
    }
}

/// Resolve a configured instruction-set version.
pub fn instruction_set(version: u32) -> Result<Arc<dyn InstructionTable>, GenomeError> {
    match version {
        1 => Ok(Arc::new(InstructionSetV1)),
        other => Err(GenomeError::UnknownInstructionSet { version: other }),
    }
}

/// Assemble a program into token memory of `memory_size` bytes.
///
/// Byte 0 is set to `selector`; instructions that do not fit are dropped and
/// the remainder is zero (`NoOp`).
pub fn assemble(
    table: &dyn InstructionTable,
    selector: u8,
    program: &[Instruction],
    memory_size: usize,
) -> Vec<u8> {
    let mut memory = vec![0; memory_size];
    if let Some(first) = memory.first_mut() {
        *first = selector;
    }
    let mut offset = PROGRAM_START;
    for instruction in program {
        let Some(end) = offset.checked_add(INSTRUCTION_WIDTH) else {
            break;
        };
        let Some(slot) = memory.get_mut(offset..end) else {
            break;
        };
        slot.copy_from_slice(&table.encode(*instruction));
        offset = end;
    }
    memory
}
