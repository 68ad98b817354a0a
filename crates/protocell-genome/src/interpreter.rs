//! Token interpreter: runs one token's program for one step.
//!
//! The interpreter reads instructions from token memory, starting at
//! [`PROGRAM_START`], until the program halts, runs off the end of memory,
//! exhausts the per-step instruction budget, or the token can no longer pay
//! for the next instruction.
//!
//! # Energy
//!
//! Every instruction costs `instruction_energy_cost`, which the token pays to
//! its owning cell. Energy moves only between the token, its cell and directly
//! bonded cells, so execution never creates or destroys energy.
//!
//! # Side effects
//!
//! Memory and energy changes apply immediately. Structural changes (bonds,
//! new cells, token copies) are returned as [`StructuralRequest`]s in
//! execution order and applied by the owning compartment at the end of its
//! local phase.

use serde::{Deserialize, Serialize};

use protocell_types::{Cell, EntityId, Particle, SimulationParameters, Token};

use crate::instruction::{INSTRUCTION_WIDTH, Instruction, InstructionTable, PROGRAM_START};

/// Why a token stopped executing for the current step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum HaltReason {
    /// The program executed `Halt`.
    Halted,
    /// The instruction pointer ran past the end of memory.
    EndOfProgram,
    /// The token could not pay for the next instruction.
    EnergyStarvation,
    /// The per-step instruction budget was used up.
    InstructionBudgetExceeded,
}

/// A structural change requested by a token, applied after all tokens of the
/// compartment have executed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum StructuralRequest {
    /// Bond `cell` to the nearest cell of its cluster that can accept a bond.
    CreateBond {
        /// Requesting cell.
        cell: EntityId,
    },
    /// Remove the bond between `cell` and `other`.
    RemoveBond {
        /// Requesting cell.
        cell: EntityId,
        /// Other endpoint.
        other: EntityId,
    },
    /// Place a copy of a token on `target`. `energy` has already been taken
    /// from the original and is refunded to `origin` if the copy cannot be
    /// placed.
    DuplicateToken {
        /// Cell that executed the duplication.
        origin: EntityId,
        /// Cell receiving the copy.
        target: EntityId,
        /// Memory of the copy.
        memory: Vec<u8>,
        /// Energy of the copy.
        energy: f64,
    },
    /// Construct a new cell bonded to `parent`. `energy` has already been
    /// taken from the parent and is refunded if construction fails.
    ConstructCell {
        /// Parent cell.
        parent: EntityId,
        /// Placement angle in radians, relative to the cluster frame.
        direction: f64,
        /// Energy of the new cell.
        energy: f64,
    },
}

/// Outcome of running one token for one step.
#[derive(Debug, Clone, PartialEq)]
pub struct Execution {
    /// Instructions executed.
    pub instructions: u32,
    /// Why execution stopped.
    pub halt: HaltReason,
    /// Structural changes in request order.
    pub requests: Vec<StructuralRequest>,
    /// Bonded cell the token's access number selects after execution.
    pub forward_to: Option<EntityId>,
}

/// Everything a token may read or touch while executing.
#[derive(Debug)]
pub struct ExecutionContext<'a> {
    /// Cells of the owning cluster.
    pub cells: &'a mut [Cell],
    /// Index of the owning cell in `cells`.
    pub cell_index: usize,
    /// Free particles near the owning cell. Read-only.
    pub particles: &'a [Particle],
    /// Parameters for the current step.
    pub params: &'a SimulationParameters,
    /// Opcode table.
    pub table: &'a dyn InstructionTable,
}

/// The bonded cell a token's access number selects on `cell`.
///
/// The access number is reduced modulo the configured branch count and then
/// modulo the number of bonds, so every selector byte resolves.
pub fn selected_bond(token: &Token, cell: &Cell, branch_count: u8) -> Option<EntityId> {
    let access = usize::from(token.access_number(branch_count));
    let index = access.checked_rem(cell.bonds.len())?;
    cell.bonds.get(index).copied()
}

/// Execute `token` (already detached from its cell) within `ctx`.
pub fn execute(token: &mut Token, ctx: &mut ExecutionContext<'_>) -> Execution {
    let mut execution = Execution {
        instructions: 0,
        halt: HaltReason::EndOfProgram,
        requests: Vec::new(),
        forward_to: None,
    };
    let cost = ctx.params.instruction_energy_cost;
    let mut ip = PROGRAM_START;

    loop {
        if execution.instructions >= ctx.params.instruction_budget {
            execution.halt = HaltReason::InstructionBudgetExceeded;
            break;
        }
        let Some(end) = ip.checked_add(INSTRUCTION_WIDTH) else {
            break;
        };
        let Some(&[opcode, a, b]) = token.memory.get(ip..end) else {
            break;
        };
        if token.energy < cost {
            execution.halt = HaltReason::EnergyStarvation;
            break;
        }
        let Some(cell) = ctx.cells.get_mut(ctx.cell_index) else {
            break;
        };
        token.energy -= cost;
        cell.energy += cost;
        execution.instructions = execution.instructions.saturating_add(1);
        ip = end;

        match ctx.table.decode(opcode, a, b) {
            Instruction::Halt => {
                execution.halt = HaltReason::Halted;
                break;
            }
            Instruction::JumpIfZero { cond, target } => {
                if read(token, cond) == 0 {
                    ip = slot_offset(target);
                }
            }
            instruction => apply(instruction, token, ctx, &mut execution.requests),
        }
    }

    execution.forward_to = ctx
        .cells
        .get(ctx.cell_index)
        .and_then(|cell| selected_bond(token, cell, ctx.params.cell_max_token_branch_number));
    execution
}

/// Apply a non-control-flow instruction.
fn apply(
    instruction: Instruction,
    token: &mut Token,
    ctx: &mut ExecutionContext<'_>,
    requests: &mut Vec<StructuralRequest>,
) {
    let params = ctx.params;
    let Some(cell) = ctx.cells.get(ctx.cell_index) else {
        return;
    };
    let cell_id = cell.id;
    let target = selected_bond(token, cell, params.cell_max_token_branch_number);

    match instruction {
        Instruction::Copy { dst, src } => write(token, dst, read(token, src)),
        Instruction::Add { dst, src } => {
            write(token, dst, read(token, dst).wrapping_add(read(token, src)));
        }
        Instruction::Sub { dst, src } => {
            write(token, dst, read(token, dst).wrapping_sub(read(token, src)));
        }
        Instruction::Xor { dst, src } => write(token, dst, read(token, dst) ^ read(token, src)),
        Instruction::Set { dst, value } => write(token, dst, value),
        Instruction::SenseParticles { dst } => {
            let count = u8::try_from(ctx.particles.len()).unwrap_or(u8::MAX);
            write(token, dst, count);
        }
        Instruction::ReadEnergy { dst } => {
            let clamped = token.energy.clamp(0.0, f64::from(u8::MAX));
            #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
            let byte = clamped as u8;
            write(token, dst, byte);
        }
        Instruction::GiveToCell { amount } => {
            let moved = transfer_amount(token, amount, params).min(token.energy);
            if let Some(cell) = ctx.cells.get_mut(ctx.cell_index) {
                token.energy -= moved;
                cell.energy += moved;
            }
        }
        Instruction::TakeFromCell { amount } => {
            let wanted = transfer_amount(token, amount, params);
            if let Some(cell) = ctx.cells.get_mut(ctx.cell_index) {
                let moved = wanted.min(spare_energy(cell, params));
                cell.energy -= moved;
                token.energy += moved;
            }
        }
        Instruction::ShareWithBond { amount } => {
            let wanted = transfer_amount(token, amount, params);
            let Some(target_index) = target.and_then(|id| ctx.cells.iter().position(|c| c.id == id))
            else {
                return;
            };
            let moved = ctx
                .cells
                .get(ctx.cell_index)
                .map_or(0.0, |cell| wanted.min(spare_energy(cell, params)));
            if let Some(cell) = ctx.cells.get_mut(ctx.cell_index) {
                cell.energy -= moved;
            }
            if let Some(other) = ctx.cells.get_mut(target_index) {
                other.energy += moved;
            }
        }
        Instruction::Bond => requests.push(StructuralRequest::CreateBond { cell: cell_id }),
        Instruction::Unbond => {
            if let Some(other) = target {
                requests.push(StructuralRequest::RemoveBond {
                    cell: cell_id,
                    other,
                });
            }
        }
        Instruction::DuplicateToken => {
            let energy = token.energy * params.token_duplication_energy_fraction;
            if energy > 0.0 {
                token.energy -= energy;
                requests.push(StructuralRequest::DuplicateToken {
                    origin: cell_id,
                    target: target.unwrap_or(cell_id),
                    memory: token.memory.clone(),
                    energy,
                });
            }
        }
        Instruction::ConstructCell { direction } => {
            let Some(cell) = ctx.cells.get_mut(ctx.cell_index) else {
                return;
            };
            let energy = params.cell_creation_energy;
            if cell.has_free_bond_slot()
                && energy > 0.0
                && cell.energy - energy > params.cell_min_energy
            {
                cell.energy -= energy;
                requests.push(StructuralRequest::ConstructCell {
                    parent: cell_id,
                    direction: f64::from(direction) / 256.0 * core::f64::consts::TAU,
                    energy,
                });
            }
        }
        Instruction::NoOp | Instruction::Halt | Instruction::JumpIfZero { .. } => {}
    }
}

/// Byte at a memory address reduced modulo the memory length.
fn read(token: &Token, address: u8) -> u8 {
    usize::from(address)
        .checked_rem(token.memory.len())
        .and_then(|i| token.memory.get(i))
        .copied()
        .unwrap_or(0)
}

fn write(token: &mut Token, address: u8, value: u8) {
    let len = token.memory.len();
    if let Some(byte) = usize::from(address)
        .checked_rem(len)
        .and_then(|i| token.memory.get_mut(i))
    {
        *byte = value;
    }
}

/// Energy named by the byte at `address`.
fn transfer_amount(token: &Token, address: u8, params: &SimulationParameters) -> f64 {
    f64::from(read(token, address)) * params.energy_transfer_unit
}

/// Energy a cell can give away without dropping to its minimum.
fn spare_energy(cell: &Cell, params: &SimulationParameters) -> f64 {
    (cell.energy - params.cell_min_energy).max(0.0)
}

/// Memory offset of instruction slot `slot`.
fn slot_offset(slot: u8) -> usize {
    usize::from(slot)
        .saturating_mul(INSTRUCTION_WIDTH)
        .saturating_add(PROGRAM_START)
}
