//! Token interpreter and mutation engine for the Protocell simulation.
//!
//! Tokens are small byte programs that live on cells. Once per step each
//! token runs under a fixed instruction budget, moves energy between itself,
//! its cell and bonded cells, and may request structural changes. After
//! executing, the mutation engine may alter its memory.
//!
//! # Modules
//!
//! - [`instruction`] -- Versioned opcode tables and a program assembler.
//! - [`interpreter`] -- Budgeted, energy-metered execution of one token.
//! - [`mutation`] -- Seeded memory and bond mutations.
//! - [`error`] -- Configuration errors.
//!
//! Parameters always arrive as an explicit `&SimulationParameters` argument;
//! tokens hold no reference back to any global context.

pub mod error;
pub mod instruction;
pub mod interpreter;
pub mod mutation;

pub use error::GenomeError;
pub use instruction::{
    INSTRUCTION_WIDTH, Instruction, InstructionSetV1, InstructionTable, PROGRAM_START, assemble,
    instruction_set,
};
pub use interpreter::{
    Execution, ExecutionContext, HaltReason, StructuralRequest, execute, selected_bond,
};
pub use mutation::{MutationEngine, MutationOutcome, mutate_memory, rewire_bond};
