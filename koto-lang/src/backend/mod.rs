pub mod anf;
pub mod generate;

pub use anf::{AnfAtom, AnfTerm, anf};
pub use generate::{GenerateResult, generate};
