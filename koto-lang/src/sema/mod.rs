pub mod conv;
pub mod elab;
pub mod eval;
pub mod meta;
pub mod term;
pub mod value;
