pub mod blocks;
pub mod codegen;
pub mod layout;
pub mod mode;
pub mod node;
pub mod ops;
