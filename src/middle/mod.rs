pub mod cfg;
pub mod consteval;
pub mod defassign;
pub mod hir;
pub mod program;
pub mod specialize;
pub mod ty;
