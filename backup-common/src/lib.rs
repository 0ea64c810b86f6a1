pub mod backend;
pub mod naming;
pub mod retention;
