//! An assembler and linker for a 36-bit one's-complement machine.
//!
//! `assembler` turns source lines into a `RelocatableModule`; `linker`
//! places the pools of one or more such modules into banks and produces an
//! `AbsoluteModule`.
#[macro_use] extern crate log;
extern crate regex;
extern crate serde;
extern crate term_grid;

pub mod word36;
pub mod assembler;
pub mod linker;
