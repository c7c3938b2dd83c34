//! Derived valuables.
//!
//! None of these have a unit of work of their own. They register callbacks on their upstream(s)
//! and push whatever those deliver into their own cell.

mod combine;
mod flat_map;
mod forever;
mod map;
mod on_error;

pub(crate) use combine::{combine, combine_with, Arm};
pub(crate) use flat_map::flat_map;
pub(crate) use forever::forever;
pub(crate) use map::map;
pub(crate) use on_error::on_error_resume;
