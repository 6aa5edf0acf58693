pub mod check;
pub mod queue;
pub mod run_result;

pub use check::*;
pub use queue::*;
pub use run_result::*;
