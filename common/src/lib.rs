#[cfg(feature = "cli")]
mod cli;

#[cfg(feature = "elapsed")]
pub mod elapsed;

pub mod logging;

#[cfg(feature = "cli")]
pub use cli::McplHomeArg;
