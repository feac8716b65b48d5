pub mod config;
pub mod errors;
pub mod generation;
pub mod logging;
pub mod util;
