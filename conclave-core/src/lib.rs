mod bus;
mod config;
mod coordination;
mod presence;
mod util;

pub use bus::*;
pub use config::*;
pub use coordination::*;
pub use presence::*;
pub use util::*;
