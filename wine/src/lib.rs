mod command;
mod error;
mod prefix;

pub use command::{PRESERVED_ENV, filtered_env, wine_command};
pub use error::WineError;
pub use prefix::{init_prefix, kill_all, wait_for_exit};
