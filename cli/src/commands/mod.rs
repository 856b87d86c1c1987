mod init;
mod run;

pub use init::init;
pub use run::{RunArgs, run};
