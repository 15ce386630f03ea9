mod command;

pub use command::{CommandRunner, ProcessRunner};
