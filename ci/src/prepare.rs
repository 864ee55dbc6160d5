use bitflags::bitflags;

/// Turns a subcommand into the shell commands it runs.
pub trait Prepare {
    /// Builds the commands, in the order they should run.
    fn prepare<'a>(&self, sh: &'a xshell::Shell, flags: Flag) -> Vec<PreparedCommand<'a>>;
}

bitflags! {
    /// Options shared by every subcommand.
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct Flag: u32 {
        /// Keep running after a failed command.
        const KEEP_GOING = 1 << 0;
    }
}

/// A shell command ready to run, with what to report if it fails.
pub struct PreparedCommand<'a> {
    /// The subcommand this was prepared by, as typed on the command line.
    pub name: &'static str,
    /// The command itself.
    pub command: xshell::Cmd<'a>,
    /// Printed when the command exits unsuccessfully.
    pub failure_message: &'static str,
    /// Extra environment for the command.
    pub env_vars: Vec<(&'static str, &'static str)>,
}

impl<'a> PreparedCommand<'a> {
    /// Prepares `command`, named after the subcommand `T`.
    pub fn new<T: argh::SubCommand>(
        command: xshell::Cmd<'a>,
        failure_message: &'static str,
    ) -> Self {
        PreparedCommand {
            name: T::COMMAND.name,
            command,
            failure_message,
            env_vars: vec![],
        }
    }

    /// Sets an environment variable for the command.
    pub fn with_env_var(mut self, key: &'static str, value: &'static str) -> Self {
        self.env_vars.push((key, value));
        self
    }
}
