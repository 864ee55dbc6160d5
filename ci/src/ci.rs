use argh::FromArgs;

use crate::{
    commands,
    prepare::{Flag, Prepare, PreparedCommand},
};

/// The CI command line tool for stagehand.
#[derive(FromArgs)]
pub struct CI {
    #[argh(subcommand)]
    command: Option<Commands>,

    /// continue running commands even if one fails.
    #[argh(switch)]
    keep_going: bool,
}

impl CI {
    /// Runs the given subcommand, or every check except the loom suite if
    /// none is given.
    pub fn run(self) {
        let sh = xshell::Shell::new().unwrap();

        let prepared_commands = self.prepare(&sh);

        let mut failures = vec![];

        for command in prepared_commands {
            if command.command.envs(command.env_vars).run().is_err() {
                let name = command.name;
                let message = command.failure_message;

                if self.keep_going {
                    failures.push(format!("- {name}: {message}"));
                } else {
                    failures.push(format!("{name}: {message}"));
                    break;
                }
            }
        }

        if !failures.is_empty() {
            let failures = failures.join("\n");

            panic!(
                "One or more CI commands failed:\n\
                {failures}"
            );
        }
    }

    fn prepare<'a>(&self, sh: &'a xshell::Shell) -> Vec<PreparedCommand<'a>> {
        let mut flags = Flag::empty();

        if self.keep_going {
            flags |= Flag::KEEP_GOING;
        }

        match &self.command {
            Some(command) => command.prepare(sh, flags),
            None => {
                let mut cmds = vec![];
                cmds.append(&mut commands::FormatCommand::default().prepare(sh, flags));
                cmds.append(&mut commands::ClippyCommand::default().prepare(sh, flags));
                cmds.append(&mut commands::TestCommand::default().prepare(sh, flags));
                cmds.append(&mut commands::DocCheckCommand::default().prepare(sh, flags));
                cmds
            }
        }
    }
}

/// The subcommands that can be run by the CI script.
#[derive(FromArgs)]
#[argh(subcommand)]
enum Commands {
    Format(commands::FormatCommand),
    Clippy(commands::ClippyCommand),
    Test(commands::TestCommand),
    DocCheck(commands::DocCheckCommand),
    LoomTest(commands::LoomTestCommand),
}

impl Prepare for Commands {
    fn prepare<'a>(&self, sh: &'a xshell::Shell, flags: Flag) -> Vec<PreparedCommand<'a>> {
        match self {
            Commands::Format(subcommand) => subcommand.prepare(sh, flags),
            Commands::Clippy(subcommand) => subcommand.prepare(sh, flags),
            Commands::Test(subcommand) => subcommand.prepare(sh, flags),
            Commands::DocCheck(subcommand) => subcommand.prepare(sh, flags),
            Commands::LoomTest(subcommand) => subcommand.prepare(sh, flags),
        }
    }
}
