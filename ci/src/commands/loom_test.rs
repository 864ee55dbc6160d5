use argh::FromArgs;
use xshell::cmd;

use crate::{Flag, Prepare, PreparedCommand};

/// Runs the loom model-checking suite under the `loom` profile.
#[derive(FromArgs, Default)]
#[argh(subcommand, name = "loom-test")]
pub struct LoomTestCommand {}

impl Prepare for LoomTestCommand {
    fn prepare<'a>(&self, sh: &'a xshell::Shell, _flags: Flag) -> Vec<PreparedCommand<'a>> {
        let command = PreparedCommand::new::<Self>(
            cmd!(sh, "cargo test --test loom --profile loom"),
            "Please fix failing loom models in output above.",
        )
        .with_env_var("RUSTFLAGS", "--cfg loom")
        .with_env_var("LOOM_MAX_PREEMPTIONS", "3");
        vec![command]
    }
}
