use clap::{Args as ClapArgs, Parser, Subcommand};

#[derive(clap::ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputFormat {
    Text,
    Json,
}

#[derive(Parser, Debug)]
#[command(name = "autopilot", version, about = "Autonomous multi-step task execution engine")]
pub struct Args {
    #[command(subcommand)]
    pub command: Commands,

    /// Config file to use instead of ~/.autopilot/config.toml / ./config.toml.
    #[arg(long, global = true, env = "AUTOPILOT_CONFIG")]
    pub config: Option<String>,

    #[arg(long, value_enum, default_value_t = OutputFormat::Text, global = true)]
    pub format: OutputFormat,
}

#[derive(ClapArgs, Debug, Clone)]
pub struct RunArgs {
    /// Natural-language description of the task.
    #[arg(group = "input")]
    pub description: Option<String>,

    #[arg(long, group = "input")]
    pub prompt_file: Option<String>,

    #[arg(long, group = "input")]
    pub stdin: bool,

    /// JSON plan (`{"steps": [...]}`) to run instead of asking the planner.
    #[arg(long)]
    pub plan_file: Option<String>,

    /// Print progress events to stderr while the task runs.
    #[arg(long)]
    pub follow: bool,

    #[arg(long)]
    pub timeout_secs: Option<u64>,

    #[arg(long)]
    pub max_retries: Option<u32>,
}

#[derive(ClapArgs, Debug, Clone)]
pub struct ResumeArgs {
    pub task_id: String,

    #[arg(long)]
    pub follow: bool,
}

#[derive(ClapArgs, Debug, Clone)]
pub struct ExecArgs {
    #[arg(long, short = 'l', default_value = "python")]
    pub language: String,

    #[arg(long, group = "source")]
    pub code: Option<String>,

    #[arg(long, group = "source")]
    pub file: Option<String>,

    /// What the code should achieve; used when repairing it.
    #[arg(long)]
    pub goal: Option<String>,

    /// Run once without self-healing.
    #[arg(long)]
    pub no_heal: bool,

    #[arg(long)]
    pub timeout_secs: Option<u64>,
}

#[derive(ClapArgs, Debug, Clone)]
pub struct HistoryArgs {
    /// Show the records of one task; ad-hoc executions otherwise.
    #[arg(long)]
    pub task: Option<String>,

    #[arg(long, default_value_t = 20)]
    pub limit: usize,
}

#[derive(Subcommand, Debug, Clone)]
pub enum CheckpointCommand {
    /// List checkpoints of a task, or of every task.
    List {
        #[arg(long)]
        task: Option<String>,
    },
    /// Apply the retention policy and delete expired checkpoints.
    Gc,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Plan and run a task.
    Run(RunArgs),
    /// Continue an interrupted task from its persisted state.
    Resume(ResumeArgs),
    /// Run one snippet in the sandbox.
    Exec(ExecArgs),
    /// Show recorded execution attempts.
    History(HistoryArgs),
    /// Inspect or collect continuation checkpoints.
    Checkpoints {
        #[command(subcommand)]
        action: CheckpointCommand,
    },
    /// List known tasks.
    Tasks,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_run_with_follow() {
        let args = Args::try_parse_from(["autopilot", "run", "sum the csv", "--follow"]).unwrap();
        let Commands::Run(run) = args.command else {
            panic!("expected run");
        };
        assert_eq!(run.description.as_deref(), Some("sum the csv"));
        assert!(run.follow);
        assert_eq!(args.format, OutputFormat::Text);
    }

    #[test]
    fn description_and_stdin_conflict() {
        assert!(Args::try_parse_from(["autopilot", "run", "x", "--stdin"]).is_err());
    }

    #[test]
    fn parses_checkpoint_gc_and_global_format() {
        let args = Args::try_parse_from(["autopilot", "checkpoints", "gc", "--format", "json"]).unwrap();
        assert!(matches!(
            args.command,
            Commands::Checkpoints {
                action: CheckpointCommand::Gc
            }
        ));
        assert_eq!(args.format, OutputFormat::Json);
    }

    #[test]
    fn exec_defaults_to_python() {
        let args = Args::try_parse_from(["autopilot", "exec", "--code", "print(1)"]).unwrap();
        let Commands::Exec(exec) = args.command else {
            panic!("expected exec");
        };
        assert_eq!(exec.language, "python");
        assert!(!exec.no_heal);
    }
}
