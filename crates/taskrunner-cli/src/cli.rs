use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(
    name = "taskrunner",
    version,
    about = "Schedule and run persisted tasks shared by many workers"
)]
pub struct Cli {
    /// Config file (default: $TASKRUNNER_CONFIG, then ~/.taskrunner/taskrunner.toml)
    #[arg(long, global = true)]
    pub config: Option<String>,

    /// Store URI, overriding the config file (sqlite://<path>, sqlite::memory:, memory://)
    #[arg(long, global = true)]
    pub store: Option<String>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Add a task and print the stored record
    Schedule {
        /// Task name; selects the handler
        name: String,

        /// JSON payload handed to the handler
        #[arg(long, default_value = "null")]
        data: String,

        #[arg(long)]
        task_id: Option<String>,

        /// Serialization group; at most one task per group runs at a time
        #[arg(long, conflicts_with = "repeat_every")]
        group: Option<String>,

        /// Re-run every N seconds after each success
        #[arg(long)]
        repeat_every: Option<u64>,

        /// Earliest start, RFC 3339 (e.g. 2026-01-01T09:00:00Z)
        #[arg(long)]
        start_at: Option<DateTime<Utc>>,
    },

    /// Print tasks as JSON lines, in claim order
    List {
        #[arg(long)]
        name: Option<String>,

        #[arg(long)]
        group: Option<String>,

        /// Only tasks that have not completed
        #[arg(long)]
        pending: bool,
    },

    /// Delete one task, or every completed one
    Remove {
        #[arg(required_unless_present = "processed", conflicts_with = "processed")]
        task_id: Option<String>,

        #[arg(long)]
        processed: bool,
    },

    /// Claim and run tasks with the built-in handlers until Ctrl-C
    Work {
        /// Number of poll loops (default from config)
        #[arg(long)]
        concurrency: Option<usize>,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn schedule_arguments_parse() {
        let cli = Cli::parse_from([
            "taskrunner",
            "schedule",
            "shell",
            "--data",
            r#"{"command":"true"}"#,
            "--repeat-every",
            "60",
            "--start-at",
            "2026-01-01T09:00:00Z",
        ]);
        let Commands::Schedule {
            name,
            repeat_every,
            start_at,
            group,
            ..
        } = cli.command
        else {
            panic!("expected schedule");
        };
        assert_eq!(name, "shell");
        assert_eq!(repeat_every, Some(60));
        assert!(group.is_none());
        assert_eq!(start_at.unwrap().to_rfc3339(), "2026-01-01T09:00:00+00:00");
    }

    #[test]
    fn group_conflicts_with_repeat() {
        let parsed = Cli::try_parse_from([
            "taskrunner",
            "schedule",
            "x",
            "--group",
            "g",
            "--repeat-every",
            "5",
        ]);
        assert!(parsed.is_err());
    }

    #[test]
    fn remove_needs_id_or_processed() {
        assert!(Cli::try_parse_from(["taskrunner", "remove"]).is_err());
        assert!(Cli::try_parse_from(["taskrunner", "remove", "--processed"]).is_ok());
        assert!(Cli::try_parse_from(["taskrunner", "remove", "abc"]).is_ok());
    }
}
