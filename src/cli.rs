use clap::{Parser, Subcommand};
use clap_complete::Shell;

#[derive(Parser)]
#[command(name = "enginectl")]
#[command(version)]
#[command(about = "Manage build engines and emulators", long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Verbosity level
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Suppress non-essential output
    #[arg(short, long, global = true)]
    pub quiet: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// Manage the build engine
    #[command(subcommand)]
    Engine(EngineCommand),

    /// Manage emulators
    #[command(subcommand)]
    Emulator(EmulatorCommand),

    /// Manage SDK wide settings
    #[command(subcommand)]
    Config(ConfigCommand),

    /// Generate shell completions
    Completions {
        /// Shell to generate completions for
        #[arg(value_enum)]
        shell: Shell,
    },
}

// ============================================================================
// Engine Commands
// ============================================================================

#[derive(Subcommand)]
pub enum EngineCommand {
    /// Show the build engine properties
    Show {
        /// Build engine to use instead of the first one
        #[arg(long)]
        name: Option<String>,
    },

    /// Set build engine properties
    Set {
        #[arg(long)]
        name: Option<String>,

        /// Assignments of the form <name>=<value>
        #[arg(required = true, value_name = "NAME=VALUE")]
        assignments: Vec<String>,
    },

    /// Start the build engine
    Start {
        #[arg(long)]
        name: Option<String>,
    },

    /// Stop the build engine
    Stop {
        #[arg(long)]
        name: Option<String>,
    },

    /// Show whether the build engine is running
    Status {
        #[arg(long)]
        name: Option<String>,
    },

    /// Run a command inside the build engine
    Exec {
        #[arg(long)]
        name: Option<String>,

        /// Command and its arguments
        #[arg(required = true, trailing_var_arg = true, allow_hyphen_values = true)]
        command: Vec<String>,
    },

    /// List the build targets, or show one of them
    Targets {
        #[arg(long)]
        name: Option<String>,

        /// Target to show; an origin name selects its default snapshot
        target: Option<String>,
    },

    /// Re-read the build targets from the engine
    Refresh {
        #[arg(long)]
        name: Option<String>,
    },
}

// ============================================================================
// Emulator Commands
// ============================================================================

#[derive(Subcommand)]
pub enum EmulatorCommand {
    /// List the known emulators
    List,

    /// Show the emulator properties
    Show {
        /// Emulator to use instead of the first one
        name: Option<String>,
    },

    /// Set emulator properties
    Set {
        #[arg(long)]
        name: Option<String>,

        /// Assignments of the form <name>=<value>
        #[arg(required = true, value_name = "NAME=VALUE")]
        assignments: Vec<String>,
    },

    /// Start an emulator
    Start { name: Option<String> },

    /// Stop an emulator
    Stop { name: Option<String> },
}

// ============================================================================
// Config Commands
// ============================================================================

#[derive(Subcommand)]
pub enum ConfigCommand {
    /// Show the SDK wide properties
    Show,

    /// Set SDK wide properties
    Set {
        /// Assignments of the form <name>=<value>
        #[arg(required = true, value_name = "NAME=VALUE")]
        assignments: Vec<String>,
    },
}
