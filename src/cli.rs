//! CLI argument parsing using clap v4
//!
//! Defines the command-line interface for the RealityHub bridge.

use clap::{Parser, Subcommand};

use crate::actions::MixerChannel;
use crate::executor::Priority;
use crate::transport::Method;

/// Mixer node targeted when `--node` is not given
pub const DEFAULT_MIXER_NODE: &str = "Mixer_0";
/// Media input node targeted when `--node` is not given
pub const DEFAULT_MEDIA_NODE: &str = "MediaInput_0";

/// RealityHub Bridge - remote control for a RealityHub server
///
/// Connects to the RealityHub REST API, keeps engines, nodes, rundowns and
/// templates in sync, and serializes every request through one priority queue.
#[derive(Parser, Debug)]
#[command(name = "realityhub-bridge")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Increase logging verbosity (-v for debug, -vv for trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Suppress all output except errors
    #[arg(short, long, global = true)]
    pub quiet: bool,

    #[command(subcommand)]
    pub command: Commands,
}

/// Available commands for the bridge
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Connect to the server and keep its data in sync until Ctrl+C
    Run {
        /// Path to configuration file
        #[arg(short, long, env = "REALITYHUB_CONFIG")]
        config: Option<String>,
    },

    /// Check once that the server answers
    Probe {
        /// Path to configuration file
        #[arg(short, long, env = "REALITYHUB_CONFIG")]
        config: Option<String>,

        /// Server address, overrides the configuration
        #[arg(long)]
        host: Option<String>,
    },

    /// Send one request through the priority queue and print the response
    Request {
        /// HTTP method: GET, POST, PATCH, PUT or DELETE
        method: Method,

        /// Endpoint below /api/rest/v1/ (e.g. "engines")
        endpoint: String,

        /// JSON request body
        #[arg(short, long)]
        body: Option<String>,

        /// Queue priority: high, medium or low
        #[arg(short, long, default_value = "high")]
        priority: Priority,

        /// Path to configuration file
        #[arg(short, long, env = "REALITYHUB_CONFIG")]
        config: Option<String>,

        /// Server address, overrides the configuration
        #[arg(long)]
        host: Option<String>,
    },

    /// Run one operator action against the server
    Action {
        #[command(subcommand)]
        action: ActionCommand,

        /// Path to configuration file
        #[arg(short, long, env = "REALITYHUB_CONFIG")]
        config: Option<String>,

        /// Server address, overrides the configuration
        #[arg(long)]
        host: Option<String>,
    },

    /// Display version and build information
    Version,

    /// Configuration management
    Config {
        #[command(subcommand)]
        subcommand: ConfigSubcommand,
    },
}

/// Operator actions
#[derive(Subcommand, Debug, Clone)]
pub enum ActionCommand {
    /// Run the mixer transition, then read the channels back
    Transition {
        /// Engine id (repeat for several engines)
        #[arg(short, long = "engine", required = true)]
        engines: Vec<String>,

        /// Mixer node
        #[arg(short, long, default_value = DEFAULT_MIXER_NODE)]
        node: String,
    },

    /// Put a channel on the preview or program bus of a mixer
    MixerChannel {
        /// Engine id (repeat for several engines)
        #[arg(short, long = "engine", required = true)]
        engines: Vec<String>,

        /// Mixer node
        #[arg(short, long, default_value = DEFAULT_MIXER_NODE)]
        node: String,

        /// Bus: preview or program
        #[arg(long, default_value = "preview")]
        channel: MixerChannel,

        /// Channel name (e.g. "Channel1")
        name: String,
    },

    /// Point a media input at a file
    MediaFile {
        /// Engine id (repeat for several engines)
        #[arg(short, long = "engine", required = true)]
        engines: Vec<String>,

        /// Media input node
        #[arg(short, long, default_value = DEFAULT_MEDIA_NODE)]
        node: String,

        /// Directory the path is relative to (default: the server's asset share)
        #[arg(short, long)]
        directory: Option<String>,

        /// File path below the directory
        path: String,
    },

    /// Set any node property
    SetProperty {
        /// Engine id (repeat for several engines)
        #[arg(short, long = "engine", required = true)]
        engines: Vec<String>,

        /// Node name
        #[arg(short, long)]
        node: String,

        /// Property path (e.g. "Transform//FOV/0")
        property: String,

        /// New value, as JSON or as a plain string
        value: String,
    },

    /// Trigger a node function by name ("Do Transition") or path
    Trigger {
        /// Engine id (repeat for several engines)
        #[arg(short, long = "engine", required = true)]
        engines: Vec<String>,

        /// Node name
        #[arg(short, long)]
        node: String,

        function: String,
    },

    /// Press a button of a rundown or template item
    Button {
        rundown: String,
        item: String,
        button: String,
    },

    /// Read one node property
    ReadProperty {
        /// Engine id
        #[arg(short, long)]
        engine: String,

        /// Node name
        #[arg(short, long)]
        node: String,

        /// Property path
        property: String,
    },
}

/// Configuration subcommands
#[derive(Subcommand, Debug, Clone)]
pub enum ConfigSubcommand {
    /// Display the current configuration
    Show {
        /// Path to configuration file
        #[arg(short, long)]
        config: Option<String>,
    },

    /// Initialize a new configuration file
    Init {
        /// Path where to create the config file
        #[arg(short, long)]
        path: Option<String>,

        /// Overwrite existing configuration
        #[arg(short, long)]
        force: bool,
    },

    /// Validate a configuration file
    Validate {
        /// Path to configuration file to validate
        #[arg(short, long)]
        config: Option<String>,
    },
}
