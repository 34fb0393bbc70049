use clap::{Parser, Subcommand};

/// CLI surface definition.
#[derive(Parser, Debug)]
#[command(
    name = "pievo",
    about = "Evolve and inspect the encrypted Pi Coin model state",
    version,
    propagate_version = true
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone, PartialEq)]
pub enum Command {
    #[command(flatten)]
    Model(ModelCommand),
    /// Manage CLI configuration.
    #[command(subcommand)]
    Config(ConfigCommand),
}

/// Commands that read or mutate the persisted model state.
#[derive(Subcommand, Debug, Clone, PartialEq)]
pub enum ModelCommand {
    /// Add a training data point; the model evolves every 10 points.
    AddTrainingData {
        /// New data point for training.
        #[arg(long, allow_negative_numbers = true)]
        data_point: f64,
    },
    /// Predict stability from the current weights.
    Predict {
        /// Input for prediction.
        #[arg(long, allow_negative_numbers = true)]
        input: f64,
    },
    /// Print the current model state.
    ShowModel,
    /// Overwrite an existing model weight.
    UpdateWeight {
        /// Weight name; must already exist.
        #[arg(long)]
        key: String,
        /// New value.
        #[arg(long, allow_negative_numbers = true)]
        value: i64,
    },
}

#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum ConfigCommand {
    /// Create a default config file if one does not exist.
    Init,
}
