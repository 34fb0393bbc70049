use std::io::Write;

use color_eyre::{eyre::eyre, Result};
use pievo_core::{model::InvalidKeyError, storage::SecureStore};
use pievo_model::SecureStoreModelRepo;
use pievo_storage::{key_provider::FileKeyProvider, secure_file_store::EncryptedFileStore};
use tracing::debug;

use crate::{cli::ModelCommand, config, storage};

/// Per-process state handed to every command handler.
pub struct AppContext<S: SecureStore> {
    pub repo: SecureStoreModelRepo<S>,
}

impl<S: SecureStore> AppContext<S> {
    pub fn new(store: S) -> Self {
        Self {
            repo: SecureStoreModelRepo::new(store),
        }
    }
}

impl AppContext<EncryptedFileStore<FileKeyProvider>> {
    pub fn from_config(config: &config::Config) -> Result<Self> {
        Ok(Self::new(storage::store_from_config(config)?))
    }
}

/// Execute a model subcommand, writing user-facing output to `out`.
pub async fn handle<S: SecureStore>(
    cmd: ModelCommand,
    ctx: &AppContext<S>,
    out: &mut impl Write,
) -> Result<()> {
    match cmd {
        ModelCommand::AddTrainingData { data_point } => {
            let (state, outcome) = ctx
                .repo
                .add_training_data(data_point)
                .await
                .map_err(|e| eyre!("{e:#}"))?;
            if outcome.evolved() {
                writeln!(out, "AI evolved!")?;
            }
            writeln!(
                out,
                "Added data: {data_point:?}, Training count: {}",
                state.training_count
            )?;
        }
        ModelCommand::Predict { input } => {
            let prediction = ctx.repo.predict(input).await.map_err(|e| eyre!("{e:#}"))?;
            writeln!(out, "Prediction: {prediction:?}")?;
        }
        ModelCommand::ShowModel => {
            let opened = ctx.repo.open().await.map_err(|e| eyre!("{e:#}"))?;
            debug!(fresh = opened.is_fresh(), "showing model");
            writeln!(out, "{}", serde_json::to_string_pretty(opened.state())?)?;
        }
        ModelCommand::UpdateWeight { key, value } => {
            match ctx.repo.update_weight(&key, value).await {
                Ok(_) => writeln!(out, "Updated {key} to {value}")?,
                Err(err) => match err.downcast_ref::<InvalidKeyError>() {
                    Some(invalid) => writeln!(out, "{invalid}")?,
                    None => return Err(eyre!("{err:#}")),
                },
            }
        }
    }

    Ok(())
}
