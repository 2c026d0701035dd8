//! Stable participant id for this installation.

use std::fs;
use std::io;
use std::path::Path;

use thiserror::Error;
use tracing::{debug, info, warn};

use crate::model::ParticipantId;

#[derive(Debug, Error)]
pub enum IdentityError {
    #[error("failed to read identity file {path}: {source}")]
    Read { path: String, source: io::Error },
    #[error("failed to write identity file {path}: {source}")]
    Write { path: String, source: io::Error },
}

/// Returns the id stored at `path`, creating the file with a fresh id when
/// it is missing or does not hold a valid id.
pub fn load_or_create(path: &Path) -> Result<ParticipantId, IdentityError> {
    match fs::read_to_string(path) {
        Ok(contents) => match ParticipantId::new(contents.trim()) {
            Ok(id) => {
                debug!(%id, path = %path.display(), "loaded participant id");
                return Ok(id);
            }
            Err(err) => {
                warn!(path = %path.display(), error = %err, "identity file is corrupt, replacing it");
            }
        },
        Err(err) if err.kind() == io::ErrorKind::NotFound => {}
        Err(source) => {
            return Err(IdentityError::Read {
                path: path.display().to_string(),
                source,
            })
        }
    }

    let id = ParticipantId::generate();
    persist(path, &id)?;
    info!(%id, path = %path.display(), "created participant id");
    Ok(id)
}

fn persist(path: &Path, id: &ParticipantId) -> Result<(), IdentityError> {
    let write_error = |source| IdentityError::Write {
        path: path.display().to_string(),
        source,
    };
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(write_error)?;
    }
    fs::write(path, format!("{id}\n")).map_err(write_error)
}
