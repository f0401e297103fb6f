//! Error taxonomy for the remastering pipeline.
//!
//! Every component returns [`RemasterError`]. Host-level helpers keep using
//! `anyhow` internally; their errors are boxed into the `source` of the
//! variant for the stage that called them, so the full cause chain survives.

use std::fmt;
use std::path::PathBuf;
use thiserror::Error;

/// Boxed underlying cause.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

pub type Result<T, E = RemasterError> = std::result::Result<T, E>;

/// Customizer step identifiers, in application order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum CustomizationStep {
    Manifest,
    Branding,
    Provisioning,
    BootMenu,
}

impl CustomizationStep {
    pub const ALL: [CustomizationStep; 4] = [
        CustomizationStep::Manifest,
        CustomizationStep::Branding,
        CustomizationStep::Provisioning,
        CustomizationStep::BootMenu,
    ];
}

impl fmt::Display for CustomizationStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CustomizationStep::Manifest => write!(f, "manifest"),
            CustomizationStep::Branding => write!(f, "branding"),
            CustomizationStep::Provisioning => write!(f, "provisioning"),
            CustomizationStep::BootMenu => write!(f, "boot-menu"),
        }
    }
}

#[derive(Debug, Error)]
pub enum RemasterError {
    #[error("failed to fetch {source_location}")]
    Transfer {
        source_location: String,
        #[source]
        source: BoxError,
    },

    #[error("{} is {actual} bytes, expected at least {minimum} (deleted, will re-fetch)", path.display())]
    Size {
        path: PathBuf,
        actual: u64,
        minimum: u64,
    },

    #[error("{} is not an ISO 9660 image: {reason} (deleted, will re-fetch)", path.display())]
    Format { path: PathBuf, reason: String },

    #[error("{} sha256 mismatch: expected {expected}, got {actual} (deleted, will re-fetch)", path.display())]
    Checksum {
        path: PathBuf,
        expected: String,
        actual: String,
    },

    #[error("failed to mount {} at {}", image.display(), mount_point.display())]
    Mount {
        image: PathBuf,
        mount_point: PathBuf,
        #[source]
        source: BoxError,
    },

    #[error("failed to stage {}", path.display())]
    Stage {
        path: PathBuf,
        #[source]
        source: BoxError,
    },

    #[error("customization step '{step}' failed")]
    Customization {
        step: CustomizationStep,
        #[source]
        source: BoxError,
    },

    #[error("required boot asset '{asset}' is missing and could not be acquired")]
    MissingBootAsset {
        asset: String,
        #[source]
        source: Option<BoxError>,
    },

    #[error("precondition failed: {0}")]
    Precondition(String),

    #[error("failed to compose {}", output.display())]
    Compose {
        output: PathBuf,
        #[source]
        source: BoxError,
    },

    #[error("interrupted")]
    Interrupted,
}

impl RemasterError {
    /// Stable error kind name used in reports.
    pub fn kind(&self) -> &'static str {
        match self {
            RemasterError::Transfer { .. } => "TransferError",
            RemasterError::Size { .. } => "SizeError",
            RemasterError::Format { .. } => "FormatError",
            RemasterError::Checksum { .. } => "ChecksumError",
            RemasterError::Mount { .. } => "MountError",
            RemasterError::Stage { .. } => "StageError",
            RemasterError::Customization { .. } => "CustomizationError",
            RemasterError::MissingBootAsset { .. } => "MissingBootAssetError",
            RemasterError::Precondition(_) => "PreconditionError",
            RemasterError::Compose { .. } => "ComposeError",
            RemasterError::Interrupted => "Interrupted",
        }
    }

    /// Message including every cause in the chain, separated by ": ".
    pub fn chain_message(&self) -> String {
        let mut message = self.to_string();
        let mut cause = std::error::Error::source(self);
        while let Some(err) = cause {
            message.push_str(": ");
            message.push_str(&err.to_string());
            cause = err.source();
        }
        message
    }

    pub(crate) fn transfer(source_location: impl Into<String>, source: impl Into<BoxError>) -> Self {
        RemasterError::Transfer {
            source_location: source_location.into(),
            source: source.into(),
        }
    }

    pub(crate) fn stage(path: impl Into<PathBuf>, source: impl Into<BoxError>) -> Self {
        RemasterError::Stage {
            path: path.into(),
            source: source.into(),
        }
    }

    pub(crate) fn compose(output: impl Into<PathBuf>, source: impl Into<BoxError>) -> Self {
        RemasterError::Compose {
            output: output.into(),
            source: source.into(),
        }
    }
}
