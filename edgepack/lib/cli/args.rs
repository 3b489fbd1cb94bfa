use std::{path::PathBuf, str::FromStr};

use clap::Parser;

use crate::{
    artifact::{Disk, DiskKind, Source},
    EdgepackError, EdgepackResult,
};

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// `eci` manages Edge Container Images: push to or pull from a registry, a local directory
/// cache, or containerd.
#[derive(Debug, Parser)]
#[command(name = "eci", author)]
pub struct EciArgs {
    /// The subcommand to run
    #[command(subcommand)]
    pub subcommand: EciSubcommand,

    /// Remote to use for push/pull: blank for the default registry, /path or file:///path
    /// for a local directory, containerd:/path/to/socket for containerd
    #[arg(long, global = true, default_value = "")]
    pub remote: String,

    /// Namespace to use for containerd, ignored for all other remotes
    #[arg(long, global = true, default_value = "default")]
    pub namespace: String,

    /// Debug output
    #[arg(long, global = true)]
    pub debug: bool,

    /// Verbose output
    #[arg(long, global = true)]
    pub verbose: bool,
}

/// Available subcommands.
#[derive(Debug, Parser)]
pub enum EciSubcommand {
    /// Push an Edge Container Image (ECI) to an OCI compliant registry
    #[command(name = "push")]
    Push {
        /// Reference to the image, e.g. docker.io/foo/bar:tagabc
        #[arg(name = "IMAGE")]
        image: String,

        /// Path to the kernel file, optional
        #[arg(long)]
        kernel: Option<PathBuf>,

        /// Path to the initrd file, optional
        #[arg(long)]
        initrd: Option<PathBuf>,

        /// Path to the root disk and its kind, as <path>:<kind>
        #[arg(long)]
        root: Option<String>,

        /// Path to the ECI manifest config
        #[arg(long)]
        config: Option<PathBuf>,

        /// Path to an additional disk and its kind, as <path>:<kind>; repeatable
        #[arg(long = "disk", name = "DISK")]
        disks: Vec<String>,

        /// Which format to use, one of: artifacts, legacy
        #[arg(long, default_value = "artifacts")]
        format: String,

        /// Author to use in the generated config, if no config is provided
        #[arg(long, default_value = "")]
        author: String,

        /// OS to use in the generated config, if no config is provided
        #[arg(long = "OS", default_value = "")]
        os: String,

        /// Architecture to use in the generated config, if no config is provided
        #[arg(long, default_value = "")]
        arch: String,
    },

    /// Pull an Edge Container Image (ECI) from a registry to a local directory
    #[command(name = "pull")]
    Pull {
        /// Reference to the image
        #[arg(name = "IMAGE")]
        image: String,

        /// Directory where to install the ECI, defaults to the current directory
        #[arg(long)]
        dir: Option<PathBuf>,

        /// Blocksize to use for gunzip/untar, 0 for the default
        #[arg(long, default_value_t = 0)]
        blocksize: usize,
    },

    /// Pull an ECI, placing each artifact into a different target file location
    #[command(name = "pullfiles")]
    PullFiles {
        /// Reference to the image
        #[arg(name = "IMAGE")]
        image: String,

        /// Path to place the kernel
        #[arg(long)]
        kernel: Option<PathBuf>,

        /// Path to place the initrd
        #[arg(long)]
        initrd: Option<PathBuf>,

        /// Path to place the root disk
        #[arg(long)]
        root: Option<PathBuf>,

        /// Path to place the image config
        #[arg(long)]
        config: Option<PathBuf>,

        /// Blocksize to use for gunzip/untar, 0 for the default
        #[arg(long, default_value_t = 0)]
        blocksize: usize,
    },
}

/// Where a push or pull is directed, parsed from the `--remote` flag.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RemoteSpec {
    /// The default registry for the image reference.
    Registry,

    /// A containerd daemon at the given socket.
    Containerd {
        /// Path to the containerd socket.
        socket: String,
    },

    /// A local directory laid out as an OCI blob store.
    Directory {
        /// The directory root.
        dir: PathBuf,
    },
}

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

/// Parses a `<path>:<kind>` disk specification.
pub fn parse_disk(spec: &str) -> EdgepackResult<Disk> {
    let (path, kind) = spec
        .split_once(':')
        .ok_or_else(|| EdgepackError::InvalidInput("expected structure <path>:<kind>".into()))?;
    let kind = kind.parse::<DiskKind>()?;
    Ok(Disk::new(Source::file(path), kind))
}

//--------------------------------------------------------------------------------------------------
// Trait Implementations
//--------------------------------------------------------------------------------------------------

impl FromStr for RemoteSpec {
    type Err = EdgepackError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.is_empty() {
            return Ok(RemoteSpec::Registry);
        }
        if let Some(socket) = s.strip_prefix("containerd:") {
            return Ok(RemoteSpec::Containerd {
                socket: socket.to_string(),
            });
        }
        if let Some(dir) = s.strip_prefix("file://") {
            return Ok(RemoteSpec::Directory {
                dir: PathBuf::from(dir),
            });
        }
        if s.starts_with('/') {
            return Ok(RemoteSpec::Directory {
                dir: PathBuf::from(s),
            });
        }
        Err(EdgepackError::InvalidInput(format!("unknown remote: {}", s)))
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------
