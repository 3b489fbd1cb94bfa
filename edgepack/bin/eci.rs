use std::{path::PathBuf, sync::Arc};

use clap::Parser;
use edgepack::{
    artifact::{Artifact, Source},
    cli::{parse_disk, EciArgs, EciSubcommand, RemoteSpec},
    manifest::{ConfigOpts, LegacyOpts},
    media::Format,
    progress::{NoopProgress, ProgressTracker, StatusProgress},
    pull::{FilesTarget, PullOpts, Puller},
    push::{PushOpts, Pusher},
    store::{ContainerdStore, ContentStore, DirectoryStore, FileStore, HttpTransport, RegistryStore},
    EdgepackResult,
};

//--------------------------------------------------------------------------------------------------
// Functions: main
//--------------------------------------------------------------------------------------------------

#[tokio::main]
async fn main() -> EdgepackResult<()> {
    let args = EciArgs::parse();

    if args.debug {
        tracing_subscriber::fmt()
            .with_max_level(tracing::Level::DEBUG)
            .init();
    } else {
        tracing_subscriber::fmt::init();
    }

    let store = resolve_remote(&args.remote, &args.namespace).await?;

    match args.subcommand {
        EciSubcommand::Push {
            image,
            kernel,
            initrd,
            root,
            config,
            disks,
            format,
            author,
            os,
            arch,
        } => {
            push_subcommand(
                store.as_ref(),
                &args.remote,
                args.verbose,
                image,
                kernel,
                initrd,
                root,
                config,
                disks,
                format,
                author,
                os,
                arch,
            )
            .await?;
        }
        EciSubcommand::Pull {
            image,
            dir,
            blocksize,
        } => {
            pull_subcommand(store.as_ref(), args.verbose, image, dir, blocksize).await?;
        }
        EciSubcommand::PullFiles {
            image,
            kernel,
            initrd,
            root,
            config,
            blocksize,
        } => {
            pull_files_subcommand(
                store.as_ref(),
                args.verbose,
                image,
                kernel,
                initrd,
                root,
                config,
                blocksize,
            )
            .await?;
        }
    }

    Ok(())
}

//--------------------------------------------------------------------------------------------------
// Functions: handlers
//--------------------------------------------------------------------------------------------------

async fn resolve_remote(remote: &str, namespace: &str) -> EdgepackResult<Box<dyn ContentStore>> {
    match remote.parse::<RemoteSpec>()? {
        RemoteSpec::Registry => Ok(Box::new(RegistryStore::new(Arc::new(HttpTransport::new())))),
        RemoteSpec::Directory { dir } => Ok(Box::new(DirectoryStore::new(dir).await?)),
        RemoteSpec::Containerd { socket } => {
            Ok(Box::new(ContainerdStore::connect(&socket, namespace)?))
        }
    }
}

fn progress_sink(verbose: bool, verb: &'static str) -> Arc<dyn ProgressTracker> {
    if verbose {
        Arc::new(StatusProgress::new(verb, std::io::stdout()))
    } else {
        Arc::new(NoopProgress)
    }
}

#[allow(clippy::too_many_arguments)]
async fn push_subcommand(
    store: &dyn ContentStore,
    remote: &str,
    verbose: bool,
    image: String,
    kernel: Option<PathBuf>,
    initrd: Option<PathBuf>,
    root: Option<String>,
    config: Option<PathBuf>,
    disks: Vec<String>,
    format: String,
    author: String,
    os: String,
    arch: String,
) -> EdgepackResult<()> {
    let root = root.as_deref().map(parse_disk).transpose()?;
    let disks = disks
        .iter()
        .map(|spec| parse_disk(spec))
        .collect::<EdgepackResult<Vec<_>>>()?;

    let artifact = Artifact {
        kernel: kernel.map(Source::file),
        initrd: initrd.map(Source::file),
        config: config.map(Source::file),
        root,
        disks,
        other: Vec::new(),
    };

    let format: Format = format.parse()?;
    let config_opts = ConfigOpts {
        author,
        os,
        architecture: arch,
    };

    let digest = Pusher::new(artifact, image.clone())
        .push(
            store,
            format,
            &config_opts,
            PushOpts {
                legacy: LegacyOpts::default(),
                progress: progress_sink(verbose, "Uploading"),
                ..Default::default()
            },
        )
        .await?;

    let location = if remote.is_empty() {
        String::new()
    } else {
        format!("to {} ", remote)
    };
    println!("Pushed image {} {}with digest {}", image, location, digest);
    Ok(())
}

async fn pull_subcommand(
    store: &dyn ContentStore,
    verbose: bool,
    image: String,
    dir: Option<PathBuf>,
    blocksize: usize,
) -> EdgepackResult<()> {
    let dir = match dir {
        Some(dir) => dir,
        None => std::env::current_dir()?,
    };

    let target = Arc::new(FileStore::new(&dir));
    let (descriptor, artifact) = Puller::new(image.clone())
        .pull(
            store,
            target,
            PullOpts {
                blocksize,
                progress: progress_sink(verbose, "Downloaded"),
                ..Default::default()
            },
        )
        .await?;

    println!(
        "Pulled image {} with digest {} to directory {}",
        image,
        descriptor.digest(),
        dir.display()
    );
    println!("file locations and types:");
    if let Some(kernel) = &artifact.kernel {
        println!("\tkernel: {}", dir.join(kernel.name()).display());
    }
    if let Some(initrd) = &artifact.initrd {
        println!("\tinitrd: {}", dir.join(initrd.name()).display());
    }
    match &artifact.root {
        Some(root) => println!(
            "\troot: {} {}",
            dir.join(root.source.name()).display(),
            root.kind
        ),
        None => println!("\troot: "),
    }
    for (index, disk) in artifact.disks.iter().enumerate() {
        println!(
            "\tadditional disk {}: {} {}",
            index,
            dir.join(disk.source.name()).display(),
            disk.kind
        );
    }
    Ok(())
}

#[allow(clippy::too_many_arguments)]
async fn pull_files_subcommand(
    store: &dyn ContentStore,
    verbose: bool,
    image: String,
    kernel: Option<PathBuf>,
    initrd: Option<PathBuf>,
    root: Option<PathBuf>,
    config: Option<PathBuf>,
    blocksize: usize,
) -> EdgepackResult<()> {
    let mut target = FilesTarget::new();
    if let Some(path) = &kernel {
        target = target.with_kernel(tokio::fs::File::create(path).await?);
    }
    if let Some(path) = &initrd {
        target = target.with_initrd(tokio::fs::File::create(path).await?);
    }
    if let Some(path) = &root {
        target = target.with_root(tokio::fs::File::create(path).await?);
    }
    if let Some(path) = &config {
        target = target.with_config(tokio::fs::File::create(path).await?);
    }

    let (descriptor, artifact) = Puller::new(image.clone())
        .pull(
            store,
            Arc::new(target),
            PullOpts {
                blocksize,
                progress: progress_sink(verbose, "Downloaded"),
                ..Default::default()
            },
        )
        .await?;

    println!("Pulled image {} with digest {}", image, descriptor.digest());
    println!("file locations and types:");
    if let Some(path) = &kernel {
        println!("\tkernel: {}", path.display());
    }
    if let Some(path) = &initrd {
        println!("\tinitrd: {}", path.display());
    }
    if let Some(path) = &root {
        match &artifact.root {
            Some(disk) => println!("\troot: {} {}", path.display(), disk.kind),
            None => println!("\troot: "),
        }
    }
    for (index, disk) in artifact.disks.iter().enumerate() {
        println!(
            "\tadditional disk {}: {} {}",
            index,
            disk.source.name(),
            disk.kind
        );
    }
    Ok(())
}
