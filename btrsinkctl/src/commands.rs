use crate::ui::print_volume_list;
use anyhow::{anyhow, Context, Result};
use clap::{crate_version, Clap};
use libbtrsink::core::{
    drive::{sync_stores, SyncOptions},
    estimate::EstimateMode,
    humanize,
    local::LocalStore,
    object::ObjectStore,
    remote::RemoteStore,
    server, Store, StoreMode,
};
use libbtrsink::parsing::{StoreMethod, StoreUri};
use regex::Regex;
use slog_scope::*;
use std::path::PathBuf;

const URI_HELP: &str = "\
<store>:  [btrfs://]/path/to/directory/[snapshot]
          s3://bucket.host/prefix/[snapshot]
          ssh://[user@]host/path/to/directory/[snapshot]

The trailing \"/\" is significant: without it the locator names a single
snapshot. With only <store> given, its snapshots are listed.";

#[derive(Clap, Debug)]
#[clap(version = crate_version!(), about = "Synchronize two sets of btrfs snapshots.", after_help = URI_HELP)]
pub struct CliOptions {
    /// A store of btrfs snapshots to synchronize from, or the store to list.
    #[clap(name = "store")]
    pub store: String,

    /// The snapshot store to be updated.
    #[clap(name = "dest")]
    pub dest: Option<String>,

    /// Display what would be transferred, but don't do it.
    #[clap(short = 'n', long)]
    pub dry_run: bool,

    /// Delete any snapshots in <dest> that are not in <store>.
    #[clap(short, long)]
    pub delete: bool,

    /// Use estimated sizes instead of measuring diffs with a local test
    /// send. Give it twice to stop relying on quota data too.
    #[clap(short, long, parse(from_occurrences))]
    pub estimate: u64,

    /// Only display error messages.
    #[clap(short, long)]
    pub quiet: bool,

    /// Log debugging information to a file.
    #[clap(short, long)]
    pub logfile: Option<PathBuf>,

    /// Enable debug logs. Use twice to enable trace logs.
    #[clap(short, long, parse(from_occurrences))]
    pub verbose: i32,

    /// Size of chunks in a multipart upload, in MiB.
    #[clap(long, default_value = "20")]
    pub part_size: u64,

    /// Regular expression over snapshot paths to exclude.
    #[clap(long)]
    pub exclude: Vec<String>,

    /// Keep a destination locator without a trailing slash addressing a
    /// single snapshot instead of normalizing it to a directory.
    #[clap(long)]
    pub single_dest: bool,

    #[clap(long, hidden = true)]
    pub server: bool,

    #[clap(long, hidden = true)]
    pub mode: Option<String>,
}

pub async fn dispatch(options: CliOptions) -> Result<i32> {
    debug!("arguments: {:?}", options);

    if options.server {
        let mode = options
            .mode
            .as_deref()
            .and_then(StoreMode::from_flag)
            .ok_or_else(|| anyhow!("--server requires --mode r, a, or w"))?;
        server::serve(&options.store, mode).await?;
        return Ok(0);
    }

    match options.dest.clone() {
        Some(dest) => sync_command(&options, &dest).await,
        None => list_command(&options).await,
    }
}

async fn open_store(locator: &str, mode: StoreMode, normalize_dest: bool, part_size: u64) -> Result<Box<dyn Store>> {
    let mut uri: StoreUri = locator.parse()?;
    if normalize_dest {
        uri.normalize_dest();
    }
    Ok(match uri.method {
        StoreMethod::Btrfs => Box::new(LocalStore::open(&uri, mode)?),
        StoreMethod::Ssh => Box::new(RemoteStore::open(&uri, mode).await?),
        StoreMethod::S3 => Box::new(ObjectStore::open(&uri, mode, part_size)?),
    })
}

async fn sync_command(options: &CliOptions, dest_locator: &str) -> Result<i32> {
    let excludes = options
        .exclude
        .iter()
        .map(|pattern| Regex::new(pattern).context(format!("bad exclude pattern '{}'", pattern)))
        .collect::<Result<Vec<_>>>()?;

    let mut source = open_store(&options.store, StoreMode::Read, false, options.part_size).await?;
    let mut dest = open_store(
        dest_locator,
        StoreMode::for_destination(options.delete),
        !options.single_dest,
        options.part_size,
    )
    .await?;

    // Debris from receives a previous run never finalized is swept when the
    // destination opens.
    if !options.dry_run {
        dest.delete_partials().await.context("failed to sweep partial receives")?;
    }

    if source.list_volumes().await?.is_empty() {
        warn!("no snapshots in source");
        let locator = &options.store;
        if locator.ends_with('/') {
            error!(
                "'{}' does not contain any snapshots. Did you mean to type '{}'?",
                locator,
                &locator[..locator.len() - 1]
            );
        } else {
            error!("'{}' is not a snapshot. Did you mean to type '{}/'?", locator, locator);
        }
        let _ = source.close().await;
        let _ = dest.close().await;
        return Ok(1);
    }

    info!("snapshot graph is rebuilt after every transfer completion");
    if options.estimate == 0 {
        info!("look at option -e if you want to speed up the process");
    }

    let sync_options = SyncOptions {
        dry_run: options.dry_run,
        delete: options.delete,
        estimate: EstimateMode::from_occurrences(options.estimate),
        excludes,
    };
    let result = sync_stores(source.as_mut(), dest.as_mut(), &sync_options).await;

    // Stores release on every exit path: flush metadata and close sessions
    // whether or not the sync succeeded.
    let source_closed = source.close().await;
    let dest_closed = dest.close().await;
    let outcome = result?;
    source_closed?;
    dest_closed?;

    info!(
        "{} transfer(s), {} moved, {} deletion(s)",
        outcome.transferred,
        humanize(outcome.transferred_bytes),
        outcome.deleted
    );
    if !outcome.unreachable.is_empty() {
        error!("{} source volume(s) could not be replicated", outcome.unreachable.len());
        return Ok(1);
    }
    Ok(0)
}

async fn list_command(options: &CliOptions) -> Result<i32> {
    let mode = if options.delete { StoreMode::Write } else { StoreMode::Read };
    let mut store = open_store(&options.store, mode, false, options.part_size).await?;

    let mut volumes = store.list_volumes().await?;
    volumes.sort();
    print_volume_list(&volumes);

    if options.delete {
        store.delete_partials().await?;
    }
    store.close().await?;
    Ok(0)
}
