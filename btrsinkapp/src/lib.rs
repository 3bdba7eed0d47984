mod slogext;
use anyhow::Result;
use human_panic::setup_panic;
use slog::{debug, error, info, o, trace, Drain, Level, Logger};
use slogext::{CustomFullFormat, SlogLogLogger, SyncDrain};
use std::{fs::OpenOptions, future::Future, path::PathBuf, sync::Arc, time::Duration};
use tokio::runtime::Runtime;

pub struct AppOptions {
    /// Occurrences of the verbose flag.
    pub verbosity: usize,
    pub quiet: bool,
    /// Appends a full debug log to this file.
    pub logfile: Option<PathBuf>,
    /// Server mode prefixes every line so interleaved remote logs stay
    /// attributable, and keeps stdout untouched for the protocol.
    pub server: bool,
}

/// Run an async entry point under the process-wide logger and runtime,
/// returning the process exit code.
pub fn btrsink_run<M, F>(main: M, options: AppOptions) -> i32
where
    M: FnOnce(Logger) -> F,
    F: Future<Output = Result<i32>>,
{
    setup_panic!();

    let (internal_level, external_level) = if options.quiet {
        (Level::Warning, log::LevelFilter::Warn)
    } else {
        match options.verbosity {
            0 => (Level::Info, log::LevelFilter::Info),
            1 => (Level::Debug, log::LevelFilter::Info),
            2 => (Level::Trace, log::LevelFilter::Debug),
            _ => (Level::Trace, log::LevelFilter::Trace),
        }
    };

    let exit_code;
    {
        let (slog_drain, slog_drain_ctrl) = {
            let decorator = slog_term::TermDecorator::new().stderr().build();
            let drain = CustomFullFormat::new(decorator, false, options.server).fuse();
            let drain = slog_async::Async::new(drain).build().fuse();
            let drain = slog_atomic::AtomicSwitch::new(drain);
            let ctrl = drain.ctrl();
            (drain.map(Arc::new), ctrl)
        };

        {
            let slog_logger = match &options.logfile {
                Some(path) => {
                    let file = match OpenOptions::new().create(true).append(true).open(path) {
                        Ok(file) => file,
                        Err(error) => {
                            eprintln!("can't open log file {:?}: {}", path, error);
                            return 1;
                        }
                    };
                    let file_drain = CustomFullFormat::new(slog_term::PlainDecorator::new(file), true, options.server);
                    let file_drain = SyncDrain::new(file_drain.fuse());
                    let file_drain = file_drain.filter_level(Level::Debug).fuse();
                    let term_drain = Arc::clone(&slog_drain).filter_level(internal_level).fuse();
                    Logger::root(slog::Duplicate::new(term_drain, file_drain).fuse(), o!())
                }
                None => {
                    let drain = Arc::clone(&slog_drain).filter_level(internal_level).fuse();
                    Logger::root(drain, o!())
                }
            };

            slog_scope::set_global_logger(slog_logger.clone()).cancel_reset();
            SlogLogLogger::install(slog_logger.clone(), external_level);

            debug!(slog_logger, "debug messages enabled");
            trace!(slog_logger, "trace messages enabled");

            exit_code = {
                let runtime = Runtime::new().expect("can create runtime");
                let result = runtime.block_on(main(slog_logger.clone()));
                let code = match result {
                    Ok(code) => code,
                    Err(e) => {
                        error!(slog_logger, "{:#}", e);
                        for cause in e.chain().skip(1) {
                            info!(slog_logger, "error caused by: {}", cause);
                        }
                        1
                    }
                };
                runtime.shutdown_timeout(Duration::from_secs(0));
                code
            };

            slog_scope::set_global_logger(Logger::root(slog::Discard, o!())).cancel_reset();
        }

        slog_drain_ctrl.set(Logger::root(slog::Discard, o!()));
    }

    exit_code
}
