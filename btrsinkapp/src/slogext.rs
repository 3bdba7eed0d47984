use slog::{b, Drain, Level, Logger, OwnedKVList, Record, KV};
use slog_term::{timestamp_local, CountingWriter, Decorator, RecordDecorator, Serializer};
use std::{io, io::Write, result};

/// Mutex-serialized drain for sinks that are not thread safe (the plain
/// file decorator).
pub struct SyncDrain<D> {
    inner: std::sync::Arc<std::sync::Mutex<D>>,
}

impl<D> SyncDrain<D> {
    pub fn new(inner: D) -> Self {
        Self {
            inner: std::sync::Arc::new(std::sync::Mutex::new(inner)),
        }
    }
}

impl<D: Drain> Drain for SyncDrain<D> {
    type Ok = D::Ok;
    type Err = D::Err;

    fn log(&self, record: &slog::Record, values: &slog::OwnedKVList) -> Result<Self::Ok, Self::Err> {
        let inner_locked = self.inner.lock().expect("drains have not paniced");
        inner_locked.log(record, values)
    }
}

fn print_msg_header(
    mut rd: &mut dyn RecordDecorator,
    record: &Record,
    timestamp: bool,
    prefix: Option<&'static str>,
) -> io::Result<bool> {
    if let Some(prefix) = prefix {
        rd.start_msg()?;
        write!(rd, "{}", prefix)?;
    }

    if timestamp {
        rd.start_timestamp()?;
        timestamp_local(&mut rd)?;
        rd.start_whitespace()?;
        write!(rd, " ")?;
    }

    rd.start_level()?;
    write!(rd, "{}", record.level().as_short_str())?;

    rd.start_whitespace()?;
    write!(rd, " ")?;

    rd.start_msg()?;

    let count = {
        let mut count_rd = CountingWriter::new(&mut rd);
        write!(count_rd, "{}", record.msg())?;
        count_rd.count()
    };

    let module = record.location().module;
    if !module.starts_with("btrsink") && !module.starts_with("libbtrsink") {
        rd.reset()?;
        let possible_module_path = match module {
            "<unknown>" => record.tag(),
            path => path,
        };
        write!(rd, " [{}]", possible_module_path)?;
    }

    Ok(count != 0)
}

pub struct CustomFullFormat<D>
where
    D: Decorator,
{
    decorator: D,
    timestamp: bool,
    prefix: Option<&'static str>,
}

impl<D> Drain for CustomFullFormat<D>
where
    D: Decorator,
{
    type Ok = ();
    type Err = io::Error;

    fn log(&self, record: &Record, values: &OwnedKVList) -> result::Result<Self::Ok, Self::Err> {
        self.format_full(record, values)
    }
}

impl<D> CustomFullFormat<D>
where
    D: Decorator,
{
    pub fn new(decorator: D, timestamp: bool, server: bool) -> Self {
        Self {
            decorator,
            timestamp,
            prefix: if server { Some("S|") } else { None },
        }
    }

    fn format_full(&self, record: &Record, values: &OwnedKVList) -> io::Result<()> {
        self.decorator.with_record(record, values, |decorator| {
            let comma_needed = print_msg_header(decorator, record, self.timestamp, self.prefix)?;
            {
                let mut serializer = Serializer::new(decorator, comma_needed, false);

                record.kv().serialize(record, &mut serializer)?;

                values.serialize(record, &mut serializer)?;

                serializer.finish()?;
            }

            decorator.start_whitespace()?;
            writeln!(decorator)?;

            decorator.flush()?;

            Ok(())
        })
    }
}

pub struct SlogLogLogger(Logger);

pub fn log_to_slog_level(level: log::Level) -> Level {
    match level {
        log::Level::Trace => Level::Trace,
        log::Level::Debug => Level::Debug,
        log::Level::Info => Level::Info,
        log::Level::Warn => Level::Warning,
        log::Level::Error => Level::Error,
    }
}

fn record_as_location(r: &log::Record) -> slog::RecordLocation {
    let module = r.module_path_static().unwrap_or("<unknown>");
    let file = r.file_static().unwrap_or("<unknown>");
    let line = r.line().unwrap_or_default();

    slog::RecordLocation {
        file,
        line,
        column: 0,
        function: "",
        module,
    }
}

impl SlogLogLogger {
    pub fn install(log: Logger, level_filter: log::LevelFilter) {
        log::set_boxed_logger(Box::new(Self(log))).expect("no handling of set logger errors");
        log::set_max_level(level_filter);
    }
}

impl log::Log for SlogLogLogger {
    fn enabled(&self, _: &log::Metadata) -> bool {
        true
    }

    fn log(&self, r: &log::Record) {
        let level = log_to_slog_level(r.metadata().level());

        let args = r.args();
        let target = r.target();
        let location = &record_as_location(r);
        let s = slog::RecordStatic {
            location,
            level,
            tag: target,
        };
        self.0.log(&slog::Record::new(&s, args, b!()));
    }

    fn flush(&self) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn log_levels_map_onto_slog() {
        assert_eq!(log_to_slog_level(log::Level::Trace), Level::Trace);
        assert_eq!(log_to_slog_level(log::Level::Warn), Level::Warning);
        assert_eq!(log_to_slog_level(log::Level::Error), Level::Error);
    }
}
