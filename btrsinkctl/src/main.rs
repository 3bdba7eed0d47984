use btrsinkapp::{btrsink_run, AppOptions};
use clap::Clap;
mod commands;
mod ui;
use commands::CliOptions;

fn main() {
    let options = match CliOptions::try_parse() {
        Ok(options) => options,
        Err(e) => {
            let message = e.to_string();
            let code = if message.starts_with("error") { 2 } else { 0 };
            println!("{}", message);
            std::process::exit(code);
        }
    };

    let app_options = AppOptions {
        verbosity: options.verbose as usize,
        quiet: options.quiet,
        logfile: options.logfile.clone(),
        server: options.server,
    };
    let code = btrsink_run(|_| commands::dispatch(options), app_options);
    std::process::exit(code);
}
