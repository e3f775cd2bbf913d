use std::process::ExitCode;
use taskmem::commands::Cli;
use taskmem::config::Settings;
use taskmem::coordinator;
use taskmem::error::ErrorCategory;
use taskmem::signal;
use taskmem::utils::init_logger;

fn main() -> ExitCode {
    let cli = Cli::parse_args();

    // an explicit --config must exist; the default taskmem.toml is optional
    let settings = match Settings::load(cli.config.as_deref(), cli.config.is_some()) {
        Ok(settings) => cli.apply(settings),
        Err(err) => {
            eprintln!("{}", err.user_message());
            return ExitCode::from(2);
        }
    };

    if let Err(err) = init_logger(settings.log_level.as_deref(), settings.diag_log.clone()) {
        eprintln!("Failed to initialize logging: {err}");
    }

    if let Err(err) = signal::install() {
        tracing::warn!("failed to install signal handlers: {err}");
    }

    let role = cli.role();
    match coordinator::run(settings, role) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            if err.category() == ErrorCategory::Resource {
                eprintln!("Failed to initialize shared memory!");
            }
            tracing::error!(category = err.category().display_name(), "{err}");
            eprintln!("{}", err.user_message());
            ExitCode::from(1)
        }
    }
}
