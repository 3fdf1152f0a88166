use std::path::PathBuf;

use snafu::{ResultExt, Snafu};
use tracing::{level_filters::LevelFilter, subscriber::SetGlobalDefaultError};
use tracing_appender::rolling::{InitError, RollingFileAppender, Rotation};
use tracing_subscriber::{EnvFilter, Layer, Registry, layer::SubscriberExt};

type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("failed to initialize rolling file appender in {directory:?}"))]
    InitRollingFileAppender {
        source: InitError,
        directory: PathBuf,
    },

    #[snafu(display("unable to set the global default subscriber"))]
    SetGlobalDefaultSubscriber { source: SetGlobalDefaultError },
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum LogFormat {
    #[default]
    Plain,
    Json,
}

impl LogFormat {
    fn from_env(env: &str) -> Self {
        match std::env::var(format!("{env}_FORMAT")) {
            Ok(format) if format.eq_ignore_ascii_case("json") => Self::Json,
            _ => Self::Plain,
        }
    }
}

/// Initializes `tracing` logging with options from the environment variable
/// given in the `env` parameter.
///
/// The variable holds the filter directives, e.g. `POD_PROFILES_LOG=debug`. If it is not set,
/// the maximum log level is INFO. Console output goes to standard error and `{env}_FORMAT=json`
/// switches it to JSON. `{env}_DIRECTORY` additionally writes JSON logs to a daily rotated file
/// named after `app_name` in that directory.
pub fn initialize_logging(env: &str, app_name: &str) -> Result<()> {
    let mut layers: Vec<Box<dyn Layer<Registry> + Sync + Send>> = Vec::new();

    // Standard output is reserved for rendered documents
    let console = tracing_subscriber::fmt::layer().with_writer(std::io::stderr);
    layers.push(match LogFormat::from_env(env) {
        LogFormat::Plain => console.with_filter(env_filter(env)).boxed(),
        LogFormat::Json => console.json().with_filter(env_filter(env)).boxed(),
    });

    if let Some(directory) = std::env::var_os(format!("{env}_DIRECTORY")).map(PathBuf::from) {
        let file_appender = RollingFileAppender::builder()
            .rotation(Rotation::DAILY)
            .filename_prefix(app_name)
            .filename_suffix("tracing-rs.json")
            .build(&directory)
            .context(InitRollingFileAppenderSnafu { directory })?;

        layers.push(
            tracing_subscriber::fmt::layer()
                .json()
                .with_writer(file_appender)
                .with_filter(env_filter(env))
                .boxed(),
        );
    }

    tracing::subscriber::set_global_default(Registry::default().with(layers))
        .context(SetGlobalDefaultSubscriberSnafu)
}

fn env_filter(env: &str) -> EnvFilter {
    EnvFilter::builder()
        .with_default_directive(LevelFilter::INFO.into())
        .with_env_var(env)
        .from_env_lossy()
}

#[cfg(test)]
mod tests {
    use tracing::{debug, error, info};

    use super::*;

    // This is mostly a sanity check, run with `NOT_SET=debug` and `--nocapture` to see all
    // messages.
    #[test]
    fn default_tracing_level_is_set_to_info() {
        initialize_logging("NOT_SET", "test").unwrap();

        error!("ERROR level messages should be seen.");
        info!("INFO level messages should also be seen by default.");
        debug!("DEBUG level messages should be seen only if you set the NOT_SET env var.");
    }

    #[test]
    fn unset_format_is_plain() {
        assert_eq!(LogFormat::from_env("NOT_SET"), LogFormat::Plain);
    }
}
