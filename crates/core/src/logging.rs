use std::fs;
use std::path::PathBuf;

use tracing_appender::rolling::{RollingFileAppender, Rotation};

pub const DEFAULT_LOG_FILTER: &str = "info";
pub const DEFAULT_NOISE_FILTER: &str = "ort=error";
/// Extra detail the log file keeps when the filter was chosen implicitly.
pub const DEFAULT_FILE_DETAIL_FILTER: &str = "tileforge_core=debug";
pub const DEFAULT_LOG_RETENTION_FILES: usize = 14;
pub const DEFAULT_LOG_DIR_NAME: &str = "logs";
pub const DEFAULT_LOG_FILE_PREFIX: &str = "tileforge";
pub const DEFAULT_LOG_FILE_SUFFIX: &str = "log";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoggingInitOptions {
    pub data_dir: Option<PathBuf>,
    pub verbose: u8,
    pub cli_log_filter: Option<String>,
    pub rust_log_env: Option<String>,
    pub default_log_filter: String,
    pub noise_filter: String,
    pub file_detail_filter: String,
    pub retention_files: usize,
}

impl Default for LoggingInitOptions {
    fn default() -> Self {
        Self {
            data_dir: None,
            verbose: 0,
            cli_log_filter: None,
            rust_log_env: None,
            default_log_filter: DEFAULT_LOG_FILTER.to_string(),
            noise_filter: DEFAULT_NOISE_FILTER.to_string(),
            file_detail_filter: DEFAULT_FILE_DETAIL_FILTER.to_string(),
            retention_files: DEFAULT_LOG_RETENTION_FILES,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoggingFilterPlan {
    pub user_filter: String,
    pub console_filter: String,
    pub file_filter: String,
}

#[derive(Debug)]
pub struct LoggingInitPlan {
    pub filters: LoggingFilterPlan,
    pub file_sink: FileSinkPlan,
}

#[derive(Debug)]
pub enum FileSinkPlan {
    Ready(ReadyFileSinkPlan),
    Fallback(FallbackFileSinkPlan),
}

#[derive(Debug)]
pub struct ReadyFileSinkPlan {
    pub log_dir: PathBuf,
    pub retention_files: usize,
    pub appender: RollingFileAppender,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FallbackFileSinkPlan {
    pub attempted_log_dir: Option<PathBuf>,
    pub retention_files: usize,
    pub reason: String,
}

pub fn compose_logging_init_plan(options: &LoggingInitOptions) -> LoggingInitPlan {
    LoggingInitPlan {
        filters: compose_logging_filters(options),
        file_sink: build_file_sink_plan(options),
    }
}

/// Daily rolling appender under `<data_dir>/logs`, or the reason there is none.
pub fn build_file_sink_plan(options: &LoggingInitOptions) -> FileSinkPlan {
    let retention_files = match options.retention_files {
        0 => DEFAULT_LOG_RETENTION_FILES,
        n => n,
    };
    let fallback = |attempted_log_dir: Option<PathBuf>, reason: String| {
        FileSinkPlan::Fallback(FallbackFileSinkPlan {
            attempted_log_dir,
            retention_files,
            reason,
        })
    };

    let Some(data_dir) = options.data_dir.as_deref() else {
        return fallback(
            None,
            "file sink disabled: data_dir is not configured".to_string(),
        );
    };

    let log_dir = data_dir.join(DEFAULT_LOG_DIR_NAME);
    if let Err(error) = fs::create_dir_all(&log_dir) {
        return fallback(
            Some(log_dir),
            format!("failed to create log directory: {error}"),
        );
    }

    let built = RollingFileAppender::builder()
        .rotation(Rotation::DAILY)
        .filename_prefix(DEFAULT_LOG_FILE_PREFIX)
        .filename_suffix(DEFAULT_LOG_FILE_SUFFIX)
        .max_log_files(retention_files)
        .build(&log_dir);

    match built {
        Ok(appender) => FileSinkPlan::Ready(ReadyFileSinkPlan {
            log_dir,
            retention_files,
            appender,
        }),
        Err(error) => fallback(
            Some(log_dir),
            format!("failed to initialize rolling file sink: {error}"),
        ),
    }
}

/// Filter precedence: `--log-filter`, then `-v`/`-vv`, then `RUST_LOG`, then
/// the default. Noise suppression and the file detail directive only apply
/// when the user did not pick a filter on the command line.
pub fn compose_logging_filters(options: &LoggingInitOptions) -> LoggingFilterPlan {
    let user_filter = select_user_filter(options);
    let implicit = options.cli_log_filter.is_none() && options.verbose == 0;

    if !implicit {
        return LoggingFilterPlan {
            console_filter: user_filter.clone(),
            file_filter: user_filter.clone(),
            user_filter,
        };
    }

    let console_filter = join_directives(&[&options.noise_filter, &user_filter]);
    let file_filter = join_directives(&[
        &options.noise_filter,
        &user_filter,
        &options.file_detail_filter,
    ]);
    LoggingFilterPlan {
        user_filter,
        console_filter,
        file_filter,
    }
}

fn select_user_filter(options: &LoggingInitOptions) -> String {
    if let Some(filter) = options.cli_log_filter.as_deref() {
        filter.to_string()
    } else if options.verbose >= 2 {
        "trace".to_string()
    } else if options.verbose == 1 {
        "debug".to_string()
    } else if let Some(filter) = options.rust_log_env.as_deref() {
        filter.to_string()
    } else {
        options.default_log_filter.clone()
    }
}

fn join_directives(parts: &[&str]) -> String {
    parts
        .iter()
        .map(|part| part.trim())
        .filter(|part| !part.is_empty())
        .collect::<Vec<_>>()
        .join(",")
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::{tempdir, NamedTempFile};

    #[test]
    fn explicit_filter_wins_over_verbosity_and_env() {
        let options = LoggingInitOptions {
            verbose: 2,
            cli_log_filter: Some("tileforge_core=trace".to_string()),
            rust_log_env: Some("error".to_string()),
            ..Default::default()
        };

        let filters = compose_logging_filters(&options);
        assert_eq!(filters.user_filter, "tileforge_core=trace");
        assert_eq!(filters.console_filter, "tileforge_core=trace");
        assert_eq!(filters.file_filter, "tileforge_core=trace");
    }

    #[test]
    fn verbosity_maps_to_debug_and_trace() {
        let debug = LoggingInitOptions {
            verbose: 1,
            rust_log_env: Some("warn".to_string()),
            ..Default::default()
        };
        let trace = LoggingInitOptions {
            verbose: 2,
            ..debug.clone()
        };

        assert_eq!(compose_logging_filters(&debug).console_filter, "debug");
        assert_eq!(compose_logging_filters(&trace).console_filter, "trace");
        assert_eq!(compose_logging_filters(&trace).file_filter, "trace");
    }

    #[test]
    fn rust_log_applies_without_explicit_selection() {
        let options = LoggingInitOptions {
            rust_log_env: Some("warn,tileforge_app=debug".to_string()),
            ..Default::default()
        };

        let filters = compose_logging_filters(&options);
        assert_eq!(filters.user_filter, "warn,tileforge_app=debug");
        assert_eq!(filters.console_filter, "ort=error,warn,tileforge_app=debug");
    }

    #[test]
    fn implicit_selection_adds_noise_and_file_detail() {
        let filters = compose_logging_filters(&LoggingInitOptions::default());
        assert_eq!(filters.user_filter, "info");
        assert_eq!(filters.console_filter, "ort=error,info");
        assert_eq!(filters.file_filter, "ort=error,info,tileforge_core=debug");
    }

    #[test]
    fn empty_noise_filter_is_skipped() {
        let options = LoggingInitOptions {
            noise_filter: "  ".to_string(),
            file_detail_filter: String::new(),
            ..Default::default()
        };
        let filters = compose_logging_filters(&options);
        assert_eq!(filters.console_filter, "info");
        assert_eq!(filters.file_filter, "info");
    }

    #[test]
    fn file_sink_uses_log_dir_under_data_dir() {
        let data_dir = tempdir().expect("tempdir");
        let options = LoggingInitOptions {
            data_dir: Some(data_dir.path().to_path_buf()),
            retention_files: 0,
            ..Default::default()
        };

        let plan = build_file_sink_plan(&options);
        match plan {
            FileSinkPlan::Ready(ready) => {
                assert_eq!(ready.log_dir, data_dir.path().join(DEFAULT_LOG_DIR_NAME));
                assert_eq!(ready.retention_files, DEFAULT_LOG_RETENTION_FILES);
                assert!(ready.log_dir.exists());
            }
            FileSinkPlan::Fallback(fallback) => panic!(
                "file sink fell back: {}",
                fallback.reason
            ),
        }
    }

    #[test]
    fn file_sink_disabled_without_data_dir() {
        match build_file_sink_plan(&LoggingInitOptions::default()) {
            FileSinkPlan::Ready(ready) => {
                panic!("no data dir, yet a sink at {}", ready.log_dir.display())
            }
            FileSinkPlan::Fallback(fallback) => {
                assert_eq!(fallback.attempted_log_dir, None);
                assert!(fallback.reason.contains("data_dir is not configured"));
            }
        }
    }

    #[test]
    fn data_dir_that_is_a_file_falls_back() {
        let data_dir_file = NamedTempFile::new().expect("named temp file");
        let options = LoggingInitOptions {
            data_dir: Some(data_dir_file.path().to_path_buf()),
            retention_files: 30,
            ..Default::default()
        };

        match build_file_sink_plan(&options) {
            FileSinkPlan::Ready(_) => panic!("log dir under a file must not be ready"),
            FileSinkPlan::Fallback(fallback) => {
                assert_eq!(
                    fallback.attempted_log_dir,
                    Some(data_dir_file.path().join(DEFAULT_LOG_DIR_NAME))
                );
                assert_eq!(fallback.retention_files, 30);
                assert!(fallback.reason.contains("failed to create log directory"));
            }
        }
    }
}
