//! Diagnostic logging setup shared by every `gh-ci-broker` subcommand.
//!
//! Trimmed of `metrics`/`metrics-prometheus`/tokio-console integration:
//! this binary exposes no metrics surface, so carrying a Prometheus
//! endpoint would be dead weight. The reload-handle trick for changing
//! the log filter at runtime is kept because it costs little and makes
//! `SIGHUP`-triggered filter changes possible without a restart.

use anyhow::Context;
use clap::ValueEnum;
use once_cell::sync::OnceCell;
use std::path::PathBuf;
use tracing_subscriber::fmt::writer::BoxMakeWriter;
use tracing_subscriber::prelude::*;
use tracing_subscriber::{fmt, EnvFilter, Layer};

static FILTER_RELOAD_HANDLE: OnceCell<Box<dyn Fn(&str) -> anyhow::Result<()> + Send + Sync>> =
    OnceCell::new();

/// Change the active log filter at runtime. Fails if logging hasn't been
/// initialized yet.
pub fn set_log_filter(new_filter: &str) -> anyhow::Result<()> {
    let func = FILTER_RELOAD_HANDLE
        .get()
        .ok_or_else(|| anyhow::anyhow!("logging has not been initialized"))?;
    (func)(new_filter)
}

#[derive(Debug, Clone, Copy, ValueEnum)]
#[clap(rename_all = "kebab_case")]
pub enum DiagnosticFormat {
    Pretty,
    Full,
    Compact,
    Json,
}

pub struct LoggingConfig<'a> {
    pub log_dir: Option<PathBuf>,
    pub filter_env_var: &'a str,
    pub default_filter: &'a str,
    pub diag_format: DiagnosticFormat,
}

impl<'a> LoggingConfig<'a> {
    pub fn init(&self) -> anyhow::Result<()> {
        let mut flush_guard = None;
        let log_writer = if let Some(log_dir) = &self.log_dir {
            let file_appender = tracing_appender::rolling::hourly(log_dir, "log");
            let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
            flush_guard = Some(guard);
            BoxMakeWriter::new(non_blocking)
        } else {
            BoxMakeWriter::new(std::io::stderr)
        };

        let layer = fmt::layer().with_thread_names(true).with_writer(log_writer);
        let layer = match self.diag_format {
            DiagnosticFormat::Pretty => layer.pretty().boxed(),
            DiagnosticFormat::Full => layer.boxed(),
            DiagnosticFormat::Compact => layer.compact().boxed(),
            DiagnosticFormat::Json => layer.json().boxed(),
        };

        let env_filter = EnvFilter::try_new(
            std::env::var(self.filter_env_var)
                .as_deref()
                .unwrap_or(self.default_filter),
        )?;
        let (env_filter, reload_handle) = tracing_subscriber::reload::Layer::new(env_filter);
        tracing_subscriber::registry()
            .with(layer.with_filter(env_filter))
            .init();

        FILTER_RELOAD_HANDLE
            .set(Box::new(move |new_filter: &str| {
                let f = EnvFilter::try_new(new_filter)
                    .with_context(|| format!("parsing log filter '{new_filter}'"))?;
                Ok(reload_handle.reload(f).context("applying new log filter")?)
            }))
            .map_err(|_| anyhow::anyhow!("failed to assign reloadable logging filter"))?;

        // Leak the non-blocking flusher's guard for the lifetime of the
        // process; dropping it early would silently stop log writes.
        if let Some(guard) = flush_guard {
            std::mem::forget(guard);
        }

        Ok(())
    }
}
