pub mod cli;
pub mod commands;
pub mod completion;
pub mod config;
pub mod datastore;
pub mod datetime;
pub mod filter;
pub mod grid;
pub mod model;
pub mod render;
pub mod validate;

use std::ffi::OsString;

use anyhow::Context;
use clap::Parser;
use tracing::{
  debug,
  info
};

/// Loads the rc file and layers the
/// `rc.KEY=VALUE` arguments over it,
/// flag-style `--rc` pairs last.
fn load_config(
  cli: &cli::GlobalCli,
  early_overrides: Vec<(String, String)>
) -> anyhow::Result<config::Config> {
  let mut cfg = config::Config::load(
    cli.config.as_deref()
  )?;
  cfg.apply_overrides(
    early_overrides.into_iter().chain(
      cli.rc_overrides.iter().map(|kv| {
        (kv.key.clone(), kv.value.clone())
      })
    )
  );
  Ok(cfg)
}

#[tracing::instrument(skip_all)]
pub fn run(
  raw_args: Vec<OsString>
) -> anyhow::Result<()> {
  let pre =
    cli::preprocess_args(&raw_args)?;
  let cli = cli::GlobalCli::parse_from(
    pre.cleaned_args
  );

  cli::init_tracing(
    cli.verbose,
    cli.quiet
  )?;
  debug!(?pre.rc_overrides, "rc overrides from arguments");

  let cfg =
    load_config(&cli, pre.rc_overrides)?;

  // A bad grid.mode fails here, before
  // any command touches the store.
  let grid_mode = cfg
    .grid_mode()
    .context("failed to read grid layout")?;
  let timezone =
    datetime::project_timezone();

  let data_dir =
    config::resolve_data_dir(
      &cfg,
      cli.data.as_deref()
    )
    .context(
      "failed to resolve data \
       directory"
    )?;

  info!(
    timezone = %timezone,
    ?grid_mode,
    data_dir = %data_dir.display(),
    rc_files = cfg.loaded_files.len(),
    "smartpcm ready"
  );

  let store =
    datastore::DataStore::open(
      &data_dir
    )
    .with_context(|| {
      format!(
        "failed to open maintenance \
         plan at {}",
        data_dir.display()
      )
    })?;

  let renderer =
    render::Renderer::new(&cfg)?;
  let inv = cli::Invocation::parse(
    &cfg, cli.rest
  )?;
  let command = inv.command.clone();

  commands::dispatch(
    &store, &cfg, &renderer, inv
  )?;

  debug!(%command, "command finished");
  Ok(())
}
