//! Implementation of the `wasmforge list` command.

use std::path::PathBuf;

use anyhow::Result;
use clap::Args;
use owo_colors::{OwoColorize, Stream};
use serde::Serialize;

use wasmforge_lib::recipe::RecipeStore;

use crate::output::{self, OutputFormat};

#[derive(Args)]
pub struct ListArgs {
  /// Directory containing the recipes
  #[arg(long, default_value = "recipes")]
  recipe_dir: PathBuf,

  #[arg(long, value_enum, default_value_t)]
  format: OutputFormat,
}

#[derive(Serialize)]
struct ListEntry<'a> {
  name: &'a str,
  version: &'a str,
  kind: &'a str,
  run: &'a [String],
  host: &'a [String],
}

pub fn cmd_list(args: ListArgs) -> Result<()> {
  let store = RecipeStore::load(&args.recipe_dir)?;

  if args.format.is_json() {
    let entries: Vec<ListEntry> = store
      .recipes()
      .map(|r| ListEntry {
        name: r.name(),
        version: r.version(),
        kind: r.kind().as_str(),
        run: &r.requirements.run,
        host: &r.requirements.host,
      })
      .collect();
    return output::print_json(&entries);
  }

  for recipe in store.recipes() {
    println!(
      "{} {} {}",
      recipe.name(),
      recipe.version(),
      format!("({})", recipe.kind().as_str())
        .if_supports_color(Stream::Stdout, |s| s.dimmed())
    );
  }
  Ok(())
}
