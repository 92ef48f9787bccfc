//! CLI command implementations.

pub mod build;
pub mod inspect;

use anyhow::{Context, Result};
use isobuild_config::{GitContext, VariableContext, parse_pipeline_file, render_containerfile};
use isobuild_core::pipeline::PipelineDefinition;
use std::path::Path;

/// Variables for a config at `path`: git from CI env or the repository,
/// the process environment, then `--var` overrides.
pub fn variable_context(path: &Path, vars: &[String]) -> Result<VariableContext> {
    let dir = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or(Path::new("."));

    let mut git = GitContext::from_ci_env();
    if git.sha.is_none() {
        git = git.or(GitContext::from_checkout(dir));
    }
    let mut ctx = VariableContext::new().with_git(git);
    ctx.capture_env();

    for var in vars {
        let (key, value) = var
            .split_once('=')
            .with_context(|| format!("Invalid --var '{}', expected KEY=VALUE", var))?;
        ctx.set(key.trim(), value);
    }
    Ok(ctx)
}

pub fn load(path: &Path, vars: &[String]) -> Result<PipelineDefinition> {
    let ctx = variable_context(path, vars)?;
    parse_pipeline_file(path, &ctx)
        .with_context(|| format!("Failed to load pipeline config: {}", path.display()))
}

pub fn validate(path: &Path, vars: &[String]) -> Result<()> {
    let definition = load(path, vars)?;
    let env = &definition.builder.environment;

    let packages = if env.packages.is_empty() {
        "(none)".to_string()
    } else {
        env.packages.iter().cloned().collect::<Vec<_>>().join(" ")
    };
    let linkage = if env.flags.static_crypto {
        "static"
    } else {
        "dynamic"
    };

    println!("Configuration is valid");
    println!("  pipeline:    {}", definition.name);
    println!("  toolchain:   {}", env.toolchain.image_ref());
    println!("  packages:    {} ({})", packages, env.package_manager);
    println!("  crypto:      {} ({})", env.crypto.library, linkage);
    println!("  strip:       {}", env.flags.strip);
    println!(
        "  artifact:    {} -> {}",
        definition.builder.artifact_path, definition.runtime.destination
    );
    println!("  base image:  {}", definition.runtime.base_image);
    println!("  fingerprint: {}", definition.fingerprint());
    Ok(())
}

pub fn render(path: &Path, vars: &[String]) -> Result<()> {
    let definition = load(path, vars)?;
    print!("{}", render_containerfile(&definition));
    Ok(())
}
