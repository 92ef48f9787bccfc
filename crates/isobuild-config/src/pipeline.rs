//! Pipeline configuration parsing.

use crate::variables::{ToolchainContext, VariableContext};
use crate::{ConfigError, ConfigResult};
use isobuild_core::environment::{
    BuildEnvironment, BuildFlags, CryptoLinkage, PackageManager, Toolchain,
};
use isobuild_core::pipeline::{
    BuilderStageSpec, PipelineDefinition, RuntimeStageSpec, SourceSpec,
};
use kdl::{KdlDocument, KdlNode};
use std::collections::BTreeMap;
use std::path::Path;
use tracing::debug;

/// Read and parse a pipeline file. Relative source paths resolve against the
/// file's directory.
pub fn parse_pipeline_file(path: &Path, vars: &VariableContext) -> ConfigResult<PipelineDefinition> {
    let content = std::fs::read_to_string(path)?;
    let base_dir = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or(Path::new("."));
    parse_pipeline(&content, base_dir, vars)
}

/// Parse a pipeline definition from KDL text.
pub fn parse_pipeline(
    kdl: &str,
    base_dir: &Path,
    vars: &VariableContext,
) -> ConfigResult<PipelineDefinition> {
    let doc: KdlDocument = kdl.parse()?;

    let mut name = String::new();
    let mut builder_node = None;
    let mut runtime_node = None;

    for node in doc.nodes() {
        match node.name().value() {
            "pipeline" => {
                name = get_first_string_arg(node)
                    .ok_or_else(|| ConfigError::MissingField("pipeline name".to_string()))?;
            }
            "builder" => {
                if builder_node.replace(node).is_some() {
                    return Err(ConfigError::Duplicate("builder".to_string()));
                }
            }
            "runtime" => {
                if runtime_node.replace(node).is_some() {
                    return Err(ConfigError::Duplicate("runtime".to_string()));
                }
            }
            other => debug!(node = %other, "Ignoring unknown node"),
        }
    }

    if name.is_empty() {
        return Err(ConfigError::MissingField("pipeline name".to_string()));
    }
    let builder_node =
        builder_node.ok_or_else(|| ConfigError::MissingField("builder".to_string()))?;
    let runtime_node =
        runtime_node.ok_or_else(|| ConfigError::MissingField("runtime".to_string()))?;

    let raw_builder = parse_builder(builder_node, base_dir)?;

    let mut vars = vars.clone();
    vars.pipeline_name = name.clone();
    vars.toolchain = ToolchainContext {
        image: raw_builder.environment.toolchain.image.clone(),
        version: raw_builder.environment.toolchain.version.clone(),
    };

    let builder = interpolate_builder(raw_builder, &vars);
    let runtime = parse_runtime(runtime_node, &vars)?;

    let definition = PipelineDefinition {
        name,
        builder,
        runtime,
    };
    definition.validate()?;
    Ok(definition)
}

fn parse_builder(node: &KdlNode, base_dir: &Path) -> ConfigResult<BuilderStageSpec> {
    let children = node
        .children()
        .ok_or_else(|| ConfigError::MissingField("builder body".to_string()))?;

    let mut toolchain = None;
    let mut package_manager = PackageManager::default();
    let mut packages = Vec::new();
    let mut crypto = None;
    let mut static_crypto = true;
    let mut strip = true;
    let mut source = None;
    let mut env = BTreeMap::new();
    let mut commands = Vec::new();
    let mut artifact_path = None;

    for child in children.nodes() {
        match child.name().value() {
            "toolchain" => {
                toolchain = Some(parse_toolchain(child)?);
            }
            "package-manager" => {
                let value = get_first_string_arg(child).unwrap_or_default();
                package_manager = value.parse().map_err(|_| ConfigError::InvalidValue {
                    field: "package-manager".to_string(),
                    message: format!("unknown package manager: {}", value),
                })?;
            }
            "packages" => {
                packages.extend(get_all_string_args(child));
            }
            "crypto" => {
                let (linkage, is_static) = parse_crypto(child)?;
                crypto = Some(linkage);
                static_crypto = is_static;
            }
            "strip" => {
                strip = get_first_bool_arg(child).ok_or_else(|| ConfigError::InvalidValue {
                    field: "strip".to_string(),
                    message: "expected #true or #false".to_string(),
                })?;
            }
            "source" => {
                let dir = get_first_string_arg(child)
                    .ok_or_else(|| ConfigError::MissingField("source path".to_string()))?;
                source = Some(SourceSpec::new(base_dir.join(dir)));
            }
            "env" => {
                env.extend(parse_env_block(child));
            }
            "run" => {
                if let Some(cmd) = get_first_string_arg(child) {
                    commands.push(cmd);
                }
            }
            "artifact" => {
                artifact_path = get_first_string_arg(child);
            }
            other => debug!(node = %other, "Ignoring unknown builder node"),
        }
    }

    let toolchain =
        toolchain.ok_or_else(|| ConfigError::MissingField("builder toolchain".to_string()))?;
    let crypto = crypto.ok_or_else(|| ConfigError::MissingField("builder crypto".to_string()))?;
    let artifact_path =
        artifact_path.ok_or_else(|| ConfigError::MissingField("builder artifact".to_string()))?;

    let mut environment = BuildEnvironment::new(toolchain, crypto)
        .with_package_manager(package_manager)
        .with_packages(packages)
        .with_flags(BuildFlags {
            strip,
            static_crypto,
        });
    environment.extra_env = env;

    Ok(BuilderStageSpec {
        environment,
        source,
        commands,
        artifact_path,
    })
}

/// `toolchain "rust" version="1.75"` or `toolchain "rust:1.75"`.
fn parse_toolchain(node: &KdlNode) -> ConfigResult<Toolchain> {
    let image = get_first_string_arg(node)
        .ok_or_else(|| ConfigError::MissingField("toolchain image".to_string()))?;

    match get_string_prop(node, "version") {
        Some(version) => Ok(Toolchain::new(image, version)),
        None => match image.rsplit_once(':') {
            Some((repo, version)) if !version.contains('/') => Ok(Toolchain::new(repo, version)),
            _ => Err(ConfigError::MissingField(format!(
                "version for toolchain '{}'",
                image
            ))),
        },
    }
}

fn parse_crypto(node: &KdlNode) -> ConfigResult<(CryptoLinkage, bool)> {
    let library = get_first_string_arg(node)
        .ok_or_else(|| ConfigError::MissingField("crypto library".to_string()))?;
    let is_static = get_bool_prop(node, "static").unwrap_or(true);

    let mut linkage = CryptoLinkage::new(library);
    if let Some(dir) = get_string_prop(node, "lib-dir") {
        linkage = linkage.with_lib_dir(dir);
    }
    if let Some(dir) = get_string_prop(node, "include-dir") {
        linkage = linkage.with_include_dir(dir);
    }
    let shared_objects = get_string_list_prop(node, "shared-objects");
    if !shared_objects.is_empty() {
        linkage.shared_objects = shared_objects;
    }

    Ok((linkage, is_static))
}

fn parse_env_block(node: &KdlNode) -> BTreeMap<String, String> {
    let mut env = BTreeMap::new();
    if let Some(children) = node.children() {
        for child in children.nodes() {
            let key = child.name().value().to_string();
            if let Some(val) = get_first_string_arg(child) {
                env.insert(key, val);
            }
        }
    }
    env
}

fn interpolate_builder(mut spec: BuilderStageSpec, vars: &VariableContext) -> BuilderStageSpec {
    spec.commands = vars.interpolate_all(&spec.commands);
    spec.environment.extra_env = spec
        .environment
        .extra_env
        .into_iter()
        .map(|(k, v)| {
            let v = vars.interpolate(&v);
            (k, v)
        })
        .collect();
    spec
}

fn parse_runtime(node: &KdlNode, vars: &VariableContext) -> ConfigResult<RuntimeStageSpec> {
    let children = node
        .children()
        .ok_or_else(|| ConfigError::MissingField("runtime body".to_string()))?;

    let mut base_image = None;
    let mut destination = None;
    let mut entrypoint = None;
    let mut tag = None;

    for child in children.nodes() {
        match child.name().value() {
            "image" => base_image = get_first_string_arg(child),
            "destination" => destination = get_first_string_arg(child),
            "entrypoint" => entrypoint = Some(get_all_string_args(child)),
            "tag" => {
                if let Some(raw) = get_first_string_arg(child) {
                    tag = Some(interpolate_tag(&raw, vars)?);
                }
            }
            other => debug!(node = %other, "Ignoring unknown runtime node"),
        }
    }

    let base_image =
        base_image.ok_or_else(|| ConfigError::MissingField("runtime image".to_string()))?;
    let destination = destination
        .ok_or_else(|| ConfigError::MissingField("runtime destination".to_string()))?;

    let spec = RuntimeStageSpec {
        base_image,
        destination,
        tag,
    };

    // The entry command is derived from the destination; an explicit one may
    // only restate it.
    if let Some(entrypoint) = entrypoint {
        if entrypoint != spec.entry_command() {
            return Err(ConfigError::InvalidValue {
                field: "entrypoint".to_string(),
                message: format!(
                    "must be exactly [\"{}\"] with no arguments, got {:?}",
                    spec.destination, entrypoint
                ),
            });
        }
    }

    Ok(spec)
}

/// Tags must resolve completely; a tag with a hole in it is not a tag.
fn interpolate_tag(raw: &str, vars: &VariableContext) -> ConfigResult<String> {
    vars.interpolate_strict(raw).map_err(|missing| {
        let missing: Vec<String> = missing.iter().map(|name| format!("${{{}}}", name)).collect();
        ConfigError::InvalidValue {
            field: "tag".to_string(),
            message: format!("'{}' needs {} which cannot be resolved here", raw, missing.join(", ")),
        }
    })
}

// Helper functions for extracting values from KDL nodes

fn get_first_string_arg(node: &KdlNode) -> Option<String> {
    node.entries()
        .iter()
        .find(|e| e.name().is_none())
        .and_then(|e| e.value().as_string())
        .map(|s| s.to_string())
}

fn get_first_bool_arg(node: &KdlNode) -> Option<bool> {
    node.entries()
        .iter()
        .find(|e| e.name().is_none())
        .and_then(|e| e.value().as_bool())
}

fn get_all_string_args(node: &KdlNode) -> Vec<String> {
    node.entries()
        .iter()
        .filter(|e| e.name().is_none())
        .filter_map(|e| e.value().as_string())
        .map(|s| s.to_string())
        .collect()
}

fn get_string_prop(node: &KdlNode, name: &str) -> Option<String> {
    node.get(name)
        .and_then(|v| v.as_string())
        .map(|s| s.to_string())
}

fn get_bool_prop(node: &KdlNode, name: &str) -> Option<bool> {
    node.get(name).and_then(|v| v.as_bool())
}

fn get_string_list_prop(node: &KdlNode, name: &str) -> Vec<String> {
    let mut result = Vec::new();

    // Repeated properties: shared-objects="libssl" shared-objects="libcrypto"
    for entry in node.entries() {
        if let Some(entry_name) = entry.name() {
            if entry_name.value() == name {
                if let Some(s) = entry.value().as_string() {
                    result.push(s.to_string());
                }
            }
        }
    }

    if !result.is_empty() {
        return result;
    }

    // Block syntax: { shared-objects "libssl" "libcrypto" }
    if let Some(children) = node.children() {
        for child in children.nodes() {
            if child.name().value() == name {
                return get_all_string_args(child);
            }
        }
    }

    Vec::new()
}
