//! Render a pipeline definition as a two-stage containerfile.
//!
//! The output is what `docker build` would need to reproduce the pipeline
//! without isobuild: a `builder` stage carrying the toolchain, packages and
//! compiler environment, and a second stage that copies only the artifact.

use isobuild_core::pipeline::PipelineDefinition;

/// Name of the first stage in rendered containerfiles.
pub const BUILDER_STAGE: &str = "builder";

/// Render `definition`. Identical definitions render identical text.
pub fn render_containerfile(definition: &PipelineDefinition) -> String {
    let builder = &definition.builder;
    let env = builder.environment.compiler_env();
    let mut out = String::new();

    out.push_str(&format!("# {}\n", definition.name));
    out.push_str(&format!(
        "# fingerprint: {}\n\n",
        definition.fingerprint()
    ));

    out.push_str(&format!(
        "FROM {} AS {}\n",
        builder.environment.toolchain.image_ref(),
        BUILDER_STAGE
    ));

    if !env.is_empty() {
        let assignments = env
            .iter()
            .map(|(k, v)| format!("{}={}", k, quote(v)))
            .collect::<Vec<_>>()
            .join(" \\\n    ");
        out.push_str(&format!("ENV {}\n", assignments));
    }

    if let Some(install) = builder.environment.install_script() {
        out.push_str(&format!("RUN {}\n", install));
    }

    if let Some(source) = &builder.source {
        out.push_str(&format!("COPY . {}\n", source.mount_path));
        out.push_str(&format!("WORKDIR {}\n", source.mount_path));
    }

    for command in &builder.commands {
        out.push_str(&format!("RUN {}\n", command));
    }

    let runtime = &definition.runtime;
    out.push('\n');
    out.push_str(&format!("FROM {}\n", runtime.base_image));
    out.push_str(&format!(
        "COPY --from={} {} {}\n",
        BUILDER_STAGE, builder.artifact_path, runtime.destination
    ));
    out.push_str(&format!("CMD {}\n", exec_form(&runtime.entry_command())));
    out
}

fn quote(value: &str) -> String {
    format!("\"{}\"", value.replace('\\', "\\\\").replace('"', "\\\""))
}

fn exec_form(args: &[String]) -> String {
    let quoted = args.iter().map(|a| quote(a)).collect::<Vec<_>>();
    format!("[{}]", quoted.join(", "))
}
