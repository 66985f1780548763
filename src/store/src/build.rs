//! Build-step execution against the layer store and the build cache.
//!
//! The external build engine turns a build file into an ordered list of
//! [`BuildStep`]s and feeds them through [`execute_step`] one at a time,
//! threading `parent_chain_id` and `cache_state` from each [`StepOutput`]
//! into the next [`StepContext`]. [`execute_steps`] does exactly that.

use std::collections::HashMap;
use std::io::Write;
use std::path::{Path, PathBuf};

use cimage_core::digest::{Digest, HashingWriter};
use cimage_core::error::{CimageError, Result};

use crate::cache::{CacheLayer, CacheState, ChainId, ProbeOutcome, Prober, CACHE_ID_KEY};
use crate::fsutil::copy_recursive;
use crate::layer::LayerStore;
use crate::model::{ImageLayer, LayerId, StepKind};
use crate::tar_split;

/// One instruction from the build file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildStep {
    pub kind: StepKind,
    pub value: String,
}

impl BuildStep {
    pub fn new(kind: StepKind, value: impl Into<String>) -> Self {
        Self {
            kind,
            value: value.into(),
        }
    }
}

/// Everything one step needs.
pub struct StepContext<'a> {
    pub build_context: &'a Path,
    pub build_args: &'a HashMap<String, String>,
    pub cache_state: CacheState,
    pub parent_chain_id: Option<ChainId>,
    pub prober: &'a dyn Prober,
    pub layer_store: &'a LayerStore,
}

/// Result of one step, including the cache state for the next one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StepOutput {
    pub layer_id: Option<LayerId>,
    pub parent_chain_id: Option<ChainId>,
    pub cache_state: CacheState,
}

/// Execute one build step, reusing a cached layer when possible.
pub fn execute_step(ctx: &StepContext<'_>, step: &BuildStep) -> Result<StepOutput> {
    let value = expand_args(&step.value, ctx.build_args);
    // `None` when the COPY sources can't be fingerprinted; such a step never hits.
    let cache_id = match step.kind {
        StepKind::Copy => copy_source_digest(ctx.build_context, &value),
        _ => Some(String::new()),
    };

    let outcome = match &cache_id {
        Some(cache_id) if ctx.cache_state.should_probe() => {
            let cache_layer = CacheLayer::new(step.kind, value.clone(), cache_id.clone());
            ctx.prober.probe(ctx.parent_chain_id.as_ref(), &cache_layer)
        }
        _ if ctx.cache_state == CacheState::Disabled => ProbeOutcome::Disabled,
        _ => ProbeOutcome::Miss,
    };
    let cache_id = cache_id.unwrap_or_default();

    let output = match outcome {
        ProbeOutcome::Hit { layer_id, chain_id } => {
            tracing::info!(kind = %step.kind, value = %value, "Using cache");
            StepOutput {
                layer_id,
                parent_chain_id: Some(chain_id),
                cache_state: CacheState::Enabled,
            }
        }
        ProbeOutcome::Miss => StepOutput {
            layer_id: materialize(ctx, step.kind, &value, &cache_id)?,
            parent_chain_id: None,
            cache_state: CacheState::Busted,
        },
        ProbeOutcome::Disabled => StepOutput {
            layer_id: materialize(ctx, step.kind, &value, &cache_id)?,
            parent_chain_id: None,
            cache_state: CacheState::Disabled,
        },
    };
    Ok(output)
}

/// Per-build inputs that stay fixed across steps.
pub struct BuildSession<'a> {
    pub build_context: &'a Path,
    pub build_args: &'a HashMap<String, String>,
    pub prober: &'a dyn Prober,
    pub layer_store: &'a LayerStore,
    /// `Disabled` to skip the cache for the whole build.
    pub cache_state: CacheState,
}

/// Execute `steps` in order and return the resulting image layers.
pub fn execute_steps(session: &BuildSession<'_>, steps: &[BuildStep]) -> Result<Vec<ImageLayer>> {
    if session.cache_state.should_probe() {
        session.prober.reset()?;
    }

    let mut cache_state = session.cache_state;
    let mut parent_chain_id = None;
    let mut layers = Vec::with_capacity(steps.len());

    for (index, step) in steps.iter().enumerate() {
        let ctx = StepContext {
            build_context: session.build_context,
            build_args: session.build_args,
            cache_state,
            parent_chain_id: parent_chain_id.take(),
            prober: session.prober,
            layer_store: session.layer_store,
        };
        let output = execute_step(&ctx, step).map_err(|e| {
            CimageError::BuildError(format!("step {} ({} {}): {}", index + 1, step.kind, step.value, e))
        })?;

        layers.push(ImageLayer::new(
            step.kind,
            expand_args(&step.value, session.build_args),
            output.layer_id,
        ));
        cache_state = output.cache_state;
        parent_chain_id = output.parent_chain_id;
    }
    Ok(layers)
}

/// Produce the step's file content and register it.
fn materialize(ctx: &StepContext<'_>, kind: StepKind, value: &str, cache_id: &str) -> Result<Option<LayerId>> {
    match kind {
        StepKind::Copy => {
            let stage = stage_dir(ctx.layer_store)?;
            copy_files(ctx.build_context, value, stage.path())?;
            let layer_id = ctx.layer_store.register_from_dir(stage.path())?;
            if let Some(id) = &layer_id {
                if !cache_id.is_empty() {
                    ctx.layer_store.set_metadata(id, CACHE_ID_KEY, cache_id.as_bytes())?;
                }
            }
            Ok(layer_id)
        }
        StepKind::Run => {
            let stage = stage_dir(ctx.layer_store)?;
            run_command(value, stage.path(), ctx.build_args)?;
            ctx.layer_store.register_from_dir(stage.path())
        }
        StepKind::From | StepKind::Base | StepKind::Cmd | StepKind::Env | StepKind::Arg | StepKind::Label => {
            Ok(None)
        }
    }
}

fn stage_dir(layer_store: &LayerStore) -> Result<tempfile::TempDir> {
    let tmp_root = layer_store.backend().tmp_dir();
    std::fs::create_dir_all(&tmp_root).map_err(|e| CimageError::io(&tmp_root, e))?;
    tempfile::Builder::new()
        .prefix("build-")
        .tempdir_in(&tmp_root)
        .map_err(|e| CimageError::io(&tmp_root, e))
}

/// Split a COPY value into its sources and destination.
fn parse_copy(value: &str) -> Result<(Vec<&str>, &str)> {
    let fields: Vec<&str> = value.split_whitespace().collect();
    match fields.split_last() {
        Some((dest, sources)) if !sources.is_empty() => Ok((sources.to_vec(), *dest)),
        _ => Err(CimageError::BuildError(format!(
            "COPY expects 'src... dest', got '{}'",
            value
        ))),
    }
}

/// A COPY source resolved against the build context.
struct CopySource {
    /// Path relative to the build context.
    relative: PathBuf,
    path: PathBuf,
}

fn is_pattern(src: &str) -> bool {
    src.contains(['*', '?', '['])
}

/// Resolve literal sources and wildcard patterns, in the order given.
///
/// The matches of one pattern are sorted; a pattern matching nothing or a
/// missing literal source is an error.
fn resolve_sources(build_context: &Path, sources: &[&str]) -> Result<Vec<CopySource>> {
    let mut resolved = Vec::new();
    for src in sources {
        let src = src.trim_start_matches('/');
        if !is_pattern(src) {
            let path = build_context.join(src);
            if let Err(e) = path.symlink_metadata() {
                return Err(CimageError::BuildError(format!(
                    "COPY source {} not found: {}",
                    path.display(),
                    e
                )));
            }
            resolved.push(CopySource {
                relative: PathBuf::from(src),
                path,
            });
            continue;
        }

        let base = glob::Pattern::escape(&build_context.to_string_lossy());
        let pattern = Path::new(&base).join(src);
        let entries = glob::glob(&pattern.to_string_lossy()).map_err(|e| {
            CimageError::BuildError(format!("invalid COPY pattern '{}': {}", src, e))
        })?;

        let mut matches = Vec::new();
        for entry in entries {
            match entry {
                Ok(path) => matches.push(path),
                Err(e) => tracing::warn!(pattern = src, error = %e, "Glob error"),
            }
        }
        if matches.is_empty() {
            return Err(CimageError::BuildError(format!(
                "COPY source '{}' matched no files in {}",
                src,
                build_context.display()
            )));
        }
        matches.sort();
        for path in matches {
            let relative = path
                .strip_prefix(build_context)
                .map(Path::to_path_buf)
                .unwrap_or_else(|_| path.clone());
            resolved.push(CopySource { relative, path });
        }
    }
    Ok(resolved)
}

fn copy_files(build_context: &Path, value: &str, stage: &Path) -> Result<()> {
    let (sources, dest) = parse_copy(value)?;
    let dest = dest.trim_start_matches('/');

    for source in resolve_sources(build_context, &sources)? {
        let meta = source.path.metadata().map_err(|e| CimageError::io(&source.path, e))?;
        let name = source.relative.file_name().ok_or_else(|| {
            CimageError::BuildError(format!(
                "COPY source '{}' has no file name",
                source.relative.display()
            ))
        })?;
        let target: PathBuf = if !meta.is_dir() {
            stage.join(dest).join(name)
        } else if dest.is_empty() || dest == "." {
            stage.join(name)
        } else {
            stage.join(dest)
        };
        copy_recursive(&source.path, &target)?;
    }
    Ok(())
}

/// Content digest of the COPY sources, used as the step's cache id.
///
/// `None` when the sources can't be resolved or read.
fn copy_source_digest(build_context: &Path, value: &str) -> Option<String> {
    let digest = parse_copy(value)
        .and_then(|(sources, _)| resolve_sources(build_context, &sources))
        .and_then(|sources| sources_digest(&sources));
    match digest {
        Ok(digest) => Some(digest.to_string()),
        Err(e) => {
            tracing::warn!(value, error = %e, "Failed to digest COPY sources, skipping cache");
            None
        }
    }
}

/// A single source hashes to its own tar digest; several sources hash the
/// list of `relative-path digest` lines.
fn sources_digest(sources: &[CopySource]) -> Result<Digest> {
    if let [only] = sources {
        return source_digest(&only.path);
    }
    let mut writer = HashingWriter::new(std::io::sink());
    for source in sources {
        let digest = source_digest(&source.path)?;
        writeln!(writer, "{} {}", source.relative.display(), digest)?;
    }
    Ok(writer.digest())
}

fn source_digest(path: &Path) -> Result<Digest> {
    let meta = path.metadata().map_err(|e| CimageError::io(path, e))?;
    let writer = HashingWriter::new(std::io::sink());
    let writer = if meta.is_dir() {
        tar_split::write_dir_tar(path, writer)?
    } else {
        let name = path
            .file_name()
            .ok_or_else(|| CimageError::BuildError(format!("{} has no file name", path.display())))?;
        let mut builder = tar::Builder::new(writer);
        builder.mode(tar::HeaderMode::Deterministic);
        builder
            .append_path_with_name(path, name)
            .map_err(|e| CimageError::io(path, e))?;
        builder.into_inner()?
    };
    let (digest, _, _) = writer.into_parts();
    Ok(digest)
}

fn run_command(command: &str, workdir: &Path, build_args: &HashMap<String, String>) -> Result<()> {
    let output = std::process::Command::new("sh")
        .arg("-c")
        .arg(command)
        .current_dir(workdir)
        .envs(build_args)
        .output()
        .map_err(|e| CimageError::BuildError(format!("Failed to execute RUN command: {}", e)))?;

    let stdout = String::from_utf8_lossy(&output.stdout);
    if !stdout.trim().is_empty() {
        tracing::info!(command, output = %stdout.trim(), "RUN output");
    }
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(CimageError::BuildError(format!(
            "RUN command failed (exit {}): {}",
            output.status.code().unwrap_or(-1),
            stderr.trim()
        )));
    }
    Ok(())
}

/// Expand `${VAR}` and `$VAR` references using build args.
///
/// `$VAR` takes the whole run of `[A-Za-z0-9_]` after the `$` as the name.
/// Unknown names are left as written.
fn expand_args(s: &str, args: &HashMap<String, String>) -> String {
    let mut result = String::with_capacity(s.len());
    let mut rest = s;
    while let Some(pos) = rest.find('$') {
        result.push_str(&rest[..pos]);
        let after = &rest[pos + 1..];

        if let Some(braced) = after.strip_prefix('{') {
            let found = braced
                .find('}')
                .and_then(|end| args.get(&braced[..end]).map(|value| (end, value)));
            match found {
                Some((end, value)) => {
                    result.push_str(value);
                    rest = &braced[end + 1..];
                }
                None => {
                    result.push('$');
                    rest = after;
                }
            }
            continue;
        }

        let len = after
            .find(|c: char| !(c.is_ascii_alphanumeric() || c == '_'))
            .unwrap_or(after.len());
        let name = &after[..len];
        match args.get(name) {
            Some(value) if !name.is_empty() => result.push_str(value),
            _ => {
                result.push('$');
                result.push_str(name);
            }
        }
        rest = &after[len..];
    }
    result.push_str(rest);
    result
}
