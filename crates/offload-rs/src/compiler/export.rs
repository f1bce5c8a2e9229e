use std::fmt::Write as _;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;

use crate::compiler::executable::ExternalLibrary;
use crate::compiler::CompileError;
use crate::runtime::native::NativeModule;

/// Options for building the native shim out of module sources.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExportOptions {
    /// Extra `-I` directories. The runtime ABI header directory is always added.
    pub include_dirs: Vec<PathBuf>,
    pub opt_flag: String,
    /// Compiler override; falls back to `$CC`, then `cc`.
    pub compiler: Option<String>,
}

impl Default for ExportOptions {
    fn default() -> Self {
        Self {
            include_dirs: Vec::new(),
            opt_flag: "-O2".to_string(),
            compiler: None,
        }
    }
}

impl ExportOptions {
    pub fn with_include_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.include_dirs.push(dir.into());
        self
    }
}

/// Directory holding `offload/runtime.h`, the C tensor ABI shared by every shim.
pub fn runtime_include_dir() -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("include")
}

pub fn lib_ext() -> &'static str {
    if cfg!(target_os = "macos") {
        ".dylib"
    } else if cfg!(target_os = "windows") {
        ".dll"
    } else {
        ".so"
    }
}

fn translation_unit(library: &ExternalLibrary) -> Result<String, CompileError> {
    let mut unit = String::from("/* generated native shim */\n#include <offload/runtime.h>\n\n");
    for module in &library.modules {
        if module.source.trim().is_empty() {
            return Err(CompileError::Native(format!(
                "module '{}' from backend '{}' has no C source",
                module.symbol, module.compiler
            )));
        }
        let _ = writeln!(unit, "/* module {} ({}) */", module.symbol, module.compiler);
        unit.push_str(&module.source);
        unit.push('\n');
    }
    Ok(unit)
}

/// Writes every module's C source into one translation unit next to `path` and builds
/// the shared object at `path`.
pub fn export_library(
    library: &ExternalLibrary,
    path: &Path,
    options: &ExportOptions,
) -> Result<PathBuf, CompileError> {
    let source = translation_unit(library)?;
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let src_path = path.with_extension("c");
    fs::write(&src_path, source)?;

    let compiler = options
        .compiler
        .clone()
        .or_else(|| std::env::var("CC").ok())
        .unwrap_or_else(|| "cc".to_string());
    let mut cmd = Command::new(&compiler);
    if cfg!(target_os = "macos") {
        cmd.arg("-dynamiclib");
    } else {
        cmd.arg("-shared").arg("-fPIC");
    }
    cmd.arg(&options.opt_flag);
    cmd.arg("-I").arg(runtime_include_dir());
    for dir in &options.include_dirs {
        cmd.arg("-I").arg(dir);
    }
    cmd.arg("-o").arg(path).arg(&src_path);

    tracing::info!(compiler = %compiler, output = %path.display(), "building native shim");
    let output = cmd
        .output()
        .map_err(|err| CompileError::Native(format!("failed to spawn {compiler}: {err}")))?;
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(CompileError::Native(format!("C compiler failed: {stderr}")));
    }
    Ok(path.to_path_buf())
}

/// Opens a shim produced by [`export_library`].
pub fn load_module(path: &Path) -> Result<NativeModule, CompileError> {
    NativeModule::open(path).map_err(|err| CompileError::Native(err.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::accelerator::{AcceleratorOptions, ExternalModule};

    #[test]
    fn modules_without_source_cannot_be_exported() {
        let library = ExternalLibrary {
            modules: vec![ExternalModule {
                symbol: "sim_0".to_string(),
                compiler: "sim".to_string(),
                graph_json: "{}".to_string(),
                source: String::new(),
                inputs: Vec::new(),
                outputs: Vec::new(),
                options: AcceleratorOptions::default(),
            }],
        };
        let dir = tempfile::tempdir().expect("tempdir");
        let err = export_library(&library, &dir.path().join("shim.so"), &ExportOptions::default())
            .expect_err("no source");
        assert!(matches!(err, CompileError::Native(_)));
    }

    #[test]
    fn runtime_header_ships_with_the_crate() {
        assert!(runtime_include_dir().join("offload").join("runtime.h").exists());
    }
}
