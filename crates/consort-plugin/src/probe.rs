//! Probing: load a candidate module in isolation and extract its descriptors.
//!
//! In [`ProbeMode::Subprocess`] each probe runs in a child process:
//!
//! ```text
//! probe-server probe <module-path> <shell-id-hex | _> <result-file>
//! ```
//!
//! The child writes a `[plugin]` block (see [`crate::cache`]) or an error
//! report to the result file and exits with 0 (success) or 1 (reported
//! failure). Any other exit status, including death by signal, is a crash.
//! The result file is removed afterwards whatever happened.
//!
//! Hosts that register their own [`AbiAdapter`](crate::loader::AbiAdapter)s
//! build their own probe executable around [`run_probe_child`].

use crate::cache;
use crate::config::{HostConfig, ProbeMode};
use crate::factory::Factory;
use crate::registry::assign_keys;
use crate::arch;
use consort_core::descriptor::{PluginDescriptor, PluginFormat, ShellEntry};
use consort_core::error::{ErrorKind, HostError, Result};
use consort_core::plugin::{Module, ModuleLoader};
use std::future::Future;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::time::Duration;

/// Child exit code for a reported failure.
pub const EXIT_FAILURE: i32 = 1;
/// Child exit code for bad command-line usage.
pub const EXIT_USAGE: i32 = 2;

const NO_SHELL_ID: &str = "_";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeStatus {
    Success,
    Fail,
    Crash,
}

impl std::fmt::Display for ProbeStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProbeStatus::Success => write!(f, "ok"),
            ProbeStatus::Fail => write!(f, "failed"),
            ProbeStatus::Crash => write!(f, "crashed"),
        }
    }
}

/// Outcome of probing one module path.
pub struct ProbeResult {
    pub path: PathBuf,
    pub status: ProbeStatus,
    pub plugins: Vec<Arc<PluginDescriptor>>,
    pub error: Option<HostError>,
    /// Answered from the registry without loading anything.
    pub cached: bool,
    module: Option<Arc<dyn Module>>,
}

impl ProbeResult {
    fn success(path: &Path, plugins: Vec<Arc<PluginDescriptor>>, module: Option<Arc<dyn Module>>) -> Self {
        Self {
            path: path.to_path_buf(),
            status: ProbeStatus::Success,
            plugins,
            error: None,
            cached: false,
            module,
        }
    }

    pub fn failed(path: &Path, error: HostError) -> Self {
        Self {
            path: path.to_path_buf(),
            status: ProbeStatus::Fail,
            plugins: Vec::new(),
            error: Some(error),
            cached: false,
            module: None,
        }
    }

    pub fn crashed(path: &Path, error: HostError) -> Self {
        Self {
            status: ProbeStatus::Crash,
            ..Self::failed(path, error)
        }
    }

    /// Result answered from an already registered factory.
    pub fn cached(factory: &Factory) -> Self {
        Self {
            cached: true,
            ..Self::success(factory.path(), factory.plugins().to_vec(), None)
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == ProbeStatus::Success
    }

    /// Whether the path should go on the denylist.
    ///
    /// Failures of the host itself (spawning the child, missing ABI support)
    /// say nothing about the module and are retried next time.
    pub fn should_denylist(&self) -> bool {
        match self.status {
            ProbeStatus::Success => false,
            ProbeStatus::Crash => true,
            ProbeStatus::Fail => self
                .error
                .as_ref()
                .map(|e| e.kind() != ErrorKind::System)
                .unwrap_or(true),
        }
    }

    /// Build the registry factory for a successful probe.
    pub fn to_factory(&self) -> Option<Factory> {
        self.is_success()
            .then(|| Factory::new(&self.path, self.plugins.clone(), self.module.clone()))
    }
}

impl std::fmt::Debug for ProbeResult {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProbeResult")
            .field("path", &self.path)
            .field("status", &self.status)
            .field("plugins", &self.plugins.iter().map(|p| &p.name).collect::<Vec<_>>())
            .field("error", &self.error)
            .field("cached", &self.cached)
            .finish()
    }
}

/// Exit status classification of a probe child.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChildExit {
    Success,
    Failure,
    Crash,
}

pub fn classify_exit(code: Option<i32>) -> ChildExit {
    match code {
        Some(0) => ChildExit::Success,
        Some(EXIT_FAILURE) => ChildExit::Failure,
        _ => ChildExit::Crash,
    }
}

fn describe_status(status: &ExitStatus) -> String {
    if let Some(code) = status.code() {
        return format!("exit code {}", code);
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return format!("signal {}", signal);
        }
    }
    "terminated abnormally".to_string()
}

/// Error report written by the child: kind on the first line, message after.
pub fn child_error_text(err: &HostError) -> String {
    format!("{}\n{}", err.kind().as_str(), err)
}

pub fn parse_child_error(text: &str) -> HostError {
    match text.split_once('\n') {
        Some((kind, message)) if !message.trim().is_empty() => HostError::Reported {
            kind: ErrorKind::parse(kind),
            message: message.trim_end().to_string(),
        },
        _ => HostError::Reported {
            kind: ErrorKind::Unknown,
            message: "probe process reported a failure without detail".into(),
        },
    }
}

/// Load `path` and introspect it. Used by the probe child and in-process probing.
pub fn probe_module(loader: &dyn ModuleLoader, path: &Path, shell_id: Option<u32>) -> Result<PluginDescriptor> {
    let module = loader.load(path)?;
    module.probe(shell_id)
}

/// Entry point of a probe child. `args` excludes the program name and the
/// `probe` subcommand. Returns the process exit code.
pub fn run_probe_child(loader: &dyn ModuleLoader, args: &[String]) -> i32 {
    let [path, shell, out] = args else {
        tracing::error!("usage: probe <module-path> <shell-id|_> <result-file>");
        return EXIT_USAGE;
    };
    let shell_id = if shell == NO_SHELL_ID {
        None
    } else {
        match u32::from_str_radix(shell, 16) {
            Ok(id) => Some(id),
            Err(_) => {
                tracing::error!("bad shell id '{}'", shell);
                return EXIT_USAGE;
            }
        }
    };

    let path = Path::new(path);
    let (code, text) = match probe_module(loader, path, shell_id) {
        Ok(mut desc) => {
            desc.path = path.to_path_buf();
            (0, cache::descriptor_to_text(&desc))
        }
        Err(err) => {
            tracing::debug!("probe of {} failed: {}", path.display(), err);
            (EXIT_FAILURE, child_error_text(&err))
        }
    };
    match std::fs::write(out, text) {
        Ok(()) => code,
        Err(e) => {
            tracing::error!("cannot write probe result to {}: {}", out, e);
            // no result file: let the parent treat it as a crash
            3
        }
    }
}

/// Give each probed descriptor its module path, format and lookup keys.
fn finish_descriptors(path: &Path, mut plugins: Vec<PluginDescriptor>) -> Vec<Arc<PluginDescriptor>> {
    let format = PluginFormat::from_path(path);
    for desc in plugins.iter_mut() {
        desc.path = path.to_path_buf();
        if desc.format.is_none() {
            desc.format = format;
        }
    }
    assign_keys(&mut plugins);
    plugins.into_iter().map(Arc::new).collect()
}

fn shell_sub_descriptor(mut desc: PluginDescriptor, entry: &ShellEntry) -> PluginDescriptor {
    if desc.name.is_empty() {
        desc.name = entry.name.clone();
    }
    desc.shell.clear();
    desc
}

fn panic_reason(panic: &(dyn std::any::Any + Send)) -> String {
    panic
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| panic.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string())
}

/// Probe in this process. A panic inside the module counts as a crash.
pub fn probe_in_process(loader: &dyn ModuleLoader, path: &Path) -> ProbeResult {
    let outcome = catch_unwind(AssertUnwindSafe(|| -> Result<_> {
        let module = loader.load(path)?;
        let root = module.probe(None)?;
        if !root.is_shell() {
            return Ok((module, vec![root]));
        }
        let mut plugins = Vec::with_capacity(root.shell.len());
        for entry in &root.shell {
            match module.probe(Some(entry.id)) {
                Ok(desc) => plugins.push(shell_sub_descriptor(desc, entry)),
                Err(e) => tracing::warn!(
                    "Shell plugin '{}' ({:08X}) in {} failed: {}",
                    entry.name,
                    entry.id,
                    path.display(),
                    e
                ),
            }
        }
        Ok((module, plugins))
    }));

    match outcome {
        Ok(Ok((_, plugins))) if plugins.is_empty() => {
            ProbeResult::failed(path, HostError::NoPlugins(path.to_path_buf()))
        }
        Ok(Ok((module, plugins))) => {
            ProbeResult::success(path, finish_descriptors(path, plugins), Some(module))
        }
        Ok(Err(err)) => ProbeResult::failed(path, err),
        Err(panic) => ProbeResult::crashed(
            path,
            HostError::Crashed {
                path: path.to_path_buf(),
                status: format!("panic: {}", panic_reason(&*panic)),
            },
        ),
    }
}

/// Build a single-threaded runtime and drive `future` to completion.
pub(crate) fn block_on<F: Future>(future: F) -> Result<F::Output> {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .map_err(|e| HostError::Subprocess(format!("failed to start probe runtime: {}", e)))?;
    Ok(runtime.block_on(future))
}

/// Probes module paths according to a [`ProbeMode`].
pub struct Prober {
    loader: Arc<dyn ModuleLoader>,
    mode: ProbeMode,
    timeout: Duration,
    width: usize,
    check_architecture: bool,
}

impl Prober {
    pub fn new(loader: Arc<dyn ModuleLoader>, mode: ProbeMode) -> Self {
        Self {
            loader,
            mode,
            timeout: Duration::from_secs(30),
            width: 8,
            check_architecture: true,
        }
    }

    pub fn from_config(loader: Arc<dyn ModuleLoader>, config: &HostConfig) -> Self {
        Self::new(loader, config.probe_mode.clone())
            .timeout(config.probe_timeout)
            .parallel_width(config.parallel_probes)
            .check_architecture(config.check_architecture)
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn parallel_width(mut self, width: usize) -> Self {
        self.width = width.max(1);
        self
    }

    pub fn check_architecture(mut self, check: bool) -> Self {
        self.check_architecture = check;
        self
    }

    pub fn mode(&self) -> &ProbeMode {
        &self.mode
    }

    pub fn width(&self) -> usize {
        self.width
    }

    pub fn loader(&self) -> &Arc<dyn ModuleLoader> {
        &self.loader
    }

    /// Probe one path, blocking the caller.
    pub fn probe_blocking(&self, path: &Path) -> ProbeResult {
        match &self.mode {
            ProbeMode::InProcess => self.probe_local(path),
            ProbeMode::Subprocess { .. } => {
                block_on(self.probe(path)).unwrap_or_else(|e| ProbeResult::failed(path, e))
            }
        }
    }

    /// Probe one path.
    pub async fn probe(&self, path: &Path) -> ProbeResult {
        if self.check_architecture {
            if let Err(err) = arch::check_architecture(path) {
                return ProbeResult::failed(path, err);
            }
        }
        match &self.mode {
            ProbeMode::InProcess => {
                let loader = Arc::clone(&self.loader);
                let owned = path.to_path_buf();
                tokio::task::spawn_blocking(move || probe_in_process(&*loader, &owned))
                    .await
                    .unwrap_or_else(|e| {
                        ProbeResult::crashed(
                            path,
                            HostError::Crashed {
                                path: path.to_path_buf(),
                                status: e.to_string(),
                            },
                        )
                    })
            }
            ProbeMode::Subprocess { executable } => {
                probe_subprocess(executable, path, self.timeout, self.width).await
            }
        }
    }

    fn probe_local(&self, path: &Path) -> ProbeResult {
        if self.check_architecture {
            if let Err(err) = arch::check_architecture(path) {
                return ProbeResult::failed(path, err);
            }
        }
        probe_in_process(&*self.loader, path)
    }

    /// Probe many paths with at most `width` probes in flight.
    ///
    /// Paths are taken in batches; `on_result` sees every result of a batch
    /// in submission order before the next batch starts.
    pub async fn probe_parallel(
        self: &Arc<Self>,
        paths: Vec<PathBuf>,
        mut on_result: impl FnMut(&ProbeResult),
    ) -> Vec<ProbeResult> {
        let mut results = Vec::with_capacity(paths.len());
        for batch in paths.chunks(self.width) {
            let handles: Vec<_> = batch
                .iter()
                .map(|path| {
                    let prober = Arc::clone(self);
                    let path = path.clone();
                    tokio::spawn(async move { prober.probe(&path).await })
                })
                .collect();
            for (handle, path) in handles.into_iter().zip(batch) {
                let result = handle.await.unwrap_or_else(|e| {
                    ProbeResult::crashed(
                        path,
                        HostError::Crashed {
                            path: path.clone(),
                            status: e.to_string(),
                        },
                    )
                });
                on_result(&result);
                results.push(result);
            }
        }
        results
    }
}

impl std::fmt::Debug for Prober {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Prober")
            .field("mode", &self.mode)
            .field("timeout", &self.timeout)
            .field("width", &self.width)
            .finish()
    }
}

type ChildFailure = (ProbeStatus, HostError);

async fn probe_subprocess(executable: &Path, path: &Path, timeout: Duration, width: usize) -> ProbeResult {
    let root = match run_child(executable, path, None, timeout).await {
        Ok(desc) => desc,
        Err((ProbeStatus::Crash, err)) => return ProbeResult::crashed(path, err),
        Err((_, err)) => return ProbeResult::failed(path, err),
    };
    if !root.is_shell() {
        return ProbeResult::success(path, finish_descriptors(path, vec![root]), None);
    }

    tracing::debug!("{} is a shell with {} plugins", path.display(), root.shell.len());
    let mut plugins = Vec::with_capacity(root.shell.len());
    for batch in root.shell.chunks(width.max(1)) {
        let handles: Vec<_> = batch
            .iter()
            .map(|entry| {
                let executable = executable.to_path_buf();
                let path = path.to_path_buf();
                let id = entry.id;
                tokio::spawn(async move { run_child(&executable, &path, Some(id), timeout).await })
            })
            .collect();
        for (handle, entry) in handles.into_iter().zip(batch) {
            match handle.await {
                Ok(Ok(desc)) => plugins.push(shell_sub_descriptor(desc, entry)),
                Ok(Err((status, err))) => tracing::warn!(
                    "Shell plugin '{}' ({:08X}) in {} {}: {}",
                    entry.name,
                    entry.id,
                    path.display(),
                    status,
                    err
                ),
                Err(e) => tracing::warn!("Shell probe task failed: {}", e),
            }
        }
    }
    if plugins.is_empty() {
        return ProbeResult::failed(path, HostError::NoPlugins(path.to_path_buf()));
    }
    ProbeResult::success(path, finish_descriptors(path, plugins), None)
}

async fn run_child(
    executable: &Path,
    path: &Path,
    shell_id: Option<u32>,
    timeout: Duration,
) -> std::result::Result<PluginDescriptor, ChildFailure> {
    let fail = |err: HostError| (ProbeStatus::Fail, err);

    // removed on drop, on every path out of this function
    let result_file = tempfile::Builder::new()
        .prefix("consort-probe-")
        .suffix(".txt")
        .tempfile()
        .map_err(|e| fail(HostError::Io(e)))?
        .into_temp_path();

    let shell_arg = shell_id
        .map(|id| format!("{:X}", id))
        .unwrap_or_else(|| NO_SHELL_ID.to_string());

    let mut child = tokio::process::Command::new(executable)
        .arg("probe")
        .arg(path)
        .arg(&shell_arg)
        .arg(&*result_file)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| {
            fail(HostError::Subprocess(format!(
                "failed to spawn {}: {}",
                executable.display(),
                e
            )))
        })?;

    let status = match tokio::time::timeout(timeout, child.wait()).await {
        Ok(Ok(status)) => status,
        Ok(Err(e)) => {
            return Err(fail(HostError::Subprocess(format!(
                "waiting for probe process failed: {}",
                e
            ))))
        }
        Err(_) => {
            let _ = child.kill().await;
            // a module that hangs while loading is as unusable as one that crashes
            return Err((
                ProbeStatus::Crash,
                HostError::Timeout {
                    operation: format!("probing {}", path.display()),
                    duration_ms: timeout.as_millis() as u64,
                },
            ));
        }
    };

    let text = tokio::fs::read_to_string(&*result_file).await.unwrap_or_default();
    match classify_exit(status.code()) {
        ChildExit::Success => cache::descriptor_from_text(&text).map_err(fail),
        ChildExit::Failure => Err(fail(parse_child_error(&text))),
        ChildExit::Crash => Err((
            ProbeStatus::Crash,
            HostError::Crashed {
                path: path.to_path_buf(),
                status: describe_status(&status),
            },
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use consort_core::descriptor::ParamInfo;
    use consort_core::plugin::PluginInstance;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct ShellModule {
        path: PathBuf,
    }

    impl Module for ShellModule {
        fn path(&self) -> &Path {
            &self.path
        }

        fn format(&self) -> PluginFormat {
            PluginFormat::Vst2
        }

        fn probe(&self, shell_id: Option<u32>) -> Result<PluginDescriptor> {
            match shell_id {
                None => Ok(PluginDescriptor::new("Shell", &self.path)
                    .shell_entry("Comp", 1)
                    .shell_entry("Broken", 2)
                    .shell_entry("Gate", 3)),
                Some(2) => Err(HostError::Other("sub-plugin refused".into())),
                Some(id) => Ok(PluginDescriptor::new(if id == 1 { "Comp" } else { "Gate" }, "")
                    .param(ParamInfo::new("Threshold", "dB", 0))),
            }
        }

        fn instantiate(&self, _: &PluginDescriptor) -> Result<Box<dyn PluginInstance>> {
            Err(HostError::Other("not in this test".into()))
        }
    }

    #[derive(Default)]
    struct Loader {
        loads: AtomicUsize,
    }

    impl ModuleLoader for Loader {
        fn load(&self, path: &Path) -> Result<Arc<dyn Module>> {
            self.loads.fetch_add(1, Ordering::SeqCst);
            if path.to_string_lossy().contains("panic") {
                panic!("module constructor blew up");
            }
            if path.to_string_lossy().contains("missing") {
                return Err(HostError::load_failed(path, consort_core::LoadStage::Opening, "nope"));
            }
            Ok(Arc::new(ShellModule {
                path: path.to_path_buf(),
            }))
        }
    }

    #[test]
    fn test_in_process_shell_probe() {
        let loader = Loader::default();
        let result = probe_in_process(&loader, Path::new("/vst/shell.so"));
        assert!(result.is_success());
        let names: Vec<_> = result.plugins.iter().map(|p| p.name.as_str()).collect();
        assert_eq!(names, vec!["Comp", "Gate"]);
        // sub-plugins of a shell are not addressable by path
        assert_eq!(result.plugins[0].keys, vec!["Comp".to_string()]);
        assert_eq!(result.plugins[0].path, Path::new("/vst/shell.so"));
    }

    #[test]
    fn test_in_process_failure_and_panic() {
        let loader = Loader::default();
        let failed = probe_in_process(&loader, Path::new("/vst/missing.so"));
        assert_eq!(failed.status, ProbeStatus::Fail);
        assert!(failed.should_denylist());

        let crashed = probe_in_process(&loader, Path::new("/vst/panic.so"));
        assert_eq!(crashed.status, ProbeStatus::Crash);
        assert!(crashed.should_denylist());
    }

    #[test]
    fn test_classify_exit() {
        assert_eq!(classify_exit(Some(0)), ChildExit::Success);
        assert_eq!(classify_exit(Some(1)), ChildExit::Failure);
        assert_eq!(classify_exit(Some(3)), ChildExit::Crash);
        assert_eq!(classify_exit(None), ChildExit::Crash);
    }

    #[test]
    fn test_child_error_round_trip() {
        let err = HostError::MissingEntryPoint {
            path: "/a.so".into(),
            symbol: "VSTPluginMain".into(),
        };
        let parsed = parse_child_error(&child_error_text(&err));
        assert_eq!(parsed.kind(), ErrorKind::Module);
        assert!(parsed.to_string().contains("VSTPluginMain"));

        assert_eq!(parse_child_error("").kind(), ErrorKind::Unknown);
    }

    #[test]
    fn test_system_failures_are_not_denylisted() {
        let result = ProbeResult::failed(
            Path::new("/a.so"),
            HostError::Subprocess("spawn failed".into()),
        );
        assert!(!result.should_denylist());
    }

    #[test]
    fn test_child_writes_result_file() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("result.txt");
        let loader = Loader::default();

        let args = vec!["/vst/shell.so".to_string(), "3".to_string(), out.to_string_lossy().into_owned()];
        assert_eq!(run_probe_child(&loader, &args), 0);
        let desc = cache::descriptor_from_text(&std::fs::read_to_string(&out).unwrap()).unwrap();
        assert_eq!(desc.name, "Gate");
        assert_eq!(desc.path, Path::new("/vst/shell.so"));

        let args = vec!["/vst/missing.so".to_string(), "_".to_string(), out.to_string_lossy().into_owned()];
        assert_eq!(run_probe_child(&loader, &args), EXIT_FAILURE);
        let err = parse_child_error(&std::fs::read_to_string(&out).unwrap());
        assert_eq!(err.kind(), ErrorKind::Module);

        assert_eq!(run_probe_child(&loader, &[]), EXIT_USAGE);
    }

    #[test]
    fn test_parallel_keeps_submission_order() {
        let prober = Arc::new(
            Prober::new(Arc::new(Loader::default()), ProbeMode::InProcess)
                .check_architecture(false)
                .parallel_width(2),
        );
        let paths: Vec<PathBuf> = ["a", "missing", "c", "d", "e"]
            .iter()
            .map(|n| PathBuf::from(format!("/vst/{}.so", n)))
            .collect();

        let mut seen = Vec::new();
        let results = block_on(prober.probe_parallel(paths.clone(), |r| seen.push(r.path.clone()))).unwrap();
        assert_eq!(seen, paths);
        let statuses: Vec<_> = results.iter().map(|r| r.status).collect();
        assert_eq!(
            statuses,
            vec![
                ProbeStatus::Success,
                ProbeStatus::Fail,
                ProbeStatus::Success,
                ProbeStatus::Success,
                ProbeStatus::Success
            ]
        );
    }

    #[cfg(unix)]
    #[test]
    fn test_abnormal_child_exit_is_crash() {
        // `sh probe ...` fails to open a script named "probe": neither 0 nor 1
        let prober = Prober::new(
            Arc::new(Loader::default()),
            ProbeMode::Subprocess {
                executable: PathBuf::from("/bin/sh"),
            },
        )
        .check_architecture(false);
        let result = prober.probe_blocking(Path::new("/vst/a.so"));
        assert_eq!(result.status, ProbeStatus::Crash);
        assert!(matches!(result.error, Some(HostError::Crashed { .. })));
    }
}
