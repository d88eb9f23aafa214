//! In-memory stand-ins for the OS, the network and the capabilities
//!
//! Shared by the unit tests and the integration tests. Nothing here touches
//! the real system apart from a scratch directory for staged artifacts.

use crate::acquire::ArtifactAcquirer;
use crate::capability::{
    Capability, Gap, HostInfo, HostInfoSource, Outcome, ProcessTable, ProvisionContext, StepId,
    StepState,
};
use crate::config::ProvisionConfig;
use crate::error::{ExecError, FetchError, ReleaseError};
use crate::exec::{CommandOutput, CommandRunner, CommandSpec, Completion, CompletionDetector};
use crate::fetcher::{ArtifactFetcher, Downloader, NoProgress, ProgressSink};
use crate::release::{HostArch, ReleaseAsset, ReleaseMetadata, ReleaseSource};
use crate::store::ArtifactStore;
use async_trait::async_trait;
use sha2::{Digest, Sha256};
use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

#[derive(Debug, Clone)]
enum Reply {
    Output(CommandOutput),
    Timeout,
    SpawnError(std::io::ErrorKind),
    Completion(Completion),
}

#[derive(Default)]
struct Script {
    replies: HashMap<String, VecDeque<Reply>>,
    calls: Vec<String>,
}

impl Script {
    /// Longest registered prefix of `line`. The last queued reply repeats.
    fn next(&mut self, line: &str) -> Option<Reply> {
        let key = self
            .replies
            .keys()
            .filter(|prefix| line.starts_with(prefix.as_str()))
            .max_by_key(|prefix| prefix.len())?
            .clone();
        let queue = self.replies.get_mut(&key)?;
        if queue.len() > 1 {
            queue.pop_front()
        } else {
            queue.front().cloned()
        }
    }
}

/// Command runner that answers from a script keyed by command-line prefix
///
/// Keys are matched against the `Display` form of the [`CommandSpec`].
/// Replies queued for the same prefix are returned in order and the last one
/// repeats. Unscripted commands fail to spawn with `NotFound`.
#[derive(Clone, Default)]
pub struct FakeCommandRunner {
    script: Arc<Mutex<Script>>,
}

impl FakeCommandRunner {
    pub fn new() -> Self {
        Self::default()
    }

    fn push(&self, prefix: &str, reply: Reply) {
        if let Ok(mut script) = self.script.lock() {
            script
                .replies
                .entry(prefix.to_string())
                .or_default()
                .push_back(reply);
        }
    }

    pub fn respond(&self, prefix: &str, exit_code: i32, stdout: &str) {
        self.respond_output(
            prefix,
            CommandOutput {
                exit_code: Some(exit_code),
                stdout: stdout.to_string(),
                stderr: String::new(),
            },
        );
    }

    pub fn respond_output(&self, prefix: &str, output: CommandOutput) {
        self.push(prefix, Reply::Output(output));
    }

    pub fn respond_timeout(&self, prefix: &str) {
        self.push(prefix, Reply::Timeout);
    }

    pub fn respond_spawn_error(&self, prefix: &str, kind: std::io::ErrorKind) {
        self.push(prefix, Reply::SpawnError(kind));
    }

    /// Reply for `run_until`
    pub fn respond_completion(&self, prefix: &str, completion: Completion) {
        self.push(prefix, Reply::Completion(completion));
    }

    /// Every command line seen, in order
    pub fn calls(&self) -> Vec<String> {
        self.script
            .lock()
            .map(|s| s.calls.clone())
            .unwrap_or_default()
    }

    pub fn count_calls(&self, prefix: &str) -> usize {
        self.calls().iter().filter(|c| c.starts_with(prefix)).count()
    }

    fn next(&self, spec: &CommandSpec) -> Result<Reply, ExecError> {
        let line = spec.to_string();
        let reply = match self.script.lock() {
            Ok(mut script) => {
                script.calls.push(line.clone());
                script.next(&line)
            }
            Err(_) => None,
        };
        match reply {
            Some(Reply::Timeout) => Err(ExecError::Timeout {
                program: spec.program.clone(),
                after: spec.timeout,
            }),
            Some(Reply::SpawnError(kind)) => Err(ExecError::Spawn {
                program: spec.program.clone(),
                source: std::io::Error::new(kind, "scripted spawn failure"),
            }),
            Some(reply) => Ok(reply),
            None => Err(ExecError::Spawn {
                program: spec.program.clone(),
                source: std::io::Error::new(
                    std::io::ErrorKind::NotFound,
                    format!("no scripted reply for `{}`", line),
                ),
            }),
        }
    }
}

#[async_trait]
impl CommandRunner for FakeCommandRunner {
    async fn run(&self, spec: &CommandSpec) -> Result<CommandOutput, ExecError> {
        match self.next(spec)? {
            Reply::Output(output) => Ok(output),
            Reply::Completion(Completion::Exited {
                exit_code,
                transcript,
            }) => Ok(CommandOutput {
                exit_code,
                stdout: transcript.join("\n"),
                stderr: String::new(),
            }),
            _ => Ok(CommandOutput::default()),
        }
    }

    async fn run_until(
        &self,
        spec: &CommandSpec,
        detector: &dyn CompletionDetector,
    ) -> Result<Completion, ExecError> {
        match self.next(spec)? {
            Reply::Completion(completion) => Ok(completion),
            Reply::Output(output) => {
                let mut transcript = Vec::new();
                for line in output.stdout.lines() {
                    transcript.push(line.to_string());
                    if detector.is_complete(line) {
                        return Ok(Completion::Signalled { transcript });
                    }
                }
                Ok(Completion::Exited {
                    exit_code: output.exit_code,
                    transcript,
                })
            }
            _ => Ok(Completion::Exited {
                exit_code: None,
                transcript: Vec::new(),
            }),
        }
    }
}

/// Release source returning a fixed answer
pub struct FakeReleaseSource {
    answer: Result<ReleaseMetadata, ReleaseError>,
    calls: AtomicUsize,
}

impl FakeReleaseSource {
    pub fn with_release(release: ReleaseMetadata) -> Self {
        Self {
            answer: Ok(release),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn unreachable() -> Self {
        Self {
            answer: Err(ReleaseError::Http("connection refused".to_string())),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ReleaseSource for FakeReleaseSource {
    async fn latest(&self) -> Result<ReleaseMetadata, ReleaseError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.answer.clone()
    }

    fn describe(&self) -> String {
        "fake release index".to_string()
    }
}

/// A release with one asset whose published digest matches `payload`
pub fn release_for(tag: &str, file_name: &str, payload: &[u8]) -> ReleaseMetadata {
    let asset = ReleaseAsset::new(
        file_name,
        format!("https://releases.invalid/{}/{}", tag, file_name),
    )
    .with_digest(hex::encode(Sha256::digest(payload)));
    ReleaseMetadata {
        tag_version: tag.to_string(),
        assets: vec![asset],
        raw_body: String::new(),
    }
}

/// Downloader serving bytes from memory
pub struct FakeDownloader {
    body: Result<Vec<u8>, String>,
    routes: Mutex<HashMap<String, Vec<u8>>>,
    delay: Option<Duration>,
    calls: AtomicUsize,
}

impl FakeDownloader {
    /// Serve `body` for every URL without a route
    pub fn serving(body: Vec<u8>) -> Self {
        Self {
            body: Ok(body),
            routes: Mutex::new(HashMap::new()),
            delay: None,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn failing(message: &str) -> Self {
        Self {
            body: Err(message.to_string()),
            ..Self::serving(Vec::new())
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn route(&self, url: &str, body: &[u8]) {
        if let Ok(mut routes) = self.routes.lock() {
            routes.insert(url.to_string(), body.to_vec());
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Downloader for FakeDownloader {
    async fn download(
        &self,
        url: &str,
        dest: &Path,
        progress: &dyn ProgressSink,
    ) -> Result<u64, FetchError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }

        let routed = self
            .routes
            .lock()
            .ok()
            .and_then(|routes| routes.get(url).cloned());
        let body = match routed {
            Some(body) => body,
            None => self.body.clone().map_err(FetchError::Download)?,
        };

        tokio::fs::write(dest, &body)
            .await
            .map_err(|source| FetchError::Staging {
                path: dest.to_path_buf(),
                source,
            })?;
        progress.on_progress(body.len() as u64, Some(body.len() as u64));
        Ok(body.len() as u64)
    }
}

pub struct FakeProcessTable {
    answer: Result<usize, String>,
}

impl FakeProcessTable {
    pub fn with_count(count: usize) -> Self {
        Self { answer: Ok(count) }
    }

    pub fn failing(message: &str) -> Self {
        Self {
            answer: Err(message.to_string()),
        }
    }
}

impl ProcessTable for FakeProcessTable {
    fn count_by_name(&self, _name: &str) -> Result<usize, String> {
        self.answer.clone()
    }
}

pub struct FakeHostInfo {
    answer: Result<HostInfo, String>,
}

impl FakeHostInfo {
    pub fn new(info: HostInfo) -> Self {
        Self { answer: Ok(info) }
    }

    pub fn failing(message: &str) -> Self {
        Self {
            answer: Err(message.to_string()),
        }
    }
}

#[async_trait]
impl HostInfoSource for FakeHostInfo {
    async fn query(&self) -> Result<HostInfo, String> {
        self.answer.clone()
    }
}

/// Capability backed by an in-memory "world" flag
///
/// Probes return scripted states first, then `Satisfied` or the configured
/// gap depending on the flag. A successful remediation sets the flag, so a
/// second run sees the step satisfied.
pub struct FakeCapability {
    id: StepId,
    blocks_on_unknown: bool,
    script: Mutex<VecDeque<StepState>>,
    fixed: AtomicBool,
    gap: Gap,
    outcome: Outcome,
    probes: AtomicUsize,
    remediations: AtomicUsize,
}

impl FakeCapability {
    pub fn satisfied(id: StepId) -> Self {
        let fake = Self::missing(
            id,
            Gap::FeaturesMissing {
                features: Vec::new(),
            },
        );
        fake.fixed.store(true, Ordering::SeqCst);
        fake
    }

    pub fn missing(id: StepId, gap: Gap) -> Self {
        Self {
            id,
            blocks_on_unknown: true,
            script: Mutex::new(VecDeque::new()),
            fixed: AtomicBool::new(false),
            gap,
            outcome: Outcome::ok("fixed"),
            probes: AtomicUsize::new(0),
            remediations: AtomicUsize::new(0),
        }
    }

    pub fn with_outcome(mut self, outcome: Outcome) -> Self {
        self.outcome = outcome;
        self
    }

    /// States returned by the next probes, before the world flag applies
    pub fn scripted(self, states: Vec<StepState>) -> Self {
        if let Ok(mut script) = self.script.lock() {
            script.extend(states);
        }
        self
    }

    pub fn non_blocking(mut self) -> Self {
        self.blocks_on_unknown = false;
        self
    }

    pub fn probes(&self) -> usize {
        self.probes.load(Ordering::SeqCst)
    }

    pub fn remediations(&self) -> usize {
        self.remediations.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Capability for FakeCapability {
    fn id(&self) -> StepId {
        self.id
    }

    fn unknown_blocks(&self) -> bool {
        self.blocks_on_unknown
    }

    async fn probe(&self) -> StepState {
        self.probes.fetch_add(1, Ordering::SeqCst);
        if let Some(state) = self.script.lock().ok().and_then(|mut s| s.pop_front()) {
            return state;
        }
        if self.fixed.load(Ordering::SeqCst) {
            StepState::Satisfied
        } else {
            StepState::Unsatisfied(self.gap.clone())
        }
    }

    async fn remediate(&self, _gap: &Gap) -> Outcome {
        self.remediations.fetch_add(1, Ordering::SeqCst);
        if self.outcome.success {
            self.fixed.store(true, Ordering::SeqCst);
        }
        self.outcome.clone()
    }
}

/// Fakes wired into a [`ProvisionContext`] over a scratch directory
///
/// The directory is removed on drop.
pub struct TestContext {
    root: PathBuf,
    pub config: ProvisionConfig,
    pub runner: FakeCommandRunner,
    pub downloader: Arc<FakeDownloader>,
    pub subsystem_releases: Arc<FakeReleaseSource>,
    pub image_releases: Arc<FakeReleaseSource>,
    pub arch: HostArch,
}

impl TestContext {
    pub fn new(runner: FakeCommandRunner) -> Self {
        let root = std::env::temp_dir().join(format!("hostprep-test-{}", uuid::Uuid::new_v4()));
        let mut config = ProvisionConfig::default();
        config.staging_dir = root.join("artifacts");
        config.image.install_dir = root.join("distro");
        Self {
            root,
            config,
            runner,
            downloader: Arc::new(FakeDownloader::serving(b"unrouted".to_vec())),
            subsystem_releases: Arc::new(FakeReleaseSource::unreachable()),
            image_releases: Arc::new(FakeReleaseSource::unreachable()),
            arch: HostArch::X64,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Publish a verified subsystem installer
    pub fn with_subsystem_release(self, tag: &str, file_name: &str, payload: &[u8]) -> Self {
        let release = release_for(tag, file_name, payload);
        self.downloader.route(&release.assets[0].download_url, payload);
        self.with_subsystem_source(FakeReleaseSource::with_release(release))
    }

    /// Publish a verified runtime image
    pub fn with_image_release(self, tag: &str, file_name: &str, payload: &[u8]) -> Self {
        let release = release_for(tag, file_name, payload);
        self.downloader.route(&release.assets[0].download_url, payload);
        self.with_image_source(FakeReleaseSource::with_release(release))
    }

    pub fn with_subsystem_source(mut self, source: FakeReleaseSource) -> Self {
        self.subsystem_releases = Arc::new(source);
        self
    }

    pub fn with_image_source(mut self, source: FakeReleaseSource) -> Self {
        self.image_releases = Arc::new(source);
        self
    }

    pub fn context(&self) -> ProvisionContext {
        let fetcher = ArtifactFetcher::new(
            self.downloader.clone(),
            ArtifactStore::new(&self.config.staging_dir),
        );
        ProvisionContext::new(
            Arc::new(self.config.clone()),
            Arc::new(self.runner.clone()),
            Arc::new(ArtifactAcquirer::new(fetcher)),
            Arc::new(NoProgress),
            self.arch,
        )
        .with_release_sources(self.subsystem_releases.clone(), self.image_releases.clone())
    }
}

impl Drop for TestContext {
    fn drop(&mut self) {
        let _ = std::fs::remove_dir_all(&self.root);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exec::MarkerDetector;

    fn spec(line: &[&str]) -> CommandSpec {
        CommandSpec::new(line[0], line[1..].iter().copied(), Duration::from_secs(1))
    }

    #[tokio::test]
    async fn test_runner_replays_sequence_then_repeats_last() {
        let runner = FakeCommandRunner::new();
        runner.respond("wsl.exe --list", 1, "");
        runner.respond("wsl.exe --list", 0, "hostprep");

        let s = spec(&["wsl.exe", "--list", "--quiet"]);
        assert_eq!(runner.run(&s).await.unwrap().exit_code, Some(1));
        assert_eq!(runner.run(&s).await.unwrap().exit_code, Some(0));
        assert_eq!(runner.run(&s).await.unwrap().stdout, "hostprep");
        assert_eq!(runner.count_calls("wsl.exe --list"), 3);
    }

    #[tokio::test]
    async fn test_runner_prefers_longest_prefix_and_rejects_unscripted() {
        let runner = FakeCommandRunner::new();
        runner.respond("wsl.exe", 0, "short");
        runner.respond("wsl.exe --status", 0, "long");
        let out = runner.run(&spec(&["wsl.exe", "--status"])).await.unwrap();
        assert_eq!(out.stdout, "long");

        let err = runner.run(&spec(&["dism.exe"])).await.unwrap_err();
        assert!(matches!(err, ExecError::Spawn { .. }));
    }

    #[tokio::test]
    async fn test_run_until_scans_scripted_output() {
        let runner = FakeCommandRunner::new();
        runner.respond("boot", 0, "step 1\nall done\nnever read");
        let done = runner
            .run_until(&spec(&["boot"]), &MarkerDetector::new("all done"))
            .await
            .unwrap();
        assert_eq!(
            done,
            Completion::Signalled {
                transcript: vec!["step 1".to_string(), "all done".to_string()]
            }
        );
    }

    #[tokio::test]
    async fn test_fake_capability_remembers_fix() {
        let cap = FakeCapability::missing(
            StepId::OsFeatures,
            Gap::FeaturesMissing {
                features: vec!["VirtualMachinePlatform".to_string()],
            },
        );
        assert!(!cap.probe().await.is_satisfied());
        let _ = cap.remediate(&Gap::FeaturesMissing { features: vec![] }).await;
        assert!(cap.probe().await.is_satisfied());
        assert_eq!((cap.probes(), cap.remediations()), (2, 1));
    }
}
