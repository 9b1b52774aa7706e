//! Scripted sandbox for testing.
//!
//! Commands match rules by substring and get canned replies; every
//! command, lease change, write, and kill is recorded in order so tests
//! can assert on sequencing without a real sandbox.

use async_trait::async_trait;
use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use super::{CommandOptions, CommandOutput, Sandbox, SandboxError, SandboxProvider};

/// A canned reply to a command.
#[derive(Debug, Clone)]
pub(crate) enum MockReply {
    /// Exit with the given code and stdout.
    Exit(i64, String),
    /// Fail with a transient transport error.
    Transport,
    /// Fail as if the sandbox were gone.
    Unreachable,
}

impl MockReply {
    /// Exit 0 with the given stdout.
    pub fn ok(stdout: &str) -> Self {
        Self::Exit(0, stdout.to_string())
    }

    /// Exit with `code` and no output.
    pub fn code(code: i64) -> Self {
        Self::Exit(code, String::new())
    }
}

#[derive(Debug)]
struct Rule {
    pattern: String,
    /// Played in order; the last one repeats.
    replies: VecDeque<MockReply>,
}

/// A sandbox whose command results are scripted.
#[derive(Debug)]
pub(crate) struct MockSandbox {
    id: String,
    alive: AtomicBool,
    rules: Mutex<Vec<Rule>>,
    events: Mutex<Vec<String>>,
    files: Mutex<BTreeMap<String, Vec<u8>>>,
    kills: AtomicUsize,
}

impl MockSandbox {
    pub fn new(id: &str) -> Self {
        Self {
            id: id.to_string(),
            alive: AtomicBool::new(true),
            rules: Mutex::new(Vec::new()),
            events: Mutex::new(Vec::new()),
            files: Mutex::new(BTreeMap::new()),
            kills: AtomicUsize::new(0),
        }
    }

    /// Queues `reply` for commands containing `pattern`.
    ///
    /// Rules are checked in the order they were first added.
    pub fn on(&self, pattern: &str, reply: MockReply) {
        let mut rules = self.rules.lock().unwrap();
        if let Some(rule) = rules.iter_mut().find(|r| r.pattern == pattern) {
            rule.replies.push_back(reply);
        } else {
            rules.push(Rule {
                pattern: pattern.to_string(),
                replies: VecDeque::from([reply]),
            });
        }
    }

    /// Everything that happened to this sandbox, in order.
    pub fn events(&self) -> Vec<String> {
        self.events.lock().unwrap().clone()
    }

    /// Commands run so far.
    pub fn commands(&self) -> Vec<String> {
        self.events()
            .into_iter()
            .filter_map(|e| e.strip_prefix("cmd ").map(str::to_string))
            .collect()
    }

    /// Number of commands containing `needle`.
    pub fn count(&self, needle: &str) -> usize {
        self.commands().iter().filter(|c| c.contains(needle)).count()
    }

    /// Index of the first event containing `needle`.
    pub fn position(&self, needle: &str) -> Option<usize> {
        self.events().iter().position(|e| e.contains(needle))
    }

    pub fn kill_count(&self) -> usize {
        self.kills.load(Ordering::SeqCst)
    }

    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    /// Makes every later operation fail as unreachable, as if the
    /// sandbox expired on its own.
    pub fn expire(&self) {
        self.alive.store(false, Ordering::SeqCst);
    }

    pub fn file(&self, path: &str) -> Option<Vec<u8>> {
        self.files.lock().unwrap().get(path).cloned()
    }

    fn record(&self, event: String) {
        self.events.lock().unwrap().push(event);
    }

    fn ensure_alive(&self) -> Result<(), SandboxError> {
        if self.is_alive() {
            Ok(())
        } else {
            Err(SandboxError::unreachable(&self.id, "mock sandbox is dead"))
        }
    }

    fn reply_for(&self, command: &str) -> MockReply {
        let mut rules = self.rules.lock().unwrap();
        let Some(rule) = rules.iter_mut().find(|r| command.contains(&r.pattern)) else {
            return MockReply::ok("");
        };
        if rule.replies.len() > 1 {
            rule.replies.pop_front().unwrap()
        } else {
            rule.replies[0].clone()
        }
    }
}

#[async_trait]
impl Sandbox for MockSandbox {
    fn id(&self) -> &str {
        &self.id
    }

    fn url_for_port(&self, port: u16) -> String {
        format!("http://{}.sandbox.test:{port}", self.id)
    }

    async fn kill(&self) -> Result<(), SandboxError> {
        self.record("kill".to_string());
        self.kills.fetch_add(1, Ordering::SeqCst);
        self.alive.store(false, Ordering::SeqCst);
        Ok(())
    }

    async fn set_timeout(&self, lease: Duration) -> Result<(), SandboxError> {
        self.ensure_alive()?;
        self.record(format!("lease {}s", lease.as_secs()));
        Ok(())
    }

    async fn run_command(
        &self,
        command: &str,
        _options: &CommandOptions,
    ) -> Result<CommandOutput, SandboxError> {
        self.record(format!("cmd {command}"));
        self.ensure_alive()?;
        match self.reply_for(command) {
            MockReply::Exit(exit_code, stdout) => Ok(CommandOutput {
                exit_code,
                stdout,
                stderr: String::new(),
            }),
            MockReply::Transport => Err(SandboxError::transport("connection reset")),
            MockReply::Unreachable => {
                self.expire();
                Err(SandboxError::unreachable(&self.id, "sandbox expired"))
            }
        }
    }

    async fn write_file(&self, path: &str, contents: &[u8]) -> Result<(), SandboxError> {
        self.ensure_alive()?;
        self.record(format!("write {path}"));
        self.files
            .lock()
            .unwrap()
            .insert(path.to_string(), contents.to_vec());
        Ok(())
    }

    async fn read_file(&self, path: &str) -> Result<Vec<u8>, SandboxError> {
        self.ensure_alive()?;
        self.file(path)
            .ok_or_else(|| SandboxError::operation_failed(format!("no such file: {path}")))
    }

    async fn list_dir(&self, path: &str) -> Result<Vec<String>, SandboxError> {
        self.ensure_alive()?;
        let prefix = format!("{}/", path.trim_end_matches('/'));
        let mut names: Vec<String> = self
            .files
            .lock()
            .unwrap()
            .keys()
            .filter_map(|k| k.strip_prefix(&prefix))
            .filter_map(|rest| rest.split('/').next())
            .map(str::to_string)
            .collect();
        names.dedup();
        Ok(names)
    }
}

type Setup = Box<dyn Fn(&MockSandbox) + Send + Sync>;

/// Hands out [`MockSandbox`]es named `sbx-1`, `sbx-2`, ...
pub(crate) struct MockProvider {
    created: Mutex<Vec<Arc<MockSandbox>>>,
    create_delay: Duration,
    failures: AtomicUsize,
    setup: Option<Setup>,
}

impl MockProvider {
    pub fn new() -> Self {
        Self {
            created: Mutex::new(Vec::new()),
            create_delay: Duration::ZERO,
            failures: AtomicUsize::new(0),
            setup: None,
        }
    }

    /// Makes each `create` take `delay`, to widen race windows.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.create_delay = delay;
        self
    }

    /// Scripts every new sandbox before it is handed out.
    pub fn with_setup(mut self, setup: impl Fn(&MockSandbox) + Send + Sync + 'static) -> Self {
        self.setup = Some(Box::new(setup));
        self
    }

    /// Makes the next `n` creations fail.
    pub fn fail_next(&self, n: usize) {
        self.failures.store(n, Ordering::SeqCst);
    }

    pub fn created(&self) -> Vec<Arc<MockSandbox>> {
        self.created.lock().unwrap().clone()
    }

    pub fn created_count(&self) -> usize {
        self.created.lock().unwrap().len()
    }
}

#[async_trait]
impl SandboxProvider for MockProvider {
    fn name(&self) -> &'static str {
        "mock"
    }

    async fn create(&self, _template: &str) -> Result<Arc<dyn Sandbox>, SandboxError> {
        if !self.create_delay.is_zero() {
            tokio::time::sleep(self.create_delay).await;
        }
        if self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(SandboxError::create_failed("mock provider refused"));
        }

        let mut created = self.created.lock().unwrap();
        let sandbox = Arc::new(MockSandbox::new(&format!("sbx-{}", created.len() + 1)));
        if let Some(setup) = &self.setup {
            setup(&sandbox);
        }
        created.push(Arc::clone(&sandbox));
        Ok(sandbox)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_rules_play_in_order_and_last_repeats() {
        let sandbox = MockSandbox::new("sbx-1");
        sandbox.on("rsync", MockReply::Transport);
        sandbox.on("rsync", MockReply::code(24));

        let opts = CommandOptions::default();
        assert!(sandbox.run_command("rsync -a", &opts).await.is_err());
        assert_eq!(sandbox.run_command("rsync -a", &opts).await.unwrap().exit_code, 24);
        assert_eq!(sandbox.run_command("rsync -a", &opts).await.unwrap().exit_code, 24);
        assert!(sandbox.run_command("ls", &opts).await.unwrap().success());
        assert_eq!(sandbox.count("rsync"), 3);
    }

    #[tokio::test]
    async fn test_killed_mock_is_unreachable() {
        let sandbox = MockSandbox::new("sbx-1");
        sandbox.kill().await.unwrap();
        let err = sandbox
            .run_command("true", &CommandOptions::default())
            .await
            .unwrap_err();
        assert!(err.is_unreachable());
        assert_eq!(sandbox.kill_count(), 1);
    }

    #[tokio::test]
    async fn test_provider_names_sandboxes_sequentially() {
        let provider = MockProvider::new();
        let a = provider.create("t").await.unwrap();
        let b = provider.create("t").await.unwrap();
        assert_eq!(a.id(), "sbx-1");
        assert_eq!(b.id(), "sbx-2");
        assert_eq!(provider.created_count(), 2);
    }

    #[tokio::test]
    async fn test_provider_failures() {
        let provider = MockProvider::new();
        provider.fail_next(1);
        assert!(provider.create("t").await.is_err());
        assert!(provider.create("t").await.is_ok());
    }
}
