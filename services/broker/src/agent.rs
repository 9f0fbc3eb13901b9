//! The agent runner's own state machine: match -> debounce -> cooldown ->
//! single-instance launch (spec §4.6). One `AgentRunner` per configured
//! agent; the buffer timer is the runner's only internal suspension point,
//! the launched process is supervised on its own task.

use std::process::Stdio;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use cb_eval::{EvalContext, Predicate};
use cb_protocol::Event;
use std::sync::Arc;
use tokio::io::AsyncReadExt;
use tokio::process::Command;
use tokio::task::JoinHandle;
use tracing::{info, warn};

/// Captured output is logged, never returned to any client; bound it so a
/// runaway agent can't blow up the daemon's memory or logs.
const CAPTURE_LIMIT_BYTES: usize = 16 * 1024;

/// Short re-check delay when a launch is requested while one is already
/// running (spec §4.6 step 3: "re-arm the timer for a short retry (~5 s)").
const RUNNING_RETRY_DELAY: Duration = Duration::from_secs(5);

pub struct AgentConfig {
    pub name: String,
    pub predicate: Predicate,
    pub command: Vec<String>,
    pub workdir: Option<String>,
    pub buffer: Duration,
    pub timeout: Duration,
    pub cooldown: Duration,
}

struct RunnerState {
    pending: u64,
    timer: Option<JoinHandle<()>>,
    running: bool,
    last_finish: Option<Instant>,
}

pub struct AgentRunner {
    cfg: AgentConfig,
    state: Mutex<RunnerState>,
}

impl AgentRunner {
    pub fn new(cfg: AgentConfig) -> Arc<Self> {
        Arc::new(AgentRunner {
            cfg,
            state: Mutex::new(RunnerState { pending: 0, timer: None, running: false, last_finish: None }),
        })
    }

    pub fn name(&self) -> &str {
        &self.cfg.name
    }

    /// Whether the 60s tick source needs to run for this agent's sake.
    pub fn needs_tick(&self) -> bool {
        self.cfg.predicate.needs_tick()
    }

    /// Offer an event to this runner: pre-filter, predicate, then debounce.
    pub fn offer(self: &Arc<Self>, event: &Event) {
        if !eligible(event) {
            return;
        }
        let ctx = EvalContext::from_event(event);
        if !self.cfg.predicate.matches(&ctx) {
            return;
        }
        let mut state = self.state.lock().unwrap();
        state.pending += 1;
        if state.timer.is_none() {
            self.arm(&mut state, self.cfg.buffer);
        }
    }

    fn arm(self: &Arc<Self>, state: &mut RunnerState, delay: Duration) {
        let this = Arc::clone(self);
        state.timer = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            this.flush().await;
        }));
    }

    async fn flush(self: &Arc<Self>) {
        let pending;
        {
            let mut state = self.state.lock().unwrap();
            state.timer = None;
            pending = state.pending;
            if pending == 0 {
                return;
            }
            if let Some(last_finish) = state.last_finish {
                let elapsed = last_finish.elapsed();
                if elapsed < self.cfg.cooldown {
                    self.arm(&mut state, self.cfg.cooldown - elapsed);
                    return;
                }
            }
            if state.running {
                self.arm(&mut state, RUNNING_RETRY_DELAY);
                return;
            }
            state.pending = 0;
            state.running = true;
        }

        self.launch().await;

        let mut state = self.state.lock().unwrap();
        state.running = false;
        state.last_finish = Some(Instant::now());
        if state.pending > 0 {
            self.arm(&mut state, self.cfg.buffer);
        }
    }

    async fn launch(&self) {
        let Some((bin, args)) = self.cfg.command.split_first() else {
            warn!(agent = %self.cfg.name, "empty command, skipping launch");
            return;
        };
        let mut cmd = Command::new(bin);
        cmd.args(args).stdin(Stdio::null()).stdout(Stdio::piped()).stderr(Stdio::piped()).kill_on_drop(true);
        if let Some(dir) = &self.cfg.workdir {
            cmd.current_dir(dir);
        }

        info!(agent = %self.cfg.name, command = ?self.cfg.command, "launching agent");
        let child = match cmd.spawn() {
            Ok(c) => c,
            Err(e) => {
                warn!(agent = %self.cfg.name, error = %e, "failed to spawn agent process");
                return;
            }
        };

        match tokio::time::timeout(self.cfg.timeout, run_to_completion(child)).await {
            Ok(Ok((status, stdout, stderr))) => {
                if status.success() {
                    info!(agent = %self.cfg.name, %status, "agent process completed");
                } else {
                    warn!(agent = %self.cfg.name, %status, stdout = %stdout, stderr = %stderr, "agent process exited non-zero");
                }
            }
            Ok(Err(e)) => warn!(agent = %self.cfg.name, error = %e, "agent process failed"),
            Err(_) => warn!(agent = %self.cfg.name, timeout_secs = self.cfg.timeout.as_secs(), "agent process timed out"),
        }
    }
}

async fn run_to_completion(
    mut child: tokio::process::Child,
) -> std::io::Result<(std::process::ExitStatus, String, String)> {
    // Sequential bounded reads keep this simple; agents are not expected to
    // produce output anywhere near the capture limit in normal operation.
    let mut stdout = String::new();
    if let Some(mut out) = child.stdout.take() {
        let mut buf = vec![0u8; CAPTURE_LIMIT_BYTES];
        if let Ok(n) = out.read(&mut buf).await {
            stdout = String::from_utf8_lossy(&buf[..n]).to_string();
        }
    }
    let mut stderr = String::new();
    if let Some(mut err) = child.stderr.take() {
        let mut buf = vec![0u8; CAPTURE_LIMIT_BYTES];
        if let Ok(n) = err.read(&mut buf).await {
            stderr = String::from_utf8_lossy(&buf[..n]).to_string();
        }
    }
    let status = child.wait().await?;
    Ok((status, stdout, stderr))
}

fn eligible(e: &Event) -> bool {
    if e.kind == "tick" {
        return true;
    }
    e.kind == "message" && e.direction == "in" && !e.is_self
}

#[cfg(test)]
mod tests {
    use super::*;
    use cb_eval::compile;

    fn message_event(direct: bool) -> Event {
        let mut e = Event::new("slack", "ops-bot", "message");
        e.direction = "in".to_string();
        e.direct = direct;
        e.notify = direct;
        e
    }

    fn runner(when: &str, buffer_ms: u64, cooldown_ms: u64) -> Arc<AgentRunner> {
        AgentRunner::new(AgentConfig {
            name: "triage".to_string(),
            predicate: compile(when).unwrap(),
            command: vec!["true".to_string()],
            workdir: None,
            buffer: Duration::from_millis(buffer_ms),
            timeout: Duration::from_secs(5),
            cooldown: Duration::from_millis(cooldown_ms),
        })
    }

    #[test]
    fn eligible_excludes_self_sent_and_non_message() {
        let mut e = message_event(true);
        e.is_self = true;
        assert!(!eligible(&e));
        assert!(eligible(&message_event(true)));
        let tick = Event::new("", "", "tick");
        assert!(eligible(&tick));
    }

    #[tokio::test(start_paused = true)]
    async fn non_matching_event_never_arms_timer() {
        let r = runner("direct", 50, 1000);
        r.offer(&message_event(false));
        tokio::time::advance(Duration::from_millis(200)).await;
        let state = r.state.lock().unwrap();
        assert_eq!(state.pending, 0);
        assert!(state.timer.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn matching_event_launches_exactly_once_within_buffer() {
        let r = runner("direct", 50, 60_000);
        r.offer(&message_event(true));
        tokio::time::advance(Duration::from_millis(100)).await;
        tokio::task::yield_now().await;
        let state = r.state.lock().unwrap();
        assert!(state.last_finish.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn second_match_within_cooldown_does_not_relaunch_immediately() {
        let r = runner("direct", 10, 60_000);
        r.offer(&message_event(true));
        tokio::time::advance(Duration::from_millis(50)).await;
        tokio::task::yield_now().await;
        {
            let state = r.state.lock().unwrap();
            assert!(state.last_finish.is_some());
        }
        r.offer(&message_event(true));
        tokio::time::advance(Duration::from_millis(50)).await;
        tokio::task::yield_now().await;
        let state = r.state.lock().unwrap();
        // still armed/waiting on cooldown, not running a second time yet
        assert!(state.timer.is_some() || state.pending == 0);
    }
}
