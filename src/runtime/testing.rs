//! In-memory VM collaborators for tests.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet, VecDeque};
use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

use agentvm_protocol::{decode_line, encode_line, ports, GuestMessage, HostMessage};

use crate::config::RuntimeConfig;
use crate::error::{Error, Result};
use crate::runtime::machine::{SupersedeSignal, VmProfile, VmRuntimeStateMachine};
use crate::util::mib_to_bytes;
use crate::vm::{
    BalloonDevice, GuestStream, GuestTransport, PageReclaimer, ReclaimHint, VcpuControl,
    VmBackends, VmId,
};

/// Runtime settings with short timeouts.
pub(crate) fn fast_runtime() -> RuntimeConfig {
    RuntimeConfig {
        balloon_convergence_timeout: Duration::from_millis(200),
        balloon_poll_interval: Duration::from_millis(5),
        quiescence_timeout: Duration::from_millis(200),
        delivery_retry_budget: Duration::from_millis(300),
        delivery_retry_interval: Duration::from_millis(20),
        delivery_attempt_timeout: Duration::from_millis(100),
        pending_ttl: Duration::ZERO,
        sweep_interval: Duration::from_secs(1),
    }
}

/// 256 MiB guest with a 2 MiB balloon baseline.
pub(crate) fn test_profile() -> VmProfile {
    VmProfile {
        mem_size_mib: 256,
        balloon_baseline_mib: Some(2),
        quiescence_port: ports::QUIESCENCE,
    }
}

pub(crate) fn machine_for(vm: &FakeVm, runtime: &RuntimeConfig) -> VmRuntimeStateMachine {
    VmRuntimeStateMachine::new(
        VmId::new("vm1"),
        &test_profile(),
        vm.baseline,
        vm.backends(),
        runtime,
        Arc::new(SupersedeSignal::default()),
    )
}

/// How the fake balloon reacts to a new target.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Convergence {
    /// Reaches every target at once.
    Immediate,
    /// Gets stuck at the given size.
    Stall(u32),
    /// Deflates at once; inflation waits for [`FakeVm::release_balloon`].
    Manual,
}

/// How the fake guest agent answers quiescence requests.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum QuiesceMode {
    Ack,
    Refuse(String),
    Silent,
    Absent,
}

struct Inner {
    calls: Vec<String>,
    failures: HashMap<String, u32>,
    target: u32,
    actual: u32,
    convergence: Convergence,
    quiesce: QuiesceMode,
    closed_ports: HashSet<u32>,
    delivered: HashMap<u32, Vec<String>>,
    hints: Vec<ReclaimHint>,
    paused: bool,
}

impl Inner {
    fn take_failure(&mut self, op: &str) -> bool {
        match self.failures.get_mut(op) {
            Some(n) if *n > 0 => {
                *n -= 1;
                true
            }
            _ => false,
        }
    }
}

fn injected(op: &str) -> Error {
    Error::Api {
        method: "PATCH".into(),
        path: op.into(),
        status: 400,
        body: "injected failure".into(),
    }
}

/// A fake VM implementing every collaborator interface.
///
/// Only successful side effects are recorded in the call log.
#[derive(Clone)]
pub(crate) struct FakeVm {
    inner: Arc<Mutex<Inner>>,
    baseline: u32,
}

impl FakeVm {
    pub fn new(baseline: u32) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner {
                calls: Vec::new(),
                failures: HashMap::new(),
                target: baseline,
                actual: baseline,
                convergence: Convergence::Immediate,
                quiesce: QuiesceMode::Ack,
                closed_ports: HashSet::new(),
                delivered: HashMap::new(),
                hints: Vec::new(),
                paused: false,
            })),
            baseline,
        }
    }

    pub fn backends(&self) -> VmBackends {
        VmBackends {
            vcpu: Arc::new(self.clone()),
            balloon: Arc::new(self.clone()),
            reclaimer: Arc::new(self.clone()),
            transport: Arc::new(self.clone()),
        }
    }

    pub fn calls(&self) -> Vec<String> {
        self.inner.lock().calls.clone()
    }

    pub fn clear_calls(&self) {
        self.inner.lock().calls.clear();
    }

    pub fn fail_next(&self, op: &str) {
        self.fail_times(op, 1);
    }

    pub fn fail_times(&self, op: &str, n: u32) {
        *self.inner.lock().failures.entry(op.to_string()).or_default() += n;
    }

    pub fn set_convergence(&self, convergence: Convergence) {
        self.inner.lock().convergence = convergence;
    }

    pub fn set_quiesce_mode(&self, mode: QuiesceMode) {
        self.inner.lock().quiesce = mode;
    }

    pub fn close_port(&self, port: u32) {
        self.inner.lock().closed_ports.insert(port);
    }

    /// Let a held inflation reach its target.
    pub fn release_balloon(&self) {
        let mut inner = self.inner.lock();
        inner.actual = inner.target;
    }

    pub fn balloon_target(&self) -> u32 {
        self.inner.lock().target
    }

    pub fn paused(&self) -> bool {
        self.inner.lock().paused
    }

    pub fn reclaim_hints(&self) -> Vec<ReclaimHint> {
        self.inner.lock().hints.clone()
    }

    /// Lines written to a delivery port, without newlines.
    pub fn delivered(&self, port: u32) -> Vec<String> {
        self.inner
            .lock()
            .delivered
            .get(&port)
            .cloned()
            .unwrap_or_default()
    }
}

#[async_trait]
impl VcpuControl for FakeVm {
    async fn pause(&self) -> Result<()> {
        let mut inner = self.inner.lock();
        if inner.take_failure("vcpu.pause") {
            return Err(injected("/vm"));
        }
        inner.paused = true;
        inner.calls.push("vcpu.pause".into());
        Ok(())
    }

    async fn resume(&self) -> Result<()> {
        let mut inner = self.inner.lock();
        if inner.take_failure("vcpu.resume") {
            return Err(injected("/vm"));
        }
        inner.paused = false;
        inner.calls.push("vcpu.resume".into());
        Ok(())
    }
}

#[async_trait]
impl BalloonDevice for FakeVm {
    async fn target_mib(&self) -> Result<u32> {
        Ok(self.inner.lock().target)
    }

    async fn set_target_mib(&self, mib: u32) -> Result<()> {
        let mut inner = self.inner.lock();
        if inner.take_failure("balloon.set") {
            return Err(injected("/balloon"));
        }
        let actual = match inner.convergence {
            Convergence::Immediate => mib,
            Convergence::Stall(cap) => cap,
            Convergence::Manual if mib <= inner.actual => mib,
            Convergence::Manual => inner.actual,
        };
        inner.target = mib;
        inner.actual = actual;
        inner.calls.push(format!("balloon.set:{}", mib));
        Ok(())
    }

    async fn actual_mib(&self) -> Result<u32> {
        Ok(self.inner.lock().actual)
    }
}

#[async_trait]
impl PageReclaimer for FakeVm {
    async fn reclaim(&self, hint: ReclaimHint) -> Result<u64> {
        let mut inner = self.inner.lock();
        if inner.take_failure("reclaim") {
            return Err(Error::Unsupported("injected failure".into()));
        }
        inner.hints.push(hint);
        inner.calls.push(format!("reclaim:{}", hint.freed_mib));
        Ok(mib_to_bytes(hint.freed_mib))
    }
}

#[async_trait]
impl GuestTransport for FakeVm {
    async fn connect(&self, port: u32) -> Result<GuestStream> {
        let mut inner = self.inner.lock();
        let refused = if port == ports::QUIESCENCE {
            inner.quiesce == QuiesceMode::Absent
        } else {
            inner.take_failure("connect") || inner.closed_ports.contains(&port)
        };
        if refused {
            return Err(Error::protocol(format!("no guest listener on vsock port {}", port)));
        }
        Ok(Box::new(FakeStream {
            port,
            vm: self.clone(),
            written: Vec::new(),
            reply: VecDeque::new(),
        }))
    }
}

/// Guest side of a fake connection. Handles each line as it is written.
struct FakeStream {
    port: u32,
    vm: FakeVm,
    written: Vec<u8>,
    reply: VecDeque<u8>,
}

impl FakeStream {
    fn on_line(&mut self, line: &[u8]) {
        let mut inner = self.vm.inner.lock();
        if self.port != ports::QUIESCENCE {
            inner.calls.push(format!("deliver:{}", self.port));
            inner
                .delivered
                .entry(self.port)
                .or_default()
                .push(String::from_utf8_lossy(line).into_owned());
            return;
        }

        match decode_line::<HostMessage>(line) {
            Ok(HostMessage::Quiesce) => {
                inner.calls.push("quiesce".into());
                let answer = match &inner.quiesce {
                    QuiesceMode::Ack => Some(GuestMessage::Quiesced),
                    QuiesceMode::Refuse(message) => Some(GuestMessage::Error {
                        message: message.clone(),
                    }),
                    QuiesceMode::Silent | QuiesceMode::Absent => None,
                };
                if let Some(frame) = answer.and_then(|m| encode_line(&m).ok()) {
                    self.reply.extend(frame);
                }
            }
            Ok(HostMessage::Resume) => inner.calls.push("notice:resume".into()),
            _ => {}
        }
    }
}

impl AsyncWrite for FakeStream {
    fn poll_write(
        self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        this.written.extend_from_slice(buf);
        while let Some(pos) = this.written.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = this.written.drain(..=pos).collect();
            this.on_line(&line[..line.len() - 1]);
        }
        Poll::Ready(Ok(buf.len()))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }
}

impl AsyncRead for FakeStream {
    fn poll_read(
        self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if this.reply.is_empty() {
            // A silent agent never answers; the caller's timeout ends the read.
            if this.port == ports::QUIESCENCE && this.vm.inner.lock().quiesce == QuiesceMode::Silent {
                return Poll::Pending;
            }
            return Poll::Ready(Ok(()));
        }
        let n = buf.remaining().min(this.reply.len());
        let chunk: Vec<u8> = this.reply.drain(..n).collect();
        buf.put_slice(&chunk);
        Poll::Ready(Ok(()))
    }
}
