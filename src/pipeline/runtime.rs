use futures::future::{BoxFuture, try_join_all};
use futures::stream::{FuturesUnordered, StreamExt};
use std::fmt;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::filter::Filter;
use crate::common::Frame;
use crate::error::{StageError, TransportError};
use crate::transport::{InputEndpoint, OutputEndpoint};

/// Lifecycle of one stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StageState {
    Created,
    SettingUp,
    Running,
    ShuttingDown,
    Stopped,
    Faulted,
}

impl fmt::Display for StageState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// What a stage did before it stopped.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StageReport {
    pub name: String,
    pub received: u64,
    pub sent: u64,
    pub dropped: u64,
}

/// How long a stopping stage keeps trying to deliver its last frame.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

type PendingReceive = BoxFuture<'static, (InputEndpoint, Result<Frame, TransportError>)>;

/// Asks `input` for exactly one frame. Nothing is read until the future is polled.
fn receive_from(mut input: InputEndpoint) -> PendingReceive {
    Box::pin(async move {
        let received = input.receive().await;
        (input, received)
    })
}

enum Outcome {
    /// Every input reached end of stream.
    Drained,
    Cancelled,
    Failed(StageError),
}

/// Drives one filter: receive, process, send, one frame at a time.
pub struct StageRuntime<F: Filter> {
    name: String,
    filter: F,
    inputs: Vec<InputEndpoint>,
    outputs: Vec<OutputEndpoint>,
    state: watch::Sender<StageState>,
    report: StageReport,
}

impl<F: Filter> StageRuntime<F> {
    pub fn new(
        name: impl Into<String>,
        filter: F,
        inputs: Vec<InputEndpoint>,
        outputs: Vec<OutputEndpoint>,
    ) -> Self {
        let name = name.into();
        let (state, _) = watch::channel(StageState::Created);
        Self {
            report: StageReport {
                name: name.clone(),
                ..StageReport::default()
            },
            name,
            filter,
            inputs,
            outputs,
            state,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> &'static str {
        self.filter.kind()
    }

    pub fn state(&self) -> watch::Receiver<StageState> {
        self.state.subscribe()
    }

    fn transition(&self, next: StageState) {
        let previous = self.state.send_replace(next);
        debug!("{} -> {}", previous, next);
    }

    /// Runs until every input ends, `cancel` fires or the stage faults.
    pub async fn run(mut self, cancel: CancellationToken) -> Result<StageReport, StageError> {
        self.transition(StageState::SettingUp);
        if let Err(source) = self.filter.setup().await {
            error!("Setup failed: {}", source);
            self.transition(StageState::Faulted);
            return Err(StageError::Setup {
                stage: self.name,
                source,
            });
        }

        self.transition(StageState::Running);
        info!(
            "Running with {} input(s) and {} output(s)",
            self.inputs.len(),
            self.outputs.len()
        );
        let outcome = self.frame_loop(&cancel).await;

        match outcome {
            Outcome::Drained | Outcome::Cancelled => {
                self.transition(StageState::ShuttingDown);
                self.filter.teardown().await;
                for output in &mut self.outputs {
                    output.close().await;
                }
                self.transition(StageState::Stopped);
                info!(
                    "Stopped after {} frame(s) in, {} out, {} dropped",
                    self.report.received, self.report.sent, self.report.dropped
                );
                Ok(self.report)
            }
            Outcome::Failed(e) => {
                error!("{}", e);
                self.filter.teardown().await;
                self.transition(StageState::Faulted);
                Err(e)
            }
        }
    }

    async fn frame_loop(&mut self, cancel: &CancellationToken) -> Outcome {
        let mut pending: FuturesUnordered<PendingReceive> =
            self.inputs.drain(..).map(receive_from).collect();
        if pending.is_empty() {
            cancel.cancelled().await;
            return Outcome::Cancelled;
        }
        loop {
            // a frame is only taken off an input while nothing else is in flight
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Outcome::Cancelled,
                next = pending.next() => next,
            };
            let Some((input, received)) = next else {
                return Outcome::Drained;
            };
            let frame = match received {
                Ok(frame) => frame,
                Err(e) if e.is_end_of_stream() => {
                    debug!("Input {} finished", input.address());
                    if pending.is_empty() {
                        info!("All inputs finished");
                        return Outcome::Drained;
                    }
                    continue;
                }
                Err(source) => {
                    return Outcome::Failed(StageError::Transport {
                        stage: self.name.clone(),
                        source,
                    });
                }
            };
            self.report.received += 1;

            // the hook always finishes, even when a stop is pending
            let started = Instant::now();
            let processed = self.filter.process(frame).await;
            let frame = match processed {
                Ok(frame) => Some(frame),
                Err(source) if source.is_fatal() => {
                    return Outcome::Failed(StageError::Fatal {
                        stage: self.name.clone(),
                        source,
                    });
                }
                Err(e) => {
                    self.report.dropped += 1;
                    warn!("Dropping frame: {}", e);
                    None
                }
            };
            debug!("Processed frame in {:?}", started.elapsed());

            if let Some(frame) = frame {
                if let Err(source) = self.forward(frame, cancel).await {
                    return Outcome::Failed(StageError::Transport {
                        stage: self.name.clone(),
                        source,
                    });
                }
            }
            pending.push(receive_from(input));
        }
    }

    /// Sends `frame` to every output. A stop request gives the send
    /// [`DRAIN_TIMEOUT`] to finish before the frame counts as dropped.
    async fn forward(&mut self, frame: Frame, cancel: &CancellationToken) -> Result<(), TransportError> {
        if self.outputs.is_empty() {
            return Ok(());
        }
        let sends = try_join_all(
            self.outputs
                .iter_mut()
                .map(|output| output.send(frame.clone())),
        );
        tokio::pin!(sends);
        let sent = tokio::select! {
            biased;
            sent = &mut sends => Some(sent),
            _ = cancel.cancelled() => {
                debug!("Stop requested, finishing the frame in flight");
                tokio::time::timeout(DRAIN_TIMEOUT, &mut sends).await.ok()
            }
        };
        match sent {
            Some(Ok(_)) => {
                self.report.sent += 1;
                Ok(())
            }
            Some(Err(e)) => Err(e),
            None => {
                warn!("No consumer took the last frame within {:?}", DRAIN_TIMEOUT);
                self.report.dropped += 1;
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::FilterError;
    use crate::transport::{TransportConfig, TransportContext};
    use async_trait::async_trait;
    use image::{Rgb, RgbImage};
    use std::sync::Arc;
    use tokio::sync::Notify;

    /// Drops frames whose red channel is odd and dies on 255.
    struct Picky;

    #[async_trait]
    impl Filter for Picky {
        async fn process(&mut self, frame: Frame) -> Result<Frame, FilterError> {
            match frame.image().get_pixel(0, 0)[0] {
                255 => Err(FilterError::Fatal("poisoned frame".to_string())),
                red if red % 2 == 1 => Err(FilterError::Frame(format!("odd value {red}"))),
                _ => Ok(frame),
            }
        }

        fn kind(&self) -> &'static str {
            "picky"
        }
    }

    fn frame(red: u8) -> Frame {
        Frame::from_image(RgbImage::from_pixel(1, 1, Rgb([red, 0, 0])))
    }

    async fn endpoints(
        context: &TransportContext,
        input: &str,
        output: &str,
    ) -> (OutputEndpoint, InputEndpoint, OutputEndpoint, InputEndpoint) {
        let upstream = OutputEndpoint::open(input.parse().unwrap(), context)
            .await
            .unwrap();
        let stage_in = InputEndpoint::open(input.parse().unwrap(), context)
            .await
            .unwrap();
        let stage_out = OutputEndpoint::open(output.parse().unwrap(), context)
            .await
            .unwrap();
        let downstream = InputEndpoint::open(output.parse().unwrap(), context)
            .await
            .unwrap();
        (upstream, stage_in, stage_out, downstream)
    }

    #[tokio::test]
    async fn per_frame_errors_drop_only_that_frame() {
        let context = TransportContext::default();
        let (mut upstream, stage_in, stage_out, mut downstream) =
            endpoints(&context, "mem://in", "mem://out").await;
        let runtime = StageRuntime::new("picky", Picky, vec![stage_in], vec![stage_out]);
        let mut state = runtime.state();
        let task = tokio::spawn(runtime.run(CancellationToken::new()));

        for red in [2, 3, 4] {
            upstream.send(frame(red)).await.unwrap();
        }
        upstream.close().await;

        assert_eq!(downstream.receive().await.unwrap().image().get_pixel(0, 0)[0], 2);
        assert_eq!(downstream.receive().await.unwrap().image().get_pixel(0, 0)[0], 4);
        assert!(downstream.receive().await.unwrap_err().is_end_of_stream());

        let report = task.await.unwrap().unwrap();
        assert_eq!((report.received, report.sent, report.dropped), (3, 2, 1));
        assert_eq!(*state.borrow_and_update(), StageState::Stopped);
    }

    #[tokio::test]
    async fn fatal_error_faults_the_stage() {
        let context = TransportContext::default();
        let (mut upstream, stage_in, stage_out, _downstream) =
            endpoints(&context, "mem://in", "mem://out").await;
        let runtime = StageRuntime::new("picky", Picky, vec![stage_in], vec![stage_out]);
        let state = runtime.state();

        upstream.send(frame(255)).await.unwrap();
        let result = runtime.run(CancellationToken::new()).await;
        assert!(matches!(result, Err(StageError::Fatal { .. })));
        assert_eq!(*state.borrow(), StageState::Faulted);
    }

    #[tokio::test]
    async fn upstream_disconnect_faults_without_spinning() {
        let context = TransportContext::default();
        let (upstream, stage_in, stage_out, _downstream) =
            endpoints(&context, "mem://in", "mem://out").await;
        let runtime = StageRuntime::new("picky", Picky, vec![stage_in], vec![stage_out]);
        let state = runtime.state();

        drop(upstream);
        let result = tokio::time::timeout(
            Duration::from_secs(5),
            runtime.run(CancellationToken::new()),
        )
        .await
        .unwrap();
        assert!(matches!(result, Err(StageError::Transport { .. })));
        assert_eq!(*state.borrow(), StageState::Faulted);
    }

    #[tokio::test]
    async fn cancellation_stops_cleanly_and_ends_downstream() {
        let context = TransportContext::default();
        let (_upstream, stage_in, stage_out, mut downstream) =
            endpoints(&context, "mem://in", "mem://out").await;
        let runtime = StageRuntime::new("picky", Picky, vec![stage_in], vec![stage_out]);
        let state = runtime.state();
        let cancel = CancellationToken::new();
        let task = tokio::spawn(runtime.run(cancel.clone()));

        cancel.cancel();
        let report = task.await.unwrap().unwrap();
        assert_eq!(report.received, 0);
        assert_eq!(*state.borrow(), StageState::Stopped);
        assert!(downstream.receive().await.unwrap_err().is_end_of_stream());
    }

    /// Signals when a frame reaches `process`, then waits to be released.
    struct Gated {
        entered: Arc<Notify>,
        release: Arc<Notify>,
    }

    #[async_trait]
    impl Filter for Gated {
        async fn process(&mut self, frame: Frame) -> Result<Frame, FilterError> {
            self.entered.notify_one();
            self.release.notified().await;
            Ok(frame)
        }

        fn kind(&self) -> &'static str {
            "gated"
        }
    }

    #[tokio::test]
    async fn next_frame_waits_for_the_current_one_and_stop_drains_it() {
        let context = TransportContext::new(TransportConfig {
            queue_depth: 1,
            ..TransportConfig::default()
        });
        let (mut upstream, stage_in, stage_out, mut downstream) =
            endpoints(&context, "mem://in", "mem://out").await;
        let entered = Arc::new(Notify::new());
        let release = Arc::new(Notify::new());
        let filter = Gated {
            entered: entered.clone(),
            release: release.clone(),
        };
        let runtime = StageRuntime::new("gated", filter, vec![stage_in], vec![stage_out]);
        let cancel = CancellationToken::new();
        let task = tokio::spawn(runtime.run(cancel.clone()));

        upstream.send(frame(1)).await.unwrap();
        entered.notified().await;

        // only the endpoint queue itself can hold frames while frame 1 is in process
        let mut accepted = 0;
        for red in [2, 3, 4] {
            let send = tokio::time::timeout(Duration::from_millis(100), upstream.send(frame(red)));
            if send.await.is_ok() {
                accepted += 1;
            }
        }
        assert_eq!(accepted, 1);

        cancel.cancel();
        release.notify_one();
        assert_eq!(downstream.receive().await.unwrap().image().get_pixel(0, 0)[0], 1);
        assert!(downstream.receive().await.unwrap_err().is_end_of_stream());

        let report = task.await.unwrap().unwrap();
        assert_eq!((report.received, report.sent, report.dropped), (1, 1, 0));
    }

    struct FailingSetup;

    #[async_trait]
    impl Filter for FailingSetup {
        async fn setup(&mut self) -> Result<(), crate::error::SetupError> {
            Err(crate::error::SetupError::Capability("no model".to_string()))
        }

        async fn process(&mut self, frame: Frame) -> Result<Frame, FilterError> {
            Ok(frame)
        }

        fn kind(&self) -> &'static str {
            "failing"
        }
    }

    #[tokio::test]
    async fn setup_failure_is_reported() {
        let runtime = StageRuntime::new("broken", FailingSetup, Vec::new(), Vec::new());
        let state = runtime.state();
        let result = runtime.run(CancellationToken::new()).await;
        assert!(matches!(result, Err(StageError::Setup { stage, .. }) if stage == "broken"));
        assert_eq!(*state.borrow(), StageState::Faulted);
    }
}
